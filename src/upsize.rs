// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Relay buffer upsizing.
//!
//! Relay buffers are grown into the spare L1 of their core to hide
//! producer latency. A buffer only ever takes one of its valid sizes:
//! multiples of its granule that evenly divide the useful upper bound.
//! Every growth step reserves its bytes in the resource model first.

use crate::config::{RoutingConfig, UpsizeStrategy};
use crate::error::Result;
use crate::graph::{BufferId, BufferKind, Epoch};
use crate::grid::CoreLocation;
use crate::resource::ResourceModel;
use indexmap::IndexMap;
use std::fmt;

/// Group upsizing candidates by core.
///
/// Buffers on each core are ordered by utilization, the allocated
/// size relative to the granule, lowest first.
pub fn collect_relay_buffers(
    epoch: &Epoch, config: &RoutingConfig
) -> Result<IndexMap<CoreLocation, Vec<BufferId>>> {
    let mut cores = IndexMap::<CoreLocation, Vec<BufferId>>::new();
    for buffer in epoch.buffers.values() {
        if buffer.kind != BufferKind::Relay || !buffer.uses_l1() {
            continue
        }
        if config.ethernet_only && !epoch.device.is_ethernet_core(&buffer.location) {
            continue
        }
        buffer.validate()?;
        cores.entry(buffer.location).or_default().push(buffer.id);
    }
    for ids in cores.values_mut() {
        // a/ga < b/gb  <=>  a*gb < b*ga
        ids.sort_by(|a, b| {
            let (a, b) = (&epoch.buffers[a], &epoch.buffers[b]);
            let ua = a.allocated_tiles() as u128 * b.granule_tiles as u128;
            let ub = b.allocated_tiles() as u128 * a.granule_tiles as u128;
            ua.cmp(&ub)
        });
    }
    Ok(cores)
}

/// All sizes a buffer with this granule may take, ascending.
///
/// These are the divisors of the granule other than 1, followed by
/// every multiple `k * granule`, `k >= 2`, that evenly divides
/// `min(total_epoch_tiles, latency_hiding_tiles)`.
pub fn valid_buffer_sizes(granule: u64, total_epoch_tiles: u64,
                          latency_hiding_tiles: u64) -> Vec<u64> {
    let mut sizes = Vec::new();
    let mut i = 1;
    while i <= granule / i {
        if granule % i == 0 {
            sizes.push(i);
            sizes.push(granule / i);
        }
        i += 1;
    }
    sizes.retain(|&d| d > 1);
    sizes.sort_unstable();
    sizes.dedup();

    let bound = total_epoch_tiles.min(latency_hiding_tiles);
    if granule > 0 {
        let mut next = granule.checked_mul(2);
        while let Some(size) = next.filter(|&s| s <= bound) {
            if bound % size == 0 {
                sizes.push(size);
            }
            next = size.checked_add(granule);
        }
    }
    sizes
}

/// A buffer being grown on one core.
struct Candidate {
    id: BufferId,
    core: CoreLocation,
    sizes: Vec<u64>,
    tile_bytes: u64,
    granule: u64,
    allocated: u64,
}

impl Candidate {
    fn next_size(&self) -> Option<u64> {
        self.sizes.iter().copied().find(|&s| s > self.allocated)
    }

    fn allocated_bytes(&self) -> u64 {
        self.allocated.saturating_mul(self.tile_bytes)
    }
}

/// Tiles and bytes added to one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferUpsize {
    pub id: BufferId,
    pub core: CoreLocation,
    pub tiles_added: u64,
    pub bytes_added: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsizeReport {
    /// every candidate buffer, grown or not.
    pub buffers: Vec<BufferUpsize>,
    /// L1 bytes left on each candidate core afterwards.
    pub available: Vec<(CoreLocation, u64)>,
}

impl UpsizeReport {
    pub fn tiles_added(&self) -> u64 {
        self.buffers.iter().map(|b| b.tiles_added).sum()
    }

    pub fn bytes_added(&self) -> u64 {
        self.buffers.iter().map(|b| b.bytes_added).sum()
    }

    pub fn num_grown(&self) -> usize {
        self.buffers.iter().filter(|b| b.tiles_added > 0).count()
    }
}

impl fmt::Display for UpsizeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>16} {:>20} -> ({:>12}, {:>12})",
                 "buffer_id", "core", "added_tiles", "added_bytes")?;
        for b in &self.buffers {
            writeln!(f, "{:>16} {:>20} -> (+{:>11}, +{:>10}B)",
                     b.id, b.core.to_string(), b.tiles_added, b.bytes_added)?;
        }
        writeln!(f, "available L1 on relay buffer cores:")?;
        for (core, bytes) in &self.available {
            writeln!(f, "{:>20} -> {:>11}B", core.to_string(), bytes)?;
        }
        Ok(())
    }
}

struct CoreUpsizer<'a, M: ResourceModel> {
    epoch: &'a mut Epoch,
    model: &'a mut M,
}

impl<M: ResourceModel> CoreUpsizer<'_, M> {
    /// Grow to `target` tiles if the extra bytes can be reserved.
    fn try_grow(&mut self, c: &mut Candidate, target: u64) -> Result<bool> {
        if target <= c.allocated {
            return Ok(false)
        }
        let delta = (target - c.allocated).saturating_mul(c.tile_bytes);
        if let Err(e) = self.model.reserve_bytes(&c.core, delta) {
            clilog::trace!("buffer {}: {} -> {} tiles does not fit: {}",
                           c.id, c.allocated, target, e);
            return Ok(false)
        }
        self.epoch.buffer_mut(c.id)?.set_allocated_tiles(target);
        clilog::trace!("buffer {}: grown from {} to {} tiles", c.id, c.allocated, target);
        c.allocated = target;
        Ok(true)
    }

    /// Take the largest valid size that fits.
    fn single(&mut self, c: &mut Candidate) -> Result<()> {
        let sizes = c.sizes.clone();
        for &size in sizes.iter().rev() {
            if size <= c.allocated || self.try_grow(c, size)? {
                break
            }
        }
        Ok(())
    }

    /// Grow the smallest buffers one valid size at a time, never past
    /// the largest allocation on the core. When nobody can move under
    /// that cap it is raised to the smallest next size still pending.
    fn greedy(&mut self, cands: &mut [Candidate]) -> Result<()> {
        let mut cap = cands.iter().map(|c| c.allocated).max().unwrap_or(0);
        let mut exhausted = vec![false; cands.len()];
        loop {
            let mut order = (0..cands.len()).collect::<Vec<_>>();
            order.sort_by_key(|&i| cands[i].allocated);
            let mut changed = false;
            for i in order {
                if exhausted[i] {
                    continue
                }
                match cands[i].next_size() {
                    None => exhausted[i] = true,
                    Some(next) if next <= cap => {
                        if self.try_grow(&mut cands[i], next)? {
                            changed = true;
                        }
                        else {
                            // available L1 only shrinks
                            exhausted[i] = true;
                        }
                    }
                    Some(_) => {}
                }
            }
            if changed {
                continue
            }
            let next_cap = cands.iter().zip(&exhausted)
                .filter(|&(_, &ex)| !ex)
                .filter_map(|(c, _)| c.next_size())
                .min();
            match next_cap {
                Some(c) if c > cap => cap = c,
                _ => break,
            }
        }
        Ok(())
    }

    /// Give each buffer a byte target proportional to its granule and
    /// repeatedly grow the one furthest below target.
    fn proportional(&mut self, cands: &mut [Candidate]) -> Result<()> {
        let Some(first) = cands.first() else { return Ok(()) };
        let available = self.model.available_bytes(&first.core) as u128;
        let weights = cands.iter().map(|c| c.granule.max(4) as u128).collect::<Vec<_>>();
        let total_weight: u128 = weights.iter().sum();
        let targets = cands.iter().zip(&weights)
            .map(|(c, &w)| c.allocated_bytes().saturating_add((available * w / total_weight) as u64))
            .collect::<Vec<_>>();
        clilog::trace!("proportional targets on {}: {:?}", first.core, targets);

        let mut exhausted = vec![false; cands.len()];
        loop {
            let pick = (0..cands.len())
                .filter(|&i| !exhausted[i])
                .map(|i| (i, targets[i] as i128 - cands[i].allocated_bytes() as i128))
                .filter(|&(_, deficit)| deficit > 0)
                .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)));
            let Some((i, _)) = pick else { break };
            let c = &mut cands[i];
            let target_tiles = targets[i] / c.tile_bytes + 1;
            let in_range = c.sizes.iter().copied()
                .filter(|&s| s > c.allocated && s <= target_tiles)
                .rev().collect::<Vec<_>>();
            let mut grown = false;
            for size in in_range {
                if self.try_grow(c, size)? {
                    grown = true;
                    break
                }
            }
            if !grown {
                exhausted[i] = true;
            }
        }
        Ok(())
    }
}

/// Grow relay buffers into the spare L1 of their cores.
///
/// Running out of L1 is not an error; buffers keep the size they
/// reached.
pub fn upsize_relay_buffers<M: ResourceModel>(
    epoch: &mut Epoch, model: &mut M, config: &RoutingConfig
) -> Result<UpsizeReport> {
    let timer = clilog::stimer!("upsize relay buffers");
    let cores = collect_relay_buffers(epoch, config)?;
    let mut report = UpsizeReport::default();

    for (core, ids) in cores {
        let mut cands = Vec::with_capacity(ids.len());
        for id in ids {
            let b = epoch.buffer(id)?;
            let latency_tiles = config.latency_hiding_bytes() / b.tile_size_bytes;
            let sizes = valid_buffer_sizes(b.granule_tiles, b.total_epoch_tiles, latency_tiles);
            clilog::trace!("buffer {} granule {}: valid sizes {:?}", id, b.granule_tiles, sizes);
            cands.push(Candidate {
                id, core,
                sizes,
                tile_bytes: b.tile_size_bytes,
                granule: b.granule_tiles,
                allocated: b.allocated_tiles(),
            });
        }
        let initial = cands.iter().map(|c| c.allocated).collect::<Vec<_>>();
        clilog::debug!("upsizing {} relay buffers on core {}", cands.len(), core);

        let mut upsizer = CoreUpsizer { epoch: &mut *epoch, model: &mut *model };
        match (cands.len(), config.upsize_strategy) {
            (1, _) => upsizer.single(&mut cands[0])?,
            (_, UpsizeStrategy::Greedy) => upsizer.greedy(&mut cands)?,
            (_, UpsizeStrategy::Proportional) => upsizer.proportional(&mut cands)?,
        }

        for (c, init) in cands.iter().zip(initial) {
            let tiles_added = c.allocated - init;
            report.buffers.push(BufferUpsize {
                id: c.id, core,
                tiles_added,
                bytes_added: tiles_added * c.tile_bytes,
            });
        }
        report.available.push((core, model.available_bytes(&core)));
    }
    clilog::finish!(timer);
    clilog::debug!("upsize report:\n{}", report);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Buffer;
    use crate::grid::{DeviceGrid, GridCoord};
    use crate::resource::L1ResourceModel;

    fn epoch(l1: u64) -> Epoch {
        Epoch::new(0, DeviceGrid {
            grid_size_x: 4,
            grid_size_y: 4,
            ethernet_cores: vec![GridCoord::new(0, 1)],
            l1_size_bytes: l1,
            l1_reserved_bytes: 0,
        })
    }

    fn relay(id: u64, x: u32, tile: u64, granule: u64, total: u64, alloc: u64) -> Buffer {
        Buffer::new(BufferId(id), BufferKind::Relay, CoreLocation::new(0, x, 1),
                    tile, granule, total, alloc)
    }

    #[test]
    fn sizes_of_granule_four() {
        assert_eq!(valid_buffer_sizes(4, 64, 130), vec![2, 4, 8, 16, 32, 64]);
        assert_eq!(valid_buffer_sizes(6, 36, 1000), vec![2, 3, 6, 12, 18, 36]);
        assert_eq!(valid_buffer_sizes(1, 1, 1000), Vec::<u64>::new());
        assert_eq!(valid_buffer_sizes(3, 100, 4), vec![3]);
    }

    #[test]
    fn single_buffer_takes_largest_fit() {
        // 4 tiles of 1000B already placed, 10000B spare
        let mut e = epoch(14_000);
        e.add_buffer(relay(1, 1, 1000, 4, 64, 4)).unwrap();
        let mut model = L1ResourceModel::from_epoch(&e).unwrap();
        let report = upsize_relay_buffers(&mut e, &mut model, &RoutingConfig::default()).unwrap();
        assert_eq!(e.buffers[&BufferId(1)].allocated_tiles(), 8);
        assert_eq!(report.tiles_added(), 4);
        assert_eq!(report.available, vec![(CoreLocation::new(0, 1, 1), 6_000)]);
    }

    #[test]
    fn greedy_grows_evenly() {
        let mut e = epoch(64_000);
        e.add_buffer(relay(1, 1, 1000, 2, 64, 2)).unwrap();
        e.add_buffer(relay(2, 1, 1000, 2, 64, 2)).unwrap();
        e.add_buffer(relay(3, 1, 1000, 2, 64, 8)).unwrap();
        let mut model = L1ResourceModel::from_epoch(&e).unwrap();
        upsize_relay_buffers(&mut e, &mut model, &RoutingConfig::default()).unwrap();
        let sizes = (1..=3).map(|i| e.buffers[&BufferId(i)].allocated_tiles()).collect::<Vec<_>>();
        let total: u64 = sizes.iter().sum();
        assert!(total * 1000 <= 64_000);
        for s in &sizes {
            assert_eq!(64 % s, 0);
            assert_eq!(s % 2, 0);
        }
        // sizes never differ by more than one valid step
        let (min, max) = (*sizes.iter().min().unwrap(), *sizes.iter().max().unwrap());
        assert!(max <= 2 * min, "{:?}", sizes);
        assert!(min >= 8);
    }

    #[test]
    fn proportional_respects_capacity() {
        let mut e = epoch(40_000);
        e.add_buffer(relay(1, 2, 1000, 2, 64, 2)).unwrap();
        e.add_buffer(relay(2, 2, 1000, 8, 64, 8)).unwrap();
        let mut model = L1ResourceModel::from_epoch(&e).unwrap();
        let cfg = RoutingConfig { upsize_strategy: UpsizeStrategy::Proportional, ..Default::default() };
        let report = upsize_relay_buffers(&mut e, &mut model, &cfg).unwrap();
        let a = e.buffers[&BufferId(1)].allocated_tiles();
        let b = e.buffers[&BufferId(2)].allocated_tiles();
        assert!((a + b) * 1000 <= 40_000);
        assert_eq!(a % 2, 0);
        assert_eq!(b % 8, 0);
        assert!(b > 8);
        assert_eq!(report.num_grown(), 2);
    }

    #[test]
    fn ethernet_only_filter() {
        let mut e = epoch(100_000);
        e.add_buffer(relay(1, 0, 1000, 4, 64, 4)).unwrap();
        e.add_buffer(relay(2, 1, 1000, 4, 64, 4)).unwrap();
        let cfg = RoutingConfig { ethernet_only: true, ..Default::default() };
        let cores = collect_relay_buffers(&e, &cfg).unwrap();
        assert_eq!(cores.len(), 1);
        assert_eq!(cores[&CoreLocation::new(0, 0, 1)], vec![BufferId(1)]);
    }

    #[test]
    fn full_core_is_left_alone() {
        let mut e = epoch(8_000);
        e.add_buffer(relay(1, 1, 1000, 4, 64, 4)).unwrap();
        e.add_buffer(relay(2, 1, 1000, 4, 64, 4)).unwrap();
        let mut model = L1ResourceModel::from_epoch(&e).unwrap();
        let before = e.clone();
        let report = upsize_relay_buffers(&mut e, &mut model, &RoutingConfig::default()).unwrap();
        assert_eq!(e, before);
        assert_eq!(report.tiles_added(), 0);
    }
}
