// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Random generation of valid epochs.
//!
//! Ops form a chain placed in disjoint column bands, so no two op grids
//! ever share a core. Every op reads its first input from the previous
//! op (from a DRAM queue for the first op) and its second input from a
//! DRAM queue; the last op writes to DRAM. Transfers between ops mix
//! unicast, gather, scatter, relayed, and multicast pipes.

use crate::error::Result;
use crate::graph::{
    Buffer, BufferId, BufferKind, BufferOwner, Epoch, InputMulticast, OpPlacement, Pipe, PipeId,
    QueueInfo, QueueLocation,
};
use crate::grid::{CoreLocation, DeviceGrid, GridCoord, SYSTEM_MEMORY_COORD};
use rand::prelude::*;
use rand_chacha::ChaCha20Rng;

#[derive(Debug, Clone)]
pub struct SynthParams {
    pub seed: u64,
    pub grid_size_x: u32,
    pub grid_size_y: u32,
    pub num_ops: usize,
    pub num_chips: u32,
    /// put ethernet cores on row 0 and link chips over them.
    pub ethernet: bool,
    pub l1_size_bytes: u64,
    pub l1_reserved_bytes: u64,
}

impl Default for SynthParams {
    fn default() -> Self {
        SynthParams {
            seed: 8026727,
            grid_size_x: 12,
            grid_size_y: 10,
            num_ops: 4,
            num_chips: 1,
            ethernet: false,
            l1_size_bytes: 1464 * 1024,
            l1_reserved_bytes: 200 * 1024,
        }
    }
}

const TILE_SIZES: [u64; 2] = [1088, 2080];

struct Builder {
    rng: ChaCha20Rng,
    epoch: Epoch,
    next_buffer: u64,
    next_pipe: u64,
}

impl Builder {
    fn l1_buffer(&mut self, kind: BufferKind, loc: CoreLocation,
                 owner: Option<BufferOwner>) -> Result<BufferId> {
        let id = BufferId(self.next_buffer);
        self.next_buffer += 1;
        let tile = TILE_SIZES[self.rng.gen_range(0..TILE_SIZES.len())];
        let granule = [1, 2, 4][self.rng.gen_range(0..3)];
        let total = granule * [8, 16, 32][self.rng.gen_range(0..3)];
        let alloc = granule * self.rng.gen_range(1..=2);
        let mut buffer = Buffer::new(id, kind, loc, tile, granule, total, alloc);
        buffer.owner = owner;
        self.epoch.add_buffer(buffer)?;
        Ok(id)
    }

    fn queue(&mut self, loc: CoreLocation, location: QueueLocation, prolog: bool) -> Result<BufferId> {
        let id = BufferId(self.next_buffer);
        self.next_buffer += 1;
        let tiles = [16, 32, 64][self.rng.gen_range(0..3)];
        self.epoch.add_buffer(Buffer::new(id, BufferKind::Queue, loc, TILE_SIZES[0], 1, tiles, tiles)
                              .with_queue(QueueInfo {
                                  name: format!("q{}", id.0), location, prolog
                              }))?;
        Ok(id)
    }

    fn dram_bank(&mut self, chip: u32) -> CoreLocation {
        let d = &self.epoch.device;
        let (gx, gy) = (d.grid_size_x, d.grid_size_y);
        CoreLocation::new(chip, self.rng.gen_range(0..gx), self.rng.gen_range(0..gy))
    }

    fn pipe(&mut self, inputs: Vec<BufferId>, outputs: Vec<Vec<BufferId>>,
            locations: Vec<CoreLocation>) -> Result<()> {
        let id = PipeId(self.next_pipe);
        self.next_pipe += 1;
        self.epoch.add_pipe(Pipe::new_scatter(id, inputs, outputs).with_locations(locations))
    }

    fn unicast(&mut self, input: BufferId, output: BufferId, at: CoreLocation) -> Result<()> {
        self.pipe(vec![input], vec![vec![output]], vec![at])
    }
}

/// One op with its per-core buffers, cores listed row by row.
struct SynthOp {
    cores: Vec<CoreLocation>,
    outputs: Vec<BufferId>,
    /// input buffers per input index, parallel to `cores`.
    inputs: [Vec<BufferId>; 2],
}

fn op_cores(op: &OpPlacement) -> Vec<CoreLocation> {
    (op.grid_loc_y..=op.grid_end_y())
        .flat_map(|y| (op.grid_loc_x..=op.grid_end_x()).map(move |x| (x, y)))
        .map(|(x, y)| CoreLocation::new(op.chip, x, y))
        .collect()
}

/// Place the op chain. `adjacent[i]` asks for op `i - 1` to be a
/// single column right before op `i`, spanning the same rows.
fn place_ops(rng: &mut ChaCha20Rng, params: &SynthParams, adjacent: &[bool]) -> Vec<OpPlacement> {
    let n = adjacent.len();
    let band = params.grid_size_x / n as u32;
    let y_min = params.ethernet as u32;
    let max_h = (params.grid_size_y - y_min).min(4);
    let mut ops = Vec::<OpPlacement>::with_capacity(n);
    for i in 0..n {
        let band_start = i as u32 * band;
        let mut op = if adjacent[i] {
            let prev = &ops[i - 1];
            let w = rng.gen_range(band.min(2)..=band);
            OpPlacement::new(&format!("op{}", i), 0,
                             (band_start, prev.grid_loc_y), (w, prev.grid_size_y))
        }
        else {
            let w = rng.gen_range(1..=band);
            let h = rng.gen_range(1..=max_h);
            let x = band_start + rng.gen_range(0..=band - w);
            let y = y_min + rng.gen_range(0..=params.grid_size_y - y_min - h);
            OpPlacement::new(&format!("op{}", i), 0, (x, y), (w, h))
        };
        if adjacent.get(i + 1).copied().unwrap_or(false) {
            op.grid_loc_x = band_start + band - 1;
            op.grid_size_x = 1;
        }
        ops.push(op);
    }
    ops
}

/// Generate epoch `index` from `params`. The same parameters and index
/// always give the same epoch.
pub fn synth_epoch(params: &SynthParams, index: usize) -> Result<Epoch> {
    let mut rng = ChaCha20Rng::seed_from_u64(params.seed.wrapping_add(index as u64));
    let device = DeviceGrid {
        grid_size_x: params.grid_size_x,
        grid_size_y: params.grid_size_y,
        ethernet_cores: match params.ethernet {
            true => (0..params.grid_size_x).step_by(2).map(|x| GridCoord::new(x, 0)).collect(),
            false => vec![],
        },
        l1_size_bytes: params.l1_size_bytes,
        l1_reserved_bytes: params.l1_reserved_bytes,
    };
    let num_ops = params.num_ops.min(params.grid_size_x as usize);
    if num_ops == 0 || params.grid_size_y <= params.ethernet as u32 {
        return Ok(Epoch::new(index, device))
    }

    let mut adjacent = vec![false; num_ops];
    for i in 1..num_ops {
        adjacent[i] = !adjacent[i - 1] && rng.gen_bool(0.25);
    }
    let mut placements = place_ops(&mut rng, params, &adjacent);
    let mut modes = vec![InputMulticast::default(); num_ops];
    for i in 1..num_ops {
        modes[i] = match (adjacent[i], rng.gen_range(0..10)) {
            (true, _) => InputMulticast { row: true, ..Default::default() },
            (false, 0..=1) => InputMulticast { row: true, ..Default::default() },
            (false, 2..=3) => InputMulticast { col: true, ..Default::default() },
            _ => InputMulticast::default(),
        };
    }
    for (op, mode) in placements.iter_mut().zip(&modes) {
        op.inputs = vec![*mode, InputMulticast::default()];
        op.grid_transpose = rng.gen_bool(0.2);
    }
    if let Some(last) = placements.last_mut() {
        last.untilize_output = rng.gen_bool(0.3);
    }

    let mut b = Builder { rng, epoch: Epoch::new(index, device), next_buffer: 1, next_pipe: 1 };
    let mut ops = Vec::<SynthOp>::with_capacity(num_ops);
    for op in &placements {
        b.epoch.add_op(op.clone())?;
        let cores = op_cores(op);
        let mut s = SynthOp { cores: cores.clone(), outputs: vec![], inputs: [vec![], vec![]] };
        for &core in &cores {
            s.outputs.push(b.l1_buffer(BufferKind::OpOutput, core,
                                       Some(BufferOwner::Producer(op.name.clone())))?);
            for input_index in 0..2 {
                s.inputs[input_index].push(b.l1_buffer(BufferKind::OpInput, core, Some(
                    BufferOwner::Consumer { op: op.name.clone(), input_index }))?);
            }
        }
        ops.push(s);
    }

    for i in 0..num_ops {
        // second input: DRAM, possibly a prolog queue staged through L1
        for c in 0..ops[i].cores.len() {
            let core = ops[i].cores[c];
            let prolog = b.rng.gen_bool(0.3);
            let bank = b.dram_bank(0);
            let q = b.queue(bank, QueueLocation::Dram, prolog)?;
            if prolog && b.rng.gen_bool(0.5) {
                let inter = b.l1_buffer(BufferKind::PrologInter, core, None)?;
                b.unicast(q, inter, core)?;
                b.unicast(inter, ops[i].inputs[1][c], core)?;
            }
            else {
                b.unicast(q, ops[i].inputs[1][c], core)?;
            }
        }
        if i == 0 {
            for c in 0..ops[0].cores.len() {
                let bank = b.dram_bank(0);
                let q = b.queue(bank, QueueLocation::Dram, false)?;
                b.unicast(q, ops[0].inputs[0][c], ops[0].cores[c])?;
            }
            continue
        }
        connect(&mut b, &ops[i - 1], &ops[i], &placements[i], modes[i], adjacent[i])?;
    }

    let last = &ops[num_ops - 1];
    for (&core, &out) in last.cores.iter().zip(&last.outputs) {
        let bank = b.dram_bank(0);
        let q = b.queue(bank, QueueLocation::Dram, false)?;
        b.unicast(out, q, core)?;
    }
    if params.num_chips > 1 {
        let (core, out) = (last.cores[0], last.outputs[0]);
        if params.ethernet {
            let eth = b.epoch.device.ethernet_cores[0];
            let near = CoreLocation::new(0, eth.x, eth.y);
            let far = CoreLocation::new(1, eth.x, eth.y);
            let tx = b.l1_buffer(BufferKind::Relay, near, None)?;
            let rx = b.l1_buffer(BufferKind::Relay, far, None)?;
            b.unicast(out, tx, core)?;
            b.unicast(tx, rx, near)?;
            let bank = b.dram_bank(1);
            let q = b.queue(bank, QueueLocation::Dram, false)?;
            b.unicast(rx, q, far)?;
        }
        else {
            let host = CoreLocation::new(0, SYSTEM_MEMORY_COORD, SYSTEM_MEMORY_COORD);
            let q = b.queue(host, QueueLocation::Host, false)?;
            b.unicast(out, q, core)?;
            let bank = b.dram_bank(1);
            let q = b.queue(bank, QueueLocation::Dram, false)?;
            b.unicast(out, q, core)?;
        }
    }
    clilog::debug!("synthesized epoch {}: {} ops, {} buffers, {} pipes", index,
                   b.epoch.ops.len(), b.epoch.buffers.len(), b.epoch.pipes.len());
    Ok(b.epoch)
}

/// Pipes from `prod` into the first input of `cons`.
fn connect(b: &mut Builder, prod: &SynthOp, cons: &SynthOp, cons_op: &OpPlacement,
           mode: InputMulticast, adjacent: bool) -> Result<()> {
    let np = prod.cores.len();
    if mode.row || mode.col {
        // one multicast per consumer row (column)
        let lines = if mode.row {
            (cons_op.grid_loc_y..=cons_op.grid_end_y()).collect::<Vec<_>>()
        }
        else {
            (cons_op.grid_loc_x..=cons_op.grid_end_x()).collect::<Vec<_>>()
        };
        for line in lines {
            let members = cons.cores.iter().enumerate()
                .filter(|(_, c)| if mode.row { c.y == line } else { c.x == line })
                .map(|(i, _)| i)
                .collect::<Vec<_>>();
            let src = if adjacent {
                // the producer column has a core on every consumer row
                prod.cores.iter().position(|c| c.y == line).unwrap_or(0)
            }
            else {
                b.rng.gen_range(0..np)
            };
            let outputs = members.iter().map(|&i| cons.inputs[0][i]).collect();
            b.pipe(vec![prod.outputs[src]], vec![outputs], vec![cons.cores[members[0]]])?;
        }
        return Ok(())
    }

    if cons.cores.len() > 1 && b.rng.gen_bool(0.2) {
        // scatter: one producer core feeds every consumer core in turn
        let src = b.rng.gen_range(0..np);
        let outputs = cons.inputs[0].iter().map(|&i| vec![i]).collect();
        return b.pipe(vec![prod.outputs[src]], outputs, cons.cores.clone())
    }
    for c in 0..cons.cores.len() {
        let core = cons.cores[c];
        let dst = cons.inputs[0][c];
        match b.rng.gen_range(0..20) {
            0..=2 if np > 1 => {
                let first = b.rng.gen_range(0..np);
                let second = (first + 1) % np;
                b.pipe(vec![prod.outputs[first], prod.outputs[second]], vec![vec![dst]], vec![core])?;
            }
            3..=7 => {
                let src = b.rng.gen_range(0..np);
                let relay = b.l1_buffer(BufferKind::Relay, core, None)?;
                b.unicast(prod.outputs[src], relay, core)?;
                b.unicast(relay, dst, core)?;
            }
            _ => {
                let src = b.rng.gen_range(0..np);
                b.unicast(prod.outputs[src], dst, core)?;
            }
        }
    }
    Ok(())
}
