// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Core mesh geometry and the two on-chip networks.
//!
//! The mesh is a 2-D torus. NOC0 travels towards increasing x and y,
//! NOC1 towards decreasing x and y, both wrapping around the edges.
//! All coordinates here are given in NOC0 orientation, even when they
//! describe a NOC1 path.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coordinate used by host system memory in place of a real core.
pub const SYSTEM_MEMORY_COORD: u32 = 255;

/// One of the two physical on-chip networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Noc {
    Noc0,
    Noc1,
}

impl Noc {
    pub fn id(self) -> usize {
        match self {
            Noc::Noc0 => 0,
            Noc::Noc1 => 1,
        }
    }

    pub fn other(self) -> Noc {
        match self {
            Noc::Noc0 => Noc::Noc1,
            Noc::Noc1 => Noc::Noc0,
        }
    }

    /// NOC1 when `cond` holds, NOC0 otherwise.
    pub fn noc1_if(cond: bool) -> Noc {
        if cond { Noc::Noc1 } else { Noc::Noc0 }
    }
}

impl fmt::Display for Noc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NOC{}", self.id())
    }
}

/// A position on the mesh of one chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GridCoord {
    pub x: u32,
    pub y: u32,
}

impl GridCoord {
    pub fn new(x: u32, y: u32) -> Self {
        GridCoord { x, y }
    }
}

/// A core on a specific chip of the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CoreLocation {
    pub chip: u32,
    pub x: u32,
    pub y: u32,
}

impl CoreLocation {
    pub fn new(chip: u32, x: u32, y: u32) -> Self {
        CoreLocation { chip, x, y }
    }

    pub fn coord(&self) -> GridCoord {
        GridCoord { x: self.x, y: self.y }
    }

    /// Host system memory, reached over PCIe.
    pub fn is_system_memory(&self) -> bool {
        self.x == SYSTEM_MEMORY_COORD && self.y == SYSTEM_MEMORY_COORD
    }
}

impl fmt::Display for CoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(c={},y={},x={})", self.chip, self.y, self.x)
    }
}

/// Is `n` inside `[start, end]` on a wrapping axis?
///
/// `end < start` denotes an interval that wraps around the mesh edge.
pub fn in_coord_interval(start: u32, end: u32, n: u32) -> bool {
    if end < start {
        n >= start || n <= end
    }
    else {
        n >= start && n <= end
    }
}

/// Forward hop count from `from` to `to` on a ring of `size` nodes.
/// Positions are taken modulo `size`.
fn forward_hops(from: u32, to: u32, size: u32) -> u32 {
    if size == 0 {
        return 0
    }
    let (from, to) = (from % size, to % size);
    if to >= from { to - from } else { size - (from - to) }
}

/// Hop count in the opposite direction of [forward_hops].
fn backward_hops(from: u32, to: u32, size: u32) -> u32 {
    match forward_hops(from, to, size) {
        0 => 0,
        d => size - d,
    }
}

/// Static description of the chips in the cluster.
///
/// Every chip shares the same mesh shape and ethernet core positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceGrid {
    pub grid_size_x: u32,
    pub grid_size_y: u32,
    /// ethernet-capable cores, identical on every chip.
    pub ethernet_cores: Vec<GridCoord>,
    /// total L1 per core in bytes.
    pub l1_size_bytes: u64,
    /// L1 bytes per core held back for firmware and kernels.
    pub l1_reserved_bytes: u64,
}

impl DeviceGrid {
    pub fn has_ethernet(&self) -> bool {
        !self.ethernet_cores.is_empty()
    }

    pub fn is_ethernet_core(&self, loc: &CoreLocation) -> bool {
        self.ethernet_cores.contains(&loc.coord())
    }

    /// L1 bytes usable by buffers on any core.
    pub fn l1_budget_bytes(&self) -> u64 {
        self.l1_size_bytes.saturating_sub(self.l1_reserved_bytes)
    }

    /// Is `loc` a core of the mesh? The system memory sentinel is not.
    pub fn contains_core(&self, loc: &CoreLocation) -> bool {
        loc.x < self.grid_size_x && loc.y < self.grid_size_y
    }

    /// Does the rectangle at `(x, y)` of size `size_x * size_y` fit
    /// without wrapping?
    pub fn contains_rect(&self, x: u32, y: u32, size_x: u32, size_y: u32) -> bool {
        size_x > 0 && size_y > 0 &&
            x as u64 + size_x as u64 <= self.grid_size_x as u64 &&
            y as u64 + size_y as u64 <= self.grid_size_y as u64
    }

    pub fn noc0_axis_distance(&self, from: u32, to: u32, size: u32) -> u32 {
        forward_hops(from, to, size)
    }

    pub fn noc1_axis_distance(&self, from: u32, to: u32, size: u32) -> u32 {
        backward_hops(from, to, size)
    }

    pub fn noc0_distance(&self, src: GridCoord, dst: GridCoord) -> u32 {
        forward_hops(src.x, dst.x, self.grid_size_x) +
            forward_hops(src.y, dst.y, self.grid_size_y)
    }

    pub fn noc1_distance(&self, src: GridCoord, dst: GridCoord) -> u32 {
        backward_hops(src.x, dst.x, self.grid_size_x) +
            backward_hops(src.y, dst.y, self.grid_size_y)
    }

    pub fn noc_distance(&self, noc: Noc, src: GridCoord, dst: GridCoord) -> u32 {
        match noc {
            Noc::Noc0 => self.noc0_distance(src, dst),
            Noc::Noc1 => self.noc1_distance(src, dst),
        }
    }

    /// The network with fewer hops from `src` to `dst`. Ties go to NOC0.
    pub fn shortest_path_noc(&self, src: GridCoord, dst: GridCoord) -> Noc {
        Noc::noc1_if(self.noc0_distance(src, dst) > self.noc1_distance(src, dst))
    }
}
