// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Pipe and buffer graph of one temporal epoch.
//!
//! Buffers and pipes are created upstream and only refer to each other
//! by id. The routing pass never adds or removes entries; it fills in
//! the routing of every pipe and grows the allocation of relay buffers.

use crate::error::{Result, RouteError};
use crate::grid::{CoreLocation, DeviceGrid, Noc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PipeId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferKind {
    OpInput,
    OpOutput,
    OpIntermediate,
    Relay,
    PrologInter,
    Queue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueLocation {
    Dram,
    Host,
}

/// The DRAM or host queue a queue buffer is a slice of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub name: String,
    pub location: QueueLocation,
    /// prolog queues are staged into L1 before the epoch starts.
    pub prolog: bool,
}

/// The op a buffer belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferOwner {
    Producer(String),
    Consumer { op: String, input_index: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buffer {
    pub id: BufferId,
    pub kind: BufferKind,
    /// the owning core, or the DRAM bank / host coordinate of a queue.
    pub location: CoreLocation,
    pub queue: Option<QueueInfo>,
    pub owner: Option<BufferOwner>,
    pub tile_size_bytes: u64,
    /// the minimum number of tiles the consumer reads at once.
    pub granule_tiles: u64,
    /// tiles moved through this buffer over the whole epoch.
    pub total_epoch_tiles: u64,
    allocated_tiles: u64,
}

impl Buffer {
    pub fn new(
        id: BufferId, kind: BufferKind, location: CoreLocation,
        tile_size_bytes: u64, granule_tiles: u64,
        total_epoch_tiles: u64, allocated_tiles: u64
    ) -> Buffer {
        Buffer {
            id, kind, location,
            queue: None,
            owner: None,
            tile_size_bytes, granule_tiles, total_epoch_tiles, allocated_tiles
        }
    }

    pub fn with_queue(mut self, queue: QueueInfo) -> Buffer {
        self.queue = Some(queue);
        self
    }

    pub fn with_owner(mut self, owner: BufferOwner) -> Buffer {
        self.owner = Some(owner);
        self
    }

    pub fn is_queue(&self) -> bool {
        self.kind == BufferKind::Queue
    }

    pub fn is_prolog_queue(&self) -> bool {
        matches!(&self.queue, Some(q) if q.prolog)
    }

    pub fn allocated_tiles(&self) -> u64 {
        self.allocated_tiles
    }

    /// Saturates, so an absurd allocation reads as overflowing any core.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_tiles.saturating_mul(self.tile_size_bytes)
    }

    /// only the upsizer grows buffers, after reserving the L1.
    pub(crate) fn set_allocated_tiles(&mut self, tiles: u64) {
        self.allocated_tiles = tiles;
    }

    /// Does this buffer occupy L1 on its core?
    pub fn uses_l1(&self) -> bool {
        !self.is_queue() && !self.location.is_system_memory()
    }

    pub fn validate(&self) -> Result<()> {
        if self.granule_tiles == 0 {
            return Err(RouteError::InvalidGranule {
                buffer: self.id, granule: self.granule_tiles
            })
        }
        if self.tile_size_bytes == 0 {
            return Err(RouteError::InvalidTileSize(self.id))
        }
        if self.uses_l1() && (self.allocated_tiles == 0 ||
                              self.allocated_tiles % self.granule_tiles != 0) {
            return Err(RouteError::GranuleMismatch {
                buffer: self.id,
                allocated: self.allocated_tiles,
                granule: self.granule_tiles,
            })
        }
        Ok(())
    }
}

/// Broadcast mode an op declares for one of its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InputMulticast {
    pub row: bool,
    pub col: bool,
    /// the multicast must travel on NOC1.
    pub noc1: bool,
}

/// An op pinned to a rectangle of cores on one chip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpPlacement {
    pub name: String,
    pub chip: u32,
    pub grid_loc_x: u32,
    pub grid_loc_y: u32,
    pub grid_size_x: u32,
    pub grid_size_y: u32,
    pub grid_transpose: bool,
    /// the op writes row-major data; its writer firmware is NOC0-only.
    pub untilize_output: bool,
    /// declared broadcast per input, by input index.
    pub inputs: Vec<InputMulticast>,
}

impl OpPlacement {
    pub fn new(name: &str, chip: u32, loc: (u32, u32), size: (u32, u32)) -> OpPlacement {
        OpPlacement {
            name: name.to_string(),
            chip,
            grid_loc_x: loc.0,
            grid_loc_y: loc.1,
            grid_size_x: size.0,
            grid_size_y: size.1,
            grid_transpose: false,
            untilize_output: false,
            inputs: vec![],
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<InputMulticast>) -> OpPlacement {
        self.inputs = inputs;
        self
    }

    pub fn grid_end_x(&self) -> u32 {
        self.grid_loc_x + self.grid_size_x - 1
    }

    pub fn grid_end_y(&self) -> u32 {
        self.grid_loc_y + self.grid_size_y - 1
    }

    pub fn input_multicast(&self, input_index: usize) -> InputMulticast {
        self.inputs.get(input_index).copied().unwrap_or_default()
    }
}

/// Traffic class of a transfer, i.e. the virtual channel it uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VirtualChannel {
    DramWrite,
    Unicast,
    RegUpdate,
    Multicast,
}

impl VirtualChannel {
    /// Hardware virtual channel number.
    pub fn number(self) -> u32 {
        match self {
            VirtualChannel::DramWrite => 0,
            VirtualChannel::Unicast => 2,
            VirtualChannel::RegUpdate => 3,
            VirtualChannel::Multicast => 4,
        }
    }

    pub fn tensix_data(multicast: bool) -> VirtualChannel {
        if multicast { VirtualChannel::Multicast } else { VirtualChannel::Unicast }
    }
}

/// Physical networks and traffic classes of an on-chip pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NocRoute {
    pub incoming_noc: Noc,
    pub outgoing_noc: Noc,
    pub incoming_vc: VirtualChannel,
    pub outgoing_vc: VirtualChannel,
}

/// Whether a route is guaranteed to make monotonic progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingOutcome {
    /// every source/destination path fits the chosen network.
    Exact,
    /// some paths leave the bounding box of the chosen network.
    /// the route is used anyway.
    BestEffort { unfit_paths: u32 },
}

/// Routing written by the pass into a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeRouting {
    /// `None` for ethernet pipes, which never touch the on-chip networks.
    pub noc: Option<NocRoute>,
    pub direct_multicast: bool,
    pub outcome: RoutingOutcome,
    /// the outgoing network was flipped by the loopback balancer.
    pub loopback_rebalanced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipe {
    pub id: PipeId,
    pub inputs: Vec<BufferId>,
    /// output buffers per timestep. more than one timestep is a scatter
    /// pipe, more than one buffer in a timestep is a multicast.
    pub outputs: Vec<Vec<BufferId>>,
    /// the core implementing each timestep, if already decided.
    pub locations: Vec<CoreLocation>,
    routing: Option<PipeRouting>,
}

impl Pipe {
    pub fn new(id: PipeId, inputs: Vec<BufferId>, outputs: Vec<BufferId>) -> Pipe {
        Pipe::new_scatter(id, inputs, vec![outputs])
    }

    pub fn new_scatter(id: PipeId, inputs: Vec<BufferId>, outputs: Vec<Vec<BufferId>>) -> Pipe {
        Pipe { id, inputs, outputs, locations: vec![], routing: None }
    }

    pub fn with_locations(mut self, locations: Vec<CoreLocation>) -> Pipe {
        self.locations = locations;
        self
    }

    pub fn num_timesteps(&self) -> usize {
        self.outputs.len()
    }

    pub fn has_multiple_timesteps(&self) -> bool {
        self.outputs.len() > 1
    }

    /// Outputs of one timestep; empty past the last one.
    pub fn timestep_outputs(&self, timestep: usize) -> &[BufferId] {
        self.outputs.get(timestep).map_or(&[], |o| o.as_slice())
    }

    pub fn all_outputs(&self) -> impl Iterator<Item = BufferId> + '_ {
        self.outputs.iter().flatten().copied()
    }

    pub fn first_input(&self) -> Option<BufferId> {
        self.inputs.first().copied()
    }

    pub fn first_output(&self) -> Option<BufferId> {
        self.outputs.first().and_then(|o| o.first()).copied()
    }

    /// Does any timestep fan out to more than one buffer?
    pub fn is_multicast(&self) -> bool {
        self.outputs.iter().any(|o| o.len() > 1)
    }

    pub fn routing(&self) -> Option<&PipeRouting> {
        self.routing.as_ref()
    }

    pub fn noc_route(&self) -> Option<&NocRoute> {
        self.routing.as_ref().and_then(|r| r.noc.as_ref())
    }

    /// Write the routing decided for this pipe. Only allowed once.
    pub fn assign_routing(&mut self, routing: PipeRouting) -> Result<()> {
        if self.routing.is_some() {
            return Err(RouteError::RouteAlreadyAssigned(self.id))
        }
        self.routing = Some(routing);
        Ok(())
    }

    /// Move the outgoing leg of a routed pipe to `noc`. Only allowed
    /// once per pipe.
    pub fn rebalance_outgoing_noc(&mut self, noc: Noc) -> Result<()> {
        let routing = match &mut self.routing {
            Some(r) if r.noc.is_some() && !r.loopback_rebalanced => r,
            Some(r) if r.loopback_rebalanced => {
                return Err(RouteError::RouteAlreadyAssigned(self.id))
            }
            _ => return Err(RouteError::RouteNotAssigned(self.id)),
        };
        if let Some(route) = &mut routing.noc {
            route.outgoing_noc = noc;
        }
        routing.loopback_rebalanced = true;
        Ok(())
    }
}

/// One temporal epoch: the unit the routing pass runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epoch {
    pub index: usize,
    pub device: DeviceGrid,
    pub ops: IndexMap<String, OpPlacement>,
    pub buffers: IndexMap<BufferId, Buffer>,
    pub pipes: IndexMap<PipeId, Pipe>,
}

impl Epoch {
    pub fn new(index: usize, device: DeviceGrid) -> Epoch {
        Epoch {
            index, device,
            ops: IndexMap::new(),
            buffers: IndexMap::new(),
            pipes: IndexMap::new(),
        }
    }

    pub fn add_op(&mut self, op: OpPlacement) -> Result<()> {
        if self.ops.contains_key(&op.name) {
            return Err(RouteError::DuplicateId { kind: "op", id: op.name })
        }
        self.ops.insert(op.name.clone(), op);
        Ok(())
    }

    pub fn add_buffer(&mut self, buffer: Buffer) -> Result<()> {
        if self.buffers.contains_key(&buffer.id) {
            return Err(RouteError::DuplicateId { kind: "buffer", id: buffer.id.to_string() })
        }
        self.buffers.insert(buffer.id, buffer);
        Ok(())
    }

    pub fn add_pipe(&mut self, pipe: Pipe) -> Result<()> {
        if self.pipes.contains_key(&pipe.id) {
            return Err(RouteError::DuplicateId { kind: "pipe", id: pipe.id.to_string() })
        }
        self.pipes.insert(pipe.id, pipe);
        Ok(())
    }

    pub fn op(&self, name: &str) -> Result<&OpPlacement> {
        self.ops.get(name).ok_or_else(|| RouteError::MissingOp(name.to_string()))
    }

    pub fn buffer(&self, id: BufferId) -> Result<&Buffer> {
        self.buffers.get(&id).ok_or(RouteError::UnknownBuffer(id))
    }

    pub fn buffer_mut(&mut self, id: BufferId) -> Result<&mut Buffer> {
        self.buffers.get_mut(&id).ok_or(RouteError::UnknownBuffer(id))
    }

    pub fn pipe(&self, id: PipeId) -> Result<&Pipe> {
        self.pipes.get(&id).ok_or(RouteError::UnknownPipe(id))
    }

    pub fn pipe_mut(&mut self, id: PipeId) -> Result<&mut Pipe> {
        self.pipes.get_mut(&id).ok_or(RouteError::UnknownPipe(id))
    }

    /// Look up a buffer referenced by `pipe`.
    pub fn pipe_buffer(&self, pipe: &Pipe, id: BufferId) -> Result<&Buffer> {
        self.buffers.get(&id).ok_or(RouteError::MissingBuffer { pipe: pipe.id, buffer: id })
    }

    /// Check the invariants the upstream stages promise.
    pub fn validate(&self) -> Result<()> {
        for op in self.ops.values() {
            if !self.device.contains_rect(op.grid_loc_x, op.grid_loc_y,
                                          op.grid_size_x, op.grid_size_y) {
                return Err(RouteError::PlacementOutOfGrid {
                    op: op.name.clone(),
                    x: op.grid_loc_x,
                    y: op.grid_loc_y,
                    size_x: op.grid_size_x,
                    size_y: op.grid_size_y,
                    grid_x: self.device.grid_size_x,
                    grid_y: self.device.grid_size_y,
                })
            }
        }
        for buffer in self.buffers.values() {
            buffer.validate()?;
            let sentinel = buffer.is_queue() && buffer.location.is_system_memory();
            if !sentinel && !self.device.contains_core(&buffer.location) {
                return Err(RouteError::BufferOutOfGrid {
                    buffer: buffer.id,
                    location: buffer.location,
                    grid_x: self.device.grid_size_x,
                    grid_y: self.device.grid_size_y,
                })
            }
        }
        for pipe in self.pipes.values() {
            if pipe.inputs.is_empty() || pipe.outputs.is_empty() ||
                pipe.outputs.iter().any(|o| o.is_empty())
            {
                return Err(RouteError::EmptyPipe(pipe.id))
            }
            for id in pipe.inputs.iter().copied().chain(pipe.all_outputs()) {
                self.pipe_buffer(pipe, id)?;
            }
            if let Some(&loc) = pipe.locations.iter().find(|l| !self.device.contains_core(l)) {
                return Err(RouteError::PipeLocationOutOfGrid { pipe: pipe.id, location: loc })
            }
        }
        Ok(())
    }

    /// Read a stream of serialized epochs.
    pub fn read_all(path: &Path) -> Result<Vec<Epoch>> {
        let f = std::fs::File::open(path)?;
        let mut buf = std::io::BufReader::new(f);
        Ok(serde_bare::from_reader(&mut buf)?)
    }

    /// Write epochs in the format read by [Epoch::read_all].
    pub fn write_all(path: &Path, epochs: &[Epoch]) -> Result<()> {
        use std::io::Write;
        let f = std::fs::File::create(path)?;
        let mut buf = std::io::BufWriter::new(f);
        serde_bare::to_writer(&mut buf, epochs)?;
        buf.flush()?;
        Ok(())
    }
}
