// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Error types for the routing pass.
//!
//! Every variant except [CapacityError] is fatal: it means the upstream
//! placement or graph is inconsistent and compilation of the epoch
//! must stop.

use crate::graph::{BufferId, PipeId};
use crate::grid::CoreLocation;
use thiserror::Error;

/// Result type alias for routing pass operations.
pub type Result<T> = std::result::Result<T, RouteError>;

/// A reservation that does not fit into the remaining L1 of a core.
///
/// This is never fatal. The upsizer treats it as "stop growing".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("core {core}: cannot reserve {requested} bytes, only {available} available")]
pub struct CapacityError {
    pub core: CoreLocation,
    pub requested: u64,
    pub available: u64,
}

#[derive(Debug, Error)]
pub enum RouteError {
    /// Producer and consumer grids overlap on both axes.
    #[error("ops {producer} and {consumer} overlap on both axes (x overlap {x_overlap}, y overlap {y_overlap})")]
    PlacementOverlap {
        producer: String,
        consumer: String,
        x_overlap: u32,
        y_overlap: u32,
    },

    /// An op rectangle sticks out of the core mesh.
    #[error("op {op} grid at ({x}, {y}) of size {size_x}x{size_y} exceeds the {grid_x}x{grid_y} core mesh")]
    PlacementOutOfGrid {
        op: String,
        x: u32,
        y: u32,
        size_x: u32,
        size_y: u32,
        grid_x: u32,
        grid_y: u32,
    },

    /// A buffer placed off the core mesh. Only queues may sit at the
    /// system memory sentinel.
    #[error("buffer {buffer} at {location} lies outside the {grid_x}x{grid_y} core mesh")]
    BufferOutOfGrid {
        buffer: BufferId,
        location: CoreLocation,
        grid_x: u32,
        grid_y: u32,
    },

    #[error("pipe {pipe}: multicast location {location} lies outside the core mesh")]
    PipeLocationOutOfGrid { pipe: PipeId, location: CoreLocation },

    /// Overlap bookkeeping produced a shape that placement can never produce.
    #[error("pipe {pipe}: {reason}")]
    GeometryInvariant { pipe: PipeId, reason: String },

    #[error("pipe {pipe} references missing buffer {buffer}")]
    MissingBuffer { pipe: PipeId, buffer: BufferId },

    #[error("unknown buffer {0}")]
    UnknownBuffer(BufferId),

    #[error("unknown pipe {0}")]
    UnknownPipe(PipeId),

    #[error("unknown op {0}")]
    MissingOp(String),

    /// An op-side buffer without the producer/consumer metadata routing needs.
    #[error("buffer {0} belongs to an op but carries no owner metadata")]
    MissingOwner(BufferId),

    #[error("pipe {0} has no inputs or no outputs")]
    EmptyPipe(PipeId),

    #[error("buffer {buffer}: scatter/gather granularity must be positive, got {granule}")]
    InvalidGranule { buffer: BufferId, granule: u64 },

    #[error("buffer {buffer}: allocated {allocated} tiles is not a positive multiple of granule {granule}")]
    GranuleMismatch {
        buffer: BufferId,
        allocated: u64,
        granule: u64,
    },

    #[error("buffer {0}: tile size must be positive")]
    InvalidTileSize(BufferId),

    #[error("op {op} input {input_index}: {reason}")]
    InconsistentMulticast {
        op: String,
        input_index: usize,
        reason: &'static str,
    },

    #[error("duplicate {kind} id {id}")]
    DuplicateId { kind: &'static str, id: String },

    #[error("pipe {0} already has its routing assigned")]
    RouteAlreadyAssigned(PipeId),

    #[error("pipe {0} has no on-chip network routing to rebalance")]
    RouteNotAssigned(PipeId),

    /// Buffers placed upstream already exceed the L1 budget of their core.
    #[error("core {core}: {allocated} bytes allocated upstream exceed the {capacity} byte budget")]
    InitialOverflow {
        core: CoreLocation,
        allocated: u64,
        capacity: u64,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_bare::error::Error),
}
