// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Per-core L1 accounting.

use crate::error::{CapacityError, Result, RouteError};
use crate::graph::Epoch;
use crate::grid::CoreLocation;
use indexmap::IndexMap;

/// The source of truth for "available bytes per core".
///
/// Callers query and reserve in the same step, so a reservation that
/// succeeds is always backed by a prior availability check.
pub trait ResourceModel {
    fn available_bytes(&self, core: &CoreLocation) -> u64;

    fn reserve_bytes(&mut self, core: &CoreLocation, delta: u64)
                     -> std::result::Result<(), CapacityError>;
}

/// L1 usage of every core, seeded from the buffers placed upstream.
#[derive(Debug, Clone)]
pub struct L1ResourceModel {
    capacity: u64,
    allocated: IndexMap<CoreLocation, u64>,
}

impl L1ResourceModel {
    /// A model with no allocation on any core.
    pub fn empty(capacity: u64) -> L1ResourceModel {
        L1ResourceModel { capacity, allocated: IndexMap::new() }
    }

    /// Account all L1 buffers of an epoch against the device budget.
    pub fn from_epoch(epoch: &Epoch) -> Result<L1ResourceModel> {
        let capacity = epoch.device.l1_budget_bytes();
        let mut allocated = IndexMap::<CoreLocation, u64>::new();
        for buffer in epoch.buffers.values().filter(|b| b.uses_l1()) {
            let used = allocated.entry(buffer.location).or_default();
            *used = used.saturating_add(buffer.allocated_bytes());
        }
        for (&core, &bytes) in &allocated {
            if bytes > capacity {
                return Err(RouteError::InitialOverflow {
                    core, allocated: bytes, capacity
                })
            }
        }
        Ok(L1ResourceModel { capacity, allocated })
    }

    pub fn allocated_bytes(&self, core: &CoreLocation) -> u64 {
        self.allocated.get(core).copied().unwrap_or(0)
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity
    }
}

impl ResourceModel for L1ResourceModel {
    fn available_bytes(&self, core: &CoreLocation) -> u64 {
        self.capacity.saturating_sub(self.allocated_bytes(core))
    }

    fn reserve_bytes(&mut self, core: &CoreLocation, delta: u64)
                     -> std::result::Result<(), CapacityError> {
        let available = self.available_bytes(core);
        if delta > available {
            return Err(CapacityError { core: *core, requested: delta, available })
        }
        *self.allocated.entry(*core).or_default() += delta;
        Ok(())
    }
}
