// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Routing pass policy switches.

use serde::{Deserialize, Serialize};

/// Minimum number of cycles a relay buffer should be able to cover
/// for full latency hiding of its producer.
pub const KERNEL_INPUT_MIN_LATENCY_CYCLES: u64 = 10000;

/// Incoming bandwidth assumed when sizing relay buffers.
///
/// 100Gbps link at 1GHz is 12.5 bytes per cycle, rounded up.
pub const INCOMING_BYTES_PER_CYCLE: u64 = 13;

/// How relay buffers sharing a core split its spare L1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
pub enum UpsizeStrategy {
    /// Grow the smallest buffers first, one valid size at a time.
    #[default]
    Greedy,
    /// Give each buffer a byte target proportional to its granule.
    Proportional,
}

/// Network selection policy for pipes that touch DRAM queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
pub enum DramRoutingScheme {
    /// Shortest path between the bank and the core.
    #[default]
    Proximity,
    /// Reads on NOC0, writes on NOC1.
    FixedSplit,
    /// NOC0 for all queue traffic.
    NoRelay,
}

/// Policy for one invocation of the routing pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub upsize_strategy: UpsizeStrategy,
    /// Only upsize relay buffers that sit on ethernet cores.
    pub ethernet_only: bool,
    pub dram_routing: DramRoutingScheme,
    pub min_latency_cycles: u64,
    pub incoming_bytes_per_cycle: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        RoutingConfig {
            upsize_strategy: UpsizeStrategy::default(),
            ethernet_only: false,
            dram_routing: DramRoutingScheme::default(),
            min_latency_cycles: KERNEL_INPUT_MIN_LATENCY_CYCLES,
            incoming_bytes_per_cycle: INCOMING_BYTES_PER_CYCLE,
        }
    }
}

impl RoutingConfig {
    /// Bytes a relay buffer must hold to hide the minimum kernel
    /// input latency.
    pub fn latency_hiding_bytes(&self) -> u64 {
        self.min_latency_cycles.saturating_mul(self.incoming_bytes_per_cycle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_hiding_defaults() {
        assert_eq!(RoutingConfig::default().latency_hiding_bytes(), 130_000);
        let cfg = RoutingConfig { min_latency_cycles: u64::MAX, ..Default::default() };
        assert_eq!(cfg.latency_hiding_bytes(), u64::MAX);
    }
}
