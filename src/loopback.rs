// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Per-op balancing of loopback traffic between the two networks.
//!
//! A loopback pipe gathers or retimes data in a local buffer next to
//! the consumer and sends it again, so it loads the network of its
//! outgoing leg on top of the incoming traffic of the op. Unicast
//! loopbacks can move their outgoing leg freely.

use crate::error::Result;
use crate::graph::{Epoch, PipeId};
use crate::grid::Noc;
use indexmap::IndexMap;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy)]
struct OpInputPipe {
    pipe: PipeId,
    loopback: bool,
    /// unicast loopback, free to change its outgoing network.
    switchable: bool,
}

/// Traffic into one op, per network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NocLoad {
    pub inputs: [u32; 2],
    pub loopbacks: [u32; 2],
    pub switchable: [u32; 2],
}

impl NocLoad {
    pub fn load(&self, noc: Noc) -> i64 {
        (self.inputs[noc.id()] + self.loopbacks[noc.id()]) as i64
    }

    /// NOC0 load minus NOC1 load.
    pub fn imbalance(&self) -> i64 {
        self.load(Noc::Noc0) - self.load(Noc::Noc1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoopbackStats {
    pub ops_rebalanced: usize,
    pub pipes_flipped: usize,
}

/// Collects the routed input pipes of every op, then evens out the
/// network load of each op in one greedy step.
#[derive(Debug, Default)]
pub struct LoopbackBalancer {
    ops: IndexMap<String, BTreeMap<usize, OpInputPipe>>,
}

impl LoopbackBalancer {
    pub fn new() -> LoopbackBalancer {
        LoopbackBalancer::default()
    }

    /// Remember the pipe feeding `input_index` of `op`. A later record
    /// for the same input replaces the earlier one.
    pub fn record(&mut self, op: &str, input_index: usize, pipe: PipeId,
                  loopback: bool, multicast: bool) {
        self.ops.entry(op.to_string()).or_default().insert(input_index, OpInputPipe {
            pipe, loopback,
            switchable: loopback && !multicast,
        });
    }

    pub fn num_loopbacks(&self) -> usize {
        self.ops.values().flat_map(|m| m.values()).filter(|p| p.loopback).count()
    }

    fn load_of(epoch: &Epoch, inputs: &BTreeMap<usize, OpInputPipe>) -> Result<NocLoad> {
        let mut load = NocLoad::default();
        for info in inputs.values() {
            let Some(route) = epoch.pipe(info.pipe)?.noc_route() else { continue };
            load.inputs[route.incoming_noc.id()] += 1;
            if info.loopback {
                load.loopbacks[route.outgoing_noc.id()] += 1;
                if info.switchable {
                    load.switchable[route.outgoing_noc.id()] += 1;
                }
            }
        }
        Ok(load)
    }

    /// Current network load of `op`, from the routing stored in `epoch`.
    pub fn op_load(&self, epoch: &Epoch, op: &str) -> Result<NocLoad> {
        match self.ops.get(op) {
            Some(inputs) => Self::load_of(epoch, inputs),
            None => Ok(NocLoad::default()),
        }
    }

    /// Flip half the excess of the busier network of each op onto the
    /// other one, using switchable loopbacks in input order.
    pub fn balance(&self, epoch: &mut Epoch) -> Result<LoopbackStats> {
        let mut stats = LoopbackStats::default();
        for (op, inputs) in &self.ops {
            let load = Self::load_of(epoch, inputs)?;
            let excess = load.imbalance();
            let (from, mut to_flip) = if excess > 1 && load.switchable[0] > 0 {
                (Noc::Noc0, excess / 2)
            }
            else if -excess > 1 && load.switchable[1] > 0 {
                (Noc::Noc1, -excess / 2)
            }
            else {
                continue
            };
            clilog::debug!("op {}: noc load {} vs {}, moving up to {} loopbacks off {}",
                           op, load.load(Noc::Noc0), load.load(Noc::Noc1), to_flip, from);
            stats.ops_rebalanced += 1;
            for info in inputs.values().filter(|i| i.switchable) {
                if to_flip == 0 {
                    break
                }
                let pipe = epoch.pipe_mut(info.pipe)?;
                if pipe.noc_route().map(|r| r.outgoing_noc) == Some(from) {
                    pipe.rebalance_outgoing_noc(from.other())?;
                    clilog::debug!("pipe {}: loopback moved from {} to {}",
                                   info.pipe, from, from.other());
                    to_flip -= 1;
                    stats.pipes_flipped += 1;
                }
            }
        }
        Ok(stats)
    }
}
