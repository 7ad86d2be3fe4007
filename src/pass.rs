// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Routing pass driver.
//!
//! Per epoch: classify and route every pipe, balance loopback traffic
//! per op, then upsize relay buffers against the L1 model.

use crate::classify::classify_pipe;
use crate::config::RoutingConfig;
use crate::error::Result;
use crate::graph::{Epoch, PipeId, PipeRouting, RoutingOutcome};
use crate::loopback::{LoopbackBalancer, LoopbackStats};
use crate::mcast::{AdjacentProducerOracle, DirectMulticastOracle};
use crate::resource::{L1ResourceModel, ResourceModel};
use crate::route::select_route;
use crate::upsize::{upsize_relay_buffers, UpsizeReport};
use rayon::prelude::*;
use std::fmt;

/// Counts of the routing decisions made for one epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteStats {
    pub pipes: usize,
    pub ethernet: usize,
    pub pcie: usize,
    /// routed pipes per incoming network.
    pub incoming: [usize; 2],
    /// routed pipes per outgoing network, after loopback balancing.
    pub outgoing: [usize; 2],
    pub direct_multicast: usize,
    pub best_effort: usize,
    pub loopbacks: usize,
    pub loopback: LoopbackStats,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub epoch: usize,
    pub routes: RouteStats,
    pub upsize: UpsizeReport,
}

impl fmt::Display for PassReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = &self.routes;
        writeln!(f, "epoch {}: {} pipes ({} ethernet, {} pcie)",
                 self.epoch, r.pipes, r.ethernet, r.pcie)?;
        writeln!(f, "  incoming noc0/noc1: {}/{}, outgoing noc0/noc1: {}/{}",
                 r.incoming[0], r.incoming[1], r.outgoing[0], r.outgoing[1])?;
        writeln!(f, "  direct multicast: {}, best effort: {}", r.direct_multicast, r.best_effort)?;
        writeln!(f, "  loopbacks: {}, flipped: {} on {} ops",
                 r.loopbacks, r.loopback.pipes_flipped, r.loopback.ops_rebalanced)?;
        write!(f, "  relay upsizing: {} of {} buffers grown, +{} tiles, +{}B",
               self.upsize.num_grown(), self.upsize.buffers.len(),
               self.upsize.tiles_added(), self.upsize.bytes_added())
    }
}

/// The routing and upsizing pass, configured once and run per epoch.
#[derive(Debug, Clone)]
pub struct RoutingPass<O = AdjacentProducerOracle> {
    pub config: RoutingConfig,
    oracle: O,
}

impl RoutingPass<AdjacentProducerOracle> {
    pub fn new(config: RoutingConfig) -> Self {
        RoutingPass { config, oracle: AdjacentProducerOracle }
    }
}

impl<O: DirectMulticastOracle> RoutingPass<O> {
    pub fn with_oracle(config: RoutingConfig, oracle: O) -> Self {
        RoutingPass { config, oracle }
    }

    /// Assign the routing of every pipe and balance loopbacks.
    ///
    /// The epoch is validated and all decisions are made before any
    /// pipe is written, so a fatal error leaves the epoch untouched.
    pub fn route_pipes(&self, epoch: &mut Epoch) -> Result<RouteStats> {
        epoch.validate()?;
        self.route_validated(epoch)
    }

    fn route_validated(&self, epoch: &mut Epoch) -> Result<RouteStats> {
        let timer = clilog::stimer!("route pipes");
        let mut stats = RouteStats { pipes: epoch.pipes.len(), ..Default::default() };
        let mut balancer = LoopbackBalancer::new();
        let mut decisions = Vec::<(PipeId, PipeRouting)>::with_capacity(epoch.pipes.len());
        for pipe in epoch.pipes.values() {
            let class = classify_pipe(epoch, pipe, &self.oracle)?;
            let routing = select_route(epoch, pipe, &class, &self.config)?;
            stats.ethernet += class.is_ethernet as usize;
            stats.pcie += class.is_pcie as usize;
            stats.direct_multicast += routing.direct_multicast as usize;
            stats.loopbacks += class.needs_loopback as usize;
            if let RoutingOutcome::BestEffort { .. } = routing.outcome {
                stats.best_effort += 1;
            }
            if let (Some(op), Some(_)) = (&class.dest_op, routing.noc) {
                balancer.record(op, class.dest_input_index, pipe.id,
                                class.needs_loopback, class.wants_multicast());
            }
            decisions.push((pipe.id, routing));
        }
        for (id, routing) in decisions {
            epoch.pipe_mut(id)?.assign_routing(routing)?;
        }
        stats.loopback = balancer.balance(epoch)?;
        for route in epoch.pipes.values().filter_map(|p| p.noc_route()) {
            stats.incoming[route.incoming_noc.id()] += 1;
            stats.outgoing[route.outgoing_noc.id()] += 1;
        }
        clilog::finish!(timer);
        Ok(stats)
    }

    fn run_validated<M: ResourceModel>(
        &self, epoch: &mut Epoch, model: &mut M
    ) -> Result<PassReport> {
        let routes = self.route_validated(epoch)?;
        let upsize = upsize_relay_buffers(epoch, model, &self.config)?;
        let report = PassReport { epoch: epoch.index, routes, upsize };
        clilog::info!("{}", report);
        Ok(report)
    }

    /// Run the whole pass on `epoch` against an external L1 model.
    pub fn run_with_model<M: ResourceModel>(
        &self, epoch: &mut Epoch, model: &mut M
    ) -> Result<PassReport> {
        epoch.validate()?;
        self.run_validated(epoch, model)
    }

    /// Run the whole pass on `epoch`, accounting L1 from its buffers.
    pub fn run(&self, epoch: &mut Epoch) -> Result<PassReport> {
        epoch.validate()?;
        let mut model = L1ResourceModel::from_epoch(epoch)?;
        self.run_validated(epoch, &mut model)
    }
}

/// Run the pass on independent epochs in parallel. Reports come back
/// in input order; the first fatal error in input order is returned.
pub fn run_epochs<O: DirectMulticastOracle + Sync>(
    pass: &RoutingPass<O>, epochs: &mut [Epoch]
) -> Result<Vec<PassReport>> {
    epochs.par_iter_mut()
        .map(|epoch| pass.run(epoch))
        .collect::<Vec<_>>()
        .into_iter()
        .collect()
}
