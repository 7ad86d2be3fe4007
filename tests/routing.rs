// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
use indexmap::IndexMap;
use nocroute::classify::classify_pipe;
use nocroute::config::{RoutingConfig, UpsizeStrategy};
use nocroute::error::{CapacityError, RouteError};
use nocroute::graph::{Buffer, BufferId, BufferKind, Epoch, OpPlacement, VirtualChannel};
use nocroute::grid::{CoreLocation, DeviceGrid, GridCoord, Noc};
use nocroute::loopback::LoopbackBalancer;
use nocroute::mcast::AdjacentProducerOracle;
use nocroute::pass::{run_epochs, RoutingPass};
use nocroute::resource::{L1ResourceModel, ResourceModel};
use nocroute::route::{check_op_overlap, select_route};
use nocroute::synth::{synth_epoch, SynthParams};
use nocroute::upsize::upsize_relay_buffers;

fn device(x: u32, y: u32) -> DeviceGrid {
    DeviceGrid {
        grid_size_x: x,
        grid_size_y: y,
        ethernet_cores: vec![],
        l1_size_bytes: 1 << 20,
        l1_reserved_bytes: 0,
    }
}

fn synth_set(seeds: std::ops::Range<u64>) -> Vec<Epoch> {
    let mut epochs = vec![];
    for seed in seeds {
        for (num_chips, ethernet) in [(1, false), (2, false), (2, true)] {
            let params = SynthParams { seed, num_chips, ethernet, ..Default::default() };
            epochs.push(synth_epoch(&params, epochs.len()).unwrap());
        }
    }
    epochs
}

fn l1_usage(epoch: &Epoch) -> IndexMap<CoreLocation, u64> {
    let mut usage = IndexMap::<CoreLocation, u64>::new();
    for b in epoch.buffers.values().filter(|b| b.uses_l1()) {
        *usage.entry(b.location).or_default() += b.allocated_bytes();
    }
    usage
}

#[test]
fn shortest_path_is_argmin() {
    let d = device(10, 12);
    for sx in 0..10 {
        for sy in 0..12 {
            for (dx, dy) in [(0, 0), (3, 7), (9, 11), (5, 1)] {
                let (s, t) = (GridCoord::new(sx, sy), GridCoord::new(dx, dy));
                let noc = d.shortest_path_noc(s, t);
                assert!(d.noc_distance(noc, s, t) <= d.noc_distance(noc.other(), s, t));
            }
        }
    }
    // equal distance goes to NOC0
    let d = device(10, 10);
    assert_eq!(d.shortest_path_noc(GridCoord::new(0, 0), GridCoord::new(5, 5)), Noc::Noc0);
}

#[test]
fn two_axis_overlap_is_fatal() {
    let d = device(8, 8);
    let p = OpPlacement::new("p", 0, (1, 1), (3, 3));
    let c = OpPlacement::new("c", 0, (3, 3), (2, 2));
    assert!(matches!(check_op_overlap(&d, &p, &c), Err(RouteError::PlacementOverlap { .. })));
    // side by side on the x axis: only y overlaps
    let c = OpPlacement::new("c", 0, (5, 2), (2, 2));
    let ov = check_op_overlap(&d, &p, &c).unwrap();
    assert_eq!(ov.x.size, 0);
    assert_eq!(ov.y.size, 2);
}

#[test]
fn routed_epochs_keep_l1_invariants() {
    for strategy in [UpsizeStrategy::Greedy, UpsizeStrategy::Proportional] {
        for ethernet_only in [false, true] {
            let config = RoutingConfig { upsize_strategy: strategy, ethernet_only, ..Default::default() };
            let pass = RoutingPass::new(config);
            let mut epochs = synth_set(0..10);
            let before = epochs.clone();
            run_epochs(&pass, &mut epochs).unwrap();
            for (e, orig) in epochs.iter().zip(&before) {
                let budget = e.device.l1_budget_bytes();
                for (core, bytes) in l1_usage(e) {
                    assert!(bytes <= budget, "core {} uses {}B of {}B", core, bytes, budget);
                }
                for (id, b) in &e.buffers {
                    let old = &orig.buffers[id];
                    if b.uses_l1() {
                        assert_eq!(b.allocated_tiles() % b.granule_tiles, 0, "buffer {}", id);
                    }
                    if b.kind != BufferKind::Relay {
                        assert_eq!(b.allocated_tiles(), old.allocated_tiles());
                    }
                    else {
                        assert!(b.allocated_tiles() >= old.allocated_tiles());
                        if ethernet_only && !e.device.is_ethernet_core(&b.location) {
                            assert_eq!(b.allocated_tiles(), old.allocated_tiles());
                        }
                    }
                }
            }
        }
    }
}

#[test]
fn routes_follow_endpoint_rules() {
    let pass = RoutingPass::new(RoutingConfig::default());
    let mut epochs = synth_set(0..10);
    run_epochs(&pass, &mut epochs).unwrap();
    for e in &epochs {
        for pipe in e.pipes.values() {
            let routing = pipe.routing().unwrap();
            let src = &e.buffers[&pipe.inputs[0]];
            let dst = &e.buffers[&pipe.outputs[0][0]];
            let crosses_ethernet = src.location.chip != dst.location.chip &&
                e.device.is_ethernet_core(&src.location) &&
                e.device.is_ethernet_core(&dst.location);
            let Some(route) = routing.noc else {
                assert!(crosses_ethernet, "pipe {} has no route", pipe.id);
                continue
            };
            assert!(!crosses_ethernet);
            if dst.is_queue() {
                assert_eq!(route.outgoing_vc, VirtualChannel::DramWrite);
                assert_eq!(route.incoming_vc, VirtualChannel::DramWrite);
            }
            else if dst.kind != BufferKind::PrologInter {
                assert_ne!(route.outgoing_vc, VirtualChannel::DramWrite);
            }
            if pipe.is_multicast() {
                assert_eq!(route.outgoing_vc, VirtualChannel::Multicast);
            }
        }
    }
}

#[test]
fn loopback_balancing_never_widens_imbalance() {
    let config = RoutingConfig::default();
    let oracle = AdjacentProducerOracle;
    for mut e in synth_set(0..20) {
        let mut balancer = LoopbackBalancer::new();
        let ids = e.pipes.keys().copied().collect::<Vec<_>>();
        for id in ids {
            let pipe = &e.pipes[&id];
            let class = classify_pipe(&e, pipe, &oracle).unwrap();
            let routing = select_route(&e, pipe, &class, &config).unwrap();
            if let (Some(op), Some(_)) = (&class.dest_op, routing.noc) {
                balancer.record(op, class.dest_input_index, id,
                                class.needs_loopback, class.wants_multicast());
            }
            e.pipe_mut(id).unwrap().assign_routing(routing).unwrap();
        }
        let ops = e.ops.keys().cloned().collect::<Vec<_>>();
        let before = ops.iter().map(|op| balancer.op_load(&e, op).unwrap()).collect::<Vec<_>>();
        balancer.balance(&mut e).unwrap();
        for (op, old) in ops.iter().zip(before) {
            let new = balancer.op_load(&e, op).unwrap();
            assert!(new.imbalance().abs() <= old.imbalance().abs(), "op {}", op);
            assert_eq!(new.inputs, old.inputs);
            assert_eq!(new.loopbacks[0] + new.loopbacks[1], old.loopbacks[0] + old.loopbacks[1]);
        }
    }
}

struct NoSpare;

impl ResourceModel for NoSpare {
    fn available_bytes(&self, _core: &CoreLocation) -> u64 {
        0
    }

    fn reserve_bytes(&mut self, core: &CoreLocation, delta: u64)
                     -> Result<(), CapacityError> {
        Err(CapacityError { core: *core, requested: delta, available: 0 })
    }
}

#[test]
fn upsize_without_spare_l1_changes_nothing() {
    let config = RoutingConfig::default();
    for mut e in synth_set(0..5) {
        let before = e.clone();
        let report = upsize_relay_buffers(&mut e, &mut NoSpare, &config).unwrap();
        assert_eq!(e, before);
        assert_eq!(report.tiles_added(), 0);
    }
}

#[test]
fn relay_upsize_scenario() {
    // granule 4, 64 tiles per epoch, 4 tiles of 1000B placed, 10000B spare
    let mut e = Epoch::new(0, DeviceGrid { l1_size_bytes: 14_000, ..device(4, 4) });
    e.add_buffer(Buffer::new(BufferId(1), BufferKind::Relay, CoreLocation::new(0, 2, 2),
                             1000, 4, 64, 4)).unwrap();
    let mut model = L1ResourceModel::from_epoch(&e).unwrap();
    upsize_relay_buffers(&mut e, &mut model, &RoutingConfig::default()).unwrap();
    assert_eq!(e.buffers[&BufferId(1)].allocated_tiles(), 8);
    assert_eq!(model.allocated_bytes(&CoreLocation::new(0, 2, 2)), 8000);
}

#[test]
fn repeated_runs_are_deterministic() {
    let pass = RoutingPass::new(RoutingConfig {
        upsize_strategy: UpsizeStrategy::Proportional, ..Default::default()
    });
    let mut a = synth_set(0..6);
    let mut b = a.clone();
    let ra = run_epochs(&pass, &mut a).unwrap();
    let rb = run_epochs(&pass, &mut b).unwrap();
    assert_eq!(ra, rb);
    assert_eq!(a, b);
}
