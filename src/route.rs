// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Network and virtual channel selection for a classified pipe.
//!
//! The interesting case is a pipe between two ops on the same chip.
//! The producer and consumer rectangles are compared axis by axis on
//! the wrapping mesh, the network is picked from their relative
//! position, and every source/destination path is checked against the
//! bounding box that network would sweep. Paths outside the box still
//! get the chosen network; the pipe is then reported as best effort.

use crate::classify::{EndpointKind, PipeClass};
use crate::config::{DramRoutingScheme, RoutingConfig};
use crate::error::{Result, RouteError};
use crate::graph::{Epoch, NocRoute, OpPlacement, Pipe, PipeRouting, RoutingOutcome, VirtualChannel};
use crate::grid::{in_coord_interval, DeviceGrid, GridCoord, Noc};

/// Overlap of the consumer span with the producer span on one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AxisOverlap {
    /// consumer cells inside the producer span.
    pub size: u32,
    /// consumer cells before the first overlapping one.
    pub pre: u32,
    /// consumer cells after the overlap started that are outside it.
    pub post: u32,
}

impl AxisOverlap {
    fn measure(prod_start: u32, prod_end: u32,
               cons_start: u32, cons_size: u32, grid_size: u32) -> AxisOverlap {
        let mut ov = AxisOverlap::default();
        for c in 0..cons_size {
            let n = (cons_start + c) % grid_size;
            if in_coord_interval(prod_start, prod_end, n) {
                if ov.size == 0 {
                    ov.pre = c;
                }
                ov.size += 1;
            }
            else if ov.size > 0 {
                ov.post += 1;
            }
        }
        ov
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpOverlap {
    pub x: AxisOverlap,
    pub y: AxisOverlap,
}

/// Measure how the consumer grid overlaps the producer grid.
///
/// At most one axis may overlap. Overlap on both axes means the two
/// ops share cores, which placement never allows.
pub fn check_op_overlap(
    device: &DeviceGrid, producer: &OpPlacement, consumer: &OpPlacement
) -> Result<OpOverlap> {
    let x = AxisOverlap::measure(producer.grid_loc_x, producer.grid_end_x(),
                                 consumer.grid_loc_x, consumer.grid_size_x,
                                 device.grid_size_x);
    let y = AxisOverlap::measure(producer.grid_loc_y, producer.grid_end_y(),
                                 consumer.grid_loc_y, consumer.grid_size_y,
                                 device.grid_size_y);
    if x.size > 0 && y.size > 0 {
        return Err(RouteError::PlacementOverlap {
            producer: producer.name.clone(),
            consumer: consumer.name.clone(),
            x_overlap: x.size,
            y_overlap: y.size,
        })
    }
    Ok(OpOverlap { x, y })
}

/// Rectangle a route must stay inside, given in NOC0 orientation even
/// for NOC1 routes. `end < start` wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x_start: u32,
    pub y_start: u32,
    pub x_end: u32,
    pub y_end: u32,
}

/// Does the path from `src` to `dst` on `noc` make monotonic progress
/// inside `bbox`?
pub fn check_noc_bbox_fit(bbox: &BoundingBox, noc: Noc, src: GridCoord, dst: GridCoord) -> bool {
    let axis_fit = |start: u32, end: u32, s: u32, d: u32| {
        in_coord_interval(start, end, s) && match noc {
            Noc::Noc0 => in_coord_interval(s, end, d),
            Noc::Noc1 => in_coord_interval(start, s, d),
        }
    };
    axis_fit(bbox.x_start, bbox.x_end, src.x, dst.x) &&
        axis_fit(bbox.y_start, bbox.y_end, src.y, dst.y)
}

/// Span of one op rectangle on one axis.
#[derive(Clone, Copy)]
struct Span {
    start: u32,
    end: u32,
    size: u32,
}

fn x_span(op: &OpPlacement) -> Span {
    Span { start: op.grid_loc_x, end: op.grid_end_x(), size: op.grid_size_x }
}

fn y_span(op: &OpPlacement) -> Span {
    Span { start: op.grid_loc_y, end: op.grid_end_y(), size: op.grid_size_y }
}

/// Network and bounding box for a pair of ops overlapping on one axis.
///
/// `ov` is the overlapping axis, `other` the network is decided on.
/// Returns the box as (overlapping axis start/end, other axis start/end).
fn one_axis_route(
    device: &DeviceGrid, pipe: &Pipe, ov: AxisOverlap,
    src_ov: Span, dst_ov: Span, src_other: Span, dst_other: Span, other_grid: u32
) -> Result<(Noc, (u32, u32), (u32, u32))> {
    let source_subsumes = ov.size == dst_ov.size;
    let dest_subsumes = ov.size == src_ov.size;
    if source_subsumes || dest_subsumes {
        let d0 = device.noc0_axis_distance(src_other.end, dst_other.start, other_grid);
        let d1 = device.noc1_axis_distance(src_other.start, dst_other.end, other_grid);
        let noc = Noc::noc1_if(d0 > d1);
        let other = match noc {
            Noc::Noc1 => (dst_other.start, src_other.end),
            Noc::Noc0 => (src_other.start, dst_other.end),
        };
        let contained = if source_subsumes { src_ov } else { dst_ov };
        return Ok((noc, (contained.start, contained.end), other))
    }
    if (ov.pre > 0) == (ov.post > 0) {
        return Err(RouteError::GeometryInvariant {
            pipe: pipe.id,
            reason: format!("partial overlap of size {} with {} cells before and {} after",
                            ov.size, ov.pre, ov.post),
        })
    }
    if ov.pre > 0 {
        // consumer leads: sweep backwards from it to the producer end
        Ok((Noc::Noc1, (dst_ov.start, src_ov.end), (dst_other.start, src_other.end)))
    }
    else {
        Ok((Noc::Noc0, (src_ov.start, dst_ov.end), (src_other.start, dst_other.end)))
    }
}

/// Network between two ops on one chip, with the bounding box its
/// paths must fit in. No box is returned when the grids do not overlap
/// on any axis.
fn op_to_op_noc(
    device: &DeviceGrid, pipe: &Pipe, producer: &OpPlacement, consumer: &OpPlacement
) -> Result<(Noc, Option<BoundingBox>)> {
    let overlap = check_op_overlap(device, producer, consumer)?;
    if overlap.x.size == 0 && overlap.y.size == 0 {
        let d0 = device.noc0_distance(
            GridCoord::new(producer.grid_end_x(), producer.grid_end_y()),
            GridCoord::new(consumer.grid_loc_x, consumer.grid_loc_y));
        let d1 = device.noc1_distance(
            GridCoord::new(producer.grid_loc_x, producer.grid_loc_y),
            GridCoord::new(consumer.grid_end_x(), consumer.grid_end_y()));
        clilog::debug!("pipe {}: no grid overlap, noc0 distance {}, noc1 distance {}",
                       pipe.id, d0, d1);
        return Ok((Noc::noc1_if(d0 > d1), None))
    }
    let (noc, bbox) = if overlap.x.size > 0 {
        let (noc, x, y) = one_axis_route(
            device, pipe, overlap.x,
            x_span(producer), x_span(consumer),
            y_span(producer), y_span(consumer), device.grid_size_y)?;
        (noc, BoundingBox { x_start: x.0, x_end: x.1, y_start: y.0, y_end: y.1 })
    }
    else {
        let (noc, y, x) = one_axis_route(
            device, pipe, overlap.y,
            y_span(producer), y_span(consumer),
            x_span(producer), x_span(consumer), device.grid_size_x)?;
        (noc, BoundingBox { x_start: x.0, x_end: x.1, y_start: y.0, y_end: y.1 })
    };
    clilog::debug!("pipe {}: {} bounding box x={}..{} y={}..{}",
                   pipe.id, noc, bbox.x_start, bbox.x_end, bbox.y_start, bbox.y_end);
    Ok((noc, Some(bbox)))
}

/// Count input/output paths that leave `bbox` on `noc`.
///
/// A multicast is checked up to the core implementing the timestep,
/// a unicast up to the first output buffer of the timestep.
fn count_unfit_paths(
    epoch: &Epoch, pipe: &Pipe, multicast: bool, bbox: &BoundingBox, noc: Noc
) -> Result<u32> {
    let mut unfit = 0;
    for (p, outputs) in pipe.outputs.iter().enumerate() {
        let first = outputs.first().copied().ok_or(RouteError::EmptyPipe(pipe.id))?;
        let first_out = epoch.pipe_buffer(pipe, first)?.location;
        let dst = match pipe.locations.get(p) {
            Some(loc) if multicast => loc.coord(),
            _ => first_out.coord(),
        };
        for &input in &pipe.inputs {
            let src = epoch.pipe_buffer(pipe, input)?.location.coord();
            let fit = check_noc_bbox_fit(bbox, noc, src, dst);
            clilog::trace!("pipe {} timestep {}: ({},{}) -> ({},{}) fit={}",
                           pipe.id, p, src.x, src.y, dst.x, dst.y, fit);
            if !fit {
                unfit += 1;
            }
        }
    }
    Ok(unfit)
}

fn noc_route(incoming_noc: Noc, outgoing_noc: Noc,
             incoming_vc: VirtualChannel, outgoing_vc: VirtualChannel) -> NocRoute {
    NocRoute { incoming_noc, outgoing_noc, incoming_vc, outgoing_vc }
}

/// Decide the routing of one classified pipe.
///
/// Cases are tried in order: ethernet, PCIe, write to a queue, read
/// from a queue, read from a prolog intermediate, relay endpoints, and
/// finally op to op.
pub fn select_route(
    epoch: &Epoch, pipe: &Pipe, class: &PipeClass, config: &RoutingConfig
) -> Result<PipeRouting> {
    let device = &epoch.device;
    let first_in = pipe.first_input().ok_or(RouteError::EmptyPipe(pipe.id))?;
    let first_out = pipe.first_output().ok_or(RouteError::EmptyPipe(pipe.id))?;
    let src = epoch.pipe_buffer(pipe, first_in)?.location;
    let dst = epoch.pipe_buffer(pipe, first_out)?.location;

    let out_noc = Noc::noc1_if(class.noc1_output);
    let out_vc = VirtualChannel::tensix_data(class.wants_multicast());
    let tensix = |incoming: Noc, outgoing: Noc| {
        noc_route(incoming, outgoing, VirtualChannel::Unicast, out_vc)
    };
    let mut outcome = RoutingOutcome::Exact;

    let route = if class.is_ethernet {
        None
    }
    else if class.is_pcie {
        // PCIe can only issue static-VC writes on the DRAM write channel
        Some(if class.dest_kind == EndpointKind::Queue {
            noc_route(Noc::Noc0, Noc::Noc0, VirtualChannel::DramWrite, VirtualChannel::DramWrite)
        }
        else {
            noc_route(Noc::Noc0, out_noc, VirtualChannel::DramWrite, out_vc)
        })
    }
    else if class.dest_kind == EndpointKind::Queue {
        let noc = if class.untilize_output {
            // untilizing writer firmware only runs on NOC0
            Noc::Noc0
        }
        else {
            match config.dram_routing {
                DramRoutingScheme::Proximity => device.shortest_path_noc(src.coord(), dst.coord()),
                DramRoutingScheme::FixedSplit => Noc::Noc1,
                DramRoutingScheme::NoRelay => Noc::Noc0,
            }
        };
        Some(noc_route(noc, noc, VirtualChannel::DramWrite, VirtualChannel::DramWrite))
    }
    else if class.source_kind == EndpointKind::Queue {
        if class.source_prolog_queue {
            if class.dest_kind == EndpointKind::PrologInter {
                Some(noc_route(Noc::Noc0, Noc::Noc0,
                               VirtualChannel::DramWrite, VirtualChannel::DramWrite))
            }
            else {
                Some(tensix(out_noc.other(), out_noc))
            }
        }
        else {
            let incoming = match config.dram_routing {
                DramRoutingScheme::Proximity => {
                    let first_core = pipe.locations.first().copied().unwrap_or(dst);
                    device.shortest_path_noc(src.coord(), first_core.coord())
                }
                DramRoutingScheme::FixedSplit | DramRoutingScheme::NoRelay => Noc::Noc0,
            };
            let outgoing = if class.dest_kind == EndpointKind::Relay { Noc::Noc0 } else { out_noc };
            Some(tensix(incoming, outgoing))
        }
    }
    else if class.source_kind == EndpointKind::PrologInter {
        Some(tensix(out_noc.other(), out_noc))
    }
    else if class.source_kind == EndpointKind::Relay ||
        class.dest_kind == EndpointKind::Relay ||
        class.dest_kind == EndpointKind::PrologInter
    {
        Some(tensix(device.shortest_path_noc(src.coord(), dst.coord()), out_noc))
    }
    else {
        let producer = epoch.op(class.source_op.as_deref()
                                .ok_or(RouteError::MissingOwner(first_in))?)?;
        let consumer = epoch.op(class.dest_op.as_deref()
                                .ok_or(RouteError::MissingOwner(first_out))?)?;
        let incoming = if producer.chip != consumer.chip {
            device.shortest_path_noc(src.coord(), dst.coord())
        }
        else {
            let (noc, bbox) = op_to_op_noc(device, pipe, producer, consumer)?;
            if let Some(bbox) = bbox {
                let unfit = count_unfit_paths(epoch, pipe, class.wants_multicast(), &bbox, noc)?;
                if unfit > 0 {
                    clilog::warn!(ROUTE_BBOX_MISS,
                                  "pipe {} ({} -> {}): {} paths leave the {} bounding box, \
                                   routing on it anyway",
                                  pipe.id, producer.name, consumer.name, unfit, noc);
                    outcome = RoutingOutcome::BestEffort { unfit_paths: unfit };
                }
            }
            noc
        };
        Some(tensix(incoming, out_noc))
    };

    if let Some(r) = &route {
        clilog::debug!("pipe {}: in {} vc{}, out {} vc{}",
                       pipe.id, r.incoming_noc, r.incoming_vc.number(),
                       r.outgoing_noc, r.outgoing_vc.number());
    }
    Ok(PipeRouting {
        noc: route,
        direct_multicast: class.direct_multicast_eligible,
        outcome,
        loopback_rebalanced: false,
    })
}
