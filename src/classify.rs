// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Pipe classification by endpoint kind and multicast mode.

use crate::error::{Result, RouteError};
use crate::graph::{Buffer, BufferKind, BufferOwner, Epoch, Pipe, QueueLocation};
use crate::grid::{DeviceGrid, Noc};
use crate::mcast::DirectMulticastOracle;
use serde::{Deserialize, Serialize};

/// What sits at one end of a pipe, as far as routing cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointKind {
    Queue,
    Relay,
    PrologInter,
    Op,
}

impl EndpointKind {
    /// Non-queue buffers on ethernet cores are treated as relays so no
    /// op layout is assumed for them.
    fn of(device: &DeviceGrid, buffer: &Buffer) -> EndpointKind {
        match buffer.kind {
            BufferKind::Queue => EndpointKind::Queue,
            _ if device.is_ethernet_core(&buffer.location) => EndpointKind::Relay,
            BufferKind::Relay => EndpointKind::Relay,
            BufferKind::PrologInter => EndpointKind::PrologInter,
            BufferKind::OpInput | BufferKind::OpOutput |
            BufferKind::OpIntermediate => EndpointKind::Op,
        }
    }
}

/// Classification record of one pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeClass {
    pub is_ethernet: bool,
    pub is_pcie: bool,
    pub source_kind: EndpointKind,
    pub dest_kind: EndpointKind,
    /// source is a queue staged into L1 before the epoch.
    pub source_prolog_queue: bool,
    pub source_op: Option<String>,
    pub dest_op: Option<String>,
    pub dest_input_index: usize,
    /// the producer op writes row-major output.
    pub untilize_output: bool,
    pub wants_row_multicast: bool,
    pub wants_col_multicast: bool,
    /// the leg into the consumer op runs on NOC1.
    pub noc1_output: bool,
    pub direct_multicast_eligible: bool,
    pub needs_loopback: bool,
    pub num_timesteps: usize,
}

impl PipeClass {
    pub fn wants_multicast(&self) -> bool {
        self.wants_row_multicast || self.wants_col_multicast
    }
}

/// Queue buffers living in host memory, reached over PCIe.
fn in_host_memory(buffer: &Buffer) -> bool {
    buffer.location.is_system_memory() ||
        matches!(&buffer.queue, Some(q) if q.location == QueueLocation::Host)
}

/// Single-input, single-output transfer between two chips on a device
/// with ethernet links, touching no host memory.
fn is_ethernet_pipe(epoch: &Epoch, pipe: &Pipe) -> Result<bool> {
    if !epoch.device.has_ethernet() || pipe.inputs.len() != 1 ||
        pipe.num_timesteps() != 1 || pipe.timestep_outputs(0).len() != 1
    {
        return Ok(false)
    }
    let src = epoch.pipe_buffer(pipe, pipe.inputs[0])?;
    let dst = epoch.pipe_buffer(pipe, pipe.outputs[0][0])?;
    Ok(!in_host_memory(src) && !dst.location.is_system_memory() &&
       src.location.chip != dst.location.chip)
}

fn all_inputs_same_core(epoch: &Epoch, pipe: &Pipe) -> Result<bool> {
    let mut first = None;
    for &id in &pipe.inputs {
        let loc = epoch.pipe_buffer(pipe, id)?.location;
        match first {
            None => first = Some(loc),
            Some(f) if f != loc => return Ok(false),
            _ => {}
        }
    }
    Ok(true)
}

fn owner_op(buffer: &Buffer) -> Result<&str> {
    match &buffer.owner {
        Some(BufferOwner::Producer(op)) => Ok(op),
        Some(BufferOwner::Consumer { op, .. }) => Ok(op),
        None => Err(RouteError::MissingOwner(buffer.id)),
    }
}

/// Classify `pipe`. The first input and the first output of the first
/// timestep stand for all buffers on that side.
pub fn classify_pipe<O: DirectMulticastOracle + ?Sized>(
    epoch: &Epoch, pipe: &Pipe, oracle: &O
) -> Result<PipeClass> {
    let first_in = pipe.first_input().ok_or(RouteError::EmptyPipe(pipe.id))?;
    let first_out = pipe.first_output().ok_or(RouteError::EmptyPipe(pipe.id))?;
    if pipe.outputs.iter().any(|o| o.is_empty()) {
        return Err(RouteError::EmptyPipe(pipe.id))
    }
    let src = epoch.pipe_buffer(pipe, first_in)?;
    let dst = epoch.pipe_buffer(pipe, first_out)?;
    let device = &epoch.device;

    let mut class = PipeClass {
        is_ethernet: is_ethernet_pipe(epoch, pipe)?,
        is_pcie: false,
        source_kind: EndpointKind::of(device, src),
        dest_kind: EndpointKind::of(device, dst),
        source_prolog_queue: src.is_prolog_queue(),
        source_op: None,
        dest_op: None,
        dest_input_index: 0,
        untilize_output: false,
        wants_row_multicast: false,
        wants_col_multicast: false,
        noc1_output: false,
        direct_multicast_eligible: false,
        needs_loopback: false,
        num_timesteps: pipe.num_timesteps(),
    };
    if class.is_ethernet {
        return Ok(class)
    }
    let chips_differ = src.location.chip != dst.location.chip;
    // reads out of host memory come over PCIe whatever the destination
    class.is_pcie = class.source_kind == EndpointKind::Queue && in_host_memory(src);

    if class.source_kind == EndpointKind::Op {
        let producer = epoch.op(owner_op(src)?)?;
        class.untilize_output = producer.untilize_output;
        class.source_op = Some(producer.name.clone());
    }

    match class.dest_kind {
        EndpointKind::Queue => {
            class.is_pcie |= in_host_memory(dst) || (!device.has_ethernet() && chips_differ);
        }
        EndpointKind::Op => {
            let (consumer, input_index) = match &dst.owner {
                Some(BufferOwner::Consumer { op, input_index }) => (epoch.op(op)?, *input_index),
                _ => return Err(RouteError::MissingOwner(dst.id)),
            };
            class.dest_op = Some(consumer.name.clone());
            class.dest_input_index = input_index;
            let declared = consumer.input_multicast(input_index);
            class.noc1_output = declared.noc1 ||
                (!declared.row && !declared.col &&
                 (consumer.grid_transpose ^ (input_index % 2 == 1)));

            let outputs_mcast = pipe.timestep_outputs(0).len() > 1;
            if outputs_mcast && !declared.row && !declared.col {
                return Err(RouteError::InconsistentMulticast {
                    op: consumer.name.clone(), input_index,
                    reason: "illegal pipe multicast output",
                })
            }
            if pipe.outputs.iter().any(|o| (o.len() > 1) != outputs_mcast) {
                return Err(RouteError::InconsistentMulticast {
                    op: consumer.name.clone(), input_index,
                    reason: "phased pipe with inconsistent output multicast",
                })
            }
            class.wants_row_multicast = declared.row && outputs_mcast;
            class.wants_col_multicast = declared.col && outputs_mcast;
            class.is_pcie |= !device.has_ethernet() && chips_differ;

            let same_core = all_inputs_same_core(epoch, pipe)?;
            if !class.is_pcie && class.source_kind == EndpointKind::Op {
                let producer = epoch.op(owner_op(src)?)?;
                let adjacent = oracle.direct_multicast_possible(
                    device, producer, consumer,
                    class.wants_row_multicast, class.wants_col_multicast, declared.noc1);
                if let Some(noc) = adjacent {
                    if class.num_timesteps == 1 && same_core {
                        class.direct_multicast_eligible = true;
                        class.noc1_output = noc == Noc::Noc1;
                    }
                }
            }
            class.needs_loopback =
                (class.wants_multicast() && !class.direct_multicast_eligible) ||
                class.num_timesteps != 1 || !same_core;
        }
        EndpointKind::Relay | EndpointKind::PrologInter => {}
    }

    clilog::trace!("pipe {} class: {:?}", pipe.id, class);
    Ok(class)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{BufferId, InputMulticast, OpPlacement, PipeId, QueueInfo};
    use crate::grid::{CoreLocation, GridCoord, SYSTEM_MEMORY_COORD};
    use crate::mcast::AdjacentProducerOracle;

    fn epoch(ethernet: bool) -> Epoch {
        let mut e = Epoch::new(0, DeviceGrid {
            grid_size_x: 8,
            grid_size_y: 10,
            ethernet_cores: if ethernet { vec![GridCoord::new(0, 0)] } else { vec![] },
            l1_size_bytes: 1 << 20,
            l1_reserved_bytes: 0,
        });
        e.add_op(OpPlacement::new("prod", 0, (1, 2), (1, 2))).unwrap();
        e.add_op(OpPlacement::new("cons", 0, (2, 2), (3, 2)).with_inputs(vec![
            InputMulticast { row: true, col: false, noc1: false },
            InputMulticast::default(),
        ])).unwrap();
        e
    }

    fn op_out(id: u64, x: u32, y: u32) -> Buffer {
        Buffer::new(BufferId(id), BufferKind::OpOutput, CoreLocation::new(0, x, y), 1024, 1, 8, 2)
            .with_owner(BufferOwner::Producer("prod".into()))
    }

    fn op_in(id: u64, x: u32, y: u32, input_index: usize) -> Buffer {
        Buffer::new(BufferId(id), BufferKind::OpInput, CoreLocation::new(0, x, y), 1024, 1, 8, 2)
            .with_owner(BufferOwner::Consumer { op: "cons".into(), input_index })
    }

    #[test]
    fn direct_row_multicast() {
        let mut e = epoch(false);
        e.add_buffer(op_out(1, 1, 2)).unwrap();
        for (i, x) in (2..5).enumerate() {
            e.add_buffer(op_in(10 + i as u64, x, 2, 0)).unwrap();
        }
        let pipe = Pipe::new(PipeId(1), vec![BufferId(1)],
                             vec![BufferId(10), BufferId(11), BufferId(12)]);
        let class = classify_pipe(&e, &pipe, &AdjacentProducerOracle).unwrap();
        assert!(class.wants_row_multicast);
        assert!(class.direct_multicast_eligible);
        assert!(!class.needs_loopback);
        assert!(!class.noc1_output);
    }

    #[test]
    fn gather_needs_loopback() {
        let mut e = epoch(false);
        e.add_buffer(op_out(1, 1, 2)).unwrap();
        e.add_buffer(op_out(2, 1, 3)).unwrap();
        e.add_buffer(op_in(10, 2, 2, 1)).unwrap();
        let pipe = Pipe::new(PipeId(1), vec![BufferId(1), BufferId(2)], vec![BufferId(10)]);
        let class = classify_pipe(&e, &pipe, &AdjacentProducerOracle).unwrap();
        assert!(!class.wants_multicast());
        assert!(class.needs_loopback);
        // odd input index of an untransposed op
        assert!(class.noc1_output);
    }

    #[test]
    fn multicast_into_unicast_input_is_fatal() {
        let mut e = epoch(false);
        e.add_buffer(op_out(1, 1, 2)).unwrap();
        e.add_buffer(op_in(10, 2, 2, 1)).unwrap();
        e.add_buffer(op_in(11, 3, 2, 1)).unwrap();
        let pipe = Pipe::new(PipeId(1), vec![BufferId(1)], vec![BufferId(10), BufferId(11)]);
        assert!(matches!(classify_pipe(&e, &pipe, &AdjacentProducerOracle),
                         Err(RouteError::InconsistentMulticast { .. })));
    }

    #[test]
    fn phased_multicast_must_agree() {
        let mut e = epoch(false);
        e.add_buffer(op_out(1, 1, 2)).unwrap();
        e.add_buffer(op_in(10, 2, 2, 0)).unwrap();
        e.add_buffer(op_in(11, 3, 2, 0)).unwrap();
        e.add_buffer(op_in(12, 4, 2, 0)).unwrap();
        let pipe = Pipe::new_scatter(PipeId(1), vec![BufferId(1)],
                                     vec![vec![BufferId(10), BufferId(11)], vec![BufferId(12)]]);
        assert!(matches!(classify_pipe(&e, &pipe, &AdjacentProducerOracle),
                         Err(RouteError::InconsistentMulticast { .. })));
    }

    #[test]
    fn cross_chip_pipes() {
        let relay = |id, chip| Buffer::new(BufferId(id), BufferKind::Relay,
                                           CoreLocation::new(chip, 3, 3), 1024, 1, 8, 2);
        let mut e = epoch(true);
        e.add_buffer(relay(1, 0)).unwrap();
        e.add_buffer(relay(2, 1)).unwrap();
        let pipe = Pipe::new(PipeId(1), vec![BufferId(1)], vec![BufferId(2)]);
        let class = classify_pipe(&e, &pipe, &AdjacentProducerOracle).unwrap();
        assert!(class.is_ethernet && !class.is_pcie);

        let mut e = epoch(false);
        e.add_buffer(relay(1, 0)).unwrap();
        e.add_buffer(Buffer::new(BufferId(2), BufferKind::Queue, CoreLocation::new(1, 0, 0), 1024, 1, 8, 8)
                     .with_queue(QueueInfo { name: "out".into(), location: QueueLocation::Dram, prolog: false }))
            .unwrap();
        let pipe = Pipe::new(PipeId(1), vec![BufferId(1)], vec![BufferId(2)]);
        let class = classify_pipe(&e, &pipe, &AdjacentProducerOracle).unwrap();
        assert!(!class.is_ethernet && class.is_pcie);
    }

    #[test]
    fn empty_timestep_is_fatal() {
        let mut e = epoch(false);
        e.add_buffer(op_out(1, 1, 2)).unwrap();
        e.add_buffer(op_in(2, 2, 2, 1)).unwrap();
        let pipe = Pipe::new_scatter(PipeId(1), vec![BufferId(1)], vec![vec![BufferId(2)], vec![]]);
        assert!(matches!(classify_pipe(&e, &pipe, &AdjacentProducerOracle),
                         Err(RouteError::EmptyPipe(PipeId(1)))));
    }

    #[test]
    fn host_queue_reads_are_pcie() {
        for ethernet in [false, true] {
            let mut e = epoch(ethernet);
            e.add_buffer(Buffer::new(BufferId(1), BufferKind::Queue,
                                     CoreLocation::new(0, SYSTEM_MEMORY_COORD, SYSTEM_MEMORY_COORD),
                                     1024, 1, 8, 8)
                         .with_queue(QueueInfo { name: "act".into(), location: QueueLocation::Host, prolog: false }))
                .unwrap();
            e.add_buffer(op_in(2, 3, 3, 1)).unwrap();
            let pipe = Pipe::new(PipeId(1), vec![BufferId(1)], vec![BufferId(2)]);
            let class = classify_pipe(&e, &pipe, &AdjacentProducerOracle).unwrap();
            assert!(class.is_pcie && !class.is_ethernet);
            assert_eq!(class.source_kind, EndpointKind::Queue);
            assert_eq!(class.dest_op.as_deref(), Some("cons"));
        }
    }

    #[test]
    fn ethernet_core_buffers_are_relays() {
        let mut e = epoch(true);
        e.add_buffer(op_out(1, 0, 0)).unwrap();
        e.add_buffer(Buffer::new(BufferId(2), BufferKind::Relay, CoreLocation::new(0, 4, 4), 1024, 1, 8, 2))
            .unwrap();
        let pipe = Pipe::new(PipeId(1), vec![BufferId(1)], vec![BufferId(2)]);
        let class = classify_pipe(&e, &pipe, &AdjacentProducerOracle).unwrap();
        assert_eq!(class.source_kind, EndpointKind::Relay);
        assert_eq!(class.source_op, None);
    }
}
