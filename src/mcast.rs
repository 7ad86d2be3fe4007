// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Op adjacency test for direct multicast.
//!
//! A direct multicast is sent straight out of the producer buffer to a
//! whole row or column of consumer cores, skipping the gather stage.
//! Whether the two op grids allow this is a property of the placement
//! alone and is delegated to a [DirectMulticastOracle].

use crate::graph::OpPlacement;
use crate::grid::{DeviceGrid, Noc};

pub trait DirectMulticastOracle {
    /// The network a direct multicast from `producer` into `consumer`
    /// travels on, or `None` if the grids do not allow one.
    fn direct_multicast_possible(
        &self, device: &DeviceGrid,
        producer: &OpPlacement, consumer: &OpPlacement,
        row_mcast: bool, col_mcast: bool, noc1_mcast: bool
    ) -> Option<Noc>;
}

/// Accepts a producer that is one core thick and sits right next to
/// the consumer along the multicast direction.
///
/// For a row multicast the producer is a single column spanning the
/// same rows as the consumer. Placed just before the consumer's first
/// column it reaches every consumer core on NOC0; placed just after the
/// last column (with wraparound) it does so on NOC1. Column multicast
/// is the same with the axes swapped.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdjacentProducerOracle;

impl AdjacentProducerOracle {
    fn side(
        noc1_mcast: bool, grid_size: u32,
        prod_start: u32, cons_start: u32, cons_end: u32
    ) -> Option<Noc> {
        if !noc1_mcast && (prod_start + 1) % grid_size == cons_start {
            Some(Noc::Noc0)
        }
        else if (cons_end + 1) % grid_size == prod_start {
            Some(Noc::Noc1)
        }
        else {
            None
        }
    }
}

impl DirectMulticastOracle for AdjacentProducerOracle {
    fn direct_multicast_possible(
        &self, device: &DeviceGrid,
        producer: &OpPlacement, consumer: &OpPlacement,
        row_mcast: bool, col_mcast: bool, noc1_mcast: bool
    ) -> Option<Noc> {
        if producer.chip != consumer.chip || row_mcast == col_mcast {
            return None
        }
        if row_mcast {
            if producer.grid_size_x != 1 ||
                producer.grid_loc_y != consumer.grid_loc_y ||
                producer.grid_size_y != consumer.grid_size_y
            {
                return None
            }
            Self::side(noc1_mcast, device.grid_size_x,
                       producer.grid_loc_x, consumer.grid_loc_x, consumer.grid_end_x())
        }
        else {
            if producer.grid_size_y != 1 ||
                producer.grid_loc_x != consumer.grid_loc_x ||
                producer.grid_size_x != consumer.grid_size_x
            {
                return None
            }
            Self::side(noc1_mcast, device.grid_size_y,
                       producer.grid_loc_y, consumer.grid_loc_y, consumer.grid_end_y())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceGrid {
        DeviceGrid {
            grid_size_x: 8,
            grid_size_y: 10,
            ethernet_cores: vec![],
            l1_size_bytes: 1 << 20,
            l1_reserved_bytes: 0,
        }
    }

    #[test]
    fn row_producer_on_the_left() {
        let d = device();
        let prod = OpPlacement::new("a", 0, (1, 2), (1, 3));
        let cons = OpPlacement::new("b", 0, (2, 2), (4, 3));
        let o = AdjacentProducerOracle;
        assert_eq!(o.direct_multicast_possible(&d, &prod, &cons, true, false, false), Some(Noc::Noc0));
        assert_eq!(o.direct_multicast_possible(&d, &prod, &cons, true, false, true), None);
        assert_eq!(o.direct_multicast_possible(&d, &prod, &cons, false, true, false), None);
        assert_eq!(o.direct_multicast_possible(&d, &prod, &cons, true, true, false), None);
    }

    #[test]
    fn row_producer_wraps_on_the_right() {
        let d = device();
        let prod = OpPlacement::new("a", 0, (0, 0), (1, 2));
        let cons = OpPlacement::new("b", 0, (4, 0), (4, 2));
        let o = AdjacentProducerOracle;
        assert_eq!(o.direct_multicast_possible(&d, &prod, &cons, true, false, true), Some(Noc::Noc1));
    }

    #[test]
    fn col_producer_needs_matching_columns() {
        let d = device();
        let cons = OpPlacement::new("b", 0, (3, 4), (2, 3));
        let above = OpPlacement::new("a", 0, (3, 3), (2, 1));
        let shifted = OpPlacement::new("c", 0, (2, 3), (2, 1));
        let o = AdjacentProducerOracle;
        assert_eq!(o.direct_multicast_possible(&d, &above, &cons, false, true, false), Some(Noc::Noc0));
        assert_eq!(o.direct_multicast_possible(&d, &shifted, &cons, false, true, false), None);
    }
}
