// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! NOC routing for the data-movement pipes of a placed epoch.
//!
//! Each pipe gets an incoming and an outgoing network with virtual
//! channels, loopback traffic is balanced per op, and relay buffers
//! are grown into the spare L1 of their cores.

pub mod error;

pub mod config;

pub mod grid;

pub mod graph;

pub mod resource;

pub mod mcast;

pub mod classify;

pub mod route;

pub mod loopback;

pub mod upsize;

pub mod pass;

pub mod synth;
