// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use itertools::Itertools;
use nocroute::config::{DramRoutingScheme, RoutingConfig, UpsizeStrategy,
                       INCOMING_BYTES_PER_CYCLE, KERNEL_INPUT_MIN_LATENCY_CYCLES};
use nocroute::graph::Epoch;
use nocroute::pass::{run_epochs, RoutingPass};

#[derive(clap::Parser, Debug)]
struct RouteArgs {
    /// Input path of the serialized epochs.
    epochs: PathBuf,
    /// Output path for the routed epochs.
    output: PathBuf,
    /// How relay buffers on one core share its spare L1.
    #[clap(long, value_enum, default_value_t)]
    upsize_strategy: UpsizeStrategy,
    /// Only upsize relay buffers on ethernet cores.
    #[clap(long)]
    ethernet_only: bool,
    /// Network selection for DRAM queue reads and writes.
    #[clap(long, value_enum, default_value_t)]
    dram_routing: DramRoutingScheme,
    /// Cycles of producer latency a relay buffer should cover.
    #[clap(long, default_value_t = KERNEL_INPUT_MIN_LATENCY_CYCLES)]
    min_latency_cycles: u64,
    /// Assumed incoming bandwidth, in bytes per cycle.
    #[clap(long, default_value_t = INCOMING_BYTES_PER_CYCLE)]
    incoming_bytes_per_cycle: u64,
}

fn main() {
    clilog::init_stderr_color_debug();
    let args = <RouteArgs as clap::Parser>::parse();
    clilog::info!("route args:\n{:#?}", args);

    let config = RoutingConfig {
        upsize_strategy: args.upsize_strategy,
        ethernet_only: args.ethernet_only,
        dram_routing: args.dram_routing,
        min_latency_cycles: args.min_latency_cycles,
        incoming_bytes_per_cycle: args.incoming_bytes_per_cycle,
    };

    let timer_load = clilog::stimer!("load epochs");
    let mut epochs = match Epoch::read_all(&args.epochs) {
        Ok(epochs) => epochs,
        Err(e) => {
            clilog::error!("cannot read epochs from {}: {}", args.epochs.display(), e);
            std::process::exit(1);
        }
    };
    clilog::finish!(timer_load);
    clilog::info!("loaded {} epochs", epochs.len());

    let pass = RoutingPass::new(config);
    let reports = match run_epochs(&pass, &mut epochs) {
        Ok(reports) => reports,
        Err(e) => {
            clilog::error!("routing failed: {}", e);
            std::process::exit(1);
        }
    };
    for report in &reports {
        println!("{}", report);
    }
    let best_effort = reports.iter()
        .filter(|r| r.routes.best_effort > 0)
        .map(|r| r.epoch)
        .collect::<Vec<_>>();
    if !best_effort.is_empty() {
        clilog::warn!(ROUTE_BEST_EFFORT, "best effort routes in epochs {}",
                      best_effort.iter().format(", "));
    }

    if let Err(e) = Epoch::write_all(&args.output, &epochs) {
        clilog::error!("cannot write routed epochs to {}: {}", args.output.display(), e);
        std::process::exit(1);
    }
    clilog::info!("routed epochs written to {}", args.output.display());
}
