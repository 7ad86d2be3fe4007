// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use nocroute::graph::Epoch;
use nocroute::synth::{synth_epoch, SynthParams};

#[derive(clap::Parser, Debug)]
struct SynthArgs {
    /// Output path for the serialized epochs.
    output: PathBuf,
    /// Number of epochs to generate.
    #[clap(long, default_value_t = 1)]
    num_epochs: usize,
    #[clap(long, default_value_t = 8026727)]
    seed: u64,
    #[clap(long, default_value_t = 12)]
    grid_size_x: u32,
    #[clap(long, default_value_t = 10)]
    grid_size_y: u32,
    /// Length of the op chain in each epoch.
    #[clap(long, default_value_t = 4)]
    num_ops: usize,
    /// With more than one chip, the last op also feeds chip 1.
    #[clap(long, default_value_t = 1)]
    num_chips: u32,
    /// Place ethernet cores on row 0 and link chips through them.
    #[clap(long)]
    ethernet: bool,
}

fn main() {
    clilog::init_stderr_color_debug();
    let args = <SynthArgs as clap::Parser>::parse();
    clilog::info!("synth args:\n{:#?}", args);

    let params = SynthParams {
        seed: args.seed,
        grid_size_x: args.grid_size_x,
        grid_size_y: args.grid_size_y,
        num_ops: args.num_ops,
        num_chips: args.num_chips,
        ethernet: args.ethernet,
        ..Default::default()
    };
    let timer = clilog::stimer!("synthesize epochs");
    let epochs = match (0..args.num_epochs)
        .map(|i| synth_epoch(&params, i))
        .collect::<nocroute::error::Result<Vec<Epoch>>>()
    {
        Ok(epochs) => epochs,
        Err(e) => {
            clilog::error!("cannot synthesize epochs: {}", e);
            std::process::exit(1);
        }
    };
    clilog::finish!(timer);

    if let Err(e) = Epoch::write_all(&args.output, &epochs) {
        clilog::error!("cannot write epochs to {}: {}", args.output.display(), e);
        std::process::exit(1);
    }
    clilog::info!("{} epochs written to {}", epochs.len(), args.output.display());
}
