// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 itsakeyfut
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! gsrx replay tool
//!
//! Replays a raw GIF dump (16-byte-aligned qwords, little endian) through
//! the renderer thread with a headless backend and prints per-run
//! statistics. Useful for profiling the decision engines and validating
//! dumps without a display.

use std::path::PathBuf;

use clap::Parser;

use gsrx::core::config::RendererConfig;
use gsrx::core::device::NullDevice;
use gsrx::core::thread::RenderThread;

#[derive(Parser)]
#[command(name = "gsrx-replay", about = "Replay a raw GIF dump through the renderer")]
struct Args {
    /// Raw GIF dump file (qwords, little endian)
    dump: PathBuf,

    /// Renderer configuration TOML
    #[arg(long)]
    config: Option<PathBuf>,

    /// Insert a vertical sync every N qwords (0 = one at the end)
    #[arg(long, default_value_t = 0)]
    vsync_every: usize,

    /// Qwords submitted per queue command
    #[arg(long, default_value_t = 1024)]
    chunk: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => RendererConfig::load(path)?,
        None => RendererConfig::default(),
    };

    let bytes = std::fs::read(&args.dump)?;
    if bytes.len() % 16 != 0 {
        log::warn!(
            "Dump length {} is not a multiple of 16; trailing bytes ignored",
            bytes.len()
        );
    }
    let qwords: Vec<u128> = bytes
        .chunks_exact(16)
        .map(|c| {
            let mut qword = [0u8; 16];
            qword.copy_from_slice(c);
            u128::from_le_bytes(qword)
        })
        .collect();
    log::info!("Replaying {} qwords from {}", qwords.len(), args.dump.display());

    let thread = RenderThread::spawn(config, NullDevice::default())?;
    let mut since_vsync = 0usize;
    for chunk in qwords.chunks(args.chunk.max(1)) {
        thread.submit(chunk.to_vec())?;
        since_vsync += chunk.len();
        if args.vsync_every > 0 && since_vsync >= args.vsync_every {
            thread.vsync()?;
            since_vsync = 0;
        }
    }
    thread.vsync()?;
    let stats = thread.shutdown()?;

    println!("qwords:            {}", qwords.len());
    println!("draws:             {}", stats.draws);
    println!("draw calls:        {}", stats.draw_calls);
    println!("clears:            {}", stats.clears);
    println!("cpu blits:         {}", stats.cpu_blits);
    println!("clut draws:        {}", stats.clut_draws);
    println!("texture shuffles:  {}", stats.texture_shuffles);
    println!("channel shuffles:  {}", stats.channel_shuffles);
    println!("two-pass draws:    {}", stats.two_pass);
    println!("barrier draws:     {}", stats.barrier_draws);
    println!("skipped:           {}", stats.skipped);
    println!("vsyncs:            {}", stats.vsyncs);

    Ok(())
}
