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

//! The renderer thread
//!
//! The emulation core produces GIF data; one dedicated thread consumes it
//! through a bounded channel and drives the [`Renderer`]. Commands are
//! processed strictly in submission order; the producer blocks only when
//! the queue is full (or, in synchronous mode, until each command has
//! been fully processed, which trades throughput for debuggability).
//!
//! The renderer, its cache and the device backend live entirely on the
//! spawned thread; nothing else touches them. A reset command drains
//! whatever the queue ordering delivers before it and discards all cache
//! state; no draw resumes across a reset.

use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::core::config::RendererConfig;
use crate::core::device::DeviceBackend;
use crate::core::error::{GsError, Result};
use crate::core::renderer::{Renderer, RenderStats};

/// Commands accepted by the renderer thread
pub enum GsCommand {
    /// Raw GIF qwords in submission order
    Qwords(Vec<u128>),
    /// Vertical sync: flush and age the cache
    Vsync,
    /// Drop the cache and all in-flight state
    Reset,
    /// Freeze the machine; the blob returns on the channel
    Freeze(Sender<Result<Vec<u8>>>),
    /// Restore the machine from a blob; the outcome returns on the channel
    Defrost(Vec<u8>, Sender<Result<()>>),
    /// Process everything queued so far, then exit
    Shutdown,
}

/// Handle owned by the producer side
///
/// Dropping the handle without [`RenderThread::shutdown`] detaches the
/// thread; it exits when the channel disconnects.
pub struct RenderThread {
    sender: Sender<GsCommand>,
    ack: Receiver<()>,
    synchronous: bool,
    handle: Option<JoinHandle<RenderStats>>,
}

impl RenderThread {
    /// Spawn the renderer thread over a device backend
    pub fn spawn<D>(config: RendererConfig, device: D) -> Result<Self>
    where
        D: DeviceBackend + Send + 'static,
    {
        let depth = config.queue.depth.max(1);
        let synchronous = config.queue.synchronous;
        let (sender, receiver) = bounded::<GsCommand>(depth);
        let (ack_tx, ack_rx) = bounded::<()>(depth);

        let handle = std::thread::Builder::new()
            .name("gs-renderer".into())
            .spawn(move || run(config, device, receiver, ack_tx, synchronous))?;

        log::info!(
            "Renderer thread started (queue depth {depth}, synchronous={synchronous})"
        );
        Ok(Self {
            sender,
            ack: ack_rx,
            synchronous,
            handle: Some(handle),
        })
    }

    /// Submit GIF qwords; blocks on queue capacity
    pub fn submit(&self, qwords: Vec<u128>) -> Result<()> {
        self.send(GsCommand::Qwords(qwords))
    }

    /// Signal a vertical sync
    pub fn vsync(&self) -> Result<()> {
        self.send(GsCommand::Vsync)
    }

    /// Reset the renderer
    pub fn reset(&self) -> Result<()> {
        self.send(GsCommand::Reset)
    }

    /// Freeze the machine state, waiting for the blob
    pub fn freeze(&self) -> Result<Vec<u8>> {
        let (tx, rx) = bounded(1);
        self.send(GsCommand::Freeze(tx))?;
        rx.recv().map_err(|_| GsError::RendererDisconnected)?
    }

    /// Restore machine state, waiting for the outcome
    pub fn defrost(&self, blob: Vec<u8>) -> Result<()> {
        let (tx, rx) = bounded(1);
        self.send(GsCommand::Defrost(blob, tx))?;
        rx.recv().map_err(|_| GsError::RendererDisconnected)?
    }

    /// Drain the queue, stop the thread, and return its counters
    pub fn shutdown(mut self) -> Result<RenderStats> {
        self.sender
            .send(GsCommand::Shutdown)
            .map_err(|_| GsError::RendererDisconnected)?;
        let handle = self.handle.take().ok_or(GsError::RendererDisconnected)?;
        handle.join().map_err(|_| GsError::RendererDisconnected)
    }

    fn send(&self, command: GsCommand) -> Result<()> {
        self.sender
            .send(command)
            .map_err(|_| GsError::RendererDisconnected)?;
        if self.synchronous {
            // One ack per command: the producer resumes only after the
            // renderer finished the unit of work
            self.ack.recv().map_err(|_| GsError::RendererDisconnected)?;
        }
        Ok(())
    }
}

fn run<D: DeviceBackend>(
    config: RendererConfig,
    device: D,
    receiver: Receiver<GsCommand>,
    ack: Sender<()>,
    synchronous: bool,
) -> RenderStats {
    let mut renderer = Renderer::new(config, device);
    // Blocks when the queue is empty; exits on disconnect
    while let Ok(command) = receiver.recv() {
        let stop = matches!(command, GsCommand::Shutdown);
        match command {
            GsCommand::Qwords(qwords) => renderer.submit_qwords(&qwords),
            GsCommand::Vsync => renderer.vsync(),
            GsCommand::Reset => renderer.reset(),
            GsCommand::Freeze(reply) => {
                renderer.flush_batch();
                let _ = reply.send(renderer.freeze());
            }
            GsCommand::Defrost(blob, reply) => {
                let _ = reply.send(renderer.defrost(&blob));
            }
            GsCommand::Shutdown => {}
        }
        if synchronous {
            let _ = ack.send(());
        }
        if stop {
            break;
        }
    }
    renderer.flush_batch();
    log::info!("Renderer thread exiting");
    renderer.stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::QueueConfig;
    use crate::core::device::{DeviceCaps, NullDevice};

    fn packed_prim_tag(nloop: u64, prim: u64) -> u128 {
        // PACKED tag with PRE, one NOP descriptor per loop
        let lo = (nloop & 0x7FFF) | (1 << 15) | (1 << 46) | ((prim & 0x7FF) << 47) | (1u64 << 60);
        (lo as u128) | (0xFu128 << 64)
    }

    #[test]
    fn test_spawn_submit_shutdown() {
        let thread = RenderThread::spawn(RendererConfig::default(), NullDevice::default()).unwrap();
        thread.submit(vec![packed_prim_tag(1, 6), 0]).unwrap();
        thread.vsync().unwrap();
        thread.vsync().unwrap();
        let stats = thread.shutdown().unwrap();
        assert_eq!(stats.vsyncs, 2);
    }

    #[test]
    fn test_synchronous_mode_acks_each_command() {
        let config = RendererConfig {
            queue: QueueConfig {
                depth: 1,
                synchronous: true,
            },
            ..RendererConfig::default()
        };
        let thread = RenderThread::spawn(config, NullDevice::new(DeviceCaps::all())).unwrap();
        // With depth 1 and sync mode, each call returns only after the
        // renderer consumed the command; this cannot deadlock
        for _ in 0..32 {
            thread.submit(vec![packed_prim_tag(1, 0), 0]).unwrap();
        }
        thread.vsync().unwrap();
        let stats = thread.shutdown().unwrap();
        assert_eq!(stats.vsyncs, 1);
    }

    #[test]
    fn test_freeze_over_the_channel() {
        let thread = RenderThread::spawn(RendererConfig::default(), NullDevice::default()).unwrap();
        let blob = thread.freeze().unwrap();
        assert!(!blob.is_empty());
        thread.defrost(blob).unwrap();
        thread.shutdown().unwrap();
    }

    #[test]
    fn test_reset_processed_in_order() {
        let thread = RenderThread::spawn(RendererConfig::default(), NullDevice::default()).unwrap();
        thread.submit(vec![packed_prim_tag(1, 6), 0]).unwrap();
        thread.reset().unwrap();
        let stats = thread.shutdown().unwrap();
        // The reset ran after the submission; nothing was drawn
        assert_eq!(stats.draws, 0);
    }

    #[test]
    fn test_send_after_shutdown_fails() {
        let thread = RenderThread::spawn(RendererConfig::default(), NullDevice::default()).unwrap();
        let sender = thread.sender.clone();
        thread.shutdown().unwrap();
        // The channel is disconnected once the thread exits
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(sender.send(GsCommand::Vsync).is_err());
    }
}
