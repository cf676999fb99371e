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

//! gsrx: A PlayStation 2 Graphics Synthesizer (GS) hardware renderer core
//!
//! This crate turns the GS register/vertex stream into device-agnostic
//! draw configurations, reproducing the PS2-specific semantics modern
//! graphics APIs lack: frame-buffer/texture aliasing, destination-alpha
//! testing, texture and channel shuffles, CLUT indexing, and the GS blend
//! equation.
//!
//! # Architecture
//!
//! The pipeline runs on one renderer thread:
//!
//! ```text
//! GIF qwords -> decoder -> register dispatch -> vertex batches
//!     -> Classify -> ResolveTextures -> ResolveTargets
//!     -> DecideBlend/DATE -> Emit -> PostInvalidate -> DeviceBackend
//! ```
//!
//! A video-memory cache between the register machine and the device maps
//! address ranges of emulated local memory onto GPU targets and sampled
//! textures, tracking which side holds the newer data.
//!
//! # Example
//!
//! ```no_run
//! use gsrx::core::config::RendererConfig;
//! use gsrx::core::device::NullDevice;
//! use gsrx::core::thread::RenderThread;
//!
//! let thread = RenderThread::spawn(RendererConfig::default(), NullDevice::default())?;
//! // thread.submit(qwords)?; thread.vsync()?;
//! let stats = thread.shutdown()?;
//! println!("{} draws", stats.draws);
//! # Ok::<(), gsrx::core::error::GsError>(())
//! ```
//!
//! # Modules
//!
//! - [`core::gif`]: GIF packet decoding
//! - [`core::gs`]: register dispatch and vertex assembly
//! - [`core::vmem`]: emulated local memory
//! - [`core::cache`]: the video-memory cache
//! - [`core::renderer`]: the draw orchestrator
//! - [`core::device`]: the backend contract
//! - [`core::thread`]: the renderer thread
//!
//! # Error Handling
//!
//! All fallible operations return [`core::error::Result<T>`], an alias for
//! `Result<T, GsError>`.

pub mod core;

// Re-export commonly used types
pub use core::error::{GsError, Result};
