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

//! Core renderer components
//!
//! This module contains the GS emulation pipeline:
//!
//! - [`gif`]: GIF packet decoding (PACKED/REGLIST/IMAGE)
//! - [`gs`]: register dispatch, vertex assembly, the vertex trace and the
//!   local-memory transfer engine
//! - [`vmem`]: emulated local memory and pixel formats
//! - [`cache`]: the video-memory cache (targets and sources)
//! - [`renderer`]: the draw orchestrator
//! - [`device`]: the backend contract ([`device::DrawConfig`] and the
//!   [`device::DeviceBackend`] trait)
//! - [`thread`]: the bounded-queue renderer thread
//! - [`freeze`]: versioned save states
//! - [`dump`]: write-only debug dumps
//! - [`config`]: the explicit renderer configuration object
//! - [`error`]: the crate-wide error taxonomy

pub mod cache;
pub mod config;
pub mod device;
pub mod dump;
pub mod error;
pub mod freeze;
pub mod gif;
pub mod gs;
pub mod renderer;
pub mod thread;
pub mod vmem;
