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

//! Renderer configuration
//!
//! All tunable behavior of the renderer core lives here as an explicit value
//! that is threaded through construction of the renderer and cache. The
//! configuration has no global instance; its lifetime is tied to the renderer
//! thread it was handed to.
//!
//! Heuristic thresholds (sprite counts, CLUT-draw windows, cache aging) are
//! game-compatibility tuning. The defaults below are working starting points,
//! not claims of optimality, which is why they are data and not constants.

use std::path::Path;

use serde::Deserialize;

use super::error::{GsError, Result};

/// Top-level renderer configuration
///
/// Loadable from a TOML file; every section and field has a default so a
/// partial file (or none at all) is valid.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Command queue and threading options
    pub queue: QueueConfig,

    /// Video-memory cache options
    pub cache: CacheConfig,

    /// Draw-classification heuristics
    pub heuristics: HeuristicsConfig,

    /// Debug dump options
    pub dump: DumpConfig,
}

impl RendererConfig {
    /// Load configuration from a TOML file
    ///
    /// Missing fields fall back to their defaults. A missing file is an
    /// error; callers that want "file optional" semantics should check for
    /// existence first and use [`RendererConfig::default`].
    ///
    /// # Arguments
    ///
    /// * `path` - Path to a TOML configuration file
    ///
    /// # Errors
    ///
    /// Returns [`GsError::ConfigNotFound`] if the file cannot be read and
    /// [`GsError::ConfigParse`] if it is not valid TOML for this schema.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|_| GsError::ConfigNotFound(path.display().to_string()))?;
        let config: Self =
            toml::from_str(&text).map_err(|e| GsError::ConfigParse(e.to_string()))?;
        log::info!("Loaded renderer config from {}", path.display());
        Ok(config)
    }
}

/// Command queue and threading options
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Bounded queue depth between the producer and the renderer thread
    ///
    /// The producer blocks when this many commands are in flight. Small by
    /// default so a stalled renderer applies backpressure quickly.
    pub depth: usize,

    /// Synchronous mode: the producer waits for the renderer to finish each
    /// unit of work before continuing
    ///
    /// Trades responsiveness for debuggability; draw ordering is identical
    /// in both modes.
    pub synchronous: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            depth: 16,
            synchronous: false,
        }
    }
}

/// Video-memory cache options
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of vertical syncs an entry may go untouched before eviction
    pub max_age: u32,

    /// Resident GPU memory ceiling in bytes
    ///
    /// Crossing the ceiling triggers a full cache purge and a one-time
    /// warning; it never fails a draw.
    pub memory_ceiling: usize,

    /// Resolution scale factor applied to targets (1 = native)
    pub upscale: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age: 4,
            memory_ceiling: 512 * 1024 * 1024,
            upscale: 1,
        }
    }
}

/// Draw-classification heuristics
///
/// Numeric decision points used by the classify and blend stages.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeuristicsConfig {
    /// Sprite count at or above which sprites are left unexpanded for
    /// GPU-side expansion instead of being split into triangle pairs
    pub sprite_expand_limit: usize,

    /// Sprite count above which full software blending is preferred over
    /// repeated per-primitive barriers
    pub software_blend_sprite_limit: usize,

    /// Maximum width/height (in pixels) of a sprite draw eligible for the
    /// CPU blit path
    pub cpu_blit_max_size: u32,

    /// Maximum width of a draw recognized as a CLUT update (palette writes
    /// are this wide or narrower)
    pub clut_draw_max_width: u32,

    /// Maximum primitive pairs tested exactly for screen-space overlap
    /// before the batch is conservatively assumed to overlap
    pub overlap_test_limit: usize,

    /// Execute recognized CLUT updates on the CPU instead of the GPU
    pub cpu_clut_draw: bool,
}

impl Default for HeuristicsConfig {
    fn default() -> Self {
        Self {
            sprite_expand_limit: 16,
            software_blend_sprite_limit: 100,
            cpu_blit_max_size: 16,
            clut_draw_max_width: 16,
            overlap_test_limit: 64,
            cpu_clut_draw: true,
        }
    }
}

/// Debug dump options
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DumpConfig {
    /// Master switch for dump output
    pub enabled: bool,

    /// Directory dumps are written to
    pub directory: String,

    /// Maximum number of draws dumped (0 = unlimited)
    pub draw_limit: usize,

    /// Also dump raw texture bytes alongside the textual dumps
    pub textures: bool,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: "gs_dumps".to_string(),
            draw_limit: 0,
            textures: false,
        }
    }
}
