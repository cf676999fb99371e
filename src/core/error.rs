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

//! Error types for the renderer core
//!
//! All fallible operations in this crate return [`Result<T>`], an alias for
//! `Result<T, GsError>`.
//!
//! Internal invariants (unreachable register values, malformed index counts)
//! are not errors: they are guarded with `debug_assert!` and ignored with a
//! best-effort fallback in release builds. Cache inconsistencies are resolved
//! internally by eviction and never surface here.

use thiserror::Error;

/// Errors produced by the renderer core
#[derive(Debug, Error)]
pub enum GsError {
    /// Configuration file could not be read
    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    /// Configuration file could not be parsed
    #[error("Config parse error: {0}")]
    ConfigParse(String),

    /// Save state blob is too short or structurally invalid
    #[error("Invalid save state: {reason}")]
    InvalidSaveState {
        /// Human-readable description of the defect
        reason: String,
    },

    /// Save state was produced by an incompatible core version
    #[error("Unsupported save state version {found} (supported: {supported})")]
    UnsupportedSaveStateVersion {
        /// Version field found in the blob
        found: u32,
        /// Version this build can defrost
        supported: u32,
    },

    /// Save state encode/decode failure from the serializer
    #[error("Save state serialization error: {0}")]
    SaveStateCodec(String),

    /// The renderer thread has shut down and can no longer accept commands
    #[error("Renderer thread disconnected")]
    RendererDisconnected,

    /// Debug dump directory could not be created or written
    #[error("Dump error: {0}")]
    Dump(String),

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, GsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_version_mismatch() {
        let err = GsError::UnsupportedSaveStateVersion {
            found: 9,
            supported: 1,
        };
        assert_eq!(
            err.to_string(),
            "Unsupported save state version 9 (supported: 1)"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: GsError = io.into();
        assert!(matches!(err, GsError::Io(_)));
    }
}
