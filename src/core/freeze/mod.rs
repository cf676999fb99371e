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

//! Save states (freeze/defrost)
//!
//! A save state is a versioned bincode blob of everything the register
//! machine needs to resume mid-stream: the raw register context, the
//! partially assembled batch, any in-flight transfer, local memory and
//! the CLUT buffer. Device-side cache contents are deliberately absent;
//! the cache rebuilds from local memory after a defrost.
//!
//! The version field increments on any layout change. Defrost validates
//! version and sizes before touching any state, so a rejected blob leaves
//! the machine untouched.

use bincode::config::standard;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::core::error::{GsError, Result};
use crate::core::gs::context::RegisterContext;
use crate::core::gs::transfer::TransferSnapshot;
use crate::core::gs::vertex::AssemblerSnapshot;
use crate::core::gs::GsState;
use crate::core::vmem::format::PixelRect;
use crate::core::vmem::{ClutSnapshot, LocalMemory};

/// Current save-state layout version
pub const SAVE_STATE_VERSION: u32 = 1;

/// The serialized machine image
#[derive(Debug, Serialize, Deserialize)]
struct SaveState {
    version: u32,
    /// Creation time, RFC 3339 (informational only)
    created_at: String,
    context: RegisterContext,
    assembler: AssemblerSnapshot,
    transfer: Option<TransferSnapshot>,
    drawn_bounds: (u32, u32, u32, u32),
    cbp_cache: [u32; 2],
    local_memory: Vec<u8>,
    clut: ClutSnapshot,
}

/// Serialize the register machine and local memory
pub fn freeze(state: &GsState, mem: &LocalMemory) -> Result<Vec<u8>> {
    let b = state.drawn_bounds;
    let image = SaveState {
        version: SAVE_STATE_VERSION,
        created_at: Utc::now().to_rfc3339(),
        context: state.ctx,
        assembler: state.assembler.snapshot(),
        transfer: state.transfer.snapshot(),
        drawn_bounds: (b.x0, b.y0, b.x1, b.y1),
        cbp_cache: state.cbp_cache,
        local_memory: mem.as_bytes(),
        clut: mem.clut_snapshot(),
    };
    let bytes = bincode::serde::encode_to_vec(&image, standard())
        .map_err(|e| GsError::SaveStateCodec(e.to_string()))?;
    log::info!("Froze save state: {} bytes", bytes.len());
    Ok(bytes)
}

/// Restore the register machine and local memory from a blob
///
/// # Errors
///
/// [`GsError::UnsupportedSaveStateVersion`] for a version this build does
/// not know, [`GsError::InvalidSaveState`] for structural defects; both
/// leave the current state untouched.
pub fn defrost(bytes: &[u8], state: &mut GsState, mem: &mut LocalMemory) -> Result<()> {
    let (image, _): (SaveState, usize) = bincode::serde::decode_from_slice(bytes, standard())
        .map_err(|e| GsError::SaveStateCodec(e.to_string()))?;

    if image.version != SAVE_STATE_VERSION {
        return Err(GsError::UnsupportedSaveStateVersion {
            found: image.version,
            supported: SAVE_STATE_VERSION,
        });
    }
    if image.local_memory.len() != LocalMemory::SIZE {
        return Err(GsError::InvalidSaveState {
            reason: format!(
                "local memory is {} bytes, expected {}",
                image.local_memory.len(),
                LocalMemory::SIZE
            ),
        });
    }
    if image.clut.clut32.len() != 256 || image.clut.clut16.len() != 512 {
        return Err(GsError::InvalidSaveState {
            reason: "CLUT snapshot has wrong entry counts".into(),
        });
    }
    if image.assembler.vertices.len() % std::mem::size_of::<crate::core::gs::vertex::GsVertex>()
        != 0
    {
        return Err(GsError::InvalidSaveState {
            reason: "vertex buffer length is not a whole number of vertices".into(),
        });
    }

    state.ctx = image.context;
    state.assembler.restore(&image.assembler);
    state.transfer.restore(image.transfer);
    let (x0, y0, x1, y1) = image.drawn_bounds;
    state.drawn_bounds = PixelRect::new(x0, y0, x1, y1);
    state.cbp_cache = image.cbp_cache;
    mem.load_bytes(&image.local_memory);
    mem.restore_clut(&image.clut);
    log::info!("Defrosted save state from {}", image.created_at);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gs::registers::Register;
    use crate::core::vmem::format::Psm;

    fn populated() -> (GsState, LocalMemory) {
        let mut state = GsState::new();
        let mut mem = LocalMemory::new();
        state.apply(Register::Prim, 3, &mut mem); // triangles
        state.apply(Register::Rgbaq, 0x1122_3344, &mut mem);
        state.apply(Register::Frame1, 2 | (10 << 16), &mut mem);
        // Two pending vertices of an unfinished triangle
        state.apply(Register::Xyz2, 0x10, &mut mem);
        state.apply(Register::Xyz2, 0x20, &mut mem);
        mem.write_pixel(0x100, 1, 3, 4, Psm::Ct32, 0xCAFE_BABE);
        (state, mem)
    }

    #[test]
    fn test_freeze_defrost_round_trip() {
        let (state, mem) = populated();
        let blob = freeze(&state, &mem).unwrap();

        let mut state2 = GsState::new();
        let mut mem2 = LocalMemory::new();
        defrost(&blob, &mut state2, &mut mem2).unwrap();

        assert_eq!(state2.ctx, state.ctx);
        assert_eq!(state2.assembler.vertices, state.assembler.vertices);
        assert_eq!(state2.assembler.indices, state.assembler.indices);
        assert_eq!(mem2.read_pixel(0x100, 1, 3, 4, Psm::Ct32), 0xCAFE_BABE);

        // The unfinished triangle completes after defrost
        state2.apply(Register::Xyz2, 0x30, &mut mem2);
        assert_eq!(state2.assembler.indices.len(), 3);
    }

    #[test]
    fn test_defrost_rejects_wrong_version() {
        let (state, mem) = populated();
        let blob = freeze(&state, &mem).unwrap();

        // Re-encode with a bumped version field
        let (mut image, _): (SaveState, usize) =
            bincode::serde::decode_from_slice(&blob, standard()).unwrap();
        image.version = SAVE_STATE_VERSION + 7;
        let tampered = bincode::serde::encode_to_vec(&image, standard()).unwrap();

        let mut state2 = GsState::new();
        let mut mem2 = LocalMemory::new();
        let err = defrost(&tampered, &mut state2, &mut mem2).unwrap_err();
        assert!(matches!(
            err,
            GsError::UnsupportedSaveStateVersion { found, .. } if found == SAVE_STATE_VERSION + 7
        ));
        // The machine was not touched
        assert_eq!(state2.ctx, RegisterContext::default());
    }

    #[test]
    fn test_defrost_rejects_truncated_memory() {
        let (state, mem) = populated();
        let blob = freeze(&state, &mem).unwrap();
        let (mut image, _): (SaveState, usize) =
            bincode::serde::decode_from_slice(&blob, standard()).unwrap();
        image.local_memory.truncate(1024);
        let tampered = bincode::serde::encode_to_vec(&image, standard()).unwrap();

        let err = defrost(&tampered, &mut GsState::new(), &mut LocalMemory::new()).unwrap_err();
        assert!(matches!(err, GsError::InvalidSaveState { .. }));
    }

    #[test]
    fn test_defrost_rejects_garbage() {
        let err = defrost(&[1, 2, 3], &mut GsState::new(), &mut LocalMemory::new()).unwrap_err();
        assert!(matches!(err, GsError::SaveStateCodec(_)));
    }

    #[test]
    fn test_transfer_survives_freeze() {
        let mut state = GsState::new();
        let mut mem = LocalMemory::new();
        // Arm a 2x4 CT32 transfer (two qwords) and feed the first half
        state.apply(Register::BitBltBuf, 0x80u64 << 32 | 1 << 48, &mut mem);
        state.apply(Register::TrxReg, 2 | (4u64 << 32), &mut mem);
        state.apply(Register::TrxDir, 0, &mut mem);
        state.apply_image(0x0000_0002_0000_0001_u128, &mut mem);
        assert!(state.transfer.is_active());

        let blob = freeze(&state, &mem).unwrap();
        let mut state2 = GsState::new();
        let mut mem2 = LocalMemory::new();
        defrost(&blob, &mut state2, &mut mem2).unwrap();
        assert!(state2.transfer.is_active());

        // The second half completes the rectangle where it left off
        let done = state2.apply_image(0x0000_0004_0000_0003_u128, &mut mem2);
        assert!(matches!(
            done,
            crate::core::gs::ApplyEffect::MemoryWritten(_)
        ));
        assert_eq!(mem2.read_pixel(0x80, 1, 0, 0, Psm::Ct32), 1);
        assert_eq!(mem2.read_pixel(0x80, 1, 1, 2, Psm::Ct32), 4);
    }
}
