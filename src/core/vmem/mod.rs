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

//! GS local memory
//!
//! 4 MB of emulated video memory shared by frame buffers, depth buffers,
//! textures and CLUTs. Buffers are views into this memory described by a
//! base pointer (blocks), a width (units of 64 pixels) and a pixel format;
//! nothing prevents views from overlapping, which is exactly what the
//! texture cache exists to track.
//!
//! Pixel storage within a buffer is row-linear at the buffer's width;
//! address ranges for aliasing math are computed at block granularity (see
//! [`format::BlockRange`]).

pub mod format;

use format::{ClutPsm, Psm, LOCAL_MEMORY_SIZE, LOCAL_MEMORY_WORDS};

use super::gs::registers::{TexA, TexClut, Tex0};

/// Serializable image of the CLUT buffer
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ClutSnapshot {
    /// 32-bit entries
    pub clut32: Vec<u32>,
    /// 16-bit entries
    pub clut16: Vec<u16>,
    /// CPSM bits of the loaded entries
    pub kind: u8,
    /// Generation counter at snapshot time
    pub generation: u64,
}

/// Emulated GS local memory with the on-chip CLUT buffer
pub struct LocalMemory {
    /// Backing store, addressed in 32-bit words
    words: Vec<u32>,

    /// CLUT buffer entries as loaded (raw 16- or 32-bit values)
    clut32: [u32; 256],
    clut16: [u16; 512],
    clut_kind: ClutPsm,

    /// Bumped whenever a CLUT load changes the buffer contents
    ///
    /// Palette-backed cache sources compare this to detect staleness.
    clut_generation: u64,
}

impl Default for LocalMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalMemory {
    /// Create zero-filled local memory
    pub fn new() -> Self {
        Self {
            words: vec![0; LOCAL_MEMORY_WORDS],
            clut32: [0; 256],
            clut16: [0; 512],
            clut_kind: ClutPsm::Ct32,
            clut_generation: 0,
        }
    }

    /// Size of the raw memory in bytes
    pub const SIZE: usize = LOCAL_MEMORY_SIZE;

    /// Raw bytes of local memory (for save states)
    pub fn as_bytes(&self) -> Vec<u8> {
        bytemuck::cast_slice(&self.words).to_vec()
    }

    /// Replace the memory contents (for save states)
    ///
    /// Lengths other than [`Self::SIZE`] are ignored with a warning; the
    /// defrost path validates before calling.
    pub fn load_bytes(&mut self, bytes: &[u8]) {
        if bytes.len() != Self::SIZE {
            log::warn!(
                "Local memory restore size mismatch: {} != {}",
                bytes.len(),
                Self::SIZE
            );
            return;
        }
        self.words.copy_from_slice(bytemuck::cast_slice(bytes));
    }

    /// CLUT generation counter
    #[inline(always)]
    pub fn clut_generation(&self) -> u64 {
        self.clut_generation
    }

    /// Snapshot the CLUT buffer for a save state
    pub fn clut_snapshot(&self) -> ClutSnapshot {
        ClutSnapshot {
            clut32: self.clut32.to_vec(),
            clut16: self.clut16.to_vec(),
            kind: match self.clut_kind {
                ClutPsm::Ct32 => 0x0,
                ClutPsm::Ct16 => 0x2,
                ClutPsm::Ct16s => 0xA,
            },
            generation: self.clut_generation,
        }
    }

    /// Restore the CLUT buffer from a save state
    ///
    /// Entry counts are validated by the defrost path before this is called;
    /// short vectors leave the remaining entries untouched.
    pub fn restore_clut(&mut self, snapshot: &ClutSnapshot) {
        for (slot, value) in self.clut32.iter_mut().zip(&snapshot.clut32) {
            *slot = *value;
        }
        for (slot, value) in self.clut16.iter_mut().zip(&snapshot.clut16) {
            *slot = *value;
        }
        self.clut_kind = ClutPsm::from_bits(snapshot.kind);
        self.clut_generation = snapshot.generation;
    }

    #[inline(always)]
    fn word_index(base_blocks: u32, buffer_width: u32, x: u32, y: u32, psm: Psm) -> (usize, u32) {
        let width = (buffer_width * 64).max(1);
        let idx = (y as usize) * (width as usize) + (x as usize);
        let base = (base_blocks as usize) * 64;
        match psm.bpp() {
            32 => ((base + idx) & (LOCAL_MEMORY_WORDS - 1), 0),
            16 => (
                (base + idx / 2) & (LOCAL_MEMORY_WORDS - 1),
                ((idx & 1) as u32) * 16,
            ),
            8 => (
                (base + idx / 4) & (LOCAL_MEMORY_WORDS - 1),
                ((idx & 3) as u32) * 8,
            ),
            _ => (
                (base + idx / 8) & (LOCAL_MEMORY_WORDS - 1),
                ((idx & 7) as u32) * 4,
            ),
        }
    }

    /// Read one pixel's raw bits
    ///
    /// The value is format-sized: 16-bit formats return 16 significant
    /// bits, `T4` variants return 4, and so on. Addresses wrap at the end
    /// of memory like the hardware.
    pub fn read_pixel(&self, base: u32, buffer_width: u32, x: u32, y: u32, psm: Psm) -> u32 {
        let (word, shift) = Self::word_index(base, buffer_width, x, y, psm);
        let raw = self.words[word];
        match psm {
            Psm::Ct32 | Psm::Z32 => raw,
            Psm::Ct24 | Psm::Z24 => raw & 0x00FF_FFFF,
            Psm::Ct16 | Psm::Ct16s | Psm::Z16 | Psm::Z16s => (raw >> shift) & 0xFFFF,
            Psm::T8 => (raw >> shift) & 0xFF,
            Psm::T4 => (raw >> shift) & 0xF,
            Psm::T8h => (raw >> 24) & 0xFF,
            Psm::T4hl => (raw >> 24) & 0xF,
            Psm::T4hh => (raw >> 28) & 0xF,
        }
    }

    /// Write one pixel's raw bits, merging around the format's storage
    pub fn write_pixel(&mut self, base: u32, buffer_width: u32, x: u32, y: u32, psm: Psm, value: u32) {
        let (word, shift) = Self::word_index(base, buffer_width, x, y, psm);
        let slot = &mut self.words[word];
        *slot = match psm {
            Psm::Ct32 | Psm::Z32 => value,
            Psm::Ct24 | Psm::Z24 => (*slot & 0xFF00_0000) | (value & 0x00FF_FFFF),
            Psm::Ct16 | Psm::Ct16s | Psm::Z16 | Psm::Z16s => {
                (*slot & !(0xFFFF << shift)) | ((value & 0xFFFF) << shift)
            }
            Psm::T8 => (*slot & !(0xFF << shift)) | ((value & 0xFF) << shift),
            Psm::T4 => (*slot & !(0xF << shift)) | ((value & 0xF) << shift),
            Psm::T8h => (*slot & 0x00FF_FFFF) | ((value & 0xFF) << 24),
            Psm::T4hl => (*slot & 0xF0FF_FFFF) | ((value & 0xF) << 24),
            Psm::T4hh => (*slot & 0x0FFF_FFFF) | ((value & 0xF) << 28),
        };
    }

    /// Fill a rectangle with a constant raw value (the memory-clear fast
    /// path writes through here)
    pub fn fill_rect(
        &mut self,
        base: u32,
        buffer_width: u32,
        rect: format::PixelRect,
        psm: Psm,
        value: u32,
    ) {
        for y in rect.y0..rect.y1 {
            for x in rect.x0..rect.x1 {
                self.write_pixel(base, buffer_width, x, y, psm, value);
            }
        }
    }

    /// Decode a rectangle into RGBA8 for texture upload
    ///
    /// Indexed formats go through the CLUT buffer; 16- and 24-bit formats
    /// expand alpha through TEXA. Depth formats are returned with the raw
    /// value split across the channels of their color twin.
    pub fn read_texture_rgba(
        &self,
        base: u32,
        buffer_width: u32,
        rect: format::PixelRect,
        psm: Psm,
        texa: TexA,
        csa: u32,
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity((rect.width() * rect.height() * 4) as usize);
        for y in rect.y0..rect.y1 {
            for x in rect.x0..rect.x1 {
                let raw = self.read_pixel(base, buffer_width, x, y, psm);
                let rgba = match psm.as_color() {
                    Psm::Ct32 => raw,
                    Psm::Ct24 => expand_ct24(raw, texa),
                    Psm::Ct16 | Psm::Ct16s => expand_ct16(raw as u16, texa),
                    Psm::T8 | Psm::T8h => self.clut_lookup(raw as u8, csa, texa),
                    Psm::T4 | Psm::T4hl | Psm::T4hh => self.clut_lookup(raw as u8, csa, texa),
                    _ => raw,
                };
                out.extend_from_slice(&rgba.to_le_bytes());
            }
        }
        out
    }

    /// Look up a palette index in the CLUT buffer
    ///
    /// `csa` offsets in units of 16 entries. 16-bit entries are expanded
    /// through TEXA at lookup time, matching hardware (TEXA may change
    /// after the CLUT was loaded).
    pub fn clut_lookup(&self, index: u8, csa: u32, texa: TexA) -> u32 {
        let slot = (csa as usize * 16 + index as usize) & 0x1FF;
        match self.clut_kind {
            ClutPsm::Ct32 => self.clut32[slot & 0xFF],
            ClutPsm::Ct16 | ClutPsm::Ct16s => expand_ct16(self.clut16[slot], texa),
        }
    }

    /// Current CLUT entries decoded to RGBA8 (for palette textures)
    pub fn clut_rgba(&self, texa: TexA) -> [u32; 256] {
        let mut out = [0u32; 256];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = match self.clut_kind {
                ClutPsm::Ct32 => self.clut32[i],
                ClutPsm::Ct16 | ClutPsm::Ct16s => expand_ct16(self.clut16[i], texa),
            };
        }
        out
    }

    /// Load the CLUT buffer from local memory per TEX0
    ///
    /// Entry count follows the texture format (16 entries for 4-bit
    /// indices, 256 for 8-bit); CSM2 reads a linear row positioned by
    /// TEXCLUT. Returns true when the buffer contents changed (the
    /// generation counter is bumped on change only, so palette sources are
    /// not invalidated by redundant reloads).
    pub fn load_clut(&mut self, tex0: &Tex0, texclut: &TexClut) -> bool {
        let Some(psm) = Psm::from_bits(tex0.psm) else {
            return false;
        };
        let entries: usize = match psm {
            Psm::T4 | Psm::T4hl | Psm::T4hh => 16,
            Psm::T8 | Psm::T8h => 256,
            // Non-indexed formats do not load
            _ => return false,
        };
        let kind = ClutPsm::from_bits(tex0.cpsm);
        let mut changed = self.clut_kind != kind;
        self.clut_kind = kind;

        for i in 0..entries {
            // CSM1 packs entries in a 16-wide grid at CBP; CSM2 reads a
            // linear row at the TEXCLUT offset
            let (x, y, bw) = if tex0.csm2 {
                (texclut.cou * 16 + i as u32, texclut.cov, texclut.cbw)
            } else {
                ((i % 16) as u32, (i / 16) as u32, 1)
            };
            match kind {
                ClutPsm::Ct32 => {
                    let value = self.read_pixel(tex0.cbp, bw, x, y, Psm::Ct32);
                    let slot = (tex0.csa as usize * 16 + i) & 0xFF;
                    if self.clut32[slot] != value {
                        self.clut32[slot] = value;
                        changed = true;
                    }
                }
                ClutPsm::Ct16 | ClutPsm::Ct16s => {
                    let value = self.read_pixel(tex0.cbp, bw, x, y, Psm::Ct16) as u16;
                    let slot = (tex0.csa as usize * 16 + i) & 0x1FF;
                    if self.clut16[slot] != value {
                        self.clut16[slot] = value;
                        changed = true;
                    }
                }
            }
        }

        if changed {
            self.clut_generation += 1;
            log::trace!(
                "CLUT load: {} entries at CBP {:#x}, generation {}",
                entries,
                tex0.cbp,
                self.clut_generation
            );
        }
        changed
    }
}

/// Expand a 16-bit 1555 texel to RGBA8 through TEXA
pub fn expand_ct16(texel: u16, texa: TexA) -> u32 {
    let r = ((texel & 0x1F) << 3) as u32;
    let g = (((texel >> 5) & 0x1F) << 3) as u32;
    let b = (((texel >> 10) & 0x1F) << 3) as u32;
    let alpha_bit = texel >> 15;
    if texa.aem && (texel & 0x7FFF) == 0 && alpha_bit == 0 {
        return 0;
    }
    let a = if alpha_bit != 0 { texa.ta1 } else { texa.ta0 } as u32;
    r | (g << 8) | (b << 16) | (a << 24)
}

/// Expand a 24-bit texel to RGBA8 through TEXA (alpha is always TA0)
pub fn expand_ct24(texel: u32, texa: TexA) -> u32 {
    let rgb = texel & 0x00FF_FFFF;
    if texa.aem && rgb == 0 {
        return 0;
    }
    rgb | ((texa.ta0 as u32) << 24)
}
