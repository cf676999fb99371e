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

//! GS register dispatch and vertex assembly
//!
//! [`GsState`] is the register-driven state machine behind the GIF decoder:
//! every register write lands in [`GsState::apply`], which routes it through
//! an enum-keyed dispatch to the handler for that register. Most handlers
//! store the raw word in the [`context::RegisterContext`]; the interesting
//! ones latch vertex attributes, kick vertices into the
//! [`vertex::VertexAssembler`], load the CLUT, or drive the transfer engine.
//!
//! `apply` reports side effects the draw pipeline must act on (memory
//! written, CLUT changed, vertex kicked) through [`ApplyEffect`]; the
//! orchestrator decides when a pending batch has to be flushed around a
//! write, using [`requires_flush`] and its own overlap analysis.

pub mod context;
pub mod registers;
pub mod trace;
pub mod transfer;
pub mod vertex;

use crate::core::vmem::format::PixelRect;
use crate::core::vmem::LocalMemory;

use context::RegisterContext;
use registers::{PrimKind, Register, TransferDir};
use transfer::{start_transfer, TransferRect, TransferState};
use vertex::{GsVertex, VertexAssembler};

/// Side effects of a register write that the draw pipeline acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyEffect {
    /// The context was mutated, nothing else to do
    None,
    /// A vertex was kicked; `completed` marks a finished primitive
    Kicked {
        /// Whether the kick completed a primitive
        completed: bool,
    },
    /// The CLUT buffer was reloaded
    ClutLoaded {
        /// Whether the buffer contents changed
        changed: bool,
    },
    /// TEXFLUSH: sampled textures must be revalidated
    TexFlush,
    /// A host-to-local transfer was armed over the rectangle
    HostTransferArmed(TransferRect),
    /// Local memory was written (completed transfer or local copy)
    MemoryWritten(TransferRect),
    /// Local memory was read out to the host
    MemoryRead(TransferRect),
}

/// Whether a write to this register must flush a pending batch first
///
/// Registers that feed the draw state (targets, tests, texture setup)
/// cannot change under a half-built batch; vertex latches and transfer
/// plumbing can. The orchestrator additionally skips the flush when the
/// raw word is unchanged.
pub fn requires_flush(reg: Register) -> bool {
    matches!(
        reg,
        Register::Prim
            | Register::Tex0_1
            | Register::Tex0_2
            | Register::Tex2_1
            | Register::Tex2_2
            | Register::Clamp1
            | Register::Clamp2
            | Register::Tex1_1
            | Register::Tex1_2
            | Register::MipTbp1_1
            | Register::MipTbp1_2
            | Register::MipTbp2_1
            | Register::MipTbp2_2
            | Register::XyOffset1
            | Register::XyOffset2
            | Register::PrMode
            | Register::PrModeCont
            | Register::TexClut
            | Register::ScanMsk
            | Register::TexA
            | Register::FogCol
            | Register::Scissor1
            | Register::Scissor2
            | Register::Alpha1
            | Register::Alpha2
            | Register::Dimx
            | Register::Dthe
            | Register::ColClamp
            | Register::Test1
            | Register::Test2
            | Register::Pabe
            | Register::Fba1
            | Register::Fba2
            | Register::Frame1
            | Register::Frame2
            | Register::Zbuf1
            | Register::Zbuf2
    )
}

/// The raw context word a register write would replace, if any
///
/// Used by the orchestrator to suppress flushes for writes that do not
/// change state (games re-send identical setup constantly).
pub fn current_word(ctx: &RegisterContext, reg: Register) -> Option<u64> {
    Some(match reg {
        Register::Prim => ctx.prim,
        Register::PrMode => ctx.prmode,
        Register::PrModeCont => ctx.prmodecont,
        Register::TexClut => ctx.texclut,
        Register::ScanMsk => ctx.scanmsk,
        Register::TexA => ctx.texa,
        Register::FogCol => ctx.fogcol,
        Register::Dimx => ctx.dimx,
        Register::Dthe => ctx.dthe,
        Register::ColClamp => ctx.colclamp,
        Register::Pabe => ctx.pabe,
        Register::Tex0_1 => ctx.env[0].tex0,
        Register::Tex0_2 => ctx.env[1].tex0,
        Register::Clamp1 => ctx.env[0].clamp,
        Register::Clamp2 => ctx.env[1].clamp,
        Register::Tex1_1 => ctx.env[0].tex1,
        Register::Tex1_2 => ctx.env[1].tex1,
        Register::MipTbp1_1 => ctx.env[0].miptbp1,
        Register::MipTbp1_2 => ctx.env[1].miptbp1,
        Register::MipTbp2_1 => ctx.env[0].miptbp2,
        Register::MipTbp2_2 => ctx.env[1].miptbp2,
        Register::XyOffset1 => ctx.env[0].xyoffset,
        Register::XyOffset2 => ctx.env[1].xyoffset,
        Register::Scissor1 => ctx.env[0].scissor,
        Register::Scissor2 => ctx.env[1].scissor,
        Register::Alpha1 => ctx.env[0].alpha,
        Register::Alpha2 => ctx.env[1].alpha,
        Register::Test1 => ctx.env[0].test,
        Register::Test2 => ctx.env[1].test,
        Register::Fba1 => ctx.env[0].fba,
        Register::Fba2 => ctx.env[1].fba,
        Register::Frame1 => ctx.env[0].frame,
        Register::Frame2 => ctx.env[1].frame,
        Register::Zbuf1 => ctx.env[0].zbuf,
        Register::Zbuf2 => ctx.env[1].zbuf,
        _ => return None,
    })
}

/// Register-driven GS state: context, vertex assembly and transfers
#[derive(Default)]
pub struct GsState {
    /// Decoded register context
    pub ctx: RegisterContext,
    /// Vertex and index batch being assembled
    pub assembler: VertexAssembler,
    /// Local-memory transfer engine
    pub transfer: TransferState,
    /// Local-to-host readback bytes from the last such transfer
    pub readback: Vec<u8>,
    /// Bounding box of primitives drawn into the current batch, updated on
    /// every completing kick; drives the auto-flush overlap test
    pub(crate) drawn_bounds: PixelRect,
    /// CBP values captured by CLD modes 2/3, compared by modes 4/5
    pub(crate) cbp_cache: [u32; 2],
}

impl GsState {
    /// Create a reset state
    pub fn new() -> Self {
        Self::default()
    }

    /// Primitive kind currently being assembled (always from PRIM; PRMODE
    /// only carries attribute flags)
    #[inline(always)]
    pub fn prim_kind(&self) -> PrimKind {
        PrimKind::from_bits(self.ctx.prim as u8)
    }

    /// Bounding box of primitives already drawn into the current batch
    #[inline(always)]
    pub fn drawn_bounds(&self) -> PixelRect {
        self.drawn_bounds
    }

    /// Reset everything (reopen path)
    pub fn reset(&mut self) {
        self.ctx = RegisterContext::default();
        self.assembler.clear();
        self.transfer.reset();
        self.readback.clear();
        self.drawn_bounds = PixelRect::default();
        self.cbp_cache = [0; 2];
    }

    /// Forget the drawn-area tracking after a flush
    pub fn clear_drawn_bounds(&mut self) {
        self.drawn_bounds = PixelRect::default();
    }

    /// Build the vertex a position write would kick, without committing it
    ///
    /// The orchestrator uses this to run the auto-flush overlap test before
    /// the kick mutates the batch.
    pub fn peek_kick(&self, reg: Register, data: u64) -> GsVertex {
        let env = self.ctx.active_env();
        let offset = self.ctx.xyoffset(env);

        let x = (data as u16).wrapping_sub(offset.ofx);
        let y = ((data >> 16) as u16).wrapping_sub(offset.ofy);
        let (z, fog) = match reg {
            Register::Xyzf2 | Register::Xyzf3 => {
                (((data >> 32) & 0xFF_FFFF) as u32, (data >> 56) as u8)
            }
            _ => ((data >> 32) as u32, (self.ctx.fog >> 56) as u8),
        };

        GsVertex {
            st: [
                f32::from_bits(self.ctx.st as u32),
                f32::from_bits((self.ctx.st >> 32) as u32),
            ],
            rgba: (self.ctx.rgbaq as u32).to_le_bytes(),
            q: f32::from_bits((self.ctx.rgbaq >> 32) as u32),
            x,
            y,
            z,
            u: (self.ctx.uv & 0x3FFF) as u16,
            v: ((self.ctx.uv >> 16) & 0x3FFF) as u16,
            fog,
            _pad: [0; 3],
        }
    }

    /// Apply one register write
    ///
    /// The orchestrator has already flushed around the write if needed;
    /// this only mutates state and reports side effects.
    pub fn apply(&mut self, reg: Register, data: u64, mem: &mut LocalMemory) -> ApplyEffect {
        log::trace!("GS write {:?} = {:#018x}", reg, data);
        match reg {
            Register::Prim => {
                self.ctx.prim = data & 0x7FF;
                self.assembler.restart();
                ApplyEffect::None
            }
            Register::Rgbaq => {
                self.ctx.rgbaq = data;
                ApplyEffect::None
            }
            Register::St => {
                self.ctx.st = data;
                ApplyEffect::None
            }
            Register::Uv => {
                self.ctx.uv = data;
                ApplyEffect::None
            }
            Register::Fog => {
                self.ctx.fog = data;
                ApplyEffect::None
            }
            Register::Xyzf2 | Register::Xyz2 => self.kick(reg, data, false),
            Register::Xyzf3 | Register::Xyz3 => self.kick(reg, data, true),
            Register::Tex0_1 | Register::Tex0_2 => {
                let env = (reg == Register::Tex0_2) as usize;
                self.ctx.env[env].tex0 = data;
                self.maybe_load_clut(env, mem)
            }
            Register::Tex2_1 | Register::Tex2_2 => {
                let env = (reg == Register::Tex2_2) as usize;
                let old = self.ctx.env[env].tex0;
                self.ctx.env[env].tex0 = (old & !registers::Tex0::TEX2_MASK)
                    | (data & registers::Tex0::TEX2_MASK);
                self.maybe_load_clut(env, mem)
            }
            Register::Clamp1 | Register::Clamp2 => {
                self.ctx.env[(reg == Register::Clamp2) as usize].clamp = data;
                ApplyEffect::None
            }
            Register::Tex1_1 | Register::Tex1_2 => {
                self.ctx.env[(reg == Register::Tex1_2) as usize].tex1 = data;
                ApplyEffect::None
            }
            Register::MipTbp1_1 | Register::MipTbp1_2 => {
                self.ctx.env[(reg == Register::MipTbp1_2) as usize].miptbp1 = data;
                ApplyEffect::None
            }
            Register::MipTbp2_1 | Register::MipTbp2_2 => {
                self.ctx.env[(reg == Register::MipTbp2_2) as usize].miptbp2 = data;
                ApplyEffect::None
            }
            Register::XyOffset1 | Register::XyOffset2 => {
                self.ctx.env[(reg == Register::XyOffset2) as usize].xyoffset = data;
                ApplyEffect::None
            }
            Register::PrModeCont => {
                self.ctx.prmodecont = data;
                ApplyEffect::None
            }
            Register::PrMode => {
                self.ctx.prmode = data & 0x7F8;
                ApplyEffect::None
            }
            Register::TexClut => {
                self.ctx.texclut = data;
                ApplyEffect::None
            }
            Register::ScanMsk => {
                self.ctx.scanmsk = data;
                ApplyEffect::None
            }
            Register::TexA => {
                self.ctx.texa = data;
                ApplyEffect::None
            }
            Register::FogCol => {
                self.ctx.fogcol = data;
                ApplyEffect::None
            }
            Register::TexFlush => ApplyEffect::TexFlush,
            Register::Scissor1 | Register::Scissor2 => {
                self.ctx.env[(reg == Register::Scissor2) as usize].scissor = data;
                ApplyEffect::None
            }
            Register::Alpha1 | Register::Alpha2 => {
                self.ctx.env[(reg == Register::Alpha2) as usize].alpha = data;
                ApplyEffect::None
            }
            Register::Dimx => {
                self.ctx.dimx = data;
                ApplyEffect::None
            }
            Register::Dthe => {
                self.ctx.dthe = data;
                ApplyEffect::None
            }
            Register::ColClamp => {
                self.ctx.colclamp = data;
                ApplyEffect::None
            }
            Register::Test1 | Register::Test2 => {
                self.ctx.env[(reg == Register::Test2) as usize].test = data;
                ApplyEffect::None
            }
            Register::Pabe => {
                self.ctx.pabe = data;
                ApplyEffect::None
            }
            Register::Fba1 | Register::Fba2 => {
                self.ctx.env[(reg == Register::Fba2) as usize].fba = data;
                ApplyEffect::None
            }
            Register::Frame1 | Register::Frame2 => {
                self.ctx.env[(reg == Register::Frame2) as usize].frame = data;
                ApplyEffect::None
            }
            Register::Zbuf1 | Register::Zbuf2 => {
                self.ctx.env[(reg == Register::Zbuf2) as usize].zbuf = data;
                ApplyEffect::None
            }
            Register::BitBltBuf => {
                self.ctx.bitbltbuf = data;
                ApplyEffect::None
            }
            Register::TrxPos => {
                self.ctx.trxpos = data;
                ApplyEffect::None
            }
            Register::TrxReg => {
                self.ctx.trxreg = data;
                ApplyEffect::None
            }
            Register::TrxDir => {
                self.ctx.trxdir = data;
                self.start_transfer(mem)
            }
            Register::HwReg => match self.transfer.write_dword(data, mem) {
                Some(rect) => ApplyEffect::MemoryWritten(rect),
                None => ApplyEffect::None,
            },
            Register::Signal | Register::Finish | Register::Label => {
                // Event registers are privileged-side handshakes; the
                // renderer core only logs them
                log::trace!("GS event register {:?}", reg);
                ApplyEffect::None
            }
            Register::Nop => ApplyEffect::None,
        }
    }

    /// Feed one qword of IMAGE-mode data to the transfer port
    pub fn apply_image(&mut self, data: u128, mem: &mut LocalMemory) -> ApplyEffect {
        match self.transfer.write_qword(data, mem) {
            Some(rect) => ApplyEffect::MemoryWritten(rect),
            None => ApplyEffect::None,
        }
    }

    fn kick(&mut self, reg: Register, data: u64, adc: bool) -> ApplyEffect {
        let kind = self.prim_kind();
        let vertex = self.peek_kick(reg, data);
        let completed = self.assembler.will_complete(kind) && !adc;

        if completed {
            // Track the drawn area for the auto-flush overlap test
            let mut bounds = PixelRect::new(
                vertex.x_px() as u32,
                vertex.y_px() as u32,
                vertex.x_px() as u32 + 1,
                vertex.y_px() as u32 + 1,
            );
            for &index in self.assembler.pending_window() {
                let v = &self.assembler.vertices[index as usize];
                bounds = bounds.union(&PixelRect::new(
                    v.x_px() as u32,
                    v.y_px() as u32,
                    v.x_px() as u32 + 1,
                    v.y_px() as u32 + 1,
                ));
            }
            self.drawn_bounds = self.drawn_bounds.union(&bounds);
        }

        self.assembler.kick(kind, vertex, adc);
        ApplyEffect::Kicked { completed }
    }

    fn maybe_load_clut(&mut self, env: usize, mem: &mut LocalMemory) -> ApplyEffect {
        let tex0 = self.ctx.tex0(env);
        let load = match tex0.cld {
            0 => false,
            1 => true,
            2 => {
                self.cbp_cache[0] = tex0.cbp;
                true
            }
            3 => {
                self.cbp_cache[1] = tex0.cbp;
                true
            }
            4 => {
                let stale = self.cbp_cache[0] != tex0.cbp;
                if stale {
                    self.cbp_cache[0] = tex0.cbp;
                }
                stale
            }
            _ => {
                let stale = self.cbp_cache[1] != tex0.cbp;
                if stale {
                    self.cbp_cache[1] = tex0.cbp;
                }
                stale
            }
        };
        if !load {
            return ApplyEffect::None;
        }
        let texclut = self.ctx.texclut();
        let changed = mem.load_clut(&tex0, &texclut);
        ApplyEffect::ClutLoaded { changed }
    }

    fn start_transfer(&mut self, mem: &mut LocalMemory) -> ApplyEffect {
        let dir = self.ctx.trxdir();
        let blt = self.ctx.bitbltbuf();
        let pos = self.ctx.trxpos();
        let reg = self.ctx.trxreg();
        self.readback.clear();
        match start_transfer(
            &mut self.transfer,
            dir,
            &blt,
            &pos,
            &reg,
            mem,
            &mut self.readback,
        ) {
            Some((TransferDir::HostToLocal, rect)) => ApplyEffect::HostTransferArmed(rect),
            Some((TransferDir::LocalToHost, rect)) => ApplyEffect::MemoryRead(rect),
            Some((TransferDir::LocalToLocal, rect)) => ApplyEffect::MemoryWritten(rect),
            _ => ApplyEffect::None,
        }
    }
}
