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

//! Decoded GS register state
//!
//! The context stores every register as its raw 64-bit word and decodes on
//! demand through the typed structs in [`super::registers`]. Raw storage
//! keeps save states lossless and makes the dispatch handlers trivial;
//! decode is cheap bit slicing.
//!
//! Registers with two drawing-environment copies live in [`DrawEnv`]; the
//! active environment is selected per draw by PRIM.CTXT (or PRMODE.CTXT
//! when PRMODECONT routes attribute flags through PRMODE).

use serde::{Deserialize, Serialize};

use super::registers::{
    Alpha, BitBltBuf, Clamp, Dimx, FogCol, Frame, Prim, ScanMask, Scissor, Test, TexA, TexClut,
    Tex0, Tex1, TransferDir, TrxPos, TrxReg, XyOffset, Zbuf,
};

/// Raw register words for one drawing environment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawEnv {
    /// TEX0 word
    pub tex0: u64,
    /// CLAMP word
    pub clamp: u64,
    /// TEX1 word
    pub tex1: u64,
    /// MIPTBP1 word
    pub miptbp1: u64,
    /// MIPTBP2 word
    pub miptbp2: u64,
    /// XYOFFSET word
    pub xyoffset: u64,
    /// SCISSOR word
    pub scissor: u64,
    /// ALPHA word
    pub alpha: u64,
    /// TEST word
    pub test: u64,
    /// FBA word
    pub fba: u64,
    /// FRAME word
    pub frame: u64,
    /// ZBUF word
    pub zbuf: u64,
}

/// Raw register words shared by both environments
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterContext {
    /// PRIM word
    pub prim: u64,
    /// PRMODE word
    pub prmode: u64,
    /// PRMODECONT word
    pub prmodecont: u64,
    /// RGBAQ word (vertex color latch)
    pub rgbaq: u64,
    /// ST word (texture coordinate latch)
    pub st: u64,
    /// UV word (texel coordinate latch)
    pub uv: u64,
    /// FOG word (fog latch)
    pub fog: u64,
    /// TEXA word
    pub texa: u64,
    /// FOGCOL word
    pub fogcol: u64,
    /// TEXCLUT word
    pub texclut: u64,
    /// DIMX word
    pub dimx: u64,
    /// DTHE word
    pub dthe: u64,
    /// COLCLAMP word
    pub colclamp: u64,
    /// PABE word
    pub pabe: u64,
    /// SCANMSK word
    pub scanmsk: u64,
    /// BITBLTBUF word
    pub bitbltbuf: u64,
    /// TRXPOS word
    pub trxpos: u64,
    /// TRXREG word
    pub trxreg: u64,
    /// TRXDIR word
    pub trxdir: u64,
    /// Per-environment registers
    pub env: [DrawEnv; 2],
}

impl RegisterContext {
    /// Effective primitive state
    ///
    /// PRMODECONT.AC = 1 means PRIM carries the attribute flags itself;
    /// AC = 0 substitutes PRMODE's flags while keeping PRIM's type.
    pub fn prim(&self) -> Prim {
        let prim = Prim::from_u64(self.prim);
        if self.prmodecont & 1 != 0 {
            prim
        } else {
            prim.with_attributes_from(self.prmode)
        }
    }

    /// Drawing-environment index the next draw uses
    #[inline(always)]
    pub fn active_env(&self) -> usize {
        self.prim().ctxt
    }

    /// Decoded TEX0 of an environment
    #[inline(always)]
    pub fn tex0(&self, env: usize) -> Tex0 {
        Tex0::from_u64(self.env[env].tex0)
    }

    /// Decoded TEX1 of an environment
    #[inline(always)]
    pub fn tex1(&self, env: usize) -> Tex1 {
        Tex1::from_u64(self.env[env].tex1)
    }

    /// Decoded CLAMP of an environment
    #[inline(always)]
    pub fn clamp(&self, env: usize) -> Clamp {
        Clamp::from_u64(self.env[env].clamp)
    }

    /// Decoded XYOFFSET of an environment
    #[inline(always)]
    pub fn xyoffset(&self, env: usize) -> XyOffset {
        XyOffset::from_u64(self.env[env].xyoffset)
    }

    /// Decoded SCISSOR of an environment
    #[inline(always)]
    pub fn scissor(&self, env: usize) -> Scissor {
        Scissor::from_u64(self.env[env].scissor)
    }

    /// Decoded ALPHA of an environment
    #[inline(always)]
    pub fn alpha(&self, env: usize) -> Alpha {
        Alpha::from_u64(self.env[env].alpha)
    }

    /// Decoded TEST of an environment
    #[inline(always)]
    pub fn test(&self, env: usize) -> Test {
        Test::from_u64(self.env[env].test)
    }

    /// Decoded FRAME of an environment
    #[inline(always)]
    pub fn frame(&self, env: usize) -> Frame {
        Frame::from_u64(self.env[env].frame)
    }

    /// Decoded ZBUF of an environment
    #[inline(always)]
    pub fn zbuf(&self, env: usize) -> Zbuf {
        Zbuf::from_u64(self.env[env].zbuf)
    }

    /// FBA bit of an environment
    #[inline(always)]
    pub fn fba(&self, env: usize) -> bool {
        self.env[env].fba & 1 != 0
    }

    /// Decoded TEXA
    #[inline(always)]
    pub fn texa(&self) -> TexA {
        TexA::from_u64(self.texa)
    }

    /// Decoded FOGCOL
    #[inline(always)]
    pub fn fogcol(&self) -> FogCol {
        FogCol::from_u64(self.fogcol)
    }

    /// Decoded TEXCLUT
    #[inline(always)]
    pub fn texclut(&self) -> TexClut {
        TexClut::from_u64(self.texclut)
    }

    /// Decoded dither matrix
    #[inline(always)]
    pub fn dimx(&self) -> Dimx {
        Dimx::from_u64(self.dimx)
    }

    /// Dithering enabled
    #[inline(always)]
    pub fn dthe(&self) -> bool {
        self.dthe & 1 != 0
    }

    /// Color clamp (true) vs wrap (false)
    #[inline(always)]
    pub fn colclamp(&self) -> bool {
        self.colclamp & 1 != 0
    }

    /// Per-pixel alpha blend enable
    #[inline(always)]
    pub fn pabe(&self) -> bool {
        self.pabe & 1 != 0
    }

    /// Decoded scan mask
    #[inline(always)]
    pub fn scanmsk(&self) -> ScanMask {
        ScanMask::from_bits(self.scanmsk as u8)
    }

    /// Decoded BITBLTBUF
    #[inline(always)]
    pub fn bitbltbuf(&self) -> BitBltBuf {
        BitBltBuf::from_u64(self.bitbltbuf)
    }

    /// Decoded TRXPOS
    #[inline(always)]
    pub fn trxpos(&self) -> TrxPos {
        TrxPos::from_u64(self.trxpos)
    }

    /// Decoded TRXREG
    #[inline(always)]
    pub fn trxreg(&self) -> TrxReg {
        TrxReg::from_u64(self.trxreg)
    }

    /// Decoded TRXDIR
    #[inline(always)]
    pub fn trxdir(&self) -> TransferDir {
        TransferDir::from_bits(self.trxdir as u8)
    }

    /// Mipmap base pointer and width for a level (1..=6)
    ///
    /// Levels 1-3 come from MIPTBP1, levels 4-6 from MIPTBP2; each packs
    /// three (pointer, width) pairs of 14+6 bits.
    pub fn mip_level(&self, env: usize, level: u32) -> (u32, u32) {
        debug_assert!((1..=6).contains(&level));
        let (word, slot) = if level <= 3 {
            (self.env[env].miptbp1, level - 1)
        } else {
            (self.env[env].miptbp2, level - 4)
        };
        let shift = slot * 20;
        let tbp = ((word >> shift) & 0x3FFF) as u32;
        let tbw = ((word >> (shift + 14)) & 0x3F) as u32;
        (tbp, tbw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gs::registers::PrimKind;

    #[test]
    fn test_prmodecont_selects_attribute_source() {
        let mut ctx = RegisterContext {
            prim: 3,                   // Triangle, no flags
            prmode: (1 << 4) | (1 << 6), // TME | ABE
            prmodecont: 1,
            ..Default::default()
        };
        // AC=1: PRIM's own (empty) flags
        let prim = ctx.prim();
        assert_eq!(prim.kind, PrimKind::Triangle);
        assert!(!prim.tme);

        // AC=0: PRMODE flags, PRIM type
        ctx.prmodecont = 0;
        let prim = ctx.prim();
        assert_eq!(prim.kind, PrimKind::Triangle);
        assert!(prim.tme);
        assert!(prim.abe);
    }

    #[test]
    fn test_env_isolation() {
        let mut ctx = RegisterContext::default();
        ctx.env[0].frame = 4; // FBP page 4
        ctx.env[1].frame = 8;
        assert_eq!(ctx.frame(0).fbp, 128);
        assert_eq!(ctx.frame(1).fbp, 256);
    }

    #[test]
    fn test_mip_level_unpacking() {
        let mut ctx = RegisterContext::default();
        // Level 1: TBP=0x100 TBW=2; level 2: TBP=0x200 TBW=4
        ctx.env[0].miptbp1 =
            0x100 | (2u64 << 14) | (0x200u64 << 20) | (4u64 << 34);
        // Level 4: TBP=0x300 TBW=1
        ctx.env[0].miptbp2 = 0x300 | (1u64 << 14);
        assert_eq!(ctx.mip_level(0, 1), (0x100, 2));
        assert_eq!(ctx.mip_level(0, 2), (0x200, 4));
        assert_eq!(ctx.mip_level(0, 4), (0x300, 1));
    }

    #[test]
    fn test_context_round_trips_through_serde() {
        let mut ctx = RegisterContext::default();
        ctx.prim = 0x156;
        ctx.env[1].tex0 = 0x5_9800_8100;
        let bytes = bincode::serde::encode_to_vec(ctx, bincode::config::standard()).unwrap();
        let (back, _): (RegisterContext, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(back, ctx);
    }
}
