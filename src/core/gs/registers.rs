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

//! GS register definitions
//!
//! This module defines the general (drawing environment) registers of the
//! Graphics Synthesizer together with their bit-exact 64-bit layouts. Each
//! register is decoded into a typed struct via `from_u64`; the raw words are
//! what the register context stores, so decoding is lossless and on demand.
//!
//! The bit layouts are wire contracts with the GIF packet source and must not
//! be altered.

/// General register addresses accepted over the GIF
///
/// Registers with `_1`/`_2` suffixes are per-drawing-environment copies
/// selected by PRIM.CTXT (or PRMODE.CTXT).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Register {
    /// Primitive type and attribute flags
    Prim = 0x00,
    /// Vertex color and Q coordinate
    Rgbaq = 0x01,
    /// Perspective texture coordinates
    St = 0x02,
    /// Non-perspective texel coordinates
    Uv = 0x03,
    /// Vertex position + fog, with drawing kick
    Xyzf2 = 0x04,
    /// Vertex position, with drawing kick
    Xyz2 = 0x05,
    /// Texture setup, environment 1
    Tex0_1 = 0x06,
    /// Texture setup, environment 2
    Tex0_2 = 0x07,
    /// Texture wrap modes, environment 1
    Clamp1 = 0x08,
    /// Texture wrap modes, environment 2
    Clamp2 = 0x09,
    /// Fog coefficient
    Fog = 0x0A,
    /// Vertex position + fog, no drawing kick
    Xyzf3 = 0x0C,
    /// Vertex position, no drawing kick
    Xyz3 = 0x0D,
    /// Texture filtering/mipmap setup, environment 1
    Tex1_1 = 0x14,
    /// Texture filtering/mipmap setup, environment 2
    Tex1_2 = 0x15,
    /// CLUT-only texture update, environment 1
    Tex2_1 = 0x16,
    /// CLUT-only texture update, environment 2
    Tex2_2 = 0x17,
    /// Primitive coordinate offset, environment 1
    XyOffset1 = 0x18,
    /// Primitive coordinate offset, environment 2
    XyOffset2 = 0x19,
    /// Selects PRIM or PRMODE as the attribute source
    PrModeCont = 0x1A,
    /// Attribute flags shared by all primitive types
    PrMode = 0x1B,
    /// CLUT position for CSM2 layout
    TexClut = 0x1C,
    /// Raster scan mask
    ScanMsk = 0x22,
    /// Mipmap levels 1-3, environment 1
    MipTbp1_1 = 0x34,
    /// Mipmap levels 1-3, environment 2
    MipTbp1_2 = 0x35,
    /// Mipmap levels 4-6, environment 1
    MipTbp2_1 = 0x36,
    /// Mipmap levels 4-6, environment 2
    MipTbp2_2 = 0x37,
    /// Texture alpha expansion values
    TexA = 0x3B,
    /// Fog color
    FogCol = 0x3D,
    /// Texture cache flush
    TexFlush = 0x3F,
    /// Scissor rectangle, environment 1
    Scissor1 = 0x40,
    /// Scissor rectangle, environment 2
    Scissor2 = 0x41,
    /// Alpha blend equation, environment 1
    Alpha1 = 0x42,
    /// Alpha blend equation, environment 2
    Alpha2 = 0x43,
    /// Dither matrix
    Dimx = 0x44,
    /// Dither enable
    Dthe = 0x45,
    /// Color clamp/wrap control
    ColClamp = 0x46,
    /// Pixel tests, environment 1
    Test1 = 0x47,
    /// Pixel tests, environment 2
    Test2 = 0x48,
    /// Per-pixel alpha blend enable
    Pabe = 0x49,
    /// Alpha correction bit, environment 1
    Fba1 = 0x4A,
    /// Alpha correction bit, environment 2
    Fba2 = 0x4B,
    /// Frame buffer setup, environment 1
    Frame1 = 0x4C,
    /// Frame buffer setup, environment 2
    Frame2 = 0x4D,
    /// Depth buffer setup, environment 1
    Zbuf1 = 0x4E,
    /// Depth buffer setup, environment 2
    Zbuf2 = 0x4F,
    /// Transfer source/destination buffers
    BitBltBuf = 0x50,
    /// Transfer rectangle positions
    TrxPos = 0x51,
    /// Transfer rectangle size
    TrxReg = 0x52,
    /// Transfer activation and direction
    TrxDir = 0x53,
    /// Transfer data port
    HwReg = 0x54,
    /// Signal event
    Signal = 0x60,
    /// Finish event
    Finish = 0x61,
    /// Label event
    Label = 0x62,
    /// No operation
    Nop = 0x7F,
}

impl Register {
    /// Decode a register address byte
    ///
    /// Returns `None` for addresses the GS does not define; the dispatch
    /// layer logs and skips those rather than treating them as errors.
    pub fn from_index(index: u8) -> Option<Self> {
        Some(match index {
            0x00 => Self::Prim,
            0x01 => Self::Rgbaq,
            0x02 => Self::St,
            0x03 => Self::Uv,
            0x04 => Self::Xyzf2,
            0x05 => Self::Xyz2,
            0x06 => Self::Tex0_1,
            0x07 => Self::Tex0_2,
            0x08 => Self::Clamp1,
            0x09 => Self::Clamp2,
            0x0A => Self::Fog,
            0x0C => Self::Xyzf3,
            0x0D => Self::Xyz3,
            0x14 => Self::Tex1_1,
            0x15 => Self::Tex1_2,
            0x16 => Self::Tex2_1,
            0x17 => Self::Tex2_2,
            0x18 => Self::XyOffset1,
            0x19 => Self::XyOffset2,
            0x1A => Self::PrModeCont,
            0x1B => Self::PrMode,
            0x1C => Self::TexClut,
            0x22 => Self::ScanMsk,
            0x34 => Self::MipTbp1_1,
            0x35 => Self::MipTbp1_2,
            0x36 => Self::MipTbp2_1,
            0x37 => Self::MipTbp2_2,
            0x3B => Self::TexA,
            0x3D => Self::FogCol,
            0x3F => Self::TexFlush,
            0x40 => Self::Scissor1,
            0x41 => Self::Scissor2,
            0x42 => Self::Alpha1,
            0x43 => Self::Alpha2,
            0x44 => Self::Dimx,
            0x45 => Self::Dthe,
            0x46 => Self::ColClamp,
            0x47 => Self::Test1,
            0x48 => Self::Test2,
            0x49 => Self::Pabe,
            0x4A => Self::Fba1,
            0x4B => Self::Fba2,
            0x4C => Self::Frame1,
            0x4D => Self::Frame2,
            0x4E => Self::Zbuf1,
            0x4F => Self::Zbuf2,
            0x50 => Self::BitBltBuf,
            0x51 => Self::TrxPos,
            0x52 => Self::TrxReg,
            0x53 => Self::TrxDir,
            0x54 => Self::HwReg,
            0x60 => Self::Signal,
            0x61 => Self::Finish,
            0x62 => Self::Label,
            0x7F => Self::Nop,
            _ => return None,
        })
    }
}

#[inline(always)]
fn bits(value: u64, lo: u32, count: u32) -> u64 {
    (value >> lo) & ((1u64 << count) - 1)
}

/// Primitive types selected by PRIM bits 0-2
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimKind {
    /// Independent points
    Point,
    /// Independent lines
    Line,
    /// Connected line strip
    LineStrip,
    /// Independent triangles
    Triangle,
    /// Connected triangle strip
    TriangleStrip,
    /// Triangle fan around the first vertex
    TriangleFan,
    /// Axis-aligned rectangle defined by two opposite corners
    Sprite,
    /// Reserved encoding; kicked vertices are discarded
    Invalid,
}

impl PrimKind {
    /// Decode PRIM bits 0-2
    pub fn from_bits(bits: u8) -> Self {
        match bits & 7 {
            0 => Self::Point,
            1 => Self::Line,
            2 => Self::LineStrip,
            3 => Self::Triangle,
            4 => Self::TriangleStrip,
            5 => Self::TriangleFan,
            6 => Self::Sprite,
            _ => Self::Invalid,
        }
    }

    /// Number of kicked vertices needed to complete one primitive
    pub fn vertex_count(self) -> usize {
        match self {
            Self::Point => 1,
            Self::Line | Self::LineStrip | Self::Sprite => 2,
            Self::Triangle | Self::TriangleStrip | Self::TriangleFan => 3,
            Self::Invalid => 1,
        }
    }

    /// Whether the primitive is a strip/fan that reuses earlier vertices
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            Self::LineStrip | Self::TriangleStrip | Self::TriangleFan
        )
    }
}

/// PRIM - primitive type and attribute flags
///
/// ```text
/// Bits 0-2:  PRIM  Primitive type
/// Bit  3:    IIP   Gouraud shading
/// Bit  4:    TME   Texture mapping
/// Bit  5:    FGE   Fog
/// Bit  6:    ABE   Alpha blending
/// Bit  7:    AA1   Antialiasing
/// Bit  8:    FST   UV (1) vs ST/Q (0) coordinates
/// Bit  9:    CTXT  Drawing environment selector
/// Bit  10:   FIX   Fixed fragment value (RGBAQ as-is)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prim {
    /// Primitive type
    pub kind: PrimKind,
    /// Gouraud shading enabled
    pub iip: bool,
    /// Texture mapping enabled
    pub tme: bool,
    /// Fog enabled
    pub fge: bool,
    /// Alpha blending enabled
    pub abe: bool,
    /// Antialiasing enabled
    pub aa1: bool,
    /// UV addressing (true) vs ST/Q (false)
    pub fst: bool,
    /// Drawing environment index (0 or 1)
    pub ctxt: usize,
    /// Fixed fragment value
    pub fix: bool,
}

impl Prim {
    /// Decode a PRIM register word
    pub fn from_u64(value: u64) -> Self {
        Self {
            kind: PrimKind::from_bits(bits(value, 0, 3) as u8),
            iip: bits(value, 3, 1) != 0,
            tme: bits(value, 4, 1) != 0,
            fge: bits(value, 5, 1) != 0,
            abe: bits(value, 6, 1) != 0,
            aa1: bits(value, 7, 1) != 0,
            fst: bits(value, 8, 1) != 0,
            ctxt: bits(value, 9, 1) as usize,
            fix: bits(value, 10, 1) != 0,
        }
    }

    /// Merge attribute flags from PRMODE, keeping this register's primitive
    /// type (used when PRMODECONT selects PRMODE as the attribute source)
    pub fn with_attributes_from(self, prmode: u64) -> Self {
        let mode = Self::from_u64(prmode);
        Self {
            kind: self.kind,
            ..mode
        }
    }
}

/// TEX0 - texture buffer, format, size and CLUT setup
///
/// ```text
/// Bits 0-13:  TBP0  Texture base pointer (blocks)
/// Bits 14-19: TBW   Texture buffer width (units of 64 texels)
/// Bits 20-25: PSM   Texture pixel format
/// Bits 26-29: TW    log2 of texture width
/// Bits 30-33: TH    log2 of texture height
/// Bit  34:    TCC   Alpha source (0 = RGB, 1 = RGBA/expanded)
/// Bits 35-36: TFX   Texture function
/// Bits 37-50: CBP   CLUT base pointer (blocks)
/// Bits 51-54: CPSM  CLUT entry format
/// Bit  55:    CSM   CLUT layout (0 = CSM1 swizzled, 1 = CSM2 linear)
/// Bits 56-60: CSA   CLUT entry offset (units of 16 entries)
/// Bits 61-63: CLD   CLUT load control
/// ```
///
/// # Examples
///
/// ```
/// use gsrx::core::gs::registers::Tex0;
///
/// let tex0 = Tex0::from_u64(0x5_9800_8100);
/// assert_eq!(tex0.tbp0, 0x100);
/// assert_eq!(tex0.tbw, 2);
/// assert_eq!(tex0.tw, 6); // 64 texels wide
/// assert_eq!(tex0.th, 6);
/// assert!(tex0.tcc);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tex0 {
    /// Texture base pointer in blocks
    pub tbp0: u32,
    /// Buffer width in units of 64 texels
    pub tbw: u32,
    /// Pixel format bits
    pub psm: u8,
    /// log2 of width
    pub tw: u32,
    /// log2 of height
    pub th: u32,
    /// Alpha comes from the texture (expanded for non-alpha formats)
    pub tcc: bool,
    /// Texture function
    pub tfx: TextureFunction,
    /// CLUT base pointer in blocks
    pub cbp: u32,
    /// CLUT entry format bits
    pub cpsm: u8,
    /// CSM2 linear CLUT layout
    pub csm2: bool,
    /// CLUT entry offset in units of 16 entries
    pub csa: u32,
    /// CLUT load control (0 = no load)
    pub cld: u8,
}

impl Tex0 {
    /// Decode a TEX0 register word
    pub fn from_u64(value: u64) -> Self {
        Self {
            tbp0: bits(value, 0, 14) as u32,
            tbw: bits(value, 14, 6) as u32,
            psm: bits(value, 20, 6) as u8,
            tw: (bits(value, 26, 4) as u32).min(10),
            th: (bits(value, 30, 4) as u32).min(10),
            tcc: bits(value, 34, 1) != 0,
            tfx: TextureFunction::from_bits(bits(value, 35, 2) as u8),
            cbp: bits(value, 37, 14) as u32,
            cpsm: bits(value, 51, 4) as u8,
            csm2: bits(value, 55, 1) != 0,
            csa: bits(value, 56, 5) as u32,
            cld: bits(value, 61, 3) as u8,
        }
    }

    /// Texture width in texels
    #[inline(always)]
    pub fn width(&self) -> u32 {
        1 << self.tw
    }

    /// Texture height in texels
    #[inline(always)]
    pub fn height(&self) -> u32 {
        1 << self.th
    }

    /// Mask for the TEX0 fields TEX2 is allowed to update
    /// (PSM, CBP, CPSM, CSM, CSA, CLD)
    pub const TEX2_MASK: u64 = 0xFFFF_FFE0_03F0_0000;
}

/// Texture functions (TFX)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureFunction {
    /// Texel * fragment color
    Modulate,
    /// Texel replaces fragment color
    Decal,
    /// Texel + fragment color, fragment alpha
    Highlight,
    /// Texel + fragment color, texel alpha
    Highlight2,
}

impl TextureFunction {
    fn from_bits(bits: u8) -> Self {
        match bits & 3 {
            0 => Self::Modulate,
            1 => Self::Decal,
            2 => Self::Highlight,
            _ => Self::Highlight2,
        }
    }
}

/// TEX1 - sampling and mipmap control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tex1 {
    /// LOD computation: false = per-pixel (LCM=0), true = fixed (LCM=1)
    pub lcm: bool,
    /// Maximum mipmap level (0 = no mipmapping)
    pub mxl: u32,
    /// Magnification uses linear filtering
    pub mmag_linear: bool,
    /// Minification filter bits (0-5)
    pub mmin: u8,
    /// Mipmap base addresses computed automatically from TBP0
    pub mtba: bool,
    /// LOD parameter L
    pub l: u32,
    /// LOD parameter K, signed 7.4 fixed point
    pub k: i32,
}

impl Tex1 {
    /// Decode a TEX1 register word
    pub fn from_u64(value: u64) -> Self {
        let k_raw = bits(value, 32, 12) as u32;
        // Sign-extend the 12-bit K field
        let k = ((k_raw << 20) as i32) >> 20;
        Self {
            lcm: bits(value, 0, 1) != 0,
            mxl: (bits(value, 2, 3) as u32).min(6),
            mmag_linear: bits(value, 5, 1) != 0,
            mmin: bits(value, 6, 3) as u8,
            mtba: bits(value, 9, 1) != 0,
            l: bits(value, 19, 2) as u32,
            k,
        }
    }

    /// Whether any mip level beyond the base can be sampled
    #[inline(always)]
    pub fn mipmaps_enabled(&self) -> bool {
        self.mxl > 0
    }
}

/// Wrap modes (WMS/WMT)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapMode {
    /// Coordinates wrap at the texture size
    Repeat,
    /// Coordinates clamp to the texture edge
    Clamp,
    /// Coordinates clamp to [MIN, MAX]
    RegionClamp,
    /// Coordinates wrap within a masked region
    RegionRepeat,
}

impl WrapMode {
    fn from_bits(bits: u8) -> Self {
        match bits & 3 {
            0 => Self::Repeat,
            1 => Self::Clamp,
            2 => Self::RegionClamp,
            _ => Self::RegionRepeat,
        }
    }
}

/// CLAMP - texture wrap modes and regions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clamp {
    /// Horizontal wrap mode
    pub wms: WrapMode,
    /// Vertical wrap mode
    pub wmt: WrapMode,
    /// Region minimum / mask U
    pub minu: u32,
    /// Region maximum / fix U
    pub maxu: u32,
    /// Region minimum / mask V
    pub minv: u32,
    /// Region maximum / fix V
    pub maxv: u32,
}

impl Clamp {
    /// Decode a CLAMP register word
    pub fn from_u64(value: u64) -> Self {
        Self {
            wms: WrapMode::from_bits(bits(value, 0, 2) as u8),
            wmt: WrapMode::from_bits(bits(value, 2, 2) as u8),
            minu: bits(value, 4, 10) as u32,
            maxu: bits(value, 14, 10) as u32,
            minv: bits(value, 24, 10) as u32,
            maxv: bits(value, 34, 10) as u32,
        }
    }
}

/// TEXA - alpha values for texel alpha expansion
///
/// 16-bit texels carry one alpha bit; 24-bit texels carry none. TEXA maps
/// those to 8-bit alpha: TA0 for bit 0 (and 24-bit texels), TA1 for bit 1,
/// with AEM forcing fully transparent black when the texel is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TexA {
    /// Alpha for texels with alpha bit 0 (and 24-bit texels)
    pub ta0: u8,
    /// Transparent black when RGB is all zero
    pub aem: bool,
    /// Alpha for texels with alpha bit 1
    pub ta1: u8,
}

impl TexA {
    /// Decode a TEXA register word
    pub fn from_u64(value: u64) -> Self {
        Self {
            ta0: bits(value, 0, 8) as u8,
            aem: bits(value, 15, 1) != 0,
            ta1: bits(value, 32, 8) as u8,
        }
    }
}

/// XYOFFSET - offset subtracted from kicked vertex coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct XyOffset {
    /// X offset, 12.4 fixed point
    pub ofx: u16,
    /// Y offset, 12.4 fixed point
    pub ofy: u16,
}

impl XyOffset {
    /// Decode an XYOFFSET register word
    pub fn from_u64(value: u64) -> Self {
        Self {
            ofx: bits(value, 0, 16) as u16,
            ofy: bits(value, 32, 16) as u16,
        }
    }
}

/// SCISSOR - drawing window in window coordinates (inclusive)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scissor {
    /// Left edge
    pub x0: u32,
    /// Right edge (inclusive)
    pub x1: u32,
    /// Top edge
    pub y0: u32,
    /// Bottom edge (inclusive)
    pub y1: u32,
}

impl Scissor {
    /// Decode a SCISSOR register word
    pub fn from_u64(value: u64) -> Self {
        Self {
            x0: bits(value, 0, 11) as u32,
            x1: bits(value, 16, 11) as u32,
            y0: bits(value, 32, 11) as u32,
            y1: bits(value, 48, 11) as u32,
        }
    }

    /// Scissor width in pixels (zero when degenerate)
    pub fn width(&self) -> u32 {
        (self.x1 + 1).saturating_sub(self.x0)
    }

    /// Scissor height in pixels (zero when degenerate)
    pub fn height(&self) -> u32 {
        (self.y1 + 1).saturating_sub(self.y0)
    }
}

/// Blend equation color inputs (ALPHA.A / B / D)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendInput {
    /// Source (fragment) color
    Source,
    /// Destination (frame buffer) color
    Dest,
    /// Constant zero
    Zero,
}

impl BlendInput {
    fn from_bits(bits: u8) -> Self {
        match bits & 3 {
            0 => Self::Source,
            1 => Self::Dest,
            // 3 is reserved and behaves as zero
            _ => Self::Zero,
        }
    }
}

/// Blend equation alpha factor (ALPHA.C)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendFactor {
    /// Source alpha
    SourceAlpha,
    /// Destination alpha
    DestAlpha,
    /// The FIX constant
    Fixed,
}

impl BlendFactor {
    fn from_bits(bits: u8) -> Self {
        match bits & 3 {
            0 => Self::SourceAlpha,
            1 => Self::DestAlpha,
            _ => Self::Fixed,
        }
    }
}

/// ALPHA - blend equation `out = ((A - B) * C >> 7) + D`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alpha {
    /// Minuend color
    pub a: BlendInput,
    /// Subtrahend color
    pub b: BlendInput,
    /// Multiplier
    pub c: BlendFactor,
    /// Addend color
    pub d: BlendInput,
    /// Constant used when C selects Fixed (128 = 1.0)
    pub fix: u8,
}

impl Alpha {
    /// Decode an ALPHA register word
    pub fn from_u64(value: u64) -> Self {
        Self {
            a: BlendInput::from_bits(bits(value, 0, 2) as u8),
            b: BlendInput::from_bits(bits(value, 2, 2) as u8),
            c: BlendFactor::from_bits(bits(value, 4, 2) as u8),
            d: BlendInput::from_bits(bits(value, 6, 2) as u8),
            fix: bits(value, 32, 8) as u8,
        }
    }
}

/// Alpha test comparison (TEST.ATST)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlphaTest {
    /// All pixels fail
    Never,
    /// All pixels pass
    Always,
    /// Pass when alpha < AREF
    Less,
    /// Pass when alpha <= AREF
    LessEqual,
    /// Pass when alpha == AREF
    Equal,
    /// Pass when alpha >= AREF
    GreaterEqual,
    /// Pass when alpha > AREF
    Greater,
    /// Pass when alpha != AREF
    NotEqual,
}

impl AlphaTest {
    fn from_bits(bits: u8) -> Self {
        match bits & 7 {
            0 => Self::Never,
            1 => Self::Always,
            2 => Self::Less,
            3 => Self::LessEqual,
            4 => Self::Equal,
            5 => Self::GreaterEqual,
            6 => Self::Greater,
            _ => Self::NotEqual,
        }
    }

    /// The logically inverted comparison, used by the two-pass alpha test
    /// split (`Equal` has no single-comparison inverse and maps to
    /// `NotEqual` and vice versa)
    pub fn inverted(self) -> Self {
        match self {
            Self::Never => Self::Always,
            Self::Always => Self::Never,
            Self::Less => Self::GreaterEqual,
            Self::LessEqual => Self::Greater,
            Self::Equal => Self::NotEqual,
            Self::GreaterEqual => Self::Less,
            Self::Greater => Self::LessEqual,
            Self::NotEqual => Self::Equal,
        }
    }
}

/// Action for pixels failing the alpha test (TEST.AFAIL)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlphaFail {
    /// Neither color nor depth is written
    Keep,
    /// Color is written, depth is not
    FbOnly,
    /// Depth is written, color is not
    ZbOnly,
    /// RGB is written, alpha and depth are not
    RgbOnly,
}

impl AlphaFail {
    fn from_bits(bits: u8) -> Self {
        match bits & 3 {
            0 => Self::Keep,
            1 => Self::FbOnly,
            2 => Self::ZbOnly,
            _ => Self::RgbOnly,
        }
    }
}

/// Depth test comparison (TEST.ZTST)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthTest {
    /// All pixels fail
    Never,
    /// All pixels pass
    Always,
    /// Pass when Z >= buffer
    GreaterEqual,
    /// Pass when Z > buffer
    Greater,
}

impl DepthTest {
    fn from_bits(bits: u8) -> Self {
        match bits & 3 {
            0 => Self::Never,
            1 => Self::Always,
            2 => Self::GreaterEqual,
            _ => Self::Greater,
        }
    }
}

/// TEST - alpha test, destination alpha test and depth test
///
/// ```text
/// Bit  0:     ATE    Alpha test enable
/// Bits 1-3:   ATST   Alpha test comparison
/// Bits 4-11:  AREF   Alpha reference value
/// Bits 12-13: AFAIL  Action on alpha-test failure
/// Bit  14:    DATE   Destination alpha test enable
/// Bit  15:    DATM   Destination alpha test polarity
/// Bit  16:    ZTE    Depth test enable
/// Bits 17-18: ZTST   Depth test comparison
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Test {
    /// Alpha test enabled
    pub ate: bool,
    /// Alpha test comparison
    pub atst: AlphaTest,
    /// Alpha reference value
    pub aref: u8,
    /// Action for failing pixels
    pub afail: AlphaFail,
    /// Destination alpha test enabled
    pub date: bool,
    /// Destination alpha polarity (false = pass on 0, true = pass on 1)
    pub datm: bool,
    /// Depth test enabled
    pub zte: bool,
    /// Depth comparison
    pub ztst: DepthTest,
}

impl Test {
    /// Decode a TEST register word
    pub fn from_u64(value: u64) -> Self {
        Self {
            ate: bits(value, 0, 1) != 0,
            atst: AlphaTest::from_bits(bits(value, 1, 3) as u8),
            aref: bits(value, 4, 8) as u8,
            afail: AlphaFail::from_bits(bits(value, 12, 2) as u8),
            date: bits(value, 14, 1) != 0,
            datm: bits(value, 15, 1) != 0,
            zte: bits(value, 16, 1) != 0,
            ztst: DepthTest::from_bits(bits(value, 17, 2) as u8),
        }
    }

    /// Effective alpha test, folding ATE=0 into `Always`
    pub fn effective_atst(&self) -> AlphaTest {
        if self.ate {
            self.atst
        } else {
            AlphaTest::Always
        }
    }
}

/// FRAME - color target setup
///
/// ```text
/// Bits 0-8:   FBP    Frame base pointer (units of 32 blocks / 2048 words)
/// Bits 16-21: FBW    Buffer width (units of 64 pixels)
/// Bits 24-29: PSM    Pixel format
/// Bits 32-63: FBMSK  Per-bit write mask (1 = bit not written)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Base pointer in blocks (the 9-bit page field scaled by 32)
    pub fbp: u32,
    /// Buffer width in units of 64 pixels
    pub fbw: u32,
    /// Pixel format bits
    pub psm: u8,
    /// Write mask, 1 bits are preserved in the frame buffer
    pub fbmsk: u32,
}

impl Frame {
    /// Decode a FRAME register word
    pub fn from_u64(value: u64) -> Self {
        Self {
            fbp: (bits(value, 0, 9) as u32) * 32,
            fbw: bits(value, 16, 6) as u32,
            psm: bits(value, 24, 6) as u8,
            fbmsk: bits(value, 32, 32) as u32,
        }
    }

    /// Whether the mask disables every color bit
    #[inline(always)]
    pub fn all_masked(&self) -> bool {
        self.fbmsk == u32::MAX
    }
}

/// ZBUF - depth target setup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Zbuf {
    /// Base pointer in blocks (the 9-bit page field scaled by 32)
    pub zbp: u32,
    /// Pixel format bits (depth formats only; bit 4 of PSM is implied)
    pub psm: u8,
    /// Depth writes disabled
    pub zmsk: bool,
}

impl Zbuf {
    /// Decode a ZBUF register word
    pub fn from_u64(value: u64) -> Self {
        Self {
            zbp: (bits(value, 0, 9) as u32) * 32,
            psm: (bits(value, 24, 4) as u8) | 0x30,
            zmsk: bits(value, 32, 1) != 0,
        }
    }
}

/// BITBLTBUF - source and destination buffers for transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BitBltBuf {
    /// Source base pointer in blocks
    pub sbp: u32,
    /// Source buffer width in units of 64 pixels
    pub sbw: u32,
    /// Source format bits
    pub spsm: u8,
    /// Destination base pointer in blocks
    pub dbp: u32,
    /// Destination buffer width in units of 64 pixels
    pub dbw: u32,
    /// Destination format bits
    pub dpsm: u8,
}

impl BitBltBuf {
    /// Decode a BITBLTBUF register word
    pub fn from_u64(value: u64) -> Self {
        Self {
            sbp: bits(value, 0, 14) as u32,
            sbw: bits(value, 16, 6) as u32,
            spsm: bits(value, 24, 6) as u8,
            dbp: bits(value, 32, 14) as u32,
            dbw: bits(value, 48, 6) as u32,
            dpsm: bits(value, 56, 6) as u8,
        }
    }
}

/// TRXPOS - transfer rectangle origins and pixel order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrxPos {
    /// Source rectangle X origin
    pub ssax: u32,
    /// Source rectangle Y origin
    pub ssay: u32,
    /// Destination rectangle X origin
    pub dsax: u32,
    /// Destination rectangle Y origin
    pub dsay: u32,
    /// Pixel transmission order for local-to-local copies (0 = UL->LR)
    pub dir: u8,
}

impl TrxPos {
    /// Decode a TRXPOS register word
    pub fn from_u64(value: u64) -> Self {
        Self {
            ssax: bits(value, 0, 11) as u32,
            ssay: bits(value, 16, 11) as u32,
            dsax: bits(value, 32, 11) as u32,
            dsay: bits(value, 48, 11) as u32,
            dir: bits(value, 59, 2) as u8,
        }
    }
}

/// TRXREG - transfer rectangle size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrxReg {
    /// Width in pixels
    pub rrw: u32,
    /// Height in pixels
    pub rrh: u32,
}

impl TrxReg {
    /// Decode a TRXREG register word
    pub fn from_u64(value: u64) -> Self {
        Self {
            rrw: bits(value, 0, 12) as u32,
            rrh: bits(value, 32, 12) as u32,
        }
    }
}

/// Transfer directions (TRXDIR.XDIR)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDir {
    /// Host to local memory (data arrives through HWREG)
    HostToLocal,
    /// Local memory to host
    LocalToHost,
    /// Local memory to local memory
    LocalToLocal,
    /// Transfers deactivated
    Off,
}

impl TransferDir {
    /// Decode TRXDIR bits 0-1
    pub fn from_bits(bits: u8) -> Self {
        match bits & 3 {
            0 => Self::HostToLocal,
            1 => Self::LocalToHost,
            2 => Self::LocalToLocal,
            _ => Self::Off,
        }
    }
}

/// TEXCLUT - CLUT position when CSM2 layout is used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TexClut {
    /// CLUT buffer width in units of 64 pixels
    pub cbw: u32,
    /// CLUT offset U in units of 16 pixels
    pub cou: u32,
    /// CLUT offset V
    pub cov: u32,
}

impl TexClut {
    /// Decode a TEXCLUT register word
    pub fn from_u64(value: u64) -> Self {
        Self {
            cbw: bits(value, 0, 6) as u32,
            cou: bits(value, 6, 6) as u32,
            cov: bits(value, 12, 10) as u32,
        }
    }
}

/// DIMX - 4x4 dither matrix of signed 3-bit values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimx {
    /// Matrix entries in row-major order, each in -4..=3
    pub matrix: [[i8; 4]; 4],
}

impl Dimx {
    /// Decode a DIMX register word
    pub fn from_u64(value: u64) -> Self {
        let mut matrix = [[0i8; 4]; 4];
        for (y, row) in matrix.iter_mut().enumerate() {
            for (x, cell) in row.iter_mut().enumerate() {
                let raw = bits(value, ((y * 4 + x) * 4) as u32, 3) as u8;
                // Sign-extend 3-bit entries
                *cell = ((raw << 5) as i8) >> 5;
            }
        }
        Self { matrix }
    }
}

/// FOGCOL - fog color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FogCol {
    /// Red
    pub r: u8,
    /// Green
    pub g: u8,
    /// Blue
    pub b: u8,
}

impl FogCol {
    /// Decode a FOGCOL register word
    pub fn from_u64(value: u64) -> Self {
        Self {
            r: bits(value, 0, 8) as u8,
            g: bits(value, 8, 8) as u8,
            b: bits(value, 16, 8) as u8,
        }
    }
}

/// Raster scan masks (SCANMSK.MSK)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMask {
    /// All rows drawn
    Normal,
    /// Even rows skipped
    SkipEven,
    /// Odd rows skipped
    SkipOdd,
}

impl ScanMask {
    /// Decode SCANMSK bits 0-1
    pub fn from_bits(bits: u8) -> Self {
        match bits & 3 {
            2 => Self::SkipEven,
            3 => Self::SkipOdd,
            _ => Self::Normal,
        }
    }
}
