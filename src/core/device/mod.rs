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

//! Device backend contract
//!
//! The renderer core never talks to a graphics API. It produces one
//! [`DrawConfig`] per primitive batch and hands it to a [`DeviceBackend`];
//! everything optional in the config is gated beforehand by the backend's
//! [`DeviceCaps`], so a conforming backend never sees a feature it does not
//! support. This trait is the single surface a new graphics API has to
//! implement.
//!
//! [`NullDevice`] discards everything (headless operation);
//! [`RecordingDevice`] keeps a log of calls for tests and the replay tool.

use bitflags::bitflags;

use crate::core::gs::registers::{AlphaTest, DepthTest};
use crate::core::gs::vertex::GsVertex;
use crate::core::vmem::format::PixelRect;

/// Optional-feature flags a backend reports once at startup
///
/// Every decision stage reads these before picking a strategy; a feature
/// that is off here is never requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCaps {
    /// Read-modify-write barriers against the bound render target
    pub texture_barrier: bool,
    /// Dual-source blending factors
    pub dual_source_blend: bool,
    /// Reading the framebuffer inside the fragment shader
    pub framebuffer_fetch: bool,
    /// Stencil attachment support (DATE pre-pass)
    pub stencil: bool,
    /// Per-primitive ID tracking in the shader (DATE without pre-pass)
    pub primid_tracking: bool,
    /// Point/line expansion to quads on the GPU
    pub prim_expansion: bool,
    /// Automatic mipmap generation
    pub generate_mipmaps: bool,
}

impl Default for DeviceCaps {
    /// A conservative backend: barriers only
    fn default() -> Self {
        Self {
            texture_barrier: true,
            dual_source_blend: false,
            framebuffer_fetch: false,
            stencil: false,
            primid_tracking: false,
            prim_expansion: false,
            generate_mipmaps: false,
        }
    }
}

impl DeviceCaps {
    /// A fully featured backend (used by tests)
    pub fn all() -> Self {
        Self {
            texture_barrier: true,
            dual_source_blend: true,
            framebuffer_fetch: true,
            stencil: true,
            primid_tracking: true,
            prim_expansion: true,
            generate_mipmaps: true,
        }
    }
}

/// Opaque handle to a device texture
///
/// Issued by [`DeviceBackend::create_texture`]; meaningless outside the
/// backend that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub u64);

/// What a device texture stores
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureKind {
    /// RGBA8 color
    Color,
    /// 32-bit depth
    Depth,
    /// 8-bit palette indices, sampled through a palette texture
    Index,
}

bitflags! {
    /// Per-draw fragment shader features
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ShaderFlags: u32 {
        /// Sample the bound texture
        const TEXTURE = 1 << 0;
        /// Interpolate vertex color (flat otherwise)
        const GOURAUD = 1 << 1;
        /// Apply fog toward FOGCOL
        const FOG = 1 << 2;
        /// Texel coordinates are UV (ST/Q otherwise)
        const FST = 1 << 3;
        /// Reinterpret a 16-bit target sampled at 16 bits (texture shuffle)
        const TEXTURE_SHUFFLE = 1 << 4;
        /// Read one channel of the source as the output value
        const CHANNEL_SHUFFLE = 1 << 5;
        /// The bound texture is the bound render target
        const TEX_IS_FB = 1 << 6;
        /// Blend in the shader instead of fixed-function hardware
        const SW_BLEND = 1 << 7;
        /// Hardware blend with shader-side factor splitting
        const BLEND_MIX = 1 << 8;
        /// Accumulation blend: shader multiplies, hardware adds
        const BLEND_ACCU = 1 << 9;
        /// Wrap blended color at 8 bits instead of clamping
        const COLCLIP = 1 << 10;
        /// Ordered dithering through the DIMX matrix
        const DITHER = 1 << 11;
        /// Per-pixel alpha blend enable (PABE)
        const PABE = 1 << 12;
        /// Force output alpha bit 7 on (FBA)
        const FBA = 1 << 13;
        /// Expand texel alpha through TEXA
        const AEM = 1 << 14;
        /// Sample palette through the bound CLUT texture
        const PALETTE = 1 << 15;
    }
}

/// Source channel selected by a channel-shuffle draw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSelect {
    /// Red
    Red,
    /// Green
    Green,
    /// Blue
    Blue,
    /// Alpha
    Alpha,
}

/// Primitive topology of a draw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// Independent points
    Points,
    /// Independent lines
    Lines,
    /// Independent triangles
    Triangles,
    /// Corner pairs expanded to quads on the GPU
    Sprites,
}

/// Hardware blend factor selectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendFactor {
    /// 0
    Zero,
    /// 1
    One,
    /// Source alpha
    SrcAlpha,
    /// 1 - source alpha
    InvSrcAlpha,
    /// Destination alpha
    DstAlpha,
    /// 1 - destination alpha
    InvDstAlpha,
    /// The constant in [`HwBlend::constant`]
    Constant,
    /// 1 - the constant
    InvConstant,
}

/// Hardware blend equation operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendOp {
    /// src*sf + dst*df
    Add,
    /// src*sf - dst*df
    Subtract,
    /// dst*df - src*sf
    ReverseSubtract,
}

/// One fixed-function blend state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwBlend {
    /// Equation operator
    pub op: BlendOp,
    /// Source factor
    pub src: BlendFactor,
    /// Destination factor
    pub dst: BlendFactor,
    /// Constant factor value (128 = 1.0)
    pub constant: u8,
}

/// Destination-alpha-test strategy baked into a draw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateMode {
    /// DATE disabled
    Off,
    /// Stencil pre-pass marks passing pixels before the color pass
    StencilPrepass,
    /// Shader tracks the winning primitive ID per pixel
    PrimIdTracking,
    /// Shader reads destination alpha directly under a barrier
    ReadBarrier,
}

/// Read-modify-write synchronization a draw requires
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BarrierReq {
    /// No barrier
    None,
    /// One barrier before the draw
    Once,
    /// A barrier between every primitive
    PerPrimitive,
}

/// Texture binding of a draw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureBinding {
    /// Sampled texture
    pub texture: TextureId,
    /// Palette texture for indexed formats
    pub palette: Option<TextureId>,
    /// Texture size in texels (for coordinate normalization)
    pub size: (u32, u32),
    /// Linear magnification filtering
    pub linear: bool,
    /// Mip levels bound beyond the base
    pub mip_levels: u32,
    /// Levels are generated by the device rather than uploaded
    pub auto_mips: bool,
}

/// Depth configuration of a draw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthState {
    /// Comparison; `Always` with `write` off means depth is inert
    pub test: DepthTest,
    /// Depth writes enabled
    pub write: bool,
}

/// The single artifact the orchestrator produces per batch
///
/// Transient: built, consumed by [`DeviceBackend::draw`], dropped. Exactly
/// one exists per primitive batch; two-pass draws submit two configs that
/// share buffers.
#[derive(Debug, Clone)]
pub struct DrawConfig {
    /// Primitive topology
    pub topology: Topology,
    /// Vertex data
    pub vertices: Vec<GsVertex>,
    /// Indices into `vertices`
    pub indices: Vec<u32>,
    /// Color target, if color writes are on
    pub target: Option<TextureId>,
    /// Depth target, if depth testing or writing is on
    pub depth_target: Option<TextureId>,
    /// Sampled texture
    pub texture: Option<TextureBinding>,
    /// Fragment shader features
    pub flags: ShaderFlags,
    /// Channel for `CHANNEL_SHUFFLE` draws
    pub channel: Option<ChannelSelect>,
    /// Alpha test comparison (folded to `Always` when disabled)
    pub atst: AlphaTest,
    /// Alpha test reference value
    pub aref: u8,
    /// Fixed-function blend, when the strategy uses one
    pub blend: Option<HwBlend>,
    /// RGBA channel write mask, bit per channel
    pub color_mask: u8,
    /// Per-bit frame write mask (FBMSK) for masked formats
    pub fbmsk: u32,
    /// Depth test/write state
    pub depth: DepthState,
    /// Destination alpha test mode
    pub date: DateMode,
    /// DATE polarity (pass on alpha bit set)
    pub datm: bool,
    /// Scissor rectangle in device pixels
    pub scissor: PixelRect,
    /// Barrier requirement
    pub barrier: BarrierReq,
    /// Dither matrix when dithering is on
    pub dither: Option<[[i8; 4]; 4]>,
    /// Fog color for `FOG` draws
    pub fog_color: [u8; 3],
}

/// Backend interface the renderer drives
///
/// All calls happen on the renderer thread. Resource handles are valid
/// from `create_texture` until `destroy_texture`; the texture cache owns
/// that lifecycle.
pub trait DeviceBackend {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Capability flags, queried once and cached by the orchestrator
    fn caps(&self) -> DeviceCaps;

    /// Allocate a texture; contents are undefined until uploaded
    fn create_texture(&mut self, width: u32, height: u32, kind: TextureKind) -> TextureId;

    /// Upload RGBA8 (or raw depth) rows into a sub-rectangle
    fn upload_texture(&mut self, id: TextureId, rect: PixelRect, data: &[u8]);

    /// Upload one explicit mip level (backends without automatic
    /// generation receive every level this way)
    fn upload_mip(&mut self, id: TextureId, level: u32, rect: PixelRect, data: &[u8]);

    /// Release a texture
    fn destroy_texture(&mut self, id: TextureId);

    /// Copy a sub-rectangle between same-kind textures (target growth)
    fn copy_texture(&mut self, src: TextureId, dst: TextureId, rect: PixelRect);

    /// Fill a whole target with a constant value
    fn clear(&mut self, id: TextureId, value: u32);

    /// Read a sub-rectangle back as RGBA8 rows
    ///
    /// `None` when the backend cannot read back (headless); the caller
    /// then treats emulated local memory as authoritative.
    fn read_texture(&mut self, id: TextureId, rect: PixelRect) -> Option<Vec<u8>>;

    /// Execute one draw configuration
    fn draw(&mut self, config: &DrawConfig);
}

/// Backend that discards all work
///
/// Used headless and as the inner fallback of tests that only watch the
/// orchestrator's decisions.
pub struct NullDevice {
    caps: DeviceCaps,
    next_texture: u64,
}

impl NullDevice {
    /// Create with the given capability flags
    pub fn new(caps: DeviceCaps) -> Self {
        Self {
            caps,
            next_texture: 1,
        }
    }
}

impl Default for NullDevice {
    fn default() -> Self {
        Self::new(DeviceCaps::default())
    }
}

impl DeviceBackend for NullDevice {
    fn name(&self) -> &str {
        "null"
    }

    fn caps(&self) -> DeviceCaps {
        self.caps
    }

    fn create_texture(&mut self, _width: u32, _height: u32, _kind: TextureKind) -> TextureId {
        let id = TextureId(self.next_texture);
        self.next_texture += 1;
        id
    }

    fn upload_texture(&mut self, _id: TextureId, _rect: PixelRect, _data: &[u8]) {}

    fn upload_mip(&mut self, _id: TextureId, _level: u32, _rect: PixelRect, _data: &[u8]) {}

    fn destroy_texture(&mut self, _id: TextureId) {}

    fn copy_texture(&mut self, _src: TextureId, _dst: TextureId, _rect: PixelRect) {}

    fn clear(&mut self, _id: TextureId, _value: u32) {}

    fn read_texture(&mut self, _id: TextureId, _rect: PixelRect) -> Option<Vec<u8>> {
        None
    }

    fn draw(&mut self, _config: &DrawConfig) {}
}

/// One recorded backend call
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// `create_texture` result and arguments
    CreateTexture {
        /// Issued handle
        id: TextureId,
        /// Width in pixels
        width: u32,
        /// Height in pixels
        height: u32,
        /// Color or depth
        kind: TextureKind,
    },
    /// `upload_texture` arguments (data reduced to its length)
    Upload {
        /// Destination texture
        id: TextureId,
        /// Destination rectangle
        rect: PixelRect,
        /// Payload size in bytes
        bytes: usize,
    },
    /// `destroy_texture` argument
    Destroy(TextureId),
    /// `copy_texture` arguments
    Copy {
        /// Source texture
        src: TextureId,
        /// Destination texture
        dst: TextureId,
        /// Copied rectangle
        rect: PixelRect,
    },
    /// `clear` arguments
    Clear {
        /// Cleared texture
        id: TextureId,
        /// Fill value
        value: u32,
    },
    /// A full draw configuration
    Draw(Box<DrawConfig>),
}

/// Backend that records every call for later inspection
pub struct RecordingDevice {
    caps: DeviceCaps,
    next_texture: u64,
    /// Recorded calls in submission order
    pub events: Vec<DeviceEvent>,
}

impl RecordingDevice {
    /// Create with the given capability flags
    pub fn new(caps: DeviceCaps) -> Self {
        Self {
            caps,
            next_texture: 1,
            events: Vec::new(),
        }
    }

    /// Recorded draw configs, in order
    pub fn draws(&self) -> impl Iterator<Item = &DrawConfig> {
        self.events.iter().filter_map(|e| match e {
            DeviceEvent::Draw(config) => Some(config.as_ref()),
            _ => None,
        })
    }

    /// Number of recorded draws
    pub fn draw_count(&self) -> usize {
        self.draws().count()
    }

    /// Number of recorded clears
    pub fn clear_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, DeviceEvent::Clear { .. }))
            .count()
    }
}

impl DeviceBackend for RecordingDevice {
    fn name(&self) -> &str {
        "recording"
    }

    fn caps(&self) -> DeviceCaps {
        self.caps
    }

    fn create_texture(&mut self, width: u32, height: u32, kind: TextureKind) -> TextureId {
        let id = TextureId(self.next_texture);
        self.next_texture += 1;
        self.events.push(DeviceEvent::CreateTexture {
            id,
            width,
            height,
            kind,
        });
        id
    }

    fn upload_texture(&mut self, id: TextureId, rect: PixelRect, data: &[u8]) {
        self.events.push(DeviceEvent::Upload {
            id,
            rect,
            bytes: data.len(),
        });
    }

    fn upload_mip(&mut self, id: TextureId, _level: u32, rect: PixelRect, data: &[u8]) {
        self.events.push(DeviceEvent::Upload {
            id,
            rect,
            bytes: data.len(),
        });
    }

    fn destroy_texture(&mut self, id: TextureId) {
        self.events.push(DeviceEvent::Destroy(id));
    }

    fn copy_texture(&mut self, src: TextureId, dst: TextureId, rect: PixelRect) {
        self.events.push(DeviceEvent::Copy { src, dst, rect });
    }

    fn clear(&mut self, id: TextureId, value: u32) {
        self.events.push(DeviceEvent::Clear { id, value });
    }

    fn read_texture(&mut self, _id: TextureId, _rect: PixelRect) -> Option<Vec<u8>> {
        None
    }

    fn draw(&mut self, config: &DrawConfig) {
        self.events.push(DeviceEvent::Draw(Box::new(config.clone())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_device_issues_distinct_ids() {
        let mut device = NullDevice::default();
        let a = device.create_texture(64, 64, TextureKind::Color);
        let b = device.create_texture(64, 64, TextureKind::Depth);
        assert_ne!(a, b);
    }

    #[test]
    fn test_recording_device_keeps_order() {
        let mut device = RecordingDevice::new(DeviceCaps::all());
        let id = device.create_texture(32, 32, TextureKind::Color);
        device.clear(id, 0xFF00FF00);
        device.upload_texture(id, PixelRect::from_size(0, 0, 8, 8), &[0u8; 256]);
        device.destroy_texture(id);

        assert_eq!(device.events.len(), 4);
        assert!(matches!(device.events[0], DeviceEvent::CreateTexture { .. }));
        assert!(matches!(device.events[1], DeviceEvent::Clear { .. }));
        assert!(matches!(device.events[2], DeviceEvent::Upload { bytes: 256, .. }));
        assert!(matches!(device.events[3], DeviceEvent::Destroy(_)));
        assert_eq!(device.clear_count(), 1);
        assert_eq!(device.draw_count(), 0);
    }

    #[test]
    fn test_barrier_ordering() {
        assert!(BarrierReq::None < BarrierReq::Once);
        assert!(BarrierReq::Once < BarrierReq::PerPrimitive);
    }
}
