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

//! Draw classification
//!
//! Runs ahead of the normal draw cost and catches patterns that are
//! cheaper (or only correct) outside the GPU path:
//!
//! - a full-buffer constant write becomes a direct memory clear
//! - a narrow untextured write that smells like a palette update runs on
//!   the CPU so the following CLUT load needs no readback
//! - a tiny untested sprite copy runs on the CPU instead of thrashing the
//!   cache with a one-off source
//! - draws re-reading their own target at a different bit depth are
//!   flagged as texture/channel shuffles and rewritten to one quad
//!
//! Order matters: the clear test runs first (it is also a sprite write),
//! then the narrow and tiny CPU paths, then shuffle detection.

use crate::core::cache::TextureCache;
use crate::core::config::HeuristicsConfig;
use crate::core::device::{ChannelSelect, DeviceBackend};
use crate::core::gs::registers::{AlphaTest, DepthTest, TextureFunction};
use crate::core::gs::vertex::{GsVertex, PrimClass};
use crate::core::vmem::format::{PixelRect, Psm};
use crate::core::vmem::LocalMemory;

use super::DrawState;

/// What the classify stage decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Executed as a direct memory clear; no draw
    Clear,
    /// Executed on the CPU as a palette-style write; no draw
    ClutDraw,
    /// Executed on the CPU as a per-pixel copy; no draw
    CpuBlit,
    /// Continue the GPU path, rewritten as a texture shuffle
    TextureShuffle,
    /// Continue the GPU path, rewritten as a channel shuffle
    ChannelShuffle(ChannelSelect),
    /// Plain draw
    Draw,
}

/// Everything the fast paths may touch
pub struct ClassifyCtx<'a> {
    /// Decoded draw state
    pub draw: &'a DrawState,
    /// Batch vertices
    pub vertices: &'a [GsVertex],
    /// Batch indices
    pub indices: &'a [u32],
    /// Tuning thresholds
    pub heuristics: &'a HeuristicsConfig,
    /// Emulated local memory
    pub mem: &'a mut LocalMemory,
    /// Video-memory cache
    pub cache: &'a mut TextureCache,
    /// Device backend
    pub device: &'a mut dyn DeviceBackend,
}

/// Run all fast-path detectors against a batch
pub fn classify(ctx: &mut ClassifyCtx) -> Classification {
    if try_clear(ctx) {
        return Classification::Clear;
    }
    if try_clut_draw(ctx) {
        return Classification::ClutDraw;
    }
    if try_cpu_blit(ctx) {
        return Classification::CpuBlit;
    }
    detect_shuffle(ctx)
}

/// Whether the draw writes pixels unconditionally
fn writes_unconditionally(draw: &DrawState) -> bool {
    !draw.prim.abe
        && draw.test.effective_atst() == AlphaTest::Always
        && !draw.test.date
        && (!draw.test.zte || draw.test.ztst == DepthTest::Always)
}

/// Whether the draw leaves the depth buffer alone
fn depth_inert(draw: &DrawState) -> bool {
    (!draw.test.zte || draw.test.ztst == DepthTest::Always) && draw.zbuf.zmsk
}

/// (a) Full-buffer constant-color write -> direct memory clear
fn try_clear(ctx: &mut ClassifyCtx) -> bool {
    let draw = ctx.draw;
    if draw.class != PrimClass::Sprite
        || draw.prim.tme
        || !writes_unconditionally(draw)
        || !draw.trace.constant_color()
        || draw.frame.fbmsk != 0
    {
        return false;
    }
    // Full buffer: the batch covers the whole scissor window, and the
    // window starts at the buffer origin
    if draw.scissor_rect.x0 != 0
        || draw.scissor_rect.y0 != 0
        || !draw.draw_rect.contains(&draw.scissor_rect)
    {
        return false;
    }
    let depth_write = !draw.zbuf.zmsk;
    if depth_write && !draw.trace.constant_z() {
        return false;
    }

    let rect = draw.scissor_rect;
    let color = u32::from_le_bytes(ctx.vertices[ctx.indices[0] as usize].rgba);
    let raw = rgba_to_raw(draw.frame_psm, color);
    log::debug!(
        "Clear fast path: bp={:#x} {:?} {}x{} = {:#010x}",
        draw.frame.fbp,
        draw.frame_psm,
        rect.width(),
        rect.height(),
        raw
    );

    ctx.mem
        .fill_rect(draw.frame.fbp, draw.frame.fbw, rect, draw.frame_psm, raw);
    sync_cleared_target(ctx, draw.frame.fbp, draw.frame.fbw, draw.frame_psm, rect, raw);

    if depth_write {
        let z = ctx.draw.trace.min_z;
        ctx.mem
            .fill_rect(draw.zbuf.zbp, draw.frame.fbw, rect, draw.z_psm, z);
        sync_cleared_target(ctx, draw.zbuf.zbp, draw.frame.fbw, draw.z_psm, rect, z);
    }
    true
}

/// Reconcile a live target with a clear both memory and device have seen
fn sync_cleared_target(
    ctx: &mut ClassifyCtx,
    base: u32,
    buffer_width: u32,
    psm: Psm,
    rect: PixelRect,
    value: u32,
) {
    // Sources over the range are stale either way
    ctx.cache
        .invalidate_video_mem(ctx.device, base, buffer_width, psm, rect);
    if let Some(handle) = ctx.cache.target_covering(base, psm) {
        if let Some(target) = ctx.cache.target_mut(handle) {
            let texture = target.texture;
            target.valid = PixelRect::from_size(0, 0, target.size.0, target.size.1);
            target.dirty.drain();
            target.gpu_dirty = PixelRect::default();
            ctx.device.clear(texture, value);
        }
    }
}

/// (d) Narrow untextured write -> CPU palette-style draw
///
/// Palette uploads rendered through the GS are a handful of pixels wide;
/// running them on the CPU keeps the following CLUT load from reading
/// back a target.
fn try_clut_draw(ctx: &mut ClassifyCtx) -> bool {
    let draw = ctx.draw;
    if !ctx.heuristics.cpu_clut_draw
        || draw.class != PrimClass::Sprite
        || draw.prim.tme
        || !writes_unconditionally(draw)
        || !depth_inert(draw)
        || draw.frame.fbmsk != 0
        || draw.draw_rect.width() > ctx.heuristics.clut_draw_max_width
    {
        return false;
    }

    log::debug!(
        "CPU CLUT-style draw: bp={:#x} {} sprite(s), {}x{}",
        draw.frame.fbp,
        ctx.indices.len() / 2,
        draw.draw_rect.width(),
        draw.draw_rect.height()
    );
    for pair in ctx.indices.chunks_exact(2) {
        let v0 = &ctx.vertices[pair[0] as usize];
        let v1 = &ctx.vertices[pair[1] as usize];
        let rect = sprite_rect(v0, v1).intersection(&draw.scissor_rect);
        if rect.is_empty() {
            continue;
        }
        // Sprites are flat: the closing vertex carries the color
        let raw = rgba_to_raw(draw.frame_psm, u32::from_le_bytes(v1.rgba));
        ctx.mem
            .fill_rect(draw.frame.fbp, draw.frame.fbw, rect, draw.frame_psm, raw);
    }
    ctx.cache.invalidate_video_mem(
        ctx.device,
        draw.frame.fbp,
        draw.frame.fbw,
        draw.frame_psm,
        draw.draw_rect,
    );
    true
}

/// (b) Tiny untested textured sprite -> CPU per-pixel copy
fn try_cpu_blit(ctx: &mut ClassifyCtx) -> bool {
    let draw = ctx.draw;
    let Some(tex) = &draw.tex else {
        return false;
    };
    if draw.class != PrimClass::Sprite
        || ctx.indices.len() != 2
        || !draw.prim.fst
        || !writes_unconditionally(draw)
        || !depth_inert(draw)
        || draw.frame.fbmsk != 0
        || tex.tex1.mipmaps_enabled()
        || draw.draw_rect.width() > ctx.heuristics.cpu_blit_max_size
        || draw.draw_rect.height() > ctx.heuristics.cpu_blit_max_size
    {
        return false;
    }
    // Only plain copies: Decal, or Modulate by the neutral color
    let v1 = &ctx.vertices[ctx.indices[1] as usize];
    let neutral = v1.rgba[0] == 0x80 && v1.rgba[1] == 0x80 && v1.rgba[2] == 0x80;
    match tex.tex0.tfx {
        TextureFunction::Decal => {}
        TextureFunction::Modulate if neutral => {}
        _ => return false,
    }
    // Sampling a render target on the CPU would need a readback; that is
    // exactly what this path exists to avoid
    if ctx.cache.target_covering(tex.tex0.tbp0, tex.psm).is_some() {
        return false;
    }

    let v0 = &ctx.vertices[ctx.indices[0] as usize];
    let dest = sprite_rect(v0, v1).intersection(&draw.scissor_rect);
    if dest.is_empty() {
        return true; // scissored out entirely; nothing to draw either way
    }

    log::debug!(
        "CPU blit: {}x{} from bp={:#x} to bp={:#x}",
        dest.width(),
        dest.height(),
        tex.tex0.tbp0,
        draw.frame.fbp
    );

    let (u0, v0t) = (v0.u as f32 / 16.0, v0.v as f32 / 16.0);
    let (u1, v1t) = (v1.u as f32 / 16.0, v1.v as f32 / 16.0);
    let texa = ctx.draw.texa;
    for y in dest.y0..dest.y1 {
        let fy = (y - dest.y0) as f32 / dest.height() as f32;
        let tv = (v0t + (v1t - v0t) * fy) as u32 % tex.tex0.height();
        for x in dest.x0..dest.x1 {
            let fx = (x - dest.x0) as f32 / dest.width() as f32;
            let tu = (u0 + (u1 - u0) * fx) as u32 % tex.tex0.width();
            let rgba = ctx.mem.read_texture_rgba(
                tex.tex0.tbp0,
                tex.tex0.tbw,
                PixelRect::from_size(tu, tv, 1, 1),
                tex.psm,
                texa,
                tex.tex0.csa,
            );
            let texel = u32::from_le_bytes([rgba[0], rgba[1], rgba[2], rgba[3]]);
            ctx.mem.write_pixel(
                draw.frame.fbp,
                draw.frame.fbw,
                x,
                y,
                draw.frame_psm,
                rgba_to_raw(draw.frame_psm, texel),
            );
        }
    }
    ctx.cache.invalidate_video_mem(
        ctx.device,
        draw.frame.fbp,
        draw.frame.fbw,
        draw.frame_psm,
        dest,
    );
    true
}

/// (c) Shuffle signatures: a target re-read at a different interpretation
fn detect_shuffle(ctx: &mut ClassifyCtx) -> Classification {
    let draw = ctx.draw;
    let Some(tex) = &draw.tex else {
        return Classification::Draw;
    };
    if draw.class != PrimClass::Sprite || !draw.prim.tme {
        return Classification::Draw;
    }

    // Texture shuffle: 16-bit texels over a 16-bit target at the same
    // base; the draw is moving the high/low halves of its own pixels
    if tex.psm.is_16bit() && draw.frame_psm.is_16bit() && tex.tex0.tbp0 == draw.frame.fbp {
        log::debug!("Texture shuffle detected at bp={:#x}", draw.frame.fbp);
        return Classification::TextureShuffle;
    }

    // Channel shuffle: indexed texels aliasing a live 32-bit target; the
    // draw is reading one byte channel of each pixel
    if tex.psm.is_indexed()
        && ctx.cache.target_covering(tex.tex0.tbp0, Psm::Ct32).is_some()
    {
        let channel = match tex.psm {
            Psm::T8h | Psm::T4hh => ChannelSelect::Alpha,
            Psm::T4hl => ChannelSelect::Blue,
            // 8-bit reads of the low bytes favor green in practice; exact
            // selection would need CLUT content analysis
            _ => ChannelSelect::Green,
        };
        log::debug!(
            "Channel shuffle detected at bp={:#x}: {:?}",
            tex.tex0.tbp0,
            channel
        );
        return Classification::ChannelShuffle(channel);
    }

    Classification::Draw
}

/// Rectangle covered by a sprite's two corners
pub fn sprite_rect(v0: &GsVertex, v1: &GsVertex) -> PixelRect {
    let x0 = v0.x_px().min(v1.x_px()).floor().max(0.0) as u32;
    let y0 = v0.y_px().min(v1.y_px()).floor().max(0.0) as u32;
    let x1 = v0.x_px().max(v1.x_px()).ceil().max(0.0) as u32;
    let y1 = v0.y_px().max(v1.y_px()).ceil().max(0.0) as u32;
    PixelRect::new(x0, y0, x1, y1)
}

/// Compress an RGBA8 value to a format's raw pixel bits
pub fn rgba_to_raw(psm: Psm, rgba: u32) -> u32 {
    match psm.as_color() {
        Psm::Ct16 | Psm::Ct16s => {
            ((rgba >> 3) & 0x1F)
                | (((rgba >> 11) & 0x1F) << 5)
                | (((rgba >> 19) & 0x1F) << 10)
                | ((rgba >> 31) << 15)
        }
        Psm::Ct24 => rgba & 0x00FF_FFFF,
        _ => rgba,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::Zeroable;

    #[test]
    fn test_rgba_to_raw_ct16() {
        // Pure red with alpha bit
        let raw = rgba_to_raw(Psm::Ct16, 0x8000_00F8);
        assert_eq!(raw, 0x801F);
        // Depth twin uses the same packing
        assert_eq!(rgba_to_raw(Psm::Z16, 0x8000_00F8), 0x801F);
    }

    #[test]
    fn test_rgba_to_raw_ct24_drops_alpha() {
        assert_eq!(rgba_to_raw(Psm::Ct24, 0xFF12_3456), 0x0012_3456);
    }

    #[test]
    fn test_sprite_rect_orders_corners() {
        let mut a = GsVertex::zeroed();
        a.x = 30 << 4;
        a.y = 40 << 4;
        let mut b = GsVertex::zeroed();
        b.x = 10 << 4;
        b.y = 20 << 4;
        assert_eq!(sprite_rect(&a, &b), PixelRect::new(10, 20, 30, 40));
    }
}
