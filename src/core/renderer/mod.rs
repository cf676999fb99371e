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

//! Draw orchestrator
//!
//! [`Renderer`] owns the whole per-thread pipeline: the GIF decoder, the
//! register state machine, local memory, the texture cache and the device
//! backend. Incoming qwords flow through the decoder into register writes;
//! writes accumulate a primitive batch; a flush runs the batch through
//!
//! ```text
//! Classify -> ResolveTextures -> ResolveTargets -> DecideBlend/DATE
//!          -> Emit -> PostInvalidate
//! ```
//!
//! carried by an explicit [`DrawState`] value. The classify stage may
//! consume the batch without a draw (memory clear, CPU blit, CPU palette
//! write); shuffle signatures rewrite the batch to a single quad before
//! the normal stages run. A batch that cannot be classified safely is
//! skipped whole; no partially wrong pixels are emitted.

pub mod blend;
pub mod classify;
pub mod date;

use crate::core::cache::{TargetHandle, TargetKind, TextureCache};
use crate::core::config::RendererConfig;
use crate::core::device::{
    BarrierReq, ChannelSelect, DepthState, DeviceBackend, DeviceCaps, DrawConfig, ShaderFlags,
    TextureBinding, Topology,
};
use crate::core::dump::DrawDumper;
use crate::core::gif::{GifDecoder, GifEvent};
use crate::core::gs::registers::{
    Alpha, AlphaFail, AlphaTest, Frame, Prim, PrimKind, Register, Test, TexA, Tex0, Tex1,
    TransferDir, Zbuf,
};
use crate::core::gs::trace::VertexTrace;
use crate::core::gs::vertex::{GsVertex, PrimClass};
use crate::core::gs::{current_word, requires_flush, ApplyEffect, GsState};
use crate::core::vmem::format::{BlockRange, PixelRect, Psm};
use crate::core::vmem::LocalMemory;

use classify::Classification;

/// Texture registers resolved for a draw
#[derive(Debug, Clone, Copy)]
pub struct TextureInput {
    /// TEX0 of the active environment
    pub tex0: Tex0,
    /// TEX1 of the active environment
    pub tex1: Tex1,
    /// Decoded texture format
    pub psm: Psm,
    /// Texel region the batch can sample
    pub region: PixelRect,
}

/// Everything the pipeline stages read about the current batch
///
/// Built once per flush from the register context and the vertex trace,
/// then passed by reference through the stages.
#[derive(Debug, Clone, Copy)]
pub struct DrawState {
    /// Active drawing environment
    pub env: usize,
    /// Effective PRIM (PRMODE merged when selected)
    pub prim: Prim,
    /// Assembling primitive kind from PRIM
    pub kind: PrimKind,
    /// Flattened primitive class
    pub class: PrimClass,
    /// Batch analysis
    pub trace: VertexTrace,
    /// FRAME of the active environment
    pub frame: Frame,
    /// Decoded frame format
    pub frame_psm: Psm,
    /// ZBUF of the active environment
    pub zbuf: Zbuf,
    /// Decoded depth format
    pub z_psm: Psm,
    /// TEST of the active environment
    pub test: Test,
    /// ALPHA of the active environment
    pub alpha: Alpha,
    /// TEXA expansion values
    pub texa: TexA,
    /// Scissor window as a half-open rectangle
    pub scissor_rect: PixelRect,
    /// Batch bounds clipped to the scissor
    pub draw_rect: PixelRect,
    /// Texture input when PRIM.TME is set
    pub tex: Option<TextureInput>,
}

/// Aggregate pipeline counters
#[derive(Debug, Default, Clone, Copy)]
pub struct RenderStats {
    /// Batches emitted to the device
    pub draws: u64,
    /// Device draw calls (two-pass splits emit two per batch)
    pub draw_calls: u64,
    /// Memory-clear fast paths taken
    pub clears: u64,
    /// CPU palette-style writes
    pub clut_draws: u64,
    /// CPU sprite copies
    pub cpu_blits: u64,
    /// Texture-shuffle rewrites
    pub texture_shuffles: u64,
    /// Channel-shuffle rewrites
    pub channel_shuffles: u64,
    /// Batches split for the two-pass alpha test
    pub two_pass: u64,
    /// Draw calls carrying a barrier requirement
    pub barrier_draws: u64,
    /// Batches skipped as unclassifiable
    pub skipped: u64,
    /// Vertical syncs seen
    pub vsyncs: u64,
}

/// The renderer core
///
/// Single-threaded by construction: one instance lives on the renderer
/// thread and owns every piece of mutable state. The device backend is
/// injected at construction and queried once for its capabilities.
pub struct Renderer<D: DeviceBackend> {
    config: RendererConfig,
    caps: DeviceCaps,
    device: D,
    /// Emulated local memory
    pub mem: LocalMemory,
    /// Register state machine and vertex assembly
    pub state: GsState,
    gif: GifDecoder,
    cache: TextureCache,
    dumper: Option<DrawDumper>,
    /// Pipeline counters
    pub stats: RenderStats,
}

impl<D: DeviceBackend> Renderer<D> {
    /// Create a renderer over a device backend
    pub fn new(config: RendererConfig, device: D) -> Self {
        let caps = device.caps();
        let dumper = if config.dump.enabled {
            match DrawDumper::new(config.dump.clone()) {
                Ok(dumper) => Some(dumper),
                Err(e) => {
                    log::warn!("Draw dumps disabled: {e}");
                    None
                }
            }
        } else {
            None
        };
        log::info!(
            "Renderer starting on backend '{}' (barriers={} dual_src={} fb_fetch={})",
            device.name(),
            caps.texture_barrier,
            caps.dual_source_blend,
            caps.framebuffer_fetch
        );
        Self {
            cache: TextureCache::new(config.cache.clone()),
            config,
            caps,
            device,
            mem: LocalMemory::new(),
            state: GsState::new(),
            gif: GifDecoder::new(),
            dumper,
            stats: RenderStats::default(),
        }
    }

    /// The device backend
    pub fn device(&self) -> &D {
        &self.device
    }

    /// The texture cache
    pub fn cache(&self) -> &TextureCache {
        &self.cache
    }

    /// Feed raw GIF qwords in submission order
    pub fn submit_qwords(&mut self, qwords: &[u128]) {
        let mut events = Vec::new();
        for &qword in qwords {
            self.gif.push_qword(qword, &mut |e| events.push(e));
        }
        for event in events {
            self.handle_event(event);
        }
    }

    /// Vertical sync: flush, age the cache
    pub fn vsync(&mut self) {
        self.flush_batch();
        self.cache.inc_age(&mut self.device);
        self.stats.vsyncs += 1;
    }

    /// Reset/reopen: drop the cache and all decoder state
    ///
    /// Nothing in flight survives; the next draw starts from a clean
    /// machine with local memory preserved.
    pub fn reset(&mut self) {
        log::info!("Renderer reset");
        self.cache.purge(&mut self.device);
        self.state.reset();
        self.gif.reset();
    }

    fn handle_event(&mut self, event: GifEvent) {
        match event {
            GifEvent::Write { reg, data } => self.handle_write(reg, data),
            GifEvent::Image { data } => {
                let effect = self.state.apply_image(data, &mut self.mem);
                self.handle_effect(effect);
            }
        }
    }

    /// Apply one register write with the flush rules around it
    pub fn handle_write(&mut self, reg: Register, data: u64) {
        match reg {
            Register::Xyz2 | Register::Xyzf2 | Register::Xyz3 | Register::Xyzf3 => {
                self.maybe_auto_flush(reg, data);
            }
            Register::TrxDir => {
                // Pending draws must land before a transfer reads or
                // overwrites their output
                self.flush_batch();
                self.sync_transfer_sources(data);
            }
            Register::TexFlush => {
                self.flush_batch();
            }
            _ if requires_flush(reg) => {
                // Redundant re-sends of identical setup are common and
                // must not break batches apart
                if current_word(&self.state.ctx, reg) != Some(data)
                    && !self.state.assembler.is_empty()
                {
                    self.flush_batch();
                }
            }
            _ => {}
        }
        let effect = self.state.apply(reg, data, &mut self.mem);
        self.handle_effect(effect);
    }

    fn handle_effect(&mut self, effect: ApplyEffect) {
        match effect {
            ApplyEffect::HostTransferArmed(rect) | ApplyEffect::MemoryWritten(rect) => {
                self.cache.invalidate_video_mem(
                    &mut self.device,
                    rect.base,
                    rect.buffer_width,
                    rect.psm,
                    rect.rect,
                );
            }
            ApplyEffect::MemoryRead(_) => {
                // Readback coherence ran before the transfer started
            }
            ApplyEffect::ClutLoaded { changed } => {
                if changed {
                    log::trace!("CLUT changed; palette sources will re-resolve");
                }
            }
            ApplyEffect::None | ApplyEffect::Kicked { .. } | ApplyEffect::TexFlush => {}
        }
    }

    /// Copy GPU-only data back to local memory before a transfer reads it
    fn sync_transfer_sources(&mut self, trxdir: u64) {
        let dir = TransferDir::from_bits(trxdir as u8);
        if !matches!(dir, TransferDir::LocalToHost | TransferDir::LocalToLocal) {
            return;
        }
        let blt = self.state.ctx.bitbltbuf();
        let pos = self.state.ctx.trxpos();
        let reg = self.state.ctx.trxreg();
        let Some(psm) = Psm::from_bits(blt.spsm) else {
            return;
        };
        let rect = PixelRect::from_size(pos.ssax, pos.ssay, reg.rrw, reg.rrh);
        self.cache
            .invalidate_local_mem(&mut self.device, &mut self.mem, blt.sbp, blt.sbw, psm, rect);
    }

    /// Flush the batch before a kick that would draw over it out of order
    ///
    /// Fires when the batch samples its own output: the texture range
    /// aliases the frame range and the completing primitive lands on
    /// pixels the batch already drew.
    fn maybe_auto_flush(&mut self, reg: Register, data: u64) {
        let prim = self.state.ctx.prim();
        if !prim.tme || self.state.assembler.is_empty() {
            return;
        }
        let kind = self.state.prim_kind();
        if !self.state.assembler.will_complete(kind) {
            return;
        }
        let drawn = self.state.drawn_bounds();
        if drawn.is_empty() {
            return;
        }
        let env = prim.ctxt;
        let tex0 = self.state.ctx.tex0(env);
        let frame = self.state.ctx.frame(env);
        let (Some(tex_psm), Some(frame_psm)) =
            (Psm::from_bits(tex0.psm), Psm::from_bits(frame.psm))
        else {
            return;
        };
        let tex_range = BlockRange::from_rect(
            tex0.tbp0,
            tex0.tbw.max(1),
            PixelRect::from_size(0, 0, tex0.width(), tex0.height()),
            tex_psm,
        );
        let frame_range = BlockRange::from_rect(frame.fbp, frame.fbw.max(1), drawn, frame_psm);
        if !tex_range.overlaps(&frame_range) {
            return;
        }

        // Bounding box of the primitive this kick completes
        let incoming = self.state.peek_kick(reg, data);
        let mut bounds = vertex_px_rect(&incoming);
        for &index in self.state.assembler.pending_window() {
            bounds = bounds.union(&vertex_px_rect(&self.state.assembler.vertices[index as usize]));
        }
        if bounds.overlaps(&drawn) {
            log::trace!("Auto-flush: primitive at {:?} overlaps drawn {:?}", bounds, drawn);
            self.run_draw();
            self.state.assembler.rebase_window();
            self.state.clear_drawn_bounds();
        }
    }

    /// Draw the pending batch, if any, and clear it
    pub fn flush_batch(&mut self) {
        if self.state.assembler.is_empty() {
            return;
        }
        self.run_draw();
        self.state.assembler.clear();
        self.state.clear_drawn_bounds();
    }

    /// The Classify -> Resolve -> Decide -> Emit -> PostInvalidate pipeline
    fn run_draw(&mut self) {
        let prim = self.state.ctx.prim();
        let kind = self.state.prim_kind();
        if kind == PrimKind::Invalid {
            return;
        }
        let class = PrimClass::from_kind(kind);
        let env = prim.ctxt;

        let frame = self.state.ctx.frame(env);
        let Some(frame_psm) = Psm::from_bits(frame.psm) else {
            self.skip_draw("undefined FRAME format");
            return;
        };
        let zbuf = self.state.ctx.zbuf(env);
        let Some(z_psm) = Psm::from_bits(zbuf.psm) else {
            self.skip_draw("undefined ZBUF format");
            return;
        };
        let test = self.state.ctx.test(env);
        let alpha = self.state.ctx.alpha(env);
        let texa = self.state.ctx.texa();
        let scissor = self.state.ctx.scissor(env);
        let scissor_rect = PixelRect::new(
            scissor.x0,
            scissor.y0,
            scissor.x1 + 1,
            scissor.y1 + 1,
        );

        // The one trace computation for this batch; everything after
        // reads it
        let trace = VertexTrace::compute(
            &self.state.assembler.vertices,
            &self.state.assembler.indices,
            prim.fst,
            self.state.assembler.serial(),
        );
        debug_assert_eq!(trace.serial, self.state.assembler.serial());

        // Degenerate and off-screen batches resolve here, not earlier
        let draw_rect = trace.bounds().intersection(&scissor_rect);
        if draw_rect.is_empty() {
            return;
        }

        let tex = if prim.tme {
            let tex0 = self.state.ctx.tex0(env);
            let Some(psm) = Psm::from_bits(tex0.psm) else {
                self.skip_draw("undefined TEX0 format");
                return;
            };
            let tex1 = self.state.ctx.tex1(env);
            let region = texel_region(&trace, &tex0, prim.fst);
            Some(TextureInput {
                tex0,
                tex1,
                psm,
                region,
            })
        } else {
            None
        };

        let draw = DrawState {
            env,
            prim,
            kind,
            class,
            trace,
            frame,
            frame_psm,
            zbuf,
            z_psm,
            test,
            alpha,
            texa,
            scissor_rect,
            draw_rect,
            tex,
        };

        let classification = {
            let mut ctx = classify::ClassifyCtx {
                draw: &draw,
                vertices: &self.state.assembler.vertices,
                indices: &self.state.assembler.indices,
                heuristics: &self.config.heuristics,
                mem: &mut self.mem,
                cache: &mut self.cache,
                device: &mut self.device,
            };
            classify::classify(&mut ctx)
        };

        let mut flags = ShaderFlags::empty();
        let mut channel = None;
        match classification {
            Classification::Clear => {
                self.stats.clears += 1;
                return;
            }
            Classification::ClutDraw => {
                self.stats.clut_draws += 1;
                return;
            }
            Classification::CpuBlit => {
                self.stats.cpu_blits += 1;
                return;
            }
            Classification::TextureShuffle => {
                self.stats.texture_shuffles += 1;
                flags |= ShaderFlags::TEXTURE_SHUFFLE;
                self.rewrite_to_quad(&draw);
            }
            Classification::ChannelShuffle(select) => {
                self.stats.channel_shuffles += 1;
                flags |= ShaderFlags::CHANNEL_SHUFFLE;
                channel = Some(select);
                self.rewrite_to_quad(&draw);
            }
            Classification::Draw => {}
        }

        self.emit(&draw, flags, channel);
    }

    /// Replace the batch with one full-rect quad (shuffle rewrite)
    ///
    /// Shuffles manipulate every pixel of the target region the same way;
    /// per-primitive geometry only repeats that work.
    fn rewrite_to_quad(&mut self, draw: &DrawState) {
        let rect = draw.draw_rect;
        let template = self.state.assembler.vertices[self.state.assembler.indices[0] as usize];
        let corner = |x: u32, y: u32| GsVertex {
            x: (x << 4) as u16,
            y: (y << 4) as u16,
            u: (x << 4) as u16,
            v: (y << 4) as u16,
            st: [x as f32 / rect.x1.max(1) as f32, y as f32 / rect.y1.max(1) as f32],
            ..template
        };
        self.state.assembler.vertices = vec![corner(rect.x0, rect.y0), corner(rect.x1, rect.y1)];
        self.state.assembler.indices = vec![0, 1];
    }

    /// Resolve cache entries, decide strategies, emit configs
    fn emit(&mut self, draw: &DrawState, mut flags: ShaderFlags, channel: Option<ChannelSelect>) {
        let overlap_limit = self.config.heuristics.overlap_test_limit;
        let sw_blend_limit = self.config.heuristics.software_blend_sprite_limit;
        let expand_limit = self.config.heuristics.sprite_expand_limit;
        let may_overlap = date::batch_may_overlap(
            &self.state.assembler.vertices,
            &self.state.assembler.indices,
            draw.class,
            overlap_limit,
        );

        // ResolveTextures
        let texture = draw.tex.as_ref().and_then(|tex| self.resolve_texture(tex, draw));

        // ResolveTargets
        let color_write = !draw.frame.all_masked();
        let depth_write = !draw.zbuf.zmsk;
        let depth_used = draw.test.zte || depth_write;
        let size = (
            (draw.frame.fbw * 64).max(draw.draw_rect.x1).max(1),
            draw.draw_rect.y1.max(1),
        );
        let frame_target = color_write.then(|| {
            self.cache.lookup_target(
                &mut self.device,
                &self.mem,
                draw.frame.fbp,
                draw.frame.fbw,
                draw.frame_psm,
                TargetKind::Color,
                size,
                true,
            )
        });
        let depth_target = depth_used.then(|| {
            self.cache.lookup_target(
                &mut self.device,
                &self.mem,
                draw.zbuf.zbp,
                draw.frame.fbw,
                draw.z_psm,
                TargetKind::Depth,
                size,
                true,
            )
        });

        // A later target lookup can purge the cache under memory
        // pressure; a retired source must not reach the device
        let texture = texture.filter(|t| self.cache.source(t.handle).is_some());
        if draw.tex.is_some() && texture.is_none() {
            self.skip_draw("source retired under memory pressure");
            return;
        }

        // Self-read detection: the texture aliases the target being
        // written, by address or through a shared cache entry
        let tex_is_fb = draw
            .tex
            .map(|t| {
                t.tex0.tbp0 == draw.frame.fbp && t.psm.depth_compatible(draw.frame_psm)
            })
            .unwrap_or(false)
            || texture
                .as_ref()
                .and_then(|t| t.shared)
                .map(|shared| Some(shared) == frame_target || Some(shared) == depth_target)
                .unwrap_or(false);
        if tex_is_fb {
            flags |= ShaderFlags::TEX_IS_FB;
        }

        // DecideBlend/DATE
        let blend_ctx = blend::BlendContext {
            abe: draw.prim.abe,
            pabe: self.state.ctx.pabe(),
            colclamp: self.state.ctx.colclamp(),
            alpha_range: draw.trace.alpha_range(),
            fb_has_alpha: !matches!(draw.frame_psm.as_color(), Psm::Ct24),
            may_overlap,
            prim_count: self.state.assembler.prim_count(draw.class),
            sw_blend_prim_limit: sw_blend_limit,
        };
        let blend = blend::decide_blend(draw.alpha, &blend_ctx, &self.caps);
        flags |= blend.flags;
        let (date_mode, date_barrier) = date::decide_date(&draw.test, &self.caps, may_overlap);

        let mut barrier = blend.barrier.max(date_barrier);
        if tex_is_fb {
            barrier = barrier.max(BarrierReq::Once);
        }

        // Topology, with the sprite expansion decision
        let topology = match draw.class {
            PrimClass::Point => Topology::Points,
            PrimClass::Line => Topology::Lines,
            PrimClass::Triangle => Topology::Triangles,
            PrimClass::Sprite => {
                let sprites = self.state.assembler.prim_count(PrimClass::Sprite);
                if self.caps.prim_expansion && sprites >= expand_limit {
                    Topology::Sprites
                } else {
                    self.state.assembler.expand_sprites();
                    Topology::Triangles
                }
            }
        };

        if draw.tex.is_some() {
            flags |= ShaderFlags::TEXTURE;
        }
        if draw.prim.iip {
            flags |= ShaderFlags::GOURAUD;
        }
        if draw.prim.fge {
            flags |= ShaderFlags::FOG;
        }
        if draw.prim.fst {
            flags |= ShaderFlags::FST;
        }
        if self.state.ctx.dthe() && draw.frame_psm.is_16bit() {
            flags |= ShaderFlags::DITHER;
        }
        if self.state.ctx.fba(draw.env) {
            flags |= ShaderFlags::FBA;
        }
        if texture.as_ref().map(|t| t.binding.palette.is_some()).unwrap_or(false) {
            flags |= ShaderFlags::PALETTE;
        }

        // Alpha-test folding and the two-pass split
        let (first_atst, second_pass) = fold_alpha_test(&draw.test, color_write, depth_write);

        let scale = self.config.cache.upscale.max(1);
        let scissor_dev = PixelRect::new(
            draw.scissor_rect.x0 * scale,
            draw.scissor_rect.y0 * scale,
            draw.scissor_rect.x1 * scale,
            draw.scissor_rect.y1 * scale,
        );

        let fogcol = self.state.ctx.fogcol();
        let config = DrawConfig {
            topology,
            vertices: self.state.assembler.vertices.clone(),
            indices: self.state.assembler.indices.clone(),
            target: frame_target.and_then(|h| self.cache.target(h)).map(|t| t.texture),
            depth_target: depth_target.and_then(|h| self.cache.target(h)).map(|t| t.texture),
            texture: texture.as_ref().map(|t| t.binding),
            flags,
            channel,
            atst: first_atst,
            aref: draw.test.aref,
            blend: blend.hw,
            color_mask: color_mask_from_fbmsk(draw.frame.fbmsk),
            fbmsk: draw.frame.fbmsk,
            depth: DepthState {
                test: draw.test.ztst,
                write: depth_write,
            },
            date: date_mode,
            datm: draw.test.datm,
            scissor: scissor_dev,
            barrier,
            dither: (self.state.ctx.dthe() && draw.frame_psm.is_16bit())
                .then(|| self.state.ctx.dimx().matrix),
            fog_color: [fogcol.r, fogcol.g, fogcol.b],
        };

        if let Some(dumper) = &mut self.dumper {
            dumper.dump_draw(&self.state.ctx, &config);
            if let Some(tex) = &draw.tex {
                let data = self.mem.read_texture_rgba(
                    tex.tex0.tbp0,
                    tex.tex0.tbw,
                    tex.region,
                    tex.psm,
                    draw.texa,
                    tex.tex0.csa,
                );
                dumper.dump_texture(tex.region, &data);
            }
        }

        self.device.draw(&config);
        self.stats.draws += 1;
        self.stats.draw_calls += 1;
        if barrier != BarrierReq::None {
            self.stats.barrier_draws += 1;
        }

        if second_pass {
            // Re-submit under the inverted test with the AFAIL write set
            let (mask, zwrite) = match draw.test.afail {
                AlphaFail::FbOnly => (config.color_mask, false),
                AlphaFail::ZbOnly => (0, depth_write),
                AlphaFail::RgbOnly => (config.color_mask & 0b0111, false),
                AlphaFail::Keep => (0, false),
            };
            let second = DrawConfig {
                atst: first_atst.inverted(),
                color_mask: mask,
                depth: DepthState {
                    test: draw.test.ztst,
                    write: zwrite,
                },
                ..config.clone()
            };
            self.device.draw(&second);
            self.stats.draw_calls += 1;
            self.stats.two_pass += 1;
        }

        // PostInvalidate: the written area is GPU-newer now
        if color_write {
            if let Some(handle) = frame_target {
                self.cache
                    .mark_target_written(&mut self.device, handle, draw.draw_rect);
            }
        }
        if depth_write {
            if let Some(handle) = depth_target {
                self.cache
                    .mark_target_written(&mut self.device, handle, draw.draw_rect);
            }
        }
    }

    /// Resolve the source texture, uploading explicit mips when needed
    fn resolve_texture(&mut self, tex: &TextureInput, draw: &DrawState) -> Option<ResolvedTexture> {
        let mip_levels = if tex.tex1.mipmaps_enabled() {
            tex.tex1.mxl
        } else {
            0
        };
        let handle = self.cache.lookup_source(
            &mut self.device,
            &self.mem,
            tex.tex0.tbp0,
            tex.tex0.tbw,
            tex.psm,
            draw.texa,
            tex.tex0.csa,
            tex.region,
            mip_levels,
            self.mem.clut_generation(),
        );
        let source = self.cache.source(handle)?;
        let auto_mips = mip_levels > 0 && self.caps.generate_mipmaps;
        let binding = TextureBinding {
            texture: source.texture,
            palette: source.palette,
            size: (tex.tex0.width(), tex.tex0.height()),
            linear: tex.tex1.mmag_linear,
            mip_levels,
            auto_mips,
        };
        let shared = source.shared_target;

        if mip_levels > 0 && !auto_mips && shared.is_none() {
            self.upload_explicit_mips(binding.texture, tex, draw);
        }
        Some(ResolvedTexture {
            handle,
            binding,
            shared,
        })
    }

    /// Decode and upload mip levels 1..=MXL from their register addresses
    fn upload_explicit_mips(
        &mut self,
        texture: crate::core::device::TextureId,
        tex: &TextureInput,
        draw: &DrawState,
    ) {
        let env = draw.env;
        let mut auto_tbp = tex.tex0.tbp0;
        let mut auto_w = tex.tex0.width();
        let mut auto_h = tex.tex0.height();
        for level in 1..=tex.tex1.mxl {
            let (tbp, tbw) = if tex.tex1.mtba {
                // Automatic layout: each level follows the previous one
                let blocks = (auto_w * auto_h * tex.psm.bpp() / 8).div_ceil(256);
                auto_tbp += blocks;
                auto_w = (auto_w / 2).max(1);
                auto_h = (auto_h / 2).max(1);
                (auto_tbp, (tex.tex0.tbw >> level).max(1))
            } else {
                let (tbp, tbw) = self.state.ctx.mip_level(env, level);
                (tbp, tbw.max(1))
            };
            let w = (tex.tex0.width() >> level).max(1);
            let h = (tex.tex0.height() >> level).max(1);
            let rect = PixelRect::from_size(0, 0, w, h);
            let data = self
                .mem
                .read_texture_rgba(tbp, tbw, rect, tex.psm, draw.texa, tex.tex0.csa);
            self.device.upload_mip(texture, level, rect, &data);
        }
    }

    fn skip_draw(&mut self, reason: &str) {
        log::debug!("Skipping unclassifiable draw: {reason}");
        self.stats.skipped += 1;
    }

    /// Freeze the machine state into a versioned blob
    pub fn freeze(&self) -> crate::core::error::Result<Vec<u8>> {
        crate::core::freeze::freeze(&self.state, &self.mem)
    }

    /// Restore machine state from a blob
    ///
    /// The cache is purged first; no draw spans a defrost.
    pub fn defrost(&mut self, bytes: &[u8]) -> crate::core::error::Result<()> {
        self.cache.purge(&mut self.device);
        crate::core::freeze::defrost(bytes, &mut self.state, &mut self.mem)
    }
}

/// A resolved texture binding plus its cache lineage
struct ResolvedTexture {
    handle: crate::core::cache::SourceHandle,
    binding: TextureBinding,
    shared: Option<TargetHandle>,
}

fn vertex_px_rect(v: &GsVertex) -> PixelRect {
    let x = v.x_px().floor().max(0.0) as u32;
    let y = v.y_px().floor().max(0.0) as u32;
    PixelRect::new(x, y, x + 1, y + 1)
}

/// Texel region the batch can sample, clamped to the texture size
fn texel_region(trace: &VertexTrace, tex0: &Tex0, fst: bool) -> PixelRect {
    let (w, h) = (tex0.width(), tex0.height());
    let scale = |v: f32, size: u32| -> f32 {
        if fst {
            v
        } else {
            v * size as f32
        }
    };
    let x0 = scale(trace.min_uv[0], w).floor().max(0.0) as u32;
    let y0 = scale(trace.min_uv[1], h).floor().max(0.0) as u32;
    let x1 = scale(trace.max_uv[0], w).ceil().max(0.0) as u32;
    let y1 = scale(trace.max_uv[1], h).ceil().max(0.0) as u32;
    PixelRect {
        x0: x0.min(w.saturating_sub(1)),
        y0: y0.min(h.saturating_sub(1)),
        x1: x1.clamp(x0 + 1, w),
        y1: y1.clamp(y0 + 1, h),
    }
}

/// Per-channel write mask from the bit-level FBMSK
///
/// A channel is written unless every one of its mask bits is set; partial
/// masks ride along in [`DrawConfig::fbmsk`] for the shader.
fn color_mask_from_fbmsk(fbmsk: u32) -> u8 {
    let mut mask = 0u8;
    for channel in 0..4 {
        let bits = (fbmsk >> (channel * 8)) & 0xFF;
        if bits != 0xFF {
            mask |= 1 << channel;
        }
    }
    mask
}

/// Fold the alpha test for the write set, deciding the two-pass split
///
/// When failing pixels still write one of the buffers and both buffers
/// are enabled, one logical draw becomes two: the normal test, then its
/// inverse restricted to the AFAIL write set.
fn fold_alpha_test(test: &Test, color_write: bool, depth_write: bool) -> (AlphaTest, bool) {
    let atst = test.effective_atst();
    if atst == AlphaTest::Always {
        return (AlphaTest::Always, false);
    }
    match test.afail {
        AlphaFail::Keep => (atst, false),
        // Failing pixels write color; without depth writes the test
        // changes nothing observable
        AlphaFail::FbOnly if !depth_write => (AlphaTest::Always, false),
        AlphaFail::ZbOnly if !color_write => (AlphaTest::Always, false),
        _ if color_write && depth_write => (atst, true),
        _ => (atst, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::device::{DeviceCaps, RecordingDevice};

    fn renderer(caps: DeviceCaps) -> Renderer<RecordingDevice> {
        Renderer::new(RendererConfig::default(), RecordingDevice::new(caps))
    }

    /// Raw register writes driving a full-screen sprite draw
    fn setup_frame(r: &mut Renderer<RecordingDevice>, fbp_pages: u64, psm: u64) {
        // FRAME: base page, FBW=10 (640px), format
        r.handle_write(Register::Frame1, fbp_pages | (10 << 16) | (psm << 24));
        // ZBUF: masked off
        r.handle_write(Register::Zbuf1, 1u64 << 32);
        // SCISSOR: 640x448
        r.handle_write(Register::Scissor1, 639 << 16 | (447u64 << 48));
        // No tests
        r.handle_write(Register::Test1, 0);
        r.handle_write(Register::PrModeCont, 1);
        r.handle_write(Register::XyOffset1, 0);
    }

    fn kick_sprite(r: &mut Renderer<RecordingDevice>, x0: u16, y0: u16, x1: u16, y1: u16) {
        r.handle_write(
            Register::Xyz2,
            (x0 as u64) << 4 | ((y0 as u64) << 4) << 16,
        );
        r.handle_write(
            Register::Xyz2,
            (x1 as u64) << 4 | ((y1 as u64) << 4) << 16,
        );
    }

    #[test]
    fn test_full_screen_sprite_becomes_clear() {
        let mut r = renderer(DeviceCaps::all());
        setup_frame(&mut r, 0, 0);
        r.handle_write(Register::Prim, 6); // sprite, no flags
        r.handle_write(Register::Rgbaq, 0x8040_2010);
        kick_sprite(&mut r, 0, 0, 640, 448);
        r.flush_batch();

        assert_eq!(r.stats.clears, 1);
        assert_eq!(r.stats.draws, 0);
        assert_eq!(r.device().draw_count(), 0);
        // The constant color landed in local memory
        assert_eq!(r.mem.read_pixel(0, 10, 320, 224, Psm::Ct32), 0x8040_2010);
    }

    #[test]
    fn test_partial_sprite_is_a_draw() {
        let mut r = renderer(DeviceCaps::all());
        setup_frame(&mut r, 0, 0);
        r.handle_write(Register::Prim, 6);
        r.handle_write(Register::Rgbaq, 0xFFFF_FFFF);
        kick_sprite(&mut r, 100, 100, 200, 200);
        r.flush_batch();

        assert_eq!(r.stats.clears, 0);
        assert_eq!(r.stats.draws, 1);
        assert_eq!(r.device().draw_count(), 1);
    }

    #[test]
    fn test_equal_blend_terms_disable_blending() {
        let mut r = renderer(DeviceCaps::all());
        setup_frame(&mut r, 0, 0);
        // A = B = Cs, D = Cs: identity
        r.handle_write(Register::Alpha1, 0);
        r.handle_write(Register::Prim, 6 | (1 << 6)); // sprite + ABE
        r.handle_write(Register::Rgbaq, 0x8000_0000);
        kick_sprite(&mut r, 100, 100, 200, 200);
        r.flush_batch();

        let config = r.device().draws().next().expect("one draw");
        assert!(config.blend.is_none());
        assert!(!config.flags.contains(ShaderFlags::SW_BLEND));
    }

    #[test]
    fn test_texture_shuffle_rewrites_to_quad() {
        let mut r = renderer(DeviceCaps::all());
        setup_frame(&mut r, 0, 0x02); // CT16 frame
        // CT16 texture at the same base address
        r.handle_write(
            Register::Tex0_1,
            (10u64 << 14) | (0x02u64 << 20) | (8u64 << 26) | (8u64 << 30),
        );
        r.handle_write(Register::Prim, 6 | (1 << 4) | (1 << 8)); // sprite TME FST
        r.handle_write(Register::Rgbaq, 0x8080_8080);
        r.handle_write(Register::Uv, 0);
        // Several thin strips, the classic shuffle pattern
        for x in 0..4u16 {
            kick_sprite(&mut r, x * 16, 0, x * 16 + 8, 64);
        }
        r.flush_batch();

        assert_eq!(r.stats.texture_shuffles, 1);
        let config = r.device().draws().next().expect("one draw");
        assert!(config.flags.contains(ShaderFlags::TEXTURE_SHUFFLE));
        // One quad: two corners expanded to four vertices, six indices
        assert_eq!(config.vertices.len(), 4);
        assert_eq!(config.indices.len(), 6);
    }

    #[test]
    fn test_tex_is_fb_sets_barrier() {
        let mut r = renderer(DeviceCaps::all());
        setup_frame(&mut r, 2, 0); // FRAME at page 2 (block 64), CT32
        // TEX0 at the same block address, CT32, 64x64
        r.handle_write(
            Register::Tex0_1,
            0x40 | (10u64 << 14) | (6u64 << 26) | (6u64 << 30),
        );
        r.handle_write(Register::Prim, 6 | (1 << 4) | (1 << 8));
        r.handle_write(Register::Rgbaq, 0x8080_8080);
        r.handle_write(Register::Uv, 0);
        kick_sprite(&mut r, 0, 0, 64, 64);
        r.flush_batch();

        let config = r.device().draws().next().expect("one draw");
        assert!(config.flags.contains(ShaderFlags::TEX_IS_FB));
        assert_ne!(config.barrier, BarrierReq::None);
        assert!(r.stats.barrier_draws > 0);
    }

    #[test]
    fn test_two_pass_alpha_test_split() {
        let mut r = renderer(DeviceCaps::all());
        setup_frame(&mut r, 0, 0);
        // Depth writes on
        r.handle_write(Register::Zbuf1, 0);
        // ATE, ATST=Greater, AREF=0x40, AFAIL=FbOnly, ZTE+Always
        r.handle_write(
            Register::Test1,
            1 | (6 << 1) | (0x40 << 4) | (1 << 12) | (1u64 << 16) | (1u64 << 17),
        );
        r.handle_write(Register::Prim, 6);
        r.handle_write(Register::Rgbaq, 0x2080_8080);
        kick_sprite(&mut r, 10, 10, 50, 50);
        r.flush_batch();

        assert_eq!(r.stats.two_pass, 1);
        assert_eq!(r.device().draw_count(), 2);
        let configs: Vec<_> = r.device().draws().collect();
        assert_eq!(configs[0].atst, AlphaTest::Greater);
        assert_eq!(configs[1].atst, AlphaTest::LessEqual);
        // The second pass only writes color
        assert!(!configs[1].depth.write);
        assert!(configs[0].depth.write);
    }

    #[test]
    fn test_undefined_frame_format_skips_batch() {
        let mut r = renderer(DeviceCaps::all());
        setup_frame(&mut r, 0, 0x3F); // reserved PSM
        r.handle_write(Register::Prim, 6);
        r.handle_write(Register::Rgbaq, 0x8080_8080);
        kick_sprite(&mut r, 100, 100, 200, 200);
        r.flush_batch();

        assert_eq!(r.stats.skipped, 1);
        assert_eq!(r.device().draw_count(), 0);
        assert!(r.state.assembler.is_empty());
    }

    #[test]
    fn test_scissored_out_batch_is_dropped() {
        let mut r = renderer(DeviceCaps::all());
        setup_frame(&mut r, 0, 0);
        r.handle_write(Register::Prim, 6);
        r.handle_write(Register::Rgbaq, 0x8080_8080);
        // Entirely right of the scissor
        kick_sprite(&mut r, 1000, 1000, 1100, 1100);
        r.flush_batch();

        assert_eq!(r.device().draw_count(), 0);
        assert_eq!(r.stats.skipped, 0);
    }

    #[test]
    fn test_state_change_flushes_pending_batch() {
        let mut r = renderer(DeviceCaps::all());
        setup_frame(&mut r, 0, 0);
        r.handle_write(Register::Prim, 6);
        r.handle_write(Register::Rgbaq, 0x8080_8080);
        kick_sprite(&mut r, 100, 100, 200, 200);

        // A FRAME change cannot apply to the half-built batch
        r.handle_write(Register::Frame1, 4 | (10 << 16));
        assert_eq!(r.device().draw_count(), 1);

        // Re-sending the identical word must not flush
        kick_sprite(&mut r, 300, 100, 340, 200);
        r.handle_write(Register::Frame1, 4 | (10 << 16));
        assert_eq!(r.device().draw_count(), 1);
        r.flush_batch();
        assert_eq!(r.device().draw_count(), 2);
    }

    #[test]
    fn test_vsync_ages_cache() {
        let mut r = renderer(DeviceCaps::all());
        setup_frame(&mut r, 0, 0);
        r.handle_write(Register::Prim, 6);
        r.handle_write(Register::Rgbaq, 0x8080_8080);
        kick_sprite(&mut r, 100, 100, 200, 200);
        r.flush_batch();
        assert!(r.cache().live_targets() > 0);

        for _ in 0..16 {
            r.vsync();
        }
        assert_eq!(r.cache().live_targets(), 0);
        assert_eq!(r.stats.vsyncs, 16);
    }

    #[test]
    fn test_reset_discards_everything() {
        let mut r = renderer(DeviceCaps::all());
        setup_frame(&mut r, 0, 0);
        r.handle_write(Register::Prim, 6);
        r.handle_write(Register::Rgbaq, 0x8080_8080);
        kick_sprite(&mut r, 100, 100, 200, 200);
        r.flush_batch();
        kick_sprite(&mut r, 0, 0, 10, 10);

        r.reset();
        assert_eq!(r.cache().live_targets(), 0);
        assert!(r.state.assembler.is_empty());
    }

    #[test]
    fn test_sprite_expansion_honors_device_caps() {
        // Without GPU expansion every sprite becomes two triangles
        let mut r = renderer(DeviceCaps {
            prim_expansion: false,
            ..DeviceCaps::all()
        });
        setup_frame(&mut r, 0, 0);
        r.handle_write(Register::Prim, 6);
        r.handle_write(Register::Rgbaq, 0x8080_8080);
        kick_sprite(&mut r, 100, 100, 200, 200);
        r.flush_batch();
        let config = r.device().draws().next().unwrap();
        assert_eq!(config.topology, Topology::Triangles);
        assert_eq!(config.indices.len(), 6);

        // A large batch with expansion support ships corner pairs
        let mut r = renderer(DeviceCaps::all());
        setup_frame(&mut r, 0, 0);
        r.handle_write(Register::Prim, 6);
        r.handle_write(Register::Rgbaq, 0x8080_8080);
        for i in 0..20u16 {
            kick_sprite(&mut r, i * 30, 100, i * 30 + 20, 200);
        }
        r.flush_batch();
        let config = r.device().draws().next().unwrap();
        assert_eq!(config.topology, Topology::Sprites);
    }

    #[test]
    fn test_fold_alpha_test() {
        // AFAIL=FbOnly without depth writes: the test is inert
        let test = Test::from_u64(1 | (6 << 1) | (1 << 12));
        assert_eq!(fold_alpha_test(&test, true, false), (AlphaTest::Always, false));

        // Same with depth writes: two passes
        assert_eq!(fold_alpha_test(&test, true, true), (AlphaTest::Greater, true));

        // AFAIL=Keep: plain single-pass discard
        let test = Test::from_u64(1 | (6 << 1));
        assert_eq!(fold_alpha_test(&test, true, true), (AlphaTest::Greater, false));
    }

    #[test]
    fn test_color_mask_from_fbmsk() {
        assert_eq!(color_mask_from_fbmsk(0), 0b1111);
        assert_eq!(color_mask_from_fbmsk(0xFF00_0000), 0b0111);
        assert_eq!(color_mask_from_fbmsk(0x00FF_FFFF), 0b1000);
        assert_eq!(color_mask_from_fbmsk(0xFFFF_FFFF), 0);
        // Partial masks still write the channel (the shader applies bits)
        assert_eq!(color_mask_from_fbmsk(0x0000_0001), 0b1111);
    }
}
