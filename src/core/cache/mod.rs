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

//! Video-memory cache
//!
//! Maps address ranges of GS local memory to device-resident entries:
//! [`Target`] for render/depth outputs the GPU writes, [`Source`] for
//! sampled textures. Local memory stays authoritative for everything the
//! GPU has not drawn; each entry tracks which direction is newer through
//! its dirty state.
//!
//! Entries live in arenas addressed by generation-checked handles. Retiring
//! an entry bumps the slot generation, so a stale handle held anywhere
//! simply stops resolving instead of dangling. A cache miss is never an
//! error: every lookup can rebuild its entry from local memory.
//!
//! Aliasing rules, in order: an exact-layout hit is reused (grown in place
//! if the draw needs more area); an overlapping entry of the same kind with
//! a different layout is retired, later writer wins; Sources overlapping
//! any written range are always retired.

use crate::core::config::CacheConfig;
use crate::core::device::{DeviceBackend, TextureId, TextureKind};
use crate::core::gs::registers::TexA;
use crate::core::vmem::format::{BlockRange, PixelRect, Psm};
use crate::core::vmem::LocalMemory;

/// Render-target or depth-target entry kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// Color output (FRAME)
    Color,
    /// Depth output (ZBUF)
    Depth,
}

/// Generation-checked handle to a [`Target`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetHandle {
    index: u32,
    generation: u32,
}

/// Generation-checked handle to a [`Source`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceHandle {
    index: u32,
    generation: u32,
}

/// Deferred-upload rectangles for one target
///
/// Rectangles written in local memory since the GPU copy was last
/// refreshed. Consumed (re-uploaded) just before the GPU next reads or
/// draws into the target.
#[derive(Debug, Default, Clone)]
pub struct DirtyRectList {
    rects: Vec<PixelRect>,
}

/// List length beyond which rectangles collapse into their union
const DIRTY_COALESCE_LIMIT: usize = 8;

impl DirtyRectList {
    /// Add a written rectangle, merging with overlapping entries
    pub fn push(&mut self, rect: PixelRect) {
        if rect.is_empty() {
            return;
        }
        let mut merged = rect;
        self.rects.retain(|r| {
            if r.overlaps(&merged) {
                merged = merged.union(r);
                false
            } else {
                true
            }
        });
        self.rects.push(merged);
        if self.rects.len() > DIRTY_COALESCE_LIMIT {
            let union = self
                .rects
                .iter()
                .fold(PixelRect::default(), |acc, r| acc.union(r));
            self.rects.clear();
            self.rects.push(union);
        }
    }

    /// Whether no uploads are pending
    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    /// Take all pending rectangles
    pub fn drain(&mut self) -> Vec<PixelRect> {
        std::mem::take(&mut self.rects)
    }

    /// Pending rectangles
    pub fn rects(&self) -> &[PixelRect] {
        &self.rects
    }
}

/// A render-target or depth-target cache entry
#[derive(Debug)]
pub struct Target {
    /// Base pointer in blocks
    pub base: u32,
    /// Buffer width in units of 64 pixels
    pub buffer_width: u32,
    /// Pixel format
    pub psm: Psm,
    /// Color or depth
    pub kind: TargetKind,
    /// Block footprint of the allocated area
    pub range: BlockRange,
    /// Allocated size in buffer pixels
    pub size: (u32, u32),
    /// Area holding defined data; never exceeds the allocated size
    pub valid: PixelRect,
    /// Local-memory writes not yet uploaded to the device texture
    pub dirty: DirtyRectList,
    /// Area the GPU has drawn that local memory has not seen
    pub gpu_dirty: PixelRect,
    /// Device texture (scaled dimensions)
    pub texture: TextureId,
    /// Resolution scale factor
    pub scale: u32,
    /// Vertical syncs since last use
    pub age: u32,
}

/// A sampled-texture cache entry
#[derive(Debug)]
pub struct Source {
    /// Base pointer in blocks
    pub base: u32,
    /// Buffer width in units of 64 pixels
    pub buffer_width: u32,
    /// Pixel format
    pub psm: Psm,
    /// Block footprint of the decoded region
    pub range: BlockRange,
    /// Decoded region in texels
    pub rect: PixelRect,
    /// Device texture holding the decoded (or shared) data
    pub texture: TextureId,
    /// Palette texture for indexed formats
    pub palette: Option<TextureId>,
    /// Target this source aliases instead of owning its texture
    pub shared_target: Option<TargetHandle>,
    /// CLUT generation the palette was built from
    pub palette_generation: Option<u64>,
    /// Mip levels uploaded beyond the base
    pub mip_levels: u32,
    /// Vertical syncs since last use
    pub age: u32,
    /// Device bytes this entry accounts for (zero when shared)
    resident_bytes: usize,
}

impl Source {
    /// Whether the entry owns its device textures
    fn owns_texture(&self) -> bool {
        self.shared_target.is_none()
    }
}

struct Slot<T> {
    entry: Option<T>,
    generation: u32,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            entry: None,
            generation: 0,
        }
    }
}

/// Statistics the cache keeps for logs and the replay tool
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    /// Target lookups answered by a live entry
    pub target_hits: u64,
    /// Target lookups that allocated
    pub target_misses: u64,
    /// Source lookups answered by a live entry
    pub source_hits: u64,
    /// Source lookups that decoded from memory
    pub source_misses: u64,
    /// Sources answered by sharing a target texture
    pub source_shared: u64,
    /// Entries evicted by age
    pub evicted: u64,
    /// Full purges (resets and ceiling hits)
    pub purges: u64,
}

/// The cache proper
///
/// Owned exclusively by the renderer thread; the device handed to each
/// operation is the only side effect channel.
pub struct TextureCache {
    targets: Vec<Slot<Target>>,
    sources: Vec<Slot<Source>>,
    config: CacheConfig,
    bytes_resident: usize,
    ceiling_warned: bool,
    /// Aggregate counters
    pub stats: CacheStats,
}

impl TextureCache {
    /// Create an empty cache
    pub fn new(config: CacheConfig) -> Self {
        Self {
            targets: Vec::new(),
            sources: Vec::new(),
            config,
            bytes_resident: 0,
            ceiling_warned: false,
            stats: CacheStats::default(),
        }
    }

    /// Resolve a target handle
    pub fn target(&self, handle: TargetHandle) -> Option<&Target> {
        let slot = self.targets.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    /// Resolve a target handle mutably
    pub fn target_mut(&mut self, handle: TargetHandle) -> Option<&mut Target> {
        let slot = self.targets.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    /// Resolve a source handle
    pub fn source(&self, handle: SourceHandle) -> Option<&Source> {
        let slot = self.sources.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    /// Number of live targets
    pub fn live_targets(&self) -> usize {
        self.targets.iter().filter(|s| s.entry.is_some()).count()
    }

    /// Number of live sources
    pub fn live_sources(&self) -> usize {
        self.sources.iter().filter(|s| s.entry.is_some()).count()
    }

    /// Find or build the target covering a draw's output
    ///
    /// A compatible live entry is reused and grown in place when the draw
    /// needs more area. Same-kind entries overlapping with a different
    /// layout are retired first (later writer wins). `writable` is false
    /// for read-only lookups (display readout), which skips growth.
    pub fn lookup_target(
        &mut self,
        device: &mut dyn DeviceBackend,
        mem: &LocalMemory,
        base: u32,
        buffer_width: u32,
        psm: Psm,
        kind: TargetKind,
        size: (u32, u32),
        writable: bool,
    ) -> TargetHandle {
        let width = size.0.max(1);
        let height = size.1.max(1);

        // Exact-layout hit
        let mut hit = None;
        for (index, slot) in self.targets.iter().enumerate() {
            if let Some(target) = &slot.entry {
                if target.kind == kind
                    && target.base == base
                    && target.buffer_width == buffer_width
                    && target.psm.depth_compatible(psm)
                {
                    hit = Some((index as u32, slot.generation));
                    break;
                }
            }
        }

        if let Some((index, generation)) = hit {
            let handle = TargetHandle { index, generation };
            self.stats.target_hits += 1;
            let needs_grow = self
                .target(handle)
                .map(|t| writable && (width > t.size.0 || height > t.size.1))
                .unwrap_or(false);
            if needs_grow {
                self.grow_target(device, handle, width, height);
            }
            self.flush_dirty(device, mem, handle);
            if let Some(target) = self.target_mut(handle) {
                target.age = 0;
            }
            return handle;
        }

        self.stats.target_misses += 1;

        // Later writer wins: clear overlapping same-kind entries before
        // allocating over their range
        let rect = PixelRect::from_size(0, 0, width, height);
        let range = BlockRange::from_rect(base, buffer_width, rect, psm);
        let stale: Vec<TargetHandle> = self
            .live_target_handles()
            .into_iter()
            .filter(|&h| {
                self.target(h)
                    .map(|t| t.kind == kind && t.range.overlaps(&range))
                    .unwrap_or(false)
            })
            .collect();
        for handle in stale {
            log::debug!(
                "Retiring target bp={:#x} overlapped by new {:?} target bp={:#x}",
                self.target(handle).map(|t| t.base).unwrap_or(0),
                kind,
                base
            );
            self.retire_target(device, handle);
        }

        let scale = self.config.upscale.max(1);
        let tex_kind = match kind {
            TargetKind::Color => TextureKind::Color,
            TargetKind::Depth => TextureKind::Depth,
        };
        let texture = device.create_texture(width * scale, height * scale, tex_kind);
        self.account_alloc((width * scale) as usize * (height * scale) as usize * 4);

        // Seed from local memory so partially drawn-over content survives
        let texa = TexA {
            ta0: 0,
            aem: false,
            ta1: 0x80,
        };
        let data = mem.read_texture_rgba(base, buffer_width, rect, psm, texa, 0);
        device.upload_texture(texture, rect, &data);

        let target = Target {
            base,
            buffer_width,
            psm,
            kind,
            range,
            size: (width, height),
            valid: rect,
            dirty: DirtyRectList::default(),
            gpu_dirty: PixelRect::default(),
            texture,
            scale,
            age: 0,
        };
        let handle = self.insert_target(target);
        self.enforce_ceiling(device, Some(handle), None);
        handle
    }

    /// Find or build the source for a texture binding
    ///
    /// When the requested range is a live target, the source shares that
    /// target's texture directly; otherwise texels are decoded from local
    /// memory. `region` bounds the texels the draw can touch; `clut_gen`
    /// is the current CLUT generation for palette staleness checks.
    #[allow(clippy::too_many_arguments)]
    pub fn lookup_source(
        &mut self,
        device: &mut dyn DeviceBackend,
        mem: &LocalMemory,
        base: u32,
        buffer_width: u32,
        psm: Psm,
        texa: TexA,
        csa: u32,
        region: PixelRect,
        mip_levels: u32,
        clut_gen: u64,
    ) -> SourceHandle {
        let range = BlockRange::from_rect(base, buffer_width.max(1), region, psm);

        // A live target over the same base is newer than local memory;
        // share its texture instead of reading back
        if let Some(target_handle) = self.find_target_for_share(base, psm) {
            self.flush_dirty(device, mem, target_handle);
            if let Some(texture) = self.target(target_handle).map(|t| t.texture) {
                let source = Source {
                    base,
                    buffer_width,
                    psm,
                    range,
                    rect: region,
                    texture,
                    palette: None,
                    shared_target: Some(target_handle),
                    palette_generation: None,
                    mip_levels: 0,
                    age: 0,
                    resident_bytes: 0,
                };
                self.stats.source_shared += 1;
                return self.insert_source(source);
            }
        }

        // Live decoded entry covering the region
        let mut hit = None;
        for (index, slot) in self.sources.iter().enumerate() {
            if let Some(source) = &slot.entry {
                if source.shared_target.is_none()
                    && source.base == base
                    && source.buffer_width == buffer_width
                    && source.psm == psm
                    && source.rect.contains(&region)
                    && source.mip_levels >= mip_levels
                    && source
                        .palette_generation
                        .map(|g| g == clut_gen)
                        .unwrap_or(true)
                {
                    hit = Some((index as u32, slot.generation));
                    break;
                }
            }
        }
        if let Some((index, generation)) = hit {
            let handle = SourceHandle { index, generation };
            self.stats.source_hits += 1;
            if let Some(slot) = self.sources.get_mut(index as usize) {
                if let Some(source) = slot.entry.as_mut() {
                    source.age = 0;
                }
            }
            return handle;
        }

        self.stats.source_misses += 1;
        let source = self.decode_source(
            device, mem, base, buffer_width, psm, texa, csa, region, mip_levels, clut_gen,
        );
        let handle = self.insert_source(source);
        self.enforce_ceiling(device, None, Some(handle));
        handle
    }

    /// Record a write to local memory
    ///
    /// Targets matching the written layout defer a re-upload over the
    /// rectangle; incompatible overlapping targets are retired. Every
    /// overlapping source is retired so the next lookup re-decodes.
    pub fn invalidate_video_mem(
        &mut self,
        device: &mut dyn DeviceBackend,
        base: u32,
        buffer_width: u32,
        psm: Psm,
        rect: PixelRect,
    ) {
        let range = BlockRange::from_rect(base, buffer_width.max(1), rect, psm);
        if range.is_empty() {
            return;
        }

        for handle in self.live_target_handles() {
            let Some(target) = self.target(handle) else {
                continue;
            };
            if !target.range.overlaps(&range) {
                continue;
            }
            let same_layout = target.base == base
                && target.buffer_width == buffer_width
                && target.psm.depth_compatible(psm);
            if same_layout {
                let Some(target) = self.target_mut(handle) else {
                    continue;
                };
                target.dirty.push(rect);
                target.valid = target.valid.union(&rect.intersection(&PixelRect::from_size(
                    0,
                    0,
                    target.size.0,
                    target.size.1,
                )));
            } else {
                log::debug!(
                    "Retiring target bp={:#x} over cross-format write at bp={:#x}",
                    target.base,
                    base
                );
                self.retire_target(device, handle);
            }
        }

        self.retire_sources_overlapping(device, range);
    }

    /// Synchronize local memory before the CPU reads a range
    ///
    /// Targets with GPU-only data overlapping the range are read back into
    /// local memory. Backends that cannot read back leave local memory as
    /// is (logged once per target).
    pub fn invalidate_local_mem(
        &mut self,
        device: &mut dyn DeviceBackend,
        mem: &mut LocalMemory,
        base: u32,
        buffer_width: u32,
        psm: Psm,
        rect: PixelRect,
    ) {
        let range = BlockRange::from_rect(base, buffer_width.max(1), rect, psm);
        if range.is_empty() {
            return;
        }
        for handle in self.live_target_handles() {
            let Some(target) = self.target(handle) else {
                continue;
            };
            if !target.range.overlaps(&range) || target.gpu_dirty.is_empty() {
                continue;
            }
            let (texture, gpu_rect) = (target.texture, target.gpu_dirty);
            let (t_base, t_bw, t_psm) = (target.base, target.buffer_width, target.psm);
            match device.read_texture(texture, gpu_rect) {
                Some(data) => {
                    write_rgba_rows(mem, t_base, t_bw, t_psm, gpu_rect, &data);
                    if let Some(target) = self.target_mut(handle) {
                        target.gpu_dirty = PixelRect::default();
                    }
                }
                None => {
                    log::debug!(
                        "Backend cannot read back target bp={t_base:#x}; local memory stays authoritative"
                    );
                }
            }
        }
    }

    /// Mark a target drawn over a rectangle and drop stale sources
    ///
    /// Called by the orchestrator's post-draw stage. Sources overlapping
    /// the written range are retired unless they share this very target
    /// (shared sources see the new data by construction).
    pub fn mark_target_written(
        &mut self,
        device: &mut dyn DeviceBackend,
        handle: TargetHandle,
        rect: PixelRect,
    ) {
        let range = {
            let Some(target) = self.target_mut(handle) else {
                return;
            };
            let bounded = rect.intersection(&PixelRect::from_size(0, 0, target.size.0, target.size.1));
            target.valid = target.valid.union(&bounded);
            target.gpu_dirty = target.gpu_dirty.union(&bounded);
            target.age = 0;
            BlockRange::from_rect(target.base, target.buffer_width, bounded, target.psm)
        };

        let stale: Vec<SourceHandle> = self
            .live_source_handles()
            .into_iter()
            .filter(|&h| {
                self.source(h)
                    .map(|s| s.range.overlaps(&range) && s.shared_target != Some(handle))
                    .unwrap_or(false)
            })
            .collect();
        for h in stale {
            self.retire_source(device, h);
        }
    }

    /// Age every entry one vertical sync and evict the untouched
    pub fn inc_age(&mut self, device: &mut dyn DeviceBackend) {
        let max_age = self.config.max_age;
        for handle in self.live_target_handles() {
            let expired = self
                .target_mut(handle)
                .map(|t| {
                    t.age += 1;
                    t.age > max_age
                })
                .unwrap_or(false);
            if expired {
                self.stats.evicted += 1;
                self.retire_target(device, handle);
            }
        }
        for handle in self.live_source_handles() {
            let slot = &mut self.sources[handle.index as usize];
            let expired = slot
                .entry
                .as_mut()
                .map(|s| {
                    s.age += 1;
                    s.age > max_age
                })
                .unwrap_or(false);
            if expired {
                self.stats.evicted += 1;
                self.retire_source(device, handle);
            }
        }
    }

    /// Drop every entry (reset/reopen and ceiling overruns)
    pub fn purge(&mut self, device: &mut dyn DeviceBackend) {
        self.stats.purges += 1;
        for handle in self.live_source_handles() {
            self.retire_source(device, handle);
        }
        for handle in self.live_target_handles() {
            self.retire_target(device, handle);
        }
        debug_assert_eq!(self.bytes_resident, 0);
        self.bytes_resident = 0;
    }

    /// Upload pending local-memory writes into the target texture
    pub fn flush_dirty(
        &mut self,
        device: &mut dyn DeviceBackend,
        mem: &LocalMemory,
        handle: TargetHandle,
    ) {
        let Some(target) = self.target_mut(handle) else {
            return;
        };
        if target.dirty.is_empty() {
            return;
        }
        let rects = target.dirty.drain();
        let (base, bw, psm, texture) = (
            target.base,
            target.buffer_width,
            target.psm,
            target.texture,
        );
        let bounds = PixelRect::from_size(0, 0, target.size.0, target.size.1);
        let texa = TexA {
            ta0: 0,
            aem: false,
            ta1: 0x80,
        };
        for rect in rects {
            let rect = rect.intersection(&bounds);
            if rect.is_empty() {
                continue;
            }
            let data = mem.read_texture_rgba(base, bw, rect, psm, texa, 0);
            device.upload_texture(texture, rect, &data);
        }
    }

    /// The live target whose base and pixel depth match, if any
    ///
    /// Used both for target-sharing sources and by the classify stage to
    /// tell render-target textures from plain memory textures.
    pub fn target_covering(&self, base: u32, psm: Psm) -> Option<TargetHandle> {
        self.find_target_for_share(base, psm)
    }

    fn find_target_for_share(&self, base: u32, psm: Psm) -> Option<TargetHandle> {
        for (index, slot) in self.targets.iter().enumerate() {
            if let Some(target) = &slot.entry {
                if target.base == base && target.psm.depth_compatible(psm) {
                    return Some(TargetHandle {
                        index: index as u32,
                        generation: slot.generation,
                    });
                }
            }
        }
        None
    }

    #[allow(clippy::too_many_arguments)]
    fn decode_source(
        &mut self,
        device: &mut dyn DeviceBackend,
        mem: &LocalMemory,
        base: u32,
        buffer_width: u32,
        psm: Psm,
        texa: TexA,
        csa: u32,
        region: PixelRect,
        mip_levels: u32,
        clut_gen: u64,
    ) -> Source {
        let range = BlockRange::from_rect(base, buffer_width.max(1), region, psm);
        let mut resident_bytes = 0;
        let (texture, palette, palette_generation) = if psm.is_indexed() {
            // Indices and palette travel separately so palette swaps do not
            // re-upload texel data
            let texture = device.create_texture(region.width(), region.height(), TextureKind::Index);
            let mut indices = Vec::with_capacity((region.width() * region.height()) as usize);
            for y in region.y0..region.y1 {
                for x in region.x0..region.x1 {
                    indices.push(mem.read_pixel(base, buffer_width.max(1), x, y, psm) as u8);
                }
            }
            device.upload_texture(texture, region, &indices);
            resident_bytes += indices.len();

            let palette = device.create_texture(256, 1, TextureKind::Color);
            let entries = mem.clut_rgba(texa);
            let mut bytes = Vec::with_capacity(256 * 4);
            for entry in entries {
                bytes.extend_from_slice(&entry.to_le_bytes());
            }
            device.upload_texture(palette, PixelRect::from_size(0, 0, 256, 1), &bytes);
            resident_bytes += bytes.len();
            (texture, Some(palette), Some(clut_gen))
        } else {
            let texture = device.create_texture(region.width(), region.height(), TextureKind::Color);
            let data = mem.read_texture_rgba(base, buffer_width.max(1), region, psm, texa, csa);
            resident_bytes += data.len();
            device.upload_texture(texture, region, &data);
            (texture, None, None)
        };
        self.account_alloc(resident_bytes);

        Source {
            base,
            buffer_width,
            psm,
            range,
            rect: region,
            texture,
            palette,
            shared_target: None,
            palette_generation,
            mip_levels,
            age: 0,
            resident_bytes,
        }
    }

    fn grow_target(
        &mut self,
        device: &mut dyn DeviceBackend,
        handle: TargetHandle,
        width: u32,
        height: u32,
    ) {
        let Some(target) = self.target(handle) else {
            return;
        };
        let new_w = width.max(target.size.0);
        let new_h = height.max(target.size.1);
        let scale = target.scale;
        let old_texture = target.texture;
        let old_size = target.size;
        let kind = match target.kind {
            TargetKind::Color => TextureKind::Color,
            TargetKind::Depth => TextureKind::Depth,
        };
        log::debug!(
            "Growing target bp={:#x} {}x{} -> {}x{}",
            target.base,
            old_size.0,
            old_size.1,
            new_w,
            new_h
        );

        let texture = device.create_texture(new_w * scale, new_h * scale, kind);
        self.account_alloc((new_w * scale) as usize * (new_h * scale) as usize * 4);
        device.copy_texture(
            old_texture,
            texture,
            PixelRect::from_size(0, 0, old_size.0 * scale, old_size.1 * scale),
        );
        device.destroy_texture(old_texture);
        self.account_free((old_size.0 * scale) as usize * (old_size.1 * scale) as usize * 4);

        if let Some(target) = self.target_mut(handle) {
            target.texture = texture;
            target.size = (new_w, new_h);
            target.range = BlockRange::from_rect(
                target.base,
                target.buffer_width,
                PixelRect::from_size(0, 0, new_w, new_h),
                target.psm,
            );
        }
    }

    fn retire_target(&mut self, device: &mut dyn DeviceBackend, handle: TargetHandle) {
        // Shared sources die with the target they alias
        let dependents: Vec<SourceHandle> = self
            .live_source_handles()
            .into_iter()
            .filter(|&h| {
                self.source(h)
                    .map(|s| s.shared_target == Some(handle))
                    .unwrap_or(false)
            })
            .collect();
        for h in dependents {
            self.retire_source(device, h);
        }

        let slot = &mut self.targets[handle.index as usize];
        if slot.generation != handle.generation {
            return;
        }
        if let Some(target) = slot.entry.take() {
            slot.generation += 1;
            device.destroy_texture(target.texture);
            let scale = target.scale as usize;
            self.account_free(
                target.size.0 as usize * scale * target.size.1 as usize * scale * 4,
            );
        }
    }

    fn retire_source(&mut self, device: &mut dyn DeviceBackend, handle: SourceHandle) {
        let slot = &mut self.sources[handle.index as usize];
        if slot.generation != handle.generation {
            return;
        }
        if let Some(source) = slot.entry.take() {
            slot.generation += 1;
            if source.owns_texture() {
                device.destroy_texture(source.texture);
                if let Some(palette) = source.palette {
                    device.destroy_texture(palette);
                }
                self.account_free(source.resident_bytes);
            }
        }
    }

    fn retire_sources_overlapping(&mut self, device: &mut dyn DeviceBackend, range: BlockRange) {
        let stale: Vec<SourceHandle> = self
            .live_source_handles()
            .into_iter()
            .filter(|&h| {
                self.source(h)
                    .map(|s| s.range.overlaps(&range))
                    .unwrap_or(false)
            })
            .collect();
        for handle in stale {
            self.retire_source(device, handle);
        }
    }

    fn live_target_handles(&self) -> Vec<TargetHandle> {
        self.targets
            .iter()
            .enumerate()
            .filter(|(_, s)| s.entry.is_some())
            .map(|(index, s)| TargetHandle {
                index: index as u32,
                generation: s.generation,
            })
            .collect()
    }

    fn live_source_handles(&self) -> Vec<SourceHandle> {
        self.sources
            .iter()
            .enumerate()
            .filter(|(_, s)| s.entry.is_some())
            .map(|(index, s)| SourceHandle {
                index: index as u32,
                generation: s.generation,
            })
            .collect()
    }

    fn insert_target(&mut self, target: Target) -> TargetHandle {
        for (index, slot) in self.targets.iter_mut().enumerate() {
            if slot.entry.is_none() {
                slot.entry = Some(target);
                return TargetHandle {
                    index: index as u32,
                    generation: slot.generation,
                };
            }
        }
        self.targets.push(Slot {
            entry: Some(target),
            generation: 0,
        });
        TargetHandle {
            index: (self.targets.len() - 1) as u32,
            generation: 0,
        }
    }

    fn insert_source(&mut self, source: Source) -> SourceHandle {
        for (index, slot) in self.sources.iter_mut().enumerate() {
            if slot.entry.is_none() {
                slot.entry = Some(source);
                return SourceHandle {
                    index: index as u32,
                    generation: slot.generation,
                };
            }
        }
        self.sources.push(Slot {
            entry: Some(source),
            generation: 0,
        });
        SourceHandle {
            index: (self.sources.len() - 1) as u32,
            generation: 0,
        }
    }

    fn account_alloc(&mut self, bytes: usize) {
        self.bytes_resident += bytes;
    }

    fn account_free(&mut self, bytes: usize) {
        self.bytes_resident = self.bytes_resident.saturating_sub(bytes);
    }

    /// Purge over-ceiling residency, sparing the entry just handed out
    fn enforce_ceiling(
        &mut self,
        device: &mut dyn DeviceBackend,
        keep_target: Option<TargetHandle>,
        keep_source: Option<SourceHandle>,
    ) {
        if self.bytes_resident <= self.config.memory_ceiling {
            return;
        }
        if !self.ceiling_warned {
            log::warn!(
                "Texture cache exceeded {} bytes; purging (this warning is not repeated)",
                self.config.memory_ceiling
            );
            self.ceiling_warned = true;
        }
        self.stats.purges += 1;
        for handle in self.live_source_handles() {
            if Some(handle) != keep_source {
                self.retire_source(device, handle);
            }
        }
        for handle in self.live_target_handles() {
            // A spared source sharing a target keeps that target alive too
            let shared_with_kept = keep_source
                .and_then(|s| self.source(s))
                .map(|s| s.shared_target == Some(handle))
                .unwrap_or(false);
            if Some(handle) != keep_target && !shared_with_kept {
                self.retire_target(device, handle);
            }
        }
    }
}

/// Write RGBA8 rows back into local memory at the target's format
fn write_rgba_rows(
    mem: &mut LocalMemory,
    base: u32,
    buffer_width: u32,
    psm: Psm,
    rect: PixelRect,
    data: &[u8],
) {
    let mut chunks = data.chunks_exact(4);
    for y in rect.y0..rect.y1 {
        for x in rect.x0..rect.x1 {
            let Some(px) = chunks.next() else {
                return;
            };
            let rgba = u32::from_le_bytes([px[0], px[1], px[2], px[3]]);
            let value = match psm.as_color() {
                Psm::Ct16 | Psm::Ct16s => {
                    // Compress to 1555
                    (((rgba >> 3) & 0x1F)
                        | (((rgba >> 11) & 0x1F) << 5)
                        | (((rgba >> 19) & 0x1F) << 10)
                        | ((rgba >> 31) << 15)) as u32
                }
                _ => rgba,
            };
            mem.write_pixel(base, buffer_width, x, y, psm, value);
        }
    }
}
