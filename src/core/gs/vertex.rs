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

//! Vertex storage and primitive assembly
//!
//! Kicked vertices are appended to a contiguous growable array and never
//! mutated afterwards; primitives reference them through an index list.
//! Strip and fan primitives share vertices through the index list rather
//! than duplicating them.

use bytemuck::{Pod, Zeroable};

use super::registers::PrimKind;

/// One GS vertex as assembled by the register decoder
///
/// Positions are window coordinates in 12.4 fixed point (the XYOFFSET
/// subtraction has already happened). Texture addressing carries both the
/// perspective (S, T, Q) and the texel (U, V in 12.4) forms; PRIM.FST picks
/// which one a draw consumes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GsVertex {
    /// Perspective texture coordinates
    pub st: [f32; 2],
    /// Vertex color (RGBA)
    pub rgba: [u8; 4],
    /// Perspective divisor latched from RGBAQ
    pub q: f32,
    /// X in 12.4 fixed point
    pub x: u16,
    /// Y in 12.4 fixed point
    pub y: u16,
    /// Depth value
    pub z: u32,
    /// U in 12.4 fixed point
    pub u: u16,
    /// V in 12.4 fixed point
    pub v: u16,
    /// Fog coefficient
    pub fog: u8,
    /// Padding for a 32-byte stride
    pub _pad: [u8; 3],
}

impl GsVertex {
    /// X coordinate in pixels
    #[inline(always)]
    pub fn x_px(&self) -> f32 {
        self.x as f32 / 16.0
    }

    /// Y coordinate in pixels
    #[inline(always)]
    pub fn y_px(&self) -> f32 {
        self.y as f32 / 16.0
    }

    /// Alpha channel
    #[inline(always)]
    pub fn alpha(&self) -> u8 {
        self.rgba[3]
    }
}

/// Primitive classes after assembly
///
/// The draw pipeline only distinguishes these four; strip/fan forms have
/// already been flattened into the index list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimClass {
    /// Points (1 index each)
    Point,
    /// Lines (2 indices each)
    Line,
    /// Triangles (3 indices each)
    Triangle,
    /// Sprites (2 indices each, opposite corners)
    Sprite,
}

impl PrimClass {
    /// Classify an assembled primitive kind
    pub fn from_kind(kind: PrimKind) -> Self {
        match kind {
            PrimKind::Point | PrimKind::Invalid => Self::Point,
            PrimKind::Line | PrimKind::LineStrip => Self::Line,
            PrimKind::Triangle | PrimKind::TriangleStrip | PrimKind::TriangleFan => Self::Triangle,
            PrimKind::Sprite => Self::Sprite,
        }
    }

    /// Indices consumed per primitive
    pub fn indices_per_prim(self) -> usize {
        match self {
            Self::Point => 1,
            Self::Line | Self::Sprite => 2,
            Self::Triangle => 3,
        }
    }
}

/// Serializable image of the assembly state
///
/// Vertices travel as raw bytes; `GsVertex` is `Pod`, so the cast is exact.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AssemblerSnapshot {
    /// Vertex array contents as bytes
    pub vertices: Vec<u8>,
    /// Index array contents
    pub indices: Vec<u32>,
    /// Assembly window indices
    pub window: [u32; 3],
    /// Occupied window slots
    pub window_len: u32,
    /// Strip run length
    pub strip_run: u32,
    /// Batch serial number
    pub serial: u64,
}

/// Assembles kicked vertices into an indexed primitive batch
///
/// Owns the vertex and index arrays for the batch currently being built.
/// The register decoder pushes vertices through [`VertexAssembler::kick`];
/// the draw orchestrator consumes and clears the batch on flush.
#[derive(Debug, Default)]
pub struct VertexAssembler {
    /// Kicked vertices, immutable once pushed
    pub vertices: Vec<GsVertex>,
    /// Indices into `vertices`, `indices_per_prim` per primitive
    pub indices: Vec<u32>,
    /// Assembly window of vertex indices for the in-progress primitive
    window: [u32; 3],
    window_len: usize,
    /// Vertices seen since the last window reset (strips need two before
    /// emitting every subsequent vertex)
    strip_run: usize,
    /// Batch serial number, bumped on every clear; the vertex trace records
    /// which serial it was computed for
    serial: u64,
}

impl VertexAssembler {
    /// Create an empty assembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of complete primitives in the batch
    pub fn prim_count(&self, class: PrimClass) -> usize {
        self.indices.len() / class.indices_per_prim()
    }

    /// Whether the batch holds nothing to draw
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Batch serial number
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Whether the next drawing kick would complete a primitive
    ///
    /// Used by the auto-flush check to inspect a primitive before it is
    /// committed to the batch.
    pub fn will_complete(&self, kind: PrimKind) -> bool {
        match kind {
            PrimKind::Point | PrimKind::Invalid => true,
            PrimKind::Line | PrimKind::Sprite => self.window_len == 1,
            PrimKind::LineStrip => self.strip_run >= 1,
            PrimKind::Triangle => self.window_len == 2,
            PrimKind::TriangleStrip | PrimKind::TriangleFan => self.strip_run >= 2,
        }
    }

    /// Vertices of the primitive the next kick would complete
    ///
    /// Returns the window vertices; together with the incoming vertex these
    /// are the corners the auto-flush overlap test runs against.
    pub fn pending_window(&self) -> &[u32] {
        &self.window[..self.window_len]
    }

    /// Push a kicked vertex and assemble indices
    ///
    /// `adc` suppresses drawing (XYZ3/XYZF3 kicks): the vertex still enters
    /// the assembly window but completes no primitive.
    pub fn kick(&mut self, kind: PrimKind, vertex: GsVertex, adc: bool) {
        let index = self.vertices.len() as u32;
        self.vertices.push(vertex);

        match kind {
            PrimKind::Point => {
                if !adc {
                    self.indices.push(index);
                }
            }
            PrimKind::Invalid => {
                // Reserved primitive type: vertices are consumed, nothing
                // is drawn
            }
            PrimKind::Line | PrimKind::Sprite => {
                self.push_window(index);
                if self.window_len == 2 {
                    if !adc {
                        self.indices.push(self.window[0]);
                        self.indices.push(self.window[1]);
                    }
                    self.window_len = 0;
                }
            }
            PrimKind::LineStrip => {
                self.push_window(index);
                self.strip_run += 1;
                if self.strip_run >= 2 {
                    if !adc {
                        self.indices.push(self.window[0]);
                        self.indices.push(self.window[1]);
                    }
                    self.window[0] = self.window[1];
                    self.window_len = 1;
                }
            }
            PrimKind::Triangle => {
                self.push_window(index);
                if self.window_len == 3 {
                    if !adc {
                        self.indices.extend_from_slice(&self.window);
                    }
                    self.window_len = 0;
                }
            }
            PrimKind::TriangleStrip => {
                self.push_window(index);
                self.strip_run += 1;
                if self.strip_run >= 3 {
                    if !adc {
                        self.indices.extend_from_slice(&self.window);
                    }
                    self.window[0] = self.window[1];
                    self.window[1] = self.window[2];
                    self.window_len = 2;
                }
            }
            PrimKind::TriangleFan => {
                self.push_window(index);
                self.strip_run += 1;
                if self.strip_run >= 3 {
                    if !adc {
                        self.indices.extend_from_slice(&self.window);
                    }
                    // Keep the fan center, slide the edge vertex
                    self.window[1] = self.window[2];
                    self.window_len = 2;
                }
            }
        }
    }

    fn push_window(&mut self, index: u32) {
        if self.window_len < 3 {
            self.window[self.window_len] = index;
            self.window_len += 1;
        } else {
            debug_assert!(false, "assembly window overflow");
            self.window[2] = index;
        }
    }

    /// Reset the assembly window (PRIM writes restart primitive assembly)
    pub fn restart(&mut self) {
        self.window_len = 0;
        self.strip_run = 0;
    }

    /// Clear the batch after a flush, keeping allocations
    pub fn clear(&mut self) {
        self.vertices.clear();
        self.indices.clear();
        self.restart();
        self.serial += 1;
    }

    /// Clear the drawn batch but keep the in-progress primitive
    ///
    /// Auto-flush fires between the completed primitives and one still being
    /// assembled; the window vertices are re-seeded at the front of the array
    /// so the pending primitive completes against the fresh batch.
    pub fn rebase_window(&mut self) {
        let mut window = [GsVertex::zeroed(); 3];
        for (slot, &index) in window.iter_mut().zip(self.window.iter()).take(self.window_len) {
            *slot = self.vertices[index as usize];
        }
        self.vertices.clear();
        self.indices.clear();
        for (i, vertex) in window.iter().enumerate().take(self.window_len) {
            self.vertices.push(*vertex);
            self.window[i] = i as u32;
        }
        self.serial += 1;
    }

    /// Snapshot the assembly state for a save state
    pub fn snapshot(&self) -> AssemblerSnapshot {
        AssemblerSnapshot {
            vertices: bytemuck::cast_slice(&self.vertices).to_vec(),
            indices: self.indices.clone(),
            window: self.window,
            window_len: self.window_len as u32,
            strip_run: self.strip_run as u32,
            serial: self.serial,
        }
    }

    /// Restore the assembly state from a save state
    pub fn restore(&mut self, snapshot: &AssemblerSnapshot) {
        self.vertices = bytemuck::pod_collect_to_vec(&snapshot.vertices);
        self.indices = snapshot.indices.clone();
        self.window = snapshot.window;
        self.window_len = (snapshot.window_len as usize).min(3);
        self.strip_run = snapshot.strip_run as usize;
        self.serial = snapshot.serial;
    }

    /// Rewrite the sprite batch into triangle pairs
    ///
    /// Each sprite (two opposite corners) becomes four vertices and six
    /// indices. The second corner's color, depth and fog apply to the whole
    /// rectangle; texture coordinates interpolate between the corners.
    /// Returns false (batch untouched) when the batch is not sprites.
    pub fn expand_sprites(&mut self) -> bool {
        if self.indices.len() % 2 != 0 {
            debug_assert!(false, "sprite batch with odd index count");
            return false;
        }
        let mut vertices = Vec::with_capacity(self.indices.len() * 2);
        let mut indices = Vec::with_capacity(self.indices.len() * 3);
        for pair in self.indices.chunks_exact(2) {
            let v0 = self.vertices[pair[0] as usize];
            let v1 = self.vertices[pair[1] as usize];
            let base = vertices.len() as u32;

            // Flat attributes come from the closing corner
            let mut top_left = v1;
            top_left.x = v0.x;
            top_left.y = v0.y;
            top_left.u = v0.u;
            top_left.v = v0.v;
            top_left.st = v0.st;

            let mut top_right = v1;
            top_right.y = v0.y;
            top_right.v = v0.v;
            top_right.st = [v1.st[0], v0.st[1]];

            let mut bottom_left = v1;
            bottom_left.x = v0.x;
            bottom_left.u = v0.u;
            bottom_left.st = [v0.st[0], v1.st[1]];

            vertices.push(top_left);
            vertices.push(top_right);
            vertices.push(bottom_left);
            vertices.push(v1);

            indices.extend_from_slice(&[base, base + 1, base + 2, base + 1, base + 2, base + 3]);
        }
        self.vertices = vertices;
        self.indices = indices;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vertex(x: u16, y: u16) -> GsVertex {
        GsVertex {
            x: x << 4,
            y: y << 4,
            ..GsVertex::zeroed()
        }
    }

    #[test]
    fn test_vertex_stride() {
        assert_eq!(std::mem::size_of::<GsVertex>(), 32);
    }

    #[test]
    fn test_point_kick() {
        let mut asm = VertexAssembler::new();
        asm.kick(PrimKind::Point, vertex(1, 1), false);
        asm.kick(PrimKind::Point, vertex(2, 2), false);
        assert_eq!(asm.indices, vec![0, 1]);
        assert_eq!(asm.prim_count(PrimClass::Point), 2);
    }

    #[test]
    fn test_triangle_kick() {
        let mut asm = VertexAssembler::new();
        for i in 0..6 {
            asm.kick(PrimKind::Triangle, vertex(i, i), false);
        }
        assert_eq!(asm.indices, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(asm.prim_count(PrimClass::Triangle), 2);
    }

    #[test]
    fn test_triangle_strip_shares_vertices() {
        let mut asm = VertexAssembler::new();
        for i in 0..5 {
            asm.kick(PrimKind::TriangleStrip, vertex(i, i), false);
        }
        // 5 vertices, 3 triangles, windows slide by one
        assert_eq!(asm.indices, vec![0, 1, 2, 1, 2, 3, 2, 3, 4]);
        assert_eq!(asm.vertices.len(), 5);
    }

    #[test]
    fn test_triangle_fan_keeps_center() {
        let mut asm = VertexAssembler::new();
        for i in 0..5 {
            asm.kick(PrimKind::TriangleFan, vertex(i, i), false);
        }
        assert_eq!(asm.indices, vec![0, 1, 2, 0, 2, 3, 0, 3, 4]);
    }

    #[test]
    fn test_line_strip() {
        let mut asm = VertexAssembler::new();
        for i in 0..4 {
            asm.kick(PrimKind::LineStrip, vertex(i, i), false);
        }
        assert_eq!(asm.indices, vec![0, 1, 1, 2, 2, 3]);
    }

    #[test]
    fn test_sprite_kick() {
        let mut asm = VertexAssembler::new();
        asm.kick(PrimKind::Sprite, vertex(0, 0), false);
        asm.kick(PrimKind::Sprite, vertex(10, 10), false);
        assert_eq!(asm.indices, vec![0, 1]);
        assert_eq!(asm.prim_count(PrimClass::Sprite), 1);
    }

    #[test]
    fn test_adc_suppresses_drawing() {
        let mut asm = VertexAssembler::new();
        asm.kick(PrimKind::TriangleStrip, vertex(0, 0), false);
        asm.kick(PrimKind::TriangleStrip, vertex(1, 0), false);
        // ADC vertex advances the window without emitting
        asm.kick(PrimKind::TriangleStrip, vertex(2, 0), true);
        assert!(asm.indices.is_empty());
        // The next drawing kick completes a triangle from the slid window
        asm.kick(PrimKind::TriangleStrip, vertex(3, 0), false);
        assert_eq!(asm.indices, vec![1, 2, 3]);
    }

    #[test]
    fn test_will_complete() {
        let mut asm = VertexAssembler::new();
        assert!(asm.will_complete(PrimKind::Point));
        assert!(!asm.will_complete(PrimKind::Triangle));
        asm.kick(PrimKind::Triangle, vertex(0, 0), false);
        asm.kick(PrimKind::Triangle, vertex(1, 0), false);
        assert!(asm.will_complete(PrimKind::Triangle));
    }

    #[test]
    fn test_clear_bumps_serial() {
        let mut asm = VertexAssembler::new();
        let serial = asm.serial();
        asm.kick(PrimKind::Point, vertex(0, 0), false);
        asm.clear();
        assert!(asm.is_empty());
        assert_eq!(asm.serial(), serial + 1);
    }

    #[test]
    fn test_rebase_window_keeps_pending_primitive() {
        let mut asm = VertexAssembler::new();
        asm.kick(PrimKind::Triangle, vertex(0, 0), false);
        asm.kick(PrimKind::Triangle, vertex(1, 0), false);
        asm.kick(PrimKind::Triangle, vertex(2, 0), false);
        // Two vertices of the next triangle are pending
        asm.kick(PrimKind::Triangle, vertex(10, 0), false);
        asm.kick(PrimKind::Triangle, vertex(11, 0), false);

        asm.rebase_window();
        assert!(asm.indices.is_empty());
        assert_eq!(asm.vertices.len(), 2);

        // The pending triangle completes against the rebased window
        asm.kick(PrimKind::Triangle, vertex(12, 0), false);
        assert_eq!(asm.indices, vec![0, 1, 2]);
        assert_eq!(asm.vertices[0].x, 10 << 4);
    }

    #[test]
    fn test_expand_sprites() {
        let mut asm = VertexAssembler::new();
        let mut v0 = vertex(10, 20);
        v0.u = 0;
        v0.v = 0;
        let mut v1 = vertex(30, 40);
        v1.u = 16 << 4;
        v1.v = 16 << 4;
        v1.rgba = [1, 2, 3, 4];
        asm.kick(PrimKind::Sprite, v0, false);
        asm.kick(PrimKind::Sprite, v1, false);

        assert!(asm.expand_sprites());
        assert_eq!(asm.vertices.len(), 4);
        assert_eq!(asm.indices.len(), 6);

        // Corner positions form the rectangle
        assert_eq!((asm.vertices[0].x, asm.vertices[0].y), (10 << 4, 20 << 4));
        assert_eq!((asm.vertices[1].x, asm.vertices[1].y), (30 << 4, 20 << 4));
        assert_eq!((asm.vertices[2].x, asm.vertices[2].y), (10 << 4, 40 << 4));
        assert_eq!((asm.vertices[3].x, asm.vertices[3].y), (30 << 4, 40 << 4));

        // Flat color comes from the closing corner
        for v in &asm.vertices {
            assert_eq!(v.rgba, [1, 2, 3, 4]);
        }

        // Texture coordinates follow their corners
        assert_eq!((asm.vertices[0].u, asm.vertices[0].v), (0, 0));
        assert_eq!((asm.vertices[3].u, asm.vertices[3].v), (16 << 4, 16 << 4));
        assert_eq!((asm.vertices[1].u, asm.vertices[1].v), (16 << 4, 0));
        assert_eq!((asm.vertices[2].u, asm.vertices[2].v), (0, 16 << 4));
    }
}
