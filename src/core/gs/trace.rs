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

//! Vertex trace
//!
//! One pass over a finalized batch computing the per-attribute minimum and
//! maximum plus constancy flags. Nearly every downstream decision reads
//! this: target sizing uses the position bounds, the clear fast path needs
//! constant color, blend selection needs the alpha range, and the texture
//! lookup needs the coordinate bounds.
//!
//! The trace must be recomputed exactly once per batch before any decision
//! logic runs; consumers assert the serial number they were computed for.

use bitflags::bitflags;

use super::vertex::GsVertex;

bitflags! {
    /// Attribute groups whose value is identical across the whole batch
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FlatAttributes: u8 {
        /// All vertices share one color
        const RGBA = 1 << 0;
        /// All vertices share one depth value
        const Z = 1 << 1;
        /// All vertices share one texel coordinate
        const UV = 1 << 2;
        /// All vertices share one S/T/Q coordinate
        const STQ = 1 << 3;
        /// All vertices share one fog coefficient
        const FOG = 1 << 4;
    }
}

/// Result of the batch analysis pass
#[derive(Debug, Clone, Copy, Default)]
pub struct VertexTrace {
    /// Position minimum in pixels (X, Y)
    pub min_xy: [f32; 2],
    /// Position maximum in pixels (X, Y)
    pub max_xy: [f32; 2],
    /// Depth minimum
    pub min_z: u32,
    /// Depth maximum
    pub max_z: u32,
    /// Texel coordinate minimum in pixels (U, V)
    pub min_uv: [f32; 2],
    /// Texel coordinate maximum in pixels (U, V)
    pub max_uv: [f32; 2],
    /// Per-channel color minimum (R, G, B, A)
    pub min_rgba: [u8; 4],
    /// Per-channel color maximum (R, G, B, A)
    pub max_rgba: [u8; 4],
    /// Fog minimum
    pub min_fog: u8,
    /// Fog maximum
    pub max_fog: u8,
    /// Attributes constant across the batch
    pub flat: FlatAttributes,
    /// Serial of the batch this trace was computed for
    pub serial: u64,
}

impl VertexTrace {
    /// Analyze a batch
    ///
    /// `fst` selects which coordinate set feeds the UV bounds: texel
    /// coordinates directly, or S/T divided by Q per vertex.
    pub fn compute(vertices: &[GsVertex], indices: &[u32], fst: bool, serial: u64) -> Self {
        let mut trace = Self {
            serial,
            ..Self::default()
        };
        let Some(&first_idx) = indices.first() else {
            return trace;
        };
        let first = &vertices[first_idx as usize];

        trace.min_xy = [first.x_px(), first.y_px()];
        trace.max_xy = trace.min_xy;
        trace.min_z = first.z;
        trace.max_z = first.z;
        trace.min_rgba = first.rgba;
        trace.max_rgba = first.rgba;
        trace.min_fog = first.fog;
        trace.max_fog = first.fog;
        let first_uv = Self::uv_of(first, fst);
        trace.min_uv = first_uv;
        trace.max_uv = first_uv;
        trace.flat = FlatAttributes::all();

        for &index in &indices[1..] {
            let v = &vertices[index as usize];

            let xy = [v.x_px(), v.y_px()];
            trace.min_xy = [trace.min_xy[0].min(xy[0]), trace.min_xy[1].min(xy[1])];
            trace.max_xy = [trace.max_xy[0].max(xy[0]), trace.max_xy[1].max(xy[1])];

            if v.z != first.z {
                trace.flat.remove(FlatAttributes::Z);
            }
            trace.min_z = trace.min_z.min(v.z);
            trace.max_z = trace.max_z.max(v.z);

            if v.rgba != first.rgba {
                trace.flat.remove(FlatAttributes::RGBA);
            }
            for c in 0..4 {
                trace.min_rgba[c] = trace.min_rgba[c].min(v.rgba[c]);
                trace.max_rgba[c] = trace.max_rgba[c].max(v.rgba[c]);
            }

            if v.fog != first.fog {
                trace.flat.remove(FlatAttributes::FOG);
            }
            trace.min_fog = trace.min_fog.min(v.fog);
            trace.max_fog = trace.max_fog.max(v.fog);

            if (v.u, v.v) != (first.u, first.v) {
                trace.flat.remove(FlatAttributes::UV);
            }
            if v.st != first.st || v.q != first.q {
                trace.flat.remove(FlatAttributes::STQ);
            }
            let uv = Self::uv_of(v, fst);
            trace.min_uv = [trace.min_uv[0].min(uv[0]), trace.min_uv[1].min(uv[1])];
            trace.max_uv = [trace.max_uv[0].max(uv[0]), trace.max_uv[1].max(uv[1])];
        }
        trace
    }

    #[inline(always)]
    fn uv_of(v: &GsVertex, fst: bool) -> [f32; 2] {
        if fst {
            [v.u as f32 / 16.0, v.v as f32 / 16.0]
        } else {
            // S/T are normalized; the caller scales by texture size. Guard
            // against Q of zero from malformed streams.
            let q = if v.q == 0.0 { 1.0 } else { v.q };
            [v.st[0] / q, v.st[1] / q]
        }
    }

    /// Source alpha range of the batch
    ///
    /// The blend engine keys on this: a batch whose alpha never exceeds 128
    /// cannot overflow an accumulation blend, and a constant alpha turns a
    /// variable factor into a fixed one.
    #[inline(always)]
    pub fn alpha_range(&self) -> (u8, u8) {
        (self.min_rgba[3], self.max_rgba[3])
    }

    /// Whether every vertex carries the same color
    #[inline(always)]
    pub fn constant_color(&self) -> bool {
        self.flat.contains(FlatAttributes::RGBA)
    }

    /// Whether every vertex carries the same depth
    #[inline(always)]
    pub fn constant_z(&self) -> bool {
        self.flat.contains(FlatAttributes::Z)
    }

    /// Position bounds as integer pixels, rounded outwards
    pub fn bounds(&self) -> super::super::vmem::format::PixelRect {
        super::super::vmem::format::PixelRect {
            x0: self.min_xy[0].floor().max(0.0) as u32,
            y0: self.min_xy[1].floor().max(0.0) as u32,
            x1: self.max_xy[0].ceil().max(0.0) as u32,
            y1: self.max_xy[1].ceil().max(0.0) as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::Zeroable;

    fn vertex(x: u16, y: u16, z: u32, rgba: [u8; 4]) -> GsVertex {
        GsVertex {
            x: x << 4,
            y: y << 4,
            z,
            rgba,
            ..GsVertex::zeroed()
        }
    }

    #[test]
    fn test_empty_batch() {
        let trace = VertexTrace::compute(&[], &[], true, 7);
        assert_eq!(trace.serial, 7);
        assert!(trace.bounds().is_empty());
    }

    #[test]
    fn test_bounds_and_minmax() {
        let vertices = vec![
            vertex(10, 20, 100, [0, 0, 0, 10]),
            vertex(50, 5, 300, [255, 0, 0, 200]),
            vertex(30, 40, 200, [0, 255, 0, 50]),
        ];
        let trace = VertexTrace::compute(&vertices, &[0, 1, 2], true, 0);
        assert_eq!(trace.min_xy, [10.0, 5.0]);
        assert_eq!(trace.max_xy, [50.0, 40.0]);
        assert_eq!(trace.min_z, 100);
        assert_eq!(trace.max_z, 300);
        assert_eq!(trace.alpha_range(), (10, 200));
        assert!(!trace.constant_color());
        assert!(!trace.constant_z());
        let bounds = trace.bounds();
        assert_eq!((bounds.x0, bounds.y0, bounds.x1, bounds.y1), (10, 5, 50, 40));
    }

    #[test]
    fn test_flat_detection() {
        let vertices = vec![
            vertex(0, 0, 5, [1, 2, 3, 4]),
            vertex(10, 0, 5, [1, 2, 3, 4]),
            vertex(0, 10, 5, [1, 2, 3, 4]),
        ];
        let trace = VertexTrace::compute(&vertices, &[0, 1, 2], true, 0);
        assert!(trace.constant_color());
        assert!(trace.constant_z());
        assert!(trace.flat.contains(FlatAttributes::FOG));
        assert!(trace.flat.contains(FlatAttributes::UV));
    }

    #[test]
    fn test_only_indexed_vertices_count() {
        // Vertex 2 is in the array but not referenced; its values must not
        // affect the trace
        let vertices = vec![
            vertex(0, 0, 5, [9, 9, 9, 9]),
            vertex(1, 1, 5, [9, 9, 9, 9]),
            vertex(99, 99, 999, [0, 0, 0, 0]),
        ];
        let trace = VertexTrace::compute(&vertices, &[0, 1], true, 0);
        assert_eq!(trace.max_xy, [1.0, 1.0]);
        assert_eq!(trace.max_z, 5);
        assert!(trace.constant_color());
    }

    #[test]
    fn test_uv_from_stq() {
        let mut a = GsVertex::zeroed();
        a.st = [0.5, 0.25];
        a.q = 0.5;
        let mut b = GsVertex::zeroed();
        b.st = [0.1, 0.1];
        b.q = 1.0;
        let trace = VertexTrace::compute(&[a, b], &[0, 1], false, 0);
        assert_eq!(trace.max_uv, [1.0, 0.5]);
        assert_eq!(trace.min_uv, [0.1, 0.1]);
        assert!(!trace.flat.contains(FlatAttributes::STQ));
    }
}
