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

//! Destination-alpha-test strategy and batch overlap analysis
//!
//! DATE discards pixels based on the alpha bit already in the render
//! target, which no current API tests natively. Three emulations exist,
//! trading accuracy against cost; which ones are correct depends on
//! whether primitives in the batch can land on the same pixel (a later
//! primitive may flip the alpha bit an earlier one tested).

use crate::core::device::{BarrierReq, DateMode, DeviceCaps};
use crate::core::gs::registers::Test;
use crate::core::gs::vertex::{GsVertex, PrimClass};
use crate::core::vmem::format::PixelRect;

/// Pick the DATE emulation for a draw
///
/// Primitive-ID tracking is exact under overlap; the stencil pre-pass is
/// exact only when no primitive covers another (the stencil is built once,
/// before any color write); the read-back barrier is the catch-all.
pub fn decide_date(test: &Test, caps: &DeviceCaps, may_overlap: bool) -> (DateMode, BarrierReq) {
    if !test.date {
        return (DateMode::Off, BarrierReq::None);
    }
    if caps.primid_tracking && may_overlap {
        return (DateMode::PrimIdTracking, BarrierReq::None);
    }
    if caps.stencil && !may_overlap {
        return (DateMode::StencilPrepass, BarrierReq::None);
    }
    if caps.texture_barrier {
        let barrier = if may_overlap {
            BarrierReq::PerPrimitive
        } else {
            BarrierReq::Once
        };
        return (DateMode::ReadBarrier, barrier);
    }
    // Nothing accurate is available; the stencil pre-pass is the least
    // wrong option when present
    if caps.stencil {
        return (DateMode::StencilPrepass, BarrierReq::None);
    }
    log::warn!("DATE requested but the backend supports no emulation path");
    (DateMode::Off, BarrierReq::None)
}

/// Whether any two primitives of the batch can touch the same pixel
///
/// Exact pairwise bounding-box tests up to `limit` primitives; larger
/// batches are conservatively assumed to overlap. Degenerate primitives
/// have empty boxes and never overlap anything.
pub fn batch_may_overlap(
    vertices: &[GsVertex],
    indices: &[u32],
    class: PrimClass,
    limit: usize,
) -> bool {
    let step = class.indices_per_prim();
    if step == 0 || indices.len() <= step {
        return false;
    }
    let count = indices.len() / step;
    if count > limit {
        return true;
    }

    let boxes: Vec<PixelRect> = indices
        .chunks_exact(step)
        .map(|prim| prim_bounds(vertices, prim))
        .collect();
    for (i, a) in boxes.iter().enumerate() {
        for b in &boxes[i + 1..] {
            if a.overlaps(b) {
                return true;
            }
        }
    }
    false
}

fn prim_bounds(vertices: &[GsVertex], prim: &[u32]) -> PixelRect {
    let mut bounds = PixelRect::default();
    for (n, &index) in prim.iter().enumerate() {
        let v = &vertices[index as usize];
        let x = v.x_px().floor().max(0.0) as u32;
        let y = v.y_px().floor().max(0.0) as u32;
        let px = PixelRect::new(x, y, x + 1, y + 1);
        bounds = if n == 0 { px } else { bounds.union(&px) };
    }
    bounds
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::Zeroable;

    fn test_reg(date: bool) -> Test {
        Test::from_u64(if date { 1 << 14 } else { 0 })
    }

    fn vertex(x: u16, y: u16) -> GsVertex {
        GsVertex {
            x: x << 4,
            y: y << 4,
            ..GsVertex::zeroed()
        }
    }

    #[test]
    fn test_date_off() {
        let (mode, barrier) = decide_date(&test_reg(false), &DeviceCaps::all(), true);
        assert_eq!(mode, DateMode::Off);
        assert_eq!(barrier, BarrierReq::None);
    }

    #[test]
    fn test_primid_preferred_under_overlap() {
        let (mode, _) = decide_date(&test_reg(true), &DeviceCaps::all(), true);
        assert_eq!(mode, DateMode::PrimIdTracking);
    }

    #[test]
    fn test_stencil_when_disjoint() {
        let caps = DeviceCaps {
            primid_tracking: false,
            ..DeviceCaps::all()
        };
        let (mode, barrier) = decide_date(&test_reg(true), &caps, false);
        assert_eq!(mode, DateMode::StencilPrepass);
        assert_eq!(barrier, BarrierReq::None);
    }

    #[test]
    fn test_barrier_fallback_under_overlap() {
        let caps = DeviceCaps {
            primid_tracking: false,
            stencil: false,
            ..DeviceCaps::all()
        };
        let (mode, barrier) = decide_date(&test_reg(true), &caps, true);
        assert_eq!(mode, DateMode::ReadBarrier);
        assert_eq!(barrier, BarrierReq::PerPrimitive);
    }

    #[test]
    fn test_single_primitive_never_overlaps() {
        let vertices = vec![vertex(0, 0), vertex(10, 10)];
        assert!(!batch_may_overlap(&vertices, &[0, 1], PrimClass::Sprite, 64));
    }

    #[test]
    fn test_disjoint_sprites() {
        let vertices = vec![
            vertex(0, 0),
            vertex(10, 10),
            vertex(20, 20),
            vertex(30, 30),
        ];
        assert!(!batch_may_overlap(
            &vertices,
            &[0, 1, 2, 3],
            PrimClass::Sprite,
            64
        ));
    }

    #[test]
    fn test_overlapping_sprites() {
        let vertices = vec![vertex(0, 0), vertex(10, 10), vertex(5, 5), vertex(15, 15)];
        assert!(batch_may_overlap(
            &vertices,
            &[0, 1, 2, 3],
            PrimClass::Sprite,
            64
        ));
    }

    #[test]
    fn test_limit_is_conservative() {
        // Disjoint sprites, but more than the test budget allows
        let mut vertices = Vec::new();
        let mut indices = Vec::new();
        for i in 0..8u16 {
            vertices.push(vertex(i * 20, 0));
            vertices.push(vertex(i * 20 + 10, 10));
            indices.push((i * 2) as u32);
            indices.push((i * 2 + 1) as u32);
        }
        assert!(!batch_may_overlap(&vertices, &indices, PrimClass::Sprite, 64));
        assert!(batch_may_overlap(&vertices, &indices, PrimClass::Sprite, 4));
    }

    #[test]
    fn test_overlapping_triangles() {
        let vertices = vec![
            vertex(0, 0),
            vertex(10, 0),
            vertex(0, 10),
            vertex(5, 5),
            vertex(15, 5),
            vertex(5, 15),
        ];
        assert!(batch_may_overlap(
            &vertices,
            &[0, 1, 2, 3, 4, 5],
            PrimClass::Triangle,
            64
        ));
    }
}
