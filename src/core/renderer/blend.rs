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

//! Blend strategy selection
//!
//! The GS blend equation is `out = ((A - B) * C >> 7) + D` with A, B, D
//! drawn from {source, destination, zero} and C from {source alpha,
//! destination alpha, fixed}. Alpha 0x80 means 1.0 and values run to 0xFF,
//! so factors reach 2.0; that, plus the wrap-instead-of-clamp COLCLAMP
//! mode and PABE, is why not every equation maps onto fixed-function
//! hardware.
//!
//! [`decide_blend`] classifies each equation into the cheapest strategy
//! the backend supports. The vertex trace feeds two shortcuts: a constant
//! source alpha turns a variable factor into a fixed one, and a bounded
//! alpha proves a factor can never exceed 1.0.

use crate::core::device::{
    BarrierReq, BlendFactor as HwFactor, BlendOp, DeviceCaps, HwBlend, ShaderFlags,
};
use crate::core::gs::registers::{Alpha, BlendFactor, BlendInput};

/// How a draw's blend equation is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendStrategy {
    /// No blending; source color is written as is
    None,
    /// One fixed-function blend state
    Native,
    /// Fixed-function blend with the factor split in the shader
    BlendMix,
    /// Shader computes `Cs * C`, hardware adds the destination
    Accumulation,
    /// Software blend that wraps intermediate color at 8 bits
    ColorClip,
    /// Full software blend reading the target in the shader
    Software,
}

/// Outcome of blend classification
#[derive(Debug, Clone, Copy)]
pub struct BlendDecision {
    /// Selected strategy
    pub strategy: BlendStrategy,
    /// Fixed-function state for strategies that use one
    pub hw: Option<HwBlend>,
    /// Shader flag contributions
    pub flags: ShaderFlags,
    /// Barrier the strategy requires
    pub barrier: BarrierReq,
}

impl BlendDecision {
    fn none() -> Self {
        Self {
            strategy: BlendStrategy::None,
            hw: None,
            flags: ShaderFlags::empty(),
            barrier: BarrierReq::None,
        }
    }

    fn native(hw: HwBlend) -> Self {
        Self {
            strategy: BlendStrategy::Native,
            hw: Some(hw),
            flags: ShaderFlags::empty(),
            barrier: BarrierReq::None,
        }
    }
}

/// Inputs the classifier reads beyond the ALPHA register
#[derive(Debug, Clone, Copy)]
pub struct BlendContext {
    /// PRIM.ABE (or PRMODE) blending enable
    pub abe: bool,
    /// PABE per-pixel blend enable
    pub pabe: bool,
    /// COLCLAMP: true clamps blended color, false wraps at 8 bits
    pub colclamp: bool,
    /// Source alpha min/max from the vertex trace
    pub alpha_range: (u8, u8),
    /// Whether the target format stores alpha (24-bit formats do not)
    pub fb_has_alpha: bool,
    /// Whether primitives in the batch can overlap in screen space
    pub may_overlap: bool,
    /// Primitive count of the batch
    pub prim_count: usize,
    /// Batch size above which per-primitive barriers collapse to one
    pub sw_blend_prim_limit: usize,
}

/// Classify the blend equation into an execution strategy
pub fn decide_blend(alpha: Alpha, ctx: &BlendContext, caps: &DeviceCaps) -> BlendDecision {
    if !ctx.abe {
        return BlendDecision::none();
    }

    // A 24-bit destination has no alpha bits; Ad reads as 1.0
    let mut c = alpha.c;
    let mut fix = alpha.fix;
    if c == BlendFactor::DestAlpha && !ctx.fb_has_alpha {
        c = BlendFactor::Fixed;
        fix = 0x80;
    }
    // A constant source alpha is as good as a fixed factor
    if c == BlendFactor::SourceAlpha && ctx.alpha_range.0 == ctx.alpha_range.1 {
        c = BlendFactor::Fixed;
        fix = ctx.alpha_range.0;
    }

    // (A - B) * C vanishes when A == B; only D remains
    if alpha.a == alpha.b {
        return match alpha.d {
            BlendInput::Source => BlendDecision::none(),
            BlendInput::Dest => BlendDecision::native(HwBlend {
                op: BlendOp::Add,
                src: HwFactor::Zero,
                dst: HwFactor::One,
                constant: 0x80,
            }),
            BlendInput::Zero => BlendDecision::native(HwBlend {
                op: BlendOp::Add,
                src: HwFactor::Zero,
                dst: HwFactor::Zero,
                constant: 0x80,
            }),
        };
    }

    let over_one = factor_exceeds_one(c, fix, ctx.alpha_range);
    let additive = blend_is_additive(alpha);

    // PABE gates blending per pixel on source alpha bit 7; fixed-function
    // hardware has no such condition
    if ctx.pabe {
        return software(ctx, caps, ShaderFlags::PABE);
    }

    // Wrapping arithmetic on overflow needs the shader to see raw sums
    if !ctx.colclamp && additive {
        let mut decision = software(ctx, caps, ShaderFlags::COLCLIP);
        decision.strategy = BlendStrategy::ColorClip;
        return decision;
    }

    // Cs*C + Cd with C possibly above 1.0: multiply in the shader, let the
    // hardware do the pure addition
    if alpha.a == BlendInput::Source
        && alpha.b == BlendInput::Zero
        && alpha.d == BlendInput::Dest
        && over_one
    {
        return BlendDecision {
            strategy: BlendStrategy::Accumulation,
            hw: Some(HwBlend {
                op: BlendOp::Add,
                src: HwFactor::One,
                dst: HwFactor::One,
                constant: 0x80,
            }),
            flags: ShaderFlags::BLEND_ACCU,
            barrier: BarrierReq::None,
        };
    }

    match native_blend(alpha.a, alpha.b, c, alpha.d, fix) {
        Some(hw) if !over_one => BlendDecision::native(hw),
        Some(hw) => {
            // The equation fits the hardware but the factor range does
            // not; halve in the shader, double in the blender
            BlendDecision {
                strategy: BlendStrategy::BlendMix,
                hw: Some(hw),
                flags: ShaderFlags::BLEND_MIX,
                barrier: BarrierReq::None,
            }
        }
        None => software(ctx, caps, ShaderFlags::empty()),
    }
}

/// Whether `(A - B) * C` can push the result past the representable range
fn blend_is_additive(alpha: Alpha) -> bool {
    // Any equation adding a scaled term to D can overflow 8 bits
    alpha.a != alpha.b && alpha.d != BlendInput::Zero
}

fn factor_exceeds_one(c: BlendFactor, fix: u8, alpha_range: (u8, u8)) -> bool {
    match c {
        BlendFactor::SourceAlpha => alpha_range.1 > 0x80,
        // Destination alpha is unknown until the pixel is read
        BlendFactor::DestAlpha => true,
        BlendFactor::Fixed => fix > 0x80,
    }
}

/// The full software path, with barrier choice
fn software(ctx: &BlendContext, caps: &DeviceCaps, extra: ShaderFlags) -> BlendDecision {
    let barrier = if caps.framebuffer_fetch {
        // Fetch hardware sees its own writes; no synchronization needed
        BarrierReq::None
    } else if !caps.texture_barrier {
        // No way to read the target coherently; the draw still blends
        // with whatever the sampler sees
        log::warn!("Software blend without barrier support; output may shimmer");
        BarrierReq::None
    } else if !ctx.may_overlap {
        BarrierReq::Once
    } else if ctx.prim_count > ctx.sw_blend_prim_limit {
        // Per-primitive barriers over a big batch cost more than the
        // accuracy buys; degrade to one barrier for the whole batch
        log::debug!(
            "Batch of {} primitives exceeds software-blend limit {}; using one barrier",
            ctx.prim_count,
            ctx.sw_blend_prim_limit
        );
        BarrierReq::Once
    } else {
        BarrierReq::PerPrimitive
    };
    BlendDecision {
        strategy: BlendStrategy::Software,
        hw: None,
        flags: extra | ShaderFlags::SW_BLEND,
        barrier,
    }
}

/// Map `((A - B) * C) + D` onto one fixed-function state, if possible
fn native_blend(
    a: BlendInput,
    b: BlendInput,
    c: BlendFactor,
    d: BlendInput,
    fix: u8,
) -> Option<HwBlend> {
    use BlendInput::{Dest, Source, Zero};

    let f = match c {
        BlendFactor::SourceAlpha => HwFactor::SrcAlpha,
        BlendFactor::DestAlpha => HwFactor::DstAlpha,
        BlendFactor::Fixed => HwFactor::Constant,
    };
    let inv_f = match c {
        BlendFactor::SourceAlpha => HwFactor::InvSrcAlpha,
        BlendFactor::DestAlpha => HwFactor::InvDstAlpha,
        BlendFactor::Fixed => HwFactor::InvConstant,
    };
    let blend = |op, src, dst| {
        Some(HwBlend {
            op,
            src,
            dst,
            constant: fix,
        })
    };

    match (a, b, d) {
        // Cs*C + Cd*(1-C): classic interpolation
        (Source, Dest, Dest) => blend(BlendOp::Add, f, inv_f),
        // Cs*C - Cd*C
        (Source, Dest, Zero) => blend(BlendOp::Subtract, f, f),
        // Cs*C + Cd
        (Source, Zero, Dest) => blend(BlendOp::Add, f, HwFactor::One),
        // Cs*C
        (Source, Zero, Zero) => blend(BlendOp::Add, f, HwFactor::Zero),
        // Cs*(1-C) + Cd*C
        (Dest, Source, Source) => blend(BlendOp::Add, inv_f, f),
        // Cd*C - Cs*C
        (Dest, Source, Zero) => blend(BlendOp::ReverseSubtract, f, f),
        // Cs + Cd*C
        (Dest, Zero, Source) => blend(BlendOp::Add, HwFactor::One, f),
        // Cd*C
        (Dest, Zero, Zero) => blend(BlendOp::Add, HwFactor::Zero, f),
        // Cs*(1-C)
        (Zero, Source, Source) => blend(BlendOp::Add, inv_f, HwFactor::Zero),
        // Cd - Cs*C
        (Zero, Source, Dest) => blend(BlendOp::ReverseSubtract, f, HwFactor::One),
        // -Cs*C clamps to zero
        (Zero, Source, Zero) => blend(BlendOp::Add, HwFactor::Zero, HwFactor::Zero),
        // Cd*(1-C)
        (Zero, Dest, Dest) => blend(BlendOp::Add, HwFactor::Zero, inv_f),
        // Cs - Cd*C
        (Zero, Dest, Source) => blend(BlendOp::Subtract, HwFactor::One, f),
        // -Cd*C clamps to zero
        (Zero, Dest, Zero) => blend(BlendOp::Add, HwFactor::Zero, HwFactor::Zero),
        // Cs*(1+C) / Cd*(1+C) forms need a factor above one
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alpha(a: u8, b: u8, c: u8, d: u8, fix: u8) -> Alpha {
        Alpha::from_u64(
            (a as u64) | ((b as u64) << 2) | ((c as u64) << 4) | ((d as u64) << 6) | ((fix as u64) << 32),
        )
    }

    fn ctx() -> BlendContext {
        BlendContext {
            abe: true,
            pabe: false,
            colclamp: true,
            alpha_range: (0x00, 0x80),
            fb_has_alpha: true,
            may_overlap: true,
            prim_count: 4,
            sw_blend_prim_limit: 100,
        }
    }

    #[test]
    fn test_abe_off_disables_blending() {
        let decision = decide_blend(alpha(0, 1, 0, 1, 0), &BlendContext { abe: false, ..ctx() }, &DeviceCaps::all());
        assert_eq!(decision.strategy, BlendStrategy::None);
        assert!(decision.hw.is_none());
    }

    #[test]
    fn test_equal_terms_cancel() {
        // A == B == Cs, D == Cs: out = Cs regardless of C
        let decision = decide_blend(alpha(0, 0, 0, 0, 0), &ctx(), &DeviceCaps::all());
        assert_eq!(decision.strategy, BlendStrategy::None);

        // A == B, D == Cd: destination preserved
        let decision = decide_blend(alpha(1, 1, 0, 1, 0), &ctx(), &DeviceCaps::all());
        assert_eq!(decision.strategy, BlendStrategy::Native);
        let hw = decision.hw.unwrap();
        assert_eq!(hw.src, HwFactor::Zero);
        assert_eq!(hw.dst, HwFactor::One);
    }

    #[test]
    fn test_classic_alpha_blend_is_native() {
        // (Cs - Cd) * As + Cd with As <= 1.0
        let decision = decide_blend(alpha(0, 1, 0, 1, 0), &ctx(), &DeviceCaps::all());
        assert_eq!(decision.strategy, BlendStrategy::Native);
        let hw = decision.hw.unwrap();
        assert_eq!(hw.op, BlendOp::Add);
        assert_eq!(hw.src, HwFactor::SrcAlpha);
        assert_eq!(hw.dst, HwFactor::InvSrcAlpha);
        assert_eq!(decision.barrier, BarrierReq::None);
    }

    #[test]
    fn test_additive_with_high_alpha_is_accumulation() {
        // Cs*As + Cd with alpha up to 0xFF
        let decision = decide_blend(
            alpha(0, 2, 0, 1, 0),
            &BlendContext {
                alpha_range: (0, 0xFF),
                ..ctx()
            },
            &DeviceCaps::all(),
        );
        assert_eq!(decision.strategy, BlendStrategy::Accumulation);
        assert!(decision.flags.contains(ShaderFlags::BLEND_ACCU));
        let hw = decision.hw.unwrap();
        assert_eq!((hw.src, hw.dst), (HwFactor::One, HwFactor::One));
    }

    #[test]
    fn test_interpolation_with_high_alpha_is_blend_mix() {
        // (Cs - Cd) * As + Cd, As above 1.0: equation fits, range does not
        let decision = decide_blend(
            alpha(0, 1, 0, 1, 0),
            &BlendContext {
                alpha_range: (0, 0xFF),
                ..ctx()
            },
            &DeviceCaps::all(),
        );
        assert_eq!(decision.strategy, BlendStrategy::BlendMix);
        assert!(decision.flags.contains(ShaderFlags::BLEND_MIX));
    }

    #[test]
    fn test_constant_alpha_avoids_blend_mix() {
        // The trace proves As == 0x40; the factor folds to a constant
        let decision = decide_blend(
            alpha(0, 1, 0, 1, 0),
            &BlendContext {
                alpha_range: (0x40, 0x40),
                ..ctx()
            },
            &DeviceCaps::all(),
        );
        assert_eq!(decision.strategy, BlendStrategy::Native);
        let hw = decision.hw.unwrap();
        assert_eq!(hw.src, HwFactor::Constant);
        assert_eq!(hw.constant, 0x40);
    }

    #[test]
    fn test_unmappable_equation_goes_software() {
        // (Cs - Cd) * C + Cs = Cs*(1+C) - Cd*C: factor above one on the
        // source term, no fixed-function form
        let decision = decide_blend(alpha(0, 1, 2, 0, 0x80), &ctx(), &DeviceCaps::all());
        assert_eq!(decision.strategy, BlendStrategy::Software);
        assert!(decision.flags.contains(ShaderFlags::SW_BLEND));
    }

    #[test]
    fn test_software_barrier_scales_with_batch() {
        let caps = DeviceCaps {
            framebuffer_fetch: false,
            ..DeviceCaps::all()
        };
        // Small overlapping batch: a barrier per primitive
        let decision = decide_blend(alpha(0, 1, 2, 0, 0x80), &ctx(), &caps);
        assert_eq!(decision.barrier, BarrierReq::PerPrimitive);

        // Past the limit the cost outweighs accuracy
        let decision = decide_blend(
            alpha(0, 1, 2, 0, 0x80),
            &BlendContext {
                prim_count: 500,
                ..ctx()
            },
            &caps,
        );
        assert_eq!(decision.barrier, BarrierReq::Once);

        // Non-overlapping batches never need more than one
        let decision = decide_blend(
            alpha(0, 1, 2, 0, 0x80),
            &BlendContext {
                may_overlap: false,
                ..ctx()
            },
            &caps,
        );
        assert_eq!(decision.barrier, BarrierReq::Once);
    }

    #[test]
    fn test_framebuffer_fetch_needs_no_barrier() {
        let decision = decide_blend(alpha(0, 1, 2, 0, 0x80), &ctx(), &DeviceCaps::all());
        assert_eq!(decision.barrier, BarrierReq::None);
    }

    #[test]
    fn test_colclamp_off_triggers_color_clip() {
        let decision = decide_blend(
            alpha(0, 2, 2, 1, 0x80), // Cs*FIX + Cd
            &BlendContext {
                colclamp: false,
                ..ctx()
            },
            &DeviceCaps::all(),
        );
        assert_eq!(decision.strategy, BlendStrategy::ColorClip);
        assert!(decision.flags.contains(ShaderFlags::COLCLIP));
    }

    #[test]
    fn test_pabe_forces_software() {
        let decision = decide_blend(
            alpha(0, 1, 0, 1, 0),
            &BlendContext { pabe: true, ..ctx() },
            &DeviceCaps::all(),
        );
        assert_eq!(decision.strategy, BlendStrategy::Software);
        assert!(decision.flags.contains(ShaderFlags::PABE));
    }

    #[test]
    fn test_dest_alpha_on_24bit_target_folds_to_one() {
        // C = Ad but the target has no alpha: factor is exactly 1.0, so
        // Cs*1 + Cd*0 stays native even though Ad is normally unbounded
        let decision = decide_blend(
            alpha(0, 1, 1, 1, 0),
            &BlendContext {
                fb_has_alpha: false,
                ..ctx()
            },
            &DeviceCaps::all(),
        );
        assert_eq!(decision.strategy, BlendStrategy::Native);
        let hw = decision.hw.unwrap();
        assert_eq!(hw.src, HwFactor::Constant);
        assert_eq!(hw.constant, 0x80);
    }

    #[test]
    fn test_subtractive_equation_is_native() {
        // (0 - Cd) * FIX + Cs = Cs - Cd*FIX
        let decision = decide_blend(alpha(2, 1, 2, 0, 0x40), &ctx(), &DeviceCaps::all());
        assert_eq!(decision.strategy, BlendStrategy::Native);
        let hw = decision.hw.unwrap();
        assert_eq!(hw.op, BlendOp::Subtract);
        assert_eq!(hw.src, HwFactor::One);
        assert_eq!(hw.dst, HwFactor::Constant);
        assert_eq!(hw.constant, 0x40);
    }
}
