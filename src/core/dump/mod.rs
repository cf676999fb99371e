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

//! Debug draw dumps
//!
//! Write-only diagnostics keyed by a monotonically increasing draw index:
//! a JSON register-context snapshot and vertex list per draw, plus raw
//! texture bytes when enabled. Nothing here is ever read back by the
//! core; a failed write logs and disables nothing.

use std::fs;
use std::path::PathBuf;

use serde_json::json;

use crate::core::config::DumpConfig;
use crate::core::device::DrawConfig;
use crate::core::error::{GsError, Result};
use crate::core::gs::context::RegisterContext;
use crate::core::vmem::format::PixelRect;

/// Writes per-draw dump files under the configured directory
#[derive(Debug)]
pub struct DrawDumper {
    config: DumpConfig,
    directory: PathBuf,
    draw_index: u64,
}

impl DrawDumper {
    /// Create the dump directory and an idle dumper
    pub fn new(config: DumpConfig) -> Result<Self> {
        let directory = PathBuf::from(&config.directory);
        fs::create_dir_all(&directory)
            .map_err(|e| GsError::Dump(format!("{}: {e}", directory.display())))?;
        log::info!("Draw dumps -> {}", directory.display());
        Ok(Self {
            config,
            directory,
            draw_index: 0,
        })
    }

    /// Draws dumped so far
    pub fn draw_index(&self) -> u64 {
        self.draw_index
    }

    fn within_limit(&self) -> bool {
        self.config.draw_limit == 0 || (self.draw_index as usize) < self.config.draw_limit
    }

    /// Dump one draw's register context and vertex list
    pub fn dump_draw(&mut self, ctx: &RegisterContext, config: &DrawConfig) {
        if !self.within_limit() {
            return;
        }
        let index = self.draw_index;
        self.draw_index += 1;

        let regs = json!({
            "draw": index,
            "prim": format!("{:#x}", ctx.prim),
            "prmode": format!("{:#x}", ctx.prmode),
            "prmodecont": ctx.prmodecont & 1,
            "texa": format!("{:#x}", ctx.texa),
            "fogcol": format!("{:#x}", ctx.fogcol),
            "dthe": ctx.dthe & 1,
            "colclamp": ctx.colclamp & 1,
            "pabe": ctx.pabe & 1,
            "env": ([0usize, 1].map(|i| json!({
                "tex0": format!("{:#x}", ctx.env[i].tex0),
                "tex1": format!("{:#x}", ctx.env[i].tex1),
                "clamp": format!("{:#x}", ctx.env[i].clamp),
                "xyoffset": format!("{:#x}", ctx.env[i].xyoffset),
                "scissor": format!("{:#x}", ctx.env[i].scissor),
                "alpha": format!("{:#x}", ctx.env[i].alpha),
                "test": format!("{:#x}", ctx.env[i].test),
                "frame": format!("{:#x}", ctx.env[i].frame),
                "zbuf": format!("{:#x}", ctx.env[i].zbuf),
            }))),
            "topology": format!("{:?}", config.topology),
            "flags": format!("{:?}", config.flags),
            "barrier": format!("{:?}", config.barrier),
            "date": format!("{:?}", config.date),
            "blend": config.blend.map(|b| format!("{b:?}")),
        });
        self.write_json(&format!("draw_{index:06}_regs.json"), &regs);

        let vertices: Vec<_> = config
            .indices
            .iter()
            .map(|&i| {
                let v = &config.vertices[i as usize];
                json!({
                    "x": v.x_px(),
                    "y": v.y_px(),
                    "z": v.z,
                    "rgba": v.rgba,
                    "uv": [v.u as f32 / 16.0, v.v as f32 / 16.0],
                    "stq": [v.st[0], v.st[1], v.q],
                    "fog": v.fog,
                })
            })
            .collect();
        self.write_json(
            &format!("draw_{index:06}_vertices.json"),
            &json!({ "draw": index, "vertices": vertices }),
        );
    }

    /// Dump raw texture bytes for the draw last dumped
    pub fn dump_texture(&mut self, rect: PixelRect, data: &[u8]) {
        if !self.config.textures || self.draw_index == 0 || !self.within_limit() {
            return;
        }
        let index = self.draw_index - 1;
        let name = format!(
            "draw_{index:06}_tex_{}x{}.bin",
            rect.width(),
            rect.height()
        );
        if let Err(e) = fs::write(self.directory.join(&name), data) {
            log::warn!("Texture dump {name} failed: {e}");
        }
    }

    fn write_json(&self, name: &str, value: &serde_json::Value) {
        let path = self.directory.join(name);
        match serde_json::to_string_pretty(value) {
            Ok(text) => {
                if let Err(e) = fs::write(&path, text) {
                    log::warn!("Dump write {} failed: {e}", path.display());
                }
            }
            Err(e) => log::warn!("Dump encode {name} failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::device::{
        BarrierReq, DateMode, DepthState, ShaderFlags, Topology,
    };
    use crate::core::gs::registers::{AlphaTest, DepthTest};
    use crate::core::gs::vertex::GsVertex;
    use bytemuck::Zeroable;

    fn config_for(dir: &std::path::Path) -> DumpConfig {
        DumpConfig {
            enabled: true,
            directory: dir.to_string_lossy().into_owned(),
            draw_limit: 2,
            textures: true,
        }
    }

    fn draw_config() -> DrawConfig {
        DrawConfig {
            topology: Topology::Triangles,
            vertices: vec![GsVertex::zeroed(); 3],
            indices: vec![0, 1, 2],
            target: None,
            depth_target: None,
            texture: None,
            flags: ShaderFlags::GOURAUD,
            channel: None,
            atst: AlphaTest::Always,
            aref: 0,
            blend: None,
            color_mask: 0xF,
            fbmsk: 0,
            depth: DepthState {
                test: DepthTest::Always,
                write: false,
            },
            date: DateMode::Off,
            datm: false,
            scissor: PixelRect::from_size(0, 0, 64, 64),
            barrier: BarrierReq::None,
            dither: None,
            fog_color: [0; 3],
        }
    }

    #[test]
    fn test_dump_draw_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut dumper = DrawDumper::new(config_for(dir.path())).unwrap();
        let ctx = RegisterContext::default();

        dumper.dump_draw(&ctx, &draw_config());
        dumper.dump_texture(PixelRect::from_size(0, 0, 4, 4), &[0u8; 64]);

        assert!(dir.path().join("draw_000000_regs.json").exists());
        assert!(dir.path().join("draw_000000_vertices.json").exists());
        assert!(dir.path().join("draw_000000_tex_4x4.bin").exists());

        // The regs dump is valid JSON carrying the draw index
        let text = std::fs::read_to_string(dir.path().join("draw_000000_regs.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["draw"], 0);
    }

    #[test]
    fn test_draw_limit_stops_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut dumper = DrawDumper::new(config_for(dir.path())).unwrap();
        let ctx = RegisterContext::default();
        for _ in 0..5 {
            dumper.dump_draw(&ctx, &draw_config());
        }
        assert!(dir.path().join("draw_000001_regs.json").exists());
        assert!(!dir.path().join("draw_000002_regs.json").exists());
        assert_eq!(dumper.draw_index(), 2);
    }

    #[test]
    fn test_unwritable_directory_is_an_error() {
        let err = DrawDumper::new(DumpConfig {
            enabled: true,
            directory: "/proc/no-such-place/dumps".into(),
            draw_limit: 0,
            textures: false,
        })
        .unwrap_err();
        assert!(matches!(err, GsError::Dump(_)));
    }
}
