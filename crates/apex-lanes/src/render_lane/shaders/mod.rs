// Copyright 2025 eraflo
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

//! Built-in postprocess effects.
//!
//! Every effect shares one contract with [`PostprocessLane`](crate::PostprocessLane):
//!
//! - `@group(0) @binding(0)`: the `PostprocessUniforms` block.
//! - `@group(1)`: one texture/sampler pair per input slot, the texture at
//!   binding `2 * slot` and the sampler at `2 * slot + 1`.
//! - Vertex locations 0..3: position, uv, eye-space corner, world-space corner.
//! - Entry points `vs_main` and `fs_main`.

use apex_core::renderer::BindingKind;
use serde::{Deserialize, Serialize};

/// Copies source 0 and applies contrast.
pub const PASSTHROUGH_WGSL: &str = include_str!("passthrough.wgsl");

/// Exponential fog over source 0 using the depth in source 1.
///
/// The eye-space position of each pixel is rebuilt from the interpolated
/// frustum ray and a linearized depth sample.
pub const DEPTH_FOG_WGSL: &str = include_str!("depth_fog.wgsl");

/// View-ray sky gradient with a sun disc. Takes no inputs.
pub const SKY_WGSL: &str = include_str!("sky.wgsl");

/// Vertex entry point shared by the built-in effects.
pub const VERTEX_ENTRY: &str = "vs_main";
/// Fragment entry point shared by the built-in effects.
pub const FRAGMENT_ENTRY: &str = "fs_main";

/// The built-in effects a chain stage can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EffectKind {
    /// See [`PASSTHROUGH_WGSL`].
    Passthrough,
    /// See [`DEPTH_FOG_WGSL`].
    DepthFog,
    /// See [`SKY_WGSL`].
    Sky,
}

impl EffectKind {
    /// The WGSL source of the effect.
    pub fn source(&self) -> &'static str {
        match self {
            EffectKind::Passthrough => PASSTHROUGH_WGSL,
            EffectKind::DepthFog => DEPTH_FOG_WGSL,
            EffectKind::Sky => SKY_WGSL,
        }
    }

    /// A debug label for the shader module.
    pub fn label(&self) -> &'static str {
        match self {
            EffectKind::Passthrough => "postprocess_passthrough",
            EffectKind::DepthFog => "postprocess_depth_fog",
            EffectKind::Sky => "postprocess_sky",
        }
    }

    /// The slot shapes the shader declares in group 1, in binding order.
    pub fn input_slots(&self) -> &'static [BindingKind] {
        match self {
            EffectKind::Passthrough => &[BindingKind::FLOAT_2D],
            EffectKind::DepthFog => &[BindingKind::FLOAT_2D, BindingKind::DEPTH_2D],
            EffectKind::Sky => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [EffectKind; 3] = [EffectKind::Passthrough, EffectKind::DepthFog, EffectKind::Sky];

    #[test]
    fn test_effect_shaders_valid() {
        for effect in ALL {
            let source = effect.source();
            assert!(source.contains("@vertex"), "{effect:?}");
            assert!(source.contains("@fragment"), "{effect:?}");
            assert!(source.contains(&format!("fn {VERTEX_ENTRY}")), "{effect:?}");
            assert!(source.contains(&format!("fn {FRAGMENT_ENTRY}")), "{effect:?}");
        }
    }

    #[test]
    fn test_every_effect_reads_the_shared_uniforms() {
        for effect in ALL {
            assert!(
                effect.source().contains("@group(0) @binding(0) var<uniform>"),
                "{effect:?}"
            );
        }
    }

    #[test]
    fn test_declared_slots_match_bindings() {
        for effect in ALL {
            let source = effect.source();
            for slot in 0..effect.input_slots().len() {
                let texture = format!("@group(1) @binding({})", 2 * slot);
                let sampler = format!("@group(1) @binding({})", 2 * slot + 1);
                assert!(source.contains(&texture), "{effect:?} slot {slot}");
                assert!(source.contains(&sampler), "{effect:?} slot {slot}");
            }
            let past_end = format!("@group(1) @binding({})", 2 * effect.input_slots().len());
            assert!(!source.contains(&past_end), "{effect:?}");
        }
    }

    #[test]
    fn test_depth_fog_reads_a_depth_texture() {
        assert_eq!(EffectKind::DepthFog.input_slots()[1], BindingKind::DEPTH_2D);
        assert!(DEPTH_FOG_WGSL.contains("texture_depth_2d"));
    }
}
