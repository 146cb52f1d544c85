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

//! Global settings for the postprocess renderer.

use crate::math::LinearRgba;
use serde::{Deserialize, Serialize};

/// Settings that affect every postprocess chain.
///
/// Missing fields fall back to their defaults when deserialized, so a settings
/// file only needs to list what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    /// If `false`, the chain is not run and the scene is presented as-is.
    pub postprocess_enabled: bool,
    /// Contrast applied by stages that do not set their own.
    pub default_contrast: f32,
    /// Far clip distance, which is also the length of the frustum corner rays.
    pub lod_far: f32,
    /// Vertical field of view, in degrees.
    pub fov_degrees: f32,
    /// Requested MSAA sample count for off-screen targets.
    pub multisample: u32,
    /// The color the screen is cleared to before the first stage.
    pub clear_color: LinearRgba,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            postprocess_enabled: true,
            default_contrast: 1.0,
            lod_far: 1000.0,
            fov_degrees: 45.0,
            multisample: 1,
            clear_color: LinearRgba::BLACK,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_settings_keep_defaults() {
        let settings: RenderSettings = ron::from_str("(lod_far: 250.0, multisample: 4)").unwrap();
        assert_eq!(settings.lod_far, 250.0);
        assert_eq!(settings.multisample, 4);
        assert!(settings.postprocess_enabled);
        assert_eq!(settings.fov_degrees, 45.0);
        assert_eq!(settings.clear_color, LinearRgba::BLACK);
    }
}
