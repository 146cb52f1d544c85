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

//! The contract between sampled textures and the passes that read them.

use crate::renderer::api::command::{BindingType, SamplerBindingType, TextureSampleType};
use crate::renderer::api::texture::{SamplerId, TextureViewDimension, TextureViewId};
use crate::renderer::error::ResourceError;
use std::fmt::Debug;

/// How a texture is read in the shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SampleKind {
    /// Filterable float color data.
    #[default]
    Float,
    /// Raw depth values read through a non-filtering sampler.
    Depth,
    /// Depth compared against a reference through a comparison sampler.
    DepthComparison,
}

/// The shape of a texture slot as declared by a bind group layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingKind {
    /// How the texture is sampled.
    pub sample: SampleKind,
    /// 2D or cube.
    pub dimension: TextureViewDimension,
}

impl BindingKind {
    /// A filterable 2D color texture, the kind used when a slot declares nothing else.
    pub const FLOAT_2D: Self = Self {
        sample: SampleKind::Float,
        dimension: TextureViewDimension::D2,
    };
    /// A 2D depth texture read without comparison.
    pub const DEPTH_2D: Self = Self {
        sample: SampleKind::Depth,
        dimension: TextureViewDimension::D2,
    };
    /// A filterable color cubemap.
    pub const FLOAT_CUBE: Self = Self {
        sample: SampleKind::Float,
        dimension: TextureViewDimension::Cube,
    };

    /// The layout entry type for the texture half of the slot.
    pub fn texture_binding_type(&self) -> BindingType {
        let sample_type = match self.sample {
            SampleKind::Float => TextureSampleType::Float { filterable: true },
            SampleKind::Depth | SampleKind::DepthComparison => TextureSampleType::Depth,
        };
        BindingType::Texture {
            sample_type,
            view_dimension: self.dimension,
            multisampled: false,
        }
    }

    /// The layout entry type for the sampler half of the slot.
    pub fn sampler_binding_type(&self) -> BindingType {
        BindingType::Sampler(match self.sample {
            SampleKind::Float => SamplerBindingType::Filtering,
            SampleKind::Depth => SamplerBindingType::NonFiltering,
            SampleKind::DepthComparison => SamplerBindingType::Comparison,
        })
    }
}

impl Default for BindingKind {
    fn default() -> Self {
        Self::FLOAT_2D
    }
}

/// What a pass binds for one texture unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureBinding {
    /// The view the shader samples.
    pub view: TextureViewId,
    /// The sampler paired with the view.
    pub sampler: SamplerId,
    /// The slot shape this binding satisfies.
    pub kind: BindingKind,
}

/// A texture a full-screen pass can sample from.
///
/// `activate` and `deactivate` bracket a pass. Implementations track the bound
/// state so a texture cannot be re-created while it is being read.
pub trait TextureSource: Send + Sync + Debug {
    /// Marks the texture as bound and returns what to put in the bind group.
    ///
    /// # Errors
    ///
    /// Fails when the texture has no GPU storage.
    fn activate(&self) -> Result<TextureBinding, ResourceError>;

    /// Clears the bound state set by [`TextureSource::activate`].
    fn deactivate(&self);

    /// Returns `true` if the texture is addressed in pixels rather than `[0, 1]`.
    fn is_rect(&self) -> bool;

    /// Width in pixels.
    fn width(&self) -> u32;

    /// Height in pixels.
    fn height(&self) -> u32;

    /// The slot shape this texture binds as.
    fn binding_kind(&self) -> BindingKind;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_kinds_pick_matching_sampler_types() {
        let depth = BindingKind::DEPTH_2D;
        assert_eq!(
            depth.sampler_binding_type(),
            BindingType::Sampler(SamplerBindingType::NonFiltering)
        );
        let cmp = BindingKind {
            sample: SampleKind::DepthComparison,
            dimension: TextureViewDimension::D2,
        };
        assert_eq!(
            cmp.sampler_binding_type(),
            BindingType::Sampler(SamplerBindingType::Comparison)
        );
        assert!(matches!(
            cmp.texture_binding_type(),
            BindingType::Texture {
                sample_type: TextureSampleType::Depth,
                ..
            }
        ));
    }

    #[test]
    fn default_kind_is_float_2d() {
        assert_eq!(BindingKind::default(), BindingKind::FLOAT_2D);
    }
}
