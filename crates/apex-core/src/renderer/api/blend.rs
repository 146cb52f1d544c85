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

//! Blend and depth modes used to configure full-screen passes.

use super::pipeline::{
    BlendComponentDescriptor, BlendFactor, BlendOperation, BlendStateDescriptor, CompareFunction,
};
use crate::renderer::error::PipelineError;
use serde::{Deserialize, Serialize};

/// How a pass combines its output with what is already in the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BlendMode {
    /// Output replaces the target.
    #[default]
    Disabled,
    /// `src + dst`.
    Add,
    /// `src * src.a + dst * (1 - src.a)`.
    AlphaBlend,
    /// `src + dst * (1 - src.a)`, for colors already multiplied by alpha.
    PremultipliedAlpha,
    /// Discard by alpha threshold. Not available for full-screen passes.
    AlphaTest,
}

impl BlendMode {
    /// Returns the blend state for this mode. `None` means blending is off.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::UnsupportedBlendMode`] for [`BlendMode::AlphaTest`].
    pub fn to_blend_state(self) -> Result<Option<BlendStateDescriptor>, PipelineError> {
        let (src, dst) = match self {
            BlendMode::Disabled => return Ok(None),
            BlendMode::Add => (BlendFactor::One, BlendFactor::One),
            BlendMode::AlphaBlend => (BlendFactor::SrcAlpha, BlendFactor::OneMinusSrcAlpha),
            BlendMode::PremultipliedAlpha => (BlendFactor::One, BlendFactor::OneMinusSrcAlpha),
            BlendMode::AlphaTest => return Err(PipelineError::UnsupportedBlendMode(self)),
        };
        let component = BlendComponentDescriptor {
            src_factor: src,
            dst_factor: dst,
            operation: BlendOperation::Add,
        };
        Ok(Some(BlendStateDescriptor {
            color: component,
            alpha: component,
        }))
    }
}

/// The depth comparison a pass tests its fragments with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DepthMode {
    /// Never passes.
    Never,
    /// Passes if the fragment is closer.
    Less,
    /// Passes if the depths are equal.
    Equal,
    /// Passes if the fragment is closer or equal.
    #[default]
    LessEqual,
    /// Passes if the fragment is farther.
    Greater,
    /// Passes if the depths differ.
    NotEqual,
    /// Passes if the fragment is farther or equal.
    GreaterEqual,
    /// Always passes. With depth writes off this disables the depth test.
    Always,
}

impl From<DepthMode> for CompareFunction {
    fn from(mode: DepthMode) -> Self {
        match mode {
            DepthMode::Never => CompareFunction::Never,
            DepthMode::Less => CompareFunction::Less,
            DepthMode::Equal => CompareFunction::Equal,
            DepthMode::LessEqual => CompareFunction::LessEqual,
            DepthMode::Greater => CompareFunction::Greater,
            DepthMode::NotEqual => CompareFunction::NotEqual,
            DepthMode::GreaterEqual => CompareFunction::GreaterEqual,
            DepthMode::Always => CompareFunction::Always,
        }
    }
}
