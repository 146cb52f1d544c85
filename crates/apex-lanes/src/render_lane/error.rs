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

use apex_core::renderer::{PipelineError, ResourceError};
use thiserror::Error;

/// Errors raised while building or running postprocess stages.
#[derive(Error, Debug)]
pub enum PostprocessError {
    /// `render` was called before an effect shader was set.
    #[error("No effect shader set on this postprocess stage")]
    ShaderNotSet,

    /// `render` was called before `on_gpu_init` or after `on_gpu_shutdown`.
    #[error("Postprocess GPU resources are not initialized")]
    NotInitialized,

    /// The pass state cannot be turned into a pipeline.
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// A device call failed.
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    /// Neither a color nor a depth attachment was given.
    #[error("Postprocess stage has neither a color nor a depth target")]
    MissingTarget,

    /// The color and depth attachments cannot be used in the same pass.
    #[error("Incompatible attachments: {0}")]
    AttachmentMismatch(String),

    /// A chain definition is malformed or references unknown names.
    #[error("Invalid postprocess definition: {0}")]
    Definition(String),
}
