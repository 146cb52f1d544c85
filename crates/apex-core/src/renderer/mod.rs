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

//! Provides the public, backend-agnostic rendering contracts for Apex.
//!
//! This module defines the 'what' of rendering: the [`GraphicsDevice`] and
//! [`CommandEncoder`] traits, descriptor types, error types, and the
//! [`FramebufferTexture`] lifecycle built on top of them. The 'how' lives in a
//! concrete backend in `apex-infra`, and `apex-lanes` drives the traits without
//! knowing which backend sits behind them.

pub mod api;
pub mod error;
pub mod framebuffer;
pub mod traits;

pub use self::api::*;
pub use self::error::{
    FramebufferError, PipelineError, RenderError, ResourceError, ShaderError,
};
pub use self::framebuffer::{
    FramebufferAttachment, FramebufferFormat, FramebufferTexture, FramebufferTextureDescriptor,
    TextureTarget,
};
pub use self::traits::{
    BindingKind, CommandEncoder, GraphicsDevice, RenderPass, SampleKind, TextureBinding,
    TextureSource,
};
