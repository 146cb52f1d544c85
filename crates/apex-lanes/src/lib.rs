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

//! Hot-path execution lanes for the Apex renderer.
//!
//! A lane records GPU commands for one strategy through the backend-agnostic
//! traits of `apex-core`. This crate holds the postprocess lane, the frustum
//! math it feeds to its shaders, the pipeline cache and the data-driven
//! postprocess chain built on top of it.

#![warn(missing_docs)]

pub mod render_lane;

pub use render_lane::*;
