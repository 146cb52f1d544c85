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

//! Concrete backends for the Apex rendering contracts.
//!
//! `apex-core` defines what a graphics device is; this crate provides the one
//! that exists, built on `wgpu`. Nothing outside this crate names a `wgpu` type.

pub mod graphics;

pub use graphics::wgpu::{WgpuDevice, WgpuGraphicsContext};
