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

//! Lazily built render pipelines keyed by their complete pass state.
//!
//! Full-screen stages toggle depth writes, color masks and blend modes freely.
//! On an explicit API each combination is a distinct immutable pipeline, so
//! the lane describes the state it needs as a [`PipelineKey`] and this cache
//! builds the pipeline the first time a key is seen.

use std::collections::HashMap;

use apex_core::renderer::{
    BindGroupLayoutId, BindingKind, BlendMode, ColorWrites, DepthStencilStateDescriptor,
    GraphicsDevice, PipelineLayoutId, RenderPipelineId, ResourceError, SampleCount,
    ShaderModuleId, TextureFormat,
};

/// Everything that distinguishes one postprocess pipeline from another.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    /// The effect's shader module.
    pub shader: ShaderModuleId,
    /// The effect's fragment entry point.
    pub fragment_entry: String,
    /// The blend mode of the color target.
    pub blend: BlendMode,
    /// Format and write mask of the color target, if the pass has one.
    pub color: Option<(TextureFormat, ColorWrites)>,
    /// Depth-stencil state, if the pass has a depth attachment.
    pub depth: Option<DepthStencilStateDescriptor>,
    /// Sample count of the attachments.
    pub sample_count: SampleCount,
    /// Slot shapes of group 1, in binding order.
    pub slots: Vec<BindingKind>,
}

/// The GPU objects owned by one cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedPipeline {
    /// The render pipeline.
    pub pipeline: RenderPipelineId,
    /// Its pipeline layout.
    pub layout: PipelineLayoutId,
    /// The group 1 layout source bind groups are created against.
    pub source_layout: BindGroupLayoutId,
}

/// Maps pass state to the pipeline built for it.
#[derive(Debug, Default)]
pub struct PipelineCache {
    entries: HashMap<PipelineKey, CachedPipeline>,
}

impl PipelineCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the pipeline for `key`, calling `builder` on a miss.
    ///
    /// A failed build leaves the cache unchanged.
    pub fn get_or_create<F>(
        &mut self,
        device: &dyn GraphicsDevice,
        key: &PipelineKey,
        builder: F,
    ) -> Result<CachedPipeline, ResourceError>
    where
        F: FnOnce(&dyn GraphicsDevice, &PipelineKey) -> Result<CachedPipeline, ResourceError>,
    {
        if let Some(cached) = self.entries.get(key) {
            return Ok(*cached);
        }
        let created = builder(device, key)?;
        log::debug!(
            "PipelineCache: built pipeline {:?} ({} cached) for {key:?}",
            created.pipeline,
            self.entries.len() + 1
        );
        self.entries.insert(key.clone(), created);
        Ok(created)
    }

    /// Returns the cached pipeline for `key` without building one.
    pub fn get(&self, key: &PipelineKey) -> Option<CachedPipeline> {
        self.entries.get(key).copied()
    }

    /// Number of cached pipelines.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Destroys every cached pipeline and its layouts.
    pub fn clear(&mut self, device: &dyn GraphicsDevice) {
        for (_, cached) in self.entries.drain() {
            if let Err(e) = device.destroy_render_pipeline(cached.pipeline) {
                log::warn!("PipelineCache: Failed to destroy pipeline: {:?}", e);
            }
            if let Err(e) = device.destroy_pipeline_layout(cached.layout) {
                log::warn!("PipelineCache: Failed to destroy pipeline layout: {:?}", e);
            }
            if let Err(e) = device.destroy_bind_group_layout(cached.source_layout) {
                log::warn!("PipelineCache: Failed to destroy source layout: {:?}", e);
            }
        }
    }
}
