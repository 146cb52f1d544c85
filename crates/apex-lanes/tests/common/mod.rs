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

//! A recording `GraphicsDevice` for lane tests.
//!
//! Every resource gets a fresh id. Creations and destructions are counted per
//! kind so tests can check that nothing leaks, and every render pass is kept
//! with its load operations and recorded commands.

#![allow(dead_code)]

use apex_core::math::dimension::{Extent3D, Origin3D};
use apex_core::math::LinearRgba;
use apex_core::renderer::traits::{FEATURE_MULTISAMPLE_X4, FEATURE_TEXTURE_RECTANGLE};
use apex_core::renderer::*;
use std::any::Any;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// A command recorded inside a render pass.
#[derive(Debug, Clone, PartialEq)]
pub enum PassCommand {
    SetPipeline(RenderPipelineId),
    SetBindGroup(u32, BindGroupId),
    SetVertexBuffer(u32, BufferId),
    SetIndexBuffer(BufferId, IndexFormat),
    Draw(Range<u32>, Range<u32>),
    DrawIndexed(Range<u32>, i32, Range<u32>),
}

#[derive(Debug, Clone)]
pub struct RecordedPass {
    pub label: Option<String>,
    pub color: Vec<(TextureViewId, Option<TextureViewId>, LoadOp<LinearRgba>)>,
    pub depth: Option<(TextureViewId, Option<LoadOp<f32>>)>,
    pub commands: Vec<PassCommand>,
}

impl RecordedPass {
    pub fn color_load(&self) -> Option<LoadOp<LinearRgba>> {
        self.color.first().map(|(_, _, load)| *load)
    }

    pub fn depth_load(&self) -> Option<LoadOp<f32>> {
        self.depth.and_then(|(_, load)| load)
    }

    pub fn draws(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, PassCommand::Draw(..) | PassCommand::DrawIndexed(..)))
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct RecordedPipeline {
    pub id: RenderPipelineId,
    pub label: Option<String>,
    pub fragment_entry: Option<String>,
    pub color_targets: Vec<ColorTargetStateDescriptor>,
    pub depth_stencil: Option<DepthStencilStateDescriptor>,
    pub sample_count: SampleCount,
}

#[derive(Debug, Clone)]
pub struct RecordedTexture {
    pub id: TextureId,
    pub label: Option<String>,
    pub size: Extent3D,
    pub mip_level_count: u32,
    pub sample_count: SampleCount,
    pub format: TextureFormat,
}

#[derive(Debug, Clone)]
pub struct RecordedSampler {
    pub id: SamplerId,
    pub mag_filter: FilterMode,
    pub compare: Option<CompareFunction>,
}

#[derive(Debug, Clone)]
pub struct RecordedBindGroup {
    pub id: BindGroupId,
    pub layout: BindGroupLayoutId,
    pub entries: Vec<BindGroupEntry>,
}

#[derive(Debug, Clone, Copy)]
pub struct TextureWrite {
    pub texture: TextureId,
    pub origin: Origin3D,
    pub bytes: usize,
}

#[derive(Debug, Default)]
pub struct MockState {
    pub calls: Vec<&'static str>,
    pub live: HashMap<&'static str, i64>,
    pub pipelines: Vec<RecordedPipeline>,
    pub textures: Vec<RecordedTexture>,
    pub samplers: Vec<RecordedSampler>,
    pub views: Vec<(TextureViewId, TextureId)>,
    pub bind_groups: Vec<RecordedBindGroup>,
    pub texture_writes: Vec<TextureWrite>,
    pub buffer_writes: Vec<(BufferId, Vec<u8>)>,
    pub passes: Vec<RecordedPass>,
    pub submitted: Vec<CommandBufferId>,
    pub fail_on: Option<(&'static str, usize)>,
}

/// Shared, cloneable mock device.
#[derive(Debug, Clone, Default)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
    next_id: Arc<AtomicUsize>,
    pub multisample: bool,
    pub texture_rectangle: bool,
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            texture_rectangle: true,
            ..Default::default()
        }
    }

    pub fn with_multisample(mut self) -> Self {
        self.multisample = true;
        self
    }

    pub fn without_rectangles(mut self) -> Self {
        self.texture_rectangle = false;
        self
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Makes the `skip`-th next call of `call` (0 = the very next one) fail.
    pub fn fail_on(&self, call: &'static str, skip: usize) {
        self.state().fail_on = Some((call, skip));
    }

    pub fn live(&self, kind: &'static str) -> i64 {
        self.state().live.get(kind).copied().unwrap_or(0)
    }

    /// Every live object count, for leak checks.
    pub fn live_total(&self) -> i64 {
        self.state().live.values().sum()
    }

    pub fn count(&self, call: &'static str) -> usize {
        self.state().calls.iter().filter(|c| **c == call).count()
    }

    pub fn passes(&self) -> Vec<RecordedPass> {
        self.state().passes.clone()
    }

    pub fn pass(&self, label: &str) -> Option<RecordedPass> {
        self.state()
            .passes
            .iter()
            .rev()
            .find(|p| p.label.as_deref() == Some(label))
            .cloned()
    }

    pub fn pipelines(&self) -> Vec<RecordedPipeline> {
        self.state().pipelines.clone()
    }

    pub fn last_pipeline(&self) -> RecordedPipeline {
        self.state().pipelines.last().cloned().expect("no pipeline was created")
    }

    pub fn bind_group(&self, id: BindGroupId) -> Option<RecordedBindGroup> {
        self.state().bind_groups.iter().find(|g| g.id == id).cloned()
    }

    pub fn texture_labelled(&self, label: &str) -> Option<RecordedTexture> {
        self.state()
            .textures
            .iter()
            .rev()
            .find(|t| t.label.as_deref() == Some(label))
            .cloned()
    }

    /// The first view created for `texture`, which is the sampled view of a framebuffer texture.
    pub fn first_view_of(&self, texture: TextureId) -> Option<TextureViewId> {
        self.state()
            .views
            .iter()
            .find(|(_, t)| *t == texture)
            .map(|(v, _)| *v)
    }

    fn id(&self) -> usize {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn record(&self, call: &'static str) -> Result<(), ResourceError> {
        let mut state = self.state();
        state.calls.push(call);
        if let Some((name, skip)) = state.fail_on {
            if name == call {
                if skip == 0 {
                    state.fail_on = None;
                    return Err(ResourceError::BackendError(format!("injected {call} failure")));
                }
                state.fail_on = Some((name, skip - 1));
            }
        }
        Ok(())
    }

    fn created(&self, kind: &'static str) {
        *self.state().live.entry(kind).or_insert(0) += 1;
    }

    fn destroyed(&self, kind: &'static str) {
        *self.state().live.entry(kind).or_insert(0) -= 1;
    }
}

pub struct MockEncoder {
    state: Arc<Mutex<MockState>>,
    id: u64,
}

pub struct MockPass {
    state: Arc<Mutex<MockState>>,
    index: usize,
}

impl MockPass {
    fn push(&mut self, command: PassCommand) {
        self.state.lock().unwrap().passes[self.index].commands.push(command);
    }
}

impl<'pass> RenderPass<'pass> for MockPass {
    fn set_pipeline(&mut self, pipeline: &'pass RenderPipelineId) {
        self.push(PassCommand::SetPipeline(*pipeline));
    }

    fn set_bind_group(&mut self, index: u32, bind_group: &'pass BindGroupId, _offsets: &[u32]) {
        self.push(PassCommand::SetBindGroup(index, *bind_group));
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: &'pass BufferId, _offset: u64) {
        self.push(PassCommand::SetVertexBuffer(slot, *buffer));
    }

    fn set_index_buffer(&mut self, buffer: &'pass BufferId, _offset: u64, index_format: IndexFormat) {
        self.push(PassCommand::SetIndexBuffer(*buffer, index_format));
    }

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        self.push(PassCommand::Draw(vertices, instances));
    }

    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>) {
        self.push(PassCommand::DrawIndexed(indices, base_vertex, instances));
    }
}

impl CommandEncoder for MockEncoder {
    fn begin_render_pass<'encoder>(
        &'encoder mut self,
        descriptor: &RenderPassDescriptor<'encoder>,
    ) -> Box<dyn RenderPass<'encoder> + 'encoder> {
        let pass = RecordedPass {
            label: descriptor.label.map(str::to_string),
            color: descriptor
                .color_attachments
                .iter()
                .map(|a| (*a.view, a.resolve_target.copied(), a.ops.load))
                .collect(),
            depth: descriptor
                .depth_stencil_attachment
                .as_ref()
                .map(|d| (*d.view, d.depth_ops.map(|ops| ops.load))),
            commands: Vec::new(),
        };
        let mut state = self.state.lock().unwrap();
        state.passes.push(pass);
        let index = state.passes.len() - 1;
        Box::new(MockPass {
            state: Arc::clone(&self.state),
            index,
        })
    }

    fn finish(self: Box<Self>) -> CommandBufferId {
        CommandBufferId(self.id)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Creates a resource: records the call, honours failure injection and counts it live.
macro_rules! create {
    ($self:ident, $call:literal, $kind:literal, $ctor:expr) => {{
        $self.record($call)?;
        $self.created($kind);
        Ok($ctor($self.id()))
    }};
}

macro_rules! destroy {
    ($self:ident, $call:literal, $kind:literal) => {{
        $self.record($call)?;
        $self.destroyed($kind);
        Ok(())
    }};
}

impl GraphicsDevice for MockDevice {
    fn create_shader_module(
        &self,
        _descriptor: &ShaderModuleDescriptor,
    ) -> Result<ShaderModuleId, ResourceError> {
        create!(self, "create_shader_module", "shader", ShaderModuleId)
    }

    fn destroy_shader_module(&self, _id: ShaderModuleId) -> Result<(), ResourceError> {
        destroy!(self, "destroy_shader_module", "shader")
    }

    fn create_render_pipeline(
        &self,
        descriptor: &RenderPipelineDescriptor,
    ) -> Result<RenderPipelineId, ResourceError> {
        self.record("create_render_pipeline")?;
        self.created("pipeline");
        let id = RenderPipelineId(self.id());
        self.state().pipelines.push(RecordedPipeline {
            id,
            label: descriptor.label.as_ref().map(|l| l.to_string()),
            fragment_entry: descriptor.fragment_entry_point.as_ref().map(|e| e.to_string()),
            color_targets: descriptor.color_target_states.to_vec(),
            depth_stencil: descriptor.depth_stencil_state,
            sample_count: descriptor.multisample_state.count,
        });
        Ok(id)
    }

    fn destroy_render_pipeline(&self, _id: RenderPipelineId) -> Result<(), ResourceError> {
        destroy!(self, "destroy_render_pipeline", "pipeline")
    }

    fn create_pipeline_layout(
        &self,
        _descriptor: &PipelineLayoutDescriptor,
    ) -> Result<PipelineLayoutId, ResourceError> {
        create!(self, "create_pipeline_layout", "pipeline_layout", PipelineLayoutId)
    }

    fn destroy_pipeline_layout(&self, _id: PipelineLayoutId) -> Result<(), ResourceError> {
        destroy!(self, "destroy_pipeline_layout", "pipeline_layout")
    }

    fn create_bind_group_layout(
        &self,
        _descriptor: &BindGroupLayoutDescriptor,
    ) -> Result<BindGroupLayoutId, ResourceError> {
        create!(self, "create_bind_group_layout", "bind_group_layout", BindGroupLayoutId)
    }

    fn destroy_bind_group_layout(&self, _id: BindGroupLayoutId) -> Result<(), ResourceError> {
        destroy!(self, "destroy_bind_group_layout", "bind_group_layout")
    }

    fn create_bind_group(
        &self,
        descriptor: &BindGroupDescriptor,
    ) -> Result<BindGroupId, ResourceError> {
        self.record("create_bind_group")?;
        self.created("bind_group");
        let id = BindGroupId(self.id());
        self.state().bind_groups.push(RecordedBindGroup {
            id,
            layout: descriptor.layout,
            entries: descriptor.entries.to_vec(),
        });
        Ok(id)
    }

    fn destroy_bind_group(&self, _id: BindGroupId) -> Result<(), ResourceError> {
        destroy!(self, "destroy_bind_group", "bind_group")
    }

    fn create_buffer(&self, _descriptor: &BufferDescriptor) -> Result<BufferId, ResourceError> {
        create!(self, "create_buffer", "buffer", BufferId)
    }

    fn create_buffer_with_data(
        &self,
        _descriptor: &BufferDescriptor,
        _data: &[u8],
    ) -> Result<BufferId, ResourceError> {
        create!(self, "create_buffer_with_data", "buffer", BufferId)
    }

    fn destroy_buffer(&self, _id: BufferId) -> Result<(), ResourceError> {
        destroy!(self, "destroy_buffer", "buffer")
    }

    fn write_buffer(&self, id: BufferId, _offset: u64, data: &[u8]) -> Result<(), ResourceError> {
        self.record("write_buffer")?;
        self.state().buffer_writes.push((id, data.to_vec()));
        Ok(())
    }

    fn create_texture(&self, descriptor: &TextureDescriptor) -> Result<TextureId, ResourceError> {
        self.record("create_texture")?;
        self.created("texture");
        let id = TextureId(self.id());
        self.state().textures.push(RecordedTexture {
            id,
            label: descriptor.label.as_ref().map(|l| l.to_string()),
            size: descriptor.size,
            mip_level_count: descriptor.mip_level_count,
            sample_count: descriptor.sample_count,
            format: descriptor.format,
        });
        Ok(id)
    }

    fn destroy_texture(&self, _id: TextureId) -> Result<(), ResourceError> {
        destroy!(self, "destroy_texture", "texture")
    }

    fn write_texture(
        &self,
        texture_id: TextureId,
        data: &[u8],
        _bytes_per_row: Option<u32>,
        offset: Origin3D,
        _size: Extent3D,
    ) -> Result<(), ResourceError> {
        self.record("write_texture")?;
        self.state().texture_writes.push(TextureWrite {
            texture: texture_id,
            origin: offset,
            bytes: data.len(),
        });
        Ok(())
    }

    fn create_texture_view(
        &self,
        texture_id: TextureId,
        _descriptor: &TextureViewDescriptor,
    ) -> Result<TextureViewId, ResourceError> {
        self.record("create_texture_view")?;
        self.created("texture_view");
        let id = TextureViewId(self.id());
        self.state().views.push((id, texture_id));
        Ok(id)
    }

    fn destroy_texture_view(&self, _id: TextureViewId) -> Result<(), ResourceError> {
        destroy!(self, "destroy_texture_view", "texture_view")
    }

    fn create_sampler(&self, descriptor: &SamplerDescriptor) -> Result<SamplerId, ResourceError> {
        self.record("create_sampler")?;
        self.created("sampler");
        let id = SamplerId(self.id());
        self.state().samplers.push(RecordedSampler {
            id,
            mag_filter: descriptor.mag_filter,
            compare: descriptor.compare,
        });
        Ok(id)
    }

    fn destroy_sampler(&self, _id: SamplerId) -> Result<(), ResourceError> {
        destroy!(self, "destroy_sampler", "sampler")
    }

    fn create_command_encoder(&self, _label: Option<&str>) -> Box<dyn CommandEncoder> {
        self.state().calls.push("create_command_encoder");
        Box::new(MockEncoder {
            state: Arc::clone(&self.state),
            id: self.id() as u64,
        })
    }

    fn submit_command_buffer(&self, command_buffer: CommandBufferId) {
        let mut state = self.state();
        state.calls.push("submit_command_buffer");
        state.submitted.push(command_buffer);
    }

    fn get_surface_format(&self) -> Option<TextureFormat> {
        None
    }

    fn get_adapter_info(&self) -> RendererAdapterInfo {
        RendererAdapterInfo {
            name: "Mock Adapter".to_string(),
            backend_type: GraphicsBackendType::Unknown,
            device_type: RendererDeviceType::Cpu,
        }
    }

    fn supports_feature(&self, feature_name: &str) -> bool {
        match feature_name {
            FEATURE_MULTISAMPLE_X4 => self.multisample,
            FEATURE_TEXTURE_RECTANGLE => self.texture_rectangle,
            _ => false,
        }
    }
}

/// A sampled texture whose availability the test controls.
#[derive(Debug)]
pub struct MockSource {
    pub binding: TextureBinding,
    pub available: bool,
    pub rect: Option<(u32, u32)>,
    pub activations: AtomicUsize,
    pub deactivations: AtomicUsize,
}

impl MockSource {
    pub fn new(view: usize, kind: BindingKind) -> Self {
        Self {
            binding: TextureBinding {
                view: TextureViewId(10_000 + view),
                sampler: SamplerId(20_000 + view),
                kind,
            },
            available: true,
            rect: None,
            activations: AtomicUsize::new(0),
            deactivations: AtomicUsize::new(0),
        }
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn rectangle(mut self, width: u32, height: u32) -> Self {
        self.rect = Some((width, height));
        self
    }

    pub fn activations(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }

    pub fn deactivations(&self) -> usize {
        self.deactivations.load(Ordering::SeqCst)
    }
}

impl TextureSource for MockSource {
    fn activate(&self) -> Result<TextureBinding, ResourceError> {
        if !self.available {
            return Err(ResourceError::Unavailable("mock source".to_string()));
        }
        self.activations.fetch_add(1, Ordering::SeqCst);
        Ok(self.binding)
    }

    fn deactivate(&self) {
        self.deactivations.fetch_add(1, Ordering::SeqCst);
    }

    fn is_rect(&self) -> bool {
        self.rect.is_some()
    }

    fn width(&self) -> u32 {
        self.rect.map_or(256, |(w, _)| w)
    }

    fn height(&self) -> u32 {
        self.rect.map_or(256, |(_, h)| h)
    }

    fn binding_kind(&self) -> BindingKind {
        self.binding.kind
    }
}

/// A color attachment that does not belong to any framebuffer texture.
pub fn screen(width: u32, height: u32) -> FramebufferAttachment {
    FramebufferAttachment {
        view: TextureViewId(90_000),
        resolve_target: None,
        format: TextureFormat::Bgra8UnormSrgb,
        sample_count: SampleCount::X1,
        width,
        height,
    }
}

pub fn depth_attachment(width: u32, height: u32) -> FramebufferAttachment {
    FramebufferAttachment {
        view: TextureViewId(90_001),
        resolve_target: None,
        format: TextureFormat::Depth24Plus,
        sample_count: SampleCount::X1,
        width,
        height,
    }
}
