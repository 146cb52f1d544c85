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

//! The full-screen postprocess pass.
//!
//! A [`PostprocessLane`] draws one screen-covering quad with an effect shader.
//! Each frame it computes the view-frustum corners and hands them to the GPU as
//! per-vertex attributes, binds its source textures (or placeholders for the
//! missing ones) and records one render pass into the given target.

use std::borrow::Cow;
use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::Arc;

use apex_core::math::{Extent3D, LinearRgba, Mat4, Origin3D, Vec2, Vec3};
use apex_core::renderer::{
    BindGroupDescriptor, BindGroupEntry, BindGroupId, BindGroupLayoutDescriptor,
    BindGroupLayoutEntry, BindGroupLayoutId, BindingKind, BlendMode, BufferDescriptor, BufferId,
    BufferUsage, ColorTargetStateDescriptor, ColorWrites, CommandEncoder, CompareFunction,
    DepthMode, DepthStencilStateDescriptor, FramebufferAttachment, FramebufferFormat,
    FramebufferTexture, FramebufferTextureDescriptor, GraphicsDevice, IndexFormat,
    LoadOp, MultisampleStateDescriptor, Operations, PipelineLayoutDescriptor,
    PrimitiveStateDescriptor, PrimitiveTopology, RenderPassColorAttachment, RenderPassDescriptor,
    RenderPassDepthStencilAttachment, RenderPipelineDescriptor, ResourceError, SampleKind,
    SamplerId, ShaderModuleId, ShaderStageFlags, StoreOp, TextureBinding, TextureSource,
    TextureFormat, TextureTarget, TextureViewDimension, TextureViewId, VertexAttributeDescriptor,
    VertexBufferLayoutDescriptor, VertexFormat, VertexStepMode,
};

use super::error::PostprocessError;
use super::frustum::{eye_space_light, CameraInfo, FrustumCorners, Z_NEAR};
use super::pipeline_cache::{CachedPipeline, PipelineCache, PipelineKey};
use super::shaders::{EffectKind, FRAGMENT_ENTRY, VERTEX_ENTRY};

/// Index order of the two quad triangles.
pub const POSTPROCESS_INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

/// Uniform block shared by every effect, bound at group 0, binding 0.
///
/// Field order and padding follow WGSL's uniform layout rules: each `vec3`
/// is followed by the scalar that packs into its 16-byte slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PostprocessUniforms {
    /// Maps the unit quad onto the viewport.
    pub projection: [[f32; 4]; 4],
    /// Sun direction in eye space.
    pub directlight_eyespace_direction: [f32; 3],
    /// Contrast factor around mid-grey.
    pub contrast: f32,
    /// Bottom-left far-plane corner in eye space.
    pub frustum_corner_bl: [f32; 3],
    /// Near clip distance.
    pub znear: f32,
    /// Bottom-right minus bottom-left corner.
    pub frustum_corner_br_delta: [f32; 3],
    /// Far clip distance.
    pub zfar: f32,
    /// Top-left minus bottom-left corner.
    pub frustum_corner_tl_delta: [f32; 3],
    _pad0: f32,
    /// Largest UV on the quad: `(1, 1)`, or the pixel size of a rectangle source.
    pub uv_extent: [f32; 2],
    /// Viewport size in pixels.
    pub viewport: [f32; 2],
}

/// One corner of the full-screen quad.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PostprocessVertex {
    /// Position in the unit square, `z = 0`.
    pub position: [f32; 3],
    /// Texture coordinate, normalized or in pixels.
    pub uv: [f32; 2],
    /// Matching far-plane corner in eye space.
    pub eye_corner: [f32; 3],
    /// Matching far-plane corner in world space.
    pub world_corner: [f32; 3],
}

impl PostprocessVertex {
    /// The interleaved vertex buffer layout, locations 0 to 3.
    pub fn layout() -> VertexBufferLayoutDescriptor<'static> {
        VertexBufferLayoutDescriptor {
            array_stride: std::mem::size_of::<PostprocessVertex>() as u64,
            step_mode: VertexStepMode::Vertex,
            attributes: Cow::Owned(vec![
                VertexAttributeDescriptor {
                    shader_location: 0,
                    format: VertexFormat::Float32x3,
                    offset: 0,
                },
                VertexAttributeDescriptor {
                    shader_location: 1,
                    format: VertexFormat::Float32x2,
                    offset: 12,
                },
                VertexAttributeDescriptor {
                    shader_location: 2,
                    format: VertexFormat::Float32x3,
                    offset: 20,
                },
                VertexAttributeDescriptor {
                    shader_location: 3,
                    format: VertexFormat::Float32x3,
                    offset: 32,
                },
            ]),
        }
    }
}

/// Builds the four quad vertices in BL, BR, TR, TL order.
pub fn quad_vertices(corners: &FrustumCorners, uv_extent: Vec2) -> [PostprocessVertex; 4] {
    let positions = [
        [0.0, 0.0, 0.0],
        [1.0, 0.0, 0.0],
        [1.0, 1.0, 0.0],
        [0.0, 1.0, 0.0],
    ];
    let (max_u, max_v) = (uv_extent.x, uv_extent.y);
    let uvs = [[0.0, 0.0], [max_u, 0.0], [max_u, max_v], [0.0, max_v]];
    std::array::from_fn(|i| PostprocessVertex {
        position: positions[i],
        uv: uvs[i],
        eye_corner: corners.eye[i].to_array(),
        world_corner: corners.world[i].to_array(),
    })
}

/// Returns the depth-stencil state for a pass with a depth attachment.
///
/// The depth test is off only when depth writes are off and the mode is
/// [`DepthMode::Always`].
pub fn depth_stencil_state(
    format: TextureFormat,
    write_depth: bool,
    depth_mode: DepthMode,
) -> DepthStencilStateDescriptor {
    let test_enabled = write_depth || depth_mode != DepthMode::Always;
    if test_enabled {
        DepthStencilStateDescriptor {
            format,
            depth_write_enabled: write_depth,
            depth_compare: depth_mode.into(),
        }
    } else {
        DepthStencilStateDescriptor {
            format,
            depth_write_enabled: false,
            depth_compare: CompareFunction::Always,
        }
    }
}

/// An effect shader module and the slots it declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectShader {
    /// The compiled module.
    pub module: ShaderModuleId,
    /// Vertex entry point.
    pub vertex_entry: String,
    /// Fragment entry point.
    pub fragment_entry: String,
    /// Debug label used for pipelines and bind groups.
    pub label: String,
    /// Slot shapes of group 1. Slots past the end take the shape of their source.
    pub input_slots: Vec<BindingKind>,
}

impl EffectShader {
    /// Wraps a module compiled from one of the built-in effects.
    pub fn from_effect(module: ShaderModuleId, effect: EffectKind) -> Self {
        Self {
            module,
            vertex_entry: VERTEX_ENTRY.to_string(),
            fragment_entry: FRAGMENT_ENTRY.to_string(),
            label: effect.label().to_string(),
            input_slots: effect.input_slots().to_vec(),
        }
    }
}

/// The attachments a postprocess pass renders into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PostprocessTarget {
    /// Color attachment.
    pub color: Option<FramebufferAttachment>,
    /// Depth attachment.
    pub depth: Option<FramebufferAttachment>,
}

impl PostprocessTarget {
    /// A color-only target.
    pub fn color(attachment: FramebufferAttachment) -> Self {
        Self {
            color: Some(attachment),
            depth: None,
        }
    }

    /// Adds a depth attachment.
    pub fn with_depth(mut self, attachment: FramebufferAttachment) -> Self {
        self.depth = Some(attachment);
        self
    }
}

/// What [`PostprocessLane::render`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostprocessOutcome {
    /// The quad was drawn.
    Drawn,
    /// No source was available. Only the requested clears were recorded.
    Skipped,
}

type SourceGroupKey = (BindGroupLayoutId, Vec<(TextureViewId, SamplerId)>);

#[derive(Debug)]
struct PostprocessGpu {
    uniform_layout: BindGroupLayoutId,
    uniform_buffer: BufferId,
    uniform_bind_group: BindGroupId,
    vertex_buffer: BufferId,
    index_buffer: BufferId,
    placeholders: HashMap<BindingKind, Arc<FramebufferTexture>>,
    pipelines: PipelineCache,
    source_groups: HashMap<SourceGroupKey, BindGroupId>,
}

/// An object created by [`PostprocessLane::on_gpu_init`], released again if a later step fails.
enum InitObject {
    Layout(BindGroupLayoutId),
    Buffer(BufferId),
    BindGroup(BindGroupId),
    Placeholder(Arc<FramebufferTexture>),
}

impl InitObject {
    fn release(self, device: &dyn GraphicsDevice) {
        let result = match self {
            InitObject::Layout(id) => device.destroy_bind_group_layout(id),
            InitObject::Buffer(id) => device.destroy_buffer(id),
            InitObject::BindGroup(id) => device.destroy_bind_group(id),
            InitObject::Placeholder(texture) => {
                texture.deinit(device);
                Ok(())
            }
        };
        if let Err(e) = result {
            log::warn!("PostprocessLane: Failed to release partial init object: {:?}", e);
        }
    }
}

/// Deactivates every source it holds when dropped, error paths included.
#[derive(Default)]
struct ActiveSources(Vec<Arc<dyn TextureSource>>);

impl Drop for ActiveSources {
    fn drop(&mut self) {
        for source in self.0.drain(..) {
            source.deactivate();
        }
    }
}

/// One full-screen postprocess stage.
#[derive(Debug)]
pub struct PostprocessLane {
    label: String,
    sources: Vec<Option<Arc<dyn TextureSource>>>,
    shader: Option<EffectShader>,
    write_color: bool,
    write_alpha: bool,
    write_depth: bool,
    depth_mode: DepthMode,
    clear_color: bool,
    clear_depth: bool,
    clear_color_value: LinearRgba,
    blend_mode: BlendMode,
    contrast: f32,
    camera: CameraInfo,
    sun_direction: Vec3,
    gpu: Option<PostprocessGpu>,
}

impl Default for PostprocessLane {
    fn default() -> Self {
        Self::new("postprocess")
    }
}

impl PostprocessLane {
    /// Creates a lane with default settings and no GPU resources.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            sources: Vec::new(),
            shader: None,
            write_color: true,
            write_alpha: true,
            write_depth: false,
            depth_mode: DepthMode::LessEqual,
            clear_color: false,
            clear_depth: false,
            clear_color_value: LinearRgba::TRANSPARENT,
            blend_mode: BlendMode::Disabled,
            contrast: 1.0,
            camera: CameraInfo::default(),
            sun_direction: Vec3::Y,
            gpu: None,
        }
    }

    /// The debug label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Sets the input textures. `None` entries bind a placeholder.
    pub fn set_source_textures(&mut self, sources: Vec<Option<Arc<dyn TextureSource>>>) {
        self.sources = sources;
    }

    /// Sets the effect shader.
    pub fn set_shader(&mut self, shader: EffectShader) {
        self.shader = Some(shader);
    }

    /// Enables or disables writes to the RGB channels.
    pub fn set_write_color(&mut self, write: bool) {
        self.write_color = write;
    }

    /// Enables or disables writes to the alpha channel.
    pub fn set_write_alpha(&mut self, write: bool) {
        self.write_alpha = write;
    }

    /// Enables or disables depth writes.
    pub fn set_write_depth(&mut self, write: bool) {
        self.write_depth = write;
    }

    /// Sets the depth comparison.
    pub fn set_depth_mode(&mut self, mode: DepthMode) {
        self.depth_mode = mode;
    }

    /// Chooses which attachments are cleared before drawing.
    pub fn set_clear(&mut self, color: bool, depth: bool) {
        self.clear_color = color;
        self.clear_depth = depth;
    }

    /// Sets the color used when clearing the color attachment.
    pub fn set_clear_color(&mut self, color: LinearRgba) {
        self.clear_color_value = color;
    }

    /// Sets the blend mode of the color target.
    pub fn set_blend_mode(&mut self, mode: BlendMode) {
        self.blend_mode = mode;
    }

    /// Sets the contrast factor.
    pub fn set_contrast(&mut self, contrast: f32) {
        self.contrast = contrast;
    }

    /// Sets the camera used for the frustum corners.
    pub fn set_camera_info(&mut self, camera: CameraInfo) {
        self.camera = camera;
    }

    /// Sets the world-space sun direction.
    pub fn set_sun_direction(&mut self, direction: Vec3) {
        self.sun_direction = direction;
    }

    /// The current camera.
    pub fn camera_info(&self) -> &CameraInfo {
        &self.camera
    }

    /// The contrast factor.
    pub fn contrast(&self) -> f32 {
        self.contrast
    }

    /// Returns `true` between [`on_gpu_init`](Self::on_gpu_init) and
    /// [`on_gpu_shutdown`](Self::on_gpu_shutdown).
    pub fn is_gpu_initialized(&self) -> bool {
        self.gpu.is_some()
    }

    /// Number of pipelines built so far.
    pub fn pipeline_count(&self) -> usize {
        self.gpu.as_ref().map_or(0, |gpu| gpu.pipelines.len())
    }

    /// Number of cached source bind groups.
    pub fn source_bind_group_count(&self) -> usize {
        self.gpu.as_ref().map_or(0, |gpu| gpu.source_groups.len())
    }

    /// Creates the uniform and vertex resources and the default placeholders.
    ///
    /// On failure everything created so far is released and the lane stays
    /// uninitialized.
    pub fn on_gpu_init(&mut self, device: &dyn GraphicsDevice) -> Result<(), PostprocessError> {
        if self.gpu.is_some() {
            log::debug!("PostprocessLane: '{}' already initialized", self.label);
            return Ok(());
        }

        let mut created = Vec::new();
        match self.create_gpu(device, &mut created) {
            Ok(gpu) => {
                self.gpu = Some(gpu);
                log::info!("PostprocessLane: '{}' GPU resources created", self.label);
                Ok(())
            }
            Err(e) => {
                log::error!("PostprocessLane: '{}' GPU init failed: {e}", self.label);
                for object in created.into_iter().rev() {
                    object.release(device);
                }
                Err(e)
            }
        }
    }

    fn create_gpu(
        &self,
        device: &dyn GraphicsDevice,
        created: &mut Vec<InitObject>,
    ) -> Result<PostprocessGpu, PostprocessError> {
        // 1. Uniforms
        let uniform_size = std::mem::size_of::<PostprocessUniforms>() as u64;
        let uniform_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("postprocess_uniform_layout"),
            entries: &[BindGroupLayoutEntry::uniform_buffer(
                0,
                ShaderStageFlags::VERTEX_FRAGMENT,
                NonZeroU64::new(uniform_size),
            )],
        })?;
        created.push(InitObject::Layout(uniform_layout));
        let uniform_buffer = device.create_buffer(&BufferDescriptor {
            label: Some(Cow::Owned(format!("{} uniforms", self.label))),
            size: uniform_size,
            usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
            mapped_at_creation: false,
        })?;
        created.push(InitObject::Buffer(uniform_buffer));
        let uniform_bind_group = device.create_bind_group(&BindGroupDescriptor {
            label: Some("postprocess_uniform_bind_group"),
            layout: uniform_layout,
            entries: &[BindGroupEntry::buffer(0, uniform_buffer)],
        })?;
        created.push(InitObject::BindGroup(uniform_bind_group));

        // 2. Quad
        let vertex_buffer = device.create_buffer(&BufferDescriptor {
            label: Some(Cow::Owned(format!("{} vertices", self.label))),
            size: (4 * std::mem::size_of::<PostprocessVertex>()) as u64,
            usage: BufferUsage::VERTEX | BufferUsage::COPY_DST,
            mapped_at_creation: false,
        })?;
        created.push(InitObject::Buffer(vertex_buffer));
        let index_buffer = device.create_buffer_with_data(
            &BufferDescriptor {
                label: Some(Cow::Owned(format!("{} indices", self.label))),
                size: std::mem::size_of_val(&POSTPROCESS_INDICES) as u64,
                usage: BufferUsage::INDEX,
                mapped_at_creation: false,
            },
            bytemuck::cast_slice(&POSTPROCESS_INDICES),
        )?;
        created.push(InitObject::Buffer(index_buffer));

        // 3. Placeholders for missing sources
        let mut placeholders = HashMap::new();
        for kind in [
            BindingKind::FLOAT_2D,
            BindingKind::DEPTH_2D,
            BindingKind::FLOAT_CUBE,
        ] {
            let placeholder = create_placeholder(device, &self.label, kind)?;
            created.push(InitObject::Placeholder(Arc::clone(&placeholder)));
            placeholders.insert(kind, placeholder);
        }

        Ok(PostprocessGpu {
            uniform_layout,
            uniform_buffer,
            uniform_bind_group,
            vertex_buffer,
            index_buffer,
            placeholders,
            pipelines: PipelineCache::new(),
            source_groups: HashMap::new(),
        })
    }

    /// Destroys every GPU object the lane owns.
    pub fn on_gpu_shutdown(&mut self, device: &dyn GraphicsDevice) {
        let Some(mut gpu) = self.gpu.take() else {
            return;
        };

        for (_, group) in gpu.source_groups.drain() {
            if let Err(e) = device.destroy_bind_group(group) {
                log::warn!("PostprocessLane: Failed to destroy source bind group: {:?}", e);
            }
        }
        gpu.pipelines.clear(device);

        if let Err(e) = device.destroy_bind_group(gpu.uniform_bind_group) {
            log::warn!("PostprocessLane: Failed to destroy uniform bind group: {:?}", e);
        }
        if let Err(e) = device.destroy_bind_group_layout(gpu.uniform_layout) {
            log::warn!("PostprocessLane: Failed to destroy uniform layout: {:?}", e);
        }
        for buffer in [gpu.uniform_buffer, gpu.vertex_buffer, gpu.index_buffer] {
            if let Err(e) = device.destroy_buffer(buffer) {
                log::warn!("PostprocessLane: Failed to destroy buffer: {:?}", e);
            }
        }
        for (_, placeholder) in gpu.placeholders.drain() {
            placeholder.deinit(device);
        }
        log::info!("PostprocessLane: '{}' GPU resources released", self.label);
    }

    /// Drops the cached source bind groups.
    ///
    /// Call after the source textures were re-initialized: their views changed
    /// and the cached groups point at released ones.
    pub fn release_source_bind_groups(&mut self, device: &dyn GraphicsDevice) {
        let Some(gpu) = self.gpu.as_mut() else {
            return;
        };
        for (_, group) in gpu.source_groups.drain() {
            if let Err(e) = device.destroy_bind_group(group) {
                log::warn!("PostprocessLane: Failed to destroy source bind group: {:?}", e);
            }
        }
    }

    /// Records the pass into `encoder`.
    ///
    /// # Errors
    ///
    /// - [`PostprocessError::ShaderNotSet`] without a shader.
    /// - [`PostprocessError::NotInitialized`] before [`on_gpu_init`](Self::on_gpu_init).
    /// - [`PostprocessError::Pipeline`] for [`BlendMode::AlphaTest`].
    /// - [`PostprocessError::MissingTarget`] when `target` is empty.
    /// - [`PostprocessError::Resource`] when a device call fails.
    ///
    /// Sources are deactivated again before this returns, whatever the result.
    pub fn render(
        &mut self,
        device: &dyn GraphicsDevice,
        encoder: &mut dyn CommandEncoder,
        target: &PostprocessTarget,
    ) -> Result<PostprocessOutcome, PostprocessError> {
        // 1. Preconditions
        let shader = self.shader.as_ref().ok_or(PostprocessError::ShaderNotSet)?;
        let gpu = self.gpu.as_mut().ok_or(PostprocessError::NotInitialized)?;
        self.blend_mode.to_blend_state()?;
        let sample_count = match (target.color, target.depth) {
            (None, None) => return Err(PostprocessError::MissingTarget),
            (Some(color), Some(depth)) => {
                if color.sample_count != depth.sample_count
                    || color.width != depth.width
                    || color.height != depth.height
                {
                    return Err(PostprocessError::AttachmentMismatch(format!(
                        "color is {}x{} with {:?}, depth is {}x{} with {:?}",
                        color.width,
                        color.height,
                        color.sample_count,
                        depth.width,
                        depth.height,
                        depth.sample_count
                    )));
                }
                color.sample_count
            }
            (Some(attachment), None) | (None, Some(attachment)) => attachment.sample_count,
        };

        // 2. Sources
        let slot_count = shader.input_slots.len().max(self.sources.len());
        let mut active = ActiveSources::default();
        let mut bound: Vec<(BindingKind, Option<TextureBinding>)> = Vec::with_capacity(slot_count);
        let mut uv_extent = Vec2::ONE;
        for slot in 0..slot_count {
            let declared = shader.input_slots.get(slot).copied();
            let source = self.sources.get(slot).and_then(Option::as_ref);
            let kind = declared
                .or_else(|| source.map(|s| s.binding_kind()))
                .unwrap_or(BindingKind::FLOAT_2D);
            let binding = source.and_then(|source| {
                if source.binding_kind() != kind {
                    log::warn!(
                        "PostprocessLane: '{}' slot {slot} expects {kind:?} but its source binds as {:?}; using a placeholder",
                        self.label,
                        source.binding_kind()
                    );
                    return None;
                }
                match source.activate() {
                    Ok(binding) => {
                        active.0.push(Arc::clone(source));
                        if source.is_rect() {
                            uv_extent = Vec2::new(source.width() as f32, source.height() as f32);
                        }
                        Some(binding)
                    }
                    Err(e) => {
                        log::warn!(
                            "PostprocessLane: '{}' slot {slot} source unavailable: {e}",
                            self.label
                        );
                        None
                    }
                }
            });
            bound.push((kind, binding));
        }

        // 3. Skip rule
        let available = active.0.len();
        let skipped = !self.sources.is_empty() && available == 0;
        if skipped {
            log::warn!(
                "Out of the {} input textures provided as inputs to this postprocess stage, zero are available. This stage will have no effect.",
                self.sources.len()
            );
        }

        let draw = if skipped {
            None
        } else {
            let mut bindings = Vec::with_capacity(bound.len());
            for (kind, binding) in bound {
                let binding = match binding {
                    Some(binding) => binding,
                    None => {
                        let placeholder =
                            placeholder_for(device, &self.label, &mut gpu.placeholders, kind)?;
                        let binding = placeholder.activate()?;
                        active.0.push(placeholder);
                        binding
                    }
                };
                bindings.push(binding);
            }

            // 4-5. Frustum and uniforms
            let corners = FrustumCorners::compute(&self.camera);
            let light = eye_space_light(self.camera.rotation, self.sun_direction);
            let uniforms = PostprocessUniforms {
                projection: Mat4::orthographic_rh_zo(0.0, 1.0, 0.0, 1.0, -1.0, 1.0)
                    .to_cols_array_2d(),
                directlight_eyespace_direction: light.to_array(),
                contrast: self.contrast,
                frustum_corner_bl: corners.bottom_left().to_array(),
                znear: Z_NEAR,
                frustum_corner_br_delta: corners.right_delta().to_array(),
                zfar: self.camera.lod_far,
                frustum_corner_tl_delta: corners.up_delta().to_array(),
                _pad0: 0.0,
                uv_extent: uv_extent.to_array(),
                viewport: [self.camera.width as f32, self.camera.height as f32],
            };
            device.write_buffer(gpu.uniform_buffer, 0, bytemuck::bytes_of(&uniforms))?;

            // 6. Vertices
            let vertices = quad_vertices(&corners, uv_extent);
            device.write_buffer(gpu.vertex_buffer, 0, bytemuck::cast_slice(&vertices))?;

            // 7. Pipeline
            let key = PipelineKey {
                shader: shader.module,
                fragment_entry: shader.fragment_entry.clone(),
                blend: self.blend_mode,
                color: target.color.map(|color| {
                    (
                        color.format,
                        ColorWrites::from_switches(self.write_color, self.write_alpha),
                    )
                }),
                depth: target
                    .depth
                    .map(|depth| depth_stencil_state(depth.format, self.write_depth, self.depth_mode)),
                sample_count,
                slots: bindings.iter().map(|binding| binding.kind).collect(),
            };
            let uniform_layout = gpu.uniform_layout;
            let cached = gpu.pipelines.get_or_create(device, &key, |device, key| {
                build_pipeline(device, key, shader, uniform_layout)
            })?;

            // 8. Source bind group
            let group_key: SourceGroupKey = (
                cached.source_layout,
                bindings.iter().map(|b| (b.view, b.sampler)).collect(),
            );
            let source_group = match gpu.source_groups.get(&group_key) {
                Some(group) => *group,
                None => {
                    let entries: Vec<BindGroupEntry> = bindings
                        .iter()
                        .enumerate()
                        .flat_map(|(slot, binding)| {
                            let slot = slot as u32;
                            [
                                BindGroupEntry::texture_view(2 * slot, binding.view),
                                BindGroupEntry::sampler(2 * slot + 1, binding.sampler),
                            ]
                        })
                        .collect();
                    let group = device.create_bind_group(&BindGroupDescriptor {
                        label: Some(&format!("{} sources", self.label)),
                        layout: cached.source_layout,
                        entries: &entries,
                    })?;
                    gpu.source_groups.insert(group_key, group);
                    group
                }
            };
            Some((cached, source_group))
        };

        // 9. Pass
        let color_ops = Operations {
            load: if self.clear_color {
                LoadOp::Clear(self.clear_color_value)
            } else {
                LoadOp::Load
            },
            store: StoreOp::Store,
        };
        let depth_ops = Operations {
            load: if self.clear_depth {
                LoadOp::Clear(1.0)
            } else {
                LoadOp::Load
            },
            store: StoreOp::Store,
        };
        if draw.is_none() && !(self.clear_color && target.color.is_some())
            && !(self.clear_depth && target.depth.is_some())
        {
            return Ok(PostprocessOutcome::Skipped);
        }

        let color_attachments: Vec<RenderPassColorAttachment> = target
            .color
            .iter()
            .map(|color| RenderPassColorAttachment {
                view: &color.view,
                resolve_target: color.resolve_target.as_ref(),
                ops: color_ops,
            })
            .collect();
        let depth_stencil_attachment =
            target
                .depth
                .as_ref()
                .map(|depth| RenderPassDepthStencilAttachment {
                    view: &depth.view,
                    depth_ops: Some(depth_ops),
                });
        let uniform_bind_group = gpu.uniform_bind_group;
        let vertex_buffer = gpu.vertex_buffer;
        let index_buffer = gpu.index_buffer;
        let pass_label = self.label.clone();

        {
            let mut pass = encoder.begin_render_pass(&RenderPassDescriptor {
                label: Some(&pass_label),
                color_attachments: &color_attachments,
                depth_stencil_attachment,
            });
            if let Some((cached, source_group)) = &draw {
                pass.set_pipeline(&cached.pipeline);
                pass.set_bind_group(0, &uniform_bind_group, &[]);
                pass.set_bind_group(1, source_group, &[]);
                pass.set_vertex_buffer(0, &vertex_buffer, 0);
                pass.set_index_buffer(&index_buffer, 0, IndexFormat::Uint16);
                pass.draw_indexed(0..POSTPROCESS_INDICES.len() as u32, 0, 0..1);
            }
        }

        // 10. Cleanup
        drop(active);
        Ok(if draw.is_some() {
            PostprocessOutcome::Drawn
        } else {
            PostprocessOutcome::Skipped
        })
    }
}

fn build_pipeline(
    device: &dyn GraphicsDevice,
    key: &PipelineKey,
    shader: &EffectShader,
    uniform_layout: BindGroupLayoutId,
) -> Result<CachedPipeline, ResourceError> {
    let blend = key.blend.to_blend_state()?;
    let entries: Vec<BindGroupLayoutEntry> = key
        .slots
        .iter()
        .enumerate()
        .flat_map(|(slot, kind)| {
            let slot = slot as u32;
            [
                BindGroupLayoutEntry {
                    binding: 2 * slot,
                    visibility: ShaderStageFlags::FRAGMENT,
                    ty: kind.texture_binding_type(),
                },
                BindGroupLayoutEntry {
                    binding: 2 * slot + 1,
                    visibility: ShaderStageFlags::FRAGMENT,
                    ty: kind.sampler_binding_type(),
                },
            ]
        })
        .collect();

    let source_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
        label: Some(&format!("{} source layout", shader.label)),
        entries: &entries,
    })?;
    let layout = match device.create_pipeline_layout(&PipelineLayoutDescriptor {
        label: Some(Cow::Owned(format!("{} pipeline layout", shader.label))),
        bind_group_layouts: &[uniform_layout, source_layout],
    }) {
        Ok(layout) => layout,
        Err(e) => {
            let _ = device.destroy_bind_group_layout(source_layout);
            return Err(e);
        }
    };

    let color_target_states: Vec<ColorTargetStateDescriptor> = key
        .color
        .iter()
        .map(|&(format, write_mask)| ColorTargetStateDescriptor {
            format,
            blend,
            write_mask,
        })
        .collect();

    let pipeline = device.create_render_pipeline(&RenderPipelineDescriptor {
        label: Some(Cow::Owned(format!("{} pipeline", shader.label))),
        vertex_shader_module: shader.module,
        vertex_entry_point: Cow::Borrowed(shader.vertex_entry.as_str()),
        fragment_shader_module: Some(shader.module),
        fragment_entry_point: Some(Cow::Borrowed(shader.fragment_entry.as_str())),
        vertex_buffers_layout: Cow::Owned(vec![PostprocessVertex::layout()]),
        layout: Some(layout),
        primitive_state: PrimitiveStateDescriptor {
            topology: PrimitiveTopology::TriangleList,
            cull_mode: None,
            ..Default::default()
        },
        depth_stencil_state: key.depth,
        color_target_states: Cow::Owned(color_target_states),
        multisample_state: MultisampleStateDescriptor {
            count: key.sample_count,
            mask: !0,
            alpha_to_coverage_enabled: false,
        },
    });
    match pipeline {
        Ok(pipeline) => Ok(CachedPipeline {
            pipeline,
            layout,
            source_layout,
        }),
        Err(e) => {
            let _ = device.destroy_pipeline_layout(layout);
            let _ = device.destroy_bind_group_layout(source_layout);
            Err(e)
        }
    }
}

fn placeholder_for(
    device: &dyn GraphicsDevice,
    label: &str,
    placeholders: &mut HashMap<BindingKind, Arc<FramebufferTexture>>,
    kind: BindingKind,
) -> Result<Arc<dyn TextureSource>, PostprocessError> {
    let placeholder: Arc<dyn TextureSource> = match placeholders.get(&kind) {
        Some(placeholder) => Arc::clone(placeholder) as Arc<dyn TextureSource>,
        None => {
            let placeholder = create_placeholder(device, label, kind)?;
            placeholders.insert(kind, Arc::clone(&placeholder));
            placeholder as Arc<dyn TextureSource>
        }
    };
    Ok(placeholder)
}

/// Creates a 1x1 texture of the given slot shape with defined contents:
/// opaque black for color, the far plane for depth.
fn create_placeholder(
    device: &dyn GraphicsDevice,
    label: &str,
    kind: BindingKind,
) -> Result<Arc<FramebufferTexture>, PostprocessError> {
    let format = match kind.sample {
        SampleKind::Float => FramebufferFormat::Rgba8,
        SampleKind::Depth | SampleKind::DepthComparison => FramebufferFormat::Depth24,
    };
    let is_cube = kind.dimension == TextureViewDimension::Cube;
    let mut desc = FramebufferTextureDescriptor::new(1, 1, format);
    desc.target = if is_cube {
        TextureTarget::Cubemap
    } else {
        TextureTarget::Texture2D
    };
    desc.depth_comparison = kind.sample == SampleKind::DepthComparison;

    let texture = FramebufferTexture::new(format!("{label} placeholder {:?}", kind.sample));
    texture
        .init(device, &desc)
        .map_err(ResourceError::from)?;
    if let Err(e) = fill_placeholder(device, &texture, format.is_depth(), is_cube) {
        texture.deinit(device);
        return Err(e);
    }
    log::debug!("PostprocessLane: '{label}' created placeholder for {kind:?}");
    Ok(Arc::new(texture))
}

fn fill_placeholder(
    device: &dyn GraphicsDevice,
    texture: &FramebufferTexture,
    is_depth: bool,
    is_cube: bool,
) -> Result<(), PostprocessError> {
    if is_depth {
        let attachment = texture.attach().map_err(ResourceError::from)?;
        let mut encoder = device.create_command_encoder(Some("postprocess placeholder clear"));
        {
            let _pass = encoder.begin_render_pass(&RenderPassDescriptor {
                label: Some("postprocess placeholder clear"),
                color_attachments: &[],
                depth_stencil_attachment: Some(RenderPassDepthStencilAttachment {
                    view: &attachment.view,
                    depth_ops: Some(Operations {
                        load: LoadOp::Clear(1.0),
                        store: StoreOp::Store,
                    }),
                }),
            });
        }
        device.submit_command_buffer(encoder.finish());
        texture.detach();
        return Ok(());
    }

    let texture_id = texture.texture_id().ok_or(PostprocessError::NotInitialized)?;
    let layers = if is_cube { 6 } else { 1 };
    for layer in 0..layers {
        device.write_texture(
            texture_id,
            &[0, 0, 0, 255],
            Some(4),
            Origin3D {
                x: 0,
                y: 0,
                z: layer,
            },
            Extent3D {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use apex_core::math::Quaternion;
    use approx::assert_relative_eq;

    #[test]
    fn uniform_block_matches_the_wgsl_layout() {
        assert_eq!(std::mem::size_of::<PostprocessUniforms>(), 144);
        assert_eq!(std::mem::offset_of!(PostprocessUniforms, contrast), 76);
        assert_eq!(std::mem::offset_of!(PostprocessUniforms, znear), 92);
        assert_eq!(std::mem::offset_of!(PostprocessUniforms, zfar), 108);
        assert_eq!(std::mem::offset_of!(PostprocessUniforms, uv_extent), 128);
        assert_eq!(std::mem::offset_of!(PostprocessUniforms, viewport), 136);
    }

    #[test]
    fn vertex_layout_matches_the_struct() {
        assert_eq!(std::mem::size_of::<PostprocessVertex>(), 44);
        let layout = PostprocessVertex::layout();
        assert_eq!(layout.array_stride, 44);
        let locations: Vec<u32> = layout.attributes.iter().map(|a| a.shader_location).collect();
        assert_eq!(locations, vec![0, 1, 2, 3]);
        assert_eq!(
            std::mem::offset_of!(PostprocessVertex, world_corner) as u64,
            layout.attributes[3].offset
        );
    }

    #[test]
    fn quad_vertices_follow_corner_order() {
        let camera = CameraInfo {
            width: 100,
            height: 50,
            lod_far: 10.0,
            rotation: Quaternion::IDENTITY,
            ..Default::default()
        };
        let corners = FrustumCorners::compute(&camera);
        let vertices = quad_vertices(&corners, Vec2::new(640.0, 480.0));

        assert_eq!(vertices[0].position, [0.0, 0.0, 0.0]);
        assert_eq!(vertices[2].position, [1.0, 1.0, 0.0]);
        assert_eq!(vertices[1].uv, [640.0, 0.0]);
        assert_eq!(vertices[3].uv, [0.0, 480.0]);
        for (vertex, corner) in vertices.iter().zip(corners.eye) {
            assert_eq!(vertex.eye_corner, corner.to_array());
            assert_relative_eq!(vertex.eye_corner[2], -10.0);
        }
        assert!(vertices[0].eye_corner[0] < 0.0 && vertices[0].eye_corner[1] < 0.0);
        assert!(vertices[2].eye_corner[0] > 0.0 && vertices[2].eye_corner[1] > 0.0);
    }

    #[test]
    fn depth_test_is_off_only_for_always_without_writes() {
        let format = TextureFormat::Depth24Plus;

        let off = depth_stencil_state(format, false, DepthMode::Always);
        assert_eq!(off.depth_compare, CompareFunction::Always);
        assert!(!off.depth_write_enabled);

        let write_always = depth_stencil_state(format, true, DepthMode::Always);
        assert_eq!(write_always.depth_compare, CompareFunction::Always);
        assert!(write_always.depth_write_enabled);

        let test_only = depth_stencil_state(format, false, DepthMode::Less);
        assert_eq!(test_only.depth_compare, CompareFunction::Less);
        assert!(!test_only.depth_write_enabled);
    }

    #[test]
    fn new_lane_has_documented_defaults() {
        let lane = PostprocessLane::new("fog");
        assert_eq!(lane.label(), "fog");
        assert!(lane.write_color && lane.write_alpha && !lane.write_depth);
        assert_eq!(lane.depth_mode, DepthMode::LessEqual);
        assert!(!lane.clear_color && !lane.clear_depth);
        assert_eq!(lane.clear_color_value, LinearRgba::TRANSPARENT);
        assert_eq!(lane.blend_mode, BlendMode::Disabled);
        assert_eq!(lane.contrast, 1.0);
        assert!(!lane.is_gpu_initialized());
        assert_eq!(lane.pipeline_count(), 0);
    }

    #[test]
    fn effect_shader_takes_the_effect_slots() {
        let shader = EffectShader::from_effect(ShaderModuleId(7), EffectKind::DepthFog);
        assert_eq!(shader.input_slots, vec![BindingKind::FLOAT_2D, BindingKind::DEPTH_2D]);
        assert_eq!(shader.vertex_entry, "vs_main");
        assert_eq!(shader.fragment_entry, "fs_main");
    }
}
