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

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use wgpu::util::DeviceExt;

use apex_core::math::dimension;
use apex_core::renderer::api::buffer::{self as api_buf};
use apex_core::renderer::api::command::{self as api_cmd};
use apex_core::renderer::api::texture::{self as api_tex};
use apex_core::renderer::traits::{
    CommandEncoder, FEATURE_MULTISAMPLE_X4, FEATURE_TEXTURE_RECTANGLE,
};
use apex_core::renderer::{
    GraphicsDevice, PipelineError, PipelineLayoutDescriptor, PipelineLayoutId,
    RenderPipelineDescriptor, RenderPipelineId, RendererAdapterInfo, ResourceError, ShaderError,
    ShaderModuleDescriptor, ShaderModuleId, ShaderSourceData, TextureFormat,
};

use super::command::WgpuCommandEncoder;
use super::context::WgpuGraphicsContext;
use super::conversions::{
    from_wgpu_backend, from_wgpu_device_type, from_wgpu_texture_format, IntoWgpu,
};

#[derive(Debug)]
struct WgpuShaderModuleEntry {
    wgpu_module: Arc<wgpu::ShaderModule>,
}

#[derive(Debug)]
pub(crate) struct WgpuRenderPipelineEntry {
    pub(crate) wgpu_pipeline: Arc<wgpu::RenderPipeline>,
}

#[derive(Debug)]
struct WgpuPipelineLayoutEntry {
    wgpu_layout: Arc<wgpu::PipelineLayout>,
}

#[derive(Debug)]
struct WgpuBindGroupLayoutEntry {
    wgpu_layout: Arc<wgpu::BindGroupLayout>,
}

#[derive(Debug)]
pub(crate) struct WgpuBindGroupEntry {
    pub(crate) wgpu_bind_group: Arc<wgpu::BindGroup>,
}

#[derive(Debug)]
pub(crate) struct WgpuBufferEntry {
    pub(crate) wgpu_buffer: Arc<wgpu::Buffer>,
    pub(crate) size: u64,
}

#[derive(Debug)]
pub(crate) struct WgpuTextureEntry {
    pub(crate) wgpu_texture: Arc<wgpu::Texture>,
    pub(crate) format: TextureFormat,
}

#[derive(Debug)]
pub(crate) struct WgpuTextureViewEntry {
    pub(crate) wgpu_view: Arc<wgpu::TextureView>,
}

#[derive(Debug)]
pub(crate) struct WgpuSamplerEntry {
    pub(crate) wgpu_sampler: Arc<wgpu::Sampler>,
}

/// The internal, non-clonable state of the WgpuDevice.
/// Every GPU object lives in a table keyed by its opaque id.
#[derive(Debug)]
pub struct WgpuDeviceInternal {
    context: Arc<Mutex<WgpuGraphicsContext>>,
    shader_modules: Mutex<HashMap<ShaderModuleId, WgpuShaderModuleEntry>>,
    pipelines: Mutex<HashMap<RenderPipelineId, WgpuRenderPipelineEntry>>,
    pipeline_layouts: Mutex<HashMap<PipelineLayoutId, WgpuPipelineLayoutEntry>>,
    bind_group_layouts: Mutex<HashMap<api_cmd::BindGroupLayoutId, WgpuBindGroupLayoutEntry>>,
    bind_groups: Mutex<HashMap<api_cmd::BindGroupId, WgpuBindGroupEntry>>,
    buffers: Mutex<HashMap<api_buf::BufferId, WgpuBufferEntry>>,
    textures: Mutex<HashMap<api_tex::TextureId, WgpuTextureEntry>>,
    texture_views: Mutex<HashMap<api_tex::TextureViewId, WgpuTextureViewEntry>>,
    samplers: Mutex<HashMap<api_tex::SamplerId, WgpuSamplerEntry>>,

    next_shader_id: AtomicUsize,
    next_pipeline_id: AtomicUsize,
    next_pipeline_layout_id: AtomicUsize,
    next_bind_group_layout_id: AtomicUsize,
    next_bind_group_id: AtomicUsize,
    next_buffer_id: AtomicUsize,
    next_texture_id: AtomicUsize,
    next_texture_view_id: AtomicUsize,
    next_sampler_id: AtomicUsize,

    /// Command buffers that have been finished but not yet submitted.
    pending_command_buffers: Mutex<HashMap<api_cmd::CommandBufferId, wgpu::CommandBuffer>>,
    /// A thread-safe counter to generate unique command buffer IDs.
    command_buffer_id_counter: AtomicU64,
}

/// A clonable, thread-safe handle to the WGPU graphics device.
/// It wraps the actual device state (`WgpuDeviceInternal`) in an Arc,
/// allowing it to be shared with command encoders.
#[derive(Clone, Debug)]
pub struct WgpuDevice {
    internal: Arc<WgpuDeviceInternal>,
}

fn lock_table<'a, T>(
    table: &'a Mutex<T>,
    name: &str,
) -> Result<MutexGuard<'a, T>, ResourceError> {
    table
        .lock()
        .map_err(|e| ResourceError::BackendError(format!("Mutex poisoned ({name}): {e}")))
}

fn check_validation(context: &WgpuGraphicsContext, what: &str) -> Result<(), ResourceError> {
    let errors = context.validation_errors.take();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ResourceError::BackendError(format!(
            "wgpu validation failed in {what}: {}",
            errors.join("; ")
        )))
    }
}

fn label_or_default<'a>(label: Option<&'a str>) -> &'a str {
    label.unwrap_or("<unlabeled>")
}

impl WgpuDevice {
    pub fn new(context: Arc<Mutex<WgpuGraphicsContext>>) -> Self {
        Self {
            internal: Arc::new(WgpuDeviceInternal {
                context,
                shader_modules: Mutex::new(HashMap::new()),
                pipelines: Mutex::new(HashMap::new()),
                pipeline_layouts: Mutex::new(HashMap::new()),
                bind_group_layouts: Mutex::new(HashMap::new()),
                bind_groups: Mutex::new(HashMap::new()),
                buffers: Mutex::new(HashMap::new()),
                textures: Mutex::new(HashMap::new()),
                texture_views: Mutex::new(HashMap::new()),
                samplers: Mutex::new(HashMap::new()),
                next_shader_id: AtomicUsize::new(0),
                next_pipeline_id: AtomicUsize::new(0),
                next_pipeline_layout_id: AtomicUsize::new(0),
                next_bind_group_layout_id: AtomicUsize::new(0),
                next_bind_group_id: AtomicUsize::new(0),
                next_buffer_id: AtomicUsize::new(0),
                next_texture_id: AtomicUsize::new(0),
                next_texture_view_id: AtomicUsize::new(0),
                next_sampler_id: AtomicUsize::new(0),
                pending_command_buffers: Mutex::new(HashMap::new()),
                command_buffer_id_counter: AtomicU64::new(0),
            }),
        }
    }

    // --- ID Generation Helpers ---

    fn next_id(counter: &AtomicUsize) -> usize {
        counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Executes an operation with the wgpu::Device locked.
    ///
    /// A validation error raised during `operation` turns its result into a
    /// `ResourceError::BackendError` tagged with `what`.
    fn with_wgpu_device<F, R>(&self, what: &str, operation: F) -> Result<R, ResourceError>
    where
        F: FnOnce(&wgpu::Device) -> Result<R, ResourceError>,
    {
        let context_guard = lock_table(&self.internal.context, "context")?;
        // Anything pending was raised elsewhere and already logged.
        context_guard.validation_errors.take();
        let result = operation(&context_guard.device)?;
        check_validation(&context_guard, what)?;
        Ok(result)
    }

    /// Executes an operation with the wgpu::Queue locked, checked like
    /// [`Self::with_wgpu_device`].
    fn with_wgpu_queue<F, R>(&self, what: &str, operation: F) -> Result<R, ResourceError>
    where
        F: FnOnce(&wgpu::Queue) -> Result<R, ResourceError>,
    {
        let context_guard = lock_table(&self.internal.context, "context")?;
        context_guard.validation_errors.take();
        let result = operation(&context_guard.queue)?;
        check_validation(&context_guard, what)?;
        Ok(result)
    }

    fn context(&self) -> MutexGuard<'_, WgpuGraphicsContext> {
        self.internal.context.lock().unwrap_or_else(|poisoned| {
            log::error!("WgpuDevice: context mutex was poisoned; continuing with its state.");
            PoisonError::into_inner(poisoned)
        })
    }

    /// Retrieves a reference-counted pointer to the internal WGPU render pipeline.
    /// Returns `None` if the ID is invalid.
    pub fn get_wgpu_render_pipeline(
        &self,
        id: RenderPipelineId,
    ) -> Option<Arc<wgpu::RenderPipeline>> {
        let pipelines = self.internal.pipelines.lock().ok()?;
        pipelines
            .get(&id)
            .map(|entry| Arc::clone(&entry.wgpu_pipeline))
    }

    /// Retrieves a reference-counted pointer to the internal WGPU bind group.
    pub fn get_wgpu_bind_group(&self, id: api_cmd::BindGroupId) -> Option<Arc<wgpu::BindGroup>> {
        let bind_groups = self.internal.bind_groups.lock().ok()?;
        bind_groups
            .get(&id)
            .map(|entry| Arc::clone(&entry.wgpu_bind_group))
    }

    /// Retrieves a reference-counted pointer to the internal WGPU buffer.
    pub fn get_wgpu_buffer(&self, id: api_buf::BufferId) -> Option<Arc<wgpu::Buffer>> {
        let buffers = self.internal.buffers.lock().ok()?;
        buffers.get(&id).map(|entry| Arc::clone(&entry.wgpu_buffer))
    }

    /// Retrieves a reference-counted pointer to the internal WGPU texture.
    pub fn get_wgpu_texture(&self, id: api_tex::TextureId) -> Option<Arc<wgpu::Texture>> {
        let textures = self.internal.textures.lock().ok()?;
        textures.get(&id).map(|entry| Arc::clone(&entry.wgpu_texture))
    }

    /// Retrieves a reference-counted pointer to the internal WGPU texture view.
    pub fn get_wgpu_texture_view(
        &self,
        id: &api_tex::TextureViewId,
    ) -> Option<Arc<wgpu::TextureView>> {
        let views = self.internal.texture_views.lock().ok()?;
        views.get(id).map(|entry| Arc::clone(&entry.wgpu_view))
    }

    fn get_wgpu_sampler(&self, id: api_tex::SamplerId) -> Option<Arc<wgpu::Sampler>> {
        let samplers = self.internal.samplers.lock().ok()?;
        samplers.get(&id).map(|entry| Arc::clone(&entry.wgpu_sampler))
    }

    /// Polls the underlying wgpu::Device in a blocking manner so every
    /// submitted command buffer has completed before resources are destroyed.
    pub fn poll_device_blocking(&self) {
        let context_guard = self.context();
        if let Err(e) = context_guard.device.poll(wgpu::PollType::wait_indefinitely()) {
            log::warn!("WgpuDevice: failed to poll device: {e:?}");
        }
    }

    /// Number of finished command buffers still waiting for submission.
    pub fn pending_command_buffer_count(&self) -> usize {
        self.internal
            .pending_command_buffers
            .lock()
            .map(|guard| guard.len())
            .unwrap_or(0)
    }

    /// (crate-internal) Registers a finished wgpu::CommandBuffer, storing it
    /// in a map and returning an abstract ID for it.
    pub(crate) fn register_command_buffer(
        &self,
        buffer: wgpu::CommandBuffer,
    ) -> api_cmd::CommandBufferId {
        let new_id = api_cmd::CommandBufferId(
            self.internal
                .command_buffer_id_counter
                .fetch_add(1, Ordering::SeqCst),
        );

        match self.internal.pending_command_buffers.lock() {
            Ok(mut guard) => {
                guard.insert(new_id, buffer);
            }
            Err(e) => {
                log::error!("WgpuDevice: dropping command buffer {new_id:?}: {e}");
            }
        }
        new_id
    }
}

impl GraphicsDevice for WgpuDevice {
    // --- Shader Module Operations ---

    fn create_shader_module(
        &self,
        descriptor: &ShaderModuleDescriptor,
    ) -> Result<ShaderModuleId, ResourceError> {
        let wgpu_source = match &descriptor.source {
            ShaderSourceData::Wgsl(cow_str) => wgpu::ShaderSource::Wgsl(cow_str.clone()),
        };
        let label = descriptor.label;

        let wgpu_module = self.with_wgpu_device("create_shader_module", |device| {
            log::debug!("WgpuDevice: Creating wgpu::ShaderModule with label: {label:?}");
            Ok(Arc::new(device.create_shader_module(
                wgpu::ShaderModuleDescriptor {
                    label,
                    source: wgpu_source,
                },
            )))
        })?;

        let id = ShaderModuleId(Self::next_id(&self.internal.next_shader_id));
        lock_table(&self.internal.shader_modules, "shader_modules")?
            .insert(id, WgpuShaderModuleEntry { wgpu_module });

        log::info!(
            "WgpuDevice: Created shader module '{}' with ID: {id:?}",
            label_or_default(label)
        );
        Ok(id)
    }

    fn destroy_shader_module(&self, id: ShaderModuleId) -> Result<(), ResourceError> {
        let mut modules = lock_table(&self.internal.shader_modules, "shader_modules")?;
        if modules.remove(&id).is_some() {
            log::debug!("WgpuDevice: Destroyed shader module with ID: {id:?}");
            Ok(())
        } else {
            Err(ShaderError::NotFound { id }.into())
        }
    }

    // --- Render Pipeline Operations ---

    fn create_render_pipeline(
        &self,
        descriptor: &RenderPipelineDescriptor,
    ) -> Result<RenderPipelineId, ResourceError> {
        log::debug!(
            "WgpuDevice: Creating render pipeline with label: {:?}",
            descriptor.label
        );

        // 1. Resolve the shader modules and the layout
        let (vs_module, fs_module) = {
            let modules = lock_table(&self.internal.shader_modules, "shader_modules")?;
            let lookup = |id: ShaderModuleId| {
                modules
                    .get(&id)
                    .map(|entry| Arc::clone(&entry.wgpu_module))
                    .ok_or(ResourceError::Shader(ShaderError::NotFound { id }))
            };
            let vs = lookup(descriptor.vertex_shader_module)?;
            let fs = descriptor.fragment_shader_module.map(lookup).transpose()?;
            (vs, fs)
        };

        let explicit_layout = match descriptor.layout {
            Some(layout_id) => Some(
                lock_table(&self.internal.pipeline_layouts, "pipeline_layouts")?
                    .get(&layout_id)
                    .map(|entry| Arc::clone(&entry.wgpu_layout))
                    .ok_or_else(|| {
                        PipelineError::LayoutCreationFailed(format!(
                            "pipeline layout {layout_id:?} not found"
                        ))
                    })?,
            ),
            None => None,
        };

        // 2. Convert vertex buffer layouts
        let vertex_attributes: Vec<Vec<wgpu::VertexAttribute>> = descriptor
            .vertex_buffers_layout
            .iter()
            .map(|layout| {
                layout
                    .attributes
                    .iter()
                    .map(|attr| wgpu::VertexAttribute {
                        format: attr.format.into_wgpu(),
                        offset: attr.offset,
                        shader_location: attr.shader_location,
                    })
                    .collect()
            })
            .collect();

        let vertex_buffers: Vec<wgpu::VertexBufferLayout> = descriptor
            .vertex_buffers_layout
            .iter()
            .zip(vertex_attributes.iter())
            .map(|(layout, attributes)| wgpu::VertexBufferLayout {
                array_stride: layout.array_stride,
                step_mode: layout.step_mode.into_wgpu(),
                attributes,
            })
            .collect();

        // 3. Fixed-function state
        let primitive = wgpu::PrimitiveState {
            topology: descriptor.primitive_state.topology.into_wgpu(),
            strip_index_format: descriptor
                .primitive_state
                .strip_index_format
                .map(|f| f.into_wgpu()),
            front_face: descriptor.primitive_state.front_face.into_wgpu(),
            cull_mode: descriptor.primitive_state.cull_mode.map(|m| m.into_wgpu()),
            polygon_mode: wgpu::PolygonMode::Fill,
            unclipped_depth: false,
            conservative: false,
        };

        let depth_stencil = descriptor
            .depth_stencil_state
            .map(|ds| wgpu::DepthStencilState {
                format: ds.format.into_wgpu(),
                depth_write_enabled: Some(ds.depth_write_enabled),
                depth_compare: Some(ds.depth_compare.into_wgpu()),
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            });

        let color_targets: Vec<Option<wgpu::ColorTargetState>> = descriptor
            .color_target_states
            .iter()
            .map(|cts| {
                Some(wgpu::ColorTargetState {
                    format: cts.format.into_wgpu(),
                    blend: cts.blend.map(|b| b.into_wgpu()),
                    write_mask: cts.write_mask.into_wgpu(),
                })
            })
            .collect();

        let multisample = wgpu::MultisampleState {
            count: descriptor.multisample_state.count.into_wgpu(),
            mask: descriptor.multisample_state.mask as u64,
            alpha_to_coverage_enabled: descriptor.multisample_state.alpha_to_coverage_enabled,
        };

        let fragment_entry_point = match (&fs_module, &descriptor.fragment_entry_point) {
            (Some(_), None) => {
                return Err(PipelineError::CompilationFailed {
                    label: descriptor.label.as_deref().map(String::from),
                    details: "fragment module given without an entry point".to_string(),
                }
                .into())
            }
            (_, entry) => entry.as_deref(),
        };

        // 4. Create the pipeline
        let wgpu_pipeline = self.with_wgpu_device("create_render_pipeline", |device| {
            let fallback_layout;
            let layout = match &explicit_layout {
                Some(layout) => layout.as_ref(),
                None => {
                    fallback_layout =
                        device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                            label: descriptor.label.as_deref(),
                            bind_group_layouts: &[],
                            immediate_size: 0,
                        });
                    &fallback_layout
                }
            };

            let pipeline_descriptor = wgpu::RenderPipelineDescriptor {
                label: descriptor.label.as_deref(),
                layout: Some(layout),
                vertex: wgpu::VertexState {
                    module: &vs_module,
                    entry_point: Some(descriptor.vertex_entry_point.as_ref()),
                    buffers: &vertex_buffers,
                    compilation_options: Default::default(),
                },
                fragment: fs_module.as_ref().map(|module| wgpu::FragmentState {
                    module,
                    entry_point: fragment_entry_point,
                    targets: &color_targets,
                    compilation_options: Default::default(),
                }),
                primitive,
                depth_stencil,
                multisample,
                multiview_mask: None,
                cache: None,
            };
            Ok(Arc::new(device.create_render_pipeline(&pipeline_descriptor)))
        })?;

        let id = RenderPipelineId(Self::next_id(&self.internal.next_pipeline_id));
        lock_table(&self.internal.pipelines, "pipelines")?
            .insert(id, WgpuRenderPipelineEntry { wgpu_pipeline });

        log::info!(
            "WgpuDevice: Created render pipeline '{}' with ID: {id:?}",
            label_or_default(descriptor.label.as_deref())
        );
        Ok(id)
    }

    fn destroy_render_pipeline(&self, id: RenderPipelineId) -> Result<(), ResourceError> {
        let mut pipelines = lock_table(&self.internal.pipelines, "pipelines")?;
        if pipelines.remove(&id).is_some() {
            log::debug!("WgpuDevice: Destroyed render pipeline with ID: {id:?}");
            Ok(())
        } else {
            Err(PipelineError::InvalidRenderPipeline { id }.into())
        }
    }

    fn create_pipeline_layout(
        &self,
        descriptor: &PipelineLayoutDescriptor,
    ) -> Result<PipelineLayoutId, ResourceError> {
        log::debug!(
            "WgpuDevice: Creating pipeline layout with label: {:?}",
            descriptor.label
        );
        let group_layouts: Vec<Arc<wgpu::BindGroupLayout>> = {
            let layouts = lock_table(&self.internal.bind_group_layouts, "bind_group_layouts")?;
            descriptor
                .bind_group_layouts
                .iter()
                .map(|id| {
                    layouts
                        .get(id)
                        .map(|entry| Arc::clone(&entry.wgpu_layout))
                        .ok_or_else(|| {
                            ResourceError::Pipeline(PipelineError::LayoutCreationFailed(format!(
                                "bind group layout {id:?} not found"
                            )))
                        })
                })
                .collect::<Result<_, _>>()?
        };
        let group_layout_refs: Vec<Option<&wgpu::BindGroupLayout>> =
            group_layouts.iter().map(|layout| Some(layout.as_ref())).collect();

        let wgpu_layout = self.with_wgpu_device("create_pipeline_layout", |device| {
            Ok(Arc::new(device.create_pipeline_layout(
                &wgpu::PipelineLayoutDescriptor {
                    label: descriptor.label.as_deref(),
                    bind_group_layouts: &group_layout_refs,
                    immediate_size: 0,
                },
            )))
        })?;

        let id = PipelineLayoutId(Self::next_id(&self.internal.next_pipeline_layout_id));
        lock_table(&self.internal.pipeline_layouts, "pipeline_layouts")?
            .insert(id, WgpuPipelineLayoutEntry { wgpu_layout });
        Ok(id)
    }

    fn destroy_pipeline_layout(&self, id: PipelineLayoutId) -> Result<(), ResourceError> {
        let mut layouts = lock_table(&self.internal.pipeline_layouts, "pipeline_layouts")?;
        if layouts.remove(&id).is_some() {
            log::debug!("WgpuDevice: Destroyed pipeline layout with ID: {id:?}");
            Ok(())
        } else {
            Err(ResourceError::NotFound)
        }
    }

    // --- Bind Group Operations ---

    fn create_bind_group_layout(
        &self,
        descriptor: &api_cmd::BindGroupLayoutDescriptor,
    ) -> Result<api_cmd::BindGroupLayoutId, ResourceError> {
        let entries: Vec<wgpu::BindGroupLayoutEntry> = descriptor
            .entries
            .iter()
            .map(|entry| wgpu::BindGroupLayoutEntry {
                binding: entry.binding,
                visibility: entry.visibility.into_wgpu(),
                ty: entry.ty.into_wgpu(),
                count: None,
            })
            .collect();

        let wgpu_layout = self.with_wgpu_device("create_bind_group_layout", |device| {
            Ok(Arc::new(device.create_bind_group_layout(
                &wgpu::BindGroupLayoutDescriptor {
                    label: descriptor.label,
                    entries: &entries,
                },
            )))
        })?;

        let id = api_cmd::BindGroupLayoutId(Self::next_id(
            &self.internal.next_bind_group_layout_id,
        ));
        lock_table(&self.internal.bind_group_layouts, "bind_group_layouts")?
            .insert(id, WgpuBindGroupLayoutEntry { wgpu_layout });
        log::debug!(
            "WgpuDevice: Created bind group layout '{}' ({} entries) with ID: {id:?}",
            label_or_default(descriptor.label),
            entries.len()
        );
        Ok(id)
    }

    fn destroy_bind_group_layout(
        &self,
        id: api_cmd::BindGroupLayoutId,
    ) -> Result<(), ResourceError> {
        let mut layouts = lock_table(&self.internal.bind_group_layouts, "bind_group_layouts")?;
        if layouts.remove(&id).is_some() {
            log::debug!("WgpuDevice: Destroyed bind group layout with ID: {id:?}");
            Ok(())
        } else {
            Err(ResourceError::NotFound)
        }
    }

    fn create_bind_group(
        &self,
        descriptor: &api_cmd::BindGroupDescriptor,
    ) -> Result<api_cmd::BindGroupId, ResourceError> {
        enum Resolved {
            Buffer(Arc<wgpu::Buffer>, u64, Option<std::num::NonZeroU64>),
            View(Arc<wgpu::TextureView>),
            Sampler(Arc<wgpu::Sampler>),
        }

        let layout = lock_table(&self.internal.bind_group_layouts, "bind_group_layouts")?
            .get(&descriptor.layout)
            .map(|entry| Arc::clone(&entry.wgpu_layout))
            .ok_or(ResourceError::NotFound)?;

        let resolved: Vec<(u32, Resolved)> = descriptor
            .entries
            .iter()
            .map(|entry| {
                let resource = match entry.resource {
                    api_cmd::BindingResource::Buffer(binding) => self
                        .get_wgpu_buffer(binding.buffer)
                        .map(|b| Resolved::Buffer(b, binding.offset, binding.size)),
                    api_cmd::BindingResource::TextureView(id) => {
                        self.get_wgpu_texture_view(&id).map(Resolved::View)
                    }
                    api_cmd::BindingResource::Sampler(id) => {
                        self.get_wgpu_sampler(id).map(Resolved::Sampler)
                    }
                };
                resource.map(|r| (entry.binding, r)).ok_or_else(|| {
                    log::error!(
                        "WgpuDevice: bind group '{}' references a missing resource {:?}",
                        label_or_default(descriptor.label),
                        entry.resource
                    );
                    ResourceError::NotFound
                })
            })
            .collect::<Result<_, _>>()?;

        let entries: Vec<wgpu::BindGroupEntry> = resolved
            .iter()
            .map(|(binding, resource)| wgpu::BindGroupEntry {
                binding: *binding,
                resource: match resource {
                    Resolved::Buffer(buffer, offset, size) => {
                        wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                            buffer,
                            offset: *offset,
                            size: *size,
                        })
                    }
                    Resolved::View(view) => wgpu::BindingResource::TextureView(view),
                    Resolved::Sampler(sampler) => wgpu::BindingResource::Sampler(sampler),
                },
            })
            .collect();

        let wgpu_bind_group = self.with_wgpu_device("create_bind_group", |device| {
            Ok(Arc::new(device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: descriptor.label,
                layout: &layout,
                entries: &entries,
            })))
        })?;

        let id = api_cmd::BindGroupId(Self::next_id(&self.internal.next_bind_group_id));
        lock_table(&self.internal.bind_groups, "bind_groups")?
            .insert(id, WgpuBindGroupEntry { wgpu_bind_group });
        log::debug!(
            "WgpuDevice: Created bind group '{}' with ID: {id:?}",
            label_or_default(descriptor.label)
        );
        Ok(id)
    }

    fn destroy_bind_group(&self, id: api_cmd::BindGroupId) -> Result<(), ResourceError> {
        let mut bind_groups = lock_table(&self.internal.bind_groups, "bind_groups")?;
        if bind_groups.remove(&id).is_some() {
            log::debug!("WgpuDevice: Destroyed bind group with ID: {id:?}");
            Ok(())
        } else {
            Err(ResourceError::NotFound)
        }
    }

    // --- Buffer Operations ---

    fn create_buffer(
        &self,
        descriptor: &api_buf::BufferDescriptor,
    ) -> Result<api_buf::BufferId, ResourceError> {
        let wgpu_buffer = self.with_wgpu_device("create_buffer", |device| {
            Ok(Arc::new(device.create_buffer(&wgpu::BufferDescriptor {
                label: descriptor.label.as_deref(),
                size: descriptor.size,
                usage: descriptor.usage.into_wgpu(),
                mapped_at_creation: descriptor.mapped_at_creation,
            })))
        })?;

        let id = api_buf::BufferId(Self::next_id(&self.internal.next_buffer_id));
        lock_table(&self.internal.buffers, "buffers")?.insert(
            id,
            WgpuBufferEntry {
                wgpu_buffer,
                size: descriptor.size,
            },
        );

        log::debug!(
            "WgpuDevice: Created buffer '{}' with ID: {id:?}, size: {} bytes",
            label_or_default(descriptor.label.as_deref()),
            descriptor.size
        );
        Ok(id)
    }

    fn create_buffer_with_data(
        &self,
        descriptor: &api_buf::BufferDescriptor,
        data: &[u8],
    ) -> Result<api_buf::BufferId, ResourceError> {
        let wgpu_buffer = self.with_wgpu_device("create_buffer_with_data", |device| {
            Ok(Arc::new(device.create_buffer_init(
                &wgpu::util::BufferInitDescriptor {
                    label: descriptor.label.as_deref(),
                    contents: data,
                    usage: descriptor.usage.into_wgpu(),
                },
            )))
        })?;

        let id = api_buf::BufferId(Self::next_id(&self.internal.next_buffer_id));
        let size = wgpu_buffer.size();
        lock_table(&self.internal.buffers, "buffers")?
            .insert(id, WgpuBufferEntry { wgpu_buffer, size });

        log::debug!(
            "WgpuDevice: Created buffer '{}' with initial data. ID: {id:?}, size: {size} bytes",
            label_or_default(descriptor.label.as_deref()),
        );
        Ok(id)
    }

    fn destroy_buffer(&self, id: api_buf::BufferId) -> Result<(), ResourceError> {
        let mut buffers = lock_table(&self.internal.buffers, "buffers")?;
        if let Some(entry) = buffers.remove(&id) {
            entry.wgpu_buffer.destroy();
            log::debug!("WgpuDevice: Destroyed buffer with ID: {id:?}");
            Ok(())
        } else {
            Err(ResourceError::NotFound)
        }
    }

    fn write_buffer(
        &self,
        id: api_buf::BufferId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), ResourceError> {
        let buffer = {
            let buffers = lock_table(&self.internal.buffers, "buffers")?;
            let entry = buffers.get(&id).ok_or(ResourceError::NotFound)?;
            if offset + data.len() as u64 > entry.size {
                return Err(ResourceError::OutOfBounds);
            }
            Arc::clone(&entry.wgpu_buffer)
        };

        self.with_wgpu_queue("write_buffer", |queue| {
            queue.write_buffer(&buffer, offset, data);
            Ok(())
        })?;

        log::trace!(
            "WgpuDevice: Wrote {} bytes to buffer ID: {id:?} at offset {offset}",
            data.len()
        );
        Ok(())
    }

    // --- Texture Operations ---

    fn create_texture(
        &self,
        descriptor: &api_tex::TextureDescriptor,
    ) -> Result<api_tex::TextureId, ResourceError> {
        let wgpu_texture = self.with_wgpu_device("create_texture", |device| {
            Ok(Arc::new(device.create_texture(&wgpu::TextureDescriptor {
                label: descriptor.label.as_deref(),
                size: descriptor.size.into_wgpu(),
                mip_level_count: descriptor.mip_level_count,
                sample_count: descriptor.sample_count.into_wgpu(),
                dimension: descriptor.dimension.into_wgpu(),
                format: descriptor.format.into_wgpu(),
                usage: descriptor.usage.into_wgpu(),
                view_formats: &[],
            })))
        })?;

        let id = api_tex::TextureId(Self::next_id(&self.internal.next_texture_id));
        lock_table(&self.internal.textures, "textures")?.insert(
            id,
            WgpuTextureEntry {
                wgpu_texture,
                format: descriptor.format,
            },
        );

        log::debug!(
            "WgpuDevice: Created texture '{}' with ID: {id:?} ({}x{}x{}, {} mips, {:?})",
            label_or_default(descriptor.label.as_deref()),
            descriptor.size.width,
            descriptor.size.height,
            descriptor.size.depth_or_array_layers,
            descriptor.mip_level_count,
            descriptor.format
        );
        Ok(id)
    }

    fn destroy_texture(&self, id: api_tex::TextureId) -> Result<(), ResourceError> {
        let mut textures = lock_table(&self.internal.textures, "textures")?;
        if let Some(entry) = textures.remove(&id) {
            entry.wgpu_texture.destroy();
            log::debug!("WgpuDevice: Destroyed texture with ID: {id:?}");
            Ok(())
        } else {
            Err(ResourceError::NotFound)
        }
    }

    fn write_texture(
        &self,
        texture_id: api_tex::TextureId,
        data: &[u8],
        bytes_per_row: Option<u32>,
        offset: dimension::Origin3D,
        size: dimension::Extent3D,
    ) -> Result<(), ResourceError> {
        let (texture, format) = {
            let textures = lock_table(&self.internal.textures, "textures")?;
            let entry = textures.get(&texture_id).ok_or(ResourceError::NotFound)?;
            (Arc::clone(&entry.wgpu_texture), entry.format)
        };
        if format.is_depth() {
            return Err(ResourceError::BackendError(format!(
                "texture {texture_id:?} has depth format {format:?} and cannot be written from the CPU"
            )));
        }

        self.with_wgpu_queue("write_texture", |queue| {
            queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture: &texture,
                    mip_level: 0,
                    origin: offset.into_wgpu(),
                    aspect: wgpu::TextureAspect::All,
                },
                data,
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row,
                    rows_per_image: None,
                },
                size.into_wgpu(),
            );
            Ok(())
        })?;
        log::debug!(
            "WgpuDevice: Wrote {} bytes to texture ID: {texture_id:?} at offset {offset:?}",
            data.len()
        );
        Ok(())
    }

    fn create_texture_view(
        &self,
        texture_id: api_tex::TextureId,
        descriptor: &api_tex::TextureViewDescriptor,
    ) -> Result<api_tex::TextureViewId, ResourceError> {
        let texture = self
            .get_wgpu_texture(texture_id)
            .ok_or(ResourceError::NotFound)?;

        let wgpu_view = self.with_wgpu_device("create_texture_view", |_| {
            Ok(Arc::new(texture.create_view(&wgpu::TextureViewDescriptor {
                label: descriptor.label.as_deref(),
                format: descriptor.format.map(|f| f.into_wgpu()),
                dimension: descriptor.dimension.map(|d| d.into_wgpu()),
                aspect: descriptor.aspect.into_wgpu(),
                base_mip_level: descriptor.base_mip_level,
                mip_level_count: descriptor.mip_level_count,
                base_array_layer: descriptor.base_array_layer,
                array_layer_count: descriptor.array_layer_count,
                usage: None,
            })))
        })?;

        let id = api_tex::TextureViewId(Self::next_id(&self.internal.next_texture_view_id));
        lock_table(&self.internal.texture_views, "texture_views")?
            .insert(id, WgpuTextureViewEntry { wgpu_view });
        log::debug!(
            "WgpuDevice: Created texture view '{}' for texture ID: {texture_id:?} with ID: {id:?}",
            label_or_default(descriptor.label.as_deref())
        );
        Ok(id)
    }

    fn destroy_texture_view(&self, id: api_tex::TextureViewId) -> Result<(), ResourceError> {
        let mut views = lock_table(&self.internal.texture_views, "texture_views")?;
        if views.remove(&id).is_some() {
            log::debug!("WgpuDevice: Destroyed texture view with ID: {id:?}");
            Ok(())
        } else {
            Err(ResourceError::NotFound)
        }
    }

    fn create_sampler(
        &self,
        descriptor: &api_tex::SamplerDescriptor,
    ) -> Result<api_tex::SamplerId, ResourceError> {
        let wgpu_sampler = self.with_wgpu_device("create_sampler", |device| {
            Ok(Arc::new(device.create_sampler(&wgpu::SamplerDescriptor {
                label: descriptor.label.as_deref(),
                address_mode_u: descriptor.address_mode_u.into_wgpu(),
                address_mode_v: descriptor.address_mode_v.into_wgpu(),
                address_mode_w: descriptor.address_mode_w.into_wgpu(),
                mag_filter: descriptor.mag_filter.into_wgpu(),
                min_filter: descriptor.min_filter.into_wgpu(),
                mipmap_filter: descriptor.mipmap_filter.into_wgpu(),
                lod_min_clamp: descriptor.lod_min_clamp,
                lod_max_clamp: descriptor.lod_max_clamp,
                compare: descriptor.compare.map(|f| f.into_wgpu()),
                anisotropy_clamp: 1,
                border_color: None,
            })))
        })?;

        let id = api_tex::SamplerId(Self::next_id(&self.internal.next_sampler_id));
        lock_table(&self.internal.samplers, "samplers")?
            .insert(id, WgpuSamplerEntry { wgpu_sampler });
        log::debug!(
            "WgpuDevice: Created sampler '{}' with ID: {id:?}",
            label_or_default(descriptor.label.as_deref())
        );
        Ok(id)
    }

    fn destroy_sampler(&self, id: api_tex::SamplerId) -> Result<(), ResourceError> {
        let mut samplers = lock_table(&self.internal.samplers, "samplers")?;
        if samplers.remove(&id).is_some() {
            log::debug!("WgpuDevice: Destroyed sampler with ID: {id:?}");
            Ok(())
        } else {
            Err(ResourceError::NotFound)
        }
    }

    // --- Commands ---

    fn create_command_encoder(&self, label: Option<&str>) -> Box<dyn CommandEncoder> {
        let encoder = self
            .context()
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label });
        Box::new(WgpuCommandEncoder {
            encoder,
            device: self.clone(),
        })
    }

    fn submit_command_buffer(&self, command_buffer_id: api_cmd::CommandBufferId) {
        let buffer = match self.internal.pending_command_buffers.lock() {
            Ok(mut guard) => guard.remove(&command_buffer_id),
            Err(e) => {
                log::error!("WgpuDevice: Mutex poisoned (pending_command_buffers): {e}");
                return;
            }
        };
        match buffer {
            Some(buffer) => {
                self.context().queue.submit(std::iter::once(buffer));
            }
            None => log::error!(
                "WgpuDevice: Attempted to submit a CommandBufferId ({command_buffer_id:?}) that does not exist."
            ),
        }
    }

    // --- Queries ---

    fn get_surface_format(&self) -> Option<TextureFormat> {
        from_wgpu_texture_format(self.context().target_format)
    }

    fn get_adapter_info(&self) -> RendererAdapterInfo {
        let context_guard = self.context();
        RendererAdapterInfo {
            name: context_guard.adapter_name.clone(),
            backend_type: from_wgpu_backend(context_guard.adapter_backend),
            device_type: from_wgpu_device_type(context_guard.adapter_device_type),
        }
    }

    fn supports_feature(&self, feature_name: &str) -> bool {
        match feature_name {
            FEATURE_MULTISAMPLE_X4 => self.context().multisample_x4,
            // Rectangle targets are plain 2D textures addressed in pixels.
            FEATURE_TEXTURE_RECTANGLE => true,
            _ => {
                log::warn!(
                    "WgpuDevice: Unsupported feature_name query in supports_feature: {feature_name}"
                );
                false
            }
        }
    }
}
