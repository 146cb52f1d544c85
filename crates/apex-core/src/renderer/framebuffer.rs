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

//! Off-screen render targets that later passes attach to and sample from.
//!
//! A [`FramebufferTexture`] owns a GPU texture, the views used to render into it
//! and to sample it, and its sampler. It is shared behind an `Arc` between the
//! pass that writes it and the passes that read it, so its state sits behind a
//! mutex and every method takes `&self`.
//!
//! The texture refuses to be re-created while it is attached: a target must be
//! detached between frames before it can be resized.

use crate::math::Extent3D;
use crate::renderer::api::pipeline::CompareFunction;
use crate::renderer::api::texture::{
    full_mip_chain_len, AddressMode, FilterMode, ImageAspect, MipmapFilterMode,
    SamplerDescriptor, SamplerId, TextureDescriptor, TextureDimension, TextureId, TextureUsage,
    TextureViewDescriptor, TextureViewDimension, TextureViewId,
};
use crate::renderer::api::util::{SampleCount, TextureFormat};
use crate::renderer::error::{FramebufferError, ResourceError};
use crate::renderer::traits::{
    BindingKind, GraphicsDevice, SampleKind, TextureBinding, TextureSource,
    FEATURE_MULTISAMPLE_X4, FEATURE_TEXTURE_RECTANGLE,
};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::{Mutex, MutexGuard, PoisonError};

const STAGE_GENERATION: &str = "FBTEX texture generation";
const STAGE_STORAGE: &str = "FBTEX texture storage initialization";
const STAGE_SETUP: &str = "FBTEX texture setup";
const STAGE_MIPMAP: &str = "FBTEX initial mipmap generation";

/// Pixel formats a framebuffer texture can be created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FramebufferFormat {
    /// Single-channel luminance.
    Lum8,
    /// 8-bit color. Stored with an alpha channel that is ignored.
    Rgb8,
    /// 8-bit color with alpha.
    Rgba8,
    /// Half-float color. Stored with an alpha channel that is ignored.
    Rgb16,
    /// Half-float color with alpha.
    Rgba16,
    /// 24-bit depth.
    Depth24,
}

impl FramebufferFormat {
    /// The GPU format backing this framebuffer format.
    pub fn texture_format(&self) -> TextureFormat {
        match self {
            FramebufferFormat::Lum8 => TextureFormat::R8Unorm,
            FramebufferFormat::Rgb8 | FramebufferFormat::Rgba8 => TextureFormat::Rgba8Unorm,
            FramebufferFormat::Rgb16 | FramebufferFormat::Rgba16 => TextureFormat::Rgba16Float,
            FramebufferFormat::Depth24 => TextureFormat::Depth24Plus,
        }
    }

    /// Returns `true` for depth formats.
    pub fn is_depth(&self) -> bool {
        matches!(self, FramebufferFormat::Depth24)
    }
}

/// The kind of image a framebuffer texture is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TextureTarget {
    /// A regular 2D texture addressed in `[0, 1]`.
    #[default]
    Texture2D,
    /// A 2D texture addressed in pixels. Never mipmapped.
    Rectangle,
    /// Six square faces.
    Cubemap,
}

/// Parameters for [`FramebufferTexture::init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferTextureDescriptor {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// 2D, rectangle or cubemap.
    pub target: TextureTarget,
    /// Pixel format.
    pub format: FramebufferFormat,
    /// Sample with nearest filtering instead of linear.
    pub filter_nearest: bool,
    /// Allocate a full mip chain.
    pub mipmap: bool,
    /// Requested MSAA sample count. Values above 1 need device support.
    pub multisample: u32,
    /// For depth formats, sample through a `LessEqual` comparison sampler.
    pub depth_comparison: bool,
}

impl FramebufferTextureDescriptor {
    /// A single-sample, linearly filtered 2D target without mips.
    pub fn new(width: u32, height: u32, format: FramebufferFormat) -> Self {
        Self {
            width,
            height,
            target: TextureTarget::Texture2D,
            format,
            filter_nearest: false,
            mipmap: false,
            multisample: 1,
            depth_comparison: false,
        }
    }
}

/// What a pass needs to render into an attached framebuffer texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferAttachment {
    /// The view to render into. Multisampled when MSAA is on.
    pub view: TextureViewId,
    /// The single-sample view that receives the resolved image, when MSAA is on.
    pub resolve_target: Option<TextureViewId>,
    /// Format of `view`.
    pub format: TextureFormat,
    /// Sample count of `view`.
    pub sample_count: SampleCount,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl FramebufferAttachment {
    /// Returns `true` when this attachment is a depth image.
    pub fn is_depth(&self) -> bool {
        self.format.is_depth()
    }
}

#[derive(Debug, Clone, Copy)]
enum Created {
    Texture(TextureId),
    View(TextureViewId),
    Sampler(SamplerId),
}

fn release_all(device: &dyn GraphicsDevice, created: &[Created]) {
    for object in created.iter().rev() {
        let result = match *object {
            Created::Sampler(id) => device.destroy_sampler(id),
            Created::View(id) => device.destroy_texture_view(id),
            Created::Texture(id) => device.destroy_texture(id),
        };
        if let Err(e) = result {
            log::warn!("FramebufferTexture: failed to release {object:?}: {e}");
        }
    }
}

#[derive(Debug)]
struct GpuTexture {
    texture: TextureId,
    sampled_view: TextureViewId,
    render_view: TextureViewId,
    msaa: Option<(TextureId, TextureViewId)>,
    sampler: SamplerId,
    mip_level_count: u32,
    sample_count: SampleCount,
    created: Vec<Created>,
}

#[derive(Debug, Default)]
struct FramebufferState {
    desc: Option<FramebufferTextureDescriptor>,
    gpu: Option<GpuTexture>,
    bound: bool,
    attached: bool,
}

/// An off-screen color or depth target.
#[derive(Debug)]
pub struct FramebufferTexture {
    label: String,
    state: Mutex<FramebufferState>,
}

impl FramebufferTexture {
    /// Creates an uninitialised texture. Nothing is allocated until [`FramebufferTexture::init`].
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: Mutex::new(FramebufferState::default()),
        }
    }

    // The state only holds ids and flags, so a panic elsewhere cannot leave it half-written.
    fn state(&self) -> MutexGuard<'_, FramebufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The debug label given at construction.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Allocates the GPU storage, views and sampler.
    ///
    /// Re-initialising an initialised texture releases the old storage first.
    ///
    /// # Errors
    ///
    /// - [`FramebufferError::Attached`] if the texture is attached. Nothing is changed.
    /// - [`FramebufferError::InvalidSize`] for a zero width or height, or a
    ///   cubemap whose faces would not be square.
    /// - [`FramebufferError::UnsupportedTarget`] for a rectangle target the device cannot back.
    /// - [`FramebufferError::Resource`] if a device call fails. Partially created
    ///   objects are released and the texture is left uninitialised.
    pub fn init(
        &self,
        device: &dyn GraphicsDevice,
        desc: &FramebufferTextureDescriptor,
    ) -> Result<(), FramebufferError> {
        let mut state = self.state();
        if state.attached {
            log::error!(
                "FramebufferTexture: '{}' is attached to a render target; refusing to re-initialize",
                self.label
            );
            return Err(FramebufferError::Attached);
        }
        if let Some(gpu) = state.gpu.take() {
            release_all(device, &gpu.created);
            state.bound = false;
        }
        state.desc = None;

        // Cube faces are square.
        if desc.width == 0
            || desc.height == 0
            || (desc.target == TextureTarget::Cubemap && desc.width != desc.height)
        {
            log::error!(
                "FramebufferTexture: '{}' cannot be created at {}x{} as {:?}",
                self.label,
                desc.width,
                desc.height,
                desc.target
            );
            return Err(FramebufferError::InvalidSize {
                width: desc.width,
                height: desc.height,
            });
        }
        if desc.target == TextureTarget::Rectangle
            && !device.supports_feature(FEATURE_TEXTURE_RECTANGLE)
        {
            return Err(FramebufferError::UnsupportedTarget(desc.target));
        }

        let sample_count = self.resolve_sample_count(device, desc);
        let gpu = self.create_gpu_objects(device, desc, sample_count)?;
        log::info!(
            "FramebufferTexture: '{}' initialized {}x{} {:?} {:?} ({} mips, {} samples)",
            self.label,
            desc.width,
            desc.height,
            desc.target,
            desc.format,
            gpu.mip_level_count,
            gpu.sample_count.count()
        );
        state.gpu = Some(gpu);
        state.desc = Some(*desc);
        Ok(())
    }

    fn resolve_sample_count(
        &self,
        device: &dyn GraphicsDevice,
        desc: &FramebufferTextureDescriptor,
    ) -> SampleCount {
        if desc.multisample <= 1 {
            return SampleCount::X1;
        }
        if !device.supports_feature(FEATURE_MULTISAMPLE_X4) {
            log::warn!(
                "FramebufferTexture: '{}' requested {} samples but the device has no multisample support; using 1",
                self.label,
                desc.multisample
            );
            return SampleCount::X1;
        }
        if desc.format.is_depth() || desc.target == TextureTarget::Cubemap {
            log::warn!(
                "FramebufferTexture: '{}' cannot resolve a multisampled {:?} {:?} target; using 1 sample",
                self.label,
                desc.target,
                desc.format
            );
            return SampleCount::X1;
        }
        SampleCount::from_requested(desc.multisample)
    }

    fn create_gpu_objects(
        &self,
        device: &dyn GraphicsDevice,
        desc: &FramebufferTextureDescriptor,
        sample_count: SampleCount,
    ) -> Result<GpuTexture, FramebufferError> {
        let mut created = Vec::new();
        let result = self.create_gpu_objects_inner(device, desc, sample_count, &mut created);
        if result.is_err() {
            release_all(device, &created);
        }
        result.map(|mut gpu| {
            gpu.created = created;
            gpu
        })
    }

    fn create_gpu_objects_inner(
        &self,
        device: &dyn GraphicsDevice,
        desc: &FramebufferTextureDescriptor,
        sample_count: SampleCount,
        created: &mut Vec<Created>,
    ) -> Result<GpuTexture, FramebufferError> {
        let format = desc.format.texture_format();
        let is_cube = desc.target == TextureTarget::Cubemap;
        let mip_level_count = if desc.mipmap && desc.target != TextureTarget::Rectangle {
            full_mip_chain_len(desc.width, desc.height)
        } else {
            1
        };

        log::debug!("FramebufferTexture: '{}' {STAGE_GENERATION}", self.label);
        let texture = device
            .create_texture(&TextureDescriptor {
                label: Some(Cow::Borrowed(self.label.as_str())),
                size: Extent3D {
                    width: desc.width,
                    height: desc.height,
                    depth_or_array_layers: if is_cube { 6 } else { 1 },
                },
                mip_level_count,
                sample_count: SampleCount::X1,
                dimension: TextureDimension::D2,
                format,
                usage: TextureUsage::RENDER_ATTACHMENT
                    | TextureUsage::TEXTURE_BINDING
                    | TextureUsage::COPY_SRC
                    | TextureUsage::COPY_DST,
            })
            .map_err(self.stage_error(STAGE_GENERATION))?;
        created.push(Created::Texture(texture));

        log::debug!("FramebufferTexture: '{}' {STAGE_STORAGE}", self.label);
        let sampled_view = device
            .create_texture_view(
                texture,
                &TextureViewDescriptor {
                    label: Some(Cow::Owned(format!("{} sampled view", self.label))),
                    dimension: Some(if is_cube {
                        TextureViewDimension::Cube
                    } else {
                        TextureViewDimension::D2
                    }),
                    aspect: if format.is_depth() {
                        ImageAspect::DepthOnly
                    } else {
                        ImageAspect::All
                    },
                    ..Default::default()
                },
            )
            .map_err(self.stage_error(STAGE_STORAGE))?;
        created.push(Created::View(sampled_view));

        let render_view = device
            .create_texture_view(
                texture,
                &TextureViewDescriptor {
                    label: Some(Cow::Owned(format!("{} render view", self.label))),
                    dimension: Some(TextureViewDimension::D2),
                    mip_level_count: Some(1),
                    array_layer_count: Some(1),
                    ..Default::default()
                },
            )
            .map_err(self.stage_error(STAGE_STORAGE))?;
        created.push(Created::View(render_view));

        let msaa = if sample_count != SampleCount::X1 {
            let msaa_texture = device
                .create_texture(&TextureDescriptor {
                    label: Some(Cow::Owned(format!("{} msaa", self.label))),
                    size: Extent3D {
                        width: desc.width,
                        height: desc.height,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count,
                    dimension: TextureDimension::D2,
                    format,
                    usage: TextureUsage::RENDER_ATTACHMENT,
                })
                .map_err(self.stage_error(STAGE_STORAGE))?;
            created.push(Created::Texture(msaa_texture));
            let msaa_view = device
                .create_texture_view(msaa_texture, &TextureViewDescriptor::default())
                .map_err(self.stage_error(STAGE_STORAGE))?;
            created.push(Created::View(msaa_view));
            Some((msaa_texture, msaa_view))
        } else {
            None
        };

        log::debug!("FramebufferTexture: '{}' {STAGE_SETUP}", self.label);
        // Depth is read unfiltered unless it goes through a comparison sampler.
        let nearest =
            desc.filter_nearest || (desc.format.is_depth() && !desc.depth_comparison);
        let (filter, mipmap_filter) = if nearest {
            (FilterMode::Nearest, MipmapFilterMode::Nearest)
        } else {
            (FilterMode::Linear, MipmapFilterMode::Linear)
        };
        let sampler = device
            .create_sampler(&SamplerDescriptor {
                label: Some(Cow::Owned(format!("{} sampler", self.label))),
                address_mode_u: AddressMode::ClampToEdge,
                address_mode_v: AddressMode::ClampToEdge,
                address_mode_w: AddressMode::ClampToEdge,
                mag_filter: filter,
                min_filter: filter,
                mipmap_filter,
                lod_min_clamp: 0.0,
                lod_max_clamp: mip_level_count as f32,
                compare: (desc.format.is_depth() && desc.depth_comparison)
                    .then_some(CompareFunction::LessEqual),
            })
            .map_err(self.stage_error(STAGE_SETUP))?;
        created.push(Created::Sampler(sampler));

        if mip_level_count > 1 {
            log::debug!(
                "FramebufferTexture: '{}' {STAGE_MIPMAP}: {mip_level_count} levels allocated",
                self.label
            );
        }

        Ok(GpuTexture {
            texture,
            sampled_view,
            render_view,
            msaa,
            sampler,
            mip_level_count,
            sample_count,
            created: Vec::new(),
        })
    }

    fn stage_error(&self, stage: &'static str) -> impl Fn(ResourceError) -> FramebufferError + '_ {
        move |source| {
            log::error!("FramebufferTexture: '{}' {stage} failed: {source}", self.label);
            FramebufferError::Resource { stage, source }
        }
    }

    /// Releases the GPU storage. Does nothing if the texture is not initialised.
    pub fn deinit(&self, device: &dyn GraphicsDevice) {
        let mut state = self.state();
        let Some(gpu) = state.gpu.take() else {
            return;
        };
        if state.attached || state.bound {
            log::warn!(
                "FramebufferTexture: '{}' released while still in use (attached: {}, bound: {})",
                self.label,
                state.attached,
                state.bound
            );
        }
        release_all(device, &gpu.created);
        state.bound = false;
        state.attached = false;
        state.desc = None;
        log::debug!("FramebufferTexture: '{}' released", self.label);
    }

    /// Marks the texture bound and returns its sampled view and sampler.
    ///
    /// # Errors
    ///
    /// Returns [`FramebufferError::NotInitialized`] when there is no GPU storage.
    pub fn activate(&self) -> Result<TextureBinding, FramebufferError> {
        let mut state = self.state();
        let kind = Self::kind_of(state.desc.as_ref());
        let gpu = state.gpu.as_ref().ok_or(FramebufferError::NotInitialized)?;
        let binding = TextureBinding {
            view: gpu.sampled_view,
            sampler: gpu.sampler,
            kind,
        };
        state.bound = true;
        Ok(binding)
    }

    /// Clears the bound flag.
    pub fn deactivate(&self) {
        self.state().bound = false;
    }

    /// Marks the texture attached and returns the views to render into.
    ///
    /// # Errors
    ///
    /// Returns [`FramebufferError::NotInitialized`] when there is no GPU storage.
    pub fn attach(&self) -> Result<FramebufferAttachment, FramebufferError> {
        let mut state = self.state();
        let (Some(gpu), Some(desc)) = (state.gpu.as_ref(), state.desc.as_ref()) else {
            return Err(FramebufferError::NotInitialized);
        };
        let attachment = match gpu.msaa {
            Some((_, msaa_view)) => FramebufferAttachment {
                view: msaa_view,
                resolve_target: Some(gpu.render_view),
                format: desc.format.texture_format(),
                sample_count: gpu.sample_count,
                width: desc.width,
                height: desc.height,
            },
            None => FramebufferAttachment {
                view: gpu.render_view,
                resolve_target: None,
                format: desc.format.texture_format(),
                sample_count: SampleCount::X1,
                width: desc.width,
                height: desc.height,
            },
        };
        state.attached = true;
        Ok(attachment)
    }

    /// Clears the attached flag.
    pub fn detach(&self) {
        self.state().attached = false;
    }

    fn kind_of(desc: Option<&FramebufferTextureDescriptor>) -> BindingKind {
        let Some(desc) = desc else {
            return BindingKind::default();
        };
        let sample = match (desc.format.is_depth(), desc.depth_comparison) {
            (false, _) => SampleKind::Float,
            (true, false) => SampleKind::Depth,
            (true, true) => SampleKind::DepthComparison,
        };
        let dimension = if desc.target == TextureTarget::Cubemap {
            TextureViewDimension::Cube
        } else {
            TextureViewDimension::D2
        };
        BindingKind { sample, dimension }
    }

    /// Returns `true` once GPU storage exists.
    pub fn is_initialized(&self) -> bool {
        self.state().gpu.is_some()
    }

    /// Returns `true` between [`attach`](Self::attach) and [`detach`](Self::detach).
    pub fn is_attached(&self) -> bool {
        self.state().attached
    }

    /// Returns `true` between [`activate`](Self::activate) and [`deactivate`](Self::deactivate).
    pub fn is_active(&self) -> bool {
        self.state().bound
    }

    /// Width in pixels, or 0 when uninitialised.
    pub fn width(&self) -> u32 {
        self.state().desc.map_or(0, |d| d.width)
    }

    /// Height in pixels, or 0 when uninitialised.
    pub fn height(&self) -> u32 {
        self.state().desc.map_or(0, |d| d.height)
    }

    /// The framebuffer format, once initialised.
    pub fn format(&self) -> Option<FramebufferFormat> {
        self.state().desc.map(|d| d.format)
    }

    /// The target kind, once initialised.
    pub fn target(&self) -> Option<TextureTarget> {
        self.state().desc.map(|d| d.target)
    }

    /// Returns `true` for rectangle targets.
    pub fn is_rect(&self) -> bool {
        self.target() == Some(TextureTarget::Rectangle)
    }

    /// Number of allocated mip levels, or 0 when uninitialised.
    pub fn mip_level_count(&self) -> u32 {
        self.state().gpu.as_ref().map_or(0, |g| g.mip_level_count)
    }

    /// Sample count of the render attachment.
    pub fn sample_count(&self) -> SampleCount {
        self.state()
            .gpu
            .as_ref()
            .map_or(SampleCount::X1, |g| g.sample_count)
    }

    /// The single-sample texture that is sampled, once initialised.
    pub fn texture_id(&self) -> Option<TextureId> {
        self.state().gpu.as_ref().map(|g| g.texture)
    }
}

impl TextureSource for FramebufferTexture {
    fn activate(&self) -> Result<TextureBinding, ResourceError> {
        FramebufferTexture::activate(self).map_err(ResourceError::from)
    }

    fn deactivate(&self) {
        FramebufferTexture::deactivate(self);
    }

    fn is_rect(&self) -> bool {
        FramebufferTexture::is_rect(self)
    }

    fn width(&self) -> u32 {
        FramebufferTexture::width(self)
    }

    fn height(&self) -> u32 {
        FramebufferTexture::height(self)
    }

    fn binding_kind(&self) -> BindingKind {
        Self::kind_of(self.state().desc.as_ref())
    }
}
