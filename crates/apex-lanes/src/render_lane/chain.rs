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

//! A data-driven postprocess chain.
//!
//! The chain is described in RON: a list of off-screen targets and an ordered
//! list of stages, each running one built-in effect from named inputs into a
//! named output. [`PostprocessChain::build`] turns the description into
//! framebuffer textures and one [`PostprocessLane`] per stage.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use apex_core::math::{Extent2D, LinearRgba, Vec3};
use apex_core::renderer::{
    BlendMode, CommandEncoder, DepthMode, FramebufferAttachment, FramebufferFormat,
    FramebufferTexture, FramebufferTextureDescriptor, GraphicsDevice, RenderSettings,
    ResourceError, ShaderModuleDescriptor, ShaderModuleId, ShaderSourceData, TextureSource, TextureTarget,
};
use serde::{Deserialize, Serialize};

use super::error::PostprocessError;
use super::frustum::CameraInfo;
use super::postprocess_lane::{EffectShader, PostprocessLane, PostprocessOutcome, PostprocessTarget};
use super::shaders::EffectKind;

/// Output name that renders into the attachment passed to [`PostprocessChain::render`].
pub const SCREEN_OUTPUT: &str = "screen";
/// Input or output name for an empty slot.
pub const NO_TEXTURE: &str = "none";

/// The chain the sandbox falls back to when no definition file is found.
pub const DEFAULT_CHAIN_RON: &str = r#"(
    targets: [
        (name: "scene", format: Rgba16),
        (name: "scene_depth", format: Depth24),
        (name: "fogged", format: Rgba8),
    ],
    stages: [
        (
            name: "sky",
            effect: Sky,
            output: "scene",
            depth_output: Some("scene_depth"),
            depth_mode: Always,
            clear_color: true,
            clear_depth: true,
        ),
        (
            name: "fog",
            effect: DepthFog,
            inputs: ["scene", "scene_depth"],
            output: "fogged",
        ),
        (
            name: "present",
            effect: Passthrough,
            inputs: ["fogged"],
            output: "screen",
            contrast: Some(1.1),
        ),
    ],
)"#;

fn default_true() -> bool {
    true
}

fn default_one() -> f32 {
    1.0
}

fn default_samples() -> u32 {
    1
}

/// An off-screen target of the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetDefinition {
    /// Name stages refer to.
    pub name: String,
    /// Pixel format.
    pub format: FramebufferFormat,
    /// 2D, rectangle or cubemap.
    #[serde(default)]
    pub target: TextureTarget,
    /// Size relative to the viewport.
    #[serde(default = "default_one")]
    pub scale: f32,
    /// Nearest instead of linear filtering.
    #[serde(default)]
    pub filter_nearest: bool,
    /// Allocate a full mip chain.
    #[serde(default)]
    pub mipmap: bool,
    /// Requested MSAA sample count.
    #[serde(default = "default_samples")]
    pub multisample: u32,
    /// Sample a depth target through a comparison sampler.
    #[serde(default)]
    pub depth_comparison: bool,
}

impl TargetDefinition {
    /// The framebuffer descriptor for a given viewport.
    pub fn descriptor(&self, viewport: Extent2D) -> FramebufferTextureDescriptor {
        let size = viewport.scaled(self.scale);
        FramebufferTextureDescriptor {
            width: size.width,
            height: size.height,
            target: self.target,
            format: self.format,
            filter_nearest: self.filter_nearest,
            mipmap: self.mipmap,
            multisample: self.multisample,
            depth_comparison: self.depth_comparison,
        }
    }
}

/// One stage of the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Debug name.
    pub name: String,
    /// The effect to run.
    pub effect: EffectKind,
    /// Target names bound to the effect's slots, `"none"` for an empty slot.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// A color target name, `"screen"`, or `"none"` for a depth-only stage.
    pub output: String,
    /// A depth target to attach.
    #[serde(default)]
    pub depth_output: Option<String>,
    /// Write the RGB channels.
    #[serde(default = "default_true")]
    pub write_color: bool,
    /// Write the alpha channel.
    #[serde(default = "default_true")]
    pub write_alpha: bool,
    /// Write depth.
    #[serde(default)]
    pub write_depth: bool,
    /// Depth comparison.
    #[serde(default)]
    pub depth_mode: DepthMode,
    /// Clear the color attachment first.
    #[serde(default)]
    pub clear_color: bool,
    /// Clear the depth attachment first.
    #[serde(default)]
    pub clear_depth: bool,
    /// Color used by `clear_color`. Transparent black when absent.
    #[serde(default)]
    pub clear_color_value: Option<LinearRgba>,
    /// Blend mode of the color target.
    #[serde(default)]
    pub blend_mode: BlendMode,
    /// Contrast factor. Falls back to [`RenderSettings::default_contrast`].
    #[serde(default)]
    pub contrast: Option<f32>,
}

/// A complete chain description.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PostprocessChainDefinition {
    /// Off-screen targets.
    #[serde(default)]
    pub targets: Vec<TargetDefinition>,
    /// Stages, run in order.
    #[serde(default)]
    pub stages: Vec<StageDefinition>,
}

impl PostprocessChainDefinition {
    /// Parses and validates a RON description.
    pub fn from_ron(source: &str) -> Result<Self, PostprocessError> {
        let definition: Self =
            ron::from_str(source).map_err(|e| PostprocessError::Definition(e.to_string()))?;
        definition.validate()?;
        Ok(definition)
    }

    /// Checks names and attachment kinds.
    pub fn validate(&self) -> Result<(), PostprocessError> {
        let mut targets: HashMap<&str, &TargetDefinition> = HashMap::new();
        for target in &self.targets {
            let name = target.name.as_str();
            if name == SCREEN_OUTPUT || name == NO_TEXTURE {
                return Err(definition_error(format!("target name '{name}' is reserved")));
            }
            if !(target.scale.is_finite() && target.scale > 0.0) {
                return Err(definition_error(format!(
                    "target '{name}' has invalid scale {}",
                    target.scale
                )));
            }
            if target.target == TextureTarget::Cubemap {
                return Err(definition_error(format!(
                    "target '{name}' is a cubemap, but chain targets follow the viewport and cube faces must be square"
                )));
            }
            if targets.insert(name, target).is_some() {
                return Err(definition_error(format!("target '{name}' is defined twice")));
            }
        }

        for stage in &self.stages {
            let lookup = |name: &str| {
                targets.get(name).copied().ok_or_else(|| {
                    definition_error(format!(
                        "stage '{}' references unknown target '{name}'",
                        stage.name
                    ))
                })
            };

            let mut written = HashSet::new();
            let mut color_samples = 1;
            match stage.output.as_str() {
                SCREEN_OUTPUT | NO_TEXTURE => {}
                name => {
                    let output = lookup(name)?;
                    if output.format.is_depth() {
                        return Err(definition_error(format!(
                            "stage '{}' uses depth target '{name}' as its color output",
                            stage.name
                        )));
                    }
                    color_samples = output.multisample;
                    written.insert(name);
                }
            }
            if let Some(name) = stage.depth_output.as_deref() {
                if !lookup(name)?.format.is_depth() {
                    return Err(definition_error(format!(
                        "stage '{}' uses color target '{name}' as its depth output",
                        stage.name
                    )));
                }
                // Depth targets are always single-sampled.
                if color_samples > 1 {
                    return Err(definition_error(format!(
                        "stage '{}' pairs multisampled color output '{}' with depth output '{name}', which is single-sampled",
                        stage.name, stage.output
                    )));
                }
                written.insert(name);
            }
            if stage.output == NO_TEXTURE && stage.depth_output.is_none() {
                return Err(definition_error(format!(
                    "stage '{}' has no output",
                    stage.name
                )));
            }

            for input in &stage.inputs {
                if input == NO_TEXTURE {
                    continue;
                }
                lookup(input)?;
                if written.contains(input.as_str()) {
                    return Err(definition_error(format!(
                        "stage '{}' reads '{input}' while rendering into it",
                        stage.name
                    )));
                }
            }
        }
        Ok(())
    }
}

fn definition_error(message: String) -> PostprocessError {
    log::error!("PostprocessChain: {message}");
    PostprocessError::Definition(message)
}

#[derive(Debug)]
struct ChainTarget {
    definition: TargetDefinition,
    texture: Arc<FramebufferTexture>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageOutput {
    Screen,
    Target(usize),
    DepthOnly,
}

#[derive(Debug)]
struct ChainStage {
    name: String,
    contrast: Option<f32>,
    lane: PostprocessLane,
    output: StageOutput,
    depth_output: Option<usize>,
}

/// Detaches every attached target when dropped.
struct AttachedTargets<'a>(Vec<&'a FramebufferTexture>);

impl<'a> AttachedTargets<'a> {
    fn attach(&mut self, texture: &'a FramebufferTexture) -> Result<FramebufferAttachment, ResourceError> {
        let attachment = texture.attach()?;
        self.0.push(texture);
        Ok(attachment)
    }
}

impl Drop for AttachedTargets<'_> {
    fn drop(&mut self) {
        for texture in self.0.drain(..) {
            texture.detach();
        }
    }
}

/// The runtime form of a [`PostprocessChainDefinition`].
#[derive(Debug)]
pub struct PostprocessChain {
    targets: Vec<ChainTarget>,
    stages: Vec<ChainStage>,
    shaders: HashMap<EffectKind, ShaderModuleId>,
    viewport: Extent2D,
    camera: CameraInfo,
}

impl PostprocessChain {
    /// Creates the targets, shaders and lanes of `definition`.
    ///
    /// Everything created so far is released again if a step fails.
    pub fn build(
        device: &dyn GraphicsDevice,
        definition: &PostprocessChainDefinition,
        viewport: Extent2D,
    ) -> Result<Self, PostprocessError> {
        definition.validate()?;

        let mut chain = Self {
            targets: Vec::with_capacity(definition.targets.len()),
            stages: Vec::with_capacity(definition.stages.len()),
            shaders: HashMap::new(),
            viewport,
            camera: CameraInfo {
                width: viewport.width,
                height: viewport.height,
                ..Default::default()
            },
        };
        if let Err(e) = chain.populate(device, definition) {
            chain.shutdown(device);
            return Err(e);
        }
        log::info!(
            "PostprocessChain: built {} targets and {} stages at {}x{}",
            chain.targets.len(),
            chain.stages.len(),
            viewport.width,
            viewport.height
        );
        Ok(chain)
    }

    fn populate(
        &mut self,
        device: &dyn GraphicsDevice,
        definition: &PostprocessChainDefinition,
    ) -> Result<(), PostprocessError> {
        // 1. Targets
        let mut indices = HashMap::new();
        for target in &definition.targets {
            let texture = Arc::new(FramebufferTexture::new(target.name.clone()));
            texture
                .init(device, &target.descriptor(self.viewport))
                .map_err(ResourceError::from)?;
            indices.insert(target.name.as_str(), self.targets.len());
            self.targets.push(ChainTarget {
                definition: target.clone(),
                texture,
            });
        }
        let index_of = |name: &str| {
            indices
                .get(name)
                .copied()
                .ok_or_else(|| PostprocessError::Definition(format!("unknown target '{name}'")))
        };

        // 2. Shaders, once per effect
        for stage in &definition.stages {
            if self.shaders.contains_key(&stage.effect) {
                continue;
            }
            let module = device.create_shader_module(&ShaderModuleDescriptor {
                label: Some(stage.effect.label()),
                source: ShaderSourceData::Wgsl(stage.effect.source().into()),
            })?;
            self.shaders.insert(stage.effect, module);
        }

        // 3. Lanes
        for stage in &definition.stages {
            let mut sources: Vec<Option<Arc<dyn TextureSource>>> = Vec::new();
            for input in &stage.inputs {
                if input == NO_TEXTURE {
                    sources.push(None);
                } else {
                    let texture = Arc::clone(&self.targets[index_of(input)?].texture);
                    sources.push(Some(texture as Arc<dyn TextureSource>));
                }
            }
            let output = match stage.output.as_str() {
                SCREEN_OUTPUT => StageOutput::Screen,
                NO_TEXTURE => StageOutput::DepthOnly,
                name => StageOutput::Target(index_of(name)?),
            };
            let depth_output = stage.depth_output.as_deref().map(index_of).transpose()?;
            let module = self.shaders.get(&stage.effect).copied().ok_or_else(|| {
                PostprocessError::Definition(format!("no shader for {:?}", stage.effect))
            })?;

            let mut lane = PostprocessLane::new(stage.name.clone());
            lane.set_source_textures(sources);
            lane.set_shader(EffectShader::from_effect(module, stage.effect));
            lane.set_write_color(stage.write_color);
            lane.set_write_alpha(stage.write_alpha);
            lane.set_write_depth(stage.write_depth);
            lane.set_depth_mode(stage.depth_mode);
            lane.set_clear(stage.clear_color, stage.clear_depth);
            if let Some(color) = stage.clear_color_value {
                lane.set_clear_color(color);
            }
            lane.set_blend_mode(stage.blend_mode);
            lane.set_contrast(
                stage
                    .contrast
                    .unwrap_or(RenderSettings::default().default_contrast),
            );
            lane.set_camera_info(self.camera);

            lane.on_gpu_init(device)?;
            self.stages.push(ChainStage {
                name: stage.name.clone(),
                contrast: stage.contrast,
                lane,
                output,
                depth_output,
            });
        }
        Ok(())
    }

    /// Re-initializes every target at its scaled size for a new viewport.
    pub fn resize(
        &mut self,
        device: &dyn GraphicsDevice,
        width: u32,
        height: u32,
    ) -> Result<(), PostprocessError> {
        self.viewport = Extent2D::new(width, height);
        for target in &self.targets {
            target
                .texture
                .init(device, &target.definition.descriptor(self.viewport))
                .map_err(ResourceError::from)?;
        }
        for stage in &mut self.stages {
            stage.lane.release_source_bind_groups(device);
        }
        self.camera.width = width;
        self.camera.height = height;
        self.set_camera_info(self.camera);
        log::info!("PostprocessChain: resized to {width}x{height}");
        Ok(())
    }

    /// Applies the global settings: the camera projection of every stage and
    /// the contrast of stages that do not set their own.
    pub fn apply_settings(&mut self, settings: &RenderSettings) {
        self.camera.fov_degrees = settings.fov_degrees;
        self.camera.lod_far = settings.lod_far;
        for stage in &mut self.stages {
            stage.lane.set_camera_info(self.camera);
            if stage.contrast.is_none() {
                stage.lane.set_contrast(settings.default_contrast);
            }
        }
    }

    /// Passes the camera to every stage.
    pub fn set_camera_info(&mut self, camera: CameraInfo) {
        self.camera = camera;
        for stage in &mut self.stages {
            stage.lane.set_camera_info(camera);
        }
    }

    /// Passes the sun direction to every stage.
    pub fn set_sun_direction(&mut self, direction: Vec3) {
        for stage in &mut self.stages {
            stage.lane.set_sun_direction(direction);
        }
    }

    /// Runs every stage in order.
    ///
    /// Output targets are attached for the duration of their stage only, so
    /// they can be sampled by later stages and re-initialized between frames.
    pub fn render(
        &mut self,
        device: &dyn GraphicsDevice,
        encoder: &mut dyn CommandEncoder,
        screen: Option<FramebufferAttachment>,
    ) -> Result<Vec<PostprocessOutcome>, PostprocessError> {
        let targets = &self.targets;
        let mut outcomes = Vec::with_capacity(self.stages.len());
        for stage in self.stages.iter_mut() {
            let mut attached = AttachedTargets(Vec::new());
            let color = match stage.output {
                StageOutput::Screen => {
                    Some(screen.ok_or(PostprocessError::MissingTarget)?)
                }
                StageOutput::Target(index) => Some(attached.attach(&targets[index].texture)?),
                StageOutput::DepthOnly => None,
            };
            let depth = match stage.depth_output {
                Some(index) => Some(attached.attach(&targets[index].texture)?),
                None => None,
            };

            let outcome = stage
                .lane
                .render(device, encoder, &PostprocessTarget { color, depth })?;
            log::trace!("PostprocessChain: stage '{}' {outcome:?}", stage.name);
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Releases every lane, target and shader.
    pub fn shutdown(&mut self, device: &dyn GraphicsDevice) {
        for stage in &mut self.stages {
            stage.lane.on_gpu_shutdown(device);
        }
        self.stages.clear();
        for target in self.targets.drain(..) {
            target.texture.deinit(device);
        }
        for (_, module) in self.shaders.drain() {
            if let Err(e) = device.destroy_shader_module(module) {
                log::warn!("PostprocessChain: Failed to destroy shader module: {:?}", e);
            }
        }
        log::info!("PostprocessChain: shut down");
    }

    /// The current viewport.
    pub fn viewport(&self) -> Extent2D {
        self.viewport
    }

    /// Number of stages.
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Number of compiled effect shaders.
    pub fn shader_count(&self) -> usize {
        self.shaders.len()
    }

    /// The texture behind a named target.
    pub fn target(&self, name: &str) -> Option<&Arc<FramebufferTexture>> {
        self.targets
            .iter()
            .find(|target| target.definition.name == name)
            .map(|target| &target.texture)
    }

    /// The lane of a named stage.
    pub fn lane(&self, name: &str) -> Option<&PostprocessLane> {
        self.stages
            .iter()
            .find(|stage| stage.name == name)
            .map(|stage| &stage.lane)
    }
}
