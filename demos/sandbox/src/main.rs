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

// Apex Sandbox
// Renders a few frames of the postprocess chain into an off-screen target.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use apex_core::math::{Extent2D, Quaternion, Vec3};
use apex_core::renderer::*;
use apex_infra::{WgpuDevice, WgpuGraphicsContext};
use apex_lanes::{
    CameraInfo, PostprocessChain, PostprocessChainDefinition, PostprocessOutcome,
    DEFAULT_CHAIN_RON,
};

const CHAIN_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/assets/postprocess.ron");
const SETTINGS_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/assets/settings.ron");

const VIEWPORT: Extent2D = Extent2D::new(1280, 720);
const RESIZED: Extent2D = Extent2D::new(960, 540);
const FRAME_COUNT: u32 = 8;

fn load_definition() -> Result<PostprocessChainDefinition> {
    match std::fs::read_to_string(CHAIN_PATH) {
        Ok(source) => {
            log::info!("Sandbox: loading postprocess chain from {CHAIN_PATH}");
            PostprocessChainDefinition::from_ron(&source)
                .with_context(|| format!("invalid chain definition in {CHAIN_PATH}"))
        }
        Err(e) => {
            log::warn!("Sandbox: cannot read {CHAIN_PATH} ({e}); using the built-in chain");
            Ok(PostprocessChainDefinition::from_ron(DEFAULT_CHAIN_RON)?)
        }
    }
}

fn load_settings() -> RenderSettings {
    let parsed = std::fs::read_to_string(SETTINGS_PATH)
        .map_err(anyhow::Error::from)
        .and_then(|source| Ok(ron::from_str::<RenderSettings>(&source)?));
    match parsed {
        Ok(settings) => settings,
        Err(e) => {
            log::warn!("Sandbox: cannot load {SETTINGS_PATH} ({e}); using default settings");
            RenderSettings::default()
        }
    }
}

fn screen_descriptor(size: Extent2D, settings: &RenderSettings) -> FramebufferTextureDescriptor {
    let mut desc = FramebufferTextureDescriptor::new(size.width, size.height, FramebufferFormat::Rgba8);
    desc.multisample = settings.multisample;
    desc
}

/// A camera driving down the track, turning slowly.
fn camera_for_frame(frame: u32, size: Extent2D, settings: &RenderSettings) -> CameraInfo {
    let heading = frame as f32 * 0.05;
    CameraInfo {
        position: Vec3::new(0.0, 1.5, -(frame as f32) * 4.0),
        rotation: Quaternion::from_axis_angle(Vec3::Y, heading).conjugate(),
        fov_degrees: settings.fov_degrees,
        lod_far: settings.lod_far,
        width: size.width,
        height: size.height,
    }
}

fn clear_screen(
    encoder: &mut dyn CommandEncoder,
    attachment: &FramebufferAttachment,
    settings: &RenderSettings,
) {
    let color_attachments = [RenderPassColorAttachment {
        view: &attachment.view,
        resolve_target: attachment.resolve_target.as_ref(),
        ops: Operations {
            load: LoadOp::Clear(settings.clear_color),
            store: StoreOp::Store,
        },
    }];
    let _pass = encoder.begin_render_pass(&RenderPassDescriptor {
        label: Some("Sandbox Screen Clear"),
        color_attachments: &color_attachments,
        depth_stencil_attachment: None,
    });
}

fn render_frame(
    device: &WgpuDevice,
    chain: &mut PostprocessChain,
    screen: &FramebufferTexture,
    settings: &RenderSettings,
) -> Result<Vec<PostprocessOutcome>> {
    let attachment = screen.attach().context("screen target is not initialized")?;
    let mut encoder = device.create_command_encoder(Some("Sandbox Frame"));
    clear_screen(encoder.as_mut(), &attachment, settings);

    let outcomes = if settings.postprocess_enabled {
        chain.render(device, encoder.as_mut(), Some(attachment))
    } else {
        Ok(Vec::new())
    };
    screen.detach();

    device.submit_command_buffer(encoder.finish());
    device.poll_device_blocking();
    Ok(outcomes?)
}

fn main() -> Result<()> {
    use env_logger::{Builder, Env};

    Builder::from_env(Env::default().default_filter_or("info"))
        .filter_module("wgpu_hal", log::LevelFilter::Warn)
        .filter_module("wgpu_core", log::LevelFilter::Error)
        .init();

    let context = WgpuGraphicsContext::new_blocking().context("failed to create the wgpu context")?;
    let device = WgpuDevice::new(Arc::new(Mutex::new(context)));
    let adapter = device.get_adapter_info();
    log::info!(
        "Sandbox: running on \"{}\" ({:?}, {:?})",
        adapter.name,
        adapter.backend_type,
        adapter.device_type
    );

    let settings = load_settings();
    let definition = load_definition()?;

    let screen = FramebufferTexture::new("sandbox screen");
    screen.init(&device, &screen_descriptor(VIEWPORT, &settings))?;

    let mut chain = PostprocessChain::build(&device, &definition, VIEWPORT)?;
    chain.apply_settings(&settings);
    chain.set_sun_direction(Vec3::new(0.3, 0.8, -0.5).normalize());

    let mut size = VIEWPORT;
    let mut result = Ok(());
    for frame in 0..FRAME_COUNT {
        if frame == FRAME_COUNT / 2 {
            size = RESIZED;
            log::info!("Sandbox: resizing to {}x{}", size.width, size.height);
            if let Err(e) = screen
                .init(&device, &screen_descriptor(size, &settings))
                .map_err(anyhow::Error::from)
                .and_then(|()| Ok(chain.resize(&device, size.width, size.height)?))
            {
                result = Err(e);
                break;
            }
        }

        chain.set_camera_info(camera_for_frame(frame, size, &settings));
        match render_frame(&device, &mut chain, &screen, &settings) {
            Ok(outcomes) => {
                let drawn = outcomes
                    .iter()
                    .filter(|o| **o == PostprocessOutcome::Drawn)
                    .count();
                log::info!(
                    "Sandbox: frame {frame} drew {drawn} of {} stages",
                    outcomes.len()
                );
            }
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }

    chain.shutdown(&device);
    screen.deinit(&device);
    log::info!(
        "Sandbox: done, {} command buffers still pending",
        device.pending_command_buffer_count()
    );
    result
}
