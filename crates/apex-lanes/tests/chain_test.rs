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

mod common;

use anyhow::Result;
use apex_core::math::{Extent2D, LinearRgba};
use apex_core::renderer::*;
use apex_lanes::{
    PostprocessChain, PostprocessChainDefinition, PostprocessError, PostprocessOutcome,
    DEFAULT_CHAIN_RON,
};
use common::{screen, MockDevice, PassCommand};

const VIEWPORT: Extent2D = Extent2D::new(1280, 720);

fn default_chain(device: &MockDevice) -> Result<PostprocessChain> {
    let definition = PostprocessChainDefinition::from_ron(DEFAULT_CHAIN_RON)?;
    Ok(PostprocessChain::build(device, &definition, VIEWPORT)?)
}

fn run(device: &MockDevice, chain: &mut PostprocessChain, screen_size: Option<(u32, u32)>) -> Result<Vec<PostprocessOutcome>, PostprocessError> {
    let mut encoder = device.create_command_encoder(Some("chain"));
    let result = chain.render(device, encoder.as_mut(), screen_size.map(|(w, h)| screen(w, h)));
    device.submit_command_buffer(encoder.finish());
    result
}

#[test]
fn default_chain_renders_every_stage() -> Result<()> {
    let device = MockDevice::new();
    let mut chain = default_chain(&device)?;
    assert_eq!(chain.stage_count(), 3);
    assert_eq!(chain.shader_count(), 3);
    assert_eq!(chain.viewport(), VIEWPORT);

    let outcomes = run(&device, &mut chain, Some((1280, 720)))?;
    assert_eq!(outcomes, vec![PostprocessOutcome::Drawn; 3]);

    let sky = device.pass("sky").unwrap();
    assert_eq!(sky.color_load(), Some(LoadOp::Clear(LinearRgba::TRANSPARENT)));
    assert_eq!(sky.depth_load(), Some(LoadOp::Clear(1.0)));
    let fog = device.pass("fog").unwrap();
    assert_eq!(fog.color_load(), Some(LoadOp::Load));
    assert!(fog.depth.is_none());
    let present = device.pass("present").unwrap();
    assert_eq!(present.color[0].0, screen(1280, 720).view);

    for name in ["scene", "scene_depth", "fogged"] {
        let target = chain.target(name).unwrap();
        assert!(!target.is_attached(), "{name} left attached");
        assert!(!target.is_active(), "{name} left bound");
    }
    Ok(())
}

#[test]
fn later_stages_sample_earlier_outputs() -> Result<()> {
    let device = MockDevice::new();
    let mut chain = default_chain(&device)?;
    run(&device, &mut chain, Some((1280, 720)))?;

    let sampled_view = |name: &str| {
        let id = chain.target(name).and_then(|t| t.texture_id()).unwrap();
        device.first_view_of(id).unwrap()
    };
    let fog = device.pass("fog").unwrap();
    let PassCommand::SetBindGroup(1, group) = fog.commands[2] else {
        panic!("fog stage bound no sources");
    };
    let entries = device.bind_group(group).unwrap().entries;
    assert_eq!(
        entries[0].resource,
        BindingResource::TextureView(sampled_view("scene"))
    );
    assert_eq!(
        entries[2].resource,
        BindingResource::TextureView(sampled_view("scene_depth"))
    );
    Ok(())
}

#[test]
fn screen_stage_without_a_screen_fails_cleanly() -> Result<()> {
    let device = MockDevice::new();
    let mut chain = default_chain(&device)?;

    let result = run(&device, &mut chain, None);
    assert!(matches!(result, Err(PostprocessError::MissingTarget)));
    for name in ["scene", "scene_depth", "fogged"] {
        assert!(!chain.target(name).unwrap().is_attached());
    }
    Ok(())
}

#[test]
fn resize_reallocates_targets_and_updates_cameras() -> Result<()> {
    let device = MockDevice::new();
    let definition = PostprocessChainDefinition::from_ron(
        r#"(
            targets: [(name: "half", format: Rgba8, scale: 0.5)],
            stages: [
                (name: "fill", effect: Sky, output: "half"),
                (name: "upscale", effect: Passthrough, inputs: ["half"], output: "screen"),
            ],
        )"#,
    )?;
    let mut chain = PostprocessChain::build(&device, &definition, VIEWPORT)?;
    let half = chain.target("half").unwrap().clone();
    assert_eq!((half.width(), half.height()), (640, 360));

    run(&device, &mut chain, Some((1280, 720)))?;
    assert_eq!(chain.lane("upscale").unwrap().source_bind_group_count(), 1);

    chain.resize(&device, 800, 600)?;
    assert_eq!((half.width(), half.height()), (400, 300));
    assert_eq!(chain.viewport(), Extent2D::new(800, 600));
    let upscale = chain.lane("upscale").unwrap();
    assert_eq!(upscale.source_bind_group_count(), 0);
    assert_eq!((upscale.camera_info().width, upscale.camera_info().height), (800, 600));
    // The resized target plus three placeholders per lane.
    assert_eq!(device.live("texture"), 1 + 3 * 2);

    let outcomes = run(&device, &mut chain, Some((800, 600)))?;
    assert_eq!(outcomes, vec![PostprocessOutcome::Drawn; 2]);
    Ok(())
}

#[test]
fn settings_reach_every_stage() -> Result<()> {
    let device = MockDevice::new();
    let mut chain = default_chain(&device)?;
    let settings: RenderSettings =
        ron::from_str("(default_contrast: 0.8, fov_degrees: 60.0, lod_far: 500.0)")?;
    chain.apply_settings(&settings);

    let fog = chain.lane("fog").unwrap();
    assert_eq!(fog.contrast(), 0.8);
    assert_eq!(fog.camera_info().fov_degrees, 60.0);
    assert_eq!(fog.camera_info().lod_far, 500.0);
    assert_eq!(fog.camera_info().width, VIEWPORT.width);
    // An explicit stage contrast wins over the default.
    assert_eq!(chain.lane("present").unwrap().contrast(), 1.1);
    Ok(())
}

#[test]
fn effects_share_one_shader_module() -> Result<()> {
    let device = MockDevice::new();
    let definition = PostprocessChainDefinition::from_ron(
        r#"(
            targets: [(name: "a", format: Rgba8), (name: "b", format: Rgba8)],
            stages: [
                (name: "one", effect: Passthrough, inputs: ["none"], output: "a"),
                (name: "two", effect: Passthrough, inputs: ["a"], output: "b"),
                (name: "three", effect: Passthrough, inputs: ["b"], output: "screen", blend_mode: Add),
            ],
        )"#,
    )?;
    let chain = PostprocessChain::build(&device, &definition, VIEWPORT)?;
    assert_eq!(chain.shader_count(), 1);
    assert_eq!(device.count("create_shader_module"), 1);
    Ok(())
}

#[test]
fn stage_with_only_empty_inputs_is_skipped() -> Result<()> {
    let device = MockDevice::new();
    let definition = PostprocessChainDefinition::from_ron(
        r#"(
            targets: [(name: "a", format: Rgba8)],
            stages: [(name: "copy", effect: Passthrough, inputs: ["none"], output: "a", clear_color: true)],
        )"#,
    )?;
    let mut chain = PostprocessChain::build(&device, &definition, VIEWPORT)?;
    let outcomes = run(&device, &mut chain, None)?;
    assert_eq!(outcomes, vec![PostprocessOutcome::Skipped]);
    let pass = device.pass("copy").unwrap();
    assert!(pass.commands.is_empty());
    assert_eq!(pass.color_load(), Some(LoadOp::Clear(LinearRgba::TRANSPARENT)));
    Ok(())
}

#[test]
fn shutdown_releases_every_gpu_object() -> Result<()> {
    let device = MockDevice::new();
    let mut chain = default_chain(&device)?;
    run(&device, &mut chain, Some((1280, 720)))?;
    assert!(device.live_total() > 0);

    chain.shutdown(&device);
    assert_eq!(device.live_total(), 0);
    assert_eq!(chain.stage_count(), 0);
    Ok(())
}

#[test]
fn failed_build_leaves_nothing_behind() {
    let device = MockDevice::new();
    // The second stage's index buffer.
    device.fail_on("create_buffer_with_data", 1);
    let definition = PostprocessChainDefinition::from_ron(DEFAULT_CHAIN_RON).unwrap();

    let result = PostprocessChain::build(&device, &definition, VIEWPORT);
    assert!(matches!(result, Err(PostprocessError::Resource(_))));
    assert_eq!(device.live_total(), 0);
}

#[test]
fn multisampled_color_with_depth_output_fails_before_gpu_work() {
    let device = MockDevice::new().with_multisample();
    let definition: PostprocessChainDefinition = ron::from_str(
        r#"(
            targets: [
                (name: "c", format: Rgba8, multisample: 4),
                (name: "d", format: Depth24, multisample: 4),
            ],
            stages: [(name: "sky", effect: Sky, output: "c", depth_output: Some("d"))],
        )"#,
    )
    .unwrap();

    let result = PostprocessChain::build(&device, &definition, Extent2D::new(64, 64));
    assert!(matches!(result, Err(PostprocessError::Definition(_))));
    assert_eq!(device.count("create_texture"), 0);
    assert_eq!(device.live_total(), 0);
}
