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

use apex_core::math::{LinearRgba, Vec3};
use apex_core::renderer::*;
use apex_lanes::shaders::EffectKind;
use apex_lanes::{
    CameraInfo, EffectShader, PostprocessError, PostprocessLane, PostprocessOutcome,
    PostprocessTarget, PostprocessUniforms, PostprocessVertex,
};
use common::{depth_attachment, screen, MockDevice, MockSource, PassCommand};
use std::sync::Arc;

const LABEL: &str = "test stage";

fn compile(device: &MockDevice, effect: EffectKind) -> ShaderModuleId {
    device
        .create_shader_module(&ShaderModuleDescriptor {
            label: Some(effect.label()),
            source: ShaderSourceData::Wgsl(effect.source().into()),
        })
        .unwrap()
}

fn lane_with(
    device: &MockDevice,
    effect: EffectKind,
    sources: Vec<Option<Arc<dyn TextureSource>>>,
) -> PostprocessLane {
    let module = compile(device, effect);
    let mut lane = PostprocessLane::new(LABEL);
    lane.set_source_textures(sources);
    lane.set_shader(EffectShader::from_effect(module, effect));
    lane.on_gpu_init(device).unwrap();
    lane
}

fn render(
    device: &MockDevice,
    lane: &mut PostprocessLane,
    target: PostprocessTarget,
) -> Result<PostprocessOutcome, PostprocessError> {
    let mut encoder = device.create_command_encoder(Some("test encoder"));
    let result = lane.render(device, encoder.as_mut(), &target);
    device.submit_command_buffer(encoder.finish());
    result
}

fn float_source(view: usize) -> Arc<MockSource> {
    Arc::new(MockSource::new(view, BindingKind::FLOAT_2D))
}

fn last_write_of<T: bytemuck::Pod>(device: &MockDevice, len: usize) -> Vec<T> {
    let state = device.state();
    let (_, bytes) = state
        .buffer_writes
        .iter()
        .rev()
        .find(|(_, bytes)| bytes.len() == len)
        .expect("no buffer write of that size");
    bytes
        .chunks_exact(std::mem::size_of::<T>())
        .map(bytemuck::pod_read_unaligned)
        .collect()
}

#[test]
fn draws_a_full_screen_quad_from_its_source() {
    let device = MockDevice::new();
    let source = float_source(1);
    let mut lane = lane_with(
        &device,
        EffectKind::Passthrough,
        vec![Some(source.clone() as Arc<dyn TextureSource>)],
    );

    let outcome = render(&device, &mut lane, PostprocessTarget::color(screen(800, 600))).unwrap();
    assert_eq!(outcome, PostprocessOutcome::Drawn);

    let pass = device.pass(LABEL).expect("pass recorded");
    assert_eq!(pass.color_load(), Some(LoadOp::Load));
    assert_eq!(pass.depth, None);
    assert_eq!(pass.commands.len(), 6);
    assert!(matches!(pass.commands[0], PassCommand::SetPipeline(_)));
    assert!(matches!(pass.commands[1], PassCommand::SetBindGroup(0, _)));
    assert!(matches!(
        pass.commands[4],
        PassCommand::SetIndexBuffer(_, IndexFormat::Uint16)
    ));
    assert_eq!(pass.commands[5], PassCommand::DrawIndexed(0..6, 0, 0..1));

    let PassCommand::SetBindGroup(1, group) = pass.commands[2] else {
        panic!("expected the source group at index 1, got {:?}", pass.commands[2]);
    };
    let group = device.bind_group(group).unwrap();
    assert_eq!(group.entries.len(), 2);
    assert_eq!(group.entries[0].binding, 0);
    assert_eq!(
        group.entries[0].resource,
        BindingResource::TextureView(source.binding.view)
    );
    assert_eq!(group.entries[1].binding, 1);
    assert_eq!(
        group.entries[1].resource,
        BindingResource::Sampler(source.binding.sampler)
    );

    assert_eq!(source.activations(), 1);
    assert_eq!(source.deactivations(), 1);
}

#[test]
fn pipeline_state_follows_the_write_and_blend_settings() {
    let device = MockDevice::new();
    let mut lane = lane_with(
        &device,
        EffectKind::Passthrough,
        vec![Some(float_source(1) as Arc<dyn TextureSource>)],
    );
    lane.set_write_color(false);
    lane.set_blend_mode(BlendMode::Add);

    render(&device, &mut lane, PostprocessTarget::color(screen(64, 64))).unwrap();
    let pipeline = device.last_pipeline();
    assert_eq!(pipeline.fragment_entry.as_deref(), Some("fs_main"));
    assert_eq!(pipeline.color_targets.len(), 1);
    let color = &pipeline.color_targets[0];
    assert_eq!(color.format, TextureFormat::Bgra8UnormSrgb);
    assert_eq!(color.write_mask, ColorWrites::A);
    assert_eq!(color.blend, BlendMode::Add.to_blend_state().unwrap());
    assert!(pipeline.depth_stencil.is_none());
    assert_eq!(pipeline.sample_count, SampleCount::X1);
}

#[test]
fn depth_state_follows_the_depth_settings() {
    let device = MockDevice::new();
    let mut lane = lane_with(&device, EffectKind::Sky, vec![]);
    let target = PostprocessTarget::color(screen(64, 64)).with_depth(depth_attachment(64, 64));

    lane.set_depth_mode(DepthMode::Always);
    render(&device, &mut lane, target).unwrap();
    let depth = device.last_pipeline().depth_stencil.unwrap();
    assert_eq!(depth.format, TextureFormat::Depth24Plus);
    assert_eq!(depth.depth_compare, CompareFunction::Always);
    assert!(!depth.depth_write_enabled);

    lane.set_write_depth(true);
    lane.set_depth_mode(DepthMode::Greater);
    render(&device, &mut lane, target).unwrap();
    let depth = device.last_pipeline().depth_stencil.unwrap();
    assert_eq!(depth.depth_compare, CompareFunction::Greater);
    assert!(depth.depth_write_enabled);
    assert_eq!(lane.pipeline_count(), 2);
}

#[test]
fn pipelines_are_reused_while_the_state_is_unchanged() {
    let device = MockDevice::new();
    let mut lane = lane_with(&device, EffectKind::Sky, vec![]);
    let target = PostprocessTarget::color(screen(64, 64));

    for _ in 0..3 {
        render(&device, &mut lane, target).unwrap();
    }
    assert_eq!(lane.pipeline_count(), 1);
    assert_eq!(device.count("create_render_pipeline"), 1);

    lane.set_write_alpha(false);
    render(&device, &mut lane, target).unwrap();
    assert_eq!(lane.pipeline_count(), 2);
    assert_eq!(device.last_pipeline().color_targets[0].write_mask, ColorWrites::COLOR);
}

#[test]
fn clears_use_the_requested_values() {
    let device = MockDevice::new();
    let mut lane = lane_with(&device, EffectKind::Sky, vec![]);
    let clear = LinearRgba::rgb(0.2, 0.3, 0.4);
    lane.set_clear(true, true);
    lane.set_clear_color(clear);

    let target = PostprocessTarget::color(screen(32, 32)).with_depth(depth_attachment(32, 32));
    render(&device, &mut lane, target).unwrap();

    let pass = device.pass(LABEL).unwrap();
    assert_eq!(pass.color_load(), Some(LoadOp::Clear(clear)));
    assert_eq!(pass.depth_load(), Some(LoadOp::Clear(1.0)));
    assert_eq!(pass.draws(), 1);
}

#[test]
fn stage_without_available_sources_is_skipped_but_still_clears() {
    let device = MockDevice::new();
    let source = Arc::new(MockSource::new(1, BindingKind::FLOAT_2D).unavailable());
    let mut lane = lane_with(
        &device,
        EffectKind::Passthrough,
        vec![Some(source.clone() as Arc<dyn TextureSource>), None],
    );
    lane.set_clear(true, false);

    let outcome = render(&device, &mut lane, PostprocessTarget::color(screen(32, 32))).unwrap();
    assert_eq!(outcome, PostprocessOutcome::Skipped);

    let pass = device.pass(LABEL).expect("clear pass recorded");
    assert_eq!(pass.color_load(), Some(LoadOp::Clear(LinearRgba::TRANSPARENT)));
    assert!(pass.commands.is_empty());
    assert_eq!(lane.pipeline_count(), 0);
    assert_eq!(source.activations(), 0);
}

#[test]
fn skipped_stage_without_clears_records_no_pass() {
    let device = MockDevice::new();
    let source = Arc::new(MockSource::new(1, BindingKind::FLOAT_2D).unavailable());
    let mut lane = lane_with(
        &device,
        EffectKind::Passthrough,
        vec![Some(source as Arc<dyn TextureSource>)],
    );
    // A depth clear without a depth attachment does not count.
    lane.set_clear(false, true);

    let outcome = render(&device, &mut lane, PostprocessTarget::color(screen(32, 32))).unwrap();
    assert_eq!(outcome, PostprocessOutcome::Skipped);
    assert!(device.pass(LABEL).is_none());
}

#[test]
fn one_available_source_is_enough_to_draw() {
    let device = MockDevice::new();
    let missing = Arc::new(MockSource::new(1, BindingKind::FLOAT_2D).unavailable());
    let depth = Arc::new(MockSource::new(2, BindingKind::DEPTH_2D));
    let mut lane = lane_with(
        &device,
        EffectKind::DepthFog,
        vec![
            Some(missing as Arc<dyn TextureSource>),
            Some(depth.clone() as Arc<dyn TextureSource>),
        ],
    );

    let outcome = render(&device, &mut lane, PostprocessTarget::color(screen(32, 32))).unwrap();
    assert_eq!(outcome, PostprocessOutcome::Drawn);
    assert_eq!(depth.deactivations(), 1);
}

#[test]
fn sources_of_the_wrong_kind_are_replaced_by_placeholders() {
    let device = MockDevice::new();
    let wrong = Arc::new(MockSource::new(1, BindingKind::DEPTH_2D));
    let depth = Arc::new(MockSource::new(2, BindingKind::DEPTH_2D));
    let mut lane = lane_with(
        &device,
        EffectKind::DepthFog,
        vec![
            Some(wrong.clone() as Arc<dyn TextureSource>),
            Some(depth.clone() as Arc<dyn TextureSource>),
        ],
    );

    let outcome = render(&device, &mut lane, PostprocessTarget::color(screen(32, 32))).unwrap();
    assert_eq!(outcome, PostprocessOutcome::Drawn);
    assert_eq!(wrong.activations(), 0);
    assert_eq!(wrong.deactivations(), 0);
    assert_eq!(depth.activations(), 1);

    // The 2D one; the cube placeholder shares its label.
    let placeholder = {
        let label = format!("{LABEL} placeholder Float");
        let state = device.state();
        state
            .textures
            .iter()
            .find(|t| t.label.as_deref() == Some(label.as_str()) && t.size.depth_or_array_layers == 1)
            .map(|t| t.id)
            .expect("float placeholder")
    };
    let placeholder_view = device.first_view_of(placeholder).unwrap();
    let pass = device.pass(LABEL).unwrap();
    let PassCommand::SetBindGroup(1, group) = pass.commands[2] else {
        panic!("expected the source group");
    };
    let group = device.bind_group(group).unwrap();
    let slot0 = group.entries.iter().find(|e| e.binding == 0).unwrap();
    assert_eq!(slot0.resource, BindingResource::TextureView(placeholder_view));
}

#[test]
fn a_stage_fed_only_sources_of_the_wrong_kind_is_skipped() {
    let device = MockDevice::new();
    let depth = Arc::new(MockSource::new(1, BindingKind::DEPTH_2D));
    let mut lane = lane_with(
        &device,
        EffectKind::Passthrough,
        vec![Some(depth.clone() as Arc<dyn TextureSource>)],
    );

    let outcome = render(&device, &mut lane, PostprocessTarget::color(screen(32, 32))).unwrap();
    assert_eq!(outcome, PostprocessOutcome::Skipped);
    assert_eq!(depth.activations(), 0);
    assert!(device.pass(LABEL).is_none());
}

#[test]
fn missing_sources_bind_placeholders() {
    let device = MockDevice::new();
    let mut lane = lane_with(
        &device,
        EffectKind::DepthFog,
        vec![Some(float_source(1) as Arc<dyn TextureSource>), None],
    );
    render(&device, &mut lane, PostprocessTarget::color(screen(32, 32))).unwrap();

    let placeholder = device
        .texture_labelled(&format!("{LABEL} placeholder Depth"))
        .expect("depth placeholder");
    assert_eq!(placeholder.size.width, 1);
    assert_eq!(placeholder.format, TextureFormat::Depth24Plus);
    let placeholder_view = device.first_view_of(placeholder.id).unwrap();

    let pass = device.pass(LABEL).unwrap();
    let PassCommand::SetBindGroup(1, group) = pass.commands[2] else {
        panic!("expected the source group");
    };
    let group = device.bind_group(group).unwrap();
    let slot1 = group.entries.iter().find(|e| e.binding == 2).unwrap();
    assert_eq!(slot1.resource, BindingResource::TextureView(placeholder_view));
}

#[test]
fn placeholders_are_filled_at_init() {
    let device = MockDevice::new();
    let _lane = lane_with(&device, EffectKind::Sky, vec![]);

    let state = device.state();
    // One black texel for the 2D placeholder, one per face for the cube.
    assert_eq!(state.texture_writes.len(), 7);
    assert!(state.texture_writes.iter().all(|w| w.bytes == 4));
    let mut faces: Vec<u32> = state.texture_writes.iter().map(|w| w.origin.z).collect();
    faces.sort_unstable();
    assert_eq!(faces, vec![0, 0, 1, 2, 3, 4, 5]);

    let clear = state
        .passes
        .iter()
        .find(|p| p.label.as_deref() == Some("postprocess placeholder clear"))
        .expect("depth placeholder cleared");
    assert_eq!(clear.depth_load(), Some(LoadOp::Clear(1.0)));
    assert!(clear.color.is_empty());
    assert_eq!(state.submitted.len(), 1);
}

#[test]
fn other_slot_kinds_get_placeholders_on_demand() {
    let device = MockDevice::new();
    let module = compile(&device, EffectKind::Passthrough);
    let comparison = BindingKind {
        sample: SampleKind::DepthComparison,
        dimension: TextureViewDimension::D2,
    };
    let mut shader = EffectShader::from_effect(module, EffectKind::Passthrough);
    shader.input_slots = vec![BindingKind::FLOAT_2D, comparison];

    let mut lane = PostprocessLane::new(LABEL);
    lane.set_shader(shader);
    lane.set_source_textures(vec![Some(float_source(1) as Arc<dyn TextureSource>), None]);
    lane.on_gpu_init(&device).unwrap();
    assert!(device
        .texture_labelled(&format!("{LABEL} placeholder DepthComparison"))
        .is_none());

    render(&device, &mut lane, PostprocessTarget::color(screen(16, 16))).unwrap();
    assert!(device
        .texture_labelled(&format!("{LABEL} placeholder DepthComparison"))
        .is_some());
    assert!(device
        .state()
        .samplers
        .iter()
        .any(|s| s.compare == Some(CompareFunction::LessEqual)));
}

#[test]
fn rectangle_sources_are_addressed_in_pixels() {
    let device = MockDevice::new();
    let source = Arc::new(MockSource::new(1, BindingKind::FLOAT_2D).rectangle(640, 480));
    let mut lane = lane_with(
        &device,
        EffectKind::Passthrough,
        vec![Some(source as Arc<dyn TextureSource>)],
    );
    render(&device, &mut lane, PostprocessTarget::color(screen(640, 480))).unwrap();

    let vertices: Vec<PostprocessVertex> =
        last_write_of(&device, 4 * std::mem::size_of::<PostprocessVertex>());
    assert_eq!(vertices[0].uv, [0.0, 0.0]);
    assert_eq!(vertices[2].uv, [640.0, 480.0]);
    let uniforms: Vec<PostprocessUniforms> =
        last_write_of(&device, std::mem::size_of::<PostprocessUniforms>());
    assert_eq!(uniforms[0].uv_extent, [640.0, 480.0]);
}

#[test]
fn uniforms_carry_camera_and_effect_parameters() {
    let device = MockDevice::new();
    let mut lane = lane_with(&device, EffectKind::Sky, vec![]);
    lane.set_contrast(1.5);
    lane.set_sun_direction(Vec3::new(0.0, 0.0, -1.0));
    lane.set_camera_info(CameraInfo {
        lod_far: 800.0,
        width: 1280,
        height: 720,
        ..Default::default()
    });
    render(&device, &mut lane, PostprocessTarget::color(screen(1280, 720))).unwrap();

    let uniforms: Vec<PostprocessUniforms> =
        last_write_of(&device, std::mem::size_of::<PostprocessUniforms>());
    let u = uniforms[0];
    assert_eq!(u.contrast, 1.5);
    assert_eq!(u.zfar, 800.0);
    assert_eq!(u.znear, 0.1);
    assert_eq!(u.uv_extent, [1.0, 1.0]);
    assert_eq!(u.viewport, [1280.0, 720.0]);
    // Identity rotation: the sun direction is already in eye space.
    assert!((u.directlight_eyespace_direction[2] + 1.0).abs() < 1e-5);
}

#[test]
fn render_errors_are_reported() {
    let device = MockDevice::new();
    let target = PostprocessTarget::color(screen(32, 32));

    let mut no_shader = PostprocessLane::new(LABEL);
    no_shader.on_gpu_init(&device).unwrap();
    assert!(matches!(
        render(&device, &mut no_shader, target),
        Err(PostprocessError::ShaderNotSet)
    ));

    let mut uninitialized = PostprocessLane::new(LABEL);
    uninitialized.set_shader(EffectShader::from_effect(
        compile(&device, EffectKind::Sky),
        EffectKind::Sky,
    ));
    assert!(matches!(
        render(&device, &mut uninitialized, target),
        Err(PostprocessError::NotInitialized)
    ));

    let mut lane = lane_with(&device, EffectKind::Sky, vec![]);
    assert!(matches!(
        render(&device, &mut lane, PostprocessTarget::default()),
        Err(PostprocessError::MissingTarget)
    ));
    assert!(matches!(
        render(
            &device,
            &mut lane,
            target.with_depth(depth_attachment(64, 64))
        ),
        Err(PostprocessError::AttachmentMismatch(_))
    ));

    lane.set_blend_mode(BlendMode::AlphaTest);
    assert!(matches!(
        render(&device, &mut lane, target),
        Err(PostprocessError::Pipeline(PipelineError::UnsupportedBlendMode(
            BlendMode::AlphaTest
        )))
    ));
    assert!(device.pass(LABEL).is_none());
}

#[test]
fn sources_are_released_when_pipeline_creation_fails() {
    let device = MockDevice::new();
    let source = float_source(1);
    let mut lane = lane_with(
        &device,
        EffectKind::Passthrough,
        vec![Some(source.clone() as Arc<dyn TextureSource>)],
    );
    device.fail_on("create_render_pipeline", 0);

    let result = render(&device, &mut lane, PostprocessTarget::color(screen(32, 32)));
    assert!(matches!(result, Err(PostprocessError::Resource(_))));
    assert_eq!(source.activations(), 1);
    assert_eq!(source.deactivations(), 1);
    // The failed build left no layouts behind.
    assert_eq!(lane.pipeline_count(), 0);
    assert_eq!(device.live("pipeline_layout"), 0);

    let outcome = render(&device, &mut lane, PostprocessTarget::color(screen(32, 32))).unwrap();
    assert_eq!(outcome, PostprocessOutcome::Drawn);
}

#[test]
fn source_bind_groups_are_cached_until_released() {
    let device = MockDevice::new();
    let mut lane = lane_with(
        &device,
        EffectKind::Passthrough,
        vec![Some(float_source(1) as Arc<dyn TextureSource>)],
    );
    let target = PostprocessTarget::color(screen(32, 32));

    render(&device, &mut lane, target).unwrap();
    render(&device, &mut lane, target).unwrap();
    assert_eq!(lane.source_bind_group_count(), 1);

    lane.release_source_bind_groups(&device);
    assert_eq!(lane.source_bind_group_count(), 0);
    render(&device, &mut lane, target).unwrap();
    assert_eq!(lane.source_bind_group_count(), 1);
}

#[test]
fn shutdown_releases_every_gpu_object() {
    let device = MockDevice::new();
    let module = compile(&device, EffectKind::DepthFog);
    let baseline = device.live_total();

    let mut lane = PostprocessLane::new(LABEL);
    lane.set_shader(EffectShader::from_effect(module, EffectKind::DepthFog));
    lane.set_source_textures(vec![Some(float_source(1) as Arc<dyn TextureSource>), None]);
    lane.on_gpu_init(&device).unwrap();
    // A second init is a no-op.
    lane.on_gpu_init(&device).unwrap();
    render(&device, &mut lane, PostprocessTarget::color(screen(32, 32))).unwrap();
    assert!(device.live_total() > baseline);

    lane.on_gpu_shutdown(&device);
    assert!(!lane.is_gpu_initialized());
    assert_eq!(device.live_total(), baseline);
    // Shutting down twice is harmless.
    lane.on_gpu_shutdown(&device);
    assert_eq!(device.live_total(), baseline);
}
