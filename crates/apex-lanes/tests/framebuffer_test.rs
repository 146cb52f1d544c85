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

use apex_core::renderer::*;
use common::MockDevice;

fn desc(width: u32, height: u32, format: FramebufferFormat) -> FramebufferTextureDescriptor {
    FramebufferTextureDescriptor::new(width, height, format)
}

#[test]
fn init_creates_storage_views_and_sampler() {
    let device = MockDevice::new();
    let texture = FramebufferTexture::new("scene");
    texture.init(&device, &desc(320, 200, FramebufferFormat::Rgb8)).unwrap();

    assert!(texture.is_initialized());
    assert_eq!((texture.width(), texture.height()), (320, 200));
    assert_eq!(device.live("texture"), 1);
    assert_eq!(device.live("texture_view"), 2);
    assert_eq!(device.live("sampler"), 1);

    let recorded = device.texture_labelled("scene").unwrap();
    // Rgb8 is backed by an RGBA texture.
    assert_eq!(recorded.format, TextureFormat::Rgba8Unorm);
    assert_eq!(recorded.mip_level_count, 1);

    let binding = texture.activate().unwrap();
    assert_eq!(binding.kind, BindingKind::FLOAT_2D);
    assert_eq!(Some(binding.view), device.first_view_of(recorded.id));
    assert!(texture.is_active());
    texture.deactivate();
    assert!(!texture.is_active());
}

#[test]
fn attached_texture_cannot_be_reinitialized() {
    let device = MockDevice::new();
    let texture = FramebufferTexture::new("target");
    texture.init(&device, &desc(64, 64, FramebufferFormat::Rgba16)).unwrap();

    let attachment = texture.attach().unwrap();
    assert_eq!(attachment.format, TextureFormat::Rgba16Float);
    assert_eq!(attachment.resolve_target, None);
    assert_eq!((attachment.width, attachment.height), (64, 64));

    assert!(matches!(
        texture.init(&device, &desc(128, 128, FramebufferFormat::Rgba16)),
        Err(FramebufferError::Attached)
    ));
    assert_eq!(texture.width(), 64);

    texture.detach();
    texture.init(&device, &desc(128, 128, FramebufferFormat::Rgba16)).unwrap();
    assert_eq!(texture.width(), 128);
    // The old storage was released.
    assert_eq!(device.live("texture"), 1);
    assert_eq!(device.live("texture_view"), 2);
}

#[test]
fn deinit_releases_everything() {
    let device = MockDevice::new();
    let texture = FramebufferTexture::new("temp");
    texture.init(&device, &desc(16, 16, FramebufferFormat::Depth24)).unwrap();
    texture.deinit(&device);

    assert!(!texture.is_initialized());
    assert_eq!(device.live_total(), 0);
    assert!(matches!(texture.activate(), Err(FramebufferError::NotInitialized)));
    assert!(matches!(texture.attach(), Err(FramebufferError::NotInitialized)));
    // Twice is harmless.
    texture.deinit(&device);
}

#[test]
fn zero_sized_textures_are_rejected() {
    let device = MockDevice::new();
    let texture = FramebufferTexture::new("empty");
    assert!(matches!(
        texture.init(&device, &desc(0, 16, FramebufferFormat::Rgba8)),
        Err(FramebufferError::InvalidSize { width: 0, height: 16 })
    ));
    assert!(!texture.is_initialized());
    assert_eq!(device.count("create_texture"), 0);
}

#[test]
fn multisampling_needs_device_support() {
    let mut request = desc(64, 64, FramebufferFormat::Rgba8);
    request.multisample = 4;

    let plain = MockDevice::new();
    let texture = FramebufferTexture::new("msaa");
    texture.init(&plain, &request).unwrap();
    assert_eq!(texture.sample_count(), SampleCount::X1);
    assert_eq!(plain.live("texture"), 1);

    let capable = MockDevice::new().with_multisample();
    let texture = FramebufferTexture::new("msaa");
    texture.init(&capable, &request).unwrap();
    assert_eq!(texture.sample_count(), SampleCount::X4);
    assert_eq!(capable.live("texture"), 2);

    let attachment = texture.attach().unwrap();
    assert_eq!(attachment.sample_count, SampleCount::X4);
    let resolve = attachment.resolve_target.expect("multisampled targets resolve");
    assert_ne!(resolve, attachment.view);
    assert_eq!(
        capable.texture_labelled("msaa msaa").unwrap().sample_count,
        SampleCount::X4
    );
    texture.detach();

    // Depth and cube targets stay single-sampled.
    let mut depth = desc(64, 64, FramebufferFormat::Depth24);
    depth.multisample = 4;
    let texture = FramebufferTexture::new("depth");
    texture.init(&capable, &depth).unwrap();
    assert_eq!(texture.sample_count(), SampleCount::X1);
}

#[test]
fn rectangle_targets_need_device_support() {
    let mut request = desc(640, 480, FramebufferFormat::Rgba8);
    request.target = TextureTarget::Rectangle;
    request.mipmap = true;

    let device = MockDevice::new().without_rectangles();
    let texture = FramebufferTexture::new("rect");
    assert!(matches!(
        texture.init(&device, &request),
        Err(FramebufferError::UnsupportedTarget(TextureTarget::Rectangle))
    ));

    let device = MockDevice::new();
    texture.init(&device, &request).unwrap();
    assert!(texture.is_rect());
    // Rectangles never get mips.
    assert_eq!(texture.mip_level_count(), 1);
}

#[test]
fn mipmapped_targets_allocate_the_full_chain() {
    let device = MockDevice::new();
    let mut request = desc(256, 64, FramebufferFormat::Rgba8);
    request.mipmap = true;
    let texture = FramebufferTexture::new("mips");
    texture.init(&device, &request).unwrap();
    assert_eq!(texture.mip_level_count(), 9);
    assert_eq!(device.texture_labelled("mips").unwrap().mip_level_count, 9);
}

#[test]
fn cube_targets_have_six_layers_and_bind_as_cubes() {
    let device = MockDevice::new();
    let mut request = desc(32, 32, FramebufferFormat::Rgba8);
    request.target = TextureTarget::Cubemap;
    let texture = FramebufferTexture::new("cube");
    texture.init(&device, &request).unwrap();

    assert_eq!(
        device.texture_labelled("cube").unwrap().size.depth_or_array_layers,
        6
    );
    assert_eq!(
        TextureSource::binding_kind(&texture),
        BindingKind::FLOAT_CUBE
    );
}

#[test]
fn non_square_cube_targets_are_rejected() {
    let device = MockDevice::new();
    let mut request = desc(64, 32, FramebufferFormat::Rgba8);
    request.target = TextureTarget::Cubemap;
    let texture = FramebufferTexture::new("cube");

    assert!(matches!(
        texture.init(&device, &request),
        Err(FramebufferError::InvalidSize { width: 64, height: 32 })
    ));
    assert!(!texture.is_initialized());
    assert_eq!(device.count("create_texture"), 0);
}

#[test]
fn samplers_follow_filter_and_comparison_settings() {
    let device = MockDevice::new();

    let mut nearest = desc(8, 8, FramebufferFormat::Lum8);
    nearest.filter_nearest = true;
    FramebufferTexture::new("nearest").init(&device, &nearest).unwrap();

    // Linear was requested, but plain depth can only be sampled unfiltered.
    let raw_depth = desc(8, 8, FramebufferFormat::Depth24);
    assert!(!raw_depth.filter_nearest);
    FramebufferTexture::new("depth").init(&device, &raw_depth).unwrap();

    let mut shadow = desc(8, 8, FramebufferFormat::Depth24);
    shadow.depth_comparison = true;
    let shadow_texture = FramebufferTexture::new("shadow");
    shadow_texture.init(&device, &shadow).unwrap();

    let state = device.state();
    let samplers: Vec<_> = state
        .samplers
        .iter()
        .map(|s| (s.mag_filter, s.compare))
        .collect();
    assert_eq!(
        samplers,
        vec![
            (FilterMode::Nearest, None),
            (FilterMode::Nearest, None),
            (FilterMode::Linear, Some(CompareFunction::LessEqual)),
        ]
    );
    drop(state);
    assert_eq!(
        TextureSource::binding_kind(&shadow_texture).sample,
        SampleKind::DepthComparison
    );
}

#[test]
fn failed_init_releases_partial_objects() {
    let device = MockDevice::new();
    device.fail_on("create_sampler", 0);
    let texture = FramebufferTexture::new("broken");

    let err = texture
        .init(&device, &desc(32, 32, FramebufferFormat::Rgba8))
        .unwrap_err();
    match err {
        FramebufferError::Resource { stage, .. } => assert_eq!(stage, "FBTEX texture setup"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!texture.is_initialized());
    assert_eq!(device.live_total(), 0);

    // The failure is one-shot; a retry succeeds.
    texture
        .init(&device, &desc(32, 32, FramebufferFormat::Rgba8))
        .unwrap();
}

#[test]
fn failed_view_reports_the_storage_stage() {
    let device = MockDevice::new();
    device.fail_on("create_texture_view", 1);
    let texture = FramebufferTexture::new("broken");
    let err = texture
        .init(&device, &desc(32, 32, FramebufferFormat::Rgba8))
        .unwrap_err();
    assert!(
        matches!(err, FramebufferError::Resource { stage: "FBTEX texture storage initialization", .. })
    );
    assert_eq!(device.live_total(), 0);
}
