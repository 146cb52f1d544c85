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

//! View-frustum corners for full-screen passes.
//!
//! The postprocess quad carries the four far-plane corners as vertex
//! attributes. After interpolation every fragment holds the un-normalized ray
//! from the eye through that pixel to the far plane, in eye space and in world
//! space. Scaling the ray by a linearized depth sample gives the fragment's
//! position without a matrix inverse in the shader.

use apex_core::math::{Mat4, Quaternion, Vec3};

/// Near clip distance used for the frustum projection.
pub const Z_NEAR: f32 = 0.1;

/// Camera parameters the postprocess pass needs each frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraInfo {
    /// Eye position in world space.
    pub position: Vec3,
    /// Rotation taking world-space vectors into eye space.
    pub rotation: Quaternion,
    /// Vertical field of view, in degrees.
    pub fov_degrees: f32,
    /// Far clip distance. The corner rays reach the plane `z = -lod_far`.
    pub lod_far: f32,
    /// Viewport width in pixels.
    pub width: u32,
    /// Viewport height in pixels.
    pub height: u32,
}

impl Default for CameraInfo {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quaternion::IDENTITY,
            fov_degrees: 45.0,
            lod_far: 1000.0,
            width: 1,
            height: 1,
        }
    }
}

impl CameraInfo {
    /// Width over height. A zero height counts as one pixel.
    pub fn aspect_ratio(&self) -> f32 {
        self.width as f32 / self.height.max(1) as f32
    }
}

/// Far-plane corners in bottom-left, bottom-right, top-right, top-left order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrustumCorners {
    /// Corners in eye space. Every `z` is `-lod_far`.
    pub eye: [Vec3; 4],
    /// The same corners rotated into world space, relative to the eye.
    pub world: [Vec3; 4],
}

impl FrustumCorners {
    /// Computes the corners for `camera`.
    pub fn compute(camera: &CameraInfo) -> Self {
        let far = camera.lod_far;
        let inverse_projection =
            Mat4::inverse_perspective(camera.fov_degrees, camera.aspect_ratio(), Z_NEAR, far);

        let seeds = [
            Vec3::new(-far, -far, -far),
            Vec3::new(far, -far, -far),
            Vec3::new(far, far, -far),
            Vec3::new(-far, far, -far),
        ];
        let eye = seeds.map(|seed| {
            let mut corner = inverse_projection.transform_point_no_divide(seed);
            corner.z = -far;
            corner
        });

        let eye_to_world = camera.rotation.conjugate();
        let world = eye.map(|corner| eye_to_world.rotate_vec3(corner));

        Self { eye, world }
    }

    /// The bottom-left eye-space corner.
    pub fn bottom_left(&self) -> Vec3 {
        self.eye[0]
    }

    /// Bottom-right minus bottom-left, in eye space.
    pub fn right_delta(&self) -> Vec3 {
        self.eye[1] - self.eye[0]
    }

    /// Top-left minus bottom-left, in eye space.
    pub fn up_delta(&self) -> Vec3 {
        self.eye[3] - self.eye[0]
    }
}

/// Rotates a world-space light direction into eye space.
pub fn eye_space_light(rotation: Quaternion, sun_direction: Vec3) -> Vec3 {
    rotation.rotate_vec3(sun_direction)
}
