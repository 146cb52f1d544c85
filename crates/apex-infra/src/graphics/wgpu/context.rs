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

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::anyhow;
use anyhow::Result;
use wgpu::{Adapter, Features, Instance, RequestAdapterOptions};

/// Formats the framebuffer textures are created with. MSAA is reported as
/// available only when every one of them can be multisampled 4x.
const MULTISAMPLED_FORMATS: [wgpu::TextureFormat; 3] = [
    wgpu::TextureFormat::R8Unorm,
    wgpu::TextureFormat::Rgba8Unorm,
    wgpu::TextureFormat::Rgba16Float,
];

/// Validation errors wgpu reported since they were last taken.
///
/// The device's uncaptured-error handler records into it; [`WgpuDevice`](super::WgpuDevice)
/// drains it around every call so a failed creation surfaces as an `Err`.
#[derive(Debug, Clone, Default)]
pub struct ValidationErrors(Arc<Mutex<Vec<String>>>);

impl ValidationErrors {
    pub fn record(&self, message: String) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
    }

    /// Returns and clears everything recorded so far.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Holds the core WGPU state objects required for off-screen rendering.
///
/// The context owns no surface: the "screen" of a headless run is an ordinary
/// texture in [`WgpuGraphicsContext::target_format`].
#[derive(Debug)]
pub struct WgpuGraphicsContext {
    #[allow(dead_code)]
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,

    /// Format used for the final output image.
    pub target_format: wgpu::TextureFormat,

    // Store info for easy access
    pub adapter_name: String,
    pub adapter_backend: wgpu::Backend,
    pub adapter_device_type: wgpu::DeviceType,
    pub multisample_x4: bool,

    /// Errors raised by the device outside an error scope.
    pub validation_errors: ValidationErrors,
}

impl WgpuGraphicsContext {
    /// Selects a high-performance adapter and opens a logical device on it.
    ///
    /// ## Returns
    /// * `Result<Self>` - the initialized context, or an error when no adapter
    ///   or device is available.
    pub async fn new() -> Result<Self> {
        log::info!("Initializing headless WGPU Graphics Context...");

        let instance = Instance::new(wgpu::InstanceDescriptor::new_without_display_handle());
        let adapter = instance
            .request_adapter(&RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| anyhow!("No suitable graphics adapter found: {}", e))?;

        Self::with_adapter(adapter).await
    }

    /// Blocking variant of [`WgpuGraphicsContext::new`] for synchronous callers.
    pub fn new_blocking() -> Result<Self> {
        pollster::block_on(Self::new())
    }

    async fn with_adapter(adapter: Adapter) -> Result<Self> {
        let adapter_info = adapter.get_info();
        log::info!(
            "Using graphics adapter: \"{}\" (Backend: {:?})",
            adapter_info.name,
            adapter_info.backend
        );

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Apex Logical Device"),
                required_features: Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::default(),
                trace: wgpu::Trace::default(),
                experimental_features: wgpu::ExperimentalFeatures::disabled(),
            })
            .await
            .map_err(|e| anyhow!("Failed to create logical device: {}", e))?;
        log::info!("Logical device and command queue created.");

        let validation_errors = ValidationErrors::default();
        let sink = validation_errors.clone();
        device.on_uncaptured_error(std::sync::Arc::new(move |e: wgpu::Error| {
            log::error!("WGPU Uncaptured Error: {e:?}");
            sink.record(e.to_string());
        }));

        let multisample_x4 = MULTISAMPLED_FORMATS.iter().all(|format| {
            adapter
                .get_texture_format_features(*format)
                .flags
                .contains(wgpu::TextureFormatFeatureFlags::MULTISAMPLE_X4)
        });
        log::debug!("4x multisampling available: {multisample_x4}");

        Ok(WgpuGraphicsContext {
            adapter,
            device,
            queue,
            target_format: wgpu::TextureFormat::Rgba8UnormSrgb,
            adapter_name: adapter_info.name,
            adapter_backend: adapter_info.backend,
            adapter_device_type: adapter_info.device_type,
            multisample_x4,
            validation_errors,
        })
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_drained_by_take() {
        let errors = ValidationErrors::default();
        let handler_side = errors.clone();
        handler_side.record("Texture view dimension Cube requires a square texture".into());
        handler_side.record("second".into());

        let taken = errors.take();
        assert_eq!(taken.len(), 2);
        assert!(taken[0].contains("square"));
        assert!(errors.take().is_empty());
    }
}
