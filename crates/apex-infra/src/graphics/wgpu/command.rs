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

use apex_core::renderer::api::command::{BindGroupId, CommandBufferId, RenderPassDescriptor};
use apex_core::renderer::traits::{CommandEncoder, RenderPass};
use apex_core::renderer::{BufferId, IndexFormat, RenderPipelineId};
use std::any::Any;
use std::ops::Range;

use super::conversions::IntoWgpu;
use super::device::WgpuDevice;

/// A render pass being recorded into a [`WgpuCommandEncoder`].
///
/// Ids that do not resolve are logged and the call is dropped; the pass keeps
/// recording.
pub struct WgpuRenderPass<'a> {
    pub(crate) pass: wgpu::RenderPass<'a>,
    pub(crate) device: &'a WgpuDevice,
}

impl<'pass> RenderPass<'pass> for WgpuRenderPass<'pass> {
    fn set_pipeline(&mut self, pipeline_id: &'pass RenderPipelineId) {
        if let Some(pipeline) = self.device.get_wgpu_render_pipeline(*pipeline_id) {
            self.pass.set_pipeline(&pipeline);
        } else {
            log::warn!("WgpuRenderPass: RenderPipelineId {pipeline_id:?} not found.");
        }
    }

    fn set_bind_group(&mut self, index: u32, bind_group_id: &'pass BindGroupId, offsets: &[u32]) {
        if let Some(bind_group) = self.device.get_wgpu_bind_group(*bind_group_id) {
            self.pass.set_bind_group(index, bind_group.as_ref(), offsets);
        } else {
            log::warn!("WgpuRenderPass: BindGroupId {bind_group_id:?} not found.");
        }
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer_id: &'pass BufferId, offset: u64) {
        if let Some(buffer) = self.device.get_wgpu_buffer(*buffer_id) {
            self.pass.set_vertex_buffer(slot, buffer.slice(offset..));
        } else {
            log::warn!("WgpuRenderPass: Vertex BufferId {buffer_id:?} not found.");
        }
    }

    fn set_index_buffer(
        &mut self,
        buffer_id: &'pass BufferId,
        offset: u64,
        index_format: IndexFormat,
    ) {
        if let Some(buffer) = self.device.get_wgpu_buffer(*buffer_id) {
            self.pass
                .set_index_buffer(buffer.slice(offset..), index_format.into_wgpu());
        } else {
            log::warn!("WgpuRenderPass: Index BufferId {buffer_id:?} not found.");
        }
    }

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        self.pass.draw(vertices, instances);
    }

    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>) {
        self.pass.draw_indexed(indices, base_vertex, instances);
    }
}

/// Records GPU commands until [`CommandEncoder::finish`] hands the buffer to the device.
pub struct WgpuCommandEncoder {
    pub(crate) encoder: wgpu::CommandEncoder,
    pub(crate) device: WgpuDevice,
}

struct ResolvedColorAttachment {
    view: wgpu::TextureView,
    resolve_target: Option<wgpu::TextureView>,
    ops: wgpu::Operations<wgpu::Color>,
}

impl CommandEncoder for WgpuCommandEncoder {
    fn begin_render_pass<'encoder>(
        &'encoder mut self,
        descriptor: &RenderPassDescriptor<'encoder>,
    ) -> Box<dyn RenderPass<'encoder> + 'encoder> {
        let resolved: Vec<ResolvedColorAttachment> = descriptor
            .color_attachments
            .iter()
            .filter_map(|att| {
                let Some(view) = self.device.get_wgpu_texture_view(att.view) else {
                    log::warn!(
                        "WgpuCommandEncoder: color attachment view {:?} not found; skipped.",
                        att.view
                    );
                    return None;
                };
                let resolve_target = att.resolve_target.and_then(|id| {
                    let view = self.device.get_wgpu_texture_view(id);
                    if view.is_none() {
                        log::warn!("WgpuCommandEncoder: resolve target {id:?} not found.");
                    }
                    view.map(|v| (*v).clone())
                });
                Some(ResolvedColorAttachment {
                    view: (*view).clone(),
                    resolve_target,
                    ops: wgpu::Operations {
                        load: att.ops.load.into_wgpu(),
                        store: att.ops.store.into_wgpu(),
                    },
                })
            })
            .collect();

        let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = resolved
            .iter()
            .map(|att| {
                Some(wgpu::RenderPassColorAttachment {
                    view: &att.view,
                    resolve_target: att.resolve_target.as_ref(),
                    ops: att.ops,
                    depth_slice: None,
                })
            })
            .collect();

        let depth_view: Option<wgpu::TextureView> =
            descriptor.depth_stencil_attachment.as_ref().and_then(|ds| {
                self.device
                    .get_wgpu_texture_view(ds.view)
                    .map(|arc_view| (*arc_view).clone())
            });

        let depth_stencil_attachment = match (&descriptor.depth_stencil_attachment, &depth_view) {
            (Some(ds), Some(view)) => Some(wgpu::RenderPassDepthStencilAttachment {
                view,
                depth_ops: ds.depth_ops.map(|ops| wgpu::Operations {
                    load: ops.load.into_wgpu(),
                    store: ops.store.into_wgpu(),
                }),
                stencil_ops: None,
            }),
            (Some(ds), None) => {
                log::warn!(
                    "WgpuCommandEncoder: depth attachment view {:?} not found; skipped.",
                    ds.view
                );
                None
            }
            _ => None,
        };

        let wgpu_descriptor = wgpu::RenderPassDescriptor {
            label: descriptor.label,
            color_attachments: &color_attachments,
            depth_stencil_attachment,
            timestamp_writes: None,
            occlusion_query_set: None,
            multiview_mask: None,
        };

        let pass = self.encoder.begin_render_pass(&wgpu_descriptor);

        Box::new(WgpuRenderPass {
            pass,
            device: &self.device,
        })
    }

    fn finish(self: Box<Self>) -> CommandBufferId {
        let this = *self;
        let command_buffer = this.encoder.finish();
        this.device.register_command_buffer(command_buffer)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
