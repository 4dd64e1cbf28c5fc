// gpu/corners.rs — structure-tensor corner response and annotation kernels.
//
// `encode_response` computes the response map from the gradient buffers in
// one pass (gradient products and the Gaussian window sum are fused in the
// shader). The acceptance threshold is derived on the CPU from the
// read-back map; `encode_annotate` then writes markers into the raw RGBA
// buffer in a second submission.

use wgpu::util::DeviceExt;

use crate::corners::ResponseKind;
use crate::gpu::buffers::FrameBuffers;
use crate::gpu::convolve::GpuKernel;
use crate::gpu::device::GpuDevice;
use crate::gpu::{compute_pipeline, storage_entry, uniform_entry};

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct CornerParams {
    width: u32,
    height: u32,
    kwidth: u32,
    kind: u32,
    k: f32,
    threshold: f32,
    _pad0: u32,
    _pad1: u32,
}

fn params_for(bufs: &FrameBuffers, kwidth: u32, kind: ResponseKind, threshold: f32) -> CornerParams {
    let (kind, k) = match kind {
        ResponseKind::Harris { k } => (0, k),
        ResponseKind::ShiTomasi => (1, 0.0),
    };
    CornerParams {
        width: bufs.width,
        height: bufs.height,
        kwidth,
        kind,
        k,
        threshold,
        _pad0: 0,
        _pad1: 0,
    }
}

pub struct GpuCornerStage {
    response: wgpu::ComputePipeline,
    annotate: wgpu::ComputePipeline,
    response_bgl: wgpu::BindGroupLayout,
    annotate_bgl: wgpu::BindGroupLayout,
}

impl GpuCornerStage {
    pub fn new(gpu: &GpuDevice) -> Self {
        let module = gpu
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("corners.wgsl"),
                source: wgpu::ShaderSource::Wgsl(include_str!("../shaders/corners.wgsl").into()),
            });

        let response_bgl = gpu
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("GpuCornerStage response BGL"),
                entries: &[
                    storage_entry(0, true),  // gx
                    storage_entry(1, true),  // gy
                    storage_entry(2, true),  // window
                    storage_entry(3, false), // response
                    uniform_entry(5),
                ],
            });
        let annotate_bgl = gpu
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("GpuCornerStage annotate BGL"),
                entries: &[
                    storage_entry(3, false), // response
                    storage_entry(4, false), // raw
                    uniform_entry(5),
                ],
            });

        GpuCornerStage {
            response: compute_pipeline(gpu, "response_map", &module, "response_map", &response_bgl),
            annotate: compute_pipeline(gpu, "annotate", &module, "annotate", &annotate_bgl),
            response_bgl,
            annotate_bgl,
        }
    }

    /// Encode the response pass: `bufs.gx`/`bufs.gy` → `bufs.response`.
    pub fn encode_response(
        &self,
        gpu: &GpuDevice,
        encoder: &mut wgpu::CommandEncoder,
        bufs: &FrameBuffers,
        window: &GpuKernel,
        kind: ResponseKind,
    ) {
        let params = gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("GpuCornerStage response params"),
                contents: bytemuck::bytes_of(&params_for(bufs, window.kwidth, kind, 0.0)),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let bg = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("GpuCornerStage response BG"),
            layout: &self.response_bgl,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: bufs.gx.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: bufs.gy.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: window.coeffs.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: bufs.response.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 5, resource: params.as_entire_binding() },
            ],
        });

        let (dx, dy) = gpu.dispatch_size(bufs.width, bufs.height);
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("response_map"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.response);
        pass.set_bind_group(0, &bg, &[]);
        pass.dispatch_workgroups(dx, dy, 1);
    }

    /// Encode the marker pass: every response at or above `threshold` draws
    /// a cross into `bufs.raw`.
    pub fn encode_annotate(
        &self,
        gpu: &GpuDevice,
        encoder: &mut wgpu::CommandEncoder,
        bufs: &FrameBuffers,
        kind: ResponseKind,
        threshold: f32,
    ) {
        let params = gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("GpuCornerStage annotate params"),
                contents: bytemuck::bytes_of(&params_for(bufs, 0, kind, threshold)),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let bg = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("GpuCornerStage annotate BG"),
            layout: &self.annotate_bgl,
            entries: &[
                wgpu::BindGroupEntry { binding: 3, resource: bufs.response.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 4, resource: bufs.raw.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 5, resource: params.as_entire_binding() },
            ],
        });

        let (dx, dy) = gpu.dispatch_size(bufs.width, bufs.height);
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("annotate"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.annotate);
        pass.set_bind_group(0, &bg, &[]);
        pass.dispatch_workgroups(dx, dy, 1);
    }
}
