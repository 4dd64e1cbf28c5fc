// gpu/color.rs — RGBA→grayscale elementwise kernel.

use wgpu::util::DeviceExt;

use crate::gpu::buffers::FrameBuffers;
use crate::gpu::device::GpuDevice;
use crate::gpu::{compute_pipeline, storage_entry, uniform_entry};

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct ColorParams {
    width: u32,
    height: u32,
    _pad0: u32,
    _pad1: u32,
}

/// The grayscale conversion stage. Compiled once, dispatched per frame.
pub struct GpuColorStage {
    pipeline: wgpu::ComputePipeline,
    bgl: wgpu::BindGroupLayout,
}

impl GpuColorStage {
    pub fn new(gpu: &GpuDevice) -> Self {
        let module = gpu
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("color.wgsl"),
                source: wgpu::ShaderSource::Wgsl(include_str!("../shaders/color.wgsl").into()),
            });

        let bgl = gpu
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("GpuColorStage BGL"),
                entries: &[
                    storage_entry(0, true),  // raw
                    storage_entry(1, false), // gray
                    uniform_entry(2),
                ],
            });
        let pipeline = compute_pipeline(gpu, "to_gray", &module, "to_gray", &bgl);

        GpuColorStage { pipeline, bgl }
    }

    /// Encode the grayscale pass: `bufs.raw` → `bufs.gray`.
    pub fn encode(&self, gpu: &GpuDevice, encoder: &mut wgpu::CommandEncoder, bufs: &FrameBuffers) {
        let params = gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("GpuColorStage params"),
                contents: bytemuck::bytes_of(&ColorParams {
                    width: bufs.width,
                    height: bufs.height,
                    _pad0: 0,
                    _pad1: 0,
                }),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let bg = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("GpuColorStage BG"),
            layout: &self.bgl,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: bufs.raw.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: bufs.gray.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: params.as_entire_binding() },
            ],
        });

        let (dx, dy) = gpu.dispatch_size(bufs.width, bufs.height);
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("to_gray"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bg, &[]);
        pass.dispatch_workgroups(dx, dy, 1);
    }
}
