// gpu/canny.rs — Canny kernels: magnitude/direction, non-max suppression,
// double-threshold classification. Hysteresis linking runs on the CPU over
// the read-back class buffer (serial flood fill, a poor fit for the GPU).
//
// Buffer reuse within one invocation:
//   mag        → bufs.response
//   dir        → bufs.aux       (dead after the NMS pass)
//   suppressed → bufs.scratch
//   classes    → bufs.aux       (reused once dir is consumed)

use wgpu::util::DeviceExt;

use crate::gpu::buffers::FrameBuffers;
use crate::gpu::device::GpuDevice;
use crate::gpu::{compute_pipeline, storage_entry, uniform_entry};

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct CannyParams {
    width: u32,
    height: u32,
    low: f32,
    high: f32,
}

pub struct GpuCannyStage {
    magdir: wgpu::ComputePipeline,
    nms: wgpu::ComputePipeline,
    classify: wgpu::ComputePipeline,
    magdir_bgl: wgpu::BindGroupLayout,
    nms_bgl: wgpu::BindGroupLayout,
    classify_bgl: wgpu::BindGroupLayout,
}

impl GpuCannyStage {
    pub fn new(gpu: &GpuDevice) -> Self {
        let module = gpu
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("canny.wgsl"),
                source: wgpu::ShaderSource::Wgsl(include_str!("../shaders/canny.wgsl").into()),
            });

        let magdir_bgl = gpu
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("GpuCannyStage magdir BGL"),
                entries: &[
                    storage_entry(0, true),  // gx
                    storage_entry(1, true),  // gy
                    storage_entry(2, false), // mag
                    storage_entry(3, false), // dir
                    uniform_entry(6),
                ],
            });
        let nms_bgl = gpu
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("GpuCannyStage nms BGL"),
                entries: &[
                    storage_entry(2, false), // mag
                    storage_entry(3, false), // dir
                    storage_entry(4, false), // suppressed
                    uniform_entry(6),
                ],
            });
        let classify_bgl = gpu
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("GpuCannyStage classify BGL"),
                entries: &[
                    storage_entry(4, false), // suppressed
                    storage_entry(5, false), // classes
                    uniform_entry(6),
                ],
            });

        GpuCannyStage {
            magdir: compute_pipeline(gpu, "magnitude_direction", &module, "magnitude_direction", &magdir_bgl),
            nms: compute_pipeline(gpu, "non_max_suppress", &module, "non_max_suppress", &nms_bgl),
            classify: compute_pipeline(gpu, "classify", &module, "classify", &classify_bgl),
            magdir_bgl,
            nms_bgl,
            classify_bgl,
        }
    }

    /// Encode all three GPU passes. After submission and sync, read
    /// `bufs.aux` back as the class buffer and run hysteresis on the CPU.
    pub fn encode(
        &self,
        gpu: &GpuDevice,
        encoder: &mut wgpu::CommandEncoder,
        bufs: &FrameBuffers,
        low: f32,
        high: f32,
    ) {
        let params = gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("GpuCannyStage params"),
                contents: bytemuck::bytes_of(&CannyParams {
                    width: bufs.width,
                    height: bufs.height,
                    low,
                    high,
                }),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let (dx, dy) = gpu.dispatch_size(bufs.width, bufs.height);

        let bg = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("GpuCannyStage magdir BG"),
            layout: &self.magdir_bgl,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: bufs.gx.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: bufs.gy.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: bufs.response.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: bufs.aux.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 6, resource: params.as_entire_binding() },
            ],
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("magnitude_direction"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.magdir);
            pass.set_bind_group(0, &bg, &[]);
            pass.dispatch_workgroups(dx, dy, 1);
        }

        let bg = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("GpuCannyStage nms BG"),
            layout: &self.nms_bgl,
            entries: &[
                wgpu::BindGroupEntry { binding: 2, resource: bufs.response.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: bufs.aux.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 4, resource: bufs.scratch.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 6, resource: params.as_entire_binding() },
            ],
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("non_max_suppress"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.nms);
            pass.set_bind_group(0, &bg, &[]);
            pass.dispatch_workgroups(dx, dy, 1);
        }

        let bg = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("GpuCannyStage classify BG"),
            layout: &self.classify_bgl,
            entries: &[
                wgpu::BindGroupEntry { binding: 4, resource: bufs.scratch.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 5, resource: bufs.aux.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 6, resource: params.as_entire_binding() },
            ],
        });
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("classify"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.classify);
        pass.set_bind_group(0, &bg, &[]);
        pass.dispatch_workgroups(dx, dy, 1);
    }
}
