// gpu/flow.rs — correspondence-matching kernel.
//
// One thread per pixel of the first response map; accepted (from, to) index
// pairs are appended through an atomic counter. Append order is
// nondeterministic across runs, the pair set is not. The counter is read
// back first, then exactly `count` pairs from each index buffer.

use crate::flow::{FlowConfig, FlowField};
use crate::gpu::device::{GpuDevice, GpuError};
use crate::gpu::{compute_pipeline, storage_entry, uniform_entry};
use wgpu::util::DeviceExt;

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct FlowParams {
    width: u32,
    height: u32,
    radius: i32,
    score_floor: f32,
    tolerance: f32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

pub struct GpuFlowStage {
    pipeline: wgpu::ComputePipeline,
    bgl: wgpu::BindGroupLayout,
}

impl GpuFlowStage {
    pub fn new(gpu: &GpuDevice) -> Self {
        let module = gpu
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("flow.wgsl"),
                source: wgpu::ShaderSource::Wgsl(include_str!("../shaders/flow.wgsl").into()),
            });
        let bgl = gpu
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("GpuFlowStage BGL"),
                entries: &[
                    storage_entry(0, true),  // map1
                    storage_entry(1, true),  // map2
                    storage_entry(2, false), // pairs_from
                    storage_entry(3, false), // pairs_to
                    storage_entry(4, false), // count
                    uniform_entry(5),
                ],
            });
        let pipeline = compute_pipeline(gpu, "match_features", &module, "match_features", &bgl);
        GpuFlowStage { pipeline, bgl }
    }

    /// Run the matching kernel over two device-resident response maps of
    /// identical `width`×`height` and read the accepted pairs back.
    pub fn run(
        &self,
        gpu: &GpuDevice,
        width: u32,
        height: u32,
        map1: &wgpu::Buffer,
        map2: &wgpu::Buffer,
        cfg: &FlowConfig,
    ) -> Result<FlowField, GpuError> {
        let pixels = width as u64 * height as u64;
        let pair_bytes = pixels * 4;

        let mk_pairs = |label: &str| {
            gpu.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: pair_bytes,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            })
        };
        let pairs_from = mk_pairs("GpuFlowStage pairs_from");
        let pairs_to = mk_pairs("GpuFlowStage pairs_to");
        let count = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("GpuFlowStage count"),
            size: 4,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let params = gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("GpuFlowStage params"),
                contents: bytemuck::bytes_of(&FlowParams {
                    width,
                    height,
                    radius: cfg.radius as i32,
                    score_floor: cfg.score_floor,
                    tolerance: cfg.tolerance,
                    _pad0: 0,
                    _pad1: 0,
                    _pad2: 0,
                }),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let bg = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("GpuFlowStage BG"),
            layout: &self.bgl,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: map1.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: map2.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: pairs_from.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: pairs_to.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 4, resource: count.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 5, resource: params.as_entire_binding() },
            ],
        });

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("GpuFlowStage"),
            });
        encoder.clear_buffer(&count, 0, None);
        {
            let (dx, dy) = gpu.dispatch_size(width, height);
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("match_features"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bg, &[]);
            pass.dispatch_workgroups(dx, dy, 1);
        }
        gpu.queue.submit(std::iter::once(encoder.finish()));

        let n = read_u32s(gpu, &count, 1)?[0] as u64;
        if n == 0 {
            return Ok(FlowField::from_parts(Vec::new(), Vec::new(), width as usize));
        }

        let from = read_u32s(gpu, &pairs_from, n)?;
        let to = read_u32s(gpu, &pairs_to, n)?;
        Ok(FlowField::from_parts(from, to, width as usize))
    }
}

/// Copy the first `n` u32 elements of `src` into a fresh readback buffer
/// and block until mapped.
fn read_u32s(gpu: &GpuDevice, src: &wgpu::Buffer, n: u64) -> Result<Vec<u32>, GpuError> {
    let bytes = n * 4;
    let rb = gpu.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("GpuFlowStage readback"),
        size: bytes,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let mut encoder = gpu
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("GpuFlowStage readback"),
        });
    encoder.copy_buffer_to_buffer(src, 0, &rb, 0, bytes);
    gpu.queue.submit(std::iter::once(encoder.finish()));

    let slice = rb.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |r| {
        let _ = tx.send(r);
    });
    gpu.device.poll(wgpu::Maintain::Wait);
    rx.recv().map_err(|_| GpuError::ReadbackChannel)??;

    let mapped = slice.get_mapped_range();
    let out: Vec<u32> = bytemuck::cast_slice(&mapped).to_vec();
    drop(mapped);
    rb.unmap();
    Ok(out)
}
