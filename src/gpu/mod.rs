// gpu/mod.rs — GPU acceleration layer.
//
// wgpu-based compute kernels mirroring the CPU algorithms in the parent
// crate. The CPU implementations in each sibling module remain the
// authoritative reference — every GPU kernel is validated against them
// pixel-for-pixel.
//
// Architecture: hybrid CPU/GPU model.
//
//   GPU handles all per-pixel compute WITHIN a frame:
//     upload → grayscale → blur → gradients → {corners | canny | otsu | flow}
//
//   CPU handles the small serial steps AFTER an explicit sync point:
//     Otsu threshold scan (O(256)), Canny hysteresis linking, corner
//     acceptance-threshold selection over the read-back response map.
//
// All kernel launches of one invocation go onto the single wgpu queue, so
// stage-to-stage ordering is implicit in issue order; the only barriers are
// the readback sync points.

pub mod buffers;
pub mod canny;
pub mod color;
pub mod convolve;
pub mod corners;
pub mod device;
pub mod flow;
pub mod otsu;
pub mod pipeline;

/// Bind group layout entry for a compute storage buffer.
pub(crate) fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Bind group layout entry for a compute uniform buffer.
pub(crate) fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Create a compute pipeline for one entry point, injecting the device's
/// workgroup size as WGSL override constants.
pub(crate) fn compute_pipeline(
    gpu: &device::GpuDevice,
    label: &str,
    module: &wgpu::ShaderModule,
    entry_point: &str,
    bgl: &wgpu::BindGroupLayout,
) -> wgpu::ComputePipeline {
    let layout = gpu
        .device
        .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(label),
            bind_group_layouts: &[bgl],
            push_constant_ranges: &[],
        });
    let constants = gpu.workgroup_size.as_constants();
    gpu.device
        .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(label),
            layout: Some(&layout),
            module,
            entry_point,
            compilation_options: wgpu::PipelineCompilationOptions {
                constants: &constants,
                ..Default::default()
            },
            cache: None,
        })
}
