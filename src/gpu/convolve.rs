// gpu/convolve.rs — dense 2D and separable convolution kernels.
//
// Kernel coefficient tables are uploaded once per invocation as read-only
// storage buffers (`GpuKernel`) and bound to whichever convolution pass
// needs them — blur, Sobel X, Sobel Y, and the structure-tensor window all
// reuse the same pipelines.

use wgpu::util::DeviceExt;

use crate::gpu::device::GpuDevice;
use crate::gpu::{compute_pipeline, storage_entry, uniform_entry};
use crate::kernels::Kernel2d;

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct ConvParams {
    width: u32,
    height: u32,
    kwidth: u32,
    _pad0: u32,
}

/// A coefficient table resident on the device, tied to one frame size.
pub struct GpuKernel {
    pub coeffs: wgpu::Buffer,
    params: wgpu::Buffer,
    pub kwidth: u32,
}

impl GpuKernel {
    /// Upload a coefficient slice (dense row-major table or 1D kernel).
    ///
    /// # Panics
    /// Panics if `kwidth` is even.
    pub fn upload(gpu: &GpuDevice, coeffs: &[f32], kwidth: u32, width: u32, height: u32) -> Self {
        assert!(kwidth % 2 == 1, "kernel width must be odd (got {kwidth})");
        let coeffs = gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("GpuKernel coeffs"),
                contents: bytemuck::cast_slice(coeffs),
                usage: wgpu::BufferUsages::STORAGE,
            });
        let params = gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("GpuKernel params"),
                contents: bytemuck::bytes_of(&ConvParams {
                    width,
                    height,
                    kwidth,
                    _pad0: 0,
                }),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        GpuKernel {
            coeffs,
            params,
            kwidth,
        }
    }

    /// Upload a dense 2D kernel table.
    pub fn upload_2d(gpu: &GpuDevice, kernel: &Kernel2d, width: u32, height: u32) -> Self {
        Self::upload(gpu, kernel.coeffs(), kernel.width() as u32, width, height)
    }
}

/// The convolution engine: one shader module, three entry points.
pub struct GpuConvolveStage {
    conv2d: wgpu::ComputePipeline,
    conv_rows: wgpu::ComputePipeline,
    conv_cols: wgpu::ComputePipeline,
    bgl: wgpu::BindGroupLayout,
}

impl GpuConvolveStage {
    pub fn new(gpu: &GpuDevice) -> Self {
        let module = gpu
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("convolve.wgsl"),
                source: wgpu::ShaderSource::Wgsl(include_str!("../shaders/convolve.wgsl").into()),
            });

        let bgl = gpu
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("GpuConvolveStage BGL"),
                entries: &[
                    storage_entry(0, true),  // src
                    storage_entry(1, false), // dst
                    storage_entry(2, true),  // coeffs
                    uniform_entry(3),
                ],
            });

        GpuConvolveStage {
            conv2d: compute_pipeline(gpu, "conv2d", &module, "conv2d", &bgl),
            conv_rows: compute_pipeline(gpu, "conv_rows", &module, "conv_rows", &bgl),
            conv_cols: compute_pipeline(gpu, "conv_cols", &module, "conv_cols", &bgl),
            bgl,
        }
    }

    fn encode_pass(
        &self,
        gpu: &GpuDevice,
        encoder: &mut wgpu::CommandEncoder,
        pipeline: &wgpu::ComputePipeline,
        label: &str,
        src: &wgpu::Buffer,
        dst: &wgpu::Buffer,
        kernel: &GpuKernel,
        width: u32,
        height: u32,
    ) {
        let bg = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &self.bgl,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: src.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: dst.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: kernel.coeffs.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: kernel.params.as_entire_binding() },
            ],
        });
        let (dx, dy) = gpu.dispatch_size(width, height);
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &bg, &[]);
        pass.dispatch_workgroups(dx, dy, 1);
    }

    /// Dense 2D convolution pass: `src` → `dst`.
    #[allow(clippy::too_many_arguments)]
    pub fn encode_2d(
        &self,
        gpu: &GpuDevice,
        encoder: &mut wgpu::CommandEncoder,
        src: &wgpu::Buffer,
        dst: &wgpu::Buffer,
        kernel: &GpuKernel,
        width: u32,
        height: u32,
    ) {
        self.encode_pass(gpu, encoder, &self.conv2d, "conv2d", src, dst, kernel, width, height);
    }

    /// Horizontal 1D convolution pass.
    #[allow(clippy::too_many_arguments)]
    pub fn encode_rows(
        &self,
        gpu: &GpuDevice,
        encoder: &mut wgpu::CommandEncoder,
        src: &wgpu::Buffer,
        dst: &wgpu::Buffer,
        kernel: &GpuKernel,
        width: u32,
        height: u32,
    ) {
        self.encode_pass(gpu, encoder, &self.conv_rows, "conv_rows", src, dst, kernel, width, height);
    }

    /// Vertical 1D convolution pass.
    #[allow(clippy::too_many_arguments)]
    pub fn encode_cols(
        &self,
        gpu: &GpuDevice,
        encoder: &mut wgpu::CommandEncoder,
        src: &wgpu::Buffer,
        dst: &wgpu::Buffer,
        kernel: &GpuKernel,
        width: u32,
        height: u32,
    ) {
        self.encode_pass(gpu, encoder, &self.conv_cols, "conv_cols", src, dst, kernel, width, height);
    }
}
