// gpu/device.rs — wgpu device abstraction.
//
// Responsibilities:
//   - Enumerate Vulkan adapters and select the first non-CPU one.
//   - Provide `WorkgroupSize` — a workgroup configuration validated against
//     the device limits and used when creating compute pipelines.
//   - Ceiling-division dispatch helper covering a full image.
//
// ADAPTER SELECTION:
// wgpu's default `request_adapter` uses power preference heuristics that
// may grab llvmpipe/softpipe on WSL2 (where the software renderer appears
// as a valid Vulkan device). We enumerate explicitly and prefer real
// hardware over anything reporting DeviceType::Cpu.
//
// WORKGROUP SIZES:
// WGSL `override` constants are injected at pipeline creation time via
// `PipelineCompilationOptions::constants`. This keeps the shader source
// identical across configurations and preserves the shader compilation
// cache (string-formatting the source would defeat the cache).

use std::collections::HashMap;
use std::fmt;

use log::{info, warn};
use thiserror::Error;

/// A workgroup size configuration for 2D compute dispatches.
///
/// The product of both dimensions must not exceed the device's
/// `max_compute_invocations_per_workgroup` limit; construct overrides via
/// `GpuDevice::set_workgroup_size()` which validates this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
}

impl WorkgroupSize {
    /// Total invocations per workgroup (x * y).
    pub fn total(&self) -> u32 {
        self.x * self.y
    }

    /// Return the constants map for `PipelineCompilationOptions`.
    ///
    /// Every compute shader in this crate declares:
    ///
    /// ```wgsl
    /// override WORKGROUP_X: u32 = 16u;
    /// override WORKGROUP_Y: u32 = 8u;
    ///
    /// @compute @workgroup_size(WORKGROUP_X, WORKGROUP_Y, 1)
    /// fn main(...) { ... }
    /// ```
    ///
    /// The returned map is passed directly to
    /// `PipelineCompilationOptions::constants`.
    pub fn as_constants(&self) -> HashMap<String, f64> {
        HashMap::from([
            ("WORKGROUP_X".to_string(), self.x as f64),
            ("WORKGROUP_Y".to_string(), self.y as f64),
        ])
    }
}

impl Default for WorkgroupSize {
    /// 16×8 = 128 invocations: four NVIDIA warps or two AMD wavefronts,
    /// with the 16-wide x dimension matching row-major image layout.
    fn default() -> Self {
        WorkgroupSize { x: 16, y: 8 }
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{} ({} invocations)", self.x, self.y, self.total())
    }
}

/// Cached adapter information for logging and debugging.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:?}, {:?})",
            self.name, self.backend, self.device_type
        )
    }
}

/// Errors from GPU initialization, configuration, and transfers.
#[derive(Debug, Error)]
pub enum GpuError {
    /// No Vulkan adapter found. On WSL2: check that Vulkan is installed and
    /// `vulkaninfo` shows a real GPU.
    #[error("no suitable Vulkan adapter found (only CPU/software renderers visible)")]
    NoSuitableAdapter,
    /// wgpu device request failed (driver issue, unsupported limits, etc.).
    #[error("device request failed: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),
    /// Requested workgroup size exceeds the device's invocation limit.
    #[error("workgroup size {total} exceeds device limit of {max} invocations")]
    WorkgroupTooLarge { total: u32, max: u32 },
    /// A readback buffer map failed.
    #[error("buffer readback failed: {0}")]
    Readback(#[from] wgpu::BufferAsyncError),
    /// The readback map callback never fired.
    #[error("buffer readback channel closed before the map completed")]
    ReadbackChannel,
}

/// The core GPU context: adapter, device, queue.
///
/// Create once and hold for the lifetime of the application — the Vulkan
/// instance and device are expensive to initialize.
///
/// # Field drop order
/// Rust drops struct fields in declaration order (top → bottom).
/// `_instance` is declared last so the `wgpu::Instance` (and its internal
/// Vulkan instance handle) outlives `device` and `queue`. This prevents a
/// crash in dzn (the D3D12-to-Vulkan layer on WSL2) that occurs when the
/// Vulkan instance is destroyed while device-level objects still hold
/// dangling back-references to it.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_info: AdapterInfo,
    pub workgroup_size: WorkgroupSize,
    /// Keeps the `wgpu::Instance` alive until `device` and `queue` are
    /// dropped. Never access this field directly.
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// Create a `GpuDevice` using the best available Vulkan adapter.
    ///
    /// # Errors
    /// Returns `Err` if no adapter is found or the device request fails.
    pub fn new() -> Result<Self, GpuError> {
        pollster::block_on(Self::init_async())
    }

    async fn init_async() -> Result<Self, GpuError> {
        // Request only Vulkan — no DX12, no Metal, no WebGPU.
        //
        // ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER lets wgpu enumerate dzn on
        // WSL2 (which declares itself non-conformant) so it can be chosen
        // over llvmpipe. Compute-only workloads do not rely on any
        // conformance-required rendering behaviour.
        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION
                | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        } else {
            wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        };

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::VULKAN,
            flags,
            ..Default::default()
        });

        // Tiered selection:
        //   DiscreteGpu / IntegratedGpu — real hardware       <- preferred
        //   VirtualGpu / Other          — dzn, VM passthrough <- acceptable
        //   Cpu                         — llvmpipe            <- last resort
        let all_adapters: Vec<wgpu::Adapter> = instance
            .enumerate_adapters(wgpu::Backends::VULKAN)
            .into_iter()
            .collect();

        if all_adapters.is_empty() {
            return Err(GpuError::NoSuitableAdapter);
        }

        for a in &all_adapters {
            let i = a.get_info();
            info!(
                "Vulkan adapter: {} ({:?}, {:?})",
                i.name, i.backend, i.device_type
            );
        }

        let adapter = all_adapters
            .into_iter()
            .find(|a| {
                matches!(
                    a.get_info().device_type,
                    wgpu::DeviceType::DiscreteGpu
                        | wgpu::DeviceType::IntegratedGpu
                        | wgpu::DeviceType::VirtualGpu
                        | wgpu::DeviceType::Other
                )
            })
            .or_else(|| {
                warn!("no hardware adapter found, falling back to software rendering");
                instance
                    .enumerate_adapters(wgpu::Backends::VULKAN)
                    .into_iter()
                    .next()
            })
            .ok_or(GpuError::NoSuitableAdapter)?;

        let raw_info = adapter.get_info();
        let adapter_info = AdapterInfo {
            name: raw_info.name.clone(),
            vendor: raw_info.vendor,
            device: raw_info.device,
            device_type: raw_info.device_type,
            backend: raw_info.backend,
        };
        info!("selected adapter: {adapter_info}");

        // wgpu 22: request_device returns (Device, Queue) directly; the
        // tuple type must be spelled out to help the type inferencer.
        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("visionpipe"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await?;

        Ok(GpuDevice {
            device,
            queue,
            adapter_info,
            workgroup_size: WorkgroupSize::default(),
            _instance: instance,
        })
    }

    /// Override the default workgroup size, validated against the device's
    /// invocation limit.
    pub fn set_workgroup_size(&mut self, x: u32, y: u32) -> Result<(), GpuError> {
        let total = x * y;
        let max = wgpu::Limits::default().max_compute_invocations_per_workgroup;
        if total > max {
            return Err(GpuError::WorkgroupTooLarge { total, max });
        }
        self.workgroup_size = WorkgroupSize { x, y };
        Ok(())
    }

    /// Compute the dispatch dimensions needed to cover an image of the
    /// given size with the active workgroup size.
    ///
    /// Uses ceiling division so every pixel is covered even when the image
    /// dimensions are not multiples of the workgroup size. The shader must
    /// guard against out-of-bounds global IDs:
    /// ```wgsl
    /// if gid.x >= width || gid.y >= height { return; }
    /// ```
    pub fn dispatch_size(&self, img_w: u32, img_h: u32) -> (u32, u32) {
        let dx = (img_w + self.workgroup_size.x - 1) / self.workgroup_size.x;
        let dy = (img_h + self.workgroup_size.y - 1) / self.workgroup_size.y;
        (dx, dy)
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GpuDevice {{ adapter: {}, workgroup: {} }}",
            self.adapter_info, self.workgroup_size
        )
    }
}
