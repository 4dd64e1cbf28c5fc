// gpu/buffers.rs — per-frame device buffer arena.
//
// `FrameBuffers` owns every storage buffer one pipeline invocation needs.
// All buffers of an invocation live and die together: dropping the arena
// releases everything at once, which covers early-abort paths without any
// manual free bookkeeping.
//
// Layout on the device (one element per pixel, row-major, no padding):
//   raw       u32  — packed RGBA (R | G<<8 | B<<16 | A<<24), also the
//                    annotation target
//   gray      f32  — grayscale
//   blurred   f32  — Gaussian-blurred grayscale
//   scratch   f32  — separable-pass intermediate / NMS output
//   gx, gy    f32  — Sobel gradients
//   response  f32  — corner response or gradient magnitude
//   aux       u32  — direction sectors / edge classes / binary mask
//
// Uploads go through `queue.write_buffer` (the queue's staging ring);
// readbacks copy into a dedicated MAP_READ buffer and block on
// `device.poll(Maintain::Wait)` after the async map request. Streaming
// sessions refresh a previous-frame arena with device-to-device copies
// instead of reallocating.

use crate::frame::Frame;
use crate::gpu::device::{GpuDevice, GpuError};
use crate::image::Image;

/// Bytes per pixel for every stage buffer (u32 or f32).
const BYTES_PER_ELEM: u64 = 4;

/// All device buffers for one frame of one invocation.
pub struct FrameBuffers {
    pub width: u32,
    pub height: u32,
    pub raw: wgpu::Buffer,
    pub gray: wgpu::Buffer,
    pub blurred: wgpu::Buffer,
    pub scratch: wgpu::Buffer,
    pub gx: wgpu::Buffer,
    pub gy: wgpu::Buffer,
    pub response: wgpu::Buffer,
    pub aux: wgpu::Buffer,
    readback: wgpu::Buffer,
}

impl FrameBuffers {
    /// Allocate the full buffer set for a `width`×`height` frame.
    pub fn allocate(gpu: &GpuDevice, width: u32, height: u32) -> Self {
        let size = width as u64 * height as u64 * BYTES_PER_ELEM;
        let storage = |label: &str| {
            gpu.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            })
        };

        FrameBuffers {
            width,
            height,
            raw: storage("FrameBuffers::raw"),
            gray: storage("FrameBuffers::gray"),
            blurred: storage("FrameBuffers::blurred"),
            scratch: storage("FrameBuffers::scratch"),
            gx: storage("FrameBuffers::gx"),
            gy: storage("FrameBuffers::gy"),
            response: storage("FrameBuffers::response"),
            aux: storage("FrameBuffers::aux"),
            readback: gpu.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("FrameBuffers::readback"),
                size,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }),
        }
    }

    /// Number of pixels per stage buffer.
    #[inline]
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Byte size of one stage buffer.
    #[inline]
    pub fn stage_bytes(&self) -> u64 {
        self.pixel_count() as u64 * BYTES_PER_ELEM
    }

    /// Upload a packed RGBA frame into the `raw` buffer.
    ///
    /// # Panics
    /// Panics if the frame dimensions do not match the arena.
    pub fn upload_frame(&self, gpu: &GpuDevice, frame: &Frame) {
        assert_eq!(frame.width() as u32, self.width, "frame width mismatch");
        assert_eq!(frame.height() as u32, self.height, "frame height mismatch");
        // Frame bytes are R,G,B,A in memory; on a little-endian device that
        // is exactly the packed u32 layout the shaders unpack.
        gpu.queue.write_buffer(&self.raw, 0, frame.as_bytes());
    }

    /// Refresh this arena's stage buffers from `src` with device-to-device
    /// copies. Used by streaming sessions to roll "current frame" buffers
    /// into "previous frame" position without reallocation.
    ///
    /// The copies are encoded and submitted; ordering against earlier
    /// submissions on the same queue is implicit.
    pub fn copy_all_from(&self, gpu: &GpuDevice, src: &FrameBuffers) {
        assert_eq!(self.width, src.width, "arena width mismatch");
        assert_eq!(self.height, src.height, "arena height mismatch");

        let bytes = self.stage_bytes();
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("FrameBuffers::copy_all_from"),
            });
        for (from, to) in [
            (&src.raw, &self.raw),
            (&src.gray, &self.gray),
            (&src.blurred, &self.blurred),
            (&src.gx, &self.gx),
            (&src.gy, &self.gy),
            (&src.response, &self.response),
        ] {
            encoder.copy_buffer_to_buffer(from, 0, to, 0, bytes);
        }
        gpu.queue.submit(std::iter::once(encoder.finish()));
    }

    /// Read a stage buffer back as f32. Synchronous: submits a copy, then
    /// blocks until the GPU finishes and the map callback fires.
    pub fn read_f32(&self, gpu: &GpuDevice, buffer: &wgpu::Buffer) -> Result<Vec<f32>, GpuError> {
        let bytes = self.read_bytes(gpu, buffer)?;
        Ok(bytemuck::cast_slice(&bytes).to_vec())
    }

    /// Read a stage buffer back as u32.
    pub fn read_u32(&self, gpu: &GpuDevice, buffer: &wgpu::Buffer) -> Result<Vec<u32>, GpuError> {
        let bytes = self.read_bytes(gpu, buffer)?;
        Ok(bytemuck::cast_slice(&bytes).to_vec())
    }

    /// Read a stage buffer back as an `Image<f32>`.
    pub fn read_image(
        &self,
        gpu: &GpuDevice,
        buffer: &wgpu::Buffer,
    ) -> Result<Image<f32>, GpuError> {
        let data = self.read_f32(gpu, buffer)?;
        Ok(Image::from_vec(
            self.width as usize,
            self.height as usize,
            data,
        ))
    }

    /// Read the `raw` buffer back as a packed RGBA frame.
    pub fn read_frame(&self, gpu: &GpuDevice) -> Result<Frame, GpuError> {
        let bytes = self.read_bytes(gpu, &self.raw)?;
        Ok(Frame::from_rgba(
            self.width as usize,
            self.height as usize,
            bytes,
        ))
    }

    fn read_bytes(&self, gpu: &GpuDevice, buffer: &wgpu::Buffer) -> Result<Vec<u8>, GpuError> {
        let bytes = self.stage_bytes();
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("FrameBuffers::read_bytes"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &self.readback, 0, bytes);
        gpu.queue.submit(std::iter::once(encoder.finish()));

        // The explicit synchronization point: poll until the copy lands and
        // the map callback fires.
        let slice = self.readback.slice(..bytes);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        gpu.device.poll(wgpu::Maintain::Wait);
        rx.recv().map_err(|_| GpuError::ReadbackChannel)??;

        let mapped = slice.get_mapped_range();
        let out = mapped.to_vec();
        drop(mapped);
        self.readback.unmap();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_bytes() {
        // Pure arithmetic, no device needed: 640×480 × 4 bytes.
        assert_eq!(640u64 * 480 * BYTES_PER_ELEM, 1_228_800);
    }

    // ---- GPU round-trip tests (subprocess-isolated) ------------------------
    //
    // Same isolation pattern as gpu::device — dzn crashes on process exit.

    fn run_gpu_test_in_subprocess(test_name: &str) -> String {
        let output = std::process::Command::new("cargo")
            .args([
                "test", "--lib", "--",
                test_name, "--exact", "--ignored", "--nocapture",
            ])
            .output()
            .unwrap_or_else(|e| panic!("failed to spawn subprocess for {test_name}: {e}"));
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        print!("{stdout}");
        eprint!("{stderr}");
        stdout + &stderr
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_frame_upload_round_trip() {
        let _ = env_logger::builder().is_test(true).try_init();
        let gpu = GpuDevice::new().expect("need Vulkan GPU");
        let mut frame = Frame::new(33, 17); // deliberately not workgroup-aligned
        frame.set_pixel(0, 0, [1, 2, 3, 4]);
        frame.set_pixel(32, 16, [250, 251, 252, 253]);

        let bufs = FrameBuffers::allocate(&gpu, 33, 17);
        bufs.upload_frame(&gpu, &frame);
        let back = bufs.read_frame(&gpu).expect("readback");

        assert_eq!(back.pixel(0, 0), [1, 2, 3, 4]);
        assert_eq!(back.pixel(32, 16), [250, 251, 252, 253]);
        assert_eq!(back.as_bytes(), frame.as_bytes());
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_device_to_device_copy() {
        let _ = env_logger::builder().is_test(true).try_init();
        let gpu = GpuDevice::new().expect("need Vulkan GPU");
        let mut frame = Frame::new(8, 8);
        frame.set_pixel(3, 3, [9, 9, 9, 255]);

        let a = FrameBuffers::allocate(&gpu, 8, 8);
        let b = FrameBuffers::allocate(&gpu, 8, 8);
        a.upload_frame(&gpu, &frame);
        b.copy_all_from(&gpu, &a);

        let back = b.read_frame(&gpu).expect("readback");
        assert_eq!(back.pixel(3, 3), [9, 9, 9, 255]);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_frame_upload_round_trip() {
        let out =
            run_gpu_test_in_subprocess("gpu::buffers::tests::inner_frame_upload_round_trip");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_device_to_device_copy() {
        let out = run_gpu_test_in_subprocess("gpu::buffers::tests::inner_device_to_device_copy");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }
}
