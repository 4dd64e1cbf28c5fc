// gpu/pipeline.rs — GPU pipeline driver and streaming session.
//
// `GpuPipeline` compiles every stage pipeline once at construction; each
// `run()` call allocates a fresh `FrameBuffers` arena, issues all kernel
// launches of the invocation in dependency order onto the single queue,
// synchronizes before every host read, and reads back only what the mode
// requires. The arena drops (and releases every device buffer) on all exit
// paths, including early errors.
//
// `StreamSession` is the two-frame flow driver: the first frame only
// primes the previous-frame buffers; every later frame computes its own
// response map, matches against the retained previous map, then rolls the
// buffers forward with device-to-device copies instead of reallocating.
// Cancellation is the caller's decision between `process()` calls — an
// in-flight frame always runs to completion.

use log::debug;

use crate::corners::{self, ResponseKind};
use crate::flow::FlowConfig;
use crate::frame::Frame;
use crate::gpu::buffers::FrameBuffers;
use crate::gpu::canny::GpuCannyStage;
use crate::gpu::color::GpuColorStage;
use crate::gpu::convolve::{GpuConvolveStage, GpuKernel};
use crate::gpu::corners::GpuCornerStage;
use crate::gpu::device::{GpuDevice, GpuError};
use crate::gpu::flow::GpuFlowStage;
use crate::gpu::otsu::GpuOtsuStage;
use crate::image::Image;
use crate::kernels::KernelTables;
use crate::otsu;
use crate::canny;
use crate::pipeline::{FlowOutput, Mode, Output, PipelineConfig, PipelineError, ThresholdSource};

/// Device-resident kernel tables for one frame size.
struct GpuTables {
    gaussian_1d: GpuKernel,
    gaussian_2d: GpuKernel,
    sobel_x: GpuKernel,
    sobel_y: GpuKernel,
}

impl GpuTables {
    fn upload(gpu: &GpuDevice, tables: &KernelTables, width: u32, height: u32) -> Self {
        GpuTables {
            gaussian_1d: GpuKernel::upload(
                gpu,
                &tables.gaussian_1d,
                tables.gaussian_1d.len() as u32,
                width,
                height,
            ),
            gaussian_2d: GpuKernel::upload_2d(gpu, &tables.gaussian, width, height),
            sobel_x: GpuKernel::upload_2d(gpu, &tables.sobel_x, width, height),
            sobel_y: GpuKernel::upload_2d(gpu, &tables.sobel_y, width, height),
        }
    }
}

/// All compiled GPU stages plus the device they run on.
pub struct GpuPipeline {
    gpu: GpuDevice,
    color: GpuColorStage,
    convolve: GpuConvolveStage,
    corners: GpuCornerStage,
    canny: GpuCannyStage,
    otsu: GpuOtsuStage,
    flow: GpuFlowStage,
}

impl GpuPipeline {
    /// Initialize the device and compile every stage pipeline.
    pub fn new() -> Result<Self, GpuError> {
        Ok(Self::with_device(GpuDevice::new()?))
    }

    pub fn with_device(gpu: GpuDevice) -> Self {
        let color = GpuColorStage::new(&gpu);
        let convolve = GpuConvolveStage::new(&gpu);
        let corners = GpuCornerStage::new(&gpu);
        let canny = GpuCannyStage::new(&gpu);
        let otsu = GpuOtsuStage::new(&gpu);
        let flow = GpuFlowStage::new(&gpu);
        GpuPipeline {
            gpu,
            color,
            convolve,
            corners,
            canny,
            otsu,
            flow,
        }
    }

    pub fn device(&self) -> &GpuDevice {
        &self.gpu
    }

    /// Encode the shared front of every mode: grayscale, separable blur,
    /// Sobel gradients. Issue order on the queue is the stage order.
    fn encode_front(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        bufs: &FrameBuffers,
        tables: &GpuTables,
    ) {
        let (w, h) = (bufs.width, bufs.height);
        self.color.encode(&self.gpu, encoder, bufs);
        self.convolve
            .encode_rows(&self.gpu, encoder, &bufs.gray, &bufs.scratch, &tables.gaussian_1d, w, h);
        self.convolve
            .encode_cols(&self.gpu, encoder, &bufs.scratch, &bufs.blurred, &tables.gaussian_1d, w, h);
        self.convolve
            .encode_2d(&self.gpu, encoder, &bufs.blurred, &bufs.gx, &tables.sobel_x, w, h);
        self.convolve
            .encode_2d(&self.gpu, encoder, &bufs.blurred, &bufs.gy, &tables.sobel_y, w, h);
    }

    fn encoder(&self, label: &str) -> wgpu::CommandEncoder {
        self.gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }

    fn submit(&self, encoder: wgpu::CommandEncoder) {
        self.gpu.queue.submit(std::iter::once(encoder.finish()));
    }

    /// Run one single-frame invocation on the device. Semantics match the
    /// CPU driver (`crate::pipeline::run`) output-for-output.
    pub fn run(
        &self,
        frame: &Frame,
        mode: Mode,
        config: &PipelineConfig,
    ) -> Result<Output, PipelineError> {
        if frame.is_empty() {
            return Err(PipelineError::EmptyFrame);
        }
        config.validate()?;

        let (w, h) = (frame.width() as u32, frame.height() as u32);
        let host_tables = KernelTables::build(config.blur_width, config.blur_sigma);
        let tables = GpuTables::upload(&self.gpu, &host_tables, w, h);
        let bufs = FrameBuffers::allocate(&self.gpu, w, h);
        bufs.upload_frame(&self.gpu, frame);

        match mode {
            Mode::Corners { kind, annotate } => {
                let mut encoder = self.encoder("corners invocation");
                self.encode_front(&mut encoder, &bufs, &tables);
                self.corners
                    .encode_response(&self.gpu, &mut encoder, &bufs, &tables.gaussian_2d, kind);
                self.submit(encoder);

                // Sync point: the threshold scan needs the full map on the
                // host.
                let response = bufs.read_image(&self.gpu, &bufs.response)?;
                let threshold = corners::acceptance_threshold(&response, config.rel_threshold);
                let count = response
                    .pixels()
                    .filter(|&(_, _, r)| r >= threshold && r > 0.0)
                    .count();

                let annotated = if annotate {
                    let mut encoder = self.encoder("annotate");
                    self.corners
                        .encode_annotate(&self.gpu, &mut encoder, &bufs, kind, threshold);
                    self.submit(encoder);
                    Some(bufs.read_frame(&self.gpu)?)
                } else {
                    None
                };
                debug!("gpu corner stage: {count} accepted at threshold {threshold}");
                Ok(Output::Corners {
                    annotated,
                    response,
                    count,
                    threshold,
                })
            }
            Mode::Edges { thresholds } => {
                let mut encoder = self.encoder("edges invocation");
                self.encode_front(&mut encoder, &bufs, &tables);
                let (low, high) = match thresholds {
                    ThresholdSource::Manual { low, high } => {
                        if !(low <= high) {
                            return Err(PipelineError::InvalidConfig(format!(
                                "canny low threshold ({low}) must be <= high ({high})"
                            )));
                        }
                        self.submit(encoder);
                        (low, high)
                    }
                    ThresholdSource::Auto => {
                        let hist = self
                            .otsu
                            .encode_histogram(&self.gpu, &mut encoder, &bufs, &bufs.blurred);
                        self.submit(encoder);
                        let bins = hist.read(&self.gpu)?;
                        let high = otsu::threshold_from_histogram(&bins) as f32;
                        (high / 2.0, high)
                    }
                };

                let mut encoder = self.encoder("canny passes");
                self.canny.encode(&self.gpu, &mut encoder, &bufs, low, high);
                self.submit(encoder);

                // Hysteresis is a serial flood fill: read the classes back
                // and finish on the CPU.
                let raw_classes = bufs.read_u32(&self.gpu, &bufs.aux)?;
                let classes = Image::from_vec(
                    w as usize,
                    h as usize,
                    raw_classes.iter().map(|&c| c as u8).collect(),
                );
                let mask = canny::hysteresis(&classes);
                debug!("gpu edge stage: thresholds low={low} high={high}");
                Ok(Output::Edges { mask, low, high })
            }
            Mode::Binarize => {
                let mut encoder = self.encoder("binarize invocation");
                self.color.encode(&self.gpu, &mut encoder, &bufs);
                let hist = self
                    .otsu
                    .encode_histogram(&self.gpu, &mut encoder, &bufs, &bufs.gray);
                self.submit(encoder);

                let bins = hist.read(&self.gpu)?;
                let threshold = otsu::threshold_from_histogram(&bins);

                let mut encoder = self.encoder("binarize pass");
                self.otsu.encode_binarize(
                    &self.gpu,
                    &mut encoder,
                    &bufs,
                    &bufs.gray,
                    threshold as f32,
                );
                self.submit(encoder);

                let raw_mask = bufs.read_u32(&self.gpu, &bufs.aux)?;
                let mask = Image::from_vec(
                    w as usize,
                    h as usize,
                    raw_mask.iter().map(|&v| v as u8).collect(),
                );
                debug!("gpu binarization stage: otsu threshold {threshold}");
                Ok(Output::Binary { mask, threshold })
            }
        }
    }

    /// Compute the front stages plus the corner response for one frame into
    /// an arena, returning the host copy of the response map.
    fn response_into(
        &self,
        frame: &Frame,
        bufs: &FrameBuffers,
        tables: &GpuTables,
        kind: ResponseKind,
    ) -> Result<Image<f32>, GpuError> {
        bufs.upload_frame(&self.gpu, frame);
        let mut encoder = self.encoder("response invocation");
        self.encode_front(&mut encoder, bufs, tables);
        self.corners
            .encode_response(&self.gpu, &mut encoder, bufs, &tables.gaussian_2d, kind);
        self.submit(encoder);
        bufs.read_image(&self.gpu, &bufs.response)
    }

    /// One-shot two-frame flow invocation. For video streams use
    /// [`StreamSession`], which reuses previous-frame buffers.
    pub fn run_flow(
        &self,
        frame1: &Frame,
        frame2: &Frame,
        kind: ResponseKind,
        config: &PipelineConfig,
    ) -> Result<FlowOutput, PipelineError> {
        if frame1.is_empty() || frame2.is_empty() {
            return Err(PipelineError::EmptyFrame);
        }
        if frame1.width() != frame2.width() || frame1.height() != frame2.height() {
            return Err(PipelineError::DimensionMismatch(
                frame1.width(),
                frame1.height(),
                frame2.width(),
                frame2.height(),
            ));
        }
        config.validate()?;

        let (w, h) = (frame1.width() as u32, frame1.height() as u32);
        let host_tables = KernelTables::build(config.blur_width, config.blur_sigma);
        let tables = GpuTables::upload(&self.gpu, &host_tables, w, h);
        let bufs1 = FrameBuffers::allocate(&self.gpu, w, h);
        let bufs2 = FrameBuffers::allocate(&self.gpu, w, h);

        let map1 = self.response_into(frame1, &bufs1, &tables, kind)?;
        self.response_into(frame2, &bufs2, &tables, kind)?;

        let score_floor = corners::acceptance_threshold(&map1, config.rel_threshold);
        let flow_cfg = FlowConfig {
            score_floor,
            tolerance: config.flow_tolerance,
            radius: config.flow_radius,
        };
        let field = self.flow.run(&self.gpu, w, h, &bufs1.response, &bufs2.response, &flow_cfg)?;
        let average_motion = field.average_motion();
        debug!("gpu flow stage: {} matches, score floor {score_floor}", field.len());
        Ok(FlowOutput {
            field,
            average_motion,
            score_floor,
        })
    }

    /// Open a streaming flow session. Frame dimensions are fixed by the
    /// first frame processed.
    pub fn stream(&self, kind: ResponseKind, config: PipelineConfig) -> StreamSession<'_> {
        StreamSession {
            pipe: self,
            kind,
            config,
            state: None,
        }
    }
}

struct StreamState {
    tables: GpuTables,
    prev: FrameBuffers,
    curr: FrameBuffers,
    prev_floor: f32,
    width: u32,
    height: u32,
}

/// Streaming flow over a frame sequence.
///
/// Buffers for the previous frame persist across iterations; at the end of
/// each iteration the current frame's buffers are copied device-to-device
/// into previous position, so the per-iteration cost is one frame's
/// compute plus the copies — no reallocation. The session owns no frames
/// and checks nothing between calls: the caller's loop decides when to
/// stop.
pub struct StreamSession<'a> {
    pipe: &'a GpuPipeline,
    kind: ResponseKind,
    config: PipelineConfig,
    state: Option<StreamState>,
}

impl StreamSession<'_> {
    /// Feed the next frame. Returns `Ok(None)` for the first frame (it
    /// only primes the previous-frame buffers) and the flow against the
    /// previous frame for every later one.
    pub fn process(&mut self, frame: &Frame) -> Result<Option<FlowOutput>, PipelineError> {
        if frame.is_empty() {
            return Err(PipelineError::EmptyFrame);
        }
        self.config.validate()?;
        let gpu = &self.pipe.gpu;
        let (w, h) = (frame.width() as u32, frame.height() as u32);

        let Some(state) = self.state.as_mut() else {
            // First frame: allocate both arenas and prime "previous".
            let host_tables = KernelTables::build(self.config.blur_width, self.config.blur_sigma);
            let tables = GpuTables::upload(gpu, &host_tables, w, h);
            let prev = FrameBuffers::allocate(gpu, w, h);
            let curr = FrameBuffers::allocate(gpu, w, h);
            let map = self.pipe.response_into(frame, &prev, &tables, self.kind)?;
            let prev_floor = corners::acceptance_threshold(&map, self.config.rel_threshold);
            self.state = Some(StreamState {
                tables,
                prev,
                curr,
                prev_floor,
                width: w,
                height: h,
            });
            return Ok(None);
        };

        if w != state.width || h != state.height {
            return Err(PipelineError::DimensionMismatch(
                state.width as usize,
                state.height as usize,
                w as usize,
                h as usize,
            ));
        }

        let map = self
            .pipe
            .response_into(frame, &state.curr, &state.tables, self.kind)?;

        let flow_cfg = FlowConfig {
            score_floor: state.prev_floor,
            tolerance: self.config.flow_tolerance,
            radius: self.config.flow_radius,
        };
        let field = self.pipe.flow.run(
            gpu,
            w,
            h,
            &state.prev.response,
            &state.curr.response,
            &flow_cfg,
        )?;
        let average_motion = field.average_motion();
        let out = FlowOutput {
            field,
            average_motion,
            score_floor: state.prev_floor,
        };

        // Roll the buffers: current frame becomes previous, on-device.
        state.prev.copy_all_from(gpu, &state.curr);
        state.prev_floor = corners::acceptance_threshold(&map, self.config.rel_threshold);

        Ok(Some(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline as cpu;

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

    fn square_frame(size: usize, x0: usize, y0: usize, side: usize) -> Frame {
        let mut f = Frame::new(size, size);
        for y in y0..(y0 + side).min(size) {
            for x in x0..(x0 + side).min(size) {
                f.set_pixel(x, y, [220, 220, 220, 255]);
            }
        }
        f
    }

    // ---- Inner tests: GPU output vs CPU reference ---------------------------

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_corners_match_cpu_reference() {
        let _ = env_logger::builder().is_test(true).try_init();
        let pipe = GpuPipeline::new().expect("need Vulkan GPU");
        let frame = square_frame(40, 10, 10, 16);
        let cfg = PipelineConfig::default();
        let mode = Mode::Corners {
            kind: ResponseKind::Harris { k: 0.04 },
            annotate: false,
        };

        let gpu_out = pipe.run(&frame, mode, &cfg).expect("gpu run");
        let cpu_out = cpu::run(&frame, mode, &cfg).expect("cpu run");
        match (gpu_out, cpu_out) {
            (
                Output::Corners { response: rg, threshold: tg, count: cg, .. },
                Output::Corners { response: rc, threshold: tc, count: cc, .. },
            ) => {
                let scale = tc.abs().max(1.0);
                assert!((tg - tc).abs() <= 1e-3 * scale, "threshold {tg} vs {tc}");
                assert_eq!(cg, cc, "accepted corner count");
                for (x, y, v) in rc.pixels() {
                    assert!(
                        (v - rg.get(x, y)).abs() <= 1e-2 * scale,
                        "response mismatch at ({x},{y}): cpu {v} gpu {}",
                        rg.get(x, y)
                    );
                }
            }
            _ => panic!("unexpected output variants"),
        }
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_edges_match_cpu_reference() {
        let _ = env_logger::builder().is_test(true).try_init();
        let pipe = GpuPipeline::new().expect("need Vulkan GPU");
        let frame = square_frame(40, 10, 10, 16);
        let cfg = PipelineConfig::default();
        let mode = Mode::Edges {
            thresholds: ThresholdSource::Manual { low: 50.0, high: 100.0 },
        };

        let gpu_out = pipe.run(&frame, mode, &cfg).expect("gpu run");
        let cpu_out = cpu::run(&frame, mode, &cfg).expect("cpu run");
        match (gpu_out, cpu_out) {
            (Output::Edges { mask: mg, .. }, Output::Edges { mask: mc, .. }) => {
                for (x, y, v) in mc.pixels() {
                    assert_eq!(v, mg.get(x, y), "edge mask mismatch at ({x},{y})");
                }
            }
            _ => panic!("unexpected output variants"),
        }
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_binarize_matches_cpu_reference() {
        let _ = env_logger::builder().is_test(true).try_init();
        let pipe = GpuPipeline::new().expect("need Vulkan GPU");
        let frame = square_frame(32, 8, 8, 12);
        let cfg = PipelineConfig::default();

        let gpu_out = pipe.run(&frame, Mode::Binarize, &cfg).expect("gpu run");
        let cpu_out = cpu::run(&frame, Mode::Binarize, &cfg).expect("cpu run");
        match (gpu_out, cpu_out) {
            (
                Output::Binary { mask: mg, threshold: tg },
                Output::Binary { mask: mc, threshold: tc },
            ) => {
                assert_eq!(tg, tc, "otsu threshold");
                for (x, y, v) in mc.pixels() {
                    assert_eq!(v, mg.get(x, y), "mask mismatch at ({x},{y})");
                }
            }
            _ => panic!("unexpected output variants"),
        }
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_flow_identity_on_identical_frames() {
        let _ = env_logger::builder().is_test(true).try_init();
        let pipe = GpuPipeline::new().expect("need Vulkan GPU");
        let frame = square_frame(40, 10, 10, 16);
        let cfg = PipelineConfig::default();

        let out = pipe
            .run_flow(&frame, &frame, ResponseKind::Harris { k: 0.04 }, &cfg)
            .expect("gpu flow");
        assert!(!out.field.is_empty(), "features should match on identical frames");
        for (a, b) in out.field.from_indices().iter().zip(out.field.to_indices()) {
            assert_eq!(a, b, "identity mapping violated");
        }
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_stream_session_rolls_buffers() {
        let _ = env_logger::builder().is_test(true).try_init();
        let pipe = GpuPipeline::new().expect("need Vulkan GPU");
        let mut session = pipe.stream(ResponseKind::Harris { k: 0.04 }, PipelineConfig::default());

        // First frame primes only.
        let f0 = square_frame(48, 10, 10, 16);
        assert!(session.process(&f0).expect("prime").is_none());

        // The square moves right by 2px per frame; motion should track it.
        for step in 1..4 {
            let f = square_frame(48, 10 + 2 * step, 10, 16);
            let out = session.process(&f).expect("iterate").expect("flow output");
            let (ax, _) = out.average_motion.expect("square moved");
            assert!(ax > 0.5, "step {step}: average motion should point right, got {ax}");
        }
        println!("GPU_TEST_OK");
    }

    // ---- Outer wrappers -----------------------------------------------------

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_corners_match_cpu_reference() {
        let out = run_gpu_test_in_subprocess(
            "gpu::pipeline::tests::inner_corners_match_cpu_reference",
        );
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_edges_match_cpu_reference() {
        let out =
            run_gpu_test_in_subprocess("gpu::pipeline::tests::inner_edges_match_cpu_reference");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_binarize_matches_cpu_reference() {
        let out = run_gpu_test_in_subprocess(
            "gpu::pipeline::tests::inner_binarize_matches_cpu_reference",
        );
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_flow_identity_on_identical_frames() {
        let out = run_gpu_test_in_subprocess(
            "gpu::pipeline::tests::inner_flow_identity_on_identical_frames",
        );
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_stream_session_rolls_buffers() {
        let out =
            run_gpu_test_in_subprocess("gpu::pipeline::tests::inner_stream_session_rolls_buffers");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }
}
