// pipeline.rs — Single-frame CPU pipeline driver.
//
// One invocation = one frame (or one frame pair for flow): validate the
// configuration, reject empty input before anything is allocated, run the
// stages in dependency order, hand back only what the mode asked for. No
// state survives an invocation; interactive callers re-invoke with new
// parameters each frame.

use log::debug;
use thiserror::Error;

use crate::canny;
use crate::convolution::{convolve_2d, convolve_separable};
use crate::corners::{self, ResponseKind};
use crate::flow::{self, FlowConfig, FlowField};
use crate::frame::Frame;
use crate::image::Image;
use crate::kernels::{KernelTables, DEFAULT_BLUR_SIGMA, DEFAULT_BLUR_WIDTH};
use crate::otsu;

/// Pipeline failure. The invocation aborts and releases everything it
/// acquired; no retries are attempted here.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The input frame has zero pixels. Rejected before any allocation.
    #[error("empty input frame")]
    EmptyFrame,
    /// The two frames of a flow invocation have different dimensions.
    #[error("frame dimensions differ: {0}x{1} vs {2}x{3}")]
    DimensionMismatch(usize, usize, usize, usize),
    /// A configuration parameter is out of contract.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A device allocation or transfer failed. The invocation aborts; all
    /// buffers it acquired are released on unwind of the arena.
    #[error("gpu failure: {0}")]
    Gpu(#[from] crate::gpu::device::GpuError),
}

/// Where the Canny thresholds come from.
///
/// Interactive use is `Manual` re-supplied every invocation; the stage holds
/// no state between calls, so per-frame slider values are safe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThresholdSource {
    /// Caller-supplied low/high.
    Manual { low: f32, high: f32 },
    /// high = Otsu threshold of the blurred frame, low = high / 2.
    Auto,
}

/// The selected operation for a single-frame invocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Mode {
    /// Corner response map; optionally annotate accepted corners into a
    /// copy of the input frame.
    Corners { kind: ResponseKind, annotate: bool },
    /// Canny edge mask.
    Edges { thresholds: ThresholdSource },
    /// Otsu binarization of the grayscale frame.
    Binarize,
}

/// Invocation parameters shared by all modes.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    /// Gaussian blur kernel width. Must be odd and nonzero.
    pub blur_width: usize,
    /// Gaussian blur sigma. Must be positive.
    pub blur_sigma: f32,
    /// Corner acceptance threshold as a fraction of the frame's maximum
    /// response. Must lie in (0, 1].
    pub rel_threshold: f32,
    /// Relative score tolerance for correspondence matching.
    pub flow_tolerance: f32,
    /// Search window radius for correspondence matching.
    pub flow_radius: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            blur_width: DEFAULT_BLUR_WIDTH,
            blur_sigma: DEFAULT_BLUR_SIGMA,
            rel_threshold: 0.5,
            flow_tolerance: 0.5,
            flow_radius: 5,
        }
    }
}

impl PipelineConfig {
    /// Check every parameter against its contract.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.blur_width == 0 || self.blur_width % 2 == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "blur width must be odd and nonzero, got {}",
                self.blur_width
            )));
        }
        if self.blur_sigma <= 0.0 {
            return Err(PipelineError::InvalidConfig(format!(
                "blur sigma must be positive, got {}",
                self.blur_sigma
            )));
        }
        if !(self.rel_threshold > 0.0 && self.rel_threshold <= 1.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "relative threshold must lie in (0, 1], got {}",
                self.rel_threshold
            )));
        }
        if self.flow_tolerance < 0.0 {
            return Err(PipelineError::InvalidConfig(format!(
                "flow tolerance must be non-negative, got {}",
                self.flow_tolerance
            )));
        }
        Ok(())
    }
}

/// What a single-frame invocation hands back. Only the buffers the mode
/// requires are produced.
#[derive(Debug)]
pub enum Output {
    Corners {
        /// Annotated copy of the input, present when annotation was asked for.
        annotated: Option<Frame>,
        /// Raw per-pixel response map.
        response: Image<f32>,
        /// Number of accepted corners.
        count: usize,
        /// The absolute acceptance threshold the stage derived.
        threshold: f32,
    },
    Edges {
        mask: Image<u8>,
        /// The thresholds actually applied (resolved from `Auto` if needed).
        low: f32,
        high: f32,
    },
    Binary {
        mask: Image<u8>,
        threshold: u8,
    },
}

/// Result of a two-frame flow invocation.
#[derive(Debug)]
pub struct FlowOutput {
    pub field: FlowField,
    /// Average motion vector over moving matches, if any match moved.
    pub average_motion: Option<(f32, f32)>,
    /// The score floor derived from frame 1's response map.
    pub score_floor: f32,
}

/// Shared front of every mode: grayscale, blur, Sobel gradients.
struct Stages {
    blurred: Image<f32>,
    gx: Image<f32>,
    gy: Image<f32>,
}

fn run_front(frame: &Frame, tables: &KernelTables) -> Stages {
    let gray = frame.to_gray();
    let blurred = convolve_separable(&gray, &tables.gaussian_1d, &tables.gaussian_1d);
    let gx = convolve_2d(&blurred, &tables.sobel_x);
    let gy = convolve_2d(&blurred, &tables.sobel_y);
    debug!(
        "front stages done: {}x{} gray/blur/gradients",
        frame.width(),
        frame.height()
    );
    Stages { blurred, gx, gy }
}

/// Run one single-frame invocation.
pub fn run(frame: &Frame, mode: Mode, config: &PipelineConfig) -> Result<Output, PipelineError> {
    if frame.is_empty() {
        return Err(PipelineError::EmptyFrame);
    }
    config.validate()?;

    let tables = KernelTables::build(config.blur_width, config.blur_sigma);

    match mode {
        Mode::Corners { kind, annotate } => {
            let s = run_front(frame, &tables);
            let response = corners::response_map(&s.gx, &s.gy, &tables.gaussian, kind);
            let threshold = corners::acceptance_threshold(&response, config.rel_threshold);

            let (annotated, count) = if annotate {
                let mut out = frame.clone();
                let count = corners::annotate(&mut out, &response, threshold);
                (Some(out), count)
            } else {
                let count = response
                    .pixels()
                    .filter(|&(_, _, r)| r >= threshold && r > 0.0)
                    .count();
                (None, count)
            };
            debug!("corner stage: {count} accepted at threshold {threshold}");
            Ok(Output::Corners {
                annotated,
                response,
                count,
                threshold,
            })
        }
        Mode::Edges { thresholds } => {
            let s = run_front(frame, &tables);
            let (low, high) = match thresholds {
                ThresholdSource::Manual { low, high } => {
                    if !(low <= high) {
                        return Err(PipelineError::InvalidConfig(format!(
                            "canny low threshold ({low}) must be <= high ({high})"
                        )));
                    }
                    (low, high)
                }
                ThresholdSource::Auto => {
                    let high = otsu::otsu_threshold(&s.blurred) as f32;
                    (high / 2.0, high)
                }
            };
            debug!("edge stage: thresholds low={low} high={high}");
            let mask = canny::canny(&s.gx, &s.gy, low, high);
            Ok(Output::Edges { mask, low, high })
        }
        Mode::Binarize => {
            let gray = frame.to_gray();
            let threshold = otsu::otsu_threshold(&gray);
            debug!("binarization stage: otsu threshold {threshold}");
            let mask = otsu::binarize(&gray, threshold);
            Ok(Output::Binary { mask, threshold })
        }
    }
}

/// Run the two-frame correspondence invocation: corner responses for both
/// frames, frame 1's acceptance threshold reused as the matching score
/// floor, greedy windowed matching.
pub fn run_flow(
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

    let tables = KernelTables::build(config.blur_width, config.blur_sigma);

    let s1 = run_front(frame1, &tables);
    let s2 = run_front(frame2, &tables);
    let map1 = corners::response_map(&s1.gx, &s1.gy, &tables.gaussian, kind);
    let map2 = corners::response_map(&s2.gx, &s2.gy, &tables.gaussian, kind);

    let score_floor = corners::acceptance_threshold(&map1, config.rel_threshold);
    let flow_cfg = FlowConfig {
        score_floor,
        tolerance: config.flow_tolerance,
        radius: config.flow_radius,
    };
    let field = flow::match_features(&map1, &map2, &flow_cfg);
    let average_motion = field.average_motion();
    debug!(
        "flow stage: {} matches, score floor {score_floor}",
        field.len()
    );

    Ok(FlowOutput {
        field,
        average_motion,
        score_floor,
    })
}
