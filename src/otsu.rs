// otsu.rs — Otsu global thresholding and binarization.
//
// A 256-bin intensity histogram is built from the grayscale buffer; for
// every candidate threshold t the between-class variance of the two
// partitions {v < t} and {v >= t} is computed from cumulative counts and
// sums. The chosen threshold maximizes that variance, ties broken toward
// the lowest candidate for determinism. A perfectly uniform image yields
// variance 0 for every candidate; the threshold is defined as 0 in that
// case rather than being an error.
//
// The foreground convention matches the mask: intensity >= threshold is
// foreground.

use crate::image::Image;

/// Number of intensity bins. Grayscale values are clamped to [0, 255]
/// before binning.
pub const HISTOGRAM_BINS: usize = 256;

/// Build the 256-bin intensity histogram of a grayscale buffer.
pub fn histogram(gray: &Image<f32>) -> [u32; HISTOGRAM_BINS] {
    let mut bins = [0u32; HISTOGRAM_BINS];
    for (_, _, v) in gray.pixels() {
        let b = v.clamp(0.0, 255.0) as usize;
        bins[b] += 1;
    }
    bins
}

/// Select the threshold maximizing between-class variance over a histogram.
///
/// Candidate t partitions intensities into {bin < t} and {bin >= t}.
/// Ties go to the smallest t; an all-one-bin histogram yields 0.
pub fn threshold_from_histogram(bins: &[u32; HISTOGRAM_BINS]) -> u8 {
    let total: u64 = bins.iter().map(|&c| c as u64).sum();
    if total == 0 {
        return 0;
    }
    let total_sum: u64 = bins
        .iter()
        .enumerate()
        .map(|(i, &c)| i as u64 * c as u64)
        .sum();

    let mut best_t = 0u8;
    let mut best_var = 0.0f64;

    // Counts and intensity sum of the lower class {bin < t}.
    let mut count_lo = 0u64;
    let mut sum_lo = 0u64;

    for t in 0..HISTOGRAM_BINS {
        // At candidate t the lower class holds bins [0, t).
        if t > 0 {
            count_lo += bins[t - 1] as u64;
            sum_lo += (t - 1) as u64 * bins[t - 1] as u64;
        }
        let count_hi = total - count_lo;
        if count_lo == 0 || count_hi == 0 {
            continue;
        }
        let mean_lo = sum_lo as f64 / count_lo as f64;
        let mean_hi = (total_sum - sum_lo) as f64 / count_hi as f64;
        let w_lo = count_lo as f64 / total as f64;
        let w_hi = count_hi as f64 / total as f64;
        let diff = mean_lo - mean_hi;
        let var = w_lo * w_hi * diff * diff;

        // Strict comparison keeps the smallest t on ties.
        if var > best_var {
            best_var = var;
            best_t = t as u8;
        }
    }
    best_t
}

/// Otsu threshold of a grayscale buffer.
pub fn otsu_threshold(gray: &Image<f32>) -> u8 {
    threshold_from_histogram(&histogram(gray))
}

/// Elementwise binarization: intensity >= threshold maps to foreground
/// (255), everything else to background (0).
pub fn binarize(gray: &Image<f32>, threshold: u8) -> Image<u8> {
    let mut mask = Image::<u8>::new(gray.width(), gray.height());
    let t = threshold as f32;
    for (x, y, v) in gray.pixels() {
        mask.set(x, y, if v >= t { 255 } else { 0 });
    }
    mask
}
