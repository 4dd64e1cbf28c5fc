// canny.rs — Canny edge detection on gradient buffers.
//
// Stages, each re-runnable from scratch (no state is retained between
// calls, so interactive per-frame thresholds are safe):
//   1. Gradient magnitude and direction, direction discretized into four
//      sectors (0°, 45°, 90°, 135°).
//   2. Non-maximum suppression: a pixel survives only if its magnitude is
//      not below either neighbor along the gradient direction.
//   3. Double-threshold classification: strong (>= high), weak
//      ([low, high)), rejected (< low).
//   4. Hysteresis linking: weak pixels join the edge set only if connected
//      (8-neighborhood) to a strong pixel, transitively. Implemented with
//      an explicit stack, not recursion.
//
// With low == high the weak band is empty and the result degenerates to
// the non-max-suppressed strong set alone.

use crate::image::Image;

/// Pixel classes after double thresholding.
pub const CLASS_REJECTED: u8 = 0;
pub const CLASS_WEAK: u8 = 1;
pub const CLASS_STRONG: u8 = 2;

/// Edge mask foreground value.
pub const EDGE: u8 = 255;

/// Compute gradient magnitude and discretized direction sector.
///
/// Sectors: 0 = horizontal gradient (left/right neighbors), 1 = down-right
/// diagonal, 2 = vertical, 3 = down-left diagonal.
pub fn magnitude_direction(gx: &Image<f32>, gy: &Image<f32>) -> (Image<f32>, Image<u8>) {
    assert_eq!(gx.width(), gy.width(), "gradient dimensions must match");
    assert_eq!(gx.height(), gy.height(), "gradient dimensions must match");

    let w = gx.width();
    let h = gx.height();
    let mut mag = Image::<f32>::new(w, h);
    let mut dir = Image::<u8>::new(w, h);

    for y in 0..h {
        for x in 0..w {
            let dx = gx.get(x, y);
            let dy = gy.get(x, y);
            mag.set(x, y, (dx * dx + dy * dy).sqrt());

            // Fold the angle into [0°, 180°) and quantize to 4 sectors.
            let mut angle = dy.atan2(dx).to_degrees();
            if angle < 0.0 {
                angle += 180.0;
            }
            let sector = if !(22.5..157.5).contains(&angle) {
                0
            } else if angle < 67.5 {
                1
            } else if angle < 112.5 {
                2
            } else {
                3
            };
            dir.set(x, y, sector);
        }
    }
    (mag, dir)
}

/// Suppress pixels that are not a local maximum along their gradient
/// direction. Border neighbors clamp to the edge.
pub fn non_max_suppress(mag: &Image<f32>, dir: &Image<u8>) -> Image<f32> {
    let w = mag.width();
    let h = mag.height();
    let mut out = Image::<f32>::new(w, h);

    for y in 0..h {
        for x in 0..w {
            let m = mag.get(x, y);
            let (dx, dy): (isize, isize) = match dir.get(x, y) {
                0 => (1, 0),
                1 => (1, 1),
                2 => (0, 1),
                _ => (1, -1),
            };
            let n1 = mag.get_clamped(x as isize + dx, y as isize + dy);
            let n2 = mag.get_clamped(x as isize - dx, y as isize - dy);
            out.set(x, y, if m >= n1 && m >= n2 { m } else { 0.0 });
        }
    }
    out
}

/// Classify suppressed magnitudes into rejected / weak / strong.
///
/// # Panics
/// Panics if `low > high`.
pub fn classify(suppressed: &Image<f32>, low: f32, high: f32) -> Image<u8> {
    assert!(low <= high, "low threshold ({low}) must be <= high ({high})");
    let mut classes = Image::<u8>::new(suppressed.width(), suppressed.height());
    for (x, y, m) in suppressed.pixels() {
        let c = if m >= high {
            CLASS_STRONG
        } else if m >= low {
            CLASS_WEAK
        } else {
            CLASS_REJECTED
        };
        classes.set(x, y, c);
    }
    classes
}

/// Link weak pixels into the edge set when 8-connected to a strong pixel,
/// transitively. Returns the final binary edge mask.
pub fn hysteresis(classes: &Image<u8>) -> Image<u8> {
    let w = classes.width();
    let h = classes.height();
    let mut mask = Image::<u8>::new(w, h);

    // Seed the stack with every strong pixel, then flood through weak ones.
    let mut stack: Vec<(usize, usize)> = Vec::new();
    for (x, y, c) in classes.pixels() {
        if c == CLASS_STRONG {
            mask.set(x, y, EDGE);
            stack.push((x, y));
        }
    }

    while let Some((x, y)) = stack.pop() {
        for ny in y.saturating_sub(1)..=(y + 1).min(h - 1) {
            for nx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
                if mask.get(nx, ny) == 0 && classes.get(nx, ny) == CLASS_WEAK {
                    mask.set(nx, ny, EDGE);
                    stack.push((nx, ny));
                }
            }
        }
    }
    mask
}

/// Full Canny pass over precomputed gradient buffers.
///
/// # Panics
/// Panics if `low > high` or the gradient dimensions differ.
pub fn canny(gx: &Image<f32>, gy: &Image<f32>, low: f32, high: f32) -> Image<u8> {
    let (mag, dir) = magnitude_direction(gx, gy);
    let suppressed = non_max_suppress(&mag, &dir);
    let classes = classify(&suppressed, low, high);
    hysteresis(&classes)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Gradient pair with `gx` values and zero `gy` (sector 0 everywhere).
    fn horizontal_gradients(w: usize, h: usize, gx_vals: &[f32]) -> (Image<f32>, Image<f32>) {
        (
            Image::from_vec(w, h, gx_vals.to_vec()),
            Image::<f32>::new(w, h),
        )
    }

    #[test]
    fn test_sector_quantization() {
        let gx = Image::from_vec(4, 1, vec![1.0, 1.0, 0.0, -1.0]);
        let gy = Image::from_vec(4, 1, vec![0.0, 1.0, 1.0, 1.0]);
        let (_, dir) = magnitude_direction(&gx, &gy);
        assert_eq!(dir.get(0, 0), 0); // 0°
        assert_eq!(dir.get(1, 0), 1); // 45°
        assert_eq!(dir.get(2, 0), 2); // 90°
        assert_eq!(dir.get(3, 0), 3); // 135°
    }

    #[test]
    fn test_magnitude_is_euclidean() {
        let gx = Image::from_vec(1, 1, vec![3.0]);
        let gy = Image::from_vec(1, 1, vec![4.0]);
        let (mag, _) = magnitude_direction(&gx, &gy);
        assert!((mag.get(0, 0) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_ridge_only() {
        // Horizontal gradient ridge [0, 5, 9, 5, 0]: only the center
        // survives comparison against its left/right neighbors.
        let (gx, gy) = horizontal_gradients(5, 1, &[0.0, 5.0, 9.0, 5.0, 0.0]);
        let (mag, dir) = magnitude_direction(&gx, &gy);
        let s = non_max_suppress(&mag, &dir);
        assert_eq!(s.get(0, 0), 0.0);
        assert_eq!(s.get(1, 0), 0.0);
        assert!((s.get(2, 0) - 9.0).abs() < 1e-6);
        assert_eq!(s.get(3, 0), 0.0);
    }

    #[test]
    fn test_classify_bands() {
        let s = Image::from_vec(4, 1, vec![1.0, 4.0, 7.9, 8.0]);
        let c = classify(&s, 4.0, 8.0);
        assert_eq!(c.get(0, 0), CLASS_REJECTED);
        assert_eq!(c.get(1, 0), CLASS_WEAK);
        assert_eq!(c.get(2, 0), CLASS_WEAK);
        assert_eq!(c.get(3, 0), CLASS_STRONG);
    }

    #[test]
    #[should_panic(expected = "must be <=")]
    fn test_low_above_high_rejected() {
        let s = Image::<f32>::new(2, 2);
        classify(&s, 10.0, 5.0);
    }

    #[test]
    fn test_hysteresis_links_weak_chain() {
        // A horizontal row of magnitudes with vertical gradient direction
        // (gy carries the values), so the row survives NMS intact:
        //   [9, 5, 5, 2]  low=4 high=8
        // 9 is strong; both 5s link transitively; 2 is rejected.
        let gy = Image::from_vec(4, 3, vec![
            0.0, 0.0, 0.0, 0.0,
            9.0, 5.0, 5.0, 2.0,
            0.0, 0.0, 0.0, 0.0,
        ]);
        let gx = Image::<f32>::new(4, 3);
        let mask = canny(&gx, &gy, 4.0, 8.0);
        assert_eq!(mask.get(0, 1), EDGE);
        assert_eq!(mask.get(1, 1), EDGE);
        assert_eq!(mask.get(2, 1), EDGE);
        assert_eq!(mask.get(3, 1), 0);
    }

    #[test]
    fn test_weak_without_strong_dropped() {
        let gy = Image::from_vec(3, 3, vec![
            0.0, 0.0, 0.0,
            5.0, 5.0, 5.0,
            0.0, 0.0, 0.0,
        ]);
        let gx = Image::<f32>::new(3, 3);
        let mask = canny(&gx, &gy, 4.0, 8.0);
        for (_, _, v) in mask.pixels() {
            assert_eq!(v, 0, "weak pixels with no strong anchor must be dropped");
        }
    }

    #[test]
    fn test_low_equals_high_degenerates_to_strong_set() {
        // With low == high there is no weak band: output equals the
        // single-threshold non-max-suppressed strong set.
        let gy = Image::from_vec(4, 3, vec![
            0.0, 0.0, 0.0, 0.0,
            9.0, 5.0, 5.0, 2.0,
            0.0, 0.0, 0.0, 0.0,
        ]);
        let gx = Image::<f32>::new(4, 3);
        let mask = canny(&gx, &gy, 8.0, 8.0);

        let (mag, dir) = magnitude_direction(&gx, &gy);
        let strong_only = classify(&non_max_suppress(&mag, &dir), 8.0, 8.0);
        for (x, y, v) in mask.pixels() {
            let expected = if strong_only.get(x, y) == CLASS_STRONG { EDGE } else { 0 };
            assert_eq!(v, expected, "degenerate mismatch at ({x},{y})");
        }
        // And the weak 5s specifically must be gone.
        assert_eq!(mask.get(1, 1), 0);
        assert_eq!(mask.get(2, 1), 0);
    }

    #[test]
    fn test_rerun_is_stateless() {
        // Re-running with different thresholds must not be influenced by a
        // previous call (interactive mode contract).
        let gy = Image::from_vec(3, 3, vec![
            0.0, 0.0, 0.0,
            9.0, 5.0, 0.0,
            0.0, 0.0, 0.0,
        ]);
        let gx = Image::<f32>::new(3, 3);
        let first = canny(&gx, &gy, 4.0, 8.0);
        assert_eq!(first.get(1, 1), EDGE);
        let second = canny(&gx, &gy, 6.0, 20.0);
        for (_, _, v) in second.pixels() {
            assert_eq!(v, 0);
        }
    }
}
