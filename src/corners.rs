// corners.rs — Structure-tensor corner response (Harris / Shi-Tomasi).
//
// Algorithm:
//   1. Element-wise gradient products Ix², Iy², Ix·Iy.
//   2. Gaussian-weighted window sum of each product (the blur kernel doubles
//      as the window), giving the per-pixel structure tensor
//      M = [[Sxx, Sxy], [Sxy, Syy]].
//   3. Scalar response:
//        Harris      R = det(M) − k·trace(M)²
//        Shi-Tomasi  R = smaller eigenvalue of M
//   4. Acceptance: R ≥ rel_threshold × max response over the frame. The
//      absolute threshold is derived per frame, so the rule adapts to frame
//      contrast; the streaming flow driver reuses it as the score floor for
//      correspondence matching.
//
// Both response functions are invariant under 90°/180° rotations of the
// input: det, trace, and eigenvalues do not change when Ix/Iy swap roles.

use crate::convolution::convolve_2d;
use crate::frame::Frame;
use crate::image::Image;
use crate::kernels::Kernel2d;

/// Marker color for annotated corners.
pub const MARKER_RGBA: [u8; 4] = [255, 0, 0, 255];

/// Which scalar response to derive from the structure tensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResponseKind {
    /// det(M) − k·trace(M)². Typical k: 0.04–0.06.
    Harris { k: f32 },
    /// Smaller eigenvalue of M.
    ShiTomasi,
}

/// Compute the corner response map from gradient images.
///
/// `gx` and `gy` are the Sobel gradients of the blurred frame; `window` is
/// the Gaussian weighting window (normally the blur kernel).
///
/// # Panics
/// Panics if `gx` and `gy` dimensions differ.
pub fn response_map(
    gx: &Image<f32>,
    gy: &Image<f32>,
    window: &Kernel2d,
    kind: ResponseKind,
) -> Image<f32> {
    assert_eq!(gx.width(), gy.width(), "gradient dimensions must match");
    assert_eq!(gx.height(), gy.height(), "gradient dimensions must match");

    let w = gx.width();
    let h = gx.height();

    let mut ix2 = Image::<f32>::new(w, h);
    let mut iy2 = Image::<f32>::new(w, h);
    let mut ixiy = Image::<f32>::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let dx = gx.get(x, y);
            let dy = gy.get(x, y);
            ix2.set(x, y, dx * dx);
            iy2.set(x, y, dy * dy);
            ixiy.set(x, y, dx * dy);
        }
    }

    let sxx = convolve_2d(&ix2, window);
    let syy = convolve_2d(&iy2, window);
    let sxy = convolve_2d(&ixiy, window);

    let mut response = Image::<f32>::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let a = sxx.get(x, y);
            let b = syy.get(x, y);
            let c = sxy.get(x, y);
            let r = match kind {
                ResponseKind::Harris { k } => {
                    let det = a * b - c * c;
                    let trace = a + b;
                    det - k * trace * trace
                }
                ResponseKind::ShiTomasi => {
                    // Smaller eigenvalue of [[a, c], [c, b]].
                    let mean = 0.5 * (a + b);
                    let d = 0.5 * (a - b);
                    mean - (d * d + c * c).sqrt()
                }
            };
            response.set(x, y, r);
        }
    }
    response
}

/// Derive the per-frame acceptance threshold: `rel` times the maximum
/// response. A frame with no positive response yields 0 (nothing accepted
/// above it but the value stays usable as a flow score floor).
pub fn acceptance_threshold(response: &Image<f32>, rel: f32) -> f32 {
    let max = response
        .pixels()
        .map(|(_, _, v)| v)
        .fold(0.0f32, f32::max);
    rel * max
}

/// Draw markers into `frame` at every pixel whose response is at or above
/// `threshold`. Mutates the frame in place; returns the number of accepted
/// corners.
///
/// # Panics
/// Panics if the frame and response dimensions differ.
pub fn annotate(frame: &mut Frame, response: &Image<f32>, threshold: f32) -> usize {
    assert_eq!(frame.width(), response.width());
    assert_eq!(frame.height(), response.height());

    let mut accepted = 0;
    for (x, y, r) in response.pixels() {
        if r >= threshold && r > 0.0 {
            frame.draw_marker(x, y, MARKER_RGBA);
            accepted += 1;
        }
    }
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convolution::convolve_2d;
    use crate::kernels::KernelTables;
    use approx::assert_relative_eq;

    fn gradients(gray: &Image<f32>, tables: &KernelTables) -> (Image<f32>, Image<f32>) {
        let blurred = convolve_2d(gray, &tables.gaussian);
        (
            convolve_2d(&blurred, &tables.sobel_x),
            convolve_2d(&blurred, &tables.sobel_y),
        )
    }

    /// Axis-aligned L-shaped bright region on a dark background.
    fn make_l_pattern(size: usize) -> Image<f32> {
        let mut img = Image::new(size, size);
        for y in 0..size {
            for x in 0..size {
                let in_vertical = (10..18).contains(&x) && (8..30).contains(&y);
                let in_horizontal = (10..28).contains(&x) && (22..30).contains(&y);
                let v = if in_vertical || in_horizontal { 200.0 } else { 20.0 };
                img.set(x, y, v);
            }
        }
        img
    }

    /// Rotate an image 90° clockwise: (x, y) → (h − 1 − y, x).
    fn rot90(img: &Image<f32>) -> Image<f32> {
        let (w, h) = (img.width(), img.height());
        let mut out = Image::new(h, w);
        for (x, y, v) in img.pixels() {
            out.set(h - 1 - y, x, v);
        }
        out
    }

    #[test]
    fn test_flat_image_zero_response() {
        let tables = KernelTables::default();
        let img = Image::from_vec(20, 20, vec![128.0f32; 400]);
        let (gx, gy) = gradients(&img, &tables);
        let r = response_map(&gx, &gy, &tables.gaussian, ResponseKind::Harris { k: 0.04 });
        for (_, _, v) in r.pixels() {
            assert!(v.abs() < 1e-3, "flat image response should be zero, got {v}");
        }
    }

    #[test]
    fn test_straight_edge_no_positive_harris() {
        // A full-height vertical edge has one dominant eigenvalue:
        // det ≈ 0, so Harris response is non-positive along it.
        let tables = KernelTables::default();
        let mut img = Image::<f32>::new(30, 30);
        for y in 0..30 {
            for x in 15..30 {
                img.set(x, y, 200.0);
            }
        }
        let (gx, gy) = gradients(&img, &tables);
        let r = response_map(&gx, &gy, &tables.gaussian, ResponseKind::Harris { k: 0.04 });
        // Interior pixels only: the clamp border interacts with the edge at
        // the top/bottom frame rows.
        for y in 3..27 {
            for x in 3..27 {
                assert!(
                    r.get(x, y) <= 1.0,
                    "edge pixel ({x},{y}) produced corner-like response {}",
                    r.get(x, y)
                );
            }
        }
    }

    #[test]
    fn test_l_corner_has_positive_peak() {
        let tables = KernelTables::default();
        let img = make_l_pattern(40);
        let (gx, gy) = gradients(&img, &tables);
        let r = response_map(&gx, &gy, &tables.gaussian, ResponseKind::Harris { k: 0.04 });
        let max = r.pixels().map(|(_, _, v)| v).fold(f32::MIN, f32::max);
        assert!(max > 0.0, "L pattern should produce a positive corner peak");
    }

    #[test]
    fn test_rotation_invariance_90_180() {
        // The response map of the rotated pattern must equal the rotated
        // response map: same relative peak location, same scores.
        let tables = KernelTables::default();
        let kinds = [ResponseKind::Harris { k: 0.04 }, ResponseKind::ShiTomasi];
        let img = make_l_pattern(40);
        let rot1 = rot90(&img);
        let rot2 = rot90(&rot1);

        for kind in kinds {
            let respond = |im: &Image<f32>| {
                let (gx, gy) = gradients(im, &tables);
                response_map(&gx, &gy, &tables.gaussian, kind)
            };
            let r0 = respond(&img);
            let r90 = respond(&rot1);
            let r180 = respond(&rot2);

            let r0_rot = rot90(&r0);
            let r0_rot2 = rot90(&r0_rot);
            let scale = r0.pixels().map(|(_, _, v)| v.abs()).fold(0.0f32, f32::max);

            for (x, y, v) in r90.pixels() {
                assert!(
                    (v - r0_rot.get(x, y)).abs() <= 1e-3 * scale,
                    "90° rotation mismatch at ({x},{y}): {v} vs {}",
                    r0_rot.get(x, y)
                );
            }
            for (x, y, v) in r180.pixels() {
                assert!(
                    (v - r0_rot2.get(x, y)).abs() <= 1e-3 * scale,
                    "180° rotation mismatch at ({x},{y}): {v} vs {}",
                    r0_rot2.get(x, y)
                );
            }
        }
    }

    #[test]
    fn test_shi_tomasi_is_min_eigenvalue() {
        // For a hand-built tensor the closed form must match: with
        // gx = gy everywhere, M has eigenvalues {0, Sxx + Syy}, so the
        // smaller eigenvalue is ~0.
        let tables = KernelTables::default();
        let g = Image::from_vec(9, 9, vec![3.0f32; 81]);
        let r = response_map(&g, &g, &tables.gaussian, ResponseKind::ShiTomasi);
        for (_, _, v) in r.pixels() {
            assert_relative_eq!(v, 0.0, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_acceptance_threshold_scales_with_max() {
        let mut r = Image::<f32>::new(4, 4);
        r.set(1, 2, 80.0);
        r.set(3, 3, 40.0);
        assert_relative_eq!(acceptance_threshold(&r, 0.5), 40.0);
        assert_relative_eq!(acceptance_threshold(&r, 0.25), 20.0);
    }

    #[test]
    fn test_annotate_marks_and_counts() {
        let mut frame = Frame::new(8, 8);
        let mut r = Image::<f32>::new(8, 8);
        r.set(4, 4, 10.0);
        r.set(1, 1, 2.0);
        let n = annotate(&mut frame, &r, 5.0);
        assert_eq!(n, 1);
        assert_eq!(frame.pixel(4, 4), MARKER_RGBA);
        // Below-threshold pixel untouched.
        assert_eq!(frame.pixel(1, 1), [0, 0, 0, 255]);
    }

    #[test]
    fn test_annotate_ignores_nonpositive_response() {
        let mut frame = Frame::new(4, 4);
        let r = Image::<f32>::new(4, 4);
        // Threshold 0 on an all-zero map accepts nothing.
        assert_eq!(annotate(&mut frame, &r, 0.0), 0);
    }
}
