// convolution.rs — Dense 2D and separable convolution for Image<T>.
//
// Two forms with identical semantics:
//   convolve_2d        — one pass with a dense odd-sized square kernel
//   convolve_separable — horizontal then vertical 1D pass; numerically
//                        equivalent to convolve_2d when the dense kernel is
//                        the outer product of the two 1D factors
//
// BORDER HANDLING: clamp-to-edge. When the kernel window extends beyond the
// image boundary, out-of-bounds samples reuse the nearest in-bounds pixel.
// The pipeline has no padding stage, so the border policy is fixed here for
// reproducible output.
//
// Convolution is linear in its input: convolve(a·I1 + b·I2, K) equals
// a·convolve(I1, K) + b·convolve(I2, K).

use crate::image::{Image, Pixel};
use crate::kernels::Kernel2d;

/// Dense 2D convolution with an odd-sized square kernel.
///
/// Each output pixel is the weighted sum of the input neighborhood under
/// the kernel, clamp-to-edge at the borders. Output is f32 regardless of
/// input pixel type because accumulation is in f32.
pub fn convolve_2d<T: Pixel>(src: &Image<T>, kernel: &Kernel2d) -> Image<f32> {
    let w = src.width();
    let h = src.height();
    let half = kernel.half() as isize;
    let mut dst = Image::<f32>::new(w, h);

    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0f32;
            for ky in -half..=half {
                for kx in -half..=half {
                    let s = src.get_clamped(x as isize + kx, y as isize + ky);
                    let kv = kernel.at((kx + half) as usize, (ky + half) as usize);
                    acc += s.to_f32() * kv;
                }
            }
            dst.set(x, y, acc);
        }
    }
    dst
}

/// Convolve each row of `src` with a 1D kernel (horizontal pass).
///
/// The kernel is applied centered: for a kernel of length K, the center
/// element is at index K/2. Interior pixels use unchecked access; border
/// pixels use clamped access, mirroring GPU clamp-to-edge addressing.
///
/// # Panics
/// Panics if the kernel is empty or has even length.
pub fn convolve_rows<T: Pixel>(src: &Image<T>, kernel: &[f32]) -> Image<f32> {
    assert!(!kernel.is_empty(), "kernel must not be empty");
    assert!(
        kernel.len() % 2 == 1,
        "kernel length must be odd (got {})",
        kernel.len()
    );

    let w = src.width();
    let h = src.height();
    let half = kernel.len() / 2;
    let mut dst = Image::<f32>::new(w, h);

    for y in 0..h {
        // Left border: x in [0, half)
        for x in 0..half.min(w) {
            let mut acc = 0.0f32;
            for (ki, &kv) in kernel.iter().enumerate() {
                let sx = (x + ki) as isize - half as isize;
                acc += src.get_clamped(sx, y as isize).to_f32() * kv;
            }
            dst.set(x, y, acc);
        }

        // Interior: x in [half, w - half) — no bounds checks needed.
        if w > 2 * half {
            for x in half..(w - half) {
                let mut acc = 0.0f32;
                // SAFETY: x - half >= 0 and x + half < w, all within bounds.
                unsafe {
                    for (ki, &kv) in kernel.iter().enumerate() {
                        let sx = x + ki - half;
                        acc += src.get_unchecked(sx, y).to_f32() * kv;
                    }
                    dst.set_unchecked(x, y, acc);
                }
            }
        }

        // Right border: x in [w - half, w)
        let right_start = if w > half { w - half } else { half.min(w) };
        for x in right_start..w {
            let mut acc = 0.0f32;
            for (ki, &kv) in kernel.iter().enumerate() {
                let sx = (x + ki) as isize - half as isize;
                acc += src.get_clamped(sx, y as isize).to_f32() * kv;
            }
            dst.set(x, y, acc);
        }
    }
    dst
}

/// Convolve each column of `src` with a 1D kernel (vertical pass).
///
/// Input is f32 (the output of `convolve_rows`). Interior/border split as
/// in `convolve_rows`.
pub fn convolve_cols(src: &Image<f32>, kernel: &[f32]) -> Image<f32> {
    assert!(!kernel.is_empty(), "kernel must not be empty");
    assert!(
        kernel.len() % 2 == 1,
        "kernel length must be odd (got {})",
        kernel.len()
    );

    let w = src.width();
    let h = src.height();
    let half = kernel.len() / 2;
    let mut dst = Image::<f32>::new(w, h);

    // Top border rows: y in [0, half)
    for y in 0..half.min(h) {
        for x in 0..w {
            let mut acc = 0.0f32;
            for (ki, &kv) in kernel.iter().enumerate() {
                let sy = (y + ki) as isize - half as isize;
                acc += src.get_clamped(x as isize, sy) * kv;
            }
            dst.set(x, y, acc);
        }
    }

    // Interior rows: y in [half, h - half) — no bounds checks needed.
    if h > 2 * half {
        for y in half..(h - half) {
            for x in 0..w {
                let mut acc = 0.0f32;
                // SAFETY: y - half >= 0 and y + half < h, all within bounds.
                unsafe {
                    for (ki, &kv) in kernel.iter().enumerate() {
                        let sy = y + ki - half;
                        acc += src.get_unchecked(x, sy) * kv;
                    }
                    dst.set_unchecked(x, y, acc);
                }
            }
        }
    }

    // Bottom border rows: y in [h - half, h)
    let bottom_start = if h > half { h - half } else { half.min(h) };
    for y in bottom_start..h {
        for x in 0..w {
            let mut acc = 0.0f32;
            for (ki, &kv) in kernel.iter().enumerate() {
                let sy = (y + ki) as isize - half as isize;
                acc += src.get_clamped(x as isize, sy) * kv;
            }
            dst.set(x, y, acc);
        }
    }
    dst
}

/// Separable 2D convolution: horizontal pass then vertical pass.
///
/// For a symmetric Gaussian g, call `convolve_separable(&img, &g, &g)`.
/// Equivalent to `convolve_2d` with the outer product `col ⊗ row`.
///
/// # Panics
/// Panics if either kernel is empty or has even length.
pub fn convolve_separable<T: Pixel>(
    src: &Image<T>,
    kernel_row: &[f32],
    kernel_col: &[f32],
) -> Image<f32> {
    let intermediate = convolve_rows(src, kernel_row);
    convolve_cols(&intermediate, kernel_col)
}
