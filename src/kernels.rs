// kernels.rs — Fixed convolution coefficient tables.
//
// Computed once per run on the host, uploaded read-only for the run's
// duration. Two families:
//   - Gaussian blur: dense 2D table (and the separable 1D form) from an odd
//     width and sigma, normalized so the coefficients sum to 1.
//   - Sobel: fixed 3×3 X/Y operators plus their separable 1D pairs.
//
// Kernel dimensions are odd by contract; violations are caller bugs and are
// rejected with an assert before any use.

/// Default blur kernel width.
pub const DEFAULT_BLUR_WIDTH: usize = 3;
/// Default blur sigma.
pub const DEFAULT_BLUR_SIGMA: f32 = 1.0;

/// 3×3 Sobel X operator (row-major). Positive response for intensity
/// increasing to the right.
pub const SOBEL_X: [f32; 9] = [-1.0, 0.0, 1.0, -2.0, 0.0, 2.0, -1.0, 0.0, 1.0];

/// 3×3 Sobel Y operator (row-major). Positive response for intensity
/// increasing downward.
pub const SOBEL_Y: [f32; 9] = [-1.0, -2.0, -1.0, 0.0, 0.0, 0.0, 1.0, 2.0, 1.0];

/// Separable Sobel factors: smooth [1, 2, 1] and derivative [-1, 0, 1].
/// Sobel X = smooth(col) ⊗ deriv(row); Sobel Y = deriv(col) ⊗ smooth(row).
pub const SOBEL_SMOOTH: [f32; 3] = [1.0, 2.0, 1.0];
pub const SOBEL_DERIV: [f32; 3] = [-1.0, 0.0, 1.0];

/// A square convolution kernel with odd dimension.
#[derive(Clone, Debug)]
pub struct Kernel2d {
    coeffs: Vec<f32>,
    width: usize,
}

impl Kernel2d {
    /// Wrap a row-major coefficient array.
    ///
    /// # Panics
    /// Panics if `width` is even or `coeffs.len() != width * width`.
    pub fn new(width: usize, coeffs: Vec<f32>) -> Self {
        assert!(width % 2 == 1, "kernel width must be odd (got {width})");
        assert_eq!(
            coeffs.len(),
            width * width,
            "kernel needs {} coefficients, got {}",
            width * width,
            coeffs.len(),
        );
        Kernel2d { coeffs, width }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Half-width: the window reaches `half()` pixels from the center.
    #[inline]
    pub fn half(&self) -> usize {
        self.width / 2
    }

    #[inline]
    pub fn coeffs(&self) -> &[f32] {
        &self.coeffs
    }

    #[inline]
    pub fn at(&self, kx: usize, ky: usize) -> f32 {
        self.coeffs[ky * self.width + kx]
    }
}

/// The fixed coefficient tables one pipeline run needs. Built once from the
/// blur parameters; read-only afterwards.
#[derive(Clone, Debug)]
pub struct KernelTables {
    /// Dense 2D Gaussian, sums to 1.0. Doubles as the structure-tensor
    /// window for the corner stage.
    pub gaussian: Kernel2d,
    /// 1D factor of the Gaussian (symmetric, sums to 1.0), for the
    /// separable convolution path.
    pub gaussian_1d: Vec<f32>,
    pub sobel_x: Kernel2d,
    pub sobel_y: Kernel2d,
}

impl KernelTables {
    /// Build all tables for the given blur parameters.
    ///
    /// # Panics
    /// Panics if `blur_width` is even or zero, or `sigma <= 0`.
    pub fn build(blur_width: usize, sigma: f32) -> Self {
        KernelTables {
            gaussian: gaussian_kernel_2d(blur_width, sigma),
            gaussian_1d: gaussian_kernel_1d(blur_width, sigma),
            sobel_x: Kernel2d::new(3, SOBEL_X.to_vec()),
            sobel_y: Kernel2d::new(3, SOBEL_Y.to_vec()),
        }
    }
}

impl Default for KernelTables {
    fn default() -> Self {
        KernelTables::build(DEFAULT_BLUR_WIDTH, DEFAULT_BLUR_SIGMA)
    }
}

/// Generate a normalized 1D Gaussian kernel of odd length `width`.
///
/// # Panics
/// Panics if `width` is even or zero, or `sigma <= 0`.
pub fn gaussian_kernel_1d(width: usize, sigma: f32) -> Vec<f32> {
    assert!(width % 2 == 1, "kernel width must be odd (got {width})");
    assert!(sigma > 0.0, "sigma must be positive (got {sigma})");
    let half = (width / 2) as isize;
    let two_sigma_sq = 2.0 * sigma * sigma;

    let mut kernel: Vec<f32> = (-half..=half)
        .map(|i| (-(i * i) as f32 / two_sigma_sq).exp())
        .collect();

    // Normalize so the coefficients sum to 1 (preserves image brightness).
    let sum: f32 = kernel.iter().sum();
    for v in &mut kernel {
        *v /= sum;
    }
    kernel
}

/// Generate a normalized dense 2D Gaussian kernel of odd dimension `width`.
/// The table is the outer product of the 1D kernel with itself, so the
/// separable path produces numerically equivalent results.
pub fn gaussian_kernel_2d(width: usize, sigma: f32) -> Kernel2d {
    let k1 = gaussian_kernel_1d(width, sigma);
    let mut coeffs = Vec::with_capacity(width * width);
    for &ky in &k1 {
        for &kx in &k1 {
            coeffs.push(ky * kx);
        }
    }
    Kernel2d::new(width, coeffs)
}
