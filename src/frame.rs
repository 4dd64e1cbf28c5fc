// frame.rs — Packed 4-channel RGBA byte frame.
//
// This is the raw input handed over by the decoding collaborator and the
// annotated output handed back for display/encode. Layout matches what the
// GPU kernels see: one packed u32 (R | G<<8 | B<<16 | A<<24) per pixel,
// row-major, no row padding.

use crate::image::Image;

/// Luma weights for RGBA → grayscale (ITU-R BT.601).
pub const LUMA_R: f32 = 0.299;
pub const LUMA_G: f32 = 0.587;
pub const LUMA_B: f32 = 0.114;

/// A packed RGBA frame. Four bytes per pixel, row-major, tightly packed.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Vec<u8>,
    width: usize,
    height: usize,
}

impl Frame {
    /// Create a black, fully opaque frame.
    pub fn new(width: usize, height: usize) -> Self {
        let mut data = vec![0u8; width * height * 4];
        for px in data.chunks_exact_mut(4) {
            px[3] = 255;
        }
        Frame {
            data,
            width,
            height,
        }
    }

    /// Wrap an existing packed RGBA byte buffer.
    ///
    /// # Panics
    /// Panics if `data.len() != width * height * 4`.
    pub fn from_rgba(width: usize, height: usize, data: Vec<u8>) -> Self {
        assert_eq!(
            data.len(),
            width * height * 4,
            "RGBA data length ({}) must equal width * height * 4 ({})",
            data.len(),
            width * height * 4,
        );
        Frame {
            data,
            width,
            height,
        }
    }

    /// Build a frame from a grayscale image: each pixel becomes
    /// (v, v, v, 255). Test and demo helper.
    pub fn from_gray(gray: &Image<u8>) -> Self {
        let mut frame = Frame::new(gray.width(), gray.height());
        for (x, y, v) in gray.pixels() {
            frame.set_pixel(x, y, [v, v, v, 255]);
        }
        frame
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// True if the frame has no pixels. An empty frame is rejected by the
    /// pipeline before any device allocation.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn pixel(&self, x: usize, y: usize) -> [u8; 4] {
        let i = (y * self.width + x) * 4;
        [self.data[i], self.data[i + 1], self.data[i + 2], self.data[i + 3]]
    }

    #[inline]
    pub fn set_pixel(&mut self, x: usize, y: usize, rgba: [u8; 4]) {
        let i = (y * self.width + x) * 4;
        self.data[i..i + 4].copy_from_slice(&rgba);
    }

    /// Elementwise grayscale conversion with BT.601 luma weights. The GPU
    /// color stage mirrors this exactly.
    pub fn to_gray(&self) -> Image<f32> {
        let mut gray = Image::<f32>::new(self.width, self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                let [r, g, b, _] = self.pixel(x, y);
                let v = LUMA_R * r as f32 + LUMA_G * g as f32 + LUMA_B * b as f32;
                gray.set(x, y, v);
            }
        }
        gray
    }

    /// Draw a small cross marker centered at (x, y), clipped to the frame.
    /// Used by the corner stage to annotate accepted corners.
    pub fn draw_marker(&mut self, x: usize, y: usize, rgba: [u8; 4]) {
        const ARM: isize = 2;
        for d in -ARM..=ARM {
            let mx = x as isize + d;
            let my = y as isize + d;
            if mx >= 0 && (mx as usize) < self.width {
                self.set_pixel(mx as usize, y, rgba);
            }
            if my >= 0 && (my as usize) < self.height {
                self.set_pixel(x, my as usize, rgba);
            }
        }
    }

    /// Overwrite the frame with a single-channel mask: foreground pixels
    /// become white, background black. Convenience for callers that want a
    /// displayable frame out of a binarization or edge mask.
    pub fn apply_mask(&mut self, mask: &Image<u8>) {
        assert_eq!(self.width, mask.width());
        assert_eq!(self.height, mask.height());
        for (x, y, v) in mask.pixels() {
            self.set_pixel(x, y, [v, v, v, 255]);
        }
    }
}
