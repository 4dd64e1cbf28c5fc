// visionpipe: GPU-resident image-processing kernel pipeline
// CPU reference implementations with wgpu compute mirrors
//
// Every GPU stage has an authoritative CPU counterpart in the top-level
// modules; the `gpu` module mirrors them kernel-for-kernel and is validated
// against them pixel-for-pixel in the GPU integration tests.

pub mod canny;
pub mod convolution;
pub mod corners;
pub mod flow;
pub mod frame;
pub mod gpu;
pub mod image;
pub mod kernels;
pub mod otsu;
pub mod pipeline;
