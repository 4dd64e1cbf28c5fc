// benches/stages.rs -- Per-stage and full-pipeline CPU benchmarks.
//
//   cargo bench
//
// All inputs are synthetic scenes; sizes follow common camera resolutions.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use visionpipe::canny;
use visionpipe::convolution::{convolve_2d, convolve_separable};
use visionpipe::corners::{self, ResponseKind};
use visionpipe::flow::{self, FlowConfig};
use visionpipe::frame::Frame;
use visionpipe::image::Image;
use visionpipe::kernels::KernelTables;
use visionpipe::otsu;
use visionpipe::pipeline::{self, Mode, PipelineConfig, ThresholdSource};

// ============================================================
// Helpers
// ============================================================

/// Synthetic scene with texture: gradients plus bright rectangles, shifted
/// by (dx, dy) to fake camera motion.
fn make_scene(w: usize, h: usize, dx: usize, dy: usize) -> Frame {
    let mut f = Frame::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let sx = x + dx;
            let sy = y + dy;
            let base = ((sx * 200 / w) + (sy * 55 / h)) as u8;
            f.set_pixel(x, y, [base, base, base, 255]);
        }
    }
    for rect in 0..6 {
        let rx = (50 + rect * 100 + dx) % w;
        let ry = (40 + (rect % 3) * 120 + dy) % h;
        let bright = 180u8.wrapping_add(rect as u8 * 10);
        for y in ry..(ry + 60).min(h) {
            for x in rx..(rx + 80).min(w) {
                f.set_pixel(x, y, [bright, bright, bright, 255]);
            }
        }
    }
    f
}

struct Prepared {
    gray: Image<f32>,
    blurred: Image<f32>,
    gx: Image<f32>,
    gy: Image<f32>,
    tables: KernelTables,
}

fn prepare(frame: &Frame) -> Prepared {
    let tables = KernelTables::default();
    let gray = frame.to_gray();
    let blurred = convolve_separable(&gray, &tables.gaussian_1d, &tables.gaussian_1d);
    let gx = convolve_2d(&blurred, &tables.sobel_x);
    let gy = convolve_2d(&blurred, &tables.sobel_y);
    Prepared {
        gray,
        blurred,
        gx,
        gy,
        tables,
    }
}

// ============================================================
// Per-stage benchmarks
// ============================================================

fn bench_front_stages(c: &mut Criterion) {
    let mut group = c.benchmark_group("front");
    for &(w, h) in &[(320usize, 240usize), (640, 480)] {
        let frame = make_scene(w, h, 0, 0);
        let p = prepare(&frame);
        let label = format!("{w}x{h}");

        group.bench_function(BenchmarkId::new("grayscale", &label), |b| {
            b.iter(|| frame.to_gray())
        });
        group.bench_function(BenchmarkId::new("gaussian_blur", &label), |b| {
            b.iter(|| convolve_separable(&p.gray, &p.tables.gaussian_1d, &p.tables.gaussian_1d))
        });
        group.bench_function(BenchmarkId::new("sobel", &label), |b| {
            b.iter(|| {
                (
                    convolve_2d(&p.blurred, &p.tables.sobel_x),
                    convolve_2d(&p.blurred, &p.tables.sobel_y),
                )
            })
        });
    }
    group.finish();
}

fn bench_feature_stages(c: &mut Criterion) {
    let frame = make_scene(640, 480, 0, 0);
    let p = prepare(&frame);

    let mut group = c.benchmark_group("features");
    group.bench_function("harris_response", |b| {
        b.iter(|| {
            corners::response_map(
                &p.gx,
                &p.gy,
                &p.tables.gaussian,
                ResponseKind::Harris { k: 0.04 },
            )
        })
    });
    group.bench_function("shi_tomasi_response", |b| {
        b.iter(|| corners::response_map(&p.gx, &p.gy, &p.tables.gaussian, ResponseKind::ShiTomasi))
    });
    group.bench_function("canny", |b| {
        b.iter(|| canny::canny(&p.gx, &p.gy, 40.0, 80.0))
    });
    group.bench_function("otsu", |b| {
        b.iter(|| {
            let t = otsu::otsu_threshold(&p.gray);
            otsu::binarize(&p.gray, t)
        })
    });
    group.finish();
}

fn bench_flow_matching(c: &mut Criterion) {
    let f1 = make_scene(640, 480, 0, 0);
    let f2 = make_scene(640, 480, 3, 1);
    let p1 = prepare(&f1);
    let p2 = prepare(&f2);
    let kind = ResponseKind::Harris { k: 0.04 };
    let map1 = corners::response_map(&p1.gx, &p1.gy, &p1.tables.gaussian, kind);
    let map2 = corners::response_map(&p2.gx, &p2.gy, &p2.tables.gaussian, kind);
    let cfg = FlowConfig {
        score_floor: corners::acceptance_threshold(&map1, 0.5),
        ..Default::default()
    };

    c.bench_function("flow/match_features", |b| {
        b.iter(|| flow::match_features(&map1, &map2, &cfg))
    });
}

// ============================================================
// Full-pipeline benchmarks
// ============================================================

fn bench_pipeline(c: &mut Criterion) {
    let frame = make_scene(640, 480, 0, 0);
    let cfg = PipelineConfig::default();

    let mut group = c.benchmark_group("pipeline");
    group.bench_function("corners", |b| {
        b.iter(|| {
            pipeline::run(
                &frame,
                Mode::Corners {
                    kind: ResponseKind::Harris { k: 0.04 },
                    annotate: true,
                },
                &cfg,
            )
        })
    });
    group.bench_function("edges_auto", |b| {
        b.iter(|| {
            pipeline::run(
                &frame,
                Mode::Edges {
                    thresholds: ThresholdSource::Auto,
                },
                &cfg,
            )
        })
    });
    group.bench_function("binarize", |b| {
        b.iter(|| pipeline::run(&frame, Mode::Binarize, &cfg))
    });

    let next = make_scene(640, 480, 3, 1);
    group.bench_function("flow", |b| {
        b.iter(|| pipeline::run_flow(&frame, &next, ResponseKind::ShiTomasi, &cfg))
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_front_stages,
    bench_feature_stages,
    bench_flow_matching,
    bench_pipeline
);
criterion_main!(benches);
