use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ndarray::{Array4, ArrayView4};
use w2x_core::chroma::LinearResampler;
use w2x_core::config::ModelKind;
use w2x_core::engine::EngineInit;
use w2x_core::{
    EngineLoader, Error, FilterInstance, FilterOptions, Frame, FrameSource, InferenceBackend,
    InferenceEngine, InferenceError, OrtEngineLoader, VideoFormat, VideoInfo,
};

/// Nearest-neighbour upscale, the identity for `Noise` networks.
struct Nearest {
    calls: AtomicUsize,
}

impl InferenceEngine for Nearest {
    fn run(&self, kind: ModelKind, batch: ArrayView4<'_, f32>) -> Result<Array4<f32>, InferenceError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let f = kind.factor();
        let (n, c, h, w) = batch.dim();
        Ok(Array4::from_shape_fn((n, c, h * f, w * f), |(i, ch, y, x)| {
            batch[[i, ch, y / f, x / f]]
        }))
    }
}

struct Loader {
    engine: Arc<Nearest>,
    seen: Mutex<Vec<PathBuf>>,
}

impl Loader {
    fn new() -> Self {
        Self {
            engine: Arc::new(Nearest {
                calls: AtomicUsize::new(0),
            }),
            seen: Mutex::new(Vec::new()),
        }
    }
}

impl EngineLoader for Loader {
    fn initialize(&self, init: &EngineInit<'_>) -> w2x_core::Result<Arc<dyn InferenceEngine>> {
        let mut seen = self.seen.lock().unwrap();
        seen.extend(init.kinds.iter().map(|&kind| init.model_path(kind)));
        Ok(self.engine.clone())
    }
}

struct Clip(Vec<Frame>);

impl FrameSource for Clip {
    fn request_frame(&self, n: usize) -> w2x_core::Result<Frame> {
        self.0
            .get(n)
            .cloned()
            .ok_or_else(|| Error::geometry(format!("no frame {n}")))
    }
}

fn gradient(format: VideoFormat, width: usize, height: usize, seed: f32) -> Frame {
    let mut frame = Frame::new(format, width, height);
    for (p, plane) in frame.planes_mut().iter_mut().enumerate() {
        for y in 0..plane.height() {
            for (x, v) in plane.row_mut(y).iter_mut().enumerate() {
                *v = seed + ((x * 7 + y * 3 + p * 11) % 17) as f32 / 17.0;
            }
        }
    }
    frame
}

fn clip_info(format: VideoFormat, width: usize, height: usize) -> VideoInfo {
    VideoInfo {
        format,
        width,
        height,
        num_frames: 1,
    }
}

fn create(options: &FilterOptions, info: &VideoInfo, loader: &Loader) -> FilterInstance {
    FilterInstance::create(
        options,
        info,
        Path::new("models"),
        loader,
        Some(Arc::new(LinearResampler)),
    )
    .expect("create filter")
}

#[test]
fn gray_scale4_runs_two_passes_and_matches_nearest() {
    let loader = Loader::new();
    let options = FilterOptions {
        noise: 1,
        scale: 4,
        block_w: 16,
        block_h: Some(8),
        batch: 3,
        ..FilterOptions::default()
    };
    let info = clip_info(VideoFormat::GRAY, 37, 23);
    let filter = create(&options, &info, &loader);
    assert_eq!(
        *loader.seen.lock().unwrap(),
        vec![
            PathBuf::from("models/cunet/noise1_scale2.0x_model.onnx"),
            PathBuf::from("models/cunet/scale2.0x_model.onnx"),
        ]
    );

    let src = gradient(VideoFormat::GRAY, 37, 23, 0.0);
    let out = filter.get_frame(0, &Clip(vec![src.clone()])).unwrap();
    assert_eq!((out.width(), out.height()), (148, 92));
    for y in 0..92 {
        for x in 0..148 {
            assert_eq!(out.plane(0).row(y)[x], src.plane(0).row(y / 4)[x / 4]);
        }
    }
}

#[test]
fn tta_with_symmetric_engine_matches_plain_run() {
    let info = clip_info(VideoFormat::RGB, 20, 12);
    let src = gradient(VideoFormat::RGB, 20, 12, 0.1);
    let base = FilterOptions {
        noise: 2,
        scale: 2,
        block_w: 8,
        ..FilterOptions::default()
    };

    let plain_loader = Loader::new();
    let plain = create(&base, &info, &plain_loader)
        .get_frame(0, &Clip(vec![src.clone()]))
        .unwrap();

    let tta_loader = Loader::new();
    let tta = create(&FilterOptions { tta: true, ..base }, &info, &tta_loader)
        .get_frame(0, &Clip(vec![src]))
        .unwrap();

    assert_eq!(
        tta_loader.engine.calls.load(Ordering::Relaxed),
        8 * plain_loader.engine.calls.load(Ordering::Relaxed)
    );
    for p in 0..3 {
        for (a, b) in plain.plane(p).rows().zip(tta.plane(p).rows()) {
            for (x, y) in a.iter().zip(b) {
                assert!((x - y).abs() < 1e-5);
            }
        }
    }
}

#[test]
fn yuv420_luma_is_exact_and_chroma_is_realigned() {
    let loader = Loader::new();
    let info = clip_info(VideoFormat::YUV420, 16, 8);
    let options = FilterOptions {
        noise: -1,
        scale: 2,
        block_w: 8,
        ..FilterOptions::default()
    };
    let filter = create(&options, &info, &loader);

    let mut src = Frame::new(VideoFormat::YUV420, 16, 8);
    src.plane_mut(0).fill(0.7);
    for plane in 1..3 {
        for y in 0..4 {
            for (x, v) in src.plane_mut(plane).row_mut(y).iter_mut().enumerate() {
                *v = x as f32 * 0.05 - 0.2;
            }
        }
    }

    let out = filter.get_frame(0, &Clip(vec![src])).unwrap();
    assert!(out.plane(0).rows().all(|row| row.iter().all(|&v| v == 0.7)));

    // 2x nearest duplicates chroma pairs; the 0.25 chroma-sample shift
    // blends each pair with its right neighbour.
    let u = out.plane(1).row(0);
    assert_eq!(u.len(), 16);
    let expected_first = -0.2 * 0.75 + (-0.2) * 0.25;
    assert!((u[0] - expected_first).abs() < 1e-6);
    let expected_second = -0.2 * 0.75 + (-0.15) * 0.25;
    assert!((u[1] - expected_second).abs() < 1e-6);
    assert!((u[15] - 0.15).abs() < 1e-6);
}

#[test]
fn frames_can_be_requested_out_of_order() {
    let loader = Loader::new();
    let info = clip_info(VideoFormat::YUV444, 12, 10);
    let options = FilterOptions {
        noise: 0,
        scale: 1,
        block_w: 4,
        ..FilterOptions::default()
    };
    let filter = create(&options, &info, &loader);
    let clip = Clip((0..4).map(|i| gradient(VideoFormat::YUV444, 12, 10, i as f32)).collect());

    let backwards: Vec<Frame> = (0..4).rev().map(|n| filter.get_frame(n, &clip).unwrap()).collect();
    let forwards: Vec<Frame> = (0..4).map(|n| filter.get_frame(n, &clip).unwrap()).collect();
    assert_eq!(backwards.into_iter().rev().collect::<Vec<_>>(), forwards);
}

/// Needs real model files; set `W2X_MODELS_DIR` to a waifu2x model tree.
#[test]
#[ignore]
fn onnx_runtime_cpu_smoke() {
    let models_dir = PathBuf::from(std::env::var("W2X_MODELS_DIR").expect("W2X_MODELS_DIR"));
    let options = FilterOptions {
        noise: 1,
        scale: 2,
        block_w: 64,
        model: 6,
        backend: InferenceBackend::Cpu,
        ..FilterOptions::default()
    };
    let info = clip_info(VideoFormat::RGB, 48, 32);
    let filter = FilterInstance::create(&options, &info, &models_dir, &OrtEngineLoader::new(), None)
        .expect("load models");
    let out = filter
        .get_frame(0, &Clip(vec![gradient(VideoFormat::RGB, 48, 32, 0.0)]))
        .expect("inference");
    assert_eq!((out.width(), out.height()), (96, 64));
    assert!(out.planes().iter().all(|p| p.rows().flatten().all(|v| v.is_finite())));
}
