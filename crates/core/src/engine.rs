//! Inference engine capability and its ONNX Runtime implementation.
//!
//! The dispatcher only sees [`InferenceEngine`]: "run this NCHW batch through
//! the network for this model kind". [`EngineLoader`] builds an engine for a
//! validated configuration. [`OrtEngineLoader`] is the production loader,
//! backed by `ort::Session` with CPU, CUDA or TensorRT execution providers.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{Array4, ArrayView4, Ix4};
use ort::{
    execution_providers::{
        CPUExecutionProvider, CUDAExecutionProvider, ExecutionProvider,
        TensorRTExecutionProvider,
    },
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::{ModelFamily, ModelKind};
use crate::error::{Error, InferenceError};
use crate::runtime::EngineRuntime;

/// Execution provider selection.
///
/// Default is `Tensorrt`. If the TensorRT runtime (`libnvinfer.so.10` or
/// `nvinfer.dll`) is missing the session falls back to the CUDA EP.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    Cpu,
    Cuda,
    #[default]
    Tensorrt,
}

impl InferenceBackend {
    /// Parse from string (case-insensitive). Returns `Cuda` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "tensorrt" | "trt" | "cudnn" => Self::Tensorrt,
            "cpu" => Self::Cpu,
            _ => Self::Cuda,
        }
    }
}

impl fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

/// A loaded set of networks.
///
/// `run` takes an `[N, C, H, W]` batch and returns `[N, C, H * f, W * f]`
/// where `f` is [`ModelKind::factor`]. Implementations must tolerate
/// concurrent calls.
pub trait InferenceEngine: Send + Sync {
    fn run(&self, kind: ModelKind, batch: ArrayView4<'_, f32>)
        -> Result<Array4<f32>, InferenceError>;
}

/// What an engine needs to know to load its networks.
#[derive(Debug, Clone)]
pub struct EngineInit<'a> {
    pub family: ModelFamily,
    pub noise: i32,
    pub kinds: &'a [ModelKind],
    /// Root holding one directory per model family.
    pub models_dir: &'a Path,
    pub backend: &'a InferenceBackend,
    pub device_id: u32,
}

impl EngineInit<'_> {
    pub fn model_path(&self, kind: ModelKind) -> PathBuf {
        self.models_dir
            .join(self.family.dir_name())
            .join(kind.file_name(self.noise))
    }
}

pub trait EngineLoader: Send + Sync {
    fn initialize(&self, init: &EngineInit<'_>) -> Result<Arc<dyn InferenceEngine>, Error>;
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: &'a InferenceBackend,
    pub device_id: u32,
    pub trt_cache_dir: Option<&'a Path>,
}

/// Build an `ort::Session` with the requested backend and fallback chain.
///
/// `Tensorrt` registers the TRT EP with engine caching, then CUDA as
/// fallback. `Cuda` registers CUDA only. In both cases ORT falls back to CPU
/// when CUDA is unavailable.
pub fn build_session(config: &SessionConfig<'_>) -> anyhow::Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    let device_id = i32::try_from(config.device_id).context("device id out of range")?;

    let session = match config.backend {
        InferenceBackend::Tensorrt => {
            let cache_dir = config
                .trt_cache_dir
                .unwrap_or_else(|| Path::new("trt_cache"));

            if let Err(e) = std::fs::create_dir_all(cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }

            let cache_path = cache_dir.to_string_lossy().to_string();
            let started = Instant::now();

            info!(
                model = %config.model_path.display(),
                cache_dir = %cache_dir.display(),
                device_id,
                "Initializing TensorRT session (first run may take several minutes)"
            );

            let (stop_tx, stop_rx) = channel::<()>();
            let progress_thread = thread::spawn(move || {
                let tick = Duration::from_secs(15);
                let mut elapsed = 15_u64;
                loop {
                    match stop_rx.recv_timeout(tick) {
                        Ok(_) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            info!(
                                elapsed_secs = elapsed,
                                "TensorRT session initialization still in progress"
                            );
                            elapsed += 15;
                        }
                    }
                }
            });

            let session_result = builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(&cache_path)
                        .with_fp16(true)
                        .with_device_id(device_id)
                        .build(),
                    CUDAExecutionProvider::default()
                        .with_device_id(device_id)
                        .build(),
                ])?
                .commit_from_file(config.model_path)
                .with_context(|| {
                    format!("Failed to load ONNX model: {}", config.model_path.display())
                });

            let _ = stop_tx.send(());
            let _ = progress_thread.join();

            let elapsed = started.elapsed().as_secs_f64();
            match session_result {
                Ok(session) => {
                    info!(elapsed_secs = elapsed, "TensorRT session ready");
                    session
                }
                Err(error_value) => {
                    error!(
                        elapsed_secs = elapsed,
                        error = %error_value,
                        "TensorRT session initialization failed"
                    );
                    return Err(error_value);
                }
            }
        }
        InferenceBackend::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available, inference will fall back to CPU");
            }

            debug!(backend = "cuda", device_id, "Building session with CUDA EP");

            builder
                .with_execution_providers([CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build()
                    .error_on_failure()])?
                .commit_from_file(config.model_path)
                .with_context(|| {
                    format!("Failed to load ONNX model: {}", config.model_path.display())
                })?
        }
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", "Building session with CPU EP");

            builder
                .with_execution_providers([CPUExecutionProvider::default().build()])?
                .commit_from_file(config.model_path)
                .with_context(|| {
                    format!("Failed to load ONNX model: {}", config.model_path.display())
                })?
        }
    };

    Ok(session)
}

/// The network's first input or output; models without one are unusable.
fn first_port<'a, T>(ports: &'a [T], what: &str) -> anyhow::Result<&'a T> {
    ports
        .first()
        .with_context(|| format!("model declares no {what}"))
}

/// One network with its detected I/O.
struct LoadedModel {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    is_fp16: bool,
}

impl LoadedModel {
    fn load(path: &Path, config: &SessionConfig<'_>) -> anyhow::Result<Self> {
        let session = build_session(config)?;

        let input = first_port(session.inputs(), "inputs")?;
        let output = first_port(session.outputs(), "outputs")?;
        let input_name = input.name().to_string();
        let output_name = output.name().to_string();
        let is_fp16 = match input.dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };

        debug!(
            model = %path.display(),
            %input_name, %output_name, is_fp16,
            "Detected model IO"
        );

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            is_fp16,
        })
    }

    fn run(&self, batch: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>> {
        let input = batch.as_standard_layout().into_owned();
        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow::anyhow!("session lock poisoned"))?;

        let output = if self.is_fp16 {
            let f32_slice = input
                .as_slice()
                .context("input must be contiguous for f16 conversion")?;
            let mut fp16_data = vec![f16::ZERO; f32_slice.len()];
            fp16_data.convert_from_f32_slice(f32_slice);
            let fp16_array = ndarray::ArrayD::from_shape_vec(input.shape().to_vec(), fp16_data)?;

            let input_tensor = Tensor::from_array(fp16_array)?;
            let outputs = session.run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
            let output_view = outputs[self.output_name.as_str()].try_extract_array::<f16>()?;
            output_view.mapv(f16::to_f32)
        } else {
            let input_tensor = Tensor::from_array(input)?;
            let outputs = session.run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
            let output_view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
            output_view.to_owned()
        };

        output
            .into_dimensionality::<Ix4>()
            .context("network output is not 4-dimensional")
    }
}

pub struct OrtEngine {
    models: HashMap<ModelKind, LoadedModel>,
    _runtime: EngineRuntime,
}

impl InferenceEngine for OrtEngine {
    fn run(
        &self,
        kind: ModelKind,
        batch: ArrayView4<'_, f32>,
    ) -> Result<Array4<f32>, InferenceError> {
        let model = self.models.get(&kind).ok_or_else(|| {
            InferenceError::InvalidParameter(format!("no {kind} network loaded"))
        })?;
        model
            .run(batch)
            .map_err(|e| InferenceError::EngineFailure(format!("{e:#}")))
    }
}

/// Loads ONNX networks from `<models_dir>/<family>/<file>`.
#[derive(Debug, Clone, Default)]
pub struct OrtEngineLoader {
    trt_cache_dir: Option<PathBuf>,
}

impl OrtEngineLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trt_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.trt_cache_dir = Some(dir.into());
        self
    }
}

impl EngineLoader for OrtEngineLoader {
    fn initialize(&self, init: &EngineInit<'_>) -> Result<Arc<dyn InferenceEngine>, Error> {
        let mut kinds = init.kinds.to_vec();
        kinds.dedup();

        let mut paths = Vec::with_capacity(kinds.len());
        for &kind in &kinds {
            let path = init.model_path(kind);
            if !path.is_file() {
                return Err(Error::initialization(format!(
                    "failed to open model file {}",
                    path.display()
                )));
            }
            paths.push((kind, path));
        }

        let runtime = EngineRuntime::acquire()?;
        let mut models = HashMap::new();
        for (kind, path) in paths {
            debug!(
                family = %init.family,
                %kind,
                model = %path.display(),
                backend = %init.backend,
                "Loading ONNX model"
            );

            let config = SessionConfig {
                model_path: &path,
                backend: init.backend,
                device_id: init.device_id,
                trt_cache_dir: self.trt_cache_dir.as_deref(),
            };
            let model = LoadedModel::load(&path, &config)
                .map_err(|e| Error::initialization(format!("{e:#}")))?;
            models.insert(kind, model);
        }

        info!(family = %init.family, networks = models.len(), "Inference engine ready");
        Ok(Arc::new(OrtEngine {
            models,
            _runtime: runtime,
        }))
    }
}
