//! Core crate for the w2x tiled upscale and denoise filter.
//!
//! A host builds a [`FilterInstance`] from [`FilterOptions`] and clip
//! metadata, then requests output frames one by one (possibly from many
//! threads). Inference runs through ONNX Runtime behind the
//! [`InferenceEngine`] seam.

pub mod augment;
pub mod chroma;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod filter;
pub mod logging;
pub mod runtime;
pub mod tiling;
pub mod types;

pub use config::{FilterOptions, ModelConfig};
pub use engine::{EngineLoader, InferenceBackend, InferenceEngine, OrtEngineLoader};
pub use error::{Error, ErrorKind, InferenceError, Result};
pub use filter::{FilterInstance, FrameSource};
pub use types::{Frame, ImageBuffer, Plane, VideoFormat, VideoInfo};
