//! Frame orchestrator: the filter instance a host drives frame by frame.
//!
//! [`FilterInstance::create`] validates construction options, loads the
//! engine and sizes scratch memory. [`FilterInstance::get_frame`] pulls one
//! source frame, runs each plane group through the dispatcher and returns a
//! complete output frame or an error, never a partial frame.

use std::collections::TryReserveError;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, trace, warn};

use crate::chroma::{ChromaCorrector, Resampler};
use crate::codec::{self, CHROMA_BIAS};
use crate::config::{FilterOptions, ModelConfig};
use crate::dispatch::InferenceDispatcher;
use crate::engine::{EngineInit, EngineLoader};
use crate::error::{Error, Result};
use crate::types::{ColorFamily, Frame, ImageBuffer, VideoInfo};

/// Upstream clip the filter pulls frames from.
pub trait FrameSource: Send + Sync {
    fn request_frame(&self, n: usize) -> Result<Frame>;
}

/// Lifecycle of one `get_frame` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    AwaitingSourceFrame,
    Processing,
    Done,
    Failed,
}

struct FrameRequest {
    n: usize,
    state: FrameState,
}

impl FrameRequest {
    fn new(n: usize) -> Self {
        Self {
            n,
            state: FrameState::Idle,
        }
    }

    fn advance(&mut self, next: FrameState) {
        trace!(frame = self.n, from = ?self.state, to = ?next, "Frame state");
        self.state = next;
    }

    fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.advance(FrameState::Done),
            Err(err) => {
                self.advance(FrameState::Failed);
                warn!(frame = self.n, category = err.category(), error = %err, "Frame failed");
            }
        }
        result
    }
}

/// Dense working buffers for one frame in flight.
#[derive(Debug, Default)]
pub struct ScratchSet {
    pub input: ImageBuffer,
    pub output: ImageBuffer,
}

/// Pool of scratch sets. Each concurrent request checks out its own set;
/// sets are returned on drop and reused by later requests.
#[derive(Debug)]
pub struct ScratchPool {
    idle: Mutex<Vec<ScratchSet>>,
    input_samples: usize,
    output_samples: usize,
    allocated: AtomicUsize,
}

impl ScratchPool {
    /// Pre-allocates one set. Fails when the memory cannot be reserved.
    pub fn new(input_samples: usize, output_samples: usize) -> Result<Self> {
        let pool = Self {
            idle: Mutex::new(Vec::new()),
            input_samples,
            output_samples,
            allocated: AtomicUsize::new(0),
        };
        let first = pool.allocate()?;
        pool.put_back(first);
        Ok(pool)
    }

    fn allocate(&self) -> Result<ScratchSet> {
        let set = ScratchSet {
            input: ImageBuffer::try_with_capacity(self.input_samples).map_err(malloc_failure)?,
            output: ImageBuffer::try_with_capacity(self.output_samples).map_err(malloc_failure)?,
        };
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(set)
    }

    fn put_back(&self, set: ScratchSet) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(set);
        }
    }

    pub fn checkout(&self) -> Result<ScratchGuard<'_>> {
        let reused = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        let set = match reused {
            Some(set) => set,
            None => self.allocate()?,
        };
        Ok(ScratchGuard { pool: self, set })
    }

    /// Sets ever allocated; bounded by peak concurrency.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or_default()
    }
}

fn malloc_failure(err: TryReserveError) -> Error {
    Error::configuration(format!("malloc failure ({err})"))
}

pub struct ScratchGuard<'a> {
    pool: &'a ScratchPool,
    set: ScratchSet,
}

impl Deref for ScratchGuard<'_> {
    type Target = ScratchSet;

    fn deref(&self) -> &ScratchSet {
        &self.set
    }
}

impl DerefMut for ScratchGuard<'_> {
    fn deref_mut(&mut self) -> &mut ScratchSet {
        &mut self.set
    }
}

impl Drop for ScratchGuard<'_> {
    fn drop(&mut self) {
        self.pool.put_back(std::mem::take(&mut self.set));
    }
}

/// An active (non-passthrough) filter.
pub struct Waifu2xFilter {
    input_info: VideoInfo,
    output_info: VideoInfo,
    dispatcher: InferenceDispatcher,
    chroma: Option<ChromaCorrector>,
    scratch: ScratchPool,
}

impl Waifu2xFilter {
    pub fn config(&self) -> &ModelConfig {
        self.dispatcher.config()
    }

    pub fn output_info(&self) -> VideoInfo {
        self.output_info
    }

    pub fn scratch(&self) -> &ScratchPool {
        &self.scratch
    }

    pub fn get_frame(&self, n: usize, source: &dyn FrameSource) -> Result<Frame> {
        let mut request = FrameRequest::new(n);
        request.advance(FrameState::AwaitingSourceFrame);
        let src = match source.request_frame(n) {
            Ok(frame) => frame,
            Err(err) => return request.finish(Err(err)),
        };
        request.advance(FrameState::Processing);
        let result = self.process(&src);
        request.finish(result)
    }

    fn process(&self, src: &Frame) -> Result<Frame> {
        let info = &self.input_info;
        if src.format() != info.format || src.width() != info.width || src.height() != info.height
        {
            return Err(Error::geometry(format!(
                "source frame is {} {}x{}, clip is {} {}x{}",
                src.format(),
                src.width(),
                src.height(),
                info.format,
                info.width,
                info.height
            )));
        }

        let scale = self.config().scale();
        let out = &self.output_info;
        let mut dst = Frame::new(out.format, out.width, out.height);
        let mut scratch = self.scratch.checkout()?;
        let ScratchSet { input, output } = &mut *scratch;

        if info.format.color_family == ColorFamily::Rgb {
            let sources: Vec<_> = src.planes().iter().collect();
            codec::interleave(&sources, input)?;
            output.reshape(out.width, out.height, sources.len());
            self.dispatcher.infer(input, output)?;
            let [r, g, b] = dst.planes_mut() else {
                return Err(Error::geometry(format!(
                    "{} output frame has {} planes, expected 3",
                    out.format,
                    dst.planes().len()
                )));
            };
            codec::deinterleave(output, &mut [r, g, b])?;
        } else {
            for (index, plane) in src.planes().iter().enumerate() {
                let bias = if index == 0 { 0.0 } else { CHROMA_BIAS };
                codec::extract_plane(plane, bias, input);
                output.reshape(plane.width() * scale, plane.height() * scale, 1);
                self.dispatcher.infer(input, output)?;

                let target = dst.plane_mut(index);
                codec::deinterleave(output, &mut [&mut *target])?;
                if bias != 0.0 {
                    codec::remove_bias(target, bias);
                }
            }
        }
        drop(scratch);

        match &self.chroma {
            Some(corrector) => corrector.apply(&dst),
            None => Ok(dst),
        }
    }
}

/// What the host holds after construction.
pub enum FilterInstance {
    /// Neither denoise nor upscale requested: frames pass through unchanged.
    Passthrough(VideoInfo),
    Active(Waifu2xFilter),
}

impl FilterInstance {
    pub fn create(
        options: &FilterOptions,
        info: &VideoInfo,
        models_dir: &Path,
        loader: &dyn EngineLoader,
        resampler: Option<Arc<dyn Resampler>>,
    ) -> Result<Self> {
        if !info.is_constant_format() {
            return Err(Error::configuration(
                "only constant format 32 bit float input supported",
            ));
        }
        if !info.format.fits_subsampling(info.width, info.height) {
            return Err(Error::configuration(format!(
                "{} clip dimensions must be multiples of {}x{}, got {}x{}",
                info.format,
                1usize << info.format.subsampling_w,
                1usize << info.format.subsampling_h,
                info.width,
                info.height
            )));
        }
        if options.is_passthrough() {
            info!("noise -1 with scale 1 requested, passing frames through");
            return Ok(Self::Passthrough(*info));
        }

        let config = ModelConfig::from_options(options)?;
        let scale = config.scale();
        let chroma = ChromaCorrector::for_format(&info.format, scale, resampler)?;

        let overflow = || {
            Error::configuration(format!(
                "output geometry of {}x{} at scale {scale} is too large",
                info.width, info.height
            ))
        };
        let output_info = VideoInfo {
            width: info.width.checked_mul(scale).ok_or_else(overflow)?,
            height: info.height.checked_mul(scale).ok_or_else(overflow)?,
            ..*info
        };
        let channels = match info.format.color_family {
            ColorFamily::Rgb => 3,
            ColorFamily::Gray | ColorFamily::Yuv => 1,
        };
        let samples = |width: usize, height: usize| {
            width
                .checked_mul(height)
                .and_then(|n| n.checked_mul(channels))
                .ok_or_else(overflow)
        };
        let scratch = ScratchPool::new(
            samples(info.width, info.height)?,
            samples(output_info.width, output_info.height)?,
        )?;

        let kinds = config.required_kinds();
        let engine = loader.initialize(&EngineInit {
            family: config.family(),
            noise: config.noise(),
            kinds: &kinds,
            models_dir,
            backend: config.backend(),
            device_id: config.device_id(),
        })?;

        info!(
            family = %config.family(),
            noise = config.noise(),
            scale,
            block_w = config.block_w(),
            block_h = config.block_h(),
            batch = config.batch(),
            tta = config.tta(),
            backend = %config.backend(),
            device_id = config.device_id(),
            output_width = output_info.width,
            output_height = output_info.height,
            "Filter created"
        );
        debug!(?chroma, "Chroma correction");

        Ok(Self::Active(Waifu2xFilter {
            input_info: *info,
            output_info,
            dispatcher: InferenceDispatcher::new(config, engine),
            chroma,
            scratch,
        }))
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self, Self::Passthrough(_))
    }

    pub fn output_info(&self) -> VideoInfo {
        match self {
            Self::Passthrough(info) => *info,
            Self::Active(filter) => filter.output_info(),
        }
    }

    pub fn get_frame(&self, n: usize, source: &dyn FrameSource) -> Result<Frame> {
        match self {
            Self::Passthrough(_) => source.request_frame(n),
            Self::Active(filter) => filter.get_frame(n, source),
        }
    }
}
