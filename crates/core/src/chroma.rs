//! Horizontal chroma alignment after upscaling subsampled YUV.
//!
//! Each 2× pass of a left-aligned (MPEG-2 style) chroma plane moves its
//! siting relative to luma. The accumulated offset, expressed in output luma
//! pixels, is undone by shifting only the chroma planes through a
//! [`Resampler`].

use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{ColorFamily, Frame, VideoFormat};

/// What the resampler does with a plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneMode {
    Copy,
    Process,
}

/// Luma untouched, both chroma planes shifted.
pub const CHROMA_ONLY: [PlaneMode; 3] = [PlaneMode::Copy, PlaneMode::Process, PlaneMode::Process];

/// Offset in luma pixels after `iterations` doublings.
pub fn compute_shift(subsampling_w: u8, iterations: u32) -> f64 {
    let offset = 0.5 * f64::from(1u32 << subsampling_w) - 0.5;
    (0..iterations).fold(0.0, |shift, _| shift * 2.0 + offset)
}

/// Number of 2× passes for a power-of-two `scale`.
pub fn iterations_for_scale(scale: usize) -> u32 {
    scale.trailing_zeros()
}

pub fn needs_correction(format: &VideoFormat, scale: usize) -> bool {
    scale != 1 && format.color_family == ColorFamily::Yuv && format.subsampling_w > 0
}

/// Sub-pixel geometric resampler.
///
/// `shift_x` is in luma pixels of `frame`; positive values sample further to
/// the right, so output `x` reads input `x + shift_x`.
pub trait Resampler: Send + Sync {
    fn resample(&self, frame: &Frame, shift_x: f64, planes: [PlaneMode; 3]) -> Result<Frame>;
}

/// Linear interpolation with clamped edges.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearResampler;

impl Resampler for LinearResampler {
    fn resample(&self, frame: &Frame, shift_x: f64, planes: [PlaneMode; 3]) -> Result<Frame> {
        let format = frame.format();
        let mut out = frame.clone();

        for (index, plane) in out.planes_mut().iter_mut().enumerate() {
            let mode = planes.get(index).copied().unwrap_or(PlaneMode::Copy);
            if mode == PlaneMode::Copy || plane.width() == 0 {
                continue;
            }
            let shift = if index > 0 && format.color_family == ColorFamily::Yuv {
                shift_x / f64::from(1u32 << format.subsampling_w)
            } else {
                shift_x
            };

            let last = plane.width() - 1;
            let source = frame.plane(index);
            for y in 0..plane.height() {
                let row = source.row(y);
                for (x, sample) in plane.row_mut(y).iter_mut().enumerate() {
                    let pos = (x as f64 + shift).clamp(0.0, last as f64);
                    let x0 = pos.floor() as usize;
                    let x1 = (x0 + 1).min(last);
                    let t = (pos - x0 as f64) as f32;
                    *sample = row[x0] * (1.0 - t) + row[x1] * t;
                }
            }
        }

        Ok(out)
    }
}

/// Applies the shift for one output format and scale.
#[derive(Clone)]
pub struct ChromaCorrector {
    shift: f64,
    resampler: Arc<dyn Resampler>,
}

impl ChromaCorrector {
    /// `Ok(None)` when the format needs no correction. A missing resampler
    /// when one is needed is a configuration error.
    pub fn for_format(
        format: &VideoFormat,
        scale: usize,
        resampler: Option<Arc<dyn Resampler>>,
    ) -> Result<Option<Self>> {
        if !needs_correction(format, scale) {
            return Ok(None);
        }
        let resampler = resampler.ok_or_else(|| {
            Error::configuration("a resampler is required for correcting the horizontal chroma shift")
        })?;
        let shift = compute_shift(format.subsampling_w, iterations_for_scale(scale));
        debug!(shift, %format, scale, "Chroma shift correction enabled");
        Ok(Some(Self { shift, resampler }))
    }

    pub fn shift(&self) -> f64 {
        self.shift
    }

    pub fn apply(&self, frame: &Frame) -> Result<Frame> {
        self.resampler.resample(frame, self.shift, CHROMA_ONLY)
    }
}

impl std::fmt::Debug for ChromaCorrector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChromaCorrector")
            .field("shift", &self.shift)
            .finish_non_exhaustive()
    }
}
