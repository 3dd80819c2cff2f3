//! Inference dispatcher: runs an image through the engine tile by tile.
//!
//! One call to [`InferenceDispatcher::infer`] performs every 2× pass needed
//! to reach the configured scale. Each pass is planned with
//! [`tiling::plan`], tiles are grouped into batches, padded to a common
//! `PAD_ALIGN`-aligned shape and stacked into one NCHW tensor per engine
//! call. Results are cropped to their core and stitched into the pass output.
//! The destination buffer is only written once every pass has succeeded.

use std::sync::Arc;

use ndarray::{s, Array3, Array4, ArrayView3, ArrayView4, ArrayViewMut3, Axis};
use tracing::debug;

use crate::augment::Augmentation;
use crate::config::{ModelConfig, ModelKind};
use crate::engine::InferenceEngine;
use crate::error::InferenceError;
use crate::tiling::{self, TileDescriptor, DEFAULT_TILE_OVERLAP};
use crate::types::ImageBuffer;

/// Networks require spatial dimensions to be multiples of this.
pub const PAD_ALIGN: usize = 4;

fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

fn invalid(message: impl Into<String>) -> InferenceError {
    InferenceError::InvalidParameter(message.into())
}

pub struct InferenceDispatcher {
    config: ModelConfig,
    engine: Arc<dyn InferenceEngine>,
    margin: usize,
}

impl InferenceDispatcher {
    pub fn new(config: ModelConfig, engine: Arc<dyn InferenceEngine>) -> Self {
        Self {
            config,
            engine,
            margin: DEFAULT_TILE_OVERLAP,
        }
    }

    /// Override the per-side tile context (in input pixels).
    pub fn with_margin(mut self, margin: usize) -> Self {
        self.margin = margin;
        self
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Scale `src` into `dst`.
    ///
    /// `dst` must already have the geometry `src × scale` with the same
    /// channel count. On error `dst` is left as it was.
    pub fn infer(&self, src: &ImageBuffer, dst: &mut ImageBuffer) -> Result<(), InferenceError> {
        let (width, height, channels) = (src.width(), src.height(), src.channels());
        let scale = self.config.scale();

        if width == 0 || height == 0 || channels == 0 {
            return Err(invalid(format!(
                "source image is empty ({width}x{height}x{channels})"
            )));
        }
        if dst.channels() != channels {
            return Err(invalid(format!(
                "channel mismatch: source has {channels}, destination has {}",
                dst.channels()
            )));
        }
        if dst.width() != width * scale || dst.height() != height * scale {
            return Err(invalid(format!(
                "destination is {}x{}, expected {}x{} for scale {scale}",
                dst.width(),
                dst.height(),
                width * scale,
                height * scale
            )));
        }

        let src_samples = src.stride() * height;
        let input = ArrayView3::from_shape((height, width, channels), &src.as_slice()[..src_samples])
            .map_err(|e| invalid(format!("source buffer: {e}")))?
            .permuted_axes([2, 0, 1]);

        let mut current: Option<Array3<f32>> = None;
        for (pass, kind) in self.config.pass_kinds().into_iter().enumerate() {
            let pass_input = current.as_ref().map_or(input, |image| image.view());
            debug!(
                pass,
                %kind,
                width = pass_input.dim().2,
                height = pass_input.dim().1,
                "Running inference pass"
            );
            current = Some(self.run_pass(kind, pass_input)?);
        }

        let dst_samples = dst.stride() * dst.height();
        let (dst_w, dst_h) = (dst.width(), dst.height());
        let mut out = ArrayViewMut3::from_shape(
            (dst_h, dst_w, channels),
            &mut dst.as_mut_slice()[..dst_samples],
        )
        .map_err(|e| invalid(format!("destination buffer: {e}")))?
        .permuted_axes([2, 0, 1]);
        match current {
            Some(result) => out.assign(&result),
            None => out.assign(&input),
        }
        Ok(())
    }

    fn run_pass(
        &self,
        kind: ModelKind,
        input: ArrayView3<'_, f32>,
    ) -> Result<Array3<f32>, InferenceError> {
        let (channels, height, width) = input.dim();
        let factor = kind.factor();
        let tiles = tiling::plan(
            width,
            height,
            self.config.block_w(),
            self.config.block_h(),
            factor,
            self.margin,
        )?;

        let mut output = Array3::<f32>::zeros((channels, height * factor, width * factor));
        let batch_size = self.config.batch();
        debug!(
            tiles = tiles.len(),
            batches = tiles.len().div_ceil(batch_size),
            "Planned tiles"
        );

        for chunk in tiles.chunks(batch_size) {
            let batch = stack_tiles(input, chunk);
            let (n, c, padded_h, padded_w) = batch.dim();
            let result = self.run_batch(kind, batch.view())?;

            let expected = (n, c, padded_h * factor, padded_w * factor);
            if result.dim() != expected {
                return Err(InferenceError::EngineFailure(format!(
                    "engine returned shape {:?}, expected {:?}",
                    result.shape(),
                    [expected.0, expected.1, expected.2, expected.3]
                )));
            }

            for (i, tile) in chunk.iter().enumerate() {
                let (ox, oy) = tile.crop_offset();
                let dest = tile.destination;
                output
                    .slice_mut(s![.., dest.y..dest.bottom(), dest.x..dest.right()])
                    .assign(&result.slice(s![
                        i,
                        ..,
                        oy..oy + dest.height,
                        ox..ox + dest.width
                    ]));
            }
        }

        Ok(output)
    }

    /// One engine call, or eight averaged ones with TTA.
    fn run_batch(
        &self,
        kind: ModelKind,
        batch: ArrayView4<'_, f32>,
    ) -> Result<Array4<f32>, InferenceError> {
        if !self.config.tta() {
            return self.engine.run(kind, batch);
        }

        let augmentations = Augmentation::all();
        let mut sum: Option<Array4<f32>> = None;
        for aug in augmentations {
            let transformed = aug.apply(batch);
            let output = self.engine.run(kind, transformed.view())?;
            let restored = aug.invert(output.view());
            match sum.as_mut() {
                None => sum = Some(restored),
                Some(acc) if acc.dim() == restored.dim() => *acc += &restored,
                Some(acc) => {
                    return Err(InferenceError::EngineFailure(format!(
                        "augmented output shape {:?} differs from {:?}",
                        restored.shape(),
                        acc.shape()
                    )));
                }
            }
        }

        let mut mean = sum.ok_or_else(|| invalid("no augmentations ran"))?;
        mean /= augmentations.len() as f32;
        Ok(mean)
    }
}

/// Copy each tile's source region into one NCHW batch, replicating the last
/// row and column out to the padded shape.
fn stack_tiles(input: ArrayView3<'_, f32>, tiles: &[TileDescriptor]) -> Array4<f32> {
    let channels = input.dim().0;
    let padded_h = round_up(
        tiles.iter().map(|t| t.source.height).max().unwrap_or(1),
        PAD_ALIGN,
    );
    let padded_w = round_up(
        tiles.iter().map(|t| t.source.width).max().unwrap_or(1),
        PAD_ALIGN,
    );

    let mut batch = Array4::<f32>::zeros((tiles.len(), channels, padded_h, padded_w));
    for (mut slot, tile) in batch.axis_iter_mut(Axis(0)).zip(tiles) {
        let src = tile.source;
        let (sh, sw) = (src.height, src.width);
        slot.slice_mut(s![.., ..sh, ..sw])
            .assign(&input.slice(s![.., src.y..src.bottom(), src.x..src.right()]));

        for x in sw..padded_w {
            let edge = slot.slice(s![.., ..sh, sw - 1]).to_owned();
            slot.slice_mut(s![.., ..sh, x]).assign(&edge);
        }
        for y in sh..padded_h {
            let edge = slot.slice(s![.., sh - 1, ..]).to_owned();
            slot.slice_mut(s![.., y, ..]).assign(&edge);
        }
    }
    batch
}
