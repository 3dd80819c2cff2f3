//! Plane codec: host planes (strided) <-> dense buffers for the dispatcher.
//!
//! Multi-channel data is packed channel-minor, i.e. sample `(x, y, c)` lives
//! at `y * stride + x * channels + c`.

use crate::error::{Error, Result};
use crate::types::{ImageBuffer, Plane};

/// Zero-point offset between host chroma (centred on 0) and what the
/// networks were trained on (centred on 0.5).
pub const CHROMA_BIAS: f32 = 0.5;

fn check_same_dimensions(planes: &[&Plane]) -> Result<(usize, usize)> {
    let first = planes
        .first()
        .ok_or_else(|| Error::geometry("no planes to interleave"))?;
    let dims = (first.width(), first.height());
    for (index, plane) in planes.iter().enumerate().skip(1) {
        if (plane.width(), plane.height()) != dims {
            return Err(Error::geometry(format!(
                "plane {index} is {}x{}, plane 0 is {}x{}",
                plane.width(),
                plane.height(),
                dims.0,
                dims.1
            )));
        }
    }
    Ok(dims)
}

/// Pack `sources` into `dst` as one interleaved image with `sources.len()` channels.
pub fn interleave(sources: &[&Plane], dst: &mut ImageBuffer) -> Result<()> {
    let (width, height) = check_same_dimensions(sources)?;
    let channels = sources.len();
    dst.reshape(width, height, channels);

    for y in 0..height {
        let out = dst.row_mut(y);
        for (c, plane) in sources.iter().enumerate() {
            for (x, &sample) in plane.row(y).iter().enumerate() {
                out[x * channels + c] = sample;
            }
        }
    }
    Ok(())
}

/// Inverse of [`interleave`]: scatter the channels of `src` into `dsts`.
pub fn deinterleave(src: &ImageBuffer, dsts: &mut [&mut Plane]) -> Result<()> {
    let channels = src.channels();
    if dsts.len() != channels {
        return Err(Error::geometry(format!(
            "buffer has {channels} channels but {} destination planes were given",
            dsts.len()
        )));
    }
    for (index, plane) in dsts.iter().enumerate() {
        if (plane.width(), plane.height()) != (src.width(), src.height()) {
            return Err(Error::geometry(format!(
                "destination plane {index} is {}x{}, buffer is {}x{}",
                plane.width(),
                plane.height(),
                src.width(),
                src.height()
            )));
        }
    }

    for y in 0..src.height() {
        let row = src.row(y);
        for (c, plane) in dsts.iter_mut().enumerate() {
            for (x, sample) in plane.row_mut(y).iter_mut().enumerate() {
                *sample = row[x * channels + c];
            }
        }
    }
    Ok(())
}

/// Copy one strided plane into a dense single-channel buffer, adding `bias`.
pub fn extract_plane(src: &Plane, bias: f32, dst: &mut ImageBuffer) {
    dst.reshape(src.width(), src.height(), 1);
    for y in 0..src.height() {
        for (out, &sample) in dst.row_mut(y).iter_mut().zip(src.row(y)) {
            *out = sample + bias;
        }
    }
}

/// Subtract `bias` from the visible samples of `plane`.
pub fn remove_bias(plane: &mut Plane, bias: f32) {
    for y in 0..plane.height() {
        for sample in plane.row_mut(y) {
            *sample -= bias;
        }
    }
}
