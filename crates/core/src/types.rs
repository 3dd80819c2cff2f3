use std::collections::TryReserveError;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Row alignment for host planes, in `f32` samples (32 bytes).
pub const PLANE_ROW_ALIGN: usize = 8;

/// Colour family of a clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorFamily {
    Gray,
    Rgb,
    Yuv,
}

/// Planar 32-bit float layout of a clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoFormat {
    pub color_family: ColorFamily,
    /// log2 of the horizontal chroma subsampling factor.
    pub subsampling_w: u8,
    /// log2 of the vertical chroma subsampling factor.
    pub subsampling_h: u8,
}

impl VideoFormat {
    pub const GRAY: Self = Self::new(ColorFamily::Gray, 0, 0);
    pub const RGB: Self = Self::new(ColorFamily::Rgb, 0, 0);
    pub const YUV420: Self = Self::new(ColorFamily::Yuv, 1, 1);
    pub const YUV422: Self = Self::new(ColorFamily::Yuv, 1, 0);
    pub const YUV444: Self = Self::new(ColorFamily::Yuv, 0, 0);

    pub const fn new(color_family: ColorFamily, subsampling_w: u8, subsampling_h: u8) -> Self {
        Self {
            color_family,
            subsampling_w,
            subsampling_h,
        }
    }

    /// Parse a short format name (`gray`, `rgb`, `yuv420`, `yuv422`, `yuv444`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "gray" | "grays" | "y" => Some(Self::GRAY),
            "rgb" | "rgbs" => Some(Self::RGB),
            "yuv420" | "yuv420ps" | "420" => Some(Self::YUV420),
            "yuv422" | "yuv422ps" | "422" => Some(Self::YUV422),
            "yuv444" | "yuv444ps" | "444" => Some(Self::YUV444),
            _ => None,
        }
    }

    pub fn num_planes(&self) -> usize {
        match self.color_family {
            ColorFamily::Gray => 1,
            ColorFamily::Rgb | ColorFamily::Yuv => 3,
        }
    }

    /// Dimensions of `plane` for a frame of `width × height`.
    pub fn plane_dimensions(&self, plane: usize, width: usize, height: usize) -> (usize, usize) {
        if plane == 0 || self.color_family != ColorFamily::Yuv {
            (width, height)
        } else {
            (
                width >> self.subsampling_w as usize,
                height >> self.subsampling_h as usize,
            )
        }
    }

    pub fn is_chroma_subsampled(&self) -> bool {
        self.color_family == ColorFamily::Yuv && (self.subsampling_w > 0 || self.subsampling_h > 0)
    }

    /// Whether `width × height` divides evenly into chroma samples.
    pub fn fits_subsampling(&self, width: usize, height: usize) -> bool {
        if self.color_family != ColorFamily::Yuv {
            return true;
        }
        width % (1usize << self.subsampling_w) == 0 && height % (1usize << self.subsampling_h) == 0
    }
}

impl std::fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.color_family, self.subsampling_w, self.subsampling_h) {
            (ColorFamily::Gray, _, _) => write!(f, "GrayS"),
            (ColorFamily::Rgb, _, _) => write!(f, "RGBS"),
            (ColorFamily::Yuv, 1, 1) => write!(f, "YUV420PS"),
            (ColorFamily::Yuv, 1, 0) => write!(f, "YUV422PS"),
            (ColorFamily::Yuv, 0, 0) => write!(f, "YUV444PS"),
            (ColorFamily::Yuv, w, h) => write!(f, "YUV(ssw={w},ssh={h})PS"),
        }
    }
}

/// Clip description. A width or height of zero means the clip changes
/// dimensions between frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub format: VideoFormat,
    pub width: usize,
    pub height: usize,
    pub num_frames: usize,
}

impl VideoInfo {
    pub fn is_constant_format(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

/// One host plane: `height` rows of `stride` samples, of which the first
/// `width` are visible.
#[derive(Debug, Clone, PartialEq)]
pub struct Plane {
    width: usize,
    height: usize,
    stride: usize,
    data: Vec<f32>,
}

impl Plane {
    pub fn new(width: usize, height: usize) -> Self {
        let stride = width.div_ceil(PLANE_ROW_ALIGN) * PLANE_ROW_ALIGN;
        Self {
            width,
            height,
            stride,
            data: vec![0.0; stride * height],
        }
    }

    /// Wrap existing samples laid out with the given stride.
    pub fn from_vec(width: usize, height: usize, stride: usize, data: Vec<f32>) -> Result<Self> {
        if stride < width {
            return Err(Error::geometry(format!(
                "plane stride {stride} is smaller than width {width}"
            )));
        }
        if data.len() < stride * height {
            return Err(Error::geometry(format!(
                "plane needs {} samples ({stride}x{height}), got {}",
                stride * height,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            stride,
            data,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn row(&self, y: usize) -> &[f32] {
        let start = y * self.stride;
        &self.data[start..start + self.width]
    }

    pub fn row_mut(&mut self, y: usize) -> &mut [f32] {
        let start = y * self.stride;
        &mut self.data[start..start + self.width]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data
            .chunks(self.stride.max(1))
            .take(self.height)
            .map(|row| &row[..self.width])
    }

    pub fn fill(&mut self, value: f32) {
        for y in 0..self.height {
            self.row_mut(y).fill(value);
        }
    }

    /// Raw storage including row padding.
    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

/// A planar float frame as exchanged with the host.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    format: VideoFormat,
    width: usize,
    height: usize,
    planes: Vec<Plane>,
}

impl Frame {
    /// Allocate a zeroed frame (the frame sink of the host interface).
    pub fn new(format: VideoFormat, width: usize, height: usize) -> Self {
        let planes = (0..format.num_planes())
            .map(|plane| {
                let (w, h) = format.plane_dimensions(plane, width, height);
                Plane::new(w, h)
            })
            .collect();
        Self {
            format,
            width,
            height,
            planes,
        }
    }

    pub fn from_planes(
        format: VideoFormat,
        width: usize,
        height: usize,
        planes: Vec<Plane>,
    ) -> Result<Self> {
        if planes.len() != format.num_planes() {
            return Err(Error::geometry(format!(
                "{format} frame needs {} planes, got {}",
                format.num_planes(),
                planes.len()
            )));
        }
        for (index, plane) in planes.iter().enumerate() {
            let expected = format.plane_dimensions(index, width, height);
            if (plane.width(), plane.height()) != expected {
                return Err(Error::geometry(format!(
                    "plane {index} is {}x{}, expected {}x{}",
                    plane.width(),
                    plane.height(),
                    expected.0,
                    expected.1
                )));
            }
        }
        Ok(Self {
            format,
            width,
            height,
            planes,
        })
    }

    pub fn format(&self) -> VideoFormat {
        self.format
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    pub fn plane(&self, index: usize) -> &Plane {
        &self.planes[index]
    }

    pub fn plane_mut(&mut self, index: usize) -> &mut Plane {
        &mut self.planes[index]
    }

    pub fn planes_mut(&mut self) -> &mut [Plane] {
        &mut self.planes
    }
}

/// Dense interleaved (channel-minor) float image handed to the dispatcher.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageBuffer {
    width: usize,
    height: usize,
    channels: usize,
    stride: usize,
    data: Vec<f32>,
}

impl ImageBuffer {
    pub fn new(width: usize, height: usize, channels: usize) -> Self {
        Self {
            width,
            height,
            channels,
            stride: width * channels,
            data: vec![0.0; width * height * channels],
        }
    }

    /// Empty buffer that can later be reshaped up to `samples` without
    /// reallocating. Fails instead of aborting when the memory is unavailable.
    pub fn try_with_capacity(samples: usize) -> Result<Self, TryReserveError> {
        let mut data = Vec::new();
        data.try_reserve_exact(samples)?;
        Ok(Self {
            data,
            ..Self::default()
        })
    }

    pub fn from_vec(width: usize, height: usize, channels: usize, data: Vec<f32>) -> Result<Self> {
        let expected = width * height * channels;
        if data.len() != expected {
            return Err(Error::geometry(format!(
                "image buffer {width}x{height}x{channels} needs {expected} samples, got {}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            channels,
            stride: width * channels,
            data,
        })
    }

    /// Change the geometry in place, keeping the allocation when it is large enough.
    pub fn reshape(&mut self, width: usize, height: usize, channels: usize) {
        self.width = width;
        self.height = height;
        self.channels = channels;
        self.stride = width * channels;
        self.data.resize(width * height * channels, 0.0);
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Row stride in samples.
    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn row(&self, y: usize) -> &[f32] {
        let start = y * self.stride;
        &self.data[start..start + self.width * self.channels]
    }

    pub fn row_mut(&mut self, y: usize) -> &mut [f32] {
        let start = y * self.stride;
        let len = self.width * self.channels;
        &mut self.data[start..start + len]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plane_stride_is_padded_to_alignment() {
        let plane = Plane::new(13, 2);
        assert_eq!(plane.stride(), 16);
        assert_eq!(plane.row(1).len(), 13);
        assert_eq!(plane.data().len(), 32);
    }

    #[test]
    fn plane_from_vec_rejects_short_storage() {
        let err = Plane::from_vec(4, 4, 4, vec![0.0; 15]).unwrap_err();
        assert_eq!(err.category(), "geometry");
        assert!(Plane::from_vec(4, 4, 3, vec![0.0; 16]).is_err());
    }

    #[test]
    fn yuv420_frame_has_subsampled_chroma() {
        let frame = Frame::new(VideoFormat::YUV420, 16, 8);
        assert_eq!(frame.planes().len(), 3);
        assert_eq!((frame.plane(0).width(), frame.plane(0).height()), (16, 8));
        assert_eq!((frame.plane(1).width(), frame.plane(1).height()), (8, 4));
        assert_eq!((frame.plane(2).width(), frame.plane(2).height()), (8, 4));
    }

    #[test]
    fn rgb_frame_planes_share_dimensions() {
        let frame = Frame::new(VideoFormat::RGB, 5, 3);
        for plane in frame.planes() {
            assert_eq!((plane.width(), plane.height()), (5, 3));
        }
    }

    #[test]
    fn frame_from_planes_checks_plane_geometry() {
        let planes = vec![Plane::new(4, 4), Plane::new(4, 4), Plane::new(4, 4)];
        assert!(Frame::from_planes(VideoFormat::YUV420, 4, 4, planes).is_err());

        let planes = vec![Plane::new(4, 4), Plane::new(2, 2), Plane::new(2, 2)];
        assert!(Frame::from_planes(VideoFormat::YUV420, 4, 4, planes).is_ok());
    }

    #[test]
    fn format_names_parse() {
        assert_eq!(VideoFormat::from_name("RGB"), Some(VideoFormat::RGB));
        assert_eq!(VideoFormat::from_name("yuv420"), Some(VideoFormat::YUV420));
        assert_eq!(VideoFormat::from_name("gray"), Some(VideoFormat::GRAY));
        assert_eq!(VideoFormat::from_name("nv12"), None);
        assert!(VideoFormat::YUV422.is_chroma_subsampled());
        assert!(!VideoFormat::YUV444.is_chroma_subsampled());
    }

    #[test]
    fn subsampling_fit_depends_on_format() {
        assert!(VideoFormat::YUV420.fits_subsampling(6, 4));
        assert!(!VideoFormat::YUV420.fits_subsampling(5, 4));
        assert!(!VideoFormat::YUV420.fits_subsampling(6, 3));
        assert!(VideoFormat::YUV422.fits_subsampling(6, 3));
        assert!(!VideoFormat::YUV422.fits_subsampling(5, 4));
        assert!(VideoFormat::YUV444.fits_subsampling(5, 3));
        assert!(VideoFormat::RGB.fits_subsampling(5, 3));
        assert!(VideoFormat::GRAY.fits_subsampling(5, 3));
    }

    #[test]
    fn oversized_buffer_reservation_is_an_error() {
        assert!(ImageBuffer::try_with_capacity(usize::MAX / 2).is_err());
    }

    #[test]
    fn image_buffer_reshape_reuses_allocation() {
        let mut buf = ImageBuffer::try_with_capacity(64).unwrap();
        let capacity = buf.capacity();
        buf.reshape(4, 4, 3);
        assert_eq!(buf.as_slice().len(), 48);
        assert_eq!(buf.stride(), 12);
        assert_eq!(buf.capacity(), capacity);
        buf.reshape(2, 2, 1);
        assert_eq!(buf.as_slice().len(), 4);
        assert_eq!(buf.capacity(), capacity);
    }

    #[test]
    fn image_buffer_from_vec_checks_length() {
        assert!(ImageBuffer::from_vec(2, 2, 3, vec![0.0; 12]).is_ok());
        assert!(ImageBuffer::from_vec(2, 2, 3, vec![0.0; 11]).is_err());
    }
}
