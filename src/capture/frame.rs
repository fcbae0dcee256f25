use bytes::Bytes;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Immutable captured frame, cheap to clone across threads
#[derive(Clone)]
pub struct Frame {
    /// Pixel data laid out according to `meta.format`
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Monotonic capture instant for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes per row of the first plane
    pub stride: u32,
    pub format: PixelFormat,
    /// Wall-clock capture time
    pub captured_at: DateTime<Local>,
}

impl Frame {
    pub fn new(data: impl Into<Bytes>, meta: FrameMetadata) -> Self {
        Self {
            data: data.into(),
            meta: Arc::new(meta),
            timestamp: Instant::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn format(&self) -> PixelFormat {
        self.meta.format
    }
}

/// Mutable view of a full-resolution frame handed to the pre-frame hook
/// before the frame is committed to the encoder.
pub struct FrameMut<'a> {
    pub data: &'a mut [u8],
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
}

impl<'a> FrameMut<'a> {
    /// Wrap a tightly packed buffer.
    pub fn packed(data: &'a mut [u8], width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data,
            width,
            height,
            stride: format.stride(width),
            format,
        }
    }
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv,
    Nv12,
    I420,
}

impl PixelFormat {
    /// Bytes per row of the first plane for a tightly packed frame.
    pub fn stride(self, width: u32) -> u32 {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => width * 3,
            PixelFormat::Yuyv => width * 2,
            PixelFormat::Nv12 | PixelFormat::I420 => width,
        }
    }

    /// Total size in bytes of a tightly packed frame.
    pub fn frame_len(self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => w * h * 3,
            PixelFormat::Yuyv => w * h * 2,
            PixelFormat::Nv12 | PixelFormat::I420 => w * h + 2 * (w.div_ceil(2) * h.div_ceil(2)),
        }
    }

    pub fn is_planar_yuv(self) -> bool {
        matches!(self, PixelFormat::Nv12 | PixelFormat::I420)
    }
}
