//! Contracts between the pipeline and the sensor/codec driver

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::capture::frame::{Frame, FrameMut};
use crate::error::Result;

/// Callback run on every full-resolution frame before it reaches the encoder.
pub type PreFrameHook = Arc<dyn Fn(&mut FrameMut<'_>) + Send + Sync>;

/// A camera that exposes a preview channel and an exclusively owned
/// recording channel at independent resolutions.
pub trait FrameSource: Send + Sync {
    /// Open the low-resolution channel. May be shared between readers.
    fn open_low_res(&self) -> Result<Arc<dyn FrameChannel>>;

    /// Open the full-resolution channel. Only one owner may hold it; a second
    /// call fails.
    fn open_full_res(&self) -> Result<Box<dyn RecordingChannel>>;

    /// Install the hook applied to every full-resolution frame.
    fn register_pre_frame_hook(&self, hook: PreFrameHook);

    /// Stop producing frames. Blocked readers see [`crate::Error::SourceClosed`].
    fn stop(&self) {}
}

/// Blocking pull-based frame channel.
pub trait FrameChannel: Send + Sync {
    /// Block until the next frame is available.
    fn capture_next(&self) -> Result<Frame>;

    fn resolution(&self) -> (u32, u32);
}

/// Full-resolution channel wired to the hardware encoder and muxer.
pub trait RecordingChannel: Send {
    /// Record one segment into `request.path`. Blocks until the duration has
    /// elapsed or `request.stop` fires, then finalizes the file.
    fn record_segment(&mut self, request: &SegmentRequest) -> Result<SegmentReport>;

    /// File extension of the container written, without the dot.
    fn container_extension(&self) -> &'static str;
}

/// One segment to record.
#[derive(Debug, Clone)]
pub struct SegmentRequest {
    pub path: PathBuf,
    pub duration: Duration,
    pub quality: QualityPreset,
    /// Finalize early when cancelled.
    pub stop: CancellationToken,
}

/// What a finished segment contains.
#[derive(Debug, Clone, Default)]
pub struct SegmentReport {
    pub frames: u64,
    pub first_sequence: Option<u64>,
    pub last_sequence: Option<u64>,
    pub first_frame_at: Option<DateTime<Local>>,
    pub last_frame_at: Option<DateTime<Local>>,
    pub bytes_written: u64,
}

impl SegmentReport {
    /// Account for one frame committed to the segment.
    pub fn record_frame(&mut self, sequence: u64, captured_at: DateTime<Local>) {
        self.frames += 1;
        self.first_sequence.get_or_insert(sequence);
        self.first_frame_at.get_or_insert(captured_at);
        self.last_sequence = Some(sequence);
        self.last_frame_at = Some(captured_at);
    }
}

/// Encoder quality presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityPreset {
    VeryLow,
    Low,
    Medium,
    High,
    #[default]
    VeryHigh,
}

impl QualityPreset {
    /// Target bitrate in kbit/s for the given stream geometry.
    pub fn bitrate_kbps(self, width: u32, height: u32, fps: u32) -> u32 {
        // bits per pixel per frame
        let bpp = match self {
            QualityPreset::VeryLow => 0.03,
            QualityPreset::Low => 0.05,
            QualityPreset::Medium => 0.08,
            QualityPreset::High => 0.12,
            QualityPreset::VeryHigh => 0.18,
        };
        let bits = width as f64 * height as f64 * fps as f64 * bpp;
        ((bits / 1000.0) as u32).max(100)
    }

    /// JPEG quality used by sources that record Motion-JPEG.
    pub fn jpeg_quality(self) -> u8 {
        match self {
            QualityPreset::VeryLow => 40,
            QualityPreset::Low => 60,
            QualityPreset::Medium => 75,
            QualityPreset::High => 85,
            QualityPreset::VeryHigh => 95,
        }
    }
}
