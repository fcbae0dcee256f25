//! Low-resolution frames to JPEG, published to the preview slot at a fixed pace

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use jpeg_encoder::{ColorType, Encoder, SamplingFactor};
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::capture::convert;
use crate::capture::source::FrameChannel;
use crate::capture::Frame;
use crate::error::{Error, Result};
use crate::pipeline::slot::PreviewSlot;
use crate::PreviewConfig;

/// Counters returned when the loop exits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TranscodeStats {
    pub published: u64,
    pub dropped: u64,
}

/// Pulls preview frames, encodes them and overwrites the preview slot.
pub struct PreviewTranscoder {
    channel: Arc<dyn FrameChannel>,
    slot: Arc<PreviewSlot>,
    interval: Duration,
    quality: u8,
}

impl PreviewTranscoder {
    pub fn new(channel: Arc<dyn FrameChannel>, slot: Arc<PreviewSlot>, config: &PreviewConfig) -> Self {
        Self {
            channel,
            slot,
            interval: Duration::from_millis(config.interval_ms),
            quality: config.jpeg_quality,
        }
    }

    /// Run until `cancel` fires or the channel closes. The slot is closed on
    /// exit so blocked viewers see end-of-stream.
    #[instrument(name = "transcoder", skip_all)]
    pub async fn run(self, cancel: CancellationToken) -> TranscodeStats {
        let mut stats = TranscodeStats::default();
        info!(interval = ?self.interval, "Preview transcoder started");

        loop {
            let channel = self.channel.clone();
            let captured = tokio::select! {
                _ = cancel.cancelled() => break,
                res = task::spawn_blocking(move || channel.capture_next()) => res,
            };

            let frame = match captured {
                Ok(Ok(frame)) => Some(frame),
                Ok(Err(Error::SourceClosed)) => {
                    info!("Preview channel closed");
                    break;
                }
                Ok(Err(e)) => {
                    warn!("Preview capture failed, skipping frame: {}", e);
                    None
                }
                Err(e) => {
                    warn!("Preview capture task failed: {}", e);
                    None
                }
            };

            if let Some(frame) = frame {
                let quality = self.quality;
                let captured_at = frame.meta.captured_at;
                let sequence = frame.meta.sequence;
                match task::spawn_blocking(move || encode_preview(&frame, quality)).await {
                    Ok(Ok(jpeg)) => {
                        let bytes = jpeg.len();
                        if let Some(published) = self.slot.publish(jpeg, captured_at) {
                            stats.published += 1;
                            metrics::counter!("clipcam_preview_published_total").increment(1);
                            debug!(sequence, published, bytes, "Published preview frame");
                        }
                    }
                    Ok(Err(e)) => {
                        stats.dropped += 1;
                        metrics::counter!("clipcam_preview_dropped_total").increment(1);
                        warn!(sequence, "Dropped preview frame: {}", e);
                    }
                    Err(e) => {
                        stats.dropped += 1;
                        metrics::counter!("clipcam_preview_dropped_total").increment(1);
                        warn!(sequence, "Preview encode task failed: {}", e);
                    }
                }
            } else {
                stats.dropped += 1;
                metrics::counter!("clipcam_preview_dropped_total").increment(1);
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        self.slot.close();
        info!(
            published = stats.published,
            dropped = stats.dropped,
            "Preview transcoder stopped"
        );
        stats
    }
}

/// Convert a frame to RGB and encode it as 4:2:0 JPEG.
pub fn encode_preview(frame: &Frame, quality: u8) -> Result<Bytes> {
    let rgb = convert::to_rgb(frame)?;
    let width = u16::try_from(frame.width())
        .map_err(|_| Error::transcode(format!("width {} too large for JPEG", frame.width())))?;
    let height = u16::try_from(frame.height())
        .map_err(|_| Error::transcode(format!("height {} too large for JPEG", frame.height())))?;

    let mut jpeg = Vec::with_capacity(rgb.len() / 8);
    let mut encoder = Encoder::new(&mut jpeg, quality);
    encoder.set_sampling_factor(SamplingFactor::F_2_2);
    encoder
        .encode(&rgb, width, height, ColorType::Rgb)
        .map_err(|e| Error::transcode(e.to_string()))?;

    Ok(Bytes::from(jpeg))
}
