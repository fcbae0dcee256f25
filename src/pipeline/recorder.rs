//! Fixed-duration clip recording loop

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::watch;
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::capture::source::{QualityPreset, RecordingChannel, SegmentReport, SegmentRequest};
use crate::error::{Error, Result};
use crate::RecordingConfig;

/// Filename layout of a clip, without extension.
pub const CLIP_NAME_FORMAT: &str = "%Y-%m-%d_%H_%M_%S";

/// Where the recorder is in its segment cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording { path: PathBuf },
    Finalizing { path: PathBuf },
}

/// A finalized recording segment.
#[derive(Debug, Clone)]
pub struct Clip {
    pub path: PathBuf,
    pub started_at: DateTime<Local>,
    pub finalized_at: DateTime<Local>,
    pub target: Duration,
    pub report: SegmentReport,
}

impl Clip {
    /// Span between the first and last committed frame.
    pub fn captured_span(&self) -> Option<Duration> {
        let first = self.report.first_frame_at?;
        let last = self.report.last_frame_at?;
        (last - first).to_std().ok()
    }
}

/// Drives the full-resolution channel through back-to-back segments.
pub struct ClipRecorder {
    channel: Box<dyn RecordingChannel>,
    output_dir: PathBuf,
    clip_duration: Duration,
    quality: QualityPreset,
    state: watch::Sender<RecorderState>,
    clips: Option<flume::Sender<Clip>>,
}

impl ClipRecorder {
    pub fn new(channel: Box<dyn RecordingChannel>, config: &RecordingConfig) -> Self {
        let (state, _) = watch::channel(RecorderState::Idle);
        Self {
            channel,
            output_dir: config.output_dir.clone(),
            clip_duration: Duration::from_secs(config.clip_seconds),
            quality: config.quality,
            state,
            clips: None,
        }
    }

    /// Forward every finalized clip to `sink`.
    pub fn with_clip_sink(mut self, sink: flume::Sender<Clip>) -> Self {
        self.clips = Some(sink);
        self
    }

    /// Observe state transitions.
    pub fn state(&self) -> watch::Receiver<RecorderState> {
        self.state.subscribe()
    }

    /// Record segments until `cancel` fires. Encoder or muxer failures end the
    /// loop and are returned.
    #[instrument(name = "recorder", skip_all, fields(dir = %self.output_dir.display()))]
    pub async fn run(self, cancel: CancellationToken) -> Result<u64> {
        let Self {
            mut channel,
            output_dir,
            clip_duration,
            quality,
            state,
            clips,
        } = self;
        let mut finalized = 0u64;

        info!(clip = ?clip_duration, ?quality, "Clip recorder started");

        while !cancel.is_cancelled() {
            let started_at = Local::now();
            let path = clip_path(&output_dir, started_at, channel.container_extension());
            let request = SegmentRequest {
                path: path.clone(),
                duration: clip_duration,
                quality,
                stop: cancel.child_token(),
            };

            state.send_replace(RecorderState::Recording { path: path.clone() });
            info!(path = %path.display(), "Recording segment");

            let (returned, result) = task::spawn_blocking(move || {
                let result = channel.record_segment(&request);
                (channel, result)
            })
            .await
            .map_err(|e| Error::recording(&path, format!("recording task failed: {e}")))?;
            channel = returned;

            state.send_replace(RecorderState::Finalizing { path: path.clone() });
            let report = match result {
                Ok(report) => report,
                Err(e) => {
                    error!(path = %path.display(), "Segment failed: {}", e);
                    state.send_replace(RecorderState::Idle);
                    return Err(e);
                }
            };

            finalized += 1;
            metrics::counter!("clipcam_clips_finalized_total").increment(1);
            info!(
                path = %path.display(),
                frames = report.frames,
                bytes = report.bytes_written,
                "Segment finalized"
            );

            if let Some(sink) = &clips {
                let clip = Clip {
                    path,
                    started_at,
                    finalized_at: Local::now(),
                    target: clip_duration,
                    report,
                };
                // Nobody listening is fine.
                let _ = sink.send(clip);
            }
        }

        state.send_replace(RecorderState::Idle);
        info!(clips = finalized, "Clip recorder stopped");
        Ok(finalized)
    }
}

/// `<dir>/<YYYY-MM-DD_HH_MM_SS>.<ext>`, suffixed `_1`, `_2`, … if taken.
pub fn clip_path(dir: &Path, started_at: DateTime<Local>, extension: &str) -> PathBuf {
    let stem = started_at.format(CLIP_NAME_FORMAT).to_string();
    let mut path = dir.join(format!("{stem}.{extension}"));
    let mut n = 1;
    while path.exists() {
        path = dir.join(format!("{stem}_{n}.{extension}"));
        n += 1;
    }
    path
}
