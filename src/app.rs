//! Wires the frame source, preview transcoder, clip recorder and HTTP server
//! together and supervises them as one unit.
//!
//! Every context cancels the shared token when it ends, so a recorder failure
//! stops the preview and the server too and is returned to the caller.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::capture::FrameSource;
use crate::error::Result;
use crate::overlay::OverlayStamper;
use crate::pipeline::transcoder::TranscodeStats;
use crate::pipeline::{Clip, ClipRecorder, PreviewSlot, PreviewTranscoder};
use crate::stream::{StreamBroadcaster, StreamState};
use crate::Config;

/// A validated, bound, not yet running system.
pub struct App {
    config: Config,
    source: Arc<dyn FrameSource>,
    slot: Arc<PreviewSlot>,
    server: StreamBroadcaster,
    clips: Option<flume::Sender<Clip>>,
}

impl App {
    /// Validate `config` and bind the HTTP listener. Nothing is captured yet.
    pub async fn new(config: Config, source: Arc<dyn FrameSource>) -> Result<Self> {
        config.validate()?;

        let slot = Arc::new(PreviewSlot::new());
        let state = StreamState::new(slot.clone(), config.preview.width, config.preview.height);
        let server = StreamBroadcaster::bind(config.listen_addr(), state)
            .await?
            .with_shutdown_grace(Duration::from_millis(config.server.shutdown_grace_ms));

        Ok(Self {
            config,
            source,
            slot,
            server,
            clips: None,
        })
    }

    /// Forward finalized clips to `sink`.
    pub fn with_clip_sink(mut self, sink: flume::Sender<Clip>) -> Self {
        self.clips = Some(sink);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.server.local_addr()
    }

    pub fn preview_slot(&self) -> Arc<PreviewSlot> {
        self.slot.clone()
    }

    /// Run until `cancel` fires or a context fails.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let Self {
            config,
            source,
            slot,
            server,
            clips,
        } = self;

        source.register_pre_frame_hook(OverlayStamper::new(config.overlay.clone()).into_hook());
        let low = source.open_low_res()?;
        let full = source.open_full_res()?;

        let transcoder = PreviewTranscoder::new(low, slot, &config.preview);
        let mut recorder = ClipRecorder::new(full, &config.recording);
        if let Some(sink) = clips {
            recorder = recorder.with_clip_sink(sink);
        }

        // Unblock capture calls parked on the driver once we are stopping.
        let stopper = {
            let cancel = cancel.clone();
            let source = source.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                source.stop();
            })
        };

        info!("Starting capture, preview and HTTP contexts");
        let transcode = supervise(&cancel, transcoder.run(cancel.clone()));
        let record = supervise(&cancel, recorder.run(cancel.clone()));
        let serve = supervise(&cancel, server.serve(cancel.clone()));

        let (transcoded, recorded, served) = tokio::join!(transcode, record, serve);
        stopper.await?;
        settle(transcoded, recorded, served)
    }
}

/// Fold the three context outcomes into one. The recorder's outcome is
/// checked first so its error survives a failure elsewhere.
fn settle(
    transcoded: std::result::Result<TranscodeStats, JoinError>,
    recorded: std::result::Result<Result<u64>, JoinError>,
    served: std::result::Result<Result<()>, JoinError>,
) -> Result<()> {
    match recorded? {
        Ok(clips) => info!(clips, "Recording finished"),
        Err(e) => {
            error!("Recording failed, shutting down: {}", e);
            return Err(e);
        }
    }

    let stats = transcoded?;
    info!(
        published = stats.published,
        dropped = stats.dropped,
        "Preview finished"
    );

    served?
}

/// Spawn `fut` and cancel `cancel` when it completes, whatever the outcome.
fn supervise<F>(cancel: &CancellationToken, fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let cancel = cancel.clone();
    tokio::spawn(async move {
        let out = fut.await;
        cancel.cancel();
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    async fn panicked<T: Send + 'static>() -> std::result::Result<T, JoinError> {
        tokio::spawn(async { panic!("context crashed") }).await
    }

    #[tokio::test]
    async fn recording_error_survives_a_crashed_transcoder() {
        let recorded = Ok(Err(Error::recording("clip.mp4", "muxer refused to open")));
        let result = settle(panicked().await, recorded, Ok(Ok(())));
        assert!(matches!(result, Err(Error::Recording { .. })));
    }

    #[tokio::test]
    async fn crashed_transcoder_fails_a_clean_recording() {
        let result = settle(panicked().await, Ok(Ok(3)), Ok(Ok(())));
        assert!(matches!(result, Err(Error::Task(_))));
    }

    #[tokio::test]
    async fn clean_contexts_settle_ok() {
        let stats = TranscodeStats {
            published: 4,
            dropped: 1,
        };
        settle(Ok(stats), Ok(Ok(2)), Ok(Ok(()))).unwrap();
    }
}
