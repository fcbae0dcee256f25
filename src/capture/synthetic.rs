//! Built-in test-pattern camera
//!
//! Produces moving color bars on both channels without any hardware. The
//! preview channel delivers I420 frames, the recording channel RGB frames
//! which are stamped by the pre-frame hook and written as Motion-JPEG
//! segments (concatenated JPEG images).
//!
//! Recording frames are clocked by sequence number from the first segment's
//! start, so consecutive segments continue the same sequence without gaps.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Local;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use tracing::{debug, info};

use crate::capture::convert::rgb_to_yuv;
use crate::capture::frame::{Frame, FrameMetadata, FrameMut, PixelFormat};
use crate::capture::source::{
    FrameChannel, FrameSource, PreFrameHook, RecordingChannel, SegmentReport, SegmentRequest,
};
use crate::error::{Error, Result};

/// Polling granularity while waiting for the next frame tick.
const STOP_POLL: Duration = Duration::from_millis(50);

/// Test-pattern frame source.
pub struct SyntheticSource {
    inner: Arc<Inner>,
}

struct Inner {
    full: (u32, u32),
    low: (u32, u32),
    fps: u32,
    hook: RwLock<Option<PreFrameHook>>,
    full_taken: AtomicBool,
    stopped: AtomicBool,
}

impl SyntheticSource {
    pub fn new(full: (u32, u32), low: (u32, u32), fps: u32) -> Self {
        info!(
            "Synthetic source: record {}x{}, preview {}x{}, {} fps",
            full.0, full.1, low.0, low.1, fps
        );
        Self {
            inner: Arc::new(Inner {
                full,
                low,
                fps: fps.max(1),
                hook: RwLock::new(None),
                full_taken: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }
}

impl FrameSource for SyntheticSource {
    fn open_low_res(&self) -> Result<Arc<dyn FrameChannel>> {
        Ok(Arc::new(SyntheticPreview {
            inner: self.inner.clone(),
            epoch: Instant::now(),
            next_tick: Mutex::new(0),
        }))
    }

    fn open_full_res(&self) -> Result<Box<dyn RecordingChannel>> {
        if self.inner.full_taken.swap(true, Ordering::SeqCst) {
            return Err(Error::capture("full-resolution channel already open"));
        }
        Ok(Box::new(SyntheticRecorder {
            inner: self.inner.clone(),
            epoch: None,
            next_sequence: 0,
        }))
    }

    fn register_pre_frame_hook(&self, hook: PreFrameHook) {
        if let Ok(mut slot) = self.inner.hook.write() {
            *slot = Some(hook);
        }
    }

    fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
    }
}

impl Inner {
    fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps as f64)
    }

    fn hook(&self) -> Option<PreFrameHook> {
        self.hook.read().ok().and_then(|h| h.clone())
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Sleep until `deadline`, waking early on stop. Returns false if stopped.
    fn sleep_until(&self, deadline: Instant, stop: impl Fn() -> bool) -> bool {
        loop {
            if self.is_stopped() || stop() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(STOP_POLL));
        }
    }
}

struct SyntheticPreview {
    inner: Arc<Inner>,
    epoch: Instant,
    next_tick: Mutex<u64>,
}

impl FrameChannel for SyntheticPreview {
    fn capture_next(&self) -> Result<Frame> {
        let mut tick = self
            .next_tick
            .lock()
            .map_err(|_| Error::capture("preview clock poisoned"))?;

        // Skip ticks we slept through; preview always wants the newest frame.
        let period = self.inner.period();
        let elapsed = self.epoch.elapsed().as_secs_f64();
        let due = (elapsed / period.as_secs_f64()).ceil() as u64;
        *tick = (*tick).max(due);

        let deadline = self.epoch + period.mul_f64(*tick as f64);
        if !self.inner.sleep_until(deadline, || false) {
            return Err(Error::SourceClosed);
        }

        let sequence = *tick;
        *tick += 1;
        let (width, height) = self.inner.low;
        let rgb = pattern_rgb(width, height, sequence);
        Ok(Frame::new(
            rgb_to_i420(&rgb, width, height),
            FrameMetadata {
                sequence,
                width,
                height,
                stride: width,
                format: PixelFormat::I420,
                captured_at: Local::now(),
            },
        ))
    }

    fn resolution(&self) -> (u32, u32) {
        self.inner.low
    }
}

struct SyntheticRecorder {
    inner: Arc<Inner>,
    epoch: Option<Instant>,
    next_sequence: u64,
}

impl RecordingChannel for SyntheticRecorder {
    fn record_segment(&mut self, request: &SegmentRequest) -> Result<SegmentReport> {
        let path = &request.path;
        let file = File::create(path)
            .map_err(|e| Error::recording(path, format!("cannot open output: {e}")))?;
        let mut out = BufWriter::new(file);

        let period = self.inner.period();
        let epoch = *self.epoch.get_or_insert_with(Instant::now);
        let frames = (request.duration.as_secs_f64() * self.inner.fps as f64).round() as u64;
        let first = self.next_sequence;
        let (width, height) = self.inner.full;
        let quality = request.quality.jpeg_quality();
        let hook = self.inner.hook();
        let mut report = SegmentReport::default();

        for sequence in first..first + frames {
            let deadline = epoch + period.mul_f64(sequence as f64);
            if !self.inner.sleep_until(deadline, || request.stop.is_cancelled()) {
                debug!(path = %path.display(), "Segment stopped early");
                break;
            }

            let mut rgb = pattern_rgb(width, height, sequence);
            if let Some(hook) = &hook {
                hook(&mut FrameMut::packed(&mut rgb, width, height, PixelFormat::Rgb24));
            }

            let mut jpeg = Vec::new();
            JpegEncoder::new_with_quality(&mut jpeg, quality)
                .encode(&rgb, width, height, ExtendedColorType::Rgb8)
                .map_err(|e| Error::recording(path, format!("encode failed: {e}")))?;
            out.write_all(&jpeg)
                .map_err(|e| Error::recording(path, format!("write failed: {e}")))?;

            report.bytes_written += jpeg.len() as u64;
            report.record_frame(sequence, Local::now());
            self.next_sequence = sequence + 1;
        }

        // Hold the segment open until its nominal end so clips span the full duration.
        let end = epoch + period.mul_f64((first + frames) as f64);
        if report.frames == frames {
            self.inner.sleep_until(end, || request.stop.is_cancelled());
        }

        out.flush()
            .and_then(|_| out.get_ref().sync_all())
            .map_err(|e| Error::recording(path, format!("finalize failed: {e}")))?;
        Ok(report)
    }

    fn container_extension(&self) -> &'static str {
        "mjpeg"
    }
}

/// Vertical color bars scrolling one bar width every second at 10 fps.
pub fn pattern_rgb(width: u32, height: u32, sequence: u64) -> Vec<u8> {
    const BARS: [[u8; 3]; 8] = [
        [235, 235, 235],
        [235, 235, 16],
        [16, 235, 235],
        [16, 235, 16],
        [235, 16, 235],
        [235, 16, 16],
        [16, 16, 235],
        [16, 16, 16],
    ];
    let bar_width = (width / BARS.len() as u32).max(1);
    let shift = (sequence * bar_width as u64 / 10) as u32;

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for _ in 0..height {
        for x in 0..width {
            let bar = ((x + shift) / bar_width) as usize % BARS.len();
            rgb.extend_from_slice(&BARS[bar]);
        }
    }
    rgb
}

/// Pack RGB24 into I420, sampling chroma from the top-left pixel of each 2x2 block.
pub fn rgb_to_i420(rgb: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    let mut out = vec![0u8; PixelFormat::I420.frame_len(width, height)];
    let (y_plane, chroma) = out.split_at_mut(w * h);
    let (u_plane, v_plane) = chroma.split_at_mut(cw * ch);

    for row in 0..h {
        for col in 0..w {
            let i = (row * w + col) * 3;
            let [y, u, v] = rgb_to_yuv(rgb[i], rgb[i + 1], rgb[i + 2]);
            y_plane[row * w + col] = y;
            if row % 2 == 0 && col % 2 == 0 {
                let c = (row / 2) * cw + col / 2;
                u_plane[c] = u;
                v_plane[c] = v;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::source::QualityPreset;
    use std::sync::atomic::AtomicU64;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn full_res_channel_is_exclusive() {
        let source = SyntheticSource::new((64, 48), (32, 24), 10);
        let _first = source.open_full_res().unwrap();
        assert!(source.open_full_res().is_err());
    }

    #[test]
    fn preview_frames_are_i420() {
        let source = SyntheticSource::new((64, 48), (32, 24), 50);
        let channel = source.open_low_res().unwrap();
        let a = channel.capture_next().unwrap();
        let b = channel.capture_next().unwrap();
        assert_eq!(a.format(), PixelFormat::I420);
        assert_eq!(a.data.len(), PixelFormat::I420.frame_len(32, 24));
        assert!(b.meta.sequence > a.meta.sequence);
    }

    #[test]
    fn stop_closes_preview_channel() {
        let source = SyntheticSource::new((64, 48), (32, 24), 1);
        let channel = source.open_low_res().unwrap();
        source.stop();
        assert!(matches!(channel.capture_next(), Err(Error::SourceClosed)));
    }

    #[test]
    fn segments_continue_the_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let source = SyntheticSource::new((32, 24), (16, 12), 20);
        let hits = Arc::new(AtomicU64::new(0));
        let counter = hits.clone();
        source.register_pre_frame_hook(Arc::new(move |_frame: &mut FrameMut<'_>| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let mut channel = source.open_full_res().unwrap();

        let mut reports = Vec::new();
        for name in ["a.mjpeg", "b.mjpeg"] {
            let request = SegmentRequest {
                path: dir.path().join(name),
                duration: Duration::from_millis(250),
                quality: QualityPreset::Low,
                stop: CancellationToken::new(),
            };
            reports.push(channel.record_segment(&request).unwrap());
        }

        assert_eq!(reports[0].frames, 5);
        assert_eq!(reports[1].frames, 5);
        assert_eq!(reports[0].last_sequence.unwrap() + 1, reports[1].first_sequence.unwrap());
        assert_eq!(hits.load(Ordering::SeqCst), 10);

        let bytes = std::fs::read(dir.path().join("a.mjpeg")).unwrap();
        assert_eq!(bytes.len() as u64, reports[0].bytes_written);
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn unwritable_path_is_a_recording_error() {
        let source = SyntheticSource::new((32, 24), (16, 12), 20);
        let mut channel = source.open_full_res().unwrap();
        let request = SegmentRequest {
            path: "/nonexistent-dir/clip.mjpeg".into(),
            duration: Duration::from_millis(100),
            quality: QualityPreset::Low,
            stop: CancellationToken::new(),
        };
        assert!(matches!(
            channel.record_segment(&request),
            Err(Error::Recording { .. })
        ));
    }
}
