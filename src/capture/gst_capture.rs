//! GStreamer camera source with hardware H.264 recording
//!
//! One capture pipeline feeds both channels through a tee:
//!
//! ```text
//! v4l2src ! tee ─┬─ queue ! videoconvert ! RGB            ! appsink "full"
//!                └─ queue(leaky) ! videoscale ! videoconvert ! I420 ! appsink "low"
//! ```
//!
//! Each recording segment gets its own `appsrc ! encoder ! mp4mux ! filesink`
//! pipeline. Frames that arrive while a segment finalizes wait in the full-res
//! appsink and open the next segment.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Instant;

use chrono::Local;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use crate::capture::frame::{Frame, FrameMetadata, FrameMut, PixelFormat};
use crate::capture::source::{
    FrameChannel, FrameSource, PreFrameHook, RecordingChannel, SegmentReport, SegmentRequest,
};
use crate::error::{Error, Result};
use crate::Config;

/// Pull timeout so the segment loop notices stop requests and deadlines.
const PULL_TIMEOUT_MS: u64 = 100;

/// How long the muxer gets to finish a segment after EOS.
const EOS_TIMEOUT_SECS: u64 = 10;

/// GStreamer-backed camera
pub struct GstSource {
    pipeline: gst::Pipeline,
    full: gst_app::AppSink,
    low: gst_app::AppSink,
    full_res: (u32, u32),
    low_res: (u32, u32),
    fps: u32,
    hook: Arc<RwLock<Option<PreFrameHook>>>,
    full_taken: AtomicBool,
}

impl GstSource {
    /// Build and start the capture pipeline.
    pub fn new(config: &Config, device: &str) -> Result<Self> {
        init_gstreamer()?;

        let pipeline_str = Self::build_pipeline_string(config, device);
        info!("Pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| Error::capture(format!("Failed to build pipeline: {e}")))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| Error::capture("Launch string did not produce a pipeline"))?;

        let full = appsink(&pipeline, "full")?;
        let low = appsink(&pipeline, "low")?;

        // Enough headroom to cover a segment finalize without dropping frames.
        full.set_property("max-buffers", config.capture.fps.saturating_mul(3).max(8));
        full.set_property("drop", true);
        full.set_property("sync", false);

        // Preview only ever wants the newest frame.
        low.set_property("max-buffers", 1u32);
        low.set_property("drop", true);
        low.set_property("sync", false);

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| Error::capture(format!("Failed to start pipeline: {e:?}")))?;

        match pipeline.state(gst::ClockTime::from_seconds(5)) {
            (Ok(_), gst::State::Playing, _) => info!("Capture pipeline playing"),
            (Ok(_), state, _) => warn!(?state, "Pipeline did not reach Playing within timeout"),
            (Err(e), _, _) => {
                return Err(Error::capture(format!(
                    "Pipeline failed to reach Playing state: {e:?}"
                )))
            }
        }

        Ok(Self {
            pipeline,
            full,
            low,
            full_res: (config.recording.width, config.recording.height),
            low_res: (config.preview.width, config.preview.height),
            fps: config.capture.fps,
            hook: Arc::new(RwLock::new(None)),
            full_taken: AtomicBool::new(false),
        })
    }

    fn build_pipeline_string(config: &Config, device: &str) -> String {
        let rec = &config.recording;
        let preview = &config.preview;
        let fps = config.capture.fps;

        let source = match &config.capture.custom_source {
            Some(custom) => custom.clone(),
            None => format!("v4l2src device=\"{device}\""),
        };

        format!(
            "{source} ! \
             video/x-raw,width={},height={},framerate={fps}/1 ! \
             tee name=t \
             t. ! queue ! videoconvert ! video/x-raw,format=RGB ! appsink name=full \
             t. ! queue leaky=downstream max-size-buffers=1 ! videoscale ! videoconvert ! \
             video/x-raw,format=I420,width={},height={} ! appsink name=low",
            rec.width, rec.height, preview.width, preview.height,
        )
    }
}

impl FrameSource for GstSource {
    fn open_low_res(&self) -> Result<Arc<dyn FrameChannel>> {
        Ok(Arc::new(GstPreview {
            appsink: self.low.clone(),
            resolution: self.low_res,
            sequence: AtomicU64::new(0),
        }))
    }

    fn open_full_res(&self) -> Result<Box<dyn RecordingChannel>> {
        if self.full_taken.swap(true, Ordering::SeqCst) {
            return Err(Error::capture("full-resolution channel already open"));
        }
        Ok(Box::new(GstRecorder {
            appsink: self.full.clone(),
            hook: self.hook.clone(),
            resolution: self.full_res,
            fps: self.fps,
            encoder: detect_h264_encoder(),
            sequence: 0,
        }))
    }

    fn register_pre_frame_hook(&self, hook: PreFrameHook) {
        if let Ok(mut slot) = self.hook.write() {
            *slot = Some(hook);
        }
    }

    fn stop(&self) {
        info!("Stopping capture pipeline");
        if !self.pipeline.send_event(gst::event::Eos::new()) {
            warn!("Failed to send EOS to capture pipeline");
        }
    }
}

impl Drop for GstSource {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

struct GstPreview {
    appsink: gst_app::AppSink,
    resolution: (u32, u32),
    sequence: AtomicU64,
}

impl FrameChannel for GstPreview {
    fn capture_next(&self) -> Result<Frame> {
        let sample = self.appsink.pull_sample().map_err(|_| {
            if self.appsink.is_eos() {
                Error::SourceClosed
            } else {
                Error::capture("Failed to pull preview sample")
            }
        })?;
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let (data, info) = tight_copy(&sample, PixelFormat::I420)?;
        Ok(Frame::new(
            data,
            FrameMetadata {
                sequence,
                width: info.width(),
                height: info.height(),
                stride: info.width(),
                format: PixelFormat::I420,
                captured_at: Local::now(),
            },
        ))
    }

    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }
}

struct GstRecorder {
    appsink: gst_app::AppSink,
    hook: Arc<RwLock<Option<PreFrameHook>>>,
    resolution: (u32, u32),
    fps: u32,
    encoder: &'static str,
    sequence: u64,
}

impl GstRecorder {
    fn encoder_launch(&self, bitrate_kbps: u32) -> String {
        match self.encoder {
            "v4l2h264enc" => format!(
                "v4l2h264enc extra-controls=\"controls,video_bitrate={}\" ! video/x-h264,level=(string)4",
                bitrate_kbps * 1000
            ),
            "vaapih264enc" => format!("vaapih264enc bitrate={bitrate_kbps}"),
            "nvh264enc" => format!("nvh264enc bitrate={bitrate_kbps}"),
            _ => format!(
                "x264enc bitrate={bitrate_kbps} speed-preset=veryfast tune=zerolatency key-int-max={}",
                self.fps * 2
            ),
        }
    }

    fn open_segment(&self, path: &Path, bitrate_kbps: u32) -> Result<SegmentPipeline> {
        let (width, height) = self.resolution;
        let launch = format!(
            "appsrc name=src is-live=true format=time \
             caps=video/x-raw,format=RGB,width={width},height={height},framerate={}/1 ! \
             videoconvert ! {} ! h264parse ! mp4mux ! filesink location=\"{}\"",
            self.fps,
            self.encoder_launch(bitrate_kbps),
            escape_path(path),
        );
        debug!("Segment pipeline: {}", launch);

        let segment = SegmentPipeline::launch(path, &launch)?;
        segment
            .pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| Error::recording(path, format!("Failed to start encoder: {e:?}")))?;
        Ok(segment)
    }
}

/// One segment's encoder pipeline. Dropping it stops the pipeline, so every
/// exit from a segment releases the encoder threads and the output file.
struct SegmentPipeline {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    bus: gst::Bus,
}

impl SegmentPipeline {
    fn launch(path: &Path, launch: &str) -> Result<Self> {
        let pipeline = gst::parse::launch(launch)
            .map_err(|e| Error::recording(path, format!("Failed to build encoder: {e}")))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| Error::recording(path, "Encoder launch did not produce a pipeline"))?;
        let appsrc = pipeline
            .by_name("src")
            .ok_or_else(|| Error::recording(path, "Missing appsrc"))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| Error::recording(path, "Element is not an AppSrc"))?;
        let bus = pipeline
            .bus()
            .ok_or_else(|| Error::recording(path, "Encoder pipeline has no bus"))?;
        Ok(Self {
            pipeline,
            appsrc,
            bus,
        })
    }

    /// Send EOS and wait for the muxer to write its index.
    fn finalize(&self, path: &Path, timeout: gst::ClockTime) -> Result<()> {
        self.appsrc
            .end_of_stream()
            .map_err(|e| Error::recording(path, format!("Failed to end segment: {e:?}")))?;
        match self
            .bus
            .timed_pop_filtered(timeout, &[gst::MessageType::Eos, gst::MessageType::Error])
        {
            Some(msg) if msg.type_() == gst::MessageType::Error => {
                Err(Error::recording(path, describe(&msg)))
            }
            Some(_) => Ok(()),
            None => Err(Error::recording(path, "segment did not finalize")),
        }
    }
}

impl Drop for SegmentPipeline {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

impl RecordingChannel for GstRecorder {
    fn record_segment(&mut self, request: &SegmentRequest) -> Result<SegmentReport> {
        let path = &request.path;
        let (width, height) = self.resolution;
        let bitrate = request.quality.bitrate_kbps(width, height, self.fps);
        let segment = self.open_segment(path, bitrate)?;
        let hook = self.hook.read().ok().and_then(|h| h.clone());

        let deadline = Instant::now() + request.duration;
        let mut report = SegmentReport::default();
        let mut first_pts: Option<gst::ClockTime> = None;
        let mut capture_ended = false;

        while Instant::now() < deadline && !request.stop.is_cancelled() {
            if let Some(msg) = segment.bus.pop_filtered(&[gst::MessageType::Error]) {
                return Err(Error::recording(path, describe(&msg)));
            }

            let Some(sample) = self
                .appsink
                .try_pull_sample(gst::ClockTime::from_mseconds(PULL_TIMEOUT_MS))
            else {
                if self.appsink.is_eos() {
                    capture_ended = true;
                    break;
                }
                continue;
            };

            let (mut rgb, _) = tight_copy(&sample, PixelFormat::Rgb24)?;
            if let Some(hook) = &hook {
                hook(&mut FrameMut::packed(&mut rgb, width, height, PixelFormat::Rgb24));
            }

            let pts = sample
                .buffer()
                .and_then(|b| b.pts())
                .unwrap_or(gst::ClockTime::ZERO);
            let base = *first_pts.get_or_insert(pts);
            let bytes = rgb.len() as u64;

            let mut buffer = gst::Buffer::from_mut_slice(rgb);
            if let Some(buffer) = buffer.get_mut() {
                buffer.set_pts(gst::ClockTime::from_nseconds(
                    pts.nseconds().saturating_sub(base.nseconds()),
                ));
            }
            segment
                .appsrc
                .push_buffer(buffer)
                .map_err(|e| Error::recording(path, format!("Encoder rejected frame: {e:?}")))?;

            report.bytes_written += bytes;
            report.record_frame(self.sequence, Local::now());
            self.sequence += 1;
        }

        segment.finalize(path, gst::ClockTime::from_seconds(EOS_TIMEOUT_SECS))?;
        drop(segment);

        if capture_ended && !request.stop.is_cancelled() {
            return Err(Error::recording(path, "Camera stream ended"));
        }
        Ok(report)
    }

    fn container_extension(&self) -> &'static str {
        "mp4"
    }
}

fn appsink(pipeline: &gst::Pipeline, name: &str) -> Result<gst_app::AppSink> {
    pipeline
        .by_name(name)
        .ok_or_else(|| Error::capture(format!("Failed to find appsink {name}")))?
        .downcast::<gst_app::AppSink>()
        .map_err(|_| Error::capture(format!("{name} is not an AppSink")))
}

/// Copy a sample into a tightly packed buffer, dropping any row padding.
fn tight_copy(sample: &gst::Sample, format: PixelFormat) -> Result<(Vec<u8>, gst_video::VideoInfo)> {
    let buffer = sample
        .buffer()
        .ok_or_else(|| Error::capture("Sample contains no buffer"))?;
    let caps = sample
        .caps()
        .ok_or_else(|| Error::capture("Sample has no caps"))?;
    let info = gst_video::VideoInfo::from_caps(caps)
        .map_err(|_| Error::capture("Failed to parse video info from caps"))?;
    let frame = gst_video::VideoFrameRef::from_buffer_ref_readable(buffer, &info)
        .map_err(|_| Error::capture("Failed to map video frame"))?;

    let (width, height) = (info.width() as usize, info.height() as usize);
    let planes: &[(usize, usize)] = match format {
        PixelFormat::I420 => &[(1, 1), (2, 2), (2, 2)],
        _ => &[(1, 1)],
    };

    let mut out = Vec::with_capacity(format.frame_len(info.width(), info.height()));
    for (plane, &(xdiv, ydiv)) in planes.iter().enumerate() {
        let data = frame
            .plane_data(plane as u32)
            .map_err(|_| Error::capture("Missing video plane"))?;
        let stride = frame.plane_stride()[plane] as usize;
        let row_bytes = format.stride(width.div_ceil(xdiv) as u32) as usize;
        for row in 0..height.div_ceil(ydiv) {
            let start = row * stride;
            let line = data
                .get(start..start + row_bytes)
                .ok_or_else(|| Error::capture("Video plane shorter than expected"))?;
            out.extend_from_slice(line);
        }
    }
    Ok((out, info))
}

fn describe(msg: &gst::Message) -> String {
    match msg.view() {
        gst::MessageView::Error(err) => format!(
            "{} ({})",
            err.error(),
            err.debug().map(|d| d.to_string()).unwrap_or_default()
        ),
        _ => format!("{:?}", msg.type_()),
    }
}

fn escape_path(path: &Path) -> String {
    path.display().to_string().replace('"', "\\\"")
}

/// Detect best available H.264 encoder (hardware > software)
fn detect_h264_encoder() -> &'static str {
    let encoders = [
        "v4l2h264enc",  // Raspberry Pi / V4L2 M2M hardware encoder
        "vaapih264enc", // Intel/AMD VAAPI hardware encoder
        "nvh264enc",    // NVIDIA hardware encoder
        "x264enc",      // Software encoder (fallback)
    ];

    for encoder in encoders {
        if let Some(factory) = gst::ElementFactory::find(encoder) {
            debug!("Found encoder: {} - {}", encoder, factory.metadata("long-name").unwrap_or(""));
            info!("Using H.264 encoder: {}", encoder);
            return encoder;
        }
    }

    warn!("No H.264 encoder found, falling back to x264enc");
    "x264enc"
}

fn init_gstreamer() -> Result<()> {
    static GST_INIT: OnceLock<std::result::Result<(), String>> = OnceLock::new();
    GST_INIT
        .get_or_init(|| gst::init().map_err(|e| e.to_string()))
        .clone()
        .map_err(|e| Error::capture(format!("Failed to initialize GStreamer: {e}")))
}


#[cfg(test)]
mod tests {
    use super::*;

    const CLIP: &str = "segment.mp4";

    fn segment() -> SegmentPipeline {
        init_gstreamer().unwrap();
        SegmentPipeline::launch(Path::new(CLIP), "appsrc name=src format=time ! fakesink").unwrap()
    }

    #[test]
    fn dropped_segment_stops_its_pipeline() {
        let segment = segment();
        segment.pipeline.set_state(gst::State::Playing).unwrap();
        let pipeline = segment.pipeline.clone();
        drop(segment);
        assert_eq!(pipeline.current_state(), gst::State::Null);
    }

    #[test]
    fn finalize_waits_for_eos() {
        let segment = segment();
        segment.pipeline.set_state(gst::State::Playing).unwrap();
        segment
            .finalize(Path::new(CLIP), gst::ClockTime::from_seconds(5))
            .unwrap();
    }

    #[test]
    fn missing_eos_is_a_recording_error() {
        // A paused sink prerolls on EOS but never posts it.
        let segment = segment();
        let _ = segment.pipeline.set_state(gst::State::Paused);
        let err = segment
            .finalize(Path::new(CLIP), gst::ClockTime::from_mseconds(300))
            .unwrap_err();
        assert!(
            matches!(&err, Error::Recording { message, .. } if message.contains("did not finalize")),
            "{err}"
        );
    }

    #[test]
    fn launch_errors_name_the_segment() {
        init_gstreamer().unwrap();
        let err = SegmentPipeline::launch(Path::new(CLIP), "fakesrc ! fakesink").err().unwrap();
        assert!(matches!(err, Error::Recording { ref path, .. } if path == Path::new(CLIP)));
    }
}
