//! Shared fixtures: a scripted frame source and a raw MJPEG HTTP client.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Local;
use clipcam::capture::frame::{Frame, FrameMetadata, FrameMut, PixelFormat};
use clipcam::capture::source::{
    FrameChannel, FrameSource, PreFrameHook, RecordingChannel, SegmentReport, SegmentRequest,
};
use clipcam::capture::synthetic::{pattern_rgb, rgb_to_i420};
use clipcam::{Config, Error, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Small, fast configuration writing into `dir` and listening on an
/// ephemeral loopback port.
pub fn test_config(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.capture.fps = 10;
    config.recording.width = 320;
    config.recording.height = 240;
    config.recording.clip_seconds = 2;
    config.recording.output_dir = dir.to_path_buf();
    config.preview.width = 160;
    config.preview.height = 120;
    config.preview.interval_ms = 200;
    config.server.bind = "127.0.0.1".parse().unwrap();
    config.server.port = 0;
    config.overlay.font_scale = 0.5;
    config
}

pub fn i420_frame(width: u32, height: u32, sequence: u64) -> Frame {
    let rgb = pattern_rgb(width, height, sequence);
    Frame::new(
        rgb_to_i420(&rgb, width, height),
        FrameMetadata {
            sequence,
            width,
            height,
            stride: width,
            format: PixelFormat::I420,
            captured_at: Local::now(),
        },
    )
}

/// Frame source driven by the test.
///
/// Preview frames are fed through a channel; the recording channel writes a
/// small file per segment, sleeps for the requested duration (or until
/// stopped) and can be told to fail on a given segment.
pub struct ScriptedSource {
    preview_rx: flume::Receiver<Result<Frame>>,
    pub fail_segment: Option<usize>,
    pub fps: u32,
    full_taken: AtomicBool,
    pub hook: Mutex<Option<PreFrameHook>>,
    pub segments: Arc<Mutex<Vec<PathBuf>>>,
    pub stopped: Arc<AtomicBool>,
}

impl ScriptedSource {
    pub fn new() -> (Self, flume::Sender<Result<Frame>>) {
        let (tx, rx) = flume::unbounded();
        (
            Self {
                preview_rx: rx,
                fail_segment: None,
                fps: 10,
                full_taken: AtomicBool::new(false),
                hook: Mutex::new(None),
                segments: Arc::new(Mutex::new(Vec::new())),
                stopped: Arc::new(AtomicBool::new(false)),
            },
            tx,
        )
    }
}

impl FrameSource for ScriptedSource {
    fn open_low_res(&self) -> Result<Arc<dyn FrameChannel>> {
        Ok(Arc::new(ScriptedPreview {
            rx: self.preview_rx.clone(),
        }))
    }

    fn open_full_res(&self) -> Result<Box<dyn RecordingChannel>> {
        if self.full_taken.swap(true, Ordering::SeqCst) {
            return Err(Error::capture("already open"));
        }
        Ok(Box::new(ScriptedRecorder {
            fail_segment: self.fail_segment,
            fps: self.fps,
            hook: self.hook.lock().unwrap().clone(),
            segments: self.segments.clone(),
            count: AtomicUsize::new(0),
            next_sequence: 0,
        }))
    }

    fn register_pre_frame_hook(&self, hook: PreFrameHook) {
        *self.hook.lock().unwrap() = Some(hook);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

pub struct ScriptedPreview {
    rx: flume::Receiver<Result<Frame>>,
}

impl FrameChannel for ScriptedPreview {
    fn capture_next(&self) -> Result<Frame> {
        self.rx.recv().map_err(|_| Error::SourceClosed)?
    }

    fn resolution(&self) -> (u32, u32) {
        (160, 120)
    }
}

pub struct ScriptedRecorder {
    fail_segment: Option<usize>,
    fps: u32,
    hook: Option<PreFrameHook>,
    segments: Arc<Mutex<Vec<PathBuf>>>,
    count: AtomicUsize,
    next_sequence: u64,
}

impl RecordingChannel for ScriptedRecorder {
    fn record_segment(&mut self, request: &SegmentRequest) -> Result<SegmentReport> {
        let index = self.count.fetch_add(1, Ordering::SeqCst);
        if self.fail_segment == Some(index) {
            return Err(Error::recording(&request.path, "muxer refused to open"));
        }

        let mut pixels = vec![0u8; PixelFormat::Rgb24.frame_len(64, 32)];
        if let Some(hook) = &self.hook {
            hook(&mut FrameMut::packed(&mut pixels, 64, 32, PixelFormat::Rgb24));
        }
        std::fs::write(&request.path, &pixels)?;
        self.segments.lock().unwrap().push(request.path.clone());

        let step = Duration::from_millis(10);
        let mut waited = Duration::ZERO;
        while waited < request.duration && !request.stop.is_cancelled() {
            std::thread::sleep(step);
            waited += step;
        }

        let mut report = SegmentReport {
            bytes_written: pixels.len() as u64,
            ..Default::default()
        };
        let frames = (waited.as_secs_f64() * self.fps as f64).round() as u64;
        for seq in self.next_sequence..self.next_sequence + frames {
            report.record_frame(seq, Local::now());
        }
        self.next_sequence += frames;
        Ok(report)
    }

    fn container_extension(&self) -> &'static str {
        "bin"
    }
}

/// One multipart part as received on the wire.
#[derive(Debug)]
pub struct Part {
    pub content_type: String,
    pub content_length: usize,
    pub data: Vec<u8>,
}

/// Minimal HTTP/1.1 client that understands chunked transfer encoding and
/// the multipart MJPEG framing.
pub struct MjpegClient {
    reader: BufReader<TcpStream>,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    chunked: bool,
    remaining: usize,
}

impl MjpegClient {
    pub async fn connect(addr: SocketAddr, path: &str) -> std::io::Result<Self> {
        let mut stream = TcpStream::connect(addr).await?;
        stream
            .write_all(format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n").as_bytes())
            .await?;
        let mut reader = BufReader::new(stream);

        let mut status_line = String::new();
        reader.read_line(&mut status_line).await?;
        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        let mut headers = Vec::new();
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await?;
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
            }
        }

        let chunked = headers
            .iter()
            .any(|(n, v)| n == "transfer-encoding" && v.eq_ignore_ascii_case("chunked"));
        Ok(Self {
            reader,
            status,
            headers,
            chunked,
            remaining: 0,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Read the next multipart part; `None` when the stream ends cleanly.
    pub async fn next_part(&mut self) -> std::io::Result<Option<Part>> {
        let Some(boundary) = self.body_line().await? else {
            return Ok(None);
        };
        assert_eq!(boundary, "--FRAME");

        let mut content_type = String::new();
        let mut content_length = None;
        loop {
            let line = self.body_line().await?.expect("truncated part headers");
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':').expect("malformed part header");
            match name.trim() {
                "Content-Type" => content_type = value.trim().to_string(),
                "Content-Length" => content_length = value.trim().parse().ok(),
                other => panic!("unexpected part header {other}"),
            }
        }

        let content_length = content_length.expect("part without Content-Length");
        let mut data = Vec::with_capacity(content_length);
        for _ in 0..content_length {
            data.push(self.body_byte().await?.expect("truncated part body"));
        }
        assert_eq!(self.body_line().await?.as_deref(), Some(""), "part must end with CRLF");

        Ok(Some(Part {
            content_type,
            content_length,
            data,
        }))
    }

    /// Read the whole remaining body.
    pub async fn body(&mut self) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(b) = self.body_byte().await? {
            out.push(b);
        }
        Ok(out)
    }

    async fn body_line(&mut self) -> std::io::Result<Option<String>> {
        let mut line = Vec::new();
        loop {
            match self.body_byte().await? {
                None if line.is_empty() => return Ok(None),
                None => break,
                Some(b'\n') => break,
                Some(b) => line.push(b),
            }
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }

    async fn body_byte(&mut self) -> std::io::Result<Option<u8>> {
        if self.chunked && self.remaining == 0 && !self.next_chunk().await? {
            return Ok(None);
        }
        let mut byte = [0u8; 1];
        if self.reader.read(&mut byte).await? == 0 {
            return Ok(None);
        }
        if self.chunked {
            self.remaining -= 1;
        }
        Ok(Some(byte[0]))
    }

    async fn next_chunk(&mut self) -> std::io::Result<bool> {
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).await? == 0 {
                return Ok(false);
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let size = line.split(';').next().unwrap_or("0");
            let size = usize::from_str_radix(size, 16).unwrap_or(0);
            if size == 0 {
                return Ok(false);
            }
            self.remaining = size;
            return Ok(true);
        }
    }
}

/// Poll `cond` every 10ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
