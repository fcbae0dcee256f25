pub mod app;
pub mod capture;
pub mod error;
pub mod overlay;
pub mod pipeline;
pub mod stream;
#[cfg(feature = "gstreamer-pipeline")]
pub mod utils;

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use capture::source::QualityPreset;
pub use capture::Frame;
pub use error::{Error, Result};

/// Environment variable prefix for configuration overrides, e.g.
/// `CLIPCAM__SERVER__PORT=9000`.
pub const ENV_PREFIX: &str = "CLIPCAM";

/// System configuration, fixed at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub recording: RecordingConfig,
    pub preview: PreviewConfig,
    pub server: ServerConfig,
    pub overlay: OverlayConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// V4L2 camera through GStreamer
    Camera,
    /// Built-in moving test pattern
    Synthetic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub source: SourceKind,
    /// Device node; empty means auto-detect
    pub device: String,
    pub fps: u32,
    /// Replaces the `v4l2src` element, e.g. `libcamerasrc`
    pub custom_source: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub width: u32,
    pub height: u32,
    pub clip_seconds: u64,
    pub output_dir: PathBuf,
    pub quality: QualityPreset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    pub width: u32,
    pub height: u32,
    /// Delay between preview publishes
    pub interval_ms: u64,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    /// How long open viewer connections may drain after shutdown starts
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub text_color: [u8; 3],
    pub outline_color: [u8; 3],
    pub font_scale: f32,
    /// Fill stroke thickness in pixels
    pub thickness: u32,
    /// Extra outline thickness added around the fill stroke
    pub outline_thickness: u32,
    /// Distance from the bottom-right corner
    pub margin: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub level: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::Camera,
            device: String::new(),
            fps: 20,
            custom_source: None,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            clip_seconds: 60,
            output_dir: PathBuf::from("clips"),
            quality: QualityPreset::VeryHigh,
        }
    }
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            width: 960,
            height: 540,
            interval_ms: 1000,
            jpeg_quality: 100,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8000,
            shutdown_grace_ms: 2000,
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            text_color: [255, 255, 255],
            outline_color: [0, 0, 0],
            font_scale: 1.0,
            thickness: 2,
            outline_thickness: 5,
            margin: 20,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "clipcam=info".into(),
        }
    }
}

impl Config {
    /// Layer defaults, an optional TOML file and `CLIPCAM__*` environment
    /// variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server.bind, self.server.port)
    }

    /// Reject configurations that cannot run. Creates the output directory.
    pub fn validate(&self) -> Result<()> {
        let rec = &self.recording;
        let preview = &self.preview;

        check_resolution("recording", rec.width, rec.height)?;
        check_resolution("preview", preview.width, preview.height)?;
        if preview.width > rec.width || preview.height > rec.height {
            return Err(Error::config(format!(
                "preview {}x{} is larger than recording {}x{}",
                preview.width, preview.height, rec.width, rec.height
            )));
        }
        if preview.width > u16::MAX as u32 || preview.height > u16::MAX as u32 {
            return Err(Error::config("preview resolution exceeds JPEG limits"));
        }
        if self.capture.fps == 0 {
            return Err(Error::config("frame rate must be positive"));
        }
        if rec.clip_seconds == 0 {
            return Err(Error::config("clip length must be positive"));
        }
        if preview.interval_ms == 0 {
            return Err(Error::config("preview interval must be positive"));
        }
        if !(1..=100).contains(&preview.jpeg_quality) {
            return Err(Error::config("JPEG quality must be within 1..=100"));
        }
        if !(self.overlay.font_scale.is_finite() && self.overlay.font_scale > 0.0) {
            return Err(Error::config("overlay font scale must be positive"));
        }
        let (_, glyph_height) =
            overlay::OverlayStamper::new(self.overlay.clone()).text_size(1);
        if glyph_height > rec.height {
            return Err(Error::config(format!(
                "overlay font scale {} draws glyphs taller than the {}px frame",
                self.overlay.font_scale, rec.height
            )));
        }

        check_writable(&rec.output_dir)
    }
}

fn check_resolution(what: &str, width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(Error::config(format!("{what} resolution must be non-zero")));
    }
    if width % 2 != 0 || height % 2 != 0 {
        return Err(Error::config(format!(
            "{what} resolution {width}x{height} must be even"
        )));
    }
    Ok(())
}

fn check_writable(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| {
        Error::config(format!("cannot create output dir {}: {e}", dir.display()))
    })?;
    let probe = dir.join(".clipcam-write-test");
    fs::write(&probe, b"")
        .and_then(|_| fs::remove_file(&probe))
        .map_err(|e| Error::config(format!("output dir {} not writable: {e}", dir.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid(dir: &Path) -> Config {
        let mut config = Config::default();
        config.recording.output_dir = dir.to_path_buf();
        config
    }

    #[test]
    fn defaults_are_valid() {
        let dir = tempfile::tempdir().unwrap();
        valid(dir.path()).validate().unwrap();
        assert_eq!(Config::default().listen_addr().port(), 8000);
    }

    #[test]
    fn rejects_bad_geometry() {
        let dir = tempfile::tempdir().unwrap();

        let mut config = valid(dir.path());
        config.preview.width = 0;
        assert!(matches!(config.validate(), Err(Error::Config { .. })));

        let mut config = valid(dir.path());
        config.recording.width = 1921;
        assert!(config.validate().is_err());

        let mut config = valid(dir.path());
        config.preview.width = 3840;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_rates() {
        let dir = tempfile::tempdir().unwrap();

        let mut config = valid(dir.path());
        config.capture.fps = 0;
        assert!(config.validate().is_err());

        let mut config = valid(dir.path());
        config.recording.clip_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_font_scale_taller_than_the_frame() {
        let dir = tempfile::tempdir().unwrap();

        let mut config = valid(dir.path());
        config.overlay.font_scale = 1e8;
        assert!(matches!(config.validate(), Err(Error::Config { .. })));

        // 7 glyph rows of 4px dots at scale 1.0 need 28 rows
        let mut config = valid(dir.path());
        config.recording.height = 26;
        config.preview.height = 26;
        assert!(config.validate().is_err());
        config.recording.height = 28;
        config.validate().unwrap();
    }

    #[test]
    fn rejects_output_under_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        fs::write(&file, b"x").unwrap();
        let config = valid(&file.join("clips"));
        assert!(matches!(config.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn loads_toml_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clipcam.toml");
        fs::write(
            &path,
            "[recording]\nclip_seconds = 5\nquality = \"medium\"\n\n[server]\nport = 9000\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.recording.clip_seconds, 5);
        assert_eq!(config.recording.quality, QualityPreset::Medium);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.preview.width, 960);
        assert_eq!(config.overlay.outline_thickness, 5);
    }
}
