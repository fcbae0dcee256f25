//! clipcam: continuous clip recording with a live MJPEG preview

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use clipcam::app::App;
use clipcam::capture::{FrameSource, SyntheticSource};
use clipcam::{Config, SourceKind};
use color_eyre::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "clipcam", version, about = "Record fixed-length clips and stream a live preview")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use the built-in test pattern instead of a camera
    #[arg(long)]
    synthetic: bool,

    /// HTTP port for the preview
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory clips are written to
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if cli.synthetic {
        config.capture.source = SourceKind::Synthetic;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(output) = cli.output {
        config.recording.output_dir = output;
    }

    if cli.print_config {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("clipcam launching...");

    // Configuration errors are fatal before any capture starts.
    config.validate()?;
    let source = open_source(&config)?;

    let app = App::new(config, source).await?;
    info!("Preview at http://{}/index.html", app.local_addr()?);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping");
                cancel.cancel();
            }
        });
    }

    app.run(cancel).await?;

    info!("clipcam shutting down");
    Ok(())
}

fn open_source(config: &Config) -> Result<Arc<dyn FrameSource>> {
    match config.capture.source {
        SourceKind::Synthetic => Ok(Arc::new(SyntheticSource::new(
            (config.recording.width, config.recording.height),
            (config.preview.width, config.preview.height),
            config.capture.fps,
        ))),
        SourceKind::Camera => open_camera(config),
    }
}

#[cfg(feature = "gstreamer-pipeline")]
fn open_camera(config: &Config) -> Result<Arc<dyn FrameSource>> {
    let device = if config.capture.device.is_empty() && config.capture.custom_source.is_none() {
        clipcam::utils::auto_detect_device()?
    } else {
        config.capture.device.clone()
    };
    info!("Using capture device: {:?}", device);
    Ok(Arc::new(clipcam::capture::GstSource::new(config, &device)?))
}

#[cfg(not(feature = "gstreamer-pipeline"))]
fn open_camera(_config: &Config) -> Result<Arc<dyn FrameSource>> {
    Err(color_eyre::eyre::eyre!(
        "camera capture needs the `gstreamer-pipeline` feature; rebuild with it or pass --synthetic"
    ))
}
