use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device, FourCC};

use crate::error::{Error, Result};

/// Raw formats the capture pipeline can negotiate without a decoder.
const RAW_FORMATS: [&[u8; 4]; 4] = [b"YUYV", b"NV12", b"YU12", b"RGB3"];

/// Auto-detect the first V4L2 device that can capture raw video
pub fn auto_detect_device() -> Result<String> {
    use std::path::Path;

    info!("Auto-detecting capture devices...");

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            debug!("Skipping {}: no capture capability", path);
            continue;
        }

        if let Ok(formats) = dev.enum_formats() {
            if let Some(fmt) = formats
                .iter()
                .find(|fmt| RAW_FORMATS.iter().any(|raw| fmt.fourcc == FourCC::new(raw)))
            {
                info!("Found {} device: {} - {}", fmt.fourcc, path, caps.card);
                return Ok(path);
            }
        }
    }

    Err(Error::config("No suitable capture device found"))
}
