use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device, FourCC};

use crate::capture::{CaptureError, PixelFormat};

/// Highest `/dev/videoN` index probed by auto-detection
const MAX_PROBED_INDEX: u32 = 10;

// Detected capture device info
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoundDevice {
    pub path: String,
    pub card: String,
    pub format: PixelFormat,
}

/// Auto-detect best capture device
pub fn auto_detect_device() -> Result<FoundDevice, CaptureError> {
    info!("Auto-detecting capture devices...");

    for i in 0..MAX_PROBED_INDEX {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }
        if let Some(found) = probe(&path) {
            return Ok(found);
        }
    }

    Err(CaptureError::NoDevice)
}

/// Capture-capable node offering MJPEG (preferred) or YUYV
fn probe(path: &str) -> Option<FoundDevice> {
    let dev = Device::with_path(path)
        .map_err(|e| debug!("Cannot open {}: {}", path, e))
        .ok()?;
    let caps = dev.query_caps().ok()?;
    if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
        return None;
    }

    let formats = dev.enum_formats().ok()?;
    let format = if formats.iter().any(|f| f.fourcc == FourCC::new(b"MJPG")) {
        PixelFormat::Mjpeg
    } else if formats.iter().any(|f| f.fourcc == FourCC::new(b"YUYV")) {
        PixelFormat::Yuyv4
    } else {
        return None;
    };

    info!("Found {:?} device: {} - {}", format, path, caps.card);
    Some(FoundDevice {
        path: path.to_string(),
        card: caps.card,
        format,
    })
}
