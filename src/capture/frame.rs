use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use super::source::CaptureError;

/// A decoded frame straight off the source.
///
/// The pixel buffer is a cheap-to-clone [`Bytes`]; nothing downstream mutates
/// it, and the encoder drops the frame once it has produced a payload.
#[derive(Clone)]
pub struct RawFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub layout: PixelFormat,

    /// Monotonic per-source counter, starting at 1
    pub sequence: u64,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

impl RawFrame {
    /// Wrap a packed pixel buffer, checking it matches the declared geometry.
    pub fn new(
        data: Bytes,
        width: u32,
        height: u32,
        layout: PixelFormat,
        sequence: u64,
        timestamp: Instant,
    ) -> Result<Self, CaptureError> {
        let expected = layout
            .packed_len(width, height)
            .ok_or(CaptureError::UnpackedLayout(layout))?;
        if data.len() != expected {
            return Err(CaptureError::BadBuffer {
                expected,
                actual: data.len(),
            });
        }

        Ok(Self {
            data,
            width,
            height,
            layout,
            sequence,
            timestamp,
        })
    }

    pub fn raw_len(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawFrame")
            .field("sequence", &self.sequence)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("layout", &self.layout)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
}

impl PixelFormat {
    /// Bytes per pixel for packed layouts; `None` for compressed ones.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
            PixelFormat::Yuyv4 => Some(2),
            PixelFormat::Mjpeg => None,
        }
    }

    pub fn packed_len(self, width: u32, height: u32) -> Option<usize> {
        self.bytes_per_pixel()
            .map(|bpp| width as usize * height as usize * bpp)
    }
}
