//! Frame source contract shared by real devices and the test pattern

use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::frame::{PixelFormat, RawFrame};

/// Which capture device to open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSelector {
    /// Device node, e.g. `/dev/video2`
    Path(String),
    /// Shorthand for `/dev/video{n}`
    Index(u32),
    /// First capture-capable node offering MJPEG or YUYV
    Auto,
    /// Candidates tried in order; the first one that opens wins
    List(Vec<DeviceSelector>),
}

impl std::fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceSelector::Path(path) => f.write_str(path),
            DeviceSelector::Index(index) => write!(f, "/dev/video{index}"),
            DeviceSelector::Auto => f.write_str("auto"),
            DeviceSelector::List(list) => {
                f.write_str("[")?;
                for (i, selector) in list.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{selector}")?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Capture failures. Every one of these ends the run.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture device {device} does not exist")]
    DeviceNotFound { device: String },

    #[error("permission denied opening {device}")]
    PermissionDenied {
        device: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to open capture device {device}")]
    Open {
        device: String,
        #[source]
        source: io::Error,
    },

    #[error("{device} cannot be used for capture: {reason}")]
    Unsupported { device: String, reason: String },

    #[error("read from {device} timed out after {timeout:?}")]
    Timeout { device: String, timeout: Duration },

    #[error("read from {device} failed")]
    Read {
        device: String,
        #[source]
        source: io::Error,
    },

    #[error("{device} produced {count} undecodable {format:?} buffers in a row: {reason}")]
    Decode {
        device: String,
        format: PixelFormat,
        count: u32,
        reason: String,
    },

    #[error("frame buffer holds {actual} bytes, expected {expected}")]
    BadBuffer { expected: usize, actual: usize },

    #[error("{0:?} is not a packed pixel layout")]
    UnpackedLayout(PixelFormat),

    #[error("no usable capture device found")]
    NoDevice,
}

impl CaptureError {
    /// Classify an error returned while opening a device node.
    pub fn from_open(device: &str, source: io::Error) -> Self {
        let device = device.to_string();
        match source.kind() {
            io::ErrorKind::NotFound => CaptureError::DeviceNotFound { device },
            io::ErrorKind::PermissionDenied => CaptureError::PermissionDenied { device, source },
            _ => CaptureError::Open { device, source },
        }
    }
}

/// A blocking, lazily-evaluated stream of frames.
///
/// Implementations hold the device exclusively until dropped; dropping the
/// source releases it on every exit path. A closed source cannot be reopened.
pub trait FrameSource {
    /// Block until the next frame is available. `Ok(None)` is end of stream.
    fn next_frame(&mut self) -> Result<Option<RawFrame>, CaptureError>;

    /// Native (width, height) of produced frames
    fn dimensions(&self) -> (u32, u32);

    fn name(&self) -> &str;

    fn close(self)
    where
        Self: Sized,
    {
    }
}
