//! V4L2 capture with memory-mapped streaming buffers

use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::decoder;
use crate::capture::frame::{PixelFormat, RawFrame};
use crate::capture::source::{CaptureError, DeviceSelector, FrameSource};
use crate::utils;
use crate::CaptureConfig;

/// Corrupt MJPEG buffers are skipped; this many in a row ends the run.
const MAX_CONSECUTIVE_DECODE_FAILURES: u32 = 30;

/// Camera frame source backed by a V4L2 device node
pub struct V4l2Source {
    stream: MmapStream<'static>,
    _device: Box<Device>,
    path: String,
    format: PixelFormat,
    width: u32,
    height: u32,
    timeout: Duration,
    sequence: u64,
}

impl V4l2Source {
    /// Open the selected device and start streaming.
    #[instrument(skip(config), fields(device = %selector))]
    pub fn open(selector: &DeviceSelector, config: &CaptureConfig) -> Result<Self, CaptureError> {
        match selector {
            DeviceSelector::Path(path) => Self::open_path(path, config.format, config),
            DeviceSelector::Index(index) => {
                Self::open_path(&format!("/dev/video{index}"), config.format, config)
            }
            DeviceSelector::Auto => {
                let found = utils::auto_detect_device()?;
                Self::open_path(&found.path, found.format, config)
            }
            DeviceSelector::List(candidates) => {
                let mut last_err = None;
                for candidate in candidates {
                    match Self::open(candidate, config) {
                        Ok(source) => return Ok(source),
                        Err(e) => {
                            warn!("Skipping {}: {}", candidate, e);
                            last_err = Some(e);
                        }
                    }
                }
                Err(last_err.unwrap_or(CaptureError::NoDevice))
            }
        }
    }

    fn open_path(
        path: &str,
        format: PixelFormat,
        config: &CaptureConfig,
    ) -> Result<Self, CaptureError> {
        if !Path::new(path).exists() {
            return Err(CaptureError::DeviceNotFound {
                device: path.to_string(),
            });
        }
        if Path::new(path).is_file() {
            return Err(CaptureError::Unsupported {
                device: path.to_string(),
                reason: "regular file; only V4L2 device nodes can be captured".into(),
            });
        }

        info!("Initializing V4L2 capture: {}", path);
        let device = Device::with_path(path).map_err(|e| CaptureError::from_open(path, e))?;
        let open_err = |source: io::Error| CaptureError::Open {
            device: path.to_string(),
            source,
        };

        let caps = device.query_caps().map_err(open_err)?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CaptureError::Unsupported {
                device: path.to_string(),
                reason: "no video capture capability".into(),
            });
        }

        let mut fmt = device.format().map_err(open_err)?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = match format {
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
            other => {
                return Err(CaptureError::Unsupported {
                    device: path.to_string(),
                    reason: format!("{other:?} capture is not supported"),
                })
            }
        };

        // The driver may adjust size or format; trust what it reports back
        let fmt = device.set_format(&fmt).map_err(open_err)?;
        let negotiated = if fmt.fourcc == FourCC::new(b"MJPG") {
            PixelFormat::Mjpeg
        } else if fmt.fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv4
        } else {
            return Err(CaptureError::Unsupported {
                device: path.to_string(),
                reason: format!("driver negotiated unsupported format {}", fmt.fourcc),
            });
        };

        let mut stream = MmapStream::with_buffers(&device, Type::VideoCapture, config.buffer_count)
            .map_err(open_err)?;
        stream.set_timeout(config.read_timeout());

        info!(
            "Capture stream started: {}x{} {:?} with {} buffers",
            fmt.width, fmt.height, negotiated, config.buffer_count
        );

        Ok(Self {
            stream,
            _device: Box::new(device),
            path: path.to_string(),
            format: negotiated,
            width: fmt.width,
            height: fmt.height,
            timeout: config.read_timeout(),
            sequence: 0,
        })
    }
}

impl FrameSource for V4l2Source {
    #[instrument(skip(self), fields(device = %self.path))]
    fn next_frame(&mut self) -> Result<Option<RawFrame>, CaptureError> {
        let mut failures = 0;
        loop {
            let timestamp = Instant::now();
            let (buf, meta) = match self.stream.next() {
                Ok(next) => next,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    return Err(CaptureError::Timeout {
                        device: self.path.clone(),
                        timeout: self.timeout,
                    })
                }
                Err(source) => {
                    return Err(CaptureError::Read {
                        device: self.path.clone(),
                        source,
                    })
                }
            };

            let used = (meta.bytesused as usize).min(buf.len());
            match decoder::decode_frame(&buf[..used], self.format, self.width, self.height) {
                Ok(decoded) => {
                    self.sequence += 1;
                    let frame = RawFrame::new(
                        Bytes::from(decoded.rgb),
                        decoded.width,
                        decoded.height,
                        PixelFormat::Rgb24,
                        self.sequence,
                        timestamp,
                    )?;
                    return Ok(Some(frame));
                }
                Err(e) => {
                    failures += 1;
                    if failures >= MAX_CONSECUTIVE_DECODE_FAILURES {
                        return Err(CaptureError::Decode {
                            device: self.path.clone(),
                            format: self.format,
                            count: failures,
                            reason: e.to_string(),
                        });
                    }
                    debug!("Skipping undecodable buffer ({} bytes): {}", used, e);
                }
            }
        }
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn name(&self) -> &str {
        &self.path
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        info!("Releasing capture device {}", self.path);
    }
}
