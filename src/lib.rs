//! Low-latency camera streaming: capture, JPEG-compress under a datagram
//! ceiling, and fire each frame as a single UDP packet.

pub mod capture;
pub mod encode;
pub mod pipeline;
pub mod settings;
pub mod transport;
pub mod utils;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use capture::frame::PixelFormat;
use capture::source::DeviceSelector;
use encode::QualityFallback;

pub use capture::{CaptureError, FrameSource, RawFrame, SyntheticSource, V4l2Source};
pub use encode::{EncodeError, EncodedFrame, FrameEncoder};
pub use pipeline::{Controller, MetricsCollector, MetricsSnapshot, PipelineError, PipelineState};
pub use transport::{
    PredictionSummary, Transmit, TransmissionError, TransmissionRecord, UdpTransmitter,
};

/// Largest payload a single IPv4 UDP datagram can carry.
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// Everything read from the environment at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub device: DeviceSelector,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    pub read_timeout_ms: u64,
}

impl CaptureConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: DeviceSelector::Path("/dev/video0".into()),
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Mjpeg,
            buffer_count: 4,
            read_timeout_ms: 2_000,
        }
    }
}

/// Per-run pipeline parameters. Immutable once handed to a [`Controller`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub host: String,
    pub port: u16,
    /// Target resolution frames are resized to before compression
    pub width: u32,
    pub height: u32,
    /// JPEG quality factor, 0-100. The codec treats 0 as 1.
    pub quality: u8,
    /// Fragmentation-avoidance ceiling for one encoded frame
    pub max_payload_bytes: usize,
    pub fallback: QualityFallback,
    pub send_timeout_ms: u64,
    /// Sliding metrics window, bounded both in frames and in time
    pub window_frames: usize,
    pub window_ms: u64,
    /// Zero disables the periodic metrics log line
    pub report_interval_ms: u64,
    /// Read inference replies on the sending socket
    pub listen_for_replies: bool,
    /// How long a stop waits on each stage before cancelling it. Must cover
    /// the capture read timeout.
    pub shutdown_grace_ms: u64,
}

impl PipelineConfig {
    pub fn destination(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5000,
            width: 320,
            height: 240,
            quality: 40,
            max_payload_bytes: 4_500,
            fallback: QualityFallback::default(),
            send_timeout_ms: 50,
            window_frames: 120,
            window_ms: 2_000,
            report_interval_ms: 5_000,
            listen_for_replies: true,
            shutdown_grace_ms: 2_500,
        }
    }
}
