pub mod reply;
pub mod udp;

use std::future::Future;
use std::io;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::encode::EncodedFrame;

pub use reply::{Detection, Prediction, PredictionSummary};
pub use udp::UdpTransmitter;

/// Socket-level send failures. Recorded, never fatal.
#[derive(Debug, Error)]
pub enum TransmissionError {
    #[error("could not resolve destination {destination}")]
    Resolve {
        destination: String,
        #[source]
        source: Option<io::Error>,
    },

    #[error("failed to bind UDP socket")]
    Bind(#[source] io::Error),

    #[error("send failed")]
    Io(#[from] io::Error),

    #[error("send did not complete within {0:?}")]
    Timeout(Duration),

    #[error("only {sent} of {len} bytes were sent")]
    Truncated { sent: usize, len: usize },
}

/// Outcome of handing one frame to the socket
#[derive(Debug)]
pub struct TransmissionRecord {
    pub sequence: u64,
    pub bytes: usize,
    pub raw_len: usize,
    pub quality: u8,
    pub captured_at: Instant,
    pub sent_at: Instant,
    pub error: Option<TransmissionError>,
}

impl TransmissionRecord {
    pub fn new(frame: &EncodedFrame, error: Option<TransmissionError>) -> Self {
        Self {
            sequence: frame.sequence,
            bytes: frame.len(),
            raw_len: frame.raw_len,
            quality: frame.quality,
            captured_at: frame.captured_at,
            sent_at: Instant::now(),
            error,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    /// Capture-to-socket latency
    pub fn latency(&self) -> Duration {
        self.sent_at.saturating_duration_since(self.captured_at)
    }
}

/// Sends one encoded frame as exactly one datagram.
///
/// No acknowledgement, retry or ordering; the record reports what the local
/// socket said and the caller moves on.
pub trait Transmit: Send + 'static {
    fn send(&mut self, frame: &EncodedFrame) -> impl Future<Output = TransmissionRecord> + Send;
}
