pub mod jpeg;

use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capture::frame::PixelFormat;

pub use jpeg::{encode, FrameEncoder};

/// A compressed frame ready for the wire.
///
/// `payload.len()` never exceeds the configured datagram ceiling.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub payload: Bytes,
    /// Quality the payload was finally produced at
    pub quality: u8,
    /// Size of the source pixel buffer
    pub raw_len: usize,
    pub sequence: u64,
    pub captured_at: Instant,
}

impl EncodedFrame {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Encoded size over raw size
    pub fn compression_ratio(&self) -> f64 {
        if self.raw_len == 0 {
            return 0.0;
        }
        self.payload.len() as f64 / self.raw_len as f64
    }
}

/// What to do when a frame compresses above the payload ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum QualityFallback {
    /// Drop the frame immediately
    Fail,
    /// Re-encode at `quality - step` until it fits, never going below `floor`
    StepDown { step: u8, floor: u8 },
}

impl QualityFallback {
    /// Next quality to try after `current` produced an oversized payload.
    pub fn next_quality(self, current: u8) -> Option<u8> {
        match self {
            QualityFallback::Fail => None,
            QualityFallback::StepDown { step, floor } => {
                if step == 0 || current <= floor {
                    None
                } else {
                    Some(current.saturating_sub(step).max(floor).max(1))
                }
            }
        }
    }
}

impl Default for QualityFallback {
    fn default() -> Self {
        QualityFallback::StepDown { step: 10, floor: 10 }
    }
}

/// Per-frame encoding failures. The frame is dropped and the stream goes on.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("JPEG codec failed")]
    Codec(#[from] image::ImageError),

    #[error("frame buffer holds {actual} bytes, expected {expected}")]
    Malformed { expected: usize, actual: usize },

    #[error("cannot encode {0:?} frames")]
    UnsupportedLayout(PixelFormat),

    #[error("payload of {len} bytes at quality {quality} exceeds the {max} byte ceiling")]
    PayloadTooLarge { len: usize, max: usize, quality: u8 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_down_ladder() {
        let policy = QualityFallback::StepDown { step: 10, floor: 10 };
        let mut ladder = vec![45];
        while let Some(next) = policy.next_quality(*ladder.last().unwrap()) {
            ladder.push(next);
        }
        assert_eq!(ladder, vec![45, 35, 25, 15, 10]);
    }

    #[test]
    fn test_fail_policy_never_retries() {
        assert_eq!(QualityFallback::Fail.next_quality(80), None);
    }

    #[test]
    fn test_zero_step_does_not_loop() {
        let policy = QualityFallback::StepDown { step: 0, floor: 5 };
        assert_eq!(policy.next_quality(50), None);
    }

    #[test]
    fn test_ratio_of_empty_raw_is_zero() {
        let frame = EncodedFrame {
            payload: Bytes::from_static(b"abc"),
            quality: 40,
            raw_len: 0,
            sequence: 1,
            captured_at: Instant::now(),
        };
        assert_eq!(frame.compression_ratio(), 0.0);
    }
}
