//! Paced test-pattern source for runs without a camera

use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::capture::frame::{PixelFormat, RawFrame};
use crate::capture::source::{CaptureError, FrameSource};

/// Side of the flat-colour tiles; a multiple of the 8px JPEG block keeps
/// payloads small and stable.
const TILE: u32 = 40;

/// Emits a tiled RGB24 pattern whose colours shift every frame.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    interval: Option<Duration>,
    limit: Option<u64>,
    sequence: u64,
    next_due: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            interval: None,
            limit: None,
            sequence: 0,
            next_due: None,
        }
    }

    /// Pace output to `fps` frames per second. Zero means unpaced.
    pub fn with_rate(mut self, fps: u32) -> Self {
        self.interval = (fps > 0).then(|| Duration::from_secs_f64(1.0 / fps as f64));
        self
    }

    /// End the stream after `frames` frames.
    pub fn with_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    fn pace(&mut self) {
        let Some(interval) = self.interval else {
            return;
        };

        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            thread::sleep(due - now);
        }
        // Don't try to catch up after a stall
        self.next_due = Some(due.max(now) + interval);
    }

    fn render(&self) -> Vec<u8> {
        let shift = (self.sequence % 256) as u32;
        let mut pixels = Vec::with_capacity(self.width as usize * self.height as usize * 3);
        for y in 0..self.height {
            for x in 0..self.width {
                let (tx, ty) = (x / TILE, y / TILE);
                pixels.push(((tx * 37 + shift) % 256) as u8);
                pixels.push(((ty * 53 + shift * 2) % 256) as u8);
                pixels.push((((tx + ty) * 29 + 96) % 256) as u8);
            }
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn next_frame(&mut self) -> Result<Option<RawFrame>, CaptureError> {
        if self.limit.is_some_and(|limit| self.sequence >= limit) {
            return Ok(None);
        }

        self.pace();
        self.sequence += 1;
        let frame = RawFrame::new(
            Bytes::from(self.render()),
            self.width,
            self.height,
            PixelFormat::Rgb24,
            self.sequence,
            Instant::now(),
        )?;
        Ok(Some(frame))
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}
