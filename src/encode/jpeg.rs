//! Resize + JPEG compression under a hard payload ceiling

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
use tracing::{debug, instrument};

use crate::capture::frame::{PixelFormat, RawFrame};
use crate::encode::{EncodeError, EncodedFrame, QualityFallback};
use crate::PipelineConfig;

/// Turns raw frames into payloads that fit in one datagram.
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    width: u32,
    height: u32,
    quality: u8,
    max_payload: usize,
    fallback: QualityFallback,
}

impl FrameEncoder {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            quality: config.quality.clamp(1, 100),
            max_payload: config.max_payload_bytes,
            fallback: config.fallback,
        }
    }

    /// Resize to the target resolution and compress.
    ///
    /// Oversized payloads walk the fallback ladder; if the last rung is still
    /// too big the frame fails with [`EncodeError::PayloadTooLarge`].
    #[instrument(skip_all, fields(sequence = frame.sequence))]
    pub fn encode(&self, frame: &RawFrame) -> Result<EncodedFrame, EncodeError> {
        let image = self.prepare(frame)?;

        let mut quality = self.quality;
        loop {
            let payload = compress(&image, quality)?;
            if payload.len() <= self.max_payload {
                return Ok(EncodedFrame {
                    payload,
                    quality,
                    raw_len: frame.raw_len(),
                    sequence: frame.sequence,
                    captured_at: frame.timestamp,
                });
            }

            match self.fallback.next_quality(quality) {
                Some(next) => {
                    debug!(
                        "{} bytes at quality {} over {} byte ceiling, retrying at {}",
                        payload.len(),
                        quality,
                        self.max_payload,
                        next
                    );
                    quality = next;
                }
                None => {
                    return Err(EncodeError::PayloadTooLarge {
                        len: payload.len(),
                        max: self.max_payload,
                        quality,
                    })
                }
            }
        }
    }

    /// RGB image at the target resolution
    fn prepare(&self, frame: &RawFrame) -> Result<RgbImage, EncodeError> {
        let pixels = match frame.layout {
            PixelFormat::Rgb24 => frame.data.to_vec(),
            PixelFormat::Bgr24 => frame
                .data
                .chunks_exact(3)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect(),
            other => return Err(EncodeError::UnsupportedLayout(other)),
        };

        let expected = frame.width as usize * frame.height as usize * 3;
        let actual = pixels.len();
        let image = RgbImage::from_raw(frame.width, frame.height, pixels)
            .filter(|_| actual == expected)
            .ok_or(EncodeError::Malformed { expected, actual })?;

        if image.dimensions() == (self.width, self.height) {
            return Ok(image);
        }
        Ok(imageops::resize(
            &image,
            self.width,
            self.height,
            FilterType::Triangle,
        ))
    }
}

/// One-shot form of [`FrameEncoder::encode`]
pub fn encode(frame: &RawFrame, config: &PipelineConfig) -> Result<EncodedFrame, EncodeError> {
    FrameEncoder::new(config).encode(frame)
}

fn compress(image: &RgbImage, quality: u8) -> Result<Bytes, EncodeError> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality).encode_image(image)?;
    Ok(Bytes::from(buffer))
}
