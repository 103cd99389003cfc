use jpeg_decoder::Decoder;
use thiserror::Error;

use super::frame::PixelFormat;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Jpeg(#[from] jpeg_decoder::Error),

    #[error("unsupported JPEG pixel format {0:?}")]
    JpegFormat(jpeg_decoder::PixelFormat),

    #[error("buffer holds {actual} bytes, expected {expected}")]
    Truncated { expected: usize, actual: usize },

    #[error("cannot convert {0:?} to RGB")]
    Unsupported(PixelFormat),
}

/// Packed RGB24 pixels plus the geometry they were decoded at
pub struct Decoded {
    pub rgb: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Convert a device buffer to packed RGB24.
///
/// `width`/`height` are the negotiated capture size; MJPEG buffers carry their
/// own geometry and override it.
pub fn decode_frame(
    data: &[u8],
    format: PixelFormat,
    width: u32,
    height: u32,
) -> Result<Decoded, DecodeError> {
    match format {
        PixelFormat::Mjpeg => decode_mjpeg(data),
        PixelFormat::Rgb24 => {
            let expected = width as usize * height as usize * 3;
            check_len(data, expected)?;
            Ok(Decoded {
                rgb: data[..expected].to_vec(),
                width,
                height,
            })
        }
        PixelFormat::Yuyv4 => {
            let expected = width as usize * height as usize * 2;
            check_len(data, expected)?;
            Ok(Decoded {
                rgb: yuyv_to_rgb(&data[..expected]),
                width,
                height,
            })
        }
        PixelFormat::Bgr24 => Err(DecodeError::Unsupported(format)),
    }
}

fn check_len(data: &[u8], expected: usize) -> Result<(), DecodeError> {
    if data.len() < expected {
        return Err(DecodeError::Truncated {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn decode_mjpeg(data: &[u8]) -> Result<Decoded, DecodeError> {
    let mut decoder = Decoder::new(data);
    let pixels = decoder.decode()?;
    let info = decoder
        .info()
        .ok_or(jpeg_decoder::Error::Format("missing frame header".into()))?;

    let rgb = match info.pixel_format {
        jpeg_decoder::PixelFormat::RGB24 => pixels,
        jpeg_decoder::PixelFormat::L8 => pixels.iter().flat_map(|&l| [l, l, l]).collect(),
        other => return Err(DecodeError::JpegFormat(other)),
    };

    Ok(Decoded {
        rgb,
        width: info.width as u32,
        height: info.height as u32,
    })
}

/// YUYV 4:2:2 to RGB24 with BT.601 studio-swing coefficients.
pub fn yuyv_to_rgb(yuyv: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(yuyv.len() / 2 * 3);
    for chunk in yuyv.chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_pixel(y0, u, v));
        rgb.extend_from_slice(&yuv_pixel(y1, u, v));
    }
    rgb
}

fn yuv_pixel(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;

    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 516 * d),
    ]
}
