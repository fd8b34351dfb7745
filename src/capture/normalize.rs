use anyhow::{anyhow, Context, Result};

use super::Frame;

/// Pixel layouts a capture device may hand back.
#[cfg_attr(not(feature = "webcam-v4l2"), allow(dead_code))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PixelFormat {
    Rgb24,
    /// Packed YUV 4:2:2 (Y0 U Y1 V).
    Yuyv,
    /// Motion JPEG; each buffer is a complete JPEG image.
    Mjpeg,
}

#[cfg_attr(not(feature = "webcam-v4l2"), allow(dead_code))]
impl PixelFormat {
    pub(crate) fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"RGB3" => Some(Self::Rgb24),
            b"YUYV" => Some(Self::Yuyv),
            b"MJPG" => Some(Self::Mjpeg),
            _ => None,
        }
    }
}

#[cfg_attr(not(feature = "webcam-v4l2"), allow(dead_code))]
pub(crate) fn normalize_to_frame(
    buffer: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<Frame> {
    match format {
        PixelFormat::Rgb24 => {
            let expected = rgb_len(width, height)?;
            // Drivers may hand back padded buffers; the image itself comes first.
            let pixels = buffer.get(..expected).ok_or_else(|| {
                anyhow!(
                    "RGB frame length mismatch: expected {}, got {}",
                    expected,
                    buffer.len()
                )
            })?;
            Frame::from_rgb(pixels.to_vec(), width, height)
        }
        PixelFormat::Yuyv => Frame::from_rgb(yuyv_to_rgb(buffer, width, height)?, width, height),
        PixelFormat::Mjpeg => {
            let image = image::load_from_memory(buffer).context("decode mjpeg frame")?;
            Ok(Frame::from_image(image))
        }
    }
}

fn rgb_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| anyhow!("RGB frame dimensions overflow"))
}

fn yuyv_to_rgb(buffer: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let w = width as usize;
    let h = height as usize;
    if w % 2 != 0 {
        return Err(anyhow!("YUYV frame width must be even, got {}", w));
    }
    let expected = w
        .checked_mul(h)
        .and_then(|v| v.checked_mul(2))
        .ok_or_else(|| anyhow!("YUYV frame dimensions overflow"))?;
    if buffer.len() < expected {
        return Err(anyhow!(
            "YUYV frame length mismatch: expected {}, got {}",
            expected,
            buffer.len()
        ));
    }

    let mut rgb = Vec::with_capacity(rgb_len(width, height)?);
    for chunk in buffer[..expected].chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0], chunk[2]] {
            let y = y as f32;
            rgb.push(clamp_to_u8(y + 1.402_f32 * v));
            rgb.push(clamp_to_u8(y - 0.344_136_f32 * u - 0.714_136_f32 * v));
            rgb.push(clamp_to_u8(y + 1.772_f32 * u));
        }
    }
    Ok(rgb)
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
