//! Capture sources.
//!
//! This module provides the three interchangeable inputs a session can drive:
//! - Still images loaded from disk or memory (`ImageSource`)
//! - Webcams (`WebcamSource`, V4L2 behind feature: webcam-v4l2)
//! - Local video files (`VideoSource`, FFmpeg behind feature: video-ffmpeg)
//!
//! Webcams and videos are live sources: they implement `LiveSource` so the
//! polling loop can check readiness and pull the current frame on each tick.
//! `stub://` paths select synthetic devices and clips for tests and demos.
//!
//! Every source owns its device or decoder handle exclusively and releases it
//! on `stop`/`unload` or drop.

use std::io::Cursor;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::{codecs::jpeg::JpegEncoder, DynamicImage, ExtendedColorType, RgbImage};

pub mod image_source;
pub(crate) mod normalize;
pub mod video;
#[cfg(feature = "video-ffmpeg")]
pub(crate) mod video_ffmpeg;
pub mod webcam;

pub use image_source::ImageSource;
pub use video::{PlaybackState, VideoConfig, VideoSource};
pub use webcam::{WebcamConfig, WebcamSource, WebcamState};

/// JPEG quality used for live frames sent to the backend.
pub const LIVE_JPEG_QUALITY: u8 = 80;

/// A decoded RGB24 frame.
#[derive(Clone)]
pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

impl Frame {
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
        })
    }

    pub fn from_image(image: DynamicImage) -> Self {
        let rgb = image.into_rgb8();
        let (width, height) = rgb.dimensions();
        Self {
            pixels: rgb.into_raw(),
            width,
            height,
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// True when either dimension is zero; such frames are never drawn on.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn to_rgb_image(&self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))
    }

    pub fn encode_jpeg(&self, quality: u8) -> Result<EncodedFrame> {
        if self.is_empty() {
            return Err(anyhow!("cannot encode a zero-dimension frame"));
        }
        let mut bytes = Vec::new();
        JpegEncoder::new_with_quality(Cursor::new(&mut bytes), quality)
            .encode(&self.pixels, self.width, self.height, ExtendedColorType::Rgb8)
            .context("encode frame as jpeg")?;
        Ok(EncodedFrame {
            bytes,
            mime: "image/jpeg".to_string(),
            width: self.width,
            height: self.height,
        })
    }
}

/// An encoded image payload ready to be sent to the backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedFrame {
    pub bytes: Vec<u8>,
    pub mime: String,
    pub width: u32,
    pub height: u32,
}

impl EncodedFrame {
    pub fn to_data_uri(&self) -> String {
        data_uri(&self.mime, &self.bytes)
    }

    /// File name for multipart uploads, derived from the MIME type.
    pub fn file_name(&self) -> String {
        let ext = match self.mime.as_str() {
            "image/png" => "png",
            "image/webp" => "webp",
            _ => "jpg",
        };
        format!("frame.{}", ext)
    }
}

pub fn data_uri(mime: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime, BASE64.encode(bytes))
}

/// Whether a live source can provide a frame right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Temporarily unable to capture (stopped, paused, warming up).
    NotReady(&'static str),
    /// The source reached its end and will never be ready again.
    Ended,
}

/// A source the polling loop can sample.
pub trait LiveSource: Send {
    /// Short description for logs (device path, file path).
    fn describe(&self) -> String;

    fn readiness(&self) -> Readiness;

    /// Capture the current frame. Only called when `readiness()` is `Ready`.
    fn capture(&mut self) -> Result<Frame>;
}

pub type SharedSource = Arc<Mutex<dyn LiveSource>>;

/// Synthetic test pattern shared by the `stub://` webcam and video sources.
pub(crate) fn synthetic_pixels(width: u32, height: u32, frame_index: u64) -> Vec<u8> {
    let pixel_count = (width as usize) * (height as usize) * 3;
    let mut pixels = vec![0u8; pixel_count];
    for (i, pixel) in pixels.iter_mut().enumerate() {
        *pixel = ((i as u64 / 3 + frame_index * 7) % 256) as u8;
    }
    pixels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_buffers() {
        assert!(Frame::from_rgb(vec![0u8; 10], 2, 2).is_err());
        assert!(Frame::from_rgb(vec![0u8; 12], 2, 2).is_ok());
    }

    #[test]
    fn encodes_jpeg_data_uri() -> Result<()> {
        let frame = Frame::from_rgb(synthetic_pixels(16, 8, 0), 16, 8)?;
        let encoded = frame.encode_jpeg(LIVE_JPEG_QUALITY)?;
        assert_eq!(&encoded.bytes[..2], &[0xFF, 0xD8]);
        assert_eq!(encoded.file_name(), "frame.jpg");
        assert!(encoded.to_data_uri().starts_with("data:image/jpeg;base64,/9j/"));
        Ok(())
    }

    #[test]
    fn zero_dimension_frames_do_not_encode() -> Result<()> {
        let frame = Frame::from_rgb(Vec::new(), 0, 10)?;
        assert!(frame.is_empty());
        assert!(frame.encode_jpeg(80).is_err());
        Ok(())
    }
}
