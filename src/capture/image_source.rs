//! Still image source.
//!
//! Holds at most one decoded image together with its original encoded bytes,
//! which are what the one-shot detection sends. A failed load leaves the
//! previously loaded image in place.

use std::path::Path;

use anyhow::{anyhow, Context, Result};

use super::{EncodedFrame, Frame};

/// JPEG quality used when a still is produced from a live frame.
const SNAPSHOT_JPEG_QUALITY: u8 = 92;

/// A decoded still image and the payload that represents it on the wire.
#[derive(Clone, Debug)]
pub struct LoadedImage {
    pub encoded: EncodedFrame,
    pub frame: Frame,
    /// Where the image came from (file path or "webcam snapshot").
    pub origin: String,
}

#[derive(Debug, Default)]
pub struct ImageSource {
    loaded: Option<LoadedImage>,
}

impl ImageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_path(&mut self, path: &Path) -> Result<&LoadedImage> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read image {}", path.display()))?;
        self.load_bytes(bytes, &path.display().to_string())
    }

    /// Decode `bytes` and keep them as the payload, like a FileReader data URI.
    pub fn load_bytes(&mut self, bytes: Vec<u8>, origin: &str) -> Result<&LoadedImage> {
        let format = image::guess_format(&bytes)
            .map_err(|e| anyhow!("unsupported image data from {}: {}", origin, e))?;
        let decoded = image::load_from_memory_with_format(&bytes, format)
            .with_context(|| format!("failed to decode image from {}", origin))?;
        let frame = Frame::from_image(decoded);
        if frame.is_empty() {
            return Err(anyhow!("image from {} has zero dimensions", origin));
        }
        let encoded = EncodedFrame {
            bytes,
            mime: format.to_mime_type().to_string(),
            width: frame.width,
            height: frame.height,
        };
        log::info!(
            "ImageSource: loaded {} ({}x{}, {})",
            origin,
            frame.width,
            frame.height,
            encoded.mime
        );
        Ok(self.loaded.insert(LoadedImage {
            encoded,
            frame,
            origin: origin.to_string(),
        }))
    }

    /// Keep a live frame as the still image (webcam snapshot).
    pub fn load_frame(&mut self, frame: Frame, origin: &str) -> Result<&LoadedImage> {
        let encoded = frame.encode_jpeg(SNAPSHOT_JPEG_QUALITY)?;
        Ok(self.loaded.insert(LoadedImage {
            encoded,
            frame,
            origin: origin.to_string(),
        }))
    }

    pub fn loaded(&self) -> Option<&LoadedImage> {
        self.loaded.as_ref()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    pub fn clear(&mut self) {
        self.loaded = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, image::Rgb([10, 200, 30]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).expect("encode png");
        out.into_inner()
    }

    #[test]
    fn loads_png_and_keeps_original_bytes() -> Result<()> {
        let bytes = png_bytes(4, 3);
        let mut source = ImageSource::new();
        let loaded = source.load_bytes(bytes.clone(), "test.png")?;
        assert_eq!(loaded.encoded.mime, "image/png");
        assert_eq!(loaded.encoded.bytes, bytes);
        assert_eq!((loaded.frame.width, loaded.frame.height), (4, 3));
        assert!(loaded
            .encoded
            .to_data_uri()
            .starts_with("data:image/png;base64,"));
        Ok(())
    }

    #[test]
    fn failed_load_keeps_previous_image() -> Result<()> {
        let mut source = ImageSource::new();
        source.load_bytes(png_bytes(2, 2), "first.png")?;
        assert!(source.load_bytes(b"not an image".to_vec(), "bad.bin").is_err());
        assert_eq!(source.loaded().map(|l| l.origin.as_str()), Some("first.png"));
        Ok(())
    }

    #[test]
    fn snapshot_frames_are_jpeg() -> Result<()> {
        let frame = Frame::from_rgb(vec![50u8; 8 * 8 * 3], 8, 8)?;
        let mut source = ImageSource::new();
        let loaded = source.load_frame(frame, "webcam snapshot")?;
        assert_eq!(loaded.encoded.mime, "image/jpeg");
        Ok(())
    }
}
