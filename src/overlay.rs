//! Transparent overlay with detection boxes and labels.
//!
//! The canvas backing store always matches the display rect it was last
//! rendered for. Every render starts from a fully transparent canvas, so
//! rendering the same inputs twice yields identical pixels.

use ab_glyph::{FontArc, PxScale};
use anyhow::{anyhow, Context, Result};
use image::{imageops, Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::path::Path;

use crate::capture::Frame;
use crate::geometry::{DisplayRect, Letterbox, MappedDetection};

const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);
const BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);
/// `#00ffff`
const CYAN: Rgba<u8> = Rgba([0, 255, 255, 255]);

/// Label width per character when no font is loaded, as a fraction of the
/// font size.
const FALLBACK_ADVANCE: f32 = 0.6;

#[derive(Clone, Debug, PartialEq)]
pub struct OverlayStyle {
    pub stroke: Rgba<u8>,
    pub stroke_width: u32,
    pub label_background: Rgba<u8>,
    pub label_height: u32,
    /// Added to the measured text width.
    pub label_padding: u32,
    /// Text offset from the label's left edge.
    pub text_inset: u32,
    pub text_color: Rgba<u8>,
    pub font_size: f32,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            stroke: CYAN,
            stroke_width: 3,
            label_background: CYAN,
            label_height: 20,
            label_padding: 10,
            text_inset: 5,
            text_color: BLACK,
            font_size: 14.0,
        }
    }
}

pub struct OverlayCanvas {
    image: RgbaImage,
    style: OverlayStyle,
    font: Option<FontArc>,
}

impl OverlayCanvas {
    pub fn new(style: OverlayStyle) -> Self {
        Self {
            image: RgbaImage::new(0, 0),
            style,
            font: None,
        }
    }

    pub fn with_font(style: OverlayStyle, font: FontArc) -> Self {
        Self {
            font: Some(font),
            ..Self::new(style)
        }
    }

    /// Read a TrueType/OpenType font from disk.
    pub fn load_font(path: &Path) -> Result<FontArc> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read font {}", path.display()))?;
        FontArc::try_from_vec(bytes).map_err(|_| anyhow!("invalid font file {}", path.display()))
    }

    pub fn style(&self) -> &OverlayStyle {
        &self.style
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// True when no pixel is painted.
    pub fn is_blank(&self) -> bool {
        self.image.pixels().all(|p| p.0[3] == 0)
    }

    /// Erase everything, keeping the current size.
    pub fn clear(&mut self) {
        for pixel in self.image.pixels_mut() {
            *pixel = TRANSPARENT;
        }
    }

    fn resize(&mut self, rect: DisplayRect) {
        let (width, height) = rect.pixel_size();
        if self.image.dimensions() != (width, height) {
            self.image = RgbaImage::new(width, height);
        } else {
            self.clear();
        }
    }

    /// Resize to `rect`, clear, and draw `detections` (display coordinates).
    pub fn render(&mut self, rect: DisplayRect, detections: &[MappedDetection]) {
        self.resize(rect);
        for detection in detections {
            self.draw_detection(detection);
        }
    }

    fn draw_detection(&mut self, detection: &MappedDetection) {
        let [x1, y1, x2, y2] = detection.bbox;
        if !(x2 > x1 && y2 > y1) {
            return;
        }
        let (cw, ch) = self.image.dimensions();
        let (cw_f, ch_f) = (f64::from(cw), f64::from(ch));
        if x2 < 0.0 || y2 < 0.0 || x1 > cw_f || y1 > ch_f {
            return;
        }

        // Pull far-off edges in to just outside the canvas; they stay invisible.
        let margin = f64::from(self.style.stroke_width) + 1.0;
        let clamp_x = |v: f64| v.clamp(-margin, cw_f + margin).round() as i32;
        let clamp_y = |v: f64| v.clamp(-margin, ch_f + margin).round() as i32;
        let (left, top, right, bottom) = (clamp_x(x1), clamp_y(y1), clamp_x(x2), clamp_y(y2));

        let half = (self.style.stroke_width / 2) as i32;
        for i in 0..self.style.stroke_width as i32 {
            let grow = i - half;
            let width = right - left + 2 * grow;
            let height = bottom - top + 2 * grow;
            if width <= 0 || height <= 0 {
                continue;
            }
            let rect = Rect::at(left - grow, top - grow).of_size(width as u32, height as u32);
            draw_hollow_rect_mut(&mut self.image, rect, self.style.stroke);
        }

        self.draw_label(&detection.label(), left, top);
    }

    fn draw_label(&mut self, label: &str, box_left: i32, box_top: i32) {
        let scale = PxScale::from(self.style.font_size);
        let (text_width, text_height) = match &self.font {
            Some(font) => text_size(scale, font, label),
            None => (
                (label.chars().count() as f32 * self.style.font_size * FALLBACK_ADVANCE).ceil()
                    as u32,
                self.style.font_size.ceil() as u32,
            ),
        };
        let label_width = text_width + self.style.label_padding;
        let label_height = self.style.label_height;
        let canvas_width = self.image.width() as i32;

        // Above the box, or inside it when that would leave the canvas.
        let mut top = box_top - label_height as i32;
        if top < 0 {
            top = box_top.max(0);
        }
        let max_left = (canvas_width - label_width as i32).max(0);
        let left = box_left.clamp(0, max_left);

        if label_width > 0 && label_height > 0 {
            let background = Rect::at(left, top).of_size(label_width, label_height);
            draw_filled_rect_mut(&mut self.image, background, self.style.label_background);
        }
        if let Some(font) = &self.font {
            let text_top = top + (label_height.saturating_sub(text_height) / 2) as i32;
            draw_text_mut(
                &mut self.image,
                self.style.text_color,
                left + self.style.text_inset as i32,
                text_top,
                scale,
                font,
                label,
            );
        }
    }

    /// Letterbox `frame` onto a black canvas of `rect` size and blend the
    /// overlay on top. The overlay must have been rendered for the same rect.
    pub fn compose(&self, frame: &Frame, rect: DisplayRect) -> Result<RgbaImage> {
        let (width, height) = rect.pixel_size();
        let mut canvas = RgbaImage::from_pixel(width, height, BLACK);

        let letterbox = Letterbox::compute(frame.width, frame.height, rect)
            .ok_or_else(|| anyhow!("cannot compose a {}x{} frame", frame.width, frame.height))?;
        let fitted_w = letterbox.display_width.round().max(1.0) as u32;
        let fitted_h = letterbox.display_height.round().max(1.0) as u32;
        let media = image::DynamicImage::ImageRgb8(frame.to_rgb_image()?).to_rgba8();
        let media = imageops::resize(&media, fitted_w, fitted_h, imageops::FilterType::Triangle);
        imageops::overlay(
            &mut canvas,
            &media,
            letterbox.offset_x.round() as i64,
            letterbox.offset_y.round() as i64,
        );

        if self.image.dimensions() == (width, height) {
            imageops::overlay(&mut canvas, &self.image, 0, 0);
        }
        Ok(canvas)
    }
}
