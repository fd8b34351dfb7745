//! Letterbox mapping from intrinsic media pixels to display pixels.
//!
//! Media shown in a display rect keeps its aspect ratio: it is fitted to the
//! rect and centred, leaving bars top/bottom or left/right. Detections come
//! back from the backend in intrinsic pixel coordinates and have to be moved
//! into that fitted area before they can be drawn.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::fmt;

use crate::detect::Detection;

/// Largest accepted side of a parsed display size, in pixels.
pub const MAX_DISPLAY_SIDE: f64 = 16_384.0;

/// Size of the area the media is displayed in, in display pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct DisplayRect {
    pub width: f64,
    pub height: f64,
}

impl DisplayRect {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// Parse `"WxH"` (e.g., `"1280x720"`).
    pub fn parse(value: &str) -> Result<Self> {
        let (w, h) = value
            .trim()
            .split_once(|c| c == 'x' || c == 'X')
            .ok_or_else(|| anyhow!("display size must look like WIDTHxHEIGHT, got '{}'", value))?;
        let width: f64 = w
            .trim()
            .parse()
            .map_err(|_| anyhow!("invalid display width '{}'", w))?;
        let height: f64 = h
            .trim()
            .parse()
            .map_err(|_| anyhow!("invalid display height '{}'", h))?;
        let rect = Self::new(width, height);
        if !rect.is_drawable() {
            return Err(anyhow!("display size must be positive, got '{}'", value));
        }
        if rect.width > MAX_DISPLAY_SIDE || rect.height > MAX_DISPLAY_SIDE {
            return Err(anyhow!(
                "display size '{}' exceeds {}x{}",
                value,
                MAX_DISPLAY_SIDE,
                MAX_DISPLAY_SIDE
            ));
        }
        Ok(rect)
    }

    /// True when both sides are finite and positive.
    pub fn is_drawable(&self) -> bool {
        self.width.is_finite() && self.height.is_finite() && self.width > 0.0 && self.height > 0.0
    }

    /// Backing-store size in whole pixels (at least 1x1).
    pub fn pixel_size(&self) -> (u32, u32) {
        let to_px = |v: f64| {
            if v.is_finite() && v >= 1.0 {
                v.round().min(f64::from(u32::MAX)) as u32
            } else {
                1
            }
        };
        (to_px(self.width), to_px(self.height))
    }
}

impl fmt::Display for DisplayRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Scale and offset that fit intrinsic media into a display rect.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Letterbox {
    pub scale_x: f64,
    pub scale_y: f64,
    pub offset_x: f64,
    pub offset_y: f64,
    /// Width of the fitted media area.
    pub display_width: f64,
    /// Height of the fitted media area.
    pub display_height: f64,
}

impl Letterbox {
    /// Returns `None` for zero-sized media or an undrawable rect; callers skip
    /// the draw in that case.
    pub fn compute(intrinsic_width: u32, intrinsic_height: u32, rect: DisplayRect) -> Option<Self> {
        if intrinsic_width == 0 || intrinsic_height == 0 || !rect.is_drawable() {
            return None;
        }
        let iw = f64::from(intrinsic_width);
        let ih = f64::from(intrinsic_height);
        let video_aspect = iw / ih;
        let display_aspect = rect.width / rect.height;

        let (display_width, display_height, offset_x, offset_y) = if video_aspect > display_aspect {
            let display_height = rect.width / video_aspect;
            (rect.width, display_height, 0.0, (rect.height - display_height) / 2.0)
        } else {
            let display_width = rect.height * video_aspect;
            (display_width, rect.height, (rect.width - display_width) / 2.0, 0.0)
        };

        Some(Self {
            scale_x: display_width / iw,
            scale_y: display_height / ih,
            offset_x,
            offset_y,
            display_width,
            display_height,
        })
    }

    pub fn map_box(&self, [x1, y1, x2, y2]: [f64; 4]) -> [f64; 4] {
        [
            x1 * self.scale_x + self.offset_x,
            y1 * self.scale_y + self.offset_y,
            x2 * self.scale_x + self.offset_x,
            y2 * self.scale_y + self.offset_y,
        ]
    }
}

/// A detection moved into display coordinates.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MappedDetection {
    pub class_name: String,
    pub confidence: f64,
    pub bbox: [f64; 4],
}

impl MappedDetection {
    /// Overlay label, e.g. `"deer 91.0%"`.
    pub fn label(&self) -> String {
        format!("{} {:.1}%", self.class_name, self.confidence * 100.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Mapping {
    pub letterbox: Letterbox,
    pub detections: Vec<MappedDetection>,
}

/// Map `detections` from intrinsic pixels into `rect`. Boxes that are not
/// exactly four finite numbers are dropped.
pub fn map_detections(
    intrinsic_width: u32,
    intrinsic_height: u32,
    rect: DisplayRect,
    detections: &[Detection],
) -> Option<Mapping> {
    let letterbox = Letterbox::compute(intrinsic_width, intrinsic_height, rect)?;
    let detections = detections
        .iter()
        .filter_map(|detection| {
            let corners = detection.corners()?;
            Some(MappedDetection {
                class_name: detection.class_name.clone(),
                confidence: detection.confidence,
                bbox: letterbox.map_box(corners),
            })
        })
        .collect();
    Some(Mapping {
        letterbox,
        detections,
    })
}
