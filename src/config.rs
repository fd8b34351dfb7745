use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::capture::{VideoConfig, WebcamConfig};
use crate::detect::{
    backend_for_url, check_unit, DetectionSettings, DetectorBackend, ModelSelector, Transport,
    DEFAULT_CONFIDENCE, DEFAULT_IOU,
};
use crate::overlay::{OverlayCanvas, OverlayStyle};

const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:5000";
const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_INTERVAL_MS: u64 = 500;
const DEFAULT_FONT_SIZE: f32 = 14.0;
const DEFAULT_STROKE_WIDTH: u32 = 3;

#[derive(Debug, Deserialize, Default)]
struct WildsnapConfigFile {
    backend: Option<BackendConfigFile>,
    detection: Option<DetectionConfigFile>,
    polling: Option<PollingConfigFile>,
    overlay: Option<OverlayConfigFile>,
    webcam: Option<WebcamConfigFile>,
    video: Option<VideoConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct BackendConfigFile {
    url: Option<String>,
    transport: Option<Transport>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    model: Option<ModelSelector>,
    confidence: Option<f64>,
    iou: Option<f64>,
    filter_animals: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct PollingConfigFile {
    interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct OverlayConfigFile {
    font_path: Option<PathBuf>,
    font_size: Option<f32>,
    stroke_width: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct WebcamConfigFile {
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct VideoConfigFile {
    target_fps: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct WildsnapConfig {
    pub backend: BackendSettings,
    pub detection: DetectionSettings,
    pub polling_interval: Duration,
    pub overlay: OverlaySettings,
    pub webcam: WebcamConfig,
    pub video: VideoConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendSettings {
    pub url: String,
    pub transport: Transport,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OverlaySettings {
    pub font_path: Option<PathBuf>,
    pub font_size: f32,
    pub stroke_width: u32,
}

impl Default for WildsnapConfig {
    fn default() -> Self {
        Self::from_file(WildsnapConfigFile::default())
    }
}

impl WildsnapConfig {
    /// Defaults, then the file named by `WILDSNAP_CONFIG`, then environment
    /// overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("WILDSNAP_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Like [`load`](Self::load) with an explicit config file.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => WildsnapConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: WildsnapConfigFile) -> Self {
        let backend = file.backend.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        let overlay = file.overlay.unwrap_or_default();
        let webcam = file.webcam.unwrap_or_default();
        let webcam_defaults = WebcamConfig::default();

        Self {
            backend: BackendSettings {
                url: backend
                    .url
                    .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string()),
                transport: backend.transport.unwrap_or_default(),
                timeout: Duration::from_millis(backend.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)),
            },
            detection: DetectionSettings {
                model: detection.model.unwrap_or_default(),
                confidence: detection.confidence.unwrap_or(DEFAULT_CONFIDENCE),
                iou: detection.iou.unwrap_or(DEFAULT_IOU),
                filter_animals: detection.filter_animals.unwrap_or(true),
            },
            polling_interval: Duration::from_millis(
                file.polling
                    .and_then(|polling| polling.interval_ms)
                    .unwrap_or(DEFAULT_INTERVAL_MS),
            ),
            overlay: OverlaySettings {
                font_path: overlay.font_path,
                font_size: overlay.font_size.unwrap_or(DEFAULT_FONT_SIZE),
                stroke_width: overlay.stroke_width.unwrap_or(DEFAULT_STROKE_WIDTH),
            },
            webcam: WebcamConfig {
                device: webcam.device.unwrap_or(webcam_defaults.device),
                width: webcam.width.unwrap_or(webcam_defaults.width),
                height: webcam.height.unwrap_or(webcam_defaults.height),
                target_fps: webcam.fps.unwrap_or(webcam_defaults.target_fps),
            },
            video: VideoConfig {
                target_fps: file
                    .video
                    .and_then(|video| video.target_fps)
                    .unwrap_or(VideoConfig::default().target_fps),
            },
        }
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("WILDSNAP_BACKEND_URL") {
            if !url.trim().is_empty() {
                self.backend.url = url.trim().to_string();
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_backend_url(&self.backend.url)?;
        if self.backend.timeout.is_zero() {
            return Err(anyhow!("backend timeout must be greater than zero"));
        }
        check_unit("confidence", self.detection.confidence)?;
        check_unit("iou", self.detection.iou)?;
        if self.polling_interval.is_zero() {
            return Err(anyhow!("polling interval must be greater than zero"));
        }
        if !(self.overlay.font_size.is_finite() && self.overlay.font_size > 0.0) {
            return Err(anyhow!("overlay font size must be positive"));
        }
        if self.overlay.stroke_width == 0 {
            return Err(anyhow!("overlay stroke width must be greater than zero"));
        }
        if self.webcam.width == 0 || self.webcam.height == 0 {
            return Err(anyhow!("webcam resolution must be non-zero"));
        }
        Ok(())
    }

    pub fn overlay_style(&self) -> OverlayStyle {
        OverlayStyle {
            stroke_width: self.overlay.stroke_width,
            font_size: self.overlay.font_size,
            ..OverlayStyle::default()
        }
    }

    /// Overlay canvas with the configured style and font. A font that fails to
    /// load is logged and labels are drawn without text.
    pub fn overlay_canvas(&self) -> OverlayCanvas {
        let style = self.overlay_style();
        match &self.overlay.font_path {
            Some(path) => match OverlayCanvas::load_font(path) {
                Ok(font) => OverlayCanvas::with_font(style, font),
                Err(err) => {
                    log::warn!("Overlay: {:#}; labels will have no text", err);
                    OverlayCanvas::new(style)
                }
            },
            None => OverlayCanvas::new(style),
        }
    }

    pub fn detector(&self) -> Arc<dyn DetectorBackend> {
        backend_for_url(&self.backend.url, self.backend.transport, self.backend.timeout)
    }
}

fn validate_backend_url(value: &str) -> Result<()> {
    if value.starts_with("stub://") {
        return Ok(());
    }
    let url = url::Url::parse(value)
        .map_err(|e| anyhow!("invalid backend url '{}': {}", value, e))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(anyhow!(
            "backend url must use http or https, got '{}'",
            other
        )),
    }
}

fn read_config_file(path: &Path) -> Result<WildsnapConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
