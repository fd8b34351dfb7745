use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIDENCE: f64 = 0.40;
pub const DEFAULT_IOU: f64 = 0.50;

/// Which backend model(s) a request asks for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSelector {
    #[default]
    Yolov8n,
    Best,
    /// Run both models on the same frame.
    Compare,
}

impl ModelSelector {
    /// Wire value of the `model` field.
    pub fn key(self) -> &'static str {
        match self {
            Self::Yolov8n => "yolov8n",
            Self::Best => "best",
            Self::Compare => "compare",
        }
    }

    /// Result keys a successful response is expected to contain.
    pub fn result_keys(self) -> &'static [&'static str] {
        match self {
            Self::Yolov8n => &["yolov8n"],
            Self::Best => &["best"],
            Self::Compare => &["yolov8n", "best"],
        }
    }

    pub fn is_compare(self) -> bool {
        matches!(self, Self::Compare)
    }
}

impl fmt::Display for ModelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for ModelSelector {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "yolov8n" => Ok(Self::Yolov8n),
            "best" | "custom" => Ok(Self::Best),
            "compare" => Ok(Self::Compare),
            other => Err(anyhow!(
                "unknown model '{}'; expected yolov8n, best or compare",
                other
            )),
        }
    }
}

/// Human-readable name for a result key.
pub fn model_display_name(key: &str) -> &str {
    match key {
        "yolov8n" => "YOLOv8n",
        "best" => "Custom best.pt",
        other => other,
    }
}

/// Request parameters read at the moment each request is built.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionSettings {
    pub model: ModelSelector,
    pub confidence: f64,
    pub iou: f64,
    /// Ask the backend to keep only animal classes (honoured for yolov8n only).
    pub filter_animals: bool,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            model: ModelSelector::default(),
            confidence: DEFAULT_CONFIDENCE,
            iou: DEFAULT_IOU,
            filter_animals: true,
        }
    }
}

impl DetectionSettings {
    pub fn validate(&self) -> Result<()> {
        check_unit("confidence", self.confidence)?;
        check_unit("iou", self.iou)?;
        Ok(())
    }
}

pub(crate) fn check_unit(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(anyhow!("{} threshold must be within [0, 1], got {}", name, value));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_model_selectors() -> Result<()> {
        assert_eq!("yolov8n".parse::<ModelSelector>()?, ModelSelector::Yolov8n);
        assert_eq!(" Best ".parse::<ModelSelector>()?, ModelSelector::Best);
        assert_eq!("compare".parse::<ModelSelector>()?, ModelSelector::Compare);
        assert!("resnet".parse::<ModelSelector>().is_err());
        Ok(())
    }

    #[test]
    fn compare_expects_both_models() {
        assert_eq!(ModelSelector::Compare.result_keys(), &["yolov8n", "best"]);
        assert_eq!(ModelSelector::Best.result_keys(), &["best"]);
    }

    #[test]
    fn rejects_out_of_range_thresholds() {
        let settings = DetectionSettings {
            confidence: 1.2,
            ..DetectionSettings::default()
        };
        assert!(settings.validate().is_err());
        let settings = DetectionSettings {
            iou: -0.1,
            ..DetectionSettings::default()
        };
        assert!(settings.validate().is_err());
        assert!(DetectionSettings::default().validate().is_ok());
    }
}
