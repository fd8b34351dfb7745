use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

/// Model key the live overlay falls back to when the selected key is absent.
pub const FALLBACK_MODEL_KEY: &str = "yolov8n";

/// A single detection as reported by the backend, in intrinsic frame pixels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "class")]
    pub class_name: String,
    pub confidence: f64,
    /// Raw box as sent by the backend. Expected `[x1, y1, x2, y2]`, but kept
    /// loose so one malformed box does not fail the whole response.
    #[serde(default)]
    pub bbox: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
}

impl Detection {
    pub fn new(class_name: impl Into<String>, confidence: f64, bbox: [f64; 4]) -> Self {
        Self {
            class_name: class_name.into(),
            confidence,
            bbox: bbox.to_vec(),
            width: Some(bbox[2] - bbox[0]),
            height: Some(bbox[3] - bbox[1]),
        }
    }

    /// The box corners, or `None` unless there are exactly four finite numbers.
    pub fn corners(&self) -> Option<[f64; 4]> {
        match self.bbox.as_slice() {
            &[x1, y1, x2, y2] if [x1, y1, x2, y2].iter().all(|v| v.is_finite()) => {
                Some([x1, y1, x2, y2])
            }
            _ => None,
        }
    }
}

/// Output of one model for one frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResult {
    #[serde(default)]
    pub detections: Vec<Detection>,
    /// Milliseconds spent in inference on the backend.
    #[serde(default)]
    pub inference_time: f64,
    #[serde(default)]
    pub object_count: u64,
    #[serde(default)]
    pub avg_confidence: f64,
    /// Backend-rendered PNG as a data URI, when the backend provides one.
    #[serde(rename = "image", default)]
    pub annotated_image: Option<String>,
}

impl ModelResult {
    /// Decode the backend-rendered image. Accepts a `data:<mime>;base64,`
    /// URI or bare base64.
    pub fn decode_annotated_image(&self) -> Result<Option<Vec<u8>>> {
        let Some(image) = self.annotated_image.as_deref() else {
            return Ok(None);
        };
        let payload = match image.strip_prefix("data:") {
            Some(uri) => {
                let (header, data) = uri
                    .split_once(',')
                    .ok_or_else(|| anyhow!("annotated image data URI has no payload"))?;
                if !header.ends_with(";base64") {
                    return Err(anyhow!("annotated image data URI is not base64"));
                }
                data
            }
            None => image,
        };
        let bytes = BASE64
            .decode(payload.trim())
            .context("decode annotated image")?;
        Ok(Some(bytes))
    }
}

/// Per-model results keyed by model name (`yolov8n`, `best`).
///
/// Always replaced as a whole when a new response arrives.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultsByModel(BTreeMap<String, ModelResult>);

impl ResultsByModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, result: ModelResult) {
        self.0.insert(key.into(), result);
    }

    pub fn get(&self, key: &str) -> Option<&ModelResult> {
        self.0.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ModelResult)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Result drawn on the live overlay for `key`, falling back to `yolov8n`.
    ///
    /// The `compare` selector has no entry of its own, so it always lands on
    /// the fallback.
    pub fn for_display(&self, key: &str) -> Option<&ModelResult> {
        self.0.get(key).or_else(|| self.0.get(FALLBACK_MODEL_KEY))
    }
}

impl FromIterator<(String, ModelResult)> for ResultsByModel {
    fn from_iter<T: IntoIterator<Item = (String, ModelResult)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Success envelope of `POST /api/detect`.
#[derive(Debug, Deserialize)]
pub(crate) struct DetectResponse {
    pub results: ResultsByModel,
}

/// Error envelope returned with non-2xx statuses.
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorResponse {
    pub error: Option<String>,
}

/// `GET /api/health` response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub models_loaded: BTreeMap<String, bool>,
}

/// One entry of `GET /api/models`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub available: bool,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub description: String,
}

/// `GET /api/models` response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelCatalog {
    pub models: BTreeMap<String, ModelInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const BACKEND_BODY: &str = r#"{
        "success": true,
        "results": {
            "yolov8n": {
                "detections": [
                    {"class": "deer", "confidence": 0.91, "bbox": [10, 10, 50, 50], "width": 40, "height": 40}
                ],
                "inference_time": 42,
                "image": null,
                "object_count": 1,
                "avg_confidence": 0.91
            }
        },
        "timestamp": "2025-01-01T00:00:00"
    }"#;

    #[test]
    fn parses_backend_envelope() -> anyhow::Result<()> {
        let response: DetectResponse = serde_json::from_str(BACKEND_BODY)?;
        let result = response.results.get("yolov8n").expect("yolov8n entry");
        assert_eq!(result.object_count, 1);
        assert_eq!(result.detections[0].class_name, "deer");
        assert_eq!(result.detections[0].corners(), Some([10.0, 10.0, 50.0, 50.0]));
        assert!(result.annotated_image.is_none());
        Ok(())
    }

    #[test]
    fn empty_results_accept_integer_zero_average() -> anyhow::Result<()> {
        let body = r#"{"results": {"best": {"detections": [], "inference_time": 3.5,
            "image": "data:image/png;base64,AAAA", "object_count": 0, "avg_confidence": 0}}}"#;
        let response: DetectResponse = serde_json::from_str(body)?;
        let best = response.results.get("best").expect("best entry");
        assert_eq!(best.avg_confidence, 0.0);
        assert_eq!(best.annotated_image.as_deref(), Some("data:image/png;base64,AAAA"));
        Ok(())
    }

    #[test]
    fn annotated_image_decodes_from_data_uri() -> anyhow::Result<()> {
        let mut result = ModelResult {
            annotated_image: Some("data:image/png;base64,iVBORw==".to_string()),
            ..ModelResult::default()
        };
        assert_eq!(result.decode_annotated_image()?, Some(vec![0x89, b'P', b'N', b'G']));

        result.annotated_image = Some("iVBORw==".to_string());
        assert_eq!(result.decode_annotated_image()?, Some(vec![0x89, b'P', b'N', b'G']));

        result.annotated_image = Some("data:image/png,plain".to_string());
        assert!(result.decode_annotated_image().is_err());

        result.annotated_image = None;
        assert_eq!(result.decode_annotated_image()?, None);
        Ok(())
    }

    #[test]
    fn malformed_boxes_have_no_corners() {
        let mut det = Detection::new("cat", 0.5, [0.0, 0.0, 1.0, 1.0]);
        det.bbox = vec![1.0, 2.0, 3.0];
        assert!(det.corners().is_none());
        det.bbox = vec![1.0, 2.0, f64::NAN, 4.0];
        assert!(det.corners().is_none());
    }

    #[test]
    fn display_falls_back_to_yolov8n() {
        let mut results = ResultsByModel::new();
        results.insert("yolov8n", ModelResult::default());
        assert!(results.for_display("compare").is_some());
        assert!(results.for_display("best").is_some());

        let mut only_best = ResultsByModel::new();
        only_best.insert("best", ModelResult::default());
        assert!(only_best.for_display("best").is_some());
        assert!(only_best.for_display("compare").is_none());
    }

    #[test]
    fn serializes_class_field_name() -> anyhow::Result<()> {
        let det = Detection::new("bear", 0.7, [1.0, 2.0, 3.0, 4.0]);
        let value = serde_json::to_value(&det)?;
        assert_eq!(value["class"], "bear");
        assert!(value.get("class_name").is_none());
        Ok(())
    }
}
