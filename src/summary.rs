//! Per-model statistics shown next to the results.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::detect::{model_display_name, ModelResult, ResultsByModel};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ModelSummary {
    pub key: String,
    pub display_name: String,
    pub object_count: u64,
    /// Average confidence in percent, rounded to one decimal.
    pub avg_confidence_pct: f64,
    pub inference_time_ms: f64,
    pub unique_classes: usize,
    pub class_counts: BTreeMap<String, usize>,
}

impl ModelSummary {
    pub fn from_result(key: &str, result: &ModelResult) -> Self {
        let mut class_counts = BTreeMap::new();
        for detection in &result.detections {
            *class_counts.entry(detection.class_name.clone()).or_insert(0) += 1;
        }
        Self {
            key: key.to_string(),
            display_name: model_display_name(key).to_string(),
            object_count: result.object_count,
            avg_confidence_pct: (result.avg_confidence * 1000.0).round() / 10.0,
            inference_time_ms: result.inference_time,
            unique_classes: class_counts.len(),
            class_counts,
        }
    }
}

impl fmt::Display for ModelSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} objects, avg confidence {:.1}%, {}ms",
            self.display_name, self.object_count, self.avg_confidence_pct, self.inference_time_ms
        )?;
        if !self.class_counts.is_empty() {
            let classes: Vec<String> = self
                .class_counts
                .iter()
                .map(|(class, count)| format!("{} x{}", class, count))
                .collect();
            write!(f, " [{}]", classes.join(", "))?;
        }
        Ok(())
    }
}

/// Summaries in display order: `yolov8n`, then `best`, then anything else.
pub fn summarize(results: &ResultsByModel) -> Vec<ModelSummary> {
    let rank = |key: &str| match key {
        "yolov8n" => 0,
        "best" => 1,
        _ => 2,
    };
    let mut entries: Vec<_> = results.iter().collect();
    entries.sort_by(|(a, _), (b, _)| rank(a).cmp(&rank(b)).then_with(|| a.cmp(b)));
    entries
        .into_iter()
        .map(|(key, result)| ModelSummary::from_result(key, result))
        .collect()
}
