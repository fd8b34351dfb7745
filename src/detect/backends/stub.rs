use std::collections::{BTreeMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::capture::EncodedFrame;
use crate::detect::backend::DetectorBackend;
use crate::detect::error::DetectError;
use crate::detect::result::{
    Detection, HealthStatus, ModelCatalog, ModelInfo, ModelResult, ResultsByModel,
};
use crate::detect::settings::DetectionSettings;

/// What the stub saw for one `detect` call.
#[derive(Clone, Debug, PartialEq)]
pub struct StubRequest {
    pub settings: DetectionSettings,
    pub mime: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Default)]
struct StubState {
    script: VecDeque<Result<ResultsByModel, DetectError>>,
    requests: Vec<StubRequest>,
    held: bool,
}

/// In-process backend for `stub://` URLs and tests.
///
/// Replies with scripted responses in order and falls back to a canned result
/// (one `deer` centred in the frame for every requested model) once the
/// script runs dry. `hold` parks incoming calls until `release`, which lets a
/// test keep a request in flight.
pub struct StubBackend {
    endpoint: String,
    state: Mutex<StubState>,
    changed: Condvar,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::with_endpoint("stub://backend")
    }

    pub fn with_endpoint(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            state: Mutex::new(StubState::default()),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue the reply for a future call.
    pub fn push_response(&self, response: Result<ResultsByModel, DetectError>) {
        self.lock().script.push_back(response);
    }

    /// Park subsequent calls until `release`.
    pub fn hold(&self) {
        self.lock().held = true;
    }

    pub fn release(&self) {
        self.lock().held = false;
        self.changed.notify_all();
    }

    pub fn requests(&self) -> Vec<StubRequest> {
        self.lock().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.lock().requests.len()
    }

    /// Block until at least `count` calls have arrived. Returns false on timeout.
    pub fn wait_for_requests(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.requests.len() < count {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.changed.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Result the stub returns when nothing is scripted.
pub fn canned_results(width: u32, height: u32, settings: &DetectionSettings) -> ResultsByModel {
    let (w, h) = (f64::from(width), f64::from(height));
    let detection = Detection::new("deer", 0.91, [w * 0.25, h * 0.25, w * 0.75, h * 0.75]);
    settings
        .model
        .result_keys()
        .iter()
        .map(|key| {
            (
                key.to_string(),
                ModelResult {
                    detections: vec![detection.clone()],
                    inference_time: 42.0,
                    object_count: 1,
                    avg_confidence: 0.91,
                    annotated_image: None,
                },
            )
        })
        .collect()
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn detect(
        &self,
        frame: &EncodedFrame,
        settings: &DetectionSettings,
    ) -> Result<ResultsByModel, DetectError> {
        let mut state = self.lock();
        state.requests.push(StubRequest {
            settings: *settings,
            mime: frame.mime.clone(),
            width: frame.width,
            height: frame.height,
        });
        self.changed.notify_all();

        while state.held {
            state = match self.changed.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }

        match state.script.pop_front() {
            Some(response) => response,
            None => Ok(canned_results(frame.width, frame.height, settings)),
        }
    }

    fn health(&self) -> Result<HealthStatus, DetectError> {
        Ok(HealthStatus {
            status: "ok".to_string(),
            models_loaded: BTreeMap::from([("best".to_string(), true), ("yolov8n".to_string(), true)]),
        })
    }

    fn models(&self) -> Result<ModelCatalog, DetectError> {
        let info = |kind: &str, description: &str| ModelInfo {
            available: true,
            kind: kind.to_string(),
            description: description.to_string(),
        };
        Ok(ModelCatalog {
            models: BTreeMap::from([
                (
                    "yolov8n".to_string(),
                    info("YOLOv8 Nano", "Lightweight general object detection"),
                ),
                (
                    "best".to_string(),
                    info("Custom Model", "Custom-trained animal detection model"),
                ),
            ]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::settings::ModelSelector;
    use std::sync::Arc;

    fn frame() -> EncodedFrame {
        EncodedFrame {
            bytes: vec![1, 2, 3],
            mime: "image/jpeg".to_string(),
            width: 100,
            height: 40,
        }
    }

    #[test]
    fn canned_result_covers_requested_models() -> Result<(), DetectError> {
        let stub = StubBackend::new();
        let settings = DetectionSettings {
            model: ModelSelector::Compare,
            ..DetectionSettings::default()
        };
        let results = stub.detect(&frame(), &settings)?;
        assert_eq!(results.keys().collect::<Vec<_>>(), vec!["best", "yolov8n"]);
        let best = results.get("best").expect("best result");
        assert_eq!(best.detections[0].bbox, vec![25.0, 10.0, 75.0, 30.0]);
        Ok(())
    }

    #[test]
    fn scripted_responses_come_first() {
        let stub = StubBackend::new();
        stub.push_response(Err(DetectError::Parse("bad".into())));
        let settings = DetectionSettings::default();
        assert!(stub.detect(&frame(), &settings).is_err());
        assert!(stub.detect(&frame(), &settings).is_ok());
        assert_eq!(stub.request_count(), 2);
    }

    #[test]
    fn held_calls_wait_for_release() {
        let stub = Arc::new(StubBackend::new());
        stub.hold();
        let worker = {
            let stub = Arc::clone(&stub);
            std::thread::spawn(move || stub.detect(&frame(), &DetectionSettings::default()))
        };
        assert!(stub.wait_for_requests(1, Duration::from_secs(2)));
        assert!(!worker.is_finished());
        stub.release();
        let result = worker.join().expect("worker thread");
        assert!(result.is_ok());
    }
}
