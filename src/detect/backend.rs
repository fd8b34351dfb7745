use super::error::DetectError;
use super::result::{HealthStatus, ModelCatalog, ResultsByModel};
use super::settings::DetectionSettings;
use crate::capture::EncodedFrame;

/// Detector backend trait.
///
/// Inference happens elsewhere; a backend only ships an encoded frame plus the
/// current settings and hands back the per-model result map unmodified.
///
/// `detect` takes `&self` so that the polling loop can run a request on a
/// worker thread while the session keeps its own handle to the backend.
pub trait DetectorBackend: Send + Sync {
    /// Backend identifier for logs.
    fn name(&self) -> &'static str;

    /// Base URL shown in user-facing connection errors.
    fn endpoint(&self) -> &str;

    /// Run detection on one encoded frame.
    fn detect(
        &self,
        frame: &EncodedFrame,
        settings: &DetectionSettings,
    ) -> Result<ResultsByModel, DetectError>;

    /// Backend liveness and which models it has loaded.
    fn health(&self) -> Result<HealthStatus, DetectError>;

    /// Models the backend can serve.
    fn models(&self) -> Result<ModelCatalog, DetectError>;
}
