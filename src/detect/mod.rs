//! Detection client: request settings, wire transports, backends and the
//! result model returned by the detection API.

mod backend;
pub mod backends;
mod error;
mod result;
mod settings;
mod transport;

pub use backend::DetectorBackend;
pub use backends::{backend_for_url, HttpBackend, StubBackend, StubRequest};
pub use error::DetectError;
pub use result::{
    Detection, HealthStatus, ModelCatalog, ModelInfo, ModelResult, ResultsByModel,
    FALLBACK_MODEL_KEY,
};
pub use settings::{
    model_display_name, DetectionSettings, ModelSelector, DEFAULT_CONFIDENCE, DEFAULT_IOU,
};
pub use transport::{RequestBody, Transport};

pub(crate) use settings::check_unit;
