pub mod http;
pub mod stub;

use std::sync::Arc;
use std::time::Duration;

pub use http::{HttpBackend, DEFAULT_TIMEOUT};
pub use stub::{StubBackend, StubRequest};

use super::backend::DetectorBackend;
use super::transport::Transport;

/// Pick the backend for a base URL: `stub://` is served in-process, anything
/// else goes over HTTP.
pub fn backend_for_url(
    base_url: &str,
    transport: Transport,
    timeout: Duration,
) -> Arc<dyn DetectorBackend> {
    if base_url.starts_with("stub://") {
        log::info!("Detector: using in-process stub backend for {}", base_url);
        Arc::new(StubBackend::with_endpoint(base_url))
    } else {
        log::info!("Detector: using {} transport against {}", transport, base_url);
        Arc::new(HttpBackend::new(base_url, transport, timeout))
    }
}
