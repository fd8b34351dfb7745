//! HTTP detector backend.
//!
//! Talks to the detection API over blocking `ureq` calls. Each call either
//! returns the parsed body or one of the three [`DetectError`] kinds; nothing
//! is retried.

use std::io::Read;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::capture::EncodedFrame;
use crate::detect::backend::DetectorBackend;
use crate::detect::error::DetectError;
use crate::detect::result::{
    DetectResponse, ErrorResponse, HealthStatus, ModelCatalog, ResultsByModel,
};
use crate::detect::settings::DetectionSettings;
use crate::detect::transport::Transport;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on a response body; annotated images make bodies large.
const MAX_BODY_BYTES: u64 = 64 * 1024 * 1024;

pub struct HttpBackend {
    base_url: String,
    transport: Transport,
    agent: ureq::Agent,
}

impl HttpBackend {
    pub fn new(base_url: &str, transport: Transport, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            transport,
            agent,
        }
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn call(
        &self,
        url: &str,
        result: Result<ureq::Response, ureq::Error>,
    ) -> Result<String, DetectError> {
        match result {
            Ok(response) => read_body(url, response),
            Err(ureq::Error::Status(status, response)) => {
                let status_text = response.status_text().to_string();
                let body = read_body(url, response).unwrap_or_default();
                let message = serde_json::from_str::<ErrorResponse>(&body)
                    .ok()
                    .and_then(|envelope| envelope.error)
                    .unwrap_or_else(|| format!("API Error: {}", status_text));
                Err(DetectError::Backend { status, message })
            }
            Err(ureq::Error::Transport(transport)) => Err(DetectError::Transport {
                url: url.to_string(),
                message: transport.to_string(),
            }),
        }
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, DetectError> {
        let url = self.url(path);
        let body = self.call(&url, self.agent.get(&url).call())?;
        serde_json::from_str(&body).map_err(|err| DetectError::Parse(err.to_string()))
    }
}

fn read_body(url: &str, response: ureq::Response) -> Result<String, DetectError> {
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_BODY_BYTES)
        .read_to_end(&mut bytes)
        .map_err(|err| DetectError::Transport {
            url: url.to_string(),
            message: format!("reading response body: {}", err),
        })?;
    String::from_utf8(bytes).map_err(|_| DetectError::Parse("response body is not UTF-8".into()))
}

impl DetectorBackend for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    fn endpoint(&self) -> &str {
        &self.base_url
    }

    fn detect(
        &self,
        frame: &EncodedFrame,
        settings: &DetectionSettings,
    ) -> Result<ResultsByModel, DetectError> {
        let url = self.url(self.transport.path());
        let body = self
            .transport
            .encode(frame, settings)
            .map_err(|err| DetectError::Parse(format!("encoding request: {}", err)))?;
        log::debug!(
            "HttpBackend: POST {} ({} bytes, model {})",
            url,
            body.bytes.len(),
            settings.model
        );

        let response = self
            .agent
            .post(&url)
            .set("Content-Type", &body.content_type)
            .send_bytes(&body.bytes);
        let text = self.call(&url, response)?;

        let parsed: DetectResponse =
            serde_json::from_str(&text).map_err(|err| DetectError::Parse(err.to_string()))?;
        Ok(parsed.results)
    }

    fn health(&self) -> Result<HealthStatus, DetectError> {
        self.get_json("/api/health")
    }

    fn models(&self) -> Result<ModelCatalog, DetectError> {
        self.get_json("/api/models")
    }
}
