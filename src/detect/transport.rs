//! Wire shapes for a detection request.
//!
//! Both shapes carry the same fields. `Json` posts a data-URI image to
//! `/api/detect`; `Multipart` uploads the raw bytes as a `file` part to
//! `/api/detect-file`.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::settings::DetectionSettings;
use crate::capture::EncodedFrame;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Json,
    Multipart,
}

impl Transport {
    /// Request path relative to the backend base URL.
    pub fn path(self) -> &'static str {
        match self {
            Self::Json => "/api/detect",
            Self::Multipart => "/api/detect-file",
        }
    }

    /// Build the request body and its content type.
    pub fn encode(self, frame: &EncodedFrame, settings: &DetectionSettings) -> Result<RequestBody> {
        match self {
            Self::Json => {
                let body = JsonRequest {
                    image: frame.to_data_uri(),
                    model: settings.model.key(),
                    confidence: settings.confidence,
                    iou: settings.iou,
                    filter_animals: settings.filter_animals,
                };
                Ok(RequestBody {
                    content_type: "application/json".to_string(),
                    bytes: serde_json::to_vec(&body)?,
                })
            }
            Self::Multipart => Ok(multipart_body(frame, settings, &random_boundary())),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::Multipart => "multipart",
        })
    }
}

impl FromStr for Transport {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "multipart" | "form" => Ok(Self::Multipart),
            other => Err(anyhow!(
                "unknown transport '{}'; expected json or multipart",
                other
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestBody {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Serialize)]
struct JsonRequest<'a> {
    image: String,
    model: &'a str,
    confidence: f64,
    iou: f64,
    filter_animals: bool,
}

fn random_boundary() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect();
    format!("wildsnap-{}", suffix)
}

fn multipart_body(frame: &EncodedFrame, settings: &DetectionSettings, boundary: &str) -> RequestBody {
    let mut bytes = Vec::with_capacity(frame.bytes.len() + 1024);
    let fields = [
        ("model", settings.model.key().to_string()),
        ("confidence", settings.confidence.to_string()),
        ("iou", settings.iou.to_string()),
        ("filter_animals", settings.filter_animals.to_string()),
    ];
    for (name, value) in fields {
        bytes.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    bytes.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
            frame.file_name(),
            frame.mime
        )
        .as_bytes(),
    );
    bytes.extend_from_slice(&frame.bytes);
    bytes.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    RequestBody {
        content_type: format!("multipart/form-data; boundary={boundary}"),
        bytes,
    }
}
