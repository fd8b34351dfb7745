use thiserror::Error;

/// Failure of one detection request.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum DetectError {
    /// The request never completed (unreachable host, refused, timed out).
    #[error("transport error talking to {url}: {message}")]
    Transport { url: String, message: String },

    /// The backend answered with a non-success status.
    #[error("{message}")]
    Backend { status: u16, message: String },

    /// The success body was not JSON or lacked the `results` map.
    #[error("malformed detection response: {0}")]
    Parse(String),
}

impl DetectError {
    pub fn backend_status(&self) -> Option<u16> {
        match self {
            Self::Backend { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Message shown to the user for a failed one-shot detection.
    pub fn user_message(&self, backend_url: &str) -> String {
        let details = match self {
            Self::Transport { message, .. } => message.clone(),
            other => other.to_string(),
        };
        format!(
            "Failed to connect to the backend. Please ensure the backend server is running and accessible at {}. Details: {}",
            backend_url, details
        )
    }
}
