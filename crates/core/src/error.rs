use serde::Deserialize;

/// Errors surfaced by every kubus operation.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("configuration: {0}")]
    Configuration(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("server ({code}): {message}")]
    Server { code: u16, message: String },
    #[error("rejected ({code}): {message}")]
    Rejected { code: u16, message: String },
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("connection: {0}")]
    Connection(String),
    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("callback failed: {0}")]
    Callback(#[source] anyhow::Error),
}

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Deserialize)]
struct StatusBody {
    #[serde(default)]
    message: String,
}

impl ClientError {
    /// Classify a non-2xx response. `body` is usually a `Status` document;
    /// its `message` is used when present, else the raw text.
    pub fn from_status(code: u16, body: &[u8]) -> Self {
        let message = match serde_json::from_slice::<StatusBody>(body) {
            Ok(s) if !s.message.is_empty() => s.message,
            _ => String::from_utf8_lossy(body).trim().to_string(),
        };
        match code {
            404 => ClientError::NotFound(message),
            409 => ClientError::Conflict(message),
            500..=599 => ClientError::Server { code, message },
            _ => ClientError::Rejected { code, message },
        }
    }

    /// HTTP status this error came from, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ClientError::NotFound(_) => Some(404),
            ClientError::Conflict(_) => Some(409),
            ClientError::Server { code, .. } | ClientError::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, ClientError::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, ClientError::Conflict(_)) }
}
