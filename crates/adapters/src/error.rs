use reqwest::StatusCode;
use thiserror::Error;

use story_core::transport::{TransportError, TransportErrorKind};

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to parse response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid adapter configuration: {0}")]
    InvalidConfig(String),
    #[error("unexpected http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },
    #[error("failed to read response stream: {0}")]
    Stream(#[source] std::io::Error),
    #[error("endpoint reported an error: {0}")]
    Remote(String),
    #[error("API returned an empty response")]
    EmptyResponse,
}

impl AdapterError {
    pub fn kind(&self) -> TransportErrorKind {
        match self {
            AdapterError::Http(err) if err.is_timeout() => TransportErrorKind::Timeout,
            AdapterError::Http(err) if err.is_connect() => TransportErrorKind::Connect,
            AdapterError::Http(err) if err.is_decode() || err.is_body() => {
                TransportErrorKind::Malformed
            }
            AdapterError::Http(_) => TransportErrorKind::Other,
            AdapterError::Json(_) | AdapterError::EmptyResponse => TransportErrorKind::Malformed,
            AdapterError::HttpStatus { status, .. } if *status == StatusCode::TOO_MANY_REQUESTS => {
                TransportErrorKind::RateLimited
            }
            AdapterError::HttpStatus { status, .. } => TransportErrorKind::Status(status.as_u16()),
            AdapterError::Stream(err) if err.kind() == std::io::ErrorKind::TimedOut => {
                TransportErrorKind::Timeout
            }
            AdapterError::Stream(_) => TransportErrorKind::Connect,
            AdapterError::Remote(_) | AdapterError::InvalidConfig(_) => TransportErrorKind::Other,
        }
    }
}

impl From<AdapterError> for TransportError {
    fn from(err: AdapterError) -> Self {
        let kind = err.kind();
        let message = err.to_string();
        TransportError::with_source(kind, message, err)
    }
}
