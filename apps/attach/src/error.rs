use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("invalid server url '{url}': {reason}")]
    InvalidServer { url: String, reason: String },
    #[error("{0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timed out while {0}")]
    Timeout(&'static str),
    #[error("credential store error: {0}")]
    Credential(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl AttachError {
    /// Maps an HTTP status plus the server's error message onto a variant.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => AttachError::Unauthorized(format!(
                "credential rejected ({message}); run `attach login` with a fresh token"
            )),
            403 => AttachError::Forbidden(message),
            404 => AttachError::NotFound(message),
            _ => AttachError::Status { status, message },
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, AttachError::Unauthorized(_))
    }
}

impl From<toml::de::Error> for AttachError {
    fn from(value: toml::de::Error) -> Self {
        AttachError::Credential(value.to_string())
    }
}

impl From<toml::ser::Error> for AttachError {
    fn from(value: toml::ser::Error) -> Self {
        AttachError::Credential(value.to_string())
    }
}
