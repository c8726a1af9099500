//! Error types for the tool bridge

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use thiserror::Error;

/// Crate-wide error type
///
/// Cloneable so a single failed startup can be handed to every caller that
/// was waiting on it.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Failed to spawn tool server: {0}")]
    Spawn(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The child answered with a Failure envelope. Displays as the remote message.
    #[error("{message}")]
    Remote {
        code: Option<i64>,
        message: String,
        data: Option<JsonValue>,
    },

    #[error("Tool server exited: {0}")]
    ProcessExited(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Bridge restarted: {0}")]
    Restarted(String),

    #[error("Bridge terminated")]
    Terminated,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for errors reported by the child itself rather than the bridge.
    pub fn is_remote(&self) -> bool {
        matches!(self, Error::Remote { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(Arc::new(err))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(format!("invalid config: {}", err))
    }
}

/// Result type alias for this crate
pub type Result<T> = std::result::Result<T, Error>;

// Host APIs hand errors straight back to their own callers
impl serde::Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
