//! Error types for SKEIN operations

use thiserror::Error;

/// Errors surfaced by client operations.
///
/// `Clone` because one outbound read may settle many waiters at once.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// Transport failure: no response was received.
    #[error("Network error: {0}")]
    Network(String),

    /// A well-formed failure response.
    #[error("HTTP error: status {status}")]
    Http { status: u16 },

    /// The server answered 401. Session expiry has already run when this is returned.
    #[error("Session expired")]
    AuthExpired,

    /// Deliberately unsupported combination, failed fast.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// The response body could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The operation was cancelled by the caller.
    #[error("Operation aborted")]
    Aborted,

    #[error("Config error: {0}")]
    Config(String),
}

impl ClientError {
    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status } => Some(*status),
            Self::AuthExpired => Some(401),
            _ => None,
        }
    }

    /// True for `Http { status: 404 }`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Http { status: 404 })
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Result type alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or SKEIN_CONFIG)")]
    MissingConfigPath,
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Errors raised by persistent storage adapters.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

// =============================================================================
// TESTS
// =============================================================================
