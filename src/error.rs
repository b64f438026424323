//! Error types for broker operations
//!
//! Each layer owns its own error enum (`StoreError`, `TransportError`,
//! `ClientError`, `ConfigError`); `BrokerError` is the umbrella the
//! coordinator surfaces to callers.

use crate::config::ConfigError;
use crate::registry::ClientError;
use crate::store::StoreError;
use crate::transport::TransportError;
use thiserror::Error;

/// Main error type for broker operations
#[derive(Debug, Error)]
pub enum BrokerError {
    /// A message was sent without first obtaining a session id.
    ///
    /// This is a programming error in the caller, not a runtime condition.
    #[error("Message sent without a session id; call get_session_id() first")]
    MissingSession,

    #[error("Message store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("No connector registered under the name '{0}'")]
    UnknownConnector(String),

    #[error("Registration with the server failed")]
    RegistrationFailed,

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl BrokerError {
    /// Create internal error
    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Create unknown connector error
    pub fn unknown_connector<S: Into<String>>(name: S) -> Self {
        Self::UnknownConnector(name.into())
    }

    /// Whether the error indicates a bug in the caller rather than a runtime failure
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            BrokerError::MissingSession | BrokerError::Store(StoreError::MissingSession)
        )
    }
}

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;
