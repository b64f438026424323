//! Durable outbound message queue
//!
//! The store owns every message a plugin submitted until the server
//! acknowledges it, together with the session, accepted-types and identity
//! bookkeeping that must survive a restart.

pub mod message_store;

pub use message_store::{Identity, MessageId, MessageStore, PendingMessage};

use thiserror::Error;

/// Message store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Message submitted without a session id")]
    MissingSession,

    #[error("Message submitted with a stale session id")]
    WrongSession,

    #[error("Message type '{0}' is not accepted by the server")]
    NotAccepted(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Corrupt store entry '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

impl StoreError {
    /// Whether the message was discarded rather than the store failing
    pub fn is_dropped_message(&self) -> bool {
        matches!(self, StoreError::WrongSession | StoreError::NotAccepted(_))
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
