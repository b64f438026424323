//! Transport layer for talking to the management server
//!
//! Two seams: [`Transport`] performs a full message exchange and
//! [`PingClient`] performs the cheap liveness check that gates it. Both are
//! traits so the exchanger can be driven by mocks in tests; `http` holds the
//! reqwest-backed implementations.

use crate::protocol::{ExchangePayload, ExchangeResponse};
use serde::Deserialize;
use thiserror::Error;

pub mod http;
pub mod ping;

pub use http::{HttpPingClient, HttpTransport};
pub use ping::{PingChecker, PingOutcome};

/// Transport errors
///
/// None of these are fatal: the exchanger keeps the messages and retries on
/// its normal cadence.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Server returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode server response: {0}")]
    Decode(String),
}

/// Per-exchange request context
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExchangeContext {
    /// Secure id assigned at registration, absent before that
    pub secure_id: Option<String>,
}

/// Transport trait for message exchanges
///
/// One call is one round trip: upload the payload, return the server's
/// response.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn exchange(
        &self,
        payload: &ExchangePayload,
        context: &ExchangeContext,
    ) -> Result<ExchangeResponse, TransportError>;
}

/// Body of a ping response
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PingResponse {
    /// Server has messages queued for this computer
    #[serde(default)]
    pub messages: bool,
}

/// Liveness check against the server's ping endpoint
#[async_trait::async_trait]
pub trait PingClient: Send + Sync {
    async fn ping(&self, url: &str, insecure_id: &str) -> Result<PingResponse, TransportError>;
}
