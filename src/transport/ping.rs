//! Ping gate for the exchanger
//!
//! A ping never fails: any error or timeout is reported as "unreachable"
//! and the exchanger simply skips the cycle.

use super::{PingClient, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Result of a ping check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingOutcome {
    /// The server could not be reached
    Unreachable,
    /// The server is up and has nothing queued for us
    Idle,
    /// The server is up and wants us to exchange soon
    MessagesWaiting,
}

impl PingOutcome {
    pub fn is_reachable(self) -> bool {
        !matches!(self, PingOutcome::Unreachable)
    }
}

/// Bounded liveness check in front of every exchange
pub struct PingChecker {
    client: Arc<dyn PingClient>,
    timeout: Duration,
}

impl PingChecker {
    pub fn new(client: Arc<dyn PingClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Ping `url` with the computer's insecure id
    pub async fn check(&self, url: &str, insecure_id: &str) -> PingOutcome {
        let result = tokio::time::timeout(self.timeout, self.client.ping(url, insecure_id))
            .await
            .unwrap_or(Err(TransportError::Timeout(self.timeout)));

        match result {
            Ok(response) if response.messages => {
                debug!(url = %url, "Ping reports messages waiting");
                PingOutcome::MessagesWaiting
            }
            Ok(_) => {
                debug!(url = %url, "Ping succeeded");
                PingOutcome::Idle
            }
            Err(TransportError::Timeout(after)) => {
                warn!(url = %url, timeout = ?after, "Ping timed out");
                PingOutcome::Unreachable
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Ping failed");
                PingOutcome::Unreachable
            }
        }
    }

    /// Whether the server answered the ping
    pub async fn ping(&self, url: &str, insecure_id: &str) -> bool {
        self.check(url, insecure_id).await.is_reachable()
    }
}
