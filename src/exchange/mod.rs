//! Exchange scheduling and execution
//!
//! The exchanger moves queued messages to the server and server messages to
//! the broker, on a periodic timer that urgent requests can shorten.

pub mod exchanger;
pub mod schedule;

pub use exchanger::Exchanger;
pub use schedule::{ExchangePhase, Intervals};

use crate::config::ExchangeSection;
use crate::protocol::Message;
use async_trait::async_trait;
use std::time::Duration;

/// Runtime-adjustable exchange settings
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeSettings {
    pub ping_url: Option<String>,
    pub intervals: Intervals,
    pub max_messages: usize,
    pub exchange_timeout: Duration,
}

impl ExchangeSettings {
    pub fn from_config(section: &ExchangeSection) -> Self {
        Self {
            ping_url: section.ping_url.clone(),
            intervals: Intervals {
                exchange: section.exchange_interval(),
                urgent: section.urgent_exchange_interval(),
            },
            max_messages: section.max_messages_per_exchange,
            exchange_timeout: section.exchange_timeout(),
        }
    }
}

/// What happened when an exchange was requested
#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeOutcome {
    /// A round trip finished
    Completed { sent: usize, received: usize },
    /// A cycle was already running; it will run once more when done
    Merged,
    /// The exchanger is stopped
    Stopped,
    /// The ping gate was closed; nothing was sent
    Unreachable,
    /// The round trip failed; messages stay queued
    Failed(String),
}

impl ExchangeOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, ExchangeOutcome::Completed { .. })
    }
}

/// Receives server messages the exchanger does not handle itself
#[async_trait]
pub trait MessageDispatcher: Send + Sync {
    /// Returns whether someone handled the message
    async fn dispatch(&self, message: &Message) -> bool;

    /// Awaited at the start of every cycle, before anything is gathered,
    /// so messages queued here go out with that cycle
    async fn impending_exchange(&self) {}
}
