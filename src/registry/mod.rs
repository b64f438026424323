//! Plugin-facing contracts and the client registry
//!
//! A plugin is reached through a named [`Connector`] factory. Connecting
//! yields a [`BrokerClient`], the handle the broker uses to deliver server
//! messages and lifecycle events and to shut the plugin down.

pub mod client_registry;

pub use client_registry::{ClientRegistry, RegisteredClient};

use crate::broker::BrokerHandle;
use crate::config::BrokerConfig;
use crate::protocol::Message;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by plugins and their connectors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ClientError {
    #[error("Failed to connect client '{name}': {reason}")]
    ConnectFailed { name: String, reason: String },

    #[error("Client '{name}' failed to exit: {reason}")]
    ExitFailed { name: String, reason: String },

    #[error("Client '{name}' failed handling event '{event}': {reason}")]
    EventFailed {
        name: String,
        event: String,
        reason: String,
    },

    #[error("Client '{name}' failed handling message: {reason}")]
    MessageFailed { name: String, reason: String },
}

impl ClientError {
    pub fn connect_failed<N: Into<String>, R: Into<String>>(name: N, reason: R) -> Self {
        Self::ConnectFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn exit_failed<N: Into<String>, R: Into<String>>(name: N, reason: R) -> Self {
        Self::ExitFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn event_failed<N: Into<String>, E: Into<String>, R: Into<String>>(
        name: N,
        event: E,
        reason: R,
    ) -> Self {
        Self::EventFailed {
            name: name.into(),
            event: event.into(),
            reason: reason.into(),
        }
    }

    pub fn message_failed<N: Into<String>, R: Into<String>>(name: N, reason: R) -> Self {
        Self::MessageFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// A connected plugin as seen by the broker
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Registered name of the plugin
    fn name(&self) -> &str;

    /// Offer a server message. Returns whether the plugin handled it.
    async fn message(&self, message: &Message) -> Result<bool, ClientError>;

    /// Deliver a lifecycle event
    async fn fire_event(&self, event: &str, args: &[Value]) -> Result<Value, ClientError>;

    /// Shut the plugin down
    async fn exit(&self) -> Result<(), ClientError>;
}

/// Establishes the connection to one plugin
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerClient>, ClientError>;
}

/// What a connector factory is given to build its connector
#[derive(Clone)]
pub struct ConnectorContext {
    pub config: BrokerConfig,
    pub broker: BrokerHandle,
}

/// Builds a connector for a named plugin
pub type ConnectorFactory = Arc<dyn Fn(&ConnectorContext) -> Arc<dyn Connector> + Send + Sync>;
