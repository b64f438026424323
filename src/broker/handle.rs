//! What a plugin holds to talk to the broker

use crate::error::{BrokerError, BrokerResult};
use crate::exchange::Exchanger;
use crate::protocol::{message_type, Message};
use crate::store::{MessageId, MessageStore, StoreError};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Cloneable handle onto the broker's message path
///
/// Holds the exchanger weakly so plugins never keep the broker alive.
#[derive(Clone)]
pub struct BrokerHandle {
    store: Arc<MessageStore>,
    exchanger: Weak<Exchanger>,
}

impl BrokerHandle {
    pub fn new(store: Arc<MessageStore>, exchanger: &Arc<Exchanger>) -> Self {
        Self {
            store,
            exchanger: Arc::downgrade(exchanger),
        }
    }

    /// A handle with no exchanger behind it; messages queue but never
    /// trigger an exchange
    pub fn detached(store: Arc<MessageStore>) -> Self {
        Self {
            store,
            exchanger: Weak::new(),
        }
    }

    pub fn get_session_id(&self) -> BrokerResult<String> {
        Ok(self.store.get_session_id()?)
    }

    /// Queue a message for the server
    ///
    /// Returns `Ok(None)` when the message was discarded because its session
    /// is stale or its type is not accepted. A missing session is a caller
    /// bug and is returned as [`BrokerError::MissingSession`].
    pub fn send_message(
        &self,
        message: Message,
        session_id: Option<&str>,
        urgent: bool,
    ) -> BrokerResult<Option<MessageId>> {
        let kind = message_type(&message).unwrap_or("<untyped>").to_string();
        match self.store.add_with(message, session_id, urgent) {
            Ok(id) => {
                if urgent {
                    self.request_urgent_exchange();
                }
                Ok(Some(id))
            }
            Err(StoreError::MissingSession) => Err(BrokerError::MissingSession),
            Err(e) if e.is_dropped_message() => {
                debug!(message_type = %kind, reason = %e, "Message discarded");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_message_pending(&self, id: MessageId) -> BrokerResult<bool> {
        Ok(self.store.is_pending(id)?)
    }

    /// Message types the server currently accepts, sorted
    pub fn get_accepted_message_types(&self) -> BrokerResult<Vec<String>> {
        Ok(self.store.get_accepted_types()?.into_iter().collect())
    }

    pub fn accepts(&self, message_type: &str) -> BrokerResult<bool> {
        Ok(self.store.accepts(message_type)?)
    }

    pub fn get_server_uuid(&self) -> BrokerResult<Option<String>> {
        Ok(self.store.get_server_uuid()?)
    }

    /// Declare a server message type the caller handles
    pub fn register_client_accepted_message_type(&self, message_type: &str) {
        if let Some(exchanger) = self.exchanger.upgrade() {
            exchanger.register_client_accepted_message_type(message_type);
        }
    }

    pub fn request_urgent_exchange(&self) {
        if let Some(exchanger) = self.exchanger.upgrade() {
            exchanger.request_urgent();
        }
    }
}

impl std::fmt::Debug for BrokerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerHandle")
            .field("attached", &(self.exchanger.strong_count() > 0))
            .finish()
    }
}
