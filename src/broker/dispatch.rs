//! Delivery of server messages to plugins

use crate::exchange::MessageDispatcher;
use crate::protocol::{message_type, Message, OperationResult, OperationStatus};
use crate::registry::ClientRegistry;
use crate::store::MessageStore;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Name used when the broker reports on its own behalf
pub const CLIENT_NAME: &str = "mgmt-broker";

/// Offers server messages to every registered client
///
/// An operation nobody handled is answered with a failed
/// `operation-result` so the server does not wait on it forever.
pub struct ClientDispatcher {
    registry: Arc<ClientRegistry>,
    store: Arc<MessageStore>,
}

impl ClientDispatcher {
    pub fn new(registry: Arc<ClientRegistry>, store: Arc<MessageStore>) -> Self {
        Self { registry, store }
    }

    fn report_unhandled(&self, message: &Message, kind: &str) {
        let Some(operation_id) = message.get("operation-id") else {
            return;
        };

        let result = OperationResult {
            operation_id: operation_id.clone(),
            status: OperationStatus::Failed,
            result_text: unhandled_text(kind),
        };

        let queued = self
            .store
            .get_session_id()
            .and_then(|session| self.store.add_with(result.into_message(), Some(&session), true));
        match queued {
            Ok(id) => info!(operation_id = %operation_id, sequence = %id, "Queued failed operation result"),
            Err(e) => error!(operation_id = %operation_id, error = %e, "Could not queue operation result"),
        }
    }
}

fn unhandled_text(kind: &str) -> String {
    format!(
        "{CLIENT_NAME} failed to handle this request ({kind}) because the plugin which \
         should handle it isn't available. This could mean that the plugin has been \
         intentionally disabled, or that the client isn't running properly, or you may \
         be running an older version of the client that doesn't support this feature."
    )
}

#[async_trait]
impl MessageDispatcher for ClientDispatcher {
    async fn dispatch(&self, message: &Message) -> bool {
        if self.registry.dispatch_message(message).await {
            return true;
        }

        let kind = message_type(message).unwrap_or("<untyped>");
        info!("Nobody handled the {kind} message.");
        self.report_unhandled(message, kind);
        false
    }

    async fn impending_exchange(&self) {
        if let Err(e) = self.registry.broadcast_event("impending-exchange", &[]).await {
            warn!(error = %e, "Client failed handling impending exchange");
        }
    }
}
