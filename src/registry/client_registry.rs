//! Name → connector factory lookup and the set of connected clients

use super::{BrokerClient, ClientError, Connector, ConnectorContext, ConnectorFactory};
use crate::client_span;
use crate::error::{BrokerError, BrokerResult};
use crate::protocol::{message_type, Message};
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn, Instrument};

/// A plugin the broker is currently connected to
#[derive(Clone)]
pub struct RegisteredClient {
    pub name: String,
    pub client: Arc<dyn BrokerClient>,
    pub connector: Arc<dyn Connector>,
}

impl std::fmt::Debug for RegisteredClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredClient")
            .field("name", &self.name)
            .finish()
    }
}

/// Registry of connector factories and connected clients
#[derive(Default)]
pub struct ClientRegistry {
    factories: RwLock<HashMap<String, ConnectorFactory>>,
    clients: RwLock<Vec<RegisteredClient>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the name → factory table
    pub fn set_connectors_registry(&self, factories: HashMap<String, ConnectorFactory>) {
        *self
            .factories
            .write()
            .unwrap_or_else(PoisonError::into_inner) = factories;
    }

    /// Add or replace a single factory
    pub fn add_connector_factory(&self, name: impl Into<String>, factory: ConnectorFactory) {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), factory);
    }

    pub fn connector_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn snapshot(&self) -> Vec<RegisteredClient> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Connect the plugin registered under `name`
    ///
    /// Nothing is registered if connecting fails. Registering a name that is
    /// already connected replaces the old client.
    pub async fn register_client(
        &self,
        name: &str,
        context: &ConnectorContext,
    ) -> BrokerResult<Arc<dyn BrokerClient>> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::unknown_connector(name))?;

        let connector = factory(context);
        let client = connector.connect().await.map_err(|e| {
            warn!(client = name, error = %e, "Failed to connect client");
            e
        })?;

        let registered = RegisteredClient {
            name: name.to_string(),
            client: Arc::clone(&client),
            connector,
        };

        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        match clients.iter_mut().find(|c| c.name == name) {
            Some(existing) => *existing = registered,
            None => clients.push(registered),
        }
        info!(client = name, "Registered client");
        Ok(client)
    }

    pub fn unregister_client(&self, name: &str) -> Option<RegisteredClient> {
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        let index = clients.iter().position(|c| c.name == name)?;
        Some(clients.remove(index))
    }

    /// Connected clients in registration order
    pub fn get_clients(&self) -> Vec<Arc<dyn BrokerClient>> {
        self.snapshot().into_iter().map(|c| c.client).collect()
    }

    pub fn get_client(&self, name: &str) -> Option<Arc<dyn BrokerClient>> {
        self.snapshot()
            .into_iter()
            .find(|c| c.name == name)
            .map(|c| c.client)
    }

    pub fn get_connectors(&self) -> Vec<Arc<dyn Connector>> {
        self.snapshot().into_iter().map(|c| c.connector).collect()
    }

    pub fn get_connector(&self, name: &str) -> Option<Arc<dyn Connector>> {
        self.snapshot()
            .into_iter()
            .find(|c| c.name == name)
            .map(|c| c.connector)
    }

    /// Ask every client to exit
    ///
    /// Every `exit` is issued even if some fail; the first failure is
    /// returned. The registry is empty afterwards.
    pub async fn stop_clients(&self) -> Result<(), ClientError> {
        let clients = std::mem::take(&mut *self.clients.write().unwrap_or_else(PoisonError::into_inner));
        debug!(clients = clients.len(), "Stopping clients");

        let results = join_all(clients.iter().map(|c| c.client.exit())).await;

        let mut first_error = None;
        for (client, result) in clients.iter().zip(results) {
            if let Err(e) = result {
                warn!(client = %client.name, error = %e, "Client failed to exit");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Deliver an event to every client, results in registration order
    pub async fn broadcast_event(
        &self,
        event: &str,
        args: &[Value],
    ) -> Result<Vec<Value>, ClientError> {
        let clients = self.snapshot();
        let results = join_all(clients.iter().map(|c| {
            c.client
                .fire_event(event, args)
                .instrument(client_span!(client = %c.name, event = event))
        }))
        .await;
        results.into_iter().collect()
    }

    /// Offer a server message to every client
    ///
    /// Returns whether at least one client handled it. A client that fails
    /// counts as not having handled the message.
    pub async fn dispatch_message(&self, message: &Message) -> bool {
        let clients = self.snapshot();
        let kind = message_type(message).unwrap_or("<untyped>");
        let results = join_all(clients.iter().map(|c| {
            c.client
                .message(message)
                .instrument(client_span!(client = %c.name, message_type = kind))
        }))
        .await;

        let mut handled = false;
        for (client, result) in clients.iter().zip(results) {
            match result {
                Ok(true) => handled = true,
                Ok(false) => {}
                Err(e) => warn!(
                    client = %client.name,
                    message_type = kind,
                    error = %e,
                    "Client failed handling message"
                ),
            }
        }
        handled
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("connectors", &self.connector_names())
            .field("clients", &self.snapshot())
            .finish()
    }
}
