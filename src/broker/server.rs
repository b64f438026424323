//! The broker coordinator
//!
//! Owns the store, the exchanger, the client registry and the event bus,
//! and is the single entry point plugins and the binary talk to.

use super::dispatch::ClientDispatcher;
use super::handle::BrokerHandle;
use crate::config::BrokerConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::events::{EventBus, EventWait};
use crate::exchange::{ExchangeSettings, Exchanger};
use crate::lifecycle_span;
use crate::protocol::{message_from_value, Message};
use crate::registry::{
    BrokerClient, ClientRegistry, Connector, ConnectorContext, ConnectorFactory,
};
use crate::store::{MessageId, MessageStore};
use crate::system;
use crate::transport::{
    HttpPingClient, HttpTransport, PingChecker, PingClient, Transport,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

/// Bus events forwarded to every client, with the name clients see
///
/// `impending-exchange` is not bridged: the exchanger awaits it through
/// [`ClientDispatcher`] so client data joins the upload it announces.
const BRIDGED_EVENTS: [(&str, &str); 4] = [
    ("resynchronize-clients", "resynchronize"),
    ("server-uuid-changed", "server-uuid-changed"),
    ("message-type-acceptance-changed", "message-type-acceptance-changed"),
    ("package-data-changed", "package-data-changed"),
];

/// Broker coordinator
pub struct BrokerServer {
    config: RwLock<BrokerConfig>,
    config_path: Option<PathBuf>,
    store: Arc<MessageStore>,
    exchanger: Arc<Exchanger>,
    registry: Arc<ClientRegistry>,
    events: EventBus,
    handle: BrokerHandle,
    running: watch::Sender<bool>,
}

impl BrokerServer {
    /// Assemble a broker from its collaborators
    pub fn new(
        config: BrokerConfig,
        config_path: Option<PathBuf>,
        store: Arc<MessageStore>,
        transport: Arc<dyn Transport>,
        ping_client: Arc<dyn PingClient>,
    ) -> Arc<Self> {
        let events = EventBus::new();
        let registry = Arc::new(ClientRegistry::new());
        let dispatcher = Arc::new(ClientDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&store),
        ));
        let exchanger = Exchanger::new(
            Arc::clone(&store),
            transport,
            PingChecker::new(ping_client, config.exchange.ping_timeout()),
            events.clone(),
            dispatcher,
            ExchangeSettings::from_config(&config.exchange),
        );
        let handle = BrokerHandle::new(Arc::clone(&store), &exchanger);

        for (bus_event, client_event) in BRIDGED_EVENTS {
            bridge_to_clients(&events, &registry, bus_event, client_event);
        }

        let (running, _) = watch::channel(true);
        Arc::new(Self {
            config: RwLock::new(config),
            config_path,
            store,
            exchanger,
            registry,
            events,
            handle,
            running,
        })
    }

    /// Build a broker talking HTTP to the configured server, with its store
    /// under the configured data path
    pub fn open(config: BrokerConfig, config_path: Option<PathBuf>) -> BrokerResult<Arc<Self>> {
        let store = Arc::new(MessageStore::open(&config.client.data_path)?);
        let transport = Arc::new(HttpTransport::new(
            config.exchange.url.clone(),
            config.exchange.exchange_timeout(),
        )?);
        let ping_client = Arc::new(HttpPingClient::new(config.exchange.ping_timeout())?);
        Ok(Self::new(config, config_path, store, transport, ping_client))
    }

    // Accessors

    pub fn config(&self) -> BrokerConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn exchanger(&self) -> &Arc<Exchanger> {
        &self.exchanger
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn handle(&self) -> BrokerHandle {
        self.handle.clone()
    }

    // Messages

    /// Always true while the broker answers at all
    pub fn ping(&self) -> bool {
        true
    }

    pub fn get_session_id(&self) -> BrokerResult<String> {
        self.handle.get_session_id()
    }

    pub fn send_message(
        &self,
        message: Message,
        session_id: Option<&str>,
        urgent: bool,
    ) -> BrokerResult<Option<MessageId>> {
        self.handle.send_message(message, session_id, urgent)
    }

    pub fn is_message_pending(&self, id: MessageId) -> BrokerResult<bool> {
        self.handle.is_message_pending(id)
    }

    // Clients

    pub fn set_connectors_registry(&self, factories: HashMap<String, ConnectorFactory>) {
        self.registry.set_connectors_registry(factories);
    }

    /// Connect the plugin whose connector is registered under `name`
    pub async fn register_client(&self, name: &str) -> BrokerResult<Arc<dyn BrokerClient>> {
        let context = ConnectorContext {
            config: self.config(),
            broker: self.handle(),
        };
        self.registry.register_client(name, &context).await
    }

    pub fn get_clients(&self) -> Vec<Arc<dyn BrokerClient>> {
        self.registry.get_clients()
    }

    pub fn get_client(&self, name: &str) -> Option<Arc<dyn BrokerClient>> {
        self.registry.get_client(name)
    }

    pub fn get_connectors(&self) -> Vec<Arc<dyn Connector>> {
        self.registry.get_connectors()
    }

    pub fn get_connector(&self, name: &str) -> Option<Arc<dyn Connector>> {
        self.registry.get_connector(name)
    }

    pub async fn stop_clients(&self) -> BrokerResult<()> {
        Ok(self.registry.stop_clients().await?)
    }

    // Accepted types

    /// Message types the server accepts from us, sorted
    pub fn get_accepted_message_types(&self) -> BrokerResult<Vec<String>> {
        self.handle.get_accepted_message_types()
    }

    /// Message types our clients accept from the server, sorted
    pub fn get_client_accepted_message_types(&self) -> Vec<String> {
        self.exchanger.get_client_accepted_message_types()
    }

    /// Returns false if the type was already registered
    pub fn register_client_accepted_message_type(&self, message_type: &str) -> bool {
        self.exchanger
            .register_client_accepted_message_type(message_type)
    }

    pub fn get_server_uuid(&self) -> BrokerResult<Option<String>> {
        self.handle.get_server_uuid()
    }

    // Registration and configuration

    /// Register this computer with the server
    ///
    /// Resolves once the server answers with `set-id` (success) or
    /// `registration-failed`; stays pending until then.
    pub async fn register(&self) -> BrokerResult<()> {
        let span = lifecycle_span!(event = "register");
        async {
            let outcome = self
                .events
                .listen_events(&["registration-done", "registration-failed"]);

            let config = self.config();
            let message = message_from_value(json!({
                "type": "register",
                "computer-title": config.client.computer_title,
                "account-name": config.client.account_name,
                "hostname": system::hostname(),
            }));
            self.store.add_unchecked(message, true)?;
            self.exchanger.request_urgent();
            info!("Registration requested");

            match outcome.await {
                Some(event) if event.name == "registration-done" => {
                    info!("Registration succeeded");
                    Ok(())
                }
                Some(_) => {
                    warn!("Registration failed");
                    Err(BrokerError::RegistrationFailed)
                }
                None => Err(BrokerError::internal_error(
                    "event bus closed while waiting for registration",
                )),
            }
        }
        .instrument(span)
        .await
    }

    /// Stop every client and reread the configuration file
    ///
    /// The caller is responsible for registering clients again.
    pub async fn reload_configuration(&self) -> BrokerResult<()> {
        let stopped = self.registry.stop_clients().await;

        if let Some(ref path) = self.config_path {
            let config = BrokerConfig::load_from_file(path)?;
            self.exchanger
                .update_settings(ExchangeSettings::from_config(&config.exchange));
            *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
            info!(path = %path.display(), "Configuration reloaded");
        } else {
            debug!("No configuration file to reload");
        }

        Ok(stopped?)
    }

    // Events

    /// Fire `name` on the broker's own bus
    pub fn fire_event(&self, name: &str, args: &[Value]) -> Vec<Value> {
        self.events.fire(name, args)
    }

    /// Resolve on whichever of `names` fires first
    pub fn listen_events<S: AsRef<str>>(&self, names: &[S]) -> EventWait {
        self.events.listen_events(names)
    }

    /// Deliver an event to every client
    pub async fn broadcast_event(&self, event: &str, args: &[Value]) -> BrokerResult<Vec<Value>> {
        let span = lifecycle_span!(event = event, clients = self.registry.get_clients().len());
        Ok(self
            .registry
            .broadcast_event(event, args)
            .instrument(span)
            .await?)
    }

    pub async fn resynchronize(&self, scopes: Value) -> BrokerResult<Vec<Value>> {
        self.broadcast_event("resynchronize", &[scopes]).await
    }

    pub async fn impending_exchange(&self) -> BrokerResult<Vec<Value>> {
        self.broadcast_event("impending-exchange", &[]).await
    }

    pub async fn broker_reconnect(&self) -> BrokerResult<Vec<Value>> {
        self.broadcast_event("broker-reconnect", &[]).await
    }

    pub async fn server_uuid_changed(
        &self,
        old_uuid: Option<&str>,
        new_uuid: Option<&str>,
    ) -> BrokerResult<Vec<Value>> {
        self.broadcast_event("server-uuid-changed", &[json!(old_uuid), json!(new_uuid)])
            .await
    }

    pub async fn message_type_acceptance_changed(
        &self,
        message_type: &str,
        accepted: bool,
    ) -> BrokerResult<Vec<Value>> {
        self.broadcast_event(
            "message-type-acceptance-changed",
            &[json!(message_type), json!(accepted)],
        )
        .await
    }

    pub async fn package_data_changed(&self) -> BrokerResult<Vec<Value>> {
        self.broadcast_event("package-data-changed", &[]).await
    }

    // Lifecycle

    /// Arm the periodic exchange timer
    pub fn start_exchanger(&self) {
        self.exchanger.schedule_exchange();
    }

    /// Stop exchanging and pinging
    pub fn stop_exchanger(&self) {
        self.exchanger.stop();
    }

    /// Shut the broker down
    ///
    /// The broker stops running even if a client fails to exit; that
    /// failure is still returned.
    pub async fn exit(&self) -> BrokerResult<()> {
        let span = lifecycle_span!(event = "exit");
        async {
            info!("Broker exiting");
            self.events.fire("pre-exit", &[]);
            self.stop_exchanger();
            let stopped = self.registry.stop_clients().await;
            if let Err(e) = self.store.flush().await {
                warn!(error = %e, "Failed to flush message store on exit");
            }
            self.running.send_replace(false);
            info!("Broker stopped");
            Ok(stopped?)
        }
        .instrument(span)
        .await
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Resolve once [`BrokerServer::exit`] has run
    pub async fn wait_stopped(&self) {
        let mut running = self.running.subscribe();
        // The sender lives in self, so the channel cannot close here
        let _ = running.wait_for(|running| !*running).await;
    }
}

/// Forward a bus event to every client without blocking the bus
fn bridge_to_clients(
    events: &EventBus,
    registry: &Arc<ClientRegistry>,
    bus_event: &'static str,
    client_event: &'static str,
) {
    let registry = Arc::clone(registry);
    events.call_on(bus_event, move |args| {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(event = client_event, "No runtime to forward event to clients");
            return Value::Null;
        };
        let registry = Arc::clone(&registry);
        let args = args.to_vec();
        runtime.spawn(async move {
            if let Err(e) = registry.broadcast_event(client_event, &args).await {
                warn!(event = client_event, error = %e, "Client failed handling event");
            }
        });
        Value::Null
    });
}

impl std::fmt::Debug for BrokerServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerServer")
            .field("config_path", &self.config_path)
            .field("running", &self.is_running())
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{mock_factory, MockClient, MockPingClient, MockTransport};

    fn broker() -> Arc<BrokerServer> {
        let store = Arc::new(MessageStore::temporary().unwrap());
        BrokerServer::new(
            BrokerConfig::test_config(),
            None,
            store,
            Arc::new(MockTransport::new()),
            Arc::new(MockPingClient::new()),
        )
    }

    #[test]
    fn test_ping() {
        assert!(broker().ping());
    }

    #[test]
    fn test_starts_running() {
        let broker = broker();
        assert!(broker.is_running());
        assert!(format!("{broker:?}").contains("running: true"));
    }

    #[tokio::test]
    async fn test_bridged_event_reaches_clients() {
        let broker = broker();
        let client = Arc::new(MockClient::new("foo"));
        broker
            .registry()
            .add_connector_factory("foo", mock_factory(client.clone()));
        broker.register_client("foo").await.unwrap();

        broker.fire_event("resynchronize-clients", &[json!(["package"])]);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            client.get_events().await,
            vec![("resynchronize".to_string(), vec![json!(["package"])])]
        );
    }

    #[test]
    fn test_bridge_without_runtime_is_harmless() {
        let broker = broker();
        assert_eq!(broker.fire_event("package-data-changed", &[]), vec![Value::Null]);
    }

    #[tokio::test]
    async fn test_exit_stops_exchanger() {
        let broker = broker();
        broker.start_exchanger();
        broker.exit().await.unwrap();
        assert!(broker.exchanger().is_stopped());
        assert!(!broker.is_running());
        broker.wait_stopped().await;
    }
}
