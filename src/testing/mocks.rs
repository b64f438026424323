//! Mock implementations for testing
//!
//! Provides mock Transport, PingClient, MessageDispatcher and plugin
//! implementations so the broker can be exercised without a server.

use crate::exchange::MessageDispatcher;
use crate::protocol::{message_type, ExchangePayload, ExchangeResponse, Message};
use crate::registry::{BrokerClient, ClientError, Connector, ConnectorContext, ConnectorFactory};
use crate::transport::{ExchangeContext, PingClient, PingResponse, Transport, TransportError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Mock exchange transport
///
/// Records every payload. Responds with queued responses in order, then
/// with a response acknowledging everything it was sent.
#[derive(Debug, Default)]
pub struct MockTransport {
    pub payloads: Arc<Mutex<Vec<ExchangePayload>>>,
    pub contexts: Arc<Mutex<Vec<ExchangeContext>>>,
    pub responses: Arc<Mutex<VecDeque<ExchangeResponse>>>,
    pub should_fail: AtomicBool,
    pub delay: Option<Duration>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: AtomicBool::new(true),
            ..Default::default()
        }
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..self
        }
    }

    pub fn set_failure(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }

    pub async fn queue_response(&self, response: ExchangeResponse) {
        self.responses.lock().await.push_back(response);
    }

    pub async fn get_payloads(&self) -> Vec<ExchangePayload> {
        self.payloads.lock().await.clone()
    }

    pub async fn get_contexts(&self) -> Vec<ExchangeContext> {
        self.contexts.lock().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.payloads.lock().await.len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn exchange(
        &self,
        payload: &ExchangePayload,
        context: &ExchangeContext,
    ) -> Result<ExchangeResponse, TransportError> {
        self.payloads.lock().await.push(payload.clone());
        self.contexts.lock().await.push(context.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.should_fail.load(Ordering::SeqCst) {
            return Err(TransportError::Network("Mock exchange failure".to_string()));
        }

        match self.responses.lock().await.pop_front() {
            Some(response) => Ok(response),
            None => Ok(ExchangeResponse {
                next_expected_sequence: Some(payload.sequence + payload.messages.len() as u64),
                ..Default::default()
            }),
        }
    }
}

/// Mock ping client
#[derive(Debug, Default)]
pub struct MockPingClient {
    pub calls: Arc<Mutex<Vec<(String, String)>>>,
    pub should_fail: bool,
    pub messages_waiting: bool,
    pub delay: Option<Duration>,
}

impl MockPingClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub fn with_messages_waiting() -> Self {
        Self {
            messages_waiting: true,
            ..Default::default()
        }
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..self
        }
    }

    pub async fn get_calls(&self) -> Vec<(String, String)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl PingClient for MockPingClient {
    async fn ping(&self, url: &str, insecure_id: &str) -> Result<PingResponse, TransportError> {
        self.calls
            .lock()
            .await
            .push((url.to_string(), insecure_id.to_string()));

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.should_fail {
            return Err(TransportError::Network("Mock ping failure".to_string()));
        }
        Ok(PingResponse {
            messages: self.messages_waiting,
        })
    }
}

/// Dispatcher that records messages and reports a fixed result
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    pub messages: Arc<Mutex<Vec<Message>>>,
    pub handled: bool,
    pub announcements: Arc<AtomicUsize>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_messages(&self) -> Vec<Message> {
        self.messages.lock().await.clone()
    }

    /// How many cycles announced an impending exchange
    pub fn announcement_count(&self) -> usize {
        self.announcements.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageDispatcher for RecordingDispatcher {
    async fn dispatch(&self, message: &Message) -> bool {
        self.messages.lock().await.push(message.clone());
        self.handled
    }

    async fn impending_exchange(&self) {
        self.announcements.fetch_add(1, Ordering::SeqCst);
    }
}

/// Mock plugin
///
/// Handles the message types given to [`MockClient::handling`], answers
/// every event with a fixed value and optionally fails on exit.
#[derive(Debug)]
pub struct MockClient {
    name: String,
    pub messages: Arc<Mutex<Vec<Message>>>,
    pub events: Arc<Mutex<Vec<(String, Vec<Value>)>>>,
    pub exits: Arc<Mutex<usize>>,
    handled_types: Vec<String>,
    event_result: Value,
    exit_failure: bool,
}

impl MockClient {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            messages: Arc::default(),
            events: Arc::default(),
            exits: Arc::default(),
            handled_types: Vec::new(),
            event_result: Value::Null,
            exit_failure: false,
        }
    }

    pub fn handling(self, types: &[&str]) -> Self {
        Self {
            handled_types: types.iter().map(|t| t.to_string()).collect(),
            ..self
        }
    }

    pub fn with_event_result(self, result: Value) -> Self {
        Self {
            event_result: result,
            ..self
        }
    }

    pub fn with_exit_failure(self) -> Self {
        Self {
            exit_failure: true,
            ..self
        }
    }

    pub async fn get_messages(&self) -> Vec<Message> {
        self.messages.lock().await.clone()
    }

    pub async fn get_events(&self) -> Vec<(String, Vec<Value>)> {
        self.events.lock().await.clone()
    }

    pub async fn exit_count(&self) -> usize {
        *self.exits.lock().await
    }
}

#[async_trait]
impl BrokerClient for MockClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn message(&self, message: &Message) -> Result<bool, ClientError> {
        self.messages.lock().await.push(message.clone());
        Ok(message_type(message).is_some_and(|t| self.handled_types.iter().any(|h| h == t)))
    }

    async fn fire_event(&self, event: &str, args: &[Value]) -> Result<Value, ClientError> {
        self.events
            .lock()
            .await
            .push((event.to_string(), args.to_vec()));
        Ok(self.event_result.clone())
    }

    async fn exit(&self) -> Result<(), ClientError> {
        *self.exits.lock().await += 1;
        if self.exit_failure {
            return Err(ClientError::exit_failed(&self.name, "Mock exit failure"));
        }
        Ok(())
    }
}

struct MockConnector {
    client: Arc<MockClient>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerClient>, ClientError> {
        Ok(Arc::clone(&self.client) as Arc<dyn BrokerClient>)
    }
}

struct FailingConnector {
    name: String,
    reason: String,
}

#[async_trait]
impl Connector for FailingConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerClient>, ClientError> {
        Err(ClientError::connect_failed(&self.name, &self.reason))
    }
}

/// Factory whose connector always yields `client`
pub fn mock_factory(client: Arc<MockClient>) -> ConnectorFactory {
    Arc::new(move |_context: &ConnectorContext| {
        Arc::new(MockConnector {
            client: Arc::clone(&client),
        }) as Arc<dyn Connector>
    })
}

/// Factory whose connector always fails to connect
pub fn failing_factory(name: &str, reason: &str) -> ConnectorFactory {
    let name = name.to_string();
    let reason = reason.to_string();
    Arc::new(move |_context: &ConnectorContext| {
        Arc::new(FailingConnector {
            name: name.clone(),
            reason: reason.clone(),
        }) as Arc<dyn Connector>
    })
}
