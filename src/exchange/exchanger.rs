//! Exchange cycle driver
//!
//! A cycle is: announce `impending-exchange`, pass the ping gate, upload the
//! pending batch, then apply the server's response (acknowledgements,
//! identity, accepted types, server messages). At most one cycle runs at a
//! time; requests that arrive meanwhile are merged into one follow-up cycle.
//!
//! Events fired on the bus:
//! - `impending-exchange`, `exchange-done`, `exchange-failed`
//! - `server-uuid-changed(old, new)`
//! - `message-type-acceptance-changed(type, accepted)`
//! - `registration-done`, `registration-failed`
//! - `resynchronize-clients(scopes)`

use super::schedule::{self, ExchangePhase};
use super::{ExchangeOutcome, ExchangeSettings, MessageDispatcher};
use crate::events::EventBus;
use crate::exchange_span;
use crate::protocol::{
    message_type, types_hash, ExchangePayload, ExchangeResponse, Message, CLIENT_API, SERVER_API,
};
use crate::store::{Identity, MessageStore, StoreResult};
use crate::transport::{ExchangeContext, PingChecker, Transport, TransportError};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

/// Server message types the broker always accepts
pub const DEFAULT_CLIENT_ACCEPTED_TYPES: [&str; 6] = [
    "accepted-types",
    "registration-failed",
    "resynchronize",
    "set-id",
    "set-intervals",
    "unknown-id",
];

#[derive(Debug)]
struct ExchangeState {
    phase: ExchangePhase,
    urgent: bool,
    last_cycle_failed: bool,
    rerun: bool,
    stopped: bool,
}

/// Schedules and runs exchanges with the server
pub struct Exchanger {
    store: Arc<MessageStore>,
    transport: Arc<dyn Transport>,
    pinger: PingChecker,
    events: EventBus,
    dispatcher: Arc<dyn MessageDispatcher>,
    settings: RwLock<ExchangeSettings>,
    state: Mutex<ExchangeState>,
    client_accepted_types: RwLock<BTreeSet<String>>,
    wakeup: Arc<Notify>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Returns the exchanger to idle however a cycle ends, including when the
/// timer task running it is aborted
struct CycleGuard<'a>(&'a Exchanger);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.0.lock_state();
        state.phase = ExchangePhase::Idle;
        state.rerun = false;
    }
}

impl Exchanger {
    pub fn new(
        store: Arc<MessageStore>,
        transport: Arc<dyn Transport>,
        pinger: PingChecker,
        events: EventBus,
        dispatcher: Arc<dyn MessageDispatcher>,
        settings: ExchangeSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            transport,
            pinger,
            events,
            dispatcher,
            settings: RwLock::new(settings),
            state: Mutex::new(ExchangeState {
                phase: ExchangePhase::Idle,
                urgent: false,
                last_cycle_failed: false,
                rerun: false,
                stopped: false,
            }),
            client_accepted_types: RwLock::new(
                DEFAULT_CLIENT_ACCEPTED_TYPES
                    .iter()
                    .map(|t| t.to_string())
                    .collect(),
            ),
            wakeup: Arc::new(Notify::new()),
            timer: Mutex::new(None),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, ExchangeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> ExchangeSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn phase(&self) -> ExchangePhase {
        self.lock_state().phase
    }

    pub fn is_urgent(&self) -> bool {
        self.lock_state().urgent
    }

    pub fn is_stopped(&self) -> bool {
        self.lock_state().stopped
    }

    /// Whether a periodic timer is armed
    pub fn is_scheduled(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn pending_delay(&self) -> std::time::Duration {
        let intervals = self.settings().intervals;
        let state = self.lock_state();
        schedule::next_delay(intervals, state.urgent, state.last_cycle_failed)
    }

    fn requested_delay(&self) -> std::time::Duration {
        let intervals = self.settings().intervals;
        schedule::next_delay(intervals, self.is_urgent(), false)
    }

    // Scheduling

    /// Arm the periodic timer, replacing any timer already armed
    pub fn schedule_exchange(self: &Arc<Self>) {
        if self.is_stopped() {
            debug!("Exchanger stopped, not scheduling");
            return;
        }

        let handle = tokio::spawn(timer_loop(Arc::downgrade(self), Arc::clone(&self.wakeup)));
        let previous = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        debug!(delay = ?self.pending_delay(), "Scheduled exchange");
    }

    /// Ask for the next exchange to happen within the urgent interval
    pub fn request_urgent(&self) {
        {
            let mut state = self.lock_state();
            if state.stopped {
                return;
            }
            state.urgent = true;
        }
        debug!("Urgent exchange requested");
        self.wakeup.notify_one();
    }

    /// Stop exchanging until [`Exchanger::restart`]
    pub fn stop(&self) {
        self.lock_state().stopped = true;
        if let Some(handle) = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        info!("Exchanger stopped");
    }

    /// Resume after [`Exchanger::stop`] and re-arm the timer
    pub fn restart(self: &Arc<Self>) {
        {
            let mut state = self.lock_state();
            state.stopped = false;
            state.last_cycle_failed = false;
        }
        info!("Exchanger restarted");
        self.schedule_exchange();
    }

    /// Replace the settings, e.g. after a configuration reload
    pub fn update_settings(&self, settings: ExchangeSettings) {
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
        self.wakeup.notify_one();
    }

    // Client accepted types

    /// Server message types some client wants, sorted
    pub fn get_client_accepted_message_types(&self) -> Vec<String> {
        self.client_accepted_types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Declare that a client handles `message_type`. Idempotent.
    pub fn register_client_accepted_message_type(&self, message_type: &str) -> bool {
        let added = self
            .client_accepted_types
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(message_type.to_string());
        if added {
            debug!(message_type = message_type, "Client accepts new message type");
        }
        added
    }

    // Exchange

    /// Run one cycle now
    ///
    /// If a cycle is already running the request is merged into it and
    /// [`ExchangeOutcome::Merged`] is returned; the running caller then
    /// performs exactly one more cycle.
    pub async fn exchange(&self, urgent: bool) -> ExchangeOutcome {
        {
            let mut state = self.lock_state();
            if state.stopped {
                return ExchangeOutcome::Stopped;
            }
            if urgent {
                state.urgent = true;
            }
            if state.phase != ExchangePhase::Idle {
                state.rerun = true;
                debug!("Exchange in progress, merging request");
                return ExchangeOutcome::Merged;
            }
            state.phase = ExchangePhase::Pinging;
        }
        let _guard = CycleGuard(self);

        loop {
            let span = exchange_span!(pending = self.store.pending_count());
            let outcome = self.run_cycle().instrument(span).await;

            let rerun = {
                let mut state = self.lock_state();
                let rerun =
                    schedule::should_rerun(state.rerun, outcome.is_completed(), state.stopped);
                state.rerun = false;
                if rerun {
                    state.phase = ExchangePhase::Pinging;
                }
                rerun
            };
            if !rerun {
                return outcome;
            }
            debug!("Running merged exchange request");
        }
    }

    fn set_phase(&self, phase: ExchangePhase) {
        self.lock_state().phase = phase;
    }

    fn fail_cycle(&self, reason: String) -> ExchangeOutcome {
        self.lock_state().last_cycle_failed = true;
        self.events.fire("exchange-failed", &[]);
        ExchangeOutcome::Failed(reason)
    }

    async fn run_cycle(&self) -> ExchangeOutcome {
        self.events.fire("impending-exchange", &[]);
        self.dispatcher.impending_exchange().await;
        let settings = self.settings();

        let identity = match self.store.get_identity() {
            Ok(identity) => identity,
            Err(e) => {
                error!(error = %e, "Failed to read identity");
                return self.fail_cycle(e.to_string());
            }
        };

        let insecure_id = identity.as_ref().and_then(|i| i.insecure_id.as_deref());
        if let (Some(url), Some(insecure_id)) = (settings.ping_url.as_deref(), insecure_id) {
            if !self.pinger.ping(url, insecure_id).await {
                info!(url = %url, "Server unreachable, skipping exchange");
                self.lock_state().last_cycle_failed = true;
                return ExchangeOutcome::Unreachable;
            }
        }

        self.set_phase(ExchangePhase::Exchanging);
        let payload = match self.build_payload(&settings) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to build exchange payload");
                return self.fail_cycle(e.to_string());
            }
        };
        let context = ExchangeContext {
            secure_id: identity.map(|i| i.secure_id),
        };
        let sent = payload.messages.len();

        let result = tokio::time::timeout(
            settings.exchange_timeout,
            self.transport.exchange(&payload, &context),
        )
        .await
        .unwrap_or(Err(TransportError::Timeout(settings.exchange_timeout)));

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, pending = payload.total_messages, "Exchange failed, keeping messages");
                return self.fail_cycle(e.to_string());
            }
        };

        let received = match self.process_response(&payload, response).await {
            Ok(received) => received,
            Err(e) => {
                error!(error = %e, "Failed to apply exchange response");
                return self.fail_cycle(e.to_string());
            }
        };

        if let Err(e) = self.store.flush().await {
            warn!(error = %e, "Failed to flush message store after exchange");
        }

        {
            let mut state = self.lock_state();
            state.urgent = false;
            state.last_cycle_failed = false;
        }
        // Replies queued while handling server messages go out promptly
        let urgent_queued = matches!(self.store.has_urgent_pending(), Ok(true));
        if schedule::has_backlog(payload.total_messages, sent) || urgent_queued {
            self.request_urgent();
        }

        self.events.fire("exchange-done", &[]);
        info!(sent = sent, received = received, "Exchange completed");
        ExchangeOutcome::Completed { sent, received }
    }

    fn build_payload(&self, settings: &ExchangeSettings) -> StoreResult<ExchangePayload> {
        let pending = self.store.get_pending_messages(Some(settings.max_messages))?;
        let sequence = match pending.first() {
            Some(first) => first.sequence,
            None => self.store.next_sequence()?,
        };

        let client_types = self.get_client_accepted_message_types();
        let client_hash = types_hash(&client_types);
        let client_accepted_types = match self.store.get_client_accepted_types_hash()? {
            Some(known) if known == client_hash => None,
            _ => Some(client_types),
        };

        Ok(ExchangePayload {
            server_api: SERVER_API.to_string(),
            client_api: CLIENT_API.to_string(),
            sequence,
            next_expected_sequence: self.store.get_server_sequence()?,
            accepted_types: self.store.accepted_types_hash()?,
            server_uuid: self.store.get_server_uuid()?,
            client_accepted_types,
            total_messages: self.store.pending_count(),
            messages: pending.into_iter().map(|m| m.payload).collect(),
        })
    }

    async fn process_response(
        &self,
        payload: &ExchangePayload,
        response: ExchangeResponse,
    ) -> StoreResult<usize> {
        let next_expected = response
            .next_expected_sequence
            .unwrap_or(payload.sequence + payload.messages.len() as u64);
        self.store.acknowledge_up_to(next_expected)?;

        if let Some(new_uuid) = response.server_uuid {
            let old_uuid = self.store.get_server_uuid()?;
            if old_uuid.as_deref() != Some(new_uuid.as_str()) {
                info!(old = ?old_uuid, new = %new_uuid, "Server uuid changed");
                self.store.set_server_uuid(Some(&new_uuid))?;
                self.events.fire(
                    "server-uuid-changed",
                    &[old_uuid.map_or(Value::Null, Value::from), Value::from(new_uuid)],
                );
            }
        }

        if let Some(types) = response.accepted_types {
            self.apply_accepted_types(types)?;
        }

        if let Some(hash) = response.client_accepted_types_hash {
            self.store.set_client_accepted_types_hash(Some(&hash))?;
        }

        let received = response.messages.len();
        for message in &response.messages {
            self.handle_message(message).await;
            let next = self.store.get_server_sequence()? + 1;
            self.store.set_server_sequence(next)?;
        }
        Ok(received)
    }

    fn apply_accepted_types(&self, types: Vec<String>) -> StoreResult<()> {
        let old = self.store.get_accepted_types()?;
        let new: BTreeSet<String> = types.into_iter().collect();
        self.store.set_accepted_types(new.iter().cloned())?;

        for (message_type, accepted) in schedule::acceptance_changes(&old, &new) {
            debug!(message_type = %message_type, accepted = accepted, "Message type acceptance changed");
            self.events.fire(
                "message-type-acceptance-changed",
                &[Value::from(message_type), Value::from(accepted)],
            );
        }
        Ok(())
    }

    // Server messages

    /// Handle one message received from the server
    ///
    /// Protocol-level messages are handled here; everything else goes to
    /// the dispatcher.
    pub async fn handle_message(&self, message: &Message) {
        let kind = message_type(message).unwrap_or_default();
        let result = match kind {
            "set-id" => self.handle_set_id(message),
            "registration-failed" => {
                warn!("Server refused registration");
                self.events.fire("registration-failed", &[]);
                Ok(())
            }
            "unknown-id" => self.handle_unknown_id(),
            "resynchronize" => self.handle_resynchronize(message),
            "set-intervals" => {
                self.handle_set_intervals(message);
                Ok(())
            }
            "accepted-types" => self.handle_accepted_types(message),
            _ => {
                self.dispatcher.dispatch(message).await;
                Ok(())
            }
        };

        if let Err(e) = result {
            error!(message_type = kind, error = %e, "Failed handling server message");
        }
    }

    fn handle_set_id(&self, message: &Message) -> StoreResult<()> {
        let Some(secure_id) = message.get("id").and_then(id_string) else {
            warn!("Ignoring set-id without an id");
            return Ok(());
        };
        let identity = Identity {
            secure_id,
            insecure_id: message.get("insecure-id").and_then(id_string),
        };
        self.store.set_identity(&identity)?;
        info!(insecure_id = ?identity.insecure_id, "Registered with server");
        self.events.fire("registration-done", &[]);
        Ok(())
    }

    fn handle_unknown_id(&self) -> StoreResult<()> {
        warn!("Server does not know this computer, clearing identity");
        self.store.clear_identity()?;
        self.events.fire("resynchronize-clients", &[]);
        Ok(())
    }

    fn handle_resynchronize(&self, message: &Message) -> StoreResult<()> {
        let scopes = message.get("scopes").cloned().unwrap_or(Value::Null);
        info!(scopes = %scopes, "Server requested resynchronization");
        self.store.drop_session_ids()?;
        self.events.fire("resynchronize-clients", &[scopes]);
        Ok(())
    }

    fn handle_set_intervals(&self, message: &Message) {
        {
            let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(exchange) = schedule::interval_from_secs(message.get("exchange")) {
                settings.intervals.exchange = exchange;
            }
            if let Some(urgent) = schedule::interval_from_secs(message.get("urgent-exchange")) {
                settings.intervals.urgent = urgent;
            }
            info!(intervals = ?settings.intervals, "Exchange intervals updated");
        }
        self.wakeup.notify_one();
    }

    fn handle_accepted_types(&self, message: &Message) -> StoreResult<()> {
        let types = message
            .get("types")
            .and_then(Value::as_array)
            .map(|types| {
                types
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        self.apply_accepted_types(types)
    }
}

/// Identifiers arrive as strings or numbers depending on the server version
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

async fn timer_loop(exchanger: Weak<Exchanger>, wakeup: Arc<Notify>) {
    loop {
        let Some(delay) = exchanger.upgrade().map(|e| e.pending_delay()) else {
            return;
        };
        let mut deadline = Instant::now() + delay;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                _ = wakeup.notified() => {
                    let Some(this) = exchanger.upgrade() else {
                        return;
                    };
                    deadline = schedule::collapse_deadline(deadline, Instant::now(), this.requested_delay());
                }
            }
        }

        let Some(this) = exchanger.upgrade() else {
            return;
        };
        let urgent = this.is_urgent();
        this.exchange(urgent).await;
    }
}

impl std::fmt::Debug for Exchanger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchanger")
            .field("state", &*self.lock_state())
            .field("settings", &self.settings())
            .finish()
    }
}
