//! In-process event bus
//!
//! Named events with ordered subscriber lists. `fire` calls every
//! subscriber synchronously and returns their results in subscription
//! order. One-shot subscribers are removed right before they run, so a
//! subscriber that fires the same event again does not see itself.
//!
//! The lock is never held while a callback runs: callbacks may subscribe,
//! cancel or fire freely.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::trace;

type Callback = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// Handle returned by a subscription, used to cancel it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    callback: Callback,
    once: bool,
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    handlers: HashMap<String, Vec<Subscriber>>,
    /// One-shot subscribers taken out of `handlers` by an in-progress fire
    /// but not yet invoked
    firing_once: HashSet<SubscriptionId>,
}

/// An event as delivered to `listen_events` waiters
#[derive(Debug, Clone, PartialEq)]
pub struct FiredEvent {
    pub name: String,
    pub args: Vec<Value>,
}

/// Shared, cloneable event bus
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(inner: &Mutex<BusInner>) -> MutexGuard<'_, BusInner> {
        inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribe(&self, name: &str, callback: Callback, once: bool) -> SubscriptionId {
        let mut inner = Self::lock(&self.inner);
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner
            .handlers
            .entry(name.to_string())
            .or_default()
            .push(Subscriber {
                id,
                callback,
                once,
            });
        id
    }

    /// Subscribe to every firing of `name`
    pub fn call_on<F>(&self, name: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        self.subscribe(name, Arc::new(callback), false)
    }

    /// Subscribe to the next firing of `name` only
    pub fn call_once<F>(&self, name: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        self.subscribe(name, Arc::new(callback), true)
    }

    /// Remove a subscription. Returns whether it was still registered.
    pub fn cancel_call(&self, id: SubscriptionId) -> bool {
        Self::cancel_in(&self.inner, id)
    }

    fn cancel_in(inner: &Mutex<BusInner>, id: SubscriptionId) -> bool {
        let mut inner = Self::lock(inner);
        if inner.firing_once.remove(&id) {
            return true;
        }

        let mut removed = false;
        inner.handlers.retain(|_, subscribers| {
            let before = subscribers.len();
            subscribers.retain(|s| s.id != id);
            removed |= subscribers.len() != before;
            !subscribers.is_empty()
        });
        removed
    }

    /// Number of live subscriptions for `name`
    pub fn subscriber_count(&self, name: &str) -> usize {
        Self::lock(&self.inner)
            .handlers
            .get(name)
            .map_or(0, Vec::len)
    }

    /// Call every subscriber of `name` and collect their results
    pub fn fire(&self, name: &str, args: &[Value]) -> Vec<Value> {
        let snapshot: Vec<(SubscriptionId, Callback, bool)> = {
            let mut inner = Self::lock(&self.inner);
            let Some(subscribers) = inner.handlers.get_mut(name) else {
                trace!(event = name, "Fired event with no subscribers");
                return Vec::new();
            };

            let snapshot: Vec<_> = subscribers
                .iter()
                .map(|s| (s.id, Arc::clone(&s.callback), s.once))
                .collect();
            subscribers.retain(|s| !s.once);
            if subscribers.is_empty() {
                inner.handlers.remove(name);
            }
            for (id, _, once) in &snapshot {
                if *once {
                    inner.firing_once.insert(*id);
                }
            }
            snapshot
        };

        trace!(event = name, subscribers = snapshot.len(), "Firing event");

        let mut results = Vec::with_capacity(snapshot.len());
        for (id, callback, once) in snapshot {
            let still_registered = {
                let mut inner = Self::lock(&self.inner);
                if once {
                    inner.firing_once.remove(&id)
                } else {
                    inner
                        .handlers
                        .get(name)
                        .is_some_and(|subs| subs.iter().any(|s| s.id == id))
                }
            };
            if still_registered {
                results.push(callback(args));
            }
        }
        results
    }

    /// Wait for the first of `names` to fire
    ///
    /// The returned future resolves to the event that fired first. Once it
    /// resolves, or if it is dropped before that, the subscriptions for the
    /// remaining names are cancelled; unrelated subscribers are untouched.
    ///
    /// ```rust
    /// use mgmt_broker::events::EventBus;
    /// use serde_json::json;
    ///
    /// # tokio_test::block_on(async {
    /// let bus = EventBus::new();
    /// let wait = bus.listen_events(&["done", "failed"]);
    /// bus.fire("failed", &[json!("timeout")]);
    ///
    /// let fired = wait.await.unwrap();
    /// assert_eq!(fired.name, "failed");
    /// assert_eq!(bus.subscriber_count("done"), 0);
    /// # });
    /// ```
    pub fn listen_events<S: AsRef<str>>(&self, names: &[S]) -> EventWait {
        let (tx, rx) = oneshot::channel();
        let sender = Arc::new(Mutex::new(Some(tx)));
        let ids: Arc<Mutex<Vec<SubscriptionId>>> = Arc::new(Mutex::new(Vec::new()));

        for name in names {
            let name = name.as_ref().to_string();
            let sender = Arc::clone(&sender);
            let sibling_ids = Arc::clone(&ids);
            let bus = Arc::downgrade(&self.inner);
            let event_name = name.clone();

            let id = self.call_once(&name, move |args| {
                let Some(tx) = sender.lock().unwrap_or_else(PoisonError::into_inner).take()
                else {
                    return Value::Null;
                };
                if let Some(inner) = bus.upgrade() {
                    let siblings = sibling_ids
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone();
                    for sibling in siblings {
                        EventBus::cancel_in(&inner, sibling);
                    }
                }
                let _ = tx.send(FiredEvent {
                    name: event_name.clone(),
                    args: args.to_vec(),
                });
                Value::Null
            });
            ids.lock().unwrap_or_else(PoisonError::into_inner).push(id);
        }

        EventWait {
            rx,
            ids,
            bus: Arc::downgrade(&self.inner),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = Self::lock(&self.inner);
        f.debug_struct("EventBus")
            .field("events", &inner.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Future returned by [`EventBus::listen_events`]
///
/// Resolves to `None` only if the bus went away before any listed event
/// fired.
pub struct EventWait {
    rx: oneshot::Receiver<FiredEvent>,
    ids: Arc<Mutex<Vec<SubscriptionId>>>,
    bus: Weak<Mutex<BusInner>>,
}

impl Future for EventWait {
    type Output = Option<FiredEvent>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(Result::ok)
    }
}

impl Drop for EventWait {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            let ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
            for id in ids.iter() {
                EventBus::cancel_in(&inner, *id);
            }
        }
    }
}
