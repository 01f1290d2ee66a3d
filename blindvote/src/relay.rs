use crate::*;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// An event delivered on a subscription: `(subscription_id, event)`
pub type Notification = (String, Event);

/// The pub/sub relay carrying events between voter and coordinator
///
/// Opening a subscription is expensive and rate-limited on real relays, so
/// callers go through [`SubscriptionManager`] rather than using this directly.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Open a physical subscription. Matching events are delivered tagged with `subscription_id`.
    async fn open(&self, subscription_id: &str, filter: &Filter) -> Result<(), TransportError>;

    /// Close a physical subscription. Closing an unknown subscription is not an error.
    async fn close(&self, subscription_id: &str) -> Result<(), TransportError>;

    async fn publish(&self, event: &Event) -> Result<(), TransportError>;
}

/// An in-process, append-only relay
///
/// Stored events matching a new subscription are replayed when it opens.
/// With duplicate delivery on, every notification is sent twice, the way a
/// relay pool with overlapping relays behaves.
pub struct MemoryRelay {
    state: Mutex<RelayState>,
    notify: mpsc::UnboundedSender<Notification>,
}

#[derive(Default)]
struct RelayState {
    events: Vec<Event>,
    subscriptions: BTreeMap<String, Filter>,
    opened: usize,
    duplicate_delivery: bool,
}

impl MemoryRelay {
    /// Create a relay and the receiving end of its notification stream
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (notify, receiver) = mpsc::unbounded_channel();
        let relay = MemoryRelay {
            state: Mutex::new(RelayState::default()),
            notify,
        };
        (relay, receiver)
    }

    pub async fn set_duplicate_delivery(&self, duplicate: bool) {
        self.state.lock().await.duplicate_delivery = duplicate;
    }

    /// Number of currently open subscriptions
    pub async fn subscription_count(&self) -> usize {
        self.state.lock().await.subscriptions.len()
    }

    /// Number of physical subscriptions ever opened
    pub async fn opened_count(&self) -> usize {
        self.state.lock().await.opened
    }

    /// All stored events, oldest first
    pub async fn events(&self) -> Vec<Event> {
        self.state.lock().await.events.clone()
    }

    /// Stored events matching `filter`
    pub async fn query(&self, filter: &Filter) -> Vec<Event> {
        let state = self.state.lock().await;
        let mut matching: Vec<Event> = state
            .events
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            let skip = matching.len().saturating_sub(limit);
            matching.drain(..skip);
        }
        matching
    }

    fn send(&self, state: &RelayState, subscription_id: &str, event: &Event) {
        let copies = if state.duplicate_delivery { 2 } else { 1 };
        for _ in 0..copies {
            // A closed receiver only means nobody is listening anymore
            let _ = self.notify.send((subscription_id.to_owned(), event.clone()));
        }
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn open(&self, subscription_id: &str, filter: &Filter) -> Result<(), TransportError> {
        let replay = self.query(filter).await;

        let mut state = self.state.lock().await;
        state
            .subscriptions
            .insert(subscription_id.to_owned(), filter.clone());
        state.opened += 1;

        debug!(subscription = %subscription_id, replayed = replay.len(), "relay subscription opened");
        for event in replay.iter() {
            self.send(&state, subscription_id, event);
        }
        Ok(())
    }

    async fn close(&self, subscription_id: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if state.subscriptions.remove(subscription_id).is_some() {
            debug!(subscription = %subscription_id, "relay subscription closed");
        }
        Ok(())
    }

    async fn publish(&self, event: &Event) -> Result<(), TransportError> {
        event.verify()?;

        let mut state = self.state.lock().await;
        if state.events.iter().any(|e| e.id == event.id) {
            return Ok(());
        }
        state.events.push(event.clone());

        let targets: Vec<String> = state
            .subscriptions
            .iter()
            .filter(|(_, filter)| filter.matches(event))
            .map(|(id, _)| id.clone())
            .collect();
        for subscription_id in targets.iter() {
            self.send(&state, subscription_id, event);
        }
        Ok(())
    }
}
