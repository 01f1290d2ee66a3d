//! Filter-keyed subscription pooling.
//!
//! Structurally identical filters share one physical relay subscription. Each
//! logical listener gets its own handler id; the physical subscription is
//! closed when its last handler goes away.

use crate::*;
use digest::Digest;
use indexmap::IndexMap;
use sha2::Sha256;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type HandlerId = Uuid;

/// Callback invoked for every event on a pool
pub type EventHandler = Arc<dyn Fn(&Event) -> Result<(), String> + Send + Sync>;

/// Selects events from the relay
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<u16>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,

    /// Single-letter tag name to accepted values, `#p` style
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: u16) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn author(mut self, author: &str) -> Self {
        self.authors.push(author.to_owned());
        self
    }

    pub fn tag(mut self, name: &str, value: &str) -> Self {
        self.tags
            .entry(name.to_owned())
            .or_insert_with(Vec::new)
            .push(value.to_owned());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `event` passes every constraint of the filter
    ///
    /// An empty list accepts anything. `limit` only bounds the replay of
    /// stored events and plays no part here.
    pub fn matches(&self, event: &Event) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.contains(&event.pubkey) {
            return false;
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        self.tags.iter().all(|(name, values)| {
            values.is_empty()
                || event
                    .tag_values(name)
                    .any(|v| values.iter().any(|wanted| wanted == v))
        })
    }

    /// Stable identity over the fields that select events
    ///
    /// Order and repetition within a list do not matter. `limit` is left out.
    pub fn id(&self) -> FilterId {
        let kinds: BTreeSet<u16> = self.kinds.iter().copied().collect();
        let authors: BTreeSet<&str> = self.authors.iter().map(|a| a.as_str()).collect();
        let tags: BTreeMap<&str, BTreeSet<&str>> = self
            .tags
            .iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(name, values)| {
                (
                    name.as_str(),
                    values.iter().map(|v| v.as_str()).collect(),
                )
            })
            .collect();

        let canonical = serde_json::to_vec(&(kinds, authors, tags, self.since, self.until))
            .unwrap_or_default();
        FilterId(hex::encode(Sha256::digest(&canonical)))
    }
}

/// Hash identity of a filter, also used as the physical subscription id
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilterId(String);

impl FilterId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", &self.0)
    }
}

struct Pool {
    filter: Filter,
    handlers: IndexMap<HandlerId, EventHandler>,
}

#[derive(Default)]
struct Registry {
    pools: HashMap<FilterId, Pool>,
    handlers: HashMap<HandlerId, FilterId>,
}

/// Pools relay subscriptions by filter identity
///
/// Registry mutations are serialized by one lock that is held across the
/// relay round trip, so two concurrent subscribes for the same filter open
/// exactly one physical subscription.
pub struct SubscriptionManager<R: Relay> {
    relay: Arc<R>,
    registry: Mutex<Registry>,
}

impl<R: Relay> SubscriptionManager<R> {
    pub fn new(relay: Arc<R>) -> Self {
        SubscriptionManager {
            relay,
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn relay(&self) -> &Arc<R> {
        &self.relay
    }

    /// Register `handler` for events matching `filter`
    pub async fn subscribe<F>(&self, filter: Filter, handler: F) -> Result<HandlerId, TransportError>
    where
        F: Fn(&Event) -> Result<(), String> + Send + Sync + 'static,
    {
        let handler_id = Uuid::new_v4();
        let filter_id = filter.id();
        let mut registry = self.registry.lock().await;

        match registry.pools.get_mut(&filter_id) {
            Some(pool) => {
                pool.handlers.insert(handler_id, Arc::new(handler));
                debug!(filter = %filter_id, handlers = pool.handlers.len(), "joined subscription pool");
            }
            None => {
                self.relay.open(filter_id.as_str(), &filter).await?;
                let mut handlers: IndexMap<HandlerId, EventHandler> = IndexMap::new();
                handlers.insert(handler_id, Arc::new(handler));
                registry
                    .pools
                    .insert(filter_id.clone(), Pool { filter, handlers });
                info!(filter = %filter_id, "opened subscription pool");
            }
        }

        registry.handlers.insert(handler_id, filter_id);
        Ok(handler_id)
    }

    /// Remove a handler. Returns false if it was not registered.
    ///
    /// If closing the physical subscription fails, the handler stays
    /// registered so the call can be retried.
    pub async fn unsubscribe(&self, handler_id: HandlerId) -> Result<bool, TransportError> {
        let mut registry = self.registry.lock().await;
        let filter_id = match registry.handlers.get(&handler_id) {
            Some(filter_id) => filter_id.clone(),
            None => return Ok(false),
        };

        let last_handler = registry
            .pools
            .get(&filter_id)
            .map_or(true, |pool| pool.handlers.len() <= 1);

        if last_handler {
            info!(filter = %filter_id, "closing subscription pool");
            self.relay.close(filter_id.as_str()).await?;
            registry.pools.remove(&filter_id);
        } else if let Some(pool) = registry.pools.get_mut(&filter_id) {
            pool.handlers.shift_remove(&handler_id);
        }

        registry.handlers.remove(&handler_id);
        Ok(true)
    }

    /// Fan an event out to every handler of the pool behind `subscription_id`
    ///
    /// A failing or panicking handler is logged and skipped; its siblings
    /// still receive the event. Returns the number of handlers that succeeded.
    pub async fn deliver(&self, subscription_id: &str, event: &Event) -> usize {
        let handlers: Vec<EventHandler> = {
            let registry = self.registry.lock().await;
            let pool = match registry.pools.get(&FilterId(subscription_id.to_owned())) {
                Some(pool) => pool,
                None => {
                    debug!(subscription = %subscription_id, "event for closed subscription");
                    return 0;
                }
            };
            if !pool.filter.matches(event) {
                debug!(subscription = %subscription_id, event = %event.id, "event does not match filter");
                return 0;
            }
            pool.handlers.values().cloned().collect()
        };

        let mut delivered = 0;
        for handler in handlers.iter() {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!(event = %event.id, error = %e, "subscription handler failed"),
                Err(_) => warn!(event = %event.id, "subscription handler panicked"),
            }
        }
        delivered
    }

    /// Deliver relay notifications until the relay's stream ends
    pub async fn pump(&self, mut notifications: mpsc::UnboundedReceiver<Notification>) {
        while let Some((subscription_id, event)) = notifications.recv().await {
            self.deliver(&subscription_id, &event).await;
        }
    }

    /// Number of live pools, one per physical subscription
    pub async fn pool_count(&self) -> usize {
        self.registry.lock().await.pools.len()
    }

    /// Number of registered handlers across all pools
    pub async fn handler_count(&self) -> usize {
        self.registry.lock().await.handlers.len()
    }
}
