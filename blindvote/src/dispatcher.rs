use crate::*;
use indexmap::IndexSet;
use tracing::debug;

/// Number of recently processed messages remembered for deduplication
pub const DEDUP_CAPACITY: usize = 100;

/// Composite identity of a delivered message
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MessageIdentity {
    pub envelope_id: String,
    pub kind: MessageKind,
    pub election_id: String,
    pub payload_len: usize,
}

impl MessageIdentity {
    pub fn new(envelope_id: &str, message: &Message) -> Self {
        MessageIdentity {
            envelope_id: envelope_id.to_owned(),
            kind: message.kind,
            election_id: message.id.clone(),
            payload_len: message.payload.len(),
        }
    }
}

/// Bounded, insertion-ordered set of processed identities
pub struct DedupWindow {
    seen: IndexSet<MessageIdentity>,
    capacity: usize,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        DedupWindow {
            seen: IndexSet::with_capacity(capacity + 1),
            capacity: capacity.max(1),
        }
    }

    pub fn contains(&self, identity: &MessageIdentity) -> bool {
        self.seen.contains(identity)
    }

    /// Remember `identity`, evicting the oldest entry past capacity
    pub fn insert(&mut self, identity: MessageIdentity) {
        self.seen.insert(identity);
        while self.seen.len() > self.capacity {
            let oldest = match self.seen.get_index(0) {
                Some(oldest) => oldest.clone(),
                None => break,
            };
            self.seen.shift_remove(&oldest);
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for DedupWindow {
    fn default() -> Self {
        DedupWindow::new(DEDUP_CAPACITY)
    }
}

/// Hands each decoded message to its handler exactly once
///
/// Relays redeliver, and several listeners may see the same envelope. Only
/// the first delivery of a composite identity reaches the handler.
#[derive(Default)]
pub struct MessageDispatcher {
    window: DedupWindow,
}

impl MessageDispatcher {
    pub fn new(capacity: usize) -> Self {
        MessageDispatcher {
            window: DedupWindow::new(capacity),
        }
    }

    /// Run `handler` on `message` unless it was already processed
    ///
    /// Returns the handler's output, or `None` for a duplicate. The identity
    /// is recorded after the handler returns.
    pub fn dispatch<F, T>(&mut self, envelope_id: &str, message: Message, handler: F) -> Option<T>
    where
        F: FnOnce(Message) -> T,
    {
        let identity = MessageIdentity::new(envelope_id, &message);
        if self.window.contains(&identity) {
            debug!(
                envelope = %envelope_id,
                kind = %identity.kind,
                election = %identity.election_id,
                "dropping duplicate message"
            );
            return None;
        }

        let output = handler(message);
        self.window.insert(identity);
        Some(output)
    }

    pub fn window(&self) -> &DedupWindow {
        &self.window
    }
}
