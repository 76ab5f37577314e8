//! Bounded record of recently processed message ids.
//!
//! The flood terminates because a node that already holds a message id
//! neither delivers nor forwards that message again. Entries are evicted
//! oldest-inserted-first once `capacity` is reached; membership checks never
//! refresh an entry, so the eviction order is exactly the insertion order.

use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::trace;

use crate::messages::MessageId;

pub(crate) struct SeenCache {
    entries: LruCache<MessageId, ()>,
}

impl SeenCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    pub fn has(&self, id: &MessageId) -> bool {
        self.entries.contains(id)
    }

    /// Record `id`. Returns `false` if it was already present.
    pub fn add(&mut self, id: MessageId) -> bool {
        if self.entries.contains(&id) {
            return false;
        }
        if let Some((evicted, ())) = self.entries.push(id, ()) {
            trace!(
                msg_id = %hex::encode(&evicted[..8]),
                "evicted oldest entry from seen cache"
            );
        }
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
