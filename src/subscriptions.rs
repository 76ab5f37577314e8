//! # Subscription Ledger
//!
//! Local subscriptions plus, per topic, the set of remote peers known to be
//! subscribed to it. The ledger is plain data owned by the floodsub actor;
//! it produces the [`SubOpts`] to broadcast and consumes the ones peers send.
//!
//! ## Invariants
//!
//! - `topics[t]` contains `p` iff the last op received from `p` for `t` was a
//!   subscribe.
//! - A topic entry is never removed once created, only emptied: observers
//!   distinguish "everybody left" (empty set) from "never heard of it".
//! - Local subscribe/unsubscribe never yield a [`SubscriptionChange`]; those
//!   describe remote changes only.

use std::collections::{HashMap, HashSet};

use tracing::trace;

use crate::identity::PeerId;
use crate::messages::SubOpts;

/// A peer changed its subscriptions.
///
/// `subscriptions` is the batch exactly as received, so a single multi-topic
/// update stays distinguishable from several independent ones.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionChange {
    pub peer: PeerId,
    pub subscriptions: Vec<SubOpts>,
}

#[derive(Debug, Default)]
pub(crate) struct SubscriptionLedger {
    local: HashSet<String>,
    topics: HashMap<String, HashSet<PeerId>>,
}

impl SubscriptionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the op to broadcast, or `None` if already subscribed.
    pub fn subscribe(&mut self, topic: &str) -> Option<SubOpts> {
        if !self.local.insert(topic.to_string()) {
            return None;
        }
        Some(SubOpts::subscribe(topic))
    }

    /// Returns the op to broadcast, or `None` if not subscribed.
    pub fn unsubscribe(&mut self, topic: &str) -> Option<SubOpts> {
        if !self.local.remove(topic) {
            return None;
        }
        Some(SubOpts::unsubscribe(topic))
    }

    /// Apply a batch of ops received from `peer`, in order.
    pub fn apply_remote_ops(&mut self, peer: PeerId, ops: Vec<SubOpts>) -> SubscriptionChange {
        for op in &ops {
            if op.subscribe {
                self.topics
                    .entry(op.topic_id.clone())
                    .or_default()
                    .insert(peer);
            } else if let Some(peers) = self.topics.get_mut(&op.topic_id) {
                peers.remove(&peer);
            }
            trace!(
                peer = %peer.short(),
                topic = %op.topic_id,
                subscribe = op.subscribe,
                "applied remote subscription op"
            );
        }
        SubscriptionChange {
            peer,
            subscriptions: ops,
        }
    }

    pub fn is_locally_subscribed(&self, topic: &str) -> bool {
        self.local.contains(topic)
    }

    /// Peers subscribed to `topic`; empty if none ever were.
    pub fn subscribers_of(&self, topic: &str) -> HashSet<PeerId> {
        self.topics.get(topic).cloned().unwrap_or_default()
    }

    /// Union of the subscribers of every topic in `topics`, minus `exclude`.
    pub fn subscribers_of_any<'a>(
        &self,
        topics: impl IntoIterator<Item = &'a String>,
        exclude: Option<&PeerId>,
    ) -> HashSet<PeerId> {
        let mut peers = HashSet::new();
        for topic in topics {
            if let Some(subscribers) = self.topics.get(topic) {
                peers.extend(subscribers.iter().copied());
            }
        }
        if let Some(exclude) = exclude {
            peers.remove(exclude);
        }
        peers
    }

    /// Drop `peer` from every topic set, keeping the entries.
    pub fn remove_peer(&mut self, peer: &PeerId) -> usize {
        let mut removed = 0;
        for peers in self.topics.values_mut() {
            if peers.remove(peer) {
                removed += 1;
            }
        }
        removed
    }

    /// Ops announcing every local subscription, in a stable order.
    pub fn announcement(&self) -> Vec<SubOpts> {
        let mut topics: Vec<&String> = self.local.iter().collect();
        topics.sort();
        topics.into_iter().map(SubOpts::subscribe).collect()
    }

    pub fn subscriptions(&self) -> HashSet<String> {
        self.local.clone()
    }

    pub fn topics(&self) -> HashMap<String, HashSet<PeerId>> {
        self.topics.clone()
    }

    pub fn clear(&mut self) {
        self.local.clear();
        self.topics.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(seed: u8) -> PeerId {
        PeerId::from_bytes([seed; 32])
    }

    #[test]
    fn local_subscribe_is_idempotent() {
        let mut ledger = SubscriptionLedger::new();
        assert_eq!(ledger.subscribe("Z"), Some(SubOpts::subscribe("Z")));
        assert_eq!(ledger.subscribe("Z"), None);
        assert!(ledger.is_locally_subscribed("Z"));
        assert_eq!(ledger.subscriptions().len(), 1);
    }

    #[test]
    fn local_unsubscribe_only_when_subscribed() {
        let mut ledger = SubscriptionLedger::new();
        assert_eq!(ledger.unsubscribe("Z"), None);
        ledger.subscribe("Z");
        assert_eq!(ledger.unsubscribe("Z"), Some(SubOpts::unsubscribe("Z")));
        assert!(!ledger.is_locally_subscribed("Z"));
        assert_eq!(ledger.unsubscribe("Z"), None);
    }

    #[test]
    fn remote_ops_track_last_state_per_topic() {
        let mut ledger = SubscriptionLedger::new();
        let a = peer(1);

        ledger.apply_remote_ops(a, vec![SubOpts::subscribe("Z")]);
        assert_eq!(ledger.subscribers_of("Z"), HashSet::from([a]));

        ledger.apply_remote_ops(a, vec![SubOpts::unsubscribe("Z"), SubOpts::subscribe("Z")]);
        assert_eq!(ledger.subscribers_of("Z"), HashSet::from([a]));

        ledger.apply_remote_ops(a, vec![SubOpts::subscribe("Z"), SubOpts::unsubscribe("Z")]);
        assert!(ledger.subscribers_of("Z").is_empty());
    }

    #[test]
    fn emptied_topic_entry_is_retained() {
        let mut ledger = SubscriptionLedger::new();
        let a = peer(1);

        ledger.apply_remote_ops(a, vec![SubOpts::subscribe("Z")]);
        ledger.apply_remote_ops(a, vec![SubOpts::unsubscribe("Z")]);

        let topics = ledger.topics();
        assert_eq!(topics.get("Z"), Some(&HashSet::new()));
    }

    #[test]
    fn unsubscribe_for_unknown_topic_creates_nothing() {
        let mut ledger = SubscriptionLedger::new();
        ledger.apply_remote_ops(peer(1), vec![SubOpts::unsubscribe("never")]);
        assert!(ledger.topics().is_empty());
        assert!(ledger.subscribers_of("never").is_empty());
    }

    #[test]
    fn change_event_carries_ops_verbatim() {
        let mut ledger = SubscriptionLedger::new();
        let ops = vec![
            SubOpts::subscribe("b"),
            SubOpts::subscribe("a"),
            SubOpts::unsubscribe("c"),
        ];
        let change = ledger.apply_remote_ops(peer(7), ops.clone());
        assert_eq!(change.peer, peer(7));
        assert_eq!(change.subscriptions, ops);
    }

    #[test]
    fn remove_peer_empties_but_keeps_topics() {
        let mut ledger = SubscriptionLedger::new();
        let (a, b) = (peer(1), peer(2));
        ledger.apply_remote_ops(a, vec![SubOpts::subscribe("x"), SubOpts::subscribe("y")]);
        ledger.apply_remote_ops(b, vec![SubOpts::subscribe("y")]);

        assert_eq!(ledger.remove_peer(&a), 2);
        assert_eq!(ledger.remove_peer(&a), 0);

        let topics = ledger.topics();
        assert_eq!(topics.get("x"), Some(&HashSet::new()));
        assert_eq!(topics.get("y"), Some(&HashSet::from([b])));
    }

    #[test]
    fn union_across_topics_excludes_sender() {
        let mut ledger = SubscriptionLedger::new();
        let (a, b, c) = (peer(1), peer(2), peer(3));
        ledger.apply_remote_ops(a, vec![SubOpts::subscribe("t1"), SubOpts::subscribe("t2")]);
        ledger.apply_remote_ops(b, vec![SubOpts::subscribe("t2")]);
        ledger.apply_remote_ops(c, vec![SubOpts::subscribe("t1")]);

        let topics = vec!["t1".to_string(), "t2".to_string()];
        let peers = ledger.subscribers_of_any(&topics, Some(&c));
        assert_eq!(peers, HashSet::from([a, b]));
    }

    #[test]
    fn announcement_lists_local_subscriptions() {
        let mut ledger = SubscriptionLedger::new();
        assert!(ledger.announcement().is_empty());
        ledger.subscribe("b");
        ledger.subscribe("a");
        assert_eq!(
            ledger.announcement(),
            vec![SubOpts::subscribe("a"), SubOpts::subscribe("b")]
        );
    }

    #[test]
    fn clear_resets_everything() {
        let mut ledger = SubscriptionLedger::new();
        ledger.subscribe("a");
        ledger.apply_remote_ops(peer(1), vec![SubOpts::subscribe("b")]);
        ledger.clear();
        assert!(ledger.subscriptions().is_empty());
        assert!(ledger.topics().is_empty());
    }
}
