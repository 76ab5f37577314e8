//! # Wire Protocol Messages
//!
//! This module defines the data model exchanged between floodsub peers and
//! the codec that maps it to bytes.
//!
//! | Type | Role |
//! |------|------|
//! | [`SubOpts`] | one subscribe/unsubscribe state change |
//! | [`Message`] | a published payload with its origin and topics |
//! | [`Rpc`] | the envelope: a batch of `SubOpts` and `Message`s |
//!
//! Envelopes are serialized using bincode with a size limit. Decoding always
//! goes through [`decode_rpc`] so a hostile length prefix inside the payload
//! cannot make us allocate past the configured maximum.
//!
//! ## Message IDs
//!
//! A message is identified by `blake3(from || len(seqno) || seqno)`. The data
//! and topics are deliberately not part of the id: the same `(from, seqno)`
//! relayed by different neighbours must collapse to one entry in the seen
//! cache.

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

pub type MessageId = [u8; 32];

/// A single subscription state change announced by a peer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubOpts {
    pub topic_id: String,
    pub subscribe: bool,
}

impl SubOpts {
    pub fn subscribe(topic: impl Into<String>) -> Self {
        Self {
            topic_id: topic.into(),
            subscribe: true,
        }
    }

    pub fn unsubscribe(topic: impl Into<String>) -> Self {
        Self {
            topic_id: topic.into(),
            subscribe: false,
        }
    }
}

/// A published message.
///
/// Every listener of every matching topic receives an identical clone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Node that originally published the message (not the relaying peer).
    pub from: PeerId,
    /// Publisher-assigned sequence number, distinct per publishing node.
    pub seqno: Vec<u8>,
    pub data: Vec<u8>,
    pub topic_ids: Vec<String>,
}

impl Message {
    pub fn id(&self) -> MessageId {
        message_id(&self.from, &self.seqno)
    }
}

pub fn message_id(from: &PeerId, seqno: &[u8]) -> MessageId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(from.as_bytes());
    hasher.update(&(seqno.len() as u32).to_be_bytes());
    hasher.update(seqno);
    *hasher.finalize().as_bytes()
}

/// The unit exchanged over a peer stream.
///
/// Either list may be empty, but an envelope with both lists empty is never
/// put on the wire.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rpc {
    pub subscriptions: Vec<SubOpts>,
    pub messages: Vec<Message>,
}

impl Rpc {
    pub fn with_subscriptions(subscriptions: Vec<SubOpts>) -> Self {
        Self {
            subscriptions,
            messages: Vec::new(),
        }
    }

    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self {
            subscriptions: Vec::new(),
            messages,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty() && self.messages.is_empty()
    }

    /// Split into two non-empty envelopes whose concatenation is `self`.
    ///
    /// Subscriptions come first, then messages. `None` when the envelope
    /// holds a single entry.
    pub(crate) fn split(self) -> Option<(Rpc, Rpc)> {
        let Rpc {
            mut subscriptions,
            mut messages,
        } = self;
        if !subscriptions.is_empty() && !messages.is_empty() {
            return Some((Rpc::with_subscriptions(subscriptions), Rpc::with_messages(messages)));
        }
        if subscriptions.len() > 1 {
            let tail = subscriptions.split_off(subscriptions.len() / 2);
            return Some((Rpc::with_subscriptions(subscriptions), Rpc::with_subscriptions(tail)));
        }
        if messages.len() > 1 {
            let tail = messages.split_off(messages.len() / 2);
            return Some((Rpc::with_messages(messages), Rpc::with_messages(tail)));
        }
        None
    }
}

/// Returns bincode options with the given size limit enforced.
fn bincode_options(limit: usize) -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(limit as u64)
        .with_fixint_encoding()
}

/// Serialize an envelope, failing if it would exceed `limit` bytes.
pub fn encode_rpc(rpc: &Rpc, limit: usize) -> Result<Vec<u8>, bincode::Error> {
    bincode_options(limit).serialize(rpc)
}

/// Deserialize an envelope with size bounds enforced.
pub fn decode_rpc(bytes: &[u8], limit: usize) -> Result<Rpc, bincode::Error> {
    bincode_options(limit).deserialize(bytes)
}

/// Encoded size of an envelope, without producing the bytes.
pub fn encoded_len(rpc: &Rpc) -> usize {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .serialized_size(rpc)
        .map(|n| usize::try_from(n).unwrap_or(usize::MAX))
        .unwrap_or(usize::MAX)
}
