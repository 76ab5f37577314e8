//! # FloodSub - Flood-Based Publish/Subscribe
//!
//! Each node keeps local topic subscriptions, exchanges subscription state
//! with its directly connected peers, and relays every published message to
//! every neighbour subscribed to one of its topics. A bounded cache of seen
//! message ids stops the flood from looping in cyclic topologies.
//!
//! ## Architecture
//!
//! The engine uses the **Actor Pattern**:
//! - [`Node`] is the public entry point and owns the lifecycle
//! - a private actor owns all protocol state and processes commands and
//!   peer events sequentially
//! - each peer stream has its own reader and writer task, connected to the
//!   actor by bounded channels
//!
//! Connection establishment, protocol negotiation and peer authentication
//! belong to the [`Transport`] implementation. [`MemoryTransport`] is the
//! in-process one used by tests and the `floodsub-sim` binary.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | Lifecycle state machine and public API |
//! | `floodsub` | Dissemination engine actor, config, errors, event fan-out |
//! | `peers` | Peer registry: stream tasks and their cleanup |
//! | `subscriptions` | Local subscriptions and per-topic remote subscriber index |
//! | `seen` | Bounded duplicate-suppression cache |
//! | `rpc` | Length-prefixed framing and per-peer reader/writer tasks |
//! | `messages` | Wire data model and bincode codec |
//! | `protocols` | Protocol id and the transport collaborator trait |
//! | `transport` | In-memory transport |
//! | `identity` | `PeerId` |

mod floodsub;
mod identity;
mod messages;
mod node;
mod peers;
mod protocols;
mod rpc;
mod seen;
mod subscriptions;
mod transport;

pub use floodsub::{
    FloodSubConfig, FloodSubError, DEFAULT_COMMAND_CHANNEL_CAPACITY, DEFAULT_EVENT_CHANNEL_CAPACITY,
    DEFAULT_MAX_TRANSMIT_SIZE, DEFAULT_OUTBOUND_QUEUE_CAPACITY, DEFAULT_SEEN_CACHE_CAPACITY,
    DEFAULT_SEND_TIMEOUT,
};
pub use identity::PeerId;
pub use messages::{decode_rpc, encode_rpc, message_id, Message, MessageId, Rpc, SubOpts};
pub use node::{Node, NodeState};
pub use protocols::{BoxedChannel, IncomingStream, PeerChannel, Transport, PROTOCOL_ID};
pub use rpc::{read_frame, write_frame};
pub use subscriptions::SubscriptionChange;
pub use transport::{MemoryNetwork, MemoryTransport, DEFAULT_PIPE_BUFFER};
