//! # FloodSub Dissemination Engine
//!
//! The flooding algorithm itself: local publish, inbound envelope handling,
//! relay to subscribed neighbours, and local delivery.
//!
//! ## Architecture
//!
//! A cloneable [`FloodSub`] handle talks to a private `FloodSubActor` over a
//! bounded command queue. The actor owns every piece of mutable protocol
//! state (subscription ledger, peer registry, seen cache) and is the only
//! task that touches it, so no lock is ever held across I/O. Network writes
//! never happen on the actor: envelopes are pushed into per-peer bounded
//! queues drained by the writer tasks in [`crate::rpc`].
//!
//! Envelopes that originate locally (publishes and subscription changes)
//! are not queued by the actor. It hands the caller a `Fanout` holding the
//! target queues, and the caller waits for room in each one. A local burst
//! is therefore paced by the slowest healthy peer. Relayed envelopes are
//! queued by the actor without waiting.
//!
//! ```text
//!  FloodSub ──cmd──► FloodSubActor ◄──PeerEvent── reader tasks
//!     │                  │
//!     │ Fanout           ├──relay──► per-peer queue ──► writer tasks
//!     └──────────────────┼─────────► per-peer queue
//!                        └─────────► EventHub (topic listeners, subscription changes)
//! ```
//!
//! ## Relay rules
//!
//! - A message whose id is already in the seen cache is dropped without
//!   delivery or forwarding.
//! - A fresh message is delivered once per locally subscribed topic and
//!   forwarded once to every peer subscribed to any of its topics, except
//!   the peer it arrived from.
//! - Messages forwarded to the same peer while handling one inbound envelope
//!   travel together in one envelope.
//! - A peer whose queue is full when relaying, or that leaves a local
//!   envelope waiting longer than `send_timeout`, is deregistered. So is a
//!   peer whose stream fails or who sends an undecodable envelope. No retry.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::identity::PeerId;
use crate::messages::{encoded_len, Message, MessageId, Rpc, SubOpts};
use crate::peers::{Direction, OutboundQueue, PeerHandle, PeerRegistry, SendFailure};
use crate::protocols::{BoxedChannel, IncomingStream};
use crate::rpc::PeerEvent;
use crate::seen::SeenCache;
use crate::subscriptions::{SubscriptionChange, SubscriptionLedger};

// ============================================================================
// Configuration
// ============================================================================

/// Default bound of the seen cache.
pub const DEFAULT_SEEN_CACHE_CAPACITY: usize = 10_000;

/// Default depth of each peer's outbound envelope queue.
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 128;

/// Default largest encoded envelope, inbound or outbound (1 MiB).
pub const DEFAULT_MAX_TRANSMIT_SIZE: usize = 1024 * 1024;

/// Default capacity of application event channels.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Default depth of the actor command queue.
pub const DEFAULT_COMMAND_CHANNEL_CAPACITY: usize = 1024;

/// Default time a local publish or subscription change waits for room in a
/// peer's queue before that peer is dropped.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

const PEER_EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub struct FloodSubConfig {
    /// Number of message ids remembered for duplicate suppression.
    /// Oldest-inserted ids are evicted first.
    pub seen_cache_capacity: usize,
    /// Envelopes queued per peer before the peer counts as lost.
    pub outbound_queue_capacity: usize,
    /// Largest encoded envelope accepted or produced.
    pub max_transmit_size: usize,
    /// Capacity of per-topic and subscription-change event channels.
    pub event_channel_capacity: usize,
    /// Depth of the actor command queue.
    pub command_channel_capacity: usize,
    /// Deliver our own publishes to local listeners when subscribed.
    pub deliver_own_messages: bool,
    /// How long a local envelope waits on a full peer queue.
    pub send_timeout: Duration,
}

impl Default for FloodSubConfig {
    fn default() -> Self {
        Self {
            seen_cache_capacity: DEFAULT_SEEN_CACHE_CAPACITY,
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            max_transmit_size: DEFAULT_MAX_TRANSMIT_SIZE,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            command_channel_capacity: DEFAULT_COMMAND_CHANNEL_CAPACITY,
            deliver_own_messages: true,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Typed failures surfaced by the floodsub API.
///
/// Public methods return `anyhow::Result`; callers that need to branch on a
/// specific failure can `downcast_ref::<FloodSubError>()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FloodSubError {
    /// Operation requires a started node.
    NotStarted,
    /// A stream for this peer is already registered and was kept.
    AlreadyRegistered(PeerId),
    /// Inbound bytes could not be decoded into an envelope.
    MalformedEnvelope(String),
    /// Encoded message exceeds `max_transmit_size`.
    MessageTooLarge { size: usize, max: usize },
    /// Inbound frame header announces more than `max_transmit_size` bytes.
    FrameTooLarge { size: usize, max: usize },
    /// Publish was called with an empty topic list.
    NoTopics,
    /// The remote peer does not handle the requested protocol.
    ProtocolNotSupported { peer: PeerId, protocol: String },
    /// The transport has no route to the peer.
    PeerUnreachable(PeerId),
}

impl std::fmt::Display for FloodSubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "floodsub node is not started"),
            Self::AlreadyRegistered(peer) => write!(f, "peer {} is already registered", peer.short()),
            Self::MalformedEnvelope(reason) => write!(f, "malformed envelope: {}", reason),
            Self::MessageTooLarge { size, max } => {
                write!(f, "message of {} bytes exceeds maximum of {} bytes", size, max)
            }
            Self::FrameTooLarge { size, max } => {
                write!(f, "frame of {} bytes exceeds maximum of {} bytes", size, max)
            }
            Self::NoTopics => write!(f, "publish requires at least one topic"),
            Self::ProtocolNotSupported { peer, protocol } => {
                write!(f, "peer {} does not support {}", peer.short(), protocol)
            }
            Self::PeerUnreachable(peer) => write!(f, "peer {} is unreachable", peer.short()),
        }
    }
}

impl std::error::Error for FloodSubError {}

// ============================================================================
// Application events
// ============================================================================

/// Fan-out point for everything the application can listen to.
///
/// Outlives any single actor so receivers obtained before `start()` keep
/// working across stop/start cycles.
pub struct EventHub {
    capacity: usize,
    changes: broadcast::Sender<SubscriptionChange>,
    topics: RwLock<HashMap<String, broadcast::Sender<Message>>>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (changes, _) = broadcast::channel(capacity);
        Self {
            capacity,
            changes,
            topics: RwLock::new(HashMap::new()),
        }
    }

    pub fn subscription_changes(&self) -> broadcast::Receiver<SubscriptionChange> {
        self.changes.subscribe()
    }

    /// Listen to deliveries on `topic`.
    ///
    /// Channels of other topics whose receivers have all been dropped are
    /// pruned here, so the map only grows with topics someone listens to.
    pub fn messages(&self, topic: &str) -> broadcast::Receiver<Message> {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        topics.retain(|t, tx| t == topic || tx.receiver_count() > 0);
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    fn emit_change(&self, change: SubscriptionChange) {
        let _ = self.changes.send(change);
    }

    /// Returns the number of listeners reached.
    fn deliver(&self, topic: &str, message: &Message) -> usize {
        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        topics
            .get(topic)
            .and_then(|tx| tx.send(message.clone()).ok())
            .unwrap_or(0)
    }
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

/// A locally originated envelope and the queues it must reach.
struct Fanout {
    rpc: Rpc,
    queues: Vec<OutboundQueue>,
}

enum Command {
    Subscribe(Vec<String>, oneshot::Sender<Result<Fanout, FloodSubError>>),
    Unsubscribe(Vec<String>, oneshot::Sender<Fanout>),
    Publish(Vec<String>, Vec<u8>, oneshot::Sender<Result<(MessageId, Fanout), FloodSubError>>),
    AddPeer(PeerId, BoxedChannel, oneshot::Sender<Result<(), FloodSubError>>),
    RemovePeer(PeerId, oneshot::Sender<bool>),
    /// Drop `peer` if `conn` is still its live stream.
    DropStalled(PeerId, u64),
    GetPeers(oneshot::Sender<Vec<PeerId>>),
    GetSubscriptions(oneshot::Sender<HashSet<String>>),
    GetTopics(oneshot::Sender<HashMap<String, HashSet<PeerId>>>),
    GetSubscribers(String, oneshot::Sender<HashSet<PeerId>>),
    Shutdown(oneshot::Sender<()>),
}

// ============================================================================
// FloodSub Handle (cheap to clone)
// ============================================================================

#[derive(Clone)]
pub struct FloodSub {
    cmd_tx: mpsc::Sender<Command>,
    send_timeout: Duration,
}

impl FloodSub {
    /// Spawn the actor.
    ///
    /// `incoming` carries streams accepted by the transport; `seqno` is the
    /// publisher counter, shared so it keeps advancing across restarts.
    pub fn spawn(
        local_peer_id: PeerId,
        config: FloodSubConfig,
        events: Arc<EventHub>,
        seqno: Arc<AtomicU64>,
        incoming: mpsc::Receiver<IncomingStream>,
    ) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_channel_capacity.max(1));
        let (peer_tx, peer_rx) = mpsc::channel(PEER_EVENT_CHANNEL_CAPACITY);
        let send_timeout = config.send_timeout;

        let actor = FloodSubActor::new(local_peer_id, config, events, seqno, peer_tx);
        debug!(
            peer = %local_peer_id.short(),
            seen_capacity = actor.seen.capacity(),
            "spawning FloodSub actor"
        );
        let task = tokio::spawn(actor.run(cmd_rx, incoming, peer_rx));

        (Self { cmd_tx, send_timeout }, task)
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> anyhow::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(command(tx))
            .await
            .map_err(|_| anyhow::anyhow!("FloodSub actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("FloodSub actor closed"))
    }

    /// Wait for room in every target queue.
    ///
    /// A peer still full after `send_timeout` is reported back to the actor
    /// and dropped. A queue that closed meanwhile belongs to a peer that is
    /// already gone.
    async fn fan_out(&self, fanout: Fanout) {
        let Fanout { rpc, queues } = fanout;
        for queue in queues {
            match queue.tx.send_timeout(rpc.clone(), self.send_timeout).await {
                Ok(()) => {}
                Err(SendTimeoutError::Closed(_)) => {
                    trace!(peer = %queue.peer.short(), "peer left before envelope was queued");
                }
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!(
                        peer = %queue.peer.short(),
                        timeout_ms = self.send_timeout.as_millis() as u64,
                        "dropping peer that stopped draining its queue"
                    );
                    let _ = self.cmd_tx.send(Command::DropStalled(queue.peer, queue.conn)).await;
                }
            }
        }
    }

    pub async fn subscribe(&self, topics: Vec<String>) -> anyhow::Result<()> {
        let fanout = self.request(|tx| Command::Subscribe(topics, tx)).await??;
        self.fan_out(fanout).await;
        Ok(())
    }

    pub async fn unsubscribe(&self, topics: Vec<String>) -> anyhow::Result<()> {
        let fanout = self.request(|tx| Command::Unsubscribe(topics, tx)).await?;
        self.fan_out(fanout).await;
        Ok(())
    }

    /// Publish and wait until every subscribed peer's queue has taken the
    /// message (or the peer has been dropped).
    pub async fn publish(&self, topics: Vec<String>, data: Vec<u8>) -> anyhow::Result<MessageId> {
        let (id, fanout) = self.request(|tx| Command::Publish(topics, data, tx)).await??;
        self.fan_out(fanout).await;
        Ok(id)
    }

    /// Register a stream we opened to `peer`.
    ///
    /// Succeeds without using `channel` when a live stream to `peer` wins
    /// the duplicate-stream tie-break.
    pub async fn add_peer(&self, peer: PeerId, channel: BoxedChannel) -> anyhow::Result<()> {
        Ok(self.request(|tx| Command::AddPeer(peer, channel, tx)).await??)
    }

    /// Returns `false` if the peer was not registered.
    pub async fn remove_peer(&self, peer: PeerId) -> anyhow::Result<bool> {
        self.request(|tx| Command::RemovePeer(peer, tx)).await
    }

    pub async fn peers(&self) -> Vec<PeerId> {
        self.request(Command::GetPeers).await.unwrap_or_default()
    }

    pub async fn subscriptions(&self) -> HashSet<String> {
        self.request(Command::GetSubscriptions).await.unwrap_or_default()
    }

    pub async fn topics(&self) -> HashMap<String, HashSet<PeerId>> {
        self.request(Command::GetTopics).await.unwrap_or_default()
    }

    pub async fn subscribers(&self, topic: &str) -> HashSet<PeerId> {
        let topic = topic.to_string();
        self.request(|tx| Command::GetSubscribers(topic, tx))
            .await
            .unwrap_or_default()
    }

    /// Close every peer, clear all protocol state and stop the actor.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.request(Command::Shutdown).await
    }
}

// ============================================================================
// FloodSub Actor (owns all protocol state)
// ============================================================================

struct FloodSubActor {
    local_peer_id: PeerId,
    config: FloodSubConfig,
    ledger: SubscriptionLedger,
    registry: PeerRegistry,
    seen: SeenCache,
    seqno: Arc<AtomicU64>,
    events: Arc<EventHub>,
}

impl FloodSubActor {
    fn new(
        local_peer_id: PeerId,
        config: FloodSubConfig,
        events: Arc<EventHub>,
        seqno: Arc<AtomicU64>,
        peer_tx: mpsc::Sender<PeerEvent>,
    ) -> Self {
        let registry = PeerRegistry::new(config.outbound_queue_capacity, config.max_transmit_size, peer_tx);
        Self {
            local_peer_id,
            ledger: SubscriptionLedger::new(),
            registry,
            seen: SeenCache::new(config.seen_cache_capacity),
            seqno,
            events,
            config,
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut incoming_rx: mpsc::Receiver<IncomingStream>,
        mut peer_rx: mpsc::Receiver<PeerEvent>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Subscribe(topics, reply)) => {
                            let _ = reply.send(self.handle_subscribe(topics));
                        }
                        Some(Command::Unsubscribe(topics, reply)) => {
                            let _ = reply.send(self.handle_unsubscribe(topics));
                        }
                        Some(Command::Publish(topics, data, reply)) => {
                            let _ = reply.send(self.handle_publish(topics, data));
                        }
                        Some(Command::AddPeer(peer, channel, reply)) => {
                            let result = match self.accept(peer, channel, Direction::Outbound, &mut peer_rx).await {
                                Err(FloodSubError::AlreadyRegistered(_)) => {
                                    debug!(peer = %peer.short(), "kept existing stream, new one dropped");
                                    Ok(())
                                }
                                other => other,
                            };
                            let _ = reply.send(result);
                        }
                        Some(Command::RemovePeer(peer, reply)) => {
                            let removed = self.registry.deregister_peer(&peer, &mut self.ledger).is_some();
                            let _ = reply.send(removed);
                        }
                        Some(Command::DropStalled(peer, conn)) => {
                            if self.registry.is_current(&peer, conn) {
                                self.registry.deregister_peer(&peer, &mut self.ledger);
                            }
                        }
                        Some(Command::GetPeers(reply)) => {
                            let _ = reply.send(self.registry.peer_ids());
                        }
                        Some(Command::GetSubscriptions(reply)) => {
                            let _ = reply.send(self.ledger.subscriptions());
                        }
                        Some(Command::GetTopics(reply)) => {
                            let _ = reply.send(self.ledger.topics());
                        }
                        Some(Command::GetSubscribers(topic, reply)) => {
                            let _ = reply.send(self.ledger.subscribers_of(&topic));
                        }
                        Some(Command::Shutdown(reply)) => {
                            self.shutdown().await;
                            let _ = reply.send(());
                            break;
                        }
                        None => {
                            debug!("FloodSub handle dropped, actor quitting");
                            self.shutdown().await;
                            break;
                        }
                    }
                }
                Some(stream) = incoming_rx.recv() => {
                    let IncomingStream { peer, channel } = stream;
                    if let Err(e) = self.accept(peer, channel, Direction::Inbound, &mut peer_rx).await {
                        debug!(peer = %peer.short(), error = %e, "rejected inbound stream");
                    }
                }
                Some(event) = peer_rx.recv() => {
                    self.handle_peer_event(event);
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        let peers = self.registry.len();
        let seen = self.seen.len();
        self.registry.close_all(&mut self.ledger).await;
        self.ledger.clear();
        self.seen.clear();
        debug!(peers, seen, "FloodSub actor stopped");
    }

    // ------------------------------------------------------------------------
    // Peer lifecycle
    // ------------------------------------------------------------------------

    /// Register a new stream, first catching up on lifecycle events so the
    /// stream is judged against up-to-date registrations.
    async fn accept(
        &mut self,
        peer: PeerId,
        channel: BoxedChannel,
        direction: Direction,
        peer_rx: &mut mpsc::Receiver<PeerEvent>,
    ) -> Result<(), FloodSubError> {
        self.drain_peer_events(peer_rx);
        if self.registry.get(&peer).is_some() {
            // Let the old stream's reader report an EOF it may already hold.
            tokio::task::yield_now().await;
            self.drain_peer_events(peer_rx);
        }
        self.accept_stream(peer, channel, direction)
    }

    fn drain_peer_events(&mut self, peer_rx: &mut mpsc::Receiver<PeerEvent>) {
        while let Ok(event) = peer_rx.try_recv() {
            self.handle_peer_event(event);
        }
    }

    fn dialer(&self, peer: PeerId, direction: Direction) -> PeerId {
        match direction {
            Direction::Outbound => self.local_peer_id,
            Direction::Inbound => peer,
        }
    }

    /// Both ends evaluate this on the same pair of streams and agree.
    fn should_replace(&self, existing: &PeerHandle, direction: Direction) -> bool {
        let peer = existing.id();
        existing.is_stale()
            || existing.direction() == direction
            || self.dialer(peer, direction) < self.dialer(peer, existing.direction())
    }

    fn accept_stream(
        &mut self,
        peer: PeerId,
        channel: BoxedChannel,
        direction: Direction,
    ) -> Result<(), FloodSubError> {
        if let Some(existing) = self.registry.get(&peer) {
            if !self.should_replace(existing, direction) {
                return Err(FloodSubError::AlreadyRegistered(peer));
            }
            debug!(peer = %peer.short(), ?direction, "replacing existing stream");
            self.registry.deregister_peer(&peer, &mut self.ledger);
        }

        let announcement = self.ledger.announcement();
        self.registry
            .register_peer(peer, channel, direction, announcement)
            .map(|_| ())
    }

    fn handle_peer_event(&mut self, event: PeerEvent) {
        let (peer, conn) = event.origin();
        if !self.registry.is_current(&peer, conn) {
            trace!(peer = %peer.short(), conn, "ignoring event from replaced stream");
            return;
        }

        match event {
            PeerEvent::Rpc { rpc, .. } => self.handle_rpc(peer, rpc),
            PeerEvent::Malformed { reason, .. } => {
                warn!(peer = %peer.short(), reason = %reason, "dropping peer after malformed envelope");
                self.registry.deregister_peer(&peer, &mut self.ledger);
            }
            PeerEvent::Closed { .. } => {
                self.registry.deregister_peer(&peer, &mut self.ledger);
            }
            PeerEvent::WriteFailed { error, .. } => {
                warn!(peer = %peer.short(), error = %error, "dropping peer after write failure");
                self.registry.deregister_peer(&peer, &mut self.ledger);
            }
        }
    }

    /// Enqueue `rpc` for `peer`; a peer that cannot take it is dropped.
    fn send_or_drop(&mut self, peer: PeerId, rpc: Rpc) {
        match self.registry.send(&peer, rpc) {
            Ok(()) => {}
            Err(SendFailure::UnknownPeer) => {
                trace!(peer = %peer.short(), "skipping send to unregistered peer");
            }
            Err(failure) => {
                warn!(peer = %peer.short(), ?failure, "dropping peer that cannot accept envelopes");
                self.registry.deregister_peer(&peer, &mut self.ledger);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Local operations
    // ------------------------------------------------------------------------

    /// Every topic must fit in an envelope on its own; larger batches are
    /// split by the writer.
    fn handle_subscribe(&mut self, topics: Vec<String>) -> Result<Fanout, FloodSubError> {
        let max = self.config.max_transmit_size;
        for topic in &topics {
            let size = encoded_len(&Rpc::with_subscriptions(vec![SubOpts::subscribe(topic.as_str())]));
            if size > max {
                return Err(FloodSubError::MessageTooLarge { size, max });
            }
        }

        let ops: Vec<SubOpts> = topics.iter().filter_map(|t| self.ledger.subscribe(t)).collect();
        Ok(self.subscription_fanout(ops))
    }

    fn handle_unsubscribe(&mut self, topics: Vec<String>) -> Fanout {
        let ops: Vec<SubOpts> = topics.iter().filter_map(|t| self.ledger.unsubscribe(t)).collect();
        self.subscription_fanout(ops)
    }

    fn subscription_fanout(&self, ops: Vec<SubOpts>) -> Fanout {
        let mut queues = Vec::new();
        if !ops.is_empty() {
            queues = self.registry.all_queues();
            debug!(ops = ops.len(), peers = queues.len(), "announcing subscription change");
        }
        Fanout {
            rpc: Rpc::with_subscriptions(ops),
            queues,
        }
    }

    fn handle_publish(&mut self, topics: Vec<String>, data: Vec<u8>) -> Result<(MessageId, Fanout), FloodSubError> {
        if topics.is_empty() {
            return Err(FloodSubError::NoTopics);
        }

        let seqno = self.seqno.fetch_add(1, Ordering::Relaxed);
        let message = Message {
            from: self.local_peer_id,
            seqno: seqno.to_be_bytes().to_vec(),
            data,
            topic_ids: unique_topics(topics),
        };

        let rpc = Rpc::with_messages(vec![message.clone()]);
        let size = encoded_len(&rpc);
        if size > self.config.max_transmit_size {
            return Err(FloodSubError::MessageTooLarge {
                size,
                max: self.config.max_transmit_size,
            });
        }

        let id = message.id();
        self.seen.add(id);
        if self.config.deliver_own_messages {
            self.deliver_locally(&message);
        }

        let targets = self.ledger.subscribers_of_any(&message.topic_ids, None);
        debug!(
            msg_id = %hex::encode(&id[..8]),
            topics = ?message.topic_ids,
            peers = targets.len(),
            "published message"
        );
        let queues = self.registry.queues_for(targets);
        Ok((id, Fanout { rpc, queues }))
    }

    // ------------------------------------------------------------------------
    // Inbound envelopes
    // ------------------------------------------------------------------------

    fn handle_rpc(&mut self, from: PeerId, rpc: Rpc) {
        let Rpc { subscriptions, messages } = rpc;

        if !subscriptions.is_empty() {
            let change = self.ledger.apply_remote_ops(from, subscriptions);
            debug!(
                peer = %from.short(),
                ops = change.subscriptions.len(),
                "peer changed subscriptions"
            );
            self.events.emit_change(change);
        }

        let mut forwards: HashMap<PeerId, Vec<Message>> = HashMap::new();
        for message in messages {
            let id = message.id();
            if self.seen.has(&id) {
                trace!(msg_id = %hex::encode(&id[..8]), peer = %from.short(), "duplicate message");
                continue;
            }
            self.seen.add(id);

            self.deliver_locally(&message);

            for peer in self.ledger.subscribers_of_any(&message.topic_ids, Some(&from)) {
                forwards.entry(peer).or_default().push(message.clone());
            }
        }

        for (peer, messages) in forwards {
            trace!(peer = %peer.short(), count = messages.len(), "forwarding messages");
            self.send_or_drop(peer, Rpc::with_messages(messages));
        }
    }

    fn deliver_locally(&self, message: &Message) {
        let mut seen_topics = HashSet::new();
        for topic in &message.topic_ids {
            if !seen_topics.insert(topic.as_str()) || !self.ledger.is_locally_subscribed(topic) {
                continue;
            }
            let listeners = self.events.deliver(topic, message);
            trace!(topic = %topic, listeners, "delivered message");
        }
    }
}

/// Drop repeated topics, keeping first-occurrence order.
fn unique_topics(topics: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    topics.into_iter().filter(|t| seen.insert(t.clone())).collect()
}
