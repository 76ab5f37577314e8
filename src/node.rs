//! # High-Level Node API
//!
//! A [`Node`] wires the floodsub engine to a [`Transport`] and owns its
//! lifecycle.
//!
//! ## Quick Start
//!
//! ```ignore
//! let network = MemoryNetwork::new();
//! let node = Node::new(network.transport(PeerId::random()));
//! node.start().await?;
//!
//! node.connect(&other_peer).await?;
//! let mut rx = node.messages("my-topic");
//! node.subscribe("my-topic").await?;
//! node.publish("my-topic", b"hello world".to_vec()).await?;
//!
//! while let Ok(msg) = rx.recv().await {
//!     println!("Got message: {:?}", msg);
//! }
//! ```
//!
//! ## Lifecycle
//!
//! `Stopped → Starting → Started → Stopped`. Starting installs the protocol
//! accept hook, spawns the engine and dials every peer the transport already
//! knows. Stopping closes every peer stream, waits for all peer tasks,
//! clears all protocol state and removes the hook. Event receivers handed
//! out by [`Node::messages`] and [`Node::subscription_changes`] stay valid
//! across restarts.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::floodsub::{EventHub, FloodSub, FloodSubConfig, FloodSubError};
use crate::identity::PeerId;
use crate::messages::{Message, MessageId};
use crate::protocols::{Transport, PROTOCOL_ID};
use crate::subscriptions::SubscriptionChange;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Stopped,
    Starting,
    Started,
}

struct Running {
    floodsub: FloodSub,
    actor: JoinHandle<()>,
}

pub struct Node<T: Transport> {
    transport: Arc<T>,
    config: FloodSubConfig,
    events: Arc<EventHub>,
    seqno: Arc<AtomicU64>,
    state: RwLock<NodeState>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl<T: Transport> Node<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, FloodSubConfig::default())
    }

    pub fn with_config(transport: T, config: FloodSubConfig) -> Self {
        Self {
            transport: Arc::new(transport),
            events: Arc::new(EventHub::new(config.event_channel_capacity)),
            // Random starting point so seqnos of different runs do not line up.
            seqno: Arc::new(AtomicU64::new(rand::random())),
            state: RwLock::new(NodeState::Stopped),
            running: tokio::sync::Mutex::new(None),
            config,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.transport.local_peer_id()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &FloodSubConfig {
        &self.config
    }

    pub fn state(&self) -> NodeState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_started(&self) -> bool {
        self.state() == NodeState::Started
    }

    fn set_state(&self, state: NodeState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Install the accept hook and spawn the engine. A no-op when started.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }
        self.set_state(NodeState::Starting);

        let (incoming_tx, incoming_rx) = mpsc::channel(self.config.command_channel_capacity.max(1));
        if let Err(e) = self.transport.handle(PROTOCOL_ID, incoming_tx).await {
            self.set_state(NodeState::Stopped);
            return Err(e).context("failed to install floodsub protocol handler");
        }

        let (floodsub, actor) = FloodSub::spawn(
            self.peer_id(),
            self.config.clone(),
            self.events.clone(),
            self.seqno.clone(),
            incoming_rx,
        );

        for peer in self.transport.connected_peers().await {
            match self.transport.dial_protocol(&peer, PROTOCOL_ID).await {
                Ok(channel) => {
                    if let Err(e) = floodsub.add_peer(peer, channel).await {
                        debug!(peer = %peer.short(), error = %e, "known peer not registered");
                    }
                }
                Err(e) => {
                    debug!(peer = %peer.short(), error = %e, "known peer not reachable");
                }
            }
        }

        *running = Some(Running { floodsub, actor });
        self.set_state(NodeState::Started);
        info!(peer = %self.peer_id().short(), protocol = PROTOCOL_ID, "floodsub node started");
        Ok(())
    }

    /// Tear everything down. A no-op when already stopped.
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let Some(Running { floodsub, actor }) = running.take() else {
            return Ok(());
        };

        if let Err(e) = floodsub.shutdown().await {
            warn!(error = %e, "floodsub actor already gone during stop");
        }
        if let Err(e) = actor.await {
            warn!(error = %e, "floodsub actor task failed");
        }
        self.transport.unhandle(PROTOCOL_ID).await;

        self.set_state(NodeState::Stopped);
        info!(peer = %self.peer_id().short(), "floodsub node stopped");
        Ok(())
    }

    async fn floodsub(&self) -> Result<FloodSub> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| r.floodsub.clone())
            .ok_or_else(|| FloodSubError::NotStarted.into())
    }

    async fn floodsub_opt(&self) -> Option<FloodSub> {
        self.running.lock().await.as_ref().map(|r| r.floodsub.clone())
    }

    /// Dial `peer` for the floodsub protocol and register the stream.
    ///
    /// Also succeeds when a live stream to `peer` already exists and wins
    /// over the new one, as happens when both sides dial at once.
    pub async fn connect(&self, peer: &PeerId) -> Result<()> {
        let floodsub = self.floodsub().await?;
        let channel = self
            .transport
            .dial_protocol(peer, PROTOCOL_ID)
            .await
            .with_context(|| format!("failed to dial {}", peer.short()))?;
        floodsub.add_peer(*peer, channel).await
    }

    /// Close the stream to `peer`. Returns `false` if it was not connected.
    pub async fn disconnect(&self, peer: &PeerId) -> Result<bool> {
        self.floodsub().await?.remove_peer(*peer).await
    }

    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        self.subscribe_many(&[topic]).await
    }

    /// Subscribe to several topics, announced to peers in one envelope.
    pub async fn subscribe_many(&self, topics: &[&str]) -> Result<()> {
        let topics = topics.iter().map(|t| t.to_string()).collect();
        self.floodsub().await?.subscribe(topics).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.unsubscribe_many(&[topic]).await
    }

    pub async fn unsubscribe_many(&self, topics: &[&str]) -> Result<()> {
        let topics = topics.iter().map(|t| t.to_string()).collect();
        self.floodsub().await?.unsubscribe(topics).await
    }

    pub async fn publish(&self, topic: &str, data: impl Into<Vec<u8>>) -> Result<MessageId> {
        self.publish_many(&[topic], data).await
    }

    /// Publish one message carrying several topics. Each peer receives it
    /// at most once, whatever the overlap of its subscriptions.
    pub async fn publish_many(&self, topics: &[&str], data: impl Into<Vec<u8>>) -> Result<MessageId> {
        let topics = topics.iter().map(|t| t.to_string()).collect();
        self.floodsub().await?.publish(topics, data.into()).await
    }

    /// Active peers. Empty when stopped.
    pub async fn peers(&self) -> Vec<PeerId> {
        match self.floodsub_opt().await {
            Some(floodsub) => floodsub.peers().await,
            None => Vec::new(),
        }
    }

    /// Local subscriptions. Empty when stopped.
    pub async fn subscriptions(&self) -> HashSet<String> {
        match self.floodsub_opt().await {
            Some(floodsub) => floodsub.subscriptions().await,
            None => HashSet::new(),
        }
    }

    /// Remote subscription index. Empty when stopped.
    pub async fn topics(&self) -> HashMap<String, HashSet<PeerId>> {
        match self.floodsub_opt().await {
            Some(floodsub) => floodsub.topics().await,
            None => HashMap::new(),
        }
    }

    /// Remote peers subscribed to `topic`.
    pub async fn subscribers(&self, topic: &str) -> HashSet<PeerId> {
        match self.floodsub_opt().await {
            Some(floodsub) => floodsub.subscribers(topic).await,
            None => HashSet::new(),
        }
    }

    /// Messages delivered locally on `topic`.
    ///
    /// Only messages for topics this node is subscribed to are delivered;
    /// listening alone does not subscribe.
    pub fn messages(&self, topic: &str) -> broadcast::Receiver<Message> {
        self.events.messages(topic)
    }

    pub fn subscription_changes(&self) -> broadcast::Receiver<SubscriptionChange> {
        self.events.subscription_changes()
    }
}
