//! # Peer Registry
//!
//! One entry per remote peer with a live floodsub stream. Registering a peer
//! splits its channel, spawns the reader/writer pair from [`crate::rpc`] and
//! queues the local subscription announcement as the first outbound
//! envelope. Deregistering removes the entry, purges the peer from the
//! subscription ledger and aborts both tasks.
//!
//! Each registration gets a fresh connection id. Peer tasks tag their events
//! with it, which lets the actor ignore late events from a connection that
//! has already been replaced.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::floodsub::FloodSubError;
use crate::identity::PeerId;
use crate::messages::{Rpc, SubOpts};
use crate::protocols::BoxedChannel;
use crate::rpc::{run_reader, run_writer, PeerEvent};
use crate::subscriptions::SubscriptionLedger;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PeerState {
    Connecting,
    Active,
    Closed,
}

/// Which side opened the stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SendFailure {
    UnknownPeer,
    QueueFull,
    Closed,
}

/// A peer's outbound queue, detached from the registry so a caller can wait
/// for room without holding up the actor.
#[derive(Clone)]
pub(crate) struct OutboundQueue {
    pub peer: PeerId,
    pub conn: u64,
    pub tx: mpsc::Sender<Rpc>,
}

pub(crate) struct PeerHandle {
    id: PeerId,
    conn: u64,
    direction: Direction,
    state: PeerState,
    outbound: mpsc::Sender<Rpc>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl PeerHandle {
    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn conn(&self) -> u64 {
        self.conn
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn queue(&self) -> OutboundQueue {
        OutboundQueue {
            peer: self.id,
            conn: self.conn,
            tx: self.outbound.clone(),
        }
    }

    /// True once the reader has stopped, i.e. the stream is known to be gone.
    pub fn is_stale(&self) -> bool {
        self.reader.is_finished()
    }

    /// Queue an envelope without waiting.
    pub fn try_send(&self, rpc: Rpc) -> Result<(), SendFailure> {
        if self.state != PeerState::Active {
            return Err(SendFailure::Closed);
        }
        self.outbound.try_send(rpc).map_err(|e| match e {
            TrySendError::Full(_) => SendFailure::QueueFull,
            TrySendError::Closed(_) => SendFailure::Closed,
        })
    }

    fn close(&mut self) {
        self.state = PeerState::Closed;
        self.reader.abort();
        self.writer.abort();
    }

    async fn join(self) {
        let _ = self.reader.await;
        let _ = self.writer.await;
    }
}

pub(crate) struct PeerRegistry {
    peers: HashMap<PeerId, PeerHandle>,
    next_conn: u64,
    outbound_capacity: usize,
    max_transmit_size: usize,
    events: mpsc::Sender<PeerEvent>,
}

impl PeerRegistry {
    pub fn new(outbound_capacity: usize, max_transmit_size: usize, events: mpsc::Sender<PeerEvent>) -> Self {
        Self {
            peers: HashMap::new(),
            next_conn: 0,
            outbound_capacity: outbound_capacity.max(1),
            max_transmit_size,
            events,
        }
    }

    /// Start serving `channel` for `id` and queue `announcement` as the
    /// first envelope (skipped when empty).
    pub fn register_peer(
        &mut self,
        id: PeerId,
        channel: BoxedChannel,
        direction: Direction,
        announcement: Vec<SubOpts>,
    ) -> Result<&PeerHandle, FloodSubError> {
        if self.peers.contains_key(&id) {
            return Err(FloodSubError::AlreadyRegistered(id));
        }

        self.next_conn += 1;
        let conn = self.next_conn;

        let (read_half, write_half) = tokio::io::split(channel);
        let (outbound, outbound_rx) = mpsc::channel(self.outbound_capacity);
        let reader = tokio::spawn(run_reader(
            id,
            conn,
            read_half,
            self.max_transmit_size,
            self.events.clone(),
        ));
        let writer = tokio::spawn(run_writer(
            id,
            conn,
            write_half,
            outbound_rx,
            self.max_transmit_size,
            self.events.clone(),
        ));

        let mut handle = PeerHandle {
            id,
            conn,
            direction,
            state: PeerState::Connecting,
            outbound,
            reader,
            writer,
        };

        // Fresh queue with capacity >= 1: the first envelope always fits.
        if !announcement.is_empty() {
            let _ = handle.outbound.try_send(Rpc::with_subscriptions(announcement));
        }
        handle.state = PeerState::Active;

        debug!(peer = %id.short(), conn, ?direction, "registered peer");
        Ok(self.peers.entry(id).or_insert(handle))
    }

    /// Remove `id`, purge it from `ledger` and abort its tasks.
    ///
    /// Idempotent: returns `None` if the peer was not registered.
    pub fn deregister_peer(&mut self, id: &PeerId, ledger: &mut SubscriptionLedger) -> Option<PeerHandle> {
        let mut handle = self.peers.remove(id)?;
        let emptied = ledger.remove_peer(id);
        handle.close();
        debug!(peer = %id.short(), conn = handle.conn, topics = emptied, "deregistered peer");
        Some(handle)
    }

    pub fn get(&self, id: &PeerId) -> Option<&PeerHandle> {
        self.peers.get(id)
    }

    /// True if `conn` is the live connection for `id`.
    pub fn is_current(&self, id: &PeerId, conn: u64) -> bool {
        self.peers.get(id).is_some_and(|h| h.conn == conn)
    }

    pub fn for_each_active_peer(&self, mut f: impl FnMut(&PeerHandle)) {
        for handle in self.peers.values() {
            if handle.state == PeerState::Active {
                f(handle);
            }
        }
    }

    pub fn send(&self, id: &PeerId, rpc: Rpc) -> Result<(), SendFailure> {
        match self.peers.get(id) {
            Some(handle) => handle.try_send(rpc),
            None => Err(SendFailure::UnknownPeer),
        }
    }

    /// Outbound queues of the active peers among `ids`.
    pub fn queues_for(&self, ids: impl IntoIterator<Item = PeerId>) -> Vec<OutboundQueue> {
        ids.into_iter()
            .filter_map(|id| self.peers.get(&id))
            .filter(|h| h.state == PeerState::Active)
            .map(PeerHandle::queue)
            .collect()
    }

    /// Outbound queues of every active peer.
    pub fn all_queues(&self) -> Vec<OutboundQueue> {
        let mut queues = Vec::with_capacity(self.peers.len());
        self.for_each_active_peer(|h| queues.push(h.queue()));
        queues
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids = Vec::with_capacity(self.peers.len());
        self.for_each_active_peer(|h| ids.push(h.id));
        ids
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Deregister every peer and wait for all of their tasks to finish.
    pub async fn close_all(&mut self, ledger: &mut SubscriptionLedger) {
        let ids: Vec<PeerId> = self.peers.keys().copied().collect();
        let mut closed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(handle) = self.deregister_peer(&id, ledger) {
                closed.push(handle);
            }
        }
        for handle in closed {
            handle.join().await;
        }
    }
}
