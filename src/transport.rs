//! # In-Memory Transport
//!
//! A process-local [`Transport`] used by the integration tests and the
//! `floodsub-sim` binary. A [`MemoryNetwork`] is the shared switchboard; each
//! node gets its own [`MemoryTransport`] bound to a [`PeerId`].
//!
//! Dialing a protocol creates a `tokio::io::duplex` pipe, hands one end to the
//! remote's accept hook and returns the other. The switchboard remembers every
//! pair of peers that has ever been linked, which is what
//! [`Transport::connected_peers`] reports: a restarted node re-negotiates with
//! the peers it knew before.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::floodsub::FloodSubError;
use crate::identity::PeerId;
use crate::protocols::{BoxedChannel, IncomingStream, Transport};

/// Default per-direction buffer of an in-memory pipe.
pub const DEFAULT_PIPE_BUFFER: usize = 64 * 1024;

#[derive(Default)]
struct Switchboard {
    handlers: HashMap<(PeerId, String), mpsc::Sender<IncomingStream>>,
    known: HashSet<PeerId>,
    links: HashSet<(PeerId, PeerId)>,
}

impl Switchboard {
    fn link(&mut self, a: PeerId, b: PeerId) {
        let pair = if a < b { (a, b) } else { (b, a) };
        self.links.insert(pair);
    }

    fn neighbours(&self, peer: &PeerId) -> Vec<PeerId> {
        let mut out: Vec<PeerId> = self
            .links
            .iter()
            .filter_map(|(a, b)| {
                if a == peer {
                    Some(*b)
                } else if b == peer {
                    Some(*a)
                } else {
                    None
                }
            })
            .collect();
        out.sort();
        out
    }
}

/// Shared switchboard connecting every [`MemoryTransport`] created from it.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<Switchboard>>,
    pipe_buffer: usize,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::with_pipe_buffer(DEFAULT_PIPE_BUFFER)
    }

    pub fn with_pipe_buffer(pipe_buffer: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Switchboard::default())),
            pipe_buffer: pipe_buffer.max(1),
        }
    }

    /// Attach a node to the network.
    pub fn transport(&self, local: PeerId) -> MemoryTransport {
        self.lock().known.insert(local);
        MemoryTransport {
            local,
            network: self.clone(),
        }
    }

    /// Forget the link between `a` and `b`. Open streams are unaffected.
    pub fn forget_link(&self, a: &PeerId, b: &PeerId) {
        let pair = if a < b { (*a, *b) } else { (*b, *a) };
        self.lock().links.remove(&pair);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Switchboard> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One node's view of a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    local: PeerId,
    network: MemoryNetwork,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_peer_id(&self) -> PeerId {
        self.local
    }

    async fn handle(&self, protocol: &str, streams: mpsc::Sender<IncomingStream>) -> Result<()> {
        self.network
            .lock()
            .handlers
            .insert((self.local, protocol.to_string()), streams);
        debug!(peer = %self.local.short(), protocol, "installed protocol handler");
        Ok(())
    }

    async fn unhandle(&self, protocol: &str) {
        let removed = self
            .network
            .lock()
            .handlers
            .remove(&(self.local, protocol.to_string()))
            .is_some();
        if removed {
            debug!(peer = %self.local.short(), protocol, "removed protocol handler");
        }
    }

    async fn dial_protocol(&self, peer: &PeerId, protocol: &str) -> Result<BoxedChannel> {
        if *peer == self.local {
            return Err(FloodSubError::PeerUnreachable(*peer).into());
        }

        let handler = {
            let board = self.network.lock();
            match board.handlers.get(&(*peer, protocol.to_string())) {
                Some(handler) => handler.clone(),
                None if board.known.contains(peer) => {
                    return Err(FloodSubError::ProtocolNotSupported {
                        peer: *peer,
                        protocol: protocol.to_string(),
                    }
                    .into());
                }
                None => return Err(FloodSubError::PeerUnreachable(*peer).into()),
            }
        };

        let (local_end, remote_end) = tokio::io::duplex(self.network.pipe_buffer);
        handler
            .send(IncomingStream {
                peer: self.local,
                channel: Box::new(remote_end),
            })
            .await
            .map_err(|_| FloodSubError::ProtocolNotSupported {
                peer: *peer,
                protocol: protocol.to_string(),
            })?;

        self.network.lock().link(self.local, *peer);
        trace!(from = %self.local.short(), to = %peer.short(), protocol, "opened in-memory stream");
        Ok(Box::new(local_end))
    }

    async fn connected_peers(&self) -> Vec<PeerId> {
        self.network.lock().neighbours(&self.local)
    }
}
