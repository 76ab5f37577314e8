//! Protocol seam between the floodsub core and the networking layer.
//!
//! The core never opens raw connections. Whatever carries the bytes
//! (QUIC streams, TCP + a muxer, or the in-process [`MemoryTransport`])
//! implements [`Transport`] and hands the core one duplex [`PeerChannel`]
//! per negotiated peer.
//!
//! | Direction | Mechanism |
//! |-----------|-----------|
//! | Inbound | [`Transport::handle`] registers a queue the transport pushes [`IncomingStream`]s into |
//! | Outbound | [`Transport::dial_protocol`] negotiates [`PROTOCOL_ID`] and returns the channel |
//!
//! [`MemoryTransport`]: crate::transport::MemoryTransport

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::identity::PeerId;

/// Protocol identifier negotiated by the transport for floodsub streams.
pub const PROTOCOL_ID: &str = "/floodsub/1.0.0";

/// A byte-oriented duplex stream to a single peer.
pub trait PeerChannel: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> PeerChannel for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedChannel = Box<dyn PeerChannel>;

/// A peer stream accepted by the transport for a handled protocol.
pub struct IncomingStream {
    pub peer: PeerId,
    pub channel: BoxedChannel,
}

impl std::fmt::Debug for IncomingStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingStream")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Networking collaborator consumed by [`Node`](crate::Node).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Identifier of the local node, as seen by remote peers.
    fn local_peer_id(&self) -> PeerId;

    /// Install the accept hook for `protocol`.
    ///
    /// Every stream a remote opens for `protocol` is pushed into `streams`
    /// until [`Transport::unhandle`] is called.
    async fn handle(&self, protocol: &str, streams: mpsc::Sender<IncomingStream>) -> Result<()>;

    /// Remove the accept hook for `protocol`. A no-op if none is installed.
    async fn unhandle(&self, protocol: &str);

    /// Open a stream to `peer` and negotiate `protocol` on it.
    async fn dial_protocol(&self, peer: &PeerId, protocol: &str) -> Result<BoxedChannel>;

    /// Peers the transport already holds a connection to.
    async fn connected_peers(&self) -> Vec<PeerId>;
}
