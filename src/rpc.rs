//! # Peer Stream I/O
//!
//! Every registered peer gets two tasks over its [`PeerChannel`]:
//!
//! - a **reader** that pulls length-prefixed frames, decodes them into
//!   [`Rpc`] envelopes and posts them to the floodsub actor;
//! - a **writer** that drains the peer's bounded outbound queue and writes
//!   one frame per envelope, so envelopes to the same peer never interleave.
//!   An envelope that would exceed the maximum frame size is split in order
//!   until every part fits. A single entry that cannot fit is dropped.
//!
//! Neither task touches node state. Everything they learn (an envelope, a
//! decode failure, EOF, a failed write) is reported as a [`PeerEvent`]
//! tagged with the connection id it belongs to.
//!
//! ## Framing
//!
//! `[u32 big-endian length][payload]`. A length above the configured maximum
//! is reported as `InvalidData` before any payload is read.
//!
//! [`PeerChannel`]: crate::protocols::PeerChannel

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::floodsub::FloodSubError;
use crate::identity::PeerId;
use crate::messages::{decode_rpc, encode_rpc, encoded_len, Rpc};

/// Something a peer task observed on its stream.
#[derive(Debug)]
pub(crate) enum PeerEvent {
    Rpc { peer: PeerId, conn: u64, rpc: Rpc },
    Malformed { peer: PeerId, conn: u64, reason: String },
    Closed { peer: PeerId, conn: u64 },
    WriteFailed { peer: PeerId, conn: u64, error: String },
}

impl PeerEvent {
    pub fn origin(&self) -> (PeerId, u64) {
        match self {
            PeerEvent::Rpc { peer, conn, .. } => (*peer, *conn),
            PeerEvent::Malformed { peer, conn, .. } => (*peer, *conn),
            PeerEvent::Closed { peer, conn } => (*peer, *conn),
            PeerEvent::WriteFailed { peer, conn, .. } => (*peer, *conn),
        }
    }
}

/// Write one length-prefixed frame and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame exceeds u32 length"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` on a clean end of stream (EOF before a header).
/// An oversized length prefix yields `InvalidData` wrapping
/// [`FloodSubError::FrameTooLarge`].
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max_size: usize) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            FloodSubError::FrameTooLarge { size: len, max: max_size },
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

pub(crate) async fn run_reader<R>(
    peer: PeerId,
    conn: u64,
    mut reader: R,
    max_size: usize,
    events: mpsc::Sender<PeerEvent>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let event = match read_frame(&mut reader, max_size).await {
            Ok(Some(bytes)) => match decode_rpc(&bytes, max_size) {
                Ok(rpc) => {
                    trace!(
                        peer = %peer.short(),
                        subscriptions = rpc.subscriptions.len(),
                        messages = rpc.messages.len(),
                        "received envelope"
                    );
                    PeerEvent::Rpc { peer, conn, rpc }
                }
                Err(e) => PeerEvent::Malformed {
                    peer,
                    conn,
                    reason: FloodSubError::MalformedEnvelope(e.to_string()).to_string(),
                },
            },
            Ok(None) => {
                debug!(peer = %peer.short(), "peer stream closed");
                PeerEvent::Closed { peer, conn }
            }
            Err(e) if e.kind() == io::ErrorKind::InvalidData => PeerEvent::Malformed {
                peer,
                conn,
                reason: e.to_string(),
            },
            Err(e) => {
                debug!(peer = %peer.short(), error = %e, "peer stream read failed");
                PeerEvent::Closed { peer, conn }
            }
        };

        let done = !matches!(event, PeerEvent::Rpc { .. });
        if events.send(event).await.is_err() || done {
            break;
        }
    }
}

pub(crate) async fn run_writer<W>(
    peer: PeerId,
    conn: u64,
    mut writer: W,
    mut outbound: mpsc::Receiver<Rpc>,
    max_size: usize,
    events: mpsc::Sender<PeerEvent>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(rpc) = outbound.recv().await {
        // Parts are pushed back-to-front so they pop in order.
        let mut parts = vec![rpc];
        while let Some(rpc) = parts.pop() {
            if rpc.is_empty() {
                continue;
            }

            let size = encoded_len(&rpc);
            if size > max_size {
                match rpc.split() {
                    Some((head, tail)) => {
                        trace!(peer = %peer.short(), size, "splitting oversized envelope");
                        parts.push(tail);
                        parts.push(head);
                    }
                    None => {
                        warn!(peer = %peer.short(), size, max = max_size, "dropping entry too large for one frame");
                    }
                }
                continue;
            }

            let bytes = match encode_rpc(&rpc, max_size) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(peer = %peer.short(), error = %e, "dropping envelope that cannot be encoded");
                    continue;
                }
            };

            if let Err(e) = write_frame(&mut writer, &bytes).await {
                let _ = events
                    .send(PeerEvent::WriteFailed {
                        peer,
                        conn,
                        error: e.to_string(),
                    })
                    .await;
                return;
            }
            trace!(peer = %peer.short(), bytes = bytes.len(), "wrote envelope");
        }
    }

    let _ = writer.shutdown().await;
}
