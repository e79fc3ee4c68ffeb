//! Peer connection (component C): the reader and writer tasks that bridge a
//! live WebSocket to a room's single-writer event loop.
//!
//! The split mirrors the teacher's background-task shape (`store.rs` spawns
//! a projector/republish task per subsystem from a `tokio::spawn`) and the
//! `axum` `WebSocketUpgrade`/`split()` pattern used for browser transports in
//! the wider pack. Framing itself, however, is this crate's own: every frame
//! is a JSON-encoded [`crate::schema::SealedMsg`], never a length-prefixed
//! binary blob.

use std::num::NonZeroU32;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use governor::{Quota, RateLimiter};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::room::RoomCommand;
use crate::schema::SealedMsg;

/// Default per-peer max inbound frame size, enforced by `axum`'s upgrade
/// builder (`WebSocketUpgrade::max_message_size`) — overridable via
/// `RoomEngineConfig::max_message_len`.
pub const MAX_MESSAGE_LEN: usize = 64 * 1024;
/// Capacity of a peer's outbound queue (component C backpressure bound).
pub const OUTBOUND_QUEUE_CAPACITY: usize = 100;
/// Default per-frame write deadline, overridable via
/// `RoomEngineConfig::ws_timeout_secs`.
pub const WS_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("outbound queue is full")]
    QueueFull,
    #[error("peer is gone")]
    Gone,
}

/// A frame queued for a peer's writer task. Already serialized — sealing, if
/// any, has already happened in the room loop.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Text(String),
    Close { code: u16, reason: String },
}

/// Handle the room loop keeps for a connected peer's outbound queue.
#[derive(Debug, Clone)]
pub struct PeerSink {
    tx: mpsc::Sender<OutboundFrame>,
}

impl PeerSink {
    /// Non-blocking enqueue. A full queue is this peer's fault, not the
    /// room's — the caller is expected to drop the peer on `Err`, never to
    /// await room-loop-side backpressure.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<(), PeerError> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PeerError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => PeerError::Gone,
        })
    }
}

/// Split `socket` into reader/writer tasks and wire them into the room's
/// command channel. Called by the room loop immediately after a peer's
/// socket is attached (see `RoomCommand::ConnectPeer` handling in `room.rs`).
pub fn spawn_peer_io(
    socket: WebSocket,
    spub: String,
    room_tx: mpsc::UnboundedSender<RoomCommand>,
    ws_timeout: Duration,
) -> PeerSink {
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let (sink, stream) = socket.split();

    tokio::spawn(reader_task(stream, spub.clone(), room_tx.clone()));
    tokio::spawn(writer_task(sink, outbound_rx, spub, ws_timeout));

    PeerSink { tx: outbound_tx }
}

/// Reads frames until the socket errs or closes, rate-limiting and parsing
/// each before handing it to the room loop as `RoomCommand::InboundFrame`.
/// Any termination path enqueues exactly one `PeerLeave`.
async fn reader_task(
    mut stream: futures_util::stream::SplitStream<WebSocket>,
    spub: String,
    room_tx: mpsc::UnboundedSender<RoomCommand>,
) {
    let limiter = RateLimiter::direct(
        Quota::per_second(NonZeroU32::new(3).unwrap()).allow_burst(NonZeroU32::new(3).unwrap()),
    );

    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                debug!(peer = %spub, error = %e, "peer read error, closing");
                break;
            }
        };

        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => continue,
        };
        if text.is_empty() {
            continue;
        }

        if limiter.check().is_err() {
            // Silently dropped per spec: a noisy peer loses frames, not the
            // connection, unless the room loop decides otherwise.
            continue;
        }

        match serde_json::from_str::<SealedMsg>(&text) {
            Ok(sealed) => {
                let _ = room_tx.send(RoomCommand::InboundFrame {
                    from_spub: spub.clone(),
                    msg: sealed,
                });
            }
            Err(e) => {
                debug!(peer = %spub, error = %e, "dropping malformed frame");
            }
        }
    }

    let _ = room_tx.send(RoomCommand::PeerLeave { spub });
}

/// Drains the outbound queue and writes each frame with a write deadline.
/// Exits (without notifying the room — the reader side owns that) on queue
/// close or on a write error.
async fn writer_task(
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<OutboundFrame>,
    spub: String,
    ws_timeout: Duration,
) {
    while let Some(frame) = outbound_rx.recv().await {
        let is_close = matches!(frame, OutboundFrame::Close { .. });
        let message = match frame {
            OutboundFrame::Text(text) => Message::Text(text.into()),
            OutboundFrame::Close { code, reason } => Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })),
        };

        match tokio::time::timeout(ws_timeout, sink.send(message)).await {
            Ok(Ok(())) => {
                // An explicit close frame (e.g. room.dispose) already ended
                // the connection — don't fall through to the queue-closed
                // close frame below once the sender drops.
                if is_close {
                    return;
                }
            }
            Ok(Err(e)) => {
                warn!(peer = %spub, error = %e, "write error, closing writer");
                return;
            }
            Err(_) => {
                warn!(peer = %spub, "write deadline exceeded, closing writer");
                return;
            }
        }
    }

    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: 1000,
            reason: "queue closed".into(),
        })))
        .await;
}

pub fn close_frame(kind: &str) -> OutboundFrame {
    OutboundFrame::Close {
        code: 1000,
        reason: kind.to_string(),
    }
}
