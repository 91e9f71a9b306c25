//! Forwarding pumps.
//!
//! Three tasks move a session's bytes:
//!
//! - the **downlink pump** lives as long as the session: it reads the
//!   backend, appends to the resend buffer, and forwards framed data while
//!   a client is attached. Keeping it alive across detachments is what
//!   lets the relay notice backend death immediately and buffer output for
//!   the client's return;
//! - the **uplink pump** lives for one attachment: it reads client frames,
//!   writes payloads to the backend, and trims the buffer on client acks;
//! - the **writer task** owns the client write half for one attachment and
//!   drains the session's frame queue, writing any resume replay first.
//!
//! The uplink pump and writer both report the attachment's death with its
//! epoch; the table ignores whichever report comes second.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use rescon_wire::{Frame, FrameReader, FrameWriter};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::session::{ClientSink, CloseReason, SessionSlot, SessionTable};

/// Client bytes accumulated before the uplink pump emits a standalone ack
/// (the downlink pump piggybacks acks whenever the backend is talking).
pub const ACK_THRESHOLD: u64 = 32 * 1024;

/// Session-lifetime pump: backend → resend buffer → attached client.
pub async fn run_downlink(
    table: Arc<SessionTable>,
    slot: Arc<SessionSlot>,
    mut backend_rx: OwnedReadHalf,
    mut shutdown: watch::Receiver<bool>,
) {
    use tokio::io::AsyncReadExt;

    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            read = backend_rx.read_buf(&mut buf) => match read {
                Ok(0) => {
                    table.close(&slot, CloseReason::BackendClosed).await;
                    break;
                }
                Ok(_) => {
                    let chunk = buf.split().freeze();
                    match slot.push_downlink(chunk).await {
                        Ok(Some((sink, frame))) => {
                            // A refused send means the writer is dying and a
                            // detach is in flight; the bytes stay buffered
                            // for the replay.
                            let _ = sink.send(frame).await;
                        }
                        Ok(None) => {} // detached: buffered only
                        Err(err) => {
                            warn!(
                                session_id = %slot.id(),
                                error = %err,
                                "Resend window exhausted"
                            );
                            table.close(&slot, CloseReason::BufferOverflow).await;
                            break;
                        }
                    }
                }
                Err(err) => {
                    debug!(session_id = %slot.id(), error = %err, "Backend read failed");
                    table.close(&slot, CloseReason::BackendError).await;
                    break;
                }
            }
        }
    }
    // Dropping the read half here completes the backend close started by
    // the table.
}

/// Attachment-lifetime pump: client frames → backend.
pub async fn run_uplink<R>(
    table: Arc<SessionTable>,
    slot: Arc<SessionSlot>,
    epoch: u64,
    mut reader: FrameReader<R>,
    sink: ClientSink,
    mut shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            frame = reader.read_frame() => match frame {
                Ok(Frame::Data { ack, payload }) => {
                    if slot.ack_from_client(ack).await.is_err() {
                        warn!(session_id = %slot.id(), ack, "Client ack outside window");
                        break;
                    }
                    if payload.is_empty() {
                        continue;
                    }
                    if let Err(err) = slot.write_backend(&payload).await {
                        debug!(session_id = %slot.id(), error = %err, "Backend write failed");
                        table.close(&slot, CloseReason::BackendError).await;
                        break;
                    }
                    slot.note_received(payload.len() as u64);
                    if let Some(ack_due) = slot.take_due_ack(ACK_THRESHOLD) {
                        let _ = sink.send(Frame::Ack { ack: ack_due }).await;
                    }
                }
                Ok(Frame::Ack { ack }) => {
                    if slot.ack_from_client(ack).await.is_err() {
                        warn!(session_id = %slot.id(), ack, "Client ack outside window");
                        break;
                    }
                }
                Err(err) => {
                    trace!(session_id = %slot.id(), error = %err, "Client transport ended");
                    break;
                }
            }
        }
    }
    table.detach(&slot, epoch).await;
}

/// Attachment-lifetime task owning the client write half: replays first,
/// then drains the frame queue.
pub async fn run_writer<W>(
    table: Arc<SessionTable>,
    slot: Arc<SessionSlot>,
    epoch: u64,
    mut writer: FrameWriter<W>,
    replay_ack: u64,
    replay: Vec<Bytes>,
    mut rx: mpsc::Receiver<Frame>,
) where
    W: AsyncWrite + Unpin,
{
    for chunk in replay {
        if writer.write_data(replay_ack, &chunk).await.is_err() {
            debug!(session_id = %slot.id(), "Client transport died during replay");
            table.detach(&slot, epoch).await;
            return;
        }
    }

    while let Some(frame) = rx.recv().await {
        let result = match &frame {
            Frame::Data { ack, payload } => writer.write_data(*ack, payload).await,
            Frame::Ack { ack } => writer.write_ack(*ack).await,
        };
        if result.is_err() {
            break;
        }
    }
    table.detach(&slot, epoch).await;
}
