//! Session table: identity → record, with matching, resumption, and
//! expiry.
//!
//! Locking is two-level: the table map has its own lock, and every slot
//! serializes its own mutations. Forwarding pumps touch a slot's buffer
//! and endpoints; only state transitions (attach / detach / close) take
//! both levels, always map-then-slot. Counters on the status path are
//! plain atomics and never block forwarding.
//!
//! Exactly-once guarantees:
//! - a `Detached` slot is claimed by at most one resuming transport (the
//!   claim flips it to `Attached` and bumps the attachment epoch under the
//!   slot lock);
//! - the backend write half is shut down exactly once (`Option::take`);
//! - the reuse timer is the sole path from `Detached` to `Closed`, is
//!   aborted on re-attach and on close, and re-checks state under the lock
//!   before acting, so a late firing can never kill a live session.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rescon_wire::{Frame, SessionId};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::resend::{ResendBuffer, ResendError};
use super::SessionState;

/// Frames queued toward one client transport.
pub type ClientSink = mpsc::Sender<Frame>;

/// Why a session ended, for the close log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Backend endpoint reached EOF.
    BackendClosed,
    /// Backend endpoint I/O error.
    BackendError,
    /// Resend buffer hit its cap; dropping bytes is not an option.
    BufferOverflow,
    /// Reuse timer fired with no client attached.
    Expired,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// How long a detached session waits for its client to come back.
    pub reuse_timeout: Duration,
    /// Resend buffer cap per session, in bytes.
    pub resend_cap: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reuse_timeout: Duration::from_secs(30),
            resend_cap: 64 * 1024,
        }
    }
}

struct SessionInner {
    state: SessionState,
    buffer: ResendBuffer,
    /// Present exactly while a client transport is attached.
    sink: Option<ClientSink>,
    /// Bumped on every (re-)attach; stale pumps and timers check it.
    epoch: u64,
    reuse_timer: Option<JoinHandle<()>>,
    detached_at: Option<Instant>,
}

/// One session record. The table owns it; pumps hold `Arc`s.
pub struct SessionSlot {
    id: SessionId,
    target: Option<String>,
    inner: Mutex<SessionInner>,
    /// Flipped once, at close; unblocks the session's pumps.
    shutdown_tx: watch::Sender<bool>,
    /// Backend write half. `Option::take` at close keeps the shutdown
    /// exactly-once; the read half lives in the downlink pump.
    backend_tx: Mutex<Option<OwnedWriteHalf>>,
    /// Cumulative bytes received from the client and written backend-ward.
    received: AtomicU64,
    /// Portion of `received` already confirmed to the client.
    acked_to_client: AtomicU64,
}

impl SessionSlot {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Preferred backend name the session was created with.
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Records `n` more client bytes; returns the new cumulative count.
    pub fn note_received(&self, n: u64) -> u64 {
        self.received.fetch_add(n, Ordering::Relaxed) + n
    }

    /// Cumulative ack from the client: trims the resend buffer.
    pub async fn ack_from_client(&self, offset: u64) -> Result<(), ResendError> {
        let mut inner = self.inner.lock().await;
        inner.buffer.ack_to(offset)
    }

    /// Backend output enters the session here: always into the buffer,
    /// and out to the client when one is attached. Returns the sink and
    /// frame to send so the caller can apply backpressure outside the
    /// slot lock.
    pub(crate) async fn push_downlink(
        &self,
        chunk: Bytes,
    ) -> Result<Option<(ClientSink, Frame)>, ResendError> {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            return Ok(None);
        }
        inner.buffer.append(chunk.clone())?;
        match &inner.sink {
            Some(sink) => {
                let ack = self.received.load(Ordering::Relaxed);
                self.acked_to_client.store(ack, Ordering::Relaxed);
                Ok(Some((sink.clone(), Frame::Data { ack, payload: chunk })))
            }
            None => Ok(None),
        }
    }

    /// If enough client bytes have arrived since the last ack the client
    /// saw, claims them for a standalone ack frame.
    pub fn take_due_ack(&self, threshold: u64) -> Option<u64> {
        let received = self.received.load(Ordering::Relaxed);
        let acked = self.acked_to_client.load(Ordering::Relaxed);
        if received.saturating_sub(acked) >= threshold {
            self.acked_to_client.store(received, Ordering::Relaxed);
            Some(received)
        } else {
            None
        }
    }

    /// Writes client bytes to the backend endpoint.
    pub async fn write_backend(&self, payload: &[u8]) -> io::Result<()> {
        let mut guard = self.backend_tx.lock().await;
        match guard.as_mut() {
            Some(half) => half.write_all(payload).await,
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "backend endpoint closed",
            )),
        }
    }

    #[cfg(test)]
    pub(crate) async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }
}

/// Outcome of a resume attempt.
pub enum ResumeOutcome {
    /// The session was claimed. `replay` is every buffered byte above the
    /// client's confirmed offset; `relay_received` goes into the welcome
    /// so the client can replay its own side.
    Resumed {
        slot: Arc<SessionSlot>,
        epoch: u64,
        replay: Vec<Bytes>,
        relay_received: u64,
    },
    /// Unknown, closed, expired, still attached, or offset not coverable.
    /// The caller falls back to a brand-new session.
    NotResumable,
}

pub struct SessionTable {
    sessions: Mutex<HashMap<SessionId, Arc<SessionSlot>>>,
    cfg: SessionConfig,
    attached: AtomicUsize,
}

impl SessionTable {
    pub fn new(cfg: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            cfg,
            attached: AtomicUsize::new(0),
        })
    }

    /// Live count of attached (client, backend) pairs.
    pub fn attached_count(&self) -> usize {
        self.attached.load(Ordering::Relaxed)
    }

    /// Total session records, in any live state.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Reserves an identity for a fresh session while the backend dial is
    /// in flight.
    pub async fn begin(&self, target: Option<String>) -> Arc<SessionSlot> {
        let id = SessionId::new();
        let (shutdown_tx, _) = watch::channel(false);
        let slot = Arc::new(SessionSlot {
            id,
            target,
            inner: Mutex::new(SessionInner {
                state: SessionState::Pending,
                buffer: ResendBuffer::new(self.cfg.resend_cap),
                sink: None,
                epoch: 0,
                reuse_timer: None,
                detached_at: None,
            }),
            shutdown_tx,
            backend_tx: Mutex::new(None),
            received: AtomicU64::new(0),
            acked_to_client: AtomicU64::new(0),
        });
        self.sessions.lock().await.insert(id, Arc::clone(&slot));
        debug!(session_id = %id, "Session pending");
        slot
    }

    /// The dial failed: the record is removed outright, nothing retained.
    pub async fn abort_pending(&self, slot: &Arc<SessionSlot>) {
        self.sessions.lock().await.remove(&slot.id);
        let mut inner = slot.inner.lock().await;
        inner.state = SessionState::Closed;
        debug!(session_id = %slot.id, "Pending session aborted");
    }

    /// Pending → Attached with the dialed backend and the first client
    /// sink. Returns the attachment epoch.
    pub async fn attach_new(
        &self,
        slot: &Arc<SessionSlot>,
        backend_tx: OwnedWriteHalf,
        sink: ClientSink,
    ) -> u64 {
        let mut inner = slot.inner.lock().await;
        debug_assert_eq!(inner.state, SessionState::Pending);
        *slot.backend_tx.lock().await = Some(backend_tx);
        inner.state = SessionState::Attached;
        inner.sink = Some(sink);
        self.attached.fetch_add(1, Ordering::Relaxed);
        info!(session_id = %slot.id, "Session attached");
        inner.epoch
    }

    /// Attempts to claim a detached session for a new client transport.
    pub async fn resume(
        &self,
        id: SessionId,
        client_received: u64,
        sink: ClientSink,
    ) -> ResumeOutcome {
        let slot = { self.sessions.lock().await.get(&id).cloned() };
        let Some(slot) = slot else {
            debug!(session_id = %id, "Resume for unknown session");
            return ResumeOutcome::NotResumable;
        };

        let mut inner = slot.inner.lock().await;
        if inner.state != SessionState::Detached {
            debug!(session_id = %id, state = ?inner.state, "Resume refused: not detached");
            return ResumeOutcome::NotResumable;
        }
        if inner
            .detached_at
            .is_some_and(|at| at.elapsed() >= self.cfg.reuse_timeout)
        {
            // The timer task will reap it; this transport gets a fresh
            // session.
            debug!(session_id = %id, "Resume refused: reuse window elapsed");
            return ResumeOutcome::NotResumable;
        }
        if !inner.buffer.covers(client_received) {
            warn!(
                session_id = %id,
                client_received,
                acknowledged = inner.buffer.acknowledged(),
                end = inner.buffer.end_offset(),
                "Resume refused: offset outside the buffered window"
            );
            return ResumeOutcome::NotResumable;
        }

        let replay = match inner
            .buffer
            .ack_to(client_received)
            .and_then(|()| inner.buffer.replay_from(client_received))
        {
            Ok(replay) => replay,
            Err(err) => {
                warn!(session_id = %id, error = %err, "Resume refused: buffer rejected offset");
                return ResumeOutcome::NotResumable;
            }
        };

        if let Some(timer) = inner.reuse_timer.take() {
            timer.abort();
        }
        inner.state = SessionState::Attached;
        inner.epoch += 1;
        inner.sink = Some(sink);
        inner.detached_at = None;
        let epoch = inner.epoch;
        drop(inner);

        self.attached.fetch_add(1, Ordering::Relaxed);
        let relay_received = slot.received.load(Ordering::Relaxed);
        // The welcome tells the client how much we have; that is an ack.
        slot.acked_to_client.store(relay_received, Ordering::Relaxed);

        info!(
            session_id = %id,
            epoch,
            replayed_chunks = replay.len(),
            "Session resumed"
        );
        ResumeOutcome::Resumed {
            slot,
            epoch,
            replay,
            relay_received,
        }
    }

    /// The client transport of attachment `epoch` ended. Stale epochs are
    /// ignored, so a pump of a replaced attachment can never detach its
    /// successor.
    pub async fn detach(self: &Arc<Self>, slot: &Arc<SessionSlot>, epoch: u64) {
        let mut inner = slot.inner.lock().await;
        if inner.state != SessionState::Attached || inner.epoch != epoch {
            return;
        }
        inner.state = SessionState::Detached;
        inner.sink = None;
        inner.detached_at = Some(Instant::now());
        self.attached.fetch_sub(1, Ordering::Relaxed);

        let table = Arc::clone(self);
        let timer_slot = Arc::clone(slot);
        let reuse_timeout = self.cfg.reuse_timeout;
        inner.reuse_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(reuse_timeout).await;
            table.close_expired(&timer_slot, epoch).await;
        }));

        info!(
            session_id = %slot.id,
            reuse_timeout_ms = reuse_timeout.as_millis() as u64,
            "Session detached, reuse timer armed"
        );
    }

    /// Unconditional close (backend death, buffer overflow). Idempotent.
    pub async fn close(&self, slot: &Arc<SessionSlot>, reason: CloseReason) {
        self.close_inner(slot, reason, None).await;
    }

    /// Reuse-timer path: closes only if the slot is still the same
    /// detached attachment the timer was armed for.
    async fn close_expired(&self, slot: &Arc<SessionSlot>, epoch: u64) {
        self.close_inner(slot, CloseReason::Expired, Some(epoch)).await;
    }

    async fn close_inner(
        &self,
        slot: &Arc<SessionSlot>,
        reason: CloseReason,
        expired_epoch: Option<u64>,
    ) {
        {
            let mut sessions = self.sessions.lock().await;
            let mut inner = slot.inner.lock().await;
            if inner.state == SessionState::Closed {
                return;
            }
            if let Some(epoch) = expired_epoch {
                if inner.state != SessionState::Detached || inner.epoch != epoch {
                    return;
                }
            }
            if inner.state == SessionState::Attached {
                self.attached.fetch_sub(1, Ordering::Relaxed);
            }
            inner.state = SessionState::Closed;
            inner.sink = None;
            if let Some(timer) = inner.reuse_timer.take() {
                timer.abort();
            }
            sessions.remove(&slot.id);
        }

        // Outside the locks: wake the pumps, then close the backend write
        // half exactly once. The downlink pump drops the read half when the
        // shutdown signal lands.
        let _ = slot.shutdown_tx.send(true);
        if let Some(mut half) = slot.backend_tx.lock().await.take() {
            let _ = half.shutdown().await;
        }
        info!(session_id = %slot.id, reason = ?reason, "Session closed");
    }
}
