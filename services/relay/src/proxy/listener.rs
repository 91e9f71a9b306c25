//! Accept loops and the per-transport handshake path.
//!
//! One listener per configured transport kind; both feed every accepted
//! transport through the same generic [`handle_transport`], which reads
//! the resumption handshake, resolves it against the session table, and
//! runs the forwarding pumps until the attachment ends.

use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rescon_dgram::DgramListener;
use rescon_wire::{FrameReader, FrameWriter, Hello, Welcome};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn, Instrument};

use crate::provider::BackendProvider;
use crate::session::{ResumeOutcome, SessionTable};

use super::pump::{run_downlink, run_uplink, run_writer};

/// How long a fresh transport may take to present its handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames queued between the pumps and one client writer.
const SINK_DEPTH: usize = 64;

/// Counters for the status report. Plain atomics: the status path must
/// never block forwarding.
#[derive(Debug, Default)]
pub struct RelayStats {
    pub accepted: AtomicU64,
    pub handshake_failures: AtomicU64,
    pub sessions_established: AtomicU64,
    pub sessions_resumed: AtomicU64,
    pub provision_failures: AtomicU64,
    workers: AtomicUsize,
}

impl RelayStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Live forwarding/handshake tasks.
    pub fn workers(&self) -> usize {
        self.workers.load(Ordering::Relaxed)
    }

    fn worker_guard(self: &Arc<Self>) -> WorkerGuard {
        self.workers.fetch_add(1, Ordering::Relaxed);
        WorkerGuard(Arc::clone(self))
    }
}

struct WorkerGuard(Arc<RelayStats>);

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.workers.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Everything the accept path needs, constructed once at startup and
/// passed around explicitly.
pub struct RelayContext {
    pub table: Arc<SessionTable>,
    pub provider: Arc<BackendProvider>,
    pub stats: Arc<RelayStats>,
    pub handshake_timeout: Duration,
}

/// Accept loop for the reliable stream transport.
pub async fn run_tcp_listener(ctx: Arc<RelayContext>, listener: TcpListener) -> io::Result<()> {
    let local_addr = listener.local_addr()?;
    info!(bind_addr = %local_addr, transport = "tcp", "Listener started");

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                ctx.stats.accepted.fetch_add(1, Ordering::Relaxed);
                let ctx = Arc::clone(&ctx);
                tokio::spawn(
                    async move { handle_transport(ctx, stream).await }
                        .instrument(tracing::info_span!("client", peer = %peer_addr)),
                );
            }
            Err(e) => {
                error!(error = %e, "Accept error");
                // Brief sleep to avoid a tight loop on persistent errors.
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Accept loop for the FEC datagram transport.
pub async fn run_dgram_listener(
    ctx: Arc<RelayContext>,
    mut listener: DgramListener,
) -> io::Result<()> {
    info!(bind_addr = %listener.local_addr(), transport = "dgram", "Listener started");

    loop {
        let stream = listener.accept().await?;
        let peer_addr = stream.peer_addr();
        ctx.stats.accepted.fetch_add(1, Ordering::Relaxed);
        let ctx = Arc::clone(&ctx);
        tokio::spawn(
            async move { handle_transport(ctx, stream).await }
                .instrument(tracing::info_span!("client", peer = %peer_addr, transport = "dgram")),
        );
    }
}

/// Handshake, session resolution, forwarding. Generic over the transport:
/// both kinds present the same ordered byte stream.
pub async fn handle_transport<S>(ctx: Arc<RelayContext>, stream: S)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let _worker = ctx.stats.worker_guard();

    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    let hello = match tokio::time::timeout(ctx.handshake_timeout, reader.read_hello()).await {
        Ok(Ok(hello)) => hello,
        Ok(Err(err)) => {
            ctx.stats.handshake_failures.fetch_add(1, Ordering::Relaxed);
            debug!(error = %err, "Handshake failed");
            return;
        }
        Err(_) => {
            ctx.stats.handshake_failures.fetch_add(1, Ordering::Relaxed);
            debug!("Handshake timed out");
            return;
        }
    };

    let (sink, sink_rx) = mpsc::channel(SINK_DEPTH);

    // A resume attempt that cannot be honored falls through to the fresh
    // path: the client is never failed outright for presenting a stale
    // identity.
    if let Hello::Resume { id, received } = hello {
        if let ResumeOutcome::Resumed {
            slot,
            epoch,
            replay,
            relay_received,
        } = ctx.table.resume(id, received, sink.clone()).await
        {
            ctx.stats.sessions_resumed.fetch_add(1, Ordering::Relaxed);
            let welcome = Welcome::Resumed {
                id,
                received: relay_received,
            };
            if writer.write_welcome(&welcome).await.is_err() {
                ctx.table.detach(&slot, epoch).await;
                return;
            }

            let writer_guard = ctx.stats.worker_guard();
            tokio::spawn({
                let table = Arc::clone(&ctx.table);
                let slot = Arc::clone(&slot);
                async move {
                    let _worker = writer_guard;
                    run_writer(table, slot, epoch, writer, relay_received, replay, sink_rx)
                        .await;
                }
            });

            let shutdown = slot.shutdown_signal();
            run_uplink(Arc::clone(&ctx.table), slot, epoch, reader, sink, shutdown).await;
            return;
        }
    }

    let target = match &hello {
        Hello::Fresh { target } => target.clone(),
        // Failed resume: no preferred name survives the dead session.
        Hello::Resume { .. } => None,
    };

    let slot = ctx.table.begin(target.clone()).await;
    let backend = match ctx.provider.provide(target.as_deref()).await {
        Ok(conn) => conn,
        Err(err) => {
            warn!(
                session_id = %slot.id(),
                target = target.as_deref().unwrap_or(""),
                error = %err,
                "Backend provisioning failed"
            );
            ctx.stats.provision_failures.fetch_add(1, Ordering::Relaxed);
            ctx.table.abort_pending(&slot).await;
            return;
        }
    };

    let (backend_rx, backend_tx) = backend.into_split();
    let epoch = ctx.table.attach_new(&slot, backend_tx, sink.clone()).await;
    ctx.stats
        .sessions_established
        .fetch_add(1, Ordering::Relaxed);

    // Session-lifetime downlink pump: outlives this attachment on purpose.
    let downlink_guard = ctx.stats.worker_guard();
    tokio::spawn({
        let table = Arc::clone(&ctx.table);
        let slot = Arc::clone(&slot);
        let shutdown = slot.shutdown_signal();
        async move {
            let _worker = downlink_guard;
            run_downlink(table, slot, backend_rx, shutdown).await;
        }
    });

    if writer
        .write_welcome(&Welcome::Established { id: slot.id() })
        .await
        .is_err()
    {
        ctx.table.detach(&slot, epoch).await;
        return;
    }

    let writer_guard = ctx.stats.worker_guard();
    tokio::spawn({
        let table = Arc::clone(&ctx.table);
        let slot = Arc::clone(&slot);
        async move {
            let _worker = writer_guard;
            run_writer(table, slot, epoch, writer, 0, Vec::new(), sink_rx).await;
        }
    });

    let shutdown = slot.shutdown_signal();
    run_uplink(Arc::clone(&ctx.table), slot, epoch, reader, sink, shutdown).await;
}
