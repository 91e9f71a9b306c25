//! Per-connection driver task and the user-facing stream handle.
//!
//! Each connection is a pair: a [`DgramStream`] handed to the caller, and a
//! driver task owning the other end of an in-memory duplex pipe. The driver
//! turns bytes written by the caller into sequenced segments (coalescing,
//! send window, FEC parity) and turns received segments back into ordered
//! bytes (reassembly, reconstruction, cumulative acks).

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::fec::{FecDecoder, FecEncoder, ParityBlock};
use crate::segment::{SegKind, Segment, MAX_SEG_PAYLOAD};
use crate::window::{Reassembly, SendWindow};
use crate::DgramConfig;

/// In-memory pipe capacity between caller and driver.
pub(crate) const PIPE_CAP: usize = 64 * 1024;

/// Staged upload bytes the driver will buffer before pausing caller reads.
const STAGING_CAP: usize = 64 * 1024;

/// Driver housekeeping cadence: retransmit timeouts and coalescing
/// deadlines are checked at this resolution.
const TICK: Duration = Duration::from_millis(25);

/// Transmissions per segment before the connection is declared dead.
const MAX_TX: u32 = 10;

/// An established datagram connection behaving like a byte stream.
#[derive(Debug)]
pub struct DgramStream {
    io: DuplexStream,
    peer: SocketAddr,
}

impl DgramStream {
    pub(crate) fn new(io: DuplexStream, peer: SocketAddr) -> Self {
        Self { io, peer }
    }

    /// Address of the remote endpoint.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl AsyncRead for DgramStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for DgramStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// Removes the connection from the endpoint's demux map when the driver
/// exits, however it exits.
pub(crate) struct ConnGuard {
    pub remove: Box<dyn FnOnce() + Send + Sync>,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        let remove = std::mem::replace(&mut self.remove, Box::new(|| {}));
        remove();
    }
}

pub(crate) struct Driver {
    pub io: DuplexStream,
    pub socket: Arc<UdpSocket>,
    pub peer: SocketAddr,
    pub conn: u32,
    pub rx: mpsc::Receiver<Segment>,
    pub cfg: DgramConfig,
    pub _guard: ConnGuard,
}

struct DriverState {
    window: SendWindow,
    reasm: Reassembly,
    fec_enc: Option<FecEncoder>,
    fec_dec: Option<FecDecoder>,
    staging: BytesMut,
    staging_since: Option<Instant>,
    app_eof: bool,
    fin_sent: bool,
    peer_fin: bool,
}

impl Driver {
    pub async fn run(self) {
        let conn = self.conn;
        let peer = self.peer;
        if let Err(e) = self.run_inner().await {
            debug!(conn, peer = %peer, error = %e, "dgram connection ended with error");
        } else {
            trace!(conn, peer = %peer, "dgram connection closed");
        }
    }

    async fn run_inner(mut self) -> io::Result<()> {
        let mut st = DriverState {
            window: SendWindow::new(self.cfg.window),
            reasm: Reassembly::new(self.cfg.window),
            fec_enc: self.cfg.fec.map(FecEncoder::new),
            fec_dec: self.cfg.fec.map(FecDecoder::new),
            staging: BytesMut::with_capacity(STAGING_CAP),
            staging_since: None,
            app_eof: false,
            fin_sent: false,
            peer_fin: false,
        };
        let mut tick = tokio::time::interval(TICK);

        loop {
            if st.peer_fin && st.fin_sent && st.window.is_empty() && st.staging.is_empty() {
                return Ok(());
            }

            let want_app_read = !st.app_eof && st.staging.len() < STAGING_CAP;

            tokio::select! {
                maybe_seg = self.rx.recv() => {
                    match maybe_seg {
                        Some(seg) => self.on_segment(&mut st, seg).await?,
                        None => {
                            return Err(io::Error::new(
                                io::ErrorKind::ConnectionReset,
                                "endpoint closed",
                            ));
                        }
                    }
                }
                read = self.io.read_buf(&mut st.staging), if want_app_read => {
                    match read {
                        Ok(0) => st.app_eof = true,
                        Ok(_) => {
                            if st.staging_since.is_none() {
                                st.staging_since = Some(Instant::now());
                            }
                        }
                        // Caller dropped the stream without shutdown.
                        Err(_) => st.app_eof = true,
                    }
                }
                _ = tick.tick() => {
                    self.on_tick(&mut st).await?;
                }
            }

            self.pump_staging(&mut st).await?;
        }
    }

    /// True when staged bytes should be segmented now.
    fn flush_due(&self, st: &DriverState) -> bool {
        if st.staging.is_empty() {
            return false;
        }
        let c = &self.cfg.coalesce;
        if c.min_packet == 0 || st.staging.len() >= c.min_packet || st.app_eof {
            return true;
        }
        st.staging_since.is_some_and(|t| t.elapsed() >= c.max_delay)
    }

    async fn pump_staging(&mut self, st: &mut DriverState) -> io::Result<()> {
        while st.window.can_send() && self.flush_due(st) {
            let n = st.staging.len().min(MAX_SEG_PAYLOAD);
            let chunk = st.staging.split_to(n).freeze();
            self.send_data(st, chunk).await?;
        }
        if st.staging.is_empty() {
            st.staging_since = None;
        }
        if st.app_eof && st.staging.is_empty() && !st.fin_sent && st.window.can_send() {
            let seq = st.window.push(SegKind::Fin, Bytes::new(), Instant::now());
            st.fin_sent = true;
            self.send(SegKind::Fin, seq, st.reasm.cumulative(), Bytes::new())
                .await?;
        }
        Ok(())
    }

    async fn send_data(&mut self, st: &mut DriverState, chunk: Bytes) -> io::Result<()> {
        let seq = st.window.push(SegKind::Data, chunk.clone(), Instant::now());
        self.send(SegKind::Data, seq, st.reasm.cumulative(), chunk.clone())
            .await?;

        let blocks = match &mut st.fec_enc {
            Some(enc) => enc.push(seq, &chunk),
            None => Vec::new(),
        };
        for block in blocks {
            self.send(
                SegKind::Parity,
                block.group_start,
                st.reasm.cumulative(),
                block.encode_payload(),
            )
            .await?;
        }
        Ok(())
    }

    async fn send(&self, kind: SegKind, seq: u32, ack: u32, payload: Bytes) -> io::Result<()> {
        let seg = Segment {
            conn: self.conn,
            kind,
            seq,
            ack,
            payload,
        };
        self.socket.send_to(&seg.encode(), self.peer).await?;
        Ok(())
    }

    async fn on_segment(&mut self, st: &mut DriverState, seg: Segment) -> io::Result<()> {
        match seg.kind {
            SegKind::Syn => {
                // Handshake retransmit from the peer; confirm again.
                self.send(SegKind::SynAck, 0, st.reasm.cumulative(), Bytes::new())
                    .await?;
            }
            SegKind::SynAck => {}
            SegKind::Ack => {
                st.window.ack(seg.ack);
            }
            SegKind::Data | SegKind::Fin => {
                st.window.ack(seg.ack);
                let rebuilt = match (&mut st.fec_dec, seg.kind) {
                    (Some(dec), SegKind::Data) if !st.reasm.is_duplicate(seg.seq) => {
                        dec.observe_data(seg.seq, &seg.payload)
                    }
                    _ => Vec::new(),
                };
                self.deliver(st, seg.kind, seg.seq, seg.payload).await?;
                for (seq, payload) in rebuilt {
                    self.deliver(st, SegKind::Data, seq, payload).await?;
                }
                self.send(SegKind::Ack, 0, st.reasm.cumulative(), Bytes::new())
                    .await?;
            }
            SegKind::Parity => {
                st.window.ack(seg.ack);
                let rebuilt = match &mut st.fec_dec {
                    Some(dec) => match ParityBlock::decode_payload(seg.seq, seg.payload) {
                        Some(block) => dec.observe_parity(block),
                        None => {
                            trace!(conn = self.conn, "dropping malformed parity segment");
                            Vec::new()
                        }
                    },
                    None => Vec::new(),
                };
                if !rebuilt.is_empty() {
                    for (seq, payload) in rebuilt {
                        self.deliver(st, SegKind::Data, seq, payload).await?;
                    }
                    self.send(SegKind::Ack, 0, st.reasm.cumulative(), Bytes::new())
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Runs one data-bearing segment through reassembly and writes whatever
    /// became deliverable to the caller.
    async fn deliver(
        &mut self,
        st: &mut DriverState,
        kind: SegKind,
        seq: u32,
        payload: Bytes,
    ) -> io::Result<()> {
        for (kind, payload) in st.reasm.insert(seq, kind, payload) {
            match kind {
                SegKind::Fin => {
                    st.peer_fin = true;
                    // Propagate EOF to the caller's read half.
                    let _ = self.io.shutdown().await;
                }
                _ => {
                    if self.io.write_all(&payload).await.is_err() {
                        // Caller is gone; nothing left to deliver to.
                        return Err(io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            "stream dropped by caller",
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    async fn on_tick(&mut self, st: &mut DriverState) -> io::Result<()> {
        if st.window.timed_out(self.cfg.rto, Instant::now()) {
            let (resend, max_tx) = st.window.mark_retransmit(Instant::now());
            if max_tx > MAX_TX {
                warn!(
                    conn = self.conn,
                    peer = %self.peer,
                    "giving up after {MAX_TX} transmissions"
                );
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "peer stopped acknowledging",
                ));
            }
            trace!(conn = self.conn, segments = resend.len(), "retransmitting window");
            for entry in resend {
                self.send(entry.kind, entry.seq, st.reasm.cumulative(), entry.payload)
                    .await?;
            }
        }
        Ok(())
    }
}
