//! UDP endpoint: one socket, many connections.
//!
//! A single reader task owns the socket's receive path and demultiplexes
//! segments to per-connection driver tasks by `(peer address, conn id)`.
//! The accept path materializes a new connection on the first `Syn` from
//! an unknown pair; the connect path performs the `Syn`/`SynAck` exchange
//! before handing the caller a stream.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::conn::{ConnGuard, DgramStream, Driver, PIPE_CAP};
use crate::segment::{SegKind, Segment};
use crate::{DgramConfig, DgramError};

/// Segments queued per connection between the reader task and its driver.
const CONN_QUEUE: usize = 256;

/// Pending connections awaiting `accept`.
const ACCEPT_BACKLOG: usize = 64;

/// `Syn` retransmission schedule for the connect path.
const CONNECT_ATTEMPTS: u32 = 8;
const CONNECT_RETRY: Duration = Duration::from_millis(250);

type ConnKey = (SocketAddr, u32);

struct Endpoint {
    socket: Arc<UdpSocket>,
    conns: Mutex<HashMap<ConnKey, mpsc::Sender<Segment>>>,
    /// Signalled when the map drains; lets a connect-side reader exit.
    idle: Notify,
}

impl Endpoint {
    fn new(socket: Arc<UdpSocket>) -> Arc<Self> {
        Arc::new(Self {
            socket,
            conns: Mutex::new(HashMap::new()),
            idle: Notify::new(),
        })
    }

    fn register(self: &Arc<Self>, key: ConnKey) -> (mpsc::Receiver<Segment>, ConnGuard) {
        let (tx, rx) = mpsc::channel(CONN_QUEUE);
        self.conns
            .lock()
            .expect("conn map poisoned")
            .insert(key, tx);

        let endpoint = Arc::clone(self);
        let guard = ConnGuard {
            remove: Box::new(move || {
                let mut conns = endpoint.conns.lock().expect("conn map poisoned");
                conns.remove(&key);
                if conns.is_empty() {
                    // notify_one stores a permit, so the reader catches the
                    // drain even if it is parked in recv_from right now.
                    endpoint.idle.notify_one();
                }
            }),
        };
        (rx, guard)
    }

    fn spawn_driver(
        self: &Arc<Self>,
        key: ConnKey,
        rx: mpsc::Receiver<Segment>,
        guard: ConnGuard,
        cfg: DgramConfig,
    ) -> DgramStream {
        let (app_side, driver_side) = tokio::io::duplex(PIPE_CAP);
        let driver = Driver {
            io: driver_side,
            socket: Arc::clone(&self.socket),
            peer: key.0,
            conn: key.1,
            rx,
            cfg,
            _guard: guard,
        };
        tokio::spawn(driver.run());
        DgramStream::new(app_side, key.0)
    }
}

/// Receive loop: decode, demultiplex, accept.
///
/// `accept_tx` is `None` on the connect side, which also exits once its
/// only connection is gone.
async fn run_reader(
    endpoint: Arc<Endpoint>,
    cfg: DgramConfig,
    accept_tx: Option<mpsc::Sender<DgramStream>>,
) {
    let mut buf = vec![0u8; 2048];
    loop {
        let (n, from) = tokio::select! {
            received = endpoint.socket.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "udp receive failed");
                    continue;
                }
            },
            _ = endpoint.idle.notified(), if accept_tx.is_none() => {
                if endpoint.conns.lock().expect("conn map poisoned").is_empty() {
                    return;
                }
                continue;
            }
        };

        let seg = match Segment::decode(Bytes::copy_from_slice(&buf[..n])) {
            Ok(seg) => seg,
            Err(e) => {
                trace!(from = %from, error = %e, "dropping malformed datagram");
                continue;
            }
        };
        let key = (from, seg.conn);

        let existing = endpoint
            .conns
            .lock()
            .expect("conn map poisoned")
            .get(&key)
            .cloned();
        if let Some(tx) = existing {
            // A full queue means the driver is badly behind; the peer will
            // retransmit, so shedding here is safe.
            let _ = tx.try_send(seg);
            continue;
        }

        match (&accept_tx, seg.kind) {
            (Some(accept), SegKind::Syn) => {
                let (rx, guard) = endpoint.register(key);
                let stream = endpoint.spawn_driver(key, rx, guard, cfg);
                // Forward the Syn so the driver answers with SynAck.
                if let Some(tx) = endpoint
                    .conns
                    .lock()
                    .expect("conn map poisoned")
                    .get(&key)
                    .cloned()
                {
                    let _ = tx.try_send(seg);
                }
                debug!(peer = %from, conn = key.1, "dgram connection accepted");
                if accept.try_send(stream).is_err() {
                    warn!(peer = %from, "accept backlog full, dropping connection");
                }
            }
            _ => trace!(from = %from, "dropping segment for unknown connection"),
        }
    }
}

/// Listening side of the datagram transport.
pub struct DgramListener {
    accept_rx: mpsc::Receiver<DgramStream>,
    local: SocketAddr,
    reader: JoinHandle<()>,
}

impl DgramListener {
    /// Binds a UDP socket and starts the demultiplexing reader.
    pub async fn bind(addr: SocketAddr, cfg: DgramConfig) -> Result<Self, DgramError> {
        cfg.validate()?;
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local = socket.local_addr()?;
        let endpoint = Endpoint::new(socket);
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let reader = tokio::spawn(run_reader(endpoint, cfg, Some(accept_tx)));
        Ok(Self {
            accept_rx,
            local,
            reader,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Waits for the next established connection.
    pub async fn accept(&mut self) -> io::Result<DgramStream> {
        self.accept_rx.recv().await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "listener reader task ended")
        })
    }
}

impl Drop for DgramListener {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Process-local distinguisher mixed into outgoing connection ids.
static NEXT_CONN: AtomicU32 = AtomicU32::new(1);

fn fresh_conn_id() -> u32 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    NEXT_CONN
        .fetch_add(0x9e37_79b9, Ordering::Relaxed)
        .wrapping_add(nanos)
}

/// Establishes a datagram connection to `addr`.
pub async fn connect(addr: SocketAddr, cfg: DgramConfig) -> Result<DgramStream, DgramError> {
    cfg.validate()?;
    let bind_addr: SocketAddr = if addr.is_ipv4() {
        "0.0.0.0:0".parse().expect("literal addr")
    } else {
        "[::]:0".parse().expect("literal addr")
    };
    let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
    let endpoint = Endpoint::new(Arc::clone(&socket));

    let conn = fresh_conn_id();
    let key = (addr, conn);
    let (mut rx, guard) = endpoint.register(key);
    tokio::spawn(run_reader(Arc::clone(&endpoint), cfg, None));

    let syn = Segment {
        conn,
        kind: SegKind::Syn,
        seq: 0,
        ack: 0,
        payload: Bytes::new(),
    };

    let mut confirmed = false;
    'attempts: for _ in 0..CONNECT_ATTEMPTS {
        socket.send_to(&syn.encode(), addr).await?;
        let deadline = tokio::time::sleep(CONNECT_RETRY);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                maybe_seg = rx.recv() => match maybe_seg {
                    Some(seg) if seg.kind == SegKind::SynAck => {
                        confirmed = true;
                        break 'attempts;
                    }
                    Some(_) => continue,
                    None => return Err(DgramError::ConnectTimeout(CONNECT_ATTEMPTS)),
                },
                _ = &mut deadline => break,
            }
        }
    }
    if !confirmed {
        return Err(DgramError::ConnectTimeout(CONNECT_ATTEMPTS));
    }

    Ok(endpoint.spawn_driver(key, rx, guard, cfg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::{CoalesceConfig, FecConfig};

    async fn echo_server(mut listener: DgramListener) {
        while let Ok(mut stream) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = stream.shutdown().await;
            });
        }
    }

    async fn round_trip_with(cfg: DgramConfig) {
        let listener = DgramListener::bind("127.0.0.1:0".parse().unwrap(), cfg)
            .await
            .unwrap();
        let addr = listener.local_addr();
        tokio::spawn(echo_server(listener));

        let mut client = connect(addr, cfg).await.unwrap();
        let message = b"the quick brown fox jumps over the lazy dog".repeat(64);
        client.write_all(&message).await.unwrap();
        client.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, message);
    }

    #[tokio::test]
    async fn plain_round_trip() {
        round_trip_with(DgramConfig::default()).await;
    }

    #[tokio::test]
    async fn fec_round_trip() {
        round_trip_with(DgramConfig {
            fec: Some(FecConfig {
                data_shards: 4,
                parity_shards: 2,
            }),
            ..DgramConfig::default()
        })
        .await;
    }

    #[tokio::test]
    async fn coalesced_round_trip() {
        round_trip_with(DgramConfig {
            coalesce: CoalesceConfig {
                min_packet: 512,
                max_delay: Duration::from_millis(20),
            },
            ..DgramConfig::default()
        })
        .await;
    }

    #[tokio::test]
    async fn coalescing_delay_flushes_short_writes() {
        let cfg = DgramConfig {
            coalesce: CoalesceConfig {
                min_packet: 4096,
                max_delay: Duration::from_millis(30),
            },
            ..DgramConfig::default()
        };
        let listener = DgramListener::bind("127.0.0.1:0".parse().unwrap(), cfg)
            .await
            .unwrap();
        let addr = listener.local_addr();
        tokio::spawn(echo_server(listener));

        let mut client = connect(addr, cfg).await.unwrap();
        // Far below min_packet: only the delay trigger can flush this.
        client.write_all(b"tiny").await.unwrap();

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("delay trigger must flush")
            .unwrap();
        assert_eq!(&buf[..n], b"tiny");
    }

    #[tokio::test]
    async fn connect_to_dead_peer_times_out() {
        // Bind-then-drop guarantees nothing is listening on the port.
        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let cfg = DgramConfig::default();
        let err = connect(addr, cfg).await.unwrap_err();
        assert!(matches!(err, DgramError::ConnectTimeout(_)));
    }

    #[test]
    fn config_validation() {
        let mut cfg = DgramConfig::default();
        cfg.window = 0;
        assert!(cfg.validate().is_err());

        let bad_fec = DgramConfig {
            fec: Some(FecConfig {
                data_shards: 2,
                parity_shards: 3,
            }),
            ..DgramConfig::default()
        };
        assert!(bad_fec.validate().is_err());

        assert!(DgramConfig::default().validate().is_ok());
    }
}
