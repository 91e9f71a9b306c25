//! The datagram transport carries the same session protocol as TCP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rescon_dgram::{CoalesceConfig, DgramConfig, DgramListener, FecConfig};
use rescon_wire::{Frame, FrameReader, FrameWriter, Hello, Welcome};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use rescon_relay::{
    run_dgram_listener, BackendProvider, PoolHandle, RelayContext, RelayStats, SessionConfig,
    SessionTable,
};

async fn echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match conn.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if conn.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

async fn start_dgram_relay(backend_addr: SocketAddr, cfg: DgramConfig, tag: &str) -> SocketAddr {
    let pool_path = std::env::temp_dir().join(format!(
        "rescon-dgram-test-{}-{tag}.json",
        std::process::id()
    ));
    tokio::fs::write(
        &pool_path,
        format!(r#"{{"hosts": [{{"addr": "{backend_addr}", "weight": 1}}]}}"#),
    )
    .await
    .unwrap();
    let pool = Arc::new(PoolHandle::load(&pool_path).await.unwrap());
    let _ = tokio::fs::remove_file(&pool_path).await;

    let ctx = Arc::new(RelayContext {
        table: SessionTable::new(SessionConfig::default()),
        provider: Arc::new(BackendProvider::new(pool)),
        stats: RelayStats::new(),
        handshake_timeout: Duration::from_secs(2),
    });

    let listener = DgramListener::bind("127.0.0.1:0".parse().unwrap(), cfg)
        .await
        .unwrap();
    let addr = listener.local_addr();
    tokio::spawn(async move {
        let _ = run_dgram_listener(ctx, listener).await;
    });
    addr
}

async fn handshake_and_echo(relay_addr: SocketAddr, cfg: DgramConfig) {
    let stream = rescon_dgram::connect(relay_addr, cfg).await.unwrap();
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    writer.write_hello(&Hello::Fresh { target: None }).await.unwrap();
    let welcome = tokio::time::timeout(Duration::from_secs(5), reader.read_welcome())
        .await
        .expect("handshake timed out")
        .unwrap();
    assert!(matches!(welcome, Welcome::Established { .. }));

    let message = b"datagrams pretending to be a stream".repeat(8);
    writer.write_data(0, &message).await.unwrap();

    let mut echoed = Vec::new();
    while echoed.len() < message.len() {
        let frame = tokio::time::timeout(Duration::from_secs(5), reader.read_frame())
            .await
            .expect("echo timed out")
            .unwrap();
        match frame {
            Frame::Data { payload, .. } => echoed.extend_from_slice(&payload),
            Frame::Ack { .. } => continue,
        }
    }
    assert_eq!(echoed, message);
}

#[tokio::test]
async fn session_protocol_rides_the_datagram_transport() {
    let backend = echo_backend().await;
    let cfg = DgramConfig::default();
    let relay = start_dgram_relay(backend, cfg, "plain").await;
    handshake_and_echo(relay, cfg).await;
}

#[tokio::test]
async fn session_protocol_rides_fec_and_coalescing() {
    let backend = echo_backend().await;
    let cfg = DgramConfig {
        fec: Some(FecConfig {
            data_shards: 4,
            parity_shards: 1,
        }),
        coalesce: CoalesceConfig {
            min_packet: 256,
            max_delay: Duration::from_millis(20),
        },
        ..DgramConfig::default()
    };
    let relay = start_dgram_relay(backend, cfg, "fec").await;
    handshake_and_echo(relay, cfg).await;
}
