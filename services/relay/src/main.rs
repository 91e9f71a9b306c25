//! rescond, the rescon relay daemon.
//!
//! Bootstrap only: parse flags, initialize tracing, load the backend
//! pool, wire signals into the control channel, and start one listener
//! per configured transport. Everything else lives in the library.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rescon_dgram::DgramListener;
use rescon_relay::{
    control, run_control_loop, run_dgram_listener, run_tcp_listener, Args, BackendProvider,
    PoolHandle, RelayContext, RelayStats, SessionTable, DEFAULT_HANDSHAKE_TIMEOUT,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing (RUST_LOG overrides --log).
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| args.log.clone().into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting rescond");

    // No previous pool exists at startup, so a load failure is fatal.
    let pool = Arc::new(
        PoolHandle::load(&args.pool)
            .await
            .context("loading backend pool")?,
    );

    let provider = Arc::new(BackendProvider::new(Arc::clone(&pool)));
    let table = SessionTable::new(args.session_config());
    let stats = RelayStats::new();
    let ctx = Arc::new(RelayContext {
        table: Arc::clone(&table),
        provider,
        stats: Arc::clone(&stats),
        handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
    });

    let (control_tx, control_rx) = mpsc::channel(8);
    tokio::spawn(run_control_loop(
        control_rx,
        Arc::clone(&pool),
        Arc::clone(&table),
        Arc::clone(&stats),
    ));
    #[cfg(unix)]
    control::wire_signals(control_tx.clone()).context("installing signal handlers")?;
    // Held for the life of main so the control loop never sees a closed
    // channel, signals or not.
    let _control_tx = control_tx;

    let (tcp_on, dgram_on) = args.transports();
    info!(
        listen = %args.listen,
        tcp = tcp_on,
        dgram = dgram_on,
        reuse_timeout_s = args.reuse_timeout,
        resend_buffer = args.resend_buffer,
        "Configuration loaded"
    );

    let mut listeners = Vec::new();

    if tcp_on {
        let listener = TcpListener::bind(args.listen)
            .await
            .with_context(|| format!("binding tcp listener on {}", args.listen))?;
        let ctx = Arc::clone(&ctx);
        listeners.push(tokio::spawn(async move {
            if let Err(e) = run_tcp_listener(ctx, listener).await {
                error!(error = %e, "TCP listener failed");
            }
        }));
    }

    if dgram_on {
        let listener = DgramListener::bind(args.listen, args.dgram_config())
            .await
            .with_context(|| format!("binding dgram listener on {}", args.listen))?;
        let ctx = Arc::clone(&ctx);
        listeners.push(tokio::spawn(async move {
            if let Err(e) = run_dgram_listener(ctx, listener).await {
                error!(error = %e, "Dgram listener failed");
            }
        }));
    }

    for listener in listeners {
        let _ = listener.await;
    }
    Ok(())
}
