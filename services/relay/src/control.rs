//! Runtime control plane.
//!
//! Control actions arrive as messages on a channel and are executed by a
//! dedicated task, keeping the core decoupled from whatever mechanism
//! triggers them. `main` wires OS signals to the channel: SIGHUP reloads
//! the backend pool, SIGUSR1 logs a status report, SIGTERM is logged and
//! deliberately ignored, since tearing sessions down abruptly is exactly
//! what this relay exists to avoid.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::pool::PoolHandle;
use crate::proxy::RelayStats;
use crate::session::SessionTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Re-read the pool file; on failure the active pool stays.
    ReloadPool,
    /// Log a status report (session pairs, workers, table size).
    ReportStatus,
    /// Log and ignore.
    Terminate,
}

/// Consumes control commands until every sender is gone.
pub async fn run_control_loop(
    mut rx: mpsc::Receiver<ControlCommand>,
    pool: Arc<PoolHandle>,
    table: Arc<SessionTable>,
    stats: Arc<RelayStats>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            ControlCommand::ReloadPool => match pool.reload().await {
                Ok(()) => info!("Pool reload succeeded"),
                Err(err) => {
                    warn!(error = %err, "Pool reload failed; previous pool stays active");
                }
            },
            ControlCommand::ReportStatus => {
                let sessions = table.session_count().await;
                info!(
                    attached_pairs = table.attached_count(),
                    sessions = sessions,
                    workers = stats.workers(),
                    "Status report"
                );
            }
            ControlCommand::Terminate => {
                warn!("Terminate requested; ignoring, sessions keep running");
            }
        }
    }
}

/// Routes SIGHUP / SIGUSR1 / SIGTERM into the control channel.
#[cfg(unix)]
pub fn wire_signals(tx: mpsc::Sender<ControlCommand>) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let routes = [
        (SignalKind::hangup(), ControlCommand::ReloadPool),
        (SignalKind::user_defined1(), ControlCommand::ReportStatus),
        (SignalKind::terminate(), ControlCommand::Terminate),
    ];

    for (kind, cmd) in routes {
        let mut stream = signal(kind)?;
        let tx = tx.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                if tx.send(cmd).await.is_err() {
                    break;
                }
            }
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;

    #[tokio::test]
    async fn control_loop_survives_failed_reload() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("rescon-control-test-{}.json", std::process::id()));
        tokio::fs::write(
            &path,
            r#"{"hosts": [{"addr": "127.0.0.1:9001", "weight": 1, "name": "alpha"}]}"#,
        )
        .await
        .unwrap();

        let pool = Arc::new(PoolHandle::load(&path).await.unwrap());
        let table = SessionTable::new(SessionConfig::default());
        let stats = RelayStats::new();

        // Poison the file so the reload fails.
        tokio::fs::write(&path, "not json").await.unwrap();

        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(run_control_loop(
            rx,
            Arc::clone(&pool),
            table,
            stats,
        ));

        tx.send(ControlCommand::ReloadPool).await.unwrap();
        tx.send(ControlCommand::ReportStatus).await.unwrap();
        tx.send(ControlCommand::Terminate).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        // The pre-poison pool is still the active one.
        assert!(pool.snapshot().select_by_name("alpha").is_some());
        let _ = tokio::fs::remove_file(&path).await;
    }
}
