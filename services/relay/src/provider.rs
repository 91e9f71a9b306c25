//! Backend connection provisioning.
//!
//! [`BackendProvider`] answers "give me a backend connection for this
//! session": pool selection (weighted, or by name when the client asked
//! for one), a timed dial, and an optional post-dial wrap hook that may
//! substitute the connection. There is deliberately no retry and no
//! fallback: a routing or dial failure fails the session being
//! provisioned, and the client is expected to reconnect.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::pool::{HostDescriptor, PoolHandle};

/// Default backend connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Post-dial hook: may replace the dialed connection with another one
/// (for instance, one tunneled through a different path).
#[async_trait]
pub trait ConnWrap: Send + Sync {
    async fn wrap(&self, conn: TcpStream, host: &HostDescriptor) -> io::Result<TcpStream>;
}

/// Attempt to install a second wrap hook. Construction-time, fatal.
#[derive(Debug, Error)]
#[error("a connection wrap hook is already installed")]
pub struct HookAlreadySet;

/// Errors provisioning a backend connection.
#[derive(Debug, Error)]
pub enum ProvideError {
    #[error("no backend named {0:?}")]
    UnknownName(String),

    #[error("backend pool is empty")]
    EmptyPool,

    #[error("dial {addr} failed: {source}")]
    Dial {
        addr: SocketAddr,
        source: io::Error,
    },

    #[error("connection wrap hook failed: {0}")]
    Wrap(#[source] io::Error),
}

pub struct BackendProvider {
    pool: Arc<PoolHandle>,
    wrap: Option<Arc<dyn ConnWrap>>,
    connect_timeout: Duration,
}

impl BackendProvider {
    pub fn new(pool: Arc<PoolHandle>) -> Self {
        Self {
            pool,
            wrap: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Installs the single wrap hook. A second install is refused rather
    /// than silently overwriting the first.
    pub fn with_wrap(mut self, wrap: Arc<dyn ConnWrap>) -> Result<Self, HookAlreadySet> {
        if self.wrap.is_some() {
            return Err(HookAlreadySet);
        }
        self.wrap = Some(wrap);
        Ok(self)
    }

    /// Selects a backend and dials it.
    ///
    /// An empty `preferred` means weighted selection; a name that is not
    /// in the pool is a hard routing failure, never a weighted fallback.
    pub async fn provide(&self, preferred: Option<&str>) -> Result<TcpStream, ProvideError> {
        let pool = self.pool.snapshot();

        let host = match preferred.filter(|n| !n.is_empty()) {
            Some(name) => pool.select_by_name(name).ok_or_else(|| {
                warn!(name, "No backend with requested name");
                ProvideError::UnknownName(name.to_string())
            })?,
            None => pool.select_weighted().ok_or(ProvideError::EmptyPool)?,
        };

        debug!(
            addr = %host.addr,
            name = host.name.as_deref().unwrap_or(""),
            "Dialing backend"
        );

        let conn = match timeout(self.connect_timeout, TcpStream::connect(host.addr)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(source)) => {
                return Err(ProvideError::Dial {
                    addr: host.addr,
                    source,
                })
            }
            Err(_) => {
                return Err(ProvideError::Dial {
                    addr: host.addr,
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timeout"),
                })
            }
        };

        match &self.wrap {
            None => Ok(conn),
            Some(wrap) => match wrap.wrap(conn, host).await {
                Ok(wrapped) => Ok(wrapped),
                // The dialed connection was consumed by the hook; whatever
                // it did with it, the failure propagates unretried.
                Err(source) => Err(ProvideError::Wrap(source)),
            },
        }
    }
}
