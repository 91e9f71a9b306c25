//! Backend host pool.
//!
//! The pool is described by a JSON file (`{"hosts": [{"addr", "weight",
//! "name"?}]}`), validated and resolved as a whole, and published as an
//! immutable snapshot behind an `ArcSwap`. Reload failures leave the
//! active snapshot untouched; in-flight selections keep the snapshot they
//! started with.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use rand::Rng;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

/// Errors from pool loading, validation, or lookup.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to read pool file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse pool file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to resolve backend address {addr:?}: {source}")]
    Resolve {
        addr: String,
        source: std::io::Error,
    },

    #[error("pool total weight is zero")]
    NoWeight,

    #[error("duplicate backend name {0:?}")]
    DuplicateName(String),
}

/// One host as written in the pool file.
#[derive(Debug, Clone, Deserialize)]
pub struct HostEntry {
    pub addr: String,
    pub weight: u32,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PoolFile {
    hosts: Vec<HostEntry>,
}

/// A validated, resolved backend host.
#[derive(Debug, Clone)]
pub struct HostDescriptor {
    /// Resolved dial address.
    pub addr: SocketAddr,
    pub weight: u32,
    pub name: Option<String>,
    /// Address as configured, for logs.
    pub source: String,
}

/// Immutable snapshot of the backend pool.
#[derive(Debug, Default)]
pub struct HostPool {
    hosts: Vec<HostDescriptor>,
    total_weight: u64,
}

impl HostPool {
    /// Resolves and validates a set of entries into a publishable pool.
    ///
    /// Fails atomically: any unresolvable address, a duplicate non-empty
    /// name, or a zero total weight rejects the whole set.
    pub async fn from_entries(entries: Vec<HostEntry>) -> Result<Self, PoolError> {
        let mut hosts = Vec::with_capacity(entries.len());
        let mut total_weight: u64 = 0;

        for entry in entries {
            let addr = tokio::net::lookup_host(&entry.addr)
                .await
                .map_err(|source| PoolError::Resolve {
                    addr: entry.addr.clone(),
                    source,
                })?
                .next()
                .ok_or_else(|| PoolError::Resolve {
                    addr: entry.addr.clone(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "no addresses returned",
                    ),
                })?;

            if let Some(name) = entry.name.as_deref().filter(|n| !n.is_empty()) {
                if hosts
                    .iter()
                    .any(|h: &HostDescriptor| h.name.as_deref() == Some(name))
                {
                    return Err(PoolError::DuplicateName(name.to_string()));
                }
            }

            total_weight += u64::from(entry.weight);
            hosts.push(HostDescriptor {
                addr,
                weight: entry.weight,
                name: entry.name.filter(|n| !n.is_empty()),
                source: entry.addr,
            });
        }

        if total_weight == 0 {
            return Err(PoolError::NoWeight);
        }

        Ok(Self {
            hosts,
            total_weight,
        })
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    /// Proportional random selection over the configured weights.
    pub fn select_weighted(&self) -> Option<&HostDescriptor> {
        self.select_weighted_with(&mut rand::rng())
    }

    /// Selection with a caller-supplied RNG, for deterministic tests.
    pub fn select_weighted_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&HostDescriptor> {
        if self.total_weight == 0 {
            return None;
        }
        let mut draw = rng.random_range(0..self.total_weight);
        for host in &self.hosts {
            let weight = u64::from(host.weight);
            if draw < weight {
                return Some(host);
            }
            draw -= weight;
        }
        None
    }

    /// Exact-name lookup. Absent names are a routing failure for the
    /// caller, never a fallback to weighted selection.
    pub fn select_by_name(&self, name: &str) -> Option<&HostDescriptor> {
        self.hosts.iter().find(|h| h.name.as_deref() == Some(name))
    }
}

/// Live handle to the current pool snapshot plus its backing file.
pub struct PoolHandle {
    path: PathBuf,
    current: ArcSwap<HostPool>,
}

impl PoolHandle {
    /// Loads the initial pool. A failure here is fatal to startup: there
    /// is no previous snapshot to keep serving.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, PoolError> {
        let path = path.as_ref().to_path_buf();
        let pool = Self::read_pool(&path).await?;
        info!(
            path = %path.display(),
            hosts = pool.len(),
            total_weight = pool.total_weight(),
            "Backend pool loaded"
        );
        Ok(Self {
            path,
            current: ArcSwap::from_pointee(pool),
        })
    }

    async fn read_pool(path: &Path) -> Result<HostPool, PoolError> {
        let raw = tokio::fs::read(path).await.map_err(|source| PoolError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: PoolFile =
            serde_json::from_slice(&raw).map_err(|source| PoolError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        HostPool::from_entries(file.hosts).await
    }

    /// Re-reads the backing file and atomically publishes the new pool.
    /// On any error the previous snapshot stays active.
    pub async fn reload(&self) -> Result<(), PoolError> {
        let pool = Self::read_pool(&self.path).await?;
        info!(
            path = %self.path.display(),
            hosts = pool.len(),
            total_weight = pool.total_weight(),
            "Backend pool reloaded"
        );
        self.current.store(Arc::new(pool));
        Ok(())
    }

    /// Current snapshot; stays valid for the caller even across a reload.
    pub fn snapshot(&self) -> Arc<HostPool> {
        let snapshot = self.current.load_full();
        debug!(hosts = snapshot.len(), "Pool snapshot taken");
        snapshot
    }
}
