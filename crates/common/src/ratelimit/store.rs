//! Durable counter stores backing the rate limiter

use super::UsageRecord;
use crate::cache::{keys, Cache, CacheConfig};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Keyed persistence for usage records
///
/// The limiter serializes read-modify-write per identity, so stores only
/// need consistent single-key reads and writes.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn get(&self, identity: &str) -> Result<Option<UsageRecord>>;

    async fn put(&self, identity: &str, record: &UsageRecord) -> Result<()>;

    /// Backend name for health reporting
    fn backend(&self) -> &'static str;

    /// Check that the backend is reachable
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Process-local store, for tests and single-node deployments that accept
/// losing counters on restart
#[derive(Default)]
pub struct InMemoryCounterStore {
    records: RwLock<HashMap<String, UsageRecord>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn get(&self, identity: &str) -> Result<Option<UsageRecord>> {
        Ok(self.records.read().await.get(identity).cloned())
    }

    async fn put(&self, identity: &str, record: &UsageRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(identity.to_string(), record.clone());
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Write-through JSON file store
///
/// The whole map is rewritten on every put through a temporary file and a
/// rename, so a crash leaves either the old or the new snapshot.
pub struct JsonFileCounterStore {
    path: PathBuf,
    records: RwLock<HashMap<String, UsageRecord>>,
}

impl JsonFileCounterStore {
    /// Open the store, loading an existing snapshot if present
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let records = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => HashMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| AppError::CounterStore {
                message: format!("Corrupt usage file {}: {}", path.display(), e),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(AppError::CounterStore {
                    message: format!("Failed to read {}: {}", path.display(), e),
                })
            }
        };

        info!(path = %path.display(), identities = records.len(), "Usage counters loaded");

        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    async fn flush(&self, records: &HashMap<String, UsageRecord>) -> Result<()> {
        let io_error = |e: std::io::Error| AppError::CounterStore {
            message: format!("Failed to write {}: {}", self.path.display(), e),
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }

        let json = serde_json::to_vec_pretty(records)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await.map_err(io_error)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_error)?;

        debug!(path = %self.path.display(), "Usage counters flushed");
        Ok(())
    }
}

#[async_trait]
impl CounterStore for JsonFileCounterStore {
    async fn get(&self, identity: &str) -> Result<Option<UsageRecord>> {
        Ok(self
            .records
            .read()
            .await
            .get(&keys::rate_limit(identity))
            .cloned())
    }

    async fn put(&self, identity: &str, record: &UsageRecord) -> Result<()> {
        let mut records = self.records.write().await;
        records.insert(keys::rate_limit(identity), record.clone());
        self.flush(&records).await
    }

    fn backend(&self) -> &'static str {
        "file"
    }
}

/// Redis-backed store shared by every gateway replica
pub struct RedisCounterStore {
    cache: Cache,
}

impl RedisCounterStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let cache = Cache::new(CacheConfig {
            url: url.to_string(),
            ..CacheConfig::default()
        })
        .await?;
        Ok(Self { cache })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, identity: &str) -> Result<Option<UsageRecord>> {
        self.cache.get(&keys::rate_limit(identity)).await
    }

    async fn put(&self, identity: &str, record: &UsageRecord) -> Result<()> {
        // TTL covers the day window; an expired key means both windows are fresh
        self.cache.set(&keys::rate_limit(identity), record).await
    }

    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> Result<()> {
        self.cache.ping().await
    }
}
