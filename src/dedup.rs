use anyhow::Result;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::DedupConfig;

/// Seen-marker store keyed by derived call id. Both producers (the live
/// gateway and the backfill scan) only ever write markers, never
/// read-modify-write, so set-if-absent semantics are all that is required.
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn is_seen(&self, key: &str) -> Result<bool>;
    async fn mark_seen(&self, key: &str, ttl: Duration) -> Result<()>;
}

pub struct RedisDedupStore {
    connection: redis::aio::MultiplexedConnection,
}

impl RedisDedupStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl DedupStore for RedisDedupStore {
    async fn is_seen(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value.is_some())
    }

    async fn mark_seen(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.set_ex(key, "1", ttl.as_secs()).await?;
        Ok(())
    }
}

/// In-process store honoring TTL; backs the `memory` config variant and the
/// test suite.
#[derive(Default)]
pub struct MemoryDedupStore {
    entries: Mutex<HashMap<String, Instant>>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn is_seen(&self, key: &str) -> Result<bool> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .get(key)
            .map(|expires| *expires > Instant::now())
            .unwrap_or(false))
    }

    async fn mark_seen(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_string(), Instant::now() + ttl);
        Ok(())
    }
}

pub async fn resolve_store(config: &DedupConfig) -> Result<std::sync::Arc<dyn DedupStore>> {
    match config {
        DedupConfig::Memory => Ok(std::sync::Arc::new(MemoryDedupStore::new())),
        DedupConfig::Redis { url, .. } => {
            Ok(std::sync::Arc::new(RedisDedupStore::connect(url).await?))
        }
    }
}

impl DedupConfig {
    pub fn ttl(&self) -> Duration {
        match self {
            DedupConfig::Memory => Duration::from_secs(24 * 3600),
            DedupConfig::Redis { ttl_secs, .. } => Duration::from_secs(*ttl_secs),
        }
    }
}
