use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, Client};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Coordination store shared by every worker and the control surface
///
/// All cross-process signaling (pause flags, status, configs, the task list
/// and the QR handshake slot) goes through these six single-key operations.
/// There are no multi-key transactions; each worker is the sole writer of
/// its own keys.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get a string value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a string value
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Append a value to the tail of a list
    async fn rpush(&self, key: &str, value: &str) -> Result<()>;

    /// Remove and return the head of a list, or `None` when empty
    async fn lpop(&self, key: &str) -> Result<Option<String>>;

    /// Get a hash field
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// Set a hash field
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
}

/// Redis-backed store used by all long-running processes
pub struct RedisStore {
    /// Connection shared across operations
    conn: Arc<Mutex<MultiplexedConnection>>,
}

impl RedisStore {
    /// Connect to the Redis instance at the given URL
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .context(format!("Failed to open Redis client for {}", redis_url))?;

        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to get Redis connection")?;

        debug!("Connected to coordination store at {}", redis_url);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.lock().await;
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut *conn)
            .await
            .context(format!("GET {} failed", key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context(format!("SET {} failed", key))
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context(format!("RPUSH {} failed", key))
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.lock().await;
        redis::cmd("LPOP")
            .arg(key)
            .query_async(&mut *conn)
            .await
            .context(format!("LPOP {} failed", key))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.lock().await;
        redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut *conn)
            .await
            .context(format!("HGET {} {} failed", key, field))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context(format!("HSET {} {} failed", key, field))
    }
}

/// In-memory store with the same semantics, for tests and single-process runs
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    values: HashMap<String, String>,
    lists: HashMap<String, VecDeque<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let inner = self.inner.lock().await;
        Ok(inner.values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().await;
        Ok(inner.lists.get_mut(key).and_then(|l| l.pop_front()))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .cloned())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }
}
