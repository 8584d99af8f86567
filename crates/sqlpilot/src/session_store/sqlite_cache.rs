//! Cache backend in a SQLite file, shared by every process that opens it.
//!
//! Versions come from a single counter row, so they stay strictly increasing
//! across processes. Compare-and-set runs inside an immediate transaction.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use super::cache::{CacheBackend, CachedValue};
use crate::error::CacheError;
use crate::memory_db::{open_memory_pool, open_pool, SqlitePool, CACHE_MIGRATIONS};

#[derive(Clone)]
pub struct SqliteCacheBackend {
    pool: Arc<SqlitePool>,
}

impl SqliteCacheBackend {
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        let backend = Self {
            pool: open_pool(db_path, CACHE_MIGRATIONS)?,
        };
        let purged = backend.purge_expired_now()?;
        info!("Session cache at {} ready ({} expired entries purged)", db_path.display(), purged);
        Ok(backend)
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        Ok(Self {
            pool: open_memory_pool(CACHE_MIGRATIONS)?,
        })
    }

    fn purge_expired_now(&self) -> anyhow::Result<usize> {
        let conn = self.pool.get()?;
        Ok(conn.execute(
            "DELETE FROM cache_entries WHERE expires_at <= ?1",
            params![now_millis()],
        )?)
    }

    /// Drop entries whose TTL has passed. Reads already ignore them.
    pub async fn purge_expired(&self) -> Result<usize, CacheError> {
        blocking(&self.pool, |conn| {
            conn.execute(
                "DELETE FROM cache_entries WHERE expires_at <= ?1",
                params![now_millis()],
            )
        })
        .await
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_millis(ttl: Duration) -> i64 {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    now_millis().saturating_add(ttl_ms)
}

fn live_version(conn: &Connection, key: &str) -> rusqlite::Result<Option<u64>> {
    conn.query_row(
        "SELECT version FROM cache_entries WHERE key = ?1 AND expires_at > ?2",
        params![key, now_millis()],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .map(|version| version.map(|v| v as u64))
}

fn next_version(conn: &Connection) -> rusqlite::Result<u64> {
    conn.execute("UPDATE cache_version SET current = current + 1 WHERE id = 1", [])?;
    conn.query_row("SELECT current FROM cache_version WHERE id = 1", [], |row| {
        row.get::<_, i64>(0)
    })
    .map(|v| v as u64)
}

fn upsert(conn: &Connection, key: &str, value: &str, version: u64, ttl: Duration) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO cache_entries (key, value, version, expires_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            version = excluded.version,
            expires_at = excluded.expires_at",
        params![key, value, version as i64, expiry_millis(ttl)],
    )?;
    Ok(())
}

/// Run a pooled SQLite call on the blocking pool, mapping every failure to
/// `CacheError::Unavailable`.
async fn blocking<T, F>(pool: &Arc<SqlitePool>, f: F) -> Result<T, CacheError>
where
    F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let pool = Arc::clone(pool);
    tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| CacheError::Unavailable(format!("connection pool: {}", e)))?;
        f(&mut conn).map_err(|e| CacheError::Unavailable(e.to_string()))
    })
    .await
    .map_err(|e| CacheError::Unavailable(format!("cache task failed: {}", e)))?
}

#[async_trait]
impl CacheBackend for SqliteCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<CachedValue>, CacheError> {
        let key = key.to_string();
        blocking(&self.pool, move |conn| {
            conn.query_row(
                "SELECT value, version FROM cache_entries WHERE key = ?1 AND expires_at > ?2",
                params![key, now_millis()],
                |row| {
                    Ok(CachedValue {
                        value: row.get(0)?,
                        version: row.get::<_, i64>(1)? as u64,
                    })
                },
            )
            .optional()
        })
        .await
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<u64, CacheError> {
        let key = key.to_string();
        blocking(&self.pool, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let version = next_version(&tx)?;
            upsert(&tx, &key, &value, version, ttl)?;
            tx.commit()?;
            Ok(version)
        })
        .await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: String,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let key = key.to_string();
        let written = blocking(&self.pool, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if live_version(&tx, &key)? != expected_version {
                return Ok(None);
            }
            let version = next_version(&tx)?;
            upsert(&tx, &key, &value, version, ttl)?;
            tx.commit()?;
            Ok(Some(version))
        })
        .await?;

        if let Some(version) = written {
            debug!("Cache compare-and-set wrote version {}", version);
        }
        Ok(written.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let key = key.to_string();
        blocking(&self.pool, move |conn| {
            conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])
        })
        .await?;
        Ok(())
    }
}
