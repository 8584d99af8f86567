//! Durable topic log with consumer-group offsets.
//!
//! Delivery is at-least-once with auto-commit: a record's offset is committed
//! when the consumer polls again, so a consumer that dies before its next poll
//! has that record redelivered to the next member of its group.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rusqlite::{params, OptionalExtension};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::BrokerError;
use crate::memory_db::{format_timestamp, open_memory_pool, open_pool, SqlitePool, BROKER_MIGRATIONS};

/// How often a waiting poller re-checks the log for records published by
/// other processes, which cannot wake it directly.
const CHECK_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub offset: i64,
    pub payload: String,
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Append a record to `topic`, returning its offset.
    async fn publish(&self, topic: &str, payload: String) -> Result<i64, BrokerError>;

    /// Join `group` on `topic`, resuming after the group's committed offset.
    async fn subscribe(&self, group: &str, topic: &str) -> Result<Box<dyn Subscription>, BrokerError>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Commit the previously delivered record, then wait up to `timeout` for
    /// the next one.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError>;

    /// Commit the previously delivered record without fetching another.
    async fn commit(&mut self) -> Result<(), BrokerError>;
}

#[derive(Clone)]
pub struct SqliteBroker {
    pool: Arc<SqlitePool>,
    notifiers: Arc<DashMap<String, Arc<Notify>>>,
}

impl SqliteBroker {
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        Ok(Self::with_pool(open_pool(db_path, BROKER_MIGRATIONS)?))
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        Ok(Self::with_pool(open_memory_pool(BROKER_MIGRATIONS)?))
    }

    fn with_pool(pool: Arc<SqlitePool>) -> Self {
        Self {
            pool,
            notifiers: Arc::new(DashMap::new()),
        }
    }

    fn notifier(&self, topic: &str) -> Arc<Notify> {
        self.notifiers
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }
}

/// Run a pooled SQLite call on the blocking pool, mapping every failure to
/// `BrokerError::Unavailable`.
async fn blocking<T, F>(pool: &Arc<SqlitePool>, f: F) -> Result<T, BrokerError>
where
    F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let pool = Arc::clone(pool);
    tokio::task::spawn_blocking(move || {
        let conn = pool
            .get()
            .map_err(|e| BrokerError::Unavailable(format!("connection pool: {}", e)))?;
        f(&conn).map_err(|e| BrokerError::Unavailable(e.to_string()))
    })
    .await
    .map_err(|e| BrokerError::Unavailable(format!("broker task failed: {}", e)))?
}

#[async_trait]
impl MessageBroker for SqliteBroker {
    async fn publish(&self, topic: &str, payload: String) -> Result<i64, BrokerError> {
        let topic_owned = topic.to_string();
        let offset = blocking(&self.pool, move |conn| {
            conn.execute(
                "INSERT INTO topic_records (topic, payload, published_at) VALUES (?1, ?2, ?3)",
                params![topic_owned, payload, format_timestamp(&Utc::now())],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await?;

        debug!("Published record {} to {}", offset, topic);
        self.notifier(topic).notify_waiters();
        Ok(offset)
    }

    async fn subscribe(&self, group: &str, topic: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        let (group_owned, topic_owned) = (group.to_string(), topic.to_string());
        let committed = blocking(&self.pool, move |conn| {
            conn.query_row(
                "SELECT committed_seq FROM consumer_offsets WHERE group_id = ?1 AND topic = ?2",
                params![group_owned, topic_owned],
                |row| row.get::<_, i64>(0),
            )
            .optional()
        })
        .await?
        .unwrap_or(0);

        info!(
            "Group {} subscribed to {} at committed offset {}",
            group, topic, committed
        );
        Ok(Box::new(SqliteSubscription {
            pool: Arc::clone(&self.pool),
            notify: self.notifier(topic),
            group: group.to_string(),
            topic: topic.to_string(),
            position: committed,
            committed,
        }))
    }
}

struct SqliteSubscription {
    pool: Arc<SqlitePool>,
    notify: Arc<Notify>,
    group: String,
    topic: String,
    /// Offset of the last record handed out.
    position: i64,
    committed: i64,
}

impl SqliteSubscription {
    async fn fetch_next(&self) -> Result<Option<Delivery>, BrokerError> {
        let topic = self.topic.clone();
        let after = self.position;
        let record = blocking(&self.pool, move |conn| {
            conn.query_row(
                "SELECT seq, payload FROM topic_records
                 WHERE topic = ?1 AND seq > ?2
                 ORDER BY seq ASC LIMIT 1",
                params![topic, after],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
        })
        .await?;

        Ok(record.map(|(offset, payload)| Delivery {
            topic: self.topic.clone(),
            offset,
            payload,
        }))
    }
}

#[async_trait]
impl Subscription for SqliteSubscription {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        self.commit().await?;

        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking so a publish between the
            // check and the wait is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.fetch_next().await? {
                self.position = delivery.offset;
                return Ok(Some(delivery));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = (deadline - now).min(CHECK_INTERVAL);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    async fn commit(&mut self) -> Result<(), BrokerError> {
        if self.position <= self.committed {
            return Ok(());
        }

        let (group, topic, offset) = (self.group.clone(), self.topic.clone(), self.position);
        blocking(&self.pool, move |conn| {
            conn.execute(
                "INSERT INTO consumer_offsets (group_id, topic, committed_seq, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(group_id, topic) DO UPDATE SET
                    committed_seq = excluded.committed_seq,
                    updated_at = excluded.updated_at",
                params![group, topic, offset, format_timestamp(&Utc::now())],
            )
        })
        .await?;

        debug!("Group {} committed {} on {}", self.group, offset, self.topic);
        self.committed = offset;
        Ok(())
    }
}
