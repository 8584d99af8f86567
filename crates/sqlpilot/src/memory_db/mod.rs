//! SQLite storage: the durable conversation log and the shared pool setup the
//! broker reuses.

pub mod conversation_store;
pub mod migration;

pub use conversation_store::SqliteConversationLog;
pub use migration::{
    Migration, MigrationManager, BROKER_MIGRATIONS, CACHE_MIGRATIONS, CONVERSATION_MIGRATIONS,
};

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use tracing::info;

pub type SqlitePool = Pool<SqliteConnectionManager>;

/// Open (creating if needed) a pooled database file and bring it up to date.
pub fn open_pool(db_path: &Path, migrations: &'static [Migration]) -> anyhow::Result<Arc<SqlitePool>> {
    info!("Opening database at: {}", db_path.display());
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_init(|conn| {
            conn.execute_batch(
                "PRAGMA busy_timeout = 5000;
                 PRAGMA synchronous = NORMAL;",
            )
        });
    let pool = Pool::builder()
        .max_size(8)
        .build(manager)
        .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

    {
        let mut conn = pool.get()?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            tracing::warn!("Database at {} is using journal mode {}", db_path.display(), mode);
        }
        MigrationManager::new(&mut conn, migrations).initialize_database()?;
    }

    info!("Database at {} initialized successfully", db_path.display());
    Ok(Arc::new(pool))
}

/// A private in-memory database. Every pooled connection to `:memory:` would
/// be a separate database, so the pool holds exactly one.
pub fn open_memory_pool(migrations: &'static [Migration]) -> anyhow::Result<Arc<SqlitePool>> {
    let pool = Pool::builder()
        .max_size(1)
        .build(SqliteConnectionManager::memory())
        .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;
    {
        let mut conn = pool.get()?;
        MigrationManager::new(&mut conn, migrations).initialize_database()?;
    }
    Ok(Arc::new(pool))
}

/// Fixed-width UTC timestamps so text order matches time order.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid stored timestamp {:?}", raw))?
        .with_timezone(&Utc))
}
