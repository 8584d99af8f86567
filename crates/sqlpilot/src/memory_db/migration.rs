//! Versioned schema migrations for the SQLite stores.

use rusqlite::{Connection, Result};
use tracing::{error, info};

/// `(version, sql)` pairs applied in ascending order.
pub type Migration = (i32, &'static str);

pub const CONVERSATION_MIGRATIONS: &[Migration] = &[(
    1,
    "CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        external_channel_id TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_sessions_channel
        ON sessions(external_channel_id, updated_at);

    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        conversation_id TEXT NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        metadata TEXT NOT NULL DEFAULT '{}'
    );
    CREATE INDEX IF NOT EXISTS idx_messages_conversation
        ON messages(conversation_id, timestamp, id);

    CREATE TABLE IF NOT EXISTS owner_metadata (
        owner_id TEXT PRIMARY KEY,
        context TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );",
)];

pub const BROKER_MIGRATIONS: &[Migration] = &[(
    1,
    "CREATE TABLE IF NOT EXISTS topic_records (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        topic TEXT NOT NULL,
        payload TEXT NOT NULL,
        published_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_topic_records_topic ON topic_records(topic, seq);

    CREATE TABLE IF NOT EXISTS consumer_offsets (
        group_id TEXT NOT NULL,
        topic TEXT NOT NULL,
        committed_seq INTEGER NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (group_id, topic)
    );",
)];

pub const CACHE_MIGRATIONS: &[Migration] = &[(
    1,
    "CREATE TABLE IF NOT EXISTS cache_entries (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        version INTEGER NOT NULL,
        expires_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_cache_entries_expiry ON cache_entries(expires_at);

    CREATE TABLE IF NOT EXISTS cache_version (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        current INTEGER NOT NULL
    );
    INSERT OR IGNORE INTO cache_version (id, current) VALUES (1, 0);",
)];

pub struct MigrationManager<'a> {
    conn: &'a mut Connection,
    migrations: &'static [Migration],
}

impl<'a> MigrationManager<'a> {
    pub fn new(conn: &'a mut Connection, migrations: &'static [Migration]) -> Self {
        Self { conn, migrations }
    }

    pub fn initialize_database(&mut self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        let current_version = self.get_current_version()?;
        info!("Current database schema version: {}", current_version);
        self.apply_migrations(current_version)
    }

    fn apply_migrations(&mut self, current_version: i32) -> Result<()> {
        for (version, migration_sql) in self.migrations.iter() {
            if *version <= current_version {
                continue;
            }
            info!("Applying migration {}...", version);

            let tx = self.conn.transaction()?;
            if let Err(e) = tx.execute_batch(migration_sql) {
                error!("Failed to apply migration {}: {}", version, e);
                return Err(e);
            }
            tx.execute(
                "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
                [version],
            )?;
            tx.commit()?;

            info!("Migration {} applied successfully", version);
        }
        Ok(())
    }

    pub fn get_current_version(&self) -> Result<i32> {
        self.conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
    }
}
