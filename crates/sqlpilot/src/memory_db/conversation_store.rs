use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use serde_json::{Map, Value};
use tracing::debug;

use super::{format_timestamp, open_memory_pool, open_pool, parse_timestamp, SqlitePool, CONVERSATION_MIGRATIONS};
use crate::memory::{ConversationLog, ConversationSession, Message, OwnerContext, Role};

/// SQLite-backed system of record for sessions, messages and owner metadata.
#[derive(Clone)]
pub struct SqliteConversationLog {
    pool: Arc<SqlitePool>,
}

const SESSION_COLUMNS: &str =
    "id, owner_id, created_at, updated_at, is_active, external_channel_id";

impl SqliteConversationLog {
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        Ok(Self {
            pool: open_pool(db_path, CONVERSATION_MIGRATIONS)?,
        })
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        Ok(Self {
            pool: open_memory_pool(CONVERSATION_MIGRATIONS)?,
        })
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }
}

// Row readers return raw text; parsing happens outside the rusqlite closure so
// errors keep their anyhow context.
struct SessionRow {
    id: String,
    owner_id: String,
    created_at: String,
    updated_at: String,
    is_active: bool,
    external_channel_id: Option<String>,
}

impl SessionRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            created_at: row.get(2)?,
            updated_at: row.get(3)?,
            is_active: row.get(4)?,
            external_channel_id: row.get(5)?,
        })
    }

    fn into_session(self) -> anyhow::Result<ConversationSession> {
        Ok(ConversationSession {
            id: self.id,
            owner_id: self.owner_id,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            is_active: self.is_active,
            external_channel_id: self.external_channel_id,
        })
    }
}

impl ConversationLog for SqliteConversationLog {
    fn upsert_session(&self, session: &ConversationSession) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO sessions (id, owner_id, created_at, updated_at, is_active, external_channel_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                owner_id = excluded.owner_id,
                updated_at = excluded.updated_at,
                is_active = excluded.is_active,
                external_channel_id = excluded.external_channel_id",
            params![
                session.id,
                session.owner_id,
                format_timestamp(&session.created_at),
                format_timestamp(&session.updated_at),
                session.is_active,
                session.external_channel_id,
            ],
        )
        .with_context(|| format!("failed to upsert session {}", session.id))?;
        Ok(())
    }

    fn get_session(&self, conversation_id: &str) -> anyhow::Result<Option<ConversationSession>> {
        let conn = self.get_conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
                [conversation_id],
                SessionRow::read,
            )
            .optional()?;
        row.map(SessionRow::into_session).transpose()
    }

    fn find_by_channel(&self, external_channel_id: &str) -> anyhow::Result<Option<ConversationSession>> {
        let conn = self.get_conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM sessions
                     WHERE external_channel_id = ?1 AND is_active = 1
                     ORDER BY updated_at DESC LIMIT 1",
                    SESSION_COLUMNS
                ),
                [external_channel_id],
                SessionRow::read,
            )
            .optional()?;
        row.map(SessionRow::into_session).transpose()
    }

    fn append_message(&self, message: &Message) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO messages (conversation_id, role, content, timestamp, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.conversation_id,
                message.role.as_str(),
                message.content,
                format_timestamp(&message.timestamp),
                serde_json::to_string(&message.metadata)?,
            ],
        )
        .with_context(|| format!("failed to append message to {}", message.conversation_id))?;
        debug!("Appended {} message to {}", message.role, message.conversation_id);
        Ok(())
    }

    fn get_messages(&self, conversation_id: &str) -> anyhow::Result<Vec<Message>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT role, content, timestamp, metadata FROM messages
             WHERE conversation_id = ?1
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt
            .query_map([conversation_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(role, content, timestamp, metadata)| {
                let role = Role::parse(&role)
                    .ok_or_else(|| anyhow::anyhow!("unknown stored role {:?}", role))?;
                let metadata: Map<String, Value> = serde_json::from_str(&metadata)
                    .context("invalid stored message metadata")?;
                Ok(Message::new(conversation_id, role, content)
                    .with_timestamp(parse_timestamp(&timestamp)?)
                    .with_metadata(metadata))
            })
            .collect()
    }

    fn put_owner_context(&self, context: &OwnerContext) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO owner_metadata (owner_id, context, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(owner_id) DO UPDATE SET
                context = excluded.context,
                updated_at = excluded.updated_at",
            params![
                context.owner_id,
                serde_json::to_string(context)?,
                format_timestamp(&Utc::now()),
            ],
        )
        .with_context(|| format!("failed to store owner context for {}", context.owner_id))?;
        Ok(())
    }

    fn get_owner_context(&self, owner_id: &str) -> anyhow::Result<Option<OwnerContext>> {
        let conn = self.get_conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT context FROM owner_metadata WHERE owner_id = ?1",
                [owner_id],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|json| serde_json::from_str(&json).context("invalid stored owner context"))
            .transpose()
    }
}
