//! Conversation data model and the durable-log seam.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One turn of a conversation. History is append-only and ordered by timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Message {
    pub fn new(conversation_id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: Map::new(),
        }
    }

    pub fn user(conversation_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(conversation_id, Role::User, content)
    }

    pub fn assistant(conversation_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(conversation_id, Role::Assistant, content)
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Insert `message` keeping `history` ordered by timestamp.
///
/// Equal timestamps keep arrival order.
pub fn insert_ordered(history: &mut Vec<Message>, message: Message) {
    let position = history.partition_point(|m| m.timestamp <= message.timestamp);
    history.insert(position, message);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSession {
    pub id: String,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_active: bool,
    #[serde(default)]
    pub external_channel_id: Option<String>,
}

impl ConversationSession {
    pub fn new(id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            created_at: now,
            updated_at: now,
            is_active: true,
            external_channel_id: None,
        }
    }

    pub fn with_channel(mut self, external_channel_id: impl Into<String>) -> Self {
        self.external_channel_id = Some(external_channel_id.into());
        self
    }

    /// Record activity on the session.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Long-lived per-owner facts injected into chat prompts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerContext {
    pub owner_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl OwnerContext {
    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        if let Some(name) = &self.display_name {
            lines.push(format!("User: {}", name));
        }
        if let Some(instructions) = &self.instructions {
            lines.push(format!("Instructions: {}", instructions));
        }
        for (key, value) in &self.attributes {
            lines.push(format!("{}: {}", key, value));
        }
        lines.join("\n")
    }
}

/// System of record for conversations. The cache in front of it may forget
/// anything; this log may not.
pub trait ConversationLog: Send + Sync {
    fn upsert_session(&self, session: &ConversationSession) -> anyhow::Result<()>;
    fn get_session(&self, conversation_id: &str) -> anyhow::Result<Option<ConversationSession>>;
    fn find_by_channel(&self, external_channel_id: &str) -> anyhow::Result<Option<ConversationSession>>;
    fn append_message(&self, message: &Message) -> anyhow::Result<()>;
    fn get_messages(&self, conversation_id: &str) -> anyhow::Result<Vec<Message>>;
    fn put_owner_context(&self, context: &OwnerContext) -> anyhow::Result<()>;
    fn get_owner_context(&self, owner_id: &str) -> anyhow::Result<Option<OwnerContext>>;
}

/// Process-local log, handy for tests and single-shot CLI runs.
#[derive(Clone, Default)]
pub struct InMemoryConversationLog {
    sessions: Arc<DashMap<String, ConversationSession>>,
    messages: Arc<DashMap<String, Vec<Message>>>,
    owners: Arc<DashMap<String, OwnerContext>>,
}

impl InMemoryConversationLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConversationLog for InMemoryConversationLog {
    fn upsert_session(&self, session: &ConversationSession) -> anyhow::Result<()> {
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    fn get_session(&self, conversation_id: &str) -> anyhow::Result<Option<ConversationSession>> {
        Ok(self.sessions.get(conversation_id).map(|s| s.clone()))
    }

    fn find_by_channel(&self, external_channel_id: &str) -> anyhow::Result<Option<ConversationSession>> {
        Ok(self
            .sessions
            .iter()
            .filter(|s| s.is_active && s.external_channel_id.as_deref() == Some(external_channel_id))
            .max_by_key(|s| s.updated_at)
            .map(|s| s.clone()))
    }

    fn append_message(&self, message: &Message) -> anyhow::Result<()> {
        let mut entry = self.messages.entry(message.conversation_id.clone()).or_default();
        insert_ordered(&mut entry, message.clone());
        Ok(())
    }

    fn get_messages(&self, conversation_id: &str) -> anyhow::Result<Vec<Message>> {
        Ok(self
            .messages
            .get(conversation_id)
            .map(|history| history.clone())
            .unwrap_or_default())
    }

    fn put_owner_context(&self, context: &OwnerContext) -> anyhow::Result<()> {
        self.owners.insert(context.owner_id.clone(), context.clone());
        Ok(())
    }

    fn get_owner_context(&self, owner_id: &str) -> anyhow::Result<Option<OwnerContext>> {
        Ok(self.owners.get(owner_id).map(|c| c.clone()))
    }
}
