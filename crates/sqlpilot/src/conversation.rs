//! Conversation service: the session cache in front of the durable log.
//!
//! Reads try the cache, fall back to the log on a miss (or a cache failure)
//! and repopulate the cache. Writes land in the log first, then the cache.
//! Cache failures never fail a turn; log failures on the write path do.

use std::sync::Arc;

use anyhow::Context;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::CacheError;
use crate::memory::{ConversationLog, ConversationSession, Message, OwnerContext};
use crate::session_store::{AppendOutcome, SessionStore};

pub struct ConversationService {
    store: Arc<SessionStore>,
    log: Arc<dyn ConversationLog>,
}

impl ConversationService {
    pub fn new(store: Arc<SessionStore>, log: Arc<dyn ConversationLog>) -> Self {
        Self { store, log }
    }

    /// Run a log call on the blocking pool.
    async fn with_log<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&dyn ConversationLog) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let log = Arc::clone(&self.log);
        tokio::task::spawn_blocking(move || f(log.as_ref()))
            .await
            .context("conversation log task panicked")?
    }

    pub async fn get_session(&self, conversation_id: &str) -> Option<ConversationSession> {
        match self.store.get_session(conversation_id).await {
            Ok(Some(session)) => return Some(session),
            Ok(None) => {}
            Err(e) => warn!("Session cache read failed for {}: {}", conversation_id, e),
        }

        let id = conversation_id.to_string();
        let session = match self.with_log(move |log| log.get_session(&id)).await {
            Ok(session) => session?,
            Err(e) => {
                warn!("Session lookup failed for {}: {}", conversation_id, e);
                return None;
            }
        };

        if let Err(e) = self.store.put_session(&session).await {
            debug!("Could not repopulate session cache for {}: {}", conversation_id, e);
        }
        Some(session)
    }

    /// Ordered history, or empty if neither the cache nor the log can supply it.
    pub async fn get_history(&self, conversation_id: &str) -> Vec<Message> {
        match self.store.cached_history(conversation_id).await {
            Ok(Some(history)) => return history,
            Ok(None) => {}
            Err(e) => warn!("History cache read failed for {}: {}", conversation_id, e),
        }

        let id = conversation_id.to_string();
        let history = match self.with_log(move |log| log.get_messages(&id)).await {
            Ok(history) => history,
            Err(e) => {
                warn!("History lookup failed for {}: {}", conversation_id, e);
                return Vec::new();
            }
        };

        if let Err(e) = self.store.fill_history(conversation_id, &history).await {
            debug!("Could not repopulate history cache for {}: {}", conversation_id, e);
        }
        history
    }

    pub async fn get_owner_context(&self, owner_id: &str) -> Option<OwnerContext> {
        match self.store.get_owner_context(owner_id).await {
            Ok(Some(context)) => return Some(context),
            Ok(None) => {}
            Err(e) => warn!("Owner cache read failed for {}: {}", owner_id, e),
        }

        let id = owner_id.to_string();
        let context = match self.with_log(move |log| log.get_owner_context(&id)).await {
            Ok(context) => context?,
            Err(e) => {
                warn!("Owner context lookup failed for {}: {}", owner_id, e);
                return None;
            }
        };

        if let Err(e) = self.store.put_owner_context(&context).await {
            debug!("Could not repopulate owner cache for {}: {}", owner_id, e);
        }
        Some(context)
    }

    pub async fn put_owner_context(&self, context: OwnerContext) -> anyhow::Result<()> {
        let stored = context.clone();
        self.with_log(move |log| log.put_owner_context(&stored)).await?;
        if let Err(e) = self.store.put_owner_context(&context).await {
            warn!("Owner cache write failed for {}: {}", context.owner_id, e);
        }
        Ok(())
    }

    async fn save_session(&self, session: &ConversationSession) -> anyhow::Result<()> {
        let stored = session.clone();
        self.with_log(move |log| log.upsert_session(&stored)).await?;
        if let Err(e) = self.store.put_session(session).await {
            warn!("Session cache write failed for {}: {}", session.id, e);
        }
        Ok(())
    }

    /// Start a user turn: create the session if needed, append the user's
    /// message and bump last activity.
    pub async fn begin_turn(
        &self,
        conversation_id: &str,
        owner_id: &str,
        text: &str,
        metadata: Option<Map<String, Value>>,
    ) -> anyhow::Result<(ConversationSession, Message)> {
        let mut session = match self.get_session(conversation_id).await {
            Some(session) => session,
            None => {
                info!("Creating conversation {} for owner {}", conversation_id, owner_id);
                ConversationSession::new(conversation_id, owner_id)
            }
        };
        session.touch();
        self.save_session(&session).await?;

        let mut message = Message::user(conversation_id, text);
        if let Some(metadata) = metadata {
            message = message.with_metadata(metadata);
        }
        self.append(message.clone()).await?;
        Ok((session, message))
    }

    pub async fn record_assistant_reply(
        &self,
        conversation_id: &str,
        content: &str,
        metadata: Map<String, Value>,
    ) -> anyhow::Result<Message> {
        let message = Message::assistant(conversation_id, content).with_metadata(metadata);
        self.append(message.clone()).await?;
        self.touch_session(conversation_id).await?;
        Ok(message)
    }

    /// Update last activity of an existing session. Unknown sessions are left alone.
    pub async fn touch_session(&self, conversation_id: &str) -> anyhow::Result<()> {
        if let Some(mut session) = self.get_session(conversation_id).await {
            session.touch();
            self.save_session(&session).await?;
        }
        Ok(())
    }

    /// The active session bound to an external channel identity, creating one
    /// when the channel has none.
    pub async fn find_or_create_channel_session(
        &self,
        owner_id: &str,
        external_channel_id: &str,
    ) -> anyhow::Result<ConversationSession> {
        let channel = external_channel_id.to_string();
        if let Some(session) = self.with_log(move |log| log.find_by_channel(&channel)).await? {
            if let Err(e) = self.store.put_session(&session).await {
                debug!("Could not repopulate session cache for {}: {}", session.id, e);
            }
            return Ok(session);
        }

        let session = ConversationSession::new(Uuid::new_v4().to_string(), owner_id)
            .with_channel(external_channel_id);
        info!(
            "Bound channel {} to new conversation {}",
            external_channel_id, session.id
        );
        self.save_session(&session).await?;
        Ok(session)
    }

    /// Append to the log, then to the cached history.
    pub async fn append(&self, message: Message) -> anyhow::Result<()> {
        let stored = message.clone();
        self.with_log(move |log| log.append_message(&stored)).await?;
        self.append_cached(&message).await;
        Ok(())
    }

    async fn append_cached(&self, message: &Message) {
        let conversation_id = &message.conversation_id;
        let outcome = match self.store.append_message(message).await {
            Ok(AppendOutcome::Missing) => self.reseed_history(message).await,
            other => other,
        };

        if let Err(e) = outcome {
            // next read reseeds from the log
            warn!("History cache append failed for {}: {}", conversation_id, e);
            if let Err(e) = self.store.invalidate_history(conversation_id).await {
                warn!("History cache invalidation failed for {}: {}", conversation_id, e);
            }
        }
    }

    /// Seed the cache from the log, which already holds `message`. If another
    /// writer seeded it first, append onto theirs.
    async fn reseed_history(
        &self,
        message: &Message,
    ) -> Result<AppendOutcome, CacheError> {
        let id = message.conversation_id.clone();
        let history = match self.with_log(move |log| log.get_messages(&id)).await {
            Ok(history) => history,
            Err(e) => {
                debug!("Skipping history reseed for {}: {}", message.conversation_id, e);
                return Ok(AppendOutcome::Missing);
            }
        };

        if self.store.fill_history(&message.conversation_id, &history).await? {
            return Ok(AppendOutcome::Appended);
        }
        self.store.append_message(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryConversationLog, Role};
    use crate::session_store::{CacheBackend, CachedValue, MokaCacheBackend, SessionStoreConfig};
    use async_trait::async_trait;
    use std::time::Duration;

    struct DownCache;

    #[async_trait]
    impl CacheBackend for DownCache {
        async fn get(&self, _key: &str) -> Result<Option<CachedValue>, CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }
        async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<u64, CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }
        async fn compare_and_set(
            &self,
            _key: &str,
            _expected_version: Option<u64>,
            _value: String,
            _ttl: Duration,
        ) -> Result<bool, CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }
        async fn delete(&self, _key: &str) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }
    }

    fn service_with(backend: Arc<dyn CacheBackend>) -> (ConversationService, Arc<SessionStore>, Arc<InMemoryConversationLog>) {
        let store = Arc::new(SessionStore::new(backend, SessionStoreConfig::default()));
        let log = Arc::new(InMemoryConversationLog::new());
        (ConversationService::new(store.clone(), log.clone()), store, log)
    }

    fn service() -> (ConversationService, Arc<SessionStore>, Arc<InMemoryConversationLog>) {
        service_with(Arc::new(MokaCacheBackend::new(1_000)))
    }

    #[tokio::test]
    async fn test_begin_turn_creates_session_and_appends() {
        let (service, store, log) = service();
        let (session, message) = service.begin_turn("c1", "o1", "hello", None).await.unwrap();

        assert_eq!(session.owner_id, "o1");
        assert_eq!(message.role, Role::User);
        assert!(log.get_session("c1").unwrap().is_some());
        assert_eq!(log.get_messages("c1").unwrap().len(), 1);
        // cache was seeded from the log on first append
        assert_eq!(store.get_history("c1").await.unwrap(), vec![message]);
    }

    #[tokio::test]
    async fn test_history_miss_repopulates_from_log() {
        let (service, store, log) = service();
        log.append_message(&Message::user("c1", "from the log")).unwrap();

        let history = service.get_history("c1").await;
        assert_eq!(history.len(), 1);
        assert_eq!(store.get_history("c1").await.unwrap(), history);
    }

    #[tokio::test]
    async fn test_reply_appends_after_user_turn() {
        let (service, store, _log) = service();
        service.begin_turn("c1", "o1", "hi", None).await.unwrap();
        service
            .record_assistant_reply("c1", "hello!", Map::new())
            .await
            .unwrap();

        let roles: Vec<Role> = store
            .get_history("c1")
            .await
            .unwrap()
            .iter()
            .map(|m| m.role)
            .collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
    }

    #[tokio::test]
    async fn test_cache_outage_degrades_to_log() {
        let (service, _store, log) = service_with(Arc::new(DownCache));
        service.begin_turn("c1", "o1", "still works", None).await.unwrap();

        assert_eq!(log.get_messages("c1").unwrap().len(), 1);
        assert_eq!(service.get_history("c1").await.len(), 1);
        assert!(service.get_session("c1").await.is_some());
        assert!(service.get_history("unknown").await.is_empty());
    }

    #[tokio::test]
    async fn test_channel_session_is_reused() {
        let (service, _store, _log) = service();
        let first = service
            .find_or_create_channel_session("o1", "sms:+15550100")
            .await
            .unwrap();
        let second = service
            .find_or_create_channel_session("o1", "sms:+15550100")
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.external_channel_id.as_deref(), Some("sms:+15550100"));
    }

    #[tokio::test]
    async fn test_owner_context_read_through() {
        let (service, store, log) = service();
        log.put_owner_context(&OwnerContext {
            owner_id: "o1".to_string(),
            display_name: Some("Ada".to_string()),
            ..Default::default()
        })
        .unwrap();

        let ctx = service.get_owner_context("o1").await.unwrap();
        assert_eq!(ctx.display_name.as_deref(), Some("Ada"));
        assert!(store.get_owner_context("o1").await.unwrap().is_some());
    }
}
