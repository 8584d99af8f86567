use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::cache::CacheBackend;
use crate::error::CacheError;
use crate::memory::{insert_ordered, ConversationSession, Message, OwnerContext};

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);
pub const DEFAULT_OWNER_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);
pub const DEFAULT_CAS_RETRIES: u32 = 8;
const MAX_BACKOFF_MS: u64 = 5;

pub fn history_key(conversation_id: &str) -> String {
    format!("chat:history:{}", conversation_id)
}

pub fn session_key(conversation_id: &str) -> String {
    format!("conversation:{}", conversation_id)
}

pub fn owner_key(owner_id: &str) -> String {
    format!("app:metadata:{}", owner_id)
}

#[derive(Debug, Clone)]
pub struct SessionStoreConfig {
    pub session_ttl: Duration,
    pub owner_ttl: Duration,
    pub cas_retries: u32,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            session_ttl: DEFAULT_SESSION_TTL,
            owner_ttl: DEFAULT_OWNER_TTL,
            cas_retries: DEFAULT_CAS_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// Same message was already in the cached history.
    AlreadyPresent,
    /// No cached history to append to; the caller should repopulate it.
    Missing,
}

/// Key-prefixed JSON documents in the cache. This is a cache only: a miss
/// means "not cached", and filling it back in is the caller's job.
pub struct SessionStore {
    backend: Arc<dyn CacheBackend>,
    config: SessionStoreConfig,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn CacheBackend>, config: SessionStoreConfig) -> Self {
        Self { backend, config }
    }

    pub async fn get_session(&self, conversation_id: &str) -> Result<Option<ConversationSession>, CacheError> {
        self.read(&session_key(conversation_id)).await
    }

    pub async fn put_session(&self, session: &ConversationSession) -> Result<(), CacheError> {
        self.write(&session_key(&session.id), session, self.config.session_ttl)
            .await
    }

    /// Ordered history, or empty when nothing is cached.
    pub async fn get_history(&self, conversation_id: &str) -> Result<Vec<Message>, CacheError> {
        Ok(self.cached_history(conversation_id).await?.unwrap_or_default())
    }

    /// Like [`get_history`](Self::get_history) but tells a miss apart from an
    /// empty history.
    pub async fn cached_history(&self, conversation_id: &str) -> Result<Option<Vec<Message>>, CacheError> {
        self.read(&history_key(conversation_id)).await
    }

    /// Whole-value overwrite of the cached history.
    pub async fn put_history(&self, conversation_id: &str, history: &[Message]) -> Result<(), CacheError> {
        self.write(&history_key(conversation_id), &history, self.config.session_ttl)
            .await
    }

    /// Seed the history only if nothing is cached yet. Returns whether this
    /// call wrote it.
    pub async fn fill_history(&self, conversation_id: &str, history: &[Message]) -> Result<bool, CacheError> {
        let encoded = serde_json::to_string(&history)?;
        self.backend
            .compare_and_set(&history_key(conversation_id), None, encoded, self.config.session_ttl)
            .await
    }

    /// Append one message with compare-and-set on the history key, retrying
    /// when another writer got there first.
    pub async fn append_message(&self, message: &Message) -> Result<AppendOutcome, CacheError> {
        let key = history_key(&message.conversation_id);
        let attempts = self.config.cas_retries.max(1);

        for attempt in 1..=attempts {
            let Some(current) = self.backend.get(&key).await? else {
                return Ok(AppendOutcome::Missing);
            };

            let mut history: Vec<Message> = serde_json::from_str(&current.value)?;
            if history.contains(message) {
                return Ok(AppendOutcome::AlreadyPresent);
            }
            insert_ordered(&mut history, message.clone());
            let encoded = serde_json::to_string(&history)?;

            if self
                .backend
                .compare_and_set(&key, Some(current.version), encoded, self.config.session_ttl)
                .await?
            {
                return Ok(AppendOutcome::Appended);
            }
            debug!("History append for {} lost a race (attempt {})", key, attempt);
            if attempt < attempts {
                let backoff_ms = rand::thread_rng().gen_range(1..=MAX_BACKOFF_MS);
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }
        }

        Err(CacheError::Contended { key, attempts })
    }

    pub async fn invalidate_history(&self, conversation_id: &str) -> Result<(), CacheError> {
        self.backend.delete(&history_key(conversation_id)).await
    }

    pub async fn get_owner_context(&self, owner_id: &str) -> Result<Option<OwnerContext>, CacheError> {
        self.read(&owner_key(owner_id)).await
    }

    pub async fn put_owner_context(&self, context: &OwnerContext) -> Result<(), CacheError> {
        self.write(&owner_key(&context.owner_id), context, self.config.owner_ttl)
            .await
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.backend.get(key).await? {
            Some(cached) => Ok(Some(serde_json::from_str(&cached.value)?)),
            None => Ok(None),
        }
    }

    async fn write<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> Result<(), CacheError> {
        let encoded = serde_json::to_string(value)?;
        self.backend.set(key, encoded, ttl).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_store::cache::{CachedValue, MokaCacheBackend};
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};

    fn store() -> SessionStore {
        SessionStore::new(Arc::new(MokaCacheBackend::new(1_000)), SessionStoreConfig::default())
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(history_key("c1"), "chat:history:c1");
        assert_eq!(session_key("c1"), "conversation:c1");
        assert_eq!(owner_key("o1"), "app:metadata:o1");
    }

    #[tokio::test]
    async fn test_session_round_trip_and_miss() {
        let store = store();
        assert!(store.get_session("c1").await.unwrap().is_none());

        let session = ConversationSession::new("c1", "owner");
        store.put_session(&session).await.unwrap();
        assert_eq!(store.get_session("c1").await.unwrap(), Some(session));
    }

    #[tokio::test]
    async fn test_history_miss_is_empty() {
        let store = store();
        assert!(store.get_history("nope").await.unwrap().is_empty());
        assert!(store.cached_history("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_append_requires_seeded_history() {
        let store = store();
        let msg = Message::user("c1", "hi");
        assert_eq!(store.append_message(&msg).await.unwrap(), AppendOutcome::Missing);

        assert!(store.fill_history("c1", &[]).await.unwrap());
        assert!(!store.fill_history("c1", &[]).await.unwrap());
        assert_eq!(store.append_message(&msg).await.unwrap(), AppendOutcome::Appended);
        assert_eq!(store.append_message(&msg).await.unwrap(), AppendOutcome::AlreadyPresent);
        assert_eq!(store.get_history("c1").await.unwrap(), vec![msg]);
    }

    #[tokio::test]
    async fn test_append_keeps_timestamp_order() {
        let store = store();
        let base = Utc::now();
        store.put_history("c1", &[]).await.unwrap();

        let late = Message::assistant("c1", "late").with_timestamp(base + ChronoDuration::seconds(5));
        let early = Message::user("c1", "early").with_timestamp(base);
        store.append_message(&late).await.unwrap();
        store.append_message(&early).await.unwrap();

        let contents: Vec<String> = store
            .get_history("c1")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["early", "late"]);
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_not_lost() {
        let store = Arc::new(store());
        store.put_history("c1", &[]).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append_message(&Message::user("c1", format!("turn {}", i)))
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), AppendOutcome::Appended);
        }

        assert_eq!(store.get_history("c1").await.unwrap().len(), 16);
    }

    /// Every compare-and-set loses.
    struct AlwaysContended {
        inner: MokaCacheBackend,
    }

    #[async_trait]
    impl CacheBackend for AlwaysContended {
        async fn get(&self, key: &str) -> Result<Option<CachedValue>, CacheError> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<u64, CacheError> {
            self.inner.set(key, value, ttl).await
        }
        async fn compare_and_set(
            &self,
            _key: &str,
            _expected_version: Option<u64>,
            _value: String,
            _ttl: Duration,
        ) -> Result<bool, CacheError> {
            Ok(false)
        }
        async fn delete(&self, key: &str) -> Result<(), CacheError> {
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn test_append_gives_up_after_bounded_retries() {
        let backend = Arc::new(AlwaysContended {
            inner: MokaCacheBackend::new(10),
        });
        let store = SessionStore::new(
            backend,
            SessionStoreConfig {
                cas_retries: 3,
                ..Default::default()
            },
        );
        store.put_history("c1", &[]).await.unwrap();

        let err = store
            .append_message(&Message::user("c1", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Contended { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_owner_context_round_trip() {
        let store = store();
        let ctx = OwnerContext {
            owner_id: "o1".to_string(),
            display_name: Some("Ada".to_string()),
            ..Default::default()
        };
        store.put_owner_context(&ctx).await.unwrap();
        assert_eq!(store.get_owner_context("o1").await.unwrap(), Some(ctx));
    }
}
