//! Explicit startup wiring. Every long-lived handle (HTTP client, cache,
//! durable log, broker) is built once here and passed down by `Arc`.

use std::sync::Arc;

use anyhow::Context;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::assistant::QueryAssistant;
use crate::config::Config;
use crate::conversation::ConversationService;
use crate::dispatch::{
    AssistantTurnProcessor, DispatchEnvelope, DispatchProducer, DispatchWorker, MessageBroker,
    SqliteBroker, WorkerConfig,
};
use crate::inference::{HttpInferenceClient, InferenceClient, InferenceSettings};
use crate::memory::ConversationLog;
use crate::memory_db::SqliteConversationLog;
use crate::session_store::{
    CacheBackend, MokaCacheBackend, SessionStore, SessionStoreConfig, SqliteCacheBackend,
};

pub struct CoreServices {
    pub config: Arc<Config>,
    pub inference: Arc<dyn InferenceClient>,
    pub assistant: Arc<QueryAssistant>,
    pub conversations: Arc<ConversationService>,
    pub broker: Arc<dyn MessageBroker>,
    pub producer: Arc<DispatchProducer>,
}

impl CoreServices {
    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let inference: Arc<dyn InferenceClient> = Arc::new(HttpInferenceClient::new(InferenceSettings {
            base_url: cfg.inference_url.clone(),
            model: cfg.inference_model.clone(),
            api_key: cfg.inference_api_key.clone(),
            timeout: cfg.inference_timeout(),
            max_tokens: cfg.inference_max_tokens,
            temperature: cfg.inference_temperature,
        })?);
        Self::open(cfg, inference)
    }

    /// Services over the files in `DATA_DIR`. Every process opening the same
    /// directory shares the log, the broker and the session cache.
    pub fn open(cfg: &Config, inference: Arc<dyn InferenceClient>) -> anyhow::Result<Self> {
        let log_path = cfg.conversation_db_path();
        let log = match SqliteConversationLog::open(&log_path) {
            Ok(log) => log,
            Err(e) => {
                warn!(
                    "Failed to open conversation log at {}: {:#}. Falling back to in-memory.",
                    log_path.display(),
                    e
                );
                SqliteConversationLog::in_memory()?
            }
        };

        let broker = SqliteBroker::open(&cfg.broker_db_path()).with_context(|| {
            format!("failed to open broker at {}", cfg.broker_db_path().display())
        })?;

        let cache = SqliteCacheBackend::open(&cfg.cache_db_path()).with_context(|| {
            format!("failed to open session cache at {}", cfg.cache_db_path().display())
        })?;

        Ok(Self::assemble(
            cfg,
            inference,
            Arc::new(cache),
            Arc::new(log),
            Arc::new(broker),
        ))
    }

    /// Fully in-process services around the given inference client.
    pub fn in_memory(cfg: &Config, inference: Arc<dyn InferenceClient>) -> anyhow::Result<Self> {
        Ok(Self::assemble(
            cfg,
            inference,
            Arc::new(MokaCacheBackend::new(cfg.cache_capacity)),
            Arc::new(SqliteConversationLog::in_memory()?),
            Arc::new(SqliteBroker::in_memory()?),
        ))
    }

    pub fn assemble(
        cfg: &Config,
        inference: Arc<dyn InferenceClient>,
        cache: Arc<dyn CacheBackend>,
        log: Arc<dyn ConversationLog>,
        broker: Arc<dyn MessageBroker>,
    ) -> Self {
        let store = Arc::new(SessionStore::new(
            cache,
            SessionStoreConfig {
                session_ttl: cfg.session_ttl(),
                owner_ttl: cfg.owner_ttl(),
                cas_retries: cfg.history_cas_retries,
            },
        ));
        let conversations = Arc::new(ConversationService::new(store, log));
        let producer = Arc::new(DispatchProducer::new(
            Arc::clone(&broker),
            cfg.broker_topic.clone(),
        ));
        let assistant = Arc::new(QueryAssistant::new(Arc::clone(&inference)));

        info!("Core services initialized");
        Self {
            config: Arc::new(cfg.clone()),
            inference,
            assistant,
            conversations,
            broker,
            producer,
        }
    }

    pub fn worker(&self) -> DispatchWorker {
        let processor = Arc::new(AssistantTurnProcessor::new(
            Arc::clone(&self.conversations),
            Arc::clone(&self.inference),
            self.config.history_window,
        ));
        DispatchWorker::new(
            Arc::clone(&self.broker),
            processor,
            WorkerConfig {
                group: self.config.consumer_group.clone(),
                topic: self.config.broker_topic.clone(),
                poll_timeout: self.config.poll_timeout(),
                max_in_flight: self.config.max_in_flight,
            },
        )
    }

    /// Chat ingress: record the user's turn, then queue it for the worker.
    pub async fn submit_turn(
        &self,
        conversation_id: &str,
        owner_id: &str,
        text: &str,
        metadata: Option<Map<String, Value>>,
    ) -> anyhow::Result<DispatchEnvelope> {
        self.conversations
            .begin_turn(conversation_id, owner_id, text, metadata.clone())
            .await?;
        let envelope = self
            .producer
            .enqueue(conversation_id, text, metadata)
            .await
            .context("failed to enqueue turn")?;
        Ok(envelope)
    }
}
