//! Background consumer for queued assistant turns.
//!
//! One poll loop per process. Every envelope is processed in its own task so a
//! slow inference call never holds up the next poll; a semaphore bounds how
//! many run at once. Task failures and panics are logged and counted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use super::broker::MessageBroker;
use super::context::build_context_prompt;
use super::envelope::DispatchEnvelope;
use crate::conversation::ConversationService;
use crate::inference::InferenceClient;
use crate::metrics;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub group: String,
    pub topic: String,
    pub poll_timeout: Duration,
    pub max_in_flight: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            group: "sqlpilot-workers".to_string(),
            topic: "assistant-requests".to_string(),
            poll_timeout: Duration::from_millis(1000),
            max_in_flight: 4,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub received: u64,
    pub processed: u64,
    pub failed: u64,
    pub malformed: u64,
    pub panicked: u64,
}

/// Handles one decoded envelope.
#[async_trait]
pub trait TurnProcessor: Send + Sync {
    async fn process(&self, envelope: DispatchEnvelope) -> anyhow::Result<()>;
}

/// Rebuilds context from the conversation store, asks the inference service
/// for a reply and records it as an assistant message.
pub struct AssistantTurnProcessor {
    conversations: Arc<ConversationService>,
    inference: Arc<dyn InferenceClient>,
    history_window: usize,
}

impl AssistantTurnProcessor {
    pub fn new(
        conversations: Arc<ConversationService>,
        inference: Arc<dyn InferenceClient>,
        history_window: usize,
    ) -> Self {
        Self {
            conversations,
            inference,
            history_window,
        }
    }
}

#[async_trait]
impl TurnProcessor for AssistantTurnProcessor {
    async fn process(&self, envelope: DispatchEnvelope) -> anyhow::Result<()> {
        let conversation_id = envelope.conversation_id.as_str();

        let session = self.conversations.get_session(conversation_id).await;
        let owner = match &session {
            Some(session) => self.conversations.get_owner_context(&session.owner_id).await,
            None => None,
        };
        let history = self.conversations.get_history(conversation_id).await;
        debug!(
            "Building context for {} ({} cached messages, owner context: {})",
            conversation_id,
            history.len(),
            owner.is_some()
        );

        let prompt = build_context_prompt(
            owner.as_ref(),
            &history,
            self.history_window,
            &envelope.prompt_text,
        );
        let reply = self
            .inference
            .infer(&prompt)
            .await
            .with_context(|| format!("inference failed for conversation {}", conversation_id))?;

        let mut metadata = Map::new();
        metadata.insert(
            "envelopeTimestamp".to_string(),
            Value::String(envelope.enqueued_at.to_rfc3339()),
        );
        self.conversations
            .record_assistant_reply(conversation_id, reply.trim(), metadata)
            .await?;
        Ok(())
    }
}

type TaskOutcome = Result<(), (String, anyhow::Error)>;

pub struct DispatchWorker {
    broker: Arc<dyn MessageBroker>,
    processor: Arc<dyn TurnProcessor>,
    config: WorkerConfig,
}

impl DispatchWorker {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        processor: Arc<dyn TurnProcessor>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            broker,
            processor,
            config,
        }
    }

    /// Consume until `shutdown` turns true (or its sender is dropped), then
    /// wait for in-flight turns and return what happened.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<WorkerStats> {
        let mut subscription = self
            .broker
            .subscribe(&self.config.group, &self.config.topic)
            .await
            .context("failed to subscribe to dispatch topic")?;
        let permits = Arc::new(Semaphore::new(self.config.max_in_flight.max(1)));
        let mut tasks: JoinSet<TaskOutcome> = JoinSet::new();
        let mut stats = WorkerStats::default();

        info!(
            "Dispatch worker consuming {} as {} (max {} in flight)",
            self.config.topic, self.config.group, self.config.max_in_flight
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            while let Some(finished) = tasks.try_join_next() {
                record_outcome(&mut stats, finished);
            }

            let permit = tokio::select! {
                permit = Arc::clone(&permits).acquire_owned() => {
                    permit.context("worker semaphore closed")?
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let delivery = match subscription.poll(self.config.poll_timeout).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(e) => {
                    error!("Dispatch poll failed: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_timeout) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
            };
            stats.received += 1;

            let envelope = match DispatchEnvelope::decode(&delivery.payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    stats.malformed += 1;
                    metrics::record_dispatch("malformed");
                    warn!("Skipping malformed envelope at offset {}: {}", delivery.offset, e);
                    continue;
                }
            };

            debug!(
                "Dispatching offset {} for conversation {}",
                delivery.offset, envelope.conversation_id
            );
            let processor = Arc::clone(&self.processor);
            tasks.spawn(async move {
                let _permit = permit;
                let conversation_id = envelope.conversation_id.clone();
                processor
                    .process(envelope)
                    .await
                    .map_err(|e| (conversation_id, e))
            });
        }

        info!("Dispatch worker stopping, draining {} in-flight turns", tasks.len());
        while let Some(finished) = tasks.join_next().await {
            record_outcome(&mut stats, finished);
        }
        if let Err(e) = subscription.commit().await {
            warn!("Final offset commit failed: {}", e);
        }

        info!(
            "Dispatch worker stopped: {} received, {} processed, {} failed, {} malformed, {} panicked",
            stats.received, stats.processed, stats.failed, stats.malformed, stats.panicked
        );
        Ok(stats)
    }
}

fn record_outcome(stats: &mut WorkerStats, finished: Result<TaskOutcome, JoinError>) {
    match finished {
        Ok(Ok(())) => {
            stats.processed += 1;
            metrics::record_dispatch("processed");
        }
        Ok(Err((conversation_id, e))) => {
            stats.failed += 1;
            metrics::record_dispatch("failed");
            error!("Turn for conversation {} failed: {:#}", conversation_id, e);
        }
        Err(e) if e.is_panic() => {
            stats.panicked += 1;
            metrics::record_dispatch("panicked");
            error!("Turn task panicked: {}", e);
        }
        Err(e) => {
            stats.failed += 1;
            metrics::record_dispatch("failed");
            error!("Turn task cancelled: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::broker::SqliteBroker;
    use std::sync::Mutex;
    use tokio::sync::Barrier;

    fn config() -> WorkerConfig {
        WorkerConfig {
            poll_timeout: Duration::from_millis(20),
            max_in_flight: 4,
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TurnProcessor for Recording {
        async fn process(&self, envelope: DispatchEnvelope) -> anyhow::Result<()> {
            match envelope.prompt_text.as_str() {
                "fail" => anyhow::bail!("inference unavailable"),
                "panic" => panic!("processor bug"),
                _ => {}
            }
            self.seen.lock().unwrap().push(envelope.conversation_id);
            Ok(())
        }
    }

    async fn publish(broker: &SqliteBroker, conversation_id: &str, prompt: &str) {
        let payload = DispatchEnvelope::new(conversation_id, prompt, None).encode().unwrap();
        broker.publish(&config().topic, payload).await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_counts_outcomes_and_drains() {
        let broker = SqliteBroker::in_memory().unwrap();
        publish(&broker, "c1", "hello").await;
        publish(&broker, "c2", "fail").await;
        publish(&broker, "c3", "panic").await;
        broker.publish(&config().topic, "{not json".to_string()).await.unwrap();
        publish(&broker, "c4", "hello").await;

        let processor = Arc::new(Recording::default());
        let worker = DispatchWorker::new(Arc::new(broker.clone()), processor.clone(), config());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(rx).await });

        tokio::time::timeout(Duration::from_secs(5), async {
            while processor.seen.lock().unwrap().len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        tx.send(true).unwrap();

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.received, 5);
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.panicked, 1);
        assert_eq!(stats.malformed, 1);

        let mut seen = processor.seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["c1", "c4"]);
    }

    /// Each turn waits until two are in flight together.
    struct Rendezvous {
        barrier: Barrier,
    }

    #[async_trait]
    impl TurnProcessor for Rendezvous {
        async fn process(&self, _envelope: DispatchEnvelope) -> anyhow::Result<()> {
            tokio::time::timeout(Duration::from_secs(2), self.barrier.wait())
                .await
                .context("turns were not processed concurrently")?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_slow_turn_does_not_block_next_poll() {
        let broker = SqliteBroker::in_memory().unwrap();
        publish(&broker, "c1", "slow").await;
        publish(&broker, "c2", "slow").await;

        let worker = DispatchWorker::new(
            Arc::new(broker),
            Arc::new(Rendezvous {
                barrier: Barrier::new(2),
            }),
            config(),
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(rx).await });

        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send(true).unwrap();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_shutdown_observed_within_poll_interval() {
        let broker = SqliteBroker::in_memory().unwrap();
        let worker = DispatchWorker::new(Arc::new(broker), Arc::new(Recording::default()), config());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let stats = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(stats, WorkerStats::default());
    }
}
