use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::broker::MessageBroker;
use super::envelope::DispatchEnvelope;
use crate::error::BrokerError;
use crate::metrics;

/// Publishes one envelope per user turn and returns without waiting for it
/// to be consumed.
pub struct DispatchProducer {
    broker: Arc<dyn MessageBroker>,
    topic: String,
}

impl DispatchProducer {
    pub fn new(broker: Arc<dyn MessageBroker>, topic: impl Into<String>) -> Self {
        Self {
            broker,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// A broker failure is returned to the caller; the turn is not buffered
    /// locally.
    pub async fn enqueue(
        &self,
        conversation_id: &str,
        prompt_text: &str,
        metadata: Option<Map<String, Value>>,
    ) -> Result<DispatchEnvelope, BrokerError> {
        let envelope = DispatchEnvelope::new(conversation_id, prompt_text, metadata);
        let payload = envelope.encode()?;

        match self.broker.publish(&self.topic, payload).await {
            Ok(offset) => {
                metrics::record_dispatch("enqueued");
                debug!(
                    "Enqueued turn for {} on {} at offset {}",
                    conversation_id, self.topic, offset
                );
                Ok(envelope)
            }
            Err(e) => {
                metrics::record_dispatch("enqueue_failed");
                warn!("Failed to enqueue turn for {}: {}", conversation_id, e);
                Err(e)
            }
        }
    }
}
