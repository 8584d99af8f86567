use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One queued user turn. Wire format:
/// `{"conversationId", "prompt", "timestamp", "metadata"?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchEnvelope {
    pub conversation_id: String,
    #[serde(rename = "prompt")]
    pub prompt_text: String,
    #[serde(rename = "timestamp")]
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl DispatchEnvelope {
    pub fn new(
        conversation_id: impl Into<String>,
        prompt_text: impl Into<String>,
        metadata: Option<Map<String, Value>>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            prompt_text: prompt_text.into(),
            enqueued_at: Utc::now(),
            metadata,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}
