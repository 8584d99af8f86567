//! Does a chat message need the SQL pipeline?
//!
//! Two stages: a local keyword screen, then (only when it fires and a schema
//! is available) one constrained yes/no inference call.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::inference::InferenceClient;
use crate::schema::SchemaSnapshot;
use crate::utils::TextUtils;

pub const QUERY_KEYWORDS: &[&str] = &[
    "show", "list", "get", "find", "search", "count", "select", "how many", "what are", "which",
];

/// How the classifier reached its answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentDecision {
    /// No keyword matched; no inference call was made.
    HeuristicMiss,
    /// A keyword matched but no schema was supplied.
    NoSchema,
    Confirmed,
    Declined,
    /// The confirmation call failed; treated as "no query needed".
    InferenceFailed,
}

impl IntentDecision {
    pub fn needs_query(&self) -> bool {
        matches!(self, IntentDecision::Confirmed)
    }
}

pub fn matches_query_keywords(message: &str) -> bool {
    let lowered = message.to_lowercase();
    QUERY_KEYWORDS.iter().any(|keyword| lowered.contains(keyword))
}

fn confirmation_prompt(message: &str, schema_text: &str) -> String {
    format!(
        "Decide whether answering the user's message requires querying the database described below.\n\
         \n\
         Schema:\n\
         {schema_text}\n\
         Message: {message}\n\
         \n\
         Answer with exactly one word: YES or NO.\n",
        schema_text = schema_text,
        message = message.trim(),
    )
}

pub struct QueryIntentClassifier {
    inference: Arc<dyn InferenceClient>,
}

impl QueryIntentClassifier {
    pub fn new(inference: Arc<dyn InferenceClient>) -> Self {
        Self { inference }
    }

    pub async fn classify(&self, message: &str, schema: Option<&SchemaSnapshot>) -> IntentDecision {
        if !matches_query_keywords(message) {
            return IntentDecision::HeuristicMiss;
        }
        let Some(schema) = schema else {
            return IntentDecision::NoSchema;
        };

        let prompt = confirmation_prompt(message, &schema.render());
        match self.inference.infer(&prompt).await {
            Ok(reply) => {
                let reply = TextUtils::strip_code_fences(&reply);
                let confirmed = reply
                    .get(..3)
                    .is_some_and(|head| head.eq_ignore_ascii_case("yes"));
                debug!("Query intent confirmation answered {}", confirmed);
                if confirmed {
                    IntentDecision::Confirmed
                } else {
                    IntentDecision::Declined
                }
            }
            Err(e) => {
                warn!("Query intent confirmation failed, assuming no query: {}", e);
                IntentDecision::InferenceFailed
            }
        }
    }

    pub async fn needs_query(&self, message: &str, schema: Option<&SchemaSnapshot>) -> bool {
        self.classify(message, schema).await.needs_query()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InferenceError;
    use crate::inference::ScriptedInferenceClient;
    use crate::schema::TableSchema;

    fn schema() -> SchemaSnapshot {
        SchemaSnapshot {
            database_name: "Shop".to_string(),
            tables: vec![TableSchema {
                name: "Orders".to_string(),
                ..Default::default()
            }],
        }
    }

    #[test]
    fn test_keyword_screen_is_case_insensitive_substring() {
        assert!(matches_query_keywords("SHOW me the orders"));
        assert!(matches_query_keywords("How Many orders shipped?"));
        assert!(matches_query_keywords("anything targeted"));
        assert!(!matches_query_keywords("hello there"));
    }

    #[tokio::test]
    async fn test_heuristic_miss_skips_inference() {
        let client = Arc::new(ScriptedInferenceClient::always("YES"));
        let classifier = QueryIntentClassifier::new(client.clone());
        let decision = classifier.classify("hello", Some(&schema())).await;
        assert_eq!(decision, IntentDecision::HeuristicMiss);
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_no_schema_is_false_without_inference() {
        let client = Arc::new(ScriptedInferenceClient::always("YES"));
        let classifier = QueryIntentClassifier::new(client.clone());
        assert!(!classifier.needs_query("list all orders", None).await);
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_yes_prefix_confirms() {
        let client = Arc::new(ScriptedInferenceClient::new(["yes, it does", "No."]));
        let classifier = QueryIntentClassifier::new(client.clone());
        assert_eq!(
            classifier.classify("list all orders", Some(&schema())).await,
            IntentDecision::Confirmed
        );
        assert_eq!(
            classifier.classify("list all orders", Some(&schema())).await,
            IntentDecision::Declined
        );
        assert_eq!(client.calls(), 2);
        assert!(client.prompts()[0].contains("Table: Orders"));
    }

    #[tokio::test]
    async fn test_inference_failure_fails_closed() {
        let client = Arc::new(ScriptedInferenceClient::from_results([Err(
            InferenceError::Unavailable("down".to_string()),
        )]));
        let classifier = QueryIntentClassifier::new(client);
        let decision = classifier.classify("count orders", Some(&schema())).await;
        assert_eq!(decision, IntentDecision::InferenceFailed);
        assert!(!decision.needs_query());
    }
}
