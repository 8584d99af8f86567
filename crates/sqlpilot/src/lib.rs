//! Orchestration core that turns natural-language requests into
//! safety-gated SQL or conversational replies.

pub mod assistant;
pub mod config;
pub mod conversation;
pub mod dispatch;
pub mod error;
pub mod inference;
pub mod intent;
pub mod memory;
pub mod memory_db;
pub mod metrics;
pub mod safety_gate;
pub mod schema;
pub mod session_store;
pub mod shared_state;
pub mod sql_generation;
pub mod telemetry;
pub mod utils;
pub mod worker_server;

pub use assistant::QueryAssistant;
pub use config::Config;
pub use conversation::ConversationService;
pub use error::{BrokerError, CacheError, GenerationError, InferenceError};
pub use inference::{HttpInferenceClient, InferenceClient, ScriptedInferenceClient};
pub use intent::{IntentDecision, QueryIntentClassifier};
pub use memory::{ConversationLog, ConversationSession, Message, OwnerContext, Role};
pub use safety_gate::{classify, sanitize, GateVerdict, UnsafeReason};
pub use schema::{Dialect, SchemaSnapshot};
pub use shared_state::CoreServices;
pub use sql_generation::{GeneratedStatement, SqlGenerator, StatementVerdict};
pub use worker_server::run_worker_server;
