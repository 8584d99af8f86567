//! Asynchronous chat path: ingress enqueues one envelope per turn, a
//! background worker consumes them and writes replies back to the
//! conversation store.

pub mod broker;
pub mod context;
pub mod envelope;
pub mod producer;
pub mod worker;

pub use broker::{Delivery, MessageBroker, SqliteBroker, Subscription};
pub use context::build_context_prompt;
pub use envelope::DispatchEnvelope;
pub use producer::DispatchProducer;
pub use worker::{AssistantTurnProcessor, DispatchWorker, TurnProcessor, WorkerConfig, WorkerStats};
