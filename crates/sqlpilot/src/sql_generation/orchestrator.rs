//! Question + schema + dialect to a gate-passing SELECT, with at most one
//! repair round trip.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{prompts, GeneratedStatement, StatementVerdict, MAX_CORRECTION_ATTEMPTS};
use crate::error::{GenerationError, InferenceError};
use crate::inference::InferenceClient;
use crate::metrics;
use crate::safety_gate::{self, GateVerdict, UnsafeReason};
use crate::schema::{Dialect, SchemaSnapshot};
use crate::utils::TextUtils;

pub struct SqlGenerator {
    inference: Arc<dyn InferenceClient>,
}

impl SqlGenerator {
    pub fn new(inference: Arc<dyn InferenceClient>) -> Self {
        Self { inference }
    }

    /// Generate a statement for `question`.
    ///
    /// The returned statement is always `Accepted` and its `sanitized_text` is
    /// what callers should run. A first rejection triggers exactly one repair
    /// prompt; a second rejection fails with `UnsafeStatement`. An inference
    /// failure on either call fails with `InferenceUnavailable`.
    pub async fn generate(
        &self,
        question: &str,
        schema: &SchemaSnapshot,
        dialect: &Dialect,
    ) -> Result<GeneratedStatement, GenerationError> {
        let schema_text = schema.render();
        let prompt = prompts::generation_prompt(question, &schema_text, dialect);
        debug!(
            "Generating SQL for {} ({} tables, prompt {} chars)",
            dialect,
            schema.tables.len(),
            prompt.len()
        );

        let reply = self.call(&prompt).await?;
        let (reason, first) = match screen_reply(reply, 0) {
            Ok(statement) => {
                metrics::record_generation("accepted");
                info!("Generated statement accepted on first attempt");
                return Ok(statement);
            }
            Err(rejected) => rejected,
        };

        warn!("Generated statement rejected ({}), requesting one repair", reason);
        let rejected = TextUtils::strip_code_fences(&first.raw_text);
        let repair = prompts::repair_prompt(question, rejected, &reason, &schema_text, dialect);
        let reply = self.call(&repair).await?;

        match screen_reply(reply, MAX_CORRECTION_ATTEMPTS) {
            Ok(statement) => {
                metrics::record_generation("repaired");
                info!("Generated statement accepted after repair");
                Ok(statement)
            }
            Err((reason, statement)) => {
                metrics::record_generation("rejected");
                warn!("Repaired statement still rejected ({}), failing closed", reason);
                Err(GenerationError::UnsafeStatement { reason, statement })
            }
        }
    }

    async fn call(&self, prompt: &str) -> Result<String, GenerationError> {
        self.inference.infer(prompt).await.map_err(|e: InferenceError| {
            metrics::record_generation("inference_unavailable");
            warn!("Inference call failed during SQL generation: {}", e);
            GenerationError::from(e)
        })
    }
}

/// Strip fences, sanitize and classify one model reply. The statement comes
/// back `Accepted`, or `RejectedFinal` alongside the gate's reason.
fn screen_reply(
    raw: String,
    correction_attempts: u8,
) -> Result<GeneratedStatement, (UnsafeReason, GeneratedStatement)> {
    let mut statement = GeneratedStatement::pending(raw, correction_attempts);
    let (sanitized, verdict) =
        safety_gate::screen(TextUtils::strip_code_fences(&statement.raw_text));
    statement.sanitized_text = sanitized;

    match verdict {
        GateVerdict::Safe => {
            metrics::record_gate_verdict("safe");
            statement.verdict = StatementVerdict::Accepted;
            Ok(statement)
        }
        GateVerdict::Unsafe(reason) => {
            metrics::record_gate_verdict("unsafe");
            statement.verdict = StatementVerdict::RejectedFinal(reason.clone());
            Err((reason, statement))
        }
    }
}
