//! Turns executed query results back into prose. Shares the
//! render, infer, strip shape with generation but has no safety gate.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::prompts;
use crate::error::InferenceError;
use crate::inference::InferenceClient;
use crate::utils::TextUtils;

pub const DEFAULT_MAX_ROWS: usize = 50;

pub struct ResultInterpreter {
    inference: Arc<dyn InferenceClient>,
    max_rows: usize,
}

impl ResultInterpreter {
    pub fn new(inference: Arc<dyn InferenceClient>) -> Self {
        Self {
            inference,
            max_rows: DEFAULT_MAX_ROWS,
        }
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows.max(1);
        self
    }

    pub async fn interpret(
        &self,
        question: &str,
        sql: &str,
        rows: &[Value],
    ) -> Result<String, InferenceError> {
        let prompt = prompts::interpretation_prompt(question, sql, rows, self.max_rows);
        debug!("Interpreting {} result rows", rows.len());
        let reply = self.inference.infer(&prompt).await?;
        Ok(TextUtils::strip_code_fences(&reply).to_string())
    }
}
