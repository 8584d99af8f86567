//! Caller-facing operations for the HTTP layer: SQL generation, query-intent
//! detection and result interpretation.

use std::sync::Arc;

use serde_json::Value;

use crate::error::{GenerationError, InferenceError};
use crate::inference::InferenceClient;
use crate::intent::QueryIntentClassifier;
use crate::schema::{Dialect, SchemaSnapshot};
use crate::sql_generation::{ResultInterpreter, SqlGenerator};

pub struct QueryAssistant {
    generator: SqlGenerator,
    classifier: QueryIntentClassifier,
    interpreter: ResultInterpreter,
}

impl QueryAssistant {
    pub fn new(inference: Arc<dyn InferenceClient>) -> Self {
        Self {
            generator: SqlGenerator::new(Arc::clone(&inference)),
            classifier: QueryIntentClassifier::new(Arc::clone(&inference)),
            interpreter: ResultInterpreter::new(inference),
        }
    }

    /// Safety-checked SQL for `natural_query`. `db_type` is a dialect tag
    /// such as `mssql` or `postgres`; unknown tags are passed through to the
    /// prompt as-is.
    pub async fn generate_sql(
        &self,
        natural_query: &str,
        schema: &SchemaSnapshot,
        db_type: &str,
    ) -> Result<String, GenerationError> {
        let dialect: Dialect = db_type.parse().unwrap_or_default();
        let statement = self.generator.generate(natural_query, schema, &dialect).await?;
        Ok(statement.sanitized_text)
    }

    pub async fn needs_query_execution(&self, message: &str, schema: Option<&SchemaSnapshot>) -> bool {
        self.classifier.needs_query(message, schema).await
    }

    pub async fn interpret_results(
        &self,
        question: &str,
        sql: &str,
        rows: &[Value],
    ) -> Result<String, InferenceError> {
        self.interpreter.interpret(question, sql, rows).await
    }
}
