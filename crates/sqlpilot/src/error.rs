//! Error taxonomy for the orchestration core.
//!
//! Each boundary a caller has to branch on gets its own enum. Startup wiring and
//! the durable conversation log stay on `anyhow`.

use std::time::Duration;

use crate::safety_gate::UnsafeReason;
use crate::sql_generation::GeneratedStatement;

/// Failure of a single call to the external text-generation service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InferenceError {
    #[error("inference service unavailable: {0}")]
    Unavailable(String),
    #[error("inference call timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed inference response: {0}")]
    MalformedResponse(String),
}

/// Failure of the synchronous SQL generation path.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerationError {
    #[error("could not reach the inference service: {0}")]
    InferenceUnavailable(#[from] InferenceError),
    #[error("could not produce a safe query after {} correction attempt(s): {reason}", .statement.correction_attempts)]
    UnsafeStatement {
        reason: UnsafeReason,
        statement: GeneratedStatement,
    },
}

impl GenerationError {
    /// Short machine-readable code for callers that map failures onto responses.
    pub fn code(&self) -> &'static str {
        match self {
            GenerationError::InferenceUnavailable(_) => "inference_unavailable",
            GenerationError::UnsafeStatement { .. } => "unsafe_statement",
        }
    }
}

/// Failure talking to the message broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("envelope encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Failure talking to the session cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    #[error("cached value could not be decoded: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("history write for {key} lost {attempts} compare-and-set races")]
    Contended { key: String, attempts: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inference_error_display() {
        let err = InferenceError::Unavailable("connection refused".to_string());
        assert_eq!(err.to_string(), "inference service unavailable: connection refused");

        let err = InferenceError::Timeout(Duration::from_secs(30));
        assert_eq!(err.to_string(), "inference call timed out after 30s");

        let err = InferenceError::MalformedResponse("no choices".to_string());
        assert_eq!(err.to_string(), "malformed inference response: no choices");
    }

    #[test]
    fn test_generation_error_from_inference_error() {
        let err: GenerationError = InferenceError::Timeout(Duration::from_secs(5)).into();
        assert_eq!(err.code(), "inference_unavailable");
        assert!(matches!(
            err,
            GenerationError::InferenceUnavailable(InferenceError::Timeout(_))
        ));
    }

    #[test]
    fn test_cache_error_contended_display() {
        let err = CacheError::Contended {
            key: "chat:history:abc".to_string(),
            attempts: 5,
        };
        assert_eq!(
            err.to_string(),
            "history write for chat:history:abc lost 5 compare-and-set races"
        );
    }
}
