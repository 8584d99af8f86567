//! Natural language to SQL: prompt building, the one-repair generation loop
//! and the sibling result interpretation pipeline.

pub mod interpret;
pub mod orchestrator;
pub mod prompts;

use serde::Serialize;

use crate::safety_gate::UnsafeReason;

pub use interpret::ResultInterpreter;
pub use orchestrator::SqlGenerator;

/// Upper bound on repair round trips after the first rejection.
pub const MAX_CORRECTION_ATTEMPTS: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StatementVerdict {
    Pending,
    Accepted,
    RejectedFinal(UnsafeReason),
}

/// A model reply as it moves through fence stripping and the safety gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedStatement {
    pub raw_text: String,
    pub sanitized_text: String,
    pub verdict: StatementVerdict,
    pub correction_attempts: u8,
}

impl GeneratedStatement {
    pub fn pending(raw_text: impl Into<String>, correction_attempts: u8) -> Self {
        Self {
            raw_text: raw_text.into(),
            sanitized_text: String::new(),
            verdict: StatementVerdict::Pending,
            correction_attempts,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.verdict == StatementVerdict::Accepted
    }
}
