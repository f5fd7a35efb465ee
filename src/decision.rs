//! Think-step decisions
//!
//! The reasoning service answers each Think invocation with a small JSON
//! object: `{"type": "notify", "content": "..."}`, `{"type":
//! "save_memory", "content": "..."}` or `{"type": "nothing"}`. The
//! service output is never trusted to be well-typed - anything that does
//! not parse into exactly one of the three variants degrades to
//! `Nothing` and is reported as a protocol violation.

use serde::{Deserialize, Serialize};

use crate::error::CompanionError;

/// One decision per Think cycle, consumed exactly once by the executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Decision {
    /// Do nothing this cycle
    Nothing,
    /// Proactively message the owner
    Notify { content: String },
    /// Persist a high-confidence observation straight to Layer 2
    SaveMemory { content: String },
}

impl Decision {
    pub fn kind(&self) -> &'static str {
        match self {
            Decision::Nothing => "nothing",
            Decision::Notify { .. } => "notify",
            Decision::SaveMemory { .. } => "save_memory",
        }
    }
}

/// Parse raw reasoning output into a `Decision`.
///
/// Accepts a bare JSON object, or an object embedded in surrounding
/// prose (first `{` to last `}`). A `notify`/`save_memory` with empty
/// content is a violation, not an empty message.
pub fn parse_decision(raw: &str) -> Result<Decision, CompanionError> {
    let decision = serde_json::from_str::<Decision>(raw)
        .or_else(|_| {
            // Some models wrap the JSON in explanation text
            let start = raw.find('{');
            let end = raw.rfind('}');
            match (start, end) {
                (Some(s), Some(e)) if e > s => serde_json::from_str::<Decision>(&raw[s..=e]),
                _ => serde_json::from_str::<Decision>(raw),
            }
        })
        .map_err(|e| {
            CompanionError::ProtocolViolation(format!(
                "unparseable decision ({}): {}",
                e,
                raw.chars().take(120).collect::<String>()
            ))
        })?;

    match &decision {
        Decision::Notify { content } | Decision::SaveMemory { content }
            if content.trim().is_empty() =>
        {
            Err(CompanionError::ProtocolViolation(format!(
                "{} decision with empty content",
                decision.kind()
            )))
        }
        _ => Ok(decision),
    }
}
