//! Harness error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown scenario '{0}' (see list-scenarios)")]
    UnknownScenario(String),
    #[error("invalid trace '{trace}': {reason}")]
    InvalidTrace { trace: String, reason: String },
}
