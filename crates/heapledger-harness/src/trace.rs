//! Allocation trace format.
//!
//! A trace is a JSON document naming a sequence of operations over numbered
//! pointer slots:
//!
//! ```json
//! {
//!   "name": "leak_at_shutdown",
//!   "ops": [
//!     {"op": "alloc", "slot": 0, "size": 64},
//!     {"op": "alloc", "slot": 1, "size": 128}
//!   ]
//! }
//! ```
//!
//! `mode`, `policy`, `mutation_checks` and `budget` are optional and override the runner's
//! defaults for that trace.

use std::path::Path;

use heapledger_core::CorruptionPolicy;
use serde::{Deserialize, Serialize};

use crate::error::HarnessError;

/// Highest slot number a trace may use.
pub const MAX_SLOT: u32 = 4095;

/// One replayed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TraceOp {
    /// Allocate `size` bytes into `slot`.
    Alloc { slot: u32, size: usize },
    /// Free the allocation held by `slot`.
    Free { slot: u32 },
    /// Resize the allocation held by `slot` (allocate if empty).
    Realloc { slot: u32, size: usize },
    /// Overwrite the first guard byte after the payload in `slot`.
    Corrupt { slot: u32 },
    /// Run an integrity check.
    Check,
}

impl TraceOp {
    #[must_use]
    pub const fn slot(&self) -> Option<u32> {
        match *self {
            Self::Alloc { slot, .. }
            | Self::Free { slot }
            | Self::Realloc { slot, .. }
            | Self::Corrupt { slot } => Some(slot),
            Self::Check => None,
        }
    }
}

/// A named operation sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// `tracked` or `passthrough`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// `halt` or `isolate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    /// Run integrity walks around each allocate/free.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation_checks: Option<bool>,
    /// Raw allocator byte budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<usize>,
    pub ops: Vec<TraceOp>,
}

impl Trace {
    #[must_use]
    pub fn new(name: impl Into<String>, ops: Vec<TraceOp>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            mode: None,
            policy: None,
            mutation_checks: None,
            budget: None,
            ops,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: CorruptionPolicy) -> Self {
        self.policy = Some(policy.as_str().to_string());
        self
    }

    #[must_use]
    pub fn with_mutation_checks(mut self, enabled: bool) -> Self {
        self.mutation_checks = Some(enabled);
        self
    }

    #[must_use]
    pub fn with_budget(mut self, budget: usize) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Parse and validate a trace.
    pub fn from_json(json: &str) -> Result<Self, HarnessError> {
        let trace: Self = serde_json::from_str(json)?;
        trace.validate()?;
        Ok(trace)
    }

    /// Load a trace from a file.
    pub fn from_file(path: &Path) -> Result<Self, HarnessError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Structural checks. Operation semantics (empty slots, zero sizes) are
    /// left to the ledger.
    pub fn validate(&self) -> Result<(), HarnessError> {
        let invalid = |reason: String| HarnessError::InvalidTrace {
            trace: self.name.clone(),
            reason,
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty".to_string()));
        }
        if let Some((step, op)) = self
            .ops
            .iter()
            .enumerate()
            .find(|(_, op)| op.slot().is_some_and(|slot| slot > MAX_SLOT))
        {
            return Err(invalid(format!(
                "step {step}: slot in {op:?} exceeds {MAX_SLOT}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_ops() {
        let trace = Trace::from_json(
            r#"{
                "name": "t",
                "policy": "isolate",
                "ops": [
                    {"op": "alloc", "slot": 0, "size": 64},
                    {"op": "corrupt", "slot": 0},
                    {"op": "check"},
                    {"op": "realloc", "slot": 0, "size": 8},
                    {"op": "free", "slot": 0}
                ]
            }"#,
        )
        .expect("valid trace");
        assert_eq!(trace.ops.len(), 5);
        assert_eq!(trace.ops[0], TraceOp::Alloc { slot: 0, size: 64 });
        assert_eq!(trace.ops[2], TraceOp::Check);
        assert_eq!(trace.policy.as_deref(), Some("isolate"));
        assert!(trace.mode.is_none());
    }

    #[test]
    fn rejects_out_of_range_slot() {
        let json = format!(
            r#"{{"name": "t", "ops": [{{"op": "free", "slot": {}}}]}}"#,
            MAX_SLOT + 1
        );
        let err = Trace::from_json(&json).expect_err("slot too large");
        assert!(matches!(err, HarnessError::InvalidTrace { .. }), "{err}");
    }

    #[test]
    fn rejects_unknown_op() {
        let err = Trace::from_json(r#"{"name": "t", "ops": [{"op": "poke"}]}"#)
            .expect_err("unknown op");
        assert!(matches!(err, HarnessError::Json(_)));
    }

    #[test]
    fn json_form_is_stable() {
        let trace = Trace::new("t", vec![TraceOp::Free { slot: 3 }]).with_budget(1024);
        let value: serde_json::Value =
            serde_json::from_str(&trace.to_json().expect("serialize")).expect("parse");
        assert_eq!(value["ops"][0]["op"], "free");
        assert_eq!(value["ops"][0]["slot"], 3);
        assert_eq!(value["budget"], 1024);
        assert!(value.get("description").is_none());
    }
}
