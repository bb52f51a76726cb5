//! Replay and scenario harness for heapledger.
//!
//! This crate provides:
//! - Trace format: JSON allocation traces over numbered pointer slots
//! - Replay: run a trace against a fresh ledger and check accounting
//!   invariants after every step
//! - Scenarios: built-in traces with expected leak and corruption outcomes
//! - Structured logs: JSONL records for runs, plus schema validation

pub mod error;
pub mod runner;
pub mod scenarios;
pub mod structured_log;
pub mod trace;

pub use error::HarnessError;
pub use runner::{ReplayOptions, ReplayReport, StepStatus, TraceRunner};
pub use scenarios::{Scenario, ScenarioResult};
pub use trace::{Trace, TraceOp};
