//! Trace replay engine.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;

use heapledger_core::guard::GUARD_MARKER;
use heapledger_core::{
    AccountingMode, AccountingSnapshot, BudgetedAllocator, CorruptionFinding, CorruptionPolicy,
    FatalAction, HeapLedger, LedgerConfig, LedgerError, LedgerEvent, RecordingSink,
    ShutdownReport,
};
use serde::Serialize;

use crate::trace::{Trace, TraceOp};

/// Raw byte budget when a trace names none.
pub const DEFAULT_BUDGET: usize = 256 << 20;

/// How a trace is replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReplayOptions {
    pub mode: AccountingMode,
    pub policy: CorruptionPolicy,
    pub check_on_mutation: bool,
}

impl Default for ReplayOptions {
    /// Tracked and isolating, so corruption is reported instead of ending
    /// the replay.
    fn default() -> Self {
        Self {
            mode: AccountingMode::Tracked,
            policy: CorruptionPolicy::Isolate,
            check_on_mutation: true,
        }
    }
}

impl ReplayOptions {
    /// Apply the overrides a trace carries.
    #[must_use]
    pub fn for_trace(self, trace: &Trace) -> Self {
        Self {
            mode: trace
                .mode
                .as_deref()
                .map_or(self.mode, AccountingMode::from_str_loose),
            policy: trace
                .policy
                .as_deref()
                .map_or(self.policy, CorruptionPolicy::from_str_loose),
            check_on_mutation: trace.mutation_checks.unwrap_or(self.check_on_mutation),
        }
    }

    fn ledger_config(self) -> LedgerConfig {
        let base = match self.mode {
            AccountingMode::Tracked => LedgerConfig::tracked(),
            AccountingMode::Passthrough => LedgerConfig::passthrough(),
        };
        base.with_corruption_policy(self.policy)
            .with_fatal_action(FatalAction::Panic)
            .with_mutation_checks(self.check_on_mutation)
    }
}

/// Result of one replayed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Ok,
    Error,
    Skipped,
    Halted,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: usize,
    pub op: TraceOp,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub snapshot: AccountingSnapshot,
}

/// A broken accounting or bookkeeping invariant seen during replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvariantViolation {
    /// Step after which it was observed; `None` for end-of-run checks.
    pub step: Option<usize>,
    pub message: String,
}

/// Everything one replay observed.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub trace: String,
    pub options: ReplayOptions,
    pub steps: Vec<StepRecord>,
    pub findings: Vec<CorruptionFinding>,
    pub violations: Vec<InvariantViolation>,
    /// Halt message when a fatal condition ended the replay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted: Option<String>,
    /// Present unless the replay halted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown: Option<ShutdownReport>,
    /// Raw blocks still held after shutdown.
    pub raw_blocks_outstanding: usize,
    pub events: Vec<LedgerEvent>,
}

impl ReplayReport {
    /// No invariant violations and nothing left on the raw heap.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty() && self.raw_blocks_outstanding == 0
    }

    #[must_use]
    pub fn count_status(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }
}

#[derive(Debug, Clone, Copy)]
struct Live {
    ptr: NonNull<u8>,
    size: usize,
}

enum Applied {
    Ok,
    Err(LedgerError),
    Skipped(&'static str),
}

impl From<Result<(), LedgerError>> for Applied {
    fn from(result: Result<(), LedgerError>) -> Self {
        match result {
            Ok(()) => Self::Ok,
            Err(err) => Self::Err(err),
        }
    }
}

/// Replays traces against fresh ledgers.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceRunner {
    options: ReplayOptions,
}

impl TraceRunner {
    #[must_use]
    pub fn new(options: ReplayOptions) -> Self {
        Self { options }
    }

    /// Replay `trace` on a new ledger over a budgeted system heap.
    ///
    /// Accounting invariants are checked after every step. A halt (fatal
    /// precondition violation, or corruption under the halt policy) ends the
    /// replay; the ledger is then abandoned instead of terminated.
    pub fn run(&self, trace: &Trace) -> ReplayReport {
        let options = self.options.for_trace(trace);
        let sink = RecordingSink::new();
        let mut ledger = HeapLedger::new(
            BudgetedAllocator::new(trace.budget.unwrap_or(DEFAULT_BUDGET)),
            sink.clone(),
        )
        .with_fatal_action(FatalAction::Panic);
        ledger.init(options.ledger_config());

        let mut slots: BTreeMap<u32, Live> = BTreeMap::new();
        let mut steps = Vec::with_capacity(trace.ops.len());
        let mut findings = Vec::new();
        let mut violations = Vec::new();
        let mut halted = None;
        let mut last_total = 0u64;

        for (step, op) in trace.ops.iter().enumerate() {
            let applied = panic::catch_unwind(AssertUnwindSafe(|| {
                apply(&mut ledger, &mut slots, *op, options.mode)
            }));
            let (status, message) = match applied {
                Ok(Applied::Ok) => (StepStatus::Ok, None),
                Ok(Applied::Skipped(reason)) => (StepStatus::Skipped, Some(reason.to_string())),
                Ok(Applied::Err(err)) => {
                    if let Some(finding) = err.finding() {
                        findings.push(*finding);
                    }
                    (StepStatus::Error, Some(err.to_string()))
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    halted = Some(message.clone());
                    (StepStatus::Halted, Some(message))
                }
            };
            steps.push(StepRecord {
                step,
                op: *op,
                status,
                message,
                snapshot: ledger.snapshot(),
            });
            if status == StepStatus::Halted {
                break;
            }
            check_invariants(&ledger, &slots, step, &mut last_total, &mut violations);
        }

        let shutdown = if halted.is_some() {
            ledger.abandon();
            None
        } else {
            Some(ledger.terminate())
        };
        let raw_blocks_outstanding = ledger.raw_allocator().outstanding_blocks();
        if shutdown.is_some() && raw_blocks_outstanding != 0 {
            violations.push(InvariantViolation {
                step: None,
                message: format!("{raw_blocks_outstanding} raw blocks left after terminate"),
            });
        }

        ReplayReport {
            trace: trace.name.clone(),
            options,
            steps,
            findings,
            violations,
            halted,
            shutdown,
            raw_blocks_outstanding,
            events: sink.take(),
        }
    }
}

#[allow(unsafe_code)]
fn apply(
    ledger: &mut HeapLedger<BudgetedAllocator>,
    slots: &mut BTreeMap<u32, Live>,
    op: TraceOp,
    mode: AccountingMode,
) -> Applied {
    match op {
        TraceOp::Alloc { slot, size } => {
            if slots.contains_key(&slot) {
                return Applied::Skipped("slot already holds an allocation");
            }
            match ledger.allocate(size) {
                Ok(ptr) => {
                    slots.insert(slot, Live { ptr, size });
                    Applied::Ok
                }
                Err(err) => Applied::Err(err),
            }
        }
        TraceOp::Free { slot } => {
            let mut cell = slots.get(&slot).map(|live| live.ptr);
            let result = ledger.free(&mut cell);
            if cell.is_none() {
                slots.remove(&slot);
            }
            result.into()
        }
        TraceOp::Realloc { slot, size } => {
            let before = slots.get(&slot).copied();
            let mut cell = before.map(|live| live.ptr);
            let result = ledger.reallocate(&mut cell, size);
            match cell {
                Some(ptr) => {
                    let kept_old = result.is_err() && before.is_some_and(|live| live.ptr == ptr);
                    let size = match before {
                        Some(live) if kept_old => live.size,
                        _ => size,
                    };
                    slots.insert(slot, Live { ptr, size });
                }
                None => {
                    slots.remove(&slot);
                }
            }
            result.into()
        }
        TraceOp::Corrupt { slot } => {
            if !mode.is_tracked() {
                return Applied::Skipped("passthrough blocks carry no guard");
            }
            let Some(live) = slots.get(&slot) else {
                return Applied::Skipped("slot is empty");
            };
            // SAFETY: tracked blocks are allocated with GUARD_SIZE bytes past
            // the payload, so the first guard byte is inside the block.
            unsafe { live.ptr.as_ptr().add(live.size).write(!GUARD_MARKER[0]) };
            Applied::Ok
        }
        TraceOp::Check => match ledger.check_integrity() {
            Ok(_) => Applied::Ok,
            Err(err) => Applied::Err(err),
        },
    }
}

fn check_invariants(
    ledger: &HeapLedger<BudgetedAllocator>,
    slots: &BTreeMap<u32, Live>,
    step: usize,
    last_total: &mut u64,
    violations: &mut Vec<InvariantViolation>,
) {
    let snap = ledger.snapshot();
    let mut violate = |message: String| {
        violations.push(InvariantViolation {
            step: Some(step),
            message,
        });
    };

    if ledger.mode() != Some(AccountingMode::Tracked) {
        if snap != AccountingSnapshot::default() {
            violate(format!("passthrough session moved counters: {snap}"));
        }
        return;
    }

    let live = ledger.live_allocations();
    let live_bytes: usize = live.iter().map(|a| a.byte_count).sum();
    if snap.current_count != live.len() {
        violate(format!(
            "current_count {} but {} live records",
            snap.current_count,
            live.len()
        ));
    }
    if snap.current_bytes != live_bytes {
        violate(format!(
            "current_bytes {} but live records hold {live_bytes}",
            snap.current_bytes
        ));
    }
    if snap.max_resident < snap.current_bytes {
        violate(format!(
            "max_resident {} below current_bytes {}",
            snap.max_resident, snap.current_bytes
        ));
    }
    if snap.total_count < *last_total {
        violate(format!(
            "total_count went backwards: {} -> {}",
            *last_total, snap.total_count
        ));
    }
    *last_total = snap.total_count;
    if live.len() + ledger.isolated_count() != slots.len() {
        violate(format!(
            "{} occupied slots but {} live and {} isolated records",
            slots.len(),
            live.len(),
            ledger.isolated_count()
        ));
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| payload.downcast_ref::<&str>().map(|s| (*s).to_string()))
        .unwrap_or_else(|| "halted".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_trace_passes() {
        let trace = Trace::new(
            "clean",
            vec![
                TraceOp::Alloc { slot: 0, size: 100 },
                TraceOp::Alloc { slot: 1, size: 50 },
                TraceOp::Free { slot: 0 },
                TraceOp::Check,
                TraceOp::Free { slot: 1 },
            ],
        );
        let report = TraceRunner::default().run(&trace);
        assert!(report.passed(), "{:?}", report.violations);
        assert_eq!(report.count_status(StepStatus::Ok), 5);
        let shutdown = report.shutdown.expect("terminated");
        assert!(!shutdown.leaked());
        assert_eq!(shutdown.snapshot.max_resident, 150);
    }

    #[test]
    fn corruption_is_isolated_by_default() {
        let trace = Trace::new(
            "corrupt",
            vec![
                TraceOp::Alloc { slot: 0, size: 32 },
                TraceOp::Corrupt { slot: 0 },
                TraceOp::Check,
                TraceOp::Free { slot: 0 },
            ],
        );
        let report = TraceRunner::default().run(&trace);
        assert!(report.passed(), "{:?}", report.violations);
        assert!(report.halted.is_none());
        assert_eq!(report.steps[2].status, StepStatus::Error);
        assert_eq!(report.findings[0].allocation_number, Some(1));
        assert_eq!(report.raw_blocks_outstanding, 0);
    }

    #[test]
    fn halt_policy_ends_replay() {
        let mut trace = Trace::new(
            "halt",
            vec![
                TraceOp::Alloc { slot: 0, size: 32 },
                TraceOp::Corrupt { slot: 0 },
                TraceOp::Check,
                TraceOp::Free { slot: 0 },
            ],
        );
        trace.policy = Some("halt".to_string());
        let report = TraceRunner::default().run(&trace);
        assert_eq!(report.options.policy, CorruptionPolicy::Halt);
        assert!(report.halted.as_deref().is_some_and(|m| m.contains("integrity corruption")));
        assert_eq!(report.steps.len(), 3);
        assert_eq!(report.steps[2].status, StepStatus::Halted);
        assert!(report.shutdown.is_none());
        assert_eq!(report.raw_blocks_outstanding, 0);
    }

    #[test]
    fn halt_on_free_without_mutation_checks_leaves_nothing_behind() {
        let trace = Trace::new(
            "halt_on_free",
            vec![
                TraceOp::Alloc { slot: 0, size: 16 },
                TraceOp::Corrupt { slot: 0 },
                TraceOp::Free { slot: 0 },
            ],
        )
        .with_policy(CorruptionPolicy::Halt)
        .with_mutation_checks(false);
        let report = TraceRunner::default().run(&trace);
        assert!(!report.options.check_on_mutation);
        assert_eq!(report.steps[2].status, StepStatus::Halted);
        assert_eq!(report.steps[2].snapshot.current_count, 1);
        assert!(report.passed(), "{:?}", report.violations);
        assert_eq!(report.raw_blocks_outstanding, 0);
    }

    #[test]
    fn passthrough_skips_corruption() {
        let mut trace = Trace::new(
            "pass",
            vec![
                TraceOp::Alloc { slot: 0, size: 16 },
                TraceOp::Corrupt { slot: 0 },
                TraceOp::Realloc { slot: 0, size: 64 },
                TraceOp::Free { slot: 0 },
            ],
        );
        trace.mode = Some("passthrough".to_string());
        let report = TraceRunner::default().run(&trace);
        assert!(report.passed(), "{:?}", report.violations);
        assert_eq!(report.steps[1].status, StepStatus::Skipped);
        assert_eq!(
            report.shutdown.and_then(|s| s.mode),
            Some(AccountingMode::Passthrough)
        );
    }

    #[test]
    fn budget_exhaustion_is_a_step_error() {
        let trace = Trace::new(
            "oom",
            vec![
                TraceOp::Alloc { slot: 0, size: 64 },
                TraceOp::Alloc { slot: 1, size: 64 },
            ],
        )
        .with_budget(100);
        let report = TraceRunner::default().run(&trace);
        assert!(report.passed());
        assert_eq!(report.steps[1].status, StepStatus::Error);
        assert!(
            report.steps[1]
                .message
                .as_deref()
                .is_some_and(|m| m.contains("out of memory"))
        );
        assert_eq!(report.shutdown.and_then(|s| s.leak).map(|l| l.outstanding_bytes), Some(64));
    }

    #[test]
    fn double_free_halts_when_tracked() {
        let trace = Trace::new(
            "double",
            vec![
                TraceOp::Alloc { slot: 0, size: 8 },
                TraceOp::Free { slot: 0 },
                TraceOp::Free { slot: 0 },
            ],
        );
        let report = TraceRunner::default().run(&trace);
        assert_eq!(report.steps[2].status, StepStatus::Halted);
        assert!(report.halted.as_deref().is_some_and(|m| m.contains("empty pointer slot")));
    }
}
