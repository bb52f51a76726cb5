//! Built-in scenarios: named traces with expected outcomes.

use serde::Serialize;

use heapledger_core::CorruptionPolicy;

use crate::error::HarnessError;
use crate::runner::{ReplayOptions, ReplayReport, StepStatus, TraceRunner};
use crate::trace::{Trace, TraceOp};

/// What a scenario must observe to pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Expectation {
    /// Outstanding allocations reported at shutdown.
    pub leak_count: usize,
    /// Outstanding bytes reported at shutdown.
    pub leak_bytes: usize,
    /// Whether integrity findings are expected.
    pub findings: bool,
    /// Required resident high-water mark, if checked.
    pub max_resident: Option<usize>,
    /// Whether the replay must end in an integrity halt.
    pub halts: bool,
}

/// A named trace plus its expectation.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: &'static str,
    pub description: &'static str,
    pub trace: Trace,
    pub expect: Expectation,
}

/// Outcome of running one scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    pub name: String,
    pub passed: bool,
    pub failures: Vec<String>,
    pub report: ReplayReport,
}

fn alloc(slot: u32, size: usize) -> TraceOp {
    TraceOp::Alloc { slot, size }
}

fn free(slot: u32) -> TraceOp {
    TraceOp::Free { slot }
}

fn scenario(
    name: &'static str,
    description: &'static str,
    ops: Vec<TraceOp>,
    expect: Expectation,
) -> Scenario {
    Scenario {
        name,
        description,
        trace: Trace::new(name, ops).with_description(description),
        expect,
    }
}

/// Every built-in scenario, in a stable order.
#[must_use]
pub fn all() -> Vec<Scenario> {
    vec![
        scenario(
            "accounting_walkthrough",
            "allocate 100 and 50, free both; counters return to zero, high-water 150",
            vec![alloc(0, 100), alloc(1, 50), free(0), free(1)],
            Expectation {
                max_resident: Some(150),
                ..Expectation::default()
            },
        ),
        scenario(
            "leak_at_shutdown",
            "allocate 64 and 128 and never free; terminate reports 2 allocations, 192 bytes",
            vec![alloc(0, 64), alloc(1, 128)],
            Expectation {
                leak_count: 2,
                leak_bytes: 192,
                ..Expectation::default()
            },
        ),
        scenario(
            "lifo_and_non_lifo_free",
            "free the newest record, then the oldest, then the middle one",
            vec![
                alloc(0, 16),
                alloc(1, 32),
                alloc(2, 48),
                free(2),
                TraceOp::Check,
                free(0),
                TraceOp::Check,
                free(1),
            ],
            Expectation {
                max_resident: Some(96),
                ..Expectation::default()
            },
        ),
        scenario(
            "guard_overrun_on_check",
            "overwrite the guard after a payload; the next integrity check reports it",
            vec![
                alloc(0, 40),
                alloc(1, 8),
                TraceOp::Corrupt { slot: 0 },
                TraceOp::Check,
                free(0),
                free(1),
            ],
            Expectation {
                findings: true,
                ..Expectation::default()
            },
        ),
        scenario(
            "guard_overrun_on_free",
            "overwrite the guard after a payload; freeing that record reports it",
            vec![alloc(0, 24), TraceOp::Corrupt { slot: 0 }, free(0)],
            Expectation {
                findings: true,
                ..Expectation::default()
            },
        ),
        {
            let mut halting = scenario(
                "guard_overrun_on_free_halts",
                "halt policy, no mutation checks: freeing an overrun block halts and \
                 abandon still reclaims every block",
                vec![
                    alloc(0, 24),
                    alloc(1, 8),
                    TraceOp::Corrupt { slot: 0 },
                    free(0),
                    free(1),
                ],
                Expectation {
                    halts: true,
                    ..Expectation::default()
                },
            );
            halting.trace = halting
                .trace
                .with_policy(CorruptionPolicy::Halt)
                .with_mutation_checks(false);
            halting
        },
        scenario(
            "realloc_round_trip",
            "grow then shrink one allocation and free it",
            vec![
                alloc(0, 10),
                TraceOp::Realloc { slot: 0, size: 1000 },
                TraceOp::Realloc { slot: 0, size: 5 },
                free(0),
            ],
            Expectation {
                max_resident: Some(1010),
                ..Expectation::default()
            },
        ),
        scenario(
            "invariant_pressure",
            "deterministic xorshift mix of allocate/free/realloc/check over 64 slots",
            pressure_ops(0x5EED, 2_000, 64),
            Expectation::default(),
        ),
    ]
}

/// Look up a built-in scenario by name.
pub fn find(name: &str) -> Result<Scenario, HarnessError> {
    all()
        .into_iter()
        .find(|s| s.name == name)
        .ok_or_else(|| HarnessError::UnknownScenario(name.to_string()))
}

/// Replay a scenario with the default options and judge the result.
#[must_use]
pub fn run(scenario: &Scenario) -> ScenarioResult {
    let report = TraceRunner::new(ReplayOptions::default()).run(&scenario.trace);
    let failures = judge(&scenario.expect, &report);
    ScenarioResult {
        name: scenario.name.to_string(),
        passed: failures.is_empty(),
        failures,
        report,
    }
}

fn judge(expect: &Expectation, report: &ReplayReport) -> Vec<String> {
    let mut failures: Vec<String> = report
        .violations
        .iter()
        .map(|v| match v.step {
            Some(step) => format!("step {step}: {}", v.message),
            None => v.message.clone(),
        })
        .collect();

    match (&report.halted, expect.halts) {
        (Some(message), false) => failures.push(format!("replay halted: {message}")),
        (Some(message), true) if !message.contains("integrity corruption") => {
            failures.push(format!("halted for the wrong reason: {message}"));
        }
        (None, true) => failures.push("expected an integrity halt".to_string()),
        _ => {}
    }
    if report.raw_blocks_outstanding != 0 {
        failures.push(format!(
            "{} raw blocks outstanding after shutdown",
            report.raw_blocks_outstanding
        ));
    }

    let Some(shutdown) = &report.shutdown else {
        return failures;
    };
    let (count, bytes) = shutdown
        .leak
        .as_ref()
        .map_or((0, 0), |l| (l.outstanding_count, l.outstanding_bytes));
    if (count, bytes) != (expect.leak_count, expect.leak_bytes) {
        failures.push(format!(
            "leak report {count} allocations/{bytes}B, expected {}/{}B",
            expect.leak_count, expect.leak_bytes
        ));
    }
    if report.findings.is_empty() == expect.findings {
        failures.push(format!(
            "expected findings: {}, got {}",
            expect.findings,
            report.findings.len()
        ));
    }
    if let Some(max) = expect.max_resident
        && shutdown.snapshot.max_resident != max
    {
        failures.push(format!(
            "max_resident {}, expected {max}",
            shutdown.snapshot.max_resident
        ));
    }
    if !expect.findings && report.count_status(StepStatus::Error) != 0 {
        failures.push(format!(
            "{} steps failed",
            report.count_status(StepStatus::Error)
        ));
    }
    failures
}

// ---------------------------------------------------------------------------
// Generated traces
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound
    }
}

/// Build a well-formed random trace: frees and reallocs only touch occupied
/// slots, allocs only empty ones, and every slot is freed at the end.
#[must_use]
pub fn pressure_ops(seed: u64, steps: usize, slots: u32) -> Vec<TraceOp> {
    let mut rng = XorShift64 { state: seed.max(1) };
    let mut occupied = vec![false; slots as usize];
    let mut ops = Vec::with_capacity(steps + slots as usize);

    for _ in 0..steps {
        let slot = rng.below(u64::from(slots)) as u32;
        let size = 1 + rng.below(4096) as usize;
        let op = match (rng.below(100), occupied[slot as usize]) {
            (0..=4, _) => TraceOp::Check,
            (5..=19, true) => TraceOp::Realloc { slot, size },
            (20..=59, true) => TraceOp::Free { slot },
            (_, false) => TraceOp::Alloc { slot, size },
            (_, true) => continue,
        };
        match op {
            TraceOp::Alloc { .. } => occupied[slot as usize] = true,
            TraceOp::Free { .. } => occupied[slot as usize] = false,
            _ => {}
        }
        ops.push(op);
    }
    for (slot, _) in occupied.iter().enumerate().filter(|(_, live)| **live) {
        ops.push(TraceOp::Free { slot: slot as u32 });
    }
    ops
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique() {
        let mut names: Vec<&str> = all().iter().map(|s| s.name).collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
    }

    #[test]
    fn unknown_scenario_is_an_error() {
        assert!(matches!(
            find("nope"),
            Err(HarnessError::UnknownScenario(name)) if name == "nope"
        ));
    }

    #[test]
    fn pressure_trace_is_deterministic_and_balanced() {
        let a = pressure_ops(7, 500, 16);
        assert_eq!(a, pressure_ops(7, 500, 16));
        let allocs = a
            .iter()
            .filter(|op| matches!(op, TraceOp::Alloc { .. }))
            .count();
        let frees = a
            .iter()
            .filter(|op| matches!(op, TraceOp::Free { .. }))
            .count();
        assert_eq!(allocs, frees);
    }

    #[test]
    fn every_builtin_scenario_passes() {
        for s in all() {
            let result = run(&s);
            assert!(result.passed, "{}: {:?}", s.name, result.failures);
        }
    }

    #[test]
    fn halting_free_scenario_reclaims_every_block() {
        let s = find("guard_overrun_on_free_halts").unwrap();
        assert_eq!(s.trace.policy.as_deref(), Some("halt"));
        let result = run(&s);
        assert!(result.passed, "{:?}", result.failures);
        assert_eq!(result.report.options.policy, CorruptionPolicy::Halt);
        assert!(!result.report.options.check_on_mutation);
        assert_eq!(result.report.steps.len(), 4);
        assert_eq!(result.report.steps[3].status, StepStatus::Halted);
        assert_eq!(result.report.raw_blocks_outstanding, 0);
    }

    #[test]
    fn judge_catches_wrong_leak_expectation() {
        let mut s = find("leak_at_shutdown").unwrap();
        s.expect.leak_bytes = 1;
        let result = run(&s);
        assert!(!result.passed);
        assert!(result.failures[0].contains("192B"), "{:?}", result.failures);
    }
}
