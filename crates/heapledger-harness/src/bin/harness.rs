//! CLI entrypoint for the heapledger harness.

use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Parser, Subcommand};
use heapledger_core::{AccountingMode, CorruptionPolicy};
use heapledger_harness::scenarios::{self, ScenarioResult};
use heapledger_harness::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome, sha256_hex};
use heapledger_harness::{ReplayOptions, ReplayReport, Trace, TraceRunner};

/// Trace replay and scenario runner for heapledger.
#[derive(Debug, Parser)]
#[command(name = "heapledger-harness")]
#[command(about = "Replay allocation traces against an instrumented ledger")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay a JSON allocation trace.
    Replay {
        /// Trace file.
        #[arg(long)]
        trace: PathBuf,
        /// Accounting mode (`tracked` or `passthrough`). Overrides the trace.
        #[arg(long)]
        mode: Option<String>,
        /// Corruption policy (`isolate` or `halt`). Overrides the trace.
        #[arg(long)]
        policy: Option<String>,
        /// Skip integrity walks around each allocate/free.
        #[arg(long)]
        no_mutation_checks: bool,
        /// Report JSON path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
        /// Structured JSONL log path (if omitted, logs go to stderr).
        #[arg(long)]
        log: Option<PathBuf>,
        /// Forward every ledger event into the log.
        #[arg(long)]
        ledger_events: bool,
    },
    /// Run one built-in scenario, or all of them.
    Scenario {
        /// Scenario name (see `list-scenarios`).
        #[arg(required_unless_present = "all")]
        name: Option<String>,
        /// Run every built-in scenario.
        #[arg(long)]
        all: bool,
        /// Results JSON path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
        /// Structured JSONL log path (if omitted, logs go to stderr).
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// List built-in scenarios.
    ListScenarios,
    /// Validate a structured JSONL log file.
    ValidateLog {
        /// Log file to check.
        #[arg(long)]
        log: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Replay {
            trace,
            mode,
            policy,
            no_mutation_checks,
            output,
            log,
            ledger_events,
        } => {
            let loaded = Trace::from_file(&trace)?;
            let mut emitter = open_log(log.as_deref(), &loaded.name)?;

            // Command-line flags win over the trace's own settings.
            let mut options = ReplayOptions::default().for_trace(&loaded);
            if no_mutation_checks {
                options.check_on_mutation = false;
            }
            if let Some(mode) = mode {
                options.mode = AccountingMode::from_str_loose(&mode);
            }
            if let Some(policy) = policy {
                options.policy = CorruptionPolicy::from_str_loose(&policy);
            }

            let started = Instant::now();
            let report = TraceRunner::new(options).run(&loaded);
            let elapsed = started.elapsed().as_millis() as u64;

            if ledger_events {
                for event in &report.events {
                    emitter.emit_entry(
                        LogEntry::from_ledger_event(event).with_scenario(&loaded.name),
                    )?;
                }
            }

            let json = serde_json::to_string_pretty(&report)?;
            let artifact = write_output(output.as_deref(), &json)?;
            emitter.emit_entry(
                result_entry("replay_result", &report, report.passed(), elapsed)
                    .with_artifacts(artifact.into_iter().collect()),
            )?;
            emitter.flush()?;

            eprintln!(
                "Replay {}: steps={}, findings={}, violations={}, halted={}",
                report.trace,
                report.steps.len(),
                report.findings.len(),
                report.violations.len(),
                report.halted.is_some()
            );
            if !report.passed() {
                return Err(format!(
                    "replay of '{}' broke {} invariants",
                    report.trace,
                    report.violations.len()
                )
                .into());
            }
        }
        Command::Scenario {
            name,
            all,
            output,
            log,
        } => {
            let selected = match name {
                Some(name) if !all => vec![scenarios::find(&name)?],
                _ => scenarios::all(),
            };
            let mut emitter = open_log(log.as_deref(), "scenarios")?;

            let mut results: Vec<ScenarioResult> = Vec::with_capacity(selected.len());
            for scenario in &selected {
                let started = Instant::now();
                let result = scenarios::run(scenario);
                let elapsed = started.elapsed().as_millis() as u64;
                let mut entry =
                    result_entry("scenario_result", &result.report, result.passed, elapsed);
                if let Some(details) = entry.details.as_mut().and_then(|d| d.as_object_mut()) {
                    details.insert("failures".to_string(), serde_json::json!(result.failures));
                }
                emitter.emit_entry(entry)?;
                eprintln!(
                    "[{}] {}",
                    if result.passed { "PASS" } else { "FAIL" },
                    scenario.name
                );
                results.push(result);
            }

            let json = serde_json::to_string_pretty(&results)?;
            let artifact = write_output(output.as_deref(), &json)?;
            if let Some(artifact) = artifact {
                let mut entry = LogEntry::new("", LogLevel::Info, "results_written");
                entry.artifact_refs = Some(vec![artifact]);
                emitter.emit_entry(entry)?;
            }
            emitter.flush()?;

            let failed = results.iter().filter(|r| !r.passed).count();
            eprintln!(
                "Scenarios complete: total={}, passed={}, failed={failed}",
                results.len(),
                results.len() - failed
            );
            if failed > 0 {
                return Err(format!("{failed} scenarios failed").into());
            }
        }
        Command::ListScenarios => {
            for scenario in scenarios::all() {
                println!("{:<26} {}", scenario.name, scenario.description);
            }
        }
        Command::ValidateLog { log } => {
            let (lines, errors) =
                heapledger_harness::structured_log::validate_log_file(&log)?;
            for error in &errors {
                eprintln!("{error}");
            }
            eprintln!("Validated {lines} lines, {} errors", errors.len());
            if !errors.is_empty() {
                return Err(format!("{} invalid log fields", errors.len()).into());
            }
        }
    }

    Ok(())
}

fn open_log(path: Option<&Path>, run_id: &str) -> std::io::Result<LogEmitter> {
    match path {
        Some(path) => LogEmitter::to_file(path, run_id),
        None => Ok(LogEmitter::to_stderr(run_id)),
    }
}

/// Write `json` to `path` or stdout. Returns `path@sha256` for file output.
fn write_output(path: Option<&Path>, json: &str) -> std::io::Result<Option<String>> {
    match path {
        Some(path) => {
            std::fs::write(path, json)?;
            Ok(Some(format!(
                "{}@sha256:{}",
                path.display(),
                sha256_hex(json.as_bytes())
            )))
        }
        None => {
            println!("{json}");
            Ok(None)
        }
    }
}

fn result_entry(event: &str, report: &ReplayReport, passed: bool, elapsed_ms: u64) -> LogEntry {
    let (level, outcome) = if passed {
        (LogLevel::Info, Outcome::Pass)
    } else {
        (LogLevel::Error, Outcome::Fail)
    };
    let leak = report.shutdown.as_ref().and_then(|s| s.leak.as_ref());
    LogEntry::new("", level, event)
        .with_scenario(&report.trace)
        .with_mode(report.options.mode.as_str(), report.options.policy.as_str())
        .with_outcome(outcome)
        .with_duration_ms(elapsed_ms)
        .with_details(serde_json::json!({
            "steps": report.steps.len(),
            "findings": report.findings.len(),
            "violations": report.violations,
            "halted": report.halted,
            "leak_count": leak.map_or(0, |l| l.outstanding_count),
            "leak_bytes": leak.map_or(0, |l| l.outstanding_bytes),
        }))
}
