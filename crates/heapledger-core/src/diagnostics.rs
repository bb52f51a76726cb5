//! Structured ledger events, diagnostic sinks and reports.
//!
//! Every notable transition (allocation, free, exhaustion, corruption, leak,
//! forced release) becomes one [`LedgerEvent`] carrying an accounting
//! snapshot. Events go to a [`DiagnosticSink`] chosen by the embedder.

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::accounting::AccountingSnapshot;
use crate::config::AccountingMode;
use crate::error::CorruptionFinding;
use crate::table::AllocationRecord;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

/// One structured ledger event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEvent {
    /// Monotonic per-ledger sequence number.
    pub seq: u64,
    /// Correlation id (`ledger::<symbol>::<seq>`).
    pub trace_id: String,
    pub level: LedgerLevel,
    /// Entry point (`allocate`, `free`, `check_integrity`, ...).
    pub symbol: &'static str,
    /// Event kind (`alloc`, `free`, `out_of_memory`, `leak_at_shutdown`, ...).
    pub event: &'static str,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub details: String,
    /// Counters at the time of the event.
    pub snapshot: AccountingSnapshot,
}

impl LedgerEvent {
    /// Start an event. Sequence, trace id and snapshot are filled in by the
    /// ledger when it is emitted.
    #[must_use]
    pub fn new(
        level: LedgerLevel,
        symbol: &'static str,
        event: &'static str,
        outcome: &'static str,
    ) -> Self {
        Self {
            seq: 0,
            trace_id: String::new(),
            level,
            symbol,
            event,
            outcome,
            allocation_number: None,
            index: None,
            addr: None,
            size: None,
            details: String::new(),
            snapshot: AccountingSnapshot::default(),
        }
    }

    /// Attach number, address and size of a record.
    #[must_use]
    pub fn with_record(mut self, record: &AllocationRecord) -> Self {
        self.allocation_number = Some(record.allocation_number);
        self.addr = Some(record.addr);
        self.size = Some(record.byte_count);
        self
    }

    /// Attach the fields of an integrity finding.
    #[must_use]
    pub fn with_finding(mut self, finding: &CorruptionFinding) -> Self {
        self.allocation_number = finding.allocation_number;
        self.index = finding.index;
        self.details = finding.kind.to_string();
        self
    }

    #[must_use]
    pub fn with_addr(mut self, addr: usize) -> Self {
        self.addr = Some(addr);
        self
    }

    #[must_use]
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    /// Serialize to a single JSON line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Receiver of ledger events.
pub trait DiagnosticSink {
    /// Whether events at `level` are wanted. Lets the ledger skip building
    /// events nobody reads.
    fn enabled(&self, level: LedgerLevel) -> bool {
        let _ = level;
        true
    }

    fn record(&mut self, event: &LedgerEvent);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn enabled(&self, _level: LedgerLevel) -> bool {
        false
    }

    fn record(&mut self, _event: &LedgerEvent) {}
}

/// Writes each event as one JSON line to stderr.
#[derive(Debug, Clone, Copy)]
pub struct StderrSink {
    min_level: LedgerLevel,
}

impl StderrSink {
    #[must_use]
    pub const fn new(min_level: LedgerLevel) -> Self {
        Self { min_level }
    }
}

impl Default for StderrSink {
    fn default() -> Self {
        Self::new(LedgerLevel::Warn)
    }
}

impl DiagnosticSink for StderrSink {
    fn enabled(&self, level: LedgerLevel) -> bool {
        level >= self.min_level
    }

    fn record(&mut self, event: &LedgerEvent) {
        if let Ok(line) = event.to_jsonl() {
            let _ = writeln!(std::io::stderr().lock(), "{line}");
        }
    }
}

/// Keeps every event in memory behind a shared handle.
///
/// Clone the sink before handing it to a ledger; the clone sees the same
/// event buffer.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<LedgerEvent>>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<LedgerEvent> {
        self.events.lock().clone()
    }

    /// Remove and return all recorded events.
    pub fn take(&self) -> Vec<LedgerEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Recorded events with the given `event` kind.
    #[must_use]
    pub fn of_kind(&self, event: &str) -> Vec<LedgerEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event == event)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl DiagnosticSink for RecordingSink {
    fn record(&mut self, event: &LedgerEvent) {
        self.events.lock().push(event.clone());
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// A live allocation as seen from outside the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LiveAllocation {
    pub allocation_number: u64,
    pub addr: usize,
    pub byte_count: usize,
}

impl From<&AllocationRecord> for LiveAllocation {
    fn from(record: &AllocationRecord) -> Self {
        Self {
            allocation_number: record.allocation_number,
            addr: record.addr,
            byte_count: record.byte_count,
        }
    }
}

/// Result of one integrity walk.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    /// Chain records visited.
    pub records_checked: usize,
    /// Side-array entries present.
    pub side_entries: usize,
    pub findings: Vec<CorruptionFinding>,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Allocations still live at terminate.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct LeakReport {
    pub outstanding_count: usize,
    pub outstanding_bytes: usize,
    /// Newest first.
    pub allocations: Vec<LiveAllocation>,
}

/// What terminate found and did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Mode that was active, `None` if the ledger was not initialized.
    pub mode: Option<AccountingMode>,
    /// Counters at the moment terminate started.
    pub snapshot: AccountingSnapshot,
    /// Present when allocations were still live.
    pub leak: Option<LeakReport>,
    /// Final integrity walk (run only when allocations were still live).
    pub integrity: Option<IntegrityReport>,
    /// Live blocks released on the caller's behalf.
    pub forced_releases: usize,
    /// Isolated blocks released.
    pub isolated_releases: usize,
}

impl ShutdownReport {
    #[must_use]
    pub fn uninitialized() -> Self {
        Self {
            mode: None,
            snapshot: AccountingSnapshot::default(),
            leak: None,
            integrity: None,
            forced_releases: 0,
            isolated_releases: 0,
        }
    }

    #[must_use]
    pub fn leaked(&self) -> bool {
        self.leak.is_some()
    }
}
