//! The allocator context: init, allocate, free, integrity check, terminate.
//!
//! A [`HeapLedger`] owns the raw allocator, the allocation table, the
//! counters and the diagnostic sink. `init` selects the strategy for the
//! session:
//!
//! - **tracked**: every payload gets a trailing guard marker, a record at the
//!   head of the table, a side-array entry and counter updates. Integrity
//!   walks run around each mutation when configured, and terminate reports
//!   and reclaims leaks.
//! - **passthrough**: zero-filled allocate and plain release. No table, no
//!   guard, no counters, no leak detection.
//!
//! Precondition violations (use before init, empty or unknown pointer slot,
//! zero-byte request) halt through the configured [`FatalAction`] whenever
//! the mode is tracked. Integrity findings follow the configured
//! [`CorruptionPolicy`] at every call site.

#![allow(unsafe_code)]

use std::ptr::NonNull;

use crate::accounting::{Accounting, AccountingSnapshot};
use crate::config::{AccountingMode, CorruptionPolicy, LedgerConfig};
use crate::diagnostics::{
    DiagnosticSink, IntegrityReport, LeakReport, LedgerEvent, LedgerLevel, LiveAllocation,
    ShutdownReport, StderrSink,
};
use crate::error::{CorruptionFinding, CorruptionKind, FatalAction, LedgerError};
use crate::guard::{self, GuardCheck};
use crate::raw::{RawAllocator, SystemAllocator};
use crate::table::{AllocationRecord, AllocationTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uninitialized,
    Tracked,
    Passthrough,
}

/// A record pulled out of live bookkeeping after an integrity finding.
///
/// Its block stays allocated until the owner frees it or terminate runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsolatedRecord {
    pub record: AllocationRecord,
    pub finding: CorruptionFinding,
}

/// Instrumented allocator context.
pub struct HeapLedger<A: RawAllocator = SystemAllocator> {
    raw: A,
    sink: Box<dyn DiagnosticSink + Send>,
    config: LedgerConfig,
    phase: Phase,
    table: AllocationTable,
    accounting: Accounting,
    isolated: Vec<IsolatedRecord>,
    next_seq: u64,
}

impl HeapLedger<SystemAllocator> {
    /// Ledger over the system heap reporting warnings and errors to stderr.
    #[must_use]
    pub fn system() -> Self {
        Self::new(SystemAllocator, StderrSink::default())
    }
}

impl Default for HeapLedger<SystemAllocator> {
    fn default() -> Self {
        Self::system()
    }
}

impl<A: RawAllocator> HeapLedger<A> {
    /// Create an uninitialized ledger.
    ///
    /// Until the first `init`, the default configuration applies: misuse is
    /// treated as tracked-mode misuse and aborts the process.
    pub fn new(raw: A, sink: impl DiagnosticSink + Send + 'static) -> Self {
        Self {
            raw,
            sink: Box::new(sink),
            config: LedgerConfig::default(),
            phase: Phase::Uninitialized,
            table: AllocationTable::new(),
            accounting: Accounting::new(),
            isolated: Vec::new(),
            next_seq: 0,
        }
    }

    /// Set how fatal conditions halt before the first `init`.
    #[must_use]
    pub fn with_fatal_action(mut self, fatal: FatalAction) -> Self {
        self.config.fatal = fatal;
        self
    }

    /// Replace the diagnostic sink.
    pub fn set_sink(&mut self, sink: impl DiagnosticSink + Send + 'static) {
        self.sink = Box::new(sink);
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start a session. Returns `false` if one is already running.
    pub fn init(&mut self, config: LedgerConfig) -> bool {
        if self.phase != Phase::Uninitialized {
            self.emit(
                LedgerEvent::new(LedgerLevel::Warn, "init", "init", "already_initialized")
                    .with_details(format!("active mode {}", self.config.mode.as_str())),
            );
            return false;
        }

        self.config = config;
        self.table = AllocationTable::new();
        self.accounting.reset();
        self.isolated.clear();
        self.phase = match config.mode {
            AccountingMode::Tracked => Phase::Tracked,
            AccountingMode::Passthrough => Phase::Passthrough,
        };
        self.emit(
            LedgerEvent::new(LedgerLevel::Info, "init", "init", "ok")
                .with_details(format!("mode={}", config.mode.as_str())),
        );
        true
    }

    /// End the session.
    ///
    /// In tracked mode, live allocations are reported as a leak, one final
    /// integrity walk runs, and every remaining block (live or isolated) is
    /// released. The ledger is uninitialized afterwards in every mode.
    pub fn terminate(&mut self) -> ShutdownReport {
        match self.phase {
            Phase::Uninitialized => {
                self.emit(LedgerEvent::new(
                    LedgerLevel::Debug,
                    "terminate",
                    "terminate",
                    "not_initialized",
                ));
                ShutdownReport::uninitialized()
            }
            Phase::Passthrough => {
                self.phase = Phase::Uninitialized;
                self.emit(LedgerEvent::new(
                    LedgerLevel::Info,
                    "terminate",
                    "terminate",
                    "ok",
                ));
                ShutdownReport {
                    mode: Some(AccountingMode::Passthrough),
                    ..ShutdownReport::uninitialized()
                }
            }
            Phase::Tracked => self.tracked_terminate(),
        }
    }

    fn tracked_terminate(&mut self) -> ShutdownReport {
        let snapshot = self.accounting.snapshot();
        let mut leak = None;
        let mut integrity = None;

        if snapshot.current_bytes != 0 || snapshot.current_count != 0 || !self.table.is_empty() {
            let allocations: Vec<LiveAllocation> =
                self.table.iter().map(LiveAllocation::from).collect();
            self.emit(
                LedgerEvent::new(LedgerLevel::Warn, "terminate", "leak_at_shutdown", "leaked")
                    .with_size(snapshot.current_bytes)
                    .with_details(format!(
                        "{} allocations, {} bytes outstanding",
                        snapshot.current_count, snapshot.current_bytes
                    )),
            );
            leak = Some(LeakReport {
                outstanding_count: snapshot.current_count,
                outstanding_bytes: snapshot.current_bytes,
                allocations,
            });

            let report = self.audit();
            self.apply_findings("terminate", &report);
            integrity = Some(report);
        }

        let records = self.table.drain();
        for record in &records {
            self.emit(
                LedgerEvent::new(LedgerLevel::Debug, "terminate", "forced_release", "released")
                    .with_record(record),
            );
            self.release_addr(record.addr);
        }
        let isolated = std::mem::take(&mut self.isolated);
        for entry in &isolated {
            self.release_addr(entry.record.addr);
        }

        self.accounting.reset();
        self.phase = Phase::Uninitialized;
        self.emit(LedgerEvent::new(
            LedgerLevel::Info,
            "terminate",
            "terminate",
            "ok",
        ));

        ShutdownReport {
            mode: Some(AccountingMode::Tracked),
            snapshot,
            leak,
            integrity,
            forced_releases: records.len(),
            isolated_releases: isolated.len(),
        }
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Allocate `byte_count` zero-filled bytes.
    pub fn allocate(&mut self, byte_count: usize) -> Result<NonNull<u8>, LedgerError> {
        match self.phase {
            Phase::Uninitialized => {
                Err(self.precondition("allocate", LedgerError::UninitializedState))
            }
            Phase::Passthrough => self.passthrough_allocate(byte_count),
            Phase::Tracked => self.tracked_allocate(byte_count),
        }
    }

    /// Allocate `count * elem_size` zero-filled bytes, failing on overflow.
    pub fn allocate_array(
        &mut self,
        count: usize,
        elem_size: usize,
    ) -> Result<NonNull<u8>, LedgerError> {
        let Some(total) = count.checked_mul(elem_size) else {
            return Err(self.out_of_memory(
                "allocate_array",
                count.saturating_mul(elem_size),
                format!("{count} x {elem_size} overflows"),
            ));
        };
        self.allocate(total)
    }

    fn passthrough_allocate(&mut self, byte_count: usize) -> Result<NonNull<u8>, LedgerError> {
        if byte_count == 0 {
            return Err(self.precondition("allocate", LedgerError::ZeroSizeRequest));
        }
        let Some(ptr) = self.raw.allocate(byte_count) else {
            return Err(self.out_of_memory("allocate", byte_count, "raw allocator refused"));
        };
        // SAFETY: ptr is valid for byte_count bytes.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, byte_count) };
        Ok(ptr)
    }

    fn tracked_allocate(&mut self, byte_count: usize) -> Result<NonNull<u8>, LedgerError> {
        if byte_count == 0 {
            return Err(self.precondition("allocate", LedgerError::ZeroSizeRequest));
        }
        self.mutation_check("allocate");

        let Some(block) = guard::block_size(byte_count) else {
            return Err(self.out_of_memory("allocate", byte_count, "size overflows with guard"));
        };
        let Some(ptr) = self.raw.allocate(block) else {
            return Err(self.out_of_memory("allocate", byte_count, "raw allocator refused"));
        };
        let addr = ptr.as_ptr() as usize;
        // SAFETY: the raw block is valid for byte_count + GUARD_SIZE bytes.
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0, byte_count);
            guard::write_guard(addr, byte_count);
        }

        let Some(allocation_number) = self.accounting.commit_allocate(byte_count) else {
            // SAFETY: ptr came from self.raw and was never handed out.
            unsafe { self.raw.release(ptr) };
            return Err(self.out_of_memory("allocate", byte_count, "counter overflow"));
        };
        let record = AllocationRecord {
            addr,
            byte_count,
            allocation_number,
        };
        self.table.insert(record);
        self.emit(
            LedgerEvent::new(LedgerLevel::Trace, "allocate", "alloc", "success")
                .with_record(&record),
        );

        self.mutation_check("allocate");
        Ok(ptr)
    }

    /// Resize the allocation in `slot`.
    ///
    /// An empty slot behaves like `allocate`. In tracked mode the contents
    /// move to a fresh record (new allocation number, zero-filled growth)
    /// and the old record is freed. On exhaustion the slot keeps the old
    /// allocation.
    pub fn reallocate(
        &mut self,
        slot: &mut Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<(), LedgerError> {
        if self.phase == Phase::Uninitialized {
            return Err(self.precondition("reallocate", LedgerError::UninitializedState));
        }
        let Some(ptr) = *slot else {
            *slot = Some(self.allocate(new_size)?);
            return Ok(());
        };
        if new_size == 0 {
            return Err(self.precondition("reallocate", LedgerError::ZeroSizeRequest));
        }

        if self.phase == Phase::Passthrough {
            // SAFETY: the caller's slot holds a live block from self.raw.
            let Some(fresh) = (unsafe { self.raw.resize(ptr, new_size) }) else {
                return Err(self.out_of_memory("reallocate", new_size, "raw allocator refused"));
            };
            *slot = Some(fresh);
            return Ok(());
        }

        let addr = ptr.as_ptr() as usize;
        let known = self.table.get(addr).copied().or_else(|| {
            self.isolated
                .iter()
                .find(|e| e.record.addr == addr)
                .map(|e| e.record)
        });
        let Some(old) = known else {
            return Err(self.precondition("reallocate", LedgerError::UntrackedPointer { addr }));
        };
        let fresh = self.tracked_allocate(new_size)?;
        // SAFETY: both payloads are live, distinct, and at least
        // min(old, new) bytes long.
        unsafe {
            std::ptr::copy_nonoverlapping(
                ptr.as_ptr(),
                fresh.as_ptr(),
                old.byte_count.min(new_size),
            );
        }
        self.emit(
            LedgerEvent::new(LedgerLevel::Trace, "reallocate", "realloc", "moved")
                .with_record(&old)
                .with_details(format!("{} -> {} bytes", old.byte_count, new_size)),
        );

        let mut old_slot = Some(ptr);
        let freed = self.tracked_free(&mut old_slot);
        *slot = Some(fresh);
        freed
    }

    // -----------------------------------------------------------------------
    // Release
    // -----------------------------------------------------------------------

    /// Free the allocation in `slot` and empty the slot.
    ///
    /// Copies of the pointer held elsewhere are not tracked; freeing one of
    /// them later is a double free and halts in tracked mode.
    pub fn free(&mut self, slot: &mut Option<NonNull<u8>>) -> Result<(), LedgerError> {
        match self.phase {
            Phase::Uninitialized => Err(self.precondition("free", LedgerError::UninitializedState)),
            Phase::Passthrough => {
                let Some(ptr) = slot.take() else {
                    return Err(self.precondition("free", LedgerError::NullSlot));
                };
                // SAFETY: the caller's slot holds a live block from self.raw.
                unsafe { self.raw.release(ptr) };
                Ok(())
            }
            Phase::Tracked => self.tracked_free(slot),
        }
    }

    fn tracked_free(&mut self, slot: &mut Option<NonNull<u8>>) -> Result<(), LedgerError> {
        let Some(ptr) = *slot else {
            return Err(self.precondition("free", LedgerError::NullSlot));
        };
        let addr = ptr.as_ptr() as usize;

        self.mutation_check("free");

        if let Some(pos) = self.isolated.iter().position(|e| e.record.addr == addr) {
            let entry = self.isolated.swap_remove(pos);
            self.emit(
                LedgerEvent::new(LedgerLevel::Warn, "free", "free", "released_isolated")
                    .with_record(&entry.record)
                    .with_details(entry.finding.kind.to_string()),
            );
            self.release_addr(addr);
            *slot = None;
            return Err(LedgerError::IntegrityCorruption(entry.finding));
        }

        if self.table.is_empty() {
            return Err(self.precondition("free", LedgerError::EmptyTable { addr }));
        }
        let Some(record) = self.table.get(addr).copied() else {
            return Err(self.precondition("free", LedgerError::UntrackedPointer { addr }));
        };

        // The guard is checked while the record is still linked, so a halt
        // here leaves the table, counters and block intact for abandon.
        // SAFETY: the record is live; its block holds byte_count + GUARD_SIZE
        // bytes.
        let check = unsafe { guard::check_guard(record.addr, record.byte_count) };
        let mut failure = None;
        if let GuardCheck::Overrun {
            first_bad_offset,
            observed,
        } = check
        {
            let finding = CorruptionFinding {
                allocation_number: Some(record.allocation_number),
                index: self
                    .table
                    .side()
                    .as_slice()
                    .iter()
                    .position(|&n| n == record.allocation_number),
                kind: CorruptionKind::GuardOverrun {
                    first_bad_offset,
                    observed: u64::from_le_bytes(observed),
                },
            };
            self.report_findings("free", &[finding]);
            failure = Some(finding);
        }

        let Some(removal) = self.table.remove(addr) else {
            return Err(self.precondition("free", LedgerError::UntrackedPointer { addr }));
        };

        // Bookkeeping findings are reported once the block is released and
        // the counters agree with the table again.
        let mut deferred = Vec::new();
        if removal.side_index.is_none() {
            deferred.push(CorruptionFinding {
                allocation_number: Some(record.allocation_number),
                index: None,
                kind: CorruptionKind::MissingSideEntry {
                    allocation_number: record.allocation_number,
                },
            });
            self.table.rebuild_side_array();
        }

        if !self.accounting.commit_free(record.byte_count) {
            let recorded = self.accounting.snapshot();
            deferred.push(CorruptionFinding {
                allocation_number: Some(record.allocation_number),
                index: removal.side_index,
                kind: CorruptionKind::AccountingDrift {
                    recorded_count: recorded.current_count,
                    live_count: self.table.len(),
                    recorded_bytes: recorded.current_bytes,
                    live_bytes: self.table.live_bytes(),
                },
            });
            self.accounting
                .resync(self.table.len(), self.table.live_bytes());
        }

        // SAFETY: the block came from self.raw and its record is gone, so no
        // other path can release it again.
        unsafe { self.raw.release(ptr) };
        *slot = None;

        let (level, outcome) = match failure.or(deferred.first().copied()) {
            Some(_) => (LedgerLevel::Warn, "released_with_corruption"),
            None => (LedgerLevel::Trace, "success"),
        };
        self.emit(LedgerEvent::new(level, "free", "free", outcome).with_record(&record));

        if let Some(first) = deferred.first().copied() {
            self.report_findings("free", &deferred);
            failure.get_or_insert(first);
        }

        self.mutation_check("free");
        match failure {
            Some(finding) => Err(LedgerError::IntegrityCorruption(finding)),
            None => Ok(()),
        }
    }

    fn release_addr(&mut self, addr: usize) {
        if let Some(ptr) = NonNull::new(addr as *mut u8) {
            // SAFETY: callers pass addresses of blocks this ledger allocated
            // and has just dropped from its bookkeeping.
            unsafe { self.raw.release(ptr) };
        }
    }

    // -----------------------------------------------------------------------
    // Integrity
    // -----------------------------------------------------------------------

    /// Walk the table and apply the corruption policy to any finding.
    ///
    /// Passthrough sessions have nothing to check and return an empty
    /// report.
    pub fn check_integrity(&mut self) -> Result<IntegrityReport, LedgerError> {
        match self.phase {
            Phase::Uninitialized => Err(self.precondition(
                "check_integrity",
                LedgerError::UninitializedState,
            )),
            Phase::Passthrough => Ok(IntegrityReport::default()),
            Phase::Tracked => {
                let report = self.audit();
                if let Some(first) = self.apply_findings("check_integrity", &report) {
                    return Err(LedgerError::IntegrityCorruption(first));
                }
                self.emit(
                    LedgerEvent::new(LedgerLevel::Debug, "check_integrity", "integrity", "clean")
                        .with_details(format!("{} records", report.records_checked)),
                );
                Ok(report)
            }
        }
    }

    /// Read-only integrity walk. Changes nothing and reports nothing.
    ///
    /// Checks every guard marker, mirrors the chain against the side array
    /// (chain position `k` against side index `len - 1 - k`), and recounts
    /// the live counters.
    #[must_use]
    pub fn audit(&self) -> IntegrityReport {
        let side = self.table.side();
        let mut findings = Vec::new();
        let mut position = 0usize;
        let mut live_bytes = 0usize;

        for record in self.table.iter() {
            let index = side.index_for_position(position);
            let found = index.and_then(|i| side.get(i));
            if found != Some(record.allocation_number) {
                findings.push(CorruptionFinding {
                    allocation_number: Some(record.allocation_number),
                    index,
                    kind: CorruptionKind::SideArrayMismatch {
                        expected: record.allocation_number,
                        found,
                    },
                });
            }

            // SAFETY: live records own byte_count + GUARD_SIZE bytes at addr.
            let check = unsafe { guard::check_guard(record.addr, record.byte_count) };
            if let GuardCheck::Overrun {
                first_bad_offset,
                observed,
            } = check
            {
                findings.push(CorruptionFinding {
                    allocation_number: Some(record.allocation_number),
                    index,
                    kind: CorruptionKind::GuardOverrun {
                        first_bad_offset,
                        observed: u64::from_le_bytes(observed),
                    },
                });
            }

            live_bytes = live_bytes.saturating_add(record.byte_count);
            position += 1;
        }

        if position != side.len() {
            findings.push(CorruptionFinding {
                allocation_number: None,
                index: None,
                kind: CorruptionKind::SideArrayLength {
                    table: position,
                    side: side.len(),
                },
            });
        }

        if !self.accounting.matches(position, live_bytes) {
            let recorded = self.accounting.snapshot();
            findings.push(CorruptionFinding {
                allocation_number: None,
                index: None,
                kind: CorruptionKind::AccountingDrift {
                    recorded_count: recorded.current_count,
                    live_count: position,
                    recorded_bytes: recorded.current_bytes,
                    live_bytes,
                },
            });
        }

        IntegrityReport {
            records_checked: position,
            side_entries: side.len(),
            findings,
        }
    }

    fn mutation_check(&mut self, symbol: &'static str) {
        if self.phase != Phase::Tracked || !self.config.check_on_mutation {
            return;
        }
        let report = self.audit();
        // Findings are reported (and isolated) here; they do not fail the
        // caller's own operation.
        self.apply_findings(symbol, &report);
    }

    /// Report every finding, then halt or isolate. Returns the first finding.
    fn apply_findings(
        &mut self,
        symbol: &'static str,
        report: &IntegrityReport,
    ) -> Option<CorruptionFinding> {
        let first = *report.findings.first()?;
        self.report_findings(symbol, &report.findings);
        self.isolate(symbol, report);
        Some(first)
    }

    /// Emit each finding, then halt if the policy says so.
    fn report_findings(&mut self, symbol: &'static str, findings: &[CorruptionFinding]) {
        for finding in findings {
            self.emit(
                LedgerEvent::new(LedgerLevel::Error, symbol, "integrity_corruption", "detected")
                    .with_finding(finding),
            );
        }
        if let (CorruptionPolicy::Halt, Some(first)) = (self.config.corruption, findings.first()) {
            self.halt(symbol, &LedgerError::IntegrityCorruption(*first));
        }
    }

    /// Pull guard-corrupted records out of the table, then rebuild the side
    /// array and counters from what remains.
    fn isolate(&mut self, symbol: &'static str, report: &IntegrityReport) {
        for finding in &report.findings {
            let (CorruptionKind::GuardOverrun { .. }, Some(number)) =
                (finding.kind, finding.allocation_number)
            else {
                continue;
            };
            let Some(addr) = self
                .table
                .iter()
                .find(|r| r.allocation_number == number)
                .map(|r| r.addr)
            else {
                continue;
            };
            if let Some(removal) = self.table.remove(addr) {
                self.isolated.push(IsolatedRecord {
                    record: removal.record,
                    finding: *finding,
                });
                self.emit(
                    LedgerEvent::new(LedgerLevel::Warn, symbol, "isolate", "isolated")
                        .with_record(&removal.record),
                );
            }
        }
        self.table.rebuild_side_array();
        self.accounting
            .resync(self.table.len(), self.table.live_bytes());
    }

    // -----------------------------------------------------------------------
    // Failure paths
    // -----------------------------------------------------------------------

    /// Precondition violations halt in tracked mode and are returned otherwise.
    fn precondition(&mut self, symbol: &'static str, err: LedgerError) -> LedgerError {
        if self.config.mode.is_tracked() {
            self.halt(symbol, &err);
        }
        self.emit(
            LedgerEvent::new(
                LedgerLevel::Error,
                symbol,
                "precondition_violation",
                "rejected",
            )
            .with_details(err.to_string()),
        );
        err
    }

    fn out_of_memory(
        &mut self,
        symbol: &'static str,
        requested: usize,
        reason: impl Into<String>,
    ) -> LedgerError {
        self.emit(
            LedgerEvent::new(LedgerLevel::Warn, symbol, "out_of_memory", "failed")
                .with_size(requested)
                .with_details(reason),
        );
        LedgerError::OutOfMemory {
            requested,
            snapshot: self.accounting.snapshot(),
        }
    }

    fn halt(&mut self, symbol: &'static str, err: &LedgerError) -> ! {
        self.emit(
            LedgerEvent::new(LedgerLevel::Fatal, symbol, "fatal", "halted")
                .with_details(err.to_string()),
        );
        self.config.fatal.halt(err)
    }

    fn emit(&mut self, mut event: LedgerEvent) {
        if !self.sink.enabled(event.level) {
            return;
        }
        self.next_seq += 1;
        event.seq = self.next_seq;
        event.trace_id = format!("ledger::{}::{:08x}", event.symbol, self.next_seq);
        event.snapshot = self.accounting.snapshot();
        self.sink.record(&event);
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.phase != Phase::Uninitialized
    }

    /// Active mode, `None` when uninitialized.
    #[must_use]
    pub fn mode(&self) -> Option<AccountingMode> {
        match self.phase {
            Phase::Uninitialized => None,
            Phase::Tracked => Some(AccountingMode::Tracked),
            Phase::Passthrough => Some(AccountingMode::Passthrough),
        }
    }

    #[must_use]
    pub fn config(&self) -> LedgerConfig {
        self.config
    }

    #[must_use]
    pub fn snapshot(&self) -> AccountingSnapshot {
        self.accounting.snapshot()
    }

    /// Live allocations, newest first.
    #[must_use]
    pub fn live_allocations(&self) -> Vec<LiveAllocation> {
        self.table.iter().map(LiveAllocation::from).collect()
    }

    /// Records isolated since init and not yet freed.
    #[must_use]
    pub fn isolated(&self) -> &[IsolatedRecord] {
        &self.isolated
    }

    #[must_use]
    pub fn isolated_count(&self) -> usize {
        self.isolated.len()
    }

    #[must_use]
    pub fn raw_allocator(&self) -> &A {
        &self.raw
    }

    pub fn raw_allocator_mut(&mut self) -> &mut A {
        &mut self.raw
    }

    /// Release every block still known to the ledger without checking or
    /// reporting, and end the session. Returns the number of blocks released.
    ///
    /// Meant for recovery after a caught halt (`FatalAction::Panic`), when
    /// the bookkeeping can no longer be trusted to survive `terminate`.
    pub fn abandon(&mut self) -> usize {
        let mut released = 0;
        for record in self.table.drain() {
            self.release_addr(record.addr);
            released += 1;
        }
        for entry in std::mem::take(&mut self.isolated) {
            self.release_addr(entry.record.addr);
            released += 1;
        }
        self.accounting.reset();
        self.phase = Phase::Uninitialized;
        released
    }
}

impl<A: RawAllocator> Drop for HeapLedger<A> {
    fn drop(&mut self) {
        if !self.is_initialized() {
            return;
        }
        if std::thread::panicking() {
            self.abandon();
        } else {
            let _ = self.terminate();
        }
    }
}
