//! Process-wide ledger behind free functions.
//!
//! One [`HeapLedger`] over the system heap lives in a static mutex and is
//! created on first use. The mutex only makes the static possible; callers
//! still drive the ledger from one thread.

use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::accounting::AccountingSnapshot;
use crate::config::LedgerConfig;
use crate::diagnostics::{DiagnosticSink, IntegrityReport, ShutdownReport};
use crate::error::LedgerError;
use crate::ledger::HeapLedger;

static GLOBAL: Mutex<Option<HeapLedger>> = Mutex::new(None);

/// Run `f` against the process-wide ledger, creating it if needed.
pub fn with_ledger<R>(f: impl FnOnce(&mut HeapLedger) -> R) -> R {
    let mut guard = GLOBAL.lock();
    f(guard.get_or_insert_with(HeapLedger::system))
}

/// Route process-wide ledger events to `sink`.
pub fn install_sink(sink: impl DiagnosticSink + Send + 'static) {
    with_ledger(|ledger| ledger.set_sink(sink));
}

/// See [`HeapLedger::init`].
pub fn init(config: LedgerConfig) -> bool {
    with_ledger(|ledger| ledger.init(config))
}

/// See [`HeapLedger::allocate`].
pub fn allocate(byte_count: usize) -> Result<NonNull<u8>, LedgerError> {
    with_ledger(|ledger| ledger.allocate(byte_count))
}

/// See [`HeapLedger::allocate_array`].
pub fn allocate_array(count: usize, elem_size: usize) -> Result<NonNull<u8>, LedgerError> {
    with_ledger(|ledger| ledger.allocate_array(count, elem_size))
}

/// See [`HeapLedger::reallocate`].
pub fn reallocate(slot: &mut Option<NonNull<u8>>, new_size: usize) -> Result<(), LedgerError> {
    with_ledger(|ledger| ledger.reallocate(slot, new_size))
}

/// See [`HeapLedger::free`].
pub fn free(slot: &mut Option<NonNull<u8>>) -> Result<(), LedgerError> {
    with_ledger(|ledger| ledger.free(slot))
}

/// See [`HeapLedger::check_integrity`].
pub fn check_integrity() -> Result<IntegrityReport, LedgerError> {
    with_ledger(HeapLedger::check_integrity)
}

/// See [`HeapLedger::terminate`].
pub fn terminate() -> ShutdownReport {
    with_ledger(HeapLedger::terminate)
}

#[must_use]
pub fn snapshot() -> AccountingSnapshot {
    with_ledger(|ledger| ledger.snapshot())
}

#[must_use]
pub fn is_initialized() -> bool {
    GLOBAL.lock().as_ref().is_some_and(HeapLedger::is_initialized)
}
