//! # heapledger-core
//!
//! Instrumented dynamic-memory allocation on top of a raw allocator.
//!
//! A [`HeapLedger`] hands out zero-filled blocks and, in tracked mode, keeps
//! a record of every live one:
//!
//! - **Allocation table** (`table`): newest-first chain of records plus a
//!   side array of allocation numbers mirroring it.
//! - **Checksum guard** (`guard`): a fixed marker after each payload, checked
//!   on free and on every integrity walk.
//! - **Accounting** (`accounting`): current/total bytes, current/total
//!   count and the resident high-water mark.
//! - **Lifecycle** (`ledger`): init, allocate, free, integrity check and
//!   terminate, with leak reporting and forced release at shutdown.
//!
//! Events flow to a pluggable [`DiagnosticSink`]; unrecoverable conditions
//! halt through [`FatalAction`].

#![deny(unsafe_code)]

pub mod accounting;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod global;
#[allow(unsafe_code)]
pub mod guard;
#[allow(unsafe_code)]
pub mod ledger;
#[allow(unsafe_code)]
pub mod raw;
pub mod table;

pub use accounting::AccountingSnapshot;
pub use config::{AccountingMode, CorruptionPolicy, LedgerConfig};
pub use diagnostics::{
    DiagnosticSink, IntegrityReport, LeakReport, LedgerEvent, LedgerLevel, LiveAllocation,
    NullSink, RecordingSink, ShutdownReport, StderrSink,
};
pub use error::{CorruptionFinding, CorruptionKind, ErrorClass, FatalAction, LedgerError};
pub use ledger::{HeapLedger, IsolatedRecord};
pub use raw::{BudgetedAllocator, LibcAllocator, RawAllocator, SystemAllocator};
