//! Error taxonomy and the fatal-abort primitive.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::accounting::AccountingSnapshot;

/// What exactly an integrity walk found wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CorruptionKind {
    /// Bytes after the payload no longer match the guard marker.
    GuardOverrun {
        first_bad_offset: usize,
        observed: u64,
    },
    /// Side array entry does not mirror the chain record at this position.
    SideArrayMismatch { expected: u64, found: Option<u64> },
    /// Chain and side array hold a different number of entries.
    SideArrayLength { table: usize, side: usize },
    /// A freed record's number was missing from the side array.
    MissingSideEntry { allocation_number: u64 },
    /// Live counters disagree with a recount of the table.
    AccountingDrift {
        recorded_count: usize,
        live_count: usize,
        recorded_bytes: usize,
        live_bytes: usize,
    },
}

impl fmt::Display for CorruptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GuardOverrun {
                first_bad_offset,
                observed,
            } => write!(
                f,
                "guard overrun at payload end +{first_bad_offset} (found {observed:016x})"
            ),
            Self::SideArrayMismatch {
                expected,
                found: Some(found),
            } => write!(f, "side array holds #{found}, chain holds #{expected}"),
            Self::SideArrayMismatch {
                expected,
                found: None,
            } => write!(f, "side array has no entry for chain record #{expected}"),
            Self::SideArrayLength { table, side } => {
                write!(f, "chain has {table} records, side array has {side}")
            }
            Self::MissingSideEntry { allocation_number } => {
                write!(f, "#{allocation_number} missing from side array")
            }
            Self::AccountingDrift {
                recorded_count,
                live_count,
                recorded_bytes,
                live_bytes,
            } => write!(
                f,
                "counters say {recorded_count} records/{recorded_bytes}B, table holds {live_count}/{live_bytes}B"
            ),
        }
    }
}

/// One integrity finding: what, and where.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CorruptionFinding {
    /// Allocation number of the offending record, when one is implicated.
    pub allocation_number: Option<u64>,
    /// Side-array index involved, when one is implicated.
    pub index: Option<usize>,
    #[serde(flatten)]
    pub kind: CorruptionKind,
}

impl fmt::Display for CorruptionFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(number) = self.allocation_number {
            write!(f, "allocation #{number} ")?;
        }
        if let Some(index) = self.index {
            write!(f, "index {index} ")?;
        }
        write!(f, "{}", self.kind)
    }
}

/// Broad error classes, used to pick the reporting path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    PreconditionViolation,
    ResourceExhaustion,
    IntegrityCorruption,
}

/// Errors surfaced by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("ledger used before init or after terminate")]
    UninitializedState,
    #[error("zero-byte allocation request")]
    ZeroSizeRequest,
    #[error("free called with an empty pointer slot")]
    NullSlot,
    #[error("free of {addr:#x} requested but no allocation is live")]
    EmptyTable { addr: usize },
    #[error("pointer {addr:#x} is not a live allocation (double free or foreign pointer)")]
    UntrackedPointer { addr: usize },
    #[error("out of memory: {requested} bytes requested ({snapshot})")]
    OutOfMemory {
        requested: usize,
        snapshot: AccountingSnapshot,
    },
    #[error("integrity corruption: {0}")]
    IntegrityCorruption(CorruptionFinding),
}

impl LedgerError {
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::OutOfMemory { .. } => ErrorClass::ResourceExhaustion,
            Self::IntegrityCorruption(_) => ErrorClass::IntegrityCorruption,
            Self::UninitializedState
            | Self::ZeroSizeRequest
            | Self::NullSlot
            | Self::EmptyTable { .. }
            | Self::UntrackedPointer { .. } => ErrorClass::PreconditionViolation,
        }
    }

    /// The finding carried by an integrity error.
    #[must_use]
    pub const fn finding(&self) -> Option<&CorruptionFinding> {
        match self {
            Self::IntegrityCorruption(finding) => Some(finding),
            _ => None,
        }
    }
}

/// How an unrecoverable condition halts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FatalAction {
    /// Print the error to stderr and abort the process.
    #[default]
    Abort,
    /// Panic with the error message. Lets tests and unwinding embedders
    /// observe the halt.
    Panic,
}

impl FatalAction {
    /// Parse from string (case-insensitive). Unknown values mean `Abort`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "panic" | "unwind" => Self::Panic,
            _ => Self::Abort,
        }
    }

    /// Halt with `err`.
    pub fn halt(self, err: &LedgerError) -> ! {
        match self {
            Self::Abort => {
                eprintln!("heapledger: fatal: {err}");
                std::process::abort()
            }
            Self::Panic => panic!("heapledger: fatal: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes() {
        assert_eq!(
            LedgerError::UninitializedState.class(),
            ErrorClass::PreconditionViolation
        );
        assert_eq!(
            LedgerError::UntrackedPointer { addr: 0x10 }.class(),
            ErrorClass::PreconditionViolation
        );
        let oom = LedgerError::OutOfMemory {
            requested: 4096,
            snapshot: AccountingSnapshot::default(),
        };
        assert_eq!(oom.class(), ErrorClass::ResourceExhaustion);
        assert!(oom.to_string().contains("4096 bytes"));
    }

    #[test]
    fn finding_display_names_number_and_index() {
        let err = LedgerError::IntegrityCorruption(CorruptionFinding {
            allocation_number: Some(7),
            index: Some(2),
            kind: CorruptionKind::SideArrayMismatch {
                expected: 7,
                found: Some(9),
            },
        });
        let text = err.to_string();
        assert!(text.contains("allocation #7"), "{text}");
        assert!(text.contains("index 2"), "{text}");
        assert_eq!(err.finding().and_then(|f| f.allocation_number), Some(7));
    }

    #[test]
    fn finding_serializes_flat() {
        let finding = CorruptionFinding {
            allocation_number: Some(3),
            index: None,
            kind: CorruptionKind::GuardOverrun {
                first_bad_offset: 1,
                observed: 0xFF,
            },
        };
        let value = serde_json::to_value(finding).expect("serialize");
        assert_eq!(value["kind"], "guard_overrun");
        assert_eq!(value["allocation_number"], 3);
        assert_eq!(value["first_bad_offset"], 1);
    }

    #[test]
    fn fatal_action_parse() {
        assert_eq!(FatalAction::from_str_loose("PANIC"), FatalAction::Panic);
        assert_eq!(FatalAction::from_str_loose("abort"), FatalAction::Abort);
        assert_eq!(FatalAction::from_str_loose("bogus"), FatalAction::Abort);
    }

    #[test]
    #[should_panic(expected = "heapledger: fatal")]
    fn panic_action_panics() {
        FatalAction::Panic.halt(&LedgerError::NullSlot);
    }
}
