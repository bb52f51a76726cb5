//! Init-time configuration.
//!
//! Everything here is chosen by the caller at `init` and never read from the
//! environment or a file:
//! - [`AccountingMode`]: `tracked` (table, guards, counters, leak report) or
//!   `passthrough` (zero-fill allocate / release, nothing else).
//! - [`CorruptionPolicy`]: what an integrity finding does (`halt` or
//!   `isolate`). Applied the same way by free, the integrity check and
//!   terminate.
//! - [`FatalAction`]: how a halt is carried out.
//! - `check_on_mutation`: run an integrity walk before and after every
//!   tracked allocate/free.

use serde::Serialize;

use crate::error::FatalAction;

/// Which strategy the ledger runs between init and terminate.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountingMode {
    /// Full bookkeeping: table, side array, guard markers, counters.
    #[default]
    Tracked,
    /// Zero-fill allocate and release only.
    Passthrough,
}

impl AccountingMode {
    /// Parse from string (case-insensitive). Unknown values mean `Tracked`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "passthrough" | "off" | "none" | "disabled" => Self::Passthrough,
            _ => Self::Tracked,
        }
    }

    #[must_use]
    pub const fn is_tracked(self) -> bool {
        matches!(self, Self::Tracked)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tracked => "tracked",
            Self::Passthrough => "passthrough",
        }
    }
}

/// Response to a detected integrity corruption.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CorruptionPolicy {
    /// Report, then halt through the configured [`FatalAction`].
    #[default]
    Halt,
    /// Report, pull corrupted records out of the live bookkeeping, repair the
    /// side array and counters from the table, and return the error.
    Isolate,
}

impl CorruptionPolicy {
    /// Parse from string (case-insensitive). Unknown values mean `Halt`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "isolate" | "continue" | "recover" => Self::Isolate,
            _ => Self::Halt,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Halt => "halt",
            Self::Isolate => "isolate",
        }
    }
}

/// Flag bits accepted by [`LedgerConfig::from_flags`].
pub mod flags {
    /// Maintain table, guards and counters.
    pub const ACCOUNTING: u32 = 1 << 0;
    /// Isolate corrupted records instead of halting.
    pub const ISOLATE_CORRUPTION: u32 = 1 << 1;
    /// Skip the integrity walks around each allocate/free.
    pub const NO_MUTATION_CHECKS: u32 = 1 << 2;
    /// Panic instead of aborting on fatal conditions.
    pub const PANIC_ON_FATAL: u32 = 1 << 3;
}

/// Ledger configuration passed to `init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LedgerConfig {
    pub mode: AccountingMode,
    pub corruption: CorruptionPolicy,
    pub fatal: FatalAction,
    pub check_on_mutation: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self::tracked()
    }
}

impl LedgerConfig {
    /// Tracked mode with the halting corruption policy.
    #[must_use]
    pub const fn tracked() -> Self {
        Self {
            mode: AccountingMode::Tracked,
            corruption: CorruptionPolicy::Halt,
            fatal: FatalAction::Abort,
            check_on_mutation: true,
        }
    }

    /// Pass-through mode.
    #[must_use]
    pub const fn passthrough() -> Self {
        Self {
            mode: AccountingMode::Passthrough,
            ..Self::tracked()
        }
    }

    /// Build from [`flags`] bits.
    #[must_use]
    pub const fn from_flags(bits: u32) -> Self {
        Self {
            mode: if bits & flags::ACCOUNTING != 0 {
                AccountingMode::Tracked
            } else {
                AccountingMode::Passthrough
            },
            corruption: if bits & flags::ISOLATE_CORRUPTION != 0 {
                CorruptionPolicy::Isolate
            } else {
                CorruptionPolicy::Halt
            },
            fatal: if bits & flags::PANIC_ON_FATAL != 0 {
                FatalAction::Panic
            } else {
                FatalAction::Abort
            },
            check_on_mutation: bits & flags::NO_MUTATION_CHECKS == 0,
        }
    }

    #[must_use]
    pub const fn with_corruption_policy(mut self, policy: CorruptionPolicy) -> Self {
        self.corruption = policy;
        self
    }

    #[must_use]
    pub const fn with_fatal_action(mut self, fatal: FatalAction) -> Self {
        self.fatal = fatal;
        self
    }

    #[must_use]
    pub const fn with_mutation_checks(mut self, enabled: bool) -> Self {
        self.check_on_mutation = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_modes() {
        assert_eq!(AccountingMode::from_str_loose("tracked"), AccountingMode::Tracked);
        assert_eq!(AccountingMode::from_str_loose("ON"), AccountingMode::Tracked);
        assert_eq!(
            AccountingMode::from_str_loose("passthrough"),
            AccountingMode::Passthrough
        );
        assert_eq!(AccountingMode::from_str_loose("off"), AccountingMode::Passthrough);
        assert_eq!(AccountingMode::from_str_loose("bogus"), AccountingMode::Tracked);
    }

    #[test]
    fn parse_policies() {
        assert_eq!(CorruptionPolicy::from_str_loose("halt"), CorruptionPolicy::Halt);
        assert_eq!(
            CorruptionPolicy::from_str_loose("Isolate"),
            CorruptionPolicy::Isolate
        );
        assert_eq!(CorruptionPolicy::from_str_loose("bogus"), CorruptionPolicy::Halt);
    }

    #[test]
    fn default_is_tracked_and_halting() {
        let config = LedgerConfig::default();
        assert!(config.mode.is_tracked());
        assert_eq!(config.corruption, CorruptionPolicy::Halt);
        assert_eq!(config.fatal, FatalAction::Abort);
        assert!(config.check_on_mutation);
    }

    #[test]
    fn flags_map_onto_fields() {
        assert_eq!(LedgerConfig::from_flags(flags::ACCOUNTING), LedgerConfig::tracked());
        assert_eq!(LedgerConfig::from_flags(0), LedgerConfig::passthrough());

        let config = LedgerConfig::from_flags(
            flags::ACCOUNTING
                | flags::ISOLATE_CORRUPTION
                | flags::NO_MUTATION_CHECKS
                | flags::PANIC_ON_FATAL,
        );
        assert_eq!(config.corruption, CorruptionPolicy::Isolate);
        assert_eq!(config.fatal, FatalAction::Panic);
        assert!(!config.check_on_mutation);
    }
}
