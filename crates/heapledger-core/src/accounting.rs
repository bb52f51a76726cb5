//! Allocation counters.
//!
//! Five counters move together with every table mutation. Each update is
//! computed in full before anything is stored, so a failed update (counter
//! overflow, free larger than what is resident) leaves the state untouched.

use std::fmt;

use serde::Serialize;

/// Point-in-time copy of the accounting counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AccountingSnapshot {
    /// Payload bytes currently live.
    pub current_bytes: usize,
    /// Payload bytes ever allocated.
    pub total_bytes: u64,
    /// Records currently live.
    pub current_count: usize,
    /// Records ever allocated. The last allocation number handed out.
    pub total_count: u64,
    /// Highest `current_bytes` ever observed.
    pub max_resident: usize,
}

impl fmt::Display for AccountingSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "current={}B/{} total={}B/{} max_resident={}B",
            self.current_bytes,
            self.current_count,
            self.total_bytes,
            self.total_count,
            self.max_resident
        )
    }
}

/// The accounting engine.
#[derive(Debug, Default, Clone)]
pub struct Accounting {
    state: AccountingSnapshot,
}

impl Accounting {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> AccountingSnapshot {
        self.state
    }

    /// Number the next allocation will receive.
    #[must_use]
    pub fn next_allocation_number(&self) -> Option<u64> {
        self.state.total_count.checked_add(1)
    }

    /// Account for a new allocation of `byte_count` bytes.
    ///
    /// Returns the allocation number assigned (`total_count + 1`), or `None`
    /// if any counter would overflow.
    pub fn commit_allocate(&mut self, byte_count: usize) -> Option<u64> {
        let s = self.state;
        let next = AccountingSnapshot {
            current_bytes: s.current_bytes.checked_add(byte_count)?,
            total_bytes: s.total_bytes.checked_add(byte_count as u64)?,
            current_count: s.current_count.checked_add(1)?,
            total_count: s.total_count.checked_add(1)?,
            max_resident: s.max_resident,
        };
        self.state = AccountingSnapshot {
            max_resident: next.max_resident.max(next.current_bytes),
            ..next
        };
        Some(self.state.total_count)
    }

    /// Account for releasing a record of `byte_count` bytes.
    ///
    /// Returns `false` without touching any counter if the release would
    /// drive `current_bytes` or `current_count` below zero.
    pub fn commit_free(&mut self, byte_count: usize) -> bool {
        let (Some(current_bytes), Some(current_count)) = (
            self.state.current_bytes.checked_sub(byte_count),
            self.state.current_count.checked_sub(1),
        ) else {
            return false;
        };
        self.state.current_bytes = current_bytes;
        self.state.current_count = current_count;
        true
    }

    /// Force the live counters to match a recount of the table.
    ///
    /// Totals and the resident high-water mark are history and stay as they
    /// are (the mark is only raised).
    pub fn resync(&mut self, live_count: usize, live_bytes: usize) {
        self.state.current_count = live_count;
        self.state.current_bytes = live_bytes;
        self.state.max_resident = self.state.max_resident.max(live_bytes);
    }

    /// Compare the live counters with a recount of the table.
    #[must_use]
    pub fn matches(&self, live_count: usize, live_bytes: usize) -> bool {
        self.state.current_count == live_count
            && self.state.current_bytes == live_bytes
            && self.state.max_resident >= self.state.current_bytes
    }

    pub fn reset(&mut self) {
        self.state = AccountingSnapshot::default();
    }
}
