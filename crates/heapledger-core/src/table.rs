//! Allocation table and side array.
//!
//! The table owns one [`AllocationRecord`] per live allocation. Records live
//! in a slot arena and are chained by slot index, newest first, so insertion
//! at the head and removal from anywhere are constant-time index updates.
//! An address index maps payload addresses to slots.
//!
//! Next to the chain sits the [`SideArray`]: the allocation numbers of the
//! live records, stored oldest-first. The chain record at position `k`
//! (0 = head) must carry the number at side index `len - 1 - k`. Walking
//! the chain and reading the side array backwards must produce the same
//! sequence; the integrity walk relies on exactly that.

use std::collections::HashMap;

/// Bookkeeping entry for one live allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRecord {
    /// Payload address handed to the caller.
    pub addr: usize,
    /// Payload size in bytes (guard excluded).
    pub byte_count: usize,
    /// Monotonic allocation number, starting at 1, never reused.
    pub allocation_number: u64,
}

/// Allocation numbers of live records, oldest-first.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SideArray {
    numbers: Vec<u64>,
}

impl SideArray {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.numbers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.numbers.is_empty()
    }

    /// Number stored at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<u64> {
        self.numbers.get(index).copied()
    }

    /// Side index mirroring chain position `position` (0 = newest).
    #[must_use]
    pub fn index_for_position(&self, position: usize) -> Option<usize> {
        self.numbers.len().checked_sub(position.checked_add(1)?)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u64] {
        &self.numbers
    }

    fn push(&mut self, number: u64) {
        self.numbers.push(number);
    }

    /// Remove `number`, keeping the order of the rest. Returns its old index.
    fn remove(&mut self, number: u64) -> Option<usize> {
        let index = self.numbers.iter().position(|&n| n == number)?;
        self.numbers.remove(index);
        Some(index)
    }

    #[cfg(test)]
    pub(crate) fn overwrite(&mut self, index: usize, number: u64) {
        self.numbers[index] = number;
    }
}

#[derive(Debug)]
struct Slot {
    record: AllocationRecord,
    newer: Option<usize>,
    older: Option<usize>,
}

/// Result of unlinking a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removal {
    pub record: AllocationRecord,
    /// Side-array index the record's number was removed from. `None` means
    /// the number was missing, i.e. the side array had diverged.
    pub side_index: Option<usize>,
}

/// Newest-first chain of live allocation records.
#[derive(Debug, Default)]
pub struct AllocationTable {
    slots: Vec<Option<Slot>>,
    vacant: Vec<usize>,
    by_addr: HashMap<usize, usize>,
    head: Option<usize>,
    len: usize,
    side: SideArray,
}

impl AllocationTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn side(&self) -> &SideArray {
        &self.side
    }

    /// Most recent record.
    #[must_use]
    pub fn head(&self) -> Option<&AllocationRecord> {
        self.head
            .and_then(|idx| self.slots[idx].as_ref())
            .map(|slot| &slot.record)
    }

    /// Splice `record` in at the head and append its number to the side array.
    pub fn insert(&mut self, record: AllocationRecord) {
        let slot = Slot {
            record,
            newer: None,
            older: self.head,
        };
        let idx = match self.vacant.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        if let Some(old_head) = self.head.and_then(|h| self.slots[h].as_mut()) {
            old_head.newer = Some(idx);
        }
        self.head = Some(idx);
        self.by_addr.insert(record.addr, idx);
        self.len += 1;
        self.side.push(record.allocation_number);
    }

    /// Record owning payload `addr`.
    #[must_use]
    pub fn get(&self, addr: usize) -> Option<&AllocationRecord> {
        let idx = *self.by_addr.get(&addr)?;
        self.slots[idx].as_ref().map(|slot| &slot.record)
    }

    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.by_addr.contains_key(&addr)
    }

    /// Unlink the record owning `addr` (head or mid-chain) and compact the
    /// side array.
    pub fn remove(&mut self, addr: usize) -> Option<Removal> {
        let idx = self.by_addr.remove(&addr)?;
        let slot = self.slots.get_mut(idx)?.take()?;

        match slot.newer {
            Some(newer) => {
                if let Some(n) = self.slots[newer].as_mut() {
                    n.older = slot.older;
                }
            }
            None => self.head = slot.older,
        }
        if let Some(o) = slot.older.and_then(|older| self.slots[older].as_mut()) {
            o.newer = slot.newer;
        }

        self.vacant.push(idx);
        self.len -= 1;
        let side_index = self.side.remove(slot.record.allocation_number);
        Some(Removal {
            record: slot.record,
            side_index,
        })
    }

    /// Walk the chain from the head.
    #[must_use]
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            table: self,
            cursor: self.head,
            budget: self.slots.len(),
        }
    }

    /// Sum of payload bytes over the chain.
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.iter().map(|r| r.byte_count).sum()
    }

    /// Replace the side array with one reconstructed from a chain walk.
    pub fn rebuild_side_array(&mut self) {
        let mut numbers: Vec<u64> = self.iter().map(|r| r.allocation_number).collect();
        numbers.reverse();
        self.side = SideArray { numbers };
    }

    /// Remove every record, newest first.
    pub fn drain(&mut self) -> Vec<AllocationRecord> {
        let records: Vec<AllocationRecord> = self.iter().copied().collect();
        *self = Self::default();
        records
    }

    #[cfg(test)]
    pub(crate) fn side_mut(&mut self) -> &mut SideArray {
        &mut self.side
    }
}

/// Newest-first iterator over table records.
pub struct Iter<'a> {
    table: &'a AllocationTable,
    cursor: Option<usize>,
    budget: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a AllocationRecord;

    fn next(&mut self) -> Option<Self::Item> {
        // Bounded by the arena size so a broken link cannot loop forever.
        if self.budget == 0 {
            return None;
        }
        self.budget -= 1;
        let slot = self.table.slots.get(self.cursor?)?.as_ref()?;
        self.cursor = slot.older;
        Some(&slot.record)
    }
}
