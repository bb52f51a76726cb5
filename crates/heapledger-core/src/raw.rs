//! Underlying allocator seam.
//!
//! The ledger never carves memory itself: every block comes from a
//! [`RawAllocator`], which follows the C contract of returning a
//! null-equivalent (`None`) on exhaustion and releasing by pointer alone.
//!
//! Shipped implementations:
//! - [`SystemAllocator`]: Rust's system heap with a small size header so
//!   release does not need the caller to remember the layout.
//! - [`LibcAllocator`]: `malloc`/`realloc`/`free` straight from libc.
//! - [`BudgetedAllocator`]: wraps another allocator and refuses requests past
//!   a byte budget. Used to exercise exhaustion paths and to prove that
//!   shutdown hands every block back.

#![allow(unsafe_code)]

use std::alloc::{GlobalAlloc, Layout, System};
use std::collections::HashMap;
use std::ptr::NonNull;

/// Alignment of every block handed out by [`SystemAllocator`].
pub const BLOCK_ALIGN: usize = 16;

/// Size of the hidden header [`SystemAllocator`] keeps in front of each block.
const SIZE_HEADER: usize = BLOCK_ALIGN;

/// Raw allocate/release primitives the ledger is layered on.
pub trait RawAllocator {
    /// Allocate `size` bytes (`size > 0`). Returns `None` on exhaustion.
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>>;

    /// Resize a block, preserving the first `min(old, new_size)` bytes.
    ///
    /// Returns `None` on exhaustion, in which case `ptr` is still owned by the
    /// caller and untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator and not yet released.
    unsafe fn resize(&mut self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>>;

    /// Release a block previously returned by [`RawAllocator::allocate`] or
    /// [`RawAllocator::resize`].
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator and must not be
    /// released twice.
    unsafe fn release(&mut self, ptr: NonNull<u8>);
}

// ---------------------------------------------------------------------------
// System heap
// ---------------------------------------------------------------------------

/// Rust system heap with a 16-byte size header in front of every block.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl SystemAllocator {
    fn layout_for(size: usize) -> Option<Layout> {
        let total = size.checked_add(SIZE_HEADER)?;
        Layout::from_size_align(total, BLOCK_ALIGN).ok()
    }

    /// Recover the base pointer and stored size of a user block.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from [`SystemAllocator::allocate`].
    unsafe fn header(ptr: NonNull<u8>) -> (*mut u8, usize) {
        // SAFETY: every user pointer sits SIZE_HEADER bytes past its base and
        // the base holds the requested size written at allocation time.
        unsafe {
            let base = ptr.as_ptr().sub(SIZE_HEADER);
            let size = base.cast::<usize>().read();
            (base, size)
        }
    }
}

impl RawAllocator for SystemAllocator {
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let layout = Self::layout_for(size)?;
        // SAFETY: layout has non-zero size and a power-of-two alignment.
        let base = unsafe { System.alloc(layout) };
        if base.is_null() {
            return None;
        }
        // SAFETY: base is valid for layout.size() bytes and aligned to 16, so
        // the header write and the offset stay inside the block.
        unsafe {
            base.cast::<usize>().write(size);
            NonNull::new(base.add(SIZE_HEADER))
        }
    }

    unsafe fn resize(&mut self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        // SAFETY: caller guarantees ptr came from this allocator.
        let (_, old_size) = unsafe { Self::header(ptr) };
        let fresh = self.allocate(new_size)?;
        // SAFETY: both blocks are live and at least min(old, new) bytes long;
        // they are distinct allocations so they cannot overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), old_size.min(new_size));
            self.release(ptr);
        }
        Some(fresh)
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>) {
        // SAFETY: caller guarantees ptr came from this allocator.
        let (base, size) = unsafe { Self::header(ptr) };
        let Some(layout) = Self::layout_for(size) else {
            return;
        };
        // SAFETY: base was produced by System.alloc with exactly this layout.
        unsafe { System.dealloc(base, layout) };
    }
}

// ---------------------------------------------------------------------------
// libc heap
// ---------------------------------------------------------------------------

/// `malloc`/`realloc`/`free` from the platform C library.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcAllocator;

impl RawAllocator for LibcAllocator {
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        // SAFETY: malloc accepts any size and returns null on failure.
        let ptr = unsafe { libc::malloc(size) };
        NonNull::new(ptr.cast::<u8>())
    }

    unsafe fn resize(&mut self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        // SAFETY: caller guarantees ptr came from malloc/realloc. On failure
        // realloc leaves the original block untouched.
        let fresh = unsafe { libc::realloc(ptr.as_ptr().cast(), new_size) };
        NonNull::new(fresh.cast::<u8>())
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>) {
        // SAFETY: caller guarantees ptr came from malloc/realloc and is live.
        unsafe { libc::free(ptr.as_ptr().cast()) };
    }
}

// ---------------------------------------------------------------------------
// Byte budget
// ---------------------------------------------------------------------------

/// Allocator wrapper that fails once outstanding bytes would exceed a budget.
///
/// Also counts outstanding blocks, which lets callers prove that every block
/// was handed back.
#[derive(Debug)]
pub struct BudgetedAllocator<A: RawAllocator = SystemAllocator> {
    inner: A,
    budget: usize,
    outstanding: HashMap<usize, usize>,
    outstanding_bytes: usize,
    refusals: u64,
}

impl BudgetedAllocator<SystemAllocator> {
    /// Budgeted wrapper over the system heap.
    #[must_use]
    pub fn new(budget: usize) -> Self {
        Self::wrap(SystemAllocator, budget)
    }
}

impl<A: RawAllocator> BudgetedAllocator<A> {
    /// Wrap `inner` with a budget of `budget` outstanding bytes.
    #[must_use]
    pub fn wrap(inner: A, budget: usize) -> Self {
        Self {
            inner,
            budget,
            outstanding: HashMap::new(),
            outstanding_bytes: 0,
            refusals: 0,
        }
    }

    /// Bytes currently handed out.
    #[must_use]
    pub fn outstanding_bytes(&self) -> usize {
        self.outstanding_bytes
    }

    /// Blocks currently handed out.
    #[must_use]
    pub fn outstanding_blocks(&self) -> usize {
        self.outstanding.len()
    }

    /// Requests refused because of the budget.
    #[must_use]
    pub fn refusals(&self) -> u64 {
        self.refusals
    }

    /// Change the budget. Already outstanding blocks are unaffected.
    pub fn set_budget(&mut self, budget: usize) {
        self.budget = budget;
    }

    fn admits(&mut self, extra: usize) -> bool {
        let fits = self
            .outstanding_bytes
            .checked_add(extra)
            .is_some_and(|total| total <= self.budget);
        if !fits {
            self.refusals += 1;
        }
        fits
    }
}

impl<A: RawAllocator> RawAllocator for BudgetedAllocator<A> {
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if !self.admits(size) {
            return None;
        }
        let ptr = self.inner.allocate(size)?;
        self.outstanding.insert(ptr.as_ptr() as usize, size);
        self.outstanding_bytes += size;
        Some(ptr)
    }

    unsafe fn resize(&mut self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        let old_size = self
            .outstanding
            .get(&(ptr.as_ptr() as usize))
            .copied()
            .unwrap_or(0);
        if new_size > old_size && !self.admits(new_size - old_size) {
            return None;
        }
        // SAFETY: forwarded caller contract.
        let fresh = unsafe { self.inner.resize(ptr, new_size) }?;
        self.outstanding.remove(&(ptr.as_ptr() as usize));
        self.outstanding.insert(fresh.as_ptr() as usize, new_size);
        self.outstanding_bytes = self.outstanding_bytes - old_size + new_size;
        Some(fresh)
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>) {
        if let Some(size) = self.outstanding.remove(&(ptr.as_ptr() as usize)) {
            self.outstanding_bytes -= size;
        }
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.release(ptr) };
    }
}
