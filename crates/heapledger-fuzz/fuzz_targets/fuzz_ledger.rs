#![no_main]
use heapledger_core::guard::GUARD_MARKER;
use heapledger_core::{
    BudgetedAllocator, CorruptionPolicy, FatalAction, HeapLedger, LedgerConfig, NullSink,
};
use libfuzzer_sys::fuzz_target;
use std::ptr::NonNull;

fuzz_target!(|data: &[u8]| {
    // Each 4-byte chunk is one operation: opcode, then a little-endian size.
    if data.len() < 4 {
        return;
    }

    let mut ledger = HeapLedger::new(BudgetedAllocator::new(1 << 22), NullSink)
        .with_fatal_action(FatalAction::Panic);
    ledger.init(
        LedgerConfig::tracked()
            .with_corruption_policy(CorruptionPolicy::Isolate)
            .with_fatal_action(FatalAction::Panic),
    );
    let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();

    for chunk in data.chunks_exact(4) {
        let size = u16::from_le_bytes([chunk[1], chunk[2]]) as usize + 1;
        let pick = chunk[3] as usize;

        match chunk[0] % 5 {
            0 => {
                if let Ok(ptr) = ledger.allocate(size) {
                    live.push((ptr, size));
                }
            }
            1 => {
                if !live.is_empty() {
                    let (ptr, _) = live.swap_remove(pick % live.len());
                    let mut slot = Some(ptr);
                    let _ = ledger.free(&mut slot);
                    assert!(slot.is_none());
                }
            }
            2 => {
                if !live.is_empty() {
                    let index = pick % live.len();
                    let old = live[index].0;
                    let mut slot = Some(old);
                    let _ = ledger.reallocate(&mut slot, size);
                    // On exhaustion the slot still holds the old block.
                    match slot {
                        Some(ptr) if ptr != old => live[index] = (ptr, size),
                        Some(_) => {}
                        None => {
                            live.swap_remove(index);
                        }
                    }
                }
            }
            3 => {
                if !live.is_empty() {
                    let (ptr, size) = live[pick % live.len()];
                    // SAFETY: tracked blocks carry a guard right after the payload.
                    unsafe { ptr.as_ptr().add(size).write(!GUARD_MARKER[0]) };
                }
            }
            _ => {
                let _ = ledger.check_integrity();
            }
        }

        let snap = ledger.snapshot();
        let records = ledger.live_allocations();
        assert_eq!(snap.current_count, records.len());
        assert_eq!(
            snap.current_bytes,
            records.iter().map(|r| r.byte_count).sum::<usize>()
        );
        assert!(snap.max_resident >= snap.current_bytes);
        assert_eq!(records.len() + ledger.isolated_count(), live.len());
    }

    ledger.terminate();
    assert_eq!(ledger.raw_allocator().outstanding_blocks(), 0);
});
