use heapledger_core::{
    BudgetedAllocator, CorruptionKind, CorruptionPolicy, FatalAction, HeapLedger, LedgerConfig,
    RecordingSink,
};
use std::ptr::NonNull;

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range_usize(&mut self, low: usize, high_inclusive: usize) -> usize {
        assert!(low <= high_inclusive);
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

fn fresh_ledger(config: LedgerConfig) -> (HeapLedger<BudgetedAllocator>, RecordingSink) {
    let sink = RecordingSink::new();
    let mut ledger = HeapLedger::new(BudgetedAllocator::new(64 << 20), sink.clone())
        .with_fatal_action(FatalAction::Panic);
    assert!(ledger.init(config.with_fatal_action(FatalAction::Panic)));
    (ledger, sink)
}

/// Copy of a live payload, so nothing outlives the block it was read from.
fn payload(ptr: NonNull<u8>, len: usize) -> Vec<u8> {
    // SAFETY: tests only read payloads of live allocations of `len` bytes.
    unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) }.to_vec()
}

#[test]
fn deterministic_sequences_hold_accounting_invariants() {
    // Deterministic and bounded: invariant pressure, not a fuzz campaign
    // (that lives in heapledger-fuzz).
    const SEEDS: [u64; 4] = [1, 2, 3, 4];
    const STEPS: usize = 1_500;
    const SLOTS: usize = 32;

    for seed in SEEDS {
        let (mut ledger, _sink) =
            fresh_ledger(LedgerConfig::tracked().with_mutation_checks(seed % 2 == 0));
        let mut rng = XorShift64::new(seed);
        let mut slots: [Option<NonNull<u8>>; SLOTS] = [None; SLOTS];
        let mut sizes = [0_usize; SLOTS];
        let mut high_water = 0_usize;

        for step in 0..STEPS {
            let op = rng.gen_range_usize(0, 99);
            let idx = rng.gen_range_usize(0, SLOTS - 1);

            match op {
                // allocate (biased)
                0..=49 => {
                    if slots[idx].is_some() {
                        continue;
                    }
                    let size = rng.gen_range_usize(1, 2048);
                    let ptr = ledger.allocate(size).expect("alloc");
                    assert!(
                        payload(ptr, size).iter().all(|&b| b == 0),
                        "seed={seed} step={step}: fresh block not zeroed"
                    );
                    // SAFETY: size-byte payload.
                    unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0xC5, size) };
                    slots[idx] = Some(ptr);
                    sizes[idx] = size;
                }
                // free
                50..=84 => {
                    if slots[idx].is_none() {
                        continue;
                    }
                    ledger
                        .free(&mut slots[idx])
                        .unwrap_or_else(|e| panic!("seed={seed} step={step}: free failed: {e}"));
                    assert!(slots[idx].is_none(), "seed={seed} step={step}: slot not emptied");
                    sizes[idx] = 0;
                }
                // reallocate
                85..=94 => {
                    if slots[idx].is_none() {
                        continue;
                    }
                    let size = rng.gen_range_usize(1, 2048);
                    let keep = sizes[idx].min(size);
                    // The new block is live before the old one is released.
                    high_water = high_water.max(sizes.iter().sum::<usize>() + size);
                    ledger
                        .reallocate(&mut slots[idx], size)
                        .unwrap_or_else(|e| panic!("seed={seed} step={step}: realloc failed: {e}"));
                    let ptr = slots[idx].expect("reallocated slot");
                    let bytes = payload(ptr, size);
                    assert!(
                        bytes[..keep].iter().all(|&b| b == 0xC5),
                        "seed={seed} step={step}: realloc lost contents"
                    );
                    assert!(
                        bytes[keep..].iter().all(|&b| b == 0),
                        "seed={seed} step={step}: realloc growth not zeroed"
                    );
                    // SAFETY: size-byte payload.
                    unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0xC5, size) };
                    sizes[idx] = size;
                }
                // integrity walk
                _ => {
                    let first = ledger.check_integrity().expect("clean walk");
                    let second = ledger.check_integrity().expect("clean walk");
                    assert_eq!(first, second, "seed={seed} step={step}: walk not idempotent");
                }
            }

            let snap = ledger.snapshot();
            let live_count = slots.iter().filter(|s| s.is_some()).count();
            let live_bytes: usize = sizes.iter().sum();
            high_water = high_water.max(live_bytes);
            assert_eq!(
                snap.current_count, live_count,
                "seed={seed} step={step}: current_count drifted"
            );
            assert_eq!(
                snap.current_bytes, live_bytes,
                "seed={seed} step={step}: current_bytes drifted"
            );
            assert_eq!(
                snap.max_resident, high_water,
                "seed={seed} step={step}: max_resident is not the high-water mark"
            );
            assert_eq!(
                ledger.live_allocations().len(),
                live_count,
                "seed={seed} step={step}: table length drifted"
            );
        }

        let live = slots.iter().filter(|s| s.is_some()).count();
        let report = ledger.terminate();
        assert_eq!(report.leaked(), live > 0, "seed={seed}: leak report mismatch");
        assert_eq!(report.forced_releases, live, "seed={seed}: forced releases");
        assert_eq!(
            ledger.raw_allocator().outstanding_blocks(),
            0,
            "seed={seed}: raw blocks left after terminate"
        );
    }
}

#[test]
fn lifo_and_arbitrary_frees_leave_identical_state() {
    let (mut lifo, _) = fresh_ledger(LedgerConfig::tracked());
    let (mut mid, _) = fresh_ledger(LedgerConfig::tracked());

    let mut a1 = Some(lifo.allocate(16).expect("a1"));
    let mut b1 = Some(lifo.allocate(16).expect("b1"));
    let mut a2 = Some(mid.allocate(16).expect("a2"));
    let mut b2 = Some(mid.allocate(16).expect("b2"));

    lifo.free(&mut b1).expect("newest");
    mid.free(&mut a2).expect("oldest");

    let (l, m) = (lifo.snapshot(), mid.snapshot());
    assert_eq!(
        (l.current_bytes, l.current_count, l.total_count, l.max_resident),
        (m.current_bytes, m.current_count, m.total_count, m.max_resident)
    );
    assert!(lifo.audit().is_clean());
    assert!(mid.audit().is_clean());

    lifo.free(&mut a1).expect("drain lifo");
    mid.free(&mut b2).expect("drain mid");
    assert_eq!(lifo.snapshot(), mid.snapshot());
}

#[test]
fn guard_corruption_surfaces_on_next_check_or_free() {
    let config = LedgerConfig::tracked()
        .with_corruption_policy(CorruptionPolicy::Isolate)
        .with_mutation_checks(false);

    for via_free in [false, true] {
        let (mut ledger, sink) = fresh_ledger(config);
        let mut keep = Some(ledger.allocate(32).expect("keep"));
        let victim = ledger.allocate(40).expect("victim");
        // SAFETY: one byte past the payload is the first guard byte, still
        // inside the raw block.
        unsafe { victim.as_ptr().add(40).write(0xFF) };

        let err = if via_free {
            ledger.free(&mut Some(victim)).expect_err("free must report")
        } else {
            ledger.check_integrity().expect_err("check must report")
        };
        let finding = err.finding().copied().expect("integrity finding");
        assert_eq!(finding.allocation_number, Some(2), "via_free={via_free}");
        assert!(
            matches!(finding.kind, CorruptionKind::GuardOverrun { .. }),
            "via_free={via_free}: {finding}"
        );

        let events = sink.of_kind("integrity_corruption");
        assert_eq!(events.len(), 1, "via_free={via_free}");
        let line = events[0].to_jsonl().expect("serialize");
        let value: serde_json::Value = serde_json::from_str(&line).expect("json");
        assert_eq!(value["allocation_number"], 2);
        assert_eq!(value["level"], "error");

        assert!(ledger.check_integrity().expect("repaired").is_clean());
        ledger.free(&mut keep).expect("untouched record frees cleanly");
        let report = ledger.terminate();
        assert!(!report.leaked(), "via_free={via_free}");
        assert_eq!(ledger.raw_allocator().outstanding_blocks(), 0);
    }
}
