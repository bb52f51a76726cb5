use heapledger_core::{
    AccountingMode, BudgetedAllocator, FatalAction, HeapLedger, LedgerConfig, LedgerError,
    LedgerLevel, NullSink, RecordingSink,
};

fn recorded(config: LedgerConfig, budget: usize) -> (HeapLedger<BudgetedAllocator>, RecordingSink) {
    let sink = RecordingSink::new();
    let mut ledger = HeapLedger::new(BudgetedAllocator::new(budget), sink.clone());
    assert!(ledger.init(config.with_fatal_action(FatalAction::Panic)));
    (ledger, sink)
}

#[test]
fn accounting_walkthrough_ends_without_leak() {
    let (mut ledger, sink) = recorded(LedgerConfig::tracked(), 1 << 16);

    let mut p1 = Some(ledger.allocate(100).expect("p1"));
    assert_eq!(ledger.snapshot().current_bytes, 100);
    assert_eq!(ledger.snapshot().current_count, 1);

    let mut p2 = Some(ledger.allocate(50).expect("p2"));
    assert_eq!(ledger.snapshot().current_bytes, 150);
    assert_eq!(ledger.snapshot().max_resident, 150);

    ledger.free(&mut p1).expect("free p1");
    assert_eq!(ledger.snapshot().current_bytes, 50);
    assert_eq!(ledger.snapshot().current_count, 1);

    ledger.free(&mut p2).expect("free p2");
    assert_eq!(ledger.snapshot().current_bytes, 0);
    assert_eq!(ledger.snapshot().current_count, 0);

    let report = ledger.terminate();
    assert!(!report.leaked());
    assert!(sink.of_kind("leak_at_shutdown").is_empty());
    assert!(
        sink.events()
            .iter()
            .all(|e| e.level < LedgerLevel::Warn),
        "clean session must not warn"
    );
}

#[test]
fn shutdown_leak_report_counts_outstanding_and_frees_them() {
    let (mut ledger, sink) = recorded(LedgerConfig::tracked(), 1 << 16);
    ledger.allocate(64).expect("64");
    ledger.allocate(128).expect("128");

    let report = ledger.terminate();
    let leak = report.leak.expect("leak");
    assert_eq!(leak.outstanding_count, 2);
    assert_eq!(leak.outstanding_bytes, 192);
    assert_eq!(ledger.raw_allocator().outstanding_bytes(), 0);
    assert_eq!(ledger.raw_allocator().outstanding_blocks(), 0);

    let warn = &sink.of_kind("leak_at_shutdown")[0];
    assert_eq!(warn.level, LedgerLevel::Warn);
    assert_eq!(warn.snapshot.current_bytes, 192);
    assert_eq!(warn.snapshot.current_count, 2);
}

#[test]
fn exhaustion_is_reported_and_survivable() {
    let (mut ledger, sink) = recorded(LedgerConfig::tracked(), 256);
    let mut big = Some(ledger.allocate(200).expect("fits"));

    match ledger.allocate(200) {
        Err(LedgerError::OutOfMemory { requested, snapshot }) => {
            assert_eq!(requested, 200);
            assert_eq!(snapshot.current_bytes, 200);
        }
        other => panic!("expected OutOfMemory, got {other:?}"),
    }
    assert_eq!(ledger.raw_allocator().refusals(), 1);
    assert_eq!(sink.of_kind("out_of_memory")[0].level, LedgerLevel::Warn);

    ledger.free(&mut big).expect("free");
    let mut again = Some(ledger.allocate(200).expect("budget free again"));
    ledger.free(&mut again).expect("free again");
    assert!(!ledger.terminate().leaked());
}

#[test]
fn sessions_can_switch_modes() {
    let mut ledger = HeapLedger::new(BudgetedAllocator::new(1 << 16), NullSink)
        .with_fatal_action(FatalAction::Panic);
    assert!(!ledger.is_initialized());
    assert_eq!(ledger.mode(), None);

    assert!(ledger.init(LedgerConfig::passthrough()));
    let mut p = Some(ledger.allocate(10).expect("passthrough"));
    ledger.free(&mut p).expect("passthrough free");
    let report = ledger.terminate();
    assert_eq!(report.mode, Some(AccountingMode::Passthrough));

    assert!(ledger.init(LedgerConfig::tracked().with_fatal_action(FatalAction::Panic)));
    ledger.allocate(10).expect("tracked");
    assert_eq!(ledger.snapshot().total_count, 1);
    let report = ledger.terminate();
    assert_eq!(report.mode, Some(AccountingMode::Tracked));
    assert_eq!(report.forced_releases, 1);

    let report = ledger.terminate();
    assert_eq!(report.mode, None);
}

#[test]
fn flag_bits_configure_a_session() {
    use heapledger_core::config::flags;

    let (mut ledger, _sink) = recorded(
        LedgerConfig::from_flags(flags::ACCOUNTING | flags::ISOLATE_CORRUPTION),
        1 << 16,
    );
    let ptr = ledger.allocate(8).expect("alloc");
    // SAFETY: first guard byte, inside the raw block.
    unsafe { ptr.as_ptr().add(8).write(0) };
    assert!(ledger.check_integrity().is_err());
    assert_eq!(ledger.isolated_count(), 1);
    let report = ledger.terminate();
    assert_eq!(report.isolated_releases, 1);
    assert!(!report.leaked());
}
