//! Migration backend: residency movement, record conservation, failure
//! atomicity, the CPU-fault return path.

mod common;

use accel_mmu::hal::{DeviceCaps, PageResidency};
use accel_mmu::tlb::{BASE_PAGE_SIZE, HUGE_PAGE_SIZE, TlbClass};
use accel_mmu::{FaultMode, MmuError};
use common::{HPID, device_with, migrated_device};

#[test]
fn card_round_trip_moves_residency_and_conserves_pages() {
    let (dev, bus, vm) = migrated_device();
    vm.add_region(HPID, 0x10_0000, 0x100_0000, false);
    let cpid = dev.register_client(HPID).unwrap();

    dev.migrate_to_card(0x10_0000, 64 * BASE_PAGE_SIZE, cpid).unwrap();

    let stats = dev.card_stats();
    assert_eq!(stats.live_records, 64);
    let total = stats.free_regular + stats.live_records;
    assert!(matches!(
        vm.residency(HPID, 0x100),
        PageResidency::Card { .. }
    ));
    assert_eq!(bus.map_descriptors(TlbClass::Regular), 64);
    assert_eq!(bus.unmap_descriptors(TlbClass::Regular), 64);

    dev.migrate_to_host(0x10_0000, 64 * BASE_PAGE_SIZE, cpid).unwrap();

    let stats = dev.card_stats();
    assert_eq!(stats.live_records, 0);
    // conservation: nothing leaked, nothing double-freed
    assert_eq!(stats.free_regular + stats.live_records, total);
    assert!(matches!(
        vm.residency(HPID, 0x100),
        PageResidency::Host { .. }
    ));

    // both directions leave the address-space reference balanced
    assert_eq!(vm.space_refs(HPID), 0);
}

#[test]
fn conservation_holds_across_many_calls() {
    let (dev, _bus, vm) = migrated_device();
    vm.add_region(HPID, 0x10_0000, 0x100_0000, false);
    let cpid = dev.register_client(HPID).unwrap();

    dev.migrate_to_card(0x10_0000, 8 * BASE_PAGE_SIZE, cpid).unwrap();
    let total = {
        let s = dev.card_stats();
        s.free_regular + s.live_records
    };

    for round in 0..5u32 {
        let off = 0x10_0000 + u64::from(round) * 0x2_0000;
        dev.migrate_to_card(off, 16 * BASE_PAGE_SIZE, cpid).unwrap();
        dev.migrate_to_host(off, 16 * BASE_PAGE_SIZE, cpid).unwrap();
        let s = dev.card_stats();
        assert_eq!(s.free_regular + s.live_records, total, "round {round}");
    }
}

#[test]
fn destination_shortfall_leaves_no_trace() {
    let (dev, bus, vm) = migrated_device();
    vm.add_region(HPID, 0x10_0000, 0x100_0000, false);
    let cpid = dev.register_client(HPID).unwrap();

    // one warm-up chunk, then starve the arena manager: page k of n fails
    dev.migrate_to_card(0x10_0000, 4 * BASE_PAGE_SIZE, cpid).unwrap();
    dev.migrate_to_host(0x10_0000, 4 * BASE_PAGE_SIZE, cpid).unwrap();
    let free_before = dev.card_stats().free_regular;
    vm.fail_next_arenas(100);

    // more pages than the free list holds forces a failing refill mid-range
    let n = free_before + 3;
    assert!(matches!(
        dev.migrate_to_card(0x10_0000, n * BASE_PAGE_SIZE, cpid),
        Err(MmuError::OutOfMemory)
    ));

    // residency restored, zero records, every obtained page back on the list
    assert_eq!(vm.moves_aborted(), 1);
    assert_eq!(dev.card_stats().live_records, 0);
    assert_eq!(dev.card_stats().free_regular, free_before);
    assert!(matches!(
        vm.residency(HPID, 0x100),
        PageResidency::Host { .. }
    ));
    assert!(!bus.pause_violation());
}

#[test]
fn huge_shortfall_scenario_second_of_two() {
    // 2 MiB-aligned huge region; allocator forced to fail on the second of
    // two destination pages
    let (dev, bus, vm) = device_with(
        FaultMode::Migrated,
        DeviceCaps::CARD_MEM | DeviceCaps::STREAMS,
        16,
        |cfg| cfg.card_chunk_bytes = HUGE_PAGE_SIZE,
    );
    let base = 8 * HUGE_PAGE_SIZE;
    vm.add_region(HPID, base, 8 * HUGE_PAGE_SIZE, true);
    let cpid = dev.register_client(HPID).unwrap();

    // each arena chunk yields one huge page; the second request dies
    vm.fail_arena_at(1);
    assert!(matches!(
        dev.migrate_to_card(base, 2 * HUGE_PAGE_SIZE, cpid),
        Err(MmuError::OutOfMemory)
    ));

    // the first destination went back to the free list, residency was
    // restored through the move primitive, and no record was created
    assert_eq!(dev.card_stats().free_huge, 1);
    assert_eq!(dev.card_stats().live_records, 0);
    assert_eq!(vm.moves_aborted(), 1);
    assert_eq!(bus.map_descriptors(TlbClass::Huge), 0);
    assert!(matches!(
        vm.residency(HPID, base >> 12),
        PageResidency::Host { .. }
    ));
}

#[test]
fn huge_migration_uses_group_descriptors() {
    let (dev, bus, vm) = migrated_device();
    let base = 4 * HUGE_PAGE_SIZE;
    vm.add_region(HPID, base, 8 * HUGE_PAGE_SIZE, true);
    let cpid = dev.register_client(HPID).unwrap();

    dev.migrate_to_card(base, 2 * HUGE_PAGE_SIZE, cpid).unwrap();
    assert_eq!(bus.unmap_descriptors(TlbClass::Huge), 2);
    assert_eq!(bus.map_descriptors(TlbClass::Huge), 2);
    assert_eq!(dev.card_stats().live_records, 2);

    dev.migrate_to_host(base, 2 * HUGE_PAGE_SIZE, cpid).unwrap();
    assert_eq!(dev.card_stats().live_records, 0);
}

#[test]
fn already_placed_units_are_skipped_not_retransferred() {
    let (dev, _bus, vm) = migrated_device();
    vm.add_region(HPID, 0x10_0000, 0x10_0000, false);
    let cpid = dev.register_client(HPID).unwrap();

    dev.migrate_to_card(0x10_0000, 4 * BASE_PAGE_SIZE, cpid).unwrap();
    let records = dev.card_stats().live_records;

    // second migrate of the same range: nothing movable, nothing allocated
    dev.migrate_to_card(0x10_0000, 4 * BASE_PAGE_SIZE, cpid).unwrap();
    assert_eq!(dev.card_stats().live_records, records);
}

#[test]
fn pinned_pages_do_not_migrate() {
    let (dev, _bus, vm) = migrated_device();
    vm.add_region(HPID, 0x10_0000, 0x10_0000, false);
    let cpid = dev.register_client(HPID).unwrap();

    // pin two pages through the pinning interface, then migrate across them
    dev.map_user(0x10_0000, 2 * BASE_PAGE_SIZE, cpid).unwrap();
    dev.migrate_to_card(0x10_0000, 4 * BASE_PAGE_SIZE, cpid).unwrap();

    // the pinned pages stayed host-resident; the rest moved
    assert!(matches!(
        vm.residency(HPID, 0x100),
        PageResidency::Host { .. }
    ));
    assert!(matches!(
        vm.residency(HPID, 0x102),
        PageResidency::Card { .. }
    ));
    assert_eq!(dev.card_stats().live_records, 2);
}

#[test]
fn cpu_touch_brings_a_unit_home() {
    let (dev, _bus, vm) = migrated_device();
    vm.add_region(HPID, 0x10_0000, 0x10_0000, false);
    let cpid = dev.register_client(HPID).unwrap();

    dev.migrate_to_card(0x10_0000, 4 * BASE_PAGE_SIZE, cpid).unwrap();
    assert!(matches!(
        vm.residency(HPID, 0x101),
        PageResidency::Card { .. }
    ));

    // host-side access faults the page back synchronously
    vm.touch(HPID, 0x10_1000).unwrap();
    assert!(matches!(
        vm.residency(HPID, 0x101),
        PageResidency::Host { .. }
    ));
    assert_eq!(dev.card_stats().live_records, 3);

    // the remaining pages still live on card
    assert!(matches!(
        vm.residency(HPID, 0x102),
        PageResidency::Card { .. }
    ));
}

#[test]
fn zero_length_migrate_is_a_noop() {
    let (dev, bus, vm) = migrated_device();
    vm.add_region(HPID, 0x10_0000, 0x10000, false);
    let cpid = dev.register_client(HPID).unwrap();

    dev.migrate_to_card(0x10_0000, 0, cpid).unwrap();
    assert_eq!(bus.map_descriptors(TlbClass::Regular), 0);
    assert_eq!(dev.card_stats().live_records, 0);
}

#[test]
fn migration_needs_card_memory() {
    let (dev, _bus, vm) = device_with(FaultMode::Pinned, DeviceCaps::STREAMS, 16, |_| {});
    vm.add_region(HPID, 0x10_0000, 0x10000, false);
    let cpid = dev.register_client(HPID).unwrap();

    assert!(matches!(
        dev.migrate_to_card(0x10_0000, 4096, cpid),
        Err(MmuError::Unsupported(_))
    ));
}

#[test]
fn unregister_client_frees_migrated_pages() {
    let (dev, _bus, vm) = migrated_device();
    vm.add_region(HPID, 0x10_0000, 0x10_0000, false);
    let cpid = dev.register_client(HPID).unwrap();

    dev.migrate_to_card(0x10_0000, 8 * BASE_PAGE_SIZE, cpid).unwrap();
    let s = dev.card_stats();
    let total = s.free_regular + s.live_records;
    assert_eq!(s.live_records, 8);

    dev.unregister_client(cpid).unwrap();
    let s = dev.card_stats();
    assert_eq!(s.live_records, 0);
    assert_eq!(s.free_regular, total);
}

#[test]
fn migrate_with_unknown_client_fails() {
    let (dev, _bus, vm) = migrated_device();
    vm.add_region(HPID, 0x10_0000, 0x10000, false);
    assert!(matches!(
        dev.migrate_to_card(0x10_0000, 4096, 7),
        Err(MmuError::InvalidClient(7))
    ));
}
