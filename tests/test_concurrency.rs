//! Serialization across concurrent callers: migrations on one device never
//! interleave their invalidate/transfer/remap windows.

mod common;

use std::sync::Arc;
use std::thread;

use accel_mmu::hal::sim::BusEvent;
use accel_mmu::tlb::BASE_PAGE_SIZE;
use common::{HPID, migrated_device};

#[test]
fn concurrent_migrations_never_interleave() {
    let (dev, bus, vm) = migrated_device();
    vm.add_region(HPID, 0x10_0000, 0x100_0000, false);
    let cpid = dev.register_client(HPID).unwrap();

    // overlapping ranges, opposite directions, many rounds
    let mut handles = Vec::new();
    for t in 0..2u32 {
        let dev = Arc::clone(&dev);
        handles.push(thread::spawn(move || {
            for round in 0..10 {
                let off = 0x10_0000 + u64::from(t) * 8 * BASE_PAGE_SIZE;
                let len = 16 * BASE_PAGE_SIZE;
                if (round + t) % 2 == 0 {
                    dev.migrate_to_card(off, len, cpid).unwrap();
                } else {
                    dev.migrate_to_host(off, len, cpid).unwrap();
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    // the walker pause flag must nest strictly per call
    assert!(!bus.pause_violation());
    let mut paused = false;
    for ev in bus.events() {
        if let BusEvent::WalkerPause(p) = ev {
            assert_ne!(p, paused, "pause/resume out of order");
            paused = p;
        }
    }
    assert!(!paused);
}

#[test]
fn conservation_survives_a_concurrent_storm() {
    let (dev, _bus, vm) = migrated_device();
    vm.add_region(HPID, 0x10_0000, 0x100_0000, false);
    let cpid = dev.register_client(HPID).unwrap();

    // prime the allocator so the total pool size is fixed
    dev.migrate_to_card(0x10_0000, 4 * BASE_PAGE_SIZE, cpid).unwrap();
    dev.migrate_to_host(0x10_0000, 4 * BASE_PAGE_SIZE, cpid).unwrap();
    let total = {
        let s = dev.card_stats();
        s.free_regular + s.live_records
    };

    let mut handles = Vec::new();
    for t in 0..4u64 {
        let dev = Arc::clone(&dev);
        handles.push(thread::spawn(move || {
            let off = 0x20_0000 + t * 0x4_0000;
            for _ in 0..5 {
                dev.migrate_to_card(off, 8 * BASE_PAGE_SIZE, cpid).unwrap();
                dev.migrate_to_host(off, 8 * BASE_PAGE_SIZE, cpid).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let s = dev.card_stats();
    assert_eq!(s.live_records, 0);
    assert_eq!(s.free_regular + s.live_records, total);
    assert_eq!(vm.space_refs(HPID), 0);
}

#[test]
fn concurrent_pin_and_unpin_stay_balanced() {
    let (dev, _bus, vm) = migrated_device();
    vm.add_region(HPID, 0x10_0000, 0x100_0000, false);
    let cpid = dev.register_client(HPID).unwrap();

    let mut handles = Vec::new();
    for t in 0..4u64 {
        let dev = Arc::clone(&dev);
        handles.push(thread::spawn(move || {
            let off = 0x10_0000 + t * 0x8_0000;
            for _ in 0..10 {
                dev.map_user(off, 8 * BASE_PAGE_SIZE, cpid).unwrap();
                dev.unmap_user(off, cpid, false).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    for t in 0..4u64 {
        let vpn = (0x10_0000 + t * 0x8_0000) >> 12;
        assert_eq!(vm.pin_count(HPID, vpn), 0);
    }
    assert_eq!(vm.notifier_count(HPID), 0);
}
