//! Device lifecycle and the client registry.

mod common;

use std::sync::Arc;
use std::time::Duration;

use accel_mmu::device::{Device, DeviceConfig, FaultMode};
use accel_mmu::hal::sim::{SimBus, SimVm};
use accel_mmu::hal::{DeviceCaps, Direction, FaultInfo, ResumeStatus};
use accel_mmu::tlb::BASE_PAGE_SIZE;
use accel_mmu::MmuError;
use common::{HPID, device_with, migrated_device, pinned_device};

#[test]
fn migrated_mode_requires_card_memory() {
    let bus = Arc::new(SimBus::new(DeviceCaps::STREAMS));
    let vm = Arc::new(SimVm::new());
    let cfg = DeviceConfig {
        fault_mode: FaultMode::Migrated,
        ..DeviceConfig::default()
    };
    assert!(matches!(
        Device::attach(bus, vm, cfg),
        Err(MmuError::Unsupported(_))
    ));
}

#[test]
fn client_slots_exhaust_and_recycle() {
    let (dev, _bus, _vm) = device_with(
        FaultMode::Pinned,
        DeviceCaps::STREAMS,
        16,
        |cfg| cfg.n_cpid_slots = 2,
    );

    let a = dev.register_client(100).unwrap();
    let b = dev.register_client(200).unwrap();
    assert_ne!(a, b);
    assert!(matches!(
        dev.register_client(300),
        Err(MmuError::OutOfMemory)
    ));

    dev.unregister_client(a).unwrap();
    let c = dev.register_client(300).unwrap();
    assert_eq!(c, a);

    assert!(matches!(
        dev.unregister_client(a + 100),
        Err(MmuError::InvalidClient(_))
    ));
}

#[test]
fn operations_with_stale_cpid_fail() {
    let (dev, _bus, vm) = pinned_device();
    vm.add_region(HPID, 0x1000, 0x10000, false);
    let cpid = dev.register_client(HPID).unwrap();
    dev.unregister_client(cpid).unwrap();

    assert!(matches!(
        dev.map_user(0x1000, 4096, cpid),
        Err(MmuError::InvalidClient(_))
    ));
}

#[test]
fn unregister_releases_buffers_and_dirties_pages() {
    let (dev, _bus, vm) = pinned_device();
    vm.add_region(HPID, 0x1000, 0x10000, false);
    let cpid = dev.register_client(HPID).unwrap();

    dev.map_user(0x1000, 2 * BASE_PAGE_SIZE, cpid).unwrap();
    dev.unregister_client(cpid).unwrap();

    assert_eq!(vm.pin_count(HPID, 1), 0);
    // accelerator may have written the buffer; unregister treats it as such
    assert!(vm.is_dirty(HPID, 1));
    assert_eq!(vm.notifier_count(HPID), 0);
}

#[test]
fn detach_unwinds_everything() {
    let (dev, bus, vm) = migrated_device();
    vm.add_region(HPID, 0x10_0000, 0x10_0000, false);
    let cpid = dev.register_client(HPID).unwrap();

    dev.map_user(0x10_0000, 2 * BASE_PAGE_SIZE, cpid).unwrap();
    dev.migrate_to_card(0x10_8000, 4 * BASE_PAGE_SIZE, cpid).unwrap();
    assert!(dev.card_stats().arenas > 0);

    dev.detach().unwrap();

    assert_eq!(vm.pin_count(HPID, 0x100), 0);
    assert_eq!(vm.notifier_count(HPID), 0);
    let stats = dev.card_stats();
    assert_eq!(stats.arenas, 0);
    assert_eq!(stats.live_records, 0);
    assert_eq!(stats.free_regular, 0);

    // a fault after detach cannot reach the worker: dropped, engine resumed
    bus.raise_fault(FaultInfo {
        vaddr: 0x10_0000,
        len: BASE_PAGE_SIZE,
        cpid,
        direction: Direction::ToCard,
        write: false,
    });
    assert_eq!(
        bus.wait_resume(Duration::from_secs(1)),
        Some((cpid, ResumeStatus::Dropped))
    );
}

#[test]
fn notify_subscription_is_per_client_and_replaceable() {
    let (dev, bus, _vm) = migrated_device();
    let cpid = dev.register_client(HPID).unwrap();

    let old = dev.subscribe_notify(cpid).unwrap();
    let new = dev.subscribe_notify(cpid).unwrap();
    bus.raise_notify(accel_mmu::NotifyInfo { cpid, value: 5 });

    assert_eq!(new.recv_timeout(Duration::from_secs(1)), Ok(5));
    assert!(old.try_recv().is_err());

    assert!(matches!(
        dev.subscribe_notify(99),
        Err(MmuError::InvalidClient(99))
    ));
}
