//! Shared fixtures: a simulated device/host pair behind an attached engine.

use std::sync::Arc;

use accel_mmu::device::{Device, DeviceConfig, FaultMode};
use accel_mmu::hal::DeviceCaps;
use accel_mmu::hal::sim::{SimBus, SimVm};
use accel_mmu::tlb::HUGE_PAGE_SIZE;

pub const HPID: i32 = 1000;

#[allow(dead_code)]
pub fn pinned_device() -> (Arc<Device>, Arc<SimBus>, Arc<SimVm>) {
    device_with(FaultMode::Pinned, DeviceCaps::STREAMS, 16, |_| {})
}

#[allow(dead_code)]
pub fn migrated_device() -> (Arc<Device>, Arc<SimBus>, Arc<SimVm>) {
    device_with(
        FaultMode::Migrated,
        DeviceCaps::CARD_MEM | DeviceCaps::STREAMS,
        16,
        |_| {},
    )
}

pub fn device_with(
    fault_mode: FaultMode,
    caps: DeviceCaps,
    fault_slots: usize,
    tweak: impl FnOnce(&mut DeviceConfig),
) -> (Arc<Device>, Arc<SimBus>, Arc<SimVm>) {
    let bus = Arc::new(SimBus::with_fault_slots(caps, fault_slots));
    let vm = Arc::new(SimVm::new());
    let mut cfg = DeviceConfig {
        fault_mode,
        card_chunk_bytes: 2 * HUGE_PAGE_SIZE,
        ..DeviceConfig::default()
    };
    tweak(&mut cfg);
    let dev = Device::attach(bus.clone(), vm.clone(), cfg).expect("attach");
    (dev, bus, vm)
}
