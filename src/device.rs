//! The per-accelerator context: owns the translation descriptors, the buffer
//! table, the card allocator, the serializing lock and the completion
//! rendezvous points, and exposes the public map/unmap/migrate interface
//! consumed by the transport layer.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};

use crate::error::{MmuError, MmuResult};
use crate::fault;
use crate::hal::{
    CpuFaultTarget, DeviceBus, DeviceCaps, Direction, FaultInfo, HostVm, IrqHandler, RangeNotifier,
};
use crate::mem::card::{CardAllocator, CardStats};
use crate::mem::table::BufferTable;
use crate::mem::{migrate, pin};
use crate::tlb::{self, TlbOrder};
use crate::utils::Completion;
use crate::{Cpid, Hpid};

/// How the deferred worker services device faults.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultMode {
    /// Faults pin host pages and install host translations.
    Pinned,
    /// Faults drive the migration state machine.
    Migrated,
}

#[derive(Clone, Debug)]
pub struct DeviceConfig {
    pub id: u32,
    pub fault_mode: FaultMode,
    /// Client id slots available on this device.
    pub n_cpid_slots: usize,
    /// Arena chunk requested from the host region manager when the card
    /// free list runs dry.
    pub card_chunk_bytes: u64,
    /// Deadline of the resident-retry loop on host-direction faults.
    pub resident_timeout: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: 0,
            fault_mode: FaultMode::Pinned,
            n_cpid_slots: 64,
            card_chunk_bytes: 16 * 1024 * 1024,
            resident_timeout: Duration::from_secs(1),
        }
    }
}

/// Client-id slots: a fixed pool with a free list and the cpid -> hpid
/// binding for the registration's lifetime.
pub(crate) struct CpidTable {
    slots: Vec<Option<Hpid>>,
    free: Vec<Cpid>,
}

impl CpidTable {
    fn new(n: usize) -> Self {
        Self {
            slots: vec![None; n],
            free: (0..n as Cpid).rev().collect(),
        }
    }

    fn register(&mut self, hpid: Hpid) -> MmuResult<Cpid> {
        let cpid = self.free.pop().ok_or(MmuError::OutOfMemory)?;
        self.slots[cpid as usize] = Some(hpid);
        Ok(cpid)
    }

    fn unregister(&mut self, cpid: Cpid) -> MmuResult<Hpid> {
        let slot = self
            .slots
            .get_mut(cpid as usize)
            .ok_or(MmuError::InvalidClient(cpid))?;
        let hpid = slot.take().ok_or(MmuError::InvalidClient(cpid))?;
        self.free.push(cpid);
        Ok(hpid)
    }

    pub(crate) fn hpid_of(&self, cpid: Cpid) -> MmuResult<Hpid> {
        self.slots
            .get(cpid as usize)
            .copied()
            .flatten()
            .ok_or(MmuError::InvalidClient(cpid))
    }

    fn hpid_registered(&self, hpid: Hpid) -> bool {
        self.slots.iter().flatten().any(|h| *h == hpid)
    }
}

pub(crate) struct NotifierReg {
    pub id: u64,
    /// One reference per registered buffer of this hpid.
    pub refs: usize,
    /// Held open by migration state until the pid's last client leaves.
    pub sticky: bool,
}

/// Everything guarded by the per-device serializing lock.
pub(crate) struct MmuState {
    pub table: BufferTable,
    pub notifiers: HashMap<Hpid, NotifierReg>,
}

pub struct Device {
    pub(crate) cfg: DeviceConfig,
    pub(crate) caps: DeviceCaps,
    pub(crate) bus: Arc<dyn DeviceBus>,
    pub(crate) vm: Arc<dyn HostVm>,

    pub(crate) tlb_regular: TlbOrder,
    pub(crate) tlb_huge: TlbOrder,

    /// Serializing lock: every mutation of the buffer table and device
    /// translations happens under it.
    pub(crate) mmu: Mutex<MmuState>,
    pub(crate) card: Mutex<CardAllocator>,
    pub(crate) cpids: Mutex<CpidTable>,

    /// One lock per DMA direction, held only across a kick + completion.
    pub(crate) offload_lock: Mutex<()>,
    pub(crate) sync_lock: Mutex<()>,
    pub(crate) ev_offload: Completion,
    pub(crate) ev_sync: Completion,
    pub(crate) ev_invldt: Completion,

    pub(crate) notify_subs: Mutex<HashMap<Cpid, mpsc::Sender<i32>>>,
    pub(crate) fault_tx: Mutex<Option<SyncSender<FaultInfo>>>,
    pub(crate) worker: Mutex<Option<JoinHandle<()>>>,
    pub(crate) self_ref: Weak<Device>,
}

impl Device {
    /// Brings the engine up on one accelerator instance: probes
    /// capabilities, wires the interrupt line and starts the deferred
    /// worker.
    ///
    /// # Errors
    /// Fails when the configuration asks for migration on a device without
    /// card memory, or when the worker thread cannot be spawned.
    pub fn attach(
        bus: Arc<dyn DeviceBus>,
        vm: Arc<dyn HostVm>,
        cfg: DeviceConfig,
    ) -> MmuResult<Arc<Self>> {
        let caps = bus.caps();
        if cfg.fault_mode == FaultMode::Migrated && !caps.contains(DeviceCaps::CARD_MEM) {
            return Err(MmuError::Unsupported(
                "migrated fault mode requires card memory",
            ));
        }
        let host_page = crate::utils::host_page_size();
        if host_page != tlb::BASE_PAGE_SIZE {
            warn!(
                "host page size {host_page} differs from device base page {}",
                tlb::BASE_PAGE_SIZE
            );
        }

        let (tx, rx) = mpsc::sync_channel(bus.fault_slots());
        let card = CardAllocator::new(cfg.id, cfg.card_chunk_bytes);
        let cpid_slots = cfg.n_cpid_slots;

        let dev = Arc::new_cyclic(|weak: &Weak<Device>| Device {
            caps,
            bus: bus.clone(),
            vm,
            tlb_regular: TlbOrder::regular(),
            tlb_huge: TlbOrder::huge(),
            mmu: Mutex::new(MmuState {
                table: BufferTable::new(),
                notifiers: HashMap::new(),
            }),
            card: Mutex::new(card),
            cpids: Mutex::new(CpidTable::new(cpid_slots)),
            offload_lock: Mutex::new(()),
            sync_lock: Mutex::new(()),
            ev_offload: Completion::new(),
            ev_sync: Completion::new(),
            ev_invldt: Completion::new(),
            notify_subs: Mutex::new(HashMap::new()),
            fault_tx: Mutex::new(Some(tx)),
            worker: Mutex::new(None),
            self_ref: weak.clone(),
            cfg,
        });

        let fault_target: Weak<dyn CpuFaultTarget> = dev.self_ref.clone();
        dev.card.lock().unwrap().connect_fault_target(fault_target);

        let irq: Weak<dyn IrqHandler> = dev.self_ref.clone();
        bus.connect_irq(irq);

        let worker_dev = dev.clone();
        let handle = thread::Builder::new()
            .name(format!("accel-mmu{}", dev.cfg.id))
            .spawn(move || fault::worker_loop(worker_dev, rx))?;
        *dev.worker.lock().unwrap() = Some(handle);

        debug!("device {} attached, caps {caps:?}", dev.cfg.id);
        Ok(dev)
    }

    /// Tears the engine down: releases every mapping, stops the deferred
    /// worker and returns the card arenas.
    ///
    /// # Errors
    /// Propagates a failed bulk release; the worker is stopped regardless.
    pub fn detach(&self) -> MmuResult<()> {
        let res = {
            let mut state = self.mmu.lock().unwrap();
            let res = pin::release_all(self, &mut state, None, false);
            for (hpid, reg) in state.notifiers.drain() {
                self.vm.unregister_notifier(hpid, reg.id);
            }
            res
        };

        *self.fault_tx.lock().unwrap() = None;
        if let Some(handle) = self.worker.lock().unwrap().take() {
            if handle.join().is_err() {
                warn!("fault worker for device {} panicked", self.cfg.id);
            }
        }

        self.card.lock().unwrap().teardown(self.vm.as_ref());
        debug!("device {} detached", self.cfg.id);
        res
    }

    // =======================================================================
    // Client registry
    // =======================================================================

    /// Binds a client slot to a registering host process.
    ///
    /// # Errors
    /// [`MmuError::OutOfMemory`] when every slot is taken.
    pub fn register_client(&self, hpid: Hpid) -> MmuResult<Cpid> {
        let cpid = self.cpids.lock().unwrap().register(hpid)?;
        debug!("registered hpid {hpid} as cpid {cpid}");
        Ok(cpid)
    }

    /// Invalidates a client id, bulk-releasing its mappings and migrated
    /// pages first.
    pub fn unregister_client(&self, cpid: Cpid) -> MmuResult<()> {
        {
            let mut state = self.mmu.lock().unwrap();
            pin::release_all(self, &mut state, Some(cpid), true)?;
        }
        self.notify_subs.lock().unwrap().remove(&cpid);
        let hpid = self.cpids.lock().unwrap().unregister(cpid)?;

        let mut state = self.mmu.lock().unwrap();
        self.gc_sticky_notifier(&mut state, hpid);
        debug!("unregistered cpid {cpid}");
        Ok(())
    }

    // =======================================================================
    // Mapping and migration interface
    // =======================================================================

    /// Pins `[vaddr, vaddr + len)` of the client's process and installs
    /// device translations for it.
    pub fn map_user(&self, vaddr: u64, len: u64, cpid: Cpid) -> MmuResult<()> {
        let hpid = self.cpids.lock().unwrap().hpid_of(cpid)?;
        let mut state = self.mmu.lock().unwrap();
        pin::map_user(self, &mut state, vaddr, len, cpid, hpid)
    }

    /// Releases the buffer registered at exactly (vaddr, cpid).
    pub fn unmap_user(&self, vaddr: u64, cpid: Cpid, dirty: bool) -> MmuResult<()> {
        self.cpids.lock().unwrap().hpid_of(cpid)?;
        let mut state = self.mmu.lock().unwrap();
        pin::unmap_user(self, &mut state, vaddr, cpid, dirty)
    }

    /// Releases every buffer of one client, or of all clients when `cpid`
    /// is `None`. A client without buffers is a successful no-op.
    pub fn release_all(&self, cpid: Option<Cpid>, dirty: bool) -> MmuResult<()> {
        let mut state = self.mmu.lock().unwrap();
        pin::release_all(self, &mut state, cpid, dirty)
    }

    /// Moves the covered range into card memory and repoints the device
    /// table at it.
    pub fn migrate_to_card(&self, vaddr: u64, len: u64, cpid: Cpid) -> MmuResult<()> {
        self.require_card()?;
        let hpid = self.cpids.lock().unwrap().hpid_of(cpid)?;
        let mut state = self.mmu.lock().unwrap();
        migrate::migrate_user(self, &mut state, vaddr, len, cpid, hpid, Direction::ToCard)
    }

    /// Moves the covered range back into host memory.
    pub fn migrate_to_host(&self, vaddr: u64, len: u64, cpid: Cpid) -> MmuResult<()> {
        self.require_card()?;
        let hpid = self.cpids.lock().unwrap().hpid_of(cpid)?;
        let mut state = self.mmu.lock().unwrap();
        migrate::migrate_user(self, &mut state, vaddr, len, cpid, hpid, Direction::ToHost)
    }

    /// Subscribes to device-raised notifications for a client. The previous
    /// subscription of the same client, if any, is replaced.
    pub fn subscribe_notify(&self, cpid: Cpid) -> MmuResult<Receiver<i32>> {
        self.cpids.lock().unwrap().hpid_of(cpid)?;
        let (tx, rx) = mpsc::channel();
        self.notify_subs.lock().unwrap().insert(cpid, tx);
        Ok(rx)
    }

    #[must_use]
    pub fn caps(&self) -> DeviceCaps {
        self.caps
    }

    /// Allocator counters (free pages, live migrated-page records).
    #[must_use]
    pub fn card_stats(&self) -> CardStats {
        self.card.lock().unwrap().stats()
    }

    // =======================================================================
    // Internals shared by the backends
    // =======================================================================

    pub(crate) fn order_for(&self, huge: bool) -> &TlbOrder {
        if huge { &self.tlb_huge } else { &self.tlb_regular }
    }

    fn require_card(&self) -> MmuResult<()> {
        if self.caps.contains(DeviceCaps::CARD_MEM) {
            Ok(())
        } else {
            Err(MmuError::Unsupported("device has no card memory"))
        }
    }

    /// Pushes unmap descriptors for a page run, one per granularity unit.
    pub(crate) fn tlb_unmap_range(&self, ord: &TlbOrder, vpn: u64, n_pages: u64, hpid: Hpid) {
        let step = ord.pages_per_entry();
        let mut entries = Vec::with_capacity((n_pages / step) as usize);
        let mut v = vpn;
        while v < vpn + n_pages {
            entries.push(tlb::create_unmap_entry(ord, v, hpid));
            v += step;
        }
        tlb::service_device(self.bus.as_ref(), ord, &entries);
    }

    /// Posts invalidation commands for a page run; the command covering the
    /// final unit carries the last marker so the device acks once.
    pub(crate) fn tlb_invalidate_range(&self, ord: &TlbOrder, vpn: u64, n_pages: u64, hpid: Hpid) {
        let step = ord.pages_per_entry();
        let mut v = vpn;
        while v < vpn + n_pages {
            let last = v + step >= vpn + n_pages;
            self.bus.post_invalidate(v, step, hpid, last);
            v += step;
        }
    }

    /// Takes a per-buffer reference on the pid's invalidation notifier,
    /// registering it on first use.
    pub(crate) fn ensure_notifier(&self, state: &mut MmuState, hpid: Hpid) -> MmuResult<()> {
        if let Some(reg) = state.notifiers.get_mut(&hpid) {
            reg.refs += 1;
            return Ok(());
        }
        let id = self.register_range_notifier(hpid)?;
        state.notifiers.insert(
            hpid,
            NotifierReg {
                id,
                refs: 1,
                sticky: false,
            },
        );
        Ok(())
    }

    /// Drops a per-buffer reference; the notifier goes away with the pid's
    /// last mapping unless migration state still needs it.
    pub(crate) fn drop_notifier_ref(&self, state: &mut MmuState, hpid: Hpid) {
        let remove = match state.notifiers.get_mut(&hpid) {
            Some(reg) => {
                reg.refs = reg.refs.saturating_sub(1);
                reg.refs == 0 && !reg.sticky
            }
            None => false,
        };
        if remove {
            if let Some(reg) = state.notifiers.remove(&hpid) {
                self.vm.unregister_notifier(hpid, reg.id);
            }
        }
    }

    /// Keeps the pid's notifier alive for as long as the pid has any client
    /// registered; migrated ranges have no buffer to hold a reference.
    pub(crate) fn ensure_sticky_notifier(&self, state: &mut MmuState, hpid: Hpid) -> MmuResult<()> {
        if let Some(reg) = state.notifiers.get_mut(&hpid) {
            reg.sticky = true;
            return Ok(());
        }
        let id = self.register_range_notifier(hpid)?;
        state.notifiers.insert(
            hpid,
            NotifierReg {
                id,
                refs: 0,
                sticky: true,
            },
        );
        Ok(())
    }

    /// Clears a sticky notifier once the pid's last client is gone.
    fn gc_sticky_notifier(&self, state: &mut MmuState, hpid: Hpid) {
        if self.cpids.lock().unwrap().hpid_registered(hpid) {
            return;
        }
        let remove = matches!(
            state.notifiers.get(&hpid),
            Some(reg) if reg.sticky && reg.refs == 0
        );
        if remove {
            if let Some(reg) = state.notifiers.remove(&hpid) {
                self.vm.unregister_notifier(hpid, reg.id);
            }
        }
    }

    fn register_range_notifier(&self, hpid: Hpid) -> MmuResult<u64> {
        let notifier = Arc::new(DeviceNotifier {
            dev: self.self_ref.clone(),
            hpid,
        });
        self.vm.register_notifier(hpid, notifier)
    }
}

impl CpuFaultTarget for Device {
    fn migrate_to_ram(&self, hpid: Hpid, vaddr: u64) -> MmuResult<()> {
        migrate::cpu_migrate_to_ram(self, hpid, vaddr)
    }
}

/// The per-pid invalidation callback handed to the host VM subsystem.
struct DeviceNotifier {
    dev: Weak<Device>,
    hpid: Hpid,
}

impl RangeNotifier for DeviceNotifier {
    fn invalidate(&self, start: u64, end: u64, owner: Option<u32>, blockable: bool) -> bool {
        let Some(dev) = self.dev.upgrade() else {
            return true;
        };

        // our own commit step tags its callbacks; reacting would recurse
        if owner == Some(dev.cfg.id) {
            return true;
        }

        let _state = if blockable {
            dev.mmu.lock().unwrap()
        } else {
            match dev.mmu.try_lock() {
                Ok(guard) => guard,
                Err(_) => return false,
            }
        };

        let huge = dev
            .vm
            .find_region(self.hpid, start)
            .map(|r| r.huge)
            .unwrap_or(false);
        let ord = dev.order_for(huge);
        let len = end.saturating_sub(start).max(1);
        let Some((vpn, n_pages)) = ord.span(start, len) else {
            return true;
        };

        debug!(
            "notifier invalidate [{start:#x}, {end:#x}), hpid {}, huge {huge}",
            self.hpid
        );
        {
            let _pause = tlb::WalkerPause::new(dev.bus.as_ref());
            dev.tlb_unmap_range(ord, vpn, n_pages, self.hpid);
            dev.tlb_invalidate_range(ord, vpn, n_pages, self.hpid);
            dev.ev_invldt.wait();
        }
        true
    }
}
