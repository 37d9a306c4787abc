//! Software stand-ins for the accelerator bus and the host virtual-memory
//! subsystem. Completions are acknowledged inline, so every engine code path
//! runs unmodified against plain memory; the bus additionally keeps an event
//! log the tests use to observe descriptor traffic and walker pausing.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use log::debug;

use super::{
    CpuFaultTarget, DeviceBus, DeviceCaps, FaultInfo, HostPage, HostVm, IrqClass, IrqHandler,
    MoveDest, MovePage, MoveSelect, MoveTicket, NotifyInfo, PageResidency, RangeNotifier,
    RegionInfo, ResumeStatus,
};
use crate::error::{MmuError, MmuResult};
use crate::tlb::{
    BASE_PAGE_SHIFT, BASE_PAGE_SIZE, HUGE_PAGE_SIZE, PAGES_IN_HUGE, TlbClass, TlbEntry, TlbOrder,
};
use crate::utils::align_up;
use crate::{Cpid, Hpid};

/// First physical address of the simulated card window; far above anything
/// the host-frame bump allocator will hand out.
const CARD_WINDOW_BASE: u64 = 0x40_0000_0000;

/// Everything the simulated device observed, in order.
#[derive(Clone, Debug)]
pub enum BusEvent {
    Push {
        class: TlbClass,
        maps: usize,
        unmaps: usize,
    },
    Doorbell(TlbClass),
    WalkerPause(bool),
    Invalidate {
        vpn: u64,
        n_pages: u64,
        last: bool,
    },
    DmaOffload {
        n: usize,
    },
    DmaSync {
        n: usize,
    },
    Resume {
        cpid: Cpid,
        status: ResumeStatus,
    },
}

#[derive(Default)]
struct BusState {
    irq_queue: VecDeque<IrqClass>,
    fault_regs: VecDeque<FaultInfo>,
    notify_regs: VecDeque<NotifyInfo>,
    events: Vec<BusEvent>,
    pause_depth: i32,
    pause_violation: bool,
    resumes: VecDeque<(Cpid, ResumeStatus)>,
}

/// Register-level simulation of one accelerator.
pub struct SimBus {
    caps: DeviceCaps,
    fault_slots: usize,
    regular: TlbOrder,
    huge: TlbOrder,
    state: Mutex<BusState>,
    resume_cond: Condvar,
    handler: Mutex<Option<Weak<dyn IrqHandler>>>,
}

impl SimBus {
    #[must_use]
    pub fn new(caps: DeviceCaps) -> Self {
        Self::with_fault_slots(caps, 16)
    }

    #[must_use]
    pub fn with_fault_slots(caps: DeviceCaps, fault_slots: usize) -> Self {
        Self {
            caps,
            fault_slots,
            regular: TlbOrder::regular(),
            huge: TlbOrder::huge(),
            state: Mutex::new(BusState::default()),
            resume_cond: Condvar::new(),
            handler: Mutex::new(None),
        }
    }

    fn raise(&self, class: IrqClass) {
        self.state.lock().unwrap().irq_queue.push_back(class);
        let handler = self.handler.lock().unwrap().clone();
        if let Some(h) = handler.and_then(|w| w.upgrade()) {
            h.irq();
        }
    }

    /// Injects a translation fault as the hardware would raise it.
    pub fn raise_fault(&self, fault: FaultInfo) {
        self.state.lock().unwrap().fault_regs.push_back(fault);
        self.raise(IrqClass::PageFault);
    }

    /// Injects a user notification interrupt.
    pub fn raise_notify(&self, notify: NotifyInfo) {
        self.state.lock().unwrap().notify_regs.push_back(notify);
        self.raise(IrqClass::Notify);
    }

    /// Snapshot of the event log.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn events(&self) -> Vec<BusEvent> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().unwrap().events.clear();
    }

    /// Total map descriptors pushed for a table class.
    #[must_use]
    pub fn map_descriptors(&self, class: TlbClass) -> usize {
        self.state
            .lock()
            .unwrap()
            .events
            .iter()
            .map(|e| match e {
                BusEvent::Push { class: c, maps, .. } if *c == class => *maps,
                _ => 0,
            })
            .sum()
    }

    /// Total unmap descriptors pushed for a table class.
    #[must_use]
    pub fn unmap_descriptors(&self, class: TlbClass) -> usize {
        self.state
            .lock()
            .unwrap()
            .events
            .iter()
            .map(|e| match e {
                BusEvent::Push {
                    class: c, unmaps, ..
                } if *c == class => *unmaps,
                _ => 0,
            })
            .sum()
    }

    /// True when a pause/resume pair was ever unbalanced or nested.
    #[must_use]
    pub fn pause_violation(&self) -> bool {
        self.state.lock().unwrap().pause_violation
    }

    /// Blocks until a stalled engine is resumed, or the timeout elapses.
    pub fn wait_resume(&self, timeout: Duration) -> Option<(Cpid, ResumeStatus)> {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock().unwrap();
        loop {
            if let Some(r) = st.resumes.pop_front() {
                return Some(r);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .resume_cond
                .wait_timeout(st, deadline - now)
                .unwrap();
            st = guard;
        }
    }
}

impl DeviceBus for SimBus {
    fn connect_irq(&self, handler: Weak<dyn IrqHandler>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    fn caps(&self) -> DeviceCaps {
        self.caps
    }

    fn fault_slots(&self) -> usize {
        self.fault_slots
    }

    fn read_irq_class(&self) -> Option<IrqClass> {
        self.state.lock().unwrap().irq_queue.pop_front()
    }

    fn clear_irq(&self) {}

    fn read_fault(&self) -> FaultInfo {
        self.state
            .lock()
            .unwrap()
            .fault_regs
            .pop_front()
            .expect("fault register read without a pending fault")
    }

    fn read_notify(&self) -> NotifyInfo {
        self.state
            .lock()
            .unwrap()
            .notify_regs
            .pop_front()
            .expect("notify register read without a pending notification")
    }

    fn push_entries(&self, class: TlbClass, entries: &[TlbEntry]) {
        let ord = match class {
            TlbClass::Regular => &self.regular,
            TlbClass::Huge => &self.huge,
        };
        let maps = entries.iter().filter(|e| e.is_map(ord)).count();
        self.state.lock().unwrap().events.push(BusEvent::Push {
            class,
            maps,
            unmaps: entries.len() - maps,
        });
    }

    fn ring_doorbell(&self, class: TlbClass) {
        self.state
            .lock()
            .unwrap()
            .events
            .push(BusEvent::Doorbell(class));
    }

    fn set_walker_paused(&self, paused: bool) {
        let mut st = self.state.lock().unwrap();
        st.pause_depth += if paused { 1 } else { -1 };
        if st.pause_depth != i32::from(paused) {
            st.pause_violation = true;
        }
        st.events.push(BusEvent::WalkerPause(paused));
    }

    fn post_invalidate(&self, vpn: u64, n_pages: u64, _hpid: Hpid, last: bool) {
        self.state.lock().unwrap().events.push(BusEvent::Invalidate {
            vpn,
            n_pages,
            last,
        });
        if last {
            self.raise(IrqClass::InvalidateDone);
        }
    }

    fn dma_offload(&self, host: &[u64], card: &[u64], _len: u64) {
        debug_assert_eq!(host.len(), card.len());
        self.state
            .lock()
            .unwrap()
            .events
            .push(BusEvent::DmaOffload { n: host.len() });
        self.raise(IrqClass::OffloadDone);
    }

    fn dma_sync(&self, host: &[u64], card: &[u64], _len: u64) {
        debug_assert_eq!(host.len(), card.len());
        self.state
            .lock()
            .unwrap()
            .events
            .push(BusEvent::DmaSync { n: host.len() });
        self.raise(IrqClass::SyncDone);
    }

    fn resume_engine(&self, cpid: Cpid, _write: bool, status: ResumeStatus) {
        let mut st = self.state.lock().unwrap();
        st.events.push(BusEvent::Resume { cpid, status });
        st.resumes.push_back((cpid, status));
        self.resume_cond.notify_all();
    }
}

#[derive(Clone, Copy, Debug)]
enum PageState {
    Host { phys: u64, pins: u32, dirty: bool },
    Card { addr: u64, owner: u32 },
}

#[derive(Default)]
struct VmState {
    regions: HashMap<Hpid, Vec<RegionInfo>>,
    pages: HashMap<(Hpid, u64), PageState>,
    next_phys: u64,
    next_arena: u64,
    arenas: Vec<(u64, u64)>,
    seqs: HashMap<Hpid, u64>,
    space_refs: HashMap<Hpid, i32>,
    notifiers: HashMap<u64, (Hpid, Arc<dyn RangeNotifier>)>,
    next_notifier_id: u64,
    fault_targets: HashMap<u32, Weak<dyn CpuFaultTarget>>,
    flushes: u64,

    // failure injection
    pin_fail_at: Option<u32>,
    arena_fails: u32,
    arena_fail_at: Option<u32>,
    host_alloc_fail_at: Option<u32>,
    busy_faults: u32,
    seq_bumps: u32,

    moves_committed: u32,
    moves_aborted: u32,
}

/// Simulated host virtual-memory subsystem: a handful of fake processes with
/// page tables over a bump-allocated physical space.
pub struct SimVm {
    state: Mutex<VmState>,
}

impl Default for SimVm {
    fn default() -> Self {
        Self::new()
    }
}

impl SimVm {
    #[must_use]
    pub fn new() -> Self {
        let mut st = VmState::default();
        st.next_phys = 0x10_0000;
        st.next_arena = CARD_WINDOW_BASE;
        Self {
            state: Mutex::new(st),
        }
    }

    /// Declares an address-space region of a fake process.
    pub fn add_region(&self, hpid: Hpid, base: u64, len: u64, huge: bool) {
        self.state
            .lock()
            .unwrap()
            .regions
            .entry(hpid)
            .or_default()
            .push(RegionInfo { base, len, huge });
    }

    /// Makes the k-th upcoming pin fail (0 = the very next one).
    pub fn fail_pin_at(&self, k: u32) {
        self.state.lock().unwrap().pin_fail_at = Some(k);
    }

    /// Fails the next `n` arena requests.
    pub fn fail_next_arenas(&self, n: u32) {
        self.state.lock().unwrap().arena_fails = n;
    }

    /// Makes the k-th upcoming arena request fail (0 = the very next one).
    pub fn fail_arena_at(&self, k: u32) {
        self.state.lock().unwrap().arena_fail_at = Some(k);
    }

    /// Makes the k-th upcoming host-page allocation fail.
    pub fn fail_host_alloc_at(&self, k: u32) {
        self.state.lock().unwrap().host_alloc_fail_at = Some(k);
    }

    /// Makes the next `n` fault-in calls report transient busy.
    pub fn set_busy_faults(&self, n: u32) {
        self.state.lock().unwrap().busy_faults = n;
    }

    /// Bumps the notifier sequence during the next `n` fault-in calls,
    /// mimicking a concurrently changing address space.
    pub fn set_seq_bumps(&self, n: u32) {
        self.state.lock().unwrap().seq_bumps = n;
    }

    /// Current backing of a page, for assertions.
    #[must_use]
    pub fn residency(&self, hpid: Hpid, vpn: u64) -> PageResidency {
        match self.state.lock().unwrap().pages.get(&(hpid, vpn)) {
            Some(PageState::Host { phys, pins, .. }) => PageResidency::Host {
                phys: *phys,
                movable: *pins == 0,
            },
            Some(PageState::Card { addr, owner }) => PageResidency::Card {
                addr: *addr,
                owner: *owner,
                movable: true,
            },
            None => PageResidency::Absent,
        }
    }

    #[must_use]
    pub fn pin_count(&self, hpid: Hpid, vpn: u64) -> u32 {
        match self.state.lock().unwrap().pages.get(&(hpid, vpn)) {
            Some(PageState::Host { pins, .. }) => *pins,
            _ => 0,
        }
    }

    #[must_use]
    pub fn is_dirty(&self, hpid: Hpid, vpn: u64) -> bool {
        matches!(
            self.state.lock().unwrap().pages.get(&(hpid, vpn)),
            Some(PageState::Host { dirty: true, .. })
        )
    }

    #[must_use]
    pub fn moves_committed(&self) -> u32 {
        self.state.lock().unwrap().moves_committed
    }

    #[must_use]
    pub fn moves_aborted(&self) -> u32 {
        self.state.lock().unwrap().moves_aborted
    }

    #[must_use]
    pub fn flush_count(&self) -> u64 {
        self.state.lock().unwrap().flushes
    }

    #[must_use]
    pub fn space_refs(&self, hpid: Hpid) -> i32 {
        *self
            .state
            .lock()
            .unwrap()
            .space_refs
            .get(&hpid)
            .unwrap_or(&0)
    }

    #[must_use]
    pub fn notifier_count(&self, hpid: Hpid) -> usize {
        self.state
            .lock()
            .unwrap()
            .notifiers
            .values()
            .filter(|(h, _)| *h == hpid)
            .count()
    }

    /// Drives every notifier registered for `hpid` the way the kernel would
    /// on an address-space change, returning each callback's verdict.
    pub fn fire_invalidate(
        &self,
        hpid: Hpid,
        start: u64,
        end: u64,
        owner: Option<u32>,
        blockable: bool,
    ) -> Vec<bool> {
        let notifiers: Vec<Arc<dyn RangeNotifier>> = self
            .state
            .lock()
            .unwrap()
            .notifiers
            .values()
            .filter(|(h, _)| *h == hpid)
            .map(|(_, n)| n.clone())
            .collect();
        notifiers
            .iter()
            .map(|n| n.invalidate(start, end, owner, blockable))
            .collect()
    }

    /// Simulates the CPU touching an address: device-private pages bounce
    /// through the registered fault target before the access can complete.
    /// Returns the final host physical address.
    pub fn touch(&self, hpid: Hpid, vaddr: u64) -> MmuResult<u64> {
        let vpn = vaddr >> BASE_PAGE_SHIFT;
        loop {
            let target = {
                let mut st = self.state.lock().unwrap();
                match st.pages.get(&(hpid, vpn)).copied() {
                    Some(PageState::Host { phys, .. }) => return Ok(phys),
                    Some(PageState::Card { owner, .. }) => lookup_target(&st, owner)?,
                    None => {
                        let region = find_region_locked(&st, hpid, vaddr)?;
                        populate(&mut st, hpid, region, vpn);
                        continue;
                    }
                }
            };
            target.migrate_to_ram(hpid, vaddr)?;
            let st = self.state.lock().unwrap();
            match st.pages.get(&(hpid, vpn)) {
                Some(PageState::Host { phys, .. }) => return Ok(*phys),
                _ => return Err(MmuError::Invariant("page still device-private after fault")),
            }
        }
    }
}

fn lookup_target(st: &VmState, owner: u32) -> MmuResult<Arc<dyn CpuFaultTarget>> {
    st.fault_targets
        .get(&owner)
        .and_then(Weak::upgrade)
        .ok_or(MmuError::Invariant("no fault target for device-private page"))
}

fn find_region_locked(st: &VmState, hpid: Hpid, vaddr: u64) -> MmuResult<RegionInfo> {
    st.regions
        .get(&hpid)
        .and_then(|rs| {
            rs.iter()
                .find(|r| vaddr >= r.base && vaddr < r.base + r.len)
                .copied()
        })
        .ok_or(MmuError::NotMapped)
}

/// Populates one page (or, in a huge region, its whole physically contiguous
/// group) with fresh host frames.
fn populate(st: &mut VmState, hpid: Hpid, region: RegionInfo, vpn: u64) {
    if st.pages.contains_key(&(hpid, vpn)) {
        return;
    }
    if region.huge {
        let first = vpn & !(PAGES_IN_HUGE - 1);
        let base = align_up(st.next_phys, HUGE_PAGE_SIZE);
        st.next_phys = base + HUGE_PAGE_SIZE;
        for i in 0..PAGES_IN_HUGE {
            st.pages.entry((hpid, first + i)).or_insert(PageState::Host {
                phys: base + i * BASE_PAGE_SIZE,
                pins: 0,
                dirty: false,
            });
        }
    } else {
        let phys = st.next_phys;
        st.next_phys += BASE_PAGE_SIZE;
        st.pages.insert(
            (hpid, vpn),
            PageState::Host {
                phys,
                pins: 0,
                dirty: false,
            },
        );
    }
}

impl HostVm for SimVm {
    fn find_region(&self, hpid: Hpid, vaddr: u64) -> MmuResult<RegionInfo> {
        find_region_locked(&self.state.lock().unwrap(), hpid, vaddr)
    }

    fn acquire_space(&self, hpid: Hpid) -> MmuResult<()> {
        *self
            .state
            .lock()
            .unwrap()
            .space_refs
            .entry(hpid)
            .or_insert(0) += 1;
        Ok(())
    }

    fn release_space(&self, hpid: Hpid) {
        if let Some(r) = self.state.lock().unwrap().space_refs.get_mut(&hpid) {
            *r -= 1;
        }
    }

    fn notifier_seq(&self, hpid: Hpid) -> u64 {
        *self.state.lock().unwrap().seqs.get(&hpid).unwrap_or(&0)
    }

    fn pin_page(&self, hpid: Hpid, vaddr: u64) -> MmuResult<HostPage> {
        let vpn = vaddr >> BASE_PAGE_SHIFT;
        loop {
            let target = {
                let mut st = self.state.lock().unwrap();
                match st.pages.get(&(hpid, vpn)).copied() {
                    Some(PageState::Host { .. }) => {
                        // the injected shortfall counts real pin attempts only
                        match st.pin_fail_at {
                            Some(0) => {
                                st.pin_fail_at = None;
                                return Err(MmuError::OutOfMemory);
                            }
                            Some(ref mut k) => *k -= 1,
                            None => {}
                        }
                        match st.pages.get_mut(&(hpid, vpn)) {
                            Some(PageState::Host { phys, pins, .. }) => {
                                *pins += 1;
                                return Ok(HostPage {
                                    hpid,
                                    vpn,
                                    phys: *phys,
                                });
                            }
                            _ => return Err(MmuError::Invariant("page vanished under lock")),
                        }
                    }
                    Some(PageState::Card { owner, .. }) => lookup_target(&st, owner)?,
                    None => {
                        let region = find_region_locked(&st, hpid, vaddr)?;
                        populate(&mut st, hpid, region, vpn);
                        continue;
                    }
                }
            };
            // device-private page: fault it back before pinning
            target.migrate_to_ram(hpid, vaddr)?;
        }
    }

    fn unpin_page(&self, page: HostPage, dirty: bool) {
        let mut st = self.state.lock().unwrap();
        if let Some(PageState::Host {
            pins, dirty: d, ..
        }) = st.pages.get_mut(&(page.hpid, page.vpn))
        {
            *pins = pins.saturating_sub(1);
            *d |= dirty;
        }
    }

    fn flush_page(&self, _page: &HostPage) {
        self.state.lock().unwrap().flushes += 1;
    }

    fn setup_move(
        &self,
        hpid: Hpid,
        vpn: u64,
        n_pages: u64,
        huge: bool,
        select: MoveSelect,
        owner: u32,
    ) -> MmuResult<MoveTicket> {
        let mut st = self.state.lock().unwrap();
        let step = if huge { PAGES_IN_HUGE } else { 1 };
        let mut pages = Vec::new();
        let mut unit_vpn = vpn;
        while unit_vpn < vpn + n_pages {
            if matches!(select, MoveSelect::System)
                && !st.pages.contains_key(&(hpid, unit_vpn))
            {
                let region = find_region_locked(&st, hpid, unit_vpn << BASE_PAGE_SHIFT)?;
                populate(&mut st, hpid, region, unit_vpn);
            }
            let src = match st.pages.get(&(hpid, unit_vpn)) {
                Some(PageState::Host { phys, pins, .. }) => PageResidency::Host {
                    phys: *phys,
                    movable: matches!(select, MoveSelect::System) && *pins == 0,
                },
                Some(PageState::Card { addr, owner: o }) => PageResidency::Card {
                    addr: *addr,
                    owner: *o,
                    movable: matches!(select, MoveSelect::DevicePrivate(sel) if sel == *o),
                },
                None => PageResidency::Absent,
            };
            pages.push(MovePage { vpn: unit_vpn, src });
            unit_vpn += step;
        }
        Ok(MoveTicket {
            hpid,
            owner,
            huge,
            pages,
        })
    }

    fn commit_move(&self, ticket: MoveTicket, dests: &[MoveDest]) -> MmuResult<()> {
        if dests.len() != ticket.pages.len() {
            return Err(MmuError::Invariant("move destination array mismatch"));
        }
        let notifiers: Vec<Arc<dyn RangeNotifier>>;
        let (start, end);
        {
            let mut st = self.state.lock().unwrap();
            let step = if ticket.huge { PAGES_IN_HUGE } else { 1 };
            for (page, dest) in ticket.pages.iter().zip(dests) {
                match dest {
                    MoveDest::Skip => {}
                    MoveDest::Host(phys) => {
                        for i in 0..step {
                            st.pages.insert(
                                (ticket.hpid, page.vpn + i),
                                PageState::Host {
                                    phys: phys + i * BASE_PAGE_SIZE,
                                    pins: 0,
                                    dirty: false,
                                },
                            );
                        }
                    }
                    MoveDest::Card(addr) => {
                        for i in 0..step {
                            st.pages.insert(
                                (ticket.hpid, page.vpn + i),
                                PageState::Card {
                                    addr: addr + i * BASE_PAGE_SIZE,
                                    owner: ticket.owner,
                                },
                            );
                        }
                    }
                }
            }
            *st.seqs.entry(ticket.hpid).or_insert(0) += 1;
            st.moves_committed += 1;

            start = ticket.pages.first().map_or(0, |p| p.vpn) << BASE_PAGE_SHIFT;
            end = ticket
                .pages
                .last()
                .map_or(0, |p| p.vpn + if ticket.huge { PAGES_IN_HUGE } else { 1 })
                << BASE_PAGE_SHIFT;
            notifiers = st
                .notifiers
                .values()
                .filter(|(h, _)| *h == ticket.hpid)
                .map(|(_, n)| n.clone())
                .collect();
        }
        for n in notifiers {
            n.invalidate(start, end, Some(ticket.owner), true);
        }
        Ok(())
    }

    fn abort_move(&self, ticket: MoveTicket) {
        debug!("move aborted, hpid {}", ticket.hpid);
        self.state.lock().unwrap().moves_aborted += 1;
    }

    fn alloc_host_page(&self, _hpid: Hpid, _vpn: u64, huge: bool) -> Option<u64> {
        let mut st = self.state.lock().unwrap();
        match st.host_alloc_fail_at {
            Some(0) => {
                st.host_alloc_fail_at = None;
                return None;
            }
            Some(ref mut k) => *k -= 1,
            None => {}
        }
        let phys = if huge {
            let base = align_up(st.next_phys, HUGE_PAGE_SIZE);
            st.next_phys = base + HUGE_PAGE_SIZE;
            base
        } else {
            let base = st.next_phys;
            st.next_phys += BASE_PAGE_SIZE;
            base
        };
        Some(phys)
    }

    fn free_host_page(&self, _phys: u64) {}

    fn fault_in(&self, hpid: Hpid, vpn: u64, n_pages: u64) -> MmuResult<Vec<u64>> {
        loop {
            let mut pending_target = None;
            {
                let mut st = self.state.lock().unwrap();
                if st.seq_bumps > 0 {
                    st.seq_bumps -= 1;
                    *st.seqs.entry(hpid).or_insert(0) += 1;
                }
                if st.busy_faults > 0 {
                    st.busy_faults -= 1;
                    return Err(MmuError::Busy);
                }
                let mut out = Vec::with_capacity(n_pages as usize);
                for i in 0..n_pages {
                    match st.pages.get(&(hpid, vpn + i)).copied() {
                        Some(PageState::Host { phys, .. }) => out.push(phys),
                        Some(PageState::Card { owner, .. }) => {
                            pending_target =
                                Some((lookup_target(&st, owner)?, (vpn + i) << BASE_PAGE_SHIFT));
                            break;
                        }
                        None => {
                            let region =
                                find_region_locked(&st, hpid, (vpn + i) << BASE_PAGE_SHIFT)?;
                            populate(&mut st, hpid, region, vpn + i);
                            match st.pages.get(&(hpid, vpn + i)) {
                                Some(PageState::Host { phys, .. }) => out.push(*phys),
                                _ => return Err(MmuError::Invariant("populate failed")),
                            }
                        }
                    }
                }
                if pending_target.is_none() {
                    return Ok(out);
                }
            }
            let (target, vaddr) = pending_target.unwrap();
            target.migrate_to_ram(hpid, vaddr)?;
        }
    }

    fn probe_page(&self, hpid: Hpid, vaddr: u64) -> PageResidency {
        self.residency(hpid, vaddr >> BASE_PAGE_SHIFT)
    }

    fn register_notifier(&self, hpid: Hpid, notifier: Arc<dyn RangeNotifier>) -> MmuResult<u64> {
        let mut st = self.state.lock().unwrap();
        let id = st.next_notifier_id;
        st.next_notifier_id += 1;
        st.notifiers.insert(id, (hpid, notifier));
        Ok(id)
    }

    fn unregister_notifier(&self, _hpid: Hpid, id: u64) {
        self.state.lock().unwrap().notifiers.remove(&id);
    }

    fn request_arena(
        &self,
        bytes: u64,
        owner: u32,
        fault_target: Weak<dyn CpuFaultTarget>,
    ) -> MmuResult<u64> {
        let mut st = self.state.lock().unwrap();
        match st.arena_fail_at {
            Some(0) => {
                st.arena_fail_at = None;
                return Err(MmuError::OutOfMemory);
            }
            Some(ref mut k) => *k -= 1,
            None => {}
        }
        if st.arena_fails > 0 {
            st.arena_fails -= 1;
            return Err(MmuError::OutOfMemory);
        }
        let base = st.next_arena;
        st.next_arena += bytes;
        st.arenas.push((base, bytes));
        st.fault_targets.insert(owner, fault_target);
        Ok(base)
    }

    fn release_arena(&self, base: u64, bytes: u64) {
        self.state
            .lock()
            .unwrap()
            .arenas
            .retain(|(b, l)| !(*b == base && *l == bytes));
    }
}
