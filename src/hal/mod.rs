//! Contracts of the two external collaborators: the accelerator itself
//! (register-level bus access, "downward") and the host virtual-memory
//! subsystem ("sideways"). The engine is written purely against these traits;
//! `sim` provides the software device and host used by the test suite.

pub mod sim;

use std::sync::{Arc, Weak};

use bitflags::bitflags;

use crate::error::MmuResult;
use crate::tlb::{TlbClass, TlbEntry};
use crate::{Cpid, Hpid};

bitflags! {
    /// Static capability word probed from the device at attach.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DeviceCaps: u32 {
        /// Device-local memory is present; migration is possible.
        const CARD_MEM  = 1 << 0;
        /// Streaming engines raise host-direction faults.
        const STREAMS   = 1 << 1;
        /// Completion writeback region is exposed.
        const WRITEBACK = 1 << 2;
    }
}

/// Direction of a transfer or fault, seen from host memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    ToCard,
    ToHost,
}

/// Interrupt cause classes the device reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqClass {
    /// Host-to-card DMA batch finished.
    OffloadDone,
    /// Card-to-host DMA batch finished.
    SyncDone,
    /// The last posted invalidation was acknowledged.
    InvalidateDone,
    /// A translation fault stalled an engine.
    PageFault,
    /// User notification raised by device logic.
    Notify,
}

/// Fault descriptor captured from the device registers.
#[derive(Clone, Copy, Debug)]
pub struct FaultInfo {
    pub vaddr: u64,
    pub len: u64,
    pub cpid: Cpid,
    pub direction: Direction,
    pub write: bool,
}

/// Notification payload captured from the device registers.
#[derive(Clone, Copy, Debug)]
pub struct NotifyInfo {
    pub cpid: Cpid,
    pub value: i32,
}

/// Outcome reported back when resuming a stalled engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeStatus {
    Success,
    Dropped,
}

/// Implemented by the engine; the bus calls it for every raised interrupt.
pub trait IrqHandler: Send + Sync {
    fn irq(&self);
}

/// Register-level access to one accelerator instance.
///
/// Implementations must be callable from any thread; the engine never holds
/// its own locks across a blocking bus call other than the doorbell ack.
pub trait DeviceBus: Send + Sync {
    /// Wires the interrupt line. The bus holds a weak reference so detach
    /// order does not matter.
    fn connect_irq(&self, handler: Weak<dyn IrqHandler>);

    fn caps(&self) -> DeviceCaps;

    /// How many faults the device can have outstanding at once. Sizes the
    /// deferred-work queue.
    fn fault_slots(&self) -> usize;

    /// Reads and consumes the pending interrupt class register.
    fn read_irq_class(&self) -> Option<IrqClass>;
    fn clear_irq(&self);
    fn read_fault(&self) -> FaultInfo;
    fn read_notify(&self) -> NotifyInfo;

    /// Writes a descriptor batch into the given table's queue.
    fn push_entries(&self, class: TlbClass, entries: &[TlbEntry]);
    /// Rings the queue doorbell; blocks until the device acknowledges the
    /// batch (the simulated bus acks immediately).
    fn ring_doorbell(&self, class: TlbClass);

    /// Toggles the flag the walker polls before autonomously walking the
    /// table. Calls must pair; use [`crate::tlb::WalkerPause`].
    fn set_walker_paused(&self, paused: bool);

    /// Posts one invalidation command; the completion interrupt fires after
    /// the command marked `last` is acknowledged.
    fn post_invalidate(&self, vpn: u64, n_pages: u64, hpid: Hpid, last: bool);

    /// Kicks the host-to-card DMA engine with parallel physical-address
    /// arrays (`len` bytes per element). Completion arrives as
    /// [`IrqClass::OffloadDone`].
    fn dma_offload(&self, host: &[u64], card: &[u64], len: u64);
    /// Card-to-host direction of [`Self::dma_offload`]; completes as
    /// [`IrqClass::SyncDone`].
    fn dma_sync(&self, host: &[u64], card: &[u64], len: u64);

    /// Restarts (or drops, with an error status) the engine stalled on the
    /// fault identified by (cpid, write).
    fn resume_engine(&self, cpid: Cpid, write: bool, status: ResumeStatus);
}

/// Current backing of one page as reported by a residency snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageResidency {
    /// Host frame. `movable` is false when something (a pin, a foreign
    /// owner) prevents relocation.
    Host { phys: u64, movable: bool },
    /// Device-private frame of the owner device.
    Card { addr: u64, owner: u32, movable: bool },
    /// Not populated yet.
    Absent,
}

/// One granularity unit of a move ticket.
#[derive(Clone, Copy, Debug)]
pub struct MovePage {
    pub vpn: u64,
    pub src: PageResidency,
}

/// Which source pages a snapshot selects for moving.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveSelect {
    /// Ordinary host-resident pages (migrate to card).
    System,
    /// Device-private pages of the given owner (migrate back to host).
    DevicePrivate(u32),
}

/// Destination for one unit when committing a move.
#[derive(Clone, Copy, Debug)]
pub enum MoveDest {
    /// Leave the unit where the snapshot found it.
    Skip,
    Host(u64),
    Card(u64),
}

/// In-flight move transaction: the host VM has locked the covered range and
/// reported per-unit residency. Must be resolved by exactly one of
/// [`HostVm::commit_move`] or [`HostVm::abort_move`].
#[derive(Debug)]
pub struct MoveTicket {
    pub hpid: Hpid,
    pub owner: u32,
    pub huge: bool,
    pub pages: Vec<MovePage>,
}

/// Owning address-space region of a mapped range.
#[derive(Clone, Copy, Debug)]
pub struct RegionInfo {
    pub base: u64,
    pub len: u64,
    /// Whether the region is backed at huge granularity.
    pub huge: bool,
}

/// A pinned host page: residency forced, eviction blocked until unpinned.
#[derive(Clone, Copy, Debug)]
pub struct HostPage {
    pub hpid: Hpid,
    pub vpn: u64,
    pub phys: u64,
}

/// Invalidation callback registered per host pid. Returning `false` means
/// "not safe yet" and is only permitted when `blockable` is false.
pub trait RangeNotifier: Send + Sync {
    fn invalidate(&self, start: u64, end: u64, owner: Option<u32>, blockable: bool) -> bool;
}

/// CPU-fault hook for device-private pages: invoked synchronously, in the
/// faulting thread, before the touching instruction may proceed.
pub trait CpuFaultTarget: Send + Sync {
    fn migrate_to_ram(&self, hpid: Hpid, vaddr: u64) -> MmuResult<()>;
}

/// Services the engine consumes from the host virtual-memory subsystem.
pub trait HostVm: Send + Sync {
    /// Resolves the region owning `vaddr` in process `hpid`.
    fn find_region(&self, hpid: Hpid, vaddr: u64) -> MmuResult<RegionInfo>;

    /// Takes a reference and read-lock on the address space so it cannot be
    /// resized mid-operation. Pairs with [`Self::release_space`].
    fn acquire_space(&self, hpid: Hpid) -> MmuResult<()>;
    fn release_space(&self, hpid: Hpid);

    /// Monotonic sequence bumped by every change to the pid's address space;
    /// used to detect concurrent modification across a fault-in.
    fn notifier_seq(&self, hpid: Hpid) -> u64;

    /// Pins a single page, forcing residency. Partial-range unwinding is the
    /// caller's job, which is why this is per page.
    fn pin_page(&self, hpid: Hpid, vaddr: u64) -> MmuResult<HostPage>;
    fn unpin_page(&self, page: HostPage, dirty: bool);
    /// Flushes the CPU cache state of a pinned page before device access.
    fn flush_page(&self, page: &HostPage);

    /// Snapshot + lock step of the move primitive: partitions the covered
    /// units into movable and already-placed, per `select`.
    fn setup_move(
        &self,
        hpid: Hpid,
        vpn: u64,
        n_pages: u64,
        huge: bool,
        select: MoveSelect,
        owner: u32,
    ) -> MmuResult<MoveTicket>;

    /// Finalizes the page-table swap. `dests` parallels `ticket.pages`.
    /// Fires registered notifiers for the range, tagged with the owner.
    fn commit_move(&self, ticket: MoveTicket, dests: &[MoveDest]) -> MmuResult<()>;

    /// Re-invokes the move primitive with zero substituted destinations,
    /// restoring the original residency.
    fn abort_move(&self, ticket: MoveTicket);

    /// Allocates an ordinary host frame inside the region owning `vpn`
    /// (destination side of a migrate-to-host).
    fn alloc_host_page(&self, hpid: Hpid, vpn: u64, huge: bool) -> Option<u64>;
    fn free_host_page(&self, phys: u64);

    /// Forces residency of a page range and reports per-page physical
    /// frames. May return [`crate::error::MmuError::Busy`] transiently.
    fn fault_in(&self, hpid: Hpid, vpn: u64, n_pages: u64) -> MmuResult<Vec<u64>>;

    /// Non-faulting residency probe of a single page.
    fn probe_page(&self, hpid: Hpid, vaddr: u64) -> PageResidency;

    fn register_notifier(&self, hpid: Hpid, notifier: Arc<dyn RangeNotifier>) -> MmuResult<u64>;
    fn unregister_notifier(&self, hpid: Hpid, id: u64);

    /// Requests a chunk of physical address space from the host's region
    /// manager and maps it device-private. The fault target is invoked when
    /// the CPU later touches a page inside the chunk.
    fn request_arena(
        &self,
        bytes: u64,
        owner: u32,
        fault_target: Weak<dyn CpuFaultTarget>,
    ) -> MmuResult<u64>;
    fn release_arena(&self, base: u64, bytes: u64);
}
