//! Free-list allocator of device-local memory pages, arena-backed.
//!
//! Physical card space is obtained from the host's region manager in fixed
//! chunks and never returned until teardown. Migrated-page records live here
//! too, in a slab addressed by index; the back-reference from a card page to
//! its record is an index into that slab, so free-list membership and the
//! back-reference always mutate together under the owner's lock.

use std::collections::{HashMap, HashSet};
use std::sync::Weak;

use log::{debug, warn};

use crate::error::{MmuError, MmuResult};
use crate::hal::{CpuFaultTarget, HostVm};
use crate::tlb::{BASE_PAGE_SIZE, HUGE_PAGE_SIZE};
use crate::utils::align_up;
use crate::Cpid;

/// Record of one page currently migrated to card memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigRecord {
    pub cpid: Cpid,
    pub huge: bool,
}

/// Counters exposed for conservation checks and the reporting layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardStats {
    pub free_regular: u64,
    pub free_huge: u64,
    pub live_records: u64,
    pub arenas: u64,
}

#[derive(Debug)]
pub struct CardAllocator {
    dev_id: u32,
    chunk_bytes: u64,
    fault_target: Option<Weak<dyn CpuFaultTarget>>,

    arenas: Vec<(u64, u64)>,
    free_regular: Vec<u64>,
    free_huge: Vec<u64>,
    taken: HashSet<u64>,

    records: Vec<Option<MigRecord>>,
    record_free: Vec<usize>,
    back_ref: HashMap<u64, usize>,
}

impl CardAllocator {
    #[must_use]
    pub fn new(dev_id: u32, chunk_bytes: u64) -> Self {
        Self {
            dev_id,
            chunk_bytes: align_up(chunk_bytes.max(HUGE_PAGE_SIZE), HUGE_PAGE_SIZE),
            fault_target: None,
            arenas: Vec::new(),
            free_regular: Vec::new(),
            free_huge: Vec::new(),
            taken: HashSet::new(),
            records: Vec::new(),
            record_free: Vec::new(),
            back_ref: HashMap::new(),
        }
    }

    /// Wires the CPU-fault hook handed to the region manager with every
    /// arena request. Set once at attach.
    pub fn connect_fault_target(&mut self, target: Weak<dyn CpuFaultTarget>) {
        self.fault_target = Some(target);
    }

    /// Pops one free page of the requested granularity. An empty list
    /// triggers a single arena refill before the retry.
    pub fn alloc_page(&mut self, vm: &dyn HostVm, huge: bool) -> MmuResult<u64> {
        if self.free_list(huge).is_empty() {
            self.refill(vm, huge)?;
        }
        let addr = self.free_list(huge).pop().ok_or(MmuError::OutOfMemory)?;
        self.taken.insert(addr);
        Ok(addr)
    }

    /// Pushes a page back. Clears the record back-reference first so a page
    /// can never sit on the free list while still attached.
    pub fn free_page(&mut self, addr: u64, huge: bool) {
        if !self.taken.remove(&addr) {
            warn!("card free of untracked page {addr:#x}");
            return;
        }
        if let Some(idx) = self.back_ref.remove(&addr) {
            self.records[idx] = None;
            self.record_free.push(idx);
        }
        self.free_list(huge).push(addr);
    }

    /// Attaches a migrated-page record to an allocated page.
    pub fn attach_record(&mut self, addr: u64, rec: MigRecord) -> MmuResult<()> {
        if !self.taken.contains(&addr) {
            return Err(MmuError::Invariant("record attach to free card page"));
        }
        if self.back_ref.contains_key(&addr) {
            return Err(MmuError::Invariant("card page already carries a record"));
        }
        let idx = match self.record_free.pop() {
            Some(idx) => {
                self.records[idx] = Some(rec);
                idx
            }
            None => {
                self.records.push(Some(rec));
                self.records.len() - 1
            }
        };
        self.back_ref.insert(addr, idx);
        Ok(())
    }

    /// Detaches and returns the record of a page, if any.
    pub fn detach_record(&mut self, addr: u64) -> Option<MigRecord> {
        let idx = self.back_ref.remove(&addr)?;
        let rec = self.records[idx].take();
        self.record_free.push(idx);
        rec
    }

    #[must_use]
    pub fn record_of(&self, addr: u64) -> Option<&MigRecord> {
        self.back_ref
            .get(&addr)
            .and_then(|idx| self.records[*idx].as_ref())
    }

    /// Card pages still attached to records of the given client, for bulk
    /// release at unregister.
    #[must_use]
    pub fn pages_of_cpid(&self, cpid: Cpid) -> Vec<(u64, bool)> {
        self.back_ref
            .iter()
            .filter_map(|(addr, idx)| {
                self.records[*idx]
                    .filter(|r| r.cpid == cpid)
                    .map(|r| (*addr, r.huge))
            })
            .collect()
    }

    /// Every card page currently carrying a record, regardless of owner.
    #[must_use]
    pub fn all_record_pages(&self) -> Vec<(u64, bool)> {
        self.back_ref
            .iter()
            .filter_map(|(addr, idx)| self.records[*idx].map(|r| (*addr, r.huge)))
            .collect()
    }

    #[must_use]
    pub fn stats(&self) -> CardStats {
        CardStats {
            free_regular: self.free_regular.len() as u64,
            free_huge: self.free_huge.len() as u64,
            live_records: self.records.iter().flatten().count() as u64,
            arenas: self.arenas.len() as u64,
        }
    }

    /// Unmaps and releases every arena chunk. Outstanding records indicate a
    /// missed bulk release and are logged.
    pub fn teardown(&mut self, vm: &dyn HostVm) {
        if !self.back_ref.is_empty() {
            warn!(
                "card teardown with {} records still attached",
                self.back_ref.len()
            );
        }
        for (base, bytes) in self.arenas.drain(..) {
            vm.release_arena(base, bytes);
        }
        self.free_regular.clear();
        self.free_huge.clear();
        self.taken.clear();
        self.records.clear();
        self.record_free.clear();
        self.back_ref.clear();
    }

    fn free_list(&mut self, huge: bool) -> &mut Vec<u64> {
        if huge {
            &mut self.free_huge
        } else {
            &mut self.free_regular
        }
    }

    fn refill(&mut self, vm: &dyn HostVm, huge: bool) -> MmuResult<()> {
        let target = self
            .fault_target
            .clone()
            .ok_or(MmuError::Invariant("card allocator has no fault target"))?;

        let chunk = self.chunk_bytes;
        let base = vm.request_arena(chunk, self.dev_id, target)?;
        self.arenas.push((base, chunk));

        let step = if huge { HUGE_PAGE_SIZE } else { BASE_PAGE_SIZE };
        let list = self.free_list(huge);
        let mut addr = base + chunk;
        while addr > base {
            addr -= step;
            list.push(addr);
        }
        debug!("card arena grown: base {base:#x}, {chunk} bytes, huge {huge}");
        Ok(())
    }
}
