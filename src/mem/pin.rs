//! Pinning backend: buffers registered up front, host pages pinned for the
//! accelerator's lifetime of use. Nothing here migrates; the device always
//! reaches host memory.

use log::debug;

use crate::device::{Device, MmuState};
use crate::error::{MmuError, MmuResult};
use crate::hal::FaultInfo;
use crate::mem::table::MappedBuffer;
use crate::tlb::{self, BASE_PAGE_SHIFT, PageLocation, TlbEntry};
use crate::{Cpid, Hpid};

/// Registers `[vaddr, vaddr + len)` for the client and installs device
/// translations. Zero length is a successful no-op. A partial pin failure
/// unwinds every page already pinned; no buffer is created.
pub(crate) fn map_user(
    dev: &Device,
    state: &mut MmuState,
    vaddr: u64,
    len: u64,
    cpid: Cpid,
    hpid: Hpid,
) -> MmuResult<()> {
    if len == 0 {
        return Ok(());
    }

    let region = dev.vm.find_region(hpid, vaddr)?;
    let ord = dev.order_for(region.huge);
    let (vpn, n_pages) = ord
        .span(vaddr, len)
        .ok_or(MmuError::InvalidArg("length overflows the address space"))?;

    if state.table.get(vpn, cpid).is_some() {
        return Err(MmuError::InvalidArg("mapping already present"));
    }

    debug!(
        "map user buffer, vpn {vpn:#x}, n_pages {n_pages}, cpid {cpid}, hpid {hpid}, huge {}",
        region.huge
    );

    dev.ensure_notifier(state, hpid)?;

    // pin every covered page; unwind the lot on the first shortfall
    let mut pages = Vec::with_capacity(n_pages as usize);
    for i in 0..n_pages {
        match dev.vm.pin_page(hpid, (vpn + i) << BASE_PAGE_SHIFT) {
            Ok(p) => pages.push(p),
            Err(e) => {
                debug!("pin shortfall at page {i}/{n_pages}: {e}");
                for p in pages {
                    dev.vm.unpin_page(p, false);
                }
                dev.drop_notifier_ref(state, hpid);
                return Err(MmuError::OutOfMemory);
            }
        }
    }

    for p in &pages {
        dev.vm.flush_page(p);
    }

    install_entries(dev, ord, vpn, &pages, cpid, hpid);

    let insert = state.table.insert(MappedBuffer {
        vpn,
        n_pages,
        cpid,
        hpid,
        huge: region.huge,
        pages,
    });
    debug_assert!(insert.is_ok());
    Ok(())
}

/// Removes the buffer registered at exactly (vaddr, cpid), tears down its
/// device translations and releases the pins, marking pages dirty first when
/// requested.
pub(crate) fn unmap_user(
    dev: &Device,
    state: &mut MmuState,
    vaddr: u64,
    cpid: Cpid,
    dirty: bool,
) -> MmuResult<()> {
    // the stored key is granularity-aligned; try both normalizations
    let vpn_r = (vaddr & dev.tlb_regular.page_mask) >> BASE_PAGE_SHIFT;
    let vpn_h = (vaddr & dev.tlb_huge.page_mask) >> BASE_PAGE_SHIFT;
    let buf = state
        .table
        .remove(vpn_r, cpid)
        .or_else(|| state.table.remove(vpn_h, cpid))
        .ok_or(MmuError::NotMapped)?;

    let hpid = buf.hpid;
    drop_buffer(dev, buf, dirty);
    dev.drop_notifier_ref(state, hpid);
    Ok(())
}

/// Unmaps every buffer of one client (or of all clients), as used by client
/// unregister and device close. Clients without buffers are a no-op.
pub(crate) fn release_all(
    dev: &Device,
    state: &mut MmuState,
    cpid: Option<Cpid>,
    dirty: bool,
) -> MmuResult<()> {
    let drained = state
        .table
        .drain_matching(|b| cpid.is_none_or(|c| b.cpid == c));
    for buf in drained {
        let hpid = buf.hpid;
        drop_buffer(dev, buf, dirty);
        dev.drop_notifier_ref(state, hpid);
    }

    // migrated pages are tagged with the client too; drop their card backing
    let mut card = dev.card.lock().unwrap();
    let owned = match cpid {
        Some(c) => card.pages_of_cpid(c),
        None => card.all_record_pages(),
    };
    for (addr, huge) in owned {
        card.free_page(addr, huge);
    }
    Ok(())
}

/// Fault service in pinned mode: refresh the device table from an existing
/// buffer when one covers the fault, pin first-touch otherwise. Card-direction
/// faults have no meaning without migration.
pub(crate) fn handle_fault(
    dev: &Device,
    state: &mut MmuState,
    fault: &FaultInfo,
    hpid: Hpid,
) -> MmuResult<()> {
    if fault.direction == crate::hal::Direction::ToCard {
        return Err(MmuError::Unsupported("card access on a pinned-mode device"));
    }

    let region = dev.vm.find_region(hpid, fault.vaddr)?;
    let ord = dev.order_for(region.huge);
    let (vpn, n_pages) = ord
        .span(fault.vaddr, fault.len.max(1))
        .ok_or(MmuError::InvalidArg("fault range overflows"))?;

    if let Some(buf) = state.table.find_covering(vpn, fault.cpid) {
        // map present: replay translations for the faulted subrange only
        let offset = vpn - buf.vpn;
        let n = n_pages.min(buf.n_pages - offset);
        let ord = dev.order_for(buf.huge);
        let pages = &buf.pages[offset as usize..(offset + n) as usize];
        debug!(
            "fault on mapped range, vpn {vpn:#x}, replaying {n} pages, cpid {}",
            fault.cpid
        );
        install_entries(dev, ord, vpn, pages, fault.cpid, hpid);
        return Ok(());
    }

    map_user(dev, state, fault.vaddr, fault.len.max(1), fault.cpid, hpid)
}

/// Builds and pushes map descriptors for a pinned page run. Huge granularity
/// takes one descriptor per group, carrying the group's first frame.
fn install_entries(
    dev: &Device,
    ord: &tlb::TlbOrder,
    vpn: u64,
    pages: &[crate::hal::HostPage],
    cpid: Cpid,
    hpid: Hpid,
) {
    let step = ord.pages_per_entry();
    let mut entries: Vec<TlbEntry> = Vec::with_capacity(pages.len() / step as usize + 1);
    let mut i = 0u64;
    while (i as usize) < pages.len() {
        entries.push(tlb::create_map_entry(
            ord,
            vpn + i,
            pages[i as usize].phys,
            PageLocation::Host,
            cpid,
            hpid,
        ));
        i += step;
    }
    tlb::service_device(dev.bus.as_ref(), ord, &entries);
}

/// Shared teardown: device entries out, invalidation acknowledged, pins
/// dropped.
fn drop_buffer(dev: &Device, buf: MappedBuffer, dirty: bool) {
    let ord = dev.order_for(buf.huge);
    {
        let _pause = tlb::WalkerPause::new(dev.bus.as_ref());
        dev.tlb_unmap_range(ord, buf.vpn, buf.n_pages, buf.hpid);
        dev.tlb_invalidate_range(ord, buf.vpn, buf.n_pages, buf.hpid);
        dev.ev_invldt.wait();
    }
    for p in buf.pages {
        dev.vm.unpin_page(p, dirty);
    }
}
