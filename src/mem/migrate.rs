//! Migration backend: fault- and request-driven movement of pages between
//! host memory and the card, keeping the device table consistent with
//! wherever the data currently lives.
//!
//! One state machine serves every entry point:
//! resolve -> snapshot -> invalidate -> allocate -> transfer -> commit ->
//! remap. Explicit calls and deferred fault work run it under the device's
//! serializing lock; the CPU-fault hook runs it without (the host VM's move
//! primitive holds the page-level locks there, and the faulting thread may
//! already be nested inside an engine-held lock via fault-in).

use std::time::Instant;

use log::{debug, error, warn};

use crate::device::{Device, MmuState};
use crate::error::{MmuError, MmuResult};
use crate::hal::{Direction, FaultInfo, MoveDest, MoveSelect, PageResidency};
use crate::tlb::{self, BASE_PAGE_SHIFT, PageLocation, TlbEntry};
use crate::{Cpid, Hpid};

/// Everything one migration call needs; lives only for that call.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MigrateArgs {
    pub vpn: u64,
    pub n_pages: u64,
    pub huge: bool,
    pub cpid: Cpid,
    pub hpid: Hpid,
    pub dir: Direction,
}

/// Explicit migration entry point; the caller holds the serializing lock.
pub(crate) fn migrate_user(
    dev: &Device,
    state: &mut MmuState,
    vaddr: u64,
    len: u64,
    cpid: Cpid,
    hpid: Hpid,
    dir: Direction,
) -> MmuResult<()> {
    if len == 0 {
        return Ok(());
    }
    let args = resolve(dev, vaddr, len, cpid, hpid, dir)?;
    dev.ensure_sticky_notifier(state, hpid)?;
    run_machine(dev, &args, true)
}

/// Deferred-work entry for a card-direction device fault.
pub(crate) fn fault_to_card(
    dev: &Device,
    state: &mut MmuState,
    fault: &FaultInfo,
    hpid: Hpid,
) -> MmuResult<()> {
    let args = resolve(
        dev,
        fault.vaddr,
        fault.len.max(1),
        fault.cpid,
        hpid,
        Direction::ToCard,
    )?;
    dev.ensure_sticky_notifier(state, hpid)?;
    run_machine(dev, &args, true)
}

/// Deferred-work entry for a host-direction device fault: force the covered
/// pages resident (possibly migrating them back) and install host
/// translations. Retries on transient busy and on a concurrently changed
/// address space, up to the configured deadline; on expiry everything is
/// left exactly as found.
pub(crate) fn host_fault_resident(
    dev: &Device,
    state: &mut MmuState,
    fault: &FaultInfo,
    hpid: Hpid,
) -> MmuResult<()> {
    let args = resolve(
        dev,
        fault.vaddr,
        fault.len.max(1),
        fault.cpid,
        hpid,
        Direction::ToHost,
    )?;

    if !state.notifiers.contains_key(&hpid) {
        error!("host pid {hpid} has device state but no registered notifier");
        return Err(MmuError::Invariant("no invalidation notifier for host pid"));
    }

    dev.vm.acquire_space(hpid)?;
    let res = resident_loop(dev, &args);
    dev.vm.release_space(hpid);
    res
}

fn resident_loop(dev: &Device, args: &MigrateArgs) -> MmuResult<()> {
    let ord = dev.order_for(args.huge);
    let deadline = Instant::now() + dev.cfg.resident_timeout;

    let phys = loop {
        if Instant::now() >= deadline {
            debug!("resident retry deadline expired, vpn {:#x}", args.vpn);
            return Err(MmuError::Busy);
        }
        let seq = dev.vm.notifier_seq(args.hpid);
        match dev.vm.fault_in(args.hpid, args.vpn, args.n_pages) {
            Ok(phys) => {
                // a sequence bump means the range changed under us; same
                // bounds, fresh attempt
                if dev.vm.notifier_seq(args.hpid) != seq {
                    continue;
                }
                break phys;
            }
            Err(MmuError::Busy) => {
                std::thread::sleep(std::time::Duration::from_millis(1));
                continue;
            }
            Err(e) => return Err(e),
        }
    };

    let step = ord.pages_per_entry();
    let mut entries: Vec<TlbEntry> = Vec::new();
    let mut i = 0u64;
    while i < args.n_pages {
        entries.push(tlb::create_map_entry(
            ord,
            args.vpn + i,
            phys[i as usize],
            PageLocation::Host,
            args.cpid,
            args.hpid,
        ));
        i += step;
    }
    tlb::service_device(dev.bus.as_ref(), ord, &entries);
    Ok(())
}

/// Step 1: region lookup, granularity probe, covered range.
fn resolve(
    dev: &Device,
    vaddr: u64,
    len: u64,
    cpid: Cpid,
    hpid: Hpid,
    dir: Direction,
) -> MmuResult<MigrateArgs> {
    let region = dev.vm.find_region(hpid, vaddr)?;
    let ord = dev.order_for(region.huge);
    let (vpn, n_pages) = ord
        .span(vaddr, len)
        .ok_or(MmuError::InvalidArg("length overflows the address space"))?;
    Ok(MigrateArgs {
        vpn,
        n_pages,
        huge: region.huge,
        cpid,
        hpid,
        dir,
    })
}

/// Final residency of one unit after the move, for the remap step.
struct RemapUnit {
    vpn: u64,
    loc: PageLocation,
    paddr: u64,
}

/// Steps 2-7. `remap` is false on the CPU-fault path, where the device entry
/// stays torn down until the accelerator faults the range back in.
pub(crate) fn run_machine(dev: &Device, args: &MigrateArgs, remap: bool) -> MmuResult<()> {
    let ord = dev.order_for(args.huge);

    debug!(
        "migrate {:?}, vpn {:#x}, n_pages {}, cpid {}, hpid {}, huge {}",
        args.dir, args.vpn, args.n_pages, args.cpid, args.hpid, args.huge
    );

    dev.vm.acquire_space(args.hpid)?;
    let res = machine_body(dev, ord, args, remap);
    dev.vm.release_space(args.hpid);
    res
}

fn machine_body(
    dev: &Device,
    ord: &tlb::TlbOrder,
    args: &MigrateArgs,
    remap: bool,
) -> MmuResult<()> {
    // SNAPSHOT: partition the range into movable and already-placed units
    let select = match args.dir {
        Direction::ToCard => MoveSelect::System,
        Direction::ToHost => MoveSelect::DevicePrivate(dev.cfg.id),
    };
    let ticket = dev
        .vm
        .setup_move(args.hpid, args.vpn, args.n_pages, args.huge, select, dev.cfg.id)?;

    // INVALIDATE: the walker stays paused until the remap is in place
    let pause = tlb::WalkerPause::new(dev.bus.as_ref());
    dev.tlb_unmap_range(ord, args.vpn, args.n_pages, args.hpid);
    dev.tlb_invalidate_range(ord, args.vpn, args.n_pages, args.hpid);

    // ALLOCATE DESTINATIONS, one per unit that actually moves
    let mut dests: Vec<MoveDest> = Vec::with_capacity(ticket.pages.len());
    let mut shortfall = false;
    for page in &ticket.pages {
        let movable = match (args.dir, page.src) {
            (Direction::ToCard, PageResidency::Host { movable, .. }) => movable,
            (Direction::ToHost, PageResidency::Card { movable, .. }) => movable,
            _ => false,
        };
        if !movable {
            dests.push(MoveDest::Skip);
            continue;
        }
        match args.dir {
            Direction::ToCard => {
                match dev.card.lock().unwrap().alloc_page(dev.vm.as_ref(), args.huge) {
                    Ok(addr) => dests.push(MoveDest::Card(addr)),
                    Err(e) => {
                        warn!("card destination allocation failed: {e}");
                        shortfall = true;
                        break;
                    }
                }
            }
            Direction::ToHost => match dev.vm.alloc_host_page(args.hpid, page.vpn, args.huge) {
                Some(phys) => dests.push(MoveDest::Host(phys)),
                None => {
                    warn!("host destination allocation failed");
                    shortfall = true;
                    break;
                }
            },
        }
    }

    if shortfall {
        // release what we got, put residency back, fail with nothing changed
        release_dests(dev, &dests, args.huge);
        dev.vm.abort_move(ticket);
        dev.ev_invldt.wait();
        return Err(MmuError::OutOfMemory);
    }

    // TRANSFER: rendezvous with the invalidation ack, then feed the DMA
    // engine parallel source/destination arrays
    dev.ev_invldt.wait();

    let mut host_arr: Vec<u64> = Vec::new();
    let mut card_arr: Vec<u64> = Vec::new();
    for (page, dest) in ticket.pages.iter().zip(&dests) {
        match (page.src, dest) {
            (PageResidency::Host { phys, .. }, MoveDest::Card(addr)) => {
                host_arr.push(phys);
                card_arr.push(*addr);
            }
            (PageResidency::Card { addr, .. }, MoveDest::Host(phys)) => {
                host_arr.push(*phys);
                card_arr.push(addr);
            }
            _ => {}
        }
    }

    if !host_arr.is_empty() {
        match args.dir {
            Direction::ToCard => {
                let _engine = dev.offload_lock.lock().unwrap();
                dev.bus.dma_offload(&host_arr, &card_arr, ord.page_size);
                dev.ev_offload.wait();
            }
            Direction::ToHost => {
                let _engine = dev.sync_lock.lock().unwrap();
                dev.bus.dma_sync(&host_arr, &card_arr, ord.page_size);
                dev.ev_sync.wait();
            }
        }
    }

    // COMMIT: finalize the page-table swap, then move record ownership
    let mut remap_units: Vec<RemapUnit> = Vec::with_capacity(ticket.pages.len());
    let mut attached: Vec<u64> = Vec::new();
    let mut released: Vec<u64> = Vec::new();
    for (page, dest) in ticket.pages.iter().zip(&dests) {
        let unit = match dest {
            MoveDest::Card(addr) => {
                attached.push(*addr);
                RemapUnit {
                    vpn: page.vpn,
                    loc: PageLocation::Card,
                    paddr: *addr,
                }
            }
            MoveDest::Host(phys) => {
                if let PageResidency::Card { addr, .. } = page.src {
                    released.push(addr);
                }
                RemapUnit {
                    vpn: page.vpn,
                    loc: PageLocation::Host,
                    paddr: *phys,
                }
            }
            MoveDest::Skip => match page.src {
                PageResidency::Host { phys, .. } => RemapUnit {
                    vpn: page.vpn,
                    loc: PageLocation::Host,
                    paddr: phys,
                },
                PageResidency::Card { addr, .. } => RemapUnit {
                    vpn: page.vpn,
                    loc: PageLocation::Card,
                    paddr: addr,
                },
                PageResidency::Absent => continue,
            },
        };
        remap_units.push(unit);
    }

    dev.vm.commit_move(ticket, &dests)?;

    {
        let mut card = dev.card.lock().unwrap();
        for addr in attached {
            card.attach_record(
                addr,
                crate::mem::card::MigRecord {
                    cpid: args.cpid,
                    huge: args.huge,
                },
            )?;
        }
        for addr in released {
            card.free_page(addr, args.huge);
        }
    }

    // REMAP: fresh translations at the new locations, then let the walker go
    if remap {
        let mut entries: Vec<TlbEntry> = Vec::with_capacity(remap_units.len());
        for u in &remap_units {
            entries.push(tlb::create_map_entry(
                ord, u.vpn, u.paddr, u.loc, args.cpid, args.hpid,
            ));
        }
        tlb::service_device(dev.bus.as_ref(), ord, &entries);
    }
    drop(pause);
    Ok(())
}

fn release_dests(dev: &Device, dests: &[MoveDest], huge: bool) {
    let mut card = dev.card.lock().unwrap();
    for d in dests {
        match d {
            MoveDest::Card(addr) => card.free_page(*addr, huge),
            MoveDest::Host(phys) => dev.vm.free_host_page(*phys),
            MoveDest::Skip => {}
        }
    }
}

/// CPU-fault hook: the host touched a device-private page; bring its unit
/// home before the faulting instruction proceeds. Runs the same machine,
/// synchronously in the faulting thread, without reinstalling device
/// translations.
pub(crate) fn cpu_migrate_to_ram(dev: &Device, hpid: Hpid, vaddr: u64) -> MmuResult<()> {
    let region = dev.vm.find_region(hpid, vaddr)?;
    let ord = dev.order_for(region.huge);
    let unit_base = vaddr & ord.page_mask;

    // the faulting unit's owning client comes from the page record
    let cpid = {
        let card = dev.card.lock().unwrap();
        // no record means the page already moved; nothing to do
        let Some(addr) = card_addr_of(dev, hpid, unit_base) else {
            return Ok(());
        };
        match card.record_of(addr) {
            Some(rec) => rec.cpid,
            None => return Err(MmuError::Invariant("device-private page without record")),
        }
    };

    let args = MigrateArgs {
        vpn: unit_base >> BASE_PAGE_SHIFT,
        n_pages: ord.pages_per_entry(),
        huge: region.huge,
        cpid,
        hpid,
        dir: Direction::ToHost,
    };
    run_machine(dev, &args, false)
}

/// Looks up the card address currently backing a host virtual page, if any.
fn card_addr_of(dev: &Device, hpid: Hpid, vaddr: u64) -> Option<u64> {
    match dev.vm.probe_page(hpid, vaddr) {
        PageResidency::Card { addr, .. } => Some(addr),
        _ => None,
    }
}
