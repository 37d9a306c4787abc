//! Interrupt handling and the deferred-work hand-off.
//!
//! The interrupt entry never blocks: completion classes flip their
//! rendezvous flags, faults are decoded and pushed onto a bounded queue, and
//! notifications take the lightweight subscription path. All sleeping work
//! (pinning, allocation, DMA waits, the resident retry loop) happens on the
//! worker thread, which always restarts the stalled engine afterwards so the
//! device can never hang on a failed fault.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, TrySendError};

use log::{debug, error, warn};

use crate::device::{Device, FaultMode};
use crate::error::MmuResult;
use crate::hal::{Direction, FaultInfo, IrqClass, IrqHandler, ResumeStatus};
use crate::mem::{migrate, pin};

impl Device {
    /// Interrupt entry point, called by the transport layer (or by the bus
    /// simulation) for every raised interrupt. Safe from any context: only
    /// decodes, signals and enqueues.
    pub fn handle_interrupt(&self) {
        while let Some(class) = self.bus.read_irq_class() {
            match class {
                IrqClass::OffloadDone => self.ev_offload.signal(),
                IrqClass::SyncDone => self.ev_sync.signal(),
                IrqClass::InvalidateDone => self.ev_invldt.signal(),
                IrqClass::PageFault => self.enqueue_fault(),
                IrqClass::Notify => self.forward_notify(),
            }
            self.bus.clear_irq();
        }
    }

    fn enqueue_fault(&self) {
        let fault = self.bus.read_fault();
        debug!(
            "page fault, vaddr {:#x}, len {:#x}, cpid {}, {:?}",
            fault.vaddr, fault.len, fault.cpid, fault.direction
        );
        let tx = self.fault_tx.lock().unwrap();
        let pushed = match tx.as_ref() {
            Some(tx) => tx.try_send(fault),
            None => Err(TrySendError::Disconnected(fault)),
        };
        drop(tx);
        if let Err(e) = pushed {
            // all fault slots busy (or the device is shutting down): drop
            // this one and unstall the engine with an error status
            error!("fault queue rejected a fault: {e}");
            self.bus
                .resume_engine(fault.cpid, fault.write, ResumeStatus::Dropped);
        }
    }

    fn forward_notify(&self) {
        let notify = self.bus.read_notify();
        let subs = self.notify_subs.lock().unwrap();
        match subs.get(&notify.cpid) {
            Some(tx) => {
                if tx.send(notify.value).is_err() {
                    warn!("notify subscriber for cpid {} is gone", notify.cpid);
                }
            }
            None => debug!("dropped notify for cpid {}: no recipient", notify.cpid),
        }
    }

    /// Runs one fault to completion and unconditionally resumes the stalled
    /// engine; a failed fault is dropped with an error status but the table
    /// stays consistent for future operations.
    pub(crate) fn service_fault(&self, fault: FaultInfo) {
        let status = match self.run_fault(&fault) {
            Ok(()) => ResumeStatus::Success,
            Err(e) => {
                error!(
                    "fault servicing failed, vaddr {:#x}, cpid {}: {e}",
                    fault.vaddr, fault.cpid
                );
                ResumeStatus::Dropped
            }
        };
        self.bus.resume_engine(fault.cpid, fault.write, status);
    }

    fn run_fault(&self, fault: &FaultInfo) -> MmuResult<()> {
        let hpid = self.cpids.lock().unwrap().hpid_of(fault.cpid)?;
        let mut state = self.mmu.lock().unwrap();
        match (self.cfg.fault_mode, fault.direction) {
            (FaultMode::Pinned, _) => pin::handle_fault(self, &mut state, fault, hpid),
            (FaultMode::Migrated, Direction::ToHost) => {
                migrate::host_fault_resident(self, &mut state, fault, hpid)
            }
            (FaultMode::Migrated, Direction::ToCard) => {
                migrate::fault_to_card(self, &mut state, fault, hpid)
            }
        }
    }
}

impl IrqHandler for Device {
    fn irq(&self) {
        self.handle_interrupt();
    }
}

/// Body of the deferred worker thread; exits when the device detaches and
/// the queue's sender side is dropped.
pub(crate) fn worker_loop(dev: Arc<Device>, rx: Receiver<FaultInfo>) {
    while let Ok(fault) = rx.recv() {
        dev.service_fault(fault);
    }
    debug!("fault worker for device {} exiting", dev.cfg.id);
}
