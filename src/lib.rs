//! Host-resident address-translation and memory-migration engine for a
//! PCIe-attached accelerator that performs DMA directly against process
//! virtual addresses.
//!
//! Client processes register buffers so the accelerator can reach them,
//! either by pinning host pages for the accelerator's lifetime of use or by
//! transparently migrating pages between host memory and device-local
//! memory, keeping the device's own translation table consistent with
//! wherever the data currently lives.
//!
//! The engine talks to two collaborators through traits in [`hal`]: the
//! accelerator's register interface ([`hal::DeviceBus`]) and the host
//! virtual-memory subsystem ([`hal::HostVm`]). A software rendition of both
//! lives in [`hal::sim`] and backs the test suite.

pub mod device;
pub mod error;
pub mod fault;
pub mod hal;
pub mod mem;
pub mod tlb;
pub mod utils;

/// Per-registration client id distinguishing concurrent user contexts on
/// one device.
pub type Cpid = i32;
/// Host process id of a registering process.
pub type Hpid = i32;

pub use device::{Device, DeviceConfig, FaultMode};
pub use error::{MmuError, MmuResult};
pub use hal::{DeviceBus, DeviceCaps, Direction, FaultInfo, HostVm, NotifyInfo};
