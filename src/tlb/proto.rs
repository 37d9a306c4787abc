//! Encoding of device translation descriptors and the small amount of
//! protocol around pushing them at the hardware.
//!
//! An entry is two 64-bit words. Word 0 carries the physical frame number and
//! the owning host pid; word 1 packs the key/tag split of the virtual page
//! number together with cpid, the host/card location bit, the valid bit and a
//! copy of the frame number for the walker's comparator stage. Malformed
//! input (addresses outside the device windows) is a caller validation
//! concern, not checked here.

use super::{CPID_BITS, PageLocation, STRM_BITS, TlbOrder};
use crate::hal::DeviceBus;
use crate::{Cpid, Hpid};

/// One encoded descriptor, ready for the device queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TlbEntry(pub [u64; 2]);

impl TlbEntry {
    /// The valid bit distinguishes map from unmap descriptors.
    #[must_use]
    pub fn is_map(&self, ord: &TlbOrder) -> bool {
        let shift = ord.key_size + ord.tag_size + CPID_BITS + STRM_BITS;
        self.0[1] >> shift & 1 == 1
    }
}

/// Splits a base-page number into this granularity's set key and tag.
fn key_tag(ord: &TlbOrder, vpn: u64) -> (u64, u64) {
    let idx = vpn >> (ord.page_shift - super::BASE_PAGE_SHIFT);
    (idx & ord.key_mask, (idx >> ord.key_size) & ord.tag_mask)
}

/// Encodes a map descriptor installing `vpn -> paddr` for (cpid, hpid).
/// `paddr` is a byte address in whichever window `loc` names; for huge
/// entries it must be the first frame of the group (the walker assumes
/// contiguity within one huge unit).
#[must_use]
pub fn create_map_entry(
    ord: &TlbOrder,
    vpn: u64,
    paddr: u64,
    loc: PageLocation,
    cpid: Cpid,
    hpid: Hpid,
) -> TlbEntry {
    let (key, tag) = key_tag(ord, vpn);
    let pfn = (paddr >> ord.page_shift) & ord.phy_mask;

    let w0 = pfn | (hpid as u64) << 32;
    let w1 = key
        | tag << ord.key_size
        | (cpid as u64) << (ord.key_size + ord.tag_size)
        | (loc as u64) << (ord.key_size + ord.tag_size + CPID_BITS)
        | 1u64 << (ord.key_size + ord.tag_size + CPID_BITS + STRM_BITS)
        | pfn << (ord.key_size + ord.tag_size + CPID_BITS + STRM_BITS + 1);

    TlbEntry([w0, w1])
}

/// Encodes an unmap descriptor clearing whatever entry holds `vpn` for
/// `hpid`. The valid bit stays zero.
#[must_use]
pub fn create_unmap_entry(ord: &TlbOrder, vpn: u64, hpid: Hpid) -> TlbEntry {
    let (key, tag) = key_tag(ord, vpn);
    let w0 = (hpid as u64) << 32;
    let w1 = key | tag << ord.key_size;
    TlbEntry([w0, w1])
}

/// Writes a batch of descriptors to the device queue and rings the doorbell.
/// Outside of the simulated bus the doorbell write blocks until the device
/// acknowledges the batch.
pub fn service_device(bus: &dyn DeviceBus, ord: &TlbOrder, entries: &[TlbEntry]) {
    if entries.is_empty() {
        return;
    }
    bus.push_entries(ord.class(), entries);
    bus.ring_doorbell(ord.class());
}

/// Pauses the device table walker for the guard's lifetime. Every multi-step
/// table edit must hold one of these so the walker never observes a half
/// rewritten range.
pub struct WalkerPause<'a> {
    bus: &'a dyn DeviceBus,
}

impl<'a> WalkerPause<'a> {
    pub fn new(bus: &'a dyn DeviceBus) -> Self {
        bus.set_walker_paused(true);
        Self { bus }
    }
}

impl Drop for WalkerPause<'_> {
    fn drop(&mut self) {
        self.bus.set_walker_paused(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlb::{BASE_PAGE_SHIFT, PAGES_IN_HUGE};

    #[test]
    fn map_entry_packs_fields() {
        let ord = TlbOrder::regular();
        let e = create_map_entry(&ord, 0x1234, 0xabc000, PageLocation::Host, 3, 77);

        let pfn = (0xabc000u64 >> ord.page_shift) & ord.phy_mask;
        assert_eq!(e.0[0] & 0xffff_ffff, pfn);
        assert_eq!(e.0[0] >> 32, 77);

        assert_eq!(e.0[1] & ord.key_mask, 0x1234 & ord.key_mask);
        let tag = (e.0[1] >> ord.key_size) & ord.tag_mask;
        assert_eq!(tag, 0x1234 >> ord.key_size);
        let cpid = (e.0[1] >> (ord.key_size + ord.tag_size)) & ((1 << CPID_BITS) - 1);
        assert_eq!(cpid, 3);
        assert!(e.is_map(&ord));
    }

    #[test]
    fn huge_entry_indexes_by_group() {
        let ord = TlbOrder::huge();
        // two adjacent huge groups must land in adjacent sets
        let a = create_map_entry(&ord, 0, 0, PageLocation::Card, 0, 1);
        let b = create_map_entry(&ord, PAGES_IN_HUGE, 0, PageLocation::Card, 0, 1);
        assert_eq!(a.0[1] & ord.key_mask, 0);
        assert_eq!(b.0[1] & ord.key_mask, 1);
        // group index, not base-page number, feeds the comparator
        let idx = PAGES_IN_HUGE >> (ord.page_shift - BASE_PAGE_SHIFT);
        assert_eq!(idx, 1);
    }

    #[test]
    fn unmap_entry_leaves_valid_clear() {
        let ord = TlbOrder::regular();
        let e = create_unmap_entry(&ord, 0x55, 42);
        assert!(!e.is_map(&ord));
        assert_eq!(e.0[0] >> 32, 42);
        assert_eq!(e.0[1] & ord.key_mask, 0x55 & ord.key_mask);
    }
}
