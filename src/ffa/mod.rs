//! FF-A memory sharing, host side
//!
//! When the host lends or shares memory with the secure world, the
//! hypervisor forwards the call and records in the host stage-2 that the
//! constituent ranges are shared. The secure world has no table here, so
//! only the host side of each transition is checked and updated.

pub mod descriptors;

use log::warn;

use crate::arch::aarch64::defs::PAGE_SIZE;
use crate::error::{Error, Result};
use crate::mem_protect::MemProtect;
use crate::platform::phys_to_pfn;

pub use descriptors::{parse_mem_region, MemRegionAddrRange, ParsedMemRegion};

fn range_pages(range: &MemRegionAddrRange) -> Option<u64> {
    let size = range.size();
    if size == 0 || size % PAGE_SIZE != 0 {
        return None;
    }
    Some(size / PAGE_SIZE)
}

/// Number of leading ranges successfully shared.
fn host_share_ranges(mp: &MemProtect, ranges: &[MemRegionAddrRange]) -> usize {
    ranges
        .iter()
        .take_while(|range| match range_pages(range) {
            Some(nr) => mp.host_share_ffa(phys_to_pfn(range.address), nr).is_ok(),
            None => false,
        })
        .count()
}

fn host_unshare_ranges(mp: &MemProtect, ranges: &[MemRegionAddrRange]) -> usize {
    ranges
        .iter()
        .take_while(|range| match range_pages(range) {
            Some(nr) => mp.host_unshare_ffa(phys_to_pfn(range.address), nr).is_ok(),
            None => false,
        })
        .count()
}

/// Mark every range as shared with the secure world, or none of them.
///
/// # Errors
/// * `Perm` - some range is not exclusively owned by the host
pub fn share_ranges(mp: &MemProtect, ranges: &[MemRegionAddrRange]) -> Result<()> {
    let nshared = host_share_ranges(mp, ranges);
    if nshared == ranges.len() {
        return Ok(());
    }

    warn!("ffa: share of range {} failed, rolling back {}", nshared, nshared);
    let undone = host_unshare_ranges(mp, &ranges[..nshared]);
    if undone != nshared {
        warn!("ffa: rollback stopped after {} of {} ranges", undone, nshared);
    }
    Err(Error::Perm)
}

/// Inverse of [`share_ranges`], with the same all-or-nothing behaviour.
pub fn unshare_ranges(mp: &MemProtect, ranges: &[MemRegionAddrRange]) -> Result<()> {
    let nunshared = host_unshare_ranges(mp, ranges);
    if nunshared == ranges.len() {
        return Ok(());
    }

    warn!("ffa: unshare of range {} failed, rolling back {}", nunshared, nunshared);
    let redone = host_share_ranges(mp, &ranges[..nunshared]);
    if redone != nunshared {
        warn!("ffa: rollback stopped after {} of {} ranges", redone, nunshared);
    }
    Err(Error::Perm)
}

/// Parse the host's TX buffer and share the constituents of the region.
pub fn share_mem_region(mp: &MemProtect, tx_buf: &[u8]) -> Result<ParsedMemRegion> {
    let region = parse_mem_region(tx_buf)?;
    share_ranges(mp, &region.ranges)?;
    Ok(region)
}

/// Reclaim path: unshare the constituents once the secure world let go.
pub fn unshare_mem_region(mp: &MemProtect, region: &ParsedMemRegion) -> Result<()> {
    unshare_ranges(mp, &region.ranges)
}
