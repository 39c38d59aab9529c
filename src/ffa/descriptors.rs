//! FF-A v1.1 Composite Memory Region Descriptor parsing (DEN0077A).
//!
//! Only what the host stage-2 bookkeeping needs: the sender, the receiver
//! and the list of constituent address ranges of a MEM_SHARE / MEM_LEND
//! transaction placed in the host's TX buffer.

use alloc::vec::Vec;

use crate::arch::aarch64::defs::PAGE_SIZE;
use crate::error::{Error, Result};

/// Maximum number of address ranges per parsed descriptor.
pub const MAX_ADDR_RANGES: usize = 16;

/// FF-A defines its own 4KB page, independent of the translation granule.
pub const FFA_PAGE_SIZE: u64 = 4096;

// Memory Region Descriptor (Table 5.19), 48 bytes.
const MEM_REGION_SIZE: usize = 48;
const MEM_REGION_SENDER: usize = 0;
const MEM_REGION_FLAGS: usize = 8;
const MEM_REGION_HANDLE: usize = 16;
const MEM_REGION_RECEIVER_COUNT: usize = 32;
const MEM_REGION_RECEIVERS_OFFSET: usize = 36;

// Memory Access Permission Descriptor (Table 5.21), 16 bytes.
const ACCESS_DESC_SIZE: usize = 16;
const ACCESS_DESC_COMPOSITE_OFFSET: usize = 4;

// Composite Memory Region Descriptor (Table 5.24), 16 bytes.
const COMPOSITE_SIZE: usize = 16;

// Address Range Descriptor (Table 5.25), 16 bytes.
const ADDR_RANGE_SIZE: usize = 16;

/// One contiguous constituent of a memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRegionAddrRange {
    pub address: u64,
    pub page_count: u32,
}

impl MemRegionAddrRange {
    pub fn size(&self) -> u64 {
        self.page_count as u64 * FFA_PAGE_SIZE
    }
}

/// Parsed result of a composite memory region descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMemRegion {
    pub sender_id: u16,
    pub receiver_id: u16,
    pub flags: u32,
    pub handle: u64,
    pub total_page_count: u32,
    pub ranges: Vec<MemRegionAddrRange>,
}

fn read_u16(buf: &[u8], off: usize) -> Result<u16> {
    let bytes = buf.get(off..off + 2).ok_or(Error::Inval)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(buf: &[u8], off: usize) -> Result<u32> {
    let bytes = buf.get(off..off + 4).ok_or(Error::Inval)?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    Ok(u32::from_le_bytes(raw))
}

fn read_u64(buf: &[u8], off: usize) -> Result<u64> {
    let bytes = buf.get(off..off + 8).ok_or(Error::Inval)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(raw))
}

/// Parse a memory region descriptor.
///
/// Fragmented descriptors are not supported: `buf` must hold the whole
/// transaction.
///
/// # Errors
/// * `Inval` - truncated descriptor, no or several receivers, no ranges,
///   unaligned range, or page counts that do not add up
/// * `TooBig` - more than [`MAX_ADDR_RANGES`] ranges
pub fn parse_mem_region(buf: &[u8]) -> Result<ParsedMemRegion> {
    if buf.len() < MEM_REGION_SIZE {
        return Err(Error::Inval);
    }

    let sender_id = read_u16(buf, MEM_REGION_SENDER)?;
    let flags = read_u32(buf, MEM_REGION_FLAGS)?;
    let handle = read_u64(buf, MEM_REGION_HANDLE)?;
    let receiver_count = read_u32(buf, MEM_REGION_RECEIVER_COUNT)?;
    let receivers_offset = read_u32(buf, MEM_REGION_RECEIVERS_OFFSET)? as usize;

    // Only single-receiver transactions.
    if receiver_count != 1 {
        return Err(Error::Inval);
    }

    let access = buf
        .get(receivers_offset..receivers_offset + ACCESS_DESC_SIZE)
        .ok_or(Error::Inval)?;
    let receiver_id = read_u16(access, 0)?;
    let composite_offset = read_u32(access, ACCESS_DESC_COMPOSITE_OFFSET)? as usize;

    let composite = buf
        .get(composite_offset..composite_offset + COMPOSITE_SIZE)
        .ok_or(Error::Inval)?;
    let total_page_count = read_u32(composite, 0)?;
    let address_range_count = read_u32(composite, 4)? as usize;

    if address_range_count == 0 {
        return Err(Error::Inval);
    }
    if address_range_count > MAX_ADDR_RANGES {
        return Err(Error::TooBig);
    }

    let ranges_start = composite_offset + COMPOSITE_SIZE;
    let mut ranges = Vec::with_capacity(address_range_count);
    for i in 0..address_range_count {
        let off = ranges_start + i * ADDR_RANGE_SIZE;
        let address = read_u64(buf, off)?;
        let page_count = read_u32(buf, off + 8)?;

        if address % PAGE_SIZE != 0 {
            return Err(Error::Inval);
        }
        ranges.push(MemRegionAddrRange { address, page_count });
    }

    let sum: u64 = ranges.iter().map(|r| r.page_count as u64).sum();
    if sum != total_page_count as u64 {
        return Err(Error::Inval);
    }

    Ok(ParsedMemRegion {
        sender_id,
        receiver_id,
        flags,
        handle,
        total_page_count,
        ranges,
    })
}

/// Encode a single-receiver descriptor the way a host driver lays it out.
pub fn build_mem_region(sender_id: u16, receiver_id: u16, ranges: &[MemRegionAddrRange]) -> Vec<u8> {
    let comp_off = MEM_REGION_SIZE + ACCESS_DESC_SIZE;
    let ranges_start = comp_off + COMPOSITE_SIZE;
    let mut buf = alloc::vec![0u8; ranges_start + ranges.len() * ADDR_RANGE_SIZE];

    buf[MEM_REGION_SENDER..MEM_REGION_SENDER + 2].copy_from_slice(&sender_id.to_le_bytes());
    buf[MEM_REGION_RECEIVER_COUNT..MEM_REGION_RECEIVER_COUNT + 4].copy_from_slice(&1u32.to_le_bytes());
    buf[MEM_REGION_RECEIVERS_OFFSET..MEM_REGION_RECEIVERS_OFFSET + 4]
        .copy_from_slice(&(MEM_REGION_SIZE as u32).to_le_bytes());

    let access = MEM_REGION_SIZE;
    buf[access..access + 2].copy_from_slice(&receiver_id.to_le_bytes());
    buf[access + ACCESS_DESC_COMPOSITE_OFFSET..access + ACCESS_DESC_COMPOSITE_OFFSET + 4]
        .copy_from_slice(&(comp_off as u32).to_le_bytes());

    let total: u32 = ranges.iter().map(|r| r.page_count).sum();
    buf[comp_off..comp_off + 4].copy_from_slice(&total.to_le_bytes());
    buf[comp_off + 4..comp_off + 8].copy_from_slice(&(ranges.len() as u32).to_le_bytes());

    for (i, range) in ranges.iter().enumerate() {
        let off = ranges_start + i * ADDR_RANGE_SIZE;
        buf[off..off + 8].copy_from_slice(&range.address.to_le_bytes());
        buf[off + 8..off + 12].copy_from_slice(&range.page_count.to_le_bytes());
    }

    buf
}
