//! Host DTB (Device Tree Blob) memory discovery
//!
//! Builds the memblock list the protection engine is initialized with:
//! every `/memory*` node contributes RAM, and `/reserved-memory` children
//! carrying `no-map` are split out of it with the NOMAP flag so that the
//! host idmap never covers them.
//!
//! The `fdt` crate does zero-copy parsing; only the resulting region list
//! is allocated.

use alloc::vec::Vec;

use fdt::node::FdtNode;
use fdt::Fdt;

use crate::error::{Error, Result};
use crate::mm::memblock::{MemRange, MemblockRegion};

/// FDT magic (0xD00DFEED big-endian)
pub const FDT_MAGIC: u32 = 0xD00D_FEED;

fn node_ranges(node: &FdtNode<'_, '_>) -> Vec<MemRange> {
    let Some(regs) = node.reg() else {
        return Vec::new();
    };
    regs.filter_map(|reg| {
        let start = reg.starting_address as u64;
        let size = reg.size? as u64;
        (size != 0).then(|| MemRange::new(start, start + size))
    })
    .collect()
}

fn is_memory_node(node: &FdtNode<'_, '_>) -> bool {
    match node.property("device_type") {
        Some(prop) => prop.value.split(|&b| b == 0).next() == Some(b"memory".as_slice()),
        None => node.name == "memory" || node.name.starts_with("memory@"),
    }
}

/// Cut `holes` out of `ram`, returning the mapped pieces and the overlaps.
fn split_nomap(ram: MemRange, holes: &[MemRange], out: &mut Vec<MemblockRegion>) {
    let mut cursor = ram.start;

    for hole in holes {
        let start = hole.start.max(ram.start);
        let end = hole.end.min(ram.end);
        if start >= end || end <= cursor {
            continue;
        }
        let start = start.max(cursor);
        if start > cursor {
            out.push(MemblockRegion::new(cursor, start - cursor));
        }
        out.push(MemblockRegion::nomap(start, end - start));
        cursor = end;
    }

    if cursor < ram.end {
        out.push(MemblockRegion::new(cursor, ram.end - cursor));
    }
}

/// Collect the memory regions described by a parsed tree.
///
/// # Errors
/// * `Inval` - no RAM described at all
pub fn memory_regions(fdt: &Fdt<'_>) -> Result<Vec<MemblockRegion>> {
    let mut ram: Vec<MemRange> = fdt
        .all_nodes()
        .filter(is_memory_node)
        .flat_map(|node| node_ranges(&node))
        .collect();
    if ram.is_empty() {
        return Err(Error::Inval);
    }
    ram.sort_by_key(|r| r.start);

    let mut nomap: Vec<MemRange> = match fdt.find_node("/reserved-memory") {
        Some(resv) => resv
            .children()
            .filter(|child| child.property("no-map").is_some())
            .flat_map(|child| node_ranges(&child))
            .collect(),
        None => Vec::new(),
    };
    nomap.sort_by_key(|r| r.start);

    let mut regions = Vec::with_capacity(ram.len() + 2 * nomap.len());
    for range in ram {
        split_nomap(range, &nomap, &mut regions);
    }

    log::debug!("dtb: {} memblock regions", regions.len());
    Ok(regions)
}

/// Parse `blob` and collect its memory regions.
///
/// # Errors
/// * `Inval` - not a valid device tree, or no RAM in it
pub fn memory_regions_from_fdt(blob: &[u8]) -> Result<Vec<MemblockRegion>> {
    let fdt = Fdt::new(blob).map_err(|err| {
        log::warn!("dtb: parse failed: {:?}", err);
        Error::Inval
    })?;
    memory_regions(&fdt)
}

/// Boot-time variant for a blob handed over in a register.
///
/// # Safety
/// `addr` must point to readable memory holding a complete device tree
/// that stays mapped for the duration of the call.
pub unsafe fn memory_regions_from_ptr(addr: usize) -> Result<Vec<MemblockRegion>> {
    if addr == 0 {
        return Err(Error::Inval);
    }
    let magic = core::ptr::read_volatile(addr as *const u32);
    if u32::from_be(magic) != FDT_MAGIC {
        return Err(Error::Inval);
    }

    let fdt = Fdt::from_ptr(addr as *const u8).map_err(|_| Error::Inval)?;
    memory_regions(&fdt)
}
