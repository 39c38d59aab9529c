//! Platform geometry
//!
//! Sizes and limits that the engine is built against. Everything that
//! depends on the board (RAM layout, carve-outs) comes in at runtime
//! through [`crate::mem_protect::MemProtectConfig`] instead.

use crate::arch::aarch64::defs::{PAGE_SHIFT, PAGE_SIZE};

// ── Address spaces ───────────────────────────────────────────────────
/// Input-address bits of the host stage-2 and the hyp stage-1.
pub const HOST_IA_BITS: u32 = 48;
pub const HYP_IA_BITS: u32 = 48;
/// Default IPA size for guests.
pub const GUEST_IA_BITS: u32 = 40;

/// The hypervisor sees RAM through a linear map at this offset.
pub const HYP_VA_OFFSET: u64 = 0x0000_8000_0000_0000;

// ── Registry limits ──────────────────────────────────────────────────
pub const HYP_MEMBLOCK_REGIONS: usize = 128;
pub const PKVM_NR_MOVEABLE_REGS: usize = 512;
pub const MAX_HOST_FAULT_HANDLERS: usize = 16;

// ── Pool sizing ──────────────────────────────────────────────────────
/// Spare host stage-2 table pages for lazily-mapped MMIO.
pub const HOST_S2_MMIO_SPARE_PAGES: usize = 16;

#[inline]
pub const fn pfn_to_phys(pfn: u64) -> u64 {
    pfn << PAGE_SHIFT
}

#[inline]
pub const fn phys_to_pfn(phys: u64) -> u64 {
    phys >> PAGE_SHIFT
}

/// Hyp linear-map address of a physical address.
#[inline]
pub const fn hyp_va(phys: u64) -> u64 {
    phys + HYP_VA_OFFSET
}

#[inline]
pub const fn hyp_pa(va: u64) -> u64 {
    va.wrapping_sub(HYP_VA_OFFSET)
}

#[inline]
pub const fn page_aligned(addr: u64) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}

#[inline]
pub const fn align_down(addr: u64, size: u64) -> u64 {
    addr & !(size - 1)
}

#[inline]
pub const fn page_align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}
