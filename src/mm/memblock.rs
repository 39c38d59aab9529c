//! Physical memory region registry
//!
//! Sorted, non-overlapping list of RAM extents. Anything not covered by an
//! extent is device memory. Built once during setup and read-only after,
//! so lookups need no lock.

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::arch::aarch64::defs::PAGE_SHIFT;
use crate::error::{Error, Result};
use crate::platform::{page_aligned, HYP_MEMBLOCK_REGIONS, PKVM_NR_MOVEABLE_REGS};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MemblockFlags: u32 {
        /// Firmware forbids mapping this extent.
        const NOMAP = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemblockRegion {
    pub base: u64,
    pub size: u64,
    pub flags: MemblockFlags,
}

impl MemblockRegion {
    pub const fn new(base: u64, size: u64) -> Self {
        Self {
            base,
            size,
            flags: MemblockFlags::empty(),
        }
    }

    pub const fn nomap(base: u64, size: u64) -> Self {
        Self {
            base,
            size,
            flags: MemblockFlags::NOMAP,
        }
    }

    pub const fn end(&self) -> u64 {
        self.base + self.size
    }

    pub fn nr_pages(&self) -> usize {
        (self.size >> PAGE_SHIFT) as usize
    }
}

/// Half-open physical range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRange {
    pub start: u64,
    pub end: u64,
}

impl MemRange {
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub const fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    pub const fn includes(&self, child: &MemRange) -> bool {
        self.start <= child.start && child.end <= self.end
    }

    pub const fn size(&self) -> u64 {
        self.end - self.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Ram,
    Mmio,
}

/// Result of classifying an address: its kind plus the surrounding extent
/// (for MMIO, the gap between the neighbouring RAM extents).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: RegionKind,
    pub range: MemRange,
    pub region: Option<usize>,
}

pub struct RegionRegistry {
    regions: Vec<MemblockRegion>,
}

impl RegionRegistry {
    /// Sort and validate `regions`.
    ///
    /// # Errors
    /// * `Inval` - unaligned, empty or overlapping extents
    /// * `TooBig` - more extents than the hypervisor can track
    pub fn new(mut regions: Vec<MemblockRegion>) -> Result<Self> {
        if regions.len() > HYP_MEMBLOCK_REGIONS {
            return Err(Error::TooBig);
        }

        regions.sort_by_key(|r| r.base);
        for (i, reg) in regions.iter().enumerate() {
            if reg.size == 0 || !page_aligned(reg.base) || !page_aligned(reg.size) {
                return Err(Error::Inval);
            }
            if i > 0 && regions[i - 1].end() > reg.base {
                return Err(Error::Inval);
            }
        }

        Ok(Self { regions })
    }

    pub fn regions(&self) -> &[MemblockRegion] {
        &self.regions
    }

    pub fn region(&self, idx: usize) -> &MemblockRegion {
        &self.regions[idx]
    }

    /// Binary search for the extent holding `addr`.
    ///
    /// Returns the index of the RAM extent if any, and in every case the
    /// tightest range around `addr` with a single kind.
    pub fn find_mem_range(&self, addr: u64) -> (Option<usize>, MemRange) {
        let mut range = MemRange::new(0, u64::MAX);
        let (mut left, mut right) = (0usize, self.regions.len());

        while left < right {
            let cur = (left + right) >> 1;
            let reg = &self.regions[cur];
            if addr < reg.base {
                right = cur;
                range.end = reg.base;
            } else if addr >= reg.end() {
                left = cur + 1;
                range.start = reg.end();
            } else {
                return (Some(cur), MemRange::new(reg.base, reg.end()));
            }
        }

        (None, range)
    }

    pub fn classify(&self, addr: u64) -> Classification {
        let (region, range) = self.find_mem_range(addr);
        Classification {
            kind: if region.is_some() { RegionKind::Ram } else { RegionKind::Mmio },
            range,
            region,
        }
    }

    pub fn addr_is_memory(&self, addr: u64) -> bool {
        self.find_mem_range(addr).0.is_some()
    }

    /// RAM that firmware allows us to map.
    pub fn addr_is_allowed_memory(&self, addr: u64) -> bool {
        match self.find_mem_range(addr).0 {
            Some(idx) => !self.regions[idx].flags.contains(MemblockFlags::NOMAP),
            None => false,
        }
    }

    /// `[start, end)` lies entirely inside one RAM extent.
    pub fn range_is_memory(&self, start: u64, end: u64) -> bool {
        match self.find_mem_range(start) {
            (Some(_), range) => range.contains(end - 1),
            (None, _) => false,
        }
    }

    pub fn nr_memory_pages(&self) -> usize {
        self.regions.iter().map(MemblockRegion::nr_pages).sum()
    }
}

/// Ranges the host page-table pool was sized for. Everything outside is
/// unmoveable and may be unmapped to recycle pool pages.
pub struct MoveableRegions {
    regs: Vec<MemRange>,
}

impl MoveableRegions {
    pub fn new(mut regs: Vec<MemRange>) -> Result<Self> {
        if regs.len() > PKVM_NR_MOVEABLE_REGS {
            return Err(Error::TooBig);
        }
        regs.sort_by_key(|r| r.start);
        if regs.iter().any(|r| r.end <= r.start) {
            return Err(Error::Inval);
        }
        Ok(Self { regs })
    }

    /// Every RAM extent is moveable by default.
    pub fn from_memory(registry: &RegionRegistry) -> Self {
        Self {
            regs: registry
                .regions()
                .iter()
                .map(|r| MemRange::new(r.base, r.end()))
                .collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemRange> {
        self.regs.iter()
    }

    /// Complement of the moveable list within `[0, limit)`.
    pub fn unmoveable(&self, limit: u64) -> Vec<MemRange> {
        let mut out = Vec::new();
        let mut addr = 0u64;

        for reg in &self.regs {
            if reg.start > addr {
                out.push(MemRange::new(addr, reg.start));
            }
            addr = core::cmp::max(addr, reg.end);
        }
        if addr < limit {
            out.push(MemRange::new(addr, limit));
        }
        out
    }
}

/// Everything the engine knows about physical memory, fixed after setup.
pub struct MemLayout {
    pub regions: RegionRegistry,
    pub moveable: MoveableRegions,
}

/// Worst-case number of table pages to map `nr_pages` at page granularity.
pub fn pgtable_max_pages(nr_pages: usize) -> usize {
    let mut total = 0;
    let mut nr = nr_pages;

    for _ in 0..4 {
        nr = nr.div_ceil(512);
        total += nr;
    }
    total
}
