//! Host stage-2
//!
//! The host runs on an identity map that is populated lazily from its
//! memory aborts. Pages the host does not own are annotated with their
//! owner id instead of being mapped. For RAM the vmemmap is the source of
//! truth, for device memory the state lives only in the table.

use log::warn;

use crate::arch::aarch64::defs::*;
use crate::arch::aarch64::mm::pte::{
    is_table, leaf_prot, pte_to_phys, pte_valid, PKVM_HOST_MEM_PROT, PKVM_HOST_MMIO_PROT,
};
use crate::arch::aarch64::mm::{PageTable, Prot, Pte, PteOps};
use crate::error::{Error, Result};
use crate::mem_protect::component::{KVM_MAX_OWNER_ID, PKVM_ID_HOST};
use crate::mem_protect::state::PageState;
use crate::mm::allocator::HypPool;
use crate::mm::memblock::{MemLayout, MemRange, MemblockFlags, RegionRegistry};
use crate::mm::vmemmap::Vmemmap;
use crate::platform::align_down;

/// Default host mapping for RAM or device memory.
pub fn default_host_prot(is_memory: bool) -> Prot {
    if is_memory {
        PKVM_HOST_MEM_PROT
    } else {
        PKVM_HOST_MMIO_PROT
    }
}

pub(crate) struct HostS2Ops<'a> {
    regions: &'a RegionRegistry,
}

impl PteOps for HostS2Ops<'_> {
    /// Blocks are only safe for default mappings: cutting into a block
    /// drops the rest of it, which can be rebuilt lazily only if nothing
    /// but the default was there.
    fn force_pte(&self, addr: u64, end: u64, prot: Prot) -> bool {
        prot != default_host_prot(self.regions.range_is_memory(addr, end))
    }

    fn pte_is_counted(&self, raw: u64, level: u32) -> bool {
        if !pte_valid(raw) {
            return raw != 0;
        }
        if is_table(raw, level) {
            return true;
        }
        leaf_prot(raw) != default_host_prot(self.regions.addr_is_memory(pte_to_phys(raw)))
    }
}

/// State of a device page, read from its host stage-2 entry.
fn mmio_page_state(raw: u64) -> PageState {
    if raw == 0 {
        return PageState::OWNED;
    }
    if !pte_valid(raw) {
        return PageState::NOPAGE;
    }

    let prot = leaf_prot(raw);
    let mut state = PageState::from_prot(prot);
    if prot & (Prot::RWX | Prot::DEVICE | Prot::NORMAL_NC) != PKVM_HOST_MMIO_PROT {
        state |= PageState::RESTRICTED_PROT;
    }
    state
}

/// Everything guarded by the host lock.
pub struct HostMmu {
    pub(crate) pgt: PageTable,
    pub(crate) pool: HypPool,
    pub(crate) vmemmap: Vmemmap,
}

impl HostMmu {
    pub fn new(layout: &MemLayout, mut pool: HypPool, ia_bits: u32) -> Result<Self> {
        let pgt = PageTable::new(&mut pool, ia_bits)?;
        Ok(Self {
            pgt,
            pool,
            vmemmap: Vmemmap::new(&layout.regions),
        })
    }

    /// Run `f`, and on pool exhaustion recycle every unmoveable mapping
    /// and run it exactly once more.
    pub(crate) fn stage2_try<T>(
        &mut self,
        layout: &MemLayout,
        mut f: impl FnMut(&mut Self, &HostS2Ops<'_>) -> Result<T>,
    ) -> Result<T> {
        let ops = HostS2Ops {
            regions: &layout.regions,
        };

        match f(self, &ops) {
            Err(Error::NoMem) => {
                warn!(
                    "host stage-2 pool exhausted ({} free), recycling unmoveable mappings",
                    self.pool.free_pages()
                );
                self.unmap_unmoveable_regs(layout)?;
                f(self, &ops)
            }
            res => res,
        }
    }

    /// Drop the uncounted (default) mappings in a range.
    pub fn unmap_reg_locked(&mut self, layout: &MemLayout, start: u64, size: u64) -> Result<()> {
        let ops = HostS2Ops {
            regions: &layout.regions,
        };
        self.pgt.reclaim_leaves(&mut self.pool, &ops, start, size)
    }

    fn unmap_unmoveable_regs(&mut self, layout: &MemLayout) -> Result<()> {
        for reg in layout.moveable.unmoveable(self.pgt.ia_limit()) {
            self.unmap_reg_locked(layout, reg.start, reg.size())?;
        }
        Ok(())
    }

    pub fn idmap_locked(&mut self, layout: &MemLayout, addr: u64, size: u64, prot: Prot) -> Result<()> {
        self.stage2_try(layout, |mmu, ops| {
            mmu.pgt.map(&mut mmu.pool, ops, addr, size, addr, prot)
        })
    }

    /// Give `[addr, addr + size)` to `owner_id`. The host gets its default
    /// identity mapping back, anyone else is recorded as an annotation.
    pub fn set_owner_locked(&mut self, layout: &MemLayout, addr: u64, size: u64, owner_id: u32) -> Result<()> {
        let is_memory = layout.regions.addr_is_memory(addr);
        self.set_owner_tagged(layout, addr, size, owner_id, is_memory, PageState::empty())
    }

    /// As [`HostMmu::set_owner_locked`], with extra flags for the vmemmap
    /// when the host loses the pages.
    pub(crate) fn set_owner_tagged(
        &mut self,
        layout: &MemLayout,
        addr: u64,
        size: u64,
        owner_id: u32,
        is_memory: bool,
        nopage_tag: PageState,
    ) -> Result<()> {
        if owner_id > KVM_MAX_OWNER_ID {
            return Err(Error::Inval);
        }

        if owner_id == PKVM_ID_HOST {
            let prot = default_host_prot(layout.regions.addr_is_memory(addr));
            self.idmap_locked(layout, addr, size, prot)?;
        } else {
            let annotation = Pte::Owned(owner_id as u8).encode(LAST_LEVEL);
            self.stage2_try(layout, |mmu, ops| {
                mmu.pgt.annotate(&mut mmu.pool, ops, addr, size, annotation)
            })?;
        }

        if is_memory {
            let state = if owner_id == PKVM_ID_HOST {
                PageState::OWNED
            } else {
                PageState::NOPAGE | nopage_tag
            };
            self.vmemmap.set_host_state(addr, size, state);
        }
        Ok(())
    }

    /// Every page of the range is in `state`. The range may not straddle
    /// RAM and device memory.
    pub fn check_page_state_range(
        &self,
        layout: &MemLayout,
        addr: u64,
        size: u64,
        state: PageState,
    ) -> Result<()> {
        let (region, range) = layout.regions.find_mem_range(addr);
        if !range.contains(addr + size - 1) {
            return Err(Error::Inval);
        }
        self.check_page_state_in(layout, addr, size, state, region)
    }

    pub(crate) fn check_page_state_in(
        &self,
        layout: &MemLayout,
        addr: u64,
        size: u64,
        state: PageState,
        region: Option<usize>,
    ) -> Result<()> {
        let Some(idx) = region else {
            return self.pgt.walk_leaves(&self.pool, addr, size, &mut |_, raw, _| {
                if mmio_page_state(raw) == state {
                    Ok(())
                } else {
                    Err(Error::Perm)
                }
            });
        };

        if layout.regions.region(idx).flags.contains(MemblockFlags::NOMAP) {
            return Err(Error::Perm);
        }

        // Restricted RAM is always tagged in the vmemmap (module-owned), so
        // the table does not need to be consulted.
        if self.vmemmap.range_in_state(addr, size, state) {
            Ok(())
        } else {
            Err(Error::Perm)
        }
    }

    /// Update the vmemmap, restoring the identity map first if the host
    /// had lost access.
    pub fn set_page_state_range(
        &mut self,
        layout: &MemLayout,
        addr: u64,
        size: u64,
        state: PageState,
    ) -> Result<()> {
        if self.vmemmap.host_state(addr).contains(PageState::NOPAGE) {
            self.idmap_locked(layout, addr, size, PKVM_HOST_MEM_PROT)?;
        }
        self.vmemmap.set_host_state(addr, size, state);
        Ok(())
    }

    /// Largest block around `addr` that fits in `range` and can be mapped
    /// without clobbering an existing entry.
    ///
    /// # Errors
    /// * `Again` - someone mapped it already
    /// * `Perm` - the page is annotated as owned by someone else
    pub fn adjust_range(&self, layout: &MemLayout, addr: u64, range: MemRange) -> Result<MemRange> {
        let (raw, mut level) = self.pgt.get_leaf(&self.pool, addr)?;

        if pte_valid(raw) {
            return Err(Error::Again);
        }
        if raw != 0 {
            if layout.regions.addr_is_memory(addr)
                && !self.vmemmap.host_state(addr).contains(PageState::NOPAGE)
            {
                warn!("host stage-2 annotation at {:#x} without a NOPAGE vmemmap entry", addr);
            }
            return Err(Error::Perm);
        }

        loop {
            let granule = granule_size(level);
            let start = align_down(addr, granule);
            let cur = MemRange::new(start, start + granule);
            level += 1;
            if level > LAST_LEVEL || (level_supports_block(level) && range.includes(&cur)) {
                return Ok(cur);
            }
        }
    }

    pub fn get_leaf(&self, addr: u64) -> Result<(u64, u32)> {
        self.pgt.get_leaf(&self.pool, addr)
    }

    /// Host view of the page holding `addr`.
    pub fn page_state(&self, layout: &MemLayout, addr: u64) -> Result<PageState> {
        let addr = align_down(addr, PAGE_SIZE);
        if layout.regions.addr_is_memory(addr) {
            return Ok(self.vmemmap.host_state(addr));
        }
        let (raw, _) = self.get_leaf(addr)?;
        Ok(mmio_page_state(raw))
    }
}
