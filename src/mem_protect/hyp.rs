//! Hypervisor stage-1
//!
//! The hyp maps RAM it owns or borrows at `hyp_va(phys)`. Ownership state
//! is carried only in the software bits of those mappings.

use crate::arch::aarch64::defs::PAGE_SIZE;
use crate::arch::aarch64::mm::pte::{leaf_prot, pte_valid, PAGE_HYP, PAGE_HYP_DEVICE};
use crate::arch::aarch64::mm::{PageTable, Prot, PteOps};
use crate::error::{Error, Result};
use crate::mem_protect::state::PageState;
use crate::mm::allocator::HypPool;
use crate::mm::memblock::RegionRegistry;
use crate::platform::hyp_pa;

pub(crate) struct HypS1Ops;

impl PteOps for HypS1Ops {
    fn force_pte(&self, _addr: u64, _end: u64, _prot: Prot) -> bool {
        true
    }

    fn pte_is_counted(&self, raw: u64, _level: u32) -> bool {
        raw != 0
    }
}

pub fn default_hyp_prot(regions: &RegionRegistry, phys: u64) -> Prot {
    if regions.addr_is_memory(phys) {
        PAGE_HYP
    } else {
        PAGE_HYP_DEVICE
    }
}

fn hyp_page_state(raw: u64) -> PageState {
    if !pte_valid(raw) {
        return PageState::NOPAGE;
    }

    let prot = leaf_prot(raw);
    let mut state = PageState::from_prot(prot);
    if prot & Prot::RWX != PAGE_HYP {
        state |= PageState::RESTRICTED_PROT;
    }
    state
}

/// Everything guarded by the hyp lock.
pub struct HypMmu {
    pub(crate) pgt: PageTable,
    pub(crate) pool: HypPool,
}

impl HypMmu {
    pub fn new(mut pool: HypPool, ia_bits: u32) -> Result<Self> {
        let pgt = PageTable::new(&mut pool, ia_bits)?;
        Ok(Self { pgt, pool })
    }

    pub fn check_page_state_range(&self, addr: u64, size: u64, state: PageState) -> Result<()> {
        self.pgt.walk_leaves(&self.pool, addr, size, &mut |_, raw, _| {
            if hyp_page_state(raw) == state {
                Ok(())
            } else {
                Err(Error::Perm)
            }
        })
    }

    /// Map `[addr, addr + size)` onto its linear-map physical address.
    pub fn create_mappings_locked(&mut self, addr: u64, size: u64, prot: Prot) -> Result<()> {
        self.pgt.map(&mut self.pool, &HypS1Ops, addr, size, hyp_pa(addr), prot)
    }

    /// Bytes of the range that were actually mapped.
    pub fn unmap(&mut self, addr: u64, size: u64) -> Result<u64> {
        self.pgt.unmap(&mut self.pool, &HypS1Ops, addr, size)
    }

    /// Enough free pool pages to map `size` bytes whatever the table shape.
    pub fn has_room_for(&self, size: u64) -> bool {
        self.pool.free_pages() >= self.pgt.max_tables_for(size)
    }

    pub fn page_state(&self, addr: u64) -> Result<PageState> {
        let (raw, _) = self.pgt.get_leaf(&self.pool, addr & !(PAGE_SIZE - 1))?;
        Ok(hyp_page_state(raw))
    }
}
