//! Guest stage-2
//!
//! Guest tables are always page-granular: a block could not be rebuilt
//! lazily once some of its pages have been donated.

use crate::arch::aarch64::defs::PAGE_SIZE;
use crate::arch::aarch64::mm::pte::{leaf_prot, pte_valid};
use crate::arch::aarch64::mm::{PageTable, Prot, PteOps};
use crate::error::{Error, Result};
use crate::mem_protect::state::PageState;
use crate::mm::allocator::HypPool;

pub(crate) struct GuestS2Ops;

impl PteOps for GuestS2Ops {
    fn force_pte(&self, _addr: u64, _end: u64, _prot: Prot) -> bool {
        true
    }

    fn pte_is_counted(&self, raw: u64, _level: u32) -> bool {
        raw != 0
    }
}

pub(crate) fn guest_page_state(raw: u64) -> PageState {
    if !pte_valid(raw) {
        return PageState::NOPAGE;
    }

    let prot = leaf_prot(raw);
    let mut state = PageState::from_prot(prot);
    if prot & Prot::RWX != Prot::RWX {
        state |= PageState::RESTRICTED_PROT;
    }
    state
}

/// Everything guarded by a VM's lock. The table is gone once the VM has
/// been torn down.
pub struct GuestMmu {
    pgt: Option<PageTable>,
    pub(crate) pool: HypPool,
}

impl GuestMmu {
    pub fn new(mut pool: HypPool, ia_bits: u32) -> Result<Self> {
        let pgt = PageTable::new(&mut pool, ia_bits)?;
        Ok(Self {
            pgt: Some(pgt),
            pool,
        })
    }

    fn pgt(&self) -> Result<&PageTable> {
        self.pgt.as_ref().ok_or(Error::Inval)
    }

    pub fn get_leaf(&self, ipa: u64) -> Result<(u64, u32)> {
        self.pgt()?.get_leaf(&self.pool, ipa)
    }

    pub fn check_page_state_range(&self, addr: u64, size: u64, state: PageState) -> Result<()> {
        self.pgt()?.walk_leaves(&self.pool, addr, size, &mut |_, raw, _| {
            if guest_page_state(raw) == state {
                Ok(())
            } else {
                Err(Error::Perm)
            }
        })
    }

    pub fn map(&mut self, ipa: u64, size: u64, phys: u64, prot: Prot) -> Result<()> {
        let pgt = self.pgt.as_mut().ok_or(Error::Inval)?;
        pgt.map(&mut self.pool, &GuestS2Ops, ipa, size, phys, prot)
    }

    pub fn annotate(&mut self, ipa: u64, size: u64, annotation: u64) -> Result<()> {
        let pgt = self.pgt.as_mut().ok_or(Error::Inval)?;
        pgt.annotate(&mut self.pool, &GuestS2Ops, ipa, size, annotation)
    }

    pub fn unmap(&mut self, ipa: u64, size: u64) -> Result<u64> {
        let pgt = self.pgt.as_mut().ok_or(Error::Inval)?;
        pgt.unmap(&mut self.pool, &GuestS2Ops, ipa, size)
    }

    pub fn relax_perms(&mut self, ipa: u64, prot: Prot) -> Result<()> {
        let pgt = self.pgt.as_mut().ok_or(Error::Inval)?;
        pgt.relax_perms(&mut self.pool, ipa, prot)
    }

    pub fn wrprotect(&mut self, ipa: u64, size: u64) -> Result<()> {
        let pgt = self.pgt.as_mut().ok_or(Error::Inval)?;
        pgt.wrprotect(&mut self.pool, ipa, size)
    }

    /// Valid leaves in `[ipa, ipa + size)`, as `(ipa, raw)` pairs.
    pub fn for_each_valid_leaf(
        &self,
        ipa: u64,
        size: u64,
        f: &mut dyn FnMut(u64, u64) -> Result<()>,
    ) -> Result<()> {
        self.pgt()?.walk_leaves(&self.pool, ipa, size, &mut |addr, raw, _| {
            if pte_valid(raw) {
                f(addr, raw)
            } else {
                Ok(())
            }
        })
    }

    pub fn has_room_for(&self, size: u64) -> bool {
        match self.pgt() {
            Ok(pgt) => self.pool.free_pages() >= pgt.max_tables_for(size),
            Err(_) => false,
        }
    }

    pub fn ia_limit(&self) -> u64 {
        self.pgt().map(PageTable::ia_limit).unwrap_or(0)
    }

    /// Free every table page back to the pool.
    pub fn destroy(&mut self) {
        if let Some(pgt) = self.pgt.take() {
            pgt.destroy(&mut self.pool);
        }
    }

    pub fn page_state(&self, ipa: u64) -> Result<PageState> {
        let (raw, _) = self.get_leaf(ipa & !(PAGE_SIZE - 1))?;
        Ok(guest_page_state(raw))
    }
}
