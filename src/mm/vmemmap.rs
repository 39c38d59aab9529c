//! Per-page metadata for physical RAM
//!
//! One [`HypPage`] per RAM page frame, grouped in sections that mirror the
//! RAM extents of the region registry. This is the authoritative record of
//! what the host may do with its memory, independent of what the host
//! stage-2 currently maps. It is guarded by the host lock.
//!
//! Looking up a page outside RAM is a bug and panics.

use alloc::vec;
use alloc::vec::Vec;

use crate::arch::aarch64::defs::{PAGE_SHIFT, PAGE_SIZE};
use crate::mem_protect::state::PageState;
use crate::mm::memblock::RegionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HypPage {
    /// What the host may do with this page.
    pub host_state: PageState,
    /// Live hypervisor references (pins).
    pub refcount: u16,
}

// Keep the per-page entry small: there is one for every page of RAM.
static_assertions::assert_eq_size!(HypPage, u32);

struct Section {
    base_pfn: u64,
    pages: Vec<HypPage>,
}

pub struct Vmemmap {
    sections: Vec<Section>,
}

impl Vmemmap {
    /// Every RAM page starts out owned by the host.
    pub fn new(registry: &RegionRegistry) -> Self {
        let sections = registry
            .regions()
            .iter()
            .map(|reg| Section {
                base_pfn: reg.base >> PAGE_SHIFT,
                pages: vec![
                    HypPage {
                        host_state: PageState::OWNED,
                        refcount: 0,
                    };
                    reg.nr_pages()
                ],
            })
            .collect();

        Self { sections }
    }

    fn slot(&self, phys: u64) -> (usize, usize) {
        let pfn = phys >> PAGE_SHIFT;
        let idx = self.sections.partition_point(|s| s.base_pfn <= pfn);
        if idx > 0 {
            let sec = &self.sections[idx - 1];
            let off = (pfn - sec.base_pfn) as usize;
            if off < sec.pages.len() {
                return (idx - 1, off);
            }
        }
        panic!("vmemmap: {:#x} is not RAM", phys);
    }

    pub fn page(&self, phys: u64) -> &HypPage {
        let (s, off) = self.slot(phys);
        &self.sections[s].pages[off]
    }

    pub fn page_mut(&mut self, phys: u64) -> &mut HypPage {
        let (s, off) = self.slot(phys);
        &mut self.sections[s].pages[off]
    }

    pub fn host_state(&self, phys: u64) -> PageState {
        self.page(phys).host_state
    }

    pub fn set_host_state(&mut self, addr: u64, size: u64, state: PageState) {
        let end = addr + size;
        let mut cur = addr;
        while cur < end {
            self.page_mut(cur).host_state = state;
            cur += PAGE_SIZE;
        }
    }

    /// Every page of `[addr, addr + size)` is exactly in `state`.
    pub fn range_in_state(&self, addr: u64, size: u64, state: PageState) -> bool {
        let end = addr + size;
        let mut cur = addr;
        while cur < end {
            if self.host_state(cur) != state {
                return false;
            }
            cur += PAGE_SIZE;
        }
        true
    }

    pub fn page_count(&self, phys: u64) -> u16 {
        self.page(phys).refcount
    }

    pub fn page_ref_inc(&mut self, phys: u64) {
        let page = self.page_mut(phys);
        page.refcount = match page.refcount.checked_add(1) {
            Some(count) => count,
            None => panic!("vmemmap: refcount overflow at {:#x}", phys),
        };
    }

    pub fn page_ref_dec(&mut self, phys: u64) {
        let page = self.page_mut(phys);
        page.refcount = match page.refcount.checked_sub(1) {
            Some(count) => count,
            None => panic!("vmemmap: refcount underflow at {:#x}", phys),
        };
    }
}
