//! Page-table page pool
//!
//! Buddy allocator over a physically contiguous range of pages that the
//! hypervisor owns. Each owning domain (host stage-2, hyp stage-1, every
//! guest stage-2) draws its table pages from its own pool.
//!
//! Pages are refcounted: an allocation comes back with a count of 1 and is
//! returned to the free lists when the last [`HypPool::put_page`] drops it
//! to zero. Free blocks are zeroed, so every allocation is a zeroed table.

use alloc::vec;
use alloc::vec::Vec;

use crate::arch::aarch64::defs::{PAGE_SHIFT, PTRS_PER_TABLE};
use crate::error::{Error, Result};

/// Largest block order the pool will ever hand out (exclusive).
pub const MAX_ORDER: u8 = 11;
const NO_ORDER: u8 = u8::MAX;

/// Backing contents of one pool page, seen as a translation table.
pub type TablePage = [u64; PTRS_PER_TABLE];

#[derive(Debug, Clone, Copy)]
struct PoolPage {
    refcount: u16,
    order: u8,
    free: bool,
}

pub struct HypPool {
    start: u64,
    nr_pages: usize,
    max_order: u8,
    pages: Vec<PoolPage>,
    free_area: Vec<Vec<usize>>,
    frames: Vec<TablePage>,
    free_pages: usize,
}

impl HypPool {
    /// Build a pool over `nr_pages` pages starting at `pfn`.
    pub fn new(pfn: u64, nr_pages: usize) -> Result<Self> {
        if nr_pages == 0 {
            return Err(Error::Inval);
        }

        let order_fit = usize::BITS - nr_pages.leading_zeros();
        let max_order = core::cmp::min(MAX_ORDER as u32, order_fit) as u8;

        let mut pool = Self {
            start: pfn << PAGE_SHIFT,
            nr_pages,
            max_order,
            pages: vec![
                PoolPage {
                    refcount: 1,
                    order: 0,
                    free: false,
                };
                nr_pages
            ],
            free_area: vec![Vec::new(); max_order as usize],
            frames: vec![[0u64; PTRS_PER_TABLE]; nr_pages],
            free_pages: 0,
        };

        // Release every page once so that buddies coalesce.
        for idx in 0..nr_pages {
            pool.put_idx(idx);
        }

        Ok(pool)
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn nr_pages(&self) -> usize {
        self.nr_pages
    }

    pub fn free_pages(&self) -> usize {
        self.free_pages
    }

    pub fn contains(&self, phys: u64) -> bool {
        phys >= self.start && ((phys - self.start) >> PAGE_SHIFT) < self.nr_pages as u64
    }

    /// Allocate `1 << order` contiguous zeroed pages.
    pub fn alloc_pages(&mut self, order: u8) -> Option<u64> {
        if order >= self.max_order {
            return None;
        }

        let mut i = order;
        while (i as usize) < self.free_area.len() && self.free_area[i as usize].is_empty() {
            i += 1;
        }
        if i >= self.max_order {
            return None;
        }

        let idx = self.free_area[i as usize].pop()?;
        self.pages[idx].free = false;

        while i > order {
            i -= 1;
            let buddy = idx + (1usize << i);
            self.pages[buddy] = PoolPage {
                refcount: 0,
                order: i,
                free: true,
            };
            self.free_area[i as usize].push(buddy);
        }

        self.pages[idx].order = order;
        self.pages[idx].refcount = 1;
        self.free_pages -= 1 << order;

        Some(self.phys(idx))
    }

    /// Single zeroed page.
    pub fn alloc_page(&mut self) -> Option<u64> {
        self.alloc_pages(0)
    }

    /// Turn a high-order allocation into individually refcounted pages.
    pub fn split_page(&mut self, phys: u64) {
        let idx = self.idx(phys);
        let order = self.pages[idx].order;

        for tail in 1..(1usize << order) {
            self.pages[idx + tail] = PoolPage {
                refcount: 1,
                order: 0,
                free: false,
            };
        }
        self.pages[idx].order = 0;
    }

    /// Exact-size allocation of `nr_pages` (a power of two), already split.
    pub fn alloc_pages_exact(&mut self, nr_pages: usize) -> Result<u64> {
        if !nr_pages.is_power_of_two() {
            return Err(Error::Inval);
        }
        let order = nr_pages.trailing_zeros() as u8;
        let phys = self.alloc_pages(order).ok_or(Error::NoMem)?;
        self.split_page(phys);
        Ok(phys)
    }

    pub fn get_page(&mut self, phys: u64) {
        let idx = self.idx(phys);
        self.pages[idx].refcount += 1;
    }

    pub fn put_page(&mut self, phys: u64) {
        let idx = self.idx(phys);
        self.put_idx(idx);
    }

    pub fn page_count(&self, phys: u64) -> u16 {
        self.pages[self.idx(phys)].refcount
    }

    pub fn table(&self, phys: u64) -> &TablePage {
        &self.frames[self.idx(phys)]
    }

    pub fn table_mut(&mut self, phys: u64) -> &mut TablePage {
        let idx = self.idx(phys);
        &mut self.frames[idx]
    }

    fn phys(&self, idx: usize) -> u64 {
        self.start + ((idx as u64) << PAGE_SHIFT)
    }

    fn idx(&self, phys: u64) -> usize {
        if !self.contains(phys) {
            panic!("hyp_pool: {:#x} outside pool at {:#x}", phys, self.start);
        }
        ((phys - self.start) >> PAGE_SHIFT) as usize
    }

    fn put_idx(&mut self, idx: usize) {
        if self.pages[idx].refcount == 0 || self.pages[idx].free {
            panic!("hyp_pool: put on free page {:#x}", self.phys(idx));
        }
        self.pages[idx].refcount -= 1;
        if self.pages[idx].refcount == 0 {
            self.attach(idx);
        }
    }

    fn attach(&mut self, mut idx: usize) {
        let mut order = self.pages[idx].order;
        let nr = 1usize << order;

        for frame in &mut self.frames[idx..idx + nr] {
            frame.fill(0);
        }
        self.free_pages += nr;
        self.pages[idx].order = NO_ORDER;

        while order + 1 < self.max_order {
            let buddy = idx ^ (1usize << order);
            if buddy >= self.nr_pages
                || !self.pages[buddy].free
                || self.pages[buddy].order != order
            {
                break;
            }

            let list = &mut self.free_area[order as usize];
            if let Some(pos) = list.iter().position(|&b| b == buddy) {
                list.swap_remove(pos);
            }
            self.pages[buddy].free = false;
            self.pages[buddy].order = NO_ORDER;

            idx = core::cmp::min(idx, buddy);
            order += 1;
        }

        self.pages[idx] = PoolPage {
            refcount: 0,
            order,
            free: true,
        };
        self.free_area[order as usize].push(idx);
    }
}
