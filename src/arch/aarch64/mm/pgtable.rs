//! ARM64 translation tables backed by a [`HypPool`]
//!
//! A 4KB-granule table of up to four levels. The root may be a set of
//! concatenated pages (at most 16), allocated in one exact-size request.
//!
//! Page Table Levels (for 4KB granule, 48-bit IA):
//! - Level 0: 512GB regions (entry covers bits [47:39])
//! - Level 1: 1GB blocks (entry covers bits [38:30])
//! - Level 2: 2MB blocks (entry covers bits [29:21])
//! - Level 3: 4KB pages (entry covers bits [20:12])
//!
//! Table pages are refcounted through the pool: one reference for the
//! link from the parent, plus one per entry the owner's [`PteOps`] says is
//! counted. Unmap and reclaim free any table whose count falls back to one.

use crate::arch::aarch64::defs::*;
use crate::arch::aarch64::mm::pte::{is_table, pte_to_phys, pte_valid, Prot, Pte};
use crate::error::{Error, Result};
use crate::mm::allocator::HypPool;
use crate::platform::align_down;

/// Per-owner policy hooks consulted while editing a table.
pub trait PteOps {
    /// Map `[addr, end)` with page descriptors only.
    fn force_pte(&self, addr: u64, end: u64, prot: Prot) -> bool;
    /// Whether a non-zero leaf or annotation holds a reference on its table.
    fn pte_is_counted(&self, raw: u64, level: u32) -> bool;
}

/// What gets written into the leaf slots of a map walk.
#[derive(Clone, Copy)]
enum NewLeaf {
    Map { start: u64, phys: u64, prot: Prot },
    Annotate(u64),
}

impl NewLeaf {
    fn raw(&self, addr: u64, level: u32) -> u64 {
        match *self {
            NewLeaf::Map { start, phys, prot } => Pte::Leaf {
                phys: phys + (addr - start),
                prot,
            }
            .encode(level),
            NewLeaf::Annotate(raw) => raw,
        }
    }

    fn block_ok(&self, addr: u64, level: u32) -> bool {
        match *self {
            NewLeaf::Map { start, phys, .. } => {
                (phys + (addr - start)) & (granule_size(level) - 1) == 0
            }
            NewLeaf::Annotate(_) => false,
        }
    }
}

pub struct PageTable {
    ia_bits: u32,
    start_level: u32,
    pgd: u64,
    pgd_pages: usize,
}

/// Start level and number of concatenated root pages for `ia_bits`.
pub fn geometry(ia_bits: u32) -> Result<(u32, usize)> {
    if !(32..=48).contains(&ia_bits) {
        return Err(Error::Inval);
    }

    for level in (0..=2).rev() {
        let shift = level_shift(level);
        let entries = 1usize << ia_bits.saturating_sub(shift);
        let pages = entries.div_ceil(PTRS_PER_TABLE);
        if pages <= MAX_CONCAT_ROOT_PAGES {
            return Ok((level, pages));
        }
    }

    Err(Error::Inval)
}

impl PageTable {
    pub fn new(pool: &mut HypPool, ia_bits: u32) -> Result<Self> {
        let (start_level, pgd_pages) = geometry(ia_bits)?;
        let pgd = pool.alloc_pages_exact(pgd_pages)?;

        Ok(Self {
            ia_bits,
            start_level,
            pgd,
            pgd_pages,
        })
    }

    pub fn pgd(&self) -> u64 {
        self.pgd
    }

    pub fn pgd_pages(&self) -> usize {
        self.pgd_pages
    }

    pub fn ia_bits(&self) -> u32 {
        self.ia_bits
    }

    pub fn ia_limit(&self) -> u64 {
        1u64 << self.ia_bits
    }

    /// Worst-case number of new table pages needed to map `size` bytes at
    /// page granularity.
    pub fn max_tables_for(&self, size: u64) -> usize {
        ((self.start_level + 1)..=LAST_LEVEL)
            .map(|level| (size.div_ceil(granule_size(level - 1)) + 1) as usize)
            .sum()
    }

    fn check_range(&self, addr: u64, size: u64) -> Result<u64> {
        let end = addr.checked_add(size).ok_or(Error::Inval)?;
        if size == 0 || addr & !PAGE_MASK != 0 || size & !PAGE_MASK != 0 || end > self.ia_limit() {
            return Err(Error::Inval);
        }
        Ok(end)
    }

    /// Root page covering `addr`, and the end of the range it covers.
    fn root_for(&self, addr: u64) -> (u64, u64) {
        let span = granule_size(self.start_level) * PTRS_PER_TABLE as u64;
        let page = addr / span;
        (self.pgd + page * PAGE_SIZE, (page + 1) * span)
    }

    fn for_each_root(
        &self,
        start: u64,
        end: u64,
        mut f: impl FnMut(u64, u64, u64) -> Result<()>,
    ) -> Result<()> {
        let mut addr = start;
        while addr < end {
            let (root, root_end) = self.root_for(addr);
            let chunk_end = core::cmp::min(end, root_end);
            f(root, addr, chunk_end)?;
            addr = chunk_end;
        }
        Ok(())
    }

    /// Map `[addr, addr + size)` to `phys`, using blocks where allowed.
    pub fn map(
        &mut self,
        pool: &mut HypPool,
        ops: &impl PteOps,
        addr: u64,
        size: u64,
        phys: u64,
        prot: Prot,
    ) -> Result<()> {
        let end = self.check_range(addr, size)?;
        if phys & !PAGE_MASK != 0 || (prot.contains(Prot::DEVICE) && prot.contains(Prot::X)) {
            return Err(Error::Inval);
        }

        let force = ops.force_pte(addr, end, prot);
        let leaf = NewLeaf::Map {
            start: addr,
            phys,
            prot,
        };
        let level = self.start_level;
        self.for_each_root(addr, end, |root, s, e| {
            self.install(pool, ops, root, level, s, e, leaf, force)
        })
    }

    /// Write the invalid descriptor `annotation` over the range, page by page.
    pub fn annotate(
        &mut self,
        pool: &mut HypPool,
        ops: &impl PteOps,
        addr: u64,
        size: u64,
        annotation: u64,
    ) -> Result<()> {
        let end = self.check_range(addr, size)?;
        if annotation == 0 || pte_valid(annotation) {
            return Err(Error::Inval);
        }

        let leaf = NewLeaf::Annotate(annotation);
        let level = self.start_level;
        self.for_each_root(addr, end, |root, s, e| {
            self.install(pool, ops, root, level, s, e, leaf, true)
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn install(
        &self,
        pool: &mut HypPool,
        ops: &impl PteOps,
        table: u64,
        level: u32,
        start: u64,
        end: u64,
        leaf: NewLeaf,
        force: bool,
    ) -> Result<()> {
        let gran = granule_size(level);
        let mut addr = start;

        while addr < end {
            let idx = ((addr >> level_shift(level)) & PT_INDEX_MASK) as usize;
            let entry_start = align_down(addr, gran);
            let entry_end = entry_start + gran;
            let chunk_end = core::cmp::min(end, entry_end);
            let covers = addr == entry_start && chunk_end == entry_end;

            let as_leaf = covers
                && (level == LAST_LEVEL
                    || (!force && level_supports_block(level) && leaf.block_ok(addr, level)));

            if as_leaf {
                self.replace_entry(pool, ops, table, idx, level, leaf.raw(addr, level));
            } else {
                let old = pool.table(table)[idx];
                let child = if is_table(old, level) {
                    pte_to_phys(old)
                } else {
                    let child = pool.alloc_page().ok_or(Error::NoMem)?;
                    self.replace_entry(pool, ops, table, idx, level, Pte::Table(child).encode(level));
                    child
                };
                self.install(pool, ops, child, level + 1, addr, chunk_end, leaf, force)?;
            }

            addr = chunk_end;
        }

        Ok(())
    }

    /// Swap one slot, keeping the table refcount in step.
    fn replace_entry(
        &self,
        pool: &mut HypPool,
        ops: &impl PteOps,
        table: u64,
        idx: usize,
        level: u32,
        new: u64,
    ) {
        let old = pool.table(table)[idx];
        let counted = |raw: u64| is_table(raw, level) || (raw != 0 && ops.pte_is_counted(raw, level));
        let (was, is) = (counted(old), counted(new));

        if is_table(old, level) {
            self.free_subtree(pool, pte_to_phys(old), level + 1);
        }

        pool.table_mut(table)[idx] = new;
        match (was, is) {
            (false, true) => pool.get_page(table),
            (true, false) => pool.put_page(table),
            _ => {}
        }
    }

    fn free_subtree(&self, pool: &mut HypPool, table: u64, level: u32) {
        if level < LAST_LEVEL {
            for idx in 0..PTRS_PER_TABLE {
                let raw = pool.table(table)[idx];
                if is_table(raw, level) {
                    self.free_subtree(pool, pte_to_phys(raw), level + 1);
                }
            }
        }
        for _ in 0..pool.page_count(table) {
            pool.put_page(table);
        }
    }

    /// Remove every leaf and annotation overlapping the range.
    ///
    /// A block only partially inside the range goes away entirely. Returns
    /// the number of bytes of the range that had a valid translation.
    pub fn unmap(
        &mut self,
        pool: &mut HypPool,
        ops: &impl PteOps,
        addr: u64,
        size: u64,
    ) -> Result<u64> {
        let end = self.check_range(addr, size)?;
        let mut unmapped = 0;
        let level = self.start_level;

        self.for_each_root(addr, end, |root, s, e| {
            self.unmap_table(pool, ops, root, level, s, e, &mut unmapped);
            Ok(())
        })?;

        Ok(unmapped)
    }

    #[allow(clippy::too_many_arguments)]
    fn unmap_table(
        &self,
        pool: &mut HypPool,
        ops: &impl PteOps,
        table: u64,
        level: u32,
        start: u64,
        end: u64,
        unmapped: &mut u64,
    ) {
        let gran = granule_size(level);
        let mut addr = start;

        while addr < end {
            let idx = ((addr >> level_shift(level)) & PT_INDEX_MASK) as usize;
            let chunk_end = core::cmp::min(end, align_down(addr, gran) + gran);
            let raw = pool.table(table)[idx];

            if is_table(raw, level) {
                let child = pte_to_phys(raw);
                self.unmap_table(pool, ops, child, level + 1, addr, chunk_end, unmapped);
                self.drop_if_empty(pool, table, idx, child);
            } else if raw != 0 {
                if pte_valid(raw) {
                    *unmapped += chunk_end - addr;
                }
                self.replace_entry(pool, ops, table, idx, level, 0);
            }

            addr = chunk_end;
        }
    }

    fn drop_if_empty(&self, pool: &mut HypPool, table: u64, idx: usize, child: u64) {
        if pool.page_count(child) == 1 {
            pool.table_mut(table)[idx] = 0;
            pool.put_page(child);
            pool.put_page(table);
        }
    }

    /// Drop uncounted leaves in the range and free tables left empty.
    pub fn reclaim_leaves(
        &mut self,
        pool: &mut HypPool,
        ops: &impl PteOps,
        addr: u64,
        size: u64,
    ) -> Result<()> {
        let end = self.check_range(addr, size)?;
        let level = self.start_level;

        self.for_each_root(addr, end, |root, s, e| {
            self.reclaim_table(pool, ops, root, level, s, e);
            Ok(())
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn reclaim_table(
        &self,
        pool: &mut HypPool,
        ops: &impl PteOps,
        table: u64,
        level: u32,
        start: u64,
        end: u64,
    ) {
        let gran = granule_size(level);
        let mut addr = start;

        while addr < end {
            let idx = ((addr >> level_shift(level)) & PT_INDEX_MASK) as usize;
            let chunk_end = core::cmp::min(end, align_down(addr, gran) + gran);
            let raw = pool.table(table)[idx];

            if is_table(raw, level) {
                let child = pte_to_phys(raw);
                self.reclaim_table(pool, ops, child, level + 1, addr, chunk_end);
                self.drop_if_empty(pool, table, idx, child);
            } else if pte_valid(raw) && !ops.pte_is_counted(raw, level) {
                pool.table_mut(table)[idx] = 0;
            }

            addr = chunk_end;
        }
    }

    /// Deepest entry reached when translating `addr`, with its level.
    pub fn get_leaf(&self, pool: &HypPool, addr: u64) -> Result<(u64, u32)> {
        if addr >= self.ia_limit() {
            return Err(Error::Inval);
        }

        let (mut table, _) = self.root_for(addr);
        let mut level = self.start_level;
        loop {
            let idx = ((addr >> level_shift(level)) & PT_INDEX_MASK) as usize;
            let raw = pool.table(table)[idx];
            if level == LAST_LEVEL || !is_table(raw, level) {
                return Ok((raw, level));
            }
            table = pte_to_phys(raw);
            level += 1;
        }
    }

    /// Visit every leaf-level slot overlapping the range, valid or not.
    ///
    /// The visitor gets the first address of the range inside the slot,
    /// the raw descriptor and its level. The first error stops the walk.
    pub fn walk_leaves(
        &self,
        pool: &HypPool,
        addr: u64,
        size: u64,
        visitor: &mut dyn FnMut(u64, u64, u32) -> Result<()>,
    ) -> Result<()> {
        let end = self.check_range(addr, size)?;
        let level = self.start_level;

        self.for_each_root(addr, end, |root, s, e| {
            self.walk_table(pool, root, level, s, e, visitor)
        })
    }

    fn walk_table(
        &self,
        pool: &HypPool,
        table: u64,
        level: u32,
        start: u64,
        end: u64,
        visitor: &mut dyn FnMut(u64, u64, u32) -> Result<()>,
    ) -> Result<()> {
        let gran = granule_size(level);
        let mut addr = start;

        while addr < end {
            let idx = ((addr >> level_shift(level)) & PT_INDEX_MASK) as usize;
            let chunk_end = core::cmp::min(end, align_down(addr, gran) + gran);
            let raw = pool.table(table)[idx];

            if is_table(raw, level) {
                self.walk_table(pool, pte_to_phys(raw), level + 1, addr, chunk_end, visitor)?;
            } else {
                visitor(addr, raw, level)?;
            }

            addr = chunk_end;
        }

        Ok(())
    }

    /// Rewrite valid leaves in place. `f` returns the new descriptor, or
    /// `None` to leave the slot alone.
    fn update_leaves(
        &mut self,
        pool: &mut HypPool,
        addr: u64,
        size: u64,
        f: &mut dyn FnMut(u64, u32) -> Option<u64>,
    ) -> Result<()> {
        let end = self.check_range(addr, size)?;
        let mut cur = addr;

        while cur < end {
            let (raw, level) = self.get_leaf(pool, cur)?;
            let gran = granule_size(level);
            if pte_valid(raw) {
                if let Some(new) = f(raw, level) {
                    let table = self.slot_table(pool, cur, level);
                    let idx = ((cur >> level_shift(level)) & PT_INDEX_MASK) as usize;
                    pool.table_mut(table)[idx] = new;
                }
            }
            cur = align_down(cur, gran) + gran;
        }

        Ok(())
    }

    /// Table page holding the slot for `addr` at `level`.
    fn slot_table(&self, pool: &HypPool, addr: u64, level: u32) -> u64 {
        let (mut table, _) = self.root_for(addr);
        let mut cur = self.start_level;
        while cur < level {
            let idx = ((addr >> level_shift(cur)) & PT_INDEX_MASK) as usize;
            table = pte_to_phys(pool.table(table)[idx]);
            cur += 1;
        }
        table
    }

    /// Add permissions to the valid leaf mapping `addr`.
    pub fn relax_perms(&mut self, pool: &mut HypPool, addr: u64, prot: Prot) -> Result<()> {
        let (raw, _) = self.get_leaf(pool, align_down(addr, PAGE_SIZE))?;
        if !pte_valid(raw) {
            return Err(Error::Again);
        }

        let mut relax = |raw: u64, level: u32| match Pte::decode(raw, level) {
            Pte::Leaf { phys, prot: old } => {
                let mut new = old | (prot & Prot::RWX);
                if prot.contains(Prot::X) {
                    new.remove(Prot::PXN | Prot::UXN);
                }
                Some(Pte::Leaf { phys, prot: new }.encode(level))
            }
            _ => None,
        };
        self.update_leaves(pool, align_down(addr, PAGE_SIZE), PAGE_SIZE, &mut relax)
    }

    /// Remove write permission from every valid leaf in the range.
    pub fn wrprotect(&mut self, pool: &mut HypPool, addr: u64, size: u64) -> Result<()> {
        let mut ro = |raw: u64, level: u32| match Pte::decode(raw, level) {
            Pte::Leaf { phys, prot } if prot.contains(Prot::W) => Some(
                Pte::Leaf {
                    phys,
                    prot: prot.difference(Prot::W),
                }
                .encode(level),
            ),
            _ => None,
        };
        self.update_leaves(pool, addr, size, &mut ro)
    }

    /// Free every table page, root included.
    pub fn destroy(self, pool: &mut HypPool) {
        for page in 0..self.pgd_pages {
            let root = self.pgd + page as u64 * PAGE_SIZE;
            self.free_subtree(pool, root, self.start_level);
        }
    }
}
