//! Bare-metal [`HypMemoryOps`] for EL2
//!
//! Pages are reached through the hyp linear map. The protected-memory count
//! is forwarded to firmware with PSCI MEM_PROTECT whenever it moves between
//! zero and non-zero.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::aarch64::defs::{PAGE_MASK, PAGE_SIZE};
use crate::arch::traits::HypMemoryOps;
use crate::error::{Error, Result};
use crate::platform::hyp_va;

const PSCI_1_1_FN64_MEM_PROTECT: u64 = 0x8400_0013;
const CACHE_LINE: u64 = 64;
const PAR_F: u64 = 1 << 0;
const PAR_PA_MASK: u64 = 0x0000_FFFF_FFFF_F000;

pub struct El2MemoryOps {
    pvmfw_image: &'static [u8],
    protected_pages: AtomicU64,
}

impl El2MemoryOps {
    pub const fn new(pvmfw_image: &'static [u8]) -> Self {
        Self {
            pvmfw_image,
            protected_pages: AtomicU64::new(0),
        }
    }

    fn mem_protect(enable: bool) {
        let mut x0 = PSCI_1_1_FN64_MEM_PROTECT;
        unsafe {
            core::arch::asm!(
                "smc #0",
                inout("x0") x0,
                in("x1") enable as u64,
                lateout("x2") _,
                lateout("x3") _,
                options(nomem, nostack),
            );
        }
        if x0 as i64 != 0 && enable {
            log::warn!("PSCI MEM_PROTECT enable failed: {}", x0 as i64);
        }
    }
}

impl HypMemoryOps for El2MemoryOps {
    fn zero_page(&self, phys: u64) {
        unsafe { core::ptr::write_bytes(hyp_va(phys) as *mut u8, 0, PAGE_SIZE as usize) };
    }

    fn flush_dcache_to_poc(&self, phys: u64, size: u64) {
        let start = hyp_va(phys) & !(CACHE_LINE - 1);
        let end = hyp_va(phys) + size;
        let mut va = start;
        while va < end {
            unsafe { core::arch::asm!("dc civac, {va}", va = in(reg) va, options(nostack)) };
            va += CACHE_LINE;
        }
        unsafe { core::arch::asm!("dsb sy", options(nostack)) };
    }

    fn psci_mem_protect_inc(&self, nr_pages: u64) {
        if self.protected_pages.fetch_add(nr_pages, Ordering::AcqRel) == 0 {
            Self::mem_protect(true);
        }
    }

    fn psci_mem_protect_dec(&self, nr_pages: u64) {
        if self.protected_pages.fetch_sub(nr_pages, Ordering::AcqRel) == nr_pages {
            Self::mem_protect(false);
        }
    }

    fn load_pvmfw_pages(&self, offset: u64, phys: u64, size: u64) -> Result<()> {
        let image_len = self.pvmfw_image.len() as u64;
        if offset > image_len {
            return Err(Error::Inval);
        }

        let copy = core::cmp::min(size, image_len - offset) as usize;
        let dst = hyp_va(phys) as *mut u8;
        unsafe {
            core::ptr::copy_nonoverlapping(self.pvmfw_image[offset as usize..].as_ptr(), dst, copy);
            core::ptr::write_bytes(dst.add(copy), 0, size as usize - copy);
        }
        self.flush_dcache_to_poc(phys, size);
        Ok(())
    }

    fn translate_host_va(&self, va: u64) -> Option<u64> {
        let par: u64;
        unsafe {
            core::arch::asm!(
                "at s1e1r, {va}",
                "isb",
                "mrs {par}, par_el1",
                va = in(reg) va,
                par = out(reg) par,
                options(nostack),
            );
        }
        if par & PAR_F != 0 {
            return None;
        }
        Some((par & PAR_PA_MASK) | (va & !PAGE_MASK))
    }
}
