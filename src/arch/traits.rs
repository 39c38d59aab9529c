//! Architecture-Portable Trait Definitions
//!
//! The ownership engine never touches memory contents, caches or firmware
//! directly. Everything that needs an instruction or an SMC goes through
//! [`HypMemoryOps`], so the engine itself runs unchanged in host tests.

use crate::error::Result;

/// Side effects the engine asks of the platform.
pub trait HypMemoryOps: Send + Sync {
    /// Zero one page through the hypervisor's own mapping.
    fn zero_page(&self, phys: u64);

    /// Clean and invalidate `[phys, phys + size)` to the point of coherency.
    fn flush_dcache_to_poc(&self, phys: u64, size: u64);

    /// One more page is owned by a protected guest. Firmware is asked to
    /// wipe memory on reset while the count is non-zero.
    fn psci_mem_protect_inc(&self, nr_pages: u64);

    /// Inverse of [`HypMemoryOps::psci_mem_protect_inc`].
    fn psci_mem_protect_dec(&self, nr_pages: u64);

    /// Copy the guest firmware image slice at `offset` into `phys`,
    /// zero-filling past the end of the image.
    fn load_pvmfw_pages(&self, offset: u64, phys: u64, size: u64) -> Result<()>;

    /// Stage-1 translation of a host EL1 virtual address (AT S1E1R).
    /// `None` when the walk faults, for instance because the host changed
    /// its tables since the abort was taken.
    fn translate_host_va(&self, va: u64) -> Option<u64>;
}
