//! Hypervisor-side Virtual Machine state
//!
//! This module provides [`HypVm`], the hypervisor's record of one guest:
//! its protection mode, its stage-2 table and table pool (behind the
//! per-VM lock), and the optional firmware window. [`HypVcpu`] is the
//! per-vCPU handle that guest-initiated operations come in through.

use alloc::sync::Arc;

use crate::arch::aarch64::defs::*;
use crate::mem_protect::guest::GuestMmu;
use crate::platform::GUEST_IA_BITS;
use crate::sync::SpinLock;

/// Maximum number of vCPUs per VM
pub const MAX_VCPUS: usize = 8;

/// IPA window the guest firmware image (pvmfw) is loaded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PvmfwConfig {
    pub load_addr: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    /// Host-visible identifier
    pub handle: u32,
    /// Protected (isolated) VM
    pub protected: bool,
    /// Device accesses must hit a guest-declared MMIO guard page
    pub mmio_guard: bool,
    pub pvmfw: Option<PvmfwConfig>,
    /// Host pages donated to back the stage-2 table pool
    pub pool_pfn: u64,
    pub pool_pages: usize,
    pub ia_bits: u32,
}

impl VmConfig {
    pub fn new(handle: u32, pool_pfn: u64, pool_pages: usize) -> Self {
        Self {
            handle,
            protected: false,
            mmio_guard: false,
            pvmfw: None,
            pool_pfn,
            pool_pages,
            ia_bits: GUEST_IA_BITS,
        }
    }
}

/// Hypervisor record of a guest.
pub struct HypVm {
    config: VmConfig,
    pub(crate) mmu: SpinLock<GuestMmu>,
}

impl HypVm {
    pub(crate) fn new(config: VmConfig, mmu: GuestMmu) -> Self {
        Self {
            config,
            mmu: SpinLock::new(mmu),
        }
    }

    pub fn handle(&self) -> u32 {
        self.config.handle
    }

    pub fn is_protected(&self) -> bool {
        self.config.protected
    }

    pub fn mmio_guard_enabled(&self) -> bool {
        self.config.mmio_guard
    }

    pub fn pool_range(&self) -> (u64, usize) {
        (self.config.pool_pfn, self.config.pool_pages)
    }

    /// `[start, end)` overlaps the firmware window.
    pub fn ipa_range_has_pvmfw(&self, start: u64, end: u64) -> bool {
        match self.config.pvmfw {
            Some(fw) => start < fw.load_addr + fw.size && fw.load_addr < end,
            None => false,
        }
    }

    /// Offset of `ipa` into the firmware image.
    pub fn pvmfw_offset(&self, ipa: u64) -> u64 {
        match self.config.pvmfw {
            Some(fw) => ipa.saturating_sub(fw.load_addr),
            None => 0,
        }
    }
}

/// Syndrome of the last data abort a vCPU took to EL2.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataAbortInfo {
    pub esr: u64,
    pub far: u64,
    pub hpfar: u64,
}

impl DataAbortInfo {
    /// The syndrome describes the access (ISV).
    pub fn is_valid(&self) -> bool {
        self.esr & ESR_ISV != 0
    }

    pub fn fault_ipa(&self) -> u64 {
        (self.hpfar & HPFAR_MASK) << 8
    }

    /// Access size in bytes.
    pub fn access_size(&self) -> u64 {
        1 << ((self.esr >> ESR_SAS_SHIFT) & ESR_SAS_MASK)
    }
}

pub struct HypVcpu {
    vm: Arc<HypVm>,
    idx: usize,
    pub fault: DataAbortInfo,
}

impl HypVcpu {
    pub fn new(vm: Arc<HypVm>, idx: usize) -> Self {
        Self {
            vm,
            idx,
            fault: DataAbortInfo::default(),
        }
    }

    pub fn vm(&self) -> &Arc<HypVm> {
        &self.vm
    }

    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn is_protected(&self) -> bool {
        self.vm.is_protected()
    }
}
