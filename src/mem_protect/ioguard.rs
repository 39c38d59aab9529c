//! MMIO guard
//!
//! A guest running with the MMIO guard must declare, page by page, which
//! IPAs it expects to be emulated device memory. Declared pages carry the
//! MMIO note in the guest stage-2 and have no translation. Data aborts on
//! anything else are not forwarded to the host for emulation.

use crate::arch::aarch64::defs::*;
use crate::arch::aarch64::mm::Pte;
use crate::error::{Error, Result};
use crate::mem_protect::component::Components;
use crate::mem_protect::MemProtect;
use crate::platform::align_down;
use crate::vm::{HypVcpu, HypVm};

/// `ipa` is covered by a page-sized MMIO note.
fn check_ioguard_page(cx: &mut Components<'_>, vm: &HypVm, ipa: u64) -> bool {
    match cx.guest(vm).get_leaf(ipa) {
        Ok((raw, level)) => {
            granule_size(level) == PAGE_SIZE && Pte::decode(raw, level) == Pte::MmioGuard
        }
        Err(_) => false,
    }
}

impl MemProtect {
    /// # Errors
    /// * `Inval` - MMIO guard disabled, or `ipa` not page aligned
    /// * `Busy` - something else is mapped there
    pub fn install_ioguard_page(&self, vcpu: &HypVcpu, ipa: u64) -> Result<()> {
        let vm = &**vcpu.vm();
        if !vm.mmio_guard_enabled() || ipa & !PAGE_MASK != 0 {
            return Err(Error::Inval);
        }

        let mut cx = self.lock_guest(vm);
        let mmu = cx.guest(vm);
        let (raw, level) = mmu.get_leaf(ipa)?;

        if raw != 0 && granule_size(level) == PAGE_SIZE {
            return match Pte::decode(raw, level) {
                Pte::MmioGuard => Ok(()),
                _ => Err(Error::Busy),
            };
        }

        mmu.annotate(ipa, PAGE_SIZE, Pte::MmioGuard.encode(LAST_LEVEL))
    }

    /// Drop the guard on `ipa`, if there is one.
    pub fn remove_ioguard_page(&self, vcpu: &HypVcpu, ipa: u64) -> Result<()> {
        let vm = &**vcpu.vm();
        if !vm.mmio_guard_enabled() {
            return Err(Error::Inval);
        }

        let mut cx = self.lock_guest(vm);
        if check_ioguard_page(&mut cx, vm, ipa) {
            if let Err(err) = cx.guest(vm).unmap(align_down(ipa, PAGE_SIZE), PAGE_SIZE) {
                log::warn!("vm {}: ioguard at {:#x} not removed: {}", vm.handle(), ipa, err);
            }
        }
        Ok(())
    }

    /// May the data abort recorded in `vcpu` be forwarded for emulation?
    /// Both ends of the access must lie in guarded pages.
    pub fn check_ioguard_page(&self, vcpu: &HypVcpu) -> bool {
        let vm = &**vcpu.vm();
        let fault = &vcpu.fault;

        if !fault.is_valid() {
            return false;
        }
        if !vm.mmio_guard_enabled() {
            return true;
        }

        let ipa = fault.fault_ipa() | (fault.far & FAR_MASK);
        let end = ipa + fault.access_size() - 1;

        let mut cx = self.lock_guest(vm);
        let mut ret = check_ioguard_page(&mut cx, vm, ipa);
        if end & PAGE_MASK != ipa & PAGE_MASK {
            ret &= check_ioguard_page(&mut cx, vm, end);
        }
        ret
    }
}
