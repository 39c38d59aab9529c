//! Component identities and the lock discipline
//!
//! Each component has one lock: host, hyp, and one per guest. Sections that
//! need more than one take them through [`MemProtect::lock_components`],
//! which always acquires in host, hyp, guest order.

use crate::mem_protect::guest::GuestMmu;
use crate::mem_protect::host::HostMmu;
use crate::mem_protect::hyp::HypMmu;
use crate::mem_protect::MemProtect;
use crate::mm::memblock::MemLayout;
use crate::arch::traits::HypMemoryOps;
use crate::sync::{LockClass, SpinLockGuard};
use crate::vm::HypVm;

// ── Owner ids stored in host stage-2 annotations ─────────────────────
pub const PKVM_ID_HOST: u32 = 0;
pub const PKVM_ID_HYP: u32 = 1;
pub const PKVM_ID_FFA: u32 = 2;
pub const PKVM_ID_GUEST: u32 = 3;
/// Pages taken away from the host by a hypervisor module.
pub const PKVM_ID_PROTECTED: u32 = 4;

/// Largest id the invalid-descriptor owner field can hold.
pub const KVM_MAX_OWNER_ID: u32 = 0xFF;

/// Participant in an ownership transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentId {
    Host,
    Hyp,
    Guest(u32),
    /// Secure-world firmware reached over FF-A. Has no local table.
    SecureAgent,
}

impl ComponentId {
    pub const fn owner_id(self) -> u32 {
        match self {
            ComponentId::Host => PKVM_ID_HOST,
            ComponentId::Hyp => PKVM_ID_HYP,
            ComponentId::Guest(_) => PKVM_ID_GUEST,
            ComponentId::SecureAgent => PKVM_ID_FFA,
        }
    }
}

/// A guest's lock, bound to the VM it protects. The VM reference is the
/// "current VM" of the section and is dropped with the lock.
pub struct GuestGuard<'a> {
    vm: &'a HypVm,
    mmu: SpinLockGuard<'a, GuestMmu>,
}

/// The set of component locks held by one critical section.
pub struct Components<'a> {
    mp: &'a MemProtect,
    host: Option<SpinLockGuard<'a, HostMmu>>,
    hyp: Option<SpinLockGuard<'a, HypMmu>>,
    guest: Option<GuestGuard<'a>>,
}

#[cold]
fn lock_not_held(what: &str) -> ! {
    log::error!("{} lock not held", what);
    panic!("{} lock not held", what)
}

impl MemProtect {
    /// Take the requested locks in the global order.
    pub(crate) fn lock_components<'a>(
        &'a self,
        host: bool,
        hyp: bool,
        guest: Option<&'a HypVm>,
    ) -> Components<'a> {
        let mut cx = Components {
            mp: self,
            host: None,
            hyp: None,
            guest: None,
        };

        if host {
            cx.host = Some(self.host.lock());
            self.note_lock(LockClass::Host, true);
        }
        if hyp {
            cx.hyp = Some(self.hyp.lock());
            self.note_lock(LockClass::Hyp, true);
        }
        if let Some(vm) = guest {
            cx.guest = Some(GuestGuard {
                vm,
                mmu: vm.mmu.lock(),
            });
            self.note_lock(LockClass::Guest, true);
        }

        cx
    }

    pub(crate) fn lock_host(&self) -> Components<'_> {
        self.lock_components(true, false, None)
    }

    pub(crate) fn lock_host_hyp(&self) -> Components<'_> {
        self.lock_components(true, true, None)
    }

    pub(crate) fn lock_host_guest<'a>(&'a self, vm: &'a HypVm) -> Components<'a> {
        self.lock_components(true, false, Some(vm))
    }

    pub(crate) fn lock_guest<'a>(&'a self, vm: &'a HypVm) -> Components<'a> {
        self.lock_components(false, false, Some(vm))
    }

    fn note_lock(&self, class: LockClass, acquired: bool) {
        if let Some(observer) = &self.observer {
            if acquired {
                observer.acquired(class);
            } else {
                observer.released(class);
            }
        }
    }
}

impl<'a> Components<'a> {
    pub fn layout(&self) -> &'a MemLayout {
        &self.mp.layout
    }

    pub fn ops(&self) -> &'a dyn HypMemoryOps {
        &*self.mp.ops
    }

    pub fn host(&mut self) -> &mut HostMmu {
        match self.host.as_deref_mut() {
            Some(mmu) => mmu,
            None => lock_not_held("host"),
        }
    }

    pub fn hyp(&mut self) -> &mut HypMmu {
        match self.hyp.as_deref_mut() {
            Some(mmu) => mmu,
            None => lock_not_held("hyp"),
        }
    }

    /// The stage-2 of `vm`, which must be the VM this section locked.
    pub fn guest(&mut self, vm: &HypVm) -> &mut GuestMmu {
        match self.guest.as_mut() {
            Some(guard) if core::ptr::eq(guard.vm, vm) => &mut guard.mmu,
            Some(_) => lock_not_held("requested guest"),
            None => lock_not_held("guest"),
        }
    }
}

impl Drop for Components<'_> {
    fn drop(&mut self) {
        if self.guest.take().is_some() {
            self.mp.note_lock(LockClass::Guest, false);
        }
        if self.hyp.take().is_some() {
            self.mp.note_lock(LockClass::Hyp, false);
        }
        if self.host.take().is_some() {
            self.mp.note_lock(LockClass::Host, false);
        }
    }
}
