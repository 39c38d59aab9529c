//! Host stage-2 faults
//!
//! The host identity map is filled in on demand. A translation fault maps
//! the largest block around the address that cannot clobber a neighbour.
//! A permission fault is offered to the registered handlers, and anything
//! nobody claims is reflected back to the host as a synchronous abort.

use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, error, warn};

use crate::arch::aarch64::defs::*;
use crate::arch::aarch64::exception::inject_host_abort;
use crate::arch::aarch64::regs::HostCpuContext;
use crate::arch::traits::HypMemoryOps;
use crate::error::{Error, Result};
use crate::mem_protect::host::default_host_prot;
use crate::mem_protect::MemProtect;
use crate::platform::MAX_HOST_FAULT_HANDLERS;
use crate::sync::SpinLock;

/// Called with the trapped context, ESR_EL2 and the faulting IPA.
pub type PermFaultHandler = dyn Fn(&mut HostCpuContext, u64, u64) -> Result<()> + Send + Sync;

/// Told about every abort about to be injected into the host.
pub type IllegalAbtNotifier = dyn Fn(&HostCpuContext) + Send + Sync;

pub(crate) struct HostFaultHooks {
    perm: SpinLock<Vec<Arc<PermFaultHandler>>>,
    illegal_abt: SpinLock<Option<Arc<IllegalAbtNotifier>>>,
}

impl HostFaultHooks {
    pub(crate) const fn new() -> Self {
        Self {
            perm: SpinLock::new(Vec::new()),
            illegal_abt: SpinLock::new(None),
        }
    }
}

/// HPFAR for the abort in `ctx`.
///
/// HPFAR_EL2 is only reported for translation and access faults, or when
/// the fault hit the stage-1 walk. A permission fault on the access itself
/// has to be translated by hand, which fails if the host changed its
/// tables in the meantime.
fn get_fault_info(ctx: &HostCpuContext, ops: &dyn HypMemoryOps) -> Option<u64> {
    let esr = ctx.esr_el2;

    if esr & ESR_S1PTW == 0 && esr & ESR_FSC_TYPE == ESR_FSC_PERM {
        let ipa = ops.translate_host_va(ctx.far_el2)?;
        return Some((ipa >> 8) & HPFAR_MASK);
    }
    Some(ctx.hpfar_el2)
}

impl MemProtect {
    /// Map the default host mapping around `addr`.
    ///
    /// # Errors
    /// * `Again` - the address is mapped already
    /// * `Perm` - the page belongs to someone else
    /// * `NoMem` - the host pool is exhausted even after recycling
    pub fn host_stage2_idmap(&self, addr: u64) -> Result<()> {
        let layout = &self.layout;
        let (region, range) = layout.regions.find_mem_range(addr);
        let prot = default_host_prot(region.is_some());

        let mut cx = self.lock_host();
        let host = cx.host();
        let range = host.adjust_range(layout, addr, range)?;
        debug!(
            "host idmap [{:#x}, {:#x}) for fault at {:#x}",
            range.start, range.end, addr
        );
        host.idmap_locked(layout, range.start, range.size(), prot)
    }

    fn handle_host_perm_fault(&self, ctx: &mut HostCpuContext, esr: u64, addr: u64) -> Result<()> {
        // Handlers may call back into the engine; do not hold the list.
        let handlers = self.fault_hooks.perm.lock().clone();

        let mut ret = Err(Error::Perm);
        for handler in handlers.iter() {
            ret = handler(ctx, esr, addr);
            if ret.is_ok() {
                break;
            }
        }
        ret
    }

    fn host_inject_abort(&self, ctx: &mut HostCpuContext) {
        let notifier = self.fault_hooks.illegal_abt.lock().clone();
        if let Some(notifier) = notifier {
            notifier(ctx);
        }
        inject_host_abort(ctx);
    }

    /// Entry point for a host stage-2 instruction or data abort.
    pub fn handle_host_mem_abort(&self, ctx: &mut HostCpuContext) {
        let esr = ctx.esr_el2;
        let Some(hpfar) = get_fault_info(ctx, &*self.ops) else {
            // Raced with a host page-table change; let it fault again.
            debug!("host abort at {:#x}: no stage-1 translation", ctx.far_el2);
            return;
        };

        let addr = (hpfar & HPFAR_MASK) << 8;
        let mut ret = self.host_stage2_idmap(addr);

        if esr & ESR_FSC_TYPE == ESR_FSC_PERM {
            ret = self.handle_host_perm_fault(ctx, esr, addr);
        }

        match ret {
            Ok(()) | Err(Error::Again) => {}
            Err(Error::Perm) => {
                warn!(
                    "injecting abort into host: esr={:#x} ipa={:#x} elr={:#x}",
                    esr, addr, ctx.elr_el2
                );
                self.host_inject_abort(ctx);
            }
            Err(err) => {
                error!("host abort at {:#x} (esr {:#x}) unhandled: {}", addr, esr, err);
                panic!("host stage-2 abort at {:#x}: {}", addr, err);
            }
        }
    }

    /// Add a handler for host permission faults.
    ///
    /// # Errors
    /// * `Busy` - all handler slots are taken
    pub fn register_host_perm_fault_handler<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&mut HostCpuContext, u64, u64) -> Result<()> + Send + Sync + 'static,
    {
        let mut handlers = self.fault_hooks.perm.lock();
        if handlers.len() >= MAX_HOST_FAULT_HANDLERS {
            warn!("host perm fault handler table full");
            return Err(Error::Busy);
        }
        handlers.push(Arc::new(handler));
        Ok(())
    }

    /// Install the illegal-abort notifier. Only one may ever be set.
    pub fn register_illegal_abt_notifier<F>(&self, notifier: F) -> Result<()>
    where
        F: Fn(&HostCpuContext) + Send + Sync + 'static,
    {
        let mut slot = self.fault_hooks.illegal_abt.lock();
        if slot.is_some() {
            warn!("illegal abort notifier already registered");
            return Err(Error::Busy);
        }
        *slot = Some(Arc::new(notifier));
        Ok(())
    }
}
