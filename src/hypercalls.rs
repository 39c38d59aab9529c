//! Hypercall surface
//!
//! Host calls come in as HVCs from the host kernel: x0 carries the
//! function id, arguments follow in x1.., and the signed errno result is
//! handed back in x1 with x0 set to the SMCCC status.
//!
//! Guest calls use the vendor-hyp SMCCC range. Their results are plain
//! SMCCC codes in x0, and unused argument registers must be zero.

use log::{debug, warn};

use crate::arch::aarch64::defs::*;
use crate::arch::aarch64::mm::Prot;
use crate::arch::aarch64::regs::{ExitReason, GeneralPurposeRegs, HostCpuContext};
use crate::error::{status, Error, Result};
use crate::mem_protect::MemProtect;
use crate::vm::HypVcpu;

// ── Host hypercalls ──────────────────────────────────────────────────
pub const HOST_HCALL_BASE: u64 = 0xC600_0000;
pub const HOST_HCALL_SHARE_HYP: u64 = HOST_HCALL_BASE + 1;
pub const HOST_HCALL_UNSHARE_HYP: u64 = HOST_HCALL_BASE + 2;
pub const HOST_HCALL_SHARE_GUEST: u64 = HOST_HCALL_BASE + 3;
pub const HOST_HCALL_UNSHARE_GUEST: u64 = HOST_HCALL_BASE + 4;
pub const HOST_HCALL_RELAX_GUEST_PERMS: u64 = HOST_HCALL_BASE + 5;
pub const HOST_HCALL_WRPROTECT_GUEST: u64 = HOST_HCALL_BASE + 6;
pub const HOST_HCALL_DONATE_GUEST: u64 = HOST_HCALL_BASE + 7;
pub const HOST_HCALL_RECLAIM_PAGE: u64 = HOST_HCALL_BASE + 8;
pub const HOST_HCALL_TEARDOWN_VM: u64 = HOST_HCALL_BASE + 9;

// ── Guest hypercalls (ARM_SMCCC_VENDOR_HYP_KVM_*) ────────────────────
pub const GUEST_HCALL_MEM_SHARE: u64 = 0xC600_0003;
pub const GUEST_HCALL_MEM_UNSHARE: u64 = 0xC600_0004;
pub const GUEST_HCALL_MMIO_GUARD_MAP: u64 = 0xC600_0007;
pub const GUEST_HCALL_MMIO_GUARD_UNMAP: u64 = 0xC600_0008;
pub const GUEST_HCALL_MEM_RELINQUISH: u64 = 0xC600_0009;

fn decode_prot(raw: u64) -> Result<Prot> {
    Prot::from_bits(raw).ok_or(Error::Inval)
}

/// The vCPU currently loaded on this CPU, for calls that act on its VM.
/// Protected guests never receive host shares.
fn loaded_unprotected<'a>(vcpu: Option<&'a HypVcpu>) -> Result<&'a HypVcpu> {
    match vcpu {
        Some(vcpu) if !vcpu.is_protected() => Ok(vcpu),
        _ => Err(Error::Inval),
    }
}

fn dispatch_host_hcall(
    mp: &MemProtect,
    id: u64,
    ctx: &HostCpuContext,
    loaded: Option<&HypVcpu>,
) -> Option<Result<()>> {
    let arg = |n: u8| ctx.get_gpr(n);

    let ret = match id {
        HOST_HCALL_SHARE_HYP => mp.host_share_hyp(arg(1)),
        HOST_HCALL_UNSHARE_HYP => mp.host_unshare_hyp(arg(1)),
        HOST_HCALL_SHARE_GUEST => loaded_unprotected(loaded)
            .and_then(|vcpu| mp.host_share_guest(arg(1), arg(2), vcpu, decode_prot(arg(3))?)),
        HOST_HCALL_UNSHARE_GUEST => match mp.vm_by_handle(arg(1) as u32) {
            Some(vm) => mp.host_unshare_guest(arg(2), &vm),
            None => Err(Error::Inval),
        },
        HOST_HCALL_RELAX_GUEST_PERMS => loaded_unprotected(loaded)
            .and_then(|vcpu| mp.host_relax_guest_perms(arg(1), decode_prot(arg(2))?, vcpu)),
        HOST_HCALL_WRPROTECT_GUEST => match mp.vm_by_handle(arg(1) as u32) {
            Some(vm) => mp.host_wrprotect_guest(arg(2), &vm),
            None => Err(Error::Inval),
        },
        HOST_HCALL_DONATE_GUEST => match loaded {
            Some(vcpu) => mp.host_donate_guest(arg(1), arg(2), vcpu),
            None => Err(Error::Inval),
        },
        HOST_HCALL_RECLAIM_PAGE => match mp.vm_by_handle(arg(1) as u32) {
            Some(vm) => mp.host_reclaim_page(&vm, arg(2), arg(3)),
            None => Err(Error::Inval),
        },
        HOST_HCALL_TEARDOWN_VM => mp.teardown_vm(arg(1) as u32),
        _ => return None,
    };
    Some(ret)
}

/// Handle an HVC from the host. `loaded` is the guest vCPU currently
/// loaded on this CPU, if any.
pub fn handle_host_hcall(mp: &MemProtect, ctx: &mut HostCpuContext, loaded: Option<&HypVcpu>) {
    let id = ctx.get_gpr(0);

    match dispatch_host_hcall(mp, id, ctx, loaded) {
        Some(ret) => {
            if let Err(err) = ret {
                debug!("host hcall {:#x} failed: {}", id, err);
            }
            ctx.set_gpr(0, SMCCC_RET_SUCCESS as u64);
            ctx.set_gpr(1, status(ret) as u64);
        }
        None => {
            warn!("unknown host hcall {:#x}", id);
            ctx.set_gpr(0, SMCCC_RET_NOT_SUPPORTED as u64);
        }
    }
}

/// Route a host trap to EL2.
///
/// # Returns
/// * `true` - handled, return to the host
/// * `false` - not a trap this crate handles
pub fn handle_host_trap(mp: &MemProtect, ctx: &mut HostCpuContext, loaded: Option<&HypVcpu>) -> bool {
    match ctx.exit_reason() {
        ExitReason::HvcCall => {
            handle_host_hcall(mp, ctx, loaded);
            true
        }
        ExitReason::InstructionAbort | ExitReason::DataAbort => {
            mp.handle_host_mem_abort(ctx);
            true
        }
        reason => {
            debug!("host trap not handled here: {}", reason);
            false
        }
    }
}

/// What the vCPU run loop does after a guest hypercall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestHcallExit {
    /// Handled at EL2, resume the guest.
    Resume,
    /// The host has to act first: fault the page in, top up the guest
    /// pool, or handle a call this crate does not know.
    Host,
    /// The guest gave back the page at `phys`; the host must be told.
    Relinquished { phys: u64 },
}

fn guest_result(regs: &mut GeneralPurposeRegs, ret: Result<()>) -> GuestHcallExit {
    match ret {
        Ok(()) => {
            regs.set_reg(0, SMCCC_RET_SUCCESS as u64);
            GuestHcallExit::Resume
        }
        // Not mapped yet, or the pool needs a refill: let the host fix it
        // up and re-run the call.
        Err(Error::Fault) | Err(Error::NoMem) => GuestHcallExit::Host,
        Err(_) => {
            regs.set_reg(0, SMCCC_RET_INVALID_PARAMETER as u64);
            GuestHcallExit::Resume
        }
    }
}

/// Handle a memory-related hypercall from a guest vCPU.
pub fn handle_guest_hcall(mp: &MemProtect, vcpu: &HypVcpu, regs: &mut GeneralPurposeRegs) -> GuestHcallExit {
    let id = regs.get_reg(0);
    let ipa = regs.get_reg(1);

    let known = matches!(
        id,
        GUEST_HCALL_MEM_SHARE
            | GUEST_HCALL_MEM_UNSHARE
            | GUEST_HCALL_MEM_RELINQUISH
            | GUEST_HCALL_MMIO_GUARD_MAP
            | GUEST_HCALL_MMIO_GUARD_UNMAP
    );
    if !known {
        return GuestHcallExit::Host;
    }

    if regs.get_reg(2) != 0 || regs.get_reg(3) != 0 {
        regs.set_reg(0, SMCCC_RET_INVALID_PARAMETER as u64);
        return GuestHcallExit::Resume;
    }

    match id {
        GUEST_HCALL_MEM_SHARE => guest_result(regs, mp.guest_share_host(vcpu, ipa)),
        GUEST_HCALL_MEM_UNSHARE => guest_result(regs, mp.guest_unshare_host(vcpu, ipa)),
        GUEST_HCALL_MMIO_GUARD_MAP => guest_result(regs, mp.install_ioguard_page(vcpu, ipa)),
        GUEST_HCALL_MMIO_GUARD_UNMAP => guest_result(regs, mp.remove_ioguard_page(vcpu, ipa)),
        _ => match mp.guest_relinquish_to_host(vcpu, ipa) {
            Ok(phys) => {
                regs.set_reg(0, SMCCC_RET_SUCCESS as u64);
                if phys == 0 {
                    GuestHcallExit::Resume
                } else {
                    GuestHcallExit::Relinquished { phys }
                }
            }
            Err(err) => guest_result(regs, Err(err)),
        },
    }
}
