//! Host and guest hypercall dispatch

mod common;

use common::*;
use memprotect::arch::aarch64::defs::*;
use memprotect::arch::aarch64::mm::Prot;
use memprotect::arch::aarch64::regs::{GeneralPurposeRegs, HostCpuContext};
use memprotect::hypercalls::*;
use memprotect::mem_protect::PageState;
use memprotect::vm::VmConfig;
use memprotect::Error;

const GFN: u64 = 0x8_0000;

fn hvc(args: &[u64]) -> HostCpuContext {
    let mut ctx = HostCpuContext::default();
    ctx.esr_el2 = EC_HVC64 << ESR_EC_SHIFT;
    for (i, arg) in args.iter().enumerate() {
        ctx.set_gpr(i as u8, *arg);
    }
    ctx
}

fn guest_call(args: &[u64]) -> GeneralPurposeRegs {
    let mut regs = GeneralPurposeRegs::default();
    for (i, arg) in args.iter().enumerate() {
        regs.set_reg(i as u8, *arg);
    }
    regs
}

fn errno(err: Error) -> u64 {
    err.to_errno() as u64
}

#[test]
fn host_share_hyp_reports_status_in_x1() {
    let fx = setup();
    let pfn = host_pfn(1);

    let mut ctx = hvc(&[HOST_HCALL_SHARE_HYP, pfn]);
    handle_host_hcall(&fx.mp, &mut ctx, None);
    assert_eq!(ctx.get_gpr(0), SMCCC_RET_SUCCESS as u64);
    assert_eq!(ctx.get_gpr(1), 0);
    assert_eq!(fx.mp.host_page_state(phys(pfn)), Ok(PageState::SHARED_OWNED));

    let mut ctx = hvc(&[HOST_HCALL_SHARE_HYP, pfn]);
    handle_host_hcall(&fx.mp, &mut ctx, None);
    assert_eq!(ctx.get_gpr(0), SMCCC_RET_SUCCESS as u64);
    assert_eq!(ctx.get_gpr(1), errno(Error::Perm));

    let mut ctx = hvc(&[HOST_HCALL_UNSHARE_HYP, pfn]);
    handle_host_hcall(&fx.mp, &mut ctx, None);
    assert_eq!(ctx.get_gpr(1), 0);
}

#[test]
fn unknown_host_call() {
    let fx = setup();
    let mut ctx = hvc(&[HOST_HCALL_BASE + 0x100]);
    handle_host_hcall(&fx.mp, &mut ctx, None);
    assert_eq!(ctx.get_gpr(0), SMCCC_RET_NOT_SUPPORTED as u64);
}

#[test]
fn guest_calls_from_the_host_need_a_loaded_vcpu() {
    let fx = setup();
    let vm = fx.vm(1, GUEST_POOL_PFN);
    let vcpu = fx.vcpu(&vm);

    let mut ctx = hvc(&[HOST_HCALL_SHARE_GUEST, host_pfn(2), GFN, Prot::RWX.bits()]);
    handle_host_hcall(&fx.mp, &mut ctx, None);
    assert_eq!(ctx.get_gpr(1), errno(Error::Inval));

    let mut ctx = hvc(&[HOST_HCALL_SHARE_GUEST, host_pfn(2), GFN, 1 << 40]);
    handle_host_hcall(&fx.mp, &mut ctx, Some(&vcpu));
    assert_eq!(ctx.get_gpr(1), errno(Error::Inval));

    let mut ctx = hvc(&[HOST_HCALL_SHARE_GUEST, host_pfn(2), GFN, Prot::RWX.bits()]);
    handle_host_hcall(&fx.mp, &mut ctx, Some(&vcpu));
    assert_eq!(ctx.get_gpr(1), 0);
    assert_eq!(
        fx.mp.guest_page_state(&vm, phys(GFN)),
        Ok(PageState::SHARED_BORROWED)
    );

    let mut ctx = hvc(&[HOST_HCALL_WRPROTECT_GUEST, 1, GFN]);
    handle_host_hcall(&fx.mp, &mut ctx, None);
    assert_eq!(ctx.get_gpr(1), 0);

    let mut ctx = hvc(&[HOST_HCALL_UNSHARE_GUEST, 1, GFN]);
    handle_host_hcall(&fx.mp, &mut ctx, None);
    assert_eq!(ctx.get_gpr(1), 0);
    assert_eq!(fx.mp.host_page_state(phys(host_pfn(2))), Ok(PageState::OWNED));

    // No such VM.
    let mut ctx = hvc(&[HOST_HCALL_UNSHARE_GUEST, 7, GFN]);
    handle_host_hcall(&fx.mp, &mut ctx, None);
    assert_eq!(ctx.get_gpr(1), errno(Error::Inval));
}

#[test]
fn protected_guests_get_no_host_shares() {
    let fx = setup();
    let vm = fx.vm_with(VmConfig {
        protected: true,
        ..VmConfig::new(1, GUEST_POOL_PFN, GUEST_POOL_PAGES)
    });
    let vcpu = fx.vcpu(&vm);

    let mut ctx = hvc(&[HOST_HCALL_SHARE_GUEST, host_pfn(3), GFN, Prot::RWX.bits()]);
    handle_host_hcall(&fx.mp, &mut ctx, Some(&vcpu));
    assert_eq!(ctx.get_gpr(1), errno(Error::Inval));

    let mut ctx = hvc(&[HOST_HCALL_DONATE_GUEST, host_pfn(3), GFN]);
    handle_host_hcall(&fx.mp, &mut ctx, Some(&vcpu));
    assert_eq!(ctx.get_gpr(1), 0);
    assert_eq!(fx.mp.guest_page_state(&vm, phys(GFN)), Ok(PageState::OWNED));

    let mut ctx = hvc(&[HOST_HCALL_TEARDOWN_VM, 1]);
    handle_host_hcall(&fx.mp, &mut ctx, None);
    assert_eq!(ctx.get_gpr(1), 0);
    assert!(fx.mp.vm_by_handle(1).is_none());
}

#[test]
fn host_trap_routing() {
    let fx = setup();

    let mut ctx = hvc(&[HOST_HCALL_SHARE_HYP, host_pfn(4)]);
    assert!(handle_host_trap(&fx.mp, &mut ctx, None));
    assert_eq!(ctx.get_gpr(1), 0);

    let mut ctx = host_abort(EC_DABT_LOWER, ESR_FSC_TRANS | 3, 0, MMIO_BASE);
    assert!(handle_host_trap(&fx.mp, &mut ctx, None));
    assert!(fx.mp.host_stage2_get_leaf(MMIO_BASE).unwrap().0.is_valid());

    // SVC64
    let mut ctx = HostCpuContext::default();
    ctx.esr_el2 = 0x15 << ESR_EC_SHIFT;
    assert!(!handle_host_trap(&fx.mp, &mut ctx, None));
}

#[test]
fn guest_call_arguments_must_be_zero() {
    let fx = setup();
    let vm = fx.vm(1, GUEST_POOL_PFN);
    let vcpu = fx.vcpu(&vm);

    let mut regs = guest_call(&[GUEST_HCALL_MEM_SHARE, phys(GFN), 1]);
    assert_eq!(handle_guest_hcall(&fx.mp, &vcpu, &mut regs), GuestHcallExit::Resume);
    assert_eq!(regs.get_reg(0), SMCCC_RET_INVALID_PARAMETER as u64);
}

#[test]
fn guest_share_of_missing_page_goes_to_the_host() {
    let fx = setup();
    let vm = fx.vm(1, GUEST_POOL_PFN);
    let vcpu = fx.vcpu(&vm);

    let mut regs = guest_call(&[GUEST_HCALL_MEM_SHARE, phys(GFN)]);
    assert_eq!(handle_guest_hcall(&fx.mp, &vcpu, &mut regs), GuestHcallExit::Host);
}

#[test]
fn guest_share_and_unshare() {
    let fx = setup();
    let vm = fx.vm_with(VmConfig {
        protected: true,
        ..VmConfig::new(1, GUEST_POOL_PFN, GUEST_POOL_PAGES)
    });
    let vcpu = fx.vcpu(&vm);
    fx.mp.host_donate_guest(host_pfn(5), GFN, &vcpu).unwrap();

    let mut regs = guest_call(&[GUEST_HCALL_MEM_SHARE, phys(GFN)]);
    assert_eq!(handle_guest_hcall(&fx.mp, &vcpu, &mut regs), GuestHcallExit::Resume);
    assert_eq!(regs.get_reg(0), SMCCC_RET_SUCCESS as u64);
    assert_eq!(fx.mp.host_page_state(phys(host_pfn(5))), Ok(PageState::SHARED_BORROWED));

    // Already shared.
    let mut regs = guest_call(&[GUEST_HCALL_MEM_SHARE, phys(GFN)]);
    assert_eq!(handle_guest_hcall(&fx.mp, &vcpu, &mut regs), GuestHcallExit::Resume);
    assert_eq!(regs.get_reg(0), SMCCC_RET_INVALID_PARAMETER as u64);

    let mut regs = guest_call(&[GUEST_HCALL_MEM_UNSHARE, phys(GFN)]);
    assert_eq!(handle_guest_hcall(&fx.mp, &vcpu, &mut regs), GuestHcallExit::Resume);
    assert_eq!(regs.get_reg(0), SMCCC_RET_SUCCESS as u64);
    assert_eq!(fx.mp.host_page_state(phys(host_pfn(5))), Ok(PageState::NOPAGE));
}

#[test]
fn guest_relinquish() {
    let fx = setup();
    let vm = fx.vm(1, GUEST_POOL_PFN);
    let vcpu = fx.vcpu(&vm);
    fx.mp
        .host_share_guest(host_pfn(6), GFN, &vcpu, Prot::RWX)
        .unwrap();

    let mut regs = guest_call(&[GUEST_HCALL_MEM_RELINQUISH, phys(GFN)]);
    assert_eq!(
        handle_guest_hcall(&fx.mp, &vcpu, &mut regs),
        GuestHcallExit::Relinquished { phys: phys(host_pfn(6)) }
    );
    assert_eq!(regs.get_reg(0), SMCCC_RET_SUCCESS as u64);

    // Nothing left to give back.
    let mut regs = guest_call(&[GUEST_HCALL_MEM_RELINQUISH, phys(GFN)]);
    assert_eq!(handle_guest_hcall(&fx.mp, &vcpu, &mut regs), GuestHcallExit::Resume);
    assert_eq!(regs.get_reg(0), SMCCC_RET_SUCCESS as u64);
}

#[test]
fn guest_mmio_guard_calls() {
    let fx = setup();
    let vm = fx.vm_with(VmConfig {
        mmio_guard: true,
        ..VmConfig::new(1, GUEST_POOL_PFN, GUEST_POOL_PAGES)
    });
    let vcpu = fx.vcpu(&vm);

    let mut regs = guest_call(&[GUEST_HCALL_MMIO_GUARD_MAP, MMIO_BASE]);
    assert_eq!(handle_guest_hcall(&fx.mp, &vcpu, &mut regs), GuestHcallExit::Resume);
    assert_eq!(regs.get_reg(0), SMCCC_RET_SUCCESS as u64);

    let mut regs = guest_call(&[GUEST_HCALL_MMIO_GUARD_MAP, MMIO_BASE + 8]);
    handle_guest_hcall(&fx.mp, &vcpu, &mut regs);
    assert_eq!(regs.get_reg(0), SMCCC_RET_INVALID_PARAMETER as u64);

    let mut regs = guest_call(&[GUEST_HCALL_MMIO_GUARD_UNMAP, MMIO_BASE]);
    assert_eq!(handle_guest_hcall(&fx.mp, &vcpu, &mut regs), GuestHcallExit::Resume);
    assert_eq!(regs.get_reg(0), SMCCC_RET_SUCCESS as u64);
}

#[test]
fn unknown_guest_call_goes_to_the_host() {
    let fx = setup();
    let vm = fx.vm(1, GUEST_POOL_PFN);
    let vcpu = fx.vcpu(&vm);

    let mut regs = guest_call(&[0x8400_0000]);
    assert_eq!(handle_guest_hcall(&fx.mp, &vcpu, &mut regs), GuestHcallExit::Host);
    assert_eq!(regs.get_reg(0), 0x8400_0000);
}

#[test]
fn guest_share_address_inside_the_page() {
    let fx = setup();
    let vm = fx.vm_with(VmConfig {
        protected: true,
        ..VmConfig::new(1, GUEST_POOL_PFN, GUEST_POOL_PAGES)
    });
    let vcpu = fx.vcpu(&vm);
    fx.mp.host_donate_guest(host_pfn(5), GFN, &vcpu).unwrap();

    let mut regs = guest_call(&[GUEST_HCALL_MEM_SHARE, phys(GFN) + 0x10]);
    assert_eq!(handle_guest_hcall(&fx.mp, &vcpu, &mut regs), GuestHcallExit::Resume);
    assert_eq!(regs.get_reg(0), SMCCC_RET_SUCCESS as u64);
    assert_eq!(fx.mp.host_page_state(phys(host_pfn(5))), Ok(PageState::SHARED_BORROWED));

    let mut regs = guest_call(&[GUEST_HCALL_MEM_UNSHARE, phys(GFN) + 0x10]);
    assert_eq!(handle_guest_hcall(&fx.mp, &vcpu, &mut regs), GuestHcallExit::Resume);
    assert_eq!(regs.get_reg(0), SMCCC_RET_SUCCESS as u64);
    assert_eq!(fx.mp.host_page_state(phys(host_pfn(5))), Ok(PageState::NOPAGE));
}
