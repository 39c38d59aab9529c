//! Host <-> hypervisor sharing, donation and pinning

mod common;

use common::*;
use memprotect::arch::aarch64::defs::PAGE_SIZE;
use memprotect::arch::aarch64::mm::{Prot, Pte};
use memprotect::mem_protect::{PageState, PKVM_ID_HYP};
use memprotect::platform::hyp_va;
use memprotect::Error;

#[test]
fn fresh_engine_state() {
    let fx = setup();

    assert_eq!(fx.mp.host_page_state(phys(host_pfn(0))), Ok(PageState::OWNED));
    assert_eq!(fx.mp.hyp_page_state(phys(host_pfn(0))), Ok(PageState::NOPAGE));

    // Both pool carve-outs belong to the hyp.
    for pfn in [HOST_POOL_PFN, HYP_POOL_PFN] {
        assert_eq!(fx.mp.host_page_state(phys(pfn)), Ok(PageState::NOPAGE));
        assert_eq!(fx.mp.hyp_page_state(phys(pfn)), Ok(PageState::OWNED));
        let (pte, _) = fx.mp.host_stage2_get_leaf(phys(pfn)).unwrap();
        assert_eq!(pte, Pte::Owned(PKVM_ID_HYP as u8));
    }

    // RAM is prepopulated, device memory is not.
    let (pte, _) = fx.mp.host_stage2_get_leaf(RAM_BASE).unwrap();
    assert!(pte.is_valid());
    let (pte, _) = fx.mp.host_stage2_get_leaf(MMIO_BASE).unwrap();
    assert_eq!(pte, Pte::Invalid);
    // Firmware no-map memory too.
    let (pte, _) = fx.mp.host_stage2_get_leaf(NOMAP_BASE).unwrap();
    assert_eq!(pte, Pte::Invalid);
}

#[test]
fn share_then_unshare() {
    let fx = setup();
    let pfn = host_pfn(1);

    fx.mp.host_share_hyp(pfn).unwrap();
    assert_eq!(fx.mp.host_page_state(phys(pfn)), Ok(PageState::SHARED_OWNED));
    assert_eq!(fx.mp.hyp_page_state(phys(pfn)), Ok(PageState::SHARED_BORROWED));

    // Host still has its mapping.
    let (pte, _) = fx.mp.host_stage2_get_leaf(phys(pfn)).unwrap();
    assert!(pte.is_valid());

    fx.mp.host_unshare_hyp(pfn).unwrap();
    assert_eq!(fx.mp.host_page_state(phys(pfn)), Ok(PageState::OWNED));
    assert_eq!(fx.mp.hyp_page_state(phys(pfn)), Ok(PageState::NOPAGE));
}

#[test]
fn double_share_is_refused() {
    let fx = setup();
    let pfn = host_pfn(2);

    fx.mp.host_share_hyp(pfn).unwrap();
    assert_eq!(fx.mp.host_share_hyp(pfn), Err(Error::Perm));
    assert_eq!(fx.mp.host_page_state(phys(pfn)), Ok(PageState::SHARED_OWNED));
}

#[test]
fn unshare_of_owned_page_is_refused() {
    let fx = setup();
    assert_eq!(fx.mp.host_unshare_hyp(host_pfn(3)), Err(Error::Perm));
}

#[test]
fn pool_pages_cannot_be_shared() {
    let fx = setup();
    assert_eq!(fx.mp.host_share_hyp(HYP_POOL_PFN), Err(Error::Perm));
    assert_eq!(fx.mp.host_share_hyp(HOST_POOL_PFN + 1), Err(Error::Perm));
}

#[test]
fn nomap_and_mmio_cannot_be_shared() {
    let fx = setup();
    assert_eq!(fx.mp.host_share_hyp(NOMAP_BASE >> 12), Err(Error::Perm));
    assert_eq!(fx.mp.host_share_hyp(MMIO_BASE >> 12), Err(Error::Perm));
}

#[test]
fn pinned_page_cannot_be_unshared() {
    let fx = setup();
    let pfn = host_pfn(4);
    let va = hyp_va(phys(pfn));

    fx.mp.host_share_hyp(pfn).unwrap();
    fx.mp.hyp_pin_shared_mem(va, va + PAGE_SIZE).unwrap();
    fx.mp.hyp_pin_shared_mem(va + 8, va + 16).unwrap();
    assert_eq!(fx.mp.hyp_page_count(phys(pfn)), 2);

    assert_eq!(fx.mp.host_unshare_hyp(pfn), Err(Error::Busy));
    assert_eq!(fx.mp.host_page_state(phys(pfn)), Ok(PageState::SHARED_OWNED));

    fx.mp.hyp_unpin_shared_mem(va, va + PAGE_SIZE).unwrap();
    assert_eq!(fx.mp.host_unshare_hyp(pfn), Err(Error::Busy));
    fx.mp.hyp_unpin_shared_mem(va, va + PAGE_SIZE).unwrap();
    assert_eq!(fx.mp.hyp_page_count(phys(pfn)), 0);

    fx.mp.host_unshare_hyp(pfn).unwrap();
}

#[test]
fn pin_requires_a_shared_page() {
    let fx = setup();
    let va = hyp_va(phys(host_pfn(5)));

    assert_eq!(fx.mp.hyp_pin_shared_mem(va, va + PAGE_SIZE), Err(Error::Perm));
    assert_eq!(fx.mp.hyp_page_count(phys(host_pfn(5))), 0);
}

#[test]
fn pin_range_must_be_fully_shared() {
    let fx = setup();
    let pfn = host_pfn(6);
    let va = hyp_va(phys(pfn));

    fx.mp.host_share_hyp(pfn).unwrap();
    assert_eq!(
        fx.mp.hyp_pin_shared_mem(va, va + 2 * PAGE_SIZE),
        Err(Error::Perm)
    );
    assert_eq!(fx.mp.hyp_page_count(phys(pfn)), 0);
}

#[test]
fn donate_and_give_back() {
    let fx = setup();
    let pfn = host_pfn(16);

    fx.mp.host_donate_hyp(pfn, 4).unwrap();
    for i in 0..4 {
        let addr = phys(pfn + i);
        assert_eq!(fx.mp.host_page_state(addr), Ok(PageState::NOPAGE));
        assert_eq!(fx.mp.hyp_page_state(addr), Ok(PageState::OWNED));
        let (pte, _) = fx.mp.host_stage2_get_leaf(addr).unwrap();
        assert_eq!(pte, Pte::Owned(PKVM_ID_HYP as u8));
    }
    // The neighbours are untouched.
    assert_eq!(fx.mp.host_page_state(phys(pfn + 4)), Ok(PageState::OWNED));

    fx.mp.hyp_donate_host(pfn, 4).unwrap();
    for i in 0..4 {
        let addr = phys(pfn + i);
        assert_eq!(fx.mp.host_page_state(addr), Ok(PageState::OWNED));
        assert_eq!(fx.mp.hyp_page_state(addr), Ok(PageState::NOPAGE));
        let (pte, _) = fx.mp.host_stage2_get_leaf(addr).unwrap();
        assert!(pte.is_valid());
    }
}

#[test]
fn donation_of_partly_shared_range_changes_nothing() {
    let fx = setup();
    let pfn = host_pfn(32);

    fx.mp.host_share_hyp(pfn + 2).unwrap();
    assert_eq!(fx.mp.host_donate_hyp(pfn, 4), Err(Error::Perm));
    assert_eq!(fx.mp.host_page_state(phys(pfn)), Ok(PageState::OWNED));
    assert_eq!(fx.mp.hyp_page_state(phys(pfn)), Ok(PageState::NOPAGE));
}

#[test]
fn hyp_cannot_donate_what_it_borrows() {
    let fx = setup();
    let pfn = host_pfn(40);

    fx.mp.host_share_hyp(pfn).unwrap();
    assert_eq!(fx.mp.hyp_donate_host(pfn, 1), Err(Error::Perm));
    assert_eq!(fx.mp.hyp_donate_host(host_pfn(41), 1), Err(Error::Perm));
}

#[test]
fn empty_donations_are_invalid() {
    let fx = setup();
    assert_eq!(fx.mp.host_donate_hyp(host_pfn(48), 0), Err(Error::Inval));
    assert_eq!(fx.mp.hyp_donate_host(host_pfn(48), 0), Err(Error::Inval));
}

#[test]
fn donation_must_stay_in_ram() {
    let fx = setup();
    // Last RAM page plus one past the end.
    let last = (RAM_BASE + RAM_SIZE) / PAGE_SIZE - 1;
    assert_eq!(fx.mp.host_donate_hyp(last, 2), Err(Error::Perm));
    assert_eq!(fx.mp.host_donate_hyp(MMIO_BASE >> 12, 1), Err(Error::Perm));
}

#[test]
fn device_donation_needs_mmio_opt_in() {
    let fx = setup();
    let pfn = MMIO_BASE >> 12;
    let prot = Prot::R | Prot::W | Prot::DEVICE;

    assert_eq!(fx.mp.host_donate_hyp_prot(pfn, 1, false, prot), Err(Error::Perm));
    fx.mp.host_donate_hyp_prot(pfn, 1, true, prot).unwrap();

    assert_eq!(fx.mp.hyp_page_state(MMIO_BASE), Ok(PageState::OWNED));
    let (pte, _) = fx.mp.host_stage2_get_leaf(MMIO_BASE).unwrap();
    assert_eq!(pte, Pte::Owned(PKVM_ID_HYP as u8));
}

#[test]
fn oversized_page_counts_are_invalid() {
    let fx = setup();
    let pfn = host_pfn(1);

    assert_eq!(fx.mp.host_donate_hyp(pfn, 1 << 52), Err(Error::Inval));
    assert_eq!(fx.mp.hyp_donate_host(pfn, 1 << 52), Err(Error::Inval));
    assert_eq!(
        fx.mp.host_donate_hyp_prot(pfn, 1 << 52, true, Prot::R | Prot::DEVICE),
        Err(Error::Inval)
    );
    // Last page of the address space plus one.
    assert_eq!(fx.mp.host_donate_hyp(u64::MAX >> 12, 2), Err(Error::Inval));
    assert_eq!(fx.mp.host_page_state(phys(pfn)), Ok(PageState::OWNED));
}
