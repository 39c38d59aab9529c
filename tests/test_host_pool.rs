//! Host stage-2 pool exhaustion and recycling

mod common;

use common::*;
use memprotect::arch::aarch64::defs::*;
use memprotect::arch::aarch64::mm::{Prot, Pte};
use memprotect::mem_protect::host_s2_pgtable_pages;
use memprotect::mm::memblock::MoveableRegions;
use memprotect::Error;

/// One device address per level-0 slot: each needs its own table page.
fn far_mmio(k: u64) -> u64 {
    k << 39
}

#[test]
fn pool_size_covers_ram_root_and_spares() {
    let fx = setup();
    let moveable = MoveableRegions::from_memory(&fx.mp.layout().regions);
    // 64 MiB bank: 32 + 1 + 1 + 1. The 1 MiB no-map bank: 4. Then the
    // root and the MMIO spares.
    assert_eq!(host_s2_pgtable_pages(&moveable), 35 + 4 + 1 + 16);
}

#[test]
fn unmoveable_mappings_are_recycled() {
    let fx = setup();
    let last = 128;

    for k in 1..=last {
        let mut ctx = host_abort(EC_DABT_LOWER, ESR_FSC_TRANS, 0, far_mmio(k));
        fx.mp.handle_host_mem_abort(&mut ctx);
        assert_eq!(ctx.esr_el1, 0, "fault {} was reflected", k);
        let (pte, _) = fx.mp.host_stage2_get_leaf(far_mmio(k)).unwrap();
        assert!(pte.is_valid(), "fault {} left no mapping", k);
    }

    // Early device mappings were dropped to make room, RAM was not.
    let (pte, _) = fx.mp.host_stage2_get_leaf(far_mmio(1)).unwrap();
    assert_eq!(pte, Pte::Invalid);
    let (pte, _) = fx.mp.host_stage2_get_leaf(RAM_BASE).unwrap();
    assert!(pte.is_valid());

    // A recycled range just faults back in.
    let mut ctx = host_abort(EC_DABT_LOWER, ESR_FSC_TRANS, 0, far_mmio(1));
    fx.mp.handle_host_mem_abort(&mut ctx);
    assert!(fx.mp.host_stage2_get_leaf(far_mmio(1)).unwrap().0.is_valid());
}

#[test]
fn pinned_mappings_exhaust_the_pool() {
    let fx = setup();
    let prot = Prot::R | Prot::DEVICE;

    let mut err = None;
    for k in 1..256 {
        if let Err(e) = fx.mp.module_change_host_page_prot(far_mmio(k) >> PAGE_SHIFT, prot, 1) {
            err = Some((k, e));
            break;
        }
    }

    let (k, e) = err.expect("pool never ran out");
    assert_eq!(e, Error::NoMem);
    assert!(k > 1);

    // Non-default mappings survive the recycling pass.
    let (pte, _) = fx.mp.host_stage2_get_leaf(far_mmio(1)).unwrap();
    assert!(pte.is_valid());
}
