//! Memory discovery from the host device tree

mod common;

use common::*;
use memprotect::dtb::memory_regions_from_fdt;
use memprotect::mem_protect::PageState;
use memprotect::mm::memblock::{MemblockFlags, MemblockRegion};
use memprotect::{Error, MemProtectConfig};

const FW_BASE: u64 = 0x0200_0000;
const FW_SIZE: u64 = 0x0010_0000;

#[test]
fn plain_board() {
    let regions = memory_regions_from_fdt(&board_dtb(None)).unwrap();
    // shared-dma has no no-map and stays in RAM.
    assert_eq!(regions, vec![MemblockRegion::new(RAM_BASE, RAM_SIZE)]);
}

#[test]
fn nomap_carveout_is_split_out() {
    let regions = memory_regions_from_fdt(&board_dtb(Some((FW_BASE, FW_SIZE)))).unwrap();

    assert_eq!(regions.len(), 3);
    assert_eq!(regions[0], MemblockRegion::new(RAM_BASE, FW_BASE - RAM_BASE));
    assert_eq!(regions[1], MemblockRegion::nomap(FW_BASE, FW_SIZE));
    assert!(regions[1].flags.contains(MemblockFlags::NOMAP));
    assert_eq!(
        regions[2],
        MemblockRegion::new(FW_BASE + FW_SIZE, RAM_BASE + RAM_SIZE - FW_BASE - FW_SIZE)
    );
}

#[test]
fn engine_boots_from_the_tree() {
    let regions = memory_regions_from_fdt(&board_dtb(Some((FW_BASE, FW_SIZE)))).unwrap();
    let fx = setup_with(MemProtectConfig::new(
        regions,
        HOST_POOL_PFN,
        HYP_POOL_PFN,
        HYP_POOL_PAGES,
    ));

    assert_eq!(fx.mp.host_share_hyp(FW_BASE >> 12), Err(Error::Perm));

    let pfn = (FW_BASE + FW_SIZE) >> 12;
    fx.mp.host_share_hyp(pfn).unwrap();
    assert_eq!(fx.mp.host_page_state(phys(pfn)), Ok(PageState::SHARED_OWNED));
}

#[test]
fn garbage_is_rejected() {
    assert_eq!(memory_regions_from_fdt(&[0u8; 64]), Err(Error::Inval));

    let mut blob = board_dtb(None);
    blob[0] = 0;
    assert_eq!(memory_regions_from_fdt(&blob), Err(Error::Inval));
}

#[test]
fn tree_without_memory() {
    let mut fdt = FdtBuilder::new();
    fdt.begin_node("")
        .prop_u32("#address-cells", 2)
        .prop_u32("#size-cells", 2);
    fdt.begin_node("pl011@9000000")
        .prop_str("compatible", "arm,pl011")
        .prop_reg(&[(MMIO_BASE, 0x1000)])
        .end_node();
    fdt.end_node();

    assert_eq!(memory_regions_from_fdt(&fdt.finish()), Err(Error::Inval));
}
