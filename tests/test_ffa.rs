//! Host memory shared with the secure world

mod common;

use common::*;
use memprotect::ffa::descriptors::{build_mem_region, MAX_ADDR_RANGES};
use memprotect::ffa::{parse_mem_region, share_mem_region, unshare_mem_region, MemRegionAddrRange};
use memprotect::mem_protect::PageState;
use memprotect::Error;

fn range(pfn: u64, page_count: u32) -> MemRegionAddrRange {
    MemRegionAddrRange {
        address: phys(pfn),
        page_count,
    }
}

#[test]
fn share_and_unshare_pages() {
    let fx = setup();
    let pfn = host_pfn(80);

    fx.mp.host_share_ffa(pfn, 2).unwrap();
    for i in 0..2 {
        assert_eq!(fx.mp.host_page_state(phys(pfn + i)), Ok(PageState::SHARED_OWNED));
        // The secure world has no table here.
        assert_eq!(fx.mp.hyp_page_state(phys(pfn + i)), Ok(PageState::NOPAGE));
    }
    assert_eq!(fx.mp.host_share_ffa(pfn + 1, 1), Err(Error::Perm));

    fx.mp.host_unshare_ffa(pfn, 2).unwrap();
    assert_eq!(fx.mp.host_page_state(phys(pfn)), Ok(PageState::OWNED));
    assert_eq!(fx.mp.host_unshare_ffa(pfn, 1), Err(Error::Perm));
}

#[test]
fn only_ram_can_be_shared() {
    let fx = setup();
    assert_eq!(fx.mp.host_share_ffa(MMIO_BASE >> 12, 1), Err(Error::Inval));
    assert_eq!(fx.mp.host_share_ffa(host_pfn(81), 0), Err(Error::Inval));
    assert_eq!(fx.mp.host_share_ffa(host_pfn(81), 1 << 52), Err(Error::Inval));
    assert_eq!(fx.mp.host_share_ffa(u64::MAX >> 12, 2), Err(Error::Inval));
}

#[test]
fn region_share_round_trip() {
    let fx = setup();
    let ranges = [range(host_pfn(90), 2), range(host_pfn(100), 1)];
    let buf = build_mem_region(0x0001, 0x8001, &ranges);

    let region = share_mem_region(&fx.mp, &buf).unwrap();
    assert_eq!(region.receiver_id, 0x8001);
    assert_eq!(fx.mp.host_page_state(phys(host_pfn(91))), Ok(PageState::SHARED_OWNED));
    assert_eq!(fx.mp.host_page_state(phys(host_pfn(100))), Ok(PageState::SHARED_OWNED));

    unshare_mem_region(&fx.mp, &region).unwrap();
    assert_eq!(fx.mp.host_page_state(phys(host_pfn(90))), Ok(PageState::OWNED));
    assert_eq!(fx.mp.host_page_state(phys(host_pfn(100))), Ok(PageState::OWNED));
}

#[test]
fn failed_region_share_is_rolled_back() {
    let fx = setup();
    fx.mp.host_share_hyp(host_pfn(110)).unwrap();

    let ranges = [range(host_pfn(104), 2), range(host_pfn(110), 1)];
    let buf = build_mem_region(0x0001, 0x8001, &ranges);

    assert_eq!(share_mem_region(&fx.mp, &buf), Err(Error::Perm));
    assert_eq!(fx.mp.host_page_state(phys(host_pfn(104))), Ok(PageState::OWNED));
    assert_eq!(fx.mp.host_page_state(phys(host_pfn(105))), Ok(PageState::OWNED));
    // The hyp share is not disturbed.
    assert_eq!(fx.mp.host_page_state(phys(host_pfn(110))), Ok(PageState::SHARED_OWNED));
}

#[test]
fn descriptor_limits() {
    let ranges: Vec<_> = (0..=MAX_ADDR_RANGES as u64)
        .map(|i| range(host_pfn(120 + 2 * i), 1))
        .collect();
    let buf = build_mem_region(0x0001, 0x8001, &ranges);
    assert_eq!(parse_mem_region(&buf), Err(Error::TooBig));

    let buf = build_mem_region(0x0001, 0x8001, &ranges[..MAX_ADDR_RANGES]);
    assert_eq!(parse_mem_region(&buf).map(|r| r.ranges.len()), Ok(MAX_ADDR_RANGES));

    let buf = build_mem_region(0x0001, 0x8001, &[]);
    assert_eq!(parse_mem_region(&buf), Err(Error::Inval));
}
