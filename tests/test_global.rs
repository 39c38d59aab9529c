//! One-shot global engine

mod common;

use std::sync::Arc;

use common::*;
use memprotect::global::GlobalMemProtect;
use memprotect::mem_protect::PageState;
use memprotect::MemProtect;

fn engine() -> MemProtect {
    MemProtect::new(config(), Arc::new(MockOps::default())).unwrap()
}

#[test]
fn empty_until_initialized() {
    let global = GlobalMemProtect::new();
    assert!(!global.is_initialized());
    assert!(global.get().is_none());
}

#[test]
fn initialized_once() {
    let global = GlobalMemProtect::new();

    assert!(global.init(engine()).is_ok());
    assert!(global.is_initialized());

    // The loser gets its engine back.
    let spare = match global.init(engine()) {
        Ok(()) => panic!("second init accepted"),
        Err(mp) => mp,
    };
    spare.host_share_hyp(host_pfn(1)).unwrap();

    let mp = global.get().unwrap();
    assert_eq!(mp.host_page_state(phys(host_pfn(1))), Ok(PageState::OWNED));
    mp.host_share_hyp(host_pfn(2)).unwrap();
    assert_eq!(
        global.get().unwrap().host_page_state(phys(host_pfn(2))),
        Ok(PageState::SHARED_OWNED)
    );
}
