//! Ownership transitions
//!
//! Every share, unshare and donation is a [`MemTransition`] that runs in
//! two phases under the locks of both participants:
//!
//! 1. check: the initiator validates its request, the completer validates
//!    its acknowledgement. Nothing is modified.
//! 2. commit: the initiator, then the completer, update their tables.
//!
//! A commit that fails after a successful check means the tables and the
//! vmemmap disagree, which is not recoverable.

use log::error;

use crate::arch::aarch64::defs::{LAST_LEVEL, PAGE_SIZE};
use crate::arch::aarch64::mm::pte::{leaf_prot, pte_to_phys};
use crate::arch::aarch64::mm::Prot;
use crate::error::{Error, Result};
use crate::mem_protect::component::{ComponentId, Components};
use crate::mem_protect::guest::guest_page_state;
use crate::mem_protect::hyp::default_hyp_prot;
use crate::mem_protect::state::PageState;
use crate::platform::{hyp_pa, hyp_va};
use crate::vm::HypVm;

/// Side that asks for the transition.
#[derive(Clone, Copy)]
pub enum Initiator<'v> {
    Host { addr: u64, completer_addr: u64 },
    Hyp { addr: u64, completer_addr: u64 },
    /// The completer address is derived from the guest's own mapping
    /// during the check phase.
    Guest { vm: &'v HypVm, addr: u64, completer_addr: u64 },
}

impl Initiator<'_> {
    pub fn id(&self) -> ComponentId {
        match self {
            Initiator::Host { .. } => ComponentId::Host,
            Initiator::Hyp { .. } => ComponentId::Hyp,
            Initiator::Guest { vm, .. } => ComponentId::Guest(vm.handle()),
        }
    }

    fn addr(&self) -> u64 {
        match *self {
            Initiator::Host { addr, .. }
            | Initiator::Hyp { addr, .. }
            | Initiator::Guest { addr, .. } => addr,
        }
    }

    fn completer_addr(&self) -> u64 {
        match *self {
            Initiator::Host { completer_addr, .. }
            | Initiator::Hyp { completer_addr, .. }
            | Initiator::Guest { completer_addr, .. } => completer_addr,
        }
    }
}

/// Side that accepts the transition.
#[derive(Clone, Copy)]
pub enum Completer<'v> {
    Host,
    Hyp,
    Guest { vm: &'v HypVm, phys: u64 },
    SecureAgent,
}

impl Completer<'_> {
    pub fn id(&self) -> ComponentId {
        match self {
            Completer::Host => ComponentId::Host,
            Completer::Hyp => ComponentId::Hyp,
            Completer::Guest { vm, .. } => ComponentId::Guest(vm.handle()),
            Completer::SecureAgent => ComponentId::SecureAgent,
        }
    }
}

pub struct MemTransition<'v> {
    pub nr_pages: u64,
    pub initiator: Initiator<'v>,
    pub completer: Completer<'v>,
    /// Permissions the completer maps the pages with.
    pub completer_prot: Prot,
}

impl MemTransition<'_> {
    fn size(&self) -> u64 {
        self.nr_pages * PAGE_SIZE
    }

    /// Every later `size()` and `addr + size` is in range once this passed.
    fn check_range(&self) -> Result<()> {
        let size = self.nr_pages.checked_mul(PAGE_SIZE).ok_or(Error::Inval)?;
        self.initiator.addr().checked_add(size).ok_or(Error::Inval)?;
        self.initiator.completer_addr().checked_add(size).ok_or(Error::Inval)?;
        Ok(())
    }
}

/// Optional completer-side table checks only run in debug builds when the
/// initiator is trusted to have done the equivalent check already.
const PGTABLE_CROSS_CHECKS: bool = cfg!(any(debug_assertions, feature = "el2_debug"));

fn host_ack_skip_pgtable_check(tx: &MemTransition<'_>) -> bool {
    !PGTABLE_CROSS_CHECKS && tx.initiator.id() == ComponentId::Hyp
}

fn hyp_ack_skip_pgtable_check(tx: &MemTransition<'_>) -> bool {
    !PGTABLE_CROSS_CHECKS && tx.initiator.id() == ComponentId::Host
}

#[cold]
fn commit_failed(what: &str, tx: &MemTransition<'_>, err: Error) -> ! {
    error!(
        "{} {:?} -> {:?} ({} pages) failed after a successful check: {}",
        what,
        tx.initiator.id(),
        tx.completer.id(),
        tx.nr_pages,
        err
    );
    panic!("{} commit failed: {}", what, err)
}

// ── Host ─────────────────────────────────────────────────────────────

fn host_request_owned_transition(cx: &mut Components<'_>, addr: u64, size: u64) -> Result<()> {
    let layout = cx.layout();
    cx.host().check_page_state_range(layout, addr, size, PageState::OWNED)
}

fn host_request_unshare(cx: &mut Components<'_>, addr: u64, size: u64) -> Result<()> {
    let layout = cx.layout();
    cx.host().check_page_state_range(layout, addr, size, PageState::SHARED_OWNED)
}

fn host_initiate_share(cx: &mut Components<'_>, addr: u64, size: u64) -> Result<()> {
    let layout = cx.layout();
    cx.host().set_page_state_range(layout, addr, size, PageState::SHARED_OWNED)
}

fn host_initiate_unshare(cx: &mut Components<'_>, addr: u64, size: u64) -> Result<()> {
    let layout = cx.layout();
    cx.host().set_page_state_range(layout, addr, size, PageState::OWNED)
}

fn host_initiate_donation(cx: &mut Components<'_>, tx: &MemTransition<'_>, addr: u64) -> Result<()> {
    let layout = cx.layout();
    let owner = tx.completer.id().owner_id();
    cx.host().set_owner_locked(layout, addr, tx.size(), owner)
}

fn host_ack_transition(
    cx: &mut Components<'_>,
    tx: &MemTransition<'_>,
    addr: u64,
    state: PageState,
) -> Result<()> {
    if host_ack_skip_pgtable_check(tx) {
        return Ok(());
    }
    let layout = cx.layout();
    cx.host().check_page_state_range(layout, addr, tx.size(), state)
}

fn host_ack_share(cx: &mut Components<'_>, tx: &MemTransition<'_>, addr: u64) -> Result<()> {
    if tx.completer_prot != Prot::RWX {
        return Err(Error::Perm);
    }
    host_ack_transition(cx, tx, addr, PageState::NOPAGE)
}

fn host_ack_unshare(cx: &mut Components<'_>, tx: &MemTransition<'_>, addr: u64) -> Result<()> {
    let layout = cx.layout();
    cx.host().check_page_state_range(layout, addr, tx.size(), PageState::SHARED_BORROWED)
}

fn host_complete_share(cx: &mut Components<'_>, tx: &MemTransition<'_>, addr: u64) -> Result<()> {
    if let ComponentId::Guest(_) = tx.initiator.id() {
        cx.ops().psci_mem_protect_dec(tx.nr_pages);
    }
    let layout = cx.layout();
    cx.host().set_page_state_range(layout, addr, tx.size(), PageState::SHARED_BORROWED)
}

fn host_complete_unshare(cx: &mut Components<'_>, tx: &MemTransition<'_>, addr: u64) -> Result<()> {
    if let ComponentId::Guest(_) = tx.initiator.id() {
        cx.ops().psci_mem_protect_inc(tx.nr_pages);
    }
    let layout = cx.layout();
    let owner = tx.initiator.id().owner_id();
    cx.host().set_owner_locked(layout, addr, tx.size(), owner)
}

fn host_complete_donation(cx: &mut Components<'_>, tx: &MemTransition<'_>, addr: u64) -> Result<()> {
    let layout = cx.layout();
    cx.host().set_owner_locked(layout, addr, tx.size(), ComponentId::Host.owner_id())
}

// ── Hyp ──────────────────────────────────────────────────────────────

fn hyp_request_donation(cx: &mut Components<'_>, addr: u64, size: u64) -> Result<()> {
    cx.hyp().check_page_state_range(addr, size, PageState::OWNED)
}

fn hyp_initiate_donation(cx: &mut Components<'_>, addr: u64, size: u64) -> Result<()> {
    if cx.hyp().unmap(addr, size)? != size {
        return Err(Error::Fault);
    }
    Ok(())
}

fn hyp_ack_share(cx: &mut Components<'_>, tx: &MemTransition<'_>, addr: u64) -> Result<()> {
    let layout = cx.layout();
    let phys = hyp_pa(addr);
    if !layout.regions.addr_is_memory(phys)
        || tx.completer_prot != default_hyp_prot(&layout.regions, phys)
    {
        return Err(Error::Perm);
    }
    if !cx.hyp().has_room_for(tx.size()) {
        return Err(Error::NoMem);
    }
    if hyp_ack_skip_pgtable_check(tx) {
        return Ok(());
    }
    cx.hyp().check_page_state_range(addr, tx.size(), PageState::NOPAGE)
}

fn hyp_ack_unshare(cx: &mut Components<'_>, tx: &MemTransition<'_>, addr: u64) -> Result<()> {
    if tx.initiator.id() == ComponentId::Host {
        let pinned = (0..tx.nr_pages)
            .any(|i| cx.host().vmemmap.page_count(hyp_pa(addr + i * PAGE_SIZE)) != 0);
        if pinned {
            return Err(Error::Busy);
        }
    }
    cx.hyp().check_page_state_range(addr, tx.size(), PageState::SHARED_BORROWED)
}

fn hyp_ack_donation(cx: &mut Components<'_>, tx: &MemTransition<'_>, addr: u64) -> Result<()> {
    if !cx.hyp().has_room_for(tx.size()) {
        return Err(Error::NoMem);
    }
    if hyp_ack_skip_pgtable_check(tx) {
        return Ok(());
    }
    cx.hyp().check_page_state_range(addr, tx.size(), PageState::NOPAGE)
}

fn hyp_complete_share(cx: &mut Components<'_>, tx: &MemTransition<'_>, addr: u64) -> Result<()> {
    let prot = PageState::SHARED_BORROWED.mkstate(tx.completer_prot);
    cx.hyp().create_mappings_locked(addr, tx.size(), prot)
}

fn hyp_complete_unshare(cx: &mut Components<'_>, tx: &MemTransition<'_>, addr: u64) -> Result<()> {
    hyp_initiate_donation(cx, addr, tx.size())
}

fn hyp_complete_donation(cx: &mut Components<'_>, tx: &MemTransition<'_>, addr: u64) -> Result<()> {
    let prot = PageState::OWNED.mkstate(tx.completer_prot);
    cx.hyp().create_mappings_locked(addr, tx.size(), prot)
}

// ── Guest ────────────────────────────────────────────────────────────

/// Validate the guest side and work out where the completer sees the page.
fn guest_request_page_transition(
    cx: &mut Components<'_>,
    tx: &mut MemTransition<'_>,
    desired: PageState,
) -> Result<()> {
    let Initiator::Guest { vm, addr, .. } = tx.initiator else {
        return Err(Error::Inval);
    };

    if tx.nr_pages != 1 {
        return Err(Error::TooBig);
    }
    if addr % PAGE_SIZE != 0 {
        return Err(Error::Inval);
    }

    let (raw, level) = cx.guest(vm).get_leaf(addr)?;
    let state = guest_page_state(raw);
    if state == PageState::NOPAGE {
        return Err(Error::Fault);
    }
    if state != desired {
        return Err(Error::Perm);
    }
    if level != LAST_LEVEL {
        log::warn!("guest {} maps {:#x} with a block", vm.handle(), addr);
        return Err(Error::Inval);
    }

    let phys = pte_to_phys(raw);
    if !cx.layout().regions.addr_is_allowed_memory(phys) {
        return Err(Error::Inval);
    }

    let completer_addr = match tx.completer {
        Completer::Host => phys,
        Completer::Hyp => hyp_va(phys),
        _ => return Err(Error::Inval),
    };
    tx.initiator = Initiator::Guest {
        vm,
        addr,
        completer_addr,
    };
    Ok(())
}

/// Rewrite the guest's own leaf with the new state, same output address.
fn guest_initiate_page_transition(
    cx: &mut Components<'_>,
    vm: &HypVm,
    addr: u64,
    size: u64,
    state: PageState,
) -> Result<()> {
    let mmu = cx.guest(vm);
    let (raw, _) = mmu.get_leaf(addr)?;
    let prot = state.mkstate(leaf_prot(raw));
    mmu.map(addr, size, pte_to_phys(raw), prot)
}

fn guest_ack_share(
    cx: &mut Components<'_>,
    tx: &MemTransition<'_>,
    vm: &HypVm,
    phys: u64,
    addr: u64,
) -> Result<()> {
    if !cx.layout().regions.addr_is_memory(phys) || !Prot::RWX.contains(tx.completer_prot) {
        return Err(Error::Perm);
    }
    let mmu = cx.guest(vm);
    if !mmu.has_room_for(tx.size()) {
        return Err(Error::NoMem);
    }
    mmu.check_page_state_range(addr, tx.size(), PageState::NOPAGE)
}

fn guest_ack_donation(
    cx: &mut Components<'_>,
    tx: &MemTransition<'_>,
    vm: &HypVm,
    phys: u64,
    addr: u64,
) -> Result<()> {
    if !cx.layout().regions.addr_is_memory(phys) {
        return Err(Error::Perm);
    }
    if vm.ipa_range_has_pvmfw(addr, addr + tx.size()) && !vm.is_protected() {
        log::warn!("firmware donation to unprotected vm {}", vm.handle());
        return Err(Error::Perm);
    }
    let mmu = cx.guest(vm);
    if !mmu.has_room_for(tx.size()) {
        return Err(Error::NoMem);
    }
    mmu.check_page_state_range(addr, tx.size(), PageState::NOPAGE)
}

fn guest_complete_share(
    cx: &mut Components<'_>,
    tx: &MemTransition<'_>,
    vm: &HypVm,
    phys: u64,
    addr: u64,
) -> Result<()> {
    let prot = PageState::SHARED_BORROWED.mkstate(tx.completer_prot);
    cx.guest(vm).map(addr, tx.size(), phys, prot)
}

fn guest_complete_donation(
    cx: &mut Components<'_>,
    tx: &MemTransition<'_>,
    vm: &HypVm,
    phys: u64,
    addr: u64,
) -> Result<()> {
    let size = tx.size();

    if tx.initiator.id() == ComponentId::Host {
        cx.ops().psci_mem_protect_inc(tx.nr_pages);
    }
    if vm.ipa_range_has_pvmfw(addr, addr + size) {
        cx.ops().load_pvmfw_pages(vm.pvmfw_offset(addr), phys, size)?;
    }

    let prot = PageState::OWNED.mkstate(Prot::RWX);
    cx.guest(vm).map(addr, size, phys, prot)
}

// ── Share ────────────────────────────────────────────────────────────

fn check_share(cx: &mut Components<'_>, tx: &mut MemTransition<'_>) -> Result<()> {
    let size = tx.size();

    match tx.initiator {
        Initiator::Host { addr, .. } => host_request_owned_transition(cx, addr, size)?,
        Initiator::Guest { .. } => guest_request_page_transition(cx, tx, PageState::OWNED)?,
        Initiator::Hyp { .. } => return Err(Error::Inval),
    }

    let addr = tx.initiator.completer_addr();
    match tx.completer {
        Completer::Host => host_ack_share(cx, tx, addr),
        Completer::Hyp => hyp_ack_share(cx, tx, addr),
        Completer::Guest { vm, phys } => guest_ack_share(cx, tx, vm, phys, addr),
        Completer::SecureAgent => Ok(()),
    }
}

fn commit_share(cx: &mut Components<'_>, tx: &MemTransition<'_>) -> Result<()> {
    let size = tx.size();

    match tx.initiator {
        Initiator::Host { addr, .. } => host_initiate_share(cx, addr, size)?,
        Initiator::Guest { vm, addr, .. } => {
            guest_initiate_page_transition(cx, vm, addr, size, PageState::SHARED_OWNED)?
        }
        Initiator::Hyp { .. } => return Err(Error::Inval),
    }

    let addr = tx.initiator.completer_addr();
    match tx.completer {
        Completer::Host => host_complete_share(cx, tx, addr),
        Completer::Hyp => hyp_complete_share(cx, tx, addr),
        Completer::Guest { vm, phys } => guest_complete_share(cx, tx, vm, phys, addr),
        Completer::SecureAgent => Ok(()),
    }
}

/// Give the completer access to pages the initiator keeps owning.
pub fn do_share(cx: &mut Components<'_>, tx: &mut MemTransition<'_>) -> Result<()> {
    tx.check_range()?;
    check_share(cx, tx)?;
    if let Err(err) = commit_share(cx, tx) {
        commit_failed("share", tx, err);
    }
    Ok(())
}

// ── Unshare ──────────────────────────────────────────────────────────

fn check_unshare(cx: &mut Components<'_>, tx: &mut MemTransition<'_>) -> Result<()> {
    let size = tx.size();

    match tx.initiator {
        Initiator::Host { addr, .. } => host_request_unshare(cx, addr, size)?,
        Initiator::Guest { .. } => guest_request_page_transition(cx, tx, PageState::SHARED_OWNED)?,
        Initiator::Hyp { .. } => return Err(Error::Inval),
    }

    let addr = tx.initiator.completer_addr();
    match tx.completer {
        Completer::Host => host_ack_unshare(cx, tx, addr),
        Completer::Hyp => hyp_ack_unshare(cx, tx, addr),
        Completer::SecureAgent => Ok(()),
        Completer::Guest { .. } => Err(Error::Inval),
    }
}

fn commit_unshare(cx: &mut Components<'_>, tx: &MemTransition<'_>) -> Result<()> {
    let size = tx.size();

    match tx.initiator {
        Initiator::Host { addr, .. } => host_initiate_unshare(cx, addr, size)?,
        Initiator::Guest { vm, addr, .. } => {
            guest_initiate_page_transition(cx, vm, addr, size, PageState::OWNED)?
        }
        Initiator::Hyp { .. } => return Err(Error::Inval),
    }

    let addr = tx.initiator.completer_addr();
    match tx.completer {
        Completer::Host => host_complete_unshare(cx, tx, addr),
        Completer::Hyp => hyp_complete_unshare(cx, tx, addr),
        Completer::SecureAgent => Ok(()),
        Completer::Guest { .. } => Err(Error::Inval),
    }
}

/// Revoke access previously granted by [`do_share`].
pub fn do_unshare(cx: &mut Components<'_>, tx: &mut MemTransition<'_>) -> Result<()> {
    tx.check_range()?;
    check_unshare(cx, tx)?;
    if let Err(err) = commit_unshare(cx, tx) {
        commit_failed("unshare", tx, err);
    }
    Ok(())
}

// ── Donation ─────────────────────────────────────────────────────────

fn check_donation(cx: &mut Components<'_>, tx: &mut MemTransition<'_>) -> Result<()> {
    let size = tx.size();

    match tx.initiator {
        Initiator::Host { addr, .. } => host_request_owned_transition(cx, addr, size)?,
        Initiator::Hyp { addr, .. } => hyp_request_donation(cx, addr, size)?,
        Initiator::Guest { .. } => return Err(Error::Inval),
    }

    let addr = tx.initiator.completer_addr();
    match tx.completer {
        Completer::Host => host_ack_transition(cx, tx, addr, PageState::NOPAGE),
        Completer::Hyp => hyp_ack_donation(cx, tx, addr),
        Completer::Guest { vm, phys } => guest_ack_donation(cx, tx, vm, phys, addr),
        Completer::SecureAgent => Err(Error::Inval),
    }
}

fn commit_donation(cx: &mut Components<'_>, tx: &MemTransition<'_>) -> Result<()> {
    let size = tx.size();

    match tx.initiator {
        Initiator::Host { addr, .. } => host_initiate_donation(cx, tx, addr)?,
        Initiator::Hyp { addr, .. } => hyp_initiate_donation(cx, addr, size)?,
        Initiator::Guest { .. } => return Err(Error::Inval),
    }

    let addr = tx.initiator.completer_addr();
    match tx.completer {
        Completer::Host => host_complete_donation(cx, tx, addr),
        Completer::Hyp => hyp_complete_donation(cx, tx, addr),
        Completer::Guest { vm, phys } => guest_complete_donation(cx, tx, vm, phys, addr),
        Completer::SecureAgent => Err(Error::Inval),
    }
}

/// Hand ownership of pages from the initiator to the completer.
pub fn do_donate(cx: &mut Components<'_>, tx: &mut MemTransition<'_>) -> Result<()> {
    tx.check_range()?;
    check_donation(cx, tx)?;
    if let Err(err) = commit_donation(cx, tx) {
        commit_failed("donation", tx, err);
    }
    Ok(())
}
