//! Memory ownership and protection engine
//!
//! [`MemProtect`] owns the three kinds of page tables the hypervisor
//! arbitrates (the host stage-2, the hyp stage-1 and one stage-2 per guest)
//! together with the vmemmap, and exposes the hypercall-level operations
//! that move pages between them.
//!
//! ## Lock order
//!
//! host → hyp → guest, always, through [`MemProtect::lock_components`].

pub mod component;
pub mod fault;
pub mod guest;
pub mod host;
pub mod hyp;
pub mod ioguard;
pub mod module;
pub mod state;
pub mod transition;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, info, warn};

use crate::arch::aarch64::defs::*;
use crate::arch::aarch64::mm::pgtable::geometry;
use crate::arch::aarch64::mm::pte::{leaf_prot, pte_to_phys, pte_valid, PAGE_HYP};
use crate::arch::aarch64::mm::{Prot, Pte};
use crate::arch::traits::HypMemoryOps;
use crate::error::{Error, Result};
use crate::mm::allocator::HypPool;
use crate::mm::memblock::{
    pgtable_max_pages, MemLayout, MemRange, MemblockFlags, MemblockRegion, MoveableRegions,
    RegionRegistry,
};
use crate::platform::*;
use crate::sync::{LockObserver, SpinLock};
use crate::vm::{HypVcpu, HypVm, VmConfig};

pub use component::{
    ComponentId, Components, KVM_MAX_OWNER_ID, PKVM_ID_FFA, PKVM_ID_GUEST, PKVM_ID_HOST,
    PKVM_ID_HYP, PKVM_ID_PROTECTED,
};
pub use fault::{IllegalAbtNotifier, PermFaultHandler};
pub use guest::GuestMmu;
pub use host::{default_host_prot, HostMmu};
pub use hyp::{default_hyp_prot, HypMmu};
pub use state::PageState;
pub use transition::{Completer, Initiator, MemTransition};

use fault::HostFaultHooks;
use guest::guest_page_state;
use transition::{do_donate, do_share, do_unshare};

/// Board description handed to [`MemProtect::new`].
#[derive(Debug, Clone)]
pub struct MemProtectConfig {
    /// RAM extents. Anything else is device memory.
    pub memory: Vec<MemblockRegion>,
    /// Ranges the host pool is sized for. Defaults to all of RAM.
    pub moveable: Option<Vec<MemRange>>,
    pub host_pool_pfn: u64,
    /// Defaults to [`host_s2_pgtable_pages`].
    pub host_pool_pages: Option<usize>,
    pub hyp_pool_pfn: u64,
    pub hyp_pool_pages: usize,
    /// Other RAM the hypervisor keeps for itself (image, stacks, vmemmap).
    pub hyp_carveouts: Vec<MemRange>,
}

impl MemProtectConfig {
    pub fn new(memory: Vec<MemblockRegion>, host_pool_pfn: u64, hyp_pool_pfn: u64, hyp_pool_pages: usize) -> Self {
        Self {
            memory,
            moveable: None,
            host_pool_pfn,
            host_pool_pages: None,
            hyp_pool_pfn,
            hyp_pool_pages,
            hyp_carveouts: Vec::new(),
        }
    }
}

/// Host stage-2 pool size: page-granular tables for every moveable
/// region, the root, and a few spare pages for lazily mapped MMIO.
pub fn host_s2_pgtable_pages(moveable: &MoveableRegions) -> usize {
    let tables: usize = moveable
        .iter()
        .map(|reg| pgtable_max_pages((reg.size() >> PAGE_SHIFT) as usize))
        .sum();
    let root = geometry(HOST_IA_BITS).map(|(_, pages)| pages).unwrap_or(1);

    tables + root + HOST_S2_MMIO_SPARE_PAGES
}

pub struct MemProtect {
    pub(crate) layout: MemLayout,
    pub(crate) ops: Arc<dyn HypMemoryOps>,
    pub(crate) host: SpinLock<HostMmu>,
    pub(crate) hyp: SpinLock<HypMmu>,
    pub(crate) observer: Option<Arc<dyn LockObserver>>,
    pub(crate) fault_hooks: HostFaultHooks,
    vms: SpinLock<BTreeMap<u32, Arc<HypVm>>>,
}

fn poison_page(ops: &dyn HypMemoryOps, phys: u64) {
    ops.zero_page(phys);
    ops.flush_dcache_to_poc(phys, PAGE_SIZE);
}

/// Start and size of `nr_pages` pages at `pfn`. `Inval` for an empty
/// range or one that does not fit the physical address space.
fn pfn_range(pfn: u64, nr_pages: u64) -> Result<(u64, u64)> {
    if nr_pages == 0 || pfn > u64::MAX >> PAGE_SHIFT {
        return Err(Error::Inval);
    }
    let addr = pfn_to_phys(pfn);
    let size = nr_pages.checked_mul(PAGE_SIZE).ok_or(Error::Inval)?;
    addr.checked_add(size).ok_or(Error::Inval)?;
    Ok((addr, size))
}

impl MemProtect {
    /// Build the host and hyp tables for the given memory layout.
    ///
    /// The host gets an identity map of all RAM. The two pool carve-outs
    /// and any extra carve-outs are handed to the hyp.
    pub fn new(config: MemProtectConfig, ops: Arc<dyn HypMemoryOps>) -> Result<Self> {
        let regions = RegionRegistry::new(config.memory)?;
        let moveable = match config.moveable {
            Some(regs) => MoveableRegions::new(regs)?,
            None => MoveableRegions::from_memory(&regions),
        };
        let layout = MemLayout { regions, moveable };

        let host_pool_pages = config
            .host_pool_pages
            .unwrap_or_else(|| host_s2_pgtable_pages(&layout.moveable));

        let mut carveouts = Vec::with_capacity(config.hyp_carveouts.len() + 2);
        carveouts.push(MemRange::new(
            pfn_to_phys(config.host_pool_pfn),
            pfn_to_phys(config.host_pool_pfn + host_pool_pages as u64),
        ));
        carveouts.push(MemRange::new(
            pfn_to_phys(config.hyp_pool_pfn),
            pfn_to_phys(config.hyp_pool_pfn + config.hyp_pool_pages as u64),
        ));
        carveouts.extend(config.hyp_carveouts.iter().copied());

        for reg in &carveouts {
            if reg.end <= reg.start
                || !page_aligned(reg.start)
                || !page_aligned(reg.end)
                || !layout.regions.range_is_memory(reg.start, reg.end)
            {
                warn!("hyp carve-out [{:#x}, {:#x}) is not RAM", reg.start, reg.end);
                return Err(Error::Inval);
            }
        }

        let host_pool = HypPool::new(config.host_pool_pfn, host_pool_pages)?;
        let hyp_pool = HypPool::new(config.hyp_pool_pfn, config.hyp_pool_pages)?;
        info!(
            "mem_protect: {} RAM pages, host pool {} pages, hyp pool {} pages",
            layout.regions.nr_memory_pages(),
            host_pool_pages,
            config.hyp_pool_pages
        );

        let mut host = HostMmu::new(&layout, host_pool, HOST_IA_BITS)?;
        let mut hyp = HypMmu::new(hyp_pool, HYP_IA_BITS)?;

        for reg in layout.regions.regions() {
            if reg.flags.contains(MemblockFlags::NOMAP) {
                continue;
            }
            host.idmap_locked(&layout, reg.base, reg.size, default_host_prot(true))?;
        }
        info!("mem_protect: host stage-2 prepopulated");

        for reg in &carveouts {
            host.set_owner_locked(&layout, reg.start, reg.size(), PKVM_ID_HYP)?;
            hyp.create_mappings_locked(hyp_va(reg.start), reg.size(), PageState::OWNED.mkstate(PAGE_HYP))?;
            debug!("hyp carve-out [{:#x}, {:#x})", reg.start, reg.end);
        }

        Ok(Self {
            layout,
            ops,
            host: SpinLock::new(host),
            hyp: SpinLock::new(hyp),
            observer: None,
            fault_hooks: HostFaultHooks::new(),
            vms: SpinLock::new(BTreeMap::new()),
        })
    }

    /// Report every component lock acquire and release to `observer`.
    pub fn with_lock_observer(mut self, observer: Arc<dyn LockObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn layout(&self) -> &MemLayout {
        &self.layout
    }

    // ── Host ⇄ hyp ───────────────────────────────────────────────────

    pub fn host_share_hyp(&self, pfn: u64) -> Result<()> {
        let host_addr = pfn_to_phys(pfn);
        let mut cx = self.lock_host_hyp();
        let mut tx = MemTransition {
            nr_pages: 1,
            initiator: Initiator::Host {
                addr: host_addr,
                completer_addr: hyp_va(host_addr),
            },
            completer: Completer::Hyp,
            completer_prot: PAGE_HYP,
        };
        do_share(&mut cx, &mut tx)?;
        debug!("host shared {:#x} with hyp", host_addr);
        Ok(())
    }

    pub fn host_unshare_hyp(&self, pfn: u64) -> Result<()> {
        let host_addr = pfn_to_phys(pfn);
        let mut cx = self.lock_host_hyp();
        let mut tx = MemTransition {
            nr_pages: 1,
            initiator: Initiator::Host {
                addr: host_addr,
                completer_addr: hyp_va(host_addr),
            },
            completer: Completer::Hyp,
            completer_prot: PAGE_HYP,
        };
        do_unshare(&mut cx, &mut tx)?;
        debug!("host unshared {:#x} from hyp", host_addr);
        Ok(())
    }

    pub fn host_donate_hyp(&self, pfn: u64, nr_pages: u64) -> Result<()> {
        let prot = default_hyp_prot(&self.layout.regions, pfn_to_phys(pfn));
        self.host_donate_hyp_prot(pfn, nr_pages, false, prot)
    }

    /// Donate host pages to the hyp, which maps them with `prot`.
    ///
    /// # Errors
    /// * `Perm` - the range is not all RAM and `accept_mmio` is false
    pub fn host_donate_hyp_prot(&self, pfn: u64, nr_pages: u64, accept_mmio: bool, prot: Prot) -> Result<()> {
        let (host_addr, size) = pfn_range(pfn, nr_pages)?;
        if !accept_mmio && !self.layout.regions.range_is_memory(host_addr, host_addr + size) {
            return Err(Error::Perm);
        }

        let mut cx = self.lock_host_hyp();
        let mut tx = MemTransition {
            nr_pages,
            initiator: Initiator::Host {
                addr: host_addr,
                completer_addr: hyp_va(host_addr),
            },
            completer: Completer::Hyp,
            completer_prot: prot,
        };
        do_donate(&mut cx, &mut tx)?;
        debug!("host donated {} pages at {:#x} to hyp", nr_pages, host_addr);
        Ok(())
    }

    pub fn hyp_donate_host(&self, pfn: u64, nr_pages: u64) -> Result<()> {
        let (host_addr, _) = pfn_range(pfn, nr_pages)?;
        let mut cx = self.lock_host_hyp();
        let mut tx = MemTransition {
            nr_pages,
            initiator: Initiator::Hyp {
                addr: hyp_va(host_addr),
                completer_addr: host_addr,
            },
            completer: Completer::Host,
            completer_prot: default_host_prot(self.layout.regions.addr_is_memory(host_addr)),
        };
        do_donate(&mut cx, &mut tx)?;
        debug!("hyp donated {} pages at {:#x} to host", nr_pages, host_addr);
        Ok(())
    }

    /// Take a hyp reference on every page of `[from, to)` (hyp VAs).
    /// The pages must be shared by the host with the hyp.
    pub fn hyp_pin_shared_mem(&self, from: u64, to: u64) -> Result<()> {
        let start = align_down(from, PAGE_SIZE);
        let end = page_align_up(to);
        if end <= start {
            return Err(Error::Inval);
        }
        let size = end - start;

        let mut cx = self.lock_host_hyp();
        let layout = cx.layout();
        cx.host()
            .check_page_state_range(layout, hyp_pa(start), size, PageState::SHARED_OWNED)?;
        cx.hyp()
            .check_page_state_range(start, size, PageState::SHARED_BORROWED)?;

        let host = cx.host();
        for cur in (start..end).step_by(PAGE_SIZE as usize) {
            host.vmemmap.page_ref_inc(hyp_pa(cur));
        }
        Ok(())
    }

    pub fn hyp_unpin_shared_mem(&self, from: u64, to: u64) -> Result<()> {
        let start = align_down(from, PAGE_SIZE);
        let end = page_align_up(to);
        if end <= start {
            return Err(Error::Inval);
        }

        let mut cx = self.lock_host_hyp();
        let host = cx.host();
        for cur in (start..end).step_by(PAGE_SIZE as usize) {
            host.vmemmap.page_ref_dec(hyp_pa(cur));
        }
        Ok(())
    }

    // ── Host ⇄ secure world ──────────────────────────────────────────

    /// Record that the host lent RAM to the secure world over FF-A. Only
    /// the host side is tracked here.
    pub fn host_share_ffa(&self, pfn: u64, nr_pages: u64) -> Result<()> {
        let mut tx = self.host_ffa_transition(pfn, nr_pages)?;
        let mut cx = self.lock_host();
        do_share(&mut cx, &mut tx)
    }

    pub fn host_unshare_ffa(&self, pfn: u64, nr_pages: u64) -> Result<()> {
        let mut tx = self.host_ffa_transition(pfn, nr_pages)?;
        let mut cx = self.lock_host();
        do_unshare(&mut cx, &mut tx)
    }

    fn host_ffa_transition(&self, pfn: u64, nr_pages: u64) -> Result<MemTransition<'static>> {
        let (addr, size) = pfn_range(pfn, nr_pages)?;
        if !self.layout.regions.range_is_memory(addr, addr + size) {
            return Err(Error::Inval);
        }
        Ok(MemTransition {
            nr_pages,
            initiator: Initiator::Host {
                addr,
                completer_addr: addr,
            },
            completer: Completer::SecureAgent,
            completer_prot: Prot::RWX,
        })
    }

    // ── Host ⇄ guest ─────────────────────────────────────────────────

    pub fn host_share_guest(&self, pfn: u64, gfn: u64, vcpu: &HypVcpu, prot: Prot) -> Result<()> {
        let host_addr = pfn_to_phys(pfn);
        let vm = &**vcpu.vm();
        let mut cx = self.lock_host_guest(vm);
        let mut tx = MemTransition {
            nr_pages: 1,
            initiator: Initiator::Host {
                addr: host_addr,
                completer_addr: pfn_to_phys(gfn),
            },
            completer: Completer::Guest { vm, phys: host_addr },
            completer_prot: prot,
        };
        do_share(&mut cx, &mut tx)
    }

    pub fn host_donate_guest(&self, pfn: u64, gfn: u64, vcpu: &HypVcpu) -> Result<()> {
        let host_addr = pfn_to_phys(pfn);
        let vm = &**vcpu.vm();
        let mut cx = self.lock_host_guest(vm);
        let mut tx = MemTransition {
            nr_pages: 1,
            initiator: Initiator::Host {
                addr: host_addr,
                completer_addr: pfn_to_phys(gfn),
            },
            completer: Completer::Guest { vm, phys: host_addr },
            completer_prot: Prot::RWX,
        };
        do_donate(&mut cx, &mut tx)
    }

    pub fn guest_share_host(&self, vcpu: &HypVcpu, ipa: u64) -> Result<()> {
        let ipa = align_down(ipa, PAGE_SIZE);
        let vm = &**vcpu.vm();
        let mut cx = self.lock_host_guest(vm);
        let mut tx = MemTransition {
            nr_pages: 1,
            initiator: Initiator::Guest {
                vm,
                addr: ipa,
                completer_addr: 0,
            },
            completer: Completer::Host,
            completer_prot: Prot::RWX,
        };
        do_share(&mut cx, &mut tx)
    }

    pub fn guest_unshare_host(&self, vcpu: &HypVcpu, ipa: u64) -> Result<()> {
        let ipa = align_down(ipa, PAGE_SIZE);
        let vm = &**vcpu.vm();
        let mut cx = self.lock_host_guest(vm);
        let mut tx = MemTransition {
            nr_pages: 1,
            initiator: Initiator::Guest {
                vm,
                addr: ipa,
                completer_addr: 0,
            },
            completer: Completer::Host,
            completer_prot: Prot::RWX,
        };
        do_unshare(&mut cx, &mut tx)
    }

    /// A page the host shared with `vm`, and that the host may still edit
    /// the guest mapping of. Returns its physical address.
    fn check_host_unshare_guest(cx: &mut Components<'_>, vm: &HypVm, ipa: u64) -> Result<u64> {
        let (raw, level) = cx.guest(vm).get_leaf(ipa)?;
        if level != LAST_LEVEL {
            return Err(Error::TooBig);
        }
        if !pte_valid(raw) {
            return Err(Error::NoEnt);
        }

        let state = guest_page_state(raw).without_restriction();
        if state != PageState::SHARED_BORROWED {
            return Err(Error::Perm);
        }

        let phys = pte_to_phys(raw);
        let layout = cx.layout();
        cx.host()
            .check_page_state_range(layout, phys, PAGE_SIZE, PageState::SHARED_OWNED)?;
        Ok(phys)
    }

    pub fn host_unshare_guest(&self, gfn: u64, vm: &HypVm) -> Result<()> {
        let ipa = pfn_to_phys(gfn);
        let mut cx = self.lock_host_guest(vm);
        let phys = Self::check_host_unshare_guest(&mut cx, vm, ipa)?;

        cx.guest(vm).unmap(ipa, PAGE_SIZE)?;
        let layout = cx.layout();
        if let Err(err) = cx.host().set_page_state_range(layout, phys, PAGE_SIZE, PageState::OWNED) {
            warn!("host state of {:#x} not restored: {}", phys, err);
        }
        Ok(())
    }

    /// Widen the guest's permissions on a page the host shares with it.
    pub fn host_relax_guest_perms(&self, gfn: u64, prot: Prot, vcpu: &HypVcpu) -> Result<()> {
        if !Prot::RWX.contains(prot) {
            return Err(Error::Perm);
        }
        let ipa = pfn_to_phys(gfn);
        let vm = &**vcpu.vm();
        let mut cx = self.lock_host_guest(vm);
        Self::check_host_unshare_guest(&mut cx, vm, ipa)?;
        cx.guest(vm).relax_perms(ipa, prot)
    }

    pub fn host_wrprotect_guest(&self, gfn: u64, vm: &HypVm) -> Result<()> {
        let ipa = pfn_to_phys(gfn);
        let mut cx = self.lock_host_guest(vm);
        Self::check_host_unshare_guest(&mut cx, vm, ipa)?;
        cx.guest(vm).wrprotect(ipa, PAGE_SIZE)
    }

    /// The guest gives back the page at `ipa`. Returns its physical
    /// address, or 0 if nothing was mapped there.
    ///
    /// Protected guests own their memory outright and the page is wiped
    /// before the host sees it again. Other guests only borrow from the
    /// host.
    pub fn guest_relinquish_to_host(&self, vcpu: &HypVcpu, ipa: u64) -> Result<u64> {
        let vm = &**vcpu.vm();
        let ipa = align_down(ipa, PAGE_SIZE);
        let expected = if vm.is_protected() {
            PageState::OWNED
        } else {
            PageState::SHARED_BORROWED
        };

        let mut cx = self.lock_host_guest(vm);
        let ops = cx.ops();

        let mut pa = 0;
        cx.guest(vm).for_each_valid_leaf(ipa, PAGE_SIZE, &mut |_, raw| {
            let state = PageState::from_prot(leaf_prot(raw));
            if state != expected {
                return Err(Error::Perm);
            }
            let phys = pte_to_phys(raw);
            if state == PageState::OWNED {
                poison_page(ops, phys);
                ops.psci_mem_protect_dec(1);
            }
            pa = phys;
            Ok(())
        })?;

        if pa != 0 {
            let layout = cx.layout();
            if let Err(err) = cx.host().set_owner_locked(layout, pa, PAGE_SIZE, PKVM_ID_HOST) {
                warn!("relinquished page {:#x} not returned to host: {}", pa, err);
            }
            if let Err(err) = cx.guest(vm).unmap(ipa, PAGE_SIZE) {
                warn!("guest {} mapping at {:#x} not removed: {}", vm.handle(), ipa, err);
            }
            debug!("guest {} relinquished {:#x} ({:#x})", vm.handle(), ipa, pa);
        }
        Ok(pa)
    }

    /// Take back the page at `ipa` of `vm`, whatever the guest thinks of
    /// it. Guest-owned pages are wiped first.
    pub fn host_reclaim_page(&self, vm: &HypVm, pfn: u64, ipa: u64) -> Result<()> {
        let phys = pfn_to_phys(pfn);
        let ipa = align_down(ipa, PAGE_SIZE);
        let mut cx = self.lock_host_guest(vm);

        let (raw, _) = cx.guest(vm).get_leaf(ipa)?;
        if !pte_valid(raw) {
            return Err(Error::Inval);
        }
        if pte_to_phys(raw) != phys {
            return Err(Error::Perm);
        }

        // Nothing has changed yet, so a failed unmap leaves the page with
        // the guest.
        if let Err(err) = cx.guest(vm).unmap(ipa, PAGE_SIZE) {
            warn!("guest {} mapping at {:#x} not removed: {}", vm.handle(), ipa, err);
            return Err(err);
        }

        let layout = cx.layout();
        let ops = cx.ops();
        let state = guest_page_state(raw).without_restriction();
        let host_expected = if state == PageState::OWNED {
            PageState::NOPAGE
        } else if state == PageState::SHARED_BORROWED {
            PageState::SHARED_OWNED
        } else if state == PageState::SHARED_OWNED {
            PageState::SHARED_BORROWED
        } else {
            log::error!("guest {} page {:#x} in undefined state {:?}", vm.handle(), ipa, state);
            panic!("reclaim of page in state {:?}", state);
        };

        if cx
            .host()
            .check_page_state_range(layout, phys, PAGE_SIZE, host_expected)
            .is_err()
        {
            warn!("host state of reclaimed page {:#x} is not {:?}", phys, host_expected);
        }
        if state == PageState::OWNED {
            poison_page(ops, phys);
            ops.psci_mem_protect_dec(1);
        }

        if let Err(err) = cx.host().set_owner_locked(layout, phys, PAGE_SIZE, PKVM_ID_HOST) {
            warn!("reclaimed page {:#x} not returned to host: {}", phys, err);
        }
        Ok(())
    }

    // ── Guest lifecycle ──────────────────────────────────────────────

    /// Register a guest. Its table pool is donated by the host first.
    pub fn create_vm(&self, config: VmConfig) -> Result<Arc<HypVm>> {
        if config.pool_pages == 0 {
            return Err(Error::Inval);
        }
        if self.vms.lock().contains_key(&config.handle) {
            return Err(Error::Busy);
        }

        let nr_pages = config.pool_pages as u64;
        self.host_donate_hyp(config.pool_pfn, nr_pages)?;

        let mmu = HypPool::new(config.pool_pfn, config.pool_pages)
            .and_then(|pool| GuestMmu::new(pool, config.ia_bits));
        let mmu = match mmu {
            Ok(mmu) => mmu,
            Err(err) => {
                self.hyp_donate_host(config.pool_pfn, nr_pages)?;
                return Err(err);
            }
        };

        let vm = Arc::new(HypVm::new(config, mmu));
        let mut vms = self.vms.lock();
        if vms.contains_key(&config.handle) {
            drop(vms);
            self.hyp_donate_host(config.pool_pfn, nr_pages)?;
            return Err(Error::Busy);
        }
        vms.insert(config.handle, vm.clone());
        info!(
            "vm {}: created ({}protected, {} pool pages)",
            config.handle,
            if config.protected { "" } else { "un" },
            config.pool_pages
        );
        Ok(vm)
    }

    pub fn vm_by_handle(&self, handle: u32) -> Option<Arc<HypVm>> {
        self.vms.lock().get(&handle).cloned()
    }

    /// Return every page of a guest to the host: its memory first, then
    /// the table pages, then the pool itself.
    pub fn teardown_vm(&self, handle: u32) -> Result<()> {
        let vm = self.vms.lock().remove(&handle).ok_or(Error::NoEnt)?;

        let mut leaves = Vec::new();
        {
            let mut cx = self.lock_guest(&vm);
            let mmu = cx.guest(&vm);
            let limit = mmu.ia_limit();
            mmu.for_each_valid_leaf(0, limit, &mut |ipa, raw| {
                leaves.push((ipa, pte_to_phys(raw)));
                Ok(())
            })?;
        }
        for (ipa, phys) in leaves {
            self.host_reclaim_page(&vm, phys_to_pfn(phys), ipa)?;
        }

        let mut pool_pages = Vec::new();
        {
            let mut cx = self.lock_guest(&vm);
            let mmu = cx.guest(&vm);
            mmu.destroy();
            while let Some(page) = mmu.pool.alloc_page() {
                pool_pages.push(page);
            }
        }
        for page in &pool_pages {
            self.hyp_donate_host(phys_to_pfn(*page), 1)?;
        }

        info!("vm {}: torn down, {} pool pages returned", handle, pool_pages.len());
        Ok(())
    }

    // ── Inspection ───────────────────────────────────────────────────

    /// Host stage-2 entry covering `phys`, and its level.
    pub fn host_stage2_get_leaf(&self, phys: u64) -> Result<(Pte, u32)> {
        let mut cx = self.lock_host();
        let (raw, level) = cx.host().get_leaf(phys)?;
        Ok((Pte::decode(raw, level), level))
    }

    pub fn host_page_state(&self, phys: u64) -> Result<PageState> {
        let mut cx = self.lock_host();
        let layout = cx.layout();
        cx.host().page_state(layout, phys)
    }

    pub fn hyp_page_state(&self, phys: u64) -> Result<PageState> {
        let mut cx = self.lock_components(false, true, None);
        cx.hyp().page_state(hyp_va(phys))
    }

    pub fn guest_page_state(&self, vm: &HypVm, ipa: u64) -> Result<PageState> {
        let mut cx = self.lock_guest(vm);
        cx.guest(vm).page_state(ipa)
    }

    /// Hyp references held on a RAM page.
    pub fn hyp_page_count(&self, phys: u64) -> u16 {
        let mut cx = self.lock_host();
        cx.host().vmemmap.page_count(phys)
    }

    pub fn host_pool_free_pages(&self) -> usize {
        let mut cx = self.lock_host();
        cx.host().pool.free_pages()
    }

    pub fn hyp_pool_free_pages(&self) -> usize {
        let mut cx = self.lock_components(false, true, None);
        cx.hyp().pool.free_pages()
    }
}
