//! Shared fixtures for the integration tests
//!
//! Board layout used everywhere:
//!
//! ```text
//! 0x0100_0000 - 0x0500_0000   RAM
//!     0x0480_0000             host stage-2 pool (hyp owned)
//!     0x0490_0000             hyp pool, HYP_POOL_PAGES (hyp owned)
//!     0x04A0_0000, 0x04B0_0000 guest pools
//! 0x0600_0000 - 0x0610_0000   RAM, firmware no-map
//! 0x0900_0000                 device memory
//! ```

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use memprotect::arch::aarch64::defs::*;
use memprotect::arch::aarch64::regs::HostCpuContext;
use memprotect::arch::traits::HypMemoryOps;
use memprotect::mm::memblock::MemblockRegion;
use memprotect::sync::{LockClass, LockObserver};
use memprotect::vm::{HypVcpu, HypVm, VmConfig};
use memprotect::{MemProtect, MemProtectConfig, Result};

pub const RAM_BASE: u64 = 0x0100_0000;
pub const RAM_SIZE: u64 = 0x0400_0000;
pub const NOMAP_BASE: u64 = 0x0600_0000;
pub const NOMAP_SIZE: u64 = 0x0010_0000;
pub const MMIO_BASE: u64 = 0x0900_0000;

pub const HOST_POOL_PFN: u64 = 0x4800;
pub const HYP_POOL_PFN: u64 = 0x4900;
pub const HYP_POOL_PAGES: usize = 128;
pub const GUEST_POOL_PFN: u64 = 0x4A00;
pub const GUEST2_POOL_PFN: u64 = 0x4B00;
pub const GUEST_POOL_PAGES: usize = 32;

/// Free host page `n` (all below the pools).
pub const fn host_pfn(n: u64) -> u64 {
    0x2000 + n
}

pub const fn phys(pfn: u64) -> u64 {
    pfn << PAGE_SHIFT
}

/// Records every side effect the engine asks for.
#[derive(Default)]
pub struct MockOps {
    pub zeroed: Mutex<Vec<u64>>,
    pub flushed: Mutex<Vec<(u64, u64)>>,
    pub protected_pages: AtomicI64,
    pub pvmfw_loads: Mutex<Vec<(u64, u64, u64)>>,
    /// Host stage-1: VA page -> IPA page.
    pub stage1: Mutex<BTreeMap<u64, u64>>,
}

impl MockOps {
    pub fn map_stage1(&self, va: u64, ipa: u64) {
        self.stage1
            .lock()
            .unwrap()
            .insert(va & PAGE_MASK, ipa & PAGE_MASK);
    }

    pub fn protected(&self) -> i64 {
        self.protected_pages.load(Ordering::SeqCst)
    }

    pub fn was_zeroed(&self, phys: u64) -> bool {
        self.zeroed.lock().unwrap().contains(&phys)
    }
}

impl HypMemoryOps for MockOps {
    fn zero_page(&self, phys: u64) {
        self.zeroed.lock().unwrap().push(phys);
    }

    fn flush_dcache_to_poc(&self, phys: u64, size: u64) {
        self.flushed.lock().unwrap().push((phys, size));
    }

    fn psci_mem_protect_inc(&self, nr_pages: u64) {
        self.protected_pages.fetch_add(nr_pages as i64, Ordering::SeqCst);
    }

    fn psci_mem_protect_dec(&self, nr_pages: u64) {
        self.protected_pages.fetch_sub(nr_pages as i64, Ordering::SeqCst);
    }

    fn load_pvmfw_pages(&self, offset: u64, phys: u64, size: u64) -> Result<()> {
        self.pvmfw_loads.lock().unwrap().push((offset, phys, size));
        Ok(())
    }

    fn translate_host_va(&self, va: u64) -> Option<u64> {
        let page = *self.stage1.lock().unwrap().get(&(va & PAGE_MASK))?;
        Some(page | (va & !PAGE_MASK))
    }
}

pub fn memory() -> Vec<MemblockRegion> {
    vec![
        MemblockRegion::new(RAM_BASE, RAM_SIZE),
        MemblockRegion::nomap(NOMAP_BASE, NOMAP_SIZE),
    ]
}

pub fn config() -> MemProtectConfig {
    MemProtectConfig::new(memory(), HOST_POOL_PFN, HYP_POOL_PFN, HYP_POOL_PAGES)
}

pub struct Fixture {
    pub mp: MemProtect,
    pub ops: Arc<MockOps>,
}

pub fn setup() -> Fixture {
    setup_with(config())
}

pub fn setup_with(config: MemProtectConfig) -> Fixture {
    let ops = Arc::new(MockOps::default());
    let mp = MemProtect::new(config, ops.clone()).expect("engine init");
    Fixture { mp, ops }
}

impl Fixture {
    pub fn vm(&self, handle: u32, pool_pfn: u64) -> Arc<HypVm> {
        self.vm_with(VmConfig::new(handle, pool_pfn, GUEST_POOL_PAGES))
    }

    pub fn vm_with(&self, config: VmConfig) -> Arc<HypVm> {
        self.mp.create_vm(config).expect("create vm")
    }

    pub fn vcpu(&self, vm: &Arc<HypVm>) -> HypVcpu {
        HypVcpu::new(vm.clone(), 0)
    }
}

/// Host context for a stage-2 abort on `ipa`, taken from EL1h.
pub fn host_abort(ec: u64, fsc: u64, far: u64, ipa: u64) -> HostCpuContext {
    let mut ctx = HostCpuContext::default();
    ctx.esr_el2 = (ec << ESR_EC_SHIFT) | fsc;
    ctx.far_el2 = far;
    ctx.hpfar_el2 = (ipa >> 8) & HPFAR_MASK;
    ctx.elr_el2 = 0xffff_8000_1000_0000;
    ctx.spsr_el2 = PSR_MODE_EL1H;
    ctx.vbar_el1 = 0xffff_8000_0800_0000;
    ctx
}

/// Remembers the order of component lock events.
#[derive(Default)]
pub struct RecordingObserver {
    pub events: Mutex<Vec<(LockClass, bool)>>,
}

impl RecordingObserver {
    pub fn take(&self) -> Vec<(LockClass, bool)> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

impl LockObserver for RecordingObserver {
    fn acquired(&self, class: LockClass) {
        self.events.lock().unwrap().push((class, true));
    }

    fn released(&self, class: LockClass) {
        self.events.lock().unwrap().push((class, false));
    }
}

// ── Flattened device tree builder ────────────────────────────────────

const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE: u32 = 2;
const FDT_PROP: u32 = 3;
const FDT_END: u32 = 9;

/// Just enough of DTSpec v0.3 to describe memory nodes.
#[derive(Default)]
pub struct FdtBuilder {
    structs: Vec<u8>,
    strings: Vec<u8>,
}

impl FdtBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn token(&mut self, token: u32) {
        self.structs.extend_from_slice(&token.to_be_bytes());
    }

    fn pad(&mut self) {
        while self.structs.len() % 4 != 0 {
            self.structs.push(0);
        }
    }

    fn string_offset(&mut self, name: &str) -> u32 {
        let needle: Vec<u8> = name.bytes().chain(std::iter::once(0)).collect();
        if let Some(pos) = self
            .strings
            .windows(needle.len())
            .position(|w| w == needle.as_slice())
        {
            return pos as u32;
        }
        let off = self.strings.len() as u32;
        self.strings.extend_from_slice(&needle);
        off
    }

    pub fn begin_node(&mut self, name: &str) -> &mut Self {
        self.token(FDT_BEGIN_NODE);
        self.structs.extend_from_slice(name.as_bytes());
        self.structs.push(0);
        self.pad();
        self
    }

    pub fn end_node(&mut self) -> &mut Self {
        self.token(FDT_END_NODE);
        self
    }

    pub fn prop(&mut self, name: &str, value: &[u8]) -> &mut Self {
        let nameoff = self.string_offset(name);
        self.token(FDT_PROP);
        self.structs.extend_from_slice(&(value.len() as u32).to_be_bytes());
        self.structs.extend_from_slice(&nameoff.to_be_bytes());
        self.structs.extend_from_slice(value);
        self.pad();
        self
    }

    pub fn prop_u32(&mut self, name: &str, value: u32) -> &mut Self {
        self.prop(name, &value.to_be_bytes())
    }

    pub fn prop_str(&mut self, name: &str, value: &str) -> &mut Self {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.prop(name, &bytes)
    }

    /// `reg` with two address and two size cells per entry.
    pub fn prop_reg(&mut self, regs: &[(u64, u64)]) -> &mut Self {
        let mut bytes = Vec::new();
        for (base, size) in regs {
            bytes.extend_from_slice(&base.to_be_bytes());
            bytes.extend_from_slice(&size.to_be_bytes());
        }
        self.prop("reg", &bytes)
    }

    pub fn finish(&mut self) -> Vec<u8> {
        self.token(FDT_END);

        let header_size = 40u32;
        let rsvmap_off = header_size;
        let rsvmap_size = 16u32;
        let struct_off = rsvmap_off + rsvmap_size;
        let strings_off = struct_off + self.structs.len() as u32;
        let total = strings_off + self.strings.len() as u32;

        let mut blob = Vec::with_capacity(total as usize);
        for field in [
            0xD00D_FEEDu32,
            total,
            struct_off,
            strings_off,
            rsvmap_off,
            17,
            16,
            0,
            self.strings.len() as u32,
            self.structs.len() as u32,
        ] {
            blob.extend_from_slice(&field.to_be_bytes());
        }
        blob.extend_from_slice(&[0u8; 16]);
        blob.extend_from_slice(&self.structs);
        blob.extend_from_slice(&self.strings);
        blob
    }
}

/// The fixture board as a device tree, with an extra no-map carve-out
/// inside the main RAM bank.
pub fn board_dtb(nomap: Option<(u64, u64)>) -> Vec<u8> {
    let mut fdt = FdtBuilder::new();
    fdt.begin_node("")
        .prop_u32("#address-cells", 2)
        .prop_u32("#size-cells", 2)
        .prop_str("compatible", "linux,dummy-virt");

    fdt.begin_node("memory@1000000")
        .prop_str("device_type", "memory")
        .prop_reg(&[(RAM_BASE, RAM_SIZE)])
        .end_node();

    fdt.begin_node("reserved-memory")
        .prop_u32("#address-cells", 2)
        .prop_u32("#size-cells", 2)
        .prop("ranges", &[]);
    if let Some((base, size)) = nomap {
        fdt.begin_node("firmware")
            .prop_reg(&[(base, size)])
            .prop("no-map", &[])
            .end_node();
    }
    fdt.begin_node("shared-dma")
        .prop_reg(&[(0x0300_0000, 0x10_0000)])
        .prop_str("compatible", "shared-dma-pool")
        .end_node();
    fdt.end_node();

    fdt.begin_node("pl011@9000000")
        .prop_str("compatible", "arm,pl011")
        .prop_reg(&[(MMIO_BASE, 0x1000)])
        .end_node();

    fdt.end_node();
    fdt.finish()
}
