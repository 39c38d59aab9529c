//! ARM64 Architecture Constants
//!
//! Named constants for the syndrome, PSTATE and translation-table fields
//! the memory-protection engine reads or writes.

// ── ESR_ELx (Exception Syndrome Register) ────────────────────────────
pub const ESR_EC_SHIFT: u32 = 26;
pub const ESR_EC_MASK: u64 = 0x3F;
pub const ESR_EC_FIELD: u64 = ESR_EC_MASK << ESR_EC_SHIFT;
pub const ESR_ISS_MASK: u64 = 0x1FFFFFF;
/// Instruction syndrome valid (data aborts)
pub const ESR_ISV: u64 = 1 << 24;
pub const ESR_SAS_SHIFT: u32 = 22;
pub const ESR_SAS_MASK: u64 = 0x3;
/// Fault on the stage-1 walk. Reused as a marker on injected aborts.
pub const ESR_S1PTW: u64 = 1 << 7;
pub const ESR_FSC_TYPE: u64 = 0x3C;
pub const ESR_FSC_TRANS: u64 = 0x04;
pub const ESR_FSC_ACCESS: u64 = 0x08;
pub const ESR_FSC_PERM: u64 = 0x0C;

// ── Exception Class (EC) values ──────────────────────────────────────
pub const EC_HVC64: u64 = 0x16;
pub const EC_IABT_LOWER: u64 = 0x20;
pub const EC_IABT_SAME: u64 = 0x21;
pub const EC_DABT_LOWER: u64 = 0x24;
pub const EC_DABT_SAME: u64 = 0x25;

// ── HPFAR / FAR ──────────────────────────────────────────────────────
pub const HPFAR_MASK: u64 = !0xF;
pub const FAR_MASK: u64 = 0xFFF;

// ── PSTATE / SPSR ────────────────────────────────────────────────────
pub const PSR_MODE_MASK: u64 = 0xF;
pub const PSR_MODE32_BIT: u64 = 1 << 4;
pub const PSR_MODE_EL0T: u64 = 0b0000;
pub const PSR_MODE_EL1T: u64 = 0b0100;
pub const PSR_MODE_EL1H: u64 = 0b0101;
/// Set in the handler (SP_ELx) variant of each mode.
pub const PSR_MODE_THREAD_BIT: u64 = 1 << 0;
pub const PSR_F_BIT: u64 = 1 << 6;
pub const PSR_I_BIT: u64 = 1 << 7;
pub const PSR_A_BIT: u64 = 1 << 8;
pub const PSR_D_BIT: u64 = 1 << 9;
pub const PSR_DAIF_MASK: u64 = PSR_D_BIT | PSR_A_BIT | PSR_I_BIT | PSR_F_BIT;
pub const PSR_BTYPE_MASK: u64 = 0b11 << 10;
pub const PSR_SSBS_BIT: u64 = 1 << 12;
pub const PSR_PAN_BIT: u64 = 1 << 22;
pub const PSR_UAO_BIT: u64 = 1 << 23;
pub const PSR_DIT_BIT: u64 = 1 << 24;
pub const PSR_TCO_BIT: u64 = 1 << 25;
pub const PSR_NZCV_MASK: u64 = 0xF << 28;

// ── SCTLR_EL1 bits ───────────────────────────────────────────────────
pub const SCTLR_EL1_SPAN: u64 = 1 << 23;
pub const SCTLR_EL1_DSSBS: u64 = 1 << 44;

// ── Exception vector offsets (from VBAR_EL1) ─────────────────────────
pub const VECTOR_CURRENT_SP0: u64 = 0x000;
pub const VECTOR_CURRENT_SPX: u64 = 0x200;
pub const VECTOR_LOWER_AARCH64: u64 = 0x400;
pub const VECTOR_LOWER_AARCH32: u64 = 0x600;
pub const EXCEPT_TYPE_SYNC: u64 = 0x000;

// ── Translation granule ──────────────────────────────────────────────
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
pub const PAGE_MASK: u64 = !(PAGE_SIZE - 1);
pub const PTRS_PER_TABLE: usize = 512;
pub const PT_INDEX_MASK: u64 = 0x1FF;
pub const BLOCK_SIZE_2MB: u64 = 2 * 1024 * 1024;
pub const BLOCK_SIZE_1GB: u64 = 1024 * 1024 * 1024;
pub const LAST_LEVEL: u32 = 3;
/// Shallowest level at which a block descriptor is legal (4KB granule).
pub const MIN_BLOCK_LEVEL: u32 = 1;
/// Maximum number of concatenated root tables at stage 2.
pub const MAX_CONCAT_ROOT_PAGES: usize = 16;

// A table page holds exactly one level of 8-byte descriptors.
static_assertions::const_assert_eq!(PTRS_PER_TABLE as u64 * 8, PAGE_SIZE);
static_assertions::const_assert_eq!(PT_INDEX_MASK as usize + 1, PTRS_PER_TABLE);

// ── Page table descriptor bits ───────────────────────────────────────
pub const PTE_VALID: u64 = 1 << 0;
pub const PTE_TABLE: u64 = 1 << 1;
pub const PTE_ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;
pub const PTE_MEMATTR_SHIFT: u32 = 2;
pub const PTE_MEMATTR_MASK: u64 = 0xF << PTE_MEMATTR_SHIFT;
pub const MEMATTR_DEVICE_NGNRE: u64 = 0b0001;
pub const MEMATTR_NORMAL_NC: u64 = 0b0101;
pub const MEMATTR_NORMAL_WB: u64 = 0b1111;
pub const PTE_S2AP_R: u64 = 1 << 6;
pub const PTE_S2AP_W: u64 = 1 << 7;
pub const PTE_SH_INNER: u64 = 0b11 << 8;
pub const PTE_AF: u64 = 1 << 10;
pub const PTE_XN_SHIFT: u32 = 53;
pub const PTE_XN_MASK: u64 = 0b11 << PTE_XN_SHIFT;
/// XN[1:0] encodings at stage 2
pub const XN_NONE: u64 = 0b00;
pub const XN_PXN: u64 = 0b01;
pub const XN_ALL: u64 = 0b10;
pub const XN_UXN: u64 = 0b11;
/// Software bits [56:55] carry the page ownership state
pub const PTE_SW_SHIFT: u32 = 55;
pub const PTE_SW0: u64 = 1 << 55;
pub const PTE_SW1: u64 = 1 << 56;
pub const PTE_SW_MASK: u64 = PTE_SW0 | PTE_SW1;

// ── Invalid descriptor annotations ───────────────────────────────────
pub const INVALID_PTE_OWNER_SHIFT: u32 = 2;
pub const INVALID_PTE_OWNER_MASK: u64 = 0xFF << INVALID_PTE_OWNER_SHIFT;
pub const INVALID_PTE_MMIO_NOTE: u64 = 1 << 10;

// ── SMCCC return values ──────────────────────────────────────────────
pub const SMCCC_RET_SUCCESS: i64 = 0;
pub const SMCCC_RET_NOT_SUPPORTED: i64 = -1;
pub const SMCCC_RET_INVALID_PARAMETER: i64 = -3;

/// Address-bit shift of one entry at `level`.
#[inline]
pub const fn level_shift(level: u32) -> u32 {
    PAGE_SHIFT + 9 * (LAST_LEVEL - level)
}

/// Bytes covered by one entry at `level`.
#[inline]
pub const fn granule_size(level: u32) -> u64 {
    1 << level_shift(level)
}

#[inline]
pub const fn level_supports_block(level: u32) -> bool {
    level >= MIN_BLOCK_LEVEL
}

/// Exception class of a syndrome value.
#[inline]
pub const fn esr_ec(esr: u64) -> u64 {
    (esr >> ESR_EC_SHIFT) & ESR_EC_MASK
}
