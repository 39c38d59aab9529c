//! Synchronous exception injection into the host
//!
//! When the host touches memory it may not access, EL2 reflects the stage-2
//! abort back to the host's own EL1 vector as if it had been taken there.

use super::defs::*;
use super::regs::HostCpuContext;

/// Offset of the exception vector taken to `target_mode` from `spsr`.
pub fn get_except64_offset(spsr: u64, target_mode: u64, except_type: u64) -> u64 {
    let mode = spsr & (PSR_MODE_MASK | PSR_MODE32_BIT);

    let base = if mode == target_mode {
        VECTOR_CURRENT_SPX
    } else if (mode | PSR_MODE_THREAD_BIT) == target_mode {
        VECTOR_CURRENT_SP0
    } else if mode & PSR_MODE32_BIT == 0 {
        VECTOR_LOWER_AARCH64
    } else {
        VECTOR_LOWER_AARCH32
    };

    base + except_type
}

/// PSTATE on entry to an AArch64 exception handler at `target_mode`.
pub fn get_except64_cpsr(old: u64, has_mte: bool, sctlr: u64, target_mode: u64) -> u64 {
    let mut new = old & (PSR_NZCV_MASK | PSR_DIT_BIT | PSR_PAN_BIT);

    if sctlr & SCTLR_EL1_SPAN == 0 {
        new |= PSR_PAN_BIT;
    }
    if sctlr & SCTLR_EL1_DSSBS != 0 {
        new |= PSR_SSBS_BIT;
    }
    if has_mte {
        new |= PSR_TCO_BIT;
    }

    new | PSR_DAIF_MASK | target_mode
}

/// Reflect the current stage-2 abort to the host's EL1 sync vector.
///
/// The syndrome is repainted as a same-level abort when the host was at
/// EL1, and S1PTW is set so the host can tell these apart from its own
/// faults (the bit is otherwise never set for an EL1 abort).
pub fn inject_host_abort(ctx: &mut HostCpuContext) {
    let spsr = ctx.spsr_el2;
    let mut esr = ctx.esr_el2;

    if spsr & PSR_MODE_MASK != PSR_MODE_EL0T {
        let ec = match esr_ec(esr) {
            EC_DABT_LOWER => EC_DABT_SAME,
            EC_IABT_LOWER => EC_IABT_SAME,
            ec => {
                log::warn!("injecting abort for unexpected EC {:#x}", ec);
                ec
            }
        };
        esr = (esr & !ESR_EC_FIELD) | (ec << ESR_EC_SHIFT);
    }
    esr |= ESR_S1PTW;

    ctx.esr_el1 = esr;
    ctx.spsr_el1 = spsr;
    ctx.elr_el1 = ctx.elr_el2;
    ctx.far_el1 = ctx.far_el2;

    ctx.elr_el2 = ctx.vbar_el1 + get_except64_offset(spsr, PSR_MODE_EL1H, EXCEPT_TYPE_SYNC);
    ctx.spsr_el2 = get_except64_cpsr(spsr, ctx.has_mte, ctx.sctlr_el1, PSR_MODE_EL1H);
}
