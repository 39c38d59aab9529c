//! Trapped host register state
//!
//! Host register state as seen by the EL2 trap handlers: the general
//! purpose registers saved on entry plus the EL2 and EL1 system registers
//! that abort handling reads and rewrites.

use core::fmt;

use super::defs::*;

/// x0-x30 as saved by the EL2 vectors.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GeneralPurposeRegs {
    pub regs: [u64; 31],
}

impl GeneralPurposeRegs {
    /// `xN`, or zero for anything past x30 (SP is not saved here).
    pub fn get_reg(&self, reg: u8) -> u64 {
        self.regs.get(reg as usize).copied().unwrap_or(0)
    }

    /// Writes past x30 are dropped.
    pub fn set_reg(&mut self, reg: u8, value: u64) {
        if let Some(slot) = self.regs.get_mut(reg as usize) {
            *slot = value;
        }
    }
}

/// EL2 view of a trapped host.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct HostCpuContext {
    pub gp_regs: GeneralPurposeRegs,

    /// Exception Syndrome Register (EL2) - Why did we trap?
    pub esr_el2: u64,
    /// Fault Address Register (EL2)
    pub far_el2: u64,
    /// Faulting IPA, bits [47:12] in [43:4]
    pub hpfar_el2: u64,
    pub elr_el2: u64,
    /// Host PSTATE at the time of the trap
    pub spsr_el2: u64,

    pub esr_el1: u64,
    pub far_el1: u64,
    pub elr_el1: u64,
    pub spsr_el1: u64,
    pub vbar_el1: u64,
    pub sctlr_el1: u64,

    /// FEAT_MTE is implemented.
    pub has_mte: bool,
}

impl HostCpuContext {
    pub fn get_gpr(&self, reg: u8) -> u64 {
        self.gp_regs.get_reg(reg)
    }

    pub fn set_gpr(&mut self, reg: u8, value: u64) {
        self.gp_regs.set_reg(reg, value);
    }

    pub fn exit_reason(&self) -> ExitReason {
        match esr_ec(self.esr_el2) {
            EC_HVC64 => ExitReason::HvcCall,
            EC_IABT_LOWER | EC_IABT_SAME => ExitReason::InstructionAbort,
            EC_DABT_LOWER | EC_DABT_SAME => ExitReason::DataAbort,
            ec => ExitReason::Other(ec),
        }
    }
}

/// Why the host trapped to EL2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// HVC64 from EL1
    HvcCall,
    /// Stage-2 instruction abort
    InstructionAbort,
    /// Stage-2 data abort
    DataAbort,
    /// Anything else, by exception class
    Other(u64),
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::HvcCall => f.write_str("hvc"),
            ExitReason::InstructionAbort => f.write_str("stage-2 iabt"),
            ExitReason::DataAbort => f.write_str("stage-2 dabt"),
            ExitReason::Other(ec) => write!(f, "ec {:#x}", ec),
        }
    }
}
