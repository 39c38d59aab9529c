//! ARM64/AArch64 architecture support
//!
//! - Syndrome, PSTATE and descriptor constants
//! - Host register context and abort injection
//! - Stage-2 descriptor encoding and translation tables
//! - Cache maintenance and firmware calls (bare metal only)

pub mod defs;
pub mod exception;
pub mod mm;
pub mod regs;

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub mod cache;

pub use exception::*;
pub use regs::*;
