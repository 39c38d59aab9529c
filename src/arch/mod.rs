//! Architecture-specific code
//!
//! The AArch64 definitions are plain data and build on every target so the
//! engine can be tested on the development host. Only the instruction-level
//! helpers are restricted to the bare-metal target.

pub mod aarch64;
pub mod traits;

pub use aarch64::*;
