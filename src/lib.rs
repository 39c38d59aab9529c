#![cfg_attr(not(test), no_std)]

//! Stage-2 memory ownership and protection for a protected-KVM style
//! hypervisor.
//!
//! Every page of physical memory has one owner at a time: the host kernel,
//! the hypervisor itself, or a guest. The [`mem_protect`] engine tracks
//! who owns what, which pages are lent out, and keeps the host, hyp and
//! guest translation tables in step with that bookkeeping.

extern crate alloc;

pub mod arch;
pub mod dtb;
pub mod error;
pub mod ffa;
pub mod global;
pub mod hypercalls;
pub mod mem_protect;
pub mod mm;
pub mod platform;
pub mod sync;
pub mod vm;

pub use error::{Error, Result};
pub use mem_protect::{MemProtect, MemProtectConfig};
