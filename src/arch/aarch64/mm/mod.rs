//! Memory Management for ARM64
//!
//! This module handles:
//! - Stage-2 descriptor encoding
//! - Page table creation and management

pub mod pgtable;
pub mod pte;

pub use pgtable::{PageTable, PteOps};
pub use pte::{Prot, Pte};
