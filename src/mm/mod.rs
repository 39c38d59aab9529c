//! Memory management subsystem

pub mod allocator;
pub mod memblock;
pub mod vmemmap;

pub use allocator::HypPool;
pub use memblock::{MemLayout, MemRange, MemblockRegion, RegionRegistry};
pub use vmemmap::Vmemmap;
