//! Block management layer
//!
//! Everything above the request layer: block identifiers, allocation
//! strategies, the per-disk free-space maps, and the block manager that
//! ties them together.

pub mod bid;
pub mod disk_alloc;
pub mod manager;
pub mod strategy;

pub use bid::{Bid, BlockDescriptor, DynBid};
pub use disk_alloc::DiskAllocator;
pub use manager::BlockManager;
pub use strategy::{
    AllocStrategy, FullyRandom, Interleaved, OffsetStrategy, RandomCyclic, SimpleRandom,
    SingleDisk, Striping,
};
