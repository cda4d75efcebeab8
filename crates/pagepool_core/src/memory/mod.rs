//! # Memory Management
//!
//! Fixed-size block pools that grow one page at a time.
//!
//! ## Design Philosophy
//!
//! Every block is fenced by guard bytes:
//! - Overruns are caught when the block comes back
//! - Corruption is reported, never fatal to the pool
//! - Free blocks are recycled LIFO for cache warmth

mod formatter;
mod page;
mod segmented;
mod typed;

pub use formatter::{
    MemoryFormatter, Signature, ALLOCATED_SIGNATURE, PADDING_SIGNATURE, PADDING_WIDTH,
    UNALLOCATED_SIGNATURE,
};
pub use page::DATA_ALIGN;
pub use segmented::{AllocatedBlocks, PoolStats, SegmentedPoolAllocator};
pub use typed::{PoolHandle, TypedPool};
