//! # PAGEPOOL Core
//!
//! Segmented pool allocator for fixed-size objects:
//! - Same-size blocks served from linked pages
//! - Growth one page at a time, release only on explicit reclaim
//! - Guard bytes around every block, checked on every return
//!
//! ## Architecture Rules
//!
//! 1. **Single-threaded by contract** - one pool per worker thread
//! 2. **Raw layout is isolated** - all unsafe code lives under `memory`
//! 3. **Corruption is reported, not fatal** - the pool stays usable
//!
//! ## Example
//!
//! ```rust,ignore
//! use pagepool_core::{PoolConfig, SegmentedPoolAllocator};
//!
//! let config = PoolConfig::from_toml("config/particles.toml")?;
//! let mut pool = SegmentedPoolAllocator::with_config(config)?;
//! let block = pool.allocate()?;
//! pool.deallocate(block)?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod error;
pub mod memory;
pub mod report;

pub use config::PoolConfig;
pub use error::{GuardRegion, PoolError, PoolResult};
pub use memory::{
    AllocatedBlocks, MemoryFormatter, PoolHandle, PoolStats, SegmentedPoolAllocator, Signature,
    TypedPool, DATA_ALIGN,
};
pub use report::{ErrorReporter, RecordingReporter, Severity, TracingReporter};
