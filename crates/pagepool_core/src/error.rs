//! # Pool Error Types
//!
//! All errors that can occur in the pool allocator.

use std::fmt;

use thiserror::Error;

/// Which guarded part of a block failed validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GuardRegion {
    /// Padding bytes immediately before the user data (buffer underflow).
    Leading,
    /// Padding bytes immediately after the user data (buffer overflow).
    Trailing,
    /// The block header's page back-pointer no longer matches its page.
    Header,
}

impl fmt::Display for GuardRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leading => f.write_str("leading padding"),
            Self::Trailing => f.write_str("trailing padding"),
            Self::Header => f.write_str("block header"),
        }
    }
}

/// Errors that can occur in the pool allocator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The heap refused to back a new page.
    #[error("out of memory: failed to allocate a {bytes}-byte page")]
    OutOfMemory {
        /// Size of the page allocation that failed.
        bytes: usize,
    },

    /// Guard bytes around a returned block were overwritten.
    #[error("memory corruption detected in {region} of block at {address:#x}")]
    CorruptionDetected {
        /// User-data address of the corrupted block.
        address: usize,
        /// The part of the block that failed validation.
        region: GuardRegion,
    },

    /// The pointer was never handed out by this allocator.
    #[error("pointer {address:#x} does not belong to this pool")]
    InvalidBlockPointer {
        /// The offending address.
        address: usize,
    },

    /// The block is already on the free list.
    #[error("double free of block at {address:#x}")]
    DoubleFree {
        /// User-data address of the block.
        address: usize,
    },

    /// The allocator was destroyed while blocks were still handed out.
    #[error("pool destroyed with {count} live blocks still outstanding")]
    LiveBlocksOnDestroy {
        /// Number of blocks that were never returned.
        count: usize,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;
