//! # Memory Formatter
//!
//! Computes the guarded part of a block and stamps/validates its debug bytes.
//!
//! The formatter only ever sees the guarded region of one block:
//!
//! ```text
//! [ leading pad (4) ][ user data (data_size) ][ trailing pad (4) ]
//! ```
//!
//! It knows nothing about block headers; the allocator places the region
//! after its own header and hands it over as a byte slice.

use crate::error::GuardRegion;

/// Width of each padding region, in bytes.
pub const PADDING_WIDTH: usize = 4;

/// Pattern written into both padding regions.
pub const PADDING_SIGNATURE: u32 = 0xFDFD_FDFD;

/// Pattern written into user data while a block is handed out.
pub const ALLOCATED_SIGNATURE: u32 = 0xA110_CA7E;

/// Pattern written into user data while a block sits on the free list.
pub const UNALLOCATED_SIGNATURE: u32 = 0xDEAD_BEEF;

/// What the user-data region of a block currently looks like.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Signature {
    /// Entirely covered by [`ALLOCATED_SIGNATURE`].
    Allocated,
    /// Entirely covered by [`UNALLOCATED_SIGNATURE`].
    Unallocated,
    /// Anything else, normally user data.
    Foreign,
}

/// Stamps and checks debug byte patterns for blocks of one data size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryFormatter {
    data_size: usize,
}

impl MemoryFormatter {
    /// Creates a formatter for blocks carrying `data_size` bytes of user data.
    #[must_use]
    pub const fn new(data_size: usize) -> Self {
        Self { data_size }
    }

    /// Bytes of user data per block.
    #[inline]
    #[must_use]
    pub const fn data_size(&self) -> usize {
        self.data_size
    }

    /// User data plus both padding regions. Headers are not included.
    #[inline]
    #[must_use]
    pub const fn calculate_block_size(&self) -> usize {
        self.data_size + 2 * PADDING_WIDTH
    }

    /// Offset of the user data within the guarded region.
    #[inline]
    #[must_use]
    pub const fn data_offset(&self) -> usize {
        PADDING_WIDTH
    }

    /// Formats a never-used region: padding plus the unallocated signature.
    pub fn stamp_fresh_block(&self, region: &mut [u8]) {
        self.restamp_padding(region);
        self.mark_unallocated(region);
    }

    /// Rewrites both padding regions, leaving user data alone.
    pub fn restamp_padding(&self, region: &mut [u8]) {
        let (leading, _, trailing) = self.split_mut(region);
        fill(leading, PADDING_SIGNATURE);
        fill(trailing, PADDING_SIGNATURE);
    }

    /// Stamps user data with [`ALLOCATED_SIGNATURE`].
    pub fn mark_allocated(&self, region: &mut [u8]) {
        let (_, data, _) = self.split_mut(region);
        fill(data, ALLOCATED_SIGNATURE);
    }

    /// Stamps user data with [`UNALLOCATED_SIGNATURE`].
    pub fn mark_unallocated(&self, region: &mut [u8]) {
        let (_, data, _) = self.split_mut(region);
        fill(data, UNALLOCATED_SIGNATURE);
    }

    /// True if every padding byte still holds the padding signature.
    #[must_use]
    pub fn validate_padding(&self, region: &[u8]) -> bool {
        self.find_padding_fault(region).is_none()
    }

    /// The first padding region that no longer holds the signature.
    #[must_use]
    pub fn find_padding_fault(&self, region: &[u8]) -> Option<GuardRegion> {
        let (leading, _, trailing) = self.split(region);
        if !matches(leading, PADDING_SIGNATURE) {
            Some(GuardRegion::Leading)
        } else if !matches(trailing, PADDING_SIGNATURE) {
            Some(GuardRegion::Trailing)
        } else {
            None
        }
    }

    /// Classifies the user data by signature.
    #[must_use]
    pub fn signature_of(&self, region: &[u8]) -> Signature {
        let (_, data, _) = self.split(region);
        if matches(data, ALLOCATED_SIGNATURE) {
            Signature::Allocated
        } else if matches(data, UNALLOCATED_SIGNATURE) {
            Signature::Unallocated
        } else {
            Signature::Foreign
        }
    }

    fn split<'a>(&self, region: &'a [u8]) -> (&'a [u8], &'a [u8], &'a [u8]) {
        debug_assert_eq!(region.len(), self.calculate_block_size());
        let (leading, rest) = region.split_at(PADDING_WIDTH);
        let (data, trailing) = rest.split_at(self.data_size);
        (leading, data, trailing)
    }

    fn split_mut<'a>(&self, region: &'a mut [u8]) -> (&'a mut [u8], &'a mut [u8], &'a mut [u8]) {
        debug_assert_eq!(region.len(), self.calculate_block_size());
        let (leading, rest) = region.split_at_mut(PADDING_WIDTH);
        let (data, trailing) = rest.split_at_mut(self.data_size);
        (leading, data, trailing)
    }
}

/// Repeats the little-endian bytes of `pattern` across `bytes`.
fn fill(bytes: &mut [u8], pattern: u32) {
    let pattern = pattern.to_le_bytes();
    for (byte, value) in bytes.iter_mut().zip(pattern.iter().cycle()) {
        *byte = *value;
    }
}

fn matches(bytes: &[u8], pattern: u32) -> bool {
    let pattern = pattern.to_le_bytes();
    bytes.iter().zip(pattern.iter().cycle()).all(|(a, b)| a == b)
}
