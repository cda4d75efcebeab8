//! # Page Layout
//!
//! Byte-level layout of pages and blocks.
//!
//! ## Page
//!
//! ```text
//! | PageHeader | pad | block 0 | block 1 | ... | block N-1 |
//! ```
//!
//! ## Block
//!
//! ```text
//! | BlockHeader | filler | lead pad (4) | user data | trail pad (4) | filler |
//!                         ^-------- guarded region ---------^
//! ```
//!
//! User data always starts on a [`DATA_ALIGN`] boundary. The filler bytes
//! are never checked.

// SAFETY: This module owns the raw page memory of the segmented pool.
// Every pointer handed out here is derived from a page base pointer and
// stays within that page's allocation.
#![allow(unsafe_code)]

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::mem;
use std::ptr::{self, NonNull};
use std::slice;

use super::formatter::{MemoryFormatter, PADDING_WIDTH};
use crate::error::{PoolError, PoolResult};

/// Alignment of every user-data region handed out by a pool.
pub const DATA_ALIGN: usize = 16;

/// Block is on the free list.
pub(crate) const BLOCK_FREE: u8 = 0;
/// Block is handed out.
pub(crate) const BLOCK_ALLOCATED: u8 = 1;

/// Intrusive page list node at the start of every page.
#[repr(C)]
pub(crate) struct PageHeader {
    /// Next page in the allocator's list.
    pub(crate) next: Option<NonNull<PageHeader>>,
    /// Blocks of this page currently handed out.
    pub(crate) in_use: usize,
}

/// Header in front of every block.
///
/// Plain pointers and a raw state byte: a buffer underflow can scribble over
/// a header, and every bit pattern must stay a valid value.
#[repr(C)]
pub(crate) struct BlockHeader {
    /// Owning page. Written at page construction, never reused for linkage.
    pub(crate) page: *mut PageHeader,
    /// Next free block. Only meaningful while the block is free.
    pub(crate) next_free: *mut BlockHeader,
    /// [`BLOCK_FREE`] or [`BLOCK_ALLOCATED`].
    pub(crate) state: u8,
}

/// A page that was just built, with its blocks chained first to last.
pub(crate) struct FreshPage {
    pub(crate) page: NonNull<PageHeader>,
    pub(crate) first: NonNull<BlockHeader>,
    pub(crate) last: NonNull<BlockHeader>,
}

/// Fixed geometry shared by every page of one allocator.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BlockGeometry {
    formatter: MemoryFormatter,
    blocks_per_page: usize,
    /// Offset of the guarded region from the block start.
    region_offset: usize,
    /// Distance between consecutive blocks.
    stride: usize,
    /// Offset of block 0 from the page start.
    first_block: usize,
    layout: Layout,
}

#[inline]
fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

fn too_large(block_size: usize, blocks_per_page: usize) -> PoolError {
    PoolError::InvalidConfig(format!(
        "page of {blocks_per_page} blocks of {block_size} bytes does not fit in memory"
    ))
}

impl BlockGeometry {
    /// Lays out blocks of `block_size` user bytes, `blocks_per_page` to a page.
    pub(crate) fn new(block_size: usize, blocks_per_page: usize) -> PoolResult<Self> {
        let overflow = || too_large(block_size, blocks_per_page);

        let guarded = block_size.checked_add(2 * PADDING_WIDTH).ok_or_else(overflow)?;
        let formatter = MemoryFormatter::new(block_size);
        debug_assert_eq!(guarded, formatter.calculate_block_size());

        let data_offset =
            align_up(mem::size_of::<BlockHeader>() + PADDING_WIDTH, DATA_ALIGN).ok_or_else(overflow)?;
        let region_offset = data_offset - PADDING_WIDTH;
        let stride = region_offset
            .checked_add(guarded)
            .and_then(|end| align_up(end, DATA_ALIGN))
            .ok_or_else(overflow)?;

        let first_block = align_up(mem::size_of::<PageHeader>(), DATA_ALIGN).ok_or_else(overflow)?;
        let page_bytes = stride
            .checked_mul(blocks_per_page)
            .and_then(|blocks| blocks.checked_add(first_block))
            .ok_or_else(overflow)?;
        let layout = Layout::from_size_align(page_bytes, DATA_ALIGN).map_err(|_| overflow())?;

        Ok(Self {
            formatter,
            blocks_per_page,
            region_offset,
            stride,
            first_block,
            layout,
        })
    }

    #[inline]
    pub(crate) const fn formatter(&self) -> MemoryFormatter {
        self.formatter
    }

    #[inline]
    pub(crate) const fn blocks_per_page(&self) -> usize {
        self.blocks_per_page
    }

    /// Bytes one block occupies in a page, header and filler included.
    #[inline]
    pub(crate) const fn stride(&self) -> usize {
        self.stride
    }

    #[inline]
    pub(crate) const fn data_offset(&self) -> usize {
        self.region_offset + PADDING_WIDTH
    }

    #[inline]
    pub(crate) const fn page_bytes(&self) -> usize {
        self.layout.size()
    }

    /// Allocates a zeroed page, writes every header and stamps every block.
    pub(crate) fn build_page(&self) -> PoolResult<FreshPage> {
        // SAFETY: the layout has a non-zero size (at least one block).
        let raw = unsafe { alloc_zeroed(self.layout) };
        let page = NonNull::new(raw)
            .ok_or(PoolError::OutOfMemory {
                bytes: self.layout.size(),
            })?
            .cast::<PageHeader>();

        // SAFETY: the page is freshly allocated, zeroed, aligned to DATA_ALIGN,
        // and large enough for the header plus `blocks_per_page` strides.
        unsafe {
            page.as_ptr().write(PageHeader {
                next: None,
                in_use: 0,
            });

            // Built back to front so block 0 ends up at the head of the chain.
            let mut next_free: *mut BlockHeader = ptr::null_mut();
            for index in (0..self.blocks_per_page).rev() {
                let block = self.block(page, index);
                block.as_ptr().write(BlockHeader {
                    page: page.as_ptr(),
                    next_free,
                    state: BLOCK_FREE,
                });
                self.formatter.stamp_fresh_block(self.region_mut(block));
                next_free = block.as_ptr();
            }

            Ok(FreshPage {
                page,
                first: self.block(page, 0),
                last: self.block(page, self.blocks_per_page - 1),
            })
        }
    }

    /// Returns a page's memory to the heap.
    ///
    /// # Safety
    ///
    /// `page` must come from [`Self::build_page`] on this geometry and must not
    /// be used afterwards, nor any block pointer into it.
    pub(crate) unsafe fn release_page(&self, page: NonNull<PageHeader>) {
        dealloc(page.as_ptr().cast::<u8>(), self.layout);
    }

    /// Header of block `index` in `page`.
    ///
    /// # Safety
    ///
    /// `page` must be a live page of this geometry and `index < blocks_per_page`.
    #[inline]
    pub(crate) unsafe fn block(&self, page: NonNull<PageHeader>, index: usize) -> NonNull<BlockHeader> {
        debug_assert!(index < self.blocks_per_page);
        let offset = self.first_block + index * self.stride;
        NonNull::new_unchecked(page.as_ptr().cast::<u8>().add(offset).cast::<BlockHeader>())
    }

    /// Slot index of the block whose user data starts at `address`, if any.
    pub(crate) fn slot_of(&self, page: NonNull<PageHeader>, address: usize) -> Option<usize> {
        let first_data = page.as_ptr() as usize + self.first_block + self.data_offset();
        let offset = address.checked_sub(first_data)?;
        if offset % self.stride != 0 {
            return None;
        }
        let index = offset / self.stride;
        (index < self.blocks_per_page).then_some(index)
    }

    /// Start of the block's user data.
    ///
    /// # Safety
    ///
    /// `block` must be a block header of a live page of this geometry.
    #[inline]
    pub(crate) unsafe fn data_ptr(&self, block: NonNull<BlockHeader>) -> NonNull<u8> {
        NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(self.data_offset()))
    }

    /// Guarded region (padding + user data + padding) of a block.
    ///
    /// # Safety
    ///
    /// `block` must be a block header of a live page of this geometry, and no
    /// other reference into the region may be alive for `'a`.
    #[inline]
    pub(crate) unsafe fn region<'a>(&self, block: NonNull<BlockHeader>) -> &'a [u8] {
        slice::from_raw_parts(
            block.as_ptr().cast::<u8>().add(self.region_offset),
            self.formatter.calculate_block_size(),
        )
    }

    /// Mutable guarded region of a block.
    ///
    /// # Safety
    ///
    /// Same as [`Self::region`], and the region must not be aliased at all.
    #[inline]
    pub(crate) unsafe fn region_mut<'a>(&self, block: NonNull<BlockHeader>) -> &'a mut [u8] {
        slice::from_raw_parts_mut(
            block.as_ptr().cast::<u8>().add(self.region_offset),
            self.formatter.calculate_block_size(),
        )
    }
}
