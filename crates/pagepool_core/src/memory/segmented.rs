//! # Segmented Pool Allocator
//!
//! Fixed-size block allocator that grows one page at a time.
//!
//! ## Layout
//!
//! ```text
//! head ──> [Page 0] ──> [Page 1] ──> ... ──> [Page N] <── tail
//!
//! free ──> block ──> block ──> ... ──> null   (spans every page, LIFO)
//! ```
//!
//! Every block keeps a back-pointer to its page for the in-use counters.
//! The free-list link is a separate field, so the back-pointer is valid for
//! the whole life of the page.

// SAFETY: The allocator walks intrusive page and free lists made of raw
// pointers into pages it exclusively owns. See `page.rs` for the layout.
#![allow(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

use super::formatter::Signature;
use super::page::{BlockGeometry, BlockHeader, PageHeader, BLOCK_ALLOCATED, BLOCK_FREE};
use crate::config::PoolConfig;
use crate::error::{GuardRegion, PoolError, PoolResult};
use crate::report::{ErrorReporter, Severity, TracingReporter};

/// Snapshot of an allocator's bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Bytes of user data per block.
    pub block_size: usize,
    /// Bytes each block occupies in a page.
    pub block_footprint: usize,
    /// Blocks per page.
    pub blocks_per_page: usize,
    /// Pages currently owned.
    pub page_count: usize,
    /// Bytes of one page allocation.
    pub page_bytes: usize,
    /// Blocks handed out.
    pub allocated: usize,
    /// Blocks on the free list.
    pub free: usize,
}

impl PoolStats {
    /// Total blocks across all pages.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.page_count * self.blocks_per_page
    }

    /// Total bytes held from the heap.
    #[inline]
    #[must_use]
    pub const fn reserved_bytes(&self) -> usize {
        self.page_count * self.page_bytes
    }
}

/// A pool of fixed-size blocks carved out of linked pages.
///
/// Blocks are raw storage for one object of the configured size. The pool
/// never runs constructors or destructors; see
/// [`TypedPool`](super::TypedPool) for that.
///
/// # Thread Safety
///
/// This pool is NOT thread-safe. It is `Send`, so one pool per worker thread
/// works; shared use needs an external lock.
///
/// # Example
///
/// ```rust,ignore
/// let mut pool = SegmentedPoolAllocator::new(64, 128)?;
///
/// // Allocate - O(1), grows by one page when the free list runs dry
/// let block = pool.allocate()?;
///
/// // Free - O(log pages) ownership check, O(1) bookkeeping
/// pool.deallocate(block)?;
/// ```
pub struct SegmentedPoolAllocator {
    geometry: BlockGeometry,
    stamp_signatures: bool,
    /// First page in the list.
    head: Option<NonNull<PageHeader>>,
    /// Last page; new pages are appended here.
    tail: Option<NonNull<PageHeader>>,
    page_count: usize,
    /// Pages keyed by base address, for ownership lookups.
    page_index: BTreeMap<usize, NonNull<PageHeader>>,
    /// Most recently freed block.
    free_list: Option<NonNull<BlockHeader>>,
    free_count: usize,
    allocated_count: usize,
    reporter: Box<dyn ErrorReporter + Send>,
}

// SAFETY: The allocator exclusively owns every page it points into and the
// reporter is required to be Send. No pointer is shared with another pool.
unsafe impl Send for SegmentedPoolAllocator {}

impl SegmentedPoolAllocator {
    /// Creates a pool and eagerly builds its first page.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidConfig`] if either size is zero or the page would
    /// not fit in memory; [`PoolError::OutOfMemory`] if the first page cannot
    /// be allocated.
    pub fn new(block_size: usize, blocks_per_page: usize) -> PoolResult<Self> {
        Self::with_config(PoolConfig::new(block_size, blocks_per_page))
    }

    /// Creates a pool from a config, reporting through `tracing`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::new`].
    pub fn with_config(config: PoolConfig) -> PoolResult<Self> {
        Self::with_reporter(config, TracingReporter)
    }

    /// Creates a pool that hands detected conditions to `reporter`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::new`].
    pub fn with_reporter<R>(config: PoolConfig, reporter: R) -> PoolResult<Self>
    where
        R: ErrorReporter + Send + 'static,
    {
        let mut pool = Self::unbuilt(config, reporter)?;
        pool.grow()?;

        tracing::trace!(
            "segmented pool ready: {} byte blocks, {} per page, {} byte footprint",
            pool.block_size(),
            pool.blocks_per_page(),
            pool.block_footprint()
        );
        Ok(pool)
    }

    /// Validated pool with no pages yet.
    fn unbuilt<R>(config: PoolConfig, reporter: R) -> PoolResult<Self>
    where
        R: ErrorReporter + Send + 'static,
    {
        config.validate()?;
        let geometry = BlockGeometry::new(config.block_size, config.blocks_per_page)?;

        Ok(Self {
            geometry,
            stamp_signatures: config.stamp_signatures,
            head: None,
            tail: None,
            page_count: 0,
            page_index: BTreeMap::new(),
            free_list: None,
            free_count: 0,
            allocated_count: 0,
            reporter: Box::new(reporter),
        })
    }

    /// Bytes of user data per block.
    #[inline]
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.geometry.formatter().data_size()
    }

    /// Blocks carved out of every page.
    #[inline]
    #[must_use]
    pub const fn blocks_per_page(&self) -> usize {
        self.geometry.blocks_per_page()
    }

    /// Bytes one block occupies in a page: header, padding, data and filler.
    #[inline]
    #[must_use]
    pub const fn block_footprint(&self) -> usize {
        self.geometry.stride()
    }

    /// Pages currently owned.
    #[inline]
    #[must_use]
    pub const fn page_count(&self) -> usize {
        self.page_count
    }

    /// Total blocks across all pages.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.page_count * self.geometry.blocks_per_page()
    }

    /// Blocks currently handed out.
    #[inline]
    #[must_use]
    pub const fn allocated_count(&self) -> usize {
        self.allocated_count
    }

    /// Blocks on the free list.
    #[inline]
    #[must_use]
    pub const fn free_count(&self) -> usize {
        self.free_count
    }

    /// Whether user data is stamped with signatures on allocate/deallocate.
    #[inline]
    #[must_use]
    pub const fn stamps_signatures(&self) -> bool {
        self.stamp_signatures
    }

    /// Current bookkeeping.
    #[must_use]
    pub const fn stats(&self) -> PoolStats {
        PoolStats {
            block_size: self.block_size(),
            block_footprint: self.block_footprint(),
            blocks_per_page: self.blocks_per_page(),
            page_count: self.page_count,
            page_bytes: self.geometry.page_bytes(),
            allocated: self.allocated_count,
            free: self.free_count,
        }
    }

    /// In-use counter of every page, in list order.
    #[must_use]
    pub fn page_usage(&self) -> Vec<usize> {
        // SAFETY: every page in the list is live.
        self.pages().map(|page| unsafe { (*page.as_ptr()).in_use }).collect()
    }

    /// Hands out one block.
    ///
    /// Pops the most recently freed block. When the free list is empty a new
    /// page is appended first; this pool never returns null and never refuses
    /// for lack of capacity.
    ///
    /// The returned pointer is aligned to [`DATA_ALIGN`](super::DATA_ALIGN)
    /// and valid for `block_size` bytes until it is deallocated or the pool
    /// is dropped.
    ///
    /// # Errors
    ///
    /// [`PoolError::OutOfMemory`] if a new page was needed and the heap
    /// refused it. The condition is also reported.
    pub fn allocate(&mut self) -> PoolResult<NonNull<u8>> {
        let block = match self.free_list {
            Some(block) => block,
            None => {
                self.grow()?;
                self.free_list.ok_or(PoolError::OutOfMemory {
                    bytes: self.geometry.page_bytes(),
                })?
            }
        };

        // SAFETY: free-list blocks live in pages owned by this pool, and a
        // free block is referenced by nobody else.
        let data = unsafe {
            let header = block.as_ptr();
            self.free_list = NonNull::new((*header).next_free);
            (*header).next_free = ptr::null_mut();
            (*header).state = BLOCK_ALLOCATED;
            (*(*header).page).in_use += 1;

            if self.stamp_signatures {
                self.geometry
                    .formatter()
                    .mark_allocated(self.geometry.region_mut(block));
            }
            self.geometry.data_ptr(block)
        };

        self.free_count -= 1;
        self.allocated_count += 1;
        Ok(data)
    }

    /// Returns a block to the pool.
    ///
    /// Ownership is checked against the page index in O(log pages). Guard
    /// bytes and the block header are validated next. Corruption is reported
    /// as [`PoolError::CorruptionDetected`], the damaged bytes are repaired,
    /// and the block is still recycled; the call still succeeds.
    ///
    /// A damaged block whose state no longer says "allocated" is looked up on
    /// the free list before it is treated as a double free.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidBlockPointer`] if `ptr` is not the start of a block
    /// of this pool, [`PoolError::DoubleFree`] if the block is already free.
    /// Both are also reported, and leave the lists untouched.
    pub fn deallocate(&mut self, ptr: NonNull<u8>) -> PoolResult<()> {
        let address = ptr.as_ptr() as usize;
        let Some((page, block)) = self.locate(address) else {
            return Err(self.reject(PoolError::InvalidBlockPointer { address }));
        };

        // SAFETY: `locate` only yields blocks of live pages owned by this pool.
        // Header fields are plain data, so whatever an underflow left in them
        // is still a valid value to read.
        let (state, page_intact, padding_fault) = unsafe {
            let header = block.as_ptr();
            (
                (*header).state,
                (*header).page == page.as_ptr(),
                self.geometry
                    .formatter()
                    .find_padding_fault(self.geometry.region(block)),
            )
        };

        // The outermost damage wins: the page pointer sits furthest from the data.
        let fault = if page_intact {
            padding_fault.or_else(|| {
                (state != BLOCK_FREE && state != BLOCK_ALLOCATED).then_some(GuardRegion::Header)
            })
        } else {
            Some(GuardRegion::Header)
        };

        if state != BLOCK_ALLOCATED {
            let already_free = fault.is_none() || self.on_free_list(block);
            if already_free {
                if let Some(region) = fault {
                    self.repair(page, block, address, region);
                    // SAFETY: the block is in an owned page and on the free list.
                    unsafe { (*block.as_ptr()).state = BLOCK_FREE };
                }
                return Err(self.reject(PoolError::DoubleFree { address }));
            }
        }
        if let Some(region) = fault {
            self.repair(page, block, address, region);
        }

        // SAFETY: as above. The caller has given the block back, so nothing
        // else refers to it.
        unsafe {
            let header = block.as_ptr();
            if self.stamp_signatures {
                self.geometry
                    .formatter()
                    .mark_unallocated(self.geometry.region_mut(block));
            }

            (*header).state = BLOCK_FREE;
            debug_assert!((*page.as_ptr()).in_use > 0);
            (*page.as_ptr()).in_use -= 1;
            (*header).next_free = self.free_list.map_or(ptr::null_mut(), NonNull::as_ptr);
        }

        self.free_list = Some(block);
        self.free_count += 1;
        self.allocated_count -= 1;
        Ok(())
    }

    /// Releases every page with no blocks handed out.
    ///
    /// Free-list entries inside those pages are unlinked before any page is
    /// released. Pages holding live blocks are never touched. May leave the
    /// pool with zero pages; the next allocation grows again.
    ///
    /// Returns the number of pages released.
    pub fn reclaim_empty_pages(&mut self) -> usize {
        // SAFETY: every page in the list is live until released below.
        let empty = self
            .pages()
            .filter(|page| unsafe { (*page.as_ptr()).in_use == 0 })
            .count();
        if empty == 0 {
            return 0;
        }

        // SAFETY: free blocks and their back-pointers live in owned pages,
        // none of which has been released yet.
        unsafe {
            let mut previous: Option<NonNull<BlockHeader>> = None;
            let mut cursor = self.free_list;
            while let Some(block) = cursor {
                let header = block.as_ptr();
                let next = (*header).next_free;
                if (*(*header).page).in_use == 0 {
                    match previous {
                        Some(prev) => (*prev.as_ptr()).next_free = next,
                        None => self.free_list = NonNull::new(next),
                    }
                    self.free_count -= 1;
                } else {
                    previous = Some(block);
                }
                cursor = NonNull::new(next);
            }
        }

        let mut released = 0;
        // SAFETY: no free-list entry points into an empty page anymore, and
        // empty pages have no live blocks by definition.
        unsafe {
            let mut previous: Option<NonNull<PageHeader>> = None;
            let mut cursor = self.head;
            while let Some(page) = cursor {
                let next = (*page.as_ptr()).next;
                if (*page.as_ptr()).in_use == 0 {
                    match previous {
                        Some(prev) => (*prev.as_ptr()).next = next,
                        None => self.head = next,
                    }
                    if self.tail == Some(page) {
                        self.tail = previous;
                    }
                    self.page_index.remove(&(page.as_ptr() as usize));
                    self.geometry.release_page(page);
                    released += 1;
                } else {
                    previous = Some(page);
                }
                cursor = next;
            }
        }

        debug_assert_eq!(released, empty);
        self.page_count -= released;
        tracing::debug!(
            "reclaimed {} empty pages, {} remain",
            released,
            self.page_count
        );
        released
    }

    /// Releases every page. Equivalent to dropping the pool.
    ///
    /// Blocks still handed out are not cleaned up; their count is reported as
    /// a warning.
    pub fn destroy(self) {
        drop(self);
    }

    /// True if `ptr` is the start of a block of this pool.
    #[must_use]
    pub fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.locate(ptr.as_ptr() as usize).is_some()
    }

    /// True if `ptr` is a block of this pool that is currently handed out.
    #[must_use]
    pub fn is_allocated(&self, ptr: NonNull<u8>) -> bool {
        self.live_block(ptr.as_ptr() as usize).is_some()
    }

    /// Debug signature currently visible in a block's user data.
    ///
    /// Returns `None` for pointers this pool does not own.
    #[must_use]
    pub fn signature_of(&self, ptr: NonNull<u8>) -> Option<Signature> {
        let (_, block) = self.locate(ptr.as_ptr() as usize)?;
        // SAFETY: the block lives in an owned page; the region is only read.
        let region = unsafe { self.geometry.region(block) };
        Some(self.geometry.formatter().signature_of(region))
    }

    /// Iterates over the user-data pointers of every block handed out,
    /// page by page.
    #[must_use]
    pub fn allocated_blocks(&self) -> AllocatedBlocks<'_> {
        AllocatedBlocks {
            geometry: &self.geometry,
            page: self.head,
            index: 0,
            _pool: PhantomData,
        }
    }

    /// User-data pointer of the live block at `address`, re-derived from its
    /// page so it carries the page allocation's provenance.
    pub(crate) fn live_block(&self, address: usize) -> Option<NonNull<u8>> {
        let (_, block) = self.locate(address)?;
        // SAFETY: the block lives in an owned page.
        unsafe {
            ((*block.as_ptr()).state == BLOCK_ALLOCATED).then(|| self.geometry.data_ptr(block))
        }
    }

    fn pages(&self) -> impl Iterator<Item = NonNull<PageHeader>> + '_ {
        // SAFETY: every page in the list is live while `self` is borrowed.
        std::iter::successors(self.head, |page| unsafe { (*page.as_ptr()).next })
    }

    /// Finds the page and block whose user data starts at `address`.
    ///
    /// Only the nearest page at or below `address` can hold it; the block
    /// header is never read before ownership is established.
    fn locate(&self, address: usize) -> Option<(NonNull<PageHeader>, NonNull<BlockHeader>)> {
        let (_, &page) = self.page_index.range(..=address).next_back()?;
        let index = self.geometry.slot_of(page, address)?;
        // SAFETY: `slot_of` only returns indices inside the page.
        Some((page, unsafe { self.geometry.block(page, index) }))
    }

    /// True if `block` is linked into the free list.
    fn on_free_list(&self, block: NonNull<BlockHeader>) -> bool {
        // SAFETY: free-list entries live in owned pages.
        std::iter::successors(self.free_list, |free| unsafe {
            NonNull::new((*free.as_ptr()).next_free)
        })
        .any(|free| free == block)
    }

    /// Appends a fresh page and puts its blocks in front of the free list.
    fn grow(&mut self) -> PoolResult<()> {
        let fresh = self.geometry.build_page().map_err(|err| self.reject(err))?;

        // SAFETY: the fresh page is exclusively ours and the tail page is live.
        unsafe {
            match self.tail {
                Some(tail) => (*tail.as_ptr()).next = Some(fresh.page),
                None => self.head = Some(fresh.page),
            }
            (*fresh.last.as_ptr()).next_free =
                self.free_list.map_or(ptr::null_mut(), NonNull::as_ptr);
        }
        self.tail = Some(fresh.page);
        self.page_index.insert(fresh.page.as_ptr() as usize, fresh.page);
        self.free_list = Some(fresh.first);
        self.page_count += 1;
        self.free_count += self.geometry.blocks_per_page();

        tracing::debug!(
            "segmented pool grew to {} pages ({} bytes each)",
            self.page_count,
            self.geometry.page_bytes()
        );
        Ok(())
    }

    /// Reports corruption of a block and restores its page pointer and padding.
    fn repair(
        &self,
        page: NonNull<PageHeader>,
        block: NonNull<BlockHeader>,
        address: usize,
        region: GuardRegion,
    ) {
        self.reporter.report(
            Severity::Error,
            &PoolError::CorruptionDetected { address, region },
        );
        // SAFETY: the block lives in an owned page and is not aliased while
        // the pool is mutably borrowed by the caller.
        unsafe {
            (*block.as_ptr()).page = page.as_ptr();
            self.geometry
                .formatter()
                .restamp_padding(self.geometry.region_mut(block));
        }
    }

    /// Reports `error` and hands it back for returning.
    fn reject(&self, error: PoolError) -> PoolError {
        self.reporter.report(Severity::Error, &error);
        error
    }
}

impl Drop for SegmentedPoolAllocator {
    fn drop(&mut self) {
        if self.allocated_count > 0 {
            self.reporter.report(
                Severity::Warning,
                &PoolError::LiveBlocksOnDestroy {
                    count: self.allocated_count,
                },
            );
        }

        let mut cursor = self.head.take();
        while let Some(page) = cursor {
            // SAFETY: each page is read once, then released and never touched again.
            unsafe {
                cursor = (*page.as_ptr()).next;
                self.geometry.release_page(page);
            }
        }
        self.tail = None;
        self.page_index.clear();
        self.free_list = None;
        self.page_count = 0;
    }
}

impl fmt::Debug for SegmentedPoolAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentedPoolAllocator")
            .field("stats", &self.stats())
            .field("stamp_signatures", &self.stamp_signatures)
            .finish_non_exhaustive()
    }
}

/// Iterator over the blocks currently handed out by a pool.
///
/// Created by [`SegmentedPoolAllocator::allocated_blocks`].
pub struct AllocatedBlocks<'a> {
    geometry: &'a BlockGeometry,
    page: Option<NonNull<PageHeader>>,
    index: usize,
    _pool: PhantomData<&'a SegmentedPoolAllocator>,
}

impl Iterator for AllocatedBlocks<'_> {
    type Item = NonNull<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(page) = self.page {
            if self.index == self.geometry.blocks_per_page() {
                // SAFETY: the pool is borrowed, so its pages stay live.
                self.page = unsafe { (*page.as_ptr()).next };
                self.index = 0;
                continue;
            }

            let index = self.index;
            self.index += 1;
            // SAFETY: `index < blocks_per_page` and the page is live.
            unsafe {
                let block = self.geometry.block(page, index);
                if (*block.as_ptr()).state == BLOCK_ALLOCATED {
                    return Some(self.geometry.data_ptr(block));
                }
            }
        }
        None
    }
}
