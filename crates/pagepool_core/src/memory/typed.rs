//! # Typed Pool
//!
//! Object pool for one type on top of a segmented allocator.

// SAFETY: Values are written into and read out of raw pool blocks. Every
// access goes through a block the pool has confirmed live.
#![allow(unsafe_code)]

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};

use super::page::DATA_ALIGN;
use super::segmented::{PoolStats, SegmentedPoolAllocator};
use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::report::{ErrorReporter, TracingReporter};

/// A pool of `T` values backed by a [`SegmentedPoolAllocator`].
///
/// Unlike the raw allocator, this pool owns its values: they are moved in on
/// [`allocate`](Self::allocate), moved out on [`free`](Self::free), and
/// dropped when the pool is cleared or dropped.
///
/// # Thread Safety
///
/// This pool is NOT thread-safe. Use one pool per thread or wrap in a mutex.
///
/// # Example
///
/// ```rust,ignore
/// struct Particle { x: f32, y: f32, life: f32 }
///
/// let mut pool: TypedPool<Particle> = TypedPool::new(1024)?;
///
/// // Allocate - O(1), grows a page when full
/// let handle = pool.allocate(Particle { x: 0.0, y: 0.0, life: 1.0 })?;
///
/// // Free - hands the value back
/// let particle = pool.free(handle);
/// ```
pub struct TypedPool<T> {
    raw: SegmentedPoolAllocator,
    _marker: PhantomData<T>,
}

/// Handle to a value in a [`TypedPool`].
///
/// Handles are plain addresses. Once a value is freed its block may be
/// reused, and an old handle then refers to the new occupant.
pub struct PoolHandle<T> {
    ptr: NonNull<T>,
}

impl<T> PoolHandle<T> {
    /// Address of the value inside the pool.
    #[inline]
    #[must_use]
    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

impl<T> Clone for PoolHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PoolHandle<T> {}

impl<T> PartialEq for PoolHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for PoolHandle<T> {}

impl<T> Hash for PoolHandle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ptr.hash(state);
    }
}

impl<T> fmt::Debug for PoolHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PoolHandle").field(&self.ptr).finish()
    }
}

// SAFETY: A handle is only an address; it is never dereferenced without the
// owning pool, which enforces its own borrowing rules.
unsafe impl<T> Send for PoolHandle<T> {}
// SAFETY: See above.
unsafe impl<T> Sync for PoolHandle<T> {}

impl<T> TypedPool<T> {
    /// Creates a pool with `blocks_per_page` values per page.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidConfig`] if `blocks_per_page` is zero or `T` needs
    /// more than [`DATA_ALIGN`] alignment; [`PoolError::OutOfMemory`] if the
    /// first page cannot be allocated.
    pub fn new(blocks_per_page: usize) -> PoolResult<Self> {
        Self::with_reporter(blocks_per_page, TracingReporter)
    }

    /// Creates a pool that hands detected conditions to `reporter`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::new`].
    pub fn with_reporter<R>(blocks_per_page: usize, reporter: R) -> PoolResult<Self>
    where
        R: ErrorReporter + Send + 'static,
    {
        if mem::align_of::<T>() > DATA_ALIGN {
            return Err(PoolError::InvalidConfig(format!(
                "alignment {} exceeds the {DATA_ALIGN}-byte block alignment",
                mem::align_of::<T>()
            )));
        }

        let config = PoolConfig::new(mem::size_of::<T>().max(1), blocks_per_page);
        Ok(Self {
            raw: SegmentedPoolAllocator::with_reporter(config, reporter)?,
            _marker: PhantomData,
        })
    }

    /// Returns the number of live values.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.raw.allocated_count()
    }

    /// True if no values are live.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.raw.allocated_count() == 0
    }

    /// Returns the number of pages backing the pool.
    #[inline]
    #[must_use]
    pub const fn page_count(&self) -> usize {
        self.raw.page_count()
    }

    /// Returns the number of values the current pages can hold.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.raw.capacity()
    }

    /// Bookkeeping of the underlying allocator.
    #[must_use]
    pub const fn stats(&self) -> PoolStats {
        self.raw.stats()
    }

    /// Moves `value` into the pool.
    ///
    /// # Errors
    ///
    /// [`PoolError::OutOfMemory`] if a new page was needed and could not be
    /// allocated. `value` is dropped in that case.
    pub fn allocate(&mut self, value: T) -> PoolResult<PoolHandle<T>> {
        let ptr = self.raw.allocate()?.cast::<T>();
        // SAFETY: the block is fresh, aligned for T and large enough to hold one.
        unsafe { ptr.as_ptr().write(value) };
        Ok(PoolHandle { ptr })
    }

    /// Moves a value out of the pool and recycles its block.
    ///
    /// Returns `None` if the handle does not refer to a live value.
    pub fn free(&mut self, handle: PoolHandle<T>) -> Option<T> {
        let block = self.raw.live_block(handle.address())?;
        // SAFETY: the block is live and holds an initialized T.
        let value = unsafe { block.cast::<T>().as_ptr().read() };
        if self.raw.deallocate(block).is_err() {
            // The block stayed live, so it still owns the value.
            mem::forget(value);
            return None;
        }
        Some(value)
    }

    /// Gets a reference to a live value.
    #[inline]
    #[must_use]
    pub fn get(&self, handle: PoolHandle<T>) -> Option<&T> {
        let block = self.raw.live_block(handle.address())?;
        // SAFETY: the block is live, holds a T, and `self` is borrowed.
        Some(unsafe { &*block.cast::<T>().as_ptr() })
    }

    /// Gets a mutable reference to a live value.
    #[inline]
    pub fn get_mut(&mut self, handle: PoolHandle<T>) -> Option<&mut T> {
        let block = self.raw.live_block(handle.address())?;
        // SAFETY: the block is live, holds a T, and `self` is mutably borrowed.
        Some(unsafe { &mut *block.cast::<T>().as_ptr() })
    }

    /// Drops every live value and returns all blocks to the free list.
    ///
    /// Pages are kept; call [`reclaim_empty_pages`](Self::reclaim_empty_pages)
    /// to release them.
    pub fn clear(&mut self) {
        let live: Vec<NonNull<u8>> = self.raw.allocated_blocks().collect();
        for block in live {
            // SAFETY: each block is live and holds an initialized T.
            unsafe { ptr::drop_in_place(block.cast::<T>().as_ptr()) };
            if let Err(err) = self.raw.deallocate(block) {
                tracing::error!("typed pool failed to recycle a cleared block: {}", err);
            }
        }
    }

    /// Releases pages with no live values. Returns the number released.
    pub fn reclaim_empty_pages(&mut self) -> usize {
        self.raw.reclaim_empty_pages()
    }

    /// Iterates over all live values.
    pub fn iter(&self) -> impl Iterator<Item = (PoolHandle<T>, &T)> {
        self.raw.allocated_blocks().map(|block| {
            let ptr = block.cast::<T>();
            // SAFETY: the block is live, holds a T, and `self` is borrowed.
            (PoolHandle { ptr }, unsafe { &*ptr.as_ptr() })
        })
    }

    /// Iterates mutably over all live values.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (PoolHandle<T>, &mut T)> {
        self.raw.allocated_blocks().map(|block| {
            let ptr = block.cast::<T>();
            // SAFETY: every block is yielded once and `self` is mutably borrowed.
            (PoolHandle { ptr }, unsafe { &mut *ptr.as_ptr() })
        })
    }
}

impl<T> Drop for TypedPool<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<T> fmt::Debug for TypedPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedPool").field("raw", &self.raw).finish()
    }
}
