//! Large blocks: one anonymous mapping per allocation.
//!
//! A mapped block carries the same header as an arena block, with its state
//! set to `MappedLarge` and both links at `NIL`. The length of the mapping is
//! never stored; it is recomputed from the payload size on release, so the
//! header stays the only record of the region.

use core::ptr::{self, NonNull};

use log::{debug, trace, warn};

use crate::allocators::HeapGrower;
use crate::block::{Block, BlockState, HEADER_SIZE};
use crate::config::LargeRealloc;
use crate::error::AllocError;
use crate::pool::{aligned_size, RawPool};

impl<G: HeapGrower> RawPool<G> {
    /// Length of the mapping that holds a large block of `size` payload
    /// bytes: header plus payload, rounded up to whole pages.
    pub fn mapped_span(&self, size: usize) -> Option<usize> {
        let page = self.grower.page_size();
        let raw = HEADER_SIZE.checked_add(size)?;
        raw.checked_add(page - 1).map(|end| end / page * page)
    }

    /// Map a fresh region for a block of `size` bytes, `size` already
    /// aligned.
    pub(crate) fn allocate_large(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let span = self
            .mapped_span(size)
            .ok_or(AllocError::ResourceExhaustion { requested: size })?;

        let start = match unsafe { self.grower.map_pages(span) } {
            Ok(start) => start,
            Err(err) => {
                warn!("mapping {} bytes failed: {}", span, err);
                return Err(AllocError::ResourceExhaustion { requested: span });
            }
        };

        let block = unsafe { Block::write(start, size, BlockState::MappedLarge) };
        let counters = self.counters_mut();
        counters.mapped_bytes += span;
        counters.mappings += 1;
        debug!("mapped {} bytes at {:?} for a {} byte block", span, start, size);
        Ok(block.payload())
    }

    /// Unmap the region holding `block`.
    ///
    /// A failing `munmap` leaks the region; the block is gone either way.
    ///
    /// # Safety
    ///
    /// `block` must be a valid `MappedLarge` block created by this pool.
    pub(crate) unsafe fn release_large(&mut self, block: Block) {
        let span = match self.mapped_span(block.size()) {
            Some(span) => span,
            None => unreachable!("span was computable when the block was mapped"),
        };
        let start = NonNull::new_unchecked(block.addr());

        if let Err(err) = self.grower.unmap_pages(start, span) {
            warn!("unmapping {} bytes at {:?} failed: {}", span, start, err);
        }
        let counters = self.counters_mut();
        counters.mapped_bytes -= span;
        counters.mappings -= 1;
        trace!("unmapped {} bytes at {:?}", span, start);
    }

    /// Resize a mapped block according to the configured policy.
    ///
    /// # Safety
    ///
    /// Same as [`release_large`](#method.release_large); `size` is non-zero.
    pub(crate) unsafe fn reallocate_large(
        &mut self,
        block: Block,
        size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let ptr = block.payload();
        if self.config().large_realloc == LargeRealloc::Reject {
            warn!("reallocate({:?}, {}): mapped blocks cannot be resized", ptr, size);
            return Err(AllocError::UnsupportedOperation);
        }

        let needed = aligned_size(size).ok_or(AllocError::ResourceExhaustion { requested: size })?;
        if needed <= block.size() && size >= self.config().large_threshold {
            trace!("reallocate({:?}, {}) stays in its mapping", ptr, size);
            return Ok(ptr);
        }

        let moved = match self.allocate(size)? {
            Some(moved) => moved,
            None => return Err(AllocError::ResourceExhaustion { requested: size }),
        };
        ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), block.size().min(needed));
        self.release(ptr)?;
        debug!("reallocate({:?}, {}) moved a mapped block to {:?}", ptr, size, moved);
        Ok(moved)
    }
}
