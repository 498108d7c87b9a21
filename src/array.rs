//! Typed arrays on top of the byte interface.
//!
//! The contract is the one a growable vector needs: allocate room for `n`
//! elements, resize from `old` to `new` elements keeping the common prefix,
//! and release.

use core::mem::{align_of, size_of};
use core::ptr::NonNull;

use crate::allocators::{GenericAllocator, HeapGrower};
use crate::block::ALIGN;

/// Bytes needed for `count` values of `T`, or `None` if `T` needs more
/// alignment than a payload has, or the size overflows.
fn array_bytes<T>(count: usize) -> Option<usize> {
    if align_of::<T>() > ALIGN {
        return None;
    }
    size_of::<T>().checked_mul(count)
}

impl<G: HeapGrower + Default> GenericAllocator<G> {
    /// Room for `count` values of `T`, uninitialized.
    ///
    /// Returns `None` when no bytes are needed, or when the request cannot be
    /// represented.
    pub fn allocate_array<T>(&self, count: usize) -> Option<NonNull<T>> {
        let bytes = array_bytes::<T>(count)?;
        self.allocate(bytes).map(NonNull::cast)
    }

    /// Resize an array from `old_count` to `new_count` elements.
    ///
    /// The first `min(old_count, new_count)` elements are preserved. A
    /// `new_count` of zero releases the array and returns `None`; a `ptr` of
    /// `None` allocates.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator, with room for at least
    /// `old_count` elements.
    pub unsafe fn resize_array<T>(
        &self,
        ptr: Option<NonNull<T>>,
        old_count: usize,
        new_count: usize,
    ) -> Option<NonNull<T>> {
        if let Some(ptr) = ptr {
            debug_assert!(self
                .usable_size(ptr.cast())
                .map_or(true, |usable| usable >= size_of::<T>().saturating_mul(old_count)));
        }

        if new_count == 0 {
            if let Some(ptr) = ptr {
                self.release(ptr.cast());
            }
            return None;
        }

        let bytes = array_bytes::<T>(new_count)?;
        self.reallocate(ptr.map(NonNull::cast), bytes).map(NonNull::cast)
    }

    /// Release an array of `count` elements. The count is only checked in
    /// debug builds.
    ///
    /// # Safety
    ///
    /// Same as [`resize_array`](#method.resize_array).
    pub unsafe fn release_array<T>(&self, ptr: NonNull<T>, count: usize) {
        debug_assert!(self
            .usable_size(ptr.cast())
            .map_or(true, |usable| usable >= size_of::<T>().saturating_mul(count)));
        self.release(ptr.cast());
    }
}
