//! Allocator front ends, and the OS interface they sit on.
//!
//! ## Basic Types
//!
//! ### [`RawPool`](../pool/struct.RawPool.html)
//!
//! A `RawPool` is a single-threaded heap and freed memory manager. It is not
//! thread-safe, so it cannot be used as a global allocator by itself.
//!
//! ### [`GenericAllocator`](struct.GenericAllocator.html)
//!
//! A `GenericAllocator` wraps a `RawPool` with a spin lock to make it
//! thread-safe, and decides what happens on errors: fatal ones end the
//! process, the rest are counted and reported as a failed call.
//!
//! ### [`UnixAllocator`](struct.UnixAllocator.html)
//!
//! A `UnixAllocator` is a `GenericAllocator` over a
//! [`UnixHeapGrower`](../unix/struct.UnixHeapGrower.html), which moves the
//! program break and maps pages. It can be installed with
//! `#[global_allocator]`.
//!
//! ### [`HeapGrower`](trait.HeapGrower.html)
//!
//! `HeapGrower` is a simple trait interface meant to abstract over the calls to
//! the OS to expand the heap and to map standalone regions.
//!
//! ### [`ToyHeap`](struct.ToyHeap.html)
//!
//! `ToyHeap` is a fixed buffer that can pretend to be a heap, and implements
//! `HeapGrower` for such a purpose. It is mainly useful for testing.

use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::fmt;
use core::mem::MaybeUninit;
use core::ops::Deref;
use core::ptr::{null_mut, NonNull};
use core::sync::atomic::{AtomicU8, Ordering};
use std::alloc::System;

use log::{debug, error, info};
use spin::{Mutex, MutexGuard};

use crate::block::{Stats, Validity, ALIGN};
use crate::config::PoolConfig;
use crate::diagnostics::{BlockInfo, Summary};
use crate::error::AllocError;
use crate::pool::RawPool;
use crate::round_up;
use crate::unix::UnixHeapGrower;

pub trait HeapGrower {
    type Err: fmt::Display;

    /// Granularity of both heap growth and mappings. Always a power of two,
    /// and a multiple of `ALIGN`.
    fn page_size(&self) -> usize;

    /// Grow the heap by at least size. Returns a pointer and the size of the
    /// memory available at that pointer.
    ///
    /// # Safety
    ///
    /// This is pretty much entirely unsafe.
    ///
    /// For this to function properly with the other types in this module:
    ///
    /// - The return value may be (null, 0), indicating allocation failure.
    /// - The return value may be (ptr, new_size), where new_size >= size, and
    ///   where the memory pointed to by ptr must be available and untracked by
    ///   any other rust code, including the allocator itself.
    /// - Successive growths should land at increasing addresses. The pool
    ///   refuses memory below what it already has.
    unsafe fn grow_heap(&mut self, size: usize) -> Result<(*mut u8, usize), Self::Err>;

    /// Map a standalone region of `len` bytes, `len` a multiple of the page
    /// size. The region is page-aligned.
    ///
    /// # Safety
    ///
    /// The region must be untracked by anything else until it is passed back
    /// to [`unmap_pages`](#tymethod.unmap_pages).
    unsafe fn map_pages(&mut self, len: usize) -> Result<NonNull<u8>, Self::Err>;

    /// Give back a region returned by [`map_pages`](#tymethod.map_pages).
    ///
    /// # Safety
    ///
    /// `ptr` and `len` must match an earlier mapping exactly, and nothing may
    /// use the region afterwards.
    unsafe fn unmap_pages(&mut self, ptr: NonNull<u8>, len: usize) -> Result<(), Self::Err>;
}

/// Log a fatal error, write a fixed line to stderr, and abort.
///
/// Nothing here allocates after the log call.
#[cold]
pub(crate) fn fatal(err: AllocError) -> ! {
    error!("fatal allocator error: {}", err);
    let message = err.message();
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            message.as_ptr() as *const libc::c_void,
            message.len(),
        );
    }
    std::process::abort()
}

/// Apply the error policy to the result of a pool call.
fn settle<T>(result: Result<Option<T>, AllocError>) -> Option<T> {
    match result {
        Ok(value) => value,
        Err(err) if err.is_fatal() => fatal(err),
        Err(_) => None,
    }
}

/// A thread-safe allocator, using a spin lock around a RawPool.
///
/// Every operation takes the lock for its whole duration, including any calls
/// to the OS. Logging happens with the lock held too; when this is the global
/// allocator, the installed logger must not allocate.
pub struct GenericAllocator<G> {
    config: PoolConfig,
    // Values:
    // - 0: Untouched
    // - 1: Initialization in progress
    // - 2: Initialized
    init: AtomicU8,
    raw: UnsafeCell<MaybeUninit<Mutex<RawPool<G>>>>,
}

// All access to `raw` goes through the init protocol and then the mutex.
unsafe impl<G: Send> Sync for GenericAllocator<G> {}

impl<G: HeapGrower + Default> Default for GenericAllocator<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G> GenericAllocator<G> {
    pub const fn new() -> Self {
        Self::with_config(PoolConfig::DEFAULT)
    }

    pub const fn with_config(config: PoolConfig) -> Self {
        GenericAllocator {
            config,
            init: AtomicU8::new(0),
            raw: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

impl<G> Drop for GenericAllocator<G> {
    fn drop(&mut self) {
        if *self.init.get_mut() == 2 {
            // Arena memory stays with the process; only the bookkeeping goes.
            unsafe { self.raw.get_mut().assume_init_drop() };
        }
    }
}

impl<G: HeapGrower + Default> GenericAllocator<G> {
    /// Lock and return the underlying RawPool, creating it on first use.
    ///
    /// Every other operation on this allocator blocks while the guard is
    /// alive, including allocations made by the same thread.
    pub fn get_raw(&self) -> MutexGuard<'_, RawPool<G>> {
        // The plan:
        // - If initializing hasn't yet started (0):
        //   - Mark it as initializing (1), then initialize, then mark it as fully initialized (2)
        // - If it has started but not completed (1):
        //   - Enter a spin loop until it is fully initialized (2)
        // - If it finished initializing (2):
        //   - Continue
        //
        // The ordering here is SeqCst because that's the safest, if not the
        // most efficient.
        let state = self
            .init
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst);

        match state {
            Err(2) => {}
            Ok(_) => {
                let pool = RawPool::with_config(G::default(), self.config);
                let mutex: &Mutex<RawPool<G>> = unsafe { (*self.raw.get()).write(Mutex::new(pool)) };

                // Let other threads know that the mutex and pool are now
                // initialized, and they are free to lock it.
                self.init.store(2, Ordering::SeqCst);
                return mutex.lock();
            }
            Err(_) => {
                // Some other thread is currently initializing. We wait for it.
                while self.init.load(Ordering::SeqCst) != 2 {
                    core::hint::spin_loop();
                }
            }
        }

        let mutex: &Mutex<RawPool<G>> = unsafe { (*self.raw.get()).assume_init_ref() };
        mutex.lock()
    }

    /// Allocate `size` bytes, or `None` for a zero-sized request.
    ///
    /// Resource exhaustion ends the process.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let result = self.get_raw().allocate(size);
        settle(result)
    }

    /// Release an allocation. Invalid pointers are counted and ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator.
    pub unsafe fn release(&self, ptr: NonNull<u8>) {
        let result = self.get_raw().release(ptr);
        settle(result.map(Some));
    }

    /// Resize an allocation. See
    /// [`RawPool::reallocate`](../pool/struct.RawPool.html#method.reallocate).
    ///
    /// Returns `None` if `size` is zero, or if `ptr` was refused as invalid;
    /// in the latter case it is left untouched.
    ///
    /// # Safety
    ///
    /// `ptr`, if any, must have been returned by this allocator.
    pub unsafe fn reallocate(&self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        let result = self.get_raw().reallocate(ptr, size);
        settle(result)
    }

    /// The payload capacity behind a live allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.get_raw().usable_size(ptr)
    }

    pub fn summary(&self) -> Summary {
        self.get_raw().summary()
    }

    /// Get statistics on this allocator, and verify validity of the chain.
    pub fn stats(&self) -> (Validity, Stats) {
        self.get_raw().stats()
    }

    /// Visit every arena block in address order, with the lock held.
    pub fn for_each_block<F: FnMut(BlockInfo)>(&self, visit: F) {
        self.get_raw().for_each_block(visit)
    }

    /// Log the counters and arena bounds at `info`.
    pub fn log_summary(&self) {
        let summary = self.summary();
        info!("{}", summary);
    }

    /// Log every block of the chain at `debug`, one line each.
    pub fn dump_chain(&self) {
        let pool = self.get_raw();
        debug!("chain at {:?}:", pool.chain().bounds());
        pool.for_each_block(|info| debug!("  {}", info));
    }
}

unsafe impl<G: HeapGrower + Default> GlobalAlloc for GenericAllocator<G> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGN {
            return null_mut();
        }
        let result = self.get_raw().allocate(layout.size());
        match result {
            Ok(Some(ptr)) => ptr.as_ptr(),
            _ => null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            let _ = self.get_raw().release(ptr);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGN {
            return null_mut();
        }
        let result = self.get_raw().reallocate(NonNull::new(ptr), new_size);
        match result {
            Ok(Some(ptr)) => ptr.as_ptr(),
            _ => null_mut(),
        }
    }
}

/// The allocator for real programs: the arena lives on the program break, and
/// large blocks get their own anonymous mappings.
///
/// ```no_run
/// use chain_allocator::UnixAllocator;
///
/// #[global_allocator]
/// static HEAP: UnixAllocator = UnixAllocator::new();
/// ```
#[derive(Default)]
pub struct UnixAllocator {
    alloc: GenericAllocator<UnixHeapGrower>,
}

impl UnixAllocator {
    pub const fn new() -> Self {
        UnixAllocator {
            alloc: GenericAllocator::new(),
        }
    }

    pub const fn with_config(config: PoolConfig) -> Self {
        UnixAllocator {
            alloc: GenericAllocator::with_config(config),
        }
    }
}

impl Deref for UnixAllocator {
    type Target = GenericAllocator<UnixHeapGrower>;

    fn deref(&self) -> &Self::Target {
        &self.alloc
    }
}

unsafe impl GlobalAlloc for UnixAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.alloc.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.alloc.dealloc(ptr, layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        self.alloc.realloc(ptr, layout, new_size)
    }
}

/// A heap and a set of mappings carved out of the system allocator, with
/// counters for everything the pool asks of it.
///
/// The arena is one fixed buffer, handed out a page at a time. Mappings are
/// separate page-aligned buffers, up to `map_limit` bytes at once.
pub struct ToyHeap {
    pub page_size: usize,
    /// Bytes of the arena buffer handed out so far.
    pub size: usize,
    heap: NonNull<u8>,
    heap_len: usize,
    pub map_limit: usize,
    pub mapped_bytes: usize,
    pub maps: usize,
    pub unmaps: usize,
    pub unmapped_bytes: usize,
    /// Address and length of the most recent unmapping.
    pub last_unmap: Option<(usize, usize)>,
}

// The buffers are owned by the ToyHeap alone.
unsafe impl Send for ToyHeap {}

impl ToyHeap {
    /// A heap of `heap_len` bytes, allowing `map_limit` bytes of live
    /// mappings. `page_size` must be a power of two, at least `ALIGN`.
    pub fn new(heap_len: usize, map_limit: usize, page_size: usize) -> Self {
        assert!(page_size.is_power_of_two() && page_size >= ALIGN);
        let heap_len = round_up(heap_len, page_size).max(page_size);
        let layout = match Layout::from_size_align(heap_len, page_size) {
            Ok(layout) => layout,
            Err(err) => panic!("bad toy heap layout: {}", err),
        };
        let heap = match NonNull::new(unsafe { System.alloc_zeroed(layout) }) {
            Some(heap) => heap,
            None => std::alloc::handle_alloc_error(layout),
        };

        ToyHeap {
            page_size,
            size: 0,
            heap,
            heap_len,
            map_limit,
            mapped_bytes: 0,
            maps: 0,
            unmaps: 0,
            unmapped_bytes: 0,
            last_unmap: None,
        }
    }

    /// The whole arena buffer, used or not.
    pub fn heap_range(&self) -> core::ops::Range<*const u8> {
        let start = self.heap.as_ptr() as *const u8;
        start..start.wrapping_add(self.heap_len)
    }

    fn heap_layout(&self) -> Layout {
        // Checked in `new`.
        unsafe { Layout::from_size_align_unchecked(self.heap_len, self.page_size) }
    }
}

impl Default for ToyHeap {
    fn default() -> Self {
        ToyHeap::new(256 * 1024, 1024 * 1024, 4096)
    }
}

impl Drop for ToyHeap {
    fn drop(&mut self) {
        unsafe { System.dealloc(self.heap.as_ptr(), self.heap_layout()) };
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToyHeapError {
    Overflow { requested: usize },
    MapLimit { requested: usize },
    NotMapped,
}

impl fmt::Display for ToyHeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToyHeapError::Overflow { requested } => {
                write!(f, "toy heap cannot grow by {} bytes", requested)
            }
            ToyHeapError::MapLimit { requested } => {
                write!(f, "toy heap cannot map {} more bytes", requested)
            }
            ToyHeapError::NotMapped => write!(f, "region was never mapped"),
        }
    }
}

impl HeapGrower for ToyHeap {
    type Err = ToyHeapError;

    fn page_size(&self) -> usize {
        self.page_size
    }

    unsafe fn grow_heap(&mut self, size: usize) -> Result<(*mut u8, usize), Self::Err> {
        let allocating = round_up(size, self.page_size);
        if allocating > self.heap_len - self.size {
            return Err(ToyHeapError::Overflow { requested: size });
        }

        let ptr = self.heap.as_ptr().add(self.size);
        self.size += allocating;
        Ok((ptr, allocating))
    }

    unsafe fn map_pages(&mut self, len: usize) -> Result<NonNull<u8>, Self::Err> {
        let len = round_up(len, self.page_size);
        if len == 0 || len > self.map_limit - self.mapped_bytes {
            return Err(ToyHeapError::MapLimit { requested: len });
        }
        let layout = Layout::from_size_align_unchecked(len, self.page_size);
        let ptr = NonNull::new(System.alloc(layout)).ok_or(ToyHeapError::MapLimit { requested: len })?;

        self.mapped_bytes += len;
        self.maps += 1;
        Ok(ptr)
    }

    unsafe fn unmap_pages(&mut self, ptr: NonNull<u8>, len: usize) -> Result<(), Self::Err> {
        if len > self.mapped_bytes || ptr.as_ptr() as usize % self.page_size != 0 {
            return Err(ToyHeapError::NotMapped);
        }
        System.dealloc(ptr.as_ptr(), Layout::from_size_align_unchecked(len, self.page_size));

        self.mapped_bytes -= len;
        self.unmaps += 1;
        self.unmapped_bytes += len;
        self.last_unmap = Some((ptr.as_ptr() as usize, len));
        Ok(())
    }
}
