//! The pool: one arena, the chain of blocks inside it, and the counters that
//! describe both.
//!
//! ## Layout
//!
//! ```text
//!   arena start                                              arena end
//!   ┌────────┬─────────┬────────┬──────────────┬────────┬─────────┐
//!   │ header │ payload │ header │   payload    │ header │ payload │
//!   │  Used  │         │  Free  │              │  Used  │         │
//!   └────────┴─────────┴────────┴──────────────┴────────┴─────────┘
//!   offset 0           ▲
//!                      └── pointer handed to the caller
//! ```
//!
//! Every block, free or not, is linked into the address-ordered chain, so a
//! released block can be merged with the neighbour on either side.
//! Requests at or above the configured threshold never touch the arena; see
//! `large.rs`.

use core::ptr::{self, NonNull};

use log::{debug, trace, warn};

use crate::allocators::HeapGrower;
use crate::block::{Block, BlockState, Chain, Stats, Validity, ALIGN, HEADER_SIZE};
use crate::config::PoolConfig;
use crate::diagnostics::{BlockInfo, Counters, Summary};
use crate::error::AllocError;

/// Round a requested payload size up to the alignment, or `None` if that
/// overflows.
pub fn aligned_size(size: usize) -> Option<usize> {
    size.checked_add(ALIGN - 1).map(|s| s & !(ALIGN - 1))
}

/// A raw allocator, capable of growing the heap, returning pointers to new
/// allocations, and tracking and reusing freed memory.
///
/// This is single-threaded; wrap it in a
/// [`GenericAllocator`](../allocators/struct.GenericAllocator.html) to share
/// it. Arena memory is never returned to the OS.
pub struct RawPool<G> {
    pub grower: G,
    config: PoolConfig,
    chain: Chain,
    counters: Counters,
}

impl<G: HeapGrower + Default> Default for RawPool<G> {
    fn default() -> Self {
        RawPool::new(G::default())
    }
}

impl<G> RawPool<G> {
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    pub(crate) fn counters_mut(&mut self) -> &mut Counters {
        &mut self.counters
    }

    pub fn summary(&self) -> Summary {
        let bounds = self.chain.bounds();
        Summary {
            counters: self.counters,
            arena_start: bounds.start as usize,
            arena_end: bounds.end as usize,
            initialized: self.chain.is_initialized(),
        }
    }

    /// Check the chain, and count what is in it.
    pub fn stats(&self) -> (Validity, Stats) {
        self.chain.stats()
    }

    /// Visit every block of the chain in address order.
    pub fn for_each_block<F: FnMut(BlockInfo)>(&self, mut visit: F) {
        for block in &self.chain {
            visit(self.chain.info(block));
        }
    }
}

impl<G: HeapGrower> RawPool<G> {
    pub fn new(grower: G) -> Self {
        RawPool::with_config(grower, PoolConfig::DEFAULT)
    }

    pub fn with_config(grower: G, config: PoolConfig) -> Self {
        RawPool {
            grower,
            config: config.normalized(),
            chain: Chain::new(),
            counters: Counters::default(),
        }
    }

    /// Whether a block with `available` payload bytes should be split after
    /// handing out `size` of them.
    fn worth_splitting(&self, available: usize, size: usize) -> bool {
        available >= size && available - size >= HEADER_SIZE + self.config.min_payload
    }

    ////////////////////////////////////////////////////////////
    // Arena setup and growth

    /// Ask the OS for at least `request` more bytes, of which at least `need`
    /// must be usable once the start is aligned.
    fn grow(&mut self, request: usize, need: usize) -> Result<(NonNull<u8>, usize), AllocError> {
        let exhausted = AllocError::ResourceExhaustion { requested: request };

        let (ptr, got) = match unsafe { self.grower.grow_heap(request) } {
            Ok(growth) => growth,
            Err(err) => {
                warn!("growing the heap by {} bytes failed: {}", request, err);
                return Err(exhausted);
            }
        };
        let ptr = NonNull::new(ptr).ok_or(exhausted)?;

        let skip = (ALIGN - (ptr.as_ptr() as usize) % ALIGN) % ALIGN;
        let usable = got.saturating_sub(skip) & !(ALIGN - 1);
        if usable < need {
            warn!(
                "heap growth at {:?} gave {} usable bytes, needed {}",
                ptr, usable, need
            );
            return Err(exhausted);
        }

        let start = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(skip)) };
        if self.chain.is_initialized() && start.as_ptr() < self.chain.end() {
            warn!(
                "heap growth returned {:?}, below the arena end {:?}",
                start,
                self.chain.end()
            );
            return Err(exhausted);
        }
        if self.chain.is_initialized() && start.as_ptr() != self.chain.end() {
            debug!(
                "arena is no longer contiguous: {:?} follows {:?}",
                start,
                self.chain.end()
            );
        }

        self.counters.total_bytes += usable;
        Ok((start, usable))
    }

    /// Set up the arena with a single free block, big enough for a first
    /// request of `size` bytes.
    fn ensure_init(&mut self, size: usize) -> Result<(), AllocError> {
        if self.chain.is_initialized() {
            return Ok(());
        }

        let need = HEADER_SIZE
            .checked_add(size)
            .ok_or(AllocError::ResourceExhaustion { requested: size })?;
        let request = need.max(self.grower.page_size());
        let (start, len) = self.grow(request, need)?;

        let block = unsafe { self.chain.init(start, len) };
        self.counters.free_bytes += block.size();
        debug!("initialized arena at {:?} with {} bytes", start, len);
        Ok(())
    }

    /// Grow the arena and append a used block of at least `size` bytes at the
    /// new tail.
    fn grow_tail(&mut self, size: usize) -> Result<Block, AllocError> {
        let need = HEADER_SIZE
            .checked_add(size)
            .ok_or(AllocError::ResourceExhaustion { requested: size })?;
        let (start, len) = self.grow(need, need)?;

        let mut block = unsafe { self.chain.append(start, len, BlockState::Used) };
        if self.worth_splitting(block.size(), size) {
            let remainder = unsafe { self.chain.split(&mut block, size) };
            self.counters.free_bytes += remainder.size();
        }
        debug!(
            "grew arena by {} bytes for a {} byte block at {:?}",
            len,
            size,
            block.addr()
        );
        Ok(block)
    }

    ////////////////////////////////////////////////////////////
    // Allocation

    /// The earliest free block with room for `size` bytes.
    fn first_fit(&self, size: usize) -> Option<Block> {
        self.chain
            .iter()
            .find(|block| block.is_free() && block.size() >= size)
    }

    fn allocate_arena(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.ensure_init(size)?;

        let mut block = match self.first_fit(size) {
            Some(block) => block,
            None => return self.grow_tail(size).map(|block| block.payload()),
        };

        trace!("  first fit for {} at {:?}", size, block);
        self.counters.free_bytes -= block.size();
        unsafe {
            if self.worth_splitting(block.size(), size) {
                let remainder = self.chain.split(&mut block, size);
                self.counters.free_bytes += remainder.size();
            }
            block.set_state(BlockState::Used);
        }
        Ok(block.payload())
    }

    /// Allocate `size` bytes.
    ///
    /// Returns `Ok(None)` for a zero-sized request. Requests at or above the
    /// large threshold get their own mapping; everything else comes from the
    /// arena.
    pub fn allocate(&mut self, size: usize) -> Result<Option<NonNull<u8>>, AllocError> {
        if size == 0 {
            trace!("allocate(0) -> empty");
            return Ok(None);
        }
        let needed = aligned_size(size).ok_or(AllocError::ResourceExhaustion { requested: size })?;

        let payload = if size >= self.config.large_threshold {
            self.allocate_large(needed)?
        } else {
            self.allocate_arena(needed)?
        };

        self.counters.allocated += 1;
        self.counters.live += 1;
        trace!("allocate({}) -> {:?}", size, payload);
        Ok(Some(payload))
    }

    ////////////////////////////////////////////////////////////
    // Release

    /// Turn a payload pointer into its block, without trusting the header.
    ///
    /// Pointers that cannot possibly be payloads are refused before anything
    /// is read.
    fn block_for(&mut self, ptr: NonNull<u8>) -> Result<Block, AllocError> {
        let addr = ptr.as_ptr() as usize;
        if addr % ALIGN != 0 || addr < HEADER_SIZE {
            self.counters.errors += 1;
            warn!("{:?} cannot be a payload pointer", ptr);
            return Err(AllocError::CorruptedBlock { addr });
        }
        Ok(unsafe { Block::from_payload(ptr) })
    }

    /// Merge `block` with every free neighbour it touches, and mark the result
    /// free. Returns the merged block.
    unsafe fn coalesce(&mut self, block: Block) -> Block {
        let mut merged = block;

        while let Some(mut prev) = self.chain.free_predecessor(merged) {
            self.counters.free_bytes -= prev.size();
            self.chain.absorb_next(&mut prev);
            merged = prev;
        }
        while let Some(next) = self.chain.free_successor(merged) {
            self.counters.free_bytes -= next.size();
            self.chain.absorb_next(&mut merged);
        }

        merged.set_state(BlockState::Free);
        self.counters.free_bytes += merged.size();
        merged
    }

    /// Release a pointer returned by [`allocate`](#method.allocate) or
    /// [`reallocate`](#method.reallocate).
    ///
    /// A chain block whose header fails validation is marked corrupted and
    /// leaked. A pointer to a block that is not in use (a double free), or to
    /// a header the chain does not hold, is refused without touching anything
    /// but the error counter.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this pool. Only the header in front of
    /// it is checked, not whether it lies inside the arena.
    pub unsafe fn release(&mut self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let mut block = self.block_for(ptr)?;
        let addr = ptr.as_ptr() as usize;

        if !block.is_valid() {
            self.counters.errors += 1;
            if !self.chain.holds(block) {
                // Not a block of the chain, so there is nothing to mark.
                warn!("release({:?}): no block of this pool starts here", ptr);
                return Err(AllocError::CorruptedBlock { addr });
            }
            block.set_state(BlockState::Corrupted);
            self.counters.live = self.counters.live.saturating_sub(1);
            self.counters.deallocated += 1;
            warn!("release({:?}): bad block header, leaking it as corrupted", ptr);
            return Err(AllocError::CorruptedBlock { addr });
        }

        match block.state() {
            Some(BlockState::Used) => {
                let merged = self.coalesce(block);
                trace!("release({:?}) -> {:?}", ptr, merged);
            }
            Some(BlockState::MappedLarge) => self.release_large(block),
            Some(state) => {
                self.counters.errors += 1;
                warn!("release({:?}): block is {}, not in use", ptr, state);
                return Err(AllocError::CorruptedBlock { addr });
            }
            None => unreachable!("validated blocks have a state"),
        }

        self.counters.live = self.counters.live.saturating_sub(1);
        self.counters.deallocated += 1;
        Ok(())
    }

    ////////////////////////////////////////////////////////////
    // Reallocation

    /// Resize an allocation, in place where possible.
    ///
    /// - `None` allocates.
    /// - A size of zero releases, and returns `Ok(None)`.
    /// - Growing first swallows free neighbours that directly follow the
    ///   block; if that is not enough, the data moves to a new allocation.
    /// - Shrinking splits off the tail as a free block when it is worth
    ///   keeping.
    ///
    /// On error, the original allocation is left valid.
    ///
    /// # Safety
    ///
    /// Same as [`release`](#method.release).
    pub unsafe fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let ptr = match ptr {
            None => return self.allocate(size),
            Some(ptr) => ptr,
        };
        if size == 0 {
            self.release(ptr)?;
            return Ok(None);
        }

        let mut block = self.block_for(ptr)?;
        match block.state().filter(|_| block.guard_intact()) {
            Some(BlockState::Used) => {}
            Some(BlockState::MappedLarge) => return self.reallocate_large(block, size).map(Some),
            state => {
                self.counters.errors += 1;
                warn!("reallocate({:?}): invalid block ({:?})", ptr, state);
                return Err(AllocError::CorruptedBlock {
                    addr: ptr.as_ptr() as usize,
                });
            }
        }

        let needed = aligned_size(size).ok_or(AllocError::ResourceExhaustion { requested: size })?;
        let old_size = block.size();

        if needed <= old_size {
            if self.worth_splitting(old_size, needed) {
                let remainder = self.chain.split(&mut block, needed);
                self.coalesce(remainder);
                trace!("reallocate({:?}, {}) shrank from {}", ptr, size, old_size);
            }
            return Ok(Some(ptr));
        }

        // Only absorb neighbours once they are known to be enough.
        let mut reach = old_size;
        let mut cursor = block;
        while reach < needed {
            match self.chain.free_successor(cursor) {
                Some(next) => {
                    reach += HEADER_SIZE + next.size();
                    cursor = next;
                }
                None => break,
            }
        }
        if reach >= needed {
            while block.size() < needed {
                let next = match self.chain.free_successor(block) {
                    Some(next) => next,
                    None => break,
                };
                self.counters.free_bytes -= next.size();
                self.chain.absorb_next(&mut block);
            }
            trace!(
                "reallocate({:?}, {}) grew in place to {}",
                ptr,
                size,
                block.size()
            );
            return Ok(Some(ptr));
        }

        let moved = match self.allocate(size)? {
            Some(moved) => moved,
            None => return Err(AllocError::ResourceExhaustion { requested: size }),
        };
        ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), old_size.min(needed));
        self.release(ptr)?;
        trace!("reallocate({:?}, {}) moved to {:?}", ptr, size, moved);
        Ok(Some(moved))
    }

    /// The payload capacity of a live allocation, or `None` if `ptr` does not
    /// lead to one.
    ///
    /// # Safety
    ///
    /// Same as [`release`](#method.release).
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        if ptr.as_ptr() as usize % ALIGN != 0 {
            return None;
        }
        let block = Block::from_payload(ptr);
        match block.state().filter(|_| block.guard_intact())? {
            BlockState::Used | BlockState::MappedLarge => Some(block.size()),
            BlockState::Free | BlockState::Corrupted => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    use crate::allocators::ToyHeap;
    use crate::config::LargeRealloc;

    const THRESHOLD: usize = 8 * 1024;

    fn pool() -> RawPool<ToyHeap> {
        RawPool::with_config(
            ToyHeap::default(),
            PoolConfig::new().with_large_threshold(THRESHOLD),
        )
    }

    fn alloc(pool: &mut RawPool<ToyHeap>, size: usize) -> NonNull<u8> {
        pool.allocate(size)
            .expect("allocation failed")
            .expect("non-zero allocations return a pointer")
    }

    fn validate(pool: &RawPool<ToyHeap>) {
        let (validity, stats) = pool.stats();
        let counters = pool.counters();
        log::info!("{}", pool.chain());
        assert!(validity.is_valid(), "{:?}", validity);
        assert_eq!(counters.live, counters.allocated - counters.deallocated);
        assert_eq!(stats.free_bytes, counters.free_bytes);
        if stats.corrupted_blocks == 0 {
            assert_eq!(
                stats.free_bytes + stats.used_bytes + stats.header_bytes,
                counters.total_bytes
            );
        }
    }

    fn head_block(pool: &RawPool<ToyHeap>) -> Block {
        pool.chain().head().expect("arena is initialized")
    }

    #[test]
    fn test_zero_size() {
        let mut pool = pool();
        assert_eq!(pool.allocate(0), Ok(None));
        assert!(!pool.chain().is_initialized());
        assert_eq!(pool.counters(), Counters::default());
    }

    #[test]
    fn test_lazy_init_and_split() {
        let mut pool = pool();
        let p = alloc(&mut pool, 10);
        assert!(pool.chain().is_initialized());
        assert_eq!(pool.grower.size, pool.grower.page_size);

        let head = head_block(&pool);
        assert_eq!(head.payload(), p);
        assert_eq!(head.size(), ALIGN);
        let rest = pool.chain().next(head).unwrap();
        assert!(rest.is_free());
        assert_eq!(rest.size(), pool.grower.page_size - 2 * HEADER_SIZE - ALIGN);
        validate(&pool);
    }

    #[test]
    fn test_alignment() {
        let mut pool = pool();
        for size in (1..200).chain([THRESHOLD - 1, THRESHOLD, THRESHOLD + 3]) {
            let p = alloc(&mut pool, size);
            assert_eq!(p.as_ptr() as usize % ALIGN, 0, "size {}", size);
            assert_eq!(
                p.as_ptr() as usize % core::mem::size_of::<usize>(),
                0,
                "size {}",
                size
            );
        }
        validate(&pool);
    }

    #[test]
    fn test_coalescing_any_order() {
        const S: usize = 64;
        let orders: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];

        for order in orders.iter() {
            let mut pool = pool();
            let blocks = [
                alloc(&mut pool, S),
                alloc(&mut pool, S),
                alloc(&mut pool, S),
            ];
            // Keep the free tail of the page away from C.
            let fence = alloc(&mut pool, S);

            for &i in order.iter() {
                unsafe { pool.release(blocks[i]).unwrap() };
                validate(&pool);
            }

            let head = head_block(&pool);
            assert!(head.is_free());
            assert_eq!(head.size(), 3 * S + 2 * HEADER_SIZE, "order {:?}", order);
            assert_eq!(pool.chain().next(head).unwrap().payload(), fence);
        }
    }

    #[test]
    fn test_split_threshold() {
        let mut pool = pool();
        let big = alloc(&mut pool, 256);
        let _fence = alloc(&mut pool, 16);
        unsafe { pool.release(big).unwrap() };

        // 256 - 64 leaves room for a header and a minimum payload.
        let p = alloc(&mut pool, 64);
        assert_eq!(p, big);
        let head = head_block(&pool);
        assert_eq!(head.size(), 64);
        let remainder = pool.chain().next(head).unwrap();
        assert!(remainder.is_free());
        assert_eq!(remainder.size(), 256 - 64 - HEADER_SIZE);
        validate(&pool);

        unsafe { pool.release(p).unwrap() };
        assert_eq!(head_block(&pool).size(), 256);

        // 256 - 224 does not, so the whole block is handed out.
        let q = alloc(&mut pool, 224);
        assert_eq!(q, big);
        assert_eq!(unsafe { pool.usable_size(q) }, Some(256));
        validate(&pool);
    }

    #[test]
    fn test_first_fit_ordering() {
        let mut pool = pool();
        let hundred = alloc(&mut pool, 100);
        let _fence = alloc(&mut pool, 16);
        let ten = alloc(&mut pool, 10);
        let _fence2 = alloc(&mut pool, 16);

        unsafe {
            pool.release(hundred).unwrap();
            pool.release(ten).unwrap();
        }

        let p = alloc(&mut pool, 5);
        assert_eq!(p, hundred);
        validate(&pool);
    }

    #[test]
    fn test_growth_appends_tail() {
        let mut pool = pool();
        let page = pool.grower.page_size;
        let first = alloc(&mut pool, 2048);
        // Does not fit in what is left of the first page.
        let second = alloc(&mut pool, 3000);
        assert!(second.as_ptr() > first.as_ptr());
        assert_eq!(pool.grower.size, 2 * page);
        assert_eq!(pool.counters().total_bytes, 2 * page);

        let tail = pool.chain().tail().unwrap();
        assert!(tail.is_free());
        validate(&pool);
    }

    #[test]
    fn test_large_boundary() {
        let mut pool = pool();

        let large = alloc(&mut pool, THRESHOLD);
        assert_eq!(pool.grower.maps, 1);
        assert!(!pool.chain().is_initialized());
        let span = pool.mapped_span(THRESHOLD).unwrap();
        assert_eq!(pool.counters().mapped_bytes, span);
        assert_eq!(span % pool.grower.page_size, 0);

        let small = alloc(&mut pool, THRESHOLD - 1);
        assert_eq!(pool.grower.maps, 1);
        assert!(pool.chain().contains(small.as_ptr()));

        unsafe { pool.release(large).unwrap() };
        let header = large.as_ptr() as usize - HEADER_SIZE;
        assert_eq!(pool.grower.last_unmap, Some((header, span)));
        assert_eq!(pool.counters().mapped_bytes, 0);
        assert_eq!(pool.counters().mappings, 0);
        assert_eq!(pool.counters().live, 1);
        validate(&pool);
    }

    #[test]
    fn test_realloc_grow_in_place() {
        let mut pool = pool();
        let a = alloc(&mut pool, 16);
        let b = alloc(&mut pool, 64);
        let _fence = alloc(&mut pool, 16);
        unsafe { pool.release(b).unwrap() };

        let grown = unsafe { pool.reallocate(Some(a), 40).unwrap() };
        assert_eq!(grown, Some(a));
        let usable = unsafe { pool.usable_size(a) }.unwrap();
        assert!(usable >= 40);
        assert_eq!(usable, 16 + HEADER_SIZE + 64);
        validate(&pool);
    }

    #[test]
    fn test_realloc_fallback_copy() {
        let mut pool = pool();
        let a = alloc(&mut pool, 32);
        let _b = alloc(&mut pool, 32);
        unsafe {
            for i in 0..32 {
                *a.as_ptr().add(i) = i as u8;
            }
        }

        let moved = unsafe { pool.reallocate(Some(a), 200).unwrap().unwrap() };
        assert_ne!(moved, a);
        for i in 0..32 {
            assert_eq!(unsafe { *moved.as_ptr().add(i) }, i as u8);
        }
        assert!(head_block(&pool).is_free());

        // Shrinking copies nothing and keeps the pointer.
        let shrunk = unsafe { pool.reallocate(Some(moved), 8).unwrap().unwrap() };
        assert_eq!(shrunk, moved);
        for i in 0..8 {
            assert_eq!(unsafe { *shrunk.as_ptr().add(i) }, i as u8);
        }
        validate(&pool);
    }

    #[test]
    fn test_realloc_shrink() {
        let mut pool = pool();
        let a = alloc(&mut pool, 256);
        let _fence = alloc(&mut pool, 16);

        let same = unsafe { pool.reallocate(Some(a), 64).unwrap() };
        assert_eq!(same, Some(a));
        assert_eq!(unsafe { pool.usable_size(a) }, Some(64));
        let remainder = pool.chain().next(head_block(&pool)).unwrap();
        assert!(remainder.is_free());
        assert_eq!(remainder.size(), 256 - 64 - HEADER_SIZE);

        // Too little to split off: the block keeps its size.
        let same = unsafe { pool.reallocate(Some(a), 48).unwrap() };
        assert_eq!(same, Some(a));
        assert_eq!(unsafe { pool.usable_size(a) }, Some(64));

        let same = unsafe { pool.reallocate(Some(a), 64).unwrap() };
        assert_eq!(same, Some(a));
        validate(&pool);
    }

    #[test]
    fn test_realloc_shrink_merges_remainder() {
        let mut pool = pool();
        let a = alloc(&mut pool, 256);
        let b = alloc(&mut pool, 64);
        let _fence = alloc(&mut pool, 16);
        unsafe { pool.release(b).unwrap() };

        unsafe { pool.reallocate(Some(a), 64).unwrap() };
        let remainder = pool.chain().next(head_block(&pool)).unwrap();
        assert_eq!(remainder.size(), (256 - 64 - HEADER_SIZE) + HEADER_SIZE + 64);
        validate(&pool);
    }

    #[test]
    fn test_realloc_edge_cases() {
        let mut pool = pool();

        let p = unsafe { pool.reallocate(None, 24).unwrap().unwrap() };
        assert_eq!(pool.counters().allocated, 1);

        assert_eq!(unsafe { pool.reallocate(Some(p), 0) }, Ok(None));
        assert_eq!(pool.counters().deallocated, 1);
        assert_eq!(pool.counters().live, 0);
        validate(&pool);
    }

    #[test]
    fn test_realloc_invalid_header() {
        let mut pool = pool();
        let p = alloc(&mut pool, 48);
        let mut block = unsafe { Block::from_payload(p) };
        unsafe { block.smash_guard() };

        let result = unsafe { pool.reallocate(Some(p), 96) };
        assert!(matches!(result, Err(AllocError::CorruptedBlock { .. })));
        assert_eq!(pool.counters().errors, 1);
        // Nothing was touched.
        assert_eq!(block.state(), Some(BlockState::Used));
        assert_eq!(block.size(), 48);
    }

    #[test]
    fn test_corruption_detection() {
        let mut pool = pool();
        let victim = alloc(&mut pool, 64);
        let _fence = alloc(&mut pool, 64);
        let mut block = unsafe { Block::from_payload(victim) };
        unsafe { block.smash_guard() };

        let result = unsafe { pool.release(victim) };
        assert!(matches!(result, Err(AllocError::CorruptedBlock { .. })));
        assert_eq!(pool.counters().errors, 1);
        assert_eq!(block.state(), Some(BlockState::Corrupted));
        validate(&pool);

        for _ in 0..64 {
            let p = alloc(&mut pool, 64);
            assert_ne!(p, victim);
        }
        assert_eq!(pool.counters().errors, 1);
        let (_, stats) = pool.stats();
        assert_eq!(stats.corrupted_blocks, 1);
    }

    #[test]
    fn test_double_free_refused() {
        let mut pool = pool();
        let a = alloc(&mut pool, 32);
        let _b = alloc(&mut pool, 32);

        unsafe { pool.release(a).unwrap() };
        let before = pool.counters();
        let result = unsafe { pool.release(a) };
        assert!(matches!(result, Err(AllocError::CorruptedBlock { .. })));

        let after = pool.counters();
        assert_eq!(after.errors, before.errors + 1);
        assert_eq!(after.deallocated, before.deallocated);
        assert_eq!(after.free_bytes, before.free_bytes);
        validate(&pool);
    }

    #[test]
    fn test_stale_pointer_after_merge() {
        let mut pool = pool();
        let a = alloc(&mut pool, 32);
        let b = alloc(&mut pool, 32);
        let c = alloc(&mut pool, 32);

        unsafe {
            pool.release(a).unwrap();
            pool.release(b).unwrap();
        }
        // b's header was swallowed by a, so it no longer validates.
        assert!(!unsafe { Block::from_payload(b) }.guard_intact());
        let before = pool.counters();
        assert!(unsafe { pool.release(b) }.is_err());
        let after = pool.counters();
        assert_eq!(after.errors, 1);
        assert_eq!(after.live, before.live);
        assert_eq!(after.deallocated, before.deallocated);
        assert_eq!(after.free_bytes, before.free_bytes);
        validate(&pool);

        // The merged block goes out again, with b's old header inside it.
        let reused = alloc(&mut pool, 80);
        assert_eq!(reused, a);
        let usable = unsafe { pool.usable_size(reused) }.unwrap();
        unsafe { reused.as_ptr().write_bytes(0x11, usable) };

        assert!(unsafe { pool.release(b) }.is_err());
        assert_eq!(pool.counters().errors, 2);
        for i in 0..usable {
            assert_eq!(unsafe { *reused.as_ptr().add(i) }, 0x11, "byte {}", i);
        }
        validate(&pool);

        unsafe {
            pool.release(c).unwrap();
            pool.release(reused).unwrap();
        }
        let counters = pool.counters();
        assert_eq!(counters.live, 0);
        assert_eq!(counters.allocated, counters.deallocated);
        validate(&pool);
    }

    #[test]
    fn test_misaligned_pointer_refused() {
        let mut pool = pool();
        let p = alloc(&mut pool, 32);
        let bad = unsafe { NonNull::new_unchecked(p.as_ptr().add(1)) };
        assert!(unsafe { pool.release(bad) }.is_err());
        assert_eq!(pool.counters().errors, 1);
        assert_eq!(unsafe { pool.usable_size(bad) }, None);
        validate(&pool);
    }

    #[test]
    fn test_large_realloc_relocates() {
        let mut pool = pool();
        let p = alloc(&mut pool, THRESHOLD + 100);
        unsafe {
            for i in 0..THRESHOLD {
                *p.as_ptr().add(i) = (i % 251) as u8;
            }
        }

        // Still large and still fits: stays put.
        let same = unsafe { pool.reallocate(Some(p), THRESHOLD).unwrap() };
        assert_eq!(same, Some(p));
        assert_eq!(pool.grower.maps, 1);

        let bigger = unsafe { pool.reallocate(Some(p), 3 * THRESHOLD).unwrap().unwrap() };
        assert_ne!(bigger, p);
        assert_eq!(pool.grower.unmaps, 1);
        for i in 0..THRESHOLD {
            assert_eq!(unsafe { *bigger.as_ptr().add(i) }, (i % 251) as u8);
        }

        // Small enough for the arena again.
        let small = unsafe { pool.reallocate(Some(bigger), 100).unwrap().unwrap() };
        assert!(pool.chain().contains(small.as_ptr()));
        assert_eq!(pool.counters().mappings, 0);
        for i in 0..100 {
            assert_eq!(unsafe { *small.as_ptr().add(i) }, (i % 251) as u8);
        }
        validate(&pool);
    }

    #[test]
    fn test_large_realloc_rejected() {
        let config = PoolConfig::new()
            .with_large_threshold(THRESHOLD)
            .with_large_realloc(LargeRealloc::Reject);
        let mut pool = RawPool::with_config(ToyHeap::default(), config);
        let p = alloc(&mut pool, THRESHOLD);
        let result = unsafe { pool.reallocate(Some(p), 2 * THRESHOLD) };
        assert_eq!(result, Err(AllocError::UnsupportedOperation));
        assert_eq!(unsafe { pool.usable_size(p) }, Some(THRESHOLD));
    }

    #[test]
    fn test_resource_exhaustion() {
        let heap = ToyHeap::new(8 * 1024, 16 * 1024, 4096);
        let mut pool = RawPool::with_config(heap, PoolConfig::new().with_large_threshold(THRESHOLD));

        let _a = alloc(&mut pool, 6000);
        let result = pool.allocate(6000);
        assert!(matches!(result, Err(AllocError::ResourceExhaustion { .. })));

        let _big = alloc(&mut pool, THRESHOLD);
        let result = pool.allocate(THRESHOLD);
        assert!(matches!(result, Err(AllocError::ResourceExhaustion { .. })));

        assert!(matches!(
            pool.allocate(usize::MAX),
            Err(AllocError::ResourceExhaustion { .. })
        ));
        assert_eq!(pool.counters().allocated, 2);
        validate(&pool);
    }

    #[test]
    fn test_failed_realloc_keeps_original() {
        let heap = ToyHeap::new(4096, 4096, 4096);
        let mut pool = RawPool::with_config(heap, PoolConfig::new().with_large_threshold(THRESHOLD));
        let a = alloc(&mut pool, 1024);
        let _b = alloc(&mut pool, 1024);
        unsafe { *a.as_ptr() = 7 };

        let result = unsafe { pool.reallocate(Some(a), 4000) };
        assert!(matches!(result, Err(AllocError::ResourceExhaustion { .. })));
        assert_eq!(unsafe { *a.as_ptr() }, 7);
        assert!(unsafe { pool.usable_size(a) }.is_some());
        validate(&pool);
    }

    #[test]
    fn test_failed_grow_keeps_neighbours_free() {
        let heap = ToyHeap::new(4096, 4096, 4096);
        let mut pool = RawPool::with_config(heap, PoolConfig::new().with_large_threshold(THRESHOLD));
        let a = alloc(&mut pool, 1024);
        let b = alloc(&mut pool, 512);
        let _c = alloc(&mut pool, 1024);
        unsafe { pool.release(b).unwrap() };
        let before = pool.counters();

        // a plus the free block after it is still short of 3000, and the heap
        // cannot grow.
        let result = unsafe { pool.reallocate(Some(a), 3000) };
        assert!(matches!(result, Err(AllocError::ResourceExhaustion { .. })));

        assert_eq!(unsafe { pool.usable_size(a) }, Some(1024));
        let next = pool.chain().next(head_block(&pool)).unwrap();
        assert!(next.is_free());
        assert_eq!(next.payload(), b);
        assert_eq!(next.size(), 512);
        assert_eq!(pool.counters().free_bytes, before.free_bytes);
        validate(&pool);
    }

    #[test]
    fn test_for_each_block() {
        let mut pool = pool();
        let _a = alloc(&mut pool, 32);
        let b = alloc(&mut pool, 32);
        let _c = alloc(&mut pool, 32);
        unsafe { pool.release(b).unwrap() };

        let mut states = Vec::new();
        pool.for_each_block(|info| states.push(info.state.unwrap()));
        assert_eq!(
            states,
            vec![
                BlockState::Used,
                BlockState::Free,
                BlockState::Used,
                BlockState::Free
            ]
        );

        let summary = pool.summary();
        assert!(summary.initialized);
        assert_eq!(summary.arena_end - summary.arena_start, pool.grower.page_size);
        assert_eq!(summary.counters.live, 2);
    }
}
