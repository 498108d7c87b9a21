use core::fmt;
use core::ops::Range;
use core::ptr::{null_mut, NonNull};

use static_assertions::const_assert;

use crate::diagnostics::BlockInfo;

/// Every payload starts on a multiple of this, and every payload size is a
/// multiple of this.
pub const ALIGN: usize = 16;

/// The value every intact header carries in its `guard` field.
pub const GUARD: u32 = 0xB10C_C4A1;

/// Link value meaning "no block".
pub(crate) const NIL: usize = usize::MAX;

/// The header in front of every payload.
///
/// `next` and `prev` are byte offsets from the start of the arena, not
/// addresses, so the links stay meaningful regardless of where the arena was
/// placed. Blocks in their own mapping keep both links at `NIL`.
///
/// We use C representation and align to 16 bytes, so that the payload right
/// after the header is aligned as well.
#[repr(C, align(16))]
pub struct BlockHeader {
    size: usize,
    next: usize,
    prev: usize,
    state: u32,
    guard: u32,
}

pub const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();
const_assert!(HEADER_SIZE % ALIGN == 0);
const_assert!(ALIGN >= core::mem::size_of::<usize>());
const_assert!(ALIGN.is_power_of_two());

/// The state of a block.
///
/// Stored in the header as a distinctive 32-bit code; anything that does not
/// decode to one of these is treated the same way as a broken guard.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum BlockState {
    Free = 0x4652_4545,
    Used = 0x5553_4544,
    /// Failed validation once; never handed out or merged again.
    Corrupted = 0x4241_4421,
    /// Lives in its own anonymous mapping, outside the chain.
    MappedLarge = 0x4D41_5050,
}

impl BlockState {
    fn decode(raw: u32) -> Option<BlockState> {
        match raw {
            0x4652_4545 => Some(BlockState::Free),
            0x5553_4544 => Some(BlockState::Used),
            0x4241_4421 => Some(BlockState::Corrupted),
            0x4D41_5050 => Some(BlockState::MappedLarge),
            _ => None,
        }
    }
}

impl fmt::Display for BlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlockState::Free => "Free",
            BlockState::Used => "Used",
            BlockState::Corrupted => "Corrupted",
            BlockState::MappedLarge => "MappedLarge",
        };
        f.write_str(name)
    }
}

/// A handle on a block header somewhere in memory.
///
/// This is a thin wrapper around a pointer; copying it does not copy the
/// block. All reads go straight to the header in memory.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Block {
    header: NonNull<BlockHeader>,
}

impl Block {
    /// Write a fresh, unlinked header at `at`.
    ///
    /// # Safety
    ///
    /// `at` must be aligned to `ALIGN` and point to at least
    /// `HEADER_SIZE + size` bytes owned by the allocator.
    pub(crate) unsafe fn write(at: NonNull<u8>, size: usize, state: BlockState) -> Block {
        let header = BlockHeader {
            size,
            next: NIL,
            prev: NIL,
            state: state as u32,
            guard: GUARD,
        };
        let raw: NonNull<BlockHeader> = at.cast();
        core::ptr::write(raw.as_ptr(), header);
        Block { header: raw }
    }

    /// Find the header belonging to a payload pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be aligned to `ALIGN` and have `HEADER_SIZE` readable bytes
    /// in front of it. Nothing about the header found there is assumed; check
    /// [`is_valid`](#method.is_valid) before trusting it.
    pub unsafe fn from_payload(ptr: NonNull<u8>) -> Block {
        let header = ptr.as_ptr().sub(HEADER_SIZE) as *mut BlockHeader;
        Block {
            header: NonNull::new_unchecked(header),
        }
    }

    pub fn addr(&self) -> *mut u8 {
        self.header.as_ptr() as *mut u8
    }

    pub fn payload(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.addr().add(HEADER_SIZE)) }
    }

    /// One past the last payload byte.
    pub fn end(&self) -> *mut u8 {
        self.addr().wrapping_add(HEADER_SIZE).wrapping_add(self.size())
    }

    /// Payload size in bytes, excluding the header.
    pub fn size(&self) -> usize {
        self.header_view().size
    }

    pub fn state(&self) -> Option<BlockState> {
        BlockState::decode(self.header_view().state)
    }

    pub fn is_free(&self) -> bool {
        self.state() == Some(BlockState::Free)
    }

    pub fn guard_intact(&self) -> bool {
        self.header_view().guard == GUARD
    }

    /// The guard matches and the state decodes.
    pub fn is_valid(&self) -> bool {
        self.guard_intact() && self.state().is_some()
    }

    /// Whether `other` starts exactly where this block ends.
    pub fn is_adjacent_to(&self, other: &Block) -> bool {
        self.end() == other.addr()
    }

    fn header_view(&self) -> &BlockHeader {
        unsafe { self.header.as_ref() }
    }

    /// # Safety
    ///
    /// Allows modifying the size or links of a block in safe code, which could
    /// lead to corruption.
    unsafe fn header_mut(&mut self) -> &mut BlockHeader {
        self.header.as_mut()
    }

    /// # Safety
    ///
    /// The header must be owned by the allocator.
    pub(crate) unsafe fn set_state(&mut self, state: BlockState) {
        self.header_mut().state = state as u32;
    }

    /// Wipe the guard and state of a header that is about to become payload
    /// of a neighbour, so stale pointers to it fail validation.
    unsafe fn scrub(&mut self) {
        let header = self.header_mut();
        header.guard = 0;
        header.state = 0;
    }

    #[cfg(test)]
    pub(crate) unsafe fn smash_guard(&mut self) {
        self.header_mut().guard = !GUARD;
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state() {
            Some(state) => write!(f, "{}({:?}, {})", state, self.header, self.size()),
            None => write!(f, "Invalid({:?})", self.header),
        }
    }
}

/// The address-ordered chain of every block in the arena, free or not.
///
/// It maintains a few internal invariants:
///
/// - The first block sits at the start of the arena, at offset 0.
/// - Each block links to the next with a strictly greater offset, and back to
///   the previous one; the last block links to `NIL`.
/// - Blocks never overlap. Neighbours are usually adjacent, but may be
///   separated by a gap if the arena grew non-contiguously; only adjacent
///   blocks are ever merged.
pub struct Chain {
    base: *mut u8,
    end: *mut u8,
    tail: usize,
}

// The chain is only ever touched by whoever holds the pool, which owns all of
// the memory it points into.
unsafe impl Send for Chain {}

impl Default for Chain {
    fn default() -> Self {
        Chain::new()
    }
}

impl Chain {
    pub const fn new() -> Self {
        Chain {
            base: null_mut(),
            end: null_mut(),
            tail: NIL,
        }
    }

    pub fn is_initialized(&self) -> bool {
        !self.base.is_null()
    }

    /// The address range currently managed by the arena.
    pub fn bounds(&self) -> Range<*const u8> {
        (self.base as *const u8)..(self.end as *const u8)
    }

    pub fn end(&self) -> *mut u8 {
        self.end
    }

    pub fn contains(&self, ptr: *const u8) -> bool {
        self.bounds().contains(&ptr)
    }

    /// Whether `block` is linked into the chain, as opposed to a stray or
    /// absorbed header that merely lies inside the arena.
    pub fn holds(&self, block: Block) -> bool {
        self.contains(block.addr()) && self.iter().any(|linked| linked.addr() == block.addr())
    }

    pub fn offset_of(&self, block: Block) -> usize {
        block.addr() as usize - self.base as usize
    }

    fn block_at(&self, offset: usize) -> Option<Block> {
        if offset == NIL || !self.is_initialized() || offset % ALIGN != 0 {
            return None;
        }
        let limit = self.end as usize - self.base as usize;
        if offset.checked_add(HEADER_SIZE)? > limit {
            return None;
        }
        let header = NonNull::new(self.base.wrapping_add(offset) as *mut BlockHeader)?;
        Some(Block { header })
    }

    pub fn head(&self) -> Option<Block> {
        self.block_at(0)
    }

    pub fn tail(&self) -> Option<Block> {
        self.block_at(self.tail)
    }

    /// The structural successor of `block`, if its link is sane.
    pub fn next(&self, block: Block) -> Option<Block> {
        let next = self.block_at(block.header_view().next)?;
        if next.addr() <= block.addr() {
            return None;
        }
        Some(next)
    }

    /// The structural predecessor of `block`, if its link is sane.
    pub fn prev(&self, block: Block) -> Option<Block> {
        let prev = self.block_at(block.header_view().prev)?;
        if prev.addr() >= block.addr() {
            return None;
        }
        Some(prev)
    }

    /// The successor, if it is free and directly adjacent.
    pub fn free_successor(&self, block: Block) -> Option<Block> {
        self.next(block)
            .filter(|next| next.is_free() && block.is_adjacent_to(next))
    }

    /// The predecessor, if it is free and directly adjacent.
    pub fn free_predecessor(&self, block: Block) -> Option<Block> {
        self.prev(block)
            .filter(|prev| prev.is_free() && prev.is_adjacent_to(&block))
    }

    /// Start the chain with a single free block covering `[start, start + len)`.
    ///
    /// # Safety
    ///
    /// `start` must be aligned to `ALIGN`, and the region must be owned by the
    /// caller and at least `HEADER_SIZE` long.
    pub(crate) unsafe fn init(&mut self, start: NonNull<u8>, len: usize) -> Block {
        debug_assert!(!self.is_initialized());
        self.base = start.as_ptr();
        self.end = start.as_ptr().add(len);
        self.tail = 0;
        Block::write(start, len - HEADER_SIZE, BlockState::Free)
    }

    /// Append a block covering `[start, start + len)` as the new tail.
    ///
    /// # Safety
    ///
    /// Same as [`init`](#method.init), and `start` must not lie below the
    /// current end of the arena.
    pub(crate) unsafe fn append(
        &mut self,
        start: NonNull<u8>,
        len: usize,
        state: BlockState,
    ) -> Block {
        debug_assert!(start.as_ptr() >= self.end);
        let mut block = Block::write(start, len - HEADER_SIZE, state);
        let offset = self.offset_of(block);
        if let Some(mut tail) = self.tail() {
            tail.header_mut().next = offset;
            block.header_mut().prev = self.tail;
        }
        self.end = start.as_ptr().add(len);
        self.tail = offset;
        block
    }

    /// Shrink `block` to `size` bytes of payload, and turn the space freed at
    /// its end into a new free block linked right after it.
    ///
    /// # Safety
    ///
    /// `size` must be a multiple of `ALIGN`, and `block.size()` must be at
    /// least `size + HEADER_SIZE`.
    pub(crate) unsafe fn split(&mut self, block: &mut Block, size: usize) -> Block {
        debug_assert!(block.size() >= size + HEADER_SIZE);
        let remainder_size = block.size() - size - HEADER_SIZE;
        let at = NonNull::new_unchecked(block.payload().as_ptr().add(size));
        let mut remainder = Block::write(at, remainder_size, BlockState::Free);

        let own = self.offset_of(*block);
        let offset = self.offset_of(remainder);
        let old_next = block.header_view().next;

        remainder.header_mut().prev = own;
        remainder.header_mut().next = old_next;
        if let Some(mut next) = self.block_at(old_next) {
            next.header_mut().prev = offset;
        }
        let header = block.header_mut();
        header.next = offset;
        header.size = size;

        if self.tail == own {
            self.tail = offset;
        }
        remainder
    }

    /// Merge the successor of `block` into it, header included, returning the
    /// payload size that was absorbed. Returns `None` if there is no
    /// successor.
    ///
    /// # Safety
    ///
    /// The successor must be adjacent to `block` and not in use.
    pub(crate) unsafe fn absorb_next(&mut self, block: &mut Block) -> Option<usize> {
        let mut next = self.next(*block)?;
        debug_assert!(block.is_adjacent_to(&next));

        let absorbed = next.size();
        let after = next.header_view().next;
        let own = self.offset_of(*block);

        let header = block.header_mut();
        header.size += HEADER_SIZE + absorbed;
        header.next = after;
        if let Some(mut after) = self.block_at(after) {
            after.header_mut().prev = own;
        }
        if self.tail == self.offset_of(next) {
            self.tail = own;
        }
        next.scrub();
        Some(absorbed)
    }

    pub fn iter(&self) -> ChainIter<'_> {
        ChainIter {
            chain: self,
            next: self.head(),
        }
    }

    pub fn info(&self, block: Block) -> BlockInfo {
        let link = |offset: usize| self.block_at(offset).map(|_| offset);
        BlockInfo {
            addr: block.addr() as usize,
            offset: self.offset_of(block),
            size: block.size(),
            prev: link(block.header_view().prev),
            next: link(block.header_view().next),
            state: block.state(),
            guard_intact: block.guard_intact(),
        }
    }

    /// Walk the chain, checking its structure and tallying blocks.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity: Validity = Default::default();
        let mut stats: Stats = Default::default();

        let mut previous: Option<Block> = None;
        for block in self.iter() {
            match previous {
                Some(prev) => {
                    if block.header_view().prev != self.offset_of(prev) {
                        validity.broken_links += 1;
                    }
                    if prev.end() > block.addr() {
                        validity.overlaps += 1;
                    }
                    if prev.is_free() && block.is_free() && prev.is_adjacent_to(&block) {
                        validity.adjacent_frees += 1;
                    }
                }
                None => {
                    if block.header_view().prev != NIL {
                        validity.broken_links += 1;
                    }
                }
            }

            match block.state() {
                Some(BlockState::Free) => {
                    stats.free_blocks += 1;
                    stats.free_bytes += block.size();
                }
                Some(BlockState::Used) => {
                    stats.used_blocks += 1;
                    stats.used_bytes += block.size();
                }
                Some(BlockState::Corrupted) => stats.corrupted_blocks += 1,
                // Mapped blocks never belong in the chain.
                Some(BlockState::MappedLarge) | None => validity.guard_failures += 1,
            }
            if !block.guard_intact() && block.state() != Some(BlockState::Corrupted) {
                validity.guard_failures += 1;
            }

            stats.blocks += 1;
            stats.header_bytes += HEADER_SIZE;
            previous = Some(block);
        }

        if let Some(last) = previous {
            let next = last.header_view().next;
            if next != NIL {
                // The walk stopped early.
                if next <= self.offset_of(last) {
                    validity.out_of_orders += 1;
                } else {
                    validity.broken_links += 1;
                }
            } else if self.offset_of(last) != self.tail {
                validity.broken_links += 1;
            }
            if last.end() > self.end {
                validity.overlaps += 1;
            }
        }

        (validity, stats)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        !self.is_initialized()
    }
}

pub struct ChainIter<'chain> {
    chain: &'chain Chain,
    next: Option<Block>,
}

impl<'chain> Iterator for ChainIter<'chain> {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next.take()?;
        self.next = self.chain.next(block);
        Some(block)
    }
}

impl<'chain> IntoIterator for &'chain Chain {
    type Item = Block;
    type IntoIter = ChainIter<'chain>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chain(")?;
        let mut start = true;
        for block in self {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            match block.state() {
                Some(state) => write!(f, "{}(+{:#x}, {})", state, self.offset_of(block), block.size())?,
                None => write!(f, "Invalid(+{:#x})", self.offset_of(block))?,
            }
        }

        write!(f, ")")
    }
}

/// Validity contains a representation of all invalid states found in a
/// Chain.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    /// Number of blocks overlapping their predecessor, or the end of the
    /// arena.
    ///
    /// This likely indicates corruption.
    pub overlaps: usize,
    /// Number of times a forward link pointed backwards.
    pub out_of_orders: usize,
    /// Number of free blocks directly adjacent to another free block. Eager
    /// coalescing should make this impossible.
    pub adjacent_frees: usize,
    /// Back-links that do not match the forward links, forward links that go
    /// nowhere, and a tail that is not the last block.
    pub broken_links: usize,
    /// Blocks whose guard or state is bad but which were never marked
    /// corrupted.
    pub guard_failures: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.overlaps == 0
            && self.out_of_orders == 0
            && self.adjacent_frees == 0
            && self.broken_links == 0
            && self.guard_failures == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub blocks: usize,
    pub free_blocks: usize,
    pub used_blocks: usize,
    pub corrupted_blocks: usize,
    pub free_bytes: usize,
    pub used_bytes: usize,
    pub header_bytes: usize,
}
