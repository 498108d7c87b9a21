//! A first-fit heap allocator built directly on the program break and
//! anonymous mappings.
//!
//! Every block in the arena, free or in use, carries a header and sits in one
//! address-ordered chain. Allocation walks the chain for the first free block
//! that fits, splitting off whatever is left over; release merges the block
//! with any free neighbour straight away. Requests at or above a configurable
//! threshold bypass the arena and get a mapping of their own.
//!
//! Each header carries a guard value, and a pointer whose header does not
//! check out is refused and counted instead of corrupting the chain further.
//!
//! The main types are:
//!
//! - [`RawPool`](pool/struct.RawPool.html): the single-threaded engine.
//! - [`GenericAllocator`](allocators/struct.GenericAllocator.html): a pool
//!   behind a spin lock, with the error policy and diagnostics.
//! - [`UnixAllocator`](allocators/struct.UnixAllocator.html): the same on top
//!   of `sbrk` and `mmap`, usable as `#[global_allocator]`.
//! - [`ToyHeap`](allocators/struct.ToyHeap.html): a fake OS for tests.

pub mod allocators;
mod array;
pub mod block;
pub mod config;
pub mod diagnostics;
pub mod error;
mod large;
pub mod pool;
pub mod unix;

pub use allocators::{GenericAllocator, HeapGrower, ToyHeap, UnixAllocator};
pub use block::{BlockState, ALIGN, HEADER_SIZE};
pub use config::{LargeRealloc, PoolConfig};
pub use diagnostics::{BlockInfo, Counters, Summary};
pub use error::AllocError;
pub use pool::RawPool;
pub use unix::UnixHeapGrower;

// Round up value to the nearest multiple of increment
pub(crate) fn round_up(value: usize, increment: usize) -> usize {
    if value == 0 {
        return 0;
    }
    increment * ((value - 1) / increment + 1)
}
