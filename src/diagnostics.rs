//! Read-only views of a pool, for logs and for tests.
//!
//! Nothing here feeds back into allocation decisions.

use core::fmt;

use crate::block::BlockState;

/// Aggregate counters kept by a pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    /// Allocations handed out and not yet released.
    pub live: usize,
    /// Cumulative successful allocations, arena and mapped.
    pub allocated: usize,
    /// Cumulative releases, including releases of corrupted blocks.
    pub deallocated: usize,
    /// Corrupted blocks found and invalid releases refused.
    pub errors: usize,
    /// Bytes obtained from the OS for the arena, headers included.
    pub total_bytes: usize,
    /// Payload bytes of free arena blocks.
    pub free_bytes: usize,
    /// Bytes currently held in dedicated mappings.
    pub mapped_bytes: usize,
    /// Number of dedicated mappings currently alive.
    pub mappings: usize,
}

/// A snapshot of the pool counters and arena bounds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub counters: Counters,
    pub arena_start: usize,
    pub arena_end: usize,
    pub initialized: bool,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counters;
        writeln!(f, "pool summary:")?;
        if self.initialized {
            writeln!(
                f,
                "  arena:       {:#x}..{:#x}",
                self.arena_start, self.arena_end
            )?;
        } else {
            writeln!(f, "  arena:       uninitialized")?;
        }
        writeln!(f, "  live:        {}", c.live)?;
        writeln!(f, "  allocated:   {}", c.allocated)?;
        writeln!(f, "  deallocated: {}", c.deallocated)?;
        writeln!(f, "  errors:      {}", c.errors)?;
        writeln!(f, "  total bytes: {}", c.total_bytes)?;
        writeln!(f, "  free bytes:  {}", c.free_bytes)?;
        write!(f, "  mapped:      {} bytes in {} regions", c.mapped_bytes, c.mappings)
    }
}

/// Everything the chain knows about one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub addr: usize,
    /// Offset of the header from the start of the arena.
    pub offset: usize,
    pub size: usize,
    pub prev: Option<usize>,
    pub next: Option<usize>,
    /// `None` if the stored state does not decode.
    pub state: Option<BlockState>,
    pub guard_intact: bool,
}

fn link(f: &mut fmt::Formatter<'_>, offset: Option<usize>) -> fmt::Result {
    match offset {
        Some(offset) => write!(f, "+{:#x}", offset),
        None => write!(f, "-"),
    }
}

impl fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x} (+{:#x}) size={} prev=", self.addr, self.offset, self.size)?;
        link(f, self.prev)?;
        write!(f, " next=")?;
        link(f, self.next)?;
        match self.state {
            Some(state) => write!(f, " {}", state)?,
            None => write!(f, " ???")?,
        }
        if !self.guard_intact {
            write!(f, " [bad guard]")?;
        }
        Ok(())
    }
}
