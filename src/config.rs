//! Tunables for a [`RawPool`](../pool/struct.RawPool.html).
//!
//! Everything here is `const`-constructible, so that a `static` allocator can
//! carry its configuration without running any code first.

use crate::block::ALIGN;

/// What to do when asked to resize a block that lives in its own mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LargeRealloc {
    /// Keep the mapping if the new size still fits and is still large;
    /// otherwise allocate, copy, and unmap the old region.
    Relocate,
    /// Refuse with [`AllocError::UnsupportedOperation`](../error/enum.AllocError.html),
    /// which the front ends treat as fatal.
    Reject,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Requests of at least this many bytes bypass the arena and get a
    /// dedicated mapping.
    pub large_threshold: usize,
    /// The smallest payload worth splitting off as its own free block.
    pub min_payload: usize,
    pub large_realloc: LargeRealloc,
}

impl PoolConfig {
    pub const DEFAULT: PoolConfig = PoolConfig {
        large_threshold: 128 * 1024,
        min_payload: ALIGN,
        large_realloc: LargeRealloc::Relocate,
    };

    pub const fn new() -> Self {
        Self::DEFAULT
    }

    pub const fn with_large_threshold(mut self, threshold: usize) -> Self {
        self.large_threshold = threshold;
        self
    }

    pub const fn with_min_payload(mut self, min_payload: usize) -> Self {
        self.min_payload = min_payload;
        self
    }

    pub const fn with_large_realloc(mut self, policy: LargeRealloc) -> Self {
        self.large_realloc = policy;
        self
    }

    /// The configuration actually used by a pool: `min_payload` is rounded up
    /// to the alignment and is never zero, and the threshold is at least one.
    pub(crate) fn normalized(self) -> Self {
        let min_payload = crate::round_up(self.min_payload.max(1), ALIGN);
        PoolConfig {
            large_threshold: self.large_threshold.max(1),
            min_payload,
            large_realloc: self.large_realloc,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized() {
        let config = PoolConfig::new()
            .with_min_payload(0)
            .with_large_threshold(0)
            .normalized();
        assert_eq!(config.min_payload, ALIGN);
        assert_eq!(config.large_threshold, 1);

        let config = PoolConfig::new().with_min_payload(17).normalized();
        assert_eq!(config.min_payload, 2 * ALIGN);
        assert_eq!(config.large_realloc, LargeRealloc::Relocate);
    }
}
