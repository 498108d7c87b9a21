use core::fmt;

/// Everything that can go wrong inside a [`RawPool`](../pool/struct.RawPool.html).
///
/// Whether a failure is survivable is decided by [`is_fatal`](#method.is_fatal);
/// the locked front ends terminate the process on fatal errors, and only count
/// the others.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// The OS refused to grow the arena or to create a mapping, or the
    /// request was too large to represent.
    ResourceExhaustion { requested: usize },
    /// A released or reallocated pointer did not lead to a valid, live block
    /// header.
    CorruptedBlock { addr: usize },
    /// Reallocation of a mapped large block while the pool is configured
    /// with [`LargeRealloc::Reject`](../config/enum.LargeRealloc.html).
    UnsupportedOperation,
}

impl AllocError {
    pub fn is_fatal(&self) -> bool {
        match self {
            AllocError::ResourceExhaustion { .. } | AllocError::UnsupportedOperation => true,
            AllocError::CorruptedBlock { .. } => false,
        }
    }

    /// A fixed diagnostic line, usable where formatting is not.
    pub fn message(&self) -> &'static str {
        match self {
            AllocError::ResourceExhaustion { .. } => {
                "chain_allocator: out of memory, the OS refused to grow the heap\n"
            }
            AllocError::CorruptedBlock { .. } => "chain_allocator: corrupted block header\n",
            AllocError::UnsupportedOperation => {
                "chain_allocator: reallocation of a mapped block is not supported\n"
            }
        }
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::ResourceExhaustion { requested } => {
                write!(f, "resource exhaustion while requesting {} bytes", requested)
            }
            AllocError::CorruptedBlock { addr } => {
                write!(f, "corrupted block header for payload {:#x}", addr)
            }
            AllocError::UnsupportedOperation => {
                write!(f, "reallocation of a mapped large block is unsupported")
            }
        }
    }
}
