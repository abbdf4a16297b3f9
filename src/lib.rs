//! Executable-memory allocator for JIT code generators.
//!
//! `jitpool` hands out regions that are simultaneously executable at a
//! read+execute (RX) address and writable at a paired read+write (RW)
//! address, so freshly emitted machine code can be written and then executed
//! without ever violating a W^X (write-xor-execute) policy. Internally the
//! allocator manages large virtual-memory blocks, subdivides each block into
//! fixed-granularity slots tracked by bit vectors, and serves variable-size
//! allocations from these slots.
//!
//! ```no_run
//! use jitpool::JitAllocator;
//!
//! let allocator = JitAllocator::new(Default::default());
//! let (rx, rw) = allocator.alloc(64)?;
//!
//! unsafe {
//!     rw.write(0xC3); // ret
//! }
//! jitpool::flush_instruction_cache(rx, 64);
//!
//! allocator.release(rx)?;
//! # Ok::<(), jitpool::Error>(())
//! ```

use core::fmt;

pub mod allocator;
pub mod util;
pub mod virtual_memory;

/// Errors produced by the allocator and by the [virtual_memory] layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Error {
    /// The allocator was not properly constructed. Reserved for embeddings
    /// where construction can partially fail; the safe constructor aborts on
    /// heap exhaustion instead of producing a half-built allocator.
    NotInitialized,
    /// A null pointer, a zero size where one is disallowed, or a pointer
    /// that no live block owns.
    InvalidArgument,
    /// A pointer that is owned but does not address a live allocation
    /// (double release or stale), or a shrink target larger than the
    /// current allocation.
    InvalidState,
    /// The requested size exceeds the supported maximum.
    TooLarge,
    /// Mapping virtual memory failed, or block-size arithmetic overflowed.
    OutOfMemory,
    /// The process ran out of file descriptors while backing a dual mapping.
    TooManyHandles,
    /// No anonymous-memory backing could be opened for a dual mapping.
    FailedToOpenAnonymousMemory,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotInitialized => write!(f, "allocator is not initialized"),
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::InvalidState => write!(f, "invalid state"),
            Error::TooLarge => write!(f, "requested size is too large"),
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::TooManyHandles => write!(f, "too many open handles"),
            Error::FailedToOpenAnonymousMemory => {
                write!(f, "failed to open anonymous memory")
            }
        }
    }
}

impl std::error::Error for Error {}

pub use allocator::{JitAllocator, JitAllocatorOptions, ResetPolicy, Statistics};
pub use virtual_memory::{
    flush_instruction_cache, protect_jit_memory, ProtectJitAccess, ProtectJitReadWriteScope,
};
