use thiserror::Error;

/// Errors reported by [`RingBuffer`](crate::RingBuffer) setup.
///
/// Reads, writes and flushes never fail; they report how many bytes they
/// handled instead. Only allocation and handing out halves can go wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingBufferError {
    /// Requested capacity was zero
    #[error("ring buffer capacity must be greater than zero")]
    ZeroCapacity,

    /// `capacity + extra_bytes`, rounded up to a power of two, does not fit
    #[error("ring buffer size overflows: capacity {capacity} + extra {extra_bytes}")]
    CapacityOverflow {
        /// Requested usable capacity
        capacity: usize,
        /// Requested slack
        extra_bytes: usize,
    },

    /// The allocator could not provide the backing storage
    #[error("failed to allocate {size} bytes of ring buffer storage")]
    AllocationFailed {
        /// Backing size that was requested from the allocator
        size: usize,
    },

    /// The buffer has no backing storage yet
    #[error("ring buffer is not allocated")]
    NotAllocated,
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, RingBufferError>;
