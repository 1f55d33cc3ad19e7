//! Sizing parameters for a [`RingBuffer`](crate::RingBuffer).

use crate::error::{Result, RingBufferError};

/// Capacity and overwrite slack for a ring buffer.
///
/// `capacity` is the usable size the client asked for. `extra_bytes` is added
/// on top before rounding to a power of two, so that overwriting writes
/// (`prevent_overflow == false`) have room to land without immediately
/// clobbering bytes a reader is still copying out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RingBufferConfig {
    /// Usable capacity in bytes
    pub capacity: usize,
    /// Slack added before rounding up the backing size
    #[cfg_attr(feature = "serde", serde(default))]
    pub extra_bytes: usize,
}

impl RingBufferConfig {
    /// Config with the given capacity and no slack
    pub const fn new(capacity: usize) -> Self {
        Self {
            capacity,
            extra_bytes: 0,
        }
    }

    /// Set the overwrite slack
    #[must_use]
    pub const fn with_extra_bytes(mut self, extra_bytes: usize) -> Self {
        self.extra_bytes = extra_bytes;
        self
    }

    /// Size a buffer in audio frames.
    ///
    /// Device glue thinks in frames: `frames` is the client-visible buffer
    /// length and `slack_frames` is usually one hardware period.
    pub fn for_frames(frame_size: usize, frames: usize, slack_frames: usize) -> Result<Self> {
        let capacity = frame_size
            .checked_mul(frames)
            .ok_or(RingBufferError::CapacityOverflow {
                capacity: usize::MAX,
                extra_bytes: 0,
            })?;
        let extra_bytes = frame_size
            .checked_mul(slack_frames)
            .ok_or(RingBufferError::CapacityOverflow {
                capacity,
                extra_bytes: usize::MAX,
            })?;
        let config = Self {
            capacity,
            extra_bytes,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the config without allocating.
    ///
    /// Returns the errors [`RingBuffer::allocate`](crate::RingBuffer::allocate)
    /// would return for the same sizes, short of the allocator itself failing.
    pub fn validate(&self) -> Result<()> {
        self.allocated_size().map(|_| ())
    }

    /// Backing size this config allocates: the next power of two at or
    /// above `capacity + extra_bytes`.
    pub fn allocated_size(&self) -> Result<usize> {
        allocated_size_for(self.capacity, self.extra_bytes)
    }
}

pub(crate) fn allocated_size_for(capacity: usize, extra_bytes: usize) -> Result<usize> {
    if capacity == 0 {
        return Err(RingBufferError::ZeroCapacity);
    }
    let overflow = RingBufferError::CapacityOverflow {
        capacity,
        extra_bytes,
    };
    let wanted = capacity.checked_add(extra_bytes).ok_or(overflow)?;
    let size = wanted.checked_next_power_of_two().ok_or(overflow)?;
    // Layout requires size <= isize::MAX
    if size > isize::MAX as usize {
        return Err(overflow);
    }
    Ok(size)
}
