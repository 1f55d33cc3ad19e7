//! Producer and consumer halves of a [`RingBuffer`].
//!
//! Splitting moves the buffer behind an `Arc` and hands out exactly one
//! writer and one reader. Neither half is `Clone`, so the one-writer,
//! one-reader contract is enforced by the type system instead of by
//! convention. Typically one half goes to the audio callback thread and the
//! other stays with the client doing bulk I/O.

use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, RingBufferError};
use crate::ring_buffer::{RingBuffer, Statistics};

/// What a [`Producer`] does when the buffer has no room left
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Clamp writes to the free space, possibly writing nothing
    #[default]
    Reject,
    /// Take every byte and let the reader skip past overwritten data
    Overwrite,
}

impl OverflowPolicy {
    fn prevents_overflow(self) -> bool {
        matches!(self, OverflowPolicy::Reject)
    }
}

/// Writing half of a split [`RingBuffer`]
#[derive(Debug)]
pub struct Producer {
    buffer: Arc<RingBuffer>,
    policy: OverflowPolicy,
}

/// Reading half of a split [`RingBuffer`]
#[derive(Debug)]
pub struct Consumer {
    buffer: Arc<RingBuffer>,
}

impl RingBuffer {
    /// Split an allocated buffer into its producer and consumer halves.
    ///
    /// The producer starts with [`OverflowPolicy::Reject`].
    ///
    /// # Errors
    /// `NotAllocated` if the buffer has no backing storage.
    pub fn split(self) -> Result<(Producer, Consumer)> {
        if !self.is_allocated() {
            return Err(RingBufferError::NotAllocated);
        }
        debug!(capacity = self.buffer_size(), "ring buffer split");
        let buffer = Arc::new(self);
        Ok((
            Producer {
                buffer: Arc::clone(&buffer),
                policy: OverflowPolicy::default(),
            },
            Consumer { buffer },
        ))
    }
}

impl Producer {
    /// Switch the overflow policy
    #[must_use]
    pub fn with_policy(mut self, policy: OverflowPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Current overflow policy
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Write `src` under the current policy, returning bytes taken
    pub fn write(&mut self, src: &[u8]) -> usize {
        self.buffer.write(src, self.policy.prevents_overflow())
    }

    /// Space left before a rejecting write would be clamped
    pub fn free_space(&self) -> usize {
        self.buffer.buffer_size() - self.buffer.valid_byte_count()
    }

    /// Usable capacity of the underlying buffer
    pub fn buffer_size(&self) -> usize {
        self.buffer.buffer_size()
    }

    /// Unread bytes, see [`RingBuffer::valid_byte_count`]
    pub fn valid_byte_count(&self) -> usize {
        self.buffer.valid_byte_count()
    }

    /// Statistics of the underlying buffer
    pub fn statistics(&self) -> Statistics {
        self.buffer.statistics()
    }
}

impl Consumer {
    /// Read into `dst`, see [`RingBuffer::read`]
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        self.buffer.read(dst)
    }

    /// Discard unread data, see [`RingBuffer::flush`]
    pub fn flush(&self) -> usize {
        self.buffer.flush()
    }

    /// Usable capacity of the underlying buffer
    pub fn buffer_size(&self) -> usize {
        self.buffer.buffer_size()
    }

    /// Unread bytes, see [`RingBuffer::valid_byte_count`]
    pub fn valid_byte_count(&self) -> usize {
        self.buffer.valid_byte_count()
    }

    /// Statistics of the underlying buffer
    pub fn statistics(&self) -> Statistics {
        self.buffer.statistics()
    }
}
