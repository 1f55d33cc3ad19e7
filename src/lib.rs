//! # flushring - SPSC byte ring buffer with deferred flush
//!
//! A bounded byte buffer that decouples a real-time audio callback from a
//! client thread doing bulk reads or writes.
//!
//! ## Design
//!
//! - Power-of-two backing storage, sized `capacity + extra_bytes` rounded up
//! - One writer thread, one reader thread
//! - 64-bit logical positions that never wrap; only the physical offset does
//! - A short lock around counter updates, byte copies outside of it
//! - `write` and `read` never block: they clamp, overwrite, or return 0
//! - `flush` records a discard point that the reader applies on its next `read`
//!
//! ## Example
//!
//! ```
//! use flushring::RingBuffer;
//!
//! let rb = RingBuffer::with_capacity(16, 0).unwrap();
//!
//! // Producer side
//! assert_eq!(rb.write(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10], true), 10);
//!
//! // Consumer side
//! let mut buf = [0u8; 5];
//! assert_eq!(rb.read(&mut buf), 5);
//! assert_eq!(buf, [1, 2, 3, 4, 5]);
//!
//! // Drop what is left; the next read applies the flush and returns 0
//! assert_eq!(rb.flush(), 5);
//! assert_eq!(rb.read(&mut buf), 0);
//! ```

#![warn(missing_docs)]

mod config;
mod error;
mod ring_buffer;
mod split;

pub use config::RingBufferConfig;
pub use error::{Result, RingBufferError};
pub use ring_buffer::{RingBuffer, Statistics, STORAGE_ALIGN};
pub use split::{Consumer, OverflowPolicy, Producer};
