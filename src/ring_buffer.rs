use std::alloc::Layout;
use std::ptr::{self, NonNull};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::{allocated_size_for, RingBufferConfig};
use crate::error::{Result, RingBufferError};

/// Alignment of the backing storage, one cache line
pub const STORAGE_ALIGN: usize = 64;

/// Counters describing what a ring buffer has done since it was allocated.
///
/// None of these are errors. They exist so device glue can report underruns
/// and overruns without the buffer having to fail any call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Total bytes accepted by `write`
    pub bytes_written: u64,
    /// Total bytes handed out by `read`
    pub bytes_read: u64,
    /// Reads that found the writer more than a capacity ahead
    pub overruns: u64,
    /// Unread bytes skipped because of overruns
    pub dropped_bytes: u64,
    /// Reads that found nothing to return
    pub underruns: u64,
    /// Overflow-protected writes that were shortened or refused
    pub clamped_writes: u64,
    /// Calls to `flush`
    pub flushes: u64,
    /// Reads thrown away because a flush was applied during the call
    pub discarded_reads: u64,
}

/// Shared counters, only ever touched under the state lock.
///
/// Positions are logical byte offsets that never wrap; only their projection
/// through the position mask does.
#[derive(Debug, Default)]
struct Cursors {
    write_pos: u64,
    read_pos: u64,
    /// Snapshot of `write_pos` taken by `flush`, applied by the next `read`
    flush_pos: Option<u64>,
    stats: Statistics,
}

impl Cursors {
    fn effective_read_pos(&self) -> u64 {
        self.flush_pos.unwrap_or(self.read_pos)
    }

    /// Unread bytes as the reader will see them, capped at `capacity`
    fn pending(&self, capacity: u64) -> u64 {
        self.write_pos
            .saturating_sub(self.effective_read_pos())
            .min(capacity)
    }

    /// First locked phase of a read: apply a pending flush, clamp overruns,
    /// and pick the range to copy. `None` means the read returns 0.
    fn begin_read(&mut self, capacity: u64, requested: usize) -> Option<(u64, usize)> {
        if let Some(flush_pos) = self.flush_pos.take() {
            trace!(flush_pos, read_pos = self.read_pos, "applying pending flush");
            self.read_pos = flush_pos;
            return None;
        }

        let mut available = self.write_pos - self.read_pos;
        if available > capacity {
            let dropped = available - capacity;
            self.read_pos = self.write_pos - capacity;
            self.stats.overruns += 1;
            self.stats.dropped_bytes += dropped;
            available = capacity;
            debug!(dropped, "reader fell behind, dropping oldest data");
        }

        let len = available.min(requested as u64) as usize;
        if len == 0 {
            if requested > 0 {
                self.stats.underruns += 1;
            }
            return None;
        }
        Some((self.read_pos, len))
    }

    /// Second locked phase of a read: publish the new read position, unless
    /// a flush landed while the bytes were being copied.
    fn finish_read(&mut self, read_pos: u64, len: usize) -> usize {
        if let Some(flush_pos) = self.flush_pos.take() {
            trace!(flush_pos, discarded = len, "flush landed during read");
            self.read_pos = flush_pos;
            self.stats.discarded_reads += 1;
            return 0;
        }
        self.read_pos = read_pos + len as u64;
        self.stats.bytes_read += len as u64;
        len
    }
}

/// Zeroed, cache-line aligned backing bytes
struct Storage {
    data: NonNull<u8>,
    size: usize,
}

impl Storage {
    fn allocate(size: usize) -> Result<Self> {
        let layout = Self::layout(size)?;
        // Safety: `size` is a power of two and never zero
        let data = unsafe { std::alloc::alloc_zeroed(layout) };
        let data = NonNull::new(data).ok_or(RingBufferError::AllocationFailed { size })?;
        Ok(Self { data, size })
    }

    fn layout(size: usize) -> Result<Layout> {
        Layout::from_size_align(size, STORAGE_ALIGN).map_err(|_| {
            RingBufferError::CapacityOverflow {
                capacity: size,
                extra_bytes: 0,
            }
        })
    }

    /// Copy `src` in starting at physical `offset`, wrapping at the end.
    ///
    /// # Safety
    /// No other thread may be accessing the destination range.
    unsafe fn copy_in(&self, offset: usize, src: &[u8]) {
        let (head, tail) = wrap_segments(self.size, offset, src.len());
        let base = self.data.as_ptr();
        ptr::copy_nonoverlapping(src.as_ptr(), base.add(offset), head);
        ptr::copy_nonoverlapping(src.as_ptr().add(head), base, tail);
    }

    /// Copy out into `dst` starting at physical `offset`, wrapping at the end.
    ///
    /// # Safety
    /// No other thread may be writing the source range.
    unsafe fn copy_out(&self, offset: usize, dst: &mut [u8]) {
        let (head, tail) = wrap_segments(self.size, offset, dst.len());
        let base = self.data.as_ptr();
        ptr::copy_nonoverlapping(base.add(offset), dst.as_mut_ptr(), head);
        ptr::copy_nonoverlapping(base, dst.as_mut_ptr().add(head), tail);
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Ok(layout) = Self::layout(self.size) {
            // Safety: allocated in `Storage::allocate` with this same layout
            unsafe { std::alloc::dealloc(self.data.as_ptr(), layout) };
        }
    }
}

/// Split a copy of `len` bytes at physical `offset` into the part that fits
/// before the end of a `size`-byte buffer and the part that wraps to 0.
///
/// `offset < size` and `len <= size` must hold.
pub(crate) fn wrap_segments(size: usize, offset: usize, len: usize) -> (usize, usize) {
    debug_assert!(offset < size && len <= size);
    let head = len.min(size - offset);
    (head, len - head)
}

/// Bounded byte ring buffer for one writer thread and one reader thread.
///
/// - Power-of-two backing storage addressed through 64-bit logical positions
/// - `write` and `read` never block and never fail; they clamp instead
/// - `flush` discards unread data lazily, on the reader's next `read`
/// - Counters are guarded by one short-held lock; byte copies happen outside it
///
/// A buffer starts out unallocated. Call [`allocate`](Self::allocate) (or build
/// it with [`with_capacity`](Self::with_capacity)) before moving data through it;
/// until then reads and writes move nothing.
pub struct RingBuffer {
    storage: Option<Storage>,
    /// Usable size requested by the client
    capacity: usize,
    pos_mask: u64,
    state: Mutex<Cursors>,
    /// Held by `write` for its whole call so writers cannot overlap
    writer: Mutex<()>,
    /// Held by `read` for its whole call so readers cannot overlap
    reader: Mutex<()>,
}

// Safety: the raw storage is only written by the single writer (serialised by
// `writer`) and only read by the single reader (serialised by `reader`).
// Positions are published under `state`. The writer stays out of the range
// being read except in overwrite mode, or once a flush moves the clamp point
// to `flush_pos` while a read is in flight; that read is discarded by its
// post-copy check under `state`.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("allocated_size", &self.allocated_size())
            .field("write_pos", &state.write_pos)
            .field("read_pos", &state.read_pos)
            .field("flush_pos", &state.flush_pos)
            .finish()
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RingBuffer {
    /// Create an empty, unallocated ring buffer
    pub fn new() -> Self {
        Self {
            storage: None,
            capacity: 0,
            pos_mask: 0,
            state: Mutex::new(Cursors::default()),
            writer: Mutex::new(()),
            reader: Mutex::new(()),
        }
    }

    /// Create and allocate in one step
    pub fn with_capacity(capacity: usize, extra_bytes: usize) -> Result<Self> {
        let mut rb = Self::new();
        rb.allocate(capacity, extra_bytes)?;
        Ok(rb)
    }

    /// Create and allocate from a [`RingBufferConfig`]
    pub fn from_config(config: &RingBufferConfig) -> Result<Self> {
        Self::with_capacity(config.capacity, config.extra_bytes)
    }

    /// Allocate backing storage.
    ///
    /// The backing size is the smallest power of two at or above
    /// `capacity + extra_bytes`; only `capacity` bytes are ever held unread.
    /// Any previous storage is released first and all positions and
    /// statistics start over from zero.
    ///
    /// # Errors
    /// * `ZeroCapacity` if `capacity` is 0
    /// * `CapacityOverflow` if the backing size cannot be represented
    /// * `AllocationFailed` if the allocator is out of memory
    pub fn allocate(&mut self, capacity: usize, extra_bytes: usize) -> Result<()> {
        let size = allocated_size_for(capacity, extra_bytes)?;
        self.deallocate();

        let storage = Storage::allocate(size)?;
        self.storage = Some(storage);
        self.capacity = capacity;
        self.pos_mask = size as u64 - 1;
        *self.state.get_mut() = Cursors::default();

        debug!(capacity, extra_bytes, allocated_size = size, "ring buffer allocated");
        Ok(())
    }

    /// Release backing storage. Does nothing if none is held.
    pub fn deallocate(&mut self) {
        if let Some(storage) = self.storage.take() {
            debug!(allocated_size = storage.size, "ring buffer deallocated");
        }
        self.capacity = 0;
        self.pos_mask = 0;
        *self.state.get_mut() = Cursors::default();
    }

    /// Whether backing storage is held
    pub fn is_allocated(&self) -> bool {
        self.storage.is_some()
    }

    /// Usable capacity requested at allocation, 0 when unallocated
    pub fn buffer_size(&self) -> usize {
        self.capacity
    }

    /// Power-of-two size of the backing storage, 0 when unallocated
    pub fn allocated_size(&self) -> usize {
        self.storage.as_ref().map_or(0, |s| s.size)
    }

    /// Bytes the reader can still get, never more than `buffer_size()`.
    ///
    /// A pending flush counts as already applied.
    pub fn valid_byte_count(&self) -> usize {
        self.state.lock().pending(self.capacity as u64) as usize
    }

    /// Whether `valid_byte_count()` is 0
    pub fn is_empty(&self) -> bool {
        self.valid_byte_count() == 0
    }

    /// Snapshot of the statistics counters
    pub fn statistics(&self) -> Statistics {
        self.state.lock().stats
    }

    /// Write as much of `src` as allowed and return how many bytes were taken.
    ///
    /// With `prevent_overflow` the write is clamped to the free space
    /// (`capacity - unread`), possibly to 0. Without it every byte is taken
    /// and unread data may be overwritten; the reader then skips ahead on its
    /// next `read`.
    pub fn write(&self, src: &[u8], prevent_overflow: bool) -> usize {
        let Some(storage) = self.storage.as_ref() else {
            return 0;
        };
        let _writer = self.writer.lock();

        let mut len = src.len();
        let write_pos = {
            let mut state = self.state.lock();
            if prevent_overflow {
                let unread = state.write_pos - state.effective_read_pos();
                let free = (self.capacity as u64).saturating_sub(unread);
                if len as u64 > free {
                    len = free as usize;
                    state.stats.clamped_writes += 1;
                }
            }
            state.write_pos
        };
        if len == 0 {
            return 0;
        }

        // Anything older than one backing size would be overwritten by this
        // same write, so only the tail is copied.
        let skip = len.saturating_sub(storage.size);
        let offset = ((write_pos + skip as u64) & self.pos_mask) as usize;
        // Safety: only this writer touches [write_pos, write_pos + len). It lies
        // outside the unread region, except in overwrite mode or while a flush
        // is pending: a reader may then still be copying those bytes, and it
        // throws that copy away in `finish_read` (flush) or accepts torn data
        // (overwrite).
        unsafe { storage.copy_in(offset, &src[skip..len]) };

        let mut state = self.state.lock();
        state.write_pos += len as u64;
        state.stats.bytes_written += len as u64;
        len
    }

    /// Read up to `dst.len()` unread bytes into `dst` and return how many.
    ///
    /// Returns 0 when nothing is available, and also when a flush was applied
    /// during this call: a flush pending on entry, or one that landed while
    /// bytes were being copied. In both cases `dst` holds nothing meaningful
    /// and the next call reads from the flush point.
    ///
    /// If the writer got more than a capacity ahead, the oldest bytes are
    /// skipped so that at most `buffer_size()` bytes remain.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        let Some(storage) = self.storage.as_ref() else {
            return 0;
        };
        let _reader = self.reader.lock();
        let capacity = self.capacity as u64;
        let Some((read_pos, len)) = self.state.lock().begin_read(capacity, dst.len()) else {
            return 0;
        };

        let offset = (read_pos & self.pos_mask) as usize;
        // Safety: [read_pos, read_pos + len) was published by the writer. It
        // can be rewritten under us only in overwrite mode, or after a flush
        // lands mid-copy; `finish_read` discards the result in that case.
        unsafe { storage.copy_out(offset, &mut dst[..len]) };

        self.state.lock().finish_read(read_pos, len)
    }

    /// Discard everything written so far and return how many unread bytes
    /// that was.
    ///
    /// The discard is recorded, not performed: the reader applies it on its
    /// next `read`, which returns 0. Calling it again just moves the flush
    /// point up to the current write position.
    pub fn flush(&self) -> usize {
        let mut state = self.state.lock();
        let pending = state.pending(self.capacity as u64);
        state.flush_pos = Some(state.write_pos);
        state.stats.flushes += 1;
        trace!(pending, write_pos = state.write_pos, "flush requested");
        pending as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn seq(start: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| start.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn test_new_is_unallocated() {
        let rb = RingBuffer::new();
        assert!(!rb.is_allocated());
        assert_eq!(rb.buffer_size(), 0);
        assert_eq!(rb.allocated_size(), 0);
        assert_eq!(rb.valid_byte_count(), 0);
        assert_eq!(rb.write(b"data", true), 0);
        assert_eq!(rb.write(b"data", false), 0);
        let mut out = [0u8; 4];
        assert_eq!(rb.read(&mut out), 0);
    }

    #[test]
    fn test_allocate_rounds_to_power_of_two() {
        let mut rb = RingBuffer::new();
        rb.allocate(100, 20).unwrap();
        assert_eq!(rb.buffer_size(), 100);
        assert_eq!(rb.allocated_size(), 128);

        rb.allocate(16, 0).unwrap();
        assert_eq!(rb.buffer_size(), 16);
        assert_eq!(rb.allocated_size(), 16);
    }

    #[test]
    fn test_allocate_zero_capacity() {
        let mut rb = RingBuffer::new();
        assert_eq!(rb.allocate(0, 0), Err(RingBufferError::ZeroCapacity));
        assert!(!rb.is_allocated());
    }

    #[test]
    fn test_allocate_overflow() {
        let mut rb = RingBuffer::new();
        assert!(matches!(
            rb.allocate(usize::MAX, 1),
            Err(RingBufferError::CapacityOverflow { .. })
        ));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_allocate_out_of_memory() {
        let mut rb = RingBuffer::new();
        let size = 1usize << 62;
        assert_eq!(
            rb.allocate(size, 0),
            Err(RingBufferError::AllocationFailed { size })
        );
        assert!(!rb.is_allocated());
    }

    #[test]
    fn test_reallocate_resets_positions() {
        let mut rb = RingBuffer::with_capacity(8, 0).unwrap();
        assert_eq!(rb.write(b"abc", true), 3);
        rb.allocate(32, 0).unwrap();
        assert_eq!(rb.valid_byte_count(), 0);
        assert_eq!(rb.statistics(), Statistics::default());
        assert_eq!(rb.buffer_size(), 32);
    }

    #[test]
    fn test_deallocate_idempotent() {
        let mut rb = RingBuffer::with_capacity(8, 0).unwrap();
        rb.write(b"abc", true);
        rb.deallocate();
        assert!(!rb.is_allocated());
        assert_eq!(rb.buffer_size(), 0);
        assert_eq!(rb.valid_byte_count(), 0);
        rb.deallocate();
        assert!(!rb.is_allocated());
    }

    #[test]
    fn test_wrap_segments() {
        assert_eq!(wrap_segments(16, 0, 16), (16, 0));
        assert_eq!(wrap_segments(16, 10, 4), (4, 0));
        assert_eq!(wrap_segments(16, 10, 6), (6, 0));
        assert_eq!(wrap_segments(16, 10, 8), (6, 2));
        assert_eq!(wrap_segments(16, 15, 16), (1, 15));
    }

    #[test]
    fn test_single_threaded_roundtrip() {
        let rb = RingBuffer::with_capacity(16, 0).unwrap();
        assert_eq!(rb.write(b"Hello, world!", true), 13);
        assert_eq!(rb.valid_byte_count(), 13);

        let mut out = [0u8; 32];
        assert_eq!(rb.read(&mut out), 13);
        assert_eq!(&out[..13], b"Hello, world!");
        assert!(rb.is_empty());
    }

    #[test]
    fn test_write_wraps_physically() {
        let rb = RingBuffer::with_capacity(16, 0).unwrap();
        let mut out = [0u8; 16];

        assert_eq!(rb.write(&seq(0, 12), true), 12);
        assert_eq!(rb.read(&mut out[..12]), 12);

        // Starts at physical offset 12 and straddles the end
        let data = seq(100, 10);
        assert_eq!(rb.write(&data, true), 10);
        assert_eq!(rb.read(&mut out), 10);
        assert_eq!(&out[..10], &data[..]);
    }

    #[test]
    fn test_prevent_overflow_clamps() {
        let rb = RingBuffer::with_capacity(10, 6).unwrap();
        assert_eq!(rb.allocated_size(), 16);

        assert_eq!(rb.write(&seq(0, 7), true), 7);
        assert_eq!(rb.write(&seq(7, 7), true), 3);
        assert_eq!(rb.write(&seq(10, 1), true), 0);
        assert_eq!(rb.valid_byte_count(), 10);
        assert_eq!(rb.statistics().clamped_writes, 2);

        let mut out = [0u8; 16];
        assert_eq!(rb.read(&mut out), 10);
        assert_eq!(&out[..10], &seq(0, 10)[..]);
    }

    #[test]
    fn test_overwrite_drops_oldest() {
        let rb = RingBuffer::with_capacity(8, 0).unwrap();
        assert_eq!(rb.write(&seq(1, 8), false), 8);
        assert_eq!(rb.write(&seq(9, 4), false), 4);
        assert_eq!(rb.valid_byte_count(), 8);

        let mut out = [0u8; 8];
        assert_eq!(rb.read(&mut out), 8);
        assert_eq!(out.to_vec(), seq(5, 8));

        let stats = rb.statistics();
        assert_eq!(stats.overruns, 1);
        assert_eq!(stats.dropped_bytes, 4);
    }

    #[test]
    fn test_overwrite_longer_than_storage() {
        let rb = RingBuffer::with_capacity(8, 0).unwrap();
        let data = seq(0, 21);
        assert_eq!(rb.write(&data, false), 21);

        let mut out = [0u8; 8];
        assert_eq!(rb.read(&mut out), 8);
        assert_eq!(&out[..], &data[13..]);
    }

    #[test]
    fn test_empty_read_is_underrun() {
        let rb = RingBuffer::with_capacity(8, 0).unwrap();
        let mut out = [0u8; 4];
        assert_eq!(rb.read(&mut out), 0);
        assert_eq!(rb.read(&mut []), 0);
        assert_eq!(rb.statistics().underruns, 1);
    }

    #[test]
    fn test_flush_is_deferred_to_next_read() {
        let rb = RingBuffer::with_capacity(16, 0).unwrap();
        assert_eq!(rb.write(&seq(0, 6), true), 6);
        assert_eq!(rb.flush(), 6);
        assert_eq!(rb.valid_byte_count(), 0);

        assert_eq!(rb.write(&seq(50, 4), true), 4);
        assert_eq!(rb.valid_byte_count(), 4);

        let mut out = [0u8; 16];
        // Applying the flush consumes this call
        assert_eq!(rb.read(&mut out), 0);
        assert_eq!(rb.valid_byte_count(), 4);
        assert_eq!(rb.read(&mut out), 4);
        assert_eq!(&out[..4], &seq(50, 4)[..]);

        let stats = rb.statistics();
        assert_eq!(stats.flushes, 1);
        assert_eq!(stats.bytes_read, 4);
    }

    #[test]
    fn test_flush_during_copy_discards_read() {
        let rb = RingBuffer::with_capacity(16, 0).unwrap();
        assert_eq!(rb.write(&seq(0, 16), true), 16);

        // Reader has picked its range but not yet published it
        let (read_pos, len) = rb.state.lock().begin_read(16, 16).unwrap();
        assert_eq!((read_pos, len), (0, 16));

        // Flush lands mid-copy; the writer may now reuse the same bytes
        assert_eq!(rb.flush(), 16);
        assert_eq!(rb.write(&seq(100, 5), true), 5);

        assert_eq!(rb.state.lock().finish_read(read_pos, len), 0);
        {
            let state = rb.state.lock();
            assert_eq!(state.read_pos, 16);
            assert_eq!(state.flush_pos, None);
            assert_eq!(state.stats.discarded_reads, 1);
            assert_eq!(state.stats.bytes_read, 0);
        }

        let mut out = [0u8; 16];
        assert_eq!(rb.read(&mut out), 5);
        assert_eq!(&out[..5], &seq(100, 5)[..]);
        assert!(rb.is_empty());
    }

    #[test]
    fn test_finish_read_without_flush_advances() {
        let mut cursors = Cursors {
            write_pos: 10,
            ..Cursors::default()
        };
        assert_eq!(cursors.begin_read(16, 4), Some((0, 4)));
        assert_eq!(cursors.finish_read(0, 4), 4);
        assert_eq!(cursors.read_pos, 4);
        assert_eq!(cursors.stats.bytes_read, 4);
        assert_eq!(cursors.stats.discarded_reads, 0);
    }

    #[test]
    fn test_repeated_flush_moves_flush_point() {
        let rb = RingBuffer::with_capacity(16, 0).unwrap();
        rb.write(&seq(0, 3), true);
        assert_eq!(rb.flush(), 3);
        rb.write(&seq(3, 2), true);
        assert_eq!(rb.flush(), 2);
        assert_eq!(rb.flush(), 0);

        let mut out = [0u8; 16];
        assert_eq!(rb.read(&mut out), 0);
        assert_eq!(rb.read(&mut out), 0);
        assert!(rb.is_empty());
    }

    #[test]
    fn test_flush_frees_space_for_writer() {
        let rb = RingBuffer::with_capacity(8, 0).unwrap();
        assert_eq!(rb.write(&seq(0, 8), true), 8);
        assert_eq!(rb.write(&seq(8, 1), true), 0);
        rb.flush();
        assert_eq!(rb.write(&seq(8, 8), true), 8);
    }

    #[test]
    fn test_concurrent_writer_and_reader() {
        let rb = Arc::new(RingBuffer::with_capacity(64, 0).unwrap());
        let total = 64 * 1024;

        let writer = {
            let rb = Arc::clone(&rb);
            thread::spawn(move || {
                let mut next = 0usize;
                while next < total {
                    let chunk: Vec<u8> = (next..(next + 13).min(total)).map(|i| i as u8).collect();
                    next += rb.write(&chunk, true);
                    thread::yield_now();
                }
            })
        };

        let mut received = Vec::with_capacity(total);
        let mut buf = [0u8; 17];
        while received.len() < total {
            let n = rb.read(&mut buf);
            received.extend_from_slice(&buf[..n]);
            if n == 0 {
                thread::yield_now();
            }
        }
        writer.join().unwrap();

        assert!(received.iter().enumerate().all(|(i, &b)| b == i as u8));
        let stats = rb.statistics();
        assert_eq!(stats.bytes_written, total as u64);
        assert_eq!(stats.bytes_read, total as u64);
        assert_eq!(stats.overruns, 0);
    }
}
