//! Fixed-capacity ring buffers for the connection layer.
//!
//! Both buffers keep free-running `head`/`tail` counters. The physical slot
//! of a counter is the counter masked by the capacity, which must be a power
//! of two. Writers only move `head`, readers only move `tail`, and the
//! occupied size (`head - tail`) never exceeds the capacity: a write that
//! does not fit is rejected instead of truncated.

use std::ops::Range;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use thiserror::Error;

// =============================================================================
// Errors
// =============================================================================

/// Errors returned by ring buffer operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// The write does not fit in the free space.
    #[error("capacity exceeded: {requested} requested, {free} free of {capacity}")]
    CapacityExceeded {
        requested: usize,
        free: usize,
        capacity: usize,
    },

    /// More elements were requested than are buffered.
    #[error("underflow: {requested} requested, {available} buffered")]
    Underflow { requested: usize, available: usize },
}

// =============================================================================
// Cursor Arithmetic
// =============================================================================

/// Head/tail bookkeeping shared by both buffer kinds.
#[derive(Debug, Clone, Copy)]
struct Cursors {
    head: usize,
    tail: usize,
    capacity: usize,
}

impl Cursors {
    fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "ring capacity must be a power of two"
        );
        Self {
            head: 0,
            tail: 0,
            capacity,
        }
    }

    #[inline]
    fn mask(&self) -> usize {
        self.capacity - 1
    }

    #[inline]
    fn len(&self) -> usize {
        self.head.wrapping_sub(self.tail)
    }

    #[inline]
    fn free(&self) -> usize {
        self.capacity - self.len()
    }

    /// Physical ranges covering `count` slots starting at counter `start`.
    ///
    /// The second range is empty unless the run wraps past the end.
    fn spans(&self, start: usize, count: usize) -> (Range<usize>, Range<usize>) {
        let offset = start & self.mask();
        let first = count.min(self.capacity - offset);
        (offset..offset + first, 0..count - first)
    }

    fn ensure_free(&self, requested: usize) -> Result<(), RingError> {
        if requested > self.free() {
            return Err(RingError::CapacityExceeded {
                requested,
                free: self.free(),
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    fn ensure_buffered(&self, requested: usize) -> Result<(), RingError> {
        if requested > self.len() {
            return Err(RingError::Underflow {
                requested,
                available: self.len(),
            });
        }
        Ok(())
    }

    fn advance_head(&mut self, count: usize) {
        self.head = self.head.wrapping_add(count);
    }

    fn advance_tail(&mut self, count: usize) {
        self.tail = self.tail.wrapping_add(count);
    }
}

// =============================================================================
// Byte Ring Buffer
// =============================================================================

/// Circular byte store used for both directions of a connection.
pub struct RingBuffer {
    data: Box<[u8]>,
    cursors: Cursors,
}

impl RingBuffer {
    /// Default window per direction, matching the largest Wayland message.
    pub const DEFAULT_CAPACITY: usize = 4096;

    /// Create an empty buffer.
    ///
    /// # Panics
    /// Panics if `capacity` is not a power of two.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            cursors: Cursors::new(capacity),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cursors.capacity
    }

    #[inline]
    pub fn occupied_size(&self) -> usize {
        self.cursors.len()
    }

    #[inline]
    pub fn free_space(&self) -> usize {
        self.cursors.free()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cursors.len() == 0
    }

    /// Append `bytes`, splitting the copy when it wraps.
    ///
    /// Fails without touching the buffer if the bytes do not fit.
    pub fn put(&mut self, bytes: &[u8]) -> Result<(), RingError> {
        self.cursors.ensure_free(bytes.len())?;

        let (first, second) = self.cursors.spans(self.cursors.head, bytes.len());
        let split = first.len();
        self.data[first].copy_from_slice(&bytes[..split]);
        self.data[second].copy_from_slice(&bytes[split..]);
        self.cursors.advance_head(bytes.len());
        Ok(())
    }

    /// Mutable views over the free region, for receiving in place.
    ///
    /// Data written here becomes visible after [`RingBuffer::commit`].
    pub fn as_write_spans(&mut self) -> (&mut [u8], &mut [u8]) {
        let (first, second) = self.cursors.spans(self.cursors.head, self.cursors.free());
        let (low, high) = self.data.split_at_mut(first.start);
        (&mut high[..first.len()], &mut low[..second.len()])
    }

    /// Views over the occupied region, for sending in place.
    pub fn as_read_spans(&self) -> (&[u8], &[u8]) {
        let (first, second) = self.cursors.spans(self.cursors.tail, self.cursors.len());
        (&self.data[first], &self.data[second])
    }

    /// Copy the next `dst.len()` bytes out without consuming them.
    pub fn copy_out(&self, dst: &mut [u8]) -> Result<(), RingError> {
        self.cursors.ensure_buffered(dst.len())?;

        let (first, second) = self.cursors.spans(self.cursors.tail, dst.len());
        let split = first.len();
        dst[..split].copy_from_slice(&self.data[first]);
        dst[split..].copy_from_slice(&self.data[second]);
        Ok(())
    }

    /// Drop `count` bytes from the front.
    pub fn consume(&mut self, count: usize) -> Result<(), RingError> {
        self.cursors.ensure_buffered(count)?;
        self.cursors.advance_tail(count);
        Ok(())
    }

    /// Publish `count` bytes written through [`RingBuffer::as_write_spans`].
    pub fn commit(&mut self, count: usize) -> Result<(), RingError> {
        self.cursors.ensure_free(count)?;
        self.cursors.advance_head(count);
        Ok(())
    }
}

// =============================================================================
// Descriptor Queue
// =============================================================================

/// Circular queue of owned file descriptors.
///
/// Every queued descriptor is owned by the queue: popping hands ownership to
/// the caller, [`DescriptorQueue::close_all`] closes them, and dropping the
/// queue closes whatever is left.
pub struct DescriptorQueue {
    slots: Box<[Option<OwnedFd>]>,
    cursors: Cursors,
}

impl DescriptorQueue {
    /// 4096 bytes worth of 32-bit descriptor numbers.
    pub const DEFAULT_CAPACITY: usize = 1024;

    /// Create an empty queue.
    ///
    /// # Panics
    /// Panics if `capacity` is not a power of two.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            cursors: Cursors::new(capacity),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cursors.len() == 0
    }

    #[inline]
    pub fn free_space(&self) -> usize {
        self.cursors.free()
    }

    /// Enqueue `fd`. When the queue is full the descriptor is closed.
    pub fn push(&mut self, fd: OwnedFd) -> Result<(), RingError> {
        if let Err(e) = self.cursors.ensure_free(1) {
            log::trace!("[FD] Queue full, closing fd={}", fd.as_raw_fd());
            drop(fd);
            return Err(e);
        }

        let slot = self.cursors.head & self.cursors.mask();
        self.slots[slot] = Some(fd);
        self.cursors.advance_head(1);
        Ok(())
    }

    /// Take ownership of the oldest descriptor.
    pub fn pop(&mut self) -> Option<OwnedFd> {
        if self.is_empty() {
            return None;
        }

        let slot = self.cursors.tail & self.cursors.mask();
        self.cursors.advance_tail(1);
        self.slots[slot].take()
    }

    fn front(&self, count: usize) -> impl Iterator<Item = &OwnedFd> {
        let (first, second) = self
            .cursors
            .spans(self.cursors.tail, count.min(self.cursors.len()));
        self.slots[first]
            .iter()
            .chain(self.slots[second].iter())
            .flatten()
    }

    /// Descriptor numbers of up to `count` queued entries, not consumed.
    pub fn peek_raw(&self, count: usize) -> Vec<RawFd> {
        self.front(count).map(|fd| fd.as_raw_fd()).collect()
    }

    /// Borrow up to `max` descriptors from the front for one ancillary block.
    pub fn borrow_front(&self, max: usize) -> Vec<BorrowedFd<'_>> {
        self.front(max).map(|fd| fd.as_fd()).collect()
    }

    /// Close up to `max` descriptors (all when `None`) from the front.
    ///
    /// Returns how many were closed.
    pub fn close_all(&mut self, max: Option<usize>) -> usize {
        let count = max.map_or(self.len(), |max| max.min(self.len()));
        for _ in 0..count {
            drop(self.pop());
        }
        count
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::net::UnixStream;

    fn drain(buf: &mut RingBuffer, count: usize) -> Vec<u8> {
        let mut out = vec![0u8; count];
        buf.copy_out(&mut out).unwrap();
        buf.consume(count).unwrap();
        out
    }

    #[test]
    fn test_put_copy_consume_in_order() {
        let mut buf = RingBuffer::new(16);
        buf.put(b"hello").unwrap();
        buf.put(b" world").unwrap();
        assert_eq!(buf.occupied_size(), 11);
        assert_eq!(drain(&mut buf, 11), b"hello world");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_put_straddles_wrap_boundary() {
        let mut buf = RingBuffer::new(8);
        buf.put(&[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(drain(&mut buf, 5), [1, 2, 3, 4, 5]);

        // head at 6, tail at 5: the next write wraps
        buf.put(&[7, 8, 9, 10, 11]).unwrap();
        let (first, second) = buf.as_read_spans();
        assert_eq!(first, [6, 7, 8]);
        assert_eq!(second, [9, 10, 11]);
        assert_eq!(drain(&mut buf, 6), [6, 7, 8, 9, 10, 11]);
    }

    #[test]
    fn test_many_cycles_preserve_order() {
        let mut buf = RingBuffer::new(32);
        let mut expected = Vec::new();
        let mut seen = Vec::new();
        let mut next = 0u8;

        for round in 0..200usize {
            let chunk: Vec<u8> = (0..(round % 13) + 1)
                .map(|_| {
                    next = next.wrapping_add(1);
                    next
                })
                .collect();
            if chunk.len() > buf.free_space() {
                let n = buf.occupied_size();
                seen.extend(drain(&mut buf, n));
            }
            buf.put(&chunk).unwrap();
            expected.extend_from_slice(&chunk);

            if round % 3 == 0 {
                let n = buf.occupied_size() / 2;
                seen.extend(drain(&mut buf, n));
            }
        }
        let n = buf.occupied_size();
        seen.extend(drain(&mut buf, n));
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_put_larger_than_capacity_fails_unchanged() {
        let mut buf = RingBuffer::new(4096);
        buf.put(b"abc").unwrap();

        let err = buf.put(&[0u8; 5000]).unwrap_err();
        assert!(matches!(err, RingError::CapacityExceeded { requested: 5000, .. }));
        assert_eq!(buf.occupied_size(), 3);
        assert_eq!(drain(&mut buf, 3), b"abc");
    }

    #[test]
    fn test_put_larger_than_free_space_fails() {
        let mut buf = RingBuffer::new(8);
        buf.put(&[0u8; 6]).unwrap();
        assert!(buf.put(&[0u8; 3]).is_err());
        assert_eq!(buf.occupied_size(), 6);
    }

    #[test]
    fn test_write_spans_and_commit() {
        let mut buf = RingBuffer::new(8);
        buf.put(&[0u8; 6]).unwrap();
        buf.consume(4).unwrap();

        // free region wraps: slots 6..8 then 0..4
        let (first, second) = buf.as_write_spans();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 4);
        first.copy_from_slice(&[1, 2]);
        second[..1].copy_from_slice(&[3]);
        buf.commit(3).unwrap();

        assert_eq!(buf.occupied_size(), 5);
        assert_eq!(drain(&mut buf, 5), [0, 0, 1, 2, 3]);
    }

    #[test]
    fn test_copy_out_and_consume_underflow() {
        let mut buf = RingBuffer::new(8);
        buf.put(&[1, 2]).unwrap();
        let mut out = [0u8; 3];
        assert!(matches!(
            buf.copy_out(&mut out),
            Err(RingError::Underflow { requested: 3, available: 2 })
        ));
        assert!(buf.consume(3).is_err());
        assert_eq!(buf.occupied_size(), 2);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn test_capacity_must_be_power_of_two() {
        let _ = RingBuffer::new(100);
    }

    /// A queued descriptor paired with the end that observes its closure.
    fn tracked_fd() -> (OwnedFd, UnixStream) {
        let (queued, observer) = UnixStream::pair().unwrap();
        (OwnedFd::from(queued), observer)
    }

    fn is_closed(observer: &mut UnixStream) -> bool {
        observer.set_nonblocking(true).unwrap();
        matches!(observer.read(&mut [0u8; 1]), Ok(0))
    }

    #[test]
    fn test_descriptor_queue_fifo() {
        let mut queue = DescriptorQueue::new(4);
        let (a, _oa) = tracked_fd();
        let (b, _ob) = tracked_fd();
        let (raw_a, raw_b) = (a.as_raw_fd(), b.as_raw_fd());

        queue.push(a).unwrap();
        queue.push(b).unwrap();
        assert_eq!(queue.peek_raw(8), vec![raw_a, raw_b]);
        assert_eq!(queue.borrow_front(1).len(), 1);

        assert_eq!(queue.pop().unwrap().as_raw_fd(), raw_a);
        assert_eq!(queue.pop().unwrap().as_raw_fd(), raw_b);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_descriptor_queue_rejects_and_closes_when_full() {
        let mut queue = DescriptorQueue::new(2);
        let (a, _oa) = tracked_fd();
        let (b, _ob) = tracked_fd();
        let (c, mut oc) = tracked_fd();

        queue.push(a).unwrap();
        queue.push(b).unwrap();
        assert!(queue.push(c).is_err());
        assert!(is_closed(&mut oc));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_close_all_bounded_then_unbounded() {
        let mut queue = DescriptorQueue::new(4);
        let mut observers = Vec::new();
        for _ in 0..3 {
            let (fd, observer) = tracked_fd();
            queue.push(fd).unwrap();
            observers.push(observer);
        }

        assert_eq!(queue.close_all(Some(2)), 2);
        assert!(is_closed(&mut observers[0]));
        assert!(is_closed(&mut observers[1]));
        assert!(!is_closed(&mut observers[2]));

        assert_eq!(queue.close_all(None), 1);
        assert!(is_closed(&mut observers[2]));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drop_closes_queued_descriptors() {
        let (fd, mut observer) = tracked_fd();
        {
            let mut queue = DescriptorQueue::new(2);
            queue.push(fd).unwrap();
        }
        assert!(is_closed(&mut observer));
    }

    #[test]
    fn test_descriptor_queue_wraps() {
        let mut queue = DescriptorQueue::new(2);
        let mut keep = Vec::new();
        for _ in 0..5 {
            let (fd, observer) = tracked_fd();
            let raw = fd.as_raw_fd();
            queue.push(fd).unwrap();
            assert_eq!(queue.pop().unwrap().as_raw_fd(), raw);
            keep.push(observer);
        }
        assert!(queue.is_empty());
    }
}
