//! Growable byte buffer with ladder allocation
//!
//! Capacity is always one rung of a fixed ascending ladder (4 KiB doubling up to 2 GiB).
//! The buffer grows by reallocating to a higher rung and copying the unread bytes,
//! never shrinks, and never truncates: a write that does not fit reports [`Overflow`]
//! and leaves the contents untouched.
//!
//! Layout: `head..tail` holds bytes written but not yet consumed; `tail..capacity` is
//! free space for the next write (or socket read).

use crate::{Error, Result};
use bytes::Buf;

/// Smallest ladder rung
pub const MIN_CAPACITY: usize = 4 * 1024;

/// Number of rungs: 4 KiB << 0 ..= 4 KiB << 19 (2 GiB)
const RUNGS: usize = 20;

/// Largest ladder rung
pub const MAX_CAPACITY: usize = MIN_CAPACITY << (RUNGS - 1);

/// Smallest rung that can hold `size` bytes, if any
pub fn ladder_capacity(size: usize) -> Option<usize> {
    (0..RUNGS)
        .map(|i| MIN_CAPACITY << i)
        .find(|&rung| rung >= size)
}

/// A write did not fit in the remaining capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overflow;

/// Ladder-allocated byte buffer
#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    head: usize,
    tail: usize,
    label: &'static str,
}

impl Buffer {
    /// Allocate a buffer on the smallest rung holding `min_capacity` bytes.
    pub fn with_capacity(min_capacity: usize, label: &'static str) -> Result<Self> {
        let capacity = ladder_capacity(min_capacity).ok_or(Error::BufferLimit(min_capacity))?;
        Ok(Self {
            data: vec![0; capacity],
            head: 0,
            tail: 0,
            label,
        })
    }

    /// Total capacity (always a ladder rung)
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Unconsumed bytes
    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    /// Whether there are no unconsumed bytes
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// The unconsumed bytes
    pub fn readable(&self) -> &[u8] {
        &self.data[self.head..self.tail]
    }

    /// Drop `n` bytes from the front of the unconsumed region
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len(), "consume past end of buffer");
        self.head += n;
        if self.head == self.tail {
            self.head = 0;
            self.tail = 0;
        }
    }

    /// Forget every byte
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Free space after the write position
    pub fn remaining_mut(&self) -> usize {
        self.capacity() - self.tail
    }

    /// Free space after the write position, for socket reads
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.tail..]
    }

    /// Mark `n` bytes of [`spare_mut`](Self::spare_mut) as written
    pub fn commit(&mut self, n: usize) {
        assert!(n <= self.remaining_mut(), "commit past capacity");
        self.tail += n;
    }

    /// Move the unconsumed bytes to the front, preserving any partial trailing message.
    pub fn compact(&mut self) {
        if self.head == 0 {
            return;
        }
        self.data.copy_within(self.head..self.tail, 0);
        self.tail -= self.head;
        self.head = 0;
    }

    /// Ensure at least `additional` bytes of free space, compacting first and then
    /// climbing the ladder. Returns whether a reallocation happened.
    pub fn reserve(&mut self, additional: usize) -> Result<bool> {
        if self.remaining_mut() >= additional {
            return Ok(false);
        }
        self.compact();
        if self.remaining_mut() >= additional {
            return Ok(false);
        }
        let wanted = self
            .len()
            .checked_add(additional)
            .ok_or(Error::BufferLimit(usize::MAX))?;
        let capacity = ladder_capacity(wanted).ok_or(Error::BufferLimit(wanted))?;
        self.regrow(capacity);
        Ok(true)
    }

    /// Move to the next rung up
    pub fn grow(&mut self) -> Result<()> {
        let next = self
            .capacity()
            .checked_mul(2)
            .filter(|&c| c <= MAX_CAPACITY)
            .ok_or(Error::BufferLimit(self.capacity().saturating_mul(2)))?;
        self.regrow(next);
        Ok(())
    }

    fn regrow(&mut self, capacity: usize) {
        let mut data = vec![0; capacity];
        let len = self.len();
        data[..len].copy_from_slice(&self.data[self.head..self.tail]);
        self.data = data;
        self.head = 0;
        self.tail = len;
        tracing::debug!(buffer = self.label, capacity, "buffer grown");
        crate::metrics::counters::buffer_grown(self.label);
    }

    /// Absolute write position, for later patching
    pub fn position(&self) -> usize {
        self.tail
    }

    /// Discard everything written from `position` on
    pub fn truncate(&mut self, position: usize) {
        assert!(position >= self.head && position <= self.tail, "truncate outside written region");
        self.tail = position;
    }

    /// Overwrite four already-written bytes at `position`
    pub fn patch_i32(&mut self, position: usize, value: i32) {
        assert!(position + 4 <= self.tail, "patch outside written region");
        self.data[position..position + 4].copy_from_slice(&value.to_be_bytes());
    }

    /// Bytes written from `position` to the write position
    pub fn since(&self, position: usize) -> &[u8] {
        &self.data[position..self.tail]
    }

    /// Append bytes, failing without side effects when they do not fit
    pub fn try_put_slice(&mut self, src: &[u8]) -> std::result::Result<(), Overflow> {
        if src.len() > self.remaining_mut() {
            return Err(Overflow);
        }
        self.data[self.tail..self.tail + src.len()].copy_from_slice(src);
        self.tail += src.len();
        Ok(())
    }

    /// Append one byte
    pub fn try_put_u8(&mut self, v: u8) -> std::result::Result<(), Overflow> {
        self.try_put_slice(&[v])
    }

    /// Append a big-endian i16
    pub fn try_put_i16(&mut self, v: i16) -> std::result::Result<(), Overflow> {
        self.try_put_slice(&v.to_be_bytes())
    }

    /// Append a big-endian i32
    pub fn try_put_i32(&mut self, v: i32) -> std::result::Result<(), Overflow> {
        self.try_put_slice(&v.to_be_bytes())
    }
}

impl Buf for Buffer {
    fn remaining(&self) -> usize {
        self.len()
    }

    fn chunk(&self) -> &[u8] {
        self.readable()
    }

    fn advance(&mut self, cnt: usize) {
        self.consume(cnt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ladder_rungs() {
        assert_eq!(ladder_capacity(0), Some(4096));
        assert_eq!(ladder_capacity(4096), Some(4096));
        assert_eq!(ladder_capacity(4097), Some(8192));
        assert_eq!(ladder_capacity(1_000_000), Some(1 << 20));
        assert_eq!(ladder_capacity(MAX_CAPACITY), Some(MAX_CAPACITY));
        assert_eq!(ladder_capacity(MAX_CAPACITY + 1), None);
    }

    #[test]
    fn test_with_capacity_rounds_up() {
        let buf = Buffer::with_capacity(5000, "test").unwrap();
        assert_eq!(buf.capacity(), 8192);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_reserve_preserves_unread_bytes() {
        for size in [1usize, 100, 4096, 5000, 70_000, 300_000] {
            let mut buf = Buffer::with_capacity(0, "test").unwrap();
            let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
            buf.try_put_slice(&payload).unwrap();
            buf.consume(1000);

            buf.reserve(size).unwrap();

            assert!(buf.remaining_mut() >= size, "size {size}");
            assert_eq!(buf.readable(), &payload[1000..]);
            assert!(ladder_capacity(buf.capacity()) == Some(buf.capacity()));
        }
    }

    #[test]
    fn test_reserve_compacts_before_growing() {
        let mut buf = Buffer::with_capacity(0, "test").unwrap();
        buf.try_put_slice(&[7u8; 4000]).unwrap();
        buf.consume(3990);
        assert!(!buf.reserve(2000).unwrap());
        assert_eq!(buf.capacity(), 4096);
        assert_eq!(buf.readable(), &[7u8; 10]);
    }

    #[test]
    fn test_overflow_does_not_truncate() {
        let mut buf = Buffer::with_capacity(0, "test").unwrap();
        buf.try_put_slice(&[1u8; 4090]).unwrap();
        assert_eq!(buf.try_put_slice(&[2u8; 10]), Err(Overflow));
        assert_eq!(buf.len(), 4090);
        buf.grow().unwrap();
        buf.try_put_slice(&[2u8; 10]).unwrap();
        assert_eq!(buf.len(), 4100);
        assert_eq!(&buf.readable()[4090..], &[2u8; 10]);
    }

    #[test]
    fn test_compact_keeps_partial_message() {
        let mut buf = Buffer::with_capacity(0, "test").unwrap();
        buf.try_put_slice(b"Z\0\0\0\x05IC\0\0").unwrap();
        buf.consume(6);
        buf.compact();
        assert_eq!(buf.position(), 3);
        assert_eq!(buf.readable(), b"C\0\0");
    }

    #[test]
    fn test_patch_and_truncate() {
        let mut buf = Buffer::with_capacity(0, "test").unwrap();
        let pos = buf.position();
        buf.try_put_i32(0).unwrap();
        buf.try_put_slice(b"abc").unwrap();
        buf.patch_i32(pos, 7);
        assert_eq!(buf.readable(), &[0, 0, 0, 7, b'a', b'b', b'c']);
        buf.truncate(pos);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_buf_impl_reads_big_endian() {
        let mut buf = Buffer::with_capacity(0, "test").unwrap();
        buf.try_put_i16(3).unwrap();
        buf.try_put_i32(-1).unwrap();
        assert_eq!(buf.get_i16(), 3);
        assert_eq!(buf.get_i32(), -1);
        assert!(!buf.has_remaining());
    }
}
