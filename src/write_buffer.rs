//! Growable circular buffer backing each connection's outbound byte stream.
//!
//! Power-of-two sized so position arithmetic is a mask. Grows on demand up
//! to a soft limit; beyond it, writes fail with `WouldBlock` so callers can
//! apply their drop-on-slow-subscriber policy.

use std::io::{self, IoSlice};

/// Minimum capacity (4KB).
const MIN_SIZE: usize = 4096;

/// Soft limit (1MB). Writes that would grow past this fail with WouldBlock.
const SOFT_LIMIT: usize = 1024 * 1024;

/// Hard cap (16MB).
const MAX_SIZE: usize = 16 * 1024 * 1024;

pub struct WriteBuffer {
    buf: Box<[u8]>,
    /// Write position.
    head: usize,
    /// Read position.
    tail: usize,
    /// Bytes currently queued.
    len: usize,
    /// Capacity minus one, for masking.
    mask: usize,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::with_capacity(MIN_SIZE)
    }

    /// Capacity is rounded up to the next power of two.
    pub fn with_capacity(cap: usize) -> Self {
        let size = cap.max(MIN_SIZE).next_power_of_two();
        Self {
            buf: vec![0u8; size].into_boxed_slice(),
            head: 0,
            tail: 0,
            len: 0,
            mask: size - 1,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    #[inline]
    fn free_space(&self) -> usize {
        self.capacity() - self.len
    }

    /// The queued bytes as at most two slices, for vectored writes that
    /// handle wraparound in one syscall.
    #[inline]
    pub fn as_io_slices(&self) -> [IoSlice<'_>; 2] {
        if self.len == 0 {
            return [IoSlice::new(&[]), IoSlice::new(&[])];
        }

        let cap = self.capacity();
        if self.tail + self.len <= cap {
            [
                IoSlice::new(&self.buf[self.tail..self.tail + self.len]),
                IoSlice::new(&[]),
            ]
        } else {
            let first = cap - self.tail;
            [
                IoSlice::new(&self.buf[self.tail..]),
                IoSlice::new(&self.buf[..self.len - first]),
            ]
        }
    }

    /// Advance the read position after `n` bytes were written to the socket.
    #[inline]
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        self.tail = (self.tail + n) & self.mask;
        self.len -= n;

        // Keep fresh writes contiguous once drained.
        if self.len == 0 {
            self.head = 0;
            self.tail = 0;
        }
    }

    /// Queue bytes, growing the buffer if needed. `WouldBlock` when the soft
    /// limit would be exceeded, `OutOfMemory` at the hard cap.
    pub fn write_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        self.ensure_space(data.len())?;

        let head_pos = self.head & self.mask;
        let cap = self.capacity();

        let first = (cap - head_pos).min(data.len());
        self.buf[head_pos..head_pos + first].copy_from_slice(&data[..first]);
        if first < data.len() {
            let rest = data.len() - first;
            self.buf[..rest].copy_from_slice(&data[first..]);
        }

        self.head = (self.head + data.len()) & self.mask;
        self.len += data.len();
        Ok(())
    }

    fn ensure_space(&mut self, needed: usize) -> io::Result<()> {
        if self.free_space() >= needed {
            return Ok(());
        }

        let new_size = (self.len + needed).next_power_of_two();

        if new_size > SOFT_LIMIT && self.capacity() < new_size {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "tx buffer soft limit reached",
            ));
        }
        if new_size > MAX_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "tx buffer would exceed maximum size",
            ));
        }

        self.grow_to(new_size);
        Ok(())
    }

    fn grow_to(&mut self, new_size: usize) {
        let mut new_buf = vec![0u8; new_size].into_boxed_slice();
        let cap = self.capacity();

        if self.tail + self.len <= cap {
            new_buf[..self.len].copy_from_slice(&self.buf[self.tail..self.tail + self.len]);
        } else {
            let first = cap - self.tail;
            new_buf[..first].copy_from_slice(&self.buf[self.tail..]);
            new_buf[first..self.len].copy_from_slice(&self.buf[..self.len - first]);
        }

        self.buf = new_buf;
        self.tail = 0;
        self.head = self.len;
        self.mask = new_size - 1;
    }

    /// Shrink an oversized, mostly drained buffer back toward the minimum.
    /// Slow subscribers that catch up should not pin megabytes forever.
    pub fn maybe_shrink(&mut self) {
        let cap = self.capacity();
        if cap >= MIN_SIZE * 4 && self.len < cap / 8 {
            self.grow_to(MIN_SIZE * 2);
        }
    }
}

impl Default for WriteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(buf: &WriteBuffer) -> Vec<u8> {
        let [a, b] = buf.as_io_slices();
        let mut out = a.to_vec();
        out.extend_from_slice(&b);
        out
    }

    #[test]
    fn write_then_consume() {
        let mut buf = WriteBuffer::new();
        assert!(buf.is_empty());

        buf.write_bytes(b"hello").unwrap();
        assert_eq!(buf.len(), 5);
        assert_eq!(queued(&buf), b"hello");

        buf.consume(5);
        assert!(buf.is_empty());
    }

    #[test]
    fn grows_past_initial_capacity() {
        let mut buf = WriteBuffer::with_capacity(8);
        let data = vec![0xAB; MIN_SIZE * 2];
        buf.write_bytes(&data).unwrap();
        assert_eq!(buf.len(), data.len());
        assert_eq!(queued(&buf), data);
    }

    #[test]
    fn grow_preserves_wrapped_data() {
        // Capacity starts at 4096. Leave 2000 bytes at tail=1000, then write
        // enough that the data wraps, then force a grow while wrapped.
        let mut buf = WriteBuffer::new();
        buf.write_bytes(&vec![0x11u8; 3000]).unwrap();
        buf.consume(1000);
        buf.write_bytes(&vec![0x22u8; 2000]).unwrap();
        buf.write_bytes(&vec![0x33u8; 2000]).unwrap();

        let mut expected = vec![0x11u8; 2000];
        expected.extend_from_slice(&vec![0x22u8; 2000]);
        expected.extend_from_slice(&vec![0x33u8; 2000]);
        assert_eq!(queued(&buf), expected);
    }

    #[test]
    fn soft_limit_reports_would_block() {
        let mut buf = WriteBuffer::new();
        let chunk = vec![0u8; 256 * 1024];
        for _ in 0..4 {
            buf.write_bytes(&chunk).unwrap();
        }

        let err = buf.write_bytes(&chunk).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        // Draining makes room again.
        buf.consume(256 * 1024);
        assert!(buf.write_bytes(&chunk).is_ok());
    }

    #[test]
    fn shrink_after_drain() {
        let mut buf = WriteBuffer::new();
        for _ in 0..4 {
            buf.write_bytes(&vec![0u8; 8000]).unwrap();
        }
        let grown = buf.capacity();
        assert!(grown >= 32768);

        buf.consume(31000);
        buf.maybe_shrink();
        assert!(buf.capacity() < grown);
        assert_eq!(buf.len(), 1000);
    }
}
