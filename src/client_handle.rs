//! Cross-thread client write handle.
//!
//! Fanout must be able to deliver a frame to a subscriber owned by any
//! worker. Each connection therefore exposes a shared handle: a
//! mutex-protected outbound buffer that any thread may append to, plus a
//! direct epoll interest update so the owning worker wakes up and flushes.
//! epoll_ctl is thread-safe, so no channel hop is needed.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use mio::Token;
use parking_lot::Mutex;

use crate::subscription::SubscriberKey;
use crate::write_buffer::WriteBuffer;

/// Consecutive empty flushes before EPOLLOUT is cleared. Clearing eagerly
/// races with concurrent fanout writes; a truly idle client tolerates the
/// extra wakeups until the threshold is reached.
const IDLE_THRESHOLD: u16 = 1000;

pub struct ClientWriteHandle {
    write_buf: Mutex<WriteBuffer>,
    /// Tracks whether EPOLLOUT is currently requested, to skip redundant
    /// epoll_ctl calls.
    ready_for_writing: AtomicBool,
    idle_flush_count: AtomicU16,
    /// The owning worker's epoll fd.
    epoll_fd: RawFd,
    socket_fd: RawFd,
    token: Token,
    worker_id: usize,
}

impl ClientWriteHandle {
    pub fn new(worker_id: usize, epoll_fd: RawFd, socket_fd: RawFd, token: Token) -> Self {
        Self {
            write_buf: Mutex::new(WriteBuffer::new()),
            ready_for_writing: AtomicBool::new(false),
            idle_flush_count: AtomicU16::new(0),
            epoll_fd,
            socket_fd,
            token,
            worker_id,
        }
    }

    #[inline]
    pub fn token(&self) -> Token {
        self.token
    }

    #[inline]
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Registry identity for this connection.
    #[inline]
    pub fn key(&self) -> SubscriberKey {
        (self.worker_id, self.token)
    }

    /// Queue an encoded frame for sending. Callable from any thread.
    /// `WouldBlock` means the client's outbound buffer is full.
    pub fn queue_bytes(&self, frame: &[u8]) -> io::Result<()> {
        let mut buf = self.write_buf.lock();
        buf.write_bytes(frame)?;
        drop(buf);
        self.set_ready_for_writing(true);
        Ok(())
    }

    /// Flush queued bytes to the socket. Called by the owning worker only.
    /// Returns `Ok(true)` once the buffer is drained, `Ok(false)` if the
    /// socket is not ready for the rest.
    pub fn flush(&self, socket: &mut impl io::Write) -> io::Result<bool> {
        loop {
            let mut buf = self.write_buf.lock();

            if buf.is_empty() {
                let count = self.idle_flush_count.fetch_add(1, Ordering::Relaxed);
                if count % 500 == 0 {
                    buf.maybe_shrink();
                }

                if count >= IDLE_THRESHOLD {
                    self.idle_flush_count.store(0, Ordering::Relaxed);
                    drop(buf);
                    self.set_ready_for_writing(false);

                    // A fanout write may have landed between the emptiness
                    // check and the epoll update; re-arm if so.
                    if !self.write_buf.lock().is_empty() {
                        self.ready_for_writing.store(true, Ordering::Release);
                        self.update_epoll(true);
                    }
                }
                return Ok(true);
            }

            self.idle_flush_count.store(0, Ordering::Relaxed);

            let slices = buf.as_io_slices();
            match socket.write_vectored(&slices) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    buf.consume(n);
                    buf.maybe_shrink();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
    }

    #[inline]
    fn set_ready_for_writing(&self, val: bool) {
        if val {
            self.idle_flush_count.store(0, Ordering::Relaxed);
        }

        // Level-triggered writes: skipping epoll_ctl when the state is
        // unchanged is safe.
        if self.ready_for_writing.swap(val, Ordering::Release) == val {
            return;
        }

        self.update_epoll(val);
    }

    #[inline]
    fn update_epoll(&self, include_out: bool) {
        let events = if include_out {
            (libc::EPOLLIN | libc::EPOLLOUT) as u32
        } else {
            libc::EPOLLIN as u32
        };

        let mut ev = libc::epoll_event {
            events,
            u64: self.token.0 as u64,
        };

        // epoll_ctl is thread-safe.
        unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, self.socket_fd, &mut ev);
        }
    }
}

// Safety: the buffer is mutex-protected and epoll_ctl is thread-safe.
unsafe impl Send for ClientWriteHandle {}
unsafe impl Sync for ClientWriteHandle {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct SinkWriter;

    impl Write for SinkWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct WouldBlockWriter;

    impl Write for WouldBlockWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "would block"))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
        fn write_vectored(&mut self, _bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "would block"))
        }
    }

    // Invalid fds: epoll_ctl fails silently, which the handle ignores.
    fn make_handle() -> ClientWriteHandle {
        ClientWriteHandle::new(0, -1, -1, Token(1))
    }

    #[test]
    fn queue_marks_ready_for_writing() {
        let handle = make_handle();
        assert!(!handle.ready_for_writing.load(Ordering::Acquire));

        handle.queue_bytes(&[0xD0, 0x00]).unwrap();
        assert!(handle.ready_for_writing.load(Ordering::Acquire));
    }

    #[test]
    fn flush_drains_queued_bytes() {
        let handle = make_handle();
        handle.queue_bytes(&[0xD0, 0x00]).unwrap();

        let mut writer = SinkWriter;
        assert!(handle.flush(&mut writer).unwrap());
        assert!(handle.write_buf.lock().is_empty());

        // Interest is not cleared on the first empty flush; that only
        // happens after the idle threshold.
        assert!(handle.ready_for_writing.load(Ordering::Acquire));
    }

    #[test]
    fn flush_keeps_data_on_would_block() {
        let handle = make_handle();
        handle.queue_bytes(&[0xD0, 0x00]).unwrap();

        let mut writer = WouldBlockWriter;
        assert!(!handle.flush(&mut writer).unwrap());
        assert_eq!(handle.write_buf.lock().len(), 2);
        assert!(handle.ready_for_writing.load(Ordering::Acquire));
    }
}
