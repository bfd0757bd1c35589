//! Growable byte buffer with prepend slack and scatter reads.
//!
//! The buffer keeps three indices over one contiguous allocation:
//!
//! ```text
//! ┌─────────────┬──────────────────┬──────────────────┐
//! │ prependable │     readable     │     writable     │
//! │             │                  │                  │
//! 0        read_index        write_index        capacity
//! ```
//!
//! The head slack (8 bytes after a fresh buffer or `retrieve_all`) lets a
//! frame header be prepended in front of already-written payload without
//! relocating it. When the writable region runs out, readable bytes are
//! compacted back to the slack boundary if that frees enough room; otherwise
//! the allocation grows.

use std::io;
use std::os::unix::io::RawFd;

/// Reserved head slack for cheap prepends.
pub const CHEAP_PREPEND: usize = 8;

/// Initial buffer body size.
pub const INITIAL_SIZE: usize = 1024;

/// Stack-side overflow buffer used by [`Buffer::read_from_fd`].
const EXTRA_BUF_SIZE: usize = 65536;

pub struct Buffer {
    data: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial_size: usize) -> Self {
        Self {
            data: vec![0; CHEAP_PREPEND + initial_size],
            read_index: CHEAP_PREPEND,
            write_index: CHEAP_PREPEND,
        }
    }

    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.write_index
    }

    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.read_index
    }

    /// View of the readable region.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.data[self.read_index..self.write_index]
    }

    /// Advance the read cursor by `len` bytes. Consuming everything resets
    /// both cursors back to the slack boundary.
    pub fn retrieve(&mut self, len: usize) {
        debug_assert!(len <= self.readable_bytes());
        if len < self.readable_bytes() {
            self.read_index += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.read_index = CHEAP_PREPEND;
        self.write_index = CHEAP_PREPEND;
    }

    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        let len = len.min(self.readable_bytes());
        let result = String::from_utf8_lossy(&self.peek()[..len]).into_owned();
        self.retrieve(len);
        result
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let start = self.write_index;
        self.data[start..start + data.len()].copy_from_slice(data);
        self.write_index += data.len();
    }

    /// Write `data` immediately in front of the readable region.
    ///
    /// `data.len()` must not exceed [`prependable_bytes`](Self::prependable_bytes).
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes(), "prepend exceeds head slack");
        self.read_index -= data.len();
        let start = self.read_index;
        self.data[start..start + data.len()].copy_from_slice(data);
    }

    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.data.resize(self.write_index + len, 0);
        } else {
            // Enough total room: compact readable bytes back to the slack boundary.
            let readable = self.readable_bytes();
            self.data.copy_within(self.read_index..self.write_index, CHEAP_PREPEND);
            self.read_index = CHEAP_PREPEND;
            self.write_index = CHEAP_PREPEND + readable;
        }
    }

    /// Read from a descriptor with a two-vector scatter read.
    ///
    /// The first vector covers the buffer's writable region; the second a
    /// 64 KiB stack buffer. A burst larger than the writable region lands in
    /// the stack buffer and is appended afterwards, growing capacity as
    /// needed, so one `readv` per readiness event suffices even when the
    /// incoming burst exceeds current capacity.
    ///
    /// Returns `Ok(0)` on EOF. `EAGAIN`/`EWOULDBLOCK` comes back as an error
    /// with [`io::ErrorKind::WouldBlock`] — "no data ready", not a failure.
    pub fn read_from_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extrabuf = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let mut iov = [
            libc::iovec {
                iov_base: unsafe { self.data.as_mut_ptr().add(self.write_index) } as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extrabuf.as_mut_ptr() as *mut libc::c_void,
                iov_len: EXTRA_BUF_SIZE,
            },
        ];
        let iovcnt = if writable < EXTRA_BUF_SIZE { 2 } else { 1 };

        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.write_index += n;
        } else {
            self.write_index = self.data.len();
            self.append(&extrabuf[..n - writable]);
        }
        Ok(n)
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_buffer_indices() {
        let buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn test_append_retrieve() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.peek(), b"hello world");

        buf.retrieve(6);
        assert_eq!(buf.peek(), b"world");

        buf.retrieve(5);
        assert_eq!(buf.readable_bytes(), 0);
        // fully consumed: cursors reset to the slack boundary
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn test_retrieve_as_string() {
        let mut buf = Buffer::new();
        buf.append(b"tag:payload");
        assert_eq!(buf.retrieve_as_string(4), "tag:");
        assert_eq!(buf.retrieve_all_as_string(), "payload");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn test_prepend_header_in_slack() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend(&[0x00, 0x00, 0x00, 0x07]);
        assert_eq!(buf.peek(), &[0x00, 0x00, 0x00, 0x07, b'p', b'a', b'y', b'l', b'o', b'a', b'd'][..]);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND - 4);
    }

    #[test]
    #[should_panic(expected = "prepend exceeds head slack")]
    fn test_prepend_overflow_panics() {
        let mut buf = Buffer::new();
        buf.prepend(&[0u8; CHEAP_PREPEND + 1]);
    }

    #[test]
    fn test_growth_beyond_initial_size() {
        let mut buf = Buffer::with_capacity(16);
        let big = vec![0xAB; 4096];
        buf.append(&big);
        assert_eq!(buf.readable_bytes(), 4096);
        assert!(buf.peek().iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_compaction_reclaims_consumed_space() {
        let mut buf = Buffer::with_capacity(64);
        buf.append(&[1u8; 48]);
        buf.retrieve(40);
        // 8 readable; appending 48 fits after compaction without growing
        let before = buf.writable_bytes() + buf.prependable_bytes();
        assert!(before >= 48 + CHEAP_PREPEND);
        buf.append(&[2u8; 48]);
        assert_eq!(buf.readable_bytes(), 56);
        assert_eq!(&buf.peek()[..8], &[1u8; 8]);
        assert_eq!(&buf.peek()[8..], &[2u8; 48]);
    }

    #[test]
    fn test_read_from_fd_small() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (r, w) = (fds[0], fds[1]);

        let payload = b"scattered";
        let written = unsafe { libc::write(w, payload.as_ptr() as *const libc::c_void, payload.len()) };
        assert_eq!(written, payload.len() as isize);

        let mut buf = Buffer::new();
        let n = buf.read_from_fd(r).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(buf.peek(), payload);

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_read_from_fd_overflows_into_stack_buffer() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (r, w) = (fds[0], fds[1]);

        // More than the buffer's writable region so the second vector is used.
        let payload = vec![0x5A; 8000];
        let written = unsafe { libc::write(w, payload.as_ptr() as *const libc::c_void, payload.len()) };
        assert_eq!(written, payload.len() as isize);

        let mut buf = Buffer::with_capacity(128);
        let n = buf.read_from_fd(r).unwrap();
        assert_eq!(n, 8000);
        assert_eq!(buf.readable_bytes(), 8000);
        assert!(buf.peek().iter().all(|&b| b == 0x5A));

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_read_from_fd_eof() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (r, w) = (fds[0], fds[1]);
        unsafe { libc::close(w) };

        let mut buf = Buffer::new();
        assert_eq!(buf.read_from_fd(r).unwrap(), 0);

        unsafe { libc::close(r) };
    }

    #[test]
    fn test_read_from_fd_would_block() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) }, 0);
        let (r, w) = (fds[0], fds[1]);

        let mut buf = Buffer::new();
        let err = buf.read_from_fd(r).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}
