//! RAII guard for raw file descriptors.
//!
//! Every intermediate descriptor in this crate (pipe ends, the acceptor's
//! reserved descriptor, raw sockets before they become `TcpStream`s) is held
//! by an [`FdGuard`] so that no exit path can leak or double-close it.

use std::os::unix::io::RawFd;

/// Owns one raw descriptor and closes it exactly once on drop.
///
/// Move-only: there is no `Clone`, and [`release`](FdGuard::release) is the
/// only way to hand ownership to a syscall that will close the descriptor
/// itself.
#[derive(Debug)]
pub struct FdGuard {
    fd: RawFd,
}

impl FdGuard {
    /// Adopt a descriptor. A negative value produces an empty guard.
    pub fn new(fd: RawFd) -> Self {
        Self { fd }
    }

    /// The wrapped descriptor (still owned by the guard).
    #[inline]
    pub fn raw(&self) -> RawFd {
        self.fd
    }

    /// Whether the guard currently owns a descriptor.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.fd >= 0
    }

    /// Give up ownership without closing. The caller becomes responsible
    /// for the descriptor's lifetime.
    pub fn release(mut self) -> RawFd {
        let fd = self.fd;
        self.fd = -1;
        fd
    }

    /// Close the current descriptor (if any) and adopt a new one.
    pub fn reset(&mut self, fd: RawFd) {
        self.close_inner();
        self.fd = fd;
    }

    fn close_inner(&mut self) {
        if self.fd >= 0 {
            if unsafe { libc::close(self.fd) } == -1 {
                tracing::error!(
                    fd = self.fd,
                    error = %std::io::Error::last_os_error(),
                    "failed to close descriptor"
                );
            }
            self.fd = -1;
        }
    }
}

impl Drop for FdGuard {
    fn drop(&mut self) {
        self.close_inner();
    }
}
