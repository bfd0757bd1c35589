//! Listening socket management.
//!
//! The acceptor owns a non-blocking listener registered with the reactor.
//! On readiness it loop-accepts until the kernel reports "would block",
//! handing each new descriptor (already `SOCK_NONBLOCK | SOCK_CLOEXEC` via
//! `accept4`) to the new-connection callback.
//!
//! Descriptor exhaustion uses the reserved-fd technique: one spare
//! descriptor is held open on `/dev/null`; on `EMFILE`/`ENFILE` it is
//! closed, the pending connection is accepted and immediately closed (so
//! the kernel drains it from the backlog), and the spare is reopened.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};
use std::os::unix::io::FromRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::fd::FdGuard;
use crate::reactor::{Channel, EventLoop};

pub type NewConnectionCallback = Arc<dyn Fn(TcpStream, SocketAddr) + Send + Sync>;

pub struct Acceptor {
    event_loop: Arc<EventLoop>,
    listen_fd: FdGuard,
    channel: Arc<Channel>,
    idle_fd: Mutex<FdGuard>,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
    listening: AtomicBool,
    port: u16,
}

impl Acceptor {
    /// Bind `INADDR_ANY:port`. Port 0 asks the kernel for a free port;
    /// [`local_port`](Self::local_port) reports the actual one.
    pub fn new(event_loop: &Arc<EventLoop>, port: u16, reuse_port: bool) -> Result<Arc<Self>> {
        let listen_fd = bind_listen_socket(port, reuse_port)?;
        let idle_fd = open_reserved_fd()?;
        let port = local_port(listen_fd.raw())?;
        let channel = Channel::new(event_loop, listen_fd.raw())?;

        let acceptor = Arc::new(Self {
            event_loop: Arc::clone(event_loop),
            listen_fd,
            channel,
            idle_fd: Mutex::new(idle_fd),
            new_connection_cb: Mutex::new(None),
            listening: AtomicBool::new(false),
            port,
        });

        let weak = Arc::downgrade(&acceptor);
        acceptor.channel.on_read(Arc::new(move || {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        }));

        tracing::debug!(port, fd = acceptor.listen_fd.raw(), "acceptor created");
        Ok(acceptor)
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_cb.lock() = Some(cb);
    }

    /// Start listening and arm the read channel. Loop thread only.
    pub fn listen(&self) {
        self.event_loop.assert_in_loop_thread();
        if unsafe { libc::listen(self.listen_fd.raw(), libc::SOMAXCONN) } < 0 {
            // Cannot recover from a broken listener at runtime.
            panic!("listen failed: {}", std::io::Error::last_os_error());
        }
        self.listening.store(true, Ordering::Release);
        self.channel.enable_reading();
        tracing::info!(port = self.port, "listening");
    }

    #[inline]
    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// The actually bound port.
    #[inline]
    pub fn local_port(&self) -> u16 {
        self.port
    }

    fn handle_read(&self) {
        self.event_loop.assert_in_loop_thread();
        loop {
            let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            let mut addr_len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            let connfd = unsafe {
                libc::accept4(
                    self.listen_fd.raw(),
                    &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
                    &mut addr_len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };

            if connfd >= 0 {
                let peer = socket_addr_of(&addr);
                tracing::debug!(fd = connfd, %peer, "accepted connection");
                let cb = self.new_connection_cb.lock().clone();
                match cb {
                    Some(cb) => {
                        let stream = unsafe { TcpStream::from_raw_fd(connfd) };
                        cb(stream, peer);
                    }
                    None => {
                        tracing::warn!(fd = connfd, "no new-connection callback, closing");
                        unsafe { libc::close(connfd) };
                    }
                }
                continue;
            }

            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => break,
                Some(libc::EMFILE) | Some(libc::ENFILE) => {
                    self.shed_connection();
                    break;
                }
                Some(libc::ECONNABORTED) | Some(libc::EINTR) | Some(libc::EPROTO) => {
                    tracing::warn!(error = %err, "ignorable accept error");
                }
                _ => {
                    tracing::error!(error = %err, "accept failed");
                    break;
                }
            }
        }
    }

    /// Out of descriptors: burn the reserve to drain one pending connection
    /// from the backlog, then restore it.
    fn shed_connection(&self) {
        let mut idle = self.idle_fd.lock();
        idle.reset(-1);
        let drained = unsafe { libc::accept(self.listen_fd.raw(), std::ptr::null_mut(), std::ptr::null_mut()) };
        if drained >= 0 {
            unsafe { libc::close(drained) };
        }
        let reopened = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
        idle.reset(reopened);
        tracing::error!("descriptor limit reached, shed one pending connection");
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if !self.channel.is_none_event() {
            self.channel.disable_all();
        }
        self.channel.remove();
        tracing::debug!(port = self.port, "acceptor destroyed");
    }
}

fn bind_listen_socket(port: u16, reuse_port: bool) -> Result<FdGuard> {
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP,
        )
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let guard = FdGuard::new(fd);

    let one: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        if reuse_port {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEPORT,
                &one as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }

    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();

    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(guard)
}

fn open_reserved_fd() -> Result<FdGuard> {
    let fd = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(FdGuard::new(fd))
}

fn local_port(fd: libc::c_int) -> Result<u16> {
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(
            fd,
            &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(u16::from_be(addr.sin_port))
}

fn socket_addr_of(addr: &libc::sockaddr_in) -> SocketAddr {
    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(addr.sin_port)))
}
