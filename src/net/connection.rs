//! Per-connection state machine with buffered, back-pressured writes.
//!
//! A connection is shared (`Arc`) between the reactor, the server's
//! registry, and any in-flight handler task, so a handler finishing after
//! the peer disconnected still holds a live object; its `send` is then
//! silently dropped. All socket I/O and every state transition happen on
//! the loop thread — `send` from any other thread posts `send_in_loop`
//! through the reactor's queue. The connection keeps a weak self-reference
//! (set up with `Arc::new_cyclic`) to hand shared handles to queued
//! closures and callbacks.
//!
//! States: Connecting -> Connected -> Disconnecting -> Disconnected, with a
//! fast path Connected -> Disconnected on `force_close` or I/O error.
//! Disconnected is terminal; only `connect_destroyed` detaches the channel
//! from the loop.

use std::any::Any;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::buffer::Buffer;
use crate::error::Result;
use crate::reactor::{Channel, EventLoop};

/// Output-buffer length past which the high-water callback fires (64 MiB).
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

pub struct TcpConnection {
    self_ref: Weak<TcpConnection>,
    event_loop: Arc<EventLoop>,
    name: String,
    socket: TcpStream,
    channel: Arc<Channel>,
    state: AtomicU8,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_cb: Mutex<Option<HighWaterMarkCallback>>,
    close_cb: Mutex<Option<CloseCallback>>,
}

impl TcpConnection {
    /// Wrap an accepted, already non-blocking socket.
    pub fn new(
        event_loop: &Arc<EventLoop>,
        name: String,
        socket: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<Arc<Self>> {
        let local_addr = socket.local_addr()?;
        let channel = Channel::new(event_loop, socket.as_raw_fd())?;

        let conn = Arc::new_cyclic(|weak: &Weak<TcpConnection>| Self {
            self_ref: weak.clone(),
            event_loop: Arc::clone(event_loop),
            name,
            socket,
            channel,
            state: AtomicU8::new(ConnState::Connecting as u8),
            input: Mutex::new(Buffer::new()),
            output: Mutex::new(Buffer::new()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            local_addr,
            peer_addr,
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            high_water_cb: Mutex::new(None),
            close_cb: Mutex::new(None),
        });

        {
            let weak = conn.self_ref.clone();
            conn.channel.on_read(Arc::new(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_read();
                }
            }));
        }
        {
            let weak = conn.self_ref.clone();
            conn.channel.on_write(Arc::new(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_write();
                }
            }));
        }
        {
            let weak = conn.self_ref.clone();
            conn.channel.on_error(Arc::new(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_error();
                }
            }));
        }

        tracing::debug!(name = %conn.name, fd = conn.channel.fd(), "connection created");
        Ok(conn)
    }

    /// A strong handle to this connection. `None` only while the last
    /// reference is being dropped.
    fn strong(&self) -> Option<Arc<Self>> {
        self.self_ref.upgrade()
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[inline]
    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    #[inline]
    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    #[inline]
    pub fn disconnected(&self) -> bool {
        self.state() == ConnState::Disconnected
    }

    fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_cb.lock() = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_cb.lock() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_cb.lock() = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        *self.high_water_cb.lock() = Some(cb);
        self.high_water_mark.store(mark, Ordering::Release);
    }

    pub fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_cb.lock() = Some(cb);
    }

    pub fn set_high_water_mark(&self, mark: usize) {
        self.high_water_mark.store(mark, Ordering::Release);
    }

    /// Establishment: tie the channel to this handle, arm reading, fire the
    /// connection callback. Loop thread only.
    pub fn connect_established(&self) {
        self.event_loop.assert_in_loop_thread();
        debug_assert_eq!(self.state(), ConnState::Connecting);
        let Some(conn) = self.strong() else { return };
        self.set_state(ConnState::Connected);

        let owner: Arc<dyn Any + Send + Sync> = conn.clone();
        self.channel.tie(&owner);
        self.channel.enable_reading();

        let cb = self.connection_cb.lock().clone();
        if let Some(cb) = cb {
            cb(&conn);
        }
    }

    /// Final teardown: disable and detach the channel. Called exactly once,
    /// on the loop thread, after the connection left the server registry.
    pub fn connect_destroyed(&self) {
        self.event_loop.assert_in_loop_thread();
        let was_connected = self.state() == ConnState::Connected;
        self.set_state(ConnState::Disconnected);

        if !self.channel.is_none_event() {
            self.channel.disable_all();
        }
        self.channel.remove();

        if was_connected {
            let cb = self.connection_cb.lock().clone();
            if let (Some(conn), Some(cb)) = (self.strong(), cb) {
                cb(&conn);
            }
        }
        tracing::debug!(name = %self.name, "connection destroyed");
    }

    /// Send bytes to the peer. Callable from any thread; off-loop calls
    /// copy the data and post to the loop. Dropped (with a log line) when
    /// the connection is not in Connected state.
    pub fn send(&self, data: &[u8]) {
        if self.state() != ConnState::Connected {
            tracing::warn!(name = %self.name, "send on disconnected connection dropped");
            return;
        }
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else if let Some(conn) = self.strong() {
            let owned = data.to_vec();
            self.event_loop.queue_in_loop(move || conn.send_in_loop(&owned));
        }
    }

    fn send_in_loop(&self, data: &[u8]) {
        self.event_loop.assert_in_loop_thread();
        if self.state() != ConnState::Connected {
            tracing::warn!(name = %self.name, "connection went down, gave up writing");
            return;
        }

        let mut written = 0usize;
        let mut fault = false;

        // Try a direct write when nothing is queued and the channel is not
        // already waiting for writability.
        if !self.channel.is_writing() && self.output.lock().readable_bytes() == 0 {
            match write_fd(self.channel.fd(), data) {
                Ok(n) => {
                    written = n;
                    if written == data.len() {
                        self.queue_write_complete();
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    tracing::error!(name = %self.name, error = %err, "write error");
                    if matches!(err.raw_os_error(), Some(libc::EPIPE) | Some(libc::ECONNRESET)) {
                        fault = true;
                    }
                }
            }
        }

        if fault {
            self.handle_error();
            return;
        }

        let remaining = data.len() - written;
        if remaining > 0 {
            let mut output = self.output.lock();
            let old_len = output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::Acquire);
            if crosses_high_water(old_len, remaining, mark) {
                let cb = self.high_water_cb.lock().clone();
                if let (Some(conn), Some(cb)) = (self.strong(), cb) {
                    let level = old_len + remaining;
                    self.event_loop.queue_in_loop(move || cb(&conn, level));
                }
            }
            output.append(&data[written..]);
            drop(output);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    /// Graceful close: stop after the output buffer drains, then close the
    /// write half.
    pub fn shutdown(&self) {
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnecting);
            if let Some(conn) = self.strong() {
                self.event_loop.run_in_loop(move || conn.shutdown_in_loop());
            }
        }
    }

    fn shutdown_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            match self.socket.shutdown(Shutdown::Write) {
                Ok(()) => tracing::debug!(name = %self.name, "write half closed"),
                Err(err) => tracing::error!(name = %self.name, error = %err, "shutdown failed"),
            }
        } else {
            tracing::debug!(name = %self.name, "shutdown deferred until output drains");
        }
    }

    /// Immediate close. The close callback fires from the loop thread.
    pub fn force_close(&self) {
        let state = self.state();
        if state == ConnState::Connected || state == ConnState::Disconnecting {
            self.set_state(ConnState::Disconnecting);
            if let Some(conn) = self.strong() {
                self.event_loop.queue_in_loop(move || conn.force_close_in_loop());
            }
        }
    }

    fn force_close_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        tracing::debug!(name = %self.name, "force close");
        self.handle_close();
    }

    fn handle_read(&self) {
        self.event_loop.assert_in_loop_thread();

        let mut total = 0usize;
        let mut saw_eof = false;
        let mut fatal: Option<std::io::Error> = None;
        {
            let mut input = self.input.lock();
            // The multiplexer is edge-triggered: drain until the kernel has
            // nothing left, otherwise no further readiness arrives.
            loop {
                match input.read_from_fd(self.channel.fd()) {
                    Ok(0) => {
                        saw_eof = true;
                        break;
                    }
                    Ok(n) => total += n,
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(err) => {
                        fatal = Some(err);
                        break;
                    }
                }
            }

            if total > 0 {
                let cb = self.message_cb.lock().clone();
                match (self.strong(), cb) {
                    (Some(conn), Some(cb)) => cb(&conn, &mut input),
                    _ => {
                        tracing::warn!(
                            name = %self.name,
                            bytes = input.readable_bytes(),
                            "no message callback, discarding input"
                        );
                        input.retrieve_all();
                    }
                }
            }
        }

        if let Some(err) = fatal {
            tracing::error!(name = %self.name, error = %err, "read error");
            self.handle_error();
        } else if saw_eof {
            self.handle_close();
        }
    }

    fn handle_write(&self) {
        self.event_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            tracing::warn!(name = %self.name, "write readiness on idle channel");
            return;
        }

        let mut drained = false;
        {
            let mut output = self.output.lock();
            match write_fd(self.channel.fd(), output.peek()) {
                Ok(n) => {
                    output.retrieve(n);
                    if output.readable_bytes() == 0 {
                        drained = true;
                    } else {
                        tracing::trace!(
                            name = %self.name,
                            remaining = output.readable_bytes(),
                            "output partially drained"
                        );
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    tracing::error!(name = %self.name, error = %err, "write error");
                    drop(output);
                    self.handle_error();
                    return;
                }
            }
        }

        if drained {
            self.channel.disable_writing();
            self.queue_write_complete();
            if self.state() == ConnState::Disconnecting {
                self.shutdown_in_loop();
            }
        }
    }

    fn queue_write_complete(&self) {
        let cb = self.write_complete_cb.lock().clone();
        if let (Some(conn), Some(cb)) = (self.strong(), cb) {
            self.event_loop.queue_in_loop(move || cb(&conn));
        }
    }

    fn handle_close(&self) {
        self.event_loop.assert_in_loop_thread();
        if self.state() == ConnState::Disconnected {
            return;
        }
        tracing::debug!(name = %self.name, state = ?self.state(), "closing");
        self.set_state(ConnState::Disconnected);
        self.channel.disable_all();

        let Some(guard) = self.strong() else { return };
        let connection_cb = self.connection_cb.lock().clone();
        if let Some(cb) = connection_cb {
            cb(&guard);
        }
        let close_cb = self.close_cb.lock().clone();
        if let Some(cb) = close_cb {
            cb(&guard);
        }
    }

    fn handle_error(&self) {
        self.event_loop.assert_in_loop_thread();
        let err = socket_error(self.channel.fd());
        tracing::error!(
            name = %self.name,
            so_error = err,
            "connection error: {}",
            std::io::Error::from_raw_os_error(err)
        );
        self.handle_close();
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        if self.state() != ConnState::Disconnected {
            tracing::warn!(name = %self.name, state = ?self.state(), "connection dropped before teardown");
        } else {
            tracing::trace!(name = %self.name, "connection dropped");
        }
    }
}

/// `send(2)` with `MSG_NOSIGNAL` so a dead peer yields `EPIPE` instead of
/// `SIGPIPE`.
fn write_fd(fd: RawFd, data: &[u8]) -> std::io::Result<usize> {
    if data.is_empty() {
        return Ok(0);
    }
    let n = unsafe {
        libc::send(
            fd,
            data.as_ptr() as *const libc::c_void,
            data.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    if n < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn socket_error(fd: RawFd) -> i32 {
    let mut optval: libc::c_int = 0;
    let mut optlen = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut optval as *mut libc::c_int as *mut libc::c_void,
            &mut optlen,
        )
    };
    if rc < 0 {
        std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
    } else {
        optval
    }
}

/// The high-water callback fires on the transition from below to at-or-above
/// the mark, not on every subsequent write.
#[inline]
fn crosses_high_water(old_len: usize, added: usize, mark: usize) -> bool {
    old_len < mark && old_len + added >= mark
}
