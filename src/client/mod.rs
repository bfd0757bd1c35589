//! Client side of the protocol: blocking connector plus handler dispatch.
//!
//! The client mirrors the server's framing but not its reactor: one sender
//! thread drains a queue of pre-framed messages, one receiver thread feeds
//! the shared framing parser and dispatches payloads to per-tag handlers on
//! the global thread pool. That keeps a GUI (or CLI) front-end's own thread
//! free while responses arrive.
//!
//! # Example
//!
//! ```no_run
//! use forgewire::client::Client;
//! use forgewire::protocol::tags;
//!
//! let client = Client::builder()
//!     .handle(tags::HELLO, |payload| {
//!         println!("server says: {}", String::from_utf8_lossy(payload));
//!     })
//!     .on_error(|msg| eprintln!("transport error: {msg}"))
//!     .connect("127.0.0.1:3040")
//!     .unwrap();
//!
//! client.send_message(tags::HELLO, b"Hello from client!").unwrap();
//! ```

use std::collections::{HashMap, VecDeque};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::buffer::Buffer;
use crate::error::{ForgewireError, Result};
use crate::pool::ThreadPool;
use crate::protocol::{package_message, try_parse, Parse};

/// Per-tag payload handler. Runs on the global thread pool.
pub type ClientHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;
/// Invoked with `true` on connect and `false` on disconnect.
pub type ConnectionCallback = Arc<dyn Fn(bool) + Send + Sync>;
/// Invoked with a human-readable description of a transport error.
pub type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Fluent configuration for a [`Client`].
pub struct ClientBuilder {
    handlers: HashMap<String, ClientHandler>,
    default_handler: Option<ClientHandler>,
    connection_cb: Option<ConnectionCallback>,
    error_cb: Option<ErrorCallback>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            default_handler: None,
            connection_cb: None,
            error_cb: None,
        }
    }

    /// Register a handler for frames carrying `tag`.
    pub fn handle<F>(mut self, tag: &str, handler: F) -> Self
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.handlers.insert(tag.to_string(), Arc::new(handler));
        self
    }

    /// Handler for tags nothing else matched.
    pub fn default_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.default_handler = Some(Arc::new(handler));
        self
    }

    pub fn on_connection<F>(mut self, cb: F) -> Self
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.connection_cb = Some(Arc::new(cb));
        self
    }

    pub fn on_error<F>(mut self, cb: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.error_cb = Some(Arc::new(cb));
        self
    }

    /// Connect and start the I/O threads.
    pub fn connect(self, addr: impl ToSocketAddrs) -> Result<Client> {
        let stream = TcpStream::connect(addr)?;
        tracing::debug!(peer = %stream.peer_addr()?, "connected");
        Client::start(self, stream)
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct SendQueue {
    queue: VecDeque<Vec<u8>>,
}

struct ClientInner {
    stream: TcpStream,
    connected: AtomicBool,
    stop: AtomicBool,
    send_state: Mutex<SendQueue>,
    send_cv: Condvar,
    handlers: HashMap<String, ClientHandler>,
    default_handler: Option<ClientHandler>,
    connection_cb: Option<ConnectionCallback>,
    error_cb: Option<ErrorCallback>,
}

impl ClientInner {
    fn report_error(&self, message: &str) {
        tracing::error!(%message, "client transport error");
        if let Some(cb) = &self.error_cb {
            cb(message);
        }
    }

    /// Stop both I/O threads and fire the disconnect notification. Safe to
    /// call from either thread; only the first caller acts.
    fn request_disconnect(&self, reason: &str) {
        if !self.stop.swap(true, Ordering::AcqRel) {
            tracing::debug!(%reason, "disconnecting");
            let _ = self.stream.shutdown(Shutdown::Both);
            self.send_cv.notify_all();
            if self.connected.swap(false, Ordering::AcqRel) {
                if let Some(cb) = &self.connection_cb {
                    cb(false);
                }
            }
        }
    }

    fn dispatch(&self, tag: &str, payload: bytes::Bytes) {
        let handler = self
            .handlers
            .get(tag)
            .or(self.default_handler.as_ref())
            .cloned();
        match handler {
            Some(handler) => {
                let tag = tag.to_string();
                ThreadPool::global().spawn(0, move || {
                    if catch_unwind(AssertUnwindSafe(|| handler(&payload))).is_err() {
                        tracing::error!(%tag, "client handler panicked");
                    }
                });
            }
            None => {
                tracing::warn!(%tag, len = payload.len(), "no handler for tag, payload dropped")
            }
        }
    }
}

/// A connected client. Dropping it disconnects and joins the I/O threads.
pub struct Client {
    inner: Arc<ClientInner>,
    send_thread: Mutex<Option<JoinHandle<()>>>,
    recv_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    fn start(builder: ClientBuilder, stream: TcpStream) -> Result<Client> {
        let inner = Arc::new(ClientInner {
            stream,
            connected: AtomicBool::new(true),
            stop: AtomicBool::new(false),
            send_state: Mutex::new(SendQueue {
                queue: VecDeque::new(),
            }),
            send_cv: Condvar::new(),
            handlers: builder.handlers,
            default_handler: builder.default_handler,
            connection_cb: builder.connection_cb,
            error_cb: builder.error_cb,
        });

        let send_thread = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("forgewire-client-send".to_string())
                .spawn(move || sender_loop(inner))?
        };
        let recv_thread = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("forgewire-client-recv".to_string())
                .spawn(move || receiver_loop(inner))?
        };

        if let Some(cb) = &inner.connection_cb {
            cb(true);
        }

        Ok(Client {
            inner,
            send_thread: Mutex::new(Some(send_thread)),
            recv_thread: Mutex::new(Some(recv_thread)),
        })
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Frame and queue `(tag, payload)` for sending.
    pub fn send_message(&self, tag: &str, payload: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(ForgewireError::ConnectionClosed);
        }
        let framed = package_message(tag, payload)?;
        self.inner.send_state.lock().queue.push_back(framed);
        self.inner.send_cv.notify_one();
        Ok(())
    }

    /// Read a file and send it as `<basename>\0<contents>` under `tag` —
    /// the payload layout the compile-execute service expects.
    pub fn send_source(&self, tag: &str, path: &Path) -> Result<()> {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return Err(ForgewireError::Protocol(format!(
                "path has no basename: {}",
                path.display()
            )));
        };
        let contents = std::fs::read(path)?;

        let mut payload = Vec::with_capacity(name.len() + 1 + contents.len());
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        payload.extend_from_slice(&contents);
        self.send_message(tag, &payload)
    }

    /// Disconnect and join the I/O threads. Idempotent.
    pub fn disconnect(&self) {
        self.inner.request_disconnect("user request");
        if let Some(handle) = self.send_thread.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.recv_thread.lock().take() {
            let _ = handle.join();
        }
        self.inner.send_state.lock().queue.clear();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn sender_loop(inner: Arc<ClientInner>) {
    loop {
        let message = {
            let mut state = inner.send_state.lock();
            while state.queue.is_empty() && !inner.stop.load(Ordering::Acquire) {
                inner.send_cv.wait(&mut state);
            }
            if inner.stop.load(Ordering::Acquire) {
                return;
            }
            state.queue.pop_front()
        };
        let Some(message) = message else { continue };

        if let Err(err) = send_all(inner.stream.as_raw_fd(), &message) {
            inner.report_error(&format!("send failed: {err}"));
            inner.request_disconnect("send failure");
            return;
        }
    }
}

fn receiver_loop(inner: Arc<ClientInner>) {
    let fd = inner.stream.as_raw_fd();
    let mut buffer = Buffer::new();

    loop {
        if inner.stop.load(Ordering::Acquire) {
            return;
        }
        match buffer.read_from_fd(fd) {
            Ok(0) => {
                inner.request_disconnect("peer closed the connection");
                return;
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                if !inner.stop.load(Ordering::Acquire) {
                    inner.report_error(&format!("receive failed: {err}"));
                    inner.request_disconnect("receive failure");
                }
                return;
            }
        }

        loop {
            match try_parse(&mut buffer) {
                Parse::NeedMore => break,
                Parse::Frame(frame) => {
                    let (tag, payload) = frame.into_parts();
                    inner.dispatch(&tag, payload);
                }
                Parse::Violation(reason) => {
                    inner.report_error(&format!("protocol violation from server: {reason}"));
                    buffer.retrieve_all();
                    inner.request_disconnect("protocol violation");
                    return;
                }
            }
        }
    }
}

/// Write the whole message with `MSG_NOSIGNAL`, retrying short writes and
/// `EINTR`.
fn send_all(fd: RawFd, mut data: &[u8]) -> std::io::Result<()> {
    while !data.is_empty() {
        let n = unsafe {
            libc::send(
                fd,
                data.as_ptr() as *const libc::c_void,
                data.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        data = &data[n as usize..];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_collects_handlers() {
        let builder = Client::builder()
            .handle("a", |_| {})
            .handle("b", |_| {})
            .default_handler(|_| {})
            .on_connection(|_| {})
            .on_error(|_| {});

        assert_eq!(builder.handlers.len(), 2);
        assert!(builder.default_handler.is_some());
        assert!(builder.connection_cb.is_some());
        assert!(builder.error_cb.is_some());
    }

    #[test]
    fn test_connect_refused() {
        // Port 1 on loopback is essentially never listening.
        let result = Client::builder().connect("127.0.0.1:1");
        assert!(result.is_err());
    }

    #[test]
    fn test_send_source_requires_basename() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unit.src");
        std::fs::write(&path, b"contents").unwrap();

        // Loopback pair so a real client exists to call send_source on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = Client::builder().connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();

        client.send_source("compile-execute", &path).unwrap();

        // The framed payload is <basename>\0<contents>.
        use std::io::Read;
        let mut raw = vec![0u8; 64];
        server_side.set_read_timeout(Some(std::time::Duration::from_secs(5))).unwrap();
        let n = (&server_side).read(&mut raw).unwrap();
        let raw = &raw[..n];
        let tag_len = raw[0] as usize;
        assert_eq!(&raw[1..1 + tag_len], b"compile-execute");
        let payload = &raw[1 + tag_len + 4..];
        assert_eq!(payload, b"unit.src\0contents");

        client.disconnect();
    }
}
