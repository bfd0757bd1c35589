//! Server assembly: acceptor wiring, connection registry, frame dispatch.
//!
//! `TcpServer` owns the acceptor and a registry of live connections keyed by
//! a unique name (`<server>-<peer ip>:<peer port>#<id>`). The registry is
//! mutated only on the loop thread. Each complete inbound frame is handed to
//! the thread pool; the handler's reply is re-framed and sent back through
//! the connection's thread-safe `send`, so two frames on one connection may
//! legitimately complete (and answer) out of order.

mod handlers;

pub use handlers::{HandlerTable, ProtocolHandler, Reply};

use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::buffer::Buffer;
use crate::error::Result;
use crate::net::{
    Acceptor, ConnectionCallback, TcpConnection, WriteCompleteCallback, DEFAULT_HIGH_WATER_MARK,
};
use crate::pool::ThreadPool;
use crate::protocol::{self, tags, try_parse, Frame, Parse};
use crate::reactor::EventLoop;

/// Default service port.
pub const DEFAULT_PORT: u16 = 3040;

pub struct TcpServer {
    self_ref: Weak<TcpServer>,
    event_loop: Arc<EventLoop>,
    name: String,
    acceptor: Arc<Acceptor>,
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
    handlers: Arc<HandlerTable>,
    next_conn_id: AtomicU64,
    started: AtomicBool,
    high_water_mark: AtomicUsize,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
}

impl TcpServer {
    pub fn new(event_loop: &Arc<EventLoop>, port: u16, name: impl Into<String>) -> Result<Arc<Self>> {
        Self::with_reuse_port(event_loop, port, name, true)
    }

    pub fn with_reuse_port(
        event_loop: &Arc<EventLoop>,
        port: u16,
        name: impl Into<String>,
        reuse_port: bool,
    ) -> Result<Arc<Self>> {
        let acceptor = Acceptor::new(event_loop, port, reuse_port)?;
        let server = Arc::new_cyclic(|weak: &Weak<TcpServer>| Self {
            self_ref: weak.clone(),
            event_loop: Arc::clone(event_loop),
            name: name.into(),
            acceptor,
            connections: Mutex::new(HashMap::new()),
            handlers: Arc::new(HandlerTable::new()),
            next_conn_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            connection_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
        });

        let weak = server.self_ref.clone();
        server
            .acceptor
            .set_new_connection_callback(Arc::new(move |socket, peer| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(socket, peer);
                }
            }));

        tracing::debug!(name = %server.name, "server created");
        Ok(server)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    /// The bound port (useful when constructed with port 0).
    #[inline]
    pub fn local_port(&self) -> u16 {
        self.acceptor.local_port()
    }

    pub fn register_handler(&self, tag: impl Into<String>, handler: ProtocolHandler) {
        self.handlers.register(tag, handler);
    }

    pub fn set_default_handler(&self, handler: ProtocolHandler) {
        self.handlers.set_default(handler);
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_cb.lock() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_cb.lock() = Some(cb);
    }

    /// Output-buffer threshold applied to every new connection.
    pub fn set_high_water_mark(&self, mark: usize) {
        self.high_water_mark.store(mark, Ordering::Release);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Start listening. Idempotent.
    pub fn start(&self) {
        if !self.started.swap(true, Ordering::AcqRel) {
            let Some(server) = self.self_ref.upgrade() else { return };
            self.event_loop.run_in_loop(move || {
                server.acceptor.listen();
                tracing::info!(name = %server.name, port = server.local_port(), "server started");
            });
        }
    }

    fn new_connection(&self, socket: TcpStream, peer: SocketAddr) {
        self.event_loop.assert_in_loop_thread();

        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, peer, id);
        tracing::info!(name = %conn_name, "new connection");

        let conn = match TcpConnection::new(&self.event_loop, conn_name.clone(), socket, peer) {
            Ok(conn) => conn,
            Err(err) => {
                tracing::error!(error = %err, "failed to set up connection");
                return;
            }
        };
        conn.set_high_water_mark(self.high_water_mark.load(Ordering::Acquire));

        if let Some(cb) = self.connection_cb.lock().clone() {
            conn.set_connection_callback(cb);
        }
        if let Some(cb) = self.write_complete_cb.lock().clone() {
            conn.set_write_complete_callback(cb);
        }
        {
            let server = self.self_ref.clone();
            conn.set_message_callback(Arc::new(move |conn, buffer| {
                if let Some(server) = server.upgrade() {
                    server.on_message(conn, buffer);
                }
            }));
        }
        {
            let server = self.self_ref.clone();
            conn.set_close_callback(Arc::new(move |conn| {
                if let Some(server) = server.upgrade() {
                    server.remove_connection(conn);
                }
            }));
        }

        self.connections.lock().insert(conn_name, Arc::clone(&conn));
        self.event_loop.run_in_loop(move || conn.connect_established());
    }

    /// Framing loop over the connection's input buffer: dispatch every
    /// complete frame, keep partial ones buffered, force-close on violation.
    fn on_message(&self, conn: &Arc<TcpConnection>, buffer: &mut Buffer) {
        loop {
            match try_parse(buffer) {
                Parse::NeedMore => break,
                Parse::Frame(frame) => self.dispatch_frame(conn, frame),
                Parse::Violation(reason) => {
                    tracing::error!(conn = %conn.name(), %reason, "protocol violation, closing");
                    buffer.retrieve_all();
                    conn.force_close();
                    break;
                }
            }
        }
    }

    fn dispatch_frame(&self, conn: &Arc<TcpConnection>, frame: Frame) {
        let Some(handler) = self.handlers.lookup(frame.tag()) else {
            tracing::warn!(tag = %frame.tag(), "no handler for tag, frame dropped");
            return;
        };

        // Handlers run off the loop thread. The task keeps the connection
        // handle alive so a late reply can always be delivered (send drops
        // it silently if the peer is gone by then).
        let conn = Arc::clone(conn);
        ThreadPool::global().spawn(0, move || {
            let reply = match catch_unwind(AssertUnwindSafe(|| {
                handler(&conn, frame.tag(), frame.payload())
            })) {
                Ok(reply) => reply,
                Err(_) => {
                    tracing::error!(tag = %frame.tag(), conn = %conn.name(), "handler panicked");
                    Some(Reply::new(
                        tags::ERROR_INFORMATION,
                        b"internal server error".to_vec(),
                    ))
                }
            };

            if let Some(reply) = reply {
                match protocol::package_message(&reply.tag, &reply.payload) {
                    Ok(framed) => conn.send(&framed),
                    Err(err) => {
                        tracing::error!(tag = %reply.tag, error = %err, "failed to package reply")
                    }
                }
            }
        });
    }

    fn remove_connection(&self, conn: &Arc<TcpConnection>) {
        let Some(server) = self.self_ref.upgrade() else { return };
        let conn = Arc::clone(conn);
        self.event_loop
            .run_in_loop(move || server.remove_connection_in_loop(&conn));
    }

    fn remove_connection_in_loop(&self, conn: &Arc<TcpConnection>) {
        self.event_loop.assert_in_loop_thread();
        tracing::info!(conn = %conn.name(), "removing connection");
        self.connections.lock().remove(conn.name());

        let conn = Arc::clone(conn);
        self.event_loop.queue_in_loop(move || conn.connect_destroyed());
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        let connections: Vec<_> = self.connections.lock().drain().map(|(_, c)| c).collect();
        for conn in connections {
            self.event_loop.run_in_loop(move || conn.connect_destroyed());
        }
        tracing::debug!(name = %self.name, "server destroyed");
    }
}
