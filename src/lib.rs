//! # forgewire
//!
//! Remote compile-and-execute service over a persistent TCP connection.
//!
//! A client submits a source file inside one length-prefixed tagged frame;
//! the server persists it, invokes a compiler, runs the produced executable
//! with captured standard streams, and answers on the same connection. The
//! crate is split into a reusable networking/execution core and the thin
//! service layer on top:
//!
//! - **Reactor** ([`reactor`]): a single-threaded event loop over the
//!   readiness multiplexer, with per-descriptor channels and cross-thread
//!   wake-up.
//! - **Framing** ([`protocol`]): `tag_len | tag | payload_len | payload`
//!   frames with partial-read reassembly and a 64 MiB bound.
//! - **Connections** ([`net`]): acceptor with reserved-fd degradation and a
//!   buffered, back-pressured connection state machine.
//! - **Workers** ([`pool`]): a priority thread pool; handlers never run on
//!   the reactor thread.
//! - **Subprocesses** ([`process`]): pipe/fork/exec/wait with outcome
//!   classification.
//! - **Assemblies**: [`server`] (acceptor + handler registry) and
//!   [`client`] (connector + handler registry), plus the compile-execute
//!   [`service`].
//!
//! ## Server
//!
//! ```no_run
//! use forgewire::reactor::EventLoop;
//! use forgewire::server::{TcpServer, DEFAULT_PORT};
//! use forgewire::service::{register_service, ServiceConfig};
//!
//! let config = ServiceConfig::default();
//! config.ensure_directories().unwrap();
//!
//! let event_loop = EventLoop::new().unwrap();
//! let server = TcpServer::new(&event_loop, DEFAULT_PORT, "forged").unwrap();
//! register_service(&server, config);
//! server.start();
//! event_loop.run();
//! ```

pub mod buffer;
pub mod client;
pub mod error;
pub mod fd;
pub mod net;
pub mod pool;
pub mod process;
pub mod protocol;
pub mod reactor;
pub mod server;
pub mod service;

pub use buffer::Buffer;
pub use client::{Client, ClientBuilder};
pub use error::{ForgewireError, Result};
pub use net::{Acceptor, TcpConnection};
pub use pool::ThreadPool;
pub use protocol::{package_message, Frame, MAX_FRAME_SIZE};
pub use reactor::{Channel, EventLoop};
pub use server::{TcpServer, DEFAULT_PORT};
