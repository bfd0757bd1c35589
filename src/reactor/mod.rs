//! Reactor module - the event loop and its channels.
//!
//! A single-threaded reactor waits on the readiness multiplexer, dispatches
//! per-descriptor [`Channel`] callbacks, and drains closures queued from
//! other threads. Everything that mutates loop state runs on the loop's
//! owning thread.

mod channel;
mod event_loop;

pub use channel::{Channel, EventCallback, ERROR, HUP, READABLE, WRITABLE};
pub use event_loop::EventLoop;
