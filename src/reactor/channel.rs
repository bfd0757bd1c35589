//! Channel - the reactor's handle to one descriptor.
//!
//! A channel binds a raw descriptor to its event loop: it carries the
//! interest mask, the latest readiness bits, and the three event callbacks.
//! It does not own the descriptor; ownership stays with the socket (or the
//! acceptor's listener guard). The optional "tie" is a weak reference to
//! the channel's logical owner, promoted to a strong reference for the
//! duration of one dispatch so a late readiness event for an already
//! dropped connection is detected and skipped.

use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;

use super::event_loop::EventLoop;
use crate::error::Result;

/// Readiness bit: data (or an incoming connection) can be read.
pub const READABLE: u8 = 0b0000_0001;
/// Readiness bit: the descriptor accepts writes again.
pub const WRITABLE: u8 = 0b0000_0010;
/// Readiness bit: the descriptor is in an error state.
pub const ERROR: u8 = 0b0000_0100;
/// Readiness bit: hang-up, both directions closed.
pub const HUP: u8 = 0b0000_1000;

pub type EventCallback = Arc<dyn Fn() + Send + Sync>;

pub struct Channel {
    fd: RawFd,
    token: Token,
    registry: Registry,
    event_loop: Weak<EventLoop>,
    interest: AtomicU8,
    revents: AtomicU8,
    registered: AtomicBool,
    read_cb: Mutex<Option<EventCallback>>,
    write_cb: Mutex<Option<EventCallback>>,
    error_cb: Mutex<Option<EventCallback>>,
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
}

impl Channel {
    /// Create a channel for `fd` owned by `event_loop`.
    ///
    /// The channel starts with no interest and nothing registered with the
    /// multiplexer; callbacks must be installed before any interest is
    /// enabled.
    pub fn new(event_loop: &Arc<EventLoop>, fd: RawFd) -> Result<Arc<Self>> {
        let channel = Arc::new(Self {
            fd,
            token: event_loop.allocate_token(),
            registry: event_loop.registry()?,
            event_loop: Arc::downgrade(event_loop),
            interest: AtomicU8::new(0),
            revents: AtomicU8::new(0),
            registered: AtomicBool::new(false),
            read_cb: Mutex::new(None),
            write_cb: Mutex::new(None),
            error_cb: Mutex::new(None),
            tie: Mutex::new(None),
        });
        event_loop.attach_channel(&channel);
        Ok(channel)
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn on_read(&self, cb: EventCallback) {
        *self.read_cb.lock() = Some(cb);
    }

    pub fn on_write(&self, cb: EventCallback) {
        *self.write_cb.lock() = Some(cb);
    }

    pub fn on_error(&self, cb: EventCallback) {
        *self.error_cb.lock() = Some(cb);
    }

    /// Keep `owner` alive for the duration of each dispatch; skip dispatch
    /// entirely once the owner is gone.
    pub fn tie(&self, owner: &Arc<dyn Any + Send + Sync>) {
        *self.tie.lock() = Some(Arc::downgrade(owner));
    }

    pub fn enable_reading(&self) {
        debug_assert!(self.read_cb.lock().is_some(), "read callback missing");
        self.interest.fetch_or(READABLE, Ordering::AcqRel);
        self.update();
    }

    pub fn enable_writing(&self) {
        debug_assert!(self.write_cb.lock().is_some(), "write callback missing");
        self.interest.fetch_or(WRITABLE, Ordering::AcqRel);
        self.update();
    }

    pub fn disable_writing(&self) {
        self.interest.fetch_and(!WRITABLE, Ordering::AcqRel);
        self.update();
    }

    pub fn disable_all(&self) {
        self.interest.store(0, Ordering::Release);
        self.update();
    }

    #[inline]
    pub fn is_reading(&self) -> bool {
        self.interest.load(Ordering::Acquire) & READABLE != 0
    }

    #[inline]
    pub fn is_writing(&self) -> bool {
        self.interest.load(Ordering::Acquire) & WRITABLE != 0
    }

    #[inline]
    pub fn is_none_event(&self) -> bool {
        self.interest.load(Ordering::Acquire) == 0
    }

    /// Detach from the owning loop. Interest must already be disabled.
    pub fn remove(&self) {
        debug_assert!(self.is_none_event(), "removing a channel with live interest");
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.detach_channel(self.token);
        }
    }

    pub(crate) fn set_revents(&self, revents: u8) {
        self.revents.store(revents, Ordering::Release);
    }

    /// Run the callbacks selected by the current readiness bits.
    pub(crate) fn dispatch(&self) {
        // Promote the tie first; a dispatch that arrives after the owner
        // was dropped is skipped.
        let tie = self.tie.lock().clone();
        let _owner_guard: Option<Arc<dyn Any + Send + Sync>> = match tie {
            Some(weak) => match weak.upgrade() {
                Some(owner) => Some(owner),
                None => {
                    tracing::warn!(fd = self.fd, "readiness for dropped owner, skipping dispatch");
                    return;
                }
            },
            None => None,
        };

        let revents = self.revents.load(Ordering::Acquire);
        tracing::trace!(fd = self.fd, revents, "dispatching channel event");

        // Clone the callbacks out of their locks before invoking: a callback
        // is free to mutate this channel while it runs.
        if revents & (ERROR | HUP) != 0 && revents & READABLE == 0 {
            let cb = self.error_cb.lock().clone();
            if let Some(cb) = cb {
                cb();
            }
        }
        if revents & READABLE != 0 {
            let cb = self.read_cb.lock().clone();
            if let Some(cb) = cb {
                cb();
            }
        }
        if revents & WRITABLE != 0 {
            let cb = self.write_cb.lock().clone();
            if let Some(cb) = cb {
                cb();
            }
        }
    }

    /// Sync the interest mask to the multiplexer.
    fn update(&self) {
        let mask = self.interest.load(Ordering::Acquire);
        let interest = match (mask & READABLE != 0, mask & WRITABLE != 0) {
            (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };

        let mut source = SourceFd(&self.fd);
        let result = if self.registered.load(Ordering::Acquire) {
            match interest {
                Some(interest) => self.registry.reregister(&mut source, self.token, interest),
                None => {
                    self.registered.store(false, Ordering::Release);
                    self.registry.deregister(&mut source)
                }
            }
        } else {
            match interest {
                Some(interest) => {
                    let registered = self.registry.register(&mut source, self.token, interest);
                    if registered.is_ok() {
                        self.registered.store(true, Ordering::Release);
                    }
                    registered
                }
                None => Ok(()),
            }
        };

        if let Err(err) = result {
            tracing::error!(fd = self.fd, error = %err, "failed to sync channel interest");
        }
    }
}
