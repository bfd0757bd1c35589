//! Single-threaded reactor over the readiness multiplexer.
//!
//! One `mio::Poll` per loop; all I/O dispatch and every channel-registry
//! mutation happens on the thread that created the loop, so the
//! multiplexer's interest set and the `channels` map agree by construction.
//! Other threads interact only through [`run_in_loop`](EventLoop::run_in_loop)
//! and [`queue_in_loop`](EventLoop::queue_in_loop); a `mio::Waker` (an
//! event-counter descriptor on Linux) registered on a reserved token forces
//! the poller out of its wait when work is queued from outside.

use std::collections::HashMap;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use mio::event::Event;
use mio::{Events, Poll, Registry, Token, Waker};
use parking_lot::Mutex;

use super::channel::{Channel, ERROR, HUP, READABLE, WRITABLE};
use crate::error::Result;

/// Reserved token for the wake-up descriptor.
const WAKER_TOKEN: Token = Token(0);

/// Readiness notifications handled per poll iteration.
const MAX_EVENTS: usize = 64;

type PendingTask = Box<dyn FnOnce() + Send>;

pub struct EventLoop {
    poll: Mutex<Poll>,
    registry: Registry,
    waker: Waker,
    channels: Mutex<HashMap<Token, Arc<Channel>>>,
    pending: Mutex<Vec<PendingTask>>,
    thread_id: ThreadId,
    looping: AtomicBool,
    quit: AtomicBool,
    calling_pending: AtomicBool,
    next_token: AtomicUsize,
}

impl EventLoop {
    /// Create a loop owned by the calling thread.
    ///
    /// Multiplexer or wake-up descriptor creation failures are fatal
    /// initialization errors; callers are expected to abort on them.
    pub fn new() -> Result<Arc<Self>> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let thread_id = thread::current().id();
        tracing::debug!(?thread_id, "event loop created");

        Ok(Arc::new(Self {
            poll: Mutex::new(poll),
            registry,
            waker,
            channels: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            thread_id,
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
            next_token: AtomicUsize::new(WAKER_TOKEN.0 + 1),
        }))
    }

    /// Run the reactor until [`quit`](Self::quit).
    ///
    /// Must be called on the thread that created the loop.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        assert!(!self.looping.swap(true, Ordering::AcqRel), "loop already running");
        self.quit.store(false, Ordering::Release);
        tracing::debug!("event loop running");

        let mut events = Events::with_capacity(MAX_EVENTS);
        while !self.quit.load(Ordering::Acquire) {
            let poll_result = self.poll.lock().poll(&mut events, None);
            match poll_result {
                Ok(()) => {
                    for event in events.iter() {
                        if event.token() == WAKER_TOKEN {
                            tracing::trace!("event loop woken up");
                            continue;
                        }
                        let channel = self.channels.lock().get(&event.token()).cloned();
                        match channel {
                            Some(channel) => {
                                channel.set_revents(readiness_of(event));
                                channel.dispatch();
                            }
                            None => {
                                tracing::trace!(token = event.token().0, "event for detached channel")
                            }
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => tracing::error!(error = %err, "poll failed"),
            }
            self.drain_pending();
        }

        // One final drain so closures queued just before quit still run.
        self.drain_pending();
        self.looping.store(false, Ordering::Release);
        tracing::debug!("event loop stopped");
    }

    /// Ask the loop to exit at the next iteration boundary.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Run `f` now when called on the loop thread, otherwise queue it.
    pub fn run_in_loop<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Queue `f` for execution on the loop thread.
    pub fn queue_in_loop<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pending.lock().push(Box::new(f));
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    #[inline]
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "event loop owned by {:?} was accessed from {:?}",
                self.thread_id,
                thread::current().id()
            );
        }
    }

    fn wakeup(&self) {
        if let Err(err) = self.waker.wake() {
            tracing::error!(error = %err, "failed to wake event loop");
        }
    }

    fn drain_pending(&self) {
        self.calling_pending.store(true, Ordering::Release);
        let tasks = std::mem::take(&mut *self.pending.lock());
        if !tasks.is_empty() {
            tracing::trace!(count = tasks.len(), "running pending closures");
        }
        for task in tasks {
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                tracing::error!("pending closure panicked");
            }
        }
        self.calling_pending.store(false, Ordering::Release);
    }

    pub(crate) fn allocate_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn registry(&self) -> io::Result<Registry> {
        self.registry.try_clone()
    }

    pub(crate) fn attach_channel(&self, channel: &Arc<Channel>) {
        self.channels.lock().insert(channel.token(), Arc::clone(channel));
    }

    pub(crate) fn detach_channel(&self, token: Token) {
        self.channels.lock().remove(&token);
    }
}

/// Map a mio event to channel readiness bits.
///
/// `RDHUP` (peer closed its write half) is folded into `READABLE` so the
/// read path observes the EOF; a full hang-up additionally sets `HUP`.
fn readiness_of(event: &Event) -> u8 {
    let mut bits = 0;
    if event.is_readable() || event.is_priority() || event.is_read_closed() {
        bits |= READABLE;
    }
    if event.is_writable() {
        bits |= WRITABLE;
    }
    if event.is_error() {
        bits |= ERROR;
    }
    if event.is_read_closed() && event.is_write_closed() {
        bits |= HUP;
    }
    bits
}
