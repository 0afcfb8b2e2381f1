//! Single-threaded cooperative event loop.
//!
//! Grounded directly in the teacher's `Listener::run` (`examples/ryanseipp-rask-old/src/listener.rs`):
//! compute a poll timeout, call `Poll::poll`, dispatch by `Token`, repeat. Where the
//! teacher is monomorphic over one connection type, this reactor is generalized to a
//! trait object per the design notes: `Box<dyn Handle>` in place of inheritance, so an
//! acceptor handle, a TLS handshake handle, and a detector handle can all be
//! registered side by side and swapped in place as a connection progresses.
//!
//! Handle callbacks must not block. Suspension is implicit: a handle "suspends" by
//! returning from its callback and waiting to be re-polled.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;

const WAKE_TOKEN: Token = Token(usize::MAX);

/// What the reactor should do with a handle after dispatching a callback to it.
#[derive(Debug, Default, PartialEq, Eq)]
pub enum Action {
    /// Keep the handle registered, recomputing its interest.
    #[default]
    Continue,
    /// Deregister and drop the handle; its socket is closed.
    Close,
    /// Drop the handle from the reactor without touching its socket: ownership of
    /// the underlying connection has already moved to a detector's handler.
    HandOff,
}

/// The outcome of a single callback: what to do with the handle that produced it, and
/// any new handles it spawned (used by the acceptor handle, which may accept several
/// connections in one `handle_read`).
#[derive(Default)]
pub struct HandleResult {
    pub action: Action,
    pub spawn: Vec<Box<dyn Handle>>,
}

impl HandleResult {
    pub fn continue_() -> Self {
        Self::default()
    }

    pub fn close() -> Self {
        Self {
            action: Action::Close,
            spawn: Vec::new(),
        }
    }

    /// The handle's connection has been moved into a detector's handler; the
    /// reactor should stop tracking it without deregistering or closing its socket.
    pub fn handed_off() -> Self {
        Self {
            action: Action::HandOff,
            spawn: Vec::new(),
        }
    }

    pub fn spawning(handles: Vec<Box<dyn Handle>>) -> Self {
        Self {
            action: Action::Continue,
            spawn: handles,
        }
    }
}

/// A reactor-registered participant: a listening socket or one connection.
///
/// Corresponds to the capability set in the design notes: `readable`/`writable` for
/// interest, the `handle_*` callbacks, and `next_check_interval` for deadline-driven
/// reconsideration. A handle whose behavior needs to change in place (handshake →
/// detector) does so internally, keeping the same `Handle` object, socket, and
/// registration token; the reactor never needs to know.
pub trait Handle: Send {
    /// Whether this handle currently wants to be notified of readability.
    fn readable(&self) -> bool {
        true
    }

    /// Whether this handle currently wants to be notified of writability.
    fn writable(&self) -> bool {
        false
    }

    /// Upper bound on how long the reactor may wait before this handle needs
    /// reconsideration, used to drive deadlines. `None` means no deadline.
    ///
    /// Implementations must return `max(deadline - now, 0)`, never a negative
    /// duration. Clamping to zero, not `min`, is what makes an elapsed deadline
    /// fire promptly rather than being reported as "no timeout at all".
    fn next_check_interval(&self) -> Option<Duration> {
        None
    }

    fn interest(&self) -> Interest {
        let mut interest = None;
        if self.readable() {
            interest = Some(Interest::READABLE);
        }
        if self.writable() {
            interest = Some(match interest {
                Some(existing) => existing | Interest::WRITABLE,
                None => Interest::WRITABLE,
            });
        }
        interest.unwrap_or(Interest::READABLE)
    }

    /// The handle's underlying `mio` source, used for (re)registration.
    fn source(&mut self) -> &mut dyn Source;

    fn handle_read(&mut self) -> HandleResult {
        HandleResult::continue_()
    }

    fn handle_write(&mut self) -> HandleResult {
        HandleResult::continue_()
    }

    fn handle_error(&mut self) -> HandleResult {
        HandleResult::close()
    }

    fn handle_close(&mut self) {}

    /// Called by the reactor when `next_check_interval` has reached zero. Default
    /// implementation does nothing; handles with real deadlines (handshake,
    /// detector) override this to close the connection.
    fn check_deadline(&mut self) -> HandleResult {
        HandleResult::continue_()
    }
}

/// A cheap, `Send`-able way to stop a reactor running on another thread.
#[derive(Clone)]
pub struct Stopper {
    stopped: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl Stopper {
    /// Halts the reactor loop. Pending handles are dropped and their sockets closed.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        // Poll may be blocked indefinitely; nudge it so the stop flag is observed
        // promptly instead of waiting for the next unrelated readiness event.
        let _ = self.waker.wake();
    }
}

/// The event loop itself.
pub struct Reactor {
    poll: Poll,
    handles: Slab<Box<dyn Handle>>,
    stopped: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Self {
            poll,
            handles: Slab::new(),
            stopped: Arc::new(AtomicBool::new(false)),
            waker,
        })
    }

    /// Returns a handle that can stop this reactor from another thread.
    pub fn stopper(&self) -> Stopper {
        Stopper {
            stopped: self.stopped.clone(),
            waker: self.waker.clone(),
        }
    }

    /// Registers a new handle and returns the token it was assigned.
    pub fn register(&mut self, mut handle: Box<dyn Handle>) -> io::Result<Token> {
        let entry = self.handles.vacant_entry();
        let token = Token(entry.key());
        let interest = handle.interest();
        self.poll.registry().register(handle.source(), token, interest)?;
        entry.insert(handle);
        Ok(token)
    }

    fn reregister(&mut self, token: Token) -> io::Result<()> {
        if let Some(handle) = self.handles.get_mut(token.0) {
            let interest = handle.interest();
            self.poll
                .registry()
                .reregister(handle.source(), token, interest)?;
        }
        Ok(())
    }

    fn remove(&mut self, token: Token) {
        if let Some(mut handle) = self.handles.try_remove(token.0) {
            let _ = self.poll.registry().deregister(handle.source());
            handle.handle_close();
        }
    }

    fn apply(&mut self, token: Token, result: HandleResult) -> io::Result<()> {
        match result.action {
            Action::Close => self.remove(token),
            Action::HandOff => {
                self.handles.try_remove(token.0);
            }
            Action::Continue => self.reregister(token)?,
        }
        for spawned in result.spawn {
            self.register(spawned)?;
        }
        Ok(())
    }

    fn poll_timeout(&self) -> Option<Duration> {
        self.handles
            .iter()
            .filter_map(|(_, handle)| handle.next_check_interval())
            .min()
    }

    /// Runs the event loop until [`Stopper::stop`] is called.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);

        while !self.stopped.load(Ordering::Acquire) {
            let timeout = self.poll_timeout();
            match self.poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            if self.stopped.load(Ordering::Acquire) {
                break;
            }

            let dispatched: Vec<(Token, bool, bool, bool)> = events
                .iter()
                .filter(|event| event.token() != WAKE_TOKEN)
                .map(|event| {
                    (
                        event.token(),
                        event.is_readable(),
                        event.is_writable(),
                        event.is_error(),
                    )
                })
                .collect();

            for (token, readable, writable, errored) in dispatched {
                if errored {
                    let result = self
                        .handles
                        .get_mut(token.0)
                        .map(|handle| handle.handle_error());
                    if let Some(result) = result {
                        self.apply(token, result)?;
                    }
                    continue;
                }

                if readable {
                    let result = self
                        .handles
                        .get_mut(token.0)
                        .map(|handle| handle.handle_read());
                    if let Some(result) = result {
                        self.apply(token, result)?;
                    }
                }

                if writable {
                    let result = self
                        .handles
                        .get_mut(token.0)
                        .map(|handle| handle.handle_write());
                    if let Some(result) = result {
                        self.apply(token, result)?;
                    }
                }
            }

            let expired: Vec<Token> = self
                .handles
                .iter()
                .filter(|(_, handle)| matches!(handle.next_check_interval(), Some(d) if d.is_zero()))
                .map(|(key, _)| Token(key))
                .collect();

            for token in expired {
                let result = self
                    .handles
                    .get_mut(token.0)
                    .map(|handle| handle.check_deadline());
                if let Some(result) = result {
                    self.apply(token, result)?;
                }
            }
        }

        Ok(())
    }
}
