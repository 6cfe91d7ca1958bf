//! L1: the event loop. Watches timers, fd readiness and OS signals, and
//! delivers exactly one callback per event, all from a single thread.
//!
//! Built on `mio::Poll` for fd readiness — the portable epoll/kqueue/IOCP
//! abstraction the ecosystem reaches for, rather than hand-rolling a
//! per-platform syscall layer — and `signal_hook` for OS signal delivery.

pub mod io;
mod signal;
mod timer;

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use mio::Token;
use slab::Slab;

pub use io::{IoEvent, IoHandle, IoInterest};
pub use signal::SignalHandle;
pub use timer::TimerHandle;

use crate::config::RuntimeConfig;
use crate::error::RippleError;
use io::{IoCallback, IoWatch};
use signal::{SignalCallback, SignalTable};
use timer::{TimerCallback, TimerWheel};

pub(crate) const SIGNAL_TOKEN: Token = Token(usize::MAX);

/// The L1 event loop: owns the OS poller, the timer wheel and the signal
/// fan-out table. Not `Send`/`Sync` — it and everything built on it live on
/// one thread for the lifetime of the process (or embedding task).
pub struct Reactor {
    poll: mio::Poll,
    events: mio::Events,
    timers: TimerWheel,
    io_watches: Slab<IoWatch>,
    signals: SignalTable,
    live_io_watches: usize,
    stopping: bool,
}

impl Reactor {
    pub fn new(config: &RuntimeConfig) -> Result<Self, RippleError> {
        let poll = mio::Poll::new().map_err(|e| RippleError::ReactorSetupFailure(e.to_string()))?;
        let mut signals = SignalTable::new()?;
        signals.register_source(poll.registry(), SIGNAL_TOKEN)?;
        Ok(Self {
            poll,
            events: mio::Events::with_capacity(config.events_capacity.max(1)),
            timers: TimerWheel::new(),
            io_watches: Slab::new(),
            signals,
            live_io_watches: 0,
            stopping: false,
        })
    }

    /// Schedules `cb` to run once, after `delay` has elapsed (monotonic).
    pub fn setup_timer(&mut self, delay: Duration, cb: impl FnOnce() + 'static) -> TimerHandle {
        let handle = self.timers.setup(Instant::now(), delay, Box::new(cb));
        tracing::trace!(?delay, "timer armed");
        handle
    }

    pub fn cancel_timer(&mut self, handle: TimerHandle) {
        self.timers.cancel(handle);
        tracing::trace!("timer cancelled");
    }

    /// Registers interest in `mask` for `fd`; `cb` is invoked with the ready
    /// subset of `mask` every time the fd becomes ready (level-triggered),
    /// until cancelled.
    pub fn setup_io(
        &mut self,
        fd: RawFd,
        mask: IoInterest,
        cb: impl FnMut(IoEvent) + 'static,
    ) -> Result<IoHandle, RippleError> {
        let mut watch = IoWatch {
            fd,
            interest: mask,
            callback: Some(Box::new(cb) as IoCallback),
            registered: false,
        };
        let key = self.io_watches.vacant_key();
        watch.register(self.poll.registry(), Token(key))?;
        self.io_watches.insert(watch);
        self.live_io_watches += 1;
        tracing::trace!(fd, "io watch registered");
        Ok(IoHandle(key))
    }

    /// Retargets the interest mask for an existing watch without allocating
    /// a new handle.
    pub fn update_io(&mut self, handle: IoHandle, new_mask: IoInterest) -> Result<(), RippleError> {
        let watch = self
            .io_watches
            .get_mut(handle.0)
            .expect("update_io on a handle not obtained from setup_io or already cancelled");
        watch.interest = new_mask;
        let result = watch.reregister(self.poll.registry(), Token(handle.0));
        tracing::trace!(fd = watch.fd, "io watch mask updated");
        result
    }

    pub fn cancel_io(&mut self, handle: IoHandle) {
        if self.io_watches.contains(handle.0) {
            let mut watch = self.io_watches.remove(handle.0);
            watch.deregister(self.poll.registry());
            self.live_io_watches -= 1;
            tracing::trace!(fd = watch.fd, "io watch cancelled");
        }
    }

    /// Registers `cb` to run on every future occurrence of `signum`,
    /// in registration order relative to other callbacks for the same
    /// signum.
    pub fn setup_signal(
        &mut self,
        signum: i32,
        cb: impl FnMut() + 'static,
    ) -> Result<SignalHandle, RippleError> {
        let handle = self.signals.setup(signum, Box::new(cb) as SignalCallback)?;
        tracing::debug!(signum, "signal callback registered");
        Ok(handle)
    }

    pub fn cancel_signal(&mut self, handle: SignalHandle) {
        self.signals.cancel(handle);
        tracing::debug!("signal callback cancelled");
    }

    pub fn live_io_watch_count(&self) -> usize {
        self.live_io_watches
    }

    /// Runs the dispatch loop until `stop()` is called from inside a
    /// callback, or until there is nothing left to wait for (no live I/O
    /// watches, timers or signal registrations) — a convenience absent from
    /// the distilled spec but present in the source's "stop when no actives
    /// remain" behavior (see SPEC_FULL.md §11).
    pub fn start(&mut self) -> Result<(), RippleError> {
        self.stopping = false;
        while self.has_pending_work() && !self.stopping {
            self.turn()?;
        }
        Ok(())
    }

    /// Runs exactly one iteration of the dispatch loop: a single
    /// `mio::Poll::poll`, fan-out of whatever fired, and a timer sweep.
    /// Exposed so [`crate::dispatcher::Dispatcher`] can interleave polling
    /// ready tasks between turns.
    ///
    /// Used standalone (no shared `Rc<RefCell<Reactor>>` wrapping it) this is
    /// just a normal `&mut self` call. `Dispatcher` does not call this
    /// method — it drives the same `take_*`/`restore_*` primitives itself,
    /// through short-lived borrows that are dropped before any callback
    /// runs, so a callback that re-enters the dispatcher (e.g. to change its
    /// own interest mask) does not double-borrow its `RefCell`.
    pub fn turn(&mut self) -> Result<(), RippleError> {
        let timeout = self.next_timer_deadline().map(|deadline| deadline.saturating_duration_since(Instant::now()));
        let ready = self.poll_once(timeout)?;

        for (token, readable, writable, errored) in ready {
            if token == SIGNAL_TOKEN {
                self.dispatch_signals();
            } else {
                self.dispatch_io(token, readable, writable, errored);
            }
            if self.stopping {
                break;
            }
        }
        if self.stopping {
            return Ok(());
        }

        for cb in self.take_due_timer_callbacks(Instant::now()) {
            cb();
            if self.stopping {
                break;
            }
        }
        Ok(())
    }

    pub(crate) fn next_timer_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub(crate) fn take_due_timer_callbacks(&mut self, now: Instant) -> Vec<TimerCallback> {
        self.timers.drain_due(now)
    }

    /// Runs one `mio::Poll::poll` and returns the ready tokens as an owned
    /// list, decoupled from `self.events`'s borrow before any dispatch
    /// happens.
    pub(crate) fn poll_once(&mut self, timeout: Option<Duration>) -> Result<Vec<(Token, bool, bool, bool)>, RippleError> {
        self.poll.poll(&mut self.events, timeout).map_err(|e| RippleError::ReactorSetupFailure(e.to_string()))?;
        Ok(self.events.iter().map(|ev| (ev.token(), ev.is_readable(), ev.is_writable(), ev.is_error())).collect())
    }

    /// Takes the callback for a ready I/O watch out of its slot and returns
    /// it along with the event to deliver, leaving the slot's callback
    /// empty in the meantime — see `restore_io`. Returns `None` if the
    /// watch is gone or nothing in its registered mask is actually ready.
    pub(crate) fn take_ready_io(&mut self, token: Token, readable: bool, writable: bool, errored: bool) -> Option<(IoCallback, IoEvent)> {
        let watch = self.io_watches.get_mut(token.0)?;
        if errored {
            tracing::debug!(fd = watch.fd, "io watch reported an error");
            let cb = watch.callback.take()?;
            let err = RippleError::Io(std::io::Error::new(std::io::ErrorKind::Other, "reactor reported an I/O error on this fd"));
            return Some((cb, IoEvent::Error(err)));
        }
        let mut ready_mask = IoInterest::NONE;
        if readable && watch.interest.readable() {
            ready_mask |= IoInterest::READ;
        }
        if writable && watch.interest.writable() {
            ready_mask |= IoInterest::WRITE;
        }
        if ready_mask.is_empty() {
            return None;
        }
        tracing::trace!(fd = watch.fd, "io watch fired");
        let cb = watch.callback.take()?;
        Some((cb, IoEvent::Ready(ready_mask)))
    }

    /// Returns a callback taken by `take_ready_io` to its watch, if the
    /// watch is still registered (it may have been cancelled by the
    /// callback itself, or by another callback invoked in the meantime).
    pub(crate) fn restore_io(&mut self, token: Token, cb: IoCallback) {
        if let Some(watch) = self.io_watches.get_mut(token.0) {
            watch.callback = Some(cb);
        }
    }

    pub(crate) fn take_pending_signal_callbacks(&mut self) -> Vec<(i32, Vec<(u64, SignalCallback)>)> {
        self.signals.take_pending()
    }

    pub(crate) fn restore_signal_callbacks(&mut self, taken: Vec<(i32, Vec<(u64, SignalCallback)>)>) {
        self.signals.restore(taken)
    }

    /// Whether there is anything left to wait for: a live I/O watch, a
    /// pending timer, or a registered signal callback.
    pub fn has_pending_work(&self) -> bool {
        self.live_io_watches != 0 || !self.timers.is_empty() || !self.signals.is_empty()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    /// Requests that a pending `start()` return once the current callback
    /// chain completes.
    pub fn stop(&mut self) {
        self.stopping = true;
    }

    fn dispatch_io(&mut self, token: Token, readable: bool, writable: bool, errored: bool) {
        if let Some((mut cb, ev)) = self.take_ready_io(token, readable, writable, errored) {
            cb(ev);
            self.restore_io(token, cb);
        }
    }

    fn dispatch_signals(&mut self) {
        let taken = self.take_pending_signal_callbacks();
        let mut fired = Vec::with_capacity(taken.len());
        for (signum, mut cbs) in taken {
            for (_, cb) in cbs.iter_mut() {
                cb();
            }
            fired.push((signum, cbs));
        }
        self.restore_signal_callbacks(fired);
    }
}
