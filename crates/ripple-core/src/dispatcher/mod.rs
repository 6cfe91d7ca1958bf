//! L2: the coroutine dispatcher. Owns the reactor and the current-task
//! stack, and exposes the four awaitable primitives (`sleep`, `ready`,
//! `signal`, `complete`) plus task lifecycle management.
//!
//! Rust has no stackful coroutines, so a "task" here is a boxed
//! `Future<Output = Result<(), RippleError>>` driven by this module's own
//! minimal single-threaded executor rather than a generator. The
//! setup/cancel contract the spec describes for awaitables is expressed
//! through `Future::poll` plus a hand-rolled `Waker` (see `waker.rs`).

pub mod awaitable;
pub mod task;
mod waker;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

use slab::Slab;

use crate::config::RuntimeConfig;
use crate::error::RippleError;
use crate::reactor::Reactor;
use task::{DoneCallback, TaskId, TaskOutcome, TaskSlot, TaskState};
use waker::make_waker;

pub use awaitable::Deadline;
pub use task::{TaskError, TaskOutcome as Outcome};

pub(crate) type BoxTaskFuture = Pin<Box<dyn Future<Output = Result<(), RippleError>>>>;

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked with a non-string payload".to_owned()
    }
}

struct Inner {
    reactor: Reactor,
    tasks: Slab<TaskSlot>,
    current_stack: Vec<TaskId>,
}

/// The L2 coroutine dispatcher. Cheap to clone (an `Rc` of shared state);
/// every clone refers to the same reactor and task table. Not `Send`/`Sync`.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Rc<RefCell<Inner>>,
    ready_queue: Rc<RefCell<VecDeque<TaskId>>>,
}

impl Dispatcher {
    pub fn new(config: &RuntimeConfig) -> Result<Self, RippleError> {
        Ok(Self {
            inner: Rc::new(RefCell::new(Inner {
                reactor: Reactor::new(config)?,
                tasks: Slab::new(),
                current_stack: Vec::new(),
            })),
            ready_queue: Rc::new(RefCell::new(VecDeque::new())),
        })
    }

    /// Instantiates `fut` as a new task, performs its first step
    /// immediately, and returns a handle. If the future completes
    /// synchronously during this first step, the returned handle is already
    /// terminal.
    pub fn submit<F>(&self, fut: F) -> TaskHandle
    where
        F: Future<Output = Result<(), RippleError>> + 'static,
    {
        let id = {
            let mut inner = self.inner.borrow_mut();
            TaskId(inner.tasks.insert(TaskSlot::new()))
        };
        self.drive(id, Box::pin(fut));
        TaskHandle {
            dispatcher: self.clone(),
            id,
        }
    }

    /// Runs the reactor, interleaving drains of tasks woken since the last
    /// turn, until `stop()` is called or there is nothing left to wait for.
    pub fn start(&self) -> Result<(), RippleError> {
        loop {
            self.drain_ready_queue();
            let (is_stopping, has_work) = {
                let inner = self.inner.borrow();
                (inner.reactor.is_stopping(), inner.reactor.has_pending_work())
            };
            if is_stopping || !has_work {
                break;
            }
            self.turn_once()?;
        }
        self.drain_ready_queue();
        Ok(())
    }

    /// Equivalent to `Reactor::turn`, but never holds `self.inner`'s borrow
    /// across a callback invocation. Reactor-registered I/O and signal
    /// callbacks in this crate (`AutoBuffer::on_io_event`, a `TcpServer`
    /// listener callback) routinely re-enter the dispatcher — to update
    /// their own interest mask, register a fresh watch for an accepted
    /// connection, or `submit` its handler task — and `with_reactor_mut`/
    /// `submit` would otherwise double-borrow the same `RefCell` and panic.
    /// Each step below takes what it needs, drops the borrow, invokes the
    /// callback, then re-borrows to put things back.
    fn turn_once(&self) -> Result<(), RippleError> {
        let timeout = {
            let inner = self.inner.borrow();
            inner.reactor.next_timer_deadline().map(|d| d.saturating_duration_since(std::time::Instant::now()))
        };
        let ready = {
            let mut inner = self.inner.borrow_mut();
            inner.reactor.poll_once(timeout)?
        };

        for (token, readable, writable, errored) in ready {
            if token == crate::reactor::SIGNAL_TOKEN {
                self.dispatch_signals();
            } else {
                self.dispatch_io(token, readable, writable, errored);
            }
            if self.inner.borrow().reactor.is_stopping() {
                return Ok(());
            }
        }

        self.dispatch_due_timers();
        Ok(())
    }

    fn dispatch_io(&self, token: mio::Token, readable: bool, writable: bool, errored: bool) {
        let taken = {
            let mut inner = self.inner.borrow_mut();
            inner.reactor.take_ready_io(token, readable, writable, errored)
        };
        let Some((mut cb, ev)) = taken else { return };
        cb(ev);
        let mut inner = self.inner.borrow_mut();
        inner.reactor.restore_io(token, cb);
    }

    fn dispatch_signals(&self) {
        let taken = {
            let mut inner = self.inner.borrow_mut();
            inner.reactor.take_pending_signal_callbacks()
        };
        let mut fired = Vec::with_capacity(taken.len());
        for (signum, mut cbs) in taken {
            for (_, cb) in cbs.iter_mut() {
                cb();
            }
            fired.push((signum, cbs));
        }
        let mut inner = self.inner.borrow_mut();
        inner.reactor.restore_signal_callbacks(fired);
    }

    fn dispatch_due_timers(&self) {
        let due = {
            let mut inner = self.inner.borrow_mut();
            inner.reactor.take_due_timer_callbacks(std::time::Instant::now())
        };
        for cb in due {
            cb();
            if self.inner.borrow().reactor.is_stopping() {
                break;
            }
        }
    }

    /// Requests that a pending `start()` return once the current callback
    /// chain completes.
    pub fn stop(&self) {
        self.inner.borrow_mut().reactor.stop();
    }

    /// Resumes the current task after `delay` has elapsed. `Duration::ZERO`
    /// resumes on the next loop tick.
    pub fn sleep(&self, delay: Duration) -> awaitable::Sleep {
        awaitable::Sleep::new(self.clone(), delay)
    }

    /// Resumes the current task when `fd` is ready in any of `mask`, or on
    /// `deadline` if it elapses first.
    pub fn ready(
        &self,
        fd: std::os::unix::io::RawFd,
        mask: crate::reactor::IoInterest,
        deadline: Deadline,
    ) -> awaitable::ReadyAwait {
        awaitable::ReadyAwait::new(self.clone(), fd, mask, deadline)
    }

    /// Resumes the current task on the next occurrence of `signum`.
    pub fn signal(&self, signum: i32) -> awaitable::SignalAwait {
        awaitable::SignalAwait::new(self.clone(), signum)
    }

    /// Submits the source's `terminator` coroutine pattern as two small
    /// tasks, one per signal: whichever of `SIGINT`/`SIGTERM` fires first
    /// calls `stop()`. Opt-in — a host must call this itself, matching the
    /// original's terminator being just another submitted coroutine rather
    /// than implicit runtime behavior. Returns the `SIGINT` task's handle.
    pub fn submit_default_terminators(&self) -> TaskHandle {
        let on_term = self.clone();
        self.submit(async move {
            on_term.signal(signal_hook::consts::SIGTERM).await?;
            on_term.stop();
            Ok(())
        });
        let on_int = self.clone();
        self.submit(async move {
            on_int.signal(signal_hook::consts::SIGINT).await?;
            on_int.stop();
            Ok(())
        })
    }

    /// Resumes the current task once every handle in `handles` has reached
    /// a terminal state. On `deadline` elapsing first, cancels every
    /// still-running handle and resolves with `Timeout`.
    pub fn complete(&self, handles: Vec<TaskHandle>, deadline: Deadline) -> awaitable::Complete {
        awaitable::Complete::new(self.clone(), handles, deadline)
    }

    pub(crate) fn with_reactor_mut<T>(&self, f: impl FnOnce(&mut Reactor) -> T) -> T {
        let mut inner = self.inner.borrow_mut();
        f(&mut inner.reactor)
    }

    pub(crate) fn make_waker(&self, id: TaskId) -> std::task::Waker {
        make_waker(Rc::clone(&self.ready_queue), id)
    }

    /// Whether the task currently being stepped has had cancellation
    /// requested. Checked by every awaitable at the top of `poll`, which is
    /// the concrete form of "cancellation is injected at the current
    /// suspension point" in a `Future`-based executor.
    pub(crate) fn current_task_cancel_requested(&self) -> bool {
        let inner = self.inner.borrow();
        inner
            .current_stack
            .last()
            .and_then(|id| inner.tasks.get(id.0))
            .map(|slot| slot.cancel_requested)
            .unwrap_or(false)
    }

    fn drain_ready_queue(&self) {
        loop {
            let next = self.ready_queue.borrow_mut().pop_front();
            let Some(id) = next else { break };
            self.redrive_if_running(id);
        }
    }

    fn redrive_if_running(&self, id: TaskId) {
        let future = {
            let mut inner = self.inner.borrow_mut();
            match inner.tasks.get_mut(id.0) {
                Some(slot) if slot.state == TaskState::Running => slot.future.take(),
                _ => None,
            }
        };
        if let Some(future) = future {
            self.drive(id, future);
        }
    }

    fn drive(&self, id: TaskId, mut future: BoxTaskFuture) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.current_stack.push(id);
        }
        let waker = self.make_waker(id);
        let mut cx = Context::from_waker(&waker);
        // Caught here, not left to unwind through the reactor's poll loop:
        // one task's panic must not take every other task down with it.
        let poll_result = panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));
        {
            let mut inner = self.inner.borrow_mut();
            inner.current_stack.pop();
            if let Ok(Poll::Pending) = poll_result {
                if let Some(slot) = inner.tasks.get_mut(id.0) {
                    slot.future = Some(future);
                }
            }
        }
        match poll_result {
            Ok(Poll::Ready(result)) => self.finalize(id, result),
            Ok(Poll::Pending) => {}
            Err(payload) => self.finalize_panicked(id, panic_message(&payload)),
        }
    }

    fn finalize(&self, id: TaskId, result: Result<(), RippleError>) {
        let state = match &result {
            Ok(()) => TaskState::Finished,
            Err(RippleError::Cancelled) => TaskState::Cancelled,
            Err(_) => TaskState::Failed,
        };
        let error = result.err().map(TaskError::from_ripple);
        if let (TaskState::Failed, Some(err)) = (state, &error) {
            tracing::error!(%err, "uncaught task failure");
        }
        self.settle(id, TaskOutcome { state, error });
    }

    fn finalize_panicked(&self, id: TaskId, message: String) {
        tracing::error!(message, "task panicked");
        self.settle(
            id,
            TaskOutcome {
                state: TaskState::Failed,
                error: Some(TaskError::Panicked(message)),
            },
        );
    }

    fn settle(&self, id: TaskId, outcome: TaskOutcome) {
        {
            let mut inner = self.inner.borrow_mut();
            if let Some(slot) = inner.tasks.get_mut(id.0) {
                slot.state = outcome.state;
                slot.outcome = Some(outcome.clone());
            }
        }
        let callbacks: Vec<DoneCallback> = {
            let mut inner = self.inner.borrow_mut();
            inner
                .tasks
                .get_mut(id.0)
                .map(|slot| std::mem::take(&mut slot.done_callbacks))
                .unwrap_or_default()
        };
        for cb in callbacks {
            cb(&outcome);
        }
    }

    fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.inner.borrow().tasks.get(id.0).map(|s| s.state)
    }

    fn task_outcome(&self, id: TaskId) -> Option<TaskOutcome> {
        self.inner.borrow().tasks.get(id.0).and_then(|s| s.outcome.clone())
    }

    fn request_cancel(&self, id: TaskId) {
        let should_wake = {
            let mut inner = self.inner.borrow_mut();
            match inner.tasks.get_mut(id.0) {
                Some(slot) if slot.state == TaskState::Running => {
                    slot.cancel_requested = true;
                    true
                }
                _ => false,
            }
        };
        if should_wake {
            self.ready_queue.borrow_mut().push_back(id);
        }
    }

    fn add_done_callback(&self, id: TaskId, cb: DoneCallback) {
        let already_terminal = {
            let mut inner = self.inner.borrow_mut();
            match inner.tasks.get_mut(id.0) {
                Some(slot) if slot.state == TaskState::Running => {
                    slot.done_callbacks.push(cb);
                    None
                }
                Some(slot) => slot.outcome.clone(),
                None => None,
            }
        };
        if let Some(outcome) = already_terminal {
            cb(&outcome);
        }
    }
}

/// Handle to a submitted task (the spec's "Task (AsyncLet)").
#[derive(Clone)]
pub struct TaskHandle {
    dispatcher: Dispatcher,
    id: TaskId,
}

impl TaskHandle {
    pub fn id(&self) -> usize {
        self.id.0
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self.dispatcher.task_state(self.id), Some(TaskState::Running) | None)
    }

    pub fn state(&self) -> Option<TaskState> {
        self.dispatcher.task_state(self.id)
    }

    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.dispatcher.task_outcome(self.id)
    }

    /// Requests cancellation. A no-op if the task is already terminal.
    /// Cancellation is injected at the task's current (or next) suspension
    /// point on a following loop turn, never re-entrantly from this call.
    pub fn cancel(&self) {
        self.dispatcher.request_cancel(self.id);
    }

    /// Registers a callback invoked exactly once when the task reaches a
    /// terminal state, in registration order. If the task is already
    /// terminal, invokes it immediately.
    pub fn on_done(&self, cb: impl FnOnce(&TaskOutcome) + 'static) {
        self.dispatcher.add_done_callback(self.id, Box::new(cb));
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub(crate) fn task_id(&self) -> TaskId {
        self.id
    }
}
