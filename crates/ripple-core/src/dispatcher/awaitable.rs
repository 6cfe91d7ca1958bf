//! The four dispatcher-level awaitable primitives: `sleep`, `ready`,
//! `signal`, `complete`. Each is a hand-written `Future` whose first `poll`
//! registers with the reactor (the spec's "setup" half of an awaitable) and
//! whose subsequent `poll` either observes the recorded result or re-arms
//! (the "cancel" half runs from `Drop`-free cleanup performed inline once a
//! result is observed or cancellation is detected).

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

use super::{Dispatcher, TaskHandle};
use crate::error::RippleError;
use crate::reactor::{IoEvent, IoHandle, IoInterest, SignalHandle, TimerHandle};

/// Resolved form of a `timeout` argument. `None` arms no timer at all (the
/// spec's "0 is equivalent to no timeout"); `After` arms a side-channel
/// reactor timer; `Expired` resolves immediately as a timeout without
/// touching the reactor (the spec's "negative timeout resolves
/// immediately").
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Deadline {
    None,
    After(Duration),
    Expired,
}

impl Deadline {
    pub fn from_seconds(secs: Option<f64>) -> Self {
        match secs {
            None => Deadline::None,
            Some(s) if s < 0.0 => Deadline::Expired,
            Some(s) if s == 0.0 => Deadline::None,
            Some(s) => Deadline::After(Duration::from_secs_f64(s)),
        }
    }

    pub fn from_duration(d: Option<Duration>) -> Self {
        match d {
            None => Deadline::None,
            Some(d) if d.is_zero() => Deadline::None,
            Some(d) => Deadline::After(d),
        }
    }
}

enum Cleanup {
    None,
    Timer(TimerHandle),
    Io(IoHandle),
    IoAndTimer(IoHandle, Option<TimerHandle>),
    Signal(SignalHandle),
}

impl Cleanup {
    fn run(self, dispatcher: &Dispatcher) {
        match self {
            Cleanup::None => {}
            Cleanup::Timer(t) => dispatcher.with_reactor_mut(|r| r.cancel_timer(t)),
            Cleanup::Io(h) => dispatcher.with_reactor_mut(|r| r.cancel_io(h)),
            Cleanup::IoAndTimer(h, t) => dispatcher.with_reactor_mut(|r| {
                r.cancel_io(h);
                if let Some(t) = t {
                    r.cancel_timer(t);
                }
            }),
            Cleanup::Signal(s) => dispatcher.with_reactor_mut(|r| r.cancel_signal(s)),
        }
    }
}

type ResultSlot<T> = Rc<RefCell<Option<Result<T, RippleError>>>>;

enum State<T> {
    NotStarted,
    Pending { slot: ResultSlot<T>, cleanup: Cleanup },
    Done,
}

/// Resolves the current task after a delay has elapsed.
pub struct Sleep {
    dispatcher: Dispatcher,
    delay: Duration,
    state: State<()>,
}

impl Sleep {
    pub(crate) fn new(dispatcher: Dispatcher, delay: Duration) -> Self {
        Self {
            dispatcher,
            delay,
            state: State::NotStarted,
        }
    }
}

impl Future for Sleep {
    type Output = Result<(), RippleError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.dispatcher.current_task_cancel_requested() {
            if let State::Pending { cleanup, .. } = std::mem::replace(&mut self.state, State::Done) {
                cleanup.run(&self.dispatcher);
            }
            return Poll::Ready(Err(RippleError::Cancelled));
        }
        match std::mem::replace(&mut self.state, State::Done) {
            State::NotStarted => {
                let slot: ResultSlot<()> = Rc::new(RefCell::new(None));
                let slot2 = Rc::clone(&slot);
                let waker = cx.waker().clone();
                let handle = self.dispatcher.with_reactor_mut(|r| {
                    r.setup_timer(self.delay, move || {
                        *slot2.borrow_mut() = Some(Ok(()));
                        waker.wake();
                    })
                });
                self.state = State::Pending {
                    slot,
                    cleanup: Cleanup::Timer(handle),
                };
                Poll::Pending
            }
            State::Pending { slot, cleanup } => {
                if let Some(result) = slot.borrow_mut().take() {
                    Poll::Ready(result)
                } else {
                    self.state = State::Pending { slot, cleanup };
                    Poll::Pending
                }
            }
            State::Done => panic!("Sleep polled after completion"),
        }
    }
}

/// Resolves when `fd` is ready in any of `mask`, or on `deadline`.
pub struct ReadyAwait {
    dispatcher: Dispatcher,
    fd: RawFd,
    mask: IoInterest,
    deadline: Deadline,
    state: State<IoInterest>,
}

impl ReadyAwait {
    pub(crate) fn new(dispatcher: Dispatcher, fd: RawFd, mask: IoInterest, deadline: Deadline) -> Self {
        Self {
            dispatcher,
            fd,
            mask,
            deadline,
            state: State::NotStarted,
        }
    }
}

impl Future for ReadyAwait {
    type Output = Result<IoInterest, RippleError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.dispatcher.current_task_cancel_requested() {
            if let State::Pending { cleanup, .. } = std::mem::replace(&mut self.state, State::Done) {
                cleanup.run(&self.dispatcher);
            }
            return Poll::Ready(Err(RippleError::Cancelled));
        }
        match std::mem::replace(&mut self.state, State::Done) {
            State::NotStarted => {
                if self.deadline == Deadline::Expired {
                    return Poll::Ready(Err(RippleError::Timeout));
                }
                let slot: ResultSlot<IoInterest> = Rc::new(RefCell::new(None));
                let slot_io = Rc::clone(&slot);
                let waker_io = cx.waker().clone();
                let io_handle = match self.dispatcher.with_reactor_mut(|r| {
                    r.setup_io(self.fd, self.mask, move |ev| {
                        let mut guard = slot_io.borrow_mut();
                        if guard.is_some() {
                            return;
                        }
                        *guard = Some(match ev {
                            IoEvent::Ready(m) => Ok(m),
                            IoEvent::Error(e) => Err(e),
                        });
                        drop(guard);
                        waker_io.wake_by_ref();
                    })
                }) {
                    Ok(h) => h,
                    Err(e) => return Poll::Ready(Err(e)),
                };
                let timer_handle = if let Deadline::After(d) = self.deadline {
                    let slot_t = Rc::clone(&slot);
                    let waker_t = cx.waker().clone();
                    Some(self.dispatcher.with_reactor_mut(|r| {
                        r.setup_timer(d, move || {
                            let mut guard = slot_t.borrow_mut();
                            if guard.is_some() {
                                return;
                            }
                            *guard = Some(Err(RippleError::Timeout));
                            drop(guard);
                            waker_t.wake();
                        })
                    }))
                } else {
                    None
                };
                self.state = State::Pending {
                    slot,
                    cleanup: Cleanup::IoAndTimer(io_handle, timer_handle),
                };
                Poll::Pending
            }
            State::Pending { slot, cleanup } => {
                if let Some(result) = slot.borrow_mut().take() {
                    cleanup.run(&self.dispatcher);
                    Poll::Ready(result)
                } else {
                    self.state = State::Pending { slot, cleanup };
                    Poll::Pending
                }
            }
            State::Done => panic!("ReadyAwait polled after completion"),
        }
    }
}

/// Resolves on the next occurrence of `signum`.
pub struct SignalAwait {
    dispatcher: Dispatcher,
    signum: i32,
    state: State<()>,
}

impl SignalAwait {
    pub(crate) fn new(dispatcher: Dispatcher, signum: i32) -> Self {
        Self {
            dispatcher,
            signum,
            state: State::NotStarted,
        }
    }
}

impl Future for SignalAwait {
    type Output = Result<(), RippleError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.dispatcher.current_task_cancel_requested() {
            if let State::Pending { cleanup, .. } = std::mem::replace(&mut self.state, State::Done) {
                cleanup.run(&self.dispatcher);
            }
            return Poll::Ready(Err(RippleError::Cancelled));
        }
        match std::mem::replace(&mut self.state, State::Done) {
            State::NotStarted => {
                let slot: ResultSlot<()> = Rc::new(RefCell::new(None));
                let slot2 = Rc::clone(&slot);
                let waker = cx.waker().clone();
                let handle = match self.dispatcher.with_reactor_mut(|r| {
                    r.setup_signal(self.signum, move || {
                        let mut guard = slot2.borrow_mut();
                        if guard.is_some() {
                            return;
                        }
                        *guard = Some(Ok(()));
                        drop(guard);
                        waker.wake_by_ref();
                    })
                }) {
                    Ok(h) => h,
                    Err(e) => return Poll::Ready(Err(e)),
                };
                self.state = State::Pending {
                    slot,
                    cleanup: Cleanup::Signal(handle),
                };
                Poll::Pending
            }
            State::Pending { slot, cleanup } => {
                if let Some(result) = slot.borrow_mut().take() {
                    cleanup.run(&self.dispatcher);
                    Poll::Ready(result)
                } else {
                    self.state = State::Pending { slot, cleanup };
                    Poll::Pending
                }
            }
            State::Done => panic!("SignalAwait polled after completion"),
        }
    }
}

/// Resolves once every handle in `handles` has reached a terminal state, or
/// cancels all still-running handles and resolves as `Timeout` if `deadline`
/// elapses first.
pub struct Complete {
    dispatcher: Dispatcher,
    handles: Vec<TaskHandle>,
    deadline: Deadline,
    state: CompleteState,
}

enum CompleteState {
    NotStarted,
    Pending {
        slot: ResultSlot<()>,
        timer: Option<TimerHandle>,
    },
    Done,
}

impl Complete {
    pub(crate) fn new(dispatcher: Dispatcher, handles: Vec<TaskHandle>, deadline: Deadline) -> Self {
        Self {
            dispatcher,
            handles,
            deadline,
            state: CompleteState::NotStarted,
        }
    }
}

impl Future for Complete {
    type Output = Result<(), RippleError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.dispatcher.current_task_cancel_requested() {
            if let CompleteState::Pending { timer, .. } =
                std::mem::replace(&mut self.state, CompleteState::Done)
            {
                if let Some(t) = timer {
                    self.dispatcher.with_reactor_mut(|r| r.cancel_timer(t));
                }
            }
            return Poll::Ready(Err(RippleError::Cancelled));
        }
        match std::mem::replace(&mut self.state, CompleteState::Done) {
            CompleteState::NotStarted => {
                if self.deadline == Deadline::Expired {
                    for h in &self.handles {
                        h.cancel();
                    }
                    return Poll::Ready(Err(RippleError::Timeout));
                }
                if self.handles.iter().all(|h| h.is_finished()) {
                    return Poll::Ready(Ok(()));
                }
                let slot: ResultSlot<()> = Rc::new(RefCell::new(None));
                let remaining = Rc::new(Cell::new(
                    self.handles.iter().filter(|h| !h.is_finished()).count(),
                ));
                for h in self.handles.iter().filter(|h| !h.is_finished()) {
                    let slot2 = Rc::clone(&slot);
                    let remaining2 = Rc::clone(&remaining);
                    let waker = cx.waker().clone();
                    h.on_done(move |_outcome| {
                        remaining2.set(remaining2.get().saturating_sub(1));
                        if remaining2.get() == 0 {
                            let mut guard = slot2.borrow_mut();
                            if guard.is_none() {
                                *guard = Some(Ok(()));
                            }
                            drop(guard);
                            waker.wake_by_ref();
                        }
                    });
                }
                let timer = if let Deadline::After(d) = self.deadline {
                    let slot_t = Rc::clone(&slot);
                    let waker_t = cx.waker().clone();
                    let handles_for_timeout = self.handles.clone();
                    Some(self.dispatcher.with_reactor_mut(|r| {
                        r.setup_timer(d, move || {
                            let mut guard = slot_t.borrow_mut();
                            if guard.is_some() {
                                return;
                            }
                            *guard = Some(Err(RippleError::Timeout));
                            drop(guard);
                            for h in &handles_for_timeout {
                                h.cancel();
                            }
                            waker_t.wake();
                        })
                    }))
                } else {
                    None
                };
                self.state = CompleteState::Pending { slot, timer };
                Poll::Pending
            }
            CompleteState::Pending { slot, timer } => {
                if let Some(result) = slot.borrow_mut().take() {
                    if let Some(t) = timer {
                        self.dispatcher.with_reactor_mut(|r| r.cancel_timer(t));
                    }
                    Poll::Ready(result)
                } else {
                    self.state = CompleteState::Pending { slot, timer };
                    Poll::Pending
                }
            }
            CompleteState::Done => panic!("Complete polled after completion"),
        }
    }
}
