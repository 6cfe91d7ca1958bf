//! L4: the coroutine-friendly read/write surface built on top of an
//! `AutoBuffer`. Adds the deadline handling the buffer itself stays
//! agnostic to (it only tracks whether a pending task is satisfied).

use std::cell::RefCell;
use std::future::Future;
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use bytes::Bytes;

use crate::buffer::AutoBuffer;
use crate::config::BufferSizing;
use crate::dispatcher::{Deadline, Dispatcher};
use crate::error::RippleError;
use crate::reactor::TimerHandle;

type ResultSlot<T> = Rc<RefCell<Option<Result<T, RippleError>>>>;

enum State<T> {
    NotStarted,
    Pending { slot: ResultSlot<T>, timer: Option<TimerHandle> },
    Done,
}

/// A single bidirectional byte stream: a buffer plus deadline-aware
/// read/write coroutines. Cheap to clone — every clone shares the same
/// underlying buffer.
pub struct Stream<S: Read + Write + AsRawFd + 'static> {
    buffer: AutoBuffer<S>,
    dispatcher: Dispatcher,
}

impl<S: Read + Write + AsRawFd + 'static> Clone for Stream<S> {
    fn clone(&self) -> Self {
        Self {
            buffer: self.buffer.clone(),
            dispatcher: self.dispatcher.clone(),
        }
    }
}

impl<S: Read + Write + AsRawFd + 'static> Stream<S> {
    pub fn new(dispatcher: Dispatcher, io: S, sizing: BufferSizing) -> Result<Self, RippleError> {
        let buffer = AutoBuffer::new(dispatcher.clone(), io, sizing)?;
        Ok(Self { buffer, dispatcher })
    }

    pub fn active(&self) -> bool {
        self.buffer.active()
    }

    pub fn block_size(&self) -> usize {
        self.buffer.block_size()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer.buffer_size()
    }

    /// Drains up to `max_bytes` already-buffered bytes; never blocks or
    /// yields.
    pub fn read(&self, max_bytes: usize) -> Bytes {
        self.buffer.read(max_bytes)
    }

    /// Buffers up to `buffer_size - out.size` bytes for eventual delivery;
    /// never blocks. Use `flush` to await delivery.
    pub fn write(&self, data: &[u8]) -> usize {
        self.buffer.write(data)
    }

    pub fn close(&self) {
        self.buffer.close()
    }

    /// Resumes once exactly `num_bytes` are available, or on `deadline`.
    /// `num_bytes` is capped at `buffer_size`; `num_bytes == 0` is rejected
    /// with `RippleError::InvalidArgument` on the first poll.
    pub fn read_exactly(&self, num_bytes: usize, deadline: Deadline) -> ReadExactly<S> {
        let n = num_bytes.min(self.buffer.buffer_size());
        let rejected = if num_bytes == 0 {
            Some(RippleError::InvalidArgument("read_exactly requires num_bytes > 0".to_owned()))
        } else {
            None
        };
        ReadExactly {
            dispatcher: self.dispatcher.clone(),
            buffer: self.buffer.clone(),
            n,
            deadline,
            rejected,
            state: State::NotStarted,
        }
    }

    /// Resumes once `delimiter` has been seen (within `max_bytes`), or on
    /// `deadline`. `max_bytes` is capped at `buffer_size`; an empty
    /// `delimiter` is rejected with `RippleError::InvalidArgument` on the
    /// first poll, since it would otherwise never match.
    pub fn read_until(&self, delimiter: Vec<u8>, max_bytes: usize, deadline: Deadline) -> ReadUntil<S> {
        let max_bytes = max_bytes.min(self.buffer.buffer_size());
        let rejected = if delimiter.is_empty() {
            Some(RippleError::InvalidArgument("read_until requires a non-empty delimiter".to_owned()))
        } else {
            None
        };
        ReadUntil {
            dispatcher: self.dispatcher.clone(),
            buffer: self.buffer.clone(),
            delimiter,
            max_bytes,
            deadline,
            rejected,
            state: State::NotStarted,
        }
    }

    /// Resumes once the out buffer has fully drained, or on `deadline`.
    pub fn flush(&self, deadline: Deadline) -> Flush<S> {
        Flush {
            dispatcher: self.dispatcher.clone(),
            buffer: self.buffer.clone(),
            deadline,
            state: State::NotStarted,
        }
    }
}

fn arm_timeout<S: Read + Write + AsRawFd + 'static, T: 'static>(
    dispatcher: &Dispatcher,
    buffer: &AutoBuffer<S>,
    deadline: Deadline,
    slot: &ResultSlot<T>,
    waker: &std::task::Waker,
) -> Option<TimerHandle> {
    if let Deadline::After(d) = deadline {
        let slot_t = Rc::clone(slot);
        let waker_t = waker.clone();
        let buffer_t = buffer.clone();
        Some(dispatcher.with_reactor_mut(|r| {
            r.setup_timer(d, move || {
                let mut guard = slot_t.borrow_mut();
                if guard.is_some() {
                    return;
                }
                *guard = Some(Err(RippleError::Timeout));
                drop(guard);
                buffer_t.cancel_task();
                waker_t.wake();
            })
        }))
    } else {
        None
    }
}

macro_rules! poll_prelude {
    ($self:ident, $state_ty:ident) => {
        if $self.dispatcher.current_task_cancel_requested() {
            if let $state_ty::Pending { timer, .. } = std::mem::replace(&mut $self.state, $state_ty::Done) {
                $self.buffer.cancel_task();
                if let Some(t) = timer {
                    $self.dispatcher.with_reactor_mut(|r| r.cancel_timer(t));
                }
            }
            return Poll::Ready(Err(RippleError::Cancelled));
        }
    };
}

/// Resolves with exactly `n` bytes, or `RippleError::Timeout`/`Cancelled`.
pub struct ReadExactly<S: Read + Write + AsRawFd + 'static> {
    dispatcher: Dispatcher,
    buffer: AutoBuffer<S>,
    n: usize,
    deadline: Deadline,
    rejected: Option<RippleError>,
    state: State<Bytes>,
}

impl<S: Read + Write + AsRawFd + 'static> Future for ReadExactly<S> {
    type Output = Result<Bytes, RippleError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        poll_prelude!(self, State);
        if let Some(err) = self.rejected.take() {
            self.state = State::Done;
            return Poll::Ready(Err(err));
        }
        match std::mem::replace(&mut self.state, State::Done) {
            State::NotStarted => {
                if self.deadline == Deadline::Expired {
                    return Poll::Ready(Err(RippleError::Timeout));
                }
                let slot: ResultSlot<Bytes> = Rc::new(RefCell::new(None));
                let slot2 = Rc::clone(&slot);
                let waker = cx.waker().clone();
                let immediate = self.buffer.setup_read_exactly(self.n, move |result| {
                    let mut guard = slot2.borrow_mut();
                    if guard.is_some() {
                        return;
                    }
                    *guard = Some(result);
                    drop(guard);
                    waker.wake_by_ref();
                });
                if let Some(result) = immediate {
                    return Poll::Ready(result);
                }
                let timer = arm_timeout(&self.dispatcher, &self.buffer, self.deadline, &slot, cx.waker());
                self.state = State::Pending { slot, timer };
                Poll::Pending
            }
            State::Pending { slot, timer } => {
                if let Some(result) = slot.borrow_mut().take() {
                    if let Some(t) = timer {
                        self.dispatcher.with_reactor_mut(|r| r.cancel_timer(t));
                    }
                    Poll::Ready(result)
                } else {
                    self.state = State::Pending { slot, timer };
                    Poll::Pending
                }
            }
            State::Done => panic!("ReadExactly polled after completion"),
        }
    }
}

/// Resolves with the bytes up to and including `delimiter`, or
/// `RippleError::DelimiterNotFound`/`Timeout`/`Cancelled`.
pub struct ReadUntil<S: Read + Write + AsRawFd + 'static> {
    dispatcher: Dispatcher,
    buffer: AutoBuffer<S>,
    delimiter: Vec<u8>,
    max_bytes: usize,
    deadline: Deadline,
    rejected: Option<RippleError>,
    state: State<Bytes>,
}

impl<S: Read + Write + AsRawFd + 'static> Future for ReadUntil<S> {
    type Output = Result<Bytes, RippleError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        poll_prelude!(self, State);
        if let Some(err) = self.rejected.take() {
            self.state = State::Done;
            return Poll::Ready(Err(err));
        }
        match std::mem::replace(&mut self.state, State::Done) {
            State::NotStarted => {
                if self.deadline == Deadline::Expired {
                    return Poll::Ready(Err(RippleError::Timeout));
                }
                let slot: ResultSlot<Bytes> = Rc::new(RefCell::new(None));
                let slot2 = Rc::clone(&slot);
                let waker = cx.waker().clone();
                let immediate =
                    self.buffer
                        .setup_read_until(self.delimiter.clone(), self.max_bytes, move |result| {
                            let mut guard = slot2.borrow_mut();
                            if guard.is_some() {
                                return;
                            }
                            *guard = Some(result);
                            drop(guard);
                            waker.wake_by_ref();
                        });
                if let Some(result) = immediate {
                    return Poll::Ready(result);
                }
                let timer = arm_timeout(&self.dispatcher, &self.buffer, self.deadline, &slot, cx.waker());
                self.state = State::Pending { slot, timer };
                Poll::Pending
            }
            State::Pending { slot, timer } => {
                if let Some(result) = slot.borrow_mut().take() {
                    if let Some(t) = timer {
                        self.dispatcher.with_reactor_mut(|r| r.cancel_timer(t));
                    }
                    Poll::Ready(result)
                } else {
                    self.state = State::Pending { slot, timer };
                    Poll::Pending
                }
            }
            State::Done => panic!("ReadUntil polled after completion"),
        }
    }
}

/// Resolves once the out buffer has fully drained.
pub struct Flush<S: Read + Write + AsRawFd + 'static> {
    dispatcher: Dispatcher,
    buffer: AutoBuffer<S>,
    deadline: Deadline,
    state: State<()>,
}

impl<S: Read + Write + AsRawFd + 'static> Future for Flush<S> {
    type Output = Result<(), RippleError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        poll_prelude!(self, State);
        match std::mem::replace(&mut self.state, State::Done) {
            State::NotStarted => {
                if self.deadline == Deadline::Expired {
                    return Poll::Ready(Err(RippleError::Timeout));
                }
                let slot: ResultSlot<()> = Rc::new(RefCell::new(None));
                let slot2 = Rc::clone(&slot);
                let waker = cx.waker().clone();
                let immediate = self.buffer.setup_flush(move |result| {
                    let mut guard = slot2.borrow_mut();
                    if guard.is_some() {
                        return;
                    }
                    *guard = Some(result);
                    drop(guard);
                    waker.wake_by_ref();
                });
                if let Some(result) = immediate {
                    return Poll::Ready(result);
                }
                let timer = arm_timeout(&self.dispatcher, &self.buffer, self.deadline, &slot, cx.waker());
                self.state = State::Pending { slot, timer };
                Poll::Pending
            }
            State::Pending { slot, timer } => {
                if let Some(result) = slot.borrow_mut().take() {
                    if let Some(t) = timer {
                        self.dispatcher.with_reactor_mut(|r| r.cancel_timer(t));
                    }
                    Poll::Ready(result)
                } else {
                    self.state = State::Pending { slot, timer };
                    Poll::Pending
                }
            }
            State::Done => panic!("Flush polled after completion"),
        }
    }
}
