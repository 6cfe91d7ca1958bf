//! L3: per-fd paired in/out byte buffers driven by the reactor.
//!
//! Hides edge-management and interest-mask bookkeeping from L4. Generic
//! over any `Read + Write + AsRawFd` I/O source (a `mio::net::TcpStream` in
//! practice) rather than committing to a concrete socket type, the same way
//! the source's `AutoBuffer` left `_read_block`/`_write_block` abstract for
//! subclasses to fill in.

use std::cell::RefCell;
use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use bytes::{Bytes, BytesMut};

use crate::config::BufferSizing;
use crate::dispatcher::Dispatcher;
use crate::error::RippleError;
use crate::reactor::{IoEvent, IoHandle, IoInterest};

enum ReadOutcome {
    Data(Bytes),
    WouldBlock,
    Closed,
    Err(io::Error),
}

fn read_block(io: &mut impl Read, max: usize) -> ReadOutcome {
    if max == 0 {
        return ReadOutcome::WouldBlock;
    }
    let mut buf = vec![0u8; max];
    match io.read(&mut buf) {
        Ok(0) => ReadOutcome::Closed,
        Ok(n) => {
            buf.truncate(n);
            ReadOutcome::Data(Bytes::from(buf))
        }
        Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
            ReadOutcome::WouldBlock
        }
        Err(e) => ReadOutcome::Err(e),
    }
}

enum WriteOutcome {
    Sent(usize),
    WouldBlock,
    Err(io::Error),
}

fn write_block(io: &mut impl Write, data: &[u8]) -> WriteOutcome {
    if data.is_empty() {
        return WriteOutcome::Sent(0);
    }
    match io.write(data) {
        Ok(n) => WriteOutcome::Sent(n),
        Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
            WriteOutcome::WouldBlock
        }
        Err(e) => WriteOutcome::Err(e),
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub(crate) enum ReadKind {
    Exactly(usize),
    Until { delimiter: Vec<u8>, max_bytes: usize },
}

fn evaluate_pending_read(in_buf: &mut BytesMut, kind: &ReadKind) -> Option<Result<Bytes, RippleError>> {
    match kind {
        ReadKind::Exactly(n) => {
            if in_buf.len() >= *n {
                Some(Ok(in_buf.split_to(*n).freeze()))
            } else {
                None
            }
        }
        ReadKind::Until { delimiter, max_bytes } => {
            if let Some(pos) = find_subslice(in_buf, delimiter) {
                let end = pos + delimiter.len();
                if end <= *max_bytes {
                    return Some(Ok(in_buf.split_to(end).freeze()));
                }
            }
            if in_buf.len() >= *max_bytes {
                Some(Err(RippleError::DelimiterNotFound))
            } else {
                None
            }
        }
    }
}

enum PendingTask {
    Read {
        kind: ReadKind,
        callback: Box<dyn FnOnce(Result<Bytes, RippleError>)>,
    },
    Flush {
        callback: Box<dyn FnOnce(Result<(), RippleError>)>,
    },
}

struct Inner<S> {
    io: S,
    dispatcher: Dispatcher,
    io_handle: Option<IoHandle>,
    mode: IoInterest,
    in_buf: BytesMut,
    out_buf: BytesMut,
    block_size: usize,
    buffer_size: usize,
    active: bool,
    task: Option<PendingTask>,
    sticky_error: Option<RippleError>,
}

/// Per-fd paired in/out byte buffer, shared (via `Rc`) between its public
/// handle and the reactor callback that drives it.
pub struct AutoBuffer<S: Read + Write + AsRawFd + 'static> {
    inner: Rc<RefCell<Inner<S>>>,
}

impl<S: Read + Write + AsRawFd + 'static> Clone for AutoBuffer<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<S: Read + Write + AsRawFd + 'static> AutoBuffer<S> {
    pub fn new(dispatcher: Dispatcher, io: S, sizing: BufferSizing) -> Result<Self, RippleError> {
        let fd: RawFd = io.as_raw_fd();
        let inner = Rc::new(RefCell::new(Inner {
            io,
            dispatcher: dispatcher.clone(),
            io_handle: None,
            mode: IoInterest::READ,
            in_buf: BytesMut::with_capacity(sizing.buffer_size()),
            out_buf: BytesMut::new(),
            block_size: sizing.block_size(),
            buffer_size: sizing.buffer_size(),
            active: true,
            task: None,
            sticky_error: None,
        }));
        let cb_inner = Rc::clone(&inner);
        let handle = dispatcher.with_reactor_mut(|r| {
            r.setup_io(fd, IoInterest::READ, move |ev| {
                Self::on_io_event(&cb_inner, ev);
            })
        })?;
        inner.borrow_mut().io_handle = Some(handle);
        Ok(Self { inner })
    }

    pub fn active(&self) -> bool {
        self.inner.borrow().active
    }

    pub fn block_size(&self) -> usize {
        self.inner.borrow().block_size
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.borrow().buffer_size
    }

    /// Takes up to `max_bytes` already-buffered bytes; re-enables READ
    /// interest if it had been paused at the high-water mark.
    pub fn read(&self, max_bytes: usize) -> Bytes {
        let mut this = self.inner.borrow_mut();
        let n = max_bytes.min(this.in_buf.len());
        let out = this.in_buf.split_to(n).freeze();
        Self::recompute_mask(&mut this);
        out
    }

    /// Appends up to `buffer_size - out.size` bytes and arms WRITE
    /// interest. Returns the number of bytes actually accepted; never
    /// blocks.
    pub fn write(&self, data: &[u8]) -> usize {
        let mut this = self.inner.borrow_mut();
        if !this.active {
            return 0;
        }
        let capacity = this.buffer_size.saturating_sub(this.out_buf.len());
        let n = data.len().min(capacity);
        this.out_buf.extend_from_slice(&data[..n]);
        Self::recompute_mask(&mut this);
        n
    }

    /// Immediate path returns `Some`; otherwise a task is registered and
    /// `callback` fires once satisfied.
    pub fn setup_read_exactly(
        &self,
        num_bytes: usize,
        callback: impl FnOnce(Result<Bytes, RippleError>) + 'static,
    ) -> Option<Result<Bytes, RippleError>> {
        self.setup_read(ReadKind::Exactly(num_bytes), callback)
    }

    pub fn setup_read_until(
        &self,
        delimiter: Vec<u8>,
        max_bytes: usize,
        callback: impl FnOnce(Result<Bytes, RippleError>) + 'static,
    ) -> Option<Result<Bytes, RippleError>> {
        self.setup_read(ReadKind::Until { delimiter, max_bytes }, callback)
    }

    fn setup_read(
        &self,
        kind: ReadKind,
        callback: impl FnOnce(Result<Bytes, RippleError>) + 'static,
    ) -> Option<Result<Bytes, RippleError>> {
        let mut this = self.inner.borrow_mut();
        if let Some(err) = &this.sticky_error {
            return Some(Err(err.clone_for_retry()));
        }
        if let Some(result) = evaluate_pending_read(&mut this.in_buf, &kind) {
            Self::recompute_mask(&mut this);
            return Some(result);
        }
        this.task = Some(PendingTask::Read {
            kind,
            callback: Box::new(callback),
        });
        None
    }

    pub fn setup_flush(
        &self,
        callback: impl FnOnce(Result<(), RippleError>) + 'static,
    ) -> Option<Result<(), RippleError>> {
        let mut this = self.inner.borrow_mut();
        if let Some(err) = &this.sticky_error {
            return Some(Err(err.clone_for_retry()));
        }
        if this.out_buf.is_empty() {
            return Some(Ok(()));
        }
        this.task = Some(PendingTask::Flush {
            callback: Box::new(callback),
        });
        None
    }

    /// Forgets the pending task without touching buffer contents.
    pub fn cancel_task(&self) {
        self.inner.borrow_mut().task = None;
    }

    pub fn close(&self) {
        let mut this = self.inner.borrow_mut();
        if !this.active {
            return;
        }
        this.task = None;
        if let Some(handle) = this.io_handle.take() {
            this.dispatcher.with_reactor_mut(|r| r.cancel_io(handle));
        }
        this.active = false;
    }

    fn recompute_mask(this: &mut Inner<S>) {
        if !this.active {
            return;
        }
        let mut mode = IoInterest::NONE;
        if this.in_buf.len() < this.buffer_size {
            mode |= IoInterest::READ;
        }
        if !this.out_buf.is_empty() {
            mode |= IoInterest::WRITE;
        }
        if mode != this.mode {
            this.mode = mode;
            if let Some(handle) = this.io_handle {
                let _ = this.dispatcher.with_reactor_mut(|r| r.update_io(handle, mode));
            }
        }
    }

    fn on_io_event(inner_rc: &Rc<RefCell<Inner<S>>>, ev: IoEvent) {
        let mut this = inner_rc.borrow_mut();
        if !this.active {
            return;
        }
        let mut fatal: Option<RippleError> = None;

        match ev {
            IoEvent::Error(e) => fatal = Some(e),
            IoEvent::Ready(revents) => {
                if revents.readable() {
                    let remaining = this.buffer_size.saturating_sub(this.in_buf.len());
                    let to_read = this.block_size.min(remaining);
                    match read_block(&mut this.io, to_read) {
                        ReadOutcome::Data(bytes) => this.in_buf.extend_from_slice(&bytes),
                        ReadOutcome::Closed => fatal = Some(RippleError::ConnectionReset),
                        ReadOutcome::WouldBlock => {}
                        ReadOutcome::Err(e) => fatal = Some(RippleError::Io(e)),
                    }
                }
                if fatal.is_none() && revents.writable() {
                    let to_send = this.block_size.min(this.out_buf.len());
                    if to_send > 0 {
                        let chunk = this.out_buf[..to_send].to_vec();
                        match write_block(&mut this.io, &chunk) {
                            WriteOutcome::Sent(n) => {
                                let _ = this.out_buf.split_to(n);
                            }
                            WriteOutcome::WouldBlock => {}
                            WriteOutcome::Err(e) => fatal = Some(RippleError::Io(e)),
                        }
                    }
                }
            }
        }

        if let Some(err) = &fatal {
            this.sticky_error = Some(err.clone_for_retry());
        }

        let resolved = match this.task.take() {
            Some(PendingTask::Read { kind, callback }) => match evaluate_pending_read(&mut this.in_buf, &kind) {
                Some(result) => Some(Resolution::Read(callback, result)),
                None => {
                    if let Some(err) = &fatal {
                        Some(Resolution::Read(callback, Err(err.clone_for_retry())))
                    } else {
                        this.task = Some(PendingTask::Read { kind, callback });
                        None
                    }
                }
            },
            Some(PendingTask::Flush { callback }) => {
                if this.out_buf.is_empty() {
                    Some(Resolution::Flush(callback, Ok(())))
                } else if let Some(err) = &fatal {
                    Some(Resolution::Flush(callback, Err(err.clone_for_retry())))
                } else {
                    this.task = Some(PendingTask::Flush { callback });
                    None
                }
            }
            None => None,
        };

        Self::recompute_mask(&mut this);
        drop(this);

        match resolved {
            Some(Resolution::Read(cb, result)) => cb(result),
            Some(Resolution::Flush(cb, result)) => cb(result),
            None => {}
        }
    }
}

enum Resolution {
    Read(Box<dyn FnOnce(Result<Bytes, RippleError>)>, Result<Bytes, RippleError>),
    Flush(Box<dyn FnOnce(Result<(), RippleError>)>, Result<(), RippleError>),
}

impl RippleError {
    /// Buffer errors are sticky and delivered to every subsequent task
    /// setup until `close`; `RippleError` does not derive `Clone` (it
    /// wraps `io::Error`), so this reconstructs an equivalent value.
    fn clone_for_retry(&self) -> RippleError {
        match self {
            RippleError::Timeout => RippleError::Timeout,
            RippleError::DelimiterNotFound => RippleError::DelimiterNotFound,
            RippleError::ConnectionReset => RippleError::ConnectionReset,
            RippleError::Io(e) => RippleError::Io(io::Error::new(e.kind(), e.to_string())),
            RippleError::EndOfFile => RippleError::EndOfFile,
            RippleError::ReactorSetupFailure(s) => RippleError::ReactorSetupFailure(s.clone()),
            RippleError::Cancelled => RippleError::Cancelled,
            RippleError::Uncaught(s) => RippleError::Uncaught(s.clone()),
            RippleError::InvalidArgument(s) => RippleError::InvalidArgument(s.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Reactor-integration behavior (the full scheduler driven by real I/O
    // events) is covered by the `stream_loopback` integration test instead,
    // since a real `AutoBuffer` needs a real pollable fd; these cover the
    // pure immediate-satisfaction logic in isolation.

    #[test]
    fn evaluate_read_exactly_waits_until_enough_bytes() {
        let mut buf = BytesMut::from(&b"ab"[..]);
        assert!(evaluate_pending_read(&mut buf, &ReadKind::Exactly(3)).is_none());
        buf.extend_from_slice(b"c");
        let result = evaluate_pending_read(&mut buf, &ReadKind::Exactly(3));
        assert_eq!(result.unwrap().unwrap(), Bytes::from_static(b"abc"));
        assert!(buf.is_empty());
    }

    #[test]
    fn evaluate_read_until_finds_delimiter() {
        let mut buf = BytesMut::from(&b"abc\r\ndef"[..]);
        let result = evaluate_pending_read(
            &mut buf,
            &ReadKind::Until {
                delimiter: b"\r\n".to_vec(),
                max_bytes: 64,
            },
        );
        assert_eq!(result.unwrap().unwrap(), Bytes::from_static(b"abc\r\n"));
        assert_eq!(&buf[..], b"def");
    }

    #[test]
    fn evaluate_read_until_reports_not_found_at_cap() {
        let mut buf = BytesMut::from(&b"abcdefgh"[..]);
        let result = evaluate_pending_read(
            &mut buf,
            &ReadKind::Until {
                delimiter: b"\r\n".to_vec(),
                max_bytes: 8,
            },
        );
        assert!(matches!(result, Some(Err(RippleError::DelimiterNotFound))));
    }
}
