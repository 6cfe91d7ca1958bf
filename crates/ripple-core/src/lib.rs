//! Single-threaded, coroutine-style concurrency runtime for network
//! services: an `mio`-backed reactor (L1) driving a `Future`-based task
//! dispatcher (L2), with a buffered stream abstraction (L3/L4) layered on
//! top. Everything in this crate is `!Send`/`!Sync` by design — there is no
//! locking because there is no second thread to race with.
//!
//! Transport-specific pieces (the TCP listener/server) live in the sibling
//! `ripple-tcp` crate.

mod buffer;
mod config;
pub mod dispatcher;
mod error;
pub mod reactor;
mod stream;

pub use buffer::AutoBuffer;
pub use config::{AddressFamily, BufferSizing, RuntimeConfig};
pub use dispatcher::{Deadline, Dispatcher, TaskError, TaskHandle, TaskOutcome, TaskState};
pub use error::{LogLevel, LogSink, Result, RippleError, TracingLogSink};
pub use reactor::{IoEvent, IoHandle, IoInterest, Reactor, SignalHandle, TimerHandle};
pub use stream::{Flush, ReadExactly, ReadUntil, Stream};
