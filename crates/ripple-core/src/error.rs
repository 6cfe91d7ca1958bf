//! Error taxonomy for the reactor/dispatcher/buffer/stream stack.
//!
//! Kept deliberately flat: every awaitable in this crate resolves to either a
//! value or one of these variants, and they all implement `std::error::Error`
//! so callers can match, `?`-propagate, or log uniformly.

use std::fmt;
use std::io;

/// The single error type surfaced by every fallible operation in this crate.
#[derive(Debug, thiserror::Error)]
pub enum RippleError {
    /// A timed awaitable's deadline elapsed before it was otherwise satisfied.
    #[error("operation timed out")]
    Timeout,

    /// `read_until` exhausted `max_bytes` without finding the delimiter.
    #[error("delimiter not found within max_bytes")]
    DelimiterNotFound,

    /// The remote end closed the connection or sent a reset.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// An underlying I/O failure, distinct from the reset/EOF cases above.
    #[error("I/O error")]
    Io(#[from] io::Error),

    /// Analogous to `ConnectionReset` for stream-like fds that hit EOF.
    #[error("end of file")]
    EndOfFile,

    /// The reactor refused to register a watch (e.g. `mio::Poll` setup
    /// failed). Not recoverable by retrying the same call.
    #[error("reactor setup failed: {0}")]
    ReactorSetupFailure(String),

    /// The task was cancelled; once set this is sticky for the task.
    #[error("task was cancelled")]
    Cancelled,

    /// Any other failure surfaced from a task step. Logged at the point the
    /// task is marked `Failed`.
    #[error("uncaught task failure: {0}")]
    Uncaught(String),

    /// A caller-supplied argument violated an operation's precondition
    /// (e.g. `read_exactly(0, ..)`, `read_until` with an empty delimiter).
    /// Returned immediately, before any task is registered.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl RippleError {
    /// Shorthand used by acceptor loops to decide whether an `accept()`
    /// failure is transient and should simply be retried on the next READ
    /// event, per the spec's accept-loop recovery policy.
    pub fn is_transient_accept_error(err: &io::Error) -> bool {
        matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = RippleError> = std::result::Result<T, E>;

/// A minimal logging sink abstraction matching the spec's `log(level,
/// message, optional exception)` collaborator. `TracingLogSink` is the
/// default implementation; hosts embedding this crate can supply their own.
pub trait LogSink {
    fn log(&self, level: LogLevel, message: &str, cause: Option<&dyn std::error::Error>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        })
    }
}

/// Routes records through `tracing`; this is what every binary in this
/// workspace installs by default.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, level: LogLevel, message: &str, cause: Option<&dyn std::error::Error>) {
        match (level, cause) {
            (LogLevel::Error, Some(c)) => tracing::error!(error = %c, "{message}"),
            (LogLevel::Error, None) => tracing::error!("{message}"),
            (LogLevel::Warn, Some(c)) => tracing::warn!(error = %c, "{message}"),
            (LogLevel::Warn, None) => tracing::warn!("{message}"),
            (LogLevel::Info, Some(c)) => tracing::info!(error = %c, "{message}"),
            (LogLevel::Info, None) => tracing::info!("{message}"),
            (LogLevel::Debug, Some(c)) => tracing::debug!(error = %c, "{message}"),
            (LogLevel::Debug, None) => tracing::debug!("{message}"),
        }
    }
}
