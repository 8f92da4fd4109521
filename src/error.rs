//! Error types used throughout redrive.
//!
//! The taxonomy separates queue/source *state* signals ([`ReadError`]) from
//! processing *dispositions* ([`ProcessError`]) and from the errors that
//! [`Actor::run`] itself can surface ([`RunError`]). State signals are
//! recovered locally by the worker loop and never reach the caller.
//!
//! [`Actor::run`]: crate::Actor::run

use std::{error, fmt};

/// A dyn boxed error.
pub type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

/// Outcome of a single read attempt against a source or delay queue.
///
/// These are flow-control signals rather than failures: `NoMessage` sends
/// the worker into its poll-interval wait, while `Exhausted` feeds the
/// clean-exit decision once every other input is exhausted too.
#[derive(Debug)]
pub enum ReadError {
    /// Nothing is ready right now; try again after the poll interval.
    NoMessage,
    /// The source or queue will never produce another message.
    Exhausted,
    /// An underlying failure in the source or queue implementation.
    Other(BoxError),
}

impl ReadError {
    /// Wraps an arbitrary error into [`ReadError::Other`].
    pub fn other<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        ReadError::Other(err.into())
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::NoMessage => write!(f, "no message available"),
            ReadError::Exhausted => write!(f, "exhausted"),
            ReadError::Other(err) => err.fmt(f),
        }
    }
}

impl error::Error for ReadError {}

/// Disposition reported by a [`Processor`] for a single message.
///
/// `Skip` and `Fail` are terminal: the message is acknowledged and never
/// retried. `Retry` marks a transient failure; the actor requeues the
/// message into the delay queue with backoff until retries are exhausted.
///
/// [`Processor`]: crate::Processor
#[derive(Debug)]
pub enum ProcessError {
    /// The message should be ignored. Terminal, not a failure.
    Skip,
    /// The message can never succeed; it is routed to the failure handler
    /// immediately, bypassing retries.
    Fail(BoxError),
    /// A transient failure; the message is scheduled for a retry.
    Retry(BoxError),
}

impl ProcessError {
    /// Wraps an error as an unconditional failure.
    pub fn fail<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        ProcessError::Fail(err.into())
    }

    /// Wraps an error as a transient failure to be retried.
    pub fn retry<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        ProcessError::Retry(err.into())
    }
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessError::Skip => write!(f, "skip message"),
            ProcessError::Fail(err) => write!(f, "fail message: {err}"),
            ProcessError::Retry(err) => write!(f, "retry message: {err}"),
        }
    }
}

impl error::Error for ProcessError {}

/// Error returned by [`Actor::run`].
///
/// Normal shutdown (cancellation, or both the source and the delay queue
/// reporting exhaustion) returns `Ok(())`, never an error.
///
/// [`Actor::run`]: crate::Actor::run
#[derive(Debug)]
pub enum RunError {
    /// No source was attached; there is nothing to do.
    MissingSource,
    /// A worker stopped on an unrecoverable source error.
    Source(BoxError),
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::MissingSource => write!(f, "no source attached, nothing to do"),
            RunError::Source(err) => write!(f, "source failed: {err}"),
        }
    }
}

impl error::Error for RunError {}
