//! Error taxonomy for the runtime.
//!
//! Every suspending operation returns `Result<_, Error>`. Errors also travel
//! *through* pipes as items: a sender can push an [`Error`] downstream and the
//! receiving side gets it back as the `Err` arm of its `recv`.
//!
//! The variants fall into classes rather than a deep hierarchy:
//!
//! ```text
//!                    Halt
//!          ┌──────────┼──────────┐
//!       Closed      Stop     Abandoned
//! ```
//!
//! `Halt` is not a variant — it is the class of conditions that terminate
//! iteration over a pipe, tested with [`Error::is_halt`]. `Stop` is the
//! orderly-shutdown flavor of `Closed`, tested with [`Error::is_closed`].

use backtrace::Backtrace;

/// Errors produced by hub operations and runtime primitives.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A timed `pause`, `recv`, `send` or `wait` elapsed before a value
    /// arrived.
    #[error("timed out")]
    Timeout,

    /// The endpoint was explicitly closed, or the hub has stopped.
    #[error("closed")]
    Closed,

    /// Orderly-shutdown sentinel thrown by [`crate::Hub::stop`]. Counts as
    /// closed for classification purposes.
    #[error("stop")]
    Stop,

    /// The other end of the pipe was dropped while this end was still in use.
    #[error("abandoned")]
    Abandoned,

    /// Raised by a pipeline transform to drop the current item silently.
    #[error("filtered")]
    Filter,

    /// A preserved error carried through a pipe with the stack captured at
    /// the send site. The receive side logs the original trace before
    /// surfacing the error.
    #[error("unhandled exception: {message}")]
    Trace {
        /// Description of the original failure.
        message: String,
        /// Stack captured where the error entered the pipe.
        backtrace: Box<Backtrace>,
    },

    /// Readiness or signal plumbing failed at the OS boundary.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Capture the current stack and wrap *message* as a preserved error.
    ///
    /// The counterpart of throwing an exception into a channel: the trace is
    /// resolved eagerly so the receive side can print where the failure
    /// originated, not where it was observed.
    pub fn trace(message: impl Into<String>) -> Self {
        Error::Trace {
            message: message.into(),
            backtrace: Box::new(Backtrace::new()),
        }
    }

    /// True for the conditions that terminate iteration: `Closed`, `Stop`
    /// and `Abandoned`.
    pub fn is_halt(&self) -> bool {
        matches!(self, Error::Closed | Error::Stop | Error::Abandoned)
    }

    /// True for `Closed` and its shutdown flavor `Stop`.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed | Error::Stop)
    }

    /// True for `Timeout`.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    /// Log the preserved trace carried by a `Trace` error.
    ///
    /// No-op for every other variant. Called on the receive side just before
    /// the error is surfaced, mirroring the original's re-raise diagnostic.
    pub(crate) fn log_trace(&self) {
        if let Error::Trace { message, backtrace } = self {
            log::error!("re-raising preserved error: {message}\n{backtrace:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halt_classification() {
        assert!(Error::Closed.is_halt());
        assert!(Error::Stop.is_halt());
        assert!(Error::Abandoned.is_halt());
        assert!(!Error::Timeout.is_halt());
        assert!(!Error::Filter.is_halt());
    }

    #[test]
    fn stop_counts_as_closed() {
        assert!(Error::Stop.is_closed());
        assert!(Error::Closed.is_closed());
        assert!(!Error::Abandoned.is_closed());
    }

    #[test]
    fn trace_carries_message() {
        let err = Error::trace("boom");
        match err {
            Error::Trace { message, .. } => assert_eq!(message, "boom"),
            other => panic!("expected trace, got {other:?}"),
        }
    }
}
