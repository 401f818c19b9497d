use eyre::Report;
use thiserror::Error;

/// Returned by any operation that observed the run's cancellation token.
///
/// Stage code must be able to tell "the remote call failed" apart from "the
/// run was canceled while the call was in flight", so cancellation is a typed
/// marker rather than a message convention.
#[derive(Debug, Clone, Copy, Error)]
#[error("operation canceled")]
pub struct Canceled;

/// Terminal error from the retry engine once every attempt is spent.
#[derive(Debug, Error)]
#[error("'{operation}' failed after {attempts} attempt(s): {last_error}")]
pub struct RetryExhausted {
    pub operation: String,
    pub attempts: u32,
    pub last_error: Report,
}

/// True when `err` is, or wraps, a [`Canceled`] marker.
pub fn is_canceled(err: &Report) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<Canceled>().is_some())
}
