//! Cooperative cancellation.
//!
//! An [`AbortSignal`] is a cancellation token owned by the caller. Operations
//! race against it (and an optional deadline); whichever settles first wins and
//! the losers are dropped, which releases the timer and the signal waiter.

use std::future::Future;
use std::time::Duration;

use crate::error::{AbortedError, Error};

/// Caller-owned cancellation handle.
pub type AbortSignal = tokio_util::sync::CancellationToken;

/// Fail fast if `signal` has already fired.
pub fn check_aborted(signal: Option<&AbortSignal>) -> Result<(), AbortedError> {
    match signal {
        Some(s) if s.is_cancelled() => Err(AbortedError::Cancelled),
        _ => Ok(()),
    }
}

/// Run `operation` until it settles, `signal` fires or `timeout` elapses.
pub async fn abortable<T, F>(
    operation: F,
    signal: Option<&AbortSignal>,
    timeout: Option<Duration>,
) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    check_aborted(signal)?;

    let cancelled = async {
        match signal {
            Some(s) => s.cancelled().await,
            None => std::future::pending().await,
        }
    };
    let deadline = async {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        _ = cancelled => Err(AbortedError::Cancelled.into()),
        _ = deadline => Err(AbortedError::TimedOut {
            timeout: timeout.unwrap_or_default(),
        }
        .into()),
        result = operation => result,
    }
}
