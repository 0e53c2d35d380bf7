//! Timeout enforcement.
//!
//! # Responsibilities
//! - Wrap socket operations with a deadline
//! - Classify errors that only mean "the other side went away"
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - A timeout surfaces as `io::ErrorKind::TimedOut` so callers handle one error type

use std::future::Future;
use std::io;
use std::time::Duration;

/// Run `fut` with a deadline, mapping expiry to `TimedOut`.
pub async fn with_deadline<T, F>(limit: Duration, what: &'static str, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{} timed out after {:?}", what, limit),
        )),
    }
}

/// Errors that are ordinary connection teardown.
pub fn is_benign_disconnect(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::TimedOut
    )
}
