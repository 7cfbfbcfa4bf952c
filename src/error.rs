use std::io;
use thiserror::Error;
use tracing::error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ContextError>;

/// Errors surfaced by the context index and its persistence bridge.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("corruption detected: {0}")]
    Corruption(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Logs and converts a store-layer failure that must not stop the caller.
///
/// The dispatch path retries queued contexts on the next tick, so a
/// transient store error is reported and swallowed there.
pub fn report_store_error(what: &str, err: &ContextError) {
    error!(error = %err, "store.{what}.failed");
}
