use thiserror::Error;

/// Errors surfaced by [`crate::Dispatcher`] operations.
///
/// This is the only failure this crate's structural operations can
/// produce. Listener and filter panics are not modeled as `Error` — they
/// propagate to the dispatch caller via ordinary unwinding instead (see
/// [`crate::Dispatcher::dispatch`]).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The handle passed to `insert_listener_before`/`remove_listener` does
    /// not identify a currently alive node in the target key's list. This
    /// covers handles that were never valid for this key, handles whose
    /// node has already been removed, and handles from a different key's
    /// list entirely.
    #[error("handle does not identify a currently alive listener")]
    InvalidHandle,
}

pub type Result<T> = std::result::Result<T, Error>;
