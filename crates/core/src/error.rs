//! Unified error types for the trust-policy stores.

use thiserror::Error;

/// Errors surfaced by the trust-policy stores.
///
/// Parse failures are local to one line of a cache file and never abort a
/// load; they are logged at the call site and the line is skipped. Only
/// I/O failures propagate to the caller.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed line in a persisted cache file.
    #[error("malformed cache line: '{0}'")]
    Parse(String),

    /// File open/read/write/stat failure.
    #[error("cache file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Digest computation failed during pin validation.
    #[error("digest computation failed: {0}")]
    Hash(String),

    /// `save` was called on a store without a configured backing file.
    #[error("no backing file configured")]
    NoBackingFile,
}
