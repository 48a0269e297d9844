//! Error kinds shared by the store, the policy evaluator, and the database
//! facade. Deliberately few variants: callers (the server's dispatch layer,
//! the client shim) map these onto transport-specific outcomes themselves.

use std::fmt;

/// Alias used throughout `cellar-core`, the way `kv_rs::error::CResult` is
/// used throughout the teacher crate.
pub type CResult<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Secret, version, or mirror entry does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A conditional get found the active version already matches the
    /// caller's version. Not a failure in the usual sense -- callers that
    /// care about HTTP status codes map this to 304.
    #[error("value not changed")]
    ValueNotChanged,

    /// Policy evaluation rejected the action.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Malformed request: empty name, delete of the active version, unknown
    /// policy action, wrong method/content-type, missing CSRF header.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Decryption failure, file I/O failure, identity oracle failure, audit
    /// sink failure. Always composited with the underlying cause.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn internal(err: impl fmt::Display) -> Error {
        Error::Internal(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("json: {err}"))
    }
}
