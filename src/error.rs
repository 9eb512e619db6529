//! Error types for the credential subsystem.
//!
//! Errors propagate as `anyhow::Error` so that every layer can attach context. Where a caller (or
//! a test) needs to know *what kind* of failure happened, the root cause is an [`AuthError`], which
//! can be recovered with `err.downcast_ref::<AuthError>()` even after context has been added.

use std::time::Duration;

pub type Error = anyhow::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// The kinds of failure that callers of the credential subsystem can act on.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// A lookup found nothing, e.g. no stored token for an email.
    #[error("{what} not found")]
    NotFound { what: String },

    /// The secret store backend could not be reached (locked keychain, denied access, etc.).
    #[error("secret store backend '{backend}' is unavailable: {reason}")]
    StoreUnavailable { backend: String, reason: String },

    /// Every account source was exhausted.
    #[error(
        "missing --account (or set GOG_ACCOUNT, set a default via `gog auth default <email>` or \
        `gog auth manage`, or store exactly one token)"
    )]
    MissingAccount,

    /// The freshly minted token belongs to someone other than the expected account.
    #[error("authorized as {actual}, expected {expected}")]
    IdentityMismatch { expected: String, actual: String },

    /// Contradictory scope options.
    #[error("cannot combine --readonly with --drive-scope=file (file is write-capable)")]
    ScopeConflict,

    /// The OAuth redirect carried a state value that this attempt did not issue.
    #[error("OAuth state mismatch: the redirect was not issued by this authorization attempt")]
    StateMismatch,

    /// The user or the process aborted the operation.
    #[error("{operation} was cancelled")]
    Cancelled { operation: String },

    /// A bounded wait ran out.
    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout { operation: String, after: Duration },

    /// Malformed input such as an import file or a service account key.
    #[error("{0}")]
    Validation(String),
}

impl AuthError {
    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub(crate) fn unavailable(backend: impl Into<String>, reason: impl ToString) -> Self {
        Self::StoreUnavailable {
            backend: backend.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    pub(crate) fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

/// Returns the `AuthError` at the root of `err`, if there is one.
pub fn auth_error(err: &Error) -> Option<&AuthError> {
    err.downcast_ref::<AuthError>()
}
