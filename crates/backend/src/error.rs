//! Error types for the backend client.
//!
//! The variants map one-to-one onto the user-facing failure categories:
//! [`BackendError::Request`] means the server could not be reached at all,
//! [`BackendError::Api`] means it answered with a failure, and
//! [`BackendError::Protocol`] means it answered with something the client
//! does not understand.

use imagineit_core::error::CoreError;

/// Errors from the backend HTTP/SSE layer.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The HTTP request itself failed (connection refused, DNS, TLS, etc.).
    #[error("Cannot reach backend (is the server running?): {0}")]
    Request(#[from] reqwest::Error),

    /// The backend returned a non-2xx status code.
    #[error("Backend error ({status}): {detail}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Backend-provided detail, or the raw body when none was given.
        detail: String,
    },

    /// The response does not match the expected contract (wrong shape,
    /// wrong reference count, unparseable body).
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Errors from the dispatch step specifically.
///
/// Validation failures are caught before any network call; everything else
/// wraps [`BackendError`].
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The generation config violates a precondition (empty prompt, ...).
    #[error(transparent)]
    Validation(#[from] CoreError),

    /// The dispatch HTTP call failed or returned an unusable reply.
    #[error(transparent)]
    Backend(#[from] BackendError),
}
