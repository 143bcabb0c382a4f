//! Error types for the sync engine.

use std::sync::Arc;
use thiserror::Error;

/// An opaque error value attached to a failed sync unit.
///
/// Units fail with whatever error type the caller's backend produces. The
/// engine never inspects it; listeners recover the concrete type with
/// [`std::error::Error::downcast_ref`] through the trait object.
pub type ErrorValue = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Wraps a concrete error into an [`ErrorValue`].
pub fn error_value<E>(error: E) -> ErrorValue
where
    E: std::error::Error + Send + Sync + 'static,
{
    Arc::new(error)
}

/// Errors originated by the engine or its standard fixtures.
///
/// Callers are free to attach their own error types to units instead; this
/// enum covers the conditions the engine itself names.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    /// The bearer credential could not be refreshed.
    #[error("credential refresh failed: {message}")]
    CredentialRefresh {
        /// Description of the refresh failure.
        message: String,
        /// True if retrying can not help (e.g. the credential was revoked).
        permanent: bool,
    },

    /// A backend request was rejected or could not complete.
    #[error("backend request failed: {0}")]
    Backend(String),
}

impl SyncError {
    /// Creates a retryable credential refresh error.
    pub fn refresh_retryable(message: impl Into<String>) -> Self {
        Self::CredentialRefresh {
            message: message.into(),
            permanent: false,
        }
    }

    /// Creates a permanent credential refresh error.
    pub fn refresh_permanent(message: impl Into<String>) -> Self {
        Self::CredentialRefresh {
            message: message.into(),
            permanent: true,
        }
    }

    /// Returns true if this error is permanent and should not be retried.
    pub fn is_permanent(&self) -> bool {
        match self {
            SyncError::CredentialRefresh { permanent, .. } => *permanent,
            SyncError::Backend(_) => false,
        }
    }
}
