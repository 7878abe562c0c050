use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::storage::StorageError;

/// Errors from the credential subsystem.
///
/// Cloneable so every caller waiting on one refresh receives the same error.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// The identity provider call failed; the cache may still serve the last token.
    #[error("Token refresh failed: {message}")]
    RefreshFailed { message: String },

    /// Refresh has been failing for longer than the grace period.
    #[error("Token refresh has been failing since {since}; grace period expired")]
    GraceExpired { since: DateTime<Utc> },

    /// No refresh token is available, or the provider revoked it.
    #[error("Not authorized: {message}")]
    NotAuthorized { message: String },

    /// A refresh did not finish in time.
    #[error("Timed out after {waited:?} waiting for token refresh")]
    RefreshTimeout { waited: Duration },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl AuthError {
    /// True if the worker cannot make progress until an operator intervenes.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::GraceExpired { .. } | Self::NotAuthorized { .. })
    }

    #[must_use]
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::RefreshFailed { .. } | Self::RefreshTimeout { .. } => {
                "The identity provider is unreachable or slow. Workers keep using the \
                 last token until auth.grace_period_secs elapses."
            }
            Self::GraceExpired { .. } => {
                "Refresh kept failing past the grace period. Check the token endpoint, \
                 client id and client secret, then restart the workers."
            }
            Self::NotAuthorized { .. } => {
                "Provide a refresh token with CRMQ_AUTH_REFRESH_TOKEN or auth.refresh_token, \
                 or re-authorize the connected app if the token was revoked."
            }
            Self::Storage(err) => err.suggestion(),
        }
    }

    #[must_use]
    pub fn display_rich(&self) -> String {
        format!("Error: {}\n\nSuggestion:\n  {}", self, self.suggestion())
    }
}
