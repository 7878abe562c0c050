use thiserror::Error;

/// Errors raised by an [`ObjectStore`](super::ObjectStore) backend.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// The requested object does not exist.
    #[error("Object not found: {key}")]
    NotFound {
        /// Key that was looked up.
        key: String,
    },

    /// A conditional write lost its race (HTTP 412).
    ///
    /// `IfNoneMatch` found an existing object, or `IfMatch` found a different `ETag`.
    #[error("Precondition failed for object: {key}")]
    PreconditionFailed {
        /// Key whose condition was not met.
        key: String,
    },

    /// The backend could not be reached.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// A stored record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The backend is misconfigured.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Credentials were rejected (HTTP 403).
    #[error("Access denied to bucket '{bucket}'")]
    AccessDenied {
        /// Bucket that refused the request.
        bucket: String,
    },

    /// Any other backend failure.
    #[error("S3 error: {0}")]
    S3Error(String),
}

impl StorageError {
    /// Returns an operator-facing hint for this error.
    #[must_use]
    pub const fn suggestion(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => {
                "The record was never written or has been removed. \
                 Check the task id and the configured bucket."
            }
            Self::PreconditionFailed { .. } => {
                "Another worker changed this record between read and write. \
                 Losing a conditional write is expected under contention; \
                 the caller re-reads and decides again."
            }
            Self::ConnectionError(_) => {
                "Check that the S3 endpoint is reachable. For local runs start the \
                 S3-compatible service (e.g., docker compose up -d) and verify \
                 S3_ENDPOINT."
            }
            Self::SerializationError(_) => {
                "A stored record did not match the expected schema. It may have been \
                 written by an incompatible crmq version or edited by hand."
            }
            Self::ConfigurationError(_) => {
                "Check the [storage] section of .crmq.toml and the S3_BUCKET / \
                 S3_REGION environment variables."
            }
            Self::AccessDenied { .. } => {
                "Check AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY, and that the \
                 bucket policy allows GetObject, PutObject, DeleteObject and ListBucket."
            }
            Self::S3Error(_) => {
                "An unexpected S3 error occurred. The message above carries the \
                 service response."
            }
        }
    }

    /// Formats the error together with its suggestion for CLI output.
    #[must_use]
    pub fn display_rich(&self) -> String {
        format!("Error: {}\n\nSuggestion:\n  {}", self, self.suggestion())
    }

    /// Returns true when the error is the CAS-loss signal.
    #[must_use]
    pub const fn is_precondition_failed(&self) -> bool {
        matches!(self, Self::PreconditionFailed { .. })
    }

    /// Returns true when the object was missing.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}
