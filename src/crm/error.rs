use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Whether a failed call may succeed if repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Retryable,
    Permanent,
}

/// Closed classification of CRM call failures.
///
/// Call sites never decide retryability themselves; they classify the failure
/// and the category carries the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Connection refused, reset, DNS.
    Network,
    /// The request or query timed out.
    Timeout,
    /// The CRM throttled the caller.
    RateLimited,
    /// 5xx from the CRM.
    ServerError,
    /// The access token was rejected.
    SessionExpired,
    /// Another transaction holds the row.
    RecordLocked,
    /// Field or business-rule validation failed.
    Validation,
    NotFound,
    /// The integration user may not perform the operation.
    Forbidden,
    /// Duplicate rules or unique fields rejected the record.
    Duplicate,
    /// The request could not be built or parsed.
    Malformed,
}

impl ErrorCategory {
    #[must_use]
    pub const fn retry_class(self) -> RetryClass {
        match self {
            Self::Network
            | Self::Timeout
            | Self::RateLimited
            | Self::ServerError
            | Self::SessionExpired
            | Self::RecordLocked => RetryClass::Retryable,
            Self::Validation
            | Self::NotFound
            | Self::Forbidden
            | Self::Duplicate
            | Self::Malformed => RetryClass::Permanent,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self.retry_class(), RetryClass::Retryable)
    }

    /// Category for an HTTP status with no recognizable error code.
    #[must_use]
    pub const fn from_http_status(status: u16) -> Self {
        match status {
            401 => Self::SessionExpired,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            408 => Self::Timeout,
            409 => Self::RecordLocked,
            415 | 422 => Self::Malformed,
            429 => Self::RateLimited,
            500..=599 => Self::ServerError,
            _ => Self::Validation,
        }
    }

    /// Category for a CRM error code such as `UNABLE_TO_LOCK_ROW`.
    ///
    /// Returns `None` for codes outside the known set.
    #[must_use]
    pub fn from_error_code(code: &str) -> Option<Self> {
        let category = match code {
            "UNABLE_TO_LOCK_ROW" => Self::RecordLocked,
            "REQUEST_LIMIT_EXCEEDED" | "TXN_SECURITY_LIMIT_EXCEEDED" | "CONCURRENT_REQUEST_LIMIT" => {
                Self::RateLimited
            }
            "INVALID_SESSION_ID" => Self::SessionExpired,
            "SERVER_UNAVAILABLE" | "UNKNOWN_EXCEPTION" => Self::ServerError,
            "QUERY_TIMEOUT" | "REQUEST_RUNNING_TOO_LONG" => Self::Timeout,
            "DUPLICATE_VALUE" | "DUPLICATES_DETECTED" => Self::Duplicate,
            "NOT_FOUND" | "ENTITY_IS_DELETED" | "INVALID_CROSS_REFERENCE_KEY" => Self::NotFound,
            "INSUFFICIENT_ACCESS" | "INSUFFICIENT_ACCESS_OR_READONLY" | "API_DISABLED_FOR_ORG" => {
                Self::Forbidden
            }
            "MALFORMED_QUERY" | "MALFORMED_ID" | "JSON_PARSER_ERROR" | "INVALID_TYPE"
            | "INVALID_FIELD" => Self::Malformed,
            "REQUIRED_FIELD_MISSING"
            | "FIELD_CUSTOM_VALIDATION_EXCEPTION"
            | "FIELD_INTEGRITY_EXCEPTION"
            | "STRING_TOO_LONG"
            | "INVALID_EMAIL_ADDRESS"
            | "INVALID_FIELD_FOR_INSERT_UPDATE"
            | "INVALID_OR_NULL_FOR_RESTRICTED_PICKLIST" => Self::Validation,
            _ => return None,
        };
        Some(category)
    }

    /// Error code first, then HTTP status.
    #[must_use]
    pub fn classify(status: u16, code: Option<&str>) -> Self {
        code.and_then(Self::from_error_code)
            .unwrap_or_else(|| Self::from_http_status(status))
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::SessionExpired => "session_expired",
            Self::RecordLocked => "record_locked",
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
            Self::Duplicate => "duplicate",
            Self::Malformed => "malformed",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed CRM call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{category}: {message}")]
pub struct ExecutionError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ExecutionError {
    #[must_use]
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }

    #[must_use]
    pub const fn is_session_expired(&self) -> bool {
        matches!(self.category, ErrorCategory::SessionExpired)
    }
}

impl From<reqwest::Error> for ExecutionError {
    fn from(err: reqwest::Error) -> Self {
        let category = if err.is_timeout() {
            ErrorCategory::Timeout
        } else if err.is_decode() {
            ErrorCategory::ServerError
        } else if err.is_builder() {
            ErrorCategory::Malformed
        } else {
            ErrorCategory::Network
        };
        Self::new(category, err.to_string())
    }
}
