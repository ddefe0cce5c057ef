use std::fmt;

use thiserror::Error;

use crate::model::{RateLimitKey, ScrapeKey};
use crate::rate_limit::Acquisition;

/// Failure reported by the monitored API client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}; message={message}")]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        ApiError { kind, message: message.into() }
    }
}

/// Coarse classification of API failures, used as the `error_kind` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiErrorKind {
    Throttling,
    AccessDenied,
    InvalidParameter,
    Timeout,
    Service,
    Transport,
    Other,
}

impl ApiErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ApiErrorKind::Throttling => "Throttling",
            ApiErrorKind::AccessDenied => "AccessDenied",
            ApiErrorKind::InvalidParameter => "InvalidParameter",
            ApiErrorKind::Timeout => "Timeout",
            ApiErrorKind::Service => "Service",
            ApiErrorKind::Transport => "Transport",
            ApiErrorKind::Other => "Other",
        }
    }
}

impl fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collector registration failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Register collector; key={key}; reason={reason}")]
pub struct RegisterError {
    pub key: ScrapeKey,
    pub reason: String,
}

/// Failures surfaced by the scrape core.
#[derive(Debug, Error)]
pub enum ScrapeError {
    /// Permission to call was not granted (timed out or cancelled).
    #[error("Throttled; key={key}; outcome={outcome:?}")]
    Throttled { key: RateLimitKey, outcome: Acquisition },
    /// The guarded call itself failed.
    #[error("Call failed; operation={operation}; err={source}")]
    Call {
        operation: String,
        #[source]
        source: ApiError,
    },
    /// The account provider could not produce a snapshot.
    #[error("Accounts; err={0}")]
    Accounts(#[source] ApiError),
    #[error("Register; err={0}")]
    Register(#[from] RegisterError),
}
