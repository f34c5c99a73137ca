//! Error taxonomy and retry/fatal-connection classifiers.
//!
//! Seven "business" variants whose outcome will not
//! change on retry, plus `Unknown` for arbitrary underlying failures.

use std::fmt;

/// Maximum length a `failure_reason` may reach before being stored in a
/// broker header, to avoid leaking driver/credential details.
pub const REASON_MAX_LEN: usize = 256;

/// Stable identifying code plus human-readable title/message for one error.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{title}: {message}")]
pub struct ErrorDetail {
    pub code: String,
    pub title: String,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), title: title.into(), message: message.into() }
    }
}

/// Unified error taxonomy for the report-generation pipeline.
///
/// The first seven variants are "business" errors: their outcome will not
/// change on retry and they are always routed to the dead-letter queue
/// unchanged. `Unknown` wraps arbitrary underlying (adapter, I/O, driver)
/// errors and is retried up to `MAX_RETRIES`.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("validation failed: {0}")]
    Validation(ErrorDetail),
    #[error("entity not found: {0}")]
    EntityNotFound(ErrorDetail),
    #[error("entity conflict: {0}")]
    EntityConflict(ErrorDetail),
    #[error("unauthorized: {0}")]
    Unauthorized(ErrorDetail),
    #[error("forbidden: {0}")]
    Forbidden(ErrorDetail),
    #[error("failed precondition: {0}")]
    FailedPrecondition(ErrorDetail),
    #[error("unprocessable operation: {0}")]
    UnprocessableOperation(ErrorDetail),
    #[error("{0}")]
    Unknown(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The operation was cancelled or exceeded its deadline; never retried,
    /// so shutdown semantics are preserved.
    #[error("cancelled or deadline exceeded: {0}")]
    Cancelled(String),
}

impl ReportError {
    /// Wrap an arbitrary error as `Unknown`.
    pub fn unknown(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Unknown(Box::new(err))
    }

    /// Wrap an arbitrary message as `Unknown` without a structured source.
    pub fn unknown_msg(message: impl Into<String>) -> Self {
        Self::Unknown(Box::new(PlainError(message.into())))
    }

    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation(ErrorDetail::new(code, "validation failed", message))
    }

    pub fn entity_not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::EntityNotFound(ErrorDetail::new(code, "entity not found", message))
    }

    pub fn entity_conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::EntityConflict(ErrorDetail::new(code, "entity conflict", message))
    }

    pub fn unauthorized(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unauthorized(ErrorDetail::new(code, "unauthorized", message))
    }

    pub fn forbidden(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Forbidden(ErrorDetail::new(code, "forbidden", message))
    }

    pub fn failed_precondition(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::FailedPrecondition(ErrorDetail::new(code, "failed precondition", message))
    }

    pub fn unprocessable_operation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UnprocessableOperation(ErrorDetail::new(code, "unprocessable operation", message))
    }

    /// `true` iff this is one of the seven business-error variants.
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            ReportError::Validation(_)
                | ReportError::EntityNotFound(_)
                | ReportError::EntityConflict(_)
                | ReportError::Unauthorized(_)
                | ReportError::Forbidden(_)
                | ReportError::FailedPrecondition(_)
                | ReportError::UnprocessableOperation(_)
        )
    }

    /// Stable error code, when this variant carries one.
    pub fn code(&self) -> Option<&str> {
        match self {
            ReportError::Validation(d)
            | ReportError::EntityNotFound(d)
            | ReportError::EntityConflict(d)
            | ReportError::Unauthorized(d)
            | ReportError::Forbidden(d)
            | ReportError::FailedPrecondition(d)
            | ReportError::UnprocessableOperation(d) => Some(&d.code),
            ReportError::Unknown(_) | ReportError::Cancelled(_) => None,
        }
    }
}

#[derive(Debug)]
struct PlainError(String);

impl fmt::Display for PlainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for PlainError {}

/// Code prefixes that mark an `Unknown` error as business-classified even
/// though it wasn't constructed as one of the seven typed variants
/// (`"TPL-"` is one example prefix among a configurable, non-exhaustive
/// set).
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub business_code_prefixes: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self { business_code_prefixes: vec!["TPL-".to_string()] }
    }
}

/// `true` iff `e` should be retried by the broker/retry engine.
///
/// - A business variant is never retryable.
/// - `Cancelled` (cancellation / deadline-exceeded) is never retryable, to
///   preserve shutdown semantics.
/// - An `Unknown` error whose code matches a business-code prefix is
///   treated as non-retryable even though it isn't a typed business
///   variant.
/// - Everything else is retryable.
pub fn is_retryable(e: &ReportError) -> bool {
    is_retryable_with(e, &ClassifierConfig::default())
}

pub fn is_retryable_with(e: &ReportError, config: &ClassifierConfig) -> bool {
    if e.is_business() {
        return false;
    }
    if matches!(e, ReportError::Cancelled(_)) {
        return false;
    }
    if let Some(code) = e.code() {
        if config.business_code_prefixes.iter().any(|p| code.starts_with(p.as_str())) {
            return false;
        }
    }
    true
}

/// Substrings (case-insensitive) that mark a connection failure as fatal:
/// no amount of retrying the connect loop will succeed.
const FATAL_CONNECTION_MARKERS: &[&str] = &[
    "connection refused",
    "no such host",
    "dns lookup failure",
    "could not resolve",
    "unsupported database type",
    "invalid connection string",
    "authentication failed",
    "authorization failed",
    "access denied",
];

/// `true` iff the error text indicates a connection failure that cannot be
/// resolved by retrying (bad credentials, unreachable host, malformed DSN).
/// Used by the datasource registry to skip the remainder of a retry loop.
pub fn is_fatal_connection(message: &str) -> bool {
    let lower = message.to_lowercase();
    FATAL_CONNECTION_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Truncate `reason` to at most `REASON_MAX_LEN` bytes on a char boundary,
/// so it is safe to store in a broker header without splitting a UTF-8
/// sequence or leaking more of a driver error than intended.
pub fn truncate_reason(reason: &str) -> String {
    truncate_to_len(reason, REASON_MAX_LEN)
}

/// Same as [`truncate_reason`] but with a caller-supplied limit, for call
/// sites that read the limit from [`crate::ServiceConfig`] instead of the
/// default constant.
pub fn truncate_to_len(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}
