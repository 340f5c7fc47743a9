//! Shared error type used across all mcpv crates.
//!
//! Every error maps deterministically to an [`ErrorCode`] so the API
//! boundary can translate failures into transport statuses with a single
//! mapper. The scheduler/router sentinels (`NoReadyInstance`,
//! `NoCapacity`, `ConnectionClosed`) are dedicated variants so callers can
//! match on them without string comparison.

use std::fmt;

/// Canonical status codes. The API boundary maps these to HTTP statuses;
/// nothing else in the system invents status codes of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    Unavailable,
    FailedPrecondition,
    PermissionDenied,
    Unauthenticated,
    Internal,
    Canceled,
    DeadlineExceeded,
    NotImplemented,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::FailedPrecondition => "FAILED_PRECONDITION",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::Unauthenticated => "UNAUTHENTICATED",
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::Canceled => "CANCELED",
            ErrorCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorCode::NotImplemented => "NOT_IMPLEMENTED",
        };
        f.write_str(s)
    }
}

/// Shared error enum for mcpv.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    // ── Scheduler / router sentinels ─────────────────────────────────
    /// No Ready instance exists and the caller asked not to start one.
    #[error("no ready instance for spec")]
    NoReadyInstance,

    /// Pool capacity exhausted, or an in-flight start lost a generation race.
    #[error("no capacity available for spec")]
    NoCapacity,

    /// The downstream connection closed while a call was in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// The named spec is not part of the running catalog.
    #[error("spec not found: {0}")]
    SpecNotFound(String),

    // ── Timeouts & cancellation ──────────────────────────────────────
    #[error("deadline exceeded in {op}")]
    DeadlineExceeded { op: &'static str },

    #[error("canceled in {op}")]
    Canceled { op: &'static str },

    // ── Protocol ─────────────────────────────────────────────────────
    /// A JSON-RPC error from a downstream or from governance rejection.
    /// Code `-32042` (URL elicitation required) is propagated verbatim.
    #[error("protocol error {code}: {message}")]
    Protocol {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    // ── Governance ───────────────────────────────────────────────────
    #[error("request rejected by {plugin}: {reason}")]
    Rejected { plugin: String, reason: String },

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    // ── Generic ──────────────────────────────────────────────────────
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{op} failed precondition: {message}")]
    FailedPrecondition { op: &'static str, message: String },

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("config: {0}")]
    Config(String),

    #[error("IO in {op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Wrap an IO error with the operation it happened in.
    pub fn io(op: &'static str, source: std::io::Error) -> Self {
        Error::Io { op, source }
    }

    /// The canonical status code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NoReadyInstance | Error::NoCapacity | Error::ConnectionClosed => {
                ErrorCode::Unavailable
            }
            Error::SpecNotFound(_) | Error::NotFound(_) => ErrorCode::NotFound,
            Error::DeadlineExceeded { .. } => ErrorCode::DeadlineExceeded,
            Error::Canceled { .. } => ErrorCode::Canceled,
            Error::Protocol { .. } => ErrorCode::Internal,
            Error::Rejected { .. } | Error::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Error::Unauthenticated(_) => ErrorCode::Unauthenticated,
            Error::InvalidArgument(_) | Error::Config(_) => ErrorCode::InvalidArgument,
            Error::FailedPrecondition { .. } => ErrorCode::FailedPrecondition,
            Error::NotImplemented(_) => ErrorCode::NotImplemented,
            Error::Io { .. } | Error::Json(_) | Error::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Whether a retry of the same operation could reasonably succeed.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Error::NoReadyInstance
                | Error::NoCapacity
                | Error::ConnectionClosed
                | Error::DeadlineExceeded { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
