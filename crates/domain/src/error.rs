use serde::Serialize;

/// Shared error type used across all conduit crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("unknown event: {0}")]
    UnknownEvent(String),

    #[error("bad session: {0}")]
    BadSession(String),

    #[error("session busy")]
    Busy,

    #[error("confirmation timed out")]
    ConfirmationTimeout,

    #[error("state expired")]
    StateExpired,

    #[error("state signature mismatch")]
    SignatureMismatch,

    #[error("state checksum mismatch")]
    ChecksumMismatch,

    #[error("unsupported state schema version: {0}")]
    VersionUnsupported(u32),

    #[error("plan failed: {0}")]
    PlanFailed(String),

    #[error("aggregate failed: {0}")]
    AggregateFailed(String),

    #[error("task coercion failed: {0}")]
    CoercionError(String),

    #[error("slow consumer")]
    SlowConsumer,

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The stable, wire-visible identifier carried in `metadata.error_kind`.
///
/// Every [`Error`] maps onto exactly one of these; this is the type that
/// crosses crate boundaries onto the event stream, never the error enum
/// itself (which carries borrow-unfriendly context for logging only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidFrame,
    UnknownEvent,
    BadSession,
    Busy,
    ConfirmationTimeout,
    StateExpired,
    SignatureMismatch,
    ChecksumMismatch,
    VersionUnsupported,
    PlanFailed,
    AggregateFailed,
    CoercionError,
    SlowConsumer,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidFrame => "invalid_frame",
            ErrorKind::UnknownEvent => "unknown_event",
            ErrorKind::BadSession => "bad_session",
            ErrorKind::Busy => "busy",
            ErrorKind::ConfirmationTimeout => "confirmation_timeout",
            ErrorKind::StateExpired => "state_expired",
            ErrorKind::SignatureMismatch => "signature_mismatch",
            ErrorKind::ChecksumMismatch => "checksum_mismatch",
            ErrorKind::VersionUnsupported => "version_unsupported",
            ErrorKind::PlanFailed => "plan_failed",
            ErrorKind::AggregateFailed => "aggregate_failed",
            ErrorKind::CoercionError => "coercion_error",
            ErrorKind::SlowConsumer => "slow_consumer",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Map to the stable wire-level error kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::Json(_) | Error::Other(_) | Error::Config(_) => {
                ErrorKind::InternalError
            }
            Error::InvalidFrame(_) => ErrorKind::InvalidFrame,
            Error::UnknownEvent(_) => ErrorKind::UnknownEvent,
            Error::BadSession(_) => ErrorKind::BadSession,
            Error::Busy => ErrorKind::Busy,
            Error::ConfirmationTimeout => ErrorKind::ConfirmationTimeout,
            Error::StateExpired => ErrorKind::StateExpired,
            Error::SignatureMismatch => ErrorKind::SignatureMismatch,
            Error::ChecksumMismatch => ErrorKind::ChecksumMismatch,
            Error::VersionUnsupported(_) => ErrorKind::VersionUnsupported,
            Error::PlanFailed(_) => ErrorKind::PlanFailed,
            Error::AggregateFailed(_) => ErrorKind::AggregateFailed,
            Error::CoercionError(_) => ErrorKind::CoercionError,
            Error::SlowConsumer => ErrorKind::SlowConsumer,
        }
    }
}
