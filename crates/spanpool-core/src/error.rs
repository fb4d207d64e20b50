//! Error taxonomy shared by every pool.
//!
//! Every failure surfaced to a caller carries an [`ErrorCode`] translated
//! from the transport status, so callers can tell retryable conditions
//! (`DeadlineExceeded`, `Aborted`, `Unavailable`) apart from terminal ones.

use std::fmt;

use thiserror::Error;

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Marker the server embeds in `NotFound` statuses for dead sessions.
const SESSION_NOT_FOUND: &str = "Session not found";

/// Error kinds, mirroring the transport's status codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The caller cancelled the operation.
    Cancelled,
    /// The request was malformed, or a session was released to the wrong pool.
    InvalidArgument,
    /// The per-call timeout elapsed.
    DeadlineExceeded,
    /// The resource does not exist; dead sessions are reported separately.
    NotFound,
    /// The resource already exists.
    AlreadyExists,
    /// The credential lacks permission.
    PermissionDenied,
    /// The credential was rejected.
    Unauthenticated,
    /// No session capacity and the pool is configured to fail fast.
    ResourceExhausted,
    /// The pool or connection is closed, or the object is in the wrong state.
    FailedPrecondition,
    /// The transaction was aborted by the server and may be retried.
    Aborted,
    /// A value was outside its valid range.
    OutOfRange,
    /// The server does not implement the call.
    Unimplemented,
    /// An invariant broke in the server or in the pool.
    Internal,
    /// The server is temporarily unreachable.
    Unavailable,
    /// A stream ended inside a chunked value.
    DataLoss,
    /// Any status without a better match.
    Unknown,
}

impl ErrorCode {
    /// Whether the whole logical operation may be safely re-issued.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::DeadlineExceeded | ErrorCode::Aborted | ErrorCode::Unavailable
        )
    }

    /// Message used when the transport supplied none.
    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::Cancelled => "The operation was cancelled.",
            ErrorCode::InvalidArgument => "An invalid argument was supplied.",
            ErrorCode::DeadlineExceeded => {
                "The deadline expired before the operation could complete."
            }
            ErrorCode::NotFound => "The requested entity was not found.",
            ErrorCode::AlreadyExists => "The entity already exists.",
            ErrorCode::PermissionDenied => {
                "The caller does not have permission to execute the operation."
            }
            ErrorCode::Unauthenticated => {
                "The request does not have valid authentication credentials."
            }
            ErrorCode::ResourceExhausted => "A resource has been exhausted.",
            ErrorCode::FailedPrecondition => {
                "The system is not in a state required for the operation."
            }
            ErrorCode::Aborted => "The operation was aborted.",
            ErrorCode::OutOfRange => "The operation was attempted past the valid range.",
            ErrorCode::Unimplemented => "The operation is not implemented.",
            ErrorCode::Internal => "An internal error occurred.",
            ErrorCode::Unavailable => "The service is currently unavailable.",
            ErrorCode::DataLoss => "Unrecoverable data loss or corruption.",
            ErrorCode::Unknown => "An unknown error occurred.",
        }
    }
}

impl From<tonic::Code> for ErrorCode {
    fn from(code: tonic::Code) -> Self {
        match code {
            tonic::Code::Cancelled => ErrorCode::Cancelled,
            tonic::Code::InvalidArgument => ErrorCode::InvalidArgument,
            tonic::Code::DeadlineExceeded => ErrorCode::DeadlineExceeded,
            tonic::Code::NotFound => ErrorCode::NotFound,
            tonic::Code::AlreadyExists => ErrorCode::AlreadyExists,
            tonic::Code::PermissionDenied => ErrorCode::PermissionDenied,
            tonic::Code::Unauthenticated => ErrorCode::Unauthenticated,
            tonic::Code::ResourceExhausted => ErrorCode::ResourceExhausted,
            tonic::Code::FailedPrecondition => ErrorCode::FailedPrecondition,
            tonic::Code::Aborted => ErrorCode::Aborted,
            tonic::Code::OutOfRange => ErrorCode::OutOfRange,
            tonic::Code::Unimplemented => ErrorCode::Unimplemented,
            tonic::Code::Internal => ErrorCode::Internal,
            tonic::Code::Unavailable => ErrorCode::Unavailable,
            tonic::Code::DataLoss => ErrorCode::DataLoss,
            tonic::Code::Ok | tonic::Code::Unknown => ErrorCode::Unknown,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A typed pool or transport failure.
///
/// `Clone` so that single-flight operations can hand the same outcome to
/// every waiter.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct Error {
    code: ErrorCode,
    message: String,
    session_expired: bool,
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            session_expired: false,
        }
    }

    /// Build an error carrying the code's default message.
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn cancelled() -> Self {
        Self::from_code(ErrorCode::Cancelled)
    }

    /// The server no longer knows the session; surfaced as `Aborted` so the
    /// caller retries the logical operation on a fresh session.
    pub fn session_expired(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Aborted,
            message: message.into(),
            session_expired: true,
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn is_session_expired(&self) -> bool {
        self.session_expired
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        let code = ErrorCode::from(status.code());
        if code == ErrorCode::NotFound && status.message().contains(SESSION_NOT_FOUND) {
            return Error::session_expired(status.message());
        }
        if status.message().is_empty() {
            Error::from_code(code)
        } else {
            Error::new(code, status.message())
        }
    }
}
