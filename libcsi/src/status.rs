//! Status codes attached to failed RPCs.
//!
//! The numbering matches the gRPC status codes so that a status produced by
//! this crate means the same thing to an orchestrator that speaks gRPC.

use std::fmt;

use serde::{Deserialize, Serialize};

/// gRPC-compatible status code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    /// The operation completed successfully.
    Ok = 0,
    /// Unknown error.
    Unknown = 2,
    /// Client specified an invalid argument.
    InvalidArgument = 3,
    /// Deadline expired before operation could complete.
    DeadlineExceeded = 4,
    /// Some requested entity was not found.
    NotFound = 5,
    /// Some entity that we attempted to create already exists.
    AlreadyExists = 6,
    /// The system is not in a state required for the operation's execution.
    FailedPrecondition = 9,
    /// The operation was aborted, typically because another operation on the
    /// same volume is still running.
    Aborted = 10,
    /// Operation is not implemented or not supported.
    Unimplemented = 12,
    /// Internal error.
    Internal = 13,
    /// The service is currently unavailable.
    Unavailable = 14,
}

impl Code {
    /// Numeric value on the wire.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Canonical upper-case name, e.g. `INVALID_ARGUMENT`.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
        }
    }

    /// Whether a caller may reasonably retry the same request later.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Code::Aborted | Code::Unavailable | Code::DeadlineExceeded
        )
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_match_grpc() {
        assert_eq!(Code::InvalidArgument.as_i32(), 3);
        assert_eq!(Code::Aborted.as_i32(), 10);
        assert_eq!(Code::Unavailable.as_i32(), 14);
    }

    #[test]
    fn retryable_codes() {
        assert!(Code::Aborted.is_retryable());
        assert!(Code::DeadlineExceeded.is_retryable());
        assert!(!Code::InvalidArgument.is_retryable());
        assert_eq!(Code::NotFound.to_string(), "NOT_FOUND");
    }
}
