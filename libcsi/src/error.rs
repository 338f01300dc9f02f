//! Failures returned by plugin services.
//!
//! [`CsiError`] is serializable so a server can ship it back to the client
//! unchanged.  Each variant reports exactly one status [`Code`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::status::Code;

/// Error returned from every service call.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum CsiError {
    /// Bad or unsupported request field.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Another operation on the same volume is still running.
    #[error("an operation for {0} is already in progress")]
    AlreadyInProgress(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The volume is not in a state that allows the operation.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// An external call did not finish in time.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// An external tool or the storage system failed.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The service or operation is not offered by this plugin instance.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    #[error("mount failed at {path}: {reason}")]
    MountFailed { path: String, reason: String },

    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed { path: String, reason: String },

    /// BeeGFS itself refused a directory operation.
    #[error("backend error: {0}")]
    BackendError(String),

    /// Socket I/O or a malformed frame.
    #[error("transport error: {0}")]
    TransportError(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Status attached to the response frame.
    #[must_use]
    pub fn code(&self) -> Code {
        match self {
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::AlreadyInProgress(_) => Code::Aborted,
            Self::NotFound(_) => Code::NotFound,
            Self::AlreadyExists(_) => Code::AlreadyExists,
            Self::FailedPrecondition(_) => Code::FailedPrecondition,
            Self::DeadlineExceeded(_) => Code::DeadlineExceeded,
            Self::Unavailable(_) | Self::TransportError(_) => Code::Unavailable,
            Self::Unimplemented(_) => Code::Unimplemented,
            Self::MountFailed { .. }
            | Self::UnmountFailed { .. }
            | Self::BackendError(_)
            | Self::Internal(_) => Code::Internal,
        }
    }

    pub fn backend(e: impl fmt::Display) -> Self {
        Self::BackendError(e.to_string())
    }

    pub fn transport(e: impl fmt::Display) -> Self {
        Self::TransportError(e.to_string())
    }

    pub fn internal(e: impl fmt::Display) -> Self {
        Self::Internal(e.to_string())
    }
}
