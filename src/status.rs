// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Status taxonomy shared by every datapath seam.
//!
//! Errors observed inside the pump loops never propagate to a caller; they
//! are converted into notifications by the forwarder. Everything that crosses
//! a public API boundary is one of the variants below.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = DatapathError> = std::result::Result<T, E>;

/// Coarse classification of a [`DatapathError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller violated the contract (missing network info, wrong key variant).
    InvalidArgument,
    /// Operation issued in a state that forbids it.
    FailedPrecondition,
    /// I/O on a closed fd, short write, unexpected event shape.
    Internal,
    /// Peer or kernel tore down the connection; transient.
    Aborted,
    /// The platform refused to provide a resource.
    Unavailable,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DatapathError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("internal: {0}")]
    Internal(String),

    #[error("aborted: {message}")]
    Aborted {
        message: String,
        /// Raw errno from the failing syscall, when one was involved.
        errno: Option<i32>,
    },

    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl DatapathError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        DatapathError::InvalidArgument(message.into())
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        DatapathError::FailedPrecondition(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        DatapathError::Internal(message.into())
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        DatapathError::Aborted {
            message: message.into(),
            errno: None,
        }
    }

    pub fn aborted_errno(message: impl Into<String>, errno: i32) -> Self {
        DatapathError::Aborted {
            message: message.into(),
            errno: Some(errno),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        DatapathError::Unavailable(message.into())
    }

    /// Build an `Aborted` status from the last OS error of a failed syscall.
    pub fn aborted_from_os(context: &str) -> Self {
        let err = std::io::Error::last_os_error();
        DatapathError::Aborted {
            message: format!("{context}: {err}"),
            errno: err.raw_os_error(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DatapathError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            DatapathError::FailedPrecondition(_) => ErrorKind::FailedPrecondition,
            DatapathError::Internal(_) => ErrorKind::Internal,
            DatapathError::Aborted { .. } => ErrorKind::Aborted,
            DatapathError::Unavailable(_) => ErrorKind::Unavailable,
        }
    }

    /// True when a protected socket read failed because the network that
    /// backed it was revoked by the platform. The kernel reports EPERM on
    /// such sockets; every other fault is treated as transient.
    pub fn is_permanent_network_failure(&self) -> bool {
        matches!(
            self,
            DatapathError::Aborted {
                errno: Some(libc::EPERM),
                ..
            }
        )
    }
}
