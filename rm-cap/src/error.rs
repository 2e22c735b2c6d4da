//! Resource error types
//!
//! One closed error enum covers every layer: object model, server tables,
//! dispatcher and scheduling handlers. The wire status codes in `rm-ctrl`
//! map one-to-one onto these variants.

use thiserror::Error;

/// Errors returned by resource operations.
///
/// Validation errors are raised before any state changes. State errors
/// leave the object as it was. `Timeout` is the one error that leaves a
/// documented transitional state behind (a channel group stays preempted).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error)]
#[must_use = "resource errors must be handled"]
pub enum RmError {
    /// A parameter is out of range, malformed or the wrong size.
    ///
    /// Also covers a parent whose class does not accept the child.
    #[error("invalid argument")]
    InvalidArgument,

    /// The operation is valid in general but not in the current state.
    #[error("invalid state for operation")]
    InvalidState,

    /// The resource does not implement the requested operation.
    #[error("operation not supported")]
    NotSupported,

    /// The caller lacks the privilege or handle rights, or a share policy
    /// vetoed the request.
    #[error("permission denied")]
    PermissionDenied,

    /// A bounded id space (subcontexts, TSG ids, channels) is full.
    #[error("resource exhausted")]
    ResourceExhausted,

    /// Hardware did not acknowledge in time.
    #[error("timed out waiting for hardware")]
    Timeout,

    /// Allocation failed or a client quota is exhausted.
    #[error("out of memory")]
    NoMemory,

    /// The client or handle does not exist.
    #[error("object not found")]
    NotFound,
}

impl RmError {
    /// Get a short name of the error, as used in log lines.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgument => "InvalidArgument",
            Self::InvalidState => "InvalidState",
            Self::NotSupported => "NotSupported",
            Self::PermissionDenied => "PermissionDenied",
            Self::ResourceExhausted => "ResourceExhausted",
            Self::Timeout => "Timeout",
            Self::NoMemory => "NoMemory",
            Self::NotFound => "NotFound",
        }
    }
}

/// Result type for resource operations.
pub type RmResult<T> = Result<T, RmError>;
