//! Status codes
//!
//! Every entry point returns one of these. Values are the driver's stable
//! status numbers, so a status read off the wire can be compared against
//! the documented codes.

use rm_cap::{RmError, RmResult};

/// Status returned by every call.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    /// Success.
    Ok = 0x00,
    /// A bounded id space is full.
    ResourceExhausted = 0x1A,
    /// Privilege, rights or share policy rejected the call.
    PermissionDenied = 0x1B,
    /// Malformed, out-of-range or wrong-size parameter.
    InvalidArgument = 0x1F,
    /// Call not valid in the object's current state.
    InvalidState = 0x40,
    /// Allocation failed.
    NoMemory = 0x51,
    /// Command or operation not implemented by the object.
    NotSupported = 0x56,
    /// Client or handle does not exist.
    NotFound = 0x57,
    /// Hardware did not acknowledge in time.
    Timeout = 0x65,
}

impl Status {
    /// Convert to the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Check if this represents success.
    #[inline]
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Try to convert from a raw value.
    #[must_use]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0x00 => Some(Self::Ok),
            0x1A => Some(Self::ResourceExhausted),
            0x1B => Some(Self::PermissionDenied),
            0x1F => Some(Self::InvalidArgument),
            0x40 => Some(Self::InvalidState),
            0x51 => Some(Self::NoMemory),
            0x56 => Some(Self::NotSupported),
            0x57 => Some(Self::NotFound),
            0x65 => Some(Self::Timeout),
            _ => None,
        }
    }

    /// Get the status name for logging.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ok => "Ok",
            Self::ResourceExhausted => "ResourceExhausted",
            Self::PermissionDenied => "PermissionDenied",
            Self::InvalidArgument => "InvalidArgument",
            Self::InvalidState => "InvalidState",
            Self::NoMemory => "NoMemory",
            Self::NotSupported => "NotSupported",
            Self::NotFound => "NotFound",
            Self::Timeout => "Timeout",
        }
    }

    /// Convert back to a result.
    ///
    /// # Errors
    ///
    /// The matching [`RmError`] for every non-`Ok` status.
    pub const fn into_result(self) -> RmResult<()> {
        match self {
            Self::Ok => Ok(()),
            Self::ResourceExhausted => Err(RmError::ResourceExhausted),
            Self::PermissionDenied => Err(RmError::PermissionDenied),
            Self::InvalidArgument => Err(RmError::InvalidArgument),
            Self::InvalidState => Err(RmError::InvalidState),
            Self::NoMemory => Err(RmError::NoMemory),
            Self::NotSupported => Err(RmError::NotSupported),
            Self::NotFound => Err(RmError::NotFound),
            Self::Timeout => Err(RmError::Timeout),
        }
    }
}

impl From<RmError> for Status {
    fn from(err: RmError) -> Self {
        match err {
            RmError::InvalidArgument => Self::InvalidArgument,
            RmError::InvalidState => Self::InvalidState,
            RmError::NotSupported => Self::NotSupported,
            RmError::PermissionDenied => Self::PermissionDenied,
            RmError::ResourceExhausted => Self::ResourceExhausted,
            RmError::Timeout => Self::Timeout,
            RmError::NoMemory => Self::NoMemory,
            RmError::NotFound => Self::NotFound,
        }
    }
}

impl<T> From<RmResult<T>> for Status {
    fn from(result: RmResult<T>) -> Self {
        match result {
            Ok(_) => Self::Ok,
            Err(err) => err.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nv_codes() {
        assert_eq!(Status::InvalidArgument.as_u32(), 0x1F);
        assert_eq!(Status::from(RmError::Timeout).as_u32(), 0x65);
        assert_eq!(Status::from_u32(0x57), Some(Status::NotFound));
        assert_eq!(Status::from_u32(0x1234), None);
    }

    #[test]
    fn test_error_roundtrip() {
        for err in [
            RmError::InvalidArgument,
            RmError::InvalidState,
            RmError::NotSupported,
            RmError::PermissionDenied,
            RmError::ResourceExhausted,
            RmError::Timeout,
            RmError::NoMemory,
            RmError::NotFound,
        ] {
            assert_eq!(Status::from(err).into_result(), Err(err));
        }
        assert_eq!(Status::from(Ok::<u32, RmError>(5)), Status::Ok);
    }
}
