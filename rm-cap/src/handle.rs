//! Resource handles
//!
//! Handles name resources within one client's table. Client handles
//! themselves live in a separate numeric range so that a stray object
//! handle can never be mistaken for a client.

use core::fmt;

/// A client-scoped resource handle.
///
/// A handle of zero (`Handle::NULL`) means "no handle" and asks the server
/// to pick one.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Handle(u32);

impl Handle {
    /// No handle.
    pub const NULL: Self = Self(0);

    /// First handle issued to clients.
    pub const CLIENT_BASE: u32 = 0xC1D0_0000;

    /// First server-generated object handle.
    pub const OBJECT_BASE: u32 = 0xCAF0_0000;

    /// Number of client handles that may exist at once.
    pub const MAX_CLIENTS: u32 = 0x0010_0000;

    /// Wrap a raw handle value.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw handle value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Build the handle of the `index`th client.
    #[inline]
    #[must_use]
    pub const fn client(index: u32) -> Self {
        Self(Self::CLIENT_BASE | (index & (Self::MAX_CLIENTS - 1)))
    }

    /// Check if this is the null handle.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Check if this handle lies in the client range.
    #[inline]
    #[must_use]
    pub const fn is_client(self) -> bool {
        (self.0 & !(Self::MAX_CLIENTS - 1)) == Self::CLIENT_BASE
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Handle::NULL")
        } else {
            write!(f, "Handle({:#010x})", self.0)
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_range() {
        let c = Handle::client(3);
        assert_eq!(c.raw(), 0xC1D0_0003);
        assert!(c.is_client());
        assert!(!Handle::from_raw(Handle::OBJECT_BASE).is_client());
        assert!(!Handle::NULL.is_client());
    }

    #[test]
    fn test_null() {
        assert!(Handle::NULL.is_null());
        assert!(!Handle::from_raw(1).is_null());
        assert_eq!(Handle::default(), Handle::NULL);
    }
}
