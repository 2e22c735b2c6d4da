//! Handle access rights
//!
//! Rights are orthogonal and attached to each handle. Interpretation:
//!
//! - **Read**: Query controls (`GET_*`) and identity
//! - **Write**: State-changing controls
//! - **Dup**: Duplicate the handle into another client
//! - **Map**: Map the resource into a CPU address space
//! - **Nice**: Change scheduling priority (interleave level, realtime)

use core::fmt;

/// Access rights for resource handles.
///
/// Rights can be reduced when a handle is duplicated but never raised above
/// the source handle's rights.
///
/// # Layout
///
/// - Bit 0: Read
/// - Bit 1: Write
/// - Bit 2: Dup
/// - Bit 3: Map
/// - Bit 4: Nice
/// - Bits 5-7: Reserved (must be zero)
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(transparent)]
pub struct AccessRights(u8);

impl AccessRights {
    /// No rights.
    pub const NONE: Self = Self(0);

    /// Query state.
    pub const READ: Self = Self(1 << 0);

    /// Mutate state.
    pub const WRITE: Self = Self(1 << 1);

    /// Duplicate into another client.
    pub const DUP: Self = Self(1 << 2);

    /// Map into a CPU address space.
    pub const MAP: Self = Self(1 << 3);

    /// Raise scheduling priority.
    pub const NICE: Self = Self(1 << 4);

    /// Read and Write rights.
    pub const RW: Self = Self(Self::READ.0 | Self::WRITE.0);

    /// All rights.
    pub const ALL: Self = Self(0x1F);

    /// Create rights from raw bits.
    ///
    /// Only the lower 5 bits are used; upper bits are masked off.
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL.0)
    }

    /// Get the raw bits.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Check if these rights contain all the specified rights.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Intersect rights (logical AND).
    #[inline]
    #[must_use]
    pub const fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Union rights (logical OR).
    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Check if every right in `self` is also in `other`.
    #[inline]
    #[must_use]
    pub const fn is_subset_of(self, other: Self) -> bool {
        (self.0 & !other.0) == 0
    }

    /// Check if no rights are set.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for AccessRights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(AccessRights, &str); 5] = [
            (AccessRights::READ, "Read"),
            (AccessRights::WRITE, "Write"),
            (AccessRights::DUP, "Dup"),
            (AccessRights::MAP, "Map"),
            (AccessRights::NICE, "Nice"),
        ];
        let mut list = f.debug_set();
        for (right, name) in NAMES {
            if self.contains(right) {
                list.entry(&name);
            }
        }
        list.finish()
    }
}

impl fmt::Display for AccessRights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |r: Self, c: char| if self.contains(r) { c } else { '-' };
        write!(
            f,
            "{}{}{}{}{}",
            flag(Self::READ, 'r'),
            flag(Self::WRITE, 'w'),
            flag(Self::DUP, 'd'),
            flag(Self::MAP, 'm'),
            flag(Self::NICE, 'n'),
        )
    }
}

impl core::ops::BitAnd for AccessRights {
    type Output = Self;

    #[inline]
    fn bitand(self, rhs: Self) -> Self::Output {
        self.intersect(rhs)
    }
}

impl core::ops::BitOr for AccessRights {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rights_construction() {
        assert_eq!(AccessRights::NONE.bits(), 0);
        assert_eq!(AccessRights::ALL.bits(), 0x1F);
        assert_eq!(AccessRights::RW.bits(), 0x03);
        assert_eq!(AccessRights::from_bits(0xFF), AccessRights::ALL);
    }

    #[test]
    fn test_rights_subset() {
        assert!(AccessRights::READ.is_subset_of(AccessRights::ALL));
        assert!(!AccessRights::NICE.is_subset_of(AccessRights::RW));
        assert_eq!(AccessRights::ALL & AccessRights::RW, AccessRights::RW);
        assert_eq!(AccessRights::READ | AccessRights::WRITE, AccessRights::RW);
    }

    #[test]
    fn test_rights_display() {
        use alloc::format;
        assert_eq!(format!("{}", AccessRights::RW), "rw---");
        assert_eq!(format!("{}", AccessRights::ALL), "rwdmn");
    }
}
