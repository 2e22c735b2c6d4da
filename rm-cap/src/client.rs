//! Client identity
//!
//! What the server knows about the process behind a client handle. Share
//! policies and privileged controls are evaluated against this.

/// Privilege level of a client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum Privilege {
    /// Ordinary user process.
    #[default]
    User = 0,
    /// Process holding the admin capability.
    Admin = 1,
    /// In-kernel client.
    Kernel = 2,
}

impl Privilege {
    /// Check whether this level satisfies admin-only controls.
    #[inline]
    #[must_use]
    pub const fn is_admin(self) -> bool {
        matches!(self, Self::Admin | Self::Kernel)
    }
}

/// Identity of a client, captured at client allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct ClientInfo {
    /// Owning process id.
    pub pid: u32,
    /// OS security token (user/session).
    pub security_token: u64,
    /// Privilege level.
    pub privilege: Privilege,
    /// MIG (SMC) partition the client is subscribed to, 0 if none.
    pub smc_partition: u32,
}

impl ClientInfo {
    /// Create a user-level client identity.
    #[inline]
    #[must_use]
    pub const fn user(pid: u32, security_token: u64) -> Self {
        Self {
            pid,
            security_token,
            privilege: Privilege::User,
            smc_partition: 0,
        }
    }

    /// Same identity with a different privilege.
    #[inline]
    #[must_use]
    pub const fn with_privilege(mut self, privilege: Privilege) -> Self {
        self.privilege = privilege;
        self
    }
}
