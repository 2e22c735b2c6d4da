//! Share policies
//!
//! A resource carries a list of share policies deciding which other
//! clients may see it (through duplication). Evaluation:
//!
//! 1. Every `Require` policy covering the requested access must match,
//!    otherwise the request is denied.
//! 2. Any matching `Allow` policy covering the access grants it.
//! 3. Otherwise the resource's own default callback decides.
//!
//! `Revoke` is an action on the list (it removes matching allows), never a
//! stored policy.

use alloc::vec::Vec;

use crate::{AccessRights, ClientInfo, Handle, Privilege};

/// What a share policy matches on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ShareType {
    /// Matches nobody.
    None = 0,
    /// Matches every client.
    All = 1,
    /// Same OS security token as the owner.
    OsSecurityToken = 2,
    /// One specific client handle (`target`).
    Client = 3,
    /// Clients of one process id (`target`).
    Pid = 4,
    /// Clients subscribed to one MIG partition (`target`).
    SmcPartition = 5,
}

impl ShareType {
    /// Convert from the raw wire value.
    #[must_use]
    pub const fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::All),
            2 => Some(Self::OsSecurityToken),
            3 => Some(Self::Client),
            4 => Some(Self::Pid),
            5 => Some(Self::SmcPartition),
            _ => None,
        }
    }
}

/// What a share request does with its policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ShareAction {
    /// Grant access to matching clients.
    Allow = 0,
    /// Deny access to clients that do not match.
    Require = 1,
    /// Remove previously granted policies of the same type and target.
    Revoke = 2,
}

impl ShareAction {
    /// Convert from the raw wire value.
    #[must_use]
    pub const fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(Self::Allow),
            1 => Some(Self::Require),
            2 => Some(Self::Revoke),
            _ => None,
        }
    }
}

/// A share policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SharePolicy {
    /// Match criterion.
    pub share_type: ShareType,
    /// Criterion argument (client handle, pid or partition).
    pub target: u32,
    /// Access the policy covers.
    pub access: AccessRights,
    /// Policy action.
    pub action: ShareAction,
}

/// The client asking for access, as seen by policy evaluation.
#[derive(Clone, Copy, Debug)]
pub struct ShareRequest<'a> {
    /// Requesting client handle.
    pub client: Handle,
    /// Requesting client identity.
    pub info: &'a ClientInfo,
    /// Owner of the resource.
    pub owner: &'a ClientInfo,
    /// Access requested.
    pub access: AccessRights,
}

impl SharePolicy {
    /// Check whether the policy matches a request.
    #[must_use]
    pub fn matches(&self, req: &ShareRequest<'_>) -> bool {
        match self.share_type {
            ShareType::None => false,
            ShareType::All => true,
            ShareType::OsSecurityToken => req.info.security_token == req.owner.security_token,
            ShareType::Client => req.client.raw() == self.target,
            ShareType::Pid => req.info.pid == self.target,
            ShareType::SmcPartition => {
                req.info.smc_partition != 0 && req.info.smc_partition == self.target
            }
        }
    }
}

/// Ordered list of share policies on one resource.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SharePolicyList {
    policies: Vec<SharePolicy>,
}

impl SharePolicyList {
    /// Empty list.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            policies: Vec::new(),
        }
    }

    /// Apply a share request to the list.
    pub fn apply(&mut self, policy: SharePolicy) {
        match policy.action {
            ShareAction::Revoke => self.policies.retain(|p| {
                !(p.share_type == policy.share_type && p.target == policy.target)
            }),
            ShareAction::Allow | ShareAction::Require => {
                if !self.policies.contains(&policy) {
                    self.policies.push(policy);
                }
            }
        }
    }

    /// Stored policies.
    #[inline]
    #[must_use]
    pub fn policies(&self) -> &[SharePolicy] {
        &self.policies
    }

    /// Evaluate the list.
    ///
    /// # Returns
    ///
    /// `Some(verdict)` if the list decides, `None` to defer to the
    /// resource's default.
    #[must_use]
    pub fn evaluate(&self, req: &ShareRequest<'_>) -> Option<bool> {
        let covers = |p: &&SharePolicy| !p.access.intersect(req.access).is_empty();
        let mut relevant = self.policies.iter().filter(covers);
        if relevant
            .clone()
            .any(|p| p.action == ShareAction::Require && !p.matches(req))
        {
            return Some(false);
        }
        if relevant.any(|p| p.action == ShareAction::Allow && p.matches(req)) {
            return Some(true);
        }
        None
    }
}

/// Restrictive default: kernel clients, or the owner's own security token.
#[must_use]
pub fn default_share_allowed(req: &ShareRequest<'_>) -> bool {
    req.info.privilege == Privilege::Kernel || req.info.security_token == req.owner.security_token
}
