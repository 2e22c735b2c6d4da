//! Base layers
//!
//! Every concrete resource embeds the layers below it:
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ concrete (ChannelGroupApi…)  │  own teardown
//! │ ┌──────────────────────────┐ │
//! │ │ GpuResourceBase          │ │  identity, CPU mappings
//! │ │ ┌──────────────────────┐ │ │
//! │ │ │ RmResourceBase       │ │ │  owner, share policies
//! │ │ │ ┌──────────────────┐ │ │ │
//! │ │ │ │ ResourceBase     │ │ │ │  handle, parent, counters
//! │ │ │ └──────────────────┘ │ │ │
//! │ │ └──────────────────────┘ │ │
//! │ └──────────────────────────┘ │
//! └──────────────────────────────┘
//! ```
//!
//! Destruction runs outermost first and each layer tears down at most
//! once; the record of which layers ran lives in [`ResourceBase`].

use core::fmt;

use rm_cap::objects::GpuIdentity;
use rm_cap::share::{SharePolicy, SharePolicyList};
use rm_cap::{ClientInfo, Handle};

use crate::env::ServerEnv;

/// Set of layers that have torn down.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(transparent)]
pub struct Layers(u8);

impl Layers {
    /// No layer.
    pub const NONE: Self = Self(0);
    /// [`ResourceBase`].
    pub const RESOURCE: Self = Self(1 << 0);
    /// [`RmResourceBase`].
    pub const RM: Self = Self(1 << 1);
    /// [`GpuResourceBase`].
    pub const GPU: Self = Self(1 << 2);
    /// The concrete type.
    pub const OWN: Self = Self(1 << 3);

    /// Check if every layer in `other` is present.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Union of two sets.
    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl core::ops::BitOr for Layers {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

impl fmt::Debug for Layers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_set();
        for (layer, name) in [
            (Self::RESOURCE, "Resource"),
            (Self::RM, "RmResource"),
            (Self::GPU, "GpuResource"),
            (Self::OWN, "Own"),
        ] {
            if self.contains(layer) {
                list.entry(&name);
            }
        }
        list.finish()
    }
}

/// Innermost layer: naming and bookkeeping.
#[derive(Debug)]
pub struct ResourceBase {
    client: Handle,
    handle: Handle,
    parent: Handle,
    control_calls: u64,
    torn_down: Layers,
}

impl ResourceBase {
    /// Name a resource.
    #[must_use]
    pub const fn new(client: Handle, handle: Handle, parent: Handle) -> Self {
        Self {
            client,
            handle,
            parent,
            control_calls: 0,
            torn_down: Layers::NONE,
        }
    }

    /// Owning client.
    #[inline]
    #[must_use]
    pub const fn client(&self) -> Handle {
        self.client
    }

    /// Own handle.
    #[inline]
    #[must_use]
    pub const fn handle(&self) -> Handle {
        self.handle
    }

    /// Parent handle; null for a client.
    #[inline]
    #[must_use]
    pub const fn parent(&self) -> Handle {
        self.parent
    }

    /// Control handlers invoked on this resource.
    #[inline]
    #[must_use]
    pub const fn control_calls(&self) -> u64 {
        self.control_calls
    }

    pub(crate) fn note_control(&mut self) {
        self.control_calls += 1;
    }

    /// Layers that have torn down.
    #[inline]
    #[must_use]
    pub const fn torn_down(&self) -> Layers {
        self.torn_down
    }

    /// Record that `layer` is tearing down.
    ///
    /// Returns `false` if it already had.
    pub(crate) fn begin_teardown(&mut self, layer: Layers) -> bool {
        if self.torn_down.contains(layer) {
            return false;
        }
        self.torn_down = self.torn_down | layer;
        true
    }

    pub(crate) fn destruct(&mut self) {
        if self.begin_teardown(Layers::RESOURCE) {
            log::trace!("resource: {} {} released", self.client, self.handle);
        }
    }
}

/// Resource-manager layer: ownership and sharing.
#[derive(Debug)]
pub struct RmResourceBase {
    res: ResourceBase,
    owner: ClientInfo,
    share: SharePolicyList,
}

impl RmResourceBase {
    /// Wrap a base for a resource owned by `owner`.
    #[must_use]
    pub const fn new(res: ResourceBase, owner: ClientInfo) -> Self {
        Self {
            res,
            owner,
            share: SharePolicyList::new(),
        }
    }

    /// Inner layer.
    #[inline]
    #[must_use]
    pub const fn base(&self) -> &ResourceBase {
        &self.res
    }

    /// Inner layer, mutably.
    #[inline]
    pub fn base_mut(&mut self) -> &mut ResourceBase {
        &mut self.res
    }

    /// Identity of the owning client.
    #[inline]
    #[must_use]
    pub const fn owner(&self) -> &ClientInfo {
        &self.owner
    }

    /// Share policies.
    #[inline]
    #[must_use]
    pub const fn share_policies(&self) -> &SharePolicyList {
        &self.share
    }

    /// Add or revoke a share policy.
    pub fn apply_share(&mut self, policy: SharePolicy) {
        self.share.apply(policy);
    }

    pub(crate) fn destruct(&mut self) {
        if self.res.begin_teardown(Layers::RM) {
            self.share = SharePolicyList::new();
        }
        self.res.destruct();
    }
}

/// One CPU mapping of a GPU resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    /// CPU address.
    pub cpu_address: u64,
    /// Length.
    pub length: u64,
    /// Device the mapping was made through.
    pub device: Handle,
}

/// GPU layer: identity and CPU mappings.
#[derive(Debug)]
pub struct GpuResourceBase {
    rm: RmResourceBase,
    identity: GpuIdentity,
    mappings: Vec<Mapping>,
}

impl GpuResourceBase {
    /// Bind a resource to a GPU.
    #[must_use]
    pub const fn new(rm: RmResourceBase, identity: GpuIdentity) -> Self {
        Self {
            rm,
            identity,
            mappings: Vec::new(),
        }
    }

    /// Resource-manager layer.
    #[inline]
    #[must_use]
    pub const fn rm(&self) -> &RmResourceBase {
        &self.rm
    }

    /// Resource-manager layer, mutably.
    #[inline]
    pub fn rm_mut(&mut self) -> &mut RmResourceBase {
        &mut self.rm
    }

    /// GPU identity fixed at construction.
    #[inline]
    #[must_use]
    pub const fn identity(&self) -> GpuIdentity {
        self.identity
    }

    /// Live mappings.
    #[inline]
    #[must_use]
    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    pub(crate) fn add_mapping(&mut self, mapping: Mapping) {
        self.mappings.push(mapping);
    }

    pub(crate) fn take_mapping(&mut self, cpu_address: u64) -> Option<Mapping> {
        let pos = self
            .mappings
            .iter()
            .position(|m| m.cpu_address == cpu_address)?;
        Some(self.mappings.swap_remove(pos))
    }

    pub(crate) fn destruct(&mut self, env: &ServerEnv) {
        if self.rm.base_mut().begin_teardown(Layers::GPU) {
            for mapping in self.mappings.drain(..) {
                if let Err(err) = env
                    .hal
                    .mapper
                    .unmap(&self.identity, mapping.cpu_address, mapping.length)
                {
                    log::error!(
                        "resource: unmap of {:#x} failed: {}",
                        mapping.cpu_address,
                        err
                    );
                }
            }
        }
        self.rm.destruct();
    }
}
