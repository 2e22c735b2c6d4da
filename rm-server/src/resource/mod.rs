//! Resources
//!
//! Server-side resource objects. Each class is a concrete type implementing
//! [`Resource`] and exposing views for the interfaces its class declares.
//!
//! # Interfaces
//!
//! | Interface      | Trait            | Provides                           |
//! |----------------|------------------|------------------------------------|
//! | `Resource`     | [`Resource`]     | naming, teardown, downcast         |
//! | `RmResource`   | [`RmResource`]   | owner, share policy evaluation     |
//! | `GpuResource`  | [`GpuResource`]  | GPU identity, mapping, reg window  |
//! | `Schedulable`  | [`Schedulable`]  | TSG id, scheduling state           |
//! | `Shareable`    | [`Shareable`]    | duplication                        |
//!
//! [`cast`] answers "absent" for an interface outside the class's declared
//! set; it never fails.

/// Layer accessors and views of a resource embedding a
/// [`GpuResourceBase`] in field `$field`, for use inside
/// `impl Resource`.
macro_rules! gpu_resource_views {
    ($field:ident) => {
        fn base(&self) -> &$crate::resource::ResourceBase {
            self.$field.rm().base()
        }

        fn base_mut(&mut self) -> &mut $crate::resource::ResourceBase {
            self.$field.rm_mut().base_mut()
        }

        fn as_any(&self) -> &dyn core::any::Any {
            self
        }

        fn as_rm(&self) -> Option<&dyn $crate::resource::RmResource> {
            Some(self)
        }

        fn as_rm_mut(&mut self) -> Option<&mut dyn $crate::resource::RmResource> {
            Some(self)
        }

        fn as_gpu(&self) -> Option<&dyn $crate::resource::GpuResource> {
            Some(self)
        }

        fn as_gpu_mut(&mut self) -> Option<&mut dyn $crate::resource::GpuResource> {
            Some(self)
        }
    };
}

/// `RmResource` for a type embedding a [`GpuResourceBase`] in `$field`.
macro_rules! impl_rm_resource {
    ($ty:ty, $field:ident) => {
        impl $crate::resource::RmResource for $ty {
            fn rm_base(&self) -> &$crate::resource::RmResourceBase {
                self.$field.rm()
            }

            fn rm_base_mut(&mut self) -> &mut $crate::resource::RmResourceBase {
                self.$field.rm_mut()
            }
        }
    };
}

pub mod base;
pub mod channel_group;
mod client;
pub mod ctxshare;
mod device;
pub(crate) mod gpu;
mod memory;

pub use base::{GpuResourceBase, Layers, Mapping, ResourceBase, RmResourceBase};
pub use channel_group::{ChannelGroupApi, KernelChannelGroup};
pub use client::ClientResource;
pub use ctxshare::{ContextShareApi, ContextShareRecord};
pub use device::{DeviceApi, SubdeviceApi};
pub use memory::{MemoryApi, MemoryKind, VaSpaceApi};

use core::any::Any;

use rm_cap::objects::{GpuIdentity, ScheduleState};
use rm_cap::share::{ShareRequest, default_share_allowed};
use rm_cap::{ClientInfo, Handle, Interface, ResourceClass, RmError, RmResult};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::env::ServerEnv;
use crate::hal::AddressSpace;

/// A server-side resource.
pub trait Resource: Any + Send {
    /// Class of the resource.
    fn class(&self) -> ResourceClass;

    /// Innermost layer.
    fn base(&self) -> &ResourceBase;

    /// Innermost layer, mutably.
    fn base_mut(&mut self) -> &mut ResourceBase;

    /// Upcast for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// `RmResource` view.
    fn as_rm(&self) -> Option<&dyn RmResource> {
        None
    }

    /// `RmResource` view, mutably.
    fn as_rm_mut(&mut self) -> Option<&mut dyn RmResource> {
        None
    }

    /// `GpuResource` view.
    fn as_gpu(&self) -> Option<&dyn GpuResource> {
        None
    }

    /// `GpuResource` view, mutably.
    fn as_gpu_mut(&mut self) -> Option<&mut dyn GpuResource> {
        None
    }

    /// `Schedulable` view.
    fn as_schedulable(&self) -> Option<&dyn Schedulable> {
        None
    }

    /// `Shareable` view.
    fn as_shareable(&self) -> Option<&dyn Shareable> {
        None
    }

    /// Tear down, outermost layer first. Idempotent per layer.
    fn destruct(&mut self, env: &ServerEnv);
}

/// Ownership and sharing.
pub trait RmResource {
    /// Resource-manager layer.
    fn rm_base(&self) -> &RmResourceBase;

    /// Resource-manager layer, mutably.
    fn rm_base_mut(&mut self) -> &mut RmResourceBase;

    /// Decide whether another client may access this resource.
    ///
    /// Stored policies decide first; otherwise the restrictive default.
    fn share_callback(&self, req: &ShareRequest<'_>) -> bool {
        self.rm_base()
            .share_policies()
            .evaluate(req)
            .unwrap_or_else(|| default_share_allowed(req))
    }
}

/// GPU binding.
pub trait GpuResource: RmResource {
    /// GPU layer.
    fn gpu_base(&self) -> &GpuResourceBase;

    /// GPU layer, mutably.
    fn gpu_base_mut(&mut self) -> &mut GpuResourceBase;

    /// GPU identity fixed at construction.
    fn identity(&self) -> GpuIdentity {
        self.gpu_base().identity()
    }

    /// Address space and size a CPU mapping of this resource targets, if
    /// it can be mapped.
    fn map_region(&self, _env: &ServerEnv) -> Option<(AddressSpace, u64)> {
        None
    }

    /// Register window `(base, size)` of the resource.
    ///
    /// # Errors
    ///
    /// `NotSupported` for resources without one.
    fn reg_window(&self, _env: &ServerEnv) -> RmResult<(u64, u64)> {
        Err(RmError::NotSupported)
    }
}

/// Runlist membership.
pub trait Schedulable {
    /// TSG id; `None` once torn down.
    fn tsg_id(&self) -> Option<u32>;

    /// Scheduling state.
    fn schedule_state(&self) -> ScheduleState;
}

/// Context handed to [`Shareable::copy_construct`].
pub struct DupContext<'a> {
    /// Naming of the new handle.
    pub base: ResourceBase,
    /// Identity of the destination client.
    pub owner: ClientInfo,
    /// Destination parent.
    pub parent: &'a dyn Resource,
}

/// Duplication into other clients.
pub trait Shareable {
    /// Whether the resource may be duplicated at all.
    fn can_copy(&self) -> bool {
        true
    }

    /// Handles sharing the backing state.
    fn shared_handles(&self) -> usize;

    /// Check a destination parent beyond the class parent rule.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the parent is unsuitable.
    fn validate_dup_parent(&self, _parent: &dyn Resource) -> RmResult<()> {
        Ok(())
    }

    /// Build a new handle sharing this resource's backing state.
    ///
    /// # Errors
    ///
    /// Class-specific.
    fn copy_construct(&self, ctx: DupContext<'_>) -> RmResult<Box<dyn Resource>>;
}

/// Compile-time interface selector for [`cast`].
pub trait Capability {
    /// Interface selected.
    const INTERFACE: Interface;

    /// View type.
    type View<'a>: ?Sized + 'a;

    /// Produce the view if the concrete type offers one.
    fn view<'a>(res: &'a dyn Resource) -> Option<&'a Self::View<'a>>;
}

/// Selects [`Resource`].
pub struct AsResource;

/// Selects [`RmResource`].
pub struct AsRmResource;

/// Selects [`GpuResource`].
pub struct AsGpuResource;

/// Selects [`Schedulable`].
pub struct AsSchedulable;

/// Selects [`Shareable`].
pub struct AsShareable;

impl Capability for AsResource {
    const INTERFACE: Interface = Interface::Resource;
    type View<'a> = dyn Resource;

    fn view<'a>(res: &'a dyn Resource) -> Option<&'a Self::View<'a>> {
        Some(res)
    }
}

impl Capability for AsRmResource {
    const INTERFACE: Interface = Interface::RmResource;
    type View<'a> = dyn RmResource + 'a;

    fn view<'a>(res: &'a dyn Resource) -> Option<&'a Self::View<'a>> {
        res.as_rm()
    }
}

impl Capability for AsGpuResource {
    const INTERFACE: Interface = Interface::GpuResource;
    type View<'a> = dyn GpuResource + 'a;

    fn view<'a>(res: &'a dyn Resource) -> Option<&'a Self::View<'a>> {
        res.as_gpu()
    }
}

impl Capability for AsSchedulable {
    const INTERFACE: Interface = Interface::Schedulable;
    type View<'a> = dyn Schedulable + 'a;

    fn view<'a>(res: &'a dyn Resource) -> Option<&'a Self::View<'a>> {
        res.as_schedulable()
    }
}

impl Capability for AsShareable {
    const INTERFACE: Interface = Interface::Shareable;
    type View<'a> = dyn Shareable + 'a;

    fn view<'a>(res: &'a dyn Resource) -> Option<&'a Self::View<'a>> {
        res.as_shareable()
    }
}

/// View a resource through an interface.
///
/// `None` if the class does not declare the interface.
#[must_use]
pub fn cast<'a, C: Capability>(res: &'a dyn Resource) -> Option<&'a C::View<'a>> {
    if !res.class().interfaces().contains(C::INTERFACE) {
        return None;
    }
    C::view(res)
}

/// Check whether the concrete type offers a view for `iface`, regardless of
/// its declared set.
#[must_use]
pub fn has_view(res: &dyn Resource, iface: Interface) -> bool {
    match iface {
        Interface::Resource => true,
        Interface::RmResource => res.as_rm().is_some(),
        Interface::GpuResource => res.as_gpu().is_some(),
        Interface::Schedulable => res.as_schedulable().is_some(),
        Interface::Shareable => res.as_shareable().is_some(),
    }
}

/// Checked downcast to a concrete type.
#[must_use]
pub fn downcast_ref<T: Resource>(res: &dyn Resource) -> Option<&T> {
    res.as_any().downcast_ref::<T>()
}

/// Context handed to resource constructors.
pub struct AllocContext<'a> {
    /// Server environment.
    pub env: &'a ServerEnv,
    /// Naming of the new resource.
    pub base: ResourceBase,
    /// Identity of the owning client.
    pub owner: ClientInfo,
    /// Parent resource.
    pub parent: &'a dyn Resource,
    /// Class of a handle in the owning client, for parameter validation.
    pub lookup: &'a dyn Fn(Handle) -> Option<ResourceClass>,
}

impl AllocContext<'_> {
    /// GPU identity of the parent.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the parent is not a GPU resource.
    pub fn parent_identity(&self) -> RmResult<GpuIdentity> {
        self.parent
            .as_gpu()
            .map(|gpu| gpu.identity())
            .ok_or(RmError::InvalidArgument)
    }

    /// Check that `handle` names a resource of `class` in the owning client.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` otherwise.
    pub fn expect_class(&self, handle: Handle, class: ResourceClass) -> RmResult<()> {
        match (self.lookup)(handle) {
            Some(found) if found == class => Ok(()),
            _ => Err(RmError::InvalidArgument),
        }
    }
}

/// Decode allocation parameters; an empty blob means all defaults.
pub(crate) fn alloc_params<T: FromBytes + Default>(params: &[u8]) -> RmResult<T> {
    if params.is_empty() {
        return Ok(T::default());
    }
    rm_ctrl::decode(params)
}

/// Write in/out allocation parameters back, unless none were passed.
pub(crate) fn write_alloc_params<T: IntoBytes + Immutable>(
    value: &T,
    params: &mut [u8],
) -> RmResult<()> {
    if params.is_empty() {
        return Ok(());
    }
    rm_ctrl::encode(value, params)
}

/// Construct a resource of `class`.
///
/// # Errors
///
/// - `InvalidArgument` for malformed parameters or a client class
/// - Class-specific constructor errors
pub fn construct(
    class: ResourceClass,
    ctx: AllocContext<'_>,
    params: &mut [u8],
) -> RmResult<Box<dyn Resource>> {
    use rm_cap::objects::{LocalMemory, SystemMemory};

    match class {
        ResourceClass::Client => Err(RmError::InvalidArgument),
        ResourceClass::Device => Ok(Box::new(DeviceApi::construct(ctx, params)?)),
        ResourceClass::Subdevice => Ok(Box::new(SubdeviceApi::construct(ctx, params)?)),
        ResourceClass::SystemMemory => {
            Ok(Box::new(MemoryApi::<SystemMemory>::construct(ctx, params)?))
        }
        ResourceClass::LocalMemory => {
            Ok(Box::new(MemoryApi::<LocalMemory>::construct(ctx, params)?))
        }
        ResourceClass::VaSpace => Ok(Box::new(VaSpaceApi::construct(ctx, params)?)),
        ResourceClass::ChannelGroup => Ok(Box::new(ChannelGroupApi::construct(ctx, params)?)),
        ResourceClass::ContextShare => Ok(Box::new(ContextShareApi::construct(ctx, params)?)),
    }
}
