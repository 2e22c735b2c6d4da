//! Allocation parameter layouts
//!
//! Parameters a client passes when allocating a resource of each class.
//! Fields marked in/out are written back on success.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Device allocation.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DeviceAllocParams {
    /// Opaque device token resolved by the GPU resolver.
    pub device_id: u32,
    /// Reserved.
    pub flags: u32,
}

/// Subdevice allocation.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SubdeviceAllocParams {
    /// Subdevice index within the parent device.
    pub sub_device_id: u32,
}

/// VA space allocation.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct VaSpaceAllocParams {
    /// Reserved.
    pub flags: u32,
    /// Reserved.
    pub _pad: u32,
    /// Size of the address space; zero for the default.
    pub va_size: u64,
}

/// Memory (system or local) allocation.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MemoryAllocParams {
    /// Reserved.
    pub flags: u32,
    /// Reserved.
    pub _pad: u32,
    /// Size in bytes.
    pub size: u64,
}

/// Channel group allocation.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ChannelGroupAllocParams {
    /// VA space the group's channels run in; zero for none.
    pub h_va_space: u32,
    /// Engine type.
    pub engine_type: u32,
    /// Number of member channels.
    pub channel_count: u32,
    /// `LEGACY_MODE` and reserved bits.
    pub flags: u32,
}

impl ChannelGroupAllocParams {
    /// Run without subcontexts; the group owns internal sync/async ones.
    pub const FLAG_LEGACY_MODE: u32 = 1 << 0;
}

/// Context share allocation.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CtxShareAllocParams {
    /// VA space the subcontext uses.
    pub h_va_space: u32,
    /// 0 = sync, 1 = async, 2 = specified.
    pub flags: u32,
    /// In: requested id for `specified`. Out: assigned id.
    pub subctx_id: u32,
}
