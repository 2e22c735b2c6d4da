//! Resource object kinds
//!
//! This module defines the resource kinds a client can allocate. It uses
//! the sealed trait pattern so that only server-defined kinds exist, and
//! carries the pure (lock-free, hardware-free) state of the kinds that
//! have one.
//!
//! # Kinds
//!
//! ## Root
//! - [`Client`]: Per-process root of the ownership tree
//!
//! ## Device
//! - [`Device`]: A GPU device, broadcast across its subdevices
//! - [`Subdevice`]: One physical GPU; owns the register window
//!
//! ## Memory
//! - [`SystemMemory`], [`LocalMemory`]: Mappable allocations
//! - [`VaSpace`]: GPU virtual address space
//!
//! ## Scheduling
//! - [`ChannelGroup`]: A TSG, the runlist's unit of scheduling
//! - [`ContextShare`]: A subcontext inside a channel group

pub mod channel_group;
pub mod ctxshare;
pub mod gpu;

pub use channel_group::{
    ChannelGroupState, EngineType, InterleaveLevel, MAX_RUNQUEUES, MethodBuffer, Microseconds,
    PromoteSize, ScheduleState, TimesliceBounds, TpcPartitionMode, VidmemPromote,
};
pub use ctxshare::{
    CwdWatermark, MAX_TPC_PARTITION_ENTRIES, SubctxFlags, TpcPartitionEntry, TpcPartitionTable,
};
pub use gpu::GpuIdentity;

use crate::{AccessRights, InterfaceSet, ResourceClass};

/// Marker trait for resource kinds.
///
/// Sealed to prevent external implementations.
///
/// # Associated Constants
///
/// - `NAME`: Human-readable name for debugging and logging
/// - `CLASS`: Class id clients allocate with
/// - `INTERFACES`: Declared capability set
/// - `DEFAULT_RIGHTS`: Rights of a freshly allocated handle
pub trait ResourceKind: private::Sealed + Copy + Clone + 'static {
    /// Human-readable name for debugging and logging.
    const NAME: &'static str;

    /// Class id of the kind.
    const CLASS: ResourceClass;

    /// Interfaces a resource of this kind can be viewed through.
    const INTERFACES: InterfaceSet = Self::CLASS.interfaces();

    /// Default rights for handles of this kind.
    const DEFAULT_RIGHTS: AccessRights;
}

/// Sealed trait module to prevent external implementations.
mod private {
    pub trait Sealed {}
}

/// Client root.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Client;

impl private::Sealed for Client {}
impl ResourceKind for Client {
    const NAME: &'static str = "Client";
    const CLASS: ResourceClass = ResourceClass::Client;
    const DEFAULT_RIGHTS: AccessRights = AccessRights::RW;
}

/// GPU device.
///
/// Resources allocated under a device are broadcast resources: calls apply
/// to every subdevice of the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Device;

impl private::Sealed for Device {}
impl ResourceKind for Device {
    const NAME: &'static str = "Device";
    const CLASS: ResourceClass = ResourceClass::Device;
    const DEFAULT_RIGHTS: AccessRights = AccessRights::ALL;
}

/// One physical GPU within a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Subdevice;

impl private::Sealed for Subdevice {}
impl ResourceKind for Subdevice {
    const NAME: &'static str = "Subdevice";
    const CLASS: ResourceClass = ResourceClass::Subdevice;
    const DEFAULT_RIGHTS: AccessRights = AccessRights::ALL;
}

/// System memory allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SystemMemory;

impl private::Sealed for SystemMemory {}
impl ResourceKind for SystemMemory {
    const NAME: &'static str = "SystemMemory";
    const CLASS: ResourceClass = ResourceClass::SystemMemory;
    const DEFAULT_RIGHTS: AccessRights = AccessRights::ALL;
}

/// Video memory allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LocalMemory;

impl private::Sealed for LocalMemory {}
impl ResourceKind for LocalMemory {
    const NAME: &'static str = "LocalMemory";
    const CLASS: ResourceClass = ResourceClass::LocalMemory;
    const DEFAULT_RIGHTS: AccessRights = AccessRights::ALL;
}

/// GPU virtual address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VaSpace;

impl private::Sealed for VaSpace {}
impl ResourceKind for VaSpace {
    const NAME: &'static str = "VaSpace";
    const CLASS: ResourceClass = ResourceClass::VaSpace;
    const DEFAULT_RIGHTS: AccessRights = AccessRights::ALL;
}

/// Channel group (TSG).
///
/// The schedulable state is shared by every duplicate of the handle and
/// torn down, with a forced preempt, when the last one is freed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChannelGroup;

impl private::Sealed for ChannelGroup {}
impl ResourceKind for ChannelGroup {
    const NAME: &'static str = "ChannelGroup";
    const CLASS: ResourceClass = ResourceClass::ChannelGroup;
    const DEFAULT_RIGHTS: AccessRights = AccessRights::ALL;
}

/// Subcontext within a channel group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextShare;

impl private::Sealed for ContextShare {}
impl ResourceKind for ContextShare {
    const NAME: &'static str = "ContextShare";
    const CLASS: ResourceClass = ResourceClass::ContextShare;
    const DEFAULT_RIGHTS: AccessRights = AccessRights::ALL;
}
