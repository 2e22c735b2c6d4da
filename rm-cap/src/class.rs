//! Resource classes and interface sets
//!
//! A [`ResourceClass`] is the numeric class id a client passes to
//! allocation. Each class declares, as a constant, which interfaces it can
//! be viewed through and which parent classes may own it.

use core::fmt;

/// An interface (capability) a resource may implement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Interface {
    /// Generic resource: handle, parent, children, destruct.
    Resource = 0,
    /// Client-visible resource with access rights and share policies.
    RmResource = 1,
    /// Bound to a GPU/device/subdevice; mappable.
    GpuResource = 2,
    /// A runlist-scheduled unit.
    Schedulable = 3,
    /// May be duplicated into another client.
    Shareable = 4,
}

impl Interface {
    /// Get the interface name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Resource => "Resource",
            Self::RmResource => "RmResource",
            Self::GpuResource => "GpuResource",
            Self::Schedulable => "Schedulable",
            Self::Shareable => "Shareable",
        }
    }
}

/// A set of [`Interface`]s, packed one bit per interface.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(transparent)]
pub struct InterfaceSet(u8);

impl InterfaceSet {
    /// Empty set.
    pub const EMPTY: Self = Self(0);

    /// Interfaces every client-visible resource has.
    pub const RM: Self = Self::EMPTY
        .with(Interface::Resource)
        .with(Interface::RmResource);

    /// Interfaces every GPU-bound resource has.
    pub const GPU: Self = Self::RM.with(Interface::GpuResource);

    /// Add an interface.
    #[inline]
    #[must_use]
    pub const fn with(self, iface: Interface) -> Self {
        Self(self.0 | (1 << iface as u8))
    }

    /// Check membership.
    #[inline]
    #[must_use]
    pub const fn contains(self, iface: Interface) -> bool {
        (self.0 & (1 << iface as u8)) != 0
    }

    /// Get the raw bits.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }
}

impl fmt::Debug for InterfaceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const ALL: [Interface; 5] = [
            Interface::Resource,
            Interface::RmResource,
            Interface::GpuResource,
            Interface::Schedulable,
            Interface::Shareable,
        ];
        let mut list = f.debug_set();
        for iface in ALL {
            if self.contains(iface) {
                list.entry(&iface.name());
            }
        }
        list.finish()
    }
}

/// Allocatable resource classes.
///
/// Discriminants are the class ids clients pass to allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ResourceClass {
    /// Client root object.
    Client = 0x0000,
    /// System (sysmem) memory.
    SystemMemory = 0x003E,
    /// Local (vidmem) memory.
    LocalMemory = 0x0040,
    /// GPU device (broadcast across subdevices).
    Device = 0x0080,
    /// One physical GPU of a device.
    Subdevice = 0x2080,
    /// Subcontext within a channel group.
    ContextShare = 0x9067,
    /// GPU virtual address space.
    VaSpace = 0x90F1,
    /// Channel group (TSG).
    ChannelGroup = 0xA06C,
}

impl ResourceClass {
    /// Convert from a raw class id.
    #[must_use]
    pub const fn from_id(id: u32) -> Option<Self> {
        match id {
            0x0000 => Some(Self::Client),
            0x003E => Some(Self::SystemMemory),
            0x0040 => Some(Self::LocalMemory),
            0x0080 => Some(Self::Device),
            0x2080 => Some(Self::Subdevice),
            0x9067 => Some(Self::ContextShare),
            0x90F1 => Some(Self::VaSpace),
            0xA06C => Some(Self::ChannelGroup),
            _ => None,
        }
    }

    /// Get the raw class id.
    #[inline]
    #[must_use]
    pub const fn id(self) -> u32 {
        self as u32
    }

    /// Get the class name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Client => "Client",
            Self::SystemMemory => "SystemMemory",
            Self::LocalMemory => "LocalMemory",
            Self::Device => "Device",
            Self::Subdevice => "Subdevice",
            Self::ContextShare => "ContextShare",
            Self::VaSpace => "VaSpace",
            Self::ChannelGroup => "ChannelGroup",
        }
    }

    /// Declared interface set of the class.
    #[must_use]
    pub const fn interfaces(self) -> InterfaceSet {
        match self {
            Self::Client => InterfaceSet::RM,
            Self::Device | Self::Subdevice => InterfaceSet::GPU,
            Self::SystemMemory | Self::LocalMemory | Self::VaSpace | Self::ContextShare => {
                InterfaceSet::GPU.with(Interface::Shareable)
            }
            Self::ChannelGroup => InterfaceSet::GPU
                .with(Interface::Schedulable)
                .with(Interface::Shareable),
        }
    }

    /// Check whether a resource of class `parent` may own this class.
    #[must_use]
    pub const fn accepts_parent(self, parent: Self) -> bool {
        match self {
            Self::Client => false,
            Self::Device => matches!(parent, Self::Client),
            Self::Subdevice | Self::VaSpace => matches!(parent, Self::Device),
            Self::SystemMemory | Self::LocalMemory | Self::ChannelGroup => {
                matches!(parent, Self::Device | Self::Subdevice)
            }
            Self::ContextShare => matches!(parent, Self::ChannelGroup),
        }
    }

    /// Check whether the class is GPU-bound.
    #[inline]
    #[must_use]
    pub const fn is_gpu(self) -> bool {
        self.interfaces().contains(Interface::GpuResource)
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#06x})", self.name(), self.id())
    }
}
