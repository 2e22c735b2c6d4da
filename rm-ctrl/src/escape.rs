//! Escape entry point layouts
//!
//! The host device layer hands the server `(escape command, blob)`. Each
//! blob starts with a fixed header; ALLOC and CONTROL headers are followed
//! by `params_size` inline parameter bytes. The server writes `status` and
//! any outputs back into the same blob.
//!
//! ```text
//! ┌──────────────┬──────────────────────┐
//! │ header       │ params (params_size) │
//! └──────────────┴──────────────────────┘
//! ```

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Escape commands.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EscapeCmd {
    /// Free a resource (or a client).
    Free = 0x29,
    /// Control call.
    Control = 0x2A,
    /// Allocate a resource (or a client).
    Alloc = 0x2B,
    /// Duplicate a handle into another client.
    DupObject = 0x34,
    /// Add or revoke a share policy.
    Share = 0x35,
    /// Map memory into the CPU address space.
    MapMemory = 0x4E,
    /// Unmap memory.
    UnmapMemory = 0x4F,
}

impl EscapeCmd {
    /// Convert from a raw escape number.
    #[must_use]
    pub const fn from_number(num: u32) -> Option<Self> {
        match num {
            0x29 => Some(Self::Free),
            0x2A => Some(Self::Control),
            0x2B => Some(Self::Alloc),
            0x34 => Some(Self::DupObject),
            0x35 => Some(Self::Share),
            0x4E => Some(Self::MapMemory),
            0x4F => Some(Self::UnmapMemory),
            _ => None,
        }
    }

    /// Get the escape name for logging.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Free => "Free",
            Self::Control => "Control",
            Self::Alloc => "Alloc",
            Self::DupObject => "DupObject",
            Self::Share => "Share",
            Self::MapMemory => "MapMemory",
            Self::UnmapMemory => "UnmapMemory",
        }
    }
}

/// ALLOC header.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct AllocHeader {
    /// Owning client; out for client allocation.
    pub h_client: u32,
    /// Parent handle.
    pub h_parent: u32,
    /// Requested handle (zero to let the server pick); out: assigned.
    pub h_object: u32,
    /// Class id.
    pub h_class: u32,
    /// Length of the inline parameters.
    pub params_size: u32,
    /// Out: status.
    pub status: u32,
}

/// FREE header.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct FreeHeader {
    /// Owning client.
    pub h_client: u32,
    /// Parent handle (informational).
    pub h_parent: u32,
    /// Handle to free; the client handle frees the client.
    pub h_object: u32,
    /// Out: status.
    pub status: u32,
}

/// CONTROL header.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ControlHeader {
    /// Owning client.
    pub h_client: u32,
    /// Target resource.
    pub h_object: u32,
    /// Command id.
    pub cmd: u32,
    /// Reserved.
    pub flags: u32,
    /// Length of the inline parameters.
    pub params_size: u32,
    /// Out: status.
    pub status: u32,
}

/// DUP_OBJECT header.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DupHeader {
    /// Destination client.
    pub h_client: u32,
    /// Destination parent.
    pub h_parent: u32,
    /// Requested destination handle; out: assigned.
    pub h_object: u32,
    /// Source client.
    pub h_client_src: u32,
    /// Source handle.
    pub h_object_src: u32,
    /// Dup flags.
    pub flags: u32,
    /// Out: status.
    pub status: u32,
}

impl DupHeader {
    /// Evaluate share policy even for a kernel-privileged destination.
    pub const FLAG_REJECT_KERNEL_DUP_PRIVILEGE: u32 = 1 << 0;
}

/// SHARE header.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ShareHeader {
    /// Owning client.
    pub h_client: u32,
    /// Resource to share.
    pub h_object: u32,
    /// Share type.
    pub share_type: u16,
    /// Share action.
    pub action: u16,
    /// Type-specific target.
    pub target: u32,
    /// Access mask the policy covers.
    pub access_mask: u32,
    /// Out: status.
    pub status: u32,
}

/// MAP_MEMORY header.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MapMemoryHeader {
    /// Owning client.
    pub h_client: u32,
    /// Device or subdevice the mapping is made through.
    pub h_device: u32,
    /// Resource to map.
    pub h_memory: u32,
    /// Reserved.
    pub _pad: u32,
    /// Offset into the resource.
    pub offset: u64,
    /// Length of the mapping.
    pub length: u64,
    /// Out: CPU address.
    pub cpu_address: u64,
    /// Reserved.
    pub flags: u32,
    /// Out: status.
    pub status: u32,
}

/// UNMAP_MEMORY header.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct UnmapMemoryHeader {
    /// Owning client.
    pub h_client: u32,
    /// Device or subdevice the mapping was made through.
    pub h_device: u32,
    /// Mapped resource.
    pub h_memory: u32,
    /// Out: status.
    pub status: u32,
    /// CPU address returned by MAP_MEMORY.
    pub cpu_address: u64,
}
