//! Control command ids
//!
//! Command ids are stable and bit-exact:
//!
//! ```text
//!  31            16 15      8 7       0
//! ┌────────────────┬─────────┬─────────┐
//! │   class id     │category │  index  │
//! └────────────────┴─────────┴─────────┘
//! ```
//!
//! The class field names the interface that owns the command (0x0000 for
//! commands every resource exports, 0x0090 for graphics-context commands,
//! 0xA06C for channel groups, 0x9067 for context shares). Category 0x02
//! commands on channel groups are the internal variants.

use core::fmt;
use core::mem::size_of;

use rm_cap::AccessRights;

use crate::params::{
    BindParams, ChannelGroupInfoParams, CwdWatermarkParams, GpfifoScheduleParams,
    GpuIdentityParams, InterleaveLevelParams, LgSectorPromotionParams, MakeRealtimeParams,
    MmuDebugModeParams, PreemptParams, PromoteFaultMethodBuffersParams, TimesliceParams, TpcPartitionModeParams,
    TpcPartitionTableParams, VidmemPromoteParams,
};

/// Dispatch flags attached to a command.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(transparent)]
pub struct CtrlFlags(u8);

impl CtrlFlags {
    /// Any client may issue the command.
    pub const NONE: Self = Self(0);
    /// Admin or kernel privilege required.
    pub const PRIVILEGED: Self = Self(1 << 0);
    /// Trusted internal callers only.
    pub const INTERNAL: Self = Self(1 << 1);
    /// Serialize against topology changes with the GPU lock.
    pub const GPU_LOCK: Self = Self(1 << 2);
    /// Forward to the internal variant when routing to physical.
    pub const ROUTE_TO_PHYSICAL: Self = Self(1 << 3);

    /// Check if these flags contain all the specified flags.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Union flags.
    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl fmt::Debug for CtrlFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_set();
        for (flag, name) in [
            (Self::PRIVILEGED, "Privileged"),
            (Self::INTERNAL, "Internal"),
            (Self::GPU_LOCK, "GpuLock"),
            (Self::ROUTE_TO_PHYSICAL, "RouteToPhysical"),
        ] {
            if self.contains(flag) {
                list.entry(&name);
            }
        }
        list.finish()
    }
}

impl core::ops::BitOr for CtrlFlags {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

/// Static metadata of one command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CtrlInfo {
    /// Exact parameter blob size.
    pub param_size: usize,
    /// Dispatch flags.
    pub flags: CtrlFlags,
    /// Handle rights the caller must hold.
    pub rights: AccessRights,
}

impl CtrlInfo {
    const fn new(param_size: usize, flags: CtrlFlags, rights: AccessRights) -> Self {
        Self {
            param_size,
            flags,
            rights,
        }
    }
}

/// Control commands.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CtrlCmd {
    // === Every resource ===
    /// No-op.
    Null = 0x0000_0000,
    /// Report the GPU identity of a GPU resource.
    GetGpuIdentity = 0x0000_0101,

    // === Graphics context (exported by channel groups) ===
    /// Set TPC partition mode.
    SetTpcPartitionMode = 0x0090_0101,
    /// Get TPC partition mode.
    GetTpcPartitionMode = 0x0090_0103,
    /// Report whether the MMU is in debug mode.
    GetMmuDebugMode = 0x0090_0105,
    /// Program vidmem promotion through the graphics context.
    GrProgramVidmemPromote = 0x0090_0107,
    /// Set large-sector promotion.
    SetLgSectorPromotion = 0x0090_010B,

    // === Channel group ===
    /// Schedule or unschedule the group.
    GpfifoSchedule = 0xA06C_0101,
    /// Bind the group to its runlist entry.
    Bind = 0xA06C_0102,
    /// Set the timeslice.
    SetTimeslice = 0xA06C_0103,
    /// Get the timeslice.
    GetTimeslice = 0xA06C_0104,
    /// Preempt the group.
    Preempt = 0xA06C_0105,
    /// Get the TSG id.
    GetInfo = 0xA06C_0106,
    /// Set the runlist interleave level.
    SetInterleaveLevel = 0xA06C_0107,
    /// Program vidmem promotion.
    ProgramVidmemPromote = 0xA06C_0109,
    /// Materialize fault method buffers.
    InternalPromoteFaultMethodBuffers = 0xA06C_010A,
    /// Make the group realtime.
    MakeRealtime = 0xA06C_0110,
    /// Internal variant of `GpfifoSchedule`.
    InternalGpfifoSchedule = 0xA06C_0201,
    /// Internal variant of `SetTimeslice`.
    InternalSetTimeslice = 0xA06C_0202,

    // === Context share ===
    /// Replace the TPC partition table.
    SetTpcPartitionTable = 0x9067_0102,
    /// Get the CWD watermark.
    GetCwdWatermark = 0x9067_0201,
    /// Set the CWD watermark.
    SetCwdWatermark = 0x9067_0202,
}

impl CtrlCmd {
    /// Convert from a raw command id.
    #[must_use]
    pub const fn from_id(id: u32) -> Option<Self> {
        match id {
            0x0000_0000 => Some(Self::Null),
            0x0000_0101 => Some(Self::GetGpuIdentity),
            0x0090_0101 => Some(Self::SetTpcPartitionMode),
            0x0090_0103 => Some(Self::GetTpcPartitionMode),
            0x0090_0105 => Some(Self::GetMmuDebugMode),
            0x0090_0107 => Some(Self::GrProgramVidmemPromote),
            0x0090_010B => Some(Self::SetLgSectorPromotion),
            0xA06C_0101 => Some(Self::GpfifoSchedule),
            0xA06C_0102 => Some(Self::Bind),
            0xA06C_0103 => Some(Self::SetTimeslice),
            0xA06C_0104 => Some(Self::GetTimeslice),
            0xA06C_0105 => Some(Self::Preempt),
            0xA06C_0106 => Some(Self::GetInfo),
            0xA06C_0107 => Some(Self::SetInterleaveLevel),
            0xA06C_0109 => Some(Self::ProgramVidmemPromote),
            0xA06C_010A => Some(Self::InternalPromoteFaultMethodBuffers),
            0xA06C_0110 => Some(Self::MakeRealtime),
            0xA06C_0201 => Some(Self::InternalGpfifoSchedule),
            0xA06C_0202 => Some(Self::InternalSetTimeslice),
            0x9067_0102 => Some(Self::SetTpcPartitionTable),
            0x9067_0201 => Some(Self::GetCwdWatermark),
            0x9067_0202 => Some(Self::SetCwdWatermark),
            _ => None,
        }
    }

    /// Get the raw command id.
    #[inline]
    #[must_use]
    pub const fn id(self) -> u32 {
        self as u32
    }

    /// Class field of the id.
    #[inline]
    #[must_use]
    pub const fn class_id(self) -> u32 {
        self.id() >> 16
    }

    /// Category field of the id.
    #[inline]
    #[must_use]
    pub const fn category(self) -> u8 {
        (self.id() >> 8) as u8
    }

    /// Get the command name for logging.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::GetGpuIdentity => "GET_GPU_IDENTITY",
            Self::SetTpcPartitionMode => "SET_TPC_PARTITION_MODE",
            Self::GetTpcPartitionMode => "GET_TPC_PARTITION_MODE",
            Self::GetMmuDebugMode => "GET_MMU_DEBUG_MODE",
            Self::GrProgramVidmemPromote => "GR_PROGRAM_VIDMEM_PROMOTE",
            Self::SetLgSectorPromotion => "SET_LG_SECTOR_PROMOTION",
            Self::GpfifoSchedule => "GPFIFO_SCHEDULE",
            Self::Bind => "BIND",
            Self::SetTimeslice => "SET_TIMESLICE",
            Self::GetTimeslice => "GET_TIMESLICE",
            Self::Preempt => "PREEMPT",
            Self::GetInfo => "GET_INFO",
            Self::SetInterleaveLevel => "SET_INTERLEAVE_LEVEL",
            Self::ProgramVidmemPromote => "PROGRAM_VIDMEM_PROMOTE",
            Self::InternalPromoteFaultMethodBuffers => "INTERNAL_PROMOTE_FAULT_METHOD_BUFFERS",
            Self::MakeRealtime => "MAKE_REALTIME",
            Self::InternalGpfifoSchedule => "INTERNAL_GPFIFO_SCHEDULE",
            Self::InternalSetTimeslice => "INTERNAL_SET_TIMESLICE",
            Self::SetTpcPartitionTable => "SET_TPC_PARTITION_TABLE",
            Self::GetCwdWatermark => "GET_CWD_WATERMARK",
            Self::SetCwdWatermark => "SET_CWD_WATERMARK",
        }
    }

    /// Static metadata of the command.
    #[must_use]
    pub const fn info(self) -> CtrlInfo {
        const R: AccessRights = AccessRights::READ;
        const W: AccessRights = AccessRights::WRITE;
        const N: AccessRights = AccessRights::NICE;
        const NONE: CtrlFlags = CtrlFlags::NONE;
        const LOCK: CtrlFlags = CtrlFlags::GPU_LOCK;
        const INTERNAL: CtrlFlags = CtrlFlags::INTERNAL;
        const ADMIN: CtrlFlags = CtrlFlags::PRIVILEGED.union(CtrlFlags::GPU_LOCK);
        const ROUTED: CtrlFlags = CtrlFlags::GPU_LOCK.union(CtrlFlags::ROUTE_TO_PHYSICAL);
        const INTERNAL_LOCK: CtrlFlags = CtrlFlags::INTERNAL.union(CtrlFlags::GPU_LOCK);

        match self {
            Self::Null => CtrlInfo::new(0, NONE, AccessRights::NONE),
            Self::GetGpuIdentity => CtrlInfo::new(size_of::<GpuIdentityParams>(), NONE, R),
            Self::SetTpcPartitionMode => CtrlInfo::new(size_of::<TpcPartitionModeParams>(), LOCK, W),
            Self::GetTpcPartitionMode => CtrlInfo::new(size_of::<TpcPartitionModeParams>(), NONE, R),
            Self::GetMmuDebugMode => CtrlInfo::new(size_of::<MmuDebugModeParams>(), NONE, R),
            Self::SetLgSectorPromotion => {
                CtrlInfo::new(size_of::<LgSectorPromotionParams>(), LOCK, W)
            }
            Self::GrProgramVidmemPromote | Self::ProgramVidmemPromote => {
                CtrlInfo::new(size_of::<VidmemPromoteParams>(), INTERNAL, W)
            }
            Self::GpfifoSchedule => CtrlInfo::new(size_of::<GpfifoScheduleParams>(), ROUTED, W),
            Self::Bind => CtrlInfo::new(size_of::<BindParams>(), LOCK, W),
            Self::SetTimeslice => CtrlInfo::new(size_of::<TimesliceParams>(), ROUTED, W),
            Self::GetTimeslice => CtrlInfo::new(size_of::<TimesliceParams>(), NONE, R),
            Self::Preempt => CtrlInfo::new(size_of::<PreemptParams>(), LOCK, W),
            Self::GetInfo => CtrlInfo::new(size_of::<ChannelGroupInfoParams>(), NONE, R),
            Self::SetInterleaveLevel => CtrlInfo::new(size_of::<InterleaveLevelParams>(), ADMIN, N),
            Self::InternalPromoteFaultMethodBuffers => {
                CtrlInfo::new(size_of::<PromoteFaultMethodBuffersParams>(), INTERNAL, W)
            }
            Self::MakeRealtime => CtrlInfo::new(size_of::<MakeRealtimeParams>(), ADMIN, N),
            Self::InternalGpfifoSchedule => {
                CtrlInfo::new(size_of::<GpfifoScheduleParams>(), INTERNAL_LOCK, W)
            }
            Self::InternalSetTimeslice => {
                CtrlInfo::new(size_of::<TimesliceParams>(), INTERNAL_LOCK, W)
            }
            Self::SetTpcPartitionTable => {
                CtrlInfo::new(size_of::<TpcPartitionTableParams>(), LOCK, W)
            }
            Self::GetCwdWatermark => CtrlInfo::new(size_of::<CwdWatermarkParams>(), NONE, R),
            Self::SetCwdWatermark => CtrlInfo::new(size_of::<CwdWatermarkParams>(), LOCK, W),
        }
    }

    /// Internal variant a public command forwards to when routing to
    /// physical.
    #[must_use]
    pub const fn internal_variant(self) -> Option<Self> {
        match self {
            Self::GpfifoSchedule => Some(Self::InternalGpfifoSchedule),
            Self::SetTimeslice => Some(Self::InternalSetTimeslice),
            _ => None,
        }
    }
}

impl fmt::Display for CtrlCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#010x})", self.name(), self.id())
    }
}
