//! Control-call parameter layouts
//!
//! Every command has one fixed-size, padding-free `#[repr(C)]` parameter
//! struct. The dispatcher rejects a blob whose length differs from
//! `size_of` the struct before any handler runs; handlers then decode with
//! [`decode`] and write outputs back with [`encode`].

use core::mem::size_of;

use rm_cap::{RmError, RmResult};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Decode a parameter struct from a blob of exactly its size.
///
/// # Errors
///
/// `InvalidArgument` if the blob length does not match.
pub fn decode<T: FromBytes>(blob: &[u8]) -> RmResult<T> {
    T::read_from_bytes(blob).map_err(|_| RmError::InvalidArgument)
}

/// Write a parameter struct back over its blob.
///
/// # Errors
///
/// `InvalidArgument` if the blob length does not match.
pub fn encode<T: IntoBytes + Immutable>(params: &T, blob: &mut [u8]) -> RmResult<()> {
    params.write_to(blob).map_err(|_| RmError::InvalidArgument)
}

/// Encode a boolean the way the wire does.
#[inline]
#[must_use]
pub const fn nv_bool(value: bool) -> u8 {
    value as u8
}

// -- Generic resource commands

/// `GET_GPU_IDENTITY` output.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct GpuIdentityParams {
    /// Instance of the (first) GPU.
    pub gpu_instance: u32,
    /// Mask of GPU instances in the broadcast group.
    pub gpu_mask: u32,
    /// Device instance.
    pub device_instance: u32,
    /// Subdevice instance.
    pub subdevice_instance: u32,
    /// Non-zero for broadcast resources.
    pub bc_resource: u32,
}

// -- Graphics context commands exported by channel groups

/// `SET/GET_TPC_PARTITION_MODE`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TpcPartitionModeParams {
    /// 0 = none, 1 = static, 2 = dynamic.
    pub mode: u32,
    /// Enable all TPCs (no per-subcontext masking).
    pub enable_all_tpcs: u8,
    /// Reserved.
    pub _pad: [u8; 3],
}

/// `PROGRAM_VIDMEM_PROMOTE`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct VidmemPromoteParams {
    /// L1 promotion: 0 = none, 1 = 64B, 2 = 128B.
    pub l1: u32,
    /// T1 promotion: 0 = none, 1 = 64B, 2 = 128B.
    pub t1: u32,
}

/// `GET_MMU_DEBUG_MODE`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MmuDebugModeParams {
    /// Non-zero if the MMU is in debug mode.
    pub mode: u8,
}

/// `SET_LG_SECTOR_PROMOTION`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct LgSectorPromotionParams {
    /// 0 = none, 1 = 64 bytes, 2 = 128 bytes.
    pub promotion: u32,
}

// -- Channel group commands

/// `GPFIFO_SCHEDULE` and `INTERNAL_GPFIFO_SCHEDULE`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct GpfifoScheduleParams {
    /// Schedule (non-zero) or unschedule (zero).
    pub enable: u8,
    /// Update bookkeeping without submitting the runlist.
    pub skip_submit: u8,
    /// Submit the runlist without enabling the channels.
    pub skip_enable: u8,
}

/// `BIND`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct BindParams {
    /// Engine type the group is bound to; must match the allocation.
    pub engine_type: u32,
}

/// `SET_TIMESLICE`, `GET_TIMESLICE` and `INTERNAL_SET_TIMESLICE`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TimesliceParams {
    /// Requested slice on input, effective slice on output.
    pub timeslice_us: u64,
}

/// `PREEMPT`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PreemptParams {
    /// Wait for the hardware acknowledgment.
    pub wait: u8,
    /// Use `timeout_us` instead of the server default.
    pub manual_timeout: u8,
    /// Reserved.
    pub _pad: [u8; 2],
    /// Acknowledgment timeout when `manual_timeout` is set.
    pub timeout_us: u32,
}

/// `GET_INFO`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ChannelGroupInfoParams {
    /// Runlist-unique group id.
    pub tsg_id: u32,
}

/// `SET_INTERLEAVE_LEVEL`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct InterleaveLevelParams {
    /// 0 = low, 1 = medium, 2 = high.
    pub tsg_interleave_level: u32,
}

/// `MAKE_REALTIME`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MakeRealtimeParams {
    /// Must be non-zero.
    pub realtime: u8,
}

/// Maximum run queues in a fault method buffer promotion.
pub const MAX_RUNQUEUES: usize = 2;

/// One fault method buffer descriptor.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MethodBufferDesc {
    /// Physical base.
    pub base: u64,
    /// Size in bytes.
    pub size: u64,
    /// Alignment in bytes.
    pub alignment: u64,
    /// 1 = sysmem, 2 = vidmem.
    pub address_space: u32,
    /// CPU cache attribute.
    pub cpu_cache_attrib: u32,
}

/// `INTERNAL_PROMOTE_FAULT_METHOD_BUFFERS`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PromoteFaultMethodBuffersParams {
    /// Buffers, one per run queue.
    pub method_buffer: [MethodBufferDesc; MAX_RUNQUEUES],
    /// BAR2 addresses of the buffers.
    pub bar2_addr: [u64; MAX_RUNQUEUES],
    /// Number of valid entries.
    pub num_valid_entries: u32,
    /// Reserved.
    pub _pad: u32,
}

// -- Context share commands

/// Maximum entries in a TPC partition table.
pub const MAX_TPC_ENTRIES: usize = rm_cap::objects::MAX_TPC_PARTITION_ENTRIES;

/// One TPC partition table entry.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TpcInfo {
    /// GPU-wide TPC index.
    pub global_tpc_index: u16,
    /// Local-memory block index; zero in dynamic mode.
    pub lmem_block_index: u16,
}

/// `SET_TPC_PARTITION_TABLE`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TpcPartitionTableParams {
    /// Number of valid entries in `tpc_list`.
    pub num_used_tpc: u32,
    /// Table entries.
    pub tpc_list: [TpcInfo; MAX_TPC_ENTRIES],
}

/// `GET/SET_CWD_WATERMARK`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CwdWatermarkParams {
    /// Watermark value.
    pub watermark_value: u32,
}

const _: () = {
    assert!(size_of::<GpuIdentityParams>() == 20);
    assert!(size_of::<TpcPartitionModeParams>() == 8);
    assert!(size_of::<MmuDebugModeParams>() == 1);
    assert!(size_of::<LgSectorPromotionParams>() == 4);
    assert!(size_of::<GpfifoScheduleParams>() == 3);
    assert!(size_of::<PreemptParams>() == 8);
    assert!(size_of::<PromoteFaultMethodBuffersParams>() == 88);
    assert!(size_of::<TpcPartitionTableParams>() == 1028);
};
