//! Hardware collaborators
//!
//! The server never touches registers. Everything hardware-facing goes
//! through four traits:
//!
//! - [`Runlist`]: commit, preempt and remove runlist entries
//! - [`EngineRegisters`]: per-engine TPC, watermark and promotion state
//! - [`GpuResolver`]: device token to GPU identity
//! - [`Mapper`]: CPU mappings of GPU resources
//!
//! [`SimGpu`] implements all four in memory.

mod sim;

pub use sim::{PreemptBehavior, SimGpu};

use std::sync::Arc;

use rm_cap::RmResult;
use rm_cap::objects::{
    EngineType, GpuIdentity, InterleaveLevel, MethodBuffer, Microseconds, PromoteSize,
    TpcPartitionEntry, TpcPartitionMode, VidmemPromote,
};

/// One runlist entry as committed to hardware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunlistEntry<'a> {
    /// Group id.
    pub tsg_id: u32,
    /// Engine the runlist belongs to.
    pub engine: EngineType,
    /// Member channels, in order.
    pub channels: &'a [u32],
    /// Timeslice.
    pub timeslice_us: Microseconds,
    /// Runlist priority.
    pub interleave: InterleaveLevel,
    /// Realtime weighting.
    pub realtime: bool,
    /// Channels enabled for time-slicing.
    pub enabled: bool,
}

/// The hardware runlist.
pub trait Runlist: Send + Sync {
    /// Add or update a group's entry.
    fn commit(&self, gpu: &GpuIdentity, entry: &RunlistEntry<'_>) -> RmResult<()>;

    /// Drop a group's entry.
    fn remove(&self, gpu: &GpuIdentity, tsg_id: u32) -> RmResult<()>;

    /// Request a preempt of a group.
    fn preempt(&self, gpu: &GpuIdentity, tsg_id: u32) -> RmResult<()>;

    /// Check whether a requested preempt is still outstanding.
    fn preempt_pending(&self, gpu: &GpuIdentity, tsg_id: u32) -> bool;
}

/// Per-engine configuration registers.
pub trait EngineRegisters: Send + Sync {
    /// Program a subcontext's TPC partition table.
    fn program_tpc_table(
        &self,
        gpu: &GpuIdentity,
        tsg_id: u32,
        subctx_id: u32,
        entries: &[TpcPartitionEntry],
    ) -> RmResult<()>;

    /// Program a subcontext's CWD watermark.
    fn program_cwd_watermark(
        &self,
        gpu: &GpuIdentity,
        tsg_id: u32,
        subctx_id: u32,
        value: u32,
    ) -> RmResult<()>;

    /// Program a group's TPC partition mode.
    fn program_tpc_partition_mode(
        &self,
        gpu: &GpuIdentity,
        tsg_id: u32,
        mode: TpcPartitionMode,
        enable_all_tpcs: bool,
    ) -> RmResult<()>;

    /// Program vidmem compression promotion.
    fn program_vidmem_promote(
        &self,
        gpu: &GpuIdentity,
        tsg_id: u32,
        promote: VidmemPromote,
    ) -> RmResult<()>;

    /// Install fault method buffers.
    fn program_fault_method_buffers(
        &self,
        gpu: &GpuIdentity,
        tsg_id: u32,
        buffers: &[MethodBuffer],
    ) -> RmResult<()>;

    /// Program large-sector promotion.
    fn program_lg_sector_promotion(
        &self,
        gpu: &GpuIdentity,
        tsg_id: u32,
        promotion: PromoteSize,
    ) -> RmResult<()>;

    /// Read the MMU debug mode.
    fn mmu_debug_mode(&self, gpu: &GpuIdentity) -> RmResult<bool>;
}

/// Device token resolution.
pub trait GpuResolver: Send + Sync {
    /// Resolve a device token to the broadcast identity of the device.
    fn resolve(&self, device_token: u32) -> RmResult<GpuIdentity>;

    /// Number of subdevices in a device.
    fn subdevice_count(&self, device: &GpuIdentity) -> u32;

    /// Register window `(base, size)` of one GPU.
    fn register_window(&self, gpu: &GpuIdentity) -> (u64, u64);
}

/// Which memory a mapping targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressSpace {
    /// System memory.
    System,
    /// Video memory through the BAR.
    Video,
    /// GPU registers.
    Register,
}

/// CPU mapping of GPU resources.
pub trait Mapper: Send + Sync {
    /// Map `length` bytes at `offset` of a region; returns the CPU address.
    fn map(
        &self,
        gpu: &GpuIdentity,
        space: AddressSpace,
        offset: u64,
        length: u64,
    ) -> RmResult<u64>;

    /// Remove a mapping.
    fn unmap(&self, gpu: &GpuIdentity, cpu_address: u64, length: u64) -> RmResult<()>;
}

/// The set of collaborators a server runs against.
#[derive(Clone)]
pub struct Hal {
    /// Runlist.
    pub runlist: Arc<dyn Runlist>,
    /// Engine registers.
    pub regs: Arc<dyn EngineRegisters>,
    /// Device resolution.
    pub resolver: Arc<dyn GpuResolver>,
    /// CPU mappings.
    pub mapper: Arc<dyn Mapper>,
}

impl Hal {
    /// Run every collaborator against one simulated GPU.
    #[must_use]
    pub fn simulated(sim: &Arc<SimGpu>) -> Self {
        Self {
            runlist: sim.clone(),
            regs: sim.clone(),
            resolver: sim.clone(),
            mapper: sim.clone(),
        }
    }
}
