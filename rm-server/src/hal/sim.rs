//! In-memory GPU
//!
//! Records everything the server asks of hardware so tests can check it,
//! and lets them choose how preempts behave.

use std::collections::BTreeMap;

use rm_cap::objects::{
    GpuIdentity, MethodBuffer, PromoteSize, TpcPartitionEntry, TpcPartitionMode, VidmemPromote,
};
use rm_cap::{RmError, RmResult};
use spin::Mutex;

use super::{AddressSpace, EngineRegisters, GpuResolver, Mapper, Runlist, RunlistEntry};

/// How the simulated runlist acknowledges preempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PreemptBehavior {
    /// Complete before the first poll.
    #[default]
    Immediate,
    /// Stay pending for this many polls.
    AfterPolls(u32),
    /// Never complete.
    Never,
}

/// A runlist entry as the simulator stores it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimRunlistEntry {
    /// Channels in the entry.
    pub channels: Vec<u32>,
    /// Committed timeslice.
    pub timeslice_us: u64,
    /// Committed interleave level, raw.
    pub interleave: u32,
    /// Realtime flag.
    pub realtime: bool,
    /// Enabled for time-slicing.
    pub enabled: bool,
}

#[derive(Default)]
struct SimState {
    devices: u32,
    subdevices: u32,
    preempt: PreemptBehavior,
    fail_commits: bool,
    runlist: BTreeMap<u32, SimRunlistEntry>,
    commits: u32,
    removals: Vec<u32>,
    preempts: Vec<u32>,
    pending: BTreeMap<u32, Option<u32>>,
    tpc_tables: BTreeMap<(u32, u32), Vec<TpcPartitionEntry>>,
    watermarks: BTreeMap<(u32, u32), u32>,
    partition_modes: BTreeMap<u32, TpcPartitionMode>,
    promotes: BTreeMap<u32, VidmemPromote>,
    method_buffers: BTreeMap<u32, usize>,
    lg_promotions: BTreeMap<u32, PromoteSize>,
    mmu_debug: bool,
    mappings: BTreeMap<u64, u64>,
    unmaps: u32,
    next_cpu_address: u64,
}

/// Simulated GPU.
pub struct SimGpu {
    state: Mutex<SimState>,
}

impl Default for SimGpu {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

impl SimGpu {
    /// Base of the register window.
    pub const REG_BASE: u64 = 0;

    /// Size of the register window (16 MiB).
    pub const REG_SIZE: u64 = 16 << 20;

    const CPU_BASE: u64 = 0x7f00_0000_0000;

    /// A simulator exposing `devices` devices of `subdevices` GPUs each.
    #[must_use]
    pub fn new(devices: u32, subdevices: u32) -> Self {
        Self {
            state: Mutex::new(SimState {
                devices,
                subdevices: subdevices.max(1),
                next_cpu_address: Self::CPU_BASE,
                ..SimState::default()
            }),
        }
    }

    /// Set how preempts complete.
    pub fn set_preempt_behavior(&self, behavior: PreemptBehavior) {
        self.state.lock().preempt = behavior;
    }

    /// Make runlist commits fail with `InvalidState`.
    pub fn fail_commits(&self, fail: bool) {
        self.state.lock().fail_commits = fail;
    }

    /// Entry currently on the runlist for a group.
    #[must_use]
    pub fn runlist_entry(&self, tsg_id: u32) -> Option<SimRunlistEntry> {
        self.state.lock().runlist.get(&tsg_id).cloned()
    }

    /// Successful commits so far.
    #[must_use]
    pub fn commits(&self) -> u32 {
        self.state.lock().commits
    }

    /// Groups removed from the runlist, in order.
    #[must_use]
    pub fn removals(&self) -> Vec<u32> {
        self.state.lock().removals.clone()
    }

    /// Groups preempted, in order.
    #[must_use]
    pub fn preempts(&self) -> Vec<u32> {
        self.state.lock().preempts.clone()
    }

    /// Programmed TPC table of a subcontext.
    #[must_use]
    pub fn tpc_table(&self, tsg_id: u32, subctx_id: u32) -> Option<Vec<TpcPartitionEntry>> {
        self.state.lock().tpc_tables.get(&(tsg_id, subctx_id)).cloned()
    }

    /// Programmed watermark of a subcontext.
    #[must_use]
    pub fn watermark(&self, tsg_id: u32, subctx_id: u32) -> Option<u32> {
        self.state.lock().watermarks.get(&(tsg_id, subctx_id)).copied()
    }

    /// Programmed partition mode of a group.
    #[must_use]
    pub fn partition_mode(&self, tsg_id: u32) -> Option<TpcPartitionMode> {
        self.state.lock().partition_modes.get(&tsg_id).copied()
    }

    /// Programmed vidmem promotion of a group.
    #[must_use]
    pub fn vidmem_promote(&self, tsg_id: u32) -> Option<VidmemPromote> {
        self.state.lock().promotes.get(&tsg_id).copied()
    }

    /// Put the MMU in or out of debug mode.
    pub fn set_mmu_debug_mode(&self, enabled: bool) {
        self.state.lock().mmu_debug = enabled;
    }

    /// Programmed large-sector promotion of a group.
    #[must_use]
    pub fn lg_sector_promotion(&self, tsg_id: u32) -> Option<PromoteSize> {
        self.state.lock().lg_promotions.get(&tsg_id).copied()
    }

    /// Number of fault method buffers installed for a group.
    #[must_use]
    pub fn method_buffer_count(&self, tsg_id: u32) -> Option<usize> {
        self.state.lock().method_buffers.get(&tsg_id).copied()
    }

    /// Live CPU mappings.
    #[must_use]
    pub fn live_mappings(&self) -> usize {
        self.state.lock().mappings.len()
    }

    /// Unmaps performed so far.
    #[must_use]
    pub fn unmaps(&self) -> u32 {
        self.state.lock().unmaps
    }
}

impl Runlist for SimGpu {
    fn commit(&self, _gpu: &GpuIdentity, entry: &RunlistEntry<'_>) -> RmResult<()> {
        let mut state = self.state.lock();
        if state.fail_commits {
            return Err(RmError::InvalidState);
        }
        state.commits += 1;
        state.runlist.insert(
            entry.tsg_id,
            SimRunlistEntry {
                channels: entry.channels.to_vec(),
                timeslice_us: entry.timeslice_us,
                interleave: entry.interleave as u32,
                realtime: entry.realtime,
                enabled: entry.enabled,
            },
        );
        Ok(())
    }

    fn remove(&self, _gpu: &GpuIdentity, tsg_id: u32) -> RmResult<()> {
        let mut state = self.state.lock();
        state.runlist.remove(&tsg_id).ok_or(RmError::NotFound)?;
        state.removals.push(tsg_id);
        state.pending.remove(&tsg_id);
        Ok(())
    }

    fn preempt(&self, _gpu: &GpuIdentity, tsg_id: u32) -> RmResult<()> {
        let mut state = self.state.lock();
        if !state.runlist.contains_key(&tsg_id) {
            return Err(RmError::NotFound);
        }
        state.preempts.push(tsg_id);
        let polls = match state.preempt {
            PreemptBehavior::Immediate => Some(0),
            PreemptBehavior::AfterPolls(n) => Some(n),
            PreemptBehavior::Never => None,
        };
        state.pending.insert(tsg_id, polls);
        Ok(())
    }

    fn preempt_pending(&self, _gpu: &GpuIdentity, tsg_id: u32) -> bool {
        let mut state = self.state.lock();
        match state.pending.get_mut(&tsg_id) {
            None => false,
            Some(None) => true,
            Some(Some(0)) => {
                state.pending.remove(&tsg_id);
                false
            }
            Some(Some(n)) => {
                *n -= 1;
                true
            }
        }
    }
}

impl EngineRegisters for SimGpu {
    fn program_tpc_table(
        &self,
        _gpu: &GpuIdentity,
        tsg_id: u32,
        subctx_id: u32,
        entries: &[TpcPartitionEntry],
    ) -> RmResult<()> {
        self.state
            .lock()
            .tpc_tables
            .insert((tsg_id, subctx_id), entries.to_vec());
        Ok(())
    }

    fn program_cwd_watermark(
        &self,
        _gpu: &GpuIdentity,
        tsg_id: u32,
        subctx_id: u32,
        value: u32,
    ) -> RmResult<()> {
        self.state
            .lock()
            .watermarks
            .insert((tsg_id, subctx_id), value);
        Ok(())
    }

    fn program_tpc_partition_mode(
        &self,
        _gpu: &GpuIdentity,
        tsg_id: u32,
        mode: TpcPartitionMode,
        _enable_all_tpcs: bool,
    ) -> RmResult<()> {
        self.state.lock().partition_modes.insert(tsg_id, mode);
        Ok(())
    }

    fn program_vidmem_promote(
        &self,
        _gpu: &GpuIdentity,
        tsg_id: u32,
        promote: VidmemPromote,
    ) -> RmResult<()> {
        self.state.lock().promotes.insert(tsg_id, promote);
        Ok(())
    }

    fn program_fault_method_buffers(
        &self,
        _gpu: &GpuIdentity,
        tsg_id: u32,
        buffers: &[MethodBuffer],
    ) -> RmResult<()> {
        self.state
            .lock()
            .method_buffers
            .insert(tsg_id, buffers.len());
        Ok(())
    }

    fn program_lg_sector_promotion(
        &self,
        _gpu: &GpuIdentity,
        tsg_id: u32,
        promotion: PromoteSize,
    ) -> RmResult<()> {
        self.state.lock().lg_promotions.insert(tsg_id, promotion);
        Ok(())
    }

    fn mmu_debug_mode(&self, _gpu: &GpuIdentity) -> RmResult<bool> {
        Ok(self.state.lock().mmu_debug)
    }
}

impl GpuResolver for SimGpu {
    fn resolve(&self, device_token: u32) -> RmResult<GpuIdentity> {
        let state = self.state.lock();
        if device_token >= state.devices {
            return Err(RmError::InvalidArgument);
        }
        let first = device_token * state.subdevices;
        let mask = ((1u32 << state.subdevices) - 1) << first;
        Ok(GpuIdentity::broadcast(first, mask, device_token))
    }

    fn subdevice_count(&self, _device: &GpuIdentity) -> u32 {
        self.state.lock().subdevices
    }

    fn register_window(&self, _gpu: &GpuIdentity) -> (u64, u64) {
        (Self::REG_BASE, Self::REG_SIZE)
    }
}

impl Mapper for SimGpu {
    fn map(
        &self,
        _gpu: &GpuIdentity,
        _space: AddressSpace,
        _offset: u64,
        length: u64,
    ) -> RmResult<u64> {
        if length == 0 {
            return Err(RmError::InvalidArgument);
        }
        let mut state = self.state.lock();
        let address = state.next_cpu_address;
        let pages = length.div_ceil(0x1000) * 0x1000;
        state.next_cpu_address = address.checked_add(pages).ok_or(RmError::NoMemory)?;
        state.mappings.insert(address, length);
        Ok(address)
    }

    fn unmap(&self, _gpu: &GpuIdentity, cpu_address: u64, length: u64) -> RmResult<()> {
        let mut state = self.state.lock();
        match state.mappings.get(&cpu_address) {
            Some(&len) if len == length => {
                state.mappings.remove(&cpu_address);
                state.unmaps += 1;
                Ok(())
            }
            _ => Err(RmError::InvalidArgument),
        }
    }
}
