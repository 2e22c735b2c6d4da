//! Channel groups
//!
//! A channel group (TSG) is the unit the runlist schedules. The client
//! handle ([`ChannelGroupApi`]) is a thin, duplicable reference to the
//! shared [`KernelChannelGroup`], which owns the scheduling state under its
//! own lock.
//!
//! # State Machine
//!
//! ```text
//!  CONSTRUCTED ──bind──► BOUND ◄──schedule(false)──┐
//!                          │                        │
//!                   schedule(true)                  │
//!                          ▼                        │
//!                      SCHEDULED ──preempt──► PREEMPTED
//!                          ▲                        │
//!                          └──readmit / schedule(true)
//! ```
//!
//! Every transition is staged on a copy of the state, committed to the
//! runlist, and only then applied; a failed commit leaves the group as it
//! was. The last handle to go preempts (if scheduled), removes the entry
//! and returns the TSG and channel ids.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rm_cap::objects::{
    ChannelGroupState, EngineType, GpuIdentity, InterleaveLevel, MAX_RUNQUEUES, MethodBuffer,
    Microseconds, PromoteSize, ScheduleState, TimesliceBounds, TpcPartitionMode, VidmemPromote,
};
use rm_cap::{Handle, LastRelease, ResourceClass, RmError, RmResult, SharedRef};
use rm_ctrl::CtrlCmd;
use rm_ctrl::allocation::ChannelGroupAllocParams;
use rm_ctrl::params::{
    BindParams, ChannelGroupInfoParams, GpfifoScheduleParams, InterleaveLevelParams,
    LgSectorPromotionParams, MakeRealtimeParams, MmuDebugModeParams, PreemptParams, PromoteFaultMethodBuffersParams, TimesliceParams,
    TpcPartitionModeParams, VidmemPromoteParams, nv_bool,
};
use spin::{Mutex, MutexGuard};

use super::{
    AllocContext, DupContext, GpuResource, GpuResourceBase, Layers, Resource, RmResourceBase,
    Schedulable, Shareable, alloc_params, downcast_ref,
};
use crate::control::{ControlCall, Export, internal_control_forward};
use crate::env::ServerEnv;
use crate::sched::Scheduler;

/// Scheduling state shared by every handle to one channel group.
pub struct KernelChannelGroup {
    identity: GpuIdentity,
    h_va_space: Handle,
    state: Mutex<ChannelGroupState>,
    enable_all_tpcs: AtomicBool,
    sched: Arc<Scheduler>,
}

impl KernelChannelGroup {
    /// Lock the group.
    pub fn lock(&self) -> MutexGuard<'_, ChannelGroupState> {
        self.state.lock()
    }

    /// GPU the group runs on.
    #[inline]
    #[must_use]
    pub const fn identity(&self) -> GpuIdentity {
        self.identity
    }

    /// Address space the group was created with; null if none.
    #[inline]
    #[must_use]
    pub const fn va_space(&self) -> Handle {
        self.h_va_space
    }

    /// Stage `f` on a copy of the state, commit it if the group is on the
    /// runlist, then apply it.
    fn update<R>(&self, f: impl FnOnce(&mut ChannelGroupState) -> RmResult<R>) -> RmResult<R> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        let out = f(&mut next)?;
        if next.state().on_runlist() {
            self.sched.commit(&self.identity, &next)?;
        }
        *state = next;
        Ok(out)
    }

    /// Wire the group to its engine's runlist, disabled.
    ///
    /// # Errors
    ///
    /// - `InvalidState` unless `CONSTRUCTED`
    /// - `InvalidArgument` for a different engine
    pub fn bind(&self, engine: EngineType) -> RmResult<()> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        next.bind(engine)?;
        self.sched.commit_with(&self.identity, &next, false)?;
        *state = next;
        log::debug!("tsg {}: bound to {:?}", state.tsg_id(), engine);
        Ok(())
    }

    /// Enable or disable time-slicing.
    ///
    /// With `skip_submit` the state changes but the runlist is not
    /// touched; with `skip_enable` the entry is committed disabled.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the group is not on a runlist, or the runlist's
    /// commit error.
    pub fn schedule(&self, enable: bool, skip_submit: bool, skip_enable: bool) -> RmResult<()> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        if !next.set_scheduled(enable)? {
            return Ok(());
        }
        if !skip_submit {
            self.sched
                .commit_with(&self.identity, &next, enable && !skip_enable)?;
        }
        log::debug!("tsg {}: {} -> {}", next.tsg_id(), state.state(), next.state());
        *state = next;
        Ok(())
    }

    /// Preempt the group, optionally waiting up to `timeout_us` for
    /// hardware to acknowledge.
    ///
    /// The group is `PREEMPTED` and unlocked before the wait starts.
    ///
    /// # Errors
    ///
    /// - `InvalidState` unless `SCHEDULED`
    /// - `Timeout` if the wait expires; the group stays `PREEMPTED`
    pub fn preempt(&self, wait: bool, timeout_us: Microseconds) -> RmResult<()> {
        let tsg_id = {
            let mut state = self.state.lock();
            let mut next = state.clone();
            next.begin_preempt()?;
            self.sched.request_preempt(&self.identity, next.tsg_id())?;
            *state = next;
            state.tsg_id()
        };
        if wait {
            self.sched.wait_preempt(&self.identity, tsg_id, timeout_us)?;
        }
        Ok(())
    }

    /// Runlist re-admitted the group after a preempt.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless `PREEMPTED`.
    pub fn readmit(&self) -> RmResult<()> {
        self.update(ChannelGroupState::readmit)
    }

    /// Set the timeslice; returns the clamped value.
    ///
    /// # Errors
    ///
    /// The runlist's commit error.
    pub fn set_timeslice(&self, us: Microseconds, bounds: TimesliceBounds) -> RmResult<Microseconds> {
        self.update(|s| Ok(s.set_timeslice(us, bounds)))
    }
}

impl LastRelease for KernelChannelGroup {
    fn last_release(&self) {
        let mut state = self.state.lock();
        let prior = state.destroy();
        let tsg_id = state.tsg_id();
        let channels = state.channels().to_vec();
        drop(state);
        if prior == ScheduleState::Scheduled {
            if let Err(err) = self.sched.preempt_and_wait(&self.identity, tsg_id) {
                log::error!("tsg {}: teardown preempt failed: {}", tsg_id, err);
            }
        }
        if prior.on_runlist() {
            if let Err(err) = self.sched.remove(&self.identity, tsg_id) {
                log::error!("tsg {}: runlist removal failed: {}", tsg_id, err);
            }
        }
        self.sched.release(tsg_id, &channels);
        self.sched.unregister(tsg_id);
        log::debug!("tsg {}: destroyed from {}", tsg_id, prior);
    }
}

impl fmt::Debug for KernelChannelGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelChannelGroup")
            .field("identity", &self.identity)
            .field("state", &self.state.try_lock().map(|s| s.state()))
            .finish_non_exhaustive()
    }
}

/// Client handle to a channel group.
#[derive(Debug)]
pub struct ChannelGroupApi {
    gpu: GpuResourceBase,
    group: Option<SharedRef<KernelChannelGroup>>,
}

impl ChannelGroupApi {
    /// Reserve ids and create a group in `CONSTRUCTED`.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for an unknown engine, a channel count outside
    ///   `1..=max_channels_per_group`, or a handle that is not a VA space
    /// - `ResourceExhausted` if TSG or channel ids run out
    pub fn construct(ctx: AllocContext<'_>, params: &mut [u8]) -> RmResult<Self> {
        let p: ChannelGroupAllocParams = alloc_params(params)?;
        let engine = EngineType::from_raw(p.engine_type).ok_or(RmError::InvalidArgument)?;
        let config = &ctx.env.config;
        if p.channel_count == 0 || p.channel_count > config.max_channels_per_group {
            return Err(RmError::InvalidArgument);
        }
        let h_va_space = Handle::from_raw(p.h_va_space);
        if !h_va_space.is_null() {
            ctx.expect_class(h_va_space, ResourceClass::VaSpace)?;
        }
        let identity = ctx.parent_identity()?;
        let legacy = p.flags & ChannelGroupAllocParams::FLAG_LEGACY_MODE != 0;

        let sched = &ctx.env.sched;
        let (tsg_id, channels) = sched.reserve(p.channel_count)?;
        let state = match ChannelGroupState::new(
            engine,
            tsg_id,
            channels.clone(),
            config.max_subcontexts,
            legacy,
        ) {
            Ok(state) => state,
            Err(err) => {
                sched.release(tsg_id, &channels);
                return Err(err);
            }
        };
        let group = SharedRef::new(KernelChannelGroup {
            identity,
            h_va_space,
            state: Mutex::new(state),
            enable_all_tpcs: AtomicBool::new(false),
            sched: sched.clone(),
        });
        sched.register(tsg_id, &group);
        log::debug!(
            "tsg {}: created on {:?} with {} channels{}",
            tsg_id,
            engine,
            channels.len(),
            if legacy { " (legacy)" } else { "" }
        );
        Ok(Self {
            gpu: GpuResourceBase::new(RmResourceBase::new(ctx.base, ctx.owner), identity),
            group: Some(group),
        })
    }

    /// Shared group state; `None` once torn down.
    #[must_use]
    pub fn group(&self) -> Option<&SharedRef<KernelChannelGroup>> {
        self.group.as_ref()
    }
}

impl Resource for ChannelGroupApi {
    gpu_resource_views!(gpu);

    fn class(&self) -> ResourceClass {
        ResourceClass::ChannelGroup
    }

    fn as_schedulable(&self) -> Option<&dyn Schedulable> {
        Some(self)
    }

    fn as_shareable(&self) -> Option<&dyn Shareable> {
        Some(self)
    }

    fn destruct(&mut self, env: &ServerEnv) {
        if self.gpu.rm_mut().base_mut().begin_teardown(Layers::OWN) {
            self.group = None;
        }
        self.gpu.destruct(env);
    }
}

impl_rm_resource!(ChannelGroupApi, gpu);

impl GpuResource for ChannelGroupApi {
    fn gpu_base(&self) -> &GpuResourceBase {
        &self.gpu
    }

    fn gpu_base_mut(&mut self) -> &mut GpuResourceBase {
        &mut self.gpu
    }
}

impl Schedulable for ChannelGroupApi {
    fn tsg_id(&self) -> Option<u32> {
        self.group.as_ref().map(|g| g.lock().tsg_id())
    }

    fn schedule_state(&self) -> ScheduleState {
        self.group
            .as_ref()
            .map_or(ScheduleState::Destroyed, |g| g.lock().state())
    }
}

impl Shareable for ChannelGroupApi {
    fn shared_handles(&self) -> usize {
        self.group.as_ref().map_or(0, SharedRef::ref_count)
    }

    /// The destination parent must be on the group's GPU.
    fn validate_dup_parent(&self, parent: &dyn Resource) -> RmResult<()> {
        let own = self.gpu.identity();
        let theirs = parent.as_gpu().ok_or(RmError::InvalidArgument)?.identity();
        if theirs.device_instance != own.device_instance || theirs.gpu_mask & own.gpu_mask == 0 {
            log::debug!("dup: tsg parent on {:?}, group on {:?}", theirs, own);
            return Err(RmError::InvalidArgument);
        }
        Ok(())
    }

    fn copy_construct(&self, ctx: DupContext<'_>) -> RmResult<Box<dyn Resource>> {
        let group = self.group.clone().ok_or(RmError::InvalidState)?;
        Ok(Box::new(Self {
            gpu: GpuResourceBase::new(RmResourceBase::new(ctx.base, ctx.owner), self.gpu.identity()),
            group: Some(group),
        }))
    }
}

// -- Controls

pub(crate) const EXPORTS: &[Export] = &[
    Export::new(CtrlCmd::GpfifoSchedule, ctrl_gpfifo_schedule),
    Export::new(CtrlCmd::InternalGpfifoSchedule, ctrl_gpfifo_schedule),
    Export::new(CtrlCmd::Bind, ctrl_bind),
    Export::new(CtrlCmd::SetTimeslice, ctrl_set_timeslice),
    Export::new(CtrlCmd::InternalSetTimeslice, ctrl_set_timeslice),
    Export::new(CtrlCmd::GetTimeslice, ctrl_get_timeslice),
    Export::new(CtrlCmd::Preempt, ctrl_preempt),
    Export::new(CtrlCmd::GetInfo, ctrl_get_info),
    Export::new(CtrlCmd::SetInterleaveLevel, ctrl_set_interleave_level),
    Export::new(CtrlCmd::MakeRealtime, ctrl_make_realtime),
    Export::new(CtrlCmd::SetTpcPartitionMode, ctrl_set_tpc_partition_mode),
    Export::new(CtrlCmd::GetTpcPartitionMode, ctrl_get_tpc_partition_mode),
    Export::new(CtrlCmd::GetMmuDebugMode, ctrl_get_mmu_debug_mode),
    Export::new(CtrlCmd::GrProgramVidmemPromote, ctrl_gr_program_vidmem_promote),
    Export::new(CtrlCmd::SetLgSectorPromotion, ctrl_set_lg_sector_promotion),
    Export::new(CtrlCmd::ProgramVidmemPromote, ctrl_program_vidmem_promote),
    Export::new(
        CtrlCmd::InternalPromoteFaultMethodBuffers,
        ctrl_promote_fault_method_buffers,
    ),
];

fn group_of(res: &dyn Resource) -> RmResult<&KernelChannelGroup> {
    downcast_ref::<ChannelGroupApi>(res)
        .ok_or(RmError::NotSupported)?
        .group
        .as_deref()
        .ok_or(RmError::InvalidState)
}

fn ctrl_gpfifo_schedule(res: &mut dyn Resource, call: &mut ControlCall<'_>) -> RmResult<()> {
    let p: GpfifoScheduleParams = call.decode()?;
    group_of(res)?.schedule(p.enable != 0, p.skip_submit != 0, p.skip_enable != 0)
}

fn ctrl_bind(res: &mut dyn Resource, call: &mut ControlCall<'_>) -> RmResult<()> {
    let p: BindParams = call.decode()?;
    let engine = EngineType::from_raw(p.engine_type).ok_or(RmError::InvalidArgument)?;
    group_of(res)?.bind(engine)
}

fn ctrl_set_timeslice(res: &mut dyn Resource, call: &mut ControlCall<'_>) -> RmResult<()> {
    let p: TimesliceParams = call.decode()?;
    let bounds = call.env.config.timeslice_bounds();
    let effective = group_of(res)?.set_timeslice(p.timeslice_us, bounds)?;
    call.encode(&TimesliceParams {
        timeslice_us: effective,
    })
}

fn ctrl_get_timeslice(res: &mut dyn Resource, call: &mut ControlCall<'_>) -> RmResult<()> {
    let timeslice_us = group_of(res)?.lock().timeslice_us();
    call.encode(&TimesliceParams { timeslice_us })
}

fn ctrl_preempt(res: &mut dyn Resource, call: &mut ControlCall<'_>) -> RmResult<()> {
    let p: PreemptParams = call.decode()?;
    let manual = (p.manual_timeout != 0).then_some(u64::from(p.timeout_us));
    let timeout_us = call.env.sched.preempt_timeout(manual)?;
    group_of(res)?.preempt(p.wait != 0, timeout_us)
}

fn ctrl_get_info(res: &mut dyn Resource, call: &mut ControlCall<'_>) -> RmResult<()> {
    let tsg_id = group_of(res)?.lock().tsg_id();
    call.encode(&ChannelGroupInfoParams { tsg_id })
}

fn ctrl_set_interleave_level(res: &mut dyn Resource, call: &mut ControlCall<'_>) -> RmResult<()> {
    let p: InterleaveLevelParams = call.decode()?;
    let level = InterleaveLevel::from_raw(p.tsg_interleave_level).ok_or(RmError::InvalidArgument)?;
    group_of(res)?.update(|s| {
        s.set_interleave(level);
        Ok(())
    })
}

fn ctrl_make_realtime(res: &mut dyn Resource, call: &mut ControlCall<'_>) -> RmResult<()> {
    let p: MakeRealtimeParams = call.decode()?;
    group_of(res)?.update(|s| s.make_realtime(p.realtime != 0))
}

fn ctrl_set_tpc_partition_mode(res: &mut dyn Resource, call: &mut ControlCall<'_>) -> RmResult<()> {
    let p: TpcPartitionModeParams = call.decode()?;
    let mode = TpcPartitionMode::from_raw(p.mode).ok_or(RmError::InvalidArgument)?;
    let enable_all = p.enable_all_tpcs != 0;
    let group = group_of(res)?;
    let mut state = group.lock();
    call.env
        .hal
        .regs
        .program_tpc_partition_mode(&group.identity, state.tsg_id(), mode, enable_all)?;
    state.set_tpc_mode(mode);
    group.enable_all_tpcs.store(enable_all, Ordering::Relaxed);
    Ok(())
}

fn ctrl_get_tpc_partition_mode(res: &mut dyn Resource, call: &mut ControlCall<'_>) -> RmResult<()> {
    let group = group_of(res)?;
    let mode = group.lock().tpc_mode();
    call.encode(&TpcPartitionModeParams {
        mode: mode as u32,
        enable_all_tpcs: nv_bool(group.enable_all_tpcs.load(Ordering::Relaxed)),
        _pad: [0; 3],
    })
}

fn ctrl_get_mmu_debug_mode(res: &mut dyn Resource, call: &mut ControlCall<'_>) -> RmResult<()> {
    let identity = group_of(res)?.identity;
    let mode = call.env.hal.regs.mmu_debug_mode(&identity)?;
    call.encode(&MmuDebugModeParams { mode: nv_bool(mode) })
}

fn ctrl_set_lg_sector_promotion(res: &mut dyn Resource, call: &mut ControlCall<'_>) -> RmResult<()> {
    let p: LgSectorPromotionParams = call.decode()?;
    let promotion = PromoteSize::from_raw(p.promotion).ok_or(RmError::InvalidArgument)?;
    let group = group_of(res)?;
    let mut state = group.lock();
    call.env
        .hal
        .regs
        .program_lg_sector_promotion(&group.identity, state.tsg_id(), promotion)?;
    state.set_lg_sector_promotion(promotion);
    Ok(())
}

fn ctrl_gr_program_vidmem_promote(res: &mut dyn Resource, call: &mut ControlCall<'_>) -> RmResult<()> {
    internal_control_forward(res, CtrlCmd::ProgramVidmemPromote, call)
}

fn ctrl_program_vidmem_promote(res: &mut dyn Resource, call: &mut ControlCall<'_>) -> RmResult<()> {
    let p: VidmemPromoteParams = call.decode()?;
    let promote = VidmemPromote {
        l1: PromoteSize::from_raw(p.l1).ok_or(RmError::InvalidArgument)?,
        t1: PromoteSize::from_raw(p.t1).ok_or(RmError::InvalidArgument)?,
    };
    let group = group_of(res)?;
    let mut state = group.lock();
    call.env
        .hal
        .regs
        .program_vidmem_promote(&group.identity, state.tsg_id(), promote)?;
    state.set_vidmem_promote(promote);
    Ok(())
}

fn ctrl_promote_fault_method_buffers(
    res: &mut dyn Resource,
    call: &mut ControlCall<'_>,
) -> RmResult<()> {
    let p: PromoteFaultMethodBuffersParams = call.decode()?;
    let count = p.num_valid_entries as usize;
    if count > MAX_RUNQUEUES {
        return Err(RmError::InvalidArgument);
    }
    let buffers: Vec<MethodBuffer> = p.method_buffer[..count]
        .iter()
        .zip(p.bar2_addr)
        .map(|(desc, bar2_addr)| MethodBuffer {
            base: desc.base,
            size: desc.size,
            bar2_addr,
        })
        .collect();
    let group = group_of(res)?;
    let mut state = group.lock();
    let mut next = state.clone();
    next.set_method_buffers(&buffers)?;
    call.env
        .hal
        .regs
        .program_fault_method_buffers(&group.identity, next.tsg_id(), &buffers)?;
    *state = next;
    Ok(())
}
