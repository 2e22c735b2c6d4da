//! Context shares
//!
//! A context share is a subcontext of a graphics channel group: a slot
//! with its own id, TPC partition table and CWD watermark. Handles share a
//! [`ContextShareRecord`]; the record reaches its group through an
//! internal reference and mutates subcontext state only while holding the
//! group's lock.
//!
//! ```text
//! ContextShareApi ──► SharedRef<ContextShareRecord> ──► InternalRef<KernelChannelGroup>
//!                          subctx id, TPC table,             group lock, id pool
//!                          watermark
//! ```

use rm_cap::objects::{
    CwdWatermark, MAX_TPC_PARTITION_ENTRIES, ScheduleState, SubctxFlags, TpcPartitionEntry,
    TpcPartitionTable,
};
use rm_cap::{Handle, InternalRef, LastRelease, ResourceClass, RmError, RmResult, SharedRef};
use rm_ctrl::CtrlCmd;
use rm_ctrl::allocation::CtxShareAllocParams;
use rm_ctrl::params::{CwdWatermarkParams, TpcPartitionTableParams};
use spin::Mutex;

use super::{
    AllocContext, ChannelGroupApi, DupContext, GpuResource, GpuResourceBase, KernelChannelGroup,
    Layers, Resource, RmResourceBase, Shareable, alloc_params, downcast_ref, write_alloc_params,
};
use crate::control::{ControlCall, Export};
use crate::env::ServerEnv;

/// Per-subcontext configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubctxConfig {
    /// TPC partition table.
    pub tpc_table: TpcPartitionTable,
    /// CWD watermark.
    pub watermark: CwdWatermark,
}

/// Subcontext state shared by every handle to one context share.
#[derive(Debug)]
pub struct ContextShareRecord {
    group: InternalRef<KernelChannelGroup>,
    subctx_id: u32,
    flags: SubctxFlags,
    h_va_space: Handle,
    config: Mutex<SubctxConfig>,
}

impl ContextShareRecord {
    /// Subcontext id within the group.
    #[inline]
    #[must_use]
    pub const fn subctx_id(&self) -> u32 {
        self.subctx_id
    }

    /// Allocation flags.
    #[inline]
    #[must_use]
    pub const fn flags(&self) -> SubctxFlags {
        self.flags
    }

    /// Address space the subcontext runs in.
    #[inline]
    #[must_use]
    pub const fn va_space(&self) -> Handle {
        self.h_va_space
    }

    /// Owning group.
    #[must_use]
    pub fn group(&self) -> &KernelChannelGroup {
        &self.group
    }

    /// Snapshot of the configuration, read under the group lock.
    #[must_use]
    pub fn config(&self) -> SubctxConfig {
        let _group = self.group.lock();
        self.config.lock().clone()
    }
}

impl LastRelease for ContextShareRecord {
    fn last_release(&self) {
        let mut state = self.group.lock();
        state.free_subctx(self.subctx_id);
        log::debug!("tsg {}: subctx {} released", state.tsg_id(), self.subctx_id);
    }
}

/// Client handle to a context share.
#[derive(Debug)]
pub struct ContextShareApi {
    gpu: GpuResourceBase,
    record: Option<SharedRef<ContextShareRecord>>,
}

impl ContextShareApi {
    /// Take a subcontext id in the parent group and program its default
    /// watermark.
    ///
    /// `subctx_id` is written back to the parameters.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for bad flags or a handle that is not a VA space
    /// - `NotSupported` on a non-graphics group
    /// - `InvalidState` if a specified id is taken or the group is gone
    /// - `ResourceExhausted` if the group has no free id
    pub fn construct(ctx: AllocContext<'_>, params: &mut [u8]) -> RmResult<Self> {
        let mut p: CtxShareAllocParams = alloc_params(params)?;
        let flags = SubctxFlags::from_raw(p.flags, p.subctx_id)?;
        let parent = downcast_ref::<ChannelGroupApi>(ctx.parent).ok_or(RmError::InvalidArgument)?;
        let shared = parent.group().ok_or(RmError::InvalidState)?;

        let mut h_va_space = Handle::from_raw(p.h_va_space);
        if h_va_space.is_null() {
            h_va_space = shared.va_space();
        } else {
            ctx.expect_class(h_va_space, ResourceClass::VaSpace)?;
        }

        let identity = shared.identity();
        let mut state = shared.lock();
        let subctx_id = state.alloc_subctx(flags.specified())?;
        if let Err(err) = ctx.env.hal.regs.program_cwd_watermark(
            &identity,
            state.tsg_id(),
            subctx_id,
            CwdWatermark::DEFAULT,
        ) {
            state.free_subctx(subctx_id);
            return Err(err);
        }
        log::debug!(
            "tsg {}: subctx {} allocated ({:?})",
            state.tsg_id(),
            subctx_id,
            flags
        );
        drop(state);

        p.subctx_id = subctx_id;
        let record = SharedRef::new(ContextShareRecord {
            group: shared.internal(),
            subctx_id,
            flags,
            h_va_space,
            config: Mutex::new(SubctxConfig::default()),
        });
        write_alloc_params(&p, params)?;
        Ok(Self {
            gpu: GpuResourceBase::new(RmResourceBase::new(ctx.base, ctx.owner), identity),
            record: Some(record),
        })
    }

    /// Shared record; `None` once torn down.
    #[must_use]
    pub fn record(&self) -> Option<&SharedRef<ContextShareRecord>> {
        self.record.as_ref()
    }
}

impl Resource for ContextShareApi {
    gpu_resource_views!(gpu);

    fn class(&self) -> ResourceClass {
        ResourceClass::ContextShare
    }

    fn as_shareable(&self) -> Option<&dyn Shareable> {
        Some(self)
    }

    fn destruct(&mut self, env: &ServerEnv) {
        if self.gpu.rm_mut().base_mut().begin_teardown(Layers::OWN) {
            self.record = None;
        }
        self.gpu.destruct(env);
    }
}

impl_rm_resource!(ContextShareApi, gpu);

impl GpuResource for ContextShareApi {
    fn gpu_base(&self) -> &GpuResourceBase {
        &self.gpu
    }

    fn gpu_base_mut(&mut self) -> &mut GpuResourceBase {
        &mut self.gpu
    }
}

impl Shareable for ContextShareApi {
    fn shared_handles(&self) -> usize {
        self.record.as_ref().map_or(0, SharedRef::ref_count)
    }

    /// The destination parent must be a handle to the same channel group.
    fn validate_dup_parent(&self, parent: &dyn Resource) -> RmResult<()> {
        let record = self.record.as_ref().ok_or(RmError::InvalidState)?;
        let same_group = downcast_ref::<ChannelGroupApi>(parent)
            .and_then(ChannelGroupApi::group)
            .is_some_and(|group| record.group.refers_to(group));
        if same_group {
            Ok(())
        } else {
            Err(RmError::InvalidArgument)
        }
    }

    fn copy_construct(&self, ctx: DupContext<'_>) -> RmResult<Box<dyn Resource>> {
        let record = self.record.clone().ok_or(RmError::InvalidState)?;
        Ok(Box::new(Self {
            gpu: GpuResourceBase::new(RmResourceBase::new(ctx.base, ctx.owner), self.gpu.identity()),
            record: Some(record),
        }))
    }
}

// -- Controls

pub(crate) const EXPORTS: &[Export] = &[
    Export::new(CtrlCmd::SetTpcPartitionTable, ctrl_set_tpc_partition_table),
    Export::new(CtrlCmd::GetCwdWatermark, ctrl_get_cwd_watermark),
    Export::new(CtrlCmd::SetCwdWatermark, ctrl_set_cwd_watermark),
];

fn record_of(res: &dyn Resource) -> RmResult<&ContextShareRecord> {
    downcast_ref::<ContextShareApi>(res)
        .ok_or(RmError::NotSupported)?
        .record
        .as_deref()
        .ok_or(RmError::InvalidState)
}

fn ctrl_set_tpc_partition_table(res: &mut dyn Resource, call: &mut ControlCall<'_>) -> RmResult<()> {
    let p: TpcPartitionTableParams = call.decode()?;
    let count = p.num_used_tpc as usize;
    if count > MAX_TPC_PARTITION_ENTRIES {
        return Err(RmError::InvalidArgument);
    }
    let entries: Vec<TpcPartitionEntry> = p.tpc_list[..count]
        .iter()
        .map(|info| TpcPartitionEntry {
            global_tpc_index: info.global_tpc_index,
            lmem_block_index: info.lmem_block_index,
        })
        .collect();

    let record = record_of(res)?;
    let group = record.group();
    let state = group.lock();
    if state.state() == ScheduleState::Destroyed {
        return Err(RmError::InvalidState);
    }
    let table = TpcPartitionTable::new(&entries, call.env.config.num_tpcs, state.tpc_mode())?;
    call.env.hal.regs.program_tpc_table(
        &group.identity(),
        state.tsg_id(),
        record.subctx_id,
        table.entries(),
    )?;
    record.config.lock().tpc_table = table;
    Ok(())
}

fn ctrl_get_cwd_watermark(res: &mut dyn Resource, call: &mut ControlCall<'_>) -> RmResult<()> {
    let watermark = record_of(res)?.config().watermark;
    call.encode(&CwdWatermarkParams {
        watermark_value: watermark.get(),
    })
}

fn ctrl_set_cwd_watermark(res: &mut dyn Resource, call: &mut ControlCall<'_>) -> RmResult<()> {
    let p: CwdWatermarkParams = call.decode()?;
    let watermark = CwdWatermark::new(p.watermark_value)?;
    let record = record_of(res)?;
    let group = record.group();
    let state = group.lock();
    if state.state() == ScheduleState::Destroyed {
        return Err(RmError::InvalidState);
    }
    call.env.hal.regs.program_cwd_watermark(
        &group.identity(),
        state.tsg_id(),
        record.subctx_id,
        watermark.get(),
    )?;
    record.config.lock().watermark = watermark;
    Ok(())
}
