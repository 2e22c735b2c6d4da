//! Channel group (TSG) scheduling state
//!
//! A channel group is the unit the hardware runlist schedules. Its state
//! machine:
//!
//! ```text
//!              bind            schedule(true)
//! CONSTRUCTED ──────► BOUND ◄──────────────► SCHEDULED
//!                       ▲    schedule(false)   │    ▲
//!                       │                preempt  readmit /
//!                       │ schedule(false)      │  schedule(true)
//!                       └──────────────── PREEMPTED
//!
//! any ──── last release ────► DESTROYED
//! ```
//!
//! `PREEMPTED` is left only through an explicit re-admission event from the
//! runlist or an explicit `schedule(true)`; the server never guesses when
//! hardware has re-admitted a group.
//!
//! Everything here is pure bookkeeping. Runlist programming and the
//! preempt acknowledgment wait live in the server.

use alloc::vec::Vec;
use core::fmt;

use crate::{IdPool, RmError, RmResult};

/// Time in microseconds.
pub type Microseconds = u64;

/// Scheduling state of a channel group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ScheduleState {
    /// Allocated, not yet wired to a runlist entry.
    #[default]
    Constructed = 0,
    /// Has a runlist entry; not eligible for time-slicing.
    Bound = 1,
    /// Eligible for time-slicing.
    Scheduled = 2,
    /// Removed from execution by a preempt; waiting for re-admission.
    Preempted = 3,
    /// Torn down.
    Destroyed = 4,
}

impl ScheduleState {
    /// Get the state name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Constructed => "CONSTRUCTED",
            Self::Bound => "BOUND",
            Self::Scheduled => "SCHEDULED",
            Self::Preempted => "PREEMPTED",
            Self::Destroyed => "DESTROYED",
        }
    }

    /// Check whether the group owns a runlist entry.
    #[inline]
    #[must_use]
    pub const fn on_runlist(self) -> bool {
        matches!(self, Self::Bound | Self::Scheduled | Self::Preempted)
    }
}

impl fmt::Display for ScheduleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Runlist priority of a channel group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u32)]
pub enum InterleaveLevel {
    /// Low priority.
    Low = 0,
    /// Medium priority.
    #[default]
    Medium = 1,
    /// High priority.
    High = 2,
}

impl InterleaveLevel {
    /// Convert from the raw wire value.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Low),
            1 => Some(Self::Medium),
            2 => Some(Self::High),
            _ => None,
        }
    }
}

/// Engine a channel group runs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EngineType {
    /// Graphics engine; compute work runs here too.
    Graphics,
    /// Copy engine `0..COPY_ENGINES`.
    Copy(u8),
    /// Video decoder.
    Nvdec,
    /// Video encoder.
    Nvenc,
}

impl EngineType {
    /// Number of copy engines.
    pub const COPY_ENGINES: u8 = 10;

    const RAW_GRAPHICS: u32 = 0x01;
    const RAW_COPY0: u32 = 0x09;
    const RAW_NVDEC0: u32 = 0x13;
    const RAW_NVENC0: u32 = 0x18;

    /// Convert from the raw engine type.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            Self::RAW_GRAPHICS => Some(Self::Graphics),
            Self::RAW_NVDEC0 => Some(Self::Nvdec),
            Self::RAW_NVENC0 => Some(Self::Nvenc),
            r if r >= Self::RAW_COPY0 && r < Self::RAW_COPY0 + Self::COPY_ENGINES as u32 => {
                Some(Self::Copy((r - Self::RAW_COPY0) as u8))
            }
            _ => None,
        }
    }

    /// Get the raw engine type.
    #[must_use]
    pub const fn raw(self) -> u32 {
        match self {
            Self::Graphics => Self::RAW_GRAPHICS,
            Self::Copy(n) => Self::RAW_COPY0 + n as u32,
            Self::Nvdec => Self::RAW_NVDEC0,
            Self::Nvenc => Self::RAW_NVENC0,
        }
    }

    /// Check whether the engine runs graphics contexts (and therefore
    /// supports subcontexts and TPC partitioning).
    #[inline]
    #[must_use]
    pub const fn is_graphics(self) -> bool {
        matches!(self, Self::Graphics)
    }
}

/// How TPCs are assigned to subcontexts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum TpcPartitionMode {
    /// No partitioning; all TPCs shared.
    #[default]
    None = 0,
    /// Software supplies the full table, including local-memory blocks.
    Static = 1,
    /// Hardware assigns local-memory blocks.
    Dynamic = 2,
}

impl TpcPartitionMode {
    /// Convert from the raw wire value.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Static),
            2 => Some(Self::Dynamic),
            _ => None,
        }
    }

    /// Check whether hardware assigns local-memory block indices.
    #[inline]
    #[must_use]
    pub const fn hw_assigns_lmem(self) -> bool {
        matches!(self, Self::Dynamic)
    }
}

/// Vidmem compression promotion size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum PromoteSize {
    /// No promotion.
    #[default]
    None = 0,
    /// Promote to 64 bytes.
    Bytes64 = 1,
    /// Promote to 128 bytes.
    Bytes128 = 2,
}

impl PromoteSize {
    /// Convert from the raw wire value.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Bytes64),
            2 => Some(Self::Bytes128),
            _ => None,
        }
    }
}

/// L1/T1 promotion settings of a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct VidmemPromote {
    /// L1 promotion.
    pub l1: PromoteSize,
    /// T1 promotion.
    pub t1: PromoteSize,
}

/// A fault method buffer for one run queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct MethodBuffer {
    /// Physical base.
    pub base: u64,
    /// Size in bytes.
    pub size: u64,
    /// BAR2 address the buffer is visible at.
    pub bar2_addr: u64,
}

/// Maximum number of run queues per group.
pub const MAX_RUNQUEUES: usize = 2;

/// Hardware timeslice bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimesliceBounds {
    /// Shortest slice.
    pub min_us: Microseconds,
    /// Longest slice.
    pub max_us: Microseconds,
}

impl TimesliceBounds {
    /// Bounds of the runlist timeslice field (8-bit value, 15-bit scale).
    pub const HW: Self = Self {
        min_us: 1000,
        max_us: 255 << 15,
    };

    /// Default slice of a new group.
    pub const DEFAULT_US: Microseconds = 2048;

    /// Clamp a requested slice into the bounds.
    #[inline]
    #[must_use]
    pub const fn clamp(self, us: Microseconds) -> Microseconds {
        if us < self.min_us {
            self.min_us
        } else if us > self.max_us {
            self.max_us
        } else {
            us
        }
    }
}

/// Channel group bookkeeping.
///
/// Owned by the server under the group lock; every method is a pure state
/// transition that either fully applies or returns an error with the state
/// unchanged.
#[derive(Clone, Debug)]
pub struct ChannelGroupState {
    state: ScheduleState,
    engine: EngineType,
    tsg_id: u32,
    channels: Vec<u32>,
    timeslice_us: Microseconds,
    interleave: InterleaveLevel,
    realtime: bool,
    legacy_mode: bool,
    tpc_mode: TpcPartitionMode,
    vidmem_promote: VidmemPromote,
    lg_sector_promotion: PromoteSize,
    method_buffers: Vec<MethodBuffer>,
    subctx: IdPool,
}

impl ChannelGroupState {
    /// Subcontext id reserved for the legacy synchronous context.
    pub const LEGACY_SYNC_SUBCTX: u32 = 0;

    /// Subcontext id reserved for the legacy asynchronous context.
    pub const LEGACY_ASYNC_SUBCTX: u32 = 1;

    /// Create a group in `CONSTRUCTED`.
    ///
    /// # Parameters
    ///
    /// - `engine`: Engine the group runs on
    /// - `tsg_id`: Runlist-unique group id
    /// - `channels`: Member channel ids, in order
    /// - `max_subctx`: Size of the subcontext id space
    /// - `legacy_mode`: Reserve the internal sync/async subcontexts
    pub fn new(
        engine: EngineType,
        tsg_id: u32,
        channels: Vec<u32>,
        max_subctx: u32,
        legacy_mode: bool,
    ) -> RmResult<Self> {
        let mut subctx = IdPool::new(max_subctx);
        if legacy_mode {
            subctx.allocate_specific(Self::LEGACY_SYNC_SUBCTX)?;
            subctx.allocate_specific(Self::LEGACY_ASYNC_SUBCTX)?;
        }
        Ok(Self {
            state: ScheduleState::Constructed,
            engine,
            tsg_id,
            channels,
            timeslice_us: TimesliceBounds::DEFAULT_US,
            interleave: InterleaveLevel::default(),
            realtime: false,
            legacy_mode,
            tpc_mode: TpcPartitionMode::default(),
            vidmem_promote: VidmemPromote::default(),
            lg_sector_promotion: PromoteSize::None,
            method_buffers: Vec::new(),
            subctx,
        })
    }

    /// Current scheduling state.
    #[inline]
    #[must_use]
    pub const fn state(&self) -> ScheduleState {
        self.state
    }

    /// Engine the group runs on.
    #[inline]
    #[must_use]
    pub const fn engine(&self) -> EngineType {
        self.engine
    }

    /// Runlist-unique group id.
    #[inline]
    #[must_use]
    pub const fn tsg_id(&self) -> u32 {
        self.tsg_id
    }

    /// Member channel ids.
    #[inline]
    #[must_use]
    pub fn channels(&self) -> &[u32] {
        &self.channels
    }

    /// Effective timeslice.
    #[inline]
    #[must_use]
    pub const fn timeslice_us(&self) -> Microseconds {
        self.timeslice_us
    }

    /// Runlist priority.
    #[inline]
    #[must_use]
    pub const fn interleave(&self) -> InterleaveLevel {
        self.interleave
    }

    /// Whether the group was made realtime.
    #[inline]
    #[must_use]
    pub const fn is_realtime(&self) -> bool {
        self.realtime
    }

    /// Whether the group runs in legacy (non-subcontext) mode.
    #[inline]
    #[must_use]
    pub const fn is_legacy(&self) -> bool {
        self.legacy_mode
    }

    /// TPC partition mode.
    #[inline]
    #[must_use]
    pub const fn tpc_mode(&self) -> TpcPartitionMode {
        self.tpc_mode
    }

    /// Vidmem promotion settings.
    #[inline]
    #[must_use]
    pub const fn vidmem_promote(&self) -> VidmemPromote {
        self.vidmem_promote
    }

    /// Large-sector promotion.
    #[inline]
    #[must_use]
    pub const fn lg_sector_promotion(&self) -> PromoteSize {
        self.lg_sector_promotion
    }

    /// Promoted fault method buffers.
    #[inline]
    #[must_use]
    pub fn method_buffers(&self) -> &[MethodBuffer] {
        &self.method_buffers
    }

    /// Wire the group to a runlist entry.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if `engine` is not the group's engine
    /// - `InvalidState` unless the group is `CONSTRUCTED`
    pub fn bind(&mut self, engine: EngineType) -> RmResult<()> {
        if self.state != ScheduleState::Constructed {
            return Err(RmError::InvalidState);
        }
        if engine != self.engine {
            return Err(RmError::InvalidArgument);
        }
        self.state = ScheduleState::Bound;
        Ok(())
    }

    /// Enable or disable time-slicing.
    ///
    /// Enabling from `PREEMPTED` re-admits the group. Requesting the state
    /// the group is already in succeeds without change.
    ///
    /// # Returns
    ///
    /// `true` if the state changed.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the group is not on a runlist.
    pub fn set_scheduled(&mut self, enable: bool) -> RmResult<bool> {
        let next = match (self.state, enable) {
            (ScheduleState::Bound | ScheduleState::Preempted, true) => ScheduleState::Scheduled,
            (ScheduleState::Scheduled | ScheduleState::Preempted, false) => ScheduleState::Bound,
            (ScheduleState::Scheduled, true) | (ScheduleState::Bound, false) => {
                return Ok(false);
            }
            _ => return Err(RmError::InvalidState),
        };
        self.state = next;
        Ok(true)
    }

    /// Enter `PREEMPTED`.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless the group is `SCHEDULED`, which includes a
    /// second preempt while the first is outstanding.
    pub fn begin_preempt(&mut self) -> RmResult<()> {
        if self.state != ScheduleState::Scheduled {
            return Err(RmError::InvalidState);
        }
        self.state = ScheduleState::Preempted;
        Ok(())
    }

    /// Runlist re-admitted a preempted group.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless the group is `PREEMPTED`.
    pub fn readmit(&mut self) -> RmResult<()> {
        if self.state != ScheduleState::Preempted {
            return Err(RmError::InvalidState);
        }
        self.state = ScheduleState::Scheduled;
        Ok(())
    }

    /// Set the timeslice, clamped into `bounds`.
    ///
    /// # Returns
    ///
    /// The effective timeslice.
    pub fn set_timeslice(&mut self, us: Microseconds, bounds: TimesliceBounds) -> Microseconds {
        self.timeslice_us = bounds.clamp(us);
        self.timeslice_us
    }

    /// Set the runlist priority.
    pub fn set_interleave(&mut self, level: InterleaveLevel) {
        self.interleave = level;
    }

    /// Make the group realtime. There is no way back.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if asked to clear the flag.
    pub fn make_realtime(&mut self, realtime: bool) -> RmResult<()> {
        if !realtime {
            return Err(RmError::InvalidArgument);
        }
        self.realtime = true;
        Ok(())
    }

    /// Set the TPC partition mode.
    pub fn set_tpc_mode(&mut self, mode: TpcPartitionMode) {
        self.tpc_mode = mode;
    }

    /// Record vidmem promotion settings.
    pub fn set_vidmem_promote(&mut self, promote: VidmemPromote) {
        self.vidmem_promote = promote;
    }

    /// Record large-sector promotion.
    pub fn set_lg_sector_promotion(&mut self, promotion: PromoteSize) {
        self.lg_sector_promotion = promotion;
    }

    /// Record the promoted fault method buffers.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for more than [`MAX_RUNQUEUES`] buffers.
    pub fn set_method_buffers(&mut self, buffers: &[MethodBuffer]) -> RmResult<()> {
        if buffers.len() > MAX_RUNQUEUES {
            return Err(RmError::InvalidArgument);
        }
        self.method_buffers.clear();
        self.method_buffers.extend_from_slice(buffers);
        Ok(())
    }

    /// Allocate a subcontext id.
    ///
    /// `specified` requests an exact id; otherwise the lowest free id is
    /// used.
    ///
    /// # Errors
    ///
    /// - `ResourceExhausted` if the id space is full
    /// - `InvalidState` if the specified id is taken
    /// - `InvalidArgument` if the specified id is out of range
    /// - `NotSupported` for non-graphics engines
    pub fn alloc_subctx(&mut self, specified: Option<u32>) -> RmResult<u32> {
        if !self.engine.is_graphics() {
            return Err(RmError::NotSupported);
        }
        if self.state == ScheduleState::Destroyed {
            return Err(RmError::InvalidState);
        }
        match specified {
            Some(id) => self.subctx.allocate_specific(id),
            None => self.subctx.allocate(),
        }
    }

    /// Return a subcontext id.
    pub fn free_subctx(&mut self, id: u32) {
        self.subctx.free(id);
    }

    /// Check whether a subcontext id is in use.
    #[inline]
    #[must_use]
    pub fn subctx_in_use(&self, id: u32) -> bool {
        self.subctx.is_allocated(id)
    }

    /// Size of the subcontext id space.
    #[inline]
    #[must_use]
    pub const fn max_subctx(&self) -> u32 {
        self.subctx.capacity()
    }

    /// Enter `DESTROYED`.
    ///
    /// # Returns
    ///
    /// The state the group was in, so the caller knows what hardware
    /// teardown is owed.
    pub fn destroy(&mut self) -> ScheduleState {
        core::mem::replace(&mut self.state, ScheduleState::Destroyed)
    }
}
