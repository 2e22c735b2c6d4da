//! Runlist scheduling
//!
//! Owns the runlist-wide id spaces (TSG ids and channel ids), the registry
//! used to route hardware events back to channel groups, and the preempt
//! wait loop.
//!
//! ```text
//!            commit/remove/preempt
//! group ──► Scheduler ──────────────► Runlist (hal)
//!   ▲           │
//!   └───────────┘ readmit event (by tsg id)
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rm_cap::objects::{ChannelGroupState, GpuIdentity, Microseconds, ScheduleState};
use rm_cap::{IdPool, InternalRef, RmError, RmResult, SharedRef};
use spin::Mutex;

use crate::config::ServerConfig;
use crate::hal::{Runlist, RunlistEntry};
use crate::resource::channel_group::KernelChannelGroup;

/// Runlist-wide scheduling state.
pub struct Scheduler {
    runlist: Arc<dyn Runlist>,
    tsg_ids: Mutex<IdPool>,
    channel_ids: Mutex<IdPool>,
    groups: Mutex<BTreeMap<u32, InternalRef<KernelChannelGroup>>>,
    preempt_timeout_us: Microseconds,
    max_manual_timeout_us: Microseconds,
    poll_interval_us: Microseconds,
}

impl Scheduler {
    /// Create a scheduler driving `runlist`.
    #[must_use]
    pub fn new(config: &ServerConfig, runlist: Arc<dyn Runlist>) -> Self {
        Self {
            runlist,
            tsg_ids: Mutex::new(IdPool::new(config.max_channel_groups)),
            channel_ids: Mutex::new(IdPool::new(config.max_channels)),
            groups: Mutex::new(BTreeMap::new()),
            preempt_timeout_us: config.preempt_timeout_us,
            max_manual_timeout_us: config.max_manual_preempt_timeout_us,
            poll_interval_us: config.preempt_poll_interval_us,
        }
    }

    /// Reserve a TSG id and `count` channel ids.
    ///
    /// # Errors
    ///
    /// `ResourceExhausted` if either space is full; nothing stays reserved.
    pub fn reserve(&self, count: u32) -> RmResult<(u32, Vec<u32>)> {
        let tsg_id = self.tsg_ids.lock().allocate()?;
        let mut channels = Vec::with_capacity(count as usize);
        let mut pool = self.channel_ids.lock();
        for _ in 0..count {
            match pool.allocate() {
                Ok(id) => channels.push(id),
                Err(err) => {
                    for id in channels {
                        pool.free(id);
                    }
                    drop(pool);
                    self.tsg_ids.lock().free(tsg_id);
                    return Err(err);
                }
            }
        }
        Ok((tsg_id, channels))
    }

    /// Return ids taken by [`reserve`](Self::reserve).
    pub fn release(&self, tsg_id: u32, channels: &[u32]) {
        let mut pool = self.channel_ids.lock();
        for &id in channels {
            pool.free(id);
        }
        drop(pool);
        self.tsg_ids.lock().free(tsg_id);
    }

    /// TSG ids in use.
    #[must_use]
    pub fn groups_in_use(&self) -> u32 {
        self.tsg_ids.lock().allocated()
    }

    /// Channel ids in use.
    #[must_use]
    pub fn channels_in_use(&self) -> u32 {
        self.channel_ids.lock().allocated()
    }

    /// Make a group reachable by its TSG id.
    pub fn register(&self, tsg_id: u32, group: &SharedRef<KernelChannelGroup>) {
        self.groups.lock().insert(tsg_id, group.internal());
    }

    /// Forget a group.
    pub fn unregister(&self, tsg_id: u32) {
        self.groups.lock().remove(&tsg_id);
    }

    /// Find a live group by TSG id.
    #[must_use]
    pub fn lookup(&self, tsg_id: u32) -> Option<InternalRef<KernelChannelGroup>> {
        self.groups.lock().get(&tsg_id).cloned()
    }

    /// Commit a group's current state to the runlist.
    ///
    /// The entry is enabled only while the group is `SCHEDULED`.
    ///
    /// # Errors
    ///
    /// Whatever the runlist reports.
    pub fn commit(&self, gpu: &GpuIdentity, state: &ChannelGroupState) -> RmResult<()> {
        self.commit_with(gpu, state, state.state() == ScheduleState::Scheduled)
    }

    /// Commit a group with an explicit enable bit.
    ///
    /// # Errors
    ///
    /// Whatever the runlist reports.
    pub fn commit_with(
        &self,
        gpu: &GpuIdentity,
        state: &ChannelGroupState,
        enabled: bool,
    ) -> RmResult<()> {
        let entry = RunlistEntry {
            tsg_id: state.tsg_id(),
            engine: state.engine(),
            channels: state.channels(),
            timeslice_us: state.timeslice_us(),
            interleave: state.interleave(),
            realtime: state.is_realtime(),
            enabled,
        };
        log::trace!("sched: commit tsg {} enabled={}", entry.tsg_id, enabled);
        self.runlist.commit(gpu, &entry)
    }

    /// Drop a group's runlist entry.
    ///
    /// # Errors
    ///
    /// Whatever the runlist reports.
    pub fn remove(&self, gpu: &GpuIdentity, tsg_id: u32) -> RmResult<()> {
        log::trace!("sched: remove tsg {}", tsg_id);
        self.runlist.remove(gpu, tsg_id)
    }

    /// Request a preempt without waiting.
    ///
    /// # Errors
    ///
    /// Whatever the runlist reports.
    pub fn request_preempt(&self, gpu: &GpuIdentity, tsg_id: u32) -> RmResult<()> {
        log::trace!("sched: preempt tsg {}", tsg_id);
        self.runlist.preempt(gpu, tsg_id)
    }

    /// Timeout for a preempt wait.
    ///
    /// `manual` is the caller's timeout, capped; `None` uses the default.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a manual timeout of zero.
    pub fn preempt_timeout(&self, manual: Option<Microseconds>) -> RmResult<Microseconds> {
        match manual {
            None => Ok(self.preempt_timeout_us),
            Some(0) => Err(RmError::InvalidArgument),
            Some(us) => Ok(us.min(self.max_manual_timeout_us)),
        }
    }

    /// Poll until hardware acknowledges a preempt.
    ///
    /// Never called under a group lock. A control caller still holds the
    /// GPU lock and the object's lock for the whole wait.
    ///
    /// # Errors
    ///
    /// `Timeout` if the acknowledgment does not arrive in `timeout_us`.
    pub fn wait_preempt(
        &self,
        gpu: &GpuIdentity,
        tsg_id: u32,
        timeout_us: Microseconds,
    ) -> RmResult<()> {
        let deadline = Instant::now() + Duration::from_micros(timeout_us);
        let interval = Duration::from_micros(self.poll_interval_us);
        while self.runlist.preempt_pending(gpu, tsg_id) {
            if Instant::now() >= deadline {
                log::warn!("sched: preempt of tsg {} timed out after {}us", tsg_id, timeout_us);
                return Err(RmError::Timeout);
            }
            std::thread::sleep(interval);
        }
        Ok(())
    }

    /// Preempt with the default timeout and wait for it.
    ///
    /// # Errors
    ///
    /// As [`request_preempt`](Self::request_preempt) and
    /// [`wait_preempt`](Self::wait_preempt).
    pub fn preempt_and_wait(&self, gpu: &GpuIdentity, tsg_id: u32) -> RmResult<()> {
        self.request_preempt(gpu, tsg_id)?;
        self.wait_preempt(gpu, tsg_id, self.preempt_timeout_us)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{PreemptBehavior, SimGpu};
    use rm_cap::objects::EngineType;

    fn scheduler(sim: &Arc<SimGpu>, config: &ServerConfig) -> Scheduler {
        Scheduler::new(config, sim.clone())
    }

    #[test]
    fn test_reserve_rolls_back() {
        let sim = Arc::new(SimGpu::default());
        let config = ServerConfig {
            max_channels: 4,
            max_channels_per_group: 4,
            ..ServerConfig::default()
        };
        let sched = scheduler(&sim, &config);
        let (tsg, channels) = sched.reserve(3).unwrap();
        assert_eq!(channels, vec![0, 1, 2]);
        assert_eq!(sched.reserve(2), Err(RmError::ResourceExhausted));
        assert_eq!(sched.groups_in_use(), 1);
        assert_eq!(sched.channels_in_use(), 3);
        sched.release(tsg, &channels);
        assert_eq!(sched.groups_in_use(), 0);
        assert_eq!(sched.channels_in_use(), 0);
    }

    #[test]
    fn test_manual_timeout_capped() {
        let sim = Arc::new(SimGpu::default());
        let sched = scheduler(&sim, &ServerConfig::default());
        assert_eq!(sched.preempt_timeout(None), Ok(100_000));
        assert_eq!(sched.preempt_timeout(Some(5)), Ok(5));
        assert_eq!(sched.preempt_timeout(Some(u64::MAX)), Ok(1_000_000));
        assert_eq!(sched.preempt_timeout(Some(0)), Err(RmError::InvalidArgument));
    }

    #[test]
    fn test_wait_preempt_times_out() {
        let sim = Arc::new(SimGpu::default());
        let sched = scheduler(&sim, &ServerConfig::default());
        let gpu = GpuIdentity::broadcast(0, 1, 0);
        let state = ChannelGroupState::new(EngineType::Graphics, 0, vec![0], 64, false).unwrap();
        sched.commit_with(&gpu, &state, true).unwrap();

        sim.set_preempt_behavior(PreemptBehavior::Never);
        sched.request_preempt(&gpu, 0).unwrap();
        assert_eq!(sched.wait_preempt(&gpu, 0, 200), Err(RmError::Timeout));

        sim.set_preempt_behavior(PreemptBehavior::AfterPolls(3));
        sched.request_preempt(&gpu, 0).unwrap();
        assert_eq!(sched.wait_preempt(&gpu, 0, 1_000_000), Ok(()));
    }
}
