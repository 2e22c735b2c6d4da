//! Server configuration
//!
//! Limits and timing the server enforces. Defaults match the hardware the
//! simulated GPU models; an integration replaces them with values read from
//! the real device before constructing the server.

use rm_cap::objects::{Microseconds, TimesliceBounds};
use rm_cap::{RmError, RmResult};

/// Default preempt acknowledgment timeout (100ms).
pub const DEFAULT_PREEMPT_TIMEOUT_US: Microseconds = 100_000;

/// Longest timeout a caller may request with a manual preempt (1s).
pub const MAX_MANUAL_PREEMPT_TIMEOUT_US: Microseconds = 1_000_000;

/// Subcontexts per channel group.
pub const DEFAULT_MAX_SUBCONTEXTS: u32 = 64;

/// TPCs on the GPU.
pub const DEFAULT_NUM_TPCS: u32 = 256;

/// Server-wide configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Shortest accepted timeslice.
    pub timeslice_min_us: Microseconds,
    /// Longest accepted timeslice.
    pub timeslice_max_us: Microseconds,
    /// Preempt wait when the caller does not set a manual timeout.
    pub preempt_timeout_us: Microseconds,
    /// Cap on manual preempt timeouts.
    pub max_manual_preempt_timeout_us: Microseconds,
    /// Interval between preempt-completion polls.
    pub preempt_poll_interval_us: Microseconds,
    /// Channels one group may hold.
    pub max_channels_per_group: u32,
    /// TSG ids available on the runlist.
    pub max_channel_groups: u32,
    /// Channel ids available on the runlist.
    pub max_channels: u32,
    /// Subcontext ids per channel group.
    pub max_subcontexts: u32,
    /// TPCs on the GPU; bounds TPC partition table indices.
    pub num_tpcs: u32,
    /// Clients that may exist at once.
    pub max_clients: u32,
    /// Handles one client may hold.
    pub max_handles_per_client: u32,
    /// Forward scheduling controls to their internal variants.
    pub route_to_physical: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            timeslice_min_us: TimesliceBounds::HW.min_us,
            timeslice_max_us: TimesliceBounds::HW.max_us,
            preempt_timeout_us: DEFAULT_PREEMPT_TIMEOUT_US,
            max_manual_preempt_timeout_us: MAX_MANUAL_PREEMPT_TIMEOUT_US,
            preempt_poll_interval_us: 10,
            max_channels_per_group: 128,
            max_channel_groups: 512,
            max_channels: 4096,
            max_subcontexts: DEFAULT_MAX_SUBCONTEXTS,
            num_tpcs: DEFAULT_NUM_TPCS,
            max_clients: 1024,
            max_handles_per_client: 0x1_0000,
            route_to_physical: false,
        }
    }
}

impl ServerConfig {
    /// Timeslice bounds as a clamp helper.
    #[inline]
    #[must_use]
    pub const fn timeslice_bounds(&self) -> TimesliceBounds {
        TimesliceBounds {
            min_us: self.timeslice_min_us,
            max_us: self.timeslice_max_us,
        }
    }

    /// Check the configuration is self-consistent.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` naming nothing in particular; the offending field
    /// is logged.
    pub fn validate(&self) -> RmResult<()> {
        let checks: [(bool, &str); 9] = [
            (self.timeslice_min_us > 0, "timeslice_min_us"),
            (self.timeslice_min_us <= self.timeslice_max_us, "timeslice_max_us"),
            (self.preempt_timeout_us > 0, "preempt_timeout_us"),
            (
                self.max_manual_preempt_timeout_us > 0,
                "max_manual_preempt_timeout_us",
            ),
            (self.preempt_poll_interval_us > 0, "preempt_poll_interval_us"),
            (
                self.max_channels_per_group > 0 && self.max_channels_per_group <= self.max_channels,
                "max_channels_per_group",
            ),
            (self.max_subcontexts >= 2, "max_subcontexts"),
            (
                self.num_tpcs > 0 && self.num_tpcs <= u32::from(u16::MAX),
                "num_tpcs",
            ),
            (
                self.max_clients > 0 && self.max_clients <= rm_cap::Handle::MAX_CLIENTS,
                "max_clients",
            ),
        ];
        for (ok, field) in checks {
            if !ok {
                log::error!("config: invalid {}", field);
                return Err(RmError::InvalidArgument);
            }
        }
        Ok(())
    }
}
