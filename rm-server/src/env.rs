//! Shared server environment
//!
//! Configuration, hardware collaborators and the scheduler, as seen by
//! resource constructors, control handlers and destructors.

use std::sync::Arc;

use rm_cap::RmResult;

use crate::config::ServerConfig;
use crate::hal::Hal;
use crate::sched::Scheduler;

/// Everything a resource may reach outside itself.
pub struct ServerEnv {
    /// Validated configuration.
    pub config: ServerConfig,
    /// Hardware collaborators.
    pub hal: Hal,
    /// Runlist scheduling.
    pub sched: Arc<Scheduler>,
}

impl ServerEnv {
    /// Validate `config` and build the environment.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the configuration is inconsistent.
    pub fn new(config: ServerConfig, hal: Hal) -> RmResult<Self> {
        config.validate()?;
        let sched = Arc::new(Scheduler::new(&config, hal.runlist.clone()));
        Ok(Self { config, hal, sched })
    }
}
