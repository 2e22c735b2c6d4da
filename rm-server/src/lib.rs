//! GPU Resource Server
//!
//! Owns every client's resource tree and runs allocation, free,
//! duplication, sharing, mapping and control calls against it.
//!
//! # Layout
//!
//! ```text
//! escape(blob) ──► RmServer ──► resource tables ──► Resource objects
//!                     │                                   │
//!                     └──► control dispatcher ◄───────────┘
//!                                 │
//!                                 ▼
//!                     Scheduler ──► Hal (runlist, registers, mapper)
//! ```
//!
//! # Modules
//!
//! - [`server`] - Client tables and entry points
//! - [`escape`] - Blob-based entry point for the host device layer
//! - [`control`] - Per-class export tables and control dispatch
//! - [`resource`] - Resource classes
//! - [`sched`] - TSG/channel id allocation and runlist commits
//! - [`hal`] - Hardware collaborator traits and the simulated GPU
//! - [`config`] - Server configuration
//! - [`logging`] - `log` backend
//!
//! # Quick Start
//!
//! ```ignore
//! let (server, _sim) = RmServer::simulated(ServerConfig::default())?;
//! let client = server.alloc_client(ClientInfo::user(pid, token))?;
//! let device = server.alloc_with(client, client, ResourceClass::Device, &mut DeviceAllocParams::default())?;
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod config;
pub mod control;
pub mod env;
pub mod escape;
pub mod hal;
pub mod logging;
pub mod resource;
pub mod sched;
pub mod server;

pub use config::ServerConfig;
pub use env::ServerEnv;
pub use hal::{Hal, PreemptBehavior, SimGpu};
pub use server::{ControlEvent, RmServer};
