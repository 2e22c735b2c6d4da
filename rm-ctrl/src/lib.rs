//! GPU Resource Control ABI
//!
//! Shared definitions for client-server communication. This crate is
//! `no_std`, so the same layouts serve the server and any client library.
//!
//! # Modules
//!
//! - [`cmd`] - Control command ids and per-command metadata
//! - [`params`] - Control parameter layouts
//! - [`allocation`] - Allocation parameter layouts
//! - [`escape`] - Escape (ioctl-equivalent) headers
//! - [`status`] - Status codes

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod allocation;
pub mod cmd;
pub mod escape;
pub mod params;
pub mod status;

pub use cmd::{CtrlCmd, CtrlFlags, CtrlInfo};
pub use escape::EscapeCmd;
pub use params::{decode, encode};
pub use status::Status;
