//! GPU Resource Capabilities
//!
//! This crate provides the capability object model shared by the GPU
//! resource server and its clients.
//!
//! # Overview
//!
//! Every object a client can touch is a **resource**: a typed node in a
//! per-client ownership tree, addressed by a [`Handle`] and guarded by
//! [`AccessRights`]. A resource's class fixes, at compile time, the set of
//! [`Interface`]s it can be viewed through. Asking for an interface outside
//! that set is a query that answers "absent", never an error.
//!
//! # Core Types
//!
//! - [`Handle`]: Client-scoped resource name
//! - [`AccessRights`]: Per-handle permissions (read, write, dup, map, nice)
//! - [`ResourceClass`]: Numeric class id plus parent and interface rules
//! - [`InterfaceSet`]: Declared capability set of a class
//! - [`SharedRef`]: Handle-counted shared state with a last-release hook
//! - [`IdPool`]: Bitmap id allocator (TSG ids, subcontext ids, channels)
//!
//! # Object Types
//!
//! The [`objects`] module defines the resource kinds and the pure state
//! machines behind them:
//!
//! | Category | Types |
//! |----------|-------|
//! | Root | [`Client`] |
//! | Device | [`Device`], [`Subdevice`] |
//! | Memory | [`SystemMemory`], [`LocalMemory`], [`VaSpace`] |
//! | Scheduling | [`ChannelGroup`], [`ContextShare`] |
//!
//! [`Client`]: objects::Client
//! [`Device`]: objects::Device
//! [`Subdevice`]: objects::Subdevice
//! [`SystemMemory`]: objects::SystemMemory
//! [`LocalMemory`]: objects::LocalMemory
//! [`VaSpace`]: objects::VaSpace
//! [`ChannelGroup`]: objects::ChannelGroup
//! [`ContextShare`]: objects::ContextShare
//!
//! # Server Integration
//!
//! This crate defines object semantics; `rm-server` provides storage,
//! locking and hardware collaborators.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

mod class;
mod client;
mod error;
mod handle;
mod idpool;
pub mod objects;
mod rights;
pub mod share;
mod shared;

pub use class::{Interface, InterfaceSet, ResourceClass};
pub use client::{ClientInfo, Privilege};
pub use error::{RmError, RmResult};
pub use handle::Handle;
pub use idpool::IdPool;
pub use objects::ResourceKind;
pub use rights::AccessRights;
pub use shared::{InternalRef, LastRelease, SharedRef};
