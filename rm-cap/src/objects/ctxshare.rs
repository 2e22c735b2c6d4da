//! Subcontext configuration
//!
//! Per-subcontext state shared by every handle duplicated from one context
//! share: the TPC partition table and the CWD watermark.

use alloc::vec::Vec;

use super::channel_group::TpcPartitionMode;
use crate::{RmError, RmResult};

/// Maximum entries in a TPC partition table.
pub const MAX_TPC_PARTITION_ENTRIES: usize = 256;

/// How a context share picks its subcontext id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum SubctxFlags {
    /// Synchronous subcontext, lowest free id.
    #[default]
    Sync,
    /// Asynchronous subcontext, lowest free id.
    Async,
    /// Caller-chosen id.
    Specified(u32),
}

impl SubctxFlags {
    const SUBCONTEXT_MASK: u32 = 0x3;
    const SYNC: u32 = 0;
    const ASYNC: u32 = 1;
    const SPECIFIED: u32 = 2;

    /// Decode allocation flags; `subctx_id` is used for `SPECIFIED`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an unknown subcontext mode.
    pub const fn from_raw(flags: u32, subctx_id: u32) -> RmResult<Self> {
        match flags & Self::SUBCONTEXT_MASK {
            Self::SYNC => Ok(Self::Sync),
            Self::ASYNC => Ok(Self::Async),
            Self::SPECIFIED => Ok(Self::Specified(subctx_id)),
            _ => Err(RmError::InvalidArgument),
        }
    }

    /// Encode as allocation flags.
    #[must_use]
    pub const fn raw(self) -> u32 {
        match self {
            Self::Sync => Self::SYNC,
            Self::Async => Self::ASYNC,
            Self::Specified(_) => Self::SPECIFIED,
        }
    }

    /// Requested id, if the caller chose one.
    #[inline]
    #[must_use]
    pub const fn specified(self) -> Option<u32> {
        match self {
            Self::Specified(id) => Some(id),
            _ => None,
        }
    }
}

/// One TPC assignment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct TpcPartitionEntry {
    /// GPU-wide TPC index.
    pub global_tpc_index: u16,
    /// Local-memory block backing the TPC; zero when hardware assigns it.
    pub lmem_block_index: u16,
}

/// TPC partition table of a subcontext.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct TpcPartitionTable {
    entries: Vec<TpcPartitionEntry>,
}

impl TpcPartitionTable {
    /// Validate and build a table.
    ///
    /// # Parameters
    ///
    /// - `entries`: New table contents
    /// - `num_tpcs`: TPCs present on the GPU
    /// - `mode`: Partition mode of the owning channel group
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the table is longer than
    /// [`MAX_TPC_PARTITION_ENTRIES`], a TPC index is out of range, or an
    /// lmem block index is supplied while hardware assigns them.
    pub fn new(
        entries: &[TpcPartitionEntry],
        num_tpcs: u32,
        mode: TpcPartitionMode,
    ) -> RmResult<Self> {
        if entries.len() > MAX_TPC_PARTITION_ENTRIES {
            return Err(RmError::InvalidArgument);
        }
        for entry in entries {
            if u32::from(entry.global_tpc_index) >= num_tpcs {
                return Err(RmError::InvalidArgument);
            }
            if mode.hw_assigns_lmem() && entry.lmem_block_index != 0 {
                return Err(RmError::InvalidArgument);
            }
        }
        Ok(Self {
            entries: entries.to_vec(),
        })
    }

    /// Table contents.
    #[inline]
    #[must_use]
    pub fn entries(&self) -> &[TpcPartitionEntry] {
        &self.entries
    }

    /// Number of TPCs in use.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check whether the table is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Compute work distributor watermark.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CwdWatermark(u32);

impl CwdWatermark {
    /// Lowest accepted value.
    pub const MIN: u32 = 1;
    /// Value of a new subcontext.
    pub const DEFAULT: u32 = 2;
    /// Highest accepted value.
    pub const MAX: u32 = 256;

    /// Validate a watermark.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` outside `[MIN, MAX]`.
    pub const fn new(value: u32) -> RmResult<Self> {
        if value < Self::MIN || value > Self::MAX {
            return Err(RmError::InvalidArgument);
        }
        Ok(Self(value))
    }

    /// Get the value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl Default for CwdWatermark {
    fn default() -> Self {
        Self(Self::DEFAULT)
    }
}
