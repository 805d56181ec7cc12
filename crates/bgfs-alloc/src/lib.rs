#![forbid(unsafe_code)]
//! Block and inode allocation over block groups.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **Bitmap** ([`bitmap`]): raw bit manipulation, word-level free counts
//!    and free-run search, the group-indexed [`bitmap::BitmapArena`].
//! 2. **Group table** ([`group`]): cached descriptors, geometry, the sparse
//!    backup policy and write-through of bitmap + counter updates.
//! 3. **BlockAllocator** ([`block`]): goal-directed block allocation with
//!    per-inode preallocation windows.
//! 4. **InodeAllocator** ([`inode`]): parent-group inode placement, inode
//!    records and the offline consistency check.
//!
//! Callers serialize structural changes; nothing here locks.

pub mod bitmap;
pub mod block;
pub mod group;
pub mod inode;

pub use bitmap::{BitmapArena, BitmapError, count_free, find_free_run, set_range};
pub use block::{AllocStats, BlockAllocator, PreallocWindow};
pub use group::{FsGeometry, GroupDescTable, GroupLayout, is_sparse};
pub use inode::{Discrepancy, DiscrepancyKind, InodeAllocator, check_consistency};

use serde::{Deserialize, Serialize};

/// Policy knobs shared by the block and inode allocators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Extra blocks reserved behind a freshly searched block.
    pub prealloc_window: u32,
    /// Free blocks a non-goal group needs to be preferred.
    pub min_group_free: u32,
    /// Groups compared when the parent's group cannot take an inode.
    pub inode_search_window: u32,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            prealloc_window: 8,
            min_group_free: 16,
            inode_search_window: 8,
        }
    }
}
