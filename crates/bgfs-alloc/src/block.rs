//! Goal-directed block allocation with per-inode preallocation windows.
//!
//! A window is a run of blocks already marked in use on behalf of one inode
//! but not yet handed out. Sequential allocations (goal == window.next) are
//! served from it without touching the bitmaps; any other allocation for
//! that inode gives the unused blocks back first.

use crate::AllocatorConfig;
use crate::bitmap::{bitmap_get, find_free_run};
use crate::group::GroupDescTable;
use bgfs_block::BlockDevice;
use bgfs_error::{BgfsError, Result};
use bgfs_types::{BlockNumber, GroupNumber, InodeNumber};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, trace};

/// Reserved-but-unconsumed blocks cached for one inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreallocWindow {
    pub next: BlockNumber,
    pub count: u32,
}

/// Counters observable through [`BlockAllocator::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocStats {
    /// Bitmap searches performed (window hits do not search).
    pub bitmap_searches: u64,
    pub window_hits: u64,
    pub blocks_allocated: u64,
    pub blocks_freed: u64,
    pub windows_discarded: u64,
}

#[derive(Debug, Default)]
pub struct BlockAllocator {
    config: AllocatorConfig,
    windows: HashMap<InodeNumber, PreallocWindow>,
    stats: AllocStats,
}

impl BlockAllocator {
    #[must_use]
    pub fn new(config: AllocatorConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
            stats: AllocStats::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> AllocStats {
        self.stats
    }

    #[must_use]
    pub fn window(&self, owner: InodeNumber) -> Option<PreallocWindow> {
        self.windows.get(&owner).copied()
    }

    /// Blocks held in windows across all inodes.
    #[must_use]
    pub fn reserved_in_windows(&self) -> u64 {
        self.windows.values().map(|w| u64::from(w.count)).sum()
    }

    /// Allocate one block for `owner`, near `goal` when given.
    ///
    /// With `prealloc`, a fresh search also reserves up to
    /// `prealloc_window` free blocks directly following the granted one.
    pub fn allocate(
        &mut self,
        dev: &dyn BlockDevice,
        table: &mut GroupDescTable,
        owner: InodeNumber,
        goal: Option<BlockNumber>,
        prealloc: bool,
    ) -> Result<BlockNumber> {
        if let Some(block) = self.take_from_window(owner, goal) {
            self.stats.window_hits += 1;
            self.stats.blocks_allocated += 1;
            trace!(ino = owner.0, block = block.0, "prealloc_window_hit");
            return Ok(block);
        }

        self.release_window(dev, table, owner)?;

        let (group, offset) = self.search(table, goal)?;
        let geo = table.geometry();
        let cap = geo.blocks_in_group(group);
        let extra = if prealloc {
            let bitmap = table.block_bitmap(group)?;
            (1..=self.config.prealloc_window)
                .take_while(|&i| offset + i < cap && !bitmap_get(bitmap, offset + i))
                .count()
        } else {
            0
        };
        #[expect(clippy::cast_possible_truncation)]
        let extra = extra as u32;
        let block = geo.group_block_to_absolute(group, offset);

        table.claim_blocks(dev, group, offset, 1 + extra)?;
        if extra > 0 {
            self.windows.insert(
                owner,
                PreallocWindow {
                    next: BlockNumber(block.0 + 1),
                    count: extra,
                },
            );
        }
        self.stats.blocks_allocated += 1;
        debug!(
            ino = owner.0,
            group = group.0,
            block = block.0,
            prealloc = extra,
            "block_allocated"
        );
        Ok(block)
    }

    fn take_from_window(
        &mut self,
        owner: InodeNumber,
        goal: Option<BlockNumber>,
    ) -> Option<BlockNumber> {
        let goal = goal?;
        let window = self.windows.get_mut(&owner)?;
        if window.count == 0 || window.next != goal {
            return None;
        }
        let block = window.next;
        window.next = BlockNumber(block.0 + 1);
        window.count -= 1;
        if window.count == 0 {
            self.windows.remove(&owner);
        }
        Some(block)
    }

    /// Find one free block: the goal's group from the goal offset, then the
    /// following groups (wrapping), first those with at least
    /// `min_group_free` free blocks, then any with a free block.
    fn search(
        &mut self,
        table: &GroupDescTable,
        goal: Option<BlockNumber>,
    ) -> Result<(GroupNumber, u32)> {
        self.stats.bitmap_searches += 1;
        let geo = table.geometry();
        let groups = geo.group_count;
        let (goal_group, goal_offset) = goal
            .filter(|&b| geo.contains_block(b))
            .map_or((GroupNumber(0), 0), |b| geo.absolute_to_group_block(b));

        if let Some(offset) = find_in_group(table, goal_group, goal_offset)? {
            return Ok((goal_group, offset));
        }

        for threshold in [self.config.min_group_free.max(1), 1] {
            for step in 1..groups {
                let group = GroupNumber((goal_group.0 + step) % groups);
                if table.locate(group)?.free_blocks_count < threshold {
                    continue;
                }
                if let Some(offset) = find_in_group(table, group, 0)? {
                    trace!(goal = goal_group.0, group = group.0, threshold, "block_search_moved");
                    return Ok((group, offset));
                }
            }
        }

        debug!(goal_group = goal_group.0, "block_search_exhausted");
        Err(BgfsError::NoSpace)
    }

    /// Free `count` blocks starting at `start` on behalf of `owner`.
    ///
    /// The range may cross group boundaries. Every block is checked before
    /// any bitmap changes: a reserved metadata block or a block outside the
    /// data area is `CorruptMetadata`, and a block that is already free or
    /// still sits unconsumed in any preallocation window is `DoubleFree`.
    pub fn free(
        &mut self,
        dev: &dyn BlockDevice,
        table: &mut GroupDescTable,
        owner: InodeNumber,
        start: BlockNumber,
        count: u32,
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let segments = split_range(table, start, count)?;
        if let Some(block) = self.first_windowed(start, count) {
            return Err(BgfsError::DoubleFree { block });
        }
        for &(group, offset, len) in &segments {
            let bitmap = table.block_bitmap(group)?;
            for rel in offset..offset + len {
                let abs = table.geometry().group_block_to_absolute(group, rel);
                if table.is_reserved(group, rel) {
                    return Err(BgfsError::CorruptMetadata {
                        block: abs.0,
                        detail: "attempt to free reserved metadata block".into(),
                    });
                }
                if !bitmap_get(bitmap, rel) {
                    return Err(BgfsError::DoubleFree { block: abs.0 });
                }
            }
        }

        for (group, offset, len) in segments {
            table.release_blocks(dev, group, offset, len)?;
        }
        self.stats.blocks_freed += u64::from(count);
        debug!(ino = owner.0, start = start.0, count, "blocks_freed");
        Ok(())
    }

    /// Lowest block of `[start, start + count)` held in a live window.
    fn first_windowed(&self, start: BlockNumber, count: u32) -> Option<u64> {
        let end = start.0 + u64::from(count);
        self.windows
            .values()
            .filter_map(|w| {
                let lo = w.next.0.max(start.0);
                let hi = (w.next.0 + u64::from(w.count)).min(end);
                (lo < hi).then_some(lo)
            })
            .min()
    }

    /// Give back `owner`'s unused preallocated blocks (inode close).
    pub fn release_window(
        &mut self,
        dev: &dyn BlockDevice,
        table: &mut GroupDescTable,
        owner: InodeNumber,
    ) -> Result<()> {
        let Some(window) = self.windows.remove(&owner) else {
            return Ok(());
        };
        self.discard(dev, table, owner, window)
    }

    /// Give back every window (unmount).
    pub fn release_all(&mut self, dev: &dyn BlockDevice, table: &mut GroupDescTable) -> Result<()> {
        let mut windows: Vec<_> = self.windows.drain().collect();
        windows.sort_unstable_by_key(|(ino, _)| *ino);
        for (owner, window) in windows {
            self.discard(dev, table, owner, window)?;
        }
        Ok(())
    }

    fn discard(
        &mut self,
        dev: &dyn BlockDevice,
        table: &mut GroupDescTable,
        owner: InodeNumber,
        window: PreallocWindow,
    ) -> Result<()> {
        if window.count == 0 {
            return Ok(());
        }
        let (group, offset) = table.geometry().absolute_to_group_block(window.next);
        table.release_blocks(dev, group, offset, window.count)?;
        self.stats.windows_discarded += 1;
        trace!(
            ino = owner.0,
            next = window.next.0,
            count = window.count,
            "prealloc_window_discarded"
        );
        Ok(())
    }
}

fn find_in_group(table: &GroupDescTable, group: GroupNumber, start: u32) -> Result<Option<u32>> {
    if table.locate(group)?.free_blocks_count == 0 {
        return Ok(None);
    }
    let cap = table.geometry().blocks_in_group(group);
    Ok(find_free_run(table.block_bitmap(group)?, cap, start, 1))
}

/// Split an absolute range into per-group `(group, offset, len)` pieces.
fn split_range(
    table: &GroupDescTable,
    start: BlockNumber,
    count: u32,
) -> Result<Vec<(GroupNumber, u32, u32)>> {
    let geo = table.geometry();
    let end = start.0.checked_add(u64::from(count));
    if !geo.contains_block(start) || end.is_none_or(|end| end > geo.total_blocks) {
        return Err(BgfsError::CorruptMetadata {
            block: start.0,
            detail: format!("free of {count} blocks outside the data area"),
        });
    }

    let mut segments = Vec::new();
    let mut cursor = start;
    let mut left = count;
    while left > 0 {
        let (group, offset) = geo.absolute_to_group_block(cursor);
        let len = left.min(geo.blocks_in_group(group) - offset);
        segments.push((group, offset, len));
        cursor = BlockNumber(cursor.0 + u64::from(len));
        left -= len;
    }
    Ok(segments)
}
