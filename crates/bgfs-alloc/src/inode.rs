//! Inode slot allocation, inode record I/O and offline consistency checks.

use crate::AllocatorConfig;
use crate::bitmap::{self, find_free_run};
use crate::group::{FsGeometry, GroupDescTable};
use bgfs_block::BlockDevice;
use bgfs_error::{BgfsError, Result};
use bgfs_ondisk::{Inode, Superblock};
use bgfs_types::{BlockNumber, GroupNumber, InodeNumber, mode_is_dir};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Which counter a [`Discrepancy`] is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    FreeBlocks,
    FreeInodes,
    SuperblockFreeBlocks,
    SuperblockFreeInodes,
}

/// A recorded counter that disagrees with what the bitmaps say.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discrepancy {
    /// `None` for filesystem-wide totals.
    pub group: Option<u32>,
    pub kind: DiscrepancyKind,
    pub recorded: u64,
    pub actual: u64,
}

#[derive(Debug)]
pub struct InodeAllocator {
    config: AllocatorConfig,
    next_generation: u32,
}

impl InodeAllocator {
    /// `generation_seed` is the first generation number handed out.
    #[must_use]
    pub fn new(config: AllocatorConfig, generation_seed: u32) -> Self {
        Self {
            config,
            next_generation: generation_seed,
        }
    }

    /// Allocate an inode for a new object with `mode` under `parent`.
    ///
    /// Group choice: the parent's group when it has a free inode (and, for
    /// directories, no more than the average directory count); otherwise
    /// the group with the most free inodes among the next
    /// `inode_search_window` groups; otherwise the first group with a free
    /// inode scanning on from the parent's.
    pub fn allocate(
        &mut self,
        dev: &dyn BlockDevice,
        table: &mut GroupDescTable,
        parent: InodeNumber,
        mode: u16,
    ) -> Result<InodeNumber> {
        let geo = table.geometry().clone();
        let (parent_group, _) = geo.inode_to_group_index(parent).ok_or_else(|| {
            BgfsError::InvalidRange(format!("parent inode {} does not exist", parent.0))
        })?;
        let is_dir = mode_is_dir(mode);
        let preferred = self.choose_group(table, parent_group, is_dir)?;

        let groups = geo.group_count;
        let wrap = (0..groups).map(|i| GroupNumber((parent_group.0 + i) % groups));
        for group in preferred.into_iter().chain(wrap) {
            if table.locate(group)?.free_inodes_count == 0 {
                continue;
            }
            let Some(index) = first_usable_slot(&geo, table, group)? else {
                continue;
            };

            table.claim_inode(dev, group, index)?;
            if is_dir {
                table.adjust_used_dirs(dev, group, 1)?;
            }
            let ino = geo.inode_number(group, index);
            let now = unix_now();
            let record = Inode {
                mode,
                links_count: 1,
                generation: self.next_generation,
                atime: now,
                ctime: now,
                mtime: now,
                ..Inode::default()
            };
            self.next_generation = self.next_generation.wrapping_add(1);
            write_inode_record(dev, &geo, table, ino, &record, true)?;
            debug!(
                ino = ino.0,
                parent = parent.0,
                group = group.0,
                dir = is_dir,
                "inode_allocated"
            );
            return Ok(ino);
        }

        debug!(parent = parent.0, "inode_search_exhausted");
        Err(BgfsError::NoSpace)
    }

    fn choose_group(
        &self,
        table: &GroupDescTable,
        parent_group: GroupNumber,
        is_dir: bool,
    ) -> Result<Option<GroupNumber>> {
        let groups = table.group_count();
        let parent = table.locate(parent_group)?;
        let below_average_dirs =
            u64::from(parent.used_dirs_count) * u64::from(groups) <= table.used_dirs_total();
        if parent.free_inodes_count > 0 && (!is_dir || below_average_dirs) {
            return Ok(Some(parent_group));
        }

        let window = self.config.inode_search_window.clamp(1, groups);
        let mut best: Option<(GroupNumber, u32)> = None;
        for i in 0..window {
            let group = GroupNumber((parent_group.0 + i) % groups);
            let free = table.locate(group)?.free_inodes_count;
            if free > 0 && best.is_none_or(|(_, most)| free > most) {
                best = Some((group, free));
            }
        }
        Ok(best.map(|(group, _)| group))
    }

    /// Release `ino`: clear its bit, fix the counters and mark the record
    /// deleted.
    pub fn free(
        &mut self,
        dev: &dyn BlockDevice,
        table: &mut GroupDescTable,
        ino: InodeNumber,
    ) -> Result<()> {
        let geo = table.geometry().clone();
        let (group, index) = checked_inode(&geo, ino)?;
        if ino.0 < u64::from(geo.first_ino) {
            return Err(BgfsError::CorruptMetadata {
                block: inode_block(&geo, table, ino)?.0,
                detail: format!("attempt to free reserved inode {}", ino.0),
            });
        }

        let mut record = read_inode(dev, table, ino)?;
        table.release_inode(dev, group, index)?;
        if record.is_dir() {
            table.adjust_used_dirs(dev, group, -1)?;
        }
        record.dtime = unix_now().max(1);
        record.links_count = 0;
        write_inode_record(dev, &geo, table, ino, &record, false)?;
        debug!(ino = ino.0, group = group.0, "inode_freed");
        Ok(())
    }
}

fn checked_inode(geo: &FsGeometry, ino: InodeNumber) -> Result<(GroupNumber, u32)> {
    geo.inode_to_group_index(ino)
        .ok_or_else(|| BgfsError::CorruptMetadata {
            block: 0,
            detail: format!("inode {} out of range 1..={}", ino.0, geo.total_inodes),
        })
}

/// First free slot of `group` that is not a reserved inode.
fn first_usable_slot(
    geo: &FsGeometry,
    table: &GroupDescTable,
    group: GroupNumber,
) -> Result<Option<u32>> {
    let floor = if group.0 == 0 {
        geo.first_ino.saturating_sub(1)
    } else {
        0
    };
    let cap = geo.inodes_in_group(group);
    let found = find_free_run(table.inode_bitmap(group)?, cap, floor, 1);
    Ok(found.filter(|&idx| idx >= floor))
}

/// Sum of group free-inode counts.
#[must_use]
pub fn count_free(table: &GroupDescTable) -> u64 {
    table.free_inodes_total()
}

// ── Inode records ───────────────────────────────────────────────────────────

/// Block holding `ino`'s record.
fn inode_block(geo: &FsGeometry, table: &GroupDescTable, ino: InodeNumber) -> Result<BlockNumber> {
    Ok(inode_position(geo, table, ino)?.0)
}

fn inode_position(
    geo: &FsGeometry,
    table: &GroupDescTable,
    ino: InodeNumber,
) -> Result<(BlockNumber, usize)> {
    let (group, index) = checked_inode(geo, ino)?;
    let byte = u64::from(index) * u64::from(geo.inode_size);
    let bs = u64::from(geo.block_size);
    let table_start = u64::from(table.locate(group)?.inode_table);
    #[expect(clippy::cast_possible_truncation)]
    let offset = (byte % bs) as usize;
    Ok((BlockNumber(table_start + byte / bs), offset))
}

pub fn read_inode(dev: &dyn BlockDevice, table: &GroupDescTable, ino: InodeNumber) -> Result<Inode> {
    let geo = table.geometry();
    let (block, offset) = inode_position(geo, table, ino)?;
    let buf = dev.read_block(block)?;
    let end = offset + usize::from(geo.inode_size);
    Inode::parse_from_bytes(&buf.as_slice()[offset..end]).map_err(|e| BgfsError::CorruptMetadata {
        block: block.0,
        detail: format!("inode {}: {e}", ino.0),
    })
}

pub fn write_inode(
    dev: &dyn BlockDevice,
    table: &GroupDescTable,
    ino: InodeNumber,
    inode: &Inode,
) -> Result<()> {
    write_inode_record(dev, table.geometry(), table, ino, inode, false)
}

/// Patch `inode` into its slot; `fresh` zeroes the whole slot first.
fn write_inode_record(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    table: &GroupDescTable,
    ino: InodeNumber,
    inode: &Inode,
    fresh: bool,
) -> Result<()> {
    let (block, offset) = inode_position(geo, table, ino)?;
    let mut buf = dev.read_block(block)?.into_inner();
    let slot = &mut buf[offset..offset + usize::from(geo.inode_size)];
    if fresh {
        slot.fill(0);
    }
    inode
        .write_to_bytes(slot)
        .map_err(|e| BgfsError::Parse(e.to_string()))?;
    dev.write_block(block, &buf)
}

#[expect(clippy::cast_possible_truncation)]
fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as u32)
}

// ── Consistency check ───────────────────────────────────────────────────────

/// Recount every group's bitmaps from disk and compare with the on-disk
/// descriptors, then compare the descriptor sums with the superblock
/// totals in `sb`.
pub fn check_consistency(
    dev: &dyn BlockDevice,
    table: &GroupDescTable,
    sb: &Superblock,
) -> Result<Vec<Discrepancy>> {
    let geo = table.geometry();
    let descs = table.read_on_disk(dev)?;
    let mut found = Vec::new();
    let (mut block_sum, mut inode_sum) = (0_u64, 0_u64);

    for (g, desc) in (0_u32..).zip(&descs) {
        let group = GroupNumber(g);
        let blocks = dev.read_block(BlockNumber(u64::from(desc.block_bitmap)))?;
        let actual_blocks = bitmap::count_free(blocks.as_slice(), geo.blocks_in_group(group));
        let inodes = dev.read_block(BlockNumber(u64::from(desc.inode_bitmap)))?;
        let actual_inodes = bitmap::count_free(inodes.as_slice(), geo.inodes_in_group(group));

        for (kind, recorded, actual) in [
            (DiscrepancyKind::FreeBlocks, desc.free_blocks_count, actual_blocks),
            (DiscrepancyKind::FreeInodes, desc.free_inodes_count, actual_inodes),
        ] {
            if recorded != actual {
                found.push(Discrepancy {
                    group: Some(g),
                    kind,
                    recorded: u64::from(recorded),
                    actual: u64::from(actual),
                });
            }
        }
        block_sum += u64::from(desc.free_blocks_count);
        inode_sum += u64::from(desc.free_inodes_count);
    }

    for (kind, recorded, actual) in [
        (
            DiscrepancyKind::SuperblockFreeBlocks,
            u64::from(sb.free_blocks_count),
            block_sum,
        ),
        (
            DiscrepancyKind::SuperblockFreeInodes,
            u64::from(sb.free_inodes_count),
            inode_sum,
        ),
    ] {
        if recorded != actual {
            found.push(Discrepancy {
                group: None,
                kind,
                recorded,
                actual,
            });
        }
    }

    for d in &found {
        warn!(
            group = ?d.group,
            kind = ?d.kind,
            recorded = d.recorded,
            actual = d.actual,
            "consistency_discrepancy"
        );
    }
    Ok(found)
}
