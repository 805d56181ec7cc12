//! Group descriptor table, per-group layout and the sparse backup policy.
//!
//! The table owns the cached descriptors and both bitmap arenas. Every
//! mutation goes through [`GroupDescTable::claim_blocks`],
//! [`GroupDescTable::release_blocks`], [`GroupDescTable::claim_inode`],
//! [`GroupDescTable::release_inode`] or one of the `adjust_*` methods, which
//! update the bitmap and the matching counter together and then write the
//! bitmap block and the descriptor block through to the device.

use crate::bitmap::{BitmapArena, BitmapError, check_range, count_free, set_range};
use bgfs_block::BlockDevice;
use bgfs_error::{BgfsError, Result};
use bgfs_ondisk::{GroupDesc, Superblock, stamp_group_desc_checksum, verify_group_desc_checksum};
use bgfs_types::{
    BlockNumber, GROUP_DESC_SIZE, GroupNumber, InodeNumber, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE,
    group_index_to_inode,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

// ── Sparse policy ───────────────────────────────────────────────────────────

fn is_power_of(mut n: u32, base: u32) -> bool {
    while n > 1 && n % base == 0 {
        n /= base;
    }
    n == 1
}

/// Whether `group` is one of the sparse backup groups: 0, 1 and the powers
/// of 3, 5 and 7.
#[must_use]
pub fn is_sparse(group: GroupNumber) -> bool {
    let g = group.0;
    g <= 1 || is_power_of(g, 3) || is_power_of(g, 5) || is_power_of(g, 7)
}

// ── Filesystem geometry ─────────────────────────────────────────────────────

/// Cached filesystem geometry needed by the allocator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsGeometry {
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub block_size: u32,
    pub total_blocks: u64,
    pub total_inodes: u32,
    pub first_data_block: u32,
    pub group_count: u32,
    pub inode_size: u16,
    pub first_ino: u32,
    pub gdt_blocks: u32,
    pub sparse_super: bool,
}

impl FsGeometry {
    /// Derive geometry from a parsed superblock.
    #[must_use]
    pub fn from_superblock(sb: &Superblock) -> Self {
        Self {
            blocks_per_group: sb.blocks_per_group,
            inodes_per_group: sb.inodes_per_group,
            block_size: sb.block_size,
            total_blocks: u64::from(sb.blocks_count),
            total_inodes: sb.inodes_count,
            first_data_block: sb.first_data_block,
            group_count: sb.groups_count(),
            inode_size: sb.inode_size,
            first_ino: sb.first_ino,
            gdt_blocks: sb.gdt_blocks(),
            sparse_super: sb.has_sparse_super(),
        }
    }

    /// Number of blocks in a specific group (last group may be shorter).
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn blocks_in_group(&self, group: GroupNumber) -> u32 {
        let group_start = self.group_first_block(group).0;
        let remaining = self.total_blocks.saturating_sub(group_start);
        if remaining >= u64::from(self.blocks_per_group) {
            self.blocks_per_group
        } else {
            remaining as u32
        }
    }

    /// Number of inodes in a specific group (last group may be shorter).
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn inodes_in_group(&self, group: GroupNumber) -> u32 {
        let inode_start = u64::from(group.0) * u64::from(self.inodes_per_group);
        let remaining = u64::from(self.total_inodes).saturating_sub(inode_start);
        if remaining >= u64::from(self.inodes_per_group) {
            self.inodes_per_group
        } else {
            remaining as u32
        }
    }

    #[must_use]
    pub fn group_first_block(&self, group: GroupNumber) -> BlockNumber {
        self.group_block_to_absolute(group, 0)
    }

    /// Absolute block number for a relative block within a group.
    #[must_use]
    pub fn group_block_to_absolute(&self, group: GroupNumber, rel_block: u32) -> BlockNumber {
        let abs = u64::from(self.first_data_block)
            + u64::from(group.0) * u64::from(self.blocks_per_group)
            + u64::from(rel_block);
        BlockNumber(abs)
    }

    /// Convert absolute block to (group, relative_block).
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn absolute_to_group_block(&self, block: BlockNumber) -> (GroupNumber, u32) {
        let rel = block.0.saturating_sub(u64::from(self.first_data_block));
        let group = (rel / u64::from(self.blocks_per_group)) as u32;
        let offset = (rel % u64::from(self.blocks_per_group)) as u32;
        (GroupNumber(group), offset)
    }

    /// Whether `block` lies in the group-managed data area.
    #[must_use]
    pub fn contains_block(&self, block: BlockNumber) -> bool {
        block.0 >= u64::from(self.first_data_block) && block.0 < self.total_blocks
    }

    /// Split an inode number into (group, index within group).
    ///
    /// Returns `None` for inode 0 and numbers past the inode count.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn inode_to_group_index(&self, ino: InodeNumber) -> Option<(GroupNumber, u32)> {
        if ino.0 == 0 || ino.0 > u64::from(self.total_inodes) {
            return None;
        }
        let zero = ino.0 - 1;
        let ipg = u64::from(self.inodes_per_group);
        Some((GroupNumber((zero / ipg) as u32), (zero % ipg) as u32))
    }

    #[must_use]
    pub fn inode_number(&self, group: GroupNumber, index: u32) -> InodeNumber {
        group_index_to_inode(group, index, self.inodes_per_group)
    }

    /// Blocks occupied by one group's inode table.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn inode_table_blocks(&self) -> u32 {
        (u64::from(self.inodes_per_group) * u64::from(self.inode_size))
            .div_ceil(u64::from(self.block_size)) as u32
    }

    /// Whether `group` carries a superblock and descriptor table copy.
    #[must_use]
    pub fn has_backup(&self, group: GroupNumber) -> bool {
        !self.sparse_super || is_sparse(group)
    }

    /// Block of the primary group descriptor table.
    #[must_use]
    pub fn gdt_block(&self) -> BlockNumber {
        BlockNumber(u64::from(self.first_data_block) + 1)
    }

    /// Block holding `group`'s superblock copy and the byte offset inside it.
    ///
    /// The primary always sits at byte 1024 of the device; backups start at
    /// the first block of their group.
    #[must_use]
    pub fn superblock_location(&self, group: GroupNumber) -> (BlockNumber, usize) {
        if group.0 == 0 {
            let bs = self.block_size as usize;
            (BlockNumber((SUPERBLOCK_OFFSET / bs) as u64), SUPERBLOCK_OFFSET % bs)
        } else {
            (self.group_first_block(group), 0)
        }
    }

    /// Metadata placement used when formatting: optional superblock and
    /// descriptor copies, then block bitmap, inode bitmap and inode table.
    #[must_use]
    pub fn planned_layout(&self, group: GroupNumber) -> GroupLayout {
        let first = self.group_first_block(group);
        let backup = self.has_backup(group);
        let meta_start = if backup {
            first.0 + 1 + u64::from(self.gdt_blocks)
        } else {
            first.0
        };
        GroupLayout {
            group,
            first_block: first,
            block_count: self.blocks_in_group(group),
            superblock: backup.then_some(first),
            gdt_start: backup.then_some(BlockNumber(first.0 + 1)),
            gdt_blocks: if backup { self.gdt_blocks } else { 0 },
            block_bitmap: BlockNumber(meta_start),
            inode_bitmap: BlockNumber(meta_start + 1),
            inode_table: BlockNumber(meta_start + 2),
            inode_table_blocks: self.inode_table_blocks(),
        }
    }
}

// ── Group layout ────────────────────────────────────────────────────────────

/// Where one group's metadata lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupLayout {
    pub group: GroupNumber,
    pub first_block: BlockNumber,
    pub block_count: u32,
    pub superblock: Option<BlockNumber>,
    pub gdt_start: Option<BlockNumber>,
    pub gdt_blocks: u32,
    pub block_bitmap: BlockNumber,
    pub inode_bitmap: BlockNumber,
    pub inode_table: BlockNumber,
    pub inode_table_blocks: u32,
}

impl GroupLayout {
    /// Layout of a mounted group: backup placement from the sparse policy,
    /// bitmap and inode table locations from its descriptor.
    #[must_use]
    pub fn from_desc(geo: &FsGeometry, group: GroupNumber, desc: &GroupDesc) -> Self {
        Self {
            block_bitmap: BlockNumber(u64::from(desc.block_bitmap)),
            inode_bitmap: BlockNumber(u64::from(desc.inode_bitmap)),
            inode_table: BlockNumber(u64::from(desc.inode_table)),
            ..geo.planned_layout(group)
        }
    }

    /// Sorted relative offsets of blocks that hold metadata and must never
    /// be allocated or freed.
    #[must_use]
    pub fn reserved_blocks(&self) -> Vec<u32> {
        let start = self.first_block.0;
        let end = start + u64::from(self.block_count);
        let mut reserved = Vec::new();

        let mut add_abs = |abs: u64| {
            if (start..end).contains(&abs) {
                #[expect(clippy::cast_possible_truncation)]
                reserved.push((abs - start) as u32);
            }
        };

        if let Some(sb) = self.superblock {
            add_abs(sb.0);
        }
        if let Some(gdt) = self.gdt_start {
            for i in 0..u64::from(self.gdt_blocks) {
                add_abs(gdt.0 + i);
            }
        }
        add_abs(self.block_bitmap.0);
        add_abs(self.inode_bitmap.0);
        for i in 0..u64::from(self.inode_table_blocks) {
            add_abs(self.inode_table.0 + i);
        }

        reserved.sort_unstable();
        reserved.dedup();
        reserved
    }

    /// Whether every metadata block lies inside this group.
    #[must_use]
    pub fn metadata_in_bounds(&self) -> bool {
        let start = self.first_block.0;
        let end = start + u64::from(self.block_count);
        let inside = |b: u64| (start..end).contains(&b);
        inside(self.block_bitmap.0)
            && inside(self.inode_bitmap.0)
            && inside(self.inode_table.0)
            && self.inode_table.0 + u64::from(self.inode_table_blocks) <= end
    }
}

// ── Descriptor table ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resource {
    Blocks,
    Inodes,
}

impl Resource {
    fn name(self) -> &'static str {
        match self {
            Self::Blocks => "block",
            Self::Inodes => "inode",
        }
    }
}

/// In-memory descriptor cache plus the block and inode bitmaps of every
/// group.
#[derive(Debug, Clone)]
pub struct GroupDescTable {
    geo: FsGeometry,
    descs: Vec<GroupDesc>,
    reserved: Vec<Vec<u32>>,
    block_bitmaps: BitmapArena,
    inode_bitmaps: BitmapArena,
    csum_seed: Option<u32>,
}

impl GroupDescTable {
    /// Lay out fresh group metadata for `sb` and write it to `dev`.
    ///
    /// Metadata blocks, bitmap padding and the reserved inodes
    /// `1..first_ino` are marked in use; everything else starts free.
    pub fn initialize(dev: &dyn BlockDevice, sb: &Superblock) -> Result<Self> {
        let geo = FsGeometry::from_superblock(sb);
        check_device(dev, &geo)?;

        let stride = geo.block_size as usize;
        let bits_per_block = geo.block_size * 8;
        let mut block_bitmaps = BitmapArena::new(geo.group_count, stride);
        let mut inode_bitmaps = BitmapArena::new(geo.group_count, stride);
        let mut descs = Vec::with_capacity(geo.group_count as usize);
        let mut reserved = Vec::with_capacity(geo.group_count as usize);

        let reserved_inodes = geo.first_ino.saturating_sub(1);
        if reserved_inodes >= geo.inodes_per_group {
            return Err(BgfsError::InvalidGeometry(format!(
                "{reserved_inodes} reserved inodes do not fit in a group of {}",
                geo.inodes_per_group
            )));
        }

        for g in 0..geo.group_count {
            let group = GroupNumber(g);
            let layout = geo.planned_layout(group);
            let blocks = geo.blocks_in_group(group);
            let inodes = geo.inodes_in_group(group);
            let offsets = layout.reserved_blocks();
            if !layout.metadata_in_bounds() || offsets.len() >= blocks as usize {
                return Err(BgfsError::InvalidGeometry(format!(
                    "group {g} has {blocks} blocks, too few for its metadata"
                )));
            }

            let bbm = block_bitmaps.group_mut(group).ok_or_else(|| arena_gap(group))?;
            for &off in &offsets {
                crate::bitmap::bitmap_set(bbm, off);
            }
            set_range(bbm, bits_per_block, blocks, bits_per_block - blocks, true, false)
                .map_err(|e| geometry_error(group, e))?;
            let free_blocks = count_free(bbm, blocks);

            let ibm = inode_bitmaps.group_mut(group).ok_or_else(|| arena_gap(group))?;
            set_range(ibm, bits_per_block, inodes, bits_per_block - inodes, true, false)
                .map_err(|e| geometry_error(group, e))?;
            if g == 0 {
                set_range(ibm, inodes, 0, reserved_inodes, true, false)
                    .map_err(|e| geometry_error(group, e))?;
            }
            let free_inodes = count_free(ibm, inodes);

            descs.push(GroupDesc {
                block_bitmap: block_u32(layout.block_bitmap)?,
                inode_bitmap: block_u32(layout.inode_bitmap)?,
                inode_table: block_u32(layout.inode_table)?,
                free_blocks_count: free_blocks,
                free_inodes_count: free_inodes,
                used_dirs_count: 0,
                flags: 0,
                itable_unused: 0,
                checksum: 0,
            });
            reserved.push(offsets);
        }

        let table = Self {
            csum_seed: sb.has_metadata_csum().then(|| sb.csum_seed()),
            geo,
            descs,
            reserved,
            block_bitmaps,
            inode_bitmaps,
        };
        table.write_all(dev)?;
        debug!(
            groups = table.geo.group_count,
            free_blocks = table.free_blocks_total(),
            free_inodes = table.free_inodes_total(),
            "group_table_initialized"
        );
        Ok(table)
    }

    /// Read and validate the descriptor table and every bitmap.
    pub fn load(dev: &dyn BlockDevice, sb: &Superblock) -> Result<Self> {
        let geo = FsGeometry::from_superblock(sb);
        check_device(dev, &geo)?;

        let csum_seed = sb.has_metadata_csum().then(|| sb.csum_seed());
        let raw = read_gdt_raw(dev, &geo)?;
        let stride = geo.block_size as usize;
        let mut block_bitmaps = BitmapArena::new(geo.group_count, stride);
        let mut inode_bitmaps = BitmapArena::new(geo.group_count, stride);
        let mut descs = Vec::with_capacity(geo.group_count as usize);
        let mut reserved = Vec::with_capacity(geo.group_count as usize);

        for g in 0..geo.group_count {
            let group = GroupNumber(g);
            let desc_block = desc_block_of(&geo, group);
            let off = g as usize * GROUP_DESC_SIZE;
            let bytes = &raw[off..off + GROUP_DESC_SIZE];
            if let Some(seed) = csum_seed {
                verify_group_desc_checksum(bytes, seed, g).map_err(|e| {
                    BgfsError::CorruptMetadata {
                        block: desc_block.0,
                        detail: format!("group {g}: {e}"),
                    }
                })?;
            }
            let desc = GroupDesc::parse_from_bytes(bytes).map_err(|e| BgfsError::CorruptMetadata {
                block: desc_block.0,
                detail: format!("group {g}: {e}"),
            })?;
            let layout = GroupLayout::from_desc(&geo, group, &desc);
            validate_desc(&geo, &layout, &desc).map_err(|detail| BgfsError::CorruptMetadata {
                block: desc_block.0,
                detail: format!("group {g}: {detail}"),
            })?;

            let bbm = dev.read_block(layout.block_bitmap)?;
            block_bitmaps
                .group_mut(group)
                .ok_or_else(|| arena_gap(group))?
                .copy_from_slice(bbm.as_slice());
            let ibm = dev.read_block(layout.inode_bitmap)?;
            inode_bitmaps
                .group_mut(group)
                .ok_or_else(|| arena_gap(group))?
                .copy_from_slice(ibm.as_slice());

            reserved.push(layout.reserved_blocks());
            descs.push(desc);
        }

        debug!(groups = geo.group_count, csum = csum_seed.is_some(), "group_table_loaded");
        Ok(Self {
            geo,
            descs,
            reserved,
            block_bitmaps,
            inode_bitmaps,
            csum_seed,
        })
    }

    // ── Accessors ───────────────────────────────────────────────────────

    #[must_use]
    pub fn geometry(&self) -> &FsGeometry {
        &self.geo
    }

    #[must_use]
    pub fn group_count(&self) -> u32 {
        self.geo.group_count
    }

    #[must_use]
    pub fn descriptors(&self) -> &[GroupDesc] {
        &self.descs
    }

    /// Cached descriptor of `group`.
    pub fn locate(&self, group: GroupNumber) -> Result<&GroupDesc> {
        self.descs
            .get(group.0 as usize)
            .ok_or_else(|| BgfsError::CorruptMetadata {
                block: self.geo.gdt_block().0,
                detail: format!(
                    "group {} out of range ({} groups)",
                    group.0, self.geo.group_count
                ),
            })
    }

    pub fn layout(&self, group: GroupNumber) -> Result<GroupLayout> {
        let desc = self.locate(group)?;
        Ok(GroupLayout::from_desc(&self.geo, group, desc))
    }

    pub fn block_bitmap(&self, group: GroupNumber) -> Result<&[u8]> {
        self.locate(group)?;
        self.block_bitmaps.group(group).ok_or_else(|| arena_gap(group))
    }

    pub fn inode_bitmap(&self, group: GroupNumber) -> Result<&[u8]> {
        self.locate(group)?;
        self.inode_bitmaps.group(group).ok_or_else(|| arena_gap(group))
    }

    /// Whether relative block `offset` of `group` holds metadata.
    #[must_use]
    pub fn is_reserved(&self, group: GroupNumber, offset: u32) -> bool {
        self.reserved
            .get(group.0 as usize)
            .is_some_and(|r| r.binary_search(&offset).is_ok())
    }

    #[must_use]
    pub fn csum_seed(&self) -> Option<u32> {
        self.csum_seed
    }

    #[must_use]
    pub fn free_blocks_total(&self) -> u64 {
        self.descs.iter().map(|d| u64::from(d.free_blocks_count)).sum()
    }

    #[must_use]
    pub fn free_inodes_total(&self) -> u64 {
        self.descs.iter().map(|d| u64::from(d.free_inodes_count)).sum()
    }

    #[must_use]
    pub fn used_dirs_total(&self) -> u64 {
        self.descs.iter().map(|d| u64::from(d.used_dirs_count)).sum()
    }

    // ── Counter adjustment ──────────────────────────────────────────────

    pub fn adjust_free_blocks(
        &mut self,
        dev: &dyn BlockDevice,
        group: GroupNumber,
        delta: i64,
    ) -> Result<()> {
        let cap = self.geo.blocks_in_group(group);
        let desc = self.desc_mut(group)?;
        desc.free_blocks_count = adjusted(group, desc.free_blocks_count, delta, cap, "free blocks")?;
        self.persist_desc(dev, group)
    }

    pub fn adjust_free_inodes(
        &mut self,
        dev: &dyn BlockDevice,
        group: GroupNumber,
        delta: i64,
    ) -> Result<()> {
        let cap = self.geo.inodes_in_group(group);
        let desc = self.desc_mut(group)?;
        desc.free_inodes_count = adjusted(group, desc.free_inodes_count, delta, cap, "free inodes")?;
        self.persist_desc(dev, group)
    }

    pub fn adjust_used_dirs(
        &mut self,
        dev: &dyn BlockDevice,
        group: GroupNumber,
        delta: i64,
    ) -> Result<()> {
        let cap = self.geo.inodes_in_group(group);
        let desc = self.desc_mut(group)?;
        desc.used_dirs_count = adjusted(group, desc.used_dirs_count, delta, cap, "directories")?;
        self.persist_desc(dev, group)
    }

    // ── Bitmap + counter units ──────────────────────────────────────────

    /// Mark `count` blocks at relative `offset` of `group` in use.
    pub fn claim_blocks(
        &mut self,
        dev: &dyn BlockDevice,
        group: GroupNumber,
        offset: u32,
        count: u32,
    ) -> Result<()> {
        self.apply(dev, Resource::Blocks, group, offset, count, true)
    }

    /// Mark `count` blocks at relative `offset` of `group` free.
    ///
    /// Fails with `DoubleFree` if any of them is already free.
    pub fn release_blocks(
        &mut self,
        dev: &dyn BlockDevice,
        group: GroupNumber,
        offset: u32,
        count: u32,
    ) -> Result<()> {
        self.apply(dev, Resource::Blocks, group, offset, count, false)
    }

    pub fn claim_inode(&mut self, dev: &dyn BlockDevice, group: GroupNumber, index: u32) -> Result<()> {
        self.apply(dev, Resource::Inodes, group, index, 1, true)
    }

    /// Fails with `AlreadyFree` if the inode bit is already clear.
    pub fn release_inode(
        &mut self,
        dev: &dyn BlockDevice,
        group: GroupNumber,
        index: u32,
    ) -> Result<()> {
        self.apply(dev, Resource::Inodes, group, index, 1, false)
    }

    fn apply(
        &mut self,
        dev: &dyn BlockDevice,
        resource: Resource,
        group: GroupNumber,
        index: u32,
        count: u32,
        claim: bool,
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let gidx = self.locate(group).map(|_| group.0 as usize)?;
        let geo = &self.geo;
        let (cap, arena, current, bitmap_block) = match resource {
            Resource::Blocks => (
                geo.blocks_in_group(group),
                &mut self.block_bitmaps,
                self.descs[gidx].free_blocks_count,
                self.descs[gidx].block_bitmap,
            ),
            Resource::Inodes => (
                geo.inodes_in_group(group),
                &mut self.inode_bitmaps,
                self.descs[gidx].free_inodes_count,
                self.descs[gidx].inode_bitmap,
            ),
        };
        let bitmap = arena.group_mut(group).ok_or_else(|| arena_gap(group))?;

        check_range(bitmap, cap, index, count, claim, true)
            .map_err(|e| bitmap_failure(geo, resource, group, claim, e))?;
        let delta = if claim {
            -i64::from(count)
        } else {
            i64::from(count)
        };
        let updated = adjusted(group, current, delta, cap, resource.name())?;
        set_range(bitmap, cap, index, count, claim, false)
            .map_err(|e| bitmap_failure(geo, resource, group, claim, e))?;
        dev.write_block(BlockNumber(u64::from(bitmap_block)), bitmap)?;

        match resource {
            Resource::Blocks => self.descs[gidx].free_blocks_count = updated,
            Resource::Inodes => self.descs[gidx].free_inodes_count = updated,
        }
        trace!(
            group = group.0,
            resource = resource.name(),
            index,
            count,
            claim,
            free = updated,
            "bitmap_update"
        );
        self.persist_desc(dev, group)
    }

    // ── Persistence ─────────────────────────────────────────────────────

    fn desc_mut(&mut self, group: GroupNumber) -> Result<&mut GroupDesc> {
        self.locate(group)?;
        self.descs
            .get_mut(group.0 as usize)
            .ok_or_else(|| arena_gap(group))
    }

    /// Encode `group`'s descriptor into its GDT block and write it back.
    ///
    /// Reads the block first so bytes this table does not model survive.
    fn persist_desc(&self, dev: &dyn BlockDevice, group: GroupNumber) -> Result<()> {
        let block = desc_block_of(&self.geo, group);
        let offset = desc_offset_in_block(&self.geo, group);
        let mut buf = dev.read_block(block)?.into_inner();
        self.encode_desc(group, &mut buf[offset..offset + GROUP_DESC_SIZE])?;
        dev.write_block(block, &buf)
    }

    fn encode_desc(&self, group: GroupNumber, out: &mut [u8]) -> Result<()> {
        let desc = self.locate(group)?;
        desc.write_to_bytes(out).map_err(|e| BgfsError::Inconsistent {
            group: group.0,
            detail: format!("descriptor does not encode: {e}"),
        })?;
        if let Some(seed) = self.csum_seed {
            stamp_group_desc_checksum(out, seed, group.0)
                .map_err(|e| BgfsError::Parse(e.to_string()))?;
        }
        Ok(())
    }

    /// Write every bitmap, zeroed inode tables and the primary GDT.
    fn write_all(&self, dev: &dyn BlockDevice) -> Result<()> {
        let bs = self.geo.block_size as usize;
        let zero = vec![0_u8; bs];
        for g in 0..self.geo.group_count {
            let group = GroupNumber(g);
            let layout = self.layout(group)?;
            dev.write_block(layout.block_bitmap, self.block_bitmap(group)?)?;
            dev.write_block(layout.inode_bitmap, self.inode_bitmap(group)?)?;
            for i in 0..u64::from(layout.inode_table_blocks) {
                dev.write_block(BlockNumber(layout.inode_table.0 + i), &zero)?;
            }
        }

        let mut gdt = vec![0_u8; self.geo.gdt_blocks as usize * bs];
        for g in 0..self.geo.group_count {
            let off = g as usize * GROUP_DESC_SIZE;
            self.encode_desc(GroupNumber(g), &mut gdt[off..off + GROUP_DESC_SIZE])?;
        }
        let start = self.geo.gdt_block();
        for (i, chunk) in gdt.chunks(bs).enumerate() {
            dev.write_block(BlockNumber(start.0 + i as u64), chunk)?;
        }
        Ok(())
    }

    /// Re-read the descriptors currently on disk (no checksum validation).
    pub fn read_on_disk(&self, dev: &dyn BlockDevice) -> Result<Vec<GroupDesc>> {
        let raw = read_gdt_raw(dev, &self.geo)?;
        (0..self.geo.group_count)
            .map(|g| {
                let off = g as usize * GROUP_DESC_SIZE;
                GroupDesc::parse_from_bytes(&raw[off..off + GROUP_DESC_SIZE]).map_err(|e| {
                    BgfsError::CorruptMetadata {
                        block: desc_block_of(&self.geo, GroupNumber(g)).0,
                        detail: format!("group {g}: {e}"),
                    }
                })
            })
            .collect()
    }

    /// Copy the superblock and the primary GDT into every backup group.
    ///
    /// `primary_region` supplies the bytes of the superblock that
    /// [`Superblock`] does not model. Returns the number of backups written.
    pub fn sync_backups(
        &self,
        dev: &dyn BlockDevice,
        sb: &Superblock,
        primary_region: &[u8; SUPERBLOCK_SIZE],
    ) -> Result<u32> {
        let gdt = read_gdt_raw(dev, &self.geo)?;
        let bs = self.geo.block_size as usize;
        let mut written = 0;

        for g in 1..self.geo.group_count {
            let group = GroupNumber(g);
            if !self.geo.has_backup(group) {
                continue;
            }
            let layout = self.layout(group)?;
            let (sb_block, offset) = self.geo.superblock_location(group);

            let mut copy = sb.clone();
            #[expect(clippy::cast_possible_truncation)]
            let group_nr = g as u16;
            copy.block_group_nr = group_nr;
            let mut buf = dev.read_block(sb_block)?.into_inner();
            let region = &mut buf[offset..offset + SUPERBLOCK_SIZE];
            region.copy_from_slice(primary_region);
            copy.write_to_region(region)
                .map_err(|e| BgfsError::Parse(e.to_string()))?;
            dev.write_block(sb_block, &buf)?;

            if let Some(start) = layout.gdt_start {
                for (i, chunk) in gdt.chunks(bs).enumerate() {
                    dev.write_block(BlockNumber(start.0 + i as u64), chunk)?;
                }
            }
            written += 1;
        }
        debug!(backups = written, "backups_synced");
        Ok(written)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

fn check_device(dev: &dyn BlockDevice, geo: &FsGeometry) -> Result<()> {
    if dev.block_size() != geo.block_size {
        return Err(BgfsError::InvalidGeometry(format!(
            "device block size {} does not match filesystem block size {}",
            dev.block_size(),
            geo.block_size
        )));
    }
    if dev.block_count() < geo.total_blocks {
        return Err(BgfsError::InvalidGeometry(format!(
            "device has {} blocks, filesystem needs {}",
            dev.block_count(),
            geo.total_blocks
        )));
    }
    Ok(())
}

fn desc_block_of(geo: &FsGeometry, group: GroupNumber) -> BlockNumber {
    let per_block = geo.block_size as usize / GROUP_DESC_SIZE;
    BlockNumber(geo.gdt_block().0 + (group.0 as usize / per_block) as u64)
}

fn desc_offset_in_block(geo: &FsGeometry, group: GroupNumber) -> usize {
    let per_block = geo.block_size as usize / GROUP_DESC_SIZE;
    (group.0 as usize % per_block) * GROUP_DESC_SIZE
}

/// All primary GDT blocks concatenated.
fn read_gdt_raw(dev: &dyn BlockDevice, geo: &FsGeometry) -> Result<Vec<u8>> {
    let start = geo.gdt_block();
    let mut raw = Vec::with_capacity(geo.gdt_blocks as usize * geo.block_size as usize);
    for i in 0..u64::from(geo.gdt_blocks) {
        raw.extend_from_slice(dev.read_block(BlockNumber(start.0 + i))?.as_slice());
    }
    Ok(raw)
}

/// Shape checks applied to each descriptor at load time.
fn validate_desc(
    geo: &FsGeometry,
    layout: &GroupLayout,
    desc: &GroupDesc,
) -> std::result::Result<(), String> {
    if !layout.metadata_in_bounds() {
        return Err(format!(
            "bitmaps at {}/{} or inode table at {} outside group blocks {}..{}",
            layout.block_bitmap.0,
            layout.inode_bitmap.0,
            layout.inode_table.0,
            layout.first_block.0,
            layout.first_block.0 + u64::from(layout.block_count)
        ));
    }
    let blocks = geo.blocks_in_group(layout.group);
    let inodes = geo.inodes_in_group(layout.group);
    if desc.free_blocks_count > blocks {
        return Err(format!(
            "free block count {} exceeds capacity {blocks}",
            desc.free_blocks_count
        ));
    }
    if desc.free_inodes_count > inodes {
        return Err(format!(
            "free inode count {} exceeds capacity {inodes}",
            desc.free_inodes_count
        ));
    }
    if desc.used_dirs_count > inodes {
        return Err(format!(
            "directory count {} exceeds capacity {inodes}",
            desc.used_dirs_count
        ));
    }
    Ok(())
}

/// `current + delta`, rejected if it leaves `0..=cap`.
fn adjusted(group: GroupNumber, current: u32, delta: i64, cap: u32, what: &str) -> Result<u32> {
    let next = i64::from(current) + delta;
    u32::try_from(next)
        .ok()
        .filter(|&n| n <= cap)
        .ok_or_else(|| BgfsError::Inconsistent {
            group: group.0,
            detail: format!("{what} count {current} {delta:+} leaves 0..={cap}"),
        })
}

fn bitmap_failure(
    geo: &FsGeometry,
    resource: Resource,
    group: GroupNumber,
    claim: bool,
    err: BitmapError,
) -> BgfsError {
    match (err, resource, claim) {
        (BitmapError::Conflict { bit }, Resource::Blocks, false) => BgfsError::DoubleFree {
            block: geo.group_block_to_absolute(group, bit).0,
        },
        (BitmapError::Conflict { bit }, Resource::Inodes, false) => BgfsError::AlreadyFree {
            ino: geo.inode_number(group, bit).0,
        },
        (BitmapError::Conflict { bit }, _, true) => BgfsError::Inconsistent {
            group: group.0,
            detail: format!("{} {bit} already in use", resource.name()),
        },
        (BitmapError::OutOfRange { .. }, _, _) => BgfsError::CorruptMetadata {
            block: geo.group_first_block(group).0,
            detail: format!("group {}: {err}", group.0),
        },
    }
}

fn geometry_error(group: GroupNumber, err: BitmapError) -> BgfsError {
    BgfsError::InvalidGeometry(format!("group {}: {err}", group.0))
}

fn arena_gap(group: GroupNumber) -> BgfsError {
    BgfsError::Inconsistent {
        group: group.0,
        detail: "no bitmap slot for group".into(),
    }
}

fn block_u32(block: BlockNumber) -> Result<u32> {
    u32::try_from(block.0)
        .map_err(|_| BgfsError::InvalidGeometry(format!("block {} exceeds 32 bits", block.0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::bitmap_get;
    use crate::testutil::{fresh_table, test_superblock};
    use bgfs_block::{ByteBlockDevice, MemByteDevice};

    #[test]
    fn sparse_policy_selects_zero_one_and_powers() {
        let sparse: Vec<u32> = (0..130).filter(|&g| is_sparse(GroupNumber(g))).collect();
        assert_eq!(sparse, vec![0, 1, 3, 5, 7, 9, 25, 27, 49, 81, 125]);
        // Pure: asking twice gives the same answer.
        assert_eq!(is_sparse(GroupNumber(0)), is_sparse(GroupNumber(0)));
        assert!(is_sparse(GroupNumber(343)));
        assert!(!is_sparse(GroupNumber(15)));
    }

    #[test]
    fn has_backup_ignores_policy_without_sparse_super() {
        let mut sb = test_superblock(1024, 8192, 1024, 128);
        sb.feature_ro_compat.0 = 0;
        let geo = FsGeometry::from_superblock(&sb);
        assert!(geo.has_backup(GroupNumber(6)));
    }

    #[test]
    fn geometry_group_block_conversion_with_1k_blocks() {
        let sb = test_superblock(1024, 8192, 1024, 128);
        let geo = FsGeometry::from_superblock(&sb);
        assert_eq!(geo.first_data_block, 1);
        assert_eq!(geo.group_count, 8);
        let abs = geo.group_block_to_absolute(GroupNumber(1), 42);
        assert_eq!(abs, BlockNumber(1 + 1024 + 42));
        assert_eq!(geo.absolute_to_group_block(abs), (GroupNumber(1), 42));
        assert_eq!(geo.superblock_location(GroupNumber(0)), (BlockNumber(1), 0));
        assert_eq!(geo.superblock_location(GroupNumber(3)), (BlockNumber(3073), 0));
        assert_eq!(geo.gdt_block(), BlockNumber(2));
    }

    #[test]
    fn geometry_short_last_group() {
        let sb = test_superblock(4096, 2600, 1024, 128);
        let geo = FsGeometry::from_superblock(&sb);
        assert_eq!(geo.group_count, 3);
        assert_eq!(geo.blocks_in_group(GroupNumber(2)), 552);
        assert_eq!(geo.superblock_location(GroupNumber(0)), (BlockNumber(0), 1024));
    }

    #[test]
    fn planned_layout_skips_backups_in_non_sparse_groups() {
        let sb = test_superblock(1024, 8192, 1024, 128);
        let geo = FsGeometry::from_superblock(&sb);
        // 128 inodes * 128 bytes / 1024 = 16 inode table blocks.
        assert_eq!(geo.inode_table_blocks(), 16);

        let g1 = geo.planned_layout(GroupNumber(1));
        assert_eq!(g1.superblock, Some(BlockNumber(1025)));
        assert_eq!(g1.block_bitmap, BlockNumber(1027));
        assert_eq!(g1.reserved_blocks(), (0..20).collect::<Vec<_>>());

        let g2 = geo.planned_layout(GroupNumber(2));
        assert_eq!(g2.superblock, None);
        assert_eq!(g2.block_bitmap, BlockNumber(2049));
        assert_eq!(g2.reserved_blocks(), (0..18).collect::<Vec<_>>());
    }

    #[test]
    fn initialize_marks_metadata_padding_and_reserved_inodes() {
        let (dev, sb, table) = fresh_table(1024, 8192, 1024, 128);
        let g0 = GroupNumber(0);
        let bbm = table.block_bitmap(g0).expect("bitmap");
        for off in 0..20 {
            assert!(bitmap_get(bbm, off), "metadata block {off} must be used");
        }
        assert!(!bitmap_get(bbm, 20));
        // 1024 blocks per group, 8192 bits per bitmap: padding stays set.
        assert!(bitmap_get(bbm, 1024));
        assert!(bitmap_get(bbm, 8191));

        let ibm = table.inode_bitmap(g0).expect("inode bitmap");
        for idx in 0..10 {
            assert!(bitmap_get(ibm, idx), "reserved inode {} must be used", idx + 1);
        }
        assert!(!bitmap_get(ibm, 10));

        let d0 = table.locate(g0).expect("g0");
        assert_eq!(d0.free_blocks_count, 1024 - 20);
        assert_eq!(d0.free_inodes_count, 128 - 10);
        // The last group is one block short: 8192 - 1 data start.
        let d7 = table.locate(GroupNumber(7)).expect("g7");
        assert_eq!(d7.free_blocks_count, 1023 - 20);

        let reloaded = GroupDescTable::load(&dev, &sb).expect("load");
        assert_eq!(reloaded.descriptors(), table.descriptors());
        assert_eq!(
            reloaded.block_bitmap(GroupNumber(5)).expect("b5"),
            table.block_bitmap(GroupNumber(5)).expect("b5")
        );
    }

    #[test]
    fn locate_out_of_range_is_corrupt_metadata() {
        let (_dev, _sb, table) = fresh_table(1024, 8192, 1024, 128);
        let err = table.locate(GroupNumber(8)).unwrap_err();
        assert!(matches!(err, BgfsError::CorruptMetadata { .. }));
    }

    #[test]
    fn claim_and_release_write_through() {
        let (dev, sb, mut table) = fresh_table(1024, 8192, 1024, 128);
        let g = GroupNumber(2);
        let before = table.locate(g).expect("g2").free_blocks_count;
        table.claim_blocks(&dev, g, 100, 5).expect("claim");
        assert_eq!(table.locate(g).expect("g2").free_blocks_count, before - 5);

        let reloaded = GroupDescTable::load(&dev, &sb).expect("load");
        assert_eq!(reloaded.locate(g).expect("g2").free_blocks_count, before - 5);
        assert!(bitmap_get(reloaded.block_bitmap(g).expect("bm"), 104));

        table.release_blocks(&dev, g, 100, 5).expect("release");
        assert_eq!(table.locate(g).expect("g2").free_blocks_count, before);
    }

    #[test]
    fn release_of_free_block_is_double_free_and_changes_nothing() {
        let (dev, _sb, mut table) = fresh_table(1024, 8192, 1024, 128);
        let g = GroupNumber(1);
        table.claim_blocks(&dev, g, 200, 2).expect("claim");
        let before = table.clone();
        let err = table.release_blocks(&dev, g, 200, 3).unwrap_err();
        let expected = table.geometry().group_block_to_absolute(g, 202).0;
        assert!(matches!(err, BgfsError::DoubleFree { block } if block == expected));
        assert_eq!(table.descriptors(), before.descriptors());
        assert_eq!(table.block_bitmap(g).expect("bm"), before.block_bitmap(g).expect("bm"));
    }

    #[test]
    fn release_of_free_inode_is_already_free() {
        let (dev, _sb, mut table) = fresh_table(1024, 8192, 1024, 128);
        let err = table.release_inode(&dev, GroupNumber(1), 7).unwrap_err();
        assert!(matches!(err, BgfsError::AlreadyFree { ino } if ino == 128 + 8));
    }

    #[test]
    fn adjust_rejects_negative_and_overflowing_counts() {
        let (dev, _sb, mut table) = fresh_table(1024, 8192, 1024, 128);
        let g = GroupNumber(3);
        let before = *table.locate(g).expect("g3");
        let err = table.adjust_used_dirs(&dev, g, -1).unwrap_err();
        assert!(matches!(err, BgfsError::Inconsistent { group: 3, .. }));
        let err = table.adjust_free_inodes(&dev, g, 1).unwrap_err();
        assert!(matches!(err, BgfsError::Inconsistent { .. }));
        assert_eq!(*table.locate(g).expect("g3"), before);

        table.adjust_used_dirs(&dev, g, 1).expect("dirs");
        assert_eq!(table.locate(g).expect("g3").used_dirs_count, 1);
        assert_eq!(table.used_dirs_total(), 1);
    }

    #[test]
    fn load_rejects_descriptor_with_tampered_checksum() {
        let (dev, sb, _table) = fresh_table(1024, 8192, 1024, 128);
        let mut gdt = dev.read_block(BlockNumber(2)).expect("gdt").into_inner();
        gdt[32 + 0x0C] ^= 0x01;
        dev.write_block(BlockNumber(2), &gdt).expect("write");
        let err = GroupDescTable::load(&dev, &sb).unwrap_err();
        assert!(matches!(err, BgfsError::CorruptMetadata { block: 2, .. }));
    }

    #[test]
    fn load_rejects_bitmap_outside_group() {
        let (dev, mut sb, _table) = fresh_table(1024, 8192, 1024, 128);
        sb.feature_ro_compat.0 &= !bgfs_ondisk::RoCompatFeatures::METADATA_CSUM.0;
        let mut gdt = dev.read_block(BlockNumber(2)).expect("gdt").into_inner();
        // Point group 1's block bitmap into group 0.
        gdt[32..36].copy_from_slice(&5_u32.to_le_bytes());
        dev.write_block(BlockNumber(2), &gdt).expect("write");
        let err = GroupDescTable::load(&dev, &sb).unwrap_err();
        assert!(matches!(err, BgfsError::CorruptMetadata { .. }));
    }

    #[test]
    fn sync_backups_writes_sparse_groups_only() {
        let (dev, sb, table) = fresh_table(1024, 8192, 1024, 128);
        let mut region = [0_u8; SUPERBLOCK_SIZE];
        sb.write_to_region(&mut region).expect("region");
        let written = table.sync_backups(&dev, &sb, &region).expect("sync");
        // Groups 1, 3, 5 and 7 carry backups.
        assert_eq!(written, 4);

        let backup = dev.read_block(BlockNumber(3 * 1024 + 1)).expect("g3 sb");
        let parsed = Superblock::parse_superblock_region(backup.as_slice()).expect("parse");
        assert_eq!(parsed.block_group_nr, 3);
        assert_eq!(parsed.blocks_count, sb.blocks_count);

        let gdt_copy = dev.read_block(BlockNumber(3 * 1024 + 2)).expect("g3 gdt");
        let primary = dev.read_block(BlockNumber(2)).expect("gdt");
        assert_eq!(gdt_copy.as_slice(), primary.as_slice());

        // Group 2 is not sparse: its first block is the block bitmap.
        let g2 = dev.read_block(BlockNumber(2 * 1024 + 1)).expect("g2");
        assert!(Superblock::parse_superblock_region(g2.as_slice()).is_err());
    }

    #[test]
    fn initialize_rejects_mismatched_device() {
        let sb = test_superblock(1024, 8192, 1024, 128);
        let dev = ByteBlockDevice::new(MemByteDevice::new(4096 * 64), 4096).expect("dev");
        let err = GroupDescTable::initialize(&dev, &sb).unwrap_err();
        assert!(matches!(err, BgfsError::InvalidGeometry(_)));
    }
}
