#![forbid(unsafe_code)]
//! The bgfs filesystem context.
//!
//! [`Filesystem`] owns everything a mounted volume needs: the device, the
//! superblock snapshot, the cached group descriptor table, both allocators
//! and the runtime [`Config`]. There is no process-wide state; `mount`
//! builds the context and `unmount` tears it down.
//!
//! Every mutating call takes `&mut self`, so callers serialize structural
//! changes through the borrow checker. A fatal metadata error (double free,
//! counter drift, corrupt pointers) is logged at `error!` and flips the
//! context to read-only; later mutating calls fail with
//! [`BgfsError::ReadOnly`] while reads and [`Filesystem::check_consistency`]
//! keep working.

pub mod config;
pub mod format;

pub use config::{Config, ConfigError, LogLevel};
pub use format::{FormatOptions, format};

use bgfs_alloc::inode::{read_inode, write_inode};
use bgfs_alloc::{
    AllocStats, BlockAllocator, Discrepancy, GroupDescTable, InodeAllocator, check_consistency,
};
use bgfs_block::{BlockDevice, ByteBlockDevice, ByteDevice, read_superblock_region, write_superblock_region};
use bgfs_error::{BgfsError, Result};
use bgfs_map::{BlockSource, ReclaimSummary};
pub use bgfs_ondisk::{Inode, STATE_ERROR, STATE_VALID, Superblock};
use bgfs_types::{BlockNumber, GroupNumber, InodeNumber, ParseError, SUPERBLOCK_SIZE};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

fn parse_to_bgfs(err: &ParseError) -> BgfsError {
    match err {
        ParseError::InvalidMagic { .. } => BgfsError::Format(err.to_string()),
        _ => BgfsError::Parse(err.to_string()),
    }
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
}

// ── Reports ─────────────────────────────────────────────────────────────────

/// Point-in-time summary of a mounted filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsStats {
    pub block_size: u32,
    pub blocks_count: u64,
    pub inodes_count: u64,
    pub groups: u32,
    pub free_blocks: u64,
    pub free_inodes: u64,
    pub used_dirs: u64,
    /// Blocks held in preallocation windows (counted as used).
    pub prealloc_reserved: u64,
    pub read_only: bool,
    pub alloc: AllocStats,
}

/// One group's descriptor and placement, for inspection output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub group: u32,
    pub first_block: u64,
    pub block_count: u32,
    pub free_blocks: u32,
    pub free_inodes: u32,
    pub used_dirs: u32,
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub has_backup: bool,
}

// ── Block source adapter ────────────────────────────────────────────────────

/// Routes the mapping engine's allocations through the block allocator.
struct AllocSource<'a> {
    dev: &'a dyn BlockDevice,
    table: &'a mut GroupDescTable,
    blocks: &'a mut BlockAllocator,
    prealloc: bool,
}

impl BlockSource for AllocSource<'_> {
    fn alloc_block(&mut self, owner: InodeNumber, goal: Option<BlockNumber>) -> Result<BlockNumber> {
        let geo = self.table.geometry();
        let goal = goal.or_else(|| {
            geo.inode_to_group_index(owner)
                .map(|(group, _)| geo.group_first_block(group))
        });
        self.blocks
            .allocate(self.dev, self.table, owner, goal, self.prealloc)
    }

    fn free_blocks(&mut self, owner: InodeNumber, start: BlockNumber, count: u32) -> Result<()> {
        self.blocks.free(self.dev, self.table, owner, start, count)
    }

    fn persist_inode(&mut self, ino: InodeNumber, inode: &Inode) -> Result<()> {
        write_inode(self.dev, self.table, ino, inode)
    }
}

// ── Filesystem ──────────────────────────────────────────────────────────────

/// A mounted bgfs volume.
pub struct Filesystem {
    raw: Arc<dyn ByteDevice>,
    dev: ByteBlockDevice<Arc<dyn ByteDevice>>,
    sb: Superblock,
    region: [u8; SUPERBLOCK_SIZE],
    table: GroupDescTable,
    blocks: BlockAllocator,
    inodes: InodeAllocator,
    config: Config,
    read_only: bool,
    errors_seen: bool,
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("block_size", &self.sb.block_size)
            .field("blocks_count", &self.sb.blocks_count)
            .field("groups", &self.table.group_count())
            .field("read_only", &self.read_only)
            .field("errors_seen", &self.errors_seen)
            .finish_non_exhaustive()
    }
}

impl Filesystem {
    /// Mount the volume on `raw`.
    ///
    /// Validates the superblock (and its checksum when enabled), loads and
    /// verifies the descriptor table, and bumps the mount count. A volume
    /// whose superblock records errors mounts read-only, as does one that
    /// fails the mount-time check when `check_on_mount` is set.
    pub fn mount(raw: Arc<dyn ByteDevice>, config: Config) -> Result<Self> {
        Self::mount_with(raw, config, false)
    }

    /// Mount without writing anything to the device.
    pub fn mount_read_only(raw: Arc<dyn ByteDevice>, config: Config) -> Result<Self> {
        Self::mount_with(raw, config, true)
    }

    fn mount_with(raw: Arc<dyn ByteDevice>, config: Config, read_only: bool) -> Result<Self> {
        config
            .validate()
            .map_err(|e| BgfsError::InvalidGeometry(e.to_string()))?;

        let region = read_superblock_region(&*raw)?;
        let mut sb = Superblock::parse_superblock_region(&region).map_err(|e| parse_to_bgfs(&e))?;
        sb.validate().map_err(|e| parse_to_bgfs(&e))?;
        Superblock::verify_checksum(&region).map_err(|e| BgfsError::CorruptMetadata {
            block: 1024 / u64::from(sb.block_size),
            detail: e.to_string(),
        })?;

        let dev = ByteBlockDevice::new(Arc::clone(&raw), sb.block_size)?;
        let table = GroupDescTable::load(&dev, &sb)?;
        let alloc_config = config.allocator();

        let mut read_only = read_only;
        if sb.state & STATE_ERROR != 0 {
            warn!(state = sb.state, "mount_recorded_errors_read_only");
            read_only = true;
        }
        if config.check_on_mount {
            let found = check_consistency(&dev, &table, &sb)?;
            if !found.is_empty() {
                warn!(discrepancies = found.len(), "mount_check_failed_read_only");
                read_only = true;
            }
        }

        let generation_seed = sb.wtime.wrapping_add(u32::from(sb.mnt_count));
        let mut fs = Self {
            raw,
            dev,
            region,
            table,
            blocks: BlockAllocator::new(alloc_config),
            inodes: InodeAllocator::new(alloc_config, generation_seed),
            config,
            read_only,
            errors_seen: false,
            sb: sb.clone(),
        };

        if !fs.read_only {
            sb.mnt_count = sb.mnt_count.wrapping_add(1);
            sb.mtime = unix_now();
            sb.state &= !STATE_VALID;
            fs.sb = sb;
            fs.write_primary_superblock()?;
        }
        info!(
            block_size = fs.sb.block_size,
            groups = fs.table.group_count(),
            free_blocks = fs.table.free_blocks_total(),
            free_inodes = fs.table.free_inodes_total(),
            read_only = fs.read_only,
            "mounted"
        );
        Ok(fs)
    }

    /// Flush and release the volume.
    ///
    /// Preallocation windows are returned, the superblock counters are
    /// refreshed and written together with every sparse backup, and the
    /// device is synced. After a fatal error only the error state is
    /// recorded.
    pub fn unmount(mut self) -> Result<()> {
        if self.errors_seen {
            self.sb.state |= STATE_ERROR;
            self.sb.wtime = unix_now();
            self.write_primary_superblock()?;
            self.dev.sync()?;
            warn!("unmounted_with_errors");
            return Ok(());
        }
        if self.read_only {
            debug!("unmounted_read_only");
            return Ok(());
        }

        let released = self.blocks.reserved_in_windows();
        let result = self.blocks.release_all(&self.dev, &mut self.table);
        self.guard("unmount", result)?;
        self.refresh_counts();
        self.sb.state |= STATE_VALID;
        self.sb.wtime = unix_now();
        self.write_primary_superblock()?;
        let backups = self.table.sync_backups(&self.dev, &self.sb, &self.region)?;
        self.dev.sync()?;
        info!(
            windows_released = released,
            backups,
            free_blocks = self.sb.free_blocks_count,
            free_inodes = self.sb.free_inodes_count,
            "unmounted"
        );
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────────

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    #[must_use]
    pub fn device(&self) -> &dyn BlockDevice {
        &self.dev
    }

    #[must_use]
    pub fn group_table(&self) -> &GroupDescTable {
        &self.table
    }

    /// Free blocks according to the cached descriptors.
    #[must_use]
    pub fn count_free_blocks(&self) -> u64 {
        self.table.free_blocks_total()
    }

    #[must_use]
    pub fn count_free_inodes(&self) -> u64 {
        bgfs_alloc::inode::count_free(&self.table)
    }

    #[must_use]
    pub fn stats(&self) -> FsStats {
        FsStats {
            block_size: self.sb.block_size,
            blocks_count: u64::from(self.sb.blocks_count),
            inodes_count: u64::from(self.sb.inodes_count),
            groups: self.table.group_count(),
            free_blocks: self.table.free_blocks_total(),
            free_inodes: self.table.free_inodes_total(),
            used_dirs: self.table.used_dirs_total(),
            prealloc_reserved: self.blocks.reserved_in_windows(),
            read_only: self.read_only,
            alloc: self.blocks.stats(),
        }
    }

    #[must_use]
    pub fn group_summaries(&self) -> Vec<GroupSummary> {
        let geo = self.table.geometry();
        (0_u32..)
            .zip(self.table.descriptors())
            .map(|(g, desc)| {
                let group = GroupNumber(g);
                GroupSummary {
                    group: g,
                    first_block: geo.group_first_block(group).0,
                    block_count: geo.blocks_in_group(group),
                    free_blocks: desc.free_blocks_count,
                    free_inodes: desc.free_inodes_count,
                    used_dirs: desc.used_dirs_count,
                    block_bitmap: desc.block_bitmap,
                    inode_bitmap: desc.inode_bitmap,
                    inode_table: desc.inode_table,
                    has_backup: geo.has_backup(group),
                }
            })
            .collect()
    }

    /// Recount bitmaps on disk against the descriptors and the superblock.
    pub fn check_consistency(&self) -> Result<Vec<Discrepancy>> {
        check_consistency(&self.dev, &self.table, &self.sb)
    }

    pub fn read_inode(&self, ino: InodeNumber) -> Result<Inode> {
        read_inode(&self.dev, &self.table, ino)
    }

    /// Physical block backing `logical` in `ino`, or `None` for a hole.
    pub fn map_block(&self, ino: InodeNumber, logical: u64) -> Result<Option<BlockNumber>> {
        let inode = self.read_inode(ino)?;
        bgfs_map::map_block(&self.dev, &inode, logical)
    }

    // ── Mutations ───────────────────────────────────────────────────────

    pub fn write_inode(&mut self, ino: InodeNumber, inode: &Inode) -> Result<()> {
        self.ensure_writable()?;
        let result = write_inode(&self.dev, &self.table, ino, inode);
        self.guard("write_inode", result)
    }

    /// Allocate one block for `owner` near `goal`, with preallocation.
    pub fn allocate_block(&mut self, owner: InodeNumber, goal: Option<BlockNumber>) -> Result<BlockNumber> {
        self.ensure_writable()?;
        let result = self
            .blocks
            .allocate(&self.dev, &mut self.table, owner, goal, true);
        self.finish("allocate_block", result)
    }

    pub fn free_blocks(&mut self, owner: InodeNumber, start: BlockNumber, count: u32) -> Result<()> {
        self.ensure_writable()?;
        let result = self
            .blocks
            .free(&self.dev, &mut self.table, owner, start, count);
        self.finish("free_blocks", result)
    }

    /// Return `ino`'s unused preallocated blocks (last close of the inode).
    pub fn release_inode(&mut self, ino: InodeNumber) -> Result<()> {
        self.ensure_writable()?;
        let result = self.blocks.release_window(&self.dev, &mut self.table, ino);
        self.finish("release_inode", result)
    }

    pub fn allocate_inode(&mut self, parent: InodeNumber, mode: u16) -> Result<InodeNumber> {
        self.ensure_writable()?;
        let result = self.inodes.allocate(&self.dev, &mut self.table, parent, mode);
        self.finish("allocate_inode", result)
    }

    /// Clear `ino` in the inode bitmap. Its blocks are left alone.
    pub fn free_inode(&mut self, ino: InodeNumber) -> Result<()> {
        self.ensure_writable()?;
        let result = self.inodes.free(&self.dev, &mut self.table, ino);
        self.finish("free_inode", result)
    }

    /// Release every block of `ino`, its window, then the inode itself.
    pub fn delete_inode(&mut self, ino: InodeNumber) -> Result<ReclaimSummary> {
        self.ensure_writable()?;
        let result = self.delete_inode_inner(ino);
        self.finish("delete_inode", result)
    }

    fn delete_inode_inner(&mut self, ino: InodeNumber) -> Result<ReclaimSummary> {
        let mut inode = read_inode(&self.dev, &self.table, ino)?;
        self.blocks.release_window(&self.dev, &mut self.table, ino)?;
        let mut source = AllocSource {
            dev: &self.dev,
            table: &mut self.table,
            blocks: &mut self.blocks,
            prealloc: false,
        };
        let summary = bgfs_map::truncate(&self.dev, &mut inode, ino, 0, &mut source)?;
        self.inodes.free(&self.dev, &mut self.table, ino)?;
        debug!(ino = ino.0, freed = summary.total_blocks(), "inode_deleted");
        Ok(summary)
    }

    /// Map `logical` in `ino`, allocating on the write path.
    pub fn get_or_alloc_block(&mut self, ino: InodeNumber, logical: u64) -> Result<BlockNumber> {
        self.ensure_writable()?;
        let result = self.get_or_alloc_inner(ino, logical);
        self.finish("get_or_alloc_block", result)
    }

    fn get_or_alloc_inner(&mut self, ino: InodeNumber, logical: u64) -> Result<BlockNumber> {
        let mut inode = read_inode(&self.dev, &self.table, ino)?;
        let mut source = AllocSource {
            dev: &self.dev,
            table: &mut self.table,
            blocks: &mut self.blocks,
            prealloc: inode.is_regular(),
        };
        bgfs_map::get_or_alloc_block(&self.dev, &mut inode, ino, logical, &mut source)
    }

    /// Set `ino`'s size, releasing blocks past the new end and its window.
    pub fn truncate(&mut self, ino: InodeNumber, new_len: u64) -> Result<ReclaimSummary> {
        self.ensure_writable()?;
        let result = self.truncate_inner(ino, new_len);
        self.finish("truncate", result)
    }

    fn truncate_inner(&mut self, ino: InodeNumber, new_len: u64) -> Result<ReclaimSummary> {
        let mut inode = read_inode(&self.dev, &self.table, ino)?;
        self.blocks.release_window(&self.dev, &mut self.table, ino)?;
        let mut source = AllocSource {
            dev: &self.dev,
            table: &mut self.table,
            blocks: &mut self.blocks,
            prealloc: false,
        };
        bgfs_map::truncate(&self.dev, &mut inode, ino, new_len, &mut source)
    }

    /// Free the blocks lying wholly inside `[start, start + count)` of `ino`.
    pub fn punch(&mut self, ino: InodeNumber, start: u64, count: u64) -> Result<ReclaimSummary> {
        self.ensure_writable()?;
        let result = self.punch_inner(ino, start, count);
        self.finish("punch", result)
    }

    fn punch_inner(&mut self, ino: InodeNumber, start: u64, count: u64) -> Result<ReclaimSummary> {
        let mut inode = read_inode(&self.dev, &self.table, ino)?;
        let mut source = AllocSource {
            dev: &self.dev,
            table: &mut self.table,
            blocks: &mut self.blocks,
            prealloc: false,
        };
        bgfs_map::punch(&self.dev, &mut inode, ino, start, count, &mut source)
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(BgfsError::ReadOnly);
        }
        Ok(())
    }

    /// Record a fatal error and drop to read-only.
    fn guard<T>(&mut self, op: &'static str, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                error!(op, error = %err, "fatal_metadata_error_read_only");
                self.read_only = true;
                self.errors_seen = true;
            }
        }
        result
    }

    /// `guard`, then bring the superblock counters in line with the cache.
    fn finish<T>(&mut self, op: &'static str, result: Result<T>) -> Result<T> {
        let result = self.guard(op, result);
        self.refresh_counts();
        result
    }

    fn refresh_counts(&mut self) {
        self.sb.free_blocks_count =
            u32::try_from(self.table.free_blocks_total()).unwrap_or(u32::MAX);
        self.sb.free_inodes_count =
            u32::try_from(self.table.free_inodes_total()).unwrap_or(u32::MAX);
    }

    fn write_primary_superblock(&mut self) -> Result<()> {
        self.sb
            .write_to_region(&mut self.region)
            .map_err(|e| BgfsError::Parse(e.to_string()))?;
        write_superblock_region(&*self.raw, &self.region)
    }
}
