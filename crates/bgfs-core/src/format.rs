#![forbid(unsafe_code)]

use bgfs_alloc::inode::write_inode;
use bgfs_alloc::{FsGeometry, GroupDescTable};
use bgfs_block::{BlockDevice, ByteBlockDevice, ByteDevice, write_superblock_region};
use bgfs_error::{BgfsError, Result};
use bgfs_ondisk::{CompatFeatures, IncompatFeatures, Inode, RoCompatFeatures, STATE_VALID, Superblock};
use bgfs_types::{GroupNumber, InodeNumber, S_IFDIR, SUPER_MAGIC, SUPERBLOCK_SIZE};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// First inode available to ordinary files; 1..=10 are reserved.
const FIRST_INO: u32 = 11;

/// Data blocks a trailing group must offer beyond its own metadata to be kept.
const MIN_TAIL_DATA_BLOCKS: u32 = 50;

/// Parameters for [`format`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatOptions {
    pub block_size: u32,
    /// Filesystem size in blocks; `None` uses the whole device.
    pub blocks_count: Option<u32>,
    /// Defaults to `block_size * 8`, one bitmap block's worth.
    pub blocks_per_group: Option<u32>,
    /// Defaults to one inode per four blocks, rounded to whole table blocks.
    pub inodes_per_group: Option<u32>,
    pub inode_size: u16,
    pub sparse_super: bool,
    pub metadata_csum: bool,
    /// `None` derives an identifier from the current time.
    pub uuid: Option<[u8; 16]>,
    pub volume_name: String,
    /// Written to `s_prealloc_blocks` as the volume's window hint.
    pub prealloc_blocks: u8,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_size: 1024,
            blocks_count: None,
            blocks_per_group: None,
            inodes_per_group: None,
            inode_size: 128,
            sparse_super: true,
            metadata_csum: true,
            uuid: None,
            volume_name: String::new(),
            prealloc_blocks: 8,
        }
    }
}

fn invalid(msg: impl Into<String>) -> BgfsError {
    BgfsError::InvalidGeometry(msg.into())
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
}

fn generated_uuid() -> [u8; 16] {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    let mut uuid = nanos.to_le_bytes();
    // RFC 4122 version 4 / variant 1 bits.
    uuid[6] = (uuid[6] & 0x0F) | 0x40;
    uuid[8] = (uuid[8] & 0x3F) | 0x80;
    uuid
}

fn default_inodes_per_group(block_size: u32, blocks_per_group: u32, inode_size: u16) -> u32 {
    let per_table_block = (block_size / u32::from(inode_size)).max(1);
    let wanted = (blocks_per_group / 4).max(per_table_block);
    (wanted.div_ceil(per_table_block) * per_table_block).min(block_size * 8)
}

/// Build the superblock `format` would write, before group trimming.
fn plan_superblock(opts: &FormatOptions, device_blocks: u64) -> Result<Superblock> {
    let bs = opts.block_size;
    if !matches!(bs, 1024 | 2048 | 4096) {
        return Err(invalid(format!("block size {bs} is not 1024, 2048 or 4096")));
    }
    let available = u32::try_from(device_blocks).unwrap_or(u32::MAX);
    let blocks_count = opts.blocks_count.unwrap_or(available);
    if u64::from(blocks_count) > device_blocks {
        return Err(invalid(format!(
            "{blocks_count} blocks requested but the device holds {device_blocks}"
        )));
    }
    let bpg = opts.blocks_per_group.unwrap_or(bs * 8);
    if bpg == 0 || bpg > bs * 8 || bpg % 8 != 0 {
        return Err(invalid(format!(
            "blocks per group {bpg} must be a non-zero multiple of 8 up to {}",
            bs * 8
        )));
    }
    let ipg = opts
        .inodes_per_group
        .unwrap_or_else(|| default_inodes_per_group(bs, bpg, opts.inode_size));

    let mut ro_compat = RoCompatFeatures::default();
    if opts.sparse_super {
        ro_compat.0 |= RoCompatFeatures::SPARSE_SUPER.0;
    }
    if opts.metadata_csum {
        ro_compat.0 |= RoCompatFeatures::METADATA_CSUM.0;
    }
    let now = unix_now();

    let mut sb = Superblock {
        inodes_count: 0,
        blocks_count,
        reserved_blocks_count: 0,
        free_blocks_count: 0,
        free_inodes_count: 0,
        first_data_block: u32::from(bs == 1024),
        log_block_size: bs.trailing_zeros() - 10,
        block_size: bs,
        blocks_per_group: bpg,
        inodes_per_group: ipg,
        first_ino: FIRST_INO,
        inode_size: opts.inode_size,
        block_group_nr: 0,
        magic: SUPER_MAGIC,
        uuid: opts.uuid.unwrap_or_else(generated_uuid),
        volume_name: opts.volume_name.clone(),
        rev_level: 1,
        feature_compat: CompatFeatures::default(),
        feature_incompat: IncompatFeatures::FILETYPE,
        feature_ro_compat: ro_compat,
        state: STATE_VALID,
        errors: 1,
        mnt_count: 0,
        max_mnt_count: 20,
        mtime: 0,
        wtime: now,
        prealloc_blocks: opts.prealloc_blocks,
        prealloc_dir_blocks: 0,
        checksum: 0,
    };
    sb.inodes_count = sb.groups_count().saturating_mul(ipg);
    Ok(sb)
}

/// Drop a trailing group too small to hold its metadata plus a useful
/// amount of data.
fn trim_last_group(sb: &mut Superblock) {
    loop {
        let groups = sb.groups_count();
        if groups <= 1 {
            return;
        }
        let geo = FsGeometry::from_superblock(sb);
        let last = GroupNumber(groups - 1);
        let tail = geo.blocks_in_group(last);
        let overhead = u32::try_from(geo.planned_layout(last).reserved_blocks().len())
            .unwrap_or(u32::MAX);
        if tail >= overhead.saturating_add(MIN_TAIL_DATA_BLOCKS) {
            return;
        }
        debug!(group = last.0, blocks = tail, overhead, "format_trim_last_group");
        sb.blocks_count -= tail;
        sb.inodes_count = sb.groups_count().saturating_mul(sb.inodes_per_group);
    }
}

/// Write an empty filesystem onto `dev` and return its superblock.
///
/// Lays out every group, writes zeroed inode tables, bitmaps and the
/// descriptor table, creates the root directory inode, then writes the
/// primary superblock and every sparse backup.
pub fn format(dev: Arc<dyn ByteDevice>, opts: &FormatOptions) -> Result<Superblock> {
    let device_blocks = dev.len_bytes() / u64::from(opts.block_size.max(1));
    let mut sb = plan_superblock(opts, device_blocks)?;
    trim_last_group(&mut sb);
    sb.validate()
        .map_err(|e| invalid(format!("format parameters: {e}")))?;

    let bdev = ByteBlockDevice::new(Arc::clone(&dev), sb.block_size)?;
    let mut table = GroupDescTable::initialize(&bdev, &sb)?;

    let now = sb.wtime;
    let root = Inode {
        mode: S_IFDIR | 0o755,
        links_count: 2,
        atime: now,
        ctime: now,
        mtime: now,
        ..Inode::default()
    };
    write_inode(&bdev, &table, InodeNumber::ROOT, &root)?;
    table.adjust_used_dirs(&bdev, GroupNumber(0), 1)?;

    sb.free_blocks_count = u32::try_from(table.free_blocks_total()).unwrap_or(u32::MAX);
    sb.free_inodes_count = u32::try_from(table.free_inodes_total()).unwrap_or(u32::MAX);

    let mut region = [0_u8; SUPERBLOCK_SIZE];
    sb.write_to_region(&mut region)
        .map_err(|e| BgfsError::Parse(e.to_string()))?;
    write_superblock_region(&*dev, &region)?;
    let backups = table.sync_backups(&bdev, &sb, &region)?;
    bdev.sync()?;

    info!(
        block_size = sb.block_size,
        blocks = sb.blocks_count,
        groups = sb.groups_count(),
        inodes = sb.inodes_count,
        free_blocks = sb.free_blocks_count,
        backups,
        "format_complete"
    );
    Ok(sb)
}
