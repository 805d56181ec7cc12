#![forbid(unsafe_code)]

use bgfs_types::{
    GROUP_DESC_SIZE, INODE_BLOCK_SLOTS, ParseError, S_IFDIR, S_IFMT, S_IFREG, SUPER_MAGIC,
    SUPERBLOCK_SIZE, block_size_from_log, ensure_slice, read_fixed, read_le_u16, read_le_u32,
    trim_nul_padded, write_fixed, write_le_u16, write_le_u32,
};
use serde::{Deserialize, Serialize};

/// Filesystem was cleanly unmounted.
pub const STATE_VALID: u16 = 0x0001;
/// Errors were detected while mounted.
pub const STATE_ERROR: u16 = 0x0002;

/// Dynamic inode revision (variable inode size, `first_ino`).
const REV_DYNAMIC: u32 = 1;

/// Inode size and first usable inode for revision 0 images.
const GOOD_OLD_INODE_SIZE: u16 = 128;
const GOOD_OLD_FIRST_INO: u32 = 11;

/// Offset of the superblock's own CRC32C.
const SB_CHECKSUM_OFFSET: usize = 0x3FC;

// ── Feature flags ───────────────────────────────────────────────────────────

/// Compatible feature flags (`s_feature_compat`). Advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompatFeatures(pub u32);

/// Incompatible feature flags (`s_feature_incompat`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IncompatFeatures(pub u32);

impl IncompatFeatures {
    pub const FILETYPE: Self = Self(0x0002);
    pub const EXTENTS: Self = Self(0x0040);

    /// Bits this allocator understands. Anything else changes where
    /// metadata lives or how files are mapped.
    pub const SUPPORTED: Self = Self(Self::FILETYPE.0);
}

/// Read-only-compatible feature flags (`s_feature_ro_compat`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoCompatFeatures(pub u32);

impl RoCompatFeatures {
    pub const SPARSE_SUPER: Self = Self(0x0001);
    pub const LARGE_FILE: Self = Self(0x0002);
    pub const METADATA_CSUM: Self = Self(0x0400);

    pub const SUPPORTED: Self =
        Self(Self::SPARSE_SUPER.0 | Self::LARGE_FILE.0 | Self::METADATA_CSUM.0);
}

// ── Superblock ──────────────────────────────────────────────────────────────

/// Parsed superblock.
///
/// Only the fields the allocator reads or maintains are modelled; writing
/// patches them over the original 1024-byte region so everything else is
/// preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    // ── Core geometry ────────────────────────────────────────────────────
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub reserved_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub first_ino: u32,
    pub inode_size: u16,
    pub block_group_nr: u16,

    // ── Identity ─────────────────────────────────────────────────────────
    pub magic: u16,
    pub uuid: [u8; 16],
    pub volume_name: String,

    // ── Revision & features ──────────────────────────────────────────────
    pub rev_level: u32,
    pub feature_compat: CompatFeatures,
    pub feature_incompat: IncompatFeatures,
    pub feature_ro_compat: RoCompatFeatures,

    // ── State ────────────────────────────────────────────────────────────
    pub state: u16,
    pub errors: u16,
    pub mnt_count: u16,
    pub max_mnt_count: u16,
    pub mtime: u32,
    pub wtime: u32,

    // ── Preallocation hints ──────────────────────────────────────────────
    pub prealloc_blocks: u8,
    pub prealloc_dir_blocks: u8,

    pub checksum: u32,
}

impl Superblock {
    /// Parse a superblock from a 1024-byte region.
    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u16(region, 0x38)?;
        if magic != SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(SUPER_MAGIC),
                actual: u64::from(magic),
            });
        }

        let log_block_size = read_le_u32(region, 0x18)?;
        let Some(block_size) = block_size_from_log(log_block_size) else {
            return Err(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "invalid shift",
            });
        };

        let rev_level = read_le_u32(region, 0x4C)?;
        let (first_ino, inode_size) = if rev_level >= REV_DYNAMIC {
            (read_le_u32(region, 0x54)?, read_le_u16(region, 0x58)?)
        } else {
            (GOOD_OLD_FIRST_INO, GOOD_OLD_INODE_SIZE)
        };

        let prealloc = ensure_slice(region, 0xCC, 2)?;

        Ok(Self {
            inodes_count: read_le_u32(region, 0x00)?,
            blocks_count: read_le_u32(region, 0x04)?,
            reserved_blocks_count: read_le_u32(region, 0x08)?,
            free_blocks_count: read_le_u32(region, 0x0C)?,
            free_inodes_count: read_le_u32(region, 0x10)?,
            first_data_block: read_le_u32(region, 0x14)?,
            log_block_size,
            block_size,
            blocks_per_group: read_le_u32(region, 0x20)?,
            inodes_per_group: read_le_u32(region, 0x28)?,
            first_ino,
            inode_size,
            block_group_nr: read_le_u16(region, 0x5A)?,

            magic,
            uuid: read_fixed::<16>(region, 0x68)?,
            volume_name: trim_nul_padded(&read_fixed::<16>(region, 0x78)?),

            rev_level,
            feature_compat: CompatFeatures(read_le_u32(region, 0x5C)?),
            feature_incompat: IncompatFeatures(read_le_u32(region, 0x60)?),
            feature_ro_compat: RoCompatFeatures(read_le_u32(region, 0x64)?),

            state: read_le_u16(region, 0x3A)?,
            errors: read_le_u16(region, 0x3C)?,
            mnt_count: read_le_u16(region, 0x34)?,
            max_mnt_count: read_le_u16(region, 0x36)?,
            mtime: read_le_u32(region, 0x2C)?,
            wtime: read_le_u32(region, 0x30)?,

            prealloc_blocks: prealloc[0],
            prealloc_dir_blocks: prealloc[1],

            checksum: read_le_u32(region, SB_CHECKSUM_OFFSET)?,
        })
    }

    /// Patch every modelled field into `region` and restamp the checksum
    /// when metadata checksums are enabled.
    pub fn write_to_region(&self, region: &mut [u8]) -> Result<(), ParseError> {
        if region.len() < SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        write_le_u32(region, 0x00, self.inodes_count)?;
        write_le_u32(region, 0x04, self.blocks_count)?;
        write_le_u32(region, 0x08, self.reserved_blocks_count)?;
        write_le_u32(region, 0x0C, self.free_blocks_count)?;
        write_le_u32(region, 0x10, self.free_inodes_count)?;
        write_le_u32(region, 0x14, self.first_data_block)?;
        write_le_u32(region, 0x18, self.log_block_size)?;
        // Fragments are the same size as blocks.
        write_le_u32(region, 0x1C, self.log_block_size)?;
        write_le_u32(region, 0x20, self.blocks_per_group)?;
        write_le_u32(region, 0x24, self.blocks_per_group)?;
        write_le_u32(region, 0x28, self.inodes_per_group)?;
        write_le_u32(region, 0x2C, self.mtime)?;
        write_le_u32(region, 0x30, self.wtime)?;
        write_le_u16(region, 0x34, self.mnt_count)?;
        write_le_u16(region, 0x36, self.max_mnt_count)?;
        write_le_u16(region, 0x38, self.magic)?;
        write_le_u16(region, 0x3A, self.state)?;
        write_le_u16(region, 0x3C, self.errors)?;
        write_le_u32(region, 0x4C, self.rev_level)?;
        if self.rev_level >= REV_DYNAMIC {
            write_le_u32(region, 0x54, self.first_ino)?;
            write_le_u16(region, 0x58, self.inode_size)?;
        }
        write_le_u16(region, 0x5A, self.block_group_nr)?;
        write_le_u32(region, 0x5C, self.feature_compat.0)?;
        write_le_u32(region, 0x60, self.feature_incompat.0)?;
        write_le_u32(region, 0x64, self.feature_ro_compat.0)?;
        write_fixed(region, 0x68, &self.uuid)?;

        let mut name = [0_u8; 16];
        let bytes = self.volume_name.as_bytes();
        let n = bytes.len().min(name.len());
        name[..n].copy_from_slice(&bytes[..n]);
        write_fixed(region, 0x78, &name)?;

        write_fixed(region, 0xCC, &[self.prealloc_blocks, self.prealloc_dir_blocks])?;

        if self.has_metadata_csum() {
            let csum = crc32c::crc32c_append(!0_u32, &region[..SB_CHECKSUM_OFFSET]);
            write_le_u32(region, SB_CHECKSUM_OFFSET, csum)?;
        }
        Ok(())
    }

    /// Validate the stored CRC32C when metadata checksums are enabled.
    pub fn verify_checksum(region: &[u8]) -> Result<(), ParseError> {
        let sb = Self::parse_superblock_region(region)?;
        if !sb.has_metadata_csum() {
            return Ok(());
        }
        let computed = crc32c::crc32c_append(!0_u32, &region[..SB_CHECKSUM_OFFSET]);
        if computed != sb.checksum {
            return Err(ParseError::InvalidField {
                field: "s_checksum",
                reason: "superblock CRC32C mismatch",
            });
        }
        Ok(())
    }

    /// Structural validation of geometry and feature flags.
    ///
    /// Bitmaps are one block per group, so both per-group counts are bounded
    /// by the number of bits in one block.
    pub fn validate(&self) -> Result<(), ParseError> {
        if !matches!(self.block_size, 1024 | 2048 | 4096) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "unsupported (1K/2K/4K only)",
            });
        }
        let expected_first = u32::from(self.block_size == 1024);
        if self.first_data_block != expected_first {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "must be 1 for 1K blocks and 0 otherwise",
            });
        }
        let bits_per_block = self.block_size * 8;
        if self.blocks_per_group == 0 || self.blocks_per_group > bits_per_block {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "must be in 1..=block_size*8",
            });
        }
        if self.inodes_per_group == 0 || self.inodes_per_group > bits_per_block {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "must be in 1..=block_size*8",
            });
        }
        if self.inode_size < GOOD_OLD_INODE_SIZE
            || !self.inode_size.is_power_of_two()
            || u32::from(self.inode_size) > self.block_size
        {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "must be a power of two in 128..=block_size",
            });
        }
        if self.blocks_count <= self.first_data_block {
            return Err(ParseError::InvalidField {
                field: "s_blocks_count",
                reason: "no data blocks",
            });
        }
        if u64::from(self.inodes_count)
            > u64::from(self.groups_count()) * u64::from(self.inodes_per_group)
        {
            return Err(ParseError::InvalidField {
                field: "s_inodes_count",
                reason: "exceeds groups * inodes_per_group",
            });
        }
        // The root inode (2) must sit below the first allocatable inode.
        if self.first_ino < 3 || self.first_ino > self.inodes_count {
            return Err(ParseError::InvalidField {
                field: "s_first_ino",
                reason: "out of range",
            });
        }
        if self.feature_incompat.0 & !IncompatFeatures::SUPPORTED.0 != 0 {
            return Err(ParseError::InvalidField {
                field: "feature_incompat",
                reason: "unsupported incompatible features present",
            });
        }
        if self.feature_ro_compat.0 & !RoCompatFeatures::SUPPORTED.0 != 0 {
            return Err(ParseError::InvalidField {
                field: "feature_ro_compat",
                reason: "unsupported read-only-compatible features present",
            });
        }
        Ok(())
    }

    /// Number of block groups in this filesystem.
    #[must_use]
    pub fn groups_count(&self) -> u32 {
        if self.blocks_per_group == 0 {
            return 0;
        }
        let data_blocks = self.blocks_count.saturating_sub(self.first_data_block);
        data_blocks.div_ceil(self.blocks_per_group)
    }

    #[must_use]
    pub fn has_sparse_super(&self) -> bool {
        self.feature_ro_compat.0 & RoCompatFeatures::SPARSE_SUPER.0 != 0
    }

    #[must_use]
    pub fn has_metadata_csum(&self) -> bool {
        self.feature_ro_compat.0 & RoCompatFeatures::METADATA_CSUM.0 != 0
    }

    /// CRC32C seed for metadata checksums: `crc32c_append(!0, uuid)`.
    #[must_use]
    pub fn csum_seed(&self) -> u32 {
        crc32c::crc32c_append(!0_u32, &self.uuid)
    }

    /// Number of blocks occupied by the group descriptor table.
    #[must_use]
    pub fn gdt_blocks(&self) -> u32 {
        let bytes = u64::from(self.groups_count()) * GROUP_DESC_SIZE as u64;
        #[expect(clippy::cast_possible_truncation)]
        let blocks = bytes.div_ceil(u64::from(self.block_size)) as u32;
        blocks
    }
}

// ── Group descriptor ────────────────────────────────────────────────────────

/// Offset of `bg_checksum` within a group descriptor (2 bytes).
const GD_CHECKSUM_OFFSET: usize = 0x1E;

/// One 32-byte group descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GroupDesc {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub used_dirs_count: u32,
    pub flags: u16,
    pub itable_unused: u32,
    pub checksum: u16,
}

impl GroupDesc {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < GROUP_DESC_SIZE {
            return Err(ParseError::InsufficientData {
                needed: GROUP_DESC_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            block_bitmap: read_le_u32(bytes, 0x00)?,
            inode_bitmap: read_le_u32(bytes, 0x04)?,
            inode_table: read_le_u32(bytes, 0x08)?,
            free_blocks_count: u32::from(read_le_u16(bytes, 0x0C)?),
            free_inodes_count: u32::from(read_le_u16(bytes, 0x0E)?),
            used_dirs_count: u32::from(read_le_u16(bytes, 0x10)?),
            flags: read_le_u16(bytes, 0x12)?,
            itable_unused: u32::from(read_le_u16(bytes, 0x1C)?),
            checksum: read_le_u16(bytes, GD_CHECKSUM_OFFSET)?,
        })
    }

    /// Serialize into the first 32 bytes of `bytes`.
    ///
    /// Counters are 16-bit on disk; values that do not fit are rejected
    /// rather than truncated.
    pub fn write_to_bytes(&self, bytes: &mut [u8]) -> Result<(), ParseError> {
        if bytes.len() < GROUP_DESC_SIZE {
            return Err(ParseError::InsufficientData {
                needed: GROUP_DESC_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }
        let narrow = |value: u32, field: &'static str| {
            u16::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
        };
        write_le_u32(bytes, 0x00, self.block_bitmap)?;
        write_le_u32(bytes, 0x04, self.inode_bitmap)?;
        write_le_u32(bytes, 0x08, self.inode_table)?;
        write_le_u16(
            bytes,
            0x0C,
            narrow(self.free_blocks_count, "bg_free_blocks_count")?,
        )?;
        write_le_u16(
            bytes,
            0x0E,
            narrow(self.free_inodes_count, "bg_free_inodes_count")?,
        )?;
        write_le_u16(bytes, 0x10, narrow(self.used_dirs_count, "bg_used_dirs_count")?)?;
        write_le_u16(bytes, 0x12, self.flags)?;
        write_le_u16(bytes, 0x1C, narrow(self.itable_unused, "bg_itable_unused")?)?;
        write_le_u16(bytes, GD_CHECKSUM_OFFSET, self.checksum)?;
        Ok(())
    }
}

fn group_desc_checksum(raw_gd: &[u8], csum_seed: u32, group_number: u32) -> u16 {
    let le_group = group_number.to_le_bytes();
    let mut csum = crc32c::crc32c_append(csum_seed, &le_group);
    csum = crc32c::crc32c_append(csum, &raw_gd[..GD_CHECKSUM_OFFSET]);
    // The checksum field itself is hashed as zero.
    csum = crc32c::crc32c_append(csum, &[0, 0]);
    #[expect(clippy::cast_possible_truncation)]
    let low = (csum & 0xFFFF) as u16;
    low
}

/// Verify a group descriptor's CRC32C checksum.
pub fn verify_group_desc_checksum(
    raw_gd: &[u8],
    csum_seed: u32,
    group_number: u32,
) -> Result<(), ParseError> {
    ensure_slice(raw_gd, 0, GROUP_DESC_SIZE)?;
    let expected = group_desc_checksum(raw_gd, csum_seed, group_number);
    let stored = read_le_u16(raw_gd, GD_CHECKSUM_OFFSET)?;
    if expected != stored {
        return Err(ParseError::InvalidField {
            field: "bg_checksum",
            reason: "group descriptor CRC32C mismatch",
        });
    }
    Ok(())
}

/// Recompute and store a group descriptor's CRC32C checksum in place.
pub fn stamp_group_desc_checksum(
    raw_gd: &mut [u8],
    csum_seed: u32,
    group_number: u32,
) -> Result<(), ParseError> {
    ensure_slice(raw_gd, 0, GROUP_DESC_SIZE)?;
    let csum = group_desc_checksum(raw_gd, csum_seed, group_number);
    write_le_u16(raw_gd, GD_CHECKSUM_OFFSET, csum)
}

// ── Inode ───────────────────────────────────────────────────────────────────

/// The inode fields the allocator and block-mapping engine work with.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Inode {
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub size: u64,
    pub links_count: u16,
    /// Allocated space in 512-byte sectors (data and indirect blocks).
    pub blocks: u32,
    pub flags: u32,
    pub generation: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    /// Direct pointers `[0..12)`, then single, double and triple indirect.
    pub block: [u32; INODE_BLOCK_SLOTS],
}

impl Inode {
    /// Parse the base 128-byte inode record.
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < usize::from(GOOD_OLD_INODE_SIZE) {
            return Err(ParseError::InsufficientData {
                needed: usize::from(GOOD_OLD_INODE_SIZE),
                offset: 0,
                actual: bytes.len(),
            });
        }

        let mut block = [0_u32; INODE_BLOCK_SLOTS];
        for (i, slot) in block.iter_mut().enumerate() {
            *slot = read_le_u32(bytes, 0x28 + i * 4)?;
        }
        let size_lo = u64::from(read_le_u32(bytes, 0x04)?);
        let size_hi = u64::from(read_le_u32(bytes, 0x6C)?);

        Ok(Self {
            mode: read_le_u16(bytes, 0x00)?,
            uid: read_le_u16(bytes, 0x02)?,
            size: size_lo | (size_hi << 32),
            atime: read_le_u32(bytes, 0x08)?,
            ctime: read_le_u32(bytes, 0x0C)?,
            mtime: read_le_u32(bytes, 0x10)?,
            dtime: read_le_u32(bytes, 0x14)?,
            gid: read_le_u16(bytes, 0x18)?,
            links_count: read_le_u16(bytes, 0x1A)?,
            blocks: read_le_u32(bytes, 0x1C)?,
            flags: read_le_u32(bytes, 0x20)?,
            block,
            generation: read_le_u32(bytes, 0x64)?,
        })
    }

    /// Patch the modelled fields into the first 128 bytes of `bytes`.
    pub fn write_to_bytes(&self, bytes: &mut [u8]) -> Result<(), ParseError> {
        if bytes.len() < usize::from(GOOD_OLD_INODE_SIZE) {
            return Err(ParseError::InsufficientData {
                needed: usize::from(GOOD_OLD_INODE_SIZE),
                offset: 0,
                actual: bytes.len(),
            });
        }
        #[expect(clippy::cast_possible_truncation)]
        let (size_lo, size_hi) = (self.size as u32, (self.size >> 32) as u32);

        write_le_u16(bytes, 0x00, self.mode)?;
        write_le_u16(bytes, 0x02, self.uid)?;
        write_le_u32(bytes, 0x04, size_lo)?;
        write_le_u32(bytes, 0x08, self.atime)?;
        write_le_u32(bytes, 0x0C, self.ctime)?;
        write_le_u32(bytes, 0x10, self.mtime)?;
        write_le_u32(bytes, 0x14, self.dtime)?;
        write_le_u16(bytes, 0x18, self.gid)?;
        write_le_u16(bytes, 0x1A, self.links_count)?;
        write_le_u32(bytes, 0x1C, self.blocks)?;
        write_le_u32(bytes, 0x20, self.flags)?;
        for (i, ptr) in self.block.iter().enumerate() {
            write_le_u32(bytes, 0x28 + i * 4, *ptr)?;
        }
        write_le_u32(bytes, 0x64, self.generation)?;
        write_le_u32(bytes, 0x6C, size_hi)?;
        Ok(())
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }
}
