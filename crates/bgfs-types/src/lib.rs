#![forbid(unsafe_code)]
//! Shared newtypes, on-disk constants, and byte-level field helpers.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const SUPERBLOCK_OFFSET: usize = 1024;
pub const SUPERBLOCK_SIZE: usize = 1024;
pub const SUPER_MAGIC: u16 = 0xEF53;

/// Size of one on-disk group descriptor (ext2 layout).
pub const GROUP_DESC_SIZE: usize = 32;

/// Number of pointer slots in an inode (`i_block`).
pub const INODE_BLOCK_SLOTS: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

/// Block group index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupNumber(pub u32);

/// Validated block size (must be a power of two in 1024..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [1024, 65536].
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(1024..=65536).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 1024..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Number of 32-bit block pointers that fit in one block.
    #[must_use]
    pub fn pointers_per_block(self) -> u64 {
        u64::from(self.0 / 4)
    }

    /// 512-byte sectors per block, the unit of `i_blocks`.
    #[must_use]
    pub fn sectors_per_block(self) -> u32 {
        self.0 / 512
    }

    /// Convert a byte offset to a block index (truncating).
    #[must_use]
    pub fn byte_to_block(self, byte_offset: u64) -> u64 {
        byte_offset >> self.0.trailing_zeros()
    }

    /// Number of blocks needed to hold `len` bytes.
    #[must_use]
    pub fn blocks_for_len(self, len: u64) -> u64 {
        len.div_ceil(u64::from(self.0))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    let actual = data.len().saturating_sub(offset);
    data.get_mut(offset..end)
        .ok_or(ParseError::InsufficientData {
            needed: len,
            offset,
            actual,
        })
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_fixed(data: &mut [u8], offset: usize, bytes: &[u8]) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, bytes.len())?.copy_from_slice(bytes);
    Ok(())
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

#[must_use]
pub fn block_size_from_log(log_block_size: u32) -> Option<u32> {
    let shift = 10_u32.checked_add(log_block_size)?;
    1_u32.checked_shl(shift)
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GroupNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl InodeNumber {
    pub const ROOT: Self = Self(2);
}

// ── Inode mode constants ────────────────────────────────────────────────────

/// File type mask.
pub const S_IFMT: u16 = 0o170_000;
/// Directory.
pub const S_IFDIR: u16 = 0o040_000;
/// Regular file.
pub const S_IFREG: u16 = 0o100_000;

#[must_use]
pub fn mode_is_dir(mode: u16) -> bool {
    mode & S_IFMT == S_IFDIR
}

/// Inode number of slot `index` in `group`; inode numbers start at 1.
#[must_use]
pub fn group_index_to_inode(group: GroupNumber, index: u32, inodes_per_group: u32) -> InodeNumber {
    InodeNumber(u64::from(group.0) * u64::from(inodes_per_group) + u64::from(index) + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u32(&bytes, 4).expect("u32"), 0x90AB_CDEF);
    }

    #[test]
    fn test_write_helpers() {
        let mut bytes = [0_u8; 8];
        write_le_u16(&mut bytes, 0, 0x1234).expect("u16");
        write_le_u32(&mut bytes, 4, 0x90AB_CDEF).expect("u32");
        assert_eq!(bytes, [0x34, 0x12, 0, 0, 0xEF, 0xCD, 0xAB, 0x90]);

        let err = write_le_u32(&mut bytes, 6, 1).unwrap_err();
        assert!(matches!(err, ParseError::InsufficientData { needed: 4, .. }));
    }

    #[test]
    fn test_trim_nul_padded() {
        let raw = b"bgfs\0\0\0\0";
        assert_eq!(trim_nul_padded(raw), "bgfs");
    }

    #[test]
    fn test_block_size_from_log() {
        assert_eq!(block_size_from_log(0), Some(1024));
        assert_eq!(block_size_from_log(1), Some(2048));
        assert_eq!(block_size_from_log(2), Some(4096));
        assert_eq!(block_size_from_log(40), None);
    }

    #[test]
    fn test_block_size_validation() {
        assert!(BlockSize::new(4096).is_ok());
        assert!(BlockSize::new(1024).is_ok());
        assert_eq!(BlockSize::new(4096).unwrap().pointers_per_block(), 1024);
        assert_eq!(BlockSize::new(1024).unwrap().sectors_per_block(), 2);

        assert!(BlockSize::new(3000).is_err());
        assert!(BlockSize::new(512).is_err());
        assert!(BlockSize::new(131_072).is_err());
        assert!(BlockSize::new(0).is_err());
    }

    #[test]
    fn punch_bounds_round_inward() {
        let bs = BlockSize::new(4096).unwrap();
        // [4096, 8192) covers exactly block 1.
        assert_eq!(bs.blocks_for_len(4096), 1);
        assert_eq!(bs.byte_to_block(8192), 2);
        // A range starting mid-block skips that block.
        assert_eq!(bs.blocks_for_len(4097), 2);
        assert_eq!(bs.byte_to_block(8191), 1);
        assert_eq!(bs.blocks_for_len(0), 0);
    }

    #[test]
    fn inode_numbers_are_one_based_per_group() {
        assert_eq!(group_index_to_inode(GroupNumber(0), 0, 64), InodeNumber(1));
        assert_eq!(group_index_to_inode(GroupNumber(0), 1, 64), InodeNumber::ROOT);
        assert_eq!(group_index_to_inode(GroupNumber(3), 5, 64), InodeNumber(198));
    }

    #[test]
    fn directory_mode_ignores_permission_bits() {
        assert!(mode_is_dir(S_IFDIR | 0o755));
        assert!(!mode_is_dir(S_IFREG | 0o644));
        assert!(!mode_is_dir(0o040));
    }
}
