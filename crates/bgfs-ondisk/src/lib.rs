#![forbid(unsafe_code)]
//! On-disk format codecs for the block-group layout.
//!
//! Pure parsing crate — no I/O, no side effects. Parses byte slices into
//! typed Rust structures for the superblock, group descriptors and inodes,
//! and writes them back bit-for-bit.

pub mod ext2;

pub use ext2::{
    CompatFeatures, GroupDesc, IncompatFeatures, Inode, RoCompatFeatures, STATE_ERROR,
    STATE_VALID, Superblock, stamp_group_desc_checksum, verify_group_desc_checksum,
};
