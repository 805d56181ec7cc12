#![forbid(unsafe_code)]
//! Error types for bgfs.
//!
//! # Error Taxonomy
//!
//! bgfs uses a layered error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `bgfs-types` | On-disk format violations detected during byte parsing |
//! | Bitmap | `BitmapError` | `bgfs-alloc` | Range and exclusivity violations inside one bitmap |
//! | Runtime | `BgfsError` | `bgfs-error` (this crate) | Errors surfaced to the inode, directory and file layers |
//!
//! ## Severity
//!
//! | Variant | Fatal | errno |
//! |---------|-------|-------|
//! | `Io` | no | `EIO` (or the raw OS error) |
//! | `NoSpace` | no | `ENOSPC` |
//! | `InvalidRange` | no | `EINVAL` |
//! | `Format` / `Parse` / `InvalidGeometry` | no | `EINVAL` |
//! | `ReadOnly` | no | `EROFS` |
//! | `DoubleFree` | yes | `EIO` |
//! | `AlreadyFree` | yes | `EIO` |
//! | `Inconsistent` | yes | `EIO` |
//! | `CorruptMetadata` | yes | `EIO` |
//!
//! Fatal errors mean the in-memory or on-disk allocation metadata contradicts
//! itself. They are never repaired automatically: the filesystem context
//! switches to read-only and only the consistency checker may be used to
//! inspect the drift.
//!
//! `NoSpace` is propagated to the caller as-is and is never retried inside
//! the allocator.

use thiserror::Error;

/// Unified error type for all bgfs operations.
#[derive(Debug, Error)]
pub enum BgfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No free blocks or inodes available after a full search.
    #[error("no space left on device")]
    NoSpace,

    /// A block being freed is already clear in its bitmap.
    #[error("double free of block {block}")]
    DoubleFree { block: u64 },

    /// An inode being freed is already clear in its bitmap.
    #[error("inode {ino} is already free")]
    AlreadyFree { ino: u64 },

    /// A descriptor count would leave its `[0, capacity]` range, or a bitmap
    /// update disagrees with the descriptor.
    #[error("inconsistent group {group}: {detail}")]
    Inconsistent { group: u32, detail: String },

    /// Out-of-range group index, malformed descriptor, or a pointer that
    /// references metadata it must not.
    #[error("corrupt metadata at block {block}: {detail}")]
    CorruptMetadata { block: u64, detail: String },

    /// Caller-supplied offset or length violates an operation's preconditions.
    #[error("invalid range: {0}")]
    InvalidRange(String),

    /// Invalid on-disk format (wrong magic, unsupported revision or features).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced to the user.
    #[error("parse error: {0}")]
    Parse(String),

    /// On-disk or requested geometry is invalid or unsupported.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// The filesystem context is read-only (after a fatal error or by request).
    #[error("read-only filesystem")]
    ReadOnly,
}

impl BgfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive so adding a variant is a compile error until
    /// its errno is assigned.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::NoSpace => libc::ENOSPC,
            Self::DoubleFree { .. }
            | Self::AlreadyFree { .. }
            | Self::Inconsistent { .. }
            | Self::CorruptMetadata { .. } => libc::EIO,
            Self::InvalidRange(_)
            | Self::Format(_)
            | Self::Parse(_)
            | Self::InvalidGeometry(_) => libc::EINVAL,
            Self::ReadOnly => libc::EROFS,
        }
    }

    /// Whether this error signals allocation-metadata corruption.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DoubleFree { .. }
                | Self::AlreadyFree { .. }
                | Self::Inconsistent { .. }
                | Self::CorruptMetadata { .. }
        )
    }
}

/// Result alias using `BgfsError`.
pub type Result<T> = std::result::Result<T, BgfsError>;
