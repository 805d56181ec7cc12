//! Bit-level occupancy codec.
//!
//! Bit `i` lives in byte `i / 8` at position `i % 8` (least significant bit
//! first). A set bit means the resource is in use. Scans load little-endian
//! 64-bit words so fully used or fully free stretches are skipped a word at
//! a time; bytes past the end of the slice read as used.

use bgfs_types::GroupNumber;
use thiserror::Error;

/// Failure of a checked range mutation. The bitmap is untouched when one of
/// these is returned.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BitmapError {
    #[error("bit range {index}+{count} exceeds bitmap of {len} bits")]
    OutOfRange { index: u32, count: u32, len: u32 },
    #[error("bit {bit} already holds the requested value")]
    Conflict { bit: u32 },
}

// ── Single-bit helpers ──────────────────────────────────────────────────────

/// Get bit `idx`. Bits beyond the slice read as set.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    bitmap
        .get(byte_idx)
        .is_none_or(|byte| (byte >> (idx % 8)) & 1 == 1)
}

/// Set bit `idx`. Out-of-range indices are ignored.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    if let Some(byte) = bitmap.get_mut((idx / 8) as usize) {
        *byte |= 1 << (idx % 8);
    }
}

/// Clear bit `idx`. Out-of-range indices are ignored.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    if let Some(byte) = bitmap.get_mut((idx / 8) as usize) {
        *byte &= !(1 << (idx % 8));
    }
}

// ── Word access ─────────────────────────────────────────────────────────────

fn capacity(bitmap: &[u8]) -> u32 {
    u32::try_from(bitmap.len().saturating_mul(8)).unwrap_or(u32::MAX)
}

/// Load 64-bit word `word`, padding missing bytes with `0xFF`.
fn load_word(bitmap: &[u8], word: usize) -> u64 {
    let start = word * 8;
    let mut bytes = [0xFF_u8; 8];
    if start < bitmap.len() {
        let end = (start + 8).min(bitmap.len());
        bytes[..end - start].copy_from_slice(&bitmap[start..end]);
    }
    u64::from_le_bytes(bytes)
}

/// First bit in `[from, end)` whose value equals `want_set`.
fn next_with_value(bitmap: &[u8], from: u32, end: u32, want_set: bool) -> Option<u32> {
    let mut pos = from;
    while pos < end {
        let word_idx = pos / 64;
        let raw = load_word(bitmap, word_idx as usize);
        let word = (if want_set { raw } else { !raw }) >> (pos % 64);
        if word == 0 {
            pos = (word_idx + 1) * 64;
            continue;
        }
        let hit = pos + word.trailing_zeros();
        return (hit < end).then_some(hit);
    }
    None
}

fn next_zero(bitmap: &[u8], from: u32, end: u32) -> Option<u32> {
    next_with_value(bitmap, from, end, false)
}

fn next_one(bitmap: &[u8], from: u32, end: u32) -> Option<u32> {
    next_with_value(bitmap, from, end, true)
}

// ── Counting and search ─────────────────────────────────────────────────────

/// Number of zero bits among the first `bit_count` bits.
#[must_use]
pub fn count_free(bitmap: &[u8], bit_count: u32) -> u32 {
    let bit_count = bit_count.min(capacity(bitmap));
    let full_words = (bit_count / 64) as usize;
    let mut free: u32 = (0..full_words)
        .map(|w| load_word(bitmap, w).count_zeros())
        .sum();

    let tail = bit_count % 64;
    if tail > 0 {
        let mask = (1_u64 << tail) - 1;
        free += (!load_word(bitmap, full_words) & mask).count_ones();
    }
    free
}

/// Lowest `s` in `[from, start_limit)` such that `[s, s + run)` is free and
/// ends at or before `end`.
fn scan_run(bitmap: &[u8], from: u32, start_limit: u32, end: u32, run: u32) -> Option<u32> {
    let mut pos = from;
    while pos < start_limit {
        let start = next_zero(bitmap, pos, start_limit)?;
        let run_end = start.checked_add(run)?;
        if run_end > end {
            return None;
        }
        match next_one(bitmap, start, run_end) {
            None => return Some(start),
            Some(used) => pos = used + 1,
        }
    }
    None
}

/// Find `run` contiguous zero bits within the first `bit_count` bits.
///
/// Starts at `start_hint` (or 0 when the hint is past the end) and wraps
/// once: the lowest start at or after the hint wins, then the lowest start
/// before it. A run never wraps around the end of the bitmap. A zero-length
/// run never matches.
#[must_use]
pub fn find_free_run(bitmap: &[u8], bit_count: u32, start_hint: u32, run: u32) -> Option<u32> {
    let bit_count = bit_count.min(capacity(bitmap));
    if run == 0 || run > bit_count {
        return None;
    }
    let start = if start_hint < bit_count { start_hint } else { 0 };
    scan_run(bitmap, start, bit_count, bit_count, run)
        .or_else(|| scan_run(bitmap, 0, start, bit_count, run))
}

/// Verify that `count` bits starting at `index` fit in `bit_count` and, when
/// `exclusive`, that none of them already equals `value`.
pub fn check_range(
    bitmap: &[u8],
    bit_count: u32,
    index: u32,
    count: u32,
    value: bool,
    exclusive: bool,
) -> Result<u32, BitmapError> {
    let len = bit_count.min(capacity(bitmap));
    let end = index
        .checked_add(count)
        .filter(|&end| end <= len)
        .ok_or(BitmapError::OutOfRange { index, count, len })?;
    if exclusive {
        if let Some(bit) = next_with_value(bitmap, index, end, value) {
            return Err(BitmapError::Conflict { bit });
        }
    }
    Ok(end)
}

/// Set (`value = true`) or clear `count` bits starting at `index`.
///
/// With `exclusive`, every bit in the range must currently hold `!value`;
/// the first bit that already equals `value` is reported as a conflict.
/// Validation happens before any bit changes.
pub fn set_range(
    bitmap: &mut [u8],
    bit_count: u32,
    index: u32,
    count: u32,
    value: bool,
    exclusive: bool,
) -> Result<(), BitmapError> {
    let end = check_range(bitmap, bit_count, index, count, value, exclusive)?;
    for idx in index..end {
        if value {
            bitmap_set(bitmap, idx);
        } else {
            bitmap_clear(bitmap, idx);
        }
    }
    Ok(())
}

// ── Arena ───────────────────────────────────────────────────────────────────

/// Every group's bitmap stored back to back in one buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitmapArena {
    bytes: Vec<u8>,
    stride: usize,
    groups: u32,
}

impl BitmapArena {
    /// Zero-filled arena of `groups` bitmaps, `stride` bytes each.
    #[must_use]
    pub fn new(groups: u32, stride: usize) -> Self {
        Self {
            bytes: vec![0_u8; stride * groups as usize],
            stride,
            groups,
        }
    }

    #[must_use]
    pub fn group_count(&self) -> u32 {
        self.groups
    }

    #[must_use]
    pub fn stride(&self) -> usize {
        self.stride
    }

    #[must_use]
    pub fn group(&self, group: GroupNumber) -> Option<&[u8]> {
        let range = self.range(group)?;
        Some(&self.bytes[range])
    }

    #[must_use]
    pub fn group_mut(&mut self, group: GroupNumber) -> Option<&mut [u8]> {
        let range = self.range(group)?;
        Some(&mut self.bytes[range])
    }

    fn range(&self, group: GroupNumber) -> Option<std::ops::Range<usize>> {
        (group.0 < self.groups).then(|| {
            let start = group.0 as usize * self.stride;
            start..start + self.stride
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn brute_force_run(bm: &[u8], bit_count: u32, hint: u32, run: u32) -> Option<u32> {
        let fits = |s: u32| s + run <= bit_count && (s..s + run).all(|i| !bitmap_get(bm, i));
        let hint = if hint < bit_count { hint } else { 0 };
        (hint..bit_count).find(|&s| fits(s)).or_else(|| (0..hint).find(|&s| fits(s)))
    }

    #[test]
    fn single_bit_helpers_are_lsb_first() {
        let mut bm = vec![0_u8; 4];
        bitmap_set(&mut bm, 7);
        assert_eq!(bm[0], 0x80);
        bitmap_set(&mut bm, 8);
        assert_eq!(bm[1], 0x01);
        assert!(bitmap_get(&bm, 8));
        bitmap_clear(&mut bm, 8);
        assert!(!bitmap_get(&bm, 8));
        // Beyond the slice reads as used, writes are ignored.
        assert!(bitmap_get(&bm, 1000));
        bitmap_set(&mut bm, 1000);
        assert_eq!(bm.len(), 4);
    }

    #[test]
    fn count_free_handles_partial_tail_word() {
        let mut bm = vec![0_u8; 16];
        bitmap_set(&mut bm, 0);
        bitmap_set(&mut bm, 64);
        bitmap_set(&mut bm, 70);
        bitmap_set(&mut bm, 100);
        assert_eq!(count_free(&bm, 128), 124);
        // Only the first 70 bits count; 0 and 64 are used.
        assert_eq!(count_free(&bm, 70), 68);
        assert_eq!(count_free(&bm, 0), 0);
        // bit_count beyond the slice is clamped.
        assert_eq!(count_free(&bm, 10_000), 124);
    }

    #[test]
    fn find_free_run_prefers_hint_then_wraps() {
        let mut bm = vec![0xFF_u8; 4];
        bitmap_clear(&mut bm, 3);
        bitmap_clear(&mut bm, 20);
        assert_eq!(find_free_run(&bm, 32, 5, 1), Some(20));
        assert_eq!(find_free_run(&bm, 32, 21, 1), Some(3));
        assert_eq!(find_free_run(&bm, 32, 3, 1), Some(3));
        // Hint past the end starts from zero.
        assert_eq!(find_free_run(&bm, 32, 99, 1), Some(3));
    }

    #[test]
    fn find_free_run_does_not_wrap_runs_past_end() {
        let mut bm = vec![0xFF_u8; 2];
        bitmap_clear(&mut bm, 15);
        bitmap_clear(&mut bm, 0);
        assert_eq!(find_free_run(&bm, 16, 0, 2), None);
        assert_eq!(find_free_run(&bm, 16, 0, 1), Some(0));
    }

    #[test]
    fn find_free_run_spans_word_boundaries() {
        let mut bm = vec![0xFF_u8; 32];
        for i in 60..70 {
            bitmap_clear(&mut bm, i);
        }
        assert_eq!(find_free_run(&bm, 256, 0, 10), Some(60));
        assert_eq!(find_free_run(&bm, 256, 0, 11), None);
        assert_eq!(find_free_run(&bm, 256, 0, 0), None);
    }

    #[test]
    fn find_free_run_respects_bit_count() {
        let bm = vec![0_u8; 8];
        assert_eq!(find_free_run(&bm, 10, 8, 2), Some(8));
        assert_eq!(find_free_run(&bm, 10, 9, 2), Some(0));
    }

    #[test]
    fn set_range_is_all_or_nothing() {
        let mut bm = vec![0_u8; 4];
        set_range(&mut bm, 32, 4, 8, true, true).expect("claim");
        assert_eq!(count_free(&bm, 32), 24);

        let before = bm.clone();
        let err = set_range(&mut bm, 32, 0, 6, true, true).unwrap_err();
        assert_eq!(err, BitmapError::Conflict { bit: 4 });
        assert_eq!(bm, before);

        let err = set_range(&mut bm, 32, 30, 3, false, false).unwrap_err();
        assert!(matches!(err, BitmapError::OutOfRange { len: 32, .. }));
        assert_eq!(bm, before);

        let err = set_range(&mut bm, 32, 10, 4, false, true).unwrap_err();
        assert_eq!(err, BitmapError::Conflict { bit: 12 });

        set_range(&mut bm, 32, 4, 8, false, true).expect("release");
        assert_eq!(count_free(&bm, 32), 32);
        set_range(&mut bm, 32, 0, 0, true, true).expect("empty range");
    }

    #[test]
    fn set_range_non_exclusive_overwrites() {
        let mut bm = vec![0_u8; 2];
        bitmap_set(&mut bm, 3);
        set_range(&mut bm, 16, 0, 8, true, false).expect("overwrite");
        assert_eq!(bm[0], 0xFF);
    }

    #[test]
    fn arena_slices_are_disjoint() {
        let mut arena = BitmapArena::new(3, 16);
        bitmap_set(arena.group_mut(GroupNumber(1)).expect("g1"), 0);
        assert!(!bitmap_get(arena.group(GroupNumber(0)).expect("g0"), 0));
        assert!(bitmap_get(arena.group(GroupNumber(1)).expect("g1"), 0));
        assert!(!bitmap_get(arena.group(GroupNumber(2)).expect("g2"), 0));
        assert!(arena.group(GroupNumber(3)).is_none());
        assert_eq!(arena.group_count(), 3);
        assert_eq!(arena.stride(), 16);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn find_free_run_matches_brute_force(
            bytes in proptest::collection::vec(any::<u8>(), 1..40),
            hint in 0_u32..400,
            run in 1_u32..12,
            trim in 0_u32..8,
        ) {
            let bit_count = (bytes.len() as u32 * 8).saturating_sub(trim);
            let found = find_free_run(&bytes, bit_count, hint, run);
            prop_assert_eq!(found, brute_force_run(&bytes, bit_count, hint, run));
            if let Some(start) = found {
                for i in start..start + run {
                    prop_assert!(!bitmap_get(&bytes, i));
                }
            }
        }

        #[test]
        fn count_free_matches_bitwise_count(
            bytes in proptest::collection::vec(any::<u8>(), 0..40),
            bit_count in 0_u32..400,
        ) {
            let limit = bit_count.min(bytes.len() as u32 * 8);
            let expected = (0..limit).filter(|&i| !bitmap_get(&bytes, i)).count() as u32;
            prop_assert_eq!(count_free(&bytes, bit_count), expected);
        }
    }
}
