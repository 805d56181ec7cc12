#![forbid(unsafe_code)]
//! Logical-to-physical block mapping for bgfs inodes.
//!
//! Each inode carries fifteen 32-bit block pointers: twelve direct slots,
//! then one single-, one double- and one triple-indirect root. A pointer
//! block holds `block_size / 4` little-endian entries. A zero pointer at any
//! level is a hole.
//!
//! Lookups never allocate. [`get_or_alloc_block`] fills in missing pointer
//! blocks (zeroed before they become reachable) and the data block itself.
//! [`truncate`] and [`punch`] share one reclaim walk that clears pointers
//! deepest first, writes each pointer block before releasing the children it
//! referenced, and frees pointer blocks that end up empty.
//!
//! Space comes from, and returns to, a [`BlockSource`]. The source also
//! persists the inode record so that the inode's root pointers are rewritten
//! before the blocks they referenced go back to the free pool.

use bgfs_block::BlockDevice;
use bgfs_error::{BgfsError, Result};
use bgfs_ondisk::Inode;
use bgfs_types::{BlockNumber, BlockSize, InodeNumber, read_le_u32, write_le_u32};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Number of direct pointer slots in an inode.
pub const DIRECT_BLOCKS: u64 = 12;

const SINGLE_SLOT: usize = 12;
const DOUBLE_SLOT: usize = 13;
const TRIPLE_SLOT: usize = 14;

// ── Block source ────────────────────────────────────────────────────────────

/// Where the mapping engine gets blocks from and returns them to.
pub trait BlockSource {
    /// Allocate one block for `owner`, preferring `goal` when given.
    ///
    /// With no goal the source picks a block near the owner's group.
    fn alloc_block(&mut self, owner: InodeNumber, goal: Option<BlockNumber>)
    -> Result<BlockNumber>;

    /// Return `count` contiguous blocks starting at `start`.
    fn free_blocks(&mut self, owner: InodeNumber, start: BlockNumber, count: u32) -> Result<()>;

    /// Write the inode record back to its table slot.
    fn persist_inode(&mut self, ino: InodeNumber, inode: &Inode) -> Result<()>;
}

// ── Pointer tree geometry ───────────────────────────────────────────────────

/// Position of a logical block in the pointer tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPath {
    /// Inode slot the walk starts from (0..15).
    pub slot: usize,
    /// Number of pointer blocks between the slot and the data block.
    pub depth: usize,
    /// Entry index inside each pointer block, outermost first.
    pub indices: [u64; 3],
}

impl BlockPath {
    /// Locate `logical` for a filesystem with `block_size` byte blocks.
    pub fn resolve(block_size: BlockSize, logical: u64) -> Result<Self> {
        let p = block_size.pointers_per_block();
        if logical < DIRECT_BLOCKS {
            #[expect(clippy::cast_possible_truncation)]
            let slot = logical as usize;
            return Ok(Self {
                slot,
                depth: 0,
                indices: [0; 3],
            });
        }

        let mut n = logical - DIRECT_BLOCKS;
        if n < p {
            return Ok(Self {
                slot: SINGLE_SLOT,
                depth: 1,
                indices: [n, 0, 0],
            });
        }
        n -= p;
        if n < p * p {
            return Ok(Self {
                slot: DOUBLE_SLOT,
                depth: 2,
                indices: [n / p, n % p, 0],
            });
        }
        n -= p * p;
        if n < p * p * p {
            return Ok(Self {
                slot: TRIPLE_SLOT,
                depth: 3,
                indices: [n / (p * p), (n / p) % p, n % p],
            });
        }
        Err(BgfsError::InvalidRange(format!(
            "logical block {logical} beyond the addressable limit {}",
            max_logical_blocks(block_size)
        )))
    }

    fn levels(&self) -> &[u64] {
        &self.indices[..self.depth]
    }
}

/// Number of logical blocks an inode can address.
#[must_use]
pub fn max_logical_blocks(block_size: BlockSize) -> u64 {
    let p = block_size.pointers_per_block();
    DIRECT_BLOCKS + p + p * p + p * p * p
}

/// Indirect roots as (slot, logical base, blocks covered per entry),
/// deepest tree first.
fn indirect_roots(p: u64) -> [(usize, u64, u64); 3] {
    [
        (TRIPLE_SLOT, DIRECT_BLOCKS + p + p * p, p * p),
        (DOUBLE_SLOT, DIRECT_BLOCKS + p, p),
        (SINGLE_SLOT, DIRECT_BLOCKS, 1),
    ]
}

// ── Pointer block I/O ───────────────────────────────────────────────────────

fn entry_offset(idx: u64) -> Result<usize> {
    usize::try_from(idx * 4)
        .map_err(|_| BgfsError::InvalidRange(format!("pointer index {idx} does not fit usize")))
}

fn pointer_at(buf: &[u8], idx: u64) -> Result<u32> {
    read_le_u32(buf, entry_offset(idx)?).map_err(|e| BgfsError::Parse(e.to_string()))
}

fn set_pointer(buf: &mut [u8], idx: u64, value: u32) -> Result<()> {
    write_le_u32(buf, entry_offset(idx)?, value).map_err(|e| BgfsError::Parse(e.to_string()))
}

fn ensure_on_device(dev: &dyn BlockDevice, ptr: u32) -> Result<BlockNumber> {
    let block = BlockNumber(u64::from(ptr));
    if block.0 >= dev.block_count() {
        return Err(BgfsError::CorruptMetadata {
            block: block.0,
            detail: format!("block pointer beyond device end ({})", dev.block_count()),
        });
    }
    Ok(block)
}

fn read_pointers(dev: &dyn BlockDevice, ptr: u32) -> Result<Vec<u8>> {
    let block = ensure_on_device(dev, ptr)?;
    Ok(dev.read_block(block)?.into_inner())
}

fn block_size_of(dev: &dyn BlockDevice) -> Result<BlockSize> {
    BlockSize::new(dev.block_size()).map_err(|e| BgfsError::InvalidGeometry(e.to_string()))
}

/// `i_blocks` sectors occupied by `blocks` filesystem blocks.
fn sector_count(block_size: BlockSize, blocks: u64) -> Result<u32> {
    u64::from(block_size.sectors_per_block())
        .checked_mul(blocks)
        .and_then(|sectors| u32::try_from(sectors).ok())
        .ok_or_else(|| {
            BgfsError::InvalidRange(format!("{blocks} blocks overflow the inode sector count"))
        })
}

// ── Lookup ──────────────────────────────────────────────────────────────────

/// Physical block backing `logical`, or `None` for a hole.
pub fn map_block(dev: &dyn BlockDevice, inode: &Inode, logical: u64) -> Result<Option<BlockNumber>> {
    let path = BlockPath::resolve(block_size_of(dev)?, logical)?;
    let mut ptr = inode.block[path.slot];
    for &idx in path.levels() {
        if ptr == 0 {
            return Ok(None);
        }
        let buf = read_pointers(dev, ptr)?;
        ptr = pointer_at(&buf, idx)?;
    }
    if ptr == 0 {
        return Ok(None);
    }
    ensure_on_device(dev, ptr).map(Some)
}

// ── Allocation ──────────────────────────────────────────────────────────────

struct Grower<'a> {
    dev: &'a dyn BlockDevice,
    source: &'a mut dyn BlockSource,
    ino: InodeNumber,
    goal: Option<BlockNumber>,
    allocated: u64,
}

impl Grower<'_> {
    fn next(&mut self, pointer_block: bool) -> Result<u32> {
        let block = self.source.alloc_block(self.ino, self.goal)?;
        let Ok(raw) = u32::try_from(block.0) else {
            self.source.free_blocks(self.ino, block, 1)?;
            return Err(BgfsError::InvalidGeometry(format!(
                "block {} does not fit a 32-bit pointer",
                block.0
            )));
        };
        self.allocated += 1;
        self.goal = Some(BlockNumber(block.0 + 1));
        if pointer_block {
            let zeroes = vec![0_u8; self.dev.block_size() as usize];
            self.dev.write_block(block, &zeroes)?;
        }
        trace!(ino = self.ino.0, block = block.0, pointer_block, "map_alloc");
        Ok(raw)
    }

    fn descend(&mut self, inode: &mut Inode, path: &BlockPath) -> Result<BlockNumber> {
        if inode.block[path.slot] == 0 {
            inode.block[path.slot] = self.next(path.depth > 0)?;
        }
        let mut parent = inode.block[path.slot];
        let depth = path.depth;
        for (level, &idx) in path.levels().iter().enumerate() {
            let leaf = level + 1 == depth;
            let mut buf = read_pointers(self.dev, parent)?;
            let mut child = pointer_at(&buf, idx)?;
            if child == 0 {
                child = self.next(!leaf)?;
                set_pointer(&mut buf, idx, child)?;
                self.dev.write_block(BlockNumber(u64::from(parent)), &buf)?;
            }
            parent = child;
        }
        ensure_on_device(self.dev, parent)
    }
}

/// Map `logical`, allocating the data block and any missing pointer blocks.
///
/// The goal is the block after the one backing `logical - 1` when that is
/// mapped; otherwise the source chooses. Every allocated block adds
/// `block_size / 512` to the inode's sector count, and the inode is persisted
/// whenever something was allocated, including on a failed partial walk.
pub fn get_or_alloc_block(
    dev: &dyn BlockDevice,
    inode: &mut Inode,
    ino: InodeNumber,
    logical: u64,
    source: &mut dyn BlockSource,
) -> Result<BlockNumber> {
    let bs = block_size_of(dev)?;
    let path = BlockPath::resolve(bs, logical)?;
    if let Some(existing) = map_block(dev, inode, logical)? {
        return Ok(existing);
    }

    let goal = match logical.checked_sub(1) {
        Some(prev) => map_block(dev, inode, prev)?.map(|b| BlockNumber(b.0 + 1)),
        None => None,
    };

    let mut grower = Grower {
        dev,
        source,
        ino,
        goal,
        allocated: 0,
    };
    let result = grower.descend(inode, &path);
    let allocated = grower.allocated;

    if allocated > 0 {
        let sectors = sector_count(bs, allocated)?;
        inode.blocks = inode.blocks.checked_add(sectors).ok_or_else(|| {
            BgfsError::InvalidRange(format!("inode {ino} sector count overflows"))
        })?;
        source.persist_inode(ino, inode)?;
    }
    if let Ok(block) = &result {
        trace!(ino = ino.0, logical, block = block.0, allocated, "map_grow");
    }
    result
}

// ── Reclaim ─────────────────────────────────────────────────────────────────

/// Blocks released by a truncate or punch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimSummary {
    pub data_blocks: u64,
    pub pointer_blocks: u64,
    /// Number of `free_blocks` calls; one per contiguous run.
    pub free_calls: u64,
}

impl ReclaimSummary {
    #[must_use]
    pub fn total_blocks(&self) -> u64 {
        self.data_blocks + self.pointer_blocks
    }
}

struct Reclaimer<'a> {
    dev: &'a dyn BlockDevice,
    source: &'a mut dyn BlockSource,
    ino: InodeNumber,
    pointers: u64,
    summary: ReclaimSummary,
}

impl Reclaimer<'_> {
    /// Free `blocks` in contiguous runs, skipping zero entries.
    fn release(&mut self, blocks: &[u32], pointer_blocks: bool) -> Result<()> {
        let mut iter = blocks.iter().copied().filter(|&b| b != 0);
        let Some(first) = iter.next() else {
            return Ok(());
        };
        let (mut start, mut len) = (first, 1_u32);
        for block in iter {
            if start.checked_add(len) == Some(block) {
                len += 1;
                continue;
            }
            self.flush(start, len, pointer_blocks)?;
            start = block;
            len = 1;
        }
        self.flush(start, len, pointer_blocks)
    }

    fn flush(&mut self, start: u32, len: u32, pointer_blocks: bool) -> Result<()> {
        trace!(ino = self.ino.0, start, len, pointer_blocks, "map_free_run");
        self.source
            .free_blocks(self.ino, BlockNumber(u64::from(start)), len)?;
        self.summary.free_calls += 1;
        if pointer_blocks {
            self.summary.pointer_blocks += u64::from(len);
        } else {
            self.summary.data_blocks += u64::from(len);
        }
        Ok(())
    }

    /// Clear every pointer under `block` that covers logical blocks in
    /// `[first, end)`. Entry `i` covers `[base + i*span, base + (i+1)*span)`.
    ///
    /// Returns `true` when the block holds no pointers afterwards.
    fn reclaim_subtree(&mut self, block: u32, base: u64, span: u64, first: u64, end: u64) -> Result<bool> {
        let mut buf = read_pointers(self.dev, block)?;
        let mut data = Vec::new();
        let mut emptied = Vec::new();
        let mut live = false;
        let mut dirty = false;

        for idx in 0..self.pointers {
            let ptr = pointer_at(&buf, idx)?;
            if ptr == 0 {
                continue;
            }
            let entry_base = base + idx * span;
            let entry_end = entry_base + span;
            if entry_end <= first || entry_base >= end {
                live = true;
                continue;
            }
            if span == 1 {
                data.push(ptr);
            } else if self.reclaim_subtree(ptr, entry_base, span / self.pointers, first, end)? {
                emptied.push(ptr);
            } else {
                live = true;
                continue;
            }
            set_pointer(&mut buf, idx, 0)?;
            dirty = true;
        }

        if dirty {
            self.dev.write_block(BlockNumber(u64::from(block)), &buf)?;
        }
        self.release(&data, false)?;
        self.release(&emptied, true)?;
        Ok(!live)
    }

    /// Walk the inode's roots. Subtree blocks are freed as the walk goes;
    /// blocks referenced straight from the inode are returned so they can be
    /// freed after the inode is persisted.
    fn reclaim_roots(&mut self, inode: &mut Inode, first: u64, end: u64) -> Result<(Vec<u32>, Vec<u32>)> {
        let mut roots = Vec::new();
        for (slot, base, span) in indirect_roots(self.pointers) {
            let ptr = inode.block[slot];
            if ptr == 0 {
                continue;
            }
            let root_end = base + span * self.pointers;
            if root_end <= first || base >= end {
                continue;
            }
            if self.reclaim_subtree(ptr, base, span, first, end)? {
                roots.push(ptr);
                inode.block[slot] = 0;
            }
        }

        let mut direct = Vec::new();
        for logical in first..end.min(DIRECT_BLOCKS) {
            #[expect(clippy::cast_possible_truncation)]
            let slot = logical as usize;
            if inode.block[slot] != 0 {
                direct.push(inode.block[slot]);
                inode.block[slot] = 0;
            }
        }
        Ok((direct, roots))
    }
}

fn reclaim(
    dev: &dyn BlockDevice,
    inode: &mut Inode,
    ino: InodeNumber,
    first: u64,
    end: u64,
    source: &mut dyn BlockSource,
) -> Result<ReclaimSummary> {
    let bs = block_size_of(dev)?;
    let mut reclaimer = Reclaimer {
        dev,
        source,
        ino,
        pointers: bs.pointers_per_block(),
        summary: ReclaimSummary::default(),
    };
    let (direct, roots) = reclaimer.reclaim_roots(inode, first, end)?;

    let pending = (direct.iter().filter(|&&b| b != 0).count() + roots.len()) as u64;
    let released = reclaimer.summary.total_blocks() + pending;
    inode.blocks = inode.blocks.saturating_sub(sector_count(bs, released)?);
    reclaimer.source.persist_inode(ino, inode)?;

    reclaimer.release(&direct, false)?;
    reclaimer.release(&roots, true)?;

    let summary = reclaimer.summary;
    debug!(
        ino = ino.0,
        first,
        end,
        data_blocks = summary.data_blocks,
        pointer_blocks = summary.pointer_blocks,
        free_calls = summary.free_calls,
        "map_reclaim"
    );
    Ok(summary)
}

/// Set the inode size to `new_len`, freeing every block past the new end.
///
/// Blocks with logical index `>= ceil(new_len / block_size)` are released
/// along with pointer blocks left empty. A partial tail block stays mapped;
/// zeroing its tail is the caller's job. Growing only changes the size.
pub fn truncate(
    dev: &dyn BlockDevice,
    inode: &mut Inode,
    ino: InodeNumber,
    new_len: u64,
    source: &mut dyn BlockSource,
) -> Result<ReclaimSummary> {
    let bs = block_size_of(dev)?;
    let old_len = inode.size;
    inode.size = new_len;
    if new_len >= old_len {
        source.persist_inode(ino, inode)?;
        trace!(ino = ino.0, old_len, new_len, "map_truncate_grow");
        return Ok(ReclaimSummary::default());
    }
    reclaim(dev, inode, ino, bs.blocks_for_len(new_len), u64::MAX, source)
}

/// Free every block lying entirely inside `[start, start + count)`.
///
/// The inode size is unchanged. Partially covered blocks at either edge stay
/// mapped.
pub fn punch(
    dev: &dyn BlockDevice,
    inode: &mut Inode,
    ino: InodeNumber,
    start: u64,
    count: u64,
    source: &mut dyn BlockSource,
) -> Result<ReclaimSummary> {
    if count == 0 {
        return Err(BgfsError::InvalidRange("punch of zero bytes".to_owned()));
    }
    let end_byte = start
        .checked_add(count)
        .filter(|&end| end <= inode.size)
        .ok_or_else(|| {
            BgfsError::InvalidRange(format!(
                "punch [{start}, {start}+{count}) exceeds file size {}",
                inode.size
            ))
        })?;

    let bs = block_size_of(dev)?;
    let first = bs.blocks_for_len(start);
    let end = bs.byte_to_block(end_byte);
    if first >= end {
        trace!(ino = ino.0, start, count, "map_punch_no_whole_block");
        return Ok(ReclaimSummary::default());
    }
    reclaim(dev, inode, ino, first, end, source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bgfs_block::{ByteBlockDevice, MemByteDevice};
    use bgfs_types::S_IFREG;
    use proptest::prelude::*;
    use std::collections::{BTreeSet, HashSet};

    type MemDev = ByteBlockDevice<MemByteDevice>;

    fn mem_dev(block_size: u32, blocks: usize) -> MemDev {
        ByteBlockDevice::new(MemByteDevice::new(block_size as usize * blocks), block_size)
            .expect("device")
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Persist,
        Free(u64, u32),
    }

    /// Hands out blocks from `first..limit`, honouring free goals.
    struct TestSource {
        first: u64,
        limit: u64,
        used: BTreeSet<u64>,
        events: Vec<Event>,
        persisted: Option<Inode>,
    }

    impl TestSource {
        fn new(first: u64, limit: u64) -> Self {
            Self {
                first,
                limit,
                used: BTreeSet::new(),
                events: Vec::new(),
                persisted: None,
            }
        }

        fn frees(&self) -> Vec<(u64, u32)> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    Event::Free(s, c) => Some((*s, *c)),
                    Event::Persist => None,
                })
                .collect()
        }
    }

    impl BlockSource for TestSource {
        fn alloc_block(&mut self, _owner: InodeNumber, goal: Option<BlockNumber>) -> Result<BlockNumber> {
            if let Some(goal) = goal {
                if goal.0 >= self.first && goal.0 < self.limit && self.used.insert(goal.0) {
                    return Ok(goal);
                }
            }
            let block = (self.first..self.limit)
                .find(|b| !self.used.contains(b))
                .ok_or(BgfsError::NoSpace)?;
            self.used.insert(block);
            Ok(BlockNumber(block))
        }

        fn free_blocks(&mut self, _owner: InodeNumber, start: BlockNumber, count: u32) -> Result<()> {
            for b in start.0..start.0 + u64::from(count) {
                if !self.used.remove(&b) {
                    return Err(BgfsError::DoubleFree { block: b });
                }
            }
            self.events.push(Event::Free(start.0, count));
            Ok(())
        }

        fn persist_inode(&mut self, _ino: InodeNumber, inode: &Inode) -> Result<()> {
            self.persisted = Some(inode.clone());
            self.events.push(Event::Persist);
            Ok(())
        }
    }

    const INO: InodeNumber = InodeNumber(12);

    fn regular_inode() -> Inode {
        Inode {
            mode: S_IFREG | 0o644,
            links_count: 1,
            ..Inode::default()
        }
    }

    fn grow(dev: &MemDev, inode: &mut Inode, src: &mut TestSource, blocks: u64) -> Vec<u64> {
        let mapped: Vec<u64> = (0..blocks)
            .map(|l| get_or_alloc_block(dev, inode, INO, l, src).expect("alloc").0)
            .collect();
        inode.size = blocks * u64::from(dev.block_size());
        mapped
    }

    // ── Geometry ───────────────────────────────────────────────────────────

    #[test]
    fn resolve_tree_boundaries_1k() {
        let bs = BlockSize::new(1024).unwrap();
        let p = 256;
        assert_eq!(BlockPath::resolve(bs, 11).unwrap().slot, 11);
        assert_eq!(BlockPath::resolve(bs, 11).unwrap().depth, 0);

        let single = BlockPath::resolve(bs, 12).unwrap();
        assert_eq!((single.slot, single.depth, single.indices[0]), (12, 1, 0));
        let last_single = BlockPath::resolve(bs, 12 + p - 1).unwrap();
        assert_eq!(last_single.indices[0], p - 1);

        let double = BlockPath::resolve(bs, 12 + p + p + 3).unwrap();
        assert_eq!((double.slot, double.depth), (13, 2));
        assert_eq!(double.levels(), &[1, 3]);

        let triple = BlockPath::resolve(bs, 12 + p + p * p).unwrap();
        assert_eq!((triple.slot, triple.depth), (14, 3));
        assert_eq!(triple.levels(), &[0, 0, 0]);

        let max = max_logical_blocks(bs);
        let last = BlockPath::resolve(bs, max - 1).unwrap();
        assert_eq!(last.levels(), &[p - 1, p - 1, p - 1]);
        assert!(matches!(
            BlockPath::resolve(bs, max),
            Err(BgfsError::InvalidRange(_))
        ));
    }

    // ── Lookup and growth ──────────────────────────────────────────────────

    #[test]
    fn empty_inode_maps_only_holes() {
        let dev = mem_dev(1024, 64);
        let inode = regular_inode();
        for logical in [0, 11, 12, 300, 70_000] {
            assert_eq!(map_block(&dev, &inode, logical).unwrap(), None);
        }
    }

    #[test]
    fn sequential_growth_is_contiguous_and_counts_sectors() {
        let dev = mem_dev(1024, 1024);
        let mut src = TestSource::new(10, 1024);
        let mut inode = regular_inode();

        let mapped = grow(&dev, &mut inode, &mut src, 300);
        for (logical, block) in mapped.iter().enumerate() {
            assert_eq!(
                map_block(&dev, &inode, logical as u64).unwrap(),
                Some(BlockNumber(*block))
            );
        }
        // Single indirect, double root and one second-level block.
        assert_eq!(src.used.len(), 303);
        assert_eq!(inode.blocks, 303 * 2);
        assert!(mapped[..12].windows(2).all(|w| w[1] == w[0] + 1));
        // The single-indirect block sits between logical 11 and 12.
        assert_eq!(u64::from(inode.block[SINGLE_SLOT]), mapped[11] + 1);
        assert_eq!(mapped[12], mapped[11] + 2);
        assert_eq!(src.persisted.as_ref().map(|i| i.blocks), Some(inode.blocks));
    }

    #[test]
    fn get_or_alloc_is_idempotent() {
        let dev = mem_dev(1024, 128);
        let mut src = TestSource::new(10, 128);
        let mut inode = regular_inode();
        let first = get_or_alloc_block(&dev, &mut inode, INO, 40, &mut src).unwrap();
        let used = src.used.len();
        let again = get_or_alloc_block(&dev, &mut inode, INO, 40, &mut src).unwrap();
        assert_eq!(first, again);
        assert_eq!(src.used.len(), used);
    }

    #[test]
    fn sparse_write_leaves_holes_and_zeroed_pointer_block() {
        let dev = mem_dev(1024, 128);
        let mut src = TestSource::new(10, 128);
        let mut inode = regular_inode();
        let block = get_or_alloc_block(&dev, &mut inode, INO, 20, &mut src).unwrap();
        assert_eq!(map_block(&dev, &inode, 20).unwrap(), Some(block));
        for logical in (0..20).chain(21..30) {
            assert_eq!(map_block(&dev, &inode, logical).unwrap(), None);
        }
        let pointers = dev
            .read_block(BlockNumber(u64::from(inode.block[SINGLE_SLOT])))
            .unwrap();
        let nonzero = pointers
            .as_slice()
            .chunks(4)
            .filter(|c| c.iter().any(|&b| b != 0))
            .count();
        assert_eq!(nonzero, 1);
    }

    #[test]
    fn exhausted_source_keeps_partial_tree_persisted() {
        let dev = mem_dev(1024, 64);
        // Room for the pointer block only.
        let mut src = TestSource::new(10, 11);
        let mut inode = regular_inode();
        let err = get_or_alloc_block(&dev, &mut inode, INO, 12, &mut src).unwrap_err();
        assert!(matches!(err, BgfsError::NoSpace));
        assert_eq!(inode.block[SINGLE_SLOT], 10);
        assert_eq!(src.persisted.as_ref().map(|i| i.block[SINGLE_SLOT]), Some(10));
        assert_eq!(inode.blocks, 2);
    }

    #[test]
    fn pointer_past_device_end_is_corrupt() {
        let dev = mem_dev(1024, 64);
        let mut inode = regular_inode();
        inode.block[SINGLE_SLOT] = 5_000;
        let err = map_block(&dev, &inode, 12).unwrap_err();
        assert!(matches!(err, BgfsError::CorruptMetadata { block: 5_000, .. }));
    }

    // ── Truncate ───────────────────────────────────────────────────────────

    #[test]
    fn truncate_to_zero_frees_everything() {
        let dev = mem_dev(1024, 1024);
        let mut src = TestSource::new(10, 1024);
        let mut inode = regular_inode();
        grow(&dev, &mut inode, &mut src, 300);

        let summary = truncate(&dev, &mut inode, INO, 0, &mut src).unwrap();
        assert_eq!(summary.data_blocks, 300);
        assert_eq!(summary.pointer_blocks, 3);
        assert!(src.used.is_empty());
        assert_eq!(inode.block, [0; 15]);
        assert_eq!(inode.blocks, 0);
        assert_eq!(inode.size, 0);
        for logical in [0, 12, 299] {
            assert_eq!(map_block(&dev, &inode, logical).unwrap(), None);
        }
    }

    #[test]
    fn truncate_keeps_partial_tail_block() {
        let dev = mem_dev(1024, 1024);
        let mut src = TestSource::new(10, 1024);
        let mut inode = regular_inode();
        let mapped = grow(&dev, &mut inode, &mut src, 300);

        let summary = truncate(&dev, &mut inode, INO, 20 * 1024 + 1, &mut src).unwrap();
        assert_eq!(summary.data_blocks, 279);
        assert_eq!(summary.pointer_blocks, 2);
        assert_eq!(
            map_block(&dev, &inode, 20).unwrap(),
            Some(BlockNumber(mapped[20]))
        );
        assert_eq!(map_block(&dev, &inode, 21).unwrap(), None);
        assert_ne!(inode.block[SINGLE_SLOT], 0);
        assert_eq!(inode.block[DOUBLE_SLOT], 0);
        // 21 data blocks plus the single-indirect block.
        assert_eq!(src.used.len(), 22);
        assert_eq!(inode.blocks, 22 * 2);
    }

    #[test]
    fn truncate_to_direct_range_frees_single_indirect() {
        let dev = mem_dev(1024, 256);
        let mut src = TestSource::new(10, 256);
        let mut inode = regular_inode();
        grow(&dev, &mut inode, &mut src, 40);

        let summary = truncate(&dev, &mut inode, INO, 12 * 1024, &mut src).unwrap();
        assert_eq!(summary.data_blocks, 28);
        assert_eq!(summary.pointer_blocks, 1);
        assert_eq!(inode.block[SINGLE_SLOT], 0);
        assert_eq!(src.used.len(), 12);
    }

    #[test]
    fn contiguous_blocks_free_in_one_call() {
        let dev = mem_dev(1024, 128);
        let mut src = TestSource::new(10, 128);
        let mut inode = regular_inode();
        let mapped = grow(&dev, &mut inode, &mut src, 10);

        let summary = truncate(&dev, &mut inode, INO, 0, &mut src).unwrap();
        assert_eq!(summary.free_calls, 1);
        assert_eq!(src.frees(), vec![(mapped[0], 10)]);
    }

    #[test]
    fn inode_is_persisted_before_its_roots_are_freed() {
        let dev = mem_dev(1024, 256);
        let mut src = TestSource::new(10, 256);
        let mut inode = regular_inode();
        grow(&dev, &mut inode, &mut src, 20);
        let single = u64::from(inode.block[SINGLE_SLOT]);
        src.events.clear();

        truncate(&dev, &mut inode, INO, 0, &mut src).unwrap();
        let persist_at = src
            .events
            .iter()
            .position(|e| *e == Event::Persist)
            .expect("persisted");
        let root_free_at = src
            .events
            .iter()
            .position(|e| matches!(e, Event::Free(s, 1) if *s == single))
            .expect("root freed");
        assert!(persist_at < root_free_at);
        // Data under the single-indirect block went before the inode write.
        assert!(matches!(src.events[0], Event::Free(_, 8)));
    }

    #[test]
    fn triple_indirect_tree_is_punched_then_reclaimed() {
        let dev = mem_dev(1024, 256);
        let mut src = TestSource::new(10, 256);
        let mut inode = regular_inode();
        let base = 12 + 256 + 256 * 256;
        let logicals = [base, base + 1, base + 300, base + 70_000];
        for &logical in &logicals {
            get_or_alloc_block(&dev, &mut inode, INO, logical, &mut src).unwrap();
        }
        assert_ne!(inode.block[TRIPLE_SLOT], 0);
        assert!(inode.block[..TRIPLE_SLOT].iter().all(|&p| p == 0));
        // Triple root, two second-level and three third-level pointer blocks.
        assert_eq!(src.used.len(), 4 + 6);
        assert_eq!(inode.blocks, 10 * 2);
        inode.size = (base + 70_001) * 1024;

        // base + 300 is alone under its third-level block.
        let summary = punch(&dev, &mut inode, INO, (base + 300) * 1024, 1024, &mut src).unwrap();
        assert_eq!((summary.data_blocks, summary.pointer_blocks), (1, 1));
        assert_eq!(map_block(&dev, &inode, base + 300).unwrap(), None);
        assert!(map_block(&dev, &inode, base + 1).unwrap().is_some());
        assert_eq!(src.used.len(), 8);

        let summary = truncate(&dev, &mut inode, INO, 0, &mut src).unwrap();
        assert_eq!((summary.data_blocks, summary.pointer_blocks), (3, 5));
        assert!(src.used.is_empty());
        assert_eq!(inode.block, [0; 15]);
        assert_eq!(inode.blocks, 0);
        for logical in logicals {
            assert_eq!(map_block(&dev, &inode, logical).unwrap(), None);
        }
    }

    #[test]
    fn growing_truncate_only_changes_size() {
        let dev = mem_dev(1024, 64);
        let mut src = TestSource::new(10, 64);
        let mut inode = regular_inode();
        grow(&dev, &mut inode, &mut src, 3);
        let used = src.used.clone();

        let summary = truncate(&dev, &mut inode, INO, 1 << 20, &mut src).unwrap();
        assert_eq!(summary, ReclaimSummary::default());
        assert_eq!(inode.size, 1 << 20);
        assert_eq!(src.used, used);
        assert_eq!(src.persisted.as_ref().map(|i| i.size), Some(1 << 20));
    }

    // ── Punch ──────────────────────────────────────────────────────────────

    #[test]
    fn punch_second_4k_block_frees_exactly_one_block() {
        let dev = mem_dev(4096, 64);
        let mut src = TestSource::new(4, 64);
        let mut inode = regular_inode();
        let mapped = grow(&dev, &mut inode, &mut src, 10);

        let summary = punch(&dev, &mut inode, INO, 4096, 4096, &mut src).unwrap();
        assert_eq!(summary.data_blocks, 1);
        assert_eq!(summary.pointer_blocks, 0);
        assert_eq!(src.frees(), vec![(mapped[1], 1)]);
        assert_eq!(map_block(&dev, &inode, 1).unwrap(), None);
        assert_eq!(map_block(&dev, &inode, 0).unwrap(), Some(BlockNumber(mapped[0])));
        assert_eq!(map_block(&dev, &inode, 2).unwrap(), Some(BlockNumber(mapped[2])));
        assert_eq!(inode.size, 10 * 4096);
        assert_eq!(inode.blocks, 9 * 8);
    }

    #[test]
    fn punch_rejects_empty_and_out_of_bounds_ranges() {
        let dev = mem_dev(1024, 64);
        let mut src = TestSource::new(10, 64);
        let mut inode = regular_inode();
        grow(&dev, &mut inode, &mut src, 4);

        assert!(matches!(
            punch(&dev, &mut inode, INO, 0, 0, &mut src),
            Err(BgfsError::InvalidRange(_))
        ));
        assert!(matches!(
            punch(&dev, &mut inode, INO, 3 * 1024, 2 * 1024, &mut src),
            Err(BgfsError::InvalidRange(_))
        ));
        assert!(matches!(
            punch(&dev, &mut inode, INO, u64::MAX, 2, &mut src),
            Err(BgfsError::InvalidRange(_))
        ));
        assert_eq!(src.used.len(), 4);
    }

    #[test]
    fn punch_within_one_block_frees_nothing() {
        let dev = mem_dev(1024, 64);
        let mut src = TestSource::new(10, 64);
        let mut inode = regular_inode();
        grow(&dev, &mut inode, &mut src, 4);
        src.events.clear();

        let summary = punch(&dev, &mut inode, INO, 100, 1500, &mut src).unwrap();
        assert_eq!(summary, ReclaimSummary::default());
        assert!(src.events.is_empty());
    }

    #[test]
    fn punch_empties_pointer_block_in_the_middle() {
        let dev = mem_dev(1024, 1024);
        let mut src = TestSource::new(10, 1024);
        let mut inode = regular_inode();
        grow(&dev, &mut inode, &mut src, 300);

        // Whole single-indirect range: logical 12..268.
        let summary = punch(&dev, &mut inode, INO, 12 * 1024, 256 * 1024, &mut src).unwrap();
        assert_eq!(summary.data_blocks, 256);
        assert_eq!(summary.pointer_blocks, 1);
        assert_eq!(inode.block[SINGLE_SLOT], 0);
        assert!(map_block(&dev, &inode, 11).unwrap().is_some());
        assert!(map_block(&dev, &inode, 268).unwrap().is_some());
    }

    // ── Properties ─────────────────────────────────────────────────────────

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn truncate_frees_exactly_the_tail(
            writes in proptest::collection::btree_set(0_u64..400, 1..40),
            keep in 0_u64..420,
        ) {
            let dev = mem_dev(1024, 2048);
            let mut src = TestSource::new(10, 2048);
            let mut inode = regular_inode();
            for &logical in &writes {
                get_or_alloc_block(&dev, &mut inode, INO, logical, &mut src).unwrap();
            }
            inode.size = 420 * 1024;

            truncate(&dev, &mut inode, INO, keep * 1024, &mut src).unwrap();

            let mut reachable = HashSet::new();
            for logical in 0..420 {
                let mapped = map_block(&dev, &inode, logical).unwrap();
                prop_assert_eq!(mapped.is_some(), writes.contains(&logical) && logical < keep);
                if let Some(block) = mapped {
                    reachable.insert(block.0);
                }
            }
            for slot in SINGLE_SLOT..=TRIPLE_SLOT {
                if inode.block[slot] != 0 {
                    reachable.insert(u64::from(inode.block[slot]));
                }
            }
            // Every surviving block is either data or a non-empty pointer block.
            prop_assert!(src.used.len() >= reachable.len());
            prop_assert_eq!(u64::from(inode.blocks), src.used.len() as u64 * 2);
            if keep == 0 {
                prop_assert!(src.used.is_empty());
            }
        }
    }
}
