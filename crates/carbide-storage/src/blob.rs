//! Blobs and the blob arena
//!
//! A blob owns one or more physical extents and is the unit of sharing
//! between objects. Extent map entries reference blobs through stable
//! arena handles; the arena keeps an explicit reference count per blob
//! and prunes slots when the count drops to zero.

use crate::extent::Extent;
use carbide_common::checksum::{chunked_crc32c, compute_crc32c};
use carbide_common::is_aligned;
use std::fmt;

/// Stable arena handle for a blob
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlobId(u32);

impl BlobId {
    /// Create from a raw slot index
    #[must_use]
    pub const fn from_index(index: u32) -> Self {
        Self(index)
    }

    /// The raw slot index
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({})", self.0)
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical storage unit backing one or more logical ranges
///
/// Payload space is the concatenation of the owned extents. The unused
/// mask tracks, per block, which payload regions hold no valid data yet;
/// `csum` holds one CRC32C per block, valid wherever the block is used.
pub struct Blob {
    extents: Vec<Extent>,
    real_length: u64,
    compressed_length: u64,
    unused: u64,
    refs: u32,
    shared: bool,
    csum: Vec<u32>,
    block_size: u64,
}

impl Blob {
    /// Create an uncompressed blob over freshly allocated extents
    ///
    /// All payload space starts out unused; `put_data` fills it in.
    #[must_use]
    pub fn new(extents: Vec<Extent>, block_size: u64) -> Self {
        let capacity: u64 = extents.iter().map(|e| e.length).sum();
        assert!(capacity > 0, "blob must own space");
        assert!(is_aligned(capacity, block_size));
        let blocks = capacity / block_size;
        assert!(blocks <= 64, "blob capacity {capacity} exceeds unused mask");
        Self {
            extents,
            real_length: 0,
            compressed_length: 0,
            unused: mask_for(blocks),
            refs: 0,
            shared: false,
            csum: vec![0; blocks as usize],
            block_size,
        }
    }

    /// Create a compressed blob
    ///
    /// `real_length` is the logical span the payload decodes to;
    /// `compressed_length` is the encoded byte count actually stored.
    #[must_use]
    pub fn new_compressed(
        extents: Vec<Extent>,
        real_length: u64,
        compressed_length: u64,
        block_size: u64,
    ) -> Self {
        assert!(compressed_length > 0 && compressed_length < real_length);
        let mut blob = Self::new(extents, block_size);
        blob.real_length = real_length;
        blob.compressed_length = compressed_length;
        blob
    }

    /// Total payload capacity in bytes
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.extents.iter().map(|e| e.length).sum()
    }

    /// The physical extents backing this blob
    #[must_use]
    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    /// Logical length of the stored data
    #[must_use]
    pub const fn real_length(&self) -> u64 {
        self.real_length
    }

    /// Encoded length, zero when the blob is uncompressed
    #[must_use]
    pub const fn compressed_length(&self) -> u64 {
        self.compressed_length
    }

    /// Whether the payload is compressed
    #[must_use]
    pub const fn is_compressed(&self) -> bool {
        self.compressed_length != 0
    }

    /// Whether the blob is referenced by more than one object
    #[must_use]
    pub const fn is_shared(&self) -> bool {
        self.shared
    }

    /// Mark the blob as shared (post-clone); in-place mutation stops here
    pub fn mark_shared(&mut self) {
        self.shared = true;
    }

    /// Current reference count
    #[must_use]
    pub const fn refs(&self) -> u32 {
        self.refs
    }

    /// The unused mask, one bit per block, set = no valid data
    #[must_use]
    pub const fn unused_blocks(&self) -> u64 {
        self.unused
    }

    /// Whether the block at `index` holds no valid data
    #[must_use]
    pub fn is_block_unused(&self, index: u64) -> bool {
        assert!(index < self.capacity() / self.block_size);
        self.unused & (1u64 << index) != 0
    }

    /// Whether any payload space is still unused
    #[must_use]
    pub const fn has_unused(&self) -> bool {
        self.unused != 0
    }

    /// Record data placed at `blob_off`; both ends block-aligned
    ///
    /// Clears the unused bits of the covered blocks and refreshes their
    /// checksums. Does not touch `real_length`; callers that extend the
    /// valid payload call `grow_real_length`.
    pub fn put_data(&mut self, blob_off: u64, data: &[u8]) {
        assert!(is_aligned(blob_off, self.block_size));
        assert!(is_aligned(data.len() as u64, self.block_size));
        assert!(blob_off + data.len() as u64 <= self.capacity());
        let first = blob_off / self.block_size;
        for (i, chunk) in data.chunks(self.block_size as usize).enumerate() {
            let block = first + i as u64;
            self.unused &= !(1u64 << block);
            self.csum[block as usize] = compute_crc32c(chunk);
        }
    }

    /// Raise the valid-payload high-water mark to at least `end`
    pub fn grow_real_length(&mut self, end: u64) {
        debug_assert!(end <= self.capacity());
        self.real_length = self.real_length.max(end);
    }

    /// Verify stored checksums against `data` at `blob_off` (block-aligned)
    #[must_use]
    pub fn verify_csum(&self, blob_off: u64, data: &[u8]) -> bool {
        assert!(is_aligned(blob_off, self.block_size));
        assert!(is_aligned(data.len() as u64, self.block_size));
        let first = (blob_off / self.block_size) as usize;
        chunked_crc32c(data, self.block_size as usize)
            .iter()
            .enumerate()
            .all(|(i, &sum)| self.csum[first + i] == sum)
    }

    /// Whether the writer may grow this blob in place
    #[must_use]
    pub fn can_expand(&self, max_blob_size: u64) -> bool {
        !self.shared && !self.is_compressed() && self.capacity() < max_blob_size
    }

    /// Append freshly allocated extents, growing payload space
    pub fn expand(&mut self, extra: &[Extent]) {
        let old_blocks = self.capacity() / self.block_size;
        for &e in extra {
            assert!(is_aligned(e.length, self.block_size));
            if let Some(last) = self.extents.last_mut()
                && last.end() == e.offset
            {
                last.length += e.length;
            } else {
                self.extents.push(e);
            }
        }
        let new_blocks = self.capacity() / self.block_size;
        assert!(new_blocks <= 64, "expanded blob exceeds unused mask");
        for block in old_blocks..new_blocks {
            self.unused |= 1u64 << block;
        }
        self.csum.resize(new_blocks as usize, 0);
    }

    /// Resolve a payload range to disk ranges across the owned extents
    #[must_use]
    pub fn disk_segments(&self, blob_off: u64, length: u64) -> Vec<Extent> {
        assert!(blob_off + length <= self.capacity());
        let mut segments = Vec::new();
        let mut pos = 0u64;
        let mut remaining = length;
        let mut start = blob_off;
        for extent in &self.extents {
            let extent_end = pos + extent.length;
            if remaining > 0 && start < extent_end {
                let within = start - pos;
                let take = remaining.min(extent.length - within);
                segments.push(Extent::new(extent.offset + within, take));
                start += take;
                remaining -= take;
            }
            pos = extent_end;
            if remaining == 0 {
                break;
            }
        }
        debug_assert_eq!(remaining, 0);
        segments
    }
}

const fn mask_for(blocks: u64) -> u64 {
    if blocks >= 64 { u64::MAX } else { (1u64 << blocks) - 1 }
}

/// Arena of blobs with explicit reference counting
///
/// Extent map entries across all objects of a store hold `BlobId`
/// handles into one arena. A slot is pruned when its count reaches
/// zero; what happens to the freed physical space is the caller's
/// decision (shared blobs are settled by the transaction layer).
#[derive(Default)]
pub struct BlobArena {
    slots: Vec<Option<Blob>>,
    free_slots: Vec<u32>,
}

impl BlobArena {
    /// Create an empty arena
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live blobs
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Whether the arena holds no live blobs
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a blob, returning its handle
    pub fn insert(&mut self, blob: Blob) -> BlobId {
        if let Some(index) = self.free_slots.pop() {
            self.slots[index as usize] = Some(blob);
            BlobId(index)
        } else {
            self.slots.push(Some(blob));
            BlobId((self.slots.len() - 1) as u32)
        }
    }

    /// Whether `id` refers to a live blob
    #[must_use]
    pub fn contains(&self, id: BlobId) -> bool {
        self.slots
            .get(id.0 as usize)
            .is_some_and(Option::is_some)
    }

    /// Borrow a blob; a dangling handle is a corruption risk and fatal
    #[must_use]
    pub fn get(&self, id: BlobId) -> &Blob {
        match self.slots.get(id.0 as usize).and_then(Option::as_ref) {
            Some(blob) => blob,
            None => panic!("dangling blob handle {id}"),
        }
    }

    /// Mutably borrow a blob; a dangling handle is fatal
    pub fn get_mut(&mut self, id: BlobId) -> &mut Blob {
        match self.slots.get_mut(id.0 as usize).and_then(Option::as_mut) {
            Some(blob) => blob,
            None => panic!("dangling blob handle {id}"),
        }
    }

    /// Increment the reference count of a blob
    pub fn inc_ref(&mut self, id: BlobId) {
        self.get_mut(id).refs += 1;
    }

    /// Decrement the reference count, returning the remaining count
    ///
    /// The slot is not pruned here; the writer decides what to do with
    /// a blob that reached zero (release extents vs. hand the decision
    /// to the transaction layer for shared blobs).
    pub fn dec_ref(&mut self, id: BlobId) -> u32 {
        let blob = self.get_mut(id);
        assert!(blob.refs > 0, "reference underflow on blob {id}");
        blob.refs -= 1;
        blob.refs
    }

    /// Remove a blob from the arena, returning it
    pub fn remove(&mut self, id: BlobId) -> Blob {
        match self.slots.get_mut(id.0 as usize).and_then(Option::take) {
            Some(blob) => {
                self.free_slots.push(id.0);
                blob
            }
            None => panic!("dangling blob handle {id}"),
        }
    }

    /// Iterate live blobs
    pub fn iter(&self) -> impl Iterator<Item = (BlobId, &Blob)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|b| (BlobId(i as u32), b)))
    }
}
