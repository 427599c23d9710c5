//! Physical extents and the per-object logical-to-physical extent map
//!
//! An `Extent` is a contiguous physical byte range, aligned to the
//! allocation unit. The `ExtentMap` is the ordered, non-overlapping
//! index from an object's logical offsets to blob-relative positions;
//! it is mutated only by the writer, one operation at a time.

use crate::blob::BlobId;
use carbide_common::{Error, Result};
use std::collections::BTreeMap;

/// A contiguous physical byte range on the device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    /// Starting disk offset in bytes
    pub offset: u64,
    /// Length in bytes
    pub length: u64,
}

impl Extent {
    /// Create a new extent
    #[must_use]
    pub const fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// One past the last byte of the extent
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Check if this extent contains a disk offset
    #[must_use]
    pub const fn contains(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.end()
    }

    /// Check if two extents overlap
    #[must_use]
    pub const fn overlaps(&self, other: &Extent) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    /// Try to merge with an adjacent extent
    #[must_use]
    pub fn try_merge(&self, other: &Extent) -> Option<Extent> {
        if self.end() == other.offset {
            Some(Extent::new(self.offset, self.length + other.length))
        } else if other.end() == self.offset {
            Some(Extent::new(other.offset, self.length + other.length))
        } else {
            None
        }
    }

    /// Check offset and length alignment against a power-of-two unit
    #[must_use]
    pub const fn is_aligned(&self, unit: u64) -> bool {
        carbide_common::is_aligned(self.offset, unit) && carbide_common::is_aligned(self.length, unit)
    }
}

/// One logical-to-physical mapping of the extent map
///
/// Maps `[logical_offset, logical_offset + length)` of the object onto
/// `[blob_offset, blob_offset + length)` of the referenced blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtentMapEntry {
    /// Object-logical starting offset in bytes
    pub logical_offset: u64,
    /// Length in bytes
    pub length: u64,
    /// Arena handle of the backing blob
    pub blob: BlobId,
    /// Starting offset within the blob's payload space
    pub blob_offset: u64,
}

impl ExtentMapEntry {
    /// Create a new entry
    #[must_use]
    pub const fn new(logical_offset: u64, length: u64, blob: BlobId, blob_offset: u64) -> Self {
        Self {
            logical_offset,
            length,
            blob,
            blob_offset,
        }
    }

    /// One past the last logical byte mapped by this entry
    #[must_use]
    pub const fn logical_end(&self) -> u64 {
        self.logical_offset + self.length
    }

    /// One past the last blob byte referenced by this entry
    #[must_use]
    pub const fn blob_end(&self) -> u64 {
        self.blob_offset + self.length
    }
}

/// Ordered, non-overlapping logical-to-physical index for one object
#[derive(Clone, Debug, Default)]
pub struct ExtentMap {
    entries: BTreeMap<u64, ExtentMapEntry>,
}

impl ExtentMap {
    /// Create an empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in logical order
    pub fn iter(&self) -> impl Iterator<Item = &ExtentMapEntry> {
        self.entries.values()
    }

    /// Insert an entry, rejecting any overlap with existing entries
    pub fn insert(&mut self, entry: ExtentMapEntry) -> Result<()> {
        if entry.length == 0 {
            return Err(Error::invariant("zero-length extent map entry"));
        }
        if let Some((_, prev)) = self.entries.range(..=entry.logical_offset).next_back()
            && prev.logical_end() > entry.logical_offset
        {
            return Err(Error::invariant(format!(
                "entry [{}, +{}) overlaps predecessor [{}, +{})",
                entry.logical_offset, entry.length, prev.logical_offset, prev.length
            )));
        }
        if let Some((_, next)) = self.entries.range(entry.logical_offset..).next()
            && next.logical_offset < entry.logical_end()
        {
            return Err(Error::invariant(format!(
                "entry [{}, +{}) overlaps successor [{}, +{})",
                entry.logical_offset, entry.length, next.logical_offset, next.length
            )));
        }
        self.entries.insert(entry.logical_offset, entry);
        Ok(())
    }

    /// Remove the entry starting exactly at `logical_offset`
    pub fn remove_at(&mut self, logical_offset: u64) -> Option<ExtentMapEntry> {
        self.entries.remove(&logical_offset)
    }

    /// All entries overlapping `[begin, end)`, in logical order
    #[must_use]
    pub fn overlapping(&self, begin: u64, end: u64) -> Vec<ExtentMapEntry> {
        if begin >= end {
            return Vec::new();
        }
        let mut out = Vec::new();
        // The entry straddling `begin` starts before it.
        if let Some((_, e)) = self.entries.range(..begin).next_back()
            && e.logical_end() > begin
        {
            out.push(*e);
        }
        for (_, e) in self.entries.range(begin..end) {
            out.push(*e);
        }
        out
    }

    /// The entry whose logical range ends exactly at `offset`
    #[must_use]
    pub fn entry_ending_at(&self, offset: u64) -> Option<ExtentMapEntry> {
        self.entries
            .range(..offset)
            .next_back()
            .map(|(_, e)| *e)
            .filter(|e| e.logical_end() == offset)
    }

    /// The entry whose logical range starts exactly at `offset`
    #[must_use]
    pub fn entry_starting_at(&self, offset: u64) -> Option<ExtentMapEntry> {
        self.entries.get(&offset).copied()
    }

    /// Entries clipped to `[begin, end)`, with blob offsets adjusted
    ///
    /// Gaps between the returned entries are holes (unmapped logical
    /// space). Used by the read side to resolve a logical range.
    #[must_use]
    pub fn lookup_range(&self, begin: u64, end: u64) -> Vec<ExtentMapEntry> {
        self.overlapping(begin, end)
            .into_iter()
            .map(|e| {
                let clip_begin = e.logical_offset.max(begin);
                let clip_end = e.logical_end().min(end);
                ExtentMapEntry::new(
                    clip_begin,
                    clip_end - clip_begin,
                    e.blob,
                    e.blob_offset + (clip_begin - e.logical_offset),
                )
            })
            .collect()
    }

    /// Check ordering and non-overlap of the whole map
    pub fn verify(&self) -> Result<()> {
        let mut prev_end = 0u64;
        let mut first = true;
        for entry in self.entries.values() {
            if !first && entry.logical_offset < prev_end {
                return Err(Error::invariant(format!(
                    "overlapping extent map entries at {}",
                    entry.logical_offset
                )));
            }
            if entry.length == 0 {
                return Err(Error::invariant(format!(
                    "zero-length extent map entry at {}",
                    entry.logical_offset
                )));
            }
            prev_end = entry.logical_end();
            first = false;
        }
        Ok(())
    }
}
