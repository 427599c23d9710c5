//! Write-path integration tests
//!
//! Each test drives the writer against an in-memory device and checks
//! the externally visible contract: map layout, released/allocated
//! extent sets, shared-blob bookkeeping, accounting deltas, and the
//! bytes that actually landed on the device.

use bytes::Bytes;
use carbide_common::{Error, Result, SpaceConfig};
use carbide_storage::{
    BitmapAllocator, BlobArena, Extent, ExtentMap, ExtentMapEntry, MemDevice,
    PendingWriteResult, ReadDivertor, WriteDivertor, Writer,
};

const AU: u64 = 4096;

/// Object-logical reader backed by a shadow copy of committed content
struct ShadowReader {
    content: Vec<u8>,
}

impl ReadDivertor for ShadowReader {
    fn read(&mut self, object_offset: u64, length: u64) -> Result<Bytes> {
        let begin = object_offset as usize;
        Ok(Bytes::copy_from_slice(&self.content[begin..begin + length as usize]))
    }
}

/// Divertor double that fails every write
struct FailingDevice;

impl WriteDivertor for FailingDevice {
    fn write(&mut self, _disk_offset: u64, _data: &[u8], _deferred: bool) -> Result<()> {
        Err(std::io::Error::other("injected device fault").into())
    }
}

struct Harness {
    config: SpaceConfig,
    alloc: BitmapAllocator,
    arena: BlobArena,
    map: ExtentMap,
    device: MemDevice,
    shadow: ShadowReader,
}

impl Harness {
    fn new(units: u64, config: SpaceConfig) -> Self {
        config.validate().unwrap();
        let capacity = units * config.alloc_unit;
        let alloc = BitmapAllocator::new(capacity, config.alloc_unit).unwrap();
        alloc.init_add_free(0, capacity);
        Self {
            config,
            alloc,
            arena: BlobArena::new(),
            map: ExtentMap::new(),
            device: MemDevice::new(capacity),
            shadow: ShadowReader {
                content: vec![0u8; 1 << 20],
            },
        }
    }

    fn with_defaults(units: u64) -> Self {
        Self::new(units, SpaceConfig::default())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<PendingWriteResult> {
        self.write_inner(offset, data, None)
    }

    fn write_compressed(
        &mut self,
        offset: u64,
        data: &[u8],
        encoded: &[u8],
    ) -> Result<PendingWriteResult> {
        self.write_inner(offset, data, Some(Bytes::copy_from_slice(encoded)))
    }

    fn write_inner(
        &mut self,
        offset: u64,
        data: &[u8],
        compressed: Option<Bytes>,
    ) -> Result<PendingWriteResult> {
        let mut writer = Writer::new(
            &self.config,
            &self.alloc,
            &mut self.arena,
            &mut self.map,
            &mut self.device,
            &mut self.shadow,
        );
        let result = writer.do_write(offset, Bytes::copy_from_slice(data), compressed)?;
        self.shadow.content[offset as usize..offset as usize + data.len()]
            .copy_from_slice(data);
        Ok(result)
    }

    fn read_back(&self, offset: u64, length: u64) -> Vec<u8> {
        self.read_back_in(&self.map, offset, length)
    }

    /// Resolve a logical range through `map` and fetch device bytes;
    /// holes come back as zeros.
    fn read_back_in(&self, map: &ExtentMap, offset: u64, length: u64) -> Vec<u8> {
        let mut out = vec![0u8; length as usize];
        for seg in map.lookup_range(offset, offset + length) {
            let blob = self.arena.get(seg.blob);
            let mut pos = (seg.logical_offset - offset) as usize;
            for d in blob.disk_segments(seg.blob_offset, seg.length) {
                out[pos..pos + d.length as usize]
                    .copy_from_slice(self.device.read_at(d.offset, d.length));
                pos += d.length as usize;
            }
        }
        out
    }

    fn entries(&self) -> Vec<ExtentMapEntry> {
        self.map.iter().copied().collect()
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

fn total(extents: &[Extent]) -> u64 {
    extents.iter().map(|e| e.length).sum()
}

#[test]
fn write_single_new_blob_roundtrip() {
    let mut h = Harness::with_defaults(1024);
    let data = pattern(10000, 1);

    let result = h.write(0, &data).unwrap();

    assert!(result.released.is_empty());
    assert_eq!(total(&result.allocated), 12288); // 10000 rounded to 4 KiB units
    assert_eq!(result.statfs_delta.allocated_bytes, 12288);
    assert_eq!(result.statfs_delta.stored_bytes, 10000);
    assert!(result.shared_blobs_touched.is_empty());
    assert_eq!(h.alloc.get_free(), 1024 * AU - 12288);

    assert_eq!(h.entries().len(), 1);
    assert_eq!(h.read_back(0, 10000), data);
}

#[test]
fn write_checksums_cover_disk_content() {
    let mut h = Harness::with_defaults(1024);
    let data = pattern(10000, 3);
    h.write(0, &data).unwrap();

    let entry = h.entries()[0];
    let blob = h.arena.get(entry.blob);
    let padded_len = h.config.round_to_block(10000);
    let segments = blob.disk_segments(0, padded_len);
    let mut disk = Vec::new();
    for seg in segments {
        disk.extend_from_slice(h.device.read_at(seg.offset, seg.length));
    }
    assert!(blob.verify_csum(0, &disk));
}

#[test]
fn write_split_across_fragmented_allocation() {
    let mut h = Harness::with_defaults(16);

    // Fragment the device: claim everything, then free alternating units.
    let mut all = Vec::new();
    h.alloc
        .allocate(16 * AU, AU, 0, 0, &mut all)
        .unwrap();
    for unit in [1u64, 3, 5, 7, 9] {
        h.alloc.release(&[Extent::new(unit * AU, AU)]).unwrap();
    }

    let data = pattern((2 * AU) as usize, 2);
    let result = h.write(0, &data).unwrap();

    assert_eq!(total(&result.allocated), 2 * AU);
    assert!(result.allocated.len() >= 2); // no contiguous run exists
    assert_eq!(h.read_back(0, 2 * AU), data);

    // One logical write, one entry; the blob spans the fragments.
    assert_eq!(h.entries().len(), 1);
    let blob = h.arena.get(h.entries()[0].blob);
    assert!(blob.extents().len() >= 2);
}

#[test]
fn append_absorbs_into_unused_region() {
    // Allocation unit above block size leaves unused space inside blobs.
    let config = SpaceConfig::new(16384, 4096, 65536, 32768).unwrap();
    let mut h = Harness::new(64, config);

    let first = pattern(4096, 4);
    h.write(0, &first).unwrap();
    assert_eq!(h.alloc.get_free(), 64 * 16384 - 16384);

    // Exactly fills the rest of the blob's allocation unit: no new extent.
    let second = pattern(12288, 5);
    let result = h.write(4096, &second).unwrap();

    assert!(result.allocated.is_empty());
    assert!(result.released.is_empty());
    assert_eq!(result.statfs_delta.allocated_bytes, 0);
    assert_eq!(result.statfs_delta.stored_bytes, 12288);
    assert_eq!(h.alloc.get_free(), 64 * 16384 - 16384);

    assert_eq!(h.entries().len(), 2);
    let entries = h.entries();
    assert_eq!(entries[0].blob, entries[1].blob);
    assert_eq!(h.read_back(0, 4096), first);
    assert_eq!(h.read_back(4096, 12288), second);
}

#[test]
fn append_with_sub_block_boundary_rewrites_partial_block() {
    let config = SpaceConfig::new(16384, 4096, 65536, 32768).unwrap();
    let mut h = Harness::new(64, config);

    let first = pattern(6000, 6);
    h.write(0, &first).unwrap();

    // Starts mid-block: the head of the write's first block is re-read
    // through the read divertor and rewritten together with new data.
    let second = pattern(10384, 7);
    let result = h.write(6000, &second).unwrap();

    assert!(result.allocated.is_empty());
    assert_eq!(h.read_back(0, 6000), first);
    assert_eq!(h.read_back(6000, 10384), second);
}

#[test]
fn punch_hole_exactness() {
    let mut h = Harness::with_defaults(1024);
    let base = pattern(100, 8);
    h.write(100, &base).unwrap();

    let patch = pattern(10, 9);
    let result = h.write(150, &patch).unwrap();

    // Exactly three entries, no gaps, no overlaps.
    let entries = h.entries();
    assert_eq!(entries.len(), 3);
    assert_eq!(
        entries.iter().map(|e| (e.logical_offset, e.length)).collect::<Vec<_>>(),
        vec![(100, 50), (150, 10), (160, 40)]
    );
    h.map.verify().unwrap();

    // Both remainders still reference the original blob.
    assert_eq!(entries[0].blob, entries[2].blob);
    assert_ne!(entries[0].blob, entries[1].blob);
    assert_eq!(entries[2].blob_offset, 60);

    // The original blob is still partially referenced: nothing released.
    assert!(result.released.is_empty());

    let mut expected = base.clone();
    expected[50..60].copy_from_slice(&patch);
    assert_eq!(h.read_back(100, 100), expected);
}

#[test]
fn copy_on_write_isolation() {
    let mut h = Harness::with_defaults(1024);
    let original = pattern(8192, 10);
    h.write(0, &original).unwrap();

    // Clone the object: a sibling map references the same blob.
    let b0 = h.entries()[0].blob;
    let mut sibling = ExtentMap::new();
    sibling
        .insert(ExtentMapEntry::new(0, 8192, b0, 0))
        .unwrap();
    h.arena.inc_ref(b0);
    h.arena.get_mut(b0).mark_shared();

    // Overwrite the front half through the primary object.
    let patch = pattern(4096, 11);
    let result = h.write(0, &patch).unwrap();

    // The shared blob was never mutated in place: a new blob holds the
    // patch and the sibling still reads the original bytes.
    assert!(result.shared_blobs_touched.contains(&b0));
    assert!(result.released.is_empty());
    assert_eq!(h.read_back_in(&sibling, 0, 8192), original);

    let mut expected = original.clone();
    expected[..4096].copy_from_slice(&patch);
    assert_eq!(h.read_back(0, 8192), expected);
}

#[test]
fn shared_blob_fully_superseded_is_not_released() {
    let mut h = Harness::with_defaults(1024);
    h.write(0, &pattern(4096, 12)).unwrap();

    let b0 = h.entries()[0].blob;
    h.arena.get_mut(b0).mark_shared();

    let result = h.write(0, &pattern(4096, 13)).unwrap();

    // Last in-memory reference went away, but the physical space is the
    // transaction layer's to settle.
    assert!(result.shared_blobs_touched.contains(&b0));
    assert!(result.released.is_empty());
    assert!(!h.arena.contains(b0));
}

#[test]
fn full_overwrite_releases_superseded_extents() {
    let mut h = Harness::with_defaults(1024);
    h.write(0, &pattern(4096, 14)).unwrap();
    let old_extents: Vec<Extent> = h.arena.get(h.entries()[0].blob).extents().to_vec();

    let replacement = pattern(4096, 15);
    let result = h.write(0, &replacement).unwrap();

    assert_eq!(result.released, old_extents);
    assert_eq!(total(&result.allocated), 4096);
    assert_eq!(result.statfs_delta.allocated_bytes, 0);
    assert_eq!(result.statfs_delta.stored_bytes, 0);
    assert_eq!(h.read_back(0, 4096), replacement);
    assert_eq!(h.entries().len(), 1);
}

#[test]
fn abort_on_out_of_space_is_atomic() {
    let mut h = Harness::with_defaults(8);
    h.write(0, &pattern((4 * AU) as usize, 16)).unwrap();

    let entries_before = h.entries();
    let free_before = h.alloc.get_free();
    let log_before = h.device.log.len();

    // Wants six units; only four are free. The short allocation must be
    // rolled back and nothing else may change.
    let err = h.write(16 * AU, &pattern((6 * AU) as usize, 17)).unwrap_err();
    assert!(matches!(err, Error::OutOfSpace { .. }));

    assert_eq!(h.entries(), entries_before);
    assert_eq!(h.alloc.get_free(), free_before);
    assert_eq!(h.device.log.len(), log_before);
}

#[test]
fn abort_on_io_failure_is_atomic() {
    let mut h = Harness::with_defaults(64);
    h.write(0, &pattern(4096, 18)).unwrap();

    let entries_before = h.entries();
    let free_before = h.alloc.get_free();

    let mut failing = FailingDevice;
    let mut writer = Writer::new(
        &h.config,
        &h.alloc,
        &mut h.arena,
        &mut h.map,
        &mut failing,
        &mut h.shadow,
    );
    let err = writer
        .do_write(8192, Bytes::copy_from_slice(&pattern(8192, 19)), None)
        .unwrap_err();
    assert!(matches!(err, Error::DiskIo(_)));

    assert_eq!(h.entries(), entries_before);
    assert_eq!(h.alloc.get_free(), free_before);
}

#[test]
fn deferred_policy_follows_size_and_alignment() {
    let mut h = Harness::with_defaults(1024);

    // Small write: below the deferred threshold.
    h.write(0, &pattern(4096, 20)).unwrap();
    assert_eq!(h.device.log.len(), 1);
    assert!(h.device.log[0].deferred);

    // Large aligned write: one full blob, direct.
    h.write(65536, &pattern(65536, 21)).unwrap();
    let direct: Vec<_> = h.device.log[1..].iter().collect();
    assert!(!direct.is_empty());
    assert!(direct.iter().all(|r| !r.deferred));
    assert_eq!(direct.iter().map(|r| r.length).sum::<u64>(), 65536);
}

#[test]
fn compressed_write_records_both_lengths() {
    let mut h = Harness::with_defaults(1024);
    let data = pattern(10000, 22);
    let encoded = pattern(3000, 23);

    let result = h.write_compressed(0, &data, &encoded).unwrap();

    // One allocation unit instead of three.
    assert_eq!(total(&result.allocated), 4096);
    assert_eq!(result.statfs_delta.allocated_bytes, 4096);
    assert_eq!(result.statfs_delta.stored_bytes, 10000);

    let entry = h.entries()[0];
    assert_eq!(entry.length, 10000);
    let blob = h.arena.get(entry.blob);
    assert!(blob.is_compressed());
    assert_eq!(blob.real_length(), 10000);
    assert_eq!(blob.compressed_length(), 3000);

    // The encoded payload is what hit the disk.
    let seg = blob.disk_segments(0, 3000)[0];
    assert_eq!(h.device.read_at(seg.offset, seg.length), &encoded[..]);
}

#[test]
fn incompressible_payload_falls_back_to_raw() {
    let mut h = Harness::with_defaults(1024);
    let data = pattern(5000, 24);
    // "Encoded" form saves no allocation units; it must be ignored.
    let encoded = pattern(4500, 25);

    h.write_compressed(0, &data, &encoded).unwrap();

    let blob = h.arena.get(h.entries()[0].blob);
    assert!(!blob.is_compressed());
    assert_eq!(h.read_back(0, 5000), data);
}

#[test]
fn zero_length_write_is_idempotent() {
    let mut h = Harness::with_defaults(64);
    let data = pattern(8192, 26);
    h.write(0, &data).unwrap();

    let entries_before = h.entries();
    let free_before = h.alloc.get_free();

    let result = h.write(4000, &[]).unwrap();

    assert!(result.released.is_empty());
    assert!(result.allocated.is_empty());
    assert!(result.shared_blobs_touched.is_empty());
    assert_eq!(result.statfs_delta, Default::default());
    assert_eq!(h.entries(), entries_before);
    assert_eq!(h.alloc.get_free(), free_before);
    assert_eq!(h.read_back(0, 8192), data);
}

#[test]
fn overwrite_inside_identical_data_runs_uniformly() {
    let mut h = Harness::with_defaults(1024);
    let data = pattern(8192, 27);
    h.write(0, &data).unwrap();

    // Rewriting a sub-range with identical bytes takes the same path as
    // any other overwrite; no dedup short-circuit.
    let result = h.write(2000, &data[2000..4000]).unwrap();
    assert_eq!(h.read_back(0, 8192), data);
    assert_eq!(total(&result.allocated), 4096);
    h.map.verify().unwrap();
}

#[test]
fn expansion_grows_left_blob_in_place() {
    // Block-sized allocation units: a full blob has no unused space, so
    // growing it means appending freshly allocated extents.
    let mut h = Harness::with_defaults(1024);
    let first = pattern(4096, 28);
    h.write(0, &first).unwrap();
    let b0 = h.entries()[0].blob;
    assert_eq!(h.arena.get(b0).capacity(), 4096);

    let second = pattern(4096, 29);
    let result = h.write(4096, &second).unwrap();

    // New space was allocated, but into the same blob.
    assert_eq!(total(&result.allocated), 4096);
    let entries = h.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].blob, b0);
    assert_eq!(entries[1].blob, b0);
    assert_eq!(h.arena.get(b0).capacity(), 8192);
    assert_eq!(h.read_back(0, 8192), [first, second].concat());
}

#[test]
fn statfs_deltas_sum_to_zero_over_write_and_supersede() {
    let mut h = Harness::with_defaults(1024);

    let r1 = h.write(0, &pattern(16384, 30)).unwrap();
    let r2 = h.write(0, &pattern(16384, 31)).unwrap();

    // Releasing the superseded extents at commit time restores balance.
    let net_allocated = r1.statfs_delta.allocated_bytes + r2.statfs_delta.allocated_bytes;
    let released_total = total(&r2.released) as i64;
    assert_eq!(net_allocated, 16384);
    assert_eq!(released_total, 16384);
    assert_eq!(
        r1.statfs_delta.stored_bytes + r2.statfs_delta.stored_bytes,
        16384
    );
}
