//! The write path
//!
//! One `Writer` call realizes one logical write against one object's
//! extent map: it punches the target range out of the map, absorbs what
//! it can into mutable neighboring blobs, allocates space for the rest,
//! schedules the physical I/O and installs the new mappings. The caller
//! serializes writes per object; the allocator is the only shared piece
//! and carries its own lock.
//!
//! Phases run in a fixed order: punch hole, reuse left, reuse right,
//! allocate residual, schedule I/O, update the extent map. Everything
//! up to the map update may fail; the map update itself never does, so
//! an abort (out of space, divertor failure) leaves the extent map and
//! the allocator exactly as they were, after speculative allocations
//! are returned.

use crate::alloc::BitmapAllocator;
use crate::blob::{Blob, BlobArena, BlobId};
use crate::extent::{Extent, ExtentMap, ExtentMapEntry};
use crate::io::{ReadDivertor, WriteDivertor};
use bytes::{Bytes, BytesMut};
use carbide_common::{Error, Result, SpaceConfig, align_down, align_up, is_aligned};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, trace, warn};

/// Signed space-accounting deltas of one write
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatfsDelta {
    /// Physical bytes held from the allocator (new minus released)
    pub allocated_bytes: i64,
    /// Logical bytes addressable through the object's map
    pub stored_bytes: i64,
}

/// Externally visible output of one writer invocation
///
/// The transaction layer applies `released` to the allocator at commit
/// time (not before, so an aborted transaction diverges nothing) and
/// settles the persistent reference counts of `shared_blobs_touched`.
#[derive(Debug, Default)]
pub struct PendingWriteResult {
    /// Physical extents whose last reference disappeared
    pub released: Vec<Extent>,
    /// Physical extents obtained from the allocator
    pub allocated: Vec<Extent>,
    /// Shared blobs whose reference set changed
    pub shared_blobs_touched: BTreeSet<BlobId>,
    /// Space accounting deltas
    pub statfs_delta: StatfsDelta,
}

/// Orchestrates one logical write
pub struct Writer<'a> {
    config: &'a SpaceConfig,
    alloc: &'a BitmapAllocator,
    arena: &'a mut BlobArena,
    map: &'a mut ExtentMap,
    write_divertor: &'a mut dyn WriteDivertor,
    read_divertor: &'a mut dyn ReadDivertor,
}

#[derive(Default)]
struct PunchPlan {
    /// Entries removed from the map (whole originals)
    removed: Vec<ExtentMapEntry>,
    /// Trimmed remainders of partially overlapped entries
    reinsert: Vec<ExtentMapEntry>,
    /// Superseded blob-space ranges, per blob, merged and sorted
    punched: BTreeMap<BlobId, Vec<(u64, u64)>>,
}

#[derive(Clone, Copy)]
enum PadSource {
    /// Fill with zeros (region holds no valid data)
    Zero,
    /// Re-read valid object bytes at this logical offset
    Object(u64),
}

#[derive(Clone, Copy)]
struct Pad {
    length: u64,
    source: PadSource,
}

impl Pad {
    const fn none() -> Self {
        Self {
            length: 0,
            source: PadSource::Zero,
        }
    }
}

/// Planned absorption of part of the write into an existing blob
struct ReuseSlot {
    blob: BlobId,
    /// Where the data slice lands in blob space
    blob_offset: u64,
    /// Slice of the write payload, `[data_begin, data_end)`
    data_begin: u64,
    data_end: u64,
    head: Pad,
    tail: Pad,
}

/// Planned in-place growth of the left neighbor blob
struct ExpandPlan {
    blob: BlobId,
    extents: Vec<Extent>,
    /// Old capacity; growth starts here
    blob_offset: u64,
    data_begin: u64,
    data_end: u64,
}

/// Planned new blob over freshly allocated extents
struct NewBlobPlan {
    extents: Vec<Extent>,
    logical_begin: u64,
    logical_end: u64,
    /// Disk payload before block padding (raw slice or encoded bytes)
    payload: Bytes,
    /// Non-zero marks a compressed payload
    compressed_length: u64,
}

/// A physical write ready for the divertor
struct IoChunk {
    disk_offset: u64,
    data: Bytes,
    deferred: bool,
}

/// FIFO of allocated disk space, split across consumers in order
struct DiskQueue {
    extents: VecDeque<Extent>,
}

impl DiskQueue {
    fn new(extents: Vec<Extent>) -> Self {
        Self {
            extents: extents.into(),
        }
    }

    /// Take exactly `want` bytes off the front, splitting extents
    fn take(&mut self, mut want: u64) -> Vec<Extent> {
        let mut out = Vec::new();
        while want > 0 {
            let Some(e) = self.extents.pop_front() else {
                panic!("allocation queue underflow");
            };
            if e.length <= want {
                want -= e.length;
                out.push(e);
            } else {
                out.push(Extent::new(e.offset, want));
                self.extents
                    .push_front(Extent::new(e.offset + want, e.length - want));
                want = 0;
            }
        }
        out
    }
}

/// Deferred-vs-direct decision for one physical chunk
///
/// Purely a function of size, alignment and configuration: small or
/// unaligned chunks batch through the write-ahead log, large aligned
/// chunks go straight to the device.
fn deferred_for(config: &SpaceConfig, disk_offset: u64, length: u64) -> bool {
    length < config.prefer_deferred_size
        || !is_aligned(disk_offset, config.block_size)
        || !is_aligned(length, config.block_size)
}

/// Clip extents to the first `length` bytes they cover
fn clip_segments(extents: &[Extent], mut length: u64) -> Vec<Extent> {
    let mut out = Vec::new();
    for e in extents {
        if length == 0 {
            break;
        }
        let take = e.length.min(length);
        out.push(Extent::new(e.offset, take));
        length -= take;
    }
    out
}

/// Length of the reusable blob-space run starting at `from`
///
/// A byte is reusable when it lies beyond the valid-payload high-water
/// mark, inside a block still marked unused, or inside a range this
/// write just superseded. Valid data is never treated as reusable.
fn reusable_end(blob: &Blob, punched: &[(u64, u64)], from: u64, block: u64) -> u64 {
    let cap = blob.capacity();
    let high = blob.real_length();
    let mut pos = from;
    while pos < cap {
        if pos >= high {
            return cap;
        }
        let index = pos / block;
        if blob.is_block_unused(index) {
            pos = (index + 1) * block;
            continue;
        }
        if let Some(&(_, end)) = punched.iter().find(|&&(s, e)| s <= pos && pos < e) {
            pos = end;
            continue;
        }
        return pos;
    }
    cap
}

/// Mirror of `reusable_end`: start of the reusable run ending at `to`
fn reusable_start(blob: &Blob, punched: &[(u64, u64)], to: u64, block: u64) -> u64 {
    let high = blob.real_length();
    let mut pos = to;
    while pos > 0 {
        let p = pos - 1;
        if p >= high {
            pos = high;
            continue;
        }
        let index = p / block;
        if blob.is_block_unused(index) {
            pos = index * block;
            continue;
        }
        if let Some(&(start, _)) = punched.iter().find(|&&(s, e)| s <= p && p < e) {
            pos = start;
            continue;
        }
        return pos;
    }
    0
}

impl<'a> Writer<'a> {
    /// Create a writer over one object's map with injected collaborators
    pub fn new(
        config: &'a SpaceConfig,
        alloc: &'a BitmapAllocator,
        arena: &'a mut BlobArena,
        map: &'a mut ExtentMap,
        write_divertor: &'a mut dyn WriteDivertor,
        read_divertor: &'a mut dyn ReadDivertor,
    ) -> Self {
        Self {
            config,
            alloc,
            arena,
            map,
            write_divertor,
            read_divertor,
        }
    }

    /// Realize one logical write
    ///
    /// `compressed`, when present, is the externally encoded form of
    /// `data`; it is used only if it genuinely shrinks the physical
    /// footprint, and the resulting blob records both lengths.
    pub fn do_write(
        &mut self,
        logical_offset: u64,
        data: Bytes,
        compressed: Option<Bytes>,
    ) -> Result<PendingWriteResult> {
        let len = data.len() as u64;
        let end_offset = logical_offset + len;
        trace!(logical_offset, len, "do_write");

        // PUNCH_HOLE (planned now, applied at the map update)
        let punch = self.plan_punch(logical_offset, end_offset);

        let compressed = compressed.filter(|c| {
            let encoded = c.len() as u64;
            encoded > 0
                && encoded < len
                && self.config.round_to_alloc_unit(encoded)
                    < self.config.round_to_alloc_unit(len)
                && self.config.round_to_alloc_unit(encoded) <= self.config.max_blob_size
        });

        // TRY_REUSE_LEFT / TRY_REUSE_RIGHT. Compressed payloads never
        // land inside existing blobs; sharing is never extended into.
        let left_neighbor = self.left_neighbor(&punch, logical_offset);
        let (left, right) = if compressed.is_none() && len > 0 {
            let left = self.plan_reuse_left(&punch, left_neighbor, logical_offset, len);
            let absorbed = left.as_ref().map_or(0, |s| s.data_end - s.data_begin);
            let right = if absorbed < len {
                self.plan_reuse_right(&punch, end_offset, len, absorbed, left.as_ref())
            } else {
                None
            };
            (left, right)
        } else {
            (None, None)
        };
        let absorbed_head = left.as_ref().map_or(0, |s| s.data_end - s.data_begin);
        let absorbed_tail = right.as_ref().map_or(0, |s| s.data_end - s.data_begin);

        // ALLOCATE_RESIDUAL
        let residual_begin = absorbed_head;
        let residual_end = len - absorbed_tail;
        let hint = left_neighbor.map_or(0, |e| {
            self.arena
                .get(e.blob)
                .extents()
                .last()
                .map_or(0, Extent::end)
        });
        let (speculative, expand, new_blobs) = self.allocate_residual(
            &data,
            compressed.as_ref(),
            left_neighbor,
            left.as_ref(),
            logical_offset,
            residual_begin,
            residual_end,
            hint,
        )?;

        // SCHEDULE_IO: assemble padded chunks (reads may fail), then
        // emit them (writes may fail); roll back allocations on error.
        match self.schedule_io(&data, left.as_ref(), right.as_ref(), &expand, &new_blobs) {
            Ok(scheduled) => {
                // UPDATE_EXTENT_MAP (must not fail)
                self.commit(
                    logical_offset,
                    end_offset,
                    punch,
                    left,
                    right,
                    expand,
                    new_blobs,
                    scheduled,
                    speculative,
                )
            }
            Err(e) => {
                self.rollback(&speculative);
                Err(e)
            }
        }
    }

    /// Entries overlapping the write range, split into removals,
    /// trimmed remainders, and superseded blob-space ranges.
    fn plan_punch(&self, begin: u64, end: u64) -> PunchPlan {
        let mut plan = PunchPlan::default();
        for e in self.map.overlapping(begin, end) {
            let punch_begin = e.logical_offset.max(begin);
            let punch_end = e.logical_end().min(end);
            plan.removed.push(e);
            if e.logical_offset < begin {
                plan.reinsert.push(ExtentMapEntry::new(
                    e.logical_offset,
                    begin - e.logical_offset,
                    e.blob,
                    e.blob_offset,
                ));
            }
            if e.logical_end() > end {
                plan.reinsert.push(ExtentMapEntry::new(
                    end,
                    e.logical_end() - end,
                    e.blob,
                    e.blob_offset + (end - e.logical_offset),
                ));
            }
            plan.punched.entry(e.blob).or_default().push((
                e.blob_offset + (punch_begin - e.logical_offset),
                e.blob_offset + (punch_end - e.logical_offset),
            ));
        }
        for ranges in plan.punched.values_mut() {
            ranges.sort_unstable();
            let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
            for &(s, e) in ranges.iter() {
                match merged.last_mut() {
                    Some(last) if s <= last.1 => last.1 = last.1.max(e),
                    _ => merged.push((s, e)),
                }
            }
            *ranges = merged;
        }
        if !plan.removed.is_empty() {
            trace!(
                removed = plan.removed.len(),
                reinsert = plan.reinsert.len(),
                "punch hole"
            );
        }
        plan
    }

    /// The entry ending exactly at the write start, as it will look
    /// after the punch.
    fn left_neighbor(&self, punch: &PunchPlan, offset: u64) -> Option<ExtentMapEntry> {
        punch
            .reinsert
            .iter()
            .copied()
            .find(|p| p.logical_end() == offset)
            .or_else(|| self.map.entry_ending_at(offset))
    }

    fn punched_of<'p>(&self, punch: &'p PunchPlan, blob: BlobId) -> &'p [(u64, u64)] {
        punch.punched.get(&blob).map_or(&[], Vec::as_slice)
    }

    fn plan_reuse_left(
        &self,
        punch: &PunchPlan,
        neighbor: Option<ExtentMapEntry>,
        logical_offset: u64,
        len: u64,
    ) -> Option<ReuseSlot> {
        let candidate = neighbor?;
        let blob = self.arena.get(candidate.blob);
        if blob.is_shared() || blob.is_compressed() {
            return None;
        }
        let block = self.config.block_size;
        let bow = candidate.blob_end();
        let reuse_end = reusable_end(
            blob,
            self.punched_of(punch, candidate.blob),
            bow,
            block,
        );
        if reuse_end <= bow {
            return None;
        }
        let mut take = len.min(reuse_end - bow);

        // A mid-block start means the rest of that block already holds
        // the candidate's tail; it gets re-read and rewritten.
        let head_len = bow % block;
        if head_len > candidate.length {
            return None;
        }
        let head = if head_len == 0 {
            Pad::none()
        } else {
            Pad {
                length: head_len,
                source: PadSource::Object(logical_offset - head_len),
            }
        };

        let mut tail = Pad::none();
        let end = bow + take;
        if !is_aligned(end, block) {
            if take == len && reuse_end >= align_up(end, block) {
                tail = Pad {
                    length: align_up(end, block) - end,
                    source: PadSource::Zero,
                };
            } else {
                // Shrink to a block boundary; reuse stays best-effort.
                take = align_down(end, block).saturating_sub(bow);
                if take == 0 {
                    return None;
                }
            }
        }
        trace!(blob = %candidate.blob, blob_offset = bow, take, "reuse left");
        Some(ReuseSlot {
            blob: candidate.blob,
            blob_offset: bow,
            data_begin: 0,
            data_end: take,
            head,
            tail,
        })
    }

    fn plan_reuse_right(
        &self,
        punch: &PunchPlan,
        end_offset: u64,
        len: u64,
        absorbed_head: u64,
        left: Option<&ReuseSlot>,
    ) -> Option<ReuseSlot> {
        let candidate = punch
            .reinsert
            .iter()
            .copied()
            .find(|p| p.logical_offset == end_offset)
            .or_else(|| self.map.entry_starting_at(end_offset))?;
        let blob = self.arena.get(candidate.blob);
        if blob.is_shared() || blob.is_compressed() {
            return None;
        }
        // One absorption per blob per write keeps the claims disjoint.
        if left.is_some_and(|l| l.blob == candidate.blob) {
            return None;
        }
        let block = self.config.block_size;
        let row = candidate.blob_offset;
        let reuse_start = reusable_start(
            blob,
            self.punched_of(punch, candidate.blob),
            row,
            block,
        );
        if reuse_start >= row {
            return None;
        }
        let remaining = len - absorbed_head;
        let mut take = remaining.min(row - reuse_start);

        // A mid-block end means the rest of that block holds the
        // candidate's head; it gets re-read and rewritten.
        let tail_len = align_up(row, block) - row;
        if tail_len > 0 && tail_len > candidate.length {
            return None;
        }
        let tail = if tail_len == 0 {
            Pad::none()
        } else {
            Pad {
                length: tail_len,
                source: PadSource::Object(end_offset),
            }
        };

        let mut head = Pad::none();
        let start = row - take;
        if !is_aligned(start, block) {
            let down = align_down(start, block);
            if down >= reuse_start {
                head = Pad {
                    length: start - down,
                    source: PadSource::Zero,
                };
            } else {
                let up = align_up(start, block);
                if up >= row {
                    return None;
                }
                take = row - up;
            }
        }
        trace!(blob = %candidate.blob, blob_offset = row - take, take, "reuse right");
        Some(ReuseSlot {
            blob: candidate.blob,
            blob_offset: row - take,
            data_begin: len - take,
            data_end: len,
            head,
            tail,
        })
    }

    /// Obtain disk space for everything the neighbors did not absorb
    ///
    /// One allocator call covers in-place growth of the left blob and
    /// all new blobs; a short allocation aborts the write after the
    /// extents are returned.
    #[allow(clippy::too_many_arguments)]
    fn allocate_residual(
        &mut self,
        data: &Bytes,
        compressed: Option<&Bytes>,
        left_neighbor: Option<ExtentMapEntry>,
        left: Option<&ReuseSlot>,
        logical_offset: u64,
        residual_begin: u64,
        residual_end: u64,
        hint: u64,
    ) -> Result<(Vec<Extent>, Option<ExpandPlan>, Vec<NewBlobPlan>)> {
        let max_blob = self.config.max_blob_size;

        if let Some(encoded) = compressed {
            let disk = self.config.round_to_alloc_unit(encoded.len() as u64);
            let mut extents = Vec::new();
            let got = self.alloc.allocate(
                disk,
                self.config.alloc_unit,
                max_blob,
                hint,
                &mut extents,
            )?;
            if got < disk {
                self.rollback(&extents);
                return Err(Error::OutOfSpace {
                    wanted: disk,
                    allocated: got,
                });
            }
            let plan = NewBlobPlan {
                extents: extents.clone(),
                logical_begin: logical_offset,
                logical_end: logical_offset + data.len() as u64,
                payload: encoded.clone(),
                compressed_length: encoded.len() as u64,
            };
            return Ok((extents, None, vec![plan]));
        }

        let residual = residual_end - residual_begin;
        if residual == 0 {
            return Ok((Vec::new(), None, Vec::new()));
        }

        // In-place growth of the left blob: only when the write sits
        // exactly at its capacity after absorption.
        let mut expand_target: Option<(BlobId, u64)> = None;
        if let Some(e) = left_neighbor {
            let blob = self.arena.get(e.blob);
            let pos = left.map_or(e.blob_end(), |s| s.blob_offset + (s.data_end - s.data_begin));
            if blob.can_expand(max_blob) && pos == blob.capacity() {
                expand_target = Some((e.blob, blob.capacity()));
            }
        }

        let mut exp_payload = 0u64;
        let mut grow_disk = 0u64;
        if let Some((_, capacity)) = expand_target {
            exp_payload = residual.min(max_blob - capacity);
            grow_disk = self
                .config
                .round_to_alloc_unit(exp_payload)
                .min(max_blob - capacity);
        }

        let mut chunks = Vec::new();
        let mut rest = residual - exp_payload;
        let mut disk_total = grow_disk;
        while rest > 0 {
            let payload = rest.min(max_blob);
            let disk = self.config.round_to_alloc_unit(payload);
            chunks.push((payload, disk));
            disk_total += disk;
            rest -= payload;
        }

        let mut extents = Vec::new();
        let got = self.alloc.allocate(
            disk_total,
            self.config.alloc_unit,
            max_blob,
            hint,
            &mut extents,
        )?;
        if got < disk_total {
            self.rollback(&extents);
            return Err(Error::OutOfSpace {
                wanted: disk_total,
                allocated: got,
            });
        }
        debug!(disk_total, extents = extents.len(), "allocated residual");

        let mut queue = DiskQueue::new(extents.clone());
        let expand = expand_target.map(|(blob, capacity)| ExpandPlan {
            blob,
            extents: queue.take(grow_disk),
            blob_offset: capacity,
            data_begin: residual_begin,
            data_end: residual_begin + exp_payload,
        });

        let mut new_blobs = Vec::new();
        let mut cursor = residual_begin + exp_payload;
        for (payload, disk) in chunks {
            new_blobs.push(NewBlobPlan {
                extents: queue.take(disk),
                logical_begin: logical_offset + cursor,
                logical_end: logical_offset + cursor + payload,
                payload: data.slice(cursor as usize..(cursor + payload) as usize),
                compressed_length: 0,
            });
            cursor += payload;
        }

        Ok((extents, expand, new_blobs))
    }

    /// Build padded chunks (reads first) and hand them to the divertor
    ///
    /// Returns the padded payloads for the map update; the blob-space
    /// position of each is what `commit` records checksums against.
    fn schedule_io(
        &mut self,
        data: &Bytes,
        left: Option<&ReuseSlot>,
        right: Option<&ReuseSlot>,
        expand: &Option<ExpandPlan>,
        new_blobs: &[NewBlobPlan],
    ) -> Result<ScheduledIo> {
        let block = self.config.block_size;
        let mut chunks = Vec::new();
        let mut scheduled = ScheduledIo::default();

        for slot in [left, right].into_iter().flatten() {
            let body = &data[slot.data_begin as usize..slot.data_end as usize];
            let padded = self.build_padded(&slot.head, body, &slot.tail)?;
            let chunk_off = slot.blob_offset - slot.head.length;
            let segments = self
                .arena
                .get(slot.blob)
                .disk_segments(chunk_off, padded.len() as u64);
            emit_chunks(self.config, &segments, &padded, &mut chunks);
            scheduled.reuse.push((chunk_off, padded));
        }

        if let Some(plan) = expand {
            let body = &data[plan.data_begin as usize..plan.data_end as usize];
            let padded = pad_to_block(body, block);
            let segments = clip_segments(&plan.extents, padded.len() as u64);
            emit_chunks(self.config, &segments, &padded, &mut chunks);
            scheduled.expand = Some(padded);
        }

        for plan in new_blobs {
            let padded = pad_to_block(&plan.payload, block);
            let segments = clip_segments(&plan.extents, padded.len() as u64);
            emit_chunks(self.config, &segments, &padded, &mut chunks);
            scheduled.new_blobs.push(padded);
        }

        for chunk in &chunks {
            self.write_divertor
                .write(chunk.disk_offset, &chunk.data, chunk.deferred)?;
        }
        trace!(chunks = chunks.len(), "scheduled io");
        Ok(scheduled)
    }

    fn build_padded(&mut self, head: &Pad, body: &[u8], tail: &Pad) -> Result<Bytes> {
        let total = head.length as usize + body.len() + tail.length as usize;
        let mut buf = BytesMut::with_capacity(total);
        self.append_pad(&mut buf, head)?;
        buf.extend_from_slice(body);
        self.append_pad(&mut buf, tail)?;
        Ok(buf.freeze())
    }

    fn append_pad(&mut self, buf: &mut BytesMut, pad: &Pad) -> Result<()> {
        if pad.length == 0 {
            return Ok(());
        }
        match pad.source {
            PadSource::Zero => buf.extend_from_slice(&vec![0u8; pad.length as usize]),
            PadSource::Object(offset) => {
                let bytes = self.read_divertor.read(offset, pad.length)?;
                if bytes.len() as u64 != pad.length {
                    return Err(Error::invariant(format!(
                        "read divertor returned {} bytes, wanted {}",
                        bytes.len(),
                        pad.length
                    )));
                }
                buf.extend_from_slice(&bytes);
            }
        }
        Ok(())
    }

    /// Apply the whole write to the map and arena; never fails short of
    /// an invariant violation, which is fatal anyway.
    #[allow(clippy::too_many_arguments)]
    fn commit(
        &mut self,
        logical_offset: u64,
        end_offset: u64,
        punch: PunchPlan,
        left: Option<ReuseSlot>,
        right: Option<ReuseSlot>,
        expand: Option<ExpandPlan>,
        new_blobs: Vec<NewBlobPlan>,
        scheduled: ScheduledIo,
        speculative: Vec<Extent>,
    ) -> Result<PendingWriteResult> {
        let mut result = PendingWriteResult::default();
        let mut stored_delta: i64 = 0;

        for e in &punch.removed {
            self.map.remove_at(e.logical_offset);
            stored_delta -= e.length as i64;
        }

        // Absorptions into existing blobs.
        for (slot, (chunk_off, padded)) in [left.as_ref(), right.as_ref()]
            .into_iter()
            .flatten()
            .zip(scheduled.reuse.iter())
        {
            let take = slot.data_end - slot.data_begin;
            let blob = self.arena.get_mut(slot.blob);
            blob.put_data(*chunk_off, padded);
            blob.grow_real_length(slot.blob_offset + take);
            let logical = if slot.data_begin == 0 {
                logical_offset
            } else {
                end_offset - take
            };
            self.map
                .insert(ExtentMapEntry::new(logical, take, slot.blob, slot.blob_offset))?;
            self.arena.inc_ref(slot.blob);
            stored_delta += take as i64;
        }

        // In-place growth of the left blob.
        if let Some(plan) = expand {
            let padded = scheduled.expand.as_ref().map_or(&[][..], |b| &b[..]);
            let take = plan.data_end - plan.data_begin;
            let blob = self.arena.get_mut(plan.blob);
            blob.expand(&plan.extents);
            blob.put_data(plan.blob_offset, padded);
            blob.grow_real_length(plan.blob_offset + take);
            self.map.insert(ExtentMapEntry::new(
                logical_offset + plan.data_begin,
                take,
                plan.blob,
                plan.blob_offset,
            ))?;
            self.arena.inc_ref(plan.blob);
            stored_delta += take as i64;
        }

        // New blobs.
        for (plan, padded) in new_blobs.into_iter().zip(scheduled.new_blobs.iter()) {
            let logical_len = plan.logical_end - plan.logical_begin;
            let blob = if plan.compressed_length > 0 {
                Blob::new_compressed(
                    plan.extents,
                    logical_len,
                    plan.compressed_length,
                    self.config.block_size,
                )
            } else {
                Blob::new(plan.extents, self.config.block_size)
            };
            let id = self.arena.insert(blob);
            let blob = self.arena.get_mut(id);
            blob.put_data(0, padded);
            if plan.compressed_length == 0 {
                blob.grow_real_length(logical_len);
            }
            self.map
                .insert(ExtentMapEntry::new(plan.logical_begin, logical_len, id, 0))?;
            self.arena.inc_ref(id);
            stored_delta += logical_len as i64;
        }

        // Trimmed remainders of partially overlapped entries.
        for piece in &punch.reinsert {
            self.map.insert(*piece)?;
            self.arena.inc_ref(piece.blob);
            stored_delta += piece.length as i64;
        }

        // Settle references of the removed entries; prune on zero.
        for e in &punch.removed {
            if self.arena.get(e.blob).is_shared() {
                result.shared_blobs_touched.insert(e.blob);
            }
            if self.arena.dec_ref(e.blob) == 0 {
                let blob = self.arena.remove(e.blob);
                if blob.is_shared() {
                    // Physical space of a shared blob is settled by the
                    // transaction layer via the touched set.
                    debug!(blob = %e.blob, "shared blob dereferenced");
                } else {
                    result.released.extend(blob.extents().iter().copied());
                }
            }
        }

        let allocated_total: i64 = speculative.iter().map(|e| e.length as i64).sum();
        let released_total: i64 = result.released.iter().map(|e| e.length as i64).sum();
        result.allocated = speculative;
        result.statfs_delta = StatfsDelta {
            allocated_bytes: allocated_total - released_total,
            stored_bytes: stored_delta,
        };

        debug_assert!(self.map.verify().is_ok());
        debug!(
            released = result.released.len(),
            allocated = result.allocated.len(),
            shared = result.shared_blobs_touched.len(),
            "write committed"
        );
        Ok(result)
    }

    /// Return speculative allocations after an abort
    fn rollback(&self, speculative: &[Extent]) {
        if speculative.is_empty() {
            return;
        }
        if let Err(e) = self.alloc.release(speculative) {
            // Nothing more can be done from the abort path.
            warn!(error = %e, "failed to roll back speculative allocation");
        }
    }
}

/// Padded payloads captured at scheduling time for the map update
#[derive(Default)]
struct ScheduledIo {
    /// `(chunk_blob_offset, padded_payload)` per reuse slot, in order
    reuse: Vec<(u64, Bytes)>,
    expand: Option<Bytes>,
    new_blobs: Vec<Bytes>,
}

fn pad_to_block(payload: &[u8], block: u64) -> Bytes {
    let padded_len = align_up(payload.len() as u64, block) as usize;
    let mut buf = BytesMut::with_capacity(padded_len);
    buf.extend_from_slice(payload);
    buf.resize(padded_len, 0);
    buf.freeze()
}

fn emit_chunks(config: &SpaceConfig, segments: &[Extent], padded: &Bytes, out: &mut Vec<IoChunk>) {
    let mut pos = 0usize;
    for seg in segments {
        let data = padded.slice(pos..pos + seg.length as usize);
        out.push(IoChunk {
            disk_offset: seg.offset,
            deferred: deferred_for(config, seg.offset, seg.length),
            data,
        });
        pos += seg.length as usize;
    }
}
