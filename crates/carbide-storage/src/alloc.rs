//! Bitmap free-space allocator
//!
//! Tracks free/used state of one device (or device region) as a bitmap
//! over fixed-size allocation units, with a coarse second level that
//! classifies aligned regions as full, partial or free so searches can
//! skip over them instead of scanning unit by unit.
//!
//! The allocator knows nothing about objects or blobs; it hands out and
//! takes back extents. Its bitmap is guarded by a single internal lock
//! held only for the duration of one call, never across a whole write
//! operation.

use crate::bitmap::SimpleBitmap;
use crate::extent::Extent;
use carbide_common::{Error, Result, align_down, align_up, is_aligned};
use parking_lot::Mutex;
use tracing::{debug, trace};

/// Allocation units covered by one level-1 entry (8 level-0 words)
const L1_REGION_UNITS: u64 = 512;

/// Coarse occupancy of one level-1 region
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RegionState {
    /// No free unit in the region
    Full,
    /// Mixed free and used units
    Partial,
    /// Every unit in the region is free
    Free,
}

struct AllocatorInner {
    /// One bit per allocation unit, set = free
    l0: SimpleBitmap,
    /// Coarse state per region of `L1_REGION_UNITS` units
    l1: Vec<RegionState>,
    /// Free allocation units
    free_units: u64,
}

impl AllocatorInner {
    fn recompute_regions(&mut self, begin_unit: u64, end_unit: u64) {
        let total = self.l0.len();
        let first = begin_unit / L1_REGION_UNITS;
        let last = (end_unit - 1) / L1_REGION_UNITS;
        for region in first..=last {
            let start = region * L1_REGION_UNITS;
            let span = L1_REGION_UNITS.min(total - start);
            let free = self.l0.count_set_in_range(start, span);
            self.l1[region as usize] = if free == 0 {
                RegionState::Full
            } else if free == span {
                RegionState::Free
            } else {
                RegionState::Partial
            };
        }
    }
}

/// Free-space allocator for one device, bitmap-backed
///
/// A new allocator considers the whole device used; the mount path
/// seeds it from the persisted free-space description with
/// `init_add_free` / `init_rm_free`.
pub struct BitmapAllocator {
    capacity: u64,
    alloc_unit: u64,
    total_units: u64,
    inner: Mutex<AllocatorInner>,
}

impl BitmapAllocator {
    /// Create an allocator for `capacity` bytes at `alloc_unit` granularity
    pub fn new(capacity: u64, alloc_unit: u64) -> Result<Self> {
        if !alloc_unit.is_power_of_two() {
            return Err(Error::config(format!(
                "alloc_unit {alloc_unit} is not a power of two"
            )));
        }
        if capacity < alloc_unit || !is_aligned(capacity, alloc_unit) {
            return Err(Error::config(format!(
                "capacity {capacity} is not a positive multiple of alloc_unit {alloc_unit}"
            )));
        }
        let total_units = capacity / alloc_unit;
        let regions = total_units.div_ceil(L1_REGION_UNITS) as usize;
        debug!(capacity, alloc_unit, total_units, "new bitmap allocator");
        Ok(Self {
            capacity,
            alloc_unit,
            total_units,
            inner: Mutex::new(AllocatorInner {
                l0: SimpleBitmap::new(total_units),
                l1: vec![RegionState::Full; regions],
                free_units: 0,
            }),
        })
    }

    /// Device capacity in bytes
    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Allocation granularity in bytes
    #[must_use]
    pub const fn alloc_unit(&self) -> u64 {
        self.alloc_unit
    }

    /// Free space in bytes
    #[must_use]
    pub fn get_free(&self) -> u64 {
        self.inner.lock().free_units * self.alloc_unit
    }

    /// Allocate up to `want_size` bytes as unit-aligned extents
    ///
    /// Each returned extent is a multiple of `alloc_unit` (the request
    /// granularity, itself a multiple of the device granularity) and no
    /// larger than `max_alloc_size` (zero means unbounded). The search
    /// starts near `hint` and wraps around once. If free space runs out
    /// the allocation comes back short; the return value is the number
    /// of bytes actually placed into `extents`, and an error is raised
    /// only when nothing at all could be allocated.
    pub fn allocate(
        &self,
        want_size: u64,
        alloc_unit: u64,
        max_alloc_size: u64,
        hint: u64,
        extents: &mut Vec<Extent>,
    ) -> Result<u64> {
        if want_size == 0 {
            return Ok(0);
        }
        let unit = alloc_unit.max(self.alloc_unit);
        if !unit.is_power_of_two() || !is_aligned(unit, self.alloc_unit) {
            return Err(Error::invariant(format!(
                "request unit {alloc_unit} incompatible with device unit {}",
                self.alloc_unit
            )));
        }
        let want = align_up(want_size, unit);
        let max_chunk = if max_alloc_size == 0 {
            want
        } else {
            align_down(max_alloc_size, unit)
        };
        if max_chunk == 0 {
            return Err(Error::invariant(format!(
                "max_alloc_size {max_alloc_size} below request unit {unit}"
            )));
        }

        let unit_au = unit / self.alloc_unit;
        let max_chunk_au = max_chunk / self.alloc_unit;
        let mut remaining = want / self.alloc_unit;

        let mut inner = self.inner.lock();
        let hint_au = if hint >= self.capacity {
            0
        } else {
            align_down(hint / self.alloc_unit, unit_au)
        };

        self.scan(
            &mut inner,
            hint_au,
            self.total_units,
            unit_au,
            max_chunk_au,
            &mut remaining,
            extents,
        );
        if remaining > 0 && hint_au > 0 {
            self.scan(
                &mut inner,
                0,
                hint_au,
                unit_au,
                max_chunk_au,
                &mut remaining,
                extents,
            );
        }

        let got = (want / self.alloc_unit - remaining) * self.alloc_unit;
        trace!(want_size, got, hint, "allocate");
        if got == 0 {
            return Err(Error::OutOfSpace {
                wanted: want_size,
                allocated: 0,
            });
        }
        Ok(got)
    }

    #[allow(clippy::too_many_arguments)]
    fn scan(
        &self,
        inner: &mut AllocatorInner,
        begin_au: u64,
        end_au: u64,
        unit_au: u64,
        max_chunk_au: u64,
        remaining: &mut u64,
        extents: &mut Vec<Extent>,
    ) {
        let mut cursor = begin_au;
        while *remaining > 0 && cursor < end_au {
            // Skip regions with no free unit without touching level 0.
            let region = cursor / L1_REGION_UNITS;
            if inner.l1[region as usize] == RegionState::Full {
                cursor = (region + 1) * L1_REGION_UNITS;
                continue;
            }
            let Some(run) = inner.l0.next_set_run(cursor) else {
                break;
            };
            if run.offset >= end_au {
                break;
            }
            let run_end = run.end().min(end_au);
            let mut start = align_up(run.offset, unit_au);
            while *remaining > 0 && start + unit_au <= run_end {
                let avail = align_down(run_end - start, unit_au);
                let take = avail.min(*remaining).min(max_chunk_au);
                inner.l0.clear_range(start, take);
                inner.free_units -= take;
                inner.recompute_regions(start, start + take);
                extents.push(Extent::new(
                    start * self.alloc_unit,
                    take * self.alloc_unit,
                ));
                *remaining -= take;
                start += take;
            }
            cursor = run_end;
        }
    }

    /// Return extents to the free pool
    ///
    /// Tolerates arbitrary ordering and non-adjacency; freed ranges merge
    /// with their neighbors in the bitmap automatically. Releasing space
    /// that is already free is a caller ordering bug and fails fast
    /// without mutating anything.
    pub fn release(&self, extents: &[Extent]) -> Result<()> {
        let mut inner = self.inner.lock();

        // Validate everything before touching the bitmap.
        let mut ranges = Vec::with_capacity(extents.len());
        for e in extents {
            if e.length == 0 {
                return Err(Error::invariant("release of zero-length extent"));
            }
            if !e.is_aligned(self.alloc_unit) || e.end() > self.capacity {
                return Err(Error::invariant(format!(
                    "release of unaligned or out-of-range extent [{}, +{})",
                    e.offset, e.length
                )));
            }
            let start = e.offset / self.alloc_unit;
            let units = e.length / self.alloc_unit;
            if inner.l0.count_set_in_range(start, units) != 0 {
                return Err(Error::invariant(format!(
                    "double release of extent [{}, +{})",
                    e.offset, e.length
                )));
            }
            ranges.push((start, units));
        }
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            if pair[0].0 + pair[0].1 > pair[1].0 {
                return Err(Error::invariant("overlapping extents in release set"));
            }
        }

        for (start, units) in ranges {
            inner.l0.set_range(start, units);
            inner.free_units += units;
            inner.recompute_regions(start, start + units);
        }
        trace!(count = extents.len(), "release");
        Ok(())
    }

    /// Seed free space from the persisted description at mount time
    ///
    /// The range is shrunk to allocation-unit alignment; units already
    /// free are left alone, so overlapping seed sources are harmless.
    pub fn init_add_free(&self, offset: u64, length: u64) {
        let begin = align_up(offset, self.alloc_unit) / self.alloc_unit;
        let end = (align_down(offset + length, self.alloc_unit) / self.alloc_unit)
            .min(self.total_units);
        if begin >= end {
            return;
        }
        let mut inner = self.inner.lock();
        let mut pos = begin;
        while let Some(run) = inner.l0.next_clear_run(pos) {
            if run.offset >= end {
                break;
            }
            let run_end = run.end().min(end);
            inner.l0.set_range(run.offset, run_end - run.offset);
            inner.free_units += run_end - run.offset;
            pos = run_end;
        }
        inner.recompute_regions(begin, end);
        trace!(offset, length, "init_add_free");
    }

    /// Mark seeded space as used again at mount time
    ///
    /// Every unit in the range must currently be free; anything else is
    /// a programming error in the caller's bookkeeping.
    pub fn init_rm_free(&self, offset: u64, length: u64) -> Result<()> {
        let (begin, end) = self.aligned_units(offset, length)?;
        let mut inner = self.inner.lock();
        let units = end - begin;
        if inner.l0.count_set_in_range(begin, units) != units {
            return Err(Error::invariant(format!(
                "init_rm_free of non-free range [{offset}, +{length})"
            )));
        }
        inner.l0.clear_range(begin, units);
        inner.free_units -= units;
        inner.recompute_regions(begin, end);
        trace!(offset, length, "init_rm_free");
        Ok(())
    }

    /// Recovery-path variant of `init_rm_free`
    ///
    /// Allows marking the same space as used more than once without
    /// faulting. Used only while rebuilding the bitmap from possibly
    /// overlapping sources after a crash.
    pub fn init_rm_free_allow_duplication(&self, offset: u64, length: u64) -> Result<()> {
        let (begin, end) = self.aligned_units(offset, length)?;
        let mut inner = self.inner.lock();
        let mut removed = 0u64;
        let mut pos = begin;
        while let Some(run) = inner.l0.next_set_run(pos) {
            if run.offset >= end {
                break;
            }
            let run_end = run.end().min(end);
            inner.l0.clear_range(run.offset, run_end - run.offset);
            removed += run_end - run.offset;
            pos = run_end;
        }
        inner.free_units -= removed;
        inner.recompute_regions(begin, end);
        if removed != end - begin {
            trace!(
                offset,
                length,
                duplicated = (end - begin - removed),
                "init_rm_free_allow_duplication skipped already-used units"
            );
        }
        Ok(())
    }

    fn aligned_units(&self, offset: u64, length: u64) -> Result<(u64, u64)> {
        if length == 0
            || !is_aligned(offset, self.alloc_unit)
            || !is_aligned(length, self.alloc_unit)
            || offset + length > self.capacity
        {
            return Err(Error::invariant(format!(
                "unaligned or out-of-range init range [{offset}, +{length})"
            )));
        }
        Ok((
            offset / self.alloc_unit,
            (offset + length) / self.alloc_unit,
        ))
    }

    /// Free-space scatter in `[0, 1]`: 0 = one contiguous run
    ///
    /// Observability only; computed as one minus the normalized sum of
    /// squared free-run lengths, so n equal runs score `1 - 1/n`.
    #[must_use]
    pub fn get_fragmentation(&self) -> f64 {
        let inner = self.inner.lock();
        if inner.free_units == 0 {
            return 0.0;
        }
        let total = inner.free_units as f64;
        let mut sum_sq = 0.0f64;
        let mut pos = 0;
        while let Some(run) = inner.l0.next_set_run(pos) {
            sum_sq += (run.length as f64) * (run.length as f64);
            pos = run.end();
        }
        1.0 - sum_sq / (total * total)
    }

    /// Visit every free extent as `(disk_offset, length)` in bytes
    pub fn foreach_free_extent(&self, mut notify: impl FnMut(u64, u64)) {
        let inner = self.inner.lock();
        let mut pos = 0;
        while let Some(run) = inner.l0.next_set_run(pos) {
            notify(run.offset * self.alloc_unit, run.length * self.alloc_unit);
            pos = run.end();
        }
    }

    /// Log the free-space map
    pub fn dump(&self) {
        debug!(
            capacity = self.capacity,
            free = self.get_free(),
            fragmentation = self.get_fragmentation(),
            "allocator state"
        );
        self.foreach_free_extent(|offset, length| {
            debug!(offset, length, "free extent");
        });
    }
}
