//! First-fit sub-allocation of byte ranges inside a fixed-capacity buffer.
//!
//! [`SubAllocator`] only does host-side bookkeeping: it never touches GPU
//! memory. Free space is kept as an ordered map of `offset -> size`, so the
//! first-fit scan walks ranges in offset order and releasing a range finds
//! both neighbours with a single map lookup each.
//!
//! Alignment padding in front of an allocation is returned to the free map
//! as its own range instead of being wasted. As a result the free ranges and
//! the live allocations always tile `[0, capacity)` exactly.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::error::{AllocError, InvariantViolation};

/// Result type for sub-allocator operations.
pub type Result<T> = std::result::Result<T, AllocError>;

static NEXT_ALLOCATOR_ID: AtomicU64 = AtomicU64::new(1);

/// Round `value` up to a multiple of `alignment`, which must be a power of two.
///
/// Returns `None` on overflow.
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> Option<u64> {
    match value.checked_add(alignment - 1) {
        Some(v) => Some(v & !(alignment - 1)),
        None => None,
    }
}

/// A contiguous unallocated byte span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FreeRange {
    pub offset: u64,
    pub size: u64,
}

impl FreeRange {
    /// One past the last byte of the range.
    pub const fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Stable handle to a live allocation.
///
/// Carries the id of the allocator that issued it and a generation counter,
/// so handles from another allocator or handles that were already released
/// are rejected instead of corrupting the free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SuballocationId {
    allocator: u64,
    slot: u32,
    generation: u32,
}

/// A reserved byte range `[offset, offset + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Suballocation {
    pub id: SuballocationId,
    pub offset: u64,
    pub size: u64,
}

impl Suballocation {
    /// One past the last byte of the allocation.
    pub const fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Point-in-time allocator statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubAllocatorStats {
    pub capacity: u64,
    pub alignment: u64,
    pub free_size: u64,
    pub allocated_size: u64,
    pub allocation_count: usize,
    pub free_range_count: usize,
    pub largest_free_range: u64,
    pub fragmentation_percent: f64,
}

#[derive(Debug, Clone, Copy)]
struct Record {
    offset: u64,
    size: u64,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    record: Option<Record>,
}

/// First-fit allocator over a fixed byte capacity.
///
/// Not internally synchronized: callers serialize `allocate` and `release`
/// (see [`DynamicResizableBuffer`](crate::dynamic_buffer::DynamicResizableBuffer)
/// for the locked wrapper).
#[derive(Debug)]
pub struct SubAllocator {
    id: u64,
    capacity: u64,
    alignment: u64,
    /// Free ranges keyed by start offset.
    free_ranges: BTreeMap<u64, u64>,
    free_size: u64,
    slots: Vec<Slot>,
    vacant_slots: Vec<u32>,
    /// Exclusive upper bound on slot indices.
    slot_limit: u32,
    live: usize,
}

impl SubAllocator {
    /// Create an allocator managing `capacity` bytes.
    ///
    /// `alignment` is the default used when a request passes an alignment of
    /// zero, and must be a non-zero power of two.
    pub fn new(capacity: u64, alignment: u64) -> Result<Self> {
        if !alignment.is_power_of_two() {
            return Err(AllocError::InvalidArgument(format!(
                "default alignment {alignment} is not a power of two"
            )));
        }

        let mut free_ranges = BTreeMap::new();
        if capacity > 0 {
            free_ranges.insert(0, capacity);
        }

        Ok(Self {
            id: NEXT_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed),
            capacity,
            alignment,
            free_ranges,
            free_size: capacity,
            slots: Vec::new(),
            vacant_slots: Vec::new(),
            slot_limit: u32::MAX,
            live: 0,
        })
    }

    #[cfg(test)]
    fn with_slot_limit(mut self, limit: u32) -> Self {
        self.slot_limit = limit;
        self
    }

    /// Total bytes managed. Never changes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Default alignment applied to requests with an alignment of zero.
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Number of live allocations.
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether there are no live allocations.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Sum of all free range sizes.
    pub fn free_size(&self) -> u64 {
        self.free_size
    }

    /// Sum of all live allocation sizes.
    pub fn allocated_size(&self) -> u64 {
        self.capacity - self.free_size
    }

    /// Whether `id` was issued by this allocator (live or not).
    pub fn owns(&self, id: SuballocationId) -> bool {
        id.allocator == self.id
    }

    /// Reserve `size` bytes aligned to `alignment` (zero selects the default).
    ///
    /// Picks the first free range, in offset order, that still fits the
    /// request after its start is padded up to the alignment.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip(self)))]
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Result<Suballocation> {
        if size == 0 {
            return Err(AllocError::InvalidArgument(
                "cannot allocate zero bytes".to_string(),
            ));
        }
        let alignment = if alignment == 0 {
            self.alignment
        } else {
            alignment
        };
        if !alignment.is_power_of_two() {
            return Err(AllocError::InvalidArgument(format!(
                "alignment {alignment} is not a power of two"
            )));
        }

        let slot = self.reserve_slot()?;

        let Some((range, padding)) = self.find_free_range(size, alignment) else {
            let largest_free = self.largest_free_range().map_or(0, |r| r.size);
            warn!(
                size,
                alignment,
                free_size = self.free_size,
                largest_free,
                "No free range large enough for sub-allocation"
            );
            return Err(AllocError::OutOfSpace {
                size,
                alignment,
                free_size: self.free_size,
                largest_free,
            });
        };

        self.free_ranges.remove(&range.offset);
        if padding > 0 {
            self.free_ranges.insert(range.offset, padding);
        }
        let offset = range.offset + padding;
        let remainder = range.size - padding - size;
        if remainder > 0 {
            self.free_ranges.insert(offset + size, remainder);
        }
        self.free_size -= size;

        let id = self.insert_record(slot, Record { offset, size });
        debug!(offset, size, alignment, padding, "Sub-allocated range");
        self.debug_validate();

        Ok(Suballocation { id, offset, size })
    }

    /// Return an allocation's range to the free list.
    ///
    /// The range is merged with a free neighbour on either side. Returns the
    /// free range that now contains the released bytes.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip(self)))]
    pub fn release(&mut self, id: SuballocationId) -> Result<FreeRange> {
        let record = self.take_record(id).inspect_err(|e| {
            error!(?id, "Rejected sub-allocation release: {e}");
        })?;

        let merged = self.insert_free_range(record.offset, record.size);
        self.free_size += record.size;
        debug!(
            offset = record.offset,
            size = record.size,
            merged_offset = merged.offset,
            merged_size = merged.size,
            "Released range"
        );
        self.debug_validate();

        Ok(merged)
    }

    /// Look up a live allocation.
    pub fn get(&self, id: SuballocationId) -> Option<Suballocation> {
        if !self.owns(id) {
            return None;
        }
        let slot = self.slots.get(id.slot as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.record.map(|r| Suballocation {
            id,
            offset: r.offset,
            size: r.size,
        })
    }

    /// Live allocations ordered by offset.
    #[allow(clippy::cast_possible_truncation)] // slot count never exceeds `slot_limit`
    pub fn allocations(&self) -> Vec<Suballocation> {
        let mut allocations: Vec<_> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.record.map(|r| Suballocation {
                    id: SuballocationId {
                        allocator: self.id,
                        slot: index as u32,
                        generation: slot.generation,
                    },
                    offset: r.offset,
                    size: r.size,
                })
            })
            .collect();
        allocations.sort_unstable_by_key(|a| a.offset);
        allocations
    }

    /// Free ranges ordered by offset.
    pub fn free_ranges(&self) -> impl Iterator<Item = FreeRange> + '_ {
        self.free_ranges
            .iter()
            .map(|(&offset, &size)| FreeRange { offset, size })
    }

    /// The largest free range; the first one wins ties.
    pub fn largest_free_range(&self) -> Option<FreeRange> {
        self.free_ranges().fold(None, |best: Option<FreeRange>, r| match best {
            Some(b) if b.size >= r.size => Some(b),
            _ => Some(r),
        })
    }

    /// Share of free space that is not part of the largest free range, in percent.
    ///
    /// Zero when there are fewer than two free ranges.
    #[allow(clippy::cast_precision_loss)]
    pub fn fragmentation_percent(&self) -> f64 {
        if self.free_ranges.len() < 2 {
            return 0.0;
        }
        let largest = self.largest_free_range().map_or(0, |r| r.size);
        (1.0 - largest as f64 / self.free_size as f64) * 100.0
    }

    /// Snapshot of the allocator counters.
    pub fn stats(&self) -> SubAllocatorStats {
        SubAllocatorStats {
            capacity: self.capacity,
            alignment: self.alignment,
            free_size: self.free_size,
            allocated_size: self.allocated_size(),
            allocation_count: self.live,
            free_range_count: self.free_ranges.len(),
            largest_free_range: self.largest_free_range().map_or(0, |r| r.size),
            fragmentation_percent: self.fragmentation_percent(),
        }
    }

    /// Human-readable listing of live allocations and free ranges.
    pub fn debug_report(&self) -> String {
        let allocations = self.allocations();
        let mut out = String::new();

        // Writing into a String cannot fail.
        let _ = writeln!(
            out,
            "capacity {} bytes, alignment {}",
            self.capacity, self.alignment
        );
        let _ = writeln!(
            out,
            "allocated {} ({} bytes):",
            allocations.len(),
            self.allocated_size()
        );
        for a in &allocations {
            let _ = writeln!(out, "  [{}, {}) {} bytes", a.offset, a.end(), a.size);
        }
        let _ = writeln!(
            out,
            "free {} ({} bytes, fragmentation {:.1}%):",
            self.free_ranges.len(),
            self.free_size,
            self.fragmentation_percent()
        );
        for r in self.free_ranges() {
            let _ = writeln!(out, "  [{}, {}) {} bytes", r.offset, r.end(), r.size);
        }

        out
    }

    /// One character per cell of the buffer: `#` fully allocated, `.` fully
    /// free, `+` mixed.
    ///
    /// `width` is clamped to the capacity so no cell is empty.
    pub fn occupancy_map(&self, width: usize) -> String {
        let cells = (width as u64).min(self.capacity);
        if cells == 0 {
            return String::new();
        }

        let capacity = u128::from(self.capacity);
        let cells_wide = u128::from(cells);
        let cell_start = |i: u64| (u128::from(i) * capacity / cells_wide) as u64;
        let cell_of = |offset: u64| (u128::from(offset) * cells_wide / capacity) as u64;

        let mut free_in_cell = vec![0u64; cells as usize];
        for range in self.free_ranges() {
            let last = cell_of(range.end() - 1).min(cells - 1);
            for cell in cell_of(range.offset)..=last {
                let start = cell_start(cell).max(range.offset);
                let end = cell_start(cell + 1).min(range.end());
                free_in_cell[cell as usize] += end.saturating_sub(start);
            }
        }

        free_in_cell
            .iter()
            .enumerate()
            .map(|(cell, &free)| {
                let len = cell_start(cell as u64 + 1) - cell_start(cell as u64);
                match free {
                    0 => '#',
                    f if f == len => '.',
                    _ => '+',
                }
            })
            .collect()
    }

    /// Check every structural invariant.
    ///
    /// Free ranges must be non-empty, ordered, non-overlapping and never
    /// adjacent; together with the live allocations they must tile
    /// `[0, capacity)` exactly.
    pub fn validate(&self) -> std::result::Result<(), InvariantViolation> {
        let violation = |msg: String| Err(InvariantViolation(msg));

        let mut free_total = 0u64;
        let mut prev_end: Option<u64> = None;
        for r in self.free_ranges() {
            if r.size == 0 {
                return violation(format!("empty free range at {}", r.offset));
            }
            if let Some(end) = prev_end {
                if r.offset <= end {
                    return violation(format!(
                        "free range at {} overlaps or touches the previous one ending at {end}",
                        r.offset
                    ));
                }
            }
            prev_end = Some(r.end());
            free_total += r.size;
        }
        if free_total != self.free_size {
            return violation(format!(
                "free ranges sum to {free_total}, counter says {}",
                self.free_size
            ));
        }

        let allocations = self.allocations();
        if allocations.len() != self.live {
            return violation(format!(
                "{} records present, counter says {}",
                allocations.len(),
                self.live
            ));
        }

        let mut spans: Vec<(u64, u64)> = allocations
            .iter()
            .map(|a| (a.offset, a.size))
            .chain(self.free_ranges().map(|r| (r.offset, r.size)))
            .collect();
        spans.sort_unstable();

        let mut cursor = 0u64;
        for (offset, size) in spans {
            if size == 0 {
                return violation(format!("zero-sized span at {offset}"));
            }
            if offset != cursor {
                return violation(format!(
                    "span at {offset} does not continue from {cursor} (gap or overlap)"
                ));
            }
            cursor = offset + size;
        }
        if cursor != self.capacity {
            return violation(format!(
                "spans end at {cursor}, capacity is {}",
                self.capacity
            ));
        }

        Ok(())
    }

    fn debug_validate(&self) {
        #[cfg(debug_assertions)]
        if let Err(violation) = self.validate() {
            panic!("{violation}");
        }
    }

    fn find_free_range(&self, size: u64, alignment: u64) -> Option<(FreeRange, u64)> {
        self.free_ranges.iter().find_map(|(&offset, &range_size)| {
            let padding = align_up(offset, alignment)? - offset;
            let usable = range_size.checked_sub(padding)?;
            (usable >= size).then_some((
                FreeRange {
                    offset,
                    size: range_size,
                },
                padding,
            ))
        })
    }

    /// Insert `[offset, offset + size)` and coalesce with touching neighbours.
    fn insert_free_range(&mut self, offset: u64, size: u64) -> FreeRange {
        let end = offset + size;
        let mut merged = FreeRange { offset, size };

        if let Some((&prev_offset, &prev_size)) = self.free_ranges.range(..offset).next_back() {
            let prev_end = prev_offset + prev_size;
            debug_assert!(
                prev_end <= offset,
                "free range [{prev_offset}, {prev_end}) overlaps released range at {offset}"
            );
            if prev_end == offset {
                self.free_ranges.remove(&prev_offset);
                merged.offset = prev_offset;
                merged.size += prev_size;
            }
        }

        if let Some((&next_offset, &next_size)) = self.free_ranges.range(offset..).next() {
            debug_assert!(
                next_offset >= end,
                "free range at {next_offset} overlaps released range ending at {end}"
            );
            if next_offset == end {
                self.free_ranges.remove(&next_offset);
                merged.size += next_size;
            }
        }

        self.free_ranges.insert(merged.offset, merged.size);
        merged
    }

    /// Index the next record will occupy. Does not modify any state.
    fn reserve_slot(&self) -> Result<u32> {
        if let Some(&index) = self.vacant_slots.last() {
            return Ok(index);
        }
        u32::try_from(self.slots.len())
            .ok()
            .filter(|&index| index < self.slot_limit)
            .ok_or(AllocError::TooManyAllocations {
                limit: self.slot_limit,
            })
    }

    /// Store `record` in `slot`, which must come from [`Self::reserve_slot`].
    fn insert_record(&mut self, slot: u32, record: Record) -> SuballocationId {
        self.live += 1;
        if self.vacant_slots.last() == Some(&slot) {
            self.vacant_slots.pop();
            let entry = &mut self.slots[slot as usize];
            entry.record = Some(record);
            return SuballocationId {
                allocator: self.id,
                slot,
                generation: entry.generation,
            };
        }

        debug_assert_eq!(slot as usize, self.slots.len());
        self.slots.push(Slot {
            generation: 0,
            record: Some(record),
        });
        SuballocationId {
            allocator: self.id,
            slot,
            generation: 0,
        }
    }

    fn take_record(&mut self, id: SuballocationId) -> Result<Record> {
        if !self.owns(id) {
            return Err(AllocError::InvalidArgument(
                "handle belongs to a different allocator".to_string(),
            ));
        }

        let record = self
            .slots
            .get_mut(id.slot as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| {
                let record = slot.record.take()?;
                slot.generation = slot.generation.wrapping_add(1);
                Some(record)
            })
            .ok_or_else(|| {
                AllocError::InvalidArgument(
                    "handle was already released or never allocated".to_string(),
                )
            })?;

        self.vacant_slots.push(id.slot);
        self.live -= 1;
        Ok(record)
    }
}
