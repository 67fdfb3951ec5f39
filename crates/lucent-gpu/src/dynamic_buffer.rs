//! A large GPU buffer carved into many independent sub-buffers.
//!
//! [`DynamicResizableBuffer`] pairs a [`SubAllocator`] with a
//! [`BackingBuffer`]. Each [`SubBuffer`] it hands out owns a byte range and a
//! view over it; dropping the sub-buffer destroys the view and returns the
//! range to the free list. Sub-buffers only keep a weak reference to the
//! shared state, so dropping the parent first invalidates them instead of
//! keeping the backing memory alive.

use std::sync::{Arc, Weak};

use ash::vk;
use gpu_allocator::MemoryLocation;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::backing::{BackingBuffer, DeviceBacking};
use crate::context::GpuContext;
use crate::error::{AllocError, GpuError, Result};
use crate::suballoc::{SubAllocator, SubAllocatorStats, Suballocation, SuballocationId};

/// Creation parameters for a device-backed dynamic buffer.
#[derive(Debug, Clone)]
pub struct DynamicBufferDesc {
    /// Debug name of the backing allocation.
    pub name: String,
    /// Usage of the backing buffer and every view.
    pub usage: vk::BufferUsageFlags,
    /// Where the backing memory lives.
    pub location: MemoryLocation,
    /// Upper bound on the backing size, before clamping.
    pub max_total_size: u64,
    /// Fraction of the target heap the backing may occupy, in `(0, 1]`.
    pub clamp_to_available_memory: f32,
    /// Sub-buffer alignment; derived from the device limits for `usage` when unset.
    pub alignment: Option<u64>,
}

impl DynamicBufferDesc {
    /// Device-local buffer of up to `max_total_size` bytes.
    pub fn new(name: impl Into<String>, usage: vk::BufferUsageFlags, max_total_size: u64) -> Self {
        Self {
            name: name.into(),
            usage,
            location: MemoryLocation::GpuOnly,
            max_total_size,
            clamp_to_available_memory: 1.0,
            alignment: None,
        }
    }

    /// Set the memory location.
    pub fn with_location(mut self, location: MemoryLocation) -> Self {
        self.location = location;
        self
    }

    /// Cap the backing size to a fraction of the heap it is allocated from.
    pub fn with_clamp(mut self, percentage: f32) -> Self {
        self.clamp_to_available_memory = percentage;
        self
    }

    /// Override the device-derived sub-buffer alignment.
    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = Some(alignment);
        self
    }

    /// Usage flags the backing is created with. Device-local memory needs
    /// `TRANSFER_DST` so initial data can be staged in.
    pub fn backing_usage(&self) -> vk::BufferUsageFlags {
        match self.location {
            MemoryLocation::GpuOnly => self.usage | vk::BufferUsageFlags::TRANSFER_DST,
            _ => self.usage,
        }
    }
}

struct Shared<B: BackingBuffer> {
    allocator: SubAllocator,
    backing: Arc<B>,
    views: HashMap<SuballocationId, B::View>,
}

impl<B: BackingBuffer> Shared<B> {
    fn release(&mut self, id: SuballocationId) {
        if let Some(view) = self.views.remove(&id) {
            self.backing.destroy_view(view);
        }
        if let Err(e) = self.allocator.release(id) {
            error!("Sub-buffer release failed: {e}");
        }
    }
}

impl<B: BackingBuffer> Drop for Shared<B> {
    fn drop(&mut self) {
        if !self.views.is_empty() {
            warn!(
                outstanding = self.views.len(),
                "Dynamic buffer destroyed with live sub-buffers; invalidating them"
            );
        }
        for (_, view) in self.views.drain() {
            self.backing.destroy_view(view);
        }
    }
}

/// A fixed-capacity buffer handing out sub-buffers.
pub struct DynamicResizableBuffer<B: BackingBuffer> {
    shared: Arc<Mutex<Shared<B>>>,
    backing: Arc<B>,
    capacity: u64,
    alignment: u64,
}

impl<B: BackingBuffer> DynamicResizableBuffer<B> {
    /// Manage the whole of `backing`, aligning every sub-buffer to at least `alignment`.
    pub fn new(backing: B, alignment: u64) -> Result<Self> {
        let capacity = backing.size();
        let allocator = SubAllocator::new(capacity, alignment)
            .map_err(|e| GpuError::ConstructionFailed(e.to_string()))?;

        let backing = Arc::new(backing);
        Ok(Self {
            shared: Arc::new(Mutex::new(Shared {
                allocator,
                backing: Arc::clone(&backing),
                views: HashMap::new(),
            })),
            backing,
            capacity,
            alignment,
        })
    }

    /// Total bytes available for sub-buffers.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Minimum alignment of every sub-buffer offset.
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Reserve `size` bytes and optionally fill them with `data`.
    pub fn allocate_buffer(&self, size: u64, data: Option<&[u8]>) -> Result<SubBuffer<B>> {
        self.allocate_buffer_aligned(size, 0, data)
    }

    /// Like [`allocate_buffer`](Self::allocate_buffer) with a stricter alignment.
    ///
    /// The buffer's own alignment still applies when `alignment` is smaller.
    pub fn allocate_buffer_aligned(
        &self,
        size: u64,
        alignment: u64,
        data: Option<&[u8]>,
    ) -> Result<SubBuffer<B>> {
        if let Some(data) = data {
            if data.len() as u64 > size {
                return Err(AllocError::InvalidArgument(format!(
                    "{} bytes of initial data do not fit in {size} bytes",
                    data.len()
                ))
                .into());
            }
        }
        if alignment != 0 && !alignment.is_power_of_two() {
            return Err(AllocError::InvalidArgument(format!(
                "alignment {alignment} is not a power of two"
            ))
            .into());
        }
        let alignment = alignment.max(self.alignment);

        let mut shared = self.shared.lock();
        let allocation = shared.allocator.allocate(size, alignment)?;

        let view = match shared.backing.create_view(allocation.offset, allocation.size) {
            Ok(view) => view,
            Err(e) => {
                shared.release(allocation.id);
                return Err(e);
            }
        };
        shared.views.insert(allocation.id, view);

        if let Some(data) = data {
            if let Err(e) = shared.backing.write(allocation.offset, data) {
                shared.release(allocation.id);
                return Err(e);
            }
        }

        Ok(SubBuffer {
            owner: Arc::downgrade(&self.shared),
            allocation,
        })
    }

    /// Reserve a sub-buffer holding `data`, aligned for `T`.
    pub fn allocate_with<T: bytemuck::Pod>(&self, data: &[T]) -> Result<SubBuffer<B>> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        self.allocate_buffer_aligned(
            bytes.len() as u64,
            std::mem::align_of::<T>() as u64,
            Some(bytes),
        )
    }

    /// Sum of all free range sizes.
    pub fn free_size(&self) -> u64 {
        self.shared.lock().allocator.free_size()
    }

    /// See [`SubAllocator::fragmentation_percent`].
    pub fn fragmentation_percent(&self) -> f64 {
        self.shared.lock().allocator.fragmentation_percent()
    }

    /// Allocator statistics.
    pub fn stats(&self) -> SubAllocatorStats {
        self.shared.lock().allocator.stats()
    }

    /// Live sub-buffer ranges ordered by offset.
    pub fn allocated_sub_buffers(&self) -> Vec<Suballocation> {
        self.shared.lock().allocator.allocations()
    }

    /// See [`SubAllocator::debug_report`].
    pub fn debug_report(&self) -> String {
        self.shared.lock().allocator.debug_report()
    }

    /// See [`SubAllocator::occupancy_map`].
    pub fn occupancy_map(&self, width: usize) -> String {
        self.shared.lock().allocator.occupancy_map(width)
    }

    /// The backing buffer, e.g. to bind it with explicit offsets.
    ///
    /// Borrowing it takes no lock, so sub-buffers can be allocated and dropped
    /// while the reference is held.
    pub fn backing(&self) -> &B {
        &self.backing
    }
}

/// A sub-range of a [`DynamicResizableBuffer`].
///
/// Dropping it returns the range to the parent.
pub struct SubBuffer<B: BackingBuffer> {
    owner: Weak<Mutex<Shared<B>>>,
    allocation: Suballocation,
}

impl<B: BackingBuffer> SubBuffer<B> {
    /// Byte offset within the backing buffer.
    pub fn offset(&self) -> u64 {
        self.allocation.offset
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.allocation.size
    }

    /// Allocator handle of this range.
    pub fn id(&self) -> SuballocationId {
        self.allocation.id
    }

    /// Whether the parent buffer is still alive.
    pub fn is_valid(&self) -> bool {
        self.owner.strong_count() > 0
    }

    /// The backing view, or `None` once the parent buffer is gone.
    pub fn view(&self) -> Option<B::View> {
        let shared = self.owner.upgrade()?;
        let view = shared.lock().views.get(&self.allocation.id).cloned();
        view
    }

    /// Write `data` at `offset` bytes into this sub-buffer.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        match offset.checked_add(data.len() as u64) {
            Some(end) if end <= self.allocation.size => {}
            _ => {
                return Err(GpuError::InvalidState(format!(
                    "write of {} bytes at {offset} exceeds sub-buffer of {} bytes",
                    data.len(),
                    self.allocation.size
                )))
            }
        }

        let shared = self
            .owner
            .upgrade()
            .ok_or_else(|| GpuError::InvalidState("Parent buffer was destroyed".to_string()))?;
        let shared = shared.lock();
        shared.backing.write(self.allocation.offset + offset, data)
    }
}

impl<B: BackingBuffer> Drop for SubBuffer<B> {
    fn drop(&mut self) {
        if let Some(shared) = self.owner.upgrade() {
            shared.lock().release(self.allocation.id);
        }
    }
}

impl<B: BackingBuffer> std::fmt::Debug for SubBuffer<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubBuffer")
            .field("offset", &self.allocation.offset)
            .field("size", &self.allocation.size)
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// Create a device-backed dynamic buffer described by `desc`.
///
/// The capacity is `desc.max_total_size` clamped to the configured share of
/// the target heap. `data`, if given, is written at offset zero.
pub fn create_dynamic_resizable_buffer(
    context: &Arc<GpuContext>,
    desc: &DynamicBufferDesc,
    data: Option<&[u8]>,
) -> Result<DynamicResizableBuffer<DeviceBacking>> {
    let capabilities = context.capabilities();
    let capacity = capabilities.clamp_to_heap(
        desc.max_total_size,
        desc.clamp_to_available_memory,
        desc.location,
    )?;
    if capacity == 0 {
        return Err(GpuError::ConstructionFailed(format!(
            "dynamic buffer '{}' would have zero capacity",
            desc.name
        )));
    }
    if let Some(data) = data {
        if data.len() as u64 > capacity {
            return Err(GpuError::ConstructionFailed(format!(
                "{} bytes of initial data exceed capacity {capacity}",
                data.len()
            )));
        }
    }

    let usage = desc.backing_usage();
    let alignment = desc
        .alignment
        .unwrap_or_else(|| capabilities.buffer_alignment(desc.usage));

    let buffer = context
        .allocator()
        .lock()
        .create_buffer(capacity, usage, desc.location, &desc.name)
        .map_err(|e| GpuError::ConstructionFailed(e.to_string()))?;
    let backing = DeviceBacking::new(Arc::clone(context), buffer);

    if let Some(data) = data {
        backing.write(0, data)?;
    }

    info!(
        name = %desc.name,
        capacity,
        requested = desc.max_total_size,
        alignment,
        "Created dynamic resizable buffer"
    );

    DynamicResizableBuffer::new(backing, alignment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::{HostBacking, HostView};

    fn host_buffer(size: usize, alignment: u64) -> DynamicResizableBuffer<HostBacking> {
        DynamicResizableBuffer::new(HostBacking::new(size), alignment).unwrap()
    }

    #[test]
    fn sub_buffers_get_views_and_data() {
        let buffer = host_buffer(1024, 16);
        let sub = buffer.allocate_buffer(10, Some(b"hello")).unwrap();

        assert_eq!(sub.offset(), 0);
        assert_eq!(sub.size(), 10);
        assert_eq!(
            sub.view(),
            Some(HostView {
                offset: 0,
                size: 10
            })
        );
        let bytes = buffer.backing().read(0, 5).unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn drop_returns_range() {
        let buffer = host_buffer(256, 1);
        let a = buffer.allocate_buffer(100, None).unwrap();
        let b = buffer.allocate_buffer(100, None).unwrap();
        assert_eq!(buffer.free_size(), 56);
        assert_eq!(buffer.allocated_sub_buffers().len(), 2);

        drop(a);
        drop(b);
        assert_eq!(buffer.free_size(), 256);
        assert!(buffer.allocated_sub_buffers().is_empty());
        assert!(buffer.allocate_buffer(256, None).is_ok());
    }

    #[test]
    fn buffer_alignment_is_a_floor() {
        let buffer = host_buffer(4096, 64);
        let _a = buffer.allocate_buffer(1, None).unwrap();
        let b = buffer.allocate_buffer_aligned(1, 16, None).unwrap();
        let c = buffer.allocate_buffer_aligned(1, 256, None).unwrap();
        assert_eq!(b.offset(), 64);
        assert_eq!(c.offset(), 256);
    }

    #[test]
    fn non_power_of_two_alignment_is_rejected_below_buffer_alignment() {
        let buffer = host_buffer(4096, 64);
        for alignment in [3, 48, 96] {
            assert!(matches!(
                buffer.allocate_buffer_aligned(16, alignment, None),
                Err(GpuError::SubAllocation(AllocError::InvalidArgument(_)))
            ));
        }
        assert_eq!(buffer.free_size(), 4096);
    }

    #[test]
    fn backing_borrow_does_not_block_sub_buffers() {
        let buffer = host_buffer(64, 1);
        let sub = buffer.allocate_buffer(8, Some(&[7; 8])).unwrap();

        let backing = buffer.backing();
        drop(sub);
        let other = buffer.allocate_buffer(4, None).unwrap();
        assert_eq!(other.offset(), 0);
        assert_eq!(backing.read(4, 4).unwrap(), vec![7; 4]);
    }

    #[test]
    fn typed_upload() {
        let buffer = host_buffer(64, 4);
        let sub = buffer.allocate_with(&[1u32, 2, 3]).unwrap();
        assert_eq!(sub.size(), 12);
        let bytes = buffer.backing().read(sub.offset(), 12).unwrap();
        assert_eq!(bytes, bytemuck::cast_slice::<u32, u8>(&[1, 2, 3]));
    }

    #[test]
    fn oversized_initial_data_is_rejected() {
        let buffer = host_buffer(64, 1);
        let err = buffer.allocate_buffer(2, Some(b"abc")).unwrap_err();
        assert!(matches!(
            err,
            GpuError::SubAllocation(AllocError::InvalidArgument(_))
        ));
        assert_eq!(buffer.free_size(), 64);
    }

    #[test]
    fn rejected_view_releases_range() {
        let buffer =
            DynamicResizableBuffer::new(HostBacking::new(256).with_view_alignment(32), 1).unwrap();
        let _first = buffer.allocate_buffer(8, None).unwrap();
        let err = buffer.allocate_buffer(8, None).unwrap_err();
        assert!(matches!(err, GpuError::ViewRejected(_)));
        assert_eq!(buffer.free_size(), 248);
        assert_eq!(buffer.allocated_sub_buffers().len(), 1);
    }

    #[test]
    fn out_of_space_is_reported() {
        let buffer = host_buffer(100, 1);
        let _a = buffer.allocate_buffer(80, None).unwrap();
        assert!(matches!(
            buffer.allocate_buffer(30, None),
            Err(GpuError::SubAllocation(AllocError::OutOfSpace { .. }))
        ));
    }

    #[test]
    fn sub_buffer_writes_are_bounded() {
        let buffer = host_buffer(64, 1);
        let _pad = buffer.allocate_buffer(8, None).unwrap();
        let sub = buffer.allocate_buffer(8, None).unwrap();
        sub.write(4, &[9, 9, 9, 9]).unwrap();
        assert!(sub.write(6, &[1, 2, 3]).is_err());
        let bytes = buffer.backing().read(8, 8).unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 0, 9, 9, 9, 9]);
    }

    #[test]
    fn dropping_parent_invalidates_sub_buffers() {
        let buffer = host_buffer(64, 1);
        let sub = buffer.allocate_buffer(16, None).unwrap();
        assert!(sub.is_valid());

        drop(buffer);
        assert!(!sub.is_valid());
        assert_eq!(sub.view(), None);
        assert!(sub.write(0, &[1]).is_err());
        // Dropping an invalidated sub-buffer is a no-op.
        drop(sub);
    }

    #[test]
    fn desc_defaults() {
        let desc = DynamicBufferDesc::new("instances", vk::BufferUsageFlags::STORAGE_BUFFER, 1 << 20);
        assert_eq!(desc.location, MemoryLocation::GpuOnly);
        assert_eq!(desc.clamp_to_available_memory, 1.0);
        assert_eq!(desc.alignment, None);
        assert!(desc
            .backing_usage()
            .contains(vk::BufferUsageFlags::TRANSFER_DST));

        let host = desc.with_location(MemoryLocation::CpuToGpu).with_clamp(0.5);
        assert_eq!(host.backing_usage(), vk::BufferUsageFlags::STORAGE_BUFFER);
        assert_eq!(host.clamp_to_available_memory, 0.5);
    }
}
