//! Backing buffers that sub-buffer views are carved from.
//!
//! A [`DynamicResizableBuffer`](crate::dynamic_buffer::DynamicResizableBuffer)
//! only decides *which* bytes a sub-buffer gets. Turning that range into
//! something the caller can bind, and filling it with data, is the job of a
//! [`BackingBuffer`].

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::memory::GpuBuffer;

/// Storage that can expose byte ranges of itself as independent views.
pub trait BackingBuffer {
    /// Handle describing one sub-range.
    type View: Clone;

    /// Total size in bytes. Fixed for the lifetime of the backing.
    fn size(&self) -> u64;

    /// Create a view over `[offset, offset + size)`.
    ///
    /// May reject ranges the underlying storage cannot address, e.g. because
    /// of device alignment rules.
    fn create_view(&self, offset: u64, size: u64) -> Result<Self::View>;

    /// Destroy a view previously returned by [`create_view`](Self::create_view).
    fn destroy_view(&self, view: Self::View);

    /// Copy `data` into the storage starting at byte `offset`.
    fn write(&self, offset: u64, data: &[u8]) -> Result<()>;
}

fn check_range(offset: u64, len: u64, size: u64) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(GpuError::InvalidState(format!(
            "Range [{offset}, +{len}) exceeds buffer of {size} bytes"
        ))),
    }
}

/// Host memory backing, for CPU-side staging and tests.
#[derive(Debug)]
pub struct HostBacking {
    bytes: Mutex<Vec<u8>>,
    view_alignment: u64,
}

/// A byte range of a [`HostBacking`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostView {
    pub offset: u64,
    pub size: u64,
}

impl HostBacking {
    /// Zero-filled backing of `size` bytes accepting views at any offset.
    pub fn new(size: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0; size]),
            view_alignment: 1,
        }
    }

    /// Reject views whose offset is not a multiple of `alignment`.
    ///
    /// Mirrors devices that only accept aligned buffer offsets.
    pub fn with_view_alignment(mut self, alignment: u64) -> Self {
        self.view_alignment = alignment.max(1);
        self
    }

    /// Copy of `len` bytes starting at `offset`.
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        check_range(offset, len as u64, self.size())?;
        let start = offset as usize;
        Ok(self.bytes.lock()[start..start + len].to_vec())
    }
}

impl BackingBuffer for HostBacking {
    type View = HostView;

    fn size(&self) -> u64 {
        self.bytes.lock().len() as u64
    }

    fn create_view(&self, offset: u64, size: u64) -> Result<HostView> {
        check_range(offset, size, self.size())?;
        if offset % self.view_alignment != 0 {
            return Err(GpuError::ViewRejected(format!(
                "offset {offset} is not a multiple of {}",
                self.view_alignment
            )));
        }
        Ok(HostView { offset, size })
    }

    fn destroy_view(&self, _view: HostView) {}

    fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        check_range(offset, data.len() as u64, self.size())?;
        let start = offset as usize;
        self.bytes.lock()[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// A `GpuBuffer` allocated through the context's allocator.
///
/// Views are child `vk::Buffer`s bound to the parent's memory at the
/// sub-range, so each can be bound on its own.
pub struct DeviceBacking {
    context: Arc<GpuContext>,
    buffer: GpuBuffer,
}

/// A child buffer aliasing a sub-range of a [`DeviceBacking`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceView {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
}

impl DeviceBacking {
    /// Take ownership of `buffer`; it is freed when the backing drops.
    pub fn new(context: Arc<GpuContext>, buffer: GpuBuffer) -> Self {
        Self { context, buffer }
    }

    /// The parent buffer, for binding with explicit offsets.
    pub fn buffer(&self) -> &GpuBuffer {
        &self.buffer
    }
}

impl BackingBuffer for DeviceBacking {
    type View = DeviceView;

    fn size(&self) -> u64 {
        self.buffer.size
    }

    fn create_view(&self, offset: u64, size: u64) -> Result<DeviceView> {
        check_range(offset, size, self.buffer.size)?;
        let max_range = self.context.capabilities().max_view_range(self.buffer.usage);
        if size > max_range {
            return Err(GpuError::ViewRejected(format!(
                "{size} byte view exceeds the device range limit of {max_range} bytes"
            )));
        }

        let device = self.context.device();
        let (memory, base_offset) = self.buffer.memory_binding()?;

        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(self.buffer.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let child = unsafe { device.create_buffer(&info, None)? };

        let requirements = unsafe { device.get_buffer_memory_requirements(child) };
        let memory_offset =
            match place_device_view(base_offset, self.buffer.size, offset, size, &requirements) {
                Ok(memory_offset) => memory_offset,
                Err(e) => {
                    unsafe { device.destroy_buffer(child, None) };
                    return Err(e);
                }
            };

        if let Err(e) = unsafe { device.bind_buffer_memory(child, memory, memory_offset) } {
            unsafe { device.destroy_buffer(child, None) };
            return Err(e.into());
        }

        Ok(DeviceView {
            buffer: child,
            offset,
            size,
        })
    }

    fn destroy_view(&self, view: DeviceView) {
        unsafe { self.context.device().destroy_buffer(view.buffer, None) };
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        if self.buffer.mapped_ptr().is_some() {
            self.buffer.write_bytes(offset, data)
        } else {
            self.context.upload_to_buffer(&self.buffer, offset, data)
        }
    }
}

/// Memory offset a child buffer for `[offset, offset + size)` binds at.
///
/// `parent_memory_offset` is where the parent buffer itself is bound, which is
/// non-zero whenever its memory is sub-allocated from a larger block.
fn place_device_view(
    parent_memory_offset: u64,
    parent_size: u64,
    offset: u64,
    size: u64,
    requirements: &vk::MemoryRequirements,
) -> Result<u64> {
    let memory_offset = parent_memory_offset + offset;
    if memory_offset % requirements.alignment.max(1) != 0
        || requirements.size > parent_size - offset
    {
        return Err(GpuError::ViewRejected(format!(
            "device needs {} byte alignment and {} bytes for a {size} byte view at offset {offset}",
            requirements.alignment, requirements.size
        )));
    }
    Ok(memory_offset)
}

impl Drop for DeviceBacking {
    fn drop(&mut self) {
        if let Err(e) = self.context.allocator().lock().free_buffer(&mut self.buffer) {
            tracing::error!("Failed to free dynamic buffer backing: {e}");
        }
    }
}
