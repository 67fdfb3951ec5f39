//! GPU capability detection: memory heaps and buffer alignment limits.

use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// A device memory heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryHeap {
    pub size: u64,
    pub flags: vk::MemoryHeapFlags,
}

/// A device memory type and the heap it draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    pub property_flags: vk::MemoryPropertyFlags,
    pub heap_index: u32,
}

/// Offset alignment limits relevant to buffer sub-ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferAlignmentLimits {
    pub min_uniform_buffer_offset_alignment: u64,
    pub min_storage_buffer_offset_alignment: u64,
    pub min_texel_buffer_offset_alignment: u64,
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,

    pub memory_heaps: Vec<MemoryHeap>,
    pub memory_types: Vec<MemoryType>,
    pub alignment_limits: BufferAlignmentLimits,
    pub max_uniform_buffer_range: u32,
    pub max_storage_buffer_range: u32,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let memory_heaps = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .map(|heap| MemoryHeap {
                size: heap.size,
                flags: heap.flags,
            })
            .collect();

        let memory_types = memory_properties
            .memory_types
            .iter()
            .take(memory_properties.memory_type_count as usize)
            .map(|ty| MemoryType {
                property_flags: ty.property_flags,
                heap_index: ty.heap_index,
            })
            .collect();

        let limits = &properties.limits;

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            api_version: properties.api_version,
            memory_heaps,
            memory_types,
            alignment_limits: BufferAlignmentLimits {
                min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
                min_storage_buffer_offset_alignment: limits.min_storage_buffer_offset_alignment,
                min_texel_buffer_offset_alignment: limits.min_texel_buffer_offset_alignment,
            },
            max_uniform_buffer_range: limits.max_uniform_buffer_range,
            max_storage_buffer_range: limits.max_storage_buffer_range,
        }
    }

    /// Check if the GPU can host the buffer layer (Vulkan 1.1 and a device-local heap).
    pub fn meets_requirements(&self) -> bool {
        let api_major = vk::api_version_major(self.api_version);
        let api_minor = vk::api_version_minor(self.api_version);
        if api_major < 1 || (api_major == 1 && api_minor < 1) {
            return false;
        }

        self.memory_heaps
            .iter()
            .any(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
    }

    /// Device-local memory in MB.
    pub fn device_local_memory_mb(&self) -> u64 {
        self.memory_heaps
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum()
    }

    /// Minimum offset alignment a sub-range of a buffer with `usage` must honour.
    ///
    /// The largest of the limits that apply to the usage flags; at least 1.
    pub fn buffer_alignment(&self, usage: vk::BufferUsageFlags) -> u64 {
        let limits = &self.alignment_limits;
        let mut alignment = 1;

        if usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER) {
            alignment = alignment.max(limits.min_uniform_buffer_offset_alignment);
        }
        if usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER) {
            alignment = alignment.max(limits.min_storage_buffer_offset_alignment);
        }
        if usage.intersects(
            vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER | vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER,
        ) {
            alignment = alignment.max(limits.min_texel_buffer_offset_alignment);
        }

        // Vulkan guarantees these limits are powers of two; keep the contract
        // even for drivers that report otherwise.
        alignment.next_power_of_two()
    }

    /// Largest view a buffer with `usage` may be bound as, in bytes.
    ///
    /// Uniform and storage descriptors each cap the range they can address;
    /// the smaller cap wins when both usages are present.
    pub fn max_view_range(&self, usage: vk::BufferUsageFlags) -> u64 {
        let mut range = u64::MAX;
        if usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER) {
            range = range.min(u64::from(self.max_uniform_buffer_range));
        }
        if usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER) {
            range = range.min(u64::from(self.max_storage_buffer_range));
        }
        range
    }

    /// Heap backing the memory type that `location` would be allocated from.
    pub fn heap_for_location(&self, location: MemoryLocation) -> Option<&MemoryHeap> {
        let device = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE;

        let preferences = match location {
            MemoryLocation::GpuOnly => vec![device],
            MemoryLocation::CpuToGpu => vec![
                host | vk::MemoryPropertyFlags::HOST_COHERENT | device,
                host | vk::MemoryPropertyFlags::HOST_COHERENT,
                host,
            ],
            MemoryLocation::GpuToCpu => vec![host | vk::MemoryPropertyFlags::HOST_CACHED, host],
            MemoryLocation::Unknown => vec![vk::MemoryPropertyFlags::empty()],
        };

        preferences.iter().find_map(|&wanted| {
            self.memory_types
                .iter()
                .find(|ty| ty.property_flags.contains(wanted))
                .and_then(|ty| self.memory_heaps.get(ty.heap_index as usize))
        })
    }

    /// Cap `requested` bytes to `percentage` of the heap used for `location`.
    ///
    /// `percentage` is a fraction in `(0, 1]`.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn clamp_to_heap(
        &self,
        requested: u64,
        percentage: f32,
        location: MemoryLocation,
    ) -> Result<u64> {
        if !(percentage > 0.0 && percentage <= 1.0) {
            return Err(GpuError::ConstructionFailed(format!(
                "memory percentage {percentage} is outside (0, 1]"
            )));
        }

        let heap = self.heap_for_location(location).ok_or_else(|| {
            GpuError::ConstructionFailed(format!("no memory heap compatible with {location:?}"))
        })?;

        let max_bytes = (heap.size as f64 * f64::from(percentage)).floor() as u64;
        Ok(requested.min(max_bytes))
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn discrete_gpu() -> GpuCapabilities {
        GpuCapabilities {
            vendor: GpuVendor::Nvidia,
            device_name: "Test GPU".to_string(),
            api_version: vk::make_api_version(0, 1, 3, 0),
            memory_heaps: vec![
                MemoryHeap {
                    size: 8 * GIB,
                    flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
                },
                MemoryHeap {
                    size: 16 * GIB,
                    flags: vk::MemoryHeapFlags::empty(),
                },
            ],
            memory_types: vec![
                MemoryType {
                    property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                        | vk::MemoryPropertyFlags::HOST_COHERENT,
                    heap_index: 1,
                },
                MemoryType {
                    property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                        | vk::MemoryPropertyFlags::HOST_COHERENT
                        | vk::MemoryPropertyFlags::HOST_CACHED,
                    heap_index: 1,
                },
            ],
            alignment_limits: BufferAlignmentLimits {
                min_uniform_buffer_offset_alignment: 256,
                min_storage_buffer_offset_alignment: 32,
                min_texel_buffer_offset_alignment: 16,
            },
            max_uniform_buffer_range: 65536,
            max_storage_buffer_range: 1 << 30,
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
    }

    #[test]
    fn alignment_follows_usage() {
        let caps = discrete_gpu();
        assert_eq!(caps.buffer_alignment(vk::BufferUsageFlags::VERTEX_BUFFER), 1);
        assert_eq!(
            caps.buffer_alignment(vk::BufferUsageFlags::STORAGE_BUFFER),
            32
        );
        assert_eq!(
            caps.buffer_alignment(
                vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER
            ),
            256
        );
        assert_eq!(
            caps.buffer_alignment(vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER),
            16
        );
    }

    #[test]
    fn view_range_follows_usage() {
        let caps = discrete_gpu();
        assert_eq!(
            caps.max_view_range(vk::BufferUsageFlags::VERTEX_BUFFER),
            u64::MAX
        );
        assert_eq!(
            caps.max_view_range(vk::BufferUsageFlags::STORAGE_BUFFER),
            1 << 30
        );
        assert_eq!(
            caps.max_view_range(
                vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER
            ),
            65536
        );
    }

    #[test]
    fn clamp_uses_heap_of_location() {
        let caps = discrete_gpu();
        assert_eq!(
            caps.clamp_to_heap(u64::MAX, 0.5, MemoryLocation::GpuOnly)
                .unwrap(),
            4 * GIB
        );
        assert_eq!(
            caps.clamp_to_heap(u64::MAX, 0.25, MemoryLocation::CpuToGpu)
                .unwrap(),
            4 * GIB
        );
        assert_eq!(
            caps.clamp_to_heap(GIB, 1.0, MemoryLocation::GpuOnly).unwrap(),
            GIB
        );
    }

    #[test]
    fn clamp_rejects_bad_percentage() {
        let caps = discrete_gpu();
        for pct in [0.0, -0.5, 1.5, f32::NAN] {
            assert!(matches!(
                caps.clamp_to_heap(GIB, pct, MemoryLocation::GpuOnly),
                Err(GpuError::ConstructionFailed(_))
            ));
        }
    }

    #[test]
    fn clamp_fails_without_compatible_heap() {
        let mut caps = discrete_gpu();
        caps.memory_types
            .retain(|ty| !ty.property_flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL));
        assert!(matches!(
            caps.clamp_to_heap(GIB, 1.0, MemoryLocation::GpuOnly),
            Err(GpuError::ConstructionFailed(_))
        ));
        assert!(caps.meets_requirements());
    }
}
