//! Headless GPU context: device, transfer queue and memory allocator.

use crate::capabilities::GpuCapabilities;
use crate::command::{execute_single_time_commands, record_buffer_copy, CommandPool};
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device};
use crate::memory::{GpuAllocator, GpuBuffer};
use ash::vk;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::sync::Arc;

/// Main GPU context holding Vulkan resources.
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) capabilities: GpuCapabilities,
    pub(crate) allocator: Mutex<GpuAllocator>,

    pub(crate) transfer_queue_family: u32,
    pub(crate) transfer_queue: vk::Queue,
    /// Pool for staging uploads; the lock also serializes use of the queue.
    pub(crate) transfer_pool: Mutex<CommandPool>,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get GPU capabilities.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the transfer queue.
    pub fn transfer_queue(&self) -> vk::Queue {
        self.transfer_queue
    }

    /// Get the transfer queue family index.
    pub fn transfer_queue_family(&self) -> u32 {
        self.transfer_queue_family
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    /// Copy `data` into `dst` at `offset` through a host-visible staging buffer.
    ///
    /// Blocks until the transfer queue is idle. `dst` needs `TRANSFER_DST` usage.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn upload_to_buffer(&self, dst: &GpuBuffer, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let size = data.len() as u64;
        if offset.checked_add(size).map_or(true, |end| end > dst.size) {
            return Err(GpuError::InvalidState(
                "Upload range exceeds destination buffer".to_string(),
            ));
        }

        let mut staging = self.allocator.lock().create_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            "staging_upload",
        )?;

        let result = staging.write_bytes(0, data).and_then(|()| {
            let pool = self.transfer_pool.lock();
            unsafe {
                execute_single_time_commands(&self.device, &pool, self.transfer_queue, |cmd| {
                    record_buffer_copy(&self.device, cmd, staging.buffer, dst.buffer, offset, size);
                })
            }
        });

        self.allocator.lock().free_buffer(&mut staging)?;
        result
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            self.transfer_pool.lock().destroy(&self.device);

            // Shutdown allocator BEFORE destroying device
            // This frees all VkDeviceMemory allocations
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Lucent".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Build the GPU context.
    ///
    /// Everything created before a failing step is destroyed again.
    pub fn build(self) -> Result<GpuContext> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance = unsafe { create_instance(&entry, &self.app_name, self.enable_validation) }?;
        let instance_guard = OnUnwind::new(|| unsafe { instance.destroy_instance(None) });

        let physical_device = unsafe { select_physical_device(&instance) }?;
        let capabilities = unsafe { GpuCapabilities::query(&instance, physical_device) };

        if !capabilities.meets_requirements() {
            return Err(GpuError::NoSuitableDevice);
        }

        tracing::info!("Selected GPU: {}", capabilities.summary());

        let transfer_queue_family = unsafe { find_transfer_queue_family(&instance, physical_device) }?;

        let queue_priority = 1.0_f32;
        let queue_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(transfer_queue_family)
            .queue_priorities(std::slice::from_ref(&queue_priority));
        let device_create_info =
            vk::DeviceCreateInfo::default().queue_create_infos(std::slice::from_ref(&queue_info));

        let device =
            Arc::new(unsafe { instance.create_device(physical_device, &device_create_info, None)? });
        let device_guard = OnUnwind::new(|| unsafe { device.destroy_device(None) });
        let transfer_queue = unsafe { device.get_device_queue(transfer_queue_family, 0) };

        // Declared after the device guard so it is dropped before the device.
        let allocator = unsafe { GpuAllocator::new(&instance, device.clone(), physical_device) }?;
        let transfer_pool = unsafe {
            CommandPool::new(
                &device,
                transfer_queue_family,
                vk::CommandPoolCreateFlags::TRANSIENT,
            )
        }?;

        device_guard.disarm();
        instance_guard.disarm();

        Ok(GpuContext {
            entry,
            instance,
            physical_device,
            device,
            capabilities,
            allocator: Mutex::new(allocator),
            transfer_queue_family,
            transfer_queue,
            transfer_pool: Mutex::new(transfer_pool),
        })
    }
}

/// Runs a cleanup closure when dropped, unless disarmed first.
struct OnUnwind<F: FnOnce()> {
    cleanup: Option<F>,
}

impl<F: FnOnce()> OnUnwind<F> {
    fn new(cleanup: F) -> Self {
        Self {
            cleanup: Some(cleanup),
        }
    }

    fn disarm(mut self) {
        self.cleanup = None;
    }
}

impl<F: FnOnce()> Drop for OnUnwind<F> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

/// Find a queue family for uploads: a dedicated transfer family if there is
/// one, otherwise any family with transfer, compute or graphics support.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_transfer_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<u32> {
    let families = instance.get_physical_device_queue_family_properties(physical_device);

    let dedicated = families.iter().position(|family| {
        family.queue_flags.contains(vk::QueueFlags::TRANSFER)
            && !family
                .queue_flags
                .intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
    });

    // Graphics and compute queues implicitly support transfer.
    let any = || {
        families.iter().position(|family| {
            family.queue_flags.intersects(
                vk::QueueFlags::TRANSFER | vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
            )
        })
    };

    dedicated
        .or_else(any)
        .map(|index| index as u32)
        .ok_or(GpuError::NoSuitableDevice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn cleanup_runs_in_reverse_order_on_early_return() {
        let log = RefCell::new(Vec::new());
        let result: std::result::Result<(), ()> = (|| {
            let _instance = OnUnwind::new(|| log.borrow_mut().push("instance"));
            let _device = OnUnwind::new(|| log.borrow_mut().push("device"));
            Err(())
        })();

        assert!(result.is_err());
        assert_eq!(*log.borrow(), vec!["device", "instance"]);
    }

    #[test]
    fn disarmed_cleanup_does_not_run() {
        let log = RefCell::new(Vec::new());
        {
            let instance = OnUnwind::new(|| log.borrow_mut().push("instance"));
            let device = OnUnwind::new(|| log.borrow_mut().push("device"));
            device.disarm();
            instance.disarm();
        }
        assert!(log.borrow().is_empty());
    }
}
