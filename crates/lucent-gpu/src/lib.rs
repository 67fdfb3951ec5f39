//! Vulkan buffer abstraction layer for Lucent.
//!
//! This crate provides:
//! - A first-fit sub-allocator over a fixed byte capacity
//! - Dynamic resizable buffers that hand out sub-buffers of one large allocation
//! - Host and device backings for those buffers
//! - Headless Vulkan device management and memory allocation via gpu-allocator
//! - Deferred release of sub-buffers across frames in flight

pub mod backing;
pub mod capabilities;
pub mod command;
pub mod context;
pub mod deferred;
pub mod dynamic_buffer;
pub mod error;
pub mod instance;
pub mod memory;
pub mod suballoc;

pub use backing::{BackingBuffer, DeviceBacking, DeviceView, HostBacking, HostView};
pub use capabilities::{GpuCapabilities, GpuVendor};
pub use context::{GpuContext, GpuContextBuilder};
pub use deferred::DeferredReleaseQueue;
pub use dynamic_buffer::{
    create_dynamic_resizable_buffer, DynamicBufferDesc, DynamicResizableBuffer, SubBuffer,
};
pub use error::{AllocError, GpuError, InvariantViolation, Result};
pub use memory::{GpuAllocator, GpuBuffer};
pub use suballoc::{FreeRange, SubAllocator, SubAllocatorStats, Suballocation, SuballocationId};
