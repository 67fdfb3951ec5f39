//! GPU and sub-allocation error types.

use ash::vk;
use thiserror::Error;

/// Errors reported by [`SubAllocator`](crate::suballoc::SubAllocator).
///
/// All variants are recoverable: the allocator state is untouched when one
/// is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// Zero-sized request, bad alignment, or a handle this allocator does not own.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No free range is large enough once alignment padding is applied.
    #[error(
        "Out of space: requested {size} bytes (alignment {alignment}), \
         largest free range is {largest_free} of {free_size} free bytes"
    )]
    OutOfSpace {
        size: u64,
        alignment: u64,
        free_size: u64,
        largest_free: u64,
    },

    /// Every allocation handle slot is in use.
    #[error("Too many live sub-allocations (limit {limit})")]
    TooManyAllocations { limit: u32 },
}

/// A broken sub-allocator invariant. Always a bug, never a caller error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Sub-allocator invariant violated: {0}")]
pub struct InvariantViolation(pub String);

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Sub-allocation inside a dynamic buffer failed.
    #[error(transparent)]
    SubAllocation(#[from] AllocError),

    /// A dynamic buffer could not be created (memory clamping or backing buffer creation).
    #[error("Construction failed: {0}")]
    ConstructionFailed(String),

    /// The backing buffer rejected a sub-buffer view.
    #[error("Sub-buffer view rejected: {0}")]
    ViewRejected(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
