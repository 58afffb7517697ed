//! Error types for the lamco-swapchain crate.

use thiserror::Error;

/// Errors produced while allocating a buffer.
///
/// Most variants are recoverable inside the allocator itself (the next
/// format/modifier candidate or the next tranche is tried); only
/// [`AllocError::Exhausted`] and [`AllocError::InvalidRequest`] reach the
/// caller of [`allocate`](crate::allocator::BufferManager::allocate) once
/// the shared-memory fallback has also failed or been ruled out.
#[derive(Error, Debug)]
pub enum AllocError {
    /// The request had a zero width or height; rejected before any syscall.
    #[error("invalid buffer request: {width}x{height}")]
    InvalidRequest {
        /// Requested width in pixels
        width: u32,
        /// Requested height in pixels
        height: u32,
    },

    /// A device identifier could not be resolved to a usable render node.
    #[error("device {devnum:#x} unavailable: {reason}")]
    DeviceUnavailable {
        /// The raw device number supplied by the remote peer
        devnum: u64,
        /// Why resolution or opening failed
        reason: String,
    },

    /// GPU memory allocation failed for a specific format/modifier pair.
    #[error("gbm allocation failed for {fourcc:?}: {source}")]
    AllocationFailed {
        /// The format that was attempted
        fourcc: drm_fourcc::DrmFourcc,
        /// The underlying allocation error
        #[source]
        source: std::io::Error,
    },

    /// A successfully allocated buffer could not be exported as dmabuf fds.
    #[error("plane export failed: {0}")]
    ExportFailed(String),

    /// Shared-memory allocation (memfd or mapping) failed.
    #[error("shared memory allocation failed: {0}")]
    ShmAllocation(#[from] std::io::Error),

    /// Every tranche candidate and the shared-memory fallback failed.
    #[error("no allocation path succeeded for the request")]
    Exhausted,
}

/// Errors produced while parsing dmabuf-feedback events.
#[derive(Error, Debug)]
pub enum FeedbackError {
    /// The format/modifier table had a malformed wire layout.
    #[error("malformed format table: {0}")]
    MalformedTable(String),
}

/// Errors that can occur when creating a rendering back-end.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Failed to create the wgpu or Vulkan instance
    #[error("failed to create instance: {0}")]
    InstanceCreation(String),

    /// Failed to create a wgpu adapter
    #[error("failed to create adapter: {0}")]
    AdapterCreation(String),

    /// Failed to create the logical device
    #[error("failed to create device: {0}")]
    DeviceCreation(String),

    /// No device exposes a required extension. Fatal by design: a render
    /// context without external-memory import cannot present shared buffers.
    #[error("missing required Vulkan extension: {0}")]
    MissingExtension(String),

    /// Failed to access raw Vulkan handles via as_hal
    #[error("failed to access raw Vulkan handles: {0}")]
    HalAccess(String),
}

/// Errors that can occur when importing a buffer for display.
#[derive(Error, Debug)]
pub enum ImportError {
    /// The buffer's format is not supported by the back-end
    #[error("unsupported buffer format: {0:?}")]
    UnsupportedFormat(drm_fourcc::DrmFourcc),

    /// The buffer's modifier is not supported
    #[error("unsupported modifier: {0:#x}")]
    UnsupportedModifier(u64),

    /// Failed to import the dmabuf file descriptor
    #[error("failed to import dmabuf fd: {0}")]
    FdImport(String),

    /// Failed to create a GPU image from the buffer
    #[error("failed to create image: {0}")]
    ImageCreation(String),

    /// Failed to allocate or bind memory for the imported image
    #[error("memory import failed: {0}")]
    MemoryImport(String),

    /// The buffer has an invalid plane configuration
    #[error("invalid plane configuration: {0}")]
    InvalidPlanes(String),

    /// Buffer dimensions are invalid or unsupported
    #[error("invalid buffer dimensions: {width}x{height}")]
    InvalidDimensions {
        /// Buffer width in pixels
        width: u32,
        /// Buffer height in pixels
        height: u32,
    },

    /// The rendering back-end is not available
    #[error("rendering back-end unavailable")]
    BridgeUnavailable,

    /// Failed to read the shared-memory buffer contents
    #[error("shm buffer access failed: {0}")]
    ShmAccess(String),
}
