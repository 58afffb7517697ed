//! # lamco-swapchain
//!
//! GPU buffer negotiation, allocation and double buffering for a desktop
//! shell that receives frames from remote producers.
//!
//! ## Architecture
//!
//! The crate is organized as a pipeline from format negotiation to display:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        FEEDBACK / NEGOTIATION                       │
//! │       (format table, tranches, device preferences from peer)        │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                     │
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            ALLOCATION                               │
//! │      (DRM render nodes via gbm, memfd shared-memory fallback)       │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                     │
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                      SWAPCHAIN + TEXTURE IMPORT                     │
//! │      (double buffering, zero-copy import into wgpu or Vulkan)       │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`feedback::FormatNegotiator`] ingests dmabuf-feedback events and
//! publishes tranches atomically. [`allocator::BufferManager`] turns a
//! [`buffer::BufferRequest`] into a GPU buffer on the right device, falling
//! back to shared memory when no GPU path works. [`swapchain::Swapchain`]
//! double-buffers between the producing side and a renderer, and the two
//! bridge modules import the front buffer for compositing: zero-copy
//! through [`wgpu_bridge::WgpuBridge`], or as raw external-memory images
//! through [`vulkan_bridge::VulkanBridge`].

pub mod allocator;
pub mod buffer;
pub mod device;
pub mod error;
pub mod feedback;
pub mod formats;
pub mod geometry;
pub mod swapchain;
pub mod vulkan_bridge;
pub mod wgpu_bridge;

pub use allocator::{AllocatorOptions, BufferManager};
pub use buffer::{Buffer, BufferRequest, DmaBuffer, RequestedDmaFormat, ShmBuffer, Transform};
pub use device::{DeviceHandle, DeviceRegistry};
pub use error::{AllocError, BridgeError, FeedbackError, ImportError};
pub use feedback::{FormatNegotiator, Tranche, TrancheFormat};
pub use geometry::{present_rect, Rect};
pub use swapchain::Swapchain;
pub use vulkan_bridge::{SlotImage, VulkanBridge, VulkanImage};
pub use wgpu_bridge::{SlotTexture, WgpuBridge, WgpuTexture};
