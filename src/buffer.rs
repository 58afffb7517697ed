//! Buffer requests and the two concrete buffer variants.
//!
//! A [`Buffer`] is either GPU-backed ([`DmaBuffer`], allocated through gbm
//! and exported as dmabuf file descriptors) or shared-memory-backed
//! ([`ShmBuffer`], a memfd mapping). The variant set is closed, so the crate
//! dispatches over a plain enum instead of trait objects.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use drm_fourcc::{DrmFourcc, DrmModifier};
use memmap2::MmapMut;

use crate::device::DeviceHandle;
use crate::formats;

/// Rotation/flip applied by the producer of a buffer's contents.
///
/// Matches the eight-way output transform vocabulary of the remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Transform {
    /// No transform
    #[default]
    Normal = 0,
    /// Rotated 90 degrees counter-clockwise
    Rotate90 = 1,
    /// Rotated 180 degrees
    Rotate180 = 2,
    /// Rotated 270 degrees counter-clockwise
    Rotate270 = 3,
    /// Flipped around the vertical axis
    Flipped = 4,
    /// Flipped, then rotated 90 degrees
    Flipped90 = 5,
    /// Flipped, then rotated 180 degrees
    Flipped180 = 6,
    /// Flipped, then rotated 270 degrees
    Flipped270 = 7,
}

impl Transform {
    /// Whether this transform swaps the buffer's width and height.
    pub fn swaps_dimensions(self) -> bool {
        matches!(
            self,
            Transform::Rotate90
                | Transform::Rotate270
                | Transform::Flipped90
                | Transform::Flipped270
        )
    }

    fn from_raw(raw: u8) -> Transform {
        match raw {
            1 => Transform::Rotate90,
            2 => Transform::Rotate180,
            3 => Transform::Rotate270,
            4 => Transform::Flipped,
            5 => Transform::Flipped90,
            6 => Transform::Flipped180,
            7 => Transform::Flipped270,
            _ => Transform::Normal,
        }
    }
}

/// Transform storage shared between the producing and rendering threads.
///
/// The producer stores the transform before the swapchain flip; the render
/// thread reads it afterwards. Relaxed ordering suffices because the flip
/// itself is the synchronization point.
#[derive(Debug)]
struct TransformCell(AtomicU8);

impl TransformCell {
    fn new(transform: Transform) -> Self {
        TransformCell(AtomicU8::new(transform as u8))
    }

    fn get(&self) -> Transform {
        Transform::from_raw(self.0.load(Ordering::Relaxed))
    }

    fn set(&self, transform: Transform) {
        self.0.store(transform as u8, Ordering::Relaxed);
    }
}

/// One acceptable GPU format in a [`BufferRequest`].
///
/// An empty modifier list means "any modifier the tranche advertises,
/// implicit layout included".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestedDmaFormat {
    /// DRM fourcc code
    pub fourcc: DrmFourcc,
    /// Acceptable modifiers; empty accepts whatever the tranche offers
    pub modifiers: Vec<DrmModifier>,
}

impl RequestedDmaFormat {
    /// A request entry accepting any advertised modifier for `fourcc`.
    pub fn any_modifier(fourcc: DrmFourcc) -> Self {
        RequestedDmaFormat {
            fourcc,
            modifiers: Vec::new(),
        }
    }
}

/// A value describing one buffer a consumer wants allocated.
///
/// Immutable once issued; the swapchain compares the current back buffer
/// against it to decide whether reallocation is needed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BufferRequest {
    /// Desired width in pixels
    pub width: u32,
    /// Desired height in pixels
    pub height: u32,
    /// Acceptable shared-memory formats, most preferred first
    pub shm_formats: Vec<DrmFourcc>,
    /// Acceptable GPU (format, modifier-set) pairs, most preferred first
    pub dma_formats: Vec<RequestedDmaFormat>,
    /// If set, only tranches for this device are considered
    pub preferred_device: Option<libc::dev_t>,
}

/// Exported descriptors for one memory plane of a GPU buffer.
#[derive(Debug)]
pub struct PlaneDescriptor {
    /// Shareable dmabuf file descriptor for this plane
    pub fd: OwnedFd,
    /// Bytes per row
    pub stride: u32,
    /// Offset of this plane from the start of the memory object
    pub offset: u32,
}

/// A GPU-backed buffer: a gbm buffer object plus its exported dmabuf planes.
///
/// Holds a [`DeviceHandle`] so the owning device stays open for the
/// buffer's whole lifetime; dropping the buffer releases the exported fds,
/// the buffer object, and the device reference, in that order.
#[derive(Debug)]
pub struct DmaBuffer {
    pub(crate) device: DeviceHandle,
    pub(crate) bo: gbm::BufferObject<()>,
    pub(crate) planes: Vec<PlaneDescriptor>,
    pub(crate) fourcc: DrmFourcc,
    pub(crate) modifier: DrmModifier,
    pub(crate) width: u32,
    pub(crate) height: u32,
    transform: TransformCell,
}

impl DmaBuffer {
    pub(crate) fn new(
        device: DeviceHandle,
        bo: gbm::BufferObject<()>,
        planes: Vec<PlaneDescriptor>,
        fourcc: DrmFourcc,
        modifier: DrmModifier,
        width: u32,
        height: u32,
    ) -> Self {
        DmaBuffer {
            device,
            bo,
            planes,
            fourcc,
            modifier,
            width,
            height,
            transform: TransformCell::new(Transform::Normal),
        }
    }

    /// Exported plane descriptors, in plane order.
    pub fn planes(&self) -> &[PlaneDescriptor] {
        &self.planes
    }

    /// The modifier the buffer was actually allocated with.
    pub fn modifier(&self) -> DrmModifier {
        self.modifier
    }

    /// DRM fourcc of the buffer.
    pub fn fourcc(&self) -> DrmFourcc {
        self.fourcc
    }

    /// The device this buffer's memory lives on.
    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }
}

/// A shared-memory buffer: a sealed memfd plus a local mapping.
pub struct ShmBuffer {
    fd: OwnedFd,
    map: Mutex<MmapMut>,
    fourcc: DrmFourcc,
    width: u32,
    height: u32,
    stride: u32,
    transform: TransformCell,
}

impl ShmBuffer {
    pub(crate) fn new(
        fd: OwnedFd,
        map: MmapMut,
        fourcc: DrmFourcc,
        width: u32,
        height: u32,
        stride: u32,
    ) -> Self {
        ShmBuffer {
            fd,
            map: Mutex::new(map),
            fourcc,
            width,
            height,
            stride,
            transform: TransformCell::new(Transform::Normal),
        }
    }

    /// DRM fourcc of the buffer.
    pub fn fourcc(&self) -> DrmFourcc {
        self.fourcc
    }

    /// Buffer width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Buffer height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes per row of the mapping.
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Total size of the mapping in bytes.
    pub fn len(&self) -> usize {
        (self.stride as usize) * (self.height as usize)
    }

    /// Whether the mapping is empty (never true for an allocated buffer).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` over the mapped contents.
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.map.lock().unwrap_or_else(|p| p.into_inner());
        f(&guard)
    }

    /// Run `f` over the mapped contents with write access.
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.map.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }
}

impl AsFd for ShmBuffer {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl std::fmt::Debug for ShmBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmBuffer")
            .field("fourcc", &self.fourcc)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .finish()
    }
}

/// A frame buffer, GPU-backed or shared-memory-backed.
#[derive(Debug)]
pub enum Buffer {
    /// GPU memory exported as dmabuf file descriptors
    Dma(DmaBuffer),
    /// memfd-backed shared memory
    Shm(ShmBuffer),
}

impl Buffer {
    /// Buffer width in pixels.
    pub fn width(&self) -> u32 {
        match self {
            Buffer::Dma(b) => b.width,
            Buffer::Shm(b) => b.width,
        }
    }

    /// Buffer height in pixels.
    pub fn height(&self) -> u32 {
        match self {
            Buffer::Dma(b) => b.height,
            Buffer::Shm(b) => b.height,
        }
    }

    /// Size as a (width, height) pair.
    pub fn size(&self) -> (u32, u32) {
        (self.width(), self.height())
    }

    /// DRM fourcc of the buffer.
    pub fn fourcc(&self) -> DrmFourcc {
        match self {
            Buffer::Dma(b) => b.fourcc,
            Buffer::Shm(b) => b.fourcc,
        }
    }

    /// Transform reported by the producer of the current contents.
    pub fn transform(&self) -> Transform {
        match self {
            Buffer::Dma(b) => b.transform.get(),
            Buffer::Shm(b) => b.transform.get(),
        }
    }

    /// Record the transform the producer applied to the current contents.
    ///
    /// Must happen before the frame is flipped to the front slot.
    pub fn set_transform(&self, transform: Transform) {
        match self {
            Buffer::Dma(b) => b.transform.set(transform),
            Buffer::Shm(b) => b.transform.set(transform),
        }
    }

    /// The GPU-backed variant, if this is one.
    pub fn as_dma(&self) -> Option<&DmaBuffer> {
        match self {
            Buffer::Dma(b) => Some(b),
            Buffer::Shm(_) => None,
        }
    }

    /// The shared-memory variant, if this is one.
    pub fn as_shm(&self) -> Option<&ShmBuffer> {
        match self {
            Buffer::Shm(b) => Some(b),
            Buffer::Dma(_) => None,
        }
    }

    /// Whether this buffer can satisfy `request` without reallocation.
    ///
    /// True when the size matches exactly and the buffer's format (and, for
    /// GPU buffers, its modifier) appears in the request's acceptable set.
    pub fn is_compatible(&self, request: &BufferRequest) -> bool {
        if self.width() != request.width || self.height() != request.height {
            return false;
        }
        match self {
            Buffer::Shm(b) => request.shm_formats.contains(&b.fourcc),
            Buffer::Dma(b) => request.dma_formats.iter().any(|entry| {
                if entry.fourcc != b.fourcc {
                    return false;
                }
                // An empty modifier list accepts any layout.
                entry.modifiers.is_empty()
                    || entry.modifiers.contains(&b.modifier)
                    || (formats::is_implicit(b.modifier)
                        && entry
                            .modifiers
                            .iter()
                            .any(|m| formats::is_implicit(*m)))
            }),
        }
    }
}
