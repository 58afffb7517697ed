//! Pixel format vocabulary shared by negotiation, allocation and import.
//!
//! Formats are identified by DRM fourcc codes throughout the crate; this
//! module holds the mappings into the two rendering back-ends and the small
//! amount of per-format metadata the allocator needs.

use ash::vk;
use drm_fourcc::{DrmFourcc, DrmModifier};

/// The single-plane opaque 32-bit format, preferred for UI surfaces.
pub const OPAQUE_32: DrmFourcc = DrmFourcc::Xrgb8888;

/// The 32-bit format with alpha, second in tranche preference order.
pub const ALPHA_32: DrmFourcc = DrmFourcc::Argb8888;

/// Raw value of `DRM_FORMAT_MOD_INVALID`, meaning "implicit/driver-chosen
/// layout" in feedback tables.
pub const MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;

/// Returns whether a modifier value means "implicit layout".
pub fn is_implicit(modifier: DrmModifier) -> bool {
    u64::from(modifier) == MOD_INVALID
}

/// Bytes per pixel for the single-plane formats this crate allocates.
///
/// Returns `None` for formats the allocator does not understand; such
/// formats can still ride through negotiation, they just cannot back a
/// shared-memory buffer.
pub fn bytes_per_pixel(fourcc: DrmFourcc) -> Option<u32> {
    match fourcc {
        DrmFourcc::Argb8888
        | DrmFourcc::Xrgb8888
        | DrmFourcc::Abgr8888
        | DrmFourcc::Xbgr8888
        | DrmFourcc::Argb2101010
        | DrmFourcc::Xrgb2101010 => Some(4),
        DrmFourcc::Rg88 | DrmFourcc::Gr88 => Some(2),
        DrmFourcc::R8 => Some(1),
        _ => None,
    }
}

/// Map a DRM fourcc to the wgpu texture format used for import.
pub fn fourcc_to_wgpu(fourcc: DrmFourcc) -> Option<wgpu::TextureFormat> {
    match fourcc {
        DrmFourcc::Argb8888 | DrmFourcc::Xrgb8888 => Some(wgpu::TextureFormat::Bgra8Unorm),
        DrmFourcc::Abgr8888 | DrmFourcc::Xbgr8888 => Some(wgpu::TextureFormat::Rgba8Unorm),
        DrmFourcc::Abgr2101010 | DrmFourcc::Xbgr2101010 => {
            Some(wgpu::TextureFormat::Rgb10a2Unorm)
        }
        DrmFourcc::R8 => Some(wgpu::TextureFormat::R8Unorm),
        DrmFourcc::Rg88 => Some(wgpu::TextureFormat::Rg8Unorm),
        _ => None,
    }
}

/// Map a DRM fourcc to the Vulkan format used by the explicit-image back-end.
pub fn fourcc_to_vk(fourcc: DrmFourcc) -> Option<vk::Format> {
    match fourcc {
        DrmFourcc::Argb8888 | DrmFourcc::Xrgb8888 => Some(vk::Format::B8G8R8A8_UNORM),
        DrmFourcc::Abgr8888 | DrmFourcc::Xbgr8888 => Some(vk::Format::R8G8B8A8_UNORM),
        DrmFourcc::Abgr2101010 | DrmFourcc::Xbgr2101010 => {
            Some(vk::Format::A2B10G10R10_UNORM_PACK32)
        }
        DrmFourcc::R8 => Some(vk::Format::R8_UNORM),
        DrmFourcc::Rg88 => Some(vk::Format::R8G8_UNORM),
        _ => None,
    }
}
