//! Buffer allocation: GPU path through gbm, shared-memory fallback.
//!
//! [`BufferManager`] is the process-wide context object for this subsystem:
//! it owns the device registry and the format negotiator and is constructed
//! once at session start, then passed by reference to every consumer. There
//! is deliberately no global state; dropping the manager releases every
//! device that no live buffer still references.

use std::ffi::CString;
use std::fs::File;
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};

use drm_fourcc::{DrmFourcc, DrmModifier};
use gbm::BufferObjectFlags;
use memmap2::MmapOptions;
use tracing::{debug, trace, warn};

use crate::buffer::{Buffer, BufferRequest, DmaBuffer, PlaneDescriptor, ShmBuffer};
use crate::device::{DeviceHandle, DeviceRegistry};
use crate::error::AllocError;
use crate::feedback::{FormatNegotiator, Tranche, TrancheFormat};
use crate::formats;

/// Environment variable that administratively disables GPU-backed
/// allocation; every request then takes the shared-memory path.
pub const NO_DMABUF_ENV: &str = "LAMCO_NO_DMABUF";

/// Construction options for [`BufferManager`].
#[derive(Debug, Clone)]
pub struct AllocatorOptions {
    /// Whether GPU-backed allocation is attempted at all.
    pub dmabuf_enabled: bool,
}

impl Default for AllocatorOptions {
    fn default() -> Self {
        AllocatorOptions {
            dmabuf_enabled: true,
        }
    }
}

impl AllocatorOptions {
    /// Options honoring the [`NO_DMABUF_ENV`] kill switch.
    pub fn from_env() -> Self {
        let disabled = std::env::var_os(NO_DMABUF_ENV).is_some_and(|v| v != "0");
        if disabled {
            debug!("GPU-backed allocation disabled by {NO_DMABUF_ENV}");
        }
        AllocatorOptions {
            dmabuf_enabled: !disabled,
        }
    }
}

/// One concrete (format, modifier-set) allocation candidate, produced by
/// intersecting a request with a tranche.
#[derive(Debug)]
struct Candidate {
    fourcc: DrmFourcc,
    /// Explicit modifiers to request; empty means implicit/driver-chosen.
    modifiers: Vec<DrmModifier>,
}

/// Owns negotiation state and allocates buffers for requests.
pub struct BufferManager {
    registry: DeviceRegistry,
    negotiator: FormatNegotiator,
    dmabuf_enabled: bool,
}

impl BufferManager {
    /// Create a manager for one session with the remote peer.
    pub fn new(options: AllocatorOptions) -> Self {
        BufferManager {
            registry: DeviceRegistry::new(),
            negotiator: FormatNegotiator::new(),
            dmabuf_enabled: options.dmabuf_enabled,
        }
    }

    /// The negotiator, for feeding feedback events into.
    pub fn negotiator_mut(&mut self) -> &mut FormatNegotiator {
        &mut self.negotiator
    }

    /// Read access to the negotiator.
    pub fn negotiator(&self) -> &FormatNegotiator {
        &self.negotiator
    }

    /// The device registry (exposed mainly for tests and introspection).
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Whether GPU-backed allocation is currently possible.
    pub fn gpu_available(&self) -> bool {
        self.dmabuf_enabled && self.negotiator.is_ready()
    }

    /// Allocate a buffer satisfying `request`.
    ///
    /// Tranches are walked in the peer's preference order; within each
    /// tranche, the intersection of requested and advertised
    /// (format, modifier) pairs is tried pair by pair. When every GPU
    /// candidate fails — or GPU allocation is disabled or not yet
    /// negotiated — the first shared-memory format in the request backs a
    /// memfd buffer instead. Only total exhaustion is an error.
    pub fn allocate(&mut self, request: &BufferRequest) -> Result<Buffer, AllocError> {
        if request.width == 0 || request.height == 0 {
            return Err(AllocError::InvalidRequest {
                width: request.width,
                height: request.height,
            });
        }

        if self.dmabuf_enabled && !request.dma_formats.is_empty() {
            if let Some(buffer) = self.allocate_dma(request) {
                return Ok(buffer);
            }
        }

        let fourcc = request
            .shm_formats
            .first()
            .copied()
            .ok_or(AllocError::Exhausted)?;
        let shm = allocate_shm(request.width, request.height, fourcc)?;
        debug!(
            width = request.width,
            height = request.height,
            ?fourcc,
            "allocated shared-memory buffer"
        );
        Ok(Buffer::Shm(shm))
    }

    fn allocate_dma(&mut self, request: &BufferRequest) -> Option<Buffer> {
        // The negotiator only publishes complete tranche sets, so iterating
        // here never observes a half-received cycle.
        let tranches: Vec<Tranche> = self
            .negotiator
            .best_tranches(request.preferred_device)
            .cloned()
            .collect();

        for tranche in &tranches {
            let candidates = intersect_tranche(request, tranche);
            if candidates.is_empty() {
                trace!(device = tranche.device, "tranche has no usable candidates");
                continue;
            }

            let device = match self.registry.get_or_open(tranche.device) {
                Ok(device) => device,
                Err(e) => {
                    warn!(device = tranche.device, error = %e, "skipping tranche");
                    continue;
                }
            };

            for candidate in candidates {
                match allocate_bo(&device, request, &candidate, tranche.scanout) {
                    Ok(buffer) => {
                        debug!(
                            width = request.width,
                            height = request.height,
                            fourcc = ?candidate.fourcc,
                            modifier = ?buffer.modifier(),
                            node = %device.node_path().display(),
                            "allocated GPU buffer"
                        );
                        return Some(Buffer::Dma(buffer));
                    }
                    Err(e) => {
                        trace!(fourcc = ?candidate.fourcc, error = %e, "candidate failed");
                    }
                }
            }
        }
        None
    }
}

/// Intersect a request's acceptable pairs with a tranche's advertised ones.
///
/// Tranche preference order is kept. A request entry with explicit
/// modifiers keeps only modifiers both sides know; one without modifiers
/// accepts the tranche's advertisement as-is. Formats advertised with
/// neither explicit modifiers nor implicit support are skipped.
fn intersect_tranche(request: &BufferRequest, tranche: &Tranche) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    for advertised in &tranche.formats {
        if !advertised.is_allocatable() {
            continue;
        }
        let Some(requested) = request
            .dma_formats
            .iter()
            .find(|r| r.fourcc == advertised.fourcc)
        else {
            continue;
        };

        if requested.modifiers.is_empty() {
            candidates.push(Candidate {
                fourcc: advertised.fourcc,
                modifiers: advertised.modifiers.clone(),
            });
            continue;
        }

        let shared: Vec<DrmModifier> = advertised
            .modifiers
            .iter()
            .filter(|m| requested.modifiers.contains(m))
            .copied()
            .collect();
        let implicit_ok = advertised.implicit
            && requested.modifiers.iter().any(|m| formats::is_implicit(*m));

        if !shared.is_empty() {
            candidates.push(Candidate {
                fourcc: advertised.fourcc,
                modifiers: shared,
            });
        } else if implicit_ok {
            candidates.push(Candidate {
                fourcc: advertised.fourcc,
                modifiers: Vec::new(),
            });
        }
    }
    candidates
}

/// Allocate one gbm buffer object and export its planes.
fn allocate_bo(
    device: &DeviceHandle,
    request: &BufferRequest,
    candidate: &Candidate,
    scanout: bool,
) -> Result<DmaBuffer, AllocError> {
    let mut usage = BufferObjectFlags::RENDERING;
    if scanout {
        usage |= BufferObjectFlags::SCANOUT;
    }

    let bo = if candidate.modifiers.is_empty() {
        device.gbm().create_buffer_object::<()>(
            request.width,
            request.height,
            candidate.fourcc,
            usage,
        )
    } else {
        device.gbm().create_buffer_object_with_modifiers2::<()>(
            request.width,
            request.height,
            candidate.fourcc,
            candidate.modifiers.iter().copied(),
            usage,
        )
    }
    .map_err(|e| AllocError::AllocationFailed {
        fourcc: candidate.fourcc,
        source: e,
    })?;

    let plane_count = bo.plane_count();
    let mut planes = Vec::with_capacity(plane_count as usize);
    for plane in 0..plane_count as i32 {
        // A bo that cannot be exported is useless here; destroy it and let
        // the caller move on to the next candidate.
        let fd = bo
            .fd_for_plane(plane)
            .map_err(|e| AllocError::ExportFailed(format!("plane {plane}: {e}")))?;
        planes.push(PlaneDescriptor {
            fd,
            stride: bo.stride_for_plane(plane),
            offset: bo.offset(plane),
        });
    }

    let modifier = bo.modifier();
    Ok(DmaBuffer::new(
        device.clone(),
        bo,
        planes,
        candidate.fourcc,
        modifier,
        request.width,
        request.height,
    ))
}

/// Allocate a memfd-backed shared-memory buffer.
pub(crate) fn allocate_shm(
    width: u32,
    height: u32,
    fourcc: DrmFourcc,
) -> Result<ShmBuffer, AllocError> {
    let bpp = formats::bytes_per_pixel(fourcc).ok_or_else(|| {
        AllocError::ShmAllocation(std::io::Error::other(format!(
            "no byte layout known for {fourcc:?}"
        )))
    })?;
    let stride = width * bpp;
    let size = stride as u64 * height as u64;

    let name = CString::new("lamco-swapchain").map_err(|e| {
        AllocError::ShmAllocation(std::io::Error::other(e))
    })?;
    // SAFETY: name is a valid NUL-terminated string; memfd_create has no
    // other preconditions.
    let raw_fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if raw_fd < 0 {
        return Err(AllocError::ShmAllocation(std::io::Error::last_os_error()));
    }
    // SAFETY: raw_fd was just returned by memfd_create and is owned here.
    let file = unsafe { File::from_raw_fd(raw_fd) };
    file.set_len(size)?;

    // SAFETY: the mapping covers exactly the region ftruncate created and
    // the fd stays open (moved into the ShmBuffer) for the mapping's
    // lifetime.
    let map = unsafe { MmapOptions::new().len(size as usize).map_mut(&file)? };

    // SAFETY: into_raw_fd transfers ownership of the same descriptor.
    let fd = unsafe { OwnedFd::from_raw_fd(file.into_raw_fd()) };
    Ok(ShmBuffer::new(fd, map, fourcc, width, height, stride))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::RequestedDmaFormat;

    fn tranche(formats_list: Vec<TrancheFormat>) -> Tranche {
        Tranche {
            device: 0xE200,
            scanout: false,
            formats: formats_list,
        }
    }

    fn explicit(fourcc: DrmFourcc, modifiers: &[u64]) -> TrancheFormat {
        TrancheFormat {
            fourcc,
            modifiers: modifiers.iter().map(|&m| DrmModifier::from(m)).collect(),
            implicit: false,
        }
    }

    #[test]
    fn test_zero_sized_request_is_rejected() {
        let mut manager = BufferManager::new(AllocatorOptions::default());
        let request = BufferRequest {
            width: 0,
            height: 100,
            shm_formats: vec![DrmFourcc::Xrgb8888],
            ..Default::default()
        };
        assert!(matches!(
            manager.allocate(&request),
            Err(AllocError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn test_fallback_without_tranches_yields_shm() {
        // No negotiation has happened: the request must still succeed
        // through the shared-memory path.
        let mut manager = BufferManager::new(AllocatorOptions::default());
        let request = BufferRequest {
            width: 100,
            height: 100,
            shm_formats: vec![DrmFourcc::Xrgb8888],
            dma_formats: vec![RequestedDmaFormat::any_modifier(DrmFourcc::Xrgb8888)],
            ..Default::default()
        };
        let buffer = manager.allocate(&request).expect("shm fallback");
        assert_eq!(buffer.size(), (100, 100));
        assert_eq!(buffer.fourcc(), DrmFourcc::Xrgb8888);
        assert!(buffer.as_shm().is_some());
    }

    #[test]
    fn test_gpu_disabled_always_uses_shm() {
        let mut manager = BufferManager::new(AllocatorOptions {
            dmabuf_enabled: false,
        });
        assert!(!manager.gpu_available());
        let request = BufferRequest {
            width: 32,
            height: 16,
            shm_formats: vec![DrmFourcc::Argb8888],
            dma_formats: vec![RequestedDmaFormat::any_modifier(DrmFourcc::Argb8888)],
            ..Default::default()
        };
        let buffer = manager.allocate(&request).expect("shm fallback");
        assert!(buffer.as_shm().is_some());
        assert!(buffer.is_compatible(&request));
    }

    #[test]
    fn test_no_formats_at_all_is_exhausted() {
        let mut manager = BufferManager::new(AllocatorOptions::default());
        let request = BufferRequest {
            width: 10,
            height: 10,
            ..Default::default()
        };
        assert!(matches!(
            manager.allocate(&request),
            Err(AllocError::Exhausted)
        ));
    }

    #[test]
    fn test_intersection_explicit_modifiers() {
        let request = BufferRequest {
            width: 1,
            height: 1,
            dma_formats: vec![RequestedDmaFormat {
                fourcc: DrmFourcc::Xrgb8888,
                modifiers: vec![DrmModifier::from(1u64), DrmModifier::from(2u64)],
            }],
            ..Default::default()
        };
        let t = tranche(vec![explicit(DrmFourcc::Xrgb8888, &[2, 3])]);
        let candidates = intersect_tranche(&request, &t);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].modifiers, vec![DrmModifier::from(2u64)]);
    }

    #[test]
    fn test_intersection_empty_request_modifiers_accepts_all() {
        let request = BufferRequest {
            width: 1,
            height: 1,
            dma_formats: vec![RequestedDmaFormat::any_modifier(DrmFourcc::Xrgb8888)],
            ..Default::default()
        };
        let t = tranche(vec![explicit(DrmFourcc::Xrgb8888, &[5, 6])]);
        let candidates = intersect_tranche(&request, &t);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].modifiers.len(), 2);
    }

    #[test]
    fn test_intersection_skips_unusable_format() {
        let request = BufferRequest {
            width: 1,
            height: 1,
            dma_formats: vec![RequestedDmaFormat::any_modifier(DrmFourcc::Xrgb8888)],
            ..Default::default()
        };
        // Advertised with no modifiers and no implicit support.
        let t = tranche(vec![TrancheFormat {
            fourcc: DrmFourcc::Xrgb8888,
            modifiers: vec![],
            implicit: false,
        }]);
        assert!(intersect_tranche(&request, &t).is_empty());
    }

    #[test]
    fn test_intersection_disjoint_modifiers_is_empty() {
        let request = BufferRequest {
            width: 1,
            height: 1,
            dma_formats: vec![RequestedDmaFormat {
                fourcc: DrmFourcc::Xrgb8888,
                modifiers: vec![DrmModifier::from(1u64)],
            }],
            ..Default::default()
        };
        let t = tranche(vec![explicit(DrmFourcc::Xrgb8888, &[2])]);
        assert!(intersect_tranche(&request, &t).is_empty());
    }

    #[test]
    fn test_intersection_implicit_via_invalid_modifier() {
        let request = BufferRequest {
            width: 1,
            height: 1,
            dma_formats: vec![RequestedDmaFormat {
                fourcc: DrmFourcc::Xrgb8888,
                modifiers: vec![DrmModifier::from(formats::MOD_INVALID)],
            }],
            ..Default::default()
        };
        let t = tranche(vec![TrancheFormat {
            fourcc: DrmFourcc::Xrgb8888,
            modifiers: vec![],
            implicit: true,
        }]);
        let candidates = intersect_tranche(&request, &t);
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].modifiers.is_empty());
    }

    #[test]
    fn test_allocate_twice_stays_compatible() {
        let mut manager = BufferManager::new(AllocatorOptions::default());
        let request = BufferRequest {
            width: 40,
            height: 20,
            shm_formats: vec![DrmFourcc::Xrgb8888],
            ..Default::default()
        };
        let first = manager.allocate(&request).expect("first allocation");
        let second = manager.allocate(&request).expect("second allocation");
        assert!(first.is_compatible(&request));
        assert!(second.is_compatible(&request));
    }

    #[test]
    fn test_shm_stride_and_len() {
        let shm = allocate_shm(10, 4, DrmFourcc::Xrgb8888).expect("allocation");
        assert_eq!(shm.stride(), 40);
        assert_eq!(shm.len(), 160);
    }
}
