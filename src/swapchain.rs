//! Double buffering between a producer and a presenting consumer.
//!
//! A [`Swapchain`] holds at most two buffers. The *back* buffer is the only
//! one ever replaced or filled; the *front* buffer is what a renderer may
//! currently be reading. [`Swapchain::swap`] flips the labels atomically
//! from the renderer's point of view: it only ever observes the result of a
//! completed flip, because the front slot is the single point of truth it
//! reads from.

use std::sync::Arc;

use tracing::trace;

use crate::allocator::BufferManager;
use crate::buffer::{Buffer, BufferRequest};
use crate::error::AllocError;

/// Two-slot buffer holder for one consumer.
///
/// Dropping the swapchain drops both buffers, releasing their exported
/// handles and device references.
#[derive(Default)]
pub struct Swapchain {
    slots: [Option<Arc<Buffer>>; 2],
    back: usize,
    /// False until the first swap; `frontbuffer` is empty before that.
    presented: bool,
}

impl Swapchain {
    /// Create an empty swapchain.
    pub fn new() -> Self {
        Swapchain::default()
    }

    /// Return the current back buffer, allocating or replacing it if the
    /// existing one cannot satisfy `request`.
    ///
    /// The boolean is `true` when the returned buffer was newly allocated,
    /// which tells the caller any cached import of the old buffer is stale.
    /// On allocation failure the back slot is left empty and the error
    /// propagates; the caller must skip this frame rather than swap.
    pub fn get_backbuffer(
        &mut self,
        request: &BufferRequest,
        manager: &mut BufferManager,
    ) -> Result<(Arc<Buffer>, bool), AllocError> {
        if let Some(existing) = &self.slots[self.back] {
            if existing.is_compatible(request) {
                return Ok((existing.clone(), false));
            }
            trace!(
                old_size = ?existing.size(),
                new_size = ?(request.width, request.height),
                "back buffer incompatible with request, reallocating"
            );
        }

        self.slots[self.back] = None;
        let buffer = Arc::new(manager.allocate(request)?);
        self.slots[self.back] = Some(buffer.clone());
        Ok((buffer, true))
    }

    /// Flip the front/back labels.
    ///
    /// Callers must only do this after the back buffer's contents are
    /// final; the swapchain itself does not track producer completion.
    pub fn swap(&mut self) {
        self.back = 1 - self.back;
        self.presented = true;
    }

    /// The buffer most recently passed to [`swap`](Swapchain::swap), or
    /// `None` before the first swap.
    pub fn frontbuffer(&self) -> Option<Arc<Buffer>> {
        if !self.presented {
            return None;
        }
        self.slots[1 - self.back].clone()
    }
}

impl std::fmt::Debug for Swapchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swapchain")
            .field("back", &self.back)
            .field("presented", &self.presented)
            .field("slot_a", &self.slots[0].is_some())
            .field("slot_b", &self.slots[1].is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::AllocatorOptions;
    use drm_fourcc::DrmFourcc;

    fn shm_request(width: u32, height: u32) -> BufferRequest {
        BufferRequest {
            width,
            height,
            shm_formats: vec![DrmFourcc::Xrgb8888],
            ..Default::default()
        }
    }

    fn manager() -> BufferManager {
        BufferManager::new(AllocatorOptions::default())
    }

    #[test]
    fn test_backbuffer_reused_without_swap() {
        let mut manager = manager();
        let mut swapchain = Swapchain::new();
        let request = shm_request(100, 100);

        let (first, is_new) = swapchain.get_backbuffer(&request, &mut manager).expect("alloc");
        assert!(is_new);
        let (second, is_new) = swapchain.get_backbuffer(&request, &mut manager).expect("alloc");
        assert!(!is_new);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_size_change_replaces_backbuffer() {
        let mut manager = manager();
        let mut swapchain = Swapchain::new();

        let (first, _) = swapchain
            .get_backbuffer(&shm_request(100, 100), &mut manager)
            .expect("alloc");
        let (second, is_new) = swapchain
            .get_backbuffer(&shm_request(200, 100), &mut manager)
            .expect("alloc");
        assert!(is_new);
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.size(), (200, 100));
    }

    #[test]
    fn test_frontbuffer_empty_before_first_swap() {
        let mut manager = manager();
        let mut swapchain = Swapchain::new();
        assert!(swapchain.frontbuffer().is_none());

        let (back, _) = swapchain
            .get_backbuffer(&shm_request(10, 10), &mut manager)
            .expect("alloc");
        assert!(swapchain.frontbuffer().is_none());

        swapchain.swap();
        let front = swapchain.frontbuffer().expect("front after swap");
        assert!(Arc::ptr_eq(&back, &front));
    }

    #[test]
    fn test_swap_alternates_slots() {
        let mut manager = manager();
        let mut swapchain = Swapchain::new();
        let request = shm_request(20, 20);

        let (a, _) = swapchain.get_backbuffer(&request, &mut manager).expect("alloc");
        swapchain.swap();
        let (b, is_new) = swapchain.get_backbuffer(&request, &mut manager).expect("alloc");
        assert!(is_new, "other slot starts empty");
        assert!(!Arc::ptr_eq(&a, &b));
        swapchain.swap();

        // Front is now b; a is back again and still compatible.
        let front = swapchain.frontbuffer().expect("front");
        assert!(Arc::ptr_eq(&front, &b));
        let (back_again, is_new) = swapchain.get_backbuffer(&request, &mut manager).expect("alloc");
        assert!(!is_new);
        assert!(Arc::ptr_eq(&back_again, &a));
    }

    #[test]
    fn test_failed_allocation_leaves_slot_empty() {
        let mut manager = manager();
        let mut swapchain = Swapchain::new();

        // Fill the back slot, then issue a request no path can satisfy.
        swapchain
            .get_backbuffer(&shm_request(10, 10), &mut manager)
            .expect("alloc");
        let impossible = BufferRequest {
            width: 10,
            height: 10,
            shm_formats: vec![DrmFourcc::Yuv420],
            ..Default::default()
        };
        assert!(swapchain.get_backbuffer(&impossible, &mut manager).is_err());

        // The old buffer is gone; a retry with a valid request allocates anew.
        let (_, is_new) = swapchain
            .get_backbuffer(&shm_request(10, 10), &mut manager)
            .expect("alloc");
        assert!(is_new);
    }
}
