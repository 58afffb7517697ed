//! End-to-end frame loop without GPU hardware.
//!
//! Exercises the public API the way a session does: feedback events feed the
//! negotiator, requests go through the manager, the swapchain double-buffers
//! the results. Everything here runs on the shared-memory path so it works
//! in CI containers with no DRM nodes.

use std::sync::Arc;

use drm_fourcc::{DrmFourcc, DrmModifier};
use lamco_swapchain::{
    present_rect, AllocatorOptions, BufferManager, BufferRequest, Rect, RequestedDmaFormat,
    Swapchain, Transform,
};

/// A dev_t that is structurally a render node but never exists on disk, so
/// GPU allocation fails over to shared memory deterministically.
fn bogus_render_device() -> libc::dev_t {
    libc::makedev(226, 250)
}

fn feed_negotiation(manager: &mut BufferManager) {
    const MODIFIER: u64 = 0x0100_0000_0000_0001;
    let negotiator = manager.negotiator_mut();
    negotiator.handle_format_table([
        (DrmFourcc::Xrgb8888 as u32, MODIFIER),
        (DrmFourcc::Argb8888 as u32, MODIFIER),
    ]);
    negotiator.handle_main_device(bogus_render_device());
    negotiator.handle_tranche_target_device(bogus_render_device());
    negotiator.handle_tranche_formats(&[0, 1]);
    negotiator.handle_tranche_done();
    assert!(negotiator.handle_done());
}

fn request(width: u32, height: u32) -> BufferRequest {
    BufferRequest {
        width,
        height,
        shm_formats: vec![DrmFourcc::Xrgb8888],
        dma_formats: vec![RequestedDmaFormat {
            fourcc: DrmFourcc::Xrgb8888,
            modifiers: vec![DrmModifier::from(0x0100_0000_0000_0001u64)],
        }],
        ..Default::default()
    }
}

#[test]
fn negotiated_session_falls_back_to_shm_when_device_is_gone() {
    let mut manager = BufferManager::new(AllocatorOptions::default());
    feed_negotiation(&mut manager);
    assert!(manager.gpu_available());

    let buffer = manager.allocate(&request(640, 480)).expect("allocation");
    assert!(
        buffer.as_shm().is_some(),
        "unopenable device must fall back to shared memory"
    );
    assert_eq!(buffer.size(), (640, 480));
}

#[test]
fn frame_loop_reuses_and_flips_buffers() {
    let mut manager = BufferManager::new(AllocatorOptions::default());
    feed_negotiation(&mut manager);
    let mut swapchain = Swapchain::new();
    let req = request(320, 240);

    // Frame 1: fill, flip, present.
    let (back, is_new) = swapchain.get_backbuffer(&req, &mut manager).expect("alloc");
    assert!(is_new);
    back.as_shm().expect("shm").write(|data| data[0] = 0x11);
    back.set_transform(Transform::Normal);
    swapchain.swap();
    let front = swapchain.frontbuffer().expect("front after swap");
    assert!(Arc::ptr_eq(&back, &front));

    // Frame 2: the other slot fills while frame 1 stays presentable.
    let (back2, is_new) = swapchain.get_backbuffer(&req, &mut manager).expect("alloc");
    assert!(is_new);
    assert!(!Arc::ptr_eq(&back2, &front));
    back2.as_shm().expect("shm").write(|data| data[0] = 0x22);
    swapchain.swap();

    // Frame 3: slot A comes back around unchanged.
    let (back3, is_new) = swapchain.get_backbuffer(&req, &mut manager).expect("alloc");
    assert!(!is_new);
    assert!(Arc::ptr_eq(&back3, &back));
    assert_eq!(back3.as_shm().expect("shm").read(|data| data[0]), 0x11);
}

#[test]
fn resize_mid_session_replaces_only_touched_slots() {
    let mut manager = BufferManager::new(AllocatorOptions::default());
    let mut swapchain = Swapchain::new();

    let (small, _) = swapchain
        .get_backbuffer(&request(100, 100), &mut manager)
        .expect("alloc");
    swapchain.swap();

    // The resize reallocates the current back slot; the front buffer keeps
    // the old size until its slot is written to again.
    let (large, is_new) = swapchain
        .get_backbuffer(&request(200, 200), &mut manager)
        .expect("alloc");
    assert!(is_new);
    assert_eq!(large.size(), (200, 200));
    assert_eq!(
        swapchain.frontbuffer().expect("front").size(),
        (100, 100)
    );
    drop(small);
}

#[test]
fn transform_flows_from_producer_to_presentation() {
    let mut manager = BufferManager::new(AllocatorOptions::default());
    let mut swapchain = Swapchain::new();

    let (back, _) = swapchain
        .get_backbuffer(&request(200, 100), &mut manager)
        .expect("alloc");
    back.set_transform(Transform::Rotate90);
    swapchain.swap();

    let front = swapchain.frontbuffer().expect("front");
    let dest = Rect::new(0.0, 0.0, 400.0, 400.0);
    let rect = present_rect(front.size(), front.transform(), dest);

    // 200x100 rotated is 100x200: pillarboxed to 200x400, centered.
    assert_eq!(rect.width, 200.0);
    assert_eq!(rect.height, 400.0);
    assert_eq!(rect.x, 100.0);
    assert_eq!(rect.y, 0.0);
}
