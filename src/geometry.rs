//! Presentation geometry.
//!
//! Pure functions deriving where a buffer's contents land inside a
//! destination rectangle: transform-aware, aspect-fit, centered. No state
//! lives here so the render thread can call in without coordination.

use crate::buffer::Transform;

/// An axis-aligned rectangle in destination coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    /// Left edge
    pub x: f32,
    /// Top edge
    pub y: f32,
    /// Width
    pub width: f32,
    /// Height
    pub height: f32,
}

impl Rect {
    /// Construct a rectangle.
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Rect {
            x,
            y,
            width,
            height,
        }
    }
}

/// Compute the rectangle a buffer should be presented into.
///
/// The buffer's effective size is its pixel size with width/height swapped
/// for 90/270-degree transforms; the result is that size scaled to fit
/// `dest` without changing aspect ratio, centered inside it. Degenerate
/// buffer or destination sizes yield an empty rectangle at the
/// destination's origin.
pub fn present_rect(buffer_size: (u32, u32), transform: Transform, dest: Rect) -> Rect {
    let (mut src_w, mut src_h) = (buffer_size.0 as f32, buffer_size.1 as f32);
    if transform.swaps_dimensions() {
        std::mem::swap(&mut src_w, &mut src_h);
    }

    if src_w <= 0.0 || src_h <= 0.0 || dest.width <= 0.0 || dest.height <= 0.0 {
        return Rect::new(dest.x, dest.y, 0.0, 0.0);
    }

    let scale = (dest.width / src_w).min(dest.height / src_h);
    let width = src_w * scale;
    let height = src_h * scale;
    Rect::new(
        dest.x + (dest.width - width) / 2.0,
        dest.y + (dest.height - height) / 2.0,
        width,
        height,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_fit_fills_destination() {
        let dest = Rect::new(0.0, 0.0, 200.0, 100.0);
        let rect = present_rect((200, 100), Transform::Normal, dest);
        assert_eq!(rect, dest);
    }

    #[test]
    fn test_wide_buffer_letterboxes_vertically() {
        let dest = Rect::new(0.0, 0.0, 100.0, 100.0);
        let rect = present_rect((200, 100), Transform::Normal, dest);
        assert_eq!(rect.width, 100.0);
        assert_eq!(rect.height, 50.0);
        assert_eq!(rect.x, 0.0);
        assert_eq!(rect.y, 25.0);
    }

    #[test]
    fn test_rotation_swaps_aspect() {
        let dest = Rect::new(0.0, 0.0, 100.0, 100.0);
        let rect = present_rect((200, 100), Transform::Rotate90, dest);
        // Effective source is 100x200: pillarboxed horizontally.
        assert_eq!(rect.width, 50.0);
        assert_eq!(rect.height, 100.0);
        assert_eq!(rect.x, 25.0);
        assert_eq!(rect.y, 0.0);
    }

    #[test]
    fn test_flip_without_rotation_keeps_aspect() {
        let dest = Rect::new(0.0, 0.0, 100.0, 100.0);
        let normal = present_rect((200, 100), Transform::Normal, dest);
        let flipped = present_rect((200, 100), Transform::Flipped, dest);
        assert_eq!(normal, flipped);
    }

    #[test]
    fn test_offset_destination_centers_within_it() {
        let dest = Rect::new(10.0, 20.0, 100.0, 100.0);
        let rect = present_rect((100, 50), Transform::Normal, dest);
        assert_eq!(rect.x, 10.0);
        assert_eq!(rect.y, 20.0 + 25.0);
    }

    #[test]
    fn test_degenerate_sizes_yield_empty_rect() {
        let dest = Rect::new(5.0, 5.0, 100.0, 100.0);
        let rect = present_rect((0, 100), Transform::Normal, dest);
        assert_eq!(rect.width, 0.0);
        assert_eq!(rect.height, 0.0);
        assert_eq!(rect.x, 5.0);
    }
}
