use crate::canvas::PixelBuffer;
use crate::geometry::PixelRect;
use crate::transform::Transform;

use super::{assert_invertible, BufferBacked, TransformCapable};

/// Raster layer: an owned pixel buffer placed by a transform.
#[derive(Clone, Debug)]
pub struct ImageLayer {
    buffer: PixelBuffer,
    transform: Transform,
    alpha_locked: bool,
}

impl ImageLayer {
    pub fn new(buffer: PixelBuffer) -> Self {
        Self { buffer, transform: Transform::IDENTITY, alpha_locked: false }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.buffer.width(), self.buffer.height())
    }

    pub fn set_alpha_locked(&mut self, locked: bool) -> bool {
        std::mem::replace(&mut self.alpha_locked, locked) != locked
    }

    /// Swap in a new buffer, returning the old one.
    pub fn replace_buffer(&mut self, buffer: PixelBuffer) -> PixelBuffer {
        std::mem::replace(&mut self.buffer, buffer)
    }
}

impl TransformCapable for ImageLayer {
    fn transform(&self) -> Transform {
        self.transform
    }

    fn set_transform(&mut self, transform: Transform) -> bool {
        assert_invertible(&transform);
        if self.transform == transform {
            return false;
        }
        self.transform = transform;
        true
    }

    fn local_bounds(&self) -> PixelRect {
        self.buffer.rect()
    }
}

impl BufferBacked for ImageLayer {
    fn buffer(&self) -> &PixelBuffer {
        &self.buffer
    }

    fn buffer_mut(&mut self) -> &mut PixelBuffer {
        &mut self.buffer
    }

    fn alpha_locked(&self) -> bool {
        self.alpha_locked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transformed_bounds_follow_transform() {
        let mut l = ImageLayer::new(PixelBuffer::new(20, 10));
        assert!(l.set_transform(Transform::translation(5.0, -3.0)));
        assert!(!l.set_transform(Transform::translation(5.0, -3.0)));
        assert_eq!(l.transformed_bounds(), PixelRect::new(5, -3, 20, 10));
    }

    #[test]
    #[should_panic(expected = "invertible")]
    fn singular_transform_is_rejected() {
        let mut l = ImageLayer::new(PixelBuffer::new(2, 2));
        l.set_transform(Transform::scale(0.0, 0.0));
    }
}
