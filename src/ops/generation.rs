// ============================================================================
// IMAGE GENERATION HAND-OFF — what a generation backend gets and gives back
// ============================================================================

use std::collections::BTreeMap;

use image::imageops::{self, FilterType};

use crate::canvas::{AlphaMask, PixelBuffer};
use crate::components::history::History;
use crate::geometry::PixelRect;
use crate::layer::{Layer, LayerId, TransformCapable};
use crate::stack::LayerStack;
use crate::transform::Transform;
use crate::log_info;

/// Inputs for one generation run over the document's generation area.
#[derive(Clone, Debug)]
pub struct GenerationRequest {
    pub area: PixelRect,
    /// Merged document pixels under `area`.
    pub image: PixelBuffer,
    /// Selection mask under `area` (255 = regenerate).
    pub mask: AlphaMask,
}

impl GenerationRequest {
    pub fn from_stack(stack: &LayerStack) -> Self {
        let area = stack.selection().generation_area();
        Self {
            area,
            image: stack.render_region(area),
            mask: stack.selection().mask_region(area),
        }
    }
}

/// Results of a run, addressed by `(batch, row)`.
#[derive(Clone, Debug, Default)]
pub struct GenerationBatch {
    pub area: PixelRect,
    results: BTreeMap<(usize, usize), PixelBuffer>,
}

impl GenerationBatch {
    pub fn new(area: PixelRect) -> Self {
        Self { area, results: BTreeMap::new() }
    }

    pub fn insert(&mut self, batch: usize, row: usize, image: PixelBuffer) {
        self.results.insert((batch, row), image);
    }

    pub fn get(&self, batch: usize, row: usize) -> Option<&PixelBuffer> {
        self.results.get(&(batch, row))
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Insert result `(batch, row)` as a new image layer over the generation
/// area, above the active layer.  Results of a different size are resized to
/// the area.  When something is selected, only selected pixels are kept.
pub fn apply_generated(
    stack: &mut LayerStack,
    history: &mut History,
    batch: &GenerationBatch,
    index: (usize, usize),
) -> Option<LayerId> {
    let result = batch.get(index.0, index.1)?;
    let area = batch.area;
    if area.is_empty() {
        return None;
    }
    let (w, h) = (area.width as u32, area.height as u32);
    let mut pixels = if result.width() == w && result.height() == h {
        result.clone()
    } else {
        PixelBuffer::from_premultiplied(imageops::resize(result.as_image(), w, h, FilterType::Triangle))
    };
    if !stack.selection().mask_is_empty() {
        let mask = stack.selection().mask_region(area);
        pixels.apply_mask(&mask, (0, 0));
    }

    let mut layer = Layer::new_image(format!("Generated {}-{}", index.0, index.1), pixels);
    if let Some(img) = layer.as_image_mut() {
        img.set_transform(Transform::translation(area.x as f64, area.y as f64));
    }
    let (parent, at) = stack
        .active_layer()
        .and_then(|a| stack.position_of(a))
        .unwrap_or((stack.root_id(), 0));
    let id = stack.add_layer(layer, Some(parent), at, history);
    stack.set_active_layer(Some(id));
    log_info!("Inserted generated image {:?} at {:?}", index, area);
    Some(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::BufferBacked;
    use crate::selection::{SelectionMode, SelectionShape};

    #[test]
    fn request_covers_generation_area() {
        let mut stack = LayerStack::new(20, 20);
        let mut h = History::default();
        stack.add_layer(Layer::new_image("bg", PixelBuffer::filled(20, 20, [10, 20, 30, 255])), None, 0, &mut h);
        stack.set_generation_area(PixelRect::new(5, 5, 8, 6));
        stack.select(&SelectionShape::Rectangle(PixelRect::new(5, 5, 2, 2)), SelectionMode::Replace, &mut h);
        let req = GenerationRequest::from_stack(&stack);
        assert_eq!((req.image.width(), req.image.height()), (8, 6));
        assert_eq!(req.image.pixel(0, 0), [10, 20, 30, 255]);
        assert_eq!(req.mask.get_pixel(1, 1)[0], 255);
        assert_eq!(req.mask.get_pixel(4, 4)[0], 0);
    }

    #[test]
    fn generated_result_lands_at_area_offset() {
        let mut stack = LayerStack::new(20, 20);
        let mut h = History::default();
        let area = PixelRect::new(4, 6, 5, 5);
        let mut batch = GenerationBatch::new(area);
        batch.insert(0, 1, PixelBuffer::filled(5, 5, [0, 255, 0, 255]));
        assert!(apply_generated(&mut stack, &mut h, &batch, (0, 0)).is_none());
        let id = apply_generated(&mut stack, &mut h, &batch, (0, 1)).unwrap();
        assert_eq!(stack.full_image_bounds(id), Some(area));
        assert_eq!(stack.active_layer(), Some(id));
        let merged = stack.render();
        assert_eq!(merged.pixel(4, 6), [0, 255, 0, 255]);
        assert_eq!(merged.pixel(3, 6), [0, 0, 0, 0]);
        h.undo(&mut stack);
        assert!(!stack.contains(id));
    }

    #[test]
    fn generated_result_is_masked_by_selection() {
        let mut stack = LayerStack::new(10, 10);
        let mut h = History::default();
        stack.select(&SelectionShape::Rectangle(PixelRect::new(0, 0, 2, 10)), SelectionMode::Replace, &mut h);
        let mut batch = GenerationBatch::new(PixelRect::new(0, 0, 4, 4));
        batch.insert(0, 0, PixelBuffer::filled(8, 8, [255, 255, 255, 255]));
        let id = apply_generated(&mut stack, &mut h, &batch, (0, 0)).unwrap();
        let buf = stack.find(id).unwrap().as_image().unwrap().buffer().clone();
        assert_eq!(buf.width(), 4);
        assert_eq!(buf.pixel(1, 1)[3], 255);
        assert_eq!(buf.pixel(3, 1)[3], 0);
    }

    #[test]
    fn mask_applies_when_selection_is_outside_generation_area() {
        let mut stack = LayerStack::new(10, 10);
        let mut h = History::default();
        stack.select(&SelectionShape::Rectangle(PixelRect::new(0, 0, 2, 10)), SelectionMode::Replace, &mut h);
        stack.set_generation_area(PixelRect::new(4, 0, 6, 10));
        let mut batch = GenerationBatch::new(PixelRect::new(0, 0, 4, 4));
        batch.insert(0, 0, PixelBuffer::filled(4, 4, [255, 255, 255, 255]));
        let id = apply_generated(&mut stack, &mut h, &batch, (0, 0)).unwrap();
        let buf = stack.find(id).unwrap().as_image().unwrap().buffer().clone();
        assert_eq!(buf.pixel(1, 1)[3], 255);
        assert_eq!(buf.pixel(3, 1)[3], 0);
    }
}
