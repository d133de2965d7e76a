// ============================================================================
// RENDER ENGINE — recursive compositing of the layer tree into a buffer
// ============================================================================
//
// Children are stored top-first, so they are painted in reverse order.
// Groups only compose translations: any rotation or scale lives on the leaves.

use image::GrayImage;
use rayon::prelude::*;

use crate::blend::{self, BlendMode};
use crate::canvas::{AlphaMask, PixelBuffer};
use crate::geometry::PixelRect;
use crate::layer::{ContainerLike, Layer, LayerGroup, LayerKind};
use crate::transform::Transform;

/// Per-leaf content substitution used by previews and exports.  Returning
/// `None` keeps the layer's own pixels.
pub type LayerAdjuster<'a> = dyn Fn(&Layer, &PixelBuffer) -> Option<PixelBuffer> + Sync + 'a;

#[derive(Clone, Copy, Default)]
pub struct Renderer<'a> {
    /// Leaves with a higher z-value are skipped.
    pub z_max: Option<i32>,
    pub adjuster: Option<&'a LayerAdjuster<'a>>,
}

impl<'a> Renderer<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_z_max(mut self, z_max: i32) -> Self {
        self.z_max = Some(z_max);
        self
    }

    pub fn with_adjuster(mut self, adjuster: &'a LayerAdjuster<'a>) -> Self {
        self.adjuster = Some(adjuster);
        self
    }

    /// Composite `layer` into `base`.  `transform` maps the layer's parent
    /// space to `base` pixels; `clip` limits the touched area.  When
    /// `returned_mask` is given (same size as `base`), the coverage this layer
    /// painted is accumulated into it.
    pub fn render(
        &self,
        layer: &Layer,
        base: &mut PixelBuffer,
        transform: &Transform,
        clip: Option<PixelRect>,
        returned_mask: Option<&mut AlphaMask>,
    ) {
        if !layer.is_visible() || layer.opacity() <= 0.0 {
            return;
        }
        match &layer.kind {
            LayerKind::Group(group) => self.render_group(layer, group, base, transform, clip, returned_mask),
            LayerKind::Image(_) | LayerKind::Text(_) => {
                self.render_leaf(layer, base, transform, clip, returned_mask)
            }
        }
    }

    fn render_group(
        &self,
        layer: &Layer,
        group: &LayerGroup,
        base: &mut PixelBuffer,
        transform: &Transform,
        clip: Option<PixelRect>,
        returned_mask: Option<&mut AlphaMask>,
    ) {
        assert!(
            transform.is_translation_only(),
            "group {} can only be rendered through a translation, got {:?}",
            layer.id(),
            transform.coeffs()
        );
        let to_base = group.offset_transform().then(transform);
        let mut target = to_base.map_pixel_rect(group.local_bounds()).intersect(&base.rect());
        if let Some(c) = clip {
            target = target.intersect(&c);
        }
        if target.is_empty() {
            return;
        }

        let (w, h) = (target.width as u32, target.height as u32);
        let child_transform = to_base.then(&Transform::translation(-target.x as f64, -target.y as f64));
        let child_clip = PixelRect::from_size(w, h);

        if group.isolate() {
            let mut scratch = PixelBuffer::new(w, h);
            for child in group.children().iter().rev() {
                self.render(child, &mut scratch, &child_transform, Some(child_clip), None);
            }
            base.draw_buffer(&scratch, target.x, target.y, layer.opacity(), layer.mode(), None);
            if let Some(mask) = returned_mask {
                accumulate_coverage(mask, &scratch, (target.x, target.y), layer.opacity());
            }
            return;
        }

        // Non-isolated: children blend against a copy of the backdrop while
        // their combined coverage is tracked.
        let backdrop = base.copy_region(target);
        let mut scratch = backdrop.clone();
        let mut coverage = GrayImage::new(w, h);
        for child in group.children().iter().rev() {
            self.render(child, &mut scratch, &child_transform, Some(child_clip), Some(&mut coverage));
        }

        if layer.mode() == BlendMode::Normal {
            // Pass-through: untouched pixels are still the backdrop, so a
            // straight interpolation is exact.
            if layer.opacity() < 1.0 {
                mix_towards(&mut scratch, &backdrop, &coverage, layer.opacity());
            }
            base.write_region(&scratch, target.x, target.y);
        } else {
            scratch.apply_mask(&coverage, (0, 0));
            base.draw_buffer(&scratch, target.x, target.y, layer.opacity(), layer.mode(), None);
        }

        if let Some(mask) = returned_mask {
            let cov = PixelBuffer::from_premultiplied(image::RgbaImage::from_fn(w, h, |x, y| {
                image::Rgba([0, 0, 0, coverage.get_pixel(x, y).0[0]])
            }));
            accumulate_coverage(mask, &cov, (target.x, target.y), layer.opacity());
        }
    }

    fn render_leaf(
        &self,
        layer: &Layer,
        base: &mut PixelBuffer,
        transform: &Transform,
        clip: Option<PixelRect>,
        returned_mask: Option<&mut AlphaMask>,
    ) {
        if self.z_max.is_some_and(|z| layer.z_value() > z) {
            return;
        }
        let Some(raw) = layer.leaf_image() else { return };
        let adjusted = self.adjuster.and_then(|f| f(layer, raw));
        let src = adjusted.as_ref().unwrap_or(raw);
        if src.rect().is_empty() {
            return;
        }

        let own = layer.as_transformable().map(|t| t.transform()).unwrap_or_default();
        let effective = own.then(transform);
        let mut area = base.rect();
        if let Some(c) = clip {
            area = area.intersect(&c);
        }

        if let Some((dx, dy)) = effective.integer_translation() {
            let painted = base.draw_buffer(src, dx, dy, layer.opacity(), layer.mode(), Some(area));
            if let Some(mask) = returned_mask {
                if !painted.is_empty() {
                    let part = src.copy_region(painted.translated(-dx, -dy));
                    accumulate_coverage(mask, &part, (painted.x, painted.y), layer.opacity());
                }
            }
            return;
        }

        let target = effective.map_pixel_rect(src.rect()).intersect(&area);
        if target.is_empty() {
            return;
        }
        let warped = warp(src, &effective, target);
        base.draw_buffer(&warped, target.x, target.y, layer.opacity(), layer.mode(), None);
        if let Some(mask) = returned_mask {
            accumulate_coverage(mask, &warped, (target.x, target.y), layer.opacity());
        }
    }
}

/// Resample `src` through `transform` into a buffer covering `target`
/// (destination pixels).  Inverse mapping with bilinear filtering on
/// premultiplied values.
pub fn warp(src: &PixelBuffer, transform: &Transform, target: PixelRect) -> PixelBuffer {
    let mut out = PixelBuffer::new(target.width.max(0) as u32, target.height.max(0) as u32);
    let Some(inv) = transform.try_inverse() else { return out };
    let [a, b, c, d, e, f] = inv.coeffs();
    let src_w = src.width() as i32;
    let src_h = src.height() as i32;
    let src_stride = src_w as usize * 4;
    let src_raw = src.raw();
    let rect = out.rect();

    out.view_mut(rect).par_rows_mut().for_each(|(row_y, row)| {
        let py = target.y as f64 + row_y as f64 + 0.5;
        for (col, px) in row.chunks_exact_mut(4).enumerate() {
            let pxf = target.x as f64 + col as f64 + 0.5;
            // Source position relative to pixel centres.
            let sx = (a * pxf + c * py + e - 0.5) as f32;
            let sy = (b * pxf + d * py + f - 0.5) as f32;

            let x0 = sx.floor() as i32;
            let y0 = sy.floor() as i32;
            if x0 < -1 || y0 < -1 || x0 >= src_w || y0 >= src_h {
                continue;
            }
            let fx = sx - x0 as f32;
            let fy = sy - y0 as f32;

            let sample = |qx: i32, qy: i32| -> [f32; 4] {
                if qx < 0 || qy < 0 || qx >= src_w || qy >= src_h {
                    [0.0; 4]
                } else {
                    let idx = qy as usize * src_stride + qx as usize * 4;
                    [
                        src_raw[idx] as f32,
                        src_raw[idx + 1] as f32,
                        src_raw[idx + 2] as f32,
                        src_raw[idx + 3] as f32,
                    ]
                }
            };

            let tl = sample(x0, y0);
            let tr = sample(x0 + 1, y0);
            let bl = sample(x0, y0 + 1);
            let br = sample(x0 + 1, y0 + 1);

            for ch in 0..4 {
                let top = tl[ch] + (tr[ch] - tl[ch]) * fx;
                let bot = bl[ch] + (br[ch] - bl[ch]) * fx;
                px[ch] = (top + (bot - top) * fy).round().clamp(0.0, 255.0) as u8;
            }
            // Premultiplied colour can never exceed alpha.
            let alpha = px[3];
            for ch in 0..3 {
                px[ch] = px[ch].min(alpha);
            }
        }
    });
    out
}

/// Source-over accumulate `src`'s alpha (scaled by `opacity`) into `mask`.
fn accumulate_coverage(mask: &mut AlphaMask, src: &PixelBuffer, at: (i32, i32), opacity: f32) {
    let area = src
        .rect()
        .translated(at.0, at.1)
        .intersect(&PixelRect::from_size(mask.width(), mask.height()));
    for y in area.y..area.bottom() {
        for x in area.x..area.right() {
            let a = src.pixel((x - at.0) as u32, (y - at.1) as u32)[3] as f32 * opacity;
            if a <= 0.0 {
                continue;
            }
            let m = mask.get_pixel_mut(x as u32, y as u32);
            let cur = m.0[0] as f32;
            m.0[0] = blend::to_u8(cur + a * (255.0 - cur) / 255.0 + 0.5);
        }
    }
}

/// Move covered pixels of `scratch` back towards `backdrop` so the group's
/// contribution is scaled by `opacity`.
fn mix_towards(scratch: &mut PixelBuffer, backdrop: &PixelBuffer, coverage: &AlphaMask, opacity: f32) {
    let rect = scratch.rect();
    let back = backdrop.view(rect);
    scratch.view_mut(rect).par_rows_mut().for_each(|(y, row)| {
        let brow = back.row(y);
        for (x, (s, b)) in row.chunks_exact_mut(4).zip(brow.chunks_exact(4)).enumerate() {
            if coverage.get_pixel(x as u32, y as u32).0[0] == 0 {
                continue;
            }
            for ch in 0..4 {
                let v = b[ch] as f32 + (s[ch] as f32 - b[ch] as f32) * opacity;
                s[ch] = v.round().clamp(0.0, 255.0) as u8;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::TransformCapable;

    fn solid(w: u32, h: u32, rgba: [u8; 4]) -> Layer {
        Layer::new_image("solid", PixelBuffer::filled(w, h, rgba))
    }

    fn group_of(children: Vec<Layer>, isolate: bool) -> Layer {
        let mut g = Layer::new_group("g");
        let gid = g.id();
        let grp = g.as_group_mut().unwrap();
        grp.set_isolate(isolate);
        for (i, c) in children.into_iter().enumerate() {
            grp.insert(gid, c, i);
        }
        g
    }

    #[test]
    fn identity_leaf_copies_pixels() {
        let mut src = PixelBuffer::new(8, 8);
        for y in 0..8 {
            for x in 0..8 {
                src.put_pixel(x, y, [x as u8 * 30, y as u8 * 30, 7, 255]);
            }
        }
        let layer = Layer::new_image("l", src.clone());
        let mut base = PixelBuffer::new(8, 8);
        Renderer::new().render(&layer, &mut base, &Transform::IDENTITY, None, None);
        assert_eq!(base, src);
    }

    #[test]
    fn children_paint_bottom_first() {
        let top = solid(4, 4, [0, 0, 255, 255]);
        let bottom = solid(4, 4, [255, 0, 0, 255]);
        let g = group_of(vec![top, bottom], true);
        let mut base = PixelBuffer::new(4, 4);
        Renderer::new().render(&g, &mut base, &Transform::IDENTITY, None, None);
        assert_eq!(base.pixel(1, 1), [0, 0, 255, 255]);
    }

    #[test]
    fn non_isolated_matches_isolated_for_soft_children() {
        let mut soft = solid(6, 6, [0, 0, 255, 128]);
        soft.as_image_mut().unwrap().set_transform(Transform::translation(2.0, 0.0));
        let make = |isolate| group_of(vec![soft.clone().deep_copy(), solid(6, 6, [0, 255, 0, 255])], isolate);
        let backdrop = PixelBuffer::filled(10, 10, [255, 0, 0, 255]);

        let mut a = backdrop.clone();
        Renderer::new().render(&make(true), &mut a, &Transform::IDENTITY, None, None);
        let mut b = backdrop.clone();
        Renderer::new().render(&make(false), &mut b, &Transform::IDENTITY, None, None);
        assert_eq!(a, b);
    }

    #[test]
    fn non_isolated_group_leaves_untouched_backdrop() {
        let child = solid(2, 2, [0, 255, 0, 255]);
        let mut g = group_of(vec![child], false);
        g.set_opacity(0.5);
        let mut base = PixelBuffer::filled(6, 6, [255, 0, 0, 255]);
        Renderer::new().render(&g, &mut base, &Transform::IDENTITY, None, None);
        assert_eq!(base.pixel(4, 4), [255, 0, 0, 255]);
        let mixed = base.pixel(0, 0);
        assert!(mixed[0] > 100 && mixed[1] > 100 && mixed[3] == 255);
    }

    #[test]
    fn z_cutoff_skips_higher_leaves() {
        let mut high = solid(2, 2, [0, 0, 255, 255]);
        high.z_value = 5;
        let mut base = PixelBuffer::new(2, 2);
        Renderer::new().with_z_max(4).render(&high, &mut base, &Transform::IDENTITY, None, None);
        assert!(base.is_transparent());
    }

    #[test]
    fn adjuster_substitutes_content_for_one_call() {
        let layer = solid(2, 2, [255, 0, 0, 255]);
        let adjust = |_: &Layer, src: &PixelBuffer| Some(PixelBuffer::filled(src.width(), src.height(), [0, 255, 0, 255]));
        let mut base = PixelBuffer::new(2, 2);
        Renderer::new().with_adjuster(&adjust).render(&layer, &mut base, &Transform::IDENTITY, None, None);
        assert_eq!(base.pixel(0, 0), [0, 255, 0, 255]);
        assert_eq!(layer.leaf_image().unwrap().pixel(0, 0), [255, 0, 0, 255]);
    }

    #[test]
    fn rotated_leaf_lands_in_mapped_bounds() {
        let mut l = solid(10, 4, [255, 255, 255, 255]);
        let t = Transform::rotation_degrees(90.0).then(&Transform::translation(10.0, 0.0));
        l.as_image_mut().unwrap().set_transform(t);
        let mut base = PixelBuffer::new(20, 20);
        Renderer::new().render(&l, &mut base, &Transform::IDENTITY, None, None);
        let b = base.content_bounds(0).unwrap();
        assert!(PixelRect::new(6, 0, 4, 10).contains_rect(&b), "{:?}", b);
        assert_eq!(base.pixel(8, 5)[3], 255);
    }

    #[test]
    #[should_panic(expected = "translation")]
    fn groups_reject_rotation() {
        let g = group_of(vec![solid(2, 2, [1, 1, 1, 255])], true);
        let mut base = PixelBuffer::new(4, 4);
        Renderer::new().render(&g, &mut base, &Transform::rotation_degrees(10.0), None, None);
    }
}
