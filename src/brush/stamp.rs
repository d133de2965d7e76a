//! Segment rasterisation for the brush engine.
//!
//! A segment is a capsule (a line with round caps) of a given radius between
//! two points.  Soft brushes are built from concentric passes: the outermost
//! pass spans the full radius at the faintest opacity and each inner pass is
//! narrower and more opaque, ending at `radius * hardness` with full opacity.
//! Passes combine by maximum, so a pixel takes the strongest pass that
//! covers it.

use image::{GrayImage, Luma};
use kurbo::Point;
use rayon::prelude::*;

use crate::geometry::PixelRect;

const MIN_PASSES: usize = 2;
const MAX_PASSES: usize = 24;

/// Anti-aliased coverage of pixel centre `p` by the capsule `a`→`b`.
#[inline]
fn capsule_coverage(p: Point, a: Point, b: Point, radius: f64) -> f64 {
    let ab = b - a;
    let len_sq = ab.hypot2();
    let t = if len_sq < 1e-12 { 0.0 } else { ((p - a).dot(ab) / len_sq).clamp(0.0, 1.0) };
    let closest = a + ab * t;
    let d = (p - closest).hypot();
    (radius + 0.5 - d).clamp(0.0, 1.0)
}

/// Number of concentric passes used for a soft brush.
pub fn pass_count(size: f32, hardness: f32) -> usize {
    if hardness >= 1.0 {
        return 1;
    }
    let soft_px = (size * (1.0 - hardness.max(0.0))) / 2.0;
    (soft_px.ceil() as usize).clamp(MIN_PASSES, MAX_PASSES)
}

/// `(radius, opacity)` of every pass, outermost first.
pub fn passes(size: f32, opacity: f32, hardness: f32) -> Vec<(f32, f32)> {
    let radius = size / 2.0;
    let n = pass_count(size, hardness);
    if n == 1 {
        return vec![(radius, opacity)];
    }
    let inner = radius * hardness.clamp(0.0, 1.0);
    (0..n)
        .map(|i| {
            let t = i as f32 / (n - 1) as f32;
            let r = radius + (inner - radius) * t;
            let a = opacity * (i + 1) as f32 / n as f32;
            (r, a)
        })
        .collect()
}

/// Pixel rect a segment can touch.
pub fn segment_bounds(from: Point, to: Point, size: f32) -> PixelRect {
    let r = size as f64 / 2.0 + 1.0;
    PixelRect::from_corners(
        (from.x.min(to.x) - r).floor() as i32,
        (from.y.min(to.y) - r).floor() as i32,
        (from.x.max(to.x) + r).ceil() as i32,
        (from.y.max(to.y) + r).ceil() as i32,
    )
}

/// Rasterise one segment into a coverage mask covering `rect`.
/// Mask pixel `(x, y)` corresponds to target pixel `(rect.x + x, rect.y + y)`.
pub fn segment_alpha(from: Point, to: Point, size: f32, opacity: f32, hardness: f32, rect: PixelRect) -> GrayImage {
    let w = rect.width.max(0) as u32;
    let h = rect.height.max(0) as u32;
    let mut mask = GrayImage::new(w, h);
    if w == 0 || h == 0 || size <= 0.0 || opacity <= 0.0 {
        return mask;
    }
    let passes = passes(size, opacity.clamp(0.0, 1.0), hardness);
    let row_len = w as usize;
    mask.as_mut().par_chunks_mut(row_len).enumerate().for_each(|(row, out)| {
        let py = rect.y as f64 + row as f64 + 0.5;
        for (col, v) in out.iter_mut().enumerate() {
            let p = Point::new(rect.x as f64 + col as f64 + 0.5, py);
            let mut best = 0.0f32;
            for &(r, a) in &passes {
                let cov = capsule_coverage(p, from, to, r as f64) as f32;
                best = best.max(cov * a);
            }
            *v = (best * 255.0).round().clamp(0.0, 255.0) as u8;
        }
    });
    mask
}

/// Multiply a segment mask by a tiled pattern anchored at target origin.
pub fn gate_with_pattern(mask: &mut GrayImage, rect: PixelRect, pattern: &GrayImage) {
    let (pw, ph) = (pattern.width() as i32, pattern.height() as i32);
    if pw == 0 || ph == 0 {
        return;
    }
    for (x, y, v) in mask.enumerate_pixels_mut() {
        let px = (rect.x + x as i32).rem_euclid(pw) as u32;
        let py = (rect.y + y as i32).rem_euclid(ph) as u32;
        let gate = pattern.get_pixel(px, py)[0] as u32;
        *v = Luma([((v[0] as u32 * gate + 127) / 255) as u8]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_brush_is_single_pass() {
        assert_eq!(passes(10.0, 0.8, 1.0), vec![(5.0, 0.8)]);
    }

    #[test]
    fn soft_brush_passes_shrink_and_strengthen() {
        let p = passes(40.0, 1.0, 0.25);
        assert!(p.len() >= MIN_PASSES && p.len() <= MAX_PASSES);
        assert_eq!(p.first().unwrap().0, 20.0);
        assert!((p.last().unwrap().0 - 5.0).abs() < 1e-5);
        assert!((p.last().unwrap().1 - 1.0).abs() < 1e-6);
        for w in p.windows(2) {
            assert!(w[1].0 < w[0].0);
            assert!(w[1].1 > w[0].1);
        }
    }

    #[test]
    fn pass_count_clamped() {
        assert_eq!(pass_count(2.0, 0.9), MIN_PASSES);
        assert_eq!(pass_count(1000.0, 0.0), MAX_PASSES);
    }

    #[test]
    fn dot_covers_centre_fully() {
        let c = Point::new(10.0, 10.0);
        let rect = segment_bounds(c, c, 6.0);
        let m = segment_alpha(c, c, 6.0, 1.0, 1.0, rect);
        let (cx, cy) = ((10 - rect.x) as u32, (10 - rect.y) as u32);
        assert_eq!(m.get_pixel(cx, cy)[0], 255);
        assert_eq!(m.get_pixel(0, 0)[0], 0);
    }

    #[test]
    fn soft_edge_is_fainter_than_centre() {
        let c = Point::new(20.0, 20.0);
        let rect = segment_bounds(c, c, 20.0);
        let m = segment_alpha(c, c, 20.0, 1.0, 0.2, rect);
        let centre = m.get_pixel((20 - rect.x) as u32, (20 - rect.y) as u32)[0];
        let edge = m.get_pixel((28 - rect.x) as u32, (20 - rect.y) as u32)[0];
        assert_eq!(centre, 255);
        assert!(edge > 0 && edge < centre);
    }

    #[test]
    fn pattern_gates_coverage() {
        let mut m = GrayImage::from_pixel(4, 1, Luma([200]));
        let pattern = GrayImage::from_fn(2, 1, |x, _| Luma([if x == 0 { 255 } else { 0 }]));
        gate_with_pattern(&mut m, PixelRect::new(0, 0, 4, 1), &pattern);
        assert_eq!(m.as_raw(), &vec![200, 0, 200, 0]);
    }
}
