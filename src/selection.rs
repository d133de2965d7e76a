// ============================================================================
// SELECTION LAYER — two-colour document-sized mask plus traced outlines
// ============================================================================

use std::cell::OnceCell;
use std::collections::HashMap;

use image::{GrayImage, Luma};
use kurbo::Point;
use rayon::prelude::*;

use crate::blend::{self, Premul, TRANSPARENT};
use crate::canvas::{self, AlphaMask, PixelBuffer};
use crate::geometry::PixelRect;
use crate::layer::BufferBacked;

/// How a new selection shape interacts with the existing mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SelectionMode {
    /// Clear any existing selection, then set the new shape.
    #[default]
    Replace,
    /// Union – add to the existing mask.
    Add,
    /// Difference – subtract from the existing mask.
    Subtract,
    /// Keep only pixels present in both the existing mask AND the new shape.
    Intersect,
}

/// Shape rasterized into the selection.  A pixel is inside when its centre is.
#[derive(Clone, Debug, PartialEq)]
pub enum SelectionShape {
    Rectangle(PixelRect),
    /// Ellipse inscribed in the rect.
    Ellipse(PixelRect),
    /// Closed polygon, even-odd fill.
    Polygon(Vec<Point>),
}

impl SelectionShape {
    fn covers(&self, px: f64, py: f64) -> bool {
        match self {
            SelectionShape::Rectangle(r) => {
                px >= r.x as f64 && py >= r.y as f64 && px < r.right() as f64 && py < r.bottom() as f64
            }
            SelectionShape::Ellipse(r) => {
                if r.is_empty() {
                    return false;
                }
                let rx = r.width as f64 / 2.0;
                let ry = r.height as f64 / 2.0;
                let dx = (px - (r.x as f64 + rx)) / rx;
                let dy = (py - (r.y as f64 + ry)) / ry;
                dx * dx + dy * dy <= 1.0
            }
            SelectionShape::Polygon(pts) => point_in_polygon(pts, px, py),
        }
    }

    fn bounding_rect(&self) -> PixelRect {
        match self {
            SelectionShape::Rectangle(r) | SelectionShape::Ellipse(r) => *r,
            SelectionShape::Polygon(pts) => {
                let Some(first) = pts.first() else { return PixelRect::EMPTY };
                let r = pts.iter().fold(kurbo::Rect::from_points(*first, *first), |acc, p| {
                    acc.union_pt(*p)
                });
                PixelRect::bounding(r)
            }
        }
    }
}

fn point_in_polygon(pts: &[Point], x: f64, y: f64) -> bool {
    if pts.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = pts.len() - 1;
    for i in 0..pts.len() {
        let (pi, pj) = (pts[i], pts[j]);
        if (pi.y > y) != (pj.y > y) && x < (pj.x - pi.x) * (y - pi.y) / (pj.y - pi.y) + pi.x {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// The document's selection.  Pixels are either the selection colour or
/// fully transparent.
#[derive(Clone, Debug)]
pub struct SelectionLayer {
    buffer: PixelBuffer,
    /// Straight-alpha selection colour.
    color: [u8; 4],
    generation_area: PixelRect,
    bounds_cache: OnceCell<Option<PixelRect>>,
    outline_cache: OnceCell<Vec<Vec<(i32, i32)>>>,
}

impl SelectionLayer {
    pub fn new(width: u32, height: u32, color: [u8; 4]) -> Self {
        let color = if color[3] == 0 { [color[0], color[1], color[2], 255] } else { color };
        Self {
            buffer: PixelBuffer::new(width, height),
            color,
            generation_area: PixelRect::from_size(width, height),
            bounds_cache: OnceCell::new(),
            outline_cache: OnceCell::new(),
        }
    }

    pub fn color(&self) -> [u8; 4] {
        self.color
    }

    fn premul_color(&self) -> Premul {
        blend::premultiply(self.color)
    }

    pub fn generation_area(&self) -> PixelRect {
        self.generation_area
    }

    /// Returns `true` if the area changed.
    pub fn set_generation_area(&mut self, area: PixelRect) -> bool {
        let area = area.intersect(&self.buffer.rect());
        if area == self.generation_area {
            return false;
        }
        self.generation_area = area;
        self.bounds_cache = OnceCell::new();
        true
    }

    /// Drop cached bounds and outlines after the buffer changed.
    pub fn invalidate(&mut self) {
        self.bounds_cache = OnceCell::new();
        self.outline_cache = OnceCell::new();
    }

    /// Nothing selected inside the generation area.
    pub fn is_empty(&self) -> bool {
        self.bounds().is_none()
    }

    /// No pixel selected anywhere in the document.  Masked edits key off
    /// this, not [`SelectionLayer::is_empty`].
    pub fn mask_is_empty(&self) -> bool {
        canvas::mask_is_empty(&self.mask())
    }

    /// Selected pixels' bounding box, clipped to the generation area.
    pub fn bounds(&self) -> Option<PixelRect> {
        *self.bounds_cache.get_or_init(|| {
            let r = self.buffer.content_bounds(0)?.intersect(&self.generation_area);
            (!r.is_empty()).then_some(r)
        })
    }

    /// Whole-document mask (255 = selected).
    pub fn mask(&self) -> AlphaMask {
        self.mask_region(self.buffer.rect())
    }

    /// Mask for `rect`; pixels outside the document are unselected.
    pub fn mask_region(&self, rect: PixelRect) -> AlphaMask {
        GrayImage::from_fn(rect.width.max(0) as u32, rect.height.max(0) as u32, |x, y| {
            let a = self.buffer.pixel_or_clear(rect.x + x as i32, rect.y + y as i32)[3];
            Luma([if a > 0 { 255 } else { 0 }])
        })
    }

    pub fn is_selected(&self, x: i32, y: i32) -> bool {
        self.buffer.pixel_or_clear(x, y)[3] > 0
    }

    /// Combine `shape` with the current mask.  Returns the rect whose pixels
    /// may have changed.
    pub fn select(&mut self, shape: &SelectionShape, mode: SelectionMode) -> PixelRect {
        let full = self.buffer.rect();
        let shape_rect = shape.bounding_rect().intersect(&full);
        let touched = match mode {
            SelectionMode::Replace | SelectionMode::Intersect => full,
            SelectionMode::Add | SelectionMode::Subtract => shape_rect,
        };
        if touched.is_empty() {
            return PixelRect::EMPTY;
        }
        let color = self.premul_color();
        let view_rect = touched;
        self.buffer
            .view_mut(view_rect)
            .par_rows_mut()
            .for_each(|(row_y, row)| {
                let y = view_rect.y + row_y as i32;
                for (col, px) in row.chunks_exact_mut(4).enumerate() {
                    let x = view_rect.x + col as i32;
                    let inside = shape_rect.contains(x, y)
                        && shape.covers(x as f64 + 0.5, y as f64 + 0.5);
                    let was = px[3] > 0;
                    let now = match mode {
                        SelectionMode::Replace => inside,
                        SelectionMode::Add => was || inside,
                        SelectionMode::Subtract => was && !inside,
                        SelectionMode::Intersect => was && inside,
                    };
                    let next = if now { color } else { TRANSPARENT };
                    px.copy_from_slice(&next);
                }
            });
        self.invalidate();
        touched
    }

    pub fn select_all(&mut self) {
        let rect = self.buffer.rect();
        self.select(&SelectionShape::Rectangle(rect), SelectionMode::Replace);
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.invalidate();
    }

    pub fn invert(&mut self) {
        let color = self.premul_color();
        let rect = self.buffer.rect();
        self.buffer.view_mut(rect).par_rows_mut().for_each(|(_, row)| {
            for px in row.chunks_exact_mut(4) {
                let next = if px[3] > 0 { TRANSPARENT } else { color };
                px.copy_from_slice(&next);
            }
        });
        self.invalidate();
    }

    /// Snap pixels in `rect` back to the two allowed colours: anything with at
    /// least half the selection colour's alpha becomes selected.
    pub fn normalize_region(&mut self, rect: PixelRect) {
        let r = rect.intersect(&self.buffer.rect());
        if r.is_empty() {
            return;
        }
        let color = self.premul_color();
        let threshold = (color[3] / 2).max(1);
        self.buffer.view_mut(r).par_rows_mut().for_each(|(_, row)| {
            for px in row.chunks_exact_mut(4) {
                let next = if px[3] >= threshold { color } else { TRANSPARENT };
                px.copy_from_slice(&next);
            }
        });
        self.invalidate();
    }

    /// Closed outline polygons around the selected pixels, traced along pixel
    /// edges.  Vertices are pixel corners; collinear runs are merged.
    pub fn outlines(&self) -> &[Vec<(i32, i32)>] {
        self.outline_cache.get_or_init(|| trace_outlines(&self.mask()))
    }
}

impl BufferBacked for SelectionLayer {
    fn buffer(&self) -> &PixelBuffer {
        &self.buffer
    }

    fn buffer_mut(&mut self) -> &mut PixelBuffer {
        self.invalidate();
        &mut self.buffer
    }
}

/// Contour tracing over pixel edges.  Each selected pixel contributes the
/// edges it shares with unselected neighbours, oriented clockwise (y down),
/// and the edges are chained into loops.
fn trace_outlines(mask: &GrayImage) -> Vec<Vec<(i32, i32)>> {
    let (w, h) = (mask.width() as i32, mask.height() as i32);
    let on = |x: i32, y: i32| x >= 0 && y >= 0 && x < w && y < h && mask.get_pixel(x as u32, y as u32).0[0] > 0;

    let mut next: HashMap<(i32, i32), Vec<(i32, i32)>> = HashMap::new();
    let mut add = |a: (i32, i32), b: (i32, i32)| next.entry(a).or_default().push(b);
    for y in 0..h {
        for x in 0..w {
            if !on(x, y) {
                continue;
            }
            if !on(x, y - 1) {
                add((x, y), (x + 1, y));
            }
            if !on(x + 1, y) {
                add((x + 1, y), (x + 1, y + 1));
            }
            if !on(x, y + 1) {
                add((x + 1, y + 1), (x, y + 1));
            }
            if !on(x - 1, y) {
                add((x, y + 1), (x, y));
            }
        }
    }

    let mut starts: Vec<(i32, i32)> = next.keys().copied().collect();
    starts.sort_unstable_by_key(|&(x, y)| (y, x));
    let mut loops = Vec::new();
    for start in starts {
        while next.get(&start).is_some_and(|v| !v.is_empty()) {
            let mut poly = vec![start];
            let mut cur = start;
            while let Some(n) = next.get_mut(&cur).and_then(|v| v.pop()) {
                if n == start {
                    break;
                }
                poly.push(n);
                cur = n;
            }
            loops.push(simplify(poly));
        }
    }
    loops
}

fn simplify(poly: Vec<(i32, i32)>) -> Vec<(i32, i32)> {
    let n = poly.len();
    if n < 3 {
        return poly;
    }
    (0..n)
        .filter(|&i| {
            let (p, c, q) = (poly[(i + n - 1) % n], poly[i], poly[(i + 1) % n]);
            (c.0 - p.0) * (q.1 - c.1) != (c.1 - p.1) * (q.0 - c.0)
        })
        .map(|i| poly[i])
        .collect()
}
