// ============================================================================
// PIXEL BUFFER — premultiplied RGBA8 raster with zero-copy region views
// ============================================================================

use image::{GrayImage, Luma, Rgba, RgbaImage};
use rayon::prelude::*;

use crate::blend::{self, BlendMode, Premul, TRANSPARENT};
use crate::geometry::PixelRect;
use crate::transform::Transform;

/// Single-channel coverage mask (0 = outside, 255 = fully inside).
pub type AlphaMask = GrayImage;

/// Owned premultiplied RGBA8 raster, row-major.
#[derive(Clone, Debug, PartialEq)]
pub struct PixelBuffer {
    image: RgbaImage,
}

/// Read-only window into a [`PixelBuffer`].  `rect` is in buffer pixels.
#[derive(Clone, Copy)]
pub struct BufferView<'a> {
    data: &'a [u8],
    stride: usize,
    rect: PixelRect,
}

/// Mutable window into a [`PixelBuffer`].
pub struct BufferViewMut<'a> {
    data: &'a mut [u8],
    stride: usize,
    rect: PixelRect,
}

impl PixelBuffer {
    /// Fully transparent buffer.
    pub fn new(width: u32, height: u32) -> Self {
        Self { image: RgbaImage::new(width, height) }
    }

    /// Buffer filled with one straight-alpha colour.
    pub fn filled(width: u32, height: u32, straight: [u8; 4]) -> Self {
        let p = blend::premultiply(straight);
        Self { image: RgbaImage::from_pixel(width, height, Rgba(p)) }
    }

    /// Wrap straight-alpha pixels (as decoded from PNG), premultiplying them.
    pub fn from_straight(mut image: RgbaImage) -> Self {
        image.as_mut().par_chunks_mut(4).for_each(|px| {
            let p = blend::premultiply([px[0], px[1], px[2], px[3]]);
            px.copy_from_slice(&p);
        });
        Self { image }
    }

    /// Wrap pixels that are already premultiplied.
    pub fn from_premultiplied(image: RgbaImage) -> Self {
        Self { image }
    }

    /// Straight-alpha copy for encoding.
    pub fn to_straight(&self) -> RgbaImage {
        let mut out = self.image.clone();
        out.as_mut().par_chunks_mut(4).for_each(|px| {
            let p = blend::unpremultiply([px[0], px[1], px[2], px[3]]);
            px.copy_from_slice(&p);
        });
        out
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn rect(&self) -> PixelRect {
        PixelRect::from_size(self.width(), self.height())
    }

    pub fn as_image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn into_image(self) -> RgbaImage {
        self.image
    }

    pub fn raw(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn pixel(&self, x: u32, y: u32) -> Premul {
        self.image.get_pixel(x, y).0
    }

    /// Pixel at signed coordinates; transparent outside the buffer.
    pub fn pixel_or_clear(&self, x: i32, y: i32) -> Premul {
        if x < 0 || y < 0 || x >= self.width() as i32 || y >= self.height() as i32 {
            TRANSPARENT
        } else {
            self.pixel(x as u32, y as u32)
        }
    }

    pub fn put_pixel(&mut self, x: u32, y: u32, px: Premul) {
        self.image.put_pixel(x, y, Rgba(px));
    }

    pub fn memory_size(&self) -> usize {
        self.image.as_raw().len()
    }

    fn stride(&self) -> usize {
        self.width() as usize * 4
    }

    /// View of `rect`, which must lie inside the buffer.
    pub fn view(&self, rect: PixelRect) -> BufferView<'_> {
        assert!(
            self.rect().contains_rect(&rect),
            "view {:?} outside buffer {:?}",
            rect,
            self.rect()
        );
        let stride = self.stride();
        let data = if rect.is_empty() {
            &self.image.as_raw()[..0]
        } else {
            let (start, end) = span(rect, stride);
            &self.image.as_raw()[start..end]
        };
        BufferView { data, stride, rect }
    }

    pub fn view_mut(&mut self, rect: PixelRect) -> BufferViewMut<'_> {
        assert!(
            self.rect().contains_rect(&rect),
            "view {:?} outside buffer {:?}",
            rect,
            self.rect()
        );
        let stride = self.stride();
        let raw: &mut [u8] = self.image.as_mut();
        let data = if rect.is_empty() {
            &mut raw[..0]
        } else {
            let (start, end) = span(rect, stride);
            &mut raw[start..end]
        };
        BufferViewMut { data, stride, rect }
    }

    /// Copy of `rect`; parts outside the buffer come back transparent.
    pub fn copy_region(&self, rect: PixelRect) -> PixelBuffer {
        let mut out = PixelBuffer::new(rect.width.max(0) as u32, rect.height.max(0) as u32);
        let overlap = rect.intersect(&self.rect());
        if overlap.is_empty() {
            return out;
        }
        let src = self.view(overlap);
        let mut dst = out.view_mut(overlap.translated(-rect.x, -rect.y));
        dst.copy_from(&src);
        out
    }

    /// Overwrite the pixels under `src` placed at (`x`, `y`), clipped.
    pub fn write_region(&mut self, src: &PixelBuffer, x: i32, y: i32) {
        let placed = src.rect().translated(x, y);
        let overlap = placed.intersect(&self.rect());
        if overlap.is_empty() {
            return;
        }
        let s = src.view(overlap.translated(-x, -y));
        self.view_mut(overlap).copy_from(&s);
    }

    /// Smallest rect containing every pixel with alpha above `threshold`.
    pub fn content_bounds(&self, threshold: u8) -> Option<PixelRect> {
        let w = self.width() as usize;
        let stride = self.stride();
        if w == 0 {
            return None;
        }
        // Per-row (min_x, max_x) spans, reduced in parallel.
        let spans: Vec<Option<(usize, usize)>> = self
            .image
            .as_raw()
            .par_chunks(stride)
            .map(|row| {
                let mut first = None;
                let mut last = 0;
                for x in 0..w {
                    if row[x * 4 + 3] > threshold {
                        first.get_or_insert(x);
                        last = x;
                    }
                }
                first.map(|f| (f, last))
            })
            .collect();

        let mut min_x = usize::MAX;
        let mut max_x = 0;
        let mut min_y = None;
        let mut max_y = 0;
        for (y, span) in spans.iter().enumerate() {
            if let Some((a, b)) = span {
                min_x = min_x.min(*a);
                max_x = max_x.max(*b);
                min_y.get_or_insert(y);
                max_y = y;
            }
        }
        let min_y = min_y?;
        Some(PixelRect::from_corners(
            min_x as i32,
            min_y as i32,
            max_x as i32 + 1,
            max_y as i32 + 1,
        ))
    }

    pub fn is_transparent(&self) -> bool {
        self.image.as_raw().par_chunks(4).all(|px| px[3] == 0)
    }

    pub fn clear(&mut self) {
        self.image.as_mut().fill(0);
    }

    pub fn clear_rect(&mut self, rect: PixelRect) {
        let r = rect.intersect(&self.rect());
        if r.is_empty() {
            return;
        }
        self.view_mut(r).fill(TRANSPARENT);
    }

    /// Composite `src` placed at (`x`, `y`) onto this buffer, restricted to `clip`.
    pub fn draw_buffer(
        &mut self,
        src: &PixelBuffer,
        x: i32,
        y: i32,
        opacity: f32,
        mode: BlendMode,
        clip: Option<PixelRect>,
    ) -> PixelRect {
        let mut target = src.rect().translated(x, y).intersect(&self.rect());
        if let Some(c) = clip {
            target = target.intersect(&c);
        }
        if target.is_empty() {
            return PixelRect::EMPTY;
        }
        let s = src.view(target.translated(-x, -y));
        composite(&mut self.view_mut(target), &s, opacity, mode);
        target
    }

    /// Keep pixels only where `mask` (placed at `origin`) has coverage.
    /// Pixels outside the mask's extent are cleared.
    pub fn apply_mask(&mut self, mask: &AlphaMask, origin: (i32, i32)) {
        let (ox, oy) = origin;
        let (mw, mh) = (mask.width() as i32, mask.height() as i32);
        let w = self.width() as usize;
        if w == 0 {
            return;
        }
        self.image
            .as_mut()
            .par_chunks_mut(w * 4)
            .enumerate()
            .for_each(|(y, row)| {
                let my = y as i32 - oy;
                for x in 0..w {
                    let mx = x as i32 - ox;
                    let m = if mx < 0 || my < 0 || mx >= mw || my >= mh {
                        0
                    } else {
                        mask.get_pixel(mx as u32, my as u32).0[0]
                    };
                    let i = x * 4;
                    let p = blend::destination_in([row[i], row[i + 1], row[i + 2], row[i + 3]], m);
                    row[i..i + 4].copy_from_slice(&p);
                }
            });
    }
}

/// Byte span covering `rect` rows; the final row ends at the rect's right edge.
fn span(rect: PixelRect, stride: usize) -> (usize, usize) {
    let start = rect.y as usize * stride + rect.x as usize * 4;
    let end = (rect.bottom() as usize - 1) * stride + rect.right() as usize * 4;
    (start, end)
}

impl<'a> BufferView<'a> {
    pub fn rect(&self) -> PixelRect {
        self.rect
    }

    pub fn width(&self) -> usize {
        self.rect.width.max(0) as usize
    }

    pub fn height(&self) -> usize {
        self.rect.height.max(0) as usize
    }

    /// Row `y` (relative to the view) as RGBA bytes.
    pub fn row(&self, y: usize) -> &'a [u8] {
        let start = y * self.stride;
        &self.data[start..start + self.width() * 4]
    }

    pub fn pixel(&self, x: usize, y: usize) -> Premul {
        let r = self.row(y);
        let i = x * 4;
        [r[i], r[i + 1], r[i + 2], r[i + 3]]
    }
}

impl<'a> BufferViewMut<'a> {
    pub fn rect(&self) -> PixelRect {
        self.rect
    }

    pub fn width(&self) -> usize {
        self.rect.width.max(0) as usize
    }

    pub fn height(&self) -> usize {
        self.rect.height.max(0) as usize
    }

    pub fn row_mut(&mut self, y: usize) -> &mut [u8] {
        let start = y * self.stride;
        let w = self.width() * 4;
        &mut self.data[start..start + w]
    }

    /// Parallel iterator over `(row_index, row_bytes)`.
    pub fn par_rows_mut(&mut self) -> impl IndexedParallelIterator<Item = (usize, &mut [u8])> + '_ {
        let w = self.width() * 4;
        self.data
            .par_chunks_mut(self.stride.max(1))
            .map(move |c| &mut c[..w])
            .enumerate()
    }

    pub fn fill(&mut self, px: Premul) {
        self.par_rows_mut().for_each(|(_, row)| {
            for chunk in row.chunks_exact_mut(4) {
                chunk.copy_from_slice(&px);
            }
        });
    }

    pub fn copy_from(&mut self, src: &BufferView<'_>) {
        assert_same_shape(self.rect, src.rect);
        self.par_rows_mut().for_each(|(y, row)| row.copy_from_slice(src.row(y)));
    }
}

fn assert_same_shape(a: PixelRect, b: PixelRect) {
    assert!(
        a.width == b.width && a.height == b.height,
        "region shapes differ: {:?} vs {:?}",
        a,
        b
    );
}

// ----------------------------------------------------------------------------
// Bulk operations
// ----------------------------------------------------------------------------

/// Composite `src` over `dst` (same shape) with `mode` at `opacity`.
pub fn composite(dst: &mut BufferViewMut<'_>, src: &BufferView<'_>, opacity: f32, mode: BlendMode) {
    assert_same_shape(dst.rect, src.rect);
    if opacity <= 0.0 {
        return;
    }
    dst.par_rows_mut().for_each(|(y, row)| {
        let srow = src.row(y);
        for (d, s) in row.chunks_exact_mut(4).zip(srow.chunks_exact(4)) {
            if s[3] == 0 {
                continue;
            }
            let out = blend::blend_pixel([d[0], d[1], d[2], d[3]], [s[0], s[1], s[2], s[3]], mode, opacity);
            d.copy_from_slice(&out);
        }
    });
}

/// Resample a document-space mask into the local pixel grid of a layer whose
/// local→document transform is `to_document`.  Nearest sampling.
pub fn map_mask(mask: &AlphaMask, to_document: &Transform, width: u32, height: u32) -> AlphaMask {
    if let Some((dx, dy)) = to_document.integer_translation() {
        return GrayImage::from_fn(width, height, |x, y| {
            let mx = x as i32 + dx;
            let my = y as i32 + dy;
            if mx < 0 || my < 0 || mx >= mask.width() as i32 || my >= mask.height() as i32 {
                Luma([0])
            } else {
                *mask.get_pixel(mx as u32, my as u32)
            }
        });
    }
    GrayImage::from_fn(width, height, |x, y| {
        let p = to_document.map_point(kurbo::Point::new(x as f64 + 0.5, y as f64 + 0.5));
        let (mx, my) = (p.x.floor() as i64, p.y.floor() as i64);
        if mx < 0 || my < 0 || mx >= mask.width() as i64 || my >= mask.height() as i64 {
            Luma([0])
        } else {
            *mask.get_pixel(mx as u32, my as u32)
        }
    })
}

pub fn mask_is_empty(mask: &AlphaMask) -> bool {
    mask.as_raw().iter().all(|&v| v == 0)
}
