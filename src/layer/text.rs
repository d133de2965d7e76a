use std::cell::OnceCell;
use std::fmt;

use ab_glyph::{point, Font, FontArc, GlyphId, ScaleFont};

use crate::blend;
use crate::canvas::PixelBuffer;
use crate::geometry::PixelRect;
use crate::transform::Transform;

use super::{assert_invertible, TransformCapable};

/// Text appearance.  Without a font the layer renders as empty.
#[derive(Clone)]
pub struct TextStyle {
    pub font: Option<FontArc>,
    pub size: f32,
    /// Straight-alpha RGBA.
    pub color: [u8; 4],
}

impl Default for TextStyle {
    fn default() -> Self {
        Self { font: None, size: 24.0, color: [0, 0, 0, 255] }
    }
}

impl fmt::Debug for TextStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextStyle")
            .field("font", &self.font.as_ref().map(|_| "<font>"))
            .field("size", &self.size)
            .field("color", &self.color)
            .finish()
    }
}

/// Procedural layer whose pixels are derived from text and style.  The
/// raster is rendered lazily and dropped whenever the text or style changes;
/// it cannot be painted into directly.
#[derive(Clone, Debug)]
pub struct TextLayer {
    text: String,
    style: TextStyle,
    transform: Transform,
    cache: OnceCell<PixelBuffer>,
}

impl TextLayer {
    pub fn new(text: impl Into<String>, style: TextStyle) -> Self {
        Self {
            text: text.into(),
            style,
            transform: Transform::IDENTITY,
            cache: OnceCell::new(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn style(&self) -> &TextStyle {
        &self.style
    }

    pub fn set_text(&mut self, text: &str) -> bool {
        if self.text == text {
            return false;
        }
        self.text = text.to_string();
        self.cache = OnceCell::new();
        true
    }

    pub fn set_style(&mut self, style: TextStyle) {
        self.style = style;
        self.cache = OnceCell::new();
    }

    /// Rendered pixels in local space (cached until the next edit).
    pub fn rendered(&self) -> &PixelBuffer {
        self.cache.get_or_init(|| rasterize(&self.text, &self.style))
    }
}

impl TransformCapable for TextLayer {
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
        self.rendered().rect()
    }
}

/// Lay out `text` (one line per `\n`) left-aligned with the first baseline
/// at the font ascent, and rasterize the glyph coverage in `style.color`.
fn rasterize(text: &str, style: &TextStyle) -> PixelBuffer {
    let Some(font) = style.font.as_ref() else {
        return PixelBuffer::new(0, 0);
    };
    if text.is_empty() || style.size <= 0.0 {
        return PixelBuffer::new(0, 0);
    }
    let scaled = font.as_scaled(style.size);
    let ascent = scaled.ascent();
    let line_height = scaled.height();

    let mut glyphs: Vec<(GlyphId, f32, f32)> = Vec::new();
    let mut width = 0.0f32;
    let lines: Vec<&str> = text.split('\n').collect();
    for (line_idx, line) in lines.iter().enumerate() {
        let baseline = ascent + line_idx as f32 * line_height;
        let mut cursor_x = 0.0f32;
        let mut last: Option<GlyphId> = None;
        for ch in line.chars() {
            let id = font.glyph_id(ch);
            if let Some(prev) = last {
                cursor_x += scaled.kern(prev, id);
            }
            glyphs.push((id, cursor_x, baseline));
            cursor_x += scaled.h_advance(id);
            last = Some(id);
        }
        width = width.max(cursor_x);
    }

    let w = width.ceil().max(1.0) as u32;
    let h = (line_height * lines.len() as f32).ceil().max(1.0) as u32;
    let mut coverage = vec![0.0f32; (w * h) as usize];

    for (id, x, y) in glyphs {
        let glyph = id.with_scale_and_position(style.size, point(x, y));
        let Some(outlined) = font.outline_glyph(glyph) else { continue };
        let b = outlined.px_bounds();
        outlined.draw(|gx, gy, c| {
            let px = b.min.x as i32 + gx as i32;
            let py = b.min.y as i32 + gy as i32;
            if px >= 0 && py >= 0 && (px as u32) < w && (py as u32) < h {
                let idx = (py as u32 * w + px as u32) as usize;
                coverage[idx] = (coverage[idx] + c).min(1.0);
            }
        });
    }

    let base = blend::premultiply(style.color);
    let mut buf = PixelBuffer::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let c = coverage[(y * w + x) as usize];
            if c > 0.0 {
                buf.put_pixel(x, y, blend::scale_pixel(base, c));
            }
        }
    }
    buf
}
