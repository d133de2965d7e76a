// ============================================================================
// IMAGE FILTERS — the filter contract, built-ins, and whole-layer application
// ============================================================================

use std::sync::Arc;

use image::imageops;
use rayon::prelude::*;

use crate::blend::{self, Premul};
use crate::canvas::{self, AlphaMask, PixelBuffer};
use crate::components::history::{BrushCommand, History, PixelPatch};
use crate::error::FilterError;
use crate::geometry::PixelRect;
use crate::stack::{BufferTarget, LayerStack};
use crate::log_info;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamKind {
    Float,
    Int,
    Bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ParamValue {
    Float(f32),
    Int(i32),
    Bool(bool),
}

impl ParamValue {
    pub fn kind(&self) -> ParamKind {
        match self {
            ParamValue::Float(_) => ParamKind::Float,
            ParamValue::Int(_) => ParamKind::Int,
            ParamValue::Bool(_) => ParamKind::Bool,
        }
    }

    pub fn as_f32(&self) -> f32 {
        match *self {
            ParamValue::Float(v) => v,
            ParamValue::Int(v) => v as f32,
            ParamValue::Bool(v) => v as u8 as f32,
        }
    }

    pub fn as_i32(&self) -> i32 {
        match *self {
            ParamValue::Float(v) => v.round() as i32,
            ParamValue::Int(v) => v,
            ParamValue::Bool(v) => v as i32,
        }
    }
}

/// Declared parameter: drives host UI and validation.
#[derive(Clone, Debug, PartialEq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub default: ParamValue,
    /// Inclusive numeric range (ignored for `Bool`).
    pub min: f32,
    pub max: f32,
}

impl ParamSpec {
    pub const fn float(name: &'static str, default: f32, min: f32, max: f32) -> Self {
        Self { name, kind: ParamKind::Float, default: ParamValue::Float(default), min, max }
    }

    pub const fn int(name: &'static str, default: i32, min: i32, max: i32) -> Self {
        Self { name, kind: ParamKind::Int, default: ParamValue::Int(default), min: min as f32, max: max as f32 }
    }
}

/// An image filter: region in, region of the same size out.
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;

    fn params(&self) -> Vec<ParamSpec>;

    /// How far (in pixels) outside a pixel the filter reads.  0 for
    /// per-pixel filters.
    fn radius(&self, _params: &[ParamValue]) -> u32 {
        0
    }

    /// `params` has already been validated against [`Filter::params`].
    fn apply(&self, src: &PixelBuffer, params: &[ParamValue]) -> Result<PixelBuffer, FilterError>;

    fn defaults(&self) -> Vec<ParamValue> {
        self.params().iter().map(|p| p.default).collect()
    }
}

/// Check `params` against the filter's schema.
pub fn validate(filter: &dyn Filter, params: &[ParamValue]) -> Result<(), FilterError> {
    let specs = filter.params();
    if specs.len() != params.len() {
        return Err(FilterError::bad_parameters(format!(
            "{} expects {} parameters, got {}",
            filter.name(),
            specs.len(),
            params.len()
        )));
    }
    for (spec, value) in specs.iter().zip(params) {
        if spec.kind != value.kind() {
            return Err(FilterError::bad_parameters(format!(
                "{}: '{}' must be {:?}",
                filter.name(),
                spec.name,
                spec.kind
            )));
        }
        if spec.kind != ParamKind::Bool {
            let v = value.as_f32();
            if !v.is_finite() || v < spec.min || v > spec.max {
                return Err(FilterError::bad_parameters(format!(
                    "{}: '{}' = {} outside [{}, {}]",
                    filter.name(),
                    spec.name,
                    v,
                    spec.min,
                    spec.max
                )));
            }
        }
    }
    Ok(())
}

/// Run a straight-alpha colour function over every pixel, keeping alpha.
fn map_straight<F>(src: &PixelBuffer, f: F) -> PixelBuffer
where
    F: Fn(f32, f32, f32) -> (f32, f32, f32) + Sync,
{
    let mut out = src.clone();
    let rect = out.rect();
    out.view_mut(rect).par_rows_mut().for_each(|(_, row)| {
        for px in row.chunks_exact_mut(4) {
            if px[3] == 0 {
                continue;
            }
            let s = blend::unpremultiply([px[0], px[1], px[2], px[3]]);
            let (r, g, b) = f(s[0] as f32, s[1] as f32, s[2] as f32);
            let q = |v: f32| v.round().clamp(0.0, 255.0) as u8;
            px.copy_from_slice(&blend::premultiply([q(r), q(g), q(b), s[3]]));
        }
    });
    out
}

// ----------------------------------------------------------------------------
// Built-ins
// ----------------------------------------------------------------------------

pub struct GaussianBlur;

impl Filter for GaussianBlur {
    fn name(&self) -> &str {
        "Gaussian Blur"
    }

    fn params(&self) -> Vec<ParamSpec> {
        vec![ParamSpec::float("sigma", 2.0, 0.0, 250.0)]
    }

    fn radius(&self, params: &[ParamValue]) -> u32 {
        params.first().map_or(0, |s| (s.as_f32() * 3.0).ceil().max(0.0) as u32)
    }

    fn apply(&self, src: &PixelBuffer, params: &[ParamValue]) -> Result<PixelBuffer, FilterError> {
        let sigma = params.first().map_or(0.0, ParamValue::as_f32);
        if sigma <= 0.0 {
            return Ok(src.clone());
        }
        // Premultiplied data blurs without dark fringes.
        let blurred = imageops::blur(src.as_image(), sigma);
        Ok(PixelBuffer::from_premultiplied(blurred))
    }
}

pub struct Invert;

impl Filter for Invert {
    fn name(&self) -> &str {
        "Invert Colors"
    }

    fn params(&self) -> Vec<ParamSpec> {
        Vec::new()
    }

    fn apply(&self, src: &PixelBuffer, _params: &[ParamValue]) -> Result<PixelBuffer, FilterError> {
        Ok(map_straight(src, |r, g, b| (255.0 - r, 255.0 - g, 255.0 - b)))
    }
}

pub struct Desaturate;

impl Filter for Desaturate {
    fn name(&self) -> &str {
        "Desaturate"
    }

    fn params(&self) -> Vec<ParamSpec> {
        Vec::new()
    }

    fn apply(&self, src: &PixelBuffer, _params: &[ParamValue]) -> Result<PixelBuffer, FilterError> {
        Ok(map_straight(src, |r, g, b| {
            let l = 0.299 * r + 0.587 * g + 0.114 * b;
            (l, l, l)
        }))
    }
}

pub struct Posterize;

impl Filter for Posterize {
    fn name(&self) -> &str {
        "Posterize"
    }

    fn params(&self) -> Vec<ParamSpec> {
        vec![ParamSpec::int("levels", 4, 2, 255)]
    }

    fn apply(&self, src: &PixelBuffer, params: &[ParamValue]) -> Result<PixelBuffer, FilterError> {
        let levels = params.first().map_or(4, ParamValue::as_i32).max(2) as f32;
        let step = 255.0 / (levels - 1.0);
        let q = move |v: f32| (v / step).round() * step;
        Ok(map_straight(src, move |r, g, b| (q(r), q(g), q(b))))
    }
}

pub struct BrightnessContrast;

impl Filter for BrightnessContrast {
    fn name(&self) -> &str {
        "Brightness/Contrast"
    }

    fn params(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::float("brightness", 0.0, -255.0, 255.0),
            ParamSpec::float("contrast", 0.0, -254.0, 254.0),
        ]
    }

    fn apply(&self, src: &PixelBuffer, params: &[ParamValue]) -> Result<PixelBuffer, FilterError> {
        let brightness = params.first().map_or(0.0, ParamValue::as_f32);
        let contrast = params.get(1).map_or(0.0, ParamValue::as_f32);
        let factor = (259.0 * (contrast + 255.0)) / (255.0 * (259.0 - contrast));
        let f = move |v: f32| factor * (v + brightness - 128.0) + 128.0;
        Ok(map_straight(src, move |r, g, b| (f(r), f(g), f(b))))
    }
}

pub fn builtin_filters() -> Vec<Arc<dyn Filter>> {
    vec![
        Arc::new(GaussianBlur),
        Arc::new(Invert),
        Arc::new(Desaturate),
        Arc::new(Posterize),
        Arc::new(BrightnessContrast),
    ]
}

pub fn find_filter(name: &str) -> Option<Arc<dyn Filter>> {
    builtin_filters().into_iter().find(|f| f.name().eq_ignore_ascii_case(name))
}

// ----------------------------------------------------------------------------
// Application
// ----------------------------------------------------------------------------

/// What a filter run needs, detached from the live document.
#[derive(Clone)]
pub struct FilterInput {
    pub target: BufferTarget,
    pub buffer: PixelBuffer,
    /// Selection restriction in target-local pixels.
    pub mask: Option<AlphaMask>,
}

impl FilterInput {
    /// Check the target and take private copies of its pixels and mask.
    /// Painting onto a selection restricts the filter to it.
    pub fn capture(stack: &LayerStack, target: BufferTarget) -> Result<Self, FilterError> {
        stack.check_paintable(target).map_err(LayerStack::reject)?;
        let (Some(buffer), Some(to_document)) = (stack.buffer_target(target), stack.target_transform(target))
        else {
            return Err(FilterError::Failed(format!("{:?} has no pixels", target)));
        };
        let mask = (target != BufferTarget::Selection && !stack.selection().mask_is_empty())
            .then(|| canvas::map_mask(&stack.selection().mask(), &to_document, buffer.width(), buffer.height()));
        Ok(Self { target, buffer: buffer.clone(), mask })
    }

    /// Rect the filter will change.
    pub fn region(&self) -> Option<PixelRect> {
        match &self.mask {
            None => Some(self.buffer.rect()).filter(|r| !r.is_empty()),
            Some(mask) => {
                let mut rect = PixelRect::EMPTY;
                for (x, y, v) in mask.enumerate_pixels() {
                    if v[0] > 0 {
                        rect = rect.union(&PixelRect::new(x as i32, y as i32, 1, 1));
                    }
                }
                (!rect.is_empty()).then_some(rect)
            }
        }
    }
}

#[inline]
fn mix(a: Premul, b: Premul, t: u8) -> Premul {
    match t {
        0 => a,
        255 => b,
        _ => {
            let t = t as f32 / 255.0;
            let m = |x: u8, y: u8| blend::to_u8(x as f32 + (y as f32 - x as f32) * t);
            [m(a[0], b[0]), m(a[1], b[1]), m(a[2], b[2]), m(a[3], b[3])]
        }
    }
}

/// Run `filter` over the input's region.  Returns the region and its new
/// pixels; the input itself is not modified.
pub fn run_filter(
    input: &FilterInput,
    filter: &dyn Filter,
    params: &[ParamValue],
) -> Result<Option<(PixelRect, PixelBuffer)>, FilterError> {
    validate(filter, params)?;
    let Some(region) = input.region() else { return Ok(None) };
    let radius = filter.radius(params) as i32;
    let source_rect = region.expanded(radius).intersect(&input.buffer.rect());
    let filtered = filter.apply(&input.buffer.copy_region(source_rect), params)?;
    if filtered.width() as i32 != source_rect.width || filtered.height() as i32 != source_rect.height {
        return Err(FilterError::Failed(format!(
            "{} returned {}x{} for a {}x{} region",
            filter.name(),
            filtered.width(),
            filtered.height(),
            source_rect.width,
            source_rect.height
        )));
    }

    let mut out = input.buffer.copy_region(region);
    let (ox, oy) = (region.x - source_rect.x, region.y - source_rect.y);
    for y in 0..region.height as u32 {
        for x in 0..region.width as u32 {
            let t = match &input.mask {
                Some(m) => m.get_pixel(region.x as u32 + x, region.y as u32 + y)[0],
                None => 255,
            };
            if t == 0 {
                continue;
            }
            let f = filtered.pixel(x + ox as u32, y + oy as u32);
            out.put_pixel(x, y, mix(out.pixel(x, y), f, t));
        }
    }
    Ok(Some((region, out)))
}

/// Write a filter result into the live target and record it for undo.
pub(crate) fn commit_result(
    stack: &mut LayerStack,
    history: &mut History,
    target: BufferTarget,
    region: PixelRect,
    pixels: &PixelBuffer,
    description: &str,
) -> bool {
    let Some(before) = PixelPatch::capture(stack, target, region) else { return false };
    let Some(buffer) = stack.buffer_target_mut(target) else { return false };
    buffer.write_region(pixels, region.x, region.y);
    if target == BufferTarget::Selection {
        stack.normalize_selection(region);
    }
    stack.notify_content(target, region);
    let pixels = stack.buffer_target(target).map_or_else(|| pixels.clone(), |b| b.copy_region(region));
    let after = PixelPatch { target, rect: region, pixels };
    history.push(Box::new(BrushCommand::new(description, before, after)));
    true
}

/// Apply a filter to a layer (or the selection) synchronously.  Returns the
/// changed rect, or `None` if there was nothing to filter.
pub fn apply_filter(
    stack: &mut LayerStack,
    history: &mut History,
    target: BufferTarget,
    filter: &dyn Filter,
    params: &[ParamValue],
) -> Result<Option<PixelRect>, FilterError> {
    let input = FilterInput::capture(stack, target)?;
    let Some((region, pixels)) = run_filter(&input, filter, params)? else { return Ok(None) };
    if !commit_result(stack, history, target, region, &pixels, filter.name()) {
        return Ok(None);
    }
    log_info!("Applied {} to {:?}", filter.name(), target);
    Ok(Some(region))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{BufferBacked, Layer};
    use crate::selection::{SelectionMode, SelectionShape};

    #[test]
    fn validation_checks_count_kind_and_range() {
        let blur = GaussianBlur;
        assert!(validate(&blur, &[ParamValue::Float(1.0)]).is_ok());
        assert!(matches!(validate(&blur, &[]), Err(FilterError::BadParameters(_))));
        assert!(matches!(validate(&blur, &[ParamValue::Int(1)]), Err(FilterError::BadParameters(_))));
        assert!(matches!(validate(&blur, &[ParamValue::Float(-1.0)]), Err(FilterError::BadParameters(_))));
        assert!(matches!(validate(&blur, &[ParamValue::Float(f32::NAN)]), Err(FilterError::BadParameters(_))));
    }

    #[test]
    fn invert_keeps_alpha() {
        let src = PixelBuffer::filled(2, 2, [255, 0, 0, 255]);
        let out = Invert.apply(&src, &[]).unwrap();
        assert_eq!(out.pixel(0, 0), [0, 255, 255, 255]);
        let clear = PixelBuffer::new(1, 1);
        assert_eq!(Invert.apply(&clear, &[]).unwrap().pixel(0, 0), [0, 0, 0, 0]);
    }

    #[test]
    fn posterize_two_levels_is_binary() {
        let src = PixelBuffer::filled(1, 1, [100, 200, 30, 255]);
        let out = Posterize.apply(&src, &[ParamValue::Int(2)]).unwrap();
        assert_eq!(out.pixel(0, 0), [0, 255, 0, 255]);
    }

    #[test]
    fn blur_radius_follows_sigma() {
        assert_eq!(GaussianBlur.radius(&[ParamValue::Float(2.0)]), 6);
        assert_eq!(Invert.radius(&[]), 0);
    }

    #[test]
    fn builtins_are_discoverable() {
        assert!(find_filter("posterize").is_some());
        assert!(find_filter("nope").is_none());
        for f in builtin_filters() {
            assert!(validate(f.as_ref(), &f.defaults()).is_ok(), "{}", f.name());
        }
    }

    #[test]
    fn apply_filter_respects_selection_and_undo() {
        let mut stack = LayerStack::new(10, 10);
        let mut h = History::default();
        let id = stack.add_layer(Layer::new_image("l", PixelBuffer::filled(10, 10, [255, 0, 0, 255])), None, 0, &mut h);
        stack.select(&SelectionShape::Rectangle(PixelRect::new(0, 0, 5, 10)), SelectionMode::Replace, &mut h);
        let rect = apply_filter(&mut stack, &mut h, BufferTarget::Layer(id), &Invert, &[]).unwrap();
        assert_eq!(rect, Some(PixelRect::new(0, 0, 5, 10)));
        let buf = stack.find(id).unwrap().as_image().unwrap().buffer().clone();
        assert_eq!(buf.pixel(2, 2), [0, 255, 255, 255]);
        assert_eq!(buf.pixel(7, 2), [255, 0, 0, 255]);
        h.undo(&mut stack);
        let buf = stack.find(id).unwrap().as_image().unwrap().buffer().clone();
        assert_eq!(buf.pixel(2, 2), [255, 0, 0, 255]);
    }

    #[test]
    fn selection_outside_generation_area_still_masks_filter() {
        let mut stack = LayerStack::new(10, 10);
        let mut h = History::default();
        let id = stack.add_layer(Layer::new_image("l", PixelBuffer::filled(10, 10, [255, 0, 0, 255])), None, 0, &mut h);
        stack.select(&SelectionShape::Rectangle(PixelRect::new(0, 0, 5, 10)), SelectionMode::Replace, &mut h);
        stack.set_generation_area(PixelRect::new(6, 0, 4, 10));
        let rect = apply_filter(&mut stack, &mut h, BufferTarget::Layer(id), &Invert, &[]).unwrap();
        assert_eq!(rect, Some(PixelRect::new(0, 0, 5, 10)));
        let buf = stack.find(id).unwrap().as_image().unwrap().buffer().clone();
        assert_eq!(buf.pixel(2, 2), [0, 255, 255, 255]);
        assert_eq!(buf.pixel(7, 2), [255, 0, 0, 255]);
    }

    #[test]
    fn apply_filter_rejects_locked_layer() {
        let mut stack = LayerStack::new(4, 4);
        let mut h = History::default();
        let id = stack.new_image_layer("l", &mut h);
        stack.set_locked(id, true, &mut h);
        let err = apply_filter(&mut stack, &mut h, BufferTarget::Layer(id), &Invert, &[]).unwrap_err();
        assert_eq!(err, FilterError::Edit(crate::error::EditError::Locked(id)));
    }
}
