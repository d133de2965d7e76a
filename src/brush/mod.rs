// ============================================================================
// BRUSH STROKE ENGINE
// ============================================================================
//
// Idle → Drawing → Idle.  Samples are buffered and painted when the flush
// deadline passes (the host calls `pump` from its event loop) or when the
// stroke ends.  Every segment is rasterised into a scratch coverage mask and
// merged into the target under the running-max rule: a pixel is rewritten
// from the pre-stroke snapshot only when the new segment covers it at least
// as strongly as anything earlier in the same stroke.

pub mod stamp;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::GrayImage;
use kurbo::{Point, Vec2};

use crate::blend::{self, BlendMode, Premul};
use crate::canvas::{self, AlphaMask, PixelBuffer};
use crate::components::history::{BrushCommand, History, PixelPatch};
use crate::error::EditError;
use crate::geometry::PixelRect;
use crate::layer::LayerId;
use crate::ops::filters::{Filter, ParamValue};
use crate::settings::EditorSettings;
use crate::stack::{BufferTarget, LayerStack};
use crate::transform::Transform;
use crate::{log_err, log_warn};

/// Per-tool brush parameters.  `size` is in document pixels.
#[derive(Clone, Debug)]
pub struct BrushSettings {
    pub size: f32,
    pub opacity: f32,
    /// 1.0 = hard edge.
    pub hardness: f32,
    /// Straight-alpha paint colour.
    pub color: [u8; 4],
    pub pressure_size: bool,
    pub pressure_opacity: bool,
    pub pressure_hardness: bool,
    pub eraser: bool,
    /// Tiled coverage gate applied to every segment.
    pub pattern: Option<Arc<GrayImage>>,
    pub smoothing_window: usize,
    pub flush_interval: Duration,
}

impl Default for BrushSettings {
    fn default() -> Self {
        Self::from_settings(&EditorSettings::default())
    }
}

impl BrushSettings {
    pub fn from_settings(settings: &EditorSettings) -> Self {
        Self {
            size: 10.0,
            opacity: 1.0,
            hardness: 1.0,
            color: [0, 0, 0, 255],
            pressure_size: true,
            pressure_opacity: false,
            pressure_hardness: false,
            eraser: false,
            pattern: None,
            smoothing_window: settings.smoothing_window,
            flush_interval: settings.stroke_flush_interval(),
        }
    }
}

/// What a stroke paints with.
#[derive(Clone)]
pub enum BrushTool {
    /// Flat colour (or erase).
    Flat,
    /// Copy from the pre-stroke snapshot displaced by `offset` local pixels.
    CloneStamp { offset: Vec2 },
    /// Paint the target's own pixels run through a filter.
    FilterBrush { filter: Arc<dyn Filter>, params: Vec<ParamValue> },
    /// Drag nearby pixels along the stroke.  `strength` in `[0, 1]`.
    Smudge { strength: f32 },
}

impl BrushTool {
    fn label(&self, eraser: bool) -> &'static str {
        match self {
            BrushTool::Flat if eraser => "Eraser",
            BrushTool::Flat => "Brush Stroke",
            BrushTool::CloneStamp { .. } => "Clone Stamp",
            BrushTool::FilterBrush { .. } => "Filter Brush",
            BrushTool::Smudge { .. } => "Smudge",
        }
    }
}

impl std::fmt::Debug for BrushTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrushTool::Flat => write!(f, "Flat"),
            BrushTool::CloneStamp { offset } => write!(f, "CloneStamp({:?})", offset),
            BrushTool::FilterBrush { filter, .. } => write!(f, "FilterBrush({})", filter.name()),
            BrushTool::Smudge { strength } => write!(f, "Smudge({})", strength),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrokeTarget {
    /// Whatever layer is active when the stroke starts.
    Active,
    Layer(LayerId),
    Selection,
}

/// One pointer event in document coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InputSample {
    pub position: Point,
    /// `None` for devices without pressure (treated as 1.0).
    pub pressure: Option<f32>,
    /// Reported but unused by the built-in tools.
    pub tilt: Option<Vec2>,
}

impl InputSample {
    pub fn at(x: f64, y: f64) -> Self {
        Self { position: Point::new(x, y), pressure: None, tilt: None }
    }

    pub fn with_pressure(mut self, pressure: f32) -> Self {
        self.pressure = Some(pressure);
        self
    }
}

/// Rolling averages of size/opacity/hardness.
#[derive(Debug, Default)]
struct Smoother {
    window: usize,
    recent: VecDeque<[f32; 3]>,
}

impl Smoother {
    fn new(window: usize) -> Self {
        Self { window, recent: VecDeque::with_capacity(window) }
    }

    /// Half raw value, half window mean.
    fn apply(&mut self, raw: [f32; 3]) -> [f32; 3] {
        if self.window <= 1 {
            return raw;
        }
        self.recent.push_back(raw);
        while self.recent.len() > self.window {
            self.recent.pop_front();
        }
        let n = self.recent.len() as f32;
        let mut mean = [0.0f32; 3];
        for v in &self.recent {
            for i in 0..3 {
                mean[i] += v[i] / n;
            }
        }
        [
            0.5 * raw[0] + 0.5 * mean[0],
            0.5 * raw[1] + 0.5 * mean[1],
            0.5 * raw[2] + 0.5 * mean[2],
        ]
    }
}

struct ActiveStroke {
    target: BufferTarget,
    /// Document → target-local pixels.
    to_local: Transform,
    previous_image: PixelBuffer,
    /// Strongest coverage written so far per pixel.
    accumulator: AlphaMask,
    /// Selection restriction in target-local pixels.
    input_mask: Option<AlphaMask>,
    alpha_locked: bool,
    /// Straight colour forced when painting the selection.
    selection_color: Option<[u8; 4]>,
    last_point: Option<Point>,
    pending: Vec<InputSample>,
    deadline: Option<Instant>,
    smoother: Smoother,
    dirty: PixelRect,
}

impl ActiveStroke {
    /// Paint one sample; returns the rect of pixels that changed.
    fn paint_sample(
        &mut self,
        settings: &BrushSettings,
        tool: &BrushTool,
        buffer: &mut PixelBuffer,
        sample: InputSample,
    ) -> PixelRect {
        let p = sample.pressure.unwrap_or(1.0).clamp(0.0, 1.0);
        let scaled = |v: f32, on: bool| if on { v * p } else { v };
        let [size, opacity, hardness] = self.smoother.apply([
            scaled(settings.size, settings.pressure_size),
            scaled(settings.opacity, settings.pressure_opacity),
            scaled(settings.hardness, settings.pressure_hardness),
        ]);
        let size = size * self.to_local.linear_scale() as f32;

        let to = self.to_local.map_point(sample.position);
        let from = self.last_point.replace(to).unwrap_or(to);
        let rect = stamp::segment_bounds(from, to, size).intersect(&buffer.rect());
        if rect.is_empty() {
            return PixelRect::EMPTY;
        }

        let mut coverage = stamp::segment_alpha(from, to, size, opacity, hardness.clamp(0.0, 1.0), rect);
        if let Some(pattern) = &settings.pattern {
            stamp::gate_with_pattern(&mut coverage, rect, pattern);
        }
        if let Some(mask) = &self.input_mask {
            for (x, y, v) in coverage.enumerate_pixels_mut() {
                let m = mask.get_pixel(rect.x as u32 + x, rect.y as u32 + y)[0] as u32;
                v[0] = ((v[0] as u32 * m + 127) / 255) as u8;
            }
        }

        let Some(content) = self.content(settings, tool, buffer, rect, from, to, &mut coverage) else {
            return PixelRect::EMPTY;
        };

        let erase = settings.eraser && matches!(tool, BrushTool::Flat);
        if erase && self.alpha_locked {
            return PixelRect::EMPTY;
        }

        let mut touched = PixelRect::EMPTY;
        for (cx, cy, cov) in coverage.enumerate_pixels() {
            let a = cov[0];
            if a == 0 {
                continue;
            }
            let (x, y) = (rect.x as u32 + cx, rect.y as u32 + cy);
            let acc = self.accumulator.get_pixel_mut(x, y);
            if a < acc[0] {
                continue;
            }
            acc[0] = a;
            let prev = self.previous_image.pixel(x, y);
            let src: Premul = content.pixel(cx, cy);
            let out = if erase {
                blend::destination_out(prev, a)
            } else if self.alpha_locked {
                blend::source_atop(prev, blend::scale_pixel(src, a as f32 / 255.0))
            } else {
                blend::blend_pixel(prev, src, BlendMode::Normal, a as f32 / 255.0)
            };
            if out != buffer.pixel(x, y) {
                buffer.put_pixel(x, y, out);
                touched = touched.union(&PixelRect::new(x as i32, y as i32, 1, 1));
            }
        }
        touched
    }

    /// Pixels the segment lays down over `rect`, one per coverage pixel.
    #[allow(clippy::too_many_arguments)]
    fn content(
        &self,
        settings: &BrushSettings,
        tool: &BrushTool,
        buffer: &PixelBuffer,
        rect: PixelRect,
        from: Point,
        to: Point,
        coverage: &mut GrayImage,
    ) -> Option<PixelBuffer> {
        let (w, h) = (rect.width as u32, rect.height as u32);
        match tool {
            BrushTool::Flat => {
                let color = self.selection_color.unwrap_or(settings.color);
                Some(PixelBuffer::filled(w, h, color))
            }
            BrushTool::CloneStamp { offset } => {
                let (dx, dy) = (offset.x.round() as i32, offset.y.round() as i32);
                Some(self.previous_image.copy_region(rect.translated(-dx, -dy)))
            }
            BrushTool::FilterBrush { filter, params } => {
                let radius = filter.radius(params) as i32;
                let source_rect = rect.expanded(radius).intersect(&self.previous_image.rect());
                let source = self.previous_image.copy_region(source_rect);
                match filter.apply(&source, params) {
                    Ok(filtered) => Some(filtered.copy_region(rect.translated(-source_rect.x, -source_rect.y))),
                    Err(e) => {
                        log_err!("Filter brush '{}' failed: {}", filter.name(), e);
                        None
                    }
                }
            }
            BrushTool::Smudge { strength } => {
                let d = to - from;
                let (dx, dy) = (d.x.round() as i32, d.y.round() as i32);
                let strength = strength.clamp(0.0, 1.0);
                for v in coverage.pixels_mut() {
                    v[0] = blend::to_u8(v[0] as f32 * strength);
                }
                Some(buffer.copy_region(rect.translated(-dx, -dy)))
            }
        }
    }
}

/// Stroke state machine bound to one brush configuration.
pub struct BrushEngine {
    settings: BrushSettings,
    tool: BrushTool,
    /// Restrict painting to the current selection.
    selection_only: bool,
    stroke: Option<ActiveStroke>,
}

impl BrushEngine {
    pub fn new(settings: BrushSettings, tool: BrushTool) -> Self {
        Self { settings, tool, selection_only: false, stroke: None }
    }

    pub fn settings(&self) -> &BrushSettings {
        &self.settings
    }

    /// Changes apply from the next segment.
    pub fn settings_mut(&mut self) -> &mut BrushSettings {
        &mut self.settings
    }

    pub fn tool(&self) -> &BrushTool {
        &self.tool
    }

    pub fn set_tool(&mut self, tool: BrushTool) {
        self.tool = tool;
    }

    pub fn set_selection_only(&mut self, on: bool) {
        self.selection_only = on;
    }

    pub fn is_drawing(&self) -> bool {
        self.stroke.is_some()
    }

    /// Whether buffered samples are waiting for the flush deadline.
    pub fn has_pending(&self) -> bool {
        self.stroke.as_ref().is_some_and(|s| !s.pending.is_empty())
    }

    fn resolve(stack: &LayerStack, target: StrokeTarget) -> Result<BufferTarget, EditError> {
        match target {
            StrokeTarget::Active => stack.active_target(),
            StrokeTarget::Layer(id) => Ok(BufferTarget::Layer(id)),
            StrokeTarget::Selection => Ok(BufferTarget::Selection),
        }
    }

    fn check(&self, stack: &LayerStack, target: BufferTarget) -> Result<(), EditError> {
        stack.check_paintable(target)?;
        if self.selection_only && target != BufferTarget::Selection && stack.selection().mask_is_empty() {
            return Err(EditError::EmptySelection);
        }
        Ok(())
    }

    /// Snapshot the target and enter Drawing.  Does nothing while a stroke is
    /// already in progress.
    pub fn start_stroke(&mut self, stack: &LayerStack, target: StrokeTarget) -> Result<(), EditError> {
        if self.stroke.is_some() {
            return Ok(());
        }
        let target = Self::resolve(stack, target).map_err(LayerStack::reject)?;
        self.check(stack, target).map_err(LayerStack::reject)?;

        let (Some(buffer), Some(to_document)) = (stack.buffer_target(target), stack.target_transform(target))
        else {
            return Err(LayerStack::reject(EditError::NoLayer));
        };
        let (w, h) = (buffer.width(), buffer.height());
        let input_mask = (self.selection_only && target != BufferTarget::Selection)
            .then(|| canvas::map_mask(&stack.selection().mask(), &to_document, w, h));
        let selection_color = (target == BufferTarget::Selection).then(|| stack.selection().color());

        self.stroke = Some(ActiveStroke {
            target,
            to_local: to_document.inverse(),
            previous_image: buffer.clone(),
            accumulator: GrayImage::new(w, h),
            input_mask,
            alpha_locked: stack.target_alpha_locked(target),
            selection_color,
            last_point: None,
            pending: Vec::new(),
            deadline: None,
            smoother: Smoother::new(self.settings.smoothing_window),
            dirty: PixelRect::EMPTY,
        });
        Ok(())
    }

    /// Queue a sample, starting a stroke on `target` if idle.  Rejected
    /// samples leave the document untouched.
    pub fn stroke_to(
        &mut self,
        stack: &mut LayerStack,
        target: StrokeTarget,
        sample: InputSample,
        now: Instant,
    ) -> Result<(), EditError> {
        match &self.stroke {
            Some(stroke) => self.check(stack, stroke.target).map_err(LayerStack::reject)?,
            None => self.start_stroke(stack, target)?,
        }
        let interval = self.settings.flush_interval;
        if let Some(stroke) = self.stroke.as_mut() {
            stroke.pending.push(sample);
            stroke.deadline.get_or_insert(now + interval);
        }
        if interval.is_zero() {
            self.flush(stack);
        }
        Ok(())
    }

    /// Paint buffered samples whose deadline has passed.  Returns the
    /// target-local rect that changed.
    pub fn pump(&mut self, stack: &mut LayerStack, now: Instant) -> PixelRect {
        let due = self
            .stroke
            .as_ref()
            .and_then(|s| s.deadline)
            .is_some_and(|d| d <= now);
        if due { self.flush(stack) } else { PixelRect::EMPTY }
    }

    /// Paint every buffered sample now.
    pub fn flush(&mut self, stack: &mut LayerStack) -> PixelRect {
        let Some(stroke) = self.stroke.as_mut() else { return PixelRect::EMPTY };
        stroke.deadline = None;
        let samples = std::mem::take(&mut stroke.pending);
        if samples.is_empty() {
            return PixelRect::EMPTY;
        }
        let target = stroke.target;
        let Some(buffer) = stack.buffer_target_mut(target) else {
            log_warn!("Stroke target {:?} disappeared; dropping {} samples", target, samples.len());
            return PixelRect::EMPTY;
        };
        let mut touched = PixelRect::EMPTY;
        for sample in samples {
            let r = stroke.paint_sample(&self.settings, &self.tool, buffer, sample);
            touched = touched.union(&r);
        }
        stroke.dirty = stroke.dirty.union(&touched);
        if !touched.is_empty() {
            if target == BufferTarget::Selection {
                stack.normalize_selection(touched);
            }
            stack.notify_content(target, touched);
        }
        touched
    }

    /// Flush, record one undo entry covering everything the stroke changed,
    /// and return to Idle.
    pub fn end_stroke(&mut self, stack: &mut LayerStack, history: &mut History) -> Option<PixelRect> {
        self.flush(stack);
        let stroke = self.stroke.take()?;
        if stroke.dirty.is_empty() {
            return None;
        }
        let before = PixelPatch::from_buffer(&stroke.previous_image, stroke.target, stroke.dirty);
        let Some(after) = PixelPatch::capture(stack, stroke.target, stroke.dirty) else {
            log_warn!("Stroke target {:?} disappeared before the stroke ended", stroke.target);
            return None;
        };
        let label = if stroke.target == BufferTarget::Selection {
            "Selection Brush"
        } else {
            self.tool.label(self.settings.eraser)
        };
        history.push(Box::new(BrushCommand::new(label, before, after)));
        Some(stroke.dirty)
    }

    /// Abandon the stroke, restoring the pre-stroke pixels.
    pub fn cancel(&mut self, stack: &mut LayerStack) {
        let Some(stroke) = self.stroke.take() else { return };
        if stroke.dirty.is_empty() {
            return;
        }
        PixelPatch::from_buffer(&stroke.previous_image, stroke.target, stroke.dirty).apply(stack);
    }
}
