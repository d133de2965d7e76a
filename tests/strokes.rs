use std::time::{Duration, Instant};

use stackpaint::brush::{BrushEngine, BrushSettings, BrushTool, InputSample, StrokeTarget};
use stackpaint::canvas::PixelBuffer;
use stackpaint::components::history::History;
use stackpaint::error::EditError;
use stackpaint::layer::{BufferBacked, Layer, LayerId};
use stackpaint::stack::LayerStack;

fn immediate(settings: BrushSettings) -> BrushEngine {
    BrushEngine::new(
        BrushSettings { flush_interval: Duration::ZERO, smoothing_window: 1, ..settings },
        BrushTool::Flat,
    )
}

fn layer_pixels(stack: &LayerStack, id: LayerId) -> PixelBuffer {
    stack.find(id).unwrap().as_image().unwrap().buffer().clone()
}

fn paint_path(points: &[(f64, f64)]) -> PixelBuffer {
    let mut stack = LayerStack::new(60, 40);
    let mut h = History::default();
    let id = stack.new_image_layer("paint", &mut h);
    let mut brush = immediate(BrushSettings {
        size: 12.0,
        opacity: 0.5,
        hardness: 0.3,
        color: [20, 40, 200, 255],
        ..BrushSettings::default()
    });
    let now = Instant::now();
    for &(x, y) in points {
        brush.stroke_to(&mut stack, StrokeTarget::Layer(id), InputSample::at(x, y), now).unwrap();
    }
    brush.end_stroke(&mut stack, &mut h).unwrap();
    layer_pixels(&stack, id)
}

#[test]
fn retracing_a_stroke_does_not_darken() {
    let once = paint_path(&[(10.0, 20.0), (50.0, 20.0)]);
    let twice = paint_path(&[(10.0, 20.0), (50.0, 20.0), (10.0, 20.0), (50.0, 20.0)]);
    assert_eq!(once.raw(), twice.raw());
    let max_alpha = twice.raw().chunks_exact(4).map(|p| p[3]).max().unwrap();
    assert!(max_alpha <= 128, "max alpha {}", max_alpha);
}

#[test]
fn alpha_lock_never_adds_coverage() {
    let mut stack = LayerStack::new(40, 20);
    let mut h = History::default();
    let mut src = PixelBuffer::new(40, 20);
    for y in 0..20 {
        for x in 0..20 {
            src.put_pixel(x, y, [0, 255, 0, 255]);
        }
    }
    let id = stack.add_layer(Layer::new_image("half", src.clone()), None, 0, &mut h);
    stack.set_alpha_locked(id, true, &mut h);

    let mut brush = immediate(BrushSettings { size: 10.0, color: [255, 0, 0, 255], ..BrushSettings::default() });
    let now = Instant::now();
    for x in [2.0, 12.0, 22.0, 32.0, 38.0] {
        brush.stroke_to(&mut stack, StrokeTarget::Layer(id), InputSample::at(x, 10.0), now).unwrap();
    }
    brush.end_stroke(&mut stack, &mut h).unwrap();

    let after = layer_pixels(&stack, id);
    for (before_px, after_px) in src.raw().chunks_exact(4).zip(after.raw().chunks_exact(4)) {
        if before_px[3] == 0 {
            assert_eq!(after_px[3], 0);
        }
    }
    assert_eq!(after.pixel(12, 10), [255, 0, 0, 255]);
}

#[test]
fn locked_layer_rejects_stroke_untouched() {
    let mut stack = LayerStack::new(30, 30);
    let mut h = History::default();
    let id = stack.add_layer(Layer::new_image("bg", PixelBuffer::filled(30, 30, [9, 8, 7, 255])), None, 0, &mut h);
    stack.set_locked(id, true, &mut h);
    let before = layer_pixels(&stack, id);

    let mut brush = immediate(BrushSettings::default());
    assert_eq!(brush.start_stroke(&stack, StrokeTarget::Layer(id)), Err(EditError::Locked(id)));
    let err = brush
        .stroke_to(&mut stack, StrokeTarget::Layer(id), InputSample::at(15.0, 15.0), Instant::now())
        .unwrap_err();
    assert_eq!(err, EditError::Locked(id));
    assert!(!err.to_string().is_empty());
    assert!(brush.end_stroke(&mut stack, &mut h).is_none());
    assert_eq!(layer_pixels(&stack, id).raw(), before.raw());
}

#[test]
fn locked_group_blocks_its_children() {
    let mut stack = LayerStack::new(20, 20);
    let mut h = History::default();
    let group = stack.new_group("g", &mut h);
    let child = stack.add_layer(Layer::new_blank("c", 20, 20), Some(group), 0, &mut h);
    stack.set_locked(group, true, &mut h);
    let mut brush = immediate(BrushSettings::default());
    assert!(matches!(brush.start_stroke(&stack, StrokeTarget::Layer(child)), Err(EditError::Locked(_))));
}

#[test]
fn hidden_layer_rejects_stroke() {
    let mut stack = LayerStack::new(20, 20);
    let mut h = History::default();
    let id = stack.new_image_layer("paint", &mut h);
    stack.set_visible(id, false, &mut h);
    let mut brush = immediate(BrushSettings::default());
    assert_eq!(brush.start_stroke(&stack, StrokeTarget::Active), Err(EditError::Hidden(id)));
}
