use std::sync::Arc;
use std::time::{Duration, Instant};

use stackpaint::brush::{BrushEngine, BrushSettings, BrushTool, InputSample, StrokeTarget};
use stackpaint::canvas::PixelBuffer;
use stackpaint::components::history::History;
use stackpaint::layer::{BufferBacked, Layer};
use stackpaint::ops::filters::{self, Invert, ParamValue};
use stackpaint::ops::worker::{FilterWorker, JobOutcome};
use stackpaint::stack::{BufferTarget, LayerStack};

#[test]
#[should_panic(expected = "already in progress")]
fn nested_transaction_panics() {
    let mut h = History::default();
    h.begin_transaction("outer");
    h.begin_transaction("inner");
}

#[test]
fn transaction_undoes_as_one_step() {
    let mut stack = LayerStack::new(10, 10);
    let mut h = History::default();
    h.begin_transaction("Build");
    let a = stack.new_image_layer("a", &mut h);
    let b = stack.new_image_layer("b", &mut h);
    stack.set_opacity(a, 0.3, &mut h);
    h.end_transaction();
    assert_eq!(h.undo_count(), 1);
    assert_eq!(h.undo_description().as_deref(), Some("Build"));
    h.undo(&mut stack);
    assert!(!stack.contains(a) && !stack.contains(b));
    h.redo(&mut stack);
    assert!(stack.contains(a) && stack.contains(b));
    assert_eq!(stack.find(a).unwrap().opacity(), 0.3);
}

#[test]
fn stroke_during_filter_job_discards_result() {
    let mut stack = LayerStack::new(24, 24);
    let mut h = History::default();
    let id = stack.add_layer(Layer::new_image("l", PixelBuffer::filled(24, 24, [200, 100, 50, 255])), None, 0, &mut h);
    let mut worker = FilterWorker::new();
    worker.submit(&stack, BufferTarget::Layer(id), Arc::new(Invert), vec![]).unwrap();

    let mut brush = BrushEngine::new(
        BrushSettings { flush_interval: Duration::ZERO, ..BrushSettings::default() },
        BrushTool::Flat,
    );
    brush.stroke_to(&mut stack, StrokeTarget::Layer(id), InputSample::at(12.0, 12.0), Instant::now()).unwrap();
    brush.end_stroke(&mut stack, &mut h).unwrap();
    let painted = stack.find(id).unwrap().as_image().unwrap().buffer().clone();

    let outcomes = worker.wait(&mut stack, &mut h);
    assert!(matches!(outcomes[..], [JobOutcome::Discarded { .. }]));
    assert_eq!(stack.find(id).unwrap().as_image().unwrap().buffer().raw(), painted.raw());
}

#[test]
fn synchronous_filter_then_undo() {
    let mut stack = LayerStack::new(8, 8);
    let mut h = History::default();
    let id = stack.add_layer(Layer::new_image("l", PixelBuffer::filled(8, 8, [10, 20, 30, 255])), None, 0, &mut h);
    let blur = filters::find_filter("Gaussian Blur").unwrap();
    let params = [ParamValue::Float(2.0)];
    let rect = filters::apply_filter(&mut stack, &mut h, BufferTarget::Layer(id), blur.as_ref(), &params).unwrap();
    assert!(rect.is_some());
    assert!(stack.find(id).unwrap().as_image().unwrap().buffer().pixel(4, 4)[3] >= 250);
    h.undo(&mut stack);
    assert_eq!(stack.find(id).unwrap().as_image().unwrap().buffer().pixel(0, 0), [10, 20, 30, 255]);
}
