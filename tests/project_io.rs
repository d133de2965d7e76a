use kurbo::Vec2;
use stackpaint::blend::BlendMode;
use stackpaint::canvas::PixelBuffer;
use stackpaint::components::history::History;
use stackpaint::error::FormatError;
use stackpaint::geometry::PixelRect;
use stackpaint::io;
use stackpaint::layer::Layer;
use stackpaint::project::Project;
use stackpaint::selection::{SelectionMode, SelectionShape};
use stackpaint::settings::EditorSettings;
use stackpaint::stack::{LayerEvent, LayerStack};
use stackpaint::transform::Transform;

use std::cell::Cell;
use std::rc::Rc;

fn document() -> LayerStack {
    let mut stack = LayerStack::new(48, 32);
    let mut h = History::default();
    stack.add_layer(Layer::new_image("paper", PixelBuffer::filled(48, 32, [250, 245, 230, 255])), None, 0, &mut h);
    let group = stack.new_group("ink", &mut h);
    stack.set_isolate(group, true, &mut h);
    stack.set_opacity(group, 0.75, &mut h);
    stack.set_offset(group, Vec2::new(4.0, -2.0), &mut h);
    let stroke = stack.add_layer(
        Layer::new_image("stroke", PixelBuffer::filled(10, 6, [20, 20, 120, 255])),
        Some(group),
        0,
        &mut h,
    );
    stack.set_transform(stroke, Transform::scale(1.5, 0.5).then(&Transform::translation(8.0, 9.0)), &mut h);
    stack.set_mode(stroke, BlendMode::Multiply, &mut h);
    let hidden = stack.add_layer(Layer::new_blank("hidden", 48, 32), None, 0, &mut h);
    stack.set_visible(hidden, false, &mut h);
    stack.set_active_layer(Some(stroke));
    stack
}

#[test]
fn project_bytes_round_trip() {
    let stack = document();
    let bytes = io::encode_project(&stack, 64).unwrap();
    let loaded = io::decode_project(&bytes).unwrap();

    let (a, _) = io::describe(&stack);
    let (b, _) = io::describe(&loaded);
    assert_eq!(a, b);
    let active = loaded.active_layer().unwrap();
    assert_eq!(loaded.find(active).unwrap().name(), "stroke");

    let (x, y) = (2, 2);
    assert_eq!(loaded.render().pixel(x, y), stack.render().pixel(x, y));
}

#[test]
fn failed_load_keeps_existing_document() {
    let path = std::env::temp_dir().join(format!("stackpaint-corrupt-{}.spk", uuid::Uuid::new_v4()));
    std::fs::write(&path, b"\x04\0\0\0\0\0\0\0SPK1garbage").unwrap();

    let mut stack = document();
    let count = stack.layer_count();
    let before = stack.render();
    let result = io::load_project_into(&mut stack, &path);
    assert!(matches!(result, Err(FormatError::Serialize(_))));
    assert_eq!(stack.layer_count(), count);
    assert_eq!(stack.render().raw(), before.raw());
    let _ = std::fs::remove_file(&path);
}

#[test]
fn loading_over_a_stack_keeps_observers() {
    let path = std::env::temp_dir().join(format!("stackpaint-observe-{}.spk", uuid::Uuid::new_v4()));
    io::save_project(&document(), &path, 32).unwrap();

    let mut stack = LayerStack::new(5, 5);
    let renders = Rc::new(Cell::new(0));
    let seen = renders.clone();
    stack.subscribe(move |event| {
        if matches!(event, LayerEvent::RenderNeeded { .. }) {
            seen.set(seen.get() + 1);
        }
    });
    io::load_project_into(&mut stack, &path).unwrap();
    assert_eq!((stack.width(), stack.height()), (48, 32));
    assert!(renders.get() > 0);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn project_tracks_dirty_state_through_save() {
    let path = std::env::temp_dir().join(format!("stackpaint-project-{}.spk", uuid::Uuid::new_v4()));
    let settings = EditorSettings::default();
    let mut project = Project::new_untitled_with_settings(2, 20, 20, &settings);
    project.edit(|stack, h| stack.new_image_layer("sketch", h));
    project.edit(|stack, h| {
        stack.select(&SelectionShape::Rectangle(PixelRect::new(1, 1, 4, 4)), SelectionMode::Replace, h)
    });
    assert!(project.display_title().ends_with('*'));
    project.save_as(&path).unwrap();
    assert!(!project.display_title().ends_with('*'));

    project.undo();
    assert!(project.is_dirty);

    let reopened = Project::open(&path, &settings).unwrap();
    assert_eq!(reopened.stack.layer_count(), 1);
    assert_eq!(reopened.stack.selection().bounds(), Some(PixelRect::new(1, 1, 4, 4)));
    let _ = std::fs::remove_file(&path);
}
