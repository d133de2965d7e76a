use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use image::codecs::png::PngEncoder;
use image::{ImageEncoder, ImageFormat, RgbaImage};
use kurbo::Vec2;
use serde::{Deserialize, Serialize};

use crate::blend::BlendMode;
use crate::canvas::PixelBuffer;
use crate::error::{FormatError, FormatResult};
use crate::geometry::PixelRect;
use crate::layer::{BufferBacked, ContainerLike, Layer, LayerId, LayerKind, TransformCapable};
use crate::settings::EditorSettings;
use crate::stack::LayerStack;
use crate::transform::Transform;
use crate::{log_info, log_warn};

// ============================================================================
// STACK DESCRIPTION — OpenRaster-style tree of attributes plus named payloads
// ============================================================================

/// Attributes every node carries.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct NodeAttributes {
    pub name: String,
    pub visible: bool,
    pub opacity: f32,
    /// OpenRaster `composite-op` value.
    pub composite_op: String,
    pub locked: bool,
}

/// A raster leaf.  `x`/`y` is the integer position of the layer's bounding
/// box; readers that understand `transform` use it together with the
/// untransformed `src` image instead.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LeafDescription {
    pub attrs: NodeAttributes,
    pub src: String,
    pub x: i32,
    pub y: i32,
    pub transform: Option<[f64; 6]>,
    pub alpha_locked: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GroupDescription {
    pub attrs: NodeAttributes,
    pub isolate: bool,
    pub offset: [f64; 2],
    /// Topmost first.
    pub children: Vec<NodeDescription>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum NodeDescription {
    Leaf(LeafDescription),
    Group(GroupDescription),
}

impl NodeDescription {
    fn count(&self) -> usize {
        match self {
            NodeDescription::Leaf(_) => 1,
            NodeDescription::Group(g) => 1 + g.children.iter().map(Self::count).sum::<usize>(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StackDescription {
    pub width: u32,
    pub height: u32,
    pub selection_color: [u8; 4],
    pub generation_area: PixelRect,
    /// Children of the root group, topmost first.
    pub layers: Vec<NodeDescription>,
    /// Position of the active layer in `layers` order, depth first.
    pub active: Option<usize>,
}

/// Decoded leaf images keyed by `src`, in the engine's premultiplied form.
pub type ImagePayloads = HashMap<String, PixelBuffer>;

fn attributes(layer: &Layer) -> NodeAttributes {
    NodeAttributes {
        name: layer.name().to_string(),
        visible: layer.is_visible(),
        opacity: layer.opacity(),
        composite_op: layer.mode().composite_op().to_string(),
        locked: layer.is_locked(),
    }
}

/// Describe the tree.  Text layers are written as their rendered raster.
pub fn describe(stack: &LayerStack) -> (StackDescription, ImagePayloads) {
    let mut images = ImagePayloads::new();
    let mut order = Vec::new();
    let layers = describe_children(stack.root(), &mut images, &mut order);
    let active = stack.active_layer().and_then(|a| order.iter().position(|id| *id == a));
    let desc = StackDescription {
        width: stack.width(),
        height: stack.height(),
        selection_color: stack.selection().color(),
        generation_area: stack.selection().generation_area(),
        layers,
        active,
    };
    (desc, images)
}

fn describe_children(group: &Layer, images: &mut ImagePayloads, order: &mut Vec<LayerId>) -> Vec<NodeDescription> {
    let Some(children) = group.as_container().map(|c| c.children()) else {
        return Vec::new();
    };
    children.iter().map(|child| describe_node(child, images, order)).collect()
}

fn describe_node(layer: &Layer, images: &mut ImagePayloads, order: &mut Vec<LayerId>) -> NodeDescription {
    order.push(layer.id());
    match layer.kind() {
        LayerKind::Group(g) => NodeDescription::Group(GroupDescription {
            attrs: attributes(layer),
            isolate: g.isolate(),
            offset: [g.offset().x, g.offset().y],
            children: describe_children(layer, images, order),
        }),
        LayerKind::Image(img) => describe_leaf(layer, img.buffer(), img.transform(), img.alpha_locked(), images),
        LayerKind::Text(text) => describe_leaf(layer, text.rendered(), text.transform(), false, images),
    }
}

fn describe_leaf(
    layer: &Layer,
    pixels: &PixelBuffer,
    transform: Transform,
    alpha_locked: bool,
    images: &mut ImagePayloads,
) -> NodeDescription {
    let src = format!("data/layer{}.png", images.len());
    images.insert(src.clone(), pixels.clone());
    let placed = layer.bounds();
    NodeDescription::Leaf(LeafDescription {
        attrs: attributes(layer),
        src,
        x: placed.x,
        y: placed.y,
        transform: match transform.integer_translation() {
            Some(_) => None,
            None => Some(transform.coeffs()),
        },
        alpha_locked,
    })
}

/// Build a fresh stack from a description.  Nothing outside the returned
/// stack is touched, so a failure here leaves any open document intact.
pub fn rebuild(desc: &StackDescription, images: &ImagePayloads) -> FormatResult<LayerStack> {
    check_dimensions(desc.width, desc.height)?;
    let nodes: usize = desc.layers.iter().map(NodeDescription::count).sum();
    if nodes > MAX_LAYERS {
        return Err(FormatError::InvalidFormat(format!(
            "Project contains {} layers, which exceeds the maximum of {}",
            nodes, MAX_LAYERS
        )));
    }

    let settings = EditorSettings { selection_color: desc.selection_color, ..EditorSettings::default() };
    let mut stack = LayerStack::with_settings(desc.width, desc.height, &settings);
    let mut order = Vec::with_capacity(nodes);
    let root = stack.root_id();
    for (index, node) in desc.layers.iter().enumerate() {
        rebuild_node(&mut stack, root, index, node, images, &mut order)?;
    }
    stack.set_generation_area(desc.generation_area);
    if let Some(id) = desc.active.and_then(|i| order.get(i).copied()) {
        stack.set_active_layer(Some(id));
    }
    Ok(stack)
}

fn apply_attributes(layer: &mut Layer, attrs: &NodeAttributes) -> FormatResult<()> {
    if !attrs.opacity.is_finite() {
        return Err(FormatError::InvalidFormat(format!("layer '{}' has a non-finite opacity", attrs.name)));
    }
    layer.set_visible(attrs.visible);
    layer.set_opacity(attrs.opacity);
    layer.set_mode(BlendMode::from_composite_op(&attrs.composite_op));
    layer.set_locked(attrs.locked);
    Ok(())
}

fn rebuild_node(
    stack: &mut LayerStack,
    parent: LayerId,
    index: usize,
    node: &NodeDescription,
    images: &ImagePayloads,
    order: &mut Vec<LayerId>,
) -> FormatResult<()> {
    match node {
        NodeDescription::Leaf(leaf) => {
            let pixels = images.get(&leaf.src).ok_or_else(|| FormatError::MissingImage(leaf.src.clone()))?;
            let transform = match leaf.transform {
                Some(c) => Transform::new_checked(kurbo::Affine::new(c)).ok_or_else(|| {
                    FormatError::InvalidFormat(format!("layer '{}' has a singular transform", leaf.attrs.name))
                })?,
                None => Transform::translation(leaf.x as f64, leaf.y as f64),
            };
            let mut layer = Layer::new_image(leaf.attrs.name.clone(), pixels.clone());
            apply_attributes(&mut layer, &leaf.attrs)?;
            if let Some(img) = layer.as_image_mut() {
                img.set_transform(transform);
                img.set_alpha_locked(leaf.alpha_locked);
            }
            order.push(stack.attach(parent, index, layer));
        }
        NodeDescription::Group(group) => {
            let offset = Vec2::new(group.offset[0], group.offset[1]);
            if !offset.x.is_finite() || !offset.y.is_finite() {
                return Err(FormatError::InvalidFormat(format!("group '{}' has a non-finite offset", group.attrs.name)));
            }
            let mut layer = Layer::new_group(group.attrs.name.clone());
            apply_attributes(&mut layer, &group.attrs)?;
            if let Some(g) = layer.as_group_mut() {
                g.set_isolate(group.isolate);
                g.set_offset(offset);
            }
            let id = stack.attach(parent, index, layer);
            order.push(id);
            for (i, child) in group.children.iter().enumerate() {
                rebuild_node(stack, id, i, child, images, order)?;
            }
        }
    }
    Ok(())
}

// ============================================================================
// SPK PROJECT FILE FORMAT
// ============================================================================

const SPK_MAGIC: &str = "SPK1";

/// Maximum supported canvas dimension in pixels (per axis).
/// Prevents memory exhaustion from crafted project files.
const MAX_CANVAS_DIM: u32 = 32_768;
/// Maximum number of nodes (layers and groups) in a project file.
const MAX_LAYERS: usize = 4096;

/// Serializable project container.  Images are PNG with straight alpha.
#[derive(Serialize, Deserialize)]
struct ProjectFile {
    magic: String,
    stack: StackDescription,
    images: Vec<(String, Vec<u8>)>,
    selection: Vec<u8>,
    merged: Vec<u8>,
    thumbnail: Vec<u8>,
}

fn check_dimensions(width: u32, height: u32) -> FormatResult<()> {
    if width == 0 || height == 0 {
        return Err(FormatError::InvalidFormat("Canvas dimensions cannot be zero".into()));
    }
    if width > MAX_CANVAS_DIM || height > MAX_CANVAS_DIM {
        return Err(FormatError::InvalidFormat(format!(
            "Canvas size {}x{} exceeds maximum allowed {}x{}",
            width, height, MAX_CANVAS_DIM, MAX_CANVAS_DIM
        )));
    }
    Ok(())
}

/// Encode straight-alpha pixels as PNG.  Empty images encode to no bytes.
fn encode_png(image: &RgbaImage) -> FormatResult<Vec<u8>> {
    let mut bytes = Vec::new();
    if image.width() == 0 || image.height() == 0 {
        return Ok(bytes);
    }
    PngEncoder::new(&mut bytes).write_image(image.as_raw(), image.width(), image.height(), image::ColorType::Rgba8)?;
    Ok(bytes)
}

fn decode_png(bytes: &[u8]) -> FormatResult<PixelBuffer> {
    if bytes.is_empty() {
        return Ok(PixelBuffer::new(0, 0));
    }
    let img = image::load_from_memory_with_format(bytes, ImageFormat::Png)?.to_rgba8();
    check_dimensions(img.width(), img.height())?;
    Ok(PixelBuffer::from_straight(img))
}

/// Serialize the document, its merged render and a thumbnail.
pub fn encode_project(stack: &LayerStack, thumbnail_max_edge: u32) -> FormatResult<Vec<u8>> {
    let (desc, payloads) = describe(stack);
    let mut images = Vec::with_capacity(payloads.len());
    let mut names: Vec<&String> = payloads.keys().collect();
    names.sort();
    for name in names {
        images.push((name.clone(), encode_png(&payloads[name].to_straight())?));
    }
    let project = ProjectFile {
        magic: SPK_MAGIC.to_string(),
        stack: desc,
        images,
        selection: encode_png(&stack.selection().buffer().to_straight())?,
        merged: encode_png(&stack.render().to_straight())?,
        thumbnail: encode_png(&stack.thumbnail(thumbnail_max_edge))?,
    };
    Ok(bincode::serialize(&project)?)
}

/// Parse a project container into a new stack.
pub fn decode_project(raw: &[u8]) -> FormatResult<LayerStack> {
    if raw.len() < 12 {
        return Err(FormatError::InvalidFormat("File too small".into()));
    }
    // bincode encodes a String as: 8-byte length prefix + UTF-8 data.
    // The magic is 4 chars, so bytes 8..12 hold it.
    let magic = std::str::from_utf8(&raw[8..12]).unwrap_or("");
    if magic != SPK_MAGIC {
        return Err(FormatError::InvalidFormat(format!("Unknown magic '{}'", magic)));
    }

    let project: ProjectFile = bincode::deserialize(raw)?;
    check_dimensions(project.stack.width, project.stack.height)?;
    let mut images = ImagePayloads::with_capacity(project.images.len());
    for (name, bytes) in &project.images {
        images.insert(name.clone(), decode_png(bytes)?);
    }
    let mut stack = rebuild(&project.stack, &images)?;

    let selection = decode_png(&project.selection)?;
    if selection.width() == stack.width() && selection.height() == stack.height() {
        if let Some(buf) = stack.buffer_target_mut(crate::stack::BufferTarget::Selection) {
            *buf = selection;
        }
        let rect = stack.rect();
        stack.normalize_selection(rect);
    } else {
        log_warn!(
            "Ignoring selection of size {}x{} in a {}x{} project",
            selection.width(),
            selection.height(),
            stack.width(),
            stack.height()
        );
    }
    Ok(stack)
}

/// Save a stack as a `.spk` project file.
pub fn save_project(stack: &LayerStack, path: &Path, thumbnail_max_edge: u32) -> FormatResult<()> {
    let bytes = encode_project(stack, thumbnail_max_edge)?;
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&bytes)?;
    writer.flush()?;
    log_info!("Saved project {} ({} layers)", path.display(), stack.layer_count());
    Ok(())
}

/// Load a `.spk` project file into a new stack.
pub fn load_project(path: &Path) -> FormatResult<LayerStack> {
    let raw = std::fs::read(path)?;
    let stack = decode_project(&raw)?;
    log_info!(
        "Loaded project {} ({}x{}, {} layers)",
        path.display(),
        stack.width(),
        stack.height(),
        stack.layer_count()
    );
    Ok(stack)
}

/// Load `path` over an existing stack.  The stack is only replaced once the
/// whole file has been read and validated; its observers are kept.
pub fn load_project_into(stack: &mut LayerStack, path: &Path) -> FormatResult<()> {
    let loaded = load_project(path)?;
    stack.replace_with(loaded);
    Ok(())
}

/// Read just the merged preview image from a project container.
pub fn read_merged_preview(raw: &[u8]) -> FormatResult<RgbaImage> {
    let project: ProjectFile = bincode::deserialize(raw)?;
    if project.magic != SPK_MAGIC {
        return Err(FormatError::InvalidFormat(format!("Unknown magic '{}'", project.magic)));
    }
    Ok(decode_png(&project.merged)?.to_straight())
}

/// Decode a PNG file into a straight-alpha image for use as a new layer.
pub fn read_png(bytes: &[u8]) -> FormatResult<PixelBuffer> {
    decode_png(bytes)
}

/// Encode a buffer as PNG with straight alpha.
pub fn write_png(buffer: &PixelBuffer) -> FormatResult<Vec<u8>> {
    encode_png(&buffer.to_straight())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::history::History;
    use crate::selection::{SelectionMode, SelectionShape};

    fn sample_stack() -> LayerStack {
        let mut stack = LayerStack::new(32, 24);
        let mut h = History::default();
        let bg = stack.add_layer(Layer::new_image("bg", PixelBuffer::filled(32, 24, [200, 200, 200, 255])), None, 0, &mut h);
        let group = stack.new_group("fx", &mut h);
        stack.set_isolate(group, true, &mut h);
        stack.set_offset(group, Vec2::new(3.0, 2.0), &mut h);
        let dot = stack.add_layer(
            Layer::new_image("dot", PixelBuffer::filled(4, 4, [255, 0, 0, 128])),
            Some(group),
            0,
            &mut h,
        );
        stack.set_transform(dot, Transform::rotation_degrees(30.0).then(&Transform::translation(10.0, 5.0)), &mut h);
        stack.set_mode(dot, BlendMode::Multiply, &mut h);
        stack.set_opacity(dot, 0.5, &mut h);
        stack.set_locked(bg, true, &mut h);
        stack.select(&SelectionShape::Rectangle(PixelRect::new(2, 2, 5, 5)), SelectionMode::Replace, &mut h);
        stack
    }

    #[test]
    fn description_round_trips_the_tree() {
        let stack = sample_stack();
        let (desc, images) = describe(&stack);
        let rebuilt = rebuild(&desc, &images).unwrap();
        let (again, _) = describe(&rebuilt);
        assert_eq!(desc.layers, again.layers);
        assert_eq!(rebuilt.render().raw(), stack.render().raw());
    }

    #[test]
    fn integer_positions_omit_the_transform() {
        let mut stack = LayerStack::new(16, 16);
        let mut h = History::default();
        let id = stack.add_layer(Layer::new_image("a", PixelBuffer::filled(2, 2, [1, 1, 1, 255])), None, 0, &mut h);
        stack.translate_layer(id, 4.0, 7.0, &mut h);
        let (desc, _) = describe(&stack);
        match &desc.layers[0] {
            NodeDescription::Leaf(leaf) => {
                assert_eq!((leaf.x, leaf.y), (4, 7));
                assert!(leaf.transform.is_none());
            }
            other => panic!("expected a leaf, got {:?}", other),
        }
    }

    #[test]
    fn container_round_trips_pixels_and_selection() {
        let stack = sample_stack();
        let bytes = encode_project(&stack, 16).unwrap();
        let loaded = decode_project(&bytes).unwrap();
        assert_eq!((loaded.width(), loaded.height()), (32, 24));
        assert_eq!(loaded.layer_count(), stack.layer_count());
        assert_eq!(loaded.selection().bounds(), Some(PixelRect::new(2, 2, 5, 5)));
        let preview = read_merged_preview(&bytes).unwrap();
        assert_eq!((preview.width(), preview.height()), (32, 24));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = encode_project(&sample_stack(), 16).unwrap();
        bytes[8] = b'X';
        assert!(matches!(decode_project(&bytes), Err(FormatError::InvalidFormat(_))));
        assert!(matches!(decode_project(&[0u8; 4]), Err(FormatError::InvalidFormat(_))));
    }

    #[test]
    fn missing_payload_is_reported() {
        let (desc, mut images) = describe(&sample_stack());
        images.clear();
        assert!(matches!(rebuild(&desc, &images), Err(FormatError::MissingImage(_))));
    }

    #[test]
    fn singular_transform_is_a_format_error() {
        let (mut desc, images) = describe(&sample_stack());
        if let NodeDescription::Leaf(leaf) = &mut desc.layers[1] {
            leaf.transform = Some([0.0, 0.0, 0.0, 0.0, 1.0, 1.0]);
        }
        assert!(matches!(rebuild(&desc, &images), Err(FormatError::InvalidFormat(_))));
    }

    #[test]
    fn oversized_canvas_is_rejected() {
        let (mut desc, images) = describe(&sample_stack());
        desc.width = MAX_CANVAS_DIM + 1;
        assert!(matches!(rebuild(&desc, &images), Err(FormatError::InvalidFormat(_))));
    }
}
