// ============================================================================
// LAYER DATA MODEL — common properties plus a closed set of layer kinds
// ============================================================================

mod group;
mod image_layer;
mod text;

pub use group::LayerGroup;
pub use image_layer::ImageLayer;
pub use text::{TextLayer, TextStyle};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::blend::BlendMode;
use crate::canvas::PixelBuffer;
use crate::geometry::PixelRect;
use crate::transform::Transform;

static NEXT_LAYER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique layer identifier.  Assigned monotonically, never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerId(u64);

impl LayerId {
    pub fn next() -> Self {
        LayerId(NEXT_LAYER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw value (for diagnostics and tests; does not reserve it).
    pub fn from_raw(raw: u64) -> Self {
        LayerId(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Capabilities
// ----------------------------------------------------------------------------

/// Layers carrying a persistent, always-invertible local→parent transform.
pub trait TransformCapable {
    fn transform(&self) -> Transform;

    /// Replace the transform.  Returns `false` if nothing changed.
    ///
    /// # Panics
    /// If `transform` is singular.
    fn set_transform(&mut self, transform: Transform) -> bool;

    /// Bounds in the layer's own pixel space.
    fn local_bounds(&self) -> PixelRect;

    /// Local bounds mapped through [`TransformCapable::transform`].
    fn transformed_bounds(&self) -> PixelRect {
        self.transform().map_pixel_rect(self.local_bounds())
    }
}

/// Layers whose content is an owned, directly paintable pixel buffer.
pub trait BufferBacked {
    fn buffer(&self) -> &PixelBuffer;
    fn buffer_mut(&mut self) -> &mut PixelBuffer;

    /// Paint only where pixels already have coverage.
    fn alpha_locked(&self) -> bool {
        false
    }
}

/// Layers that own an ordered list of children (index 0 is the topmost).
pub trait ContainerLike {
    fn children(&self) -> &[Layer];
    fn child_index(&self, id: LayerId) -> Option<usize> {
        self.children().iter().position(|c| c.id() == id)
    }
    fn contains(&self, id: LayerId) -> bool {
        self.child_index(id).is_some()
    }
}

pub(crate) fn assert_invertible(t: &Transform) {
    assert!(
        t.is_invertible(),
        "layer transform must be invertible, got {:?}",
        t.coeffs()
    );
}

// ----------------------------------------------------------------------------
// Layer
// ----------------------------------------------------------------------------

#[derive(Clone)]
pub enum LayerKind {
    Image(ImageLayer),
    Text(TextLayer),
    Group(LayerGroup),
}

/// One node of the layer tree.
#[derive(Clone)]
pub struct Layer {
    id: LayerId,
    name: String,
    visible: bool,
    opacity: f32,
    mode: BlendMode,
    locked: bool,
    pub(crate) z_value: i32,
    /// Advisory back-reference; the owning group is the source of truth and
    /// keeps this in sync on insert/remove.
    pub(crate) parent: Option<LayerId>,
    pub(crate) kind: LayerKind,
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind_name())
            .field("parent", &self.parent)
            .finish()
    }
}

impl Layer {
    fn with_kind(name: impl Into<String>, kind: LayerKind) -> Self {
        Self {
            id: LayerId::next(),
            name: name.into(),
            visible: true,
            opacity: 1.0,
            mode: BlendMode::Normal,
            locked: false,
            z_value: 0,
            parent: None,
            kind,
        }
    }

    pub fn new_image(name: impl Into<String>, buffer: PixelBuffer) -> Self {
        Self::with_kind(name, LayerKind::Image(ImageLayer::new(buffer)))
    }

    pub fn new_blank(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self::new_image(name, PixelBuffer::new(width, height))
    }

    pub fn new_text(name: impl Into<String>, text: impl Into<String>, style: TextStyle) -> Self {
        Self::with_kind(name, LayerKind::Text(TextLayer::new(text, style)))
    }

    pub fn new_group(name: impl Into<String>) -> Self {
        Self::with_kind(name, LayerKind::Group(LayerGroup::new()))
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn opacity(&self) -> f32 {
        self.opacity
    }

    pub fn mode(&self) -> BlendMode {
        self.mode
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn z_value(&self) -> i32 {
        self.z_value
    }

    pub fn parent(&self) -> Option<LayerId> {
        self.parent
    }

    pub fn kind(&self) -> &LayerKind {
        &self.kind
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            LayerKind::Image(_) => "image",
            LayerKind::Text(_) => "text",
            LayerKind::Group(_) => "group",
        }
    }

    pub fn set_name(&mut self, name: &str) -> bool {
        if self.name == name {
            return false;
        }
        self.name = name.to_string();
        true
    }

    pub fn set_visible(&mut self, visible: bool) -> bool {
        std::mem::replace(&mut self.visible, visible) != visible
    }

    pub fn set_opacity(&mut self, opacity: f32) -> bool {
        let opacity = opacity.clamp(0.0, 1.0);
        if self.opacity == opacity {
            return false;
        }
        self.opacity = opacity;
        true
    }

    pub fn set_mode(&mut self, mode: BlendMode) -> bool {
        std::mem::replace(&mut self.mode, mode) != mode
    }

    pub fn set_locked(&mut self, locked: bool) -> bool {
        std::mem::replace(&mut self.locked, locked) != locked
    }

    /// Bounds in the parent's coordinate space.
    pub fn bounds(&self) -> PixelRect {
        match &self.kind {
            LayerKind::Image(l) => l.transformed_bounds(),
            LayerKind::Text(l) => l.transformed_bounds(),
            LayerKind::Group(g) => g.bounds(),
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self.kind, LayerKind::Group(_))
    }

    pub fn as_image(&self) -> Option<&ImageLayer> {
        match &self.kind {
            LayerKind::Image(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_image_mut(&mut self) -> Option<&mut ImageLayer> {
        match &mut self.kind {
            LayerKind::Image(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&TextLayer> {
        match &self.kind {
            LayerKind::Text(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_text_mut(&mut self) -> Option<&mut TextLayer> {
        match &mut self.kind {
            LayerKind::Text(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_group(&self) -> Option<&LayerGroup> {
        match &self.kind {
            LayerKind::Group(g) => Some(g),
            _ => None,
        }
    }

    pub fn as_group_mut(&mut self) -> Option<&mut LayerGroup> {
        match &mut self.kind {
            LayerKind::Group(g) => Some(g),
            _ => None,
        }
    }

    pub fn as_transformable(&self) -> Option<&dyn TransformCapable> {
        match &self.kind {
            LayerKind::Image(l) => Some(l),
            LayerKind::Text(l) => Some(l),
            LayerKind::Group(_) => None,
        }
    }

    pub fn as_transformable_mut(&mut self) -> Option<&mut dyn TransformCapable> {
        match &mut self.kind {
            LayerKind::Image(l) => Some(l),
            LayerKind::Text(l) => Some(l),
            LayerKind::Group(_) => None,
        }
    }

    pub fn as_buffer_backed(&self) -> Option<&dyn BufferBacked> {
        self.as_image().map(|l| l as &dyn BufferBacked)
    }

    pub fn as_buffer_backed_mut(&mut self) -> Option<&mut dyn BufferBacked> {
        self.as_image_mut().map(|l| l as &mut dyn BufferBacked)
    }

    pub fn as_container(&self) -> Option<&dyn ContainerLike> {
        self.as_group().map(|g| g as &dyn ContainerLike)
    }

    /// Current pixels for leaf layers (text is rendered on demand).
    pub fn leaf_image(&self) -> Option<&PixelBuffer> {
        match &self.kind {
            LayerKind::Image(l) => Some(l.buffer()),
            LayerKind::Text(l) => Some(l.rendered()),
            LayerKind::Group(_) => None,
        }
    }

    /// True if drawing would change nothing: transparent, empty or hidden.
    pub fn paints_nothing(&self) -> bool {
        !self.visible || self.opacity <= 0.0 || self.bounds().is_empty()
    }

    /// Depth-first search of this subtree.
    pub fn find(&self, id: LayerId) -> Option<&Layer> {
        if self.id == id {
            return Some(self);
        }
        self.as_group()?.children().iter().find_map(|c| c.find(id))
    }

    pub fn find_mut(&mut self, id: LayerId) -> Option<&mut Layer> {
        if self.id == id {
            return Some(self);
        }
        self.as_group_mut()?.children_mut().iter_mut().find_map(|c| c.find_mut(id))
    }

    /// Every layer in this subtree (self included), parents before children.
    pub fn walk(&self, out: &mut Vec<LayerId>) {
        out.push(self.id);
        if let Some(g) = self.as_group() {
            for c in g.children() {
                c.walk(out);
            }
        }
    }

    /// Copy of the subtree with fresh ids and no parent.
    pub fn deep_copy(&self) -> Layer {
        let mut copy = self.clone();
        copy.parent = None;
        copy.reassign_ids();
        copy
    }

    fn reassign_ids(&mut self) {
        self.id = LayerId::next();
        let id = self.id;
        if let Some(g) = self.as_group_mut() {
            for c in g.children_mut() {
                c.reassign_ids();
                c.parent = Some(id);
            }
        }
    }

    /// Rough byte footprint for undo accounting.
    pub fn memory_size(&self) -> usize {
        match &self.kind {
            LayerKind::Image(l) => l.buffer().memory_size(),
            LayerKind::Text(l) => l.text().len() + 64,
            LayerKind::Group(g) => g.children().iter().map(Layer::memory_size).sum::<usize>() + 64,
        }
    }
}
