// ============================================================================
// LAYER STACK — the document: layer tree, selection, events and editing API
// ============================================================================
//
// Every mutating `pub fn` that takes a `&mut History` records its own undo
// entry.  The raw mutators without a history argument (`attach`, `detach`,
// `reorder`, `apply_property`, `swap_image`) exist for commands replaying
// history and for loaders; they still fire change events.

use image::RgbaImage;
use image::imageops::{self, FilterType};
use kurbo::Vec2;

use crate::blend::BlendMode;
use crate::canvas::PixelBuffer;
use crate::components::history::{
    BrushCommand, History, InsertLayerCommand, LayerSnapshotCommand, MoveLayerCommand, PixelPatch,
    PropertyCommand, RemoveLayerCommand,
};
use crate::error::EditError;
use crate::geometry::PixelRect;
use crate::layer::{BufferBacked, ContainerLike, Layer, LayerId, LayerKind, TransformCapable};
use crate::render::Renderer;
use crate::selection::{SelectionLayer, SelectionMode, SelectionShape};
use crate::settings::EditorSettings;
use crate::transform::Transform;
use crate::{log_info, log_warn};

/// A paintable buffer: an image layer or the selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferTarget {
    Layer(LayerId),
    Selection,
}

/// A single settable layer property, carrying its value.
#[derive(Clone, Debug, PartialEq)]
pub enum LayerProperty {
    Name(String),
    Visible(bool),
    Opacity(f32),
    Mode(BlendMode),
    Locked(bool),
    /// Groups only.
    Isolate(bool),
    /// Image layers only.
    AlphaLock(bool),
    /// Image and text layers only.
    Transform(Transform),
    /// Groups only (translation).
    Offset(Vec2),
}

impl LayerProperty {
    pub fn label(&self) -> &'static str {
        match self {
            LayerProperty::Name(_) => "name",
            LayerProperty::Visible(_) => "visibility",
            LayerProperty::Opacity(_) => "opacity",
            LayerProperty::Mode(_) => "blend mode",
            LayerProperty::Locked(_) => "lock",
            LayerProperty::Isolate(_) => "isolation",
            LayerProperty::AlphaLock(_) => "alpha lock",
            LayerProperty::Transform(_) => "transform",
            LayerProperty::Offset(_) => "offset",
        }
    }

    /// Properties edited by dragging; consecutive changes merge in history.
    pub fn is_continuous(&self) -> bool {
        matches!(
            self,
            LayerProperty::Opacity(_) | LayerProperty::Transform(_) | LayerProperty::Offset(_)
        )
    }

    fn affects_pixels(&self) -> bool {
        !matches!(self, LayerProperty::Name(_) | LayerProperty::Locked(_) | LayerProperty::AlphaLock(_))
    }
}

/// Change notifications.  Rects are in document pixels.
#[derive(Clone, Debug, PartialEq)]
pub enum LayerEvent {
    Added { id: LayerId, parent: LayerId },
    Removed { id: LayerId, parent: LayerId },
    Moved { id: LayerId, from: usize, to: usize },
    PropertyChanged { id: LayerId, property: &'static str },
    ContentChanged { id: LayerId, rect: PixelRect },
    BoundsChanged { id: LayerId },
    SelectionChanged { rect: PixelRect },
    ActiveChanged { id: Option<LayerId> },
    RenderNeeded { rect: PixelRect },
}

type Observer = Box<dyn FnMut(&LayerEvent)>;

fn not_applicable(property: &LayerProperty, kind: &str, id: LayerId) -> ! {
    panic!("{} does not apply to {} layer {}", property.label(), kind, id)
}

pub struct LayerStack {
    width: u32,
    height: u32,
    root: Layer,
    selection: SelectionLayer,
    active: Option<LayerId>,
    observers: Vec<Observer>,
    events_emitted: u64,
}

impl LayerStack {
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_settings(width, height, &EditorSettings::default())
    }

    pub fn with_settings(width: u32, height: u32, settings: &EditorSettings) -> Self {
        let mut root = Layer::new_group("Root");
        if let Some(g) = root.as_group_mut() {
            g.set_isolate(true);
        }
        Self {
            width,
            height,
            root,
            selection: SelectionLayer::new(width, height, settings.selection_color),
            active: None,
            observers: Vec::new(),
            events_emitted: 0,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn rect(&self) -> PixelRect {
        PixelRect::from_size(self.width, self.height)
    }

    pub fn root(&self) -> &Layer {
        &self.root
    }

    pub fn root_id(&self) -> LayerId {
        self.root.id()
    }

    pub fn selection(&self) -> &SelectionLayer {
        &self.selection
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    pub fn subscribe(&mut self, observer: impl FnMut(&LayerEvent) + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// Total events fired so far; hosts compare it to coalesce repaints.
    pub fn events_emitted(&self) -> u64 {
        self.events_emitted
    }

    fn emit(&mut self, event: LayerEvent) {
        self.events_emitted += 1;
        for observer in self.observers.iter_mut() {
            observer(&event);
        }
    }

    fn request_render(&mut self, rect: PixelRect) {
        let rect = rect.intersect(&self.rect());
        if !rect.is_empty() {
            self.emit(LayerEvent::RenderNeeded { rect });
        }
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    pub fn find(&self, id: LayerId) -> Option<&Layer> {
        self.root.find(id)
    }

    pub(crate) fn find_mut(&mut self, id: LayerId) -> Option<&mut Layer> {
        self.root.find_mut(id)
    }

    pub fn contains(&self, id: LayerId) -> bool {
        self.find(id).is_some()
    }

    /// Ancestors of `id` from the root down to its parent.
    pub fn path_to(&self, id: LayerId) -> Option<Vec<LayerId>> {
        let mut path = Vec::new();
        let mut cur = self.find(id)?.parent();
        while let Some(p) = cur {
            path.push(p);
            cur = self.find(p).and_then(Layer::parent);
        }
        path.reverse();
        Some(path)
    }

    /// `(parent, index)` of a non-root layer.
    pub fn position_of(&self, id: LayerId) -> Option<(LayerId, usize)> {
        let parent = self.find(id)?.parent()?;
        let index = self.find(parent)?.as_container()?.child_index(id)?;
        Some((parent, index))
    }

    /// Visible only if the layer and every ancestor are.
    pub fn is_effectively_visible(&self, id: LayerId) -> bool {
        let Some(path) = self.path_to(id) else { return false };
        path.iter()
            .chain(std::iter::once(&id))
            .all(|l| self.find(*l).is_some_and(Layer::is_visible))
    }

    /// Locked if the layer or any ancestor is.
    pub fn is_effectively_locked(&self, id: LayerId) -> bool {
        let Some(path) = self.path_to(id) else { return false };
        path.iter()
            .chain(std::iter::once(&id))
            .any(|l| self.find(*l).is_some_and(Layer::is_locked))
    }

    /// Local→document transform: the layer's own transform (or group offset)
    /// followed by every ancestor group's offset.
    pub fn full_transform(&self, id: LayerId) -> Option<Transform> {
        let layer = self.find(id)?;
        let mut t = match layer.kind() {
            LayerKind::Group(g) => g.offset_transform(),
            _ => layer.as_transformable().map(|l| l.transform()).unwrap_or_default(),
        };
        for ancestor in self.path_to(id)?.iter().rev() {
            if let Some(g) = self.find(*ancestor).and_then(Layer::as_group) {
                t = t.then(&g.offset_transform());
            }
        }
        Some(t)
    }

    /// Local bounds mapped through every ancestor into document space.
    pub fn full_image_bounds(&self, id: LayerId) -> Option<PixelRect> {
        let layer = self.find(id)?;
        let local = match layer.kind() {
            LayerKind::Group(g) => g.local_bounds(),
            _ => layer.as_transformable().map(|l| l.local_bounds()).unwrap_or_default(),
        };
        Some(self.full_transform(id)?.map_pixel_rect(local))
    }

    /// Every layer (groups included) in paint order, bottom first.
    pub fn paint_order(&self) -> Vec<LayerId> {
        fn walk(layer: &Layer, out: &mut Vec<LayerId>) {
            if let Some(g) = layer.as_group() {
                for c in g.children().iter().rev() {
                    walk(c, out);
                }
            }
            out.push(layer.id());
        }
        let mut out = Vec::new();
        walk(&self.root, &mut out);
        out.pop(); // root
        out
    }

    pub fn layer_count(&self) -> usize {
        self.paint_order().len()
    }

    // ------------------------------------------------------------------
    // Active layer
    // ------------------------------------------------------------------

    pub fn active_layer(&self) -> Option<LayerId> {
        self.active
    }

    /// # Panics
    /// If `id` is not in the tree or is the root.
    pub fn set_active_layer(&mut self, id: Option<LayerId>) {
        if let Some(id) = id {
            assert!(
                id != self.root_id() && self.contains(id),
                "layer {} cannot be made active",
                id
            );
        }
        if self.active != id {
            self.active = id;
            self.emit(LayerEvent::ActiveChanged { id });
        }
    }

    // ------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------

    /// Re-derive group bounds from `id`'s parent up to the root.
    fn refresh_bounds_above(&mut self, id: LayerId) {
        let Some(path) = self.path_to(id) else { return };
        for group_id in path.into_iter().rev() {
            let changed = self
                .find_mut(group_id)
                .and_then(Layer::as_group_mut)
                .is_some_and(|g| g.update_bounds());
            if changed {
                self.emit(LayerEvent::BoundsChanged { id: group_id });
            }
        }
    }

    /// Paint order defines z: bottom leaf is 0, a group sits just above its
    /// children, and the selection is above everything.
    fn recompute_z(&mut self) {
        fn assign(layer: &mut Layer, next: &mut i32) {
            if let Some(g) = layer.as_group_mut() {
                for c in g.children_mut().iter_mut().rev() {
                    assign(c, next);
                }
            }
            layer.z_value = *next;
            *next += 1;
        }
        let mut next = 0;
        assign(&mut self.root, &mut next);
    }

    /// z-value reserved for the selection layer.
    pub fn selection_z(&self) -> i32 {
        self.root.z_value() + 1
    }

    // ------------------------------------------------------------------
    // Raw structural mutation (no history)
    // ------------------------------------------------------------------

    /// Insert a detached layer under `parent` at `index` (0 = top).
    ///
    /// # Panics
    /// If `parent` is not a group in this stack, `layer` is attached, or the
    /// index is out of range.
    pub fn attach(&mut self, parent: LayerId, index: usize, layer: Layer) -> LayerId {
        let id = layer.id();
        let paints = !layer.paints_nothing();
        let group = self
            .find_mut(parent)
            .and_then(Layer::as_group_mut)
            .unwrap_or_else(|| panic!("layer {} is not a group in this stack", parent));
        let before = group.bounds();
        group.insert(parent, layer, index);
        if group.bounds() != before {
            self.emit(LayerEvent::BoundsChanged { id: parent });
        }
        self.refresh_bounds_above(parent);
        self.recompute_z();
        self.emit(LayerEvent::Added { id, parent });
        if paints && self.is_effectively_visible(id) {
            let rect = self.full_image_bounds(id).unwrap_or_default();
            self.request_render(rect);
        }
        id
    }

    /// Remove `id` from its parent.  Returns the layer, its parent and index.
    pub fn detach(&mut self, id: LayerId) -> Option<(Layer, LayerId, usize)> {
        let (parent, _) = self.position_of(id)?;
        let rendered = self.is_effectively_visible(id);
        let rect = self.full_image_bounds(id).unwrap_or_default();
        let group = self.find_mut(parent).and_then(Layer::as_group_mut)?;
        let before = group.bounds();
        let (layer, index) = group.remove(id);
        if group.bounds() != before {
            self.emit(LayerEvent::BoundsChanged { id: parent });
        }
        self.refresh_bounds_above(parent);
        self.recompute_z();
        if self.active.is_some_and(|a| layer.find(a).is_some()) {
            self.set_active_layer(None);
        }
        self.emit(LayerEvent::Removed { id, parent });
        if rendered {
            self.request_render(rect);
        }
        Some((layer, parent, index))
    }

    /// Move `id` within its parent.  Returns the previous index.
    pub fn reorder(&mut self, id: LayerId, new_index: usize) -> Option<usize> {
        let (parent, index) = self.position_of(id)?;
        if index == new_index {
            return Some(index);
        }
        let group = self.find_mut(parent).and_then(Layer::as_group_mut)?;
        group.move_child(id, new_index);
        self.recompute_z();
        self.emit(LayerEvent::Moved { id, from: index, to: new_index });
        let rect = self.full_image_bounds(id).unwrap_or_default();
        self.request_render(rect);
        Some(index)
    }

    /// Set one property.  Returns the previous value, or `None` if nothing
    /// changed (or the layer is gone).
    ///
    /// # Panics
    /// If the property does not apply to the layer's kind, or a transform is
    /// singular.
    pub fn apply_property(&mut self, id: LayerId, property: LayerProperty) -> Option<LayerProperty> {
        let before_rect = self.full_image_bounds(id)?;
        let layer = self.find_mut(id)?;
        let kind = layer.kind_name();
        let old = match &property {
            LayerProperty::Name(v) => {
                let old = layer.name().to_string();
                layer.set_name(v).then_some(LayerProperty::Name(old))
            }
            LayerProperty::Visible(v) => layer.set_visible(*v).then_some(LayerProperty::Visible(!*v)),
            LayerProperty::Opacity(v) => {
                let old = layer.opacity();
                layer.set_opacity(*v).then_some(LayerProperty::Opacity(old))
            }
            LayerProperty::Mode(v) => {
                let old = layer.mode();
                layer.set_mode(*v).then_some(LayerProperty::Mode(old))
            }
            LayerProperty::Locked(v) => layer.set_locked(*v).then_some(LayerProperty::Locked(!*v)),
            LayerProperty::Isolate(v) => match layer.as_group_mut() {
                Some(g) => g.set_isolate(*v).then_some(LayerProperty::Isolate(!*v)),
                None => not_applicable(&property, kind, id),
            },
            LayerProperty::AlphaLock(v) => match layer.as_image_mut() {
                Some(l) => l.set_alpha_locked(*v).then_some(LayerProperty::AlphaLock(!*v)),
                None => not_applicable(&property, kind, id),
            },
            LayerProperty::Transform(t) => match layer.as_transformable_mut() {
                Some(l) => {
                    let old = l.transform();
                    l.set_transform(*t).then_some(LayerProperty::Transform(old))
                }
                None => not_applicable(&property, kind, id),
            },
            LayerProperty::Offset(v) => match layer.as_group_mut() {
                Some(g) => {
                    let old = g.offset();
                    g.set_offset(*v).then_some(LayerProperty::Offset(old))
                }
                None => not_applicable(&property, kind, id),
            },
        };
        let old = old?;

        self.emit(LayerEvent::PropertyChanged { id, property: property.label() });
        if matches!(property, LayerProperty::Transform(_) | LayerProperty::Offset(_)) {
            self.emit(LayerEvent::BoundsChanged { id });
            self.refresh_bounds_above(id);
        }
        if property.affects_pixels() {
            let after_rect = self.full_image_bounds(id).unwrap_or_default();
            self.request_render(before_rect.union(&after_rect));
        }
        Some(old)
    }

    /// Replace an image layer's buffer and transform.  Returns the old pair.
    pub fn swap_image(
        &mut self,
        id: LayerId,
        buffer: PixelBuffer,
        transform: Transform,
    ) -> Option<(PixelBuffer, Transform)> {
        let before_rect = self.full_image_bounds(id)?;
        let image = self.find_mut(id)?.as_image_mut()?;
        let old_transform = image.transform();
        image.set_transform(transform);
        let old_buffer = image.replace_buffer(buffer);
        self.emit(LayerEvent::BoundsChanged { id });
        self.refresh_bounds_above(id);
        let after_rect = self.full_image_bounds(id).unwrap_or_default();
        self.emit(LayerEvent::ContentChanged { id, rect: after_rect });
        if self.is_effectively_visible(id) {
            self.request_render(before_rect.union(&after_rect));
        }
        Some((old_buffer, old_transform))
    }

    // ------------------------------------------------------------------
    // Buffers
    // ------------------------------------------------------------------

    pub fn buffer_target(&self, target: BufferTarget) -> Option<&PixelBuffer> {
        match target {
            BufferTarget::Selection => Some(self.selection.buffer()),
            BufferTarget::Layer(id) => self.find(id)?.as_buffer_backed().map(|b| b.buffer()),
        }
    }

    pub fn buffer_target_mut(&mut self, target: BufferTarget) -> Option<&mut PixelBuffer> {
        match target {
            BufferTarget::Selection => Some(self.selection.buffer_mut()),
            BufferTarget::Layer(id) => self.find_mut(id)?.as_buffer_backed_mut().map(|b| b.buffer_mut()),
        }
    }

    /// Local→document transform of a buffer target.
    pub fn target_transform(&self, target: BufferTarget) -> Option<Transform> {
        match target {
            BufferTarget::Selection => Some(Transform::IDENTITY),
            BufferTarget::Layer(id) => self.full_transform(id),
        }
    }

    pub fn target_alpha_locked(&self, target: BufferTarget) -> bool {
        match target {
            BufferTarget::Selection => false,
            BufferTarget::Layer(id) => self
                .find(id)
                .and_then(Layer::as_buffer_backed)
                .is_some_and(|b| b.alpha_locked()),
        }
    }

    /// Announce that `rect` (target-local pixels) of a buffer changed.
    pub fn notify_content(&mut self, target: BufferTarget, rect: PixelRect) {
        match target {
            BufferTarget::Selection => {
                self.selection.invalidate();
                self.emit(LayerEvent::SelectionChanged { rect });
            }
            BufferTarget::Layer(id) => {
                self.emit(LayerEvent::ContentChanged { id, rect });
                let doc = self
                    .full_transform(id)
                    .map(|t| t.map_pixel_rect(rect))
                    .unwrap_or_default();
                if self.is_effectively_visible(id) {
                    self.request_render(doc);
                }
            }
        }
    }

    /// Why painting into `target` would be refused, if it would.
    pub fn check_paintable(&self, target: BufferTarget) -> Result<(), EditError> {
        let BufferTarget::Layer(id) = target else { return Ok(()) };
        let layer = self.find(id).ok_or(EditError::NoLayer)?;
        if !self.is_effectively_visible(id) {
            return Err(EditError::Hidden(id));
        }
        if self.is_effectively_locked(id) {
            return Err(EditError::Locked(id));
        }
        if layer.as_buffer_backed().is_none() {
            return Err(EditError::NotRaster(id));
        }
        Ok(())
    }

    /// Resolve the active layer as a paint target.
    pub fn active_target(&self) -> Result<BufferTarget, EditError> {
        self.active.map(BufferTarget::Layer).ok_or(EditError::NoLayer)
    }

    // ------------------------------------------------------------------
    // Recorded structural edits
    // ------------------------------------------------------------------

    /// Insert `layer` under `parent` (root if `None`) at `index`, recording undo.
    pub fn add_layer(
        &mut self,
        layer: Layer,
        parent: Option<LayerId>,
        index: usize,
        history: &mut History,
    ) -> LayerId {
        let parent = parent.unwrap_or_else(|| self.root_id());
        let id = self.attach(parent, index, layer);
        history.push(Box::new(InsertLayerCommand::new(id, parent, index)));
        id
    }

    /// Where a new layer goes: directly above the active layer, else on top.
    fn insertion_point(&self) -> (LayerId, usize) {
        self.active
            .and_then(|a| self.position_of(a))
            .unwrap_or((self.root_id(), 0))
    }

    /// New transparent document-sized image layer above the active one.
    pub fn new_image_layer(&mut self, name: &str, history: &mut History) -> LayerId {
        let layer = Layer::new_blank(name, self.width, self.height);
        let (parent, index) = self.insertion_point();
        let id = self.add_layer(layer, Some(parent), index, history);
        self.set_active_layer(Some(id));
        id
    }

    pub fn new_group(&mut self, name: &str, history: &mut History) -> LayerId {
        let (parent, index) = self.insertion_point();
        self.add_layer(Layer::new_group(name), Some(parent), index, history)
    }

    /// # Panics
    /// If `id` is the root or not in the stack.
    pub fn remove_layer(&mut self, id: LayerId, history: &mut History) -> Layer {
        assert!(id != self.root_id(), "the root group cannot be removed");
        let (layer, parent, index) = self
            .detach(id)
            .unwrap_or_else(|| panic!("layer {} is not in this stack", id));
        history.push(Box::new(RemoveLayerCommand::new(layer.clone(), parent, index)));
        layer
    }

    pub fn move_layer(&mut self, id: LayerId, new_index: usize, history: &mut History) {
        let from = self
            .reorder(id, new_index)
            .unwrap_or_else(|| panic!("layer {} is not in this stack", id));
        if from != new_index {
            history.push(Box::new(MoveLayerCommand::new(id, from, new_index)));
        }
    }

    /// Deep copy placed directly above the original.
    pub fn duplicate_layer(&mut self, id: LayerId, history: &mut History) -> LayerId {
        let (parent, index, mut copy) = self
            .position_of(id)
            .and_then(|(p, i)| Some((p, i, self.find(id)?.deep_copy())))
            .unwrap_or_else(|| panic!("layer {} is not in this stack", id));
        let name = format!("{} copy", copy.name());
        copy.set_name(&name);
        self.add_layer(copy, Some(parent), index, history)
    }

    // ------------------------------------------------------------------
    // Recorded property edits
    // ------------------------------------------------------------------

    /// Returns `false` (and records nothing) if the value was unchanged.
    pub fn set_property(&mut self, id: LayerId, property: LayerProperty, history: &mut History) -> bool {
        match self.apply_property(id, property.clone()) {
            Some(old) => {
                history.push(Box::new(PropertyCommand::new(id, old, property)));
                true
            }
            None => false,
        }
    }

    pub fn set_name(&mut self, id: LayerId, name: &str, history: &mut History) -> bool {
        self.set_property(id, LayerProperty::Name(name.to_string()), history)
    }

    pub fn set_visible(&mut self, id: LayerId, visible: bool, history: &mut History) -> bool {
        self.set_property(id, LayerProperty::Visible(visible), history)
    }

    pub fn set_opacity(&mut self, id: LayerId, opacity: f32, history: &mut History) -> bool {
        self.set_property(id, LayerProperty::Opacity(opacity.clamp(0.0, 1.0)), history)
    }

    pub fn set_mode(&mut self, id: LayerId, mode: BlendMode, history: &mut History) -> bool {
        self.set_property(id, LayerProperty::Mode(mode), history)
    }

    pub fn set_locked(&mut self, id: LayerId, locked: bool, history: &mut History) -> bool {
        self.set_property(id, LayerProperty::Locked(locked), history)
    }

    pub fn set_isolate(&mut self, id: LayerId, isolate: bool, history: &mut History) -> bool {
        self.set_property(id, LayerProperty::Isolate(isolate), history)
    }

    pub fn set_alpha_locked(&mut self, id: LayerId, locked: bool, history: &mut History) -> bool {
        self.set_property(id, LayerProperty::AlphaLock(locked), history)
    }

    /// # Panics
    /// If `transform` is singular or the layer is a group.
    pub fn set_transform(&mut self, id: LayerId, transform: Transform, history: &mut History) -> bool {
        self.set_property(id, LayerProperty::Transform(transform), history)
    }

    pub fn set_offset(&mut self, id: LayerId, offset: Vec2, history: &mut History) -> bool {
        self.set_property(id, LayerProperty::Offset(offset), history)
    }

    /// Shift a layer (or group) by `(dx, dy)` in its parent's space.
    pub fn translate_layer(&mut self, id: LayerId, dx: f64, dy: f64, history: &mut History) -> bool {
        let Some(layer) = self.find(id) else { return false };
        let property = match layer.kind() {
            LayerKind::Group(g) => LayerProperty::Offset(g.offset() + Vec2::new(dx, dy)),
            _ => match layer.as_transformable() {
                Some(l) => LayerProperty::Transform(l.transform().then(&Transform::translation(dx, dy))),
                None => return false,
            },
        };
        self.set_property(id, property, history)
    }

    /// Apply `transform` (expressed in the group's parent space) to every
    /// leaf under `group`, folding it into each leaf's own transform.  The
    /// group keeps its translation-only offset.
    ///
    /// # Panics
    /// If `group` is not a group or `transform` is singular.
    pub fn distribute_transform(&mut self, group: LayerId, transform: Transform, history: &mut History) {
        assert!(transform.is_invertible(), "cannot distribute a singular transform");
        let g = self
            .find(group)
            .and_then(Layer::as_group)
            .unwrap_or_else(|| panic!("layer {} is not a group", group));

        fn collect(layer: &Layer, chain: Transform, g: &Transform, out: &mut Vec<(LayerId, Transform)>) {
            match layer.kind() {
                LayerKind::Group(grp) => {
                    let chain = grp.offset_transform().then(&chain);
                    for c in grp.children() {
                        collect(c, chain, g, out);
                    }
                }
                _ => {
                    if let Some(l) = layer.as_transformable() {
                        let t = l.transform().then(&chain).then(g).then(&chain.inverse());
                        out.push((layer.id(), t));
                    }
                }
            }
        }

        let chain = g.offset_transform();
        let mut updates = Vec::new();
        for c in g.children() {
            collect(c, chain, &transform, &mut updates);
        }

        history.begin_transaction("Transform Group");
        for (id, t) in updates {
            self.set_property(id, LayerProperty::Transform(t), history);
        }
        history.end_transaction();
    }

    // ------------------------------------------------------------------
    // Recorded content edits
    // ------------------------------------------------------------------

    /// Shrink an image layer to the bounds of its visible pixels, keeping
    /// them in place.  Returns the content rect in the old local space, or
    /// `None` if the layer is fully transparent.
    pub fn crop_to_content(&mut self, id: LayerId, history: &mut History) -> Result<Option<PixelRect>, EditError> {
        let layer = self.find(id).ok_or(EditError::NoLayer)?;
        if self.is_effectively_locked(id) {
            return Err(EditError::Locked(id));
        }
        let image = layer.as_image().ok_or(EditError::NotRaster(id))?;
        let Some(bounds) = image.buffer().content_bounds(0) else { return Ok(None) };
        if bounds == image.buffer().rect() {
            return Ok(Some(bounds));
        }
        let cropped = image.buffer().copy_region(bounds);
        let transform = Transform::translation(bounds.x as f64, bounds.y as f64).then(&image.transform());
        let after = (cropped.clone(), transform);
        if let Some(before) = self.swap_image(id, cropped, transform) {
            history.push(Box::new(LayerSnapshotCommand::new("Crop to Content", id, before, after)));
        }
        Ok(Some(bounds))
    }

    /// Replace a text layer with an image layer holding its rendered pixels.
    /// The new layer has a fresh id and takes over the text layer's place.
    pub fn rasterize_text(&mut self, id: LayerId, history: &mut History) -> Result<LayerId, EditError> {
        let layer = self.find(id).ok_or(EditError::NoLayer)?;
        let text = layer.as_text().ok_or(EditError::NotRaster(id))?;
        let mut image = Layer::new_image(layer.name(), text.rendered().clone());
        if let Some(img) = image.as_image_mut() {
            img.set_transform(text.transform());
        }
        image.set_visible(layer.is_visible());
        image.set_opacity(layer.opacity());
        image.set_mode(layer.mode());
        image.set_locked(layer.is_locked());
        let was_active = self.active == Some(id);
        let (parent, index) = self.position_of(id).ok_or(EditError::NoLayer)?;

        history.begin_transaction("Rasterize Text");
        self.remove_layer(id, history);
        let new_id = self.add_layer(image, Some(parent), index, history);
        history.end_transaction();
        if was_active {
            self.set_active_layer(Some(new_id));
        }
        Ok(new_id)
    }

    // ------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------

    fn record_selection(&mut self, before: PixelBuffer, rect: PixelRect, label: &str, history: &mut History) {
        if rect.is_empty() {
            return;
        }
        let before = PixelPatch::from_buffer(&before, BufferTarget::Selection, rect);
        let after = PixelPatch::from_buffer(self.selection.buffer(), BufferTarget::Selection, rect);
        history.push(Box::new(BrushCommand::new(label, before, after)));
        self.emit(LayerEvent::SelectionChanged { rect });
    }

    pub fn select(&mut self, shape: &SelectionShape, mode: SelectionMode, history: &mut History) {
        let before = self.selection.buffer().clone();
        let rect = self.selection.select(shape, mode);
        self.record_selection(before, rect, "Select", history);
    }

    pub fn select_all(&mut self, history: &mut History) {
        let before = self.selection.buffer().clone();
        self.selection.select_all();
        self.record_selection(before, self.rect(), "Select All", history);
    }

    pub fn clear_selection(&mut self, history: &mut History) {
        let before = self.selection.buffer().clone();
        let Some(rect) = before.content_bounds(0) else { return };
        self.selection.clear();
        self.record_selection(before, rect, "Deselect", history);
    }

    pub fn invert_selection(&mut self, history: &mut History) {
        let before = self.selection.buffer().clone();
        self.selection.invert();
        self.record_selection(before, self.rect(), "Invert Selection", history);
    }

    pub fn set_generation_area(&mut self, area: PixelRect) {
        if self.selection.set_generation_area(area) {
            self.emit(LayerEvent::SelectionChanged { rect: area });
        }
    }

    /// Re-snap a painted region of the selection to its two colours.
    pub fn normalize_selection(&mut self, rect: PixelRect) {
        self.selection.normalize_region(rect);
    }

    // ------------------------------------------------------------------
    // Rendering
    // ------------------------------------------------------------------

    /// Merged image of the whole document (selection excluded).
    pub fn render(&self) -> PixelBuffer {
        self.render_with(&Renderer::new())
    }

    pub fn render_with(&self, renderer: &Renderer<'_>) -> PixelBuffer {
        let mut out = PixelBuffer::new(self.width, self.height);
        renderer.render(&self.root, &mut out, &Transform::IDENTITY, None, None);
        out
    }

    /// Merged pixels of `rect` only (document coordinates).
    pub fn render_region(&self, rect: PixelRect) -> PixelBuffer {
        let mut out = PixelBuffer::new(rect.width.max(0) as u32, rect.height.max(0) as u32);
        let t = Transform::translation(-rect.x as f64, -rect.y as f64);
        Renderer::new().render(&self.root, &mut out, &t, None, None);
        out
    }

    /// Everything painted beneath `id`.
    pub fn render_below(&self, id: LayerId) -> PixelBuffer {
        let z = self.find(id).map(Layer::z_value).unwrap_or(i32::MAX);
        self.render_with(&Renderer::new().with_z_max(z - 1))
    }

    /// Straight-alpha preview whose longest edge is at most `max_edge`.
    pub fn thumbnail(&self, max_edge: u32) -> RgbaImage {
        let full = self.render().to_straight();
        let longest = self.width.max(self.height).max(1);
        if longest <= max_edge {
            return full;
        }
        let scale = max_edge as f64 / longest as f64;
        let w = ((self.width as f64 * scale).round() as u32).max(1);
        let h = ((self.height as f64 * scale).round() as u32).max(1);
        imageops::resize(&full, w, h, FilterType::Triangle)
    }

    /// Take over another stack's document (used by loaders).  Observers of
    /// `self` survive; the other stack's observers are dropped.
    pub fn replace_with(&mut self, other: LayerStack) {
        self.width = other.width;
        self.height = other.height;
        self.root = other.root;
        self.selection = other.selection;
        self.active = other.active;
        self.recompute_z();
        log_info!("Document replaced ({}x{}, {} layers)", self.width, self.height, self.layer_count());
        let rect = self.rect();
        self.request_render(rect);
    }

    /// Log and return an edit rejection.
    pub(crate) fn reject(err: EditError) -> EditError {
        log_warn!("Edit rejected: {}", err);
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn solid(name: &str, w: u32, h: u32, rgba: [u8; 4]) -> Layer {
        Layer::new_image(name, PixelBuffer::filled(w, h, rgba))
    }

    #[test]
    fn property_setters_skip_redundant_changes() {
        let mut stack = LayerStack::new(10, 10);
        let mut h = History::default();
        let id = stack.add_layer(solid("a", 10, 10, [1, 2, 3, 255]), None, 0, &mut h);
        let before = stack.events_emitted();
        assert!(!stack.set_opacity(id, 1.0, &mut h));
        assert_eq!(stack.events_emitted(), before);
        assert!(stack.set_opacity(id, 0.3, &mut h));
        assert!(stack.events_emitted() > before);
        assert_eq!(h.undo_count(), 2);
    }

    #[test]
    fn opacity_drags_merge_into_one_entry() {
        let mut stack = LayerStack::new(4, 4);
        let mut h = History::default();
        let id = stack.add_layer(solid("a", 4, 4, [0, 0, 0, 255]), None, 0, &mut h);
        for step in 1..=5 {
            stack.set_opacity(id, 1.0 - step as f32 * 0.1, &mut h);
        }
        assert_eq!(h.undo_count(), 2);
        h.undo(&mut stack);
        assert_eq!(stack.find(id).unwrap().opacity(), 1.0);
    }

    #[test]
    fn events_reach_observers() {
        let mut stack = LayerStack::new(4, 4);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        stack.subscribe(move |e| sink.borrow_mut().push(e.clone()));
        let mut h = History::default();
        let id = stack.add_layer(solid("a", 4, 4, [0, 0, 0, 255]), None, 0, &mut h);
        let events = seen.borrow();
        assert!(events.iter().any(|e| matches!(e, LayerEvent::Added { id: i, .. } if *i == id)));
        assert!(events.iter().any(|e| matches!(e, LayerEvent::RenderNeeded { .. })));
    }

    #[test]
    fn insert_and_remove_report_owner_bounds() {
        let mut stack = LayerStack::new(20, 20);
        let mut h = History::default();
        let g = stack.add_layer(Layer::new_group("g"), None, 0, &mut h);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        stack.subscribe(move |e| {
            if let LayerEvent::BoundsChanged { id } = e {
                sink.borrow_mut().push(*id);
            }
        });
        let root = stack.root_id();

        let l = stack.add_layer(solid("l", 10, 10, [0, 0, 0, 255]), Some(g), 0, &mut h);
        assert_eq!(*seen.borrow(), vec![g, root]);

        seen.borrow_mut().clear();
        stack.remove_layer(l, &mut h);
        assert_eq!(*seen.borrow(), vec![g, root]);
    }

    #[test]
    fn z_values_follow_paint_order() {
        let mut stack = LayerStack::new(4, 4);
        let mut h = History::default();
        let bottom = stack.add_layer(solid("b", 4, 4, [0, 0, 0, 255]), None, 0, &mut h);
        let top = stack.add_layer(solid("t", 4, 4, [0, 0, 0, 255]), None, 0, &mut h);
        let zb = stack.find(bottom).unwrap().z_value();
        let zt = stack.find(top).unwrap().z_value();
        assert!(zt > zb);
        assert!(stack.selection_z() > zt);
        stack.move_layer(top, 1, &mut h);
        assert!(stack.find(top).unwrap().z_value() < stack.find(bottom).unwrap().z_value());
    }

    #[test]
    fn remove_and_undo_restores_layer() {
        let mut stack = LayerStack::new(4, 4);
        let mut h = History::default();
        let id = stack.add_layer(solid("a", 4, 4, [9, 9, 9, 255]), None, 0, &mut h);
        stack.remove_layer(id, &mut h);
        assert!(!stack.contains(id));
        h.undo(&mut stack);
        assert!(stack.contains(id));
        assert_eq!(stack.find(id).unwrap().parent(), Some(stack.root_id()));
    }

    #[test]
    fn effective_lock_and_visibility_inherit() {
        let mut stack = LayerStack::new(4, 4);
        let mut h = History::default();
        let g = stack.add_layer(Layer::new_group("g"), None, 0, &mut h);
        let l = stack.add_layer(solid("l", 4, 4, [0, 0, 0, 255]), Some(g), 0, &mut h);
        stack.set_locked(g, true, &mut h);
        assert!(stack.is_effectively_locked(l));
        assert_eq!(stack.check_paintable(BufferTarget::Layer(l)), Err(EditError::Locked(l)));
        stack.set_locked(g, false, &mut h);
        stack.set_visible(g, false, &mut h);
        assert_eq!(stack.check_paintable(BufferTarget::Layer(l)), Err(EditError::Hidden(l)));
        assert_eq!(stack.check_paintable(BufferTarget::Layer(g)), Err(EditError::Hidden(g)));
    }

    #[test]
    fn groups_are_not_paintable() {
        let mut stack = LayerStack::new(4, 4);
        let mut h = History::default();
        let g = stack.add_layer(Layer::new_group("g"), None, 0, &mut h);
        assert_eq!(stack.check_paintable(BufferTarget::Layer(g)), Err(EditError::NotRaster(g)));
    }

    #[test]
    fn distribute_transform_rotates_leaves_in_place() {
        let mut stack = LayerStack::new(100, 100);
        let mut h = History::default();
        let g = stack.add_layer(Layer::new_group("g"), None, 0, &mut h);
        stack.set_offset(g, Vec2::new(10.0, 0.0), &mut h);
        let l = stack.add_layer(solid("l", 10, 10, [0, 0, 0, 255]), Some(g), 0, &mut h);
        let p = kurbo::Point::new(3.0, 4.0);
        let before_doc = stack.full_transform(l).unwrap().map_point(p);

        let rot = Transform::rotation_degrees(90.0);
        stack.distribute_transform(g, rot, &mut h);

        let group = stack.find(g).unwrap().as_group().unwrap();
        assert_eq!(group.offset(), Vec2::new(10.0, 0.0));
        let after_doc = stack.full_transform(l).unwrap().map_point(p);
        let expected = rot.map_point(before_doc);
        assert!((after_doc - expected).hypot() < 1e-9);
        assert_eq!(h.undo_description().as_deref(), Some("Transform Group"));
    }

    #[test]
    fn thumbnail_respects_max_edge() {
        let stack = LayerStack::new(400, 100);
        let t = stack.thumbnail(100);
        assert_eq!((t.width(), t.height()), (100, 25));
    }

    #[test]
    fn selection_edits_are_undoable() {
        let mut stack = LayerStack::new(10, 10);
        let mut h = History::default();
        stack.select(&SelectionShape::Rectangle(PixelRect::new(2, 2, 3, 3)), SelectionMode::Replace, &mut h);
        assert_eq!(stack.selection().bounds(), Some(PixelRect::new(2, 2, 3, 3)));
        h.undo(&mut stack);
        assert!(stack.selection().is_empty());
        h.redo(&mut stack);
        assert!(!stack.selection().is_empty());
    }
}
