use kurbo::Vec2;

use crate::geometry::PixelRect;
use crate::transform::Transform;

use super::{ContainerLike, Layer, LayerId};

/// Ordered children (index 0 is the topmost) composited as a unit.
///
/// Groups only ever translate their content; rotation or scale applied to a
/// group is pushed down into each leaf's own transform by the stack.
#[derive(Clone, Debug)]
pub struct LayerGroup {
    children: Vec<Layer>,
    isolate: bool,
    offset: Vec2,
    /// Union of the children's bounds, in the group's own space.
    local_bounds: PixelRect,
}

impl Default for LayerGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerGroup {
    pub fn new() -> Self {
        Self {
            children: Vec::new(),
            isolate: true,
            offset: Vec2::ZERO,
            local_bounds: PixelRect::EMPTY,
        }
    }

    pub fn isolate(&self) -> bool {
        self.isolate
    }

    pub fn set_isolate(&mut self, isolate: bool) -> bool {
        std::mem::replace(&mut self.isolate, isolate) != isolate
    }

    pub fn offset(&self) -> Vec2 {
        self.offset
    }

    pub fn set_offset(&mut self, offset: Vec2) -> bool {
        if self.offset == offset {
            return false;
        }
        self.offset = offset;
        true
    }

    /// Translation from the group's space to its parent's.
    pub fn offset_transform(&self) -> Transform {
        Transform::translation(self.offset.x, self.offset.y)
    }

    pub fn local_bounds(&self) -> PixelRect {
        self.local_bounds
    }

    /// Bounds in the parent's space.
    pub fn bounds(&self) -> PixelRect {
        self.offset_transform().map_pixel_rect(self.local_bounds)
    }

    pub(crate) fn children_mut(&mut self) -> &mut Vec<Layer> {
        &mut self.children
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Recompute the union of child bounds.  Returns `true` if it changed.
    pub fn update_bounds(&mut self) -> bool {
        let bounds = self
            .children
            .iter()
            .fold(PixelRect::EMPTY, |acc, c| acc.union(&c.bounds()));
        std::mem::replace(&mut self.local_bounds, bounds) != bounds
    }

    /// Insert `layer` at `index` (0 = top).
    ///
    /// # Panics
    /// If `layer` is attached elsewhere or `index > len()`.
    pub fn insert(&mut self, self_id: LayerId, mut layer: Layer, index: usize) {
        assert!(
            layer.parent.is_none(),
            "layer {} already belongs to group {:?}; remove it first",
            layer.id(),
            layer.parent
        );
        assert!(
            !self.contains(layer.id()),
            "layer {} is already a child of group {}",
            layer.id(),
            self_id
        );
        assert!(
            index <= self.children.len(),
            "insert index {} out of range 0..={}",
            index,
            self.children.len()
        );
        layer.parent = Some(self_id);
        self.children.insert(index, layer);
        self.update_bounds();
    }

    /// Detach and return the direct child `id` together with its index.
    ///
    /// # Panics
    /// If `id` is not a direct child.
    pub fn remove(&mut self, id: LayerId) -> (Layer, usize) {
        let index = self
            .child_index(id)
            .unwrap_or_else(|| panic!("layer {} is not a direct child of this group", id));
        let mut layer = self.children.remove(index);
        layer.parent = None;
        self.update_bounds();
        (layer, index)
    }

    /// Reorder a direct child.  Returns its previous index.
    ///
    /// # Panics
    /// If `id` is not a direct child or `new_index` is out of range.
    pub fn move_child(&mut self, id: LayerId, new_index: usize) -> usize {
        let index = self
            .child_index(id)
            .unwrap_or_else(|| panic!("layer {} is not a direct child of this group", id));
        assert!(
            new_index < self.children.len(),
            "move index {} out of range 0..{}",
            new_index,
            self.children.len()
        );
        let layer = self.children.remove(index);
        self.children.insert(new_index, layer);
        index
    }
}

impl ContainerLike for LayerGroup {
    fn children(&self) -> &[Layer] {
        &self.children
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::TransformCapable;

    fn group_with(children: Vec<Layer>) -> (LayerId, LayerGroup) {
        let id = LayerId::next();
        let mut g = LayerGroup::new();
        for (i, c) in children.into_iter().enumerate() {
            g.insert(id, c, i);
        }
        (id, g)
    }

    #[test]
    fn bounds_are_union_of_children() {
        let mut a = Layer::new_blank("a", 10, 10);
        a.as_image_mut().unwrap().set_transform(Transform::translation(20.0, 0.0));
        let b = Layer::new_blank("b", 5, 5);
        let (_, g) = group_with(vec![a, b]);
        assert_eq!(g.local_bounds(), PixelRect::new(0, 0, 30, 10));
    }

    #[test]
    fn remove_detaches_parent() {
        let a = Layer::new_blank("a", 1, 1);
        let aid = a.id();
        let (gid, mut g) = group_with(vec![a]);
        assert_eq!(g.children()[0].parent(), Some(gid));
        let (layer, index) = g.remove(aid);
        assert_eq!(index, 0);
        assert_eq!(layer.parent(), None);
        assert!(g.bounds().is_empty());
    }

    #[test]
    #[should_panic(expected = "remove it first")]
    fn reparenting_attached_layer_panics() {
        let mut a = Layer::new_blank("a", 1, 1);
        a.parent = Some(LayerId::next());
        let (_, mut g) = group_with(vec![]);
        g.insert(LayerId::next(), a, 0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn insert_index_is_checked() {
        let (id, mut g) = group_with(vec![]);
        g.insert(id, Layer::new_blank("a", 1, 1), 1);
    }

    #[test]
    fn move_reorders() {
        let a = Layer::new_blank("a", 1, 1);
        let b = Layer::new_blank("b", 1, 1);
        let aid = a.id();
        let (_, mut g) = group_with(vec![a, b]);
        assert_eq!(g.move_child(aid, 1), 0);
        assert_eq!(g.children()[1].id(), aid);
    }
}
