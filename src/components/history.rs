use std::any::Any;
use std::collections::VecDeque;

use crate::canvas::PixelBuffer;
use crate::geometry::PixelRect;
use crate::layer::{Layer, LayerId};
use crate::settings::EditorSettings;
use crate::stack::{BufferTarget, LayerProperty, LayerStack};
use crate::transform::Transform;
use crate::{log_info, log_warn};

// ============================================================================
// COMMANDS
// ============================================================================

/// Upcast helper so commands can be downcast when merging.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// One reversible edit.  Pushed after its effect is already on the stack.
pub trait Command: AsAny {
    fn undo(&mut self, stack: &mut LayerStack);
    fn redo(&mut self, stack: &mut LayerStack);
    fn description(&self) -> String;
    fn memory_size(&self) -> usize;

    /// Consecutive commands with the same key are folded into one entry.
    fn merge_key(&self) -> Option<String> {
        None
    }

    /// Absorb `next` (pushed after `self`).  Hands it back if it cannot merge.
    fn merge(&mut self, next: Box<dyn Command>) -> Result<(), Box<dyn Command>> {
        Err(next)
    }
}

// ============================================================================
// PIXEL PATCHES - rect-limited before/after pixels of one buffer target
// ============================================================================

/// Pixels of one target under `rect`.
#[derive(Clone, Debug)]
pub struct PixelPatch {
    pub target: BufferTarget,
    /// Where the patch sits in the target buffer (already clamped to it).
    pub rect: PixelRect,
    pub pixels: PixelBuffer,
}

impl PixelPatch {
    /// Capture `rect` of the target's current pixels.
    pub fn capture(stack: &LayerStack, target: BufferTarget, rect: PixelRect) -> Option<Self> {
        let buffer = stack.buffer_target(target)?;
        Some(Self::from_buffer(buffer, target, rect))
    }

    /// Capture `rect` from a detached buffer (e.g. a pre-stroke snapshot).
    pub fn from_buffer(buffer: &PixelBuffer, target: BufferTarget, rect: PixelRect) -> Self {
        let rect = rect.intersect(&buffer.rect());
        Self { target, rect, pixels: buffer.copy_region(rect) }
    }

    pub fn apply(&self, stack: &mut LayerStack) {
        let Some(buffer) = stack.buffer_target_mut(self.target) else {
            log_warn!("PixelPatch: target {:?} no longer exists", self.target);
            return;
        };
        buffer.write_region(&self.pixels, self.rect.x, self.rect.y);
        stack.notify_content(self.target, self.rect);
    }

    pub fn memory_size(&self) -> usize {
        self.pixels.memory_size()
    }
}

pub struct BrushCommand {
    description: String,
    /// Target pixels before the edit.
    before_patch: PixelPatch,
    /// Target pixels after the edit.
    after_patch: PixelPatch,
}

impl BrushCommand {
    pub fn new(description: impl Into<String>, before_patch: PixelPatch, after_patch: PixelPatch) -> Self {
        Self { description: description.into(), before_patch, after_patch }
    }

    pub fn rect(&self) -> PixelRect {
        self.before_patch.rect
    }
}

impl Command for BrushCommand {
    fn undo(&mut self, stack: &mut LayerStack) {
        self.before_patch.apply(stack);
    }

    fn redo(&mut self, stack: &mut LayerStack) {
        self.after_patch.apply(stack);
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn memory_size(&self) -> usize {
        self.before_patch.memory_size() + self.after_patch.memory_size()
    }
}

// ============================================================================
// LAYER SNAPSHOT - whole-buffer swaps (filters, crops, generated content)
// ============================================================================

pub struct LayerSnapshotCommand {
    description: String,
    id: LayerId,
    before: (PixelBuffer, Transform),
    after: (PixelBuffer, Transform),
}

impl LayerSnapshotCommand {
    pub fn new(
        description: impl Into<String>,
        id: LayerId,
        before: (PixelBuffer, Transform),
        after: (PixelBuffer, Transform),
    ) -> Self {
        Self { description: description.into(), id, before, after }
    }
}

impl Command for LayerSnapshotCommand {
    fn undo(&mut self, stack: &mut LayerStack) {
        let (buffer, transform) = self.before.clone();
        stack.swap_image(self.id, buffer, transform);
    }

    fn redo(&mut self, stack: &mut LayerStack) {
        let (buffer, transform) = self.after.clone();
        stack.swap_image(self.id, buffer, transform);
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn memory_size(&self) -> usize {
        self.before.0.memory_size() + self.after.0.memory_size()
    }
}

// ============================================================================
// PROPERTY COMMAND - name/visibility/opacity/mode/lock/transform changes
// ============================================================================

pub struct PropertyCommand {
    id: LayerId,
    before: LayerProperty,
    after: LayerProperty,
}

impl PropertyCommand {
    pub fn new(id: LayerId, before: LayerProperty, after: LayerProperty) -> Self {
        Self { id, before, after }
    }
}

impl Command for PropertyCommand {
    fn undo(&mut self, stack: &mut LayerStack) {
        stack.apply_property(self.id, self.before.clone());
    }

    fn redo(&mut self, stack: &mut LayerStack) {
        stack.apply_property(self.id, self.after.clone());
    }

    fn description(&self) -> String {
        format!("Change {}", self.after.label())
    }

    fn memory_size(&self) -> usize {
        std::mem::size_of::<Self>()
    }

    fn merge_key(&self) -> Option<String> {
        self.after
            .is_continuous()
            .then(|| format!("{}:{}", self.after.label(), self.id))
    }

    fn merge(&mut self, next: Box<dyn Command>) -> Result<(), Box<dyn Command>> {
        if !(*next).as_any().is::<PropertyCommand>() {
            return Err(next);
        }
        if let Ok(other) = next.into_any().downcast::<PropertyCommand>() {
            self.after = other.after;
        }
        Ok(())
    }
}

// ============================================================================
// STRUCTURAL COMMANDS - insert / remove / move
// ============================================================================

/// Pushed after `layer` was inserted; holds it while undone.
pub struct InsertLayerCommand {
    id: LayerId,
    parent: LayerId,
    index: usize,
    detached: Option<Layer>,
}

impl InsertLayerCommand {
    pub fn new(id: LayerId, parent: LayerId, index: usize) -> Self {
        Self { id, parent, index, detached: None }
    }
}

impl Command for InsertLayerCommand {
    fn undo(&mut self, stack: &mut LayerStack) {
        self.detached = stack.detach(self.id).map(|(layer, _, _)| layer);
    }

    fn redo(&mut self, stack: &mut LayerStack) {
        if let Some(layer) = self.detached.take() {
            stack.attach(self.parent, self.index, layer);
        }
    }

    fn description(&self) -> String {
        "Add Layer".into()
    }

    fn memory_size(&self) -> usize {
        self.detached.as_ref().map_or(0, Layer::memory_size)
    }
}

/// Pushed after a layer was removed; owns it until redone.
pub struct RemoveLayerCommand {
    id: LayerId,
    parent: LayerId,
    index: usize,
    detached: Option<Layer>,
}

impl RemoveLayerCommand {
    pub fn new(layer: Layer, parent: LayerId, index: usize) -> Self {
        Self { id: layer.id(), parent, index, detached: Some(layer) }
    }
}

impl Command for RemoveLayerCommand {
    fn undo(&mut self, stack: &mut LayerStack) {
        if let Some(layer) = self.detached.take() {
            stack.attach(self.parent, self.index, layer);
        }
    }

    fn redo(&mut self, stack: &mut LayerStack) {
        self.detached = stack.detach(self.id).map(|(layer, _, _)| layer);
    }

    fn description(&self) -> String {
        "Delete Layer".into()
    }

    fn memory_size(&self) -> usize {
        self.detached.as_ref().map_or(0, Layer::memory_size)
    }
}

pub struct MoveLayerCommand {
    id: LayerId,
    from: usize,
    to: usize,
}

impl MoveLayerCommand {
    pub fn new(id: LayerId, from: usize, to: usize) -> Self {
        Self { id, from, to }
    }
}

impl Command for MoveLayerCommand {
    fn undo(&mut self, stack: &mut LayerStack) {
        stack.reorder(self.id, self.from);
    }

    fn redo(&mut self, stack: &mut LayerStack) {
        stack.reorder(self.id, self.to);
    }

    fn description(&self) -> String {
        "Move Layer".into()
    }

    fn memory_size(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

// ============================================================================
// CLOSURE COMMAND - paired do/undo closures with an optional merge tag
// ============================================================================

type StackFn = Box<dyn FnMut(&mut LayerStack)>;

pub struct ClosureCommand {
    description: String,
    tag: Option<String>,
    redo_fn: StackFn,
    undo_fn: StackFn,
}

impl ClosureCommand {
    pub fn new(
        description: impl Into<String>,
        redo_fn: impl FnMut(&mut LayerStack) + 'static,
        undo_fn: impl FnMut(&mut LayerStack) + 'static,
    ) -> Self {
        Self {
            description: description.into(),
            tag: None,
            redo_fn: Box::new(redo_fn),
            undo_fn: Box::new(undo_fn),
        }
    }

    /// Consecutive commands sharing `tag` merge: the first undo and the last redo survive.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

impl Command for ClosureCommand {
    fn undo(&mut self, stack: &mut LayerStack) {
        (self.undo_fn)(stack);
    }

    fn redo(&mut self, stack: &mut LayerStack) {
        (self.redo_fn)(stack);
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn memory_size(&self) -> usize {
        std::mem::size_of::<Self>()
    }

    fn merge_key(&self) -> Option<String> {
        self.tag.clone()
    }

    fn merge(&mut self, next: Box<dyn Command>) -> Result<(), Box<dyn Command>> {
        if !(*next).as_any().is::<ClosureCommand>() {
            return Err(next);
        }
        if let Ok(other) = next.into_any().downcast::<ClosureCommand>() {
            self.redo_fn = other.redo_fn;
        }
        Ok(())
    }
}

// ============================================================================
// COMPOUND COMMAND - one history entry made of several commands
// ============================================================================

pub struct CompoundCommand {
    description: String,
    commands: Vec<Box<dyn Command>>,
}

impl CompoundCommand {
    pub fn new(description: impl Into<String>) -> Self {
        Self { description: description.into(), commands: Vec::new() }
    }

    pub fn push(&mut self, command: Box<dyn Command>) {
        self.commands.push(command);
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl Command for CompoundCommand {
    fn undo(&mut self, stack: &mut LayerStack) {
        for cmd in self.commands.iter_mut().rev() {
            cmd.undo(stack);
        }
    }

    fn redo(&mut self, stack: &mut LayerStack) {
        for cmd in self.commands.iter_mut() {
            cmd.redo(stack);
        }
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn memory_size(&self) -> usize {
        self.commands.iter().map(|c| c.memory_size()).sum()
    }
}

// ============================================================================
// HISTORY
// ============================================================================

/// Undo/redo log owned by one document.  New entries truncate the redo
/// branch.  While a transaction is open every push lands in it, and the
/// whole transaction becomes one entry when it ends.
pub struct History {
    undo_stack: VecDeque<Box<dyn Command>>,
    redo_stack: VecDeque<Box<dyn Command>>,
    max_history_size: usize,
    /// Optional memory cap in bytes.
    max_memory_bytes: Option<usize>,
    /// Running memory total across both stacks.
    total_memory: usize,
    transaction: Option<CompoundCommand>,
    /// Blocks merging into the current top entry.
    sealed: bool,
}

/// Byte cap used until settings say otherwise.
const DEFAULT_MEMORY_CAP: usize = 100 * 1024 * 1024;

impl Default for History {
    fn default() -> Self {
        Self::new(50)
    }
}

impl History {
    pub fn new(max_history_size: usize) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: VecDeque::new(),
            max_history_size: max_history_size.max(1),
            max_memory_bytes: Some(DEFAULT_MEMORY_CAP),
            total_memory: 0,
            transaction: None,
            sealed: false,
        }
    }

    pub fn from_settings(settings: &EditorSettings) -> Self {
        let mut h = Self::new(settings.max_undo_steps);
        h.max_memory_bytes = settings.max_undo_memory_bytes();
        h
    }

    pub fn push(&mut self, command: Box<dyn Command>) {
        if let Some(tx) = self.transaction.as_mut() {
            tx.push(command);
            return;
        }

        // A fresh edit invalidates the redo branch.
        for cmd in self.redo_stack.drain(..) {
            self.total_memory = self.total_memory.saturating_sub(cmd.memory_size());
        }

        let command = match self.try_merge(command) {
            Ok(()) => return,
            Err(command) => command,
        };

        self.total_memory += command.memory_size();
        self.undo_stack.push_back(command);
        self.sealed = false;

        self.prune();
    }

    fn try_merge(&mut self, command: Box<dyn Command>) -> Result<(), Box<dyn Command>> {
        if self.sealed {
            return Err(command);
        }
        let Some(key) = command.merge_key() else { return Err(command) };
        let Some(top) = self.undo_stack.back_mut() else { return Err(command) };
        if top.merge_key().as_deref() != Some(key.as_str()) {
            return Err(command);
        }
        let before = top.memory_size();
        top.merge(command)?;
        let after = top.memory_size();
        self.total_memory = self.total_memory.saturating_sub(before) + after;
        Ok(())
    }

    /// The next push starts a new entry even if it could merge.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Open a transaction.
    ///
    /// # Panics
    /// If a transaction is already in progress.
    pub fn begin_transaction(&mut self, description: impl Into<String>) {
        assert!(
            self.transaction.is_none(),
            "history transaction already in progress; commits cannot nest"
        );
        self.transaction = Some(CompoundCommand::new(description));
    }

    /// Close the open transaction and record it as a single entry.
    ///
    /// # Panics
    /// If no transaction is open.
    pub fn end_transaction(&mut self) {
        let tx = self
            .transaction
            .take()
            .unwrap_or_else(|| panic!("end_transaction called without begin_transaction"));
        if !tx.is_empty() {
            self.push(Box::new(tx));
            self.seal();
        }
    }


    fn assert_idle(&self, what: &str) {
        assert!(
            self.transaction.is_none(),
            "cannot {} while a history transaction is in progress",
            what
        );
    }

    pub fn undo(&mut self, stack: &mut LayerStack) -> Option<String> {
        self.assert_idle("undo");
        let mut command = self.undo_stack.pop_back()?;
        let description = command.description();
        command.undo(stack);
        self.redo_stack.push_back(command);
        self.sealed = true;
        Some(description)
    }

    pub fn redo(&mut self, stack: &mut LayerStack) -> Option<String> {
        self.assert_idle("redo");
        let mut command = self.redo_stack.pop_back()?;
        let description = command.description();
        command.redo(stack);
        self.undo_stack.push_back(command);
        self.sealed = true;
        Some(description)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_description(&self) -> Option<String> {
        self.undo_stack.back().map(|c| c.description())
    }

    pub fn redo_description(&self) -> Option<String> {
        self.redo_stack.back().map(|c| c.description())
    }



    /// Drop the oldest entries past the count or byte cap.  The newest entry
    /// always survives.
    fn prune(&mut self) {
        let mut dropped = 0;
        while self.undo_stack.len() > self.max_history_size {
            if let Some(removed) = self.undo_stack.pop_front() {
                self.total_memory = self.total_memory.saturating_sub(removed.memory_size());
                dropped += 1;
            }
        }

        if let Some(max_bytes) = self.max_memory_bytes {
            while self.total_memory > max_bytes && self.undo_stack.len() > 1 {
                if let Some(removed) = self.undo_stack.pop_front() {
                    self.total_memory = self.total_memory.saturating_sub(removed.memory_size());
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            log_info!("History: pruned {} oldest entr{}", dropped, if dropped == 1 { "y" } else { "ies" });
        }
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.total_memory = 0;
        self.sealed = false;
    }

    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_count(&self) -> usize {
        self.redo_stack.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn counter_command(counter: &Rc<Cell<i32>>, delta: i32, tag: Option<&str>) -> Box<dyn Command> {
        let (a, b) = (counter.clone(), counter.clone());
        counter.set(counter.get() + delta);
        let cmd = ClosureCommand::new(
            "Count",
            move |_| a.set(a.get() + delta),
            move |_| b.set(b.get() - delta),
        );
        Box::new(match tag {
            Some(t) => cmd.with_tag(t),
            None => cmd,
        })
    }

    #[test]
    fn undo_redo_round_trip() {
        let mut stack = LayerStack::new(4, 4);
        let mut h = History::default();
        let n = Rc::new(Cell::new(0));
        h.push(counter_command(&n, 2, None));
        h.push(counter_command(&n, 3, None));
        assert_eq!(n.get(), 5);
        h.undo(&mut stack);
        assert_eq!(n.get(), 2);
        h.redo(&mut stack);
        assert_eq!(n.get(), 5);
    }

    #[test]
    fn new_push_truncates_redo() {
        let mut stack = LayerStack::new(4, 4);
        let mut h = History::default();
        let n = Rc::new(Cell::new(0));
        h.push(counter_command(&n, 1, None));
        h.undo(&mut stack);
        assert!(h.can_redo());
        h.push(counter_command(&n, 1, None));
        assert!(!h.can_redo());
    }

    #[test]
    fn tagged_commands_merge() {
        let mut stack = LayerStack::new(4, 4);
        let mut h = History::default();
        let n = Rc::new(Cell::new(0));
        for _ in 0..5 {
            h.push(counter_command(&n, 1, Some("drag")));
        }
        assert_eq!(h.undo_count(), 1);
        h.undo(&mut stack);
        assert_eq!(n.get(), 4);
        h.seal();
        h.redo(&mut stack);
        h.push(counter_command(&n, 1, Some("drag")));
        assert_eq!(h.undo_count(), 2);
    }

    #[test]
    fn count_cap_drops_oldest() {
        let mut h = History::new(3);
        let n = Rc::new(Cell::new(0));
        for _ in 0..5 {
            h.push(counter_command(&n, 1, None));
        }
        assert_eq!(h.undo_count(), 3);
    }

    #[test]
    fn transaction_is_one_entry() {
        let mut stack = LayerStack::new(4, 4);
        let mut h = History::default();
        let n = Rc::new(Cell::new(0));
        h.begin_transaction("Batch");
        h.push(counter_command(&n, 1, None));
        h.push(counter_command(&n, 10, None));
        h.end_transaction();
        assert_eq!(h.undo_count(), 1);
        assert_eq!(h.undo_description().as_deref(), Some("Batch"));
        h.undo(&mut stack);
        assert_eq!(n.get(), 0);
    }

    #[test]
    #[should_panic(expected = "already in progress")]
    fn nested_transaction_panics() {
        let mut h = History::default();
        h.begin_transaction("a");
        h.begin_transaction("b");
    }

    #[test]
    #[should_panic(expected = "transaction is in progress")]
    fn undo_during_transaction_panics() {
        let mut stack = LayerStack::new(4, 4);
        let mut h = History::default();
        h.begin_transaction("a");
        h.undo(&mut stack);
    }
}
