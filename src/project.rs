use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::components::history::History;
use crate::error::FormatResult;
use crate::io;
use crate::settings::EditorSettings;
use crate::stack::LayerStack;

/// Single open document.
pub struct Project {
    pub id: Uuid,
    pub stack: LayerStack,
    pub history: History,
    /// `None` for unsaved/untitled files.
    pub path: Option<PathBuf>,
    pub is_dirty: bool,

    /// File name of `path`, or "Untitled-N" before the first save.
    pub name: String,

    /// Longest edge of the thumbnail written on save.
    thumbnail_max_edge: u32,
}

impl Project {
    pub fn new_untitled(untitled_counter: usize, width: u32, height: u32) -> Self {
        Self::new_untitled_with_settings(untitled_counter, width, height, &EditorSettings::default())
    }

    pub fn new_untitled_with_settings(
        untitled_counter: usize,
        width: u32,
        height: u32,
        settings: &EditorSettings,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            stack: LayerStack::with_settings(width, height, settings),
            history: History::from_settings(settings),
            path: None,
            is_dirty: false,
            name: format!("Untitled-{}", untitled_counter),
            thumbnail_max_edge: settings.thumbnail_max_edge,
        }
    }

    /// Open a project file.  On failure nothing is created.
    pub fn open(path: &Path, settings: &EditorSettings) -> FormatResult<Self> {
        let stack = io::load_project(path)?;
        let mut project = Self {
            id: Uuid::new_v4(),
            stack,
            history: History::from_settings(settings),
            path: Some(path.to_path_buf()),
            is_dirty: false,
            name: String::new(),
            thumbnail_max_edge: settings.thumbnail_max_edge,
        };
        project.update_name_from_path();
        Ok(project)
    }

    /// Save to the current path.  Untitled projects need [`Project::save_as`].
    pub fn save(&mut self) -> FormatResult<bool> {
        let Some(path) = self.path.clone() else {
            return Ok(false);
        };
        io::save_project(&self.stack, &path, self.thumbnail_max_edge)?;
        self.mark_clean();
        Ok(true)
    }

    pub fn save_as(&mut self, path: &Path) -> FormatResult<()> {
        io::save_project(&self.stack, path, self.thumbnail_max_edge)?;
        self.path = Some(path.to_path_buf());
        self.update_name_from_path();
        self.mark_clean();
        Ok(())
    }

    /// Reload from disk, discarding unsaved edits and history.  A failed
    /// reload keeps the current document.
    pub fn revert(&mut self) -> FormatResult<bool> {
        let Some(path) = self.path.clone() else {
            return Ok(false);
        };
        io::load_project_into(&mut self.stack, &path)?;
        self.history.clear();
        self.mark_clean();
        Ok(true)
    }

    /// Run an edit against the document and mark it dirty.
    pub fn edit<R>(&mut self, f: impl FnOnce(&mut LayerStack, &mut History) -> R) -> R {
        let result = f(&mut self.stack, &mut self.history);
        self.mark_dirty();
        result
    }

    pub fn undo(&mut self) -> Option<String> {
        let description = self.history.undo(&mut self.stack)?;
        self.mark_dirty();
        Some(description)
    }

    pub fn redo(&mut self) -> Option<String> {
        let description = self.history.redo(&mut self.stack)?;
        self.mark_dirty();
        Some(description)
    }

    pub fn mark_dirty(&mut self) {
        self.is_dirty = true;
    }

    pub fn mark_clean(&mut self) {
        self.is_dirty = false;
    }

    pub fn update_name_from_path(&mut self) {
        if let Some(ref path) = self.path {
            self.name = path
                .file_name()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "Unknown".to_string());
        }
    }

    /// Name plus a trailing `*` while there are unsaved edits.
    pub fn display_title(&self) -> String {
        if self.is_dirty {
            format!("{}*", self.name)
        } else {
            self.name.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::PixelBuffer;
    use crate::layer::Layer;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("stackpaint-{}-{}.spk", tag, Uuid::new_v4()))
    }

    #[test]
    fn untitled_project_naming() {
        let mut p = Project::new_untitled(3, 64, 48);
        assert_eq!(p.display_title(), "Untitled-3");
        p.edit(|stack, h| stack.new_image_layer("Layer 1", h));
        assert_eq!(p.display_title(), "Untitled-3*");
        assert!(!p.save().unwrap());
    }

    #[test]
    fn save_as_then_open() {
        let path = temp_path("save");
        let mut p = Project::new_untitled(1, 16, 16);
        p.edit(|stack, h| {
            stack.add_layer(Layer::new_image("paint", PixelBuffer::filled(16, 16, [0, 128, 255, 255])), None, 0, h)
        });
        p.save_as(&path).unwrap();
        assert!(!p.is_dirty);
        assert!(p.name.ends_with(".spk"));

        let opened = Project::open(&path, &EditorSettings::default()).unwrap();
        assert_eq!(opened.stack.layer_count(), 1);
        assert_eq!(opened.stack.render().pixel(5, 5), [0, 128, 255, 255]);
        assert_ne!(opened.id, p.id);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn failed_revert_keeps_document() {
        let path = temp_path("revert");
        let mut p = Project::new_untitled(1, 8, 8);
        p.save_as(&path).unwrap();
        let id = p.edit(|stack, h| stack.new_image_layer("kept", h));
        std::fs::write(&path, b"not a project file").unwrap();
        assert!(p.revert().is_err());
        assert!(p.stack.contains(id));
        assert!(p.is_dirty);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn revert_discards_edits() {
        let path = temp_path("revert-ok");
        let mut p = Project::new_untitled(1, 8, 8);
        p.save_as(&path).unwrap();
        p.edit(|stack, h| stack.new_image_layer("scratch", h));
        assert!(p.revert().unwrap());
        assert_eq!(p.stack.layer_count(), 0);
        assert!(!p.history.can_undo());
        let _ = std::fs::remove_file(&path);
    }
}
