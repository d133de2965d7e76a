use std::path::Path;
use std::time::Duration;

use crate::logger::LogLevel;

/// Engine settings persisted as a plain `key = value` file.  Missing files,
/// unreadable lines and unknown keys fall back to defaults silently.
#[derive(Clone, Debug, PartialEq)]
pub struct EditorSettings {
    /// Straight-alpha RGBA used to paint the selection layer.
    pub selection_color: [u8; 4],
    /// Number of recent pointer samples averaged when smoothing brush input.
    pub smoothing_window: usize,
    /// Delay before buffered pointer samples are painted.
    pub stroke_flush_ms: u64,
    /// Maximum number of undo steps
    pub max_undo_steps: usize,
    /// Undo memory cap in megabytes (0 = unlimited)
    pub max_undo_memory_mb: usize,
    pub log_level: LogLevel,
    /// Empty = no log file
    pub log_file: String,
    pub thumbnail_max_edge: u32,
}

impl Default for EditorSettings {
    fn default() -> Self {
        Self {
            selection_color: [0, 0, 255, 128],
            smoothing_window: 20,
            stroke_flush_ms: 50,
            max_undo_steps: 50,
            max_undo_memory_mb: 100,
            log_level: LogLevel::Info,
            log_file: String::new(),
            thumbnail_max_edge: 256,
        }
    }
}

impl EditorSettings {
    pub fn stroke_flush_interval(&self) -> Duration {
        Duration::from_millis(self.stroke_flush_ms)
    }

    pub fn max_undo_memory_bytes(&self) -> Option<usize> {
        (self.max_undo_memory_mb > 0).then(|| self.max_undo_memory_mb * 1024 * 1024)
    }

    /// Load from disk (returns default if the file is missing or corrupt).
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_config_string())
    }

    pub fn parse(content: &str) -> Self {
        let mut s = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            let Some((key, val)) = line.split_once('=') else { continue };
            let val = val.trim();
            match key.trim() {
                "selection_color" => {
                    if let Some(c) = Self::str_to_color(val) {
                        s.selection_color = c;
                    }
                }
                "smoothing_window" => {
                    s.smoothing_window = val.parse().ok().filter(|&n| n > 0).unwrap_or(20);
                }
                "stroke_flush_ms" => {
                    s.stroke_flush_ms = val.parse().unwrap_or(50);
                }
                "max_undo_steps" => {
                    s.max_undo_steps = val.parse().ok().filter(|&n| n > 0).unwrap_or(50);
                }
                "max_undo_memory_mb" => {
                    s.max_undo_memory_mb = val.parse().unwrap_or(100);
                }
                "log_level" => {
                    s.log_level = LogLevel::parse(val).unwrap_or_default();
                }
                "log_file" => {
                    s.log_file = val.to_string();
                }
                "thumbnail_max_edge" => {
                    s.thumbnail_max_edge = val.parse().ok().filter(|&n| n > 0).unwrap_or(256);
                }
                _ => {}
            }
        }
        s
    }

    pub fn to_config_string(&self) -> String {
        let [r, g, b, a] = self.selection_color;
        let level = match self.log_level {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        format!(
            "selection_color = {},{},{},{}\n\
             smoothing_window = {}\n\
             stroke_flush_ms = {}\n\
             max_undo_steps = {}\n\
             max_undo_memory_mb = {}\n\
             log_level = {}\n\
             log_file = {}\n\
             thumbnail_max_edge = {}\n",
            r,
            g,
            b,
            a,
            self.smoothing_window,
            self.stroke_flush_ms,
            self.max_undo_steps,
            self.max_undo_memory_mb,
            level,
            self.log_file,
            self.thumbnail_max_edge,
        )
    }

    fn str_to_color(s: &str) -> Option<[u8; 4]> {
        let parts: Vec<u8> = s
            .split(',')
            .map(|p| p.trim().parse::<u8>())
            .collect::<Result<_, _>>()
            .ok()?;
        match parts.as_slice() {
            [r, g, b, a] => Some([*r, *g, *b, *a]),
            [r, g, b] => Some([*r, *g, *b, 255]),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_text() {
        let mut s = EditorSettings::default();
        s.selection_color = [10, 20, 30, 40];
        s.smoothing_window = 8;
        s.log_level = LogLevel::Warn;
        s.log_file = "/tmp/sp.log".into();
        assert_eq!(EditorSettings::parse(&s.to_config_string()), s);
    }

    #[test]
    fn corrupt_values_fall_back() {
        let s = EditorSettings::parse("smoothing_window = -3\nselection_color = red\nnonsense\nstroke_flush_ms = 10");
        assert_eq!(s.smoothing_window, 20);
        assert_eq!(s.selection_color, EditorSettings::default().selection_color);
        assert_eq!(s.stroke_flush_ms, 10);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let s = EditorSettings::load(Path::new("/definitely/not/here.cfg"));
        assert_eq!(s, EditorSettings::default());
    }
}
