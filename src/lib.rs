//! Layered raster compositing with a brush stroke engine.
//!
//! A [`stack::LayerStack`] owns a tree of image, text and group layers plus
//! a selection layer.  Edits go through the stack and record themselves in a
//! [`components::history::History`]; [`brush::BrushEngine`] paints strokes
//! into raster layers or the selection, and [`ops`] holds filters, the
//! background filter worker and the image-generation hand-off.

pub mod logger;

pub mod blend;
pub mod brush;
pub mod canvas;
pub mod components;
pub mod error;
pub mod geometry;
pub mod io;
pub mod layer;
pub mod ops;
pub mod project;
pub mod render;
pub mod selection;
pub mod settings;
pub mod stack;
pub mod transform;

pub use error::{EditError, FilterError, FormatError, FormatResult};
pub use project::Project;
pub use stack::{BufferTarget, LayerEvent, LayerStack};
