//! Typed failures surfaced to the host.  Caller bugs (bad indices, singular
//! transforms, re-entrant history use) panic instead of appearing here.

use crate::layer::LayerId;

/// An edit the user asked for that cannot be applied.  The document is left
/// untouched; `to_string()` is suitable for a status bar.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EditError {
    #[error("no layer selected")]
    NoLayer,

    #[error("layer {0} is hidden")]
    Hidden(LayerId),

    #[error("layer {0} is locked")]
    Locked(LayerId),

    #[error("layer {0} is not a raster layer; convert it to an image layer first")]
    NotRaster(LayerId),

    #[error("nothing is selected")]
    EmptySelection,

    #[error("operation is not allowed on the selection layer")]
    SelectionTarget,
}

/// Project file or description failures.  A failed load never replaces the
/// document the caller already has.
#[derive(thiserror::Error, Debug)]
pub enum FormatError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),

    #[error("missing image payload '{0}'")]
    MissingImage(String),
}

impl From<Box<bincode::ErrorKind>> for FormatError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        FormatError::Serialize(e.to_string())
    }
}

pub type FormatResult<T> = Result<T, FormatError>;

/// Filter application failures, both synchronous and from the worker.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    #[error("bad filter parameters: {0}")]
    BadParameters(String),

    #[error("filter '{0}' panicked: {1}")]
    Panicked(String, String),

    #[error("filter failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Edit(#[from] EditError),
}

impl FilterError {
    pub fn bad_parameters(msg: impl Into<String>) -> Self {
        Self::BadParameters(msg.into())
    }
}
