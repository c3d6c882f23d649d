use thiserror::Error;

use crate::geometry::{GeometryError, ShapeId, ShapeKind};

#[derive(Debug, Error)]
pub enum PickerError {
    #[error("invalid map configuration: {0}")]
    Config(#[from] serde_json::Error),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error("no live map session")]
    NoSession,
    #[error("geometry editing is disabled for this picker")]
    EditingDisabled,
    #[error("drawing {0} shapes is disabled")]
    ShapeDisabled(ShapeKind),
    #[error("shape {0} does not exist")]
    UnknownShape(ShapeId),
}
