pub use makepad_widgets;
use makepad_widgets::Cx;

pub mod config;
pub mod coords;
pub mod debounce;
pub mod error;
pub mod geolocation;
pub mod geometry;
pub mod lifecycle;
pub mod picker;
pub mod picker_view;
pub mod session;
pub mod snapshot;
pub mod tiles;
pub mod wire;

pub use config::{MapPickerConfig, PickerKind};
pub use coords::{Coordinate, LatLngBounds};
pub use error::PickerError;
pub use geolocation::{FixId, GeolocationError, Geolocator, PositionOptions, StaticGeolocator};
pub use geometry::{Geometry, GeometryCollection, Shape, ShapeBuilder, ShapeId, ShapeKind};
pub use picker::{LocationState, MapEvent, MapPicker, PickerNotice};
pub use picker_view::*;
pub use snapshot::{RestorationField, RestorationSnapshot};
pub use wire::{MemoryWire, RemoteState, ServerEvent};

pub fn live_design(cx: &mut Cx) {
    crate::picker_view::live_design(cx);
}
