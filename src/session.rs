use crate::config::MapPickerConfig;
use crate::coords::{mercator, Coordinate, LatLngBounds, MAX_MERCATOR_LAT};
use crate::geometry::GeometryCollection;
use crate::tiles::TileLayer;

/// Map events a session can listen to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MapEventKind {
    Move,
    MoveEnd,
    Click,
    ZoomEnd,
    ShapeCreated,
    ShapeEdited,
    ShapeRemoved,
}

/// Listeners attached to the live map, at most one per event kind
#[derive(Clone, Debug, Default)]
pub struct ListenerSet {
    kinds: Vec<MapEventKind>,
}

impl ListenerSet {
    /// false when a listener for `kind` is already attached
    pub fn register(&mut self, kind: MapEventKind) -> bool {
        if self.kinds.contains(&kind) {
            return false;
        }
        self.kinds.push(kind);
        true
    }

    pub fn is_registered(&self, kind: MapEventKind) -> bool {
        self.kinds.contains(&kind)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    pub fn clear(&mut self) {
        self.kinds.clear();
    }
}

/// Camera of the map, in 256px based Web Mercator zoom levels
#[derive(Clone, Debug, PartialEq)]
pub struct MapView {
    pub center: Coordinate,
    pub zoom: f64,
    pub min_zoom: f64,
    pub max_zoom: f64,
    pub max_bounds: Option<LatLngBounds>,
    pub dragging: bool,
    /// Size of the canvas in pixels, known once the widget has drawn
    pub viewport: (f64, f64),
}

impl MapView {
    pub fn new(config: &MapPickerConfig) -> Self {
        Self {
            center: config.default,
            zoom: config.initial_zoom(),
            min_zoom: config.min_zoom(),
            max_zoom: config.max_zoom(),
            max_bounds: config.bounds,
            dragging: config.draggable,
            viewport: (256.0, 256.0),
        }
    }

    fn constrain(&self, center: Coordinate) -> Coordinate {
        let mut c = Coordinate::new(center.lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT), center.lng);
        while c.lng > 180.0 {
            c.lng -= 360.0;
        }
        while c.lng < -180.0 {
            c.lng += 360.0;
        }
        match &self.max_bounds {
            Some(bounds) => bounds.clamp(c),
            None => c,
        }
    }

    pub fn pan_to(&mut self, center: Coordinate) {
        self.center = self.constrain(center);
    }

    pub fn set_zoom(&mut self, zoom: f64) {
        self.zoom = zoom.clamp(self.min_zoom, self.max_zoom);
    }

    pub fn set_view(&mut self, center: Coordinate, zoom: Option<f64>) {
        self.pan_to(center);
        if let Some(zoom) = zoom {
            self.set_zoom(zoom);
        }
    }

    pub fn fit_bounds(&mut self, bounds: &LatLngBounds) {
        let zoom = mercator::zoom_to_fit(bounds, self.viewport.0, self.viewport.1, self.min_zoom, self.max_zoom);
        self.set_view(bounds.center(), Some(zoom));
    }

    fn world_size(&self) -> f64 {
        256.0 * 2.0_f64.powf(self.zoom)
    }

    /// Geographic position under a point of the canvas
    pub fn screen_to_geo(&self, x: f64, y: f64) -> Coordinate {
        let world_size = self.world_size();
        let (cx, cy) = mercator::project(&self.center, world_size);
        mercator::unproject(cx + x - self.viewport.0 / 2.0, cy + y - self.viewport.1 / 2.0, world_size)
    }

    /// Canvas point of a geographic position
    pub fn geo_to_screen(&self, p: &Coordinate) -> (f64, f64) {
        let world_size = self.world_size();
        let (cx, cy) = mercator::project(&self.center, world_size);
        let (px, py) = mercator::project(p, world_size);
        let mut dx = px - cx;
        // draw across the antimeridian on the short side
        if dx > world_size / 2.0 {
            dx -= world_size;
        } else if dx < -world_size / 2.0 {
            dx += world_size;
        }
        (self.viewport.0 / 2.0 + dx, self.viewport.1 / 2.0 + py - cy)
    }

    /// Center after dragging the canvas by a pixel delta from `start`
    pub fn dragged_center(&self, start: &Coordinate, dx: f64, dy: f64) -> Coordinate {
        let world_size = self.world_size();
        let (sx, sy) = mercator::project(start, world_size);
        self.constrain(mercator::unproject(sx - dx, sy - dy, world_size))
    }

    pub fn meters_per_pixel(&self) -> f64 {
        mercator::meters_per_pixel(self.center.lat, self.zoom)
    }
}

/// Marker look, as configured by the form builder
#[derive(Clone, Debug, PartialEq)]
pub struct MarkerStyle {
    pub color: String,
    pub icon_url: Option<String>,
    pub icon_size: [f64; 2],
    pub icon_anchor: [f64; 2],
    pub html: String,
    pub class_name: String,
}

impl MarkerStyle {
    pub fn from_config(config: &MapPickerConfig) -> Self {
        Self {
            color: config.marker_color.clone(),
            icon_url: config.marker_icon_url.clone(),
            icon_size: config.marker_icon_size,
            icon_anchor: config.marker_icon_anchor,
            html: config.marker_html.clone(),
            class_name: config.marker_icon_class_name.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MarkerHandle {
    pub position: Coordinate,
    pub style: MarkerStyle,
}

/// Circle drawn around the marker, radius in meters
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RangeCircle {
    pub center: Coordinate,
    pub radius: f64,
}

/// Everything a live map holds. Exists only while the container is visible.
#[derive(Clone, Debug)]
pub struct MapSession {
    pub view: MapView,
    pub tile_layer: Option<TileLayer>,
    pub marker: Option<MarkerHandle>,
    pub range_circle: Option<RangeCircle>,
    pub geometry: GeometryCollection,
    pub listeners: ListenerSet,
    revision: u64,
}

impl MapSession {
    pub fn new(config: &MapPickerConfig) -> Self {
        Self {
            view: MapView::new(config),
            tile_layer: Some(TileLayer::from_config(config)),
            marker: None,
            range_circle: None,
            geometry: GeometryCollection::new(),
            listeners: ListenerSet::default(),
            revision: 0,
        }
    }

    /// Bumped on every change the widget has to redraw for
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn touch(&mut self) {
        self.revision += 1;
    }

    pub fn marker_position(&self) -> Option<Coordinate> {
        self.marker.as_ref().map(|m| m.position)
    }

    pub fn move_marker(&mut self, to: Coordinate) -> bool {
        let Some(marker) = &mut self.marker else {
            return false;
        };
        marker.position = to;
        self.touch();
        true
    }

    /// Drop every handle and detach all listeners
    pub fn release(&mut self) {
        self.marker = None;
        self.range_circle = None;
        self.tile_layer = None;
        self.geometry.clear();
        self.listeners.clear();
        self.touch();
    }
}
