use makepad_widgets::{error, log};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

use crate::config::{MapPickerConfig, PickerKind};
use crate::coords::{number_from_value, Coordinate};
use crate::debounce::Debouncer;
use crate::error::PickerError;
use crate::geolocation::{FixId, Geolocator, PositionOptions, PositionResult};
use crate::geometry::{GeometryCollection, Shape, ShapeId};
use crate::lifecycle::{Lifecycle, ProbeOutcome};
use crate::session::{MapEventKind, MapSession, MarkerHandle, MarkerStyle, RangeCircle};
use crate::snapshot::{RestorationField, RestorationSnapshot};
use crate::wire::{merge_object, RemoteState, ServerEvent, REFRESH_MAP_EVENT};

/// How the current position was obtained
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocationState {
    Uninitialized,
    /// Centered on a one-shot device fix
    Located,
    /// Following periodic device fixes
    Tracking,
}

/// Pointer driven map events, reported by the widget
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MapEvent {
    Move { center: Coordinate },
    MoveEnd { center: Coordinate, zoom: f64 },
    Click { at: Coordinate },
    ZoomEnd { zoom: f64 },
}

impl MapEvent {
    pub fn kind(&self) -> MapEventKind {
        match self {
            MapEvent::Move { .. } => MapEventKind::Move,
            MapEvent::MoveEnd { .. } => MapEventKind::MoveEnd,
            MapEvent::Click { .. } => MapEventKind::Click,
            MapEvent::ZoomEnd { .. } => MapEventKind::ZoomEnd,
        }
    }
}

/// Changes the host may want to react to
#[derive(Clone, Debug, PartialEq)]
pub enum PickerNotice {
    /// Picked coordinate changed beyond the threshold
    CoordinatesChanged(Coordinate),
    /// Debounced coordinate reached the wire
    CoordinatesWritten(Coordinate),
    /// Drawn geometry reached the wire
    GeometryWritten,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FixPurpose {
    Initial,
    Track,
    Locate,
}

/// Controller of one map picker form field.
///
/// Owns the map session while the container is visible, mirrors the
/// coordinate and geometry kept in the remote state and feeds device
/// locations in. All timing comes in through `now` (seconds).
pub struct MapPicker {
    config: MapPickerConfig,
    wire: Box<dyn RemoteState>,
    geolocator: Box<dyn Geolocator>,
    initial_state: Option<Value>,
    lifecycle: Lifecycle,
    session: Option<MapSession>,
    location_state: LocationState,
    debounce: Debouncer<Coordinate>,
    last_synced: Option<Coordinate>,
    restoration: RestorationField,
    view_override: Option<RestorationSnapshot>,
    viewport: Option<(f64, f64)>,
    next_poll: Option<f64>,
    next_fix: u64,
    pending_fixes: HashMap<FixId, FixPurpose>,
    notices: Vec<PickerNotice>,
    sessions_created: u64,
}

impl MapPicker {
    pub fn new(config: MapPickerConfig, wire: impl RemoteState + 'static, geolocator: impl Geolocator + 'static) -> Self {
        let mut wire: Box<dyn RemoteState> = Box::new(wire);
        wire.subscribe(REFRESH_MAP_EVENT);
        Self {
            debounce: Debouncer::new(config.debounce_secs()),
            config,
            wire,
            geolocator: Box::new(geolocator),
            initial_state: None,
            lifecycle: Lifecycle::default(),
            session: None,
            location_state: LocationState::Uninitialized,
            last_synced: None,
            restoration: RestorationField::new(),
            view_override: None,
            viewport: None,
            next_poll: None,
            next_fix: 0,
            pending_fixes: HashMap::new(),
            notices: Vec::new(),
            sessions_created: 0,
        }
    }

    /// Display a fixed state instead of reading the wire
    pub fn with_initial_state(mut self, state: Value) -> Self {
        self.initial_state = Some(state);
        self
    }

    /// Reuse the restoration field the browser kept across navigation
    pub fn with_restoration_field(mut self, field: RestorationField) -> Self {
        self.restoration = field;
        self
    }

    pub fn config(&self) -> &MapPickerConfig {
        &self.config
    }

    pub fn session(&self) -> Option<&MapSession> {
        self.session.as_ref()
    }

    pub fn location_state(&self) -> LocationState {
        self.location_state
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn restoration_field(&self) -> &RestorationField {
        &self.restoration
    }

    pub fn pending_write(&self) -> Option<Coordinate> {
        self.debounce.pending().copied()
    }

    /// Listeners attached to the live map, zero without a session
    pub fn listener_count(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.listeners.len())
    }

    pub fn sessions_created(&self) -> u64 {
        self.sessions_created
    }

    pub fn take_notices(&mut self) -> Vec<PickerNotice> {
        std::mem::take(&mut self.notices)
    }

    fn click_to_place(&self) -> bool {
        self.config.clickable && !self.config.draggable
    }

    // ---- lifecycle ----

    pub fn attach(&mut self, now: f64) {
        self.lifecycle.attach(now);
    }

    /// Probe for the container, backing off while it is missing
    pub fn poll_container(&mut self, ready: bool, now: f64) -> ProbeOutcome {
        let outcome = self.lifecycle.probe(ready, now);
        if outcome == ProbeOutcome::GaveUp {
            error!("map container never appeared, picker for `{}` stays detached", self.config.state_path);
        }
        outcome
    }

    pub fn detach(&mut self) {
        self.destroy_session();
        self.lifecycle.detach();
    }

    pub fn handle_intersection(&mut self, ratio: f64, now: f64) {
        match self.lifecycle.observe(ratio) {
            Some(r) if r > 0.0 => {
                self.create_session(now);
            }
            Some(_) => {
                self.destroy_session();
            }
            None => {}
        }
    }

    /// Canvas size in pixels, used for fitting geometry into view
    pub fn set_viewport(&mut self, width: f64, height: f64) {
        self.viewport = Some((width, height));
        if let Some(session) = &mut self.session {
            session.view.viewport = (width, height);
        }
    }

    /// Build the live map. No-op while a session exists.
    pub fn create_session(&mut self, now: f64) -> bool {
        if self.session.is_some() {
            return false;
        }
        let mut session = MapSession::new(&self.config);
        if let Some(viewport) = self.viewport {
            session.view.viewport = viewport;
        }

        session.listeners.register(MapEventKind::MoveEnd);
        session.listeners.register(MapEventKind::ZoomEnd);
        if self.config.draggable {
            session.listeners.register(MapEventKind::Move);
        }
        if self.config.clickable {
            session.listeners.register(MapEventKind::Click);
        }
        if self.config.geometry.show {
            session.listeners.register(MapEventKind::ShapeCreated);
            session.listeners.register(MapEventKind::ShapeEdited);
            session.listeners.register(MapEventKind::ShapeRemoved);
        }

        let (coord, zoom, from_state) = match self.view_override.take() {
            Some(snapshot) => (snapshot.coordinate(), Some(snapshot.zoom), true),
            None => {
                let (coord, from_state) = self.resolve_coordinates();
                (coord, None, from_state)
            }
        };
        session.view.set_view(coord, zoom);
        if self.config.show_marker && (from_state || !self.click_to_place()) {
            session.marker = Some(MarkerHandle {
                position: session.view.center,
                style: MarkerStyle::from_config(&self.config),
            });
        }
        self.last_synced = Some(session.view.center);
        self.session = Some(session);
        self.sessions_created += 1;

        self.refresh_range_overlay();
        if self.config.geometry.show {
            self.load_geometry();
        }
        if self.initial_state.is_none() && self.config.wants_initial_fix(&coord) {
            self.request_fix(FixPurpose::Initial);
        }
        if self.config.live_location.tracks() {
            self.next_poll = Some(now + self.config.live_location.interval_secs());
        }
        log!("map session created for `{}`", self.config.state_path);
        true
    }

    /// Release the live map. A pending debounced write survives.
    pub fn destroy_session(&mut self) -> bool {
        let Some(mut session) = self.session.take() else {
            return false;
        };
        session.release();
        self.next_poll = None;
        // answers to requests of this session are stale from now on
        self.pending_fixes.clear();
        log!("map session released for `{}`", self.config.state_path);
        true
    }

    // ---- coordinates ----

    /// Coordinate to show: initial state, then the wire, then the default
    pub fn get_coordinates(&self) -> Coordinate {
        self.resolve_coordinates().0
    }

    fn resolve_coordinates(&self) -> (Coordinate, bool) {
        let found = match &self.initial_state {
            Some(state) => Coordinate::from_value(state),
            None => self.wire.get(&self.config.state_path).as_ref().and_then(Coordinate::from_value),
        };
        match found {
            Some(coord) => (coord, true),
            None => (self.config.default, false),
        }
    }

    /// Move the marker now and schedule the remote write
    pub fn set_coordinates(&mut self, coord: Coordinate, now: f64) {
        if !coord.is_finite() {
            return;
        }
        let coord = match &self.config.bounds {
            Some(bounds) => bounds.clamp(coord),
            None => coord,
        };
        let zoom = match &mut self.session {
            Some(session) => {
                session.move_marker(coord);
                if let Some(circle) = &mut session.range_circle {
                    circle.center = coord;
                }
                session.touch();
                Some(session.view.zoom)
            }
            None => None,
        };
        self.save_snapshot(Some(coord), zoom);

        let changed = match self.last_synced {
            Some(previous) => coord.differs_from(&previous, self.config.change_threshold),
            None => true,
        };
        if !changed {
            return;
        }
        self.last_synced = Some(coord);
        self.notices.push(PickerNotice::CoordinatesChanged(coord));
        if self.config.kind == PickerKind::Field {
            self.debounce.schedule(now, coord);
        }
    }

    fn write_coordinates(&mut self, coord: Coordinate) {
        let path = self.config.state_path.clone();
        let mut fields = Map::new();
        fields.insert("lat".to_string(), json!(coord.lat));
        fields.insert("lng".to_string(), json!(coord.lng));
        let merged = merge_object(self.wire.get(&path), fields);
        self.wire.set(&path, merged, false);
        if self.config.live_location.send {
            self.wire.refresh();
        }
        self.notices.push(PickerNotice::CoordinatesWritten(coord));
    }

    pub fn handle_map_event(&mut self, event: MapEvent, now: f64) {
        let click_to_place = self.click_to_place();
        let Some(session) = &mut self.session else {
            return;
        };
        if !session.listeners.is_registered(event.kind()) {
            return;
        }
        match event {
            MapEvent::Move { center } => {
                session.view.pan_to(center);
                let center = session.view.center;
                // the marker stays pinned to the center while dragging
                session.move_marker(center);
                if let Some(circle) = &mut session.range_circle {
                    circle.center = center;
                }
                session.touch();
            }
            MapEvent::MoveEnd { center, zoom } => {
                session.view.set_view(center, Some(zoom));
                session.touch();
                let (center, zoom) = (session.view.center, session.view.zoom);
                if self.config.draggable {
                    self.set_coordinates(center, now);
                } else {
                    self.save_snapshot(None, Some(zoom));
                }
            }
            MapEvent::Click { at } => {
                if self.config.show_marker && session.marker.is_none() {
                    session.marker = Some(MarkerHandle {
                        position: at,
                        style: MarkerStyle::from_config(&self.config),
                    });
                }
                if !click_to_place {
                    session.view.pan_to(at);
                }
                session.touch();
                self.set_coordinates(at, now);
                self.refresh_range_overlay();
            }
            MapEvent::ZoomEnd { zoom } => {
                session.view.set_zoom(zoom);
                session.touch();
                let zoom = session.view.zoom;
                self.save_snapshot(None, Some(zoom));
            }
        }
    }

    /// Drive timers: geolocation answers, server events, the debounced
    /// write and live location polling
    pub fn tick(&mut self, now: f64) {
        for (id, result) in self.geolocator.take_resolved() {
            self.handle_position(id, result, now);
        }
        for event in self.wire.take_server_events() {
            self.handle_server_event(&event, now);
        }
        if let Some(coord) = self.debounce.poll(now) {
            self.write_coordinates(coord);
        }
        if let Some(at) = self.next_poll {
            if now >= at && self.session.is_some() {
                self.request_fix(FixPurpose::Track);
                self.next_poll = Some(now + self.config.live_location.interval_secs());
            }
        }
    }

    // ---- location ----

    fn request_fix(&mut self, purpose: FixPurpose) -> FixId {
        self.next_fix += 1;
        let id = FixId(self.next_fix);
        self.pending_fixes.insert(id, purpose);
        let options = PositionOptions { enable_high_accuracy: true, ..Default::default() };
        self.geolocator.request_position(id, &options);
        id
    }

    /// Fetch the device position and recenter on it
    pub fn locate_me(&mut self) -> Option<FixId> {
        self.session.as_ref()?;
        Some(self.request_fix(FixPurpose::Locate))
    }

    /// Apply a device position answer. Unknown or stale requests are dropped.
    pub fn handle_position(&mut self, id: FixId, result: PositionResult, now: f64) {
        let Some(purpose) = self.pending_fixes.remove(&id) else {
            return;
        };
        let coord = match result {
            Ok(coord) if coord.is_finite() => coord,
            Ok(_) => return,
            Err(e) => {
                error!("location fix for `{}` failed: {}", self.config.state_path, e);
                return;
            }
        };
        let Some(session) = &mut self.session else {
            return;
        };
        match purpose {
            FixPurpose::Initial => {
                session.view.set_view(coord, Some(self.config.initial_zoom()));
                self.location_state = LocationState::Located;
            }
            FixPurpose::Locate => {
                session.view.pan_to(coord);
                self.location_state = LocationState::Located;
            }
            FixPurpose::Track => {
                session.view.pan_to(coord);
                self.location_state = LocationState::Tracking;
            }
        }
        session.touch();
        self.set_coordinates(coord, now);
        self.refresh_range_overlay();
    }

    // ---- range overlay ----

    /// Re-read the range field and move or resize the circle
    pub fn range_field_changed(&mut self) {
        self.refresh_range_overlay();
    }

    fn refresh_range_overlay(&mut self) {
        if self.session.is_none() {
            return;
        }
        let radius = self
            .config
            .range_path()
            .and_then(|path| self.wire.get(&path))
            .and_then(|v| number_from_value(&v))
            .filter(|r| r.is_finite() && *r > 0.0);
        let Some(session) = &mut self.session else {
            return;
        };
        match (radius, session.marker_position()) {
            (Some(radius), Some(center)) => match &mut session.range_circle {
                Some(circle) => {
                    circle.center = center;
                    circle.radius = radius;
                }
                None => session.range_circle = Some(RangeCircle { center, radius }),
            },
            _ => session.range_circle = None,
        }
        session.touch();
    }

    // ---- geometry editor ----

    fn editor_session(&mut self) -> Result<&mut MapSession, PickerError> {
        if !self.config.geometry.show {
            return Err(PickerError::EditingDisabled);
        }
        self.session.as_mut().ok_or(PickerError::NoSession)
    }

    pub fn shape_created(&mut self, shape: Shape) -> Result<ShapeId, PickerError> {
        let kind = shape.kind();
        if !self.config.geometry.allows(kind) {
            return Err(PickerError::ShapeDisabled(kind));
        }
        let session = self.editor_session()?;
        shape.geometry.validate()?;
        let id = session.geometry.insert(shape, true);
        session.touch();
        self.commit_geometry();
        Ok(id)
    }

    pub fn shape_edited(&mut self, id: ShapeId, shape: Shape) -> Result<(), PickerError> {
        let session = self.editor_session()?;
        match session.geometry.get(id) {
            None => return Err(PickerError::UnknownShape(id)),
            Some(drawn) if !drawn.editable => return Err(PickerError::EditingDisabled),
            Some(_) => {}
        }
        shape.geometry.validate()?;
        session.geometry.replace(id, shape);
        session.touch();
        self.commit_geometry();
        Ok(())
    }

    /// Remove a shape. Removing one that is already gone still re-commits.
    pub fn shape_removed(&mut self, id: ShapeId) -> Result<(), PickerError> {
        if !self.config.geometry.delete_layer {
            return Err(PickerError::EditingDisabled);
        }
        let session = self.editor_session()?;
        if session.geometry.remove(id).is_none() {
            log!("shape {} was already removed", id);
        }
        session.touch();
        self.commit_geometry();
        Ok(())
    }

    /// Serialize the drawn geometry and write it, skipping malformed shapes
    fn commit_geometry(&mut self) -> bool {
        let Some(session) = &self.session else {
            return false;
        };
        let geojson = match session.geometry.to_geojson() {
            Ok(geojson) => geojson,
            Err(e) => {
                error!("not writing geometry for `{}`: {}", self.config.state_path, e);
                return false;
            }
        };
        if self.config.kind == PickerKind::Infolist {
            return false;
        }
        self.wire.set(&self.config.geometry_path(), geojson, true);
        self.notices.push(PickerNotice::GeometryWritten);
        true
    }

    fn load_geometry(&mut self) {
        let stored = match &self.initial_state {
            Some(state) => state.get("geojson").filter(|v| !v.is_null()).cloned(),
            None => self.wire.get(&self.config.geometry_path()),
        };
        let Some(stored) = stored else {
            return;
        };
        let (collection, errors) = GeometryCollection::from_geojson(&stored, self.config.geometry.editable);
        for e in errors {
            error!("ignoring stored shape for `{}`: {}", self.config.state_path, e);
        }
        let Some(session) = &mut self.session else {
            return;
        };
        if let Some(bounds) = collection.bounds() {
            session.view.fit_bounds(&bounds);
        }
        session.geometry.reload(collection);
        session.touch();
    }

    // ---- server events ----

    pub fn handle_server_event(&mut self, event: &ServerEvent, _now: f64) {
        match event {
            ServerEvent::RefreshMap => self.refresh_from_remote(),
            ServerEvent::Other(name) => log!("ignoring server event `{}`", name),
        }
    }

    fn refresh_from_remote(&mut self) {
        if self.session.is_none() {
            return;
        }
        let (coord, from_state) = self.resolve_coordinates();
        let show_marker = self.config.show_marker;
        let style = MarkerStyle::from_config(&self.config);
        let Some(session) = &mut self.session else {
            return;
        };
        session.view.pan_to(coord);
        let center = session.view.center;
        if !session.move_marker(center) && show_marker && from_state {
            session.marker = Some(MarkerHandle { position: center, style });
        }
        session.touch();
        self.last_synced = Some(center);
        if self.config.geometry.show {
            self.load_geometry();
        }
        self.refresh_range_overlay();
    }

    // ---- restoration ----

    /// Cache the view in the restoration field. Missing parts come from the
    /// live session.
    pub fn save_snapshot(&mut self, coords: Option<Coordinate>, zoom: Option<f64>) {
        let session = self.session.as_ref();
        let coord = coords
            .or_else(|| session.map(|s| s.marker_position().unwrap_or(s.view.center)))
            .or(self.last_synced);
        let Some(coord) = coord else {
            return;
        };
        let zoom = zoom
            .or_else(|| session.map(|s| s.view.zoom))
            .unwrap_or_else(|| self.config.initial_zoom());
        self.restoration.save(&RestorationSnapshot { lat: coord.lat, lng: coord.lng, zoom });
    }

    pub fn load_snapshot(&self) -> Option<RestorationSnapshot> {
        self.restoration.load()
    }

    /// Page came back from the back/forward cache. Re-apply the cached view
    /// without going through the wire.
    pub fn handle_page_show(&mut self) -> bool {
        let Some(snapshot) = self.restoration.load() else {
            return false;
        };
        let Some(session) = &mut self.session else {
            self.view_override = Some(snapshot);
            return true;
        };
        session.view.set_view(snapshot.coordinate(), Some(snapshot.zoom));
        let center = session.view.center;
        session.move_marker(center);
        if let Some(circle) = &mut session.range_circle {
            circle.center = center;
        }
        session.touch();
        self.last_synced = Some(center);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geolocation::{GeolocationError, StaticGeolocator};
    use crate::geometry::{Geometry, GeometryError, ShapeKind};
    use crate::wire::MemoryWire;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Wire = Rc<RefCell<MemoryWire>>;
    type Geo = Rc<RefCell<StaticGeolocator>>;

    fn setup(config: Value, state: Value) -> (MapPicker, Wire, Geo) {
        let config = MapPickerConfig::from_value(config).unwrap();
        let wire = Rc::new(RefCell::new(MemoryWire::with_state(state)));
        let geo = Rc::new(RefCell::new(StaticGeolocator::unavailable()));
        let picker = MapPicker::new(config, wire.clone(), geo.clone());
        (picker, wire, geo)
    }

    fn visible(picker: &mut MapPicker, now: f64) {
        picker.attach(now);
        picker.handle_intersection(1.0, now);
    }

    fn coordinate_writes(wire: &Wire) -> Vec<Value> {
        wire.borrow()
            .sets
            .iter()
            .filter(|(path, _, _)| path == "data.location")
            .map(|(_, value, _)| value.clone())
            .collect()
    }

    #[test]
    fn reads_exact_coordinates_from_state() {
        for (lat, lng) in [(0.5, 0.5), (-90.0, 180.0), (90.0, -180.0), (51.5, -0.12)] {
            let (picker, _, _) = setup(json!({"statePath": "data.location"}), json!({"data": {"location": {"lat": lat, "lng": lng}}}));
            assert_eq!(picker.get_coordinates(), Coordinate::new(lat, lng));
        }
    }

    #[test]
    fn falls_back_to_default_when_state_is_incomplete() {
        let config = json!({"statePath": "data.location", "default": {"lat": 51.5, "lng": -0.12}});
        for state in [json!({}), json!({"data": {"location": {"lat": 1.0}}}), json!({"data": {"location": {"lat": null, "lng": 2.0}}})] {
            let (picker, _, _) = setup(config.clone(), state);
            assert_eq!(picker.get_coordinates(), Coordinate::new(51.5, -0.12));
        }
    }

    #[test]
    fn initial_state_wins_over_wire() {
        let (picker, _, _) = setup(
            json!({"statePath": "data.location", "type": "infolist"}),
            json!({"data": {"location": {"lat": 1.0, "lng": 1.0}}}),
        );
        let picker = picker.with_initial_state(json!({"lat": 7.0, "lng": 8.0}));
        assert_eq!(picker.get_coordinates(), Coordinate::new(7.0, 8.0));
    }

    #[test]
    fn rapid_updates_coalesce_into_one_write() {
        let (mut picker, wire, _) = setup(json!({"statePath": "data.location"}), json!({"data": {"location": {"lat": 1.0, "lng": 1.0}}}));
        visible(&mut picker, 0.0);
        for (i, lat) in [2.0, 2.01, 2.02, 2.03, 2.04].into_iter().enumerate() {
            let t = i as f64 * 0.025;
            picker.set_coordinates(Coordinate::new(lat, 3.0), t);
            picker.tick(t);
        }
        picker.tick(0.4);
        assert!(coordinate_writes(&wire).is_empty());
        picker.tick(0.7);
        let writes = coordinate_writes(&wire);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0], json!({"lat": 2.04, "lng": 3.0}));
        picker.tick(5.0);
        assert_eq!(coordinate_writes(&wire).len(), 1);
    }

    #[test]
    fn marker_moves_before_the_write() {
        let (mut picker, wire, _) = setup(json!({"statePath": "data.location"}), json!({}));
        visible(&mut picker, 0.0);
        picker.set_coordinates(Coordinate::new(4.0, 5.0), 0.0);
        assert_eq!(picker.session().unwrap().marker_position(), Some(Coordinate::new(4.0, 5.0)));
        assert!(coordinate_writes(&wire).is_empty());
        assert_eq!(picker.pending_write(), Some(Coordinate::new(4.0, 5.0)));
    }

    #[test]
    fn jitter_below_threshold_is_not_written() {
        let (mut picker, wire, _) = setup(json!({"statePath": "data.location"}), json!({"data": {"location": {"lat": 10.0, "lng": 20.0}}}));
        visible(&mut picker, 0.0);
        picker.set_coordinates(Coordinate::new(10.0 + 1e-7, 20.0), 0.0);
        picker.tick(1.0);
        assert!(coordinate_writes(&wire).is_empty());

        picker.set_coordinates(Coordinate::new(10.0 + 1e-3, 20.0), 1.0);
        picker.tick(2.0);
        assert_eq!(coordinate_writes(&wire).len(), 1);
    }

    #[test]
    fn write_keeps_sibling_geometry() {
        let geojson = json!({"type": "FeatureCollection", "features": []});
        let (mut picker, wire, _) = setup(
            json!({"statePath": "data.location"}),
            json!({"data": {"location": {"lat": 1.0, "lng": 1.0, "geojson": geojson.clone()}}}),
        );
        visible(&mut picker, 0.0);
        picker.set_coordinates(Coordinate::new(3.0, 4.0), 0.0);
        picker.tick(1.0);
        let state = wire.borrow().get("data.location").unwrap();
        assert_eq!(state, json!({"lat": 3.0, "lng": 4.0, "geojson": geojson}));
    }

    #[test]
    fn live_location_send_refreshes_after_write() {
        let (mut picker, wire, _) = setup(json!({"statePath": "data.location", "liveLocation": {"send": true}}), json!({}));
        visible(&mut picker, 0.0);
        picker.set_coordinates(Coordinate::new(3.0, 4.0), 0.0);
        picker.tick(1.0);
        assert_eq!(wire.borrow().refreshes, 1);
    }

    #[test]
    fn infolist_never_writes() {
        let (mut picker, wire, _) = setup(json!({"statePath": "data.location", "type": "infolist"}), json!({}));
        visible(&mut picker, 0.0);
        picker.set_coordinates(Coordinate::new(3.0, 4.0), 0.0);
        picker.tick(1.0);
        assert!(wire.borrow().sets.is_empty());
    }

    #[test]
    fn snapshot_is_written_without_debounce() {
        let (mut picker, _, _) = setup(json!({"statePath": "data.location"}), json!({}));
        visible(&mut picker, 0.0);
        picker.set_coordinates(Coordinate::new(3.0, 4.0), 0.0);
        let snapshot = picker.load_snapshot().unwrap();
        assert_eq!(snapshot.coordinate(), Coordinate::new(3.0, 4.0));
        assert_eq!(snapshot.zoom, 15.0);
    }

    #[test]
    fn session_follows_visibility() {
        let (mut picker, _, _) = setup(json!({"statePath": "data.location", "clickable": true}), json!({}));
        picker.attach(0.0);
        let mut listener_counts = Vec::new();
        for (i, ratio) in [0.0, 1.0, 0.0, 1.0, 0.0].into_iter().enumerate() {
            picker.handle_intersection(ratio, i as f64);
            assert_eq!(picker.session().is_some(), ratio > 0.0);
            listener_counts.push(picker.listener_count());
        }
        assert_eq!(listener_counts[1], listener_counts[3]);
        assert_eq!(listener_counts[1], 4);
        assert_eq!(listener_counts[4], 0);
        assert_eq!(picker.sessions_created(), 2);
    }

    #[test]
    fn create_session_is_idempotent() {
        let (mut picker, _, _) = setup(json!({}), json!({}));
        visible(&mut picker, 0.0);
        picker.handle_intersection(0.5, 1.0);
        assert!(!picker.create_session(2.0));
        assert_eq!(picker.sessions_created(), 1);
    }

    #[test]
    fn teardown_keeps_pending_write() {
        let (mut picker, wire, _) = setup(json!({"statePath": "data.location"}), json!({}));
        visible(&mut picker, 0.0);
        picker.set_coordinates(Coordinate::new(3.0, 4.0), 0.0);
        picker.handle_intersection(0.0, 0.1);
        assert!(picker.session().is_none());
        picker.tick(1.0);
        assert_eq!(coordinate_writes(&wire).len(), 1);
    }

    #[test]
    fn origin_without_default_asks_for_a_fix() {
        let (mut picker, _, geo) = setup(json!({"statePath": "data.location"}), json!({}));
        geo.borrow_mut().set_position(Some(Coordinate::new(48.85, 2.35)));
        visible(&mut picker, 0.0);
        assert_eq!(geo.borrow().requests.len(), 1);
        assert!(geo.borrow().requests[0].1.enable_high_accuracy);
        picker.tick(0.1);
        assert_eq!(picker.location_state(), LocationState::Located);
        assert_eq!(picker.session().unwrap().view.center, Coordinate::new(48.85, 2.35));
    }

    #[test]
    fn failed_fix_leaves_default_view() {
        let (mut picker, _, geo) = setup(json!({"statePath": "data.location"}), json!({}));
        visible(&mut picker, 0.0);
        assert_eq!(geo.borrow().requests.len(), 1);
        picker.tick(0.1);
        assert_eq!(picker.location_state(), LocationState::Uninitialized);
        assert_eq!(picker.session().unwrap().view.center, Coordinate::ORIGIN);
    }

    #[test]
    fn explicit_default_skips_the_fix() {
        let (mut picker, _, geo) = setup(json!({"default": {"lat": 51.5, "lng": -0.12}}), json!({}));
        visible(&mut picker, 0.0);
        assert!(geo.borrow().requests.is_empty());
    }

    #[test]
    fn stale_fix_after_teardown_is_ignored() {
        let (mut picker, _, _) = setup(json!({"statePath": "data.location"}), json!({}));
        visible(&mut picker, 0.0);
        let id = picker.locate_me().unwrap();
        picker.handle_intersection(0.0, 0.1);
        picker.handle_position(id, Ok(Coordinate::new(1.0, 1.0)), 0.2);
        assert!(picker.session().is_none());
        assert_eq!(picker.pending_write(), None);
        assert_eq!(picker.location_state(), LocationState::Uninitialized);
    }

    #[test]
    fn tracking_polls_and_survives_failures() {
        let (mut picker, wire, geo) = setup(
            json!({"statePath": "data.location", "default": {"lat": 1.0, "lng": 1.0},
                   "liveLocation": {"send": true, "realtime": true, "miliseconds": 1000}}),
            json!({}),
        );
        visible(&mut picker, 0.0);
        picker.tick(0.5);
        assert!(geo.borrow().requests.is_empty());

        picker.tick(1.0);
        assert_eq!(geo.borrow().requests.len(), 1);
        picker.tick(1.1);
        assert_eq!(picker.location_state(), LocationState::Uninitialized);

        geo.borrow_mut().set_position(Some(Coordinate::new(2.0, 2.0)));
        picker.tick(2.0);
        picker.tick(2.1);
        assert_eq!(geo.borrow().requests.len(), 2);
        assert_eq!(picker.location_state(), LocationState::Tracking);
        assert_eq!(picker.session().unwrap().view.center, Coordinate::new(2.0, 2.0));
        picker.tick(3.0);
        assert!(coordinate_writes(&wire).contains(&json!({"lat": 2.0, "lng": 2.0})));

        assert_eq!(geo.borrow().requests.len(), 3);

        picker.handle_intersection(0.0, 3.5);
        picker.tick(10.0);
        picker.tick(20.0);
        assert_eq!(geo.borrow().requests.len(), 3);
    }

    #[test]
    fn explicit_position_errors_do_not_panic() {
        let (mut picker, _, _) = setup(json!({"default": {"lat": 1.0, "lng": 1.0}}), json!({}));
        visible(&mut picker, 0.0);
        let id = picker.locate_me().unwrap();
        picker.handle_position(id, Err(GeolocationError::PermissionDenied), 0.1);
        assert_eq!(picker.session().unwrap().view.center, Coordinate::new(1.0, 1.0));
    }

    #[test]
    fn draggable_map_syncs_on_move_end() {
        let (mut picker, wire, _) = setup(json!({"statePath": "data.location", "default": {"lat": 1.0, "lng": 1.0}}), json!({}));
        visible(&mut picker, 0.0);
        picker.handle_map_event(MapEvent::Move { center: Coordinate::new(1.5, 1.5) }, 0.1);
        assert_eq!(picker.session().unwrap().marker_position(), Some(Coordinate::new(1.5, 1.5)));
        picker.handle_map_event(MapEvent::MoveEnd { center: Coordinate::new(2.0, 2.0), zoom: 12.0 }, 0.2);
        picker.tick(1.0);
        assert_eq!(coordinate_writes(&wire), vec![json!({"lat": 2.0, "lng": 2.0})]);
        assert_eq!(picker.load_snapshot().unwrap().zoom, 12.0);
    }

    #[test]
    fn click_to_place_creates_marker_on_first_click() {
        let (mut picker, wire, _) = setup(
            json!({"statePath": "data.location", "draggable": false, "clickable": true, "default": {"lat": 1.0, "lng": 1.0}}),
            json!({"data": {"distance": 250}}),
        );
        visible(&mut picker, 0.0);
        assert!(picker.session().unwrap().marker.is_none());
        assert!(picker.session().unwrap().range_circle.is_none());

        picker.handle_map_event(MapEvent::Move { center: Coordinate::new(9.0, 9.0) }, 0.1);
        picker.handle_map_event(MapEvent::Click { at: Coordinate::new(3.0, 4.0) }, 0.2);
        let session = picker.session().unwrap();
        assert_eq!(session.marker_position(), Some(Coordinate::new(3.0, 4.0)));
        assert_eq!(session.range_circle, Some(RangeCircle { center: Coordinate::new(3.0, 4.0), radius: 250.0 }));
        picker.tick(1.0);
        assert_eq!(coordinate_writes(&wire), vec![json!({"lat": 3.0, "lng": 4.0})]);
    }

    #[test]
    fn clicks_ignored_unless_clickable() {
        let (mut picker, _, _) = setup(json!({"default": {"lat": 1.0, "lng": 1.0}}), json!({}));
        visible(&mut picker, 0.0);
        picker.handle_map_event(MapEvent::Click { at: Coordinate::new(3.0, 4.0) }, 0.2);
        assert_eq!(picker.session().unwrap().marker_position(), Some(Coordinate::new(1.0, 1.0)));
    }

    #[test]
    fn coordinates_are_clamped_to_bounds() {
        let (mut picker, _, _) = setup(
            json!({"bounds": {"sw": {"lat": 49.5, "lng": -11}, "ne": {"lat": 61, "lng": 2}}, "default": {"lat": 55.25, "lng": -4.5}}),
            json!({}),
        );
        visible(&mut picker, 0.0);
        picker.set_coordinates(Coordinate::new(40.0, 10.0), 0.1);
        assert_eq!(picker.session().unwrap().marker_position(), Some(Coordinate::new(49.5, 2.0)));
    }

    #[test]
    fn range_circle_moves_and_resizes() {
        let (mut picker, wire, _) = setup(
            json!({"statePath": "data.location", "default": {"lat": 1.0, "lng": 1.0}}),
            json!({"data": {"distance": "100"}}),
        );
        visible(&mut picker, 0.0);
        assert_eq!(picker.session().unwrap().range_circle.unwrap().radius, 100.0);

        picker.set_coordinates(Coordinate::new(2.0, 2.0), 0.1);
        assert_eq!(picker.session().unwrap().range_circle.unwrap().center, Coordinate::new(2.0, 2.0));

        wire.borrow_mut().put("data.distance", json!(300));
        picker.range_field_changed();
        assert_eq!(picker.session().unwrap().range_circle.unwrap().radius, 300.0);

        wire.borrow_mut().put("data.distance", Value::Null);
        picker.range_field_changed();
        assert!(picker.session().unwrap().range_circle.is_none());
    }

    #[test]
    fn range_circle_follows_the_pan() {
        let (mut picker, _, _) = setup(
            json!({"statePath": "data.location", "default": {"lat": 1.0, "lng": 1.0}}),
            json!({"data": {"distance": 100}}),
        );
        visible(&mut picker, 0.0);
        picker.handle_map_event(MapEvent::Move { center: Coordinate::new(1.5, 1.5) }, 0.1);
        let session = picker.session().unwrap();
        assert_eq!(session.marker_position(), Some(Coordinate::new(1.5, 1.5)));
        assert_eq!(session.range_circle.unwrap().center, Coordinate::new(1.5, 1.5));
    }

    #[test]
    fn refresh_event_repulls_state() {
        let (mut picker, wire, _) = setup(json!({"statePath": "data.location"}), json!({"data": {"location": {"lat": 1.0, "lng": 1.0}}}));
        visible(&mut picker, 0.0);
        wire.borrow_mut().put("data.location", json!({"lat": 6.0, "lng": 7.0}));
        assert!(wire.borrow_mut().dispatch(REFRESH_MAP_EVENT));
        picker.tick(0.1);
        let session = picker.session().unwrap();
        assert_eq!(session.view.center, Coordinate::new(6.0, 7.0));
        assert_eq!(session.marker_position(), Some(Coordinate::new(6.0, 7.0)));
    }

    #[test]
    fn page_show_restores_without_remote_read() {
        let (mut picker, wire, _) = setup(json!({"statePath": "data.location"}), json!({"data": {"location": {"lat": 1.0, "lng": 1.0}}}));
        visible(&mut picker, 0.0);
        picker.save_snapshot(Some(Coordinate::new(5.0, 6.0)), Some(10.0));
        let reads = wire.borrow().reads();
        assert!(picker.handle_page_show());
        assert_eq!(wire.borrow().reads(), reads);
        let session = picker.session().unwrap();
        assert_eq!(session.view.center, Coordinate::new(5.0, 6.0));
        assert_eq!(session.view.zoom, 10.0);
        assert_eq!(session.marker_position(), Some(Coordinate::new(5.0, 6.0)));
    }

    #[test]
    fn page_show_before_session_overrides_first_view() {
        let field = RestorationField::with_value(r#"{"lat": 5, "lng": 6, "zoom": 10}"#);
        let (picker, _, geo) = setup(json!({"statePath": "data.location"}), json!({}));
        let mut picker = picker.with_restoration_field(field);
        picker.attach(0.0);
        assert!(picker.handle_page_show());
        picker.handle_intersection(1.0, 0.0);
        assert_eq!(picker.session().unwrap().view.center, Coordinate::new(5.0, 6.0));
        assert_eq!(picker.session().unwrap().view.zoom, 10.0);
        assert!(geo.borrow().requests.is_empty());
    }

    #[test]
    fn page_show_with_garbage_snapshot_is_noop() {
        let (picker, _, _) = setup(json!({}), json!({}));
        let mut picker = picker.with_restoration_field(RestorationField::with_value("{oops"));
        visible(&mut picker, 0.0);
        assert!(!picker.handle_page_show());
    }

    fn editor() -> (MapPicker, Wire) {
        let (mut picker, wire, _) = setup(
            json!({"statePath": "data.location", "default": {"lat": 1.0, "lng": 1.0}, "geoMan": {"show": true, "drawText": false}}),
            json!({}),
        );
        visible(&mut picker, 0.0);
        (picker, wire)
    }

    fn geometry_writes(wire: &Wire) -> Vec<Value> {
        wire.borrow()
            .sets
            .iter()
            .filter(|(path, _, _)| path == "data.location.geojson")
            .map(|(_, value, _)| value.clone())
            .collect()
    }

    #[test]
    fn created_shapes_commit_immediately() {
        let (mut picker, wire) = editor();
        let id = picker
            .shape_created(Shape::new(Geometry::Circle { center: Coordinate::new(10.0, 20.0), radius: 500.0 }))
            .unwrap();
        let writes = geometry_writes(&wire);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0]["features"][0]["properties"]["type"], "Circle");
        assert!(wire.borrow().sets.last().unwrap().2);
        assert!(picker.session().unwrap().geometry.get(id).unwrap().editable);
    }

    #[test]
    fn disabled_shape_kinds_are_refused() {
        let (mut picker, wire) = editor();
        let text = Shape::new(Geometry::Text { at: Coordinate::ORIGIN, text: "x".into() });
        assert!(matches!(picker.shape_created(text), Err(PickerError::ShapeDisabled(ShapeKind::Text))));
        assert!(geometry_writes(&wire).is_empty());
    }

    #[test]
    fn editing_needs_the_editor() {
        let (mut picker, _, _) = setup(json!({}), json!({}));
        visible(&mut picker, 0.0);
        let shape = Shape::new(Geometry::Marker(Coordinate::ORIGIN));
        assert!(matches!(picker.shape_created(shape), Err(PickerError::EditingDisabled)));
    }

    #[test]
    fn edit_and_delete_rewrite_the_collection() {
        let (mut picker, wire) = editor();
        let id = picker.shape_created(Shape::new(Geometry::Marker(Coordinate::new(1.0, 1.0)))).unwrap();
        picker.shape_edited(id, Shape::new(Geometry::Marker(Coordinate::new(2.0, 2.0)))).unwrap();
        assert_eq!(geometry_writes(&wire)[1]["features"][0]["geometry"]["coordinates"], json!([2.0, 2.0]));

        picker.shape_removed(id).unwrap();
        picker.shape_removed(id).unwrap();
        let writes = geometry_writes(&wire);
        assert_eq!(writes.len(), 4);
        assert_eq!(writes[3]["features"], json!([]));
        assert!(matches!(
            picker.shape_edited(id, Shape::new(Geometry::Marker(Coordinate::ORIGIN))),
            Err(PickerError::UnknownShape(_))
        ));
    }

    #[test]
    fn malformed_shapes_are_refused_and_do_not_block_later_writes() {
        let (mut picker, wire) = editor();
        let bad = picker.shape_created(Shape::new(Geometry::Polyline(vec![Coordinate::ORIGIN])));
        assert!(matches!(bad, Err(PickerError::Geometry(GeometryError::TooFewVertices { .. }))));
        assert!(picker.session().unwrap().geometry.is_empty());
        assert!(geometry_writes(&wire).is_empty());

        let id = picker.shape_created(Shape::new(Geometry::Marker(Coordinate::new(1.0, 1.0)))).unwrap();
        assert_eq!(geometry_writes(&wire).len(), 1);
        let flat = Shape::new(Geometry::Circle { center: Coordinate::ORIGIN, radius: 0.0 });
        assert!(matches!(picker.shape_edited(id, flat), Err(PickerError::Geometry(_))));
        assert_eq!(
            picker.session().unwrap().geometry.get(id).unwrap().shape.geometry,
            Geometry::Marker(Coordinate::new(1.0, 1.0))
        );

        picker.shape_removed(id).unwrap();
        let writes = geometry_writes(&wire);
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[1]["features"], json!([]));
    }

    #[test]
    fn refreshed_geometry_never_reuses_ids() {
        let (mut picker, wire) = editor();
        let first = picker.shape_created(Shape::new(Geometry::Marker(Coordinate::new(1.0, 1.0)))).unwrap();
        assert!(wire.borrow_mut().dispatch(REFRESH_MAP_EVENT));
        picker.tick(0.1);
        let geometry = &picker.session().unwrap().geometry;
        assert_eq!(geometry.len(), 1);
        assert!(geometry.get(first).is_none());
    }

    #[test]
    fn stored_geometry_loads_and_fits_view() {
        let stored = json!({"type": "FeatureCollection", "features": [
            {"type": "Feature", "properties": {"title": "Yard"}, "geometry": {"type": "Polygon", "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]]]}},
            {"type": "Feature", "properties": {"type": "Circle", "radius": 500}, "geometry": {"type": "Point", "coordinates": [20.0, 10.0]}},
        ]});
        let (mut picker, _, _) = setup(
            json!({"statePath": "data.location", "geoMan": {"show": true, "editable": false}}),
            json!({"data": {"location": {"lat": 40.0, "lng": 40.0, "geojson": stored}}}),
        );
        picker.set_viewport(800.0, 600.0);
        visible(&mut picker, 0.0);
        let session = picker.session().unwrap();
        let shapes: Vec<_> = session.geometry.iter().collect();
        assert_eq!(shapes.len(), 2);
        assert_eq!(shapes[0].popup, "Yard");
        assert_eq!(shapes[1].popup, "Circle");
        assert_eq!(shapes[1].shape.geometry, Geometry::Circle { center: Coordinate::new(10.0, 20.0), radius: 500.0 });
        assert!(shapes.iter().all(|s| !s.editable));
        assert!(session.view.center.lat < 10.0 && session.view.center.lng < 20.0);

        let id = shapes[0].id;
        let result = picker.shape_edited(id, Shape::new(Geometry::Marker(Coordinate::ORIGIN)));
        assert!(matches!(result, Err(PickerError::EditingDisabled)));
    }
}
