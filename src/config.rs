use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::coords::{Coordinate, LatLngBounds};
use crate::error::PickerError;
use crate::geometry::ShapeKind;

/// Which surface the picker is embedded in
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PickerKind {
    /// Editable form field, writes back to the wire
    #[default]
    Field,
    /// Read-only display entry
    Infolist,
}

/// Configuration object handed over by the form builder.
///
/// Parsed once per picker. Every key is optional and falls back to the
/// builder's defaults so a `{}` object is a valid configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MapPickerConfig {
    #[serde(rename = "type")]
    pub kind: PickerKind,
    pub state_path: String,
    pub draggable: bool,
    pub clickable: bool,
    pub show_marker: bool,

    pub tiles_url: String,
    pub attribution: Option<String>,
    pub zoom_offset: i32,
    pub tile_size: u32,
    pub detect_retina: bool,
    pub min_zoom: Option<f64>,
    pub max_zoom: Option<f64>,
    pub controls: MapControls,

    pub marker_color: String,
    pub marker_icon_url: Option<String>,
    pub marker_icon_size: [f64; 2],
    pub marker_icon_anchor: [f64; 2],
    pub marker_html: String,
    pub marker_icon_class_name: String,

    #[serde(deserialize_with = "live_location_or_false")]
    pub live_location: LiveLocation,
    #[serde(deserialize_with = "flag_or_list")]
    pub show_my_location_button: bool,
    pub range_select_field: Option<String>,
    #[serde(deserialize_with = "bounds_or_false")]
    pub bounds: Option<LatLngBounds>,
    pub default: Coordinate,

    #[serde(rename = "geoMan")]
    pub geometry: GeometryEditorConfig,

    /// Debounce window for remote writes, in milliseconds
    pub debounce: u64,
    /// Minimum move in degrees that counts as a change
    pub change_threshold: f64,
}

impl Default for MapPickerConfig {
    fn default() -> Self {
        Self {
            kind: PickerKind::Field,
            state_path: String::new(),
            draggable: true,
            clickable: false,
            show_marker: true,
            tiles_url: "https://tile.openstreetmap.org/{z}/{x}/{y}.png".to_string(),
            attribution: None,
            zoom_offset: -1,
            tile_size: 512,
            detect_retina: true,
            min_zoom: None,
            max_zoom: None,
            controls: MapControls::default(),
            marker_color: "#3b82f6".to_string(),
            marker_icon_url: None,
            marker_icon_size: [36.0, 36.0],
            marker_icon_anchor: [18.0, 36.0],
            marker_html: String::new(),
            marker_icon_class_name: String::new(),
            live_location: LiveLocation::default(),
            show_my_location_button: false,
            range_select_field: Some("distance".to_string()),
            bounds: None,
            default: Coordinate::ORIGIN,
            geometry: GeometryEditorConfig::default(),
            debounce: 500,
            change_threshold: 1e-5,
        }
    }
}

/// Map control options (`controls` key)
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MapControls {
    pub zoom_control: bool,
    pub fullscreen_control: bool,
    pub min_zoom: f64,
    pub max_zoom: f64,
    pub zoom: f64,
}

impl Default for MapControls {
    fn default() -> Self {
        Self {
            zoom_control: true,
            fullscreen_control: true,
            min_zoom: 1.0,
            max_zoom: 28.0,
            zoom: 15.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct LiveLocation {
    pub send: bool,
    pub realtime: bool,
    #[serde(alias = "miliseconds", alias = "intervalMs")]
    pub milliseconds: u64,
}

impl Default for LiveLocation {
    fn default() -> Self {
        Self { send: false, realtime: false, milliseconds: 5000 }
    }
}

impl LiveLocation {
    pub fn tracks(&self) -> bool {
        self.send && self.realtime
    }

    pub fn interval_secs(&self) -> f64 {
        self.milliseconds.max(1) as f64 / 1000.0
    }
}

/// Freehand drawing options (`geoMan` key)
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GeometryEditorConfig {
    pub show: bool,
    pub editable: bool,
    pub position: String,
    pub draw_marker: bool,
    pub draw_circle_marker: bool,
    pub draw_polygon: bool,
    pub draw_polyline: bool,
    pub draw_circle: bool,
    pub draw_rectangle: bool,
    pub draw_text: bool,
    pub edit_polygon: bool,
    pub delete_layer: bool,
    pub drag_mode: bool,
    pub cut_polygon: bool,
    pub rotate_mode: bool,
    pub color: String,
    pub filled_color: String,
    pub snappable: bool,
    pub snap_distance: f64,
}

impl Default for GeometryEditorConfig {
    fn default() -> Self {
        Self {
            show: false,
            editable: true,
            position: "topleft".to_string(),
            draw_marker: true,
            draw_circle_marker: true,
            draw_polygon: true,
            draw_polyline: true,
            draw_circle: true,
            draw_rectangle: true,
            draw_text: true,
            edit_polygon: true,
            delete_layer: true,
            drag_mode: true,
            cut_polygon: true,
            rotate_mode: true,
            color: "#3388ff".to_string(),
            filled_color: "#cad9ec".to_string(),
            snappable: false,
            snap_distance: 20.0,
        }
    }
}

impl GeometryEditorConfig {
    pub fn allows(&self, kind: ShapeKind) -> bool {
        match kind {
            ShapeKind::Marker => self.draw_marker,
            ShapeKind::CircleMarker => self.draw_circle_marker,
            ShapeKind::Circle => self.draw_circle,
            ShapeKind::Polygon => self.draw_polygon,
            ShapeKind::Polyline => self.draw_polyline,
            ShapeKind::Rectangle => self.draw_rectangle,
            ShapeKind::Text => self.draw_text,
        }
    }
}

impl MapPickerConfig {
    pub fn from_json(json: &str) -> Result<Self, PickerError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_value(value: Value) -> Result<Self, PickerError> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn initial_zoom(&self) -> f64 {
        self.controls.zoom.clamp(self.min_zoom(), self.max_zoom())
    }

    pub fn min_zoom(&self) -> f64 {
        self.min_zoom.unwrap_or(self.controls.min_zoom).max(self.controls.min_zoom)
    }

    pub fn max_zoom(&self) -> f64 {
        self.max_zoom
            .unwrap_or(self.controls.max_zoom)
            .min(self.controls.max_zoom)
            .max(self.min_zoom())
    }

    pub fn debounce_secs(&self) -> f64 {
        self.debounce as f64 / 1000.0
    }

    /// Wire path of the drawn geometry, stored next to the coordinate
    pub fn geometry_path(&self) -> String {
        join_path(&self.state_path, "geojson")
    }

    /// Wire path of the numeric field driving the range circle.
    ///
    /// A bare field name is resolved as a sibling of `state_path`.
    pub fn range_path(&self) -> Option<String> {
        let field = self.range_select_field.as_deref()?.trim();
        if field.is_empty() {
            return None;
        }
        if field.contains('.') {
            return Some(field.to_string());
        }
        Some(match self.state_path.rfind('.') {
            Some(pos) => format!("{}{}", &self.state_path[..=pos], field),
            None => field.to_string(),
        })
    }

    /// Whether the initial view should wait on a device fix
    pub fn wants_initial_fix(&self, resolved: &Coordinate) -> bool {
        resolved.is_origin() && self.default.is_origin()
    }
}

pub(crate) fn join_path(base: &str, key: &str) -> String {
    if base.is_empty() {
        key.to_string()
    } else {
        format!("{base}.{key}")
    }
}

fn flag_or_list<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Bool(b) => b,
        Value::Array(items) => items.first().and_then(Value::as_bool).unwrap_or(false),
        _ => false,
    })
}

fn live_location_or_false<'de, D: Deserializer<'de>>(d: D) -> Result<LiveLocation, D::Error> {
    match Value::deserialize(d)? {
        Value::Object(map) => serde_json::from_value(Value::Object(map)).map_err(serde::de::Error::custom),
        Value::Bool(send) => Ok(LiveLocation { send, ..Default::default() }),
        _ => Ok(LiveLocation::default()),
    }
}

fn bounds_or_false<'de, D: Deserializer<'de>>(d: D) -> Result<Option<LatLngBounds>, D::Error> {
    match Value::deserialize(d)? {
        Value::Object(map) => {
            let sw = map.get("sw").and_then(Coordinate::from_value);
            let ne = map.get("ne").and_then(Coordinate::from_value);
            match (sw, ne) {
                (Some(sw), Some(ne)) => Ok(Some(LatLngBounds::new(sw, ne))),
                _ => Err(serde::de::Error::custom("bounds need both `sw` and `ne` corners")),
            }
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_uses_builder_defaults() {
        let config = MapPickerConfig::from_json("{}").unwrap();
        assert_eq!(config.kind, PickerKind::Field);
        assert!(config.draggable);
        assert!(!config.clickable);
        assert_eq!(config.tile_size, 512);
        assert_eq!(config.zoom_offset, -1);
        assert_eq!(config.initial_zoom(), 15.0);
        assert_eq!(config.debounce, 500);
        assert_eq!(config.change_threshold, 1e-5);
        assert!(!config.live_location.tracks());
        assert!(config.bounds.is_none());
    }

    #[test]
    fn parses_builder_output() {
        let config = MapPickerConfig::from_json(
            r##"{
                "type": "field",
                "statePath": "data.location",
                "draggable": false,
                "clickable": true,
                "liveLocation": {"send": true, "realtime": true, "miliseconds": 2500},
                "bounds": {"sw": {"lat": 49.5, "lng": -11}, "ne": {"lat": 61, "lng": 2}},
                "showMyLocationButton": [true, false, 5000],
                "default": {"lat": 55.25, "lng": -4.5},
                "rangeSelectField": "data.distance",
                "controls": {"zoom": 12, "minZoom": 3, "maxZoom": 18},
                "geoMan": {"show": true, "drawCircle": false, "color": "#ff0000"}
            }"##,
        )
        .unwrap();
        assert_eq!(config.state_path, "data.location");
        assert!(!config.draggable);
        assert!(config.clickable);
        assert!(config.live_location.tracks());
        assert_eq!(config.live_location.interval_secs(), 2.5);
        assert!(config.show_my_location_button);
        assert_eq!(config.bounds.unwrap().ne, Coordinate::new(61.0, 2.0));
        assert_eq!(config.initial_zoom(), 12.0);
        assert_eq!(config.range_path().as_deref(), Some("data.distance"));
        assert!(config.geometry.show);
        assert!(!config.geometry.allows(ShapeKind::Circle));
        assert!(config.geometry.allows(ShapeKind::Polygon));
        assert_eq!(config.geometry_path(), "data.location.geojson");
    }

    #[test]
    fn false_flags_disable_optional_blocks() {
        let config = MapPickerConfig::from_json(r#"{"liveLocation": false, "bounds": false}"#).unwrap();
        assert!(!config.live_location.send);
        assert!(config.bounds.is_none());
    }

    #[test]
    fn bare_range_field_resolves_next_to_state() {
        let config = MapPickerConfig::from_json(r#"{"statePath": "data.rows.3.location"}"#).unwrap();
        assert_eq!(config.range_path().as_deref(), Some("data.rows.3.distance"));
    }

    #[test]
    fn rejects_half_open_bounds() {
        assert!(MapPickerConfig::from_json(r#"{"bounds": {"sw": {"lat": 1, "lng": 2}}}"#).is_err());
    }

    #[test]
    fn initial_fix_only_without_explicit_default() {
        let config = MapPickerConfig::default();
        assert!(config.wants_initial_fix(&Coordinate::ORIGIN));
        let with_default = MapPickerConfig { default: Coordinate::new(51.5, -0.12), ..Default::default() };
        assert!(!with_default.wants_initial_fix(&Coordinate::ORIGIN));
    }
}
