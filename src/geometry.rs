use serde_json::{json, Map, Value};
use std::fmt;
use thiserror::Error;

use crate::coords::{number_from_value, Coordinate, LatLngBounds, EARTH_RADIUS};

/// Pixel radius of a circle marker drawn without one
pub const DEFAULT_CIRCLE_MARKER_RADIUS: f64 = 10.0;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ShapeId(pub u64);

impl fmt::Display for ShapeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum ShapeKind {
    Marker,
    CircleMarker,
    Circle,
    Polygon,
    Polyline,
    Rectangle,
    Text,
}

impl ShapeKind {
    pub const ALL: [ShapeKind; 7] = [
        ShapeKind::Marker,
        ShapeKind::CircleMarker,
        ShapeKind::Circle,
        ShapeKind::Polygon,
        ShapeKind::Polyline,
        ShapeKind::Rectangle,
        ShapeKind::Text,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ShapeKind::Marker => "Marker",
            ShapeKind::CircleMarker => "CircleMarker",
            ShapeKind::Circle => "Circle",
            ShapeKind::Polygon => "Polygon",
            ShapeKind::Polyline => "Line",
            ShapeKind::Rectangle => "Rectangle",
            ShapeKind::Text => "Text",
        }
    }
}

impl fmt::Display for ShapeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeometryError {
    #[error("{0} has a non finite coordinate")]
    NonFinite(ShapeKind),
    #[error("{kind} needs at least {needed} vertices, got {got}")]
    TooFewVertices { kind: ShapeKind, needed: usize, got: usize },
    #[error("circle radius must be a positive number, got {0}")]
    InvalidRadius(f64),
    #[error("malformed GeoJSON: {0}")]
    Malformed(String),
    #[error("unsupported GeoJSON geometry `{0}`")]
    Unsupported(String),
}

fn malformed(msg: impl Into<String>) -> GeometryError {
    GeometryError::Malformed(msg.into())
}

/// Geometry of one drawn shape, in geographic coordinates
#[derive(Clone, Debug, PartialEq)]
pub enum Geometry {
    Marker(Coordinate),
    /// Circle with a fixed screen radius in pixels
    CircleMarker { center: Coordinate, radius: f64 },
    /// Circle with a ground radius in meters
    Circle { center: Coordinate, radius: f64 },
    /// Outer ring first, then holes. Rings are stored open.
    Polygon(Vec<Vec<Coordinate>>),
    Polyline(Vec<Coordinate>),
    Rectangle(LatLngBounds),
    Text { at: Coordinate, text: String },
}

impl Geometry {
    pub fn kind(&self) -> ShapeKind {
        match self {
            Geometry::Marker(_) => ShapeKind::Marker,
            Geometry::CircleMarker { .. } => ShapeKind::CircleMarker,
            Geometry::Circle { .. } => ShapeKind::Circle,
            Geometry::Polygon(_) => ShapeKind::Polygon,
            Geometry::Polyline(_) => ShapeKind::Polyline,
            Geometry::Rectangle(_) => ShapeKind::Rectangle,
            Geometry::Text { .. } => ShapeKind::Text,
        }
    }

    /// Editable handles, in a stable order `move_vertex` understands.
    ///
    /// Circles expose their center and an east edge handle for the radius,
    /// rectangles their corners clockwise from south-west.
    pub fn vertices(&self) -> Vec<Coordinate> {
        match self {
            Geometry::Marker(p) | Geometry::CircleMarker { center: p, .. } | Geometry::Text { at: p, .. } => vec![*p],
            Geometry::Circle { center, radius } => vec![*center, circle_edge(center, *radius)],
            Geometry::Polygon(rings) => rings.iter().flatten().copied().collect(),
            Geometry::Polyline(points) => points.clone(),
            Geometry::Rectangle(b) => rectangle_corners(b).to_vec(),
        }
    }

    /// Move one handle returned by `vertices`, false when out of range
    pub fn move_vertex(&mut self, index: usize, to: Coordinate) -> bool {
        match self {
            Geometry::Marker(p) | Geometry::CircleMarker { center: p, .. } | Geometry::Text { at: p, .. } => {
                if index != 0 {
                    return false;
                }
                *p = to;
            }
            Geometry::Circle { center, radius } => match index {
                0 => *center = to,
                1 => *radius = center.distance_to(&to),
                _ => return false,
            },
            Geometry::Polygon(rings) => {
                let Some(p) = rings.iter_mut().flatten().nth(index) else {
                    return false;
                };
                *p = to;
            }
            Geometry::Polyline(points) => {
                let Some(p) = points.get_mut(index) else {
                    return false;
                };
                *p = to;
            }
            Geometry::Rectangle(b) => {
                if index > 3 {
                    return false;
                }
                let opposite = rectangle_corners(b)[(index + 2) % 4];
                *b = LatLngBounds::new(to, opposite);
            }
        }
        true
    }

    pub fn bounds(&self) -> Option<LatLngBounds> {
        match self {
            Geometry::Circle { center, radius } => Some(center.radius_bounds(*radius)),
            Geometry::Rectangle(b) => Some(*b),
            other => LatLngBounds::from_points(other.vertices()),
        }
    }

    pub fn validate(&self) -> Result<(), GeometryError> {
        let kind = self.kind();
        if !self.vertices().iter().all(Coordinate::is_finite) {
            return Err(GeometryError::NonFinite(kind));
        }
        let need = |needed: usize, got: usize| {
            if got < needed {
                Err(GeometryError::TooFewVertices { kind, needed, got })
            } else {
                Ok(())
            }
        };
        match self {
            Geometry::Circle { radius, .. } | Geometry::CircleMarker { radius, .. } => {
                if !(radius.is_finite() && *radius > 0.0) {
                    return Err(GeometryError::InvalidRadius(*radius));
                }
                Ok(())
            }
            Geometry::Polygon(rings) => {
                if rings.is_empty() {
                    return need(3, 0);
                }
                rings.iter().try_for_each(|ring| need(3, ring.len()))
            }
            Geometry::Polyline(points) => need(2, points.len()),
            _ => Ok(()),
        }
    }
}

fn circle_edge(center: &Coordinate, radius: f64) -> Coordinate {
    let dlat = (radius / EARTH_RADIUS).to_degrees();
    let dlng = dlat / center.lat.to_radians().cos().max(1e-9);
    Coordinate::new(center.lat, center.lng + dlng)
}

fn rectangle_corners(b: &LatLngBounds) -> [Coordinate; 4] {
    [
        b.sw,
        Coordinate::new(b.ne.lat, b.sw.lng),
        b.ne,
        Coordinate::new(b.sw.lat, b.ne.lng),
    ]
}

/// A geometry plus the free-form properties carried in its feature
#[derive(Clone, Debug, PartialEq)]
pub struct Shape {
    pub geometry: Geometry,
    pub properties: Map<String, Value>,
}

impl Shape {
    pub fn new(geometry: Geometry) -> Self {
        Self { geometry, properties: Map::new() }
    }

    pub fn kind(&self) -> ShapeKind {
        self.geometry.kind()
    }

    pub fn title(&self) -> Option<&str> {
        self.properties.get("title").and_then(Value::as_str).filter(|t| !t.is_empty())
    }

    pub fn popup_label(&self) -> String {
        match self.title() {
            Some(title) => title.to_string(),
            None => self.kind().name().to_string(),
        }
    }

    /// Encode as one GeoJSON feature
    pub fn to_feature(&self) -> Result<Value, GeometryError> {
        self.geometry.validate()?;
        let mut properties = self.properties.clone();
        let geometry = match &self.geometry {
            Geometry::Marker(p) => point(p),
            Geometry::CircleMarker { center, radius } => {
                properties.insert("shape".into(), json!("CircleMarker"));
                properties.insert("radius".into(), json!(radius));
                point(center)
            }
            Geometry::Circle { center, radius } => {
                // GeoJSON has no circle primitive
                properties.insert("type".into(), json!("Circle"));
                properties.insert("radius".into(), json!(radius));
                point(center)
            }
            Geometry::Polygon(rings) => json!({
                "type": "Polygon",
                "coordinates": rings.iter().map(|r| closed_ring(r)).collect::<Vec<_>>(),
            }),
            Geometry::Polyline(points) => json!({
                "type": "LineString",
                "coordinates": points.iter().map(position).collect::<Vec<_>>(),
            }),
            Geometry::Rectangle(b) => {
                properties.insert("shape".into(), json!("Rectangle"));
                json!({
                    "type": "Polygon",
                    "coordinates": [closed_ring(&rectangle_corners(b))],
                })
            }
            Geometry::Text { at, text } => {
                properties.insert("text".into(), json!(text));
                point(at)
            }
        };
        Ok(json!({
            "type": "Feature",
            "properties": properties,
            "geometry": geometry,
        }))
    }

    /// Decode one GeoJSON feature. Multi geometries yield one shape per part.
    pub fn from_feature(feature: &Value) -> Result<Vec<Shape>, GeometryError> {
        let obj = feature.as_object().ok_or_else(|| malformed("feature is not an object"))?;
        let properties = match obj.get("properties") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(_) => return Err(malformed("feature properties must be an object")),
        };
        let geometry = obj.get("geometry").ok_or_else(|| malformed("feature without geometry"))?;
        decode_geometry(geometry, &properties)
    }
}

fn position(p: &Coordinate) -> Value {
    json!([p.lng, p.lat])
}

fn point(p: &Coordinate) -> Value {
    json!({"type": "Point", "coordinates": position(p)})
}

fn closed_ring(ring: &[Coordinate]) -> Vec<Value> {
    let mut out: Vec<Value> = ring.iter().map(position).collect();
    if let Some(first) = ring.first() {
        out.push(position(first));
    }
    out
}

fn parse_position(v: &Value) -> Result<Coordinate, GeometryError> {
    let arr = v.as_array().ok_or_else(|| malformed("position is not an array"))?;
    match (arr.first().and_then(Value::as_f64), arr.get(1).and_then(Value::as_f64)) {
        (Some(lng), Some(lat)) => Ok(Coordinate::new(lat, lng)),
        _ => Err(malformed("position needs two numbers")),
    }
}

fn parse_line(v: &Value) -> Result<Vec<Coordinate>, GeometryError> {
    v.as_array()
        .ok_or_else(|| malformed("line is not an array"))?
        .iter()
        .map(parse_position)
        .collect()
}

fn parse_rings(v: &Value) -> Result<Vec<Vec<Coordinate>>, GeometryError> {
    v.as_array()
        .ok_or_else(|| malformed("polygon is not an array"))?
        .iter()
        .map(|ring| {
            let mut ring = parse_line(ring)?;
            if ring.len() > 1 && ring.first() == ring.last() {
                ring.pop();
            }
            Ok(ring)
        })
        .collect()
}

fn decode_geometry(geometry: &Value, properties: &Map<String, Value>) -> Result<Vec<Shape>, GeometryError> {
    let kind = geometry
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("geometry without type"))?;
    let coords = || geometry.get("coordinates").ok_or_else(|| malformed("geometry without coordinates"));
    let tag = |key: &str| properties.get(key).and_then(Value::as_str);

    let shapes: Vec<Shape> = match kind {
        "Point" => vec![point_shape(parse_position(coords()?)?, properties)],
        "MultiPoint" => parse_line(coords()?)?
            .into_iter()
            .map(|p| point_shape(p, properties))
            .collect(),
        "LineString" => vec![tagged(Geometry::Polyline(parse_line(coords()?)?), properties)],
        "MultiLineString" => coords()?
            .as_array()
            .ok_or_else(|| malformed("MultiLineString is not an array"))?
            .iter()
            .map(|line| Ok(tagged(Geometry::Polyline(parse_line(line)?), properties)))
            .collect::<Result<_, GeometryError>>()?,
        "Polygon" => {
            let rings = parse_rings(coords()?)?;
            let geometry = match (tag("shape"), rings.as_slice()) {
                (Some("Rectangle"), [outer]) if outer.len() == 4 => {
                    Geometry::Rectangle(LatLngBounds::from_points(outer.iter().copied()).ok_or_else(|| malformed("empty rectangle"))?)
                }
                _ => Geometry::Polygon(rings),
            };
            vec![tagged(geometry, properties)]
        }
        "MultiPolygon" => coords()?
            .as_array()
            .ok_or_else(|| malformed("MultiPolygon is not an array"))?
            .iter()
            .map(|poly| Ok(tagged(Geometry::Polygon(parse_rings(poly)?), properties)))
            .collect::<Result<_, GeometryError>>()?,
        "GeometryCollection" => {
            let mut out = Vec::new();
            for part in geometry
                .get("geometries")
                .and_then(Value::as_array)
                .ok_or_else(|| malformed("GeometryCollection without geometries"))?
            {
                out.extend(decode_geometry(part, properties)?);
            }
            out
        }
        other => return Err(GeometryError::Unsupported(other.to_string())),
    };
    for shape in &shapes {
        shape.geometry.validate()?;
    }
    Ok(shapes)
}

fn point_shape(p: Coordinate, properties: &Map<String, Value>) -> Shape {
    let radius = properties.get("radius").and_then(number_from_value);
    let geometry = match (properties.get("type").and_then(Value::as_str), radius) {
        (Some("Circle"), Some(radius)) => Geometry::Circle { center: p, radius },
        _ => match (properties.get("shape").and_then(Value::as_str), properties.get("text").and_then(Value::as_str)) {
            (Some("CircleMarker"), _) => Geometry::CircleMarker {
                center: p,
                radius: radius.unwrap_or(DEFAULT_CIRCLE_MARKER_RADIUS),
            },
            (_, Some(text)) => Geometry::Text { at: p, text: text.to_string() },
            _ => Geometry::Marker(p),
        },
    };
    tagged(geometry, properties)
}

/// Attach properties minus the keys the codec itself owns
fn tagged(geometry: Geometry, properties: &Map<String, Value>) -> Shape {
    let mut properties = properties.clone();
    match &geometry {
        Geometry::Circle { .. } => {
            properties.remove("type");
            properties.remove("radius");
        }
        Geometry::CircleMarker { .. } => {
            properties.remove("shape");
            properties.remove("radius");
        }
        Geometry::Rectangle(_) => {
            properties.remove("shape");
        }
        Geometry::Text { .. } => {
            properties.remove("text");
        }
        _ => {}
    }
    Shape { geometry, properties }
}

/// A shape living in the editor
#[derive(Clone, Debug, PartialEq)]
pub struct DrawnShape {
    pub id: ShapeId,
    pub shape: Shape,
    pub editable: bool,
    pub popup: String,
}

/// Ordered collection of drawn shapes
#[derive(Clone, Debug, Default)]
pub struct GeometryCollection {
    shapes: Vec<DrawnShape>,
    next_id: u64,
}

impl GeometryCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, shape: Shape, editable: bool) -> ShapeId {
        self.next_id += 1;
        let id = ShapeId(self.next_id);
        let popup = shape.popup_label();
        self.shapes.push(DrawnShape { id, shape, editable, popup });
        id
    }

    /// Swap the geometry of an existing shape, returns false if it is gone
    pub fn replace(&mut self, id: ShapeId, shape: Shape) -> bool {
        match self.shapes.iter_mut().find(|s| s.id == id) {
            Some(drawn) => {
                drawn.popup = shape.popup_label();
                drawn.shape = shape;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: ShapeId) -> Option<DrawnShape> {
        let index = self.shapes.iter().position(|s| s.id == id)?;
        Some(self.shapes.remove(index))
    }

    pub fn get(&self, id: ShapeId) -> Option<&DrawnShape> {
        self.shapes.iter().find(|s| s.id == id)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &DrawnShape> {
        self.shapes.iter()
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    pub fn clear(&mut self) {
        self.shapes.clear();
    }

    /// Swap in freshly loaded shapes, numbered after every id handed out so far
    pub fn reload(&mut self, loaded: GeometryCollection) {
        self.shapes.clear();
        for drawn in loaded.shapes {
            self.next_id += 1;
            self.shapes.push(DrawnShape { id: ShapeId(self.next_id), ..drawn });
        }
    }

    pub fn set_editable(&mut self, editable: bool) {
        for shape in &mut self.shapes {
            shape.editable = editable;
        }
    }

    pub fn bounds(&self) -> Option<LatLngBounds> {
        let mut iter = self.shapes.iter().filter_map(|s| s.shape.geometry.bounds());
        let mut bounds = iter.next()?;
        for b in iter {
            bounds.union(&b);
        }
        Some(bounds)
    }

    /// Encode the whole collection as a GeoJSON `FeatureCollection`
    pub fn to_geojson(&self) -> Result<Value, GeometryError> {
        let features = self
            .shapes
            .iter()
            .map(|s| s.shape.to_feature())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(json!({"type": "FeatureCollection", "features": features}))
    }

    /// Decode a stored snapshot.
    ///
    /// Accepts a `FeatureCollection`, a single `Feature` or a bare geometry,
    /// either as a JSON value or as a JSON string. Features that fail to decode
    /// are reported and skipped.
    pub fn from_geojson(value: &Value, editable: bool) -> (Self, Vec<GeometryError>) {
        let mut collection = Self::new();
        let mut errors = Vec::new();
        let parsed;
        let value = match value {
            Value::String(text) => match serde_json::from_str::<Value>(text) {
                Ok(v) => {
                    parsed = v;
                    &parsed
                }
                Err(e) => {
                    errors.push(malformed(e.to_string()));
                    return (collection, errors);
                }
            },
            other => other,
        };
        let features: Vec<&Value> = match value.get("type").and_then(Value::as_str) {
            Some("FeatureCollection") => match value.get("features").and_then(Value::as_array) {
                Some(features) => features.iter().collect(),
                None => {
                    errors.push(malformed("FeatureCollection without features"));
                    Vec::new()
                }
            },
            Some("Feature") => vec![value],
            Some(_) => match decode_geometry(value, &Map::new()) {
                Ok(shapes) => {
                    for shape in shapes {
                        collection.insert(shape, editable);
                    }
                    return (collection, errors);
                }
                Err(e) => {
                    errors.push(e);
                    return (collection, errors);
                }
            },
            None => {
                errors.push(malformed("value without a GeoJSON type"));
                Vec::new()
            }
        };
        for feature in features {
            match Shape::from_feature(feature) {
                Ok(shapes) => {
                    for shape in shapes {
                        collection.insert(shape, editable);
                    }
                }
                Err(e) => errors.push(e),
            }
        }
        (collection, errors)
    }
}

/// What a tap did to a shape under construction
#[derive(Clone, Debug, PartialEq)]
pub enum BuildStep {
    Pending,
    Done(Geometry),
}

/// Turns a sequence of map taps into a geometry for one draw tool
#[derive(Clone, Debug)]
pub struct ShapeBuilder {
    kind: ShapeKind,
    points: Vec<Coordinate>,
    text: String,
}

impl ShapeBuilder {
    pub fn new(kind: ShapeKind) -> Self {
        Self { kind, points: Vec::new(), text: "Text".to_string() }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn kind(&self) -> ShapeKind {
        self.kind
    }

    pub fn points(&self) -> &[Coordinate] {
        &self.points
    }

    pub fn push(&mut self, p: Coordinate) -> BuildStep {
        match self.kind {
            ShapeKind::Marker => BuildStep::Done(Geometry::Marker(p)),
            ShapeKind::CircleMarker => BuildStep::Done(Geometry::CircleMarker {
                center: p,
                radius: DEFAULT_CIRCLE_MARKER_RADIUS,
            }),
            ShapeKind::Text => BuildStep::Done(Geometry::Text { at: p, text: self.text.clone() }),
            ShapeKind::Circle | ShapeKind::Rectangle => {
                let Some(first) = self.points.first().copied() else {
                    self.points.push(p);
                    return BuildStep::Pending;
                };
                if first == p {
                    return BuildStep::Pending;
                }
                self.points.clear();
                if self.kind == ShapeKind::Circle {
                    BuildStep::Done(Geometry::Circle { center: first, radius: first.distance_to(&p) })
                } else {
                    BuildStep::Done(Geometry::Rectangle(LatLngBounds::new(first, p)))
                }
            }
            ShapeKind::Polygon | ShapeKind::Polyline => {
                if self.points.last() != Some(&p) {
                    self.points.push(p);
                }
                BuildStep::Pending
            }
        }
    }

    /// Close an open polygon or polyline, `None` if it has too few vertices
    pub fn finish(&mut self) -> Option<Geometry> {
        let points = std::mem::take(&mut self.points);
        let geometry = match self.kind {
            ShapeKind::Polygon if points.len() >= 3 => Geometry::Polygon(vec![points]),
            ShapeKind::Polyline if points.len() >= 2 => Geometry::Polyline(points),
            _ => return None,
        };
        Some(geometry)
    }

    pub fn cancel(&mut self) {
        self.points.clear();
    }
}
