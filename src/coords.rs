use serde::{Deserialize, Serialize};
use serde_json::Value;

/// WGS84 equatorial radius in meters, the sphere Web Mercator projects onto
pub const EARTH_RADIUS: f64 = 6_378_137.0;

/// Web Mercator stops being useful past this latitude
pub const MAX_MERCATOR_LAT: f64 = 85.051_128_78;

/// A geographic position in degrees
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub const ORIGIN: Coordinate = Coordinate { lat: 0.0, lng: 0.0 };

    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_finite(&self) -> bool {
        self.lat.is_finite() && self.lng.is_finite()
    }

    pub fn is_origin(&self) -> bool {
        self.lat == 0.0 && self.lng == 0.0
    }

    /// True when either axis moved by more than `epsilon` degrees
    pub fn differs_from(&self, other: &Coordinate, epsilon: f64) -> bool {
        (self.lat - other.lat).abs() > epsilon || (self.lng - other.lng).abs() > epsilon
    }

    /// Read a `{lat, lng}` object coming from the wire.
    ///
    /// Both keys must be present and hold a number or a numeric string,
    /// anything else yields `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let lat = number_from_value(obj.get("lat")?)?;
        let lng = number_from_value(obj.get("lng")?)?;
        let coord = Self { lat, lng };
        coord.is_finite().then_some(coord)
    }

    /// Great-circle distance in meters
    pub fn distance_to(&self, other: &Coordinate) -> f64 {
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let dlat = lat2 - lat1;
        let dlng = (other.lng - self.lng).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS * a.sqrt().min(1.0).asin()
    }

    /// Bounding box of a circle of `radius` meters around this point
    pub fn radius_bounds(&self, radius: f64) -> LatLngBounds {
        let dlat = (radius / EARTH_RADIUS).to_degrees();
        let cos_lat = self.lat.to_radians().cos().max(1e-9);
        let dlng = dlat / cos_lat;
        LatLngBounds {
            sw: Coordinate::new(self.lat - dlat, self.lng - dlng),
            ne: Coordinate::new(self.lat + dlat, self.lng + dlng),
        }
    }
}

pub(crate) fn number_from_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Axis aligned lat/lng box
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatLngBounds {
    pub sw: Coordinate,
    pub ne: Coordinate,
}

impl LatLngBounds {
    pub fn new(sw: Coordinate, ne: Coordinate) -> Self {
        Self {
            sw: Coordinate::new(sw.lat.min(ne.lat), sw.lng.min(ne.lng)),
            ne: Coordinate::new(sw.lat.max(ne.lat), sw.lng.max(ne.lng)),
        }
    }

    /// Smallest box holding all points, `None` for an empty iterator
    pub fn from_points(points: impl IntoIterator<Item = Coordinate>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let mut bounds = Self { sw: first, ne: first };
        for p in iter {
            bounds.extend(&p);
        }
        Some(bounds)
    }

    pub fn extend(&mut self, p: &Coordinate) {
        self.sw.lat = self.sw.lat.min(p.lat);
        self.sw.lng = self.sw.lng.min(p.lng);
        self.ne.lat = self.ne.lat.max(p.lat);
        self.ne.lng = self.ne.lng.max(p.lng);
    }

    pub fn union(&mut self, other: &LatLngBounds) {
        self.extend(&other.sw);
        self.extend(&other.ne);
    }

    pub fn center(&self) -> Coordinate {
        Coordinate::new((self.sw.lat + self.ne.lat) / 2.0, (self.sw.lng + self.ne.lng) / 2.0)
    }

    pub fn contains(&self, p: &Coordinate) -> bool {
        p.lat >= self.sw.lat && p.lat <= self.ne.lat && p.lng >= self.sw.lng && p.lng <= self.ne.lng
    }

    pub fn clamp(&self, p: Coordinate) -> Coordinate {
        Coordinate::new(p.lat.clamp(self.sw.lat, self.ne.lat), p.lng.clamp(self.sw.lng, self.ne.lng))
    }
}

/// Web Mercator helpers shared by the session view and the widget
pub mod mercator {
    use super::{Coordinate, LatLngBounds, EARTH_RADIUS, MAX_MERCATOR_LAT};
    use std::f64::consts::PI;

    /// Position in world pixels for a world of `world_size` pixels
    pub fn project(c: &Coordinate, world_size: f64) -> (f64, f64) {
        let x = (c.lng + 180.0) / 360.0 * world_size;
        let lat_rad = c.lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT).to_radians();
        let y = (1.0 - lat_rad.tan().asinh() / PI) / 2.0 * world_size;
        (x, y)
    }

    pub fn unproject(x: f64, y: f64, world_size: f64) -> Coordinate {
        let lng = x / world_size * 360.0 - 180.0;
        let lat = (PI * (1.0 - 2.0 * y / world_size)).sinh().atan().to_degrees();
        Coordinate::new(lat, lng)
    }

    /// Meters per screen pixel for a 256px based zoom level
    pub fn meters_per_pixel(lat: f64, zoom: f64) -> f64 {
        let world_size_meters = 2.0 * PI * EARTH_RADIUS;
        let world_size_pixels = 256.0 * 2.0_f64.powf(zoom);
        world_size_meters / world_size_pixels * lat.to_radians().cos()
    }

    /// Largest zoom that shows `bounds` inside a `width` x `height` viewport
    pub fn zoom_to_fit(bounds: &LatLngBounds, width: f64, height: f64, min_zoom: f64, max_zoom: f64) -> f64 {
        let (x0, y0) = project(&Coordinate::new(bounds.ne.lat, bounds.sw.lng), 256.0);
        let (x1, y1) = project(&Coordinate::new(bounds.sw.lat, bounds.ne.lng), 256.0);
        let span_x = (x1 - x0).abs();
        let span_y = (y1 - y0).abs();
        if span_x < 1e-12 && span_y < 1e-12 {
            return max_zoom;
        }
        let zoom_x = if span_x > 1e-12 { (width / span_x).log2() } else { max_zoom };
        let zoom_y = if span_y > 1e-12 { (height / span_y).log2() } else { max_zoom };
        zoom_x.min(zoom_y).floor().clamp(min_zoom, max_zoom)
    }
}
