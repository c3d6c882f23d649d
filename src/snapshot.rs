use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::coords::Coordinate;

/// View state cached for back/forward restoration
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RestorationSnapshot {
    pub lat: f64,
    pub lng: f64,
    pub zoom: f64,
}

impl RestorationSnapshot {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.lat, self.lng)
    }
}

/// Hidden form input holding the snapshot as a JSON string
#[derive(Clone, Debug, Default)]
pub struct RestorationField {
    value: String,
}

impl RestorationField {
    pub fn new() -> Self {
        Self::default()
    }

    /// Field as restored by the browser, possibly empty or garbage
    pub fn with_value(value: impl Into<String>) -> Self {
        Self { value: value.into() }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn save(&mut self, snapshot: &RestorationSnapshot) {
        // serializing three plain floats cannot fail
        if let Ok(json) = serde_json::to_string(snapshot) {
            self.value = json;
        }
    }

    /// `None` for an empty field and for anything that does not parse
    pub fn load(&self) -> Option<RestorationSnapshot> {
        if self.value.trim().is_empty() {
            return None;
        }
        let value: Value = serde_json::from_str(&self.value).ok()?;
        if !value.is_object() {
            return None;
        }
        let snapshot = RestorationSnapshot::deserialize(value).ok()?;
        let valid = snapshot.coordinate().is_finite() && snapshot.zoom.is_finite();
        valid.then_some(snapshot)
    }

    pub fn clear(&mut self) {
        self.value.clear();
    }
}
