use std::cell::RefCell;
use std::rc::Rc;
use thiserror::Error;

use crate::coords::Coordinate;

/// Identifies one position request so late answers can be matched up
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct FixId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PositionOptions {
    pub enable_high_accuracy: bool,
    /// Seconds before the platform gives up
    pub timeout: Option<f64>,
    /// Accept a cached fix this many seconds old
    pub maximum_age: f64,
}

impl Default for PositionOptions {
    fn default() -> Self {
        Self { enable_high_accuracy: true, timeout: None, maximum_age: 0.0 }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum GeolocationError {
    #[error("permission to read the device location was denied")]
    PermissionDenied,
    #[error("device location is unavailable")]
    PositionUnavailable,
    #[error("timed out waiting for a location fix")]
    Timeout,
}

pub type PositionResult = Result<Coordinate, GeolocationError>;

/// Device location source.
///
/// Requests are fire and forget. Answers either come back through
/// `take_resolved` or are pushed into the picker by the host.
pub trait Geolocator {
    fn request_position(&mut self, id: FixId, options: &PositionOptions);
    fn take_resolved(&mut self) -> Vec<(FixId, PositionResult)>;
}

/// Answers every request with one configured position, or with
/// `PositionUnavailable` when none is set
#[derive(Clone, Debug, Default)]
pub struct StaticGeolocator {
    position: Option<Coordinate>,
    resolved: Vec<(FixId, PositionResult)>,
    pub requests: Vec<(FixId, PositionOptions)>,
}

impl StaticGeolocator {
    pub fn new(position: Option<Coordinate>) -> Self {
        Self { position, ..Default::default() }
    }

    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn set_position(&mut self, position: Option<Coordinate>) {
        self.position = position;
    }
}

impl Geolocator for StaticGeolocator {
    fn request_position(&mut self, id: FixId, options: &PositionOptions) {
        self.requests.push((id, *options));
        let answer = self.position.ok_or(GeolocationError::PositionUnavailable);
        self.resolved.push((id, answer));
    }

    fn take_resolved(&mut self) -> Vec<(FixId, PositionResult)> {
        std::mem::take(&mut self.resolved)
    }
}

impl<T: Geolocator> Geolocator for Rc<RefCell<T>> {
    fn request_position(&mut self, id: FixId, options: &PositionOptions) {
        self.borrow_mut().request_position(id, options)
    }

    fn take_resolved(&mut self) -> Vec<(FixId, PositionResult)> {
        self.borrow_mut().take_resolved()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_answers_in_request_order() {
        let mut geo = StaticGeolocator::new(Some(Coordinate::new(1.0, 2.0)));
        geo.request_position(FixId(1), &PositionOptions::default());
        geo.set_position(None);
        geo.request_position(FixId(2), &PositionOptions::default());
        let answers = geo.take_resolved();
        assert_eq!(answers[0], (FixId(1), Ok(Coordinate::new(1.0, 2.0))));
        assert_eq!(answers[1], (FixId(2), Err(GeolocationError::PositionUnavailable)));
        assert!(geo.take_resolved().is_empty());
    }
}
