//! Coordinate extraction from loosely shaped metadata, plus the distance and
//! key helpers the duplicate detector buckets with.

use serde::Serialize;
use serde_json::Value;

const EARTH_RADIUS_M: f64 = 6_371_000.0;
const KEY_SCALE: f64 = 1_000_000.0;

/// A latitude/longitude pair known to be in range. Only built through
/// [`CoordinatePair::new`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CoordinatePair {
    lat: f64,
    lng: f64,
}

impl CoordinatePair {
    /// Returns `None` unless both axes are finite and inside their physical range.
    pub fn new(lat: f64, lng: f64) -> Option<Self> {
        if is_latitude(lat) && is_longitude(lng) {
            Some(Self { lat, lng })
        } else {
            None
        }
    }

    pub fn lat(&self) -> f64 {
        self.lat
    }

    pub fn lng(&self) -> f64 {
        self.lng
    }

    /// Great-circle distance in meters (haversine).
    pub fn distance_m(&self, other: &CoordinatePair) -> f64 {
        haversine_distance_m(self, other)
    }

    /// Six-decimal key (~0.11 m) used for exact-match bucketing.
    pub fn rounded_key(&self) -> String {
        format!(
            "{:.6},{:.6}",
            round_axis(self.lat),
            round_axis(self.lng)
        )
    }
}

pub fn is_latitude(value: f64) -> bool {
    value.is_finite() && value.abs() <= 90.0
}

pub fn is_longitude(value: f64) -> bool {
    value.is_finite() && value.abs() <= 180.0
}

pub fn haversine_distance_m(a: &CoordinatePair, b: &CoordinatePair) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlng = (b.lng - a.lng).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_M * c
}

/// Reads a number or a numeric string. Anything else, including non-finite
/// values, is treated as absent.
pub fn numeric(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    parsed.is_finite().then_some(parsed)
}

/// Pulls a coordinate pair out of an arbitrary value. Shapes are tried in a
/// fixed order and the first usable one wins:
///
/// 1. flat `lat` / `lng`
/// 2. nested `location.lat` / `location.lng`
/// 3. a `coordinates` array, read as `[lat, lng]` unless only `[lng, lat]` is in range
///
/// Never fails; malformed input yields `None`.
pub fn extract_coordinates(value: &Value) -> Option<CoordinatePair> {
    let object = value.as_object()?;

    if let Some(pair) = flat_pair(value) {
        return Some(pair);
    }

    if let Some(pair) = object.get("location").and_then(flat_pair) {
        return Some(pair);
    }

    object.get("coordinates").and_then(array_pair)
}

/// Both `lat` and `lng` on the object itself, each usable.
pub(crate) fn flat_pair(value: &Value) -> Option<CoordinatePair> {
    let object = value.as_object()?;
    let lat = object.get("lat").and_then(numeric)?;
    let lng = object.get("lng").and_then(numeric)?;
    CoordinatePair::new(lat, lng)
}

fn array_pair(value: &Value) -> Option<CoordinatePair> {
    let items = value.as_array()?;
    if items.len() < 2 {
        return None;
    }
    let first = numeric(&items[0])?;
    let second = numeric(&items[1])?;

    // When both orders are in range the listed order wins; there is no
    // geographic tie-break.
    CoordinatePair::new(first, second).or_else(|| CoordinatePair::new(second, first))
}

fn round_axis(value: f64) -> f64 {
    // `+ 0.0` folds -0.0 into 0.0 so both render the same key.
    (value * KEY_SCALE).round() / KEY_SCALE + 0.0
}
