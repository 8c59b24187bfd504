use serde_json::{Map, Value};

use crate::coordinates::{extract_coordinates, flat_pair, is_latitude, is_longitude, numeric, CoordinatePair};
use crate::records::{Category, UpdateRequest};

const NAME_LOCAL_KEYS: &[&str] = &["nameLocal"];
const NAME_ENGLISH_KEYS: &[&str] = &["nameEN", "nameEnglish", "nameEn"];

/// Where the coordinates of an enhancement payload came from, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq)]
enum CoordinateSource {
    Nested(CoordinatePair),
    Flat(CoordinatePair),
    LatOnly(f64),
    LngOnly(f64),
    Absent,
}

/// Typed view of a loosely shaped enhancement payload. Each field is decoded
/// on its own so one mistyped value does not discard the others.
#[derive(Debug, Clone)]
struct EnhancementPayload {
    name_local: Option<String>,
    name_english: Option<String>,
    category: Option<Category>,
    address: Option<String>,
    description: Option<String>,
    rating: Option<f64>,
    coordinates: CoordinateSource,
    metadata: Option<Map<String, Value>>,
    physical_metadata: Option<Map<String, Value>>,
}

impl EnhancementPayload {
    fn decode(value: &Value) -> Self {
        Self {
            name_local: text_field(value, NAME_LOCAL_KEYS),
            name_english: text_field(value, NAME_ENGLISH_KEYS),
            category: text_field(value, &["category"]).and_then(|tag| Category::parse(&tag)),
            address: text_field(value, &["address"]),
            description: text_field(value, &["description"]),
            rating: value.get("rating").and_then(numeric),
            coordinates: decode_coordinates(value),
            metadata: object_field(value, "metadata"),
            physical_metadata: object_field(value, "physicalMetadata"),
        }
    }
}

fn decode_coordinates(value: &Value) -> CoordinateSource {
    if let Some(pair) = value.get("location").and_then(flat_pair) {
        return CoordinateSource::Nested(pair);
    }
    if let Some(pair) = flat_pair(value) {
        return CoordinateSource::Flat(pair);
    }
    let lat = value.get("lat").and_then(numeric).filter(|v| is_latitude(*v));
    let lng = value.get("lng").and_then(numeric).filter(|v| is_longitude(*v));
    match (lat, lng) {
        (Some(lat), None) => CoordinateSource::LatOnly(lat),
        (None, Some(lng)) => CoordinateSource::LngOnly(lng),
        _ => CoordinateSource::Absent,
    }
}

fn text_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

fn object_field(value: &Value, key: &str) -> Option<Map<String, Value>> {
    value.get(key).and_then(Value::as_object).cloned()
}

/// Maps an enhancement payload (model output or form input) onto an
/// [`UpdateRequest`].
///
/// Present, non-null scalars replace the stored value; absent ones stay
/// absent. Coordinates come from the payload's `location`, then its flat
/// `lat`/`lng`, then a lone `lat` or `lng`; only when the payload carries no
/// usable coordinates at all is `source_metadata` (the original record's
/// metadata) consulted, so existing coordinates survive a response that
/// omits them.
pub fn normalize_enhancement(candidate: &Value, source_metadata: Option<&Value>) -> UpdateRequest {
    let payload = EnhancementPayload::decode(candidate);

    let mut update = UpdateRequest {
        name_local: payload.name_local,
        name_english: payload.name_english,
        category: payload.category,
        address: payload.address,
        description: payload.description,
        rating: payload.rating,
        metadata: payload.metadata,
        physical_metadata: payload.physical_metadata,
        ..UpdateRequest::default()
    };

    match payload.coordinates {
        CoordinateSource::Nested(pair) | CoordinateSource::Flat(pair) => {
            update.lat = Some(pair.lat());
            update.lng = Some(pair.lng());
        }
        CoordinateSource::LatOnly(lat) => update.lat = Some(lat),
        CoordinateSource::LngOnly(lng) => update.lng = Some(lng),
        CoordinateSource::Absent => {
            if let Some(pair) = source_metadata.and_then(extract_coordinates) {
                update.lat = Some(pair.lat());
                update.lng = Some(pair.lng());
            }
        }
    }

    update
}
