use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::coordinates::{extract_coordinates, is_latitude, is_longitude, CoordinatePair};
use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    Attraction,
    Restaurant,
    Shopping,
    #[serde(alias = "HOTEL")]
    Lodging,
    #[serde(alias = "TRANSPORT", alias = "TRANSIT")]
    TransitHub,
}

impl Category {
    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_uppercase().replace([' ', '-'], "_");
        match normalized.as_str() {
            "ATTRACTION" => Some(Category::Attraction),
            "RESTAURANT" => Some(Category::Restaurant),
            "SHOPPING" => Some(Category::Shopping),
            "LODGING" | "HOTEL" => Some(Category::Lodging),
            "TRANSIT_HUB" | "TRANSPORT" | "TRANSIT" => Some(Category::TransitHub),
            _ => None,
        }
    }
}

/// A place as the catalog backend serves it. Fields this crate does not
/// interpret are kept in `extra` so the full record can be shown to the model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationRecord {
    pub id: i64,
    #[serde(default)]
    pub name_local: Option<String>,
    #[serde(default, rename = "nameEN", alias = "nameEnglish", alias = "nameEn")]
    pub name_english: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub physical_metadata: Option<Value>,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub city_id: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LocationRecord {
    /// Record-level coordinates when both are usable, otherwise whatever the
    /// metadata bag carries.
    pub fn coordinates(&self) -> Option<CoordinatePair> {
        match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => CoordinatePair::new(lat, lng),
            _ => None,
        }
        .or_else(|| self.metadata.as_ref().and_then(extract_coordinates))
    }

    pub fn display_name(&self) -> &str {
        self.name_local
            .as_deref()
            .or(self.name_english.as_deref())
            .unwrap_or("<unnamed>")
    }
}

/// Sparse patch of a [`LocationRecord`]. A present field replaces the stored
/// value wholesale; an absent field is left untouched and is never serialized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_local: Option<String>,
    #[serde(
        default,
        rename = "nameEN",
        alias = "nameEnglish",
        alias = "nameEn",
        skip_serializing_if = "Option::is_none"
    )]
    pub name_english: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_metadata: Option<Map<String, Value>>,
}

impl UpdateRequest {
    pub fn coordinates(pair: CoordinatePair) -> Self {
        Self {
            lat: Some(pair.lat()),
            lng: Some(pair.lng()),
            ..Self::default()
        }
    }

    pub fn field_count(&self) -> usize {
        [
            self.name_local.is_some(),
            self.name_english.is_some(),
            self.category.is_some(),
            self.lat.is_some(),
            self.lng.is_some(),
            self.address.is_some(),
            self.description.is_some(),
            self.rating.is_some(),
            self.metadata.is_some(),
            self.physical_metadata.is_some(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count()
    }

    pub fn is_empty(&self) -> bool {
        self.field_count() == 0
    }

    /// Checks run before an update is sent to the catalog.
    pub fn validate(&self) -> AppResult<()> {
        if self.is_empty() {
            return Err(AppError::Validation("update carries no fields".into()));
        }
        if let Some(lat) = self.lat {
            if !is_latitude(lat) {
                return Err(AppError::Validation(format!("latitude {lat} out of range")));
            }
        }
        if let Some(lng) = self.lng {
            if !is_longitude(lng) {
                return Err(AppError::Validation(format!("longitude {lng} out of range")));
            }
        }
        if let Some(rating) = self.rating {
            if !(0.0..=5.0).contains(&rating) {
                return Err(AppError::Validation(format!("rating {rating} outside 0-5")));
            }
        }
        for (field, value) in [
            ("nameLocal", &self.name_local),
            ("nameEN", &self.name_english),
        ] {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                return Err(AppError::Validation(format!("{field} is blank")));
            }
        }
        Ok(())
    }
}

/// Optional catalog filters shared by the read endpoint and the CLI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub country_code: Option<String>,
    pub city_id: Option<i64>,
    pub search: Option<String>,
    pub category: Option<String>,
}

impl RecordFilter {
    pub fn is_unfiltered(&self) -> bool {
        self.country_code.is_none()
            && self.city_id.is_none()
            && self.search.is_none()
            && self.category.is_none()
    }

    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(code) = &self.country_code {
            pairs.push(("countryCode", code.clone()));
        }
        if let Some(city) = self.city_id {
            pairs.push(("cityId", city.to_string()));
        }
        if let Some(search) = &self.search {
            pairs.push(("search", search.clone()));
        }
        if let Some(category) = &self.category {
            pairs.push(("category", category.clone()));
        }
        pairs
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPage {
    #[serde(default)]
    pub records: Vec<LocationRecord>,
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub total_pages: usize,
}
