use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use geo_types::Geometry;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ParcelError;
use crate::geometry::{self, GeometryInput};

/// Zero-padded width of the sequence part of a canonical code.
pub const SEQUENCE_WIDTH: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionCode(String);

impl RegionCode {
    /// Placeholder region used until boundary data is configured.
    pub fn default_region() -> Self {
        Self("WL001".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RegionCode {
    type Err = ParcelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        let is_valid = !normalized.is_empty()
            && normalized.len() <= 16
            && normalized.chars().all(|ch| ch.is_ascii_alphanumeric());
        if !is_valid {
            return Err(ParcelError::InvalidRegionCode(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

/// `<country-prefix>-<region_code>-<zero-padded sequence>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanonicalCode(String);

impl CanonicalCode {
    pub fn new(prefix: &CountryPrefix, region: &RegionCode, sequence: u64) -> Self {
        Self(format!(
            "{prefix}-{region}-{sequence:0width$}",
            width = SEQUENCE_WIDTH
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CanonicalCode {
    type Err = ParcelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        let parts = normalized.split('-').collect::<Vec<_>>();
        let [prefix, region, sequence] = parts.as_slice() else {
            return Err(ParcelError::InvalidCanonicalCode(value.to_string()));
        };
        let prefix: CountryPrefix = prefix
            .parse()
            .map_err(|_| ParcelError::InvalidCanonicalCode(value.to_string()))?;
        let region: RegionCode = region
            .parse()
            .map_err(|_| ParcelError::InvalidCanonicalCode(value.to_string()))?;
        let is_sequence = sequence.len() >= SEQUENCE_WIDTH
            && sequence.chars().all(|ch| ch.is_ascii_digit());
        if !is_sequence {
            return Err(ParcelError::InvalidCanonicalCode(value.to_string()));
        }
        let sequence: u64 = sequence
            .parse()
            .map_err(|_| ParcelError::InvalidCanonicalCode(value.to_string()))?;
        if sequence == 0 {
            return Err(ParcelError::InvalidCanonicalCode(value.to_string()));
        }
        Ok(Self::new(&prefix, &region, sequence))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryPrefix(String);

impl CountryPrefix {
    pub fn default_prefix() -> Self {
        Self("OM".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CountryPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CountryPrefix {
    type Err = ParcelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        let is_valid = (2..=3).contains(&normalized.len())
            && normalized.chars().all(|ch| ch.is_ascii_alphabetic());
        if !is_valid {
            return Err(ParcelError::InvalidConfig(format!(
                "country prefix must be 2-3 letters: {value}"
            )));
        }
        Ok(Self(normalized))
    }
}

/// Identity of a record within its source, e.g. `export.kml::4`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceKey(String);

impl SourceKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn for_placemark(file_name: &str, index: usize) -> Self {
        Self(format!("{file_name}::{index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Null,
    Number(f64),
    Text(String),
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Number(value)
    }
}

/// Free-form attributes in source order.
pub type Properties = IndexMap<String, PropertyValue>;

/// One record handed to the raw store writer.
#[derive(Debug, Clone)]
pub struct NewObservation {
    pub source: String,
    pub source_key: SourceKey,
    pub properties: Properties,
    pub geometry: Option<GeometryInput>,
    pub footprint: Option<GeometryInput>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RawObservation {
    pub raw_id: Uuid,
    pub source: String,
    pub source_key: SourceKey,
    pub properties: Properties,
    /// WKT in the storage CRS.
    pub geometry: Option<String>,
    /// GeoJSON geometry object in the storage CRS.
    pub footprint: Option<serde_json::Value>,
    pub srid: u32,
    pub fetched_at: DateTime<Utc>,
}

impl RawObservation {
    pub fn geometry(&self) -> Result<Option<Geometry<f64>>, ParcelError> {
        self.geometry.as_deref().map(geometry::parse_wkt).transpose()
    }

    pub fn footprint(&self) -> Result<Option<Geometry<f64>>, ParcelError> {
        self.footprint.as_ref().map(geometry::from_geojson).transpose()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CanonicalAddress {
    pub address_id: i64,
    pub raw_id: Uuid,
    pub region_code: RegionCode,
    pub canonical_code: CanonicalCode,
    /// WKT copied from the observation at canonicalization time.
    pub geometry: Option<String>,
    pub created_at: DateTime<Utc>,
}
