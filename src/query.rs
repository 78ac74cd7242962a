use serde::Serialize;
use serde_json::{Value, json};
use tracing::warn;

use crate::domain::{CanonicalAddress, CanonicalCode};
use crate::error::ParcelError;
use crate::geometry;
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
pub struct AddressView {
    pub address_id: i64,
    pub canonical_code: String,
    pub region_code: String,
    pub coordinates: Vec<[f64; 2]>,
    pub geometry: Option<Value>,
}

/// Looks up the exact code as written, ignoring surrounding whitespace.
pub fn find_address(store: &Store, code: &str) -> Result<AddressView, ParcelError> {
    let requested = code.trim();
    let code = requested
        .parse::<CanonicalCode>()
        .ok()
        .filter(|parsed| parsed.as_str() == requested)
        .ok_or_else(|| ParcelError::AddressNotFound(requested.to_string()))?;
    let address = store
        .address_by_code(&code)?
        .ok_or_else(|| ParcelError::AddressNotFound(code.to_string()))?;

    let shape = address
        .geometry
        .as_deref()
        .map(geometry::parse_wkt)
        .transpose()
        .unwrap_or_else(|err| {
            warn!(code = %address.canonical_code, error = %err, "stored geometry is unreadable");
            None
        });

    Ok(AddressView {
        address_id: address.address_id,
        canonical_code: address.canonical_code.to_string(),
        region_code: address.region_code.to_string(),
        coordinates: shape.as_ref().map(geometry::coordinates).unwrap_or_default(),
        geometry: shape.as_ref().map(geometry::to_geojson),
    })
}

/// Every address with readable geometry as a GeoJSON `FeatureCollection`.
pub fn feature_collection(store: &Store) -> Result<Value, ParcelError> {
    let features = store
        .addresses()?
        .iter()
        .filter_map(feature)
        .collect::<Vec<_>>();
    Ok(json!({
        "type": "FeatureCollection",
        "features": features,
    }))
}

fn feature(address: &CanonicalAddress) -> Option<Value> {
    let wkt = address.geometry.as_deref()?;
    let shape = match geometry::parse_wkt(wkt) {
        Ok(shape) => shape,
        Err(err) => {
            warn!(code = %address.canonical_code, error = %err, "skipping feature");
            return None;
        }
    };
    Some(json!({
        "type": "Feature",
        "geometry": geometry::to_geojson(&shape),
        "properties": {
            "address_id": address.address_id,
            "canonical_code": address.canonical_code.as_str(),
            "region_code": address.region_code.as_str(),
        },
    }))
}
