use assert_matches::assert_matches;
use chrono::Utc;
use geo_types::{Geometry, Point};

use parcelcode::app::{ProgressEvent, ProgressSink};
use parcelcode::canonical::{Canonicalizer, FixedRegion};
use parcelcode::domain::{CountryPrefix, NewObservation, Properties, RegionCode, SourceKey};
use parcelcode::error::ParcelError;
use parcelcode::geometry::GeometryInput;
use parcelcode::query::{feature_collection, find_address};
use parcelcode::store::Store;

struct NullSink;

impl ProgressSink for NullSink {
    fn event(&self, _event: ProgressEvent) {}
}

fn seeded_store() -> Store {
    let store = Store::open(":memory:").unwrap();
    let fetched_at = Utc::now();
    store
        .write(|tx| {
            tx.insert_observation(
                &NewObservation {
                    source: "omanreal_kml".to_string(),
                    source_key: SourceKey::new("map::0"),
                    properties: Properties::new(),
                    geometry: Some(GeometryInput::Shape(Geometry::Point(Point::new(58.4, 23.6)))),
                    footprint: None,
                },
                fetched_at,
            )?;
            tx.insert_observation(
                &NewObservation {
                    source: "omanreal_kml".to_string(),
                    source_key: SourceKey::new("map::1"),
                    properties: Properties::new(),
                    geometry: None,
                    footprint: None,
                },
                fetched_at,
            )?;
            Ok(())
        })
        .unwrap();
    Canonicalizer::new(
        CountryPrefix::default_prefix(),
        Box::new(FixedRegion::new(RegionCode::default_region())),
    )
    .run(&store, &NullSink)
    .unwrap();
    store
}

#[test]
fn lookup_by_code() {
    let store = seeded_store();
    let view = find_address(&store, "OM-WL001-000001").unwrap();
    assert_eq!(view.canonical_code, "OM-WL001-000001");
    assert_eq!(view.region_code, "WL001");
    assert_eq!(view.coordinates, vec![[58.4, 23.6]]);
    assert_eq!(view.geometry.unwrap()["type"], "Point");
}

#[test]
fn address_without_geometry_has_no_coordinates() {
    let store = seeded_store();
    let view = find_address(&store, " OM-WL001-000002 ").unwrap();
    assert!(view.coordinates.is_empty());
    assert!(view.geometry.is_none());
}

#[test]
fn unknown_code_is_not_found() {
    let store = seeded_store();
    assert_matches!(
        find_address(&store, "OM-WL001-000099"),
        Err(ParcelError::AddressNotFound(_))
    );
    assert_matches!(
        find_address(&store, "not-a-code"),
        Err(ParcelError::AddressNotFound(_))
    );
}

#[test]
fn lookup_does_not_rewrite_the_code() {
    let store = seeded_store();
    for code in ["om-wl001-000001", "OM-WL001-0000001"] {
        assert_matches!(
            find_address(&store, code),
            Err(ParcelError::AddressNotFound(requested)) if requested == code
        );
    }
}

#[test]
fn feature_collection_skips_missing_geometry() {
    let store = seeded_store();
    let collection = feature_collection(&store).unwrap();
    assert_eq!(collection["type"], "FeatureCollection");
    let features = collection["features"].as_array().unwrap();
    assert_eq!(features.len(), 1);
    assert_eq!(features[0]["properties"]["canonical_code"], "OM-WL001-000001");
    assert_eq!(features[0]["properties"]["region_code"], "WL001");
    assert_eq!(features[0]["geometry"]["coordinates"][0], 58.4);
}
