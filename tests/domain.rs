use assert_matches::assert_matches;
use std::str::FromStr;

use parcelcode::domain::{CanonicalCode, CountryPrefix, PropertyValue, RegionCode, SourceKey};
use parcelcode::error::ParcelError;

#[test]
fn canonical_code_format() {
    let prefix = CountryPrefix::from_str("om").unwrap();
    let region = RegionCode::from_str("WL001").unwrap();
    let code = CanonicalCode::new(&prefix, &region, 1);
    assert_eq!(code.as_str(), "OM-WL001-000001");
}

#[test]
fn canonical_code_wider_than_padding() {
    let prefix = CountryPrefix::default_prefix();
    let region = RegionCode::default_region();
    let code = CanonicalCode::new(&prefix, &region, 1_234_567);
    assert_eq!(code.as_str(), "OM-WL001-1234567");
}

#[test]
fn canonical_code_parses_case_insensitively() {
    let code = CanonicalCode::from_str("om-wl001-000042").unwrap();
    assert_eq!(code.as_str(), "OM-WL001-000042");
}

#[test]
fn canonical_code_rejects_bad_input() {
    for input in ["", "OM-WL001", "OM-WL001-42", "OM-WL001-000000", "1-WL001-000001"] {
        assert_matches!(
            CanonicalCode::from_str(input),
            Err(ParcelError::InvalidCanonicalCode(_)),
            "{input}"
        );
    }
}

#[test]
fn region_code_rejects_empty() {
    assert_matches!(
        RegionCode::from_str("  "),
        Err(ParcelError::InvalidRegionCode(_))
    );
}

#[test]
fn country_prefix_must_be_letters() {
    assert_matches!(
        CountryPrefix::from_str("O1"),
        Err(ParcelError::InvalidConfig(_))
    );
    assert_matches!(
        CountryPrefix::from_str("OMAN"),
        Err(ParcelError::InvalidConfig(_))
    );
}

#[test]
fn source_key_for_placemark() {
    assert_eq!(SourceKey::for_placemark("map1.kml", 3).as_str(), "map1.kml::3");
}

#[test]
fn property_values_serialize_untagged() {
    let values = vec![
        PropertyValue::Null,
        PropertyValue::from(12.5),
        PropertyValue::from("Bawshar"),
    ];
    let json = serde_json::to_string(&values).unwrap();
    assert_eq!(json, r#"[null,12.5,"Bawshar"]"#);
}
