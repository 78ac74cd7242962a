//! Geometry encodings used at the storage boundary.
//!
//! Everything is held as `geo_types::Geometry<f64>` in memory and encoded as
//! WKT (observation geometry) or a GeoJSON geometry object (footprint) when
//! persisted. Both encodings are in the single storage CRS, EPSG:4326, with
//! x = longitude and y = latitude.

use std::str::FromStr;

use geo::CoordsIter;
use geo_types::{
    Coord, Geometry, GeometryCollection, LineString, MultiLineString, MultiPoint, MultiPolygon,
    Point, Polygon,
};
use serde_json::{Value, json};
use wkt::ToWkt;

use crate::error::ParcelError;

/// SRID of the storage CRS (WGS 84 longitude/latitude).
pub const STORAGE_SRID: u32 = 4326;

/// A geometry as supplied to the raw store writer, in any supported encoding.
#[derive(Debug, Clone)]
pub enum GeometryInput {
    Shape(Geometry<f64>),
    Wkt(String),
    GeoJson(Value),
}

impl GeometryInput {
    /// Decodes the input and normalizes it into the storage CRS.
    pub fn resolve(&self) -> Result<Geometry<f64>, ParcelError> {
        let geometry = match self {
            GeometryInput::Shape(geometry) => geometry.clone(),
            GeometryInput::Wkt(text) => parse_wkt(text)?,
            GeometryInput::GeoJson(value) => from_geojson(value)?,
        };
        normalize(geometry)
    }
}

/// Rejects coordinates that cannot be EPSG:4326 longitude/latitude.
pub fn normalize(geometry: Geometry<f64>) -> Result<Geometry<f64>, ParcelError> {
    for coord in geometry.coords_iter() {
        let in_range = coord.x.is_finite()
            && coord.y.is_finite()
            && (-180.0..=180.0).contains(&coord.x)
            && (-90.0..=90.0).contains(&coord.y);
        if !in_range {
            return Err(ParcelError::CoordinateOutOfRange {
                x: coord.x,
                y: coord.y,
            });
        }
    }
    Ok(geometry)
}

/// Parse WKT string to geo-types Geometry.
pub fn parse_wkt(text: &str) -> Result<Geometry<f64>, ParcelError> {
    wkt::Wkt::from_str(text)
        .map_err(|err| ParcelError::WktParse(format!("{err:?}")))
        .and_then(|parsed| {
            parsed
                .try_into()
                .map_err(|err: wkt::conversion::Error| ParcelError::WktParse(format!("{err:?}")))
        })
}

pub fn to_wkt(geometry: &Geometry<f64>) -> String {
    geometry.wkt_string()
}

pub fn kind_name(geometry: &Geometry<f64>) -> &'static str {
    match geometry {
        Geometry::Point(_) => "Point",
        Geometry::Line(_) | Geometry::LineString(_) => "LineString",
        Geometry::Polygon(_) | Geometry::Rect(_) | Geometry::Triangle(_) => "Polygon",
        Geometry::MultiPoint(_) => "MultiPoint",
        Geometry::MultiLineString(_) => "MultiLineString",
        Geometry::MultiPolygon(_) => "MultiPolygon",
        Geometry::GeometryCollection(_) => "GeometryCollection",
    }
}

/// Flat `[x, y]` list of every vertex, in traversal order.
pub fn coordinates(geometry: &Geometry<f64>) -> Vec<[f64; 2]> {
    geometry
        .coords_iter()
        .map(|coord| [coord.x, coord.y])
        .collect()
}

pub fn to_geojson(geometry: &Geometry<f64>) -> Value {
    match geometry {
        Geometry::Point(point) => json!({
            "type": "Point",
            "coordinates": position(point.0),
        }),
        Geometry::Line(line) => json!({
            "type": "LineString",
            "coordinates": [position(line.start), position(line.end)],
        }),
        Geometry::LineString(line) => json!({
            "type": "LineString",
            "coordinates": line_positions(line),
        }),
        Geometry::Polygon(polygon) => json!({
            "type": "Polygon",
            "coordinates": polygon_positions(polygon),
        }),
        Geometry::Rect(rect) => json!({
            "type": "Polygon",
            "coordinates": polygon_positions(&rect.to_polygon()),
        }),
        Geometry::Triangle(triangle) => json!({
            "type": "Polygon",
            "coordinates": polygon_positions(&triangle.to_polygon()),
        }),
        Geometry::MultiPoint(points) => json!({
            "type": "MultiPoint",
            "coordinates": points.iter().map(|point| position(point.0)).collect::<Vec<_>>(),
        }),
        Geometry::MultiLineString(lines) => json!({
            "type": "MultiLineString",
            "coordinates": lines.iter().map(line_positions).collect::<Vec<_>>(),
        }),
        Geometry::MultiPolygon(polygons) => json!({
            "type": "MultiPolygon",
            "coordinates": polygons.iter().map(polygon_positions).collect::<Vec<_>>(),
        }),
        Geometry::GeometryCollection(collection) => json!({
            "type": "GeometryCollection",
            "geometries": collection.iter().map(to_geojson).collect::<Vec<_>>(),
        }),
    }
}

pub fn from_geojson(value: &Value) -> Result<Geometry<f64>, ParcelError> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ParcelError::GeoJson("missing geometry type".to_string()))?;

    if kind == "GeometryCollection" {
        let members = value
            .get("geometries")
            .and_then(Value::as_array)
            .ok_or_else(|| ParcelError::GeoJson("missing geometries".to_string()))?;
        let members = members
            .iter()
            .map(from_geojson)
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Geometry::GeometryCollection(GeometryCollection(members)));
    }

    let coordinates = value
        .get("coordinates")
        .ok_or_else(|| ParcelError::GeoJson(format!("{kind} without coordinates")))?;
    let geometry = match kind {
        "Point" => Geometry::Point(Point(read_position(coordinates)?)),
        "LineString" => Geometry::LineString(read_line(coordinates)?),
        "Polygon" => Geometry::Polygon(read_polygon(coordinates)?),
        "MultiPoint" => Geometry::MultiPoint(MultiPoint::new(
            read_array(coordinates)?
                .iter()
                .map(|item| read_position(item).map(Point))
                .collect::<Result<Vec<_>, _>>()?,
        )),
        "MultiLineString" => Geometry::MultiLineString(MultiLineString::new(
            read_array(coordinates)?
                .iter()
                .map(read_line)
                .collect::<Result<Vec<_>, _>>()?,
        )),
        "MultiPolygon" => Geometry::MultiPolygon(MultiPolygon::new(
            read_array(coordinates)?
                .iter()
                .map(read_polygon)
                .collect::<Result<Vec<_>, _>>()?,
        )),
        other => {
            return Err(ParcelError::GeoJson(format!(
                "unsupported geometry type {other}"
            )));
        }
    };
    Ok(geometry)
}

fn position(coord: Coord<f64>) -> Value {
    json!([coord.x, coord.y])
}

fn line_positions(line: &LineString<f64>) -> Vec<Value> {
    line.coords().map(|coord| position(*coord)).collect()
}

fn polygon_positions(polygon: &Polygon<f64>) -> Vec<Vec<Value>> {
    std::iter::once(polygon.exterior())
        .chain(polygon.interiors())
        .map(line_positions)
        .collect()
}

fn read_array(value: &Value) -> Result<&Vec<Value>, ParcelError> {
    value
        .as_array()
        .ok_or_else(|| ParcelError::GeoJson(format!("expected array, got {value}")))
}

fn read_position(value: &Value) -> Result<Coord<f64>, ParcelError> {
    let items = read_array(value)?;
    let number = |index: usize| {
        items
            .get(index)
            .and_then(Value::as_f64)
            .ok_or_else(|| ParcelError::GeoJson(format!("invalid position {value}")))
    };
    Ok(Coord {
        x: number(0)?,
        y: number(1)?,
    })
}

fn read_line(value: &Value) -> Result<LineString<f64>, ParcelError> {
    let coords = read_array(value)?
        .iter()
        .map(read_position)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(LineString::new(coords))
}

fn read_polygon(value: &Value) -> Result<Polygon<f64>, ParcelError> {
    let mut rings = read_array(value)?
        .iter()
        .map(read_line)
        .collect::<Result<Vec<_>, _>>()?
        .into_iter();
    let exterior = rings
        .next()
        .ok_or_else(|| ParcelError::GeoJson("polygon without rings".to_string()))?;
    Ok(Polygon::new(exterior, rings.collect()))
}
