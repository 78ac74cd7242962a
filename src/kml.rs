//! KML export parsing.
//!
//! A document is read into a small element tree first, so a file that is not
//! well-formed XML fails as a whole and contributes nothing. Placemarks are
//! then produced lazily by a depth-first walk over the containers, in
//! document order. Each call to [`KmlDocument::placemarks`] starts a fresh
//! walk over the same tree.

use std::collections::HashMap;

use geo_types::{
    Coord, Geometry, GeometryCollection, LineString, MultiLineString, MultiPoint, MultiPolygon,
    Point, Polygon,
};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use tracing::{debug, warn};

use crate::domain::{Properties, PropertyValue};
use crate::error::ParcelError;

#[derive(Debug, Clone)]
struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<Node>,
}

#[derive(Debug, Clone)]
enum Node {
    Element(Element),
    Text(String),
}

impl Element {
    fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            Node::Text(_) => None,
        })
    }

    fn child(&self, name: &str) -> Option<&Element> {
        self.elements().find(|element| element.name == name)
    }

    fn text(&self) -> String {
        let mut out = String::new();
        for node in &self.children {
            if let Node::Text(text) = node {
                out.push_str(text);
            }
        }
        out.trim().to_string()
    }

    fn child_text(&self, name: &str) -> Option<String> {
        self.child(name)
            .map(Element::text)
            .filter(|text| !text.is_empty())
    }
}

/// How the walk treats an element.
enum NodeRole {
    Container,
    Leaf,
    Ignored,
}

fn role_of(element: &Element) -> NodeRole {
    match element.name.as_str() {
        "kml" | "Document" | "Folder" => NodeRole::Container,
        "Placemark" => NodeRole::Leaf,
        _ => NodeRole::Ignored,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldType {
    Text,
    Number,
}

#[derive(Debug, Clone)]
pub struct KmlDocument {
    root: Element,
    schemas: HashMap<String, HashMap<String, FieldType>>,
}

/// One leaf record of an export document.
#[derive(Debug, Clone, PartialEq)]
pub struct Placemark {
    /// Position among all placemarks of the document, counting malformed ones.
    pub index: usize,
    pub name: Option<String>,
    pub description: Option<String>,
    pub extended_data: Properties,
    pub geometry: Option<Geometry<f64>>,
}

impl Placemark {
    /// Name, description and extended data merged into one attribute map.
    pub fn properties(&self) -> Properties {
        let mut properties = Properties::new();
        if let Some(name) = &self.name {
            properties.insert("name".to_string(), PropertyValue::from(name.as_str()));
        }
        if let Some(description) = &self.description {
            properties.insert(
                "description".to_string(),
                PropertyValue::from(description.as_str()),
            );
        }
        for (key, value) in &self.extended_data {
            properties.insert(key.clone(), value.clone());
        }
        properties
    }
}

#[derive(Debug)]
pub struct PlacemarkError {
    pub index: usize,
    pub name: Option<String>,
    pub error: ParcelError,
}

pub type PlacemarkResult = Result<Placemark, PlacemarkError>;

pub fn parse_document(bytes: &[u8]) -> Result<KmlDocument, ParcelError> {
    let root = read_tree(bytes)?;
    if !matches!(root.name.as_str(), "kml" | "Document" | "Folder") {
        return Err(ParcelError::NotKml(format!(
            "unexpected root element <{}>",
            root.name
        )));
    }
    let mut schemas = HashMap::new();
    collect_schemas(&root, &mut schemas);
    Ok(KmlDocument { root, schemas })
}

impl KmlDocument {
    pub fn placemarks(&self) -> Placemarks<'_> {
        Placemarks {
            document: self,
            stack: vec![self.root.children.iter()],
            next_index: 0,
        }
    }
}

pub struct Placemarks<'a> {
    document: &'a KmlDocument,
    stack: Vec<std::slice::Iter<'a, Node>>,
    next_index: usize,
}

impl Iterator for Placemarks<'_> {
    type Item = PlacemarkResult;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(top) = self.stack.last_mut() {
            let Some(node) = top.next() else {
                self.stack.pop();
                continue;
            };
            let Node::Element(element) = node else {
                continue;
            };
            match role_of(element) {
                NodeRole::Container => self.stack.push(element.children.iter()),
                NodeRole::Leaf => {
                    let index = self.next_index;
                    self.next_index += 1;
                    return Some(self.document.read_placemark(element, index));
                }
                NodeRole::Ignored => {}
            }
        }
        None
    }
}

impl KmlDocument {
    fn read_placemark(&self, element: &Element, index: usize) -> PlacemarkResult {
        let name = element.child_text("name");
        let description = element.child_text("description");
        let extended_data = element
            .child("ExtendedData")
            .map(|data| self.read_extended_data(data, index))
            .unwrap_or_default();
        let geometry = element
            .elements()
            .find(|child| is_geometry(&child.name))
            .map(read_geometry)
            .transpose()
            .map_err(|error| PlacemarkError {
                index,
                name: name.clone(),
                error,
            })?
            .flatten();

        Ok(Placemark {
            index,
            name,
            description,
            extended_data,
            geometry,
        })
    }

    fn read_extended_data(&self, element: &Element, index: usize) -> Properties {
        let mut properties = Properties::new();
        for child in element.elements() {
            match child.name.as_str() {
                "Data" => {
                    let Some(key) = child.attribute("name").filter(|key| !key.is_empty()) else {
                        debug!(index, "skipping unnamed Data element");
                        continue;
                    };
                    let value = match child.child_text("value") {
                        Some(text) => PropertyValue::Text(text),
                        None => PropertyValue::Null,
                    };
                    properties.insert(key.to_string(), value);
                }
                "SchemaData" => {
                    let fields = child
                        .attribute("schemaUrl")
                        .map(|url| url.trim_start_matches('#'))
                        .and_then(|id| self.schemas.get(id));
                    for simple in child.elements().filter(|item| item.name == "SimpleData") {
                        let Some(key) = simple.attribute("name").filter(|key| !key.is_empty())
                        else {
                            debug!(index, "skipping unnamed SimpleData element");
                            continue;
                        };
                        let field_type = fields
                            .and_then(|fields| fields.get(key))
                            .copied()
                            .unwrap_or(FieldType::Text);
                        match decode_simple_value(&simple.text(), field_type) {
                            Some(value) => {
                                properties.insert(key.to_string(), value);
                            }
                            None => warn!(index, attribute = key, "undecodable SimpleData value"),
                        }
                    }
                }
                _ => {}
            }
        }
        properties
    }
}

fn decode_simple_value(text: &str, field_type: FieldType) -> Option<PropertyValue> {
    if text.is_empty() {
        return Some(PropertyValue::Null);
    }
    match field_type {
        FieldType::Text => Some(PropertyValue::Text(text.to_string())),
        FieldType::Number => text
            .parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
            .map(PropertyValue::Number),
    }
}

fn collect_schemas(element: &Element, schemas: &mut HashMap<String, HashMap<String, FieldType>>) {
    for child in element.elements() {
        if child.name == "Schema" {
            let Some(id) = child.attribute("id").or_else(|| child.attribute("name")) else {
                continue;
            };
            let fields = child
                .elements()
                .filter(|field| field.name == "SimpleField")
                .filter_map(|field| {
                    let name = field.attribute("name")?;
                    let field_type = match field.attribute("type").unwrap_or("string") {
                        "int" | "uint" | "short" | "ushort" | "float" | "double" => {
                            FieldType::Number
                        }
                        _ => FieldType::Text,
                    };
                    Some((name.to_string(), field_type))
                })
                .collect();
            schemas.insert(id.to_string(), fields);
        } else if matches!(role_of(child), NodeRole::Container) {
            collect_schemas(child, schemas);
        }
    }
}

fn is_geometry(name: &str) -> bool {
    matches!(
        name,
        "Point" | "LineString" | "LinearRing" | "Polygon" | "MultiGeometry"
    )
}

/// `Ok(None)` for geometry containers with nothing in them.
fn read_geometry(element: &Element) -> Result<Option<Geometry<f64>>, ParcelError> {
    let geometry = match element.name.as_str() {
        "Point" => {
            let coords = read_coordinates(element)?;
            let [coord] = coords.as_slice() else {
                return Err(ParcelError::InvalidGeometry(format!(
                    "Point needs exactly one coordinate, found {}",
                    coords.len()
                )));
            };
            Geometry::Point(Point(*coord))
        }
        "LineString" | "LinearRing" => Geometry::LineString(read_line(element)?),
        "Polygon" => Geometry::Polygon(read_polygon(element)?),
        "MultiGeometry" => {
            let members = element
                .elements()
                .filter(|child| is_geometry(&child.name))
                .map(read_geometry)
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .flatten()
                .collect::<Vec<_>>();
            if members.is_empty() {
                return Ok(None);
            }
            collapse_members(members)
        }
        other => {
            return Err(ParcelError::InvalidGeometry(format!(
                "unsupported geometry <{other}>"
            )));
        }
    };
    Ok(Some(geometry))
}

fn collapse_members(members: Vec<Geometry<f64>>) -> Geometry<f64> {
    if members.iter().all(|member| matches!(member, Geometry::Point(_))) {
        let points = members
            .into_iter()
            .filter_map(|member| match member {
                Geometry::Point(point) => Some(point),
                _ => None,
            })
            .collect();
        return Geometry::MultiPoint(MultiPoint::new(points));
    }
    if members
        .iter()
        .all(|member| matches!(member, Geometry::LineString(_)))
    {
        let lines = members
            .into_iter()
            .filter_map(|member| match member {
                Geometry::LineString(line) => Some(line),
                _ => None,
            })
            .collect();
        return Geometry::MultiLineString(MultiLineString::new(lines));
    }
    if members
        .iter()
        .all(|member| matches!(member, Geometry::Polygon(_)))
    {
        let polygons = members
            .into_iter()
            .filter_map(|member| match member {
                Geometry::Polygon(polygon) => Some(polygon),
                _ => None,
            })
            .collect();
        return Geometry::MultiPolygon(MultiPolygon::new(polygons));
    }
    Geometry::GeometryCollection(GeometryCollection(members))
}

fn read_line(element: &Element) -> Result<LineString<f64>, ParcelError> {
    let coords = read_coordinates(element)?;
    if coords.len() < 2 {
        return Err(ParcelError::InvalidGeometry(format!(
            "{} needs at least two coordinates",
            element.name
        )));
    }
    Ok(LineString::new(coords))
}

fn read_ring(boundary: &Element) -> Result<LineString<f64>, ParcelError> {
    let ring = boundary.child("LinearRing").ok_or_else(|| {
        ParcelError::InvalidGeometry(format!("<{}> without LinearRing", boundary.name))
    })?;
    let line = read_line(ring)?;
    if line.0.len() < 3 {
        return Err(ParcelError::InvalidGeometry(
            "polygon ring needs at least three coordinates".to_string(),
        ));
    }
    Ok(line)
}

fn read_polygon(element: &Element) -> Result<Polygon<f64>, ParcelError> {
    let outer = element
        .child("outerBoundaryIs")
        .ok_or_else(|| ParcelError::InvalidGeometry("Polygon without outer boundary".to_string()))?;
    let exterior = read_ring(outer)?;
    let interiors = element
        .elements()
        .filter(|child| child.name == "innerBoundaryIs")
        .map(read_ring)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Polygon::new(exterior, interiors))
}

/// Reads `lon,lat[,alt]` tuples separated by whitespace. Altitude is dropped.
fn read_coordinates(element: &Element) -> Result<Vec<Coord<f64>>, ParcelError> {
    let text = element
        .child("coordinates")
        .map(Element::text)
        .unwrap_or_default();
    text.split_whitespace().map(parse_tuple).collect()
}

fn parse_tuple(tuple: &str) -> Result<Coord<f64>, ParcelError> {
    let parts = tuple.split(',').map(str::trim).collect::<Vec<_>>();
    if !(2..=3).contains(&parts.len()) {
        return Err(ParcelError::MalformedCoordinates(tuple.to_string()));
    }
    let mut values = Vec::with_capacity(parts.len());
    for part in parts {
        let value = part
            .parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
            .ok_or_else(|| ParcelError::MalformedCoordinates(tuple.to_string()))?;
        values.push(value);
    }
    Ok(Coord {
        x: values[0],
        y: values[1],
    })
}

fn read_tree(bytes: &[u8]) -> Result<Element, ParcelError> {
    let mut reader = Reader::from_reader(bytes);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;
    loop {
        let event = reader.read_event().map_err(|err| {
            ParcelError::XmlParse(format!(
                "at byte {}: {err}",
                reader.buffer_position()
            ))
        })?;
        match event {
            Event::Start(start) => stack.push(open_element(&start)?),
            Event::Empty(start) => {
                let element = open_element(&start)?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| ParcelError::XmlParse("unbalanced end tag".to_string()))?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::Text(text) => {
                let text = match text.unescape() {
                    Ok(text) => text.into_owned(),
                    Err(_) => String::from_utf8_lossy(&text).into_owned(),
                };
                push_text(&mut stack, &text);
            }
            Event::CData(data) => {
                let text = String::from_utf8_lossy(&data);
                push_text(&mut stack, &text);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(ParcelError::XmlParse(
            "document ended inside an open element".to_string(),
        ));
    }
    root.ok_or_else(|| ParcelError::NotKml("document has no root element".to_string()))
}

fn open_element(start: &BytesStart<'_>) -> Result<Element, ParcelError> {
    let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attribute in start.attributes() {
        let attribute = attribute.map_err(|err| ParcelError::XmlParse(err.to_string()))?;
        let key = String::from_utf8_lossy(attribute.key.local_name().as_ref()).into_owned();
        let value = attribute
            .unescape_value()
            .map_err(|err| ParcelError::XmlParse(err.to_string()))?
            .into_owned();
        attributes.push((key, value));
    }
    Ok(Element {
        name,
        attributes,
        children: Vec::new(),
    })
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
) -> Result<(), ParcelError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(Node::Element(element)),
        None if root.is_none() => *root = Some(element),
        None => {
            return Err(ParcelError::XmlParse(
                "more than one root element".to_string(),
            ));
        }
    }
    Ok(())
}

fn push_text(stack: &mut [Element], text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(parent) = stack.last_mut() {
        parent.children.push(Node::Text(text.to_string()));
    }
}
