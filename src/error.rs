use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ParcelError {
    #[error("invalid region code: {0}")]
    InvalidRegionCode(String),

    #[error("invalid canonical code: {0}")]
    InvalidCanonicalCode(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("browsing backend failed to start: {0}")]
    BrowserLaunch(String),

    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },

    #[error("navigation to {url} timed out")]
    NavigationTimeout { url: String },

    #[error("{url} returned status {status}")]
    PageStatus { url: String, status: u16 },

    #[error("download from {url} failed: {message}")]
    Download { url: String, message: String },

    #[error("download from {url} timed out")]
    DownloadTimeout { url: String },

    #[error("export control on {url} has no download target")]
    MissingDownloadTarget { url: String },

    #[error("document is not well-formed XML: {0}")]
    XmlParse(String),

    #[error("document is not a KML export: {0}")]
    NotKml(String),

    #[error("failed to read export archive: {0}")]
    Archive(String),

    #[error("malformed coordinates: {0}")]
    MalformedCoordinates(String),

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("coordinate ({x}, {y}) is outside EPSG:4326 bounds")]
    CoordinateOutOfRange { x: f64, y: f64 },

    #[error("failed to parse WKT: {0}")]
    WktParse(String),

    #[error("failed to decode GeoJSON geometry: {0}")]
    GeoJson(String),

    #[error("no region found for observation {0}")]
    MissingRegion(String),

    #[error("unsupported storage connection string: {0}")]
    InvalidConnectionString(String),

    #[error("failed to open store: {0}")]
    StoreOpen(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("address not found: {0}")]
    AddressNotFound(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl ParcelError {
    /// Errors that abort a whole stage instead of a single item.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ParcelError::BrowserLaunch(_)
                | ParcelError::StoreOpen(_)
                | ParcelError::InvalidConnectionString(_)
        )
    }
}

impl From<rusqlite::Error> for ParcelError {
    fn from(err: rusqlite::Error) -> Self {
        ParcelError::Storage(err.to_string())
    }
}
