use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use directories::BaseDirs;
use geo_types::{Geometry, MultiPolygon};
use serde::{Deserialize, Serialize};

use crate::domain::{CountryPrefix, RegionCode};
use crate::error::ParcelError;
use crate::geometry;

pub const CONFIG_FILE_NAME: &str = "parcelcode.json";
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub fetch: FetchSection,
    #[serde(default)]
    pub ingest: IngestSection,
    #[serde(default)]
    pub canonical: CanonicalSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct FetchSection {
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub inter_request_delay_ms: Option<u64>,
    #[serde(default)]
    pub navigation_timeout_secs: Option<u64>,
    #[serde(default)]
    pub download_timeout_secs: Option<u64>,
    #[serde(default)]
    pub export_extension: Option<String>,
    #[serde(default)]
    pub fallback_filename: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct IngestSection {
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CanonicalSection {
    #[serde(default)]
    pub country_prefix: Option<String>,
    #[serde(default)]
    pub region: Option<RegionPolicyEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum RegionPolicyEntry {
    Fixed {
        code: String,
    },
    Boundaries {
        boundaries: Vec<BoundaryEntry>,
        #[serde(default)]
        fallback: Option<String>,
    },
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BoundaryEntry {
    pub code: String,
    pub wkt: String,
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub concurrency: usize,
    pub inter_request_delay: Duration,
    pub navigation_timeout: Duration,
    pub download_timeout: Duration,
    pub export_extension: String,
    pub fallback_filename: String,
    pub user_agent: String,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            inter_request_delay: Duration::from_millis(1500),
            navigation_timeout: Duration::from_secs(60),
            download_timeout: Duration::from_secs(60),
            export_extension: "kml".to_string(),
            fallback_filename: "export.kml".to_string(),
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegionBoundary {
    pub code: RegionCode,
    pub area: MultiPolygon<f64>,
}

#[derive(Debug, Clone)]
pub enum RegionPolicy {
    Fixed(RegionCode),
    Boundaries {
        boundaries: Vec<RegionBoundary>,
        fallback: Option<RegionCode>,
    },
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub fetch: FetchSettings,
    pub source: String,
    pub country_prefix: CountryPrefix,
    pub region_policy: RegionPolicy,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            fetch: FetchSettings::default(),
            source: default_source(),
            country_prefix: CountryPrefix::default_prefix(),
            region_policy: RegionPolicy::Fixed(RegionCode::default_region()),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// An explicit path must exist; otherwise the working directory and the
    /// user config directory are tried before falling back to defaults.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, ParcelError> {
        let config_path = match path {
            Some(path) => Some(PathBuf::from(path)),
            None => Self::discover(),
        };
        let Some(config_path) = config_path else {
            return Ok(ResolvedConfig::default());
        };

        let content = fs::read_to_string(&config_path)
            .map_err(|_| ParcelError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| ParcelError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    fn discover() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return Some(local);
        }
        BaseDirs::new()
            .map(|dirs| dirs.config_dir().join("parcelcode").join(CONFIG_FILE_NAME))
            .filter(|path| path.exists())
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, ParcelError> {
        let schema_version = config.schema_version.unwrap_or(SCHEMA_VERSION);
        if schema_version != SCHEMA_VERSION {
            return Err(ParcelError::InvalidConfig(format!(
                "unsupported schema_version {schema_version}, expected {SCHEMA_VERSION}"
            )));
        }
        let defaults = FetchSettings::default();

        let concurrency = config.fetch.concurrency.unwrap_or(defaults.concurrency);
        if concurrency == 0 {
            return Err(ParcelError::InvalidConfig(
                "fetch.concurrency must be at least 1".to_string(),
            ));
        }
        let export_extension = config
            .fetch
            .export_extension
            .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
            .unwrap_or(defaults.export_extension);
        if export_extension.is_empty() {
            return Err(ParcelError::InvalidConfig(
                "fetch.export_extension must not be empty".to_string(),
            ));
        }

        let fetch = FetchSettings {
            concurrency,
            inter_request_delay: config
                .fetch
                .inter_request_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.inter_request_delay),
            navigation_timeout: config
                .fetch
                .navigation_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.navigation_timeout),
            download_timeout: config
                .fetch
                .download_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.download_timeout),
            export_extension,
            fallback_filename: config
                .fetch
                .fallback_filename
                .unwrap_or(defaults.fallback_filename),
            user_agent: config.fetch.user_agent.unwrap_or(defaults.user_agent),
        };

        let source = config
            .ingest
            .source
            .map(|source| source.trim().to_string())
            .filter(|source| !source.is_empty())
            .unwrap_or_else(default_source);

        let country_prefix = match config.canonical.country_prefix {
            Some(prefix) => prefix.parse()?,
            None => CountryPrefix::default_prefix(),
        };

        let region_policy = match config.canonical.region {
            None => RegionPolicy::Fixed(RegionCode::default_region()),
            Some(RegionPolicyEntry::Fixed { code }) => RegionPolicy::Fixed(code.parse()?),
            Some(RegionPolicyEntry::Boundaries {
                boundaries,
                fallback,
            }) => RegionPolicy::Boundaries {
                boundaries: boundaries
                    .into_iter()
                    .map(resolve_boundary)
                    .collect::<Result<Vec<_>, _>>()?,
                fallback: fallback.map(|code| code.parse()).transpose()?,
            },
        };

        Ok(ResolvedConfig {
            fetch,
            source,
            country_prefix,
            region_policy,
        })
    }
}

fn resolve_boundary(entry: BoundaryEntry) -> Result<RegionBoundary, ParcelError> {
    let code: RegionCode = entry.code.parse()?;
    let area = match geometry::normalize(geometry::parse_wkt(&entry.wkt)?)? {
        Geometry::Polygon(polygon) => MultiPolygon::new(vec![polygon]),
        Geometry::MultiPolygon(polygons) => polygons,
        other => {
            return Err(ParcelError::InvalidConfig(format!(
                "boundary for {code} must be a polygon, got {}",
                geometry::kind_name(&other)
            )));
        }
    };
    Ok(RegionBoundary { code, area })
}

pub fn default_source() -> String {
    "omanreal_kml".to_string()
}

pub fn default_user_agent() -> String {
    format!("parcelcode/{}", env!("CARGO_PKG_VERSION"))
}
