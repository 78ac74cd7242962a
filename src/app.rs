use std::time::{Duration, Instant};

use camino::Utf8Path;
use serde::Serialize;
use serde_json::Value;
use tracing::error;

use crate::canonical::{CanonicalizeReport, Canonicalizer, resolver_for};
use crate::config::ResolvedConfig;
use crate::domain::Properties;
use crate::error::ParcelError;
use crate::fetcher::{ExportSource, FetchOutcome, FetchStatus, Fetcher};
use crate::fs_util::{list_export_files, read_export, read_url_list, validate_writable_dir};
use crate::geometry;
use crate::kml;
use crate::loader::{LoadReport, Loader};
use crate::query::{self, AddressView};
use crate::store::{RegionSequence, Store};

/// Records shown per file by the parse stage.
const SAMPLE_LIMIT: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct FetchResult {
    pub saved: usize,
    pub not_found: usize,
    pub failed: usize,
    pub outcomes: Vec<FetchOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParseResult {
    pub files: Vec<ParsedFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParsedFile {
    pub file: String,
    pub placemarks: usize,
    pub malformed: usize,
    pub error: Option<String>,
    pub samples: Vec<PlacemarkSample>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlacemarkSample {
    pub index: usize,
    pub name: Option<String>,
    pub properties: Properties,
    pub geometry: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadResult {
    #[serde(flatten)]
    pub report: LoadReport,
    pub total_observations: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CanonicalizeResult {
    #[serde(flatten)]
    pub report: CanonicalizeReport,
    pub regions: Vec<RegionSequence>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink: Sync {
    fn event(&self, event: ProgressEvent);
}

pub struct App<S: ExportSource> {
    config: ResolvedConfig,
    source: S,
}

impl<S: ExportSource> App<S> {
    pub fn new(config: ResolvedConfig, source: S) -> Self {
        Self { config, source }
    }

    pub fn fetch(
        &self,
        url_list: &Utf8Path,
        out_dir: &Utf8Path,
        sink: &dyn ProgressSink,
    ) -> Result<FetchResult, ParcelError> {
        let urls = read_url_list(url_list)?;
        validate_writable_dir(out_dir).map_err(|err| {
            ParcelError::Filesystem(format!("output directory {out_dir} is not writable: {err}"))
        })?;
        sink.event(ProgressEvent {
            message: format!(
                "phase=Fetch; {} urls, concurrency {}",
                urls.len(),
                self.config.fetch.concurrency
            ),
            elapsed: None,
        });

        let start = Instant::now();
        let outcomes = Fetcher::new(self.config.fetch.clone()).fetch_all(
            &self.source,
            &urls,
            out_dir,
            sink,
        )?;
        let count = |status: FetchStatus| {
            outcomes
                .iter()
                .filter(|outcome| outcome.status == status)
                .count()
        };
        let result = FetchResult {
            saved: count(FetchStatus::Saved),
            not_found: count(FetchStatus::NotFound),
            failed: count(FetchStatus::Failed),
            outcomes,
        };
        sink.event(ProgressEvent {
            message: format!(
                "phase=Fetch; saved={} not_found={} failed={}",
                result.saved, result.not_found, result.failed
            ),
            elapsed: Some(start.elapsed()),
        });
        Ok(result)
    }

    pub fn parse(&self, dir: &Utf8Path, sink: &dyn ProgressSink) -> Result<ParseResult, ParcelError> {
        let files = list_export_files(dir)?;
        sink.event(ProgressEvent {
            message: format!("phase=Parse; {} export files in {dir}", files.len()),
            elapsed: None,
        });

        let mut parsed = Vec::with_capacity(files.len());
        for path in files {
            let file = path.file_name().unwrap_or(path.as_str()).to_string();
            let document = match read_export(&path).and_then(|bytes| kml::parse_document(&bytes)) {
                Ok(document) => document,
                Err(err) => {
                    error!(file = %path, error = %err, "skipping export file");
                    parsed.push(ParsedFile {
                        file,
                        placemarks: 0,
                        malformed: 0,
                        error: Some(err.to_string()),
                        samples: Vec::new(),
                    });
                    continue;
                }
            };

            let mut entry = ParsedFile {
                file,
                placemarks: 0,
                malformed: 0,
                error: None,
                samples: Vec::new(),
            };
            for placemark in document.placemarks() {
                match placemark {
                    Ok(placemark) => {
                        entry.placemarks += 1;
                        if entry.samples.len() < SAMPLE_LIMIT {
                            entry.samples.push(PlacemarkSample {
                                index: placemark.index,
                                name: placemark.name.clone(),
                                properties: placemark.properties(),
                                geometry: placemark.geometry.as_ref().map(geometry::to_geojson),
                            });
                        }
                    }
                    Err(_) => entry.malformed += 1,
                }
            }
            parsed.push(entry);
        }
        Ok(ParseResult { files: parsed })
    }

    pub fn load(
        &self,
        store: &Store,
        dir: &Utf8Path,
        sink: &dyn ProgressSink,
    ) -> Result<LoadResult, ParcelError> {
        let report = Loader::new(store, self.config.source.clone()).load_directory(dir, sink)?;
        Ok(LoadResult {
            report,
            total_observations: store.counts()?.raw_observations,
        })
    }

    pub fn canonicalize(
        &self,
        store: &Store,
        sink: &dyn ProgressSink,
    ) -> Result<CanonicalizeResult, ParcelError> {
        let canonicalizer = Canonicalizer::new(
            self.config.country_prefix.clone(),
            resolver_for(&self.config.region_policy),
        );
        let report = canonicalizer.run(store, sink)?;
        Ok(CanonicalizeResult {
            report,
            regions: store.counts()?.regions,
        })
    }

    pub fn address(&self, store: &Store, code: &str) -> Result<AddressView, ParcelError> {
        query::find_address(store, code)
    }

    pub fn plots(&self, store: &Store) -> Result<Value, ParcelError> {
        query::feature_collection(store)
    }
}
