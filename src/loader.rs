use camino::Utf8Path;
use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::app::{ProgressEvent, ProgressSink};
use crate::domain::{NewObservation, SourceKey};
use crate::error::ParcelError;
use crate::fs_util::{list_export_files, read_export};
use crate::geometry::GeometryInput;
use crate::kml::{self, PlacemarkResult};
use crate::store::{InsertOutcome, Store};

#[derive(Debug, Clone, Default, Serialize)]
pub struct FileLoadReport {
    pub file: String,
    pub attempted: usize,
    pub written: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub files: Vec<FileLoadReport>,
    pub files_skipped: usize,
    pub attempted: usize,
    pub written: usize,
    pub duplicates: usize,
    pub skipped: usize,
}

/// Writes parsed placemarks into the raw observation store, one file per
/// transaction.
pub struct Loader<'a> {
    store: &'a Store,
    source: String,
}

impl<'a> Loader<'a> {
    pub fn new(store: &'a Store, source: impl Into<String>) -> Self {
        Self {
            store,
            source: source.into(),
        }
    }

    pub fn load_directory(
        &self,
        dir: &Utf8Path,
        sink: &dyn ProgressSink,
    ) -> Result<LoadReport, ParcelError> {
        let files = list_export_files(dir)?;
        sink.event(ProgressEvent {
            message: format!("phase=Load; {} export files in {dir}", files.len()),
            elapsed: None,
        });

        let mut report = LoadReport::default();
        for path in files {
            let start = std::time::Instant::now();
            let file_report = match self.load_file(&path) {
                Ok(file_report) => file_report,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    error!(file = %path, error = %err, "skipping export file");
                    report.files_skipped += 1;
                    FileLoadReport {
                        file: file_name(&path),
                        error: Some(err.to_string()),
                        ..FileLoadReport::default()
                    }
                }
            };
            sink.event(ProgressEvent {
                message: format!(
                    "phase=Load; {} written={} skipped={}",
                    file_report.file, file_report.written, file_report.skipped
                ),
                elapsed: Some(start.elapsed()),
            });
            report.attempted += file_report.attempted;
            report.written += file_report.written;
            report.duplicates += file_report.duplicates;
            report.skipped += file_report.skipped;
            report.files.push(file_report);
        }
        Ok(report)
    }

    /// Fails as a whole when the file cannot be read or parsed, or when its
    /// batch cannot be committed.
    pub fn load_file(&self, path: &Utf8Path) -> Result<FileLoadReport, ParcelError> {
        let bytes = read_export(path)?;
        let document = kml::parse_document(&bytes)?;
        self.write_placemarks(&file_name(path), document.placemarks())
    }

    pub fn write_placemarks(
        &self,
        file: &str,
        placemarks: impl Iterator<Item = PlacemarkResult>,
    ) -> Result<FileLoadReport, ParcelError> {
        let fetched_at = Utc::now();
        let mut report = FileLoadReport {
            file: file.to_string(),
            ..FileLoadReport::default()
        };

        self.store.write(|tx| {
            for placemark in placemarks {
                report.attempted += 1;
                let placemark = match placemark {
                    Ok(placemark) => placemark,
                    Err(err) => {
                        warn!(file, index = err.index, name = ?err.name, error = %err.error, "skipping placemark");
                        report.skipped += 1;
                        continue;
                    }
                };
                let observation = NewObservation {
                    source: self.source.clone(),
                    source_key: SourceKey::for_placemark(file, placemark.index),
                    properties: placemark.properties(),
                    geometry: placemark.geometry.clone().map(GeometryInput::Shape),
                    footprint: placemark.geometry.clone().map(GeometryInput::Shape),
                };
                match tx.insert_observation(&observation, fetched_at) {
                    Ok(InsertOutcome::Written(_)) => report.written += 1,
                    Ok(InsertOutcome::Duplicate) => report.duplicates += 1,
                    Err(err) => {
                        warn!(file, index = placemark.index, error = %err, "skipping record");
                        report.skipped += 1;
                    }
                }
            }
            Ok(())
        })?;

        info!(
            file,
            attempted = report.attempted,
            written = report.written,
            duplicates = report.duplicates,
            skipped = report.skipped,
            "loaded export file"
        );
        Ok(report)
    }
}

fn file_name(path: &Utf8Path) -> String {
    path.file_name().unwrap_or(path.as_str()).to_string()
}
