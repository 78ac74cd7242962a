use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::{ProgressEvent, ProgressSink};
use crate::browser::{Browser, BrowserPage, EXPORT_CONTROLS};
use crate::config::FetchSettings;
use crate::error::ParcelError;
use crate::fs_util::{sanitize_suggested_name, url_file_stem, write_bytes_atomic};

/// Where an export came from on its page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportOrigin {
    DirectLink { href: String },
    Control { label: String },
}

#[derive(Debug, Clone)]
pub struct ExportFile {
    pub bytes: Vec<u8>,
    pub origin: ExportOrigin,
    pub suggested_filename: Option<String>,
}

/// Resolves a page URL to its export, if the page offers one.
pub trait ExportSource: Send + Sync {
    fn export_for(&self, url: &str) -> Result<Option<ExportFile>, ParcelError>;
}

pub struct BrowserExportSource<B: Browser> {
    browser: B,
    settings: FetchSettings,
}

impl<B: Browser> BrowserExportSource<B> {
    pub fn new(browser: B, settings: FetchSettings) -> Self {
        Self { browser, settings }
    }

    fn direct_link(&self, hrefs: &[String]) -> Option<String> {
        let suffix = format!(".{}", self.settings.export_extension);
        hrefs
            .iter()
            .find(|href| {
                let path = href.split(['?', '#']).next().unwrap_or_default();
                path.to_ascii_lowercase().ends_with(&suffix)
            })
            .cloned()
    }
}

impl<B: Browser> ExportSource for BrowserExportSource<B> {
    fn export_for(&self, url: &str) -> Result<Option<ExportFile>, ParcelError> {
        let mut page = self.browser.new_page()?;
        page.goto(url, self.settings.navigation_timeout)?;

        if let Some(href) = self.direct_link(&page.anchor_hrefs()) {
            debug!(url, href = %href, "found direct export link");
            let bytes = page.fetch(&href, self.settings.download_timeout)?;
            return Ok(Some(ExportFile {
                bytes,
                origin: ExportOrigin::DirectLink { href },
                suggested_filename: None,
            }));
        }

        // A control that cannot download falls through to the next selector.
        let mut last_error = None;
        for selector in EXPORT_CONTROLS {
            let Some(control) = page.find_control(selector) else {
                continue;
            };
            debug!(url, label = %control.label, "triggering export control");
            match page.trigger_download(&control, self.settings.download_timeout) {
                Ok(download) => {
                    return Ok(Some(ExportFile {
                        bytes: download.bytes,
                        origin: ExportOrigin::Control {
                            label: control.label,
                        },
                        suggested_filename: download.suggested_filename,
                    }));
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    debug!(url, label = %control.label, error = %err, "export control gave no download");
                    last_error = Some(err);
                }
            }
        }

        if let Some(err) = last_error {
            return Err(err);
        }
        warn!(url, "no export link or control found");
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Saved,
    NotFound,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchOutcome {
    pub url: String,
    pub status: FetchStatus,
    pub path: Option<String>,
    pub error: Option<String>,
}

impl FetchOutcome {
    fn saved(url: &str, path: Utf8PathBuf) -> Self {
        Self {
            url: url.to_string(),
            status: FetchStatus::Saved,
            path: Some(path.into_string()),
            error: None,
        }
    }

    fn not_found(url: &str) -> Self {
        Self {
            url: url.to_string(),
            status: FetchStatus::NotFound,
            path: None,
            error: None,
        }
    }

    fn failed(url: &str, err: &ParcelError) -> Self {
        Self {
            url: url.to_string(),
            status: FetchStatus::Failed,
            path: None,
            error: Some(err.to_string()),
        }
    }
}

/// Runs an [`ExportSource`] over a URL list with bounded concurrency.
pub struct Fetcher {
    settings: FetchSettings,
}

impl Fetcher {
    pub fn new(settings: FetchSettings) -> Self {
        Self { settings }
    }

    /// One outcome per input URL, in input order. Per-URL failures are
    /// recorded in their outcome; a fatal error aborts the run.
    pub fn fetch_all<S: ExportSource>(
        &self,
        source: &S,
        urls: &[String],
        out_dir: &Utf8Path,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<FetchOutcome>, ParcelError> {
        let workers = self.settings.concurrency.max(1).min(urls.len().max(1));
        let next = AtomicUsize::new(0);
        let abort = AtomicBool::new(false);
        let fatal: Mutex<Option<ParcelError>> = Mutex::new(None);
        let slots: Mutex<Vec<Option<FetchOutcome>>> = Mutex::new(vec![None; urls.len()]);

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        if abort.load(Ordering::SeqCst) {
                            break;
                        }
                        let index = next.fetch_add(1, Ordering::SeqCst);
                        let Some(url) = urls.get(index) else {
                            break;
                        };
                        match self.fetch_one(source, url, out_dir, sink) {
                            Ok(outcome) => {
                                if let Ok(mut slots) = slots.lock() {
                                    slots[index] = Some(outcome);
                                }
                            }
                            Err(err) => {
                                abort.store(true, Ordering::SeqCst);
                                if let Ok(mut fatal) = fatal.lock() {
                                    fatal.get_or_insert(err);
                                }
                                break;
                            }
                        }
                        if !self.settings.inter_request_delay.is_zero() {
                            thread::sleep(self.settings.inter_request_delay);
                        }
                    }
                });
            }
        });

        if let Some(err) = fatal.into_inner().ok().flatten() {
            return Err(err);
        }
        let slots = slots
            .into_inner()
            .map_err(|_| ParcelError::Filesystem("fetch worker panicked".to_string()))?;
        Ok(slots
            .into_iter()
            .zip(urls)
            .map(|(slot, url)| {
                slot.unwrap_or_else(|| FetchOutcome {
                    url: url.clone(),
                    status: FetchStatus::Failed,
                    path: None,
                    error: Some("not processed".to_string()),
                })
            })
            .collect())
    }

    /// `Err` only for fatal errors.
    fn fetch_one<S: ExportSource>(
        &self,
        source: &S,
        url: &str,
        out_dir: &Utf8Path,
        sink: &dyn ProgressSink,
    ) -> Result<FetchOutcome, ParcelError> {
        sink.event(ProgressEvent {
            message: format!("phase=Fetch; visiting {url}"),
            elapsed: None,
        });
        let start = Instant::now();

        let export = match source.export_for(url) {
            Ok(Some(export)) => export,
            Ok(None) => return Ok(FetchOutcome::not_found(url)),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!(url, error = %err, "fetch failed");
                return Ok(FetchOutcome::failed(url, &err));
            }
        };

        let path = out_dir.join(self.output_name(url, &export));
        if let Err(err) = write_bytes_atomic(&path, &export.bytes) {
            warn!(url, path = %path, error = %err, "failed to save export");
            return Ok(FetchOutcome::failed(url, &err));
        }

        info!(url, path = %path, bytes = export.bytes.len(), "saved export");
        sink.event(ProgressEvent {
            message: format!("phase=Fetch; saved {path}"),
            elapsed: Some(start.elapsed()),
        });
        Ok(FetchOutcome::saved(url, path))
    }

    pub fn output_name(&self, url: &str, export: &ExportFile) -> String {
        let stem = url_file_stem(url);
        match export.origin {
            ExportOrigin::DirectLink { .. } => {
                format!("{stem}.{}", self.settings.export_extension)
            }
            ExportOrigin::Control { .. } => {
                let suggested = export
                    .suggested_filename
                    .as_deref()
                    .and_then(sanitize_suggested_name)
                    .unwrap_or_else(|| self.settings.fallback_filename.clone());
                format!("{stem}_{suggested}")
            }
        }
    }
}
