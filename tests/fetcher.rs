use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use parcelcode::app::{ProgressEvent, ProgressSink};
use parcelcode::config::FetchSettings;
use parcelcode::error::ParcelError;
use parcelcode::browser::HttpBrowser;
use parcelcode::fetcher::{
    BrowserExportSource, ExportFile, ExportOrigin, ExportSource, FetchStatus, Fetcher,
};
use parcelcode::fs_util::url_file_stem;

struct NullSink;

impl ProgressSink for NullSink {
    fn event(&self, _event: ProgressEvent) {}
}

/// Answers by URL suffix: `/none` has no export, `/fail` fails, `/slow`
/// answers late, `/fatal` cannot start the backend.
#[derive(Default)]
struct ScriptedSource {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    visited: Mutex<Vec<String>>,
    starts: Mutex<Vec<Instant>>,
}

impl ExportSource for ScriptedSource {
    fn export_for(&self, url: &str) -> Result<Option<ExportFile>, ParcelError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.visited.lock().unwrap().push(url.to_string());
        self.starts.lock().unwrap().push(Instant::now());
        if url.ends_with("/slow") {
            thread::sleep(Duration::from_millis(80));
        } else {
            thread::sleep(Duration::from_millis(10));
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if url.ends_with("/none") {
            return Ok(None);
        }
        if url.ends_with("/fail") {
            return Err(ParcelError::NavigationTimeout {
                url: url.to_string(),
            });
        }
        if url.ends_with("/fatal") {
            return Err(ParcelError::BrowserLaunch("no engine".to_string()));
        }
        if url.ends_with("/button") {
            return Ok(Some(ExportFile {
                bytes: b"<kml/>".to_vec(),
                origin: ExportOrigin::Control {
                    label: "Export to KML".to_string(),
                },
                suggested_filename: None,
            }));
        }
        Ok(Some(ExportFile {
            bytes: url.as_bytes().to_vec(),
            origin: ExportOrigin::DirectLink {
                href: format!("{url}/plots.kml"),
            },
            suggested_filename: None,
        }))
    }
}

fn settings(concurrency: usize) -> FetchSettings {
    FetchSettings {
        concurrency,
        inter_request_delay: Duration::from_millis(5),
        ..FetchSettings::default()
    }
}

fn out_dir() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    (dir, path)
}

fn files_in(dir: &Utf8PathBuf) -> Vec<String> {
    let mut names = std::fs::read_dir(dir.as_std_path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    names.sort();
    names
}

#[test]
fn page_without_export_is_absent() {
    let (_guard, dir) = out_dir();
    let source = ScriptedSource::default();
    let outcomes = Fetcher::new(settings(2))
        .fetch_all(&source, &["http://a.example/map1/none".to_string()], &dir, &NullSink)
        .unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].status, FetchStatus::NotFound);
    assert!(outcomes[0].path.is_none());
    assert!(files_in(&dir).is_empty());
}

#[test]
fn outcomes_keep_input_order() {
    let (_guard, dir) = out_dir();
    let source = ScriptedSource::default();
    let urls = vec![
        "https://maps.example/a/slow".to_string(),
        "https://maps.example/b/none".to_string(),
        "https://maps.example/c/fail".to_string(),
        "https://maps.example/d?id=4".to_string(),
    ];
    let outcomes = Fetcher::new(settings(3))
        .fetch_all(&source, &urls, &dir, &NullSink)
        .unwrap();

    let order = outcomes
        .iter()
        .map(|outcome| outcome.url.as_str())
        .collect::<Vec<_>>();
    assert_eq!(order, urls.iter().map(String::as_str).collect::<Vec<_>>());
    assert_eq!(outcomes[0].status, FetchStatus::Saved);
    assert_eq!(outcomes[1].status, FetchStatus::NotFound);
    assert_eq!(outcomes[2].status, FetchStatus::Failed);
    assert!(outcomes[2].error.is_some());
    assert_eq!(outcomes[3].status, FetchStatus::Saved);
    assert_eq!(
        files_in(&dir),
        vec![
            "maps.example_a_slow-d881021e.kml",
            "maps.example_d_id_4-4f133cf8.kml"
        ]
    );
}

#[test]
fn concurrency_is_bounded() {
    let (_guard, dir) = out_dir();
    let source = ScriptedSource::default();
    let urls = (0..8)
        .map(|i| format!("https://maps.example/{i}/slow"))
        .collect::<Vec<_>>();
    Fetcher::new(settings(2))
        .fetch_all(&source, &urls, &dir, &NullSink)
        .unwrap();
    assert!(source.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(source.visited.lock().unwrap().len(), 8);
}

#[test]
fn control_download_uses_fallback_name() {
    let (_guard, dir) = out_dir();
    let source = ScriptedSource::default();
    let outcomes = Fetcher::new(settings(1))
        .fetch_all(&source, &["https://maps.example/view/button".to_string()], &dir, &NullSink)
        .unwrap();
    assert_eq!(outcomes[0].status, FetchStatus::Saved);
    assert_eq!(files_in(&dir), vec!["maps.example_view_button-dacd6222_export.kml"]);
}

#[test]
fn backend_failure_aborts_run() {
    let (_guard, dir) = out_dir();
    let source = ScriptedSource::default();
    let urls = vec![
        "https://maps.example/a/fatal".to_string(),
        "https://maps.example/b".to_string(),
        "https://maps.example/c".to_string(),
    ];
    let err = Fetcher::new(settings(1))
        .fetch_all(&source, &urls, &dir, &NullSink)
        .unwrap_err();
    assert_matches!(err, ParcelError::BrowserLaunch(_));
    assert_eq!(source.visited.lock().unwrap().len(), 1);
}

#[test]
fn urls_with_same_sanitized_text_get_separate_files() {
    let (_guard, dir) = out_dir();
    let source = ScriptedSource::default();
    let urls = vec![
        "https://m.example/a?b".to_string(),
        "https://m.example/a/b".to_string(),
    ];
    let outcomes = Fetcher::new(settings(2))
        .fetch_all(&source, &urls, &dir, &NullSink)
        .unwrap();

    assert_ne!(outcomes[0].path, outcomes[1].path);
    assert_eq!(files_in(&dir).len(), 2);
    for (outcome, url) in outcomes.iter().zip(&urls) {
        let saved = std::fs::read(outcome.path.as_deref().unwrap()).unwrap();
        assert_eq!(saved, url.as_bytes());
    }
}

#[test]
fn long_url_is_saved_under_capped_name() {
    let (_guard, dir) = out_dir();
    let source = ScriptedSource::default();
    let url = format!("https://m.example/view?layer={}", "a".repeat(300));
    let outcomes = Fetcher::new(settings(1))
        .fetch_all(&source, std::slice::from_ref(&url), &dir, &NullSink)
        .unwrap();
    assert_eq!(outcomes[0].status, FetchStatus::Saved);
    assert_eq!(files_in(&dir), vec![format!("{}.kml", url_file_stem(&url))]);
}

#[test]
fn single_worker_waits_between_urls() {
    let (_guard, dir) = out_dir();
    let source = ScriptedSource::default();
    let delay = Duration::from_millis(50);
    let urls = (0..4)
        .map(|i| format!("https://maps.example/{i}"))
        .collect::<Vec<_>>();
    let settings = FetchSettings {
        concurrency: 1,
        inter_request_delay: delay,
        ..FetchSettings::default()
    };
    Fetcher::new(settings)
        .fetch_all(&source, &urls, &dir, &NullSink)
        .unwrap();

    let starts = source.starts.lock().unwrap();
    assert_eq!(starts.len(), 4);
    for pair in starts.windows(2) {
        assert!(pair[1].duration_since(pair[0]) >= delay);
    }
}

const MAP_PAGE: &str = r#"<html><body><a href="/files/plots.kml">Plots</a></body></html>"#;
const STALLED_EXPORT_PAGE: &str = r#"<html><body><a href="/files/stalled.kml">Plots</a></body></html>"#;
const PLOTS: &str = "<kml><Document/></kml>";

fn respond(stream: TcpStream) {
    let Ok(reader_stream) = stream.try_clone() else {
        return;
    };
    let mut reader = BufReader::new(reader_stream);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).is_err() {
        return;
    }
    loop {
        let mut header = String::new();
        match reader.read_line(&mut header) {
            Ok(n) if n > 2 => continue,
            _ => break,
        }
    }
    let path = request_line.split_whitespace().nth(1).unwrap_or("/");
    let stall = Duration::from_secs(2);
    let (wait, status, body) = match path {
        "/map" => (Duration::ZERO, "200 OK", MAP_PAGE),
        "/files/plots.kml" => (Duration::ZERO, "200 OK", PLOTS),
        "/stalled-page" => (stall, "200 OK", MAP_PAGE),
        "/stalled-export" => (Duration::ZERO, "200 OK", STALLED_EXPORT_PAGE),
        "/files/stalled.kml" => (stall, "200 OK", PLOTS),
        _ => (Duration::ZERO, "404 Not Found", ""),
    };
    thread::sleep(wait);
    let mut stream = stream;
    let _ = write!(
        stream,
        "HTTP/1.1 {status}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
}

fn serve() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            thread::spawn(move || respond(stream));
        }
    });
    format!("http://{addr}")
}

#[test]
fn http_pages_save_exports_and_fail_per_url() {
    let base = serve();
    let (_guard, dir) = out_dir();
    let settings = FetchSettings {
        concurrency: 2,
        inter_request_delay: Duration::ZERO,
        navigation_timeout: Duration::from_millis(300),
        download_timeout: Duration::from_millis(300),
        ..FetchSettings::default()
    };
    let browser = HttpBrowser::launch(&settings.user_agent).unwrap();
    let source = BrowserExportSource::new(browser, settings.clone());
    let urls = ["/map", "/stalled-page", "/stalled-export", "/missing"]
        .iter()
        .map(|path| format!("{base}{path}"))
        .collect::<Vec<_>>();

    let outcomes = Fetcher::new(settings)
        .fetch_all(&source, &urls, &dir, &NullSink)
        .unwrap();

    let statuses = outcomes.iter().map(|o| o.status).collect::<Vec<_>>();
    assert_eq!(
        statuses,
        vec![
            FetchStatus::Saved,
            FetchStatus::Failed,
            FetchStatus::Failed,
            FetchStatus::Failed,
        ]
    );
    let saved = std::fs::read_to_string(outcomes[0].path.as_deref().unwrap()).unwrap();
    assert_eq!(saved, PLOTS);
    assert!(outcomes[1].error.as_deref().unwrap().contains("timed out"));
    assert!(outcomes[2].error.as_deref().unwrap().contains("timed out"));
    assert!(outcomes[3].error.as_deref().unwrap().contains("404"));
    assert_eq!(files_in(&dir).len(), 1);
}
