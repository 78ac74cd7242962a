use std::fs;
use std::io::Write;

use camino::Utf8PathBuf;

use parcelcode::app::{ProgressEvent, ProgressSink};
use parcelcode::loader::Loader;
use parcelcode::store::Store;

struct NullSink;

impl ProgressSink for NullSink {
    fn event(&self, _event: ProgressEvent) {}
}

const THREE_WITH_ONE_MALFORMED: &str = r#"<kml><Document>
    <Placemark><name>P1</name><Point><coordinates>58.1,23.1</coordinates></Point></Placemark>
    <Placemark><name>P2</name><Point><coordinates>58.2;23.2</coordinates></Point></Placemark>
    <Placemark><name>P3</name><Point><coordinates>58.3,23.3</coordinates></Point></Placemark>
</Document></kml>"#;

fn export_dir(files: &[(&str, &[u8])]) -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    for (name, content) in files {
        fs::write(path.join(name).as_std_path(), content).unwrap();
    }
    (dir, path)
}

#[test]
fn malformed_placemark_is_skipped() {
    let (_guard, dir) = export_dir(&[("map1.kml", THREE_WITH_ONE_MALFORMED.as_bytes())]);
    let store = Store::open(":memory:").unwrap();
    let loader = Loader::new(&store, "omanreal_kml");

    let report = loader.load_file(&dir.join("map1.kml")).unwrap();
    assert_eq!(report.attempted, 3);
    assert_eq!(report.written, 2);
    assert_eq!(report.skipped, 1);

    let keys = store
        .observations()
        .unwrap()
        .into_iter()
        .map(|observation| observation.source_key.as_str().to_string())
        .collect::<Vec<_>>();
    assert_eq!(keys, vec!["map1.kml::0", "map1.kml::2"]);
}

#[test]
fn reloading_same_file_adds_nothing() {
    let (_guard, dir) = export_dir(&[("map1.kml", THREE_WITH_ONE_MALFORMED.as_bytes())]);
    let store = Store::open(":memory:").unwrap();
    let loader = Loader::new(&store, "omanreal_kml");

    loader.load_directory(&dir, &NullSink).unwrap();
    let before = store.observations().unwrap();
    let second = loader.load_directory(&dir, &NullSink).unwrap();
    let after = store.observations().unwrap();

    assert_eq!(second.written, 0);
    assert_eq!(second.duplicates, 2);
    assert_eq!(
        before.iter().map(|o| o.raw_id).collect::<Vec<_>>(),
        after.iter().map(|o| o.raw_id).collect::<Vec<_>>()
    );
}

#[test]
fn unparsable_file_does_not_stop_batch() {
    let (_guard, dir) = export_dir(&[
        ("a_broken.kml", b"<kml><Document><Placemark>".as_slice()),
        ("b_good.kml", THREE_WITH_ONE_MALFORMED.as_bytes()),
        ("notes.txt", b"ignored".as_slice()),
    ]);
    let store = Store::open(":memory:").unwrap();
    let report = Loader::new(&store, "omanreal_kml")
        .load_directory(&dir, &NullSink)
        .unwrap();

    assert_eq!(report.files.len(), 2);
    assert_eq!(report.files_skipped, 1);
    assert_eq!(report.files[0].file, "a_broken.kml");
    assert!(report.files[0].error.is_some());
    assert_eq!(report.files[0].attempted, 0);
    assert_eq!(report.files[1].written, 2);
    assert_eq!(report.written, 2);
}

#[test]
fn kmz_archives_are_loaded() {
    let mut archive = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut archive);
        writer
            .start_file("doc.kml", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer
            .write_all(THREE_WITH_ONE_MALFORMED.as_bytes())
            .unwrap();
        writer.finish().unwrap();
    }
    let (_guard, dir) = export_dir(&[("map2.kmz", archive.get_ref().as_slice())]);
    let store = Store::open(":memory:").unwrap();
    let report = Loader::new(&store, "omanreal_kml")
        .load_directory(&dir, &NullSink)
        .unwrap();
    assert_eq!(report.written, 2);
    assert_eq!(
        store.observations().unwrap()[0].source_key.as_str(),
        "map2.kmz::0"
    );
}

#[test]
fn placemark_without_geometry_is_stored() {
    let kml = r#"<kml><Placemark><name>Unmapped</name></Placemark></kml>"#;
    let (_guard, dir) = export_dir(&[("map3.kml", kml.as_bytes())]);
    let store = Store::open(":memory:").unwrap();
    let report = Loader::new(&store, "omanreal_kml")
        .load_file(&dir.join("map3.kml"))
        .unwrap();
    assert_eq!(report.written, 1);
    let observation = &store.observations().unwrap()[0];
    assert!(observation.geometry.is_none());
    assert!(observation.footprint.is_none());
}
