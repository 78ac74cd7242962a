use std::fs;
use std::io::{self, Cursor, Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};
use zip::ZipArchive;

use crate::error::ParcelError;

/// One URL per line; surrounding whitespace and blank lines are ignored.
pub fn read_url_list(path: &Utf8Path) -> Result<Vec<String>, ParcelError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| ParcelError::Filesystem(format!("read url list {path}: {err}")))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Filesystem-safe stem derived from a page URL.
pub fn sanitize_url_name(url: &str) -> String {
    let without_scheme = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    without_scheme
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | '?' | '&' | '=' | '#' | ':' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .collect()
}

/// Longest sanitized URL prefix kept in a file stem, in bytes.
pub const MAX_STEM_BYTES: usize = 150;

/// Deterministic file stem for a page URL: the sanitized URL, cut to
/// [`MAX_STEM_BYTES`], followed by the first 8 hex digits of the SHA-256 of
/// the full URL. URLs that sanitize to the same text still get distinct stems.
pub fn url_file_stem(url: &str) -> String {
    let mut stem = sanitize_url_name(url);
    if stem.len() > MAX_STEM_BYTES {
        let mut cut = MAX_STEM_BYTES;
        while !stem.is_char_boundary(cut) {
            cut -= 1;
        }
        stem.truncate(cut);
    }
    let digest = hex::encode(Sha256::digest(url.as_bytes()));
    format!("{stem}-{}", &digest[..8])
}

/// Keeps only the final path component of a server-suggested file name.
pub fn sanitize_suggested_name(name: &str) -> Option<String> {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim()
        .trim_matches('"');
    if base.is_empty() || base == "." || base == ".." {
        return None;
    }
    Some(sanitize_url_name(base))
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), ParcelError> {
    let parent = path
        .parent()
        .ok_or_else(|| ParcelError::Filesystem("invalid destination path".to_string()))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| ParcelError::Filesystem(err.to_string()))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".parcelcode-download")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| ParcelError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| ParcelError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| ParcelError::Filesystem(err.to_string()))?;
    Ok(())
}

/// `*.kml` and `*.kmz` files directly inside `dir`, sorted by name.
pub fn list_export_files(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, ParcelError> {
    let entries = fs::read_dir(dir.as_std_path())
        .map_err(|err| ParcelError::Filesystem(format!("read export dir {dir}: {err}")))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| ParcelError::Filesystem(err.to_string()))?;
        let path = Utf8PathBuf::from_path_buf(entry.path())
            .map_err(|_| ParcelError::Filesystem("non-utf8 file path in export dir".to_string()))?;
        let is_export = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("kml") || ext.eq_ignore_ascii_case("kmz"))
            .unwrap_or(false);
        if is_export && path.as_std_path().is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Raw KML bytes of an export file, unpacking `.kmz` archives.
pub fn read_export(path: &Utf8Path) -> Result<Vec<u8>, ParcelError> {
    let bytes = fs::read(path.as_std_path())
        .map_err(|err| ParcelError::Filesystem(format!("read {path}: {err}")))?;
    let is_kmz = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("kmz"))
        .unwrap_or(false);
    if is_kmz {
        return extract_kml_from_kmz(&bytes);
    }
    Ok(bytes)
}

fn extract_kml_from_kmz(bytes: &[u8]) -> Result<Vec<u8>, ParcelError> {
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|err| ParcelError::Archive(err.to_string()))?;

    let mut chosen = None;
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|err| ParcelError::Archive(err.to_string()))?;
        let name = entry.name().to_ascii_lowercase();
        if entry.is_dir() || !name.ends_with(".kml") {
            continue;
        }
        if name == "doc.kml" {
            chosen = Some(i);
            break;
        }
        if chosen.is_none() {
            chosen = Some(i);
        }
    }

    let index =
        chosen.ok_or_else(|| ParcelError::Archive("no .kml entry in archive".to_string()))?;
    let mut entry = archive
        .by_index(index)
        .map_err(|err| ParcelError::Archive(err.to_string()))?;
    let mut content = Vec::new();
    entry
        .read_to_end(&mut content)
        .map_err(|err| ParcelError::Archive(err.to_string()))?;
    Ok(content)
}

pub fn validate_writable_dir(dir: &Utf8Path) -> io::Result<()> {
    fs::create_dir_all(dir.as_std_path())?;
    let check = tempfile::Builder::new()
        .prefix(".parcelcode-check")
        .tempfile_in(dir.as_std_path())?;
    drop(check);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_name_strips_scheme_and_delimiters() {
        assert_eq!(
            sanitize_url_name("https://maps.example/view?id=7&layer=2"),
            "maps.example_view_id_7_layer_2"
        );
    }

    #[test]
    fn url_stem_carries_hash_of_full_url() {
        assert_eq!(
            url_file_stem("https://maps.example/view?id=7&layer=2"),
            "maps.example_view_id_7_layer_2-7769defd"
        );
        assert_ne!(
            url_file_stem("https://m.example/a?b"),
            url_file_stem("https://m.example/a/b")
        );
    }

    #[test]
    fn url_stem_is_capped() {
        let url = format!("https://m.example/view?layer={}", "\u{e9}".repeat(300));
        let stem = url_file_stem(&url);
        assert!(stem.len() <= MAX_STEM_BYTES + 9);
        assert_eq!(stem, url_file_stem(&url));
    }

    #[test]
    fn suggested_name_cannot_escape_directory() {
        assert_eq!(
            sanitize_suggested_name("../../etc/passwd").as_deref(),
            Some("passwd")
        );
        assert_eq!(sanitize_suggested_name(".."), None);
    }

    #[test]
    fn kmz_prefers_doc_kml() {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("layers/other.kml", options).unwrap();
            writer.write_all(b"<kml>other</kml>").unwrap();
            writer.start_file("doc.kml", options).unwrap();
            writer.write_all(b"<kml>doc</kml>").unwrap();
            writer.finish().unwrap();
        }
        let content = extract_kml_from_kmz(buffer.get_ref()).unwrap();
        assert_eq!(content, b"<kml>doc</kml>");
    }
}
