//! On-disk metadata records that answer "what is this item" without a
//! full decrypt.
//!
//! Each record is one line in its own file, named after the MD5 of the
//! media file's path:
//!
//! ```text
//! oxmeta1 \t mime \t width \t height \t duration_ms \t path
//! ```
//!
//! Absent optional fields are empty. The path comes last so it may contain
//! tabs.

use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

use crate::error::MediaContext;
use crate::metrics::MetricsCollector;

const RECORD_TAG: &str = "oxmeta1";
const RECORD_EXTENSION: &str = "meta";

#[derive(Error, Debug)]
pub enum SidecarError {
    #[error("IO error for {context}: {source}")]
    Io {
        #[source]
        source: io::Error,
        context: MediaContext,
    },

    /// Sidecar records store paths as UTF-8.
    #[error("Path is not valid UTF-8: {}", .0.display())]
    UnsupportedPath(PathBuf),

    #[error("Field {field} contains a tab or newline")]
    InvalidField { field: &'static str },
}

impl SidecarError {
    fn io(source: io::Error, path: &Path, operation: &'static str) -> Self {
        SidecarError::Io {
            source,
            context: MediaContext::new().with_path(path).with_operation(operation),
        }
    }
}

/// 128-bit, non-cryptographic digest of a media path.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SidecarKey([u8; 16]);

impl SidecarKey {
    pub fn from_path(path: &Path) -> Self {
        Self(md5::compute(path.as_os_str().as_encoded_bytes()).0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// File name of the record for this key.
    pub fn file_name(&self) -> String {
        format!("{}.{RECORD_EXTENSION}", self.to_hex())
    }
}

impl fmt::Debug for SidecarKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SidecarKey({})", self.to_hex())
    }
}

impl fmt::Display for SidecarKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Derived metadata for one media file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidecarMetadataEntry {
    pub path: PathBuf,
    pub mime_type: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_ms: Option<u64>,
}

impl SidecarMetadataEntry {
    pub fn new(path: impl Into<PathBuf>, mime_type: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mime_type: mime_type.into(),
            width: None,
            height: None,
            duration_ms: None,
        }
    }

    #[must_use]
    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    fn encode(&self) -> Result<String, SidecarError> {
        let path = self
            .path
            .to_str()
            .ok_or_else(|| SidecarError::UnsupportedPath(self.path.clone()))?;
        if path.is_empty() || path.contains('\n') {
            return Err(SidecarError::InvalidField { field: "path" });
        }
        if self.mime_type.is_empty() || self.mime_type.contains(['\t', '\n']) {
            return Err(SidecarError::InvalidField { field: "mime_type" });
        }

        Ok(format!(
            "{RECORD_TAG}\t{}\t{}\t{}\t{}\t{path}\n",
            self.mime_type,
            format_opt(self.width),
            format_opt(self.height),
            format_opt(self.duration_ms),
        ))
    }

    /// Parse a stored record. Any deviation from the format yields `None`.
    fn decode(record: &str) -> Option<Self> {
        let record = record.strip_suffix('\n').unwrap_or(record);
        let mut fields = record.splitn(6, '\t');

        if fields.next()? != RECORD_TAG {
            return None;
        }
        let mime_type = fields.next()?;
        let width = parse_opt(fields.next()?)?;
        let height = parse_opt(fields.next()?)?;
        let duration_ms = parse_opt(fields.next()?)?;
        let path = fields.next()?;

        if mime_type.is_empty() || path.is_empty() || path.contains('\n') {
            return None;
        }

        Some(Self {
            path: PathBuf::from(path),
            mime_type: mime_type.to_string(),
            width,
            height,
            duration_ms,
        })
    }
}

fn format_opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Empty means absent; anything else must parse. The outer `Option` is
/// `None` on a parse failure.
fn parse_opt<T: std::str::FromStr>(field: &str) -> Option<Option<T>> {
    if field.is_empty() {
        Some(None)
    } else {
        field.parse().ok().map(Some)
    }
}

/// Directory of metadata records keyed by [`SidecarKey`].
///
/// Reads never fail: a missing, unreadable or malformed record is reported
/// as `None`, and callers recompute and write it back. Writes replace any
/// existing record atomically.
#[derive(Debug)]
pub struct MetadataSidecarCache {
    dir: PathBuf,
    metrics: Arc<MetricsCollector>,
}

impl MetadataSidecarCache {
    /// Open (creating if needed) the sidecar directory.
    pub fn new(
        dir: impl Into<PathBuf>,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self, SidecarError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| SidecarError::io(e, &dir, "create_dir"))?;
        Ok(Self { dir, metrics })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn key_for(&self, path: &Path) -> SidecarKey {
        SidecarKey::from_path(path)
    }

    /// Location of the record for `key`.
    pub fn record_path(&self, key: &SidecarKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    /// Load the record for `key`, if one exists and parses.
    #[instrument(level = "trace", skip(self), fields(key = %key))]
    pub fn read(&self, key: &SidecarKey) -> Option<SidecarMetadataEntry> {
        self.metrics.record_sidecar_read();
        let record_path = self.record_path(key);

        let record = match std::fs::read_to_string(&record_path) {
            Ok(record) => record,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!("No sidecar record");
                return None;
            }
            Err(e) => {
                warn!(path = %record_path.display(), error = %e, "Unreadable sidecar record");
                return None;
            }
        };

        let entry = SidecarMetadataEntry::decode(&record);
        if entry.is_none() {
            debug!(path = %record_path.display(), "Malformed sidecar record");
        }
        entry
    }

    /// Record for the media file at `path`.
    ///
    /// Also checks that the stored path matches, so a digest collision reads
    /// as a miss.
    pub fn lookup(&self, path: &Path) -> Option<SidecarMetadataEntry> {
        self.read(&self.key_for(path))
            .filter(|entry| entry.path == path)
    }

    /// Store `entry`, replacing any existing record for its path.
    #[instrument(level = "debug", skip(self, entry), fields(path = %entry.path.display()))]
    pub fn write(&self, entry: &SidecarMetadataEntry) -> Result<SidecarKey, SidecarError> {
        let key = self.key_for(&entry.path);
        let record = entry.encode()?;
        let record_path = self.record_path(&key);
        let io_err = |e: io::Error| SidecarError::io(e, &record_path, "write_sidecar");

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        tmp.write_all(record.as_bytes()).map_err(io_err)?;
        tmp.persist(&record_path).map_err(|e| io_err(e.error))?;

        self.metrics.record_sidecar_write();
        debug!(%key, "Wrote sidecar record");
        Ok(key)
    }

    /// Delete the record for `key`. Returns whether one existed.
    pub fn remove(&self, key: &SidecarKey) -> Result<bool, SidecarError> {
        let record_path = self.record_path(key);
        match std::fs::remove_file(&record_path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SidecarError::io(e, &record_path, "remove_sidecar")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> (tempfile::TempDir, MetadataSidecarCache) {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(MetricsCollector::new());
        let cache = MetadataSidecarCache::new(dir.path().join("sidecars"), metrics).unwrap();
        (dir, cache)
    }

    #[test]
    fn test_roundtrip() {
        let (_dir, cache) = cache();
        let entry = SidecarMetadataEntry::new("/vault/clip.bin", "video/mp4")
            .with_dimensions(1920, 1080)
            .with_duration_ms(12_345);

        let key = cache.write(&entry).unwrap();
        assert_eq!(key, cache.key_for(&entry.path));
        assert_eq!(cache.read(&key), Some(entry.clone()));
        assert_eq!(cache.lookup(Path::new("/vault/clip.bin")), Some(entry));
    }

    #[test]
    fn test_optional_fields_absent() {
        let (_dir, cache) = cache();
        let entry = SidecarMetadataEntry::new("/vault/photo.bin", "image/jpeg");
        let key = cache.write(&entry).unwrap();
        assert_eq!(cache.read(&key), Some(entry));
    }

    #[test]
    fn test_never_written_reads_none() {
        let (_dir, cache) = cache();
        assert_eq!(cache.read(&cache.key_for(Path::new("/nothing"))), None);
    }

    #[test]
    fn test_malformed_record_reads_none() {
        let (_dir, cache) = cache();
        let key = cache.key_for(Path::new("/vault/x.bin"));
        for garbage in [
            "",
            "not a record",
            "oxmeta1\timage/png\tabc\t\t\t/vault/x.bin\n",
            "oxmeta1\timage/png\t1\t2\n",
            "oxmeta2\timage/png\t1\t2\t3\t/vault/x.bin\n",
        ] {
            std::fs::write(cache.record_path(&key), garbage).unwrap();
            assert_eq!(cache.read(&key), None, "record {garbage:?}");
        }

        std::fs::write(cache.record_path(&key), [0xFF, 0xFE, 0x00]).unwrap();
        assert_eq!(cache.read(&key), None);
    }

    #[test]
    fn test_write_overwrites() {
        let (_dir, cache) = cache();
        let first = SidecarMetadataEntry::new("/vault/a.bin", "image/png").with_dimensions(1, 1);
        let second = SidecarMetadataEntry::new("/vault/a.bin", "image/png").with_dimensions(2, 2);
        cache.write(&first).unwrap();
        let key = cache.write(&second).unwrap();
        assert_eq!(cache.read(&key), Some(second));
    }

    #[test]
    fn test_path_with_tab_roundtrips() {
        let (_dir, cache) = cache();
        let entry = SidecarMetadataEntry::new("/vault/odd\tname.bin", "image/gif");
        let key = cache.write(&entry).unwrap();
        assert_eq!(cache.read(&key), Some(entry));
    }

    #[test]
    fn test_invalid_mime_rejected() {
        let (_dir, cache) = cache();
        let entry = SidecarMetadataEntry::new("/vault/a.bin", "image/png\tx");
        assert!(matches!(
            cache.write(&entry),
            Err(SidecarError::InvalidField { field: "mime_type" })
        ));
    }

    #[test]
    fn test_empty_fields_rejected() {
        let (_dir, cache) = cache();
        assert!(matches!(
            cache.write(&SidecarMetadataEntry::new("/vault/a.jpg", "")),
            Err(SidecarError::InvalidField { field: "mime_type" })
        ));
        assert!(matches!(
            cache.write(&SidecarMetadataEntry::new("", "image/jpeg")),
            Err(SidecarError::InvalidField { field: "path" })
        ));
        assert_eq!(cache.read(&cache.key_for(Path::new("/vault/a.jpg"))), None);
        assert_eq!(cache.metrics.snapshot().sidecar_writes, 0);
    }

    #[test]
    fn test_remove_and_metrics() {
        let (_dir, cache) = cache();
        let key = cache
            .write(&SidecarMetadataEntry::new("/vault/a.bin", "image/png"))
            .unwrap();
        assert!(cache.remove(&key).unwrap());
        assert!(!cache.remove(&key).unwrap());
        assert_eq!(cache.read(&key), None);

        let snap = cache.metrics.snapshot();
        assert_eq!(snap.sidecar_writes, 1);
        assert_eq!(snap.sidecar_reads, 1);
    }

    #[test]
    fn test_key_is_md5_of_path() {
        let key = SidecarKey::from_path(Path::new("abc"));
        assert_eq!(key.to_hex(), "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(key.file_name(), "900150983cd24fb0d6963f7d28e17f72.meta");
    }
}
