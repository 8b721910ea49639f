//! Content-hash database deciding whether an output needs regenerating.
//!
//! Cropping is the bottleneck of the pipeline: a single full-resolution card
//! scan can take a noticeable fraction of a second to decode, resample and
//! encode. This module lets the work items skip that when neither the
//! source image nor the parameters that shaped the output have changed since
//! the output was written.
//!
//! # Design
//!
//! ## Keys
//!
//! The database is keyed by **destination path**. Each entry records the
//! SHA-256 of the source file that produced it and the
//! [`ImageParameters`] used. Content-based rather than mtime-based so it
//! survives copies and checkouts that preserve bytes but not timestamps.
//!
//! An entry is evidence that the destination is up to date if and only if:
//! 1. the source file's current hash equals the stored hash, and
//! 2. the requested parameters equal the stored ones after quantization
//!    (micrometers and whole DPI), so float noise never invalidates.
//!
//! When the parameters say an output file will be written, a missing
//! destination always forces regeneration.
//!
//! ## Concurrency
//!
//! Worker threads call [`ImageDataBase::test_entry`] and
//! [`ImageDataBase::put_entry`] concurrently; the table sits behind a mutex.
//! The file is only written by the scheduler at checkpoints.
//!
//! ## Storage
//!
//! Pretty JSON at `<crop_dir>/.image.db`. Any read failure (missing file,
//! corrupt JSON, version mismatch) yields an empty database, which means
//! "regenerate everything".

use crate::imaging::{BadAspectRatioHandling, BleedType, Rotation, UncropMode};
use crate::units::{Length, Size};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Name of the database file within the crop directory.
pub const DB_FILENAME: &str = ".image.db";

/// Version of the database format. Bump this to invalidate all existing
/// databases when the format or the parameter set changes.
const DB_VERSION: u32 = 2;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Everything that shapes an output besides the source bytes.
#[derive(Debug, Clone, Copy)]
pub struct ImageParameters {
    /// Target density ceiling.
    pub dpi: f32,
    /// Target pixel width (previews only).
    pub width: u32,
    pub card_size: Size,
    pub full_bleed_edge: Length,
    pub rotation: Rotation,
    pub bleed_type: BleedType,
    pub bad_aspect_ratio: BadAspectRatioHandling,
    /// Bleed synthesis for precropped sources.
    pub uncrop: UncropMode,
    /// Whether the work persists an output file at the destination.
    pub will_write_output: bool,
}

impl Default for ImageParameters {
    fn default() -> Self {
        Self {
            dpi: 0.0,
            width: 0,
            card_size: Size::default(),
            full_bleed_edge: Length::ZERO,
            rotation: Rotation::None,
            bleed_type: BleedType::Infer,
            bad_aspect_ratio: BadAspectRatioHandling::Ignore,
            uncrop: UncropMode::default(),
            will_write_output: true,
        }
    }
}

impl ImageParameters {
    /// Integer form used for comparison and storage.
    pub fn quantized(&self) -> StoredParameters {
        StoredParameters {
            dpi: self.dpi.floor() as i64,
            width: self.width,
            card_size: StoredSize {
                width: self.card_size.width.micrometers(),
                height: self.card_size.height.micrometers(),
            },
            full_bleed_edge: self.full_bleed_edge.micrometers(),
            rotation: self.rotation,
            bleed_type: self.bleed_type,
            bad_aspect_ratio: self.bad_aspect_ratio,
            uncrop: self.uncrop,
            will_write_output: self.will_write_output,
        }
    }
}

/// Equal when every quantized field that shapes the output matches.
/// `will_write_output` only decides whether a missing file forces work.
impl PartialEq for ImageParameters {
    fn eq(&self, other: &Self) -> bool {
        self.quantized().same_output(&other.quantized())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSize {
    pub width: i64,
    pub height: i64,
}

/// Persisted parameters: whole DPI, lengths in micrometers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredParameters {
    pub dpi: i64,
    pub width: u32,
    pub card_size: StoredSize,
    pub full_bleed_edge: i64,
    #[serde(default)]
    pub rotation: Rotation,
    #[serde(default)]
    pub bleed_type: BleedType,
    #[serde(default)]
    pub bad_aspect_ratio: BadAspectRatioHandling,
    #[serde(default)]
    pub uncrop: UncropMode,
    #[serde(default = "default_true")]
    pub will_write_output: bool,
}

fn default_true() -> bool {
    true
}

impl StoredParameters {
    fn same_output(&self, other: &StoredParameters) -> bool {
        StoredParameters {
            will_write_output: other.will_write_output,
            ..*self
        } == *other
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDataBaseEntry {
    pub source_hash: String,
    pub params: StoredParameters,
}

#[derive(Serialize, Deserialize)]
struct DataBaseFile {
    version: u32,
    entries: BTreeMap<String, ImageDataBaseEntry>,
}

/// Thread-safe map from destination path to the entry that produced it.
#[derive(Debug, Default)]
pub struct ImageDataBase {
    entries: Mutex<HashMap<PathBuf, ImageDataBaseEntry>>,
}

impl ImageDataBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `path`. Never fails: anything unreadable yields an empty
    /// database.
    pub fn read(path: &Path) -> Self {
        match Self::try_read(path) {
            Ok(db) => {
                debug!(path = %path.display(), entries = db.len(), "loaded image database");
                db
            }
            Err(e) => {
                if path.exists() {
                    warn!(path = %path.display(), error = %e, "discarding image database");
                }
                Self::new()
            }
        }
    }

    fn try_read(path: &Path) -> Result<Self, DatabaseError> {
        let content = std::fs::read_to_string(path)?;
        let file: DataBaseFile = serde_json::from_str(&content)?;
        if file.version != DB_VERSION {
            return Err(DatabaseError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("version {} does not match {}", file.version, DB_VERSION),
            )));
        }
        let entries = file
            .entries
            .into_iter()
            .map(|(dest, entry)| (PathBuf::from(dest), entry))
            .collect();
        Ok(Self {
            entries: Mutex::new(entries),
        })
    }

    /// Serialize the full table to `path`, creating its parent directory.
    pub fn write(&self, path: &Path) -> Result<(), DatabaseError> {
        let file = {
            let entries = self.lock();
            DataBaseFile {
                version: DB_VERSION,
                entries: entries
                    .iter()
                    .map(|(dest, entry)| (dest.to_string_lossy().to_string(), entry.clone()))
                    .collect(),
            }
        };
        info!(path = %path.display(), entries = file.entries.len(), "writing image database");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn find_entry(&self, destination: &Path) -> bool {
        self.lock().contains_key(destination)
    }

    pub fn entry(&self, destination: &Path) -> Option<ImageDataBaseEntry> {
        self.lock().get(destination).cloned()
    }

    /// Hash `source` and compare against the entry for `destination`.
    ///
    /// Returns an empty string when the destination is up to date (skip the
    /// work), otherwise the source hash to hand to [`put_entry`](Self::put_entry)
    /// once the output is written. A missing source returns empty: there is
    /// nothing to produce.
    pub fn test_entry(
        &self,
        destination: &Path,
        source: &Path,
        params: &ImageParameters,
    ) -> Result<String, DatabaseError> {
        if !source.exists() {
            return Ok(String::new());
        }
        let current = hash_file(source)?;

        if params.will_write_output && !destination.exists() {
            return Ok(current);
        }

        let entries = self.lock();
        match entries.get(destination) {
            Some(entry)
                if entry.source_hash == current
                    && entry.params.same_output(&params.quantized()) =>
            {
                Ok(String::new())
            }
            _ => Ok(current),
        }
    }

    pub fn put_entry(&self, destination: &Path, source_hash: String, params: &ImageParameters) {
        self.lock().insert(
            destination.to_path_buf(),
            ImageDataBaseEntry {
                source_hash,
                params: params.quantized(),
            },
        );
    }

    /// Re-key the entry for `from` to `to`, e.g. after the output was renamed.
    pub fn move_entry(&self, from: &Path, to: &Path) {
        let mut entries = self.lock();
        if let Some(entry) = entries.remove(from) {
            entries.insert(to.to_path_buf(), entry);
        }
    }

    pub fn remove_entry(&self, destination: &Path) {
        self.lock().remove(destination);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, ImageDataBaseEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resolve the database path for a crop directory.
pub fn db_path(crop_dir: &Path) -> PathBuf {
    crop_dir.join(DB_FILENAME)
}

/// SHA-256 hash of a file's contents, returned as a hex string.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    let digest = Sha256::digest(&bytes);
    Ok(format!("{:x}", digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn params() -> ImageParameters {
        ImageParameters {
            dpi: 1200.0,
            card_size: Size::new(Length::inches(2.48), Length::inches(3.46)),
            full_bleed_edge: Length::inches(0.12),
            ..ImageParameters::default()
        }
    }

    /// Source and (optionally) destination files inside a temp dir.
    fn fixture(write_dest: bool) -> (TempDir, PathBuf, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("card.png");
        let dest = tmp.path().join("crop/card.png");
        fs::write(&source, b"source bytes").unwrap();
        if write_dest {
            fs::create_dir_all(dest.parent().unwrap()).unwrap();
            fs::write(&dest, b"output").unwrap();
        }
        (tmp, source, dest)
    }

    // =========================================================================
    // ImageParameters equality
    // =========================================================================

    #[test]
    fn float_noise_is_equal() {
        let a = ImageParameters {
            full_bleed_edge: Length::mm(3.0),
            ..params()
        };
        let b = ImageParameters {
            dpi: 1200.4,
            full_bleed_edge: Length::mm(3.0004),
            ..a
        };
        assert_eq!(a, b);
    }

    #[test]
    fn rotation_and_overrides_are_not_equal() {
        let a = params();
        assert_ne!(
            a,
            ImageParameters {
                rotation: Rotation::Rotate90,
                ..a
            }
        );
        assert_ne!(
            a,
            ImageParameters {
                bleed_type: BleedType::NoBleed,
                ..a
            }
        );
        assert_ne!(
            a,
            ImageParameters {
                bad_aspect_ratio: BadAspectRatioHandling::Stretch,
                ..a
            }
        );
    }

    #[test]
    fn uncrop_toggle_invalidates() {
        let (_tmp, source, dest) = fixture(true);
        let db = ImageDataBase::new();
        let hash = db.test_entry(&dest, &source, &params()).unwrap();
        db.put_entry(&dest, hash, &params());

        for uncrop in [UncropMode::Off, UncropMode::Black] {
            let toggled = ImageParameters { uncrop, ..params() };
            assert!(!db.test_entry(&dest, &source, &toggled).unwrap().is_empty());
        }
        assert!(db.test_entry(&dest, &source, &params()).unwrap().is_empty());
    }

    #[test]
    fn will_write_output_does_not_affect_equality() {
        let a = params();
        assert_eq!(
            a,
            ImageParameters {
                will_write_output: false,
                ..a
            }
        );
    }

    // =========================================================================
    // test_entry / put_entry
    // =========================================================================

    #[test]
    fn unknown_destination_needs_work() {
        let (_tmp, source, dest) = fixture(true);
        let db = ImageDataBase::new();
        let hash = db.test_entry(&dest, &source, &params()).unwrap();
        assert_eq!(hash, hash_file(&source).unwrap());
    }

    #[test]
    fn second_run_is_skipped() {
        let (_tmp, source, dest) = fixture(true);
        let db = ImageDataBase::new();
        let hash = db.test_entry(&dest, &source, &params()).unwrap();
        db.put_entry(&dest, hash, &params());

        assert!(db.find_entry(&dest));
        assert!(db.test_entry(&dest, &source, &params()).unwrap().is_empty());
    }

    #[test]
    fn source_change_invalidates() {
        let (_tmp, source, dest) = fixture(true);
        let db = ImageDataBase::new();
        let hash = db.test_entry(&dest, &source, &params()).unwrap();
        db.put_entry(&dest, hash, &params());

        fs::write(&source, b"edited source bytes").unwrap();
        assert!(!db.test_entry(&dest, &source, &params()).unwrap().is_empty());
    }

    #[test]
    fn parameter_change_invalidates() {
        let (_tmp, source, dest) = fixture(true);
        let db = ImageDataBase::new();
        let hash = db.test_entry(&dest, &source, &params()).unwrap();
        db.put_entry(&dest, hash, &params());

        let bigger = ImageParameters {
            card_size: Size::new(Length::inches(2.5), Length::inches(3.5)),
            ..params()
        };
        assert!(!db.test_entry(&dest, &source, &bigger).unwrap().is_empty());
        let denser = ImageParameters {
            dpi: 600.0,
            ..params()
        };
        assert!(!db.test_entry(&dest, &source, &denser).unwrap().is_empty());
    }

    #[test]
    fn missing_destination_forces_work() {
        let (_tmp, source, dest) = fixture(true);
        let db = ImageDataBase::new();
        let hash = db.test_entry(&dest, &source, &params()).unwrap();
        db.put_entry(&dest, hash, &params());

        fs::remove_file(&dest).unwrap();
        assert!(!db.test_entry(&dest, &source, &params()).unwrap().is_empty());
    }

    #[test]
    fn missing_destination_ok_without_output() {
        let (_tmp, source, dest) = fixture(false);
        let preview = ImageParameters {
            will_write_output: false,
            ..params()
        };
        let db = ImageDataBase::new();
        let hash = db.test_entry(&dest, &source, &preview).unwrap();
        db.put_entry(&dest, hash, &preview);
        assert!(db.test_entry(&dest, &source, &preview).unwrap().is_empty());
    }

    #[test]
    fn missing_source_returns_empty() {
        let tmp = TempDir::new().unwrap();
        let db = ImageDataBase::new();
        let hash = db
            .test_entry(
                &tmp.path().join("out.png"),
                &tmp.path().join("gone.png"),
                &params(),
            )
            .unwrap();
        assert!(hash.is_empty());
    }

    // =========================================================================
    // Read / Write
    // =========================================================================

    #[test]
    fn write_and_read_roundtrip() {
        let (tmp, source, dest) = fixture(true);
        let db = ImageDataBase::new();
        let hash = db.test_entry(&dest, &source, &params()).unwrap();
        db.put_entry(&dest, hash.clone(), &params());

        let path = db_path(&tmp.path().join("crop"));
        db.write(&path).unwrap();
        let loaded = ImageDataBase::read(&path);

        assert_eq!(loaded.len(), 1);
        let entry = loaded.entry(&dest).unwrap();
        assert_eq!(entry.source_hash, hash);
        assert!((62991..=62992).contains(&entry.params.card_size.width));
        assert!(loaded.test_entry(&dest, &source, &params()).unwrap().is_empty());
    }

    #[test]
    fn read_missing_file_returns_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(ImageDataBase::read(&db_path(tmp.path())).is_empty());
    }

    #[test]
    fn read_corrupt_json_returns_empty() {
        let tmp = TempDir::new().unwrap();
        fs::write(db_path(tmp.path()), "not json").unwrap();
        assert!(ImageDataBase::read(&db_path(tmp.path())).is_empty());
    }

    #[test]
    fn read_wrong_version_returns_empty() {
        let tmp = TempDir::new().unwrap();
        let json = format!(
            r#"{{"version": {}, "entries": {{"a.png": {{"source_hash":"h","params":{{"dpi":1,"width":0,"card_size":{{"width":1,"height":1}},"full_bleed_edge":0}}}}}}}}"#,
            DB_VERSION + 1
        );
        fs::write(db_path(tmp.path()), json).unwrap();
        assert!(ImageDataBase::read(&db_path(tmp.path())).is_empty());
    }

    #[test]
    fn move_entry_rekeys() {
        let db = ImageDataBase::new();
        db.put_entry(Path::new("crop/a.png"), "h".into(), &params());
        db.move_entry(Path::new("crop/a.png"), Path::new("crop/b.png"));
        assert!(!db.find_entry(Path::new("crop/a.png")));
        assert_eq!(db.entry(Path::new("crop/b.png")).unwrap().source_hash, "h");

        // Moving a missing key is a no-op
        db.move_entry(Path::new("crop/x.png"), Path::new("crop/y.png"));
        assert_eq!(db.len(), 1);

        db.remove_entry(Path::new("crop/b.png"));
        assert!(db.is_empty());
    }

    // =========================================================================
    // Hash functions
    // =========================================================================

    #[test]
    fn hash_file_deterministic() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.bin");
        fs::write(&path, b"hello").unwrap();
        assert_eq!(hash_file(&path).unwrap(), hash_file(&path).unwrap());
        assert_eq!(hash_file(&path).unwrap().len(), 64);
    }
}
