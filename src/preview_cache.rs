//! Binary preview cache.
//!
//! Stores every card's cropped and uncropped preview so a reopened project
//! shows thumbnails before any preview work has run.
//!
//! ## Format
//!
//! All integers little-endian:
//!
//! ```text
//! u64 version
//! u64 count
//! count x {
//!     u64 name_len,      name bytes (UTF-8 card name)
//!     u64 cropped_len,   JPEG bytes
//!     u64 uncropped_len, JPEG bytes
//!     u8  bad_aspect_ratio
//!     u8  bad_rotation
//! }
//! ```
//!
//! A file with another version, or one that fails to decode anywhere, is
//! deleted and read as empty. Previews are then simply regenerated.

use crate::imaging::{BackendError, EncodeFormat, Image, Quality};
use crate::work::ImagePreview;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

pub const PREVIEW_CACHE_VERSION: u64 = 1;

/// Previews are small and only shown on screen.
const PREVIEW_QUALITY: u32 = 50;

pub type Previews = BTreeMap<PathBuf, ImagePreview>;

#[derive(Error, Debug)]
pub enum PreviewCacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image error: {0}")]
    Image(#[from] BackendError),
    #[error("preview cache version {found}, expected {PREVIEW_CACHE_VERSION}")]
    Version { found: u64 },
    #[error("preview cache is truncated")]
    Truncated,
    #[error("card name is not valid UTF-8")]
    InvalidName,
}

/// Read the cache at `path`. Missing files read as empty; unreadable or
/// outdated ones are removed first.
pub fn read_previews(path: &Path) -> Previews {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(_) => return Previews::new(),
    };
    match decode(&bytes) {
        Ok(previews) => {
            debug!(path = %path.display(), count = previews.len(), "loaded preview cache");
            previews
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "discarding preview cache");
            if let Err(e) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "could not remove preview cache");
            }
            Previews::new()
        }
    }
}

/// Write `previews` to `path`, creating the parent directory.
pub fn write_previews(path: &Path, previews: &Previews) -> Result<(), PreviewCacheError> {
    let bytes = encode(previews)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes)?;
    debug!(path = %path.display(), count = previews.len(), "wrote preview cache");
    Ok(())
}

fn encode(previews: &Previews) -> Result<Vec<u8>, PreviewCacheError> {
    let format = EncodeFormat::Jpeg(Quality::new(PREVIEW_QUALITY));
    let mut out = Vec::new();
    out.extend_from_slice(&PREVIEW_CACHE_VERSION.to_le_bytes());
    out.extend_from_slice(&(previews.len() as u64).to_le_bytes());
    for (name, preview) in previews {
        let name = name.to_str().ok_or(PreviewCacheError::InvalidName)?;
        write_chunk(&mut out, name.as_bytes());
        write_chunk(&mut out, &preview.cropped.encode(format)?);
        write_chunk(&mut out, &preview.uncropped.encode(format)?);
        out.push(u8::from(preview.bad_aspect_ratio));
        out.push(u8::from(preview.bad_rotation));
    }
    Ok(out)
}

fn write_chunk(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn decode(bytes: &[u8]) -> Result<Previews, PreviewCacheError> {
    let mut reader = Reader { bytes };
    let version = reader.u64()?;
    if version != PREVIEW_CACHE_VERSION {
        return Err(PreviewCacheError::Version { found: version });
    }
    let count = reader.u64()?;
    let mut previews = Previews::new();
    for _ in 0..count {
        let name = std::str::from_utf8(reader.chunk()?)
            .map_err(|_| PreviewCacheError::InvalidName)?
            .to_string();
        let cropped = Image::decode(reader.chunk()?)?;
        let uncropped = Image::decode(reader.chunk()?)?;
        let bad_aspect_ratio = reader.u8()? != 0;
        let bad_rotation = reader.u8()? != 0;
        previews.insert(
            PathBuf::from(name),
            ImagePreview {
                cropped,
                uncropped,
                bad_aspect_ratio,
                bad_rotation,
            },
        );
    }
    Ok(previews)
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], PreviewCacheError> {
        if self.bytes.len() < len {
            return Err(PreviewCacheError::Truncated);
        }
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        Ok(head)
    }

    fn u64(&mut self) -> Result<u64, PreviewCacheError> {
        let raw = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        Ok(u64::from_le_bytes(buf))
    }

    fn u8(&mut self) -> Result<u8, PreviewCacheError> {
        Ok(self.take(1)?[0])
    }

    fn chunk(&mut self) -> Result<&'a [u8], PreviewCacheError> {
        let len = usize::try_from(self.u64()?).map_err(|_| PreviewCacheError::Truncated)?;
        self.take(len)
    }
}
