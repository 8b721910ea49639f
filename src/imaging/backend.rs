//! Image I/O backend trait and shared error type.
//!
//! The [`ImageBackend`] trait covers the two operations that touch the
//! filesystem: decoding a source into an [`Image`] and encoding an
//! [`Image`] to a destination path. Pixel transforms are plain methods on
//! [`Image`] and need no backend.
//!
//! The production implementation is
//! [`RustBackend`](super::rust_backend::RustBackend). Tests use the
//! [`MockBackend`](tests::MockBackend) below, which serves images from
//! memory and can be told to fail a number of reads to exercise the retry
//! path of the work items.

use super::params::Quality;
use super::raster::Image;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image codec error: {0}")]
    Codec(#[from] image::ImageError),
    #[error("Processing failed: {0}")]
    ProcessingFailed(String),
}

/// Trait for image I/O backends.
///
/// Implementations must be `Send + Sync`: one backend instance is shared by
/// every worker thread.
pub trait ImageBackend: Send + Sync {
    /// Decode the image at `path`.
    fn read(&self, path: &Path) -> Result<Image, BackendError>;

    /// Encode `image` to `path`, creating parent directories. The format
    /// follows the extension; `quality` applies to lossy formats.
    fn write(&self, image: &Image, path: &Path, quality: Quality) -> Result<(), BackendError>;
}
