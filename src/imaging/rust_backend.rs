//! Pure Rust image I/O backend built on the `image` crate.
//!
//! ## Crate mapping
//!
//! | Operation | Crate / function |
//! |---|---|
//! | Decode (BMP, GIF, JPEG, PNG) | `image::ImageReader` with format sniffing |
//! | Encode JPEG | `image::codecs::jpeg::JpegEncoder` (quality from caller) |
//! | Encode other formats | `DynamicImage::save_with_format`, format from extension |

use super::backend::{BackendError, ImageBackend};
use super::params::Quality;
use super::raster::Image;
use image::{DynamicImage, ImageFormat, ImageReader};
use std::path::Path;
use std::sync::LazyLock;

/// Card source extensions, paired with the decoder that handles them.
const CARD_CANDIDATES: &[(&str, ImageFormat)] = &[
    ("bmp", ImageFormat::Bmp),
    ("gif", ImageFormat::Gif),
    ("jpg", ImageFormat::Jpeg),
    ("jpeg", ImageFormat::Jpeg),
    ("png", ImageFormat::Png),
];

static SUPPORTED_EXTENSIONS: LazyLock<Vec<&'static str>> = LazyLock::new(|| {
    CARD_CANDIDATES
        .iter()
        .filter(|(_, fmt)| fmt.reading_enabled())
        .map(|(ext, _)| *ext)
        .collect()
});

/// Returns the set of card image extensions that have working decoders compiled in.
pub fn supported_input_extensions() -> &'static [&'static str] {
    &SUPPORTED_EXTENSIONS
}

/// Whether `path` has a supported card image extension (case-insensitive).
pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .is_some_and(|e| supported_input_extensions().contains(&e.as_str()))
}

/// Pure Rust backend using the `image` crate ecosystem.
///
/// See the [module docs](self) for the crate-to-operation mapping.
pub struct RustBackend;

impl RustBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RustBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBackend for RustBackend {
    fn read(&self, path: &Path) -> Result<Image, BackendError> {
        let decoded = ImageReader::open(path)?
            .with_guessed_format()?
            .decode()
            .map_err(|e| {
                BackendError::ProcessingFailed(format!("Failed to decode {}: {}", path.display(), e))
            })?;
        Ok(Image::from(decoded))
    }

    fn write(&self, image: &Image, path: &Path, quality: Quality) -> Result<(), BackendError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let format = ImageFormat::from_path(path).map_err(|_| {
            BackendError::ProcessingFailed(format!(
                "Unsupported output format: {}",
                path.display()
            ))
        })?;

        match format {
            ImageFormat::Jpeg => {
                let file = std::fs::File::create(path)?;
                let writer = std::io::BufWriter::new(file);
                let encoder =
                    image::codecs::jpeg::JpegEncoder::new_with_quality(writer, quality.value() as u8);
                DynamicImage::ImageRgb8(image.as_dynamic().to_rgb8())
                    .write_with_encoder(encoder)
                    .map_err(|e| {
                        BackendError::ProcessingFailed(format!("JPEG encode failed: {}", e))
                    })
            }
            other if other.writing_enabled() => {
                image.as_dynamic().save_with_format(path, other)?;
                Ok(())
            }
            other => Err(BackendError::ProcessingFailed(format!(
                "No encoder compiled in for {:?}",
                other
            ))),
        }
    }
}
