//! In-memory raster image and the pixel operations the pipeline needs.
//!
//! [`Image`] wraps an `image::DynamicImage` and exposes a small, value-style
//! API: every operation returns a new image. Decoding from and writing to
//! disk go through an [`ImageBackend`](super::ImageBackend); in-memory
//! encode/decode (used by the preview cache) live here.
//!
//! | Operation | Implementation |
//! |---|---|
//! | Rotate | `rotate90` / `rotate180` / `rotate270` |
//! | Crop | `crop_imm`, per-side pixel amounts |
//! | Resize | `resize_exact`, Lanczos3 |
//! | Add border | per-pixel reflect (`cba\|abc`) or opaque black fill |
//! | Color cube | trilinear 3D LUT lookup, alpha preserved |
//! | Hash | 64-bit average hash over an 8×8 grayscale thumbnail |

use super::backend::BackendError;
use super::color_cube::ColorCube;
use super::params::{BorderMode, Quality, Rotation};
use crate::units::Size;
use image::imageops::FilterType;
use image::{DynamicImage, ImageBuffer, ImageFormat, Pixel, Rgb, RgbImage, Rgba};
use std::fmt;
use std::io::Cursor;

/// Density reported for a degenerate physical size.
const FALLBACK_DPI: f32 = 96.0;

/// Pixel amounts per side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Border {
    pub top: u32,
    pub bottom: u32,
    pub left: u32,
    pub right: u32,
}

impl Border {
    pub fn uniform(px: u32) -> Self {
        Self {
            top: px,
            bottom: px,
            left: px,
            right: px,
        }
    }
}

/// In-memory encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeFormat {
    Jpeg(Quality),
    Png,
}

#[derive(Clone)]
pub struct Image {
    inner: DynamicImage,
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (w, h) = self.size();
        f.debug_struct("Image")
            .field("width", &w)
            .field("height", &h)
            .field("color", &self.inner.color())
            .finish()
    }
}

impl From<DynamicImage> for Image {
    fn from(inner: DynamicImage) -> Self {
        Self { inner }
    }
}

impl From<RgbImage> for Image {
    fn from(buffer: RgbImage) -> Self {
        Self {
            inner: DynamicImage::ImageRgb8(buffer),
        }
    }
}

impl Image {
    pub fn as_dynamic(&self) -> &DynamicImage {
        &self.inner
    }

    pub fn width(&self) -> u32 {
        self.inner.width()
    }

    pub fn height(&self) -> u32 {
        self.inner.height()
    }

    pub fn size(&self) -> (u32, u32) {
        (self.inner.width(), self.inner.height())
    }

    /// Width over height; zero for an empty image.
    pub fn aspect_ratio(&self) -> f32 {
        let (w, h) = self.size();
        if h == 0 {
            return 0.0;
        }
        w as f32 / h as f32
    }

    pub fn rotate(&self, rotation: Rotation) -> Image {
        let inner = match rotation {
            Rotation::None => self.inner.clone(),
            Rotation::Rotate90 => self.inner.rotate90(),
            Rotation::Rotate180 => self.inner.rotate180(),
            Rotation::Rotate270 => self.inner.rotate270(),
        };
        Image { inner }
    }

    /// Remove `border` pixels from each side. Never produces an empty image.
    pub fn crop(&self, border: Border) -> Image {
        let (w, h) = self.size();
        let x = border.left.min(w.saturating_sub(1));
        let y = border.top.min(h.saturating_sub(1));
        let width = w.saturating_sub(border.left + border.right).max(1);
        let height = h.saturating_sub(border.top + border.bottom).max(1);
        Image {
            inner: self.inner.crop_imm(x, y, width, height),
        }
    }

    /// Resize to exact dimensions (aspect ratio is not preserved).
    pub fn resize(&self, width: u32, height: u32) -> Image {
        Image {
            inner: self
                .inner
                .resize_exact(width.max(1), height.max(1), FilterType::Lanczos3),
        }
    }

    /// Grow the image by `border` pixels per side.
    pub fn add_border(&self, border: Border, mode: BorderMode) -> Image {
        if border == Border::default() {
            return self.clone();
        }
        let inner = if self.inner.color().has_alpha() {
            DynamicImage::ImageRgba8(pad(
                &self.inner.to_rgba8(),
                border,
                Rgba([0, 0, 0, 255]),
                mode,
            ))
        } else {
            DynamicImage::ImageRgb8(pad(&self.inner.to_rgb8(), border, Rgb([0, 0, 0]), mode))
        };
        Image { inner }
    }

    /// Remap colors through a 3D lookup table. Grayscale images pass through.
    pub fn apply_color_cube(&self, cube: &ColorCube) -> Image {
        let color = self.inner.color();
        if color.channel_count() < 3 {
            return self.clone();
        }
        let inner = if color.has_alpha() {
            let mut buffer = self.inner.to_rgba8();
            for pixel in buffer.pixels_mut() {
                let [r, g, b] = cube.sample([pixel[0], pixel[1], pixel[2]]);
                *pixel = Rgba([r, g, b, pixel[3]]);
            }
            DynamicImage::ImageRgba8(buffer)
        } else {
            let mut buffer = self.inner.to_rgb8();
            for pixel in buffer.pixels_mut() {
                *pixel = Rgb(cube.sample(pixel.0));
            }
            DynamicImage::ImageRgb8(buffer)
        };
        Image { inner }
    }

    /// Pixels per inch if this image were printed at `physical` size,
    /// taking the tighter of the two axes.
    pub fn density(&self, physical: Size) -> f32 {
        let (w, h) = self.size();
        let bw = physical.width.as_inches();
        let bh = physical.height.as_inches();
        if !(bw > 0.0 && bh > 0.0) {
            return FALLBACK_DPI;
        }
        (w as f32 / bw).min(h as f32 / bh)
    }

    /// 64-bit average hash: bit `i` is set when thumbnail pixel `i` is
    /// brighter than the thumbnail mean. Visually similar images share most bits.
    pub fn hash(&self) -> u64 {
        let thumb = self
            .inner
            .resize_exact(8, 8, FilterType::Triangle)
            .to_luma8();
        let total: u32 = thumb.pixels().map(|p| p[0] as u32).sum();
        let mean = total / 64;
        thumb
            .pixels()
            .enumerate()
            .filter(|(_, p)| p[0] as u32 > mean)
            .fold(0u64, |acc, (i, _)| acc | (1 << i))
    }

    pub fn encode(&self, format: EncodeFormat) -> Result<Vec<u8>, BackendError> {
        let mut bytes = Vec::new();
        match format {
            EncodeFormat::Jpeg(quality) => {
                let rgb = self.inner.to_rgb8();
                let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(
                    &mut bytes,
                    quality.value() as u8,
                );
                DynamicImage::ImageRgb8(rgb).write_with_encoder(encoder)?;
            }
            EncodeFormat::Png => {
                self.inner
                    .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
            }
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Image, BackendError> {
        Ok(Image {
            inner: image::load_from_memory(bytes)?,
        })
    }
}

/// Map an out-of-range coordinate back into `0..n` by mirroring at the edges.
fn reflect(i: i64, n: u32) -> u32 {
    let n = n as i64;
    let m = i.rem_euclid(2 * n);
    (if m < n { m } else { 2 * n - 1 - m }) as u32
}

fn pad<P>(
    src: &ImageBuffer<P, Vec<u8>>,
    border: Border,
    fill: P,
    mode: BorderMode,
) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8>,
{
    let (w, h) = src.dimensions();
    let out_w = w + border.left + border.right;
    let out_h = h + border.top + border.bottom;
    ImageBuffer::from_fn(out_w, out_h, |x, y| {
        let sx = x as i64 - border.left as i64;
        let sy = y as i64 - border.top as i64;
        let inside = sx >= 0 && sy >= 0 && sx < w as i64 && sy < h as i64;
        if inside {
            *src.get_pixel(sx as u32, sy as u32)
        } else {
            match mode {
                BorderMode::Reflect => *src.get_pixel(reflect(sx, w), reflect(sy, h)),
                BorderMode::Black => fill,
            }
        }
    })
}
