//! High-level image operations.
//!
//! These functions combine calculations with pixel operations on
//! [`Image`]. They take card geometry, compute amounts, and log what they do
//! against the card name so a batch log reads card by card.

use super::calculations::{crop_amount, expand_padding, stretch_size, uncrop_amount};
use super::params::{BadAspectRatioHandling, BorderMode};
use super::raster::{Border, Image};
use crate::units::{Length, Size};
use std::path::Path;
use tracing::debug;

/// Crop a full-bleed image down to the card plus `bleed_edge`.
///
/// The density is measured against `card_size` grown by `full_bleed` on
/// every side. Images denser than `max_dpi` are downscaled after cropping.
/// A non-positive density returns the image unchanged.
pub fn crop_image(
    image: &Image,
    card_name: &Path,
    card_size: Size,
    full_bleed: Length,
    bleed_edge: Length,
    max_dpi: f32,
) -> Image {
    let density = image.density(card_size.grown(full_bleed));
    if !(density > 0.0) {
        debug!(card = %card_name.display(), "density is zero, skipping crop");
        return image.clone();
    }

    let c = crop_amount(density, full_bleed, bleed_edge);
    debug!(
        card = %card_name.display(),
        dpi = density,
        crop = c,
        bleed_edge = %bleed_edge,
        "cropping around frame"
    );
    let cropped = image.crop(Border::uniform(c));

    if density > max_dpi {
        let scale = max_dpi / density;
        let (w, h) = cropped.size();
        let new_w = (w as f32 * scale).round() as u32;
        let new_h = (h as f32 * scale).round() as u32;
        debug!(
            card = %card_name.display(),
            max_dpi,
            width = new_w,
            height = new_h,
            "exceeds maximum density, resizing"
        );
        return cropped.resize(new_w, new_h);
    }
    cropped
}

/// Synthesize a bleed edge around a precropped image.
pub fn uncrop_image(image: &Image, card_name: &Path, card_size: Size, mode: BorderMode) -> Image {
    let density = image.density(card_size);
    let c = uncrop_amount(density);
    debug!(
        card = %card_name.display(),
        dpi = density,
        border = c,
        mode = ?mode,
        "reinserting bleed edge"
    );
    image.add_border(Border::uniform(c), mode)
}

/// Bring `image` to `target_ratio` according to `handling`.
pub fn fix_aspect_ratio(image: &Image, handling: BadAspectRatioHandling, target_ratio: f32) -> Image {
    match handling {
        BadAspectRatioHandling::Ignore => image.clone(),
        BadAspectRatioHandling::Expand => {
            let padding = expand_padding(image.size(), target_ratio);
            image.add_border(padding, BorderMode::Reflect)
        }
        BadAspectRatioHandling::Stretch => {
            let (w, h) = stretch_size(image.size(), target_ratio);
            if (w, h) == image.size() {
                image.clone()
            } else {
                image.resize(w, h)
            }
        }
    }
}
