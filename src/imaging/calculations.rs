//! Pure calculation functions for card geometry.
//!
//! All functions here are pure and testable without any I/O or images.

use super::params::BleedType;
use super::raster::Border;
use crate::config::NO_COLOR_CUBE;
use crate::units::{Length, Size};
use std::path::{Path, PathBuf};

/// Bleed synthesized around a precropped source, in inches.
pub const SYNTHESIZED_BLEED_INCHES: f32 = 0.12;

/// Pixels to remove from every side when cropping a full-bleed image.
///
/// The source carries `full_bleed` around the card; the output keeps
/// `bleed_edge` of it. A requested bleed edge larger than the available
/// bleed crops nothing.
///
/// # Examples
/// ```
/// # use proxy_cropper::imaging::crop_amount;
/// # use proxy_cropper::units::Length;
/// // 300 dpi, 0.12in available, keep nothing → 36px per side
/// assert_eq!(crop_amount(300.0, Length::inches(0.12), Length::ZERO), 36);
/// ```
pub fn crop_amount(density: f32, full_bleed: Length, bleed_edge: Length) -> u32 {
    let available = full_bleed.as_inches() * density;
    let keep = bleed_edge.as_inches() * density;
    (available - keep).max(0.0).round() as u32
}

/// Pixels added on every side when synthesizing a bleed edge.
pub fn uncrop_amount(density: f32) -> u32 {
    (SYNTHESIZED_BLEED_INCHES * density).max(0.0).round() as u32
}

/// Directory name for a bleed edge: millimeters with two decimals, the
/// decimal separator replaced by `p` (`"3p00"` for 3mm).
pub fn bleed_dir_name(bleed: Length) -> String {
    format!("{:.2}", bleed.as_mm())
        .chars()
        .map(|c| if c == '.' || c == ',' { 'p' } else { c })
        .collect()
}

/// Directory that receives final crops for the given bleed and color cube.
///
/// ```text
/// crop/                     no cube, no bleed
/// crop/3p00/                bleed only
/// crop/Vibrance/            cube only
/// crop/Vibrance/3p00/       both; the cube directory wraps the bleed directory
/// ```
pub fn output_dir(crop_dir: &Path, bleed: Length, color_cube: &str) -> PathBuf {
    let mut dir = crop_dir.to_path_buf();
    if color_cube != NO_COLOR_CUBE {
        dir.push(color_cube);
    }
    if bleed > Length::ZERO {
        dir.push(bleed_dir_name(bleed));
    }
    dir
}

/// Pixel size of the uncropped preview: `width` wide, card ratio tall.
pub fn preview_uncropped_size(width: u32, card_ratio: f32) -> (u32, u32) {
    if !(card_ratio > 0.0) {
        return (width, width);
    }
    (width, (width as f32 / card_ratio).round() as u32)
}

/// Pixel size of the cropped preview: the uncropped preview minus the
/// synthesized bleed on every side, measured against the full-bleed size.
pub fn preview_cropped_size(uncropped: (u32, u32), full_bleed_size: Size) -> (u32, u32) {
    let (w, h) = uncropped;
    let bw = full_bleed_size.width.as_inches();
    let bh = full_bleed_size.height.as_inches();
    if !(bw > 0.0 && bh > 0.0) {
        return uncropped;
    }
    let density = (w as f32 / bw).min(h as f32 / bh);
    let crop = uncrop_amount(density) * 2;
    (w.saturating_sub(crop).max(1), h.saturating_sub(crop).max(1))
}

/// Whether a source with `image_ratio` carries a bleed edge.
///
/// Under [`BleedType::Infer`] the closer of the two reference ratios wins;
/// a tie counts as precropped.
pub fn has_bleed(image_ratio: f32, card_ratio: f32, full_bleed_ratio: f32, bleed: BleedType) -> bool {
    match bleed {
        BleedType::FullBleed => true,
        BleedType::NoBleed => false,
        BleedType::Infer => {
            (image_ratio - full_bleed_ratio).abs() < (image_ratio - card_ratio).abs()
        }
    }
}

/// Whether `ratio` is within `tolerance` of being the card turned sideways.
pub fn looks_rotated(ratio: f32, card_ratio: f32, full_bleed_ratio: f32, tolerance: f32) -> bool {
    let sideways = |r: f32| r > 0.0 && (ratio - 1.0 / r).abs() < tolerance;
    sideways(card_ratio) || sideways(full_bleed_ratio)
}

/// Padding that grows `size` to `target_ratio`, split evenly between the
/// two sides of the short dimension (the odd pixel goes bottom/right).
pub fn expand_padding(size: (u32, u32), target_ratio: f32) -> Border {
    let (w, h) = size;
    if w == 0 || h == 0 || !(target_ratio > 0.0) {
        return Border::default();
    }
    let ratio = w as f32 / h as f32;
    if ratio > target_ratio {
        // Too wide: grow height
        let needed = (w as f32 / target_ratio).round() as u32;
        let extra = needed.saturating_sub(h);
        Border {
            top: extra / 2,
            bottom: extra - extra / 2,
            ..Border::default()
        }
    } else {
        let needed = (h as f32 * target_ratio).round() as u32;
        let extra = needed.saturating_sub(w);
        Border {
            left: extra / 2,
            right: extra - extra / 2,
            ..Border::default()
        }
    }
}

/// Size that has `target_ratio` and keeps the long dimension of `size`.
pub fn stretch_size(size: (u32, u32), target_ratio: f32) -> (u32, u32) {
    let (w, h) = size;
    if w == 0 || h == 0 || !(target_ratio > 0.0) {
        return size;
    }
    if w as f32 / h as f32 > target_ratio {
        (w, (w as f32 / target_ratio).round().max(1.0) as u32)
    } else {
        ((h as f32 * target_ratio).round().max(1.0) as u32, h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standard() -> (Size, Size) {
        let card = Size::new(Length::inches(2.48), Length::inches(3.46));
        (card, card.grown(Length::inches(0.12)))
    }

    // =========================================================================
    // crop / uncrop amounts
    // =========================================================================

    #[test]
    fn crop_amount_keeps_requested_bleed() {
        // 0.12in available, keep 0.06in at 100dpi → 6px
        assert_eq!(
            crop_amount(100.0, Length::inches(0.12), Length::inches(0.06)),
            6
        );
    }

    #[test]
    fn crop_amount_never_negative() {
        assert_eq!(crop_amount(300.0, Length::inches(0.12), Length::inches(1.0)), 0);
    }

    #[test]
    fn crop_amount_zero_density() {
        assert_eq!(crop_amount(0.0, Length::inches(0.12), Length::ZERO), 0);
    }

    #[test]
    fn uncrop_amount_at_300dpi() {
        assert_eq!(uncrop_amount(300.0), 36);
        assert_eq!(uncrop_amount(0.0), 0);
    }

    // =========================================================================
    // output directories
    // =========================================================================

    #[test]
    fn bleed_dir_name_replaces_separator() {
        assert_eq!(bleed_dir_name(Length::mm(3.0)), "3p00");
        assert_eq!(bleed_dir_name(Length::mm(0.5)), "0p50");
        assert_eq!(bleed_dir_name(Length::mm(1.234)), "1p23");
    }

    #[test]
    fn output_dir_plain() {
        assert_eq!(
            output_dir(Path::new("images/crop"), Length::ZERO, NO_COLOR_CUBE),
            PathBuf::from("images/crop")
        );
    }

    #[test]
    fn output_dir_bleed_only() {
        assert_eq!(
            output_dir(Path::new("crop"), Length::mm(3.0), NO_COLOR_CUBE),
            PathBuf::from("crop/3p00")
        );
    }

    #[test]
    fn output_dir_cube_wraps_bleed() {
        assert_eq!(
            output_dir(Path::new("crop"), Length::mm(2.5), "Vibrance"),
            PathBuf::from("crop/Vibrance/2p50")
        );
        assert_eq!(
            output_dir(Path::new("crop"), Length::ZERO, "Vibrance"),
            PathBuf::from("crop/Vibrance")
        );
    }

    // =========================================================================
    // preview sizes
    // =========================================================================

    #[test]
    fn preview_sizes_for_standard_card() {
        let (card, full) = standard();
        let uncropped = preview_uncropped_size(248, card.aspect_ratio());
        assert_eq!(uncropped, (248, 346));

        // Density against 2.72in wide ≈ 91.2 → 11px bleed per side
        let cropped = preview_cropped_size(uncropped, full);
        assert_eq!(cropped, (248 - 22, 346 - 22));
    }

    #[test]
    fn preview_uncropped_degenerate_ratio() {
        assert_eq!(preview_uncropped_size(100, 0.0), (100, 100));
    }

    // =========================================================================
    // bleed detection and rotation
    // =========================================================================

    #[test]
    fn infer_bleed_picks_closer_ratio() {
        let (card, full) = standard();
        let (cr, fr) = (card.aspect_ratio(), full.aspect_ratio());
        assert!(has_bleed(fr, cr, fr, BleedType::Infer));
        assert!(!has_bleed(cr, cr, fr, BleedType::Infer));
    }

    #[test]
    fn bleed_overrides_win() {
        let (card, full) = standard();
        let (cr, fr) = (card.aspect_ratio(), full.aspect_ratio());
        assert!(has_bleed(cr, cr, fr, BleedType::FullBleed));
        assert!(!has_bleed(fr, cr, fr, BleedType::NoBleed));
    }

    #[test]
    fn sideways_card_is_flagged() {
        let (card, full) = standard();
        let (cr, fr) = (card.aspect_ratio(), full.aspect_ratio());
        assert!(looks_rotated(1.0 / cr, cr, fr, 0.01));
        assert!(looks_rotated(1.0 / fr, cr, fr, 0.01));
        assert!(!looks_rotated(cr, cr, fr, 0.01));
    }

    // =========================================================================
    // aspect ratio fixes
    // =========================================================================

    #[test]
    fn expand_too_wide_pads_vertically() {
        let border = expand_padding((200, 100), 1.0);
        assert_eq!(
            border,
            Border {
                top: 50,
                bottom: 50,
                left: 0,
                right: 0
            }
        );
    }

    #[test]
    fn expand_too_tall_pads_horizontally_odd_split() {
        let border = expand_padding((100, 201), 1.0);
        assert_eq!(border.left, 50);
        assert_eq!(border.right, 51);
        assert_eq!(border.top + border.bottom, 0);
    }

    #[test]
    fn expand_matching_ratio_is_noop() {
        assert_eq!(expand_padding((100, 100), 1.0), Border::default());
    }

    #[test]
    fn stretch_keeps_long_dimension() {
        assert_eq!(stretch_size((200, 100), 1.0), (200, 200));
        assert_eq!(stretch_size((100, 300), 0.5), (150, 300));
    }
}
