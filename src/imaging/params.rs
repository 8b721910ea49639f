//! Parameter types for image operations.
//!
//! These types describe *what* to do, not *how*. They flow from the project
//! model (per-card overrides) through the work items into the
//! [`operations`](super::operations) module, and several of them are part of
//! the cache key in [`ImageParameters`](crate::database::ImageParameters).
//!
//! ## Types
//!
//! - [`Rotation`]: quarter-turn applied to a source before any geometry is measured.
//! - [`BleedType`]: whether a source already carries a bleed edge (or let the aspect ratio decide).
//! - [`BadAspectRatioHandling`]: what to do when a source does not match the card ratio.
//! - [`BorderMode`]: how a synthesized bleed edge is filled.
//! - [`UncropMode`]: whether precropped sources get a synthesized bleed, and with which fill.
//! - [`Quality`]: lossy encoding quality (1–100). Clamped on construction.

use serde::{Deserialize, Serialize};

/// Clockwise rotation applied to a source image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    None,
    Rotate90,
    Rotate180,
    Rotate270,
}

impl Rotation {
    pub fn degrees(self) -> u32 {
        match self {
            Rotation::None => 0,
            Rotation::Rotate90 => 90,
            Rotation::Rotate180 => 180,
            Rotation::Rotate270 => 270,
        }
    }

    /// Whether the rotation swaps width and height.
    pub fn is_quarter_turn(self) -> bool {
        matches!(self, Rotation::Rotate90 | Rotation::Rotate270)
    }
}

/// Per-card override for bleed detection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BleedType {
    /// Decide from the source's aspect ratio.
    #[default]
    Infer,
    /// The source already carries the full bleed edge.
    FullBleed,
    /// The source is cropped to the card border.
    NoBleed,
}

/// Per-card policy for sources whose aspect ratio does not match the target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BadAspectRatioHandling {
    /// Leave the image alone.
    #[default]
    Ignore,
    /// Pad the short dimension with a reflected border.
    Expand,
    /// Resize non-uniformly to the exact ratio.
    Stretch,
}

/// Fill used when growing an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorderMode {
    /// Mirror the pixels next to the edge (`cba|abc`).
    Reflect,
    /// Opaque black.
    Black,
}

impl BorderMode {
    pub fn for_uncrop(fancy: bool) -> Self {
        if fancy {
            BorderMode::Reflect
        } else {
            BorderMode::Black
        }
    }
}

/// How a precropped source is given a bleed edge. Part of the cache key, so
/// toggling either uncrop setting redoes the affected outputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UncropMode {
    /// No synthesis: the card alone is cropped.
    Off,
    Black,
    #[default]
    Reflect,
}

impl UncropMode {
    pub fn new(enable_uncrop: bool, enable_fancy_uncrop: bool) -> Self {
        match (enable_uncrop, enable_fancy_uncrop) {
            (false, _) => UncropMode::Off,
            (true, false) => UncropMode::Black,
            (true, true) => UncropMode::Reflect,
        }
    }

    /// Fill of the synthesized border, `None` when synthesis is off.
    pub fn border(self) -> Option<BorderMode> {
        match self {
            UncropMode::Off => None,
            UncropMode::Black => Some(BorderMode::Black),
            UncropMode::Reflect => Some(BorderMode::Reflect),
        }
    }
}

/// Quality setting for lossy image encoding (1-100).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quality(pub u32);

impl Quality {
    pub fn new(value: u32) -> Self {
        Self(value.clamp(1, 100))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self(95)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_clamps_to_valid_range() {
        assert_eq!(Quality::new(0).value(), 1);
        assert_eq!(Quality::new(50).value(), 50);
        assert_eq!(Quality::new(150).value(), 100);
    }

    #[test]
    fn quality_default_is_95() {
        assert_eq!(Quality::default().value(), 95);
    }

    #[test]
    fn quarter_turns() {
        assert!(Rotation::Rotate90.is_quarter_turn());
        assert!(Rotation::Rotate270.is_quarter_turn());
        assert!(!Rotation::Rotate180.is_quarter_turn());
        assert_eq!(Rotation::Rotate270.degrees(), 270);
    }

    #[test]
    fn uncrop_border_mode() {
        assert_eq!(BorderMode::for_uncrop(true), BorderMode::Reflect);
        assert_eq!(BorderMode::for_uncrop(false), BorderMode::Black);
    }

    #[test]
    fn disabled_uncrop_ignores_fancy_flag() {
        assert_eq!(UncropMode::new(false, true), UncropMode::Off);
        assert_eq!(UncropMode::new(false, false), UncropMode::Off);
        assert_eq!(UncropMode::new(true, false).border(), Some(BorderMode::Black));
        assert_eq!(UncropMode::Off.border(), None);
    }

    #[test]
    fn overrides_serialize_as_names() {
        assert_eq!(
            serde_json::to_string(&BleedType::FullBleed).unwrap(),
            "\"FullBleed\""
        );
        assert_eq!(
            serde_json::from_str::<BadAspectRatioHandling>("\"Stretch\"").unwrap(),
            BadAspectRatioHandling::Stretch
        );
    }
}
