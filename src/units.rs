//! Physical lengths for card geometry.
//!
//! Lengths are stored as millimeters and written in config files as strings
//! with an explicit unit, so card sizes read the way they are printed on a
//! product sheet:
//!
//! ```toml
//! width = "2.48in"
//! input_bleed = "3mm"
//! ```
//!
//! Supported units: `in`, `mm`, `cm`, `pt` (1/72 in).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Mul, Sub};
use std::str::FromStr;
use thiserror::Error;

const MM_PER_INCH: f32 = 25.4;

#[derive(Error, Debug, PartialEq)]
pub enum LengthError {
    #[error("invalid length '{0}': expected a number followed by in, mm, cm or pt")]
    Invalid(String),
}

/// A physical length, in millimeters.
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Length(f32);

impl Length {
    pub const ZERO: Length = Length(0.0);

    pub fn mm(value: f32) -> Self {
        Self(value)
    }

    pub fn inches(value: f32) -> Self {
        Self(value * MM_PER_INCH)
    }

    pub fn as_mm(self) -> f32 {
        self.0
    }

    pub fn as_inches(self) -> f32 {
        self.0 / MM_PER_INCH
    }

    /// Truncated to whole micrometers. Used wherever lengths are compared
    /// or persisted, so float noise below a micrometer never counts.
    pub fn micrometers(self) -> i64 {
        (self.0 * 1000.0).floor() as i64
    }

    pub fn max(self, other: Length) -> Length {
        Length(self.0.max(other.0))
    }
}

impl Add for Length {
    type Output = Length;
    fn add(self, rhs: Length) -> Length {
        Length(self.0 + rhs.0)
    }
}

impl Sub for Length {
    type Output = Length;
    fn sub(self, rhs: Length) -> Length {
        Length(self.0 - rhs.0)
    }
}

impl Mul<f32> for Length {
    type Output = Length;
    fn mul(self, rhs: f32) -> Length {
        Length(self.0 * rhs)
    }
}

impl FromStr for Length {
    type Err = LengthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| c.is_ascii_alphabetic())
            .ok_or_else(|| LengthError::Invalid(s.to_string()))?;
        let (number, unit) = trimmed.split_at(split);
        let value: f32 = number
            .trim()
            .parse()
            .map_err(|_| LengthError::Invalid(s.to_string()))?;
        let mm = match unit.to_ascii_lowercase().as_str() {
            "mm" => value,
            "cm" => value * 10.0,
            "in" => value * MM_PER_INCH,
            "pt" | "pts" => value * MM_PER_INCH / 72.0,
            _ => return Err(LengthError::Invalid(s.to_string())),
        };
        Ok(Length(mm))
    }
}

impl TryFrom<String> for Length {
    type Error = LengthError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Length> for String {
    fn from(value: Length) -> String {
        value.to_string()
    }
}

impl fmt::Display for Length {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}mm", self.0)
    }
}

/// Width and height of a physical rectangle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Size {
    pub width: Length,
    pub height: Length,
}

impl Size {
    pub fn new(width: Length, height: Length) -> Self {
        Self { width, height }
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.width.as_mm() / self.height.as_mm()
    }

    pub fn scaled(&self, factor: f32) -> Self {
        Self::new(self.width * factor, self.height * factor)
    }

    /// Grow by `edge` on every side.
    pub fn grown(&self, edge: Length) -> Self {
        Self::new(self.width + edge * 2.0, self.height + edge * 2.0)
    }
}
