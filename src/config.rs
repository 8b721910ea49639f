//! Application configuration module.
//!
//! Handles loading, validating, and merging `config.toml`. Stock defaults are
//! serialized to a TOML value, the user's file is merged on top of them, and
//! the result is deserialized and validated. A config file only needs the
//! keys it wants to change.
//!
//! ## Config File Location
//!
//! ```text
//! my-deck/
//! ├── config.toml          # Application config (optional)
//! ├── project.json         # Project data (dirs, bleed, per-card overrides)
//! ├── res/cubes/           # Color cubes, one <name>.cube per LUT
//! └── images/              # Card sources
//!     ├── crop/            # Cropped output (+ .image.db, preview.cache)
//!     └── uncrop/          # Synthesized-bleed intermediates
//! ```
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! max_dpi = 1200                # Crops denser than this are downscaled
//! base_preview_width = 512      # Pixel width of UI previews
//! color_cube = "None"           # Name of a cube in cube_dir, or "None"
//! cube_dir = "res/cubes"
//! enable_uncrop = true          # Synthesize bleed for precropped sources
//! enable_fancy_uncrop = true    # Reflect border (true) or black border (false)
//! fallback_name = "fallback.png"
//! default_card_size = "Standard"
//!
//! [card_sizes.Standard]
//! width = "2.48in"
//! height = "3.46in"
//! input_bleed = "0.12in"
//! scale = 1.0
//!
//! [processing]
//! max_workers = 4               # Omit for auto = CPU cores
//!
//! [pipeline]
//! idle_debounce_ms = 250        # Quiet period before "work done" fires
//! ```
//!
//! Unknown keys are rejected to catch typos early.

use crate::units::{Length, Size};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Name of the application config file within a project directory.
pub const CONFIG_FILENAME: &str = "config.toml";

/// Color cube name that disables color grading.
pub const NO_COLOR_CUBE: &str = "None";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Application configuration loaded from `config.toml`.
///
/// These are the knobs that are not specific to one project's card list:
/// output density, preview size, color grading and the table of known card
/// sizes. Per-project values (directories, bleed edge, card size choice) live
/// in [`ProjectData`](crate::project::ProjectData).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Crops are downscaled to this density (pixels per inch) when the
    /// source is denser.
    pub max_dpi: f32,
    /// Pixel width of the uncropped preview.
    pub base_preview_width: u32,
    /// Active color cube, or `"None"`.
    pub color_cube: String,
    /// Directory holding `<name>.cube` files, relative to the project root.
    pub cube_dir: String,
    /// Synthesize a bleed edge for sources that have none.
    pub enable_uncrop: bool,
    /// Reflect the image into the synthesized bleed instead of painting it black.
    pub enable_fancy_uncrop: bool,
    /// Image shown for cards whose preview is not ready yet.
    pub fallback_name: String,
    /// Card size used when a project names one that is not in `card_sizes`.
    pub default_card_size: String,
    /// Known card sizes by name.
    pub card_sizes: BTreeMap<String, CardSizeInfo>,
    /// Parallel processing settings.
    pub processing: ProcessingConfig,
    /// Scheduler timing.
    pub pipeline: PipelineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_dpi: 1200.0,
            base_preview_width: 512,
            color_cube: NO_COLOR_CUBE.to_string(),
            cube_dir: "res/cubes".to_string(),
            enable_uncrop: true,
            enable_fancy_uncrop: true,
            fallback_name: "fallback.png".to_string(),
            default_card_size: "Standard".to_string(),
            card_sizes: stock_card_sizes(),
            processing: ProcessingConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Config {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.max_dpi > 0.0) {
            return Err(ConfigError::Validation("max_dpi must be positive".into()));
        }
        if self.base_preview_width == 0 {
            return Err(ConfigError::Validation(
                "base_preview_width must be non-zero".into(),
            ));
        }
        if self.color_cube.trim().is_empty() {
            return Err(ConfigError::Validation(
                "color_cube must be a cube name or \"None\"".into(),
            ));
        }
        if !self.card_sizes.contains_key(&self.default_card_size) {
            return Err(ConfigError::Validation(format!(
                "default_card_size '{}' is not defined in card_sizes",
                self.default_card_size
            )));
        }
        for (name, info) in &self.card_sizes {
            if info.width <= Length::ZERO || info.height <= Length::ZERO {
                return Err(ConfigError::Validation(format!(
                    "card_sizes.{name}: width and height must be positive"
                )));
            }
            if info.input_bleed < Length::ZERO {
                return Err(ConfigError::Validation(format!(
                    "card_sizes.{name}: input_bleed must not be negative"
                )));
            }
            if !(info.scale > 0.0) {
                return Err(ConfigError::Validation(format!(
                    "card_sizes.{name}: scale must be positive"
                )));
            }
        }
        Ok(())
    }

    /// Resolve a card size by name, falling back to `default_card_size`.
    pub fn card_size_info(&self, choice: &str) -> CardSizeInfo {
        self.card_sizes
            .get(choice)
            .or_else(|| self.card_sizes.get(&self.default_card_size))
            .cloned()
            .unwrap_or_else(CardSizeInfo::standard)
    }

    pub fn color_grading_enabled(&self) -> bool {
        self.color_cube != NO_COLOR_CUBE
    }
}

/// Physical geometry of one card size.
///
/// `input_bleed` is the bleed a full-bleed source image carries around the
/// card. All three lengths are multiplied by `scale`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CardSizeInfo {
    pub width: Length,
    pub height: Length,
    pub input_bleed: Length,
    #[serde(default = "default_scale")]
    pub scale: f32,
}

fn default_scale() -> f32 {
    1.0
}

impl CardSizeInfo {
    pub fn standard() -> Self {
        Self {
            width: Length::inches(2.48),
            height: Length::inches(3.46),
            input_bleed: Length::inches(0.12),
            scale: 1.0,
        }
    }

    /// Trimmed card size.
    pub fn card_size(&self) -> Size {
        Size::new(self.width, self.height).scaled(self.scale)
    }

    /// Bleed carried by a full-bleed source.
    pub fn full_bleed(&self) -> Length {
        self.input_bleed * self.scale
    }

    pub fn card_size_with_full_bleed(&self) -> Size {
        Size::new(self.width, self.height)
            .grown(self.input_bleed)
            .scaled(self.scale)
    }
}

fn stock_card_sizes() -> BTreeMap<String, CardSizeInfo> {
    let mut sizes = BTreeMap::new();
    sizes.insert("Standard".to_string(), CardSizeInfo::standard());
    sizes.insert(
        "Oversized".to_string(),
        CardSizeInfo {
            width: Length::inches(3.46),
            height: Length::inches(4.96),
            input_bleed: Length::inches(0.12),
            scale: 1.0,
        },
    );
    sizes.insert(
        "Novelty".to_string(),
        CardSizeInfo {
            scale: 0.5,
            ..CardSizeInfo::standard()
        },
    );
    sizes.insert(
        "Japanese".to_string(),
        CardSizeInfo {
            width: Length::mm(59.0),
            height: Length::mm(86.0),
            input_bleed: Length::mm(2.0),
            scale: 1.0,
        },
    );
    sizes.insert(
        "Poker".to_string(),
        CardSizeInfo {
            width: Length::inches(2.5),
            height: Length::inches(3.5),
            input_bleed: Length::mm(3.0),
            scale: 1.0,
        },
    );
    sizes
}

/// Parallel processing settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Maximum number of parallel crop/preview workers.
    /// When absent or null, defaults to the number of CPU cores.
    /// Values larger than the core count are clamped down.
    pub max_workers: Option<usize>,
}

/// Resolve the effective thread count from config.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)` (user can constrain down, not up)
pub fn effective_threads(config: &ProcessingConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config
        .max_workers
        .map(|n| n.clamp(1, cores))
        .unwrap_or(cores)
}

/// Scheduler timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// How long the scheduler waits after the last completion of a burst
    /// before announcing that all work is done.
    pub idle_debounce_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            idle_debounce_ms: 250,
        }
    }
}

impl PipelineConfig {
    pub fn idle_debounce(&self) -> Duration {
        Duration::from_millis(self.idle_debounce_ms)
    }
}

/// Stock defaults as a TOML value, the base layer for merging.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    Ok(toml::Value::try_from(Config::default())?)
}

/// Deep-merge two TOML values. Tables merge key by key; anything else in
/// `overlay` replaces `base`.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Load a `config.toml` from a directory as a raw TOML value.
///
/// Returns `Ok(None)` if no `config.toml` exists in the directory.
/// Returns `Err` if the file exists but contains invalid TOML.
pub fn load_raw_config(path: &Path) -> Result<Option<toml::Value>, ConfigError> {
    let config_path = path.join(CONFIG_FILENAME);
    if !config_path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&config_path)?;
    let value: toml::Value = toml::from_str(&content)?;
    Ok(Some(value))
}

/// Merge an optional overlay onto a base value, then deserialize and validate.
pub fn resolve_config(
    base: toml::Value,
    overlay: Option<toml::Value>,
) -> Result<Config, ConfigError> {
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: Config = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load config from `config.toml` in the given directory.
///
/// Merges user values on top of stock defaults, rejects unknown keys,
/// and validates the result.
pub fn load_config(root: &Path) -> Result<Config, ConfigError> {
    let base = stock_defaults_value()?;
    let overlay = load_raw_config(root)?;
    resolve_config(base, overlay)
}

/// Returns a fully-commented stock `config.toml` with all keys and explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# proxy-cropper Configuration
# ===========================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults.
#
# Lengths are strings with a unit: "2.48in", "63mm", "0.6cm", "9pt".
# Unknown keys will cause an error.

# Crops whose source density exceeds this (pixels per inch) are downscaled.
max_dpi = 1200

# Pixel width of the uncropped preview images.
base_preview_width = 512

# Color cube applied to every crop. "None" disables grading; any other value
# names <cube_dir>/<name>.cube. Graded crops land in crop/<name>/.
color_cube = "None"
cube_dir = "res/cubes"

# Synthesize a bleed edge for sources that were cropped to the card border.
enable_uncrop = true

# true: mirror the card edge into the synthesized bleed.
# false: paint the synthesized bleed black.
enable_fancy_uncrop = true

# Shown for cards that have no preview yet.
fallback_name = "fallback.png"

# Used when a project names a card size that is not listed below.
default_card_size = "Standard"

# ---------------------------------------------------------------------------
# Card sizes
# ---------------------------------------------------------------------------
# input_bleed is the bleed a full-bleed source carries on each side.
# scale multiplies all three lengths.
[card_sizes.Standard]
width = "2.48in"
height = "3.46in"
input_bleed = "0.12in"
scale = 1.0

[card_sizes.Oversized]
width = "3.46in"
height = "4.96in"
input_bleed = "0.12in"
scale = 1.0

[card_sizes.Novelty]
width = "2.48in"
height = "3.46in"
input_bleed = "0.12in"
scale = 0.5

[card_sizes.Japanese]
width = "59mm"
height = "86mm"
input_bleed = "2mm"
scale = 1.0

[card_sizes.Poker]
width = "2.5in"
height = "3.5in"
input_bleed = "3mm"
scale = 1.0

# ---------------------------------------------------------------------------
# Processing
# ---------------------------------------------------------------------------
[processing]
# Maximum parallel crop/preview workers.
# Omit or comment out to auto-detect (= number of CPU cores).
# max_workers = 4

# ---------------------------------------------------------------------------
# Pipeline
# ---------------------------------------------------------------------------
[pipeline]
# Quiet period after the last finished card before "done" is announced.
idle_debounce_ms = 250
"##
}
