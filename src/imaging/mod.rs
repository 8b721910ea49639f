//! Image processing, pure Rust.
//!
//! | Operation | Crate / function |
//! |---|---|
//! | **Decode** | `image::ImageReader` (BMP, GIF, JPEG, PNG) |
//! | **Encode** | `JpegEncoder` with quality, or format from extension |
//! | **Crop / uncrop** | `crop_imm` + per-pixel reflect or black border |
//! | **Color grading** | `.cube` 3D LUT, trilinear |
//!
//! The module is split into:
//! - **Calculations**: Pure functions for card geometry (unit testable)
//! - **Parameters**: Per-card override types and encoding quality
//! - **Raster**: The in-memory [`Image`] value and its pixel operations
//! - **Color cubes**: `.cube` parsing and the lazily loaded registry
//! - **Backend**: [`ImageBackend`] trait + [`RustBackend`]
//! - **Operations**: Crop, uncrop and aspect-ratio fixes built on the above

pub mod backend;
mod calculations;
pub mod color_cube;
pub mod operations;
mod params;
pub mod raster;
pub mod rust_backend;

pub use backend::{BackendError, ImageBackend};
pub use calculations::{
    SYNTHESIZED_BLEED_INCHES, bleed_dir_name, crop_amount, expand_padding, has_bleed,
    looks_rotated, output_dir, preview_cropped_size, preview_uncropped_size, stretch_size,
    uncrop_amount,
};
pub use color_cube::{ColorCube, ColorCubeLookup, ColorCubes};
pub use operations::{crop_image, fix_aspect_ratio, uncrop_image};
pub use params::{BadAspectRatioHandling, BleedType, BorderMode, Quality, Rotation, UncropMode};
pub use raster::{Border, EncodeFormat, Image};
pub use rust_backend::{RustBackend, is_supported_image, supported_input_extensions};
