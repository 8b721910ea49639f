//! Card discovery on disk.
//!
//! A card is a file directly inside the image directory whose extension has
//! a compiled-in decoder. Subdirectories (the crop and uncrop trees usually
//! live under the image directory) are never descended into.
//!
//! ```text
//! images/
//! ├── forest.png          # card "forest.png"
//! ├── __back.jpg          # card, starts hidden
//! ├── notes.txt           # ignored: not an image
//! └── crop/               # ignored: directory
//!     ├── forest.png
//!     └── 0p50/forest.png # variant for a 0.5mm bleed edge
//! ```

use crate::imaging::is_supported_image;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Card names (file names relative to `dir`), sorted. A missing or
/// unreadable directory lists nothing.
pub fn list_card_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_supported_image(path))
        .filter_map(|path| path.file_name().map(PathBuf::from))
        .collect();
    names.sort();
    names
}

/// Every directory under `root` (including `root`) holding a file named
/// `name`. Used to find all bleed and color variants of one card's output.
pub fn variant_dirs(root: &Path, name: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_dir())
        .map(|entry| entry.into_path())
        .filter(|dir| dir.join(name).is_file())
        .collect()
}

/// Cards whose file name starts with `__` are counted zero times and hidden.
pub fn is_hidden_card(name: &Path) -> bool {
    name.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with("__"))
}
