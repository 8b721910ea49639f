//! 3D color lookup tables in the `.cube` text format.
//!
//! A cube file lists `N³` output colors for an evenly spaced `N×N×N` grid of
//! input colors, red varying fastest:
//!
//! ```text
//! TITLE "Vibrance"
//! LUT_3D_SIZE 33
//! DOMAIN_MIN 0.0 0.0 0.0
//! DOMAIN_MAX 1.0 1.0 1.0
//! 0.000000 0.000000 0.000000
//! 0.031250 0.000000 0.000000
//! ...
//! ```
//!
//! Lookups interpolate trilinearly between the eight surrounding grid points.
//! [`ColorCubes`] loads cubes by name from a directory on first use and
//! keeps them for the life of the process.

use crate::config::NO_COLOR_CUBE;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum CubeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("missing LUT_3D_SIZE")]
    MissingSize,
    #[error("expected {expected} table entries, found {found}")]
    WrongCount { expected: usize, found: usize },
}

/// A parsed 3D lookup table.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorCube {
    size: usize,
    domain_min: [f32; 3],
    domain_max: [f32; 3],
    table: Vec<[f32; 3]>,
}

impl ColorCube {
    /// The cube that maps every color to itself.
    pub fn identity(size: usize) -> Self {
        let size = size.max(2);
        let step = 1.0 / (size - 1) as f32;
        let mut table = Vec::with_capacity(size * size * size);
        for b in 0..size {
            for g in 0..size {
                for r in 0..size {
                    table.push([r as f32 * step, g as f32 * step, b as f32 * step]);
                }
            }
        }
        Self {
            size,
            domain_min: [0.0; 3],
            domain_max: [1.0; 3],
            table,
        }
    }

    pub fn load(path: &Path) -> Result<Self, CubeError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, CubeError> {
        let mut size = None;
        let mut domain_min = [0.0; 3];
        let mut domain_max = [1.0; 3];
        let mut table = Vec::new();

        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut words = line.split_whitespace();
            let Some(first) = words.next() else {
                continue;
            };
            match first {
                "TITLE" | "LUT_1D_SIZE" | "LUT_1D_INPUT_RANGE" | "LUT_3D_INPUT_RANGE" => {}
                "LUT_3D_SIZE" => {
                    let value = words.next().and_then(|w| w.parse::<usize>().ok());
                    match value {
                        Some(n) if n >= 2 => size = Some(n),
                        _ => {
                            return Err(CubeError::Parse {
                                line: line_no,
                                message: "LUT_3D_SIZE must be an integer >= 2".into(),
                            });
                        }
                    }
                }
                "DOMAIN_MIN" => domain_min = parse_triplet(words, line_no)?,
                "DOMAIN_MAX" => domain_max = parse_triplet(words, line_no)?,
                _ => {
                    let rest = std::iter::once(first).chain(words);
                    table.push(parse_triplet(rest, line_no)?);
                }
            }
        }

        let size = size.ok_or(CubeError::MissingSize)?;
        let expected = size * size * size;
        if table.len() != expected {
            return Err(CubeError::WrongCount {
                expected,
                found: table.len(),
            });
        }
        Ok(Self {
            size,
            domain_min,
            domain_max,
            table,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Map one 8-bit color through the table.
    pub fn sample(&self, rgb: [u8; 3]) -> [u8; 3] {
        let n = self.size;
        let max_index = (n - 1) as f32;
        let mut lo = [0usize; 3];
        let mut hi = [0usize; 3];
        let mut frac = [0f32; 3];
        for c in 0..3 {
            let span = self.domain_max[c] - self.domain_min[c];
            let unit = if span > 0.0 {
                ((rgb[c] as f32 / 255.0 - self.domain_min[c]) / span).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let pos = unit * max_index;
            lo[c] = pos.floor() as usize;
            hi[c] = (lo[c] + 1).min(n - 1);
            frac[c] = pos - lo[c] as f32;
        }

        let at = |r: usize, g: usize, b: usize| self.table[r + g * n + b * n * n];
        let lerp = |a: [f32; 3], b: [f32; 3], t: f32| {
            [
                a[0] + (b[0] - a[0]) * t,
                a[1] + (b[1] - a[1]) * t,
                a[2] + (b[2] - a[2]) * t,
            ]
        };

        let c00 = lerp(at(lo[0], lo[1], lo[2]), at(hi[0], lo[1], lo[2]), frac[0]);
        let c10 = lerp(at(lo[0], hi[1], lo[2]), at(hi[0], hi[1], lo[2]), frac[0]);
        let c01 = lerp(at(lo[0], lo[1], hi[2]), at(hi[0], lo[1], hi[2]), frac[0]);
        let c11 = lerp(at(lo[0], hi[1], hi[2]), at(hi[0], hi[1], hi[2]), frac[0]);
        let c0 = lerp(c00, c10, frac[1]);
        let c1 = lerp(c01, c11, frac[1]);
        let out = lerp(c0, c1, frac[2]);

        out.map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
    }
}

fn parse_triplet<'a>(
    mut words: impl Iterator<Item = &'a str>,
    line: usize,
) -> Result<[f32; 3], CubeError> {
    let mut out = [0f32; 3];
    for slot in &mut out {
        *slot = words
            .next()
            .and_then(|w| w.parse::<f32>().ok())
            .ok_or_else(|| CubeError::Parse {
                line,
                message: "expected three numbers".into(),
            })?;
    }
    Ok(out)
}

/// Shared lookup from cube name to a loaded cube. `None` means "no grading".
pub type ColorCubeLookup = Arc<dyn Fn(&str) -> Option<Arc<ColorCube>> + Send + Sync>;

/// Lazily loaded, memoized cubes from `<dir>/<name>.cube`.
#[derive(Debug)]
pub struct ColorCubes {
    dir: PathBuf,
    loaded: Mutex<HashMap<String, Arc<ColorCube>>>,
}

impl ColorCubes {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            loaded: Mutex::new(HashMap::new()),
        }
    }

    /// Register a cube under `name`, replacing any loaded one.
    pub fn insert(&self, name: &str, cube: ColorCube) {
        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::new(cube));
    }

    /// Fetch a cube, loading it on first use. Load failures are logged and
    /// not remembered, so a cube dropped into the directory later is found.
    pub fn get(&self, name: &str) -> Option<Arc<ColorCube>> {
        if name == NO_COLOR_CUBE {
            return None;
        }
        let mut loaded = self.loaded.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cube) = loaded.get(name) {
            return Some(Arc::clone(cube));
        }
        let candidates = [
            self.dir.join(format!("{name}.cube")),
            self.dir.join(format!("{name}.CUBE")),
        ];
        let path = candidates.iter().find(|p| p.is_file())?;
        match ColorCube::load(path) {
            Ok(cube) => {
                debug!(cube = name, path = %path.display(), size = cube.size(), "loaded color cube");
                let cube = Arc::new(cube);
                loaded.insert(name.to_string(), Arc::clone(&cube));
                Some(cube)
            }
            Err(e) => {
                warn!(cube = name, path = %path.display(), error = %e, "failed to load color cube");
                None
            }
        }
    }

    /// A cloneable lookup closure for work items.
    pub fn lookup(self: &Arc<Self>) -> ColorCubeLookup {
        let cubes = Arc::clone(self);
        Arc::new(move |name: &str| cubes.get(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write;
    use tempfile::TempDir;

    fn cube_text(size: usize, f: impl Fn([f32; 3]) -> [f32; 3]) -> String {
        let mut text = format!("TITLE \"test\"\n# comment\nLUT_3D_SIZE {size}\n");
        let step = 1.0 / (size - 1) as f32;
        for b in 0..size {
            for g in 0..size {
                for r in 0..size {
                    let [x, y, z] = f([r as f32 * step, g as f32 * step, b as f32 * step]);
                    writeln!(text, "{x:.6} {y:.6} {z:.6}").unwrap();
                }
            }
        }
        text
    }

    #[test]
    fn parse_identity_cube() {
        let cube = ColorCube::parse(&cube_text(3, |c| c)).unwrap();
        assert_eq!(cube.size(), 3);
        assert_eq!(cube, ColorCube::identity(3));
    }

    #[test]
    fn identity_sample_is_lossless() {
        let cube = ColorCube::identity(17);
        for rgb in [[0, 0, 0], [255, 255, 255], [12, 200, 77], [128, 64, 250]] {
            assert_eq!(cube.sample(rgb), rgb);
        }
    }

    #[test]
    fn inverting_cube_inverts() {
        let cube = ColorCube::parse(&cube_text(2, |[r, g, b]| [1.0 - r, 1.0 - g, 1.0 - b])).unwrap();
        assert_eq!(cube.sample([0, 255, 100]), [255, 0, 155]);
    }

    #[test]
    fn wrong_entry_count_is_error() {
        let text = "LUT_3D_SIZE 2\n0 0 0\n1 1 1\n";
        assert!(matches!(
            ColorCube::parse(text),
            Err(CubeError::WrongCount {
                expected: 8,
                found: 2
            })
        ));
    }

    #[test]
    fn missing_size_is_error() {
        assert!(matches!(
            ColorCube::parse("0 0 0\n"),
            Err(CubeError::MissingSize)
        ));
    }

    #[test]
    fn garbage_row_reports_line() {
        let text = "LUT_3D_SIZE 2\n0 0 zero\n";
        assert!(matches!(
            ColorCube::parse(text),
            Err(CubeError::Parse { line: 2, .. })
        ));
    }

    // =========================================================================
    // ColorCubes registry
    // =========================================================================

    #[test]
    fn none_is_never_loaded() {
        let cubes = ColorCubes::new("/nonexistent");
        assert!(cubes.get(NO_COLOR_CUBE).is_none());
    }

    #[test]
    fn loads_and_memoizes_from_dir() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("Invert.CUBE"), cube_text(2, |[r, g, b]| [1.0 - r, 1.0 - g, 1.0 - b])).unwrap();
        let cubes = Arc::new(ColorCubes::new(tmp.path()));

        let first = cubes.get("Invert").unwrap();
        // File removal does not matter once loaded
        std::fs::remove_file(tmp.path().join("Invert.CUBE")).unwrap();
        let lookup = cubes.lookup();
        let second = lookup("Invert").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn missing_cube_is_none() {
        let tmp = TempDir::new().unwrap();
        let cubes = ColorCubes::new(tmp.path());
        assert!(cubes.get("Vibrance").is_none());
    }

    #[test]
    fn inserted_cube_is_returned() {
        let cubes = ColorCubes::new("/nonexistent");
        cubes.insert("Identity", ColorCube::identity(2));
        assert_eq!(cubes.get("Identity").unwrap().size(), 2);
    }
}
