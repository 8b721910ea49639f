//! Project data model.
//!
//! A project is a directory holding `project.json`, an optional
//! `config.toml`, and (by default) the `images/` tree. The project owns the
//! card list with each card's print count and overrides, plus the preview
//! cache. It reacts to card events from the provider and to preview and
//! idle events from the cropper.
//!
//! ## `project.json`
//!
//! ```json
//! {
//!   "image_dir": "images",
//!   "crop_dir": "images/crop",
//!   "uncrop_dir": "images/uncrop",
//!   "image_cache": "images/crop/preview.cache",
//!   "bleed_edge": "0mm",
//!   "card_size_choice": "Standard",
//!   "cards": {
//!     "forest.png": { "num": 4, "rotation": "Rotate90" }
//!   }
//! }
//! ```
//!
//! Every key is optional. Relative paths are resolved against the project
//! directory when loaded and written back relative when saved.

use crate::config::Config;
use crate::imaging::{BadAspectRatioHandling, BleedType, ImageBackend, Rotation};
use crate::preview_cache::{self, PreviewCacheError, Previews};
use crate::scan::{is_hidden_card, list_card_files};
use crate::units::Length;
use crate::work::ImagePreview;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const PROJECT_FILENAME: &str = "project.json";

/// Highest print count a card accepts.
pub const MAX_CARD_COUNT: u32 = 999;

#[derive(Error, Debug)]
pub enum ProjectError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("preview cache error: {0}")]
    PreviewCache(#[from] PreviewCacheError),
}

/// Per-card state and overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CardInfo {
    /// Copies to print.
    pub num: u32,
    /// Hide counter. The card is listed only at zero.
    pub hidden: u32,
    /// Set while the card is hidden because its file disappeared; the next
    /// add for the same name unhides it again.
    #[serde(skip)]
    pub transient: bool,
    pub backside: Option<PathBuf>,
    pub backside_short_edge: bool,
    pub oversized: bool,
    pub rotation: Rotation,
    pub bleed_type: BleedType,
    pub bad_aspect_ratio_handling: BadAspectRatioHandling,
    /// Source file outside the image directory.
    pub external_path: Option<PathBuf>,
}

impl Default for CardInfo {
    fn default() -> Self {
        Self {
            num: 1,
            hidden: 0,
            transient: false,
            backside: None,
            backside_short_edge: false,
            oversized: false,
            rotation: Rotation::default(),
            bleed_type: BleedType::default(),
            bad_aspect_ratio_handling: BadAspectRatioHandling::default(),
            external_path: None,
        }
    }
}

impl CardInfo {
    /// Info for a newly discovered file: `__`-prefixed names start hidden
    /// with a count of zero.
    pub fn for_new_file(name: &Path) -> Self {
        if is_hidden_card(name) {
            Self {
                num: 0,
                hidden: 1,
                ..Self::default()
            }
        } else {
            Self::default()
        }
    }

    pub fn is_visible(&self) -> bool {
        self.hidden == 0
    }

    /// The same card after its file was renamed to `new`. An external
    /// source follows the rename within its directory.
    pub fn renamed(mut self, new: &Path) -> Self {
        if let Some(path) = self.external_path.as_mut() {
            path.set_file_name(new);
        }
        self
    }
}

/// The persisted half of a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectData {
    pub image_dir: PathBuf,
    pub crop_dir: PathBuf,
    pub uncrop_dir: PathBuf,
    /// Preview cache file.
    pub image_cache: PathBuf,
    pub bleed_edge: Length,
    pub card_size_choice: String,
    pub cards: BTreeMap<PathBuf, CardInfo>,
}

impl Default for ProjectData {
    fn default() -> Self {
        Self {
            image_dir: PathBuf::from("images"),
            crop_dir: PathBuf::from("images/crop"),
            uncrop_dir: PathBuf::from("images/uncrop"),
            image_cache: PathBuf::from("images/crop/preview.cache"),
            bleed_edge: Length::ZERO,
            card_size_choice: "Standard".to_string(),
            cards: BTreeMap::new(),
        }
    }
}

impl ProjectData {
    fn resolved(mut self, root: &Path) -> Self {
        for path in self.paths_mut() {
            *path = root.join(&*path);
        }
        self
    }

    fn relative_to(mut self, root: &Path) -> Self {
        for path in self.paths_mut() {
            if let Ok(relative) = path.strip_prefix(root) {
                *path = relative.to_path_buf();
            }
        }
        self
    }

    fn paths_mut(&mut self) -> [&mut PathBuf; 4] {
        [
            &mut self.image_dir,
            &mut self.crop_dir,
            &mut self.uncrop_dir,
            &mut self.image_cache,
        ]
    }
}

pub struct Project {
    root: PathBuf,
    pub data: ProjectData,
    previews: Previews,
    fallback: Option<ImagePreview>,
}

impl Project {
    /// A project at `root` with `data`, whose relative paths are resolved
    /// against `root`.
    pub fn new(root: impl Into<PathBuf>, data: ProjectData) -> Self {
        let root = root.into();
        Self {
            data: data.resolved(&root),
            root,
            previews: Previews::new(),
            fallback: None,
        }
    }

    /// Load `project.json` from `root`, or start from defaults if absent.
    pub fn load(root: impl Into<PathBuf>) -> Result<Self, ProjectError> {
        let root = root.into();
        let path = root.join(PROJECT_FILENAME);
        let data = if path.exists() {
            serde_json::from_str(&fs::read_to_string(&path)?)?
        } else {
            ProjectData::default()
        };
        Ok(Self::new(root, data))
    }

    pub fn save(&self) -> Result<(), ProjectError> {
        let data = self.data.clone().relative_to(&self.root);
        fs::create_dir_all(&self.root)?;
        fs::write(
            self.root.join(PROJECT_FILENAME),
            serde_json::to_string_pretty(&data)?,
        )?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Load previews, sync the card list with the image directory, and make
    /// sure the output folders and the preview cache exist.
    pub fn init(&mut self, config: &Config, backend: &dyn ImageBackend) -> Result<(), ProjectError> {
        self.previews = preview_cache::read_previews(&self.data.image_cache);
        self.init_properties(config);
        self.ensure_output_folders()?;
        if !self.data.image_cache.exists() {
            preview_cache::write_previews(&self.data.image_cache, &self.previews)?;
        }

        let fallback = self.root.join(&config.fallback_name);
        self.fallback = if fallback.exists() {
            match backend.read(&fallback) {
                Ok(image) => Some(ImagePreview::uniform(image)),
                Err(e) => {
                    warn!(path = %fallback.display(), error = %e, "could not read fallback image");
                    None
                }
            }
        } else {
            None
        };

        info!(
            cards = self.data.cards.len(),
            previews = self.previews.len(),
            "project initialized"
        );
        Ok(())
    }

    /// Add cards for new files and drop cards whose source is gone.
    pub fn init_properties(&mut self, config: &Config) {
        let fallback = Path::new(&config.fallback_name);
        let files: Vec<PathBuf> = list_card_files(&self.data.image_dir)
            .into_iter()
            .filter(|name| name != fallback)
            .collect();

        for name in &files {
            if !self.data.cards.contains_key(name) {
                self.data
                    .cards
                    .insert(name.clone(), CardInfo::for_new_file(name));
            }
        }

        self.data.cards.retain(|name, info| {
            let keep = files.contains(name)
                || info.external_path.as_ref().is_some_and(|p| p.exists());
            if !keep {
                debug!(card = %name.display(), "dropping card without source");
            }
            keep
        });
        let cards = &self.data.cards;
        self.previews.retain(|name, _| cards.contains_key(name));
    }

    pub fn ensure_output_folders(&self) -> Result<(), ProjectError> {
        fs::create_dir_all(&self.data.crop_dir)?;
        fs::create_dir_all(&self.data.uncrop_dir)?;
        Ok(())
    }

    pub fn cards(&self) -> &BTreeMap<PathBuf, CardInfo> {
        &self.data.cards
    }

    pub fn card(&self, name: &Path) -> Option<&CardInfo> {
        self.data.cards.get(name)
    }

    /// Names to print, each repeated by its count. Hidden cards are skipped.
    pub fn print_list(&self) -> Vec<&Path> {
        self.data
            .cards
            .iter()
            .filter(|(_, info)| info.is_visible())
            .flat_map(|(name, info)| std::iter::repeat_n(name.as_path(), info.num as usize))
            .collect()
    }

    pub fn card_added(&mut self, name: &Path) {
        match self.data.cards.get_mut(name) {
            None => {
                self.data
                    .cards
                    .insert(name.to_path_buf(), CardInfo::for_new_file(name));
            }
            Some(info) if info.transient => {
                info.hidden = info.hidden.saturating_sub(1);
                info.transient = false;
            }
            Some(_) => {}
        }
    }

    /// Hide the card until its file comes back. Count and overrides are kept.
    pub fn card_removed(&mut self, name: &Path) {
        if let Some(info) = self.data.cards.get_mut(name) {
            info.hidden += 1;
            info.transient = true;
        }
    }

    pub fn card_renamed(&mut self, old: &Path, new: &Path) {
        if let Some(info) = self.data.cards.remove(old) {
            self.data.cards.insert(new.to_path_buf(), info.renamed(new));
        }
        if let Some(preview) = self.previews.remove(old) {
            self.previews.insert(new.to_path_buf(), preview);
        }
    }

    pub fn set_card_count(&mut self, name: &Path, num: u32) -> bool {
        match self.data.cards.get_mut(name) {
            Some(info) => {
                info.num = num.min(MAX_CARD_COUNT);
                true
            }
            None => false,
        }
    }

    pub fn has_preview(&self, name: &Path) -> bool {
        self.previews.contains_key(name)
    }

    /// The card's preview, or the fallback while none exists.
    pub fn preview(&self, name: &Path) -> Option<&ImagePreview> {
        self.previews.get(name).or(self.fallback.as_ref())
    }

    pub fn previews(&self) -> &Previews {
        &self.previews
    }

    pub fn has_bad_aspect_ratio(&self, name: &Path) -> bool {
        self.previews
            .get(name)
            .is_some_and(|preview| preview.bad_aspect_ratio)
    }

    pub fn has_bad_rotation(&self, name: &Path) -> bool {
        self.previews
            .get(name)
            .is_some_and(|preview| preview.bad_rotation)
    }

    pub fn set_preview(&mut self, name: &Path, preview: ImagePreview) {
        self.previews.insert(name.to_path_buf(), preview);
    }

    /// Persist previews once a burst of work has finished.
    pub fn cropper_done(&self) -> Result<(), ProjectError> {
        preview_cache::write_previews(&self.data.image_cache, &self.previews)?;
        Ok(())
    }

    /// Forget previews, e.g. after the image directory moved.
    pub fn clear_previews(&mut self) {
        self.previews.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::backend::tests::MockBackend;
    use crate::imaging::raster::tests::gradient;
    use tempfile::TempDir;

    fn project_with_files(files: &[&str]) -> (TempDir, Project) {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("images")).unwrap();
        for file in files {
            fs::write(tmp.path().join("images").join(file), b"card").unwrap();
        }
        let project = Project::load(tmp.path()).unwrap();
        (tmp, project)
    }

    fn init(project: &mut Project) {
        project
            .init(&Config::default(), &MockBackend::with_source(gradient(10, 14)))
            .unwrap();
    }

    // =========================================================================
    // Init
    // =========================================================================

    #[test]
    fn init_empty_project_writes_empty_cache() {
        let (tmp, mut project) = project_with_files(&[]);
        init(&mut project);

        assert!(project.cards().is_empty());
        assert!(tmp.path().join("images/crop").is_dir());
        assert!(tmp.path().join("images/uncrop").is_dir());
        let cache = tmp.path().join("images/crop/preview.cache");
        assert!(cache.is_file());
        assert!(preview_cache::read_previews(&cache).is_empty());
    }

    #[test]
    fn init_discovers_cards_and_hides_double_underscore() {
        let (_tmp, mut project) = project_with_files(&["a.png", "__back.png", "readme.txt"]);
        init(&mut project);

        assert_eq!(project.cards().len(), 2);
        assert_eq!(project.card(Path::new("a.png")).unwrap().num, 1);
        let back = project.card(Path::new("__back.png")).unwrap();
        assert_eq!((back.num, back.hidden), (0, 1));
        assert_eq!(project.print_list(), vec![Path::new("a.png")]);
    }

    #[test]
    fn init_skips_fallback_image() {
        let (tmp, mut project) = project_with_files(&["a.png", "fallback.png"]);
        fs::copy(
            tmp.path().join("images/fallback.png"),
            tmp.path().join("fallback.png"),
        )
        .unwrap();
        init(&mut project);

        assert!(project.card(Path::new("fallback.png")).is_none());
        // No preview yet, so the fallback stands in
        assert!(project.preview(Path::new("a.png")).is_some());
        assert!(!project.has_preview(Path::new("a.png")));
    }

    #[test]
    fn init_drops_stale_cards_and_previews() {
        let (_tmp, mut project) = project_with_files(&["a.png"]);
        project
            .data
            .cards
            .insert(PathBuf::from("gone.png"), CardInfo::default());
        project.set_preview(Path::new("gone.png"), ImagePreview::uniform(gradient(4, 4)));
        init(&mut project);

        assert!(project.card(Path::new("gone.png")).is_none());
        assert!(!project.has_preview(Path::new("gone.png")));
    }

    #[test]
    fn init_keeps_existing_external_cards() {
        let (tmp, mut project) = project_with_files(&[]);
        let external = tmp.path().join("elsewhere.png");
        fs::write(&external, b"card").unwrap();
        project.data.cards.insert(
            PathBuf::from("elsewhere.png"),
            CardInfo {
                external_path: Some(external),
                ..CardInfo::default()
            },
        );
        init(&mut project);
        assert!(project.card(Path::new("elsewhere.png")).is_some());
    }

    // =========================================================================
    // Card events
    // =========================================================================

    #[test]
    fn removed_then_added_restores_visibility() {
        let (_tmp, mut project) = project_with_files(&["a.png"]);
        init(&mut project);
        project.set_card_count(Path::new("a.png"), 3);

        project.card_removed(Path::new("a.png"));
        assert!(!project.card(Path::new("a.png")).unwrap().is_visible());
        assert!(project.print_list().is_empty());

        project.card_added(Path::new("a.png"));
        let info = project.card(Path::new("a.png")).unwrap();
        assert!(info.is_visible());
        assert!(!info.transient);
        assert_eq!(info.num, 3);
    }

    #[test]
    fn added_twice_keeps_count() {
        let (_tmp, mut project) = project_with_files(&[]);
        project.card_added(Path::new("a.png"));
        project.set_card_count(Path::new("a.png"), 2);
        project.card_added(Path::new("a.png"));
        assert_eq!(project.card(Path::new("a.png")).unwrap().num, 2);
    }

    #[test]
    fn renamed_moves_info_and_preview() {
        let (_tmp, mut project) = project_with_files(&[]);
        project.card_added(Path::new("a.png"));
        project.set_card_count(Path::new("a.png"), 5);
        project.set_preview(Path::new("a.png"), ImagePreview::uniform(gradient(4, 4)));

        project.card_renamed(Path::new("a.png"), Path::new("b.png"));
        assert!(project.card(Path::new("a.png")).is_none());
        assert_eq!(project.card(Path::new("b.png")).unwrap().num, 5);
        assert!(project.has_preview(Path::new("b.png")));
        assert!(!project.has_preview(Path::new("a.png")));
    }

    #[test]
    fn renamed_external_card_follows_its_file() {
        let (tmp, mut project) = project_with_files(&[]);
        let downloads = tmp.path().join("downloads");
        project.data.cards.insert(
            PathBuf::from("x.png"),
            CardInfo {
                rotation: Rotation::Rotate90,
                external_path: Some(downloads.join("x.png")),
                ..CardInfo::default()
            },
        );

        project.card_renamed(Path::new("x.png"), Path::new("y.png"));
        let info = project.card(Path::new("y.png")).unwrap();
        assert_eq!(info.external_path.as_deref(), Some(downloads.join("y.png").as_path()));
        assert_eq!(info.rotation, Rotation::Rotate90);
    }

    #[test]
    fn card_count_is_clamped() {
        let (_tmp, mut project) = project_with_files(&[]);
        project.card_added(Path::new("a.png"));
        assert!(project.set_card_count(Path::new("a.png"), 5000));
        assert_eq!(project.card(Path::new("a.png")).unwrap().num, MAX_CARD_COUNT);
        assert!(!project.set_card_count(Path::new("missing.png"), 1));
    }

    #[test]
    fn preview_flags() {
        let (_tmp, mut project) = project_with_files(&[]);
        let mut preview = ImagePreview::uniform(gradient(4, 4));
        preview.bad_aspect_ratio = true;
        project.set_preview(Path::new("a.png"), preview);
        assert!(project.has_bad_aspect_ratio(Path::new("a.png")));
        assert!(!project.has_bad_rotation(Path::new("a.png")));
        assert!(!project.has_bad_aspect_ratio(Path::new("b.png")));
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    #[test]
    fn save_and_load_keeps_relative_paths() {
        let (tmp, mut project) = project_with_files(&[]);
        project.data.bleed_edge = Length::mm(1.0);
        project.card_added(Path::new("a.png"));
        project.data.cards.get_mut(Path::new("a.png")).unwrap().rotation = Rotation::Rotate90;
        project.save().unwrap();

        let raw = fs::read_to_string(tmp.path().join(PROJECT_FILENAME)).unwrap();
        assert!(raw.contains("\"images/crop\""));
        assert!(!raw.contains(&tmp.path().display().to_string()));
        assert!(!raw.contains("transient"));

        let loaded = Project::load(tmp.path()).unwrap();
        assert_eq!(loaded.data.crop_dir, tmp.path().join("images/crop"));
        assert_eq!(
            loaded.card(Path::new("a.png")).unwrap().rotation,
            Rotation::Rotate90
        );
        assert!((loaded.data.bleed_edge.as_mm() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn partial_project_file_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join(PROJECT_FILENAME),
            r#"{ "cards": { "a.png": { "num": 2 } } }"#,
        )
        .unwrap();
        let project = Project::load(tmp.path()).unwrap();
        assert_eq!(project.data.image_dir, tmp.path().join("images"));
        let info = project.card(Path::new("a.png")).unwrap();
        assert_eq!(info.num, 2);
        assert_eq!(info.bleed_type, BleedType::Infer);
    }

    #[test]
    fn unknown_project_key_is_rejected() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(PROJECT_FILENAME), r#"{ "imagedir": "x" }"#).unwrap();
        assert!(matches!(
            Project::load(tmp.path()),
            Err(ProjectError::Json(_))
        ));
    }

    #[test]
    fn cropper_done_persists_previews() {
        let (tmp, mut project) = project_with_files(&["a.png"]);
        init(&mut project);
        project.set_preview(Path::new("a.png"), ImagePreview::uniform(gradient(8, 11)));
        project.cropper_done().unwrap();

        let cache = preview_cache::read_previews(&tmp.path().join("images/crop/preview.cache"));
        assert_eq!(cache.len(), 1);

        // A fresh project picks the previews back up
        let mut reopened = Project::load(tmp.path()).unwrap();
        init(&mut reopened);
        assert!(reopened.has_preview(Path::new("a.png")));
    }
}
