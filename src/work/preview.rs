//! Preview work: the small cropped/uncropped pair shown for a card.
//!
//! Previews are never written to disk by the work item itself. The pair is
//! handed to a [`PreviewSink`] and the project keeps it in the preview
//! cache. The database entry is keyed on `<source>.prev` with
//! `will_write_output = false`, so only source and parameter changes
//! invalidate it.

use super::{CardOverrides, Conclusion, WorkBody, WorkError, WorkSettings};
use crate::database::{ImageDataBase, ImageParameters, hash_file};
use crate::imaging::{
    BadAspectRatioHandling, BorderMode, Image, ImageBackend, Rotation, UncropMode, crop_image,
    fix_aspect_ratio, has_bleed, looks_rotated, preview_cropped_size, preview_uncropped_size,
    uncrop_image,
};
use crate::units::Length;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Ratio difference above which a source counts as mismatched.
const BAD_ASPECT_RATIO_TOLERANCE: f32 = 0.01;
/// Ratio difference below which a source counts as sideways.
const BAD_ROTATION_TOLERANCE: f32 = 0.01;
/// Density cap when cropping a preview; previews are far below it.
const PREVIEW_MAX_DPI: f32 = 1200.0;

#[derive(Debug, Clone)]
pub struct ImagePreview {
    pub cropped: Image,
    pub uncropped: Image,
    pub bad_aspect_ratio: bool,
    pub bad_rotation: bool,
}

impl ImagePreview {
    /// The same image for both halves, no warnings. Used for the fallback.
    pub fn uniform(image: Image) -> Self {
        Self {
            cropped: image.clone(),
            uncropped: image,
            bad_aspect_ratio: false,
            bad_rotation: false,
        }
    }
}

/// Receives `(card name, preview, rotation)` when a preview is produced.
pub type PreviewSink = Arc<dyn Fn(&Path, ImagePreview, Rotation) + Send + Sync>;

pub struct PreviewWork {
    pub name: PathBuf,
    pub overrides: CardOverrides,
    /// Regenerate even when the database says the preview is current.
    pub force: bool,
    pub settings: Arc<WorkSettings>,
    pub db: Arc<ImageDataBase>,
    pub backend: Arc<dyn ImageBackend>,
    pub sink: PreviewSink,
}

impl PreviewWork {
    fn build(&self, source: &Image) -> ImagePreview {
        let s = &self.settings;
        let card_size = s.card_size();
        let full_bleed_size = s.card_size_with_full_bleed();
        let card_ratio = card_size.aspect_ratio();
        let full_bleed_ratio = full_bleed_size.aspect_ratio();
        let handling = self.overrides.bad_aspect_ratio;
        let mode = BorderMode::for_uncrop(s.enable_fancy_uncrop);

        let ratio = source.aspect_ratio();
        let with_bleed_diff = (ratio - full_bleed_ratio).abs();
        let without_bleed_diff = (ratio - card_ratio).abs();
        let bad_rotation = looks_rotated(ratio, card_ratio, full_bleed_ratio, BAD_ROTATION_TOLERANCE);
        let fixes_aspect = handling != BadAspectRatioHandling::Ignore;

        let uncropped_size = preview_uncropped_size(s.base_preview_width, card_ratio);

        if has_bleed(ratio, card_ratio, full_bleed_ratio, self.overrides.bleed_type) {
            let fixed = fix_aspect_ratio(source, handling, full_bleed_ratio);
            let uncropped = fixed.resize(uncropped_size.0, uncropped_size.1);
            let cropped = crop_image(
                &uncropped,
                &self.name,
                card_size,
                s.full_bleed(),
                Length::ZERO,
                PREVIEW_MAX_DPI,
            );
            ImagePreview {
                cropped,
                uncropped,
                bad_aspect_ratio: !fixes_aspect && with_bleed_diff > BAD_ASPECT_RATIO_TOLERANCE,
                bad_rotation,
            }
        } else {
            let (w, h) = preview_cropped_size(uncropped_size, full_bleed_size);
            let fixed = fix_aspect_ratio(source, handling, card_ratio);
            let cropped = fixed.resize(w, h);
            let uncropped = uncrop_image(&cropped, &self.name, card_size, mode);
            ImagePreview {
                cropped,
                uncropped,
                bad_aspect_ratio: !fixes_aspect && without_bleed_diff > BAD_ASPECT_RATIO_TOLERANCE,
                bad_rotation,
            }
        }
    }
}

impl WorkBody for PreviewWork {
    fn run(&self) -> Result<Conclusion, WorkError> {
        let s = &self.settings;
        let input_file = self.overrides.source(s, &self.name);
        if !input_file.exists() {
            return Ok(Conclusion::Success);
        }

        let cache_key = input_file.with_extension("prev");
        let params = ImageParameters {
            width: s.base_preview_width,
            card_size: s.card_size(),
            full_bleed_edge: s.full_bleed(),
            rotation: self.overrides.rotation,
            bleed_type: self.overrides.bleed_type,
            bad_aspect_ratio: self.overrides.bad_aspect_ratio,
            // The uncropped half is always synthesized for display
            uncrop: UncropMode::new(true, s.enable_fancy_uncrop),
            will_write_output: false,
            ..ImageParameters::default()
        };

        let mut input_hash = self.db.test_entry(&cache_key, &input_file, &params)?;
        if input_hash.is_empty() {
            if !self.force {
                return Ok(Conclusion::Skipped);
            }
            input_hash = hash_file(&input_file)?;
        }

        let source = self.backend.read(&input_file)?.rotate(self.overrides.rotation);
        let preview = self.build(&source);

        self.db.put_entry(&cache_key, input_hash, &params);
        (self.sink)(&self.name, preview, self.overrides.rotation);
        Ok(Conclusion::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CardSizeInfo, NO_COLOR_CUBE};
    use crate::imaging::BleedType;
    use crate::imaging::backend::tests::MockBackend;
    use crate::imaging::raster::tests::gradient;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    type Received = Arc<Mutex<Vec<(PathBuf, ImagePreview, Rotation)>>>;

    struct Fixture {
        tmp: TempDir,
        backend: Arc<MockBackend>,
        db: Arc<ImageDataBase>,
        received: Received,
    }

    impl Fixture {
        fn new(source: Image) -> Self {
            let tmp = TempDir::new().unwrap();
            fs::create_dir_all(tmp.path().join("images")).unwrap();
            fs::write(tmp.path().join("images/card.png"), b"card").unwrap();
            Self {
                tmp,
                backend: Arc::new(MockBackend::with_source(source)),
                db: Arc::new(ImageDataBase::new()),
                received: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn settings(&self) -> WorkSettings {
            WorkSettings {
                image_dir: self.tmp.path().join("images"),
                crop_dir: self.tmp.path().join("images/crop"),
                uncrop_dir: self.tmp.path().join("images/uncrop"),
                bleed_edge: Length::ZERO,
                card: CardSizeInfo::standard(),
                max_dpi: 1200.0,
                base_preview_width: 248,
                color_cube: NO_COLOR_CUBE.to_string(),
                enable_uncrop: true,
                enable_fancy_uncrop: true,
            }
        }

        fn work(&self, overrides: CardOverrides, force: bool) -> PreviewWork {
            self.work_with(self.settings(), overrides, force)
        }

        fn work_with(
            &self,
            settings: WorkSettings,
            overrides: CardOverrides,
            force: bool,
        ) -> PreviewWork {
            let received = Arc::clone(&self.received);
            PreviewWork {
                name: PathBuf::from("card.png"),
                overrides,
                force,
                settings: Arc::new(settings),
                db: Arc::clone(&self.db),
                backend: Arc::clone(&self.backend) as Arc<dyn ImageBackend>,
                sink: Arc::new(move |name: &Path, preview, rotation| {
                    received
                        .lock()
                        .unwrap()
                        .push((name.to_path_buf(), preview, rotation));
                }),
            }
        }

        fn last(&self) -> ImagePreview {
            self.received.lock().unwrap().last().unwrap().1.clone()
        }
    }

    #[test]
    fn full_bleed_source_preview_sizes() {
        let f = Fixture::new(gradient(544, 740));
        assert_eq!(f.work(CardOverrides::default(), false).run().unwrap(), Conclusion::Success);

        let preview = f.last();
        assert_eq!(preview.uncropped.size(), (248, 346));
        assert!(preview.cropped.width() < 248);
        assert!(!preview.bad_aspect_ratio);
        assert!(!preview.bad_rotation);
        // Nothing written to disk
        assert!(f.backend.writes().is_empty());
    }

    #[test]
    fn precropped_source_preview_sizes() {
        let f = Fixture::new(gradient(496, 692));
        f.work(CardOverrides::default(), false).run().unwrap();

        let preview = f.last();
        assert_eq!(preview.cropped.size(), (226, 324));
        assert_eq!(preview.uncropped.size(), (248, 346));
    }

    #[test]
    fn second_run_is_skipped_unless_forced() {
        let f = Fixture::new(gradient(544, 740));
        f.work(CardOverrides::default(), false).run().unwrap();
        assert_eq!(
            f.work(CardOverrides::default(), false).run().unwrap(),
            Conclusion::Skipped
        );
        assert_eq!(
            f.work(CardOverrides::default(), true).run().unwrap(),
            Conclusion::Success
        );
        assert_eq!(f.received.lock().unwrap().len(), 2);
    }

    #[test]
    fn rotation_change_invalidates() {
        let f = Fixture::new(gradient(544, 740));
        f.work(CardOverrides::default(), false).run().unwrap();
        let rotated = CardOverrides {
            rotation: Rotation::Rotate180,
            ..CardOverrides::default()
        };
        assert_eq!(f.work(rotated, false).run().unwrap(), Conclusion::Success);
        assert_eq!(f.received.lock().unwrap()[1].2, Rotation::Rotate180);
    }

    #[test]
    fn border_fill_change_invalidates() {
        let f = Fixture::new(gradient(496, 692));
        f.work(CardOverrides::default(), false).run().unwrap();

        let black = WorkSettings {
            enable_fancy_uncrop: false,
            ..f.settings()
        };
        assert_eq!(
            f.work_with(black, CardOverrides::default(), false).run().unwrap(),
            Conclusion::Success
        );
        // The preview never depends on whether crops synthesize bleed
        let no_uncrop = WorkSettings {
            enable_uncrop: false,
            enable_fancy_uncrop: false,
            ..f.settings()
        };
        assert_eq!(
            f.work_with(no_uncrop, CardOverrides::default(), false).run().unwrap(),
            Conclusion::Skipped
        );
    }

    #[test]
    fn square_source_is_bad_aspect() {
        let f = Fixture::new(gradient(300, 300));
        f.work(CardOverrides::default(), false).run().unwrap();
        assert!(f.last().bad_aspect_ratio);
    }

    #[test]
    fn expand_clears_bad_aspect() {
        let f = Fixture::new(gradient(300, 300));
        let overrides = CardOverrides {
            bad_aspect_ratio: BadAspectRatioHandling::Expand,
            ..CardOverrides::default()
        };
        f.work(overrides, false).run().unwrap();
        assert!(!f.last().bad_aspect_ratio);
    }

    #[test]
    fn sideways_source_is_bad_rotation() {
        let f = Fixture::new(gradient(740, 544));
        f.work(CardOverrides::default(), false).run().unwrap();
        assert!(f.last().bad_rotation);
    }

    #[test]
    fn forced_bleed_type_picks_branch() {
        let f = Fixture::new(gradient(544, 740));
        let overrides = CardOverrides {
            bleed_type: BleedType::NoBleed,
            ..CardOverrides::default()
        };
        f.work(overrides, false).run().unwrap();
        // Precropped branch resizes straight to the cropped size
        assert_eq!(f.last().cropped.size(), (226, 324));
        assert!(f.last().bad_aspect_ratio);
    }

    #[test]
    fn missing_source_succeeds_without_preview() {
        let f = Fixture::new(gradient(10, 10));
        fs::remove_file(f.tmp.path().join("images/card.png")).unwrap();
        assert_eq!(
            f.work(CardOverrides::default(), false).run().unwrap(),
            Conclusion::Success
        );
        assert!(f.received.lock().unwrap().is_empty());
        assert_eq!(f.backend.reads(), 0);
    }
}
