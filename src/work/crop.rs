//! Crop work: one card's final, print-ready image.
//!
//! 1. Skip if the database says the output is current.
//! 2. Read and rotate the source.
//! 3. Decide whether the source carries a bleed edge.
//! 4. Precropped: synthesize bleed into `<uncrop_dir>/<card>` (cached on its
//!    own entry, which ignores the density cap) or, with synthesis disabled,
//!    crop to the card alone.
//! 5. Crop to card + bleed edge, capped at `max_dpi`.
//! 6. Color grade, write, record.

use super::{CardOverrides, Conclusion, WorkBody, WorkError, WorkSettings};
use crate::config::NO_COLOR_CUBE;
use crate::database::{ImageDataBase, ImageParameters};
use crate::imaging::{
    ColorCubeLookup, ImageBackend, Quality, SYNTHESIZED_BLEED_INCHES, crop_image,
    fix_aspect_ratio, has_bleed, uncrop_image,
};
use crate::units::Length;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Quality for crop and uncrop outputs; these feed a print.
const OUTPUT_QUALITY: u32 = 100;

pub struct CropWork {
    pub name: PathBuf,
    pub overrides: CardOverrides,
    pub settings: Arc<WorkSettings>,
    pub db: Arc<ImageDataBase>,
    pub backend: Arc<dyn ImageBackend>,
    pub color_cubes: ColorCubeLookup,
}

impl CropWork {
    fn params(&self) -> ImageParameters {
        ImageParameters {
            dpi: self.settings.max_dpi,
            ..self.uncrop_params()
        }
    }

    /// Key of the uncrop intermediate: everything shaping it, no density cap.
    fn uncrop_params(&self) -> ImageParameters {
        ImageParameters {
            card_size: self.settings.card_size(),
            full_bleed_edge: self.settings.full_bleed(),
            rotation: self.overrides.rotation,
            bleed_type: self.overrides.bleed_type,
            bad_aspect_ratio: self.overrides.bad_aspect_ratio,
            uncrop: self.settings.uncrop_mode(),
            ..ImageParameters::default()
        }
    }
}

impl WorkBody for CropWork {
    fn run(&self) -> Result<Conclusion, WorkError> {
        let s = &self.settings;
        let card_size = s.card_size();
        let full_bleed = s.full_bleed();
        let card_ratio = card_size.aspect_ratio();
        let full_bleed_ratio = s.card_size_with_full_bleed().aspect_ratio();

        let input_file = self.overrides.source(s, &self.name);
        let output_file = s.output_dir().join(&self.name);
        let params = self.params();

        let color_cube = if s.color_cube == NO_COLOR_CUBE {
            None
        } else {
            Some(
                (self.color_cubes)(&s.color_cube)
                    .ok_or_else(|| WorkError::MissingColorCube(s.color_cube.clone()))?,
            )
        };

        let input_hash = self.db.test_entry(&output_file, &input_file, &params)?;
        if input_hash.is_empty() {
            return Ok(Conclusion::Skipped);
        }

        let source = self.backend.read(&input_file)?.rotate(self.overrides.rotation);
        let precropped = !has_bleed(
            source.aspect_ratio(),
            card_ratio,
            full_bleed_ratio,
            self.overrides.bleed_type,
        );

        let (prepared, available_bleed) = if !precropped {
            let fixed = fix_aspect_ratio(&source, self.overrides.bad_aspect_ratio, full_bleed_ratio);
            (fixed, full_bleed)
        } else if let Some(border) = s.uncrop_mode().border() {
            let uncropped_file = s.uncrop_dir.join(&self.name);
            let uncrop_params = self.uncrop_params();
            let uncrop_hash = self.db.test_entry(&uncropped_file, &input_file, &uncrop_params)?;
            let uncropped = if uncrop_hash.is_empty() {
                debug!(card = %self.name.display(), "reusing uncropped intermediate");
                self.backend.read(&uncropped_file)?
            } else {
                let fixed = fix_aspect_ratio(&source, self.overrides.bad_aspect_ratio, card_ratio);
                let uncropped = uncrop_image(&fixed, &self.name, card_size, border);
                self.backend
                    .write(&uncropped, &uncropped_file, Quality::new(OUTPUT_QUALITY))?;
                self.db.put_entry(&uncropped_file, uncrop_hash, &uncrop_params);
                uncropped
            };
            (uncropped, Length::inches(SYNTHESIZED_BLEED_INCHES))
        } else {
            let fixed = fix_aspect_ratio(&source, self.overrides.bad_aspect_ratio, card_ratio);
            (fixed, Length::ZERO)
        };

        let cropped = crop_image(
            &prepared,
            &self.name,
            card_size,
            available_bleed,
            s.bleed_edge,
            s.max_dpi,
        );
        let graded = match &color_cube {
            Some(cube) => cropped.apply_color_cube(cube),
            None => cropped,
        };
        self.backend
            .write(&graded, &output_file, Quality::new(OUTPUT_QUALITY))?;
        self.db.put_entry(&output_file, input_hash, &params);

        Ok(Conclusion::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CardSizeInfo, Config};
    use crate::imaging::backend::tests::MockBackend;
    use crate::imaging::raster::tests::gradient;
    use crate::imaging::{BadAspectRatioHandling, BleedType, ColorCube, ColorCubes, Rotation};
    use crate::units::Size;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    struct Fixture {
        tmp: TempDir,
        backend: Arc<MockBackend>,
        db: Arc<ImageDataBase>,
        cubes: Arc<ColorCubes>,
    }

    impl Fixture {
        /// `source` is what every read of the card returns.
        fn new(source: crate::imaging::Image) -> Self {
            let tmp = TempDir::new().unwrap();
            fs::create_dir_all(tmp.path().join("images")).unwrap();
            fs::write(tmp.path().join("images/card.png"), b"card v1").unwrap();
            Self {
                backend: Arc::new(MockBackend::with_source(source)),
                db: Arc::new(ImageDataBase::new()),
                cubes: Arc::new(ColorCubes::new(tmp.path().join("cubes"))),
                tmp,
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

        fn work(&self, settings: WorkSettings, overrides: CardOverrides) -> CropWork {
            CropWork {
                name: PathBuf::from("card.png"),
                overrides,
                settings: Arc::new(settings),
                db: Arc::clone(&self.db),
                backend: Arc::clone(&self.backend) as Arc<dyn ImageBackend>,
                color_cubes: self.cubes.lookup(),
            }
        }

        /// Pretend the backend's writes landed on disk, as the database checks existence.
        fn touch_outputs(&self) {
            for (path, _, _) in self.backend.writes() {
                let path = Path::new(&path);
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                fs::write(path, b"out").unwrap();
            }
        }
    }

    fn full_bleed_source() -> crate::imaging::Image {
        // 2.72in x 3.70in at 100dpi
        gradient(272, 370)
    }

    fn precropped_source() -> crate::imaging::Image {
        gradient(248, 346)
    }

    #[test]
    fn full_bleed_source_is_cropped_to_card() {
        let f = Fixture::new(full_bleed_source());
        let work = f.work(f.settings(), CardOverrides::default());
        assert_eq!(work.run().unwrap(), Conclusion::Success);

        let writes = f.backend.writes();
        assert_eq!(writes.len(), 1);
        assert!(writes[0].0.ends_with("images/crop/card.png"));
        assert_eq!((writes[0].1, writes[0].2), (248, 346));
    }

    #[test]
    fn unchanged_source_is_skipped() {
        let f = Fixture::new(full_bleed_source());
        let work = f.work(f.settings(), CardOverrides::default());
        assert_eq!(work.run().unwrap(), Conclusion::Success);
        f.touch_outputs();

        assert_eq!(work.run().unwrap(), Conclusion::Skipped);
        assert_eq!(f.backend.writes().len(), 1);
    }

    #[test]
    fn changed_source_is_redone() {
        let f = Fixture::new(full_bleed_source());
        let work = f.work(f.settings(), CardOverrides::default());
        work.run().unwrap();
        f.touch_outputs();

        fs::write(f.tmp.path().join("images/card.png"), b"card v2").unwrap();
        assert_eq!(work.run().unwrap(), Conclusion::Success);
    }

    #[test]
    fn bleed_edge_nests_output_and_keeps_bleed() {
        let f = Fixture::new(full_bleed_source());
        let settings = WorkSettings {
            bleed_edge: Length::inches(0.06),
            ..f.settings()
        };
        let work = f.work(settings, CardOverrides::default());
        work.run().unwrap();

        let writes = f.backend.writes();
        let dir = format!("crop/{}/card.png", crate::imaging::bleed_dir_name(Length::inches(0.06)));
        assert!(writes[0].0.ends_with(&dir), "{:?}", writes[0].0);
        assert_eq!((writes[0].1, writes[0].2), (260, 358));
    }

    #[test]
    fn precropped_source_goes_through_uncrop() {
        let f = Fixture::new(precropped_source());
        let work = f.work(f.settings(), CardOverrides::default());
        assert_eq!(work.run().unwrap(), Conclusion::Success);

        let writes = f.backend.writes();
        assert_eq!(writes.len(), 2);
        assert!(writes[0].0.ends_with("images/uncrop/card.png"));
        assert_eq!((writes[0].1, writes[0].2), (272, 370));
        assert!(writes[1].0.ends_with("images/crop/card.png"));
        assert_eq!((writes[1].1, writes[1].2), (248, 346));
    }

    #[test]
    fn cached_uncrop_is_reused() {
        let f = Fixture::new(precropped_source());
        let work = f.work(f.settings(), CardOverrides::default());
        work.run().unwrap();
        f.touch_outputs();

        // Drop the final crop only; the intermediate stays valid
        fs::remove_file(f.tmp.path().join("images/crop/card.png")).unwrap();
        assert_eq!(work.run().unwrap(), Conclusion::Success);

        let writes = f.backend.writes();
        assert_eq!(writes.len(), 3);
        assert!(writes[2].0.ends_with("images/crop/card.png"));
    }

    #[test]
    fn disabled_uncrop_crops_card_only() {
        let f = Fixture::new(precropped_source());
        let settings = WorkSettings {
            enable_uncrop: false,
            bleed_edge: Length::mm(1.0),
            ..f.settings()
        };
        let work = f.work(settings, CardOverrides::default());
        work.run().unwrap();

        let writes = f.backend.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!((writes[0].1, writes[0].2), (248, 346));
    }

    #[test]
    fn uncrop_toggle_redoes_precropped_output() {
        let f = Fixture::new(precropped_source());
        let with_bleed = |enable_uncrop| WorkSettings {
            enable_uncrop,
            bleed_edge: Length::mm(1.0),
            ..f.settings()
        };
        let work = f.work(with_bleed(true), CardOverrides::default());
        assert_eq!(work.run().unwrap(), Conclusion::Success);
        f.touch_outputs();
        assert_eq!(f.backend.writes()[1].1, 256);

        let work = f.work(with_bleed(false), CardOverrides::default());
        assert_eq!(work.run().unwrap(), Conclusion::Success);
        let writes = f.backend.writes();
        assert_eq!(writes.len(), 3);
        assert_eq!((writes[2].1, writes[2].2), (248, 346));
    }

    #[test]
    fn fancy_uncrop_toggle_redoes_intermediate() {
        let f = Fixture::new(precropped_source());
        f.work(f.settings(), CardOverrides::default()).run().unwrap();
        f.touch_outputs();

        let settings = WorkSettings {
            enable_fancy_uncrop: false,
            ..f.settings()
        };
        assert_eq!(
            f.work(settings, CardOverrides::default()).run().unwrap(),
            Conclusion::Success
        );
        let writes = f.backend.writes();
        assert_eq!(writes.len(), 4);
        assert!(writes[2].0.ends_with("images/uncrop/card.png"));
    }

    #[test]
    fn max_dpi_change_keeps_intermediate() {
        let f = Fixture::new(precropped_source());
        f.work(f.settings(), CardOverrides::default()).run().unwrap();
        f.touch_outputs();

        let settings = WorkSettings {
            max_dpi: 50.0,
            ..f.settings()
        };
        assert_eq!(
            f.work(settings, CardOverrides::default()).run().unwrap(),
            Conclusion::Success
        );
        let writes = f.backend.writes();
        assert_eq!(writes.len(), 3);
        assert!(writes[2].0.ends_with("images/crop/card.png"));
        assert!(writes[2].1 < 248);
    }

    #[test]
    fn no_bleed_override_forces_uncrop() {
        let f = Fixture::new(full_bleed_source());
        let overrides = CardOverrides {
            bleed_type: BleedType::NoBleed,
            ..CardOverrides::default()
        };
        f.work(f.settings(), overrides).run().unwrap();
        assert!(f.backend.writes()[0].0.ends_with("images/uncrop/card.png"));
    }

    #[test]
    fn rotation_is_applied_before_measuring() {
        // Sideways full-bleed scan
        let f = Fixture::new(gradient(370, 272));
        let overrides = CardOverrides {
            rotation: Rotation::Rotate90,
            ..CardOverrides::default()
        };
        f.work(f.settings(), overrides).run().unwrap();
        let writes = f.backend.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!((writes[0].1, writes[0].2), (248, 346));
    }

    #[test]
    fn stretch_fixes_bad_aspect_before_crop() {
        // Full-bleed width, a bit too short
        let f = Fixture::new(gradient(272, 360));
        let overrides = CardOverrides {
            bleed_type: BleedType::FullBleed,
            bad_aspect_ratio: BadAspectRatioHandling::Stretch,
            ..CardOverrides::default()
        };
        f.work(f.settings(), overrides).run().unwrap();
        let (_, w, h) = f.backend.writes()[0].clone();
        let ratio = w as f32 / h as f32;
        let card = Size::new(Length::inches(2.48), Length::inches(3.46));
        assert!((ratio - card.aspect_ratio()).abs() < 0.01, "{w}x{h}");
    }

    #[test]
    fn color_cube_output_goes_to_cube_dir() {
        let f = Fixture::new(full_bleed_source());
        f.cubes.insert("Identity", ColorCube::identity(2));
        let settings = WorkSettings {
            color_cube: "Identity".to_string(),
            ..f.settings()
        };
        f.work(settings, CardOverrides::default()).run().unwrap();
        assert!(f.backend.writes()[0].0.ends_with("crop/Identity/card.png"));
    }

    #[test]
    fn missing_color_cube_is_an_error() {
        let f = Fixture::new(full_bleed_source());
        let settings = WorkSettings {
            color_cube: "Vibrance".to_string(),
            ..f.settings()
        };
        assert!(matches!(
            f.work(settings, CardOverrides::default()).run(),
            Err(WorkError::MissingColorCube(_))
        ));
    }

    #[test]
    fn missing_source_is_skipped() {
        let f = Fixture::new(full_bleed_source());
        fs::remove_file(f.tmp.path().join("images/card.png")).unwrap();
        let work = f.work(f.settings(), CardOverrides::default());
        assert_eq!(work.run().unwrap(), Conclusion::Skipped);
        assert_eq!(f.backend.reads(), 0);
    }

    #[test]
    fn read_failure_is_an_error() {
        let f = Fixture::new(full_bleed_source());
        let backend = Arc::new(MockBackend::failing(full_bleed_source(), 1));
        let work = CropWork {
            backend: backend as Arc<dyn ImageBackend>,
            ..f.work(f.settings(), CardOverrides::default())
        };
        assert!(matches!(work.run(), Err(WorkError::Backend(_))));
    }

    #[test]
    fn snapshot_uses_project_card_size() {
        let mut data = crate::project::ProjectData::default();
        data.card_size_choice = "Poker".to_string();
        let settings = WorkSettings::snapshot(&data, &Config::default());
        assert_eq!(settings.card.width, Length::inches(2.5));
    }
}
