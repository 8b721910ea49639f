//! Wiring of card provider, cropper and project.
//!
//! Both producers hand their events to one router thread through a
//! crossbeam channel. The router applies card events to the project and the
//! cropper, and cropper events to the project, in the order they were
//! emitted. Every routed event is also forwarded to an optional outgoing
//! channel for display.
//!
//! ```text
//! CardProvider ──CardEvent──┐
//!                           ├──► router ──► Project
//! Cropper ─────CropperEvent─┘       │  └──► Cropper
//!                                   └─────► outgoing (CLI)
//! ```
//!
//! ## Reconfiguration
//!
//! Setters pause the cropper so no item runs against stale settings, update
//! project and config, hand the new values to the cropper, let the provider
//! re-request whatever the change affects, wait for the router to turn those
//! requests into work, and restart.

use crate::card_provider::{CardEvent, CardProvider, CardSink, WatchError};
use crate::config::{Config, effective_threads};
use crate::cropper::{Cropper, CropperError, CropperEvent, CropperSink};
use crate::imaging::{BadAspectRatioHandling, BleedType, ColorCubes, ImageBackend, Rotation};
use crate::project::{CardInfo, Project, ProjectError};
use crate::units::Length;
use crossbeam_channel::{Receiver, Sender};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("project error: {0}")]
    Project(#[from] ProjectError),
    #[error("cropper error: {0}")]
    Cropper(#[from] CropperError),
    #[error("watch error: {0}")]
    Watch(#[from] WatchError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown card: {0}")]
    UnknownCard(PathBuf),
    #[error("pipeline is shut down")]
    Closed,
}

/// Everything the router saw, in routing order.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Card(CardEvent),
    Cropper(CropperEvent),
}

enum RouterMsg {
    Card(CardEvent),
    Cropper(CropperEvent),
    /// Acknowledged once everything queued before it has been routed.
    Barrier(Sender<()>),
    Stop,
}

/// Crop and preview bursts currently between their start and done events.
#[derive(Default)]
struct Bursts {
    crop: bool,
    preview: bool,
}

type BurstState = Arc<(Mutex<Bursts>, Condvar)>;

struct Router {
    cropper: Weak<Cropper>,
    project: Arc<Mutex<Project>>,
    bursts: BurstState,
    outgoing: Option<Sender<PipelineEvent>>,
    fallback: PathBuf,
}

impl Router {
    fn run(self, rx: Receiver<RouterMsg>) {
        for msg in rx {
            match msg {
                RouterMsg::Card(event) => {
                    self.card(&event);
                    self.forward(PipelineEvent::Card(event));
                }
                RouterMsg::Cropper(event) => {
                    self.cropper_event(&event);
                    self.forward(PipelineEvent::Cropper(event));
                }
                RouterMsg::Barrier(ack) => {
                    let _ = ack.send(());
                }
                RouterMsg::Stop => break,
            }
        }
        debug!("router stopped");
    }

    fn card(&self, event: &CardEvent) {
        trace!(event = ?event, "routing card event");
        let cropper = self.cropper.upgrade();
        match event {
            CardEvent::Added {
                name,
                needs_crop,
                needs_preview,
            } => {
                if *name == self.fallback {
                    return;
                }
                self.lock_project().card_added(name);
                if let Some(cropper) = cropper {
                    cropper.card_added(name, *needs_crop, *needs_preview);
                }
            }
            CardEvent::Removed(name) => {
                self.lock_project().card_removed(name);
                if let Some(cropper) = cropper {
                    cropper.card_removed(name);
                }
            }
            CardEvent::Renamed { old, new } => {
                self.lock_project().card_renamed(old, new);
                if let Some(cropper) = cropper {
                    cropper.card_renamed(old, new);
                }
            }
            CardEvent::Modified(name) => {
                if let Some(cropper) = cropper {
                    cropper.card_modified(name);
                }
            }
        }
    }

    fn cropper_event(&self, event: &CropperEvent) {
        match event {
            CropperEvent::CropWorkStart => self.set_burst(|b| b.crop = true),
            CropperEvent::PreviewWorkStart => self.set_burst(|b| b.preview = true),
            CropperEvent::CropWorkDone | CropperEvent::PreviewWorkDone => {
                if let Err(e) = self.lock_project().cropper_done() {
                    warn!(error = %e, "could not write preview cache");
                }
                if matches!(event, CropperEvent::CropWorkDone) {
                    self.set_burst(|b| b.crop = false);
                } else {
                    self.set_burst(|b| b.preview = false);
                }
            }
            CropperEvent::CropProgress(_) => {}
            CropperEvent::PreviewUpdated { name, preview, .. } => {
                self.lock_project().set_preview(name, preview.clone());
            }
        }
    }

    fn set_burst(&self, update: impl FnOnce(&mut Bursts)) {
        let (lock, cvar) = &*self.bursts;
        update(&mut lock.lock().unwrap_or_else(PoisonError::into_inner));
        cvar.notify_all();
    }

    fn forward(&self, event: PipelineEvent) {
        if let Some(tx) = &self.outgoing {
            let _ = tx.send(event);
        }
    }

    fn lock_project(&self) -> MutexGuard<'_, Project> {
        self.project.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct Pipeline {
    project: Arc<Mutex<Project>>,
    config: Mutex<Config>,
    backend: Arc<dyn ImageBackend>,
    cropper: Option<Arc<Cropper>>,
    provider: Mutex<Option<CardProvider>>,
    router: Sender<RouterMsg>,
    router_thread: Option<JoinHandle<()>>,
    bursts: BurstState,
}

impl Pipeline {
    /// Load the project at `root`, initialize it and build the cropper and
    /// card provider. Nothing runs until [`start`](Self::start).
    pub fn open(
        root: &Path,
        config: Config,
        backend: Arc<dyn ImageBackend>,
        outgoing: Option<Sender<PipelineEvent>>,
    ) -> Result<Self, PipelineError> {
        let mut project = Project::load(root)?;
        project.init(&config, backend.as_ref())?;

        let (router, router_rx) = crossbeam_channel::unbounded();
        let cubes = Arc::new(ColorCubes::new(root.join(&config.cube_dir)));

        let cropper_tx = router.clone();
        let cropper_sink: CropperSink = Arc::new(move |event| {
            let _ = cropper_tx.send(RouterMsg::Cropper(event));
        });
        let threads = effective_threads(&config.processing);
        let cropper = Arc::new(Cropper::new(
            project.data.clone(),
            config.clone(),
            project.previews().keys().cloned(),
            threads,
            Arc::clone(&backend),
            cubes.lookup(),
            cropper_sink,
        )?);

        let provider_tx = router.clone();
        let provider_sink: CardSink = Arc::new(move |event| {
            let _ = provider_tx.send(RouterMsg::Card(event));
        });
        let provider = CardProvider::new(&project.data, provider_sink);

        let project = Arc::new(Mutex::new(project));
        let bursts = BurstState::default();
        let state = Router {
            cropper: Arc::downgrade(&cropper),
            project: Arc::clone(&project),
            bursts: Arc::clone(&bursts),
            outgoing,
            fallback: PathBuf::from(&config.fallback_name),
        };
        let router_thread = std::thread::Builder::new()
            .name("pipeline-router".into())
            .spawn(move || state.run(router_rx))?;

        info!(root = %root.display(), threads, "pipeline opened");
        Ok(Self {
            project,
            config: Mutex::new(config),
            backend,
            cropper: Some(cropper),
            provider: Mutex::new(Some(provider)),
            router,
            router_thread: Some(router_thread),
            bursts,
        })
    }

    /// Scan the image directory, start watching it and start the cropper.
    pub fn start(&self) -> Result<(), PipelineError> {
        if let Some(provider) = self.lock_provider().as_mut() {
            provider.start()?;
        }
        if let Some(cropper) = &self.cropper {
            cropper.start();
        }
        Ok(())
    }

    pub fn project(&self) -> MutexGuard<'_, Project> {
        self.project.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> Config {
        self.lock_config().clone()
    }

    pub fn cropper(&self) -> Option<&Cropper> {
        self.cropper.as_deref()
    }

    /// Block until every routed request has been worked off and both bursts
    /// have announced they are done. Returns `false` on timeout.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        // The first barrier routes pending card events (which issue work);
        // the second routes the start events that issuing produced.
        self.sync();
        self.sync();

        let (lock, cvar) = &*self.bursts;
        let mut bursts = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while bursts.crop || bursts.preview {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            bursts = cvar
                .wait_timeout(bursts, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    // -------------------------------------------------------------------------
    // Configuration
    // -------------------------------------------------------------------------

    pub fn set_bleed_edge(&self, bleed_edge: Length) -> Result<(), PipelineError> {
        self.reconfigure(|pipeline, cropper| {
            pipeline.project().data.bleed_edge = bleed_edge;
            cropper.bleed_changed_diff(bleed_edge);
            pipeline.with_provider(CardProvider::bleed_changed);
        })
    }

    pub fn set_card_size(&self, card_size_choice: &str) -> Result<(), PipelineError> {
        self.reconfigure(|pipeline, cropper| {
            pipeline.project().data.card_size_choice = card_size_choice.to_string();
            cropper.card_size_changed_diff(card_size_choice);
            pipeline.with_provider(CardProvider::card_size_changed);
        })
    }

    pub fn set_color_cube(&self, color_cube: &str) -> Result<(), PipelineError> {
        self.reconfigure(|pipeline, cropper| {
            pipeline.lock_config().color_cube = color_cube.to_string();
            cropper.color_cube_changed_diff(color_cube);
            pipeline.with_provider(CardProvider::color_cube_changed);
        })
    }

    pub fn set_max_dpi(&self, max_dpi: f32) -> Result<(), PipelineError> {
        self.reconfigure(|pipeline, cropper| {
            pipeline.lock_config().max_dpi = max_dpi;
            cropper.max_dpi_changed_diff(max_dpi);
            pipeline.with_provider(CardProvider::max_dpi_changed);
        })
    }

    pub fn set_base_preview_width(&self, base_preview_width: u32) -> Result<(), PipelineError> {
        self.reconfigure(|pipeline, cropper| {
            pipeline.lock_config().base_preview_width = base_preview_width;
            cropper.base_preview_width_changed_diff(base_preview_width);
            pipeline.with_provider(CardProvider::base_preview_width_changed);
        })
    }

    pub fn set_enable_uncrop(&self, enable_uncrop: bool) -> Result<(), PipelineError> {
        self.reconfigure(|pipeline, cropper| {
            pipeline.lock_config().enable_uncrop = enable_uncrop;
            cropper.enable_uncrop_changed_diff(enable_uncrop);
            pipeline.with_provider(CardProvider::enable_uncrop_changed);
        })
    }

    pub fn set_enable_fancy_uncrop(&self, enable_fancy_uncrop: bool) -> Result<(), PipelineError> {
        self.reconfigure(|pipeline, cropper| {
            pipeline.lock_config().enable_fancy_uncrop = enable_fancy_uncrop;
            cropper.enable_fancy_uncrop_changed_diff(enable_fancy_uncrop);
            pipeline.with_provider(CardProvider::enable_uncrop_changed);
        })
    }

    /// Point the project at another image directory. Crop, uncrop and
    /// preview cache paths move along with it.
    pub fn set_image_dir(&self, image_dir: &Path) -> Result<(), PipelineError> {
        let config = self.config();
        self.reconfigure(|pipeline, cropper| -> Result<(), PipelineError> {
            let data = {
                let mut project = pipeline.project();
                if let Err(e) = project.cropper_done() {
                    warn!(error = %e, "could not write preview cache");
                }
                let image_dir = project.root().join(image_dir);
                project.data.crop_dir = image_dir.join("crop");
                project.data.uncrop_dir = image_dir.join("uncrop");
                project.data.image_cache = project.data.crop_dir.join("preview.cache");
                project.data.image_dir = image_dir;
                project.clear_previews();
                project.init(&config, pipeline.backend.as_ref())?;
                cropper.image_dir_changed_diff(
                    &project.data.image_dir,
                    &project.data.crop_dir,
                    &project.data.uncrop_dir,
                    project.previews().keys().cloned(),
                );
                project.data.clone()
            };
            if let Some(provider) = pipeline.lock_provider().as_mut() {
                provider.image_dir_changed(&data)?;
            }
            info!(image_dir = %data.image_dir.display(), "image directory changed");
            Ok(())
        })?
    }

    // -------------------------------------------------------------------------
    // Per-card overrides
    // -------------------------------------------------------------------------

    pub fn set_card_count(&self, name: &Path, num: u32) -> Result<(), PipelineError> {
        if self.project().set_card_count(name, num) {
            Ok(())
        } else {
            Err(PipelineError::UnknownCard(name.to_path_buf()))
        }
    }

    pub fn set_rotation(&self, name: &Path, rotation: Rotation) -> Result<(), PipelineError> {
        self.update_card(name, |info| info.rotation = rotation)
    }

    pub fn set_bleed_type(&self, name: &Path, bleed_type: BleedType) -> Result<(), PipelineError> {
        self.update_card(name, |info| info.bleed_type = bleed_type)
    }

    pub fn set_bad_aspect_ratio_handling(
        &self,
        name: &Path,
        handling: BadAspectRatioHandling,
    ) -> Result<(), PipelineError> {
        self.update_card(name, |info| info.bad_aspect_ratio_handling = handling)
    }

    /// Add a card whose source lives outside the image directory.
    pub fn register_external_card(&self, path: &Path) -> Result<(), PipelineError> {
        let name = path
            .file_name()
            .map(PathBuf::from)
            .ok_or_else(|| PipelineError::UnknownCard(path.to_path_buf()))?;
        let info = CardInfo {
            external_path: Some(path.to_path_buf()),
            ..CardInfo::for_new_file(&name)
        };
        self.project().data.cards.insert(name.clone(), info.clone());
        if let Some(cropper) = &self.cropper {
            cropper.card_info_changed_diff(&name, info);
        }
        if let Some(provider) = self.lock_provider().as_mut() {
            provider.register_external_card(path);
        }
        Ok(())
    }

    /// Drop an external card and its outputs.
    pub fn unregister_external_card(&self, path: &Path) {
        if let Some(provider) = self.lock_provider().as_mut() {
            provider.unregister_external_card(path);
        }
        self.sync();
        if let Some(name) = path.file_name().map(Path::new) {
            self.project().data.cards.remove(name);
            if let Some(cropper) = &self.cropper {
                cropper.card_info_removed_diff(name);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    /// Stop watching, cancel outstanding work, flush the image database and
    /// write the preview cache and `project.json`.
    pub fn shutdown(mut self) -> Result<(), PipelineError> {
        self.close()
    }

    fn close(&mut self) -> Result<(), PipelineError> {
        self.lock_provider().take();
        if let Some(cropper) = self.cropper.take() {
            drop(cropper);
            // The router may have held the last reference; once it is past
            // this barrier the cropper has flushed its database.
            self.sync();
        }
        if let Some(handle) = self.router_thread.take() {
            let _ = self.router.send(RouterMsg::Stop);
            let _ = handle.join();

            let project = self.project();
            project.cropper_done()?;
            project.save()?;
            info!(cards = project.cards().len(), "pipeline shut down");
        }
        Ok(())
    }

    fn reconfigure<R>(
        &self,
        apply: impl FnOnce(&Self, &Cropper) -> R,
    ) -> Result<R, PipelineError> {
        let cropper = self.cropper.as_deref().ok_or(PipelineError::Closed)?;
        cropper.pause_work();
        let result = apply(self, cropper);
        self.sync();
        cropper.restart_work();
        Ok(result)
    }

    fn update_card(
        &self,
        name: &Path,
        update: impl FnOnce(&mut CardInfo),
    ) -> Result<(), PipelineError> {
        self.reconfigure(|pipeline, cropper| -> Result<(), PipelineError> {
            let info = {
                let mut project = pipeline.project();
                let info = project
                    .data
                    .cards
                    .get_mut(name)
                    .ok_or_else(|| PipelineError::UnknownCard(name.to_path_buf()))?;
                update(info);
                info.clone()
            };
            cropper.card_info_changed_diff(name, info);
            cropper.card_modified(name);
            Ok(())
        })?
    }

    /// Wait until the router has handled everything queued so far.
    fn sync(&self) {
        let (ack, done) = crossbeam_channel::bounded(1);
        if self.router.send(RouterMsg::Barrier(ack)).is_ok() {
            let _ = done.recv();
        }
    }

    fn with_provider(&self, f: impl FnOnce(&CardProvider)) {
        if let Some(provider) = self.lock_provider().as_ref() {
            f(provider);
        }
    }

    fn lock_provider(&self) -> MutexGuard<'_, Option<CardProvider>> {
        self.provider.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_config(&self) -> MutexGuard<'_, Config> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "pipeline shutdown failed");
        }
    }
}
