//! The crop/preview scheduler.
//!
//! The [`Cropper`] owns one map of live crop work and one of live preview
//! work, each keyed by card name, so at most one item of each kind exists
//! per card. Items run on a shared [`WorkPool`]; crops outrank previews.
//!
//! ## Events
//!
//! Every item's conclusion feeds a per-kind progress tracker. The first
//! item issued in a burst emits `CropWorkStart` / `PreviewWorkStart`. When
//! everything issued has concluded, a timer is armed; if nothing new was
//! issued by the time it fires, the burst ends with a single
//! `CropWorkDone` / `PreviewWorkDone` and the tracker resets. Crop bursts
//! also report `CropProgress(done / issued)` along the way. Failed items
//! count as done like any other; the failure is logged by the item.
//!
//! ## Settings
//!
//! The scheduler keeps its own copy of the project data and config. The
//! `*_changed_diff` methods update that copy only; re-requesting the
//! affected cards is the card provider's job. A work item snapshots the copy
//! when it is created, so callers pause, update, re-request, then restart.
//! Re-requesting a card whose item has not started yet replaces that item,
//! so the new snapshot wins.

use crate::config::Config;
use crate::database::{DatabaseError, ImageDataBase, db_path};
use crate::imaging::{ColorCubeLookup, ImageBackend, Rotation};
use crate::project::{CardInfo, ProjectData};
use crate::scan::variant_dirs;
use crate::units::Length;
use crate::work::{
    CardOverrides, Conclusion, CropWork, CropperWork, ImagePreview, PreviewSink, PreviewWork,
    Priority, State, WorkBody, WorkCounters, WorkPool, WorkSettings,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Error, Debug)]
pub enum CropperError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
}

#[derive(Debug, Clone)]
pub enum CropperEvent {
    CropWorkStart,
    /// Fraction of the current crop burst that has concluded.
    CropProgress(f32),
    CropWorkDone,
    PreviewWorkStart,
    PreviewWorkDone,
    PreviewUpdated {
        name: PathBuf,
        preview: ImagePreview,
        rotation: Rotation,
    },
}

pub type CropperSink = Arc<dyn Fn(CropperEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    Crop,
    Preview,
}

impl WorkKind {
    fn index(self) -> usize {
        match self {
            WorkKind::Crop => 0,
            WorkKind::Preview => 1,
        }
    }

    fn priority(self) -> Priority {
        match self {
            WorkKind::Crop => Priority::Crop,
            WorkKind::Preview => Priority::Preview,
        }
    }
}

/// Items issued and concluded in the current burst.
#[derive(Debug, Default, Clone, Copy)]
struct Progress {
    issued: usize,
    done: usize,
}

impl Progress {
    fn caught_up(&self) -> bool {
        self.done >= self.issued
    }
}

enum TimerMsg {
    Arm(WorkKind),
    Stop,
}

struct Settings {
    data: ProjectData,
    config: Config,
}

struct DataBaseSlot {
    path: PathBuf,
    db: Arc<ImageDataBase>,
}

type WorkMap = Mutex<HashMap<PathBuf, Arc<CropperWork>>>;

struct CropperInner {
    settings: RwLock<Settings>,
    database: RwLock<DataBaseSlot>,
    loaded_previews: Mutex<HashSet<PathBuf>>,
    backend: Arc<dyn ImageBackend>,
    color_cubes: ColorCubeLookup,
    pool: Arc<WorkPool>,
    counters: Arc<WorkCounters>,
    works: [WorkMap; 2],
    progress: Mutex<[Progress; 2]>,
    idle: Condvar,
    timer: Sender<TimerMsg>,
    sink: CropperSink,
    started: AtomicBool,
}

pub struct Cropper {
    inner: Arc<CropperInner>,
    timer_thread: Option<JoinHandle<()>>,
}

impl Cropper {
    /// Build a scheduler with `threads` workers. The image database is read
    /// from the crop directory; `loaded_previews` names the cards that
    /// already have a preview (the others get a forced preview).
    pub fn new(
        data: ProjectData,
        config: Config,
        loaded_previews: impl IntoIterator<Item = PathBuf>,
        threads: usize,
        backend: Arc<dyn ImageBackend>,
        color_cubes: ColorCubeLookup,
        sink: CropperSink,
    ) -> Result<Self, CropperError> {
        let path = db_path(&data.crop_dir);
        let db = Arc::new(ImageDataBase::read(&path));
        let debounce = config.pipeline.idle_debounce();
        let (timer, timer_rx) = crossbeam_channel::unbounded();

        let inner = Arc::new(CropperInner {
            settings: RwLock::new(Settings { data, config }),
            database: RwLock::new(DataBaseSlot { path, db }),
            loaded_previews: Mutex::new(loaded_previews.into_iter().collect()),
            backend,
            color_cubes,
            pool: Arc::new(WorkPool::new(threads)?),
            counters: Arc::new(WorkCounters::default()),
            works: [Mutex::new(HashMap::new()), Mutex::new(HashMap::new())],
            progress: Mutex::new([Progress::default(); 2]),
            idle: Condvar::new(),
            timer,
            sink,
            started: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        let timer_thread = std::thread::Builder::new()
            .name("cropper-timer".into())
            .spawn(move || timer_loop(weak, timer_rx, debounce))?;

        Ok(Self {
            inner,
            timer_thread: Some(timer_thread),
        })
    }

    /// Begin running work. Items requested before this are submitted now.
    pub fn start(&self) {
        self.inner.started.store(true, Ordering::Release);
        let pending = self.inner.all_works();
        debug!(pending = pending.len(), "cropper started");
        for work in pending {
            work.start();
        }
    }

    pub fn card_added(&self, name: &Path, needs_crop: bool, needs_preview: bool) {
        self.inner.request(name, needs_crop, needs_preview);
    }

    /// Cancel the card's work and delete its outputs in every variant
    /// directory and in the uncrop directory.
    pub fn card_removed(&self, name: &Path) {
        self.inner.remove_work(name);
        let (crop_dir, uncrop_dir) = self.inner.dirs();
        let db = self.inner.database();

        for dir in variant_dirs(&crop_dir, name) {
            let file = dir.join(name);
            match fs::remove_file(&file) {
                Ok(()) => debug!(path = %file.display(), "removed output"),
                Err(e) => warn!(path = %file.display(), error = %e, "could not remove output"),
            }
            db.remove_entry(&file);
        }
        let uncropped = uncrop_dir.join(name);
        if uncropped.is_file() {
            if let Err(e) = fs::remove_file(&uncropped) {
                warn!(path = %uncropped.display(), error = %e, "could not remove uncropped image");
            }
        }
        db.remove_entry(&uncropped);

        self.inner.lock_previews().remove(name);
    }

    /// Cancel work under `old`, move its outputs (and their cache entries)
    /// to `new`, then request `new`. Moved outputs are found current and
    /// skipped; anything the cancelled work never wrote is produced fresh.
    pub fn card_renamed(&self, old: &Path, new: &Path) {
        self.inner.remove_work(old);
        let (crop_dir, uncrop_dir) = self.inner.dirs();
        let source_dir = {
            let mut settings = self.inner.write_settings();
            let cards = &mut settings.data.cards;
            let info = cards.remove(old).map(|info| info.renamed(new));
            let external_dir = info
                .as_ref()
                .and_then(|info| info.external_path.as_deref())
                .and_then(Path::parent)
                .map(Path::to_path_buf);
            if let Some(info) = info {
                cards.insert(new.to_path_buf(), info);
            }
            external_dir.unwrap_or_else(|| settings.data.image_dir.clone())
        };
        let db = self.inner.database();

        let mut moves: Vec<(PathBuf, PathBuf)> = variant_dirs(&crop_dir, old)
            .into_iter()
            .map(|dir| (dir.join(old), dir.join(new)))
            .collect();
        if uncrop_dir.join(old).is_file() {
            moves.push((uncrop_dir.join(old), uncrop_dir.join(new)));
        }
        for (from, to) in moves {
            match fs::rename(&from, &to) {
                Ok(()) => db.move_entry(&from, &to),
                Err(e) => warn!(from = %from.display(), to = %to.display(), error = %e, "could not rename output"),
            }
        }
        db.move_entry(
            &source_dir.join(old).with_extension("prev"),
            &source_dir.join(new).with_extension("prev"),
        );

        {
            let mut previews = self.inner.lock_previews();
            if previews.remove(old) {
                previews.insert(new.to_path_buf());
            }
        }
        self.inner.request(new, true, true);
    }

    pub fn card_modified(&self, name: &Path) {
        self.inner.request(name, true, true);
    }

    /// Stop new attempts from starting and wait until nothing is running.
    pub fn pause_work(&self) {
        let counters = &self.inner.counters;
        counters.set_paused(true);
        for work in self.inner.all_works() {
            work.pause();
        }
        while counters.running() > 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        debug!("cropper paused");
    }

    pub fn restart_work(&self) {
        self.inner.counters.set_paused(false);
        for work in self.inner.all_works() {
            work.unpause();
        }
        debug!("cropper restarted");
    }

    pub fn is_paused(&self) -> bool {
        self.inner.counters.is_paused()
    }

    // -------------------------------------------------------------------------
    // Settings updates
    // -------------------------------------------------------------------------

    /// Replace all project data. Live work is cancelled, the database of the
    /// old crop directory is flushed and the new one loaded.
    pub fn new_project_opened_diff(
        &self,
        data: ProjectData,
        loaded_previews: impl IntoIterator<Item = PathBuf>,
    ) {
        self.inner.cancel_all();
        self.inner.swap_database(&data.crop_dir);
        *self.inner.lock_previews() = loaded_previews.into_iter().collect();
        self.inner.write_settings().data = data;
    }

    pub fn image_dir_changed_diff(
        &self,
        image_dir: &Path,
        crop_dir: &Path,
        uncrop_dir: &Path,
        loaded_previews: impl IntoIterator<Item = PathBuf>,
    ) {
        self.inner.cancel_all();
        self.inner.swap_database(crop_dir);
        *self.inner.lock_previews() = loaded_previews.into_iter().collect();
        let mut settings = self.inner.write_settings();
        settings.data.image_dir = image_dir.to_path_buf();
        settings.data.crop_dir = crop_dir.to_path_buf();
        settings.data.uncrop_dir = uncrop_dir.to_path_buf();
    }

    pub fn card_size_changed_diff(&self, card_size_choice: &str) {
        self.inner.write_settings().data.card_size_choice = card_size_choice.to_string();
    }

    pub fn bleed_changed_diff(&self, bleed_edge: Length) {
        self.inner.write_settings().data.bleed_edge = bleed_edge;
    }

    pub fn enable_uncrop_changed_diff(&self, enable_uncrop: bool) {
        self.inner.write_settings().config.enable_uncrop = enable_uncrop;
    }

    pub fn enable_fancy_uncrop_changed_diff(&self, enable_fancy_uncrop: bool) {
        self.inner.write_settings().config.enable_fancy_uncrop = enable_fancy_uncrop;
    }

    pub fn color_cube_changed_diff(&self, color_cube: &str) {
        self.inner.write_settings().config.color_cube = color_cube.to_string();
    }

    pub fn base_preview_width_changed_diff(&self, base_preview_width: u32) {
        self.inner.write_settings().config.base_preview_width = base_preview_width;
    }

    pub fn max_dpi_changed_diff(&self, max_dpi: f32) {
        self.inner.write_settings().config.max_dpi = max_dpi;
    }

    /// Per-card overrides for work created from now on.
    pub fn card_info_changed_diff(&self, name: &Path, info: CardInfo) {
        self.inner
            .write_settings()
            .data
            .cards
            .insert(name.to_path_buf(), info);
    }

    /// Forget the card's overrides, so a later file of the same name is read
    /// from the image directory.
    pub fn card_info_removed_diff(&self, name: &Path) {
        self.inner.write_settings().data.cards.remove(name);
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// Live (not yet concluded) items of `kind` for `name`.
    pub fn has_work(&self, kind: WorkKind, name: &Path) -> bool {
        self.inner.lock_works(kind).contains_key(name)
    }

    pub fn live_work(&self, kind: WorkKind) -> usize {
        self.inner.lock_works(kind).len()
    }

    pub fn database(&self) -> Arc<ImageDataBase> {
        self.inner.database()
    }

    /// Block until every issued item has concluded, or `timeout` passes.
    /// Returns whether the scheduler went idle.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut progress = self.inner.lock_progress();
        while !progress.iter().all(Progress::caught_up) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            progress = self
                .inner
                .idle
                .wait_timeout(progress, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    pub fn flush_database(&self) -> Result<(), CropperError> {
        self.inner.flush_database()
    }
}

impl Drop for Cropper {
    fn drop(&mut self) {
        let works = self.inner.all_works();
        debug!(outstanding = works.len(), "cropper shutting down");
        for work in &works {
            work.cancel();
        }
        drop(works);
        while self.inner.counters.alive() > 0 {
            std::thread::sleep(Duration::from_millis(1));
        }

        let _ = self.inner.timer.send(TimerMsg::Stop);
        if let Some(handle) = self.timer_thread.take() {
            let _ = handle.join();
        }
        if let Err(e) = self.inner.flush_database() {
            warn!(error = %e, "could not write image database");
        }
    }
}

impl CropperInner {
    fn request(self: &Arc<Self>, name: &Path, needs_crop: bool, needs_preview: bool) {
        if !needs_crop && !needs_preview {
            return;
        }
        let (settings, overrides) = {
            let s = self.read_settings();
            (
                Arc::new(WorkSettings::snapshot(&s.data, &s.config)),
                s.data
                    .cards
                    .get(name)
                    .map(CardOverrides::from)
                    .unwrap_or_default(),
            )
        };
        let db = self.database();

        if needs_crop {
            let body = CropWork {
                name: name.to_path_buf(),
                overrides: overrides.clone(),
                settings: Arc::clone(&settings),
                db: Arc::clone(&db),
                backend: Arc::clone(&self.backend),
                color_cubes: Arc::clone(&self.color_cubes),
            };
            self.push_work(WorkKind::Crop, name, Box::new(body));
        }
        if needs_preview {
            let body = PreviewWork {
                name: name.to_path_buf(),
                overrides,
                force: !self.lock_previews().contains(name),
                settings,
                db,
                backend: Arc::clone(&self.backend),
                sink: self.preview_sink(),
            };
            self.push_work(WorkKind::Preview, name, Box::new(body));
        }
    }

    /// Insert a new item for `name` unless one is already running. A live
    /// item that has not started running is replaced and cancelled.
    fn push_work(self: &Arc<Self>, kind: WorkKind, name: &Path, body: Box<dyn WorkBody>) {
        let mut works = self.lock_works(kind);
        if works
            .get(name)
            .is_some_and(|existing| existing.state() == State::Running)
        {
            trace!(card = %name.display(), kind = ?kind, "coalesced with running work");
            return;
        }
        let superseded = works.remove(name);

        let work = CropperWork::new(
            name.to_path_buf(),
            kind.priority(),
            body,
            Arc::clone(&self.pool),
            Arc::clone(&self.counters),
            self.finished_callback(kind),
        );
        works.insert(name.to_path_buf(), Arc::clone(&work));
        let start_event = self.issue(kind);
        drop(works);

        if let Some(old) = superseded {
            trace!(card = %name.display(), kind = ?kind, "superseded queued work");
            old.cancel();
        }
        if let Some(event) = start_event {
            (self.sink)(event);
        }
        if self.started.load(Ordering::Acquire) {
            work.start();
        }
    }

    fn remove_work(&self, name: &Path) {
        for kind in [WorkKind::Crop, WorkKind::Preview] {
            let removed = self.lock_works(kind).remove(name);
            if let Some(work) = removed {
                work.cancel();
            }
        }
    }

    fn cancel_all(&self) {
        for kind in [WorkKind::Crop, WorkKind::Preview] {
            let drained: Vec<_> = self.lock_works(kind).drain().map(|(_, work)| work).collect();
            for work in drained {
                work.cancel();
            }
        }
    }

    fn issue(&self, kind: WorkKind) -> Option<CropperEvent> {
        let mut progress = self.lock_progress();
        let p = &mut progress[kind.index()];
        let first = p.issued == 0;
        p.issued += 1;
        first.then(|| match kind {
            WorkKind::Crop => CropperEvent::CropWorkStart,
            WorkKind::Preview => CropperEvent::PreviewWorkStart,
        })
    }

    fn work_finished(&self, kind: WorkKind, id: u64, name: &Path, conclusion: Conclusion) {
        {
            let mut works = self.lock_works(kind);
            if works.get(name).is_some_and(|work| work.id() == id) {
                works.remove(name);
            }
        }
        trace!(card = %name.display(), kind = ?kind, conclusion = ?conclusion, "work concluded");

        let progress_event = {
            let mut progress = self.lock_progress();
            let p = &mut progress[kind.index()];
            p.done += 1;
            if p.caught_up() {
                let _ = self.timer.send(TimerMsg::Arm(kind));
                None
            } else if kind == WorkKind::Crop {
                Some(CropperEvent::CropProgress(p.done as f32 / p.issued as f32))
            } else {
                None
            }
        };
        self.idle.notify_all();
        if let Some(event) = progress_event {
            (self.sink)(event);
        }
    }

    /// Called by the timer once the debounce after catching up has passed.
    fn idle_elapsed(&self, kind: WorkKind) {
        let done = {
            let mut progress = self.lock_progress();
            let p = &mut progress[kind.index()];
            if p.issued > 0 && p.caught_up() {
                info!(kind = ?kind, items = p.issued, "work burst done");
                *p = Progress::default();
                true
            } else {
                false
            }
        };
        if !done {
            return;
        }
        if let Err(e) = self.flush_database() {
            warn!(error = %e, "could not write image database");
        }
        (self.sink)(match kind {
            WorkKind::Crop => CropperEvent::CropWorkDone,
            WorkKind::Preview => CropperEvent::PreviewWorkDone,
        });
    }

    fn finished_callback(self: &Arc<Self>, kind: WorkKind) -> crate::work::FinishedCallback {
        let weak = Arc::downgrade(self);
        Box::new(move |id, name, conclusion| {
            if let Some(inner) = weak.upgrade() {
                inner.work_finished(kind, id, name, conclusion);
            }
        })
    }

    fn preview_sink(self: &Arc<Self>) -> PreviewSink {
        let weak = Arc::downgrade(self);
        Arc::new(move |name: &Path, preview, rotation| {
            if let Some(inner) = weak.upgrade() {
                inner.lock_previews().insert(name.to_path_buf());
                (inner.sink)(CropperEvent::PreviewUpdated {
                    name: name.to_path_buf(),
                    preview,
                    rotation,
                });
            }
        })
    }

    fn all_works(&self) -> Vec<Arc<CropperWork>> {
        self.works
            .iter()
            .flat_map(|map| {
                map.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .values()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn dirs(&self) -> (PathBuf, PathBuf) {
        let s = self.read_settings();
        (s.data.crop_dir.clone(), s.data.uncrop_dir.clone())
    }

    fn database(&self) -> Arc<ImageDataBase> {
        Arc::clone(
            &self
                .database
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .db,
        )
    }

    fn flush_database(&self) -> Result<(), CropperError> {
        let slot = self.database.read().unwrap_or_else(PoisonError::into_inner);
        slot.db.write(&slot.path)?;
        Ok(())
    }

    /// Write the current database and load the one belonging to `crop_dir`.
    fn swap_database(&self, crop_dir: &Path) {
        let path = db_path(crop_dir);
        let mut slot = self.database.write().unwrap_or_else(PoisonError::into_inner);
        if slot.path == path {
            return;
        }
        if let Err(e) = slot.db.write(&slot.path) {
            warn!(path = %slot.path.display(), error = %e, "could not write image database");
        }
        *slot = DataBaseSlot {
            db: Arc::new(ImageDataBase::read(&path)),
            path,
        };
    }

    fn read_settings(&self) -> RwLockReadGuard<'_, Settings> {
        self.settings.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_settings(&self) -> std::sync::RwLockWriteGuard<'_, Settings> {
        self.settings.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_works(&self, kind: WorkKind) -> MutexGuard<'_, HashMap<PathBuf, Arc<CropperWork>>> {
        self.works[kind.index()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_progress(&self) -> MutexGuard<'_, [Progress; 2]> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_previews(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.loaded_previews
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Debounce timer. Each `Arm` pushes that kind's deadline out by `debounce`.
fn timer_loop(inner: Weak<CropperInner>, rx: Receiver<TimerMsg>, debounce: Duration) {
    let mut deadlines: [Option<Instant>; 2] = [None, None];
    loop {
        let next = deadlines.iter().flatten().min().copied();
        let msg = match next {
            Some(deadline) => rx.recv_deadline(deadline),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match msg {
            Ok(TimerMsg::Arm(kind)) => {
                deadlines[kind.index()] = Some(Instant::now() + debounce);
            }
            Ok(TimerMsg::Stop) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {
                let now = Instant::now();
                for kind in [WorkKind::Crop, WorkKind::Preview] {
                    let slot = &mut deadlines[kind.index()];
                    if slot.is_some_and(|d| d <= now) {
                        *slot = None;
                        match inner.upgrade() {
                            Some(inner) => inner.idle_elapsed(kind),
                            None => return,
                        }
                    }
                }
            }
        }
    }
}
