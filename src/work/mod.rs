//! Units of work: cancelable, pausable, retried on failure.
//!
//! A [`CropperWork`] wraps a [`WorkBody`] (the crop or preview transform for
//! one card) with the lifecycle the scheduler relies on:
//!
//! ```text
//!            pause()              unpause()
//!   Waiting ─────────▶ Paused ─────────────▶ Waiting
//!      │                  │
//!      │ enter_run()      │ cancel()
//!      ▼                  ▼
//!   Running ──────▶ Finished(Success | Failure | Skipped | Cancelled)
//!      │
//!      └─ attempt failed ─▶ restart: Waiting (or Paused, or Cancelled
//!                           if a cancel arrived during the attempt)
//! ```
//!
//! Every work item concludes exactly once. A paused item that already holds
//! a pool thread parks on a condition variable, so pausing does not free
//! worker slots.

mod crop;
mod pool;
mod preview;

pub use crop::CropWork;
pub use pool::{Priority, WorkPool};
pub use preview::{ImagePreview, PreviewSink, PreviewWork};

use crate::config::{CardSizeInfo, Config};
use crate::database::DatabaseError;
use crate::imaging::{self, BackendError, BadAspectRatioHandling, BleedType, Rotation, UncropMode};
use crate::project::{CardInfo, ProjectData};
use crate::units::{Length, Size};
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

/// Attempts a work item gets before concluding `Failure`.
pub const MAX_ATTEMPTS: u32 = 5;

#[derive(Error, Debug)]
pub enum WorkError {
    #[error("image error: {0}")]
    Backend(#[from] BackendError),
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("color cube '{0}' is not available")]
    MissingColorCube(String),
    #[error("work panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Waiting,
    Running,
    Paused,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conclusion {
    Success,
    Failure,
    Skipped,
    Cancelled,
}

/// The transform a work item performs. Called once per attempt.
pub trait WorkBody: Send + Sync + 'static {
    fn run(&self) -> Result<Conclusion, WorkError>;
}

/// Counters shared by every work item of one scheduler.
#[derive(Debug, Default)]
pub struct WorkCounters {
    alive: AtomicUsize,
    running: AtomicUsize,
    paused: AtomicBool,
}

impl WorkCounters {
    /// Work items constructed and not yet dropped.
    pub fn alive(&self) -> usize {
        self.alive.load(Ordering::Acquire)
    }

    /// Work items inside an attempt right now.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// New and restarted items start paused while this is set.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }
}

/// Called once with the item's id, card name and conclusion.
pub type FinishedCallback = Box<dyn Fn(u64, &Path, Conclusion) + Send + Sync>;

static NEXT_WORK_ID: AtomicU64 = AtomicU64::new(1);

pub struct CropperWork {
    id: u64,
    name: PathBuf,
    priority: Priority,
    body: Box<dyn WorkBody>,
    state: Mutex<State>,
    unpaused: Condvar,
    cancel_requested: AtomicBool,
    submitted: AtomicBool,
    attempts: AtomicU32,
    conclusion: Mutex<Option<Conclusion>>,
    pool: Arc<WorkPool>,
    counters: Arc<WorkCounters>,
    on_finished: FinishedCallback,
}

impl std::fmt::Debug for CropperWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CropperWork")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("state", &self.state())
            .finish()
    }
}

impl CropperWork {
    pub fn new(
        name: PathBuf,
        priority: Priority,
        body: Box<dyn WorkBody>,
        pool: Arc<WorkPool>,
        counters: Arc<WorkCounters>,
        on_finished: FinishedCallback,
    ) -> Arc<Self> {
        counters.alive.fetch_add(1, Ordering::AcqRel);
        let initial = if counters.is_paused() {
            State::Paused
        } else {
            State::Waiting
        };
        Arc::new(Self {
            id: NEXT_WORK_ID.fetch_add(1, Ordering::Relaxed),
            name,
            priority,
            body,
            state: Mutex::new(initial),
            unpaused: Condvar::new(),
            cancel_requested: AtomicBool::new(false),
            submitted: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            conclusion: Mutex::new(None),
            pool,
            counters,
            on_finished,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &Path {
        &self.name
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn state(&self) -> State {
        *self.lock_state()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    /// `Some` once the item has concluded.
    pub fn conclusion(&self) -> Option<Conclusion> {
        *self
            .conclusion
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Submit to the pool at this item's priority. Only the first call
    /// submits; retries resubmit internally.
    pub fn start(self: &Arc<Self>) {
        if self.submitted.swap(true, Ordering::AcqRel) {
            return;
        }
        self.submit();
    }

    fn submit(self: &Arc<Self>) {
        let work = Arc::clone(self);
        self.pool.submit(self.priority, move || work.run());
    }

    /// Cancel the item. Waiting or paused items conclude `Cancelled` right
    /// away; a running item finishes its current attempt but does not retry.
    pub fn cancel(&self) {
        let mut state = self.lock_state();
        match *state {
            State::Waiting | State::Paused => {
                *state = State::Cancelled;
                drop(state);
                self.unpaused.notify_all();
                self.finish(Conclusion::Cancelled);
            }
            State::Running => {
                self.cancel_requested.store(true, Ordering::Release);
            }
            State::Cancelled => {}
        }
    }

    pub fn pause(&self) {
        let mut state = self.lock_state();
        if *state == State::Waiting {
            *state = State::Paused;
        }
    }

    pub fn unpause(&self) {
        let mut state = self.lock_state();
        if *state == State::Paused {
            *state = State::Waiting;
            drop(state);
            self.unpaused.notify_all();
        }
    }

    /// Gate every attempt passes. Returns `false` if the item was cancelled;
    /// blocks while paused; otherwise marks the item running.
    fn enter_run(&self) -> bool {
        let mut state = self.lock_state();
        loop {
            match *state {
                State::Cancelled => return false,
                State::Paused => {
                    trace!(card = %self.name.display(), "parked while paused");
                    state = self
                        .unpaused
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                State::Waiting | State::Running => {
                    *state = State::Running;
                    self.counters.running.fetch_add(1, Ordering::AcqRel);
                    return true;
                }
            }
        }
    }

    fn run(self: Arc<Self>) {
        if !self.enter_run() {
            // Cancelled while queued; `cancel` already concluded
            self.finish(Conclusion::Cancelled);
            return;
        }

        let attempt = self.attempts.fetch_add(1, Ordering::AcqRel) + 1;
        let result = catch_unwind(AssertUnwindSafe(|| self.body.run()))
            .unwrap_or_else(|payload| Err(WorkError::Panicked(panic_message(payload))));
        self.counters.running.fetch_sub(1, Ordering::AcqRel);

        match result {
            Ok(conclusion) => self.finish(conclusion),
            Err(e) if attempt < MAX_ATTEMPTS => {
                warn!(card = %self.name.display(), attempt, error = %e, "work attempt failed, retrying");
                self.restart();
            }
            Err(e) => {
                error!(card = %self.name.display(), attempts = attempt, error = %e, "work failed");
                self.finish(Conclusion::Failure);
            }
        }
    }

    /// Put the item back in the queue after a failed attempt.
    fn restart(self: &Arc<Self>) {
        let mut state = self.lock_state();
        if self.cancel_requested.load(Ordering::Acquire) {
            *state = State::Cancelled;
            drop(state);
            self.finish(Conclusion::Cancelled);
            return;
        }
        *state = if self.counters.is_paused() {
            State::Paused
        } else {
            State::Waiting
        };
        drop(state);
        self.submit();
    }

    fn finish(&self, conclusion: Conclusion) {
        {
            let mut slot = self
                .conclusion
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return;
            }
            *slot = Some(conclusion);
        }
        debug!(card = %self.name.display(), priority = ?self.priority, conclusion = ?conclusion, "work finished");
        (self.on_finished)(self.id, &self.name, conclusion);
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for CropperWork {
    fn drop(&mut self) {
        self.counters.alive.fetch_sub(1, Ordering::AcqRel);
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Immutable snapshot of the project and config fields a work item reads.
///
/// Taken when the item is constructed so later configuration changes never
/// race an in-flight transform.
#[derive(Debug, Clone)]
pub struct WorkSettings {
    pub image_dir: PathBuf,
    pub crop_dir: PathBuf,
    pub uncrop_dir: PathBuf,
    pub bleed_edge: Length,
    pub card: CardSizeInfo,
    pub max_dpi: f32,
    pub base_preview_width: u32,
    pub color_cube: String,
    pub enable_uncrop: bool,
    pub enable_fancy_uncrop: bool,
}

impl WorkSettings {
    pub fn snapshot(data: &ProjectData, config: &Config) -> Self {
        Self {
            image_dir: data.image_dir.clone(),
            crop_dir: data.crop_dir.clone(),
            uncrop_dir: data.uncrop_dir.clone(),
            bleed_edge: data.bleed_edge,
            card: config.card_size_info(&data.card_size_choice),
            max_dpi: config.max_dpi,
            base_preview_width: config.base_preview_width,
            color_cube: config.color_cube.clone(),
            enable_uncrop: config.enable_uncrop,
            enable_fancy_uncrop: config.enable_fancy_uncrop,
        }
    }

    pub fn card_size(&self) -> Size {
        self.card.card_size()
    }

    pub fn full_bleed(&self) -> Length {
        self.card.full_bleed()
    }

    pub fn card_size_with_full_bleed(&self) -> Size {
        self.card.card_size_with_full_bleed()
    }

    pub fn uncrop_mode(&self) -> UncropMode {
        UncropMode::new(self.enable_uncrop, self.enable_fancy_uncrop)
    }

    /// Where final crops go for the current bleed and color cube.
    pub fn output_dir(&self) -> PathBuf {
        imaging::output_dir(&self.crop_dir, self.bleed_edge, &self.color_cube)
    }
}

/// Per-card overrides captured with the snapshot.
#[derive(Debug, Clone, Default)]
pub struct CardOverrides {
    pub rotation: Rotation,
    pub bleed_type: BleedType,
    pub bad_aspect_ratio: BadAspectRatioHandling,
    /// Source outside the image directory.
    pub external_path: Option<PathBuf>,
}

impl From<&CardInfo> for CardOverrides {
    fn from(info: &CardInfo) -> Self {
        Self {
            rotation: info.rotation,
            bleed_type: info.bleed_type,
            bad_aspect_ratio: info.bad_aspect_ratio_handling,
            external_path: info.external_path.clone(),
        }
    }
}

impl CardOverrides {
    /// Source file for card `name`.
    pub fn source(&self, settings: &WorkSettings, name: &Path) -> PathBuf {
        self.external_path
            .clone()
            .unwrap_or_else(|| settings.image_dir.join(name))
    }
}
