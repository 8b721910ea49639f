//! Card enumeration and file-watch bridge.
//!
//! The provider is the only component that looks at the filesystem to find
//! cards. It turns the initial directory listing and every later `notify`
//! event into [`CardEvent`]s, so nothing downstream deals with watch
//! mechanics.
//!
//! ## Watches
//!
//! One [`Watch`] per observed directory. The project's image directory is
//! watched with [`WatchFiles::All`]: every supported image in it is a card.
//! A card whose source lives elsewhere (an external card) adds its file name
//! to a [`WatchFiles::Only`] watch on its parent directory. The watch goes
//! away with the last external card in that directory.
//!
//! ## Event mapping
//!
//! | notify event | action | card event |
//! |---|---|---|
//! | `Create(File)` | `Add` | `Added(name, crop, preview)` |
//! | `Remove(File)` | `Delete` | `Removed(name)` |
//! | `Modify(Data)` | `Modified` | `Modified(name)` |
//! | `Modify(Name(Both))`, same directory | `Moved` | `Renamed(old, new)` |
//! | `Modify(Name(Both))`, across directories | `Delete` + `Add` | |
//! | `Modify(Name(From))` with no `To` in time | `Delete` | `Removed(name)` |
//! | `Modify(Name(To))` with no `From` | `Add` | `Added(name, crop, preview)` |
//!
//! inotify reports a rename as a `From` half and a `To` half sharing a
//! tracker, followed by a combined `Both` event with the same tracker. The
//! watch thread runs every event through a [`RenameMatcher`], which holds a
//! `From` back for [`RENAME_WINDOW`] and turns it into one move when the
//! matching `To` or `Both` arrives. The other events of that tracker are
//! then dropped. A `From` nobody claims is a file moved out of the watched
//! directories; a lone `To` is one moved in.
//!
//! A rename from a non-image name to an image name (editors saving through
//! a temporary file) becomes an add, the reverse a removal.

use crate::imaging::is_supported_image;
use crate::project::ProjectData;
use crate::scan::list_card_files;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// How long the first half of a rename waits for its second half before it
/// counts as a move out of the watched directories.
pub const RENAME_WINDOW: Duration = Duration::from_millis(100);

/// Longest the watch thread sleeps between checks of its stop flag.
const WATCH_TICK: Duration = Duration::from_millis(250);

/// Paired trackers remembered while their remaining events are in flight.
const PAIRED_MEMORY: usize = 64;

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("watch error: {0}")]
    Notify(#[from] notify::Error),
    #[error("could not start watch thread: {0}")]
    Thread(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CardEvent {
    Added {
        name: PathBuf,
        needs_crop: bool,
        needs_preview: bool,
    },
    Removed(PathBuf),
    Renamed {
        old: PathBuf,
        new: PathBuf,
    },
    Modified(PathBuf),
}

pub type CardSink = Arc<dyn Fn(CardEvent) + Send + Sync>;

/// Which files of a watched directory are cards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchFiles {
    All,
    Only(BTreeSet<PathBuf>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watch {
    pub directory: PathBuf,
    pub files: WatchFiles,
}

impl Watch {
    fn tracks(&self, name: &Path) -> bool {
        match &self.files {
            WatchFiles::All => true,
            WatchFiles::Only(files) => files.contains(name),
        }
    }

    fn list(&self) -> Vec<PathBuf> {
        match &self.files {
            WatchFiles::All => list_card_files(&self.directory),
            WatchFiles::Only(files) => files
                .iter()
                .filter(|name| self.directory.join(name).is_file())
                .cloned()
                .collect(),
        }
    }
}

/// Primitive change reported for one file in one directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileAction {
    Add,
    Delete,
    Modified,
    Moved { old_filename: PathBuf },
}

struct Shared {
    watches: Mutex<Vec<Watch>>,
    sink: CardSink,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Vec<Watch>> {
        self.watches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: CardEvent) {
        trace!(event = ?event, "card event");
        (self.sink)(event);
    }

    fn handle_file_action(&self, dir: &Path, filename: &Path, action: FileAction) {
        let is_card = |name: &Path| name.extension().is_some() && is_supported_image(name);

        // Renames across the image/non-image boundary degrade to add or delete
        let action = match action {
            FileAction::Moved { old_filename } => match (is_card(&old_filename), is_card(filename)) {
                (true, true) => FileAction::Moved { old_filename },
                (false, true) => FileAction::Add,
                (true, false) => {
                    return self.handle_file_action(dir, &old_filename, FileAction::Delete);
                }
                (false, false) => return,
            },
            other if is_card(filename) => other,
            _ => return,
        };

        let event = {
            let mut watches = self.lock();
            let Some(watch) = watches.iter_mut().find(|w| same_dir(&w.directory, dir)) else {
                trace!(dir = %dir.display(), "event outside any watch");
                return;
            };
            match action {
                FileAction::Moved { old_filename } => {
                    if !watch.tracks(&old_filename) {
                        return;
                    }
                    if let WatchFiles::Only(files) = &mut watch.files {
                        files.remove(&old_filename);
                        files.insert(filename.to_path_buf());
                    }
                    CardEvent::Renamed {
                        old: old_filename,
                        new: filename.to_path_buf(),
                    }
                }
                _ if !watch.tracks(filename) => return,
                FileAction::Add => CardEvent::Added {
                    name: filename.to_path_buf(),
                    needs_crop: true,
                    needs_preview: true,
                },
                FileAction::Delete => CardEvent::Removed(filename.to_path_buf()),
                FileAction::Modified => CardEvent::Modified(filename.to_path_buf()),
            }
        };
        self.emit(event);
    }
}

pub struct CardProvider {
    shared: Arc<Shared>,
    watcher: Option<RecommendedWatcher>,
    watch_thread: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl CardProvider {
    pub fn new(data: &ProjectData, sink: CardSink) -> Self {
        Self {
            shared: Arc::new(Shared {
                watches: Mutex::new(watches_for(data)),
                sink,
            }),
            watcher: None,
            watch_thread: None,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Emit `Added` for every card on disk, then start watching. Calling it
    /// again re-emits without creating a second watcher.
    pub fn start(&mut self) -> Result<(), WatchError> {
        let files = self.list_files();
        debug!(cards = files.len(), "initial card scan");
        for name in files {
            self.shared.emit(CardEvent::Added {
                name,
                needs_crop: true,
                needs_preview: true,
            });
        }

        if self.watcher.is_none() {
            let (tx, rx) = crossbeam_channel::unbounded();
            let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
                let _ = tx.send(res);
            })?;
            for watch in self.watches() {
                watch_dir(&mut watcher, &watch.directory);
            }
            let shared = Arc::clone(&self.shared);
            let stop = Arc::clone(&self.stop);
            let handle = std::thread::Builder::new()
                .name("card-watch".into())
                .spawn(move || watch_loop(&shared, &rx, &stop))?;
            self.watcher = Some(watcher);
            self.watch_thread = Some(handle);
        }
        Ok(())
    }

    pub fn watches(&self) -> Vec<Watch> {
        self.shared.lock().clone()
    }

    /// Cards currently present across all watches.
    pub fn list_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = self.shared.lock().iter().flat_map(Watch::list).collect();
        files.sort();
        files.dedup();
        files
    }

    /// Feed one primitive action through the filters and emit the matching
    /// card event. The watcher calls this for every file notify reports.
    pub fn handle_file_action(&self, dir: &Path, filename: &Path, action: FileAction) {
        self.shared.handle_file_action(dir, filename, action);
    }

    /// Track a card whose source is `path`, outside the image directory.
    pub fn register_external_card(&mut self, path: &Path) {
        let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
            warn!(path = %path.display(), "external card has no file name");
            return;
        };
        let name = PathBuf::from(name);
        let new_dir = {
            let mut watches = self.shared.lock();
            match watches.iter_mut().find(|w| same_dir(&w.directory, dir)) {
                Some(watch) => {
                    if let WatchFiles::Only(files) = &mut watch.files {
                        files.insert(name.clone());
                    }
                    false
                }
                None => {
                    watches.push(Watch {
                        directory: dir.to_path_buf(),
                        files: WatchFiles::Only(BTreeSet::from([name.clone()])),
                    });
                    true
                }
            }
        };
        if new_dir {
            if let Some(watcher) = self.watcher.as_mut() {
                watch_dir(watcher, dir);
            }
        }
        self.shared.emit(CardEvent::Added {
            name,
            needs_crop: true,
            needs_preview: true,
        });
    }

    /// Stop tracking an external card. The directory's watch is dropped
    /// with its last file.
    pub fn unregister_external_card(&mut self, path: &Path) {
        let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
            return;
        };
        let name = PathBuf::from(name);
        let emptied = {
            let mut watches = self.shared.lock();
            let Some(index) = watches.iter().position(|w| same_dir(&w.directory, dir)) else {
                return;
            };
            let WatchFiles::Only(files) = &mut watches[index].files else {
                return;
            };
            if !files.remove(&name) {
                return;
            }
            if files.is_empty() {
                Some(watches.remove(index).directory)
            } else {
                None
            }
        };
        if let Some(dir) = emptied {
            debug!(dir = %dir.display(), "dropping watch");
            if let Some(watcher) = self.watcher.as_mut() {
                unwatch_dir(watcher, &dir);
            }
        }
        self.shared.emit(CardEvent::Removed(name));
    }

    pub fn new_project_opened(&mut self, data: &ProjectData) -> Result<(), WatchError> {
        self.image_dir_changed(data)
    }

    /// Replace every watch with those of `data` and re-emit all cards.
    pub fn image_dir_changed(&mut self, data: &ProjectData) -> Result<(), WatchError> {
        let old = std::mem::replace(&mut *self.shared.lock(), watches_for(data));
        if let Some(watcher) = self.watcher.as_mut() {
            for watch in &old {
                unwatch_dir(watcher, &watch.directory);
            }
            for watch in self.shared.lock().iter() {
                watch_dir(watcher, &watch.directory);
            }
        }
        self.start()
    }

    pub fn card_size_changed(&self) {
        self.reemit(true, true);
    }

    pub fn bleed_changed(&self) {
        self.reemit(true, false);
    }

    pub fn color_cube_changed(&self) {
        self.reemit(true, false);
    }

    pub fn max_dpi_changed(&self) {
        self.reemit(true, false);
    }

    pub fn base_preview_width_changed(&self) {
        self.reemit(false, true);
    }

    /// Uncrop settings change what precropped sources produce, both the
    /// crop and the uncropped preview.
    pub fn enable_uncrop_changed(&self) {
        self.reemit(true, true);
    }

    fn reemit(&self, needs_crop: bool, needs_preview: bool) {
        for name in self.list_files() {
            self.shared.emit(CardEvent::Added {
                name,
                needs_crop,
                needs_preview,
            });
        }
    }
}

impl Drop for CardProvider {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.watcher = None;
        if let Some(handle) = self.watch_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Drain notify events until the provider stops. Renames are paired here,
/// and unclaimed halves are released once their window has passed.
fn watch_loop(shared: &Shared, rx: &Receiver<notify::Result<Event>>, stop: &AtomicBool) {
    let mut renames = RenameMatcher::default();
    while !stop.load(Ordering::Acquire) {
        let wait = renames
            .next_deadline()
            .map_or(WATCH_TICK, |d| d.saturating_duration_since(Instant::now()))
            .min(WATCH_TICK);
        match rx.recv_timeout(wait) {
            Ok(Ok(event)) => {
                for (dir, name, action) in renames.translate(&event, Instant::now()) {
                    shared.handle_file_action(&dir, &name, action);
                }
            }
            Ok(Err(e)) => warn!(error = %e, "file watch error"),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        for (dir, name, action) in renames.expire(Instant::now()) {
            shared.handle_file_action(&dir, &name, action);
        }
    }
    debug!("watch thread stopped");
}

fn watches_for(data: &ProjectData) -> Vec<Watch> {
    let mut watches = vec![Watch {
        directory: data.image_dir.clone(),
        files: WatchFiles::All,
    }];
    for (name, info) in &data.cards {
        let Some(parent) = info.external_path.as_deref().and_then(Path::parent) else {
            continue;
        };
        match watches.iter_mut().find(|w| same_dir(&w.directory, parent)) {
            Some(Watch {
                files: WatchFiles::Only(files),
                ..
            }) => {
                files.insert(name.clone());
            }
            Some(_) => {}
            None => watches.push(Watch {
                directory: parent.to_path_buf(),
                files: WatchFiles::Only(BTreeSet::from([name.clone()])),
            }),
        }
    }
    watches
}

fn watch_dir(watcher: &mut RecommendedWatcher, dir: &Path) {
    match watcher.watch(dir, RecursiveMode::NonRecursive) {
        Ok(()) => debug!(dir = %dir.display(), "watching"),
        Err(e) => warn!(dir = %dir.display(), error = %e, "could not watch directory"),
    }
}

fn unwatch_dir(watcher: &mut RecommendedWatcher, dir: &Path) {
    if let Err(e) = watcher.unwatch(dir) {
        debug!(dir = %dir.display(), error = %e, "could not unwatch directory");
    }
}

/// Paths reported by the OS may be canonical while watches hold the path as
/// configured.
fn same_dir(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn split(path: &Path) -> Option<(PathBuf, PathBuf)> {
    Some((path.parent()?.to_path_buf(), PathBuf::from(path.file_name()?)))
}

/// Translate one notify event into `(directory, file name, action)` triples.
///
/// Stateless: a `From` is a deletion and a `To` an addition. The watch thread
/// runs events through a [`RenameMatcher`] first, so tracked halves reach
/// this function only when they cannot be paired.
pub fn file_actions(event: &Event) -> Vec<(PathBuf, PathBuf, FileAction)> {
    let each = |action: FileAction| -> Vec<_> {
        event
            .paths
            .iter()
            .filter_map(|p| split(p))
            .map(|(dir, name)| (dir, name, action.clone()))
            .collect()
    };
    match event.kind {
        EventKind::Create(CreateKind::File | CreateKind::Any) => each(FileAction::Add),
        EventKind::Remove(RemoveKind::File | RemoveKind::Any) => each(FileAction::Delete),
        EventKind::Modify(ModifyKind::Data(_)) => each(FileAction::Modified),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => each(FileAction::Delete),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => each(FileAction::Add),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match event.paths.as_slice() {
            [old, new] => rename_actions(old, new),
            _ => Vec::new(),
        },
        // Backends that cannot tell which side of a rename this is
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .filter_map(|p| {
                let (dir, name) = split(p)?;
                let action = if p.exists() {
                    FileAction::Add
                } else {
                    FileAction::Delete
                };
                Some((dir, name, action))
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// A move within one directory is a rename; across directories it is a
/// deletion in one and an addition in the other.
fn rename_actions(old: &Path, new: &Path) -> Vec<(PathBuf, PathBuf, FileAction)> {
    let (Some((old_dir, old_name)), Some((new_dir, new_name))) = (split(old), split(new)) else {
        return Vec::new();
    };
    if same_dir(&old_dir, &new_dir) {
        vec![(
            new_dir,
            new_name,
            FileAction::Moved {
                old_filename: old_name,
            },
        )]
    } else {
        vec![
            (old_dir, old_name, FileAction::Delete),
            (new_dir, new_name, FileAction::Add),
        ]
    }
}

/// Pairs the tracker-tagged halves of a rename into a single move.
#[derive(Debug, Default)]
pub struct RenameMatcher {
    /// `From` halves waiting for their other half.
    pending: Vec<(usize, PathBuf, Instant)>,
    /// Trackers already turned into a move whose last event is still due.
    paired: VecDeque<usize>,
}

impl RenameMatcher {
    /// Translate `event`, received at `now`. Untracked events go straight
    /// through [`file_actions`].
    pub fn translate(&mut self, event: &Event, now: Instant) -> Vec<(PathBuf, PathBuf, FileAction)> {
        let (EventKind::Modify(ModifyKind::Name(mode)), Some(tracker)) =
            (event.kind, event.tracker())
        else {
            return file_actions(event);
        };
        if self.claimed(tracker) {
            return Vec::new();
        }
        match mode {
            RenameMode::From => {
                if let Some(path) = event.paths.first() {
                    self.pending.push((tracker, path.clone(), now));
                }
                Vec::new()
            }
            RenameMode::To | RenameMode::Both => {
                let new = match mode {
                    RenameMode::To => event.paths.first(),
                    _ => event.paths.get(1),
                };
                let Some(new) = new else {
                    return Vec::new();
                };
                let old = match self.pending.iter().position(|(t, ..)| *t == tracker) {
                    Some(index) => Some(self.pending.remove(index).1),
                    None if mode == RenameMode::Both => event.paths.first().cloned(),
                    None => None,
                };
                match old {
                    Some(old) => {
                        self.remember(tracker);
                        rename_actions(&old, new)
                    }
                    // Moved in from outside the watched directories
                    None => split(new)
                        .map(|(dir, name)| vec![(dir, name, FileAction::Add)])
                        .unwrap_or_default(),
                }
            }
            _ => file_actions(event),
        }
    }

    /// Release `From` halves older than [`RENAME_WINDOW`] as deletions.
    pub fn expire(&mut self, now: Instant) -> Vec<(PathBuf, PathBuf, FileAction)> {
        let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|(_, _, at)| now.saturating_duration_since(*at) >= RENAME_WINDOW);
        self.pending = kept;
        expired
            .into_iter()
            .filter_map(|(_, path, _)| split(&path))
            .map(|(dir, name)| (dir, name, FileAction::Delete))
            .collect()
    }

    /// When the oldest pending half expires.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .iter()
            .map(|(_, _, at)| *at + RENAME_WINDOW)
            .min()
    }

    fn claimed(&mut self, tracker: usize) -> bool {
        match self.paired.iter().position(|t| *t == tracker) {
            Some(index) => {
                self.paired.remove(index);
                true
            }
            None => false,
        }
    }

    fn remember(&mut self, tracker: usize) {
        if self.paired.len() == PAIRED_MEMORY {
            self.paired.pop_front();
        }
        self.paired.push_back(tracker);
    }
}
