//! # Proxy Cropper
//!
//! Keeps print-ready crops of card scans in sync with their sources. A card is
//! any image in the project's image directory. For each card the pipeline
//! produces a crop at the configured bleed edge and a small preview pair, and
//! it redoes that work only when the source bytes or the parameters change.
//!
//! # Architecture: Events In, Work Out
//!
//! ```text
//! filesystem ─► CardProvider ─CardEvent─► router ─► Project (cards, previews)
//!                                           │
//!                                           └─────► Cropper ─► WorkPool
//!                                                      │
//!                 Project ◄─ PreviewUpdated / *Done ───┘
//! ```
//!
//! - The [`card_provider`] turns the initial directory listing and every
//!   file-watch notification into card events.
//! - The [`cropper`] keeps at most one live crop item and one live preview
//!   item per card, runs them on a shared pool, and reports progress in
//!   debounced bursts.
//! - The [`project`] owns the card list and the preview cache.
//! - The [`pipeline`] wires the three together and applies configuration
//!   changes.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`units`] | Physical lengths and sizes (`"2.48in"`, `"3mm"`) |
//! | [`config`] | `config.toml` loading, merging over stock defaults, validation |
//! | [`imaging`] | Pixel operations, crop/uncrop geometry, color cubes, the backend trait |
//! | [`database`] | Content-hash cache of produced outputs (`.image.db`) |
//! | [`work`] | Retryable, pausable, cancellable work items and the worker pool |
//! | [`scan`] | Card file listing and output variant discovery |
//! | [`preview_cache`] | Binary preview cache file |
//! | [`project`] | Card list, per-card overrides, `project.json` |
//! | [`cropper`] | Scheduler for crop and preview work |
//! | [`card_provider`] | Card enumeration and file watching |
//! | [`pipeline`] | Event routing and reconfiguration |
//! | [`output`] | CLI output formatting |
//!
//! # Design Decisions
//!
//! ## Hash, Don't Timestamp
//!
//! Whether an output is current is decided by the SHA-256 of the source and
//! the quantized parameters it was produced with, never by modification
//! times. Copying a project or touching a file does not trigger work, and a
//! bleed change of a hundredth of a millimeter does not either.
//!
//! ## Snapshots Over Shared Settings
//!
//! Each work item is built with an immutable snapshot of the settings it
//! needs. Reconfiguration pauses the scheduler, swaps the settings and
//! re-requests the affected cards, so running items never see a half-applied
//! change.
//!
//! ## Variant Directories
//!
//! Outputs for a color cube or a non-zero bleed go to their own directory
//! (`crop/<cube>/<bleed>/`), so switching back to an earlier setting finds its
//! outputs still current.

pub mod card_provider;
pub mod config;
pub mod cropper;
pub mod database;
pub mod imaging;
pub mod output;
pub mod pipeline;
pub mod preview_cache;
pub mod project;
pub mod scan;
pub mod units;
pub mod work;
