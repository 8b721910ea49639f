//! CLI output formatting.
//!
//! # Output Format
//!
//! ## Events
//!
//! Card events are one line each, prefixed by a marker. Cropper events are
//! stage headers with indented progress lines:
//!
//! ```text
//! + forest.png
//! + island.png
//! ==> Cropping
//!     crop 50%
//! ==> Rendering previews
//!     preview forest.png (64x89)
//!     preview island.png (64x89), looks rotated
//! ==> Crops up to date
//! ==> Previews up to date
//! ~ island.png -> isle.png
//! - forest.png
//! ```
//!
//! ## Summary
//!
//! ```text
//! Cards
//! 001 __back.png x0 (hidden)
//!     No preview
//! 002 forest.png x4
//! 003 isle.png
//!     Warning: bad aspect ratio
//!
//! 3 cards, 5 to print, 2 previews
//! ```
//!
//! # Architecture
//!
//! Each output has a `format_*` function (returns `Vec<String>`) for
//! testability and a `print_*` wrapper that writes to stdout. Format
//! functions are pure: no I/O, no side effects.

use crate::card_provider::CardEvent;
use crate::cropper::CropperEvent;
use crate::imaging::Rotation;
use crate::pipeline::PipelineEvent;
use crate::project::Project;

// ============================================================================
// Shared helpers
// ============================================================================

/// Format a 1-based index as a zero-padded 3-digit string.
fn format_index(pos: usize) -> String {
    format!("{:0>3}", pos)
}

fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

fn percent(fraction: f32) -> String {
    format!("{:.0}%", (fraction.clamp(0.0, 1.0) * 100.0))
}

fn plural(count: usize, word: &str) -> String {
    if count == 1 {
        format!("{count} {word}")
    } else {
        format!("{count} {word}s")
    }
}

// ============================================================================
// Events
// ============================================================================

pub fn format_card_event(event: &CardEvent) -> Vec<String> {
    let line = match event {
        CardEvent::Added {
            name,
            needs_crop,
            needs_preview,
        } => match (needs_crop, needs_preview) {
            (true, true) => format!("+ {}", name.display()),
            (true, false) => format!("+ {} (crop)", name.display()),
            (false, true) => format!("+ {} (preview)", name.display()),
            (false, false) => return Vec::new(),
        },
        CardEvent::Removed(name) => format!("- {}", name.display()),
        CardEvent::Renamed { old, new } => format!("~ {} -> {}", old.display(), new.display()),
        CardEvent::Modified(name) => format!("* {}", name.display()),
    };
    vec![line]
}

pub fn format_cropper_event(event: &CropperEvent) -> Vec<String> {
    match event {
        CropperEvent::CropWorkStart => vec!["==> Cropping".to_string()],
        CropperEvent::CropProgress(fraction) => {
            vec![format!("{}crop {}", indent(1), percent(*fraction))]
        }
        CropperEvent::CropWorkDone => vec!["==> Crops up to date".to_string()],
        CropperEvent::PreviewWorkStart => vec!["==> Rendering previews".to_string()],
        CropperEvent::PreviewWorkDone => vec!["==> Previews up to date".to_string()],
        CropperEvent::PreviewUpdated {
            name,
            preview,
            rotation,
        } => {
            let (w, h) = preview.uncropped.size();
            let mut line = format!("{}preview {} ({w}x{h})", indent(1), name.display());
            if *rotation != Rotation::None {
                line.push_str(&format!(", {rotation:?}"));
            }
            if preview.bad_aspect_ratio {
                line.push_str(", bad aspect ratio");
            }
            if preview.bad_rotation {
                line.push_str(", looks rotated");
            }
            vec![line]
        }
    }
}

pub fn format_event(event: &PipelineEvent) -> Vec<String> {
    match event {
        PipelineEvent::Card(event) => format_card_event(event),
        PipelineEvent::Cropper(event) => format_cropper_event(event),
    }
}

pub fn print_event(event: &PipelineEvent) {
    for line in format_event(event) {
        println!("{}", line);
    }
}

// ============================================================================
// Summary
// ============================================================================

pub fn format_project_summary(project: &Project) -> Vec<String> {
    let mut lines = vec!["Cards".to_string()];

    for (i, (name, info)) in project.cards().iter().enumerate() {
        let mut header = format!("{} {}", format_index(i + 1), name.display());
        if info.num != 1 {
            header.push_str(&format!(" x{}", info.num));
        }
        if !info.is_visible() {
            header.push_str(" (hidden)");
        }
        lines.push(header);

        if let Some(path) = &info.external_path {
            lines.push(format!("{}Source: {}", indent(1), path.display()));
        }
        if !project.has_preview(name) {
            lines.push(format!("{}No preview", indent(1)));
        }
        if project.has_bad_aspect_ratio(name) {
            lines.push(format!("{}Warning: bad aspect ratio", indent(1)));
        }
        if project.has_bad_rotation(name) {
            lines.push(format!("{}Warning: looks rotated", indent(1)));
        }
    }

    lines.push(String::new());
    lines.push(format!(
        "{}, {} to print, {}",
        plural(project.cards().len(), "card"),
        project.print_list().len(),
        plural(project.previews().len(), "preview"),
    ));
    lines
}

pub fn print_project_summary(project: &Project) {
    for line in format_project_summary(project) {
        println!("{}", line);
    }
}
