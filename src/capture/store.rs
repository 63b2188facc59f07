//! On-disk screenshot artifacts, one file per (instance, purpose).
//!
//! Files are overwritten by the next capture of the same purpose; nothing
//! here promises retention.

use chrono::{DateTime, Local};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Files below this size are left over from interrupted transfers.
pub const CORRUPT_FLOOR_BYTES: u64 = 1_000;

/// Why a screenshot was taken. Determines the artifact's file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapturePurpose {
    /// Home/launcher screen checks
    Menu,
    /// Looking for the side-panel opener
    OpenLeft,
    /// Looking for the wilderness button
    Wilderness,
    /// Full screen read for the march panel
    MarchFull,
    /// Cropped march panel text column
    MarchPanel,
    /// Preprocessed panel for OCR variant `n`
    MarchVariant(usize),
}

impl CapturePurpose {
    /// Artifact name without the instance suffix or extension.
    pub fn file_stem(&self) -> String {
        match self {
            CapturePurpose::Menu => "current_screen".to_string(),
            CapturePurpose::OpenLeft => "open_left".to_string(),
            CapturePurpose::Wilderness => "wilderness".to_string(),
            CapturePurpose::MarchFull => "march_full".to_string(),
            CapturePurpose::MarchPanel => "march_text_panel".to_string(),
            CapturePurpose::MarchVariant(n) => format!("march_text_panel_v{}", n),
        }
    }
}

impl fmt::Display for CapturePurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file_stem())
    }
}

/// A validated screenshot on disk.
#[derive(Debug, Clone)]
pub struct ScreenCapture {
    pub instance: u32,
    pub purpose: CapturePurpose,
    pub path: PathBuf,
    pub bytes: u64,
    pub captured_at: DateTime<Local>,
}

impl ScreenCapture {
    /// Whether the capture is still recent enough to base a decision on.
    pub fn is_fresh(&self, window: Duration) -> bool {
        let age = Local::now().signed_duration_since(self.captured_at);
        age.to_std().map(|age| age <= window).unwrap_or(true)
    }
}

/// Directory holding every instance's screenshot artifacts.
#[derive(Debug, Clone)]
pub struct FrameStore {
    root: PathBuf,
}

impl FrameStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory artifacts are written to.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the directory and any missing parents.
    pub fn ensure_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root)
    }

    /// Deterministic artifact path for an instance and purpose.
    pub fn path_for(&self, instance: u32, purpose: CapturePurpose) -> PathBuf {
        self.root
            .join(format!("{}_{}.png", purpose.file_stem(), instance))
    }

    /// Deletes the artifact so the next read cannot see a stale frame.
    pub fn invalidate(&self, instance: u32, purpose: CapturePurpose) -> io::Result<()> {
        match fs::remove_file(self.path_for(instance, purpose)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Removes `.png` files smaller than [`CORRUPT_FLOOR_BYTES`].
    /// Returns how many were deleted.
    pub fn cleanup_corrupted(&self) -> usize {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return 0;
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_png = path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("png"))
                .unwrap_or(false);
            if !is_png {
                continue;
            }
            let small = entry
                .metadata()
                .map(|m| m.len() < CORRUPT_FLOOR_BYTES)
                .unwrap_or(false);
            if small && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }

        if removed > 0 {
            crate::log(&format!(
                "Removed {} corrupted screenshot(s) from {}",
                removed,
                self.root.display()
            ));
        }
        removed
    }
}
