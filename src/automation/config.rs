//! Configuration types for the bot.
//!
//! Loads settings from config.json at startup. Provides device-bridge
//! timeouts, capture validation limits, detection thresholds, OCR variants
//! and controller timing. The loaded config is handed to each component
//! explicitly; nothing reads it from a global.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ocr::engine::{OcrVariant, Preprocess};
use crate::ocr::score::ScoreWeights;

/// A rectangle in relative coordinates (0.0 to 1.0).
/// Used for defining screen regions that scale with the device resolution.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelativeRect {
    /// X position of top-left corner (0.0 = left edge, 1.0 = right edge)
    pub x: f32,
    /// Y position of top-left corner (0.0 = top edge, 1.0 = bottom edge)
    pub y: f32,
    /// Width as fraction of screen width
    pub width: f32,
    /// Height as fraction of screen height
    pub height: f32,
}

impl Default for RelativeRect {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: 0.1,
            height: 0.1,
        }
    }
}

impl RelativeRect {
    /// Builds a relative rect from pixel geometry measured on a screen of
    /// the given size.
    pub fn from_pixels(x: u32, y: u32, width: u32, height: u32, screen: (u32, u32)) -> Self {
        let (sw, sh) = (screen.0.max(1) as f32, screen.1.max(1) as f32);
        Self {
            x: x as f32 / sw,
            y: y as f32 / sh,
            width: width as f32 / sw,
            height: height as f32 / sh,
        }
    }
}

/// Timeouts for the individual device-bridge commands.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Path to the virtualization controller executable
    pub memuc_path: PathBuf,
    pub capture_timeout_ms: u64,
    pub pull_timeout_ms: u64,
    pub tap_timeout_ms: u64,
    pub query_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            memuc_path: PathBuf::from(r"C:\Program Files\Microvirt\MEmu\memuc.exe"),
            capture_timeout_ms: 10_000,
            pull_timeout_ms: 10_000,
            tap_timeout_ms: 5_000,
            query_timeout_ms: 5_000,
        }
    }
}

/// Screenshot acquisition and validation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Artifacts at or below this size are treated as truncated transfers
    pub min_bytes: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    /// Pause between the on-device capture and the pull
    pub settle_delay_ms: u64,
    /// Decode the artifact before accepting it
    pub verify_decode: bool,
    /// How long a capture may be used for decisions
    pub validity_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            min_bytes: 15_000,
            max_attempts: 5,
            retry_delay_ms: 500,
            settle_delay_ms: 500,
            verify_decode: true,
            validity_ms: 10_000,
        }
    }
}

/// Template matching thresholds and asset locations.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Threshold for small icons (close buttons, launcher)
    pub icon_threshold: f64,
    /// Threshold for large UI landmarks (side panel, wilderness button)
    pub landmark_threshold: f64,
    pub template_dirs: Vec<PathBuf>,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            icon_threshold: 0.8,
            landmark_threshold: 0.6,
            template_dirs: crate::paths::default_template_dirs(),
        }
    }
}

/// OCR engine location, panel geometry and the competing variants.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub tesseract_path: Option<PathBuf>,
    pub tessdata_dir: Option<PathBuf>,
    /// Download eng.traineddata when no tessdata directory is found
    pub download_tessdata: bool,
    /// Region containing only the queue status text column
    pub panel_region: RelativeRect,
    pub variants: Vec<OcrVariant>,
    pub weights: ScoreWeights,
    pub timeout_ms: u64,
}

/// Characters the panel can contain.
pub const PANEL_WHITELIST: &str =
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789 ";

fn default_variants() -> Vec<OcrVariant> {
    let whitelist = Some(PANEL_WHITELIST.to_string());
    vec![
        OcrVariant::new("psm6-lstm", 6, 1, whitelist.clone(), Preprocess::None),
        OcrVariant::new("psm4-lstm", 4, 1, whitelist.clone(), Preprocess::None),
        OcrVariant::new("psm6-legacy", 6, 0, whitelist.clone(), Preprocess::None),
        OcrVariant::new("psm3-lstm", 3, 1, whitelist.clone(), Preprocess::None),
        OcrVariant::new("psm6-bright", 6, 1, whitelist, Preprocess::BrightThreshold(190)),
    ]
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            tesseract_path: None,
            tessdata_dir: None,
            download_tessdata: true,
            // Calibrated on a 400x652 screen: x=50 y=190 w=230 h=310,
            // starting right of the flag icons
            panel_region: RelativeRect::from_pixels(50, 190, 230, 310, (400, 652)),
            variants: default_variants(),
            weights: ScoreWeights::default(),
            timeout_ms: 15_000,
        }
    }
}

/// AutoStartGame controller timing and icons.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoStartConfig {
    pub attempts: u32,
    pub attempt_interval_ms: u64,
    pub screenshot_failure_delay_ms: u64,
    pub popup_settle_ms: u64,
    pub max_popup_closes: u32,
    pub running_icon: String,
    pub launcher_icon: String,
    pub popup_icons: Vec<String>,
}

impl Default for AutoStartConfig {
    fn default() -> Self {
        Self {
            attempts: 10,
            attempt_interval_ms: 5_000,
            screenshot_failure_delay_ms: 2_000,
            popup_settle_ms: 1_000,
            max_popup_closes: 10,
            running_icon: "game_icon.png".to_string(),
            launcher_icon: "game_launcher.png".to_string(),
            popup_icons: vec![
                "close_x.png".to_string(),
                "close_x2.png".to_string(),
                "close_x3.png".to_string(),
            ],
        }
    }
}

/// GatherResources controller timing and navigation landmarks.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GatherConfig {
    pub poll_interval_ms: u64,
    pub error_cooldown_ms: u64,
    pub dispatch_delay_ms: u64,
    /// Fresh captures tried per navigation click
    pub click_retries: u32,
    pub click_retry_delay_ms: u64,
    pub panel_settle_ms: u64,
    pub wilderness_settle_ms: u64,
    pub open_panel_icon: String,
    pub wilderness_icon: String,
}

impl Default for GatherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 60_000,
            error_cooldown_ms: 30_000,
            dispatch_delay_ms: 3_000,
            click_retries: 3,
            click_retry_delay_ms: 1_000,
            panel_settle_ms: 2_000,
            wilderness_settle_ms: 3_000,
            open_panel_icon: "open_left.png".to_string(),
            wilderness_icon: "wilderness_button.png".to_string(),
        }
    }
}

/// Complete bot configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub screenshots_dir: Option<PathBuf>,
    pub bridge: BridgeConfig,
    pub capture: CaptureConfig,
    pub matching: MatchingConfig,
    pub ocr: OcrConfig,
    pub auto_start: AutoStartConfig,
    pub gather: GatherConfig,
}

impl BotConfig {
    /// Configured artifact directory, or the default next to the binary.
    pub fn screenshots_dir(&self) -> PathBuf {
        self.screenshots_dir
            .clone()
            .unwrap_or_else(crate::paths::get_screenshots_dir)
    }
}

/// Milliseconds to `Duration`.
pub fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

/// Default config location: config.json next to the executable.
pub fn default_config_path() -> PathBuf {
    crate::paths::get_exe_dir().join("config.json")
}

/// Loads configuration from `path` or returns defaults.
pub fn load_config(path: &Path) -> BotConfig {
    crate::log(&format!("Looking for config at: {}", path.display()));

    if path.exists() {
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    crate::log("Config loaded from config.json");
                    return config;
                }
                Err(e) => {
                    crate::log(&format!(
                        "Failed to parse {}: {}. Using defaults.",
                        path.display(),
                        e
                    ));
                }
            },
            Err(e) => {
                crate::log(&format!(
                    "Failed to read {}: {}. Using defaults.",
                    path.display(),
                    e
                ));
            }
        }
    } else {
        crate::log("config.json not found. Using default config.");
    }

    BotConfig::default()
}
