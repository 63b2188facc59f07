use anyhow::{anyhow, Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::automation::cancel::CancelToken;
use crate::automation::config::OcrConfig;
use crate::capture::process::run_bounded;
use crate::log;

const TESSDATA_REPO: &str = "https://github.com/tesseract-ocr/tessdata/raw/main";
const TRAINEDDATA: &str = "eng.traineddata";

#[cfg(windows)]
const EXECUTABLE: &str = "tesseract.exe";
#[cfg(not(windows))]
const EXECUTABLE: &str = "tesseract";

#[cfg(windows)]
const COMMON_EXECUTABLES: &[&str] = &[
    r"C:\Program Files\Tesseract-OCR\tesseract.exe",
    r"C:\Program Files (x86)\Tesseract-OCR\tesseract.exe",
];
#[cfg(not(windows))]
const COMMON_EXECUTABLES: &[&str] = &["/usr/bin/tesseract", "/usr/local/bin/tesseract", "/opt/homebrew/bin/tesseract"];

#[cfg(windows)]
const SYSTEM_TESSDATA: &[&str] = &[
    r"C:\Program Files\Tesseract-OCR\tessdata",
    r"C:\Program Files (x86)\Tesseract-OCR\tessdata",
];
#[cfg(not(windows))]
const SYSTEM_TESSDATA: &[&str] = &[
    "/usr/share/tesseract-ocr/5/tessdata",
    "/usr/share/tesseract-ocr/4.00/tessdata",
    "/usr/share/tessdata",
    "/usr/local/share/tessdata",
];

/// Resolved locations of the OCR engine.
#[derive(Debug, Clone)]
pub struct TesseractPaths {
    pub executable: PathBuf,
    /// `None` lets tesseract use its compiled-in default
    pub tessdata: Option<PathBuf>,
}

/// Locates tesseract and its language data, downloading `eng.traineddata`
/// into the user data directory when nothing is installed and the config
/// allows it.
pub fn ensure_tesseract(config: &OcrConfig) -> Result<TesseractPaths> {
    let executable = find_tesseract_executable(config.tesseract_path.as_deref())?;
    log(&format!("Tesseract found at: {}", executable.display()));

    let tessdata = match find_tessdata_dir(config.tessdata_dir.as_deref()) {
        Some(dir) => Some(dir),
        None if config.download_tessdata => {
            let dir = crate::paths::get_data_dir().join("tessdata");
            download_tessdata(&dir)?;
            Some(dir)
        }
        None => {
            log("No tessdata directory found, relying on tesseract's default");
            None
        }
    };

    Ok(TesseractPaths {
        executable,
        tessdata,
    })
}

/// Finds the tesseract executable: configured path, bundled copy next to
/// the binary, `PATH`, then common install locations.
pub fn find_tesseract_executable(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        log(&format!(
            "Configured tesseract path {} does not exist",
            path.display()
        ));
    }

    let local_exe = crate::paths::get_tesseract_dir().join(EXECUTABLE);
    if local_exe.exists() {
        return Ok(local_exe);
    }

    let mut version_check = Command::new("tesseract");
    version_check.arg("--version");
    let token = CancelToken::new();
    if run_bounded(version_check, &token.deadline(std::time::Duration::from_secs(5))).is_ok() {
        return Ok(PathBuf::from("tesseract"));
    }

    COMMON_EXECUTABLES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
        .ok_or_else(|| anyhow!("Tesseract not found. Please install Tesseract-OCR."))
}

/// Finds a directory containing `eng.traineddata`.
pub fn find_tessdata_dir(configured: Option<&Path>) -> Option<PathBuf> {
    let has_data = |dir: &Path| dir.join(TRAINEDDATA).exists();

    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(dir) = configured {
        candidates.push(dir.to_path_buf());
    }
    candidates.push(crate::paths::get_tesseract_dir().join("tessdata"));
    candidates.push(crate::paths::get_data_dir().join("tessdata"));
    candidates.extend(SYSTEM_TESSDATA.iter().map(PathBuf::from));
    if let Ok(prefix) = std::env::var("TESSDATA_PREFIX") {
        candidates.push(PathBuf::from(&prefix));
        candidates.push(PathBuf::from(&prefix).join("tessdata"));
    }

    candidates.into_iter().find(|dir| has_data(dir))
}

/// Downloads English trained data into `tessdata_dir`.
fn download_tessdata(tessdata_dir: &Path) -> Result<()> {
    fs::create_dir_all(tessdata_dir)
        .with_context(|| format!("Failed to create {}", tessdata_dir.display()))?;
    let url = format!("{}/{}", TESSDATA_REPO, TRAINEDDATA);
    let target = tessdata_dir.join(TRAINEDDATA);

    log(&format!("Downloading {}...", TRAINEDDATA));

    let client = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(300))
        .build()?;

    let response = client
        .get(&url)
        .header("User-Agent", "march-bot")
        .send()?;

    if !response.status().is_success() {
        return Err(anyhow!(
            "Failed to download {}: HTTP {}",
            TRAINEDDATA,
            response.status()
        ));
    }

    let bytes = response.bytes()?;
    let mut file = fs::File::create(&target)?;
    file.write_all(&bytes)?;

    log(&format!("Downloaded {} ({} bytes)", TRAINEDDATA, bytes.len()));
    Ok(())
}
