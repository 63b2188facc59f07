use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;
use std::time::Duration;

use super::setup::{ensure_tesseract, TesseractPaths};
use crate::automation::cancel::CancelToken;
use crate::automation::config::OcrConfig;
use crate::capture::process::run_bounded;

/// Image preparation applied to the panel crop before transcription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Preprocess {
    None,
    Grayscale,
    /// Keep only pixels brighter than the value in every channel
    BrightThreshold(u8),
}

/// One competing OCR configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrVariant {
    pub name: String,
    /// Page segmentation mode
    pub psm: u8,
    /// Engine mode (0 = legacy, 1 = LSTM)
    pub oem: u8,
    pub whitelist: Option<String>,
    pub preprocess: Preprocess,
}

impl OcrVariant {
    pub fn new(name: &str, psm: u8, oem: u8, whitelist: Option<String>, preprocess: Preprocess) -> Self {
        Self {
            name: name.to_string(),
            psm,
            oem,
            whitelist,
            preprocess,
        }
    }

    /// Command-line arguments for tesseract after the input/output pair.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--psm".to_string(),
            self.psm.to_string(),
            "--oem".to_string(),
            self.oem.to_string(),
        ];
        if let Some(whitelist) = &self.whitelist {
            args.push("-c".to_string());
            args.push(format!("tessedit_char_whitelist={}", whitelist));
        }
        args
    }
}

/// An external text-transcription service.
pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the engine can be invoked at all. Checked before first use.
    fn is_available(&self) -> bool;

    /// Transcribes the image at `image` under `variant`.
    fn transcribe(&self, image: &Path, variant: &OcrVariant, cancel: &CancelToken) -> Result<String>;
}

/// Tesseract invoked as a subprocess writing to stdout.
pub struct TesseractEngine {
    config: OcrConfig,
    paths: OnceLock<Option<TesseractPaths>>,
}

impl TesseractEngine {
    pub fn new(config: OcrConfig) -> Self {
        Self {
            config,
            paths: OnceLock::new(),
        }
    }

    /// Discovery runs once; a failure is logged once and remembered.
    fn paths(&self) -> Option<&TesseractPaths> {
        self.paths
            .get_or_init(|| match ensure_tesseract(&self.config) {
                Ok(paths) => Some(paths),
                Err(e) => {
                    crate::log(&format!("Warning: OCR unavailable: {}", e));
                    None
                }
            })
            .as_ref()
    }
}

impl OcrEngine for TesseractEngine {
    fn name(&self) -> &str {
        "tesseract"
    }

    fn is_available(&self) -> bool {
        self.paths().is_some()
    }

    fn transcribe(&self, image: &Path, variant: &OcrVariant, cancel: &CancelToken) -> Result<String> {
        let paths = self
            .paths()
            .ok_or_else(|| anyhow!("Tesseract is not available"))?;

        let mut cmd = Command::new(&paths.executable);
        cmd.arg(image).arg("stdout");
        if let Some(tessdata) = &paths.tessdata {
            cmd.arg("--tessdata-dir").arg(tessdata);
        }
        cmd.arg("-l").arg("eng").args(variant.args());

        let deadline = cancel.deadline(Duration::from_millis(self.config.timeout_ms));
        let output = run_bounded(cmd, &deadline)
            .map_err(|e| anyhow!("Tesseract failed ({}): {}", variant.name, e))?;

        Ok(output.stdout)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_args_with_whitelist() {
        let v = OcrVariant::new("a", 6, 1, Some("AB ".to_string()), Preprocess::None);
        assert_eq!(
            v.args(),
            vec!["--psm", "6", "--oem", "1", "-c", "tessedit_char_whitelist=AB "]
        );
    }

    #[test]
    fn test_variant_args_without_whitelist() {
        let v = OcrVariant::new("b", 3, 0, None, Preprocess::Grayscale);
        assert_eq!(v.args(), vec!["--psm", "3", "--oem", "0"]);
    }

    #[test]
    fn test_preprocess_serde_tagged() {
        let json = serde_json::to_string(&Preprocess::BrightThreshold(190)).unwrap();
        assert_eq!(json, r#"{"kind":"bright_threshold","value":190}"#);
        let back: Preprocess = serde_json::from_str(r#"{"kind":"none"}"#).unwrap();
        assert_eq!(back, Preprocess::None);
    }
}
