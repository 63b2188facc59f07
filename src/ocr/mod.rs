//! March panel classification.
//!
//! A full screenshot is cropped to the queue text column, transcribed under
//! several OCR variants, and the best-scoring transcript is parsed into
//! queue records.

pub mod engine;
pub mod extract;
pub mod preprocess;
pub mod score;
pub mod setup;

pub use engine::{OcrEngine, OcrVariant, Preprocess, TesseractEngine};
pub use extract::{available_queues, parse_march_queues, MarchQueueRecord, QueueStatus, QueueTally};
pub use score::{KeywordScorer, OcrAttempt, TranscriptScorer};

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use crate::automation::cancel::CancelToken;
use crate::automation::config::OcrConfig;
use crate::capture::{CaptureGateway, CapturePurpose};
use crate::log;
use preprocess::crop_region;
use score::pick_best;

/// Outcome of one classification pass over a screenshot.
#[derive(Debug, Clone, Default)]
pub struct PanelReading {
    pub attempts: Vec<OcrAttempt>,
    pub best: Option<OcrAttempt>,
    pub records: Vec<MarchQueueRecord>,
}

impl PanelReading {
    /// The winning transcript, or `""` when no variant scored above zero.
    pub fn transcript(&self) -> &str {
        self.best.as_ref().map_or("", |b| b.transcript.as_str())
    }
}

/// Reads the march panel off full screenshots.
pub struct PanelClassifier {
    gateway: Arc<CaptureGateway>,
    engine: Arc<dyn OcrEngine>,
    scorer: Box<dyn TranscriptScorer>,
    config: OcrConfig,
}

impl PanelClassifier {
    pub fn new(
        gateway: Arc<CaptureGateway>,
        engine: Arc<dyn OcrEngine>,
        scorer: Box<dyn TranscriptScorer>,
        config: OcrConfig,
    ) -> Self {
        Self {
            gateway,
            engine,
            scorer,
            config,
        }
    }

    /// Captures the screen and reads the march queues shown on it.
    /// Returns an empty list when nothing could be read.
    pub fn read_queues(&self, instance: u32, cancel: &CancelToken) -> Vec<MarchQueueRecord> {
        let capture = match self.gateway.capture(instance, CapturePurpose::MarchFull, cancel) {
            Ok(c) => c,
            Err(e) => {
                log(&format!("[Instance {}] March panel capture failed: {}", instance, e));
                return Vec::new();
            }
        };

        match self.classify_panel(instance, &capture.path, cancel) {
            Ok(reading) => {
                log(&format!(
                    "[Instance {}] Read {} march queues",
                    instance,
                    reading.records.len()
                ));
                for record in &reading.records {
                    log(&format!("[Instance {}]   {}", instance, record));
                }
                reading.records
            }
            Err(e) => {
                log(&format!("[Instance {}] March panel OCR failed: {:#}", instance, e));
                Vec::new()
            }
        }
    }

    /// Classifies an existing screenshot. Intermediate crops are written
    /// next to the instance's other artifacts.
    pub fn classify_panel(
        &self,
        instance: u32,
        screenshot: &Path,
        cancel: &CancelToken,
    ) -> Result<PanelReading> {
        let store = self.gateway.store();
        store.ensure_dir()?;

        let img = image::open(screenshot)
            .with_context(|| format!("Failed to open {}", screenshot.display()))?
            .to_rgba8();
        let panel = crop_region(&img, &self.config.panel_region);
        let panel_path = store.path_for(instance, CapturePurpose::MarchPanel);
        panel
            .save(&panel_path)
            .with_context(|| format!("Failed to save {}", panel_path.display()))?;
        log(&format!(
            "[Instance {}] Cropped panel {}x{} -> {}",
            instance,
            panel.width(),
            panel.height(),
            panel_path.display()
        ));

        let available = self.engine.is_available();
        if !available {
            log(&format!(
                "[Instance {}] OCR engine {} unavailable, every variant reads empty",
                instance,
                self.engine.name()
            ));
        }

        let mut attempts = Vec::with_capacity(self.config.variants.len());
        for (n, variant) in self.config.variants.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            let transcript = if available {
                self.run_variant(instance, n, variant, &panel, cancel)
            } else {
                String::new()
            };
            let score = self.scorer.score(&transcript);
            log(&format!(
                "[Instance {}] OCR variant {}: score {} - '{}'",
                instance,
                variant.name,
                score,
                transcript.trim().replace('\n', " | ")
            ));
            attempts.push(OcrAttempt {
                variant: variant.name.clone(),
                transcript,
                score,
            });
        }

        let best = pick_best(&attempts).cloned();
        let records = match &best {
            Some(b) => {
                log(&format!(
                    "[Instance {}] Best OCR variant: {} (score {})",
                    instance, b.variant, b.score
                ));
                parse_march_queues(&b.transcript)
            }
            None => Vec::new(),
        };

        Ok(PanelReading {
            attempts,
            best,
            records,
        })
    }

    /// One variant's transcript. Failures read as empty so the remaining
    /// variants still compete.
    fn run_variant(
        &self,
        instance: u32,
        n: usize,
        variant: &OcrVariant,
        panel: &image::RgbaImage,
        cancel: &CancelToken,
    ) -> String {
        let path = self
            .gateway
            .store()
            .path_for(instance, CapturePurpose::MarchVariant(n));
        if let Err(e) = preprocess::apply(panel, variant.preprocess).save(&path) {
            log(&format!(
                "[Instance {}] Failed to save {}: {}",
                instance,
                path.display(),
                e
            ));
            return String::new();
        }

        match self.engine.transcribe(&path, variant, cancel) {
            Ok(text) => text,
            Err(e) => {
                log(&format!("[Instance {}] {}", instance, e));
                String::new()
            }
        }
    }
}
