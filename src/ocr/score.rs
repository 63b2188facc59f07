//! Heuristic ranking of competing OCR transcripts.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

pub(crate) static TIMER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{1,2}:\d{2}(?::\d{2})?").expect("valid timer regex"));

static NUMBERED_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"march queue [1-6]").expect("valid header regex"));

/// Words naming a resource site on a gathering row.
pub(crate) const SITE_WORDS: &[&str] = &["mill", "lumber", "quarry", "mine", "iron"];

const LINE_KEYWORDS: &[&str] = &["idle", "unlock", "cannot use"];

/// Points awarded or deducted by [`KeywordScorer`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub march_queue: i32,
    /// Each of "idle", "unlock", "cannot use"
    pub status_keyword: i32,
    pub resource_site: i32,
    pub numbered_header: i32,
    pub valid_line: i32,
    pub timer: i32,
    pub bracket_penalty: i32,
    pub truncation_penalty: i32,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            march_queue: 20,
            status_keyword: 15,
            resource_site: 5,
            numbered_header: 10,
            valid_line: 5,
            timer: 3,
            bracket_penalty: 5,
            truncation_penalty: 3,
        }
    }
}

/// Assigns a quality score to a raw transcript. Higher is better.
pub trait TranscriptScorer: Send + Sync {
    fn score(&self, transcript: &str) -> i32;
}

/// Rewards panel vocabulary and penalises common OCR garbage.
#[derive(Clone, Debug, Default)]
pub struct KeywordScorer {
    pub weights: ScoreWeights,
}

impl KeywordScorer {
    pub fn new(weights: ScoreWeights) -> Self {
        Self { weights }
    }
}

impl TranscriptScorer for KeywordScorer {
    fn score(&self, transcript: &str) -> i32 {
        if transcript.trim().is_empty() {
            return 0;
        }
        let w = &self.weights;
        let lower = transcript.to_lowercase();
        let mut score = 0;

        if lower.contains("march queue") {
            score += w.march_queue;
        }
        for keyword in LINE_KEYWORDS {
            if lower.contains(keyword) {
                score += w.status_keyword;
            }
        }
        if SITE_WORDS.iter().any(|s| lower.contains(s)) {
            score += w.resource_site;
        }
        if NUMBERED_HEADER.is_match(&lower) {
            score += w.numbered_header;
        }

        if lower.contains("] ") || lower.contains(") ") {
            score -= w.bracket_penalty;
        }
        if lower.contains("irc") || lower.contains("ile") {
            score -= w.truncation_penalty;
        }

        let valid_lines = lower
            .lines()
            .map(str::trim)
            .filter(|line| line.contains("march queue") || LINE_KEYWORDS.contains(line))
            .count() as i32;
        score += valid_lines * w.valid_line;
        score += TIMER.find_iter(&lower).count() as i32 * w.timer;

        score
    }
}

/// One variant's transcript and its score.
#[derive(Clone, Debug, PartialEq)]
pub struct OcrAttempt {
    pub variant: String,
    pub transcript: String,
    pub score: i32,
}

/// The highest-scoring attempt. The earliest wins a tie, and nothing at or
/// below zero qualifies.
pub fn pick_best(attempts: &[OcrAttempt]) -> Option<&OcrAttempt> {
    let mut best: Option<&OcrAttempt> = None;
    for attempt in attempts {
        if attempt.score > best.map_or(0, |b| b.score) {
            best = Some(attempt);
        }
    }
    best
}
