//! Turns a panel transcript into structured march queue records.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use super::score::{SITE_WORDS, TIMER};
use crate::log;

static HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"march\s*queue\s*(\d+)?").expect("valid header regex"));

/// The panel never lists more queues than this.
pub const MAX_QUEUES: u32 = 6;

/// Substrings that only ever appear in OCR noise.
const GARBAGE_MARKERS: &[&str] = &["ss ee ee"];

/// Status shown for one march queue row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QueueStatus {
    Idle,
    Unlock,
    CannotUse,
    Gathering,
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            QueueStatus::Idle => "Idle",
            QueueStatus::Unlock => "Unlock",
            QueueStatus::CannotUse => "Cannot use",
            QueueStatus::Gathering => "Gathering",
        };
        f.write_str(label)
    }
}

/// One parsed queue row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarchQueueRecord {
    pub queue_number: u32,
    pub status: QueueStatus,
    pub remaining_time: Option<String>,
    /// Resource label of a gathering march ("Food", "Wood", ...)
    pub resource_info: Option<String>,
}

impl MarchQueueRecord {
    /// A record with no timer and no resource yet.
    pub fn new(queue_number: u32, status: QueueStatus) -> Self {
        Self {
            queue_number,
            status,
            remaining_time: None,
            resource_info: None,
        }
    }

    fn gathering(queue_number: u32, line: &str) -> Self {
        Self {
            queue_number,
            status: QueueStatus::Gathering,
            remaining_time: first_timer(line),
            resource_info: Some(resource_from_gathering(line).to_string()),
        }
    }
}

impl fmt::Display for MarchQueueRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "March Queue {}: {}", self.queue_number, self.status)?;
        if let Some(resource) = &self.resource_info {
            write!(f, " ({})", resource)?;
        }
        if let Some(time) = &self.remaining_time {
            write!(f, " [{}]", time)?;
        }
        Ok(())
    }
}

/// Maps a gathering row's site word to the resource it yields.
pub fn resource_from_gathering(line: &str) -> &'static str {
    let line = line.to_lowercase();
    if line.contains("mill") {
        "Food"
    } else if line.contains("lumber") {
        "Wood"
    } else if line.contains("quarry") {
        "Stone"
    } else if line.contains("mine") || line.contains("iron") {
        "Iron"
    } else {
        "Unknown"
    }
}

fn first_timer(line: &str) -> Option<String> {
    TIMER.find(line).map(|m| m.as_str().to_string())
}

fn is_gathering_line(line: &str) -> bool {
    line.contains("gathering") || line.contains("lv") || SITE_WORDS.iter().any(|s| line.contains(s))
}

/// Classifies a status line below a header. `None` when nothing is recognised.
fn classify_status(line: &str) -> Option<QueueStatus> {
    if line.contains("idle") {
        Some(QueueStatus::Idle)
    } else if line.contains("unlock") {
        Some(QueueStatus::Unlock)
    } else if line.contains("cannot") || line.contains("use") {
        Some(QueueStatus::CannotUse)
    } else if is_gathering_line(line) || TIMER.is_match(line) {
        Some(QueueStatus::Gathering)
    } else {
        None
    }
}

/// Trimmed, lower-cased lines with the panel title and noise removed.
fn clean_lines(transcript: &str) -> Vec<String> {
    transcript
        .lines()
        .map(|l| l.trim().to_lowercase())
        .filter(|l| !l.is_empty())
        .filter(|l| l != "march queue")
        .filter(|l| !GARBAGE_MARKERS.iter().any(|g| l.contains(g)))
        .collect()
}

/// Parses a panel transcript into records sorted by queue number.
///
/// A "March Queue N" header takes its status from the following line, which
/// is consumed. Gathering rows carry no header of their own and take the
/// next ordinal. When no record comes out of that pass, every line is
/// scanned on its own for a status keyword.
pub fn parse_march_queues(transcript: &str) -> Vec<MarchQueueRecord> {
    let lines = clean_lines(transcript);
    let mut records: Vec<MarchQueueRecord> = Vec::new();
    let mut expected = 1u32;

    let mut i = 0;
    while i < lines.len() {
        let line = &lines[i];
        i += 1;

        if let Some(caps) = HEADER.captures(line) {
            // Numbers the panel cannot show are misreads; use the ordinal
            let number = caps
                .get(1)
                .and_then(|m| m.as_str().parse::<u32>().ok())
                .filter(|n| (1..=MAX_QUEUES).contains(n))
                .unwrap_or(expected);

            let mut record = MarchQueueRecord::new(number, QueueStatus::Idle);
            if let Some(status_line) = lines.get(i) {
                i += 1;
                match classify_status(status_line) {
                    Some(QueueStatus::Gathering) => {
                        record = MarchQueueRecord::gathering(number, status_line);
                    }
                    Some(status) => record.status = status,
                    None => {}
                }
            }

            if records.iter().any(|r| r.queue_number == number) {
                log(&format!("Duplicate march queue {} ignored", number));
            } else {
                records.push(record);
            }
            expected = expected.max(number.saturating_add(1));
            continue;
        }

        if is_gathering_line(line) {
            if !records.iter().any(|r| r.queue_number == expected) {
                records.push(MarchQueueRecord::gathering(expected, line));
            }
            expected = expected.saturating_add(1);
        }
    }

    if records.is_empty() {
        records = parse_by_lines(&lines);
    }

    records.sort_by_key(|r| r.queue_number);
    records
}

/// Looser pass: one record per line holding a status keyword.
fn parse_by_lines(lines: &[String]) -> Vec<MarchQueueRecord> {
    let mut records = Vec::new();
    let mut number = 1u32;

    for line in lines {
        if line.contains("march") && line.contains("queue") {
            continue;
        }
        let status = if line.contains("idle") {
            QueueStatus::Idle
        } else if line.contains("unlock") {
            QueueStatus::Unlock
        } else if line.contains("cannot") || line.contains("use") {
            QueueStatus::CannotUse
        } else if line.contains("gathering") || TIMER.is_match(line) {
            QueueStatus::Gathering
        } else {
            continue;
        };

        let record = if status == QueueStatus::Gathering {
            MarchQueueRecord::gathering(number, line)
        } else {
            MarchQueueRecord::new(number, status)
        };
        records.push(record);
        number += 1;
    }

    if !records.is_empty() {
        log(&format!("Line scan recovered {} queues", records.len()));
    }
    records
}

/// The queues free to receive a new march, in their original order.
pub fn available_queues(records: &[MarchQueueRecord]) -> Vec<MarchQueueRecord> {
    records
        .iter()
        .filter(|r| r.status == QueueStatus::Idle)
        .cloned()
        .collect()
}

/// Per-status counts for status reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueTally {
    counts: BTreeMap<QueueStatus, usize>,
}

impl QueueTally {
    /// Counts each status in `records`.
    pub fn from_records(records: &[MarchQueueRecord]) -> Self {
        let mut counts = BTreeMap::new();
        for r in records {
            *counts.entry(r.status).or_insert(0) += 1;
        }
        Self { counts }
    }

    /// Queues read with `status`; zero when none were.
    pub fn count(&self, status: QueueStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    /// Queues read in total.
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }
}

impl fmt::Display for QueueTally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.counts.is_empty() {
            return f.write_str("no queues read");
        }
        let parts: Vec<String> = self
            .counts
            .iter()
            .map(|(status, n)| format!("{} {}", n, status))
            .collect();
        f.write_str(&parts.join(", "))
    }
}

/// A march the player wants kept busy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarchSetting {
    pub march_number: u32,
    /// "Food", "Wood", "Stone" or "Iron"
    pub resource_type: String,
    pub level: u8,
}

impl fmt::Display for MarchSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "March {}: {} Lv.{}",
            self.march_number, self.resource_type, self.level
        )
    }
}

/// Default marches: one food and one wood, both level 1.
pub fn default_march_settings() -> Vec<MarchSetting> {
    vec![
        MarchSetting {
            march_number: 1,
            resource_type: "Food".to_string(),
            level: 1,
        },
        MarchSetting {
            march_number: 2,
            resource_type: "Wood".to_string(),
            level: 1,
        },
    ]
}

/// What a configured march needs right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarchPlan {
    /// Already gathering on this queue
    Active { march: u32, queue: u32 },
    /// Would start on this idle queue
    Start { march: u32, queue: u32 },
    /// No idle queue left
    Waiting { march: u32 },
}

/// Matches configured marches against the queues on screen.
///
/// Each gathering queue satisfies at most one setting with the same resource.
/// Unsatisfied settings take idle queues in order until none remain.
pub fn plan_marches(records: &[MarchQueueRecord], settings: &[MarchSetting]) -> Vec<MarchPlan> {
    let mut satisfied: Vec<Option<u32>> = vec![None; settings.len()];

    for record in records.iter().filter(|r| r.status == QueueStatus::Gathering) {
        let Some(resource) = &record.resource_info else {
            continue;
        };
        if let Some(slot) = settings
            .iter()
            .enumerate()
            .position(|(i, s)| satisfied[i].is_none() && &s.resource_type == resource)
        {
            satisfied[slot] = Some(record.queue_number);
        }
    }

    let mut idle = available_queues(records).into_iter();
    settings
        .iter()
        .zip(satisfied)
        .map(|(setting, active)| match active {
            Some(queue) => MarchPlan::Active {
                march: setting.march_number,
                queue,
            },
            None => match idle.next() {
                Some(q) => MarchPlan::Start {
                    march: setting.march_number,
                    queue: q.queue_number,
                },
                None => MarchPlan::Waiting {
                    march: setting.march_number,
                },
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_and_gathering_status() {
        let records = parse_march_queues("March Queue 1\nIdle\nMarch Queue 2\nGathering lv3 mill");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], MarchQueueRecord::new(1, QueueStatus::Idle));
        assert_eq!(records[1].queue_number, 2);
        assert_eq!(records[1].status, QueueStatus::Gathering);
        assert_eq!(records[1].resource_info.as_deref(), Some("Food"));
    }

    #[test]
    fn test_implicit_gathering_rows_take_next_ordinal() {
        let text = "March Queue\nMarch Queue 1\nIdle\nGathering Lv2 Quarry 00:14:09\nMarch Queue 3\nUnlock";
        let records = parse_march_queues(text);
        let summary: Vec<(u32, QueueStatus)> =
            records.iter().map(|r| (r.queue_number, r.status)).collect();
        assert_eq!(
            summary,
            vec![
                (1, QueueStatus::Idle),
                (2, QueueStatus::Gathering),
                (3, QueueStatus::Unlock)
            ]
        );
        assert_eq!(records[1].resource_info.as_deref(), Some("Stone"));
        assert_eq!(records[1].remaining_time.as_deref(), Some("00:14:09"));
    }

    #[test]
    fn test_status_line_is_consumed() {
        // "Cannot use" must not become its own record
        let records = parse_march_queues("March Queue 4\nCannot use");
        assert_eq!(records, vec![MarchQueueRecord::new(4, QueueStatus::CannotUse)]);
    }

    #[test]
    fn test_duplicate_queue_numbers_dropped() {
        let records = parse_march_queues("March Queue 1\nIdle\nMarch Queue 1\nUnlock");
        assert_eq!(records, vec![MarchQueueRecord::new(1, QueueStatus::Idle)]);
    }

    #[test]
    fn test_records_sorted_by_number() {
        let records = parse_march_queues("March Queue 3\nUnlock\nMarch Queue 1\nIdle");
        let numbers: Vec<u32> = records.iter().map(|r| r.queue_number).collect();
        assert_eq!(numbers, vec![1, 3]);
    }

    #[test]
    fn test_oversized_header_number_takes_ordinal() {
        let records = parse_march_queues("March Queue 4294967295\nIdle\nGathering lv1 mill");
        let summary: Vec<(u32, QueueStatus)> =
            records.iter().map(|r| (r.queue_number, r.status)).collect();
        assert_eq!(summary, vec![(1, QueueStatus::Idle), (2, QueueStatus::Gathering)]);
    }

    #[test]
    fn test_zero_header_number_takes_ordinal() {
        let records = parse_march_queues("March Queue 0\nIdle\nMarch Queue 2\nUnlock");
        let summary: Vec<(u32, QueueStatus)> =
            records.iter().map(|r| (r.queue_number, r.status)).collect();
        assert_eq!(summary, vec![(1, QueueStatus::Idle), (2, QueueStatus::Unlock)]);
        assert!(records.iter().all(|r| r.queue_number >= 1));
    }

    #[test]
    fn test_fallback_line_scan() {
        let records = parse_march_queues("Idle\nnoise\nUnlock\n12:30");
        let summary: Vec<(u32, QueueStatus)> =
            records.iter().map(|r| (r.queue_number, r.status)).collect();
        assert_eq!(
            summary,
            vec![
                (1, QueueStatus::Idle),
                (2, QueueStatus::Unlock),
                (3, QueueStatus::Gathering)
            ]
        );
        assert_eq!(records[2].remaining_time.as_deref(), Some("12:30"));
    }

    #[test]
    fn test_noise_only_yields_nothing() {
        assert!(parse_march_queues("").is_empty());
        assert!(parse_march_queues("ss ee ee\n???\nMarch Queue").is_empty());
    }

    #[test]
    fn test_parse_is_deterministic() {
        let text = "March Queue 1\nIdle\nGathering Lv1 Lumberyard\nMarch Queue 3\nUnlock";
        assert_eq!(parse_march_queues(text), parse_march_queues(text));
    }

    #[test]
    fn test_available_queues_only_idle() {
        let records = vec![
            MarchQueueRecord::new(1, QueueStatus::Idle),
            MarchQueueRecord::new(2, QueueStatus::Gathering),
            MarchQueueRecord::new(3, QueueStatus::Unlock),
        ];
        assert_eq!(
            available_queues(&records),
            vec![MarchQueueRecord::new(1, QueueStatus::Idle)]
        );
    }

    #[test]
    fn test_resource_mapping() {
        assert_eq!(resource_from_gathering("gathering lv3 mill"), "Food");
        assert_eq!(resource_from_gathering("Lumberyard"), "Wood");
        assert_eq!(resource_from_gathering("quarry"), "Stone");
        assert_eq!(resource_from_gathering("iron mine"), "Iron");
        assert_eq!(resource_from_gathering("gathering"), "Unknown");
    }

    #[test]
    fn test_tally_display() {
        let records = vec![
            MarchQueueRecord::new(1, QueueStatus::Idle),
            MarchQueueRecord::new(2, QueueStatus::Unlock),
            MarchQueueRecord::new(3, QueueStatus::Unlock),
        ];
        let tally = QueueTally::from_records(&records);
        assert_eq!(tally.count(QueueStatus::Unlock), 2);
        assert_eq!(tally.total(), 3);
        assert_eq!(tally.to_string(), "1 Idle, 2 Unlock");
        assert_eq!(QueueTally::default().to_string(), "no queues read");
    }

    #[test]
    fn test_plan_marches() {
        let mut gathering = MarchQueueRecord::new(2, QueueStatus::Gathering);
        gathering.resource_info = Some("Food".to_string());
        let records = vec![MarchQueueRecord::new(1, QueueStatus::Idle), gathering];

        let mut settings = default_march_settings();
        settings.push(MarchSetting {
            march_number: 3,
            resource_type: "Iron".to_string(),
            level: 2,
        });

        assert_eq!(
            plan_marches(&records, &settings),
            vec![
                MarchPlan::Active { march: 1, queue: 2 },
                MarchPlan::Start { march: 2, queue: 1 },
                MarchPlan::Waiting { march: 3 },
            ]
        );
    }
}
