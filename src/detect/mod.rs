//! Pattern Detectors
//!
//! Three independent detectors run over the filtered events of a pass:
//!
//! - `TimeBasedDetector`: daily routines at a consistent time of day
//! - `SequenceDetector`: action chains, A then B within a short window
//! - `CorrelationDetector`: states that co-occur with a target state
//!
//! Detectors are pure functions of a `DetectionInput`. They never touch the
//! pattern store; their candidates are merged by the upsert manager.

pub mod circular;
pub mod correlation;
pub mod scoring;
pub mod sequence;
pub mod time_based;

pub use correlation::CorrelationDetector;
pub use sequence::SequenceDetector;
pub use time_based::TimeBasedDetector;

use crate::events::StateEvent;
use crate::filter::AutomationLinks;
use crate::patterns::{identity_key, DayFilter, Endpoint, PatternData, PatternStatus, PatternType};
use crate::settings::{Exclusions, Tunables};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Which detector produced a result
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    TimeBased,
    EventChain,
    Correlation,
}

impl DetectorKind {
    pub fn pattern_type(&self) -> PatternType {
        match self {
            DetectorKind::TimeBased => PatternType::TimeBased,
            DetectorKind::EventChain => PatternType::EventChain,
            DetectorKind::Correlation => PatternType::Correlation,
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.pattern_type().as_str()
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detector-local failure; the pass treats it as zero candidates
#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Detector failed: {0}")]
    Internal(String),
}

pub type DetectorResult<T> = Result<T, DetectorError>;

/// A pattern proposed by a detector
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub trigger: Endpoint,
    pub action: Endpoint,
    pub data: PatternData,
    pub confidence: f64,
    /// Room of the trigger, when known
    pub room_id: Option<String>,
    /// Latest event supporting the candidate
    pub last_observed_at: DateTime<Utc>,
    /// Status used when the pattern is first stored
    pub initial_status: PatternStatus,
}

impl Candidate {
    pub fn pattern_type(&self) -> PatternType {
        self.data.pattern_type()
    }

    pub fn identity_key(&self) -> String {
        identity_key(self.pattern_type(), &self.trigger, &self.action)
    }

    /// Key of the mirror-image pattern, for entity-to-entity patterns
    pub fn reverse_key(&self) -> Option<String> {
        match (&self.trigger, &self.action) {
            (Endpoint::Entity { .. }, Endpoint::Entity { .. }) => {
                Some(identity_key(self.pattern_type(), &self.action, &self.trigger))
            }
            _ => None,
        }
    }
}

/// A rejected candidate close enough to a threshold to be worth reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearMiss {
    pub detector: DetectorKind,
    pub trigger: String,
    pub action: String,
    pub reason: String,
    pub count: usize,
    pub required_count: usize,
    pub confidence: f64,
    pub required_confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub same_room: Option<bool>,
}

/// Per-detector counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectorStats {
    pub considered: usize,
    pub rejected_by_threshold: usize,
    pub rejected_by_confidence: usize,
    pub rejected_trivial: usize,
    pub rejected_reverse: usize,
    pub rejected_top_k: usize,
    /// Automated or excluded pairs
    pub rejected_excluded: usize,
    pub accepted: usize,
}

/// Everything a detector produced in one pass
#[derive(Debug, Clone, Default)]
pub struct DetectorReport {
    pub candidates: Vec<Candidate>,
    pub near_misses: Vec<NearMiss>,
    pub stats: DetectorStats,
}

/// Calendar span of the analysed events, in local days
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AnalysisWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl AnalysisWindow {
    /// Span from the first to the last event, clipped to the lookback
    pub fn from_events(
        events: &[StateEvent],
        now: DateTime<Utc>,
        lookback_days: u32,
        offset: FixedOffset,
    ) -> Option<Self> {
        let first = events.iter().map(|e| e.timestamp).min()?;
        let last = events.iter().map(|e| e.timestamp).max()?;

        let earliest = (now - Duration::days(lookback_days as i64))
            .with_timezone(&offset)
            .date_naive();
        let start = first.with_timezone(&offset).date_naive().max(earliest);
        let end = last.with_timezone(&offset).date_naive().max(start);

        Some(Self { start, end })
    }

    /// Number of days in the window
    pub fn days(&self) -> usize {
        (self.end - self.start).num_days() as usize + 1
    }

    /// Number of days in the window matching `filter`
    pub fn count_days(&self, filter: DayFilter) -> usize {
        self.start
            .iter_days()
            .take_while(|d| *d <= self.end)
            .filter(|d| filter.matches(*d))
            .count()
    }
}

/// Read-only input shared by all detectors in a pass
#[derive(Debug, Clone)]
pub struct DetectionInput {
    /// Filtered events in timestamp order
    pub events: Vec<StateEvent>,
    pub links: AutomationLinks,
    pub exclusions: Exclusions,
    pub tunables: Tunables,
    pub window: Option<AnalysisWindow>,
    pub now: DateTime<Utc>,
}

impl DetectionInput {
    pub fn new(
        events: Vec<StateEvent>,
        links: AutomationLinks,
        exclusions: Exclusions,
        tunables: Tunables,
        now: DateTime<Utc>,
    ) -> Self {
        let window = AnalysisWindow::from_events(
            &events,
            now,
            tunables.general.lookback_days,
            tunables.general.offset(),
        );

        Self {
            events,
            links,
            exclusions,
            tunables,
            window,
            now,
        }
    }
}

/// A pattern detector
pub trait Detector: Send + Sync {
    fn kind(&self) -> DetectorKind;

    fn detect(&self, input: &DetectionInput) -> DetectorResult<DetectorReport>;
}

/// Near-miss test shared by the detectors
pub(crate) struct NearMissPolicy {
    pub fraction: f64,
    pub confidence_margin: f64,
}

impl NearMissPolicy {
    pub fn from_tunables(tunables: &Tunables) -> Self {
        Self {
            fraction: tunables.general.near_miss_fraction,
            confidence_margin: tunables.general.near_miss_confidence_margin,
        }
    }

    pub fn count_is_near(&self, count: usize, required: usize) -> bool {
        count < required && count as f64 >= self.fraction * required as f64
    }

    pub fn value_is_near(&self, value: f64, required: f64) -> bool {
        value < required && value >= required * self.fraction
    }

    pub fn confidence_is_near(&self, confidence: f64, required: f64) -> bool {
        confidence < required && confidence >= required - self.confidence_margin
    }
}

/// A candidate that passed every threshold, before bidirectional dedup
pub(crate) struct Qualified {
    pub key: String,
    pub reverse: Option<String>,
    pub count: usize,
    pub candidate: Candidate,
}

/// Keep only the stronger direction of every mirrored pair
///
/// Stronger means more observations, then higher confidence, then the
/// lexicographically smaller identity key. Returns the kept candidates and
/// how many were dropped.
pub(crate) fn dedup_bidirectional(qualified: Vec<Qualified>) -> (Vec<Candidate>, usize) {
    let index: HashMap<&str, usize> = qualified
        .iter()
        .enumerate()
        .map(|(i, q)| (q.key.as_str(), i))
        .collect();

    let stronger = |a: &Qualified, b: &Qualified| {
        a.count
            .cmp(&b.count)
            .then(a.candidate.confidence.total_cmp(&b.candidate.confidence))
            .then(b.key.cmp(&a.key))
            .is_gt()
    };

    let mut dropped = vec![false; qualified.len()];
    for (i, q) in qualified.iter().enumerate() {
        if dropped[i] {
            continue;
        }
        let Some(j) = q.reverse.as_deref().and_then(|r| index.get(r).copied()) else {
            continue;
        };
        if j == i || dropped[j] {
            continue;
        }
        if stronger(q, &qualified[j]) {
            dropped[j] = true;
        } else {
            dropped[i] = true;
        }
    }

    let dropped_count = dropped.iter().filter(|d| **d).count();
    let kept = qualified
        .into_iter()
        .zip(dropped)
        .filter(|(_, d)| !d)
        .map(|(q, _)| q.candidate)
        .collect();

    (kept, dropped_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::fixtures::{at, event};
    use chrono::Offset;

    #[test]
    fn test_window_counts_day_types() {
        let window = AnalysisWindow {
            start: NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
            end: NaiveDate::from_ymd_opt(2024, 3, 17).unwrap(),
        };
        assert_eq!(window.days(), 14);
        assert_eq!(window.count_days(DayFilter::All), 14);
        assert_eq!(window.count_days(DayFilter::Weekdays), 10);
        assert_eq!(window.count_days(DayFilter::Weekends), 4);
    }

    #[test]
    fn test_window_from_events() {
        let events = vec![
            event("light.a", "on", None, at(30, 7, 0)),
            event("light.a", "on", None, at(3, 7, 0)),
            event("light.a", "on", None, at(1, 7, 0)),
        ];
        let now = at(0, 12, 0);
        let window = AnalysisWindow::from_events(&events, now, 14, Utc.fix()).unwrap();
        assert_eq!(window.days(), 14);
        assert_eq!(window.end, at(1, 0, 0).date_naive());

        assert!(AnalysisWindow::from_events(&[], now, 14, Utc.fix()).is_none());
    }

    #[test]
    fn test_candidate_keys() {
        let candidate = Candidate {
            trigger: Endpoint::entity("switch.a", "on"),
            action: Endpoint::entity("light.b", "on"),
            data: PatternData::EventChain(crate::patterns::EventChainData {
                trigger_entity: "switch.a".to_string(),
                trigger_state: "on".to_string(),
                action_entity: "light.b".to_string(),
                action_state: "on".to_string(),
                avg_delay_secs: 2.0,
                delay_stddev_secs: 0.0,
                occurrences: 5,
                follow_ratio: 1.0,
                same_room: true,
            }),
            confidence: 0.9,
            room_id: None,
            last_observed_at: Utc::now(),
            initial_status: PatternStatus::Observed,
        };

        assert_eq!(
            candidate.identity_key(),
            "event_chain|entity:switch.a=on|entity:light.b=on"
        );
        assert_eq!(
            candidate.reverse_key().unwrap(),
            "event_chain|entity:light.b=on|entity:switch.a=on"
        );
    }

    #[test]
    fn test_near_miss_policy() {
        let policy = NearMissPolicy {
            fraction: 0.5,
            confidence_margin: 0.15,
        };
        assert!(policy.count_is_near(12, 20));
        assert!(!policy.count_is_near(9, 20));
        assert!(!policy.count_is_near(20, 20));
        assert!(policy.confidence_is_near(0.65, 0.75));
        assert!(!policy.confidence_is_near(0.5, 0.75));
    }
}
