//! Run Diagnostics
//!
//! What the most recent pass did, detector by detector. Served by the
//! status endpoint and printed by the one-shot binary.

use crate::detect::{DetectorKind, DetectorStats, NearMiss};
use crate::filter::FilterStats;
use crate::patterns::UpsertStats;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// How a pass ended
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PassOutcome {
    /// Still in progress; only seen while the pass is being assembled
    Running,
    Completed,
    /// Nothing was written and the janitor did not run
    Aborted { reason: String },
}

/// One detector's share of a pass
#[derive(Debug, Clone, Serialize)]
pub struct DetectorDiagnostics {
    pub detector: DetectorKind,
    pub stats: DetectorStats,
    pub candidates: usize,
    pub near_misses: usize,
    pub duration_ms: u64,
    /// Detector error or panic; its candidates count as zero
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed: Option<String>,
    pub upsert: UpsertStats,
    /// Store failure during this detector's upsert step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_error: Option<String>,
}

impl DetectorDiagnostics {
    pub fn new(detector: DetectorKind) -> Self {
        Self {
            detector,
            stats: DetectorStats::default(),
            candidates: 0,
            near_misses: 0,
            duration_ms: 0,
            failed: None,
            upsert: UpsertStats::default(),
            store_error: None,
        }
    }

    /// Candidates were detected but could not all be written
    pub fn detected_not_persisted(&self) -> bool {
        self.store_error.is_some()
    }
}

/// Full record of one pass
#[derive(Debug, Clone, Serialize)]
pub struct RunDiagnostics {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub outcome: PassOutcome,
    /// Settings could not be loaded; the last loaded copy was used
    pub settings_stale: bool,
    pub events_read: usize,
    pub automation_firings: usize,
    pub filter: FilterStats,
    pub detectors: Vec<DetectorDiagnostics>,
    pub near_misses: Vec<NearMiss>,
    /// Observed patterns removed by the janitor, if it ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub janitor_deleted: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub janitor_error: Option<String>,
}

impl RunDiagnostics {
    pub fn new(run_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.into(),
            started_at,
            finished_at: None,
            duration_ms: 0,
            outcome: PassOutcome::Running,
            settings_stale: false,
            events_read: 0,
            automation_firings: 0,
            filter: FilterStats::default(),
            detectors: Vec::new(),
            near_misses: Vec::new(),
            janitor_deleted: None,
            janitor_error: None,
        }
    }

    /// Close the record as completed
    pub fn complete(mut self) -> Self {
        self.outcome = PassOutcome::Completed;
        self.stamp();
        self
    }

    /// Close the record as aborted
    pub fn abort(mut self, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        tracing::error!(run_id = %self.run_id, reason = %reason, "Analysis pass aborted");
        self.outcome = PassOutcome::Aborted { reason };
        self.stamp();
        self
    }

    fn stamp(&mut self) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.duration_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
    }

    pub fn is_completed(&self) -> bool {
        self.outcome == PassOutcome::Completed
    }

    pub fn detector(&self, kind: DetectorKind) -> Option<&DetectorDiagnostics> {
        self.detectors.iter().find(|d| d.detector == kind)
    }

    /// Total candidates accepted across detectors
    pub fn accepted(&self) -> usize {
        self.detectors.iter().map(|d| d.stats.accepted).sum()
    }

    /// Total patterns written across detectors
    pub fn persisted(&self) -> usize {
        self.detectors.iter().map(|d| d.upsert.persisted()).sum()
    }
}

/// Answer to "is analysis running, and how did the last pass go"
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<RunDiagnostics>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_serialization() {
        let diag = RunDiagnostics::new("run-1", Utc::now()).abort("pattern store unavailable");
        let json = serde_json::to_value(&diag).unwrap();
        assert_eq!(json["outcome"]["state"], "aborted");
        assert_eq!(json["outcome"]["reason"], "pattern store unavailable");
        assert!(json.get("janitor_deleted").is_none());

        let diag = RunDiagnostics::new("run-2", Utc::now()).complete();
        assert!(diag.is_completed());
        assert!(diag.finished_at.is_some());
    }

    #[test]
    fn test_totals() {
        let mut diag = RunDiagnostics::new("run-1", Utc::now());
        let mut chain = DetectorDiagnostics::new(DetectorKind::EventChain);
        chain.stats.accepted = 2;
        chain.upsert.inserted = 1;
        chain.upsert.updated = 1;
        let mut time = DetectorDiagnostics::new(DetectorKind::TimeBased);
        time.stats.accepted = 1;
        time.store_error = Some("disk full".to_string());
        diag.detectors = vec![chain, time];

        assert_eq!(diag.accepted(), 3);
        assert_eq!(diag.persisted(), 2);
        assert!(diag.detector(DetectorKind::TimeBased).unwrap().detected_not_persisted());
        assert!(diag.detector(DetectorKind::Correlation).is_none());
    }
}
