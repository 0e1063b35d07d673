//! Confidence & Upsert Manager
//!
//! Merges detector candidates into stored patterns and exposes the
//! single-row status operations used by the control surface.
//!
//! Upsert rules, per candidate:
//! - existing terminal record (rejected / disabled): left untouched
//! - existing record, no newer supporting events: run id reconfirmed only
//! - existing record, new evidence: confidence blended, match count +1,
//!   promoted to `suggested` once confident enough
//! - reverse of an existing chain/correlation: skipped
//! - otherwise: inserted with the candidate's initial status
//!
//! A time-based candidate whose key is unknown is first matched against
//! stored routines for the same entity and state whose mean lies within
//! tolerance. A routine drifting across an hour boundary or changing its
//! day filter keeps its record, and with it any rejection.

use crate::detect::circular::circular_distance;
use crate::detect::Candidate;
use crate::patterns::error::{StoreError, StoreResult};
use crate::patterns::store::{Observation, PatternStore};
use crate::patterns::types::{LearnedPattern, PatternData, PatternFilter, PatternStatus};
use crate::settings::UpsertTunables;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Blend a prior confidence with a new observation
///
/// `weight` is the share given to the new observation. The result is
/// clamped to [0, 1].
pub fn blend_confidence(old: f64, new: f64, weight: f64) -> f64 {
    let weight = weight.clamp(0.0, 1.0);
    (weight * new + (1.0 - weight) * old).clamp(0.0, 1.0)
}

#[derive(Debug, Clone)]
struct CachedPattern {
    status: PatternStatus,
    confidence: f64,
    match_count: u32,
    last_observed_at: DateTime<Utc>,
    routine: Option<RoutineAnchor>,
}

impl From<&LearnedPattern> for CachedPattern {
    fn from(p: &LearnedPattern) -> Self {
        Self {
            status: p.status,
            confidence: p.confidence,
            match_count: p.match_count,
            last_observed_at: p.last_observed_at,
            routine: RoutineAnchor::of(&p.data),
        }
    }
}

/// Where a time-based pattern sits on the clock
#[derive(Debug, Clone, PartialEq)]
struct RoutineAnchor {
    entity_id: String,
    state: String,
    mean_minute: f64,
    tolerance_minutes: f64,
}

impl RoutineAnchor {
    fn of(data: &PatternData) -> Option<Self> {
        match data {
            PatternData::TimeBased(d) => Some(Self {
                entity_id: d.entity_id.clone(),
                state: d.state.clone(),
                mean_minute: d.mean_minute,
                tolerance_minutes: d.tolerance_minutes,
            }),
            _ => None,
        }
    }

    /// Distance to `other` if both describe the same routine
    fn drift_to(&self, other: &RoutineAnchor) -> Option<f64> {
        if self.entity_id != other.entity_id || self.state != other.state {
            return None;
        }
        let distance = circular_distance(self.mean_minute, other.mean_minute);
        (distance <= self.tolerance_minutes.max(other.tolerance_minutes)).then_some(distance)
    }
}

/// Identity-key lookup cache scoped to a single pass
///
/// Filled once from the store at pass start so upserts never look patterns
/// up one by one.
#[derive(Debug, Default)]
pub struct RunCache {
    entries: HashMap<String, CachedPattern>,
    touched: HashSet<String>,
}

impl RunCache {
    /// Load every stored identity key
    pub fn prefetch(store: &dyn PatternStore) -> StoreResult<Self> {
        let entries = store
            .list(&PatternFilter::default())?
            .iter()
            .map(|p| (p.identity_key.clone(), CachedPattern::from(p)))
            .collect();

        Ok(Self {
            entries,
            touched: HashSet::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, identity_key: &str) -> bool {
        self.entries.contains_key(identity_key)
    }

    pub fn status_of(&self, identity_key: &str) -> Option<PatternStatus> {
        self.entries.get(identity_key).map(|c| c.status)
    }

    /// Identity keys written during this pass
    pub fn touched(&self) -> usize {
        self.touched.len()
    }

    /// Stored key a candidate merges into
    ///
    /// The candidate's own key when stored; otherwise, for a time-based
    /// candidate, the nearest stored routine it has drifted from.
    fn resolve(&self, candidate: &Candidate) -> String {
        let key = candidate.identity_key();
        if self.entries.contains_key(&key) {
            return key;
        }

        let Some(anchor) = RoutineAnchor::of(&candidate.data) else {
            return key;
        };

        self.entries
            .iter()
            .filter_map(|(stored, cached)| {
                let drift = cached.routine.as_ref()?.drift_to(&anchor)?;
                Some((drift, stored))
            })
            .min_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(b.1)))
            .map(|(drift, stored)| {
                tracing::debug!(
                    identity_key = %key,
                    stored_key = %stored,
                    drift_minutes = drift,
                    "Routine drifted, merging into stored pattern"
                );
                stored.clone()
            })
            .unwrap_or(key)
    }
}

/// What happened to one candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Updated and moved from observed to suggested
    Promoted,
    /// Nothing new since the last run; only the run id was refreshed
    Reconfirmed,
    SkippedTerminal,
    /// The mirror-image pattern already exists
    SkippedReverse,
    /// Same identity key already handled earlier in this pass
    SkippedDuplicate,
}

/// Per-detector upsert counts
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpsertStats {
    pub inserted: usize,
    pub updated: usize,
    pub promoted: usize,
    pub reconfirmed: usize,
    pub skipped_terminal: usize,
    pub skipped_reverse: usize,
    pub skipped_duplicate: usize,
}

impl UpsertStats {
    fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Promoted => {
                self.updated += 1;
                self.promoted += 1;
            }
            UpsertOutcome::Reconfirmed => self.reconfirmed += 1,
            UpsertOutcome::SkippedTerminal => self.skipped_terminal += 1,
            UpsertOutcome::SkippedReverse => self.skipped_reverse += 1,
            UpsertOutcome::SkippedDuplicate => self.skipped_duplicate += 1,
        }
    }

    /// Candidates written to the store
    pub fn persisted(&self) -> usize {
        self.inserted + self.updated + self.reconfirmed
    }
}

/// Confidence & upsert manager over a pattern store
#[derive(Clone)]
pub struct PatternManager {
    store: Arc<dyn PatternStore>,
}

impl PatternManager {
    pub fn new(store: Arc<dyn PatternStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn PatternStore> {
        &self.store
    }

    /// Merge one candidate into the store
    pub fn upsert(
        &self,
        cache: &mut RunCache,
        candidate: &Candidate,
        run_id: &str,
        tunables: &UpsertTunables,
    ) -> StoreResult<UpsertOutcome> {
        let key = cache.resolve(candidate);

        if cache.touched.contains(&key) {
            return Ok(UpsertOutcome::SkippedDuplicate);
        }

        if let Some(reverse) = candidate.reverse_key() {
            if !cache.contains(&key) && cache.contains(&reverse) {
                tracing::debug!(identity_key = %key, "Reverse pattern already stored, skipping");
                return Ok(UpsertOutcome::SkippedReverse);
            }
        }

        let outcome = match cache.entries.get(&key).cloned() {
            Some(existing) => self.update_existing(cache, &key, existing, candidate, run_id, tunables)?,
            None => self.insert_new(cache, &key, candidate, run_id, tunables)?,
        };

        cache.touched.insert(key);
        Ok(outcome)
    }

    /// Merge a detector's candidates, stopping at the first store error
    ///
    /// Returns the counts so far and the error, if any.
    pub fn upsert_all(
        &self,
        cache: &mut RunCache,
        candidates: &[Candidate],
        run_id: &str,
        tunables: &UpsertTunables,
    ) -> (UpsertStats, Option<StoreError>) {
        let mut stats = UpsertStats::default();

        for candidate in candidates {
            match self.upsert(cache, candidate, run_id, tunables) {
                Ok(outcome) => stats.record(outcome),
                Err(e) => return (stats, Some(e)),
            }
        }

        (stats, None)
    }

    fn update_existing(
        &self,
        cache: &mut RunCache,
        key: &str,
        existing: CachedPattern,
        candidate: &Candidate,
        run_id: &str,
        tunables: &UpsertTunables,
    ) -> StoreResult<UpsertOutcome> {
        if existing.status.is_terminal() {
            return Ok(UpsertOutcome::SkippedTerminal);
        }

        if candidate.last_observed_at <= existing.last_observed_at {
            return if self.store.confirm_run(key, run_id)? {
                Ok(UpsertOutcome::Reconfirmed)
            } else {
                self.mark_terminal(cache, key)
            };
        }

        let confidence = blend_confidence(
            existing.confidence,
            candidate.confidence,
            tunables.new_observation_weight,
        );
        let match_count = existing.match_count.saturating_add(1);
        let promote = existing.status == PatternStatus::Observed
            && confidence >= tunables.suggest_confidence
            && match_count >= tunables.suggest_min_matches;

        let obs = Observation {
            confidence,
            data: &candidate.data,
            last_observed_at: candidate.last_observed_at,
            run_id,
            promote,
            now: Utc::now(),
        };

        if !self.store.record_observation(key, &obs)? {
            return self.mark_terminal(cache, key);
        }

        let status = if promote {
            PatternStatus::Suggested
        } else {
            existing.status
        };
        cache.entries.insert(
            key.to_string(),
            CachedPattern {
                status,
                confidence,
                match_count,
                last_observed_at: candidate.last_observed_at,
                routine: RoutineAnchor::of(&candidate.data),
            },
        );

        if promote {
            tracing::info!(identity_key = %key, confidence, match_count, "Pattern promoted to suggested");
            Ok(UpsertOutcome::Promoted)
        } else {
            Ok(UpsertOutcome::Updated)
        }
    }

    fn insert_new(
        &self,
        cache: &mut RunCache,
        key: &str,
        candidate: &Candidate,
        run_id: &str,
        tunables: &UpsertTunables,
    ) -> StoreResult<UpsertOutcome> {
        let now = Utc::now();
        let pattern = LearnedPattern {
            id: uuid::Uuid::new_v4().to_string(),
            identity_key: key.to_string(),
            pattern_type: candidate.pattern_type(),
            trigger: candidate.trigger.clone(),
            action: candidate.action.clone(),
            data: candidate.data.clone(),
            confidence: candidate.confidence.clamp(0.0, 1.0),
            match_count: 1,
            status: candidate.initial_status,
            room_id: candidate.room_id.clone(),
            created_at: now,
            updated_at: now,
            last_observed_at: candidate.last_observed_at,
            last_confirmed_run_id: Some(run_id.to_string()),
            rejection_reason: None,
            test_mode: false,
        };

        if self.store.insert(&pattern)? {
            cache.entries.insert(key.to_string(), CachedPattern::from(&pattern));
            tracing::debug!(identity_key = %key, confidence = pattern.confidence, "Inserted pattern");
            return Ok(UpsertOutcome::Inserted);
        }

        // Inserted by someone else since the prefetch
        match self.store.find_by_key(key)? {
            Some(existing) => {
                let cached = CachedPattern::from(&existing);
                cache.entries.insert(key.to_string(), cached.clone());
                self.update_existing(cache, key, cached, candidate, run_id, tunables)
            }
            None => Err(StoreError::Unavailable(format!(
                "pattern {} neither inserted nor found",
                key
            ))),
        }
    }

    /// The row turned terminal (or vanished) after the prefetch
    fn mark_terminal(&self, cache: &mut RunCache, key: &str) -> StoreResult<UpsertOutcome> {
        match self.store.find_by_key(key)? {
            Some(current) => {
                cache.entries.insert(key.to_string(), CachedPattern::from(&current));
            }
            None => {
                cache.entries.remove(key);
            }
        }
        Ok(UpsertOutcome::SkippedTerminal)
    }

    // ============================================
    // Single-row operations
    // ============================================

    pub fn list(&self, filter: &PatternFilter) -> StoreResult<Vec<LearnedPattern>> {
        self.store.list(filter)
    }

    pub fn get(&self, id: &str) -> StoreResult<LearnedPattern> {
        self.store.get(id)
    }

    /// Reject a pattern; sticky across future detections
    pub fn reject(&self, id: &str, reason: Option<&str>) -> StoreResult<LearnedPattern> {
        self.transition(id, "reject", PatternStatus::Rejected, reason, &ALL_STATUSES)
    }

    /// Move a rejected or disabled pattern back to `suggested`
    pub fn reactivate(&self, id: &str) -> StoreResult<LearnedPattern> {
        let current = self.store.get(id)?;
        if !current.status.is_terminal() {
            return Ok(current);
        }
        self.transition(
            id,
            "reactivate",
            PatternStatus::Suggested,
            None,
            &[PatternStatus::Rejected, PatternStatus::Disabled],
        )
    }

    pub fn enable(&self, id: &str) -> StoreResult<LearnedPattern> {
        self.transition(id, "enable", PatternStatus::Active, None, &NOT_REJECTED)
    }

    pub fn disable(&self, id: &str) -> StoreResult<LearnedPattern> {
        self.transition(id, "disable", PatternStatus::Disabled, None, &NOT_REJECTED)
    }

    pub fn set_test_mode(&self, id: &str, enabled: bool) -> StoreResult<LearnedPattern> {
        if !self.store.set_test_mode(id, enabled, Utc::now())? {
            return Err(StoreError::NotFound(id.to_string()));
        }
        self.store.get(id)
    }

    pub fn delete(&self, id: &str) -> StoreResult<()> {
        if !self.store.delete(id)? {
            return Err(StoreError::NotFound(id.to_string()));
        }
        tracing::info!(pattern_id = %id, "Deleted pattern");
        Ok(())
    }

    fn transition(
        &self,
        id: &str,
        action: &'static str,
        to: PatternStatus,
        reason: Option<&str>,
        allowed_from: &[PatternStatus],
    ) -> StoreResult<LearnedPattern> {
        let current = self.store.get(id)?;
        if current.status == to && to != PatternStatus::Rejected {
            return Ok(current);
        }
        if !allowed_from.contains(&current.status) {
            return Err(StoreError::InvalidTransition {
                action,
                from: current.status,
            });
        }

        if !self
            .store
            .update_status(id, to, reason, allowed_from, Utc::now())?
        {
            let latest = self.store.get(id)?;
            return Err(StoreError::InvalidTransition {
                action,
                from: latest.status,
            });
        }

        tracing::info!(pattern_id = %id, from = %current.status, to = %to, "Pattern status changed");
        self.store.get(id)
    }
}

const ALL_STATUSES: [PatternStatus; 6] = [
    PatternStatus::Observed,
    PatternStatus::Suggested,
    PatternStatus::Active,
    PatternStatus::Disabled,
    PatternStatus::Rejected,
    PatternStatus::Insight,
];

const NOT_REJECTED: [PatternStatus; 5] = [
    PatternStatus::Observed,
    PatternStatus::Suggested,
    PatternStatus::Active,
    PatternStatus::Disabled,
    PatternStatus::Insight,
];
