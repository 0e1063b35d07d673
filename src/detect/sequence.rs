//! Event-Chain (Sequence) Detector
//!
//! Counts how often a change B follows a change A within the chain window.
//! Each A contributes at most one observation per (B, state), and a chain
//! stops at the next change of A itself.
//!
//! Same-room chains need modest evidence. Cross-room chains need far more,
//! and their delays must also be consistent: frequency alone across rooms
//! is not evidence of cause.

use crate::detect::scoring::{mean_std, recency_score, timing_consistency, weighted_confidence};
use crate::detect::{
    dedup_bidirectional, Candidate, DetectionInput, Detector, DetectorKind, DetectorReport,
    DetectorResult, NearMiss, NearMissPolicy, Qualified,
};
use crate::events::StateEvent;
use crate::patterns::{Endpoint, EventChainData, PatternData, PatternStatus};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Detects A-then-B action chains
#[derive(Debug, Default, Clone, Copy)]
pub struct SequenceDetector;

impl SequenceDetector {
    pub fn new() -> Self {
        Self
    }
}

type EntityState<'a> = (&'a str, &'a str);

struct ChainObservations<'a> {
    /// Latest occurrence; its rooms are the pair's current rooms
    trigger: &'a StateEvent,
    action: &'a StateEvent,
    delays: Vec<f64>,
    last_seen: DateTime<Utc>,
}

impl Detector for SequenceDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::EventChain
    }

    fn detect(&self, input: &DetectionInput) -> DetectorResult<DetectorReport> {
        let mut report = DetectorReport::default();
        let tunables = &input.tunables.chain;
        let near = NearMissPolicy::from_tunables(&input.tunables);
        let window = Duration::seconds(tunables.window_secs.min(86_400) as i64);
        let events = &input.events;

        let mut occurrences: HashMap<EntityState<'_>, usize> = HashMap::new();
        let mut chains: BTreeMap<(EntityState<'_>, EntityState<'_>), ChainObservations<'_>> =
            BTreeMap::new();

        for (i, a) in events.iter().enumerate() {
            if a.has_numeric_state() {
                continue;
            }
            *occurrences
                .entry((a.entity_id.as_str(), a.new_state.as_str()))
                .or_default() += 1;

            let mut seen: HashSet<EntityState<'_>> = HashSet::new();
            for b in &events[i + 1..] {
                let delay = b.timestamp - a.timestamp;
                if delay > window || b.entity_id == a.entity_id {
                    break;
                }
                if delay <= Duration::zero() || b.has_numeric_state() {
                    continue;
                }

                let b_key = (b.entity_id.as_str(), b.new_state.as_str());
                if !seen.insert(b_key) {
                    continue;
                }

                let obs = chains
                    .entry(((a.entity_id.as_str(), a.new_state.as_str()), b_key))
                    .or_insert_with(|| ChainObservations {
                        trigger: a,
                        action: b,
                        delays: Vec::new(),
                        last_seen: b.timestamp,
                    });
                obs.delays.push(delay.num_milliseconds() as f64 / 1000.0);
                if b.timestamp >= obs.last_seen {
                    obs.trigger = a;
                    obs.action = b;
                    obs.last_seen = b.timestamp;
                }
            }
        }

        let mut qualified = Vec::new();

        for ((a_key, _), obs) in &chains {
            report.stats.considered += 1;
            let trigger = obs.trigger;
            let action = obs.action;

            if input.links.links_either(&trigger.entity_id, &action.entity_id)
                || input
                    .exclusions
                    .is_domain_pair_excluded(&trigger.domain, &action.domain)
            {
                report.stats.rejected_excluded += 1;
                continue;
            }

            let same_room = matches!(
                (&trigger.room_id, &action.room_id),
                (Some(a), Some(b)) if a == b
            );
            let (min_count, min_confidence) = if same_room {
                (tunables.same_room_min_count, tunables.same_room_min_confidence)
            } else {
                (tunables.cross_room_min_count, tunables.cross_room_min_confidence)
            };

            let count = obs.delays.len();
            let trigger_count = occurrences.get(a_key).copied().unwrap_or(count).max(1);
            let follow_ratio = (count as f64 / trigger_count as f64).min(1.0);
            let (avg_delay, delay_std) = mean_std(&obs.delays);
            let timing = timing_consistency(delay_std, avg_delay, tunables.min_delay_tolerance_secs);
            let recency = recency_score(obs.last_seen, input.now, input.tunables.general.lookback_days);

            let confidence = weighted_confidence(&[
                (follow_ratio, tunables.weight_follow),
                (timing, tunables.weight_timing),
                (recency, tunables.weight_recency),
            ]);

            let trigger_ep = Endpoint::entity(&trigger.entity_id, &trigger.new_state);
            let action_ep = Endpoint::entity(&action.entity_id, &action.new_state);

            let near_miss = |reason: &str| NearMiss {
                detector: DetectorKind::EventChain,
                trigger: trigger_ep.key(),
                action: action_ep.key(),
                reason: reason.to_string(),
                count,
                required_count: min_count,
                confidence,
                required_confidence: min_confidence,
                same_room: Some(same_room),
            };

            if count < min_count {
                report.stats.rejected_by_threshold += 1;
                if near.count_is_near(count, min_count) {
                    report.near_misses.push(near_miss(if same_room {
                        "too few same-room chains"
                    } else {
                        "too few cross-room chains"
                    }));
                }
                continue;
            }

            if !same_room && delay_std > tunables.max_delay_stddev_secs {
                report.stats.rejected_by_threshold += 1;
                report.near_misses.push(near_miss("cross-room delay too variable"));
                continue;
            }

            if confidence < min_confidence {
                report.stats.rejected_by_confidence += 1;
                if near.confidence_is_near(confidence, min_confidence) {
                    report.near_misses.push(near_miss("confidence below floor"));
                }
                continue;
            }

            let candidate = Candidate {
                data: PatternData::EventChain(EventChainData {
                    trigger_entity: trigger.entity_id.clone(),
                    trigger_state: trigger.new_state.clone(),
                    action_entity: action.entity_id.clone(),
                    action_state: action.new_state.clone(),
                    avg_delay_secs: avg_delay,
                    delay_stddev_secs: delay_std,
                    occurrences: count as u32,
                    follow_ratio,
                    same_room,
                }),
                trigger: trigger_ep,
                action: action_ep,
                confidence,
                room_id: trigger.room_id.clone(),
                last_observed_at: obs.last_seen,
                initial_status: PatternStatus::Observed,
            };

            qualified.push(Qualified {
                key: candidate.identity_key(),
                reverse: candidate.reverse_key(),
                count,
                candidate,
            });
        }

        let (kept, dropped) = dedup_bidirectional(qualified);
        report.stats.rejected_reverse += dropped;
        report.stats.accepted = kept.len();
        report.candidates = kept;

        tracing::debug!(
            detector = "event_chain",
            considered = report.stats.considered,
            accepted = report.stats.accepted,
            rejected_reverse = report.stats.rejected_reverse,
            "Chain detection finished"
        );

        Ok(report)
    }
}
