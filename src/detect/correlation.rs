//! Correlation Detector
//!
//! For every target change (T, s), the partners are the other entities whose
//! latest change is still inside the recency window. Each partner state seen
//! at that moment is one co-occurrence of the pair.
//!
//! The ratio of a pair is `co-occurrences / occurrences of (T, s)`. It never
//! depends on how many other entities exist in the history.
//!
//! Suppression, in order: automated or excluded pairs, trivial partners
//! (one state held in nearly every sample), per-room thresholds, mirrored
//! pairs, and finally the top-K cut per trigger entity. Cross-room links
//! that survive are also aggregated into room-pair insights.

use crate::detect::scoring::{support_score, weighted_confidence};
use crate::detect::{
    dedup_bidirectional, Candidate, DetectionInput, Detector, DetectorKind, DetectorReport,
    DetectorResult, NearMiss, NearMissPolicy, Qualified,
};
use crate::events::StateEvent;
use crate::patterns::{CorrelationData, CorrelationScope, Endpoint, PatternData, PatternStatus};
use crate::settings::CorrelationTunables;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Detects states that hold whenever a target state occurs
#[derive(Debug, Default, Clone, Copy)]
pub struct CorrelationDetector;

impl CorrelationDetector {
    pub fn new() -> Self {
        Self
    }
}

type EntityState<'a> = (&'a str, &'a str);

struct PairObservations<'a> {
    /// Latest co-occurrence; its rooms are the pair's current rooms
    target: &'a StateEvent,
    partner: &'a StateEvent,
    count: usize,
    last_seen: DateTime<Utc>,
}

/// Co-occurrence counts gathered in one walk over the events
#[derive(Default)]
struct CoOccurrence<'a> {
    /// Occurrences of each target (entity, state)
    occurrences: HashMap<EntityState<'a>, usize>,
    /// Times each entity was sampled as a partner
    partner_samples: HashMap<&'a str, usize>,
    /// Times each partner (entity, state) was sampled
    partner_state_samples: HashMap<EntityState<'a>, usize>,
    /// Keyed by (target, partner)
    pairs: BTreeMap<(EntityState<'a>, EntityState<'a>), PairObservations<'a>>,
}

impl<'a> CoOccurrence<'a> {
    fn collect(events: &'a [StateEvent], window: Duration) -> Self {
        let mut acc = Self::default();
        let mut active: HashMap<&'a str, &'a StateEvent> = HashMap::new();
        let mut expiry: VecDeque<&'a StateEvent> = VecDeque::new();

        for target in events.iter().filter(|e| !e.has_numeric_state()) {
            while let Some(oldest) = expiry.front().copied() {
                if target.timestamp - oldest.timestamp <= window {
                    break;
                }
                expiry.pop_front();
                if active
                    .get(oldest.entity_id.as_str())
                    .is_some_and(|current| std::ptr::eq(*current, oldest))
                {
                    active.remove(oldest.entity_id.as_str());
                }
            }

            let target_key = (target.entity_id.as_str(), target.new_state.as_str());
            *acc.occurrences.entry(target_key).or_default() += 1;

            for partner in active.values().copied() {
                if partner.entity_id == target.entity_id {
                    continue;
                }
                let partner_key = (partner.entity_id.as_str(), partner.new_state.as_str());
                *acc.partner_samples.entry(partner_key.0).or_default() += 1;
                *acc.partner_state_samples.entry(partner_key).or_default() += 1;

                let obs = acc
                    .pairs
                    .entry((target_key, partner_key))
                    .or_insert_with(|| PairObservations {
                        target,
                        partner,
                        count: 0,
                        last_seen: target.timestamp,
                    });
                obs.count += 1;
                if target.timestamp >= obs.last_seen {
                    obs.target = target;
                    obs.partner = partner;
                    obs.last_seen = target.timestamp;
                }
            }

            active.insert(target.entity_id.as_str(), target);
            expiry.push_back(target);
        }

        acc
    }

    /// Share of a partner's samples spent in `state`
    fn partner_share(&self, partner: EntityState<'a>) -> f64 {
        let total = self.partner_samples.get(partner.0).copied().unwrap_or(0);
        if total == 0 {
            return 0.0;
        }
        let in_state = self.partner_state_samples.get(&partner).copied().unwrap_or(0);
        in_state as f64 / total as f64
    }
}

impl Detector for CorrelationDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Correlation
    }

    fn detect(&self, input: &DetectionInput) -> DetectorResult<DetectorReport> {
        let mut report = DetectorReport::default();
        let tunables = &input.tunables.correlation;
        let near = NearMissPolicy::from_tunables(&input.tunables);
        let window = Duration::minutes(tunables.recency_window_minutes.min(7 * 1440) as i64);

        let co = CoOccurrence::collect(&input.events, window);
        let mut qualified = Vec::new();
        let mut target_rooms: HashMap<String, String> = HashMap::new();

        for ((target_key, partner_key), obs) in &co.pairs {
            report.stats.considered += 1;
            let target = obs.target;
            let partner = obs.partner;

            if input.links.links_either(&partner.entity_id, &target.entity_id)
                || input
                    .exclusions
                    .is_domain_pair_excluded(&partner.domain, &target.domain)
            {
                report.stats.rejected_excluded += 1;
                continue;
            }

            if co.partner_share(*partner_key) >= tunables.triviality_threshold {
                report.stats.rejected_trivial += 1;
                continue;
            }

            let same_room = matches!(
                (&partner.room_id, &target.room_id),
                (Some(a), Some(b)) if a == b
            );
            let (min_ratio, min_count, min_confidence) = if same_room {
                (
                    tunables.same_room_min_ratio,
                    tunables.same_room_min_count,
                    tunables.same_room_min_confidence,
                )
            } else {
                (
                    tunables.cross_room_min_ratio,
                    tunables.cross_room_min_count,
                    tunables.cross_room_min_confidence,
                )
            };

            let target_occurrences = co.occurrences.get(target_key).copied().unwrap_or(obs.count).max(1);
            let ratio = (obs.count as f64 / target_occurrences as f64).min(1.0);
            let confidence = weighted_confidence(&[
                (ratio, tunables.weight_ratio),
                (support_score(obs.count, min_count), tunables.weight_support),
            ]);

            let trigger_ep = Endpoint::entity(&partner.entity_id, &partner.new_state);
            let action_ep = Endpoint::entity(&target.entity_id, &target.new_state);

            let near_miss = |reason: &str| NearMiss {
                detector: DetectorKind::Correlation,
                trigger: trigger_ep.key(),
                action: action_ep.key(),
                reason: reason.to_string(),
                count: obs.count,
                required_count: min_count,
                confidence,
                required_confidence: min_confidence,
                same_room: Some(same_room),
            };

            if obs.count < min_count {
                report.stats.rejected_by_threshold += 1;
                if near.count_is_near(obs.count, min_count) && ratio >= min_ratio {
                    report.near_misses.push(near_miss("too few co-occurrences"));
                }
                continue;
            }

            if ratio < min_ratio {
                report.stats.rejected_by_threshold += 1;
                if near.value_is_near(ratio, min_ratio) {
                    report.near_misses.push(near_miss("ratio below floor"));
                }
                continue;
            }

            if confidence < min_confidence {
                report.stats.rejected_by_confidence += 1;
                if near.confidence_is_near(confidence, min_confidence) {
                    report.near_misses.push(near_miss("confidence below floor"));
                }
                continue;
            }

            let is_sensor_pair = is_sensor(tunables, &partner.domain) && is_sensor(tunables, &target.domain);

            let candidate = Candidate {
                data: PatternData::Correlation(CorrelationData {
                    scope: CorrelationScope::EntityPair,
                    partner_entity: partner.entity_id.clone(),
                    partner_state: partner.new_state.clone(),
                    ratio,
                    occurrences: obs.count as u32,
                    target_occurrences: target_occurrences as u32,
                    same_room,
                    linked_pairs: 0,
                }),
                trigger: trigger_ep,
                action: action_ep,
                confidence,
                room_id: partner.room_id.clone(),
                last_observed_at: obs.last_seen,
                initial_status: if is_sensor_pair {
                    PatternStatus::Insight
                } else {
                    PatternStatus::Observed
                },
            };

            let key = candidate.identity_key();
            if let (false, Some(room)) = (same_room, &target.room_id) {
                target_rooms.insert(key.clone(), room.clone());
            }

            qualified.push(Qualified {
                key,
                reverse: candidate.reverse_key(),
                count: obs.count,
                candidate,
            });
        }

        let (kept, dropped) = dedup_bidirectional(qualified);
        report.stats.rejected_reverse += dropped;

        let (mut kept, cut) = keep_top_k(kept, tunables.top_k);
        report.stats.rejected_top_k += cut;

        let room_pairs = room_pair_insights(&kept, &target_rooms, tunables.room_pair_min_links);
        kept.extend(room_pairs);

        report.stats.accepted = kept.len();
        report.candidates = kept;

        tracing::debug!(
            detector = "correlation",
            considered = report.stats.considered,
            accepted = report.stats.accepted,
            rejected_trivial = report.stats.rejected_trivial,
            rejected_top_k = report.stats.rejected_top_k,
            "Correlation detection finished"
        );

        Ok(report)
    }
}

fn is_sensor(tunables: &CorrelationTunables, domain: &str) -> bool {
    tunables.sensor_domains.iter().any(|d| d == domain)
}

/// Keep the `k` strongest candidates per trigger entity
fn keep_top_k(candidates: Vec<Candidate>, k: usize) -> (Vec<Candidate>, usize) {
    let mut by_trigger: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();
    for candidate in candidates {
        let trigger = candidate.trigger.entity_id().unwrap_or_default().to_string();
        by_trigger.entry(trigger).or_default().push(candidate);
    }

    let mut kept = Vec::new();
    let mut cut = 0;
    for (_, mut group) in by_trigger {
        group.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.identity_key().cmp(&b.identity_key()))
        });
        if group.len() > k {
            cut += group.len() - k;
            group.truncate(k);
        }
        kept.extend(group);
    }

    (kept, cut)
}

/// Aggregate cross-room entity correlations into room-pair insights
///
/// `target_rooms` maps the identity key of each cross-room candidate to the
/// room of its target entity.
fn room_pair_insights(
    candidates: &[Candidate],
    target_rooms: &HashMap<String, String>,
    min_links: usize,
) -> Vec<Candidate> {
    let mut groups: BTreeMap<(String, String), Vec<(&Candidate, &CorrelationData)>> = BTreeMap::new();

    for candidate in candidates {
        let PatternData::Correlation(data) = &candidate.data else {
            continue;
        };
        if data.same_room {
            continue;
        }
        let Some(partner_room) = candidate.room_id.as_deref() else {
            continue;
        };
        let Some(target_room) = target_rooms.get(&candidate.identity_key()) else {
            continue;
        };
        let target_room = target_room.as_str();
        let pair = if partner_room <= target_room {
            (partner_room.to_string(), target_room.to_string())
        } else {
            (target_room.to_string(), partner_room.to_string())
        };
        groups.entry(pair).or_default().push((candidate, data));
    }

    groups
        .into_iter()
        .filter(|(_, links)| links.len() >= min_links.max(1))
        .map(|((room_a, room_b), links)| {
            let n = links.len() as f64;
            let ratio = links.iter().map(|(_, d)| d.ratio).sum::<f64>() / n;
            let confidence = links.iter().map(|(c, _)| c.confidence).sum::<f64>() / n;
            let last_observed_at = links
                .iter()
                .map(|(c, _)| c.last_observed_at)
                .max()
                .unwrap_or_else(Utc::now);

            Candidate {
                trigger: Endpoint::Room {
                    room_id: room_a.clone(),
                },
                action: Endpoint::Room {
                    room_id: room_b,
                },
                data: PatternData::Correlation(CorrelationData {
                    scope: CorrelationScope::RoomPair,
                    partner_entity: room_a.clone(),
                    partner_state: "any".to_string(),
                    ratio,
                    occurrences: links.iter().map(|(_, d)| d.occurrences).sum(),
                    target_occurrences: links.iter().map(|(_, d)| d.target_occurrences).sum(),
                    same_room: false,
                    linked_pairs: links.len() as u32,
                }),
                confidence: confidence.clamp(0.0, 1.0),
                room_id: Some(room_a),
                last_observed_at,
                initial_status: PatternStatus::Insight,
            }
        })
        .collect()
}
