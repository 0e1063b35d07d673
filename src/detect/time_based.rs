//! Time-based Detector
//!
//! Finds entity/state pairs that recur at a consistent local time of day.
//!
//! Per (entity, state):
//! 1. split the times of day into circular clusters (a light may have both
//!    a 07:00 and a 19:00 routine)
//! 2. drop clusters with no concentration (an entity firing all day long)
//! 3. count occurrence days; the day boundary is placed opposite the
//!    cluster mean so a routine around midnight is one day
//! 4. pick the weekday grouping that best fits the observed days
//! 5. derive the tolerance window from the circular spread of all members
//! 6. optionally express the timing relative to sunrise or sunset

use crate::detect::circular::{circular_clusters, circular_stats, signed_offset};
use crate::detect::scoring::{mean_std, recency_score, weighted_confidence};
use crate::detect::{
    AnalysisWindow, Candidate, DetectionInput, Detector, DetectorKind, DetectorReport,
    DetectorResult, NearMiss, NearMissPolicy,
};
use crate::events::StateEvent;
use crate::patterns::{
    DayFilter, Endpoint, PatternData, PatternStatus, SunAnchor, SunOffset, TimeBasedData,
};
use crate::settings::TimeTunables;
use chrono::{Duration, FixedOffset, NaiveDate};
use std::collections::{BTreeMap, HashMap};

/// Detects daily routines
#[derive(Debug, Default, Clone, Copy)]
pub struct TimeBasedDetector;

impl TimeBasedDetector {
    pub fn new() -> Self {
        Self
    }
}

enum Verdict {
    Accepted(Candidate),
    BelowThreshold(Option<NearMiss>),
    BelowConfidence(Option<NearMiss>),
}

impl Detector for TimeBasedDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::TimeBased
    }

    fn detect(&self, input: &DetectionInput) -> DetectorResult<DetectorReport> {
        let mut report = DetectorReport::default();
        let Some(window) = input.window else {
            return Ok(report);
        };

        let tunables = &input.tunables.time;
        let offset = input.tunables.general.offset();

        let mut groups: BTreeMap<(&str, &str), Vec<&StateEvent>> = BTreeMap::new();
        for event in &input.events {
            if event.has_numeric_state() {
                continue;
            }
            groups
                .entry((event.entity_id.as_str(), event.new_state.as_str()))
                .or_default()
                .push(event);
        }

        let mut accepted: HashMap<String, Candidate> = HashMap::new();

        for (_, events) in groups {
            let minutes: Vec<f64> = events.iter().map(|e| e.minute_of_day(offset)).collect();

            for cluster in circular_clusters(&minutes, tunables.cluster_gap_minutes) {
                report.stats.considered += 1;
                let mut members: Vec<&StateEvent> = cluster.iter().map(|&i| events[i]).collect();
                members.sort_by_key(|e| e.timestamp);

                match evaluate(&members, window, offset, input) {
                    Verdict::Accepted(candidate) => {
                        let key = candidate.identity_key();
                        let keep = accepted
                            .get(&key)
                            .map_or(true, |existing| candidate.confidence > existing.confidence);
                        if keep {
                            accepted.insert(key, candidate);
                        }
                    }
                    Verdict::BelowThreshold(near_miss) => {
                        report.stats.rejected_by_threshold += 1;
                        report.near_misses.extend(near_miss);
                    }
                    Verdict::BelowConfidence(near_miss) => {
                        report.stats.rejected_by_confidence += 1;
                        report.near_misses.extend(near_miss);
                    }
                }
            }
        }

        let mut candidates: Vec<Candidate> = accepted.into_values().collect();
        candidates.sort_by(|a, b| a.identity_key().cmp(&b.identity_key()));
        report.stats.accepted = candidates.len();
        report.candidates = candidates;

        tracing::debug!(
            detector = "time_based",
            considered = report.stats.considered,
            accepted = report.stats.accepted,
            "Time-based detection finished"
        );

        Ok(report)
    }
}

fn evaluate(
    members: &[&StateEvent],
    window: AnalysisWindow,
    offset: FixedOffset,
    input: &DetectionInput,
) -> Verdict {
    let tunables = &input.tunables.time;
    let near = NearMissPolicy::from_tunables(&input.tunables);

    let Some(first) = members.first() else {
        return Verdict::BelowThreshold(None);
    };
    // Spread over every member, not one sample per day
    let minutes: Vec<f64> = members.iter().map(|e| e.minute_of_day(offset)).collect();
    let Some(stats) = circular_stats(&minutes) else {
        return Verdict::BelowThreshold(None);
    };
    if stats.resultant_length < tunables.min_resultant_length {
        tracing::trace!(
            entity_id = %first.entity_id,
            state = %first.new_state,
            resultant_length = stats.resultant_length,
            "Time cluster has no concentration"
        );
        return Verdict::BelowThreshold(None);
    }

    // Occurrence days; the day boundary sits opposite the mean
    let shift = Duration::seconds(((720.0 - stats.mean_minute) * 60.0).round() as i64);
    let mut per_day: BTreeMap<NaiveDate, &StateEvent> = BTreeMap::new();
    for event in members {
        let day = (event.local_time(offset) + shift).date_naive();
        per_day.entry(day).or_insert(event);
    }

    let days: Vec<NaiveDate> = per_day.keys().copied().collect();
    let samples: Vec<&StateEvent> = per_day.values().copied().collect();
    let sample_minutes: Vec<f64> = samples.iter().map(|e| e.minute_of_day(offset)).collect();

    let (day_filter, observed, expected) = best_day_filter(&days, window, tunables.min_occurrences);
    let fraction = if expected == 0 {
        0.0
    } else {
        (observed as f64 / expected as f64).min(1.0)
    };

    let cap = tunables.tolerance_cap_minutes.max(tunables.tolerance_floor_minutes);
    let tolerance = (tunables.tolerance_sigma * stats.std_minutes).clamp(tunables.tolerance_floor_minutes, cap);
    let tightness = if cap > 0.0 { 1.0 - tolerance / cap } else { 0.0 };

    let last_seen = members
        .iter()
        .map(|e| e.timestamp)
        .max()
        .unwrap_or(first.timestamp);
    let recency = recency_score(last_seen, input.now, input.tunables.general.lookback_days);

    let confidence = weighted_confidence(&[
        (fraction, tunables.weight_consistency),
        (tightness, tunables.weight_tightness),
        (recency, tunables.weight_recency),
    ]);

    let mean = stats.mean_minute.floor();
    let hour = (mean / 60.0) as u8 % 24;
    let minute = (mean % 60.0) as u8;

    let trigger = Endpoint::TimeOfDay {
        hour,
        days: day_filter,
    };
    let action = Endpoint::entity(&first.entity_id, &first.new_state);

    let near_miss = |reason: &str| NearMiss {
        detector: DetectorKind::TimeBased,
        trigger: trigger.key(),
        action: action.key(),
        reason: reason.to_string(),
        count: observed,
        required_count: tunables.min_occurrences,
        confidence,
        required_confidence: tunables.min_confidence,
        same_room: None,
    };

    if observed < tunables.min_occurrences {
        let nm = near
            .count_is_near(observed, tunables.min_occurrences)
            .then(|| near_miss("too few days"));
        return Verdict::BelowThreshold(nm);
    }

    if fraction < tunables.expected_days_fraction {
        let nm = near
            .value_is_near(fraction, tunables.expected_days_fraction)
            .then(|| near_miss("too few of the expected days"));
        return Verdict::BelowThreshold(nm);
    }

    if confidence < tunables.min_confidence {
        let nm = near
            .confidence_is_near(confidence, tunables.min_confidence)
            .then(|| near_miss("confidence below floor"));
        return Verdict::BelowConfidence(nm);
    }

    let sun_offset = if tunables.sun_domains.iter().any(|d| *d == first.domain) {
        sun_relative(&samples, &sample_minutes, stats.std_minutes, tunables)
    } else {
        None
    };

    Verdict::Accepted(Candidate {
        data: PatternData::TimeBased(TimeBasedData {
            entity_id: first.entity_id.clone(),
            state: first.new_state.clone(),
            hour,
            minute,
            mean_minute: stats.mean_minute,
            tolerance_minutes: tolerance,
            day_filter,
            occurrences: observed as u32,
            days_observed_fraction: fraction,
            sun_offset,
        }),
        trigger,
        action,
        confidence,
        room_id: members.last().and_then(|e| e.room_id.clone()),
        last_observed_at: last_seen,
        initial_status: PatternStatus::Observed,
    })
}

/// Choose the day grouping with the best observed/expected ratio
///
/// Only groupings meeting `min_occurrences` compete; ties keep the earlier
/// grouping (all days, then weekdays). With no qualifying grouping the
/// result is all days.
fn best_day_filter(
    days: &[NaiveDate],
    window: AnalysisWindow,
    min_occurrences: usize,
) -> (DayFilter, usize, usize) {
    let mut best: Option<(DayFilter, usize, usize, f64)> = None;

    for filter in DayFilter::ALL {
        let expected = window.count_days(filter);
        let observed = days.iter().filter(|d| filter.matches(**d)).count();
        if expected == 0 || observed < min_occurrences {
            continue;
        }
        let fraction = (observed as f64 / expected as f64).min(1.0);

        if best.map_or(true, |(_, _, _, best_fraction)| fraction > best_fraction) {
            best = Some((filter, observed, expected, fraction));
        }
    }

    best.map(|(filter, observed, expected, _)| (filter, observed, expected))
        .unwrap_or((DayFilter::All, days.len(), window.days()))
}

/// Sun-relative timing, if it is markedly tighter than clock timing
fn sun_relative(
    samples: &[&StateEvent],
    minutes: &[f64],
    clock_std: f64,
    tunables: &TimeTunables,
) -> Option<SunOffset> {
    let with_sun: Vec<(f64, u16, u16)> = samples
        .iter()
        .zip(minutes)
        .filter_map(|(e, m)| Some((*m, e.context.sunrise_minute?, e.context.sunset_minute?)))
        .collect();

    if with_sun.len() < tunables.min_occurrences {
        return None;
    }

    let spread = |anchor: SunAnchor| {
        let offsets: Vec<f64> = with_sun
            .iter()
            .map(|(m, rise, set)| {
                let reference = match anchor {
                    SunAnchor::Sunrise => *rise,
                    SunAnchor::Sunset => *set,
                };
                signed_offset(*m, reference as f64)
            })
            .collect();
        let (mean, std) = mean_std(&offsets);
        (anchor, mean, std)
    };

    let rise = spread(SunAnchor::Sunrise);
    let set = spread(SunAnchor::Sunset);
    let (anchor, offset_minutes, std_minutes) = if set.2 < rise.2 { set } else { rise };

    (std_minutes < tunables.sun_improvement_ratio * clock_std).then_some(SunOffset {
        anchor,
        offset_minutes,
        std_minutes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::circular::circular_distance;
    use crate::events::fixtures::{at, event, sorted};
    use crate::events::EventContext;
    use crate::filter::AutomationLinks;
    use crate::settings::{Exclusions, Tunables};
    use chrono::{Datelike, Utc, Weekday};

    fn input(events: Vec<StateEvent>) -> DetectionInput {
        DetectionInput::new(
            sorted(events),
            AutomationLinks::default(),
            Exclusions::default(),
            Tunables::default(),
            Utc::now(),
        )
    }

    fn time_data(c: &Candidate) -> &TimeBasedData {
        match &c.data {
            PatternData::TimeBased(d) => d,
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_daily_routine_detected() {
        let events: Vec<StateEvent> = (1..=14)
            .map(|d| event("light.kitchen", "on", Some("kitchen"), at(d, 7, (d % 3) as u32)))
            .collect();

        let report = TimeBasedDetector.detect(&input(events)).unwrap();
        assert_eq!(report.candidates.len(), 1);

        let candidate = &report.candidates[0];
        let data = time_data(candidate);
        assert_eq!(data.hour, 7);
        assert_eq!(data.day_filter, DayFilter::All);
        assert_eq!(data.occurrences, 14);
        assert_eq!(data.tolerance_minutes, 10.0);
        assert_eq!(candidate.room_id.as_deref(), Some("kitchen"));
        assert!(candidate.confidence >= 0.6);
        assert_eq!(
            candidate.identity_key(),
            "time_based|time:07@all|entity:light.kitchen=on"
        );
    }

    #[test]
    fn test_routine_across_midnight_is_one_per_night() {
        // Nights alternate between 23:50, 23:55, 00:05 and 00:10
        let mut events = Vec::new();
        for night in 1..=8i64 {
            let ts = match night % 4 {
                0 => at(night + 1, 23, 50),
                1 => at(night + 1, 23, 55),
                2 => at(night, 0, 5),
                _ => at(night, 0, 10),
            };
            events.push(event("light.bedroom", "off", Some("bedroom"), ts));
        }

        let report = TimeBasedDetector.detect(&input(events)).unwrap();
        assert_eq!(report.candidates.len(), 1);

        let data = time_data(&report.candidates[0]);
        assert!(circular_distance(data.mean_minute, 0.0) <= 5.0);
        assert_eq!(data.occurrences, 8);
        assert!(data.tolerance_minutes < 20.0);
    }

    #[test]
    fn test_two_routines_for_one_entity() {
        let mut events = Vec::new();
        for d in 1..=10 {
            events.push(event("cover.blinds", "open", None, at(d, 7, 30)));
            events.push(event("cover.blinds", "open", None, at(d, 20, 0)));
        }

        let report = TimeBasedDetector.detect(&input(events)).unwrap();
        let mut hours: Vec<u8> = report.candidates.iter().map(|c| time_data(c).hour).collect();
        hours.sort();
        assert_eq!(hours, vec![7, 20]);
        assert_eq!(report.stats.considered, 2);
    }

    #[test]
    fn test_weekday_routine_prefers_weekday_filter() {
        let events: Vec<StateEvent> = (1..=14)
            .filter(|d| !matches!(at(*d, 6, 45).weekday(), Weekday::Sat | Weekday::Sun))
            .map(|d| event("switch.coffee", "on", Some("kitchen"), at(d, 6, 45)))
            .collect();

        let report = TimeBasedDetector.detect(&input(events)).unwrap();
        assert_eq!(report.candidates.len(), 1);
        let data = time_data(&report.candidates[0]);
        assert_eq!(data.day_filter, DayFilter::Weekdays);
        assert_eq!(data.days_observed_fraction, 1.0);
    }

    #[test]
    fn test_too_few_days_is_near_miss() {
        let mut events: Vec<StateEvent> = (1..=3)
            .map(|d| event("light.porch", "on", None, at(d, 21, 0)))
            .collect();
        // Unrelated activity widens the analysed window
        events.push(event("light.other", "on", None, at(10, 12, 0)));

        let report = TimeBasedDetector.detect(&input(events)).unwrap();
        assert!(report.candidates.is_empty());
        assert_eq!(report.stats.rejected_by_threshold, 2);
        assert_eq!(report.near_misses.len(), 1);
        assert_eq!(report.near_misses[0].count, 3);
        assert_eq!(report.near_misses[0].required_count, 5);
    }

    #[test]
    fn test_sun_relative_offset() {
        // Sunset drifts three minutes a day; the light follows ten minutes later
        let events: Vec<StateEvent> = (1..=14)
            .map(|d| {
                let sunset = 17 * 60 + 30 + (14 - d) as u16 * 3;
                let minute_of_day = (sunset + 10) as u32;
                let ts = at(d, minute_of_day / 60, minute_of_day % 60);
                let context = EventContext::at(ts.fixed_offset()).sun_times(7 * 60, sunset);
                event("light.porch", "on", None, ts).context(context)
            })
            .collect();

        let report = TimeBasedDetector.detect(&input(events)).unwrap();
        assert_eq!(report.candidates.len(), 1);
        let sun = time_data(&report.candidates[0]).sun_offset.clone().unwrap();
        assert_eq!(sun.anchor, SunAnchor::Sunset);
        assert!((sun.offset_minutes - 10.0).abs() < 1e-9);
        assert!(sun.std_minutes < 1e-9);
    }

    #[test]
    fn test_hourly_entity_is_not_a_routine() {
        let events: Vec<StateEvent> = (1..=14)
            .flat_map(|d| (0..24).map(move |h| at(d, h, 0)))
            .map(|ts| event("binary_sensor.hall_motion", "on", Some("hall"), ts))
            .collect();

        let report = TimeBasedDetector.detect(&input(events)).unwrap();
        assert!(report.candidates.is_empty());
        assert_eq!(report.stats.considered, 1);
        assert_eq!(report.stats.rejected_by_threshold, 1);
        assert!(report.near_misses.is_empty());
    }

    #[test]
    fn test_daytime_activity_is_not_a_routine() {
        // Every hour from 08:00 to 20:00: one cluster, half the circle wide
        let events: Vec<StateEvent> = (1..=14)
            .flat_map(|d| (8..=20).map(move |h| at(d, h, 15)))
            .map(|ts| event("switch.fan", "on", None, ts))
            .collect();

        let report = TimeBasedDetector.detect(&input(events)).unwrap();
        assert!(report.candidates.is_empty());
    }

    #[test]
    fn test_tolerance_uses_every_event_of_the_day() {
        // The first event each day is 07:00 but the light is switched on
        // again up to 07:50, so the window cannot collapse to the floor
        let mut events = Vec::new();
        for d in 1..=10 {
            for minute in [0, 25, 50] {
                events.push(event("light.kitchen", "on", Some("kitchen"), at(d, 7, minute)));
            }
        }

        let report = TimeBasedDetector.detect(&input(events)).unwrap();
        assert_eq!(report.candidates.len(), 1);
        let data = time_data(&report.candidates[0]);
        assert_eq!(data.occurrences, 10);
        assert!(circular_distance(data.mean_minute, 7.0 * 60.0 + 25.0) < 1.0);
        assert!(data.tolerance_minutes > 25.0);
    }

    #[test]
    fn test_numeric_states_ignored() {
        let events: Vec<StateEvent> = (1..=14)
            .map(|d| event("sensor.temperature", "21.5", None, at(d, 7, 0)))
            .collect();

        let report = TimeBasedDetector.detect(&input(events)).unwrap();
        assert!(report.candidates.is_empty());
        assert_eq!(report.stats.considered, 0);
    }
}
