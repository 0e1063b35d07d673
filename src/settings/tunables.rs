//! Detection Tunables
//!
//! Thresholds, windows and score weights used by the detectors and the
//! upsert manager. Read from the `[tunables]` table of the settings file:
//!
//! ```toml
//! [tunables.general]
//! lookback_days = 14
//!
//! [tunables.chain]
//! cross_room_min_count = 20
//! ```
//!
//! Every key is optional. A key whose value cannot be parsed, or falls
//! outside its valid range, keeps its default and logs a warning.

use chrono::{FixedOffset, Offset, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// All tunables, grouped by consumer
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Tunables {
    pub general: GeneralTunables,
    pub time: TimeTunables,
    pub chain: ChainTunables,
    pub correlation: CorrelationTunables,
    pub upsert: UpsertTunables,
}

/// Settings shared by every stage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneralTunables {
    /// How far back each pass reads events
    pub lookback_days: u32,
    /// Local offset used for time-of-day and calendar days
    pub utc_offset_minutes: i32,
    /// Changes on an automation target this soon after a firing are echoes
    pub echo_window_secs: u64,
    /// A rejected candidate with at least this fraction of the required
    /// count is reported as a near-miss
    pub near_miss_fraction: f64,
    /// A candidate this close below a confidence floor is a near-miss
    pub near_miss_confidence_margin: f64,
}

impl Default for GeneralTunables {
    fn default() -> Self {
        Self {
            lookback_days: 14,
            utc_offset_minutes: 0,
            echo_window_secs: 10,
            near_miss_fraction: 0.5,
            near_miss_confidence_margin: 0.15,
        }
    }
}

impl GeneralTunables {
    /// Configured local offset
    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }
}

/// Time-based detector
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeTunables {
    /// Minimum distinct days the routine must be seen on
    pub min_occurrences: usize,
    /// Minimum fraction of expected days actually observed
    pub expected_days_fraction: f64,
    pub min_confidence: f64,
    /// Time clusters are split at gaps wider than this
    pub cluster_gap_minutes: f64,
    /// Clusters whose mean resultant length is below this are spread over
    /// the day and never form a routine
    pub min_resultant_length: f64,
    pub tolerance_sigma: f64,
    pub tolerance_floor_minutes: f64,
    pub tolerance_cap_minutes: f64,
    pub weight_consistency: f64,
    pub weight_tightness: f64,
    pub weight_recency: f64,
    /// Domains checked for sun-relative timing
    pub sun_domains: Vec<String>,
    /// Sun-relative offset wins when its spread is below this share of the
    /// clock spread
    pub sun_improvement_ratio: f64,
}

impl Default for TimeTunables {
    fn default() -> Self {
        Self {
            min_occurrences: 5,
            expected_days_fraction: 0.5,
            min_confidence: 0.6,
            cluster_gap_minutes: 90.0,
            min_resultant_length: 0.75,
            tolerance_sigma: 1.5,
            tolerance_floor_minutes: 10.0,
            tolerance_cap_minutes: 180.0,
            weight_consistency: 0.5,
            weight_tightness: 0.3,
            weight_recency: 0.2,
            sun_domains: vec!["light".to_string(), "cover".to_string()],
            sun_improvement_ratio: 0.6,
        }
    }
}

/// Event-chain detector
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainTunables {
    pub window_secs: u64,
    pub same_room_min_count: usize,
    pub same_room_min_confidence: f64,
    pub cross_room_min_count: usize,
    pub cross_room_min_confidence: f64,
    /// Cross-room chains must have delays at least this consistent
    pub max_delay_stddev_secs: f64,
    /// Delays shorter than this are treated as this long when scoring timing
    pub min_delay_tolerance_secs: f64,
    pub weight_follow: f64,
    pub weight_timing: f64,
    pub weight_recency: f64,
}

impl Default for ChainTunables {
    fn default() -> Self {
        Self {
            window_secs: 120,
            same_room_min_count: 5,
            same_room_min_confidence: 0.5,
            cross_room_min_count: 20,
            cross_room_min_confidence: 0.75,
            max_delay_stddev_secs: 15.0,
            min_delay_tolerance_secs: 5.0,
            weight_follow: 0.6,
            weight_timing: 0.25,
            weight_recency: 0.15,
        }
    }
}

/// Correlation detector
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrelationTunables {
    /// A partner counts as co-occurring when it changed this recently
    pub recency_window_minutes: u64,
    pub same_room_min_ratio: f64,
    pub same_room_min_count: usize,
    pub same_room_min_confidence: f64,
    pub cross_room_min_ratio: f64,
    pub cross_room_min_count: usize,
    pub cross_room_min_confidence: f64,
    /// Partners holding one state in at least this share of samples carry
    /// no signal
    pub triviality_threshold: f64,
    /// Correlations kept per trigger entity
    pub top_k: usize,
    /// Cross-room links needed before a room pair is reported
    pub room_pair_min_links: usize,
    pub sensor_domains: Vec<String>,
    pub weight_ratio: f64,
    pub weight_support: f64,
}

impl Default for CorrelationTunables {
    fn default() -> Self {
        Self {
            recency_window_minutes: 360,
            same_room_min_ratio: 0.6,
            same_room_min_count: 5,
            same_room_min_confidence: 0.5,
            cross_room_min_ratio: 0.8,
            cross_room_min_count: 10,
            cross_room_min_confidence: 0.7,
            triviality_threshold: 0.9,
            top_k: 5,
            room_pair_min_links: 3,
            sensor_domains: vec!["sensor".to_string(), "binary_sensor".to_string()],
            weight_ratio: 0.7,
            weight_support: 0.3,
        }
    }
}

/// Confidence & upsert policy
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpsertTunables {
    /// Weight of the new observation in the confidence blend
    pub new_observation_weight: f64,
    /// Observed patterns at or above this confidence become suggestions
    pub suggest_confidence: f64,
    pub suggest_min_matches: u32,
}

impl Default for UpsertTunables {
    fn default() -> Self {
        Self {
            new_observation_weight: 0.7,
            suggest_confidence: 0.8,
            suggest_min_matches: 3,
        }
    }
}

impl Tunables {
    /// Build tunables from a `[tunables]` table, falling back per key
    pub fn from_table(table: &toml::Table) -> Self {
        let general = Section::new(table, "general");
        let time = Section::new(table, "time");
        let chain = Section::new(table, "chain");
        let correlation = Section::new(table, "correlation");
        let upsert = Section::new(table, "upsert");

        let g = GeneralTunables::default();
        let t = TimeTunables::default();
        let c = ChainTunables::default();
        let r = CorrelationTunables::default();
        let u = UpsertTunables::default();

        Self {
            general: GeneralTunables {
                lookback_days: general.read("lookback_days", g.lookback_days, |v| *v > 0),
                utc_offset_minutes: general.read("utc_offset_minutes", g.utc_offset_minutes, |v| {
                    (-1439..=1439).contains(v)
                }),
                echo_window_secs: general.read("echo_window_secs", g.echo_window_secs, |_| true),
                near_miss_fraction: general.read("near_miss_fraction", g.near_miss_fraction, unit),
                near_miss_confidence_margin: general.read(
                    "near_miss_confidence_margin",
                    g.near_miss_confidence_margin,
                    unit,
                ),
            },
            time: TimeTunables {
                min_occurrences: time.read("min_occurrences", t.min_occurrences, |v| *v > 0),
                expected_days_fraction: time.read(
                    "expected_days_fraction",
                    t.expected_days_fraction,
                    unit,
                ),
                min_confidence: time.read("min_confidence", t.min_confidence, unit),
                cluster_gap_minutes: time.read("cluster_gap_minutes", t.cluster_gap_minutes, |v| {
                    *v > 0.0 && *v < 720.0
                }),
                min_resultant_length: time.read("min_resultant_length", t.min_resultant_length, unit),
                tolerance_sigma: time.read("tolerance_sigma", t.tolerance_sigma, positive),
                tolerance_floor_minutes: time.read(
                    "tolerance_floor_minutes",
                    t.tolerance_floor_minutes,
                    non_negative,
                ),
                tolerance_cap_minutes: time.read(
                    "tolerance_cap_minutes",
                    t.tolerance_cap_minutes,
                    positive,
                ),
                weight_consistency: time.read("weight_consistency", t.weight_consistency, non_negative),
                weight_tightness: time.read("weight_tightness", t.weight_tightness, non_negative),
                weight_recency: time.read("weight_recency", t.weight_recency, non_negative),
                sun_domains: time.read("sun_domains", t.sun_domains, |_| true),
                sun_improvement_ratio: time.read(
                    "sun_improvement_ratio",
                    t.sun_improvement_ratio,
                    positive,
                ),
            },
            chain: ChainTunables {
                window_secs: chain.read("window_secs", c.window_secs, |v| *v > 0),
                same_room_min_count: chain.read("same_room_min_count", c.same_room_min_count, |v| {
                    *v > 0
                }),
                same_room_min_confidence: chain.read(
                    "same_room_min_confidence",
                    c.same_room_min_confidence,
                    unit,
                ),
                cross_room_min_count: chain.read(
                    "cross_room_min_count",
                    c.cross_room_min_count,
                    |v| *v > 0,
                ),
                cross_room_min_confidence: chain.read(
                    "cross_room_min_confidence",
                    c.cross_room_min_confidence,
                    unit,
                ),
                max_delay_stddev_secs: chain.read(
                    "max_delay_stddev_secs",
                    c.max_delay_stddev_secs,
                    non_negative,
                ),
                min_delay_tolerance_secs: chain.read(
                    "min_delay_tolerance_secs",
                    c.min_delay_tolerance_secs,
                    positive,
                ),
                weight_follow: chain.read("weight_follow", c.weight_follow, non_negative),
                weight_timing: chain.read("weight_timing", c.weight_timing, non_negative),
                weight_recency: chain.read("weight_recency", c.weight_recency, non_negative),
            },
            correlation: CorrelationTunables {
                recency_window_minutes: correlation.read(
                    "recency_window_minutes",
                    r.recency_window_minutes,
                    |v| *v > 0,
                ),
                same_room_min_ratio: correlation.read(
                    "same_room_min_ratio",
                    r.same_room_min_ratio,
                    unit,
                ),
                same_room_min_count: correlation.read(
                    "same_room_min_count",
                    r.same_room_min_count,
                    |v| *v > 0,
                ),
                same_room_min_confidence: correlation.read(
                    "same_room_min_confidence",
                    r.same_room_min_confidence,
                    unit,
                ),
                cross_room_min_ratio: correlation.read(
                    "cross_room_min_ratio",
                    r.cross_room_min_ratio,
                    unit,
                ),
                cross_room_min_count: correlation.read(
                    "cross_room_min_count",
                    r.cross_room_min_count,
                    |v| *v > 0,
                ),
                cross_room_min_confidence: correlation.read(
                    "cross_room_min_confidence",
                    r.cross_room_min_confidence,
                    unit,
                ),
                triviality_threshold: correlation.read(
                    "triviality_threshold",
                    r.triviality_threshold,
                    |v| *v > 0.0 && *v <= 1.0,
                ),
                top_k: correlation.read("top_k", r.top_k, |v| *v > 0),
                room_pair_min_links: correlation.read(
                    "room_pair_min_links",
                    r.room_pair_min_links,
                    |v| *v > 0,
                ),
                sensor_domains: correlation.read("sensor_domains", r.sensor_domains, |_| true),
                weight_ratio: correlation.read("weight_ratio", r.weight_ratio, non_negative),
                weight_support: correlation.read("weight_support", r.weight_support, non_negative),
            },
            upsert: UpsertTunables {
                new_observation_weight: upsert.read(
                    "new_observation_weight",
                    u.new_observation_weight,
                    unit,
                ),
                suggest_confidence: upsert.read("suggest_confidence", u.suggest_confidence, unit),
                suggest_min_matches: upsert.read(
                    "suggest_min_matches",
                    u.suggest_min_matches,
                    |v| *v > 0,
                ),
            },
        }
    }
}

fn unit(v: &f64) -> bool {
    (0.0..=1.0).contains(v)
}

fn positive(v: &f64) -> bool {
    v.is_finite() && *v > 0.0
}

fn non_negative(v: &f64) -> bool {
    v.is_finite() && *v >= 0.0
}

/// One `[tunables.<name>]` sub-table
struct Section<'a> {
    name: &'static str,
    table: Option<&'a toml::Table>,
}

impl<'a> Section<'a> {
    fn new(root: &'a toml::Table, name: &'static str) -> Self {
        let table = match root.get(name) {
            Some(toml::Value::Table(t)) => Some(t),
            Some(_) => {
                tracing::warn!(section = name, "Tunables section is not a table, using defaults");
                None
            }
            None => None,
        };
        Self { name, table }
    }

    fn read<T>(&self, key: &str, default: T, valid: impl Fn(&T) -> bool) -> T
    where
        T: DeserializeOwned + std::fmt::Debug,
    {
        let Some(value) = self.table.and_then(|t| t.get(key)) else {
            return default;
        };

        match value.clone().try_into::<T>() {
            Ok(parsed) if valid(&parsed) => parsed,
            Ok(parsed) => {
                tracing::warn!(
                    section = self.name,
                    key,
                    value = ?parsed,
                    default = ?default,
                    "Tunable out of range, using default"
                );
                default
            }
            Err(e) => {
                tracing::warn!(
                    section = self.name,
                    key,
                    error = %e,
                    default = ?default,
                    "Unparseable tunable, using default"
                );
                default
            }
        }
    }
}
