//! Learned pattern model
//!
//! - `LearnedPattern`: a persisted, confidence-scored regularity
//! - `Endpoint`: trigger / action descriptor
//! - `PatternData`: per-type payload, one variant per detector
//! - `PatternStatus`: lifecycle state

use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of regularity a pattern describes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    TimeBased,
    EventChain,
    Correlation,
}

impl PatternType {
    pub const ALL: [PatternType; 3] = [
        PatternType::TimeBased,
        PatternType::EventChain,
        PatternType::Correlation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::TimeBased => "time_based",
            PatternType::EventChain => "event_chain",
            PatternType::Correlation => "correlation",
        }
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatternType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "time_based" => Ok(PatternType::TimeBased),
            "event_chain" => Ok(PatternType::EventChain),
            "correlation" => Ok(PatternType::Correlation),
            other => Err(format!("Unknown pattern type: {}", other)),
        }
    }
}

/// Lifecycle status of a pattern
///
/// Only `Observed` records are ever removed automatically. `Rejected` and
/// `Disabled` are user decisions and are never changed by detection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PatternStatus {
    Observed,
    Suggested,
    Active,
    Disabled,
    Rejected,
    Insight,
}

impl PatternStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternStatus::Observed => "observed",
            PatternStatus::Suggested => "suggested",
            PatternStatus::Active => "active",
            PatternStatus::Disabled => "disabled",
            PatternStatus::Rejected => "rejected",
            PatternStatus::Insight => "insight",
        }
    }

    /// Terminal statuses are never touched by a detection
    pub fn is_terminal(&self) -> bool {
        matches!(self, PatternStatus::Rejected | PatternStatus::Disabled)
    }
}

impl fmt::Display for PatternStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatternStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "observed" => Ok(PatternStatus::Observed),
            "suggested" => Ok(PatternStatus::Suggested),
            "active" => Ok(PatternStatus::Active),
            "disabled" => Ok(PatternStatus::Disabled),
            "rejected" => Ok(PatternStatus::Rejected),
            "insight" => Ok(PatternStatus::Insight),
            other => Err(format!("Unknown pattern status: {}", other)),
        }
    }
}

/// Which days a time-based routine applies to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum DayFilter {
    #[default]
    All,
    Weekdays,
    Weekends,
}

impl DayFilter {
    /// Candidate groupings in tie-break order
    pub const ALL: [DayFilter; 3] = [DayFilter::All, DayFilter::Weekdays, DayFilter::Weekends];

    pub fn matches(&self, date: NaiveDate) -> bool {
        let weekend = matches!(date.weekday(), Weekday::Sat | Weekday::Sun);
        match self {
            DayFilter::All => true,
            DayFilter::Weekdays => !weekend,
            DayFilter::Weekends => weekend,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DayFilter::All => "all",
            DayFilter::Weekdays => "weekdays",
            DayFilter::Weekends => "weekends",
        }
    }
}

/// Trigger or action of a pattern
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Endpoint {
    /// An entity reaching a state
    Entity { entity_id: String, state: String },
    /// A time of day, keyed by hour
    TimeOfDay { hour: u8, days: DayFilter },
    /// A whole room (room-pair insights)
    Room { room_id: String },
}

impl Endpoint {
    pub fn entity(entity_id: impl Into<String>, state: impl Into<String>) -> Self {
        Endpoint::Entity {
            entity_id: entity_id.into(),
            state: state.into(),
        }
    }

    /// Stable key fragment used in identity keys
    pub fn key(&self) -> String {
        match self {
            Endpoint::Entity { entity_id, state } => format!("entity:{}={}", entity_id, state),
            Endpoint::TimeOfDay { hour, days } => format!("time:{:02}@{}", hour, days.as_str()),
            Endpoint::Room { room_id } => format!("room:{}", room_id),
        }
    }

    pub fn entity_id(&self) -> Option<&str> {
        match self {
            Endpoint::Entity { entity_id, .. } => Some(entity_id),
            _ => None,
        }
    }
}

/// Identity key: pattern type + trigger + action
pub fn identity_key(pattern_type: PatternType, trigger: &Endpoint, action: &Endpoint) -> String {
    format!("{}|{}|{}", pattern_type.as_str(), trigger.key(), action.key())
}

/// Anchor of a sun-relative routine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SunAnchor {
    Sunrise,
    Sunset,
}

/// Routine timing expressed relative to sunrise or sunset
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SunOffset {
    pub anchor: SunAnchor,
    /// Mean offset, negative before the anchor
    pub offset_minutes: f64,
    pub std_minutes: f64,
}

/// Payload of a time-based pattern
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeBasedData {
    pub entity_id: String,
    pub state: String,
    pub hour: u8,
    pub minute: u8,
    /// Circular mean, minutes since local midnight
    pub mean_minute: f64,
    /// Half-width of the acceptance window around the mean
    pub tolerance_minutes: f64,
    pub day_filter: DayFilter,
    /// Distinct days the routine was seen on
    pub occurrences: u32,
    /// Observed days / expected days for `day_filter`
    pub days_observed_fraction: f64,
    #[serde(default)]
    pub sun_offset: Option<SunOffset>,
}

/// Payload of an event-chain pattern
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventChainData {
    pub trigger_entity: String,
    pub trigger_state: String,
    pub action_entity: String,
    pub action_state: String,
    pub avg_delay_secs: f64,
    pub delay_stddev_secs: f64,
    /// Chains observed
    pub occurrences: u32,
    /// Chains / trigger occurrences
    pub follow_ratio: f64,
    pub same_room: bool,
}

/// What a correlation relates
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationScope {
    #[default]
    EntityPair,
    /// Aggregate of cross-room entity correlations between two rooms
    RoomPair,
}

/// Payload of a correlation pattern
///
/// `ratio` is co-occurrences divided by the occurrences of the target
/// entity/state, never by a dataset-wide total.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CorrelationData {
    #[serde(default)]
    pub scope: CorrelationScope,
    /// Entity (or room, for room pairs) holding a state when the target fires
    pub partner_entity: String,
    pub partner_state: String,
    pub ratio: f64,
    /// Co-occurrences observed
    pub occurrences: u32,
    /// Occurrences of the target entity/state
    pub target_occurrences: u32,
    pub same_room: bool,
    /// Entity correlations aggregated into a room pair
    #[serde(default)]
    pub linked_pairs: u32,
}

/// Type-specific payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PatternData {
    TimeBased(TimeBasedData),
    EventChain(EventChainData),
    Correlation(CorrelationData),
}

impl PatternData {
    pub fn pattern_type(&self) -> PatternType {
        match self {
            PatternData::TimeBased(_) => PatternType::TimeBased,
            PatternData::EventChain(_) => PatternType::EventChain,
            PatternData::Correlation(_) => PatternType::Correlation,
        }
    }
}

/// A persisted pattern record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LearnedPattern {
    pub id: String,
    pub identity_key: String,
    pub pattern_type: PatternType,
    pub trigger: Endpoint,
    pub action: Endpoint,
    pub data: PatternData,
    /// Always within [0, 1]
    pub confidence: f64,
    pub match_count: u32,
    pub status: PatternStatus,
    /// Room of the trigger, when known
    pub room_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Latest event supporting the pattern
    pub last_observed_at: DateTime<Utc>,
    pub last_confirmed_run_id: Option<String>,
    pub rejection_reason: Option<String>,
    pub test_mode: bool,
}

/// Filter for listing patterns; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternFilter {
    pub status: Option<PatternStatus>,
    pub pattern_type: Option<PatternType>,
    pub room_id: Option<String>,
}

impl PatternFilter {
    pub fn status(mut self, status: PatternStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn pattern_type(mut self, pattern_type: PatternType) -> Self {
        self.pattern_type = Some(pattern_type);
        self
    }

    pub fn room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }
}
