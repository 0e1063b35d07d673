//! Core event types consumed by the pattern engine
//!
//! - `StateEvent`: a single device/sensor state change
//! - `EventContext`: ambient context captured with the change
//! - `AutomationFiring`: a run of an existing platform automation
//! - `TimeSlot` and `WeekdayType`: context classification enums

use crate::events::error::ValidationError;
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// States that carry no information about behaviour
pub const NOISE_STATES: &[&str] = &["unknown", "unavailable"];

/// A single state change reported by the event store
///
/// Read-only from the engine's point of view. Events are expected in
/// timestamp order but the filter stage re-sorts defensively.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateEvent {
    /// Full entity id, e.g. `light.kitchen`
    pub entity_id: String,
    /// Previous state, if known
    #[serde(default)]
    pub old_state: Option<String>,
    /// Resulting state
    pub new_state: String,
    /// When the change happened
    pub timestamp: DateTime<Utc>,
    /// Room the entity is assigned to
    #[serde(default)]
    pub room_id: Option<String>,
    /// Entity domain (the prefix of `entity_id`)
    pub domain: String,
    /// Context captured at the time of the change
    #[serde(default)]
    pub context: EventContext,
}

impl StateEvent {
    /// Create an event, deriving the domain from the entity id
    pub fn new(
        entity_id: impl Into<String>,
        new_state: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let entity_id = entity_id.into();
        let domain = entity_id
            .split_once('.')
            .map(|(domain, _)| domain.to_string())
            .unwrap_or_default();

        Self {
            entity_id,
            old_state: None,
            new_state: new_state.into(),
            timestamp,
            room_id: None,
            domain,
            context: EventContext::default(),
        }
    }

    /// Builder method: set the previous state
    pub fn from_state(mut self, old_state: impl Into<String>) -> Self {
        self.old_state = Some(old_state.into());
        self
    }

    /// Builder method: assign a room
    pub fn room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    /// Builder method: attach context
    pub fn context(mut self, context: EventContext) -> Self {
        self.context = context;
        self
    }

    /// Check the fields the engine relies on
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.entity_id.trim().is_empty() {
            return Err(ValidationError::EmptyEntityId);
        }

        let prefix = match self.entity_id.split_once('.') {
            Some((prefix, object_id)) if !prefix.is_empty() && !object_id.is_empty() => prefix,
            _ => return Err(ValidationError::MissingDomain(self.entity_id.clone())),
        };

        if self.new_state.trim().is_empty() {
            return Err(ValidationError::EmptyState(self.entity_id.clone()));
        }

        if !self.domain.is_empty() && self.domain != prefix {
            return Err(ValidationError::DomainMismatch {
                entity_id: self.entity_id.clone(),
                domain: self.domain.clone(),
            });
        }

        Ok(())
    }

    /// True for `unknown`/`unavailable` transitions
    pub fn is_noise(&self) -> bool {
        NOISE_STATES.contains(&self.new_state.as_str())
    }

    /// True when the state did not actually change (attribute-only update)
    pub fn is_no_op(&self) -> bool {
        self.old_state.as_deref() == Some(self.new_state.as_str())
    }

    /// True when the resulting state is a number (temperature, power, ...)
    pub fn has_numeric_state(&self) -> bool {
        self.new_state.parse::<f64>().is_ok()
    }

    /// Timestamp in the configured local offset
    pub fn local_time(&self, offset: FixedOffset) -> DateTime<FixedOffset> {
        self.timestamp.with_timezone(&offset)
    }

    /// Local date of the event
    pub fn local_date(&self, offset: FixedOffset) -> NaiveDate {
        self.local_time(offset).date_naive()
    }

    /// Local time of day in fractional minutes since midnight
    pub fn minute_of_day(&self, offset: FixedOffset) -> f64 {
        let local = self.local_time(offset);
        local.hour() as f64 * 60.0 + local.minute() as f64 + local.second() as f64 / 60.0
    }
}

/// Coarse time-of-day bucket
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimeSlot {
    /// 22:00 - 05:59
    #[default]
    Night,
    /// 06:00 - 11:59
    Morning,
    /// 12:00 - 17:59
    Afternoon,
    /// 18:00 - 21:59
    Evening,
}

impl TimeSlot {
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            6..=11 => TimeSlot::Morning,
            12..=17 => TimeSlot::Afternoon,
            18..=21 => TimeSlot::Evening,
            _ => TimeSlot::Night,
        }
    }
}

/// Weekday or weekend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum WeekdayType {
    #[default]
    Weekday,
    Weekend,
}

impl WeekdayType {
    pub fn from_weekday(day: Weekday) -> Self {
        match day {
            Weekday::Sat | Weekday::Sun => WeekdayType::Weekend,
            _ => WeekdayType::Weekday,
        }
    }
}

/// Context captured by the event store alongside a state change
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EventContext {
    #[serde(default)]
    pub time_slot: TimeSlot,
    #[serde(default)]
    pub weekday_type: WeekdayType,
    /// Sun elevation in degrees, negative below the horizon
    #[serde(default)]
    pub sun_elevation: Option<f64>,
    /// People present at the time of the change
    #[serde(default)]
    pub presence: BTreeSet<String>,
    /// Local sunrise on the event's day, minutes since midnight
    #[serde(default)]
    pub sunrise_minute: Option<u16>,
    /// Local sunset on the event's day, minutes since midnight
    #[serde(default)]
    pub sunset_minute: Option<u16>,
}

impl EventContext {
    /// Derive the clock-based fields from a local timestamp
    pub fn at(local: DateTime<FixedOffset>) -> Self {
        Self {
            time_slot: TimeSlot::from_hour(local.hour()),
            weekday_type: WeekdayType::from_weekday(local.weekday()),
            ..Default::default()
        }
    }

    /// Builder method: set sunrise/sunset for the day
    pub fn sun_times(mut self, sunrise_minute: u16, sunset_minute: u16) -> Self {
        self.sunrise_minute = Some(sunrise_minute);
        self.sunset_minute = Some(sunset_minute);
        self
    }
}

/// A firing of an automation that already exists on the platform
///
/// State changes on `target_entities` shortly after `fired_at` are echoes of
/// the automation, not user behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutomationFiring {
    pub automation_id: String,
    /// Entity whose change triggered the automation, when known
    #[serde(default)]
    pub trigger_entity: Option<String>,
    pub target_entities: Vec<String>,
    pub fired_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, h, m, 0).unwrap()
    }

    #[test]
    fn test_domain_derived_from_entity_id() {
        let event = StateEvent::new("light.kitchen", "on", at(7, 0));
        assert_eq!(event.domain, "light");
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_validation_errors() {
        let event = StateEvent::new("", "on", at(7, 0));
        assert!(matches!(event.validate(), Err(ValidationError::EmptyEntityId)));

        let event = StateEvent::new("kitchen", "on", at(7, 0));
        assert!(matches!(event.validate(), Err(ValidationError::MissingDomain(_))));

        let event = StateEvent::new("light.kitchen", " ", at(7, 0));
        assert!(matches!(event.validate(), Err(ValidationError::EmptyState(_))));

        let mut event = StateEvent::new("light.kitchen", "on", at(7, 0));
        event.domain = "switch".to_string();
        assert!(matches!(
            event.validate(),
            Err(ValidationError::DomainMismatch { .. })
        ));
    }

    #[test]
    fn test_noise_and_no_op() {
        assert!(StateEvent::new("light.a", "unavailable", at(1, 0)).is_noise());
        assert!(!StateEvent::new("light.a", "on", at(1, 0)).is_noise());
        assert!(StateEvent::new("light.a", "on", at(1, 0)).from_state("on").is_no_op());
        assert!(!StateEvent::new("light.a", "on", at(1, 0)).from_state("off").is_no_op());
    }

    #[test]
    fn test_minute_of_day_uses_offset() {
        let event = StateEvent::new("light.a", "on", at(23, 30));
        assert_eq!(event.minute_of_day(FixedOffset::east_opt(0).unwrap()), 1410.0);

        // UTC+1 moves 23:30 past midnight
        let plus_one = FixedOffset::east_opt(3600).unwrap();
        assert_eq!(event.minute_of_day(plus_one), 30.0);
        assert_eq!(
            event.local_date(plus_one),
            NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()
        );
    }

    #[test]
    fn test_context_classification() {
        assert_eq!(TimeSlot::from_hour(7), TimeSlot::Morning);
        assert_eq!(TimeSlot::from_hour(23), TimeSlot::Night);
        assert_eq!(WeekdayType::from_weekday(Weekday::Sun), WeekdayType::Weekend);

        let local = at(19, 0).with_timezone(&FixedOffset::east_opt(0).unwrap());
        let ctx = EventContext::at(local);
        assert_eq!(ctx.time_slot, TimeSlot::Evening);
        assert_eq!(ctx.weekday_type, WeekdayType::Weekday);
    }
}
