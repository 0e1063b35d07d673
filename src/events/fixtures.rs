//! Test event builders
//!
//! Timestamps are relative to the current day so generated history always
//! falls inside the analysis lookback.

use crate::events::types::{EventContext, StateEvent};
use chrono::{DateTime, Duration, Offset, Utc};

/// Midnight UTC, `days_ago` days before today
pub fn day_start(days_ago: i64) -> DateTime<Utc> {
    let today = Utc::now().date_naive();
    (today - Duration::days(days_ago)).and_hms_opt(0, 0, 0).unwrap().and_utc()
}

/// `hour:minute` UTC on the day `days_ago` days before today
pub fn at(days_ago: i64, hour: u32, minute: u32) -> DateTime<Utc> {
    day_start(days_ago) + Duration::minutes(hour as i64 * 60 + minute as i64)
}

/// A state change with clock context derived in UTC
pub fn event(entity_id: &str, state: &str, room: Option<&str>, ts: DateTime<Utc>) -> StateEvent {
    let mut event = StateEvent::new(entity_id, state, ts)
        .context(EventContext::at(ts.with_timezone(&Utc.fix())));
    event.room_id = room.map(str::to_string);
    event
}

/// One event per listed day at the same local time
pub fn daily(
    entity_id: &str,
    state: &str,
    room: Option<&str>,
    days_ago: impl IntoIterator<Item = i64>,
    hour: u32,
    minute: u32,
) -> Vec<StateEvent> {
    days_ago
        .into_iter()
        .map(|d| event(entity_id, state, room, at(d, hour, minute)))
        .collect()
}

/// Trigger followed by action after `delay_secs`, once per listed day
#[allow(clippy::too_many_arguments)]
pub fn chain(
    trigger: (&str, &str, Option<&str>),
    action: (&str, &str, Option<&str>),
    days_ago: impl IntoIterator<Item = i64>,
    hour: u32,
    minute: u32,
    delay_secs: i64,
) -> Vec<StateEvent> {
    let mut events = Vec::new();
    for d in days_ago {
        let ts = at(d, hour, minute);
        events.push(event(trigger.0, trigger.1, trigger.2, ts));
        events.push(event(action.0, action.1, action.2, ts + Duration::seconds(delay_secs)));
    }
    events
}

/// Sort in place by timestamp and return
pub fn sorted(mut events: Vec<StateEvent>) -> Vec<StateEvent> {
    events.sort_by_key(|e| e.timestamp);
    events
}
