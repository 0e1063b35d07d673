//! CSV Event Source
//!
//! Reads a state-change export written by the event store. The file is read
//! again on every call so each analysis pass sees the current export.
//!
//! Events file columns (header row required, extra columns ignored):
//! `timestamp,entity_id,old_state,new_state,room_id,domain,sun_elevation,presence,sunrise,sunset`
//!
//! Automations file columns:
//! `fired_at,automation_id,trigger_entity,target_entities`
//!
//! `presence` and `target_entities` are `;`-separated lists, `sunrise` and
//! `sunset` are local `HH:MM` times.

use crate::events::error::{SourceError, SourceResult};
use crate::events::source::EventSource;
use crate::events::types::{AutomationFiring, EventContext, StateEvent};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime, NaiveTime, Offset, Timelike, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Event source backed by CSV exports
pub struct CsvEventSource {
    events_path: PathBuf,
    automations_path: Option<PathBuf>,
    /// Offset used to derive time slot / weekday context
    offset: FixedOffset,
}

#[derive(Debug, Deserialize)]
struct EventRow {
    timestamp: String,
    entity_id: String,
    #[serde(default)]
    old_state: Option<String>,
    new_state: String,
    #[serde(default)]
    room_id: Option<String>,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    sun_elevation: Option<f64>,
    #[serde(default)]
    presence: Option<String>,
    #[serde(default)]
    sunrise: Option<String>,
    #[serde(default)]
    sunset: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FiringRow {
    fired_at: String,
    automation_id: String,
    #[serde(default)]
    trigger_entity: Option<String>,
    target_entities: String,
}

impl CsvEventSource {
    pub fn new(events_path: impl Into<PathBuf>) -> Self {
        Self {
            events_path: events_path.into(),
            automations_path: None,
            offset: Utc.fix(),
        }
    }

    /// Builder method: also read automation firings from a file
    pub fn with_automations(mut self, path: impl Into<PathBuf>) -> Self {
        self.automations_path = Some(path.into());
        self
    }

    /// Builder method: local offset for derived context fields
    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    fn read_events(
        path: &Path,
        offset: FixedOffset,
        since: DateTime<Utc>,
    ) -> SourceResult<Vec<StateEvent>> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)?;

        let mut events = Vec::new();
        let mut rows_failed = 0usize;

        for (line_num, result) in reader.deserialize::<EventRow>().enumerate() {
            let row = match result {
                Ok(row) => row,
                Err(e) => {
                    tracing::warn!(line = line_num + 2, error = %e, "Skipping unreadable event row");
                    rows_failed += 1;
                    continue;
                }
            };

            let timestamp = match parse_timestamp(&row.timestamp) {
                Ok(ts) => ts,
                Err(e) => {
                    tracing::warn!(line = line_num + 2, error = %e, "Skipping event row");
                    rows_failed += 1;
                    continue;
                }
            };

            if timestamp < since {
                continue;
            }

            events.push(row_to_event(row, timestamp, offset));
        }

        if rows_failed > 0 {
            tracing::warn!(path = ?path, rows_failed, "Event export contained unreadable rows");
        }

        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }

    fn read_firings(path: &Path, since: DateTime<Utc>) -> SourceResult<Vec<AutomationFiring>> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)?;

        let mut firings = Vec::new();
        let mut rows_failed = 0usize;

        for (line_num, result) in reader.deserialize::<FiringRow>().enumerate() {
            let row = match result {
                Ok(row) => row,
                Err(e) => {
                    tracing::warn!(line = line_num + 2, error = %e, "Skipping unreadable firing row");
                    rows_failed += 1;
                    continue;
                }
            };

            let fired_at = match parse_timestamp(&row.fired_at) {
                Ok(ts) => ts,
                Err(e) => {
                    tracing::warn!(line = line_num + 2, error = %e, "Skipping firing row");
                    rows_failed += 1;
                    continue;
                }
            };

            if fired_at < since {
                continue;
            }

            firings.push(AutomationFiring {
                automation_id: row.automation_id,
                trigger_entity: non_empty(row.trigger_entity),
                target_entities: split_list(&row.target_entities),
                fired_at,
            });
        }

        if rows_failed > 0 {
            tracing::warn!(path = ?path, rows_failed, "Automation export contained unreadable rows");
        }

        Ok(firings)
    }
}

#[async_trait]
impl EventSource for CsvEventSource {
    async fn events_since(&self, since: DateTime<Utc>) -> SourceResult<Vec<StateEvent>> {
        let path = self.events_path.clone();
        let offset = self.offset;
        tokio::task::spawn_blocking(move || Self::read_events(&path, offset, since))
            .await
            .map_err(|e| SourceError::Unavailable(format!("event reader task failed: {}", e)))?
    }

    async fn automation_firings(&self, since: DateTime<Utc>) -> SourceResult<Vec<AutomationFiring>> {
        let Some(path) = self.automations_path.clone() else {
            return Ok(Vec::new());
        };

        tokio::task::spawn_blocking(move || Self::read_firings(&path, since))
            .await
            .map_err(|e| SourceError::Unavailable(format!("automation reader task failed: {}", e)))?
    }
}

fn row_to_event(row: EventRow, timestamp: DateTime<Utc>, offset: FixedOffset) -> StateEvent {
    let mut event = StateEvent::new(row.entity_id, row.new_state, timestamp);
    event.old_state = non_empty(row.old_state);
    event.room_id = non_empty(row.room_id);
    if let Some(domain) = non_empty(row.domain) {
        event.domain = domain;
    }

    let mut context = EventContext::at(timestamp.with_timezone(&offset));
    context.sun_elevation = row.sun_elevation;
    context.presence = row
        .presence
        .as_deref()
        .map(split_list)
        .unwrap_or_default()
        .into_iter()
        .collect();
    context.sunrise_minute = row.sunrise.as_deref().and_then(parse_minute_of_day);
    context.sunset_minute = row.sunset.as_deref().and_then(parse_minute_of_day);

    event.context(context)
}

/// Parse a timestamp in one of the formats the recorder exports
fn parse_timestamp(ts_str: &str) -> SourceResult<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(ts_str) {
        return Ok(dt.with_timezone(&Utc));
    }

    let formats = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];
    for fmt in formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(ts_str, fmt) {
            return Ok(dt.and_utc());
        }
    }

    if let Ok(secs) = ts_str.parse::<i64>() {
        if let Some(dt) = DateTime::from_timestamp(secs, 0) {
            return Ok(dt);
        }
    }

    Err(SourceError::Parse(format!("Could not parse timestamp: {}", ts_str)))
}

fn parse_minute_of_day(s: &str) -> Option<u16> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .ok()
        .map(|t| (t.hour() * 60 + t.minute()) as u16)
}

fn split_list(s: &str) -> Vec<String> {
    s.split(';')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
