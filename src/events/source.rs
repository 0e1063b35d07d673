//! Event Source
//!
//! The event store is an external collaborator. The engine reads from it
//! through the `EventSource` trait; `MemoryEventSource` backs tests and
//! embedding callers that already hold their events in memory.

use crate::events::error::SourceResult;
use crate::events::types::{AutomationFiring, StateEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

/// Read-only access to historical state changes
#[async_trait]
pub trait EventSource: Send + Sync {
    /// State changes at or after `since`, oldest first
    async fn events_since(&self, since: DateTime<Utc>) -> SourceResult<Vec<StateEvent>>;

    /// Automation firings at or after `since`
    async fn automation_firings(&self, since: DateTime<Utc>) -> SourceResult<Vec<AutomationFiring>>;
}

/// In-memory event source
#[derive(Default)]
pub struct MemoryEventSource {
    events: RwLock<Vec<StateEvent>>,
    firings: RwLock<Vec<AutomationFiring>>,
}

impl MemoryEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a source pre-populated with events
    pub fn with_events(events: Vec<StateEvent>) -> Self {
        Self {
            events: RwLock::new(events),
            firings: RwLock::new(Vec::new()),
        }
    }

    /// Append events
    pub async fn extend(&self, events: impl IntoIterator<Item = StateEvent>) {
        self.events.write().await.extend(events);
    }

    /// Record an automation firing
    pub async fn add_firing(&self, firing: AutomationFiring) {
        self.firings.write().await.push(firing);
    }

    /// Number of stored events
    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

#[async_trait]
impl EventSource for MemoryEventSource {
    async fn events_since(&self, since: DateTime<Utc>) -> SourceResult<Vec<StateEvent>> {
        let mut events: Vec<StateEvent> = self
            .events
            .read()
            .await
            .iter()
            .filter(|e| e.timestamp >= since)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }

    async fn automation_firings(&self, since: DateTime<Utc>) -> SourceResult<Vec<AutomationFiring>> {
        Ok(self
            .firings
            .read()
            .await
            .iter()
            .filter(|f| f.fired_at >= since)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[tokio::test]
    async fn test_events_since_filters_and_orders() {
        let base = Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap();
        let source = MemoryEventSource::with_events(vec![
            StateEvent::new("light.b", "on", base + Duration::hours(2)),
            StateEvent::new("light.a", "on", base - Duration::hours(2)),
            StateEvent::new("light.c", "on", base + Duration::hours(1)),
        ]);

        let events = source.events_since(base).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].entity_id, "light.c");
        assert_eq!(events[1].entity_id, "light.b");
    }

    #[tokio::test]
    async fn test_firings_since() {
        let base = Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap();
        let source = MemoryEventSource::new();
        source
            .add_firing(AutomationFiring {
                automation_id: "automation.porch".to_string(),
                trigger_entity: None,
                target_entities: vec!["light.porch".to_string()],
                fired_at: base,
            })
            .await;

        assert_eq!(source.automation_firings(base).await.unwrap().len(), 1);
        assert!(source
            .automation_firings(base + Duration::seconds(1))
            .await
            .unwrap()
            .is_empty());
    }
}
