//! Ingestion & Filter Stage
//!
//! Turns the raw event history into the set of events the detectors may
//! learn from. Dropped, in order of precedence:
//!
//! 1. malformed events (counted per validation reason)
//! 2. `unknown`/`unavailable` transitions and no-op updates
//! 3. events on disabled domains
//! 4. excluded entities and rooms
//! 5. events in privacy-mode rooms
//! 6. echoes of automation firings on the automation's targets
//!
//! The stage also derives `AutomationLinks`, the trigger/target pairs
//! already automated on the platform, so detectors never re-learn them.

use crate::events::{AutomationFiring, StateEvent};
use crate::settings::{AnalysisSettings, DomainFlags, Exclusions};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Trigger/target entity pairs handled by existing automations
#[derive(Debug, Clone, Default)]
pub struct AutomationLinks {
    pairs: HashSet<(String, String)>,
}

impl AutomationLinks {
    pub fn from_firings(firings: &[AutomationFiring]) -> Self {
        let pairs = firings
            .iter()
            .filter_map(|f| f.trigger_entity.as_ref().map(|t| (t, &f.target_entities)))
            .flat_map(|(trigger, targets)| {
                targets.iter().map(move |target| (trigger.clone(), target.clone()))
            })
            .collect();
        Self { pairs }
    }

    /// True if an automation already drives `target` from `trigger`
    pub fn links(&self, trigger: &str, target: &str) -> bool {
        self.pairs.contains(&(trigger.to_string(), target.to_string()))
    }

    /// True if either direction is automated
    pub fn links_either(&self, a: &str, b: &str) -> bool {
        self.links(a, b) || self.links(b, a)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Counts of what the filter stage kept and dropped
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilterStats {
    pub received: usize,
    pub kept: usize,
    /// Malformed events by validation reason
    pub invalid: BTreeMap<String, usize>,
    pub noise: usize,
    pub no_op: usize,
    pub disabled_domain: usize,
    pub excluded_entity: usize,
    pub excluded_room: usize,
    pub privacy_room: usize,
    pub automation_echo: usize,
}

impl FilterStats {
    pub fn invalid_total(&self) -> usize {
        self.invalid.values().sum()
    }
}

/// Output of the filter stage
#[derive(Debug, Clone, Default)]
pub struct FilteredEvents {
    /// Kept events in timestamp order
    pub events: Vec<StateEvent>,
    pub links: AutomationLinks,
    pub stats: FilterStats,
}

/// Applies the current exclusions to raw events
pub struct FilterStage<'a> {
    exclusions: &'a Exclusions,
    domains: &'a DomainFlags,
    echo_window: Duration,
}

impl<'a> FilterStage<'a> {
    pub fn new(settings: &'a AnalysisSettings) -> Self {
        let echo_secs = i64::try_from(settings.tunables.general.echo_window_secs).unwrap_or(i64::MAX);
        Self {
            exclusions: &settings.exclusions,
            domains: &settings.domains,
            echo_window: Duration::seconds(echo_secs),
        }
    }

    /// Filter `events`, using `firings` for echo suppression
    pub fn run(&self, mut events: Vec<StateEvent>, firings: &[AutomationFiring]) -> FilteredEvents {
        let mut stats = FilterStats {
            received: events.len(),
            ..Default::default()
        };

        events.sort_by_key(|e| e.timestamp);
        let echoes = EchoIndex::new(firings);

        events.retain(|event| {
            if let Err(e) = event.validate() {
                tracing::debug!(entity_id = %event.entity_id, error = %e, "Skipping malformed event");
                *stats.invalid.entry(e.reason().to_string()).or_default() += 1;
                return false;
            }

            let room = event.room_id.as_deref();
            let counter = if event.is_noise() {
                &mut stats.noise
            } else if event.is_no_op() {
                &mut stats.no_op
            } else if !self.domains.is_enabled(&event.domain) {
                &mut stats.disabled_domain
            } else if self.exclusions.is_entity_excluded(&event.entity_id) {
                &mut stats.excluded_entity
            } else if self.exclusions.is_room_excluded(room) {
                &mut stats.excluded_room
            } else if self.exclusions.is_privacy_room(room) {
                &mut stats.privacy_room
            } else if echoes.is_echo(&event.entity_id, event.timestamp, self.echo_window) {
                &mut stats.automation_echo
            } else {
                return true;
            };

            *counter += 1;
            false
        });

        stats.kept = events.len();

        tracing::debug!(
            received = stats.received,
            kept = stats.kept,
            invalid = stats.invalid_total(),
            echoes = stats.automation_echo,
            "Filtered event history"
        );

        FilteredEvents {
            events,
            links: AutomationLinks::from_firings(firings),
            stats,
        }
    }
}

/// Firing times per target entity, sorted
struct EchoIndex {
    by_target: HashMap<String, Vec<DateTime<Utc>>>,
}

impl EchoIndex {
    fn new(firings: &[AutomationFiring]) -> Self {
        let mut by_target: HashMap<String, Vec<DateTime<Utc>>> = HashMap::new();
        for firing in firings {
            for target in &firing.target_entities {
                by_target.entry(target.clone()).or_default().push(firing.fired_at);
            }
        }
        for times in by_target.values_mut() {
            times.sort();
        }
        Self { by_target }
    }

    /// True if `entity_id` changed within `window` after a firing targeting it
    fn is_echo(&self, entity_id: &str, ts: DateTime<Utc>, window: Duration) -> bool {
        let Some(times) = self.by_target.get(entity_id) else {
            return false;
        };

        let idx = times.partition_point(|fired| *fired <= ts);
        idx > 0 && ts - times[idx - 1] <= window
    }
}
