//! Analysis Settings
//!
//! Live configuration consumed by every analysis pass:
//!
//! - `Exclusions`: entities, entity patterns, rooms, privacy rooms and
//!   domain pairs that must never be learned from
//! - `DomainFlags`: domains switched off entirely
//! - `Tunables`: thresholds and weights for the detectors
//!
//! Settings are loaded through a `SettingsProvider` at the start of every
//! pass and never cached across passes.

pub mod error;
pub mod provider;
pub mod tunables;

pub use error::{SettingsError, SettingsResult};
pub use provider::{FileSettingsProvider, SettingsProvider, StaticSettings};
pub use tunables::{
    ChainTunables, CorrelationTunables, GeneralTunables, TimeTunables, Tunables, UpsertTunables,
};

use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;

/// Everything a pass needs to know about the user's preferences
#[derive(Debug, Clone, Default)]
pub struct AnalysisSettings {
    pub exclusions: Exclusions,
    pub domains: DomainFlags,
    pub tunables: Tunables,
}

impl AnalysisSettings {
    /// Parse a settings document
    pub fn from_toml_str(content: &str) -> SettingsResult<Self> {
        let file: SettingsFile = toml::from_str(content)?;

        Ok(Self {
            exclusions: Exclusions::from_raw(file.exclusions)?,
            domains: file.domains,
            tunables: Tunables::from_table(&file.tunables),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SettingsFile {
    exclusions: RawExclusions,
    domains: DomainFlags,
    tunables: toml::Table,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawExclusions {
    entities: Vec<String>,
    entity_patterns: Vec<String>,
    rooms: Vec<String>,
    privacy_rooms: Vec<String>,
    domain_pairs: Vec<(String, String)>,
}

/// Entities, rooms and domain pairs excluded from learning
#[derive(Debug, Clone, Default)]
pub struct Exclusions {
    entities: HashSet<String>,
    entity_patterns: Vec<Regex>,
    rooms: HashSet<String>,
    privacy_rooms: HashSet<String>,
    /// Unordered, stored with the smaller domain first
    domain_pairs: HashSet<(String, String)>,
}

impl Exclusions {
    pub fn new() -> Self {
        Self::default()
    }

    /// An invalid entity pattern fails the whole load
    fn from_raw(raw: RawExclusions) -> SettingsResult<Self> {
        let entity_patterns = raw
            .entity_patterns
            .into_iter()
            .map(|pattern| {
                Regex::new(&pattern).map_err(|e| SettingsError::InvalidPattern {
                    error: e.to_string(),
                    pattern,
                })
            })
            .collect::<SettingsResult<Vec<_>>>()?;

        let mut exclusions = Self {
            entities: raw.entities.into_iter().collect(),
            entity_patterns,
            rooms: raw.rooms.into_iter().collect(),
            privacy_rooms: raw.privacy_rooms.into_iter().collect(),
            ..Default::default()
        };

        for (a, b) in raw.domain_pairs {
            exclusions = exclusions.domain_pair(a, b);
        }

        Ok(exclusions)
    }

    /// Builder method: exclude an entity
    pub fn entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entities.insert(entity_id.into());
        self
    }

    /// Builder method: exclude a room
    pub fn room(mut self, room_id: impl Into<String>) -> Self {
        self.rooms.insert(room_id.into());
        self
    }

    /// Builder method: put a room in privacy mode
    pub fn privacy_room(mut self, room_id: impl Into<String>) -> Self {
        self.privacy_rooms.insert(room_id.into());
        self
    }

    /// Builder method: never pair these two domains
    pub fn domain_pair(mut self, a: impl Into<String>, b: impl Into<String>) -> Self {
        self.domain_pairs.insert(ordered(a.into(), b.into()));
        self
    }

    pub fn is_entity_excluded(&self, entity_id: &str) -> bool {
        self.entities.contains(entity_id)
            || self.entity_patterns.iter().any(|re| re.is_match(entity_id))
    }

    pub fn is_room_excluded(&self, room_id: Option<&str>) -> bool {
        room_id.is_some_and(|r| self.rooms.contains(r))
    }

    pub fn is_privacy_room(&self, room_id: Option<&str>) -> bool {
        room_id.is_some_and(|r| self.privacy_rooms.contains(r))
    }

    /// True if the two domains must not be related to each other
    pub fn is_domain_pair_excluded(&self, a: &str, b: &str) -> bool {
        if self.domain_pairs.is_empty() {
            return false;
        }
        self.domain_pairs
            .contains(&ordered(a.to_string(), b.to_string()))
    }
}

fn ordered(a: String, b: String) -> (String, String) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Domain enable flags
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DomainFlags {
    pub disabled: HashSet<String>,
}

impl DomainFlags {
    /// Builder method: switch a domain off
    pub fn disable(mut self, domain: impl Into<String>) -> Self {
        self.disabled.insert(domain.into());
        self
    }

    pub fn is_enabled(&self, domain: &str) -> bool {
        !self.disabled.contains(domain)
    }
}
