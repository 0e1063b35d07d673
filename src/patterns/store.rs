//! Pattern Store - SQLite-backed persistence for learned patterns
//!
//! One row per identity key. Conditional updates keep user decisions
//! sticky: a detection can never overwrite a row that was rejected or
//! disabled in the meantime, even without a run-level lock.

use crate::patterns::error::{StoreError, StoreResult};
use crate::patterns::types::{
    Endpoint, LearnedPattern, PatternData, PatternFilter, PatternStatus, PatternType,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, ToSql};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// A re-detection of an existing pattern
#[derive(Debug, Clone)]
pub struct Observation<'a> {
    /// Blended confidence
    pub confidence: f64,
    pub data: &'a PatternData,
    pub last_observed_at: DateTime<Utc>,
    pub run_id: &'a str,
    /// Move `observed` to `suggested`
    pub promote: bool,
    pub now: DateTime<Utc>,
}

/// Persistence boundary for learned patterns
pub trait PatternStore: Send + Sync {
    /// Cheap reachability check
    fn ping(&self) -> StoreResult<()>;

    fn list(&self, filter: &PatternFilter) -> StoreResult<Vec<LearnedPattern>>;

    fn get(&self, id: &str) -> StoreResult<LearnedPattern>;

    fn find_by_key(&self, identity_key: &str) -> StoreResult<Option<LearnedPattern>>;

    /// Insert a new pattern; false if the identity key already exists
    fn insert(&self, pattern: &LearnedPattern) -> StoreResult<bool>;

    /// Apply a re-detection; false if the row is missing or terminal
    fn record_observation(&self, identity_key: &str, obs: &Observation<'_>) -> StoreResult<bool>;

    /// Mark a non-terminal row as confirmed by `run_id` without changing it
    fn confirm_run(&self, identity_key: &str, run_id: &str) -> StoreResult<bool>;

    /// Set the status if the current status is in `allowed_from`
    fn update_status(
        &self,
        id: &str,
        to: PatternStatus,
        rejection_reason: Option<&str>,
        allowed_from: &[PatternStatus],
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    fn set_test_mode(&self, id: &str, enabled: bool, now: DateTime<Utc>) -> StoreResult<bool>;

    fn delete(&self, id: &str) -> StoreResult<bool>;

    /// Delete `observed` rows of the given types not confirmed by `run_id`
    fn delete_unconfirmed(&self, run_id: &str, types: &[PatternType]) -> StoreResult<usize>;
}

const COLUMNS: &str = "id, identity_key, pattern_type, trigger_json, action_json, data_json,
     confidence, match_count, status, room_id, created_at, updated_at, last_observed_at,
     last_confirmed_run_id, rejection_reason, test_mode";

/// SQLite implementation of `PatternStore`
pub struct SqlitePatternStore {
    conn: Mutex<Connection>,
}

impl SqlitePatternStore {
    /// Create or open a store at `path`
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;

        Self::init(conn)
    }

    /// Create a throwaway in-memory store
    pub fn in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS learned_patterns (
                id TEXT PRIMARY KEY,
                identity_key TEXT NOT NULL UNIQUE,
                pattern_type TEXT NOT NULL,
                trigger_json TEXT NOT NULL,
                action_json TEXT NOT NULL,
                data_json TEXT NOT NULL,
                confidence REAL NOT NULL,
                match_count INTEGER NOT NULL,
                status TEXT NOT NULL,
                room_id TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                last_observed_at INTEGER NOT NULL,
                last_confirmed_run_id TEXT,
                rejection_reason TEXT,
                test_mode INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_patterns_status ON learned_patterns(status);
            CREATE INDEX IF NOT EXISTS idx_patterns_type ON learned_patterns(pattern_type);
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| StoreError::Lock(e.to_string()))
    }
}

impl PatternStore for SqlitePatternStore {
    fn ping(&self) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    fn list(&self, filter: &PatternFilter) -> StoreResult<Vec<LearnedPattern>> {
        let mut clauses = Vec::new();
        let mut values: Vec<String> = Vec::new();

        if let Some(status) = filter.status {
            values.push(status.as_str().to_string());
            clauses.push(format!("status = ?{}", values.len()));
        }
        if let Some(pattern_type) = filter.pattern_type {
            values.push(pattern_type.as_str().to_string());
            clauses.push(format!("pattern_type = ?{}", values.len()));
        }
        if let Some(room) = &filter.room_id {
            values.push(room.clone());
            clauses.push(format!("room_id = ?{}", values.len()));
        }

        let mut sql = format!("SELECT {} FROM learned_patterns", COLUMNS);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY confidence DESC, identity_key");

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), PatternRow::read)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(PatternRow::into_pattern).collect()
    }

    fn get(&self, id: &str) -> StoreResult<LearnedPattern> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM learned_patterns WHERE id = ?1", COLUMNS),
                params![id],
                PatternRow::read,
            )
            .optional()?;

        row.ok_or_else(|| StoreError::NotFound(id.to_string()))?
            .into_pattern()
    }

    fn find_by_key(&self, identity_key: &str) -> StoreResult<Option<LearnedPattern>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM learned_patterns WHERE identity_key = ?1", COLUMNS),
                params![identity_key],
                PatternRow::read,
            )
            .optional()?;

        row.map(PatternRow::into_pattern).transpose()
    }

    fn insert(&self, pattern: &LearnedPattern) -> StoreResult<bool> {
        let trigger_json = serde_json::to_string(&pattern.trigger)?;
        let action_json = serde_json::to_string(&pattern.action)?;
        let data_json = serde_json::to_string(&pattern.data)?;

        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO learned_patterns (id, identity_key, pattern_type, trigger_json,
                action_json, data_json, confidence, match_count, status, room_id, created_at,
                updated_at, last_observed_at, last_confirmed_run_id, rejection_reason, test_mode)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT(identity_key) DO NOTHING",
            params![
                pattern.id,
                pattern.identity_key,
                pattern.pattern_type.as_str(),
                trigger_json,
                action_json,
                data_json,
                pattern.confidence.clamp(0.0, 1.0),
                pattern.match_count,
                pattern.status.as_str(),
                pattern.room_id,
                pattern.created_at.timestamp_millis(),
                pattern.updated_at.timestamp_millis(),
                pattern.last_observed_at.timestamp_millis(),
                pattern.last_confirmed_run_id,
                pattern.rejection_reason,
                pattern.test_mode,
            ],
        )?;

        Ok(inserted == 1)
    }

    fn record_observation(&self, identity_key: &str, obs: &Observation<'_>) -> StoreResult<bool> {
        let data_json = serde_json::to_string(obs.data)?;

        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE learned_patterns
             SET confidence = ?2,
                 match_count = match_count + 1,
                 data_json = ?3,
                 last_observed_at = ?4,
                 last_confirmed_run_id = ?5,
                 updated_at = ?6,
                 status = CASE WHEN ?7 AND status = 'observed' THEN 'suggested' ELSE status END
             WHERE identity_key = ?1 AND status NOT IN ('rejected', 'disabled')",
            params![
                identity_key,
                obs.confidence.clamp(0.0, 1.0),
                data_json,
                obs.last_observed_at.timestamp_millis(),
                obs.run_id,
                obs.now.timestamp_millis(),
                obs.promote,
            ],
        )?;

        Ok(updated == 1)
    }

    fn confirm_run(&self, identity_key: &str, run_id: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE learned_patterns SET last_confirmed_run_id = ?2
             WHERE identity_key = ?1 AND status NOT IN ('rejected', 'disabled')",
            params![identity_key, run_id],
        )?;
        Ok(updated == 1)
    }

    fn update_status(
        &self,
        id: &str,
        to: PatternStatus,
        rejection_reason: Option<&str>,
        allowed_from: &[PatternStatus],
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        if allowed_from.is_empty() {
            return Ok(false);
        }

        let placeholders: Vec<String> = (0..allowed_from.len())
            .map(|i| format!("?{}", i + 5))
            .collect();
        let sql = format!(
            "UPDATE learned_patterns SET status = ?2, rejection_reason = ?3, updated_at = ?4
             WHERE id = ?1 AND status IN ({})",
            placeholders.join(", ")
        );

        let to_str = to.as_str();
        let now_ms = now.timestamp_millis();
        let allowed: Vec<&str> = allowed_from.iter().map(|s| s.as_str()).collect();

        let mut values: Vec<&dyn ToSql> = vec![&id, &to_str, &rejection_reason, &now_ms];
        for status in &allowed {
            values.push(status);
        }

        let conn = self.conn()?;
        let updated = conn.execute(&sql, values.as_slice())?;
        Ok(updated == 1)
    }

    fn set_test_mode(&self, id: &str, enabled: bool, now: DateTime<Utc>) -> StoreResult<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE learned_patterns SET test_mode = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, enabled, now.timestamp_millis()],
        )?;
        Ok(updated == 1)
    }

    fn delete(&self, id: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM learned_patterns WHERE id = ?1", params![id])?;
        Ok(deleted == 1)
    }

    fn delete_unconfirmed(&self, run_id: &str, types: &[PatternType]) -> StoreResult<usize> {
        if types.is_empty() {
            return Ok(0);
        }

        let placeholders: Vec<String> = (0..types.len()).map(|i| format!("?{}", i + 2)).collect();
        let sql = format!(
            "DELETE FROM learned_patterns
             WHERE status = 'observed'
               AND (last_confirmed_run_id IS NULL OR last_confirmed_run_id != ?1)
               AND pattern_type IN ({})",
            placeholders.join(", ")
        );

        let mut values = vec![run_id.to_string()];
        values.extend(types.iter().map(|t| t.as_str().to_string()));

        let conn = self.conn()?;
        let deleted = conn.execute(&sql, params_from_iter(values.iter()))?;
        Ok(deleted)
    }
}

/// Raw column values of one row
struct PatternRow {
    id: String,
    identity_key: String,
    pattern_type: String,
    trigger_json: String,
    action_json: String,
    data_json: String,
    confidence: f64,
    match_count: u32,
    status: String,
    room_id: Option<String>,
    created_at: i64,
    updated_at: i64,
    last_observed_at: i64,
    last_confirmed_run_id: Option<String>,
    rejection_reason: Option<String>,
    test_mode: bool,
}

impl PatternRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            identity_key: row.get(1)?,
            pattern_type: row.get(2)?,
            trigger_json: row.get(3)?,
            action_json: row.get(4)?,
            data_json: row.get(5)?,
            confidence: row.get(6)?,
            match_count: row.get(7)?,
            status: row.get(8)?,
            room_id: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
            last_observed_at: row.get(12)?,
            last_confirmed_run_id: row.get(13)?,
            rejection_reason: row.get(14)?,
            test_mode: row.get(15)?,
        })
    }

    fn into_pattern(self) -> StoreResult<LearnedPattern> {
        let trigger: Endpoint = serde_json::from_str(&self.trigger_json)?;
        let action: Endpoint = serde_json::from_str(&self.action_json)?;
        let data: PatternData = serde_json::from_str(&self.data_json)?;

        Ok(LearnedPattern {
            pattern_type: self.pattern_type.parse().map_err(StoreError::Serialization)?,
            status: self.status.parse().map_err(StoreError::Serialization)?,
            id: self.id,
            identity_key: self.identity_key,
            trigger,
            action,
            data,
            confidence: self.confidence,
            match_count: self.match_count,
            room_id: self.room_id,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
            last_observed_at: from_millis(self.last_observed_at)?,
            last_confirmed_run_id: self.last_confirmed_run_id,
            rejection_reason: self.rejection_reason,
            test_mode: self.test_mode,
        })
    }
}

fn from_millis(ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Serialization(format!("Invalid timestamp: {}", ms)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::patterns::types::{identity_key, EventChainData};
    use tempfile::tempdir;

    pub(crate) fn chain_pattern(trigger: &str, action: &str, status: PatternStatus) -> LearnedPattern {
        let now = Utc::now();
        let trigger_ep = Endpoint::entity(trigger, "on");
        let action_ep = Endpoint::entity(action, "on");
        LearnedPattern {
            id: uuid::Uuid::new_v4().to_string(),
            identity_key: identity_key(PatternType::EventChain, &trigger_ep, &action_ep),
            pattern_type: PatternType::EventChain,
            trigger: trigger_ep,
            action: action_ep,
            data: PatternData::EventChain(EventChainData {
                trigger_entity: trigger.to_string(),
                trigger_state: "on".to_string(),
                action_entity: action.to_string(),
                action_state: "on".to_string(),
                avg_delay_secs: 3.0,
                delay_stddev_secs: 0.5,
                occurrences: 6,
                follow_ratio: 0.9,
                same_room: true,
            }),
            confidence: 0.7,
            match_count: 1,
            status,
            room_id: Some("hall".to_string()),
            created_at: now,
            updated_at: now,
            last_observed_at: now,
            last_confirmed_run_id: Some("run-0".to_string()),
            rejection_reason: None,
            test_mode: false,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let store = SqlitePatternStore::in_memory().unwrap();
        let pattern = chain_pattern("binary_sensor.door", "light.hall", PatternStatus::Observed);

        assert!(store.insert(&pattern).unwrap());
        assert!(!store.insert(&pattern).unwrap());

        let loaded = store.get(&pattern.id).unwrap();
        assert_eq!(loaded.identity_key, pattern.identity_key);
        assert_eq!(loaded.data, pattern.data);
        assert_eq!(loaded.status, PatternStatus::Observed);

        let by_key = store.find_by_key(&pattern.identity_key).unwrap().unwrap();
        assert_eq!(by_key.id, pattern.id);

        assert!(matches!(store.get("missing"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_observation_skips_terminal_rows() {
        let store = SqlitePatternStore::in_memory().unwrap();
        let rejected = chain_pattern("switch.a", "light.a", PatternStatus::Rejected);
        store.insert(&rejected).unwrap();

        let obs = Observation {
            confidence: 0.95,
            data: &rejected.data,
            last_observed_at: Utc::now(),
            run_id: "run-1",
            promote: true,
            now: Utc::now(),
        };
        assert!(!store.record_observation(&rejected.identity_key, &obs).unwrap());
        assert!(!store.confirm_run(&rejected.identity_key, "run-1").unwrap());

        let loaded = store.get(&rejected.id).unwrap();
        assert_eq!(loaded.status, PatternStatus::Rejected);
        assert_eq!(loaded.confidence, 0.7);
        assert_eq!(loaded.match_count, 1);
    }

    #[test]
    fn test_observation_promotes_observed_only() {
        let store = SqlitePatternStore::in_memory().unwrap();
        let observed = chain_pattern("switch.a", "light.a", PatternStatus::Observed);
        let active = chain_pattern("switch.b", "light.b", PatternStatus::Active);
        store.insert(&observed).unwrap();
        store.insert(&active).unwrap();

        for pattern in [&observed, &active] {
            let obs = Observation {
                confidence: 0.9,
                data: &pattern.data,
                last_observed_at: Utc::now(),
                run_id: "run-1",
                promote: true,
                now: Utc::now(),
            };
            assert!(store.record_observation(&pattern.identity_key, &obs).unwrap());
        }

        let observed = store.get(&observed.id).unwrap();
        assert_eq!(observed.status, PatternStatus::Suggested);
        assert_eq!(observed.match_count, 2);
        assert_eq!(observed.last_confirmed_run_id.as_deref(), Some("run-1"));
        assert_eq!(store.get(&active.id).unwrap().status, PatternStatus::Active);
    }

    #[test]
    fn test_update_status_respects_allowed_from() {
        let store = SqlitePatternStore::in_memory().unwrap();
        let pattern = chain_pattern("switch.a", "light.a", PatternStatus::Rejected);
        store.insert(&pattern).unwrap();

        let enabled = store
            .update_status(
                &pattern.id,
                PatternStatus::Active,
                None,
                &[PatternStatus::Observed, PatternStatus::Suggested],
                Utc::now(),
            )
            .unwrap();
        assert!(!enabled);

        let reactivated = store
            .update_status(
                &pattern.id,
                PatternStatus::Suggested,
                None,
                &[PatternStatus::Rejected, PatternStatus::Disabled],
                Utc::now(),
            )
            .unwrap();
        assert!(reactivated);
        assert_eq!(store.get(&pattern.id).unwrap().status, PatternStatus::Suggested);
    }

    #[test]
    fn test_list_filters() {
        let store = SqlitePatternStore::in_memory().unwrap();
        store
            .insert(&chain_pattern("switch.a", "light.a", PatternStatus::Observed))
            .unwrap();
        let mut other = chain_pattern("switch.b", "light.b", PatternStatus::Active);
        other.room_id = Some("kitchen".to_string());
        store.insert(&other).unwrap();

        assert_eq!(store.list(&PatternFilter::default()).unwrap().len(), 2);
        assert_eq!(
            store
                .list(&PatternFilter::default().status(PatternStatus::Active))
                .unwrap()
                .len(),
            1
        );
        let kitchen = store.list(&PatternFilter::default().room("kitchen")).unwrap();
        assert_eq!(kitchen.len(), 1);
        assert_eq!(kitchen[0].id, other.id);
        assert!(store
            .list(&PatternFilter::default().pattern_type(PatternType::TimeBased))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_delete_unconfirmed_only_observed() {
        let store = SqlitePatternStore::in_memory().unwrap();
        let stale = chain_pattern("switch.a", "light.a", PatternStatus::Observed);
        let active = chain_pattern("switch.b", "light.b", PatternStatus::Active);
        let mut fresh = chain_pattern("switch.c", "light.c", PatternStatus::Observed);
        fresh.last_confirmed_run_id = Some("run-1".to_string());
        for p in [&stale, &active, &fresh] {
            store.insert(p).unwrap();
        }

        assert_eq!(store.delete_unconfirmed("run-1", &[]).unwrap(), 0);
        assert_eq!(
            store
                .delete_unconfirmed("run-1", &[PatternType::EventChain])
                .unwrap(),
            1
        );
        assert!(store.find_by_key(&stale.identity_key).unwrap().is_none());
        assert!(store.find_by_key(&active.identity_key).unwrap().is_some());
        assert!(store.find_by_key(&fresh.identity_key).unwrap().is_some());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("patterns.db");
        let pattern = chain_pattern("switch.a", "light.a", PatternStatus::Observed);

        {
            let store = SqlitePatternStore::open(&path).unwrap();
            store.insert(&pattern).unwrap();
            assert!(store.set_test_mode(&pattern.id, true, Utc::now()).unwrap());
        }

        let store = SqlitePatternStore::open(&path).unwrap();
        let loaded = store.get(&pattern.id).unwrap();
        assert!(loaded.test_mode);
        assert!(store.delete(&pattern.id).unwrap());
        assert!(!store.delete(&pattern.id).unwrap());
    }
}
