//! Analysis Engine
//!
//! Runs one pass at a time: settings → store prefetch → events → filter →
//! detectors → upsert → janitor. The run lock is only ever tried, never
//! waited on, so a start request during a pass returns `AlreadyRunning`.
//!
//! Only an unreachable store, an unreadable event or automation history, or
//! settings that have never loaded abort a pass. Settings that fail to load
//! after an earlier success are replaced by the last loaded copy, never by
//! defaults, so exclusions cannot lapse. A failing detector contributes
//! zero candidates. A failing upsert keeps its pattern type out of the
//! janitor sweep.

use crate::analysis::context::RunContext;
use crate::analysis::diagnostics::{AnalysisStatus, DetectorDiagnostics, RunDiagnostics};
use crate::analysis::error::{AnalysisError, AnalysisResult};
use crate::detect::{
    Candidate, CorrelationDetector, DetectionInput, Detector, DetectorKind, DetectorReport,
    SequenceDetector, TimeBasedDetector,
};
use crate::events::EventSource;
use crate::filter::FilterStage;
use crate::patterns::{
    PatternManager, PatternStore, PatternType, RunCache, StalePatternJanitor, StoreError,
    StoreResult, UpsertStats,
};
use crate::settings::{AnalysisSettings, SettingsProvider, UpsertTunables};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};

/// Result of `run_now`
#[derive(Debug)]
pub enum RunOutcome {
    Finished(Box<RunDiagnostics>),
    AlreadyRunning,
}

impl RunOutcome {
    pub fn diagnostics(&self) -> Option<&RunDiagnostics> {
        match self {
            RunOutcome::Finished(diag) => Some(diag),
            RunOutcome::AlreadyRunning => None,
        }
    }
}

/// Result of `start`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

/// The built-in detectors
pub fn default_detectors() -> Vec<Arc<dyn Detector>> {
    vec![
        Arc::new(TimeBasedDetector::new()),
        Arc::new(SequenceDetector::new()),
        Arc::new(CorrelationDetector::new()),
    ]
}

/// Coordinates analysis passes
#[derive(Clone)]
pub struct AnalysisEngine {
    source: Arc<dyn EventSource>,
    settings: Arc<dyn SettingsProvider>,
    store: Arc<dyn PatternStore>,
    manager: PatternManager,
    detectors: Arc<Vec<Arc<dyn Detector>>>,
    run_lock: Arc<Mutex<()>>,
    running: Arc<AtomicBool>,
    last_run: Arc<RwLock<Option<RunDiagnostics>>>,
    last_settings: Arc<RwLock<Option<AnalysisSettings>>>,
}

/// Lowers the running flag when the pass ends, however it ends
struct RunningFlag(Arc<AtomicBool>);

impl RunningFlag {
    fn raise(flag: &Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(Arc::clone(flag))
    }
}

impl Drop for RunningFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// What the blocking persist step reports back
struct PersistOutcome {
    upserts: Vec<(UpsertStats, Option<StoreError>)>,
    swept: Vec<PatternType>,
    janitor: StoreResult<usize>,
}

impl AnalysisEngine {
    pub fn new(
        source: Arc<dyn EventSource>,
        settings: Arc<dyn SettingsProvider>,
        store: Arc<dyn PatternStore>,
    ) -> Self {
        Self {
            source,
            settings,
            manager: PatternManager::new(Arc::clone(&store)),
            store,
            detectors: Arc::new(default_detectors()),
            run_lock: Arc::new(Mutex::new(())),
            running: Arc::new(AtomicBool::new(false)),
            last_run: Arc::new(RwLock::new(None)),
            last_settings: Arc::new(RwLock::new(None)),
        }
    }

    /// Replace the detector set
    pub fn with_detectors(mut self, detectors: Vec<Arc<dyn Detector>>) -> Self {
        self.detectors = Arc::new(detectors);
        self
    }

    /// Manager for single-row status operations
    pub fn manager(&self) -> &PatternManager {
        &self.manager
    }

    pub fn store(&self) -> &Arc<dyn PatternStore> {
        &self.store
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> AnalysisStatus {
        AnalysisStatus {
            running: self.is_running(),
            last_run: self.last_run.read().await.clone(),
        }
    }

    /// Run a pass and wait for it
    pub async fn run_now(&self) -> RunOutcome {
        let Ok(_guard) = Arc::clone(&self.run_lock).try_lock_owned() else {
            tracing::info!("Analysis already running, not starting another pass");
            return RunOutcome::AlreadyRunning;
        };
        let _flag = RunningFlag::raise(&self.running);

        RunOutcome::Finished(Box::new(self.run_locked().await))
    }

    /// Start a pass in the background
    pub fn start(&self) -> StartOutcome {
        let Ok(guard) = Arc::clone(&self.run_lock).try_lock_owned() else {
            tracing::info!("Analysis already running, not starting another pass");
            return StartOutcome::AlreadyRunning;
        };
        let flag = RunningFlag::raise(&self.running);

        let engine = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let _flag = flag;
            engine.run_locked().await;
        });

        StartOutcome::Started
    }

    async fn run_locked(&self) -> RunDiagnostics {
        let diagnostics = self.pass().await;
        *self.last_run.write().await = Some(diagnostics.clone());
        diagnostics
    }

    async fn pass(&self) -> RunDiagnostics {
        let started_at = Utc::now();
        let run_id = RunContext::new_run_id();
        let mut diag = RunDiagnostics::new(run_id.clone(), started_at);

        tracing::info!(run_id = %run_id, "Analysis pass started");

        let settings = match self.load_settings().await {
            Ok((settings, stale)) => {
                diag.settings_stale = stale;
                settings
            }
            Err(e) => return diag.abort(e.to_string()),
        };

        let cache = match self.prefetch().await {
            Ok(cache) => cache,
            Err(e) => return diag.abort(e.to_string()),
        };
        tracing::debug!(run_id = %run_id, cached = cache.len(), "Prefetched pattern keys");

        let ctx = RunContext::new(run_id, started_at, settings, cache);
        let since = ctx.lookback_start();

        let events = match self.source.events_since(since).await {
            Ok(events) => events,
            Err(e) => return diag.abort(AnalysisError::from(e).to_string()),
        };
        let firings = match self.source.automation_firings(since).await {
            Ok(firings) => firings,
            Err(e) => return diag.abort(AnalysisError::from(e).to_string()),
        };
        diag.events_read = events.len();
        diag.automation_firings = firings.len();

        let filtered = FilterStage::new(&ctx.settings).run(events, &firings);
        diag.filter = filtered.stats.clone();

        let input = Arc::new(DetectionInput::new(
            filtered.events,
            filtered.links,
            ctx.settings.exclusions.clone(),
            ctx.settings.tunables.clone(),
            started_at,
        ));

        let mut batches = Vec::with_capacity(self.detectors.len());
        for (detector_diag, report) in self.detect_all(&input).await {
            diag.near_misses.extend(report.near_misses);
            batches.push((detector_diag.detector, report.candidates));
            diag.detectors.push(detector_diag);
        }

        if !diag.near_misses.is_empty() {
            tracing::warn!(
                run_id = %ctx.run_id,
                near_misses = diag.near_misses.len(),
                "Candidates rejected close to a threshold"
            );
        }

        let RunContext {
            run_id,
            settings,
            cache,
            ..
        } = ctx;

        let manager = self.manager.clone();
        let janitor = StalePatternJanitor::new(Arc::clone(&self.store));
        let tunables = settings.tunables.upsert.clone();
        let persist_run_id = run_id.clone();

        let persisted = tokio::task::spawn_blocking(move || {
            persist(&manager, &janitor, cache, &batches, &persist_run_id, &tunables)
        })
        .await;

        let outcome = match persisted {
            Ok(outcome) => outcome,
            Err(e) => return diag.abort(AnalysisError::from(e).to_string()),
        };

        for (detector_diag, (stats, error)) in diag.detectors.iter_mut().zip(outcome.upserts) {
            detector_diag.upsert = stats;
            if let Some(e) = error {
                tracing::warn!(
                    run_id = %run_id,
                    detector = %detector_diag.detector,
                    error = %e,
                    "Candidates detected but not persisted"
                );
                detector_diag.store_error = Some(e.to_string());
            }
        }

        match outcome.janitor {
            Ok(deleted) => diag.janitor_deleted = Some(deleted),
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "Janitor sweep failed");
                diag.janitor_error = Some(e.to_string());
            }
        }

        let diag = diag.complete();
        tracing::info!(
            run_id = %run_id,
            events = diag.filter.kept,
            accepted = diag.accepted(),
            persisted = diag.persisted(),
            swept_types = outcome.swept.len(),
            janitor_deleted = diag.janitor_deleted.unwrap_or(0),
            duration_ms = diag.duration_ms,
            "Analysis pass finished"
        );

        diag
    }

    /// Current settings, or the last loaded copy when the provider fails
    ///
    /// The flag is true when the copy was reused.
    async fn load_settings(&self) -> AnalysisResult<(AnalysisSettings, bool)> {
        match self.settings.load().await {
            Ok(settings) => {
                *self.last_settings.write().await = Some(settings.clone());
                Ok((settings, false))
            }
            Err(e) => {
                let previous = self.last_settings.read().await.clone();
                match previous {
                    Some(settings) => {
                        tracing::warn!(error = %e, "Settings unavailable, reusing the last loaded settings");
                        Ok((settings, true))
                    }
                    None => Err(AnalysisError::Settings(e)),
                }
            }
        }
    }

    /// Ping the store and load the run cache
    async fn prefetch(&self) -> AnalysisResult<RunCache> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || {
            store.ping()?;
            RunCache::prefetch(store.as_ref())
        })
        .await?
        .map_err(AnalysisError::StoreUnavailable)
    }

    /// Run every detector on the blocking pool, concurrently
    async fn detect_all(
        &self,
        input: &Arc<DetectionInput>,
    ) -> Vec<(DetectorDiagnostics, DetectorReport)> {
        let handles: Vec<_> = self
            .detectors
            .iter()
            .map(|detector| {
                let detector = Arc::clone(detector);
                let input = Arc::clone(input);
                let kind = detector.kind();
                let handle = tokio::task::spawn_blocking(move || {
                    let start = Instant::now();
                    let result = detector.detect(&input);
                    (result, start.elapsed())
                });
                (kind, handle)
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (kind, handle) in handles {
            let mut diag = DetectorDiagnostics::new(kind);

            let report = match handle.await {
                Ok((Ok(report), elapsed)) => {
                    diag.duration_ms = elapsed.as_millis() as u64;
                    report
                }
                Ok((Err(e), elapsed)) => {
                    tracing::warn!(detector = %kind, error = %e, "Detector failed, no candidates this run");
                    diag.duration_ms = elapsed.as_millis() as u64;
                    diag.failed = Some(e.to_string());
                    DetectorReport::default()
                }
                Err(e) => {
                    tracing::warn!(detector = %kind, error = %e, "Detector panicked, no candidates this run");
                    diag.failed = Some(format!("panicked: {}", e));
                    DetectorReport::default()
                }
            };

            diag.stats = report.stats.clone();
            diag.candidates = report.candidates.len();
            diag.near_misses = report.near_misses.len();

            tracing::debug!(
                detector = %kind,
                candidates = diag.candidates,
                considered = diag.stats.considered,
                rejected_by_threshold = diag.stats.rejected_by_threshold,
                rejected_by_confidence = diag.stats.rejected_by_confidence,
                "Detector finished"
            );

            results.push((diag, report));
        }

        results
    }
}

/// Upsert every batch, then sweep the types whose upsert succeeded
fn persist(
    manager: &PatternManager,
    janitor: &StalePatternJanitor,
    mut cache: RunCache,
    batches: &[(DetectorKind, Vec<Candidate>)],
    run_id: &str,
    tunables: &UpsertTunables,
) -> PersistOutcome {
    let mut upserts = Vec::with_capacity(batches.len());
    let mut swept = Vec::new();

    for (kind, candidates) in batches {
        let (stats, error) = manager.upsert_all(&mut cache, candidates, run_id, tunables);
        if error.is_none() {
            swept.push(kind.pattern_type());
        }
        upserts.push((stats, error));
    }

    let janitor = janitor.sweep(run_id, &swept);

    PersistOutcome {
        upserts,
        swept,
        janitor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::diagnostics::PassOutcome;
    use crate::detect::{DetectionInput, DetectorResult};
    use crate::events::fixtures::{chain, daily};
    use crate::events::{AutomationFiring, MemoryEventSource, SourceError, SourceResult, StateEvent};
    use crate::patterns::{
        LearnedPattern, Observation, PatternFilter, PatternStatus, SqlitePatternStore,
    };
    use crate::settings::{Exclusions, FileSettingsProvider, StaticSettings};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    const HALL_CHAIN: &str = "event_chain|entity:binary_sensor.hall_motion=on|entity:light.hall=on";

    fn hall_chain(days: impl IntoIterator<Item = i64>) -> Vec<StateEvent> {
        chain(
            ("binary_sensor.hall_motion", "on", Some("hall")),
            ("light.hall", "on", Some("hall")),
            days,
            18,
            30,
            4,
        )
    }

    fn engine_for(
        events: Vec<StateEvent>,
        store: Arc<dyn PatternStore>,
        settings: Arc<StaticSettings>,
    ) -> AnalysisEngine {
        AnalysisEngine::new(
            Arc::new(MemoryEventSource::with_events(events)),
            settings,
            store,
        )
    }

    fn memory_store() -> Arc<SqlitePatternStore> {
        Arc::new(SqlitePatternStore::in_memory().unwrap())
    }

    async fn run(engine: &AnalysisEngine) -> RunDiagnostics {
        match engine.run_now().await {
            RunOutcome::Finished(diag) => *diag,
            RunOutcome::AlreadyRunning => panic!("unexpected concurrent run"),
        }
    }

    /// Wraps the SQLite store with switchable failures
    struct FlakyStore {
        inner: SqlitePatternStore,
        down: AtomicBool,
        fail_inserts_of: StdMutex<Option<PatternType>>,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: SqlitePatternStore::in_memory().unwrap(),
                down: AtomicBool::new(false),
                fail_inserts_of: StdMutex::new(None),
            }
        }

        fn check(&self) -> StoreResult<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection refused".to_string()));
            }
            Ok(())
        }
    }

    impl PatternStore for FlakyStore {
        fn ping(&self) -> StoreResult<()> {
            self.check()?;
            self.inner.ping()
        }

        fn list(&self, filter: &PatternFilter) -> StoreResult<Vec<LearnedPattern>> {
            self.check()?;
            self.inner.list(filter)
        }

        fn get(&self, id: &str) -> StoreResult<LearnedPattern> {
            self.inner.get(id)
        }

        fn find_by_key(&self, identity_key: &str) -> StoreResult<Option<LearnedPattern>> {
            self.inner.find_by_key(identity_key)
        }

        fn insert(&self, pattern: &LearnedPattern) -> StoreResult<bool> {
            if *self.fail_inserts_of.lock().unwrap() == Some(pattern.pattern_type) {
                return Err(StoreError::Unavailable("disk full".to_string()));
            }
            self.inner.insert(pattern)
        }

        fn record_observation(&self, identity_key: &str, obs: &Observation<'_>) -> StoreResult<bool> {
            self.inner.record_observation(identity_key, obs)
        }

        fn confirm_run(&self, identity_key: &str, run_id: &str) -> StoreResult<bool> {
            self.inner.confirm_run(identity_key, run_id)
        }

        fn update_status(
            &self,
            id: &str,
            to: PatternStatus,
            rejection_reason: Option<&str>,
            allowed_from: &[PatternStatus],
            now: DateTime<Utc>,
        ) -> StoreResult<bool> {
            self.inner.update_status(id, to, rejection_reason, allowed_from, now)
        }

        fn set_test_mode(&self, id: &str, enabled: bool, now: DateTime<Utc>) -> StoreResult<bool> {
            self.inner.set_test_mode(id, enabled, now)
        }

        fn delete(&self, id: &str) -> StoreResult<bool> {
            self.inner.delete(id)
        }

        fn delete_unconfirmed(&self, run_id: &str, types: &[PatternType]) -> StoreResult<usize> {
            self.inner.delete_unconfirmed(run_id, types)
        }
    }

    /// Blocks `events_since` until released
    struct GatedSource {
        inner: MemoryEventSource,
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl EventSource for GatedSource {
        async fn events_since(&self, since: DateTime<Utc>) -> SourceResult<Vec<StateEvent>> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.events_since(since).await
        }

        async fn automation_firings(&self, since: DateTime<Utc>) -> SourceResult<Vec<AutomationFiring>> {
            self.inner.automation_firings(since).await
        }
    }

    /// Events are readable, the automation history is not
    struct NoFiringsSource(MemoryEventSource);

    #[async_trait]
    impl EventSource for NoFiringsSource {
        async fn events_since(&self, since: DateTime<Utc>) -> SourceResult<Vec<StateEvent>> {
            self.0.events_since(since).await
        }

        async fn automation_firings(&self, _since: DateTime<Utc>) -> SourceResult<Vec<AutomationFiring>> {
            Err(SourceError::Unavailable("automation log offline".to_string()))
        }
    }

    const PRIVATE_HALL: &str = "[exclusions]\nprivacy_rooms = [\"hall\"]\n";

    struct PanickingDetector;

    impl Detector for PanickingDetector {
        fn kind(&self) -> DetectorKind {
            DetectorKind::Correlation
        }

        fn detect(&self, _input: &DetectionInput) -> DetectorResult<DetectorReport> {
            panic!("detector bug")
        }
    }

    #[tokio::test]
    async fn test_same_room_chain_end_to_end() {
        let mut events = hall_chain(1..=8);
        events.extend(daily("binary_sensor.hall_motion", "on", Some("hall"), 9..=10, 18, 30));

        let store = memory_store();
        let engine = engine_for(events, store.clone(), Arc::new(StaticSettings::default()));
        let diag = run(&engine).await;

        assert!(diag.is_completed());
        let pattern = store.find_by_key(HALL_CHAIN).unwrap().unwrap();
        assert_eq!(pattern.status, PatternStatus::Observed);
        match &pattern.data {
            crate::patterns::PatternData::EventChain(data) => {
                assert!(data.same_room);
                assert_eq!(data.occurrences, 8);
            }
            other => panic!("unexpected payload {:?}", other),
        }

        let chain_diag = diag.detector(DetectorKind::EventChain).unwrap();
        assert!(chain_diag.stats.accepted >= 1);
        assert!(chain_diag.upsert.inserted >= 1);
    }

    #[tokio::test]
    async fn test_cross_room_chain_is_near_miss() {
        let events = chain(
            ("binary_sensor.hall_motion", "on", Some("hall")),
            ("light.living", "on", Some("living")),
            1..=12,
            18,
            30,
            4,
        );

        let store = memory_store();
        let engine = engine_for(events, store.clone(), Arc::new(StaticSettings::default()));
        let diag = run(&engine).await;

        let key = "event_chain|entity:binary_sensor.hall_motion=on|entity:light.living=on";
        assert!(store.find_by_key(key).unwrap().is_none());

        let miss = diag
            .near_misses
            .iter()
            .find(|m| m.detector == DetectorKind::EventChain)
            .unwrap();
        assert_eq!(miss.count, 12);
        assert_eq!(miss.required_count, 20);
        assert_eq!(miss.same_room, Some(false));
    }

    #[tokio::test]
    async fn test_unchanged_history_reconfirms_only() {
        let store = memory_store();
        let engine = engine_for(hall_chain(1..=8), store.clone(), Arc::new(StaticSettings::default()));

        run(&engine).await;
        let first = store.find_by_key(HALL_CHAIN).unwrap().unwrap();

        let diag = run(&engine).await;
        let second = store.find_by_key(HALL_CHAIN).unwrap().unwrap();

        assert_eq!(second.confidence, first.confidence);
        assert_eq!(second.match_count, first.match_count);
        assert_eq!(second.last_confirmed_run_id.as_deref(), Some(diag.run_id.as_str()));
        assert!(diag.detector(DetectorKind::EventChain).unwrap().upsert.reconfirmed >= 1);
    }

    #[tokio::test]
    async fn test_rejection_survives_later_runs() {
        let store = memory_store();
        let engine = engine_for(hall_chain(1..=8), store.clone(), Arc::new(StaticSettings::default()));

        run(&engine).await;
        let pattern = store.find_by_key(HALL_CHAIN).unwrap().unwrap();
        engine.manager().reject(&pattern.id, Some("not useful")).unwrap();

        run(&engine).await;
        let after = store.find_by_key(HALL_CHAIN).unwrap().unwrap();
        assert_eq!(after.status, PatternStatus::Rejected);
        assert_eq!(after.rejection_reason.as_deref(), Some("not useful"));
        assert_eq!(after.confidence, pattern.confidence);
        assert_eq!(after.match_count, pattern.match_count);
    }

    #[tokio::test]
    async fn test_janitor_after_exclusion() {
        let mut events = hall_chain(1..=8);
        events.extend(daily("light.stairs", "on", Some("hall"), 1..=8, 18, 30));
        // Stairs light follows the motion sensor 10s later
        let events: Vec<StateEvent> = events
            .into_iter()
            .map(|mut e| {
                if e.entity_id == "light.stairs" {
                    e.timestamp += chrono::Duration::seconds(10);
                }
                e
            })
            .collect();

        let store = memory_store();
        let settings = Arc::new(StaticSettings::default());
        let engine = engine_for(events, store.clone(), settings.clone());
        run(&engine).await;

        let stairs_key = "event_chain|entity:binary_sensor.hall_motion=on|entity:light.stairs=on";
        let stairs = store.find_by_key(stairs_key).unwrap().unwrap();
        engine.manager().enable(&stairs.id).unwrap();
        assert!(store.find_by_key(HALL_CHAIN).unwrap().is_some());

        let mut excluded = AnalysisSettings::default();
        excluded.exclusions = Exclusions::new().entity("binary_sensor.hall_motion");
        settings.update(excluded).await;

        let diag = run(&engine).await;
        assert!(diag.filter.excluded_entity > 0);
        assert!(store.find_by_key(HALL_CHAIN).unwrap().is_none());
        let stairs = store.find_by_key(stairs_key).unwrap().unwrap();
        assert_eq!(stairs.status, PatternStatus::Active);
    }

    #[tokio::test]
    async fn test_failed_upsert_keeps_type_out_of_sweep() {
        let store = Arc::new(FlakyStore::new());
        let engine = engine_for(hall_chain(1..=8), store.clone(), Arc::new(StaticSettings::default()))
            .with_detectors(vec![Arc::new(SequenceDetector::new()), Arc::new(TimeBasedDetector::new())]);
        run(&engine).await;

        let routines_before = store
            .list(&PatternFilter::default().pattern_type(PatternType::TimeBased))
            .unwrap();
        assert!(!routines_before.is_empty());

        let desk = chain(
            ("switch.desk", "on", Some("office")),
            ("light.desk", "on", Some("office")),
            1..=8,
            8,
            0,
            5,
        );
        *store.fail_inserts_of.lock().unwrap() = Some(PatternType::EventChain);
        let engine = engine_for(desk, store.clone(), Arc::new(StaticSettings::default()))
            .with_detectors(vec![Arc::new(SequenceDetector::new()), Arc::new(TimeBasedDetector::new())]);
        let diag = run(&engine).await;

        assert!(diag.is_completed());
        assert!(diag
            .detector(DetectorKind::EventChain)
            .unwrap()
            .detected_not_persisted());

        // Chain type skipped by the janitor, time-based swept as usual
        assert!(store.find_by_key(HALL_CHAIN).unwrap().is_some());
        for routine in routines_before {
            assert!(store.find_by_key(&routine.identity_key).unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_panicking_detector_is_isolated() {
        let store = memory_store();
        let engine = engine_for(hall_chain(1..=8), store.clone(), Arc::new(StaticSettings::default()))
            .with_detectors(vec![Arc::new(SequenceDetector::new()), Arc::new(PanickingDetector)]);

        let diag = run(&engine).await;
        assert!(diag.is_completed());
        assert!(diag.detector(DetectorKind::Correlation).unwrap().failed.is_some());
        assert!(diag.janitor_deleted.is_some());
        assert!(store.find_by_key(HALL_CHAIN).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unreachable_store_aborts_pass() {
        let store = Arc::new(FlakyStore::new());
        let engine = engine_for(hall_chain(1..=8), store.clone(), Arc::new(StaticSettings::default()));

        assert!(run(&engine).await.is_completed());

        store.down.store(true, Ordering::SeqCst);
        let diag = run(&engine).await;
        assert!(matches!(diag.outcome, PassOutcome::Aborted { .. }));
        assert!(diag.janitor_deleted.is_none());

        // Status reports the failed pass, not the earlier success
        let status = engine.status().await;
        assert!(!status.running);
        let last = status.last_run.unwrap();
        assert_eq!(last.run_id, diag.run_id);
        assert!(matches!(last.outcome, PassOutcome::Aborted { .. }));
    }

    #[tokio::test]
    async fn test_start_while_running_is_noop() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let source = GatedSource {
            inner: MemoryEventSource::with_events(hall_chain(1..=8)),
            entered: entered.clone(),
            release: release.clone(),
        };
        let engine = AnalysisEngine::new(
            Arc::new(source),
            Arc::new(StaticSettings::default()),
            memory_store(),
        );

        let background = engine.clone();
        let first = tokio::spawn(async move { background.run_now().await });
        entered.notified().await;

        assert!(engine.status().await.running);
        assert!(matches!(engine.run_now().await, RunOutcome::AlreadyRunning));
        assert_eq!(engine.start(), StartOutcome::AlreadyRunning);

        release.notify_one();
        let outcome = first.await.unwrap();
        let diag = outcome.diagnostics().unwrap();
        assert!(diag.is_completed());
        assert_eq!(diag.detector(DetectorKind::EventChain).unwrap().upsert.inserted, 1);

        let status = engine.status().await;
        assert!(!status.running);
        assert_eq!(status.last_run.unwrap().run_id, diag.run_id);
    }

    #[tokio::test]
    async fn test_start_runs_in_background() {
        let store = memory_store();
        let engine = engine_for(hall_chain(1..=8), store.clone(), Arc::new(StaticSettings::default()));

        assert_eq!(engine.start(), StartOutcome::Started);
        for _ in 0..200 {
            if !engine.is_running() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert!(!engine.is_running());
        assert!(engine.status().await.last_run.unwrap().is_completed());
        assert!(store.find_by_key(HALL_CHAIN).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unloadable_settings_abort_first_pass() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(
            &path,
            format!("{}\n[tunables.chain]\nwindow_secs = 120s\n", PRIVATE_HALL),
        )
        .unwrap();

        let store = memory_store();
        let engine = AnalysisEngine::new(
            Arc::new(MemoryEventSource::with_events(hall_chain(1..=8))),
            Arc::new(FileSettingsProvider::new(&path)),
            store.clone(),
        );

        let diag = run(&engine).await;
        assert!(matches!(diag.outcome, PassOutcome::Aborted { .. }));
        assert!(diag.janitor_deleted.is_none());
        assert!(store.list(&PatternFilter::default()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_exclusion_pattern_aborts_pass() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "[exclusions]\nentity_patterns = [\"^binary_sensor\\\\.(\"]\n").unwrap();

        let store = memory_store();
        let engine = AnalysisEngine::new(
            Arc::new(MemoryEventSource::with_events(hall_chain(1..=8))),
            Arc::new(FileSettingsProvider::new(&path)),
            store.clone(),
        );

        let diag = run(&engine).await;
        assert!(matches!(diag.outcome, PassOutcome::Aborted { .. }));
        assert!(store.find_by_key(HALL_CHAIN).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_settings_failure_keeps_last_exclusions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, PRIVATE_HALL).unwrap();

        let store = memory_store();
        let engine = AnalysisEngine::new(
            Arc::new(MemoryEventSource::with_events(hall_chain(1..=8))),
            Arc::new(FileSettingsProvider::new(&path)),
            store.clone(),
        );

        let diag = run(&engine).await;
        assert!(diag.is_completed());
        assert!(!diag.settings_stale);
        assert!(diag.filter.privacy_room > 0);
        assert_eq!(diag.filter.kept, 0);

        // A typo in the file must not lift the privacy room
        std::fs::write(&path, format!("{}window_secs = 120s\n", PRIVATE_HALL)).unwrap();
        let diag = run(&engine).await;
        assert!(diag.is_completed());
        assert!(diag.settings_stale);
        assert!(diag.filter.privacy_room > 0);
        assert_eq!(diag.filter.kept, 0);
        assert!(store.find_by_key(HALL_CHAIN).unwrap().is_none());
        assert!(store.list(&PatternFilter::default()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_automation_history_aborts_pass() {
        let store = memory_store();
        let engine = AnalysisEngine::new(
            Arc::new(NoFiringsSource(MemoryEventSource::with_events(hall_chain(1..=8)))),
            Arc::new(StaticSettings::default()),
            store.clone(),
        );

        let diag = run(&engine).await;
        match &diag.outcome {
            PassOutcome::Aborted { reason } => assert!(reason.contains("automation log offline")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(store.list(&PatternFilter::default()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_routine_stays_rejected_after_drift() {
        let store = memory_store();
        let routines = PatternFilter::default().pattern_type(PatternType::TimeBased);

        let engine = engine_for(
            daily("light.kitchen", "on", Some("kitchen"), 1..=10, 7, 2),
            store.clone(),
            Arc::new(StaticSettings::default()),
        );
        run(&engine).await;

        let stored = store.list(&routines).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].identity_key, "time_based|time:07@all|entity:light.kitchen=on");
        engine.manager().reject(&stored[0].id, Some("not a routine")).unwrap();

        // Same routine, now a few minutes before the hour
        let engine = engine_for(
            daily("light.kitchen", "on", Some("kitchen"), 1..=10, 6, 57),
            store.clone(),
            Arc::new(StaticSettings::default()),
        );
        let diag = run(&engine).await;
        assert_eq!(diag.detector(DetectorKind::TimeBased).unwrap().upsert.skipped_terminal, 1);

        let after = store.list(&routines).unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, stored[0].id);
        assert_eq!(after[0].status, PatternStatus::Rejected);
        assert_eq!(after[0].match_count, stored[0].match_count);
    }
}
