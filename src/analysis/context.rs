//! Run Context
//!
//! State owned by exactly one pass. It is built after the run lock is
//! taken and dropped when the pass ends; nothing in it outlives the run.

use crate::patterns::RunCache;
use crate::settings::AnalysisSettings;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

pub struct RunContext {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    /// Settings as loaded for this pass
    pub settings: AnalysisSettings,
    /// Identity-key cache, prefetched once for this pass
    pub cache: RunCache,
}

impl RunContext {
    pub fn new(
        run_id: impl Into<String>,
        started_at: DateTime<Utc>,
        settings: AnalysisSettings,
        cache: RunCache,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            started_at,
            settings,
            cache,
        }
    }

    /// Fresh run id
    pub fn new_run_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Oldest event the pass reads
    pub fn lookback_start(&self) -> DateTime<Utc> {
        self.started_at - Duration::days(self.settings.tunables.general.lookback_days as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookback_start() {
        let now = Utc::now();
        let mut settings = AnalysisSettings::default();
        settings.tunables.general.lookback_days = 7;
        let ctx = RunContext::new("run-1", now, settings, RunCache::default());

        assert_eq!(ctx.lookback_start(), now - Duration::days(7));
        assert_ne!(RunContext::new_run_id(), RunContext::new_run_id());
    }
}
