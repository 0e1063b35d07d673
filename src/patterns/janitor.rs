//! Stale-Pattern Janitor
//!
//! After a pass, removes `observed` patterns the pass did not reconfirm.
//! Every other status is only ever removed by an explicit delete.

use crate::patterns::error::StoreResult;
use crate::patterns::store::PatternStore;
use crate::patterns::types::PatternType;
use std::sync::Arc;

pub struct StalePatternJanitor {
    store: Arc<dyn PatternStore>,
}

impl StalePatternJanitor {
    pub fn new(store: Arc<dyn PatternStore>) -> Self {
        Self { store }
    }

    /// Delete unconfirmed observed patterns of `types`
    ///
    /// Types whose upsert step failed must be left out of `types`.
    pub fn sweep(&self, run_id: &str, types: &[PatternType]) -> StoreResult<usize> {
        let deleted = self.store.delete_unconfirmed(run_id, types)?;
        if deleted > 0 {
            tracing::info!(run_id = %run_id, deleted, "Removed stale observed patterns");
        }
        Ok(deleted)
    }
}
