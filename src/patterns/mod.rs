//! Learned Patterns
//!
//! Persistence and lifecycle of detected regularities:
//!
//! - `types`: `LearnedPattern`, `Endpoint`, `PatternData` and friends
//! - `store`: `PatternStore` trait and the SQLite implementation
//! - `manager`: confidence blending, upsert and status operations
//! - `janitor`: post-pass removal of unconfirmed observed patterns

pub mod error;
pub mod janitor;
pub mod manager;
pub mod store;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use janitor::StalePatternJanitor;
pub use manager::{blend_confidence, PatternManager, RunCache, UpsertOutcome, UpsertStats};
pub use store::{Observation, PatternStore, SqlitePatternStore};
pub use types::{
    identity_key, CorrelationData, CorrelationScope, DayFilter, Endpoint, EventChainData,
    LearnedPattern, PatternData, PatternFilter, PatternStatus, PatternType, SunAnchor, SunOffset,
    TimeBasedData,
};
