//! Event Input
//!
//! Read-only view of the smart-home event history.
//!
//! - `StateEvent` / `EventContext` / `AutomationFiring`: the input model
//! - `EventSource`: async trait the engine reads through
//! - `MemoryEventSource`: in-memory source for tests and embedding
//! - `CsvEventSource`: reads the recorder's CSV export

pub mod csv_source;
pub mod error;
pub mod source;
pub mod types;

#[cfg(test)]
pub(crate) mod fixtures;

pub use csv_source::CsvEventSource;
pub use error::{SourceError, SourceResult, ValidationError};
pub use source::{EventSource, MemoryEventSource};
pub use types::{AutomationFiring, EventContext, StateEvent, TimeSlot, WeekdayType, NOISE_STATES};
