//! ingestforge-core: shared IDs, errors, and the ingest event system.
//!
//! This crate is the foundational dependency for the ingest engine,
//! providing type-safe identifiers, a unified error type, and the
//! broadcast event bus workers and hosts subscribe to.

pub mod error;
pub mod events;
pub mod ids;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, Result, VerifyMismatch};
pub use events::{CompletionSummary, Event, EventBus, IngestEvent, TaskCategory, TaskState};
pub use ids::*;
