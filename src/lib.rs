//! IngestForge - Ingest task orchestration engine
//!
//! This library crate exposes the scheduler and task model for integration
//! testing and embedding.

pub mod config;
pub mod ops;
pub mod scheduler;
pub mod services;
pub mod task;

pub use ingestforge_core::{
    BatchId, ClipId, CompletionSummary, EncoderRequestId, Error, Event, EventBus, IngestEvent,
    Result, TaskCategory, TaskId, TaskState, VerifyMismatch,
};
pub use scheduler::{Collaborators, SchedulerHandle, SchedulerState, TaskScheduler};
pub use task::{Task, TaskKind};
