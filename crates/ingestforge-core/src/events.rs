//! Ingest event system.
//!
//! [`EventBus`] wraps a `tokio::sync::broadcast` channel with a bounded
//! ring-buffer of recent events so that late-joining subscribers can catch
//! up. Every externally observable state change of the engine — batch
//! lifecycle, task status transitions, progress — is broadcast here; the
//! scheduler never calls back into the host directly.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::ids::{BatchId, TaskId};

/// Maximum number of events retained in the ring buffer.
const MAX_RECENT_EVENTS: usize = 100;

// ---------------------------------------------------------------------------
// Task vocabulary shared with the engine crate
// ---------------------------------------------------------------------------

/// Lifecycle state of a task while it sits in (or has left) its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Constructed and queued, not yet dispatched.
    Init,
    /// Handed to a worker or external service.
    Running,
    /// Finished; the result may still be a failure (see task status events).
    Done,
    /// Skipped by dispatch until resumed.
    Paused,
    /// Finished with at least one recorded failure.
    Failure,
    /// Removed by a cancel before reaching a terminal outcome.
    Aborted,
}

/// The five task categories the scheduler keeps separate queues for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Copy,
    UpdateMetadata,
    Import,
    Transcode,
    Concatenate,
}

impl TaskCategory {
    /// All categories, in the order summaries list them.
    pub const ALL: [TaskCategory; 5] = [
        TaskCategory::Copy,
        TaskCategory::UpdateMetadata,
        TaskCategory::Import,
        TaskCategory::Transcode,
        TaskCategory::Concatenate,
    ];
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskCategory::Copy => write!(f, "copy"),
            TaskCategory::UpdateMetadata => write!(f, "update metadata"),
            TaskCategory::Import => write!(f, "import"),
            TaskCategory::Transcode => write!(f, "transcode"),
            TaskCategory::Concatenate => write!(f, "concatenate"),
        }
    }
}

/// Per-category failed/total file counts for the end-of-run summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCounts {
    /// Files that reached a terminal failure in this category.
    pub failed: u64,
    /// All files this category attempted.
    pub total: u64,
}

/// One human-readable failure summary across all five categories, surfaced
/// once when the queues drain instead of one message per failed file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionSummary {
    pub copy: CategoryCounts,
    pub update_metadata: CategoryCounts,
    pub import: CategoryCounts,
    pub transcode: CategoryCounts,
    pub concatenate: CategoryCounts,
}

impl CompletionSummary {
    /// Counts for one category.
    pub fn counts(&self, category: TaskCategory) -> CategoryCounts {
        match category {
            TaskCategory::Copy => self.copy,
            TaskCategory::UpdateMetadata => self.update_metadata,
            TaskCategory::Import => self.import,
            TaskCategory::Transcode => self.transcode,
            TaskCategory::Concatenate => self.concatenate,
        }
    }

    /// Mutable counts for one category.
    pub fn counts_mut(&mut self, category: TaskCategory) -> &mut CategoryCounts {
        match category {
            TaskCategory::Copy => &mut self.copy,
            TaskCategory::UpdateMetadata => &mut self.update_metadata,
            TaskCategory::Import => &mut self.import,
            TaskCategory::Transcode => &mut self.transcode,
            TaskCategory::Concatenate => &mut self.concatenate,
        }
    }

    /// Whether any category recorded a failure.
    pub fn has_failures(&self) -> bool {
        TaskCategory::ALL
            .iter()
            .any(|c| self.counts(*c).failed > 0)
    }
}

impl fmt::Display for CompletionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.has_failures() {
            return write!(f, "ingest finished with no failures");
        }
        write!(f, "ingest finished with failures:")?;
        for category in TaskCategory::ALL {
            let counts = self.counts(category);
            if counts.failed > 0 {
                write!(f, " {} {}/{} failed;", category, counts.failed, counts.total)?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// IngestEvent
// ---------------------------------------------------------------------------

/// Payload describing what happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IngestEvent {
    // -- Batch lifecycle -----------------------------------------------------
    BatchStarted {
        batch_id: BatchId,
        target: PathBuf,
    },
    BatchFinished {
        batch_id: BatchId,
        canceled: bool,
    },

    // -- Task lifecycle ------------------------------------------------------
    TaskStatus {
        task_id: TaskId,
        category: TaskCategory,
        state: TaskState,
        message: Option<String>,
    },
    /// Aggregated ingest progress in `0.0..=1.0`.
    TaskProgress {
        task_id: TaskId,
        category: TaskCategory,
        progress: f64,
    },

    // -- Run lifecycle -------------------------------------------------------
    /// The queues drained; one summary for the whole run.
    RunFinished {
        summary: CompletionSummary,
    },
    /// The whole run was canceled (user abort or declined conflict prompt).
    RunCanceled,
}

/// A timestamped event ready for broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier.
    pub id: Uuid,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub payload: IngestEvent,
}

impl Event {
    /// Create a new event with a fresh UUID and the current timestamp.
    pub fn new(payload: IngestEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Broadcast channel with a bounded ring buffer of recent events.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    recent: RwLock<VecDeque<Event>>,
}

impl EventBus {
    /// Create a new event bus.
    ///
    /// `capacity` controls the broadcast channel buffer size (not the ring
    /// buffer, which is always [`MAX_RECENT_EVENTS`]).
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            recent: RwLock::new(VecDeque::with_capacity(MAX_RECENT_EVENTS)),
        }
    }

    /// Subscribe to the broadcast channel.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Broadcast an event to all current subscribers and store it in the
    /// ring buffer.
    pub fn broadcast(&self, payload: IngestEvent) {
        let event = Event::new(payload);

        // Store in ring buffer regardless of subscriber count.
        {
            let mut recent = self.recent.write();
            if recent.len() >= MAX_RECENT_EVENTS {
                recent.pop_back();
            }
            recent.push_front(event.clone());
        }

        // Ignore send errors (no subscribers).
        let _ = self.tx.send(event);
    }

    /// Return the `n` most recent events (newest first).
    pub fn recent_events(&self, n: usize) -> Vec<Event> {
        let recent = self.recent.read();
        recent.iter().take(n).cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
