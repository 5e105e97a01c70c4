//! Background operation workers and their cooperative control protocol.
//!
//! Workers never share scheduler state; they report through
//! [`WorkerEvent`] messages and honor pause/cancel cooperatively by polling
//! [`OpControl::can_continue`] between files. There is no preemption: a
//! worker mid-file always finishes that file before honoring a request.

pub mod copy;
pub mod update_metadata;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use ingestforge_core::TaskId;

use crate::task::ImportItem;

// ---------------------------------------------------------------------------
// OpControl
// ---------------------------------------------------------------------------

const STATUS_RUNNING: u8 = 0;
const STATUS_PAUSED: u8 = 1;
const STATUS_CANCELED: u8 = 2;

/// Shared status of one running operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Running,
    Paused,
    Canceled,
}

/// Cooperative pause/cancel latch shared between the scheduler and one
/// worker.
///
/// `cancel` is one-way: once set, the status never leaves `Canceled`. A
/// caller that needs the worker fully stopped must await its join handle
/// afterwards, bounded by how quickly the worker reaches its next
/// checkpoint.
#[derive(Debug)]
pub struct OpControl {
    status: AtomicU8,
    poll_interval: Duration,
}

impl OpControl {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            status: AtomicU8::new(STATUS_RUNNING),
            poll_interval,
        }
    }

    pub fn status(&self) -> OpStatus {
        match self.status.load(Ordering::Acquire) {
            STATUS_PAUSED => OpStatus::Paused,
            STATUS_CANCELED => OpStatus::Canceled,
            _ => OpStatus::Running,
        }
    }

    pub fn pause(&self) {
        // A canceled operation stays canceled.
        let _ = self.status.compare_exchange(
            STATUS_RUNNING,
            STATUS_PAUSED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn resume(&self) {
        let _ = self.status.compare_exchange(
            STATUS_PAUSED,
            STATUS_RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn cancel(&self) {
        self.status.store(STATUS_CANCELED, Ordering::Release);
    }

    /// Checkpoint polled between units of work.
    ///
    /// Sleeps in a fixed-interval loop while paused; returns `false` once
    /// canceled, telling the worker to return without finishing its plan.
    pub async fn can_continue(&self) -> bool {
        loop {
            match self.status() {
                OpStatus::Running => return true,
                OpStatus::Canceled => return false,
                OpStatus::Paused => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Worker results
// ---------------------------------------------------------------------------

/// One file that reached a terminal failure inside a worker.
#[derive(Debug, Clone)]
pub struct FileFailure {
    pub path: PathBuf,
    pub message: String,
}

/// Terminal outcome of one copy unit: every entry has been attempted.
#[derive(Debug, Clone, Default)]
pub struct UnitOutcome {
    /// Destination paths that reached a terminal success (including no-op
    /// skips of optional sources and ignored entries).
    pub succeeded: Vec<PathBuf>,
    pub failed: Vec<FileFailure>,
}

/// Terminal outcome of one UpdateMetadata task.
#[derive(Debug, Clone, Default)]
pub struct MetadataOutcome {
    /// Final (post-rename) paths that were processed successfully.
    pub succeeded: Vec<PathBuf>,
    pub failed: Vec<FileFailure>,
    /// Import map remapped to post-rename paths.
    pub import_files: HashMap<PathBuf, ImportItem>,
    pub need_create_import_task: bool,
}

/// Messages workers send back to the scheduler.
#[derive(Debug)]
pub enum WorkerEvent {
    /// A copy unit reached its barrier; downstream discovery may run while
    /// the worker continues with the next unit.
    CopyUnitFinished {
        task_id: TaskId,
        unit_index: usize,
        outcome: UnitOutcome,
    },
    /// In-task fractional progress, already throttled to whole-percent
    /// changes by the worker.
    CopyProgress {
        task_id: TaskId,
        /// `0.0..=1.0` within the task.
        fraction: f64,
    },
    /// The copy worker finished (or acknowledged a cancel).
    CopyTaskFinished {
        task_id: TaskId,
        canceled: bool,
    },
    /// An UpdateMetadata worker finished (or acknowledged a cancel).
    MetadataTaskFinished {
        task_id: TaskId,
        outcome: MetadataOutcome,
        canceled: bool,
    },
}
