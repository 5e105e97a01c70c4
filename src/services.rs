//! External collaborator contracts.
//!
//! The engine drives everything that touches the encoder process, the
//! library, the importer, and the metadata codec through these traits; the
//! host wires in real implementations, tests wire in stubs. Asynchronous
//! collaborator reports come back over listener channels the scheduler
//! registers, never as direct calls into scheduler state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use ingestforge_core::{BatchId, EncoderRequestId, Result, TaskCategory, TaskId, TaskState};

use crate::task::{CopyAction, ImportItem};

// ---------------------------------------------------------------------------
// Encoder service
// ---------------------------------------------------------------------------

/// A transcode/concatenate job descriptor for the external encoder.
#[derive(Debug, Clone)]
pub struct EncoderJob {
    /// Opaque request key the scheduler supplies; all events for this job
    /// carry it back.
    pub request_id: EncoderRequestId,
    pub inputs: Vec<PathBuf>,
    pub dest_dir: PathBuf,
    pub preset: String,
}

/// Asynchronous per-job reports from the encoder.
#[derive(Debug, Clone)]
pub enum EncoderEvent {
    Ready {
        request_id: EncoderRequestId,
    },
    Progress {
        request_id: EncoderRequestId,
        /// `0.0..=1.0`
        progress: f64,
    },
    Complete {
        request_id: EncoderRequestId,
        output: PathBuf,
    },
    Error {
        request_id: EncoderRequestId,
        message: String,
    },
    ServerOffline {
        request_id: EncoderRequestId,
    },
}

/// The external encoder process that performs transcode/concatenate work.
///
/// Submission is synchronous accept/reject; everything else arrives as
/// [`EncoderEvent`]s on the registered listener channel. The encoder keeps
/// its own internal queue and concurrency.
#[async_trait]
pub trait EncoderService: Send + Sync {
    /// Register the channel job events are delivered on.
    fn register_listener(&self, listener: UnboundedSender<EncoderEvent>);

    /// Drop the registered listener; no further events are delivered.
    fn unregister_listener(&self);

    /// Submit a job. `Err` carries the rejection reason (bad relative path,
    /// unreachable preset, folder as source).
    async fn submit(&self, job: EncoderJob) -> std::result::Result<(), String>;

    /// Ask the encoder to pause the host's queue. Jobs already encoding are
    /// not interrupted.
    async fn pause_host_queue(&self);

    /// Resume the host's queue.
    async fn resume_host_queue(&self);

    /// Cancel one submitted job.
    async fn cancel_job(&self, request_id: EncoderRequestId);
}

// ---------------------------------------------------------------------------
// Import executor
// ---------------------------------------------------------------------------

/// One file handed to the importer batch executor.
#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub path: PathBuf,
    pub batch_id: BatchId,
    /// The Import task this file belongs to.
    pub host_task_id: TaskId,
    pub item: ImportItem,
}

/// Asynchronous per-file reports from the importer.
#[derive(Debug, Clone)]
pub enum ImporterEvent {
    XmpImported {
        path: PathBuf,
    },
    ThumbnailReady {
        path: PathBuf,
    },
    FileFinished {
        path: PathBuf,
        batch_id: BatchId,
        host_task_id: TaskId,
        result: std::result::Result<(), String>,
    },
}

/// The importer batch executor that turns produced files into library items.
#[async_trait]
pub trait ImportExecutor: Send + Sync {
    /// Register the channel per-file reports are delivered on.
    fn register_listener(&self, listener: UnboundedSender<ImporterEvent>);

    /// Feed newly-ready import items.
    async fn enqueue(&self, items: Vec<ImportRequest>);

    /// Nudge the executor to make progress; called once per dispatch pass.
    async fn unblock(&self);
}

// ---------------------------------------------------------------------------
// Library notifier
// ---------------------------------------------------------------------------

/// One-way notifications into the host library, plus the two synchronous
/// queries the copy worker needs (open-file check, metadata cache
/// invalidation).
#[async_trait]
pub trait LibraryNotifier: Send + Sync {
    async fn batch_started(&self, batch_id: BatchId, target: &Path);
    async fn batch_finished(&self, batch_id: BatchId, canceled: bool);
    async fn task_state(&self, task_id: TaskId, category: TaskCategory, state: TaskState);
    /// Produced files that require no further scheduling and are ready to
    /// become library items.
    async fn import_items_ready(&self, items: Vec<(PathBuf, ImportItem)>);
    /// Final outputs with no import step (e.g. backup-only destinations).
    async fn backup_items_ready(&self, paths: Vec<PathBuf>);
    /// Whether the host currently has the path open/dirty; copying onto such
    /// a path must fail without touching disk.
    fn is_path_open(&self, path: &Path) -> bool;
    /// Drop any cached metadata for an overwritten destination.
    fn invalidate_metadata_cache(&self, path: &Path);
}

// ---------------------------------------------------------------------------
// Exist-conflict resolver
// ---------------------------------------------------------------------------

/// An ambiguous destination conflict found during the Copy pre-check.
#[derive(Debug, Clone)]
pub struct ExistConflict {
    pub src: PathBuf,
    pub dest: PathBuf,
    pub is_dir: bool,
}

/// What the resolver decided for a conflict.
#[derive(Debug, Clone, Copy)]
pub enum ConflictDecision {
    Resolved {
        action: CopyAction,
        /// Apply the same action to every later conflict of the same kind
        /// for the rest of the run.
        apply_to_all: bool,
    },
    /// The user aborted the prompt; the entire run is canceled.
    CancelRun,
}

/// Resolves destination-exists conflicts, possibly by blocking on a user
/// prompt.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(&self, conflict: ExistConflict) -> ConflictDecision;
}

// ---------------------------------------------------------------------------
// Metadata codec
// ---------------------------------------------------------------------------

/// The sidecar/embedded metadata codec (XMP in the host application),
/// behind a seam so the engine never parses metadata itself.
#[async_trait]
pub trait MetadataCodec: Send + Sync {
    /// Whether the file format supports this metadata codec.
    fn supports(&self, path: &Path) -> bool;

    /// Read the existing metadata fields for a file.
    async fn read(&self, path: &Path) -> Result<HashMap<String, String>>;

    /// Write the full field set back to the file.
    async fn write(&self, path: &Path, fields: &HashMap<String, String>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// No-op implementations (CLI wiring and simple hosts)
// ---------------------------------------------------------------------------

/// Library notifier that logs and answers "not open" for every path.
#[derive(Debug, Default)]
pub struct NullLibraryNotifier;

#[async_trait]
impl LibraryNotifier for NullLibraryNotifier {
    async fn batch_started(&self, batch_id: BatchId, target: &Path) {
        tracing::debug!(batch_id = %batch_id, target = %target.display(), "batch started");
    }

    async fn batch_finished(&self, batch_id: BatchId, canceled: bool) {
        tracing::debug!(batch_id = %batch_id, canceled, "batch finished");
    }

    async fn task_state(&self, task_id: TaskId, category: TaskCategory, state: TaskState) {
        tracing::debug!(task_id = %task_id, %category, ?state, "task state");
    }

    async fn import_items_ready(&self, items: Vec<(PathBuf, ImportItem)>) {
        tracing::debug!(count = items.len(), "import items ready");
    }

    async fn backup_items_ready(&self, paths: Vec<PathBuf>) {
        tracing::debug!(count = paths.len(), "backup items ready");
    }

    fn is_path_open(&self, _path: &Path) -> bool {
        false
    }

    fn invalidate_metadata_cache(&self, _path: &Path) {}
}

/// Resolver that always answers with a fixed action and never prompts.
#[derive(Debug, Clone, Copy)]
pub struct AutoConflictResolver {
    pub action: CopyAction,
}

impl Default for AutoConflictResolver {
    fn default() -> Self {
        Self {
            action: CopyAction::Replaced,
        }
    }
}

#[async_trait]
impl ConflictResolver for AutoConflictResolver {
    async fn resolve(&self, _conflict: ExistConflict) -> ConflictDecision {
        ConflictDecision::Resolved {
            action: self.action,
            apply_to_all: true,
        }
    }
}

/// Encoder stand-in for hosts without an encoder process: rejects every
/// submission as offline.
#[derive(Debug, Default)]
pub struct OfflineEncoderService;

#[async_trait]
impl EncoderService for OfflineEncoderService {
    fn register_listener(&self, _listener: UnboundedSender<EncoderEvent>) {}

    fn unregister_listener(&self) {}

    async fn submit(&self, _job: EncoderJob) -> std::result::Result<(), String> {
        Err("encoder server offline".into())
    }

    async fn pause_host_queue(&self) {}

    async fn resume_host_queue(&self) {}

    async fn cancel_job(&self, _request_id: EncoderRequestId) {}
}

/// Importer that reports every enqueued file finished immediately.
#[derive(Debug, Default)]
pub struct InstantImportExecutor {
    listener: parking_lot::Mutex<Option<UnboundedSender<ImporterEvent>>>,
}

#[async_trait]
impl ImportExecutor for InstantImportExecutor {
    fn register_listener(&self, listener: UnboundedSender<ImporterEvent>) {
        *self.listener.lock() = Some(listener);
    }

    async fn enqueue(&self, items: Vec<ImportRequest>) {
        let listener = self.listener.lock().clone();
        if let Some(tx) = listener {
            for item in items {
                let _ = tx.send(ImporterEvent::FileFinished {
                    path: item.path,
                    batch_id: item.batch_id,
                    host_task_id: item.host_task_id,
                    result: Ok(()),
                });
            }
        }
    }

    async fn unblock(&self) {}
}

/// Codec stand-in that supports no formats; metadata-only files fail, files
/// with other reasons are skipped.
#[derive(Debug, Default)]
pub struct NullMetadataCodec;

#[async_trait]
impl MetadataCodec for NullMetadataCodec {
    fn supports(&self, _path: &Path) -> bool {
        false
    }

    async fn read(&self, path: &Path) -> Result<HashMap<String, String>> {
        Err(ingestforge_core::Error::not_found("metadata", path.display()))
    }

    async fn write(&self, path: &Path, _fields: &HashMap<String, String>) -> Result<()> {
        Err(ingestforge_core::Error::not_found("metadata", path.display()))
    }
}
