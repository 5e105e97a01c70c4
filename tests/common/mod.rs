//! Shared test harness: a scheduler wired to scriptable stub collaborators.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedSender;

use ingestforge::config::EngineConfig;
use ingestforge::scheduler::{Collaborators, SchedulerHandle, TaskScheduler};
use ingestforge::services::{
    ConflictDecision, ConflictResolver, EncoderEvent, EncoderJob, EncoderService, ExistConflict,
    ImportExecutor, ImportRequest, ImporterEvent, LibraryNotifier, MetadataCodec,
};
use ingestforge::task::ImportItem;
use ingestforge::{BatchId, EncoderRequestId, IngestEvent, TaskCategory, TaskId, TaskState};

// ---------------------------------------------------------------------------
// Recording notifier
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pub batches_started: Mutex<Vec<BatchId>>,
    /// `(batch, canceled)`
    pub batches_finished: Mutex<Vec<(BatchId, bool)>>,
    pub task_states: Mutex<Vec<(TaskId, TaskCategory, TaskState)>>,
    pub open_paths: Mutex<Vec<PathBuf>>,
    pub invalidated: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl LibraryNotifier for RecordingNotifier {
    async fn batch_started(&self, batch_id: BatchId, _target: &Path) {
        self.batches_started.lock().push(batch_id);
    }

    async fn batch_finished(&self, batch_id: BatchId, canceled: bool) {
        self.batches_finished.lock().push((batch_id, canceled));
    }

    async fn task_state(&self, task_id: TaskId, category: TaskCategory, state: TaskState) {
        self.task_states.lock().push((task_id, category, state));
    }

    async fn import_items_ready(&self, _items: Vec<(PathBuf, ImportItem)>) {}

    async fn backup_items_ready(&self, _paths: Vec<PathBuf>) {}

    fn is_path_open(&self, path: &Path) -> bool {
        self.open_paths.lock().iter().any(|p| p == path)
    }

    fn invalidate_metadata_cache(&self, path: &Path) {
        self.invalidated.lock().push(path.to_owned());
    }
}

// ---------------------------------------------------------------------------
// Scriptable encoder
// ---------------------------------------------------------------------------

/// Encoder stub the test drives by hand: submitted jobs are recorded, and
/// the test emits Ready/Progress/Complete/Error events when it chooses.
#[derive(Debug, Default)]
pub struct ScriptedEncoder {
    listener: Mutex<Option<UnboundedSender<EncoderEvent>>>,
    pub jobs: Mutex<Vec<EncoderJob>>,
    pub canceled: Mutex<Vec<EncoderRequestId>>,
    pub reject_with: Mutex<Option<String>>,
    pub paused: Mutex<bool>,
}

impl ScriptedEncoder {
    pub fn rejecting(message: &str) -> Self {
        let encoder = Self::default();
        *encoder.reject_with.lock() = Some(message.to_owned());
        encoder
    }

    pub async fn submitted_job(&self) -> EncoderJob {
        wait_until(|| self.jobs.lock().first().cloned()).await
    }

    pub fn send(&self, event: EncoderEvent) {
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            let _ = listener.send(event);
        }
    }
}

#[async_trait]
impl EncoderService for ScriptedEncoder {
    fn register_listener(&self, listener: UnboundedSender<EncoderEvent>) {
        *self.listener.lock() = Some(listener);
    }

    fn unregister_listener(&self) {
        *self.listener.lock() = None;
    }

    async fn submit(&self, job: EncoderJob) -> Result<(), String> {
        if let Some(message) = self.reject_with.lock().clone() {
            return Err(message);
        }
        self.jobs.lock().push(job);
        Ok(())
    }

    async fn pause_host_queue(&self) {
        *self.paused.lock() = true;
    }

    async fn resume_host_queue(&self) {
        *self.paused.lock() = false;
    }

    async fn cancel_job(&self, request_id: EncoderRequestId) {
        self.canceled.lock().push(request_id);
    }
}

// ---------------------------------------------------------------------------
// Manual importer
// ---------------------------------------------------------------------------

/// Importer stub that holds enqueued files until the test finishes them.
#[derive(Debug, Default)]
pub struct ManualImporter {
    listener: Mutex<Option<UnboundedSender<ImporterEvent>>>,
    pub requests: Mutex<Vec<ImportRequest>>,
    pub unblocked: Mutex<bool>,
}

impl ManualImporter {
    pub async fn enqueued_requests(&self, count: usize) -> Vec<ImportRequest> {
        wait_until(|| {
            let requests = self.requests.lock();
            (requests.len() >= count).then(|| requests.clone())
        })
        .await
    }

    pub fn finish(&self, request: &ImportRequest, result: Result<(), String>) {
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            let _ = listener.send(ImporterEvent::FileFinished {
                path: request.path.clone(),
                batch_id: request.batch_id,
                host_task_id: request.host_task_id,
                result,
            });
        }
    }

    pub fn finish_all_ok(&self) {
        let requests = self.requests.lock().clone();
        for request in &requests {
            self.finish(request, Ok(()));
        }
    }
}

#[async_trait]
impl ImportExecutor for ManualImporter {
    fn register_listener(&self, listener: UnboundedSender<ImporterEvent>) {
        *self.listener.lock() = Some(listener);
    }

    async fn enqueue(&self, items: Vec<ImportRequest>) {
        self.requests.lock().extend(items);
    }

    async fn unblock(&self) {
        *self.unblocked.lock() = true;
    }
}

// ---------------------------------------------------------------------------
// Scripted conflict resolver
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ScriptedResolver {
    pub decisions: Mutex<VecDeque<ConflictDecision>>,
    pub conflicts_seen: Mutex<Vec<ExistConflict>>,
}

impl ScriptedResolver {
    pub fn with_decisions(decisions: Vec<ConflictDecision>) -> Self {
        Self {
            decisions: Mutex::new(decisions.into()),
            conflicts_seen: Mutex::default(),
        }
    }
}

#[async_trait]
impl ConflictResolver for ScriptedResolver {
    async fn resolve(&self, conflict: ExistConflict) -> ConflictDecision {
        self.conflicts_seen.lock().push(conflict);
        self.decisions
            .lock()
            .pop_front()
            .unwrap_or(ConflictDecision::CancelRun)
    }
}

// ---------------------------------------------------------------------------
// Recording metadata codec
// ---------------------------------------------------------------------------

/// Supports `.mov` files only; records every write.
#[derive(Debug, Default)]
pub struct RecordingCodec {
    pub writes: Mutex<Vec<(PathBuf, HashMap<String, String>)>>,
}

#[async_trait]
impl MetadataCodec for RecordingCodec {
    fn supports(&self, path: &Path) -> bool {
        path.extension().is_some_and(|ext| ext == "mov")
    }

    async fn read(&self, _path: &Path) -> ingestforge::Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }

    async fn write(
        &self,
        path: &Path,
        fields: &HashMap<String, String>,
    ) -> ingestforge::Result<()> {
        self.writes.lock().push((path.to_owned(), fields.clone()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct TestHarness {
    pub handle: SchedulerHandle,
    pub notifier: Arc<RecordingNotifier>,
    pub encoder: Arc<ScriptedEncoder>,
    pub importer: Arc<ManualImporter>,
    pub resolver: Arc<ScriptedResolver>,
    pub codec: Arc<RecordingCodec>,
    pub dir: tempfile::TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::build(ScriptedEncoder::default(), ScriptedResolver::default())
    }

    pub fn with_encoder(encoder: ScriptedEncoder) -> Self {
        Self::build(encoder, ScriptedResolver::default())
    }

    pub fn with_resolver(resolver: ScriptedResolver) -> Self {
        Self::build(ScriptedEncoder::default(), resolver)
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::build_with(
            ScriptedEncoder::default(),
            ScriptedResolver::default(),
            config,
        )
    }

    fn build(encoder: ScriptedEncoder, resolver: ScriptedResolver) -> Self {
        let mut config = EngineConfig::default();
        // Fast pause polling keeps the tests snappy.
        config.pause_poll_interval_ms = 10;
        Self::build_with(encoder, resolver, config)
    }

    fn build_with(
        encoder: ScriptedEncoder,
        resolver: ScriptedResolver,
        config: EngineConfig,
    ) -> Self {
        let notifier = Arc::new(RecordingNotifier::default());
        let encoder = Arc::new(encoder);
        let importer = Arc::new(ManualImporter::default());
        let resolver = Arc::new(resolver);
        let codec = Arc::new(RecordingCodec::default());

        let handle = TaskScheduler::spawn(
            config,
            Collaborators {
                encoder: encoder.clone(),
                importer: importer.clone(),
                notifier: notifier.clone(),
                resolver: resolver.clone(),
                metadata_codec: codec.clone(),
            },
        );

        Self {
            handle,
            notifier,
            encoder,
            importer,
            resolver,
            codec,
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    /// Creates a source file with the given content under the harness dir.
    pub async fn source_file(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.expect("mkdir");
        }
        tokio::fs::write(&path, content).await.expect("write");
        path
    }

    pub fn dest(&self, name: &str) -> PathBuf {
        self.dir.path().join("library").join(name)
    }
}

/// Polls `probe` until it produces a value, failing the test after 5s.
pub async fn wait_until<T>(mut probe: impl FnMut() -> Option<T>) -> T {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = probe() {
            return value;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for condition");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Waits for the first broadcast event matching `pred`.
pub async fn wait_for_event(
    rx: &mut broadcast::Receiver<ingestforge::Event>,
    mut pred: impl FnMut(&IngestEvent) -> bool,
) -> IngestEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if pred(&event.payload) {
                        return event.payload;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
