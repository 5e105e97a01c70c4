//! The ingest task scheduler.
//!
//! A single actor task owns all scheduler state: five FIFO queues (one per
//! task category), the progress ledger, the per-run completion summary, and
//! the handles of in-flight workers. Everything else talks to it through
//! [`SchedulerHandle`] messages, so no lock guards the queues and the
//! Init -> Running <-> Paused state machine has exactly one writer.

pub mod progress;

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ingestforge_core::{
    BatchId, CompletionSummary, EventBus, IngestEvent, TaskCategory, TaskId, TaskState,
};

use crate::config::EngineConfig;
use crate::ops::copy::CopyWorker;
use crate::ops::update_metadata::MetadataWorker;
use crate::ops::{OpControl, WorkerEvent};
use crate::scheduler::progress::ProgressLedger;
use crate::services::{
    ConflictDecision, ConflictResolver, EncoderEvent, EncoderJob, EncoderService, ExistConflict,
    ImportExecutor, ImportRequest, ImporterEvent, LibraryNotifier, MetadataCodec,
};
use crate::task::{
    factory, CopyAction, CopySetting, CopyUnit, ExistOption, ImportSetting, Task, TaskKind,
    UpdateMetadataSetting,
};

// ---------------------------------------------------------------------------
// Public surface
// ---------------------------------------------------------------------------

/// External collaborators the scheduler drives. All trait objects so tests
/// can substitute stubs.
#[derive(Clone)]
pub struct Collaborators {
    pub encoder: Arc<dyn EncoderService>,
    pub importer: Arc<dyn ImportExecutor>,
    pub notifier: Arc<dyn LibraryNotifier>,
    pub resolver: Arc<dyn ConflictResolver>,
    pub metadata_codec: Arc<dyn MetadataCodec>,
}

/// Scheduler lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// No run in progress; queues are empty.
    Init,
    Running,
    Paused,
}

/// Messages accepted by the scheduler actor.
enum SchedulerCommand {
    Submit {
        tasks: Vec<Task>,
        target: PathBuf,
    },
    Pause,
    Resume,
    Cancel {
        ack: oneshot::Sender<()>,
    },
    Shutdown {
        force: bool,
        ack: oneshot::Sender<()>,
    },
    HasTaskRunning {
        reply: oneshot::Sender<bool>,
    },
    IsPathInCopyList {
        path: PathBuf,
        reply: oneshot::Sender<bool>,
    },
    State {
        reply: oneshot::Sender<SchedulerState>,
    },
}

/// Cloneable handle to a running scheduler actor.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<SchedulerCommand>,
    events: Arc<EventBus>,
    kill: CancellationToken,
}

impl SchedulerHandle {
    /// Submits one batch of tasks. The scheduler starts running if idle.
    pub async fn submit_batch(&self, tasks: Vec<Task>, target: impl Into<PathBuf>) {
        let _ = self
            .commands
            .send(SchedulerCommand::Submit {
                tasks,
                target: target.into(),
            })
            .await;
    }

    pub async fn pause(&self) {
        let _ = self.commands.send(SchedulerCommand::Pause).await;
    }

    pub async fn resume(&self) {
        let _ = self.commands.send(SchedulerCommand::Resume).await;
    }

    /// Cancels the whole run and waits until every worker has stopped and
    /// the scheduler is back in its idle state.
    pub async fn cancel(&self) {
        let (ack, done) = oneshot::channel();
        if self
            .commands
            .send(SchedulerCommand::Cancel { ack })
            .await
            .is_ok()
        {
            let _ = done.await;
        }
    }

    /// Stops the actor. With `force` the current run is canceled first;
    /// otherwise the actor finishes the run and then exits.
    pub async fn shutdown(&self, force: bool) {
        let (ack, done) = oneshot::channel();
        if self
            .commands
            .send(SchedulerCommand::Shutdown { force, ack })
            .await
            .is_ok()
        {
            let _ = done.await;
        }
    }

    pub async fn has_task_running(&self) -> bool {
        self.query(|reply| SchedulerCommand::HasTaskRunning { reply })
            .await
            .unwrap_or(false)
    }

    /// Whether `path` is a pending copy destination, used to block opening
    /// files that are about to be overwritten.
    pub async fn is_path_in_copy_list(&self, path: impl Into<PathBuf>) -> bool {
        let path = path.into();
        self.query(|reply| SchedulerCommand::IsPathInCopyList { path, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn state(&self) -> SchedulerState {
        self.query(|reply| SchedulerCommand::State { reply })
            .await
            .unwrap_or(SchedulerState::Init)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Immediately stops the actor without waiting for workers, for
    /// process teardown paths where graceful shutdown is not worth it.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    async fn query<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SchedulerCommand,
    ) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(make(reply)).await.ok()?;
        rx.await.ok()
    }
}

// ---------------------------------------------------------------------------
// Actor internals
// ---------------------------------------------------------------------------

struct WorkerHandle {
    control: Arc<OpControl>,
    join: JoinHandle<()>,
}

/// Remembered "apply to all" conflict decision, scoped to one run.
#[derive(Debug, Default, Clone, Copy)]
struct CopyRunnerSetting {
    apply_to_all: Option<CopyAction>,
}

/// Running tallies for the single in-flight copy task.
#[derive(Debug, Default)]
struct CopyTally {
    files_succeeded: u64,
    files_failed: u64,
    units_done: u64,
}

pub struct TaskScheduler {
    state: SchedulerState,
    queues: HashMap<TaskCategory, VecDeque<Task>>,
    config: EngineConfig,
    collaborators: Collaborators,
    events: Arc<EventBus>,

    copy_worker: Option<WorkerHandle>,
    copy_tally: CopyTally,
    metadata_workers: HashMap<TaskId, WorkerHandle>,
    encoder_tasks: HashMap<ingestforge_core::EncoderRequestId, TaskId>,

    ledger: ProgressLedger,
    summary: CompletionSummary,
    runner_setting: CopyRunnerSetting,
    /// Tasks that were still Init when the run was paused; Resume puts them
    /// back to Init so dispatch picks them up.
    paused_init: HashSet<TaskId>,
    open_batches: HashMap<BatchId, PathBuf>,
    /// Encoder outputs to delete once their import finishes (or on cancel).
    auto_delete_outputs: Vec<PathBuf>,

    worker_tx: mpsc::UnboundedSender<WorkerEvent>,
    pending_shutdown: Option<oneshot::Sender<()>>,
}

impl TaskScheduler {
    /// Spawns the scheduler actor and returns its handle.
    pub fn spawn(config: EngineConfig, collaborators: Collaborators) -> SchedulerHandle {
        let events = Arc::new(EventBus::new(config.event_capacity));
        let (command_tx, command_rx) = mpsc::channel(config.command_capacity);
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (encoder_tx, encoder_rx) = mpsc::unbounded_channel();
        let (importer_tx, importer_rx) = mpsc::unbounded_channel();

        collaborators.encoder.register_listener(encoder_tx);
        collaborators.importer.register_listener(importer_tx);

        let scheduler = TaskScheduler {
            state: SchedulerState::Init,
            queues: TaskCategory::ALL
                .iter()
                .map(|c| (*c, VecDeque::new()))
                .collect(),
            config,
            collaborators,
            events: events.clone(),
            copy_worker: None,
            copy_tally: CopyTally::default(),
            metadata_workers: HashMap::new(),
            encoder_tasks: HashMap::new(),
            ledger: ProgressLedger::new(),
            summary: CompletionSummary::default(),
            runner_setting: CopyRunnerSetting::default(),
            paused_init: HashSet::new(),
            open_batches: HashMap::new(),
            auto_delete_outputs: Vec::new(),
            worker_tx,
            pending_shutdown: None,
        };

        let kill = CancellationToken::new();
        tokio::spawn(scheduler.run(
            command_rx,
            worker_rx,
            encoder_rx,
            importer_rx,
            kill.clone(),
        ));

        SchedulerHandle {
            commands: command_tx,
            events,
            kill,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SchedulerCommand>,
        mut worker_rx: mpsc::UnboundedReceiver<WorkerEvent>,
        mut encoder_rx: mpsc::UnboundedReceiver<EncoderEvent>,
        mut importer_rx: mpsc::UnboundedReceiver<ImporterEvent>,
        kill: CancellationToken,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await {
                            break;
                        }
                    }
                    // Every handle dropped: finish like a graceful shutdown.
                    None => {
                        if self.state != SchedulerState::Init {
                            self.cancel_run().await;
                        }
                        break;
                    }
                },
                Some(event) = worker_rx.recv() => self.handle_worker_event(event).await,
                Some(event) = encoder_rx.recv() => self.handle_encoder_event(event).await,
                Some(event) = importer_rx.recv() => self.handle_importer_event(event).await,
                _ = kill.cancelled() => break,
            }
        }
        self.collaborators.encoder.unregister_listener();
        debug!("scheduler actor exited");
    }

    /// Returns `true` when the actor should exit.
    async fn handle_command(&mut self, command: SchedulerCommand) -> bool {
        match command {
            SchedulerCommand::Submit { tasks, target } => {
                self.submit(tasks, target).await;
            }
            SchedulerCommand::Pause => self.pause().await,
            SchedulerCommand::Resume => self.resume().await,
            SchedulerCommand::Cancel { ack } => {
                self.cancel_run().await;
                let _ = ack.send(());
            }
            SchedulerCommand::Shutdown { force, ack } => {
                if force || self.state == SchedulerState::Init {
                    if self.state != SchedulerState::Init {
                        self.cancel_run().await;
                    }
                    let _ = ack.send(());
                    return true;
                }
                // Graceful: exit once the run drains.
                info!("shutdown deferred until the current run finishes");
                self.pending_shutdown = Some(ack);
            }
            SchedulerCommand::HasTaskRunning { reply } => {
                let busy = self.state != SchedulerState::Init
                    || self.queues.values().any(|q| !q.is_empty());
                let _ = reply.send(busy);
            }
            SchedulerCommand::IsPathInCopyList { path, reply } => {
                let _ = reply.send(self.is_path_in_copy_list(&path));
            }
            SchedulerCommand::State { reply } => {
                let _ = reply.send(self.state);
            }
        }
        false
    }

    // -- Submission and dispatch -------------------------------------------

    async fn submit(&mut self, tasks: Vec<Task>, target: PathBuf) {
        if tasks.is_empty() {
            return;
        }
        // A submission may mix tasks from several batches; every distinct
        // batch id is registered so each gets its finished event later.
        for batch_id in tasks.iter().map(|t| t.batch_id) {
            if !self.open_batches.contains_key(&batch_id) {
                self.open_batches.insert(batch_id, target.clone());
                self.collaborators
                    .notifier
                    .batch_started(batch_id, &target)
                    .await;
                self.events.broadcast(IngestEvent::BatchStarted {
                    batch_id,
                    target: target.clone(),
                });
            }
        }

        for task in tasks {
            info!(task_id = %task.id(), category = %task.category(), "task queued");
            self.ledger.add_forecast(task.unit_forecast());
            self.enqueue(task);
        }

        if self.state == SchedulerState::Init {
            self.state = SchedulerState::Running;
        }
        if self.state == SchedulerState::Running {
            self.dispatch().await;
        }
    }

    fn enqueue(&mut self, task: Task) {
        let category = task.category();
        if let Some(queue) = self.queues.get_mut(&category) {
            queue.push_back(task);
        }
    }

    /// Starts every task that is eligible to run right now.
    async fn dispatch(&mut self) {
        if self.state != SchedulerState::Running {
            return;
        }
        self.dispatch_copy().await;
        self.dispatch_metadata();
        self.dispatch_import().await;
        self.dispatch_encoder(TaskCategory::Transcode).await;
        self.dispatch_encoder(TaskCategory::Concatenate).await;
        self.check_done().await;
    }

    /// At most one copy task runs at a time; conflicts are resolved before
    /// the worker starts so it never has to prompt.
    async fn dispatch_copy(&mut self) {
        if self.copy_worker.is_some() {
            return;
        }
        let Some(task) = self
            .queues
            .get(&TaskCategory::Copy)
            .and_then(|q| q.front())
        else {
            return;
        };
        if task.state != TaskState::Init {
            return;
        }
        let task_id = task.id();

        let setting = match &task.kind {
            TaskKind::Copy(setting) => setting.clone(),
            _ => return,
        };
        let setting = match self.precheck_copy(setting).await {
            Some(setting) => setting,
            None => {
                // The user declined a conflict prompt.
                self.cancel_run().await;
                return;
            }
        };

        // Write the resolved actions back so queries and discovery see the
        // final destinations.
        if let Some(task) = self.find_task_mut(TaskCategory::Copy, task_id) {
            task.kind = TaskKind::Copy(setting.clone());
            task.state = TaskState::Running;
        }
        self.copy_tally = CopyTally::default();
        self.announce(task_id, TaskCategory::Copy, TaskState::Running, None)
            .await;

        let control = Arc::new(OpControl::new(Duration::from_millis(
            self.config.pause_poll_interval_ms,
        )));
        let worker = CopyWorker::new(
            task_id,
            setting,
            self.config.copy.clone(),
            control.clone(),
            self.collaborators.notifier.clone(),
            self.worker_tx.clone(),
        );
        let join = tokio::spawn(worker.run());
        self.copy_worker = Some(WorkerHandle { control, join });
    }

    /// Every queued metadata task starts immediately; they touch disjoint
    /// files by construction.
    fn dispatch_metadata(&mut self) {
        let Some(queue) = self.queues.get_mut(&TaskCategory::UpdateMetadata) else {
            return;
        };
        let mut started = Vec::new();
        for task in queue.iter_mut().filter(|t| t.state == TaskState::Init) {
            let TaskKind::UpdateMetadata(setting) = &task.kind else {
                continue;
            };
            task.state = TaskState::Running;
            let control = Arc::new(OpControl::new(Duration::from_millis(
                self.config.pause_poll_interval_ms,
            )));
            let worker = MetadataWorker::new(
                task.id(),
                setting.clone(),
                task.custom_metadata.clone(),
                control.clone(),
                self.collaborators.metadata_codec.clone(),
                self.worker_tx.clone(),
            );
            let join = tokio::spawn(worker.run());
            self.metadata_workers
                .insert(task.id(), WorkerHandle { control, join });
            started.push(task.id());
        }
        for task_id in started {
            self.events.broadcast(IngestEvent::TaskStatus {
                task_id,
                category: TaskCategory::UpdateMetadata,
                state: TaskState::Running,
                message: None,
            });
        }
    }

    async fn dispatch_import(&mut self) {
        let mut batches = Vec::new();
        if let Some(queue) = self.queues.get_mut(&TaskCategory::Import) {
            for task in queue.iter_mut().filter(|t| t.state == TaskState::Init) {
                let TaskKind::Import(setting) = &task.kind else {
                    continue;
                };
                task.state = TaskState::Running;
                let requests: Vec<ImportRequest> = setting
                    .src_files
                    .iter()
                    .map(|(path, item)| ImportRequest {
                        path: path.clone(),
                        batch_id: task.batch_id,
                        host_task_id: task.id(),
                        item: item.clone(),
                    })
                    .collect();
                batches.push((task.id(), requests));
            }
        }
        for (task_id, requests) in batches {
            let items: Vec<_> = requests
                .iter()
                .map(|r| (r.path.clone(), r.item.clone()))
                .collect();
            self.collaborators.notifier.import_items_ready(items).await;
            self.collaborators.importer.enqueue(requests).await;
            self.announce(task_id, TaskCategory::Import, TaskState::Running, None)
                .await;
        }
        // Nudge the executor once per pass so a stalled batch makes progress
        // even when nothing new was enqueued.
        self.collaborators.importer.unblock().await;
    }

    async fn dispatch_encoder(&mut self, category: TaskCategory) {
        let mut jobs = Vec::new();
        if let Some(queue) = self.queues.get_mut(&category) {
            for task in queue.iter_mut().filter(|t| t.state == TaskState::Init) {
                let request_id = ingestforge_core::EncoderRequestId::new();
                let job = match &mut task.kind {
                    TaskKind::Transcode(setting) => {
                        setting.encoder_request = Some(request_id);
                        EncoderJob {
                            request_id,
                            inputs: vec![setting.clip.path.clone()],
                            dest_dir: setting.dest_dir.clone(),
                            preset: setting.preset.clone(),
                        }
                    }
                    TaskKind::Concatenate(setting) => {
                        setting.encoder_request = Some(request_id);
                        EncoderJob {
                            request_id,
                            inputs: setting.clips.iter().map(|c| c.path.clone()).collect(),
                            dest_dir: setting.dest_dir.clone(),
                            preset: setting.preset.clone(),
                        }
                    }
                    _ => continue,
                };
                task.state = TaskState::Running;
                jobs.push((task.id(), job));
            }
        }

        for (task_id, job) in jobs {
            let request_id = job.request_id;
            match self.collaborators.encoder.submit(job).await {
                Ok(()) => {
                    self.encoder_tasks.insert(request_id, task_id);
                    self.announce(task_id, category, TaskState::Running, None)
                        .await;
                }
                Err(message) => {
                    warn!(task_id = %task_id, %message, "encoder rejected job");
                    self.fail_task(task_id, category, message).await;
                }
            }
        }
    }

    // -- Worker events ------------------------------------------------------

    async fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::CopyUnitFinished {
                task_id,
                unit_index,
                outcome,
            } => self.on_copy_unit_finished(task_id, unit_index, outcome).await,
            WorkerEvent::CopyProgress { task_id, fraction } => {
                self.on_copy_progress(task_id, fraction);
            }
            WorkerEvent::CopyTaskFinished { task_id, canceled } => {
                self.on_copy_task_finished(task_id, canceled).await;
            }
            WorkerEvent::MetadataTaskFinished {
                task_id,
                outcome,
                canceled,
            } => self.on_metadata_finished(task_id, outcome, canceled).await,
        }
    }

    async fn on_copy_unit_finished(
        &mut self,
        task_id: TaskId,
        unit_index: usize,
        outcome: crate::ops::UnitOutcome,
    ) {
        // Stale message from a canceled run.
        if self.find_task(TaskCategory::Copy, task_id).is_none() {
            return;
        }

        self.copy_tally.files_succeeded += outcome.succeeded.len() as u64;
        self.copy_tally.files_failed += outcome.failed.len() as u64;
        self.copy_tally.units_done += 1;
        {
            let counts = self.summary.counts_mut(TaskCategory::Copy);
            counts.total += (outcome.succeeded.len() + outcome.failed.len()) as u64;
            counts.failed += outcome.failed.len() as u64;
        }
        self.ledger.complete(1);
        // The stored in-flight fraction covered this unit too; shrink it so
        // the published progress never dips on the next mid-file report.
        self.ledger.absorb_fraction(task_id, 1.0);

        let Some(task) = self.find_task(TaskCategory::Copy, task_id) else {
            return;
        };
        let reserved = task.reserved_downstream_units(unit_index);
        let batch_id = task.batch_id;
        let custom_metadata = task.custom_metadata.clone();
        let downstream = match &task.kind {
            TaskKind::Copy(setting) => setting.copy_units.get(unit_index).map(|unit| {
                build_copy_downstream(
                    unit,
                    setting,
                    &outcome.succeeded,
                    &custom_metadata,
                    batch_id,
                )
            }),
            _ => None,
        };

        // Backup copies (destinations not destined for import) are ready
        // for the library as soon as their unit lands.
        let backups: Vec<PathBuf> = match &task.kind {
            TaskKind::Copy(setting) => setting
                .copy_units
                .get(unit_index)
                .map(|unit| {
                    outcome
                        .succeeded
                        .iter()
                        .filter(|p| !unit.import_files.contains_key(*p))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        if !backups.is_empty() {
            self.collaborators.notifier.backup_items_ready(backups).await;
        }

        match downstream.flatten() {
            Some(next) => {
                if reserved > 0 {
                    self.ledger.release_reservation();
                }
                self.ledger.add_forecast(next.unit_forecast());
                debug!(
                    upstream = %task_id,
                    downstream = %next.id(),
                    category = %next.category(),
                    "discovered downstream task"
                );
                self.enqueue(next);
                self.dispatch().await;
            }
            None => {
                // Nothing materialized; the reserved placeholder is spent.
                self.ledger.complete(reserved);
            }
        }
        self.broadcast_progress(task_id, TaskCategory::Copy);
    }

    fn on_copy_progress(&mut self, task_id: TaskId, fraction: f64) {
        let Some(task) = self.find_task(TaskCategory::Copy, task_id) else {
            return;
        };
        let own_units = match &task.kind {
            TaskKind::Copy(setting) => setting.copy_units.len() as f64,
            _ => return,
        };
        let in_flight =
            (fraction * own_units - self.copy_tally.units_done as f64).max(0.0);
        self.ledger.set_fraction(task_id, in_flight);
        self.broadcast_progress(task_id, TaskCategory::Copy);
    }

    async fn on_copy_task_finished(&mut self, task_id: TaskId, canceled: bool) {
        self.ledger.clear_fraction(task_id);
        if let Some(handle) = self.copy_worker.take() {
            let _ = handle.join.await;
        }
        if canceled {
            // The cancel path already rewrote the queues.
            return;
        }
        let Some(task) = self.remove_task(TaskCategory::Copy, task_id) else {
            return;
        };
        let state = if self.copy_tally.files_succeeded == 0 && self.copy_tally.files_failed > 0
        {
            TaskState::Failure
        } else {
            TaskState::Done
        };
        info!(task_id = %task.id(), ?state, "copy task finished");
        self.announce(task_id, TaskCategory::Copy, state, None).await;
        self.dispatch().await;
    }

    async fn on_metadata_finished(
        &mut self,
        task_id: TaskId,
        outcome: crate::ops::MetadataOutcome,
        canceled: bool,
    ) {
        if let Some(handle) = self.metadata_workers.remove(&task_id) {
            let _ = handle.join.await;
        }
        if canceled {
            return;
        }
        let Some(task) = self.remove_task(TaskCategory::UpdateMetadata, task_id) else {
            return;
        };
        {
            let counts = self.summary.counts_mut(TaskCategory::UpdateMetadata);
            counts.total += (outcome.succeeded.len() + outcome.failed.len()) as u64;
            counts.failed += outcome.failed.len() as u64;
        }
        self.ledger.complete(1);

        let failed_paths: Vec<&PathBuf> = outcome.failed.iter().map(|f| &f.path).collect();
        let importable: HashMap<PathBuf, crate::task::ImportItem> = outcome
            .import_files
            .into_iter()
            .filter(|(path, _)| !failed_paths.contains(&path))
            .collect();

        if outcome.need_create_import_task && !importable.is_empty() {
            self.ledger.release_reservation();
            let next = factory::create_import_task(
                ImportSetting::new(importable),
                task.batch_id,
                HashMap::new(),
            );
            self.ledger.add_forecast(next.unit_forecast());
            self.enqueue(next);
        } else {
            // The always-reserved downstream unit is spent.
            self.ledger.complete(1);
        }

        let state = if outcome.succeeded.is_empty() && !outcome.failed.is_empty() {
            TaskState::Failure
        } else {
            TaskState::Done
        };
        self.announce(task_id, TaskCategory::UpdateMetadata, state, None)
            .await;
        self.broadcast_progress(task_id, TaskCategory::UpdateMetadata);
        self.dispatch().await;
    }

    // -- Encoder events ------------------------------------------------------

    async fn handle_encoder_event(&mut self, event: EncoderEvent) {
        match event {
            EncoderEvent::Ready { request_id } => {
                debug!(%request_id, "encoder accepted job");
            }
            EncoderEvent::Progress {
                request_id,
                progress,
            } => {
                if let Some(&task_id) = self.encoder_tasks.get(&request_id) {
                    self.ledger
                        .set_fraction(task_id, progress.clamp(0.0, 1.0));
                    if let Some(category) = self.category_of(task_id) {
                        self.broadcast_progress(task_id, category);
                    }
                }
            }
            EncoderEvent::Complete { request_id, output } => {
                self.on_encode_complete(request_id, output).await;
            }
            EncoderEvent::Error {
                request_id,
                message,
            } => {
                if let Some(task_id) = self.encoder_tasks.remove(&request_id) {
                    if let Some(category) = self.category_of(task_id) {
                        error!(%task_id, %message, "encode failed");
                        self.fail_task(task_id, category, message).await;
                    }
                }
            }
            EncoderEvent::ServerOffline { .. } => self.on_encoder_offline().await,
        }
    }

    async fn on_encode_complete(
        &mut self,
        request_id: ingestforge_core::EncoderRequestId,
        output: PathBuf,
    ) {
        let Some(task_id) = self.encoder_tasks.remove(&request_id) else {
            return;
        };
        let Some(category) = self.category_of(task_id) else {
            return;
        };
        let Some(task) = self.remove_task(category, task_id) else {
            return;
        };

        self.ledger.clear_fraction(task_id);
        self.ledger.complete(1);
        self.summary.counts_mut(category).total += 1;

        let (needs_import, auto_delete, clip_id) = match &task.kind {
            TaskKind::Transcode(s) => (s.needs_import, s.auto_delete_after_ingest, s.clip.clip_id),
            TaskKind::Concatenate(s) => (s.needs_import, s.auto_delete_after_ingest, None),
            _ => (false, false, None),
        };
        if auto_delete {
            self.auto_delete_outputs.push(output.clone());
        }

        let reserved = needs_import || task.has_custom_metadata();
        let next = if task.has_custom_metadata() {
            let mut setting = UpdateMetadataSetting::default();
            if let Some(clip_id) = clip_id {
                setting.clip_ids.insert(output.clone(), clip_id);
            }
            if needs_import {
                setting.import_files.insert(
                    output.clone(),
                    crate::task::ImportItem {
                        name: output
                            .file_stem()
                            .map(|s| s.to_string_lossy().into_owned())
                            .unwrap_or_default(),
                        clip_id,
                    },
                );
                setting.need_create_import_task = true;
            }
            Some(factory::create_update_metadata_task(
                setting,
                task.batch_id,
                task.custom_metadata.clone(),
            ))
        } else if needs_import {
            let mut src_files = HashMap::new();
            src_files.insert(
                output.clone(),
                crate::task::ImportItem {
                    name: output
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    clip_id,
                },
            );
            Some(factory::create_import_task(
                ImportSetting::new(src_files),
                task.batch_id,
                HashMap::new(),
            ))
        } else {
            None
        };

        match next {
            Some(next) => {
                if reserved {
                    self.ledger.release_reservation();
                }
                self.ledger.add_forecast(next.unit_forecast());
                self.enqueue(next);
            }
            None => {
                if reserved {
                    self.ledger.complete(1);
                }
            }
        }

        self.announce(task_id, category, TaskState::Done, None).await;
        self.broadcast_progress(task_id, category);
        self.dispatch().await;
    }

    /// The encoder went away: every queued and in-flight encode fails.
    async fn on_encoder_offline(&mut self) {
        warn!("encoder offline, failing all pending encodes");
        self.encoder_tasks.clear();
        for category in [TaskCategory::Transcode, TaskCategory::Concatenate] {
            let ids: Vec<TaskId> = self
                .queues
                .get(&category)
                .map(|q| q.iter().map(|t| t.id()).collect())
                .unwrap_or_default();
            for task_id in ids {
                self.fail_task(task_id, category, "encoder offline".to_owned())
                    .await;
            }
        }
        self.check_done().await;
    }

    /// Marks a queued task failed: counted in the summary, its whole
    /// remaining forecast spent so the run can still reach 100%.
    async fn fail_task(&mut self, task_id: TaskId, category: TaskCategory, message: String) {
        let Some(task) = self.remove_task(category, task_id) else {
            return;
        };
        let counts = self.summary.counts_mut(category);
        counts.total += 1;
        counts.failed += 1;
        self.ledger.clear_fraction(task_id);
        self.ledger.complete(task.unit_forecast());
        self.announce(task_id, category, TaskState::Failure, Some(message))
            .await;
        self.broadcast_progress(task_id, category);
        self.check_done().await;
    }

    // -- Importer events -----------------------------------------------------

    async fn handle_importer_event(&mut self, event: ImporterEvent) {
        match event {
            ImporterEvent::XmpImported { path } => {
                debug!(path = %path.display(), "sidecar metadata imported");
            }
            ImporterEvent::ThumbnailReady { path } => {
                debug!(path = %path.display(), "thumbnail ready");
            }
            ImporterEvent::FileFinished {
                path,
                host_task_id,
                result,
                ..
            } => self.on_import_file_finished(path, host_task_id, result).await,
        }
    }

    async fn on_import_file_finished(
        &mut self,
        path: PathBuf,
        host_task_id: TaskId,
        result: Result<(), String>,
    ) {
        let Some(task) = self.find_task_mut(TaskCategory::Import, host_task_id) else {
            return;
        };
        let TaskKind::Import(setting) = &mut task.kind else {
            return;
        };
        // Stale notification from a canceled run.
        if !setting.src_files.contains_key(&path) {
            return;
        }
        let complete = setting.mark_finished(&path);

        {
            let counts = self.summary.counts_mut(TaskCategory::Import);
            counts.total += 1;
            if result.is_err() {
                counts.failed += 1;
            }
        }
        if let Err(message) = &result {
            warn!(path = %path.display(), %message, "import failed");
        } else if let Some(index) = self.auto_delete_outputs.iter().position(|p| p == &path) {
            // Transcoded temp output is in the library now.
            let temp = self.auto_delete_outputs.swap_remove(index);
            if let Err(err) = tokio::fs::remove_file(&temp).await {
                warn!(path = %temp.display(), %err, "failed to remove temp encode output");
            }
        }

        if complete {
            self.ledger.complete(1);
            let _ = self.remove_task(TaskCategory::Import, host_task_id);
            self.announce(host_task_id, TaskCategory::Import, TaskState::Done, None)
                .await;
            self.broadcast_progress(host_task_id, TaskCategory::Import);
            self.check_done().await;
        }
    }

    // -- Pause / resume / cancel --------------------------------------------

    async fn pause(&mut self) {
        if self.state != SchedulerState::Running {
            return;
        }
        self.state = SchedulerState::Paused;
        info!("run paused");
        if let Some(worker) = &self.copy_worker {
            worker.control.pause();
        }
        for worker in self.metadata_workers.values() {
            worker.control.pause();
        }
        self.collaborators.encoder.pause_host_queue().await;

        // Queued tasks pause too; remember which ones had not started so
        // Resume can hand them back to dispatch.
        let mut affected = Vec::new();
        for (category, queue) in &mut self.queues {
            for task in queue
                .iter_mut()
                .filter(|t| t.state == TaskState::Init || t.state == TaskState::Running)
            {
                if task.state == TaskState::Init {
                    self.paused_init.insert(task.id());
                }
                task.state = TaskState::Paused;
                affected.push((task.id(), *category));
            }
        }
        for (task_id, category) in affected {
            self.announce(task_id, category, TaskState::Paused, None).await;
        }
    }

    async fn resume(&mut self) {
        if self.state != SchedulerState::Paused {
            return;
        }
        self.state = SchedulerState::Running;
        info!("run resumed");
        if let Some(worker) = &self.copy_worker {
            worker.control.resume();
        }
        for worker in self.metadata_workers.values() {
            worker.control.resume();
        }
        self.collaborators.encoder.resume_host_queue().await;

        let mut affected = Vec::new();
        for (category, queue) in &mut self.queues {
            for task in queue.iter_mut().filter(|t| t.state == TaskState::Paused) {
                task.state = if self.paused_init.contains(&task.id()) {
                    TaskState::Init
                } else {
                    TaskState::Running
                };
                affected.push((task.id(), *category, task.state));
            }
        }
        self.paused_init.clear();
        for (task_id, category, state) in affected {
            self.announce(task_id, category, state, None).await;
        }
        self.dispatch().await;
    }

    /// Cancels the whole run: stops every worker, aborts queued tasks,
    /// removes temp outputs, and resets to the idle state.
    async fn cancel_run(&mut self) {
        if self.state == SchedulerState::Init {
            return;
        }
        info!("canceling run");

        if let Some(worker) = self.copy_worker.take() {
            worker.control.cancel();
            let _ = worker.join.await;
        }
        for (_, worker) in self.metadata_workers.drain() {
            worker.control.cancel();
            let _ = worker.join.await;
        }
        for (request_id, _) in self.encoder_tasks.drain() {
            self.collaborators.encoder.cancel_job(request_id).await;
        }
        self.collaborators.importer.unblock().await;

        let mut aborted = Vec::new();
        for (category, queue) in &mut self.queues {
            for task in queue.drain(..) {
                aborted.push((task.id(), *category));
            }
        }
        for (task_id, category) in aborted {
            self.announce(task_id, category, TaskState::Aborted, None)
                .await;
        }

        for temp in self.auto_delete_outputs.drain(..) {
            if let Err(err) = tokio::fs::remove_file(&temp).await {
                debug!(path = %temp.display(), %err, "temp output already gone");
            }
        }

        for (batch_id, _) in std::mem::take(&mut self.open_batches) {
            self.collaborators
                .notifier
                .batch_finished(batch_id, true)
                .await;
            self.events.broadcast(IngestEvent::BatchFinished {
                batch_id,
                canceled: true,
            });
        }
        self.events.broadcast(IngestEvent::RunCanceled);

        self.ledger.reset();
        self.summary = CompletionSummary::default();
        self.runner_setting = CopyRunnerSetting::default();
        self.paused_init.clear();
        self.state = SchedulerState::Init;

        if let Some(ack) = self.pending_shutdown.take() {
            let _ = ack.send(());
        }
    }

    /// Finishes the run once every queue drained and no worker is left.
    async fn check_done(&mut self) {
        if self.state != SchedulerState::Running {
            return;
        }
        let drained = self.queues.values().all(|q| q.is_empty())
            && self.copy_worker.is_none()
            && self.metadata_workers.is_empty()
            && self.encoder_tasks.is_empty();
        if !drained {
            return;
        }

        let summary = std::mem::take(&mut self.summary);
        info!(%summary, "run finished");
        for (batch_id, _) in std::mem::take(&mut self.open_batches) {
            self.collaborators
                .notifier
                .batch_finished(batch_id, false)
                .await;
            self.events.broadcast(IngestEvent::BatchFinished {
                batch_id,
                canceled: false,
            });
        }
        self.events.broadcast(IngestEvent::RunFinished { summary });

        self.ledger.reset();
        self.runner_setting = CopyRunnerSetting::default();
        self.auto_delete_outputs.clear();
        self.state = SchedulerState::Init;

        if let Some(ack) = self.pending_shutdown.take() {
            let _ = ack.send(());
        }
    }

    // -- Copy pre-check ------------------------------------------------------

    /// Resolves every destination conflict before the copy worker starts.
    /// Returns `None` when the user cancels the run from a prompt.
    async fn precheck_copy(&mut self, mut setting: CopySetting) -> Option<CopySetting> {
        for unit in &mut setting.copy_units {
            let mut renames: HashMap<PathBuf, PathBuf> = HashMap::new();
            for entry in &mut unit.entries {
                if !entry.dest.exists() {
                    entry.copy_action = CopyAction::Copied;
                    continue;
                }
                let action = match entry.exist_option {
                    ExistOption::Replace => CopyAction::Replaced,
                    ExistOption::Skip => CopyAction::Ignored,
                    ExistOption::Rename => CopyAction::Renamed,
                    ExistOption::Ask => match self.runner_setting.apply_to_all {
                        Some(action) => action,
                        None => {
                            let decision = self
                                .collaborators
                                .resolver
                                .resolve(ExistConflict {
                                    src: entry.src.clone(),
                                    dest: entry.dest.clone(),
                                    is_dir: entry.src.is_dir(),
                                })
                                .await;
                            match decision {
                                ConflictDecision::CancelRun => return None,
                                ConflictDecision::Resolved {
                                    action,
                                    apply_to_all,
                                } => {
                                    if apply_to_all {
                                        self.runner_setting.apply_to_all = Some(action);
                                    }
                                    action
                                }
                            }
                        }
                    },
                };
                entry.copy_action = action;
                if action == CopyAction::Renamed {
                    let unique = unique_destination(&entry.dest);
                    renames.insert(entry.dest.clone(), unique.clone());
                    entry.dest = unique;
                }
            }
            // Downstream maps are keyed by destination path; renamed
            // entries drag their map entries along.
            for (old, new) in &renames {
                if let Some(item) = unit.import_files.remove(old) {
                    unit.import_files.insert(new.clone(), item);
                }
                if let Some(alias) = unit.alias_names.remove(old) {
                    unit.alias_names.insert(new.clone(), alias);
                }
                if let Some(clip) = unit.clip_ids.remove(old) {
                    unit.clip_ids.insert(new.clone(), clip);
                }
            }
        }
        Some(setting)
    }

    // -- Helpers -------------------------------------------------------------

    fn is_path_in_copy_list(&self, path: &Path) -> bool {
        self.queues
            .get(&TaskCategory::Copy)
            .map(|queue| {
                queue.iter().any(|task| match &task.kind {
                    TaskKind::Copy(setting) => setting
                        .copy_units
                        .iter()
                        .flat_map(|u| u.entries.iter())
                        .any(|e| e.dest == path),
                    _ => false,
                })
            })
            .unwrap_or(false)
    }

    fn find_task(&self, category: TaskCategory, task_id: TaskId) -> Option<&Task> {
        self.queues
            .get(&category)?
            .iter()
            .find(|t| t.id() == task_id)
    }

    fn find_task_mut(&mut self, category: TaskCategory, task_id: TaskId) -> Option<&mut Task> {
        self.queues
            .get_mut(&category)?
            .iter_mut()
            .find(|t| t.id() == task_id)
    }

    fn remove_task(&mut self, category: TaskCategory, task_id: TaskId) -> Option<Task> {
        let queue = self.queues.get_mut(&category)?;
        let index = queue.iter().position(|t| t.id() == task_id)?;
        queue.remove(index)
    }

    fn category_of(&self, task_id: TaskId) -> Option<TaskCategory> {
        self.queues
            .iter()
            .find(|(_, q)| q.iter().any(|t| t.id() == task_id))
            .map(|(c, _)| *c)
    }

    async fn announce(
        &mut self,
        task_id: TaskId,
        category: TaskCategory,
        state: TaskState,
        message: Option<String>,
    ) {
        self.collaborators
            .notifier
            .task_state(task_id, category, state)
            .await;
        self.events.broadcast(IngestEvent::TaskStatus {
            task_id,
            category,
            state,
            message,
        });
    }

    fn broadcast_progress(&self, task_id: TaskId, category: TaskCategory) {
        self.events.broadcast(IngestEvent::TaskProgress {
            task_id,
            category,
            progress: self.ledger.overall(),
        });
    }
}

/// Builds the downstream task (UpdateMetadata or Import) for one finished
/// copy unit, scoped to the files that actually landed.
fn build_copy_downstream(
    unit: &CopyUnit,
    setting: &CopySetting,
    succeeded: &[PathBuf],
    custom_metadata: &HashMap<String, String>,
    batch_id: BatchId,
) -> Option<Task> {
    let landed = |path: &PathBuf| succeeded.contains(path);

    let import_files: HashMap<_, _> = unit
        .import_files
        .iter()
        .filter(|(p, _)| landed(p))
        .map(|(p, i)| (p.clone(), i.clone()))
        .collect();

    let metadata_pending = unit.metadata_pending() || !custom_metadata.is_empty();
    if metadata_pending {
        let alias_names: HashMap<_, _> = unit
            .alias_names
            .iter()
            .filter(|(p, _)| landed(p))
            .map(|(p, a)| (p.clone(), a.clone()))
            .collect();
        let clip_ids: HashMap<_, _> = unit
            .clip_ids
            .iter()
            .filter(|(p, _)| landed(p))
            .map(|(p, c)| (p.clone(), *c))
            .collect();
        if alias_names.is_empty()
            && clip_ids.is_empty()
            && (custom_metadata.is_empty() || import_files.is_empty())
        {
            // Every file that needed metadata failed to copy.
            if setting.need_create_import_task && !import_files.is_empty() {
                return Some(factory::create_import_task(
                    ImportSetting::new(import_files),
                    batch_id,
                    HashMap::new(),
                ));
            }
            return None;
        }
        let need_file_rename = !alias_names.is_empty();
        return Some(factory::create_update_metadata_task(
            UpdateMetadataSetting {
                alias_names,
                clip_ids,
                need_file_rename,
                import_files,
                need_create_import_task: setting.need_create_import_task,
            },
            batch_id,
            custom_metadata.clone(),
        ));
    }

    if setting.need_create_import_task && !import_files.is_empty() {
        return Some(factory::create_import_task(
            ImportSetting::new(import_files),
            batch_id,
            HashMap::new(),
        ));
    }
    None
}

/// First free `name_1.ext`, `name_2.ext`, ... next to `dest`.
fn unique_destination(dest: &Path) -> PathBuf {
    let stem = dest
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = dest.extension().map(|e| e.to_string_lossy().into_owned());
    for n in 1u32.. {
        let name = match &ext {
            Some(ext) => format!("{stem}_{n}.{ext}"),
            None => format!("{stem}_{n}"),
        };
        let candidate = dest.with_file_name(name);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!()
}
