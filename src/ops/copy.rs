//! File copy worker.
//!
//! Executes one copy task: every entry of every unit, with size-tiered
//! transfer strategies, optional post-copy verification, and a per-unit
//! barrier message so the scheduler can discover downstream work while the
//! worker moves on to the next unit.

use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use ingestforge_core::{Error, TaskId, VerifyMismatch};

use crate::config::CopyConfig;
use crate::ops::{FileFailure, OpControl, UnitOutcome, WorkerEvent};
use crate::services::LibraryNotifier;
use crate::task::{CopyAction, CopyEntry, CopySetting, VerifyOption};

pub struct CopyWorker {
    task_id: TaskId,
    setting: CopySetting,
    config: CopyConfig,
    control: Arc<OpControl>,
    notifier: Arc<dyn LibraryNotifier>,
    events: UnboundedSender<WorkerEvent>,
}

/// Task-level progress with whole-percent throttling.
struct ProgressReporter {
    task_id: TaskId,
    entries_total: usize,
    entries_done: usize,
    last_percent: u32,
    events: UnboundedSender<WorkerEvent>,
}

impl ProgressReporter {
    fn new(task_id: TaskId, entries_total: usize, events: UnboundedSender<WorkerEvent>) -> Self {
        Self {
            task_id,
            entries_total,
            entries_done: 0,
            last_percent: 0,
            events,
        }
    }

    fn entry_done(&mut self) {
        self.entries_done += 1;
        self.report(0.0);
    }

    /// `within_entry` is the fraction of the current entry already
    /// transferred.
    fn report(&mut self, within_entry: f64) {
        if self.entries_total == 0 {
            return;
        }
        let fraction =
            (self.entries_done as f64 + within_entry) / self.entries_total as f64;
        let percent = (fraction * 100.0) as u32;
        if percent != self.last_percent {
            self.last_percent = percent;
            let _ = self.events.send(WorkerEvent::CopyProgress {
                task_id: self.task_id,
                fraction: fraction.min(1.0),
            });
        }
    }
}

impl CopyWorker {
    pub fn new(
        task_id: TaskId,
        setting: CopySetting,
        config: CopyConfig,
        control: Arc<OpControl>,
        notifier: Arc<dyn LibraryNotifier>,
        events: UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            task_id,
            setting,
            config,
            control,
            notifier,
            events,
        }
    }

    pub async fn run(self) {
        let entries_total: usize = self
            .setting
            .copy_units
            .iter()
            .map(|u| u.entries.len())
            .sum();
        let mut progress =
            ProgressReporter::new(self.task_id, entries_total, self.events.clone());

        for (unit_index, unit) in self.setting.copy_units.iter().enumerate() {
            if !self.control.can_continue().await {
                self.finish(true);
                return;
            }

            let mut outcome = UnitOutcome::default();
            for entry in &unit.entries {
                if !self.control.can_continue().await {
                    // The unit is abandoned mid-way; nothing downstream of
                    // it will be scheduled.
                    self.finish(true);
                    return;
                }
                match self.copy_entry(entry, &mut progress).await {
                    Ok(()) => outcome.succeeded.push(entry.dest.clone()),
                    Err(err) => {
                        warn!(
                            src = %entry.src.display(),
                            dest = %entry.dest.display(),
                            %err,
                            "copy entry failed"
                        );
                        outcome.failed.push(FileFailure {
                            path: entry.dest.clone(),
                            message: err.to_string(),
                        });
                    }
                }
                progress.entry_done();
            }

            let _ = self.events.send(WorkerEvent::CopyUnitFinished {
                task_id: self.task_id,
                unit_index,
                outcome,
            });
        }

        self.finish(false);
    }

    fn finish(&self, canceled: bool) {
        let _ = self.events.send(WorkerEvent::CopyTaskFinished {
            task_id: self.task_id,
            canceled,
        });
    }

    async fn copy_entry(
        &self,
        entry: &CopyEntry,
        progress: &mut ProgressReporter,
    ) -> ingestforge_core::Result<()> {
        match entry.copy_action {
            CopyAction::Ignored | CopyAction::NoFurtherAction => return Ok(()),
            _ => {}
        }

        if entry.optional_src && !entry.src.exists() {
            debug!(src = %entry.src.display(), "optional source missing, skipped");
            return Ok(());
        }

        if self.notifier.is_path_open(&entry.dest) {
            return Err(Error::access(&entry.dest, "destination file is in use"));
        }

        let replacing = entry.copy_action == CopyAction::Replaced;

        if entry.src.is_dir() {
            copy_dir(&entry.src, &entry.dest).await?;
        } else {
            if let Some(parent) = entry.dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let size = tokio::fs::metadata(&entry.src).await?.len();
            if size <= self.config.small_file_threshold {
                tokio::fs::copy(&entry.src, &entry.dest).await?;
            } else {
                let chunk = if size > self.config.huge_file_threshold {
                    self.config.huge_chunk_size
                } else {
                    self.config.chunk_size
                };
                copy_chunked(&entry.src, &entry.dest, size, chunk, progress).await?;
            }
            self.verify(entry).await?;
        }

        if replacing {
            self.notifier.invalidate_metadata_cache(&entry.dest);
        }
        Ok(())
    }

    async fn verify(&self, entry: &CopyEntry) -> ingestforge_core::Result<()> {
        let result = match self.setting.verify {
            VerifyOption::None => return Ok(()),
            VerifyOption::Size => verify_size(&entry.src, &entry.dest).await,
            VerifyOption::Content => verify_content(&entry.src, &entry.dest).await,
            VerifyOption::Hash => verify_hash(&entry.src, &entry.dest).await,
        };
        if let Err(err) = result {
            // Never leave a copy behind that failed verification.
            if let Err(rm_err) = tokio::fs::remove_file(&entry.dest).await {
                warn!(dest = %entry.dest.display(), %rm_err, "failed to remove unverified copy");
            }
            return Err(err);
        }
        Ok(())
    }
}

async fn copy_chunked(
    src: &Path,
    dest: &Path,
    size: u64,
    chunk_size: usize,
    progress: &mut ProgressReporter,
) -> ingestforge_core::Result<()> {
    let mut reader = tokio::fs::File::open(src).await?;
    let mut writer = tokio::fs::File::create(dest).await?;
    let mut buf = vec![0u8; chunk_size];
    let mut copied: u64 = 0;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        copied += n as u64;
        progress.report(copied as f64 / size as f64);
    }
    writer.flush().await?;
    Ok(())
}

/// Recursive directory copy without per-chunk progress; directory entries
/// are rare and small (sidecar folders).
fn copy_dir<'a>(
    src: &'a Path,
    dest: &'a Path,
) -> std::pin::Pin<
    Box<dyn std::future::Future<Output = ingestforge_core::Result<()>> + Send + 'a>,
> {
    Box::pin(async move {
        tokio::fs::create_dir_all(dest).await?;
        let mut entries = tokio::fs::read_dir(src).await?;
        while let Some(item) = entries.next_entry().await? {
            let target = dest.join(item.file_name());
            if item.file_type().await?.is_dir() {
                copy_dir(&item.path(), &target).await?;
            } else {
                tokio::fs::copy(item.path(), &target).await?;
            }
        }
        Ok(())
    })
}

async fn verify_size(src: &Path, dest: &Path) -> ingestforge_core::Result<()> {
    let expected = tokio::fs::metadata(src).await?.len();
    let actual = tokio::fs::metadata(dest).await?.len();
    if expected != actual {
        return Err(Error::verify(VerifyMismatch::Size, dest));
    }
    Ok(())
}

async fn verify_content(src: &Path, dest: &Path) -> ingestforge_core::Result<()> {
    verify_size(src, dest).await?;
    let mut a = tokio::fs::File::open(src).await?;
    let mut b = tokio::fs::File::open(dest).await?;
    let mut buf_a = vec![0u8; 64 * 1024];
    let mut buf_b = vec![0u8; 64 * 1024];
    loop {
        let n = a.read(&mut buf_a).await?;
        if n == 0 {
            return Ok(());
        }
        b.read_exact(&mut buf_b[..n])
            .await
            .map_err(|_| Error::verify(VerifyMismatch::Content, dest))?;
        if buf_a[..n] != buf_b[..n] {
            return Err(Error::verify(VerifyMismatch::Content, dest));
        }
    }
}

async fn verify_hash(src: &Path, dest: &Path) -> ingestforge_core::Result<()> {
    if file_digest(src).await? != file_digest(dest).await? {
        return Err(Error::verify(VerifyMismatch::Hash, dest));
    }
    Ok(())
}

async fn file_digest(path: &Path) -> ingestforge_core::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_vec())
}
