//! Metadata update worker.
//!
//! Renames files to their alias names first, then patches embedded
//! metadata through the [`MetadataCodec`] seam. Rename failures abort the
//! task, since every later step addresses files by their renamed paths;
//! per-file codec failures do not.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use ingestforge_core::{Error, TaskId};

use crate::ops::{FileFailure, MetadataOutcome, OpControl, WorkerEvent};
use crate::services::MetadataCodec;
use crate::task::UpdateMetadataSetting;

/// Metadata field names written into supported files.
const FIELD_ALIAS: &str = "alias";
const FIELD_CLIP_ID: &str = "clip_id";

pub struct MetadataWorker {
    task_id: TaskId,
    setting: UpdateMetadataSetting,
    custom_metadata: HashMap<String, String>,
    control: Arc<OpControl>,
    codec: Arc<dyn MetadataCodec>,
    events: UnboundedSender<WorkerEvent>,
}

impl MetadataWorker {
    pub fn new(
        task_id: TaskId,
        setting: UpdateMetadataSetting,
        custom_metadata: HashMap<String, String>,
        control: Arc<OpControl>,
        codec: Arc<dyn MetadataCodec>,
        events: UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            task_id,
            setting,
            custom_metadata,
            control,
            codec,
            events,
        }
    }

    pub async fn run(mut self) {
        let mut outcome = MetadataOutcome {
            need_create_import_task: self.setting.need_create_import_task,
            ..MetadataOutcome::default()
        };

        if self.setting.need_file_rename {
            if let Err((path, err)) = self.rename_pass().await {
                warn!(path = %path.display(), %err, "file rename failed, aborting metadata task");
                outcome.failed.push(FileFailure {
                    path,
                    message: err.to_string(),
                });
                outcome.import_files = self.setting.import_files.clone();
                self.finish(outcome, false);
                return;
            }
        }

        // Deterministic order keeps logs and test expectations stable.
        let mut files: BTreeSet<PathBuf> = BTreeSet::new();
        files.extend(self.setting.alias_names.keys().cloned());
        files.extend(self.setting.clip_ids.keys().cloned());
        if !self.custom_metadata.is_empty() {
            files.extend(self.setting.import_files.keys().cloned());
        }

        for path in files {
            if !self.control.can_continue().await {
                outcome.import_files = self.setting.import_files.clone();
                self.finish(outcome, true);
                return;
            }
            match self.patch_file(&path).await {
                Ok(true) => outcome.succeeded.push(path),
                Ok(false) => {}
                Err(err) => {
                    warn!(path = %path.display(), %err, "metadata update failed");
                    outcome.failed.push(FileFailure {
                        path,
                        message: err.to_string(),
                    });
                }
            }
        }

        outcome.import_files = self.setting.import_files.clone();
        self.finish(outcome, false);
    }

    fn finish(&self, outcome: MetadataOutcome, canceled: bool) {
        let _ = self.events.send(WorkerEvent::MetadataTaskFinished {
            task_id: self.task_id,
            outcome,
            canceled,
        });
    }

    /// Renames every aliased file and remaps the setting's path-keyed maps
    /// to the new locations. Returns the offending path on failure.
    async fn rename_pass(&mut self) -> Result<(), (PathBuf, Error)> {
        let mut renames: HashMap<PathBuf, PathBuf> = HashMap::new();
        for (path, alias) in &self.setting.alias_names {
            let target = renamed_path(path, alias);
            if target == *path {
                continue;
            }
            tokio::fs::rename(path, &target)
                .await
                .map_err(|err| (path.clone(), classify_rename_error(path, err)))?;
            renames.insert(path.clone(), target);
        }

        if renames.is_empty() {
            return Ok(());
        }
        remap_keys(&mut self.setting.alias_names, &renames);
        remap_keys(&mut self.setting.clip_ids, &renames);
        remap_keys(&mut self.setting.import_files, &renames);
        Ok(())
    }

    /// Returns `Ok(true)` when metadata was written, `Ok(false)` when the
    /// file was skipped without counting either way.
    async fn patch_file(&self, path: &Path) -> ingestforge_core::Result<bool> {
        if !self.codec.supports(path) {
            if self.setting.import_files.contains_key(path) {
                // The file still goes through import; embedded metadata is
                // simply not available for this format.
                debug!(path = %path.display(), "metadata format unsupported, skipped");
                return Ok(false);
            }
            return Err(Error::access(path, "metadata format not supported"));
        }

        let mut fields = self.codec.read(path).await?;
        if let Some(alias) = self.setting.alias_names.get(path) {
            fields.insert(FIELD_ALIAS.to_owned(), alias.clone());
        }
        for (key, value) in &self.custom_metadata {
            fields.insert(key.clone(), value.clone());
        }
        if let Some(clip_id) = self.setting.clip_ids.get(path) {
            fields.insert(FIELD_CLIP_ID.to_owned(), clip_id.to_string());
        }
        self.codec.write(path, &fields).await?;
        Ok(true)
    }
}

fn renamed_path(path: &Path, alias: &str) -> PathBuf {
    let file_name = match path.extension() {
        Some(ext) => format!("{alias}.{}", ext.to_string_lossy()),
        None => alias.to_owned(),
    };
    path.with_file_name(file_name)
}

fn classify_rename_error(path: &Path, err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::PermissionDenied {
        Error::access(path, "file is read-only or in use")
    } else {
        Error::from(err)
    }
}

fn remap_keys<V>(map: &mut HashMap<PathBuf, V>, renames: &HashMap<PathBuf, PathBuf>) {
    let keys: Vec<PathBuf> = map
        .keys()
        .filter(|k| renames.contains_key(*k))
        .cloned()
        .collect();
    for old in keys {
        if let Some(value) = map.remove(&old) {
            map.insert(renames[&old].clone(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use crate::task::ImportItem;

    /// Codec that records writes in memory and supports only `.mov` files.
    #[derive(Default)]
    struct RecordingCodec {
        writes: Mutex<Vec<(PathBuf, HashMap<String, String>)>>,
    }

    #[async_trait]
    impl MetadataCodec for RecordingCodec {
        fn supports(&self, path: &Path) -> bool {
            path.extension().is_some_and(|ext| ext == "mov")
        }

        async fn read(&self, _path: &Path) -> ingestforge_core::Result<HashMap<String, String>> {
            Ok(HashMap::new())
        }

        async fn write(
            &self,
            path: &Path,
            fields: &HashMap<String, String>,
        ) -> ingestforge_core::Result<()> {
            self.writes.lock().push((path.to_owned(), fields.clone()));
            Ok(())
        }
    }

    fn run_worker(
        setting: UpdateMetadataSetting,
        custom: HashMap<String, String>,
        codec: Arc<RecordingCodec>,
    ) -> (MetadataWorker, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = MetadataWorker::new(
            TaskId::new(),
            setting,
            custom,
            Arc::new(OpControl::new(Duration::from_millis(5))),
            codec,
            tx,
        );
        (worker, rx)
    }

    fn outcome_of(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> MetadataOutcome {
        match rx.try_recv().unwrap() {
            WorkerEvent::MetadataTaskFinished { outcome, .. } => outcome,
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn renames_then_patches_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("A001C002.mov");
        tokio::fs::write(&original, b"clip").await.unwrap();
        let renamed = dir.path().join("interview_take1.mov");

        let mut setting = UpdateMetadataSetting::default();
        setting.need_file_rename = true;
        setting
            .alias_names
            .insert(original.clone(), "interview_take1".to_owned());
        setting.import_files.insert(
            original.clone(),
            ImportItem {
                name: "interview_take1".to_owned(),
                clip_id: None,
            },
        );

        let codec = Arc::new(RecordingCodec::default());
        let (worker, mut rx) = run_worker(setting, HashMap::new(), codec.clone());
        worker.run().await;

        assert!(renamed.exists());
        assert!(!original.exists());

        let outcome = outcome_of(&mut rx);
        assert_eq!(outcome.succeeded, vec![renamed.clone()]);
        assert!(outcome.failed.is_empty());
        // Import map follows the rename.
        assert!(outcome.import_files.contains_key(&renamed));

        let writes = codec.writes.lock();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, renamed);
        assert_eq!(writes[0].1.get(FIELD_ALIAS).map(String::as_str), Some("interview_take1"));
    }

    #[tokio::test]
    async fn rename_failure_aborts_the_task() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone.mov");

        let mut setting = UpdateMetadataSetting::default();
        setting.need_file_rename = true;
        setting
            .alias_names
            .insert(missing.clone(), "renamed".to_owned());

        let codec = Arc::new(RecordingCodec::default());
        let (worker, mut rx) = run_worker(setting, HashMap::new(), codec.clone());
        worker.run().await;

        let outcome = outcome_of(&mut rx);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].path, missing);
        assert!(outcome.succeeded.is_empty());
        assert!(codec.writes.lock().is_empty());
    }

    #[tokio::test]
    async fn unsupported_format_fails_unless_imported_anyway() {
        let dir = tempfile::tempdir().unwrap();
        let imported = dir.path().join("a.wav");
        let orphan = dir.path().join("b.wav");
        tokio::fs::write(&imported, b"x").await.unwrap();
        tokio::fs::write(&orphan, b"x").await.unwrap();

        let mut setting = UpdateMetadataSetting::default();
        setting
            .clip_ids
            .insert(imported.clone(), ingestforge_core::ClipId::new());
        setting
            .clip_ids
            .insert(orphan.clone(), ingestforge_core::ClipId::new());
        setting.import_files.insert(
            imported.clone(),
            ImportItem {
                name: "a".to_owned(),
                clip_id: None,
            },
        );

        let codec = Arc::new(RecordingCodec::default());
        let (worker, mut rx) = run_worker(setting, HashMap::new(), codec);
        worker.run().await;

        let outcome = outcome_of(&mut rx);
        // The imported file is silently skipped; the orphan is a failure
        // because skipping metadata would make the task a no-op for it.
        assert!(outcome.succeeded.is_empty());
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].path, orphan);
    }

    #[tokio::test]
    async fn custom_metadata_reaches_every_import_file() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("c.mov");
        tokio::fs::write(&clip, b"x").await.unwrap();

        let mut setting = UpdateMetadataSetting::default();
        setting.import_files.insert(
            clip.clone(),
            ImportItem {
                name: "c".to_owned(),
                clip_id: None,
            },
        );

        let mut custom = HashMap::new();
        custom.insert("scene".to_owned(), "12".to_owned());

        let codec = Arc::new(RecordingCodec::default());
        let (worker, mut rx) = run_worker(setting, custom, codec.clone());
        worker.run().await;

        let outcome = outcome_of(&mut rx);
        assert_eq!(outcome.succeeded, vec![clip.clone()]);
        let writes = codec.writes.lock();
        assert_eq!(writes[0].1.get("scene").map(String::as_str), Some("12"));
    }
}
