//! Task construction.
//!
//! Pure construction and task-shaping logic: deduplicating copy entries
//! within a unit, fanning a multi-clip transcode request out into
//! independent tasks. Constructors never fail; malformed entries are
//! dropped with a warning instead.

use std::collections::HashMap;

use tracing::warn;

use ingestforge_core::BatchId;

use super::{
    ClipSource, ConcatenateSetting, CopySetting, CopyUnit, ImportSetting, SequenceHandle, Task,
    TaskKind, TranscodeSetting, UpdateMetadataSetting,
};

/// A multi-clip transcode request before fan-out.
#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    pub clips: Vec<ClipSource>,
    pub dest_dir: std::path::PathBuf,
    pub preset: String,
    pub needs_import: bool,
    pub auto_delete_after_ingest: bool,
}

/// Build a Copy task, deduplicating entries that share a destination within
/// the same unit.
///
/// Merged entries keep the more conservative exist option, and stay optional
/// only if every merged entry was optional. Entries with an empty
/// destination are dropped.
pub fn create_copy_task(
    mut setting: CopySetting,
    batch_id: BatchId,
    custom_metadata: HashMap<String, String>,
) -> Task {
    for unit in &mut setting.copy_units {
        dedup_unit(unit);
    }
    Task::new(TaskKind::Copy(setting), batch_id, custom_metadata)
}

fn dedup_unit(unit: &mut CopyUnit) {
    let mut deduped: Vec<super::CopyEntry> = Vec::with_capacity(unit.entries.len());

    for entry in unit.entries.drain(..) {
        if entry.dest.as_os_str().is_empty() {
            warn!(src = %entry.src.display(), "Dropping copy entry with empty destination");
            continue;
        }

        match deduped.iter_mut().find(|e| e.dest == entry.dest) {
            Some(existing) => {
                existing.exist_option = existing.exist_option.max(entry.exist_option);
                existing.optional_src = existing.optional_src && entry.optional_src;
            }
            None => deduped.push(entry),
        }
    }

    unit.entries = deduped;
}

/// Fan a multi-clip transcode request out into one independent task per clip.
pub fn create_transcode_tasks(
    request: TranscodeRequest,
    batch_id: BatchId,
    custom_metadata: HashMap<String, String>,
) -> Vec<Task> {
    request
        .clips
        .into_iter()
        .map(|clip| {
            Task::new(
                TaskKind::Transcode(TranscodeSetting {
                    clip,
                    dest_dir: request.dest_dir.clone(),
                    preset: request.preset.clone(),
                    needs_import: request.needs_import,
                    auto_delete_after_ingest: request.auto_delete_after_ingest,
                    encoder_request: None,
                }),
                batch_id,
                custom_metadata.clone(),
            )
        })
        .collect()
}

/// Build a Concatenate task with a fresh transient sequence handle.
pub fn create_concatenate_task(
    request: TranscodeRequest,
    batch_id: BatchId,
    custom_metadata: HashMap<String, String>,
) -> Task {
    Task::new(
        TaskKind::Concatenate(ConcatenateSetting {
            clips: request.clips,
            dest_dir: request.dest_dir,
            preset: request.preset,
            needs_import: request.needs_import,
            auto_delete_after_ingest: request.auto_delete_after_ingest,
            encoder_request: None,
            sequence: SequenceHandle::new(),
        }),
        batch_id,
        custom_metadata,
    )
}

/// Build an Import task.
pub fn create_import_task(
    setting: ImportSetting,
    batch_id: BatchId,
    custom_metadata: HashMap<String, String>,
) -> Task {
    Task::new(TaskKind::Import(setting), batch_id, custom_metadata)
}

/// Build an UpdateMetadata task.
pub fn create_update_metadata_task(
    setting: UpdateMetadataSetting,
    batch_id: BatchId,
    custom_metadata: HashMap<String, String>,
) -> Task {
    Task::new(TaskKind::UpdateMetadata(setting), batch_id, custom_metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{CopyEntry, ExistOption};
    use std::path::PathBuf;

    #[test]
    fn dedup_keeps_conservative_exist_option() {
        let unit = CopyUnit {
            entries: vec![
                CopyEntry::new("/card/a.mov", "/lib/a.mov")
                    .with_exist_option(ExistOption::Replace),
                CopyEntry::new("/card/a.mov", "/lib/a.mov").with_exist_option(ExistOption::Ask),
            ],
            ..Default::default()
        };
        let task = create_copy_task(
            CopySetting {
                copy_units: vec![unit],
                ..Default::default()
            },
            BatchId::new(),
            HashMap::new(),
        );

        let TaskKind::Copy(setting) = &task.kind else {
            panic!("expected copy task");
        };
        assert_eq!(setting.copy_units[0].entries.len(), 1);
        assert_eq!(setting.copy_units[0].entries[0].exist_option, ExistOption::Ask);
    }

    #[test]
    fn dedup_is_scoped_to_one_unit() {
        let entry = CopyEntry::new("/card/a.mov", "/lib/a.mov");
        let task = create_copy_task(
            CopySetting {
                copy_units: vec![
                    CopyUnit {
                        entries: vec![entry.clone()],
                        ..Default::default()
                    },
                    CopyUnit {
                        entries: vec![entry],
                        ..Default::default()
                    },
                ],
                ..Default::default()
            },
            BatchId::new(),
            HashMap::new(),
        );

        let TaskKind::Copy(setting) = &task.kind else {
            panic!("expected copy task");
        };
        assert_eq!(setting.copy_units[0].entries.len(), 1);
        assert_eq!(setting.copy_units[1].entries.len(), 1);
    }

    #[test]
    fn dedup_merged_entry_optional_only_when_all_optional() {
        let unit = CopyUnit {
            entries: vec![
                CopyEntry::new("/card/a.mov", "/lib/a.mov").optional(),
                CopyEntry::new("/card/a2.mov", "/lib/a.mov"),
            ],
            ..Default::default()
        };
        let task = create_copy_task(
            CopySetting {
                copy_units: vec![unit],
                ..Default::default()
            },
            BatchId::new(),
            HashMap::new(),
        );

        let TaskKind::Copy(setting) = &task.kind else {
            panic!("expected copy task");
        };
        assert!(!setting.copy_units[0].entries[0].optional_src);
    }

    #[test]
    fn empty_destinations_are_dropped() {
        let unit = CopyUnit {
            entries: vec![
                CopyEntry::new("/card/a.mov", ""),
                CopyEntry::new("/card/b.mov", "/lib/b.mov"),
            ],
            ..Default::default()
        };
        let task = create_copy_task(
            CopySetting {
                copy_units: vec![unit],
                ..Default::default()
            },
            BatchId::new(),
            HashMap::new(),
        );

        let TaskKind::Copy(setting) = &task.kind else {
            panic!("expected copy task");
        };
        assert_eq!(setting.copy_units[0].entries.len(), 1);
        assert_eq!(setting.copy_units[0].entries[0].dest, PathBuf::from("/lib/b.mov"));
    }

    #[test]
    fn transcode_request_fans_out_per_clip() {
        let request = TranscodeRequest {
            clips: vec![
                ClipSource {
                    path: PathBuf::from("/card/a.mov"),
                    clip_id: None,
                },
                ClipSource {
                    path: PathBuf::from("/card/b.mov"),
                    clip_id: None,
                },
                ClipSource {
                    path: PathBuf::from("/card/c.mov"),
                    clip_id: None,
                },
            ],
            dest_dir: PathBuf::from("/lib/proxies"),
            preset: "proxy-1080".into(),
            needs_import: true,
            auto_delete_after_ingest: false,
        };

        let tasks = create_transcode_tasks(request, BatchId::new(), HashMap::new());
        assert_eq!(tasks.len(), 3);
        for task in &tasks {
            let TaskKind::Transcode(setting) = &task.kind else {
                panic!("expected transcode task");
            };
            assert!(setting.needs_import);
            assert_eq!(setting.preset, "proxy-1080");
        }
    }

    #[test]
    fn concatenate_gets_fresh_sequence_handle() {
        let request = TranscodeRequest {
            clips: vec![ClipSource {
                path: PathBuf::from("/card/a.mov"),
                clip_id: None,
            }],
            dest_dir: PathBuf::from("/lib"),
            preset: "master".into(),
            needs_import: false,
            auto_delete_after_ingest: true,
        };

        let a = create_concatenate_task(request.clone(), BatchId::new(), HashMap::new());
        let b = create_concatenate_task(request, BatchId::new(), HashMap::new());

        let (TaskKind::Concatenate(sa), TaskKind::Concatenate(sb)) = (&a.kind, &b.kind) else {
            panic!("expected concatenate tasks");
        };
        assert_ne!(sa.sequence.id, sb.sequence.id);
    }
}
