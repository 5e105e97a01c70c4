//! Task model: immutable-identity, mutable-state value objects for every
//! unit of ingest work.
//!
//! A [`Task`] couples a [`TaskId`] with a closed [`TaskKind`] enum; the
//! scheduler keeps one FIFO queue per kind and owns every task it holds
//! exclusively. [`Task::unit_forecast`] publishes an upper-bound progress
//! reservation that includes downstream work the task may trigger later;
//! the scheduler's ledger relies on that forecast staying fixed for the
//! task's lifetime.

pub mod factory;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ingestforge_core::{BatchId, ClipId, EncoderRequestId, TaskCategory, TaskId, TaskState};

// ---------------------------------------------------------------------------
// Copy vocabulary
// ---------------------------------------------------------------------------

/// What to do when the destination already exists.
///
/// Ordered from most permissive to most conservative; when duplicate entries
/// are merged the higher (more conservative) option wins.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum ExistOption {
    /// Overwrite the destination.
    Replace,
    /// Copy under a generated new name, keeping both.
    Rename,
    /// Leave the destination untouched and skip the entry.
    #[default]
    Skip,
    /// Defer to the conflict resolver (may prompt the user).
    Ask,
}

/// The resolved per-entry action a copy worker honors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CopyAction {
    /// Plain copy to a fresh destination.
    #[default]
    Copied,
    /// Destination existed and is overwritten.
    Replaced,
    /// Destination existed; copy under the renamed path.
    Renamed,
    /// Destination existed; entry is skipped as a no-op success.
    Ignored,
    /// Nothing to do for this entry at all.
    NoFurtherAction,
}

/// Post-copy verification depth. Mismatches are classified as failures even
/// though the byte copy itself succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VerifyOption {
    /// No verification pass.
    #[default]
    None,
    /// Compare file lengths.
    Size,
    /// Byte-for-byte comparison.
    Content,
    /// SHA-256 digest comparison.
    Hash,
}

/// One `(src, dest)` pair inside a copy unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyEntry {
    pub src: PathBuf,
    /// Never empty; validated at construction.
    pub dest: PathBuf,
    pub exist_option: ExistOption,
    pub copy_action: CopyAction,
    /// A missing optional source is a no-op success, not a failure.
    pub optional_src: bool,
}

impl CopyEntry {
    pub fn new(src: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        Self {
            src: src.into(),
            dest: dest.into(),
            exist_option: ExistOption::default(),
            copy_action: CopyAction::default(),
            optional_src: false,
        }
    }

    pub fn with_exist_option(mut self, exist_option: ExistOption) -> Self {
        self.exist_option = exist_option;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional_src = true;
        self
    }
}

/// Descriptor for an item the library will create from a produced file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportItem {
    /// Display name the library shows for the item.
    pub name: String,
    /// Clip ID the item is associated with, when one was assigned.
    pub clip_id: Option<ClipId>,
}

/// A barrier group of copy entries that share fate: the unit is complete
/// only when every entry has been attempted, and only then may its
/// downstream task be created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CopyUnit {
    /// Ordered copy entries; processed in order, never interleaved.
    pub entries: Vec<CopyEntry>,
    /// Produced files the library must import, keyed by destination path.
    pub import_files: HashMap<PathBuf, ImportItem>,
    /// Destination path to new display name, for pending renames.
    pub alias_names: HashMap<PathBuf, String>,
    /// Destination path to the clip ID to stamp into its metadata.
    pub clip_ids: HashMap<PathBuf, ClipId>,
}

impl CopyUnit {
    /// Whether finishing this unit can create an UpdateMetadata downstream
    /// task (rename or clip-ID stamping pending for produced files).
    pub fn metadata_pending(&self) -> bool {
        !self.alias_names.is_empty() || !self.clip_ids.is_empty()
    }
}

/// Settings for one Copy task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CopySetting {
    pub copy_units: Vec<CopyUnit>,
    pub verify: VerifyOption,
    /// Whether produced files flow on to an Import task (directly or after a
    /// metadata update). Backup-only destinations leave this false.
    pub need_create_import_task: bool,
}

impl CopySetting {
    /// Whether a given unit may create any downstream task when it finishes.
    ///
    /// One progress unit is reserved per unit for which this holds.
    pub fn downstream_possible(&self, unit: &CopyUnit) -> bool {
        unit.metadata_pending() || (self.need_create_import_task && !unit.import_files.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Other task settings
// ---------------------------------------------------------------------------

/// Settings for one UpdateMetadata task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateMetadataSetting {
    /// File path to new display name.
    pub alias_names: HashMap<PathBuf, String>,
    /// File path to the clip ID to stamp.
    pub clip_ids: HashMap<PathBuf, ClipId>,
    /// Rename the files on disk before patching metadata.
    pub need_file_rename: bool,
    /// Files that flow on to an Import task afterwards.
    pub import_files: HashMap<PathBuf, ImportItem>,
    pub need_create_import_task: bool,
}

/// Settings for one Import task.
///
/// Complete exactly when `finished` covers every key of `src_files`; files
/// finish out of order via asynchronous per-file notifications.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportSetting {
    pub src_files: HashMap<PathBuf, ImportItem>,
    pub finished: HashSet<PathBuf>,
}

impl ImportSetting {
    pub fn new(src_files: HashMap<PathBuf, ImportItem>) -> Self {
        Self {
            src_files,
            finished: HashSet::new(),
        }
    }

    /// Record one finished file; returns `true` once every source file has
    /// finished.
    pub fn mark_finished(&mut self, path: &Path) -> bool {
        if self.src_files.contains_key(path) {
            self.finished.insert(path.to_path_buf());
        }
        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.src_files.keys().all(|p| self.finished.contains(p))
    }
}

/// One source clip for the external encoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipSource {
    pub path: PathBuf,
    pub clip_id: Option<ClipId>,
}

/// Settings for one Transcode task (one source clip per task; multi-clip
/// requests are fanned out by the factory).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeSetting {
    pub clip: ClipSource,
    pub dest_dir: PathBuf,
    pub preset: String,
    pub needs_import: bool,
    /// Delete the encoder output after the ingest run finishes.
    pub auto_delete_after_ingest: bool,
    /// Request key assigned when the job is submitted to the encoder.
    pub encoder_request: Option<EncoderRequestId>,
}

/// Transient handle for the project/sequence that drives a concatenate job
/// in the external encoder. Released when the owning task is destroyed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceHandle {
    pub id: Uuid,
}

impl SequenceHandle {
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }
}

impl Default for SequenceHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Settings for one Concatenate task: a transcode of several clips joined
/// into one output, driven through a transient sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcatenateSetting {
    pub clips: Vec<ClipSource>,
    pub dest_dir: PathBuf,
    pub preset: String,
    pub needs_import: bool,
    pub auto_delete_after_ingest: bool,
    pub encoder_request: Option<EncoderRequestId>,
    pub sequence: SequenceHandle,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// The closed set of task kinds with their per-kind settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    Copy(CopySetting),
    UpdateMetadata(UpdateMetadataSetting),
    Import(ImportSetting),
    Transcode(TranscodeSetting),
    Concatenate(ConcatenateSetting),
}

impl TaskKind {
    pub fn category(&self) -> TaskCategory {
        match self {
            TaskKind::Copy(_) => TaskCategory::Copy,
            TaskKind::UpdateMetadata(_) => TaskCategory::UpdateMetadata,
            TaskKind::Import(_) => TaskCategory::Import,
            TaskKind::Transcode(_) => TaskCategory::Transcode,
            TaskKind::Concatenate(_) => TaskCategory::Concatenate,
        }
    }
}

/// One unit of ingest work: immutable identity, mutable state, and the
/// kind-specific settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    pub batch_id: BatchId,
    pub state: TaskState,
    /// Caller-supplied metadata to stamp into produced files.
    pub custom_metadata: HashMap<String, String>,
    pub kind: TaskKind,
}

impl Task {
    pub fn new(kind: TaskKind, batch_id: BatchId, custom_metadata: HashMap<String, String>) -> Self {
        Self {
            id: TaskId::new(),
            batch_id,
            state: TaskState::Init,
            custom_metadata,
            kind,
        }
    }

    /// The task's immutable identity.
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn category(&self) -> TaskCategory {
        self.kind.category()
    }

    /// Whether the task carries custom metadata to stamp, which makes an
    /// UpdateMetadata downstream step pending for its produced files.
    pub fn has_custom_metadata(&self) -> bool {
        !self.custom_metadata.is_empty()
    }

    /// Upper-bound reservation of progress units this task represents,
    /// including downstream work it may trigger later.
    ///
    /// The placeholder rule is one unit per *possible* downstream task,
    /// regardless of how many files that task would touch; progress
    /// consumers are calibrated to this forecast, so it is kept as-is.
    pub fn unit_forecast(&self) -> u64 {
        match &self.kind {
            TaskKind::Copy(setting) => {
                let placeholders = setting
                    .copy_units
                    .iter()
                    .filter(|u| setting.downstream_possible(u) || self.has_custom_metadata())
                    .count() as u64;
                setting.copy_units.len() as u64 + placeholders
            }
            // Always 2: the task itself plus one downstream placeholder.
            TaskKind::UpdateMetadata(_) => 2,
            TaskKind::Import(_) => 1,
            TaskKind::Transcode(setting) => {
                if setting.needs_import || self.has_custom_metadata() {
                    2
                } else {
                    1
                }
            }
            TaskKind::Concatenate(setting) => {
                if setting.needs_import || self.has_custom_metadata() {
                    2
                } else {
                    1
                }
            }
        }
    }

    /// Units reserved for the downstream step of one copy unit.
    pub fn reserved_downstream_units(&self, unit_index: usize) -> u64 {
        match &self.kind {
            TaskKind::Copy(setting) => match setting.copy_units.get(unit_index) {
                Some(unit)
                    if setting.downstream_possible(unit) || self.has_custom_metadata() =>
                {
                    1
                }
                _ => 0,
            },
            TaskKind::UpdateMetadata(_) => 1,
            TaskKind::Transcode(s) => {
                if s.needs_import || self.has_custom_metadata() {
                    1
                } else {
                    0
                }
            }
            TaskKind::Concatenate(s) => {
                if s.needs_import || self.has_custom_metadata() {
                    1
                } else {
                    0
                }
            }
            TaskKind::Import(_) => 0,
        }
    }
}
