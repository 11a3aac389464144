//! Hierarchical object keys
//!
//! `ReceiverKey ⊂ ExportKey ⊂ FileKey ⊂ SliceKey`. Each level embeds its
//! parent and the string form of a child always starts with the string form
//! of its parent followed by `/`, so a parent prefix scan covers all children.
//!
//! ```text
//! 00000123/my-receiver/my-export/2000-01-01T01:00:00.000Z/2000-01-01T01:00:00.000Z
//! └──── receiver ────┘
//! └─────────── export ──────────┘
//! └──────────────────────── file ─────────────────────────┘
//! └─────────────────────────────────────────── slice ──────────────────────────────┘
//! ```

use crate::clock::UtcTime;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of random suffixes in record and task keys
const RANDOM_SUFFIX_LEN: usize = 10;

/// Project identifier, zero-padded to 8 digits in keys so keys sort numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProjectId(pub u32);

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverKey {
    pub project_id: ProjectId,
    pub receiver_id: String,
}

impl ReceiverKey {
    pub fn new(project_id: u32, receiver_id: impl Into<String>) -> Self {
        ReceiverKey {
            project_id: ProjectId(project_id),
            receiver_id: receiver_id.into(),
        }
    }
}

impl fmt::Display for ReceiverKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project_id, self.receiver_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportKey {
    #[serde(flatten)]
    pub receiver: ReceiverKey,
    pub export_id: String,
}

impl ExportKey {
    pub fn new(receiver: ReceiverKey, export_id: impl Into<String>) -> Self {
        ExportKey {
            receiver,
            export_id: export_id.into(),
        }
    }

    pub fn receiver_key(&self) -> &ReceiverKey {
        &self.receiver
    }
}

impl fmt::Display for ExportKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.receiver, self.export_id)
    }
}

/// File is identified by the time it was opened.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileKey {
    #[serde(flatten)]
    pub export: ExportKey,
    pub file_id: UtcTime,
}

impl FileKey {
    pub fn new(export: ExportKey, opened_at: UtcTime) -> Self {
        FileKey {
            export,
            file_id: opened_at,
        }
    }

    pub fn opened_at(&self) -> UtcTime {
        self.file_id
    }

    pub fn export_key(&self) -> &ExportKey {
        &self.export
    }

    pub fn receiver_key(&self) -> &ReceiverKey {
        &self.export.receiver
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.export, self.file_id)
    }
}

/// Slice is identified by its file and the time it was opened.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceKey {
    #[serde(flatten)]
    pub file: FileKey,
    pub slice_id: UtcTime,
}

impl SliceKey {
    pub fn new(file: FileKey, opened_at: UtcTime) -> Self {
        SliceKey {
            file,
            slice_id: opened_at,
        }
    }

    pub fn opened_at(&self) -> UtcTime {
        self.slice_id
    }

    pub fn file_key(&self) -> &FileKey {
        &self.file
    }

    pub fn export_key(&self) -> &ExportKey {
        &self.file.export
    }

    pub fn receiver_key(&self) -> &ReceiverKey {
        &self.file.export.receiver
    }
}

impl fmt::Display for SliceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.file, self.slice_id)
    }
}

/// Any level of the hierarchy, used by the statistics providers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ObjectKey {
    Receiver(ReceiverKey),
    Export(ExportKey),
    File(FileKey),
    Slice(SliceKey),
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKey::Receiver(k) => k.fmt(f),
            ObjectKey::Export(k) => k.fmt(f),
            ObjectKey::File(k) => k.fmt(f),
            ObjectKey::Slice(k) => k.fmt(f),
        }
    }
}

impl From<ReceiverKey> for ObjectKey {
    fn from(k: ReceiverKey) -> Self {
        ObjectKey::Receiver(k)
    }
}

impl From<ExportKey> for ObjectKey {
    fn from(k: ExportKey) -> Self {
        ObjectKey::Export(k)
    }
}

impl From<FileKey> for ObjectKey {
    fn from(k: FileKey) -> Self {
        ObjectKey::File(k)
    }
}

impl From<SliceKey> for ObjectKey {
    fn from(k: SliceKey) -> Self {
        ObjectKey::Slice(k)
    }
}

/// Buffered record, `<slice>/<receivedAt>_<randomSuffix>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub slice: SliceKey,
    pub received_at: UtcTime,
    pub random_suffix: String,
}

impl RecordKey {
    pub fn new(slice: SliceKey, received_at: UtcTime) -> Self {
        RecordKey {
            slice,
            received_at,
            random_suffix: random_suffix(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}_{}", self.slice, self.received_at, self.random_suffix)
    }
}

/// Background task, `<export>/<type>/<createdAt>_<randomSuffix>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskKey {
    #[serde(flatten)]
    pub export: ExportKey,
    #[serde(rename = "type")]
    pub task_type: String,
    pub created_at: UtcTime,
    pub random_id: String,
}

impl TaskKey {
    pub fn new(export: ExportKey, task_type: impl Into<String>, created_at: UtcTime) -> Self {
        TaskKey {
            export,
            task_type: task_type.into(),
            created_at,
            random_id: random_suffix(),
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}_{}",
            self.export, self.task_type, self.created_at, self.random_id
        )
    }
}

pub fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RANDOM_SUFFIX_LEN)
        .map(char::from)
        .collect()
}
