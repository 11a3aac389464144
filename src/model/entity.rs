//! Export, file and slice entities as persisted in the store

use crate::clock::UtcTime;
use crate::model::conditions::Conditions;
use crate::model::key::{ExportKey, FileKey, SliceKey, TaskKey};
use crate::model::state::{FileState, SliceState};
use crate::model::stats::Stats;
use serde::{Deserialize, Serialize};

/// Target table and its columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    pub table_id: String,
    pub columns: Vec<Column>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Column {
    Id { name: String },
    Datetime { name: String },
    Ip { name: String },
    Body { name: String },
    Headers { name: String },
    Template { name: String, language: String, content: String },
}

impl Column {
    pub fn name(&self) -> &str {
        match self {
            Column::Id { name }
            | Column::Datetime { name }
            | Column::Ip { name }
            | Column::Body { name }
            | Column::Headers { name }
            | Column::Template { name, .. } => name,
        }
    }
}

/// Credentials for the upload of the slices of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "camelCase")]
pub enum UploadCredentials {
    S3 { expiration: UtcTime },
    Abs { expiration: UtcTime },
    /// GCS tokens carry a lifetime instead of an absolute expiration.
    Gcs { expires_in_secs: u64 },
}

impl UploadCredentials {
    /// Absolute expiration, GCS lifetime counts from the opening of the file.
    pub fn expiration(&self, file_opened_at: UtcTime) -> UtcTime {
        match self {
            UploadCredentials::S3 { expiration } | UploadCredentials::Abs { expiration } => {
                *expiration
            }
            UploadCredentials::Gcs { expires_in_secs } => {
                file_opened_at + std::time::Duration::from_secs(*expires_in_secs)
            }
        }
    }
}

/// Remote staging file allocated by the file manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageResource {
    pub id: u64,
    pub name: String,
    pub credentials: UploadCredentials,
}

/// Export configuration persisted under `config/export/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportBase {
    #[serde(flatten)]
    pub key: ExportKey,
    pub name: String,
    pub import_conditions: Conditions,
    pub mapping: Mapping,
}

/// Export with the currently opened file and slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub base: ExportBase,
    pub opened_file: File,
    pub opened_slice: Slice,
}

impl Export {
    pub fn key(&self) -> &ExportKey {
        &self.base.key
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    pub start: u64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct File {
    #[serde(flatten)]
    pub key: FileKey,
    pub state: FileState,
    pub mapping: Mapping,
    pub storage_resource: StorageResource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closing_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importing_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub retry_attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<Stats>,
    #[serde(default)]
    pub is_empty: bool,
}

impl File {
    pub fn new(key: FileKey, mapping: Mapping, storage_resource: StorageResource) -> Self {
        File {
            key,
            state: FileState::Opened,
            mapping,
            storage_resource,
            closing_at: None,
            importing_at: None,
            imported_at: None,
            failed_at: None,
            last_error: None,
            retry_attempt: 0,
            statistics: None,
            is_empty: false,
        }
    }

    pub fn opened_at(&self) -> UtcTime {
        self.key.opened_at()
    }

    pub(crate) fn set_state(&mut self, to: FileState, now: UtcTime) {
        self.state = to;
        match to {
            FileState::Opened => {}
            FileState::Closing => self.closing_at = Some(now),
            FileState::Importing => self.importing_at = Some(now),
            FileState::Failed => self.failed_at = Some(now),
            FileState::Imported => self.imported_at = Some(now),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slice {
    #[serde(flatten)]
    pub key: SliceKey,
    pub state: SliceState,
    pub mapping: Mapping,
    pub storage_resource: StorageResource,
    /// Sequence number of the slice within its file, starting at 1.
    pub number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closing_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploading_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub retry_attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<Stats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_range: Option<IdRange>,
    #[serde(default)]
    pub is_empty: bool,
}

impl Slice {
    pub fn new(
        key: SliceKey,
        mapping: Mapping,
        storage_resource: StorageResource,
        number: u32,
    ) -> Self {
        Slice {
            key,
            state: SliceState::Writing,
            mapping,
            storage_resource,
            number,
            closing_at: None,
            uploading_at: None,
            uploaded_at: None,
            failed_at: None,
            imported_at: None,
            last_error: None,
            retry_attempt: 0,
            statistics: None,
            id_range: None,
            is_empty: false,
        }
    }

    pub fn opened_at(&self) -> UtcTime {
        self.key.opened_at()
    }

    /// Expiration of the upload credentials of the slice file.
    pub fn credentials_expiration(&self) -> UtcTime {
        self.storage_resource
            .credentials
            .expiration(self.key.file_key().opened_at())
    }

    pub(crate) fn set_state(&mut self, to: SliceState, now: UtcTime) {
        self.state = to;
        match to {
            SliceState::Writing => {}
            SliceState::Closing => self.closing_at = Some(now),
            SliceState::Uploading => self.uploading_at = Some(now),
            SliceState::Uploaded => self.uploaded_at = Some(now),
            SliceState::Failed => self.failed_at = Some(now),
            SliceState::Imported => self.imported_at = Some(now),
        }
    }
}

/// Record of a background task, the lock is held while the task runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(flatten)]
    pub key: TaskKey,
    pub worker_node: String,
    /// `<task type>/<object id>`
    pub lock: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Duration in milliseconds
    #[serde(default, rename = "duration", skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl Task {
    pub fn new(key: TaskKey, worker_node: impl Into<String>, lock: impl Into<String>) -> Self {
        Task {
            key,
            worker_node: worker_node.into(),
            lock: lock.into(),
            finished_at: None,
            result: None,
            error: None,
            duration_ms: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    pub(crate) fn finish(&mut self, now: UtcTime, outcome: &Result<String, String>) {
        self.finished_at = Some(now);
        self.duration_ms = Some(now.saturating_sub(self.key.created_at).as_millis() as u64);
        match outcome {
            Ok(result) => self.result = Some(result.clone()),
            Err(error) => self.error = Some(error.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::key::ReceiverKey;
    use std::time::Duration;

    #[test]
    fn test_gcs_expiration_counts_from_file_opening() {
        let opened_at = UtcTime::parse("2000-01-01T01:00:00Z").unwrap();
        let credentials = UploadCredentials::Gcs {
            expires_in_secs: 3600,
        };
        assert_eq!(
            credentials.expiration(opened_at),
            opened_at + Duration::from_secs(3600)
        );

        let expiration = UtcTime::parse("2000-01-01T05:00:00Z").unwrap();
        let credentials = UploadCredentials::S3 { expiration };
        assert_eq!(credentials.expiration(opened_at), expiration);
    }

    #[test]
    fn test_slice_json() {
        let export = ExportKey::new(ReceiverKey::new(123, "my-receiver"), "my-export");
        let opened_at = UtcTime::parse("2000-01-01T01:00:00Z").unwrap();
        let file_key = FileKey::new(export, opened_at);
        let slice = Slice::new(
            SliceKey::new(file_key, opened_at),
            Mapping {
                table_id: "in.c-bucket.table".to_string(),
                columns: vec![Column::Body {
                    name: "body".to_string(),
                }],
            },
            StorageResource {
                id: 1,
                name: "file1".to_string(),
                credentials: UploadCredentials::Gcs {
                    expires_in_secs: 60,
                },
            },
            1,
        );

        let json = serde_json::to_value(&slice).unwrap();
        assert_eq!(json["projectId"], 123);
        assert_eq!(json["sliceId"], "2000-01-01T01:00:00.000Z");
        assert_eq!(json["state"], "writing");
        assert_eq!(json["mapping"]["columns"][0]["type"], "body");
        assert_eq!(json["storageResource"]["credentials"]["provider"], "gcs");
        assert!(json.get("closingAt").is_none());

        let back: Slice = serde_json::from_value(json).unwrap();
        assert_eq!(back, slice);
    }
}
