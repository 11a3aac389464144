//! Key-space schema
//!
//! Deterministic mapping of entities to store keys. All object keys sort
//! lexicographically in the same order as their timestamps, so prefix scans
//! return children in creation order.
//!
//! ```text
//! config/export/<export>
//! file/<state>/<file>
//! slice/<level>/<slice>
//! stats/slice/<category>/<slice>/<nodeID>          per-node partial stats
//! stats/slice/<category>/<slice>/_nodes_sum        summary of a closed slice
//! stats/slice/<category>/<export>/_reduce_sum      rollup of deleted files
//! record/<slice>/<receivedAt>_<suffix>
//! task/<export>/<type>/<createdAt>_<suffix>
//! runtime/last/record/id/<export>
//! runtime/lock/task/<export>/<type>/<objectID>
//! ```
//!
//! Every prefix of an object ends with `/`, so `.../my-export/` never matches
//! a sibling `.../my-export-2/`.

use crate::model::{
    ExportKey, FileKey, FileState, ObjectKey, ReceiverKey, RecordKey, SliceKey, SliceState,
    StatsCategory, TaskKey,
};

pub const CONFIG_EXPORT: &str = "config/export/";
pub const FILE: &str = "file/";
pub const SLICE: &str = "slice/";
pub const STATS: &str = "stats/slice/";
pub const RECORD: &str = "record/";
pub const TASK: &str = "task/";
pub const RECORD_COUNTER: &str = "runtime/last/record/id/";
pub const TASK_LOCK: &str = "runtime/lock/task/";

/// Summary key suffix of a closed slice
pub const NODES_SUM: &str = "_nodes_sum";
/// Export level rollup of deleted slices
pub const REDUCE_SUM: &str = "_reduce_sum";

/// Key builders, zero-sized namespace.
pub struct Schema;

impl Schema {
    pub fn export(key: &ExportKey) -> String {
        format!("{}{}", CONFIG_EXPORT, key)
    }

    pub fn exports_in_receiver(key: &ReceiverKey) -> String {
        format!("{}{}/", CONFIG_EXPORT, key)
    }

    pub fn file(state: FileState, key: &FileKey) -> String {
        format!("{}{}/{}", FILE, state, key)
    }

    pub fn files_in_state(state: FileState) -> String {
        format!("{}{}/", FILE, state)
    }

    pub fn files_in_export(state: FileState, key: &ExportKey) -> String {
        format!("{}{}/{}/", FILE, state, key)
    }

    pub fn slice(state: SliceState, key: &SliceKey) -> String {
        format!("{}{}/{}", SLICE, state.level(), key)
    }

    pub fn slices_in_state(state: SliceState) -> String {
        format!("{}{}/", SLICE, state.level())
    }

    pub fn slices_in_export(state: SliceState, key: &ExportKey) -> String {
        format!("{}{}/{}/", SLICE, state.level(), key)
    }

    pub fn slices_in_file(state: SliceState, key: &FileKey) -> String {
        format!("{}{}/{}/", SLICE, state.level(), key)
    }

    /// Parse a slice key back from its store key, `None` for foreign keys.
    pub fn slice_state_of(store_key: &str) -> Option<SliceState> {
        let rest = store_key.strip_prefix(SLICE)?;
        SliceState::ALL
            .into_iter()
            .find(|state| rest.starts_with(state.level()) && rest[state.level().len()..].starts_with('/'))
    }

    pub fn stats_in_category(category: StatsCategory) -> String {
        format!("{}{}/", STATS, category.prefix())
    }

    /// All stats of the object in one category, including stats of children.
    pub fn stats_in_object(category: StatsCategory, key: &ObjectKey) -> String {
        format!("{}{}/{}/", STATS, category.prefix(), key)
    }

    pub fn slice_stats_per_node(category: StatsCategory, key: &SliceKey, node_id: &str) -> String {
        format!("{}{}/{}/{}", STATS, category.prefix(), key, node_id)
    }

    pub fn slice_stats_nodes_sum(category: StatsCategory, key: &SliceKey) -> String {
        format!("{}{}/{}/{}", STATS, category.prefix(), key, NODES_SUM)
    }

    pub fn export_stats_reduce_sum(category: StatsCategory, key: &ExportKey) -> String {
        format!("{}{}/{}/{}", STATS, category.prefix(), key, REDUCE_SUM)
    }

    pub fn record(key: &RecordKey) -> String {
        format!("{}{}", RECORD, key)
    }

    pub fn records_in_slice(key: &SliceKey) -> String {
        format!("{}{}/", RECORD, key)
    }

    pub fn records_in_file(key: &FileKey) -> String {
        format!("{}{}/", RECORD, key)
    }

    pub fn record_counter(key: &ExportKey) -> String {
        format!("{}{}", RECORD_COUNTER, key)
    }

    pub fn task(key: &TaskKey) -> String {
        format!("{}{}", TASK, key)
    }

    pub fn tasks_in_export(key: &ExportKey) -> String {
        format!("{}{}/", TASK, key)
    }

    /// Exclusive lock of a task, `lock` is `<task type>/<object id>`.
    pub fn task_lock(key: &ExportKey, lock: &str) -> String {
        format!("{}{}/{}", TASK_LOCK, key, lock)
    }

    /// Every prefix holding keys of the receiver, used by cleanup.
    pub fn receiver_prefixes(key: &ReceiverKey) -> Vec<String> {
        let object = ObjectKey::Receiver(key.clone());
        let mut prefixes = vec![Schema::exports_in_receiver(key)];
        prefixes.extend(
            FileState::ALL
                .into_iter()
                .map(|state| format!("{}{}/{}/", FILE, state, key)),
        );
        prefixes.extend(
            SliceState::ALL
                .into_iter()
                .map(|state| format!("{}{}/{}/", SLICE, state.level(), key)),
        );
        prefixes.extend(
            StatsCategory::ALL
                .into_iter()
                .map(|category| Schema::stats_in_object(category, &object)),
        );
        prefixes.push(format!("{}{}/", RECORD, key));
        prefixes.push(format!("{}{}/", TASK, key));
        prefixes.push(format!("{}{}/", RECORD_COUNTER, key));
        prefixes.push(format!("{}{}/", TASK_LOCK, key));
        prefixes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::UtcTime;

    fn slice_key() -> SliceKey {
        let export = ExportKey::new(ReceiverKey::new(123, "my-receiver"), "my-export");
        let file = FileKey::new(export, UtcTime::parse("2000-01-01T01:00:00Z").unwrap());
        SliceKey::new(file, UtcTime::parse("2000-01-01T02:00:00Z").unwrap())
    }

    #[test]
    fn test_entity_keys() {
        let k = slice_key();
        assert_eq!(
            Schema::export(k.export_key()),
            "config/export/00000123/my-receiver/my-export"
        );
        assert_eq!(
            Schema::file(FileState::Closing, k.file_key()),
            "file/closing/00000123/my-receiver/my-export/2000-01-01T01:00:00.000Z"
        );
        assert_eq!(
            Schema::slice(SliceState::Uploaded, &k),
            "slice/active/closed/uploaded/00000123/my-receiver/my-export/2000-01-01T01:00:00.000Z/2000-01-01T02:00:00.000Z"
        );
        assert_eq!(
            Schema::slices_in_export(SliceState::Writing, k.export_key()),
            "slice/active/opened/writing/00000123/my-receiver/my-export/"
        );
        assert_eq!(
            Schema::record_counter(k.export_key()),
            "runtime/last/record/id/00000123/my-receiver/my-export"
        );
    }

    #[test]
    fn test_stats_keys() {
        let k = slice_key();
        assert_eq!(
            Schema::slice_stats_per_node(StatsCategory::Opened, &k, "node-1"),
            "stats/slice/active/opened/writing/00000123/my-receiver/my-export/2000-01-01T01:00:00.000Z/2000-01-01T02:00:00.000Z/node-1"
        );
        assert_eq!(
            Schema::slice_stats_nodes_sum(StatsCategory::Uploading, &k),
            "stats/slice/active/closed/uploading/00000123/my-receiver/my-export/2000-01-01T01:00:00.000Z/2000-01-01T02:00:00.000Z/_nodes_sum"
        );
        assert_eq!(
            Schema::export_stats_reduce_sum(StatsCategory::Imported, k.export_key()),
            "stats/slice/archived/successful/imported/00000123/my-receiver/my-export/_reduce_sum"
        );
    }

    #[test]
    fn test_object_prefix_contains_children() {
        let k = slice_key();
        let node_key = Schema::slice_stats_per_node(StatsCategory::Opened, &k, "node-1");
        for object in [
            ObjectKey::Receiver(k.receiver_key().clone()),
            ObjectKey::Export(k.export_key().clone()),
            ObjectKey::File(k.file_key().clone()),
            ObjectKey::Slice(k.clone()),
        ] {
            assert!(node_key.starts_with(&Schema::stats_in_object(StatsCategory::Opened, &object)));
            assert!(!node_key.starts_with(&Schema::stats_in_object(StatsCategory::Uploading, &object)));
        }

        let sibling = ExportKey::new(ReceiverKey::new(123, "my-receiver"), "my-export-2");
        assert!(!Schema::stats_in_object(StatsCategory::Opened, &ObjectKey::Export(sibling))
            .starts_with(&Schema::stats_in_object(
                StatsCategory::Opened,
                &ObjectKey::Export(k.export_key().clone())
            )));
    }

    #[test]
    fn test_slice_state_of() {
        let k = slice_key();
        for state in SliceState::ALL {
            assert_eq!(Schema::slice_state_of(&Schema::slice(state, &k)), Some(state));
        }
        assert_eq!(Schema::slice_state_of("file/opened/x"), None);
    }
}
