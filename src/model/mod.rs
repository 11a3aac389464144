//! Domain model
//!
//! Keys, statistics values, lifecycle states and persisted entities.

pub mod conditions;
pub mod entity;
pub mod key;
pub mod state;
pub mod stats;

pub use conditions::Conditions;
pub use entity::{
    Column, Export, ExportBase, File, IdRange, Mapping, Slice, StorageResource, Task,
    UploadCredentials,
};
pub use key::{ExportKey, FileKey, ObjectKey, ProjectId, ReceiverKey, RecordKey, SliceKey, TaskKey};
pub use state::{check_transition, FileState, SliceState, State, StatsCategory};
pub use stats::{ByteSize, SliceStats, Stats, StatsByType, UploadStats};
