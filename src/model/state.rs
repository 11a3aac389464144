//! Slice and file lifecycle states
//!
//! ```text
//! File:  Opened → Closing → Importing ⇄ Failed
//!                               ↓
//!                           Imported
//!
//! Slice: Writing → Closing → Uploading ⇄ Failed
//!                               ↓
//!                           Uploaded → Imported
//! ```
//!
//! Allowed transitions are listed in one table per entity and checked by
//! [`check_transition`] before any store write.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of an entity with an explicit transition table.
pub trait State: Copy + Eq + fmt::Display + 'static {
    /// Entity name used in error messages.
    const KIND: &'static str;
    /// Allowed `(from, to)` pairs.
    const TRANSITIONS: &'static [(Self, Self)];
}

/// Validate a transition against the table of the state type.
pub fn check_transition<S: State>(from: S, to: S) -> Result<()> {
    if S::TRANSITIONS.iter().any(|&(f, t)| f == from && t == to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            kind: S::KIND,
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileState {
    Opened,
    Closing,
    Importing,
    Failed,
    Imported,
}

impl FileState {
    pub const ALL: [FileState; 5] = [
        FileState::Opened,
        FileState::Closing,
        FileState::Importing,
        FileState::Failed,
        FileState::Imported,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileState::Opened => "opened",
            FileState::Closing => "closing",
            FileState::Importing => "importing",
            FileState::Failed => "failed",
            FileState::Imported => "imported",
        }
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl State for FileState {
    const KIND: &'static str = "file";
    const TRANSITIONS: &'static [(FileState, FileState)] = &[
        (FileState::Opened, FileState::Closing),
        (FileState::Closing, FileState::Importing),
        (FileState::Importing, FileState::Imported),
        (FileState::Importing, FileState::Failed),
        (FileState::Failed, FileState::Importing),
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SliceState {
    Writing,
    Closing,
    Uploading,
    Failed,
    Uploaded,
    Imported,
}

impl SliceState {
    pub const ALL: [SliceState; 6] = [
        SliceState::Writing,
        SliceState::Closing,
        SliceState::Uploading,
        SliceState::Failed,
        SliceState::Uploaded,
        SliceState::Imported,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SliceState::Writing => "writing",
            SliceState::Closing => "closing",
            SliceState::Uploading => "uploading",
            SliceState::Failed => "failed",
            SliceState::Uploaded => "uploaded",
            SliceState::Imported => "imported",
        }
    }

    /// Key-space level of the state, `slice/<level>/...`.
    pub fn level(&self) -> &'static str {
        match self {
            SliceState::Writing => "active/opened/writing",
            SliceState::Closing => "active/opened/closing",
            SliceState::Uploading => "active/closed/uploading",
            SliceState::Failed => "active/closed/failed",
            SliceState::Uploaded => "active/closed/uploaded",
            SliceState::Imported => "archived/successful/imported",
        }
    }

    /// Statistics category holding the slice stats in this state.
    pub fn stats_category(&self) -> StatsCategory {
        match self {
            SliceState::Writing | SliceState::Closing => StatsCategory::Opened,
            SliceState::Uploading => StatsCategory::Uploading,
            SliceState::Failed => StatsCategory::Failed,
            SliceState::Uploaded => StatsCategory::Uploaded,
            SliceState::Imported => StatsCategory::Imported,
        }
    }

    /// Slice still accepts records from API nodes.
    pub fn is_open(&self) -> bool {
        matches!(self, SliceState::Writing | SliceState::Closing)
    }
}

impl fmt::Display for SliceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl State for SliceState {
    const KIND: &'static str = "slice";
    const TRANSITIONS: &'static [(SliceState, SliceState)] = &[
        (SliceState::Writing, SliceState::Closing),
        (SliceState::Closing, SliceState::Uploading),
        (SliceState::Uploading, SliceState::Uploaded),
        (SliceState::Uploading, SliceState::Failed),
        (SliceState::Failed, SliceState::Uploading),
        (SliceState::Uploaded, SliceState::Imported),
    ];
}

/// Statistics key-space category, `stats/slice/<prefix>/...`.
///
/// Writing and closing slices share the `opened` category, per-node stats are
/// written there. All other categories hold one `_nodes_sum` per slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StatsCategory {
    Opened,
    Uploading,
    Failed,
    Uploaded,
    Imported,
}

impl StatsCategory {
    pub const ALL: [StatsCategory; 5] = [
        StatsCategory::Opened,
        StatsCategory::Uploading,
        StatsCategory::Failed,
        StatsCategory::Uploaded,
        StatsCategory::Imported,
    ];

    pub fn prefix(&self) -> &'static str {
        match self {
            StatsCategory::Opened => "active/opened/writing",
            StatsCategory::Uploading => "active/closed/uploading",
            StatsCategory::Failed => "active/closed/failed",
            StatsCategory::Uploaded => "active/closed/uploaded",
            StatsCategory::Imported => "archived/successful/imported",
        }
    }

    /// Data not yet uploaded to the staging storage.
    pub fn in_buffer(&self) -> bool {
        matches!(
            self,
            StatsCategory::Opened | StatsCategory::Uploading | StatsCategory::Failed
        )
    }

    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Category of a relative stats key, `<category prefix>/<object>...`.
    pub fn from_relative_key(key: &str) -> Option<(StatsCategory, &str)> {
        StatsCategory::ALL.into_iter().find_map(|category| {
            key.strip_prefix(category.prefix())
                .and_then(|rest| rest.strip_prefix('/'))
                .map(|rest| (category, rest))
        })
    }
}

impl fmt::Display for StatsCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}
