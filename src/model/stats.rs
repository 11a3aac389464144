//! Statistics values
//!
//! `Stats` forms a commutative monoid: zero is the identity, addition is a
//! pointwise sum except `last_record_at`, which takes the maximum. Per-node
//! partial values can therefore be merged in any order and grouping.

use crate::clock::UtcTime;
use crate::model::key::SliceKey;
use crate::model::state::StatsCategory;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

const UNITS: [(&str, u64); 5] = [
    ("TB", 1 << 40),
    ("GB", 1 << 30),
    ("MB", 1 << 20),
    ("KB", 1 << 10),
    ("B", 1),
];

/// Number of bytes, printed with the largest unit that divides it exactly.
///
/// `30B`, `250KB`, `1MB`; `1536B` stays in bytes since it is not a whole KB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub const fn bytes(n: u64) -> Self {
        ByteSize(n)
    }

    pub const fn kb(n: u64) -> Self {
        ByteSize(n << 10)
    }

    pub const fn mb(n: u64) -> Self {
        ByteSize(n << 20)
    }

    pub const fn gb(n: u64) -> Self {
        ByteSize(n << 30)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Add for ByteSize {
    type Output = ByteSize;

    fn add(self, rhs: ByteSize) -> ByteSize {
        ByteSize(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for ByteSize {
    fn add_assign(&mut self, rhs: ByteSize) {
        *self = *self + rhs;
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("0B");
        }
        for (unit, factor) in UNITS {
            if self.0 % factor == 0 {
                return write!(f, "{}{}", self.0 / factor, unit);
            }
        }
        write!(f, "{}B", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseByteSizeError(String);

impl fmt::Display for ParseByteSizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid byte size \"{}\"", self.0)
    }
}

impl std::error::Error for ParseByteSizeError {}

impl FromStr for ByteSize {
    type Err = ParseByteSizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, unit) = trimmed.split_at(split);
        let n: u64 = digits
            .parse()
            .map_err(|_| ParseByteSizeError(s.to_string()))?;
        let unit = unit.trim().to_ascii_uppercase();
        let factor = match unit.as_str() {
            "" | "B" => 1,
            _ => UNITS
                .iter()
                .find(|(name, _)| *name == unit)
                .map(|(_, factor)| *factor)
                .ok_or_else(|| ParseByteSizeError(s.to_string()))?,
        };
        n.checked_mul(factor)
            .map(ByteSize)
            .ok_or_else(|| ParseByteSizeError(s.to_string()))
    }
}

impl Serialize for ByteSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Received/uploaded statistics of one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub last_record_at: UtcTime,
    pub records_count: u64,
    pub records_size: ByteSize,
    pub body_size: ByteSize,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default, rename = "fileGZipSize")]
    pub file_gzip_size: u64,
}

impl Stats {
    pub fn is_zero(&self) -> bool {
        *self == Stats::default()
    }
}

impl Add for Stats {
    type Output = Stats;

    fn add(self, rhs: Stats) -> Stats {
        Stats {
            last_record_at: self.last_record_at.max(rhs.last_record_at),
            records_count: self.records_count.saturating_add(rhs.records_count),
            records_size: self.records_size + rhs.records_size,
            body_size: self.body_size + rhs.body_size,
            file_size: self.file_size.saturating_add(rhs.file_size),
            file_gzip_size: self.file_gzip_size.saturating_add(rhs.file_gzip_size),
        }
    }
}

impl AddAssign for Stats {
    fn add_assign(&mut self, rhs: Stats) {
        *self = *self + rhs;
    }
}

impl std::iter::Sum for Stats {
    fn sum<I: Iterator<Item = Stats>>(iter: I) -> Stats {
        iter.fold(Stats::default(), Add::add)
    }
}

/// Statistics of an object split by lifecycle category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsByType {
    pub opened: Stats,
    pub uploading: Stats,
    pub upload_failed: Stats,
    pub uploaded: Stats,
    pub imported: Stats,
    /// opened + uploading + upload_failed
    pub aggregated_in_buffer: Stats,
    /// Sum of all categories
    pub aggregated_total: Stats,
}

impl StatsByType {
    pub fn add(&mut self, category: StatsCategory, stats: Stats) {
        match category {
            StatsCategory::Opened => self.opened += stats,
            StatsCategory::Uploading => self.uploading += stats,
            StatsCategory::Failed => self.upload_failed += stats,
            StatsCategory::Uploaded => self.uploaded += stats,
            StatsCategory::Imported => self.imported += stats,
        }
        if category.in_buffer() {
            self.aggregated_in_buffer += stats;
        }
        self.aggregated_total += stats;
    }

    pub fn get(&self, category: StatsCategory) -> Stats {
        match category {
            StatsCategory::Opened => self.opened,
            StatsCategory::Uploading => self.uploading,
            StatsCategory::Failed => self.upload_failed,
            StatsCategory::Uploaded => self.uploaded,
            StatsCategory::Imported => self.imported,
        }
    }
}

impl AddAssign for StatsByType {
    fn add_assign(&mut self, rhs: StatsByType) {
        for category in StatsCategory::ALL {
            self.add(category, rhs.get(category));
        }
    }
}

/// Per-node partial statistics of a slice, the collector payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceStats {
    pub slice_key: SliceKey,
    pub stats: Stats,
}

/// Result of a finished upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UploadStats {
    pub file_size: u64,
    pub file_gzip_size: u64,
}
