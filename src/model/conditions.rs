//! Upload and import thresholds

use crate::clock::UtcTime;
use crate::config::duration_millis;
use crate::model::stats::{ByteSize, Stats};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::time::Duration;

/// Thresholds evaluated against the statistics of a slice or a file.
///
/// Any met threshold is enough, the object must contain at least one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conditions {
    pub count: u64,
    pub size: ByteSize,
    #[serde(with = "duration_millis")]
    pub time: Duration,
}

impl Conditions {
    /// Default slice upload thresholds.
    pub fn default_upload() -> Self {
        Conditions {
            count: 1000,
            size: ByteSize::mb(1),
            time: Duration::from_secs(60),
        }
    }

    /// Default file import thresholds.
    pub fn default_import() -> Self {
        Conditions {
            count: 10_000,
            size: ByteSize::mb(5),
            time: Duration::from_secs(5 * 60),
        }
    }

    /// Returns whether a threshold is met and a human readable reason.
    pub fn evaluate(&self, now: UtcTime, opened_at: UtcTime, stats: &Stats) -> (bool, String) {
        if stats.records_count == 0 {
            return (false, "no record".to_string());
        }

        if stats.records_count >= self.count {
            return (
                true,
                format!(
                    "count threshold met, received: {} rows, threshold: {} rows",
                    stats.records_count, self.count
                ),
            );
        }

        if stats.records_size >= self.size {
            return (
                true,
                format!(
                    "size threshold met, received: {}, threshold: {}",
                    stats.records_size, self.size
                ),
            );
        }

        let passed = now.saturating_sub(opened_at);
        if passed >= self.time {
            return (
                true,
                format!(
                    "time threshold met, opened at: {}, passed: {} threshold: {}",
                    opened_at,
                    format_duration(passed),
                    format_duration(self.time)
                ),
            );
        }

        (false, "conditions not met".to_string())
    }
}

impl Default for Conditions {
    fn default() -> Self {
        Conditions::default_import()
    }
}

/// Compact duration format, `1h2m3s`, `1m30s`, `1m0s`, `500ms`.
pub fn format_duration(d: Duration) -> String {
    let total_ms = d.as_millis();
    if total_ms == 0 {
        return "0s".to_string();
    }
    if total_ms < 1000 {
        return format!("{}ms", total_ms);
    }

    let hours = total_ms / 3_600_000;
    let minutes = (total_ms / 60_000) % 60;
    let seconds = (total_ms / 1000) % 60;
    let millis = total_ms % 1000;

    let mut out = String::new();
    if hours > 0 {
        let _ = write!(out, "{}h", hours);
    }
    if hours > 0 || minutes > 0 {
        let _ = write!(out, "{}m", minutes);
    }
    if millis > 0 {
        let frac = format!("{:03}", millis);
        let _ = write!(out, "{}.{}s", seconds, frac.trim_end_matches('0'));
    } else {
        let _ = write!(out, "{}s", seconds);
    }
    out
}
