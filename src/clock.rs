//! Clock abstraction
//!
//! Every component asks a [`Clock`] for the current time instead of calling
//! the system clock directly, so threshold evaluation and key generation are
//! deterministic under test.
//!
//! - `ProductionClock`: real wall-clock time
//! - `SimulatedClock`: virtual time that only moves when told to

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// UTC timestamp with millisecond precision.
///
/// The string form is fixed-width (`2000-01-01T01:00:00.000Z`), so the
/// lexicographic order of formatted values matches the chronological order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct UtcTime(i64);

impl UtcTime {
    pub const ZERO: UtcTime = UtcTime(0);

    pub fn from_millis(ms: i64) -> Self {
        UtcTime(ms)
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Parse an RFC 3339 timestamp, any offset is normalized to UTC.
    pub fn parse(s: &str) -> Result<Self, chrono::ParseError> {
        let dt = DateTime::parse_from_rfc3339(s)?;
        Ok(UtcTime(dt.with_timezone(&Utc).timestamp_millis()))
    }

    /// Time from `earlier` to `self`, zero if `earlier` is later.
    pub fn saturating_sub(&self, earlier: UtcTime) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0).max(0) as u64)
    }

    pub fn max(self, other: UtcTime) -> UtcTime {
        if other.0 > self.0 {
            other
        } else {
            self
        }
    }

    fn to_datetime(self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.0).unwrap_or_default()
    }
}

impl std::ops::Add<Duration> for UtcTime {
    type Output = UtcTime;

    fn add(self, rhs: Duration) -> Self::Output {
        UtcTime(self.0.saturating_add(rhs.as_millis() as i64))
    }
}

impl std::ops::Sub<Duration> for UtcTime {
    type Output = UtcTime;

    fn sub(self, rhs: Duration) -> Self::Output {
        UtcTime(self.0.saturating_sub(rhs.as_millis() as i64))
    }
}

impl fmt::Display for UtcTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_datetime().to_rfc3339_opts(SecondsFormat::Millis, true))
    }
}

impl FromStr for UtcTime {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UtcTime::parse(s)
    }
}

impl From<DateTime<Utc>> for UtcTime {
    fn from(dt: DateTime<Utc>) -> Self {
        UtcTime(dt.timestamp_millis())
    }
}

impl Serialize for UtcTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for UtcTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        UtcTime::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Clock trait for time operations
pub trait Clock: Send + Sync + 'static {
    /// Get current time
    fn now(&self) -> UtcTime;

    /// Get elapsed time since a previous timestamp
    fn since(&self, earlier: UtcTime) -> Duration {
        self.now().saturating_sub(earlier)
    }
}

/// Shared handle used by all components.
pub type SharedClock = Arc<dyn Clock>;

/// Production clock using real system time
#[derive(Clone)]
pub struct ProductionClock {
    /// Epoch instant for calculating timestamps
    start: Instant,
    /// Wall-clock time at `start`, in milliseconds
    start_millis: i64,
}

impl Default for ProductionClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ProductionClock {
    pub fn new() -> Self {
        ProductionClock {
            start: Instant::now(),
            start_millis: Utc::now().timestamp_millis(),
        }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Clock for ProductionClock {
    fn now(&self) -> UtcTime {
        let elapsed = self.start.elapsed().as_millis() as i64;
        UtcTime(self.start_millis + elapsed)
    }
}

/// Simulated clock for deterministic testing
///
/// Time only advances when explicitly told to via `advance()` or `set()`.
#[derive(Clone)]
pub struct SimulatedClock {
    time_ms: Arc<AtomicI64>,
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new(UtcTime::ZERO)
    }
}

impl SimulatedClock {
    pub fn new(start: UtcTime) -> Self {
        SimulatedClock {
            time_ms: Arc::new(AtomicI64::new(start.0)),
        }
    }

    /// Start the clock at an RFC 3339 timestamp, panics on malformed input.
    pub fn at(rfc3339: &str) -> Self {
        Self::new(UtcTime::parse(rfc3339).expect("valid RFC 3339 timestamp"))
    }

    pub fn advance(&self, duration: Duration) {
        self.time_ms
            .fetch_add(duration.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, time: UtcTime) {
        self.time_ms.store(time.0, Ordering::SeqCst);
    }

    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> UtcTime {
        UtcTime(self.time_ms.load(Ordering::SeqCst))
    }
}
