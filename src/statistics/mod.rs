//! Statistics pipeline
//!
//! API nodes count received records in a [`Collector`] and flush them to the
//! store as per-node partial statistics. Readers aggregate the stats key-space
//! through a [`Provider`]:
//!
//! - `Realtime`: one store transaction per query, always fresh
//! - `L1`: in-memory mirror kept in sync by a watch, fresh up to watch latency
//! - `L2`: TTL memoization on top of L1, absorbs bursts of identical queries

mod collector;
mod l1;
mod l2;
mod provider;
mod realtime;

pub use collector::Collector;
pub use l1::L1Cache;
pub use l2::L2Cache;
pub use provider::{Provider, Providers, StatsFuture};
pub use realtime::RealtimeProvider;
