//! Backing key-value store
//!
//! - `store`: transaction and watch abstraction
//! - `memory`: in-process implementation
//! - `simulated`: fault-injecting wrapper
//! - `watch`: get-all + watch consumer with resume

pub mod memory;
pub mod simulated;
pub mod store;
pub mod watch;

pub use memory::{InMemoryKv, MAX_OPS_PER_TXN};
pub use simulated::{SimulatedKv, SimulatedKvConfig, SimulatedKvStats};
pub use store::{
    encode, get_prefix, Compare, EventKind, KeyValue, KvFuture, KvStore, Op, OpResult, Revision,
    SharedKv, Txn, TxnResponse, WatchEvent, WatchResponse, WatchStream,
};
pub use watch::{WatchConsumer, WatchUpdate};
