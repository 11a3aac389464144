//! Domain store
//!
//! Typed operations over the key-value store. Every state transition is one
//! transaction guarded by compare-and-swap on the key of the current state,
//! so a repeated or racing transition fails with "already in state" instead
//! of corrupting data.
//!
//! - `export`: export creation, lookup of the opened file and slice, cleanup
//! - `file`: file transitions and the file swap
//! - `slice`: slice transitions and the slice swap
//! - `stats`: per-node received statistics
//! - `record`: buffered records
//! - `task`: task records and locks

mod export;
mod file;
mod record;
mod slice;
mod stats;
mod task;

use crate::clock::SharedClock;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::kv::{KeyValue, SharedKv, Txn, TxnResponse};
use serde::de::DeserializeOwned;

/// Read-modify-write attempts before giving up on concurrent modification
const MAX_ATTEMPTS: usize = 5;

/// Default number of slice stats written in one transaction
pub const DEFAULT_STATS_PER_TXN: usize = 50;

#[derive(Clone)]
pub struct Store {
    kv: SharedKv,
    clock: SharedClock,
    config: StoreConfig,
    stats_per_txn: usize,
}

impl Store {
    pub fn new(kv: SharedKv, clock: SharedClock, config: StoreConfig) -> Self {
        Store {
            kv,
            clock,
            config,
            stats_per_txn: DEFAULT_STATS_PER_TXN,
        }
    }

    /// Limit the number of slice stats written in one transaction
    pub fn with_stats_per_txn(mut self, n: usize) -> Self {
        self.stats_per_txn = n.max(1);
        self
    }

    pub fn kv(&self) -> &SharedKv {
        &self.kv
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResponse> {
        Ok(self.kv.txn(txn).await?)
    }
}

fn decode<T: DeserializeOwned>(kv: &KeyValue) -> Result<T> {
    Ok(kv.decode()?)
}

fn decode_all<T: DeserializeOwned>(kvs: &[KeyValue]) -> Result<Vec<T>> {
    kvs.iter().map(decode).collect()
}

fn concurrent_modification(kind: &str, key: impl std::fmt::Display) -> Error {
    Error::Mismatch(format!(
        "{} \"{}\" was modified concurrently, giving up after {} attempts",
        kind, key, MAX_ATTEMPTS
    ))
}
