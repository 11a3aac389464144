//! Simulated key-value store with fault injection
//!
//! Wraps another store and fails operations with configured probabilities.
//! The RNG is seeded, so a failing run can be replayed with the same seed.

use crate::error::StoreError;
use crate::kv::store::{KvFuture, KvStore, Revision, SharedKv, Txn, TxnResponse, WatchStream};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;

/// Configuration for simulated fault injection
#[derive(Debug, Clone)]
pub struct SimulatedKvConfig {
    /// Probability of a read-only transaction failure
    pub read_fail_prob: f64,
    /// Probability of a write transaction failure, nothing is applied
    pub write_fail_prob: f64,
    /// Probability of a watch creation failure
    pub watch_fail_prob: f64,
}

impl Default for SimulatedKvConfig {
    fn default() -> Self {
        SimulatedKvConfig {
            read_fail_prob: 0.01,  // 1%
            write_fail_prob: 0.01, // 1%
            watch_fail_prob: 0.01, // 1%
        }
    }
}

impl SimulatedKvConfig {
    /// High chaos configuration for stress testing
    pub fn high_chaos() -> Self {
        SimulatedKvConfig {
            read_fail_prob: 0.1,
            write_fail_prob: 0.2,
            watch_fail_prob: 0.1,
        }
    }

    /// No faults - for baseline testing
    pub fn no_faults() -> Self {
        SimulatedKvConfig {
            read_fail_prob: 0.0,
            write_fail_prob: 0.0,
            watch_fail_prob: 0.0,
        }
    }

    /// Every write fails
    pub fn writes_down() -> Self {
        SimulatedKvConfig {
            write_fail_prob: 1.0,
            ..Self::no_faults()
        }
    }
}

/// Statistics for fault injection
#[derive(Debug, Clone, Default)]
pub struct SimulatedKvStats {
    pub txn_attempts: u64,
    pub read_failures: u64,
    pub write_failures: u64,
    pub watch_attempts: u64,
    pub watch_failures: u64,
}

struct SimulatedKvInner {
    rng: ChaCha8Rng,
    config: SimulatedKvConfig,
    stats: SimulatedKvStats,
}

/// Store wrapper that injects faults
#[derive(Clone)]
pub struct SimulatedKv {
    inner_store: SharedKv,
    state: Arc<Mutex<SimulatedKvInner>>,
}

impl SimulatedKv {
    pub fn new(inner_store: SharedKv, seed: u64, config: SimulatedKvConfig) -> Self {
        SimulatedKv {
            inner_store,
            state: Arc::new(Mutex::new(SimulatedKvInner {
                rng: ChaCha8Rng::seed_from_u64(seed),
                config,
                stats: SimulatedKvStats::default(),
            })),
        }
    }

    /// Replace fault probabilities, e.g. to heal the store mid-test
    pub fn set_config(&self, config: SimulatedKvConfig) {
        self.state.lock().config = config;
    }

    pub fn stats(&self) -> SimulatedKvStats {
        self.state.lock().stats.clone()
    }

    /// Decide whether the transaction fails, updates statistics
    fn should_fail_txn(&self, txn: &Txn) -> bool {
        let mut s = self.state.lock();
        s.stats.txn_attempts += 1;
        let is_write = txn.success.iter().chain(txn.failure.iter()).any(|op| op.is_write());
        let prob = if is_write {
            s.config.write_fail_prob
        } else {
            s.config.read_fail_prob
        };
        let fail = prob > 0.0 && s.rng.gen_bool(prob.min(1.0));
        if fail {
            if is_write {
                s.stats.write_failures += 1;
            } else {
                s.stats.read_failures += 1;
            }
        }
        fail
    }

    fn should_fail_watch(&self) -> bool {
        let mut s = self.state.lock();
        s.stats.watch_attempts += 1;
        let prob = s.config.watch_fail_prob;
        let fail = prob > 0.0 && s.rng.gen_bool(prob.min(1.0));
        if fail {
            s.stats.watch_failures += 1;
        }
        fail
    }
}

impl KvStore for SimulatedKv {
    fn txn(&self, txn: Txn) -> KvFuture<'_, TxnResponse> {
        Box::pin(async move {
            if self.should_fail_txn(&txn) {
                return Err(StoreError::Unavailable("simulated txn failure".to_string()));
            }
            self.inner_store.txn(txn).await
        })
    }

    fn watch<'a>(&'a self, prefix: &'a str, from_revision: Revision) -> KvFuture<'a, WatchStream> {
        Box::pin(async move {
            if self.should_fail_watch() {
                return Err(StoreError::Unavailable(
                    "simulated watch failure".to_string(),
                ));
            }
            self.inner_store.watch(prefix, from_revision).await
        })
    }

    fn revision(&self) -> KvFuture<'_, Revision> {
        self.inner_store.revision()
    }
}
