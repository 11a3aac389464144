//! Key-value store abstraction
//!
//! Models a consistent store with multi-key transactions, compare-and-swap
//! guards and an ordered, revisioned change stream.
//!
//! Implementations:
//! - `InMemoryKv`: in-process store for tests and the demo binary
//! - `SimulatedKv`: fault-injecting wrapper

use crate::error::StoreError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Global revision, incremented by every committed write transaction.
pub type Revision = u64;

/// Boxed future returned by store operations.
pub type KvFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Stream of committed changes under a watched prefix.
pub type WatchStream = mpsc::UnboundedReceiver<WatchResponse>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub create_revision: Revision,
    pub mod_revision: Revision,
}

impl KeyValue {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_slice(&self.value).map_err(|source| StoreError::Decode {
            key: self.key.clone(),
            source,
        })
    }
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(value)?)
}

/// Transaction guard, evaluated against the state before the transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compare {
    Missing(String),
    Exists(String),
    /// At least one of the keys exists.
    AnyExists(Vec<String>),
    ValueEquals(String, Vec<u8>),
    /// No key under the prefix was created, modified or deleted after the revision.
    PrefixUnchangedSince(String, Revision),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Get(String),
    Range(String),
    Count(String),
    Put { key: String, value: Vec<u8> },
    Delete(String),
    DeletePrefix(String),
}

impl Op {
    pub fn put(key: impl Into<String>, value: Vec<u8>) -> Op {
        Op::Put {
            key: key.into(),
            value,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Op::Put { .. } | Op::Delete(_) | Op::DeletePrefix(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResult {
    /// `Get` and `Range` results, sorted by key
    Kvs(Vec<KeyValue>),
    Count(usize),
    /// Number of keys written or deleted
    Written(usize),
}

/// Atomic transaction: if all compares hold, `success` ops run, else `failure` ops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub success: Vec<Op>,
    pub failure: Vec<Op>,
}

impl Txn {
    pub fn new() -> Self {
        Txn::default()
    }

    pub fn when(mut self, compare: Compare) -> Self {
        self.compares.push(compare);
        self
    }

    pub fn then(mut self, op: Op) -> Self {
        self.success.push(op);
        self
    }

    pub fn or_else(mut self, op: Op) -> Self {
        self.failure.push(op);
        self
    }

    /// Append guards and operations of another transaction.
    pub fn merge(mut self, other: Txn) -> Self {
        self.compares.extend(other.compares);
        self.success.extend(other.success);
        self.failure.extend(other.failure);
        self
    }

    pub fn ops_count(&self) -> usize {
        self.compares.len() + self.success.len().max(self.failure.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnResponse {
    pub succeeded: bool,
    /// Store revision after the transaction
    pub revision: Revision,
    pub results: Vec<OpResult>,
}

impl TxnResponse {
    /// Key-values of the `Get`/`Range` op at the index.
    pub fn kvs(&self, index: usize) -> &[KeyValue] {
        match self.results.get(index) {
            Some(OpResult::Kvs(kvs)) => kvs,
            _ => &[],
        }
    }

    pub fn first(&self, index: usize) -> Option<&KeyValue> {
        self.kvs(index).first()
    }

    pub fn count(&self, index: usize) -> usize {
        match self.results.get(index) {
            Some(OpResult::Count(n)) => *n,
            Some(OpResult::Kvs(kvs)) => kvs.len(),
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    /// New value, for deletes the value is empty
    pub kv: KeyValue,
    pub prev: Option<KeyValue>,
}

/// All events of one committed transaction under the watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchResponse {
    pub revision: Revision,
    pub events: Vec<WatchEvent>,
}

/// Consistent key-value store
pub trait KvStore: Send + Sync + 'static {
    /// Execute a transaction atomically
    fn txn(&self, txn: Txn) -> KvFuture<'_, TxnResponse>;

    /// Watch changes under the prefix, starting at `from_revision`.
    ///
    /// Changes already committed at or after `from_revision` are replayed
    /// first. `0` means "from the next commit". Fails with
    /// `StoreError::Compacted` if the revision is no longer retained.
    fn watch<'a>(&'a self, prefix: &'a str, from_revision: Revision) -> KvFuture<'a, WatchStream>;

    /// Current revision
    fn revision(&self) -> KvFuture<'_, Revision>;
}

pub type SharedKv = Arc<dyn KvStore>;

/// Read all keys under the prefix together with the revision of the read.
pub async fn get_prefix(kv: &dyn KvStore, prefix: &str) -> Result<(Vec<KeyValue>, Revision), StoreError> {
    let resp = kv.txn(Txn::new().then(Op::Range(prefix.to_string()))).await?;
    let revision = resp.revision;
    let kvs = match resp.results.into_iter().next() {
        Some(OpResult::Kvs(kvs)) => kvs,
        _ => Vec::new(),
    };
    Ok((kvs, revision))
}
