//! In-memory key-value store
//!
//! Single-process implementation of [`KvStore`]. All transactions are
//! serialized by one lock, each committed write transaction bumps the
//! revision by one and is delivered to every watcher as one
//! [`WatchResponse`]. Events outside the watched prefix are filtered out, a
//! response without events is a progress notification. A bounded history of
//! responses allows watchers to resume.

use crate::error::StoreError;
use crate::kv::store::{
    Compare, EventKind, KeyValue, KvFuture, KvStore, Op, OpResult, Revision, Txn, TxnResponse,
    WatchEvent, WatchResponse, WatchStream,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Maximum operations in one transaction
pub const MAX_OPS_PER_TXN: usize = 128;

/// Number of committed transactions retained for watch resume
const DEFAULT_HISTORY_LIMIT: usize = 10_000;

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchResponse>,
}

struct Inner {
    data: BTreeMap<String, KeyValue>,
    revision: Revision,
    /// Revisions up to and including this one are no longer in `history`
    compacted: Revision,
    history: VecDeque<WatchResponse>,
    history_limit: usize,
    watchers: Vec<Watcher>,
    max_ops: usize,
}

/// In-memory store, clones share the same data.
#[derive(Clone)]
pub struct InMemoryKv {
    inner: Arc<Mutex<Inner>>,
}

impl Default for InMemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::with_limits(MAX_OPS_PER_TXN, DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_limits(max_ops: usize, history_limit: usize) -> Self {
        InMemoryKv {
            inner: Arc::new(Mutex::new(Inner {
                data: BTreeMap::new(),
                revision: 0,
                compacted: 0,
                history: VecDeque::new(),
                history_limit,
                watchers: Vec::new(),
                max_ops,
            })),
        }
    }

    /// Number of stored keys (for testing)
    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().data.is_empty()
    }

    /// Keys under the prefix (for testing)
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        let inner = self.inner.lock();
        prefix_range(&inner.data, prefix)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Close all watch streams, watchers must resume (for testing)
    pub fn disconnect_watchers(&self) {
        self.inner.lock().watchers.clear();
    }

    /// Drop the whole history, resuming watchers get `Compacted` (for testing)
    pub fn compact(&self) {
        let mut inner = self.inner.lock();
        inner.history.clear();
        inner.compacted = inner.revision;
    }

    pub fn current_revision(&self) -> Revision {
        self.inner.lock().revision
    }

    fn apply(&self, txn: Txn) -> Result<TxnResponse, StoreError> {
        let mut inner = self.inner.lock();

        let ops = txn.ops_count();
        if ops > inner.max_ops {
            return Err(StoreError::TooManyOps {
                ops,
                limit: inner.max_ops,
            });
        }

        let succeeded = txn.compares.iter().all(|c| inner.compare(c));
        let ops = if succeeded { txn.success } else { txn.failure };

        let next_revision = inner.revision + 1;
        let mut events = Vec::new();
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            results.push(inner.execute(op, next_revision, &mut events));
        }

        if !events.is_empty() {
            inner.revision = next_revision;
            inner.publish(WatchResponse {
                revision: next_revision,
                events,
            });
        }

        Ok(TxnResponse {
            succeeded,
            revision: inner.revision,
            results,
        })
    }

    fn register_watch(&self, prefix: &str, from_revision: Revision) -> Result<WatchStream, StoreError> {
        let mut inner = self.inner.lock();
        let from = if from_revision == 0 {
            inner.revision + 1
        } else {
            from_revision
        };
        if from <= inner.compacted {
            return Err(StoreError::Compacted {
                requested: from,
                compacted: inner.compacted,
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for resp in inner.history.iter().filter(|r| r.revision >= from) {
            let _ = tx.send(filter_response(resp, prefix));
        }
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }
}

impl Inner {
    fn compare(&self, compare: &Compare) -> bool {
        match compare {
            Compare::Missing(key) => !self.data.contains_key(key),
            Compare::Exists(key) => self.data.contains_key(key),
            Compare::AnyExists(keys) => keys.iter().any(|k| self.data.contains_key(k)),
            Compare::ValueEquals(key, value) => {
                self.data.get(key).map(|kv| &kv.value == value).unwrap_or(false)
            }
            Compare::PrefixUnchangedSince(prefix, revision) => {
                if *revision < self.compacted {
                    // Deletes older than the history cannot be ruled out
                    return false;
                }
                !self
                    .history
                    .iter()
                    .filter(|r| r.revision > *revision)
                    .flat_map(|r| r.events.iter())
                    .any(|e| e.kv.key.starts_with(prefix.as_str()))
            }
        }
    }

    fn execute(&mut self, op: Op, revision: Revision, events: &mut Vec<WatchEvent>) -> OpResult {
        match op {
            Op::Get(key) => OpResult::Kvs(self.data.get(&key).cloned().into_iter().collect()),
            Op::Range(prefix) => {
                OpResult::Kvs(prefix_range(&self.data, &prefix).map(|(_, v)| v.clone()).collect())
            }
            Op::Count(prefix) => OpResult::Count(prefix_range(&self.data, &prefix).count()),
            Op::Put { key, value } => {
                let prev = self.data.get(&key).cloned();
                let kv = KeyValue {
                    key: key.clone(),
                    value,
                    create_revision: prev.as_ref().map(|p| p.create_revision).unwrap_or(revision),
                    mod_revision: revision,
                };
                self.data.insert(key, kv.clone());
                events.push(WatchEvent {
                    kind: if prev.is_some() {
                        EventKind::Update
                    } else {
                        EventKind::Create
                    },
                    kv,
                    prev,
                });
                OpResult::Written(1)
            }
            Op::Delete(key) => match self.data.remove(&key) {
                Some(prev) => {
                    events.push(delete_event(prev, revision));
                    OpResult::Written(1)
                }
                None => OpResult::Written(0),
            },
            Op::DeletePrefix(prefix) => {
                let keys: Vec<String> = prefix_range(&self.data, &prefix)
                    .map(|(k, _)| k.clone())
                    .collect();
                let deleted = keys.len();
                for key in keys {
                    if let Some(prev) = self.data.remove(&key) {
                        events.push(delete_event(prev, revision));
                    }
                }
                OpResult::Written(deleted)
            }
        }
    }

    fn publish(&mut self, resp: WatchResponse) {
        self.watchers
            .retain(|w| w.tx.send(filter_response(&resp, &w.prefix)).is_ok());

        self.history.push_back(resp);
        while self.history.len() > self.history_limit {
            if let Some(dropped) = self.history.pop_front() {
                self.compacted = dropped.revision;
            }
        }
    }
}

fn delete_event(prev: KeyValue, revision: Revision) -> WatchEvent {
    WatchEvent {
        kind: EventKind::Delete,
        kv: KeyValue {
            key: prev.key.clone(),
            value: Vec::new(),
            create_revision: 0,
            mod_revision: revision,
        },
        prev: Some(prev),
    }
}

fn prefix_range<'a>(
    data: &'a BTreeMap<String, KeyValue>,
    prefix: &'a str,
) -> impl Iterator<Item = (&'a String, &'a KeyValue)> + 'a {
    data.range(prefix.to_string()..)
        .take_while(move |(k, _)| k.starts_with(prefix))
}

fn filter_response(resp: &WatchResponse, prefix: &str) -> WatchResponse {
    WatchResponse {
        revision: resp.revision,
        events: resp
            .events
            .iter()
            .filter(|e| e.kv.key.starts_with(prefix))
            .cloned()
            .collect(),
    }
}

impl KvStore for InMemoryKv {
    fn txn(&self, txn: Txn) -> KvFuture<'_, TxnResponse> {
        Box::pin(async move { self.apply(txn) })
    }

    fn watch<'a>(&'a self, prefix: &'a str, from_revision: Revision) -> KvFuture<'a, WatchStream> {
        Box::pin(async move { self.register_watch(prefix, from_revision) })
    }

    fn revision(&self) -> KvFuture<'_, Revision> {
        Box::pin(async move { Ok(self.current_revision()) })
    }
}
