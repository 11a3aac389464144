//! Per-node statistics collector
//!
//! Counts received records per slice in memory and flushes changed counters
//! to the store. Flushed values are cumulative per node, so a failed flush is
//! repaired by any later one.

use crate::clock::UtcTime;
use crate::config::ApiConfig;
use crate::model::{ByteSize, SliceKey, SliceStats, Stats};
use crate::shutdown::ShutdownGroup;
use crate::store::Store;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

struct Entry {
    stats: Stats,
    changed: bool,
}

struct Inner {
    store: Store,
    node_id: String,
    entries: Mutex<HashMap<SliceKey, Entry>>,
    // Snapshots are taken under this lock so flushes cannot overtake each other
    sync_lock: tokio::sync::Mutex<()>,
    shutdown: ShutdownGroup,
}

#[derive(Clone)]
pub struct Collector {
    inner: Arc<Inner>,
}

impl Collector {
    /// Start the collector and its periodic sync.
    pub fn start(store: Store, config: &ApiConfig, shutdown: &ShutdownGroup) -> Self {
        let collector = Collector {
            inner: Arc::new(Inner {
                store: store.with_stats_per_txn(config.max_stats_per_txn),
                node_id: config.node_id.clone(),
                entries: Mutex::new(HashMap::new()),
                sync_lock: tokio::sync::Mutex::new(()),
                shutdown: shutdown.child(),
            }),
        };

        let period = config.statistics_sync_interval;
        let ticker_collector = collector.clone();
        let group = collector.inner.shutdown.clone();
        collector.inner.shutdown.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = group.cancelled() => {
                        info!("stats collector: received shutdown request");
                        ticker_collector.sync().await;
                        info!("stats collector: shutdown done");
                        return;
                    }
                    _ = ticker.tick() => ticker_collector.sync().await,
                }
            }
        });
        collector
    }

    /// Count one received record, never touches the store.
    pub fn notify(
        &self,
        slice_key: &SliceKey,
        received_at: UtcTime,
        record_size: ByteSize,
        body_size: ByteSize,
    ) {
        let received = Stats {
            last_record_at: received_at,
            records_count: 1,
            records_size: record_size,
            body_size,
            ..Default::default()
        };

        let mut entries = self.inner.entries.lock();
        match entries.get_mut(slice_key) {
            Some(entry) => {
                entry.stats += received;
                entry.changed = true;
            }
            None => {
                entries.insert(
                    slice_key.clone(),
                    Entry {
                        stats: received,
                        changed: true,
                    },
                );
            }
        }
    }

    /// Flush changed counters in the background.
    ///
    /// The returned future resolves when the flush is done, it does not have
    /// to be awaited.
    pub fn sync(&self) -> impl Future<Output = ()> + Send + 'static {
        let inner = self.inner.clone();
        let handle = self.inner.shutdown.spawn(async move { inner.sync_now().await });
        async move {
            if let Err(err) = handle.await {
                error!(error = %err, "stats collector: sync task failed");
            }
        }
    }

    /// Number of slices with counters not yet flushed.
    pub fn pending(&self) -> usize {
        self.inner.entries.lock().values().filter(|e| e.changed).count()
    }

    pub async fn close(&self) {
        self.inner.shutdown.shutdown().await;
    }
}

impl Inner {
    async fn sync_now(&self) {
        let _guard = self.sync_lock.lock().await;

        let batch: Vec<SliceStats> = self
            .entries
            .lock()
            .iter_mut()
            .filter(|(_, entry)| entry.changed)
            .map(|(key, entry)| {
                entry.changed = false;
                SliceStats {
                    slice_key: key.clone(),
                    stats: entry.stats,
                }
            })
            .collect();
        if batch.is_empty() {
            return;
        }

        let count = batch.len();
        let keys: Vec<SliceKey> = batch.iter().map(|s| s.slice_key.clone()).collect();
        match self.store.update_slice_received_stats(&self.node_id, batch).await {
            Ok(()) => debug!(slices = count, "stats collector: synced"),
            Err(err) => {
                warn!(error = %err, slices = count, "stats collector: cannot sync, retrying with the next sync");
                let mut entries = self.entries.lock();
                for key in &keys {
                    if let Some(entry) = entries.get_mut(key) {
                        entry.changed = true;
                    }
                }
            }
        }
    }
}
