//! Watched in-memory mirror of the stats key-space
//!
//! The mirror keeps one ordered map per category, keyed by the object key
//! relative to the category prefix. Every committed batch of events produces
//! a new immutable snapshot which is published at once, so an aggregation
//! never mixes two revisions. Only the maps of touched categories are copied.

use crate::error::{Error, Result, StoreError};
use crate::kv::{EventKind, KeyValue, Revision, SharedKv, WatchConsumer, WatchUpdate};
use crate::model::{ObjectKey, Stats, StatsByType, StatsCategory};
use crate::schema::STATS;
use crate::shutdown::ShutdownGroup;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

type CategoryMap = BTreeMap<String, Stats>;

struct Snapshot {
    revision: Revision,
    categories: [Arc<CategoryMap>; 5],
}

impl Snapshot {
    fn empty() -> Self {
        Snapshot {
            revision: 0,
            categories: Default::default(),
        }
    }

    fn sum(&self, category: StatsCategory, prefix: &str) -> Stats {
        self.categories[category.index()]
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, stats)| *stats)
            .sum()
    }
}

struct Inner {
    current: ArcSwap<Snapshot>,
    apply_lock: Mutex<()>,
    revision: watch::Sender<Revision>,
    shutdown: ShutdownGroup,
}

#[derive(Clone)]
pub struct L1Cache {
    inner: Arc<Inner>,
}

impl L1Cache {
    /// Load the stats key-space and keep it in sync.
    ///
    /// Returns after the initial snapshot is loaded, a load failure is returned.
    pub async fn start(kv: SharedKv, shutdown: &ShutdownGroup) -> Result<Self> {
        let (revision, _) = watch::channel(0);
        let inner = Arc::new(Inner {
            current: ArcSwap::from_pointee(Snapshot::empty()),
            apply_lock: Mutex::new(()),
            revision,
            shutdown: shutdown.child(),
        });

        let target = inner.clone();
        let started = WatchConsumer::new(kv, STATS, "stats cache")
            .start(&inner.shutdown, move |update| {
                target.apply(update);
                std::future::ready(())
            })
            .await;
        if let Err(err) = started {
            inner.shutdown.shutdown().await;
            return Err(err);
        }
        Ok(L1Cache { inner })
    }

    /// Last revision applied to the mirror.
    pub fn revision(&self) -> Revision {
        self.inner.current.load().revision
    }

    /// Wait until the mirror has applied the revision.
    pub async fn wait_for_revision(&self, revision: Revision) -> Result<()> {
        let mut rx = self.inner.revision.subscribe();
        rx.wait_for(|applied| *applied >= revision)
            .await
            .map(|_| ())
            .map_err(|_| Error::Store(StoreError::Unavailable("stats cache is closed".to_string())))
    }

    /// Aggregate from memory, all categories are read from the same snapshot.
    pub fn object_stats(&self, key: &ObjectKey) -> StatsByType {
        let snapshot = self.inner.current.load();
        let prefix = format!("{}/", key);
        let mut out = StatsByType::default();
        for category in StatsCategory::ALL {
            out.add(category, snapshot.sum(category, &prefix));
        }
        out
    }

    pub async fn close(&self) {
        self.inner.shutdown.shutdown().await;
    }
}

impl Inner {
    fn apply(&self, update: WatchUpdate) {
        let _guard = self.apply_lock.lock();
        let revision = update.revision();

        let next = match update {
            WatchUpdate::Snapshot { kvs, restart, .. } => {
                let mut categories: [CategoryMap; 5] = Default::default();
                for kv in &kvs {
                    if let Some((category, key)) = relative_key(&kv.key) {
                        if let Some(stats) = decode(kv) {
                            categories[category.index()].insert(key.to_string(), stats);
                        }
                    }
                }
                if restart {
                    info!(revision, "stats cache: reloaded");
                }
                Snapshot {
                    revision,
                    categories: categories.map(Arc::new),
                }
            }
            WatchUpdate::Events { events, .. } => {
                let mut categories = self.current.load().categories.clone();
                for event in &events {
                    let Some((category, key)) = relative_key(&event.kv.key) else {
                        continue;
                    };
                    let map = Arc::make_mut(&mut categories[category.index()]);
                    match event.kind {
                        EventKind::Delete => {
                            map.remove(key);
                        }
                        EventKind::Create | EventKind::Update => {
                            if let Some(stats) = decode(&event.kv) {
                                map.insert(key.to_string(), stats);
                            }
                        }
                    }
                }
                Snapshot {
                    revision,
                    categories,
                }
            }
        };

        self.current.store(Arc::new(next));
        self.revision.send_replace(revision);
    }
}

fn relative_key(key: &str) -> Option<(StatsCategory, &str)> {
    StatsCategory::from_relative_key(key.strip_prefix(STATS)?)
}

fn decode(kv: &KeyValue) -> Option<Stats> {
    match kv.decode() {
        Ok(stats) => Some(stats),
        Err(err) => {
            warn!(error = %err, "stats cache: skipping invalid value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::UtcTime;
    use crate::kv::{encode, InMemoryKv, KvStore, Op, SimulatedKv, SimulatedKvConfig, Txn};
    use crate::model::{ByteSize, ExportKey, FileKey, ReceiverKey, SliceKey};
    use crate::schema::Schema;

    fn slice_key(export: &str, slice_at: &str) -> SliceKey {
        let export = ExportKey::new(ReceiverKey::new(123, "my-receiver"), export);
        let file = FileKey::new(export, UtcTime::parse("2000-01-01T01:00:00Z").unwrap());
        SliceKey::new(file, UtcTime::parse(slice_at).unwrap())
    }

    fn stats(count: u64, size: u64) -> Stats {
        Stats {
            records_count: count,
            records_size: ByteSize(size),
            ..Default::default()
        }
    }

    async fn put(kv: &InMemoryKv, key: String, value: Stats) -> Revision {
        kv.txn(Txn::new().then(Op::put(key, encode(&value).unwrap())))
            .await
            .unwrap()
            .revision
    }

    #[tokio::test]
    async fn test_snapshot_and_events() {
        let kv = InMemoryKv::new();
        let s1 = slice_key("my-export", "2000-01-01T01:00:00Z");
        let s2 = slice_key("my-export", "2000-01-01T02:00:00Z");
        put(&kv, Schema::slice_stats_per_node(StatsCategory::Opened, &s1, "node-1"), stats(1, 10)).await;

        let shutdown = ShutdownGroup::new();
        let cache = L1Cache::start(Arc::new(kv.clone()), &shutdown).await.unwrap();
        let file = ObjectKey::File(s1.file_key().clone());
        assert_eq!(cache.object_stats(&file).opened, stats(1, 10));

        put(&kv, Schema::slice_stats_nodes_sum(StatsCategory::Uploaded, &s2), stats(5, 50)).await;
        let rev = put(&kv, Schema::slice_stats_per_node(StatsCategory::Opened, &s1, "node-2"), stats(2, 20)).await;
        cache.wait_for_revision(rev).await.unwrap();
        assert_eq!(cache.revision(), rev);

        let by_file = cache.object_stats(&file);
        assert_eq!(by_file.opened, stats(3, 30));
        assert_eq!(by_file.uploaded, stats(5, 50));
        assert_eq!(by_file.aggregated_in_buffer, stats(3, 30));
        assert_eq!(by_file.aggregated_total, stats(8, 80));
        assert_eq!(cache.object_stats(&ObjectKey::Slice(s2)).opened, Stats::default());

        let rev = kv
            .txn(Txn::new().then(Op::DeletePrefix(Schema::stats_in_category(StatsCategory::Opened))))
            .await
            .unwrap()
            .revision;
        cache.wait_for_revision(rev).await.unwrap();
        assert_eq!(cache.object_stats(&file).aggregated_total, stats(5, 50));

        shutdown.shutdown().await;
    }

    #[tokio::test]
    async fn test_sibling_prefix_is_not_matched() {
        let kv = InMemoryKv::new();
        let a = slice_key("export", "2000-01-01T01:00:00Z");
        let b = slice_key("export-2", "2000-01-01T01:00:00Z");
        put(&kv, Schema::slice_stats_per_node(StatsCategory::Opened, &a, "n"), stats(1, 1)).await;
        put(&kv, Schema::slice_stats_per_node(StatsCategory::Opened, &b, "n"), stats(7, 7)).await;

        let shutdown = ShutdownGroup::new();
        let cache = L1Cache::start(Arc::new(kv.clone()), &shutdown).await.unwrap();
        let export = ObjectKey::Export(a.export_key().clone());
        assert_eq!(cache.object_stats(&export).aggregated_total, stats(1, 1));
        let receiver = ObjectKey::Receiver(a.receiver_key().clone());
        assert_eq!(cache.object_stats(&receiver).aggregated_total, stats(8, 8));
        shutdown.shutdown().await;
    }

    #[tokio::test]
    async fn test_snapshot_is_not_torn() {
        let kv = InMemoryKv::new();
        let s = slice_key("my-export", "2000-01-01T01:00:00Z");
        let per_node = Schema::slice_stats_per_node(StatsCategory::Opened, &s, "node-1");
        put(&kv, per_node.clone(), stats(4, 40)).await;

        let shutdown = ShutdownGroup::new();
        let cache = L1Cache::start(Arc::new(kv.clone()), &shutdown).await.unwrap();

        // Move between categories in one transaction
        let rev = kv
            .txn(
                Txn::new()
                    .then(Op::put(
                        Schema::slice_stats_nodes_sum(StatsCategory::Uploading, &s),
                        encode(&stats(4, 40)).unwrap(),
                    ))
                    .then(Op::Delete(per_node)),
            )
            .await
            .unwrap()
            .revision;
        cache.wait_for_revision(rev).await.unwrap();

        let by_slice = cache.object_stats(&ObjectKey::Slice(s));
        assert_eq!(by_slice.opened, Stats::default());
        assert_eq!(by_slice.uploading, stats(4, 40));
        assert_eq!(by_slice.aggregated_total, stats(4, 40));
        shutdown.shutdown().await;
    }

    #[tokio::test]
    async fn test_revision_follows_other_writes() {
        let kv = InMemoryKv::new();
        let shutdown = ShutdownGroup::new();
        let cache = L1Cache::start(Arc::new(kv.clone()), &shutdown).await.unwrap();

        // Nothing under the stats prefix
        let rev = kv
            .txn(Txn::new().then(Op::put("file/x", b"{}".to_vec())))
            .await
            .unwrap()
            .revision;
        assert_eq!(rev, 1);
        tokio::time::timeout(std::time::Duration::from_secs(2), cache.wait_for_revision(rev))
            .await
            .expect("cache revision follows the store")
            .unwrap();
        assert_eq!(cache.revision(), rev);
        assert_eq!(
            cache.object_stats(&ObjectKey::Slice(slice_key("my-export", "2000-01-01T01:00:00Z"))),
            StatsByType::default()
        );

        shutdown.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_fails_on_store_error() {
        let simulated = SimulatedKv::new(
            Arc::new(InMemoryKv::new()),
            1,
            SimulatedKvConfig {
                read_fail_prob: 1.0,
                ..SimulatedKvConfig::no_faults()
            },
        );
        let shutdown = ShutdownGroup::new();
        assert!(L1Cache::start(Arc::new(simulated), &shutdown).await.is_err());
        shutdown.shutdown().await;
    }
}
