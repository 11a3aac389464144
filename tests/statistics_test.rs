//! Statistics pipeline tests
//!
//! Collectors on several API nodes flush into the store, the providers must
//! agree on the merged totals for every object level and every category.

use buffer_stats::clock::{Clock, SimulatedClock};
use buffer_stats::config::{ApiConfig, StoreConfig};
use buffer_stats::kv::{InMemoryKv, KvStore};
use buffer_stats::model::{
    ByteSize, Column, Conditions, ExportBase, ExportKey, File, FileKey, Mapping, ObjectKey,
    ReceiverKey, Slice, SliceKey, SliceState, StatsByType, StorageResource, UploadCredentials,
};
use buffer_stats::schema::Schema;
use buffer_stats::statistics::{Collector, Providers};
use buffer_stats::{Error, ProviderKind, ShutdownGroup, Store};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::Duration;

struct Env {
    kv: InMemoryKv,
    clock: SimulatedClock,
    store: Store,
}

fn env() -> Env {
    let kv = InMemoryKv::new();
    let clock = SimulatedClock::at("2000-01-01T01:00:00Z");
    let store = Store::new(Arc::new(kv.clone()), clock.shared(), StoreConfig::default());
    Env { kv, clock, store }
}

fn mapping() -> Mapping {
    Mapping {
        table_id: "in.c-bucket.table".to_string(),
        columns: vec![Column::Body {
            name: "body".to_string(),
        }],
    }
}

fn resource(env: &Env) -> StorageResource {
    StorageResource {
        id: 1,
        name: "file1".to_string(),
        credentials: UploadCredentials::S3 {
            expiration: env.clock.now() + Duration::from_secs(24 * 3600),
        },
    }
}

async fn create_export(env: &Env, receiver: &str, export: &str) -> (File, Slice) {
    let now = env.clock.now();
    let key = ExportKey::new(ReceiverKey::new(123, receiver), export);
    let file = File::new(FileKey::new(key.clone(), now), mapping(), resource(env));
    let slice = Slice::new(SliceKey::new(file.key.clone(), now), mapping(), resource(env), 1);
    let base = ExportBase {
        key,
        name: export.to_string(),
        import_conditions: Conditions::default_import(),
        mapping: mapping(),
    };
    env.store.create_export(&base, &file, &slice).await.unwrap();
    (file, slice)
}

fn api_config(node_id: &str) -> ApiConfig {
    ApiConfig {
        node_id: node_id.to_string(),
        statistics_sync_interval: Duration::from_secs(3600),
        max_stats_per_txn: 50,
    }
}

async fn all_providers(env: &Env, providers: &Providers, key: &ObjectKey) -> StatsByType {
    let revision = env.kv.revision().await.unwrap();
    providers.l1_cache().wait_for_revision(revision).await.unwrap();
    providers.l2_cache().clear_cache();

    let realtime = providers.get(ProviderKind::Realtime).object_stats(key).await.unwrap();
    let l1 = providers.get(ProviderKind::L1).object_stats(key).await.unwrap();
    let l2 = providers.get(ProviderKind::L2).object_stats(key).await.unwrap();
    assert_eq!(realtime, l1, "realtime and L1 differ for {}", key);
    assert_eq!(realtime, l2, "realtime and L2 differ for {}", key);
    realtime
}

// =============================================================================
// Merge commutativity, 20 seeds
// =============================================================================

#[tokio::test]
async fn test_merge_is_order_independent() {
    for seed in 0..20u64 {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let env = env();
        let (_, slice) = create_export(&env, "my-receiver", "my-export").await;
        let shutdown = ShutdownGroup::new();

        let nodes = rng.gen_range(2..=4);
        let collectors: Vec<Collector> = (0..nodes)
            .map(|i| Collector::start(env.store.clone(), &api_config(&format!("node-{}", i)), &shutdown))
            .collect();

        let records = rng.gen_range(10..60u64);
        let mut expected_size = 0;
        let mut expected_body = 0;
        let mut last_record_at = env.clock.now();
        for _ in 0..records {
            let node = rng.gen_range(0..nodes);
            let size = rng.gen_range(1..500u64);
            let body = size + rng.gen_range(0..100u64);
            let received_at = env.clock.now() + Duration::from_millis(rng.gen_range(0..10_000));
            last_record_at = last_record_at.max(received_at);
            expected_size += size;
            expected_body += body;
            collectors[node].notify(&slice.key, received_at, ByteSize(size), ByteSize(body));

            // Random interleaving of flushes
            if rng.gen_bool(0.2) {
                collectors[rng.gen_range(0..nodes)].sync().await;
            }
        }
        for i in (0..nodes).rev() {
            collectors[i].sync().await;
        }

        let stats = env.store.get_received_stats_by_slice(&slice.key).await.unwrap();
        assert_eq!(stats.records_count, records, "seed {}", seed);
        assert_eq!(stats.records_size, ByteSize(expected_size), "seed {}", seed);
        assert_eq!(stats.body_size, ByteSize(expected_body), "seed {}", seed);
        assert_eq!(stats.last_record_at, last_record_at, "seed {}", seed);

        shutdown.shutdown().await;
    }
}

// =============================================================================
// Prefix containment and provider agreement
// =============================================================================

#[tokio::test]
async fn test_prefix_containment() {
    let env = env();
    let shutdown = ShutdownGroup::new();
    let (file1, slice1) = create_export(&env, "my-receiver", "export-1").await;
    let (_, other) = create_export(&env, "my-receiver", "export-2").await;
    let (_, foreign) = create_export(&env, "other-receiver", "export-1").await;
    let providers = Providers::start(env.store.kv().clone(), Duration::from_secs(3600), &shutdown)
        .await
        .unwrap();

    // Second slice of the first file
    env.clock.advance(Duration::from_secs(1));
    let (_, slice2) = env.store.swap_slice(&slice1).await.unwrap();

    let collector = Collector::start(env.store.clone(), &api_config("node-1"), &shutdown);
    let now = env.clock.now();
    collector.notify(&slice1.key, now, ByteSize(10), ByteSize(10));
    collector.notify(&slice2.key, now, ByteSize(20), ByteSize(20));
    collector.notify(&slice2.key, now, ByteSize(20), ByteSize(20));
    collector.notify(&other.key, now, ByteSize(40), ByteSize(40));
    collector.notify(&foreign.key, now, ByteSize(80), ByteSize(80));
    collector.sync().await;

    let slice1_stats = all_providers(&env, &providers, &ObjectKey::Slice(slice1.key.clone())).await;
    let slice2_stats = all_providers(&env, &providers, &ObjectKey::Slice(slice2.key.clone())).await;
    let file_stats = all_providers(&env, &providers, &ObjectKey::File(file1.key.clone())).await;
    let export_stats =
        all_providers(&env, &providers, &ObjectKey::Export(slice1.key.export_key().clone())).await;
    let receiver_stats =
        all_providers(&env, &providers, &ObjectKey::Receiver(slice1.key.receiver_key().clone())).await;

    assert_eq!(slice1_stats.aggregated_total.records_count, 1);
    assert_eq!(slice2_stats.aggregated_total.records_count, 2);
    assert_eq!(
        file_stats.aggregated_total.records_size,
        slice1_stats.aggregated_total.records_size + slice2_stats.aggregated_total.records_size
    );
    // The sibling export with a common name prefix is not included
    assert_eq!(export_stats.aggregated_total.records_size, ByteSize(50));
    assert_eq!(receiver_stats.aggregated_total.records_size, ByteSize(90));
    assert_eq!(receiver_stats.aggregated_in_buffer, receiver_stats.aggregated_total);

    shutdown.shutdown().await;
}

// =============================================================================
// Category exclusivity and idempotent transitions
// =============================================================================

#[tokio::test]
async fn test_slice_stats_move_to_uploading() {
    let env = env();
    let shutdown = ShutdownGroup::new();
    let (_, slice) = create_export(&env, "my-receiver", "my-export").await;
    let providers = Providers::start(env.store.kv().clone(), Duration::from_secs(3600), &shutdown)
        .await
        .unwrap();

    let node1 = Collector::start(env.store.clone(), &api_config("node-1"), &shutdown);
    let node2 = Collector::start(env.store.clone(), &api_config("node-2"), &shutdown);
    let now = env.clock.now();
    node1.notify(&slice.key, now, ByteSize(10), ByteSize(11));
    node2.notify(&slice.key, now, ByteSize(20), ByteSize(22));
    node1.sync().await;
    node2.sync().await;

    let key = ObjectKey::Slice(slice.key.clone());
    let before = all_providers(&env, &providers, &key).await;
    assert_eq!(before.opened.records_count, 2);
    assert_eq!(before.opened.records_size, ByteSize(30));
    assert_eq!(before.opened.body_size, ByteSize(33));
    assert_eq!(env.kv.keys(&Schema::stats_in_object(SliceState::Writing.stats_category(), &key)).len(), 2);

    env.clock.advance(Duration::from_secs(1));
    let (closing, _) = env.store.swap_slice(&slice).await.unwrap();
    let uploading = env.store.close_slice(&closing).await.unwrap();
    assert!(uploading.is_empty);

    let after = all_providers(&env, &providers, &key).await;
    assert_eq!(after.opened, Default::default());
    assert_eq!(after.uploading, before.opened);
    assert_eq!(after.aggregated_total, before.aggregated_total);

    let keys = env.kv.keys("stats/");
    assert_eq!(
        keys,
        vec![Schema::slice_stats_nodes_sum(SliceState::Uploading.stats_category(), &slice.key)]
    );

    // Second attempt fails, nothing changes
    let err = env.store.close_slice(&closing).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyInState { .. }));
    assert_eq!(all_providers(&env, &providers, &key).await, after);

    // Late flush of a closed slice is dropped
    node1.notify(&slice.key, now, ByteSize(5), ByteSize(5));
    node1.sync().await;
    assert_eq!(env.kv.keys("stats/"), keys);

    shutdown.shutdown().await;
}

// =============================================================================
// Cache convergence under restarts
// =============================================================================

#[tokio::test]
async fn test_l1_survives_watch_restart() {
    let env = env();
    let shutdown = ShutdownGroup::new();
    let (_, slice) = create_export(&env, "my-receiver", "my-export").await;
    let providers = Providers::start(env.store.kv().clone(), Duration::from_secs(3600), &shutdown)
        .await
        .unwrap();
    let collector = Collector::start(env.store.clone(), &api_config("node-1"), &shutdown);
    let key = ObjectKey::Slice(slice.key.clone());

    collector.notify(&slice.key, env.clock.now(), ByteSize(1), ByteSize(1));
    collector.sync().await;
    assert_eq!(all_providers(&env, &providers, &key).await.opened.records_count, 1);

    // Resume after a closed stream, then reload after compaction
    env.kv.disconnect_watchers();
    collector.notify(&slice.key, env.clock.now(), ByteSize(1), ByteSize(1));
    collector.sync().await;
    assert_eq!(all_providers(&env, &providers, &key).await.opened.records_count, 2);

    env.kv.compact();
    env.kv.disconnect_watchers();
    collector.notify(&slice.key, env.clock.now(), ByteSize(1), ByteSize(1));
    collector.sync().await;
    assert_eq!(all_providers(&env, &providers, &key).await.opened.records_count, 3);

    shutdown.shutdown().await;
}
