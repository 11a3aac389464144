//! Conditions checker tests
//!
//! API nodes write records, worker nodes read the statistics through the
//! cached providers and close slices and files. Closing slices move on to
//! uploading in the background.

use buffer_stats::clock::{Clock, SimulatedClock};
use buffer_stats::config::{ServiceConfig, StoreConfig, WorkerConfig};
use buffer_stats::distribution::{HashRingAssigner, SharedAssigner, SingleNodeAssigner};
use buffer_stats::files::InMemoryFileManager;
use buffer_stats::kv::{InMemoryKv, KvStore};
use buffer_stats::model::{
    ByteSize, Column, Conditions, ExportBase, ExportKey, File, FileKey, FileState, Mapping,
    ObjectKey, ReceiverKey, Slice, SliceKey, SliceState, StatsCategory,
};
use buffer_stats::schema::Schema;
use buffer_stats::task::{TASK_SLICE_CLOSE, TASK_SLICE_CLOSING};
use buffer_stats::{ApiNode, ProviderKind, ShutdownGroup, Store, WorkerNode};
use std::sync::Arc;
use std::time::Duration;

struct Env {
    kv: InMemoryKv,
    clock: SimulatedClock,
    store: Store,
    files: Arc<InMemoryFileManager>,
    shutdown: ShutdownGroup,
}

fn env() -> Env {
    let kv = InMemoryKv::new();
    let clock = SimulatedClock::at("2000-01-01T01:00:00Z");
    let store = Store::new(Arc::new(kv.clone()), clock.shared(), StoreConfig::default());
    let files = Arc::new(InMemoryFileManager::new(clock.shared(), Duration::from_secs(24 * 3600)));
    Env {
        kv,
        clock,
        store,
        files,
        shutdown: ShutdownGroup::new(),
    }
}

async fn create_export(env: &Env, receiver: &str, upload_count: u64) -> (File, Slice) {
    let now = env.clock.now();
    let mapping = Mapping {
        table_id: "in.c-bucket.table".to_string(),
        columns: vec![Column::Body {
            name: "body".to_string(),
        }],
    };
    let key = ExportKey::new(ReceiverKey::new(123, receiver), "my-export");
    let resource = env.files.create_resource(receiver).unwrap();
    let file = File::new(FileKey::new(key.clone(), now), mapping.clone(), resource.clone());
    let slice = Slice::new(SliceKey::new(file.key.clone(), now), mapping.clone(), resource, 1);
    let base = ExportBase {
        key,
        name: "My Export".to_string(),
        import_conditions: Conditions {
            count: upload_count * 10,
            ..Conditions::default_import()
        },
        mapping,
    };
    env.store.create_export(&base, &file, &slice).await.unwrap();
    (file, slice)
}

fn worker_config(node_id: &str, provider: ProviderKind) -> WorkerConfig {
    let mut config = WorkerConfig::test();
    config.node_id = node_id.to_string();
    config.check_conditions_interval = Duration::from_secs(3600);
    config.upload_conditions.count = 5;
    config.provider = provider;
    // Closing slices stay in place unless a test enables the closer
    config.close_slices = false;
    config.close_files = false;
    config
}

async fn start_worker(env: &Env, config: &WorkerConfig, assigner: SharedAssigner) -> WorkerNode {
    WorkerNode::start(env.store.clone(), config, assigner, env.files.clone(), &env.shutdown)
        .await
        .unwrap()
}

async fn write_records(env: &Env, api: &ApiNode, slice: &Slice, n: usize) {
    for i in 0..n {
        api.write_record(&slice.key, &format!("row-{}", i), ByteSize(10)).await.unwrap();
        env.clock.advance(Duration::from_millis(1));
    }
    api.collector().sync().await;
}

#[tokio::test]
async fn test_upload_through_cached_provider() {
    let env = env();
    let (file, slice) = create_export(&env, "my-receiver", 5).await;
    let mut api_config = ServiceConfig::test().api;
    api_config.statistics_sync_interval = Duration::from_secs(3600);
    let api = ApiNode::start(env.store.clone(), &api_config, &env.shutdown);
    let worker = start_worker(&env, &worker_config("w1", ProviderKind::L2), Arc::new(SingleNodeAssigner)).await;

    write_records(&env, &api, &slice, 4).await;
    let revision = env.kv.revision().await.unwrap();
    worker.providers().l1_cache().wait_for_revision(revision).await.unwrap();
    let report = worker.checker().check().await;
    assert_eq!(report.checked, 1);
    assert!(report.tasks.is_empty());

    write_records(&env, &api, &slice, 1).await;
    let revision = env.kv.revision().await.unwrap();
    worker.providers().l1_cache().wait_for_revision(revision).await.unwrap();
    // L2 still serves the old value until cleared
    worker.providers().l2_cache().clear_cache();

    let report = worker.checker().check().await;
    assert_eq!(report.tasks.len(), 1);
    for task in report.tasks {
        task.await.unwrap();
    }

    let closing = env.store.get_slice(SliceState::Closing, &slice.key).await.unwrap();
    let uploading = env.store.close_slice(&closing).await.unwrap();
    assert_eq!(uploading.statistics.map(|s| s.records_count), Some(5));
    assert_eq!(uploading.id_range.map(|r| (r.start, r.count)), Some((1, 5)));
    env.store.get_file(FileState::Opened, &file.key).await.unwrap();

    let tasks = env.store.list_tasks(slice.key.export_key()).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].key.task_type, TASK_SLICE_CLOSING);
    assert_eq!(tasks[0].worker_node, "w1");

    env.shutdown.shutdown().await;
}

#[tokio::test]
async fn test_receivers_are_partitioned() {
    let env = env();
    let receivers: Vec<String> = (0..8).map(|i| format!("receiver-{}", i)).collect();
    let mut slices = Vec::new();
    for receiver in &receivers {
        slices.push(create_export(&env, receiver, 5).await.1);
    }

    let nodes = vec!["w1".to_string(), "w2".to_string()];
    let mut workers = Vec::new();
    for node in &nodes {
        let assigner = Arc::new(HashRingAssigner::new(node.clone(), &nodes));
        let config = worker_config(node, ProviderKind::Realtime);
        workers.push(start_worker(&env, &config, assigner).await);
    }

    let api = ApiNode::start(env.store.clone(), &ServiceConfig::test().api, &env.shutdown);
    for slice in &slices {
        write_records(&env, &api, slice, 5).await;
    }
    env.clock.advance(Duration::from_secs(1));

    let mut checked = 0;
    let mut started = 0;
    for worker in &workers {
        let report = worker.checker().check().await;
        checked += report.checked;
        started += report.tasks.len();
        for task in report.tasks {
            task.await.unwrap();
        }
    }
    assert_eq!(checked, receivers.len());
    assert_eq!(started, receivers.len());

    for slice in &slices {
        env.store.get_slice(SliceState::Closing, &slice.key).await.unwrap();
    }

    env.shutdown.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_background_sweep_closes_file() {
    let env = env();
    let (file, slice) = create_export(&env, "my-receiver", 100).await;
    let mut config = worker_config("w1", ProviderKind::Realtime);
    config.check_conditions_interval = Duration::from_millis(200);
    let _worker = start_worker(&env, &config, Arc::new(SingleNodeAssigner)).await;

    // Credentials are valid for 24h, the window is 1h
    env.clock.advance(Duration::from_secs(23 * 3600 + 1));
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut closed = None;
    for _ in 0..50 {
        if let Ok(f) = env.store.get_file(FileState::Closing, &file.key).await {
            closed = Some(f);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(closed.is_some());
    env.store.get_slice(SliceState::Closing, &slice.key).await.unwrap();

    env.shutdown.shutdown().await;
}

#[tokio::test]
async fn test_closing_slice_reaches_uploading() {
    let env = env();
    let (file, slice) = create_export(&env, "my-receiver", 5).await;
    let mut config = worker_config("w1", ProviderKind::Realtime);
    config.close_slices = true;
    config.close_files = true;
    let worker = start_worker(&env, &config, Arc::new(SingleNodeAssigner)).await;

    let api = ApiNode::start(env.store.clone(), &ServiceConfig::test().api, &env.shutdown);
    write_records(&env, &api, &slice, 5).await;
    env.clock.advance(Duration::from_secs(1));

    let report = worker.checker().check().await;
    assert_eq!(report.tasks.len(), 1);
    for task in report.tasks {
        task.await.unwrap();
    }

    let mut uploading = None;
    for _ in 0..300 {
        if let Ok(found) = env.store.get_slice(SliceState::Uploading, &slice.key).await {
            uploading = Some(found);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let uploading = uploading.expect("slice reaches uploading");
    assert_eq!(uploading.statistics.map(|s| s.records_count), Some(5));
    assert_eq!(uploading.id_range.map(|r| (r.start, r.count)), Some((1, 5)));

    let object = ObjectKey::Slice(slice.key.clone());
    assert_eq!(
        env.kv.keys(&Schema::stats_in_object(StatsCategory::Uploading, &object)),
        vec![Schema::slice_stats_nodes_sum(StatsCategory::Uploading, &slice.key)]
    );
    assert!(env
        .kv
        .keys(&Schema::stats_in_object(StatsCategory::Opened, &object))
        .is_empty());

    // The file is still opened, only its first slice moved on
    env.store.get_file(FileState::Opened, &file.key).await.unwrap();

    let tasks = env.store.list_tasks(slice.key.export_key()).await.unwrap();
    let close = tasks
        .iter()
        .find(|t| t.key.task_type == TASK_SLICE_CLOSE)
        .expect("slice close task");
    assert_eq!(close.result.as_deref(), Some("slice closed"));
    assert_eq!(close.worker_node, "w1");

    env.shutdown.shutdown().await;
}
