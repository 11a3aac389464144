//! In-process demo
//!
//! Two API nodes receive records for one export, a worker node reads the
//! statistics through every provider and runs one conditions sweep. The
//! closer moves swapped slices on in the background.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | RUST_LOG | info | Log filter |
//! | LOG_FORMAT | text | `json` for JSON lines |
//! | BUFFER_NODE_ID | test-node | Worker node ID |
//! | BUFFER_STATS_SYNC_INTERVAL_MS | 100 | Collector flush interval |
//! | BUFFER_CHECK_INTERVAL_MS | 200 | Conditions sweep interval |
//! | BUFFER_STATS_CACHE_TTL_MS | 50 | L2 cache TTL |

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use buffer_stats::clock::ProductionClock;
use buffer_stats::distribution::SingleNodeAssigner;
use buffer_stats::files::InMemoryFileManager;
use buffer_stats::kv::InMemoryKv;
use buffer_stats::model::{
    ByteSize, Column, Conditions, ExportBase, ExportKey, File, FileKey, Mapping, ObjectKey,
    ReceiverKey, Slice, SliceKey, StatsByType,
};
use buffer_stats::service::init_tracing;
use buffer_stats::{ApiNode, ProviderKind, ServiceConfig, ShutdownGroup, Store, WorkerNode};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut config = ServiceConfig::test();
    config.apply_env()?;

    let clock = ProductionClock::shared();
    let kv = Arc::new(InMemoryKv::new());
    let store = Store::new(kv.clone(), clock.clone(), config.store.clone());
    let files = Arc::new(InMemoryFileManager::new(clock.clone(), Duration::from_secs(3600 * 24)));
    let shutdown = ShutdownGroup::new();

    // Export with its first file and slice
    let now = clock.now();
    let export_key = ExportKey::new(ReceiverKey::new(123, "github"), "pull-requests");
    let mapping = Mapping {
        table_id: "in.c-github.pull_requests".to_string(),
        columns: vec![
            Column::Id {
                name: "id".to_string(),
            },
            Column::Body {
                name: "body".to_string(),
            },
        ],
    };
    let resource = files.create_resource("pull-requests")?;
    let file = File::new(FileKey::new(export_key.clone(), now), mapping.clone(), resource.clone());
    let slice = Slice::new(SliceKey::new(file.key.clone(), now), mapping.clone(), resource, 1);
    let base = ExportBase {
        key: export_key.clone(),
        name: "Pull Requests".to_string(),
        import_conditions: Conditions::default_import(),
        mapping,
    };
    store.create_export(&base, &file, &slice).await?;

    // Two API nodes
    let mut api1_config = config.api.clone();
    api1_config.node_id = "api-1".to_string();
    let mut api2_config = config.api.clone();
    api2_config.node_id = "api-2".to_string();
    let api1 = ApiNode::start(store.clone(), &api1_config, &shutdown);
    let api2 = ApiNode::start(store.clone(), &api2_config, &shutdown);

    for i in 0..3 {
        api1.write_record(&slice.key, &format!("{},\"opened\"", i), ByteSize(40)).await?;
    }
    for i in 3..5 {
        api2.write_record(&slice.key, &format!("{},\"merged\"", i), ByteSize(40)).await?;
    }
    api1.collector().sync().await;
    api2.collector().sync().await;

    // Worker node
    let worker = WorkerNode::start(
        store.clone(),
        &config.worker,
        Arc::new(SingleNodeAssigner),
        files.clone(),
        &shutdown,
    )
    .await?;
    let revision = store.kv().revision().await?;
    tokio::time::timeout(
        Duration::from_secs(5),
        worker.providers().l1_cache().wait_for_revision(revision),
    )
    .await??;

    let objects = [
        ObjectKey::Slice(slice.key.clone()),
        ObjectKey::File(file.key.clone()),
        ObjectKey::Export(export_key.clone()),
        ObjectKey::Receiver(export_key.receiver.clone()),
    ];
    for kind in [ProviderKind::Realtime, ProviderKind::L1, ProviderKind::L2] {
        let provider = worker.provider(kind);
        println!("--- {:?} provider ---", kind);
        for object in &objects {
            let stats = provider.object_stats(object).await?;
            print_stats(object, &stats);
        }
    }

    let report = worker.checker().check().await;
    println!("\nchecked {} opened slices, started {} tasks", report.checked, report.tasks.len());
    for task in report.tasks {
        task.await?;
    }

    shutdown.shutdown().await;
    println!("shutdown done, {} keys in the store", kv.len());
    Ok(())
}

fn print_stats(object: &ObjectKey, stats: &StatsByType) {
    let total = stats.aggregated_total;
    println!(
        "  {}: records={} size={} body={} in buffer={}",
        object,
        total.records_count,
        total.records_size,
        total.body_size,
        stats.aggregated_in_buffer.records_count
    );
}
