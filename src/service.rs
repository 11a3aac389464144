//! Node assembly
//!
//! An API node buffers records and counts them in a collector. A worker node
//! runs the stats providers, the conditions checker and the closer. Both
//! register their loops in the shutdown group passed in.

use crate::conditions::{Checker, Closer};
use crate::config::{ApiConfig, ProviderKind, WorkerConfig};
use crate::distribution::SharedAssigner;
use crate::error::Result;
use crate::files::SharedFileManager;
use crate::model::{ByteSize, RecordKey, SliceKey};
use crate::shutdown::ShutdownGroup;
use crate::statistics::{Collector, Provider, Providers};
use crate::store::Store;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Initialize logging, `RUST_LOG` filter (default `info`), `LOG_FORMAT=json`
/// for JSON lines.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

pub struct ApiNode {
    store: Store,
    collector: Collector,
}

impl ApiNode {
    pub fn start(store: Store, config: &ApiConfig, shutdown: &ShutdownGroup) -> Self {
        let collector = Collector::start(store.clone(), config, shutdown);
        info!(node = %config.node_id, "api node: started");
        ApiNode { store, collector }
    }

    /// Buffer one row of the slice and count it.
    pub async fn write_record(&self, slice_key: &SliceKey, row: &str, body_size: ByteSize) -> Result<()> {
        let received_at = self.store.clock().now();
        let key = RecordKey::new(slice_key.clone(), received_at);
        self.store.create_record(&key, row).await?;
        self.collector
            .notify(slice_key, received_at, ByteSize(row.len() as u64), body_size);
        Ok(())
    }

    pub fn collector(&self) -> &Collector {
        &self.collector
    }
}

pub struct WorkerNode {
    providers: Providers,
    checker: Checker,
    closer: Closer,
}

impl WorkerNode {
    /// Load the stats mirror, the checker and the closer mirrors, fails if any
    /// cannot be loaded.
    pub async fn start(
        store: Store,
        config: &WorkerConfig,
        assigner: SharedAssigner,
        files: SharedFileManager,
        shutdown: &ShutdownGroup,
    ) -> Result<Self> {
        let providers = Providers::start(store.kv().clone(), config.stats_cache_ttl, shutdown).await?;
        let checker = Checker::start(
            config.clone(),
            store.clone(),
            assigner.clone(),
            providers.get(config.provider),
            files,
            shutdown,
        )
        .await?;
        let closer = Closer::start(config.clone(), store, assigner, shutdown).await?;
        info!(node = %config.node_id, provider = ?config.provider, "worker node: started");
        Ok(WorkerNode {
            providers,
            checker,
            closer,
        })
    }

    pub fn provider(&self, kind: ProviderKind) -> Arc<Provider> {
        self.providers.get(kind)
    }

    pub fn providers(&self) -> &Providers {
        &self.providers
    }

    pub fn checker(&self) -> &Checker {
        &self.checker
    }

    pub fn closer(&self) -> &Closer {
        &self.closer
    }
}
