//! Conditions checker
//!
//! Mirrors exports and writing slices through watches. Every sweep walks the
//! writing slices of owned receivers and fires at most one of, in order:
//!
//! 1. upload credentials expire soon → close the file
//! 2. import conditions of the export are met by the file → close the file
//! 3. upload conditions are met by the slice → close the slice

use super::close;
use crate::clock::UtcTime;
use crate::config::WorkerConfig;
use crate::distribution::SharedAssigner;
use crate::error::Result;
use crate::files::SharedFileManager;
use crate::kv::WatchConsumer;
use crate::model::{ExportBase, Slice, SliceKey, SliceState};
use crate::schema::{Schema, CONFIG_EXPORT};
use crate::shutdown::ShutdownGroup;
use crate::statistics::Provider;
use crate::store::Store;
use crate::task::{TaskNode, TASK_FILE_CLOSING, TASK_SLICE_CLOSING};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info};

/// Watched state, keyed by store key
#[derive(Default)]
struct Mirror {
    exports: BTreeMap<String, ExportBase>,
    slices: BTreeMap<String, Slice>,
}

/// Outcome of one sweep.
#[derive(Debug, Default)]
pub struct CheckReport {
    /// Owned writing slices
    pub checked: usize,
    /// Started close tasks
    pub tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    config: WorkerConfig,
    store: Store,
    assigner: SharedAssigner,
    provider: Arc<Provider>,
    files: SharedFileManager,
    tasks: TaskNode,
    // A sweep holds the read lock, watch updates wait for it
    mirror: RwLock<Mirror>,
    shutdown: ShutdownGroup,
}

#[derive(Clone)]
pub struct Checker {
    inner: Arc<Inner>,
}

impl Checker {
    /// Load the mirrors and start the periodic sweep.
    pub async fn start(
        config: WorkerConfig,
        store: Store,
        assigner: SharedAssigner,
        provider: Arc<Provider>,
        files: SharedFileManager,
        shutdown: &ShutdownGroup,
    ) -> Result<Self> {
        let group = shutdown.child();
        let inner = Arc::new(Inner {
            tasks: TaskNode::new(store.clone(), config.node_id.clone(), &group),
            config,
            store,
            assigner,
            provider,
            files,
            mirror: RwLock::new(Mirror::default()),
            shutdown: group,
        });

        if let Err(err) = inner.start_watches().await {
            inner.shutdown.shutdown().await;
            return Err(err);
        }

        let checker = Checker { inner };
        let period = checker.inner.config.check_conditions_interval;
        let ticker_checker = checker.clone();
        let group = checker.inner.shutdown.clone();
        checker.inner.shutdown.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = group.cancelled() => {
                        info!("conditions checker: received shutdown request");
                        break;
                    }
                    _ = ticker.tick() => {
                        ticker_checker.check().await;
                    }
                }
            }
            info!("conditions checker: shutdown done");
        });

        info!(node = %checker.inner.config.node_id, "conditions checker: initialized");
        Ok(checker)
    }

    /// Run one sweep over the owned writing slices.
    pub async fn check(&self) -> CheckReport {
        let inner = &self.inner;
        let mirror = inner.mirror.read().await;
        let now = inner.store.clock().now();

        let mut report = CheckReport::default();
        for slice in mirror.slices.values() {
            if !inner.assigner.is_owner(slice.key.receiver_key()) {
                continue;
            }
            report.checked += 1;
            match inner.check_slice(&mirror, slice, now).await {
                Ok(Some(task)) => report.tasks.push(task),
                Ok(None) => {}
                Err(err) => error!(slice = %slice.key, error = %err, "cannot check slice"),
            }
        }

        debug!("checked \"{}\" opened slices", report.checked);
        report
    }

    /// Keys of the mirrored writing slices.
    pub async fn opened_slices(&self) -> Vec<SliceKey> {
        let mirror = self.inner.mirror.read().await;
        mirror.slices.values().map(|s| s.key.clone()).collect()
    }

    pub async fn close(&self) {
        self.inner.shutdown.shutdown().await;
    }
}

impl Inner {
    async fn start_watches(self: &Arc<Self>) -> Result<()> {
        let target = self.clone();
        WatchConsumer::new(self.store.kv().clone(), CONFIG_EXPORT, "exports mirror")
            .start(&self.shutdown, move |update| {
                let target = target.clone();
                async move {
                    if update.is_progress() {
                        return;
                    }
                    let mut mirror = target.mirror.write().await;
                    update.apply_to(&mut mirror.exports, "exports mirror");
                }
            })
            .await?;

        let target = self.clone();
        WatchConsumer::new(
            self.store.kv().clone(),
            Schema::slices_in_state(SliceState::Writing),
            "slices mirror",
        )
        .start(&self.shutdown, move |update| {
            let target = target.clone();
            async move {
                if update.is_progress() {
                    return;
                }
                let mut mirror = target.mirror.write().await;
                update.apply_to(&mut mirror.slices, "slices mirror");
            }
        })
        .await
    }

    async fn check_slice(
        &self,
        mirror: &Mirror,
        slice: &Slice,
        now: UtcTime,
    ) -> Result<Option<JoinHandle<()>>> {
        let expiration = slice.credentials_expiration();
        if now + self.config.min_credentials_expiration >= expiration {
            let reason = format!("upload credentials will expire soon, at {}", expiration);
            return self.close_file(slice, &reason).await;
        }

        match mirror.exports.get(&Schema::export(slice.key.export_key())) {
            Some(export) => {
                let file_key = slice.key.file_key();
                let stats = self.provider.file_stats(file_key).await?.aggregated_total;
                let (met, reason) = export
                    .import_conditions
                    .evaluate(now, file_key.opened_at(), &stats);
                if met {
                    return self.close_file(slice, &reason).await;
                }
            }
            None => debug!(slice = %slice.key, "export not mirrored yet, skipping import conditions"),
        }

        let stats = self.provider.slice_stats(&slice.key).await?.aggregated_total;
        let (met, reason) = self
            .config
            .upload_conditions
            .evaluate(now, slice.opened_at(), &stats);
        if met {
            return self.close_slice(slice, &reason).await;
        }
        Ok(None)
    }

    async fn close_file(&self, slice: &Slice, reason: &str) -> Result<Option<JoinHandle<()>>> {
        let file_key = slice.key.file_key().clone();
        info!(file = %file_key, "closing file \"{}\": {}", file_key, reason);

        let export_key = file_key.export_key().clone();
        let object_id = file_key.file_id.to_string();
        let store = self.store.clone();
        let files = self.files.clone();
        self.tasks
            .start_task(&export_key, TASK_FILE_CLOSING, &object_id, move || async move {
                close::close_file(&store, files.as_ref(), &file_key).await
            })
            .await
    }

    async fn close_slice(&self, slice: &Slice, reason: &str) -> Result<Option<JoinHandle<()>>> {
        let slice_key = slice.key.clone();
        info!(slice = %slice_key, "closing slice \"{}\": {}", slice_key, reason);

        let export_key = slice_key.export_key().clone();
        let object_id = format!("{}/{}", slice_key.file_key().file_id, slice_key.slice_id);
        let store = self.store.clone();
        self.tasks
            .start_task(&export_key, TASK_SLICE_CLOSING, &object_id, move || async move {
                close::close_slice(&store, &slice_key).await
            })
            .await
    }
}
