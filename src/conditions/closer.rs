//! Closing slices and files
//!
//! Mirrors closing slices and closing files through watches. A closing slice
//! of an owned receiver is moved to uploading. A closing file is moved to
//! importing once all its slices are uploaded. Each move runs as an exclusive
//! task. A sweep runs after every change of the mirrors and on a periodic
//! resync, which also retries failed moves.

use crate::config::WorkerConfig;
use crate::distribution::SharedAssigner;
use crate::error::Result;
use crate::kv::WatchConsumer;
use crate::model::{File, FileState, Slice, SliceState};
use crate::schema::Schema;
use crate::shutdown::ShutdownGroup;
use crate::store::Store;
use crate::task::{TaskNode, TASK_FILE_CLOSE, TASK_SLICE_CLOSE};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info};

/// Watched state, keyed by store key, oldest first
#[derive(Default)]
struct Mirror {
    slices: BTreeMap<String, Slice>,
    files: BTreeMap<String, File>,
}

struct Inner {
    config: WorkerConfig,
    store: Store,
    assigner: SharedAssigner,
    tasks: TaskNode,
    mirror: RwLock<Mirror>,
    changed: Notify,
    shutdown: ShutdownGroup,
}

#[derive(Clone)]
pub struct Closer {
    inner: Arc<Inner>,
}

impl Closer {
    /// Load the mirrors and start the sweep loop.
    pub async fn start(
        config: WorkerConfig,
        store: Store,
        assigner: SharedAssigner,
        shutdown: &ShutdownGroup,
    ) -> Result<Self> {
        let group = shutdown.child();
        let inner = Arc::new(Inner {
            tasks: TaskNode::new(store.clone(), config.node_id.clone(), &group),
            config,
            store,
            assigner,
            mirror: RwLock::new(Mirror::default()),
            changed: Notify::new(),
            shutdown: group,
        });

        if let Err(err) = inner.start_watches().await {
            inner.shutdown.shutdown().await;
            return Err(err);
        }

        let closer = Closer { inner };
        let period = closer.inner.config.close_resync_interval;
        let loop_closer = closer.clone();
        let group = closer.inner.shutdown.clone();
        closer.inner.shutdown.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = group.cancelled() => {
                        info!("closer: received shutdown request");
                        break;
                    }
                    _ = loop_closer.inner.changed.notified() => {}
                    _ = ticker.tick() => {}
                }
                loop_closer.sweep().await;
            }
            info!("closer: shutdown done");
        });

        info!(
            node = %closer.inner.config.node_id,
            slices = closer.inner.config.close_slices,
            files = closer.inner.config.close_files,
            "closer: initialized"
        );
        Ok(closer)
    }

    /// Start close tasks for the mirrored slices and files of owned receivers.
    pub async fn sweep(&self) -> Vec<JoinHandle<()>> {
        let inner = &self.inner;
        let mirror = inner.mirror.read().await;
        let mut tasks = Vec::new();

        // Slices of an export close in order, only the oldest one is started
        let mut exports = BTreeSet::new();
        for slice in mirror.slices.values() {
            if !inner.assigner.is_owner(slice.key.receiver_key()) {
                continue;
            }
            if !exports.insert(Schema::export(slice.key.export_key())) {
                continue;
            }
            match inner.close_slice(slice).await {
                Ok(Some(task)) => tasks.push(task),
                Ok(None) => {}
                Err(err) => error!(slice = %slice.key, error = %err, "cannot start slice close"),
            }
        }

        for file in mirror.files.values() {
            if !inner.assigner.is_owner(file.key.receiver_key()) {
                continue;
            }
            match inner.close_file(file).await {
                Ok(Some(task)) => tasks.push(task),
                Ok(None) => {}
                Err(err) => error!(file = %file.key, error = %err, "cannot start file close"),
            }
        }

        debug!(tasks = tasks.len(), "closer: sweep done");
        tasks
    }

    pub async fn close(&self) {
        self.inner.shutdown.shutdown().await;
    }
}

impl Inner {
    async fn start_watches(self: &Arc<Self>) -> Result<()> {
        if self.config.close_slices {
            let target = self.clone();
            WatchConsumer::new(
                self.store.kv().clone(),
                Schema::slices_in_state(SliceState::Closing),
                "closing slices mirror",
            )
            .start(&self.shutdown, move |update| {
                let target = target.clone();
                async move {
                    if update.is_progress() {
                        return;
                    }
                    let mut mirror = target.mirror.write().await;
                    update.apply_to(&mut mirror.slices, "closing slices mirror");
                    drop(mirror);
                    target.changed.notify_one();
                }
            })
            .await?;
        }

        if self.config.close_files {
            let target = self.clone();
            WatchConsumer::new(
                self.store.kv().clone(),
                Schema::files_in_state(FileState::Closing),
                "closing files mirror",
            )
            .start(&self.shutdown, move |update| {
                let target = target.clone();
                async move {
                    if update.is_progress() {
                        return;
                    }
                    let mut mirror = target.mirror.write().await;
                    update.apply_to(&mut mirror.files, "closing files mirror");
                    drop(mirror);
                    target.changed.notify_one();
                }
            })
            .await?;
        }
        Ok(())
    }

    async fn close_slice(&self, slice: &Slice) -> Result<Option<JoinHandle<()>>> {
        let export_key = slice.key.export_key().clone();
        let object_id = format!("{}/{}", slice.key.file_key().file_id, slice.key.slice_id);
        let store = self.store.clone();
        let slice = slice.clone();
        self.tasks
            .start_task(&export_key, TASK_SLICE_CLOSE, &object_id, move || async move {
                store
                    .close_slice(&slice)
                    .await
                    .map(|_| "slice closed".to_string())
                    .map_err(|err| err.context(format!("cannot close slice \"{}\"", slice.key)))
            })
            .await
    }

    async fn close_file(&self, file: &File) -> Result<Option<JoinHandle<()>>> {
        let pending = self.store.pending_slices_in_file(&file.key).await?;
        if pending > 0 {
            debug!(file = %file.key, pending, "file waits for slices upload");
            return Ok(None);
        }

        let export_key = file.key.export_key().clone();
        let object_id = file.key.file_id.to_string();
        let store = self.store.clone();
        let file = file.clone();
        self.tasks
            .start_task(&export_key, TASK_FILE_CLOSE, &object_id, move || async move {
                store
                    .close_file(&file)
                    .await
                    .map(|_| "file closed".to_string())
                    .map_err(|err| err.context(format!("cannot close file \"{}\"", file.key)))
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::super::close;
    use super::*;
    use crate::clock::Clock;
    use crate::distribution::{HashRingAssigner, SingleNodeAssigner};
    use crate::files::InMemoryFileManager;
    use crate::model::{RecordKey, UploadStats};
    use crate::store::testing::{create_export, export_key, fixture, Fixture};
    use std::time::Duration;

    async fn start_closer(f: &Fixture, assigner: SharedAssigner) -> (Closer, ShutdownGroup) {
        let shutdown = ShutdownGroup::new();
        let closer = Closer::start(WorkerConfig::test(), f.store.clone(), assigner, &shutdown)
            .await
            .unwrap();
        (closer, shutdown)
    }

    async fn wait_for_slice(f: &Fixture, state: SliceState, slice: &Slice) -> Slice {
        for _ in 0..300 {
            if let Ok(found) = f.store.get_slice(state, &slice.key).await {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("slice \"{}\" did not reach the state \"{}\"", slice.key, state);
    }

    async fn write_record(f: &Fixture, slice: &Slice) {
        let key = RecordKey::new(slice.key.clone(), f.clock.now());
        f.store.create_record(&key, "row").await.unwrap();
        f.clock.advance(Duration::from_millis(1));
    }

    /// Swap the opened slice of the export, returns the closing slice.
    async fn swap(f: &Fixture) -> Slice {
        let export = f.store.get_export(&export_key()).await.unwrap();
        f.clock.advance(Duration::from_secs(1));
        let (closing, _) = f.store.swap_slice(&export.opened_slice).await.unwrap();
        closing
    }

    #[tokio::test]
    async fn test_closing_slices_uploaded_in_order() {
        let f = fixture();
        let (_, first) = create_export(&f).await;
        write_record(&f, &first).await;
        let first = swap(&f).await;
        let export = f.store.get_export(&export_key()).await.unwrap();
        write_record(&f, &export.opened_slice).await;
        write_record(&f, &export.opened_slice).await;
        let second = swap(&f).await;

        let (_closer, shutdown) = start_closer(&f, Arc::new(SingleNodeAssigner)).await;

        let first = wait_for_slice(&f, SliceState::Uploading, &first).await;
        let second = wait_for_slice(&f, SliceState::Uploading, &second).await;
        let range = |s: &Slice| s.id_range.map(|r| (r.start, r.count));
        assert_eq!(range(&first), Some((1, 1)));
        assert_eq!(range(&second), Some((2, 2)));

        let tasks = f.store.list_tasks(&export_key()).await.unwrap();
        let closed = tasks
            .iter()
            .filter(|t| t.key.task_type == TASK_SLICE_CLOSE && t.result.as_deref() == Some("slice closed"))
            .count();
        assert_eq!(closed, 2);

        shutdown.shutdown().await;
    }

    #[tokio::test]
    async fn test_file_closed_after_slices_uploaded() {
        let f = fixture();
        let (file, slice) = create_export(&f).await;
        let files = InMemoryFileManager::new(f.clock.shared(), Duration::from_secs(24 * 3600));
        f.clock.advance(Duration::from_secs(1));
        close::close_file(&f.store, &files, &file.key).await.unwrap();

        let (_closer, shutdown) = start_closer(&f, Arc::new(SingleNodeAssigner)).await;

        // The file waits for the upload of its slice
        let uploading = wait_for_slice(&f, SliceState::Uploading, &slice).await;
        f.store.get_file(FileState::Closing, &file.key).await.unwrap();

        f.store
            .mark_slice_uploaded(
                &uploading,
                UploadStats {
                    file_size: 10,
                    file_gzip_size: 5,
                },
            )
            .await
            .unwrap();

        // Picked up by the periodic resync
        let mut importing = None;
        for _ in 0..300 {
            if let Ok(found) = f.store.get_file(FileState::Importing, &file.key).await {
                importing = Some(found);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(importing.is_some());

        let tasks = f.store.list_tasks(&export_key()).await.unwrap();
        assert!(tasks
            .iter()
            .any(|t| t.key.task_type == TASK_FILE_CLOSE && t.result.as_deref() == Some("file closed")));

        shutdown.shutdown().await;
    }

    #[tokio::test]
    async fn test_foreign_receivers_skipped() {
        let f = fixture();
        create_export(&f).await;
        let closing = swap(&f).await;
        let assigner = Arc::new(HashRingAssigner::new("w1", &["w2".to_string()]));
        let (closer, shutdown) = start_closer(&f, assigner.clone()).await;

        assert!(closer.sweep().await.is_empty());
        f.store.get_slice(SliceState::Closing, &closing.key).await.unwrap();

        assigner.set_nodes(&["w1".to_string()]);
        wait_for_slice(&f, SliceState::Uploading, &closing).await;

        shutdown.shutdown().await;
    }

    #[tokio::test]
    async fn test_disabled_closing() {
        let f = fixture();
        create_export(&f).await;
        let closing = swap(&f).await;

        let mut config = WorkerConfig::test();
        config.close_slices = false;
        config.close_files = false;
        let shutdown = ShutdownGroup::new();
        let closer = Closer::start(config, f.store.clone(), Arc::new(SingleNodeAssigner), &shutdown)
            .await
            .unwrap();

        assert!(closer.sweep().await.is_empty());
        f.store.get_slice(SliceState::Closing, &closing.key).await.unwrap();

        shutdown.shutdown().await;
    }
}
