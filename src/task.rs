//! Exclusive background tasks
//!
//! A task runs only if its lock, `<task type>/<object id>` within the export,
//! is free. The task record is written together with the lock and updated
//! with the result when the task finishes; the lock is released at the same
//! time. A failed release is retried with backoff until it succeeds or the
//! node shuts down.

use crate::error::Result;
use crate::model::{ExportKey, Task, TaskKey};
use crate::shutdown::ShutdownGroup;
use crate::store::Store;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Opened file → closing, a new file is opened
pub const TASK_FILE_CLOSING: &str = "file.closing";
/// Writing slice → closing, a new slice is opened
pub const TASK_SLICE_CLOSING: &str = "slice.closing";
/// Closing file → importing
pub const TASK_FILE_CLOSE: &str = "file.close";
/// Closing slice → uploading
pub const TASK_SLICE_CLOSE: &str = "slice.close";

const RELEASE_BACKOFF_MIN: Duration = Duration::from_millis(50);
const RELEASE_BACKOFF_MAX: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct TaskNode {
    store: Store,
    node_id: String,
    shutdown: ShutdownGroup,
}

impl TaskNode {
    pub fn new(store: Store, node_id: impl Into<String>, shutdown: &ShutdownGroup) -> Self {
        TaskNode {
            store,
            node_id: node_id.into(),
            shutdown: shutdown.clone(),
        }
    }

    /// Start the task in the background.
    ///
    /// Returns `None` if the lock is held by another task. The work returns a
    /// short result message or an error.
    pub async fn start_task<F, Fut>(
        &self,
        export: &ExportKey,
        task_type: &str,
        object_id: &str,
        work: F,
    ) -> Result<Option<JoinHandle<()>>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        let clock = self.store.clock().clone();
        let key = TaskKey::new(export.clone(), task_type, clock.now());
        let mut task = Task::new(key, self.node_id.clone(), format!("{}/{}", task_type, object_id));

        debug!(task = %task.key, lock = %task.lock, "new task, acquiring lock");
        if !self.store.create_task(&task).await? {
            info!(task = %task.key, lock = %task.lock, "task ignored, the lock is in use");
            return Ok(None);
        }

        let store = self.store.clone();
        let shutdown = self.shutdown.clone();
        let handle = self.shutdown.spawn(async move {
            let outcome = work().await.map_err(|err| err.to_string());
            task.finish(clock.now(), &outcome);
            let duration = task.duration_ms.unwrap_or_default();
            match &outcome {
                Ok(result) => info!(task = %task.key, duration_ms = duration, "task succeeded: {}", result),
                Err(err) => warn!(task = %task.key, duration_ms = duration, "task failed: {}", err),
            }
            release(&store, &shutdown, &task).await;
        });
        Ok(Some(handle))
    }
}

/// Store the finished task and release its lock, retry until shutdown.
async fn release(store: &Store, shutdown: &ShutdownGroup, task: &Task) {
    let mut backoff = RELEASE_BACKOFF_MIN;
    loop {
        match store.finish_task(task).await {
            Ok(()) => {
                debug!(task = %task.key, lock = %task.lock, "lock released");
                return;
            }
            Err(err) => {
                warn!(task = %task.key, error = %err, retry_in_ms = backoff.as_millis() as u64, "cannot finish task");
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => {
                error!(task = %task.key, lock = %task.lock, "lock not released, received shutdown request");
                return;
            }
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(RELEASE_BACKOFF_MAX);
    }
}
