//! Staging file allocation
//!
//! A new opened file needs a remote upload target. Allocation registers an
//! undo action in a [`Rollback`], so a failed close does not leak targets.

use crate::clock::SharedClock;
use crate::error::{Error, Result};
use crate::model::{Export, File, FileKey, Slice, SliceKey, StorageResource, UploadCredentials};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub type FileFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

type UndoFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type UndoAction = Box<dyn FnOnce() -> UndoFuture + Send>;

/// Undo actions, invoked in reverse order of registration.
#[derive(Default)]
pub struct Rollback {
    actions: Vec<(String, UndoAction)>,
}

impl Rollback {
    pub fn new() -> Self {
        Rollback::default()
    }

    pub fn add<F, Fut>(&mut self, name: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let action: UndoAction = Box::new(move || Box::pin(action()) as UndoFuture);
        self.actions.push((name.into(), action));
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run all actions, failures are logged and do not stop the others.
    pub async fn invoke(self) {
        for (name, action) in self.actions.into_iter().rev() {
            match action().await {
                Ok(()) => debug!(action = %name, "rollback: done"),
                Err(err) => warn!(action = %name, error = %err, "rollback: failed"),
            }
        }
    }

    pub async fn invoke_if_err<T>(self, result: &Result<T>) {
        if result.is_err() {
            self.invoke().await;
        }
    }
}

/// Remote file manager.
pub trait FileManager: Send + Sync + 'static {
    /// Allocate an upload target and replace the opened file and slice of the
    /// export with new ones pointing to it.
    fn create_file_for_export<'a>(
        &'a self,
        rb: &'a mut Rollback,
        export: &'a mut Export,
    ) -> FileFuture<'a, ()>;
}

pub type SharedFileManager = Arc<dyn FileManager>;

#[derive(Default)]
struct Resources {
    next_id: AtomicU64,
    files: Mutex<BTreeMap<u64, StorageResource>>,
}

/// In-process file manager issuing S3-like credentials with a fixed lifetime.
pub struct InMemoryFileManager {
    clock: SharedClock,
    credentials_ttl: Duration,
    resources: Arc<Resources>,
    failing: AtomicBool,
}

impl InMemoryFileManager {
    pub fn new(clock: SharedClock, credentials_ttl: Duration) -> Self {
        InMemoryFileManager {
            clock,
            credentials_ttl,
            resources: Arc::new(Resources::default()),
            failing: AtomicBool::new(false),
        }
    }

    /// Make the next allocations fail, for tests.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// IDs of allocated and not rolled back resources.
    pub fn resource_ids(&self) -> Vec<u64> {
        self.resources.files.lock().keys().copied().collect()
    }

    /// Allocate a resource outside of an export, e.g. for the first file.
    pub fn create_resource(&self, name: &str) -> Result<StorageResource> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::FileManager(format!(
                "cannot create resource \"{}\": service unavailable",
                name
            )));
        }
        let id = self.resources.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let resource = StorageResource {
            id,
            name: name.to_string(),
            credentials: UploadCredentials::S3 {
                expiration: self.clock.now() + self.credentials_ttl,
            },
        };
        self.resources.files.lock().insert(id, resource.clone());
        info!(id, name, "file manager: created resource");
        Ok(resource)
    }
}

impl FileManager for InMemoryFileManager {
    fn create_file_for_export<'a>(
        &'a self,
        rb: &'a mut Rollback,
        export: &'a mut Export,
    ) -> FileFuture<'a, ()> {
        Box::pin(async move {
            let now = self.clock.now();
            let name = format!("{}_{}", export.key().export_id, now.as_millis());
            let resource = self.create_resource(&name)?;

            let resources = self.resources.clone();
            let id = resource.id;
            rb.add(format!("delete resource {}", id), move || async move {
                resources.files.lock().remove(&id);
                Ok(())
            });

            let mapping = export.base.mapping.clone();
            let file = File::new(
                FileKey::new(export.key().clone(), now),
                mapping.clone(),
                resource.clone(),
            );
            let slice = Slice::new(SliceKey::new(file.key.clone(), now), mapping, resource, 1);
            export.opened_file = file;
            export.opened_slice = slice;
            Ok(())
        })
    }
}
