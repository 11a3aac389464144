//! Get-all + watch consumer
//!
//! Loads the full snapshot of a prefix, then applies every committed change
//! in revision order. A closed stream is resumed from the last applied
//! revision; if that revision was compacted, the snapshot is reloaded and
//! delivered again with `restart = true`.

use crate::error::{Result, StoreError};
use crate::kv::store::{get_prefix, EventKind, KeyValue, Revision, SharedKv, WatchEvent, WatchStream};
use crate::shutdown::ShutdownGroup;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Delay before a failed watch is re-created
const RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub enum WatchUpdate {
    /// Full state of the prefix, replaces everything applied before
    Snapshot {
        revision: Revision,
        kvs: Vec<KeyValue>,
        restart: bool,
    },
    /// Events of one committed transaction
    Events {
        revision: Revision,
        events: Vec<WatchEvent>,
    },
}

impl WatchUpdate {
    pub fn revision(&self) -> Revision {
        match self {
            WatchUpdate::Snapshot { revision, .. } | WatchUpdate::Events { revision, .. } => {
                *revision
            }
        }
    }

    /// Revision moved, nothing changed under the prefix.
    pub fn is_progress(&self) -> bool {
        matches!(self, WatchUpdate::Events { events, .. } if events.is_empty())
    }

    /// Apply to a map of decoded values keyed by store key. Values that
    /// cannot be decoded are skipped.
    pub fn apply_to<T: DeserializeOwned>(self, map: &mut BTreeMap<String, T>, name: &str) {
        match self {
            WatchUpdate::Snapshot { kvs, restart, revision } => {
                map.clear();
                for kv in &kvs {
                    match kv.decode() {
                        Ok(value) => {
                            map.insert(kv.key.clone(), value);
                        }
                        Err(err) => warn!(error = %err, "{}: skipping invalid value", name),
                    }
                }
                if restart {
                    info!(revision, "{}: reloaded", name);
                }
            }
            WatchUpdate::Events { events, .. } => {
                for event in events {
                    match event.kind {
                        EventKind::Delete => {
                            map.remove(&event.kv.key);
                        }
                        EventKind::Create | EventKind::Update => match event.kv.decode() {
                            Ok(value) => {
                                map.insert(event.kv.key, value);
                            }
                            Err(err) => warn!(error = %err, "{}: skipping invalid value", name),
                        },
                    }
                }
            }
        }
    }
}

pub struct WatchConsumer {
    kv: SharedKv,
    prefix: String,
    name: &'static str,
}

impl WatchConsumer {
    pub fn new(kv: SharedKv, prefix: impl Into<String>, name: &'static str) -> Self {
        WatchConsumer {
            kv,
            prefix: prefix.into(),
            name,
        }
    }

    /// Apply the initial snapshot, then spawn the watch loop.
    ///
    /// Returns after the snapshot is applied; a failure to load it is returned
    /// to the caller. `apply` is called sequentially, never concurrently.
    pub async fn start<F, Fut>(self, shutdown: &ShutdownGroup, mut apply: F) -> Result<()>
    where
        F: FnMut(WatchUpdate) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (kvs, revision) = get_prefix(self.kv.as_ref(), &self.prefix).await?;
        let stream = self.kv.watch(&self.prefix, revision + 1).await?;
        apply(WatchUpdate::Snapshot {
            revision,
            kvs,
            restart: false,
        })
        .await;
        info!(prefix = %self.prefix, revision, "{}: initialized", self.name);

        let group = shutdown.clone();
        shutdown.spawn(async move {
            self.run(&group, stream, revision, apply).await;
            info!("{}: shutdown done", self.name);
        });
        Ok(())
    }

    async fn run<F, Fut>(
        &self,
        shutdown: &ShutdownGroup,
        mut stream: WatchStream,
        mut last_revision: Revision,
        mut apply: F,
    ) where
        F: FnMut(WatchUpdate) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        loop {
            let resp = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("{}: received shutdown request", self.name);
                    return;
                }
                resp = stream.recv() => resp,
            };

            if let Some(resp) = resp {
                last_revision = resp.revision;
                apply(WatchUpdate::Events {
                    revision: resp.revision,
                    events: resp.events,
                })
                .await;
                continue;
            }

            debug!(revision = last_revision, "{}: watch stream closed, resuming", self.name);
            match self.resume(shutdown, last_revision).await {
                Some((new_stream, reload)) => {
                    if let Some((kvs, revision)) = reload {
                        last_revision = revision;
                        apply(WatchUpdate::Snapshot {
                            revision,
                            kvs,
                            restart: true,
                        })
                        .await;
                    }
                    stream = new_stream;
                }
                None => return,
            }
        }
    }

    /// Re-create the watch, reloading the snapshot when the revision was compacted.
    /// Returns `None` on shutdown.
    async fn resume(
        &self,
        shutdown: &ShutdownGroup,
        last_revision: Revision,
    ) -> Option<(WatchStream, Option<(Vec<KeyValue>, Revision)>)> {
        loop {
            let result = match self.kv.watch(&self.prefix, last_revision + 1).await {
                Ok(stream) => Ok((stream, None)),
                Err(StoreError::Compacted { .. }) => {
                    warn!(revision = last_revision, "{}: watch compacted, reloading", self.name);
                    self.reload().await.map(|(stream, kvs, revision)| (stream, Some((kvs, revision))))
                }
                Err(err) => Err(err),
            };

            match result {
                Ok(resumed) => return Some(resumed),
                Err(err) => {
                    warn!(error = %err, "{}: cannot resume watch", self.name);
                    tokio::select! {
                        _ = shutdown.cancelled() => return None,
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                    }
                }
            }
        }
    }

    async fn reload(&self) -> std::result::Result<(WatchStream, Vec<KeyValue>, Revision), StoreError> {
        let (kvs, revision) = get_prefix(self.kv.as_ref(), &self.prefix).await?;
        let stream = self.kv.watch(&self.prefix, revision + 1).await?;
        Ok((stream, kvs, revision))
    }
}
