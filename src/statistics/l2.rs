//! Short-lived memoization on top of another provider
//!
//! Entries are never expired one by one, the whole map is replaced by an
//! empty one every TTL interval.

use crate::error::Result;
use crate::model::{ObjectKey, StatsByType};
use crate::shutdown::ShutdownGroup;
use crate::statistics::Provider;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info};

struct Inner {
    wrapped: Arc<Provider>,
    cache: RwLock<HashMap<String, StatsByType>>,
    shutdown: ShutdownGroup,
}

#[derive(Clone)]
pub struct L2Cache {
    inner: Arc<Inner>,
}

impl L2Cache {
    /// Wrap the provider and start the clear ticker, `ttl` must be positive.
    pub fn start(wrapped: Arc<Provider>, ttl: Duration, shutdown: &ShutdownGroup) -> Self {
        let cache = L2Cache {
            inner: Arc::new(Inner {
                wrapped,
                cache: RwLock::new(HashMap::new()),
                shutdown: shutdown.child(),
            }),
        };

        let ticker_cache = cache.clone();
        let group = cache.inner.shutdown.clone();
        cache.inner.shutdown.spawn(async move {
            let mut ticker = interval_at(Instant::now() + ttl, ttl);
            loop {
                tokio::select! {
                    _ = group.cancelled() => {
                        info!("stats L2 cache: received shutdown request");
                        break;
                    }
                    _ = ticker.tick() => ticker_cache.clear_cache(),
                }
            }
            info!("stats L2 cache: shutdown done");
        });
        cache
    }

    pub async fn object_stats(&self, key: &ObjectKey) -> Result<StatsByType> {
        let cache_key = key.to_string();
        let cached = self.inner.cache.read().get(&cache_key).copied();
        if let Some(stats) = cached {
            return Ok(stats);
        }

        let stats = self.inner.wrapped.object_stats(key).await?;
        self.inner.cache.write().insert(cache_key, stats);
        Ok(stats)
    }

    pub fn clear_cache(&self) {
        let old = std::mem::take(&mut *self.inner.cache.write());
        if !old.is_empty() {
            debug!(entries = old.len(), "stats L2 cache: cleared");
        }
    }

    pub fn len(&self) -> usize {
        self.inner.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn close(&self) {
        self.inner.shutdown.shutdown().await;
    }
}
